use std::{
    fmt,
    future::Future,
    io::Cursor,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{self, Context, Poll},
    time::Duration,
};

use hyper::{
    body::{self, Body, Frame, SizeHint},
    client::conn::{http1, http2},
    Method, Request, Uri,
};

use crate::{internal_metrics::InternalMetrics, Error};

/**
The largest response body that will be buffered.

Anything beyond this is read and discarded so the connection can be reused.
*/
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

async fn connect(
    metrics: &InternalMetrics,
    version: HttpVersion,
    uri: &HttpUri,
) -> Result<HttpSender, Error> {
    let io = tokio::net::TcpStream::connect((uri.host(), uri.port()))
        .await
        .map_err(|e| {
            metrics.transport_conn_failed.increment();

            Error::new("failed to connect TCP stream", e)
        })?;

    metrics.transport_conn_established.increment();

    if uri.is_https() {
        #[cfg(feature = "tls")]
        {
            let io = tls_handshake(metrics, io, uri).await?;

            http_handshake(metrics, version, io).await
        }
        #[cfg(not(feature = "tls"))]
        {
            let _ = version;

            Err(Error::msg("https support requires the `tls` Cargo feature"))
        }
    } else {
        http_handshake(metrics, version, io).await
    }
}

#[cfg(feature = "tls")]
async fn tls_handshake(
    metrics: &InternalMetrics,
    io: tokio::net::TcpStream,
    uri: &HttpUri,
) -> Result<tokio_rustls::client::TlsStream<tokio::net::TcpStream>, Error> {
    use tokio_rustls::{rustls, TlsConnector};

    let domain = uri.host().to_owned().try_into().map_err(|e| {
        metrics.transport_conn_tls_failed.increment();

        Error::new(format_args!("could not extract a DNS name from {uri}"), e)
    })?;

    let tls = {
        let mut root_store = rustls::RootCertStore::empty();

        for cert in rustls_native_certs::load_native_certs().map_err(|e| {
            metrics.transport_conn_tls_failed.increment();

            Error::new("failed to load native certificates", e)
        })? {
            let _ = root_store.add(cert);
        }

        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        )
    };

    let io = TlsConnector::from(tls)
        .connect(domain, io)
        .await
        .map_err(|e| {
            metrics.transport_conn_tls_failed.increment();

            Error::new("failed to connect TLS stream", e)
        })?;

    metrics.transport_conn_tls_handshake.increment();

    Ok(io)
}

async fn http_handshake(
    metrics: &InternalMetrics,
    version: HttpVersion,
    io: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Sync + Unpin + 'static,
) -> Result<HttpSender, Error> {
    match version {
        HttpVersion::Http1 => http1_handshake(metrics, io).await,
        HttpVersion::Http2 => http2_handshake(metrics, io).await,
    }
}

async fn http1_handshake(
    metrics: &InternalMetrics,
    io: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Sync + Unpin + 'static,
) -> Result<HttpSender, Error> {
    let (sender, conn) = http1::handshake(HttpIo(io)).await.map_err(|e| {
        metrics.transport_conn_failed.increment();

        Error::new("failed to perform HTTP1 handshake", e)
    })?;

    tokio::task::spawn(async move {
        let _ = conn.await;
    });

    Ok(HttpSender::Http1(sender))
}

async fn http2_handshake(
    metrics: &InternalMetrics,
    io: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Sync + Unpin + 'static,
) -> Result<HttpSender, Error> {
    let (sender, conn) = http2::handshake(TokioAmbientExecutor, HttpIo(io))
        .await
        .map_err(|e| {
            metrics.transport_conn_failed.increment();

            Error::new("failed to perform HTTP2 handshake", e)
        })?;

    tokio::task::spawn(async move {
        let _ = conn.await;
    });

    Ok(HttpSender::Http2(sender))
}

async fn send_request(
    metrics: &InternalMetrics,
    sender: &mut HttpSender,
    uri: &HttpUri,
    headers: impl Iterator<Item = (&str, &str)>,
    content: HttpContent,
) -> Result<IncomingResponse, Error> {
    let req = {
        // HTTP1 origin servers expect just the path; HTTP2 carries the scheme and authority
        let mut req = match sender {
            HttpSender::Http1(_) => Request::builder().uri(uri.origin_form()),
            HttpSender::Http2(_) => Request::builder().uri(&uri.uri),
        }
        .method(Method::POST);

        req = req
            .header("host", uri.authority())
            .header("content-length", content.content_len())
            .header("content-type", content.content_type_header);

        if let Some(content_encoding) = content.content_encoding_header {
            req = req.header("content-encoding", content_encoding);
        }

        for (k, v) in headers {
            req = req.header(k, v);
        }

        req.body(content).map_err(|e| {
            metrics.transport_request_failed.increment();

            Error::new("failed to build HTTP request", e)
        })?
    };

    sender.send_request(metrics, req).await
}

/**
A reusable connection to a single HTTP endpoint.

At most one idle sender is kept. Callers that find it taken open their own connection.
*/
pub(crate) struct HttpConnection {
    metrics: Arc<InternalMetrics>,
    version: HttpVersion,
    allow_compression: bool,
    request_timeout: Duration,
    uri: HttpUri,
    headers: Vec<(String, String)>,
    sender: Mutex<Option<HttpSender>>,
}

/**
A response with its body fully read.
*/
#[derive(Debug)]
pub(crate) struct HttpResponse {
    status: u16,
    body: Vec<u8>,
    reusable: bool,
}

impl HttpConnection {
    pub fn new(
        metrics: Arc<InternalMetrics>,
        url: impl AsRef<str>,
        version: HttpVersion,
        allow_compression: bool,
        request_timeout: Duration,
        headers: impl Into<Vec<(String, String)>>,
    ) -> Result<Self, Error> {
        Ok(HttpConnection {
            uri: HttpUri::parse(url.as_ref())?,
            version,
            allow_compression,
            request_timeout,
            headers: headers.into(),
            sender: Mutex::new(None),
            metrics,
        })
    }

    fn lock_sender(&self) -> MutexGuard<'_, Option<HttpSender>> {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn poison(&self) -> Option<HttpSender> {
        self.lock_sender().take().filter(|sender| !sender.is_closed())
    }

    fn unpoison(&self, sender: HttpSender) {
        *self.lock_sender() = Some(sender);
    }

    pub fn uri(&self) -> &HttpUri {
        &self.uri
    }

    pub fn metrics(&self) -> &Arc<InternalMetrics> {
        &self.metrics
    }

    /**
    POST a body to the endpoint and read its response.

    Errors from this method are all failures to complete the exchange, like refused connections or timeouts. Any status code is returned as a response.
    */
    pub async fn send(
        &self,
        body: Vec<u8>,
        content_type: &'static str,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse, Error> {
        match tokio::time::timeout(self.request_timeout, self.exchange(body, content_type, headers))
            .await
        {
            Ok(res) => res,
            Err(_) => {
                self.metrics.transport_request_timeout.increment();

                Err(Error::msg(format_args!(
                    "request to {} timed out after {:?}",
                    self.uri, self.request_timeout
                )))
            }
        }
    }

    async fn exchange(
        &self,
        body: Vec<u8>,
        content_type: &'static str,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse, Error> {
        let mut sender = match self.poison() {
            Some(sender) => sender,
            None => connect(&self.metrics, self.version, &self.uri).await?,
        };

        let content = {
            #[cfg(feature = "gzip")]
            {
                if self.allow_compression && !self.uri.is_https() {
                    self.metrics.transport_request_compress_gzip.increment();

                    HttpContent::gzip(body, content_type)?
                } else {
                    HttpContent::raw(body, content_type)
                }
            }
            #[cfg(not(feature = "gzip"))]
            {
                let _ = self.allow_compression;

                HttpContent::raw(body, content_type)
            }
        };

        let res = send_request(
            &self.metrics,
            &mut sender,
            &self.uri,
            self.headers
                .iter()
                .map(|(k, v)| (&**k, &**v))
                .chain(headers.iter().copied()),
            content,
        )
        .await?;

        // The body must be read before the sender can carry another request
        let res = res.read_to_end().await?;

        if res.reusable {
            self.unpoison(sender);
        }

        Ok(res)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HttpVersion {
    Http1,
    Http2,
}

enum HttpSender {
    Http1(http1::SendRequest<HttpContent>),
    Http2(http2::SendRequest<HttpContent>),
}

impl HttpSender {
    fn is_closed(&self) -> bool {
        match self {
            HttpSender::Http1(sender) => sender.is_closed(),
            HttpSender::Http2(sender) => sender.is_closed(),
        }
    }

    async fn send_request(
        &mut self,
        metrics: &InternalMetrics,
        req: Request<HttpContent>,
    ) -> Result<IncomingResponse, Error> {
        let res = match self {
            HttpSender::Http1(sender) => sender.send_request(req).await,
            HttpSender::Http2(sender) => sender.send_request(req).await,
        }
        .map_err(|e| {
            metrics.transport_request_failed.increment();

            Error::new("failed to send HTTP request", e)
        })?;

        metrics.transport_request_sent.increment();

        Ok(IncomingResponse { res })
    }
}

pub(crate) struct HttpUri {
    uri: Uri,
    https: bool,
    port: u16,
}

impl fmt::Display for HttpUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.uri, f)
    }
}

impl HttpUri {
    fn parse(url: &str) -> Result<Self, Error> {
        let uri: Uri = url
            .parse()
            .map_err(|e| Error::new(format_args!("failed to parse {url}"), e))?;

        let https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => {
                return Err(Error::msg(format_args!(
                    "{url} is not an `http` or `https` URL"
                )))
            }
        };

        if uri.host().is_none() {
            return Err(Error::msg(format_args!("{url} is missing a host")));
        }

        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        Ok(HttpUri { uri, https, port })
    }

    pub fn is_https(&self) -> bool {
        self.https
    }

    pub fn origin_form(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|path| path.as_str())
            .filter(|path| !path.is_empty())
            .unwrap_or("/")
    }

    pub fn host(&self) -> &str {
        self.uri.host().unwrap_or_default()
    }

    pub fn authority(&self) -> &str {
        self.uri
            .authority()
            .map(|authority| authority.as_str())
            .unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

pub(crate) struct HttpContent {
    payload: Option<Box<[u8]>>,
    content_len: usize,
    content_type_header: &'static str,
    content_encoding_header: Option<&'static str>,
}

impl HttpContent {
    fn raw(payload: Vec<u8>, content_type: &'static str) -> Self {
        HttpContent {
            content_len: payload.len(),
            payload: Some(payload.into_boxed_slice()),
            content_type_header: content_type,
            content_encoding_header: None,
        }
    }

    #[cfg(feature = "gzip")]
    fn gzip(payload: Vec<u8>, content_type: &'static str) -> Result<Self, Error> {
        use std::io::Write as _;

        let mut enc = flate2::write::GzEncoder::new(
            Vec::with_capacity(payload.len() / 4),
            flate2::Compression::fast(),
        );

        enc.write_all(&payload)
            .map_err(|e| Error::new("failed to compress a chunk of bytes", e))?;

        let buf = enc
            .finish()
            .map_err(|e| Error::new("failed to finalize compression", e))?;

        Ok(HttpContent {
            content_encoding_header: Some("gzip"),
            ..HttpContent::raw(buf, content_type)
        })
    }

    pub fn content_len(&self) -> usize {
        self.content_len
    }
}

impl Body for HttpContent {
    type Data = Cursor<Box<[u8]>>;

    type Error = std::convert::Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let Some(payload) = self.get_mut().payload.take() else {
            return Poll::Ready(None);
        };

        Poll::Ready(Some(Ok(Frame::data(Cursor::new(payload)))))
    }

    fn is_end_stream(&self) -> bool {
        self.payload.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.content_len as u64)
    }
}

struct IncomingResponse {
    res: hyper::Response<body::Incoming>,
}

impl IncomingResponse {
    async fn read_to_end(mut self) -> Result<HttpResponse, Error> {
        struct BufNext<'a>(&'a mut body::Incoming, &'a mut Vec<u8>);

        impl<'a> Future for BufNext<'a> {
            type Output = Result<bool, Error>;

            fn poll(self: Pin<&mut Self>, ctx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
                let BufNext(incoming, buf) = self.get_mut();

                match Pin::new(&mut **incoming).poll_frame(ctx) {
                    Poll::Ready(Some(Ok(frame))) => {
                        if let Some(frame) = frame.data_ref() {
                            let take = frame
                                .len()
                                .min(MAX_RESPONSE_BYTES.saturating_sub(buf.len()));

                            buf.extend_from_slice(&frame[..take]);
                        }

                        Poll::Ready(Ok(true))
                    }
                    Poll::Ready(None) => Poll::Ready(Ok(false)),
                    Poll::Ready(Some(Err(e))) => {
                        Poll::Ready(Err(Error::new("failed to read HTTP response body", e)))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }

        let status = self.res.status().as_u16();
        let reusable = !self
            .res
            .headers()
            .get(hyper::header::CONNECTION)
            .map(|conn| conn.as_bytes().eq_ignore_ascii_case(b"close"))
            .unwrap_or(false);

        let mut body = Vec::new();

        let incoming = self.res.body_mut();

        while BufNext(incoming, &mut body).await? {}

        Ok(HttpResponse {
            status,
            body,
            reusable,
        })
    }
}

impl HttpResponse {
    #[cfg(test)]
    pub fn from_parts(status: u16, body: Vec<u8>) -> Self {
        HttpResponse {
            status,
            body,
            reusable: true,
        }
    }

    pub fn http_status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

struct HttpIo<T>(T);

impl<T: tokio::io::AsyncRead> hyper::rt::Read for HttpIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        // SAFETY: `io` inherits the pinning requirements of `self`
        let io = unsafe { self.map_unchecked_mut(|io| &mut io.0) };

        // SAFETY: `io` does not uninitialize any bytes
        let mut read_buf = tokio::io::ReadBuf::uninit(unsafe { buf.as_mut() });

        match tokio::io::AsyncRead::poll_read(io, cx, &mut read_buf) {
            Poll::Ready(Ok(())) => {
                let read = read_buf.filled().len();

                // SAFETY: The bytes being advanced have been initialized by `read_buf`
                unsafe { buf.advance(read) };

                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: tokio::io::AsyncWrite> hyper::rt::Write for HttpIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        // SAFETY: `io` inherits the pinning requirements of `self`
        let io = unsafe { self.map_unchecked_mut(|io| &mut io.0) };

        tokio::io::AsyncWrite::poll_write(io, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        // SAFETY: `io` inherits the pinning requirements of `self`
        let io = unsafe { self.map_unchecked_mut(|io| &mut io.0) };

        tokio::io::AsyncWrite::poll_flush(io, cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        // SAFETY: `io` inherits the pinning requirements of `self`
        let io = unsafe { self.map_unchecked_mut(|io| &mut io.0) };

        tokio::io::AsyncWrite::poll_shutdown(io, cx)
    }
}

#[derive(Clone, Copy)]
struct TokioAmbientExecutor;

impl<F: Future + Send + 'static> hyper::rt::Executor<F> for TokioAmbientExecutor
where
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::spawn(fut);
    }
}
