/*!
The [`HttpTransport`] type.
*/

use std::{fmt, sync::Arc, time::Duration};

use evlog::{
    token::BoxFuture, Event, RejectedError, SendReport, Token, Transport, TransportError,
};
use serde::Deserialize;

use crate::{
    client::{HttpConnection, HttpResponse, HttpVersion},
    internal_metrics::{HttpMetrics, InternalMetrics},
    wire, Error,
};

/**
The default time allowed for a single request before it's considered failed.
*/
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/**
A builder for [`HttpTransport`].
*/
#[must_use = "call `.build()` to construct the transport"]
pub struct HttpTransportBuilder {
    url: String,
    version: HttpVersion,
    allow_compression: bool,
    request_timeout: Duration,
    headers: Vec<(String, String)>,
}

impl HttpTransportBuilder {
    /**
    Use HTTP/2 instead of HTTP/1.1.
    */
    pub fn http2(mut self) -> Self {
        self.version = HttpVersion::Http2;
        self
    }

    /**
    Whether to compress request bodies using gzip.

    Compression is only applied to plaintext connections. It's enabled by default when the `gzip` Cargo feature is.
    */
    pub fn allow_compression(mut self, allow: bool) -> Self {
        self.allow_compression = allow;
        self
    }

    /**
    The time allowed for a request before it's considered failed.

    Requests that time out are retried like any other network failure.
    */
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /**
    Add a header to every request.
    */
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /**
    Add headers to every request.
    */
    pub fn headers<K: Into<String>, V: Into<String>>(
        mut self,
        headers: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /**
    Build the transport.

    No connection is made until the first batch is sent.
    */
    pub fn build(self) -> Result<HttpTransport, Error> {
        if self.request_timeout.is_zero() {
            return Err(Error::msg("the request timeout must be non-zero"));
        }

        Ok(HttpTransport {
            conn: HttpConnection::new(
                Arc::new(InternalMetrics::default()),
                &self.url,
                self.version,
                self.allow_compression,
                self.request_timeout,
                self.headers,
            )?,
        })
    }
}

/**
A [`Transport`] that POSTs batches as JSON arrays to a remote event log.

Responses are interpreted as:

- `2xx`: the batch was accepted. The body may list individual events that were rejected as `{"rejected":[{"index":0,"reason":"..."}]}`.
- `401`: the token was refused.
- `408`, `429`, `5xx`: a transient failure.
- Any other status: a permanent failure.

Failures to connect, send, or read a response are all transient.
*/
pub struct HttpTransport {
    conn: HttpConnection,
}

impl HttpTransport {
    /**
    Start building a transport that sends batches to `url`.
    */
    pub fn builder(url: impl Into<String>) -> HttpTransportBuilder {
        HttpTransportBuilder {
            url: url.into(),
            version: HttpVersion::Http1,
            allow_compression: cfg!(feature = "gzip"),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            headers: Vec::new(),
        }
    }

    /**
    Get metrics for the connections and requests made by this transport.
    */
    pub fn metrics(&self) -> HttpMetrics {
        HttpMetrics {
            metrics: self.conn.metrics().clone(),
        }
    }

    async fn send_batch(&self, batch: &[Event], token: &Token) -> Result<SendReport, TransportError> {
        let body = wire::encode_batch(batch).map_err(TransportError::terminal)?;

        let authorization = format!("Bearer {}", token.value());

        let res = self
            .conn
            .send(body, "application/json", &[("authorization", &authorization)])
            .await
            .map_err(|err| {
                emit::debug!(
                    rt: emit::runtime::internal(),
                    "failed to send {batch_size} events to {uri}: {err}",
                    batch_size: batch.len(),
                    #[emit::as_display] uri: self.conn.uri().to_string(),
                    err,
                );

                TransportError::retryable(err)
            })?;

        interpret_response(self.conn.metrics(), res)
    }
}

impl Transport for HttpTransport {
    fn send<'a>(
        &'a self,
        batch: &'a [Event],
        token: &'a Token,
    ) -> BoxFuture<'a, Result<SendReport, TransportError>> {
        Box::pin(self.send_batch(batch, token))
    }
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("uri", &self.conn.uri().to_string())
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct IngestResponse {
    #[serde(default)]
    rejected: Vec<IngestRejected>,
}

#[derive(Deserialize)]
struct IngestRejected {
    index: usize,
    #[serde(default)]
    reason: String,
}

fn interpret_response(
    metrics: &InternalMetrics,
    res: HttpResponse,
) -> Result<SendReport, TransportError> {
    if !res.is_success() {
        metrics.transport_response_status_failed.increment();

        let err = StatusError::from_response(&res);

        return Err(match res.http_status() {
            401 => TransportError::unauthorized(err),
            408 | 429 | 500..=599 => TransportError::retryable(err),
            _ => TransportError::terminal(err),
        });
    }

    if res.body().iter().all(u8::is_ascii_whitespace) {
        return Ok(SendReport::accepted());
    }

    match serde_json::from_slice::<IngestResponse>(res.body()) {
        Ok(ingest) => Ok(SendReport::with_rejected(
            ingest
                .rejected
                .into_iter()
                .map(|rejected| RejectedError::new(rejected.index, rejected.reason)),
        )),
        // The batch was accepted, whatever the body says
        Err(err) => {
            metrics.transport_response_undecodable.increment();

            emit::debug!(
                rt: emit::runtime::internal(),
                "failed to decode a successful response: {err}",
                err,
            );

            Ok(SendReport::accepted())
        }
    }
}

/**
The remote service responded with a non-success status code.
*/
#[derive(Debug)]
struct StatusError {
    status: u16,
    body: String,
}

impl StatusError {
    const MAX_BODY_CHARS: usize = 256;

    fn from_response(res: &HttpResponse) -> Self {
        StatusError {
            status: res.http_status(),
            body: String::from_utf8_lossy(res.body())
                .chars()
                .take(Self::MAX_BODY_CHARS)
                .collect(),
        }
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "the remote service responded with HTTP {}", self.status)?;

        if !self.body.is_empty() {
            write!(f, ": {}", self.body)?;
        }

        Ok(())
    }
}

impl std::error::Error for StatusError {}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::{Duration, SystemTime};

    use evlog::{EventKind, EventStatus};

    use crate::client::tests::serve;

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse::from_parts(status, body.as_bytes().to_vec())
    }

    fn interpret(status: u16, body: &str) -> Result<SendReport, TransportError> {
        interpret_response(&InternalMetrics::default(), response(status, body))
    }

    #[test]
    fn success_without_body_accepts_everything() {
        let report = interpret(200, "").unwrap();
        assert!(report.rejected().is_empty());

        let report = interpret(204, "  \n").unwrap();
        assert!(report.rejected().is_empty());
    }

    #[test]
    fn success_with_rejections_reports_them() {
        let report = interpret(
            200,
            r#"{"rejected":[{"index":1,"reason":"missing correlationId"},{"index":3}]}"#,
        )
        .unwrap();

        assert_eq!(
            vec![
                RejectedError::new(1, "missing correlationId"),
                RejectedError::new(3, ""),
            ],
            report.rejected()
        );
    }

    #[test]
    fn success_with_unknown_body_accepts_everything() {
        let report = interpret(200, "<html>ok</html>").unwrap();

        assert!(report.rejected().is_empty());
    }

    #[test]
    fn status_codes_map_to_retry_policy() {
        for status in [408, 429, 500, 502, 503, 504] {
            let err = interpret(status, "").unwrap_err();

            assert!(err.is_retryable(), "{status}");
            assert!(!err.is_unauthorized(), "{status}");
        }

        let err = interpret(401, "").unwrap_err();
        assert!(err.is_retryable());
        assert!(err.is_unauthorized());

        for status in [400, 403, 404, 413, 422] {
            let err = interpret(status, "").unwrap_err();

            assert!(!err.is_retryable(), "{status}");
        }
    }

    #[test]
    fn status_errors_include_a_bounded_body() {
        let err = interpret(400, &"x".repeat(1000)).unwrap_err();

        let msg = err.to_string();

        assert!(msg.starts_with("the remote service responded with HTTP 400: xxx"));
        assert!(msg.len() < 400);
    }

    #[test]
    fn zero_timeout_is_invalid() {
        assert!(HttpTransport::builder("http://localhost/ingest")
            .request_timeout(Duration::ZERO)
            .build()
            .is_err());
    }

    #[tokio::test]
    async fn send_posts_a_json_batch() {
        let (url, mut requests) =
            serve(vec![(200, r#"{"rejected":[{"index":0,"reason":"bad"}]}"#)]).await;

        let transport = HttpTransport::builder(url)
            .allow_compression(false)
            .header("x-tenant", "acme")
            .build()
            .unwrap();

        let batch = vec![
            Event::new_at(
                EventKind::ProcessStart,
                EventStatus::InProgress,
                SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            )
            .with_correlation_id("order-42"),
            Event::new(EventKind::ProcessEnd, EventStatus::Success),
        ];

        let report = transport
            .send(&batch, &Token::never_expires("abc"))
            .await
            .unwrap();

        assert_eq!(1, report.rejected_count(batch.len()));

        let req = requests.recv().await.unwrap();

        assert_eq!(Some("Bearer abc"), req.header("authorization"));
        assert_eq!(Some("application/json"), req.header("content-type"));
        assert_eq!(Some("acme"), req.header("x-tenant"));
        assert_eq!(None, req.header("content-encoding"));

        let sent: serde_json::Value = serde_json::from_slice(&req.body).unwrap();

        assert_eq!(2, sent.as_array().unwrap().len());
        assert_eq!("order-42", sent[0]["correlationId"]);
        assert_eq!("PROCESS_START", sent[0]["kind"]);
        assert!(sent[0]["timestamp"]
            .as_str()
            .unwrap()
            .starts_with("2023-11-14T22:13:20"));

        assert_eq!(1, transport.metrics().transport_request_sent());
    }

    #[cfg(feature = "gzip")]
    #[tokio::test]
    async fn send_compresses_plaintext_requests() {
        use std::io::Read as _;

        let (url, mut requests) = serve(vec![(200, "")]).await;

        let transport = HttpTransport::builder(url).build().unwrap();

        transport
            .send(
                &[Event::new(EventKind::Step, EventStatus::Success)],
                &Token::never_expires("abc"),
            )
            .await
            .unwrap();

        let req = requests.recv().await.unwrap();

        assert_eq!(Some("gzip"), req.header("content-encoding"));

        let mut body = String::new();
        flate2::read::GzDecoder::new(&*req.body)
            .read_to_string(&mut body)
            .unwrap();

        assert!(body.starts_with("[{"));
        assert_eq!(1, transport.metrics().transport_request_compress_gzip());
    }

    #[tokio::test]
    async fn send_maps_server_errors() {
        let (url, _requests) = serve(vec![(503, "unavailable"), (401, "")]).await;

        let transport = HttpTransport::builder(url)
            .allow_compression(false)
            .build()
            .unwrap();

        let batch = [Event::new(EventKind::Step, EventStatus::Success)];
        let token = Token::never_expires("abc");

        let err = transport.send(&batch, &token).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!err.is_unauthorized());

        let err = transport.send(&batch, &token).await.unwrap_err();
        assert!(err.is_unauthorized());

        assert_eq!(2, transport.metrics().transport_response_status_failed());
    }
}
