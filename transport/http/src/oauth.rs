/*!
The [`ClientCredentialsSource`] type.
*/

use std::{fmt, sync::Arc, time::Duration};

use evlog::{
    token::{BoxFuture, TokenSource},
    AuthError, Clock, SystemClock, Token,
};
use serde::Deserialize;

use crate::{
    client::{HttpConnection, HttpResponse, HttpVersion},
    internal_metrics::{HttpMetrics, InternalMetrics},
    transport::DEFAULT_REQUEST_TIMEOUT,
    Error,
};

/**
A builder for [`ClientCredentialsSource`].
*/
#[must_use = "call `.build()` to construct the token source"]
pub struct ClientCredentialsBuilder {
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: Option<String>,
    request_timeout: Duration,
    clock: Box<dyn Clock + Send + Sync>,
}

impl ClientCredentialsBuilder {
    /**
    Request tokens with the given scope.
    */
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /**
    The time allowed for a token request before it's considered failed.
    */
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /**
    The clock used to turn a token's lifetime into an expiry instant.
    */
    pub fn clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /**
    Build the token source.
    */
    pub fn build(self) -> Result<ClientCredentialsSource, Error> {
        if self.request_timeout.is_zero() {
            return Err(Error::msg("the request timeout must be non-zero"));
        }

        let mut form = String::new();

        append_pair(&mut form, "grant_type", "client_credentials");
        append_pair(&mut form, "client_id", &self.client_id);
        append_pair(&mut form, "client_secret", &self.client_secret);

        if let Some(ref scope) = self.scope {
            append_pair(&mut form, "scope", scope);
        }

        Ok(ClientCredentialsSource {
            conn: HttpConnection::new(
                Arc::new(InternalMetrics::default()),
                &self.token_url,
                HttpVersion::Http1,
                false,
                self.request_timeout,
                vec![("accept".to_owned(), "application/json".to_owned())],
            )?,
            client_id: self.client_id,
            form: form.into(),
            clock: self.clock,
        })
    }
}

/**
A [`TokenSource`] that requests tokens from an OAuth 2.0 identity provider using the client credentials grant.

Each call to [`TokenSource::fetch`] makes exactly one request. Caching and refreshing tokens is left to an [`evlog::OAuthTokenProvider`].
*/
pub struct ClientCredentialsSource {
    conn: HttpConnection,
    client_id: String,
    form: Arc<str>,
    clock: Box<dyn Clock + Send + Sync>,
}

impl ClientCredentialsSource {
    /**
    Start building a token source that authenticates with `client_id` and `client_secret` at `token_url`.
    */
    pub fn builder(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> ClientCredentialsBuilder {
        ClientCredentialsBuilder {
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            clock: Box::new(SystemClock::new()),
        }
    }

    /**
    Get metrics for the connections and requests made to the identity provider.
    */
    pub fn metrics(&self) -> HttpMetrics {
        HttpMetrics {
            metrics: self.conn.metrics().clone(),
        }
    }

    async fn request_token(&self) -> Result<Token, AuthError> {
        let res = self
            .conn
            .send(
                self.form.as_bytes().to_vec(),
                "application/x-www-form-urlencoded",
                &[],
            )
            .await
            .map_err(|err| {
                AuthError::new(format_args!(
                    "failed to request a token from {}: {err}",
                    self.conn.uri()
                ))
            })?;

        let token = read_token_response(self.conn.metrics(), &self.clock, res)?;

        emit::debug!(
            rt: emit::runtime::internal(),
            "fetched a token for {client_id}",
            client_id: self.client_id.as_str(),
        );

        Ok(token)
    }
}

impl TokenSource for ClientCredentialsSource {
    fn fetch(&self) -> BoxFuture<'_, Result<Token, AuthError>> {
        Box::pin(self.request_token())
    }
}

impl fmt::Debug for ClientCredentialsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentialsSource")
            .field("token_url", &self.conn.uri().to_string())
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

fn read_token_response(
    metrics: &InternalMetrics,
    clock: &(impl Clock + ?Sized),
    res: HttpResponse,
) -> Result<Token, AuthError> {
    if !res.is_success() {
        metrics.transport_response_status_failed.increment();

        return Err(match serde_json::from_slice::<TokenErrorResponse>(res.body()) {
            Ok(TokenErrorResponse {
                error,
                error_description: Some(description),
            }) => AuthError::new(format_args!(
                "the identity provider responded with HTTP {}: {error}: {description}",
                res.http_status()
            )),
            Ok(TokenErrorResponse { error, .. }) => AuthError::new(format_args!(
                "the identity provider responded with HTTP {}: {error}",
                res.http_status()
            )),
            Err(_) => AuthError::new(format_args!(
                "the identity provider responded with HTTP {}",
                res.http_status()
            )),
        });
    }

    let token: TokenResponse = serde_json::from_slice(res.body()).map_err(|err| {
        metrics.transport_response_undecodable.increment();

        AuthError::new(format_args!(
            "failed to decode the identity provider's response: {err}"
        ))
    })?;

    Ok(match token.expires_in {
        Some(expires_in) => Token::new(
            token.access_token,
            clock.now() + Duration::from_secs(expires_in),
        ),
        None => Token::never_expires(token.access_token),
    })
}

/**
Append a `key=value` pair to an `application/x-www-form-urlencoded` body.
*/
fn append_pair(form: &mut String, key: &str, value: &str) {
    if !form.is_empty() {
        form.push('&');
    }

    form.push_str(&urlencoding::encode(key));
    form.push('=');
    form.push_str(&urlencoding::encode(value));
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::{SystemTime, UNIX_EPOCH};

    use crate::client::tests::serve;

    struct FixedClock(SystemTime);

    impl Clock for FixedClock {
        fn now(&self) -> SystemTime {
            self.0
        }
    }

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse::from_parts(status, body.as_bytes().to_vec())
    }

    #[test]
    fn form_encoding() {
        let mut form = String::new();

        append_pair(&mut form, "grant_type", "client_credentials");
        append_pair(&mut form, "client_secret", "s3cr3t&=+/ é");
        append_pair(&mut form, "scope", "events:write events.read");

        assert_eq!(
            "grant_type=client_credentials&client_secret=s3cr3t%26%3D%2B%2F%20%C3%A9&scope=events%3Awrite%20events.read",
            form
        );
    }

    #[test]
    fn token_response_sets_expiry_from_the_clock() {
        let now = UNIX_EPOCH + Duration::from_secs(1_000);

        let token = read_token_response(
            &InternalMetrics::default(),
            &FixedClock(now),
            response(
                200,
                r#"{"access_token":"abc","token_type":"Bearer","expires_in":3600}"#,
            ),
        )
        .unwrap();

        assert_eq!("abc", token.value());
        assert_eq!(Some(now + Duration::from_secs(3600)), token.expires_at());
    }

    #[test]
    fn token_response_without_expiry_never_expires() {
        let token = read_token_response(
            &InternalMetrics::default(),
            &FixedClock(UNIX_EPOCH),
            response(200, r#"{"access_token":"abc"}"#),
        )
        .unwrap();

        assert_eq!(None, token.expires_at());
    }

    #[test]
    fn token_errors_include_the_provider_error() {
        let err = read_token_response(
            &InternalMetrics::default(),
            &FixedClock(UNIX_EPOCH),
            response(
                400,
                r#"{"error":"invalid_client","error_description":"unknown client"}"#,
            ),
        )
        .unwrap_err();

        assert!(err.to_string().ends_with(
            "the identity provider responded with HTTP 400: invalid_client: unknown client"
        ));

        let err = read_token_response(
            &InternalMetrics::default(),
            &FixedClock(UNIX_EPOCH),
            response(200, "not json"),
        )
        .unwrap_err();

        assert!(err
            .to_string()
            .contains("failed to decode the identity provider's response"));
    }

    #[tokio::test]
    async fn fetch_posts_client_credentials() {
        let (url, mut requests) =
            serve(vec![(200, r#"{"access_token":"fresh","expires_in":60}"#)]).await;

        let source = ClientCredentialsSource::builder(url, "my-client", "my secret")
            .scope("events")
            .build()
            .unwrap();

        let token = source.fetch().await.unwrap();

        assert_eq!("fresh", token.value());
        assert!(!token.is_expired_at(SystemTime::now()));

        let req = requests.recv().await.unwrap();

        assert_eq!(
            Some("application/x-www-form-urlencoded"),
            req.header("content-type")
        );
        assert_eq!(
            "grant_type=client_credentials&client_id=my-client&client_secret=my%20secret&scope=events",
            String::from_utf8(req.body).unwrap()
        );
    }

    #[tokio::test]
    async fn fetch_drives_an_oauth_provider() {
        let (url, _requests) =
            serve(vec![(200, r#"{"access_token":"fresh","expires_in":3600}"#)]).await;

        let provider = evlog::OAuthTokenProvider::builder(
            ClientCredentialsSource::builder(url, "my-client", "my-secret")
                .build()
                .unwrap(),
        )
        .build();

        let first = provider.get_token().await.unwrap();
        let second = provider.get_token().await.unwrap();

        assert_eq!("fresh", first.value());
        assert_eq!(first.value(), second.value());
    }
}
