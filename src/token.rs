/*!
Bearer tokens and the providers that supply them.

A [`TokenProvider`] is asked for a token immediately before every send attempt. There are two kinds:

- [`StaticTokenProvider`]: a fixed token that never expires.
- [`OAuthTokenProvider`]: a token fetched from an identity provider through a [`TokenSource`], cached until it's close to expiring.

# Single-flight refresh

When an OAuth token needs refreshing, only one caller fetches a new one. Any other callers that arrive while that fetch is in progress wait for it and share its result, whether it's a new token or an error.
*/

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, SystemTime},
};

use crate::clock::{self, Clock, SystemClock};

/**
A boxed future returned by the collaborator traits in this crate.
*/
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/**
An opaque bearer credential with an optional expiry.
*/
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    value: Arc<str>,
    expires_at: Option<SystemTime>,
}

impl Token {
    /**
    Create a token that expires at the given time.
    */
    pub fn new(value: impl Into<Arc<str>>, expires_at: SystemTime) -> Self {
        Token {
            value: value.into(),
            expires_at: Some(expires_at),
        }
    }

    /**
    Create a token that never expires.
    */
    pub fn never_expires(value: impl Into<Arc<str>>) -> Self {
        Token {
            value: value.into(),
            expires_at: None,
        }
    }

    /**
    The credential to send.
    */
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    /**
    Whether the token is still usable at all at the given time.
    */
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now,
            None => false,
        }
    }

    fn is_fresh(&self, clock: &(impl Clock + ?Sized), margin: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => clock::until(clock, expires_at) > margin,
            None => true,
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never leak the credential into diagnostics
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/**
A failure to obtain any usable token.

Auth errors are cheap to clone, so the same failure can be handed to every caller waiting on a refresh.
*/
#[derive(Debug, Clone)]
pub struct AuthError {
    msg: Arc<str>,
}

impl AuthError {
    pub fn new(msg: impl fmt::Display) -> Self {
        AuthError {
            msg: msg.to_string().into(),
        }
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to obtain a token: {}", self.msg)
    }
}

impl std::error::Error for AuthError {}

/**
The identity provider round trip behind an [`OAuthTokenProvider`].
*/
pub trait TokenSource: Send + Sync {
    /**
    Fetch a brand new token.
    */
    fn fetch(&self) -> BoxFuture<'_, Result<Token, AuthError>>;
}

impl<T: TokenSource + ?Sized> TokenSource for Arc<T> {
    fn fetch(&self) -> BoxFuture<'_, Result<Token, AuthError>> {
        (**self).fetch()
    }
}

impl<T: TokenSource + ?Sized> TokenSource for Box<T> {
    fn fetch(&self) -> BoxFuture<'_, Result<Token, AuthError>> {
        (**self).fetch()
    }
}

/**
A source of tokens for sending events.
*/
#[derive(Clone)]
pub enum TokenProvider {
    /**
    A fixed token.
    */
    Static(StaticTokenProvider),
    /**
    A cached token refreshed from an identity provider.
    */
    OAuth(OAuthTokenProvider),
}

impl TokenProvider {
    /**
    Get a token that's valid now.
    */
    pub async fn get_token(&self) -> Result<Token, AuthError> {
        match self {
            TokenProvider::Static(provider) => Ok(provider.get_token()),
            TokenProvider::OAuth(provider) => provider.get_token().await,
        }
    }

    /**
    Forget any cached token so the next call to [`TokenProvider::get_token`] fetches a new one.

    This has no effect on static tokens.
    */
    pub fn invalidate(&self) {
        match self {
            TokenProvider::Static(_) => (),
            TokenProvider::OAuth(provider) => provider.invalidate(),
        }
    }
}

impl From<StaticTokenProvider> for TokenProvider {
    fn from(provider: StaticTokenProvider) -> Self {
        TokenProvider::Static(provider)
    }
}

impl From<OAuthTokenProvider> for TokenProvider {
    fn from(provider: OAuthTokenProvider) -> Self {
        TokenProvider::OAuth(provider)
    }
}

/**
A [`TokenProvider`] that always returns the same token.
*/
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: Token,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        StaticTokenProvider {
            token: Token::never_expires(token),
        }
    }

    pub fn get_token(&self) -> Token {
        self.token.clone()
    }
}

const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/**
A builder for an [`OAuthTokenProvider`].
*/
pub struct OAuthTokenProviderBuilder {
    source: Box<dyn TokenSource>,
    clock: Arc<dyn Clock + Send + Sync>,
    refresh_margin: Duration,
}

impl OAuthTokenProviderBuilder {
    /**
    How close to its expiry a cached token can get before it's refreshed.

    The default is 60 seconds.
    */
    pub fn refresh_margin(mut self, refresh_margin: Duration) -> Self {
        self.refresh_margin = refresh_margin;
        self
    }

    /**
    The clock used to check token expiry.
    */
    pub fn clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> OAuthTokenProvider {
        OAuthTokenProvider {
            shared: Arc::new(OAuthShared {
                source: self.source,
                clock: self.clock,
                refresh_margin: self.refresh_margin,
                cached: Mutex::new(Cached {
                    token: None,
                    generation: 0,
                    last_error: None,
                }),
                refresh: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

/**
A [`TokenProvider`] that caches tokens fetched from a [`TokenSource`].
*/
#[derive(Clone)]
pub struct OAuthTokenProvider {
    shared: Arc<OAuthShared>,
}

struct OAuthShared {
    source: Box<dyn TokenSource>,
    clock: Arc<dyn Clock + Send + Sync>,
    refresh_margin: Duration,
    cached: Mutex<Cached>,
    // Held by whichever caller is currently fetching a new token
    refresh: tokio::sync::Mutex<()>,
}

struct Cached {
    token: Option<Token>,
    // Bumped after every completed refresh, successful or not
    generation: u64,
    last_error: Option<AuthError>,
}

impl OAuthTokenProvider {
    /**
    Start building a provider that fetches tokens from `source`.
    */
    pub fn builder(source: impl TokenSource + 'static) -> OAuthTokenProviderBuilder {
        OAuthTokenProviderBuilder {
            source: Box::new(source),
            clock: Arc::new(SystemClock::new()),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
        }
    }

    /**
    Get a cached token, refreshing it if it's missing or close to expiry.

    If refreshing fails but the cached token hasn't technically expired yet then it's returned anyway.
    */
    pub async fn get_token(&self) -> Result<Token, AuthError> {
        let shared = &self.shared;

        let observed = {
            let cached = shared.lock();

            if let Some(ref token) = cached.token {
                if token.is_fresh(&*shared.clock, shared.refresh_margin) {
                    return Ok(token.clone());
                }
            }

            cached.generation
        };

        let _refresh = shared.refresh.lock().await;

        // If a refresh completed while we were waiting then share its outcome
        {
            let cached = shared.lock();

            if cached.generation != observed {
                if let Some(outcome) = cached.outcome(shared.clock.now()) {
                    return outcome;
                }
            }
        }

        emit::debug!(rt: emit::runtime::internal(), "refreshing token");

        let fetched = shared.source.fetch().await;
        let now = shared.clock.now();

        let mut cached = shared.lock();
        cached.generation += 1;

        match fetched {
            Ok(token) => {
                cached.token = Some(token.clone());
                cached.last_error = None;

                Ok(token)
            }
            Err(err) => {
                emit::warn!(
                    rt: emit::runtime::internal(),
                    "failed to refresh token: {err}",
                    err,
                );

                cached.last_error = Some(err.clone());

                match cached.token {
                    Some(ref stale) if !stale.is_expired_at(now) => Ok(stale.clone()),
                    _ => Err(err),
                }
            }
        }
    }

    /**
    Forget the cached token.
    */
    pub fn invalidate(&self) {
        self.shared.lock().token = None;
    }
}

impl OAuthShared {
    fn lock(&self) -> MutexGuard<'_, Cached> {
        self.cached.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Cached {
    fn outcome(&self, now: SystemTime) -> Option<Result<Token, AuthError>> {
        match (&self.token, &self.last_error) {
            (Some(token), _) if !token.is_expired_at(now) => Some(Ok(token.clone())),
            (_, Some(err)) => Some(Err(err.clone())),
            // The token was invalidated after the refresh; fetch another
            _ => None,
        }
    }
}
