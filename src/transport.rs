use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Request, Response};

/// Sends a single request. Retrying is the caller's job.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs one exchange. Ownership of the response body moves to the caller.
    async fn send(&self, request: Request) -> Result<Response, TransportError>;

    /// Drops pooled idle connections. The default does nothing.
    fn close_idle_connections(&self) {}
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        (**self).send(request).await
    }

    fn close_idle_connections(&self) {
        (**self).close_idle_connections()
    }
}

/// Coarse classification of a transport failure, used by retry policies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// The redirect policy stopped following redirects.
    RedirectLimit,
    /// The URL scheme is not one the transport can speak.
    UnsupportedScheme,
    /// The server certificate chains to an unknown or untrusted authority.
    UntrustedCertificate,
    /// The request timed out.
    Timeout,
    /// The connection could not be established.
    Connect,
    /// The exchange was abandoned because the request was cancelled.
    Cancelled,
    /// Anything else (reset connections, body errors, decode errors, ...).
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RedirectLimit => "redirect limit",
            Self::UnsupportedScheme => "unsupported scheme",
            Self::UntrustedCertificate => "untrusted certificate",
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Error produced by a [`Transport`], tagged with its [`TransportErrorKind`].
#[derive(Debug)]
pub struct TransportError {
    kind: TransportErrorKind,
    source: Box<dyn StdError + Send + Sync>,
}

impl TransportError {
    pub fn new(
        kind: TransportErrorKind,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// Returns the underlying `reqwest` error when the failure came from `reqwest`.
    pub fn as_reqwest(&self) -> Option<&reqwest::Error> {
        self.source.downcast_ref::<reqwest::Error>()
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport error ({}): {}", self.kind, self.source)
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.source)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let kind = classify_reqwest_error(&err);
        Self::new(kind, err)
    }
}

/// Maps a `reqwest` error onto a [`TransportErrorKind`].
pub fn classify_reqwest_error(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_redirect() {
        return TransportErrorKind::RedirectLimit;
    }
    if err.is_builder() && has_unsupported_scheme(err) {
        return TransportErrorKind::UnsupportedScheme;
    }
    // Certificate failures also report as connect errors, so check them first.
    if chain_mentions(err, UNTRUSTED_CERTIFICATE_MARKERS) {
        return TransportErrorKind::UntrustedCertificate;
    }
    if err.is_timeout() {
        return TransportErrorKind::Timeout;
    }
    if err.is_connect() {
        return TransportErrorKind::Connect;
    }
    TransportErrorKind::Other
}

const UNTRUSTED_CERTIFICATE_MARKERS: &[&str] = &[
    "unknownissuer",
    "unknown issuer",
    "unknown certificate authority",
    "unable to get local issuer certificate",
    "self signed certificate",
    "self-signed certificate",
];

fn has_unsupported_scheme(err: &reqwest::Error) -> bool {
    let bad_url = err
        .url()
        .is_some_and(|url| !matches!(url.scheme(), "http" | "https"));
    bad_url || chain_mentions(err, &["url scheme is not allowed"])
}

fn chain_mentions(err: &(dyn StdError + 'static), markers: &[&str]) -> bool {
    let mut current = Some(err);
    while let Some(error) = current {
        let text = error.to_string().to_ascii_lowercase();
        if markers.iter().any(|marker| text.contains(marker)) {
            return true;
        }
        current = error.source();
    }
    false
}

/// Connection-pool profile used to build the underlying `reqwest::Client`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolProfile {
    /// Keeps idle connections around for reuse against the same hosts.
    Pooled,
    /// Keeps no idle connections; suited to calling many different hosts once.
    HostSpraying,
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 100;

fn build_client(profile: PoolProfile) -> reqwest::Result<Client> {
    let builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);
    match profile {
        PoolProfile::Pooled => builder
            .tcp_keepalive(TCP_KEEPALIVE)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build(),
        PoolProfile::HostSpraying => builder.pool_max_idle_per_host(0).build(),
    }
}

/// [`Transport`] backed by `reqwest::Client`.
pub struct ReqwestTransport {
    client: RwLock<Client>,
    profile: Option<PoolProfile>,
}

impl fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("profile", &self.profile)
            .finish()
    }
}

impl ReqwestTransport {
    /// Builds a transport with its own client for the given pool profile.
    pub fn new(profile: PoolProfile) -> Result<Self, TransportError> {
        let client = build_client(profile)?;
        Ok(Self {
            client: RwLock::new(client),
            profile: Some(profile),
        })
    }

    pub fn pooled() -> Result<Self, TransportError> {
        Self::new(PoolProfile::Pooled)
    }

    pub fn host_spraying() -> Result<Self, TransportError> {
        Self::new(PoolProfile::HostSpraying)
    }

    /// Wraps a caller-configured client.
    ///
    /// The client's pool cannot be rebuilt, so
    /// [`Transport::close_idle_connections`] is a no-op for it.
    pub fn from_client(client: Client) -> Self {
        Self {
            client: RwLock::new(client),
            profile: None,
        }
    }

    pub fn profile(&self) -> Option<PoolProfile> {
        self.profile
    }

    /// Only pooled clients keep idle connections worth dropping.
    fn resets_pool_on_close(&self) -> bool {
        matches!(self.profile, Some(PoolProfile::Pooled))
    }

    fn current(&self) -> Client {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let client = self.current();
        client.execute(request).await.map_err(TransportError::from)
    }

    /// Swaps in a freshly built client. In-flight requests keep the old
    /// client alive; its idle pool is dropped once they finish.
    ///
    /// Host-spraying clients keep no idle pool, so there is nothing to do.
    fn close_idle_connections(&self) {
        let Some(profile) = self.profile.filter(|_| self.resets_pool_on_close()) else {
            return;
        };
        match build_client(profile) {
            Ok(fresh) => {
                *self.client.write().unwrap_or_else(PoisonError::into_inner) = fresh;
                #[cfg(feature = "tracing")]
                tracing::debug!(?profile, "closed idle connections");
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %_err, "could not rebuild client, keeping idle pool");
            }
        }
    }
}
