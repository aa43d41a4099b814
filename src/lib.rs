//! `retry-http` executes HTTP requests over `reqwest` and retries transient
//! failures.
//!
//! The moving parts are pluggable:
//! - [`RetryPolicy`] decides whether a finished attempt is retried
//! - [`WaitStrategy`] decides how long to wait before the next attempt
//! - [`RequestBody`] replays the request body identically on every attempt
//!
//! [`RetryClient::execute`] ties them together and keeps per-request
//! [`Metrics`] on the [`RequestEnvelope`].

mod backoff;
mod client;
mod error;
mod options;
mod policy;
mod request;
mod transport;

pub use backoff::{Exponential, ExponentialJitter, FullJitter, LinearJitter, WaitStrategy};
pub use client::{
    drain_response, passthrough_error_handler, ErrorHandler, RequestLogHook, ResponseLogHook,
    RetryClient,
};
pub use error::RetryHttpError;
pub use options::ClientOptions;
pub use policy::{is_permanent, DefaultRetryPolicy, HostSprayRetryPolicy, RetryDecision, RetryPolicy};
pub use request::{Metrics, RequestBody, RequestContext, RequestEnvelope};
pub use transport::{
    classify_reqwest_error, PoolProfile, ReqwestTransport, Transport, TransportError,
    TransportErrorKind,
};

pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, RetryHttpError>;
