use reqwest::Response;

use crate::request::RequestContext;
use crate::transport::{TransportError, TransportErrorKind};
use crate::RetryHttpError;

/// Outcome of a retry check for one attempt.
#[derive(Debug)]
pub enum RetryDecision {
    /// Try again after waiting.
    Retry,
    /// Stop and hand the attempt's own result back to the caller.
    Stop,
    /// Stop and replace the attempt's result with this error.
    Abort(RetryHttpError),
}

impl RetryDecision {
    pub fn should_retry(&self) -> bool {
        matches!(self, Self::Retry)
    }
}

/// Decides whether a finished attempt should be retried.
///
/// Exactly one of `response` and `error` is `Some` for attempts produced by
/// the client.
pub trait RetryPolicy: Send + Sync {
    fn check(
        &self,
        ctx: &RequestContext,
        response: Option<&Response>,
        error: Option<&TransportError>,
    ) -> RetryDecision;
}

impl<F> RetryPolicy for F
where
    F: Fn(&RequestContext, Option<&Response>, Option<&TransportError>) -> RetryDecision
        + Send
        + Sync,
{
    fn check(
        &self,
        ctx: &RequestContext,
        response: Option<&Response>,
        error: Option<&TransportError>,
    ) -> RetryDecision {
        self(ctx, response, error)
    }
}

/// Retries transport failures only.
///
/// Responses are never retried, whatever their status code. Supply a custom
/// [`RetryPolicy`] to retry on statuses such as 503.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn check(
        &self,
        ctx: &RequestContext,
        _response: Option<&Response>,
        error: Option<&TransportError>,
    ) -> RetryDecision {
        if let Some(err) = ctx.err() {
            return RetryDecision::Abort(err);
        }
        match error {
            Some(err) if is_permanent(err.kind()) => RetryDecision::Stop,
            Some(_) => RetryDecision::Retry,
            None => RetryDecision::Stop,
        }
    }
}

/// Policy for clients spraying requests across many hosts. Behaves exactly
/// like [`DefaultRetryPolicy`].
#[derive(Clone, Copy, Debug, Default)]
pub struct HostSprayRetryPolicy;

impl RetryPolicy for HostSprayRetryPolicy {
    fn check(
        &self,
        ctx: &RequestContext,
        response: Option<&Response>,
        error: Option<&TransportError>,
    ) -> RetryDecision {
        DefaultRetryPolicy.check(ctx, response, error)
    }
}

/// Failures that another attempt cannot fix.
pub fn is_permanent(kind: TransportErrorKind) -> bool {
    matches!(
        kind,
        TransportErrorKind::RedirectLimit
            | TransportErrorKind::UnsupportedScheme
            | TransportErrorKind::UntrustedCertificate
    )
}
