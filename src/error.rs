use reqwest::{Method, StatusCode, Url};

use crate::transport::TransportError;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum RetryHttpError {
    /// The request URL could not be parsed.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// A header name or value was rejected.
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    /// The request body cannot be re-created for another attempt.
    #[error("request body is not replayable: {0}")]
    NotReplayable(String),
    /// Reading the request body source failed.
    #[error("request body error: {0}")]
    Body(#[source] std::io::Error),
    /// Form or JSON body serialization failed.
    #[error("encode error: {0}")]
    Encode(String),
    /// Network or request execution error from the transport.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The per-request cancellation token fired.
    #[error("request cancelled")]
    Cancelled,
    /// The per-request deadline passed.
    #[error("request deadline exceeded")]
    DeadlineExceeded,
    /// The last attempt produced a response the retry policy did not accept.
    #[error("unexpected response status {0}")]
    Status(StatusCode),
    /// All attempts were used without a successful outcome.
    #[error("{method} {url} giving up after {attempts} attempt(s): {cause}")]
    GaveUp {
        method: Method,
        url: Url,
        /// Total attempts made, including the first.
        attempts: usize,
        #[source]
        cause: Box<RetryHttpError>,
    },
}

impl RetryHttpError {
    /// Returns `true` for errors raised by cancellation or an expired deadline.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    /// Returns the transport error at the root of this error, if any.
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(err) => Some(err),
            Self::GaveUp { cause, .. } => cause.transport(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RetryHttpError;
    use crate::transport::{TransportError, TransportErrorKind};
    use reqwest::{Method, Url};

    #[test]
    fn gave_up_names_method_url_and_attempts() {
        let err = RetryHttpError::GaveUp {
            method: Method::GET,
            url: Url::parse("http://localhost/items").expect("valid url"),
            attempts: 4,
            cause: Box::new(RetryHttpError::Transport(TransportError::new(
                TransportErrorKind::Connect,
                "connection refused",
            ))),
        };

        let message = err.to_string();
        assert!(message.starts_with("GET http://localhost/items giving up after 4 attempt(s)"));
        assert!(message.contains("connection refused"));
        assert_eq!(
            err.transport().map(TransportError::kind),
            Some(TransportErrorKind::Connect)
        );
    }

    #[test]
    fn cancellation_errors_are_flagged() {
        assert!(RetryHttpError::Cancelled.is_cancellation());
        assert!(RetryHttpError::DeadlineExceeded.is_cancellation());
        assert!(!RetryHttpError::InvalidUrl("x".to_owned()).is_cancellation());
    }
}
