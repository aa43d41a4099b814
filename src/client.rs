use std::fmt;
use std::sync::Arc;

use reqwest::{Method, Request, Response};
use serde::Serialize;

use crate::{
    backoff::{Exponential, WaitStrategy},
    policy::{DefaultRetryPolicy, RetryDecision, RetryPolicy},
    request::{Metrics, RequestBody, RequestEnvelope},
    transport::{PoolProfile, ReqwestTransport, Transport, TransportError, TransportErrorKind},
    ClientOptions, Result, RetryHttpError,
};

/// Called with the outgoing request and its 0-based attempt index.
pub type RequestLogHook = Arc<dyn Fn(&Request, usize) + Send + Sync>;

/// Called with every response received.
pub type ResponseLogHook = Arc<dyn Fn(&Response) + Send + Sync>;

/// Turns the last attempt's outcome into the call's result once retries
/// are exhausted. Receives the total number of attempts allowed.
pub type ErrorHandler = Arc<dyn Fn(Result<Response>, usize) -> Result<Response> + Send + Sync>;

/// [`ErrorHandler`] that returns the last attempt's outcome untouched.
pub fn passthrough_error_handler(last: Result<Response>, _attempts: usize) -> Result<Response> {
    last
}

/// HTTP client that retries transient failures.
pub struct RetryClient<T = ReqwestTransport> {
    transport: Arc<T>,
    options: ClientOptions,
    retry_policy: Arc<dyn RetryPolicy>,
    wait_strategy: Arc<dyn WaitStrategy>,
    request_log_hook: Option<RequestLogHook>,
    response_log_hook: Option<ResponseLogHook>,
    error_handler: Option<ErrorHandler>,
}

impl<T> Clone for RetryClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            options: self.options.clone(),
            retry_policy: Arc::clone(&self.retry_policy),
            wait_strategy: Arc::clone(&self.wait_strategy),
            request_log_hook: self.request_log_hook.clone(),
            response_log_hook: self.response_log_hook.clone(),
            error_handler: self.error_handler.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for RetryClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hook = |set: bool| if set { "<hook>" } else { "<none>" };
        f.debug_struct("RetryClient")
            .field("transport", &self.transport)
            .field("options", &self.options)
            .field("request_log_hook", &hook(self.request_log_hook.is_some()))
            .field("response_log_hook", &hook(self.response_log_hook.is_some()))
            .field("error_handler", &hook(self.error_handler.is_some()))
            .finish()
    }
}

impl RetryClient<ReqwestTransport> {
    /// Creates a client with its own `reqwest` transport.
    ///
    /// The pool profile follows `options.kill_idle_connections`: host spraying
    /// when set, pooled otherwise.
    pub fn new(options: ClientOptions) -> Result<Self> {
        let profile = if options.kill_idle_connections {
            PoolProfile::HostSpraying
        } else {
            PoolProfile::Pooled
        };
        let transport = ReqwestTransport::new(profile)?;
        Ok(Self::with_transport(transport, options))
    }

    /// Creates a client around a caller-configured `reqwest::Client`.
    pub fn from_reqwest(client: reqwest::Client, options: ClientOptions) -> Self {
        Self::with_transport(ReqwestTransport::from_client(client), options)
    }
}

impl<T: Transport> RetryClient<T> {
    /// Creates a client around any [`Transport`], using [`DefaultRetryPolicy`]
    /// and [`Exponential`] waits.
    pub fn with_transport(transport: T, options: ClientOptions) -> Self {
        Self {
            transport: Arc::new(transport),
            options,
            retry_policy: Arc::new(DefaultRetryPolicy),
            wait_strategy: Arc::new(Exponential),
            request_log_hook: None,
            response_log_hook: None,
            error_handler: None,
        }
    }

    /// Replaces the policy that decides whether an attempt is retried.
    pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Arc::new(policy);
        self
    }

    /// Replaces the strategy that picks the wait between attempts.
    pub fn with_wait_strategy(mut self, strategy: impl WaitStrategy + 'static) -> Self {
        self.wait_strategy = Arc::new(strategy);
        self
    }

    /// Calls `hook` before every attempt is sent.
    pub fn with_request_log_hook(
        mut self,
        hook: impl Fn(&Request, usize) + Send + Sync + 'static,
    ) -> Self {
        self.request_log_hook = Some(Arc::new(hook));
        self
    }

    /// Calls `hook` for every response received, retried or not.
    pub fn with_response_log_hook(mut self, hook: impl Fn(&Response) + Send + Sync + 'static) -> Self {
        self.response_log_hook = Some(Arc::new(hook));
        self
    }

    /// Lets `handler` decide the result once retries are exhausted, instead
    /// of the default [`RetryHttpError::GaveUp`].
    pub fn with_error_handler(
        mut self,
        handler: impl Fn(Result<Response>, usize) -> Result<Response> + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Options this client was built with.
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Transport used for every attempt.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Sends a GET request.
    pub async fn get(&self, url: &str) -> Result<Response> {
        let mut envelope = RequestEnvelope::new(Method::GET, url, None)?;
        self.execute(&mut envelope).await
    }

    /// Sends a HEAD request.
    pub async fn head(&self, url: &str) -> Result<Response> {
        let mut envelope = RequestEnvelope::new(Method::HEAD, url, None)?;
        self.execute(&mut envelope).await
    }

    /// Sends a POST request with the given content type.
    pub async fn post(
        &self,
        url: &str,
        content_type: &str,
        body: impl Into<RequestBody>,
    ) -> Result<Response> {
        let mut envelope = RequestEnvelope::new(Method::POST, url, Some(body.into()))?
            .try_header("content-type", content_type)?;
        self.execute(&mut envelope).await
    }

    /// Sends a POST request with a urlencoded form body.
    pub async fn post_form<F: Serialize + ?Sized>(&self, url: &str, form: &F) -> Result<Response> {
        let encoded =
            serde_urlencoded::to_string(form).map_err(|err| RetryHttpError::Encode(err.to_string()))?;
        self.post(url, "application/x-www-form-urlencoded", encoded)
            .await
    }

    /// Sends a POST request with a JSON body.
    pub async fn post_json<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> Result<Response> {
        let encoded =
            serde_json::to_vec(body).map_err(|err| RetryHttpError::Encode(err.to_string()))?;
        self.post(url, "application/json", encoded).await
    }

    /// Sends `envelope`, retrying per the configured policy.
    ///
    /// On success the response is returned with its body unread. The
    /// envelope's metrics are updated in place.
    pub async fn execute(&self, envelope: &mut RequestEnvelope) -> Result<Response> {
        let timeout = self.options.timeout();
        let overall_deadline = timeout.and_then(|t| tokio::time::Instant::now().checked_add(t));
        let ctx = envelope.context().clone();
        let mut attempt = 0usize;

        let last = loop {
            let request = match envelope.build_attempt(timeout).await {
                Ok(request) => request,
                Err(err) => {
                    self.close_idle_connections();
                    return Err(err);
                }
            };

            if let Some(hook) = &self.request_log_hook {
                hook(&request, attempt);
            }

            let outcome = tokio::select! {
                biased;
                result = self.transport.send(request) => result,
                _ = ctx.done() => Err(TransportError::new(
                    TransportErrorKind::Cancelled,
                    "request cancelled while in flight",
                )),
            };

            let decision = match &outcome {
                Ok(response) => self.retry_policy.check(&ctx, Some(response), None),
                Err(err) => self.retry_policy.check(&ctx, None, Some(err)),
            };

            match &outcome {
                Err(_) => envelope.metrics.failures += 1,
                Ok(response) => {
                    if let Some(hook) = &self.response_log_hook {
                        hook(response);
                    }
                }
            }

            let outcome = match decision {
                RetryDecision::Stop => {
                    self.close_idle_connections();
                    return outcome.map_err(RetryHttpError::from);
                }
                RetryDecision::Abort(err) => {
                    self.close_idle_connections();
                    return Err(err);
                }
                RetryDecision::Retry => outcome.map_err(RetryHttpError::from),
            };

            if attempt >= self.options.max_retries {
                break outcome;
            }

            envelope.metrics.retries += 1;
            let wait = self.wait_strategy.wait(
                self.options.retry_wait_min(),
                self.options.retry_wait_max(),
                attempt,
                outcome.as_ref().ok(),
            );

            // The drained response is gone; a budget that runs out during the
            // wait finalizes with its status instead.
            let outcome = match outcome {
                Ok(response) => {
                    let status = response.status();
                    drain_response(
                        response,
                        self.options.response_drain_limit,
                        &mut envelope.metrics,
                    )
                    .await;
                    Err(RetryHttpError::Status(status))
                }
                Err(err) => Err(err),
            };

            #[cfg(feature = "tracing")]
            tracing::debug!(
                method = %envelope.method(),
                url = %envelope.url(),
                attempt,
                wait_ms = wait.as_millis() as u64,
                "retrying request"
            );

            tokio::select! {
                biased;
                err = ctx.done() => {
                    self.close_idle_connections();
                    return Err(err);
                }
                _ = sleep_until_deadline(overall_deadline) => break outcome,
                _ = tokio::time::sleep(wait) => {}
            }

            attempt += 1;
        };

        self.give_up(envelope, last)
    }

    fn give_up(&self, envelope: &RequestEnvelope, last: Result<Response>) -> Result<Response> {
        let attempts = self.options.total_attempts();
        self.close_idle_connections();

        if let Some(handler) = &self.error_handler {
            return handler(last, attempts);
        }

        // Dropping the response here closes its body.
        let cause = match last {
            Ok(response) => RetryHttpError::Status(response.status()),
            Err(err) => err,
        };

        #[cfg(feature = "tracing")]
        tracing::warn!(
            method = %envelope.method(),
            url = %envelope.url(),
            attempts,
            error = %cause,
            "giving up on request"
        );

        Err(RetryHttpError::GaveUp {
            method: envelope.method().clone(),
            url: envelope.url().clone(),
            attempts,
            cause: Box::new(cause),
        })
    }

    fn close_idle_connections(&self) {
        if self.options.kill_idle_connections {
            self.transport.close_idle_connections();
        }
    }
}

/// Reads and drops a response body nobody will look at, so its connection
/// can return to the pool.
///
/// At most `limit` bytes are read. A failed read counts toward
/// `metrics.drain_errors` and is otherwise ignored.
pub async fn drain_response(mut response: Response, limit: u64, metrics: &mut Metrics) {
    let mut remaining = limit;
    while remaining > 0 {
        match response.chunk().await {
            Ok(Some(chunk)) => remaining = remaining.saturating_sub(chunk.len() as u64),
            Ok(None) => break,
            Err(_err) => {
                metrics.drain_errors += 1;
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %_err, "failed to drain discarded response body");
                break;
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
