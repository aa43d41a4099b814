use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use reqwest::{Body, Method, Request, Url};
use tokio_util::sync::CancellationToken;

use crate::{Result, RetryHttpError};

/// Per-request cancellation signal: a token plus an optional deadline.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(token: CancellationToken, deadline: Option<Instant>) -> Self {
        Self { token, deadline }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the cancellation error once the token fired or the deadline passed.
    pub fn err(&self) -> Option<RetryHttpError> {
        if self.token.is_cancelled() {
            return Some(RetryHttpError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(RetryHttpError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves with the cancellation error when the token fires or the deadline passes.
    pub async fn done(&self) -> RetryHttpError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => RetryHttpError::Cancelled,
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                        RetryHttpError::DeadlineExceeded
                    }
                }
            }
            None => {
                self.token.cancelled().await;
                RetryHttpError::Cancelled
            }
        }
    }
}

type BodyFactory = dyn Fn() -> io::Result<Box<dyn Read + Send>> + Send + Sync;

#[derive(Clone)]
enum BodySource {
    Buffered(Bytes),
    Replay(Arc<BodyFactory>),
}

/// Request body that can be produced again, identically, for every attempt.
#[derive(Clone)]
pub struct RequestBody {
    source: BodySource,
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            BodySource::Buffered(bytes) => f
                .debug_struct("RequestBody")
                .field("buffered_len", &bytes.len())
                .finish(),
            BodySource::Replay(_) => f
                .debug_struct("RequestBody")
                .field("replay", &"<factory>")
                .finish(),
        }
    }
}

impl RequestBody {
    /// Reads `reader` to the end now, so later attempts replay from memory.
    ///
    /// A read failure is reported here, before any attempt is made.
    pub fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut buffer = Vec::new();
        reader
            .read_to_end(&mut buffer)
            .map_err(RetryHttpError::Body)?;
        Ok(Self::from(buffer))
    }

    /// Uses `factory` to open a fresh reader for every attempt.
    ///
    /// Each reader must yield the same bytes. The content length is unknown
    /// up front.
    pub fn replayable<F, R>(factory: F) -> Self
    where
        F: Fn() -> io::Result<R> + Send + Sync + 'static,
        R: Read + Send + 'static,
    {
        let factory: Arc<BodyFactory> =
            Arc::new(move || factory().map(|reader| Box::new(reader) as Box<dyn Read + Send>));
        Self {
            source: BodySource::Replay(factory),
        }
    }

    /// Known size of the body, available for buffered bodies only.
    pub fn content_length(&self) -> Option<u64> {
        match &self.source {
            BodySource::Buffered(bytes) => Some(bytes.len() as u64),
            BodySource::Replay(_) => None,
        }
    }

    /// Produces a fresh, fully rewound copy of the body.
    ///
    /// For replayable bodies this calls the factory and reads its reader to
    /// the end on the current thread.
    pub fn open(&self) -> Result<Bytes> {
        match &self.source {
            BodySource::Buffered(bytes) => Ok(bytes.clone()),
            BodySource::Replay(factory) => {
                let mut reader = factory().map_err(RetryHttpError::Body)?;
                let mut buffer = Vec::new();
                reader
                    .read_to_end(&mut buffer)
                    .map_err(RetryHttpError::Body)?;
                Ok(Bytes::from(buffer))
            }
        }
    }

    /// Like [`RequestBody::open`], but replay factories run on the blocking
    /// pool so slow readers do not stall the runtime.
    pub(crate) async fn open_for_attempt(&self) -> Result<Bytes> {
        match &self.source {
            BodySource::Buffered(bytes) => Ok(bytes.clone()),
            BodySource::Replay(_) => {
                let body = self.clone();
                tokio::task::spawn_blocking(move || body.open())
                    .await
                    .map_err(|err| RetryHttpError::Body(io::Error::new(io::ErrorKind::Other, err)))?
            }
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self {
            source: BodySource::Buffered(bytes),
        }
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<&'static [u8]> for RequestBody {
    fn from(bytes: &'static [u8]) -> Self {
        Bytes::from_static(bytes).into()
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        Bytes::from(text).into()
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        Bytes::from_static(text.as_bytes()).into()
    }
}

/// Counters updated while a request is being executed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Metrics {
    /// Attempts that ended in a transport error.
    pub failures: usize,
    /// Attempts scheduled after the first one.
    pub retries: usize,
    /// Discarded response bodies that could not be read to the drain limit.
    pub drain_errors: usize,
}

/// Outbound request plus everything needed to send it again.
#[derive(Debug)]
pub struct RequestEnvelope {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<RequestBody>,
    context: RequestContext,
    pub metrics: Metrics,
}

impl RequestEnvelope {
    pub fn new(method: Method, url: &str, body: Option<RequestBody>) -> Result<Self> {
        let url = Url::parse(url).map_err(|err| RetryHttpError::InvalidUrl(format!("{url}: {err}")))?;
        Ok(Self {
            method,
            url,
            headers: HeaderMap::new(),
            body,
            context: RequestContext::default(),
            metrics: Metrics::default(),
        })
    }

    /// Wraps an existing `reqwest::Request`.
    ///
    /// Streaming bodies cannot be replayed and are rejected here.
    pub fn from_request(request: Request) -> Result<Self> {
        let body = match request.body() {
            None => None,
            Some(body) => match body.as_bytes() {
                Some(bytes) => Some(RequestBody::from(Bytes::copy_from_slice(bytes))),
                None => {
                    return Err(RetryHttpError::NotReplayable(format!(
                        "{} {} carries a streaming body",
                        request.method(),
                        request.url()
                    )))
                }
            },
        };
        Ok(Self {
            method: request.method().clone(),
            url: request.url().clone(),
            headers: request.headers().clone(),
            body,
            context: RequestContext::default(),
            metrics: Metrics::default(),
        })
    }

    /// Sets a header, replacing earlier values for the same name.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Parses and sets a header from strings.
    pub fn try_header(self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| RetryHttpError::InvalidHeader(format!("{name}: {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| RetryHttpError::InvalidHeader(format!("{}: {err}", name.as_str())))?;
        Ok(self.header(name, value))
    }

    /// Attaches a token that aborts the call when cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.context = RequestContext::new(token, self.context.deadline());
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.context = RequestContext::new(self.context.token().clone(), Some(deadline));
        self
    }

    /// Deadline relative to now. Durations too large to represent are ignored.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn content_length(&self) -> Option<u64> {
        self.body.as_ref().and_then(RequestBody::content_length)
    }

    /// Reads the full body once, e.g. for hashing or diagnostics.
    pub fn body_bytes(&self) -> Result<Option<Bytes>> {
        self.body.as_ref().map(RequestBody::open).transpose()
    }

    /// Builds the request for one attempt with a freshly replayed body.
    pub(crate) async fn build_attempt(&self, timeout: Option<Duration>) -> Result<Request> {
        let mut request = Request::new(self.method.clone(), self.url.clone());
        *request.headers_mut() = self.headers.clone();
        if let Some(body) = &self.body {
            let bytes = body.open_for_attempt().await?;
            if let Some(length) = body.content_length() {
                request
                    .headers_mut()
                    .insert(CONTENT_LENGTH, HeaderValue::from(length));
            }
            *request.body_mut() = Some(Body::from(bytes));
        }
        *request.timeout_mut() = timeout;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor, Read};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
    use reqwest::Method;
    use tokio_util::sync::CancellationToken;

    use super::{RequestBody, RequestContext, RequestEnvelope};
    use crate::RetryHttpError;

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "source gone"))
        }
    }

    #[test]
    fn reader_bodies_are_buffered_eagerly() {
        let body = RequestBody::from_reader(Cursor::new(b"0123456789".to_vec()))
            .expect("cursor must read");
        assert_eq!(body.content_length(), Some(10));
        assert_eq!(body.open().expect("open")[..], b"0123456789"[..]);
        assert_eq!(body.open().expect("open again")[..], b"0123456789"[..]);
    }

    #[test]
    fn unreadable_source_fails_at_construction() {
        let err = RequestBody::from_reader(FailingReader).expect_err("must fail");
        assert!(matches!(err, RetryHttpError::Body(_)));
    }

    #[test]
    fn replayable_factory_is_opened_per_use() {
        let opens = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opens);
        let body = RequestBody::replayable(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Cursor::new("test body"))
        });

        assert_eq!(body.content_length(), None);
        for _ in 0..3 {
            assert_eq!(body.open().expect("open")[..], b"test body"[..]);
        }
        assert_eq!(opens.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn envelope_rejects_bad_urls() {
        let err = RequestEnvelope::new(Method::GET, "not a url", None).expect_err("must fail");
        assert!(matches!(err, RetryHttpError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn attempt_carries_body_length_and_timeout() {
        let envelope = RequestEnvelope::new(
            Method::POST,
            "http://localhost/upload",
            Some(RequestBody::from("0123456789")),
        )
        .expect("valid envelope")
        .try_header("content-type", "text/plain")
        .expect("valid header");

        let request = envelope
            .build_attempt(Some(Duration::from_secs(2)))
            .await
            .expect("attempt must build");
        assert_eq!(request.headers()[CONTENT_LENGTH], "10");
        assert_eq!(request.headers()[CONTENT_TYPE], "text/plain");
        assert_eq!(request.timeout(), Some(&Duration::from_secs(2)));
        assert_eq!(
            request.body().and_then(|body| body.as_bytes()),
            Some(&b"0123456789"[..])
        );
        assert_eq!(envelope.body_bytes().expect("bytes").as_deref(), Some(&b"0123456789"[..]));
    }

    #[tokio::test]
    async fn replayed_attempts_read_the_factory_off_the_runtime() {
        let opened_on = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = Arc::clone(&opened_on);
        let body = RequestBody::replayable(move || {
            log.lock()
                .expect("thread log mutex must not be poisoned")
                .push(std::thread::current().id());
            Ok(Cursor::new("spooled"))
        });
        let envelope = RequestEnvelope::new(Method::POST, "http://localhost/spool", Some(body))
            .expect("valid envelope");

        for _ in 0..2 {
            let request = envelope.build_attempt(None).await.expect("attempt must build");
            assert_eq!(
                request.body().and_then(|body| body.as_bytes()),
                Some(&b"spooled"[..])
            );
            assert!(request.headers().get(CONTENT_LENGTH).is_none());
        }

        let threads = opened_on
            .lock()
            .expect("thread log mutex must not be poisoned")
            .clone();
        assert_eq!(threads.len(), 2);
        assert!(threads.iter().all(|id| *id != std::thread::current().id()));
    }

    #[test]
    fn from_request_keeps_buffered_body() {
        let mut request = reqwest::Request::new(
            Method::PUT,
            "http://localhost/item".parse().expect("valid url"),
        );
        *request.body_mut() = Some(reqwest::Body::from("payload"));

        let envelope = RequestEnvelope::from_request(request).expect("buffered body replays");
        assert_eq!(*envelope.method(), Method::PUT);
        assert_eq!(envelope.content_length(), Some(7));
    }

    #[tokio::test]
    async fn context_done_reports_cancellation() {
        let token = CancellationToken::new();
        let ctx = RequestContext::new(token.clone(), None);
        assert!(ctx.err().is_none());

        let waiter = tokio::spawn(async move { ctx.done().await });
        token.cancel();
        let err = waiter.await.expect("task must finish");
        assert!(matches!(err, RetryHttpError::Cancelled));
    }

    #[tokio::test]
    async fn context_done_reports_deadline() {
        let envelope = RequestEnvelope::new(Method::GET, "http://localhost/", None)
            .expect("valid envelope")
            .with_timeout(Duration::from_millis(20));
        let err = envelope.context().done().await;
        assert!(matches!(err, RetryHttpError::DeadlineExceeded));
        assert!(envelope.context().err().is_some());
    }
}
