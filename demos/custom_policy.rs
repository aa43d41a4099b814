use std::time::Duration;

use reqwest::{Method, Response};
use retry_http::{
    ClientOptions, ExponentialJitter, RequestBody, RequestContext, RequestEnvelope, RetryClient,
    RetryDecision, TransportError,
};

/// Retries 429 and 5xx responses on top of transport failures.
fn retry_on_overload(
    ctx: &RequestContext,
    response: Option<&Response>,
    error: Option<&TransportError>,
) -> RetryDecision {
    if let Some(err) = ctx.err() {
        return RetryDecision::Abort(err);
    }
    match (response, error) {
        (Some(response), _) => {
            let status = response.status();
            if status.as_u16() == 429 || status.is_server_error() {
                RetryDecision::Retry
            } else {
                RetryDecision::Stop
            }
        }
        (None, Some(err)) if retry_http::is_permanent(err.kind()) => RetryDecision::Stop,
        (None, Some(_)) => RetryDecision::Retry,
        (None, None) => RetryDecision::Stop,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let url = std::env::var("RETRY_HTTP_URL")
        .unwrap_or_else(|_| "https://httpbin.org/status/503".to_owned());

    let client = RetryClient::new(ClientOptions::host_spraying())?
        .with_retry_policy(retry_on_overload)
        .with_wait_strategy(ExponentialJitter::new())
        .with_request_log_hook(|request, attempt| {
            eprintln!("attempt {attempt}: {} {}", request.method(), request.url());
        });

    let mut envelope = RequestEnvelope::new(
        Method::POST,
        &url,
        Some(RequestBody::from(r#"{"job":"reindex"}"#)),
    )?
    .try_header("content-type", "application/json")?
    .with_timeout(Duration::from_secs(60));

    match client.execute(&mut envelope).await {
        Ok(response) => println!("finished with {}", response.status()),
        Err(err) => eprintln!("failed: {err}"),
    }
    println!("{:?}", envelope.metrics);

    Ok(())
}
