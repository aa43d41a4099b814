use retry_http::{ClientOptions, RetryClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let url = std::env::var("RETRY_HTTP_URL").unwrap_or_else(|_| "https://example.com".to_owned());

    let client = RetryClient::new(ClientOptions {
        max_retries: 3,
        retry_wait_min_ms: 200,
        retry_wait_max_ms: 2_000,
        ..ClientOptions::default()
    })?;

    let response = client.get(&url).await?;
    println!("{} {}", response.status(), url);
    println!("{}", response.text().await?);

    Ok(())
}
