use anyhow::{anyhow, Context, Result};
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, StatusCode};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

pub(crate) const RATE_LIMIT_MAX_RETRIES: usize = 5;
pub(crate) const RATE_LIMIT_BASE_DELAY: Duration = Duration::from_secs(2);
pub(crate) const RATE_LIMIT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Sends the request built by `build`, retrying with exponential backoff
/// while the provider reports rate limiting. Returns the success body.
pub(crate) async fn send_with_backoff<F>(
    provider: &str,
    mut build: F,
    describe_error: fn(&str) -> Option<String>,
) -> Result<String>
where
    F: FnMut() -> RequestBuilder,
{
    let mut attempt = 0usize;
    let mut delay = RATE_LIMIT_BASE_DELAY;
    loop {
        attempt += 1;
        let response = build()
            .send()
            .await
            .with_context(|| format!("{} request failed", provider))?;

        let status = response.status();
        let retry_after = retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();
        if status.is_success() {
            debug!("{} responded after {} attempt(s)", provider, attempt);
            return Ok(text);
        }
        if is_rate_limited(status, &text) && attempt < RATE_LIMIT_MAX_RETRIES {
            delay = wait_with_backoff(provider, attempt, delay, retry_after).await;
            continue;
        }
        return Err(anyhow!(
            "{} API error ({}): {}",
            provider,
            status,
            describe_error(&text).unwrap_or(text)
        ));
    }
}

pub(crate) fn is_rate_limited(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    let code = status.as_u16();
    if code == 529 || code == 503 {
        return true;
    }
    let lower = body.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
        || lower.contains("resource_exhausted")
        || lower.contains("quota")
        || lower.contains("overloaded")
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?.trim();
    value.parse::<u64>().ok().map(Duration::from_secs)
}

async fn wait_with_backoff(
    provider: &str,
    attempt: usize,
    delay: Duration,
    retry_after: Option<Duration>,
) -> Duration {
    let wait = retry_after.map_or(delay, |hint| hint.max(delay));
    warn!(
        "{} rate limited; retrying in {:.1}s (attempt {}/{})",
        provider,
        wait.as_secs_f32(),
        attempt,
        RATE_LIMIT_MAX_RETRIES
    );
    sleep(wait).await;
    next_delay(delay)
}

pub(crate) fn next_delay(current: Duration) -> Duration {
    let next_secs = current
        .as_secs()
        .saturating_mul(2)
        .max(RATE_LIMIT_BASE_DELAY.as_secs());
    Duration::from_secs(next_secs).min(RATE_LIMIT_MAX_DELAY)
}

/// Joins the non-empty parts of a provider error body.
pub(crate) fn format_error_parts(
    message: Option<String>,
    kind: Option<String>,
    code: Option<String>,
) -> String {
    let parts = [
        message,
        kind.map(|value| format!("type: {}", value)),
        code.map(|value| format!("code: {}", value)),
    ]
    .into_iter()
    .flatten()
    .filter(|part| !part.trim().is_empty() && !part.ends_with(": "))
    .collect::<Vec<_>>();
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(" | ")
    }
}
