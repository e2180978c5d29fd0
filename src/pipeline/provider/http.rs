//! Blocking HTTP plumbing shared by the remote providers.

use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;

use super::ProviderError;

/// Error bodies are cut to this length before they land in messages.
const MAX_ERROR_BODY_CHARS: usize = 300;

pub fn build_client(timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::Unavailable(format!("HTTP client setup failed: {e}")))
}

/// Send a request and return the body of a successful response.
pub fn send(request: RequestBuilder, service: &str, timeout: Duration) -> Result<String, ProviderError> {
    let response = request
        .send()
        .map_err(|e| map_transport_error(&e, service, timeout))?;

    let status = response.status();
    let retry_after = parse_retry_after(response.headers());
    let body = response
        .text()
        .map_err(|e| map_transport_error(&e, service, timeout))?;

    if !status.is_success() {
        return Err(classify_status(status, retry_after, &body, service));
    }
    Ok(body)
}

/// Map an HTTP failure status onto the provider failure taxonomy.
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
    service: &str,
) -> ProviderError {
    let detail = format!("{service} returned {}: {}", status.as_u16(), snippet(body));
    match status.as_u16() {
        401 | 403 => ProviderError::Auth(detail),
        429 => ProviderError::RateLimited { retry_after },
        408 | 504 => ProviderError::Timeout(detail),
        400 | 413 | 415 | 422 => ProviderError::UnsupportedInput(detail),
        _ => ProviderError::Unavailable(detail),
    }
}

pub fn map_transport_error(err: &reqwest::Error, service: &str, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(format!("{service} did not answer within {}s", timeout.as_secs()))
    } else if err.is_connect() {
        ProviderError::Unavailable(format!("{service} is not reachable"))
    } else if err.is_decode() {
        ProviderError::MalformedResponse(format!("{service} body could not be read: {err}"))
    } else {
        ProviderError::Unavailable(format!("{service} request failed: {err}"))
    }
}

/// `Retry-After` in its delta-seconds form. HTTP dates are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
