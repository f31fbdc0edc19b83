use std::borrow::Cow;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::RetryTransientMiddleware;
use reqwest_retry::policies::ExponentialBackoff;

use crate::error::PubTrialsError;
use crate::sources::rate_limit::{RateLimiter, Throttle};

pub mod pubmed;
pub mod rate_limit;

const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;
const BODY_EXCERPT_CHARS: usize = 200;
const MAX_RETRIES: u32 = 3;

pub(crate) fn user_agent() -> &'static str {
    concat!("pubtrials/", env!("CARGO_PKG_VERSION"))
}

fn http_client() -> Result<reqwest::Client, PubTrialsError> {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

    if let Some(client) = CLIENT.get() {
        return Ok(client.clone());
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .user_agent(user_agent())
        .build()
        .map_err(PubTrialsError::HttpClientInit)?;

    Ok(CLIENT.get_or_init(|| client).clone())
}

/// Client with transient-failure retries (5xx, 429, connect errors) wrapped around `limiter`.
///
/// Middleware runs in registration order, so every retry attempt waits for its own slot.
pub(crate) fn throttled_client(
    limiter: Arc<RateLimiter>,
) -> Result<ClientWithMiddleware, PubTrialsError> {
    let retry_policy = ExponentialBackoff::builder()
        .retry_bounds(Duration::from_millis(200), Duration::from_secs(5))
        .build_with_max_retries(MAX_RETRIES);
    Ok(ClientBuilder::new(http_client()?)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .with(Throttle(limiter))
        .build())
}

pub(crate) fn env_base(default: &'static str, env: &str) -> Cow<'static, str> {
    match std::env::var(env) {
        Ok(value) if !value.trim().is_empty() => Cow::Owned(value.trim().to_string()),
        _ => Cow::Borrowed(default),
    }
}

pub(crate) async fn read_limited_body(
    mut resp: reqwest::Response,
    api: &str,
) -> Result<Vec<u8>, PubTrialsError> {
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        if body.len() + chunk.len() > MAX_BODY_BYTES {
            return Err(PubTrialsError::Api {
                api: api.to_string(),
                message: format!("Response body exceeds {MAX_BODY_BYTES} bytes"),
            });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

pub(crate) fn body_excerpt(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= BODY_EXCERPT_CHARS {
        return collapsed;
    }
    let mut excerpt = collapsed.chars().take(BODY_EXCERPT_CHARS).collect::<String>();
    excerpt.push_str("...");
    excerpt
}
