use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tracing::warn;

use super::types::{ProviderError, Result};
use crate::config::RetryConfig;

/// Exponential backoff for `attempt` (0-based), capped at `max_delay_ms`.
pub(crate) fn backoff_delay(policy: &RetryConfig, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(20);
    let millis = policy.base_delay_ms.saturating_mul(factor).min(policy.max_delay_ms);
    Duration::from_millis(millis)
}

/// Delay before the next attempt.
///
/// A numeric `Retry-After` header wins over exponential backoff; either way the
/// wait never exceeds `max_delay_ms`.
fn retry_delay(headers: &reqwest::header::HeaderMap, attempt: u32, policy: &RetryConfig) -> Duration {
    let ceiling = Duration::from_millis(policy.max_delay_ms);
    if let Some(secs) = headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|val| val.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
    {
        return Duration::from_secs(secs).min(ceiling);
    }
    backoff_delay(policy, attempt)
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_transient(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout()
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Pulls `error.message` out of an OpenAI-style error body, or returns the raw body.
pub(crate) fn api_error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => envelope.error.message,
        Err(_) if body.trim().is_empty() => "empty response body".to_string(),
        Err(_) => body.chars().take(500).collect(),
    }
}

/// Send an HTTP request, retrying transient failures with backoff.
///
/// Retries on 429, 5xx, connect errors and timeouts, up to `policy.max_retries`
/// extra attempts. `f` must build and send a fresh request each call. A
/// successful response is returned unread so the caller can stream it; any
/// other non-success status becomes [`ProviderError::Api`] immediately.
pub(crate) async fn send_with_retry<F, Fut>(
    provider_name: &str,
    policy: &RetryConfig,
    mut f: F,
) -> Result<reqwest::Response>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
{
    let mut attempt = 0u32;

    loop {
        match f().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response);
                }

                if is_retryable_status(status) {
                    if attempt >= policy.max_retries {
                        if status == StatusCode::TOO_MANY_REQUESTS {
                            return Err(ProviderError::RateLimited {
                                attempts: attempt + 1,
                            });
                        }
                    } else {
                        let delay = retry_delay(response.headers(), attempt, policy);
                        warn!(
                            provider = provider_name,
                            status = status.as_u16(),
                            attempt = attempt + 1,
                            max_retries = policy.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            "Transient API failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                }

                let body = response.text().await.unwrap_or_default();
                return Err(ProviderError::Api {
                    status: status.as_u16(),
                    message: api_error_message(&body),
                });
            }
            Err(e) if is_transient(&e) && attempt < policy.max_retries => {
                let delay = backoff_delay(policy, attempt);
                warn!(
                    provider = provider_name,
                    error = %e,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    "Request failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(ProviderError::Request(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    async fn get(client: &reqwest::Client, url: &str, policy: &RetryConfig) -> Result<reqwest::Response> {
        send_with_retry("test", policy, || client.get(url).send()).await
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryConfig {
            max_retries: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        assert_eq!(backoff_delay(&policy, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(&policy, 4), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(&policy, 63), Duration::from_millis(1_000));
    }

    #[test]
    fn retry_after_is_capped_by_max_delay() {
        use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

        let policy = RetryConfig {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        };
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3600"));
        assert_eq!(retry_delay(&headers, 0, &policy), Duration::from_millis(2_000));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("1"));
        assert_eq!(retry_delay(&headers, 0, &policy), Duration::from_secs(1));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"));
        assert_eq!(retry_delay(&headers, 1, &policy), Duration::from_millis(200));
    }

    #[test]
    fn api_error_message_prefers_openai_shape() {
        let body = r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#;
        assert_eq!(api_error_message(body), "Incorrect API key provided");
        assert_eq!(api_error_message("upstream exploded"), "upstream exploded");
        assert_eq!(api_error_message(""), "empty response body");
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let response = get(&client, &format!("{}/ok", server.uri()), &fast_policy(3))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn succeeds_after_one_429() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let response = get(&client, &format!("{}/flaky", server.uri()), &fast_policy(2))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let response = get(&client, &format!("{}/busy", server.uri()), &fast_policy(3))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn exhausted_429_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .expect(2)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = get(&client, &format!("{}/limited", server.uri()), &fast_policy(1)).await;
        assert!(
            matches!(result, Err(ProviderError::RateLimited { attempts: 2 })),
            "expected RateLimited, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bad"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_string(r#"{"error":{"message":"Invalid API key"}}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = get(&client, &format!("{}/bad", server.uri()), &fast_policy(3)).await;
        match result {
            Err(ProviderError::Api { status, message }) => {
                assert_eq!(status, 401);
                assert_eq!(message, "Invalid API key");
            }
            other => panic!("expected Api error, got: {other:?}"),
        }
    }
}
