//! JSON-over-HTTP calls with retry and exponential backoff.
//!
//! Shared by the embedding and language model providers:
//! - HTTP 429 and 5xx are retried
//! - other 4xx fail immediately
//! - network errors are retried
//! - backoff is 1s, 2s, 4s, ... capped at 32s

use reqwest::RequestBuilder;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("{service} API error {status}: {body}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },
    #[error("{service} connection error: {source}")]
    Transport {
        service: String,
        #[source]
        source: reqwest::Error,
    },
}

impl HttpError {
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            HttpError::Transport { .. } => None,
        }
    }
}

fn retryable(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

pub fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt.saturating_sub(1)).min(5))
}

/// Send the request built by `make` until it succeeds or retries run out.
///
/// `make` is called once per attempt because a `RequestBuilder` is consumed
/// by `send`.
pub async fn send_json<F>(
    service: &str,
    max_retries: u32,
    mut make: F,
) -> Result<serde_json::Value, HttpError>
where
    F: FnMut() -> RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = backoff(attempt);
            tracing::debug!("{} retry {} in {:?}", service, attempt, delay);
            tokio::time::sleep(delay).await;
        }

        match make().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response.json().await.map_err(|e| HttpError::Transport {
                        service: service.to_string(),
                        source: e,
                    });
                }

                let body = response.text().await.unwrap_or_default();
                let err = HttpError::Status {
                    service: service.to_string(),
                    status: status.as_u16(),
                    body,
                };
                if !retryable(status) {
                    return Err(err);
                }
                tracing::warn!("{}", err);
                last_err = Some(err);
            }
            Err(e) => {
                tracing::warn!("{} request failed: {}", service, e);
                last_err = Some(HttpError::Transport {
                    service: service.to_string(),
                    source: e,
                });
            }
        }
    }

    // The loop runs at least once, so an error has been recorded.
    Err(last_err.unwrap_or_else(|| HttpError::Status {
        service: service.to_string(),
        status: 0,
        body: "no attempts made".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::{routing::post, Json, Router};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Local endpoint that answers `failures` times with `status`, then 200.
    async fn flaky_endpoint(failures: usize, status: StatusCode) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/v1/embed",
            post(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < failures {
                        (status, Json(json!({"error": "busy"})))
                    } else {
                        (StatusCode::OK, Json(json!({"ok": true})))
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/v1/embed", addr), hits)
    }

    #[tokio::test]
    async fn server_error_is_retried_until_success() {
        let (url, hits) = flaky_endpoint(1, StatusCode::SERVICE_UNAVAILABLE).await;
        let client = reqwest::Client::new();
        let value: Value = send_json("test", 2, || client.post(&url).json(&json!({})))
            .await
            .unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_error_fails_without_retry() {
        let (url, hits) = flaky_endpoint(usize::MAX, StatusCode::BAD_REQUEST).await;
        let client = reqwest::Client::new();
        let err = send_json("test", 3, || client.post(&url).json(&json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn last_error_is_returned_when_retries_run_out() {
        let (url, hits) = flaky_endpoint(usize::MAX, StatusCode::TOO_MANY_REQUESTS).await;
        let client = reqwest::Client::new();
        let err = send_json("test", 0, || client.post(&url).json(&json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(429));
        assert!(err.to_string().contains("busy"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(2));
        assert_eq!(backoff(4), Duration::from_secs(8));
        assert_eq!(backoff(10), Duration::from_secs(32));
    }

    #[test]
    fn only_rate_limits_and_server_errors_retry() {
        assert!(retryable(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(retryable(reqwest::StatusCode::BAD_GATEWAY));
        assert!(!retryable(reqwest::StatusCode::UNAUTHORIZED));
    }
}
