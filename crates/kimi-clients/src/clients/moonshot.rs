use std::time::Instant;

use async_trait::async_trait;
use kimi_core::{ApiRequest, KimiCredentials, KimiError, MoonshotApi};
use reqwest::Client;
use serde_json::Value;
use tracing::{Instrument, info, info_span};

use crate::HttpRuntime;

const MODELS_PATH: &str = "models";

/// Moonshot REST transport over reqwest.
pub struct MoonshotClient {
    runtime: HttpRuntime,
}

impl MoonshotClient {
    pub fn new(
        api_key: Option<String>,
        http_client: Option<Client>,
        timeout_seconds: u64,
        max_inflight: Option<usize>,
    ) -> Self {
        Self { runtime: HttpRuntime::new(api_key, http_client, timeout_seconds, max_inflight) }
    }

    pub fn for_credentials(
        credentials: &KimiCredentials,
        timeout_seconds: u64,
        max_inflight: Option<usize>,
    ) -> Self {
        Self::new(
            Some(credentials.api_key().to_string()),
            HttpRuntime::build_http_client(timeout_seconds),
            timeout_seconds,
            max_inflight,
        )
    }
}

#[async_trait]
impl MoonshotApi for MoonshotClient {
    async fn chat_completions(&self, request: ApiRequest<'_>) -> Result<Value, KimiError> {
        let url = HttpRuntime::build_url(request.base_url, request.path)?;
        let span = info_span!(
            "provider_request",
            method = "POST",
            path = request.path,
            model = %request.payload.model
        );

        async {
            let started = Instant::now();
            info!(
                event = "provider.request.started",
                url = %url,
                messages = request.payload.messages.len(),
                timeout_ms = request.timeout.map(|t| t.as_millis() as u64)
            );
            let result = self.runtime.post_json(&url, request.payload, request.timeout).await;
            info!(
                event = "provider.request.finished",
                ok = result.is_ok(),
                elapsed_ms = started.elapsed().as_millis() as u64
            );
            result
        }
        .instrument(span)
        .await
    }

    async fn list_models(&self, base_url: &str) -> Result<Value, KimiError> {
        let url = HttpRuntime::build_url(base_url, MODELS_PATH)?;
        let span = info_span!("provider_request", method = "GET", path = MODELS_PATH);
        async {
            info!(event = "provider.request.started", url = %url);
            self.runtime.get_json(&url).await
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kimi_contracts::{ChatCompletionPayload, ChatMessage, PayloadMessage, Role};
    use mockito::Matcher;
    use serde_json::json;

    use super::*;

    fn client(api_key: &str) -> MoonshotClient {
        MoonshotClient::new(Some(api_key.to_string()), HttpRuntime::build_http_client(5), 5, None)
    }

    fn payload() -> ChatCompletionPayload {
        ChatCompletionPayload::new(
            "moonshot-v1-8k",
            vec![PayloadMessage::Typed(ChatMessage::text(Role::User, "hi"))],
        )
    }

    #[tokio::test]
    async fn chat_completions_posts_payload_with_bearer_auth() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({
                "model": "moonshot-v1-8k",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"cmpl-1","choices":[{"message":{"content":"hello"}}]}"#)
            .create_async()
            .await;

        let base_url = format!("{}/v1/", server.url());
        let payload = payload();
        let body = client("sk-test")
            .chat_completions(ApiRequest {
                base_url: &base_url,
                path: "chat/completions",
                payload: &payload,
                timeout: None,
            })
            .await
            .expect("request must succeed");

        mock.assert_async().await;
        assert_eq!(body["choices"][0]["message"]["content"], "hello");
    }

    #[tokio::test]
    async fn error_status_keeps_api_error_and_headers() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(401)
            .with_header("content-type", "application/json")
            .with_header("x-request-id", "req-42")
            .with_body(
                json!({
                    "error": {
                        "message": "Invalid Authentication",
                        "type": "invalid_authentication_error"
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let base_url = format!("{}/v1", server.url());
        let payload = payload();
        let error = client("sk-bad")
            .chat_completions(ApiRequest {
                base_url: &base_url,
                path: "chat/completions",
                payload: &payload,
                timeout: None,
            })
            .await
            .expect_err("request must fail");

        let KimiError::Remote(fault) = error else {
            panic!("expected remote fault, got {error:?}");
        };
        assert_eq!(fault.status_code, Some(401));
        assert_eq!(fault.best_message(), "Invalid Authentication");
        assert_eq!(fault.error_type.as_deref(), Some("invalid_authentication_error"));
        assert_eq!(fault.headers.get("x-request-id").map(String::as_str), Some("req-42"));
    }

    #[tokio::test]
    async fn non_json_error_body_falls_back_to_status_message() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/models")
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let error = client("sk-test")
            .list_models(&format!("{}/v1", server.url()))
            .await
            .expect_err("request must fail");
        assert_eq!(error.status_code(), Some(502));
        assert!(error.best_message().starts_with("provider returned error status: 502"));
    }

    #[tokio::test]
    async fn list_models_returns_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/models")
            .match_header("authorization", "Bearer sk-test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"object":"list","data":[{"id":"moonshot-v1-8k"}]}"#)
            .create_async()
            .await;

        let body = client("sk-test")
            .list_models(&format!("{}/v1", server.url()))
            .await
            .expect("request must succeed");
        assert_eq!(body["data"][0]["id"], "moonshot-v1-8k");
    }

    #[tokio::test]
    async fn connection_failure_is_a_remote_fault() {
        let payload = payload();
        let error = client("sk-test")
            .chat_completions(ApiRequest {
                base_url: "http://127.0.0.1:9/v1",
                path: "chat/completions",
                payload: &payload,
                timeout: Some(Duration::from_secs(2)),
            })
            .await
            .expect_err("request must fail");
        assert!(error.is_remote());
    }

    #[tokio::test]
    async fn stalled_response_surfaces_as_timeout() {
        let listener =
            tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("listener must bind");
        let addr = listener.local_addr().expect("listener must have an address");
        let stall = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.expect("connection must arrive");
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let base_url = format!("http://{addr}/v1");
        let payload = payload();
        let error = client("sk-test")
            .chat_completions(ApiRequest {
                base_url: &base_url,
                path: "chat/completions",
                payload: &payload,
                timeout: Some(Duration::from_millis(200)),
            })
            .await
            .expect_err("request must time out");
        stall.abort();

        assert_eq!(error, KimiError::Timeout(Duration::from_millis(200)));
        assert!(error.is_remote());
    }
}
