use std::{collections::BTreeMap, sync::Arc, time::Duration};

use kimi_core::{KimiError, RemoteFault};
use reqwest::{Client, RequestBuilder, Response, header::CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

pub mod clients;

pub use clients::{MockMoonshotClient, MoonshotClient};

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 60;

/// Shared reqwest plumbing: auth, in-flight limit, status and body mapping.
pub struct HttpRuntime {
    api_key: Option<String>,
    http_client: Option<Client>,
    default_timeout: Duration,
    max_inflight: Option<Arc<Semaphore>>,
}

impl HttpRuntime {
    pub fn build_http_client(timeout_seconds: u64) -> Option<Client> {
        Client::builder().timeout(Duration::from_secs(timeout_seconds)).build().ok()
    }

    pub fn new(
        api_key: Option<String>,
        http_client: Option<Client>,
        timeout_seconds: u64,
        max_inflight: Option<usize>,
    ) -> Self {
        Self {
            api_key,
            http_client,
            default_timeout: Duration::from_secs(timeout_seconds),
            max_inflight: max_inflight.map(Semaphore::new).map(Arc::new),
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|v| !v.trim().is_empty())
    }

    pub fn build_url(base_url: &str, path: &str) -> Result<String, KimiError> {
        let base_url = base_url.trim();
        if base_url.is_empty() {
            return Err(KimiError::MissingInput("provider base_url is not configured".to_string()));
        }
        Ok(format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/')))
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        payload: &T,
        timeout: Option<Duration>,
    ) -> Result<Value, KimiError> {
        let client = self.client()?;
        self.send(client.post(url).json(payload), timeout).await
    }

    pub async fn get_json(&self, url: &str) -> Result<Value, KimiError> {
        let client = self.client()?;
        self.send(client.get(url), None).await
    }

    fn client(&self) -> Result<&Client, KimiError> {
        self.http_client
            .as_ref()
            .ok_or_else(|| KimiError::Remote(RemoteFault::new("provider client init failed")))
    }

    fn acquire_permit(&self) -> Result<Option<OwnedSemaphorePermit>, KimiError> {
        self.max_inflight
            .as_ref()
            .map(|semaphore| {
                semaphore.clone().try_acquire_owned().map_err(|_| {
                    KimiError::Remote(RemoteFault::new(
                        "provider overloaded: max in-flight limit reached",
                    ))
                })
            })
            .transpose()
    }

    async fn send(
        &self,
        request: RequestBuilder,
        timeout: Option<Duration>,
    ) -> Result<Value, KimiError> {
        let _permit = self.acquire_permit()?;
        let effective_timeout = timeout.unwrap_or(self.default_timeout);

        let mut request = request.header(CONTENT_TYPE, "application/json");
        if let Some(api_key) = self.api_key() {
            request = request.bearer_auth(api_key);
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                KimiError::Timeout(effective_timeout)
            } else {
                KimiError::Remote(RemoteFault::new(format!("provider request failed: {err}")))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(KimiError::Remote(error_fault(response).await));
        }

        response.json::<Value>().await.map_err(|err| {
            if err.is_timeout() {
                KimiError::Timeout(effective_timeout)
            } else {
                KimiError::Remote(
                    RemoteFault::new(format!("provider response parse failed: {err}"))
                        .with_status(status.as_u16()),
                )
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

async fn error_fault(response: Response) -> RemoteFault {
    let status = response.status();
    let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    let body = response.text().await.unwrap_or_default();

    let mut fault = RemoteFault::new(format!("provider returned error status: {status}"))
        .with_status(status.as_u16());
    fault.headers = headers;
    match serde_json::from_str::<ApiErrorBody>(&body) {
        Ok(parsed) => {
            fault.api_message = parsed.error.message;
            fault.error_type = parsed.error.kind;
        }
        Err(err) => {
            debug!(event = "provider.error_body.unparsed", status = status.as_u16(), error = %err);
        }
    }
    warn!(
        event = "provider.request.rejected",
        status = status.as_u16(),
        error_type = fault.error_type.as_deref().unwrap_or("unknown"),
        message = %fault.best_message()
    );
    fault
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_joins_base_and_path() {
        assert_eq!(
            HttpRuntime::build_url("https://api.moonshot.cn/v1/", "chat/completions")
                .expect("url must build"),
            "https://api.moonshot.cn/v1/chat/completions"
        );
        assert_eq!(
            HttpRuntime::build_url("https://proxy.local/v1", "/models").expect("url must build"),
            "https://proxy.local/v1/models"
        );
        assert!(matches!(
            HttpRuntime::build_url("  ", "models"),
            Err(KimiError::MissingInput(_))
        ));
    }

    #[tokio::test]
    async fn missing_http_client_is_a_remote_fault() {
        let runtime = HttpRuntime::new(Some("sk-test".to_string()), None, 5, None);
        let error = runtime.get_json("http://127.0.0.1:9/models").await.expect_err("must fail");
        assert!(error.is_remote());
    }

    #[tokio::test]
    async fn in_flight_limit_rejects_excess_requests() {
        let runtime =
            HttpRuntime::new(None, HttpRuntime::build_http_client(5), 5, Some(1));
        let held = runtime.acquire_permit().expect("first permit");
        assert!(held.is_some());
        let error = runtime.acquire_permit().expect_err("second permit must be rejected");
        assert_eq!(error.best_message(), "provider overloaded: max in-flight limit reached");
    }
}
