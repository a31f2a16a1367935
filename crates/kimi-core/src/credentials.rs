use std::fmt;

use kimi_contracts::{CredentialTestResult, DEFAULT_BASE_URL};
use serde_json::Value;
use tracing::{info, warn};

use crate::{KimiError, MoonshotApi};

pub const CREDENTIAL_NAME: &str = "kimiApi";
pub const CREDENTIAL_TEST_SUCCESS: &str = "Kimi API connection test succeeded";

#[derive(Clone, PartialEq, Eq)]
pub struct KimiCredentials {
    api_key: String,
    base_url: Option<String>,
}

impl KimiCredentials {
    pub fn new(api_key: impl Into<String>) -> Result<Self, KimiError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(KimiError::MissingInput("API key is required".to_string()));
        }
        Ok(Self { api_key, base_url: None })
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Credential base URL without the default applied.
    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    pub fn effective_base_url(&self) -> String {
        resolve_base_url(None, self.base_url())
    }
}

impl fmt::Debug for KimiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KimiCredentials")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Option override, then credential, then the public endpoint.
pub fn resolve_base_url(override_url: Option<&str>, credential_url: Option<&str>) -> String {
    fn pick(raw: Option<&str>) -> Option<&str> {
        raw.map(str::trim).filter(|value| !value.is_empty())
    }

    pick(override_url)
        .or_else(|| pick(credential_url))
        .unwrap_or(DEFAULT_BASE_URL)
        .trim_end_matches('/')
        .to_string()
}

pub async fn test_credentials(
    api: &dyn MoonshotApi,
    credentials: &KimiCredentials,
) -> CredentialTestResult {
    let base_url = credentials.effective_base_url();
    let outcome = match api.list_models(&base_url).await {
        Ok(body) if body.get("data").is_some_and(Value::is_array) => Ok(()),
        Ok(_) => Err("response body has no `data` array".to_string()),
        Err(err) => Err(err.best_message()),
    };

    match outcome {
        Ok(()) => {
            info!(event = "credentials.test.succeeded", base_url = %base_url);
            CredentialTestResult { success: true, message: CREDENTIAL_TEST_SUCCESS.to_string() }
        }
        Err(message) => {
            warn!(event = "credentials.test.failed", base_url = %base_url, error = %message);
            CredentialTestResult { success: false, message }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{ApiRequest, RemoteFault};

    struct ModelsOnly(Result<Value, KimiError>);

    #[async_trait]
    impl MoonshotApi for ModelsOnly {
        async fn chat_completions(&self, _request: ApiRequest<'_>) -> Result<Value, KimiError> {
            Err(KimiError::UnsupportedValue("not used".to_string()))
        }

        async fn list_models(&self, _base_url: &str) -> Result<Value, KimiError> {
            self.0.clone()
        }
    }

    #[test]
    fn base_url_precedence_and_trimming() {
        assert_eq!(resolve_base_url(Some("https://a/v1/"), Some("https://b/v1")), "https://a/v1");
        assert_eq!(resolve_base_url(Some("  "), Some("https://b/v1//")), "https://b/v1");
        assert_eq!(resolve_base_url(None, None), DEFAULT_BASE_URL);
    }

    #[test]
    fn debug_output_redacts_api_key() {
        let credentials = KimiCredentials::new("sk-secret").expect("key must be accepted");
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<redacted>"));
        assert!(matches!(KimiCredentials::new(" "), Err(KimiError::MissingInput(_))));
    }

    #[tokio::test]
    async fn credential_test_requires_data_array() {
        let credentials = KimiCredentials::new("sk-test").expect("key must be accepted");

        let ok = ModelsOnly(Ok(json!({"object": "list", "data": []})));
        let result = test_credentials(&ok, &credentials).await;
        assert!(result.success);
        assert_eq!(result.message, CREDENTIAL_TEST_SUCCESS);

        let wrong_shape = ModelsOnly(Ok(json!({"data": {"id": "x"}})));
        assert!(!test_credentials(&wrong_shape, &credentials).await.success);

        let mut fault = RemoteFault::new("provider returned error status").with_status(401);
        fault.api_message = Some("Invalid Authentication".to_string());
        let unauthorized = ModelsOnly(Err(KimiError::Remote(fault)));
        let result = test_credentials(&unauthorized, &credentials).await;
        assert!(!result.success);
        assert_eq!(result.message, "Invalid Authentication");
    }
}
