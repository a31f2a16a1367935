use std::env;

use kimi_clients::DEFAULT_TIMEOUT_SECONDS;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub provider_timeout_seconds: u64,
    pub provider_max_inflight: usize,
    /// Serve every node from the in-process mock instead of the Moonshot API.
    pub mock_provider: bool,
    /// Overrides the built-in fallback model list when non-empty.
    pub fallback_models: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid KIMI_PORT value: {0}")]
    InvalidPort(String),
    #[error("invalid KIMI_MOCK_PROVIDER value: {0}")]
    InvalidBool(String),
    #[error("invalid KIMI_PROVIDER_TIMEOUT value: {0}")]
    InvalidProviderTimeout(String),
    #[error("invalid KIMI_PROVIDER_MAX_INFLIGHT value: {0}")]
    InvalidProviderMaxInflight(String),
    #[error("KIMI_API_KEY is required unless KIMI_MOCK_PROVIDER is enabled")]
    MissingApiKey,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("KIMI_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port_raw = env::var("KIMI_PORT").unwrap_or_else(|_| "3000".to_string());
        let port =
            port_raw.parse::<u16>().map_err(|_| ConfigError::InvalidPort(port_raw.clone()))?;

        let mock_raw = env::var("KIMI_MOCK_PROVIDER").unwrap_or_else(|_| "false".to_string());
        let mock_provider =
            parse_bool(&mock_raw).ok_or_else(|| ConfigError::InvalidBool(mock_raw.clone()))?;

        let api_key = env::var("KIMI_API_KEY").ok().filter(|v| !v.trim().is_empty());
        if api_key.is_none() && !mock_provider {
            return Err(ConfigError::MissingApiKey);
        }
        let base_url = env::var("KIMI_BASE_URL").ok().filter(|v| !v.trim().is_empty());

        let provider_timeout_raw = env::var("KIMI_PROVIDER_TIMEOUT")
            .unwrap_or_else(|_| DEFAULT_TIMEOUT_SECONDS.to_string());
        let provider_timeout_seconds = provider_timeout_raw
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidProviderTimeout(provider_timeout_raw.clone()))?;
        let provider_max_inflight_raw =
            env::var("KIMI_PROVIDER_MAX_INFLIGHT").unwrap_or_else(|_| "100".to_string());
        let provider_max_inflight = parse_positive_usize(&provider_max_inflight_raw)
            .ok_or(ConfigError::InvalidProviderMaxInflight(provider_max_inflight_raw))?;

        let fallback_models = env::var("KIMI_FALLBACK_MODELS")
            .map(|raw| parse_string_list(raw.trim()))
            .unwrap_or_default();

        Ok(Self {
            host,
            port,
            api_key,
            base_url,
            provider_timeout_seconds,
            provider_max_inflight,
            mock_provider,
            fallback_models,
        })
    }

    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            api_key: Some("sk-test".to_string()),
            base_url: None,
            provider_timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            provider_max_inflight: 100,
            mock_provider: true,
            fallback_models: Vec::new(),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_positive_usize(value: &str) -> Option<usize> {
    let parsed = value.trim().parse::<usize>().ok()?;
    if parsed == 0 { None } else { Some(parsed) }
}

/// Accepts a JSON array of strings or a comma-separated list. Invalid JSON
/// yields an empty list.
fn parse_string_list(trimmed: &str) -> Vec<String> {
    if trimmed.is_empty() {
        return Vec::new();
    }
    let items = if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<String>>(trimmed).unwrap_or_default()
    } else {
        trimmed.split(',').map(str::to_string).collect()
    };
    items.into_iter().map(|item| item.trim().to_string()).filter(|item| !item.is_empty()).collect()
}
