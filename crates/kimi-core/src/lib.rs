use std::{collections::BTreeMap, fmt, time::Duration};

use async_trait::async_trait;
use kimi_contracts::ChatCompletionPayload;
use serde_json::Value;

pub mod builder;
pub mod catalog;
pub mod chain;
pub mod credentials;
pub mod llm_tracing;
pub mod media;
pub mod node;
pub mod normalize;
pub mod policy;

pub use builder::{BuiltRequest, ComposeInputs, Operation, RequestBuilder};
pub use catalog::ModelCatalog;
pub use chain::{ChatModelConfig, KimiChainNode, KimiChatModel};
pub use credentials::KimiCredentials;
pub use llm_tracing::{LlmCallbackHandler, LlmTracing, TrackingSink};
pub use node::{ItemNode, KimiNode, Node, execute_batch};
pub use policy::ModelPolicyTable;

/// Failure reported by the Moonshot API or the transport in front of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteFault {
    pub message: String,
    pub status_code: Option<u16>,
    pub error_type: Option<String>,
    /// `error.message` from the API error body, when one was returned.
    pub api_message: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl RemoteFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), ..Self::default() }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn best_message(&self) -> &str {
        self.api_message.as_deref().filter(|m| !m.trim().is_empty()).unwrap_or(&self.message)
    }
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(status) => write!(f, "{} (status {status})", self.best_message()),
            None => f.write_str(self.best_message()),
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum KimiError {
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("missing input: {0}")]
    MissingInput(String),
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),
    #[error("remote fault: {0}")]
    Remote(RemoteFault),
    #[error("request timed out after {} ms", .0.as_millis())]
    Timeout(Duration),
}

impl KimiError {
    /// Timeouts count as remote faults.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_) | Self::Timeout(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedInput(_) => "malformed_input",
            Self::MissingInput(_) => "missing_input",
            Self::UnsupportedValue(_) => "unsupported_value",
            Self::Remote(_) => "remote_fault",
            Self::Timeout(_) => "timeout",
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Remote(fault) => fault.status_code,
            _ => None,
        }
    }

    pub fn best_message(&self) -> String {
        match self {
            Self::Remote(fault) => fault.best_message().to_string(),
            other => other.to_string(),
        }
    }
}

/// A per-item fault that aborted the batch.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("item {item_index}: {source}")]
pub struct ItemError {
    pub item_index: usize,
    pub source: KimiError,
}

#[derive(Debug, Clone, Copy)]
pub struct ApiRequest<'a> {
    pub base_url: &'a str,
    pub path: &'a str,
    pub payload: &'a ChatCompletionPayload,
    pub timeout: Option<Duration>,
}

/// Transport to the Moonshot REST API. Implementations own authentication.
#[async_trait]
pub trait MoonshotApi: Send + Sync {
    async fn chat_completions(&self, request: ApiRequest<'_>) -> Result<Value, KimiError>;
    async fn list_models(&self, base_url: &str) -> Result<Value, KimiError>;
}
