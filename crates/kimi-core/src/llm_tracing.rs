//! Usage-tracing callbacks for the chat-model node.
//!
//! Each model call is reported to the host twice: once as input data when it
//! starts and once as output data (or a fault) when it ends. Runs are keyed by
//! the caller's run id so the end and error hooks land on the same index as
//! their start.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::KimiError;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Generation {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_info: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub completion_tokens: u64,
    pub prompt_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(completion_tokens: u64, prompt_tokens: u64) -> Self {
        Self { completion_tokens, prompt_tokens, total_tokens: completion_tokens + prompt_tokens }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LlmOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LlmResult {
    pub generations: Vec<Vec<Generation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_output: Option<LlmOutput>,
}

impl LlmResult {
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.generations.iter().flatten().map(|generation| generation.text.as_str())
    }
}

/// Serialized description of the model that started a run.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SerializedLlm {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: Vec<String>,
    #[serde(default)]
    pub kwargs: Value,
}

impl SerializedLlm {
    pub fn constructor(id: Vec<String>, kwargs: Value) -> Self {
        Self { kind: "constructor".to_string(), id, kwargs }
    }

    /// Constructor kwargs, or the whole description for anything else.
    pub fn options(&self) -> Value {
        if self.kind == "constructor" {
            self.kwargs.clone()
        } else {
            serde_json::to_value(self).unwrap_or(Value::Null)
        }
    }

    pub fn model_name(&self) -> &str {
        self.id.last().map(String::as_str).unwrap_or("Kimi LLM")
    }
}

/// Fault reported for a failed run.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LlmFault {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl From<&KimiError> for LlmFault {
    fn from(error: &KimiError) -> Self {
        match error {
            KimiError::Remote(fault) => Self {
                message: fault.best_message().to_string(),
                description: fault.error_type.clone(),
                status_code: fault.status_code,
                headers: fault.headers.clone(),
            },
            other => Self { message: other.to_string(), ..Self::default() },
        }
    }
}

/// Host channel that records the input and output data of each run.
#[async_trait]
pub trait TrackingSink: Send + Sync {
    async fn next_run_index(&self) -> usize;
    /// Returns the index the input was recorded at.
    async fn add_input_data(&self, data: Value, source_run_index: Option<usize>) -> usize;
    async fn add_output_data(
        &self,
        index: usize,
        data: Result<Value, LlmFault>,
        source_run_index: Option<usize>,
    );
}

#[async_trait]
pub trait LlmCallbackHandler: Send + Sync {
    async fn handle_llm_start(&self, llm: &SerializedLlm, prompts: &[String], run_id: &str);
    async fn handle_llm_end(&self, output: &LlmResult, run_id: &str);
    async fn handle_llm_error(&self, fault: LlmFault, run_id: &str);
}

pub type UsageParser = fn(&LlmResult) -> TokenUsage;
pub type ErrorDescriptionMapper = fn(&LlmFault) -> Option<String>;

pub fn default_usage_parser(result: &LlmResult) -> TokenUsage {
    let usage =
        result.llm_output.as_ref().and_then(|output| output.token_usage).unwrap_or_default();
    TokenUsage::new(usage.completion_tokens, usage.prompt_tokens)
}

/// `ceil(chars / 4)` over the concatenated strings.
pub fn estimate_tokens_from_strings<S: AsRef<str>>(list: &[S]) -> u64 {
    let chars: usize = list.iter().map(|item| item.as_ref().chars().count()).sum();
    chars.div_ceil(4) as u64
}

#[derive(Debug, Clone)]
struct RunDetail {
    index: usize,
    messages: Vec<String>,
    options: Value,
}

#[derive(Debug, Default)]
struct TracingState {
    runs: HashMap<String, RunDetail>,
    prompt_tokens_estimate: u64,
    parent_run_index: Option<usize>,
}

impl TracingState {
    fn run_index(&self, run_id: &str) -> usize {
        self.runs.get(run_id).map(|detail| detail.index).unwrap_or(self.runs.len())
    }
}

pub struct LlmTracing {
    sink: Arc<dyn TrackingSink>,
    usage_parser: UsageParser,
    error_mapper: Option<ErrorDescriptionMapper>,
    state: Mutex<TracingState>,
}

impl LlmTracing {
    pub fn new(sink: Arc<dyn TrackingSink>) -> Self {
        Self {
            sink,
            usage_parser: default_usage_parser,
            error_mapper: None,
            state: Mutex::new(TracingState::default()),
        }
    }

    pub fn with_usage_parser(mut self, parser: UsageParser) -> Self {
        self.usage_parser = parser;
        self
    }

    pub fn with_error_mapper(mut self, mapper: ErrorDescriptionMapper) -> Self {
        self.error_mapper = Some(mapper);
        self
    }

    pub async fn set_parent_run_index(&self, run_index: usize) {
        self.state.lock().await.parent_run_index = Some(run_index);
    }

    pub async fn tracked_runs(&self) -> usize {
        self.state.lock().await.runs.len()
    }
}

#[async_trait]
impl LlmCallbackHandler for LlmTracing {
    async fn handle_llm_start(&self, llm: &SerializedLlm, prompts: &[String], run_id: &str) {
        let estimated_tokens = estimate_tokens_from_strings(prompts);
        let parent_run_index = self.state.lock().await.parent_run_index;
        let source_run_index = match parent_run_index {
            Some(parent) => Some(parent + self.sink.next_run_index().await),
            None => None,
        };

        let options = llm.options();
        let index = self
            .sink
            .add_input_data(
                json!({
                    "messages": prompts,
                    "estimatedTokens": estimated_tokens,
                    "options": options,
                }),
                source_run_index,
            )
            .await;

        {
            let mut state = self.state.lock().await;
            state.runs.insert(
                run_id.to_string(),
                RunDetail { index, messages: prompts.to_vec(), options },
            );
            state.prompt_tokens_estimate = estimated_tokens;
        }

        info!(
            event = "llm.run.started",
            model = llm.model_name(),
            run_id,
            run_index = index,
            prompt_chars = prompts.iter().map(|p| p.chars().count()).sum::<usize>(),
            estimated_tokens
        );
    }

    async fn handle_llm_end(&self, output: &LlmResult, run_id: &str) {
        let (index, parent_run_index, prompt_tokens_estimate, detail) = {
            let state = self.state.lock().await;
            (
                state.run_index(run_id),
                state.parent_run_index,
                state.prompt_tokens_estimate,
                state.runs.get(run_id).cloned(),
            )
        };

        let generations: Vec<Vec<Generation>> = output
            .generations
            .iter()
            .map(|batch| {
                batch
                    .iter()
                    .map(|g| Generation {
                        text: g.text.clone(),
                        generation_info: g.generation_info.clone(),
                    })
                    .collect()
            })
            .collect();

        let token_usage = (self.usage_parser)(output);
        let mut estimate = TokenUsage::default();
        if !generations.is_empty() {
            let texts: Vec<&str> = output.texts().collect();
            estimate =
                TokenUsage::new(estimate_tokens_from_strings(&texts), prompt_tokens_estimate);
        }

        let mut response = json!({ "response": { "generations": generations } });
        let usage_field = if token_usage.completion_tokens > 0 {
            ("tokenUsage", token_usage)
        } else {
            ("tokenUsageEstimate", estimate)
        };
        if let Value::Object(map) = &mut response {
            map.insert(usage_field.0.to_string(), json!(usage_field.1));
        }

        let source_run_index = parent_run_index.map(|parent| parent + index);
        self.sink.add_output_data(index, Ok(response), source_run_index).await;

        info!(
            event = "llm.run.completed",
            run_id,
            run_index = index,
            known_run = detail.is_some(),
            prompts = detail.as_ref().map(|d| d.messages.len()).unwrap_or(0),
            has_options = detail.as_ref().is_some_and(|d| !d.options.is_null()),
            response_chars = output.texts().map(|t| t.chars().count()).sum::<usize>(),
            usage_kind = usage_field.0,
            completion_tokens = usage_field.1.completion_tokens,
            prompt_tokens = usage_field.1.prompt_tokens
        );
    }

    async fn handle_llm_error(&self, mut fault: LlmFault, run_id: &str) {
        let index = self.state.lock().await.run_index(run_id);

        fault.headers.retain(|name, _| name.starts_with("x-"));
        if let Some(mapper) = self.error_mapper {
            fault.description = mapper(&fault);
        }

        error!(
            event = "llm.run.failed",
            run_id,
            run_index = index,
            status_code = fault.status_code,
            error = %fault.message
        );
        self.sink.add_output_data(index, Err(fault), None).await;
    }
}
