use std::{sync::Arc, time::Duration};

use kimi_contracts::{
    ChainOptions, ChatCompletionPayload, ChatMessage, KimiChainParameters, ListSearchResults,
    NodeDescription, PayloadMessage, ResponseFormat, ResponseFormatType,
};
use serde_json::{Map, Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    ApiRequest, KimiError, MoonshotApi,
    builder::{CHAT_COMPLETIONS_PATH, parse_response_format},
    catalog::{ModelCatalog, to_search_results},
    credentials::{CREDENTIAL_NAME, KimiCredentials, resolve_base_url},
    llm_tracing::{
        Generation, LlmCallbackHandler, LlmFault, LlmOutput, LlmResult, SerializedLlm, TokenUsage,
    },
    node::{Node, parameters_schema},
    normalize::normalize_response,
};

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Resolved settings of one chat model. Unset sampling options stay unset.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatModelConfig {
    pub model: String,
    pub base_url: String,
    pub max_retries: u32,
    pub timeout: Duration,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub response_format: Option<ResponseFormatType>,
}

impl ChatModelConfig {
    pub fn from_options(
        model: &str,
        options: &ChainOptions,
        credentials: &KimiCredentials,
    ) -> Result<Self, KimiError> {
        let model = model.trim();
        if model.is_empty() {
            return Err(KimiError::MissingInput("model is required".to_string()));
        }

        Ok(Self {
            model: model.to_string(),
            base_url: resolve_base_url(options.base_url.as_deref(), credentials.base_url()),
            max_retries: options.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            timeout: Duration::from_millis(
                options.timeout.filter(|ms| *ms > 0).unwrap_or(DEFAULT_TIMEOUT_MS),
            ),
            temperature: options.temperature,
            top_p: options.top_p,
            // -1 means no limit
            max_tokens: options
                .max_tokens
                .filter(|value| *value > 0)
                .map(|value| u32::try_from(value).unwrap_or(u32::MAX)),
            presence_penalty: options.presence_penalty,
            frequency_penalty: options.frequency_penalty,
            response_format: parse_response_format(options.response_format.as_deref())?,
        })
    }

    pub fn payload(&self, messages: &[ChatMessage]) -> ChatCompletionPayload {
        let mut payload = ChatCompletionPayload::new(
            self.model.clone(),
            messages.iter().cloned().map(PayloadMessage::Typed).collect(),
        );
        payload.temperature = self.temperature;
        payload.top_p = self.top_p;
        payload.max_tokens = self.max_tokens;
        payload.presence_penalty = self.presence_penalty;
        payload.frequency_penalty = self.frequency_penalty;
        payload.response_format = self.response_format.map(|kind| ResponseFormat { kind });
        payload
    }

    /// Settings reported to tracing callbacks. Never includes the API key.
    pub fn invocation_params(&self) -> Value {
        let mut params = Map::new();
        params.insert("model".to_string(), json!(self.model));
        params.insert("maxRetries".to_string(), json!(self.max_retries));
        params.insert("timeout".to_string(), json!(self.timeout.as_millis() as u64));
        params.insert("configuration".to_string(), json!({ "baseURL": self.base_url }));
        let optional = [
            ("temperature", self.temperature.map(|v| json!(v))),
            ("topP", self.top_p.map(|v| json!(v))),
            ("maxTokens", self.max_tokens.map(|v| json!(v))),
            ("presencePenalty", self.presence_penalty.map(|v| json!(v))),
            ("frequencyPenalty", self.frequency_penalty.map(|v| json!(v))),
            ("responseFormat", self.response_format.map(|kind| json!({ "type": kind }))),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                params.insert(key.to_string(), value);
            }
        }
        Value::Object(params)
    }
}

/// Prompt lines as reported to tracing: `role: text`.
pub fn render_prompts(messages: &[ChatMessage]) -> Vec<String> {
    messages
        .iter()
        .map(|message| format!("{}: {}", message.role.as_str(), message.content.to_plain_text()))
        .collect()
}

fn is_retryable(error: &KimiError) -> bool {
    match error {
        KimiError::Timeout(_) => true,
        KimiError::Remote(fault) => match fault.status_code {
            None => true,
            Some(408 | 409 | 429) => true,
            Some(status) => status >= 500,
        },
        _ => false,
    }
}

fn llm_result_from_response(model: &str, raw: Value) -> LlmResult {
    let finish_reason = raw.pointer("/choices/0/finish_reason").cloned();
    let record = normalize_response(model, raw);

    let mut info = Map::new();
    if let Some(reason) = finish_reason.filter(|value| !value.is_null()) {
        info.insert("finish_reason".to_string(), reason);
    }
    if let Some(reasoning) = &record.reasoning {
        info.insert("reasoning_content".to_string(), json!(reasoning));
    }

    let token_usage = record.usage.as_ref().map(|usage| {
        TokenUsage::new(
            usage.completion_tokens.unwrap_or_default(),
            usage.prompt_tokens.unwrap_or_default(),
        )
    });

    LlmResult {
        generations: vec![vec![Generation {
            text: record.content.unwrap_or_default(),
            generation_info: (!info.is_empty()).then_some(Value::Object(info)),
        }]],
        llm_output: Some(LlmOutput { token_usage }),
    }
}

/// Chat model handed to a chain. Each invocation is one tracked run.
pub struct KimiChatModel {
    config: ChatModelConfig,
    api: Arc<dyn MoonshotApi>,
    callbacks: Vec<Arc<dyn LlmCallbackHandler>>,
    retry_backoff: Duration,
}

impl KimiChatModel {
    pub fn new(config: ChatModelConfig, api: Arc<dyn MoonshotApi>) -> Self {
        Self { config, api, callbacks: Vec::new(), retry_backoff: DEFAULT_RETRY_BACKOFF }
    }

    pub fn with_callback(mut self, handler: Arc<dyn LlmCallbackHandler>) -> Self {
        self.callbacks.push(handler);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn config(&self) -> &ChatModelConfig {
        &self.config
    }

    fn serialized(&self) -> SerializedLlm {
        SerializedLlm::constructor(
            vec!["kimi".to_string(), "chat_models".to_string(), self.config.model.clone()],
            self.config.invocation_params(),
        )
    }

    pub async fn invoke(&self, messages: &[ChatMessage]) -> Result<LlmResult, KimiError> {
        let run_id = Uuid::new_v4().to_string();
        let prompts = render_prompts(messages);
        let serialized = self.serialized();
        for handler in &self.callbacks {
            handler.handle_llm_start(&serialized, &prompts, &run_id).await;
        }

        let payload = self.config.payload(messages);
        let mut attempt = 0u32;
        loop {
            let request = ApiRequest {
                base_url: &self.config.base_url,
                path: CHAT_COMPLETIONS_PATH,
                payload: &payload,
                timeout: Some(self.config.timeout),
            };
            match self.api.chat_completions(request).await {
                Ok(raw) => {
                    let result = llm_result_from_response(&self.config.model, raw);
                    for handler in &self.callbacks {
                        handler.handle_llm_end(&result, &run_id).await;
                    }
                    info!(
                        event = "chat_model.invoke.completed",
                        run_id = %run_id,
                        model = %self.config.model,
                        attempts = attempt + 1
                    );
                    return Ok(result);
                }
                Err(error) if attempt < self.config.max_retries && is_retryable(&error) => {
                    let delay = self.retry_backoff.saturating_mul(1u32 << attempt.min(16));
                    warn!(
                        event = "chat_model.invoke.retry",
                        run_id = %run_id,
                        model = %self.config.model,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    let fault = LlmFault::from(&error);
                    for handler in &self.callbacks {
                        handler.handle_llm_error(fault.clone(), &run_id).await;
                    }
                    return Err(error);
                }
            }
        }
    }
}

/// The "Kimi Chat Model" node. It produces no items; it supplies a model.
pub struct KimiChainNode {
    api: Arc<dyn MoonshotApi>,
    credentials: KimiCredentials,
    catalog: Arc<ModelCatalog>,
}

impl KimiChainNode {
    pub fn new(api: Arc<dyn MoonshotApi>, credentials: KimiCredentials) -> Self {
        Self { api, credentials, catalog: Arc::new(ModelCatalog::builtin()) }
    }

    pub fn with_catalog(mut self, catalog: Arc<ModelCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn supply_data(
        &self,
        params: &KimiChainParameters,
        callbacks: Vec<Arc<dyn LlmCallbackHandler>>,
    ) -> Result<KimiChatModel, KimiError> {
        let config = ChatModelConfig::from_options(
            params.model.value(),
            &params.options,
            &self.credentials,
        )?;
        let model = callbacks
            .into_iter()
            .fold(KimiChatModel::new(config, self.api.clone()), KimiChatModel::with_callback);
        Ok(model)
    }

    pub async fn search_models(&self, filter: Option<&str>) -> ListSearchResults {
        let base_url = self.credentials.effective_base_url();
        to_search_results(&self.catalog.search(self.api.as_ref(), &base_url, filter).await)
    }
}

impl Node for KimiChainNode {
    fn describe(&self) -> NodeDescription {
        NodeDescription {
            name: "kimiChain".to_string(),
            display_name: "Kimi Chat Model".to_string(),
            description: "Kimi Chat Model for advanced usage with an AI chain".to_string(),
            version: 1,
            group: vec!["transform".to_string()],
            credentials: vec![CREDENTIAL_NAME.to_string()],
            operations: Vec::new(),
            parameters_schema: parameters_schema::<KimiChainParameters>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use kimi_contracts::Role;
    use tokio::sync::Mutex;

    use super::*;
    use crate::RemoteFault;

    struct ScriptedApi {
        failures: Vec<KimiError>,
        calls: AtomicUsize,
    }

    impl ScriptedApi {
        fn new(failures: Vec<KimiError>) -> Self {
            Self { failures, calls: AtomicUsize::new(0) }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl MoonshotApi for ScriptedApi {
        async fn chat_completions(&self, request: ApiRequest<'_>) -> Result<Value, KimiError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.failures.get(call) {
                return Err(error.clone());
            }
            Ok(json!({
                "id": "cmpl-1",
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": "pong",
                        "reasoning_content": "short"
                    },
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 4, "completion_tokens": 1, "total_tokens": 5},
                "model": request.payload.model
            }))
        }

        async fn list_models(&self, _base_url: &str) -> Result<Value, KimiError> {
            Err(KimiError::Remote(RemoteFault::new("offline")))
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl LlmCallbackHandler for RecordingHandler {
        async fn handle_llm_start(&self, llm: &SerializedLlm, prompts: &[String], _run_id: &str) {
            let event = format!("start {} {}", llm.model_name(), prompts.join("|"));
            self.events.lock().await.push(event);
        }

        async fn handle_llm_end(&self, output: &LlmResult, _run_id: &str) {
            let text: Vec<&str> = output.texts().collect();
            self.events.lock().await.push(format!("end {}", text.join("")));
        }

        async fn handle_llm_error(&self, fault: LlmFault, _run_id: &str) {
            self.events.lock().await.push(format!("error {}", fault.message));
        }
    }

    fn status_error(status: u16) -> KimiError {
        KimiError::Remote(RemoteFault::new(format!("status {status}")).with_status(status))
    }

    fn credentials() -> KimiCredentials {
        KimiCredentials::new("sk-test").expect("key must be accepted")
    }

    fn messages() -> Vec<ChatMessage> {
        vec![ChatMessage::text(Role::System, "be terse"), ChatMessage::text(Role::User, "ping")]
    }

    fn build_model(
        api: Arc<ScriptedApi>,
        options: ChainOptions,
    ) -> (KimiChatModel, Arc<RecordingHandler>) {
        let handler = Arc::new(RecordingHandler::default());
        let config = ChatModelConfig::from_options("moonshot-v1-8k", &options, &credentials())
            .expect("config must resolve");
        let model = KimiChatModel::new(config, api)
            .with_callback(handler.clone())
            .with_retry_backoff(Duration::ZERO);
        (model, handler)
    }

    #[test]
    fn options_map_onto_config() {
        let options: ChainOptions = serde_json::from_value(json!({
            "baseURL": "https://proxy.local/v1/",
            "maxTokens": -1,
            "responseFormat": "json_object",
            "temperature": 0.3,
            "topP": 0.9
        }))
        .expect("options must deserialize");
        let config = ChatModelConfig::from_options("kimi-k2-thinking", &options, &credentials())
            .expect("config must resolve");

        assert_eq!(config.base_url, "https://proxy.local/v1");
        assert_eq!(config.max_tokens, None);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
        assert_eq!(config.response_format, Some(ResponseFormatType::JsonObject));

        let payload = serde_json::to_value(config.payload(&messages())).expect("payload");
        assert_eq!(
            payload,
            json!({
                "model": "kimi-k2-thinking",
                "messages": [
                    {"role": "system", "content": "be terse"},
                    {"role": "user", "content": "ping"}
                ],
                "temperature": 0.3,
                "top_p": 0.9,
                "response_format": {"type": "json_object"}
            })
        );
    }

    #[test]
    fn invocation_params_skip_unset_and_secret_fields() {
        let options = ChainOptions::default();
        let config = ChatModelConfig::from_options("moonshot-v1-8k", &options, &credentials())
            .expect("config must resolve");
        assert_eq!(
            config.invocation_params(),
            json!({
                "model": "moonshot-v1-8k",
                "maxRetries": 2,
                "timeout": 60000,
                "configuration": {"baseURL": "https://api.moonshot.cn/v1"}
            })
        );
    }

    #[tokio::test]
    async fn invoke_fires_start_and_end() {
        let api = Arc::new(ScriptedApi::new(Vec::new()));
        let (model, handler) = build_model(api.clone(), ChainOptions::default());
        let result = model.invoke(&messages()).await.expect("invoke must succeed");

        assert_eq!(result.texts().collect::<Vec<_>>(), vec!["pong"]);
        assert_eq!(
            result.llm_output.and_then(|output| output.token_usage),
            Some(TokenUsage::new(1, 4))
        );
        assert_eq!(
            result.generations[0][0].generation_info,
            Some(json!({"finish_reason": "stop", "reasoning_content": "short"}))
        );
        assert_eq!(
            handler.events.lock().await.as_slice(),
            &[
                "start moonshot-v1-8k system: be terse|user: ping".to_string(),
                "end pong".to_string()
            ]
        );
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn retryable_faults_are_retried() {
        let api = Arc::new(ScriptedApi::new(vec![
            status_error(429),
            KimiError::Timeout(Duration::from_millis(5)),
        ]));
        let (model, handler) = build_model(api.clone(), ChainOptions::default());
        model.invoke(&messages()).await.expect("third attempt must succeed");
        assert_eq!(api.calls(), 3);
        assert_eq!(handler.events.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn retries_stop_at_max_retries() {
        let api = Arc::new(ScriptedApi::new(vec![status_error(503), status_error(503)]));
        let options = ChainOptions { max_retries: Some(1), ..ChainOptions::default() };
        let (model, handler) = build_model(api.clone(), options);
        let error = model.invoke(&messages()).await.expect_err("retries must be exhausted");

        assert_eq!(error.status_code(), Some(503));
        assert_eq!(api.calls(), 2);
        let events = handler.events.lock().await;
        assert_eq!(events.last().map(String::as_str), Some("error status 503"));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let api = Arc::new(ScriptedApi::new(vec![status_error(401)]));
        let (model, _handler) = build_model(api.clone(), ChainOptions::default());
        assert!(model.invoke(&messages()).await.is_err());
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn chain_node_supplies_model_and_falls_back_for_search() {
        let node = KimiChainNode::new(Arc::new(ScriptedApi::new(Vec::new())), credentials());
        let params: KimiChainParameters = serde_json::from_value(json!({
            "model": {"mode": "list", "value": "kimi-k2-turbo-preview"},
            "options": {"maxRetries": 0}
        }))
        .expect("parameters must deserialize");
        let model = node.supply_data(&params, Vec::new()).expect("model must be supplied");
        assert_eq!(model.config().model, "kimi-k2-turbo-preview");
        assert_eq!(model.config().max_retries, 0);

        let results = node.search_models(Some("turbo")).await;
        let values: Vec<_> = results.results.iter().map(|r| r.value.as_str()).collect();
        assert_eq!(values, vec!["kimi-k2-thinking-turbo", "kimi-k2-turbo-preview"]);
        assert_eq!(node.describe().name, "kimiChain");
    }
}
