use std::sync::Arc;

use async_trait::async_trait;
use kimi_core::llm_tracing::{LlmFault, TrackingSink};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedInput {
    pub index: usize,
    pub source_run_index: Option<usize>,
    pub json: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedOutput {
    pub index: usize,
    pub source_run_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<LlmFault>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackingSnapshot {
    pub inputs: Vec<TrackedInput>,
    pub outputs: Vec<TrackedOutput>,
}

/// Keeps everything reported through the tracking channel in memory.
#[derive(Clone, Default)]
pub struct InMemoryTrackingSink {
    inner: Arc<Mutex<TrackingSnapshot>>,
}

impl InMemoryTrackingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> TrackingSnapshot {
        self.inner.lock().await.clone()
    }
}

#[async_trait]
impl TrackingSink for InMemoryTrackingSink {
    async fn next_run_index(&self) -> usize {
        self.inner.lock().await.inputs.len()
    }

    async fn add_input_data(&self, data: Value, source_run_index: Option<usize>) -> usize {
        let mut guard = self.inner.lock().await;
        let index = guard.inputs.len();
        guard.inputs.push(TrackedInput { index, source_run_index, json: data });
        index
    }

    async fn add_output_data(
        &self,
        index: usize,
        data: Result<Value, LlmFault>,
        source_run_index: Option<usize>,
    ) {
        let (json, error) = match data {
            Ok(value) => (Some(value), None),
            Err(fault) => (None, Some(fault)),
        };
        let mut guard = self.inner.lock().await;
        guard.outputs.push(TrackedOutput { index, source_run_index, json, error });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kimi_clients::MockMoonshotClient;
    use kimi_contracts::{ChainOptions, ChatMessage, Role};
    use kimi_core::{ChatModelConfig, KimiChatModel, KimiCredentials, LlmTracing, RemoteFault};
    use serde_json::json;

    use super::*;

    fn config() -> ChatModelConfig {
        let credentials = KimiCredentials::new("sk-test").expect("key must be accepted");
        ChatModelConfig::from_options("moonshot-v1-8k", &ChainOptions::default(), &credentials)
            .expect("config must resolve")
    }

    #[tokio::test]
    async fn records_inputs_in_order() {
        let sink = InMemoryTrackingSink::new();
        assert_eq!(sink.next_run_index().await, 0);
        assert_eq!(sink.add_input_data(json!({"n": 1}), None).await, 0);
        assert_eq!(sink.add_input_data(json!({"n": 2}), Some(3)).await, 1);
        assert_eq!(sink.next_run_index().await, 2);

        let snapshot = sink.snapshot().await;
        assert_eq!(snapshot.inputs[1].source_run_index, Some(3));
        assert!(snapshot.outputs.is_empty());
    }

    #[tokio::test]
    async fn chat_model_run_is_tracked_end_to_end() {
        let sink = InMemoryTrackingSink::new();
        let tracing = Arc::new(LlmTracing::new(Arc::new(sink.clone())));
        let model = KimiChatModel::new(config(), Arc::new(MockMoonshotClient::new()))
            .with_callback(tracing);

        let result = model
            .invoke(&[ChatMessage::text(Role::User, "ping pong")])
            .await
            .expect("mock must reply");
        assert_eq!(result.texts().collect::<Vec<_>>(), vec!["[mock:moonshot-v1-8k] ping pong"]);

        let snapshot = sink.snapshot().await;
        assert_eq!(snapshot.inputs.len(), 1);
        assert_eq!(snapshot.inputs[0].json["messages"], json!(["user: ping pong"]));
        assert_eq!(snapshot.inputs[0].json["estimatedTokens"], 4);
        assert_eq!(snapshot.outputs.len(), 1);
        let output = snapshot.outputs[0].json.as_ref().expect("output must be recorded");
        assert_eq!(
            output["tokenUsage"],
            json!({"completionTokens": 3, "promptTokens": 2, "totalTokens": 5})
        );
    }

    #[tokio::test]
    async fn failed_run_records_fault() {
        let sink = InMemoryTrackingSink::new();
        let tracing = Arc::new(LlmTracing::new(Arc::new(sink.clone())));
        let api = MockMoonshotClient::failing(RemoteFault::new("bad key").with_status(401));
        let model = KimiChatModel::new(config(), Arc::new(api))
            .with_callback(tracing)
            .with_retry_backoff(Duration::ZERO);

        assert!(model.invoke(&[ChatMessage::text(Role::User, "hi")]).await.is_err());
        let snapshot = sink.snapshot().await;
        let fault = snapshot.outputs[0].error.as_ref().expect("fault must be recorded");
        assert_eq!(fault.message, "bad key");
        assert_eq!(fault.status_code, Some(401));
    }
}
