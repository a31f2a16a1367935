use std::sync::Arc;

use async_trait::async_trait;
use kimi_contracts::{
    CredentialTestResult, ExecutionItem, InputItem, KimiNodeParameters, ListSearchResults,
    NodeDescription, NodeOperation, OutputRecord,
};
use serde_json::Value;
use tracing::{Instrument, info, info_span, warn};

use crate::{
    ApiRequest, ItemError, KimiError, MoonshotApi,
    builder::RequestBuilder,
    catalog::{ModelCatalog, to_search_results},
    credentials::{CREDENTIAL_NAME, KimiCredentials, test_credentials},
    normalize::{error_record, normalize_response},
    policy::ModelPolicyTable,
};

/// A plugin node as the host sees it.
pub trait Node: Send + Sync {
    fn describe(&self) -> NodeDescription;
}

/// A node that turns each input item into exactly one output item.
#[async_trait]
pub trait ItemNode: Node {
    async fn execute_item(
        &self,
        params: &KimiNodeParameters,
        item: &InputItem,
        item_index: usize,
    ) -> Result<OutputRecord, KimiError>;
}

/// Runs `node` over `items` in order. A failing item either aborts the batch
/// or, with `continue_on_fail`, becomes an error record paired to its index.
pub async fn execute_batch<N: ItemNode + ?Sized>(
    node: &N,
    params: &KimiNodeParameters,
    items: &[InputItem],
    continue_on_fail: bool,
) -> Result<Vec<ExecutionItem>, ItemError> {
    let node_name = node.describe().name;
    let mut outputs = Vec::with_capacity(items.len());

    for (item_index, item) in items.iter().enumerate() {
        let span = info_span!(
            "node_item",
            node = %node_name,
            item_index,
            operation = %params.operation,
            model = %params.model.value()
        );
        let result = node.execute_item(params, item, item_index).instrument(span).await;

        match result {
            Ok(record) => outputs.push(ExecutionItem::success(record, item_index)),
            Err(source) if continue_on_fail => {
                warn!(
                    event = "node.item.failed",
                    node = %node_name,
                    item_index,
                    error_kind = source.kind(),
                    error = %source
                );
                outputs.push(ExecutionItem::failure(error_record(&source), item_index));
            }
            Err(source) => return Err(ItemError { item_index, source }),
        }
    }

    info!(event = "node.batch.completed", node = %node_name, items = outputs.len());
    Ok(outputs)
}

pub(crate) fn parameters_schema<T: utoipa::PartialSchema>() -> Value {
    serde_json::to_value(T::schema()).unwrap_or(Value::Null)
}

/// The "Kimi" node: chat completions and vision chat.
pub struct KimiNode {
    api: Arc<dyn MoonshotApi>,
    credentials: KimiCredentials,
    policies: Arc<ModelPolicyTable>,
    catalog: Arc<ModelCatalog>,
}

impl KimiNode {
    pub fn new(api: Arc<dyn MoonshotApi>, credentials: KimiCredentials) -> Self {
        Self {
            api,
            credentials,
            policies: Arc::new(ModelPolicyTable::builtin()),
            catalog: Arc::new(ModelCatalog::builtin()),
        }
    }

    pub fn with_policies(mut self, policies: Arc<ModelPolicyTable>) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<ModelCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub async fn execute(
        &self,
        params: &KimiNodeParameters,
        items: &[InputItem],
        continue_on_fail: bool,
    ) -> Result<Vec<ExecutionItem>, ItemError> {
        execute_batch(self, params, items, continue_on_fail).await
    }

    pub async fn search_models(&self, filter: Option<&str>) -> ListSearchResults {
        let base_url = self.credentials.effective_base_url();
        to_search_results(&self.catalog.search(self.api.as_ref(), &base_url, filter).await)
    }

    pub async fn test_credentials(&self) -> CredentialTestResult {
        test_credentials(self.api.as_ref(), &self.credentials).await
    }
}

impl Node for KimiNode {
    fn describe(&self) -> NodeDescription {
        NodeDescription {
            name: "kimi".to_string(),
            display_name: "Kimi".to_string(),
            description: "Chat and vision completions with Kimi (Moonshot) models".to_string(),
            version: 1,
            group: vec!["transform".to_string()],
            credentials: vec![CREDENTIAL_NAME.to_string()],
            operations: vec![
                NodeOperation {
                    name: "Chat Completions".to_string(),
                    value: "chatCompletions".to_string(),
                    description: "Create a chat completion".to_string(),
                },
                NodeOperation {
                    name: "Vision Chat".to_string(),
                    value: "visionChat".to_string(),
                    description: "Ask about an image or a video".to_string(),
                },
            ],
            parameters_schema: parameters_schema::<KimiNodeParameters>(),
        }
    }
}

#[async_trait]
impl ItemNode for KimiNode {
    async fn execute_item(
        &self,
        params: &KimiNodeParameters,
        item: &InputItem,
        _item_index: usize,
    ) -> Result<OutputRecord, KimiError> {
        let request = RequestBuilder::new(&self.policies).build_from_parameters(
            params,
            item,
            self.credentials.base_url(),
        )?;
        let raw = self
            .api
            .chat_completions(ApiRequest {
                base_url: &request.base_url,
                path: request.path,
                payload: &request.payload,
                timeout: request.timeout,
            })
            .await?;
        Ok(normalize_response(&request.payload.model, raw))
    }
}
