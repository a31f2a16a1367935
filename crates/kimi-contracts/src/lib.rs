use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

pub const DEFAULT_BASE_URL: &str = "https://api.moonshot.cn/v1";

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    Auto,
    Low,
    High,
}

/// Where the image bytes come from. Flattened into the image part, so the
/// wire shape is either `"image_url": "..."` or `"image_base64": "..."`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    ImageUrl(String),
    ImageBase64(String),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText {
        text: String,
    },
    InputImage {
        #[serde(flatten)]
        source: ImageSource,
        detail: ImageDetail,
    },
    InputVideo {
        video_url: String,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Text view of the content; media parts are skipped.
    pub fn to_plain_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::InputText { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: MessageContent::Text(content.into()) }
    }
}

/// A message as it goes on the wire: either one we synthesized or a
/// caller-supplied JSON object passed through untouched.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum PayloadMessage {
    Typed(ChatMessage),
    Raw(Value),
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormatType {
    Text,
    JsonObject,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: ResponseFormatType,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    Auto,
    Required,
    None,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingType {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub kind: ThinkingType,
}

/// Request body for `POST {base}/chat/completions`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ChatCompletionPayload {
    pub model: String,
    pub messages: Vec<PayloadMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
}

impl ChatCompletionPayload {
    pub fn new(model: impl Into<String>, messages: Vec<PayloadMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            top_p: None,
            max_tokens: None,
            presence_penalty: None,
            frequency_penalty: None,
            response_format: None,
            tools: None,
            tool_choice: None,
            thinking: None,
        }
    }
}

/// Optional tuning parameters of the Kimi node. Enum-like fields stay as raw
/// strings so an unknown value fails the item, not the whole request.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, ToSchema)]
pub struct RequestOptions {
    #[serde(
        rename = "baseURL",
        alias = "base_url",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_json: Option<String>,
    #[serde(default, alias = "instantMode", skip_serializing_if = "Option::is_none")]
    pub instant_mode: Option<bool>,
    /// Request timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Model parameter: a bare id or a resource locator `{ "mode": "list", "value": "..." }`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, ToSchema)]
#[serde(untagged)]
pub enum ModelLocator {
    Id(String),
    Locator {
        #[serde(default)]
        mode: Option<String>,
        value: String,
    },
}

impl ModelLocator {
    pub fn value(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Locator { value, .. } => value,
        }
    }
}

impl Default for ModelLocator {
    fn default() -> Self {
        Self::Id("moonshot-v1-8k".to_string())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct KimiNodeParameters {
    #[serde(default = "default_operation")]
    pub operation: String,
    #[serde(default)]
    pub model: ModelLocator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_property: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_detail: Option<String>,
    #[serde(default)]
    pub options: RequestOptions,
}

fn default_operation() -> String {
    "chatCompletions".to_string()
}

/// Options of the Kimi chat-model node.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChainOptions {
    #[serde(
        rename = "baseURL",
        alias = "baseUrl",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// `-1` means no limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

/// Parameters of the Kimi chat-model node.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, ToSchema)]
pub struct KimiChainParameters {
    #[serde(default)]
    pub model: ModelLocator,
    #[serde(default)]
    pub options: ChainOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BinaryAttachment {
    /// Base64-encoded bytes.
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, ToSchema)]
pub struct InputItem {
    #[serde(default)]
    #[schema(value_type = Object)]
    pub json: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub binary: BTreeMap<String, BinaryAttachment>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, ToSchema)]
pub struct ModelDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { id: id.into(), name: Some(name.into()) }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, ToSchema)]
pub struct ListSearchResult {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, ToSchema)]
pub struct ListSearchResults {
    pub results: Vec<ListSearchResult>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq, ToSchema)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, ToSchema)]
pub struct OutputRecord {
    pub model: String,
    pub usage: Option<Usage>,
    pub id: Option<String>,
    pub created: Option<i64>,
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub error: String,
    pub status_code: Option<u16>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, ToSchema)]
#[serde(untagged)]
pub enum OutputJson {
    Success(OutputRecord),
    Failure(ErrorRecord),
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, ToSchema)]
pub struct PairedItem {
    pub item: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionItem {
    pub json: OutputJson,
    pub paired_item: PairedItem,
}

impl ExecutionItem {
    pub fn success(record: OutputRecord, item: usize) -> Self {
        Self { json: OutputJson::Success(record), paired_item: PairedItem { item } }
    }

    pub fn failure(record: ErrorRecord, item: usize) -> Self {
        Self { json: OutputJson::Failure(record), paired_item: PairedItem { item } }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, ToSchema)]
pub struct CredentialTestResult {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, ToSchema)]
pub struct NodeOperation {
    pub name: String,
    pub value: String,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescription {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub version: u32,
    pub group: Vec<String>,
    pub credentials: Vec<String>,
    pub operations: Vec<NodeOperation>,
    pub parameters_schema: Value,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn image_part_flattens_source_into_part() {
        let part = ContentPart::InputImage {
            source: ImageSource::ImageUrl("https://example.com/cat.png".to_string()),
            detail: ImageDetail::High,
        };
        assert_eq!(
            serde_json::to_value(&part).expect("part must serialize"),
            json!({
                "type": "input_image",
                "image_url": "https://example.com/cat.png",
                "detail": "high"
            })
        );
    }

    #[test]
    fn payload_omits_unset_fields() {
        let payload = ChatCompletionPayload::new(
            "moonshot-v1-8k",
            vec![PayloadMessage::Typed(ChatMessage::text(Role::User, "hi"))],
        );
        assert_eq!(
            serde_json::to_value(&payload).expect("payload must serialize"),
            json!({"model": "moonshot-v1-8k", "messages": [{"role": "user", "content": "hi"}]})
        );
    }

    #[test]
    fn node_parameters_accept_resource_locator_and_bare_model() {
        let params: KimiNodeParameters = serde_json::from_value(json!({
            "operation": "chatCompletions",
            "model": {"mode": "list", "value": "kimi-k2-thinking"},
            "options": {"baseURL": "https://proxy.local/v1", "max_tokens": 0}
        }))
        .expect("parameters must deserialize");
        assert_eq!(params.model.value(), "kimi-k2-thinking");
        assert_eq!(params.options.base_url.as_deref(), Some("https://proxy.local/v1"));

        let params: KimiNodeParameters =
            serde_json::from_value(json!({"model": "moonshot-v1-32k"}))
                .expect("parameters must deserialize");
        assert_eq!(params.model.value(), "moonshot-v1-32k");
        assert_eq!(params.operation, "chatCompletions");
    }

    #[test]
    fn error_record_uses_host_field_names() {
        let record = ErrorRecord {
            error: "bad key".to_string(),
            status_code: Some(401),
            kind: Some("invalid_authentication_error".to_string()),
        };
        assert_eq!(
            serde_json::to_value(ExecutionItem::failure(record, 3)).expect("item must serialize"),
            json!({
                "json": {
                    "error": "bad key",
                    "statusCode": 401,
                    "type": "invalid_authentication_error"
                },
                "pairedItem": {"item": 3}
            })
        );
    }
}
