use std::{str::FromStr, time::Duration};

use kimi_contracts::{
    ChatCompletionPayload, ChatMessage, ContentPart, ImageDetail, ImageSource, InputItem,
    KimiNodeParameters, MessageContent, PayloadMessage, RequestOptions, ResponseFormat,
    ResponseFormatType, Role, ThinkingConfig, ThinkingType, ToolChoice,
};
use serde_json::Value;
use tracing::debug;

use crate::{
    KimiError,
    credentials::resolve_base_url,
    media::{DEFAULT_IMAGE_MIME_TYPE, DataUrl, validate_base64},
    policy::{FamilyRule, ModelPolicyTable},
};

pub const CHAT_COMPLETIONS_PATH: &str = "chat/completions";

const DEFAULT_BINARY_PROPERTY: &str = "data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ChatCompletions,
    VisionChat,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatCompletions => "chatCompletions",
            Self::VisionChat => "visionChat",
        }
    }
}

impl FromStr for Operation {
    type Err = KimiError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "chatCompletions" => Ok(Self::ChatCompletions),
            "visionChat" => Ok(Self::VisionChat),
            other => Err(KimiError::UnsupportedValue(format!("unknown operation: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCompose {
    Simple { system: String, user_message: String },
    RawJson(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaInput {
    ImageUrl(String),
    ImageBase64(String),
    ImageDataUrl(DataUrl),
    VideoUrl(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisionInputs {
    pub prompt: String,
    pub media: MediaInput,
    pub detail: ImageDetail,
}

/// Message inputs of one invocation, already resolved against the input item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposeInputs {
    Chat(ChatCompose),
    Vision(VisionInputs),
}

impl ComposeInputs {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Chat(_) => Operation::ChatCompletions,
            Self::Vision(_) => Operation::VisionChat,
        }
    }

    pub fn from_parameters(
        operation: Operation,
        params: &KimiNodeParameters,
        item: &InputItem,
    ) -> Result<Self, KimiError> {
        match operation {
            Operation::ChatCompletions => chat_inputs(params).map(Self::Chat),
            Operation::VisionChat => vision_inputs(params, item).map(Self::Vision),
        }
    }

    pub fn to_messages(&self) -> Result<Vec<PayloadMessage>, KimiError> {
        match self {
            Self::Chat(ChatCompose::Simple { system, user_message }) => {
                let mut messages = Vec::with_capacity(2);
                if !system.is_empty() {
                    messages.push(PayloadMessage::Typed(ChatMessage::text(Role::System, system)));
                }
                messages.push(PayloadMessage::Typed(ChatMessage::text(Role::User, user_message)));
                Ok(messages)
            }
            Self::Chat(ChatCompose::RawJson(raw)) => parse_raw_messages(raw),
            Self::Vision(vision) => {
                let media = match &vision.media {
                    MediaInput::ImageUrl(url) => ContentPart::InputImage {
                        source: ImageSource::ImageUrl(url.clone()),
                        detail: vision.detail,
                    },
                    MediaInput::ImageBase64(data) => ContentPart::InputImage {
                        source: ImageSource::ImageBase64(data.clone()),
                        detail: vision.detail,
                    },
                    MediaInput::ImageDataUrl(data_url) => ContentPart::InputImage {
                        source: ImageSource::ImageUrl(data_url.encode()),
                        detail: vision.detail,
                    },
                    MediaInput::VideoUrl(url) => ContentPart::InputVideo { video_url: url.clone() },
                };
                let content = MessageContent::Parts(vec![
                    ContentPart::InputText { text: vision.prompt.clone() },
                    media,
                ]);
                Ok(vec![PayloadMessage::Typed(ChatMessage { role: Role::User, content })])
            }
        }
    }
}

fn chat_inputs(params: &KimiNodeParameters) -> Result<ChatCompose, KimiError> {
    match params.compose_mode.as_deref().unwrap_or("simple") {
        "simple" => Ok(ChatCompose::Simple {
            system: params.system.clone().unwrap_or_default(),
            user_message: params.user_message.clone().unwrap_or_default(),
        }),
        "rawJson" => Ok(ChatCompose::RawJson(params.messages_json.clone().unwrap_or_default())),
        other => Err(KimiError::UnsupportedValue(format!("unknown compose mode: {other}"))),
    }
}

fn vision_inputs(params: &KimiNodeParameters, item: &InputItem) -> Result<VisionInputs, KimiError> {
    let detail = parse_image_detail(params.image_detail.as_deref())?;
    let media = match params.media_type.as_deref().unwrap_or("image") {
        "image" => image_input(params, item)?,
        "video" => MediaInput::VideoUrl(required_url(params.video_url.as_deref(), "videoUrl")?),
        other => return Err(KimiError::UnsupportedValue(format!("unknown media type: {other}"))),
    };
    Ok(VisionInputs { prompt: params.vision_prompt.clone().unwrap_or_default(), media, detail })
}

fn image_input(params: &KimiNodeParameters, item: &InputItem) -> Result<MediaInput, KimiError> {
    match params.image_source.as_deref().unwrap_or("url") {
        "url" => Ok(MediaInput::ImageUrl(required_url(params.image_url.as_deref(), "imageUrl")?)),
        "binary" => {
            let property = params
                .binary_property
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or(DEFAULT_BINARY_PROPERTY);
            let attachment =
                item.binary.get(property).filter(|a| !a.data.is_empty()).ok_or_else(|| {
                    KimiError::MissingInput(format!(
                        "binary property \"{property}\" not found or empty"
                    ))
                })?;
            validate_base64(&attachment.data)?;

            match params.encoding_mode.as_deref().unwrap_or("data_url") {
                "image_base64" => Ok(MediaInput::ImageBase64(attachment.data.clone())),
                "data_url" => {
                    let mime_type = non_empty(attachment.mime_type.as_deref())
                        .or_else(|| non_empty(params.mime_type.as_deref()))
                        .unwrap_or(DEFAULT_IMAGE_MIME_TYPE);
                    Ok(MediaInput::ImageDataUrl(DataUrl::new(mime_type, attachment.data.clone())))
                }
                other => {
                    Err(KimiError::UnsupportedValue(format!("unknown encoding mode: {other}")))
                }
            }
        }
        other => Err(KimiError::UnsupportedValue(format!("unknown image source: {other}"))),
    }
}

fn required_url(raw: Option<&str>, field: &str) -> Result<String, KimiError> {
    non_empty(raw)
        .map(str::to_string)
        .ok_or_else(|| KimiError::MissingInput(format!("{field} is required")))
}

fn non_empty(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|value| !value.is_empty())
}

fn parse_image_detail(raw: Option<&str>) -> Result<ImageDetail, KimiError> {
    match raw.map(str::trim).unwrap_or("auto") {
        "auto" => Ok(ImageDetail::Auto),
        "low" => Ok(ImageDetail::Low),
        "high" => Ok(ImageDetail::High),
        other => Err(KimiError::UnsupportedValue(format!("unknown image detail: {other}"))),
    }
}

fn parse_raw_messages(raw: &str) -> Result<Vec<PayloadMessage>, KimiError> {
    let raw = if raw.trim().is_empty() { "[]" } else { raw };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(messages)) => Ok(messages.into_iter().map(PayloadMessage::Raw).collect()),
        Ok(_) => Err(KimiError::MalformedInput(
            "invalid messages JSON: messagesJson must be an array".to_string(),
        )),
        Err(err) => Err(KimiError::MalformedInput(format!("invalid messages JSON: {err}"))),
    }
}

fn parse_tools(raw: Option<&str>) -> Result<Option<Vec<Value>>, KimiError> {
    let Some(raw) = non_empty(raw) else {
        return Ok(None);
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(tools)) => Ok(Some(tools).filter(|tools| !tools.is_empty())),
        Ok(_) => Err(KimiError::MalformedInput(
            "invalid tools JSON: tools_json must be an array".to_string(),
        )),
        Err(err) => Err(KimiError::MalformedInput(format!("invalid tools JSON: {err}"))),
    }
}

pub(crate) fn parse_response_format(
    raw: Option<&str>,
) -> Result<Option<ResponseFormatType>, KimiError> {
    match non_empty(raw) {
        None => Ok(None),
        Some("text") => Ok(Some(ResponseFormatType::Text)),
        Some("json_object") => Ok(Some(ResponseFormatType::JsonObject)),
        Some(other) => {
            Err(KimiError::UnsupportedValue(format!("unknown response format: {other}")))
        }
    }
}

fn parse_tool_choice(raw: Option<&str>) -> Result<Option<ToolChoice>, KimiError> {
    match non_empty(raw) {
        None => Ok(None),
        Some("auto") => Ok(Some(ToolChoice::Auto)),
        Some("required") => Ok(Some(ToolChoice::Required)),
        Some("none") => Ok(Some(ToolChoice::None)),
        Some(other) => Err(KimiError::UnsupportedValue(format!("unknown tool choice: {other}"))),
    }
}

fn positive_max_tokens(raw: Option<i64>) -> Option<u32> {
    raw.filter(|value| *value > 0).map(|value| u32::try_from(value).unwrap_or(u32::MAX))
}

/// Maps user options onto the payload, filling gaps from the model family.
fn apply_options(
    payload: &mut ChatCompletionPayload,
    options: &RequestOptions,
    family: Option<&FamilyRule>,
) -> Result<(), KimiError> {
    let defaults = family.map(|rule| rule.defaults);
    let instant_mode = options.instant_mode.unwrap_or(false);

    payload.temperature =
        options.temperature.or_else(|| defaults.map(|d| d.temperature(instant_mode)));
    payload.top_p = options.top_p.or_else(|| defaults.map(|d| d.top_p));
    payload.max_tokens =
        positive_max_tokens(options.max_tokens).or_else(|| defaults.map(|d| d.max_tokens));
    payload.presence_penalty = options.presence_penalty;
    payload.frequency_penalty = options.frequency_penalty;
    payload.response_format = parse_response_format(options.response_format.as_deref())?
        .or_else(|| defaults.and_then(|d| d.response_format))
        .map(|kind| ResponseFormat { kind });

    payload.tools = parse_tools(options.tools_json.as_deref())?;
    payload.tool_choice = parse_tool_choice(options.tool_choice.as_deref())?
        .filter(|choice| *choice != ToolChoice::None);

    if instant_mode && family.is_some() {
        payload.thinking = Some(ThinkingConfig { kind: ThinkingType::Disabled });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltRequest {
    pub path: &'static str,
    pub base_url: String,
    pub timeout: Option<Duration>,
    pub payload: ChatCompletionPayload,
}

pub struct RequestBuilder<'a> {
    policies: &'a ModelPolicyTable,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(policies: &'a ModelPolicyTable) -> Self {
        Self { policies }
    }

    pub fn build(
        &self,
        model: &str,
        inputs: &ComposeInputs,
        options: &RequestOptions,
        credential_base_url: Option<&str>,
    ) -> Result<BuiltRequest, KimiError> {
        let model = model.trim();
        if model.is_empty() {
            return Err(KimiError::MissingInput("model is required".to_string()));
        }

        let mut payload = ChatCompletionPayload::new(model, inputs.to_messages()?);
        let family = self.policies.resolve(model);
        apply_options(&mut payload, options, family)?;

        debug!(
            event = "request.payload.built",
            operation = inputs.operation().as_str(),
            model,
            family = family.map(|rule| rule.family.as_str()).unwrap_or("none"),
            policy_version = self.policies.version(),
            messages = payload.messages.len(),
            has_tools = payload.tools.is_some(),
            thinking_disabled = payload.thinking.is_some()
        );

        Ok(BuiltRequest {
            path: CHAT_COMPLETIONS_PATH,
            base_url: resolve_base_url(options.base_url.as_deref(), credential_base_url),
            timeout: options.timeout.filter(|ms| *ms > 0).map(Duration::from_millis),
            payload,
        })
    }

    /// Resolves node parameters against one input item and builds its request.
    pub fn build_from_parameters(
        &self,
        params: &KimiNodeParameters,
        item: &InputItem,
        credential_base_url: Option<&str>,
    ) -> Result<BuiltRequest, KimiError> {
        let operation = params.operation.parse::<Operation>()?;
        let inputs = ComposeInputs::from_parameters(operation, params, item)?;
        self.build(params.model.value(), &inputs, &params.options, credential_base_url)
    }
}
