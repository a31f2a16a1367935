use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use kimi_clients::{MockMoonshotClient, MoonshotClient};
use kimi_clients_usage::{InMemoryTrackingSink, TrackingSnapshot};
use kimi_contracts::{
    ChainOptions, ChatMessage, CredentialTestResult, ExecutionItem, InputItem, KimiChainParameters,
    KimiNodeParameters, ListSearchResult, ListSearchResults, ModelLocator, NodeDescription,
};
use kimi_core::{
    KimiChainNode, KimiCredentials, KimiError, KimiNode, LlmTracing, ModelCatalog, MoonshotApi,
    Node, llm_tracing::LlmResult,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use utoipa::{IntoParams, OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

pub mod config;

use config::{AppConfig, ConfigError};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
struct NodesResponse {
    nodes: Vec<NodeDescription>,
}

#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct ModelsQuery {
    /// Case-insensitive substring of the model id or name.
    filter: Option<String>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct ExecuteRequest {
    parameters: KimiNodeParameters,
    #[serde(default = "single_empty_item")]
    items: Vec<InputItem>,
    #[serde(default)]
    continue_on_fail: bool,
}

fn single_empty_item() -> Vec<InputItem> {
    vec![InputItem::default()]
}

#[derive(Debug, Clone, Serialize, ToSchema)]
struct ExecuteResponse {
    items: Vec<ExecutionItem>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct ItemErrorResponse {
    error: String,
    item_index: usize,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
struct ChainInvokeRequest {
    #[serde(default)]
    model: ModelLocator,
    #[serde(default)]
    options: ChainOptions,
    #[schema(value_type = Vec<Object>)]
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
struct ChainInvokeResponse {
    #[schema(value_type = Object)]
    generation: LlmResult,
    #[schema(value_type = Object)]
    tracking: TrackingSnapshot,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
struct ChainErrorResponse {
    error: String,
    #[schema(value_type = Object)]
    tracking: TrackingSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
struct ErrorResponse {
    error: String,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        get_nodes,
        get_models,
        post_credentials_test,
        post_kimi_execute,
        post_kimi_chain_invoke
    ),
    components(
        schemas(
            HealthResponse,
            NodesResponse,
            ErrorResponse,
            ItemErrorResponse,
            ExecuteRequest,
            ExecuteResponse,
            ChainInvokeRequest,
            ChainInvokeResponse,
            ChainErrorResponse,
            NodeDescription,
            ListSearchResult,
            ListSearchResults,
            CredentialTestResult
        )
    ),
    tags(
        (name = "kimi-app", description = "Kimi node host API")
    )
)]
struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    kimi: Arc<KimiNode>,
    chain: Arc<KimiChainNode>,
}

impl AppState {
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        let api_key = match (&config.api_key, config.mock_provider) {
            (Some(key), _) => key.clone(),
            (None, true) => "mock".to_string(),
            (None, false) => return Err(ConfigError::MissingApiKey),
        };
        let credentials = KimiCredentials::new(api_key)
            .map_err(|_| ConfigError::MissingApiKey)?
            .with_base_url(config.base_url.clone());

        let api: Arc<dyn MoonshotApi> = if config.mock_provider {
            Arc::new(MockMoonshotClient::new())
        } else {
            Arc::new(MoonshotClient::for_credentials(
                &credentials,
                config.provider_timeout_seconds,
                Some(config.provider_max_inflight),
            ))
        };
        let catalog = Arc::new(if config.fallback_models.is_empty() {
            ModelCatalog::builtin()
        } else {
            ModelCatalog::from_ids(&config.fallback_models)
        });

        info!(
            event = "app.state.ready",
            mock_provider = config.mock_provider,
            base_url = %credentials.effective_base_url(),
            fallback_models = catalog.fallback().len()
        );

        Ok(Self {
            kimi: Arc::new(
                KimiNode::new(api.clone(), credentials.clone()).with_catalog(catalog.clone()),
            ),
            chain: Arc::new(KimiChainNode::new(api, credentials).with_catalog(catalog)),
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/api/v1/nodes", get(get_nodes))
        .route("/api/v1/models", get(get_models))
        .route("/api/v1/credentials/test", post(post_credentials_test))
        .route("/api/v1/nodes/kimi/execute", post(post_kimi_execute))
        .route("/api/v1/nodes/kimi-chain/invoke", post(post_kimi_chain_invoke))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service health", body = HealthResponse)),
    tag = "kimi-app"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy".to_string() })
}

#[utoipa::path(
    get,
    path = "/api/v1/nodes",
    responses(
        (status = 200, description = "Descriptions of the hosted nodes", body = NodesResponse)
    ),
    tag = "kimi-app"
)]
async fn get_nodes(State(state): State<AppState>) -> Json<NodesResponse> {
    Json(NodesResponse { nodes: vec![state.kimi.describe(), state.chain.describe()] })
}

#[utoipa::path(
    get,
    path = "/api/v1/models",
    params(ModelsQuery),
    responses((status = 200, description = "Model list-search results", body = ListSearchResults)),
    tag = "kimi-app"
)]
async fn get_models(
    State(state): State<AppState>,
    Query(query): Query<ModelsQuery>,
) -> Json<ListSearchResults> {
    Json(state.kimi.search_models(query.filter.as_deref()).await)
}

#[utoipa::path(
    post,
    path = "/api/v1/credentials/test",
    responses((status = 200, description = "Credential test outcome", body = CredentialTestResult)),
    tag = "kimi-app"
)]
async fn post_credentials_test(State(state): State<AppState>) -> Json<CredentialTestResult> {
    Json(state.kimi.test_credentials().await)
}

#[utoipa::path(
    post,
    path = "/api/v1/nodes/kimi/execute",
    request_body = ExecuteRequest,
    responses(
        (status = 200, description = "One output item per input item", body = ExecuteResponse),
        (
            status = 400,
            description = "An item failed and aborted the batch",
            body = ItemErrorResponse
        )
    ),
    tag = "kimi-app"
)]
#[instrument(
    skip(state, request),
    fields(operation = %request.parameters.operation, items = request.items.len())
)]
async fn post_kimi_execute(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Response {
    match state.kimi.execute(&request.parameters, &request.items, request.continue_on_fail).await {
        Ok(items) => Json(ExecuteResponse { items }).into_response(),
        Err(err) => {
            warn!(
                event = "app.execute.aborted",
                item_index = err.item_index,
                error_kind = err.source.kind(),
                error = %err.source
            );
            (
                StatusCode::BAD_REQUEST,
                Json(ItemErrorResponse {
                    error: err.source.to_string(),
                    item_index: err.item_index,
                }),
            )
                .into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/nodes/kimi-chain/invoke",
    request_body = ChainInvokeRequest,
    responses(
        (status = 200, description = "Generation plus tracked runs", body = ChainInvokeResponse),
        (status = 400, description = "Invalid options", body = ErrorResponse),
        (status = 502, description = "Model call failed", body = ChainErrorResponse)
    ),
    tag = "kimi-app"
)]
#[instrument(skip(state, request), fields(model = %request.model.value()))]
async fn post_kimi_chain_invoke(
    State(state): State<AppState>,
    Json(request): Json<ChainInvokeRequest>,
) -> Response {
    let sink = InMemoryTrackingSink::new();
    let tracker = Arc::new(LlmTracing::new(Arc::new(sink.clone())));
    let params = KimiChainParameters { model: request.model, options: request.options };

    let model = match state.chain.supply_data(&params, vec![tracker]) {
        Ok(model) => model,
        Err(err) => return error_response(err),
    };

    match model.invoke(&request.messages).await {
        Ok(generation) => {
            let tracking = sink.snapshot().await;
            Json(ChainInvokeResponse { generation, tracking }).into_response()
        }
        Err(err) => (
            StatusCode::BAD_GATEWAY,
            Json(ChainErrorResponse { error: err.to_string(), tracking: sink.snapshot().await }),
        )
            .into_response(),
    }
}

fn error_response(err: KimiError) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: err.to_string() })).into_response()
}
