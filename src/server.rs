use crate::client::ProviderClient;
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::models::ModelDirectory;
use crate::proxy;
use crate::translate::anthropic_types::{ErrorResponse, MessagesRequest};
use crate::translate::ollama_types::{OllamaChatRequest, OllamaError};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Listed by `GET /v1/models` when no normal/small model is configured.
const DEFAULT_CLAUDE_MODELS: &[&str] = &[
    "claude-3-sonnet-20240229",
    "claude-3-haiku-20240307",
    "claude-3-opus-20240229",
];

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub provider: Arc<dyn ProviderClient>,
    pub models: Arc<ModelDirectory>,
}

impl AppState {
    pub fn new(config: ProxyConfig, provider: Arc<dyn ProviderClient>) -> Self {
        let models = Arc::new(ModelDirectory::new(&config.model_cache));
        Self {
            config: Arc::new(config),
            provider,
            models,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root).head(handle_root_head))
        .route("/v1/messages", post(handle_messages))
        .route("/v1/tool-response", post(handle_messages))
        .route("/v1/models", get(handle_models))
        .route("/health", get(handle_health))
        .route("/api/tags", get(handle_tags))
        .route("/api/v0/models", get(handle_model_records))
        .route("/api/show", post(handle_show))
        .route("/api/chat", post(handle_ollama_chat))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn anthropic_error_response(err: &ProxyError) -> Response {
    let (status, body) = proxy::anthropic_error(err);
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(body)).into_response()
}

fn ollama_error_response(err: &ProxyError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(proxy::ollama_error(err))).into_response()
}

fn validate_messages_request(req: &MessagesRequest) -> Result<(), ProxyError> {
    if req.model.trim().is_empty() {
        return Err(ProxyError::invalid_request("model: field required"));
    }
    if req.messages.is_empty() {
        return Err(ProxyError::invalid_request("messages: at least one message is required"));
    }
    Ok(())
}

async fn handle_messages(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let req: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse request");
            let err = ErrorResponse::invalid_request(format!("Invalid request body: {e}"));
            return (StatusCode::BAD_REQUEST, Json(err)).into_response();
        }
    };
    if let Err(e) = validate_messages_request(&req) {
        tracing::warn!(error = %e, "Rejected request");
        return anthropic_error_response(&e);
    }

    let is_streaming = req.stream.unwrap_or(state.config.stream_default);
    tracing::info!(
        model = %req.model,
        streaming = is_streaming,
        messages = req.messages.len(),
        tools = req.tools.as_ref().map_or(0, Vec::len),
        "Messages request"
    );

    if is_streaming {
        let events = proxy::proxy_messages_stream(&req, state.config.clone(), state.provider.clone())
            .map(|sse| Ok::<_, Infallible>(Event::default().event(sse.event).data(sse.data)));
        Sse::new(events).keep_alive(KeepAlive::default()).into_response()
    } else {
        match proxy::proxy_messages(&req, &state.config, state.provider.as_ref()).await {
            Ok(resp) => Json(resp).into_response(),
            Err(e) => {
                tracing::error!(error = %e, "Proxy error");
                anthropic_error_response(&e)
            }
        }
    }
}

async fn handle_ollama_chat(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let req: OllamaChatRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse Ollama chat request");
            let err = OllamaError::new(format!("invalid request body: {e}"));
            return (StatusCode::BAD_REQUEST, Json(err)).into_response();
        }
    };
    if req.model.trim().is_empty() {
        return ollama_error_response(&ProxyError::invalid_request("model is required"));
    }

    tracing::info!(
        model = %req.model,
        streaming = req.wants_stream(),
        messages = req.messages.len(),
        "Ollama chat request"
    );

    if req.wants_stream() {
        let lines = proxy::proxy_ollama_chat_stream(&req, &state.config, state.provider.clone());
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/x-ndjson")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(lines))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    } else {
        match proxy::proxy_ollama_chat(&req, &state.config, state.provider.as_ref()).await {
            Ok(resp) => Json(resp).into_response(),
            Err(e) => {
                tracing::error!(error = %e, "Proxy error");
                ollama_error_response(&e)
            }
        }
    }
}

async fn handle_tags(State(state): State<Arc<AppState>>) -> Response {
    let list = state
        .models
        .fetch_models(state.provider.clone(), state.config.fallback_model())
        .await;
    Json(list.to_tags()).into_response()
}

/// LM Studio style listing: the full normalized records.
async fn handle_model_records(State(state): State<Arc<AppState>>) -> Response {
    let list = state
        .models
        .fetch_models(state.provider.clone(), state.config.fallback_model())
        .await;
    Json(list).into_response()
}

async fn handle_show(body: Bytes) -> Json<Value> {
    let name = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("model")
                .or_else(|| v.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_default();

    Json(json!({
        "license": "",
        "modelfile": format!("FROM {name}"),
        "parameters": "",
        "template": "{{ .Prompt }}",
        "modified_at": chrono::Utc::now().to_rfc3339(),
        "details": {
            "format": "proxy",
            "family": "proxy",
            "parameter_size": "",
            "quantization_level": "",
        },
        "model_info": {},
        "capabilities": ["completion", "tools"],
    }))
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let created = chrono::Utc::now().timestamp();
    let models = &state.config.models;

    let mut ids: Vec<&str> = Vec::new();
    for id in [models.normal.trim(), models.small.trim()] {
        if !id.is_empty() && !ids.contains(&id) {
            ids.push(id);
        }
    }
    if ids.is_empty() {
        ids.extend_from_slice(DEFAULT_CLAUDE_MODELS);
    }

    let data: Vec<Value> = ids
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": "anthropic",
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": data }))
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "backend": state.config.backend.name,
        "dialect": state.provider.dialect(),
        "base_url": state.provider.base_url(),
        "api_key_configured": state.config.resolve_api_key().is_some(),
    }))
}

async fn handle_root() -> &'static str {
    "Ollama is running"
}

async fn handle_root_head() -> StatusCode {
    StatusCode::OK
}
