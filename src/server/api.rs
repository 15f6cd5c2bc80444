//! HTTP handlers
//!
//! Thin validation and dispatch into the generation engine and model manager.
//! Streaming responses are server-sent events: one `data:` event per chunk,
//! then `data: [DONE]`.

use std::convert::Infallible;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::inference::registry::MODEL_REGISTRY;
use crate::inference::{GenerationOptions, GenerationRequest, ModelError, TextStream};
use crate::server::state::AppState;
use crate::storage::huggingface::list_local_models;
use crate::system::gpu::GpuKind;
use crate::system::resources::{cpu_count, get_resource_usage, ResourceUsage};
use crate::types::message::{flatten, ChatMessage, Role};
use crate::types::model::{ModelConfig, ModelInfoView};

/// Error body returned by every failing handler: `{"detail": ...}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: detail.into(),
        }
    }
}

impl From<ModelError> for ApiError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::LoadBusy => Self::bad_request(e.to_string()),
            ModelError::LoadFailure { .. } | ModelError::GenerationFailure(_) => {
                Self::internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("Request failed: {}", self.detail);
        }
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

// --- Request / response bodies ---

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub options: GenerationOptions,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub options: GenerationOptions,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub prompts: Vec<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(flatten)]
    pub options: GenerationOptions,
}

#[derive(Debug, Deserialize)]
pub struct LoadModelRequest {
    pub model_id: String,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub response: String,
}

#[derive(Debug, Serialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub responses: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ModelActionResponse {
    pub success: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AvailableModelsResponse {
    pub models: Vec<ModelConfig>,
    /// GGUF files already in the models directory
    pub local_files: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AcceleratorSummary {
    pub available: bool,
    pub kind: GpuKind,
    pub name: String,
    pub vram_total_mb: u64,
    pub vram_free_mb: Option<u64>,
    /// Percentage of accelerator memory in use, when readable
    pub memory_usage_percent: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct SystemInfoResponse {
    pub version: &'static str,
    pub backend: &'static str,
    pub cpu_count: usize,
    pub ram: ResourceUsage,
    pub ram_usage_percent: f64,
    pub gpu: AcceleratorSummary,
    pub active_model: Option<ModelInfoView>,
    /// Seconds since the active model was last used
    pub model_idle_secs: Option<f64>,
    pub model_loading: bool,
    pub uptime_secs: f64,
    pub request_count: u64,
}

// --- Generation ---

/// Wrap a text stream as server-sent events
fn sse_response(text: TextStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let chunks = text
        .into_stream()
        .map(|chunk| Ok(Event::default().data(chunk.replace('\r', ""))));
    let done = stream::once(async { Ok(Event::default().data("[DONE]")) });
    Sse::new(chunks.chain(done)).keep_alive(KeepAlive::default())
}

/// POST /generate
pub async fn generate(
    State(state): State<AppState>,
    Json(body): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    let request = GenerationRequest::new(body.prompt)
        .with_model(body.model_id)
        .with_options(body.options);

    if body.stream {
        let text = state.engine.stream(&request).await?;
        return Ok(sse_response(text).into_response());
    }

    let response = state.engine.generate(&request).await?;
    Ok(Json(GenerateResponse { response }).into_response())
}

/// POST /chat
pub async fn chat(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    if body.messages.is_empty() {
        return Err(ApiError::bad_request("No messages provided"));
    }

    if body.stream {
        let request = GenerationRequest::new(flatten(&body.messages))
            .with_model(body.model_id)
            .with_options(body.options);
        let text = state.engine.stream(&request).await?;
        return Ok(sse_response(text).into_response());
    }

    let content = state
        .engine
        .chat(&body.messages, body.model_id, &body.options)
        .await?;
    Ok(Json(ChatResponse {
        choices: vec![ChatChoice {
            message: ChatMessage::new(Role::Assistant, content),
        }],
    })
    .into_response())
}

/// POST /generate/batch
pub async fn batch_generate(
    State(state): State<AppState>,
    Json(body): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    if body.prompts.is_empty() {
        return Err(ApiError::bad_request("No prompts provided"));
    }

    let responses = state
        .engine
        .batch_generate(&body.prompts, body.model_id, &body.options)
        .await?;
    Ok(Json(BatchResponse { responses }))
}

// --- Model management ---

/// POST /models/load
pub async fn load_model(
    State(state): State<AppState>,
    Json(body): Json<LoadModelRequest>,
) -> Result<Json<ModelActionResponse>, ApiError> {
    let model_id = body.model_id.trim();
    if model_id.is_empty() {
        return Err(ApiError::bad_request("model_id must not be empty"));
    }

    state.manager().load(model_id).await?;
    Ok(Json(ModelActionResponse {
        success: true,
        status: "success".to_string(),
        model_id: state.manager().current_model_id().await,
    }))
}

/// POST /models/unload
pub async fn unload_model(State(state): State<AppState>) -> Json<ModelActionResponse> {
    let status = if state.manager().unload().await {
        "Model unloaded successfully"
    } else {
        "No model was loaded"
    };
    Json(ModelActionResponse {
        success: true,
        status: status.to_string(),
        model_id: None,
    })
}

/// GET /models/current
pub async fn current_model(State(state): State<AppState>) -> Response {
    match state.manager().get_info().await {
        Some(info) => Json(info).into_response(),
        None => Json(json!({ "status": "No model loaded" })).into_response(),
    }
}

/// GET /models/available
pub async fn available_models(State(state): State<AppState>) -> Json<AvailableModelsResponse> {
    let local_files = list_local_models(&state.settings.models_directory)
        .iter()
        .filter_map(|p| p.file_name().map(|f| f.to_string_lossy().into_owned()))
        .collect();
    Json(AvailableModelsResponse {
        models: MODEL_REGISTRY.to_vec(),
        local_files,
    })
}

// --- Health & system ---

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

/// GET /system/info
pub async fn system_info(State(state): State<AppState>) -> Result<Json<SystemInfoResponse>, ApiError> {
    let backend = state.manager().backend().clone();
    let (accelerator, memory, ram) = tokio::task::spawn_blocking(move || {
        (
            backend.detect_accelerator(),
            backend.memory_usage(),
            get_resource_usage(),
        )
    })
    .await
    .map_err(|e| ApiError::internal(format!("System info unavailable: {}", e)))?;

    let active_model = state.manager().get_info().await;
    let model_idle_secs = match active_model {
        Some(_) => Some(state.manager().idle_time().await.as_secs_f64()),
        None => None,
    };

    Ok(Json(SystemInfoResponse {
        version: env!("CARGO_PKG_VERSION"),
        backend: state.manager().backend().name(),
        cpu_count: cpu_count(),
        ram_usage_percent: ram.usage_percent(),
        ram,
        gpu: AcceleratorSummary {
            available: accelerator.available,
            kind: accelerator.kind,
            name: accelerator.name,
            vram_total_mb: accelerator.vram_total_mb,
            vram_free_mb: accelerator.vram_free_mb,
            memory_usage_percent: memory.map(|m| m.utilization() * 100.0),
        },
        active_model,
        model_idle_secs,
        model_loading: state.manager().is_loading(),
        uptime_secs: state.started_at.elapsed().as_secs_f64(),
        request_count: state.request_count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::engine::tests::fake_engine;
    use crate::inference::fake::FakeScript;
    use crate::server::build_router;
    use crate::server::middleware::{PROCESS_TIME_HEADER, REQUEST_COUNT_HEADER};
    use crate::storage::settings::Settings;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use axum::Router;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(script: &FakeScript) -> (Router, AppState) {
        let state = AppState::new(Arc::new(fake_engine(script)), Settings::default());
        (build_router(state.clone()), state)
    }

    fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, String) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let (status, body) = send(router, request).await;
        (status, serde_json::from_str(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _) = app(&FakeScript::default());
        let (status, body) = send_json(&router, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "healthy" }));
    }

    #[tokio::test]
    async fn test_generate_buffered() {
        let script = FakeScript::default();
        let (router, _) = app(&script);

        let (status, body) =
            send_json(&router, post("/generate", json!({ "prompt": "Hi" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"], "Hello from qwen-0.5b");
    }

    #[tokio::test]
    async fn test_generate_accepts_string_parameters() {
        let script = FakeScript::default();
        let (router, _) = app(&script);

        let request = post(
            "/generate",
            json!({ "prompt": "Hi", "temperature": "0.3", "max_length": 64 }),
        );
        let (status, _) = send_json(&router, request).await;
        assert_eq!(status, StatusCode::OK);

        let sampling = script.samplings();
        assert!((sampling[0].temperature - 0.3).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_generate_streams_sse() {
        let script = FakeScript::default();
        script.respond("qwen-0.5b", "abcd");
        let (router, _) = app(&script);

        let (status, body) = send(
            &router,
            post("/generate", json!({ "prompt": "Hi", "stream": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let events: Vec<&str> = body
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .collect();
        assert_eq!(events, vec!["ab", "cd", "[DONE]"]);
    }

    #[tokio::test]
    async fn test_chat_returns_assistant_message() {
        let script = FakeScript::default();
        let (router, _) = app(&script);

        let request = post(
            "/chat",
            json!({ "messages": [{ "role": "user", "content": "Hi" }] }),
        );
        let (status, body) = send_json(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["choices"][0]["message"]["role"], "assistant");
        assert_eq!(body["choices"][0]["message"]["content"], "Hello from qwen-0.5b");
    }

    #[tokio::test]
    async fn test_empty_inputs_are_rejected() {
        let (router, _) = app(&FakeScript::default());

        let (status, body) =
            send_json(&router, post("/generate/batch", json!({ "prompts": [] }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "No prompts provided");

        let (status, _) = send_json(&router, post("/chat", json!({ "messages": [] }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_batch_generate() {
        let (router, _) = app(&FakeScript::default());

        let (status, body) = send_json(
            &router,
            post("/generate/batch", json!({ "prompts": ["a", "b"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["responses"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_model_lifecycle_routes() {
        let (router, _) = app(&FakeScript::default());

        let (_, body) = send_json(&router, get("/models/current")).await;
        assert_eq!(body["status"], "No model loaded");

        let (status, body) =
            send_json(&router, post("/models/load", json!({ "model_id": "phi-2" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["model_id"], "phi-2");

        let (_, body) = send_json(&router, get("/models/current")).await;
        assert_eq!(body["model_id"], "phi-2");

        let (_, body) = send_json(&router, post("/models/unload", json!({}))).await;
        assert_eq!(body["status"], "Model unloaded successfully");
        let (_, body) = send_json(&router, post("/models/unload", json!({}))).await;
        assert_eq!(body["status"], "No model was loaded");
    }

    #[tokio::test]
    async fn test_load_failure_is_500() {
        let script = FakeScript::default();
        script.fail_load("phi-2").fail_load("qwen-0.5b");
        let (router, _) = app(&script);

        let (status, body) =
            send_json(&router, post("/models/load", json!({ "model_id": "phi-2" }))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["detail"].as_str().unwrap().contains("qwen-0.5b"));
    }

    #[tokio::test]
    async fn test_concurrent_load_is_400() {
        let script = FakeScript::default();
        script.load_delay(Duration::from_millis(200));
        let (router, _) = app(&script);

        let first = tokio::spawn({
            let router = router.clone();
            async move { send(&router, post("/models/load", json!({ "model_id": "phi-2" }))).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (status, body) =
            send_json(&router, post("/models/load", json!({ "model_id": "qwen-0.5b" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "Another model is currently loading");
        assert_eq!(first.await.unwrap().0, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_available_models_lists_registry() {
        let (router, _) = app(&FakeScript::default());
        let (_, body) = send_json(&router, get("/models/available")).await;
        let ids: Vec<&str> = body["models"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|m| m["id"].as_str())
            .collect();
        assert!(ids.contains(&"qwen-0.5b"));
        assert!(ids.contains(&"phi-2"));
    }

    #[tokio::test]
    async fn test_system_info_and_request_headers() {
        let (router, state) = app(&FakeScript::default());

        let response = router.clone().oneshot(get("/health")).await.unwrap();
        assert!(response.headers().contains_key(PROCESS_TIME_HEADER));
        assert_eq!(response.headers()[REQUEST_COUNT_HEADER], "1");

        let (status, body) = send_json(&router, get("/system/info")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backend"], "fake");
        assert_eq!(body["request_count"], 2);
        assert!(body["active_model"].is_null());
        assert_eq!(state.request_count(), 2);
    }
}
