//! Axum HTTP server.
//!
//! Exposes Ollama-compatible endpoints:
//! - `GET /`, `GET /health`, `GET /api/version`
//! - `GET /api/tags`, `POST /api/show`
//! - `POST /api/chat`
//!
//! plus OpenAI passthrough on `GET /v1/models` and `POST /v1/chat/completions`.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::{stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::backend::BackendClient;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::ir::{ChatRequest, ChatResponseChunk};
use crate::registry::{infer_capabilities, Capability, ModelEntry, ModelRegistry};
use crate::types::{
    self, ModelDetails, ModelTag, ShowRequest, ShowResponse, TagsResponse, VersionResponse,
};
use crate::{streaming, translation};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub backend: BackendClient,
    pub registry: ModelRegistry,
}

pub struct ProxyServer {
    state: AppState,
}

impl ProxyServer {
    /// Build a server whose registry is fed by the backend's `/v1/models`.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let backend = BackendClient::new(&config)?;
        let registry = ModelRegistry::with_refresh_timeout(
            Arc::new(backend.clone()),
            config.model_cache_ttl(),
            config.model_refresh_timeout(),
        );
        Ok(Self::with_parts(config, backend, registry))
    }

    /// Build a server around an existing registry (tests inject stub sources).
    pub fn with_registry(config: ProxyConfig, registry: ModelRegistry) -> Result<Self> {
        let backend = BackendClient::new(&config)?;
        Ok(Self::with_parts(config, backend, registry))
    }

    fn with_parts(config: ProxyConfig, backend: BackendClient, registry: ModelRegistry) -> Self {
        Self {
            state: AppState {
                config: Arc::new(config),
                backend,
                registry,
            },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/api/version", get(version_handler))
            .route("/api/tags", get(tags_handler))
            .route("/api/show", post(show_handler))
            .route("/api/chat", post(chat_handler))
            .route("/v1/models", get(openai_models_handler))
            .route("/v1/chat/completions", post(openai_chat_handler))
            .fallback(not_found)
            .method_not_allowed_fallback(method_not_allowed)
            .layer(middleware::from_fn(log_request))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    pub async fn run(self) -> Result<()> {
        let addr = self.state.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;

        info!(
            addr = %addr,
            backend = %self.state.backend.base_url(),
            "uira-ollama-proxy listening"
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("server error")?;

        Ok(())
    }
}

pub async fn serve(config: ProxyConfig) -> Result<()> {
    ProxyServer::new(config)?.run().await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    info!(
        %method,
        %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "404 page not found" }))).into_response()
}

async fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({ "error": "405 method not allowed" })),
    )
        .into_response()
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> ProxyResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| ProxyError::client_input(format!("malformed JSON body: {}", e)))
}

fn client_auth(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Run `fut` under the configured per-request deadline. On expiry the future
/// is dropped, which closes any backend connection it holds.
async fn within_deadline<T>(
    state: &AppState,
    fut: impl Future<Output = ProxyResult<T>>,
) -> ProxyResult<T> {
    tokio::time::timeout(state.config.request_timeout(), fut)
        .await
        .map_err(|_| ProxyError::BackendTimeout {
            timeout_secs: state.config.request_timeout_secs,
        })?
}

async fn root_handler() -> &'static str {
    "Ollama is running"
}

async fn health_handler(State(state): State<AppState>) -> ProxyResult<Json<Value>> {
    let models = within_deadline(&state, state.backend.list_models(None)).await?;
    Ok(Json(json!({
        "status": "ok",
        "backend": state.backend.base_url(),
        "models": models.data.len(),
    })))
}

async fn version_handler(State(state): State<AppState>) -> Json<VersionResponse> {
    Json(VersionResponse {
        version: state.config.reported_version.clone(),
    })
}

fn model_tag(entry: &ModelEntry) -> ModelTag {
    ModelTag {
        name: entry.name.clone(),
        model: entry.name.clone(),
        modified_at: entry.modified_at,
        size: entry.size_bytes,
        digest: String::new(),
        details: ModelDetails::default(),
    }
}

async fn tags_handler(State(state): State<AppState>) -> ProxyResult<Json<TagsResponse>> {
    let entries = within_deadline(&state, state.registry.list()).await?;
    Ok(Json(TagsResponse {
        models: entries.iter().map(model_tag).collect(),
    }))
}

async fn show_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> ProxyResult<Json<ShowResponse>> {
    let req: ShowRequest = if body.is_empty() {
        ShowRequest::default()
    } else {
        parse_json(&body)?
    };
    let name = req
        .model_name()
        .ok_or_else(|| ProxyError::client_input("missing required field 'model'"))?
        .to_string();

    let lookup = within_deadline(&state, state.registry.get(&name)).await;
    let (capabilities, modified_at) = match lookup {
        Ok(Some(entry)) => (entry.capability_names(), entry.modified_at),
        Ok(None) => return Err(ProxyError::ModelNotFound(name)),
        Err(err) => {
            warn!(error = %err, model = %name, "registry unavailable, guessing capabilities");
            let guessed = infer_capabilities(&name);
            (
                guessed.iter().map(Capability::as_str).map(str::to_string).collect(),
                None,
            )
        }
    };

    let mut model_info = Map::new();
    model_info.insert("general.architecture".into(), json!("CausalLM"));
    model_info.insert("general.basename".into(), json!(name));

    Ok(Json(ShowResponse {
        modelfile: format!("FROM {}\n", name),
        parameters: String::new(),
        template: String::new(),
        details: ModelDetails::default(),
        model_info,
        capabilities,
        modified_at,
    }))
}

async fn chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ProxyResult<Response> {
    let wire: types::ChatRequest = parse_json(&body)?;
    let req = ChatRequest::try_from(wire)?;
    let outgoing = translation::to_backend(&req, &state.config.defaults);
    let auth = client_auth(&headers);

    debug!(
        model = %req.model,
        stream = req.stream,
        messages = req.messages.len(),
        tools = req.tools.as_ref().map_or(0, Vec::len),
        "chat request"
    );

    if req.stream {
        return stream_chat(&state, req.model, outgoing, auth).await;
    }

    let response = within_deadline(&state, state.backend.chat(&outgoing, auth.as_deref())).await?;
    let response = translation::from_backend(response, &req.model)?;
    Ok(Json(translation::response_to_ollama(response)).into_response())
}

/// Open the backend stream and relay it as NDJSON.
///
/// The request deadline covers everything up to the first relayed chunk, so a
/// backend that fails before producing output still gets a proper error status.
async fn stream_chat(
    state: &AppState,
    model: String,
    outgoing: crate::openai::ChatCompletionRequest,
    auth: Option<String>,
) -> ProxyResult<Response> {
    let idle_timeout = state.config.stream_idle_timeout();
    let backend = state.backend.clone();

    let opened = async move {
        let upstream = backend.chat_stream(&outgoing, auth.as_deref()).await?;
        let mut relayed = Box::pin(streaming::relay(upstream.bytes_stream(), idle_timeout));
        let first = relayed.next().await;
        Ok::<_, ProxyError>((first, relayed))
    };
    let (first, rest) = within_deadline(state, opened).await?;

    let first = match first {
        Some(Ok(chunk)) => chunk,
        Some(Err(err)) => return Err(err),
        None => {
            return Err(ProxyError::StreamInterrupted(
                "backend stream ended without data".to_string(),
            ))
        }
    };

    let lines = stream::once(async move { Ok::<ChatResponseChunk, ProxyError>(first) })
        .chain(rest)
        .map(move |item| {
            let bytes = match item {
                Ok(chunk) => streaming::ndjson_lines(&chunk, &model, Utc::now()),
                Err(err) => Bytes::from(format!("{}\n", json!({ "error": err.to_string() }))),
            };
            Ok::<Bytes, Infallible>(bytes)
        });

    Ok((
        [
            (CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson")),
            (CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ],
        Body::from_stream(lines),
    )
        .into_response())
}

/// Copy a backend response through untouched, streaming the body.
fn passthrough_response(upstream: reqwest::Response) -> Response {
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| HeaderValue::from_str(v).ok());

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}

async fn openai_models_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ProxyResult<Response> {
    let auth = client_auth(&headers);
    let upstream = within_deadline(
        &state,
        state
            .backend
            .forward(Method::GET, "/v1/models", None, auth.as_deref()),
    )
    .await?;
    Ok(passthrough_response(upstream))
}

async fn openai_chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ProxyResult<Response> {
    parse_json::<Value>(&body)?;
    let auth = client_auth(&headers);
    let upstream = within_deadline(
        &state,
        state
            .backend
            .forward(Method::POST, "/v1/chat/completions", Some(body), auth.as_deref()),
    )
    .await?;
    Ok(passthrough_response(upstream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelSource;
    use async_trait::async_trait;
    use std::time::Duration;

    struct FixedSource(Option<Vec<&'static str>>);

    #[async_trait]
    impl ModelSource for FixedSource {
        async fn fetch_models(&self) -> ProxyResult<Vec<ModelEntry>> {
            match &self.0 {
                Some(names) => Ok(names
                    .iter()
                    .map(|n| ModelEntry {
                        name: n.to_string(),
                        backend_id: n.to_string(),
                        size_bytes: Some(42),
                        modified_at: None,
                        capabilities: infer_capabilities(n),
                    })
                    .collect()),
                None => Err(ProxyError::BackendUnavailable {
                    url: "http://stub".into(),
                    reason: "down".into(),
                }),
            }
        }
    }

    async fn start_test_server(models: Option<Vec<&'static str>>) -> String {
        let config = ProxyConfig {
            backend_base_url: "http://127.0.0.1:1".to_string(),
            ..ProxyConfig::default()
        };
        let registry = ModelRegistry::new(Arc::new(FixedSource(models)), Duration::from_secs(60));
        let server = ProxyServer::with_registry(config, registry).unwrap();
        let app = server.router();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_root_reports_running() {
        let base_url = start_test_server(Some(vec![])).await;
        let resp = reqwest::get(format!("{}/", base_url)).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "Ollama is running");
    }

    #[tokio::test]
    async fn test_unknown_path_and_wrong_method() {
        let base_url = start_test_server(Some(vec![])).await;
        let client = reqwest::Client::new();

        let resp = client.get(format!("{}/api/nope", base_url)).send().await.unwrap();
        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].is_string());

        let resp = client.get(format!("{}/api/chat", base_url)).send().await.unwrap();
        assert_eq!(resp.status(), 405);
    }

    #[tokio::test]
    async fn test_tags_lists_registry_models() {
        let base_url = start_test_server(Some(vec!["m1", "qwen2.5-coder"])).await;
        let body: Value = reqwest::get(format!("{}/api/tags", base_url))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let models = body["models"].as_array().unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0]["name"], "m1");
        assert_eq!(models[0]["model"], "m1");
        assert_eq!(models[1]["size"], 42);
    }

    #[tokio::test]
    async fn test_tags_without_any_snapshot_is_503() {
        let base_url = start_test_server(None).await;
        let resp = reqwest::get(format!("{}/api/tags", base_url)).await.unwrap();
        assert_eq!(resp.status(), 503);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("registry"));
    }

    #[tokio::test]
    async fn test_show_known_and_unknown_models() {
        let base_url = start_test_server(Some(vec!["qwen2.5-coder:latest"])).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/api/show", base_url))
            .json(&json!({"model": "qwen2.5-coder"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["capabilities"], json!(["completion", "tools", "insert"]));
        assert_eq!(body["model_info"]["general.architecture"], "CausalLM");

        let resp = client
            .post(format!("{}/api/show", base_url))
            .json(&json!({"name": "ghost"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_show_falls_back_to_heuristic_when_registry_down() {
        let base_url = start_test_server(None).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/api/show", base_url))
            .json(&json!({"model": "nomic-embed-text"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["capabilities"], json!(["embedding"]));
    }

    #[tokio::test]
    async fn test_show_requires_model() {
        let base_url = start_test_server(Some(vec![])).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/api/show", base_url))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn test_version_is_reported() {
        let base_url = start_test_server(Some(vec![])).await;
        let body: Value = reqwest::get(format!("{}/api/version", base_url))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["version"], crate::config::DEFAULT_REPORTED_VERSION);
    }
}
