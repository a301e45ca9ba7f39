//! HTTP client for the OpenAI-compatible backend.
//!
//! Knows the backend's `/v1/models` and `/v1/chat/completions` endpoints and
//! nothing about Ollama. Transport failures are classified into
//! [`ProxyError`] variants here so callers never see a raw `reqwest::Error`.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response};
use tracing::{debug, error};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::openai::{self, ChatCompletionRequest, ChatCompletionResponse, ModelList};
use crate::registry::{ModelEntry, ModelSource};

#[derive(Debug, Clone)]
pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl BackendClient {
    pub fn new(config: &ProxyConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        // No overall timeout: it would cut long streams. Deadlines are applied
        // per request by the router and per idle gap by the relay.
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            client,
            base_url: config.backend_base_url_trimmed(),
            api_key: config.backend_api_key.clone(),
            timeout_secs: config.request_timeout_secs,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// The client's own `Authorization` header wins and is passed through
    /// verbatim; otherwise the configured key is used.
    fn authorize(&self, builder: RequestBuilder, auth: Option<&str>) -> RequestBuilder {
        match (auth, &self.api_key) {
            (Some(header), _) => builder.header(AUTHORIZATION, header),
            (None, Some(key)) => builder.bearer_auth(key),
            (None, None) => builder,
        }
    }

    async fn send(&self, url: &str, builder: RequestBuilder) -> ProxyResult<Response> {
        builder.send().await.map_err(|e| {
            error!(error = %e, url, "backend request failed");
            ProxyError::from_transport(url, &e, self.timeout_secs)
        })
    }

    /// Turn a non-2xx answer into [`ProxyError::BackendProtocol`], keeping the
    /// backend's own message.
    async fn ensure_success(&self, url: &str, response: Response) -> ProxyResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        error!(%status, body = %body, url, "backend error");
        Err(ProxyError::BackendProtocol {
            status: status.as_u16(),
            message: openai::extract_error_message(&body),
        })
    }

    async fn decode_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        response: Response,
    ) -> ProxyResult<T> {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProxyError::from_transport(url, &e, self.timeout_secs))?;
        serde_json::from_slice(&bytes).map_err(|e| ProxyError::BackendProtocol {
            status: 502,
            message: format!("backend returned invalid JSON: {}", e),
        })
    }

    pub async fn list_models(&self, auth: Option<&str>) -> ProxyResult<ModelList> {
        let url = self.url("/v1/models");
        let builder = self.authorize(self.client.get(&url), auth);
        let response = self.send(&url, builder).await?;
        let response = self.ensure_success(&url, response).await?;
        self.decode_json(&url, response).await
    }

    pub async fn chat(
        &self,
        body: &ChatCompletionRequest,
        auth: Option<&str>,
    ) -> ProxyResult<ChatCompletionResponse> {
        let url = self.url("/v1/chat/completions");
        debug!(model = %body.model, stream = false, "forwarding chat request");
        let builder = self.authorize(self.client.post(&url).json(body), auth);
        let response = self.send(&url, builder).await?;
        let response = self.ensure_success(&url, response).await?;
        self.decode_json(&url, response).await
    }

    /// Open a streaming completion. The returned response has a 2xx status;
    /// its body is the SSE stream.
    pub async fn chat_stream(
        &self,
        body: &ChatCompletionRequest,
        auth: Option<&str>,
    ) -> ProxyResult<Response> {
        let url = self.url("/v1/chat/completions");
        debug!(model = %body.model, stream = true, "forwarding chat request");
        let builder = self
            .authorize(self.client.post(&url).json(body), auth)
            .header("accept", "text/event-stream");
        let response = self.send(&url, builder).await?;
        self.ensure_success(&url, response).await
    }

    /// Forward an OpenAI-format request untouched. Status and body are left to
    /// the caller.
    pub async fn forward(
        &self,
        method: Method,
        path: &str,
        body: Option<Bytes>,
        auth: Option<&str>,
    ) -> ProxyResult<Response> {
        let url = self.url(path);
        let mut builder = self.authorize(self.client.request(method, &url), auth);
        if let Some(body) = body {
            builder = builder.header(CONTENT_TYPE, "application/json").body(body);
        }
        self.send(&url, builder).await
    }
}

#[async_trait]
impl ModelSource for BackendClient {
    async fn fetch_models(&self) -> ProxyResult<Vec<ModelEntry>> {
        let list = self.list_models(None).await?;
        Ok(list.data.into_iter().map(ModelEntry::from_backend).collect())
    }
}
