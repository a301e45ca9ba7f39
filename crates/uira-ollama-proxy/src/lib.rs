//! Uira Ollama Proxy - serve the Ollama API from an OpenAI-compatible backend.
//!
//! IDE integrations that only know how to talk to a local Ollama daemon speak
//! `/api/tags`, `/api/show` and `/api/chat`. This crate exposes that surface and
//! translates every call to the OpenAI-style `/v1/models` and
//! `/v1/chat/completions` endpoints served by LiteLLM, vLLM, llama.cpp and
//! friends.
//!
//! Layout:
//! - [`types`]: Ollama wire format (what clients send and receive).
//! - [`openai`]: OpenAI wire format (what the backend sends and receives).
//! - [`ir`]: protocol-neutral shapes both sides map through.
//! - [`translation`]: pure conversions between the three.
//! - [`streaming`]: SSE to NDJSON relay.
//! - [`registry`]: cached model inventory.
//! - [`backend`]: HTTP client for the backend.
//! - [`server`]: the axum router.

pub mod backend;
pub mod config;
pub mod error;
pub mod ir;
pub mod openai;
pub mod registry;
pub mod server;
pub mod streaming;
pub mod translation;
pub mod types;

pub use config::{ProxyConfig, SamplingDefaults};
pub use error::{ProxyError, ProxyResult};
pub use registry::ModelRegistry;
pub use server::{serve, ProxyServer};
