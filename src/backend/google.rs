//! Backend for Google's Gemini API.
//!
//! Chat goes to `v1beta/models/{model}:generateContent`; embeddings to
//! `v1beta/models/{model}:batchEmbedContents`. System turns are folded into
//! `systemInstruction`, assistant turns are sent with the `model` role.

use super::ollama::parse_vectors;
use super::{
    send_json, Backend, ChatRequest, ChatResponse, EmbedRequest, EmbedResponse, FormatHint, Role,
    Usage,
};
use crate::backend::openai::redact;
use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Backend for the Gemini `generateContent` API.
#[derive(Clone)]
pub struct GoogleBackend {
    api_key: String,
}

impl std::fmt::Debug for GoogleBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleBackend")
            .field("api_key", &redact(&self.api_key))
            .finish()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

impl GoogleBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }

    fn build_request(request: &ChatRequest) -> GenerateRequest {
        let mut system = Vec::new();
        let mut contents = Vec::new();
        for m in &request.messages {
            let part = Part {
                text: m.content.clone(),
            };
            match m.role {
                Role::System => system.push(part),
                Role::User => contents.push(Content {
                    role: "user",
                    parts: vec![part],
                }),
                Role::Assistant => contents.push(Content {
                    role: "model",
                    parts: vec![part],
                }),
            }
        }

        let opts = &request.options;
        GenerateRequest {
            contents,
            system_instruction: (!system.is_empty()).then_some(SystemInstruction { parts: system }),
            generation_config: GenerationConfig {
                temperature: opts.temperature,
                max_output_tokens: opts.max_tokens,
                seed: opts.seed,
                top_p: opts.top_p,
                response_mime_type: match request.format {
                    FormatHint::None => None,
                    FormatHint::Json | FormatHint::Schema(_) => Some("application/json"),
                },
            },
        }
    }

    fn parse_response(resp: GenerateResponse) -> Result<ChatResponse> {
        let usage = resp.usage_metadata.unwrap_or_default();
        let first = resp
            .candidates
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| PipelineError::UnexpectedResponse {
                provider: "google",
                message: "response has no candidates".into(),
            })?;

        let parts = first.content.map(|c| c.parts).unwrap_or_default();
        if parts.is_empty() {
            return Err(PipelineError::UnexpectedResponse {
                provider: "google",
                message: format!(
                    "empty candidate, finish reason: {}",
                    first.finish_reason.as_deref().unwrap_or("UNKNOWN")
                ),
            });
        }

        Ok(ChatResponse {
            text: parts.into_iter().map(|p| p.text).collect(),
            usage: Usage {
                prompt_tokens: usage.prompt_token_count,
                completion_tokens: usage.candidates_token_count,
            },
        })
    }

    fn endpoint(base_url: &str, model: &str, method: &str) -> String {
        format!(
            "{}/v1beta/models/{}:{}",
            base_url.trim_end_matches('/'),
            model,
            method
        )
    }
}

#[async_trait]
impl Backend for GoogleBackend {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &ChatRequest,
    ) -> Result<ChatResponse> {
        let url = Self::endpoint(base_url, &request.model, "generateContent");
        let body = Self::build_request(request);
        let json_resp = send_json(
            client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&body),
        )
        .await?;
        let parsed: GenerateResponse = serde_json::from_value(json_resp).map_err(|e| {
            PipelineError::UnexpectedResponse {
                provider: "google",
                message: e.to_string(),
            }
        })?;
        Self::parse_response(parsed)
    }

    async fn embed(
        &self,
        client: &Client,
        base_url: &str,
        request: &EmbedRequest,
    ) -> Result<EmbedResponse> {
        let url = Self::endpoint(base_url, &request.model, "batchEmbedContents");
        let model_path = format!("models/{}", request.model);
        let requests: Vec<_> = request
            .input
            .iter()
            .map(|text| json!({"model": model_path, "content": {"parts": [{"text": text}]}}))
            .collect();
        let json_resp = send_json(
            client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&json!({"requests": requests})),
        )
        .await?;

        let vectors = parse_vectors(json_resp.get("embeddings"), |e| e.get("values"))
            .filter(|v| v.len() == request.input.len())
            .ok_or_else(|| PipelineError::UnexpectedResponse {
                provider: "google",
                message: "missing or malformed embeddings".into(),
            })?;
        Ok(EmbedResponse {
            vectors,
            usage: Usage::default(),
        })
    }

    fn name(&self) -> &'static str {
        "google"
    }
}
