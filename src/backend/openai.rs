//! Backend for OpenAI-compatible APIs.
//!
//! [`OpenAiBackend`] covers OpenAI itself and OpenRouter, which speaks the
//! same wire format under `https://openrouter.ai/api`.
//!
//! Endpoints: `/v1/chat/completions` and `/v1/embeddings`.

use super::ollama::parse_vectors;
use super::{
    send_json, token_count, Backend, ChatRequest, ChatResponse, EmbedRequest, EmbedResponse,
    FormatHint, Usage,
};
use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

/// Backend for any OpenAI-compatible API.
///
/// # Example
///
/// ```
/// use novel_pipeline::backend::OpenAiBackend;
///
/// let openai = OpenAiBackend::new().with_api_key("sk-...");
/// let openrouter = OpenAiBackend::openrouter().with_api_key("sk-or-...");
/// ```
#[derive(Clone)]
pub struct OpenAiBackend {
    /// Optional API key. If set, sent as `Authorization: Bearer {key}`.
    pub(crate) api_key: Option<String>,
    /// Optional organization ID. If set, sent as `OpenAI-Organization: {org}`.
    pub(crate) organization: Option<String>,
    label: &'static str,
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("label", &self.label)
            .field("api_key", &self.api_key.as_deref().map(redact))
            .field("organization", &self.organization)
            .finish()
    }
}

/// Keep a short prefix of a secret for identification.
pub(crate) fn redact(key: &str) -> String {
    match key.get(..6) {
        Some(prefix) if key.len() > 6 => format!("{}***", prefix),
        _ => "***".to_string(),
    }
}

impl OpenAiBackend {
    /// Create a backend for the OpenAI API without authentication.
    pub fn new() -> Self {
        Self {
            api_key: None,
            organization: None,
            label: "openai",
        }
    }

    /// Create a backend for OpenRouter.
    pub fn openrouter() -> Self {
        Self {
            label: "openrouter",
            ..Self::new()
        }
    }

    /// Set the API key for authentication.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the organization ID header.
    pub fn with_organization(mut self, org: impl Into<String>) -> Self {
        self.organization = Some(org.into());
        self
    }

    /// Returns `true` if an API key has been configured.
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Build the request body for `/v1/chat/completions`.
    ///
    /// `num_ctx` and provider extras are Ollama-specific and skipped here.
    fn build_body(request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": false,
        });

        let opts = &request.options;
        if let Some(t) = opts.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(n) = opts.max_tokens {
            body["max_tokens"] = json!(n);
        }
        if let Some(s) = opts.seed {
            body["seed"] = json!(s);
        }
        if let Some(p) = opts.top_p {
            body["top_p"] = json!(p);
        }

        match request.format {
            FormatHint::None => {}
            FormatHint::Json => body["response_format"] = json!({"type": "json_object"}),
            FormatHint::Schema(ref schema) => {
                let name = schema_name(schema.get("title").and_then(|t| t.as_str()));
                body["response_format"] = json!({
                    "type": "json_schema",
                    "json_schema": {"name": name, "schema": schema, "strict": false},
                });
            }
        }

        body
    }

    /// Build the reqwest request with appropriate headers.
    fn build_http_request(
        &self,
        client: &Client,
        url: &str,
        body: &Value,
    ) -> reqwest::RequestBuilder {
        let mut req = client.post(url).json(body);

        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        if let Some(ref org) = self.organization {
            req = req.header("OpenAI-Organization", org.as_str());
        }

        req
    }

    fn parse_chat_response(&self, json_resp: &Value) -> Result<ChatResponse> {
        let text = json_resp
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PipelineError::UnexpectedResponse {
                provider: self.label,
                message: match json_resp.pointer("/error/message").and_then(|m| m.as_str()) {
                    Some(msg) => msg.to_string(),
                    None => "missing choices[0].message.content".into(),
                },
            })?
            .to_string();

        Ok(ChatResponse {
            text,
            usage: Usage {
                prompt_tokens: token_count(json_resp, "/usage/prompt_tokens"),
                completion_tokens: token_count(json_resp, "/usage/completion_tokens"),
            },
        })
    }

    fn parse_embed_response(&self, json_resp: &Value, expected: usize) -> Result<EmbedResponse> {
        let vectors = parse_vectors(json_resp.get("data"), |entry| entry.get("embedding"))
            .filter(|v| v.len() == expected)
            .ok_or_else(|| PipelineError::UnexpectedResponse {
                provider: self.label,
                message: format!("expected {} embeddings in data[]", expected),
            })?;
        Ok(EmbedResponse {
            vectors,
            usage: Usage {
                prompt_tokens: token_count(json_resp, "/usage/prompt_tokens"),
                completion_tokens: 0,
            },
        })
    }
}

impl Default for OpenAiBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &ChatRequest,
    ) -> Result<ChatResponse> {
        let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));
        let body = Self::build_body(request);
        let json_resp = send_json(self.build_http_request(client, &url, &body)).await?;
        self.parse_chat_response(&json_resp)
    }

    async fn embed(
        &self,
        client: &Client,
        base_url: &str,
        request: &EmbedRequest,
    ) -> Result<EmbedResponse> {
        let url = format!("{}/v1/embeddings", base_url.trim_end_matches('/'));
        let body = json!({"model": request.model, "input": request.input});
        let json_resp = send_json(self.build_http_request(client, &url, &body)).await?;
        self.parse_embed_response(&json_resp, request.input.len())
    }

    fn name(&self) -> &'static str {
        self.label
    }
}

/// `json_schema.name` must match `[A-Za-z0-9_-]{1,64}`.
fn schema_name(title: Option<&str>) -> String {
    let name: String = title
        .unwrap_or_default()
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .take(64)
        .collect();
    if name.is_empty() {
        "response".to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChatMessage, ChatOptions};

    fn test_request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o".into(),
            messages: vec![
                ChatMessage::system("You are a careful editor."),
                ChatMessage::user("Tighten this paragraph."),
            ],
            options: ChatOptions::default(),
            format: FormatHint::None,
        }
    }

    #[test]
    fn test_openai_chat_payload() {
        let mut request = test_request();
        request.options = ChatOptions {
            temperature: Some(0.7),
            max_tokens: Some(2048),
            seed: Some(9),
            num_ctx: Some(4096),
            ..Default::default()
        };

        let body = OpenAiBackend::build_body(&request);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["temperature"], 0.7);
        assert_eq!(body["max_tokens"], 2048);
        assert_eq!(body["seed"], 9);
        assert_eq!(body["stream"], false);
        assert!(body.get("num_ctx").is_none());
        assert!(body.get("options").is_none());
        assert!(body.get("response_format").is_none());

        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
    }

    #[test]
    fn test_openai_json_mode() {
        let mut request = test_request();
        request.format = FormatHint::Json;
        let body = OpenAiBackend::build_body(&request);
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_openai_schema_mode() {
        let mut request = test_request();
        request.format = FormatHint::Schema(json!({"title": "Chapter", "type": "object"}));
        let body = OpenAiBackend::build_body(&request);
        let rf = &body["response_format"];
        assert_eq!(rf["type"], "json_schema");
        assert_eq!(rf["json_schema"]["name"], "Chapter");
        assert_eq!(rf["json_schema"]["schema"]["type"], "object");
    }

    #[test]
    fn test_openai_schema_name_is_sanitized() {
        let mut request = test_request();
        request.format = FormatHint::Schema(json!({"title": "Chapter Plan (v2)", "type": "object"}));
        let body = OpenAiBackend::build_body(&request);
        assert_eq!(body["response_format"]["json_schema"]["name"], "Chapter_Plan__v2_");
        // The schema itself keeps its title.
        assert_eq!(
            body["response_format"]["json_schema"]["schema"]["title"],
            "Chapter Plan (v2)"
        );

        assert_eq!(schema_name(None), "response");
        assert_eq!(schema_name(Some("  ")), "response");
        assert_eq!(schema_name(Some("ok-name_1")), "ok-name_1");
        assert_eq!(schema_name(Some(&"x".repeat(80))).len(), 64);
    }

    #[test]
    fn test_openai_auth_header() {
        let backend = OpenAiBackend::new()
            .with_api_key("sk-test123")
            .with_organization("org-abc");

        let client = Client::new();
        let body = json!({"test": true});
        let req = backend
            .build_http_request(&client, "https://api.openai.com/v1/chat/completions", &body)
            .build()
            .expect("build request");

        assert_eq!(req.headers().get("Authorization").expect("auth"), "Bearer sk-test123");
        assert_eq!(req.headers().get("OpenAI-Organization").expect("org"), "org-abc");
    }

    #[test]
    fn test_openai_no_auth() {
        let client = Client::new();
        let req = OpenAiBackend::new()
            .build_http_request(&client, "http://localhost/v1/chat/completions", &json!({}))
            .build()
            .expect("build request");
        assert!(req.headers().get("Authorization").is_none());
    }

    #[test]
    fn test_parse_chat_response() {
        let backend = OpenAiBackend::openrouter();
        let resp = json!({
            "choices": [{"message": {"role": "assistant", "content": "Done."}}],
            "usage": {"prompt_tokens": 9, "completion_tokens": 12}
        });
        let parsed = backend.parse_chat_response(&resp).unwrap();
        assert_eq!(parsed.text, "Done.");
        assert_eq!(parsed.usage.total(), 21);

        let err = backend
            .parse_chat_response(&json!({"error": {"message": "no credits"}}))
            .unwrap_err();
        match err {
            PipelineError::UnexpectedResponse { provider, message } => {
                assert_eq!(provider, "openrouter");
                assert_eq!(message, "no credits");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_embed_response() {
        let backend = OpenAiBackend::new();
        let resp = json!({
            "data": [{"embedding": [0.5, 0.25]}, {"embedding": [1.0, 0.0]}],
            "usage": {"prompt_tokens": 4}
        });
        let parsed = backend.parse_embed_response(&resp, 2).unwrap();
        assert_eq!(parsed.vectors[0], vec![0.5, 0.25]);
        assert_eq!(parsed.usage.prompt_tokens, 4);
        assert!(backend.parse_embed_response(&resp, 1).is_err());
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let backend = OpenAiBackend::new().with_api_key("sk-1234567890abcdef");
        let debug_output = format!("{:?}", backend);
        assert!(!debug_output.contains("1234567890abcdef"));
        assert!(debug_output.contains("sk-123"));
        assert!(debug_output.contains("***"));
    }

    #[test]
    fn test_names() {
        assert_eq!(OpenAiBackend::new().name(), "openai");
        assert_eq!(OpenAiBackend::openrouter().name(), "openrouter");
        assert!(!OpenAiBackend::new().has_api_key());
    }
}
