//! Backend for Ollama's native API.
//!
//! [`OllamaBackend`] translates normalized [`ChatRequest`]s into Ollama's
//! `/api/chat` endpoint and [`EmbedRequest`]s into `/api/embed`.

use super::{
    send_json, token_count, Backend, ChatOptions, ChatRequest, ChatResponse, EmbedRequest,
    EmbedResponse, FormatHint, Usage,
};
use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

/// Backend for Ollama's native API.
///
/// Sampling options go into the `options` object (`num_predict` for max
/// tokens, `num_ctx` for the context window). JSON mode is `format: "json"`;
/// a schema hint sends the JSON Schema itself as `format`.
#[derive(Debug, Clone, Default)]
pub struct OllamaBackend;

impl OllamaBackend {
    /// Build the Ollama `options` object.
    fn build_options(options: &ChatOptions) -> Value {
        let mut opts = serde_json::Map::new();
        if let Some(t) = options.temperature {
            opts.insert("temperature".into(), json!(t));
        }
        if let Some(n) = options.max_tokens {
            opts.insert("num_predict".into(), json!(n));
        }
        if let Some(s) = options.seed {
            opts.insert("seed".into(), json!(s));
        }
        if let Some(n) = options.num_ctx {
            opts.insert("num_ctx".into(), json!(n));
        }
        if let Some(p) = options.top_p {
            opts.insert("top_p".into(), json!(p));
        }
        for (k, v) in &options.extra {
            opts.insert(k.clone(), v.clone());
        }
        Value::Object(opts)
    }

    /// Build the JSON body for `/api/chat`.
    fn build_chat_body(request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": false,
            "options": Self::build_options(&request.options),
        });
        match request.format {
            FormatHint::None => {}
            FormatHint::Json => body["format"] = json!("json"),
            FormatHint::Schema(ref schema) => body["format"] = schema.clone(),
        }
        body
    }

    fn parse_chat_response(json_resp: &Value) -> Result<ChatResponse> {
        let text = json_resp
            .pointer("/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PipelineError::UnexpectedResponse {
                provider: "ollama",
                message: "missing message.content".into(),
            })?
            .to_string();

        Ok(ChatResponse {
            text,
            usage: Usage {
                prompt_tokens: token_count(json_resp, "/prompt_eval_count"),
                completion_tokens: token_count(json_resp, "/eval_count"),
            },
        })
    }

    fn parse_embed_response(json_resp: &Value, expected: usize) -> Result<EmbedResponse> {
        let vectors = parse_vectors(json_resp.get("embeddings"), |v| Some(v)).ok_or_else(|| {
            PipelineError::UnexpectedResponse {
                provider: "ollama",
                message: "missing or malformed embeddings".into(),
            }
        })?;
        if vectors.len() != expected {
            return Err(PipelineError::UnexpectedResponse {
                provider: "ollama",
                message: format!("expected {} embeddings, got {}", expected, vectors.len()),
            });
        }
        Ok(EmbedResponse {
            vectors,
            usage: Usage {
                prompt_tokens: token_count(json_resp, "/prompt_eval_count"),
                completion_tokens: 0,
            },
        })
    }
}

/// Decode an array of embedding entries, using `select` to reach the number
/// array inside each entry.
pub(crate) fn parse_vectors<'a>(
    entries: Option<&'a Value>,
    select: impl Fn(&'a Value) -> Option<&'a Value>,
) -> Option<Vec<Vec<f32>>> {
    entries?
        .as_array()?
        .iter()
        .map(|entry| {
            select(entry)?
                .as_array()?
                .iter()
                .map(|x| x.as_f64().map(|f| f as f32))
                .collect::<Option<Vec<f32>>>()
        })
        .collect()
}

#[async_trait]
impl Backend for OllamaBackend {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &ChatRequest,
    ) -> Result<ChatResponse> {
        let url = format!("{}/api/chat", base_url.trim_end_matches('/'));
        let body = Self::build_chat_body(request);
        let json_resp = send_json(client.post(&url).json(&body)).await?;
        Self::parse_chat_response(&json_resp)
    }

    async fn embed(
        &self,
        client: &Client,
        base_url: &str,
        request: &EmbedRequest,
    ) -> Result<EmbedResponse> {
        let url = format!("{}/api/embed", base_url.trim_end_matches('/'));
        let body = json!({"model": request.model, "input": request.input});
        let json_resp = send_json(client.post(&url).json(&body)).await?;
        Self::parse_embed_response(&json_resp, request.input.len())
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChatMessage;

    fn test_request() -> ChatRequest {
        ChatRequest {
            model: "llama3:8b".into(),
            messages: vec![
                ChatMessage::system("You write novels."),
                ChatMessage::user("Outline a heist story."),
            ],
            options: ChatOptions::default(),
            format: FormatHint::None,
        }
    }

    #[test]
    fn test_ollama_chat_payload() {
        let mut request = test_request();
        request.options = ChatOptions {
            temperature: Some(0.7),
            max_tokens: Some(2048),
            seed: Some(42),
            num_ctx: Some(16384),
            ..Default::default()
        };

        let body = OllamaBackend::build_chat_body(&request);
        assert_eq!(body["model"], "llama3:8b");
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["temperature"], 0.7);
        assert_eq!(body["options"]["num_predict"], 2048);
        assert_eq!(body["options"]["seed"], 42);
        assert_eq!(body["options"]["num_ctx"], 16384);
        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "Outline a heist story.");
        assert!(body.get("format").is_none());
    }

    #[test]
    fn test_ollama_format_hints() {
        let mut request = test_request();
        request.format = FormatHint::Json;
        assert_eq!(OllamaBackend::build_chat_body(&request)["format"], "json");

        let schema = json!({"type": "object", "properties": {}});
        request.format = FormatHint::Schema(schema.clone());
        assert_eq!(OllamaBackend::build_chat_body(&request)["format"], schema);
    }

    #[test]
    fn test_ollama_extra_options_merged() {
        let mut request = test_request();
        request.options.extra.insert("mirostat".into(), json!(2));
        let body = OllamaBackend::build_chat_body(&request);
        assert_eq!(body["options"]["mirostat"], 2);
        assert!(body["options"].get("temperature").is_none());
    }

    #[test]
    fn test_ollama_parse_chat_response() {
        let resp = json!({
            "model": "llama3:8b",
            "message": {"role": "assistant", "content": "{\"title\": \"Vault\"}"},
            "done": true,
            "prompt_eval_count": 26,
            "eval_count": 298
        });
        let parsed = OllamaBackend::parse_chat_response(&resp).unwrap();
        assert_eq!(parsed.text, "{\"title\": \"Vault\"}");
        assert_eq!(parsed.usage.prompt_tokens, 26);
        assert_eq!(parsed.usage.completion_tokens, 298);

        let err = OllamaBackend::parse_chat_response(&json!({"done": true})).unwrap_err();
        assert!(matches!(err, PipelineError::UnexpectedResponse { .. }));
    }

    #[test]
    fn test_ollama_parse_embed_response() {
        let resp = json!({"embeddings": [[0.1, 0.2], [0.3, 0.4]], "prompt_eval_count": 8});
        let parsed = OllamaBackend::parse_embed_response(&resp, 2).unwrap();
        assert_eq!(parsed.vectors.len(), 2);
        assert!((parsed.vectors[1][0] - 0.3).abs() < 1e-6);
        assert_eq!(parsed.usage.prompt_tokens, 8);

        assert!(OllamaBackend::parse_embed_response(&resp, 3).is_err());
    }
}
