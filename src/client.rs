//! Structured generation client.
//!
//! [`StructuredClient`] owns one [`BackendAdapter`] per registered model
//! identifier and turns an unreliable text generator into one that either
//! returns structurally valid output or fails after a bounded number of
//! attempts.
//!
//! Two nested loops do the work:
//!
//! - the JSON loop ([`safe_generate_json`](StructuredClient::safe_generate_json))
//!   asks for a reply, extracts and repairs JSON, and on failure drops the
//!   bad assistant turn and asks again with a fresh seed;
//! - the schema loop ([`safe_generate_schema`](StructuredClient::safe_generate_schema))
//!   runs the JSON loop, validates the object, and on violations appends a
//!   targeted correction turn before asking again.
//!
//! Transport failures never reach these loops as retries; adapters resolve
//! them with backoff and surface only terminal errors.

use crate::backend::{BackendAdapter, ChatMessage, ChatOptions, FormatHint, Role, Usage};
use crate::config::{GenerationConfig, PipelineConfig};
use crate::diagnostics::GenerationDiagnostics;
use crate::error::Result;
use crate::events::{emit, Event, EventHandler};
use crate::parsing::{parse_json, ExtractError};
use crate::provider::ModelSpec;
use crate::schema::{correction_message, SchemaDescriptor, Violation};
use crate::PipelineError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a free-text [`chat`](StructuredClient::chat) call.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    /// The assistant reply.
    pub text: String,
    /// The conversation including the reply.
    pub messages: Vec<ChatMessage>,
    pub usage: Usage,
}

/// Result of a structured generation call.
#[derive(Debug, Clone)]
pub struct StructuredOutcome {
    pub value: Value,
    /// The conversation that produced `value`, ending with its assistant turn.
    pub messages: Vec<ChatMessage>,
    pub diagnostics: GenerationDiagnostics,
}

/// Result of an [`embed`](StructuredClient::embed) call.
#[derive(Debug, Clone)]
pub struct EmbedOutcome {
    pub vectors: Vec<Vec<f32>>,
    pub usage: Usage,
}

/// Registry of model adapters plus the structured retry protocol.
///
/// # Example
///
/// ```
/// use novel_pipeline::backend::{BackendAdapter, MockBackend};
/// use novel_pipeline::client::StructuredClient;
/// use novel_pipeline::config::GenerationConfig;
/// use std::sync::Arc;
///
/// let adapter = BackendAdapter::builder("mock://outliner")
///     .backend(Arc::new(MockBackend::fixed(r#"{"title": "Dawn"}"#)))
///     .build()
///     .unwrap();
/// let client = StructuredClient::new(GenerationConfig::default()).with_adapter(adapter);
/// assert!(client.has_model("mock://outliner"));
/// ```
pub struct StructuredClient {
    adapters: HashMap<String, BackendAdapter>,
    generation: GenerationConfig,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl StructuredClient {
    /// An empty client. Register adapters with [`register`](Self::register).
    pub fn new(generation: GenerationConfig) -> Self {
        Self {
            adapters: HashMap::new(),
            generation,
            event_handler: None,
        }
    }

    /// Build a client with an adapter for every model an enabled stage uses.
    ///
    /// Fails on the first unsupported provider or missing credential.
    pub fn from_config(
        config: &PipelineConfig,
        event_handler: Option<Arc<dyn EventHandler>>,
    ) -> Result<Self> {
        let mut client = Self::new(config.generation.clone());
        client.event_handler = event_handler.clone();
        for id in config.active_models() {
            let spec: ModelSpec = id.parse()?;
            let adapter = BackendAdapter::from_spec(id, &spec, config)?
                .event_handler(event_handler.clone())
                .build()?;
            info!(model = %id, provider = %spec.provider, "registered model");
            client.register(adapter);
        }
        Ok(client)
    }

    /// Set the handler for retry events.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn with_adapter(mut self, adapter: BackendAdapter) -> Self {
        self.register(adapter);
        self
    }

    /// Register `adapter` under its label, replacing any previous one.
    pub fn register(&mut self, adapter: BackendAdapter) {
        self.adapters.insert(adapter.label().to_string(), adapter);
    }

    pub fn has_model(&self, model: &str) -> bool {
        self.adapters.contains_key(model)
    }

    pub fn generation(&self) -> &GenerationConfig {
        &self.generation
    }

    fn adapter(&self, model: &str) -> Result<&BackendAdapter> {
        self.adapters
            .get(model)
            .ok_or_else(|| PipelineError::UnknownModel(model.to_string()))
    }

    /// Free-text generation with no structural retry.
    pub async fn chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
    ) -> Result<ChatOutcome> {
        let adapter = self.adapter(model)?;
        let options = self.seeded(adapter, options, 0);
        let (messages, usage) = adapter.chat(messages, &options, &FormatHint::None).await?;
        let text = last_assistant(&messages).to_string();
        Ok(ChatOutcome {
            text,
            messages,
            usage,
        })
    }

    /// Generate until the reply contains parseable JSON.
    ///
    /// Makes at most `json_attempts` backend calls. Fails with
    /// [`PipelineError::MalformedOutput`] naming the attempt count.
    pub async fn safe_generate_json(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
    ) -> Result<StructuredOutcome> {
        let adapter = self.adapter(model)?;
        let mut diagnostics = GenerationDiagnostics::default();
        let result = self
            .json_loop(adapter, messages, options, &FormatHint::Json, &mut diagnostics)
            .await;
        self.finish(model, &diagnostics, result.is_ok());

        let (value, messages) = result?;
        Ok(StructuredOutcome {
            value,
            messages,
            diagnostics,
        })
    }

    /// Generate until the reply is a JSON object that satisfies `schema`.
    ///
    /// Fails with [`PipelineError::SchemaValidation`] listing every violated
    /// field once `schema_attempts` rounds are used up.
    pub async fn safe_generate_schema(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        schema: &SchemaDescriptor,
        options: &ChatOptions,
    ) -> Result<StructuredOutcome> {
        self.schema_call(model, messages, schema, options, false).await
    }

    /// Like [`safe_generate_schema`](Self::safe_generate_schema), but when
    /// attempts run out the last parsed object is returned instead of an
    /// error, with its remaining violations in
    /// [`GenerationDiagnostics::violations`].
    ///
    /// Still fails if no attempt produced a JSON object at all.
    pub async fn safe_generate_schema_or_last(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        schema: &SchemaDescriptor,
        options: &ChatOptions,
    ) -> Result<StructuredOutcome> {
        self.schema_call(model, messages, schema, options, true).await
    }

    /// Embed `texts` with `model`. Only transport retry applies.
    pub async fn embed(&self, model: &str, texts: &[String]) -> Result<EmbedOutcome> {
        let (vectors, usage) = self.adapter(model)?.embed(texts).await?;
        Ok(EmbedOutcome { vectors, usage })
    }

    async fn schema_call(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        schema: &SchemaDescriptor,
        options: &ChatOptions,
        fall_back: bool,
    ) -> Result<StructuredOutcome> {
        let adapter = self.adapter(model)?;
        let mut diagnostics = GenerationDiagnostics::default();
        let result = self
            .schema_loop(adapter, messages, schema, options, fall_back, &mut diagnostics)
            .await;
        self.finish(model, &diagnostics, result.is_ok() && diagnostics.ok());

        let (value, messages) = result?;
        Ok(StructuredOutcome {
            value,
            messages,
            diagnostics,
        })
    }

    async fn schema_loop(
        &self,
        adapter: &BackendAdapter,
        messages: Vec<ChatMessage>,
        schema: &SchemaDescriptor,
        options: &ChatOptions,
        fall_back: bool,
        diagnostics: &mut GenerationDiagnostics,
    ) -> Result<(Value, Vec<ChatMessage>)> {
        let max_attempts = self.generation.schema_attempts.max(1);
        let format = if self.generation.native_schema_format {
            FormatHint::Schema(schema.to_json_schema())
        } else {
            FormatHint::Json
        };

        let instruction = schema.format_instruction(self.generation.max_optional_fields);
        let mut history = messages;
        attach_instruction(&mut history, &instruction);

        // Last object seen, with the violations found in it.
        let mut last_object: Option<(Value, Vec<ChatMessage>, Vec<Violation>)> = None;
        let mut violations: Vec<Violation> = Vec::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                self.before_retry(adapter.label(), diagnostics.attempts + 1, &violations)
                    .await;
            }

            let (value, mut reply) = match self
                .json_loop(adapter, history, options, &format, diagnostics)
                .await
            {
                Ok(parsed) => parsed,
                Err(e @ PipelineError::MalformedOutput { .. }) if fall_back => {
                    return match last_object {
                        Some(last) => Ok(self.fall_back(adapter, schema, last, diagnostics)),
                        None => Err(e),
                    };
                }
                Err(e) => return Err(e),
            };

            violations = schema.validate(&value);

            if violations.is_empty() {
                debug!(
                    model = %adapter.label(),
                    schema = %schema.name,
                    attempts = diagnostics.attempts,
                    "schema validation passed"
                );
                return Ok((value, reply));
            }

            warn!(
                model = %adapter.label(),
                schema = %schema.name,
                attempt,
                violations = violations.len(),
                "schema validation failed"
            );

            let correction = if value.is_object() {
                correction_message(schema, &violations)
            } else {
                object_hint(schema)
            };
            if value.is_object() {
                last_object = Some((value, reply.clone(), violations.clone()));
            }
            reply.push(ChatMessage::user(correction));
            history = reply;
        }

        match last_object {
            Some(last) if fall_back => Ok(self.fall_back(adapter, schema, last, diagnostics)),
            _ => Err(PipelineError::SchemaValidation {
                model: adapter.label().to_string(),
                schema: schema.name.clone(),
                attempts: max_attempts,
                violations,
            }),
        }
    }

    fn fall_back(
        &self,
        adapter: &BackendAdapter,
        schema: &SchemaDescriptor,
        (value, messages, violations): (Value, Vec<ChatMessage>, Vec<Violation>),
        diagnostics: &mut GenerationDiagnostics,
    ) -> (Value, Vec<ChatMessage>) {
        warn!(
            model = %adapter.label(),
            schema = %schema.name,
            violations = violations.len(),
            "schema attempts exhausted, returning last object"
        );
        diagnostics.violations = violations;
        (value, messages)
    }

    async fn json_loop(
        &self,
        adapter: &BackendAdapter,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
        format: &FormatHint,
        diagnostics: &mut GenerationDiagnostics,
    ) -> Result<(Value, Vec<ChatMessage>)> {
        let max_attempts = self.generation.json_attempts.max(1);
        let original = messages.clone();
        let mut history = messages;
        let mut last_error = ExtractError::NoJson;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let reason = last_error.to_string();
                self.retry_pause(adapter.label(), diagnostics.attempts + 1, &reason)
                    .await;
            }

            let seeded = self.seeded(adapter, options, diagnostics.attempts);
            let (reply, usage) = adapter.chat(history, &seeded, format).await?;
            diagnostics.record_attempt(usage);
            history = reply;

            match parse_json(last_assistant(&history)) {
                Ok(parsed) => {
                    diagnostics.repaired = parsed.repaired;
                    return Ok((parsed.value, history));
                }
                Err(e) => {
                    warn!(
                        model = %adapter.label(),
                        attempt,
                        max_attempts,
                        error = %e,
                        "could not extract JSON from reply"
                    );
                    last_error = e;
                    repair_history(&mut history, &original);
                }
            }
        }

        Err(PipelineError::MalformedOutput {
            model: adapter.label().to_string(),
            attempts: max_attempts,
            last_error: last_error.to_string(),
        })
    }

    /// Options for the next send. The first send of a call uses the caller's
    /// seed, then the model's own, then `generation.seed`; every later send
    /// draws a fresh one.
    fn seeded(
        &self,
        adapter: &BackendAdapter,
        options: &ChatOptions,
        sends_so_far: u32,
    ) -> ChatOptions {
        let seed = if sends_so_far == 0 {
            options
                .seed
                .unwrap_or_else(|| adapter.seed_or(self.generation.seed))
        } else {
            fastrand::u64(..)
        };
        options.clone().with_seed(seed)
    }

    async fn before_retry(&self, model: &str, attempt: u32, violations: &[Violation]) {
        let reason = violations
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        self.retry_pause(model, attempt, &reason).await;
    }

    async fn retry_pause(&self, model: &str, attempt: u32, reason: &str) {
        emit(
            &self.event_handler,
            Event::RetryStart {
                model: model.to_string(),
                attempt,
                reason: reason.to_string(),
            },
        );
        let delay = self.generation.retry_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn finish(&self, model: &str, diagnostics: &GenerationDiagnostics, success: bool) {
        if diagnostics.attempts > 1 || !success {
            emit(
                &self.event_handler,
                Event::RetryEnd {
                    model: model.to_string(),
                    attempts: diagnostics.attempts,
                    success,
                },
            );
        }
        debug!(
            model,
            attempts = diagnostics.attempts,
            repaired = diagnostics.repaired,
            tokens = diagnostics.usage.total(),
            success,
            "generation finished"
        );
    }
}

impl std::fmt::Debug for StructuredClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut models: Vec<&String> = self.adapters.keys().collect();
        models.sort();
        f.debug_struct("StructuredClient")
            .field("models", &models)
            .field("generation", &self.generation)
            .field("has_event_handler", &self.event_handler.is_some())
            .finish()
    }
}

fn last_assistant(messages: &[ChatMessage]) -> &str {
    messages
        .last()
        .filter(|m| m.role == Role::Assistant)
        .map(|m| m.content.as_str())
        .unwrap_or_default()
}

/// Append the format instruction to the last user turn, or add one.
fn attach_instruction(history: &mut Vec<ChatMessage>, instruction: &str) {
    match history.iter().rposition(|m| m.role == Role::User) {
        Some(idx) => {
            let turn = &mut history[idx];
            turn.content.push_str("\n\n");
            turn.content.push_str(instruction);
        }
        None => history.push(ChatMessage::user(instruction)),
    }
}

/// Drop the rejected assistant turn; fall back to the original input when
/// what remains cannot be sent as-is.
fn repair_history(history: &mut Vec<ChatMessage>, original: &[ChatMessage]) {
    if history.last().map(|m| m.role) == Some(Role::Assistant) {
        history.pop();
    }
    let has_user = history.iter().any(|m| m.role == Role::User);
    let ends_with_user = history.last().map(|m| m.role) == Some(Role::User);
    if !has_user || !ends_with_user {
        *history = original.to_vec();
    }
}

fn object_hint(schema: &SchemaDescriptor) -> String {
    format!(
        "Your previous response was not a single JSON object. Respond with exactly one \
         JSON object matching the {} structure, not a list or a bare value.",
        schema.name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackoffConfig, MockBackend, MockStep};
    use crate::events::FnEventHandler;
    use crate::schema::FieldSpec;
    use std::sync::Mutex;
    use std::time::Duration;

    const MODEL: &str = "mock://writer";

    fn quick_config() -> GenerationConfig {
        GenerationConfig {
            retry_delay_ms: 0,
            ..Default::default()
        }
    }

    fn client_with(mock: Arc<MockBackend>) -> StructuredClient {
        let adapter = BackendAdapter::builder(MODEL)
            .backend(mock)
            .backoff(BackoffConfig::none())
            .build()
            .unwrap();
        StructuredClient::new(quick_config()).with_adapter(adapter)
    }

    fn prompt() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("You are a novelist."),
            ChatMessage::user("Summarize chapter one."),
        ]
    }

    fn chapter_schema() -> SchemaDescriptor {
        SchemaDescriptor::new("ChapterSummary")
            .field(FieldSpec::string("summary").required().describe("Short summary"))
            .field(FieldSpec::integer("word_count").required())
    }

    #[tokio::test]
    async fn test_json_succeeds_after_k_failures() {
        let mock = Arc::new(MockBackend::replies([
            "I'd rather not.",
            "still no json",
            r#"{"ok": true}"#,
        ]));
        let client = client_with(mock.clone());

        let out = client
            .safe_generate_json(MODEL, prompt(), &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(out.value["ok"], true);
        assert_eq!(mock.calls(), 3);
        assert_eq!(out.diagnostics.attempts, 3);
        assert_eq!(out.messages.last().unwrap().role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_json_exhaustion_stops_calling() {
        let mock = Arc::new(MockBackend::fixed("no braces anywhere"));
        let client = client_with(mock.clone());

        let err = client
            .safe_generate_json(MODEL, prompt(), &ChatOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedOutput { attempts: 3, .. }));
        assert!(err.to_string().contains('3'));
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_failed_reply_is_dropped_from_history() {
        let mock = Arc::new(MockBackend::replies(["nope", r#"{"a": 1}"#]));
        let client = client_with(mock.clone());
        client
            .safe_generate_json(MODEL, prompt(), &ChatOptions::default())
            .await
            .unwrap();

        let requests = mock.requests();
        assert_eq!(requests[1].messages, prompt());
    }

    #[tokio::test]
    async fn test_first_attempt_uses_configured_seed() {
        let mock = Arc::new(MockBackend::replies(["x", "y", r#"{"a": 1}"#]));
        let client = client_with(mock.clone());
        client
            .safe_generate_json(MODEL, prompt(), &ChatOptions::default())
            .await
            .unwrap();

        let seeds: Vec<Option<u64>> = mock.requests().iter().map(|r| r.options.seed).collect();
        assert_eq!(seeds[0], Some(42));
        assert!(seeds[1].is_some() && seeds[2].is_some());

        let mock = Arc::new(MockBackend::fixed(r#"{"a": 1}"#));
        let client = client_with(mock.clone());
        client
            .safe_generate_json(MODEL, prompt(), &ChatOptions::default().with_seed(7))
            .await
            .unwrap();
        assert_eq!(mock.requests()[0].options.seed, Some(7));
    }

    #[tokio::test]
    async fn test_repaired_flag() {
        let mock = Arc::new(MockBackend::fixed("```json\n{\"a\": 1,}\n```"));
        let client = client_with(mock);
        let out = client
            .safe_generate_json(MODEL, prompt(), &ChatOptions::default())
            .await
            .unwrap();
        assert!(out.diagnostics.repaired);
        assert_eq!(out.diagnostics.attempts, 1);
    }

    #[tokio::test]
    async fn test_schema_feedback_names_missing_field() {
        let mock = Arc::new(MockBackend::replies([
            r#"{"summary": "A storm hits the harbor."}"#,
            r#"{"summary": "A storm hits the harbor.", "word_count": 2400}"#,
        ]));
        let client = client_with(mock.clone());

        let out = client
            .safe_generate_schema(MODEL, prompt(), &chapter_schema(), &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(out.value["word_count"], 2400);
        assert_eq!(mock.calls(), 2);
        assert_eq!(out.diagnostics.attempts, 2);
        assert!(out.diagnostics.ok());

        let second = &mock.requests()[1].messages;
        let correction = second.last().unwrap();
        assert_eq!(correction.role, Role::User);
        assert!(correction.content.contains("\"word_count\"") || correction.content.contains("'word_count'"));
        assert!(correction.content.contains("required"));
        assert_eq!(second[second.len() - 2].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_schema_instruction_appended_to_last_user_turn() {
        let mock = Arc::new(MockBackend::fixed(r#"{"summary": "s", "word_count": 1}"#));
        let client = client_with(mock.clone());
        client
            .safe_generate_schema(MODEL, prompt(), &chapter_schema(), &ChatOptions::default())
            .await
            .unwrap();

        let sent = &mock.requests()[0].messages;
        assert_eq!(sent.len(), 2);
        assert!(sent[1].content.starts_with("Summarize chapter one."));
        assert!(sent[1].content.contains("Required fields:"));

        let mock = Arc::new(MockBackend::fixed(r#"{"summary": "s", "word_count": 1}"#));
        let client = client_with(mock.clone());
        client
            .safe_generate_schema(
                MODEL,
                vec![ChatMessage::system("sys")],
                &chapter_schema(),
                &ChatOptions::default(),
            )
            .await
            .unwrap();
        let sent = &mock.requests()[0].messages;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].role, Role::User);
    }

    #[tokio::test]
    async fn test_schema_rejects_list_with_hint() {
        let mock = Arc::new(MockBackend::replies([
            r#"[{"summary": "s", "word_count": 1}]"#,
            r#"{"summary": "s", "word_count": 1}"#,
        ]));
        let client = client_with(mock.clone());
        client
            .safe_generate_schema(MODEL, prompt(), &chapter_schema(), &ChatOptions::default())
            .await
            .unwrap();

        let hint = mock.requests()[1].messages.last().unwrap().content.clone();
        assert!(hint.contains("single JSON object"));
    }

    #[tokio::test]
    async fn test_schema_exhaustion_lists_violations() {
        let mock = Arc::new(MockBackend::fixed(r#"{"summary": 5}"#));
        let client = client_with(mock.clone());
        let err = client
            .safe_generate_schema(MODEL, prompt(), &chapter_schema(), &ChatOptions::default())
            .await
            .unwrap_err();

        match err {
            PipelineError::SchemaValidation {
                attempts,
                violations,
                ..
            } => {
                assert_eq!(attempts, 3);
                let paths: Vec<&str> = violations.iter().map(|v| v.path.as_str()).collect();
                assert!(paths.contains(&"summary"));
                assert!(paths.contains(&"word_count"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_schema_or_last_returns_last_object() {
        let mock = Arc::new(MockBackend::fixed(r#"{"summary": "only this"}"#));
        let client = client_with(mock);
        let out = client
            .safe_generate_schema_or_last(
                MODEL,
                prompt(),
                &chapter_schema(),
                &ChatOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(out.value["summary"], "only this");
        assert!(!out.diagnostics.ok());
        assert_eq!(out.diagnostics.violations[0].path, "word_count");
    }

    #[tokio::test]
    async fn test_schema_or_last_survives_unparseable_tail() {
        let mock = Arc::new(MockBackend::new(vec![
            MockStep::text(r#"{"summary": "x"}"#),
            MockStep::text("no json"),
            MockStep::text("no json"),
            MockStep::text("no json"),
        ]));
        let client = client_with(mock.clone());
        let out = client
            .safe_generate_schema_or_last(
                MODEL,
                prompt(),
                &chapter_schema(),
                &ChatOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(out.value["summary"], "x");
        assert_eq!(mock.calls(), 4);
        assert_eq!(out.diagnostics.attempts, 4);
        let paths: Vec<&str> = out
            .diagnostics
            .violations
            .iter()
            .map(|v| v.path.as_str())
            .collect();
        assert_eq!(paths, ["word_count"]);
        assert_eq!(out.messages.last().unwrap().role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_schema_or_last_violations_belong_to_returned_object() {
        let mock = Arc::new(MockBackend::replies([
            r#"{"summary": "kept"}"#,
            r#"[1, 2]"#,
            r#"[3]"#,
        ]));
        let client = client_with(mock);
        let out = client
            .safe_generate_schema_or_last(
                MODEL,
                prompt(),
                &chapter_schema(),
                &ChatOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(out.value["summary"], "kept");
        assert_eq!(out.diagnostics.violations.len(), 1);
        assert_eq!(out.diagnostics.violations[0].path, "word_count");
    }

    #[tokio::test]
    async fn test_schema_or_last_still_fails_without_any_object() {
        let mock = Arc::new(MockBackend::fixed("no json"));
        let client = client_with(mock.clone());
        let err = client
            .safe_generate_schema_or_last(
                MODEL,
                prompt(),
                &chapter_schema(),
                &ChatOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedOutput { .. }));
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_model_seed_used_when_caller_sets_none() {
        let spec: ModelSpec = "ollama://m?seed=99".parse().unwrap();
        let mock = Arc::new(MockBackend::fixed(r#"{"a": 1}"#));
        let config = PipelineConfig::default();
        let adapter = BackendAdapter::from_spec("ollama://m?seed=99", &spec, &config)
            .unwrap()
            .backend(mock.clone())
            .backoff(BackoffConfig::none())
            .build()
            .unwrap();
        let client = StructuredClient::new(quick_config()).with_adapter(adapter);

        client
            .safe_generate_json("ollama://m?seed=99", prompt(), &ChatOptions::default())
            .await
            .unwrap();
        client
            .safe_generate_json(
                "ollama://m?seed=99",
                prompt(),
                &ChatOptions::default().with_seed(7),
            )
            .await
            .unwrap();
        client
            .chat("ollama://m?seed=99", prompt(), &ChatOptions::default())
            .await
            .unwrap();

        let seeds: Vec<Option<u64>> = mock.requests().iter().map(|r| r.options.seed).collect();
        assert_eq!(seeds, [Some(99), Some(7), Some(99)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_semantic_retry_waits_retry_delay() {
        let generation = GenerationConfig {
            retry_delay_ms: 1500,
            ..Default::default()
        };
        let mock = Arc::new(MockBackend::replies(["not yet", r#"{"a": 1}"#]));
        let adapter = BackendAdapter::builder(MODEL)
            .backend(mock.clone())
            .backoff(BackoffConfig::none())
            .build()
            .unwrap();
        let client = StructuredClient::new(generation).with_adapter(adapter);

        let started = tokio::time::Instant::now();
        client
            .safe_generate_json(MODEL, prompt(), &ChatOptions::default())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn test_retry_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mock = Arc::new(MockBackend::replies(["bad", r#"{"a": 1}"#]));
        let client = client_with(mock).with_event_handler(Arc::new(FnEventHandler(
            move |e: Event| sink.lock().unwrap().push(e),
        )));

        client
            .safe_generate_json(MODEL, prompt(), &ChatOptions::default())
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert!(matches!(seen[0], Event::RetryStart { attempt: 2, .. }));
        assert_eq!(
            seen[1],
            Event::RetryEnd {
                model: MODEL.into(),
                attempts: 2,
                success: true
            }
        );
    }

    #[tokio::test]
    async fn test_transport_failure_is_terminal_here() {
        let mock = Arc::new(MockBackend::new(vec![MockStep::http(500)]));
        let client = client_with(mock.clone());
        let err = client
            .safe_generate_json(MODEL, prompt(), &ChatOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let client = StructuredClient::new(quick_config());
        let err = client
            .chat("ollama://missing", prompt(), &ChatOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownModel(_)));
        assert!(err.is_fatal_config());
    }

    #[tokio::test]
    async fn test_chat_and_embed_pass_through() {
        let mock = Arc::new(MockBackend::fixed("The harbor was quiet."));
        let client = client_with(mock.clone());
        let out = client
            .chat(MODEL, prompt(), &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(out.text, "The harbor was quiet.");
        assert_eq!(out.messages.len(), 3);
        assert_eq!(out.usage.completion_tokens, 4);

        let embedded = client
            .embed(MODEL, &["two words".to_string()])
            .await
            .unwrap();
        assert_eq!(embedded.vectors, vec![vec![9.0, 2.0]]);
    }

    #[test]
    fn test_repair_history_resets_when_inconsistent() {
        let original = prompt();
        let mut history = vec![ChatMessage::assistant("orphan")];
        repair_history(&mut history, &original);
        assert_eq!(history, original);

        let mut history = original.clone();
        history.push(ChatMessage::assistant("bad"));
        repair_history(&mut history, &original);
        assert_eq!(history, original);
    }

    #[test]
    fn test_from_config_missing_credential() {
        let mut config = PipelineConfig::default();
        config.models.chapter = "openai://gpt-4o-mini".into();
        config.providers.insert(
            "openai".into(),
            crate::config::ProviderConfig {
                api_key_env: Some("NOVEL_PIPELINE_TEST_UNSET_KEY".into()),
                ..Default::default()
            },
        );
        let err = StructuredClient::from_config(&config, None).unwrap_err();
        assert!(matches!(err, PipelineError::MissingCredential { .. }));
    }
}
