//! Example: a full novel run against scripted backends.
//!
//! Run with: `cargo run --example mock_run [checkpoint.json]`
//!
//! The first reply from the planner is missing a field, so the schema retry
//! loop sends a correction before the run continues. Run it twice against
//! the same checkpoint to see the second invocation resume instead of
//! starting over.

use async_trait::async_trait;
use novel_pipeline::backend::{
    BackendAdapter, BackoffConfig, ChatMessage, ChatOptions, MockBackend, MockStep,
};
use novel_pipeline::config::{GenerationConfig, LoggingConfig, StagesConfig};
use novel_pipeline::{
    ChapterRequest, Event, FieldKind, FieldSpec, FnEventHandler, NovelPipeline, NovelStages,
    OutlineArtifact, Result, RunState, SchemaDescriptor, StructuredClient,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const PLANNER: &str = "mock://planner";
const WRITER: &str = "mock://writer";
const EDITOR: &str = "mock://editor";

fn story_plan() -> SchemaDescriptor {
    SchemaDescriptor::new("StoryPlan")
        .field(FieldSpec::string("title").required().max_length(80))
        .field(
            FieldSpec::string("premise")
                .required()
                .describe("Two or three sentences"),
        )
        .field(
            FieldSpec::array("chapters", FieldKind::String)
                .required()
                .items(Some(1), Some(40))
                .describe("One line per chapter"),
        )
        .field(FieldSpec::string("tone").describe("Overall mood"))
}

struct DemoStages;

#[async_trait]
impl NovelStages for DemoStages {
    async fn outline(&self, client: &StructuredClient, state: &RunState) -> Result<OutlineArtifact> {
        let out = client
            .safe_generate_schema(
                PLANNER,
                vec![
                    ChatMessage::system("You plan novels."),
                    ChatMessage::user(format!("Plan a short novel about: {}", state.prompt)),
                ],
                &story_plan(),
                &ChatOptions::default().with_temperature(0.8),
            )
            .await?;
        println!(
            "  plan accepted after {} attempt(s), {} tokens",
            out.diagnostics.attempts,
            out.diagnostics.usage.total()
        );
        Ok(OutlineArtifact {
            full_outline: out.value.to_string(),
            base_context: out.value["premise"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn detect_chapters(&self, _: &StructuredClient, state: &RunState) -> Result<Vec<String>> {
        let plan: serde_json::Value = serde_json::from_str(state.full_outline.as_deref().unwrap_or("{}"))?;
        Ok(plan["chapters"]
            .as_array()
            .map(|c| c.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default())
    }

    async fn expand_chapters(&self, client: &StructuredClient, state: &RunState) -> Result<Vec<String>> {
        let mut expanded = Vec::with_capacity(state.total_chapters);
        for beat in &state.chapter_outlines {
            let reply = client
                .chat(
                    WRITER,
                    vec![ChatMessage::user(format!("Expand this chapter outline: {}", beat))],
                    &ChatOptions::default(),
                )
                .await?;
            expanded.push(format!("{}. {}", beat, reply.text));
        }
        Ok(expanded)
    }

    async fn write_chapter(
        &self,
        client: &StructuredClient,
        state: &RunState,
        request: ChapterRequest,
    ) -> Result<String> {
        let mut messages = vec![ChatMessage::system(format!(
            "Context: {}",
            state.base_context.as_deref().unwrap_or_default()
        ))];
        if let Some(previous) = state.completed_chapters.last() {
            messages.push(ChatMessage::user(format!("Previous chapter:\n{}", previous)));
            messages.push(ChatMessage::assistant("Noted."));
        }
        messages.push(ChatMessage::user(format!(
            "Write chapter {} of {}: {}",
            request.index,
            request.total,
            state.chapter_outlines[request.index - 1]
        )));
        let reply = client.chat(WRITER, messages, &ChatOptions::default()).await?;
        Ok(format!("## Chapter {}\n\n{}", request.index, reply.text))
    }

    async fn edit(&self, client: &StructuredClient, _: &RunState, chapters: &[String]) -> Result<Vec<String>> {
        let mut edited = Vec::with_capacity(chapters.len());
        for chapter in chapters {
            let reply = client
                .chat(
                    EDITOR,
                    vec![ChatMessage::user(format!("Tighten the prose:\n{}", chapter))],
                    &ChatOptions::default(),
                )
                .await?;
            edited.push(format!("{}\n\n{}", chapter, reply.text));
        }
        Ok(edited)
    }

    async fn scrub(&self, _: &StructuredClient, _: &RunState, chapters: &[String]) -> Result<Vec<String>> {
        Ok(chapters.iter().map(|c| c.trim().to_string()).collect())
    }

    async fn translate(
        &self,
        _: &StructuredClient,
        _: &RunState,
        chapters: &[String],
        _language: &str,
    ) -> Result<Vec<String>> {
        Ok(chapters.to_vec())
    }
}

fn adapter(label: &str, backend: MockBackend) -> Result<BackendAdapter> {
    BackendAdapter::builder(label)
        .backend(Arc::new(backend))
        .backoff(BackoffConfig::local().with_budget(2, Duration::from_millis(10)))
        .build()
}

#[tokio::main]
async fn main() -> Result<()> {
    novel_pipeline::logging::init_logging(&LoggingConfig::default())?;

    let checkpoint = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("novel_mock_run.json"));

    let planner = MockBackend::new(vec![
        MockStep::http(503),
        MockStep::text(r#"Sure! {"title": "Low Tide", "chapters": ["The flood", "The camp"]}"#),
        MockStep::text(
            r#"```json
{"title": "Low Tide", "premise": "A town learns to live with the sea.", "chapters": ["The flood", "The camp", "The return"],}
```"#,
        ),
    ]);
    let writer = MockBackend::fixed("The water rose through the night and nobody slept.");
    let editor = MockBackend::fixed("(Edited for pace.)");

    let generation = GenerationConfig {
        retry_delay_ms: 100,
        ..Default::default()
    };
    let client = StructuredClient::new(generation)
        .with_adapter(adapter(PLANNER, planner)?)
        .with_adapter(adapter(WRITER, writer)?)
        .with_adapter(adapter(EDITOR, editor)?);

    let options = StagesConfig {
        final_edit: true,
        scrub_chapters: true,
        checkpoint_path: checkpoint.clone(),
        ..Default::default()
    };

    let progress = FnEventHandler(|event: Event| match event {
        Event::StageStarted { step } => println!("> {}", step),
        Event::StageSkipped { step } => println!("- {} (skipped)", step),
        Event::ChapterCheckpointed { index, total } => println!("  chapter {}/{} saved", index, total),
        Event::RetryStart { attempt, reason, .. } => println!("  retry #{}: {}", attempt, reason),
        _ => {}
    });

    let pipeline = NovelPipeline::new(client, Arc::new(DemoStages), options)
        .with_event_handler(Arc::new(progress));

    println!("checkpoint: {}", checkpoint.display());
    let state = pipeline
        .resume_or_start("a coastal town that floods every spring")
        .await?;

    println!();
    for chapter in state.final_chapters() {
        println!("{}\n", chapter);
    }
    println!("done; run again to see the resume path");
    Ok(())
}
