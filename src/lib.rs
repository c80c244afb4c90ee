//! # Novel Pipeline
//!
//! Resumable, checkpointed LLM pipeline for long-form novel generation.
//!
//! A multi-hour run is split into ordered stages (outline, chapter
//! detection, outline expansion, one step per chapter, optional edit, scrub
//! and translation passes). After every unit of work the [`RunState`] is
//! written atomically to a checkpoint file, so killing the process and
//! running it again continues exactly where it stopped.
//!
//! Every stage gets its output through the [`StructuredClient`], which
//! turns an unreliable model into one that returns either a structurally
//! valid value or a terminal error after a bounded number of attempts.
//!
//! ## Core Concepts
//!
//! - **[`NovelPipeline`]**: the orchestrator. Runs the steps after
//!   `last_completed_step` and checkpoints after each.
//! - **[`NovelStages`]**: the business logic, one async method per stage.
//! - **[`StructuredClient`]**: JSON repair and schema validation retry loops
//!   over one [`BackendAdapter`](backend::BackendAdapter) per model.
//! - **[`SchemaDescriptor`]**: the expected shape of a structured reply.
//! - **[`PipelineConfig`]**: models, retry bounds, optional stages and
//!   provider settings, loaded from TOML (or YAML with the `yaml` feature).
//!
//! ## Quick Start
//!
//! ```no_run
//! use novel_pipeline::{
//!     ChapterRequest, NovelPipeline, NovelStages, OutlineArtifact, PipelineConfig, Result,
//!     RunState, StructuredClient,
//! };
//! use novel_pipeline::backend::{ChatMessage, ChatOptions};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct MyStages;
//!
//! #[async_trait]
//! impl NovelStages for MyStages {
//!     async fn outline(&self, client: &StructuredClient, state: &RunState) -> Result<OutlineArtifact> {
//!         let reply = client
//!             .chat("ollama://llama3:8b", vec![ChatMessage::user(&state.prompt)], &ChatOptions::default())
//!             .await?;
//!         Ok(OutlineArtifact { full_outline: reply.text, base_context: String::new() })
//!     }
//!     // ...remaining stages...
//! #   async fn detect_chapters(&self, _: &StructuredClient, _: &RunState) -> Result<Vec<String>> { Ok(vec![]) }
//! #   async fn expand_chapters(&self, _: &StructuredClient, _: &RunState) -> Result<Vec<String>> { Ok(vec![]) }
//! #   async fn write_chapter(&self, _: &StructuredClient, _: &RunState, _: ChapterRequest) -> Result<String> { Ok(String::new()) }
//! #   async fn edit(&self, _: &StructuredClient, _: &RunState, c: &[String]) -> Result<Vec<String>> { Ok(c.to_vec()) }
//! #   async fn scrub(&self, _: &StructuredClient, _: &RunState, c: &[String]) -> Result<Vec<String>> { Ok(c.to_vec()) }
//! #   async fn translate(&self, _: &StructuredClient, _: &RunState, c: &[String], _: &str) -> Result<Vec<String>> { Ok(c.to_vec()) }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = PipelineConfig::load("novel.toml")?;
//!     novel_pipeline::logging::init_logging(&config.logging)?;
//!
//!     let pipeline = NovelPipeline::from_config(&config, Arc::new(MyStages), None)?;
//!     let state = pipeline.resume_or_start("A lighthouse keeper finds a map.").await?;
//!     for chapter in state.final_chapters() {
//!         println!("{chapter}\n");
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod logging;
pub mod parsing;
pub mod pipeline;
pub mod provider;
pub mod schema;
pub mod stage;
pub mod state;

pub use checkpoint::CheckpointStore;
pub use client::{ChatOutcome, EmbedOutcome, StructuredClient, StructuredOutcome};
pub use config::PipelineConfig;
pub use diagnostics::GenerationDiagnostics;
pub use error::{ErrorKind, PipelineError, Result};
pub use events::{Event, EventHandler, FnEventHandler};
pub use pipeline::NovelPipeline;
pub use provider::{ModelSpec, Provider};
pub use schema::{FieldKind, FieldSpec, SchemaDescriptor, Violation};
pub use stage::{ChapterRequest, NovelStages, OutlineArtifact};
pub use state::{RunState, Step};
