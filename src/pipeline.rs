//! Resumable pipeline orchestrator.
//!
//! [`NovelPipeline`] drives the stages in [`Step`] order, merges each
//! artifact into the [`RunState`] and checkpoints after every unit of work.
//! Only steps strictly after `last_completed_step` run, so re-running
//! against the same checkpoint picks up where the last process stopped.
//!
//! ```text
//! init → outline → detect_chapters → expand_chapters → chapter_generation (×N)
//!      → chapter_generation_complete → post_processing_{edit,scrub,translate} → complete
//! ```

use crate::checkpoint::CheckpointStore;
use crate::client::StructuredClient;
use crate::config::{PipelineConfig, StagesConfig};
use crate::error::Result;
use crate::events::{emit, Event, EventHandler};
use crate::stage::{ChapterRequest, NovelStages};
use crate::state::{RunState, Step};
use crate::PipelineError;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Drives [`NovelStages`] to completion with a checkpoint after each step.
///
/// # Example
///
/// ```no_run
/// # use novel_pipeline::{NovelPipeline, PipelineConfig, NovelStages};
/// # use std::sync::Arc;
/// # async fn example(stages: Arc<dyn NovelStages>) -> novel_pipeline::Result<()> {
/// let config = PipelineConfig::load("novel.toml")?;
/// let pipeline = NovelPipeline::from_config(&config, stages, None)?;
/// let state = pipeline.resume_or_start("A lighthouse keeper finds a map.").await?;
/// println!("{} chapters", state.final_chapters().len());
/// # Ok(())
/// # }
/// ```
pub struct NovelPipeline {
    client: StructuredClient,
    stages: Arc<dyn NovelStages>,
    options: StagesConfig,
    store: CheckpointStore,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for NovelPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NovelPipeline")
            .field("client", &self.client)
            .field("options", &self.options)
            .field("checkpoint", &self.store.path())
            .field("has_event_handler", &self.event_handler.is_some())
            .finish()
    }
}

impl NovelPipeline {
    /// Checkpoints go to `options.checkpoint_path`.
    pub fn new(client: StructuredClient, stages: Arc<dyn NovelStages>, options: StagesConfig) -> Self {
        let store = CheckpointStore::new(options.checkpoint_path.clone());
        Self {
            client,
            stages,
            options,
            store,
            event_handler: None,
        }
    }

    /// Build the client from `config` and wire `event_handler` into both the
    /// pipeline and every adapter.
    pub fn from_config(
        config: &PipelineConfig,
        stages: Arc<dyn NovelStages>,
        event_handler: Option<Arc<dyn EventHandler>>,
    ) -> Result<Self> {
        config.validate()?;
        let client = StructuredClient::from_config(config, event_handler.clone())?;
        let mut pipeline = Self::new(client, stages, config.pipeline.clone());
        pipeline.event_handler = event_handler;
        Ok(pipeline)
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn client(&self) -> &StructuredClient {
        &self.client
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Load the checkpoint (or start a fresh run) and run to completion.
    ///
    /// A fresh run is saved before any stage runs. A corrupt checkpoint is
    /// reported and left untouched.
    pub async fn resume_or_start(&self, prompt: &str) -> Result<RunState> {
        let mut state = match self.store.load_optional()? {
            Some(state) => {
                info!(
                    path = %self.store.path().display(),
                    step = %state.last_completed_step,
                    chapters = state.completed_chapters.len(),
                    total = state.total_chapters,
                    "resuming run"
                );
                if state.prompt != prompt {
                    warn!("prompt differs from the checkpointed run, continuing with the checkpoint");
                }
                state
            }
            None => {
                info!(path = %self.store.path().display(), "starting new run");
                let state = RunState::new(prompt);
                self.store.save(&state)?;
                state
            }
        };

        self.run(&mut state).await?;
        Ok(state)
    }

    /// Execute every step after `state.last_completed_step`.
    ///
    /// A stage error is returned unchanged; `state` and the checkpoint stay
    /// at the last step that completed.
    pub async fn run(&self, state: &mut RunState) -> Result<()> {
        state.validate()?;
        while let Some(step) = resume_point(state) {
            self.run_step(step, state).await?;
        }
        info!(chapters = state.final_chapters().len(), "run complete");
        Ok(())
    }

    async fn run_step(&self, step: Step, state: &mut RunState) -> Result<()> {
        if !self.is_enabled(step) {
            info!(step = %step, "stage disabled, skipping");
            state.advance(step)?;
            self.store.save(state)?;
            emit(&self.event_handler, Event::StageSkipped { step });
            return Ok(());
        }

        require_artifacts(step, state)?;

        if step == Step::ChapterGeneration {
            return self.generate_chapters(state).await;
        }

        info!(step = %step, "stage started");
        emit(&self.event_handler, Event::StageStarted { step });

        match step {
            Step::Outline => {
                let artifact = self.stages.outline(&self.client, state).await?;
                state.full_outline = Some(artifact.full_outline);
                state.base_context = Some(artifact.base_context);
            }
            Step::DetectChapters => {
                let outlines = self.stages.detect_chapters(&self.client, state).await?;
                if outlines.is_empty() {
                    return Err(PipelineError::stage(step.as_str(), "no chapters detected"));
                }
                state.total_chapters = outlines.len();
                state.chapter_outlines = outlines;
            }
            Step::ExpandChapters => {
                let expanded = self.stages.expand_chapters(&self.client, state).await?;
                state.chapter_outlines = per_chapter(step, expanded, state.total_chapters)?;
            }
            Step::PostProcessingEdit => {
                let input = state.chapters_before(step);
                let edited = self.stages.edit(&self.client, state, input).await?;
                state.edited_chapters = Some(per_chapter(step, edited, state.total_chapters)?);
            }
            Step::PostProcessingScrub => {
                let input = state.chapters_before(step);
                let scrubbed = self.stages.scrub(&self.client, state, input).await?;
                state.scrubbed_chapters = Some(per_chapter(step, scrubbed, state.total_chapters)?);
            }
            Step::PostProcessingTranslate => {
                let language = self.options.translation_target().unwrap_or_default();
                let input = state.chapters_before(step);
                let translated = self
                    .stages
                    .translate(&self.client, state, input, language)
                    .await?;
                state.translated_chapters =
                    Some(per_chapter(step, translated, state.total_chapters)?);
            }
            Step::Init
            | Step::ChapterGeneration
            | Step::ChapterGenerationComplete
            | Step::Complete => {}
        }

        state.advance(step)?;
        self.store.save(state)?;
        info!(step = %step, "stage completed");
        emit(&self.event_handler, Event::StageCompleted { step });
        Ok(())
    }

    /// Write chapters from `next_chapter_index` to the end, saving after each.
    async fn generate_chapters(&self, state: &mut RunState) -> Result<()> {
        let total = state.total_chapters;
        let step = Step::ChapterGeneration;
        if state.next_chapter_index == 1 {
            info!(step = %step, total, "stage started");
            emit(&self.event_handler, Event::StageStarted { step });
        }

        while state.next_chapter_index <= total {
            let request = ChapterRequest {
                index: state.next_chapter_index,
                total,
            };
            info!(chapter = request.index, total, "writing chapter");
            let text = self
                .stages
                .write_chapter(&self.client, state, request)
                .await?;
            if text.trim().is_empty() {
                return Err(PipelineError::stage(
                    step.as_str(),
                    format!("chapter {} came back empty", request.index),
                ));
            }

            state.record_chapter(text)?;
            self.store.save(state)?;
            debug!(next = state.next_chapter_index, "chapter checkpointed");
            emit(
                &self.event_handler,
                Event::ChapterCheckpointed {
                    index: request.index,
                    total,
                },
            );
        }

        info!(step = %step, "stage completed");
        emit(&self.event_handler, Event::StageCompleted { step });
        Ok(())
    }

    fn is_enabled(&self, step: Step) -> bool {
        match step {
            Step::ExpandChapters => self.options.expand_outline,
            Step::PostProcessingEdit => self.options.final_edit,
            Step::PostProcessingScrub => self.options.scrub_chapters,
            Step::PostProcessingTranslate => self.options.translation_target().is_some(),
            _ => true,
        }
    }
}

/// The next step to execute, or `None` when the run is complete.
///
/// An unfinished chapter loop resumes at `chapter_generation` itself.
fn resume_point(state: &RunState) -> Option<Step> {
    match state.last_completed_step {
        Step::ChapterGeneration if !state.chapters_done() => Some(Step::ChapterGeneration),
        step => step.next(),
    }
}

/// Fail with [`PipelineError::MissingArtifact`] if `step` cannot run yet.
fn require_artifacts(step: Step, state: &RunState) -> Result<()> {
    let missing = |artifact: &'static str| PipelineError::MissingArtifact { step, artifact };

    if step > Step::Outline && state.full_outline.is_none() {
        return Err(missing("full_outline"));
    }
    if step > Step::DetectChapters && (state.total_chapters == 0 || state.chapter_outlines.is_empty()) {
        return Err(missing("chapter_outlines"));
    }
    if step > Step::ChapterGeneration && !state.chapters_done() {
        return Err(missing("completed_chapters"));
    }
    Ok(())
}

/// Check that a stage returned one entry per chapter.
fn per_chapter(step: Step, chapters: Vec<String>, total: usize) -> Result<Vec<String>> {
    if chapters.len() != total {
        return Err(PipelineError::stage(
            step.as_str(),
            format!("returned {} chapters, expected {}", chapters.len(), total),
        ));
    }
    Ok(chapters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenerationConfig;
    use crate::stage::OutlineArtifact;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Scripted {
        calls: Mutex<Vec<String>>,
        chapters: usize,
        fail_chapter: Option<usize>,
    }

    impl Scripted {
        fn with_chapters(chapters: usize) -> Self {
            Self {
                chapters,
                ..Default::default()
            }
        }

        fn log(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NovelStages for Scripted {
        async fn outline(&self, _: &StructuredClient, state: &RunState) -> Result<OutlineArtifact> {
            self.log("outline");
            Ok(OutlineArtifact {
                full_outline: format!("outline of {}", state.prompt),
                base_context: "context".into(),
            })
        }

        async fn detect_chapters(&self, _: &StructuredClient, _: &RunState) -> Result<Vec<String>> {
            self.log("detect_chapters");
            Ok((1..=self.chapters).map(|i| format!("beat {}", i)).collect())
        }

        async fn expand_chapters(&self, _: &StructuredClient, state: &RunState) -> Result<Vec<String>> {
            self.log("expand_chapters");
            Ok(state
                .chapter_outlines
                .iter()
                .map(|o| format!("{} (expanded)", o))
                .collect())
        }

        async fn write_chapter(
            &self,
            _: &StructuredClient,
            _: &RunState,
            request: ChapterRequest,
        ) -> Result<String> {
            self.log(format!("chapter {}", request.index));
            if self.fail_chapter == Some(request.index) {
                return Err(PipelineError::stage("chapter_generation", "model went quiet"));
            }
            Ok(format!("Chapter {} of {}", request.index, request.total))
        }

        async fn edit(&self, _: &StructuredClient, _: &RunState, chapters: &[String]) -> Result<Vec<String>> {
            self.log("edit");
            Ok(chapters.iter().map(|c| format!("{} [edited]", c)).collect())
        }

        async fn scrub(&self, _: &StructuredClient, _: &RunState, chapters: &[String]) -> Result<Vec<String>> {
            self.log("scrub");
            Ok(chapters.iter().map(|c| format!("{} [scrubbed]", c)).collect())
        }

        async fn translate(
            &self,
            _: &StructuredClient,
            _: &RunState,
            chapters: &[String],
            language: &str,
        ) -> Result<Vec<String>> {
            self.log(format!("translate {}", language));
            Ok(chapters.iter().map(|c| format!("{} [{}]", c, language)).collect())
        }
    }

    fn pipeline(dir: &TempDir, stages: Arc<Scripted>, options: StagesConfig) -> NovelPipeline {
        let options = StagesConfig {
            checkpoint_path: dir.path().join("run.json"),
            ..options
        };
        NovelPipeline::new(StructuredClient::new(GenerationConfig::default()), stages, options)
    }

    #[tokio::test]
    async fn test_fresh_run_executes_every_enabled_stage() {
        let dir = TempDir::new().unwrap();
        let stages = Arc::new(Scripted::with_chapters(2));
        let p = pipeline(&dir, stages.clone(), StagesConfig::default());

        let state = p.resume_or_start("a prompt").await.unwrap();
        assert!(state.is_complete());
        assert_eq!(
            stages.calls(),
            ["outline", "detect_chapters", "expand_chapters", "chapter 1", "chapter 2"]
        );
        assert_eq!(state.chapter_outlines[0], "beat 1 (expanded)");
        assert_eq!(state.final_chapters(), ["Chapter 1 of 2", "Chapter 2 of 2"]);
        assert!(state.edited_chapters.is_none());
        assert_eq!(p.store().load().unwrap(), state);
    }

    #[tokio::test]
    async fn test_disabled_expansion_is_skipped() {
        let dir = TempDir::new().unwrap();
        let stages = Arc::new(Scripted::with_chapters(1));
        let options = StagesConfig {
            expand_outline: false,
            ..Default::default()
        };
        let state = pipeline(&dir, stages.clone(), options)
            .resume_or_start("p")
            .await
            .unwrap();
        assert!(!stages.calls().contains(&"expand_chapters".to_string()));
        assert_eq!(state.chapter_outlines, ["beat 1"]);
    }

    #[tokio::test]
    async fn test_post_processing_chain() {
        let dir = TempDir::new().unwrap();
        let stages = Arc::new(Scripted::with_chapters(1));
        let options = StagesConfig {
            final_edit: true,
            scrub_chapters: true,
            translate_to: Some("French".into()),
            ..Default::default()
        };
        let state = pipeline(&dir, stages.clone(), options)
            .resume_or_start("p")
            .await
            .unwrap();
        assert_eq!(
            state.final_chapters(),
            ["Chapter 1 of 1 [edited] [scrubbed] [French]"]
        );
        assert!(stages.calls().ends_with(&[
            "edit".to_string(),
            "scrub".to_string(),
            "translate French".to_string()
        ]));
    }

    #[tokio::test]
    async fn test_zero_chapters_is_a_stage_failure() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir, Arc::new(Scripted::with_chapters(0)), StagesConfig::default());
        let err = p.resume_or_start("p").await.unwrap_err();
        assert!(matches!(err, PipelineError::StageFailed { ref stage, .. } if stage == "detect_chapters"));

        let saved = p.store().load().unwrap();
        assert_eq!(saved.last_completed_step, Step::Outline);
    }

    #[tokio::test]
    async fn test_failed_chapter_keeps_earlier_ones() {
        let dir = TempDir::new().unwrap();
        let stages = Arc::new(Scripted {
            chapters: 3,
            fail_chapter: Some(2),
            ..Default::default()
        });
        let p = pipeline(&dir, stages, StagesConfig::default());
        assert!(p.resume_or_start("p").await.is_err());

        let saved = p.store().load().unwrap();
        assert_eq!(saved.last_completed_step, Step::ChapterGeneration);
        assert_eq!(saved.completed_chapters, ["Chapter 1 of 3"]);
        assert_eq!(saved.next_chapter_index, 2);
    }

    #[tokio::test]
    async fn test_complete_run_does_nothing() {
        let dir = TempDir::new().unwrap();
        let stages = Arc::new(Scripted::with_chapters(1));
        let p = pipeline(&dir, stages.clone(), StagesConfig::default());
        let mut state = p.resume_or_start("p").await.unwrap();
        let before = stages.calls().len();

        p.run(&mut state).await.unwrap();
        assert_eq!(stages.calls().len(), before);
    }

    #[tokio::test]
    async fn test_missing_artifact_is_reported_before_stage_runs() {
        let dir = TempDir::new().unwrap();
        let stages = Arc::new(Scripted::with_chapters(1));
        let p = pipeline(&dir, stages.clone(), StagesConfig::default());

        let mut state = RunState::new("p");
        state.full_outline = Some("X".into());
        state.last_completed_step = Step::Outline;
        state.full_outline = None;

        let err = p.run(&mut state).await.unwrap_err();
        assert!(err.is_fatal_config());
        assert!(stages.calls().is_empty());
    }

    #[test]
    fn test_resume_point() {
        let mut state = RunState::new("p");
        assert_eq!(resume_point(&state), Some(Step::Outline));

        state.total_chapters = 2;
        state.completed_chapters = vec!["one".into()];
        state.last_completed_step = Step::ChapterGeneration;
        assert_eq!(resume_point(&state), Some(Step::ChapterGeneration));

        state.completed_chapters.push("two".into());
        assert_eq!(resume_point(&state), Some(Step::ChapterGenerationComplete));

        state.last_completed_step = Step::Complete;
        assert_eq!(resume_point(&state), None);
    }
}
