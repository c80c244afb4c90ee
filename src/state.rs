//! Run state: the single source of truth for a generation run.
//!
//! [`RunState`] is what the checkpoint file holds. It records the last
//! completed [`Step`], the artifacts each completed stage produced, and the
//! chapter cursor. Mutators enforce the forward-only ordering of steps and
//! keep the cursor equal to `completed_chapters.len() + 1`.

use crate::error::Result;
use crate::PipelineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current checkpoint format version.
pub const STATE_VERSION: u32 = 1;

/// Stage identifiers in their strict total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Init,
    Outline,
    DetectChapters,
    ExpandChapters,
    ChapterGeneration,
    ChapterGenerationComplete,
    PostProcessingEdit,
    PostProcessingScrub,
    PostProcessingTranslate,
    Complete,
}

impl Step {
    /// Every step, in order.
    pub const ALL: [Step; 10] = [
        Step::Init,
        Step::Outline,
        Step::DetectChapters,
        Step::ExpandChapters,
        Step::ChapterGeneration,
        Step::ChapterGenerationComplete,
        Step::PostProcessingEdit,
        Step::PostProcessingScrub,
        Step::PostProcessingTranslate,
        Step::Complete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Step::Init => "init",
            Step::Outline => "outline",
            Step::DetectChapters => "detect_chapters",
            Step::ExpandChapters => "expand_chapters",
            Step::ChapterGeneration => "chapter_generation",
            Step::ChapterGenerationComplete => "chapter_generation_complete",
            Step::PostProcessingEdit => "post_processing_edit",
            Step::PostProcessingScrub => "post_processing_scrub",
            Step::PostProcessingTranslate => "post_processing_translate",
            Step::Complete => "complete",
        }
    }

    /// The step after this one, or `None` for [`Step::Complete`].
    pub fn next(self) -> Option<Step> {
        let idx = Step::ALL.iter().position(|s| *s == self)?;
        Step::ALL.get(idx + 1).copied()
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default = "default_version")]
    pub version: u32,
    /// The story prompt the run was started with.
    pub prompt: String,
    pub last_completed_step: Step,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub full_outline: Option<String>,
    #[serde(default)]
    pub base_context: Option<String>,
    #[serde(default)]
    pub chapter_outlines: Vec<String>,
    #[serde(default)]
    pub total_chapters: usize,
    #[serde(default)]
    pub completed_chapters: Vec<String>,
    /// 1-based index of the next chapter to generate.
    pub next_chapter_index: usize,

    #[serde(default)]
    pub edited_chapters: Option<Vec<String>>,
    #[serde(default)]
    pub scrubbed_chapters: Option<Vec<String>>,
    #[serde(default)]
    pub translated_chapters: Option<Vec<String>>,
}

fn default_version() -> u32 {
    STATE_VERSION
}

impl RunState {
    /// A fresh run at [`Step::Init`].
    pub fn new(prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            prompt: prompt.into(),
            last_completed_step: Step::Init,
            created_at: now,
            updated_at: now,
            full_outline: None,
            base_context: None,
            chapter_outlines: Vec::new(),
            total_chapters: 0,
            completed_chapters: Vec::new(),
            next_chapter_index: 1,
            edited_chapters: None,
            scrubbed_chapters: None,
            translated_chapters: None,
        }
    }

    /// Mark `step` as the last completed step.
    ///
    /// Re-marking the current step is allowed; moving backwards is an error.
    pub fn advance(&mut self, step: Step) -> Result<()> {
        if step < self.last_completed_step {
            return Err(PipelineError::InconsistentState(format!(
                "cannot move from '{}' back to '{}'",
                self.last_completed_step, step
            )));
        }
        self.last_completed_step = step;
        self.touch();
        Ok(())
    }

    /// Append one generated chapter and move the cursor.
    pub fn record_chapter(&mut self, text: String) -> Result<()> {
        if self.completed_chapters.len() >= self.total_chapters {
            return Err(PipelineError::InconsistentState(format!(
                "all {} chapters are already complete",
                self.total_chapters
            )));
        }
        self.completed_chapters.push(text);
        self.next_chapter_index = self.completed_chapters.len() + 1;
        self.advance(Step::ChapterGeneration)
    }

    /// Whether the chapter loop has produced every chapter.
    pub fn chapters_done(&self) -> bool {
        self.total_chapters > 0 && self.completed_chapters.len() >= self.total_chapters
    }

    /// Whether the run has reached [`Step::Complete`].
    pub fn is_complete(&self) -> bool {
        self.last_completed_step == Step::Complete
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// The most-processed chapter set: translated, then scrubbed, then
    /// edited, then the raw completed chapters.
    pub fn final_chapters(&self) -> &[String] {
        self.translated_chapters
            .as_deref()
            .or(self.scrubbed_chapters.as_deref())
            .or(self.edited_chapters.as_deref())
            .unwrap_or(&self.completed_chapters)
    }

    /// Chapters the post-processing stage for `step` should read.
    ///
    /// Each pass works on the output of the passes before it.
    pub fn chapters_before(&self, step: Step) -> &[String] {
        let translated = self.translated_chapters.as_deref().filter(|_| step > Step::PostProcessingTranslate);
        let scrubbed = self.scrubbed_chapters.as_deref().filter(|_| step > Step::PostProcessingScrub);
        let edited = self.edited_chapters.as_deref().filter(|_| step > Step::PostProcessingEdit);
        translated
            .or(scrubbed)
            .or(edited)
            .unwrap_or(&self.completed_chapters)
    }

    /// Check every invariant of a loaded document.
    pub fn validate(&self) -> Result<()> {
        if self.version != STATE_VERSION {
            return Err(PipelineError::InconsistentState(format!(
                "unsupported checkpoint version {} (expected {})",
                self.version, STATE_VERSION
            )));
        }

        if self.next_chapter_index != self.completed_chapters.len() + 1 {
            return Err(PipelineError::InconsistentState(format!(
                "next_chapter_index is {} but {} chapters are complete",
                self.next_chapter_index,
                self.completed_chapters.len()
            )));
        }

        let step = self.last_completed_step;
        if step >= Step::Outline && self.full_outline.is_none() {
            return Err(PipelineError::MissingArtifact {
                step,
                artifact: "full_outline",
            });
        }
        if step >= Step::DetectChapters {
            if self.total_chapters == 0 {
                return Err(PipelineError::MissingArtifact {
                    step,
                    artifact: "total_chapters",
                });
            }
            if self.chapter_outlines.len() != self.total_chapters {
                return Err(PipelineError::InconsistentState(format!(
                    "{} chapter outlines for {} chapters",
                    self.chapter_outlines.len(),
                    self.total_chapters
                )));
            }
        }
        if self.completed_chapters.len() > self.total_chapters {
            return Err(PipelineError::InconsistentState(format!(
                "{} completed chapters exceed total of {}",
                self.completed_chapters.len(),
                self.total_chapters
            )));
        }
        if step < Step::ChapterGeneration && !self.completed_chapters.is_empty() {
            return Err(PipelineError::InconsistentState(format!(
                "chapters recorded before chapter generation started (step '{}')",
                step
            )));
        }
        if step >= Step::ChapterGenerationComplete && !self.chapters_done() {
            return Err(PipelineError::MissingArtifact {
                step,
                artifact: "completed_chapters",
            });
        }

        for (field, chapters) in [
            ("edited_chapters", &self.edited_chapters),
            ("scrubbed_chapters", &self.scrubbed_chapters),
            ("translated_chapters", &self.translated_chapters),
        ] {
            if let Some(chapters) = chapters {
                if chapters.len() != self.total_chapters {
                    return Err(PipelineError::InconsistentState(format!(
                        "{} has {} entries for {} chapters",
                        field,
                        chapters.len(),
                        self.total_chapters
                    )));
                }
            }
        }

        Ok(())
    }
}
