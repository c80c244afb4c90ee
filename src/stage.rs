//! The stage function contract.
//!
//! Business logic (prompts, narrative schemas, chapter memory) lives behind
//! [`NovelStages`]. The orchestrator calls each method at most once per
//! completed unit of work and merges the returned artifact into the
//! [`RunState`]. Implementations must only talk to the outside world through
//! the supplied [`StructuredClient`] and must be idempotent for the same
//! inputs, since an interrupted call is repeated on resume.

use crate::client::StructuredClient;
use crate::error::Result;
use crate::state::RunState;
use async_trait::async_trait;

/// Output of the outline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlineArtifact {
    pub full_outline: String,
    /// Story-wide context (setting, characters, tone) reused by later stages.
    pub base_context: String,
}

/// Which chapter to write.
///
/// Implementations size any chapter memory from `index` and `total`; the
/// full [`RunState`] (earlier chapters included) is passed alongside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChapterRequest {
    /// 1-based chapter number.
    pub index: usize,
    pub total: usize,
}

impl ChapterRequest {
    pub fn is_first(&self) -> bool {
        self.index == 1
    }

    pub fn is_last(&self) -> bool {
        self.index == self.total
    }
}

/// Stage functions for one novel run.
///
/// Chapter lists returned by `detect_chapters`, `expand_chapters` and the
/// post-processing methods must hold exactly one entry per chapter.
#[async_trait]
pub trait NovelStages: Send + Sync {
    /// Produce the story outline and base context from the prompt.
    async fn outline(&self, client: &StructuredClient, state: &RunState) -> Result<OutlineArtifact>;

    /// Split the outline into chapters, returning one short outline each.
    ///
    /// An empty list fails the run.
    async fn detect_chapters(&self, client: &StructuredClient, state: &RunState)
        -> Result<Vec<String>>;

    /// Expand every chapter outline. Skipped when outline expansion is off.
    async fn expand_chapters(&self, client: &StructuredClient, state: &RunState)
        -> Result<Vec<String>>;

    /// Write the prose of one chapter.
    async fn write_chapter(
        &self,
        client: &StructuredClient,
        state: &RunState,
        request: ChapterRequest,
    ) -> Result<String>;

    /// Final edit pass over `chapters`.
    async fn edit(
        &self,
        client: &StructuredClient,
        state: &RunState,
        chapters: &[String],
    ) -> Result<Vec<String>>;

    /// Remove leftover outline notes and model chatter from `chapters`.
    async fn scrub(
        &self,
        client: &StructuredClient,
        state: &RunState,
        chapters: &[String],
    ) -> Result<Vec<String>>;

    /// Translate `chapters` into `language`.
    async fn translate(
        &self,
        client: &StructuredClient,
        state: &RunState,
        chapters: &[String],
        language: &str,
    ) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chapter_request_bounds() {
        let first = ChapterRequest { index: 1, total: 3 };
        let last = ChapterRequest { index: 3, total: 3 };
        assert!(first.is_first() && !first.is_last());
        assert!(last.is_last() && !last.is_first());
        let only = ChapterRequest { index: 1, total: 1 };
        assert!(only.is_first() && only.is_last());
    }
}
