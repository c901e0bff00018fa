//! Opaque content generation collaborators
//!
//! The engine never interprets generated prose. It only checks structural
//! validity (plan shape and length, non-empty chapter text, rating range).
//! Implementations live outside the engine; the service crate ships an HTTP
//! one.

use crate::config::ReaderPersona;
use crate::errors::Result;
use crate::models::{Book, Chapter, ChapterPlanEntry, Outline, OutlineDraft, ReaderComment, Season};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a generator is told about the entrant it is writing for
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntrantContext {
    pub book_id: String,
    pub title: String,
    pub theme: String,
    pub constraints: String,
    pub min_chapters: u32,
    pub max_chapters: u32,
}

impl EntrantContext {
    pub fn new(book: &Book, season: &Season) -> Self {
        Self {
            book_id: book.id.clone(),
            title: book.title.clone(),
            theme: season.theme.clone(),
            constraints: season.constraints.clone(),
            min_chapters: season.round.min_chapters,
            max_chapters: season.round.max_chapters,
        }
    }
}

/// Generated chapter text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChapterDraft {
    /// Falls back to the plan entry title when empty
    #[serde(default)]
    pub title: String,
    pub content: String,
}

/// One persona's verdict on a chapter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReaderReview {
    /// Clamped into 1..=10 before it is stored
    pub rating: i64,
    pub critique: String,
}

/// Trait for the slow, fallible content steps the pipeline drives
///
/// Errors classified as transient are retried by the pipeline; anything else
/// fails the step immediately.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Produce characters and an ordered chapter plan
    async fn generate_outline(&self, ctx: &EntrantContext) -> Result<OutlineDraft>;

    /// Write chapter `number` from its plan entry.
    ///
    /// `prior_text` is the previous chapter's content, `None` for chapter 1.
    async fn write_chapter(
        &self,
        ctx: &EntrantContext,
        number: u32,
        entry: &ChapterPlanEntry,
        prior_text: Option<&str>,
    ) -> Result<ChapterDraft>;

    /// Review a published chapter as `persona`
    async fn review_chapter(&self, chapter: &Chapter, persona: &ReaderPersona)
    -> Result<ReaderReview>;

    /// Propose a revised outline in light of reader feedback.
    ///
    /// `None` keeps the current outline.
    async fn revise_outline(
        &self,
        _ctx: &EntrantContext,
        _outline: &Outline,
        _feedback: &[ReaderComment],
    ) -> Result<Option<OutlineDraft>> {
        Ok(None)
    }
}
