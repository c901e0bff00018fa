//! Catch-up reconciler
//!
//! Backfills chapters for entrants that lag behind the season's round (or,
//! for a single book, behind its own outline). Missing chapters are written
//! strictly in increasing order; an entrant without an outline gets one first.

use crate::db::SeasonDb;
use crate::errors::{EngineError, Result};
use crate::models::{Book, BookStatus, SeasonStatus, TaskPayload};
use crate::pipeline::{EntrantReport, GenerationPipeline, OutlineOutcome};
use crate::queue::{EnqueueOutcome, TaskQueue};
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Chapter numbers `chapter_count + 1 ..= upper`, or `None` if nothing is missing
pub fn missing_range(chapter_count: u32, upper: u32) -> Option<RangeInclusive<u32>> {
    if chapter_count < upper {
        Some(chapter_count + 1..=upper)
    } else {
        None
    }
}

/// Outcome of a season-wide pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpReport {
    pub season_id: String,
    pub target_round: u32,
    /// One entry per lagging entrant that was visited
    pub entrants: Vec<EntrantReport>,
}

impl CatchUpReport {
    pub fn failed(&self) -> usize {
        self.entrants.iter().filter(|e| !e.is_ok()).count()
    }
}

/// What a user-facing catch-up request did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchUpRequest {
    Queued { task_id: String },
    /// An identical request is already waiting or running
    AlreadyQueued { task_id: String },
}

pub struct CatchUpReconciler {
    db: Arc<SeasonDb>,
    pipeline: Arc<GenerationPipeline>,
    queue: TaskQueue,
}

impl CatchUpReconciler {
    pub fn new(db: Arc<SeasonDb>, pipeline: Arc<GenerationPipeline>, queue: TaskQueue) -> Self {
        Self {
            db,
            pipeline,
            queue,
        }
    }

    /// Backfill every ACTIVE entrant whose chapter count is below `target_round`
    pub async fn catch_up_books(&self, season_id: &str, target_round: u32) -> Result<CatchUpReport> {
        let lagging: Vec<Book> = self
            .db
            .books_in_season(season_id, &[BookStatus::Active])?
            .into_iter()
            .filter(|book| book.chapter_count < target_round)
            .collect();
        tracing::info!(season_id, target_round, lagging = lagging.len(), "Catch-up pass started");

        let mut report = CatchUpReport {
            season_id: season_id.to_string(),
            target_round,
            entrants: Vec::with_capacity(lagging.len()),
        };
        for book in &lagging {
            report.entrants.push(self.reconcile(book, target_round, false).await?);
        }

        tracing::info!(
            season_id,
            target_round,
            failed = report.failed(),
            "Catch-up pass finished"
        );
        Ok(report)
    }

    /// Backfill one entrant up to `max(target_round, outline length)`
    pub async fn catch_up_single_book(&self, book_id: &str, target_round: u32) -> Result<EntrantReport> {
        let book = self
            .db
            .get_book(book_id)?
            .ok_or_else(|| EngineError::not_found("book", book_id))?;
        if book.status != BookStatus::Active {
            return Err(EngineError::invalid_state(format!(
                "book {book_id} is {} and cannot be caught up",
                book.status.as_str()
            )));
        }
        self.reconcile(&book, target_round, true).await
    }

    async fn reconcile(
        &self,
        book: &Book,
        target_round: u32,
        follow_outline: bool,
    ) -> Result<EntrantReport> {
        let mut report = EntrantReport::new(&book.id);
        if let Err(err) = self
            .backfill(book, target_round, follow_outline, &mut report)
            .await
        {
            report.absorb(err)?;
        }
        Ok(report)
    }

    async fn backfill(
        &self,
        book: &Book,
        target_round: u32,
        follow_outline: bool,
        report: &mut EntrantReport,
    ) -> Result<()> {
        let outline_len = self.ensure_outline(book, report).await?;
        let upper = if follow_outline {
            target_round.max(outline_len)
        } else {
            target_round
        };
        let chapter_count = self
            .db
            .get_book(&book.id)?
            .ok_or_else(|| EngineError::not_found("book", book.id.clone()))?
            .chapter_count;

        let Some(range) = missing_range(chapter_count, upper) else {
            tracing::debug!(book_id = %book.id, chapter_count, upper, "Nothing to backfill");
            return Ok(());
        };
        tracing::info!(book_id = %book.id, from = range.start(), to = range.end(), "Backfilling chapters");

        let run = self.pipeline.write_chapters(&book.id, range).await;
        report.chapters_written = run.published.iter().map(|c| c.number).collect();
        match run.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Generate an outline if missing; returns the outline's chapter count
    async fn ensure_outline(&self, book: &Book, report: &mut EntrantReport) -> Result<u32> {
        if let Some(outline) = self.db.get_outline(&book.id)? {
            return Ok(outline.chapter_len());
        }
        let outcome = self.pipeline.generate_outline(&book.id, false).await?;
        report.outline_generated = matches!(outcome, OutlineOutcome::Generated { .. });
        self.db
            .get_outline(&book.id)?
            .map(|outline| outline.chapter_len())
            .ok_or_else(|| EngineError::plan_missing(book.id.clone(), 1))
    }

    /// Queue a catch-up for one book at its season's current round.
    ///
    /// Reports only whether the work was queued; the outcome is observable
    /// later through the book's chapters.
    pub fn request_catch_up(&self, book_id: &str) -> Result<CatchUpRequest> {
        let book = self
            .db
            .get_book(book_id)?
            .ok_or_else(|| EngineError::not_found("book", book_id))?;
        if book.status != BookStatus::Active {
            return Err(EngineError::invalid_state(format!(
                "book {book_id} is {} and cannot be caught up",
                book.status.as_str()
            )));
        }
        let season = self
            .db
            .get_season(&book.season_id)?
            .ok_or_else(|| EngineError::not_found("season", book.season_id.clone()))?;
        if season.status != SeasonStatus::Active {
            return Err(EngineError::invalid_state(format!(
                "season {} is not running",
                season.id
            )));
        }

        let payload = TaskPayload::CatchUp {
            season_id: season.id,
            round: season.current_round,
            book_id: Some(book.id),
        };
        Ok(match self.queue.enqueue(payload)? {
            EnqueueOutcome::Enqueued { task_id } => CatchUpRequest::Queued { task_id },
            EnqueueOutcome::Duplicate { existing_id } => CatchUpRequest::AlreadyQueued {
                task_id: existing_id,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_range_covers_the_gap() {
        assert_eq!(missing_range(2, 5), Some(3..=5));
        assert_eq!(missing_range(0, 1), Some(1..=1));
    }

    #[test]
    fn missing_range_is_empty_when_caught_up() {
        assert_eq!(missing_range(3, 3), None);
        assert_eq!(missing_range(5, 3), None);
    }
}
