//! Generation pipeline
//!
//! Three idempotent, individually charged steps:
//! 1. outline generation
//! 2. single-chapter writing
//! 3. reader-feedback dispatch
//!
//! plus the per-round composition of those steps over every active entrant.
//! Entrants are processed one at a time and chapters strictly in order.
//! A failing entrant is recorded in the report and never aborts its siblings.

use crate::config::{GenerationConfig, ReaderPersona, ReadersConfig};
use crate::db::SeasonDb;
use crate::errors::{EngineError, ErrorCategory, Result};
use crate::generation::{ContentGenerator, EntrantContext};
use crate::ledger::{InkEntry, InkLedger};
use crate::models::{
    Book, BookStatus, Chapter, ChapterPlanEntry, NewChapter, Outline, OutlineDraft, ReaderComment,
    Season,
};
use crate::retry::with_retry;
use chrono::Utc;
use rand::seq::IndexedRandom;
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Result of [`GenerationPipeline::generate_outline`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutlineOutcome {
    Generated { chapters: u32 },
    /// A new plan replaced the old one as `version`
    Regenerated { version: u32, chapters: u32 },
    /// The book already has an outline and no regeneration was requested
    AlreadyPresent,
}

/// Result of [`GenerationPipeline::write_chapter`]
#[derive(Debug, Clone, PartialEq)]
pub enum ChapterOutcome {
    Published(Chapter),
    /// A chapter with that number exists; nothing was written or charged
    AlreadyExists,
}

/// Result of [`GenerationPipeline::dispatch_reader_feedback`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedbackOutcome {
    pub posted: usize,
    /// Personas whose review failed and were skipped
    pub failed: usize,
    /// The chapter had been reviewed before; nothing was dispatched
    pub already_reviewed: bool,
    pub acclaimed: bool,
}

/// Why an entrant was skipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrantFailure {
    pub category: ErrorCategory,
    pub message: String,
}

impl From<&EngineError> for EntrantFailure {
    fn from(err: &EngineError) -> Self {
        Self {
            category: err.category(),
            message: err.to_string(),
        }
    }
}

/// What happened to one entrant during a round cycle or catch-up pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntrantReport {
    pub book_id: String,
    pub outline_generated: bool,
    /// Chapter numbers published in this pass, in write order
    pub chapters_written: Vec<u32>,
    pub comments_posted: usize,
    /// New outline version recorded after feedback
    pub outline_version: Option<u32>,
    pub error: Option<EntrantFailure>,
}

impl EntrantReport {
    pub fn new(book_id: impl Into<String>) -> Self {
        Self {
            book_id: book_id.into(),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub(crate) fn record_error(&mut self, err: &EngineError) {
        tracing::warn!(
            book_id = %self.book_id,
            category = err.category().as_str(),
            error = %err,
            "Entrant skipped"
        );
        self.error = Some(EntrantFailure::from(err));
    }

    /// Record an entrant-scoped failure; hand back any other error
    pub(crate) fn absorb(&mut self, err: EngineError) -> Result<()> {
        if err.category().is_entrant_scoped() {
            self.record_error(&err);
            Ok(())
        } else {
            Err(err)
        }
    }
}

/// Outcome of a full round cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundCycleReport {
    pub season_id: String,
    pub round: u32,
    pub entrants: Vec<EntrantReport>,
}

impl RoundCycleReport {
    pub fn failed(&self) -> usize {
        self.entrants.iter().filter(|e| !e.is_ok()).count()
    }

    pub fn chapters_written(&self) -> usize {
        self.entrants.iter().map(|e| e.chapters_written.len()).sum()
    }
}

/// Chapters published by [`GenerationPipeline::write_chapters`] and the
/// error that stopped the run, if any
#[derive(Debug)]
pub struct ChapterRun {
    pub published: Vec<Chapter>,
    pub error: Option<EngineError>,
}

pub struct GenerationPipeline {
    db: Arc<SeasonDb>,
    ledger: InkLedger,
    generator: Arc<dyn ContentGenerator>,
    generation: GenerationConfig,
    readers: ReadersConfig,
}

impl GenerationPipeline {
    pub fn new(
        db: Arc<SeasonDb>,
        ledger: InkLedger,
        generator: Arc<dyn ContentGenerator>,
        generation: GenerationConfig,
        readers: ReadersConfig,
    ) -> Self {
        Self {
            db,
            ledger,
            generator,
            generation,
            readers,
        }
    }

    pub fn ledger(&self) -> &InkLedger {
        &self.ledger
    }

    fn book(&self, book_id: &str) -> Result<Book> {
        self.db
            .get_book(book_id)?
            .ok_or_else(|| EngineError::not_found("book", book_id))
    }

    fn season(&self, season_id: &str) -> Result<Season> {
        self.db
            .get_season(season_id)?
            .ok_or_else(|| EngineError::not_found("season", season_id))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Step 1: outline
    // ─────────────────────────────────────────────────────────────────────────────

    /// Generate an outline for a book that has none, or replace the current
    /// one when `regenerate` is set.
    ///
    /// Ink is debited only once the outline is persisted. On regeneration,
    /// plan entries for chapters already written are kept.
    pub async fn generate_outline(&self, book_id: &str, regenerate: bool) -> Result<OutlineOutcome> {
        let book = self.book(book_id)?;
        let existing = self.db.get_outline(book_id)?;
        if existing.is_some() && !regenerate {
            return Ok(OutlineOutcome::AlreadyPresent);
        }
        if !matches!(book.status, BookStatus::Draft | BookStatus::Active) {
            return Err(EngineError::invalid_state(format!(
                "book {book_id} is {} and takes no outline",
                book.status.as_str()
            )));
        }
        self.ledger.ensure_solvent(book_id)?;

        let season = self.season(&book.season_id)?;
        let ctx = EntrantContext::new(&book, &season);
        let (min, max) = (season.round.min_chapters, season.round.max_chapters);

        let generator = self.generator.as_ref();
        let ctx_ref = &ctx;
        let draft = with_retry(&self.generation, "outline", move || async move {
            let draft = generator.generate_outline(ctx_ref).await?;
            normalize_plan(draft, min, max)
        })
        .await?;

        let charges = self.ledger.outline_charges();
        let now = Utc::now();
        match existing {
            None => {
                let chapters = draft.chapters.len() as u32;
                if !self.db.insert_outline(book_id, &draft, &charges, now)? {
                    tracing::debug!(book_id, "Outline appeared concurrently; keeping it");
                    return Ok(OutlineOutcome::AlreadyPresent);
                }
                tracing::info!(book_id, chapters, "Outline generated");
                Ok(OutlineOutcome::Generated { chapters })
            }
            Some(current) => {
                let written = self.book(book_id)?.chapter_count;
                let merged = normalize_plan(merge_plan(&current, draft, written), min, max)
                    .map_err(|e| EngineError::invalid_state(format!("regenerated plan rejected: {e}")))?;
                let chapters = merged.chapters.len() as u32;
                let version = self.db.replace_outline(
                    book_id,
                    &merged,
                    season.current_round,
                    "regenerated",
                    &charges,
                    now,
                )?;
                tracing::info!(book_id, version, chapters, "Outline regenerated");
                Ok(OutlineOutcome::Regenerated { version, chapters })
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Step 2: chapter
    // ─────────────────────────────────────────────────────────────────────────────

    /// Write and publish chapter `number`.
    ///
    /// A chapter that already exists is left alone and nothing is charged.
    pub async fn write_chapter(&self, book_id: &str, number: u32) -> Result<ChapterOutcome> {
        if number == 0 {
            return Err(EngineError::invalid_state("chapter numbers start at 1"));
        }
        if self.db.chapter_by_number(book_id, number)?.is_some() {
            tracing::debug!(book_id, number, "Chapter already published");
            return Ok(ChapterOutcome::AlreadyExists);
        }

        let book = self.book(book_id)?;
        if book.status != BookStatus::Active {
            return Err(EngineError::invalid_state(format!(
                "book {book_id} is {} and cannot publish chapters",
                book.status.as_str()
            )));
        }
        self.ledger.ensure_solvent(book_id)?;

        let outline = self
            .db
            .get_outline(book_id)?
            .ok_or_else(|| EngineError::plan_missing(book_id, number))?;
        let entry = outline
            .entry(number)
            .cloned()
            .ok_or_else(|| EngineError::plan_missing(book_id, number))?;

        let prior = if number > 1 {
            let prior = self
                .db
                .chapter_by_number(book_id, number - 1)?
                .ok_or_else(|| EngineError::MissingPriorChapter {
                    book_id: book_id.to_string(),
                    chapter: number,
                })?;
            Some(prior.content)
        } else {
            None
        };

        let season = self.season(&book.season_id)?;
        let ctx = EntrantContext::new(&book, &season);
        let draft = {
            let generator = self.generator.as_ref();
            let (ctx, entry, prior) = (&ctx, &entry, prior.as_deref());
            let label = format!("chapter {number}");
            with_retry(&self.generation, &label, move || async move {
                let draft = generator.write_chapter(ctx, number, entry, prior).await?;
                if draft.content.trim().is_empty() {
                    return Err(EngineError::transient(format!(
                        "chapter {number} came back empty"
                    )));
                }
                Ok(draft)
            })
            .await?
        };

        let title = if draft.title.trim().is_empty() {
            entry.title
        } else {
            draft.title
        };
        let new_chapter = NewChapter {
            book_id: book_id.to_string(),
            number,
            title,
            content: draft.content,
        };

        match self
            .db
            .publish_chapter(&new_chapter, &self.ledger.chapter_charges(), Utc::now())?
        {
            Some(chapter) => {
                tracing::info!(
                    book_id,
                    number,
                    word_count = chapter.word_count,
                    "Chapter published"
                );
                Ok(ChapterOutcome::Published(chapter))
            }
            None => {
                tracing::debug!(book_id, number, "Chapter published concurrently; discarding draft");
                Ok(ChapterOutcome::AlreadyExists)
            }
        }
    }

    /// Write every chapter in `numbers`, in order, stopping at the first error
    pub async fn write_chapters(&self, book_id: &str, numbers: RangeInclusive<u32>) -> ChapterRun {
        let mut run = ChapterRun {
            published: Vec::new(),
            error: None,
        };
        for number in numbers {
            match self.write_chapter(book_id, number).await {
                Ok(ChapterOutcome::Published(chapter)) => run.published.push(chapter),
                Ok(ChapterOutcome::AlreadyExists) => {}
                Err(err) => {
                    run.error = Some(err);
                    break;
                }
            }
        }
        run
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Step 3: reader feedback
    // ─────────────────────────────────────────────────────────────────────────────

    /// Collect reviews from a bounded sample of personas.
    ///
    /// A failing persona is skipped. A chapter is only ever reviewed once.
    pub async fn dispatch_reader_feedback(&self, chapter_id: &str) -> Result<FeedbackOutcome> {
        let chapter = self
            .db
            .get_chapter(chapter_id)?
            .ok_or_else(|| EngineError::not_found("chapter", chapter_id))?;
        if !self.db.comments_for_chapter(chapter_id)?.is_empty() {
            return Ok(FeedbackOutcome {
                already_reviewed: true,
                ..FeedbackOutcome::default()
            });
        }

        let mut outcome = FeedbackOutcome::default();
        let mut comments = Vec::new();
        for persona in self.sample_personas() {
            let generator = self.generator.as_ref();
            let (chapter_ref, persona_ref) = (&chapter, &persona);
            let label = format!("review by {}", persona.name);
            let review = with_retry(&self.generation, &label, move || async move {
                generator.review_chapter(chapter_ref, persona_ref).await
            })
            .await;

            match review {
                Ok(review) => comments.push(ReaderComment {
                    chapter_id: chapter.id.clone(),
                    chapter_number: chapter.number,
                    persona: persona.name.clone(),
                    rating: review.rating.clamp(1, 10) as u8,
                    critique: review.critique,
                    created_at: Utc::now(),
                }),
                Err(err) => {
                    tracing::warn!(
                        chapter_id,
                        persona = %persona.name,
                        error = %err,
                        "Reader review failed; skipping persona"
                    );
                    outcome.failed += 1;
                }
            }
        }

        outcome.posted = self.db.insert_comments(&comments)?;
        outcome.acclaimed = self.reward_acclaim(&chapter, &comments)?;
        tracing::debug!(
            chapter_id,
            posted = outcome.posted,
            failed = outcome.failed,
            "Reader feedback dispatched"
        );
        Ok(outcome)
    }

    fn sample_personas(&self) -> Vec<ReaderPersona> {
        let amount = self.readers.per_chapter.min(self.readers.personas.len());
        let mut rng = rand::rng();
        self.readers
            .personas
            .choose_multiple(&mut rng, amount)
            .cloned()
            .collect()
    }

    fn reward_acclaim(&self, chapter: &Chapter, comments: &[ReaderComment]) -> Result<bool> {
        let cfg = self.ledger.config();
        if cfg.acclaim_reward <= 0 || comments.is_empty() {
            return Ok(false);
        }
        let mean = comments.iter().map(|c| f64::from(c.rating)).sum::<f64>() / comments.len() as f64;
        if mean < cfg.acclaim_rating {
            return Ok(false);
        }
        let balance = self
            .ledger
            .apply(&chapter.book_id, &[InkEntry::ReaderAcclaim])?;
        tracing::info!(
            book_id = %chapter.book_id,
            number = chapter.number,
            mean,
            balance,
            "Chapter acclaimed by readers"
        );
        Ok(true)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Outline optimization
    // ─────────────────────────────────────────────────────────────────────────────

    /// Ask the generator to revise the remaining plan using reader feedback.
    ///
    /// Entries for chapters already written stay fixed. Returns the new
    /// outline version, or `None` when nothing changed.
    pub async fn optimize_outline(&self, book_id: &str, round: u32) -> Result<Option<u32>> {
        let book = self.book(book_id)?;
        let outline = self
            .db
            .get_outline(book_id)?
            .ok_or_else(|| EngineError::not_found("outline", book_id))?;
        let feedback = self.db.comments_for_book(book_id)?;
        if feedback.is_empty() {
            return Ok(None);
        }

        let season = self.season(&book.season_id)?;
        let ctx = EntrantContext::new(&book, &season);
        let revised = {
            let generator = self.generator.as_ref();
            let (ctx, outline, feedback) = (&ctx, &outline, feedback.as_slice());
            with_retry(&self.generation, "outline revision", move || async move {
                generator.revise_outline(ctx, outline, feedback).await
            })
            .await?
        };
        let Some(revised) = revised else {
            return Ok(None);
        };

        let (min, max) = (season.round.min_chapters, season.round.max_chapters);
        let merged = match normalize_plan(merge_plan(&outline, revised, book.chapter_count), min, max) {
            Ok(merged) => merged,
            Err(err) => {
                tracing::warn!(book_id, error = %err, "Discarding invalid outline revision");
                return Ok(None);
            }
        };
        if merged.chapters == outline.chapters && merged.characters == outline.characters {
            return Ok(None);
        }

        let version =
            self.db
                .replace_outline(book_id, &merged, round, "reader feedback", &[], Utc::now())?;
        tracing::info!(book_id, version, round, "Outline revised after reader feedback");
        Ok(Some(version))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Round cycle
    // ─────────────────────────────────────────────────────────────────────────────

    /// Bring every ACTIVE entrant of the season up to `round` chapters
    pub async fn run_round_cycle(&self, season_id: &str, round: u32) -> Result<RoundCycleReport> {
        let season = self.season(season_id)?;
        let books = self.db.books_in_season(season_id, &[BookStatus::Active])?;
        tracing::info!(season_id, round, entrants = books.len(), "Round cycle started");

        let mut report = RoundCycleReport {
            season_id: season_id.to_string(),
            round,
            entrants: Vec::with_capacity(books.len()),
        };
        for book in &books {
            report.entrants.push(self.run_entrant_cycle(book, round).await?);
        }

        tracing::info!(
            season_id,
            round,
            theme = %season.theme,
            chapters = report.chapters_written(),
            failed = report.failed(),
            "Round cycle finished"
        );
        Ok(report)
    }

    /// Entrant-scoped failures land in the report; anything else aborts the cycle
    async fn run_entrant_cycle(&self, book: &Book, round: u32) -> Result<EntrantReport> {
        let mut report = EntrantReport::new(&book.id);
        if let Err(err) = self.advance_entrant(book, round, &mut report).await {
            report.absorb(err)?;
        }
        Ok(report)
    }

    async fn advance_entrant(&self, book: &Book, round: u32, report: &mut EntrantReport) -> Result<()> {
        self.ledger.ensure_solvent(&book.id)?;

        if self.db.get_outline(&book.id)?.is_none() {
            let outcome = self.generate_outline(&book.id, false).await?;
            report.outline_generated = matches!(outcome, OutlineOutcome::Generated { .. });
        }

        let current = self.book(&book.id)?.chapter_count;
        let run = self.write_chapters(&book.id, current + 1..=round).await;
        report.chapters_written = run.published.iter().map(|c| c.number).collect();

        for chapter in &run.published {
            match self.dispatch_reader_feedback(&chapter.id).await {
                Ok(feedback) => report.comments_posted += feedback.posted,
                Err(err) => tracing::warn!(
                    book_id = %book.id,
                    number = chapter.number,
                    error = %err,
                    "Reader feedback failed"
                ),
            }
        }

        if let Some(err) = run.error {
            return Err(err);
        }

        if self.generation.optimize_outline_after_feedback && report.comments_posted > 0 {
            match self.optimize_outline(&book.id, round).await {
                Ok(version) => report.outline_version = version,
                Err(err) => tracing::warn!(book_id = %book.id, error = %err, "Outline revision failed"),
            }
        }
        Ok(())
    }
}

/// Order plan entries by number and check the plan is `1..=n` with
/// `min <= n <= max`. Violations are transient so the generator is asked again.
pub fn normalize_plan(mut draft: OutlineDraft, min: u32, max: u32) -> Result<OutlineDraft> {
    draft.chapters.sort_by_key(|entry| entry.number);
    let len = draft.chapters.len() as u32;
    if !(min..=max).contains(&len) {
        return Err(EngineError::transient(format!(
            "plan has {len} chapters, expected {min}..={max}"
        )));
    }
    let sequential = draft
        .chapters
        .iter()
        .zip(1u32..)
        .all(|(entry, expected)| entry.number == expected);
    if !sequential {
        return Err(EngineError::transient("plan chapters are not numbered 1..=n"));
    }
    Ok(draft)
}

/// Keep entries `1..=written` from `current`; take the rest from `revised`
pub fn merge_plan(current: &Outline, revised: OutlineDraft, written: u32) -> OutlineDraft {
    let mut chapters: Vec<ChapterPlanEntry> = current
        .chapters
        .iter()
        .filter(|entry| entry.number <= written)
        .cloned()
        .collect();
    chapters.extend(revised.chapters.into_iter().filter(|entry| entry.number > written));
    OutlineDraft {
        characters: revised.characters,
        chapters,
    }
}
