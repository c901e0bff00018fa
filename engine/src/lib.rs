//! Inkwell season engine
//!
//! Orchestration core for a recurring, round-based writing competition:
//! - Phase scheduler driving each season through AI work and reading windows
//! - Durable task queue with a single-flight worker
//! - Catch-up reconciler that backfills lagging entrants
//! - Generation pipeline (outline, chapters, reader feedback) over an opaque
//!   [`ContentGenerator`]
//! - Ink ledger gating and rewarding every generation step
//!
//! All state lives in one SQLite database ([`SeasonDb`]). Every entry point is
//! safe to call redundantly and reports a structured outcome.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod config;
pub mod db;
pub mod errors;
pub mod generation;
pub mod ledger;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod scheduler;
pub mod season;
pub mod worker;

pub use config::{EngineConfig, ReaderPersona};
pub use db::SeasonDb;
pub use errors::{EngineError, ErrorCategory, Result};
pub use generation::{ChapterDraft, ContentGenerator, EntrantContext, ReaderReview};
pub use ledger::{GrantOutcome, InkEntry, InkLedger};
pub use models::{
    Book, BookStatus, Chapter, ChapterPlanEntry, Character, NewSeason, Outline, OutlineDraft,
    ReaderComment, RoundConfig, RoundPhase, Season, SeasonStatus, TaskItem, TaskKind, TaskPayload,
    TaskStatus,
};
pub use pipeline::{
    ChapterOutcome, EntrantReport, FeedbackOutcome, GenerationPipeline, OutlineOutcome,
    RoundCycleReport,
};
pub use queue::{EnqueueOutcome, TaskQueue};
pub use reconciler::{CatchUpReconciler, CatchUpReport, CatchUpRequest, missing_range};
pub use scheduler::{AdvanceOutcome, PhaseScheduler, reading_window};
pub use season::SeasonManager;
pub use worker::{DrainSummary, TaskWorker, TriggerOutcome};

use std::sync::Arc;

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Composition root wiring every component over one store
pub struct SeasonEngine {
    cfg: EngineConfig,
    db: Arc<SeasonDb>,
    ledger: InkLedger,
    pipeline: Arc<GenerationPipeline>,
    reconciler: Arc<CatchUpReconciler>,
    queue: TaskQueue,
    worker: TaskWorker,
    scheduler: PhaseScheduler,
    seasons: SeasonManager,
}

impl SeasonEngine {
    /// Load configuration, open the database and wire the engine
    pub fn new(generator: Arc<dyn ContentGenerator>) -> Result<Self> {
        let cfg = EngineConfig::load()?;
        Self::with_config(cfg, generator)
    }

    /// Create an engine with a specific config
    pub fn with_config(cfg: EngineConfig, generator: Arc<dyn ContentGenerator>) -> Result<Self> {
        let db = Arc::new(SeasonDb::connect_and_init(&cfg)?);

        tracing::info!(
            version = VERSION,
            db_path = %cfg.resolved_db_path().display(),
            max_ai_work_minutes = cfg.scheduler.max_ai_work_minutes,
            min_reading_minutes = cfg.scheduler.min_reading_minutes,
            "Season engine initialized"
        );

        Ok(Self::with_db(cfg, db, generator))
    }

    /// Wire the engine over an already opened store
    pub fn with_db(cfg: EngineConfig, db: Arc<SeasonDb>, generator: Arc<dyn ContentGenerator>) -> Self {
        let ledger = InkLedger::new(db.clone(), cfg.ink.clone());
        let queue = TaskQueue::new(db.clone());
        let pipeline = Arc::new(GenerationPipeline::new(
            db.clone(),
            ledger.clone(),
            generator,
            cfg.generation.clone(),
            cfg.readers.clone(),
        ));
        let reconciler = Arc::new(CatchUpReconciler::new(
            db.clone(),
            pipeline.clone(),
            queue.clone(),
        ));
        let worker = TaskWorker::new(
            db.clone(),
            queue.clone(),
            pipeline.clone(),
            reconciler.clone(),
            cfg.worker.clone(),
        );
        let scheduler = PhaseScheduler::new(db.clone(), queue.clone(), cfg.scheduler.clone());
        let seasons = SeasonManager::new(db.clone(), cfg.ink.clone());

        Self {
            cfg,
            db,
            ledger,
            pipeline,
            reconciler,
            queue,
            worker,
            scheduler,
            seasons,
        }
    }

    /// In-memory engine with the given config
    pub fn in_memory(cfg: EngineConfig, generator: Arc<dyn ContentGenerator>) -> Result<Self> {
        let db = Arc::new(SeasonDb::open_in_memory()?);
        Ok(Self::with_db(cfg, db, generator))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn db(&self) -> &SeasonDb {
        &self.db
    }

    pub fn ledger(&self) -> &InkLedger {
        &self.ledger
    }

    pub fn pipeline(&self) -> &GenerationPipeline {
        &self.pipeline
    }

    pub fn reconciler(&self) -> &CatchUpReconciler {
        &self.reconciler
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn worker(&self) -> &TaskWorker {
        &self.worker
    }

    pub fn scheduler(&self) -> &PhaseScheduler {
        &self.scheduler
    }

    pub fn seasons(&self) -> &SeasonManager {
        &self.seasons
    }

    /// One scheduler check followed by one worker drain
    pub async fn tick(&self) -> (AdvanceOutcome, TriggerOutcome) {
        let advance = self.scheduler.check_and_advance();
        let trigger = self.worker.trigger_once().await;
        (advance, trigger)
    }

    /// Delete queue items past the configured horizon
    pub fn cleanup_queue(&self) -> Result<usize> {
        self.queue.cleanup(self.cfg.queue.cleanup_max_age_hours)
    }
}
