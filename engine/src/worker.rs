//! Task worker
//!
//! `trigger_once` drains the queue until it is empty. Two guards sit in front
//! of a drain, both single compare-and-set statements on the worker-lock row:
//! a minimum spacing between triggers, and the busy flag that keeps drains
//! single-flight. A flag older than the stale-run horizon is taken over and
//! the tasks the crashed drain left RUNNING are failed. A drain that finds its
//! flag taken over stops claiming and reports what it had done so far.

use crate::config::WorkerConfig;
use crate::db::{LockAcquire, SeasonDb};
use crate::errors::Result;
use crate::models::{TaskItem, TaskPayload};
use crate::pipeline::GenerationPipeline;
use crate::queue::TaskQueue;
use crate::reconciler::CatchUpReconciler;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Result of [`TaskWorker::trigger_once`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Arrived sooner than the minimum trigger spacing
    Throttled,
    /// Another drain holds the flag
    Busy { since: Option<DateTime<Utc>> },
    Drained(DrainSummary),
    /// The drain loop itself failed; the flag has been released
    Failed { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// The flag was taken over from a drain presumed crashed
    pub reclaimed_stale: bool,
    /// RUNNING tasks failed because their drain was presumed crashed
    pub orphans_failed: usize,
    /// Items this drain ran whose result was dropped because a later drain
    /// had already failed them
    pub lost: usize,
    /// Another drain took the flag over; this one stopped early
    pub taken_over: bool,
}

/// Releases the busy flag when the drain ends, however it ends
struct DrainGuard<'a> {
    db: &'a SeasonDb,
    since: DateTime<Utc>,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        match self.db.release_worker_lock(self.since) {
            Ok(true) => tracing::debug!("Worker lock released"),
            Ok(false) => tracing::warn!(
                since = %self.since,
                "Worker lock was taken over before this drain finished"
            ),
            Err(e) => tracing::error!(error = %e, "Failed to release worker lock"),
        }
    }
}

pub struct TaskWorker {
    db: Arc<SeasonDb>,
    queue: TaskQueue,
    pipeline: Arc<GenerationPipeline>,
    reconciler: Arc<CatchUpReconciler>,
    cfg: WorkerConfig,
}

impl TaskWorker {
    pub fn new(
        db: Arc<SeasonDb>,
        queue: TaskQueue,
        pipeline: Arc<GenerationPipeline>,
        reconciler: Arc<CatchUpReconciler>,
        cfg: WorkerConfig,
    ) -> Self {
        Self {
            db,
            queue,
            pipeline,
            reconciler,
            cfg,
        }
    }

    pub async fn trigger_once(&self) -> TriggerOutcome {
        self.trigger_once_at(Utc::now()).await
    }

    /// Run one drain, judging spacing and staleness against `now`
    pub async fn trigger_once_at(&self, now: DateTime<Utc>) -> TriggerOutcome {
        match self.db.gate_trigger(now, self.cfg.min_trigger_interval()) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("Trigger arrived inside the minimum interval; ignored");
                return TriggerOutcome::Throttled;
            }
            Err(e) => return self.failed(e),
        }

        let stale_before = now - self.cfg.stale_run();
        let (since, stale_since) = match self.db.try_acquire_worker_lock(now, stale_before) {
            Ok(LockAcquire::Acquired { since }) => (since, None),
            Ok(LockAcquire::Reclaimed { since, stale_since }) => (since, Some(stale_since)),
            Ok(LockAcquire::Busy { since }) => {
                tracing::debug!(?since, "Worker busy; trigger ignored");
                return TriggerOutcome::Busy { since };
            }
            Err(e) => return self.failed(e),
        };
        let _guard = DrainGuard {
            db: &self.db,
            since,
        };

        let mut summary = DrainSummary::default();
        if let Some(stale_since) = stale_since {
            tracing::warn!(%stale_since, "Reclaiming stale worker lock");
            summary.reclaimed_stale = true;
            match self
                .db
                .fail_running_tasks("worker run abandoned before completion", now)
            {
                Ok(orphans) => summary.orphans_failed = orphans,
                Err(e) => return self.failed(e),
            }
        }

        match self.drain(since, &mut summary).await {
            Ok(()) => {
                tracing::info!(
                    processed = summary.processed,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    lost = summary.lost,
                    taken_over = summary.taken_over,
                    "Task queue drained"
                );
                TriggerOutcome::Drained(summary)
            }
            Err(e) => self.failed(e),
        }
    }

    fn failed(&self, err: crate::errors::EngineError) -> TriggerOutcome {
        tracing::error!(
            category = err.category().as_str(),
            error = %err,
            "Worker trigger failed"
        );
        TriggerOutcome::Failed {
            reason: err.to_string(),
        }
    }

    async fn drain(&self, since: DateTime<Utc>, summary: &mut DrainSummary) -> Result<()> {
        loop {
            if !self.db.holds_worker_lock(since)? {
                tracing::warn!(%since, "Worker lock taken over; stopping this drain");
                summary.taken_over = true;
                return Ok(());
            }
            let Some(item) = self.queue.claim_next()? else {
                return Ok(());
            };
            summary.processed += 1;
            let outcome = AssertUnwindSafe(self.execute(&item)).catch_unwind().await;
            let (succeeded, finished) = match outcome {
                Ok(Ok(())) => (true, self.queue.mark_done(&item.id)?),
                Ok(Err(err)) => {
                    tracing::warn!(
                        task_id = %item.id,
                        kind = item.kind().as_str(),
                        category = err.category().as_str(),
                        error = %err,
                        "Task failed"
                    );
                    (false, self.queue.mark_failed(&item.id, &err.to_string())?)
                }
                Err(_) => {
                    tracing::error!(task_id = %item.id, kind = item.kind().as_str(), "Task panicked");
                    (false, self.queue.mark_failed(&item.id, "task panicked")?)
                }
            };
            match (finished, succeeded) {
                // Failed by the drain that took the flag over
                (false, _) => summary.lost += 1,
                (true, true) => summary.succeeded += 1,
                (true, false) => summary.failed += 1,
            }
        }
    }

    async fn execute(&self, item: &TaskItem) -> Result<()> {
        match &item.payload {
            TaskPayload::RoundCycle { season_id, round } => {
                let report = self.pipeline.run_round_cycle(season_id, *round).await?;
                tracing::debug!(
                    task_id = %item.id,
                    chapters = report.chapters_written(),
                    failed_entrants = report.failed(),
                    "Round cycle task complete"
                );
            }
            TaskPayload::CatchUp {
                season_id,
                round,
                book_id: Some(book_id),
            } => {
                let report = self.reconciler.catch_up_single_book(book_id, *round).await?;
                tracing::debug!(
                    task_id = %item.id,
                    season_id = %season_id,
                    chapters = report.chapters_written.len(),
                    ok = report.is_ok(),
                    "Single-book catch-up task complete"
                );
            }
            TaskPayload::CatchUp {
                season_id,
                round,
                book_id: None,
            } => {
                let report = self.reconciler.catch_up_books(season_id, *round).await?;
                tracing::debug!(
                    task_id = %item.id,
                    entrants = report.entrants.len(),
                    failed_entrants = report.failed(),
                    "Season catch-up task complete"
                );
            }
        }
        Ok(())
    }
}
