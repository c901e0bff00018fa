//! Durable task queue
//!
//! FIFO backlog of round-cycle and catch-up work. A dedupe key derived from
//! the payload keeps at most one PENDING or RUNNING item per (kind, season,
//! round[, book]); a duplicate enqueue is logged and reported, never raised.

use crate::config::horizon;
use crate::db::{SeasonDb, TaskInsert};
use crate::errors::Result;
use crate::models::{TaskItem, TaskPayload, TaskStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Result of [`TaskQueue::enqueue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { task_id: String },
    /// A live item with the same key already exists
    Duplicate { existing_id: String },
}

impl EnqueueOutcome {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Enqueued { task_id } => task_id,
            Self::Duplicate { existing_id } => existing_id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Enqueued { .. })
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    db: Arc<SeasonDb>,
}

impl TaskQueue {
    pub fn new(db: Arc<SeasonDb>) -> Self {
        Self { db }
    }

    pub fn enqueue(&self, payload: TaskPayload) -> Result<EnqueueOutcome> {
        self.enqueue_at(payload, Utc::now())
    }

    pub fn enqueue_at(&self, payload: TaskPayload, now: DateTime<Utc>) -> Result<EnqueueOutcome> {
        match self.db.insert_task(&payload, now)? {
            TaskInsert::Inserted(item) => {
                tracing::info!(
                    task_id = %item.id,
                    kind = payload.kind().as_str(),
                    season_id = payload.season_id(),
                    round = payload.round(),
                    "Task enqueued"
                );
                Ok(EnqueueOutcome::Enqueued { task_id: item.id })
            }
            TaskInsert::Duplicate { existing_id } => {
                tracing::info!(
                    existing_id = %existing_id,
                    dedupe_key = %payload.dedupe_key(),
                    "Duplicate enqueue ignored; a live task already covers it"
                );
                Ok(EnqueueOutcome::Duplicate { existing_id })
            }
        }
    }

    /// Move the oldest PENDING item to RUNNING and return it
    pub fn claim_next(&self) -> Result<Option<TaskItem>> {
        self.claim_next_at(Utc::now())
    }

    pub fn claim_next_at(&self, now: DateTime<Utc>) -> Result<Option<TaskItem>> {
        let item = self.db.claim_next_task(now)?;
        if let Some(item) = &item {
            tracing::debug!(task_id = %item.id, kind = item.kind().as_str(), "Task claimed");
        }
        Ok(item)
    }

    /// Returns `false` if the item was no longer RUNNING and the result was dropped
    pub fn mark_done(&self, task_id: &str) -> Result<bool> {
        self.finish(task_id, TaskStatus::Done, None)
    }

    /// Terminal failure; the queue never retries on its own
    pub fn mark_failed(&self, task_id: &str, reason: &str) -> Result<bool> {
        self.finish(task_id, TaskStatus::Failed, Some(reason))
    }

    fn finish(&self, task_id: &str, status: TaskStatus, reason: Option<&str>) -> Result<bool> {
        let finished = self.db.finish_task(task_id, status, reason, Utc::now())?;
        if finished {
            tracing::debug!(task_id, status = status.as_str(), "Task finished");
        } else {
            // Reclaimed by a later drain after this one was presumed dead
            tracing::warn!(
                task_id,
                status = status.as_str(),
                "Task was no longer running; result dropped"
            );
        }
        Ok(finished)
    }

    /// Delete items older than `max_age_hours`, whatever their status.
    ///
    /// Ages past ten years are treated as ten years.
    pub fn cleanup(&self, max_age_hours: u64) -> Result<usize> {
        self.cleanup_at(max_age_hours, Utc::now())
    }

    pub fn cleanup_at(&self, max_age_hours: u64, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - horizon(max_age_hours.saturating_mul(3600));
        let removed = self.db.delete_tasks_older_than(cutoff)?;
        if removed > 0 {
            tracing::info!(removed, max_age_hours, "Task queue cleaned up");
        }
        Ok(removed)
    }

    /// Most recent item sharing `payload`'s dedupe key
    pub fn latest_for(&self, payload: &TaskPayload) -> Result<Option<TaskItem>> {
        self.db.latest_task(&payload.dedupe_key())
    }

    pub fn get(&self, task_id: &str) -> Result<Option<TaskItem>> {
        self.db.get_task(task_id)
    }

    pub fn list(&self, status: Option<TaskStatus>) -> Result<Vec<TaskItem>> {
        self.db.list_tasks(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn queue() -> TaskQueue {
        TaskQueue::new(Arc::new(SeasonDb::open_in_memory().expect("db")))
    }

    fn round_cycle(round: u32) -> TaskPayload {
        TaskPayload::RoundCycle {
            season_id: "season-1".to_string(),
            round,
        }
    }

    #[test]
    fn duplicate_enqueue_is_reported_not_raised() {
        let queue = queue();
        let first = queue.enqueue(round_cycle(1)).expect("enqueue");
        let second = queue.enqueue(round_cycle(1)).expect("duplicate is not an error");

        assert!(first.is_new());
        assert_eq!(
            second,
            EnqueueOutcome::Duplicate {
                existing_id: first.task_id().to_string()
            }
        );
        assert_eq!(queue.list(Some(TaskStatus::Pending)).expect("list").len(), 1);
    }

    #[test]
    fn catch_up_and_round_cycle_do_not_collide() {
        let queue = queue();
        queue.enqueue(round_cycle(2)).expect("round");
        let catch_up = queue
            .enqueue(TaskPayload::CatchUp {
                season_id: "season-1".to_string(),
                round: 2,
                book_id: None,
            })
            .expect("catch up");
        assert!(catch_up.is_new());
    }

    #[test]
    fn claim_runs_oldest_first_then_terminal_transitions() {
        let queue = queue();
        let base = Utc.timestamp_opt(1_700_000_000, 0).single().expect("ts");
        queue
            .enqueue_at(round_cycle(2), base + chrono::Duration::seconds(5))
            .expect("later");
        queue.enqueue_at(round_cycle(1), base).expect("earlier");

        let first = queue.claim_next().expect("claim").expect("item");
        assert_eq!(first.payload, round_cycle(1));
        assert!(queue.mark_done(&first.id).expect("done"));

        let second = queue.claim_next().expect("claim").expect("item");
        queue.mark_failed(&second.id, "boom").expect("failed");
        assert_eq!(queue.claim_next().expect("claim"), None);

        let failed = queue.get(&second.id).expect("get").expect("item");
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(failed.completed_at.is_some());

        // Marking twice is tolerated but reported
        assert!(!queue.mark_done(&first.id).expect("idempotent"));
        assert_eq!(
            queue.get(&first.id).expect("get").expect("item").status,
            TaskStatus::Done
        );
    }

    #[test]
    fn cleanup_removes_old_items_regardless_of_status() {
        let queue = queue();
        let now = Utc.timestamp_opt(1_700_000_000, 0).single().expect("ts");
        queue
            .enqueue_at(round_cycle(1), now - chrono::Duration::hours(50))
            .expect("old");
        queue
            .enqueue_at(round_cycle(2), now - chrono::Duration::hours(1))
            .expect("recent");

        assert_eq!(queue.cleanup_at(24, now).expect("cleanup"), 1);
        let remaining = queue.list(None).expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].payload.round(), 2);
    }

    #[test]
    fn cleanup_with_huge_age_keeps_live_items() {
        let queue = queue();
        let now = Utc.timestamp_opt(1_700_000_000, 0).single().expect("ts");
        queue
            .enqueue_at(round_cycle(1), now - chrono::Duration::hours(1))
            .expect("pending");

        assert_eq!(queue.cleanup_at(u64::MAX, now).expect("cleanup"), 0);
        assert_eq!(
            queue.cleanup_at(10_000_000_000_000_000, now).expect("cleanup"),
            0
        );
        assert_eq!(queue.list(Some(TaskStatus::Pending)).expect("list").len(), 1);
    }

    #[test]
    fn latest_for_tracks_the_newest_attempt() {
        let queue = queue();
        assert_eq!(queue.latest_for(&round_cycle(1)).expect("none"), None);

        let first = queue.enqueue(round_cycle(1)).expect("enqueue");
        let claimed = queue.claim_next().expect("claim").expect("item");
        queue.mark_failed(&claimed.id, "drain crashed").expect("fail");
        let retry = queue.enqueue(round_cycle(1)).expect("re-enqueue");

        assert_ne!(first.task_id(), retry.task_id());
        let latest = queue.latest_for(&round_cycle(1)).expect("latest").expect("item");
        assert_eq!(latest.id, retry.task_id());
        assert_eq!(latest.status, TaskStatus::Pending);
    }
}
