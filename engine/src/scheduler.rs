//! Season phase scheduler
//!
//! Drives the active season through
//! `NONE -> AI_WORKING -> HUMAN_READING -> (next round's AI_WORKING | FINISHED)`.
//! Every phase write is conditional on the phase and round the decision was
//! made from, so overlapping triggers cannot advance a season twice.
//! Partially met preconditions are a no-op.

use crate::config::SchedulerConfig;
use crate::db::SeasonDb;
use crate::errors::{EngineError, Result};
use crate::models::{RoundPhase, Season, TaskPayload, TaskStatus};
use crate::queue::{EnqueueOutcome, TaskQueue};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// What a scheduler check did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    NoActiveSeason,
    /// Preconditions for the next transition are not met yet
    Waiting {
        season_id: String,
        round: u32,
        phase: RoundPhase,
    },
    /// AI work began for `round` and its round-cycle task was enqueued
    RoundStarted {
        season_id: String,
        round: u32,
        task: EnqueueOutcome,
    },
    /// AI work ended, by task completion or by the fail-safe timeout
    ReadingStarted {
        season_id: String,
        round: u32,
        timed_out: bool,
    },
    SeasonFinished {
        season_id: String,
        completed_books: usize,
    },
    /// The check failed; logged, never raised
    Failed { reason: String },
}

/// Reading time owed once AI work ends: what is left of the round, but never
/// less than `floor`
pub fn reading_window(round_duration: Duration, ai_elapsed: Duration, floor: Duration) -> Duration {
    (round_duration - ai_elapsed).max(floor)
}

pub struct PhaseScheduler {
    db: Arc<SeasonDb>,
    queue: TaskQueue,
    cfg: SchedulerConfig,
}

impl PhaseScheduler {
    pub fn new(db: Arc<SeasonDb>, queue: TaskQueue, cfg: SchedulerConfig) -> Self {
        Self { db, queue, cfg }
    }

    pub fn check_and_advance(&self) -> AdvanceOutcome {
        self.check_and_advance_at(Utc::now())
    }

    /// Idempotent; safe to call at any frequency
    pub fn check_and_advance_at(&self, now: DateTime<Utc>) -> AdvanceOutcome {
        match self.advance(now) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(
                    category = err.category().as_str(),
                    error = %err,
                    "Season check failed"
                );
                AdvanceOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }

    fn advance(&self, now: DateTime<Utc>) -> Result<AdvanceOutcome> {
        let Some(season) = self.db.active_season()? else {
            tracing::trace!("No active season");
            return Ok(AdvanceOutcome::NoActiveSeason);
        };
        match season.phase {
            RoundPhase::None => self.start_round(&season, now),
            RoundPhase::AiWorking => self.check_ai_work(&season, now),
            RoundPhase::HumanReading => self.check_reading(&season, now),
        }
    }

    fn waiting(season: &Season) -> AdvanceOutcome {
        AdvanceOutcome::Waiting {
            season_id: season.id.clone(),
            round: season.current_round,
            phase: season.phase,
        }
    }

    fn round_cycle(season: &Season) -> TaskPayload {
        TaskPayload::RoundCycle {
            season_id: season.id.clone(),
            round: season.current_round,
        }
    }

    fn start_round(&self, season: &Season, now: DateTime<Utc>) -> Result<AdvanceOutcome> {
        let round = season.current_round;
        if round == 0 || round > season.round.max_rounds() {
            return Err(EngineError::invalid_state(format!(
                "season {} is at round {round} of {}",
                season.id,
                season.round.max_rounds()
            )));
        }
        if !self.db.begin_ai_work(&season.id, round, now)? {
            tracing::debug!(season_id = %season.id, round, "Round already started elsewhere");
            return Ok(Self::waiting(season));
        }

        let task = self.queue.enqueue_at(Self::round_cycle(season), now)?;
        tracing::info!(season_id = %season.id, round, "AI work started");
        Ok(AdvanceOutcome::RoundStarted {
            season_id: season.id.clone(),
            round,
            task,
        })
    }

    fn check_ai_work(&self, season: &Season, now: DateTime<Utc>) -> Result<AdvanceOutcome> {
        let round = season.current_round;
        let payload = Self::round_cycle(season);
        let latest = self.queue.latest_for(&payload)?;
        let done = latest
            .as_ref()
            .is_some_and(|task| task.status == TaskStatus::Done);

        let started = season.ai_work_started_at.unwrap_or(season.updated_at);
        let timed_out = !done && now - started >= self.cfg.max_ai_work();

        if done || timed_out {
            if !self.db.begin_reading(&season.id, round, now)? {
                return Ok(Self::waiting(season));
            }
            if timed_out {
                tracing::warn!(
                    season_id = %season.id,
                    round,
                    max_ai_work_minutes = self.cfg.max_ai_work_minutes,
                    "AI work timed out; reading window opened early"
                );
                if self.cfg.catch_up_on_timeout {
                    self.queue.enqueue_at(
                        TaskPayload::CatchUp {
                            season_id: season.id.clone(),
                            round,
                            book_id: None,
                        },
                        now,
                    )?;
                }
            } else {
                tracing::info!(season_id = %season.id, round, "AI work complete; reading window open");
            }
            return Ok(AdvanceOutcome::ReadingStarted {
                season_id: season.id.clone(),
                round,
                timed_out,
            });
        }

        // No live task: lost between the phase flip and the enqueue, or its
        // drain failed. Queue another attempt.
        let needs_task = latest
            .as_ref()
            .is_none_or(|task| task.status == TaskStatus::Failed);
        if needs_task {
            tracing::warn!(season_id = %season.id, round, "Round cycle task missing; re-enqueueing");
            self.queue.enqueue_at(payload, now)?;
        }
        Ok(Self::waiting(season))
    }

    fn check_reading(&self, season: &Season, now: DateTime<Utc>) -> Result<AdvanceOutcome> {
        let round = season.current_round;
        let reading_started = season.round_started_at.unwrap_or(season.updated_at);
        let ai_elapsed = season
            .ai_work_started_at
            .map(|ai| reading_started - ai)
            .unwrap_or_default();
        let window = reading_window(
            season.round.round_duration(),
            ai_elapsed,
            self.cfg.min_reading(),
        );
        if now - reading_started < window {
            return Ok(Self::waiting(season));
        }

        if round + 1 > season.round.max_rounds() {
            let Some(completed_books) = self.db.finish_season(&season.id, round, now)? else {
                return Ok(Self::waiting(season));
            };
            tracing::info!(season_id = %season.id, round, completed_books, "Season finished");
            return Ok(AdvanceOutcome::SeasonFinished {
                season_id: season.id.clone(),
                completed_books,
            });
        }

        if !self.db.advance_round(&season.id, round, now)? {
            return Ok(Self::waiting(season));
        }
        tracing::info!(season_id = %season.id, round = round + 1, "Round advanced");

        let next = self
            .db
            .get_season(&season.id)?
            .ok_or_else(|| EngineError::not_found("season", season.id.clone()))?;
        self.start_round(&next, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reading_window_keeps_the_rest_of_the_round() {
        let window = reading_window(
            Duration::minutes(180),
            Duration::minutes(30),
            Duration::minutes(60),
        );
        assert_eq!(window, Duration::minutes(150));
    }

    #[test]
    fn reading_window_is_floored_when_ai_work_runs_long() {
        let window = reading_window(
            Duration::minutes(120),
            Duration::minutes(110),
            Duration::minutes(60),
        );
        assert_eq!(window, Duration::minutes(60));

        let overrun = reading_window(
            Duration::minutes(60),
            Duration::minutes(200),
            Duration::minutes(15),
        );
        assert_eq!(overrun, Duration::minutes(15));
    }
}
