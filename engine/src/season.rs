//! Season and entrant lifecycle operations
//!
//! Status changes outside the phase machine: creating and activating a
//! season, entering it, and owner or administrative exits.

use crate::config::InkConfig;
use crate::db::SeasonDb;
use crate::errors::{EngineError, Result};
use crate::models::{Book, BookStatus, DiscontinueReason, NewSeason, Season, SeasonStatus};
use chrono::Utc;
use std::sync::Arc;

pub struct SeasonManager {
    db: Arc<SeasonDb>,
    ink: InkConfig,
}

impl SeasonManager {
    pub fn new(db: Arc<SeasonDb>, ink: InkConfig) -> Self {
        Self { db, ink }
    }

    fn season(&self, season_id: &str) -> Result<Season> {
        self.db
            .get_season(season_id)?
            .ok_or_else(|| EngineError::not_found("season", season_id))
    }

    fn owned_book(&self, book_id: &str, owner_id: &str) -> Result<Book> {
        let book = self
            .db
            .get_book(book_id)?
            .ok_or_else(|| EngineError::not_found("book", book_id))?;
        if book.owner_id != owner_id {
            return Err(EngineError::invalid_state(format!(
                "book {book_id} is not owned by {owner_id}"
            )));
        }
        Ok(book)
    }

    /// Create a PENDING season
    pub fn create_season(&self, new: NewSeason) -> Result<Season> {
        if new.theme.trim().is_empty() {
            return Err(EngineError::invalid_state("season theme must not be empty"));
        }
        let round = new.round;
        if round.round_duration_minutes == 0 {
            return Err(EngineError::invalid_state("round duration must be positive"));
        }
        if round.min_chapters == 0 || round.min_chapters > round.max_chapters {
            return Err(EngineError::invalid_state(format!(
                "chapter bounds {}..={} are invalid",
                round.min_chapters, round.max_chapters
            )));
        }

        let season = self.db.insert_season(&new, Utc::now())?;
        tracing::info!(
            season_id = %season.id,
            number = season.number,
            max_rounds = round.max_rounds(),
            "Season created"
        );
        Ok(season)
    }

    /// Start a PENDING season at round 1; fails if another season is active
    pub fn activate_season(&self, season_id: &str) -> Result<Season> {
        let season = self.season(season_id)?;
        if !self.db.activate_season(season_id, Utc::now())? {
            return Err(EngineError::invalid_state(format!(
                "season {season_id} is {} and cannot be activated",
                season.status.as_str()
            )));
        }
        tracing::info!(season_id, number = season.number, "Season activated");
        self.season(season_id)
    }

    /// Enter `owner_id` into a season with the starting Ink balance.
    ///
    /// Books entered before activation wait as DRAFT.
    pub fn enter_season(&self, season_id: &str, owner_id: &str, title: &str) -> Result<Book> {
        let season = self.season(season_id)?;
        let status = match season.status {
            SeasonStatus::Pending => BookStatus::Draft,
            SeasonStatus::Active => BookStatus::Active,
            SeasonStatus::Finished | SeasonStatus::Cancelled => {
                return Err(EngineError::invalid_state(format!(
                    "season {season_id} is {} and closed to entries",
                    season.status.as_str()
                )));
            }
        };
        let book = self.db.insert_book(
            season_id,
            owner_id,
            title,
            status,
            self.ink.starting_balance,
            Utc::now(),
        )?;
        tracing::info!(season_id, book_id = %book.id, owner_id, "Entrant joined season");
        Ok(book)
    }

    /// Owner marks an ACTIVE book finished
    pub fn complete_book(&self, book_id: &str, owner_id: &str) -> Result<Book> {
        let book = self.owned_book(book_id, owner_id)?;
        if !self.db.set_book_status(
            book_id,
            &[BookStatus::Active],
            BookStatus::Completed,
            None,
            Utc::now(),
        )? {
            return Err(EngineError::invalid_state(format!(
                "book {book_id} is {} and cannot be completed",
                book.status.as_str()
            )));
        }
        tracing::info!(book_id, owner_id, "Book completed by owner");
        self.owned_book(book_id, owner_id)
    }

    /// Owner walks away; the book is discontinued for good
    pub fn abandon_book(&self, book_id: &str, owner_id: &str) -> Result<Book> {
        let book = self.owned_book(book_id, owner_id)?;
        if !self.db.set_book_status(
            book_id,
            &[BookStatus::Draft, BookStatus::Active],
            BookStatus::Discontinued,
            Some(DiscontinueReason::Abandoned),
            Utc::now(),
        )? {
            return Err(EngineError::invalid_state(format!(
                "book {book_id} is {} and cannot be abandoned",
                book.status.as_str()
            )));
        }
        tracing::info!(book_id, owner_id, "Book abandoned");
        self.owned_book(book_id, owner_id)
    }

    pub fn cancel_season(&self, season_id: &str) -> Result<Season> {
        let season = self.season(season_id)?;
        if !self.db.set_season_status(
            season_id,
            &[SeasonStatus::Pending, SeasonStatus::Active],
            SeasonStatus::Cancelled,
            Utc::now(),
        )? {
            return Err(EngineError::invalid_state(format!(
                "season {season_id} is {} and cannot be cancelled",
                season.status.as_str()
            )));
        }
        tracing::warn!(season_id, "Season cancelled");
        self.season(season_id)
    }

    /// Administrative removal of a season and everything in it
    pub fn delete_season(&self, season_id: &str) -> Result<()> {
        if !self.db.delete_season(season_id)? {
            return Err(EngineError::not_found("season", season_id));
        }
        tracing::warn!(season_id, "Season deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCategory;
    use crate::models::RoundConfig;
    use pretty_assertions::assert_eq;

    fn manager() -> SeasonManager {
        let db = Arc::new(SeasonDb::open_in_memory().expect("db"));
        SeasonManager::new(db, InkConfig::default())
    }

    fn new_season(min: u32, max: u32) -> NewSeason {
        NewSeason {
            theme: "Lost cities".to_string(),
            constraints: "Second person".to_string(),
            round: RoundConfig {
                round_duration_minutes: 1440,
                min_chapters: min,
                max_chapters: max,
            },
        }
    }

    #[test]
    fn create_rejects_inverted_bounds() {
        let err = manager()
            .create_season(new_season(6, 3))
            .expect_err("min above max");
        assert_eq!(err.category(), ErrorCategory::InvalidState);
    }

    #[test]
    fn entries_before_activation_wait_as_draft() {
        let seasons = manager();
        let season = seasons.create_season(new_season(3, 5)).expect("create");
        let early = seasons
            .enter_season(&season.id, "alice", "First Light")
            .expect("enter");
        assert_eq!(early.status, BookStatus::Draft);
        assert_eq!(early.ink_balance, 100);

        let season = seasons.activate_season(&season.id).expect("activate");
        assert_eq!(season.status, SeasonStatus::Active);
        assert_eq!(season.current_round, 1);

        let late = seasons
            .enter_season(&season.id, "bob", "Second Wind")
            .expect("enter");
        assert_eq!(late.status, BookStatus::Active);
    }

    #[test]
    fn activation_is_exclusive() {
        let seasons = manager();
        let first = seasons.create_season(new_season(1, 3)).expect("first");
        let second = seasons.create_season(new_season(1, 3)).expect("second");
        seasons.activate_season(&first.id).expect("activate");

        let err = seasons
            .activate_season(&second.id)
            .expect_err("already one active");
        assert_eq!(err.category(), ErrorCategory::ConcurrencyGuard);

        seasons.cancel_season(&first.id).expect("cancel");
        seasons.activate_season(&second.id).expect("now allowed");
    }

    #[test]
    fn owner_actions_require_ownership() {
        let seasons = manager();
        let season = seasons.create_season(new_season(1, 3)).expect("create");
        seasons.activate_season(&season.id).expect("activate");
        let book = seasons
            .enter_season(&season.id, "alice", "Mine")
            .expect("enter");

        assert!(seasons.complete_book(&book.id, "mallory").is_err());
        let abandoned = seasons.abandon_book(&book.id, "alice").expect("abandon");
        assert_eq!(abandoned.status, BookStatus::Discontinued);
        assert_eq!(
            abandoned.discontinued_reason,
            Some(DiscontinueReason::Abandoned)
        );
        assert!(seasons.complete_book(&book.id, "alice").is_err());
    }

    #[test]
    fn closed_seasons_reject_entries_and_delete_removes_them() {
        let seasons = manager();
        let season = seasons.create_season(new_season(1, 3)).expect("create");
        seasons.cancel_season(&season.id).expect("cancel");
        assert!(seasons.enter_season(&season.id, "alice", "Late").is_err());

        seasons.delete_season(&season.id).expect("delete");
        let err = seasons.delete_season(&season.id).expect_err("gone");
        assert_eq!(err.category(), ErrorCategory::NotFound);
    }
}
