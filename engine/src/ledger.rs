//! Ink ledger
//!
//! Every balance change is a named, signed delta applied by the store in a
//! single `ink_balance = ink_balance + ?` statement. Bankruptcy decisions
//! always re-read the committed balance.

use crate::config::InkConfig;
use crate::db::SeasonDb;
use crate::errors::{EngineError, Result};
use crate::models::{Book, BookStatus, DiscontinueReason, InkDelta, SeasonStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// A named Ink movement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InkEntry {
    /// Cost of a persisted outline
    Outline,
    /// Cost of a published chapter
    ChapterPublish,
    /// Cost of the reader agents reviewing a published chapter
    ReaderAgents,
    /// Reward for a chapter whose mean rating reached the acclaim bar
    ReaderAcclaim,
    /// Administrative top-up
    Grant(i64),
}

impl InkEntry {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Outline => "outline",
            Self::ChapterPublish => "chapter_publish",
            Self::ReaderAgents => "reader_agents",
            Self::ReaderAcclaim => "reader_acclaim",
            Self::Grant(_) => "grant",
        }
    }

    /// Signed amount under `cfg`; costs are negative
    pub fn amount(&self, cfg: &InkConfig) -> i64 {
        match self {
            Self::Outline => -cfg.outline_cost,
            Self::ChapterPublish => -cfg.chapter_publish_cost,
            Self::ReaderAgents => -cfg.reader_agent_cost,
            Self::ReaderAcclaim => cfg.acclaim_reward,
            Self::Grant(amount) => *amount,
        }
    }
}

/// Result of an administrative grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantOutcome {
    pub balance: i64,
    /// A bankrupt book was brought back into the season
    pub reactivated: bool,
}

#[derive(Clone)]
pub struct InkLedger {
    db: Arc<SeasonDb>,
    cfg: InkConfig,
}

impl InkLedger {
    pub fn new(db: Arc<SeasonDb>, cfg: InkConfig) -> Self {
        Self { db, cfg }
    }

    pub fn config(&self) -> &InkConfig {
        &self.cfg
    }

    /// Deltas for `entries`, dropping zero amounts
    pub fn deltas(&self, entries: &[InkEntry]) -> Vec<InkDelta> {
        entries
            .iter()
            .map(|entry| InkDelta {
                amount: entry.amount(&self.cfg),
                reason: entry.reason(),
            })
            .filter(|delta| delta.amount != 0)
            .collect()
    }

    /// Charges for one published chapter
    pub fn chapter_charges(&self) -> Vec<InkDelta> {
        self.deltas(&[InkEntry::ChapterPublish, InkEntry::ReaderAgents])
    }

    pub fn outline_charges(&self) -> Vec<InkDelta> {
        self.deltas(&[InkEntry::Outline])
    }

    /// Apply entries atomically and return the committed balance
    pub fn apply(&self, book_id: &str, entries: &[InkEntry]) -> Result<i64> {
        self.db.apply_ink(book_id, &self.deltas(entries), Utc::now())
    }

    pub fn balance(&self, book_id: &str) -> Result<i64> {
        self.db.ink_balance(book_id)
    }

    /// Strictly below the threshold
    pub fn is_bankrupt(&self, balance: i64) -> bool {
        balance < self.cfg.bankruptcy_threshold
    }

    /// Fail with [`EngineError::Bankruptcy`] if the committed balance is below
    /// the threshold, discontinuing the book first.
    ///
    /// Returns the balance otherwise.
    pub fn ensure_solvent(&self, book_id: &str) -> Result<i64> {
        let balance = self.db.ink_balance(book_id)?;
        if !self.is_bankrupt(balance) {
            return Ok(balance);
        }

        let discontinued = self.db.set_book_status(
            book_id,
            &[BookStatus::Draft, BookStatus::Active],
            BookStatus::Discontinued,
            Some(DiscontinueReason::Bankrupt),
            Utc::now(),
        )?;
        if discontinued {
            tracing::warn!(
                book_id,
                balance,
                threshold = self.cfg.bankruptcy_threshold,
                "Book is bankrupt and has been discontinued"
            );
        }

        Err(EngineError::Bankruptcy {
            book_id: book_id.to_string(),
            balance,
            threshold: self.cfg.bankruptcy_threshold,
        })
    }

    /// Credit `amount` and, if that resolves a bankruptcy while the season is
    /// still running, put the book back into play.
    pub fn grant(&self, book_id: &str, amount: i64) -> Result<GrantOutcome> {
        self.grant_at(book_id, amount, Utc::now())
    }

    pub fn grant_at(&self, book_id: &str, amount: i64, now: DateTime<Utc>) -> Result<GrantOutcome> {
        if amount <= 0 {
            return Err(EngineError::invalid_state(format!(
                "grant amount must be positive, got {amount}"
            )));
        }
        let book = self
            .db
            .get_book(book_id)?
            .ok_or_else(|| EngineError::not_found("book", book_id))?;

        let balance = self
            .db
            .apply_ink(book_id, &self.deltas(&[InkEntry::Grant(amount)]), now)?;

        let reactivated = if self.awaits_resolution(&book) && !self.is_bankrupt(balance) {
            let season_active = self
                .db
                .get_season(&book.season_id)?
                .is_some_and(|s| s.status == SeasonStatus::Active);
            season_active
                && self.db.set_book_status(
                    book_id,
                    &[BookStatus::Discontinued],
                    BookStatus::Active,
                    None,
                    now,
                )?
        } else {
            false
        };

        tracing::info!(book_id, amount, balance, reactivated, "Ink granted");
        Ok(GrantOutcome {
            balance,
            reactivated,
        })
    }

    fn awaits_resolution(&self, book: &Book) -> bool {
        book.status == BookStatus::Discontinued
            && book.discontinued_reason == Some(DiscontinueReason::Bankrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCategory;
    use crate::models::{NewSeason, RoundConfig};
    use pretty_assertions::assert_eq;

    fn setup(starting_balance: i64) -> (Arc<SeasonDb>, InkLedger, Book) {
        let db = Arc::new(SeasonDb::open_in_memory().expect("db"));
        let season = db
            .insert_season(
                &NewSeason {
                    theme: "Tides".to_string(),
                    constraints: String::new(),
                    round: RoundConfig {
                        round_duration_minutes: 60,
                        min_chapters: 1,
                        max_chapters: 3,
                    },
                },
                Utc::now(),
            )
            .expect("season");
        db.activate_season(&season.id, Utc::now()).expect("activate");
        let book = db
            .insert_book(
                &season.id,
                "owner",
                "Driftwood",
                BookStatus::Active,
                starting_balance,
                Utc::now(),
            )
            .expect("book");
        let ledger = InkLedger::new(db.clone(), InkConfig::default());
        (db, ledger, book)
    }

    #[test]
    fn chapter_charges_cover_publish_and_readers() {
        let (_, ledger, _) = setup(100);
        let total: i64 = ledger.chapter_charges().iter().map(|d| d.amount).sum();
        assert_eq!(total, -7);
        // Zero acclaim reward is not recorded as a movement
        assert!(ledger.deltas(&[InkEntry::ReaderAcclaim]).is_empty());
    }

    #[test]
    fn ensure_solvent_discontinues_bankrupt_books() {
        let (db, ledger, book) = setup(-1);
        let err = ledger.ensure_solvent(&book.id).expect_err("bankrupt");
        assert_eq!(err.category(), ErrorCategory::Bankruptcy);

        let book = db.get_book(&book.id).expect("get").expect("book");
        assert_eq!(book.status, BookStatus::Discontinued);
        assert_eq!(book.discontinued_reason, Some(DiscontinueReason::Bankrupt));
    }

    #[test]
    fn balance_at_threshold_is_solvent() {
        let (_, ledger, book) = setup(0);
        assert_eq!(ledger.ensure_solvent(&book.id).expect("solvent"), 0);
    }

    #[test]
    fn grant_reactivates_bankrupt_book() {
        let (db, ledger, book) = setup(-4);
        ledger.ensure_solvent(&book.id).expect_err("bankrupt");

        let partial = ledger.grant(&book.id, 2).expect("grant");
        assert_eq!(
            partial,
            GrantOutcome {
                balance: -2,
                reactivated: false
            }
        );

        let full = ledger.grant(&book.id, 10).expect("grant");
        assert_eq!(
            full,
            GrantOutcome {
                balance: 8,
                reactivated: true
            }
        );
        let book = db.get_book(&book.id).expect("get").expect("book");
        assert_eq!(book.status, BookStatus::Active);
        assert_eq!(book.discontinued_reason, None);
    }

    #[test]
    fn grant_does_not_revive_abandoned_books() {
        let (db, ledger, book) = setup(10);
        db.set_book_status(
            &book.id,
            &[BookStatus::Active],
            BookStatus::Discontinued,
            Some(DiscontinueReason::Abandoned),
            Utc::now(),
        )
        .expect("abandon");

        let outcome = ledger.grant(&book.id, 5).expect("grant");
        assert!(!outcome.reactivated);
        assert!(ledger.grant(&book.id, 0).is_err());
    }
}
