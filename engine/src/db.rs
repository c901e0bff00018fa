//! Season store
//!
//! SQLite-backed persistence for seasons, books, outlines, chapters, reader
//! comments, Ink transactions, the task queue and the worker lock row.
//!
//! Every method takes the clock reading it should record as `now` and locks
//! the connection only for the duration of its own statements, so no caller
//! ever holds the store across an `.await`.

use crate::config::EngineConfig;
use crate::errors::{EngineError, Result};
use crate::models::{
    Book, BookStatus, Chapter, DiscontinueReason, InkDelta, InkTransaction, NewChapter, NewSeason,
    Outline, OutlineDraft, OutlineVersion, ReaderComment, RoundConfig, RoundPhase, Season,
    SeasonStatus, TaskItem, TaskKind, TaskPayload, TaskStatus, WorkerLockState,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior, params,
};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// Embedded schema SQL from INKWELL_SCHEMA.sql
const SCHEMA_SQL: &str = include_str!("../INKWELL_SCHEMA.sql");

const SEASON_COLUMNS: &str = "id, number, status, theme, constraints, round_duration_minutes, \
     min_chapters, max_chapters, current_round, phase, ai_work_started_at_ms, \
     round_started_at_ms, created_at_ms, updated_at_ms";

const BOOK_COLUMNS: &str = "id, season_id, owner_id, title, status, discontinued_reason, \
     chapter_count, ink_balance, created_at_ms, updated_at_ms";

const CHAPTER_COLUMNS: &str =
    "id, book_id, number, title, content, word_count, published_at_ms";

const TASK_COLUMNS: &str = "id, kind, payload_json, dedupe_key, status, error, created_at_ms, \
     started_at_ms, completed_at_ms";

pub(crate) fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn db_err(context: &'static str) -> impl FnOnce(rusqlite::Error) -> EngineError {
    move |e| EngineError::storage_with_source(context, e)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn parse_col<T>(idx: usize, raw: String, parse: impl Fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unrecognized value {raw:?}").into(),
        )
    })
}

fn json_col<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| EngineError::storage_with_source("failed to encode json column", e))
}

fn opt_ms(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(ms_to_dt))
}

fn season_from_row(row: &Row<'_>) -> rusqlite::Result<Season> {
    Ok(Season {
        id: row.get(0)?,
        number: row.get(1)?,
        status: parse_col(2, row.get(2)?, SeasonStatus::parse)?,
        theme: row.get(3)?,
        constraints: row.get(4)?,
        round: RoundConfig {
            round_duration_minutes: row.get(5)?,
            min_chapters: row.get(6)?,
            max_chapters: row.get(7)?,
        },
        current_round: row.get(8)?,
        phase: parse_col(9, row.get(9)?, RoundPhase::parse)?,
        ai_work_started_at: opt_ms(row, 10)?,
        round_started_at: opt_ms(row, 11)?,
        created_at: ms_to_dt(row.get(12)?),
        updated_at: ms_to_dt(row.get(13)?),
    })
}

fn book_from_row(row: &Row<'_>) -> rusqlite::Result<Book> {
    let reason = row
        .get::<_, Option<String>>(5)?
        .map(|raw| parse_col(5, raw, DiscontinueReason::parse))
        .transpose()?;
    Ok(Book {
        id: row.get(0)?,
        season_id: row.get(1)?,
        owner_id: row.get(2)?,
        title: row.get(3)?,
        status: parse_col(4, row.get(4)?, BookStatus::parse)?,
        discontinued_reason: reason,
        chapter_count: row.get(6)?,
        ink_balance: row.get(7)?,
        created_at: ms_to_dt(row.get(8)?),
        updated_at: ms_to_dt(row.get(9)?),
    })
}

fn chapter_from_row(row: &Row<'_>) -> rusqlite::Result<Chapter> {
    Ok(Chapter {
        id: row.get(0)?,
        book_id: row.get(1)?,
        number: row.get(2)?,
        title: row.get(3)?,
        content: row.get(4)?,
        word_count: row.get(5)?,
        published_at: ms_to_dt(row.get(6)?),
    })
}

fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<ReaderComment> {
    Ok(ReaderComment {
        chapter_id: row.get(0)?,
        chapter_number: row.get(1)?,
        persona: row.get(2)?,
        rating: row.get(3)?,
        critique: row.get(4)?,
        created_at: ms_to_dt(row.get(5)?),
    })
}

/// A task row whose payload has not been decoded yet
struct RawTask {
    id: String,
    kind: String,
    payload_json: String,
    dedupe_key: String,
    status: TaskStatus,
    error: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl RawTask {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            payload_json: row.get(2)?,
            dedupe_key: row.get(3)?,
            status: parse_col(4, row.get(4)?, TaskStatus::parse)?,
            error: row.get(5)?,
            created_at: ms_to_dt(row.get(6)?),
            started_at: opt_ms(row, 7)?,
            completed_at: opt_ms(row, 8)?,
        })
    }

    /// Decode the payload and check it against the stored kind; on failure
    /// returns the task id and the reason
    fn decode(self) -> std::result::Result<TaskItem, (String, String)> {
        let payload = match serde_json::from_str::<TaskPayload>(&self.payload_json) {
            Ok(payload) => payload,
            Err(e) => return Err((self.id, format!("unreadable payload: {e}"))),
        };
        if TaskKind::parse(&self.kind) != Some(payload.kind()) {
            let reason = format!(
                "stored kind {:?} does not match a {} payload",
                self.kind,
                payload.kind().as_str()
            );
            return Err((self.id, reason));
        }
        Ok(TaskItem {
            id: self.id,
            payload,
            dedupe_key: self.dedupe_key,
            status: self.status,
            error: self.error,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }

    fn into_item(self) -> Result<TaskItem> {
        self.decode()
            .map_err(|(id, reason)| EngineError::storage(format!("task {id}: {reason}")))
    }
}

/// Result of inserting a task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskInsert {
    Inserted(TaskItem),
    /// A PENDING or RUNNING item with the same dedupe key already exists
    Duplicate { existing_id: String },
}

/// Result of the worker-lock compare-and-set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquire {
    /// The flag was clear and is now held, stamped `since`
    Acquired { since: DateTime<Utc> },
    /// The flag was held past the stale horizon and has been taken over
    Reclaimed {
        since: DateTime<Utc>,
        stale_since: DateTime<Utc>,
    },
    /// Another drain holds the flag
    Busy { since: Option<DateTime<Utc>> },
}

/// Season store wrapper
pub struct SeasonDb {
    conn: Mutex<Connection>,
}

impl SeasonDb {
    /// Connect to the season database and initialize schema
    ///
    /// Creates the database file if it doesn't exist.
    pub fn connect_and_init(cfg: &EngineConfig) -> Result<Self> {
        let path = cfg.resolved_db_path();
        Self::connect_and_init_at_path(&path)
    }

    /// Connect to a specific database path
    pub fn connect_and_init_at_path(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::storage_with_source(
                    format!("failed to create db directory: {}", parent.display()),
                    e,
                )
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            EngineError::storage_with_source(format!("failed to open db at {}", path.display()), e)
        })?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(db_err("failed to set busy timeout"))?;

        Self::apply_schema(&conn)?;

        tracing::debug!(path = %path.display(), "Season DB initialized");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Connect to an in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(db_err("failed to open in-memory db"))?;

        Self::apply_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn apply_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(db_err("failed to apply schema"))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::storage("season db lock poisoned"))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // seasons
    // ─────────────────────────────────────────────────────────────────────────────

    /// Insert a PENDING season numbered after the highest existing one
    pub fn insert_season(&self, new: &NewSeason, now: DateTime<Utc>) -> Result<Season> {
        let id = Uuid::new_v4().to_string();
        let now_ms = dt_to_ms(now);
        {
            let conn = self.lock()?;
            conn.execute(
                r#"
                INSERT INTO seasons (
                    id, number, status, theme, constraints,
                    round_duration_minutes, min_chapters, max_chapters,
                    current_round, phase, created_at_ms, updated_at_ms
                )
                VALUES (
                    ?1, (SELECT COALESCE(MAX(number), 0) + 1 FROM seasons), 'pending', ?2, ?3,
                    ?4, ?5, ?6,
                    0, 'none', ?7, ?7
                )
                "#,
                params![
                    id,
                    new.theme,
                    new.constraints,
                    new.round.round_duration_minutes,
                    new.round.min_chapters,
                    new.round.max_chapters,
                    now_ms,
                ],
            )
            .map_err(db_err("failed to insert season"))?;
        }
        self.get_season(&id)?
            .ok_or_else(|| EngineError::not_found("season", id))
    }

    pub fn get_season(&self, season_id: &str) -> Result<Option<Season>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {SEASON_COLUMNS} FROM seasons WHERE id = ?1"),
            params![season_id],
            season_from_row,
        )
        .optional()
        .map_err(db_err("failed to get season"))
    }

    /// The single ACTIVE season, if any
    pub fn active_season(&self) -> Result<Option<Season>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {SEASON_COLUMNS} FROM seasons WHERE status = 'active'"),
            [],
            season_from_row,
        )
        .optional()
        .map_err(db_err("failed to get active season"))
    }

    pub fn list_seasons(&self) -> Result<Vec<Season>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {SEASON_COLUMNS} FROM seasons ORDER BY number"))
            .map_err(db_err("failed to prepare season list"))?;
        let rows = stmt
            .query_map([], season_from_row)
            .map_err(db_err("failed to list seasons"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("failed to read season row"))
    }

    /// PENDING -> ACTIVE at round 1, phase NONE; DRAFT books become ACTIVE.
    ///
    /// Returns `false` if the season was not PENDING. Fails with a concurrency
    /// guard error if another season is already ACTIVE.
    pub fn activate_season(&self, season_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let now_ms = dt_to_ms(now);
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin activation"))?;

        let changed = match tx.execute(
            r#"
            UPDATE seasons
            SET status = 'active', current_round = 1, phase = 'none',
                ai_work_started_at_ms = NULL, round_started_at_ms = NULL,
                updated_at_ms = ?1
            WHERE id = ?2 AND status = 'pending'
            "#,
            params![now_ms, season_id],
        ) {
            Ok(n) => n,
            Err(e) if is_constraint_violation(&e) => {
                return Err(EngineError::concurrency(format!(
                    "cannot activate season {season_id}: another season is already active"
                )));
            }
            Err(e) => return Err(EngineError::storage_with_source("failed to activate season", e)),
        };
        if changed == 0 {
            return Ok(false);
        }

        let books = tx
            .execute(
                "UPDATE books SET status = 'active', updated_at_ms = ?1 WHERE season_id = ?2 AND status = 'draft'",
                params![now_ms, season_id],
            )
            .map_err(db_err("failed to activate draft books"))?;

        tx.commit().map_err(db_err("failed to commit activation"))?;
        tracing::debug!(season_id, books, "Season activated");
        Ok(true)
    }

    /// Conditional status change for lifecycle operations
    pub fn set_season_status(
        &self,
        season_id: &str,
        from: &[SeasonStatus],
        to: SeasonStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                &format!(
                    "UPDATE seasons SET status = ?1, updated_at_ms = ?2 WHERE id = ?3 AND status IN ({})",
                    in_list(from.iter().map(SeasonStatus::as_str))
                ),
                params![to.as_str(), dt_to_ms(now), season_id],
            )
            .map_err(db_err("failed to update season status"))?;
        Ok(changed == 1)
    }

    /// NONE -> AI_WORKING for `round`
    pub fn begin_ai_work(&self, season_id: &str, round: u32, now: DateTime<Utc>) -> Result<bool> {
        let now_ms = dt_to_ms(now);
        let conn = self.lock()?;
        let changed = conn
            .execute(
                r#"
                UPDATE seasons
                SET phase = 'ai_working', ai_work_started_at_ms = ?1, updated_at_ms = ?1
                WHERE id = ?2 AND status = 'active' AND phase = 'none' AND current_round = ?3
                "#,
                params![now_ms, season_id, round],
            )
            .map_err(db_err("failed to begin ai work"))?;
        Ok(changed == 1)
    }

    /// AI_WORKING -> HUMAN_READING for `round`
    pub fn begin_reading(&self, season_id: &str, round: u32, now: DateTime<Utc>) -> Result<bool> {
        let now_ms = dt_to_ms(now);
        let conn = self.lock()?;
        let changed = conn
            .execute(
                r#"
                UPDATE seasons
                SET phase = 'human_reading', round_started_at_ms = ?1, updated_at_ms = ?1
                WHERE id = ?2 AND status = 'active' AND phase = 'ai_working' AND current_round = ?3
                "#,
                params![now_ms, season_id, round],
            )
            .map_err(db_err("failed to begin reading"))?;
        Ok(changed == 1)
    }

    /// HUMAN_READING of `round` -> NONE of `round + 1`
    pub fn advance_round(&self, season_id: &str, round: u32, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                r#"
                UPDATE seasons
                SET current_round = current_round + 1, phase = 'none',
                    ai_work_started_at_ms = NULL, round_started_at_ms = NULL,
                    updated_at_ms = ?1
                WHERE id = ?2 AND status = 'active' AND phase = 'human_reading' AND current_round = ?3
                "#,
                params![dt_to_ms(now), season_id, round],
            )
            .map_err(db_err("failed to advance round"))?;
        Ok(changed == 1)
    }

    /// HUMAN_READING of the last round -> FINISHED; ACTIVE books become COMPLETED.
    ///
    /// Returns the number of completed books, or `None` if the season was not
    /// in the expected state.
    pub fn finish_season(
        &self,
        season_id: &str,
        round: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<usize>> {
        let now_ms = dt_to_ms(now);
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin season finalization"))?;

        let changed = tx
            .execute(
                r#"
                UPDATE seasons SET status = 'finished', updated_at_ms = ?1
                WHERE id = ?2 AND status = 'active' AND phase = 'human_reading' AND current_round = ?3
                "#,
                params![now_ms, season_id, round],
            )
            .map_err(db_err("failed to finish season"))?;
        if changed == 0 {
            return Ok(None);
        }

        let completed = tx
            .execute(
                "UPDATE books SET status = 'completed', updated_at_ms = ?1 WHERE season_id = ?2 AND status = 'active'",
                params![now_ms, season_id],
            )
            .map_err(db_err("failed to complete books"))?;

        tx.commit()
            .map_err(db_err("failed to commit season finalization"))?;
        Ok(Some(completed))
    }

    /// Administrative deletion; cascades to every dependent row
    pub fn delete_season(&self, season_id: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin season deletion"))?;
        let pattern = format!("%:{season_id}:%");
        tx.execute(
            "DELETE FROM task_queue WHERE dedupe_key LIKE ?1",
            params![pattern],
        )
        .map_err(db_err("failed to delete season tasks"))?;
        let deleted = tx
            .execute("DELETE FROM seasons WHERE id = ?1", params![season_id])
            .map_err(db_err("failed to delete season"))?;
        tx.commit().map_err(db_err("failed to commit season deletion"))?;
        Ok(deleted == 1)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // books
    // ─────────────────────────────────────────────────────────────────────────────

    /// Insert a book with its starting balance recorded as the first Ink delta.
    ///
    /// An owner may enter a season once; a second entry is an invalid state.
    pub fn insert_book(
        &self,
        season_id: &str,
        owner_id: &str,
        title: &str,
        status: BookStatus,
        starting_balance: i64,
        now: DateTime<Utc>,
    ) -> Result<Book> {
        let id = Uuid::new_v4().to_string();
        let now_ms = dt_to_ms(now);
        {
            let mut conn = self.lock()?;
            let tx = conn
                .transaction()
                .map_err(db_err("failed to begin book insert"))?;
            match tx.execute(
                r#"
                INSERT INTO books (id, season_id, owner_id, title, status, chapter_count,
                                   ink_balance, created_at_ms, updated_at_ms)
                VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6, ?6)
                "#,
                params![id, season_id, owner_id, title, status.as_str(), now_ms],
            ) {
                Ok(_) => {}
                Err(e) if is_constraint_violation(&e) => {
                    return Err(EngineError::invalid_state(format!(
                        "owner {owner_id} has already entered season {season_id}"
                    )));
                }
                Err(e) => return Err(EngineError::storage_with_source("failed to insert book", e)),
            }
            apply_deltas(
                &tx,
                &id,
                &[InkDelta {
                    amount: starting_balance,
                    reason: "starting_balance",
                }],
                now_ms,
            )?;
            tx.commit().map_err(db_err("failed to commit book insert"))?;
        }
        self.get_book(&id)?
            .ok_or_else(|| EngineError::not_found("book", id))
    }

    pub fn get_book(&self, book_id: &str) -> Result<Option<Book>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {BOOK_COLUMNS} FROM books WHERE id = ?1"),
            params![book_id],
            book_from_row,
        )
        .optional()
        .map_err(db_err("failed to get book"))
    }

    /// Books of a season in entry order, optionally restricted to `statuses`
    pub fn books_in_season(&self, season_id: &str, statuses: &[BookStatus]) -> Result<Vec<Book>> {
        let conn = self.lock()?;
        let sql = if statuses.is_empty() {
            format!(
                "SELECT {BOOK_COLUMNS} FROM books WHERE season_id = ?1 ORDER BY created_at_ms, rowid"
            )
        } else {
            format!(
                "SELECT {BOOK_COLUMNS} FROM books WHERE season_id = ?1 AND status IN ({}) ORDER BY created_at_ms, rowid",
                in_list(statuses.iter().map(BookStatus::as_str))
            )
        };
        let mut stmt = conn
            .prepare(&sql)
            .map_err(db_err("failed to prepare book list"))?;
        let rows = stmt
            .query_map(params![season_id], book_from_row)
            .map_err(db_err("failed to list books"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("failed to read book row"))
    }

    /// Conditional book status change; clears the discontinue reason unless
    /// the new status is DISCONTINUED
    pub fn set_book_status(
        &self,
        book_id: &str,
        from: &[BookStatus],
        to: BookStatus,
        reason: Option<DiscontinueReason>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let reason = match to {
            BookStatus::Discontinued => reason.map(|r| r.as_str()),
            _ => None,
        };
        let conn = self.lock()?;
        let changed = conn
            .execute(
                &format!(
                    "UPDATE books SET status = ?1, discontinued_reason = ?2, updated_at_ms = ?3 WHERE id = ?4 AND status IN ({})",
                    in_list(from.iter().map(BookStatus::as_str))
                ),
                params![to.as_str(), reason, dt_to_ms(now), book_id],
            )
            .map_err(db_err("failed to update book status"))?;
        Ok(changed == 1)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // ink
    // ─────────────────────────────────────────────────────────────────────────────

    /// Apply signed deltas atomically; returns the committed balance
    pub fn apply_ink(&self, book_id: &str, deltas: &[InkDelta], now: DateTime<Utc>) -> Result<i64> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin ink update"))?;
        let balance = apply_deltas(&tx, book_id, deltas, dt_to_ms(now))?;
        tx.commit().map_err(db_err("failed to commit ink update"))?;
        match balance {
            Some(balance) => Ok(balance),
            None => {
                drop(conn);
                self.ink_balance(book_id)
            }
        }
    }

    pub fn ink_balance(&self, book_id: &str) -> Result<i64> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT ink_balance FROM books WHERE id = ?1",
            params![book_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err("failed to read ink balance"))?
        .ok_or_else(|| EngineError::not_found("book", book_id))
    }

    pub fn ink_transactions(&self, book_id: &str) -> Result<Vec<InkTransaction>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT book_id, delta, reason, created_at_ms FROM ink_transactions WHERE book_id = ?1 ORDER BY id",
            )
            .map_err(db_err("failed to prepare ink history"))?;
        let rows = stmt
            .query_map(params![book_id], |row| {
                Ok(InkTransaction {
                    book_id: row.get(0)?,
                    delta: row.get(1)?,
                    reason: row.get(2)?,
                    created_at: ms_to_dt(row.get(3)?),
                })
            })
            .map_err(db_err("failed to read ink history"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("failed to read ink transaction row"))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // outlines
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn get_outline(&self, book_id: &str) -> Result<Option<Outline>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT book_id, characters_json, plan_json, version, updated_at_ms FROM outlines WHERE book_id = ?1",
            params![book_id],
            |row| {
                let characters: String = row.get(1)?;
                let plan: String = row.get(2)?;
                Ok(Outline {
                    book_id: row.get(0)?,
                    characters: json_col(1, &characters)?,
                    chapters: json_col(2, &plan)?,
                    version: row.get(3)?,
                    updated_at: ms_to_dt(row.get(4)?),
                })
            },
        )
        .optional()
        .map_err(db_err("failed to get outline"))
    }

    /// Persist a first outline and apply `charges` in the same transaction.
    ///
    /// Returns `false` (and charges nothing) if the book already has one.
    pub fn insert_outline(
        &self,
        book_id: &str,
        draft: &OutlineDraft,
        charges: &[InkDelta],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let characters = to_json(&draft.characters)?;
        let plan = to_json(&draft.chapters)?;
        let now_ms = dt_to_ms(now);

        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin outline insert"))?;
        let inserted = tx
            .execute(
                r#"
                INSERT OR IGNORE INTO outlines (book_id, characters_json, plan_json, version, updated_at_ms)
                VALUES (?1, ?2, ?3, 1, ?4)
                "#,
                params![book_id, characters, plan, now_ms],
            )
            .map_err(db_err("failed to insert outline"))?;
        if inserted == 0 {
            return Ok(false);
        }
        apply_deltas(&tx, book_id, charges, now_ms)?;
        tx.commit().map_err(db_err("failed to commit outline insert"))?;
        Ok(true)
    }

    /// Replace an existing outline, bump its version and record the snapshot.
    ///
    /// Returns the new version number.
    pub fn replace_outline(
        &self,
        book_id: &str,
        draft: &OutlineDraft,
        round: u32,
        reason: &str,
        charges: &[InkDelta],
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let characters = to_json(&draft.characters)?;
        let plan = to_json(&draft.chapters)?;
        let now_ms = dt_to_ms(now);

        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin outline revision"))?;
        let version: Option<u32> = tx
            .query_row(
                r#"
                UPDATE outlines
                SET characters_json = ?1, plan_json = ?2, version = version + 1, updated_at_ms = ?3
                WHERE book_id = ?4
                RETURNING version
                "#,
                params![characters, plan, now_ms, book_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("failed to revise outline"))?;
        let Some(version) = version else {
            return Err(EngineError::not_found("outline", book_id));
        };
        tx.execute(
            r#"
            INSERT INTO outline_versions (book_id, version, round, reason, plan_json, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![book_id, version, round, reason, plan, now_ms],
        )
        .map_err(db_err("failed to record outline version"))?;
        apply_deltas(&tx, book_id, charges, now_ms)?;
        tx.commit().map_err(db_err("failed to commit outline revision"))?;
        Ok(version)
    }

    pub fn outline_versions(&self, book_id: &str) -> Result<Vec<OutlineVersion>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT book_id, version, round, reason, plan_json, created_at_ms
                FROM outline_versions WHERE book_id = ?1 ORDER BY version
                "#,
            )
            .map_err(db_err("failed to prepare outline history"))?;
        let rows = stmt
            .query_map(params![book_id], |row| {
                let plan: String = row.get(4)?;
                Ok(OutlineVersion {
                    book_id: row.get(0)?,
                    version: row.get(1)?,
                    round: row.get(2)?,
                    reason: row.get(3)?,
                    chapters: json_col(4, &plan)?,
                    created_at: ms_to_dt(row.get(5)?),
                })
            })
            .map_err(db_err("failed to read outline history"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("failed to read outline version row"))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // chapters
    // ─────────────────────────────────────────────────────────────────────────────

    /// Publish a chapter, increment the chapter count and apply `charges` in
    /// one transaction.
    ///
    /// Returns `None` without touching anything if the number is already taken.
    pub fn publish_chapter(
        &self,
        chapter: &NewChapter,
        charges: &[InkDelta],
        now: DateTime<Utc>,
    ) -> Result<Option<Chapter>> {
        let id = Uuid::new_v4().to_string();
        let now_ms = dt_to_ms(now);
        let word_count = chapter.word_count();

        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin chapter publish"))?;
        let inserted = tx
            .execute(
                r#"
                INSERT OR IGNORE INTO chapters (id, book_id, number, title, content, word_count,
                                                status, published_at_ms)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'published', ?7)
                "#,
                params![
                    id,
                    chapter.book_id,
                    chapter.number,
                    chapter.title,
                    chapter.content,
                    word_count,
                    now_ms,
                ],
            )
            .map_err(db_err("failed to insert chapter"))?;
        if inserted == 0 {
            return Ok(None);
        }

        let bumped = tx
            .execute(
                "UPDATE books SET chapter_count = chapter_count + 1, updated_at_ms = ?1 WHERE id = ?2",
                params![now_ms, chapter.book_id],
            )
            .map_err(db_err("failed to increment chapter count"))?;
        if bumped == 0 {
            return Err(EngineError::not_found("book", chapter.book_id.clone()));
        }
        apply_deltas(&tx, &chapter.book_id, charges, now_ms)?;
        tx.commit().map_err(db_err("failed to commit chapter publish"))?;

        Ok(Some(Chapter {
            id,
            book_id: chapter.book_id.clone(),
            number: chapter.number,
            title: chapter.title.clone(),
            content: chapter.content.clone(),
            word_count,
            published_at: ms_to_dt(now_ms),
        }))
    }

    pub fn get_chapter(&self, chapter_id: &str) -> Result<Option<Chapter>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {CHAPTER_COLUMNS} FROM chapters WHERE id = ?1"),
            params![chapter_id],
            chapter_from_row,
        )
        .optional()
        .map_err(db_err("failed to get chapter"))
    }

    pub fn chapter_by_number(&self, book_id: &str, number: u32) -> Result<Option<Chapter>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {CHAPTER_COLUMNS} FROM chapters WHERE book_id = ?1 AND number = ?2"),
            params![book_id, number],
            chapter_from_row,
        )
        .optional()
        .map_err(db_err("failed to get chapter by number"))
    }

    pub fn chapters_for_book(&self, book_id: &str) -> Result<Vec<Chapter>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CHAPTER_COLUMNS} FROM chapters WHERE book_id = ?1 ORDER BY number"
            ))
            .map_err(db_err("failed to prepare chapter list"))?;
        let rows = stmt
            .query_map(params![book_id], chapter_from_row)
            .map_err(db_err("failed to list chapters"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("failed to read chapter row"))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // reader comments
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn insert_comments(&self, comments: &[ReaderComment]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin comment insert"))?;
        for comment in comments {
            tx.execute(
                r#"
                INSERT INTO reader_comments (chapter_id, persona, rating, critique, created_at_ms)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    comment.chapter_id,
                    comment.persona,
                    comment.rating,
                    comment.critique,
                    dt_to_ms(comment.created_at),
                ],
            )
            .map_err(db_err("failed to insert reader comment"))?;
        }
        tx.commit().map_err(db_err("failed to commit reader comments"))?;
        Ok(comments.len())
    }

    pub fn comments_for_chapter(&self, chapter_id: &str) -> Result<Vec<ReaderComment>> {
        self.query_comments("c.chapter_id = ?1", chapter_id)
    }

    /// Every comment on a book, in chapter order
    pub fn comments_for_book(&self, book_id: &str) -> Result<Vec<ReaderComment>> {
        self.query_comments("ch.book_id = ?1", book_id)
    }

    fn query_comments(&self, filter: &str, key: &str) -> Result<Vec<ReaderComment>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                r#"
                SELECT c.chapter_id, ch.number, c.persona, c.rating, c.critique, c.created_at_ms
                FROM reader_comments c
                JOIN chapters ch ON ch.id = c.chapter_id
                WHERE {filter}
                ORDER BY ch.number, c.id
                "#
            ))
            .map_err(db_err("failed to prepare comment query"))?;
        let rows = stmt
            .query_map(params![key], comment_from_row)
            .map_err(db_err("failed to query comments"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("failed to read comment row"))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // task_queue
    // ─────────────────────────────────────────────────────────────────────────────

    /// Insert a PENDING task unless a live one shares its dedupe key
    pub fn insert_task(&self, payload: &TaskPayload, now: DateTime<Utc>) -> Result<TaskInsert> {
        let id = Uuid::new_v4().to_string();
        let dedupe_key = payload.dedupe_key();
        let payload_json = to_json(payload)?;
        let now_ms = dt_to_ms(now);

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("failed to begin enqueue"))?;
        match tx.execute(
            r#"
            INSERT INTO task_queue (id, kind, payload_json, dedupe_key, status, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, 'pending', ?5)
            "#,
            params![id, payload.kind().as_str(), payload_json, dedupe_key, now_ms],
        ) {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                let existing_id: String = tx
                    .query_row(
                        "SELECT id FROM task_queue WHERE dedupe_key = ?1 AND status IN ('pending', 'running')",
                        params![dedupe_key],
                        |row| row.get(0),
                    )
                    .map_err(db_err("failed to look up live task"))?;
                return Ok(TaskInsert::Duplicate { existing_id });
            }
            Err(e) => return Err(EngineError::storage_with_source("failed to insert task", e)),
        }
        tx.commit().map_err(db_err("failed to commit enqueue"))?;

        Ok(TaskInsert::Inserted(TaskItem {
            id,
            payload: payload.clone(),
            dedupe_key,
            status: TaskStatus::Pending,
            error: None,
            created_at: ms_to_dt(now_ms),
            started_at: None,
            completed_at: None,
        }))
    }

    /// Atomically move the oldest PENDING task to RUNNING.
    ///
    /// A claimed task whose payload cannot be decoded is failed on the spot
    /// and the next one is claimed instead.
    pub fn claim_next_task(&self, now: DateTime<Utc>) -> Result<Option<TaskItem>> {
        let now_ms = dt_to_ms(now);
        loop {
            let raw = {
                let conn = self.lock()?;
                conn.query_row(
                    &format!(
                        r#"
                        UPDATE task_queue
                        SET status = 'running', started_at_ms = ?1
                        WHERE id = (
                            SELECT id FROM task_queue
                            WHERE status = 'pending'
                            ORDER BY created_at_ms, rowid
                            LIMIT 1
                        ) AND status = 'pending'
                        RETURNING {TASK_COLUMNS}
                        "#
                    ),
                    params![now_ms],
                    RawTask::from_row,
                )
                .optional()
                .map_err(db_err("failed to claim task"))?
            };
            let Some(raw) = raw else {
                return Ok(None);
            };
            match raw.decode() {
                Ok(item) => return Ok(Some(item)),
                Err((id, reason)) => {
                    tracing::warn!(task_id = %id, %reason, "Claimed task cannot be decoded");
                    self.finish_task(&id, TaskStatus::Failed, Some(&reason), now)?;
                }
            }
        }
    }

    /// RUNNING -> DONE/FAILED; returns `false` if the task was not RUNNING
    pub fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(EngineError::invalid_state(format!(
                "task {task_id} cannot finish as {}",
                status.as_str()
            )));
        }
        let conn = self.lock()?;
        let changed = conn
            .execute(
                r#"
                UPDATE task_queue SET status = ?1, error = ?2, completed_at_ms = ?3
                WHERE id = ?4 AND status = 'running'
                "#,
                params![status.as_str(), error, dt_to_ms(now), task_id],
            )
            .map_err(db_err("failed to finish task"))?;
        Ok(changed == 1)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskItem>> {
        let raw = {
            let conn = self.lock()?;
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM task_queue WHERE id = ?1"),
                params![task_id],
                RawTask::from_row,
            )
            .optional()
            .map_err(db_err("failed to get task"))?
        };
        raw.map(RawTask::into_item).transpose()
    }

    /// Most recently created task for a dedupe key, whatever its status
    pub fn latest_task(&self, dedupe_key: &str) -> Result<Option<TaskItem>> {
        let raw = {
            let conn = self.lock()?;
            conn.query_row(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM task_queue WHERE dedupe_key = ?1 ORDER BY created_at_ms DESC, rowid DESC LIMIT 1"
                ),
                params![dedupe_key],
                RawTask::from_row,
            )
            .optional()
            .map_err(db_err("failed to get latest task"))?
        };
        raw.map(RawTask::into_item).transpose()
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<TaskItem>> {
        let raws = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM task_queue WHERE ?1 IS NULL OR status = ?1 ORDER BY created_at_ms, rowid"
                ))
                .map_err(db_err("failed to prepare task list"))?;
            let rows = stmt
                .query_map(params![status.map(|s| s.as_str())], RawTask::from_row)
                .map_err(db_err("failed to list tasks"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err("failed to read task row"))?
        };
        raws.into_iter().map(RawTask::into_item).collect()
    }

    /// Delete tasks created before `cutoff`, whatever their status
    pub fn delete_tasks_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM task_queue WHERE created_at_ms < ?1",
            params![dt_to_ms(cutoff)],
        )
        .map_err(db_err("failed to delete old tasks"))
    }

    /// Fail every RUNNING task; used when a crashed drain is reclaimed
    pub fn fail_running_tasks(&self, reason: &str, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            UPDATE task_queue SET status = 'failed', error = ?1, completed_at_ms = ?2
            WHERE status = 'running'
            "#,
            params![reason, dt_to_ms(now)],
        )
        .map_err(db_err("failed to fail orphaned tasks"))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // worker_lock
    // ─────────────────────────────────────────────────────────────────────────────

    /// Compare-and-set the drain flag.
    ///
    /// A flag stamped before `stale_before` is taken over.
    pub fn try_acquire_worker_lock(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<LockAcquire> {
        let now_ms = dt_to_ms(now);
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("failed to begin lock acquisition"))?;

        let (was_locked, previous_since): (bool, Option<i64>) = tx
            .query_row(
                "SELECT locked, since_ms FROM worker_lock WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(db_err("failed to read worker lock"))?;

        let changed = tx
            .execute(
                r#"
                UPDATE worker_lock SET locked = 1, since_ms = ?1
                WHERE id = 1 AND (locked = 0 OR since_ms IS NULL OR since_ms < ?2)
                "#,
                params![now_ms, dt_to_ms(stale_before)],
            )
            .map_err(db_err("failed to acquire worker lock"))?;
        tx.commit().map_err(db_err("failed to commit lock acquisition"))?;

        let since = ms_to_dt(now_ms);
        Ok(match (changed, was_locked) {
            (0, _) => LockAcquire::Busy {
                since: previous_since.map(ms_to_dt),
            },
            (_, true) => LockAcquire::Reclaimed {
                since,
                stale_since: previous_since.map(ms_to_dt).unwrap_or_default(),
            },
            (_, false) => LockAcquire::Acquired { since },
        })
    }

    /// Clear the drain flag if it still carries the holder's stamp
    pub fn release_worker_lock(&self, since: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE worker_lock SET locked = 0, since_ms = NULL WHERE id = 1 AND locked = 1 AND since_ms = ?1",
                params![dt_to_ms(since)],
            )
            .map_err(db_err("failed to release worker lock"))?;
        Ok(changed == 1)
    }

    /// Whether the drain flag is still set with the holder's stamp
    pub fn holds_worker_lock(&self, since: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT locked = 1 AND since_ms = ?1 FROM worker_lock WHERE id = 1",
            params![dt_to_ms(since)],
            |row| row.get::<_, Option<bool>>(0),
        )
        .map(|held| held.unwrap_or(false))
        .map_err(db_err("failed to read worker lock"))
    }

    /// Record a trigger unless the previous one was less than `min_interval` ago
    pub fn gate_trigger(&self, now: DateTime<Utc>, min_interval: chrono::Duration) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                r#"
                UPDATE worker_lock SET last_trigger_ms = ?1
                WHERE id = 1 AND (last_trigger_ms IS NULL OR last_trigger_ms <= ?2)
                "#,
                params![dt_to_ms(now), dt_to_ms(now - min_interval)],
            )
            .map_err(db_err("failed to gate trigger"))?;
        Ok(changed == 1)
    }

    pub fn worker_lock_state(&self) -> Result<WorkerLockState> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT locked, since_ms, last_trigger_ms FROM worker_lock WHERE id = 1",
            [],
            |row| {
                Ok(WorkerLockState {
                    locked: row.get(0)?,
                    since: opt_ms(row, 1)?,
                    last_trigger: opt_ms(row, 2)?,
                })
            },
        )
        .map_err(db_err("failed to read worker lock"))
    }
}

/// `'a', 'b'` list of status literals for an `IN (...)` clause
fn in_list<'a>(values: impl Iterator<Item = &'a str>) -> String {
    values
        .map(|v| format!("'{v}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Apply deltas inside an open transaction; returns the last balance written
fn apply_deltas(
    tx: &Transaction<'_>,
    book_id: &str,
    deltas: &[InkDelta],
    now_ms: i64,
) -> Result<Option<i64>> {
    let mut balance = None;
    for delta in deltas {
        let updated: Option<i64> = tx
            .query_row(
                r#"
                UPDATE books SET ink_balance = ink_balance + ?1, updated_at_ms = ?2
                WHERE id = ?3
                RETURNING ink_balance
                "#,
                params![delta.amount, now_ms, book_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("failed to apply ink delta"))?;
        let Some(updated) = updated else {
            return Err(EngineError::not_found("book", book_id));
        };
        tx.execute(
            "INSERT INTO ink_transactions (book_id, delta, reason, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
            params![book_id, delta.amount, delta.reason, now_ms],
        )
        .map_err(db_err("failed to record ink transaction"))?;
        balance = Some(updated);
    }
    Ok(balance)
}
