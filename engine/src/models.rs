//! Persisted entity types
//!
//! Rows as the engine reads them from [`crate::db::SeasonDb`]. Status enums
//! round-trip through their lowercase `as_str()` form in SQLite.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Season lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeasonStatus {
    Pending,
    Active,
    Finished,
    Cancelled,
}

impl SeasonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from string representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "finished" => Some(Self::Finished),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Phase of the current round
///
/// Transitions only ever follow `None -> AiWorking -> HumanReading`, then the
/// next round's `AiWorking` (via `None`) or the end of the season.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    None,
    AiWorking,
    HumanReading,
}

impl RoundPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::AiWorking => "ai_working",
            Self::HumanReading => "human_reading",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "ai_working" => Some(Self::AiWorking),
            "human_reading" => Some(Self::HumanReading),
            _ => None,
        }
    }
}

impl std::fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Round configuration fixed at season creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundConfig {
    /// Length of one round (AI work + reading window)
    pub round_duration_minutes: u32,
    pub min_chapters: u32,
    /// Also the last round of the season
    pub max_chapters: u32,
}

impl RoundConfig {
    pub fn round_duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.round_duration_minutes))
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_chapters
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Season {
    pub id: String,
    pub number: u32,
    pub status: SeasonStatus,
    pub theme: String,
    pub constraints: String,
    pub round: RoundConfig,
    pub current_round: u32,
    pub phase: RoundPhase,
    pub ai_work_started_at: Option<DateTime<Utc>>,
    pub round_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a season
#[derive(Debug, Clone)]
pub struct NewSeason {
    pub theme: String,
    pub constraints: String,
    pub round: RoundConfig,
}

/// Entrant lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookStatus {
    Draft,
    Active,
    Completed,
    Discontinued,
}

impl BookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Discontinued => "discontinued",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "discontinued" => Some(Self::Discontinued),
            _ => None,
        }
    }
}

/// Why a book was discontinued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscontinueReason {
    /// Ink fell below the threshold; reversible by a grant
    Bankrupt,
    /// Owner walked away; final
    Abandoned,
}

impl DiscontinueReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bankrupt => "bankrupt",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bankrupt" => Some(Self::Bankrupt),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

/// An entrant: one user's book in one season
#[derive(Debug, Clone, PartialEq)]
pub struct Book {
    pub id: String,
    pub season_id: String,
    pub owner_id: String,
    pub title: String,
    pub status: BookStatus,
    pub discontinued_reason: Option<DiscontinueReason>,
    pub chapter_count: u32,
    pub ink_balance: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Character {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub description: String,
}

/// One element of an outline's ordered chapter plan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChapterPlanEntry {
    /// 1-based
    pub number: u32,
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub key_events: Vec<String>,
    #[serde(default)]
    pub target_words: u32,
}

/// Outline content as produced by a generator, before it is persisted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutlineDraft {
    #[serde(default)]
    pub characters: Vec<Character>,
    pub chapters: Vec<ChapterPlanEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outline {
    pub book_id: String,
    pub characters: Vec<Character>,
    pub chapters: Vec<ChapterPlanEntry>,
    /// 1 for the initial outline, bumped on every recorded revision
    pub version: u32,
    pub updated_at: DateTime<Utc>,
}

impl Outline {
    /// Plan entry for a 1-based chapter number
    pub fn entry(&self, number: u32) -> Option<&ChapterPlanEntry> {
        self.chapters.iter().find(|c| c.number == number)
    }

    pub fn chapter_len(&self) -> u32 {
        self.chapters.len() as u32
    }
}

/// Immutable snapshot recorded whenever a chapter plan changes after creation
#[derive(Debug, Clone, PartialEq)]
pub struct OutlineVersion {
    pub book_id: String,
    pub version: u32,
    pub round: u32,
    pub reason: String,
    pub chapters: Vec<ChapterPlanEntry>,
    pub created_at: DateTime<Utc>,
}

/// A published chapter
#[derive(Debug, Clone, PartialEq)]
pub struct Chapter {
    pub id: String,
    pub book_id: String,
    pub number: u32,
    pub title: String,
    pub content: String,
    pub word_count: u32,
    pub published_at: DateTime<Utc>,
}

/// Input for publishing a chapter
#[derive(Debug, Clone)]
pub struct NewChapter {
    pub book_id: String,
    pub number: u32,
    pub title: String,
    pub content: String,
}

impl NewChapter {
    pub fn word_count(&self) -> u32 {
        self.content.split_whitespace().count() as u32
    }
}

/// A simulated reader's review of a chapter
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderComment {
    pub chapter_id: String,
    pub chapter_number: u32,
    pub persona: String,
    /// 1..=10
    pub rating: u8,
    pub critique: String,
    pub created_at: DateTime<Utc>,
}

/// A signed, named change to an entrant's Ink balance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InkDelta {
    pub amount: i64,
    pub reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InkTransaction {
    pub book_id: String,
    pub delta: i64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Task queue item type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    RoundCycle,
    CatchUp,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundCycle => "round_cycle",
            Self::CatchUp => "catch_up",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "round_cycle" => Some(Self::RoundCycle),
            "catch_up" => Some(Self::CatchUp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Work carried by a queue item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Run one full round's generation for every entrant
    RoundCycle { season_id: String, round: u32 },
    /// Backfill lagging entrants; one book when `book_id` is set, else the season
    CatchUp {
        season_id: String,
        round: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        book_id: Option<String>,
    },
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::RoundCycle { .. } => TaskKind::RoundCycle,
            Self::CatchUp { .. } => TaskKind::CatchUp,
        }
    }

    pub fn season_id(&self) -> &str {
        match self {
            Self::RoundCycle { season_id, .. } | Self::CatchUp { season_id, .. } => season_id,
        }
    }

    pub fn round(&self) -> u32 {
        match self {
            Self::RoundCycle { round, .. } | Self::CatchUp { round, .. } => *round,
        }
    }

    /// At most one PENDING or RUNNING item may exist per key.
    pub fn dedupe_key(&self) -> String {
        match self {
            Self::RoundCycle { season_id, round } => format!("round_cycle:{season_id}:{round}"),
            Self::CatchUp {
                season_id,
                round,
                book_id,
            } => format!(
                "catch_up:{season_id}:{round}:{}",
                book_id.as_deref().unwrap_or("*")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskItem {
    pub id: String,
    pub payload: TaskPayload,
    pub dedupe_key: String,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskItem {
    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }
}

/// Snapshot of the process-wide drain flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerLockState {
    pub locked: bool,
    pub since: Option<DateTime<Utc>>,
    pub last_trigger: Option<DateTime<Utc>>,
}
