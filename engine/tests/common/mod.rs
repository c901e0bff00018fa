//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use inkwell_engine::{
    Book, Chapter, ChapterDraft, ChapterPlanEntry, Character, ContentGenerator, EngineConfig,
    EngineError, EntrantContext, NewSeason, OutlineDraft, ReaderPersona, ReaderReview, Result,
    RoundConfig, Season, SeasonEngine,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A `write_chapter` call as the generator saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterCall {
    pub title: String,
    pub number: u32,
    pub had_prior: bool,
}

/// Deterministic generator with failure injection keyed by book title
pub struct MockGenerator {
    outline_len: u32,
    chapter_delay: Option<Duration>,
    failing_outlines: Mutex<HashSet<String>>,
    failing_chapters: Mutex<HashSet<String>>,
    pub outline_calls: AtomicU32,
    pub review_calls: AtomicU32,
    pub chapter_calls: Mutex<Vec<ChapterCall>>,
}

impl MockGenerator {
    pub fn new(outline_len: u32) -> Self {
        Self {
            outline_len,
            chapter_delay: None,
            failing_outlines: Mutex::new(HashSet::new()),
            failing_chapters: Mutex::new(HashSet::new()),
            outline_calls: AtomicU32::new(0),
            review_calls: AtomicU32::new(0),
            chapter_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_chapter_delay(mut self, delay: Duration) -> Self {
        self.chapter_delay = Some(delay);
        self
    }

    pub fn fail_outline_for(&self, title: &str) {
        self.failing_outlines
            .lock()
            .expect("lock")
            .insert(title.to_string());
    }

    pub fn fail_chapters_for(&self, title: &str) {
        self.failing_chapters
            .lock()
            .expect("lock")
            .insert(title.to_string());
    }

    /// Chapter numbers requested for `title`, in call order
    pub fn chapter_numbers_for(&self, title: &str) -> Vec<u32> {
        self.chapter_calls
            .lock()
            .expect("lock")
            .iter()
            .filter(|call| call.title == title)
            .map(|call| call.number)
            .collect()
    }
}

pub fn plan(len: u32) -> OutlineDraft {
    OutlineDraft {
        characters: vec![Character {
            name: "Mara".to_string(),
            role: "lighthouse keeper".to_string(),
            description: "Counts ships that never arrive".to_string(),
        }],
        chapters: (1..=len)
            .map(|number| ChapterPlanEntry {
                number,
                title: format!("Part {number}"),
                summary: format!("Events of part {number}"),
                key_events: vec![format!("event {number}")],
                target_words: 1500,
            })
            .collect(),
    }
}

#[async_trait]
impl ContentGenerator for MockGenerator {
    async fn generate_outline(&self, ctx: &EntrantContext) -> Result<OutlineDraft> {
        self.outline_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_outlines
            .lock()
            .expect("lock")
            .contains(&ctx.title)
        {
            return Err(EngineError::transient("outline service unavailable"));
        }
        Ok(plan(self.outline_len))
    }

    async fn write_chapter(
        &self,
        ctx: &EntrantContext,
        number: u32,
        entry: &ChapterPlanEntry,
        prior_text: Option<&str>,
    ) -> Result<ChapterDraft> {
        self.chapter_calls.lock().expect("lock").push(ChapterCall {
            title: ctx.title.clone(),
            number,
            had_prior: prior_text.is_some(),
        });
        if let Some(delay) = self.chapter_delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .failing_chapters
            .lock()
            .expect("lock")
            .contains(&ctx.title)
        {
            return Err(EngineError::transient("chapter service unavailable"));
        }
        Ok(ChapterDraft {
            title: entry.title.clone(),
            content: format!("{} chapter {number}: {}", ctx.title, entry.summary),
        })
    }

    async fn review_chapter(
        &self,
        chapter: &Chapter,
        persona: &ReaderPersona,
    ) -> Result<ReaderReview> {
        self.review_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ReaderReview {
            rating: 7,
            critique: format!("{} on chapter {}", persona.name, chapter.number),
        })
    }
}

/// Fast retries, no trigger spacing
pub fn test_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.generation.max_attempts = 2;
    cfg.generation.initial_backoff_ms = 1;
    cfg.generation.max_backoff_ms = 2;
    cfg.worker.min_trigger_interval_secs = 0;
    cfg
}

pub fn engine_with(cfg: EngineConfig, generator: Arc<MockGenerator>) -> SeasonEngine {
    SeasonEngine::in_memory(cfg, generator).expect("engine")
}

pub fn engine(generator: Arc<MockGenerator>) -> SeasonEngine {
    engine_with(test_config(), generator)
}

/// An ACTIVE season at round 1 with one ACTIVE book per title
pub fn active_season(engine: &SeasonEngine, max_chapters: u32, titles: &[&str]) -> (Season, Vec<Book>) {
    let seasons = engine.seasons();
    let season = seasons
        .create_season(NewSeason {
            theme: "Signals from the sea".to_string(),
            constraints: "Under 2000 words per chapter".to_string(),
            round: RoundConfig {
                round_duration_minutes: 60,
                min_chapters: 1,
                max_chapters,
            },
        })
        .expect("create season");
    let books = titles
        .iter()
        .enumerate()
        .map(|(i, title)| {
            seasons
                .enter_season(&season.id, &format!("owner-{i}"), title)
                .expect("enter season")
        })
        .collect();
    let season = seasons.activate_season(&season.id).expect("activate");
    (season, books)
}

/// Published chapter numbers for a book, ascending
pub fn chapter_numbers(engine: &SeasonEngine, book_id: &str) -> Vec<u32> {
    engine
        .db()
        .chapters_for_book(book_id)
        .expect("chapters")
        .iter()
        .map(|c| c.number)
        .collect()
}

/// Walk the season's phase machine directly until it sits at `target`
pub fn force_round(engine: &SeasonEngine, season_id: &str, target: u32) {
    let db = engine.db();
    let now = chrono::Utc::now();
    loop {
        let season = db
            .get_season(season_id)
            .expect("season lookup")
            .expect("season exists");
        if season.current_round >= target {
            return;
        }
        let round = season.current_round;
        assert!(db.begin_ai_work(season_id, round, now).expect("ai work"));
        assert!(db.begin_reading(season_id, round, now).expect("reading"));
        assert!(db.advance_round(season_id, round, now).expect("advance"));
    }
}
