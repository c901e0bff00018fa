//! Operator commands
//!
//! - `inkwell tick` - one scheduler check followed by one worker drain
//! - `inkwell serve` - the same, periodically, until ctrl-c
//! - `inkwell catch-up` - backfill one book or a whole season
//! - `inkwell season ...` - season and entrant lifecycle

use crate::http_generator::HttpContentGenerator;
use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use inkwell_engine::{
    AdvanceOutcome, CatchUpRequest, EngineConfig, EntrantReport, NewSeason, RoundConfig,
    SeasonEngine, TaskStatus, TriggerOutcome,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Inkwell season engine operator CLI
#[derive(Debug, Parser)]
#[command(name = "inkwell", version)]
pub struct Cli {
    /// Config file (default: $INKWELL_CONFIG, then ~/.config/inkwell/inkwell.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one scheduler check, then drain the task queue once
    Tick,

    /// Run one scheduler check only
    Schedule,

    /// Drain the task queue once
    Work,

    /// Tick periodically until interrupted
    Serve(ServeArgs),

    /// Backfill missing chapters
    CatchUp(CatchUpArgs),

    /// Delete queue items older than the configured horizon
    Cleanup,

    /// Credit Ink to a book, reactivating it if that resolves a bankruptcy
    Grant(GrantArgs),

    /// Show queue items
    Tasks(TasksArgs),

    /// Season and entrant lifecycle
    #[command(subcommand)]
    Season(SeasonCommand),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Seconds between ticks
    #[arg(long, default_value_t = 60)]
    pub interval_secs: u64,
}

#[derive(Debug, Args)]
pub struct CatchUpArgs {
    /// Book to bring up to its outline
    #[arg(
        long,
        value_name = "BOOK_ID",
        required_unless_present = "season",
        conflicts_with = "season"
    )]
    pub book: Option<String>,

    /// Season whose lagging entrants should reach the current round
    #[arg(long, value_name = "SEASON_ID")]
    pub season: Option<String>,

    /// Only queue the book's catch-up; the worker runs it later
    #[arg(long, requires = "book")]
    pub queue: bool,
}

#[derive(Debug, Args)]
pub struct GrantArgs {
    #[arg(long, value_name = "BOOK_ID")]
    pub book: String,

    #[arg(long)]
    pub amount: i64,
}

#[derive(Debug, Args)]
pub struct TasksArgs {
    /// pending, running, done or failed
    #[arg(long)]
    pub status: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum SeasonCommand {
    /// Create a PENDING season
    Create(CreateSeasonArgs),

    /// Start a PENDING season at round 1
    Activate { season_id: String },

    /// Enter an owner into a season
    Enter(EnterArgs),

    /// Cancel a PENDING or ACTIVE season
    Cancel { season_id: String },

    /// List all seasons
    List,
}

#[derive(Debug, Args)]
pub struct CreateSeasonArgs {
    #[arg(long)]
    pub theme: String,

    #[arg(long, default_value = "")]
    pub constraints: String,

    #[arg(long, default_value_t = 1440)]
    pub round_minutes: u32,

    #[arg(long, default_value_t = 3)]
    pub min_chapters: u32,

    #[arg(long, default_value_t = 10)]
    pub max_chapters: u32,
}

#[derive(Debug, Args)]
pub struct EnterArgs {
    pub season_id: String,

    #[arg(long)]
    pub owner: String,

    #[arg(long)]
    pub title: String,
}

impl Cli {
    pub fn load_config(&self) -> anyhow::Result<EngineConfig> {
        let cfg = match &self.config {
            Some(path) => EngineConfig::load_from_path(path)?,
            None => EngineConfig::load()?,
        };
        Ok(cfg)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let cfg = self.load_config()?;
        let generator = HttpContentGenerator::new(&cfg.content_service)?;
        let engine = SeasonEngine::with_config(cfg, Arc::new(generator))
            .context("failed to open season engine")?;

        match self.command {
            Command::Tick => {
                let (advance, trigger) = engine.tick().await;
                print_advance(&advance);
                print_trigger(&trigger);
            }
            Command::Schedule => print_advance(&engine.scheduler().check_and_advance()),
            Command::Work => print_trigger(&engine.worker().trigger_once().await),
            Command::Serve(args) => serve(&engine, args).await?,
            Command::CatchUp(args) => catch_up(&engine, args).await?,
            Command::Cleanup => {
                let removed = engine.cleanup_queue()?;
                println!("removed {removed} queue item(s)");
            }
            Command::Grant(args) => {
                let outcome = engine.ledger().grant(&args.book, args.amount)?;
                println!(
                    "book {}: balance {}{}",
                    args.book,
                    outcome.balance,
                    if outcome.reactivated { " (reactivated)" } else { "" }
                );
            }
            Command::Tasks(args) => list_tasks(&engine, args)?,
            Command::Season(cmd) => season(&engine, cmd)?,
        }
        Ok(())
    }
}

async fn serve(engine: &SeasonEngine, args: ServeArgs) -> anyhow::Result<()> {
    if args.interval_secs == 0 {
        bail!("--interval-secs must be positive");
    }
    let cleanup_every = Duration::from_secs(3600);
    let mut last_cleanup = Instant::now();
    let mut interval = tokio::time::interval(Duration::from_secs(args.interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tracing::info!(interval_secs = args.interval_secs, "Inkwell service running");
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res.context("failed to listen for ctrl-c")?;
                tracing::info!("Shutdown requested");
                break;
            }
            _ = interval.tick() => {
                // A tick in progress always runs to completion
                let (advance, trigger) = engine.tick().await;
                tracing::debug!(?advance, ?trigger, "Tick complete");

                if last_cleanup.elapsed() >= cleanup_every {
                    match engine.cleanup_queue() {
                        Ok(removed) => tracing::info!(removed, "Queue cleanup"),
                        Err(e) => tracing::warn!(error = %e, "Queue cleanup failed"),
                    }
                    last_cleanup = Instant::now();
                }
            }
        }
    }
    Ok(())
}

async fn catch_up(engine: &SeasonEngine, args: CatchUpArgs) -> anyhow::Result<()> {
    match (args.book, args.season) {
        (Some(book_id), _) if args.queue => match engine.reconciler().request_catch_up(&book_id)? {
            CatchUpRequest::Queued { task_id } => println!("queued catch-up task {task_id}"),
            CatchUpRequest::AlreadyQueued { task_id } => {
                println!("catch-up already queued as task {task_id}")
            }
        },
        (Some(book_id), _) => {
            let book = engine
                .db()
                .get_book(&book_id)?
                .with_context(|| format!("book {book_id} not found"))?;
            let season = engine
                .db()
                .get_season(&book.season_id)?
                .with_context(|| format!("season {} not found", book.season_id))?;
            let report = engine
                .reconciler()
                .catch_up_single_book(&book_id, season.current_round)
                .await?;
            print_entrant(&report);
        }
        (None, Some(season_id)) => {
            let season = engine
                .db()
                .get_season(&season_id)?
                .with_context(|| format!("season {season_id} not found"))?;
            let report = engine
                .reconciler()
                .catch_up_books(&season_id, season.current_round)
                .await?;
            println!(
                "season {season_id}: {} lagging entrant(s), {} failed",
                report.entrants.len(),
                report.failed()
            );
            report.entrants.iter().for_each(print_entrant);
        }
        (None, None) => bail!("one of --book or --season is required"),
    }
    Ok(())
}

fn season(engine: &SeasonEngine, cmd: SeasonCommand) -> anyhow::Result<()> {
    let seasons = engine.seasons();
    match cmd {
        SeasonCommand::Create(args) => {
            let season = seasons.create_season(NewSeason {
                theme: args.theme,
                constraints: args.constraints,
                round: RoundConfig {
                    round_duration_minutes: args.round_minutes,
                    min_chapters: args.min_chapters,
                    max_chapters: args.max_chapters,
                },
            })?;
            println!("created season #{} ({})", season.number, season.id);
        }
        SeasonCommand::Activate { season_id } => {
            let season = seasons.activate_season(&season_id)?;
            println!("season #{} is active at round {}", season.number, season.current_round);
        }
        SeasonCommand::Enter(args) => {
            let book = seasons.enter_season(&args.season_id, &args.owner, &args.title)?;
            println!(
                "entered book {} ({}) with {} Ink",
                book.id,
                book.status.as_str(),
                book.ink_balance
            );
        }
        SeasonCommand::Cancel { season_id } => {
            seasons.cancel_season(&season_id)?;
            println!("season {season_id} cancelled");
        }
        SeasonCommand::List => {
            for season in engine.db().list_seasons()? {
                println!(
                    "#{:<4} {:<10} round {:>2}/{:<2} {:<13} {}  {}",
                    season.number,
                    season.status.as_str(),
                    season.current_round,
                    season.round.max_rounds(),
                    season.phase.as_str(),
                    season.id,
                    season.theme
                );
            }
        }
    }
    Ok(())
}

fn list_tasks(engine: &SeasonEngine, args: TasksArgs) -> anyhow::Result<()> {
    let status = args
        .status
        .as_deref()
        .map(|s| TaskStatus::parse(s).with_context(|| format!("unknown task status {s}")))
        .transpose()?;
    for task in engine.queue().list(status)? {
        println!(
            "{} {:<8} {:<9} {}{}",
            task.created_at.format("%Y-%m-%d %H:%M:%S"),
            task.status.as_str(),
            task.kind().as_str(),
            task.dedupe_key,
            task.error.map(|e| format!("  ({e})")).unwrap_or_default()
        );
    }
    Ok(())
}

fn print_advance(outcome: &AdvanceOutcome) {
    match outcome {
        AdvanceOutcome::NoActiveSeason => println!("scheduler: no active season"),
        AdvanceOutcome::Waiting { round, phase, .. } => {
            println!("scheduler: round {round} still in {phase}")
        }
        AdvanceOutcome::RoundStarted { round, task, .. } => {
            println!("scheduler: round {round} started (task {})", task.task_id())
        }
        AdvanceOutcome::ReadingStarted {
            round, timed_out, ..
        } => println!(
            "scheduler: round {round} reading window open{}",
            if *timed_out { " after AI work timed out" } else { "" }
        ),
        AdvanceOutcome::SeasonFinished {
            season_id,
            completed_books,
        } => println!("scheduler: season {season_id} finished, {completed_books} book(s) completed"),
        AdvanceOutcome::Failed { reason } => println!("scheduler: check failed: {reason}"),
    }
}

fn print_trigger(outcome: &TriggerOutcome) {
    match outcome {
        TriggerOutcome::Throttled => println!("worker: throttled"),
        TriggerOutcome::Busy { since } => match since {
            Some(since) => println!("worker: busy since {since}"),
            None => println!("worker: busy"),
        },
        TriggerOutcome::Drained(summary) => {
            let mut line = format!(
                "worker: processed {} task(s), {} succeeded, {} failed",
                summary.processed, summary.succeeded, summary.failed
            );
            if summary.reclaimed_stale {
                line.push_str(&format!(
                    ", reclaimed stale lock ({} orphan(s) failed)",
                    summary.orphans_failed
                ));
            }
            if summary.lost > 0 {
                line.push_str(&format!(", {} result(s) dropped", summary.lost));
            }
            if summary.taken_over {
                line.push_str(", stopped after the lock was taken over");
            }
            println!("{line}");
        }
        TriggerOutcome::Failed { reason } => println!("worker: failed: {reason}"),
    }
}

fn print_entrant(report: &EntrantReport) {
    let chapters = report
        .chapters_written
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    match &report.error {
        None => println!("book {}: wrote [{chapters}]", report.book_id),
        Some(failure) => println!(
            "book {}: wrote [{chapters}], stopped: {} ({})",
            report.book_id,
            failure.message,
            failure.category.as_str()
        ),
    }
}
