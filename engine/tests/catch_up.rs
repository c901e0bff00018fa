//! Catch-up reconciliation

mod common;

use common::{MockGenerator, active_season, chapter_numbers, engine, force_round};
use inkwell_engine::{CatchUpRequest, ErrorCategory, TaskPayload, TaskStatus, TriggerOutcome};
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[tokio::test]
async fn lagging_entrant_is_backfilled_in_order() {
    let generator = Arc::new(MockGenerator::new(5));
    let engine = engine(generator.clone());
    let (season, books) = active_season(&engine, 5, &["Driftwood", "Current"]);
    force_round(&engine, &season.id, 2);
    engine
        .pipeline()
        .run_round_cycle(&season.id, 2)
        .await
        .expect("round 2");

    // Driftwood falls behind while the season moves on
    let driftwood = books.iter().find(|b| b.title == "Driftwood").expect("book");
    let current = books.iter().find(|b| b.title == "Current").expect("book");
    engine
        .pipeline()
        .write_chapters(&current.id, 3..=5)
        .await;
    force_round(&engine, &season.id, 5);

    let report = engine
        .reconciler()
        .catch_up_books(&season.id, 5)
        .await
        .expect("catch up");
    assert_eq!(report.failed(), 0);
    // Only the lagging entrant is visited
    assert_eq!(report.entrants.len(), 1);
    assert_eq!(report.entrants[0].book_id, driftwood.id);
    assert_eq!(report.entrants[0].chapters_written, vec![3, 4, 5]);

    assert_eq!(generator.chapter_numbers_for("Driftwood"), vec![1, 2, 3, 4, 5]);
    assert_eq!(chapter_numbers(&engine, &driftwood.id), vec![1, 2, 3, 4, 5]);

    let again = engine
        .reconciler()
        .catch_up_books(&season.id, 5)
        .await
        .expect("second pass");
    assert!(again.entrants.is_empty());
}

#[tokio::test]
async fn season_pass_generates_missing_outline_and_stops_at_the_round() {
    let generator = Arc::new(MockGenerator::new(4));
    let engine = engine(generator.clone());
    let (season, books) = active_season(&engine, 4, &["Late Start"]);
    force_round(&engine, &season.id, 2);

    let report = engine
        .reconciler()
        .catch_up_books(&season.id, 2)
        .await
        .expect("catch up");
    assert!(report.entrants[0].outline_generated);
    assert_eq!(report.entrants[0].chapters_written, vec![1, 2]);
    assert_eq!(chapter_numbers(&engine, &books[0].id), vec![1, 2]);
}

#[tokio::test]
async fn failed_outline_skips_only_that_entrant() {
    let generator = Arc::new(MockGenerator::new(2));
    generator.fail_outline_for("Fogbound");
    let engine = engine(generator.clone());
    let (season, books) = active_season(&engine, 2, &["Fogbound", "Steady"]);
    force_round(&engine, &season.id, 2);
    let fogbound = books.iter().find(|b| b.title == "Fogbound").expect("book");
    let steady = books.iter().find(|b| b.title == "Steady").expect("book");

    let report = engine
        .reconciler()
        .catch_up_books(&season.id, 2)
        .await
        .expect("a failed entrant does not fail the pass");
    assert_eq!(report.entrants.len(), 2);
    assert_eq!(report.failed(), 1);

    let skipped = report
        .entrants
        .iter()
        .find(|e| e.book_id == fogbound.id)
        .expect("fogbound visited");
    assert!(!skipped.outline_generated);
    assert!(skipped.chapters_written.is_empty());
    let failure = skipped.error.as_ref().expect("failure recorded");
    assert_eq!(failure.category, ErrorCategory::ContentGeneration);

    let caught_up = report
        .entrants
        .iter()
        .find(|e| e.book_id == steady.id)
        .expect("steady visited");
    assert!(caught_up.is_ok());
    assert_eq!(caught_up.chapters_written, vec![1, 2]);

    assert!(generator.chapter_numbers_for("Fogbound").is_empty());
    assert_eq!(chapter_numbers(&engine, &fogbound.id), Vec::<u32>::new());
    assert_eq!(chapter_numbers(&engine, &steady.id), vec![1, 2]);
    assert_eq!(engine.ledger().balance(&fogbound.id).expect("balance"), 100);
}

#[tokio::test]
async fn single_book_follows_its_outline_but_never_past_it() {
    let generator = Arc::new(MockGenerator::new(5));
    let engine = engine(generator.clone());
    let (season, books) = active_season(&engine, 5, &["Long Plan"]);
    let book = &books[0];

    let report = engine
        .reconciler()
        .catch_up_single_book(&book.id, season.current_round)
        .await
        .expect("catch up");
    assert!(report.is_ok());
    assert_eq!(report.chapters_written, vec![1, 2, 3, 4, 5]);

    let written = chapter_numbers(&engine, &book.id);
    assert_eq!(written.last().copied(), Some(5));
    assert!(written.iter().all(|n| *n <= 5));
}

#[tokio::test]
async fn single_book_past_its_outline_reports_plan_missing() {
    let generator = Arc::new(MockGenerator::new(3));
    let engine = engine(generator.clone());
    let (season, books) = active_season(&engine, 5, &["Short Plan"]);
    let book = &books[0];
    force_round(&engine, &season.id, 5);

    let report = engine
        .reconciler()
        .catch_up_single_book(&book.id, 5)
        .await
        .expect("catch up");
    assert_eq!(report.chapters_written, vec![1, 2, 3]);
    let failure = report.error.expect("stopped at chapter 4");
    assert_eq!(failure.category, ErrorCategory::PlanMissing);
    assert_eq!(generator.chapter_numbers_for("Short Plan"), vec![1, 2, 3]);
}

#[tokio::test]
async fn catch_up_request_is_queued_once_and_runs_on_the_worker() {
    let generator = Arc::new(MockGenerator::new(3));
    let engine = engine(generator.clone());
    let (season, books) = active_season(&engine, 3, &["Requested"]);
    let book = &books[0];
    force_round(&engine, &season.id, 2);

    let first = engine
        .reconciler()
        .request_catch_up(&book.id)
        .expect("request");
    let CatchUpRequest::Queued { task_id } = first else {
        panic!("expected a new task, got {first:?}");
    };
    let second = engine
        .reconciler()
        .request_catch_up(&book.id)
        .expect("request");
    assert_eq!(second, CatchUpRequest::AlreadyQueued { task_id: task_id.clone() });

    let task = engine.queue().get(&task_id).expect("get").expect("exists");
    assert_eq!(
        task.payload,
        TaskPayload::CatchUp {
            season_id: season.id.clone(),
            round: 2,
            book_id: Some(book.id.clone()),
        }
    );

    let TriggerOutcome::Drained(summary) = engine.worker().trigger_once().await else {
        panic!("expected a drain");
    };
    assert_eq!(summary.succeeded, 1);
    let task = engine.queue().get(&task_id).expect("get").expect("exists");
    assert_eq!(task.status, TaskStatus::Done);
    // Single-book catch-up follows the whole 3-chapter outline
    assert_eq!(chapter_numbers(&engine, &book.id), vec![1, 2, 3]);
}

#[tokio::test]
async fn inactive_books_cannot_be_caught_up() {
    let generator = Arc::new(MockGenerator::new(3));
    let engine = engine(generator);
    let (_season, books) = active_season(&engine, 3, &["Quitter"]);
    let book = &books[0];
    engine
        .seasons()
        .abandon_book(&book.id, &book.owner_id)
        .expect("abandon");

    let err = engine
        .reconciler()
        .catch_up_single_book(&book.id, 1)
        .await
        .expect_err("abandoned");
    assert_eq!(err.category(), ErrorCategory::InvalidState);
    assert!(engine.reconciler().request_catch_up(&book.id).is_err());
}
