//! Round-cycle behavior through the queue and worker

mod common;

use common::{MockGenerator, active_season, chapter_numbers, engine, force_round, plan};
use inkwell_engine::models::{DiscontinueReason, InkDelta};
use inkwell_engine::{
    BookStatus, ChapterOutcome, ErrorCategory, TaskPayload, TaskStatus, TriggerOutcome,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn fresh_entrant_catches_up_to_the_round_in_one_cycle() {
    let generator = Arc::new(MockGenerator::new(5));
    let engine = engine(generator.clone());
    let (season, books) = active_season(&engine, 5, &["Tidewater"]);
    let book = &books[0];
    force_round(&engine, &season.id, 3);

    engine
        .queue()
        .enqueue(TaskPayload::RoundCycle {
            season_id: season.id.clone(),
            round: 3,
        })
        .expect("enqueue");
    let TriggerOutcome::Drained(summary) = engine.worker().trigger_once().await else {
        panic!("expected a drain");
    };
    assert_eq!((summary.processed, summary.succeeded), (1, 1));

    assert_eq!(chapter_numbers(&engine, &book.id), vec![1, 2, 3]);
    let calls = generator.chapter_calls.lock().expect("lock").clone();
    let order: Vec<(u32, bool)> = calls.iter().map(|c| (c.number, c.had_prior)).collect();
    assert_eq!(order, vec![(1, false), (2, true), (3, true)]);

    // Plan entries past the round stay as generated
    let outline = engine
        .db()
        .get_outline(&book.id)
        .expect("outline")
        .expect("present");
    assert_eq!(outline.version, 1);
    assert_eq!(outline.chapters, plan(5).chapters);

    let refreshed = engine.db().get_book(&book.id).expect("book").expect("exists");
    assert_eq!(refreshed.chapter_count, 3);
    // 100 start, 10 outline, 3 x (5 publish + 2 reader agents)
    assert_eq!(refreshed.ink_balance, 69);
    assert_eq!(generator.review_calls.load(Ordering::SeqCst), 9);
    assert_eq!(
        engine.db().comments_for_book(&book.id).expect("comments").len(),
        9
    );
}

#[tokio::test]
async fn repeated_cycles_write_and_charge_nothing_new() {
    let generator = Arc::new(MockGenerator::new(4));
    let engine = engine(generator.clone());
    let (season, books) = active_season(&engine, 4, &["Saltmarsh"]);
    let book = &books[0];
    force_round(&engine, &season.id, 2);

    let first = engine
        .pipeline()
        .run_round_cycle(&season.id, 2)
        .await
        .expect("first cycle");
    assert_eq!(first.entrants[0].chapters_written, vec![1, 2]);
    let balance = engine.ledger().balance(&book.id).expect("balance");
    let reviews = generator.review_calls.load(Ordering::SeqCst);

    let second = engine
        .pipeline()
        .run_round_cycle(&season.id, 2)
        .await
        .expect("second cycle");
    assert!(second.entrants[0].chapters_written.is_empty());
    assert!(second.entrants[0].is_ok());
    assert!(!second.entrants[0].outline_generated);

    let again = engine
        .pipeline()
        .write_chapter(&book.id, 2)
        .await
        .expect("write");
    assert!(matches!(again, ChapterOutcome::AlreadyExists));

    assert_eq!(engine.ledger().balance(&book.id).expect("balance"), balance);
    assert_eq!(generator.review_calls.load(Ordering::SeqCst), reviews);
    assert_eq!(generator.outline_calls.load(Ordering::SeqCst), 1);
    assert_eq!(chapter_numbers(&engine, &book.id), vec![1, 2]);
}

#[tokio::test]
async fn bankrupt_entrant_is_discontinued_without_generator_calls() {
    let generator = Arc::new(MockGenerator::new(3));
    let engine = engine(generator.clone());
    let (season, books) = active_season(&engine, 3, &["Solvent", "Broke"]);
    let broke = books.iter().find(|b| b.title == "Broke").expect("broke");
    let solvent = books.iter().find(|b| b.title == "Solvent").expect("solvent");

    let balance = engine
        .db()
        .apply_ink(
            &broke.id,
            &[InkDelta {
                amount: -150,
                reason: "penalty",
            }],
            chrono::Utc::now(),
        )
        .expect("debit");
    assert_eq!(balance, -50);

    let report = engine
        .pipeline()
        .run_round_cycle(&season.id, 1)
        .await
        .expect("cycle");
    assert_eq!(report.failed(), 1);

    let broke_report = report
        .entrants
        .iter()
        .find(|e| e.book_id == broke.id)
        .expect("broke report");
    let failure = broke_report.error.as_ref().expect("failure recorded");
    assert_eq!(failure.category, ErrorCategory::Bankruptcy);

    let broke_now = engine.db().get_book(&broke.id).expect("book").expect("exists");
    assert_eq!(broke_now.status, BookStatus::Discontinued);
    assert_eq!(broke_now.discontinued_reason, Some(DiscontinueReason::Bankrupt));
    assert!(generator.chapter_numbers_for("Broke").is_empty());
    assert!(engine.db().get_outline(&broke.id).expect("outline").is_none());

    // The sibling was untouched by the failure
    assert_eq!(generator.outline_calls.load(Ordering::SeqCst), 1);
    assert_eq!(chapter_numbers(&engine, &solvent.id), vec![1]);
}

#[tokio::test]
async fn failing_entrant_does_not_abort_its_siblings() {
    let generator = Arc::new(MockGenerator::new(3));
    generator.fail_chapters_for("Cursed");
    let engine = engine(generator.clone());
    let (season, books) = active_season(&engine, 3, &["Cursed", "Blessed"]);
    force_round(&engine, &season.id, 2);

    engine
        .queue()
        .enqueue(TaskPayload::RoundCycle {
            season_id: season.id.clone(),
            round: 2,
        })
        .expect("enqueue");
    let TriggerOutcome::Drained(summary) = engine.worker().trigger_once().await else {
        panic!("expected a drain");
    };
    // Entrant failures are reported, not raised; the task itself succeeds
    assert_eq!(summary.succeeded, 1);

    let cursed = books.iter().find(|b| b.title == "Cursed").expect("cursed");
    let blessed = books.iter().find(|b| b.title == "Blessed").expect("blessed");
    assert!(chapter_numbers(&engine, &cursed.id).is_empty());
    assert_eq!(chapter_numbers(&engine, &blessed.id), vec![1, 2]);

    // Retry budget of two attempts, stopped at chapter 1
    assert_eq!(generator.chapter_numbers_for("Cursed"), vec![1, 1]);

    // Outline was charged; the failed chapter was not
    assert_eq!(engine.ledger().balance(&cursed.id).expect("balance"), 90);

    let tasks = engine.queue().list(Some(TaskStatus::Done)).expect("tasks");
    assert_eq!(tasks.len(), 1);
}

#[tokio::test]
async fn chapters_require_plan_and_predecessor() {
    let generator = Arc::new(MockGenerator::new(3));
    let engine = engine(generator.clone());
    let (_season, books) = active_season(&engine, 3, &["Ordered"]);
    let book = &books[0];

    let no_plan = engine
        .pipeline()
        .write_chapter(&book.id, 1)
        .await
        .expect_err("no outline yet");
    assert_eq!(no_plan.category(), ErrorCategory::PlanMissing);

    engine
        .pipeline()
        .generate_outline(&book.id, false)
        .await
        .expect("outline");

    let skipped = engine
        .pipeline()
        .write_chapter(&book.id, 2)
        .await
        .expect_err("chapter 1 missing");
    assert_eq!(skipped.category(), ErrorCategory::MissingPriorChapter);

    let beyond = engine
        .pipeline()
        .write_chapter(&book.id, 4)
        .await
        .expect_err("past the plan");
    assert_eq!(beyond.category(), ErrorCategory::PlanMissing);

    assert!(generator.chapter_calls.lock().expect("lock").is_empty());
    assert_eq!(engine.ledger().balance(&book.id).expect("balance"), 90);
}
