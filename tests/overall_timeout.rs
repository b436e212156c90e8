mod common;

use std::time::{Duration, Instant};

use common::*;
use evidentia::custody::CustodyStatus;
use evidentia::evidence::Modality;
use evidentia::executor::AbortReason;
use evidentia::processor::{AnalysisRequest, ProcessError};

async fn wait_for_delete(transcription: &FakeTranscription) -> usize {
    for _ in 0..100 {
        let deleted = transcription.deleted().len();
        if deleted > 0 {
            return deleted;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    0
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overall_ceiling_aborts_unfinished_tasks() {
    let h = harness_with(
        |cfg| {
            cfg.overall_timeout_seconds = 1;
            cfg.per_task_timeout_seconds = 30;
        },
        FakeTranscription::new(usize::MAX, None),
    );
    let path = write_fixture(&h.path("interview.wav"), &sine_wav(1.0));

    let started = Instant::now();
    let err = h
        .engine
        .processor(Modality::Audio)
        .process(AnalysisRequest::new(
            "A-9",
            path,
            &["transcription", "language_detection"],
        ))
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));

    match err {
        ProcessError::Aborted {
            evidence_id,
            reason,
            finished,
            unfinished,
        } => {
            assert_eq!(evidence_id, "A-9");
            assert_eq!(reason, AbortReason::Timeout);
            assert_eq!(unfinished, vec!["transcription"]);
            assert_eq!(finished, vec!["language_detection"]);
        }
        other => panic!("expected abort, got {other}"),
    }

    let events = h.events("A-9");
    let collect = events
        .iter()
        .find(|e| e.operation == "collect")
        .expect("collect event");
    assert_eq!(collect.status, CustodyStatus::Error);
    assert_eq!(collect.error.as_deref(), Some("timeout"));
    let transcription = events
        .iter()
        .find(|e| e.operation == "analysis:transcription")
        .expect("transcription event");
    assert_eq!(transcription.status, CustodyStatus::Error);
    assert_eq!(transcription.error.as_deref(), Some("cancelled"));
    assert!(events.iter().all(|e| e.operation != "complete"));
    assert_eq!(
        events.iter().filter(|e| e.operation.starts_with("analysis:")).count(),
        2
    );

    assert_eq!(wait_for_delete(&h.transcription).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_cancels_in_flight_processing() {
    let h = harness_with(|_| {}, FakeTranscription::new(usize::MAX, None));
    let path = write_fixture(&h.path("interview.wav"), &sine_wav(1.0));
    let processor = h.engine.processor(Modality::Audio);
    let engine = h.engine.clone();

    let (outcome, ()) = tokio::join!(
        processor.process(AnalysisRequest::new("A-10", path, &["transcription"])),
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            engine.cancel_all();
        }
    );

    assert!(matches!(
        outcome,
        Err(ProcessError::Aborted {
            reason: AbortReason::Cancelled,
            ..
        })
    ));
    let events = h.events("A-10");
    let collect = events
        .iter()
        .find(|e| e.operation == "collect")
        .expect("collect event");
    assert_eq!(collect.error.as_deref(), Some("cancelled"));
    assert_eq!(wait_for_delete(&h.transcription).await, 1);
}
