mod common;

use common::*;
use evidentia::custody::CustodyStatus;
use evidentia::evidence::Modality;
use evidentia::processor::AnalysisRequest;
use evidentia::report::FailureKind;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_and_panicking_types_do_not_affect_siblings() {
    let h = harness();
    h.inference.on("yolov5", Behavior::Fail("model weights missing".to_string()));
    h.inference.on("face_detect", Behavior::Panic);
    let path = write_fixture(&h.path("scene.png"), &png_header(128, 128));

    let report = h
        .engine
        .processor(Modality::Image)
        .process(AnalysisRequest::new(
            "IMG-5",
            path,
            &["object_detection", "face_detection", "ocr"],
        ))
        .await
        .expect("partial report");

    assert!(!report.is_complete());
    assert_eq!(report.results.len(), 1);
    assert!(report.results.contains_key("ocr"));
    assert_eq!(report.errors["object_detection"].kind, FailureKind::Backend);
    assert!(report.errors["object_detection"].message.contains("model weights missing"));
    assert_eq!(report.errors["face_detection"].kind, FailureKind::Panic);
    assert!(report.errors["face_detection"].message.contains("crashed"));

    let events = h.events("IMG-5");
    let status_of = |op: &str| {
        events
            .iter()
            .find(|e| e.operation == op)
            .map(|e| e.status)
            .expect("event")
    };
    assert_eq!(status_of("analysis:object_detection"), CustodyStatus::Error);
    assert_eq!(status_of("analysis:face_detection"), CustodyStatus::Error);
    assert_eq!(status_of("analysis:ocr"), CustodyStatus::Success);
    assert_eq!(status_of("collect"), CustodyStatus::Success);
    assert_eq!(status_of("complete"), CustodyStatus::Success);
}

#[tokio::test]
async fn out_of_range_scores_fail_only_that_type() {
    let h = harness();
    h.inference.on("speaker_identification", scores(&[("speaker_1", 1.7)]));
    let path = write_fixture(&h.path("call.wav"), &sine_wav(0.5));

    let report = h
        .engine
        .processor(Modality::Audio)
        .process(AnalysisRequest::new(
            "A-1",
            path,
            &["speaker_identification", "language_detection"],
        ))
        .await
        .expect("report");

    let failure = &report.errors["speaker_identification"];
    assert_eq!(failure.kind, FailureKind::Backend);
    assert!(failure.message.contains("malformed"));
    assert!(report.results.contains_key("language_detection"));
    for result in report.results.values() {
        if let Some(c) = result.confidence {
            assert!((0.0..=1.0).contains(&c));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_task_times_out_alone() {
    let h = harness_with(
        |cfg| cfg.per_task_timeout_seconds = 1,
        FakeTranscription::new(0, None),
    );
    h.inference.on("yolov5", Behavior::Sleep(std::time::Duration::from_secs(3)));
    let path = write_fixture(&h.path("scene.png"), &png_header(64, 64));

    let started = std::time::Instant::now();
    let report = h
        .engine
        .processor(Modality::Image)
        .process(AnalysisRequest::new("IMG-6", path, &["object_detection", "ocr"]))
        .await
        .expect("report");
    assert!(started.elapsed() < std::time::Duration::from_millis(2900));

    assert_eq!(report.errors["object_detection"].kind, FailureKind::Timeout);
    assert!(report.results.contains_key("ocr"));
    let detail = h
        .events("IMG-6")
        .into_iter()
        .find(|e| e.operation == "analysis:object_detection")
        .and_then(|e| e.detail);
    assert_eq!(detail.as_deref(), Some("timeout"));
}
