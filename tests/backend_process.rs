#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use evidentia::backend::{Backends, CommandBackend};
use evidentia::config::LoadedConfig;
use evidentia::context::EngineContext;
use evidentia::custody::memory::MemorySink;
use evidentia::evidence::Modality;
use evidentia::processor::AnalysisRequest;
use evidentia::report::FailureKind;

// yolov5 never answers; every other model answers at once.
const MODEL_SCRIPT: &str = r#"
case "$1:$3" in
  infer:yolov5) cat > /dev/null; sleep 20 ;;
  infer:*) cat > /dev/null; echo '{"scores":[{"label":"face","score":0.97}]}' ;;
  *) echo "unsupported op $1" >&2; exit 2 ;;
esac
"#;

fn gpu_engine(dir: &std::path::Path) -> Arc<EngineContext> {
    let script = dir.join("models.sh");
    std::fs::write(&script, MODEL_SCRIPT).expect("write script");
    let command = CommandBackend::new("sh").with_args([script.display().to_string()]);

    let mut config = test_config();
    config.gpu_device = Some("cuda:0".to_string());
    config.per_task_timeout_seconds = 1;
    let (sink, _log) = MemorySink::new();
    EngineContext::new(
        LoadedConfig {
            config,
            config_hash: "0".repeat(64),
        },
        Box::new(sink),
        Backends::command(command),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hung_model_process_does_not_hold_the_gpu() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = gpu_engine(dir.path());
    let image = write_fixture(&dir.path().join("scene.png"), &png_header(64, 64));
    let processor = engine.processor(Modality::Image);

    let stuck = processor
        .process(AnalysisRequest::new("IMG-1", image.clone(), &["object_detection"]))
        .await
        .expect("report");
    assert_eq!(stuck.errors["object_detection"].kind, FailureKind::Timeout);

    let started = Instant::now();
    let next = processor
        .process(AnalysisRequest::new("IMG-2", image, &["face_detection"]))
        .await
        .expect("report");
    assert!(
        next.errors.is_empty(),
        "face_detection should not wait on the hung process: {:?}",
        next.errors
    );
    assert_eq!(next.results["face_detection"].confidence, Some(0.97));
    assert!(started.elapsed() < Duration::from_secs(5));
}
