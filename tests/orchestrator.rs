//! Orchestrator Integration Tests
//!
//! Idempotent re-runs, journaling, output comparison and preprocess
//! backends.

mod common;

use std::sync::Arc;

use common::{create_case, create_test_store, name, seed_shader, MarkerBackend, SHADER};
use shadertriage::adapters::{BackendConfig, TestCase};
use shadertriage::core::{Job, JobEventType, Journal};
use shadertriage::domain::{Comparison, JobState, Metadata, Outcome, Payload, Provenance, Status};
use shadertriage::{ArtifactName, ArtifactStore, CreateMode, Orchestrator, PayloadFile};

async fn create_case_with_expected(store: &ArtifactStore, at: &str, expected: &str) -> ArtifactName {
    let case = TestCase::new("fixture", vec![PayloadFile::new(SHADER, "void main() {}\n")])
        .with_expected_output(PayloadFile::new("expected.png", expected));
    let metadata = Metadata::new(
        Payload::ShaderJob(case.to_shader_job()),
        Provenance::root("fixture"),
    );
    store
        .create(&name(at), metadata, case.payload_files(), CreateMode::Exact)
        .await
        .unwrap()
        .name
}

fn image_backend(script: &str) -> BackendConfig {
    let mut config = BackendConfig::new("gpu", "sh").with_args(["-c", script]);
    config.output_file = Some("out.png".to_string());
    config
}

#[tokio::test]
async fn test_rerun_reuses_stored_result() {
    let (store, _temp) = create_test_store().await;
    let case = create_case(&store, "tests/case", &seed_shader()).await;
    let backend = Arc::new(MarkerBackend::new("marker"));
    let orchestrator = Orchestrator::new(store.clone()).with_backend(backend.clone());

    let first = orchestrator.run(&Job::new(case.clone(), "marker")).await.unwrap();
    let second = orchestrator.run(&Job::new(case.clone(), "marker")).await.unwrap();

    assert_eq!(backend.calls(), 1);
    assert!(!first.reused);
    assert!(second.reused);
    assert_eq!(second.artifact, first.artifact);
    assert_eq!(second.outcome, Outcome::Crash);
    assert_eq!(second.signature, first.signature);
    assert_eq!(second.stderr, first.stderr);

    let results = store
        .list(Some(&case.child("results").unwrap()))
        .collect_valid()
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].name.to_string(), "tests/case/results/marker");
}

#[tokio::test]
async fn test_concurrent_duplicate_jobs_store_one_result() {
    let (store, _temp) = create_test_store().await;
    let case = create_case(&store, "tests/case", &seed_shader()).await;
    let orchestrator = Orchestrator::new(store.clone())
        .with_backend(Arc::new(MarkerBackend::new("marker")))
        .with_workers(4);

    let jobs = (0..4).map(|_| Job::new(case.clone(), "marker")).collect();
    let reports = orchestrator.run_batch(jobs).await;

    let signatures: Vec<_> = reports
        .iter()
        .map(|r| r.result.as_ref().unwrap().signature.clone())
        .collect();
    assert!(signatures.windows(2).all(|w| w[0] == w[1]));

    let results = store
        .list(Some(&case.child("results").unwrap()))
        .collect_valid()
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn test_journal_records_job_lifecycle() {
    let (store, _temp) = create_test_store().await;
    let case = create_case(&store, "tests/case", "void main() {}\n").await;
    let journal = Journal::open(&store, "session-1").await.unwrap();
    let orchestrator = Orchestrator::new(store.clone())
        .with_backend(Arc::new(MarkerBackend::new("marker")))
        .with_journal(journal.clone());

    orchestrator.run(&Job::new(case.clone(), "marker")).await.unwrap();
    orchestrator.run(&Job::new(case.clone(), "marker")).await.unwrap();

    let types: Vec<JobEventType> = journal
        .replay()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        types,
        vec![
            JobEventType::Queued,
            JobEventType::Started,
            JobEventType::Finished,
            JobEventType::Skipped,
        ]
    );

    let records = journal.records().await.unwrap();
    let record = &records["tests/case/results/marker"];
    assert!(record.is_finished());
    assert_eq!(record.skipped, 1);
    assert_eq!(record.state, JobState::Completed);
}

#[tokio::test]
async fn test_test_case_status_moves_off_pending() {
    let (store, _temp) = create_test_store().await;
    let case = create_case(&store, "tests/case", "void main() {}\n").await;
    let orchestrator =
        Orchestrator::new(store.clone()).with_backend(Arc::new(MarkerBackend::new("marker")));

    assert_eq!(store.read(&case).await.unwrap().metadata.status, Status::Pending);
    orchestrator.run(&Job::new(case.clone(), "marker")).await.unwrap();
    assert_eq!(store.read(&case).await.unwrap().metadata.status, Status::Running);
}

#[tokio::test]
async fn test_matching_output_passes() {
    let (store, _temp) = create_test_store().await;
    let case = create_case_with_expected(&store, "tests/img", "pixels").await;
    let orchestrator =
        Orchestrator::new(store.clone()).with_process_backend(image_backend("printf pixels > out.png"));

    let result = orchestrator.run(&Job::new(case, "gpu")).await.unwrap();

    assert_eq!(result.outcome, Outcome::Pass);
    assert_eq!(result.comparison, Some(Comparison::Match));
    assert!(result.signature.is_none());
    assert_eq!(
        store.read_payload(&result.artifact, "out.png").await.unwrap(),
        b"pixels".to_vec()
    );
}

#[tokio::test]
async fn test_mismatched_output_is_wrong_image() {
    let (store, _temp) = create_test_store().await;
    let case = create_case_with_expected(&store, "tests/img", "pixels").await;
    let orchestrator =
        Orchestrator::new(store.clone()).with_process_backend(image_backend("printf garbage > out.png"));

    let result = orchestrator.run(&Job::new(case, "gpu")).await.unwrap();

    assert_eq!(result.outcome, Outcome::WrongImage);
    assert_eq!(result.comparison, Some(Comparison::Mismatch));
    assert_eq!(result.signature.unwrap().to_string(), "wrong_image.mismatch");
    assert_eq!(
        store.read(&result.artifact).await.unwrap().metadata.status,
        Status::Interesting
    );
}

#[tokio::test]
async fn test_missing_output_is_wrong_image() {
    let (store, _temp) = create_test_store().await;
    let case = create_case_with_expected(&store, "tests/img", "pixels").await;
    let orchestrator = Orchestrator::new(store).with_process_backend(image_backend("true"));

    let result = orchestrator.run(&Job::new(case, "gpu")).await.unwrap();

    assert_eq!(result.outcome, Outcome::WrongImage);
    assert_eq!(result.comparison, Some(Comparison::Error));
}

#[tokio::test]
async fn test_preprocess_failure_is_host_crash() {
    let (store, _temp) = create_test_store().await;
    let case = create_case(&store, "tests/case", "void main() {}\n").await;
    let mut glslang = BackendConfig::new("glslang", "sh")
        .with_args(["-c", "echo 'SPIR-V is not generated for failed compile or link' >&2; exit 2"]);
    glslang.preprocess = true;
    let orchestrator = Orchestrator::new(store).with_process_backend(glslang);

    let result = orchestrator.run(&Job::new(case, "glslang")).await.unwrap();

    assert_eq!(result.outcome, Outcome::HostCrash);
    assert_eq!(result.state, JobState::Crashed);
    assert_eq!(result.exit_code, Some(2));
    assert_eq!(result.signature.unwrap().class().as_str(), "host_crash");
}

#[tokio::test]
async fn test_files_are_passed_to_backend() {
    let (store, _temp) = create_test_store().await;
    let case = create_case(&store, "tests/case", "void main() {}\n").await;
    let orchestrator = Orchestrator::new(store).with_process_backend(
        BackendConfig::new("cat", "cat").with_args(["{files}"]),
    );

    let result = orchestrator.run(&Job::new(case, "cat")).await.unwrap();

    assert_eq!(result.outcome, Outcome::Pass);
    assert_eq!(result.stdout, "void main() {}\n");
}
