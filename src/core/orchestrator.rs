//! Run orchestrator.
//!
//! Runs test cases against backends with a hard timeout, retries
//! infrastructure failures, classifies outcomes and records each run as a
//! result artifact at `<test case>/results/<backend>`. That name makes runs
//! idempotent: a job whose result already exists is not run again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{
    Backend, BackendConfig, BackendOutput, Comparator, ExactComparator, Invocation,
    ProcessBackend,
};
use crate::config::ShadertriageConfig;
use crate::domain::{
    ArtifactName, Comparison, JobState, Metadata, Outcome, Payload, Provenance, RunResult,
    Status, TestResult,
};
use crate::error::{Error, Result};
use crate::store::{Artifact, ArtifactStore, CreateMode, PayloadFile};

use super::dedup::signature_of;
use super::journal::{JobEvent, JobEventType, Journal};
use super::limits::RetryPolicy;

pub const STDOUT_FILE: &str = "stdout.txt";
pub const STDERR_FILE: &str = "stderr.txt";
pub const LOG_FILE: &str = "log.txt";

/// One test case on one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub test_case: ArtifactName,
    pub backend: String,

    /// Overrides the backend and default timeouts
    pub timeout: Option<Duration>,
}

impl Job {
    pub fn new(test_case: ArtifactName, backend: impl Into<String>) -> Self {
        Self {
            test_case,
            backend: backend.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of one job in a batch
#[derive(Debug)]
pub struct JobReport {
    pub job: Job,
    pub result: Result<RunResult>,
}

/// How an invocation ended, before classification
enum Execution {
    Finished(BackendOutput),
    TimedOut,
    Infra(String),
}

/// Schedules jobs over a bounded worker pool
#[derive(Clone)]
pub struct Orchestrator {
    store: ArtifactStore,
    backends: BTreeMap<String, Arc<dyn Backend>>,
    comparator: Arc<dyn Comparator>,
    journal: Option<Journal>,
    retry: RetryPolicy,
    default_timeout: Duration,
    workers: usize,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("store", &self.store)
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .field("retry", &self.retry)
            .field("default_timeout", &self.default_timeout)
            .field("workers", &self.workers)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(store: ArtifactStore) -> Self {
        Self {
            store,
            backends: BTreeMap::new(),
            comparator: Arc::new(ExactComparator),
            journal: None,
            retry: RetryPolicy::default(),
            default_timeout: Duration::from_secs(60),
            workers: 4,
        }
    }

    /// Orchestrator with the configured process backends and limits
    pub fn from_config(store: ArtifactStore, config: &ShadertriageConfig) -> Self {
        let mut orchestrator = Self::new(store)
            .with_retry(config.retry.clone())
            .with_default_timeout(Duration::from_secs(config.default_timeout_seconds))
            .with_workers(config.workers);
        for backend in &config.backends {
            orchestrator = orchestrator.with_process_backend(backend.clone());
        }
        orchestrator
    }

    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(backend.name().to_string(), backend);
        self
    }

    pub fn with_process_backend(self, config: BackendConfig) -> Self {
        self.with_backend(Arc::new(ProcessBackend::new(config)))
    }

    pub fn with_comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn backend(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(name).cloned()
    }

    /// Registered backends, by name
    pub fn backends(&self) -> impl Iterator<Item = &Arc<dyn Backend>> {
        self.backends.values()
    }

    /// Where the result of running `test_case` on `backend` is stored
    pub fn result_name(test_case: &ArtifactName, backend: &str) -> Result<ArtifactName> {
        test_case.child("results")?.child(backend)
    }

    async fn record(&self, event: JobEvent) {
        if let Some(journal) = &self.journal {
            // The journal is diagnostic; a failed append never fails the job
            if let Err(e) = journal.append(&event).await {
                warn!(error = %e, job = %event.job_id, "Failed to append journal event");
            }
        }
    }

    /// Run one job, or return its stored result if it already ran
    #[instrument(skip(self), fields(test_case = %job.test_case, backend = %job.backend))]
    pub async fn run(&self, job: &Job) -> Result<RunResult> {
        let backend = self
            .backend(&job.backend)
            .ok_or_else(|| Error::Infra(format!("unknown backend '{}'", job.backend)))?;
        let result_name = Self::result_name(&job.test_case, &job.backend)?;
        let job_id = result_name.to_string();

        match self.store.read(&result_name).await {
            Ok(existing) => {
                debug!("Result already recorded, skipping");
                let result = self.load_result(&existing, &job.test_case).await?;
                self.record(JobEvent::new(&job_id, JobEventType::Skipped, result.state))
                    .await;
                return Ok(result);
            }
            Err(Error::NotFound(_)) => {}
            Err(e @ Error::Schema { .. }) => {
                warn!(error = %e, "Corrupt result, quarantining and re-running");
                self.store.quarantine(&result_name).await?;
            }
            Err(e) => return Err(e),
        }

        let test_case = self.store.read(&job.test_case).await?;
        let (files, expected_file) = match &test_case.metadata.payload {
            Payload::ShaderJob(case) => (case.files.clone(), case.expected_output.clone()),
            Payload::ReductionStep(step) => (step.files.clone(), step.expected_output.clone()),
            _ => {
                return Err(Error::schema(
                    &job.test_case,
                    format!("a {} artifact cannot be run", test_case.metadata.kind()),
                ))
            }
        };
        let expected = match &expected_file {
            Some(file) => Some(self.store.read_payload(&job.test_case, file).await?),
            None => None,
        };

        self.record(JobEvent::new(&job_id, JobEventType::Queued, JobState::Queued))
            .await;
        if test_case.metadata.status == Status::Pending {
            self.store
                .update_metadata(&job.test_case, |m| {
                    if m.status == Status::Pending {
                        m.status = Status::Running;
                    }
                })
                .await?;
        }

        let limit = job
            .timeout
            .or_else(|| backend.timeout())
            .unwrap_or(self.default_timeout);
        let started = Instant::now();
        let mut state = JobState::Queued;
        let mut attempt = 0u32;

        let execution = loop {
            attempt += 1;
            state = state.transition(JobState::Running)?;
            if attempt == 1 {
                self.record(
                    JobEvent::new(&job_id, JobEventType::Started, state).with_attempt(attempt),
                )
                .await;
            }

            let work_dir = tempfile::Builder::new()
                .prefix("shadertriage-work-")
                .tempdir()?;
            let invocation = Invocation {
                test_case: job.test_case.clone(),
                test_dir: test_case.dir.clone(),
                files: files.clone(),
                work_dir: work_dir.path().to_path_buf(),
            };

            // Dropping the invocation future on timeout kills the child
            match timeout(limit, backend.invoke(&invocation)).await {
                Err(_) => break Execution::TimedOut,
                Ok(Ok(output)) => break Execution::Finished(output),
                Ok(Err(e)) => {
                    let cause = format!("{:#}", e);
                    if self.retry.should_retry(attempt) {
                        let delay = self.retry.delay_for_attempt(attempt);
                        warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %cause,
                            "Backend failed to run, retrying"
                        );
                        self.record(
                            JobEvent::new(&job_id, JobEventType::Retrying, state)
                                .with_attempt(attempt + 1)
                                .with_error(cause.clone()),
                        )
                        .await;
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    error!(attempt, error = %cause, "Backend failed permanently");
                    break Execution::Infra(cause);
                }
            }
        };
        let duration = started.elapsed();

        let mut comparison = None;
        let mut cause = None;
        let (next_state, outcome, output) = match execution {
            Execution::TimedOut => (JobState::TimedOut, Outcome::Timeout, BackendOutput::default()),
            Execution::Infra(failure) => {
                cause = Some(failure);
                (JobState::Errored, Outcome::InfraError, BackendOutput::default())
            }
            Execution::Finished(output) if !output.succeeded() => {
                let outcome = if backend.is_preprocess() {
                    Outcome::HostCrash
                } else {
                    Outcome::Crash
                };
                (JobState::Crashed, outcome, output)
            }
            Execution::Finished(output) => {
                if let (Some(expected), Some(file)) = (&expected, backend.output_file()) {
                    comparison = Some(match output.outputs.iter().find(|o| o.name == file) {
                        Some(actual) => self.comparator.compare(expected, &actual.contents),
                        None => Comparison::Error,
                    });
                }
                let outcome = match comparison {
                    Some(Comparison::Mismatch) | Some(Comparison::Error) => Outcome::WrongImage,
                    _ => Outcome::Pass,
                };
                (JobState::Completed, outcome, output)
            }
        };
        state = state.transition(next_state)?;

        let mut result = RunResult {
            artifact: result_name.clone(),
            test_case: job.test_case.clone(),
            backend: job.backend.clone(),
            state,
            outcome,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            comparison,
            signature: None,
            duration,
            attempts: attempt,
            cause,
            reused: false,
        };
        result.signature = signature_of(result.outcome, result.exit_code, &result.log());

        let result = self.store_result(result, output.outputs, limit).await?;

        self.record(
            JobEvent::new(&job_id, JobEventType::Finished, result.state)
                .with_attempt(result.attempts)
                .with_duration(result.duration.as_millis() as u64),
        )
        .await;

        if result.is_finding() {
            warn!(
                outcome = ?result.outcome,
                signature = %result.signature.as_ref().map(|s| s.to_string()).unwrap_or_default(),
                "Finding"
            );
        } else {
            info!(outcome = ?result.outcome, duration_ms = result.duration.as_millis() as u64, "Job finished");
        }
        Ok(result)
    }

    /// Write the result artifact; a concurrent duplicate run yields the winner's
    async fn store_result(
        &self,
        result: RunResult,
        outputs: Vec<PayloadFile>,
        limit: Duration,
    ) -> Result<RunResult> {
        let mut files = vec![
            PayloadFile::new(STDOUT_FILE, result.stdout.clone()),
            PayloadFile::new(STDERR_FILE, result.stderr.clone()),
            PayloadFile::new(LOG_FILE, result.log()),
        ];
        let output_names: Vec<String> = outputs
            .iter()
            .filter(|o| ![STDOUT_FILE, STDERR_FILE, LOG_FILE].contains(&o.name.as_str()))
            .map(|o| o.name.clone())
            .collect();
        files.extend(outputs.into_iter().filter(|o| output_names.contains(&o.name)));

        let status = match result.outcome {
            Outcome::Pass => Status::Completed,
            Outcome::InfraError => Status::Failed,
            _ => Status::Interesting,
        };
        let payload = TestResult {
            backend: result.backend.clone(),
            state: result.state,
            outcome: result.outcome,
            exit_code: result.exit_code,
            duration_ms: result.duration.as_millis() as u64,
            attempts: result.attempts,
            logs: vec![
                STDOUT_FILE.to_string(),
                STDERR_FILE.to_string(),
                LOG_FILE.to_string(),
            ],
            outputs: output_names,
            comparison: result.comparison,
            signature: result.signature.clone(),
            cause: result.cause.clone(),
        };
        let provenance = Provenance::derived(result.test_case.clone(), "orchestrator")
            .with_param("backend", &result.backend)
            .with_param("timeout_ms", limit.as_millis());
        let metadata = Metadata::new(Payload::TestResult(payload), provenance).with_status(status);

        match self
            .store
            .create(&result.artifact, metadata, files, CreateMode::Exact)
            .await
        {
            Ok(_) => Ok(result),
            Err(Error::NameCollision(_)) => {
                debug!("Another worker recorded this result first");
                let existing = self.store.read(&result.artifact).await?;
                self.load_result(&existing, &result.test_case).await
            }
            Err(e) => Err(e),
        }
    }

    /// Rebuild a `RunResult` from a stored result artifact
    pub async fn load_result(&self, artifact: &Artifact, test_case: &ArtifactName) -> Result<RunResult> {
        let stored = artifact
            .metadata
            .as_test_result()
            .ok_or_else(|| Error::schema(&artifact.name, "not a test result"))?;

        let stdout = self.read_log(&artifact.name, STDOUT_FILE).await?;
        let stderr = self.read_log(&artifact.name, STDERR_FILE).await?;

        Ok(RunResult {
            artifact: artifact.name.clone(),
            test_case: test_case.clone(),
            backend: stored.backend.clone(),
            state: stored.state,
            outcome: stored.outcome,
            exit_code: stored.exit_code,
            stdout,
            stderr,
            comparison: stored.comparison,
            signature: stored.signature.clone(),
            duration: Duration::from_millis(stored.duration_ms),
            attempts: stored.attempts,
            cause: stored.cause.clone(),
            reused: true,
        })
    }

    async fn read_log(&self, name: &ArtifactName, file: &str) -> Result<String> {
        match self.store.read_payload(name, file).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(Error::NotFound(_)) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Run jobs on the worker pool; reports come back in job order.
    ///
    /// A job that fails or panics is reported, never propagated.
    #[instrument(skip(self, jobs), fields(jobs = jobs.len(), workers = self.workers))]
    pub async fn run_batch(&self, jobs: Vec<Job>) -> Vec<JobReport> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let total = jobs.len();

        for (index, job) in jobs.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let orchestrator = self.clone();
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        let result = Err(Error::Infra(format!("worker pool closed: {}", e)));
                        return (index, JobReport { job, result });
                    }
                };

                // Inner task so a panicking job surfaces as a JoinError
                let inner = {
                    let orchestrator = orchestrator.clone();
                    let job = job.clone();
                    tokio::spawn(async move { orchestrator.run(&job).await })
                };
                let result = match inner.await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(test_case = %job.test_case, backend = %job.backend, error = %e, "Worker panicked");
                        Err(Error::Infra(format!("worker failed: {}", e)))
                    }
                };
                (index, JobReport { job, result })
            });
        }

        let mut reports: Vec<Option<JobReport>> = (0..total).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, report)) => reports[index] = Some(report),
                Err(e) => error!(error = %e, "Batch task failed"),
            }
        }

        let reports: Vec<JobReport> = reports.into_iter().flatten().collect();
        let findings = reports
            .iter()
            .filter(|r| matches!(&r.result, Ok(result) if result.is_finding()))
            .count();
        info!(completed = reports.len(), findings, "Batch finished");
        reports
    }
}
