//! Fuzzing session: generate, run, classify, dedup, reduce.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use crate::adapters::{Generator, LineSimplifier, ProcessGenerator, Simplifier, TestCase};
use crate::config::ShadertriageConfig;
use crate::domain::name::sanitize_segment;
use crate::domain::{ArtifactName, Metadata, Outcome, Payload, Provenance, RunResult, Status};
use crate::error::{Error, Result};
use crate::store::{ArtifactStore, CreateMode};

use super::dedup::{BucketDecision, Contender, SignatureEngine};
use super::journal::Journal;
use super::limits::ReductionLimits;
use super::orchestrator::{Job, Orchestrator};
use super::reducer::{ReductionDriver, ReductionOutcome};

/// A finding and what was done with it
#[derive(Debug, Clone)]
pub struct FindingReport {
    pub result: ArtifactName,
    pub decision: BucketDecision,

    /// One outcome per phase; empty when the finding was not reduced
    pub reductions: Vec<ReductionOutcome>,

    pub representative_replaced: bool,
}

/// Everything one iteration produced
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub seed: u64,
    pub test_case: ArtifactName,
    pub results: Vec<RunResult>,
    pub findings: Vec<FindingReport>,

    /// A preprocess backend host-crashed and the other backends were skipped
    pub skipped_backends: bool,
}

/// Totals over a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub iterations: usize,
    pub failed_iterations: usize,
    pub findings: usize,
    pub novel_buckets: usize,
    pub reductions: usize,
}

impl SessionSummary {
    fn add(&mut self, report: &IterationReport) {
        self.iterations += 1;
        self.findings += report.findings.len();
        self.novel_buckets += report.findings.iter().filter(|f| f.decision.novel).count();
        self.reductions += report
            .findings
            .iter()
            .filter(|f| !f.reductions.is_empty())
            .count();
    }
}

/// One fuzzing session writing under `runs/<id>/`
#[derive(Clone)]
pub struct FuzzSession {
    id: String,
    orchestrator: Orchestrator,
    generator: Arc<dyn Generator>,
    dedup: SignatureEngine,
    reducer: ReductionDriver,
    phases: Vec<(String, Arc<dyn Simplifier>)>,
    limits: ReductionLimits,
    workers: usize,
}

impl std::fmt::Debug for FuzzSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuzzSession")
            .field("id", &self.id)
            .field("generator", &self.generator.name())
            .field(
                "phases",
                &self.phases.iter().map(|(p, _)| p.as_str()).collect::<Vec<_>>(),
            )
            .field("limits", &self.limits)
            .field("workers", &self.workers)
            .finish()
    }
}

impl FuzzSession {
    pub fn new(
        id: impl Into<String>,
        orchestrator: Orchestrator,
        generator: Arc<dyn Generator>,
        max_duplicates: usize,
    ) -> Self {
        let dedup = SignatureEngine::new(orchestrator.store().clone(), max_duplicates);
        Self {
            id: sanitize_segment(&id.into()),
            reducer: ReductionDriver::new(orchestrator.clone()),
            workers: orchestrator.workers(),
            orchestrator,
            generator,
            dedup,
            phases: Vec::new(),
            limits: ReductionLimits::default(),
        }
    }

    /// Session over the configured store, backends and generator, reducing
    /// with a line simplifier per configured phase
    pub async fn from_config(id: &str, config: &ShadertriageConfig) -> Result<Self> {
        let generator = config
            .generator
            .clone()
            .ok_or_else(|| Error::Infra("no generator configured".to_string()))?;
        let store = ArtifactStore::open(&config.store).await?;
        let journal = Journal::open(&store, id).await?;
        let orchestrator = Orchestrator::from_config(store, config).with_journal(journal);

        let phases = config
            .phases
            .iter()
            .map(|phase| {
                let simplifier: Arc<dyn Simplifier> = Arc::new(LineSimplifier::named(phase.clone()));
                (phase.clone(), simplifier)
            })
            .collect();

        Ok(Self::new(
            id,
            orchestrator,
            Arc::new(ProcessGenerator::new(generator)),
            config.max_duplicate_crashes,
        )
        .with_phases(phases)
        .with_limits(config.reduction))
    }

    pub fn with_phases(mut self, phases: Vec<(String, Arc<dyn Simplifier>)>) -> Self {
        self.phases = phases;
        self
    }

    pub fn with_limits(mut self, limits: ReductionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dedup(&self) -> &SignatureEngine {
        &self.dedup
    }

    /// Generate one test case from `seed` and take it through the pipeline
    #[instrument(skip(self), fields(session = %self.id))]
    pub async fn run_iteration(&self, seed: u64) -> Result<IterationReport> {
        let store = self.orchestrator.store();
        let case = self
            .generator
            .generate(seed)
            .await
            .map_err(|e| Error::Infra(format!("generator {} failed: {:#}", self.generator.name(), e)))?;

        let test_case = ArtifactName::parse(&format!("runs/{}/tests/seed-{}", self.id, seed))?;
        let metadata = Metadata::new(
            Payload::ShaderJob(case.to_shader_job()),
            Provenance::root(self.generator.name())
                .with_param("seed", seed)
                .with_param("session", &self.id),
        );
        let case = match store
            .create(&test_case, metadata, case.payload_files(), CreateMode::Exact)
            .await
        {
            Ok(_) => {
                info!(test_case = %test_case, "Test case generated");
                case
            }
            // Seed already taken through this session: pick up the stored case
            Err(Error::NameCollision(_)) => {
                info!(test_case = %test_case, "Resuming stored test case");
                TestCase::load(store, &store.read(&test_case).await?).await?
            }
            Err(e) => return Err(e),
        };

        let mut results = Vec::new();
        let mut skipped_backends = false;

        // Preprocess backends run first; a host crash there makes the rest moot
        for backend in self.orchestrator.backends().filter(|b| b.is_preprocess()) {
            let result = self
                .orchestrator
                .run(&Job::new(test_case.clone(), backend.name()))
                .await?;
            let host_crash = result.outcome == Outcome::HostCrash;
            results.push(result);
            if host_crash {
                warn!(backend = %backend.name(), "Host crash, skipping remaining backends");
                skipped_backends = true;
                break;
            }
        }

        if !skipped_backends {
            let jobs: Vec<Job> = self
                .orchestrator
                .backends()
                .filter(|b| !b.is_preprocess())
                .map(|b| Job::new(test_case.clone(), b.name()))
                .collect();
            for report in self.orchestrator.run_batch(jobs).await {
                match report.result {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        error!(backend = %report.job.backend, error = %e, "Job failed")
                    }
                }
            }
        }

        let complexity = case.complexity();
        let mut findings = Vec::new();
        for result in results.iter().filter(|r| r.is_finding()) {
            let Some(signature) = self.dedup.signature(result) else {
                continue;
            };
            let decision = self
                .dedup
                .classify(&signature, &result.artifact, &test_case, complexity)
                .await?;

            let mut report = FindingReport {
                result: result.artifact.clone(),
                decision,
                reductions: Vec::new(),
                representative_replaced: false,
            };
            if report.decision.within_quota && !self.phases.is_empty() {
                self.reduce_finding(&test_case, result, &mut report).await?;
            }
            findings.push(report);
        }

        let status = if findings.is_empty() {
            Status::Completed
        } else {
            Status::Interesting
        };
        store
            .update_metadata(&test_case, move |m| m.status = status)
            .await?;

        Ok(IterationReport {
            seed,
            test_case,
            results,
            findings,
            skipped_backends,
        })
    }

    async fn reduce_finding(
        &self,
        test_case: &ArtifactName,
        result: &RunResult,
        report: &mut FindingReport,
    ) -> Result<()> {
        let outcomes = match self
            .reducer
            .reduce_phases(
                test_case,
                &result.backend,
                Some(&report.decision.signature),
                &self.phases,
                self.limits,
            )
            .await
        {
            Ok(outcomes) => outcomes,
            // Flaky findings do not reproduce; keep the finding, skip the reduction
            Err(Error::NotReducible(target)) => {
                warn!(%target, "Finding did not reproduce");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Some(last) = outcomes.last() {
            if last.best != *test_case && !last.best_collected {
                let contender = Contender {
                    complexity: last.best_complexity,
                    discovered_at: Utc::now(),
                };
                report.representative_replaced = self
                    .dedup
                    .offer_representative(&report.decision.signature, &last.best, contender)
                    .await?;
                if report.representative_replaced {
                    self.dedup
                        .collect_garbage(&report.decision.signature)
                        .await?;
                }
            }
        }
        report.reductions = outcomes;
        Ok(())
    }

    /// Run iterations for `seeds`, up to `workers` at a time.
    ///
    /// A failed iteration is logged and counted; it never stops the session.
    #[instrument(skip(self, seeds), fields(session = %self.id))]
    pub async fn run(&self, seeds: impl IntoIterator<Item = u64>) -> SessionSummary {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for seed in seeds {
            let semaphore = semaphore.clone();
            let session = self.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Infra(format!("worker pool closed: {}", e)))?;
                session.run_iteration(seed).await
            });
        }

        let mut summary = SessionSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(report)) => summary.add(&report),
                Ok(Err(e)) => {
                    error!(error = %e, "Iteration failed");
                    summary.failed_iterations += 1;
                }
                Err(e) => {
                    error!(error = %e, "Iteration panicked");
                    summary.failed_iterations += 1;
                }
            }
        }

        info!(
            iterations = summary.iterations,
            failed = summary.failed_iterations,
            findings = summary.findings,
            novel = summary.novel_buckets,
            "Session finished"
        );
        summary
    }
}
