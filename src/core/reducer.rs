//! Resumable reduction driver.
//!
//! A reduction phase is a chain artifact `<target>/reductions/<backend>/<phase>`
//! with one `step-NNNN` child per candidate. Each candidate is persisted before it
//! is tested and gets its verdict recorded afterwards, so the step artifacts
//! alone are enough to resume an interrupted chain.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::adapters::{Simplifier, TestCase};
use crate::domain::{
    ArtifactName, Complexity, Metadata, Outcome, Payload, Provenance, ReductionRecord,
    ReductionState, ReductionStep, RejectReason, Signature, Status, Verdict,
};
use crate::error::{Error, Result};
use crate::store::CreateMode;

use super::limits::ReductionLimits;
use super::orchestrator::{Job, Orchestrator};

/// What to reduce, where, and how
#[derive(Clone)]
pub struct ReductionRequest {
    /// Known-failing test case
    pub target: ArtifactName,
    pub backend: String,
    pub phase: String,

    /// Signature the chain must preserve; taken from a run of the target if unset
    pub signature: Option<Signature>,
    pub simplifier: Arc<dyn Simplifier>,
    pub limits: ReductionLimits,
}

impl std::fmt::Debug for ReductionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReductionRequest")
            .field("target", &self.target)
            .field("backend", &self.backend)
            .field("phase", &self.phase)
            .field("signature", &self.signature)
            .field("simplifier", &self.simplifier.name())
            .field("limits", &self.limits)
            .finish()
    }
}

/// Final state of a reduction phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReductionOutcome {
    pub chain: ArtifactName,
    pub state: ReductionState,
    pub signature: Signature,

    /// Smallest reproducer found; the target if nothing was accepted
    pub best: ArtifactName,
    pub best_complexity: Complexity,

    /// `best` no longer exists: it lost its bucket and was collected
    pub best_collected: bool,
    pub steps_taken: u32,
}

impl ReductionOutcome {
    fn from_record(chain: ArtifactName, record: &ReductionRecord) -> Self {
        Self {
            chain,
            state: record.state,
            signature: record.signature.clone(),
            best: record.best.clone(),
            best_complexity: record.best_complexity,
            best_collected: record.best_collected,
            steps_taken: record.steps_taken,
        }
    }
}

/// In-memory progress of a chain
#[derive(Debug, Clone)]
struct Progress {
    best: ArtifactName,
    best_complexity: Complexity,
    steps_taken: u32,
    consecutive_rejects: u32,
}

impl Progress {
    fn apply(&mut self, step: &ArtifactName, record: &ReductionStep) {
        self.steps_taken += 1;
        match record.verdict {
            Verdict::Accepted => {
                self.best = step.clone();
                self.best_complexity = record.complexity;
                self.consecutive_rejects = 0;
            }
            Verdict::Rejected { .. } | Verdict::Pending => self.consecutive_rejects += 1,
        }
    }
}

/// Drives reduction chains through the orchestrator
#[derive(Debug, Clone)]
pub struct ReductionDriver {
    orchestrator: Orchestrator,
}

impl ReductionDriver {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn chain_name(target: &ArtifactName, backend: &str, phase: &str) -> Result<ArtifactName> {
        target.child("reductions")?.child(backend)?.child(phase)
    }

    /// Refuse a stored chain recorded for another backend or signature
    fn check_chain(
        request: &ReductionRequest,
        chain: &ArtifactName,
        record: &ReductionRecord,
    ) -> Result<()> {
        let mismatch = |reason: String| Error::ChainMismatch {
            chain: chain.to_string(),
            reason,
        };
        if record.backend != request.backend || record.phase != request.phase {
            return Err(mismatch(format!(
                "recorded for {}/{}, requested {}/{}",
                record.backend, record.phase, request.backend, request.phase
            )));
        }
        match &request.signature {
            Some(signature) if *signature != record.signature => Err(mismatch(format!(
                "chain preserves {}, requested {}",
                record.signature, signature
            ))),
            _ => Ok(()),
        }
    }

    fn step_name(chain: &ArtifactName, index: u32) -> Result<ArtifactName> {
        chain.child(&format!("step-{:04}", index))
    }

    /// Reduce one phase, resuming the chain if it already exists
    #[instrument(skip(self, request), fields(target = %request.target, backend = %request.backend, phase = %request.phase))]
    pub async fn reduce(&self, request: &ReductionRequest) -> Result<ReductionOutcome> {
        let store = self.orchestrator.store();
        let chain = Self::chain_name(&request.target, &request.backend, &request.phase)?;

        let record = match store.read(&chain).await {
            Ok(existing) => {
                let record = existing
                    .metadata
                    .as_reduction()
                    .cloned()
                    .ok_or_else(|| Error::schema(&chain, "not a reduction chain"))?;
                Self::check_chain(request, &chain, &record)?;
                if record.state.is_finished() {
                    debug!("Chain already finished");
                    return Ok(ReductionOutcome::from_record(chain, &record));
                }
                info!("Resuming reduction");
                record
            }
            Err(Error::NotFound(_)) => self.start_chain(request, &chain).await?,
            Err(e) => return Err(e),
        };

        let mut progress = self.rebuild(request, &chain, &record).await?;

        loop {
            if progress.steps_taken >= request.limits.max_steps {
                return self
                    .finish(&chain, &progress, ReductionState::ExhaustedBudget)
                    .await;
            }
            if progress.consecutive_rejects >= request.limits.max_consecutive_rejects {
                return self.finish(&chain, &progress, ReductionState::Converged).await;
            }

            let best = TestCase::load(store, &store.read(&progress.best).await?).await?;
            let attempt = progress.consecutive_rejects;
            let candidate = request
                .simplifier
                .simplify(&best, attempt)
                .await
                .map_err(|e| Error::Infra(format!("simplifier {} failed: {:#}", request.simplifier.name(), e)))?;
            let Some(candidate) = candidate else {
                return self.finish(&chain, &progress, ReductionState::Converged).await;
            };

            let index = progress.steps_taken + 1;
            let step_name = Self::step_name(&chain, index)?;
            let step = ReductionStep {
                index,
                attempt,
                files: candidate.file_names(),
                expected_output: candidate.expected_output.as_ref().map(|f| f.name.clone()),
                complexity: candidate.complexity(),
                verdict: Verdict::Pending,
                observed: None,
                result: None,
            };
            let metadata = Metadata::new(
                Payload::ReductionStep(step.clone()),
                Provenance::derived(progress.best.clone(), request.simplifier.name())
                    .with_param("attempt", attempt),
            );
            let step = match store
                .create(&step_name, metadata, candidate.payload_files(), CreateMode::Exact)
                .await
            {
                Ok(_) => step,
                // Written by an interrupted or concurrent driver: test what is stored
                Err(Error::NameCollision(_)) => store
                    .read(&step_name)
                    .await?
                    .metadata
                    .as_reduction_step()
                    .cloned()
                    .ok_or_else(|| Error::schema(&step_name, "not a reduction step"))?,
                Err(e) => return Err(e),
            };

            let step = match step.verdict {
                Verdict::Pending => {
                    self.evaluate(request, &record.signature, &progress, &step_name, step)
                        .await?
                }
                _ => step,
            };
            progress.apply(&step_name, &step);
            self.save_progress(&chain, &progress).await?;
        }
    }

    /// Test the target and create the chain record
    async fn start_chain(
        &self,
        request: &ReductionRequest,
        chain: &ArtifactName,
    ) -> Result<ReductionRecord> {
        let store = self.orchestrator.store();
        let result = self
            .orchestrator
            .run(&Job::new(request.target.clone(), request.backend.clone()))
            .await?;
        let signature = match (&result.signature, result.is_finding()) {
            (Some(signature), true) => signature.clone(),
            _ => return Err(Error::NotReducible(request.target.to_string())),
        };
        if let Some(expected) = &request.signature {
            if *expected != signature {
                warn!(%expected, observed = %signature, "Target reproduces a different failure");
                return Err(Error::NotReducible(request.target.to_string()));
            }
        }

        let target = TestCase::load(store, &store.read(&request.target).await?).await?;
        let record = ReductionRecord {
            target: request.target.clone(),
            backend: request.backend.clone(),
            phase: request.phase.clone(),
            signature,
            state: ReductionState::Proposing,
            best: request.target.clone(),
            best_complexity: target.complexity(),
            best_collected: false,
            steps_taken: 0,
            consecutive_rejects: 0,
            max_steps: request.limits.max_steps,
            max_consecutive_rejects: request.limits.max_consecutive_rejects,
        };
        let metadata = Metadata::new(
            Payload::Reduction(record.clone()),
            Provenance::derived(request.target.clone(), request.simplifier.name())
                .with_param("phase", &request.phase),
        )
        .with_status(Status::Running);

        match store.create(chain, metadata, Vec::new(), CreateMode::Exact).await {
            Ok(_) => {
                info!(signature = %record.signature, "Reduction started");
                Ok(record)
            }
            Err(Error::NameCollision(_)) => {
                let existing = store
                    .read(chain)
                    .await?
                    .metadata
                    .as_reduction()
                    .cloned()
                    .ok_or_else(|| Error::schema(chain, "not a reduction chain"))?;
                Self::check_chain(request, chain, &existing)?;
                Ok(existing)
            }
            Err(e) => Err(e),
        }
    }

    /// Replay the step artifacts, re-testing any left pending
    async fn rebuild(
        &self,
        request: &ReductionRequest,
        chain: &ArtifactName,
        record: &ReductionRecord,
    ) -> Result<Progress> {
        let store = self.orchestrator.store();
        let target = TestCase::load(store, &store.read(&record.target).await?).await?;
        let mut progress = Progress {
            best: record.target.clone(),
            best_complexity: target.complexity(),
            steps_taken: 0,
            consecutive_rejects: 0,
        };

        let mut steps = Vec::new();
        for artifact in store.list(Some(chain)).collect_valid().await? {
            if artifact.name.parent().as_ref() != Some(chain) {
                continue;
            }
            if let Some(step) = artifact.metadata.as_reduction_step() {
                steps.push((artifact.name.clone(), step.clone()));
            }
        }
        steps.sort_by_key(|(_, step)| step.index);

        for (name, step) in steps {
            let step = if step.verdict == Verdict::Pending {
                warn!(step = %name, "Re-testing pending step");
                self.evaluate(request, &record.signature, &progress, &name, step)
                    .await?
            } else {
                step
            };
            progress.apply(&name, &step);
        }
        Ok(progress)
    }

    /// Run a candidate and record its verdict on the step artifact
    async fn evaluate(
        &self,
        request: &ReductionRequest,
        signature: &Signature,
        progress: &Progress,
        step_name: &ArtifactName,
        mut step: ReductionStep,
    ) -> Result<ReductionStep> {
        let verdict = if step.complexity >= progress.best_complexity {
            step.observed = None;
            Verdict::Rejected {
                reason: RejectReason::NotSmaller,
            }
        } else {
            let result = self
                .orchestrator
                .run(&Job::new(step_name.clone(), request.backend.clone()))
                .await?;
            step.observed = result.signature.clone();
            step.result = Some(result.artifact.clone());

            match result.outcome {
                Outcome::InfraError => Verdict::Rejected {
                    reason: RejectReason::InfraError,
                },
                Outcome::Pass => Verdict::Rejected {
                    reason: RejectReason::Passed,
                },
                _ if result.signature.as_ref() != Some(signature) => Verdict::Rejected {
                    reason: RejectReason::DifferentSignature,
                },
                _ => Verdict::Accepted,
            }
        };
        step.verdict = verdict;

        let recorded = step.clone();
        self.orchestrator
            .store()
            .update_metadata(step_name, move |metadata| {
                metadata.status = match recorded.verdict {
                    Verdict::Accepted => Status::Interesting,
                    _ => Status::Completed,
                };
                metadata.payload = Payload::ReductionStep(recorded);
            })
            .await?;

        match verdict {
            Verdict::Accepted => info!(
                step = %step_name,
                lines = step.complexity.lines,
                bytes = step.complexity.bytes,
                "Candidate accepted"
            ),
            _ => debug!(step = %step_name, ?verdict, "Candidate rejected"),
        }
        Ok(step)
    }

    async fn save_progress(&self, chain: &ArtifactName, progress: &Progress) -> Result<()> {
        let progress = progress.clone();
        self.orchestrator
            .store()
            .update_metadata(chain, move |metadata| {
                if let Payload::Reduction(record) = &mut metadata.payload {
                    record.best = progress.best;
                    record.best_complexity = progress.best_complexity;
                    record.steps_taken = progress.steps_taken;
                    record.consecutive_rejects = progress.consecutive_rejects;
                }
            })
            .await?;
        Ok(())
    }

    async fn finish(
        &self,
        chain: &ArtifactName,
        progress: &Progress,
        state: ReductionState,
    ) -> Result<ReductionOutcome> {
        let finished = progress.clone();
        let artifact = self
            .orchestrator
            .store()
            .update_metadata(chain, move |metadata| {
                metadata.status = Status::Completed;
                if let Payload::Reduction(record) = &mut metadata.payload {
                    record.state = state;
                    record.best = finished.best;
                    record.best_complexity = finished.best_complexity;
                    record.steps_taken = finished.steps_taken;
                    record.consecutive_rejects = finished.consecutive_rejects;
                }
            })
            .await?;

        let record = artifact
            .metadata
            .as_reduction()
            .ok_or_else(|| Error::schema(chain, "not a reduction chain"))?;
        info!(
            state = ?record.state,
            steps = record.steps_taken,
            best = %record.best,
            lines = record.best_complexity.lines,
            "Reduction finished"
        );
        Ok(ReductionOutcome::from_record(chain.clone(), record))
    }

    /// Run phases in order, each reducing the previous phase's best.
    ///
    /// Every phase preserves `signature`, or the first phase's signature if unset.
    pub async fn reduce_phases(
        &self,
        target: &ArtifactName,
        backend: &str,
        signature: Option<&Signature>,
        phases: &[(String, Arc<dyn Simplifier>)],
        limits: ReductionLimits,
    ) -> Result<Vec<ReductionOutcome>> {
        let mut outcomes = Vec::with_capacity(phases.len());
        let mut current = target.clone();
        let mut signature = signature.cloned();
        for (phase, simplifier) in phases {
            let outcome = self
                .reduce(&ReductionRequest {
                    target: current.clone(),
                    backend: backend.to_string(),
                    phase: phase.clone(),
                    signature: signature.clone(),
                    simplifier: simplifier.clone(),
                    limits,
                })
                .await?;
            current = outcome.best.clone();
            signature = Some(outcome.signature.clone());
            let collected = outcome.best_collected;
            outcomes.push(outcome);
            if collected {
                debug!(best = %current, "Best reproducer was collected, later phases skipped");
                break;
            }
        }
        Ok(outcomes)
    }
}
