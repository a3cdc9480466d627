//! Failure deduplication.
//!
//! Findings are filed under `buckets/<signature>`. The first finding of a
//! signature creates the bucket and is novel; later ones are duplicates. Each
//! bucket keeps one representative reproducer, replaced whenever a smaller
//! one (usually a reduction result) is offered.

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::domain::signature::NO_SIGNATURE;
use crate::domain::{
    signature_from_log, ArtifactName, BucketRecord, Complexity, FailureClass, Metadata, Outcome,
    Payload, Provenance, RunResult, Signature, Status,
};
use crate::error::{Error, Result};
use crate::store::{ArtifactStore, CreateMode};

/// Namespace holding every bucket
pub const BUCKETS: &str = "buckets";

/// Signature of an observed outcome; `None` unless the outcome is a finding
pub fn signature_of(outcome: Outcome, exit_code: Option<i32>, log: &str) -> Option<Signature> {
    let class = FailureClass::for_outcome(outcome)?;
    let signature = match class {
        FailureClass::Timeout => Signature::new(class, "none"),
        FailureClass::WrongImage => Signature::new(class, "mismatch"),
        FailureClass::Crash | FailureClass::HostCrash => {
            let detail = signature_from_log(log);
            if detail != NO_SIGNATURE {
                Signature::new(class, &detail)
            } else {
                match exit_code {
                    Some(code) => Signature::new(class, &format!("exit_{}", code)),
                    None => Signature::new(class, "signal"),
                }
            }
        }
    };
    Some(signature)
}

/// A reproducer competing for a bucket's representative slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contender {
    pub complexity: Complexity,
    pub discovered_at: DateTime<Utc>,
}

/// Smaller complexity wins; on a tie the earlier discovery wins
pub fn is_improvement(candidate: &Contender, representative: &Contender) -> bool {
    match candidate.complexity.cmp(&representative.complexity) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Equal => candidate.discovered_at < representative.discovered_at,
        std::cmp::Ordering::Greater => false,
    }
}

/// How a finding was filed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketDecision {
    pub bucket: ArtifactName,
    pub signature: Signature,

    /// The finding opened the bucket
    pub novel: bool,

    /// Position of the finding among the bucket's members (0 for the first)
    pub duplicate_index: usize,

    /// Below the duplicate quota: still worth reporting and reducing
    pub within_quota: bool,
}

/// Signature computation and bucket maintenance over the store
#[derive(Debug, Clone)]
pub struct SignatureEngine {
    store: ArtifactStore,
    max_duplicates: usize,
}

impl SignatureEngine {
    pub fn new(store: ArtifactStore, max_duplicates: usize) -> Self {
        Self {
            store,
            max_duplicates,
        }
    }

    /// Signature of a run; the stored one when the orchestrator recorded it
    pub fn signature(&self, result: &RunResult) -> Option<Signature> {
        result
            .signature
            .clone()
            .or_else(|| signature_of(result.outcome, result.exit_code, &result.log()))
    }

    pub fn bucket_name(signature: &Signature) -> Result<ArtifactName> {
        ArtifactName::parse(BUCKETS)?.child(&signature.to_string())
    }

    /// File `member` under `signature`.
    ///
    /// `reproducer` is the test case that produced the member; it becomes
    /// the representative of a new bucket. Filing is idempotent.
    #[instrument(skip(self, complexity), fields(signature = %signature, member = %member))]
    pub async fn classify(
        &self,
        signature: &Signature,
        member: &ArtifactName,
        reproducer: &ArtifactName,
        complexity: Complexity,
    ) -> Result<BucketDecision> {
        let bucket = Self::bucket_name(signature)?;

        let record = BucketRecord {
            signature: signature.clone(),
            representative: reproducer.clone(),
            representative_complexity: complexity,
            representative_discovered_at: Utc::now(),
            members: vec![member.clone()],
            superseded: Vec::new(),
        };
        let metadata = Metadata::new(
            Payload::Bucket(record),
            Provenance::derived(member.clone(), "dedup"),
        )
        .with_status(Status::Interesting);

        match self
            .store
            .create(&bucket, metadata, Vec::new(), CreateMode::Exact)
            .await
        {
            Ok(_) => {
                info!("New bucket");
                return Ok(self.decision(bucket, signature, 0));
            }
            // Existing bucket, possibly created by a concurrent worker
            Err(Error::NameCollision(_)) => {}
            Err(e) => return Err(e),
        }

        let existing = self.bucket(signature).await?;
        if let Some(index) = existing.members.iter().position(|m| m == member) {
            return Ok(self.decision(bucket, signature, index));
        }

        let label = bucket.to_string();
        let new_member = member.clone();
        let (_, index) = self
            .store
            .update_metadata_with(&bucket, move |metadata| {
                let Payload::Bucket(record) = &mut metadata.payload else {
                    return Err(Error::schema(&label, "not a bucket"));
                };
                if let Some(index) = record.members.iter().position(|m| *m == new_member) {
                    return Ok(index);
                }
                record.members.push(new_member);
                Ok(record.members.len() - 1)
            })
            .await?;

        debug!(duplicate_index = index, "Duplicate finding");
        Ok(self.decision(bucket, signature, index))
    }

    fn decision(&self, bucket: ArtifactName, signature: &Signature, index: usize) -> BucketDecision {
        BucketDecision {
            bucket,
            signature: signature.clone(),
            novel: index == 0,
            duplicate_index: index,
            within_quota: index < self.max_duplicates,
        }
    }

    /// Current record of a bucket
    pub async fn bucket(&self, signature: &Signature) -> Result<BucketRecord> {
        let name = Self::bucket_name(signature)?;
        let artifact = self.store.read(&name).await?;
        artifact
            .metadata
            .as_bucket()
            .cloned()
            .ok_or_else(|| Error::schema(&name, "not a bucket"))
    }

    /// Every bucket in the store, by signature
    pub async fn buckets(&self) -> Result<Vec<BucketRecord>> {
        let prefix = ArtifactName::parse(BUCKETS)?;
        let artifacts = self.store.list(Some(&prefix)).collect_valid().await?;
        Ok(artifacts
            .into_iter()
            .filter_map(|a| a.metadata.as_bucket().cloned())
            .collect())
    }

    /// Make `candidate` the representative if it improves on the current one.
    ///
    /// Returns whether it was installed. The replaced representative is kept
    /// in the superseded list until garbage collection.
    #[instrument(skip(self, contender), fields(signature = %signature, candidate = %candidate))]
    pub async fn offer_representative(
        &self,
        signature: &Signature,
        candidate: &ArtifactName,
        contender: Contender,
    ) -> Result<bool> {
        let current = self.bucket(signature).await?;
        let incumbent = Contender {
            complexity: current.representative_complexity,
            discovered_at: current.representative_discovered_at,
        };
        if current.representative == *candidate || !is_improvement(&contender, &incumbent) {
            return Ok(false);
        }

        let bucket = Self::bucket_name(signature)?;
        let label = bucket.to_string();
        let candidate_name = candidate.clone();
        let (_, installed) = self
            .store
            .update_metadata_with(&bucket, move |metadata| {
                let Payload::Bucket(record) = &mut metadata.payload else {
                    return Err(Error::schema(&label, "not a bucket"));
                };
                // Re-check under the lock
                let incumbent = Contender {
                    complexity: record.representative_complexity,
                    discovered_at: record.representative_discovered_at,
                };
                if record.representative == candidate_name || !is_improvement(&contender, &incumbent)
                {
                    return Ok(false);
                }
                let previous = std::mem::replace(&mut record.representative, candidate_name);
                if !record.superseded.contains(&previous) {
                    record.superseded.push(previous);
                }
                record.representative_complexity = contender.complexity;
                record.representative_discovered_at = contender.discovered_at;
                Ok(true)
            })
            .await?;

        if installed {
            info!(
                lines = contender.complexity.lines,
                bytes = contender.complexity.bytes,
                "New representative"
            );
        }
        Ok(installed)
    }

    /// Delete superseded representatives.
    ///
    /// An artifact that contains the current representative or a member is
    /// kept and stays listed. Returns the removed names.
    #[instrument(skip(self), fields(signature = %signature))]
    pub async fn collect_garbage(&self, signature: &Signature) -> Result<Vec<ArtifactName>> {
        let record = self.bucket(signature).await?;

        let mut removed = Vec::new();
        for old in &record.superseded {
            let pinned = record.representative.starts_with(old)
                || record.members.iter().any(|m| m.starts_with(old));
            if pinned {
                debug!(artifact = %old, "Superseded representative still referenced");
                continue;
            }
            match self.store.remove(old).await {
                Ok(()) | Err(Error::NotFound(_)) => removed.push(old.clone()),
                Err(e) => return Err(e),
            }
            self.mark_chain_best_collected(old).await?;
        }

        if !removed.is_empty() {
            let bucket = Self::bucket_name(signature)?;
            let gone = removed.clone();
            self.store
                .update_metadata(&bucket, move |metadata| {
                    if let Payload::Bucket(record) = &mut metadata.payload {
                        record.superseded.retain(|s| !gone.contains(s));
                    }
                })
                .await?;
            info!(removed = removed.len(), "Collected superseded representatives");
        }
        Ok(removed)
    }

    /// Flag the reduction chain whose best reproducer was `removed`
    async fn mark_chain_best_collected(&self, removed: &ArtifactName) -> Result<()> {
        let Some(chain) = removed.parent() else {
            return Ok(());
        };
        let produced_it = match self.store.read(&chain).await {
            Ok(artifact) => artifact
                .metadata
                .as_reduction()
                .is_some_and(|record| record.best == *removed),
            Err(e) if e.is_artifact_local() => false,
            Err(e) => return Err(e),
        };
        if !produced_it {
            return Ok(());
        }

        let best = removed.clone();
        self.store
            .update_metadata(&chain, move |metadata| {
                if let Payload::Reduction(record) = &mut metadata.payload {
                    if record.best == best {
                        record.best_collected = true;
                    }
                }
            })
            .await?;
        debug!(chain = %chain, "Marked collected best on reduction chain");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_signature_of_outcomes() {
        assert_eq!(signature_of(Outcome::Pass, Some(0), ""), None);
        assert_eq!(signature_of(Outcome::InfraError, None, ""), None);
        assert_eq!(
            signature_of(Outcome::Timeout, None, "anything").unwrap().to_string(),
            "timeout.none"
        );
        assert_eq!(
            signature_of(Outcome::WrongImage, Some(0), "").unwrap().to_string(),
            "wrong_image.mismatch"
        );
        assert_eq!(
            signature_of(Outcome::Crash, Some(1), "ERROR: Shader compilation failed")
                .unwrap()
                .to_string(),
            "crash.compile_error"
        );
        assert_eq!(
            signature_of(Outcome::HostCrash, Some(2), "nothing useful")
                .unwrap()
                .to_string(),
            "host_crash.exit_2"
        );
        assert_eq!(
            signature_of(Outcome::Crash, None, "").unwrap().to_string(),
            "crash.signal"
        );
    }

    #[test]
    fn test_is_improvement() {
        let now = Utc::now();
        let rep = Contender {
            complexity: Complexity { lines: 10, bytes: 100 },
            discovered_at: now,
        };

        let smaller = Contender {
            complexity: Complexity { lines: 9, bytes: 500 },
            discovered_at: now + Duration::seconds(5),
        };
        assert!(is_improvement(&smaller, &rep));
        assert!(!is_improvement(&rep, &smaller));

        let tie_earlier = Contender {
            discovered_at: now - Duration::seconds(1),
            ..rep
        };
        assert!(is_improvement(&tie_earlier, &rep));
        assert!(!is_improvement(&rep, &rep));
    }
}
