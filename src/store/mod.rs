//! Filesystem-backed artifact store.
//!
//! The directory tree under the store root mirrors artifact names. An
//! artifact is a directory holding `metadata.json` plus flat payload files;
//! a directory without `metadata.json` is only a namespace. Dot-prefixed
//! entries belong to the store itself:
//!
//! - `.staging/` - private directories of in-flight creates
//! - `.trash/`   - directories being removed
//! - `.journal/` - job journals (see `core::journal`)
//! - `<artifact>/.lock` - per-artifact revision lock
//!
//! Every create is staged privately and published with a single rename, so a
//! crash mid-write never leaves a partially visible artifact.

mod listing;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use fs2::FileExt;
use glob::{MatchOptions, Pattern};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::name::validate_segment;
use crate::domain::{ArtifactName, Metadata};
use crate::error::{Error, Result};

pub use listing::Listing;

/// Name of the metadata record inside an artifact directory
pub const METADATA_FILE: &str = "metadata.json";

pub const STAGING_DIR: &str = ".staging";
pub const TRASH_DIR: &str = ".trash";
pub const JOURNAL_DIR: &str = ".journal";
const LOCK_FILE: &str = ".lock";
const CORRUPT_SUFFIX: &str = ".corrupt";

/// Upper bound on `-N` suffixes tried for a unique name
const MAX_UNIQUE_SUFFIX: u32 = 10_000;

/// A committed artifact
#[derive(Debug, Clone)]
pub struct Artifact {
    pub name: ArtifactName,
    pub metadata: Metadata,

    /// Directory holding the artifact
    pub dir: PathBuf,
}

impl Artifact {
    /// Path of a payload file
    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }
}

/// A payload file to store with a new artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFile {
    /// Flat file name inside the artifact directory
    pub name: String,
    pub contents: Vec<u8>,
}

impl PayloadFile {
    pub fn new(name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }
}

/// How `create` chooses the final name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// `<hint>-<content hash>`, suffixed with `-N` on collision
    Unique,

    /// Exactly the hint; fails with `NameCollision` if taken
    Exact,

    /// Exactly the hint, replacing an existing artifact's own files
    Overwrite,
}

/// Points on the write path where a fault can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePhase {
    StagingCreated,
    FilesWritten,
    MetadataWritten,
    BeforeCommit,
}

/// Hook called at each [`WritePhase`]; returning an error aborts the write
pub type FaultInjector = Arc<dyn Fn(WritePhase) -> std::io::Result<()> + Send + Sync>;

/// Content- and path-addressed artifact repository
#[derive(Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    fault: Option<FaultInjector>,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("root", &self.root)
            .field("fault_injection", &self.fault.is_some())
            .finish()
    }
}

impl ArtifactStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for internal in [STAGING_DIR, TRASH_DIR, JOURNAL_DIR] {
            fs::create_dir_all(root.join(internal)).await?;
        }
        Ok(Self { root, fault: None })
    }

    /// Open the store configured in `.shadertriage/config.yaml` or the environment
    pub async fn open_default() -> anyhow::Result<Self> {
        let root = crate::config::store_dir()?;
        Ok(Self::open(root).await?)
    }

    /// Install a fault injection hook on the write path
    pub fn with_fault_injector(mut self, injector: FaultInjector) -> Self {
        self.fault = Some(injector);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.root.join(JOURNAL_DIR)
    }

    /// Directory an artifact lives (or would live) in
    pub fn path_of(&self, name: &ArtifactName) -> PathBuf {
        name.to_path(&self.root)
    }

    pub fn exists(&self, name: &ArtifactName) -> bool {
        self.path_of(name).join(METADATA_FILE).is_file()
    }

    fn inject(&self, phase: WritePhase) -> Result<()> {
        if let Some(fault) = &self.fault {
            fault(phase)?;
        }
        Ok(())
    }

    /// Create an artifact atomically.
    ///
    /// Files and metadata are written to a private staging directory and
    /// published with one rename; nothing is visible until that rename.
    pub async fn create(
        &self,
        hint: &ArtifactName,
        metadata: Metadata,
        files: Vec<PayloadFile>,
        mode: CreateMode,
    ) -> Result<Artifact> {
        for file in &files {
            if file.name == METADATA_FILE {
                return Err(Error::InvalidName {
                    name: file.name.clone(),
                    reason: "reserved for the metadata record".to_string(),
                });
            }
            validate_segment(&file.name).map_err(|reason| Error::InvalidName {
                name: file.name.clone(),
                reason: reason.to_string(),
            })?;
        }

        let staging = tempfile::Builder::new()
            .prefix("create-")
            .tempdir_in(self.root.join(STAGING_DIR))?;
        self.inject(WritePhase::StagingCreated)?;

        for file in &files {
            write_synced(&staging.path().join(&file.name), &file.contents).await?;
        }
        self.inject(WritePhase::FilesWritten)?;

        let encoded = metadata.encode()?;
        write_synced(&staging.path().join(METADATA_FILE), &encoded).await?;
        self.inject(WritePhase::MetadataWritten)?;

        let name = match mode {
            CreateMode::Exact | CreateMode::Overwrite => {
                self.inject(WritePhase::BeforeCommit)?;
                self.commit(staging.path(), hint, mode == CreateMode::Overwrite)
                    .await?;
                hint.clone()
            }
            CreateMode::Unique => {
                let base = format!("{}-{}", hint.leaf(), content_hash(&metadata, &files)?);
                let mut committed = None;
                for suffix in 0..MAX_UNIQUE_SUFFIX {
                    let leaf = if suffix == 0 {
                        base.clone()
                    } else {
                        format!("{}-{}", base, suffix)
                    };
                    let candidate = hint.with_leaf(&leaf)?;
                    self.inject(WritePhase::BeforeCommit)?;
                    match self.commit(staging.path(), &candidate, false).await {
                        Ok(()) => {
                            committed = Some(candidate);
                            break;
                        }
                        Err(Error::NameCollision(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
                committed.ok_or_else(|| {
                    Error::Infra(format!("no free unique name under {}", hint))
                })?
            }
        };

        debug!(artifact = %name, kind = metadata.kind(), "Artifact committed");

        Ok(Artifact {
            dir: self.path_of(&name),
            name,
            metadata,
        })
    }

    /// Publish a staged directory under `name`
    async fn commit(&self, staged: &Path, name: &ArtifactName, overwrite: bool) -> Result<()> {
        let target = self.path_of(name);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        if !target.exists() {
            match fs::rename(staged, &target).await {
                Ok(()) => return Ok(()),
                // Lost a race or the target is a namespace: fall through to merge
                Err(_) if target.exists() => {}
                Err(e) => return Err(e.into()),
            }
        }

        let staged = staged.to_path_buf();
        let label = name.to_string();
        blocking(move || merge_commit(&staged, &target, &label, overwrite)).await
    }

    /// Read an artifact's current metadata
    pub async fn read(&self, name: &ArtifactName) -> Result<Artifact> {
        let dir = self.path_of(name);
        let bytes = match fs::read(dir.join(METADATA_FILE)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let metadata = Metadata::decode(&bytes, &name.to_string())?;
        Ok(Artifact {
            name: name.clone(),
            metadata,
            dir,
        })
    }

    /// Write a new metadata revision
    pub async fn update_metadata<F>(&self, name: &ArtifactName, mutator: F) -> Result<Artifact>
    where
        F: FnOnce(&mut Metadata) + Send + 'static,
    {
        let (artifact, ()) = self
            .update_metadata_with(name, move |metadata| {
                mutator(metadata);
                Ok(())
            })
            .await?;
        Ok(artifact)
    }

    /// Write a new metadata revision computed by a fallible mutator.
    ///
    /// The read-modify-write runs under the artifact's exclusive lock. If
    /// the mutator fails nothing is written.
    pub async fn update_metadata_with<F, R>(
        &self,
        name: &ArtifactName,
        mutator: F,
    ) -> Result<(Artifact, R)>
    where
        F: FnOnce(&mut Metadata) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let dir = self.path_of(name);
        let label = name.to_string();
        let fault = self.fault.clone();

        let (metadata, value) = blocking(move || {
            let record = dir.join(METADATA_FILE);
            if !record.is_file() {
                return Err(Error::NotFound(label));
            }

            let lock = lock_dir(&dir)?;

            let bytes = std::fs::read(&record)?;
            let mut metadata = Metadata::decode(&bytes, &label)?;
            let value = mutator(&mut metadata)?;
            metadata.revision += 1;
            metadata.updated_at = Utc::now();

            let tmp = dir.join(format!(".{}.{}.tmp", METADATA_FILE, Uuid::new_v4()));
            write_synced_blocking(&tmp, &metadata.encode()?)?;
            if let Some(fault) = &fault {
                if let Err(e) = fault(WritePhase::BeforeCommit) {
                    let _ = std::fs::remove_file(&tmp);
                    return Err(e.into());
                }
            }
            std::fs::rename(&tmp, &record)?;

            drop(lock);
            Ok((metadata, value))
        })
        .await?;

        Ok((
            Artifact {
                name: name.clone(),
                metadata,
                dir: self.path_of(name),
            },
            value,
        ))
    }

    /// Lazily list artifacts at or under `prefix` (everything if `None`), by name
    pub fn list(&self, prefix: Option<&ArtifactName>) -> Listing {
        Listing::new(self.clone(), prefix.cloned(), None)
    }

    /// Resume a listing strictly after `cursor`
    pub fn list_after(&self, prefix: Option<&ArtifactName>, cursor: &ArtifactName) -> Listing {
        Listing::new(self.clone(), prefix.cloned(), Some(cursor.clone()))
    }

    /// Artifacts whose names match a glob; `*` does not cross `/`
    pub async fn find(&self, pattern: &str) -> Result<Vec<Artifact>> {
        let pattern = Pattern::new(pattern).map_err(|e| Error::InvalidName {
            name: pattern.to_string(),
            reason: e.to_string(),
        })?;
        let options = MatchOptions {
            require_literal_separator: true,
            ..Default::default()
        };

        let mut found = Vec::new();
        let mut listing = self.list(None);
        while let Some(item) = listing.next().await {
            match item {
                Ok(artifact) => {
                    if pattern.matches_with(&artifact.name.to_string(), options) {
                        found.push(artifact);
                    }
                }
                Err(e) if e.is_artifact_local() => {
                    warn!(error = %e, "Skipping unreadable artifact");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    pub fn payload_path(&self, name: &ArtifactName, file: &str) -> PathBuf {
        self.path_of(name).join(file)
    }

    pub async fn read_payload(&self, name: &ArtifactName, file: &str) -> Result<Vec<u8>> {
        match fs::read(self.payload_path(name, file)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("{}/{}", name, file)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Payload file names of an artifact, sorted
    pub async fn payload_files(&self, name: &ArtifactName) -> Result<Vec<String>> {
        let dir = self.path_of(name);
        if !dir.join(METADATA_FILE).is_file() {
            return Err(Error::NotFound(name.to_string()));
        }

        let mut files = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(file) = entry.file_name().to_str() {
                if file != METADATA_FILE && !file.starts_with('.') && !file.ends_with(CORRUPT_SUFFIX)
                {
                    files.push(file.to_string());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Hide an artifact whose metadata cannot be decoded.
    ///
    /// The record is renamed to `metadata.json.corrupt`; payload files and
    /// child artifacts stay in place for inspection.
    pub async fn quarantine(&self, name: &ArtifactName) -> Result<()> {
        let dir = self.path_of(name);
        let record = dir.join(METADATA_FILE);
        if !record.is_file() {
            return Err(Error::NotFound(name.to_string()));
        }
        fs::rename(&record, dir.join(format!("{}{}", METADATA_FILE, CORRUPT_SUFFIX))).await?;
        warn!(artifact = %name, "Artifact quarantined");
        Ok(())
    }

    /// Delete an artifact and everything below it
    pub async fn remove(&self, name: &ArtifactName) -> Result<()> {
        let dir = self.path_of(name);
        if !dir.join(METADATA_FILE).is_file() {
            return Err(Error::NotFound(name.to_string()));
        }

        // The rename makes the whole subtree disappear at once
        let trash = self.root.join(TRASH_DIR).join(Uuid::new_v4().to_string());
        fs::rename(&dir, &trash).await?;
        fs::remove_dir_all(&trash).await?;
        debug!(artifact = %name, "Artifact removed");
        Ok(())
    }

    /// Delete staging and trash directories older than `older_than`.
    ///
    /// These are left behind only by writers that crashed mid-operation.
    pub async fn sweep_staging(&self, older_than: Duration) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;

        for internal in [STAGING_DIR, TRASH_DIR] {
            let mut entries = match fs::read_dir(self.root.join(internal)).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let modified = entry.metadata().await?.modified()?;
                if modified > cutoff {
                    continue;
                }
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    fs::remove_dir_all(&path).await?;
                } else {
                    fs::remove_file(&path).await?;
                }
                removed += 1;
            }
        }

        if removed > 0 {
            warn!(removed, "Swept abandoned staging entries");
        }
        Ok(removed)
    }
}

/// Merge a staged directory into an existing target directory.
///
/// Runs under the target's lock. Payload files move first and the metadata
/// record last; its rename is the commit point.
fn merge_commit(staged: &Path, target: &Path, label: &str, overwrite: bool) -> Result<()> {
    let lock = lock_dir(target)?;

    let record = target.join(METADATA_FILE);
    if record.is_file() {
        if !overwrite {
            return Err(Error::NameCollision(label.to_string()));
        }
        // Unpublish first so readers never see old metadata with new files
        std::fs::remove_file(&record)?;
        for entry in std::fs::read_dir(target)? {
            let entry = entry?;
            let is_payload = entry.file_type()?.is_file()
                && !entry.file_name().to_string_lossy().starts_with('.');
            if is_payload {
                std::fs::remove_file(entry.path())?;
            }
        }
    }

    for entry in std::fs::read_dir(staged)? {
        let entry = entry?;
        if entry.file_name() != METADATA_FILE {
            std::fs::rename(entry.path(), target.join(entry.file_name()))?;
        }
    }
    std::fs::rename(staged.join(METADATA_FILE), &record)?;

    drop(lock);
    Ok(())
}

/// Take the exclusive lock of an artifact directory
fn lock_dir(dir: &Path) -> Result<std::fs::File> {
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(LOCK_FILE))?;
    lock.lock_exclusive()?;
    Ok(lock)
}

async fn write_synced(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    Ok(())
}

fn write_synced_blocking(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

/// Run blocking filesystem work off the async runtime
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Infra(format!("store worker failed: {}", e)))?
}

/// First 12 hex chars of a SHA-256 over the payload kind, payload and files
fn content_hash(metadata: &Metadata, files: &[PayloadFile]) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(metadata.kind().as_bytes());
    // Only the payload: timestamps and provenance live in the envelope
    let record: serde_json::Value = serde_json::from_slice(&metadata.encode()?)?;
    hasher.update(serde_json::to_vec(&record["payload"])?);
    for file in files {
        hasher.update(file.name.as_bytes());
        hasher.update((file.contents.len() as u64).to_le_bytes());
        hasher.update(&file.contents);
    }
    Ok(hex::encode(&hasher.finalize()[..6]))
}
