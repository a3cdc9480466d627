//! Lazy, ordered, restartable artifact listing.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::warn;

use super::{Artifact, ArtifactStore, METADATA_FILE};
use crate::domain::name::validate_segment;
use crate::domain::ArtifactName;
use crate::error::{Error, Result};

/// Depth-first walk of the store tree in segment-wise name order.
///
/// Directories are read only as the walk reaches them. Artifacts created or
/// removed during the walk may or may not be seen, but every artifact that
/// exists for the whole walk is yielded exactly once.
pub struct Listing {
    store: ArtifactStore,
    prefix: Option<ArtifactName>,
    cursor: Option<ArtifactName>,

    /// Directories still to visit; the last entry is visited next
    pending: Vec<(ArtifactName, PathBuf)>,
    started: bool,
}

impl Listing {
    pub(super) fn new(
        store: ArtifactStore,
        prefix: Option<ArtifactName>,
        cursor: Option<ArtifactName>,
    ) -> Self {
        Self {
            store,
            prefix,
            cursor,
            pending: Vec::new(),
            started: false,
        }
    }

    /// Name of the last artifact yielded; pass it to `list_after` to resume
    pub fn cursor(&self) -> Option<&ArtifactName> {
        self.cursor.as_ref()
    }

    /// Next artifact, `None` when the walk is done.
    ///
    /// An artifact whose metadata cannot be decoded is yielded as an error;
    /// the walk continues after it.
    pub async fn next(&mut self) -> Option<Result<Artifact>> {
        if !self.started {
            self.started = true;
            match self.prefix.clone() {
                Some(prefix) => {
                    if !self.skipped_by_cursor(&prefix) {
                        let dir = self.store.path_of(&prefix);
                        self.pending.push((prefix, dir));
                    }
                }
                None => {
                    let root = self.store.root().to_path_buf();
                    if let Err(e) = self.push_children(None, &root).await {
                        return Some(Err(e));
                    }
                }
            }
        }

        while let Some((name, dir)) = self.pending.pop() {
            if let Err(e) = self.push_children(Some(&name), &dir).await {
                return Some(Err(e));
            }

            let after_cursor = self.cursor.as_ref().map_or(true, |cursor| &name > cursor);
            if !after_cursor || !dir.join(METADATA_FILE).is_file() {
                continue;
            }

            self.cursor = Some(name.clone());
            match self.store.read(&name).await {
                Ok(artifact) => return Some(Ok(artifact)),
                // Removed since we looked
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }

    /// Drain the listing, skipping artifacts with unreadable metadata
    pub async fn collect_valid(mut self) -> Result<Vec<Artifact>> {
        let mut artifacts = Vec::new();
        while let Some(item) = self.next().await {
            match item {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) if e.is_artifact_local() => {
                    warn!(error = %e, "Skipping unreadable artifact");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(artifacts)
    }

    /// A subtree that sorts entirely before the cursor
    fn skipped_by_cursor(&self, name: &ArtifactName) -> bool {
        match &self.cursor {
            Some(cursor) => name < cursor && !cursor.starts_with(name),
            None => false,
        }
    }

    async fn push_children(&mut self, parent: Option<&ArtifactName>, dir: &Path) -> Result<()> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(segment) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            // Store internals and anything that is not a valid name
            if validate_segment(&segment).is_err() {
                continue;
            }
            let name = match parent {
                Some(parent) => parent.child(&segment)?,
                None => ArtifactName::parse(&segment)?,
            };
            if !self.skipped_by_cursor(&name) {
                children.push((name, entry.path()));
            }
        }

        children.sort_by(|a, b| b.0.cmp(&a.0));
        self.pending.extend(children);
        Ok(())
    }
}
