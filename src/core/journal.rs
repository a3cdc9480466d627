//! Append-only job journal.
//!
//! One JSONL file per session under the store's `.journal/` directory. Every
//! job state transition is appended as an event; replaying the events gives
//! the state of each job. Result artifacts remain the source of truth for
//! outcomes; the journal records how the session got there.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use crate::domain::name::sanitize_segment;
use crate::domain::JobState;
use crate::error::{Error, Result};
use crate::store::ArtifactStore;

/// Kinds of journal events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventType {
    Queued,
    Started,

    /// Relaunch after an infrastructure failure
    Retrying,
    Finished,

    /// The result already existed; nothing ran
    Skipped,
}

/// A single journal entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,

    /// Result artifact name of the job
    pub job_id: String,

    pub event_type: JobEventType,
    pub state: JobState,
    pub attempt: u32,

    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl JobEvent {
    pub fn new(job_id: impl Into<String>, event_type: JobEventType, state: JobState) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            job_id: job_id.into(),
            event_type,
            state,
            attempt: 0,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Replayed state of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub job_id: String,
    pub state: JobState,
    pub attempts: u32,
    pub skipped: u32,
    pub last_error: Option<String>,
    pub duration_ms: Option<u64>,
}

impl JobRecord {
    /// Rebuild a job from its events; `None` if the job never appears
    pub fn from_events(job_id: &str, events: &[JobEvent]) -> Option<Self> {
        let mut record: Option<Self> = None;
        for event in events.iter().filter(|e| e.job_id == job_id) {
            record
                .get_or_insert_with(|| Self {
                    job_id: job_id.to_string(),
                    state: JobState::Queued,
                    attempts: 0,
                    skipped: 0,
                    last_error: None,
                    duration_ms: None,
                })
                .apply_event(event);
        }
        record
    }

    fn apply_event(&mut self, event: &JobEvent) {
        match event.event_type {
            JobEventType::Queued => {}
            JobEventType::Started | JobEventType::Retrying => {
                self.state = JobState::Running;
                self.attempts = self.attempts.max(event.attempt);
            }
            JobEventType::Finished => {
                self.state = event.state;
                self.duration_ms = event.duration_ms;
            }
            JobEventType::Skipped => {
                self.skipped += 1;
                self.state = event.state;
            }
        }
        if event.error.is_some() {
            self.last_error = event.error.clone();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }
}

/// JSONL journal file shared by every worker of a session
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    /// Open (creating lazily) the journal of a session
    pub async fn open(store: &ArtifactStore, session: &str) -> Result<Self> {
        let dir = store.journal_dir();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            path: dir.join(format!("{}.jsonl", sanitize_segment(session))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an event under the journal's exclusive lock
    pub async fn append(&self, event: &JobEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.lock_exclusive()?;
            file.write_all(&line)?;
            file.sync_data()?;
            file.unlock()?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Journal(format!("append worker failed: {}", e)))?
    }

    /// All events in append order
    pub async fn replay(&self) -> Result<Vec<JobEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: JobEvent = serde_json::from_str(&line)
                .map_err(|e| Error::Journal(format!("bad event '{}': {}", line, e)))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Replayed state of every job in the journal
    pub async fn records(&self) -> Result<BTreeMap<String, JobRecord>> {
        let events = self.replay().await?;
        let mut records = BTreeMap::new();
        for event in &events {
            if !records.contains_key(&event.job_id) {
                if let Some(record) = JobRecord::from_events(&event.job_id, &events) {
                    records.insert(event.job_id.clone(), record);
                }
            }
        }
        Ok(records)
    }

    /// Whether a job has reached a terminal state
    pub async fn is_job_finished(&self, job_id: &str) -> Result<bool> {
        let events = self.replay().await?;
        Ok(JobRecord::from_events(job_id, &events).map_or(false, |r| r.is_finished()))
    }
}
