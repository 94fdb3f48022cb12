//! # Job State Machine
//!
//! Lifecycle of one unit of orchestrated work with validated transitions.
//!
//! ## Overview
//!
//! A [`JobItem`] is a single document to fetch or a single file to archive.
//! It is mutated only by the worker currently holding it and persisted through
//! the progress store after every transition, so an interrupted run can resume
//! exactly where it stopped.
//!
//! ## State Machine
//!
//! ```text
//! Pending → InFlight → Done
//!    ↑          │
//!    └──────────┤ (attempts < ceiling)
//!               ↓
//!             Failed (attempts reached ceiling)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_sync::job::{JobItem, JobState};
//!
//! let mut job = JobItem::download("https://example.org/doc/42");
//! job.claim()?;
//! job.complete()?;
//! assert_eq!(job.state, JobState::Done);
//! ```

use crate::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

// ============================================================================
// Status Types
// ============================================================================

/// Persisted state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed by a worker
    Pending,
    /// Claimed by a worker in the current run
    InFlight,
    /// Completed successfully
    Done,
    /// Gave up after reaching the attempt ceiling
    Failed,
}

impl JobState {
    /// Terminal states are never picked up again by the orchestrator
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::InFlight => "in_flight",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }
}

impl FromStr for JobState {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "in_flight" => Ok(JobState::InFlight),
            "done" => Ok(JobState::Done),
            "failed" => Ok(JobState::Failed),
            _ => Err(SyncError::Config(format!("Unknown job state: {}", s))),
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which worker pool handles a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Fetch a remote document to local disk
    #[default]
    Download,
    /// Archive a local file to the object store
    Upload,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Download => "download",
            JobKind::Upload => "upload",
        }
    }
}

impl FromStr for JobKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "download" => Ok(JobKind::Download),
            "upload" => Ok(JobKind::Upload),
            _ => Err(SyncError::Config(format!("Unknown job kind: {}", s))),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Job Entity
// ============================================================================

/// One unit of orchestrated work.
///
/// The key is the identity of the job and doubles as the map key in the
/// progress file, so it is not repeated inside the serialized record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobItem {
    /// Stable unique identifier (source URL, archive key, ...)
    #[serde(skip)]
    pub key: String,
    #[serde(default)]
    pub kind: JobKind,
    pub state: JobState,
    /// Number of times the job has been claimed
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Free-form values handed to the downloader/uploader
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Local file to archive (upload jobs)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

impl JobItem {
    pub fn new(key: impl Into<String>, kind: JobKind) -> Self {
        Self {
            key: key.into(),
            kind,
            state: JobState::Pending,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
            metadata: HashMap::new(),
            local_path: None,
        }
    }

    pub fn download(key: impl Into<String>) -> Self {
        Self::new(key, JobKind::Download)
    }

    pub fn upload(key: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        let mut job = Self::new(key, JobKind::Upload);
        job.local_path = Some(local_path.into());
        job
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Take the job for processing. Counts as one attempt.
    ///
    /// # Errors
    ///
    /// Returns an error unless the job is `Pending`
    pub fn claim(&mut self) -> Result<()> {
        self.validate_transition(JobState::InFlight)?;
        self.state = JobState::InFlight;
        self.attempts += 1;
        self.touch();
        Ok(())
    }

    /// Mark a claimed job as done and clear any previous error.
    pub fn complete(&mut self) -> Result<()> {
        self.validate_transition(JobState::Done)?;
        self.state = JobState::Done;
        self.last_error = None;
        self.touch();
        Ok(())
    }

    /// Record a failed attempt on a claimed job.
    ///
    /// `attempts` already includes the failed claim. The job goes back to
    /// `Pending` while `attempts < max_attempts` and becomes terminally
    /// `Failed` when `attempts == max_attempts`, so `max_attempts` is the
    /// total number of claims a job gets. Returns the resulting state.
    pub fn record_failure(&mut self, error: impl Into<String>, max_attempts: u32) -> Result<JobState> {
        let next = if self.attempts >= max_attempts {
            JobState::Failed
        } else {
            JobState::Pending
        };
        self.validate_transition(next)?;
        self.state = next;
        self.last_error = Some(error.into());
        self.touch();
        Ok(next)
    }

    /// Return a job left `InFlight` by a crashed run to `Pending`.
    ///
    /// Returns true if the state changed.
    pub fn reset_in_flight(&mut self) -> bool {
        if self.state != JobState::InFlight {
            return false;
        }
        self.state = JobState::Pending;
        self.touch();
        true
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn validate_transition(&self, to: JobState) -> Result<()> {
        let valid = matches!(
            (self.state, to),
            (JobState::Pending, JobState::InFlight)
                | (JobState::InFlight, JobState::Done)
                | (JobState::InFlight, JobState::Pending)
                | (JobState::InFlight, JobState::Failed)
        );

        if !valid {
            return Err(SyncError::InvalidStateTransition {
                from: self.state.as_str().to_string(),
                to: to.as_str().to_string(),
                reason: format!("Job {} cannot move from {} to {}", self.key, self.state, to),
            });
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
