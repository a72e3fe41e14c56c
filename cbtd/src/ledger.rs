//! Authoritative job ledger.
//!
//! Holds revisions, jobs and their results behind a single lock. Every
//! state transition, including the lease, is a conditional update made
//! while that lock is held, so concurrent callers never observe or produce
//! a half-applied change.
//!
//! With persistence enabled, revisions and jobs live in a JSON snapshot
//! that is rewritten when they change, while results are appended to a
//! line-delimited journal next to it. A change is only visible once it has
//! reached disk; a failed write leaves the in-memory state untouched and
//! surfaces as [`LedgerError::Persist`].

use cbt_common::{
    CtsSubmission, ErrorCode, JobBody, JobId, JobStatus, LitResult, Revision, RevisionBody,
    StatusUpdate, TestGroups,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("revision {0} not found")]
    UnknownRevision(String),

    #[error("job {id} cannot be cancelled while {status}")]
    NotCancellable { id: JobId, status: JobStatus },

    #[error("failed to load ledger state {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("failed to persist ledger state to {path}: {reason}")]
    Persist { path: PathBuf, reason: String },
}

impl LedgerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::JobNotFound(_) => ErrorCode::LedgerJobNotFound,
            Self::UnknownRevision(_) => ErrorCode::LedgerUnknownRevision,
            Self::NotCancellable { .. } => ErrorCode::LedgerJobNotCancellable,
            Self::Load { .. } => ErrorCode::InternalStateLoad,
            Self::Persist { .. } => ErrorCode::InternalStatePersist,
        }
    }

    fn persist(path: &Path, err: impl std::fmt::Display) -> Self {
        let err = Self::Persist {
            path: path.to_path_buf(),
            reason: err.to_string(),
        };
        error!(error_code = %err.code().code_string(), "{}", err);
        err
    }
}

/// A job as stored by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub revision_hash: String,
    /// The job created automatically for the revision.
    pub primary: bool,
    pub groups: TestGroups,
    pub status: JobStatus,
    #[serde(default)]
    pub status_details: String,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub dispatch_runner: Option<String>,
}

impl JobRecord {
    /// Wire representation returned to runners.
    pub fn to_body(&self) -> JobBody {
        JobBody {
            id: self.id,
            revision_hash: self.revision_hash.clone(),
            status: self.status,
            status_details: self.status_details.clone(),
            groups: self.groups.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredLitResult {
    pub id: u64,
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
    pub result: LitResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCtsResult {
    pub id: u64,
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
    pub submission: CtsSubmission,
    /// Name of the stored dump blob, relative to the media directory.
    pub dump: Option<String>,
}

/// Outcome of a runner status write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    Applied(JobRecord),
    /// The requested transition is not a runner edge; the job is unchanged.
    Ignored {
        job: JobRecord,
        requested: JobStatus,
    },
}

impl StatusChange {
    pub fn job(&self) -> &JobRecord {
        match self {
            Self::Applied(job) | Self::Ignored { job, .. } => job,
        }
    }
}

/// Counts by status, for the health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub revisions: usize,
    pub queued: usize,
    pub dispatched: usize,
    pub testing: usize,
    pub completed: usize,
    pub build_failed: usize,
    pub skipped: usize,
    pub lit_results: usize,
    pub cts_results: usize,
}

/// The snapshot part of the state: rewritten as a whole on change.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Tables {
    revisions: BTreeMap<String, Revision>,
    jobs: BTreeMap<JobId, JobRecord>,
    next_job_id: u64,
}

impl Tables {
    fn allocate_job_id(&mut self) -> JobId {
        self.next_job_id = self.next_job_id.max(1);
        let id = JobId(self.next_job_id);
        self.next_job_id += 1;
        id
    }

    fn job_mut(&mut self, id: JobId) -> Result<&mut JobRecord, LedgerError> {
        self.jobs.get_mut(&id).ok_or(LedgerError::JobNotFound(id))
    }
}

/// One line of the results journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum JournalEntry {
    Lit(StoredLitResult),
    Cts(StoredCtsResult),
    DumpsExpired { result_ids: Vec<u64> },
}

#[derive(Debug, Default)]
struct LedgerState {
    tables: Tables,
    lit_results: Vec<StoredLitResult>,
    cts_results: Vec<StoredCtsResult>,
    next_result_id: u64,
}

impl LedgerState {
    fn allocate_result_id(&mut self) -> u64 {
        self.next_result_id = self.next_result_id.max(1);
        let id = self.next_result_id;
        self.next_result_id += 1;
        id
    }

    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Lit(result) => {
                self.next_result_id = self.next_result_id.max(result.id + 1);
                self.lit_results.push(result);
            }
            JournalEntry::Cts(result) => {
                self.next_result_id = self.next_result_id.max(result.id + 1);
                self.cts_results.push(result);
            }
            JournalEntry::DumpsExpired { result_ids } => {
                for result in &mut self.cts_results {
                    if result_ids.contains(&result.id) {
                        result.dump = None;
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
struct Persistence {
    snapshot: PathBuf,
    journal: PathBuf,
}

impl Persistence {
    fn new(snapshot: &Path) -> Self {
        Self {
            snapshot: snapshot.to_path_buf(),
            journal: snapshot.with_extension("results.jsonl"),
        }
    }

    fn write_tables(&self, tables: &Tables) -> Result<(), LedgerError> {
        write_snapshot(&self.snapshot, tables).map_err(|e| LedgerError::persist(&self.snapshot, e))
    }

    fn append(&self, entry: &JournalEntry) -> Result<(), LedgerError> {
        append_line(&self.journal, entry).map_err(|e| LedgerError::persist(&self.journal, e))
    }
}

/// Thread-safe job ledger with optional on-disk persistence.
#[derive(Debug, Default)]
pub struct Ledger {
    state: Mutex<LedgerState>,
    persistence: Option<Persistence>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the snapshot at `path` and replay its results journal, or start
    /// empty when neither exists yet.
    pub fn load_from_file(path: &Path) -> Result<Self, LedgerError> {
        let persistence = Persistence::new(path);
        let load_error = |path: &Path, reason: String| LedgerError::Load {
            path: path.to_path_buf(),
            reason,
        };

        let tables = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str::<Tables>(&contents)
                .map_err(|e| load_error(path, e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No ledger snapshot at {:?}, starting empty", path);
                Tables::default()
            }
            Err(e) => return Err(load_error(path, e.to_string())),
        };

        let mut state = LedgerState {
            tables,
            ..LedgerState::default()
        };
        replay_journal(&persistence.journal, &mut state)
            .map_err(|reason| load_error(&persistence.journal, reason))?;

        debug!(
            "Loaded ledger: {} revisions, {} jobs, {} LIT and {} CTS results",
            state.tables.revisions.len(),
            state.tables.jobs.len(),
            state.lit_results.len(),
            state.cts_results.len()
        );

        Ok(Self {
            state: Mutex::new(state),
            persistence: Some(persistence),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `change` against a copy of the tables and install the copy once
    /// the snapshot is written. `change` returns its value and whether it
    /// modified anything.
    fn commit<T>(
        &self,
        change: impl FnOnce(&mut Tables) -> Result<(T, bool), LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut state = self.lock();
        let Some(persistence) = &self.persistence else {
            return change(&mut state.tables).map(|(value, _)| value);
        };

        let mut tables = state.tables.clone();
        let (value, modified) = change(&mut tables)?;
        if modified {
            persistence.write_tables(&tables)?;
            state.tables = tables;
        }
        Ok(value)
    }

    /// Write `entry` to the journal, then apply it.
    fn record(&self, state: &mut LedgerState, entry: JournalEntry) -> Result<(), LedgerError> {
        if let Some(persistence) = &self.persistence {
            persistence.append(&entry)?;
        }
        state.apply(entry);
        Ok(())
    }

    /// Lease the oldest queued job to `runner`.
    ///
    /// Returns `None` when nothing is queued.
    pub fn lease(&self, runner: &str) -> Result<Option<JobRecord>, LedgerError> {
        self.commit(|tables| {
            let Some(job) = tables
                .jobs
                .values_mut()
                .find(|job| job.status == JobStatus::Queued)
            else {
                return Ok((None, false));
            };

            job.status = JobStatus::Dispatched;
            job.dispatched_at = Some(Utc::now());
            job.dispatch_runner = Some(runner.to_string());
            Ok((Some(job.clone()), true))
        })
        .inspect(|leased| {
            if let Some(job) = leased {
                info!(
                    job_id = %job.id,
                    revision = %job.revision_hash,
                    runner,
                    "Job dispatched"
                );
            }
        })
    }

    pub fn job(&self, id: JobId) -> Result<JobRecord, LedgerError> {
        self.lock()
            .tables
            .jobs
            .get(&id)
            .cloned()
            .ok_or(LedgerError::JobNotFound(id))
    }

    /// Apply a runner status write.
    ///
    /// Only forward runner edges are applied. Any other request leaves the
    /// job untouched and is reported as [`StatusChange::Ignored`].
    pub fn update_status(
        &self,
        id: JobId,
        update: StatusUpdate,
    ) -> Result<StatusChange, LedgerError> {
        let mut previous = None;
        let change = self.commit(|tables| {
            let job = tables.job_mut(id)?;
            if !job.status.accepts_runner_update(update.status) {
                let ignored = StatusChange::Ignored {
                    job: job.clone(),
                    requested: update.status,
                };
                return Ok((ignored, false));
            }

            previous = Some(job.status);
            job.status = update.status;
            if let Some(details) = update.status_details {
                job.status_details = details;
            }
            Ok((StatusChange::Applied(job.clone()), true))
        })?;

        if let (Some(from), StatusChange::Applied(job)) = (previous, &change)
            && from != job.status
        {
            info!(
                job_id = %id,
                from = from.code(),
                to = job.status.code(),
                "Job status changed"
            );
        }
        Ok(change)
    }

    /// Append a LIT result. No check is made on the job status.
    pub fn add_lit_result(&self, id: JobId, result: LitResult) -> Result<u64, LedgerError> {
        let mut state = self.lock();
        if !state.tables.jobs.contains_key(&id) {
            return Err(LedgerError::JobNotFound(id));
        }

        let result_id = state.allocate_result_id();
        let entry = JournalEntry::Lit(StoredLitResult {
            id: result_id,
            job_id: id,
            created_at: Utc::now(),
            result,
        });
        self.record(&mut state, entry)?;
        Ok(result_id)
    }

    /// Append a CTS result. No check is made on the job status.
    pub fn add_cts_result(
        &self,
        id: JobId,
        submission: CtsSubmission,
        dump: Option<String>,
    ) -> Result<u64, LedgerError> {
        let mut state = self.lock();
        if !state.tables.jobs.contains_key(&id) {
            return Err(LedgerError::JobNotFound(id));
        }

        let result_id = state.allocate_result_id();
        let entry = JournalEntry::Cts(StoredCtsResult {
            id: result_id,
            job_id: id,
            created_at: Utc::now(),
            submission,
            dump,
        });
        self.record(&mut state, entry)?;
        Ok(result_id)
    }

    pub fn lit_results(&self, id: JobId) -> Vec<StoredLitResult> {
        self.lock()
            .lit_results
            .iter()
            .filter(|r| r.job_id == id)
            .cloned()
            .collect()
    }

    pub fn cts_results(&self, id: JobId) -> Vec<StoredCtsResult> {
        self.lock()
            .cts_results
            .iter()
            .filter(|r| r.job_id == id)
            .cloned()
            .collect()
    }

    /// Register a revision. Re-posting a known hash only updates `skip`.
    ///
    /// Returns true when the revision was new.
    pub fn upsert_revision(&self, body: RevisionBody) -> Result<bool, LedgerError> {
        self.commit(|tables| match tables.revisions.get_mut(&body.hash) {
            Some(existing) => {
                let modified = existing.skip != body.skip;
                existing.skip = body.skip;
                Ok((false, modified))
            }
            None => {
                tables.revisions.insert(
                    body.hash.clone(),
                    Revision {
                        hash: body.hash,
                        title: body.title,
                        branch: body.branch,
                        staging: body.staging,
                        date: body.date,
                        skip: body.skip,
                    },
                );
                Ok((true, true))
            }
        })
    }

    pub fn revision(&self, hash: &str) -> Option<Revision> {
        self.lock().tables.revisions.get(hash).cloned()
    }

    /// Queue a job for a known revision.
    pub fn enqueue(
        &self,
        revision_hash: &str,
        groups: TestGroups,
        primary: bool,
    ) -> Result<JobRecord, LedgerError> {
        let job = self.commit(|tables| {
            if !tables.revisions.contains_key(revision_hash) {
                return Err(LedgerError::UnknownRevision(revision_hash.to_string()));
            }
            Ok((insert_job(tables, revision_hash, groups, primary), true))
        })?;
        log_queued(&job);
        Ok(job)
    }

    /// Create a queued primary job for every non-skipped revision that has
    /// none yet, oldest commit first.
    pub fn create_primary_jobs(&self, groups: &TestGroups) -> Result<Vec<JobId>, LedgerError> {
        let created = self.commit(|tables| {
            let mut pending: Vec<(DateTime<Utc>, String)> = tables
                .revisions
                .values()
                .filter(|rev| !rev.skip)
                .filter(|rev| {
                    !tables
                        .jobs
                        .values()
                        .any(|job| job.primary && job.revision_hash == rev.hash)
                })
                .map(|rev| (rev.date, rev.hash.clone()))
                .collect();
            pending.sort();

            let created: Vec<JobRecord> = pending
                .into_iter()
                .map(|(_, hash)| insert_job(tables, &hash, groups.clone(), true))
                .collect();
            let modified = !created.is_empty();
            Ok((created, modified))
        })?;

        created.iter().for_each(log_queued);
        Ok(created.into_iter().map(|job| job.id).collect())
    }

    /// Force a queued or running job back to QUEUED (`requeue`) or to
    /// SKIPPED. The runner notices at its next status poll.
    pub fn cancel(&self, id: JobId, requeue: bool) -> Result<JobRecord, LedgerError> {
        let cancelled = self.commit(|tables| {
            let job = tables.job_mut(id)?;
            if !job.status.is_cancellable() {
                return Err(LedgerError::NotCancellable {
                    id,
                    status: job.status,
                });
            }

            job.status = if requeue {
                JobStatus::Queued
            } else {
                JobStatus::Skipped
            };
            job.status_details = "Cancelled by operator".to_string();
            job.dispatched_at = None;
            job.dispatch_runner = None;
            Ok((job.clone(), true))
        })?;

        info!(job_id = %id, requeue, "Job cancelled");
        Ok(cancelled)
    }

    /// Detach dump blobs from results created before `cutoff`.
    ///
    /// Returns the detached blob names; the caller removes the files.
    pub fn take_expired_dumps(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, LedgerError> {
        let mut state = self.lock();
        let (result_ids, expired): (Vec<u64>, Vec<String>) = state
            .cts_results
            .iter()
            .filter(|r| r.created_at <= cutoff)
            .filter_map(|r| r.dump.clone().map(|dump| (r.id, dump)))
            .unzip();

        if !result_ids.is_empty() {
            self.record(&mut state, JournalEntry::DumpsExpired { result_ids })?;
        }
        Ok(expired)
    }

    pub fn stats(&self) -> LedgerStats {
        let state = self.lock();
        let mut stats = LedgerStats {
            revisions: state.tables.revisions.len(),
            lit_results: state.lit_results.len(),
            cts_results: state.cts_results.len(),
            ..LedgerStats::default()
        };
        for job in state.tables.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Dispatched => stats.dispatched += 1,
                JobStatus::Testing => stats.testing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::BuildFailed => stats.build_failed += 1,
                JobStatus::Skipped => stats.skipped += 1,
            }
        }
        stats
    }
}

fn insert_job(
    tables: &mut Tables,
    revision_hash: &str,
    groups: TestGroups,
    primary: bool,
) -> JobRecord {
    let id = tables.allocate_job_id();
    let job = JobRecord {
        id,
        revision_hash: revision_hash.to_string(),
        primary,
        groups,
        status: JobStatus::Queued,
        status_details: String::new(),
        created_at: Utc::now(),
        dispatched_at: None,
        dispatch_runner: None,
    };
    tables.jobs.insert(id, job.clone());
    job
}

fn log_queued(job: &JobRecord) {
    info!(job_id = %job.id, revision = %job.revision_hash, primary = job.primary, "Job queued");
}

fn write_snapshot(path: &Path, tables: &Tables) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&temp_path)?;
        serde_json::to_writer(&mut file, tables)?;
        file.flush()?;
    }
    std::fs::rename(temp_path, path)
}

fn append_line(path: &Path, entry: &JournalEntry) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)?;
    file.flush()
}

/// Apply every complete journal line to `state`.
///
/// A trailing line without its newline is the remains of an interrupted
/// append; it is dropped and cut from the file.
fn replay_journal(path: &Path, state: &mut LedgerState) -> Result<(), String> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.to_string()),
    };

    let complete = contents.rfind('\n').map_or(0, |i| i + 1);
    for (index, line) in contents[..complete].lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str::<JournalEntry>(line)
            .map_err(|e| format!("line {}: {e}", index + 1))?;
        state.apply(entry);
    }

    if complete < contents.len() {
        warn!(
            error_code = %ErrorCode::InternalStateLoad.code_string(),
            "Dropping incomplete last entry of {:?}", path
        );
        OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|file| file.set_len(complete as u64))
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}
