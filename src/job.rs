//! The unit of work: one uploaded gcode file bound for one printer.

use std::sync::{Mutex, MutexGuard};

use parse_display::{Display, FromStr};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    errors::{Error, Result},
    events::{Event, Events},
    store::JobRecord,
};

/// Where a job is in its lifecycle.
#[derive(Clone, Copy, Debug, Display, Eq, FromStr, PartialEq, Serialize, Deserialize, JsonSchema)]
#[display(style = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in a printer's queue.
    InQueue,
    /// Being streamed to the device right now.
    Printing,
    /// All lines sent and acknowledged.
    Complete,
    /// Failed; see the owning printer's error text.
    Error,
    /// Aborted by an operator before completion.
    Cancelled,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::InQueue
    }
}

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    progress: f64,
    total_time_seconds: u64,
    timer_started: bool,
    resolved_file_name: Option<String>,
}

/// A print job. Identity is immutable; status, progress and timing are
/// mutated by the owning printer's worker and by operator actions, so they
/// sit behind a mutex. The payload bytes stay in the durable store — a job
/// only carries the file names needed to stage a working copy.
#[derive(Debug)]
pub struct Job {
    id: i64,
    name: String,
    printer_id: i64,
    original_file_name: String,
    events: Events,
    state: Mutex<JobState>,
}

impl Job {
    /// Create a job freshly assigned `id` by the durable store.
    pub fn new(id: i64, name: &str, printer_id: i64, original_file_name: &str, events: Events) -> Self {
        Self {
            id,
            name: name.to_string(),
            printer_id,
            original_file_name: original_file_name.to_string(),
            events,
            state: Mutex::new(JobState {
                status: JobStatus::InQueue,
                progress: 0.0,
                total_time_seconds: 0,
                timer_started: false,
                resolved_file_name: Some(resolved_file_name(original_file_name, id)),
            }),
        }
    }

    /// Rebuild a runtime job from its stored record (queue restore after a
    /// process restart).
    pub fn from_record(record: &JobRecord, events: Events) -> Self {
        let job = Self::new(record.id, &record.name, record.printer_id, &record.original_file_name, events);
        job.set_status(record.status);
        job
    }

    fn state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().expect("job state poisoned")
    }

    /// Durable-store identifier.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Human-facing job name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The printer this job belongs to.
    pub fn printer_id(&self) -> i64 {
        self.printer_id
    }

    /// The file name as uploaded.
    pub fn original_file_name(&self) -> &str {
        &self.original_file_name
    }

    /// The unique on-disk name assigned once the store inserted the job.
    pub fn resolved_file_name(&self) -> Option<String> {
        self.state().resolved_file_name.clone()
    }

    /// Current status.
    pub fn status(&self) -> JobStatus {
        self.state().status
    }

    /// Set the status. Pure mutation: notifying the sink and the store is
    /// the caller's responsibility.
    pub fn set_status(&self, status: JobStatus) {
        self.state().status = status;
    }

    /// Percent complete, 0.0 through 100.0.
    pub fn progress(&self) -> f64 {
        self.state().progress
    }

    /// Record progress and emit `progress_update`. Only takes effect while
    /// the job is printing; callers control update frequency line by line.
    pub fn set_progress(&self, progress: f64) {
        {
            let mut state = self.state();
            if state.status != JobStatus::Printing {
                return;
            }
            state.progress = progress;
        }
        self.events.emit(Event::ProgressUpdate {
            job_id: self.id,
            progress,
        });
    }

    /// The parsed duration estimate, 0 until known.
    pub fn total_time_seconds(&self) -> u64 {
        self.state().total_time_seconds
    }

    /// Record the duration estimate parsed from the payload.
    pub fn set_total_time_seconds(&self, seconds: u64) {
        self.state().total_time_seconds = seconds;
    }

    /// Whether the job's timer has started.
    pub fn timer_started(&self) -> bool {
        self.state().timer_started
    }

    /// Latch the timer on the first heating-wait arrival and emit
    /// `job_time` with the total estimate. Later calls are no-ops.
    pub fn start_timer(&self) {
        let total_time = {
            let mut state = self.state();
            if state.timer_started {
                return;
            }
            state.timer_started = true;
            state.total_time_seconds
        };
        self.events.emit(Event::JobTime {
            job_id: self.id,
            total_time,
        });
    }

    /// Put the job back into a runnable state for re-queueing after an
    /// operator release or a re-run.
    pub fn reset_for_requeue(&self) {
        let mut state = self.state();
        state.status = JobStatus::InQueue;
        state.progress = 0.0;
        state.timer_started = false;
    }

    /// Reporting view of the job.
    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.state();
        JobSnapshot {
            id: self.id,
            name: self.name.clone(),
            status: state.status,
            printer_id: self.printer_id,
            original_file_name: self.original_file_name.clone(),
            resolved_file_name: state.resolved_file_name.clone(),
            progress: state.progress,
            total_time_seconds: state.total_time_seconds,
        }
    }
}

/// Reporting view of a [Job], served to the request layer.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct JobSnapshot {
    /// Durable-store identifier.
    pub id: i64,
    /// Human-facing job name.
    pub name: String,
    /// Current status.
    pub status: JobStatus,
    /// The printer this job belongs to.
    pub printer_id: i64,
    /// The file name as uploaded.
    pub original_file_name: String,
    /// The unique on-disk name, if assigned.
    pub resolved_file_name: Option<String>,
    /// Percent complete.
    pub progress: f64,
    /// Estimated total print time in seconds, 0 until parsed.
    pub total_time_seconds: u64,
}

/// The unique on-disk name for a stored payload: the original name with the
/// store-assigned id spliced in before the extension.
pub fn resolved_file_name(original: &str, id: i64) -> String {
    match original.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}_{id}.{ext}"),
        None => format!("{original}_{id}"),
    }
}

/// Parse a duration estimate out of a payload's comment lines.
///
/// Two annotation styles are understood: a `TAG:<seconds>` line directly
/// after a flavor marker, and a free-text line containing the word "time"
/// with embedded minutes and seconds.
pub fn parse_estimated_duration(comment_lines: &[String]) -> Result<u64> {
    if comment_lines.first().is_some_and(|line| line.contains("FLAVOR")) {
        let line = comment_lines
            .get(1)
            .ok_or_else(|| Error::Parse("missing duration tag after flavor marker".to_string()))?;
        let (_, seconds) = line
            .split_once(':')
            .ok_or_else(|| Error::Parse(line.clone()))?;
        return seconds.trim().parse::<u64>().map_err(|_| Error::Parse(line.clone()));
    }

    let line = comment_lines
        .iter()
        .find(|line| line.contains("time"))
        .ok_or_else(|| Error::Parse("no duration annotation found".to_string()))?;
    let numbers: Vec<u64> = line
        .split(|c: char| !c.is_ascii_digit())
        .filter(|chunk| !chunk.is_empty())
        .filter_map(|chunk| chunk.parse().ok())
        .collect();
    match numbers[..] {
        [minutes, seconds] => Ok(minutes * 60 + seconds),
        _ => Err(Error::Parse(line.clone())),
    }
}
