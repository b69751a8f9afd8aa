//! The durable-store seam. Job history and printer registration live in
//! some persistent backend; the fleet only consumes this interface.
//! [MemoryStore] is the in-process implementation used by tests and the
//! default daemon.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    errors::{Error, Result},
    job::JobStatus,
    payload,
};

/// A job's persisted row.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct JobRecord {
    /// Store-assigned identifier.
    pub id: i64,
    /// Human-facing job name.
    pub name: String,
    /// Last persisted status.
    pub status: JobStatus,
    /// The printer the job was queued on.
    pub printer_id: i64,
    /// The file name as uploaded.
    pub original_file_name: String,
    /// When the job was first persisted.
    pub submitted_at: DateTime<Utc>,
}

/// A printer's registration row.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct PrinterRecord {
    /// Store-assigned identifier.
    pub id: i64,
    /// Connection address.
    pub device: String,
    /// Port description.
    pub description: String,
    /// Hardware id, unique across registrations.
    pub hwid: String,
    /// Operator-facing name.
    pub name: String,
    /// When the printer was registered.
    pub registered_at: DateTime<Utc>,
}

/// Insert/query/update operations the fleet needs from the durable store.
/// Payloads are persisted gzip-compressed regardless of how they arrive.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job and its payload; returns the assigned id.
    async fn insert_job_history(
        &self,
        name: &str,
        printer_id: i64,
        status: JobStatus,
        payload: &[u8],
        original_file_name: &str,
    ) -> Result<i64>;

    /// Persist a job's status.
    async fn update_job_status(&self, job_id: i64, status: JobStatus) -> Result<()>;

    /// Look a job up by id.
    async fn find_job(&self, job_id: i64) -> Result<Option<JobRecord>>;

    /// The job's compressed payload bytes.
    async fn job_payload(&self, job_id: i64) -> Result<Vec<u8>>;

    /// One page of job history, newest first, optionally filtered to a set
    /// of printers. `page` is 1-based; also returns the unpaged total.
    async fn job_history(
        &self,
        page: usize,
        page_size: usize,
        printer_ids: Option<&[i64]>,
    ) -> Result<(Vec<JobRecord>, usize)>;

    /// Register a printer; errors with [Error::Duplicate] if the hardware
    /// id is already registered.
    async fn register_printer(&self, device: &str, description: &str, hwid: &str, name: &str) -> Result<i64>;

    /// All registered printers.
    async fn registered_printers(&self) -> Result<Vec<PrinterRecord>>;

    /// Jobs still marked `inqueue` for a printer, oldest first (queue
    /// restore after a restart).
    async fn pending_jobs(&self, printer_id: i64) -> Result<Vec<JobRecord>>;
}

#[derive(Debug, Default)]
struct Inner {
    jobs: Vec<(JobRecord, Vec<u8>)>,
    printers: Vec<PrinterRecord>,
    next_job_id: i64,
    next_printer_id: i64,
}

/// An in-process [JobStore]. Nothing survives the process; a real
/// deployment fronts a database with the same interface.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("store poisoned")
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job_history(
        &self,
        name: &str,
        printer_id: i64,
        status: JobStatus,
        payload: &[u8],
        original_file_name: &str,
    ) -> Result<i64> {
        let compressed = payload::ensure_compressed(payload)?;
        let mut inner = self.inner();
        inner.next_job_id += 1;
        let id = inner.next_job_id;
        inner.jobs.push((
            JobRecord {
                id,
                name: name.to_string(),
                status,
                printer_id,
                original_file_name: original_file_name.to_string(),
                submitted_at: Utc::now(),
            },
            compressed,
        ));
        Ok(id)
    }

    async fn update_job_status(&self, job_id: i64, status: JobStatus) -> Result<()> {
        let mut inner = self.inner();
        let (record, _) = inner
            .jobs
            .iter_mut()
            .find(|(record, _)| record.id == job_id)
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
        record.status = status;
        Ok(())
    }

    async fn find_job(&self, job_id: i64) -> Result<Option<JobRecord>> {
        Ok(self
            .inner()
            .jobs
            .iter()
            .find(|(record, _)| record.id == job_id)
            .map(|(record, _)| record.clone()))
    }

    async fn job_payload(&self, job_id: i64) -> Result<Vec<u8>> {
        self.inner()
            .jobs
            .iter()
            .find(|(record, _)| record.id == job_id)
            .map(|(_, payload)| payload.clone())
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))
    }

    async fn job_history(
        &self,
        page: usize,
        page_size: usize,
        printer_ids: Option<&[i64]>,
    ) -> Result<(Vec<JobRecord>, usize)> {
        let inner = self.inner();
        let matching: Vec<JobRecord> = inner
            .jobs
            .iter()
            .rev() // newest first
            .map(|(record, _)| record)
            .filter(|record| printer_ids.is_none_or(|ids| ids.contains(&record.printer_id)))
            .cloned()
            .collect();
        let total = matching.len();
        let start = page.saturating_sub(1) * page_size;
        let items = matching.into_iter().skip(start).take(page_size).collect();
        Ok((items, total))
    }

    async fn register_printer(&self, device: &str, description: &str, hwid: &str, name: &str) -> Result<i64> {
        let mut inner = self.inner();
        if inner.printers.iter().any(|printer| printer.hwid == hwid) {
            return Err(Error::Duplicate(format!("printer with hwid {hwid}")));
        }
        inner.next_printer_id += 1;
        let id = inner.next_printer_id;
        inner.printers.push(PrinterRecord {
            id,
            device: device.to_string(),
            description: description.to_string(),
            hwid: hwid.to_string(),
            name: name.to_string(),
            registered_at: Utc::now(),
        });
        Ok(id)
    }

    async fn registered_printers(&self) -> Result<Vec<PrinterRecord>> {
        Ok(self.inner().printers.clone())
    }

    async fn pending_jobs(&self, printer_id: i64) -> Result<Vec<JobRecord>> {
        Ok(self
            .inner()
            .jobs
            .iter()
            .map(|(record, _)| record)
            .filter(|record| record.printer_id == printer_id && record.status == JobStatus::InQueue)
            .cloned()
            .collect())
    }
}
