//! The fleet supervisor: the single addressable registry of live printers,
//! one worker task per printer, and the queue/job operations the request
//! layer calls.

use std::sync::Arc;

use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::{
    config::Settings,
    device::Connect,
    errors::{Error, Result},
    events::{Event, Events},
    job::{Job, JobStatus},
    printer::{Printer, PrinterSnapshot, PrinterStatus, Requeue},
    queue::Queue,
    store::{JobStore, PrinterRecord},
};

/// The four queue reorder moves an operator can request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BumpMove {
    /// One position toward the front.
    Up,
    /// One position toward the back.
    Down,
    /// All the way to the front.
    Front,
    /// All the way to the back.
    Back,
}

struct FleetEntry {
    printer: Arc<Printer>,
    record: PrinterRecord,
    worker: JoinHandle<()>,
}

/// Owns the set of live printers and their workers. Identity lookup is an
/// indexed map, decoupled from the tasks actually running the workers.
pub struct Fleet {
    printers: DashMap<i64, FleetEntry>,
    store: Arc<dyn JobStore>,
    events: Events,
    connector: Arc<dyn Connect>,
    settings: Settings,
}

impl Fleet {
    /// Create an empty fleet.
    pub fn new(store: Arc<dyn JobStore>, events: Events, connector: Arc<dyn Connect>, settings: Settings) -> Self {
        Self {
            printers: DashMap::new(),
            store,
            events,
            connector,
            settings,
        }
    }

    /// The fleet's notification sink.
    pub fn events(&self) -> &Events {
        &self.events
    }

    /// The durable store backing the fleet.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    fn spawn_worker(printer: Arc<Printer>, settings: &Settings) -> JoinHandle<()> {
        let poll = settings.worker_poll;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                match printer.status() {
                    PrinterStatus::Configuring => {
                        if let Err(e) = printer.initialize().await {
                            tracing::debug!(printer = %printer.name(), error = %e, "initialization failed");
                        }
                    }
                    PrinterStatus::Ready => {
                        if let Some(job) = printer.queue().peek_next() {
                            printer.run_job(job).await;
                        }
                    }
                    _ => {}
                }
            }
        })
    }

    /// Bring a registered printer up: create the live runtime object and
    /// start its worker. Errors if a worker is already running for the id.
    pub fn register(&self, record: PrinterRecord) -> Result<Arc<Printer>> {
        self.register_with_queue(record, Queue::new())
    }

    fn register_with_queue(&self, record: PrinterRecord, queue: Queue) -> Result<Arc<Printer>> {
        if self.printers.contains_key(&record.id) {
            return Err(Error::Duplicate(format!("printer {}", record.id)));
        }
        let printer = Arc::new(Printer::new(
            &record,
            queue,
            self.store.clone(),
            self.events.clone(),
            self.connector.clone(),
            self.settings.clone(),
        ));
        let worker = Self::spawn_worker(printer.clone(), &self.settings);
        tracing::info!(printer = %record.name, id = record.id, "worker started");
        self.printers.insert(
            record.id,
            FleetEntry {
                printer: printer.clone(),
                record,
                worker,
            },
        );
        Ok(printer)
    }

    /// Persist a brand-new printer registration, then bring it up.
    pub async fn register_device(&self, device: &str, description: &str, hwid: &str, name: &str) -> Result<Arc<Printer>> {
        let id = self.store.register_printer(device, description, hwid, name).await?;
        let record = PrinterRecord {
            id,
            device: device.to_string(),
            description: description.to_string(),
            hwid: hwid.to_string(),
            name: name.to_string(),
            registered_at: chrono::Utc::now(),
        };
        self.register(record)
    }

    /// Bring up every stored registration that is not already running.
    pub async fn spawn_registered(&self) -> Result<()> {
        for record in self.store.registered_printers().await? {
            if self.printers.contains_key(&record.id) {
                continue;
            }
            self.register(record)?;
        }
        Ok(())
    }

    /// Re-enqueue every stored `inqueue` job onto its printer. Run once at
    /// startup, after [Fleet::spawn_registered].
    pub async fn restore_queues(&self) -> Result<()> {
        // don't hold registry references across store awaits
        let printers: Vec<Arc<Printer>> = self.printers.iter().map(|entry| entry.printer.clone()).collect();
        for printer in printers {
            for record in self.store.pending_jobs(printer.id()).await? {
                let job = Arc::new(Job::from_record(&record, self.events.clone()));
                if let Err(e) = printer.queue().add_to_back(job) {
                    tracing::debug!(job = record.id, error = %e, "skipping restore");
                }
            }
        }
        Ok(())
    }

    /// Look a live printer up by id.
    pub fn find_printer(&self, id: i64) -> Result<Arc<Printer>> {
        self.printers
            .get(&id)
            .map(|entry| entry.printer.clone())
            .ok_or_else(|| Error::NotFound(format!("printer {id}")))
    }

    /// Stop and recreate one printer's worker, keeping the persisted
    /// identity and the queue. Recovery hatch for a wedged worker.
    pub fn reset_worker(&self, id: i64) -> Result<Arc<Printer>> {
        let (_, entry) = self
            .printers
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("printer {id}")))?;
        entry.worker.abort();
        let queue = entry.printer.queue().clone();
        tracing::info!(printer = %entry.record.name, id, "worker reset");
        self.register_with_queue(entry.record, queue)
    }

    /// Snapshots of every live printer, for external reporting.
    pub fn list_all(&self) -> Vec<PrinterSnapshot> {
        let mut snapshots: Vec<PrinterSnapshot> = self.printers.iter().map(|entry| entry.printer.snapshot()).collect();
        snapshots.sort_by_key(|snapshot| snapshot.id);
        snapshots
    }

    /// Tear every worker down. Registrations persist; the runtime objects
    /// do not.
    pub fn shutdown(&self) {
        for entry in self.printers.iter() {
            entry.worker.abort();
        }
        self.printers.clear();
    }

    /// Persist a submitted job and enqueue it at the back of the target
    /// printer's queue.
    pub async fn submit_job(
        &self,
        printer_id: i64,
        name: &str,
        payload: &[u8],
        original_file_name: &str,
    ) -> Result<Arc<Job>> {
        let printer = self.find_printer(printer_id)?;
        let id = self
            .store
            .insert_job_history(name, printer_id, JobStatus::InQueue, payload, original_file_name)
            .await?;
        let job = Arc::new(Job::new(id, name, printer_id, original_file_name, self.events.clone()));
        printer.queue().add_to_back(job.clone())?;
        tracing::info!(job = id, printer = printer_id, "job queued");
        Ok(job)
    }

    /// Submit to whichever live printer has the shortest queue.
    pub async fn auto_queue(&self, name: &str, payload: &[u8], original_file_name: &str) -> Result<Arc<Job>> {
        let printer_id = self
            .printers
            .iter()
            .map(|entry| (entry.printer.queue().size(), *entry.key()))
            .min()
            .map(|(_, id)| id)
            .ok_or_else(|| Error::NotFound("an available printer".to_string()))?;
        self.submit_job(printer_id, name, payload, original_file_name).await
    }

    /// Duplicate a stored job onto a printer's queue as a fresh submission.
    pub async fn rerun_job(&self, job_id: i64, printer_id: i64) -> Result<Arc<Job>> {
        let record = self
            .store
            .find_job(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
        let payload = self.store.job_payload(job_id).await?;
        self.submit_job(printer_id, &record.name, &payload, &record.original_file_name)
            .await
    }

    /// Cancel a job wherever it is. A queued job is removed outright; the
    /// actively executing job is removed and its printer's status forced so
    /// the executor aborts at its next per-line checkpoint.
    pub async fn cancel_job(&self, job_id: i64) -> Result<()> {
        let printers: Vec<Arc<Printer>> = self.printers.iter().map(|entry| entry.printer.clone()).collect();
        for printer in printers {
            let executing = printer.current_job().is_some_and(|job| job.id() == job_id)
                && matches!(printer.status(), PrinterStatus::Printing | PrinterStatus::Paused);
            if executing {
                printer.queue().delete_job(job_id);
                printer.set_status(PrinterStatus::Cancelled);
                tracing::info!(job = job_id, printer = printer.id(), "cancelling active job");
                return Ok(());
            }

            let queued = printer.queue().contents().into_iter().find(|job| job.id() == job_id);
            if let Some(job) = queued {
                printer.queue().delete_job(job_id);
                job.set_status(JobStatus::Cancelled);
                if let Err(e) = self.store.update_job_status(job_id, JobStatus::Cancelled).await {
                    tracing::warn!(job = job_id, error = %e, "failed to persist cancellation");
                }
                self.events.emit(Event::JobStatusUpdate {
                    job_id,
                    status: JobStatus::Cancelled,
                });
                return Ok(());
            }
        }
        Err(Error::NotFound(format!("job {job_id}")))
    }

    /// Reorder a job inside its printer's queue.
    pub fn bump_job(&self, printer_id: i64, job_id: i64, bump: BumpMove) -> Result<()> {
        let printer = self.find_printer(printer_id)?;
        let queue = printer.queue();
        match bump {
            BumpMove::Up => queue.bump(true, job_id),
            BumpMove::Down => queue.bump(false, job_id),
            BumpMove::Front => queue.bump_extreme(true, job_id),
            BumpMove::Back => queue.bump_extreme(false, job_id),
        }
        Ok(())
    }

    /// Operator release of a terminal printer state.
    pub async fn release_printer(&self, printer_id: i64, requeue: Requeue) -> Result<()> {
        self.find_printer(printer_id)?.release(requeue).await
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        self.shutdown();
    }
}
