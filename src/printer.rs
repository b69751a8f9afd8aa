//! One physical printer: its status state machine, its queue, and the
//! executor that streams a job's gcode through a device session.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use parse_display::{Display, FromStr};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    config::Settings,
    device::{classify, Connect, DeviceSession, Response},
    errors::{Error, Result},
    events::{Event, Events},
    gcode,
    job::{parse_estimated_duration, Job, JobSnapshot, JobStatus},
    payload::StagedPayload,
    queue::Queue,
    store::{JobStore, PrinterRecord},
};

/// The printer status state machine's states.
#[derive(Clone, Copy, Debug, Display, Eq, FromStr, PartialEq, Serialize, Deserialize, JsonSchema)]
#[display(style = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PrinterStatus {
    /// Fresh runtime object; the worker will initialize it.
    Configuring,
    /// Initialized and able to take the next queued job.
    Ready,
    /// Streaming a job.
    Printing,
    /// Holding for the operator (filament change or explicit pause).
    Paused,
    /// Finished the last job; waiting for operator acknowledgement.
    Complete,
    /// A device-side failure; see the error text. Waiting for
    /// acknowledgement.
    Error,
    /// The last job was aborted. Waiting for acknowledgement.
    Cancelled,
}

impl PrinterStatus {
    /// Whether this state needs an operator release before the printer
    /// drains its queue again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }
}

/// Where an operator release puts the finished job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Requeue {
    /// Drop the job from the queue; history keeps it.
    Discard,
    /// Print it again next.
    Front,
    /// Print it again after everything already queued.
    Back,
}

/// How one pass through the executor ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Outcome {
    Complete,
    Failed,
    Cancelled,
    PausedTooLong,
}

/// What broke the pause-wait loop.
enum Resumption {
    Resumed,
    Ceiling,
    Aborted(Outcome),
}

#[derive(Debug)]
struct PrinterState {
    status: PrinterStatus,
    error: String,
    extruder_temp: f64,
    bed_temp: f64,
    current_job: Weak<Job>,
    no_response_count: u32,
}

/// A live printer. Owns one [Queue] and, while initializing or executing,
/// one open [DeviceSession]. Runtime state sits behind a single mutex so
/// the worker and external callers (pause, cancel, release) always observe
/// the error-text/status pair together; the mutex is never held across an
/// await.
pub struct Printer {
    id: i64,
    device: String,
    description: String,
    hwid: String,
    name: String,
    queue: Queue,
    state: Mutex<PrinterState>,
    events: Events,
    store: Arc<dyn JobStore>,
    connector: Arc<dyn Connect>,
    settings: Settings,
}

impl Printer {
    /// Create the runtime object for a registered printer. `queue` is
    /// passed in so a worker reset can carry the existing queue over.
    pub fn new(
        record: &PrinterRecord,
        queue: Queue,
        store: Arc<dyn JobStore>,
        events: Events,
        connector: Arc<dyn Connect>,
        settings: Settings,
    ) -> Self {
        Self {
            id: record.id,
            device: record.device.clone(),
            description: record.description.clone(),
            hwid: record.hwid.clone(),
            name: record.name.clone(),
            queue,
            state: Mutex::new(PrinterState {
                status: PrinterStatus::Configuring,
                error: String::new(),
                extruder_temp: 0.0,
                bed_temp: 0.0,
                current_job: Weak::new(),
                no_response_count: 0,
            }),
            events,
            store,
            connector,
            settings,
        }
    }

    fn state(&self) -> MutexGuard<'_, PrinterState> {
        self.state.lock().expect("printer state poisoned")
    }

    /// Registered identifier.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Operator-facing name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection address.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Hardware id.
    pub fn hwid(&self) -> &str {
        &self.hwid
    }

    /// This printer's queue.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Current status.
    pub fn status(&self) -> PrinterStatus {
        self.state().status
    }

    /// Set the status and notify the sink. External callers use this for
    /// the operator actions the state machine allows: pausing, resuming,
    /// and aborting a stream mid-flight.
    pub fn set_status(&self, status: PrinterStatus) {
        self.state().status = status;
        self.events.emit(Event::StatusUpdate {
            printer_id: self.id,
            status,
        });
    }

    /// Last error text; empty when none.
    pub fn error(&self) -> String {
        self.state().error.clone()
    }

    /// Record an error and flip the status to [PrinterStatus::Error] in
    /// one critical section, so no observer sees the text with a stale
    /// status.
    pub fn set_error(&self, error: &str) {
        {
            let mut state = self.state();
            state.error = error.to_string();
            state.status = PrinterStatus::Error;
        }
        tracing::warn!(printer = %self.name, error, "printer error");
        self.events.emit(Event::ErrorUpdate {
            printer_id: self.id,
            error: error.to_string(),
        });
        self.events.emit(Event::StatusUpdate {
            printer_id: self.id,
            status: PrinterStatus::Error,
        });
    }

    /// Last reported extruder/bed temperatures.
    pub fn temperatures(&self) -> (f64, f64) {
        let state = self.state();
        (state.extruder_temp, state.bed_temp)
    }

    fn record_temperatures(&self, extruder: f64, bed: f64) {
        {
            let mut state = self.state();
            state.extruder_temp = extruder;
            state.bed_temp = bed;
        }
        self.events.emit(Event::TempUpdate {
            printer_id: self.id,
            extruder_temp: extruder,
            bed_temp: bed,
        });
    }

    /// The job currently executing, if any. Never an owner: the queue is.
    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.state().current_job.upgrade()
    }

    fn bump_no_response(&self) -> u32 {
        let mut state = self.state();
        state.no_response_count += 1;
        state.no_response_count
    }

    fn clear_no_response(&self) {
        self.state().no_response_count = 0;
    }

    /// Reporting view of the printer and its queue.
    pub fn snapshot(&self) -> PrinterSnapshot {
        let (status, error, extruder_temp, bed_temp, current_job_id) = {
            let state = self.state();
            (
                state.status,
                state.error.clone(),
                state.extruder_temp,
                state.bed_temp,
                state.current_job.upgrade().map(|job| job.id()),
            )
        };
        PrinterSnapshot {
            id: self.id,
            device: self.device.clone(),
            description: self.description.clone(),
            hwid: self.hwid.clone(),
            name: self.name.clone(),
            status,
            error,
            extruder_temp,
            bed_temp,
            current_job_id,
            queue: self.queue.snapshot(),
        }
    }

    async fn open_session(&self) -> Result<DeviceSession> {
        let conn = self
            .connector
            .connect(&self.device, self.settings.baud)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(DeviceSession::new(conn))
    }

    /// Open the device and run the homing + extrude-reset sequence.
    /// Success moves the printer to [PrinterStatus::Ready]; any failure
    /// records the error and leaves it in [PrinterStatus::Error].
    pub async fn initialize(&self) -> Result<()> {
        tracing::debug!(printer = %self.name, device = %self.device, "initializing");
        let result: Result<()> = async {
            let mut session = self.open_session().await?;
            self.send_line(&mut session, gcode::HOME_ALL, None).await?;
            self.send_line(&mut session, gcode::EXTRUDE_RESET, None).await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => {
                self.set_status(PrinterStatus::Ready);
                tracing::info!(printer = %self.name, "ready");
                Ok(())
            }
            Err(e) => {
                // the protocol layer already records device-reported and
                // no-response failures
                if self.status() != PrinterStatus::Error {
                    self.set_error(&e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Execute one job end to end and map the outcome onto job, queue and
    /// printer state. Never fails out: every failure becomes printer/job
    /// state, so the calling worker loop survives any single job.
    pub async fn run_job(&self, job: Arc<Job>) {
        // the head can legally vanish between the worker's peek and here;
        // that is "nothing to do this cycle", not a failure
        if !self.queue.contents().iter().any(|queued| queued.id() == job.id()) {
            return;
        }
        self.state().current_job = Arc::downgrade(&job);
        self.clear_no_response();
        tracing::info!(printer = %self.name, job = job.id(), name = job.name(), "starting job");

        match self.execute(&job).await {
            Ok(Outcome::Complete) => {
                self.set_status(PrinterStatus::Complete);
                self.push_job_status(&job, JobStatus::Complete).await;
                tracing::info!(printer = %self.name, job = job.id(), "job complete");
            }
            Ok(Outcome::Failed) => {
                // device already put us in the error state with its text
                self.queue.delete_job(job.id());
                self.push_job_status(&job, JobStatus::Error).await;
            }
            Ok(Outcome::Cancelled) => {
                // printer status stays whatever caused the abort
                self.push_job_status(&job, JobStatus::Cancelled).await;
                tracing::info!(printer = %self.name, job = job.id(), "job cancelled");
            }
            Ok(Outcome::PausedTooLong) => {
                self.set_status(PrinterStatus::Complete);
                self.push_job_status(&job, JobStatus::Cancelled).await;
                tracing::warn!(printer = %self.name, job = job.id(), "paused past the ceiling, job cancelled");
            }
            Err(Error::Connection(e)) => {
                self.queue.delete_job(job.id());
                self.set_error(&format!("not connected: {e}"));
                self.push_job_status(&job, JobStatus::Error).await;
            }
            Err(e) => {
                self.queue.delete_job(job.id());
                if self.status() != PrinterStatus::Error {
                    self.set_error(&e.to_string());
                }
                self.push_job_status(&job, JobStatus::Error).await;
            }
        }
    }

    /// Steps 1–5 of the execution algorithm: connect, stage the payload,
    /// stream the lines. The session lives exactly as long as this call.
    async fn execute(&self, job: &Arc<Job>) -> Result<Outcome> {
        let mut session = self.open_session().await?;

        let compressed = self.store.job_payload(job.id()).await?;
        let file_name = job
            .resolved_file_name()
            .unwrap_or_else(|| format!("job_{}.gcode", job.id()));
        let staged = StagedPayload::stage(&self.settings.upload_dir, &file_name, &compressed).await?;
        let content = staged.read_to_string().await?;

        match parse_estimated_duration(&gcode::comment_lines(&content)) {
            Ok(seconds) => job.set_total_time_seconds(seconds),
            Err(e) => tracing::debug!(job = job.id(), error = %e, "no duration estimate"),
        }

        self.set_status(PrinterStatus::Printing);
        self.push_job_status(job, JobStatus::Printing).await;

        let lines = gcode::command_lines(&content);
        let outcome = self.stream(&mut session, job, &lines).await;

        // the working copy goes away on success and failure alike
        if let Err(e) = staged.remove().await {
            tracing::debug!(job = job.id(), error = %e, "failed to remove working copy");
        }

        let outcome = outcome?;
        if matches!(outcome, Outcome::Cancelled | Outcome::PausedTooLong) {
            self.run_ending_sequence(&mut session).await;
        }
        Ok(outcome)
    }

    /// Stream every command line, handling the pause branch and the
    /// per-line abort checkpoints.
    async fn stream(&self, session: &mut DeviceSession, job: &Arc<Job>, lines: &[String]) -> Result<Outcome> {
        let total = lines.len();
        for (index, line) in lines.iter().enumerate() {
            let filament_change = gcode::is_filament_change(line);
            if filament_change || self.status() == PrinterStatus::Paused {
                self.send_line(session, gcode::FILAMENT_CHANGE, Some(job)).await?;
                if self.status() != PrinterStatus::Paused {
                    self.set_status(PrinterStatus::Paused);
                }
                match self.wait_for_resume().await {
                    Resumption::Resumed => {
                        // an externally paused line still has to go out;
                        // a filament-change line was consumed above
                        if !filament_change {
                            self.send_line(session, line, Some(job)).await?;
                        }
                    }
                    Resumption::Ceiling => return Ok(Outcome::PausedTooLong),
                    Resumption::Aborted(outcome) => return Ok(outcome),
                }
            } else {
                self.send_line(session, line, Some(job)).await?;
            }

            job.set_progress((index + 1) as f64 / total as f64 * 100.0);

            match self.status() {
                PrinterStatus::Complete | PrinterStatus::Cancelled => return Ok(Outcome::Cancelled),
                PrinterStatus::Error => return Ok(Outcome::Failed),
                _ => {}
            }
        }
        Ok(Outcome::Complete)
    }

    /// Poll until the operator resumes, the abort checkpoints fire, or the
    /// pause ceiling elapses.
    async fn wait_for_resume(&self) -> Resumption {
        let started = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(self.settings.pause_poll).await;
            match self.status() {
                PrinterStatus::Printing => return Resumption::Resumed,
                PrinterStatus::Complete | PrinterStatus::Cancelled => {
                    return Resumption::Aborted(Outcome::Cancelled)
                }
                PrinterStatus::Error => return Resumption::Aborted(Outcome::Failed),
                _ => {}
            }
            if started.elapsed() >= self.settings.pause_ceiling {
                return Resumption::Ceiling;
            }
        }
    }

    /// Write one line and read until it is acknowledged, classifying
    /// everything the device says along the way.
    async fn send_line(&self, session: &mut DeviceSession, line: &str, job: Option<&Arc<Job>>) -> Result<()> {
        session.write_line(line).await?;
        loop {
            let response = session.read_response().await?;
            if response.is_empty() {
                let count = self.bump_no_response();
                if count >= self.settings.no_response_limit {
                    self.set_error("no response from printer");
                    return Err(Error::NoResponse(count));
                }
            } else {
                self.clear_no_response();
                match classify(&response) {
                    Response::Error => {
                        self.set_error(&response);
                        return Err(Error::DeviceReported(response));
                    }
                    Response::Temperature { extruder, bed } => {
                        self.record_temperatures(extruder, bed);
                    }
                    Response::HeatingWait => {
                        if let Some(job) = job {
                            job.start_timer();
                        }
                    }
                    Response::Ack => return Ok(()),
                    Response::Empty | Response::Other => {}
                }
            }
            // let an external abort break an otherwise indefinite read loop
            if matches!(
                self.status(),
                PrinterStatus::Complete | PrinterStatus::Cancelled | PrinterStatus::Error
            ) {
                return Ok(());
            }
        }
    }

    async fn run_ending_sequence(&self, session: &mut DeviceSession) {
        for line in gcode::ENDING_SEQUENCE {
            if let Err(e) = self.send_line(session, line, None).await {
                tracing::warn!(printer = %self.name, error = %e, "ending sequence interrupted");
                break;
            }
        }
    }

    /// Set a job's status, persist it, and notify the sink. Store failures
    /// are logged, never propagated: a dead store must not take the worker
    /// down with it.
    async fn push_job_status(&self, job: &Arc<Job>, status: JobStatus) {
        job.set_status(status);
        if let Err(e) = self.store.update_job_status(job.id(), status).await {
            tracing::warn!(job = job.id(), error = %e, "failed to persist job status");
        }
        self.events.emit(Event::JobStatusUpdate {
            job_id: job.id(),
            status,
        });
    }

    /// Operator acknowledgement of a terminal state: drop the finished job
    /// from the queue (optionally re-queueing it at either end) and return
    /// to [PrinterStatus::Ready]. A printer not in a terminal state is
    /// left untouched.
    pub async fn release(&self, requeue: Requeue) -> Result<()> {
        if !self.status().is_terminal() {
            tracing::debug!(printer = %self.name, "release ignored, not in a terminal state");
            return Ok(());
        }

        let job = self.current_job();
        if let Some(job) = &job {
            self.queue.delete_job(job.id());
        }
        if let Some(job) = job {
            match requeue {
                Requeue::Discard => {}
                Requeue::Front => {
                    job.reset_for_requeue();
                    self.push_job_status(&job, JobStatus::InQueue).await;
                    self.queue.add_to_front(job)?;
                }
                Requeue::Back => {
                    job.reset_for_requeue();
                    self.push_job_status(&job, JobStatus::InQueue).await;
                    self.queue.add_to_back(job)?;
                }
            }
        }

        {
            let mut state = self.state();
            state.error.clear();
            state.current_job = Weak::new();
            state.status = PrinterStatus::Ready;
        }
        self.events.emit(Event::StatusUpdate {
            printer_id: self.id,
            status: PrinterStatus::Ready,
        });
        Ok(())
    }
}

/// Reporting view of a [Printer], served to the request layer.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct PrinterSnapshot {
    /// Registered identifier.
    pub id: i64,
    /// Connection address.
    pub device: String,
    /// Port description.
    pub description: String,
    /// Hardware id.
    pub hwid: String,
    /// Operator-facing name.
    pub name: String,
    /// Current status.
    pub status: PrinterStatus,
    /// Last error text, empty when none.
    pub error: String,
    /// Last reported extruder temperature.
    pub extruder_temp: f64,
    /// Last reported bed temperature.
    pub bed_temp: f64,
    /// The executing job's id, if any.
    pub current_job_id: Option<i64>,
    /// Queued jobs, front first.
    pub queue: Vec<JobSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn statuses_have_wire_spellings() {
        assert_eq!(PrinterStatus::Configuring.to_string(), "configuring");
        assert_eq!(PrinterStatus::Ready.to_string(), "ready");
        assert_eq!("paused".parse::<PrinterStatus>().unwrap(), PrinterStatus::Paused);
    }

    #[test]
    fn terminal_states_need_acknowledgement() {
        assert!(PrinterStatus::Complete.is_terminal());
        assert!(PrinterStatus::Error.is_terminal());
        assert!(PrinterStatus::Cancelled.is_terminal());
        assert!(!PrinterStatus::Printing.is_terminal());
        assert!(!PrinterStatus::Paused.is_terminal());
    }
}
