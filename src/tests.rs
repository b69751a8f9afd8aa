use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use testresult::TestResult;

use crate::{
    config::Settings,
    device::{Connect, Connection},
    events::{Event, Events},
    job::{Job, JobStatus},
    printer::{Printer, PrinterStatus, Requeue},
    queue::Queue,
    store::{JobStore, MemoryStore},
    supervisor::{BumpMove, Fleet},
};

const GCODE: &str = "\
;FLAVOR:Marlin
;TIME:3661
G28 ; home
G92 E0
G1 X10 Y10
G1 X20 Y20
";

/// How the scripted device behaves for a whole connection.
#[derive(Clone, Copy, Debug)]
enum Behavior {
    /// Acknowledge every line.
    Ack,
    /// Refuse to open the connection at all.
    Refuse,
    /// Never answer anything.
    Silent,
    /// Acknowledge the first n lines, then report an error.
    ErrorAfter(usize),
    /// Telemetry and a heating-wait before each acknowledgement.
    Chatty,
}

struct ScriptedConnector {
    behavior: Behavior,
    line_delay: Duration,
    sent: Arc<Mutex<Vec<String>>>,
}

impl ScriptedConnector {
    fn new(behavior: Behavior, line_delay: Duration) -> Self {
        Self {
            behavior,
            line_delay,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn sent(&self) -> Arc<Mutex<Vec<String>>> {
        self.sent.clone()
    }
}

#[async_trait]
impl Connect for ScriptedConnector {
    async fn connect(&self, _device: &str, _baud: u32) -> std::io::Result<Box<dyn Connection>> {
        if matches!(self.behavior, Behavior::Refuse) {
            return Err(std::io::Error::other("no such device"));
        }
        Ok(Box::new(ScriptedConnection {
            behavior: self.behavior,
            line_delay: self.line_delay,
            sent: self.sent.clone(),
            responses: VecDeque::new(),
            lines_seen: 0,
        }))
    }
}

struct ScriptedConnection {
    behavior: Behavior,
    line_delay: Duration,
    sent: Arc<Mutex<Vec<String>>>,
    responses: VecDeque<String>,
    lines_seen: usize,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn send(&mut self, line: &str) -> std::io::Result<()> {
        self.sent.lock().expect("sent lines poisoned").push(line.to_string());
        self.lines_seen += 1;
        match self.behavior {
            Behavior::Ack | Behavior::Refuse => self.responses.push_back("ok".to_string()),
            Behavior::Silent => {}
            Behavior::ErrorAfter(n) => {
                if self.lines_seen > n {
                    self.responses.push_back("Error:Thermal Runaway".to_string());
                } else {
                    self.responses.push_back("ok".to_string());
                }
            }
            Behavior::Chatty => {
                self.responses.push_back("T:210.4 /210.0 B:60.1 /60.0".to_string());
                self.responses.push_back("T:182.5 E:0 W:28".to_string());
                self.responses.push_back("ok".to_string());
            }
        }
        Ok(())
    }

    async fn receive(&mut self) -> std::io::Result<String> {
        if !self.line_delay.is_zero() {
            tokio::time::sleep(self.line_delay).await;
        }
        Ok(self.responses.pop_front().unwrap_or_default())
    }
}

static TEST_DIR: AtomicUsize = AtomicUsize::new(0);

fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!(
        "fleet-api-test-{}-{}",
        std::process::id(),
        TEST_DIR.fetch_add(1, Ordering::Relaxed)
    ))
}

/// Poll (in virtual time, under `start_paused`) until the condition holds;
/// real I/O between awaits makes fixed sleeps racy.
async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..100_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("never reached: {what}");
}

struct Harness {
    printer: Arc<Printer>,
    store: Arc<MemoryStore>,
    events: Events,
    sent: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    async fn new(behavior: Behavior, line_delay: Duration) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let events = Events::default();
        let connector = ScriptedConnector::new(behavior, line_delay);
        let sent = connector.sent();

        store
            .register_printer("/dev/ttyACM0", "Original Prusa i3 MK3", "hwid-a", "alpha")
            .await
            .expect("registration");
        let record = store.registered_printers().await.expect("registered")[0].clone();

        let mut settings = Settings::default();
        settings.upload_dir = scratch_dir();
        let printer = Arc::new(Printer::new(
            &record,
            Queue::new(),
            store.clone(),
            events.clone(),
            Arc::new(connector),
            settings,
        ));

        Harness {
            printer,
            store,
            events,
            sent,
        }
    }

    /// Persist and enqueue a job, the way the request layer does.
    async fn enqueue(&self, gcode: &str) -> Arc<Job> {
        let id = self
            .store
            .insert_job_history("benchy", self.printer.id(), JobStatus::InQueue, gcode.as_bytes(), "benchy.gcode")
            .await
            .expect("insert");
        let job = Arc::new(Job::new(id, "benchy", self.printer.id(), "benchy.gcode", self.events.clone()));
        self.printer.queue().add_to_back(job.clone()).expect("enqueue");
        job
    }

    fn sent_lines(&self) -> Vec<String> {
        self.sent.lock().expect("sent lines poisoned").clone()
    }
}

#[tokio::test]
async fn initialization_homes_and_readies() -> TestResult {
    let h = Harness::new(Behavior::Ack, Duration::ZERO).await;
    h.printer.initialize().await?;
    assert_eq!(h.printer.status(), PrinterStatus::Ready);
    assert_eq!(h.sent_lines(), vec!["G28".to_string(), "G92 E0".to_string()]);
    Ok(())
}

#[tokio::test]
async fn initialization_failure_records_the_error() {
    let h = Harness::new(Behavior::Refuse, Duration::ZERO).await;
    assert!(h.printer.initialize().await.is_err());
    assert_eq!(h.printer.status(), PrinterStatus::Error);
    assert!(!h.printer.error().is_empty());
}

#[tokio::test]
async fn successful_run_completes_with_full_progress() -> TestResult {
    let h = Harness::new(Behavior::Ack, Duration::ZERO).await;
    let mut rx = h.events.subscribe();
    let job = h.enqueue(GCODE).await;
    h.printer.set_status(PrinterStatus::Ready);

    h.printer.run_job(job.clone()).await;

    assert_eq!(h.printer.status(), PrinterStatus::Complete);
    assert_eq!(job.status(), JobStatus::Complete);
    assert_eq!(job.total_time_seconds(), 3661);
    assert!((job.progress() - 100.0).abs() < f64::EPSILON);
    // only the command lines went out, comments stripped
    assert_eq!(
        h.sent_lines(),
        vec!["G28".to_string(), "G92 E0".to_string(), "G1 X10 Y10".to_string(), "G1 X20 Y20".to_string()]
    );
    // the finished job waits in the queue for the operator release
    assert_eq!(h.printer.queue().peek_next().map(|j| j.id()), Some(job.id()));
    assert_eq!(h.store.find_job(job.id()).await?.map(|r| r.status), Some(JobStatus::Complete));

    // observed progress is non-decreasing and ends at 100
    let mut progress = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Event::ProgressUpdate { progress: p, .. } = event {
            progress.push(p);
        }
    }
    assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!((progress.last().copied().unwrap_or_default() - 100.0).abs() < f64::EPSILON);
    Ok(())
}

#[tokio::test]
async fn connection_failure_fails_the_job() -> TestResult {
    let h = Harness::new(Behavior::Refuse, Duration::ZERO).await;
    let job = h.enqueue(GCODE).await;
    h.printer.set_status(PrinterStatus::Ready);

    h.printer.run_job(job.clone()).await;

    assert_eq!(h.printer.status(), PrinterStatus::Error);
    assert!(h.printer.error().contains("not connected"));
    assert_eq!(job.status(), JobStatus::Error);
    assert_eq!(h.printer.queue().size(), 0);
    assert_eq!(h.store.find_job(job.id()).await?.map(|r| r.status), Some(JobStatus::Error));
    Ok(())
}

#[tokio::test]
async fn device_reported_error_aborts_the_stream() {
    let h = Harness::new(Behavior::ErrorAfter(2), Duration::ZERO).await;
    let job = h.enqueue(GCODE).await;
    h.printer.set_status(PrinterStatus::Ready);

    h.printer.run_job(job.clone()).await;

    assert_eq!(h.printer.status(), PrinterStatus::Error);
    assert!(h.printer.error().contains("Thermal Runaway"));
    assert_eq!(job.status(), JobStatus::Error);
    assert_eq!(h.printer.queue().size(), 0);
    // the stream stopped early
    assert!(h.sent_lines().len() < 4);
}

#[tokio::test]
async fn silence_trips_the_no_response_threshold() {
    let h = Harness::new(Behavior::Silent, Duration::ZERO).await;
    let job = h.enqueue(GCODE).await;
    h.printer.set_status(PrinterStatus::Ready);

    h.printer.run_job(job.clone()).await;

    assert_eq!(h.printer.status(), PrinterStatus::Error);
    assert_eq!(h.printer.error(), "no response from printer");
    assert_eq!(job.status(), JobStatus::Error);
    assert_eq!(h.printer.queue().size(), 0);
}

#[tokio::test]
async fn telemetry_and_heating_waits_feed_reporting() {
    let h = Harness::new(Behavior::Chatty, Duration::ZERO).await;
    let job = h.enqueue(GCODE).await;
    h.printer.set_status(PrinterStatus::Ready);

    h.printer.run_job(job.clone()).await;

    assert_eq!(job.status(), JobStatus::Complete);
    assert_eq!(h.printer.temperatures(), (210.4, 60.1));
    assert!(job.timer_started());
}

#[tokio::test(start_paused = true)]
async fn external_abort_is_observed_between_lines() {
    let h = Harness::new(Behavior::Ack, Duration::from_millis(50)).await;
    let job = h.enqueue(GCODE).await;
    h.printer.set_status(PrinterStatus::Ready);

    let printer = h.printer.clone();
    let run = tokio::spawn({
        let job = job.clone();
        async move { printer.run_job(job).await }
    });

    // let a couple of lines go out, then force completion from outside
    let sent = h.sent.clone();
    wait_until("two lines sent", || sent.lock().expect("sent lines poisoned").len() >= 2).await;
    h.printer.set_status(PrinterStatus::Complete);
    run.await.expect("runner");

    assert_eq!(job.status(), JobStatus::Cancelled);
    // cancellation latency is bounded by one line round trip
    assert!(h.sent_lines().len() < 4 + crate::gcode::ENDING_SEQUENCE.len());
    // the ending sequence parked the device
    assert!(h.sent_lines().iter().any(|line| line == "M84"));
}

#[tokio::test(start_paused = true)]
async fn deleting_the_active_job_is_tolerated() {
    let h = Harness::new(Behavior::Ack, Duration::from_millis(50)).await;
    let job = h.enqueue(GCODE).await;
    h.printer.set_status(PrinterStatus::Ready);

    let printer = h.printer.clone();
    let run = tokio::spawn({
        let job = job.clone();
        async move { printer.run_job(job).await }
    });

    let sent = h.sent.clone();
    wait_until("first line sent", || !sent.lock().expect("sent lines poisoned").is_empty()).await;
    assert!(h.printer.queue().delete_job(job.id()));
    run.await.expect("runner");

    // execution finished without the queue re-owning the job
    assert_eq!(job.status(), JobStatus::Complete);
    assert_eq!(h.printer.queue().size(), 0);
}

#[tokio::test(start_paused = true)]
async fn filament_change_pauses_until_the_operator_resumes() {
    let h = Harness::new(Behavior::Ack, Duration::ZERO).await;
    let job = h.enqueue("G28\nM600\nG1 X5\n").await;
    h.printer.set_status(PrinterStatus::Ready);

    let printer = h.printer.clone();
    let run = tokio::spawn({
        let job = job.clone();
        async move { printer.run_job(job).await }
    });

    let printer = h.printer.clone();
    wait_until("printer paused", move || printer.status() == PrinterStatus::Paused).await;

    h.printer.set_status(PrinterStatus::Printing);
    run.await.expect("runner");

    assert_eq!(job.status(), JobStatus::Complete);
    assert_eq!(h.printer.status(), PrinterStatus::Complete);
    assert_eq!(
        h.sent_lines(),
        vec!["G28".to_string(), "M600".to_string(), "G1 X5".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn an_external_pause_holds_and_resends_the_pending_line() {
    let h = Harness::new(Behavior::Ack, Duration::from_millis(50)).await;
    let job = h.enqueue("G28\nG1 X1\nG1 X2\n").await;
    h.printer.set_status(PrinterStatus::Ready);

    let printer = h.printer.clone();
    let run = tokio::spawn({
        let job = job.clone();
        async move { printer.run_job(job).await }
    });

    // pause from outside while the second line is in flight, then wait
    // for the executor to park the head before resuming
    let sent = h.sent.clone();
    wait_until("two lines sent", || sent.lock().expect("sent lines poisoned").len() >= 2).await;
    h.printer.set_status(PrinterStatus::Paused);
    let sent = h.sent.clone();
    wait_until("filament change sent", || {
        sent.lock().expect("sent lines poisoned").iter().any(|line| line == "M600")
    })
    .await;
    // give the executor time to see the ack and park in the wait loop
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.printer.set_status(PrinterStatus::Printing);
    run.await.expect("runner");

    assert_eq!(job.status(), JobStatus::Complete);
    let sent = h.sent_lines();
    // the paused line went out after the filament-change hold, not before
    assert!(sent.iter().any(|line| line == "M600"));
    assert_eq!(sent.iter().filter(|line| *line == "G1 X2").count(), 1);
    assert_eq!(sent.last().map(String::as_str), Some("G1 X2"));
}

#[tokio::test(start_paused = true)]
async fn pausing_past_the_ceiling_cancels_the_job() {
    let h = Harness::new(Behavior::Ack, Duration::ZERO).await;
    let job = h.enqueue("G28\nM600\nG1 X5\n").await;
    h.printer.set_status(PrinterStatus::Ready);

    h.printer.run_job(job.clone()).await;

    assert_eq!(job.status(), JobStatus::Cancelled);
    assert_eq!(h.printer.status(), PrinterStatus::Complete);
    // the ending sequence ran before disconnecting
    assert!(h.sent_lines().iter().any(|line| line == "M84"));
}

#[tokio::test]
async fn release_requeues_at_the_chosen_end() -> TestResult {
    let h = Harness::new(Behavior::Ack, Duration::ZERO).await;
    let job = h.enqueue(GCODE).await;
    h.printer.set_status(PrinterStatus::Ready);
    h.printer.run_job(job.clone()).await;
    assert_eq!(h.printer.status(), PrinterStatus::Complete);

    h.printer.release(Requeue::Back).await?;

    assert_eq!(h.printer.status(), PrinterStatus::Ready);
    assert_eq!(h.printer.error(), "");
    assert!(h.printer.current_job().is_none());
    let requeued = h.printer.queue().peek_next().expect("requeued job");
    assert_eq!(requeued.id(), job.id());
    assert_eq!(requeued.status(), JobStatus::InQueue);
    assert_eq!(requeued.progress(), 0.0);

    // a second release from ready is a no-op
    h.printer.release(Requeue::Discard).await?;
    assert_eq!(h.printer.queue().size(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn workers_drain_their_queues() -> TestResult {
    let store = Arc::new(MemoryStore::new());
    let events = Events::default();
    let connector = ScriptedConnector::new(Behavior::Ack, Duration::ZERO);
    let mut settings = Settings::default();
    settings.upload_dir = scratch_dir();
    let fleet = Fleet::new(store.clone(), events, Arc::new(connector), settings);

    store
        .register_printer("/dev/ttyACM0", "Original Prusa i3 MK3", "hwid-a", "alpha")
        .await?;
    fleet.spawn_registered().await?;

    let job = fleet.submit_job(1, "benchy", GCODE.as_bytes(), "benchy.gcode").await?;
    // the first tick initializes, a later one picks the job up
    let watched = job.clone();
    wait_until("job complete", move || watched.status() == JobStatus::Complete).await;

    assert_eq!(job.status(), JobStatus::Complete);
    let snapshot = &fleet.list_all()[0];
    assert_eq!(snapshot.status, PrinterStatus::Complete);

    fleet.release_printer(1, Requeue::Discard).await?;
    assert_eq!(fleet.find_printer(1)?.queue().size(), 0);
    Ok(())
}

#[tokio::test]
async fn the_registry_finds_resets_and_rejects_duplicates() -> TestResult {
    let store = Arc::new(MemoryStore::new());
    let connector = ScriptedConnector::new(Behavior::Refuse, Duration::ZERO);
    let mut settings = Settings::default();
    settings.upload_dir = scratch_dir();
    let fleet = Fleet::new(
        store.clone(),
        Events::default(),
        Arc::new(connector),
        settings,
    );

    let printer = fleet.register_device("/dev/ttyACM0", "prusa", "hwid-a", "alpha").await?;
    assert_eq!(fleet.find_printer(printer.id())?.id(), printer.id());
    assert!(fleet.find_printer(99).is_err());

    // same hwid is rejected by the store
    assert!(fleet.register_device("/dev/ttyACM1", "prusa", "hwid-a", "beta").await.is_err());

    // a reset keeps identity and queue but recreates the runtime object
    let job = fleet.submit_job(printer.id(), "benchy", GCODE.as_bytes(), "benchy.gcode").await?;
    let replacement = fleet.reset_worker(printer.id())?;
    assert_eq!(replacement.id(), printer.id());
    assert_eq!(replacement.status(), PrinterStatus::Configuring);
    assert_eq!(replacement.queue().peek_next().map(|j| j.id()), Some(job.id()));

    assert_eq!(fleet.list_all().len(), 1);
    Ok(())
}

#[tokio::test]
async fn queue_operations_route_through_the_fleet() -> TestResult {
    let store = Arc::new(MemoryStore::new());
    let connector = ScriptedConnector::new(Behavior::Refuse, Duration::ZERO);
    let mut settings = Settings::default();
    settings.upload_dir = scratch_dir();
    let fleet = Fleet::new(
        store.clone(),
        Events::default(),
        Arc::new(connector),
        settings,
    );
    let printer = fleet.register_device("/dev/ttyACM0", "prusa", "hwid-a", "alpha").await?;

    let first = fleet.submit_job(printer.id(), "one", GCODE.as_bytes(), "one.gcode").await?;
    let second = fleet.submit_job(printer.id(), "two", GCODE.as_bytes(), "two.gcode").await?;
    let third = fleet.submit_job(printer.id(), "three", GCODE.as_bytes(), "three.gcode").await?;

    fleet.bump_job(printer.id(), third.id(), BumpMove::Front)?;
    assert_eq!(printer.queue().peek_next().map(|j| j.id()), Some(third.id()));
    fleet.bump_job(printer.id(), third.id(), BumpMove::Down)?;
    assert_eq!(printer.queue().peek_next().map(|j| j.id()), Some(first.id()));

    fleet.cancel_job(second.id()).await?;
    assert_eq!(printer.queue().size(), 2);
    assert_eq!(second.status(), JobStatus::Cancelled);
    assert_eq!(store.find_job(second.id()).await?.map(|r| r.status), Some(JobStatus::Cancelled));
    assert!(fleet.cancel_job(second.id()).await.is_err());

    // a re-run duplicates the stored payload as a fresh job
    let rerun = fleet.rerun_job(second.id(), printer.id()).await?;
    assert_ne!(rerun.id(), second.id());
    assert_eq!(rerun.status(), JobStatus::InQueue);
    assert_eq!(printer.queue().size(), 3);
    Ok(())
}

#[tokio::test]
async fn auto_queue_prefers_the_shortest_queue() -> TestResult {
    let store = Arc::new(MemoryStore::new());
    let connector = ScriptedConnector::new(Behavior::Refuse, Duration::ZERO);
    let mut settings = Settings::default();
    settings.upload_dir = scratch_dir();
    let fleet = Fleet::new(
        store.clone(),
        Events::default(),
        Arc::new(connector),
        settings,
    );
    let alpha = fleet.register_device("/dev/ttyACM0", "prusa", "hwid-a", "alpha").await?;
    let beta = fleet.register_device("/dev/ttyACM1", "prusa", "hwid-b", "beta").await?;

    fleet.submit_job(alpha.id(), "one", GCODE.as_bytes(), "one.gcode").await?;
    let routed = fleet.auto_queue("two", GCODE.as_bytes(), "two.gcode").await?;

    assert_eq!(routed.printer_id(), beta.id());
    assert_eq!(beta.queue().size(), 1);
    Ok(())
}

#[tokio::test]
async fn restored_queues_pick_up_pending_jobs() -> TestResult {
    let store = Arc::new(MemoryStore::new());
    let connector = ScriptedConnector::new(Behavior::Refuse, Duration::ZERO);
    let mut settings = Settings::default();
    settings.upload_dir = scratch_dir();

    store.register_printer("/dev/ttyACM0", "prusa", "hwid-a", "alpha").await?;
    let pending = store
        .insert_job_history("benchy", 1, JobStatus::InQueue, GCODE.as_bytes(), "benchy.gcode")
        .await?;
    store
        .insert_job_history("done", 1, JobStatus::Complete, GCODE.as_bytes(), "done.gcode")
        .await?;

    let fleet = Fleet::new(
        store.clone(),
        Events::default(),
        Arc::new(connector),
        settings,
    );
    fleet.spawn_registered().await?;
    fleet.restore_queues().await?;

    let printer = fleet.find_printer(1)?;
    assert_eq!(printer.queue().size(), 1);
    assert_eq!(printer.queue().peek_next().map(|j| j.id()), Some(pending));
    Ok(())
}
