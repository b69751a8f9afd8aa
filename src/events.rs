//! Fire-and-forget notification sink. The push layer (websockets, SSE,
//! whatever sits in front) subscribes here; nothing in the fleet ever
//! blocks on — or fails because of — delivery.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::{job::JobStatus, printer::PrinterStatus};

/// A status/progress/telemetry notification for observers.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum Event {
    /// A printer's status changed.
    StatusUpdate {
        /// Printer identifier.
        printer_id: i64,
        /// The new status.
        status: PrinterStatus,
    },
    /// A printer's error text changed.
    ErrorUpdate {
        /// Printer identifier.
        printer_id: i64,
        /// The recorded error text.
        error: String,
    },
    /// Fresh temperature telemetry from the device.
    TempUpdate {
        /// Printer identifier.
        printer_id: i64,
        /// Extruder temperature, degrees C.
        extruder_temp: f64,
        /// Bed temperature, degrees C.
        bed_temp: f64,
    },
    /// A job's progress moved.
    ProgressUpdate {
        /// Job identifier.
        job_id: i64,
        /// Percent complete, 0.0 through 100.0.
        progress: f64,
    },
    /// A job's status changed.
    JobStatusUpdate {
        /// Job identifier.
        job_id: i64,
        /// The new status.
        status: JobStatus,
    },
    /// A job's timer started; carries the parsed duration estimate.
    JobTime {
        /// Job identifier.
        job_id: i64,
        /// Estimated total print time in seconds.
        total_time: u64,
    },
}

impl Event {
    /// The wire name of the event, as the push layer exposes it.
    pub fn name(&self) -> &'static str {
        match self {
            Event::StatusUpdate { .. } => "status_update",
            Event::ErrorUpdate { .. } => "error_update",
            Event::TempUpdate { .. } => "temp_update",
            Event::ProgressUpdate { .. } => "progress_update",
            Event::JobStatusUpdate { .. } => "job_status_update",
            Event::JobTime { .. } => "job_time",
        }
    }
}

/// Cheap-to-clone handle on the broadcast channel all fleet components
/// emit into.
#[derive(Clone, Debug)]
pub struct Events {
    tx: broadcast::Sender<Event>,
}

impl Events {
    /// Create a sink buffering up to `capacity` undelivered events per
    /// subscriber; slow subscribers lose the oldest events, not the fleet.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event. Best-effort: having no subscribers is not an error.
    pub fn emit(&self, event: Event) {
        tracing::trace!(event = event.name(), "emit");
        let _ = self.tx.send(event);
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn events_carry_their_wire_names() {
        let event = Event::ProgressUpdate {
            job_id: 7,
            progress: 50.0,
        };
        assert_eq!(event.name(), "progress_update");

        let value = serde_json::to_value(&event).expect("serializable");
        assert_eq!(value["event"], "progress_update");
        assert_eq!(value["payload"]["job_id"], 7);
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let events = Events::default();
        events.emit(Event::JobTime {
            job_id: 1,
            total_time: 90,
        });

        let mut rx = events.subscribe();
        events.emit(Event::JobTime {
            job_id: 2,
            total_time: 90,
        });
        assert_eq!(
            rx.try_recv().expect("delivered"),
            Event::JobTime {
                job_id: 2,
                total_time: 90
            }
        );
    }
}
