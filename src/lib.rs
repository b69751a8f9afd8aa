#![deny(missing_docs)]
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(unused_qualifications)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

//! This crate manages a fleet of physical 3D printers, each with its own
//! job queue, and drives each one through a line-oriented serial gcode
//! protocol: one worker per printer polls device state and drains that
//! printer's queue, while operators concurrently enqueue, reorder, cancel
//! and acknowledge.

pub mod config;
pub mod device;
mod errors;
pub mod events;
pub mod gcode;
mod job;
pub mod payload;
mod printer;
mod queue;
pub mod store;
mod supervisor;

#[cfg(test)]
mod tests;

pub use config::{Config, PrinterConfig, Settings};
pub use errors::{Error, Result};
pub use events::{Event, Events};
pub use job::{parse_estimated_duration, resolved_file_name, Job, JobSnapshot, JobStatus};
pub use printer::{Printer, PrinterSnapshot, PrinterStatus, Requeue};
pub use queue::Queue;
pub use supervisor::{BumpMove, Fleet};
