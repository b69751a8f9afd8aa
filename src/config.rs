//! Code for the configuration of the application.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_baud() -> u32 {
    115_200
}

fn default_worker_poll_secs() -> u64 {
    2
}

fn default_pause_poll_secs() -> u64 {
    1
}

fn default_pause_ceiling_secs() -> u64 {
    20 * 60
}

fn default_no_response_limit() -> u32 {
    10
}

fn default_read_timeout_secs() -> u64 {
    1
}

/// The configuration of the application.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Working directory payloads are decompressed into while printing.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    /// Baud rate for serial connections.
    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Seconds between worker-loop polls of each printer.
    #[serde(default = "default_worker_poll_secs")]
    pub worker_poll_secs: u64,

    /// Seconds between status polls while a job is paused.
    #[serde(default = "default_pause_poll_secs")]
    pub pause_poll_secs: u64,

    /// How long a job may stay paused before it is cancelled.
    #[serde(default = "default_pause_ceiling_secs")]
    pub pause_ceiling_secs: u64,

    /// Consecutive empty reads before a printer is declared unresponsive.
    #[serde(default = "default_no_response_limit")]
    pub no_response_limit: u32,

    /// Per-read serial timeout in seconds; an elapsed read counts as one
    /// empty response.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Printers to register at startup.
    #[serde(default)]
    pub printers: Vec<PrinterConfig>,
}

impl Default for Config {
    fn default() -> Self {
        // serde's field defaults are the single source of truth
        toml::from_str("").expect("empty config must deserialize")
    }
}

/// One printer's registration block.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrinterConfig {
    /// Connection address (`/dev/ttyUSB0`, ...).
    pub device: String,
    /// Port description as reported by the host.
    pub description: String,
    /// Hardware id; unique per registered printer.
    pub hwid: String,
    /// Operator-facing name.
    pub name: String,
}

impl Config {
    /// Parse a configuration from a toml file.
    pub fn from_file(file: &PathBuf) -> Result<Self> {
        let config = std::fs::read_to_string(file)?;
        Self::from_str(&config)
    }

    /// Parse a configuration from a toml string.
    pub fn from_str(config: &str) -> Result<Self> {
        toml::from_str(config).map_err(|e| Error::Parse(e.to_string()))
    }

    /// The resolved runtime tunables handed to printers and workers.
    pub fn settings(&self) -> Settings {
        Settings {
            upload_dir: self.upload_dir.clone(),
            baud: self.baud,
            worker_poll: Duration::from_secs(self.worker_poll_secs),
            pause_poll: Duration::from_secs(self.pause_poll_secs),
            pause_ceiling: Duration::from_secs(self.pause_ceiling_secs),
            no_response_limit: self.no_response_limit,
            read_timeout: Duration::from_secs(self.read_timeout_secs),
        }
    }
}

/// Runtime view of the tunables. These are design parameters, not
/// incidental constants: the poll intervals in particular set how quickly
/// workers notice queued work and how fast an operator resume is observed.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Working directory for staged payloads.
    pub upload_dir: PathBuf,
    /// Serial baud rate.
    pub baud: u32,
    /// Worker-loop poll interval.
    pub worker_poll: Duration,
    /// Pause-wait poll interval.
    pub pause_poll: Duration,
    /// Pause-wait ceiling; exceeding it cancels the job.
    pub pause_ceiling: Duration,
    /// Consecutive empty reads tolerated before failing.
    pub no_response_limit: u32,
    /// Per-read serial timeout.
    pub read_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Config::default().settings()
    }
}
