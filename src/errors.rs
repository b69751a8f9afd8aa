//! Error taxonomy shared by the fleet, printers, queues and the durable
//! store interface.

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while driving the fleet.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device connection could not be opened.
    #[error("failed to open device connection: {0}")]
    Connection(String),

    /// The printer stopped answering; the consecutive empty-read threshold
    /// was reached.
    #[error("no response from printer after {0} consecutive reads")]
    NoResponse(u32),

    /// The device answered with an error token.
    #[error("device reported error: {0}")]
    DeviceReported(String),

    /// Input that should match a known format did not: a duration
    /// annotation in gcode comments, or a configuration file.
    #[error("unrecognized format: {0}")]
    Parse(String),

    /// No printer or job matches the given identifier.
    #[error("{0} not found")]
    NotFound(String),

    /// A printer with this hardware id (or an already-running worker) exists.
    #[error("{0} already registered")]
    Duplicate(String),

    /// A durable-store operation failed.
    #[error("durable store failure: {0}")]
    Store(String),

    /// Raw I/O failure on the serial link or the working directory.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
