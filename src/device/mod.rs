//! The serial-link seam: transport traits, the per-job session, and
//! response classification.
//!
//! The wire format is newline-terminated ASCII lines in both directions;
//! everything smarter than that lives in [crate::printer]'s protocol loop.

use async_trait::async_trait;

use crate::gcode;

#[cfg(feature = "serial")]
mod serial;
#[cfg(feature = "serial")]
pub use serial::SerialConnector;

/// One open line-oriented link to a device.
#[async_trait]
pub trait Connection: Send {
    /// Write `line` plus the newline terminator.
    async fn send(&mut self, line: &str) -> std::io::Result<()>;

    /// Read one response line, trimmed. A quiet link (per-read timeout
    /// elapsed) yields an empty string rather than an error; the caller's
    /// no-response accounting depends on that.
    async fn receive(&mut self) -> std::io::Result<String>;
}

/// Opens [Connection]s for a device address. The fleet holds one connector
/// and tests substitute their own.
#[async_trait]
pub trait Connect: Send + Sync {
    /// Open a connection to `device` at `baud`.
    async fn connect(&self, device: &str, baud: u32) -> std::io::Result<Box<dyn Connection>>;
}

/// A device connection exclusively owned by one worker for the duration of
/// one initialization or job. Dropping the session disconnects.
pub struct DeviceSession {
    conn: Box<dyn Connection>,
}

impl DeviceSession {
    /// Wrap a freshly opened connection.
    pub fn new(conn: Box<dyn Connection>) -> Self {
        Self { conn }
    }

    /// Write one command line.
    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        tracing::trace!(line, "send");
        self.conn.send(line).await
    }

    /// Read one response line.
    pub async fn read_response(&mut self) -> std::io::Result<String> {
        let response = self.conn.receive().await?;
        if !response.is_empty() {
            tracing::trace!(response, "recv");
        }
        Ok(response)
    }
}

/// What a single response line means to the protocol.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// Nothing arrived before the per-read timeout.
    Empty,
    /// The device reported an error.
    Error,
    /// Temperature telemetry for the extruder and bed.
    Temperature {
        /// Extruder temperature, degrees C.
        extruder: f64,
        /// Bed temperature, degrees C.
        bed: f64,
    },
    /// The device is holding on a heating-wait command.
    HeatingWait,
    /// The last command was accepted.
    Ack,
    /// Chatter; keep reading.
    Other,
}

/// Classify one trimmed response line.
pub fn classify(response: &str) -> Response {
    if response.is_empty() {
        return Response::Empty;
    }
    if response.to_ascii_lowercase().contains(gcode::ERROR_TOKEN) {
        return Response::Error;
    }
    if let Some((extruder, bed)) = gcode::parse_temperatures(response) {
        return Response::Temperature { extruder, bed };
    }
    if response.contains(gcode::HEATING_WAIT_TOKEN) {
        return Response::HeatingWait;
    }
    if response.contains(gcode::ACK_TOKEN) {
        return Response::Ack;
    }
    Response::Other
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn classifies_the_protocol_vocabulary() {
        assert_eq!(classify(""), Response::Empty);
        assert_eq!(classify("Error:Printer halted. kill() called!"), Response::Error);
        assert_eq!(
            classify("T:210.4 /210.0 B:60.1 /60.0 @:127"),
            Response::Temperature {
                extruder: 210.4,
                bed: 60.1
            }
        );
        assert_eq!(classify("T:182.5 E:0 W:28"), Response::HeatingWait);
        assert_eq!(classify("ok"), Response::Ack);
        assert_eq!(classify("echo:busy processing"), Response::Other);
    }

    #[test]
    fn telemetry_wins_over_the_embedded_ack() {
        // telemetry replies carry an "ok" too; they must keep the read
        // loop alive rather than acknowledge the command
        assert!(matches!(
            classify("ok T:210.4 /210.0 B:60.1 /60.0"),
            Response::Temperature { .. }
        ));
    }
}
