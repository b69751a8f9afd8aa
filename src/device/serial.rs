//! USB/serial transport backed by [tokio_serial].

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::{Connect, Connection};

/// Opens raw serial connections to printers on their device nodes
/// (`/dev/ttyUSB0` and friends).
#[derive(Clone, Copy, Debug)]
pub struct SerialConnector {
    read_timeout: Duration,
}

impl SerialConnector {
    /// A connector whose reads give up (yielding an empty response) after
    /// `read_timeout` of silence.
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl Connect for SerialConnector {
    async fn connect(&self, device: &str, baud: u32) -> std::io::Result<Box<dyn Connection>> {
        let stream = tokio_serial::new(device, baud)
            .open_native_async()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(Box::new(SerialConnection {
            reader: BufReader::new(reader),
            writer,
            read_timeout: self.read_timeout,
        }))
    }
}

struct SerialConnection {
    reader: BufReader<ReadHalf<SerialStream>>,
    writer: WriteHalf<SerialStream>,
    read_timeout: Duration,
}

#[async_trait]
impl Connection for SerialConnection {
    async fn send(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(format!("{}\n", line).as_bytes()).await?;
        self.writer.flush().await
    }

    async fn receive(&mut self) -> std::io::Result<String> {
        let mut line = String::new();
        match tokio::time::timeout(self.read_timeout, self.reader.read_line(&mut line)).await {
            Ok(read) => {
                read?;
                Ok(line.trim().to_string())
            }
            // a quiet link is an empty response, not a failure
            Err(_) => Ok(String::new()),
        }
    }
}
