//! Serial line transport (RS-232)

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, info};

use super::{Session, Transport};
use crate::{Error, Operation, RawOutput, Result, SerialLine, Target, TransportKind};

/// Upper bound on bytes collected by a single read
pub const MAX_READ_BYTES: usize = 1 << 20;

/// Serial port transport
#[derive(Debug, Default, Clone)]
pub struct SerialTransport;

impl SerialTransport {
    pub fn new() -> Self {
        Self
    }
}

fn data_bits(bits: u8) -> Result<DataBits> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(Error::InvalidRequest(format!("unsupported data bits: {}", other))),
    }
}

fn parity(p: char) -> Result<Parity> {
    match p.to_ascii_uppercase() {
        'N' => Ok(Parity::None),
        'E' => Ok(Parity::Even),
        'O' => Ok(Parity::Odd),
        other => Err(Error::InvalidRequest(format!("unsupported parity: {}", other))),
    }
}

fn stop_bits(bits: u8) -> Result<StopBits> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        other => Err(Error::InvalidRequest(format!("unsupported stop bits: {}", other))),
    }
}

/// Check line parameters without opening a port
pub fn validate_line(line: &SerialLine) -> Result<()> {
    if line.baudrate == 0 {
        return Err(Error::InvalidRequest("baudrate must be positive".to_string()));
    }
    data_bits(line.data_bits)?;
    parity(line.parity)?;
    stop_bits(line.stop_bits)?;
    Ok(())
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    async fn connect(&self, target: &Target, timeout: Duration) -> Result<Box<dyn Session>> {
        let Target::Serial(serial) = target else {
            return Err(Error::InvalidRequest(format!(
                "serial transport cannot reach {}",
                target.display()
            )));
        };

        let line = serial.line;
        info!(
            port = %serial.port,
            baudrate = line.baudrate,
            timeout_secs = timeout.as_secs_f64(),
            "Opening serial port"
        );

        let stream = tokio_serial::new(&serial.port, line.baudrate)
            .data_bits(data_bits(line.data_bits)?)
            .parity(parity(line.parity)?)
            .stop_bits(stop_bits(line.stop_bits)?)
            .timeout(timeout)
            .open_native_async()
            .map_err(|e| Error::TransportConnect(format!("{}: {}", serial.port, e)))?;

        Ok(Box::new(SerialSession {
            stream,
            port: serial.port.clone(),
        }))
    }
}

struct SerialSession {
    stream: SerialStream,
    port: String,
}

#[async_trait]
impl Session for SerialSession {
    async fn execute(&mut self, operation: &Operation, timeout: Duration) -> Result<RawOutput> {
        let stdout = match operation {
            Operation::Read => read_until_idle(&mut self.stream, timeout, MAX_READ_BYTES).await?,
            Operation::Write { text } => {
                write_text(&mut self.stream, text).await?;
                String::new()
            }
            Operation::WriteThenRead { text } => {
                write_text(&mut self.stream, text).await?;
                read_until_idle(&mut self.stream, timeout, MAX_READ_BYTES).await?
            }
            Operation::Exec { .. } => {
                return Err(Error::InvalidRequest(
                    "exec is not a serial operation".to_string(),
                ))
            }
        };

        debug!(port = %self.port, op = operation.name(), bytes = stdout.len(), "Serial operation done");

        Ok(RawOutput {
            stdout,
            ..Default::default()
        })
    }

    async fn close(self: Box<Self>) -> Result<()> {
        // Dropping the stream releases the port
        debug!(port = %self.port, "Closing serial port");
        Ok(())
    }
}

/// Write `text` and flush
pub async fn write_text<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> Result<()> {
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read until the line stays quiet for `idle`, the peer closes, or `limit` bytes arrived.
///
/// Invalid UTF-8 is replaced rather than rejected.
pub async fn read_until_idle<R: AsyncRead + Unpin>(
    reader: &mut R,
    idle: Duration,
    limit: usize,
) -> Result<String> {
    let mut output = Vec::new();
    let mut buf = [0u8; 512];

    loop {
        match tokio::time::timeout(idle, reader.read(&mut buf)).await {
            Err(_) => break,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                output.extend_from_slice(&buf[..n]);
                if output.len() >= limit {
                    output.truncate(limit);
                    break;
                }
            }
            Ok(Err(e)) => return Err(Error::IoError(e)),
        }
    }

    Ok(String::from_utf8_lossy(&output).into_owned())
}
