//! Half-duplex serial port handling and RTU frame delimiting
//!
//! Owns the serial stream, drives the optional DE/RE direction pin around
//! each transmit and splits the incoming byte stream into frames using the
//! Modbus inter-character idle rule.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, timeout, Instant};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::error::ModbusError;
use crate::frame::MAX_ADU_LEN;

/// Information about an available serial port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortInfo {
    /// Port name (e.g., "COM1" on Windows, "/dev/ttyUSB0" on Linux)
    pub name: String,
    /// Port type (USB, Bluetooth, PCI, Unknown)
    pub port_type: String,
    /// Optional description (e.g., manufacturer and product info for USB)
    pub description: Option<String>,
}

/// Parity configuration for the serial line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SerialParity {
    #[default]
    None,
    Odd,
    Even,
}

impl From<SerialParity> for Parity {
    fn from(p: SerialParity) -> Self {
        match p {
            SerialParity::None => Parity::None,
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
        }
    }
}

/// Stop bits configuration for the serial line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SerialStopBits {
    #[default]
    One,
    Two,
}

impl From<SerialStopBits> for StopBits {
    fn from(s: SerialStopBits) -> Self {
        match s {
            SerialStopBits::One => StopBits::One,
            SerialStopBits::Two => StopBits::Two,
        }
    }
}

/// Data bits configuration for the serial line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SerialDataBits {
    Seven,
    #[default]
    Eight,
}

impl From<SerialDataBits> for DataBits {
    fn from(d: SerialDataBits) -> Self {
        match d {
            SerialDataBits::Seven => DataBits::Seven,
            SerialDataBits::Eight => DataBits::Eight,
        }
    }
}

/// Serial line settings for the RS-485 link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Port path (e.g., "COM1" on Windows, "/dev/ttyUSB0" on Linux)
    pub path: String,
    /// Baud rate (e.g., 9600, 19200, 38400, 57600, 115200)
    pub baud_rate: u32,
    /// Parity setting
    pub parity: SerialParity,
    /// Stop bits setting
    pub stop_bits: SerialStopBits,
    /// Data bits setting
    pub data_bits: SerialDataBits,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            path: String::new(),
            baud_rate: 9600,
            parity: SerialParity::None,
            stop_bits: SerialStopBits::One,
            data_bits: SerialDataBits::Eight,
        }
    }
}

impl SerialSettings {
    /// Create settings for the given port path and baud rate (8N1).
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Time one character occupies on the wire, in microseconds.
    pub fn char_time_us(&self) -> u64 {
        // start bit + data bits + parity bit + stop bits
        let bits_per_char = 1 + match self.data_bits {
            SerialDataBits::Seven => 7,
            SerialDataBits::Eight => 8,
        } + match self.parity {
            SerialParity::None => 0,
            _ => 1,
        } + match self.stop_bits {
            SerialStopBits::One => 1,
            SerialStopBits::Two => 2,
        };

        (bits_per_char as u64 * 1_000_000) / self.baud_rate as u64
    }

    /// T3.5 inter-frame gap for this encoding, in microseconds.
    ///
    /// 3.5 character times, floored at 1750 µs which is the Modbus minimum
    /// for links faster than 19200 baud. Use this to tune an engine's
    /// inter-frame timeout to the actual line speed.
    pub fn inter_frame_timeout_us(&self) -> u64 {
        let t35 = self.char_time_us() * 35 / 10;
        t35.max(1750)
    }
}

/// Drives the DE/RE pin pair of an RS-485 transceiver.
pub trait DriverEnablePin: Send {
    /// Set the electrical level of the direction pin.
    fn set_level(&mut self, high: bool);
}

/// How transmit/receive switching is performed on the half-duplex link.
pub enum Direction {
    /// The UART or transceiver switches by itself; the port leaves the
    /// direction alone.
    Hardware,
    /// The port toggles a dedicated pin around every transmit. The pin sits
    /// at `active_high` while transmitting and the opposite level otherwise.
    Pin {
        pin: Box<dyn DriverEnablePin>,
        active_high: bool,
    },
}

impl fmt::Debug for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Hardware => write!(f, "Hardware"),
            Direction::Pin { active_high, .. } => f
                .debug_struct("Pin")
                .field("active_high", active_high)
                .finish_non_exhaustive(),
        }
    }
}

/// Half-duplex serial port speaking Modbus RTU framing.
///
/// Frames are delimited by inter-character idle time: once any byte of a
/// frame has arrived, a gap of at least the inter-frame timeout marks the
/// end of the frame. Generic over the byte stream so an in-memory duplex
/// link can stand in for the UART under test.
pub struct RtuPort<S> {
    stream: S,
    direction: Direction,
    turnaround: Duration,
    inter_frame_timeout: Duration,
    max_frame_len: usize,
}

impl RtuPort<SerialStream> {
    /// Open a serial port with the given line settings.
    pub fn open(
        settings: &SerialSettings,
        direction: Direction,
        inter_frame_timeout: Duration,
        turnaround: Duration,
    ) -> Result<Self, ModbusError> {
        let builder = tokio_serial::new(&settings.path, settings.baud_rate)
            .parity(settings.parity.into())
            .stop_bits(settings.stop_bits.into())
            .data_bits(settings.data_bits.into());

        let stream = builder
            .open_native_async()
            .map_err(|e| ModbusError::Io(io::Error::new(io::ErrorKind::Other, e)))?;

        log::info!(
            "opened {} at {} baud",
            settings.path,
            settings.baud_rate
        );
        Ok(Self::new(stream, direction, inter_frame_timeout, turnaround))
    }
}

impl<S> RtuPort<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already-open bidirectional byte stream.
    pub fn new(
        stream: S,
        direction: Direction,
        inter_frame_timeout: Duration,
        turnaround: Duration,
    ) -> Self {
        Self {
            stream,
            direction,
            turnaround,
            inter_frame_timeout,
            max_frame_len: MAX_ADU_LEN,
        }
    }

    /// Cap the frame length accepted by [`read_frame`](Self::read_frame).
    pub fn set_max_frame_len(&mut self, len: usize) {
        self.max_frame_len = len;
    }

    fn set_direction(&mut self, tx: bool) {
        if let Direction::Pin { pin, active_high } = &mut self.direction {
            pin.set_level(if tx { *active_high } else { !*active_high });
        }
    }

    /// Drop any bytes sitting in the receive path.
    ///
    /// Anything buffered ahead of a transmit is a stale remnant of an
    /// earlier exchange and would corrupt the next frame read.
    async fn drain_input(&mut self) {
        let mut scratch = [0u8; 64];
        while let Ok(Ok(n)) = timeout(Duration::ZERO, self.stream.read(&mut scratch)).await {
            if n == 0 {
                break;
            }
        }
    }

    /// Transmit one ADU, switching the direction pin around the write.
    pub async fn write_adu(&mut self, adu: &[u8]) -> Result<(), ModbusError> {
        self.drain_input().await;

        if !self.turnaround.is_zero() {
            sleep(self.turnaround).await;
        }
        self.set_direction(true);

        let written = async {
            self.stream.write_all(adu).await?;
            self.stream.flush().await
        }
        .await;

        if !self.turnaround.is_zero() {
            sleep(self.turnaround).await;
        }
        self.set_direction(false);

        written.map_err(ModbusError::from)
    }

    /// Read a single RTU frame.
    ///
    /// Bytes accumulate in small chunks; once any byte has arrived, an idle
    /// gap of at least the inter-frame timeout terminates the frame.
    /// `overall_timeout` caps the whole wait, including the terminating gap.
    pub async fn read_frame(&mut self, overall_timeout: Duration) -> Result<Vec<u8>, ModbusError> {
        let deadline = Instant::now() + overall_timeout;
        let mut frame: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 64];

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(ModbusError::Timeout);
            }

            // Before the first byte only the overall timeout applies; after
            // it, silence of one inter-frame gap ends the frame.
            let wait = if frame.is_empty() {
                deadline - now
            } else {
                self.inter_frame_timeout
            };

            match timeout(wait, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    return Err(ModbusError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial stream closed",
                    )))
                }
                Ok(Ok(n)) => {
                    frame.extend_from_slice(&chunk[..n]);
                    if frame.len() > self.max_frame_len {
                        return Err(ModbusError::FrameTooLarge {
                            len: frame.len(),
                            max: self.max_frame_len,
                        });
                    }
                }
                Ok(Err(e)) => return Err(ModbusError::Io(e)),
                Err(_elapsed) => {
                    if !frame.is_empty() {
                        return Ok(frame);
                    }
                    return Err(ModbusError::Timeout);
                }
            }
        }
    }
}

/// List available serial ports on the system
pub fn available_ports() -> Result<Vec<PortInfo>, ModbusError> {
    let ports = serialport::available_ports()
        .map_err(|e| ModbusError::Io(io::Error::new(io::ErrorKind::Other, e)))?;

    Ok(ports
        .into_iter()
        .map(|p| {
            let (port_type, description) = match &p.port_type {
                serialport::SerialPortType::UsbPort(info) => {
                    let desc = format!(
                        "{} {}",
                        info.manufacturer.as_deref().unwrap_or(""),
                        info.product.as_deref().unwrap_or("")
                    )
                    .trim()
                    .to_string();
                    (
                        "USB".to_string(),
                        if desc.is_empty() { None } else { Some(desc) },
                    )
                }
                serialport::SerialPortType::BluetoothPort => ("Bluetooth".to_string(), None),
                serialport::SerialPortType::PciPort => ("PCI".to_string(), None),
                serialport::SerialPortType::Unknown => ("Unknown".to_string(), None),
            };

            PortInfo {
                name: p.port_name,
                port_type,
                description,
            }
        })
        .collect())
}
