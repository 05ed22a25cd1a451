//! modrtu - Modbus RTU engine for RS-485 serial buses
//!
//! Implements both sides of a Modbus RTU link over a half-duplex serial
//! port: a master that issues serialised request/response transactions and
//! a slave that serves requests from a [`SlaveHandler`] on a background
//! reader task. Frames are delimited by inter-character idle time and
//! protected by the Modbus CRC-16.
//!
//! The engines run on tokio and are generic over the byte stream, so the
//! same code drives a real `tokio-serial` UART in production and an
//! in-memory duplex link under test.

pub mod bank;
pub mod bits;
pub mod error;
pub mod frame;
pub mod master;
pub mod port;
pub mod slave;

// Re-export the public surface for convenience
pub use bank::{BankSettings, RegisterBank};
pub use error::{AccessError, ExceptionCode, ExceptionResponse, ModbusError};
pub use master::{MasterConfig, RtuMaster};
pub use port::{
    available_ports, Direction, DriverEnablePin, PortInfo, RtuPort, SerialDataBits, SerialParity,
    SerialSettings, SerialStopBits,
};
pub use slave::{RtuSlave, SlaveConfig, SlaveHandler};
