//! Error types shared by the master and slave engines

use std::fmt;

use thiserror::Error;

/// Standard Modbus exception codes carried in an exception response PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    /// 0x01: the slave does not implement the requested function
    IllegalFunction,
    /// 0x02: the requested range falls outside the slave's data areas
    IllegalDataAddress,
    /// 0x03: a field in the request is outside its legal range
    IllegalDataValue,
    /// 0x04: the slave failed internally while servicing the request
    SlaveDeviceFailure,
    /// Any other code a slave may emit
    Other(u8),
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::SlaveDeviceFailure,
            other => ExceptionCode::Other(other),
        }
    }
}

impl From<ExceptionCode> for u8 {
    fn from(code: ExceptionCode) -> Self {
        match code {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::SlaveDeviceFailure => 0x04,
            ExceptionCode::Other(other) => other,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionCode::IllegalFunction => write!(f, "illegal function (0x01)"),
            ExceptionCode::IllegalDataAddress => write!(f, "illegal data address (0x02)"),
            ExceptionCode::IllegalDataValue => write!(f, "illegal data value (0x03)"),
            ExceptionCode::SlaveDeviceFailure => write!(f, "slave device failure (0x04)"),
            ExceptionCode::Other(code) => write!(f, "exception {:#04x}", code),
        }
    }
}

/// A well-formed exception response received from a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionResponse {
    /// Function code of the failed request (bit 7 cleared)
    pub function: u8,
    /// Exception code from byte 2 of the response PDU
    pub code: ExceptionCode,
}

impl fmt::Display for ExceptionResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function {:#04x} raised {}", self.function, self.code)
    }
}

/// Errors that can occur in the transport layer and the engines built on it
#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("invalid engine state: {0}")]
    InvalidState(&'static str),

    #[error("frame of {len} bytes exceeds the {max}-byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("serial port error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for a response frame")]
    Timeout,

    #[error("CRC mismatch: frame carries {received:#06x}, computed {computed:#06x}")]
    CrcMismatch { received: u16, computed: u16 },

    #[error("malformed response: {0}")]
    BadResponse(&'static str),

    #[error("slave exception: {0}")]
    Exception(ExceptionResponse),
}

impl ModbusError {
    /// Exception details when this error is a slave exception response.
    pub fn exception(&self) -> Option<ExceptionResponse> {
        match self {
            ModbusError::Exception(ex) => Some(*ex),
            _ => None,
        }
    }
}

/// Errors a slave data store reports back to the request dispatcher.
///
/// The dispatcher turns these into the Modbus exception sent on the wire:
/// [`NotSupported`](AccessError::NotSupported) becomes ILLEGAL FUNCTION,
/// [`OutOfBounds`](AccessError::OutOfBounds) becomes ILLEGAL DATA ADDRESS and
/// [`DeviceFailure`](AccessError::DeviceFailure) becomes SLAVE DEVICE FAILURE.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    #[error("access type not supported")]
    NotSupported,

    #[error("range of {count} starting at {start} is out of bounds")]
    OutOfBounds { start: u16, count: u16 },

    #[error("device failure")]
    DeviceFailure,
}

impl AccessError {
    pub(crate) fn exception_code(self) -> ExceptionCode {
        match self {
            AccessError::NotSupported => ExceptionCode::IllegalFunction,
            AccessError::OutOfBounds { .. } => ExceptionCode::IllegalDataAddress,
            AccessError::DeviceFailure => ExceptionCode::SlaveDeviceFailure,
        }
    }
}
