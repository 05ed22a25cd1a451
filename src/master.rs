//! Modbus RTU master engine
//!
//! Issues request/response transactions over a half-duplex link. Any number
//! of tasks may share one master; a mutex keeps exactly one exchange on the
//! wire at a time.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_serial::SerialStream;

use crate::bits;
use crate::error::ModbusError;
use crate::frame;
use crate::port::{Direction, RtuPort, SerialSettings};

/// Configuration for the master engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// How long to wait for a complete response frame, in milliseconds
    /// (default: 200)
    pub response_timeout_ms: u64,

    /// Idle gap that terminates a frame, in microseconds (default: 2000)
    pub inter_frame_timeout_us: u64,

    /// Settling delay around direction switching for manual DE/RE control,
    /// in microseconds (default: 0)
    pub turnaround_us: u64,

    /// How long a caller may wait for its turn on the bus before the
    /// transaction fails with a timeout, in milliseconds (default: 1000)
    pub lock_timeout_ms: u64,

    /// Reject responses whose unit id differs from the request (default: true)
    pub strict_unit_id: bool,

    /// Reject responses whose function code differs from the request
    /// (default: true)
    pub strict_function: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 200,
            inter_frame_timeout_us: 2000,
            turnaround_us: 0,
            lock_timeout_ms: 1000,
            strict_unit_id: true,
            strict_function: true,
        }
    }
}

impl MasterConfig {
    pub(crate) fn response_timeout(&self) -> Duration {
        Duration::from_millis(if self.response_timeout_ms == 0 {
            200
        } else {
            self.response_timeout_ms
        })
    }

    pub(crate) fn inter_frame_timeout(&self) -> Duration {
        Duration::from_micros(if self.inter_frame_timeout_us == 0 {
            2000
        } else {
            self.inter_frame_timeout_us
        })
    }

    pub(crate) fn turnaround(&self) -> Duration {
        Duration::from_micros(self.turnaround_us)
    }

    pub(crate) fn lock_timeout(&self) -> Duration {
        Duration::from_millis(if self.lock_timeout_ms == 0 {
            1000
        } else {
            self.lock_timeout_ms
        })
    }
}

/// Modbus RTU master
pub struct RtuMaster<S> {
    port: Mutex<RtuPort<S>>,
    config: MasterConfig,
}

impl RtuMaster<SerialStream> {
    /// Open the serial port and build a master on top of it.
    pub fn open(
        settings: &SerialSettings,
        direction: Direction,
        config: MasterConfig,
    ) -> Result<Self, ModbusError> {
        let port = RtuPort::open(
            settings,
            direction,
            config.inter_frame_timeout(),
            config.turnaround(),
        )?;
        Ok(Self::with_port(port, config))
    }
}

impl<S> RtuMaster<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Build a master over an already-open byte stream.
    pub fn with_stream(stream: S, direction: Direction, config: MasterConfig) -> Self {
        let port = RtuPort::new(
            stream,
            direction,
            config.inter_frame_timeout(),
            config.turnaround(),
        );
        Self::with_port(port, config)
    }

    fn with_port(port: RtuPort<S>, config: MasterConfig) -> Self {
        Self {
            port: Mutex::new(port),
            config,
        }
    }

    /// Get the master configuration
    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Execute one request/response transaction with a raw PDU.
    ///
    /// This is the escape hatch for function codes the typed helpers do not
    /// cover. Broadcast requests (unit id 0) are transmitted without waiting
    /// for an answer and yield an empty response. An exception response
    /// surfaces as [`ModbusError::Exception`].
    pub async fn transaction(
        &self,
        unit_id: u8,
        request_pdu: &[u8],
    ) -> Result<Vec<u8>, ModbusError> {
        if request_pdu.is_empty() {
            return Err(ModbusError::InvalidRequest("request PDU must not be empty"));
        }
        let adu = frame::build_adu(unit_id, request_pdu, frame::MAX_ADU_LEN)?;

        let mut port = timeout(self.config.lock_timeout(), self.port.lock())
            .await
            .map_err(|_| ModbusError::Timeout)?;

        port.write_adu(&adu).await?;

        if unit_id == 0 {
            return Ok(Vec::new());
        }

        let response = port.read_frame(self.config.response_timeout()).await?;
        drop(port);

        let (_, pdu) = frame::parse_adu(
            &response,
            unit_id,
            request_pdu[0],
            self.config.strict_unit_id,
            self.config.strict_function,
        )?;
        Ok(pdu)
    }

    /// Read coils (function 0x01).
    pub async fn read_coils(
        &self,
        unit_id: u8,
        addr: u16,
        qty: u16,
    ) -> Result<Vec<bool>, ModbusError> {
        self.read_bits(unit_id, 0x01, addr, qty).await
    }

    /// Read discrete inputs (function 0x02).
    pub async fn read_discrete_inputs(
        &self,
        unit_id: u8,
        addr: u16,
        qty: u16,
    ) -> Result<Vec<bool>, ModbusError> {
        self.read_bits(unit_id, 0x02, addr, qty).await
    }

    /// Read holding registers (function 0x03).
    pub async fn read_holding_registers(
        &self,
        unit_id: u8,
        addr: u16,
        qty: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        self.read_registers(unit_id, 0x03, addr, qty).await
    }

    /// Read input registers (function 0x04).
    pub async fn read_input_registers(
        &self,
        unit_id: u8,
        addr: u16,
        qty: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        self.read_registers(unit_id, 0x04, addr, qty).await
    }

    /// Write a single coil (function 0x05).
    pub async fn write_single_coil(
        &self,
        unit_id: u8,
        addr: u16,
        on: bool,
    ) -> Result<(), ModbusError> {
        let value: u16 = if on { 0xFF00 } else { 0x0000 };
        self.write_echo(unit_id, &word_request(0x05, addr, value))
            .await
    }

    /// Write a single holding register (function 0x06).
    pub async fn write_single_register(
        &self,
        unit_id: u8,
        addr: u16,
        value: u16,
    ) -> Result<(), ModbusError> {
        self.write_echo(unit_id, &word_request(0x06, addr, value))
            .await
    }

    /// Write multiple coils (function 0x0F).
    pub async fn write_multiple_coils(
        &self,
        unit_id: u8,
        addr: u16,
        values: &[bool],
    ) -> Result<(), ModbusError> {
        if values.is_empty() || values.len() > 1968 {
            return Err(ModbusError::InvalidRequest("coil quantity must be 1..=1968"));
        }
        let qty = values.len() as u16;
        let packed = bits::pack_bits(values);

        let mut req = Vec::with_capacity(6 + packed.len());
        req.push(0x0F);
        req.extend_from_slice(&addr.to_be_bytes());
        req.extend_from_slice(&qty.to_be_bytes());
        req.push(packed.len() as u8);
        req.extend_from_slice(&packed);

        let rsp = self.transaction(unit_id, &req).await?;
        if unit_id == 0 {
            return Ok(());
        }
        check_write_ack(&rsp, 0x0F, addr, qty)
    }

    /// Write multiple holding registers (function 0x10).
    pub async fn write_multiple_registers(
        &self,
        unit_id: u8,
        addr: u16,
        values: &[u16],
    ) -> Result<(), ModbusError> {
        if values.is_empty() || values.len() > 123 {
            return Err(ModbusError::InvalidRequest(
                "register quantity must be 1..=123",
            ));
        }
        let qty = values.len() as u16;

        let mut req = Vec::with_capacity(6 + values.len() * 2);
        req.push(0x10);
        req.extend_from_slice(&addr.to_be_bytes());
        req.extend_from_slice(&qty.to_be_bytes());
        req.push((values.len() * 2) as u8);
        for value in values {
            req.extend_from_slice(&value.to_be_bytes());
        }

        let rsp = self.transaction(unit_id, &req).await?;
        if unit_id == 0 {
            return Ok(());
        }
        check_write_ack(&rsp, 0x10, addr, qty)
    }

    /// Modify a holding register under a bit mask (function 0x16).
    ///
    /// The slave computes `(current AND and_mask) OR (or_mask AND NOT and_mask)`.
    pub async fn mask_write_register(
        &self,
        unit_id: u8,
        addr: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> Result<(), ModbusError> {
        let mut req = Vec::with_capacity(7);
        req.push(0x16);
        req.extend_from_slice(&addr.to_be_bytes());
        req.extend_from_slice(&and_mask.to_be_bytes());
        req.extend_from_slice(&or_mask.to_be_bytes());
        self.write_echo(unit_id, &req).await
    }

    /// Write then read holding registers in one transaction (function 0x17).
    ///
    /// The slave performs the write before the read.
    pub async fn read_write_multiple_registers(
        &self,
        unit_id: u8,
        read_addr: u16,
        read_qty: u16,
        write_addr: u16,
        write_values: &[u16],
    ) -> Result<Vec<u16>, ModbusError> {
        if unit_id == 0 {
            return Err(ModbusError::InvalidRequest(
                "broadcast cannot carry a read request",
            ));
        }
        if !(1..=125).contains(&read_qty) {
            return Err(ModbusError::InvalidRequest(
                "read quantity must be 1..=125",
            ));
        }
        if write_values.is_empty() || write_values.len() > 121 {
            return Err(ModbusError::InvalidRequest(
                "write quantity must be 1..=121",
            ));
        }
        let write_qty = write_values.len() as u16;

        let mut req = Vec::with_capacity(10 + write_values.len() * 2);
        req.push(0x17);
        req.extend_from_slice(&read_addr.to_be_bytes());
        req.extend_from_slice(&read_qty.to_be_bytes());
        req.extend_from_slice(&write_addr.to_be_bytes());
        req.extend_from_slice(&write_qty.to_be_bytes());
        req.push((write_values.len() * 2) as u8);
        for value in write_values {
            req.extend_from_slice(&value.to_be_bytes());
        }

        let rsp = self.transaction(unit_id, &req).await?;
        parse_register_payload(&rsp, 0x17, read_qty)
    }

    async fn read_bits(
        &self,
        unit_id: u8,
        function: u8,
        addr: u16,
        qty: u16,
    ) -> Result<Vec<bool>, ModbusError> {
        if unit_id == 0 {
            return Err(ModbusError::InvalidRequest(
                "broadcast cannot carry a read request",
            ));
        }
        if !(1..=2000).contains(&qty) {
            return Err(ModbusError::InvalidRequest("bit quantity must be 1..=2000"));
        }

        let rsp = self
            .transaction(unit_id, &word_request(function, addr, qty))
            .await?;

        let byte_count = (qty as usize).div_ceil(8);
        if rsp.len() != 2 + byte_count || rsp[0] != function || rsp[1] as usize != byte_count {
            return Err(ModbusError::BadResponse(
                "bit payload shape does not match the request",
            ));
        }
        Ok(bits::unpack_bits(&rsp[2..], qty as usize))
    }

    async fn read_registers(
        &self,
        unit_id: u8,
        function: u8,
        addr: u16,
        qty: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        if unit_id == 0 {
            return Err(ModbusError::InvalidRequest(
                "broadcast cannot carry a read request",
            ));
        }
        if !(1..=125).contains(&qty) {
            return Err(ModbusError::InvalidRequest(
                "register quantity must be 1..=125",
            ));
        }

        let rsp = self
            .transaction(unit_id, &word_request(function, addr, qty))
            .await?;
        parse_register_payload(&rsp, function, qty)
    }

    /// Issue the request and require the response to echo it byte for byte.
    async fn write_echo(&self, unit_id: u8, request: &[u8]) -> Result<(), ModbusError> {
        let rsp = self.transaction(unit_id, request).await?;
        if unit_id == 0 {
            return Ok(());
        }
        if rsp != request {
            return Err(ModbusError::BadResponse(
                "response is not an echo of the request",
            ));
        }
        Ok(())
    }
}

/// Five-byte request body: function code, address, one 16-bit word.
fn word_request(function: u8, addr: u16, word: u16) -> [u8; 5] {
    let a = addr.to_be_bytes();
    let w = word.to_be_bytes();
    [function, a[0], a[1], w[0], w[1]]
}

fn check_write_ack(rsp: &[u8], function: u8, addr: u16, qty: u16) -> Result<(), ModbusError> {
    if rsp.len() != 5
        || rsp[0] != function
        || rsp[1..3] != addr.to_be_bytes()
        || rsp[3..5] != qty.to_be_bytes()
    {
        return Err(ModbusError::BadResponse(
            "write acknowledgement does not match the request",
        ));
    }
    Ok(())
}

fn parse_register_payload(rsp: &[u8], function: u8, qty: u16) -> Result<Vec<u16>, ModbusError> {
    let byte_count = qty as usize * 2;
    if rsp.len() != 2 + byte_count || rsp[0] != function || rsp[1] as usize != byte_count {
        return Err(ModbusError::BadResponse(
            "register payload shape does not match the request",
        ));
    }
    Ok(rsp[2..]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}
