//! Modbus RTU slave engine
//!
//! Runs a background reader task that ingests frames from the bus, filters
//! them by unit id, dispatches requests to a [`SlaveHandler`] and writes the
//! response (or exception) back before the next read begins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_serial::SerialStream;

use crate::bits;
use crate::error::{AccessError, ExceptionCode, ModbusError};
use crate::frame;
use crate::port::{Direction, RtuPort, SerialSettings};

/// How long each reader pass waits for a frame; the shutdown signal is
/// still observed immediately while a pass is in flight.
const READ_WINDOW: Duration = Duration::from_secs(1);

/// Configuration for the slave engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveConfig {
    /// Unit id this device answers to (1..=247)
    pub unit_id: u8,

    /// Idle gap that terminates a frame, in microseconds (default: 2000)
    pub inter_frame_timeout_us: u64,

    /// Settling delay around direction switching for manual DE/RE control,
    /// in microseconds (default: 0)
    pub turnaround_us: u64,

    /// Pause between reader iterations, yielding the core to lower-priority
    /// work, in milliseconds (default: 1)
    pub rx_poll_delay_ms: u64,

    /// Largest request frame the device accepts, in bytes (default: 256)
    pub max_adu_size: usize,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            unit_id: 1,
            inter_frame_timeout_us: 2000,
            turnaround_us: 0,
            rx_poll_delay_ms: 1,
            max_adu_size: frame::MAX_ADU_LEN,
        }
    }
}

impl SlaveConfig {
    /// Create a configuration for the given unit id with default timing.
    pub fn new(unit_id: u8) -> Self {
        Self {
            unit_id,
            ..Default::default()
        }
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

    pub(crate) fn rx_poll_delay(&self) -> Duration {
        Duration::from_millis(if self.rx_poll_delay_ms == 0 {
            1
        } else {
            self.rx_poll_delay_ms
        })
    }

    pub(crate) fn max_adu(&self) -> usize {
        if self.max_adu_size == 0 {
            frame::MAX_ADU_LEN
        } else {
            self.max_adu_size
        }
    }
}

/// Data store a slave serves requests from.
///
/// Implement the methods for the access types the device supports; each has
/// a default body reporting [`AccessError::NotSupported`], which reaches the
/// master as an ILLEGAL FUNCTION exception. The implementing type owns all
/// device state and is called from the reader task, so the methods must not
/// block for long: they sit in the critical path of bus response time.
#[allow(unused_variables)]
pub trait SlaveHandler: Send + Sync {
    /// Serve a coil read (function 0x01).
    fn read_coils(&self, addr: u16, qty: u16) -> Result<Vec<bool>, AccessError> {
        Err(AccessError::NotSupported)
    }

    /// Apply a coil write (functions 0x05 and 0x0F).
    fn write_coils(&self, addr: u16, values: &[bool]) -> Result<(), AccessError> {
        Err(AccessError::NotSupported)
    }

    /// Serve a discrete-input read (function 0x02).
    fn read_discrete_inputs(&self, addr: u16, qty: u16) -> Result<Vec<bool>, AccessError> {
        Err(AccessError::NotSupported)
    }

    /// Serve a holding-register read (functions 0x03, 0x16 and 0x17).
    fn read_holding_registers(&self, addr: u16, qty: u16) -> Result<Vec<u16>, AccessError> {
        Err(AccessError::NotSupported)
    }

    /// Apply a holding-register write (functions 0x06, 0x10, 0x16 and 0x17).
    fn write_holding_registers(&self, addr: u16, values: &[u16]) -> Result<(), AccessError> {
        Err(AccessError::NotSupported)
    }

    /// Serve an input-register read (function 0x04).
    fn read_input_registers(&self, addr: u16, qty: u16) -> Result<Vec<u16>, AccessError> {
        Err(AccessError::NotSupported)
    }

    /// Serve a function code outside the standard set.
    ///
    /// `request` is the full request PDU including the function code; the
    /// returned bytes are sent verbatim as the response PDU. The default
    /// rejects everything, which reaches the master as ILLEGAL FUNCTION.
    fn custom_function(
        &self,
        unit_id: u8,
        function: u8,
        request: &[u8],
    ) -> Result<Vec<u8>, AccessError> {
        Err(AccessError::NotSupported)
    }
}

struct Reader<S> {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<RtuPort<S>>,
}

/// Modbus RTU slave
pub struct RtuSlave<S> {
    config: SlaveConfig,
    handler: Arc<dyn SlaveHandler>,
    running: Arc<AtomicBool>,
    port: Option<RtuPort<S>>,
    reader: Option<Reader<S>>,
}

impl RtuSlave<SerialStream> {
    /// Open the serial port and build a slave on top of it.
    pub fn open(
        settings: &SerialSettings,
        direction: Direction,
        config: SlaveConfig,
        handler: Arc<dyn SlaveHandler>,
    ) -> Result<Self, ModbusError> {
        let port = RtuPort::open(
            settings,
            direction,
            config.inter_frame_timeout(),
            config.turnaround(),
        )?;
        Self::with_port(port, config, handler)
    }
}

impl<S> RtuSlave<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Build a slave over an already-open byte stream.
    pub fn with_stream(
        stream: S,
        direction: Direction,
        config: SlaveConfig,
        handler: Arc<dyn SlaveHandler>,
    ) -> Result<Self, ModbusError> {
        let port = RtuPort::new(
            stream,
            direction,
            config.inter_frame_timeout(),
            config.turnaround(),
        );
        Self::with_port(port, config, handler)
    }

    fn with_port(
        mut port: RtuPort<S>,
        config: SlaveConfig,
        handler: Arc<dyn SlaveHandler>,
    ) -> Result<Self, ModbusError> {
        if config.unit_id == 0 || config.unit_id > 247 {
            return Err(ModbusError::InvalidRequest("slave unit id must be 1..=247"));
        }
        port.set_max_frame_len(config.max_adu());

        Ok(Self {
            config,
            handler,
            running: Arc::new(AtomicBool::new(false)),
            port: Some(port),
            reader: None,
        })
    }

    /// Check if the reader task is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get the slave configuration
    pub fn config(&self) -> &SlaveConfig {
        &self.config
    }

    /// Launch the background reader task.
    pub fn start(&mut self) -> Result<(), ModbusError> {
        if self.reader.is_some() {
            return Err(ModbusError::InvalidState("slave is already running"));
        }
        let port = self
            .port
            .take()
            .ok_or(ModbusError::InvalidState("slave port is not available"))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.running.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(reader_loop(
            port,
            Arc::clone(&self.handler),
            self.config.clone(),
            Arc::clone(&self.running),
            shutdown_rx,
        ));
        self.reader = Some(Reader {
            shutdown: shutdown_tx,
            handle,
        });

        log::info!("Modbus RTU slave started (unit id {})", self.config.unit_id);
        Ok(())
    }

    /// Stop the reader task and wait for it to terminate.
    ///
    /// When this returns the task is gone and the port is owned by the
    /// engine again, so [`start`](Self::start) may be called once more.
    pub async fn stop(&mut self) -> Result<(), ModbusError> {
        let Some(reader) = self.reader.take() else {
            return Err(ModbusError::InvalidState("slave is not running"));
        };

        let _ = reader.shutdown.send(true);
        match reader.handle.await {
            Ok(port) => self.port = Some(port),
            Err(e) => {
                log::error!("slave reader task failed: {}", e);
                self.running.store(false, Ordering::SeqCst);
                return Err(ModbusError::InvalidState("slave reader task failed"));
            }
        }

        self.running.store(false, Ordering::SeqCst);
        log::info!("Modbus RTU slave stopped");
        Ok(())
    }
}

impl<S> Drop for RtuSlave<S> {
    fn drop(&mut self) {
        // A slave dropped without `stop` takes its reader down with it.
        if let Some(reader) = self.reader.take() {
            reader.handle.abort();
            self.running.store(false, Ordering::SeqCst);
        }
    }
}

/// The reader task: frame in, response out, until shutdown.
async fn reader_loop<S>(
    mut port: RtuPort<S>,
    handler: Arc<dyn SlaveHandler>,
    config: SlaveConfig,
    running: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) -> RtuPort<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let poll_delay = config.rx_poll_delay();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = port.read_frame(READ_WINDOW) => match result {
                Ok(request) => {
                    if let Err(e) = serve_request(&mut port, handler.as_ref(), &config, &request).await {
                        log::error!("failed to send response: {}", e);
                    }
                }
                Err(ModbusError::Timeout) => {}
                Err(ModbusError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::warn!("serial stream closed, slave reader exiting");
                    break;
                }
                Err(e) => {
                    log::error!("serial read error: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
        }
        tokio::time::sleep(poll_delay).await;
    }

    running.store(false, Ordering::SeqCst);
    port
}

/// Validate one received frame and, when it is addressed to us, dispatch it
/// and transmit the response. Corrupt and foreign frames are dropped without
/// a reply, as the protocol requires.
async fn serve_request<S>(
    port: &mut RtuPort<S>,
    handler: &dyn SlaveHandler,
    config: &SlaveConfig,
    adu: &[u8],
) -> Result<(), ModbusError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if adu.len() < frame::MIN_ADU_LEN || frame::check_crc(adu).is_err() {
        log::debug!("dropping corrupt frame ({} bytes)", adu.len());
        return Ok(());
    }

    let unit_id = adu[0];
    let broadcast = unit_id == 0;
    if !broadcast && unit_id != config.unit_id {
        return Ok(());
    }

    let pdu = &adu[1..adu.len() - 2];
    let function = pdu[0];

    if broadcast {
        // Broadcast writes take effect locally, but no node ever answers;
        // broadcast reads are meaningless and dropped outright.
        if matches!(function, 0x05 | 0x06 | 0x0F | 0x10 | 0x16) {
            let _ = handle_pdu(handler, unit_id, pdu);
        }
        return Ok(());
    }

    let response = handle_pdu(handler, unit_id, pdu);
    let reply = frame::build_adu(config.unit_id, &response, config.max_adu())?;
    port.write_adu(&reply).await
}

/// Dispatch one request PDU to the handler, producing the response PDU
/// (normal or exception).
fn handle_pdu(handler: &dyn SlaveHandler, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let function = pdu[0];

    match function {
        // Read Coils / Read Discrete Inputs
        0x01 | 0x02 => {
            if pdu.len() != 5 {
                return frame::exception_pdu(function, ExceptionCode::IllegalDataValue);
            }
            let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
            let qty = u16::from_be_bytes([pdu[3], pdu[4]]);
            if !(1..=2000).contains(&qty) {
                return frame::exception_pdu(function, ExceptionCode::IllegalDataValue);
            }

            let result = if function == 0x01 {
                handler.read_coils(addr, qty)
            } else {
                handler.read_discrete_inputs(addr, qty)
            };
            match result {
                Ok(values) if values.len() == qty as usize => {
                    let packed = bits::pack_bits(&values);
                    let mut rsp = Vec::with_capacity(2 + packed.len());
                    rsp.push(function);
                    rsp.push(packed.len() as u8);
                    rsp.extend_from_slice(&packed);
                    rsp
                }
                Ok(_) => frame::exception_pdu(function, ExceptionCode::SlaveDeviceFailure),
                Err(e) => access_failure(function, e),
            }
        }

        // Read Holding Registers / Read Input Registers
        0x03 | 0x04 => {
            if pdu.len() != 5 {
                return frame::exception_pdu(function, ExceptionCode::IllegalDataValue);
            }
            let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
            let qty = u16::from_be_bytes([pdu[3], pdu[4]]);
            if !(1..=125).contains(&qty) {
                return frame::exception_pdu(function, ExceptionCode::IllegalDataValue);
            }

            let result = if function == 0x03 {
                handler.read_holding_registers(addr, qty)
            } else {
                handler.read_input_registers(addr, qty)
            };
            match result {
                Ok(regs) if regs.len() == qty as usize => register_payload(function, &regs),
                Ok(_) => frame::exception_pdu(function, ExceptionCode::SlaveDeviceFailure),
                Err(e) => access_failure(function, e),
            }
        }

        // Write Single Coil
        0x05 => {
            if pdu.len() != 5 {
                return frame::exception_pdu(function, ExceptionCode::IllegalDataValue);
            }
            let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
            let value = u16::from_be_bytes([pdu[3], pdu[4]]);
            if value != 0x0000 && value != 0xFF00 {
                return frame::exception_pdu(function, ExceptionCode::IllegalDataValue);
            }

            match handler.write_coils(addr, &[value == 0xFF00]) {
                Ok(()) => pdu.to_vec(),
                Err(e) => access_failure(function, e),
            }
        }

        // Write Single Register
        0x06 => {
            if pdu.len() != 5 {
                return frame::exception_pdu(function, ExceptionCode::IllegalDataValue);
            }
            let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
            let value = u16::from_be_bytes([pdu[3], pdu[4]]);

            match handler.write_holding_registers(addr, &[value]) {
                Ok(()) => pdu.to_vec(),
                Err(e) => access_failure(function, e),
            }
        }

        // Write Multiple Coils
        0x0F => {
            if pdu.len() < 6 {
                return frame::exception_pdu(function, ExceptionCode::IllegalDataValue);
            }
            let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
            let qty = u16::from_be_bytes([pdu[3], pdu[4]]);
            let byte_count = pdu[5] as usize;
            if !(1..=1968).contains(&qty)
                || byte_count != (qty as usize).div_ceil(8)
                || pdu.len() != 6 + byte_count
            {
                return frame::exception_pdu(function, ExceptionCode::IllegalDataValue);
            }

            let values = bits::unpack_bits(&pdu[6..], qty as usize);
            match handler.write_coils(addr, &values) {
                Ok(()) => pdu[..5].to_vec(),
                Err(e) => access_failure(function, e),
            }
        }

        // Write Multiple Registers
        0x10 => {
            if pdu.len() < 6 {
                return frame::exception_pdu(function, ExceptionCode::IllegalDataValue);
            }
            let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
            let qty = u16::from_be_bytes([pdu[3], pdu[4]]);
            let byte_count = pdu[5] as usize;
            if !(1..=123).contains(&qty)
                || byte_count != qty as usize * 2
                || pdu.len() != 6 + byte_count
            {
                return frame::exception_pdu(function, ExceptionCode::IllegalDataValue);
            }

            let values: Vec<u16> = pdu[6..]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            match handler.write_holding_registers(addr, &values) {
                Ok(()) => pdu[..5].to_vec(),
                Err(e) => access_failure(function, e),
            }
        }

        // Mask Write Register
        0x16 => {
            if pdu.len() != 7 {
                return frame::exception_pdu(function, ExceptionCode::IllegalDataValue);
            }
            let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
            let and_mask = u16::from_be_bytes([pdu[3], pdu[4]]);
            let or_mask = u16::from_be_bytes([pdu[5], pdu[6]]);

            let current = match handler.read_holding_registers(addr, 1) {
                Ok(regs) if regs.len() == 1 => regs[0],
                Ok(_) => return frame::exception_pdu(function, ExceptionCode::SlaveDeviceFailure),
                Err(e) => return access_failure(function, e),
            };
            let masked = (current & and_mask) | (or_mask & !and_mask);
            match handler.write_holding_registers(addr, &[masked]) {
                Ok(()) => pdu.to_vec(),
                Err(e) => access_failure(function, e),
            }
        }

        // Read/Write Multiple Registers; the write happens first
        0x17 => {
            if pdu.len() < 10 {
                return frame::exception_pdu(function, ExceptionCode::IllegalDataValue);
            }
            let read_addr = u16::from_be_bytes([pdu[1], pdu[2]]);
            let read_qty = u16::from_be_bytes([pdu[3], pdu[4]]);
            let write_addr = u16::from_be_bytes([pdu[5], pdu[6]]);
            let write_qty = u16::from_be_bytes([pdu[7], pdu[8]]);
            let byte_count = pdu[9] as usize;
            if !(1..=125).contains(&read_qty)
                || !(1..=121).contains(&write_qty)
                || byte_count != write_qty as usize * 2
                || pdu.len() != 10 + byte_count
            {
                return frame::exception_pdu(function, ExceptionCode::IllegalDataValue);
            }

            let values: Vec<u16> = pdu[10..]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            if let Err(e) = handler.write_holding_registers(write_addr, &values) {
                return access_failure(function, e);
            }
            match handler.read_holding_registers(read_addr, read_qty) {
                Ok(regs) if regs.len() == read_qty as usize => register_payload(function, &regs),
                Ok(_) => frame::exception_pdu(function, ExceptionCode::SlaveDeviceFailure),
                Err(e) => access_failure(function, e),
            }
        }

        // Anything else goes to the custom hook
        _ => match handler.custom_function(unit_id, function, pdu) {
            Ok(rsp) if !rsp.is_empty() => rsp,
            Ok(_) => frame::exception_pdu(function, ExceptionCode::IllegalFunction),
            Err(e) => access_failure(function, e),
        },
    }
}

fn access_failure(function: u8, err: AccessError) -> Vec<u8> {
    frame::exception_pdu(function, err.exception_code())
}

fn register_payload(function: u8, regs: &[u16]) -> Vec<u8> {
    let mut rsp = Vec::with_capacity(2 + regs.len() * 2);
    rsp.push(function);
    rsp.push((regs.len() * 2) as u8);
    for reg in regs {
        rsp.extend_from_slice(&reg.to_be_bytes());
    }
    rsp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::{BankSettings, RegisterBank};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Handler with every method left at its default.
    struct NullHandler;
    impl SlaveHandler for NullHandler {}

    /// Handler exposing a single vendor-specific function.
    struct EchoIdHandler;
    impl SlaveHandler for EchoIdHandler {
        fn custom_function(
            &self,
            unit_id: u8,
            function: u8,
            _request: &[u8],
        ) -> Result<Vec<u8>, AccessError> {
            if function == 0x41 {
                Ok(vec![function, unit_id])
            } else {
                Err(AccessError::NotSupported)
            }
        }
    }

    fn small_bank() -> Arc<RegisterBank> {
        let settings = BankSettings {
            coil_count: 16,
            discrete_input_count: 16,
            holding_register_count: 16,
            input_register_count: 16,
        };
        Arc::new(RegisterBank::new(&settings))
    }

    fn dispatch(handler: &dyn SlaveHandler, pdu: &[u8]) -> Vec<u8> {
        handle_pdu(handler, 1, pdu)
    }

    #[test]
    fn test_read_holding_registers_dispatch() {
        let bank = small_bank();
        bank.write_holding_register(0, 123).unwrap();
        bank.write_holding_register(1, 456).unwrap();

        let rsp = dispatch(bank.as_ref(), &[0x03, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(rsp, vec![0x03, 0x04, 0x00, 0x7B, 0x01, 0xC8]);
    }

    #[test]
    fn test_read_out_of_range_is_illegal_address() {
        let bank = small_bank();
        let rsp = dispatch(bank.as_ref(), &[0x03, 0x00, 0x64, 0x00, 0x01]);
        assert_eq!(rsp, vec![0x83, 0x02]);
    }

    #[test]
    fn test_bad_quantity_is_illegal_value() {
        let bank = small_bank();
        // Quantity zero, quantity over the limit, truncated request.
        assert_eq!(
            dispatch(bank.as_ref(), &[0x03, 0x00, 0x00, 0x00, 0x00]),
            vec![0x83, 0x03]
        );
        assert_eq!(
            dispatch(bank.as_ref(), &[0x03, 0x00, 0x00, 0x00, 0x7E]),
            vec![0x83, 0x03]
        );
        assert_eq!(dispatch(bank.as_ref(), &[0x03, 0x00, 0x00]), vec![0x83, 0x03]);
    }

    #[test]
    fn test_unimplemented_access_is_illegal_function() {
        let rsp = dispatch(&NullHandler, &[0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(rsp, vec![0x83, 0x01]);
        let rsp = dispatch(&NullHandler, &[0x05, 0x00, 0x00, 0xFF, 0x00]);
        assert_eq!(rsp, vec![0x85, 0x01]);
    }

    #[test]
    fn test_write_single_coil_dispatch() {
        let bank = small_bank();

        let request = [0x05, 0x00, 0x03, 0xFF, 0x00];
        assert_eq!(dispatch(bank.as_ref(), &request), request.to_vec());
        assert_eq!(bank.read_coils(3, 1).unwrap(), vec![true]);

        // Anything but 0x0000/0xFF00 in the value field is rejected.
        assert_eq!(
            dispatch(bank.as_ref(), &[0x05, 0x00, 0x03, 0x00, 0x01]),
            vec![0x85, 0x03]
        );
    }

    #[test]
    fn test_write_multiple_coils_dispatch() {
        let bank = small_bank();

        // Ten coils, all on: byte count 2, padding bits clear.
        let request = [0x0F, 0x00, 0x00, 0x00, 0x0A, 0x02, 0xFF, 0x03];
        let rsp = dispatch(bank.as_ref(), &request);
        assert_eq!(rsp, vec![0x0F, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(bank.read_coils(0, 10).unwrap(), vec![true; 10]);

        // Byte count disagreeing with the quantity is rejected.
        let rsp = dispatch(bank.as_ref(), &[0x0F, 0x00, 0x00, 0x00, 0x0A, 0x01, 0xFF]);
        assert_eq!(rsp, vec![0x8F, 0x03]);
    }

    #[test]
    fn test_write_multiple_registers_dispatch() {
        let bank = small_bank();

        let request = [0x10, 0x00, 0x04, 0x00, 0x02, 0x04, 0x00, 0x07, 0x00, 0x08];
        let rsp = dispatch(bank.as_ref(), &request);
        assert_eq!(rsp, vec![0x10, 0x00, 0x04, 0x00, 0x02]);
        assert_eq!(bank.read_holding_registers(4, 2).unwrap(), vec![7, 8]);
    }

    #[test]
    fn test_mask_write_register_dispatch() {
        let bank = small_bank();
        bank.write_holding_register(0, 0x0012).unwrap();

        // The worked example from the Modbus specification:
        // (0x12 AND 0xF2) OR (0x25 AND NOT 0xF2) = 0x17
        let request = [0x16, 0x00, 0x00, 0x00, 0xF2, 0x00, 0x25];
        assert_eq!(dispatch(bank.as_ref(), &request), request.to_vec());
        assert_eq!(bank.read_holding_registers(0, 1).unwrap(), vec![0x0017]);
    }

    #[test]
    fn test_read_write_multiple_registers_dispatch() {
        let bank = small_bank();
        bank.write_holding_register(0, 0xAAAA).unwrap();

        // Write registers 4..6 first, then read 0..2 back in one exchange.
        let request = [
            0x17, 0x00, 0x00, 0x00, 0x02, 0x00, 0x04, 0x00, 0x02, 0x04, 0x00, 0x07, 0x00, 0x08,
        ];
        let rsp = dispatch(bank.as_ref(), &request);
        assert_eq!(rsp, vec![0x17, 0x04, 0xAA, 0xAA, 0x00, 0x00]);
        assert_eq!(bank.read_holding_registers(4, 2).unwrap(), vec![7, 8]);
    }

    #[test]
    fn test_custom_function_dispatch() {
        let rsp = dispatch(&EchoIdHandler, &[0x41, 0x01, 0x02]);
        assert_eq!(rsp, vec![0x41, 0x01]);

        // Unknown function with no custom support.
        let rsp = dispatch(&NullHandler, &[0x42]);
        assert_eq!(rsp, vec![0xC2, 0x01]);
    }

    // ---- engine-level tests over an in-memory link ----

    const INTER_FRAME: Duration = Duration::from_millis(3);

    fn spawn_slave(
        stream: DuplexStream,
        handler: Arc<dyn SlaveHandler>,
    ) -> RtuSlave<DuplexStream> {
        let config = SlaveConfig {
            unit_id: 1,
            inter_frame_timeout_us: INTER_FRAME.as_micros() as u64,
            ..Default::default()
        };
        let mut slave = RtuSlave::with_stream(stream, Direction::Hardware, config, handler).unwrap();
        slave.start().unwrap();
        slave
    }

    async fn exchange(peer: &mut DuplexStream, request: &[u8]) -> Vec<u8> {
        peer.write_all(request).await.unwrap();
        let mut buf = [0u8; 256];
        let n = peer.read(&mut buf).await.unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn test_slave_answers_read_holding_registers() {
        let (slave_side, mut peer) = tokio::io::duplex(256);
        let bank = small_bank();
        bank.write_holding_register(0, 123).unwrap();
        bank.write_holding_register(1, 456).unwrap();
        let mut slave = spawn_slave(slave_side, bank);

        let response = exchange(
            &mut peer,
            &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B],
        )
        .await;
        assert_eq!(
            response,
            vec![0x01, 0x03, 0x04, 0x00, 0x7B, 0x01, 0xC8, 0xFA, 0x3D]
        );

        slave.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_slave_ignores_foreign_and_corrupt_frames() {
        let (slave_side, mut peer) = tokio::io::duplex(256);
        let mut slave = spawn_slave(slave_side, small_bank());

        // Addressed to unit 9, then a frame with a broken CRC for unit 1.
        peer.write_all(&frame::build_adu(9, &[0x03, 0x00, 0x00, 0x00, 0x01], 256).unwrap())
            .await
            .unwrap();
        let mut corrupt = frame::build_adu(1, &[0x03, 0x00, 0x00, 0x00, 0x01], 256).unwrap();
        let end = corrupt.len() - 1;
        corrupt[end] ^= 0xFF;
        tokio::time::sleep(Duration::from_millis(10)).await;
        peer.write_all(&corrupt).await.unwrap();

        // No reply to either; the read must sit silent until timeout.
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_millis(100), peer.read(&mut buf)).await;
        assert!(read.is_err());

        slave.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_slave_applies_broadcast_write_silently() {
        let (slave_side, mut peer) = tokio::io::duplex(256);
        let bank = small_bank();
        let mut slave = spawn_slave(slave_side, Arc::clone(&bank) as Arc<dyn SlaveHandler>);

        let request = frame::build_adu(0, &[0x06, 0x00, 0x05, 0x00, 0x2A], 256).unwrap();
        peer.write_all(&request).await.unwrap();

        // The write lands without any frame coming back.
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_millis(100), peer.read(&mut buf)).await;
        assert!(read.is_err());
        assert_eq!(bank.read_holding_registers(5, 1).unwrap(), vec![42]);

        slave.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_slave_stop_joins_and_allows_restart() {
        let (slave_side, mut peer) = tokio::io::duplex(256);
        let bank = small_bank();
        let mut slave = spawn_slave(slave_side, bank);
        assert!(slave.is_running());

        slave.stop().await.unwrap();
        assert!(!slave.is_running());
        assert!(matches!(
            slave.stop().await,
            Err(ModbusError::InvalidState(_))
        ));

        slave.start().unwrap();
        assert!(slave.is_running());

        let response = exchange(
            &mut peer,
            &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A],
        )
        .await;
        assert_eq!(response[..2], [0x01, 0x03]);

        slave.stop().await.unwrap();
    }

    #[test]
    fn test_slave_rejects_invalid_unit_id() {
        for unit_id in [0u8, 248] {
            let (stream, _peer) = tokio::io::duplex(64);
            let result = RtuSlave::with_stream(
                stream,
                Direction::Hardware,
                SlaveConfig::new(unit_id),
                Arc::new(NullHandler),
            );
            assert!(matches!(result, Err(ModbusError::InvalidRequest(_))));
        }
    }
}
