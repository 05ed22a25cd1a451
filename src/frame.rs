//! ADU framing: CRC-16 generation and frame assembly/validation
//!
//! A Modbus RTU frame (ADU) is `unit id | PDU | CRC lo | CRC hi`. The CRC
//! covers the unit id and the PDU and travels low byte first.

use crate::error::{ExceptionCode, ExceptionResponse, ModbusError};

/// Largest ADU the protocol allows: unit id + 253-byte PDU + CRC.
pub const MAX_ADU_LEN: usize = 256;

/// Smallest frame that can carry a response: unit id + two-byte PDU + CRC.
pub const MIN_ADU_LEN: usize = 5;

/// Calculate Modbus CRC-16
///
/// Uses the standard Modbus polynomial 0xA001 (reflected form of 0x8005)
/// with initial value 0xFFFF and no final XOR.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

/// Assemble an ADU from a unit id and PDU, appending the CRC low byte first.
pub fn build_adu(unit_id: u8, pdu: &[u8], max_len: usize) -> Result<Vec<u8>, ModbusError> {
    if pdu.is_empty() {
        return Err(ModbusError::InvalidRequest("PDU must not be empty"));
    }
    let len = pdu.len() + 3;
    if len > max_len {
        return Err(ModbusError::FrameTooLarge { len, max: max_len });
    }

    let mut adu = Vec::with_capacity(len);
    adu.push(unit_id);
    adu.extend_from_slice(pdu);

    let crc = crc16(&adu);
    adu.extend_from_slice(&crc.to_le_bytes());

    Ok(adu)
}

/// Verify the trailing CRC of a frame without interpreting its contents.
pub fn check_crc(adu: &[u8]) -> Result<(), ModbusError> {
    if adu.len() < 4 {
        return Err(ModbusError::BadResponse("frame too short to carry a CRC"));
    }
    let split = adu.len() - 2;
    let received = u16::from_le_bytes([adu[split], adu[split + 1]]);
    let computed = crc16(&adu[..split]);
    if received != computed {
        return Err(ModbusError::CrcMismatch { received, computed });
    }
    Ok(())
}

/// Parse and validate a response ADU against the request that produced it.
///
/// Checks the minimum length and the CRC, optionally enforces the expected
/// unit id and function code, and converts an exception PDU (bit 7 of the
/// function code set) into [`ModbusError::Exception`]. On success returns
/// the responding unit id and the PDU.
pub fn parse_adu(
    adu: &[u8],
    expected_unit_id: u8,
    request_function: u8,
    strict_unit_id: bool,
    strict_function: bool,
) -> Result<(u8, Vec<u8>), ModbusError> {
    if adu.len() < MIN_ADU_LEN {
        return Err(ModbusError::BadResponse("frame shorter than a minimal ADU"));
    }
    check_crc(adu)?;

    let unit_id = adu[0];
    let function = adu[1];

    if strict_unit_id && unit_id != expected_unit_id {
        return Err(ModbusError::BadResponse("unit id does not match the request"));
    }
    if strict_function && (function & 0x7F) != request_function {
        return Err(ModbusError::BadResponse(
            "function code does not match the request",
        ));
    }

    if function & 0x80 != 0 {
        return Err(ModbusError::Exception(ExceptionResponse {
            function: function & 0x7F,
            code: ExceptionCode::from(adu[2]),
        }));
    }

    Ok((unit_id, adu[1..adu.len() - 2].to_vec()))
}

/// Build the two-byte exception PDU for a failed request.
pub fn exception_pdu(function: u8, code: ExceptionCode) -> Vec<u8> {
    vec![function | 0x80, u8::from(code)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_known_vectors() {
        // Input-register exception frame body from the Modbus spec examples.
        assert_eq!(crc16(&[0x01, 0x04, 0x02, 0xFF, 0xFF]), 0x80B8);
        // Query 01 03 00 00 00 0A -> CRC bytes C5 CD on the wire.
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]), 0xCDC5);
    }

    #[test]
    fn test_build_adu_places_crc_low_byte_first() {
        let adu = build_adu(0x01, &[0x04, 0x02, 0xFF, 0xFF], MAX_ADU_LEN).unwrap();
        assert_eq!(adu, vec![0x01, 0x04, 0x02, 0xFF, 0xFF, 0xB8, 0x80]);
    }

    #[test]
    fn test_build_adu_rejects_empty_pdu() {
        assert!(matches!(
            build_adu(0x01, &[], MAX_ADU_LEN),
            Err(ModbusError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_build_adu_rejects_oversize_pdu() {
        let pdu = vec![0x03; 254];
        assert!(matches!(
            build_adu(0x01, &pdu, MAX_ADU_LEN),
            Err(ModbusError::FrameTooLarge { len: 257, max: 256 })
        ));
    }

    #[test]
    fn test_parse_adu_round_trip() {
        for unit_id in [1u8, 17, 247] {
            let pdu = vec![0x03, 0x02, 0x00, 0x2A];
            let adu = build_adu(unit_id, &pdu, MAX_ADU_LEN).unwrap();
            let (got_unit, got_pdu) = parse_adu(&adu, unit_id, 0x03, true, true).unwrap();
            assert_eq!(got_unit, unit_id);
            assert_eq!(got_pdu, pdu);
        }
    }

    #[test]
    fn test_parse_adu_detects_exception() {
        let adu = build_adu(0x01, &[0x83, 0x02], MAX_ADU_LEN).unwrap();
        let err = parse_adu(&adu, 0x01, 0x03, true, true).unwrap_err();
        let ex = err.exception().expect("exception response");
        assert_eq!(ex.function, 0x03);
        assert_eq!(ex.code, ExceptionCode::IllegalDataAddress);
    }

    #[test]
    fn test_parse_adu_rejects_short_frame() {
        assert!(matches!(
            parse_adu(&[0x01, 0x03, 0x00], 0x01, 0x03, true, true),
            Err(ModbusError::BadResponse(_))
        ));
    }

    #[test]
    fn test_parse_adu_rejects_bad_crc() {
        let mut adu = build_adu(0x01, &[0x03, 0x02, 0x00, 0x2A], MAX_ADU_LEN).unwrap();
        let end = adu.len() - 2;
        adu[end] ^= 0xFF;
        assert!(matches!(
            parse_adu(&adu, 0x01, 0x03, true, true),
            Err(ModbusError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_parse_adu_strict_unit_id() {
        let adu = build_adu(0x02, &[0x03, 0x02, 0x00, 0x2A], MAX_ADU_LEN).unwrap();
        assert!(matches!(
            parse_adu(&adu, 0x01, 0x03, true, true),
            Err(ModbusError::BadResponse(_))
        ));
        // Relaxed mode accepts the frame and reports the actual unit id.
        let (unit_id, _) = parse_adu(&adu, 0x01, 0x03, false, true).unwrap();
        assert_eq!(unit_id, 0x02);
    }

    #[test]
    fn test_parse_adu_strict_function() {
        let adu = build_adu(0x01, &[0x04, 0x02, 0x00, 0x2A], MAX_ADU_LEN).unwrap();
        assert!(matches!(
            parse_adu(&adu, 0x01, 0x03, true, true),
            Err(ModbusError::BadResponse(_))
        ));
        assert!(parse_adu(&adu, 0x01, 0x03, true, false).is_ok());
    }

    #[test]
    fn test_exception_pdu_sets_high_bit() {
        assert_eq!(
            exception_pdu(0x03, ExceptionCode::IllegalDataAddress),
            vec![0x83, 0x02]
        );
    }
}
