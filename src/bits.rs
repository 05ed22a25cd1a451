//! Bit packing for coil and discrete-input payloads
//!
//! Modbus transports bit values packed eight to a byte, least significant
//! bit first; unused high bits of the final byte are zero.

/// Pack boolean values into bytes (LSB first within each byte)
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    let byte_count = values.len().div_ceil(8);
    let mut bytes = vec![0u8; byte_count];

    for (i, &value) in values.iter().enumerate() {
        if value {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }

    bytes
}

/// Unpack bytes into boolean values (LSB first within each byte)
///
/// Bits past the end of `bytes` read as `false`, so `count` may request up
/// to the caller's full expected quantity regardless of padding.
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    let mut values = Vec::with_capacity(count);

    for i in 0..count {
        let byte_idx = i / 8;
        let bit_idx = i % 8;
        if byte_idx < bytes.len() {
            values.push((bytes[byte_idx] >> bit_idx) & 1 == 1);
        } else {
            values.push(false);
        }
    }

    values
}
