//! In-memory register bank with thread-safe access
//!
//! A ready-made data store covering the four Modbus data areas. The device
//! side of an application updates it through the direct accessors while the
//! slave engine serves bus requests from it through [`SlaveHandler`].

use bitvec::prelude::*;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::AccessError;
use crate::slave::SlaveHandler;

/// Sizes of the four Modbus data areas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankSettings {
    /// Number of coils (read/write bits, function codes 0x01, 0x05, 0x0F)
    pub coil_count: u16,

    /// Number of discrete inputs (read-only bits, function code 0x02)
    pub discrete_input_count: u16,

    /// Number of holding registers (read/write 16-bit, function codes 0x03, 0x06, 0x10)
    pub holding_register_count: u16,

    /// Number of input registers (read-only 16-bit, function code 0x04)
    pub input_register_count: u16,
}

impl Default for BankSettings {
    fn default() -> Self {
        Self {
            coil_count: 10000,
            discrete_input_count: 10000,
            holding_register_count: 10000,
            input_register_count: 10000,
        }
    }
}

/// Thread-safe storage for the four Modbus data areas
pub struct RegisterBank {
    coils: RwLock<BitVec<u8, Msb0>>,
    discrete_inputs: RwLock<BitVec<u8, Msb0>>,
    holding_registers: RwLock<Vec<u16>>,
    input_registers: RwLock<Vec<u16>>,
    settings: BankSettings,
}

impl RegisterBank {
    /// Create a new RegisterBank with the specified area sizes
    pub fn new(settings: &BankSettings) -> Self {
        Self {
            coils: RwLock::new(bitvec![u8, Msb0; 0; settings.coil_count as usize]),
            discrete_inputs: RwLock::new(
                bitvec![u8, Msb0; 0; settings.discrete_input_count as usize],
            ),
            holding_registers: RwLock::new(vec![0u16; settings.holding_register_count as usize]),
            input_registers: RwLock::new(vec![0u16; settings.input_register_count as usize]),
            settings: settings.clone(),
        }
    }

    /// Create a new RegisterBank with default area sizes
    pub fn with_defaults() -> Self {
        Self::new(&BankSettings::default())
    }

    /// Get the area sizes
    pub fn settings(&self) -> &BankSettings {
        &self.settings
    }

    // ========== Coils ==========

    /// Read multiple coils starting from the specified address
    pub fn read_coils(&self, start: u16, count: u16) -> Result<Vec<bool>, AccessError> {
        validate_range(start, count, self.settings.coil_count)?;

        let coils = self.coils.read();
        let start_idx = start as usize;
        let end_idx = start_idx + count as usize;

        Ok(coils[start_idx..end_idx].iter().map(|b| *b).collect())
    }

    /// Write a single coil at the specified address
    pub fn write_coil(&self, address: u16, value: bool) -> Result<(), AccessError> {
        self.write_coils(address, &[value])
    }

    /// Write multiple coils starting from the specified address
    pub fn write_coils(&self, start: u16, values: &[bool]) -> Result<(), AccessError> {
        validate_range(start, values.len() as u16, self.settings.coil_count)?;

        let mut coils = self.coils.write();
        for (i, &value) in values.iter().enumerate() {
            coils.set(start as usize + i, value);
        }
        Ok(())
    }

    // ========== Discrete Inputs ==========

    /// Read multiple discrete inputs starting from the specified address
    pub fn read_discrete_inputs(&self, start: u16, count: u16) -> Result<Vec<bool>, AccessError> {
        validate_range(start, count, self.settings.discrete_input_count)?;

        let inputs = self.discrete_inputs.read();
        let start_idx = start as usize;
        let end_idx = start_idx + count as usize;

        Ok(inputs[start_idx..end_idx].iter().map(|b| *b).collect())
    }

    /// Set a single discrete input (device side)
    pub fn set_discrete_input(&self, address: u16, value: bool) -> Result<(), AccessError> {
        self.set_discrete_inputs(address, &[value])
    }

    /// Set multiple discrete inputs (device side)
    pub fn set_discrete_inputs(&self, start: u16, values: &[bool]) -> Result<(), AccessError> {
        validate_range(start, values.len() as u16, self.settings.discrete_input_count)?;

        let mut inputs = self.discrete_inputs.write();
        for (i, &value) in values.iter().enumerate() {
            inputs.set(start as usize + i, value);
        }
        Ok(())
    }

    // ========== Holding Registers ==========

    /// Read multiple holding registers starting from the specified address
    pub fn read_holding_registers(&self, start: u16, count: u16) -> Result<Vec<u16>, AccessError> {
        validate_range(start, count, self.settings.holding_register_count)?;

        let registers = self.holding_registers.read();
        let start_idx = start as usize;
        let end_idx = start_idx + count as usize;

        Ok(registers[start_idx..end_idx].to_vec())
    }

    /// Write a single holding register at the specified address
    pub fn write_holding_register(&self, address: u16, value: u16) -> Result<(), AccessError> {
        self.write_holding_registers(address, &[value])
    }

    /// Write multiple holding registers starting from the specified address
    pub fn write_holding_registers(&self, start: u16, values: &[u16]) -> Result<(), AccessError> {
        validate_range(start, values.len() as u16, self.settings.holding_register_count)?;

        let mut registers = self.holding_registers.write();
        registers[start as usize..start as usize + values.len()].copy_from_slice(values);
        Ok(())
    }

    // ========== Input Registers ==========

    /// Read multiple input registers starting from the specified address
    pub fn read_input_registers(&self, start: u16, count: u16) -> Result<Vec<u16>, AccessError> {
        validate_range(start, count, self.settings.input_register_count)?;

        let registers = self.input_registers.read();
        let start_idx = start as usize;
        let end_idx = start_idx + count as usize;

        Ok(registers[start_idx..end_idx].to_vec())
    }

    /// Set a single input register (device side)
    pub fn set_input_register(&self, address: u16, value: u16) -> Result<(), AccessError> {
        self.set_input_registers(address, &[value])
    }

    /// Set multiple input registers (device side)
    pub fn set_input_registers(&self, start: u16, values: &[u16]) -> Result<(), AccessError> {
        validate_range(start, values.len() as u16, self.settings.input_register_count)?;

        let mut registers = self.input_registers.write();
        registers[start as usize..start as usize + values.len()].copy_from_slice(values);
        Ok(())
    }
}

impl SlaveHandler for RegisterBank {
    fn read_coils(&self, addr: u16, qty: u16) -> Result<Vec<bool>, AccessError> {
        RegisterBank::read_coils(self, addr, qty)
    }

    fn write_coils(&self, addr: u16, values: &[bool]) -> Result<(), AccessError> {
        RegisterBank::write_coils(self, addr, values)
    }

    fn read_discrete_inputs(&self, addr: u16, qty: u16) -> Result<Vec<bool>, AccessError> {
        RegisterBank::read_discrete_inputs(self, addr, qty)
    }

    fn read_holding_registers(&self, addr: u16, qty: u16) -> Result<Vec<u16>, AccessError> {
        RegisterBank::read_holding_registers(self, addr, qty)
    }

    fn write_holding_registers(&self, addr: u16, values: &[u16]) -> Result<(), AccessError> {
        RegisterBank::write_holding_registers(self, addr, values)
    }

    fn read_input_registers(&self, addr: u16, qty: u16) -> Result<Vec<u16>, AccessError> {
        RegisterBank::read_input_registers(self, addr, qty)
    }
}

/// Check that `count` elements starting at `start` fit inside an area of
/// `limit` elements.
fn validate_range(start: u16, count: u16, limit: u16) -> Result<(), AccessError> {
    let end = start as u32 + count as u32;
    if count == 0 || start >= limit || end > limit as u32 {
        return Err(AccessError::OutOfBounds { start, count });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_settings() -> BankSettings {
        BankSettings {
            coil_count: 16,
            discrete_input_count: 16,
            holding_register_count: 16,
            input_register_count: 16,
        }
    }

    #[test]
    fn test_holding_register_round_trip() {
        let bank = RegisterBank::new(&small_settings());
        bank.write_holding_registers(3, &[11, 22, 33]).unwrap();
        assert_eq!(bank.read_holding_registers(3, 3).unwrap(), vec![11, 22, 33]);
        // Untouched registers stay at zero.
        assert_eq!(bank.read_holding_registers(0, 3).unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn test_coil_round_trip() {
        let bank = RegisterBank::new(&small_settings());
        bank.write_coils(0, &[true, false, true]).unwrap();
        assert_eq!(
            bank.read_coils(0, 4).unwrap(),
            vec![true, false, true, false]
        );

        bank.write_coil(1, true).unwrap();
        assert_eq!(bank.read_coils(1, 1).unwrap(), vec![true]);
    }

    #[test]
    fn test_device_side_areas() {
        let bank = RegisterBank::new(&small_settings());
        bank.set_discrete_input(7, true).unwrap();
        bank.set_input_registers(0, &[99, 100]).unwrap();

        assert_eq!(bank.read_discrete_inputs(7, 1).unwrap(), vec![true]);
        assert_eq!(bank.read_input_registers(0, 2).unwrap(), vec![99, 100]);
    }

    #[test]
    fn test_out_of_bounds_access() {
        let bank = RegisterBank::new(&small_settings());

        assert!(matches!(
            bank.read_holding_registers(16, 1),
            Err(AccessError::OutOfBounds { .. })
        ));
        // Range starts inside the area but runs past its end.
        assert!(matches!(
            bank.read_holding_registers(14, 3),
            Err(AccessError::OutOfBounds { .. })
        ));
        assert!(matches!(
            bank.write_coils(15, &[true, true]),
            Err(AccessError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_boundary_access_is_allowed() {
        let bank = RegisterBank::new(&small_settings());
        bank.write_holding_registers(14, &[1, 2]).unwrap();
        assert_eq!(bank.read_holding_registers(14, 2).unwrap(), vec![1, 2]);
    }
}
