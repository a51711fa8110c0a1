//! Process image: the addressable data model of a slave device
//!
//! A process image holds four independent, zero-indexed tables:
//!
//! | Table | Element | Access from the wire |
//! |-------|---------|----------------------|
//! | discrete inputs | [`DigitalIn`] | read |
//! | coils | [`DigitalOut`] | read / write |
//! | input registers | [`InputRegister`] | read |
//! | holding registers | [`Register`] | read / write |
//!
//! Tables are sized once when the image is built. Every range access is
//! checked: `start + count` beyond the table length is an addressing fault,
//! never a clamp.
//!
//! All tables sit behind one `RwLock`. A request takes the lock once for its
//! whole read-modify-write sequence, so concurrent writes from different
//! connections never interleave and readers never observe a partial write.
//!
//! ```rust
//! use procimg_modbus::ProcessImage;
//!
//! let image = ProcessImage::new(8, 8, 4, 4);
//! {
//!     let mut tables = image.write().unwrap();
//!     for coil in tables.coil_range_mut(2, 3).unwrap() {
//!         coil.set(true);
//!     }
//! }
//! assert_eq!(image.get_coils(1, 5).unwrap(), vec![false, true, true, true, false]);
//! assert!(image.get_coils(6, 3).is_err());
//! ```

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{ModbusError, ModbusResult};

/// Read-only bit (discrete input)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DigitalIn(bool);

impl DigitalIn {
    pub fn new(value: bool) -> Self {
        Self(value)
    }

    pub fn get(&self) -> bool {
        self.0
    }
}

/// Read-write bit (coil)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DigitalOut(bool);

impl DigitalOut {
    pub fn new(value: bool) -> Self {
        Self(value)
    }

    pub fn get(&self) -> bool {
        self.0
    }

    pub fn set(&mut self, value: bool) {
        self.0 = value;
    }
}

/// Read-only 16-bit register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputRegister(u16);

impl InputRegister {
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Value as an unsigned short
    pub fn get(&self) -> u16 {
        self.0
    }

    /// Value reinterpreted as a signed short
    pub fn to_i16(&self) -> i16 {
        self.0 as i16
    }

    /// Big-endian wire bytes
    pub fn to_bytes(&self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

/// Read-write 16-bit register (holding register)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Register(u16);

impl Register {
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Value as an unsigned short
    pub fn get(&self) -> u16 {
        self.0
    }

    /// Value reinterpreted as a signed short
    pub fn to_i16(&self) -> i16 {
        self.0 as i16
    }

    /// Big-endian wire bytes
    pub fn to_bytes(&self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub fn set(&mut self, value: u16) {
        self.0 = value;
    }

    /// Store a signed short in two's complement
    pub fn set_i16(&mut self, value: i16) {
        self.0 = value as u16;
    }
}

fn range<T>(table: &[T], start: u16, count: u16) -> ModbusResult<&[T]> {
    let begin = start as usize;
    let end = begin + count as usize;
    if end > table.len() {
        return Err(ModbusError::invalid_address(start, count, table.len()));
    }
    Ok(&table[begin..end])
}

fn range_mut<T>(table: &mut [T], start: u16, count: u16) -> ModbusResult<&mut [T]> {
    let begin = start as usize;
    let end = begin + count as usize;
    if end > table.len() {
        return Err(ModbusError::invalid_address(start, count, table.len()));
    }
    Ok(&mut table[begin..end])
}

fn single<T: Copy>(table: &[T], index: u16) -> ModbusResult<T> {
    Ok(range(table, index, 1)?[0])
}

/// The four tables of a process image
///
/// Obtained through [`ProcessImage::read`] or [`ProcessImage::write`]; the
/// lock is held for as long as the guard lives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageTables {
    digital_inputs: Vec<DigitalIn>,
    coils: Vec<DigitalOut>,
    input_registers: Vec<InputRegister>,
    holding_registers: Vec<Register>,
}

impl ImageTables {
    pub fn digital_input_count(&self) -> usize {
        self.digital_inputs.len()
    }

    pub fn coil_count(&self) -> usize {
        self.coils.len()
    }

    pub fn input_register_count(&self) -> usize {
        self.input_registers.len()
    }

    pub fn holding_register_count(&self) -> usize {
        self.holding_registers.len()
    }

    pub fn digital_input_range(&self, start: u16, count: u16) -> ModbusResult<&[DigitalIn]> {
        range(&self.digital_inputs, start, count)
    }

    pub fn coil_range(&self, start: u16, count: u16) -> ModbusResult<&[DigitalOut]> {
        range(&self.coils, start, count)
    }

    pub fn input_register_range(&self, start: u16, count: u16) -> ModbusResult<&[InputRegister]> {
        range(&self.input_registers, start, count)
    }

    pub fn holding_register_range(&self, start: u16, count: u16) -> ModbusResult<&[Register]> {
        range(&self.holding_registers, start, count)
    }

    pub fn digital_input(&self, index: u16) -> ModbusResult<DigitalIn> {
        single(&self.digital_inputs, index)
    }

    pub fn coil(&self, index: u16) -> ModbusResult<DigitalOut> {
        single(&self.coils, index)
    }

    pub fn input_register(&self, index: u16) -> ModbusResult<InputRegister> {
        single(&self.input_registers, index)
    }

    pub fn holding_register(&self, index: u16) -> ModbusResult<Register> {
        single(&self.holding_registers, index)
    }

    /// Mutable discrete inputs, for the application feeding field values
    pub fn digital_input_range_mut(&mut self, start: u16, count: u16) -> ModbusResult<&mut [DigitalIn]> {
        range_mut(&mut self.digital_inputs, start, count)
    }

    pub fn coil_range_mut(&mut self, start: u16, count: u16) -> ModbusResult<&mut [DigitalOut]> {
        range_mut(&mut self.coils, start, count)
    }

    /// Mutable input registers, for the application feeding field values
    pub fn input_register_range_mut(&mut self, start: u16, count: u16) -> ModbusResult<&mut [InputRegister]> {
        range_mut(&mut self.input_registers, start, count)
    }

    pub fn holding_register_range_mut(&mut self, start: u16, count: u16) -> ModbusResult<&mut [Register]> {
        range_mut(&mut self.holding_registers, start, count)
    }
}

/// Shared lock on the tables of a [`ProcessImage`]
pub type ImageReadGuard<'a> = RwLockReadGuard<'a, ImageTables>;

/// Exclusive lock on the tables of a [`ProcessImage`]
pub type ImageWriteGuard<'a> = RwLockWriteGuard<'a, ImageTables>;

/// Thread-safe process image
///
/// Share it between dispatch loops with `Arc<ProcessImage>`.
#[derive(Debug, Default)]
pub struct ProcessImage {
    tables: RwLock<ImageTables>,
}

impl ProcessImage {
    /// Create an image with zeroed tables of the given sizes
    pub fn new(
        digital_inputs: usize,
        coils: usize,
        input_registers: usize,
        holding_registers: usize,
    ) -> Self {
        Self::builder()
            .digital_inputs(digital_inputs)
            .coils(coils)
            .input_registers(input_registers)
            .holding_registers(holding_registers)
            .build()
    }

    /// Start building an image with initial values
    pub fn builder() -> ProcessImageBuilder {
        ProcessImageBuilder::default()
    }

    /// Lock the image for reading
    pub fn read(&self) -> ModbusResult<ImageReadGuard<'_>> {
        self.tables
            .read()
            .map_err(|_| ModbusError::internal("Failed to lock process image"))
    }

    /// Lock the image for writing
    pub fn write(&self) -> ModbusResult<ImageWriteGuard<'_>> {
        self.tables
            .write()
            .map_err(|_| ModbusError::internal("Failed to lock process image"))
    }

    /// Read coils as booleans
    pub fn get_coils(&self, start: u16, count: u16) -> ModbusResult<Vec<bool>> {
        Ok(self.read()?.coil_range(start, count)?.iter().map(DigitalOut::get).collect())
    }

    /// Write one coil
    pub fn set_coil(&self, index: u16, value: bool) -> ModbusResult<()> {
        self.write()?.coil_range_mut(index, 1)?[0].set(value);
        Ok(())
    }

    /// Write consecutive coils in one locked step
    pub fn set_coils(&self, start: u16, values: &[bool]) -> ModbusResult<()> {
        let count = table_count(values.len())?;
        let mut tables = self.write()?;
        for (coil, &value) in tables.coil_range_mut(start, count)?.iter_mut().zip(values) {
            coil.set(value);
        }
        Ok(())
    }

    /// Read discrete inputs as booleans
    pub fn get_discrete_inputs(&self, start: u16, count: u16) -> ModbusResult<Vec<bool>> {
        Ok(self
            .read()?
            .digital_input_range(start, count)?
            .iter()
            .map(DigitalIn::get)
            .collect())
    }

    /// Update one discrete input (simulation / field side)
    pub fn set_discrete_input(&self, index: u16, value: bool) -> ModbusResult<()> {
        self.write()?.digital_input_range_mut(index, 1)?[0] = DigitalIn::new(value);
        Ok(())
    }

    /// Read holding registers as unsigned values
    pub fn get_holding_registers(&self, start: u16, count: u16) -> ModbusResult<Vec<u16>> {
        Ok(self
            .read()?
            .holding_register_range(start, count)?
            .iter()
            .map(Register::get)
            .collect())
    }

    /// Write one holding register
    pub fn set_holding_register(&self, index: u16, value: u16) -> ModbusResult<()> {
        self.write()?.holding_register_range_mut(index, 1)?[0].set(value);
        Ok(())
    }

    /// Write consecutive holding registers in one locked step
    pub fn set_holding_registers(&self, start: u16, values: &[u16]) -> ModbusResult<()> {
        let count = table_count(values.len())?;
        let mut tables = self.write()?;
        for (register, &value) in tables
            .holding_register_range_mut(start, count)?
            .iter_mut()
            .zip(values)
        {
            register.set(value);
        }
        Ok(())
    }

    /// Read input registers as unsigned values
    pub fn get_input_registers(&self, start: u16, count: u16) -> ModbusResult<Vec<u16>> {
        Ok(self
            .read()?
            .input_register_range(start, count)?
            .iter()
            .map(InputRegister::get)
            .collect())
    }

    /// Update one input register (simulation / field side)
    pub fn set_input_register(&self, index: u16, value: u16) -> ModbusResult<()> {
        self.write()?.input_register_range_mut(index, 1)?[0] = InputRegister::new(value);
        Ok(())
    }

    /// Get table sizes
    pub fn get_stats(&self) -> ModbusResult<ProcessImageStats> {
        let tables = self.read()?;
        Ok(ProcessImageStats {
            discrete_inputs_count: tables.digital_input_count(),
            coils_count: tables.coil_count(),
            input_registers_count: tables.input_register_count(),
            holding_registers_count: tables.holding_register_count(),
        })
    }
}

fn table_count(len: usize) -> ModbusResult<u16> {
    u16::try_from(len).map_err(|_| ModbusError::invalid_data(format!("{} values exceed a table", len)))
}

/// Builder for a [`ProcessImage`] with initial values
#[derive(Debug, Clone, Default)]
pub struct ProcessImageBuilder {
    tables: ImageTables,
}

impl ProcessImageBuilder {
    /// Size the discrete input table, all inputs off
    pub fn digital_inputs(mut self, count: usize) -> Self {
        self.tables.digital_inputs = vec![DigitalIn::default(); count];
        self
    }

    /// Size the coil table, all coils off
    pub fn coils(mut self, count: usize) -> Self {
        self.tables.coils = vec![DigitalOut::default(); count];
        self
    }

    pub fn input_registers(mut self, count: usize) -> Self {
        self.tables.input_registers = vec![InputRegister::default(); count];
        self
    }

    pub fn holding_registers(mut self, count: usize) -> Self {
        self.tables.holding_registers = vec![Register::default(); count];
        self
    }

    pub fn digital_input_values(mut self, values: &[bool]) -> Self {
        self.tables.digital_inputs = values.iter().copied().map(DigitalIn::new).collect();
        self
    }

    pub fn coil_values(mut self, values: &[bool]) -> Self {
        self.tables.coils = values.iter().copied().map(DigitalOut::new).collect();
        self
    }

    pub fn input_register_values(mut self, values: &[u16]) -> Self {
        self.tables.input_registers = values.iter().copied().map(InputRegister::new).collect();
        self
    }

    pub fn holding_register_values(mut self, values: &[u16]) -> Self {
        self.tables.holding_registers = values.iter().copied().map(Register::new).collect();
        self
    }

    pub fn build(self) -> ProcessImage {
        ProcessImage {
            tables: RwLock::new(self.tables),
        }
    }
}

/// Process image table sizes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessImageStats {
    pub discrete_inputs_count: usize,
    pub coils_count: usize,
    pub input_registers_count: usize,
    pub holding_registers_count: usize,
}
