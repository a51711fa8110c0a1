//! Modbus protocol definitions
//!
//! Function codes, exception codes, the ADU header shared by requests and
//! responses, and [`Frame`], the transport-neutral envelope every transport
//! reads and writes.

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ModbusError, ModbusResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus unit identifier
pub type UnitId = u8;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Maximum PDU size (function code + payload)
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum coils/discrete inputs per read request
pub const MAX_READ_BITS: u16 = 2000;

/// Maximum registers per read request
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum coils per write multiple coils request
pub const MAX_WRITE_BITS: u16 = 1968;

/// Maximum registers per write multiple registers request
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Wire value of an energized coil in a write single coil request
pub const COIL_ON: u16 = 0xFF00;

/// Wire value of a de-energized coil in a write single coil request
pub const COIL_OFF: u16 = 0x0000;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable name
    pub fn name(self) -> &'static str {
        match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        }
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "The function code received in the query is not an allowable action for the server",
            ModbusException::IllegalDataAddress => "The data address received in the query is not an allowable address for the server",
            ModbusException::IllegalDataValue => "A value contained in the query data field is not an allowable value for server",
            ModbusException::ServerDeviceFailure => "An unrecoverable error occurred while the server was attempting to perform the requested action",
            ModbusException::Acknowledge => "The server has accepted the request and is processing it, but a long duration of time will be required to do so",
            ModbusException::ServerDeviceBusy => "The server is engaged in processing a long-duration program command",
            ModbusException::MemoryParityError => "The server attempted to read record file, but detected a parity error in the memory",
            ModbusException::GatewayPathUnavailable => "Gateway was unable to allocate an internal communication path",
            ModbusException::GatewayTargetDeviceFailedToRespond => "No response was obtained from the target device",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// Addressing fields shared by a request and its response
///
/// `transaction_id` and `protocol_id` only travel on the wire for TCP;
/// headless (serial) transports leave them at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Header {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub unit_id: UnitId,
}

impl Header {
    /// Header for the given unit with zero transaction and protocol ids
    pub fn new(unit_id: UnitId) -> Self {
        Self {
            transaction_id: 0,
            protocol_id: 0,
            unit_id,
        }
    }

    /// Copy of this header carrying another transaction id
    pub fn with_transaction_id(self, transaction_id: u16) -> Self {
        Self { transaction_id, ..self }
    }
}

/// A framed but not yet decoded ADU
///
/// This is what transports exchange: header fields, the raw function code
/// byte (possibly with the exception bit set) and the function-specific
/// payload. Checksums and length prefixes are the transport's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub function_code: u8,
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a new frame
    pub fn new(header: Header, function_code: u8, data: Vec<u8>) -> Self {
        Self {
            header,
            function_code,
            data,
        }
    }

    /// Check if the function code carries the exception flag
    pub fn is_exception(&self) -> bool {
        self.function_code & EXCEPTION_FLAG != 0
    }

    /// PDU length (function code + payload)
    pub fn pdu_len(&self) -> usize {
        1 + self.data.len()
    }

    /// Serialize with an MBAP header
    ///
    /// `tid, pid, length, unit, fc, payload` where length counts the unit id
    /// and the PDU.
    pub fn to_tcp_adu(&self) -> ModbusResult<Vec<u8>> {
        self.check_pdu_len()?;
        let length = (1 + self.pdu_len()) as u16;
        let mut adu = Vec::with_capacity(6 + length as usize);
        adu.put_u16(self.header.transaction_id);
        adu.put_u16(self.header.protocol_id);
        adu.put_u16(length);
        adu.put_u8(self.header.unit_id);
        adu.put_u8(self.function_code);
        adu.put_slice(&self.data);
        Ok(adu)
    }

    /// Serialize without transaction/protocol ids (`unit, fc, payload`)
    pub fn to_headless_adu(&self) -> ModbusResult<Vec<u8>> {
        self.check_pdu_len()?;
        let mut adu = Vec::with_capacity(1 + self.pdu_len());
        adu.put_u8(self.header.unit_id);
        adu.put_u8(self.function_code);
        adu.put_slice(&self.data);
        Ok(adu)
    }

    fn check_pdu_len(&self) -> ModbusResult<()> {
        if self.pdu_len() > MAX_PDU_SIZE {
            return Err(ModbusError::frame(format!(
                "PDU of {} bytes exceeds the {} byte limit",
                self.pdu_len(),
                MAX_PDU_SIZE
            )));
        }
        Ok(())
    }
}

/// Data conversion utilities
pub mod data_utils {
    /// Format bytes as space separated hex pairs
    pub fn format_hex(data: &[u8]) -> String {
        data.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
