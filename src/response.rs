//! Modbus responses
//!
//! The counterpart of [`crate::request::Request`]. Read responses carry the
//! data, write responses echo address metadata, and exception responses
//! carry the original function code plus an exception code. On the wire an
//! exception travels as `fc | 0x80` followed by the single exception byte.
//!
//! Read-bit responses only know their byte count, so they decode to
//! `byte_count * 8` bits. The caller that issued the request truncates to
//! the quantity it asked for.

use byteorder::{BigEndian, ReadBytesExt};
use bytes::BufMut;
use std::fmt;
use std::io::Cursor;

use crate::bitvector::BitVector;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{
    Frame, Header, ModbusAddress, ModbusException, ModbusFunction, UnitId, COIL_OFF, COIL_ON,
    EXCEPTION_FLAG,
};

/// An exception reply to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionResponse {
    /// Function code of the failed request, without the exception flag
    pub function: u8,
    pub code: ModbusException,
}

impl ExceptionResponse {
    pub fn new(function: u8, code: ModbusException) -> Self {
        Self {
            function: function & !EXCEPTION_FLAG,
            code,
        }
    }

    /// Convert into the error a master surfaces to its caller
    pub fn to_error(&self) -> ModbusError {
        ModbusError::exception(self.function, self.code.to_u8())
    }
}

/// A decoded Modbus response PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ReadCoils(BitVector),
    ReadDiscreteInputs(BitVector),
    ReadHoldingRegisters(Vec<u16>),
    ReadInputRegisters(Vec<u16>),
    WriteSingleCoil { address: ModbusAddress, value: bool },
    WriteSingleRegister { address: ModbusAddress, value: u16 },
    WriteMultipleCoils { address: ModbusAddress, quantity: u16 },
    WriteMultipleRegisters { address: ModbusAddress, quantity: u16 },
    Exception(ExceptionResponse),
}

impl Response {
    /// Function code byte as it appears on the wire
    ///
    /// Exception responses return the original code with the 0x80 bit set.
    pub fn function_code(&self) -> u8 {
        match self {
            Response::ReadCoils(_) => ModbusFunction::ReadCoils.to_u8(),
            Response::ReadDiscreteInputs(_) => ModbusFunction::ReadDiscreteInputs.to_u8(),
            Response::ReadHoldingRegisters(_) => ModbusFunction::ReadHoldingRegisters.to_u8(),
            Response::ReadInputRegisters(_) => ModbusFunction::ReadInputRegisters.to_u8(),
            Response::WriteSingleCoil { .. } => ModbusFunction::WriteSingleCoil.to_u8(),
            Response::WriteSingleRegister { .. } => ModbusFunction::WriteSingleRegister.to_u8(),
            Response::WriteMultipleCoils { .. } => ModbusFunction::WriteMultipleCoils.to_u8(),
            Response::WriteMultipleRegisters { .. } => {
                ModbusFunction::WriteMultipleRegisters.to_u8()
            }
            Response::Exception(exception) => exception.function | EXCEPTION_FLAG,
        }
    }

    /// Function code with the exception flag cleared
    pub fn request_function_code(&self) -> u8 {
        self.function_code() & !EXCEPTION_FLAG
    }

    pub fn is_exception(&self) -> bool {
        matches!(self, Response::Exception(_))
    }

    /// Serialize the payload (everything after the function code)
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        match self {
            Response::ReadCoils(bits) | Response::ReadDiscreteInputs(bits) => {
                buf.put_u8(bits.byte_size() as u8);
                buf.put_slice(bits.get_bytes());
            }
            Response::ReadHoldingRegisters(values) | Response::ReadInputRegisters(values) => {
                buf.put_u8((values.len() * 2) as u8);
                for &value in values {
                    buf.put_u16(value);
                }
            }
            Response::WriteSingleCoil { address, value } => {
                buf.put_u16(*address);
                buf.put_u16(if *value { COIL_ON } else { COIL_OFF });
            }
            Response::WriteSingleRegister { address, value } => {
                buf.put_u16(*address);
                buf.put_u16(*value);
            }
            Response::WriteMultipleCoils { address, quantity }
            | Response::WriteMultipleRegisters { address, quantity } => {
                buf.put_u16(*address);
                buf.put_u16(*quantity);
            }
            Response::Exception(exception) => {
                buf.put_u8(exception.code.to_u8());
            }
        }
        buf
    }

    /// Decode a response payload for the given wire function code
    ///
    /// # Errors
    ///
    /// - `InvalidFunction` for function codes this stack does not implement
    /// - `Frame` when the payload length or byte count is inconsistent, or
    ///   an exception carries an unknown exception code
    pub fn decode(function_code: u8, payload: &[u8]) -> ModbusResult<Self> {
        if function_code & EXCEPTION_FLAG != 0 {
            let original = function_code & !EXCEPTION_FLAG;
            expect_len(function_code, payload, 1)?;
            let code = ModbusException::from_u8(payload[0]).ok_or_else(|| {
                ModbusError::frame(format!("Unknown exception code 0x{:02X}", payload[0]))
            })?;
            return Ok(Response::Exception(ExceptionResponse::new(original, code)));
        }

        let function = ModbusFunction::from_u8(function_code)?;
        let mut cursor = Cursor::new(payload);

        let response = match function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
                let byte_count = cursor.read_u8()? as usize;
                expect_len(function_code, payload, 1 + byte_count)?;
                let bits = BitVector::create(&payload[1..], byte_count * 8)?;
                if function == ModbusFunction::ReadCoils {
                    Response::ReadCoils(bits)
                } else {
                    Response::ReadDiscreteInputs(bits)
                }
            }
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                let byte_count = cursor.read_u8()? as usize;
                if byte_count % 2 != 0 {
                    return Err(ModbusError::frame(format!(
                        "{}: odd register byte count {}",
                        function, byte_count
                    )));
                }
                expect_len(function_code, payload, 1 + byte_count)?;
                let mut values = Vec::with_capacity(byte_count / 2);
                for _ in 0..byte_count / 2 {
                    values.push(cursor.read_u16::<BigEndian>()?);
                }
                if function == ModbusFunction::ReadHoldingRegisters {
                    Response::ReadHoldingRegisters(values)
                } else {
                    Response::ReadInputRegisters(values)
                }
            }
            ModbusFunction::WriteSingleCoil => {
                expect_len(function_code, payload, 4)?;
                let address = cursor.read_u16::<BigEndian>()?;
                let value = match cursor.read_u16::<BigEndian>()? {
                    COIL_ON => true,
                    COIL_OFF => false,
                    other => {
                        return Err(ModbusError::frame(format!(
                            "Invalid coil echo 0x{:04X}",
                            other
                        )))
                    }
                };
                Response::WriteSingleCoil { address, value }
            }
            ModbusFunction::WriteSingleRegister => {
                expect_len(function_code, payload, 4)?;
                Response::WriteSingleRegister {
                    address: cursor.read_u16::<BigEndian>()?,
                    value: cursor.read_u16::<BigEndian>()?,
                }
            }
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                expect_len(function_code, payload, 4)?;
                let address = cursor.read_u16::<BigEndian>()?;
                let quantity = cursor.read_u16::<BigEndian>()?;
                if function == ModbusFunction::WriteMultipleCoils {
                    Response::WriteMultipleCoils { address, quantity }
                } else {
                    Response::WriteMultipleRegisters { address, quantity }
                }
            }
        };

        Ok(response)
    }

    /// Cut read-bit responses down to the requested quantity
    ///
    /// Other variants are returned unchanged.
    pub fn truncate_bits(self, quantity: u16) -> Self {
        match self {
            Response::ReadCoils(bits) => Response::ReadCoils(bits.truncated(quantity as usize)),
            Response::ReadDiscreteInputs(bits) => {
                Response::ReadDiscreteInputs(bits.truncated(quantity as usize))
            }
            other => other,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::ReadCoils(bits) | Response::ReadDiscreteInputs(bits) => {
                write!(f, "Byte Count: {}, Bits: {:?}", bits.byte_size(), bits)
            }
            Response::ReadHoldingRegisters(values) | Response::ReadInputRegisters(values) => {
                write!(f, "Byte Count: {}, Values: {:?}", values.len() * 2, values)
            }
            Response::WriteSingleCoil { address, value } => write!(
                f,
                "Address: {}, Value: {}",
                address,
                if *value { "ON" } else { "OFF" }
            ),
            Response::WriteSingleRegister { address, value } => {
                write!(f, "Address: {}, Value: {} (0x{:04X})", address, value, value)
            }
            Response::WriteMultipleCoils { address, quantity }
            | Response::WriteMultipleRegisters { address, quantity } => {
                write!(f, "Address: {}, Quantity: {}", address, quantity)
            }
            Response::Exception(exception) => write!(
                f,
                "Exception for function 0x{:02X}: {}",
                exception.function, exception.code
            ),
        }
    }
}

fn expect_len(function_code: u8, payload: &[u8], expected: usize) -> ModbusResult<()> {
    if payload.len() != expected {
        return Err(ModbusError::frame(format!(
            "Response 0x{:02X}: expected {} payload bytes, got {}",
            function_code,
            expected,
            payload.len()
        )));
    }
    Ok(())
}

/// A response together with its addressing header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseAdu {
    header: Header,
    response: Response,
}

impl ResponseAdu {
    pub fn new(header: Header, response: Response) -> Self {
        Self { header, response }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn unit_id(&self) -> UnitId {
        self.header.unit_id
    }

    pub fn transaction_id(&self) -> u16 {
        self.header.transaction_id
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn into_response(self) -> Response {
        self.response
    }

    /// Decode a framed response
    pub fn decode(frame: &Frame) -> ModbusResult<Self> {
        Ok(Self {
            header: frame.header,
            response: Response::decode(frame.function_code, &frame.data)?,
        })
    }

    /// Frame ready for a transport
    pub fn to_frame(&self) -> Frame {
        Frame::new(self.header, self.response.function_code(), self.response.encode())
    }
}
