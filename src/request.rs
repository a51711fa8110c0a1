//! Modbus requests
//!
//! [`Request`] is a closed set of the function codes this stack implements.
//! Each variant owns its payload struct and knows its wire layout; decoding
//! is keyed on the function code byte so an unsupported code always fails
//! with `ModbusError::InvalidFunction`.
//!
//! Requests also answer themselves: [`Request::build_response`] applies the
//! request to a [`ProcessImage`] and produces either the normal response or
//! the matching exception response.
//!
//! | FC | Payload |
//! |----|---------|
//! | 0x01-0x04 | address, quantity |
//! | 0x05 | address, 0xFF00 / 0x0000 |
//! | 0x06 | address, value |
//! | 0x0F | address, quantity, byte count, packed bits |
//! | 0x10 | address, quantity, byte count, registers |

use byteorder::{BigEndian, ReadBytesExt};
use bytes::BufMut;
use std::fmt;
use std::io::Cursor;

use crate::bitvector::BitVector;
use crate::error::{ModbusError, ModbusResult};
use crate::process_image::{DigitalIn, DigitalOut, InputRegister, ProcessImage, Register};
use crate::protocol::{
    Frame, Header, ModbusAddress, ModbusException, ModbusFunction, UnitId, COIL_OFF, COIL_ON,
    MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_BITS, MAX_WRITE_REGISTERS,
};
use crate::response::{ExceptionResponse, Response, ResponseAdu};

/// Payload of the four read functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub address: ModbusAddress,
    pub quantity: u16,
}

/// Payload of write single coil (0x05)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSingleCoilRequest {
    pub address: ModbusAddress,
    pub value: bool,
}

/// Payload of write single register (0x06)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSingleRegisterRequest {
    pub address: ModbusAddress,
    pub value: u16,
}

/// Payload of write multiple coils (0x0F)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteMultipleCoilsRequest {
    pub address: ModbusAddress,
    pub coils: BitVector,
}

/// Payload of write multiple registers (0x10)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteMultipleRegistersRequest {
    pub address: ModbusAddress,
    pub values: Vec<u16>,
}

/// A decoded Modbus request PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils(ReadRequest),
    ReadDiscreteInputs(ReadRequest),
    ReadHoldingRegisters(ReadRequest),
    ReadInputRegisters(ReadRequest),
    WriteSingleCoil(WriteSingleCoilRequest),
    WriteSingleRegister(WriteSingleRegisterRequest),
    WriteMultipleCoils(WriteMultipleCoilsRequest),
    WriteMultipleRegisters(WriteMultipleRegistersRequest),
}

impl Request {
    pub fn read_coils(address: ModbusAddress, quantity: u16) -> Self {
        Request::ReadCoils(ReadRequest { address, quantity })
    }

    pub fn read_discrete_inputs(address: ModbusAddress, quantity: u16) -> Self {
        Request::ReadDiscreteInputs(ReadRequest { address, quantity })
    }

    pub fn read_holding_registers(address: ModbusAddress, quantity: u16) -> Self {
        Request::ReadHoldingRegisters(ReadRequest { address, quantity })
    }

    pub fn read_input_registers(address: ModbusAddress, quantity: u16) -> Self {
        Request::ReadInputRegisters(ReadRequest { address, quantity })
    }

    pub fn write_single_coil(address: ModbusAddress, value: bool) -> Self {
        Request::WriteSingleCoil(WriteSingleCoilRequest { address, value })
    }

    pub fn write_single_register(address: ModbusAddress, value: u16) -> Self {
        Request::WriteSingleRegister(WriteSingleRegisterRequest { address, value })
    }

    pub fn write_multiple_coils(address: ModbusAddress, values: &[bool]) -> Self {
        Request::WriteMultipleCoils(WriteMultipleCoilsRequest {
            address,
            coils: BitVector::from_bools(values),
        })
    }

    pub fn write_multiple_registers(address: ModbusAddress, values: &[u16]) -> Self {
        Request::WriteMultipleRegisters(WriteMultipleRegistersRequest {
            address,
            values: values.to_vec(),
        })
    }

    /// Function code of this request
    pub fn function(&self) -> ModbusFunction {
        match self {
            Request::ReadCoils(_) => ModbusFunction::ReadCoils,
            Request::ReadDiscreteInputs(_) => ModbusFunction::ReadDiscreteInputs,
            Request::ReadHoldingRegisters(_) => ModbusFunction::ReadHoldingRegisters,
            Request::ReadInputRegisters(_) => ModbusFunction::ReadInputRegisters,
            Request::WriteSingleCoil(_) => ModbusFunction::WriteSingleCoil,
            Request::WriteSingleRegister(_) => ModbusFunction::WriteSingleRegister,
            Request::WriteMultipleCoils(_) => ModbusFunction::WriteMultipleCoils,
            Request::WriteMultipleRegisters(_) => ModbusFunction::WriteMultipleRegisters,
        }
    }

    /// Function code byte of this request
    pub fn function_code(&self) -> u8 {
        self.function().to_u8()
    }

    /// Serialize the payload (everything after the function code)
    ///
    /// Oversized write payloads are caught when the frame is serialized.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        match self {
            Request::ReadCoils(read)
            | Request::ReadDiscreteInputs(read)
            | Request::ReadHoldingRegisters(read)
            | Request::ReadInputRegisters(read) => {
                buf.put_u16(read.address);
                buf.put_u16(read.quantity);
            }
            Request::WriteSingleCoil(write) => {
                buf.put_u16(write.address);
                buf.put_u16(if write.value { COIL_ON } else { COIL_OFF });
            }
            Request::WriteSingleRegister(write) => {
                buf.put_u16(write.address);
                buf.put_u16(write.value);
            }
            Request::WriteMultipleCoils(write) => {
                buf.put_u16(write.address);
                buf.put_u16(write.coils.size() as u16);
                buf.put_u8(write.coils.byte_size() as u8);
                buf.put_slice(write.coils.get_bytes());
            }
            Request::WriteMultipleRegisters(write) => {
                buf.put_u16(write.address);
                buf.put_u16(write.values.len() as u16);
                buf.put_u8((write.values.len() * 2) as u8);
                for &value in &write.values {
                    buf.put_u16(value);
                }
            }
        }
        buf
    }

    /// Decode a request payload for the given function code
    ///
    /// # Errors
    ///
    /// - `InvalidFunction` for function codes this stack does not implement
    /// - `Frame` when the payload length breaks the function's length rule
    /// - `InvalidData` for a coil value other than 0xFF00 / 0x0000
    pub fn decode(function_code: u8, payload: &[u8]) -> ModbusResult<Self> {
        let function = ModbusFunction::from_u8(function_code)?;
        let mut cursor = Cursor::new(payload);

        let request = match function {
            ModbusFunction::ReadCoils
            | ModbusFunction::ReadDiscreteInputs
            | ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters => {
                expect_len(function, payload, 4)?;
                let read = ReadRequest {
                    address: cursor.read_u16::<BigEndian>()?,
                    quantity: cursor.read_u16::<BigEndian>()?,
                };
                match function {
                    ModbusFunction::ReadCoils => Request::ReadCoils(read),
                    ModbusFunction::ReadDiscreteInputs => Request::ReadDiscreteInputs(read),
                    ModbusFunction::ReadHoldingRegisters => Request::ReadHoldingRegisters(read),
                    _ => Request::ReadInputRegisters(read),
                }
            }
            ModbusFunction::WriteSingleCoil => {
                expect_len(function, payload, 4)?;
                let address = cursor.read_u16::<BigEndian>()?;
                let value = match cursor.read_u16::<BigEndian>()? {
                    COIL_ON => true,
                    COIL_OFF => false,
                    other => {
                        return Err(ModbusError::invalid_data(format!(
                            "Invalid coil value 0x{:04X}",
                            other
                        )))
                    }
                };
                Request::WriteSingleCoil(WriteSingleCoilRequest { address, value })
            }
            ModbusFunction::WriteSingleRegister => {
                expect_len(function, payload, 4)?;
                Request::WriteSingleRegister(WriteSingleRegisterRequest {
                    address: cursor.read_u16::<BigEndian>()?,
                    value: cursor.read_u16::<BigEndian>()?,
                })
            }
            ModbusFunction::WriteMultipleCoils => {
                let address = cursor.read_u16::<BigEndian>()?;
                let quantity = cursor.read_u16::<BigEndian>()?;
                let byte_count = cursor.read_u8()? as usize;
                let expected = (quantity as usize + 7) / 8;
                if byte_count != expected {
                    return Err(ModbusError::frame(format!(
                        "{}: byte count {} does not match {} coils",
                        function, byte_count, quantity
                    )));
                }
                expect_len(function, payload, 5 + byte_count)?;
                let coils = BitVector::create(&payload[5..], quantity as usize)?;
                Request::WriteMultipleCoils(WriteMultipleCoilsRequest { address, coils })
            }
            ModbusFunction::WriteMultipleRegisters => {
                let address = cursor.read_u16::<BigEndian>()?;
                let quantity = cursor.read_u16::<BigEndian>()?;
                let byte_count = cursor.read_u8()? as usize;
                if byte_count != quantity as usize * 2 {
                    return Err(ModbusError::frame(format!(
                        "{}: byte count {} does not match {} registers",
                        function, byte_count, quantity
                    )));
                }
                expect_len(function, payload, 5 + byte_count)?;
                let mut values = Vec::with_capacity(quantity as usize);
                for _ in 0..quantity {
                    values.push(cursor.read_u16::<BigEndian>()?);
                }
                Request::WriteMultipleRegisters(WriteMultipleRegistersRequest { address, values })
            }
        };

        Ok(request)
    }

    /// Apply this request to a process image and build the answer
    ///
    /// Reads never touch the image and echo the data. Writes mutate the
    /// image and echo address metadata only. A quantity outside the protocol
    /// limits yields Illegal Data Value, a range outside the image yields
    /// Illegal Data Address; the image is left untouched in both cases.
    pub fn build_response(&self, image: &ProcessImage) -> Response {
        match self.apply(image) {
            Ok(response) => response,
            Err(error) => self.exception(exception_for(&error)),
        }
    }

    /// Exception response to this request
    pub fn exception(&self, code: ModbusException) -> Response {
        Response::Exception(ExceptionResponse::new(self.function_code(), code))
    }

    fn apply(&self, image: &ProcessImage) -> ModbusResult<Response> {
        match self {
            Request::ReadCoils(read) => {
                check_quantity(read.quantity, MAX_READ_BITS)?;
                let tables = image.read()?;
                let coils = tables.coil_range(read.address, read.quantity)?;
                let bits: Vec<bool> = coils.iter().map(DigitalOut::get).collect();
                Ok(Response::ReadCoils(BitVector::from_bools(&bits)))
            }
            Request::ReadDiscreteInputs(read) => {
                check_quantity(read.quantity, MAX_READ_BITS)?;
                let tables = image.read()?;
                let inputs = tables.digital_input_range(read.address, read.quantity)?;
                let bits: Vec<bool> = inputs.iter().map(DigitalIn::get).collect();
                Ok(Response::ReadDiscreteInputs(BitVector::from_bools(&bits)))
            }
            Request::ReadHoldingRegisters(read) => {
                check_quantity(read.quantity, MAX_READ_REGISTERS)?;
                let tables = image.read()?;
                let registers = tables.holding_register_range(read.address, read.quantity)?;
                Ok(Response::ReadHoldingRegisters(
                    registers.iter().map(Register::get).collect(),
                ))
            }
            Request::ReadInputRegisters(read) => {
                check_quantity(read.quantity, MAX_READ_REGISTERS)?;
                let tables = image.read()?;
                let registers = tables.input_register_range(read.address, read.quantity)?;
                Ok(Response::ReadInputRegisters(
                    registers.iter().map(InputRegister::get).collect(),
                ))
            }
            Request::WriteSingleCoil(write) => {
                let mut tables = image.write()?;
                tables.coil_range_mut(write.address, 1)?[0].set(write.value);
                Ok(Response::WriteSingleCoil {
                    address: write.address,
                    value: write.value,
                })
            }
            Request::WriteSingleRegister(write) => {
                let mut tables = image.write()?;
                tables.holding_register_range_mut(write.address, 1)?[0].set(write.value);
                Ok(Response::WriteSingleRegister {
                    address: write.address,
                    value: write.value,
                })
            }
            Request::WriteMultipleCoils(write) => {
                let quantity = checked_len(write.coils.size(), MAX_WRITE_BITS)?;
                let mut tables = image.write()?;
                let coils = tables.coil_range_mut(write.address, quantity)?;
                for (coil, value) in coils.iter_mut().zip(write.coils.iter()) {
                    coil.set(value);
                }
                Ok(Response::WriteMultipleCoils {
                    address: write.address,
                    quantity,
                })
            }
            Request::WriteMultipleRegisters(write) => {
                let quantity = checked_len(write.values.len(), MAX_WRITE_REGISTERS)?;
                let mut tables = image.write()?;
                let registers = tables.holding_register_range_mut(write.address, quantity)?;
                for (register, &value) in registers.iter_mut().zip(&write.values) {
                    register.set(value);
                }
                Ok(Response::WriteMultipleRegisters {
                    address: write.address,
                    quantity,
                })
            }
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::ReadCoils(read)
            | Request::ReadDiscreteInputs(read)
            | Request::ReadHoldingRegisters(read)
            | Request::ReadInputRegisters(read) => write!(
                f,
                "{}, Address: {}, Quantity: {}",
                self.function(),
                read.address,
                read.quantity
            ),
            Request::WriteSingleCoil(write) => write!(
                f,
                "{}, Address: {}, Value: {}",
                self.function(),
                write.address,
                if write.value { "ON" } else { "OFF" }
            ),
            Request::WriteSingleRegister(write) => write!(
                f,
                "{}, Address: {}, Value: {} (0x{:04X})",
                self.function(),
                write.address,
                write.value,
                write.value
            ),
            Request::WriteMultipleCoils(write) => write!(
                f,
                "{}, Address: {}, Quantity: {}",
                self.function(),
                write.address,
                write.coils.size()
            ),
            Request::WriteMultipleRegisters(write) => write!(
                f,
                "{}, Address: {}, Quantity: {}",
                self.function(),
                write.address,
                write.values.len()
            ),
        }
    }
}

/// Exception code a failed request application maps to
pub fn exception_for(error: &ModbusError) -> ModbusException {
    match error {
        ModbusError::InvalidAddress { .. } | ModbusError::IndexOutOfRange { .. } => {
            ModbusException::IllegalDataAddress
        }
        ModbusError::InvalidData { .. } => ModbusException::IllegalDataValue,
        ModbusError::InvalidFunction { .. } => ModbusException::IllegalFunction,
        _ => ModbusException::ServerDeviceFailure,
    }
}

fn expect_len(function: ModbusFunction, payload: &[u8], expected: usize) -> ModbusResult<()> {
    if payload.len() != expected {
        return Err(ModbusError::frame(format!(
            "{}: expected {} payload bytes, got {}",
            function,
            expected,
            payload.len()
        )));
    }
    Ok(())
}

fn check_quantity(quantity: u16, max: u16) -> ModbusResult<()> {
    if quantity == 0 || quantity > max {
        return Err(ModbusError::invalid_data(format!(
            "Quantity {} outside 1..={}",
            quantity, max
        )));
    }
    Ok(())
}

fn checked_len(len: usize, max: u16) -> ModbusResult<u16> {
    let quantity = u16::try_from(len)
        .map_err(|_| ModbusError::invalid_data(format!("Quantity {} outside 1..={}", len, max)))?;
    check_quantity(quantity, max)?;
    Ok(quantity)
}

/// A request together with its addressing header
///
/// Built once and never mutated: the engine derives a copy with the assigned
/// transaction id, so the header and payload that were validated are the
/// ones that get transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestAdu {
    header: Header,
    request: Request,
}

impl RequestAdu {
    /// Request addressed to `unit_id`, transaction id still unassigned
    pub fn new(unit_id: UnitId, request: Request) -> Self {
        Self {
            header: Header::new(unit_id),
            request,
        }
    }

    pub fn from_parts(header: Header, request: Request) -> Self {
        Self { header, request }
    }

    /// Copy of this ADU carrying the given transaction id
    pub fn with_transaction_id(&self, transaction_id: u16) -> Self {
        Self {
            header: self.header.with_transaction_id(transaction_id),
            request: self.request.clone(),
        }
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

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Decode a framed request
    pub fn decode(frame: &Frame) -> ModbusResult<Self> {
        Ok(Self {
            header: frame.header,
            request: Request::decode(frame.function_code, &frame.data)?,
        })
    }

    /// Frame ready for a transport
    pub fn to_frame(&self) -> Frame {
        Frame::new(self.header, self.request.function_code(), self.request.encode())
    }

    /// Answer this request from a process image, keeping the header
    pub fn build_response(&self, image: &ProcessImage) -> ResponseAdu {
        ResponseAdu::new(self.header, self.request.build_response(image))
    }

    /// Exception answer to this request, keeping the header
    pub fn build_exception_response(&self, code: ModbusException) -> ResponseAdu {
        ResponseAdu::new(self.header, self.request.exception(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_requests() -> Vec<Request> {
        vec![
            Request::read_coils(0, 1),
            Request::read_discrete_inputs(0xFFFF, 2000),
            Request::read_holding_registers(100, 125),
            Request::read_input_registers(7, 0),
            Request::write_single_coil(3, true),
            Request::write_single_coil(4, false),
            Request::write_single_register(9, 0xFFFF),
            Request::write_multiple_coils(5, &[]),
            Request::write_multiple_coils(5, &[true]),
            Request::write_multiple_coils(5, &[true, false, true, true, false, false, true, true]),
            Request::write_multiple_coils(5, &[true; 9]),
            Request::write_multiple_coils(0, &[true; 1968]),
            Request::write_multiple_registers(1, &[]),
            Request::write_multiple_registers(1, &[0x1234, 0x8000, 0]),
        ]
    }

    #[test]
    fn test_request_round_trip() {
        for request in all_requests() {
            let payload = request.encode();
            let decoded = Request::decode(request.function_code(), &payload).unwrap();
            assert_eq!(decoded, request, "round trip of {}", request);
        }
    }

    #[test]
    fn test_write_multiple_coils_layout() {
        let request = Request::write_multiple_coils(19, &[true, false, true, true, false, false, true, true, true, false]);
        assert_eq!(
            request.encode(),
            vec![0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]
        );
    }

    #[test]
    fn test_write_single_coil_layout() {
        assert_eq!(Request::write_single_coil(0xAC, true).encode(), vec![0x00, 0xAC, 0xFF, 0x00]);
        assert!(matches!(
            Request::decode(0x05, &[0x00, 0xAC, 0x12, 0x34]),
            Err(ModbusError::InvalidData { .. })
        ));
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            Request::decode(0x2B, &[0x0E, 0x01, 0x00]),
            Err(ModbusError::InvalidFunction { code: 0x2B })
        ));
        // truncated
        assert!(matches!(Request::decode(0x03, &[0x00, 0x01, 0x00]), Err(ModbusError::Frame { .. })));
        // trailing garbage
        assert!(matches!(
            Request::decode(0x03, &[0x00, 0x01, 0x00, 0x02, 0x00]),
            Err(ModbusError::Frame { .. })
        ));
        // byte count disagrees with the coil count
        assert!(matches!(
            Request::decode(0x0F, &[0x00, 0x00, 0x00, 0x09, 0x01, 0xFF]),
            Err(ModbusError::Frame { .. })
        ));
        // byte count right, data missing
        assert!(matches!(
            Request::decode(0x0F, &[0x00, 0x00, 0x00, 0x09, 0x02, 0xFF]),
            Err(ModbusError::Frame { .. })
        ));
        assert!(matches!(
            Request::decode(0x10, &[0x00, 0x00, 0x00, 0x02, 0x03, 0x00, 0x01, 0x00]),
            Err(ModbusError::Frame { .. })
        ));
    }

    #[test]
    fn test_write_then_read_coils() {
        let image = ProcessImage::new(0, 16, 0, 0);

        let write = Request::write_multiple_coils(5, &[true, false, true]);
        assert_eq!(
            write.build_response(&image),
            Response::WriteMultipleCoils { address: 5, quantity: 3 }
        );

        let read = Request::read_coils(5, 3);
        match read.build_response(&image) {
            Response::ReadCoils(bits) => assert_eq!(bits.to_vec(), vec![true, false, true]),
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(image.get_coils(4, 5).unwrap(), vec![false, true, false, true, false]);
    }

    #[test]
    fn test_out_of_range_read_is_illegal_data_address() {
        let image = ProcessImage::new(0, 0, 0, 10);
        let response = Request::read_holding_registers(100, 5).build_response(&image);

        assert_eq!(response.function_code(), 0x83);
        match response {
            Response::Exception(exception) => {
                assert_eq!(exception.code, ModbusException::IllegalDataAddress)
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_out_of_range_write_leaves_image_untouched() {
        let image = ProcessImage::new(0, 8, 0, 4);

        let response = Request::write_multiple_coils(6, &[true, true, true]).build_response(&image);
        assert_eq!(
            response,
            Response::Exception(ExceptionResponse::new(0x0F, ModbusException::IllegalDataAddress))
        );
        assert_eq!(image.get_coils(0, 8).unwrap(), vec![false; 8]);

        let response = Request::write_multiple_registers(3, &[1, 2]).build_response(&image);
        assert_eq!(response.function_code(), 0x90);
        assert_eq!(image.get_holding_registers(0, 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn test_quantity_limits_are_illegal_data_value() {
        let image = ProcessImage::new(4000, 4000, 400, 400);

        for request in [
            Request::read_coils(0, 0),
            Request::read_discrete_inputs(0, 2001),
            Request::read_input_registers(0, 126),
            Request::write_multiple_coils(0, &[]),
            Request::write_multiple_registers(0, &[0; 124]),
        ] {
            match request.build_response(&image) {
                Response::Exception(exception) => {
                    assert_eq!(exception.code, ModbusException::IllegalDataValue, "{}", request)
                }
                other => panic!("unexpected response {:?} to {}", other, request),
            }
        }
    }

    #[test]
    fn test_reads_echo_data_and_writes_echo_metadata() {
        let image = ProcessImage::builder()
            .digital_input_values(&[false, true, true])
            .coils(4)
            .input_register_values(&[11, 12])
            .holding_registers(4)
            .build();

        assert_eq!(
            Request::read_input_registers(0, 2).build_response(&image),
            Response::ReadInputRegisters(vec![11, 12])
        );
        assert_eq!(
            Request::read_discrete_inputs(1, 2).build_response(&image),
            Response::ReadDiscreteInputs(BitVector::from_bools(&[true, true]))
        );
        assert_eq!(
            Request::write_single_register(2, 0xBEEF).build_response(&image),
            Response::WriteSingleRegister { address: 2, value: 0xBEEF }
        );
        assert_eq!(
            Request::write_single_coil(3, true).build_response(&image),
            Response::WriteSingleCoil { address: 3, value: true }
        );
        assert_eq!(
            Request::write_multiple_registers(0, &[1, 2]).build_response(&image),
            Response::WriteMultipleRegisters { address: 0, quantity: 2 }
        );
        assert_eq!(image.get_holding_registers(0, 4).unwrap(), vec![1, 2, 0xBEEF, 0]);
        assert_eq!(image.get_coils(3, 1).unwrap(), vec![true]);
    }

    #[test]
    fn test_adu_keeps_header() {
        let image = ProcessImage::new(0, 0, 0, 10);
        let frame = Frame::new(
            Header {
                transaction_id: 0x4242,
                protocol_id: 0,
                unit_id: 17,
            },
            0x03,
            vec![0x00, 0x64, 0x00, 0x05],
        );
        let adu = RequestAdu::decode(&frame).unwrap();

        let response = adu.build_response(&image);
        assert_eq!(response.header(), adu.header());
        assert_eq!(response.to_frame().function_code, 0x83);
        assert_eq!(response.to_frame().data, vec![0x02]);

        let exception = adu.build_exception_response(ModbusException::IllegalFunction);
        assert_eq!(exception.header(), adu.header());
        assert_eq!(exception.to_frame().data, vec![0x01]);
    }

    #[test]
    fn test_with_transaction_id_copies() {
        let adu = RequestAdu::new(3, Request::read_coils(0, 8));
        let assigned = adu.with_transaction_id(77);
        assert_eq!(adu.transaction_id(), 0);
        assert_eq!(assigned.transaction_id(), 77);
        assert_eq!(assigned.unit_id(), 3);
        assert_eq!(assigned.request(), adu.request());
    }
}
