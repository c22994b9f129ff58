//! RTU frame codec
//!
//! Request:   `[addr][fc][start hi][start lo][count hi][count lo][crc lo][crc hi]`
//! Response:  `[addr][fc][byte count][data...][crc lo][crc hi]`
//! Exception: `[addr][fc | 0x80][exception code][crc lo][crc hi]`

use bytes::{BufMut, BytesMut};
use tracing::warn;

use super::constants::{
    EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS, MAX_READ_REGISTERS,
    MIN_RESPONSE_LEN, READ_REQUEST_LEN,
};
use super::crc;
use crate::error::ModbusError;

/// One register-block read: who to ask, which function, which range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub slave: u8,
    pub function: u8,
    pub start: u16,
    pub count: u16,
}

impl ReadRequest {
    /// Read holding registers (FC03)
    pub fn holding(slave: u8, start: u16, count: u16) -> Self {
        Self {
            slave,
            function: FC_READ_HOLDING_REGISTERS,
            start,
            count,
        }
    }

    /// Data bytes a complete response carries
    pub fn expected_data_len(&self) -> usize {
        self.count as usize * 2
    }

    /// Encode this request into an RTU frame
    pub fn encode(&self) -> Result<Vec<u8>, ModbusError> {
        encode_request(self.slave, self.function, self.start, self.count)
    }
}

/// Build a read request frame with its CRC appended little-endian
pub fn encode_request(
    slave: u8,
    function: u8,
    start: u16,
    count: u16,
) -> Result<Vec<u8>, ModbusError> {
    if !matches!(function, FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS) {
        return Err(ModbusError::InvalidRequest(format!(
            "function code 0x{function:02X} is not a register read"
        )));
    }
    if count == 0 || count > MAX_READ_REGISTERS {
        return Err(ModbusError::InvalidRequest(format!(
            "register count {count} outside 1..={MAX_READ_REGISTERS}"
        )));
    }

    let mut buf = BytesMut::with_capacity(READ_REQUEST_LEN);
    buf.put_u8(slave);
    buf.put_u8(function);
    buf.put_u16(start);
    buf.put_u16(count);

    let mut frame = buf.to_vec();
    crc::append(&mut frame);
    Ok(frame)
}

/// Validate a response frame against its request and extract the registers.
///
/// The CRC is checked before anything else is interpreted. A byte count that
/// disagrees with the request is only warned about: registers are taken from
/// `min(declared byte count, bytes present)` so a short but CRC-valid frame
/// still yields its complete leading registers.
pub fn decode_response(frame: &[u8], request: &ReadRequest) -> Result<Vec<u16>, ModbusError> {
    if frame.len() < MIN_RESPONSE_LEN {
        return Err(ModbusError::FrameTooShort(frame.len()));
    }

    if let Err((expected, received)) = crc::verify(frame) {
        return Err(ModbusError::CrcMismatch { expected, received });
    }

    let address = frame[0];
    let function = frame[1];

    if function & EXCEPTION_FLAG != 0 {
        return Err(ModbusError::FunctionException {
            function: function & !EXCEPTION_FLAG,
            code: frame[2],
        });
    }

    if address != request.slave {
        return Err(ModbusError::UnexpectedResponse(format!(
            "slave {address} answered, expected {}",
            request.slave
        )));
    }
    if function != request.function {
        return Err(ModbusError::UnexpectedResponse(format!(
            "function 0x{function:02X} answered, expected 0x{:02X}",
            request.function
        )));
    }

    let declared = frame[2] as usize;
    let expected = request.expected_data_len();
    if declared != expected {
        warn!(
            "Byte count mismatch: declared {} bytes, requested {} registers ({} bytes)",
            declared, request.count, expected
        );
    }

    // addr + fc + byte count ahead of the data, crc behind it
    let available = frame.len() - MIN_RESPONSE_LEN;
    let span = declared.min(available);
    let data = &frame[3..3 + span];

    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Build a well-formed response frame (used by simulators and tests)
pub fn build_response(slave: u8, function: u8, registers: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MIN_RESPONSE_LEN + registers.len() * 2);
    frame.push(slave);
    frame.push(function);
    frame.push((registers.len() * 2) as u8);
    for value in registers {
        frame.extend_from_slice(&value.to_be_bytes());
    }
    crc::append(&mut frame);
    frame
}

/// Build an exception response frame
pub fn build_exception(slave: u8, function: u8, code: u8) -> Vec<u8> {
    let mut frame = vec![slave, function | EXCEPTION_FLAG, code];
    crc::append(&mut frame);
    frame
}

/// Parse an inbound request frame (the device side of the exchange)
pub fn parse_request(frame: &[u8]) -> Result<ReadRequest, ModbusError> {
    if frame.len() != READ_REQUEST_LEN {
        return Err(ModbusError::FrameTooShort(frame.len()));
    }
    if let Err((expected, received)) = crc::verify(frame) {
        return Err(ModbusError::CrcMismatch { expected, received });
    }
    Ok(ReadRequest {
        slave: frame[0],
        function: frame[1],
        start: u16::from_be_bytes([frame[2], frame[3]]),
        count: u16::from_be_bytes([frame[4], frame[5]]),
    })
}
