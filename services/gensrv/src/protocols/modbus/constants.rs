//! Modbus RTU constants
//!
//! Limits follow Modbus Application Protocol V1.1b3: an RTU ADU is
//! at most 256 bytes, which leaves 253 bytes for the PDU.

/// Read Holding Registers
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// CRC-16/MODBUS reflected polynomial
pub const CRC16_POLY: u16 = 0xA001;

/// CRC-16/MODBUS initial accumulator value
pub const CRC16_INIT: u16 = 0xFFFF;

/// CRC length on the wire
pub const CRC_LEN: usize = 2;

/// Request frame: addr(1) + fc(1) + start(2) + count(2) + crc(2)
pub const READ_REQUEST_LEN: usize = 8;

/// Smallest frame the codec accepts: addr + fc + (byte count | exception code) + crc
pub const MIN_RESPONSE_LEN: usize = 5;

/// Exception frame: addr + fc|0x80 + code + crc
pub const EXCEPTION_RESPONSE_LEN: usize = 5;

/// Maximum PDU size inherited from the RS485 ADU limit (256 - addr - crc)
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum registers per FC03/FC04 request
///
/// Response PDU is fc(1) + byte count(1) + N*2 <= 253, so N <= 125.
pub const MAX_READ_REGISTERS: u16 = 125;

/// Largest slave address addressable on a serial line
pub const MAX_SLAVE_ADDRESS: u8 = 247;

/// Bytes the synchronizer may buffer while hunting for a frame marker
pub const DEFAULT_SYNC_BUFFER_LIMIT: usize = 100;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_limit_fits_pdu() {
        let read_pdu_size = 1 + 1 + (MAX_READ_REGISTERS as usize * 2);
        assert!(read_pdu_size <= MAX_PDU_SIZE);
        assert_eq!(MAX_READ_REGISTERS, 125);
    }

    #[test]
    fn test_exception_flag_marks_fc03() {
        assert_eq!(FC_READ_HOLDING_REGISTERS | EXCEPTION_FLAG, 0x83);
    }
}
