//! Diagnostic protocol codec
//!
//! Translates typed requests into the ASCII hex command grammar spoken by
//! ELM327-style adapters and decodes their whitespace-separated hex replies.
//! The codec never touches an adapter; it works on strings and bytes only.

mod request;
mod response;

pub use request::{DiagnosticRequest, Pid, RequestKind};
pub use response::{
    decode_checksum, decode_clear_dtcs, decode_coolant, decode_memory, decode_rpm, decode_speed,
    decode_throttle, decode_vin, decode_voltage, DiagnosticResponse,
};

use crc::{Crc, CRC_32_ISO_HDLC};

/// CRC-32 used by the ECU checksum routine
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Checksum of a memory image as the ECU computes it
pub fn checksum(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Service identifiers used on the wire
pub mod service {
    /// Show current data (mode 01)
    pub const CURRENT_DATA: u8 = 0x01;
    /// Clear diagnostic trouble codes (mode 04)
    pub const CLEAR_DTCS: u8 = 0x04;
    /// Request vehicle information (mode 09)
    pub const VEHICLE_INFO: u8 = 0x09;
    pub const SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const READ_MEMORY: u8 = 0x23;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const TRANSFER_DATA: u8 = 0x36;
    /// Marker byte of a negative response
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;

    /// Positive response identifier for a request service
    pub const fn positive(sid: u8) -> u8 {
        sid + 0x40
    }
}

/// Routine identifiers run through RoutineControl
pub mod routine {
    pub const ERASE_MEMORY: u16 = 0xFF00;
    pub const CHECK_MEMORY: u16 = 0xFF01;
}

/// Negative response codes the ECU emits during programming
pub mod nrc {
    pub const CONDITIONS_NOT_CORRECT: u8 = 0x22;
    pub const REQUEST_OUT_OF_RANGE: u8 = 0x31;
    pub const GENERAL_PROGRAMMING_FAILURE: u8 = 0x72;
    pub const WRONG_BLOCK_SEQUENCE_COUNTER: u8 = 0x73;
}

/// Format bytes the way adapters print them: `"41 0C 1F 40"`
pub fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_matches_crc32_check_value() {
        assert_eq!(checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[0x41, 0x0C, 0x1F, 0x40]), "41 0C 1F 40");
        assert_eq!(format_hex(&[]), "");
    }
}
