//! Request encoding

use std::fmt;

use super::{routine, service};

/// Parameter IDs for typed reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pid {
    /// Vehicle identification number (mode 09, PID 02)
    Vin,
    EngineRpm,
    VehicleSpeed,
    ThrottlePosition,
    CoolantTemperature,
    /// Battery voltage measured by the adapter itself (`ATRV`)
    BatteryVoltage,
}

impl Pid {
    /// Wire command for this parameter
    pub fn command(&self) -> &'static str {
        match self {
            Pid::Vin => "0902",
            Pid::EngineRpm => "010C",
            Pid::VehicleSpeed => "010D",
            Pid::ThrottlePosition => "0111",
            Pid::CoolantTemperature => "0105",
            Pid::BatteryVoltage => "ATRV",
        }
    }

    /// `(mode, pid)` bytes echoed in the response header, if the reply is hex
    pub fn header(&self) -> Option<(u8, u8)> {
        match self {
            Pid::Vin => Some((service::VEHICLE_INFO, 0x02)),
            Pid::EngineRpm => Some((service::CURRENT_DATA, 0x0C)),
            Pid::VehicleSpeed => Some((service::CURRENT_DATA, 0x0D)),
            Pid::ThrottlePosition => Some((service::CURRENT_DATA, 0x11)),
            Pid::CoolantTemperature => Some((service::CURRENT_DATA, 0x05)),
            Pid::BatteryVoltage => None,
        }
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Pid::Vin => "vin",
            Pid::EngineRpm => "engine_rpm",
            Pid::VehicleSpeed => "vehicle_speed",
            Pid::ThrottlePosition => "throttle_position",
            Pid::CoolantTemperature => "coolant_temperature",
            Pid::BatteryVoltage => "battery_voltage",
        };
        f.write_str(name)
    }
}

/// What a request asks for; drives response validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read(Pid),
    /// Adapter `AT` configuration command; replies are free text
    AdapterSetup,
    EnterProgramming,
    ExitProgramming,
    ReadMemory { address: u32, length: u16 },
    EraseMemory,
    TransferData { sequence: u8 },
    Checksum,
    ClearDtcs,
}

/// A diagnostic command ready to be sent
///
/// Only constructible through the codec constructors below, so every request
/// on the wire is well formed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticRequest {
    command: String,
    kind: RequestKind,
}

impl DiagnosticRequest {
    pub fn read(pid: Pid) -> Self {
        Self {
            command: pid.command().to_string(),
            kind: RequestKind::Read(pid),
        }
    }

    /// Adapter configuration command such as `ATZ` or `ATE0`
    pub fn adapter_setup(command: &str) -> Self {
        Self {
            command: command.trim().to_ascii_uppercase(),
            kind: RequestKind::AdapterSetup,
        }
    }

    /// DiagnosticSessionControl, programming session
    pub fn enter_programming() -> Self {
        Self {
            command: format!("{:02X}02", service::SESSION_CONTROL),
            kind: RequestKind::EnterProgramming,
        }
    }

    /// ECUReset, hard reset back into the application
    pub fn exit_programming() -> Self {
        Self {
            command: format!("{:02X}01", service::ECU_RESET),
            kind: RequestKind::ExitProgramming,
        }
    }

    pub fn read_memory(address: u32, length: u16) -> Self {
        Self {
            command: format!("{:02X}{:08X}{:04X}", service::READ_MEMORY, address, length),
            kind: RequestKind::ReadMemory { address, length },
        }
    }

    pub fn erase_memory() -> Self {
        Self {
            command: format!(
                "{:02X}01{:04X}",
                service::ROUTINE_CONTROL,
                routine::ERASE_MEMORY
            ),
            kind: RequestKind::EraseMemory,
        }
    }

    /// One block of a memory download; `sequence` starts at 1 and wraps
    pub fn transfer_data(sequence: u8, data: &[u8]) -> Self {
        Self {
            command: format!(
                "{:02X}{:02X}{}",
                service::TRANSFER_DATA,
                sequence,
                hex::encode_upper(data)
            ),
            kind: RequestKind::TransferData { sequence },
        }
    }

    /// CRC-32 over `length` bytes starting at `address`
    pub fn checksum(address: u32, length: u32) -> Self {
        Self {
            command: format!(
                "{:02X}01{:04X}{:08X}{:08X}",
                service::ROUTINE_CONTROL,
                routine::CHECK_MEMORY,
                address,
                length
            ),
            kind: RequestKind::Checksum,
        }
    }

    /// Clear stored trouble codes and freeze frames (mode 04)
    pub fn clear_dtcs() -> Self {
        Self {
            command: format!("{:02X}", service::CLEAR_DTCS),
            kind: RequestKind::ClearDtcs,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Header bytes a positive response must start with
    pub(crate) fn expected_header(&self) -> Vec<u8> {
        match self.kind {
            RequestKind::Read(pid) => match pid.header() {
                Some((mode, pid)) => vec![service::positive(mode), pid],
                None => Vec::new(),
            },
            RequestKind::AdapterSetup => Vec::new(),
            RequestKind::EnterProgramming => vec![service::positive(service::SESSION_CONTROL), 0x02],
            RequestKind::ExitProgramming => vec![service::positive(service::ECU_RESET), 0x01],
            RequestKind::ReadMemory { .. } => vec![service::positive(service::READ_MEMORY)],
            RequestKind::EraseMemory => {
                let [hi, lo] = routine::ERASE_MEMORY.to_be_bytes();
                vec![service::positive(service::ROUTINE_CONTROL), 0x01, hi, lo]
            }
            RequestKind::TransferData { sequence } => {
                vec![service::positive(service::TRANSFER_DATA), sequence]
            }
            RequestKind::Checksum => {
                let [hi, lo] = routine::CHECK_MEMORY.to_be_bytes();
                vec![service::positive(service::ROUTINE_CONTROL), 0x01, hi, lo]
            }
            RequestKind::ClearDtcs => vec![service::positive(service::CLEAR_DTCS)],
        }
    }

    /// Whether the reply is free text rather than hex bytes
    pub(crate) fn expects_text(&self) -> bool {
        matches!(
            self.kind,
            RequestKind::AdapterSetup | RequestKind::Read(Pid::BatteryVoltage)
        )
    }
}

impl fmt::Display for DiagnosticRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_reads_map_to_fixed_commands() {
        assert_eq!(DiagnosticRequest::read(Pid::Vin).command(), "0902");
        assert_eq!(DiagnosticRequest::read(Pid::EngineRpm).command(), "010C");
        assert_eq!(DiagnosticRequest::read(Pid::VehicleSpeed).command(), "010D");
        assert_eq!(DiagnosticRequest::read(Pid::ThrottlePosition).command(), "0111");
        assert_eq!(DiagnosticRequest::read(Pid::CoolantTemperature).command(), "0105");
        assert_eq!(DiagnosticRequest::read(Pid::BatteryVoltage).command(), "ATRV");
    }

    #[test]
    fn test_memory_commands() {
        assert_eq!(DiagnosticRequest::enter_programming().command(), "1002");
        assert_eq!(DiagnosticRequest::exit_programming().command(), "1101");
        assert_eq!(
            DiagnosticRequest::read_memory(0x0000_0080, 0x0080).command(),
            "23000000800080"
        );
        assert_eq!(DiagnosticRequest::erase_memory().command(), "3101FF00");
        assert_eq!(
            DiagnosticRequest::transfer_data(0x01, &[0xDE, 0xAD]).command(),
            "3601DEAD"
        );
        assert_eq!(
            DiagnosticRequest::checksum(0, 4096).command(),
            "3101FF010000000000001000"
        );
        assert_eq!(DiagnosticRequest::clear_dtcs().command(), "04");
        assert_eq!(DiagnosticRequest::clear_dtcs().expected_header(), vec![0x44]);
    }

    #[test]
    fn test_expected_headers() {
        assert_eq!(
            DiagnosticRequest::read(Pid::EngineRpm).expected_header(),
            vec![0x41, 0x0C]
        );
        assert_eq!(DiagnosticRequest::read(Pid::Vin).expected_header(), vec![0x49, 0x02]);
        assert_eq!(
            DiagnosticRequest::transfer_data(7, &[0x00]).expected_header(),
            vec![0x76, 0x07]
        );
        assert!(DiagnosticRequest::read(Pid::BatteryVoltage).expects_text());
    }
}
