//! Response decoding

use super::request::{DiagnosticRequest, Pid, RequestKind};
use super::service;
use crate::error::ObdError;

/// A validated reply to one [`DiagnosticRequest`]
///
/// `payload` holds the bytes after the echoed header. For text replies
/// (adapter commands, battery voltage) it is empty and `text` carries the
/// cleaned reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticResponse {
    pub kind: RequestKind,
    pub payload: Vec<u8>,
    pub text: String,
}

impl DiagnosticResponse {
    /// Validate a raw adapter reply against the request that produced it
    pub fn parse(request: &DiagnosticRequest, raw: &str) -> Result<Self, ObdError> {
        let text = clean(raw);

        if text.is_empty() {
            return Err(ObdError::InvalidResponse("empty response".to_string()));
        }
        let upper = text.to_ascii_uppercase();
        if upper.contains("NO DATA") {
            return Err(ObdError::NoData);
        }
        if text == "?" {
            return Err(ObdError::InvalidResponse(format!(
                "adapter did not understand '{}'",
                request.command()
            )));
        }
        if upper.contains("UNABLE TO CONNECT") || upper.contains("CAN ERROR") {
            return Err(ObdError::InvalidResponse(text));
        }

        if request.expects_text() {
            return Ok(Self {
                kind: request.kind(),
                payload: Vec::new(),
                text,
            });
        }

        let bytes = parse_hex(&text)?;

        if bytes.first() == Some(&service::NEGATIVE_RESPONSE) {
            return match bytes.as_slice() {
                [_, sid, nrc, ..] => Err(ObdError::Rejected {
                    service: *sid,
                    nrc: *nrc,
                }),
                _ => Err(ObdError::InvalidResponse(format!(
                    "truncated negative response '{}'",
                    text
                ))),
            };
        }

        let header = request.expected_header();
        if !bytes.starts_with(&header) {
            return Err(ObdError::InvalidResponse(format!(
                "expected header {} for '{}', got '{}'",
                super::format_hex(&header),
                request.command(),
                text
            )));
        }

        Ok(Self {
            kind: request.kind(),
            payload: bytes[header.len()..].to_vec(),
            text,
        })
    }

    fn require(&self, count: usize) -> Result<&[u8], ObdError> {
        if self.payload.len() < count {
            return Err(ObdError::InvalidResponse(format!(
                "expected {} data bytes, got {}",
                count,
                self.payload.len()
            )));
        }
        Ok(&self.payload[..count])
    }
}

/// Remove prompt, echo noise and surrounding whitespace
fn clean(raw: &str) -> String {
    raw.replace('>', " ")
        .replace("SEARCHING...", " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse whitespace-separated (or packed) hex into bytes
fn parse_hex(text: &str) -> Result<Vec<u8>, ObdError> {
    let packed: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if packed.len() % 2 != 0 {
        return Err(ObdError::InvalidResponse(format!(
            "odd number of hex digits in '{}'",
            text
        )));
    }
    hex::decode(&packed)
        .map_err(|e| ObdError::InvalidResponse(format!("malformed hex '{}': {}", text, e)))
}

/// Engine speed: `((A * 256) + B) / 4` rpm
pub fn decode_rpm(response: &DiagnosticResponse) -> Result<f64, ObdError> {
    let data = response.require(2)?;
    Ok(((data[0] as f64) * 256.0 + data[1] as f64) / 4.0)
}

/// Vehicle speed: `A` km/h
pub fn decode_speed(response: &DiagnosticResponse) -> Result<u32, ObdError> {
    let data = response.require(1)?;
    Ok(data[0] as u32)
}

/// Throttle position: `A * 100 / 255` percent
pub fn decode_throttle(response: &DiagnosticResponse) -> Result<f64, ObdError> {
    let data = response.require(1)?;
    Ok(data[0] as f64 * 100.0 / 255.0)
}

/// Coolant temperature: `A - 40` degrees Celsius
pub fn decode_coolant(response: &DiagnosticResponse) -> Result<i16, ObdError> {
    let data = response.require(1)?;
    Ok(data[0] as i16 - 40)
}

/// Battery voltage as printed by the adapter, e.g. `12.6V`
pub fn decode_voltage(response: &DiagnosticResponse) -> Result<f64, ObdError> {
    let trimmed = response.text.trim().trim_end_matches(['V', 'v']).trim();
    trimmed
        .parse::<f64>()
        .map_err(|_| ObdError::InvalidResponse(format!("not a voltage: '{}'", response.text)))
}

/// Vehicle identification number
///
/// Expects the whole reply in one frame. A leading frame-count byte is
/// skipped and null padding is dropped. Replies split over several ISO-TP
/// frames with per-line indices are not reassembled.
pub fn decode_vin(response: &DiagnosticResponse) -> Result<String, ObdError> {
    if response.kind != RequestKind::Read(Pid::Vin) {
        return Err(ObdError::InvalidResponse(
            "response is not an identification reply".to_string(),
        ));
    }

    let mut data = response.payload.as_slice();
    if let Some((&first, rest)) = data.split_first() {
        if first > 0 && first < 0x20 {
            data = rest;
        }
    }

    let vin: String = data
        .iter()
        .filter(|&&b| b != 0)
        .map(|&b| b as char)
        .collect();

    if vin.is_empty() || !vin.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ObdError::InvalidResponse(format!(
            "not a VIN: '{}'",
            response.text
        )));
    }
    Ok(vin)
}

/// Memory block returned by ReadMemory, checked against the requested length
pub fn decode_memory(response: &DiagnosticResponse) -> Result<Vec<u8>, ObdError> {
    match response.kind {
        RequestKind::ReadMemory { length, .. } => {
            if response.payload.len() != length as usize {
                return Err(ObdError::InvalidResponse(format!(
                    "requested {} bytes, received {}",
                    length,
                    response.payload.len()
                )));
            }
            Ok(response.payload.clone())
        }
        _ => Err(ObdError::InvalidResponse(
            "response is not a memory read".to_string(),
        )),
    }
}

/// Big-endian CRC-32 reported by the checksum routine
pub fn decode_checksum(response: &DiagnosticResponse) -> Result<u32, ObdError> {
    let data = response.require(4)?;
    Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

/// Acknowledgement of a mode 04 request; the reply carries no data
pub fn decode_clear_dtcs(response: &DiagnosticResponse) -> Result<(), ObdError> {
    match response.kind {
        RequestKind::ClearDtcs => Ok(()),
        _ => Err(ObdError::InvalidResponse(
            "response is not a trouble code clear".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(request: DiagnosticRequest, raw: &str) -> Result<DiagnosticResponse, ObdError> {
        DiagnosticResponse::parse(&request, raw)
    }

    #[test]
    fn test_rpm_formula() {
        let response = parse(DiagnosticRequest::read(Pid::EngineRpm), "41 0C 1F 40").unwrap();
        assert_eq!(decode_rpm(&response).unwrap(), 2064.0);
    }

    #[test]
    fn test_speed_and_throttle_formulas() {
        let speed = parse(DiagnosticRequest::read(Pid::VehicleSpeed), "41 0D 3C").unwrap();
        assert_eq!(decode_speed(&speed).unwrap(), 60);

        let throttle = parse(DiagnosticRequest::read(Pid::ThrottlePosition), "41 11 FF").unwrap();
        assert_eq!(decode_throttle(&throttle).unwrap(), 100.0);

        let throttle = parse(DiagnosticRequest::read(Pid::ThrottlePosition), "41 11 33").unwrap();
        assert_eq!(decode_throttle(&throttle).unwrap(), 20.0);
    }

    #[test]
    fn test_coolant_offset() {
        let response =
            parse(DiagnosticRequest::read(Pid::CoolantTemperature), "41 05 82").unwrap();
        assert_eq!(decode_coolant(&response).unwrap(), 90);
    }

    #[test]
    fn test_prompt_and_packed_hex_are_accepted() {
        let response = parse(DiagnosticRequest::read(Pid::EngineRpm), "410C1F40\r\r>").unwrap();
        assert_eq!(response.payload, vec![0x1F, 0x40]);

        let response =
            parse(DiagnosticRequest::read(Pid::EngineRpm), "SEARCHING...\n41 0C 1F 40 >").unwrap();
        assert_eq!(decode_rpm(&response).unwrap(), 2064.0);
    }

    #[test]
    fn test_no_data() {
        let err = parse(DiagnosticRequest::read(Pid::EngineRpm), "NO DATA").unwrap_err();
        assert_eq!(err, ObdError::NoData);
    }

    #[test]
    fn test_header_mismatch_is_invalid() {
        let err = parse(DiagnosticRequest::read(Pid::EngineRpm), "41 0D 3C").unwrap_err();
        assert!(matches!(err, ObdError::InvalidResponse(_)));
    }

    #[test]
    fn test_malformed_hex_is_invalid() {
        let err = parse(DiagnosticRequest::read(Pid::EngineRpm), "41 0C 1F 4").unwrap_err();
        assert!(matches!(err, ObdError::InvalidResponse(_)));

        let err = parse(DiagnosticRequest::read(Pid::EngineRpm), "41 0C ZZ").unwrap_err();
        assert!(matches!(err, ObdError::InvalidResponse(_)));

        let err = parse(DiagnosticRequest::read(Pid::EngineRpm), "?").unwrap_err();
        assert!(matches!(err, ObdError::InvalidResponse(_)));
    }

    #[test]
    fn test_truncated_payload_is_invalid() {
        let response = parse(DiagnosticRequest::read(Pid::EngineRpm), "41 0C 1F").unwrap();
        assert!(matches!(
            decode_rpm(&response),
            Err(ObdError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_negative_response() {
        let err = parse(DiagnosticRequest::erase_memory(), "7F 31 22").unwrap_err();
        assert_eq!(
            err,
            ObdError::Rejected {
                service: 0x31,
                nrc: 0x22
            }
        );
    }

    #[test]
    fn test_vin_with_frame_count_prefix() {
        let response = parse(
            DiagnosticRequest::read(Pid::Vin),
            "49 02 01 31 48 47 43 4D 38 32 36 33 33 41 30 30 34 33 35 32",
        )
        .unwrap();
        assert_eq!(decode_vin(&response).unwrap(), "1HGCM82633A004352");
    }

    #[test]
    fn test_vin_skips_null_padding() {
        let response = parse(
            DiagnosticRequest::read(Pid::Vin),
            "49 02 00 00 57 30 4C 30 30 30 30 34 33 4D 42 35 34 31 33 32 36",
        )
        .unwrap();
        assert_eq!(decode_vin(&response).unwrap(), "W0L000043MB541326");
    }

    #[test]
    fn test_voltage_text() {
        let response = parse(DiagnosticRequest::read(Pid::BatteryVoltage), "12.6V\r>").unwrap();
        assert_eq!(decode_voltage(&response).unwrap(), 12.6);

        let response = parse(DiagnosticRequest::read(Pid::BatteryVoltage), "OK").unwrap();
        assert!(decode_voltage(&response).is_err());
    }

    #[test]
    fn test_memory_length_is_checked() {
        let request = DiagnosticRequest::read_memory(0, 4);
        let response = parse(request.clone(), "63 01 02 03 04").unwrap();
        assert_eq!(decode_memory(&response).unwrap(), vec![1, 2, 3, 4]);

        let response = parse(request, "63 01 02").unwrap();
        assert!(decode_memory(&response).is_err());
    }

    #[test]
    fn test_checksum_reply() {
        let response = parse(
            DiagnosticRequest::checksum(0, 9),
            "71 01 FF 01 CB F4 39 26",
        )
        .unwrap();
        assert_eq!(decode_checksum(&response).unwrap(), 0xCBF4_3926);
    }

    #[test]
    fn test_clear_dtcs_acknowledgement() {
        let response = parse(DiagnosticRequest::clear_dtcs(), "44 \r\n>").unwrap();
        assert_eq!(decode_clear_dtcs(&response), Ok(()));

        assert_eq!(
            parse(DiagnosticRequest::clear_dtcs(), "7F 04 22").unwrap_err(),
            ObdError::Rejected {
                service: 0x04,
                nrc: 0x22
            }
        );

        let rpm = parse(DiagnosticRequest::read(Pid::EngineRpm), "41 0C 1A F8").unwrap();
        assert!(decode_clear_dtcs(&rpm).is_err());
    }
}
