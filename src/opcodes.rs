//! Binary opcode frame codec.
//! Pure functions for hex/base64 conversion and fixed-length frame assembly
//! with a trailing XOR checksum byte.

use crate::error::{GoveeError, Result};
use base64::{Engine as _, engine::general_purpose};

/// Fixed size of an assembled command frame in bytes.
pub const DEFAULT_FRAME_SIZE: usize = 20;

/// Opcode family of inbound status report frames.
pub const REPORT_OPCODE: u8 = 0xAA;

/// Accepted input forms for [`as_opcode`].
#[derive(Debug, Clone)]
pub enum OpcodeInput<'a> {
    /// Numeric opcode value
    Int(u32),
    /// Hex string, with or without a `0x` prefix
    Hex(&'a str),
}

impl<'a> From<u32> for OpcodeInput<'a> {
    fn from(value: u32) -> Self {
        OpcodeInput::Int(value)
    }
}

impl<'a> From<u8> for OpcodeInput<'a> {
    fn from(value: u8) -> Self {
        OpcodeInput::Int(u32::from(value))
    }
}

impl<'a> From<&'a str> for OpcodeInput<'a> {
    fn from(value: &'a str) -> Self {
        OpcodeInput::Hex(value)
    }
}

/// Strip whitespace and an optional `0x` prefix from a hex string.
fn normalize_hex(hex: &str) -> String {
    let text: String = hex.trim().split_whitespace().collect();
    let text = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .map(str::to_string)
        .unwrap_or(text);
    if text.len() % 2 == 1 {
        format!("0{}", text)
    } else {
        text
    }
}

/// Normalize an opcode from integer or string form to a canonical
/// `0x`-prefixed, even-length, uppercase hex string.
pub fn as_opcode<'a, T>(value: T) -> Result<String>
where
    T: Into<OpcodeInput<'a>>,
{
    let hex_part = match value.into() {
        OpcodeInput::Int(v) => format!("{:X}", v),
        OpcodeInput::Hex(text) => {
            let normalized = normalize_hex(text);
            if normalized.is_empty() {
                return Err(GoveeError::InvalidOpcode("empty string".into()));
            }
            if !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(GoveeError::InvalidOpcode(text.to_string()));
            }
            normalized.to_uppercase()
        }
    };
    let hex_part = if hex_part.len() % 2 == 1 {
        format!("0{}", hex_part)
    } else {
        hex_part
    };
    Ok(format!("0x{}", hex_part))
}

/// Decode a hex string (tolerating `0x` prefixes, whitespace, and odd
/// length) into raw bytes.
pub fn hex_to_bytes(hex: &str) -> Result<Vec<u8>> {
    Ok(hex::decode(normalize_hex(hex))?)
}

/// Convert hexadecimal payload text into base64 encoding.
pub fn hex_to_base64(hex: &str) -> Result<String> {
    Ok(general_purpose::STANDARD.encode(hex_to_bytes(hex)?))
}

/// Convert a base64-encoded payload back into uppercase hexadecimal text.
pub fn base64_to_hex(payload_b64: &str) -> Result<String> {
    let data = general_purpose::STANDARD.decode(payload_b64)?;
    Ok(hex::encode_upper(data))
}

/// Assemble a command frame with the default frame size and no extra payload.
///
/// See [`assemble_command_with`] for the full frame layout.
pub fn assemble_command(identifier: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    assemble_command_with(identifier, payload, &[], DEFAULT_FRAME_SIZE)
}

/// Assemble a fixed-length command frame.
///
/// Layout: `identifier | payload | extra_payload | zero padding` up to
/// `frame_size - 1` bytes, followed by one checksum byte equal to the XOR
/// of all preceding bytes. Fails with [`GoveeError::FrameTooLarge`] when the
/// combined data exceeds `frame_size - 1` bytes; frames are never silently
/// truncated.
pub fn assemble_command_with(
    identifier: &[u8],
    payload: &[u8],
    extra_payload: &[u8],
    frame_size: usize,
) -> Result<Vec<u8>> {
    let mut frame = Vec::with_capacity(frame_size);
    frame.extend_from_slice(identifier);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(extra_payload);

    if frame.len() >= frame_size {
        return Err(GoveeError::FrameTooLarge {
            got: frame.len(),
            max: frame_size.saturating_sub(1),
        });
    }

    frame.resize(frame_size - 1, 0x00);
    let checksum = frame.iter().fold(0u8, |acc, byte| acc ^ byte);
    frame.push(checksum);
    Ok(frame)
}

/// Assemble a frame and encode it for the short-range transport.
pub fn ble_command_to_base64(identifier: &[u8], payload: &[u8]) -> Result<String> {
    ble_command_to_base64_with(identifier, payload, &[], DEFAULT_FRAME_SIZE)
}

/// Assemble a frame with extra payload and a custom size, base64-encoded.
pub fn ble_command_to_base64_with(
    identifier: &[u8],
    payload: &[u8],
    extra_payload: &[u8],
    frame_size: usize,
) -> Result<String> {
    let frame = assemble_command_with(identifier, payload, extra_payload, frame_size)?;
    Ok(general_purpose::STANDARD.encode(frame))
}

/// Encode raw payload bytes for the cloud transport (no framing).
pub fn iot_payload_to_base64(payload: &[u8]) -> String {
    general_purpose::STANDARD.encode(payload)
}
