//! DWD wire encapsulation: `"AT#" | escape-count | offsets | body | 0x0D`.
//!
//! Escaped-byte offsets are recorded as `14 + index`, where `index` is the
//! byte's position in the *unescaped* frame body — a fixed additive
//! constant from the original format, not a pointer into the encapsulated
//! buffer. Decoding inverts that arithmetic directly.

use crate::error::{Error, SieResult};

const PREFIX: &[u8; 3] = b"AT#";
const OFFSET_BASE: u8 = 14;

/// Opcode/meaning/length table for DWD frames (length includes the
/// 2-byte little-endian opcode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwdOpcode {
    Connect1Request,
    Connect1Response,
    Connect2Request,
    Connect2Response,
    ReadMemoryRequest,
    ReadMemoryResponse,
    WriteMemoryRequest,
    WriteMemoryResponse,
    GetSwVersionRequest,
    GetSwVersionResponse,
    SwResetRequest,
}

impl DwdOpcode {
    pub fn code(self) -> u16 {
        match self {
            DwdOpcode::Connect1Request => 0x58,
            DwdOpcode::Connect1Response => 0x57,
            DwdOpcode::Connect2Request => 0x59,
            DwdOpcode::Connect2Response => 0x56,
            DwdOpcode::ReadMemoryRequest => 0x76,
            DwdOpcode::ReadMemoryResponse => 0x77,
            DwdOpcode::WriteMemoryRequest => 0x78,
            DwdOpcode::WriteMemoryResponse => 0x79,
            DwdOpcode::GetSwVersionRequest => 0x54,
            DwdOpcode::GetSwVersionResponse => 0x55,
            DwdOpcode::SwResetRequest => 0xAD,
        }
    }

    pub fn from_code(code: u16) -> SieResult<Self> {
        Ok(match code {
            0x58 => DwdOpcode::Connect1Request,
            0x57 => DwdOpcode::Connect1Response,
            0x59 => DwdOpcode::Connect2Request,
            0x56 => DwdOpcode::Connect2Response,
            0x76 => DwdOpcode::ReadMemoryRequest,
            0x77 => DwdOpcode::ReadMemoryResponse,
            0x78 => DwdOpcode::WriteMemoryRequest,
            0x79 => DwdOpcode::WriteMemoryResponse,
            0x54 => DwdOpcode::GetSwVersionRequest,
            0x55 => DwdOpcode::GetSwVersionResponse,
            0xAD => DwdOpcode::SwResetRequest,
            other => return Err(Error::ProtocolViolation(format!("unknown DWD opcode {other:#06x}"))),
        })
    }

    /// Fixed frame length including the opcode, or `None` for
    /// variable-length frames (whose length is driven by a header field).
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            DwdOpcode::Connect1Request | DwdOpcode::Connect1Response => Some(10),
            DwdOpcode::Connect2Request => Some(8),
            DwdOpcode::ReadMemoryRequest => Some(8),
            DwdOpcode::WriteMemoryResponse => Some(4),
            DwdOpcode::GetSwVersionRequest | DwdOpcode::SwResetRequest => Some(2),
            DwdOpcode::Connect2Response
            | DwdOpcode::ReadMemoryResponse
            | DwdOpcode::WriteMemoryRequest
            | DwdOpcode::GetSwVersionResponse => None,
        }
    }
}

/// Builds a raw (pre-encapsulation) frame: opcode (LE) followed by body.
pub fn build_frame(opcode: DwdOpcode, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + body.len());
    out.extend_from_slice(&opcode.code().to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Encapsulates a raw frame for transport: `0x0D` bytes in the body are
/// rewritten to `0x0C` and their positions recorded as escape offsets.
pub fn encapsulate(raw: &[u8]) -> Vec<u8> {
    let mut body = raw.to_vec();
    let mut offsets = Vec::new();
    for (i, b) in body.iter_mut().enumerate() {
        if *b == 0x0D {
            *b = 0x0C;
            offsets.push((OFFSET_BASE as usize + i) as u8);
        }
    }

    let mut out = Vec::with_capacity(PREFIX.len() + 1 + offsets.len() + body.len() + 1);
    out.extend_from_slice(PREFIX);
    out.push(offsets.len() as u8);
    out.extend_from_slice(&offsets);
    out.extend_from_slice(&body);
    out.push(0x0D);
    out
}

/// Inverts [`encapsulate`] given the expected raw body length, returning
/// the restored raw frame and the number of encapsulated bytes consumed.
pub fn decapsulate(buf: &[u8], raw_len: usize) -> SieResult<Option<(Vec<u8>, usize)>> {
    if buf.len() < PREFIX.len() + 1 {
        return Ok(None);
    }
    if &buf[..PREFIX.len()] != PREFIX {
        return Err(Error::ProtocolViolation("DWD frame missing \"AT#\" prefix".into()));
    }
    let count = buf[PREFIX.len()] as usize;
    let offsets_start = PREFIX.len() + 1;
    let body_start = offsets_start + count;
    let total = body_start + raw_len + 1;
    if buf.len() < total {
        return Ok(None);
    }

    let offsets = &buf[offsets_start..body_start];
    let mut body = buf[body_start..body_start + raw_len].to_vec();
    for &off in offsets {
        let idx = (off as usize)
            .checked_sub(OFFSET_BASE as usize)
            .ok_or_else(|| Error::ProtocolViolation("DWD escape offset underflow".into()))?;
        if idx >= body.len() {
            return Err(Error::ProtocolViolation("DWD escape offset out of range".into()));
        }
        body[idx] = 0x0D;
    }

    if buf[total - 1] != 0x0D {
        return Err(Error::ProtocolViolation("DWD frame missing trailing 0x0D".into()));
    }

    Ok(Some((body, total)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encapsulate_matches_worked_example() {
        let raw = [0x76, 0x00, 0x1E, 0x00, 0x0D, 0x0C, 0x00, 0xA0];
        let expected = [
            0x41, 0x54, 0x23, 0x01, 0x12, 0x76, 0x00, 0x1E, 0x00, 0x0C, 0x0C, 0x00, 0xA0, 0x0D,
        ];
        assert_eq!(encapsulate(&raw), expected);
    }

    #[test]
    fn encapsulate_matches_worked_example_with_multiple_escapes() {
        let raw = [0x76, 0x00, 0x1E, 0x00, 0x0D, 0x0D, 0x0C, 0xA0];
        let expected = [
            0x41, 0x54, 0x23, 0x02, 0x12, 0x13, 0x76, 0x00, 0x1E, 0x00, 0x0C, 0x0C, 0x0C, 0xA0,
            0x0D,
        ];
        assert_eq!(encapsulate(&raw), expected);

        let (decoded, consumed) = decapsulate(&expected, raw.len()).unwrap().unwrap();
        assert_eq!(consumed, expected.len());
        assert_eq!(decoded, raw);
    }

    #[test]
    fn decapsulate_inverts_encapsulate() {
        let raw = [0x76, 0x00, 0x1E, 0x00, 0x0D, 0x0C, 0x00, 0xA0];
        let wire = encapsulate(&raw);
        let (decoded, consumed) = decapsulate(&wire, raw.len()).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(decoded, raw);
    }

    #[test]
    fn decapsulate_reports_incomplete() {
        let raw = [0x76, 0x00, 0x1E, 0x00, 0x0D, 0x0C, 0x00, 0xA0];
        let wire = encapsulate(&raw);
        assert_eq!(decapsulate(&wire[..wire.len() - 1], raw.len()).unwrap(), None);
    }

    #[test]
    fn build_frame_prefixes_opcode_little_endian() {
        let f = build_frame(DwdOpcode::ReadMemoryRequest, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&f[0..2], &0x76u16.to_le_bytes());
        assert_eq!(f.len(), 8);
    }

    #[test]
    fn opcode_round_trips_through_code() {
        for op in [
            DwdOpcode::Connect1Request,
            DwdOpcode::ReadMemoryResponse,
            DwdOpcode::WriteMemoryRequest,
            DwdOpcode::SwResetRequest,
        ] {
            assert_eq!(DwdOpcode::from_code(op.code()).unwrap(), op);
        }
    }
}
