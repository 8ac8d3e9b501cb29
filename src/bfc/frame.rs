//! BFC frame wire format: header XOR checkpoint, optional CRC-16 trailer.

use crate::crc16::crc16;
use crate::error::{Error, SieResult};

const HEADER_LEN: usize = 6;

/// Frame type, carried in the high bits of the type/flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Single,
    Multiple,
    Ack,
    Status,
}

impl FrameType {
    fn to_bits(self) -> u8 {
        match self {
            FrameType::Single => 0,
            FrameType::Multiple => 1,
            FrameType::Ack => 2,
            FrameType::Status => 3,
        }
    }

    fn from_bits(bits: u8) -> SieResult<Self> {
        match bits {
            0 => Ok(FrameType::Single),
            1 => Ok(FrameType::Multiple),
            2 => Ok(FrameType::Ack),
            3 => Ok(FrameType::Status),
            other => Err(Error::ProtocolViolation(format!(
                "unknown BFC frame type {other}"
            ))),
        }
    }
}

/// Flags packed alongside the frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    pub ack: bool,
    pub crc: bool,
}

const ACK_BIT: u8 = 1 << 2;
const CRC_BIT: u8 = 1 << 3;

fn pack_type_flags(ty: FrameType, flags: Flags) -> u8 {
    let mut b = ty.to_bits();
    if flags.ack {
        b |= ACK_BIT;
    }
    if flags.crc {
        b |= CRC_BIT;
    }
    b
}

fn unpack_type_flags(b: u8) -> SieResult<(FrameType, Flags)> {
    let ty = FrameType::from_bits(b & 0b11)?;
    let flags = Flags {
        ack: b & ACK_BIT != 0,
        crc: b & CRC_BIT != 0,
    };
    Ok((ty, flags))
}

/// A single BFC frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BfcFrame {
    pub src: u8,
    pub dst: u8,
    pub payload: Vec<u8>,
    pub ty: FrameType,
    pub flags: Flags,
}

impl BfcFrame {
    pub fn new(src: u8, dst: u8, payload: Vec<u8>, ty: FrameType, flags: Flags) -> Self {
        Self { src, dst, payload, ty, flags }
    }

    /// Serializes the frame: header, payload, and (if the CRC flag is
    /// set) a CRC-16 trailer covering header + payload.
    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len() as u16;
        let mut header = [0u8; HEADER_LEN];
        header[0] = self.dst;
        header[1] = self.src;
        header[2] = (len >> 8) as u8;
        header[3] = (len & 0xFF) as u8;
        header[4] = pack_type_flags(self.ty, self.flags);
        header[5] = xor5(&header[..5]);

        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len() + 2);
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.payload);

        if self.flags.crc {
            let crc = crc16(0, &out);
            out.extend_from_slice(&crc.to_be_bytes());
        }
        out
    }

    /// Parses one frame from the front of `buf`, returning the frame and
    /// the number of bytes consumed. `buf` must already be resynced to a
    /// valid header (see [`resync`]).
    pub fn decode(buf: &[u8]) -> SieResult<Option<(Self, usize)>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = &buf[..HEADER_LEN];
        if header[5] != xor5(&header[..5]) {
            return Err(Error::IntegrityFailure("BFC header XOR mismatch".into()));
        }
        let dst = header[0];
        let src = header[1];
        let len = (u16::from(header[2]) << 8 | u16::from(header[3])) as usize;
        let (ty, flags) = unpack_type_flags(header[4])?;

        let trailer_len = if flags.crc { 2 } else { 0 };
        let total = HEADER_LEN + len + trailer_len;
        if buf.len() < total {
            return Ok(None);
        }

        let payload = buf[HEADER_LEN..HEADER_LEN + len].to_vec();

        if flags.crc {
            let computed = crc16(0, &buf[..HEADER_LEN + len]);
            let trailer = &buf[HEADER_LEN + len..total];
            let on_wire = u16::from_be_bytes([trailer[0], trailer[1]]);
            if computed != on_wire {
                return Err(Error::IntegrityFailure(format!(
                    "BFC CRC mismatch: on-wire {on_wire:#06x}, computed {computed:#06x}"
                )));
            }
        }

        Ok(Some((
            BfcFrame { src, dst, payload, ty, flags },
            total,
        )))
    }
}

fn xor5(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Scans for a valid header-XOR checkpoint, discarding noise before it.
/// Up to the last 5 bytes of trailing noise are retained while waiting
/// for more data to arrive (a complete header needs 6).
pub fn resync(buf: &mut Vec<u8>) {
    if buf.len() < HEADER_LEN {
        return;
    }
    let last_checkable = buf.len() - HEADER_LEN;
    for start in 0..=last_checkable {
        let window = &buf[start..start + HEADER_LEN];
        if window[5] == xor5(&window[..5]) {
            if start > 0 {
                buf.drain(..start);
            }
            return;
        }
    }
    // No checkpoint found in a fully-buffered window; keep only the
    // trailing bytes that could still become the start of a header once
    // more data arrives.
    let keep_from = buf.len().saturating_sub(HEADER_LEN - 1);
    buf.drain(..keep_from);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_without_crc() {
        let frame = BfcFrame::new(0x06, 0x01, vec![1, 2, 3, 4], FrameType::Single, Flags::default());
        let bytes = frame.encode();
        let (decoded, consumed) = BfcFrame::decode(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trip_with_crc() {
        let frame = BfcFrame::new(
            0x02,
            0x06,
            vec![0x80, 0x11],
            FrameType::Status,
            Flags { ack: false, crc: true },
        );
        let bytes = frame.encode();
        let header_xor = bytes[5];
        assert_eq!(header_xor, xor5(&bytes[..5]));
        let trailer_crc = u16::from_be_bytes([bytes[bytes.len() - 2], bytes[bytes.len() - 1]]);
        assert_eq!(trailer_crc, crc16(0, &bytes[..bytes.len() - 2]));

        let (decoded, consumed) = BfcFrame::decode(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn corrupted_header_xor_is_integrity_failure() {
        let frame = BfcFrame::new(0x01, 0x02, vec![9], FrameType::Single, Flags::default());
        let mut bytes = frame.encode();
        bytes[5] ^= 0xFF;
        assert!(matches!(
            BfcFrame::decode(&bytes),
            Err(Error::IntegrityFailure(_))
        ));
    }

    #[test]
    fn resync_discards_leading_noise() {
        let frame = BfcFrame::new(0x01, 0x02, vec![9, 9], FrameType::Single, Flags::default());
        let mut buf = vec![0xFF, 0xEE, 0x00];
        buf.extend_from_slice(&frame.encode());
        resync(&mut buf);
        let (decoded, _) = BfcFrame::decode(&buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let frame = BfcFrame::new(0x01, 0x02, vec![9, 9, 9], FrameType::Single, Flags::default());
        let bytes = frame.encode();
        assert_eq!(BfcFrame::decode(&bytes[..bytes.len() - 1]).unwrap(), None);
    }
}
