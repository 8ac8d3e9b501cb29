//! EBL second-stage bootloader: checksummed request/response packets.

use std::time::Duration;

use crate::error::{Error, SieResult};
use crate::log::debug;
use crate::serial::SerialPort;

const START_TOKEN: u16 = 2;
const END_TOKEN: u16 = 3;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// EBL command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EblCommand {
    SetBaudrate = 0x01,
    SetEbuConfig = 0x02,
    CfiProbe = 0x03,
}

fn checksum(cmd: u16, payload: &[u8]) -> u16 {
    let mut sum = cmd as u32;
    sum += payload.len() as u32;
    for &b in payload {
        sum += b as u32;
    }
    (sum % 0x1_0000) as u16
}

/// Builds an on-wire EBL packet: `02 00 | cmd | size | payload | checksum | 03 00`.
pub fn encode_packet(cmd: u16, payload: &[u8]) -> Vec<u8> {
    let size = payload.len() as u16;
    let chk = checksum(cmd, payload);
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&START_TOKEN.to_le_bytes());
    out.extend_from_slice(&cmd.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&chk.to_le_bytes());
    out.extend_from_slice(&END_TOKEN.to_le_bytes());
    out
}

/// A decoded EBL response packet.
#[derive(Debug, Clone)]
pub struct EblPacket {
    pub cmd: u16,
    pub payload: Vec<u8>,
}

/// Writes `cmd`/`payload` as a packet, then reads and verifies the
/// response: 6-byte header, start token, matching cmd, `size + 4` body
/// bytes, end token, and recomputed checksum.
pub async fn transact<P: SerialPort>(
    port: &mut P,
    cmd: u16,
    payload: &[u8],
    timeout: Duration,
) -> SieResult<EblPacket> {
    let packet = encode_packet(cmd, payload);
    port.write(&packet).await?;

    let header = crate::serial::read_exact(port, 6, timeout).await?;
    if header.len() != 6 {
        return Err(Error::Timeout("EBL response header".into()));
    }
    let start = u16::from_le_bytes([header[0], header[1]]);
    let resp_cmd = u16::from_le_bytes([header[2], header[3]]);
    let size = u16::from_le_bytes([header[4], header[5]]) as usize;

    if start != START_TOKEN {
        return Err(Error::ProtocolViolation(format!(
            "EBL response start token {start:#06x}, expected {START_TOKEN:#06x}"
        )));
    }
    if resp_cmd != cmd {
        return Err(Error::ProtocolViolation(format!(
            "EBL response cmd {resp_cmd:#06x}, expected {cmd:#06x}"
        )));
    }

    let body = crate::serial::read_exact(port, size + 4, timeout).await?;
    if body.len() != size + 4 {
        return Err(Error::Timeout("EBL response body".into()));
    }
    let resp_payload = &body[..size];
    let resp_chk = u16::from_le_bytes([body[size], body[size + 1]]);
    let end = u16::from_le_bytes([body[size + 2], body[size + 3]]);

    if end != END_TOKEN {
        return Err(Error::ProtocolViolation(format!(
            "EBL response end token {end:#06x}, expected {END_TOKEN:#06x}"
        )));
    }
    let expected_chk = checksum(resp_cmd, resp_payload);
    if resp_chk != expected_chk {
        return Err(Error::IntegrityFailure(format!(
            "EBL checksum {resp_chk:#06x}, computed {expected_chk:#06x}"
        )));
    }

    Ok(EblPacket {
        cmd: resp_cmd,
        payload: resp_payload.to_vec(),
    })
}

/// Sends set-baudrate and only adopts the new local baud once the
/// response echoes the same rate back.
pub async fn set_baudrate<P: SerialPort>(port: &mut P, baud: u32) -> SieResult<()> {
    let payload = baud.to_le_bytes();
    let resp = transact(port, EblCommand::SetBaudrate as u16, &payload, DEFAULT_TIMEOUT).await?;
    if resp.payload.len() == 4 && u32::from_le_bytes(resp.payload[..4].try_into().unwrap()) == baud {
        port.update_baud(baud).await?;
        debug!(target: "sie::ebl", "baud switched to {baud}");
        Ok(())
    } else {
        Err(Error::ProtocolViolation("EBL baud echo mismatch".into()))
    }
}

/// The 88-byte EBU configuration record: a fixed prologue followed by
/// four `(cs, addrsel, buscon, busap)` u32-LE quadruples.
#[derive(Debug, Clone, Copy)]
pub struct EbuConfig {
    pub chip_selects: [EbuChipSelect; 4],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EbuChipSelect {
    pub cs: u32,
    pub addrsel: u32,
    pub buscon: u32,
    pub busap: u32,
}

const EBU_PROLOGUE: [u32; 6] = [5, 0x0402_0000, 115_200, 2, 1, 0];

impl EbuConfig {
    pub fn encode(&self) -> [u8; 88] {
        let mut out = [0u8; 88];
        let mut off = 0;
        for word in EBU_PROLOGUE {
            out[off..off + 4].copy_from_slice(&word.to_le_bytes());
            off += 4;
        }
        for cs in &self.chip_selects {
            for field in [cs.cs, cs.addrsel, cs.buscon, cs.busap] {
                out[off..off + 4].copy_from_slice(&field.to_le_bytes());
                off += 4;
            }
        }
        debug_assert_eq!(off, 88);
        out
    }
}

pub async fn set_ebu_config<P: SerialPort>(port: &mut P, cfg: &EbuConfig) -> SieResult<()> {
    let payload = cfg.encode();
    transact(port, EblCommand::SetEbuConfig as u16, &payload, DEFAULT_TIMEOUT).await?;
    Ok(())
}

/// One 64-byte CFI descriptor returned by the two-stage CFI probe.
pub type CfiDescriptor = [u8; 64];

/// Runs the two-stage CFI probe, returning four 64-byte flash descriptors.
pub async fn probe_cfi<P: SerialPort>(port: &mut P) -> SieResult<[CfiDescriptor; 4]> {
    let stage1 = transact(port, EblCommand::CfiProbe as u16, &[0x00], DEFAULT_TIMEOUT).await?;
    let stage2 = transact(port, EblCommand::CfiProbe as u16, &[0x01], DEFAULT_TIMEOUT).await?;

    let mut combined = stage1.payload;
    combined.extend_from_slice(&stage2.payload);
    if combined.len() < 256 {
        return Err(Error::ProtocolViolation(format!(
            "CFI probe returned {} bytes, need 256",
            combined.len()
        )));
    }

    let mut out = [[0u8; 64]; 4];
    for (i, chunk) in combined.chunks_exact(64).take(4).enumerate() {
        out[i].copy_from_slice(chunk);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::fake::FakePort;

    #[test]
    fn encode_decode_round_trip_checksum() {
        let payload = [0x01, 0x02, 0x03];
        let packet = encode_packet(0x10, &payload);
        assert_eq!(&packet[0..2], &2u16.to_le_bytes());
        assert_eq!(&packet[2..4], &0x10u16.to_le_bytes());
        assert_eq!(&packet[4..6], &3u16.to_le_bytes());
        assert_eq!(&packet[6..9], &payload);
        let chk = u16::from_le_bytes([packet[9], packet[10]]);
        assert_eq!(chk, checksum(0x10, &payload));
        assert_eq!(&packet[11..13], &3u16.to_le_bytes());
    }

    #[tokio::test]
    async fn transact_round_trips_a_reply() {
        let reply = encode_packet(0x10, &[0xAA, 0xBB]);
        let mut port = FakePort::new(reply);
        let resp = transact(&mut port, 0x10, &[0x01], Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(resp.cmd, 0x10);
        assert_eq!(resp.payload, vec![0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn transact_rejects_checksum_mismatch() {
        let mut reply = encode_packet(0x10, &[0xAA]);
        // Corrupt the checksum byte.
        let chk_idx = reply.len() - 4;
        reply[chk_idx] ^= 0xFF;
        let mut port = FakePort::new(reply);
        let err = transact(&mut port, 0x10, &[], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IntegrityFailure(_)));
    }

    #[test]
    fn ebu_config_encodes_88_bytes_with_prologue() {
        let cfg = EbuConfig {
            chip_selects: [EbuChipSelect::default(); 4],
        };
        let bytes = cfg.encode();
        assert_eq!(bytes.len(), 88);
        assert_eq!(&bytes[0..4], &5u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0x0402_0000u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &115_200u32.to_le_bytes());
    }
}
