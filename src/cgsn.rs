//! CGSN: memory/register operations encoded as AT commands.

use std::time::Duration;

use crate::at::{AtChannel, AtCommand, AtCommandKind};
use crate::error::{Error, SieResult};
use crate::log::{debug, info, warn};
use crate::serial::SerialPort;

const MARKER_ADDR: u32 = 0xA000_003C;
const MARKER: &[u8; 4] = b"CJKT";
const ACK_BYTE: u8 = 0xA1;
const MAX_READ_LEN: u32 = 512;
const MAX_WRITE_LEN: usize = 128;
const HANDSHAKE_BAUDS: [u32; 3] = [115_200, 460_800, 921_600];
const FALLBACK_BAUD: u32 = 115_200;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

fn hex8(v: u32) -> String {
    format!("{v:08X}")
}

/// Reads `len` bytes at `addr` (binary reply: one ACK byte + `len` data
/// bytes). `len` must be at most 512.
pub async fn read_memory<P: SerialPort>(chan: &mut AtChannel<P>, addr: u32, len: u32) -> SieResult<Vec<u8>> {
    if len > MAX_READ_LEN {
        return Err(Error::Unsupported(format!(
            "CGSN read length {len} exceeds {MAX_READ_LEN}"
        )));
    }
    let text = format!("AT+CGSN:{},{}\r", hex8(addr), hex8(len));
    let cmd = AtCommand::new(text, AtCommandKind::Binary, DEFAULT_TIMEOUT)
        .with_binary_len(1 + len as usize);
    let resp = chan.send(&cmd).await?;
    if !resp.success {
        return Err(Error::InvalidResponse(format!(
            "CGSN read failed: {}",
            resp.final_status
        )));
    }
    let binary = resp
        .binary
        .ok_or_else(|| Error::ProtocolViolation("CGSN read reply carried no binary payload".into()))?;
    if binary.first() != Some(&ACK_BYTE) {
        return Err(Error::ProtocolViolation("CGSN read reply missing ACK byte".into()));
    }
    Ok(binary[1..].to_vec())
}

/// Writes `data` to `addr`. Both `addr` and `data.len()` must be multiples
/// of 4, and `data.len()` must be at most 128.
pub async fn write_memory<P: SerialPort>(chan: &mut AtChannel<P>, addr: u32, data: &[u8]) -> SieResult<()> {
    if data.len() > MAX_WRITE_LEN || data.len() % 4 != 0 || addr % 4 != 0 {
        return Err(Error::Alignment(format!(
            "CGSN write requires 4-byte aligned addr/len <= {MAX_WRITE_LEN}, got addr={addr:#x} len={}",
            data.len()
        )));
    }
    let mut text = format!("AT+CGSN*{}", hex8(addr));
    for byte in data {
        text.push_str(&format!("{byte:02X}"));
    }
    text.push('\r');
    let cmd = AtCommand::new(text, AtCommandKind::Default, DEFAULT_TIMEOUT);
    let resp = chan.send(&cmd).await?;
    if resp.success {
        Ok(())
    } else {
        Err(Error::InvalidResponse(format!(
            "CGSN write failed: {}",
            resp.final_status
        )))
    }
}

/// Executes at `addr` with registers `r0..rN` preloaded, returning the 13
/// general-purpose registers plus CPSR as read back after execution.
pub async fn execute<P: SerialPort>(chan: &mut AtChannel<P>, addr: u32, regs: &[u32]) -> SieResult<[u32; 14]> {
    let mut text = format!("AT+CGSN@{}", hex8(addr));
    for r in regs {
        text.push(',');
        text.push_str(&hex8(*r));
    }
    text.push('\r');
    let cmd = AtCommand::new(text, AtCommandKind::Binary, DEFAULT_TIMEOUT).with_binary_len(1 + 14 * 4);
    let resp = chan.send(&cmd).await?;
    if !resp.success {
        return Err(Error::InvalidResponse(format!(
            "CGSN execute failed: {}",
            resp.final_status
        )));
    }
    let binary = resp
        .binary
        .ok_or_else(|| Error::ProtocolViolation("CGSN execute reply carried no binary payload".into()))?;
    if binary.first() != Some(&ACK_BYTE) {
        return Err(Error::ProtocolViolation("CGSN execute reply missing ACK byte".into()));
    }
    let mut out = [0u32; 14];
    for (i, chunk) in binary[1..].chunks_exact(4).take(14).enumerate() {
        out[i] = u32::from_le_bytes(chunk.try_into().unwrap());
    }
    Ok(out)
}

/// Bulk register/memory query across `addrs`, returning one u32 per address.
pub async fn bulk_query<P: SerialPort>(chan: &mut AtChannel<P>, addrs: &[u32]) -> SieResult<Vec<u32>> {
    let mut text = "AT+CGSN%".to_string();
    for a in addrs {
        text.push_str(&hex8(*a));
    }
    text.push('\r');
    let cmd = AtCommand::new(text, AtCommandKind::Binary, DEFAULT_TIMEOUT)
        .with_binary_len(1 + addrs.len() * 4);
    let resp = chan.send(&cmd).await?;
    if !resp.success {
        return Err(Error::InvalidResponse(format!(
            "CGSN bulk query failed: {}",
            resp.final_status
        )));
    }
    let binary = resp
        .binary
        .ok_or_else(|| Error::ProtocolViolation("CGSN bulk query reply carried no binary payload".into()))?;
    if binary.first() != Some(&ACK_BYTE) {
        return Err(Error::ProtocolViolation("CGSN bulk query reply missing ACK byte".into()));
    }
    Ok(binary[1..]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

/// Parses the `(n,n,…)` list from `AT+IPR=?`, picking the fastest baud
/// that does not exceed 921600, falling back to 115200 when nothing at
/// or above 921600 was offered.
fn pick_baud(list: &str) -> u32 {
    let candidates: Vec<u32> = list
        .trim_matches(|c: char| c == '(' || c == ')')
        .split(',')
        .filter_map(|s| s.trim().parse::<u32>().ok())
        .collect();
    candidates
        .into_iter()
        .filter(|&b| b >= 921_600)
        .max()
        .unwrap_or(FALLBACK_BAUD)
}

/// Connects to a CGSN-patched phone: probes the handshake baud, verifies
/// the `"CJKT"` marker, and switches the phone's engine.
pub async fn connect<P: SerialPort>(chan: &mut AtChannel<P>) -> SieResult<()> {
    let mut handshook = false;
    for &baud in &HANDSHAKE_BAUDS {
        chan.port_mut().update_baud(baud).await?;
        debug!(target: "sie::cgsn", "probing CGSN handshake at {baud}");
        if chan.handshake().await? {
            handshook = true;
            break;
        }
    }
    if !handshook {
        return Err(Error::Timeout("CGSN handshake".into()));
    }

    let marker = read_memory(chan, MARKER_ADDR, 4).await?;
    if marker != MARKER {
        return Err(Error::Unsupported(
            "phone firmware lacks the CGSN patch (marker mismatch)".into(),
        ));
    }

    let sifs = AtCommand::new("AT^SIFS\r", AtCommandKind::Default, DEFAULT_TIMEOUT);
    let resp = chan.send(&sifs).await?;
    let is_blue = resp.lines.iter().any(|l| l.contains("BLUE"));

    let switch_mode = if is_blue { 2 } else { 0 };
    let switch = AtCommand::new(format!("AT^SQWE={switch_mode}\r"), AtCommandKind::Default, DEFAULT_TIMEOUT);
    if !chan.send(&switch).await?.success {
        return Err(Error::ProtocolViolation("AT^SQWE engine switch rejected".into()));
    }

    let ipr = AtCommand::new("AT+IPR=?\r", AtCommandKind::Default, DEFAULT_TIMEOUT);
    let ipr_resp = chan.send(&ipr).await?;
    if let Some(line) = ipr_resp.lines.iter().find(|l| l.contains('(')) {
        let baud = pick_baud(line);
        info!(target: "sie::cgsn", "selecting baud {baud} from IPR list");
        chan.port_mut().update_baud(baud).await?;
    } else {
        warn!(target: "sie::cgsn", "AT+IPR=? returned no baud list, staying at current baud");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::fake::FakePort;

    #[test]
    fn hex8_is_uppercase_zero_padded() {
        assert_eq!(hex8(0xA0), "000000A0");
    }

    #[test]
    fn pick_baud_prefers_fastest_at_or_above_921600() {
        assert_eq!(pick_baud("(115200,230400,921600,1843200)"), 1_843_200);
    }

    #[test]
    fn pick_baud_falls_back_when_nothing_fast_enough() {
        assert_eq!(pick_baud("(9600,115200,230400)"), FALLBACK_BAUD);
    }

    #[tokio::test]
    async fn read_memory_rejects_oversized_length() {
        let port = FakePort::new(Vec::new());
        let mut chan = AtChannel::new(port);
        let err = read_memory(&mut chan, 0, 1024).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[tokio::test]
    async fn write_memory_rejects_misaligned_length() {
        let port = FakePort::new(Vec::new());
        let mut chan = AtChannel::new(port);
        let err = write_memory(&mut chan, 0, &[1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, Error::Alignment(_)));
    }

    #[tokio::test]
    async fn read_memory_parses_ack_and_payload() {
        let mut inbound = Vec::new();
        inbound.push(ACK_BYTE);
        inbound.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        inbound.extend_from_slice(b"\r\nOK\r\n");
        let port = FakePort::new(inbound);
        let mut chan = AtChannel::new(port);
        let data = read_memory(&mut chan, 0x1000, 4).await.unwrap();
        assert_eq!(data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }
}
