//! BSL boot-ROM handshake: ignition-toggle scan, payload upload, ACK parsing.

use std::time::Duration;

use crate::error::SieResult;
use crate::log::{debug, info, warn};
use crate::serial::{Signals, SerialPort};

pub const BSL_BAUD: u32 = 115_200;

const SCAN_ON: Duration = Duration::from_millis(50);
const SCAN_OFF: Duration = Duration::from_millis(150);
const ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// CPU variant identified by the boot-ROM scan byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVariant {
    /// Scan byte `0xB0`.
    Egold,
    /// Scan byte `0xC0`.
    Sgold,
}

impl CpuVariant {
    fn from_scan_byte(b: u8) -> Option<Self> {
        match b {
            0xB0 => Some(CpuVariant::Egold),
            0xC0 => Some(CpuVariant::Sgold),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            CpuVariant::Egold => "egold",
            CpuVariant::Sgold => "sgold",
        }
    }
}

/// Outcome of [`upload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Success,
    Denied,
    Unknown(u8),
    Timeout,
    Aborted,
}

/// Outcome of a scan attempt that was cancelled externally.
#[derive(Debug)]
pub enum ScanOutcome {
    Found { cpu: CpuVariant },
    Aborted,
}

fn ack_xor(code: &[u8]) -> u8 {
    code.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Frames `code` as `0x30 | len_lo | len_hi | code[..] | xor_checksum`.
pub fn frame_payload(code: &[u8]) -> Vec<u8> {
    let len = code.len() as u16;
    let mut out = Vec::with_capacity(4 + code.len());
    out.push(0x30);
    out.push((len & 0xFF) as u8);
    out.push((len >> 8) as u8);
    out.extend_from_slice(code);
    out.push(ack_xor(code));
    out
}

/// Repeatedly sends `"AT"`, optionally toggling DTR with the asymmetric
/// 50ms-on/150ms-off scan cadence, until the boot ROM answers with a
/// single `0xB0`/`0xC0` byte identifying the CPU, the external
/// `should_abort` flag is observed, or `max_attempts` is exhausted.
pub async fn scan<P: SerialPort>(
    port: &mut P,
    toggle_dtr: bool,
    invert_polarity: bool,
    max_attempts: u32,
    mut should_abort: impl FnMut() -> bool,
) -> SieResult<ScanOutcome> {
    for attempt in 0..max_attempts {
        if should_abort() {
            return Ok(ScanOutcome::Aborted);
        }

        if toggle_dtr {
            let on = !invert_polarity;
            port.set_signals(Signals { dtr: Some(on), rts: None }).await?;
            tokio::time::sleep(SCAN_ON).await;
            port.set_signals(Signals { dtr: Some(!on), rts: None }).await?;
            tokio::time::sleep(SCAN_OFF).await;
        }

        port.write(b"AT").await?;
        if let Some(byte) = port.read_byte(ACK_TIMEOUT).await? {
            if let Some(cpu) = CpuVariant::from_scan_byte(byte) {
                info!(target: "sie::bsl", "boot ROM found after {attempt} attempts: {}", cpu.name());
                return Ok(ScanOutcome::Found { cpu });
            }
            debug!(target: "sie::bsl", "scan got unexpected byte {byte:#04x}");
        }
    }
    Ok(ScanOutcome::Aborted)
}

/// Uploads `code` as a framed boot payload and waits for the ACK byte.
pub async fn upload<P: SerialPort>(port: &mut P, code: &[u8]) -> SieResult<UploadOutcome> {
    let frame = frame_payload(code);
    port.write(&frame).await?;
    match port.read_byte(ACK_TIMEOUT).await? {
        Some(0xC1) | Some(0xB1) => Ok(UploadOutcome::Success),
        Some(0x1C) | Some(0x1B) => Ok(UploadOutcome::Denied),
        Some(other) => {
            warn!(target: "sie::bsl", "unexpected upload ack byte {other:#04x}");
            Ok(UploadOutcome::Unknown(other))
        }
        None => Ok(UploadOutcome::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::fake::FakePort;

    #[test]
    fn frame_payload_matches_worked_example() {
        // A 16-byte payload whose XOR is `x` frames as 30 10 00 [16 bytes] x.
        let code = [0xAAu8; 16];
        let x = ack_xor(&code);
        let frame = frame_payload(&code);
        assert_eq!(frame[0], 0x30);
        assert_eq!(frame[1], 0x10);
        assert_eq!(frame[2], 0x00);
        assert_eq!(&frame[3..19], &code[..]);
        assert_eq!(frame[19], x);
    }

    #[tokio::test]
    async fn upload_success_ack() {
        let mut port = FakePort::new([0xB1]);
        let outcome = upload(&mut port, &[0x01, 0x02]).await.unwrap();
        assert_eq!(outcome, UploadOutcome::Success);
    }

    #[tokio::test]
    async fn upload_denied_ack() {
        let mut port = FakePort::new([0x1C]);
        let outcome = upload(&mut port, &[0x01]).await.unwrap();
        assert_eq!(outcome, UploadOutcome::Denied);
    }

    #[tokio::test]
    async fn upload_timeout_with_no_byte() {
        let mut port = FakePort::new(Vec::new());
        let outcome = upload(&mut port, &[0x01]).await.unwrap();
        assert_eq!(outcome, UploadOutcome::Timeout);
    }

    #[tokio::test]
    async fn scan_finds_cpu_variant() {
        let mut port = FakePort::new([0xC0]);
        let outcome = scan(&mut port, false, false, 1, || false).await.unwrap();
        match outcome {
            ScanOutcome::Found { cpu } => assert_eq!(cpu, CpuVariant::Sgold),
            ScanOutcome::Aborted => panic!("expected a find"),
        }
    }

    #[tokio::test]
    async fn scan_honors_abort_signal() {
        let mut port = FakePort::new(Vec::new());
        let outcome = scan(&mut port, false, false, 10, || true).await.unwrap();
        assert!(matches!(outcome, ScanOutcome::Aborted));
    }
}
