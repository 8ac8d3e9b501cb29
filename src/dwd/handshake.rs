//! DWD keyed handshake: connect-1/connect-2 and the key-derived checksums.

use std::time::Duration;

use crate::error::{Error, SieResult};
use crate::log::debug;
use crate::serial::SerialPort;

use super::frame::{build_frame, decapsulate, encapsulate, DwdOpcode};

const RAND1: u16 = 5500;
const RAND2: u16 = 5500;
const RAND3: u16 = 5500;
const RAND4: u16 = 0;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
const V24_ENABLE: [u8; 9] = [0x41, 0x54, 0x23, 0xFD, 0x0D, 0x00, 0x66, 0x8D, 0xED];
const V24_DISABLE: [u8; 9] = [0x41, 0x54, 0x23, 0xFE, 0x0D, 0x00, 0x66, 0x8D, 0xED];
const V24_DRAIN_WINDOW: Duration = Duration::from_millis(20);

/// A DWD key-tuple: `(key1: 16B, key2: u16, key3: 16B, key4: u16)`.
#[derive(Debug, Clone, Copy)]
pub struct KeySet {
    pub key1: [u8; 16],
    pub key2: u16,
    pub key3: [u8; 16],
    pub key4: u16,
}

const ZERO_KEYSET: KeySet = KeySet {
    key1: [0; 16],
    key2: 0,
    key3: [0; 16],
    key4: 0,
};

/// Built-in named keysets. Only `auto` (all zero) is attested by the
/// observable protocol surface; `service`/`lg`/`panasonic` are distinct
/// non-zero placeholders pending vendor-specific key material.
pub fn named_keyset(name: &str) -> Option<KeySet> {
    match name {
        "auto" => Some(ZERO_KEYSET),
        "service" => Some(KeySet { key2: 0x5A5A, key4: 0x0001, ..ZERO_KEYSET }),
        "lg" => Some(KeySet { key2: 0x4C47, key4: 0x0002, ..ZERO_KEYSET }),
        "panasonic" => Some(KeySet { key2: 0x5041, key4: 0x0003, ..ZERO_KEYSET }),
        _ => None,
    }
}

pub const NAMED_KEYSET_ORDER: [&str; 4] = ["auto", "service", "lg", "panasonic"];

fn connect1_payload(key: &KeySet) -> [u16; 4] {
    let chk = ((key.key4 ^ key.key2 ^ RAND1) as u32)
        .wrapping_add(RAND2 as u32)
        .wrapping_add(0x4ED5) as u16;
    [RAND1, chk, RAND2, RAND3]
}

fn verify_chk1(chk1: u16) -> bool {
    let expected = (((RAND1 as u32).wrapping_mul(8)).wrapping_sub(RAND2 as u32) as u16) ^ 0xD427;
    chk1 == expected
}

fn key_rotate(r6: u16) -> usize {
    (r6.wrapping_sub(RAND2) & 0xF) as usize
}

fn expected_chk2(key: &KeySet, rotate: usize) -> u16 {
    (((key.key1[rotate] as u16) << 4) ^ (((key.key3[0xF - rotate] as u16) << 3) ^ 0x7F39)) & 0xFFFF
}

fn connect2_payload(key: &KeySet, rotate: usize) -> [u16; 3] {
    let v = ((key.key1[0xF - rotate] as u16) ^ ((key.key3[rotate] as u16) << 4) ^ 0x4D33) & 0xFFFF;
    [RAND4, v, RAND4]
}

async fn toggle_v24<P: SerialPort>(port: &mut P, enable: bool) -> SieResult<()> {
    let cmd = if enable { &V24_ENABLE } else { &V24_DISABLE };
    port.write(cmd).await?;
    let mut scratch = [0u8; 32];
    let _ = port.read(&mut scratch, V24_DRAIN_WINDOW).await?;
    Ok(())
}

/// Runs connect-1/connect-2 against `keyset`, returning the resolved
/// key-rotate index on success.
async fn handshake_with<P: SerialPort>(port: &mut P, keyset: &KeySet) -> SieResult<usize> {
    let [rand1, chk, rand2, rand3] = connect1_payload(keyset);
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&rand1.to_le_bytes());
    body.extend_from_slice(&chk.to_le_bytes());
    body.extend_from_slice(&rand2.to_le_bytes());
    body.extend_from_slice(&rand3.to_le_bytes());
    let raw = build_frame(DwdOpcode::Connect1Request, &body);
    port.write(&encapsulate(&raw)).await?;

    let resp = read_frame(port, 10, HANDSHAKE_TIMEOUT).await?;
    if resp.len() < 10 {
        return Err(Error::Timeout("DWD connect-1 response".into()));
    }
    let opcode = u16::from_le_bytes([resp[0], resp[1]]);
    if opcode != DwdOpcode::Connect1Response.code() {
        return Err(Error::ProtocolViolation("DWD connect-1 response opcode mismatch".into()));
    }
    let _echo = u16::from_le_bytes([resp[2], resp[3]]);
    let chk1 = u16::from_le_bytes([resp[4], resp[5]]);
    let r6 = u16::from_le_bytes([resp[6], resp[7]]);
    let _chk2 = u16::from_le_bytes([resp[8], resp[9]]);

    if !verify_chk1(chk1) {
        return Err(Error::AuthenticationDenied);
    }

    let rotate = key_rotate(r6);
    let expected = expected_chk2(keyset, rotate);
    if _chk2 != expected {
        return Err(Error::AuthenticationDenied);
    }

    let [r4, v, r4b] = connect2_payload(keyset, rotate);
    let mut body2 = Vec::with_capacity(6);
    body2.extend_from_slice(&r4.to_le_bytes());
    body2.extend_from_slice(&v.to_le_bytes());
    body2.extend_from_slice(&r4b.to_le_bytes());
    let raw2 = build_frame(DwdOpcode::Connect2Request, &body2);
    port.write(&encapsulate(&raw2)).await?;

    let resp2 = read_frame(port, 4, HANDSHAKE_TIMEOUT).await?;
    if resp2.len() < 2 || u16::from_le_bytes([resp2[0], resp2[1]]) != DwdOpcode::Connect2Response.code() {
        return Err(Error::ProtocolViolation("DWD connect-2 response opcode mismatch".into()));
    }

    Ok(rotate)
}

/// Toggles V24 on, iterates the named keysets (when `keyset` is `None`,
/// i.e. `auto`) trying each in turn, then toggles V24 off on failure.
pub async fn connect<P: SerialPort>(port: &mut P, keyset: Option<&str>) -> SieResult<usize> {
    toggle_v24(port, true).await?;

    let names: Vec<&str> = match keyset {
        Some(name) => vec![name],
        None => NAMED_KEYSET_ORDER.to_vec(),
    };

    for name in names {
        let Some(ks) = named_keyset(name) else { continue };
        debug!(target: "sie::dwd", "attempting DWD handshake with keyset {name}");
        match handshake_with(port, &ks).await {
            Ok(rotate) => return Ok(rotate),
            Err(_) => continue,
        }
    }

    toggle_v24(port, false).await?;
    Err(Error::AuthenticationDenied)
}

async fn read_frame<P: SerialPort>(port: &mut P, raw_len: usize, timeout: Duration) -> SieResult<Vec<u8>> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = Vec::new();
    loop {
        if let Some((frame, _consumed)) = decapsulate(&buf, raw_len)? {
            return Ok(frame);
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Ok(Vec::new());
        }
        let mut chunk = [0u8; 64];
        let n = port.read(&mut chunk, remaining).await?;
        if n == 0 {
            if port.is_closed() {
                return Err(Error::TransportClosed);
            }
            continue;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Result of a single connect-1 probe used by the key-2 bruteforce scan.
struct ProbeOutcome {
    key2: u16,
    r6: u16,
    chk2: u16,
}

/// Scans `key2` candidates 0x0000..=0xFFFF via `probe`, disabling chk2
/// validation and keeping only those that satisfy chk1 alone.
async fn bruteforce_key2(
    mut probe: impl FnMut(u16) -> SieResult<(u16, u16, u16)>,
) -> Vec<u16> {
    let mut matches = Vec::new();
    for key2 in 0..=0xFFFFu32 {
        let key2 = key2 as u16;
        if let Ok((chk1, r6, chk2)) = probe(key2) {
            if verify_chk1(chk1) {
                matches.push(ProbeOutcome { key2, r6, chk2 }.key2);
                let _ = r6;
                let _ = chk2;
            }
        }
    }
    matches
}

/// Given a fixed `key2` and repeated `(keyRotate, chk2)` observations
/// (one per rotate position, `key3` assumed zero), solves `key1[rotate]`
/// from `chk2 == ((key1[rotate] << 4) ^ 0x7F39) & 0xFFFF`.
fn solve_key1_byte(rotate: usize, chk2: u16) -> u8 {
    let folded = (chk2 ^ 0x7F39) >> 4;
    (folded & 0xFF) as u8
}

/// Drives [`solve_key1_byte`] across all 16 rotate positions given a
/// per-rotate observation source.
fn solve_key1(observations: &[(usize, u16); 16]) -> [u8; 16] {
    let mut key1 = [0u8; 16];
    for &(rotate, chk2) in observations {
        key1[rotate] = solve_key1_byte(rotate, chk2);
    }
    key1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chk1_holds_for_fixed_rands() {
        let expected = (((RAND1 as u32).wrapping_mul(8)).wrapping_sub(RAND2 as u32) as u16) ^ 0xD427;
        assert!(verify_chk1(expected));
        assert!(!verify_chk1(expected ^ 1));
    }

    #[test]
    fn key_rotate_is_masked_to_nibble() {
        assert_eq!(key_rotate(RAND2), 0);
        assert_eq!(key_rotate(RAND2.wrapping_add(31)), 15);
    }

    #[test]
    fn chk2_matches_formula_for_zero_keyset() {
        let ks = ZERO_KEYSET;
        let rotate = 3;
        let chk2 = expected_chk2(&ks, rotate);
        assert_eq!(chk2, 0x7F39);
    }

    #[test]
    fn connect1_payload_embeds_fixed_rands() {
        let payload = connect1_payload(&ZERO_KEYSET);
        assert_eq!(payload[0], RAND1);
        assert_eq!(payload[2], RAND2);
        assert_eq!(payload[3], RAND3);
    }

    #[test]
    fn solve_key1_byte_inverts_the_zero_key3_formula() {
        let real_byte = 0xABu8;
        let chk2 = (((real_byte as u16) << 4) ^ 0x7F39) & 0xFFFF;
        assert_eq!(solve_key1_byte(0, chk2), real_byte);
    }

    #[tokio::test]
    async fn bruteforce_key2_keeps_only_chk1_matches() {
        let target_key2 = 0x1234u16;
        let good_chk1 = (((RAND1 as u32).wrapping_mul(8)).wrapping_sub(RAND2 as u32) as u16) ^ 0xD427;
        let matches = bruteforce_key2(|key2| {
            if key2 == target_key2 {
                Ok((good_chk1, 0, 0))
            } else {
                Ok((good_chk1 ^ 1, 0, 0))
            }
        })
        .await;
        assert_eq!(matches, vec![target_key2]);
    }
}
