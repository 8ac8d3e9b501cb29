//! CHAOS wire protocol: opcodes, page read/write framing, adaptive paging.

use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, SieResult};
use crate::log::{debug, warn};
use crate::serial::SerialPort;

use super::loader::ChaosLoader;

const STATUS_OK: u16 = 0x4B4F; // "OK"
const STATUS_CHECKSUM_ERROR: u16 = 0xBBBB;
const INITIAL_PAGE: usize = 64 * 1024;
const LARGE_PAGE_THRESHOLD: usize = 16 * 1024;
const FLOOR_PAGE: usize = 128;
const LARGE_FAIL_LIMIT: u32 = 2;
const SMALL_FAIL_LIMIT: u32 = 5;
const CHUNK_TIMEOUT: Duration = Duration::from_secs(3);
const PING_TIMEOUT: Duration = Duration::from_millis(500);

/// One-byte CHAOS command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaosOpcode {
    Ping,
    Pong,
    SetBaudrate,
    GetInfo,
    Quit,
    Test,
    ReadFlash,
    WriteFlash,
    WriteRam,
    ReadCfi,
    Heartbeat,
}

impl ChaosOpcode {
    pub fn byte(self) -> u8 {
        match self {
            ChaosOpcode::Ping => 0x41,
            ChaosOpcode::Pong => 0x52,
            ChaosOpcode::SetBaudrate => 0x48,
            ChaosOpcode::GetInfo => 0x49,
            ChaosOpcode::Quit => 0x51,
            ChaosOpcode::Test => 0x54,
            ChaosOpcode::ReadFlash => 0x52,
            ChaosOpcode::WriteFlash => 0x46,
            ChaosOpcode::WriteRam => 0x57,
            ChaosOpcode::ReadCfi => 0x43,
            ChaosOpcode::Heartbeat => 0x2E,
        }
    }
}

/// A single page transaction's failure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageIoError {
    ChecksumMismatch,
    BadStatus(u16),
    Timeout,
}

/// 16-bit-wide XOR across `data`, big-endian word assembly; an odd
/// trailing byte is treated as the high byte of a final zero-padded word.
fn xor16(data: &[u8]) -> u16 {
    let mut acc = 0u16;
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        acc ^= u16::from_be_bytes([c[0], c[1]]);
    }
    if let [last] = chunks.remainder() {
        acc ^= u16::from_be_bytes([*last, 0]);
    }
    acc
}

fn xor8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Reads one page with no retry: `0x52 | addr:u32_be | size:u32_be`,
/// expecting `data[size] | status:u16_le | chk:u16_le` in reply.
async fn page_read<P: SerialPort>(
    port: &mut P,
    addr: u32,
    size: u32,
    timeout: Duration,
) -> Result<Bytes, PageIoError> {
    let mut request = Vec::with_capacity(9);
    request.push(ChaosOpcode::ReadFlash.byte());
    request.extend_from_slice(&addr.to_be_bytes());
    request.extend_from_slice(&size.to_be_bytes());
    port.write(&request).await.map_err(|_| PageIoError::Timeout)?;

    let expected = size as usize + 4;
    let reply = crate::serial::read_exact(port, expected, timeout)
        .await
        .map_err(|_| PageIoError::Timeout)?;
    if reply.len() != expected {
        return Err(PageIoError::Timeout);
    }

    let data = &reply[..size as usize];
    let status = u16::from_le_bytes([reply[size as usize], reply[size as usize + 1]]);
    let chk = u16::from_le_bytes([reply[size as usize + 2], reply[size as usize + 3]]);

    if status != STATUS_OK {
        return Err(PageIoError::BadStatus(status));
    }
    if chk != xor16(data) {
        return Err(PageIoError::ChecksumMismatch);
    }
    Ok(Bytes::copy_from_slice(data))
}

/// Writes one page with no retry: `opcode | addr:u32_be | size:u32_be |
/// data[size] | chk:u8`, expecting a 2-byte little-endian status reply.
async fn page_write<P: SerialPort>(
    port: &mut P,
    opcode: ChaosOpcode,
    addr: u32,
    data: &[u8],
    timeout: Duration,
) -> Result<(), PageIoError> {
    let mut request = Vec::with_capacity(9 + data.len() + 1);
    request.push(opcode.byte());
    request.extend_from_slice(&addr.to_be_bytes());
    request.extend_from_slice(&(data.len() as u32).to_be_bytes());
    request.extend_from_slice(data);
    request.push(xor8(data));
    port.write(&request).await.map_err(|_| PageIoError::Timeout)?;

    let reply = crate::serial::read_exact(port, 2, timeout)
        .await
        .map_err(|_| PageIoError::Timeout)?;
    if reply.len() != 2 {
        return Err(PageIoError::Timeout);
    }
    let status = u16::from_le_bytes([reply[0], reply[1]]);
    match status {
        STATUS_OK => Ok(()),
        STATUS_CHECKSUM_ERROR => Err(PageIoError::ChecksumMismatch),
        other => Err(PageIoError::BadStatus(other)),
    }
}

fn shrink_page(page_size: usize) -> usize {
    (page_size / 2).max(FLOOR_PAGE)
}

/// Sends `PING` and checks for a `PONG` reply within [`PING_TIMEOUT`].
async fn ping<P: SerialPort>(port: &mut P) -> bool {
    if port.write(&[ChaosOpcode::Ping.byte()]).await.is_err() {
        return false;
    }
    matches!(port.read_byte(PING_TIMEOUT).await, Ok(Some(b)) if b == ChaosOpcode::Pong.byte())
}

/// Reads `length` bytes from `address` with CHAOS's adaptive paging
/// rule: halve the page size after 2 consecutive failures at large
/// pages (>= 16 KiB) or 5 at small pages, down to a 128-byte floor. On
/// any page failure the loader's heartbeat is suspended, busy-heartbeat
/// runs for `page_timeout`, then up to 16 pings are attempted before the
/// connection is declared lost.
pub async fn read_flash<P: SerialPort>(
    loader: &ChaosLoader<P>,
    address: u32,
    length: u32,
    page_timeout: Duration,
) -> SieResult<Vec<u8>> {
    let mut out = Vec::with_capacity(length as usize);
    let mut cursor = 0u32;
    let mut page_size = INITIAL_PAGE;
    let mut fail_streak = 0u32;

    while cursor < length {
        let this_size = page_size.min((length - cursor) as usize) as u32;
        let addr = address + cursor;

        let result = loader
            .with_heartbeat_suspended(|port_mutex| async move {
                let mut port = port_mutex.lock().await;
                page_read(&mut *port, addr, this_size, CHUNK_TIMEOUT)
                    .await
                    .map_err(|e| Error::ProtocolViolation(format!("CHAOS page read failed: {e:?}")))
            })
            .await;

        match result {
            Ok(data) => {
                out.extend_from_slice(&data);
                cursor += this_size;
                fail_streak = 0;
            }
            Err(_) => {
                fail_streak += 1;
                let limit = if page_size >= LARGE_PAGE_THRESHOLD {
                    LARGE_FAIL_LIMIT
                } else {
                    SMALL_FAIL_LIMIT
                };
                warn!(target: "sie::chaos", "page read at {addr:#x} failed ({fail_streak}/{limit})");

                loader
                    .recover_from_page_failure(page_timeout, || async {
                        let port_mutex = loader.port();
                        let mut port = port_mutex.lock().await;
                        ping(&mut *port).await
                    })
                    .await?;

                if fail_streak >= limit {
                    page_size = shrink_page(page_size);
                    fail_streak = 0;
                    debug!(target: "sie::chaos", "shrinking page size to {page_size}");
                }
            }
        }
    }

    Ok(out)
}

/// One flash region entry from a [`ChaosInfo`] record: `entry_count`
/// contiguous regions of `size_bytes` each, enumerated from `flash_base`.
/// The on-wire `count` field is the entry count minus one.
#[derive(Debug, Clone, Copy)]
pub struct ChaosFlashRegion {
    pub entry_count: u32,
    pub size_bytes: u32,
}

/// The 128-byte CHAOS `GET_INFO` record.
#[derive(Debug, Clone)]
pub struct ChaosInfo {
    pub model: String,
    pub vendor: String,
    pub imei: String,
    pub flash_base: u32,
    pub flash_vid: u16,
    pub flash_pid: u16,
    pub flash_size: u8,
    pub write_buffer_size: u16,
    pub regions: Vec<ChaosFlashRegion>,
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn parse_info(buf: &[u8]) -> SieResult<ChaosInfo> {
    if buf.len() < 128 {
        return Err(Error::ProtocolViolation(format!(
            "CHAOS info record too short: {} bytes",
            buf.len()
        )));
    }
    let model = c_string(&buf[0..16]);
    let vendor = c_string(&buf[16..32]);
    let imei = c_string(&buf[32..48]);
    let flash_base = u32::from_le_bytes(buf[64..68].try_into().unwrap());
    let flash_vid = u16::from_le_bytes(buf[80..82].try_into().unwrap());
    let flash_pid = u16::from_le_bytes(buf[82..84].try_into().unwrap());
    let flash_size = buf[84];
    let write_buffer_size = u16::from_le_bytes(buf[85..87].try_into().unwrap());
    let regions_n = buf[87] as usize;

    let mut regions = Vec::with_capacity(regions_n);
    let mut off = 88;
    for _ in 0..regions_n {
        if off + 4 > buf.len() {
            break;
        }
        let count = u16::from_le_bytes(buf[off..off + 2].try_into().unwrap());
        let size_units = u16::from_le_bytes(buf[off + 2..off + 4].try_into().unwrap());
        regions.push(ChaosFlashRegion {
            entry_count: count as u32 + 1,
            size_bytes: size_units as u32 * 256,
        });
        off += 4;
    }

    Ok(ChaosInfo {
        model,
        vendor,
        imei,
        flash_base,
        flash_vid,
        flash_pid,
        flash_size,
        write_buffer_size,
        regions,
    })
}

/// Sends `GET_INFO` and parses the 128-byte reply.
pub async fn get_info<P: SerialPort>(port: &mut P, timeout: Duration) -> SieResult<ChaosInfo> {
    port.write(&[ChaosOpcode::GetInfo.byte()]).await?;
    let reply = crate::serial::read_exact(port, 128, timeout).await?;
    parse_info(&reply)
}

/// Two-stage baud switch: the loader acks `0x68`, the caller then
/// switches its local baud and sends `SET_BAUDRATE_ACK` (`0x41`),
/// expecting a final `0x48` from the loader.
pub async fn set_baudrate<P: SerialPort>(port: &mut P, baud: u32, timeout: Duration) -> SieResult<()> {
    port.write(&[ChaosOpcode::SetBaudrate.byte()]).await?;
    let stage1 = port.read_byte(timeout).await?;
    if stage1 != Some(0x68) {
        return Err(Error::ProtocolViolation("CHAOS set-baudrate stage-1 ack missing".into()));
    }
    port.update_baud(baud).await?;
    port.write(&[ChaosOpcode::Ping.byte()]).await?;
    let stage2 = port.read_byte(timeout).await?;
    if stage2 != Some(ChaosOpcode::SetBaudrate.byte()) {
        return Err(Error::ProtocolViolation("CHAOS set-baudrate stage-2 ack missing".into()));
    }
    Ok(())
}

/// Writes `data` to RAM at `addr` in one unretried page.
pub async fn write_ram_page<P: SerialPort>(port: &mut P, addr: u32, data: &[u8]) -> SieResult<()> {
    page_write(port, ChaosOpcode::WriteRam, addr, data, CHUNK_TIMEOUT)
        .await
        .map_err(|e| Error::ProtocolViolation(format!("CHAOS RAM write failed: {e:?}")))
}

/// Writes `data` to flash at `addr` in one unretried page.
pub async fn write_flash_page<P: SerialPort>(port: &mut P, addr: u32, data: &[u8]) -> SieResult<()> {
    page_write(port, ChaosOpcode::WriteFlash, addr, data, CHUNK_TIMEOUT)
        .await
        .map_err(|e| Error::ProtocolViolation(format!("CHAOS flash write failed: {e:?}")))
}

pub async fn quit<P: SerialPort>(port: &mut P) -> SieResult<()> {
    port.write(&[ChaosOpcode::Quit.byte()]).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor16_folds_an_odd_trailing_byte() {
        assert_eq!(xor16(&[0x00, 0x00]), 0);
        assert_eq!(xor16(&[0xFF]), 0xFF00);
        assert_eq!(xor16(&[0x12, 0x34, 0x00, 0x01]), 0x1235);
    }

    #[test]
    fn xor8_is_plain_byte_fold() {
        assert_eq!(xor8(&[0x0F, 0xF0]), 0xFF);
    }

    #[test]
    fn shrink_page_halves_down_to_floor() {
        assert_eq!(shrink_page(64 * 1024), 32 * 1024);
        assert_eq!(shrink_page(256), 128);
        assert_eq!(shrink_page(128), 128);
    }

    #[test]
    fn opcode_bytes_match_table() {
        assert_eq!(ChaosOpcode::Ping.byte(), 0x41);
        assert_eq!(ChaosOpcode::WriteFlash.byte(), 0x46);
        assert_eq!(ChaosOpcode::Heartbeat.byte(), 0x2E);
    }

    #[test]
    fn parse_info_reads_strings_and_region_table() {
        let mut buf = vec![0u8; 128];
        buf[0..6].copy_from_slice(b"X75\0\0\0");
        buf[64..68].copy_from_slice(&0xA000_0000u32.to_le_bytes());
        buf[80..82].copy_from_slice(&0x00ECu16.to_le_bytes());
        buf[84] = 4;
        buf[85..87].copy_from_slice(&256u16.to_le_bytes());
        buf[87] = 1;
        buf[88..90].copy_from_slice(&0u16.to_le_bytes());
        buf[90..92].copy_from_slice(&64u16.to_le_bytes());

        let info = parse_info(&buf).unwrap();
        assert_eq!(info.model, "X75");
        assert_eq!(info.flash_base, 0xA000_0000);
        assert_eq!(info.regions.len(), 1);
        assert_eq!(info.regions[0].size_bytes, 64 * 256);
        assert_eq!(info.regions[0].entry_count, 1);
    }
}
