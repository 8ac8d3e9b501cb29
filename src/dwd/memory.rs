//! DWD memory I/O chunk primitives and EBU-decoded region discovery.

use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, SieResult};
use crate::flash::FlashRegion;
use crate::io_engine::{self, CancelHandle, IoEngineConfig};
use crate::serial::SerialPort;

use super::frame::{build_frame, decapsulate, encapsulate, DwdOpcode};

const READ_MAX: usize = 230;
const WRITE_MAX: usize = 226;
const CHUNK_TIMEOUT: Duration = Duration::from_secs(2);

async fn read_frame<P: SerialPort>(port: &mut P, raw_len: usize, timeout: Duration) -> SieResult<Vec<u8>> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = Vec::new();
    loop {
        if let Some((frame, _)) = decapsulate(&buf, raw_len)? {
            return Ok(frame);
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout("DWD frame".into()));
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

async fn read_chunk<P: SerialPort>(port: &mut P, addr: u32, len: u16) -> SieResult<Bytes> {
    let mut body = Vec::with_capacity(6);
    body.extend_from_slice(&len.to_le_bytes());
    body.extend_from_slice(&addr.to_le_bytes());
    let raw = build_frame(DwdOpcode::ReadMemoryRequest, &body);
    port.write(&encapsulate(&raw)).await?;

    let resp = read_frame(port, 4 + len as usize, CHUNK_TIMEOUT).await?;
    let opcode = u16::from_le_bytes([resp[0], resp[1]]);
    if opcode != DwdOpcode::ReadMemoryResponse.code() {
        return Err(Error::ProtocolViolation("DWD read-memory response opcode mismatch".into()));
    }
    Ok(Bytes::copy_from_slice(&resp[4..]))
}

async fn write_chunk<P: SerialPort>(port: &mut P, addr: u32, data: &[u8]) -> SieResult<()> {
    let mut body = Vec::with_capacity(6 + data.len());
    body.extend_from_slice(&(data.len() as u16).to_le_bytes());
    body.extend_from_slice(&addr.to_le_bytes());
    body.extend_from_slice(data);
    let raw = build_frame(DwdOpcode::WriteMemoryRequest, &body);
    port.write(&encapsulate(&raw)).await?;

    let resp = read_frame(port, 4, CHUNK_TIMEOUT).await?;
    let opcode = u16::from_le_bytes([resp[0], resp[1]]);
    if opcode != DwdOpcode::WriteMemoryResponse.code() {
        return Err(Error::ProtocolViolation("DWD write-memory response opcode mismatch".into()));
    }
    Ok(())
}

fn chunk_config(page_size: usize) -> IoEngineConfig {
    IoEngineConfig {
        align: 1,
        page_size,
        adaptive: None,
        retry_budget: 3,
        progress_interval: Duration::from_millis(200),
    }
}

/// Reads `length` bytes starting at `address`, chunked at the 230-byte
/// DWD read-memory ceiling.
pub async fn read<P: SerialPort>(
    port: &mut P,
    address: u64,
    length: u64,
    mut on_progress: impl FnMut(io_engine::Progress),
) -> SieResult<Vec<u8>> {
    let cfg = chunk_config(READ_MAX);
    let cancel = CancelHandle::new();
    let report = io_engine::read(address, length, &cfg, &cancel, |p| on_progress(p), async |addr, len| {
        read_chunk(port, addr as u32, len as u16).await
    })
    .await?;
    Ok(report.data)
}

/// Writes `data` starting at `address`, chunked at the 226-byte DWD
/// write-memory ceiling.
pub async fn write<P: SerialPort>(
    port: &mut P,
    address: u64,
    data: &[u8],
    mut on_progress: impl FnMut(io_engine::Progress),
) -> SieResult<()> {
    let cfg = chunk_config(WRITE_MAX);
    let cancel = CancelHandle::new();
    io_engine::write(address, data, &cfg, &cancel, |p| on_progress(p), async |addr, chunk| {
        write_chunk(port, addr as u32, chunk).await
    })
    .await?;
    Ok(())
}

/// A memory region discovered from the EBU chip-select configuration, or
/// one of the static TCM/SRAM entries.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    pub name: String,
    pub addr: u64,
    pub size: u64,
}

const EBU_ID_ADDR: u32 = 0xF000_0008;

/// Picks the per-chip-select `ADDRSEL`/`BUSCON` register stride: older
/// revisions (< 8) space registers 8 bytes apart starting at `0xF0000080`;
/// later revisions use a 4-byte stride starting at `0xF0000020`.
fn ebu_stride(rev: u32, index: u32) -> u32 {
    if rev < 8 {
        0xF000_0080 + index * 8
    } else {
        0xF000_0020 + index * 4
    }
}

fn classify(base: u32, buscon_agen: u32) -> &'static str {
    let top_byte = base >> 24;
    if (0xA0..=0xAF).contains(&top_byte) {
        "FLASH"
    } else if matches!(buscon_agen, 3 | 4) {
        "SDRAM"
    } else {
        "REGION"
    }
}

/// Discovers the chip-select memory map by decoding the EBU registers,
/// then appends the static TCM/SRAM entries, sorts, and merges adjacent
/// same-name entries (disambiguating duplicates with a numeric suffix).
pub fn discover_regions(ebu_id: u32, addrsels: &[u32; 4], buscons: &[u32; 4]) -> Vec<MemoryRegion> {
    let mut regions = Vec::new();

    for i in 0..4usize {
        let addrsel = addrsels[i];
        if addrsel & 1 == 0 {
            continue;
        }
        let base = (addrsel & 0xFFFF_F000) as u64;
        let size_bits = (addrsel >> 4) & 0xF;
        let size = 1u64 << (27 - size_bits);
        let agen = buscons[i] & 0x7;
        let name = classify(base as u32, agen);
        regions.push(MemoryRegion { name: name.to_string(), addr: base, size });
    }

    regions.push(MemoryRegion { name: "TCM".into(), addr: 0xFFFF_0000, size: 16 * 1024 });
    regions.push(MemoryRegion { name: "SRAM".into(), addr: 0, size: 96 * 1024 });

    regions.sort_by_key(|r| r.addr);
    dedup_names(&mut regions);
    regions
}

/// Reads the EBU ID and the four chip-select `ADDRSEL`/`BUSCON` register
/// pairs over the wire, then resolves them into a memory map.
pub async fn discover<P: SerialPort>(port: &mut P) -> SieResult<Vec<MemoryRegion>> {
    let id_bytes = read_chunk(port, EBU_ID_ADDR, 4).await?;
    let ebu_id = u32::from_le_bytes(id_bytes[..4].try_into().unwrap());
    let rev = ebu_id & 0xFF;

    let mut addrsels = [0u32; 4];
    let mut buscons = [0u32; 4];
    for i in 0..4u32 {
        let addrsel_addr = ebu_stride(rev, i);
        let buscon_addr = addrsel_addr + if rev < 8 { 4 } else { 2 };
        let a = read_chunk(port, addrsel_addr, 4).await?;
        let b = read_chunk(port, buscon_addr, 4).await?;
        addrsels[i as usize] = u32::from_le_bytes(a[..4].try_into().unwrap());
        buscons[i as usize] = u32::from_le_bytes(b[..4].try_into().unwrap());
    }

    Ok(discover_regions(ebu_id, &addrsels, &buscons))
}

fn dedup_names(regions: &mut [MemoryRegion]) {
    let mut seen = std::collections::HashMap::<String, u32>::new();
    for region in regions.iter_mut() {
        let count = seen.entry(region.name.clone()).or_insert(0);
        if *count > 0 {
            region.name = format!("{}{}", region.name, *count);
        }
        *count += 1;
    }
}

impl From<&MemoryRegion> for FlashRegion {
    fn from(r: &MemoryRegion) -> Self {
        FlashRegion { addr: r.addr, size: r.size, erase_size: r.size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_chip_select_is_skipped() {
        let regions = discover_regions(8, &[0, 0, 0, 0], &[0, 0, 0, 0]);
        // Only the static TCM/SRAM entries survive when nothing is enabled.
        assert!(regions.iter().any(|r| r.name == "TCM"));
        assert!(regions.iter().any(|r| r.name == "SRAM"));
        assert_eq!(regions.len(), 2);
    }

    #[test]
    fn enabled_flash_chip_select_is_classified() {
        let addrsel = 0xA000_1000 | 1 | (3 << 4);
        let regions = discover_regions(8, &[addrsel, 0, 0, 0], &[0, 0, 0, 0]);
        let flash = regions.iter().find(|r| r.name.starts_with("FLASH")).unwrap();
        assert_eq!(flash.addr, 0xA000_1000);
        assert_eq!(flash.size, 1 << 24);
    }

    #[test]
    fn duplicate_names_get_numeric_suffix() {
        let addrsel1 = 0xA000_0000 | 1 | (3 << 4);
        let addrsel2 = 0xA100_0000 | 1 | (3 << 4);
        let regions = discover_regions(8, &[addrsel1, addrsel2, 0, 0], &[0, 0, 0, 0]);
        let names: Vec<&str> = regions.iter().map(|r| r.name.as_str()).collect();
        assert!(names.contains(&"FLASH"));
        assert!(names.iter().any(|n| n.starts_with("FLASH") && *n != "FLASH"));
    }
}
