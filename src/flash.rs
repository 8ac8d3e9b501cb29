//! Flash region maps and region-aligned chunk planning.

/// A single flash region: base address, size, and erase granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashRegion {
    pub addr: u64,
    pub size: u64,
    pub erase_size: u64,
}

/// One piece of a write split at region boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionChunk {
    pub addr: u64,
    pub size: u64,
    pub buffer_offset: u64,
    pub buffer_size: u64,
    /// True whenever the write does not cover the entire region, i.e.
    /// `buffer_offset != 0 || buffer_size != region.size`.
    pub is_partial: bool,
}

/// Splits a `(addr, size)` write into chunks aligned to `regions`, a
/// sorted, non-overlapping sequence of [`FlashRegion`]s covering at least
/// `[addr, addr + size)`.
///
/// `alignToFlashRegions(addr, 0, regions) == []`; otherwise the returned
/// chunks' address ranges tile `[addr, addr + size)` without overlap, each
/// chunk's `(addr, size)` equals the region it falls in, and `is_partial`
/// is set whenever the chunk does not cover the whole region.
pub fn align_to_flash_regions(
    addr: u64,
    size: u64,
    regions: &[FlashRegion],
) -> Vec<RegionChunk> {
    if size == 0 {
        return Vec::new();
    }

    let end = addr + size;
    let mut out = Vec::new();
    let mut cursor = addr;

    while cursor < end {
        let region = regions
            .iter()
            .find(|r| cursor >= r.addr && cursor < r.addr + r.size)
            .expect("write range must be fully covered by the flash region map");

        let region_end = region.addr + region.size;
        let chunk_end = end.min(region_end);
        let buffer_offset = cursor - region.addr;
        let buffer_size = chunk_end - cursor;
        let is_partial = buffer_offset != 0 || buffer_size != region.size;

        out.push(RegionChunk {
            addr: region.addr,
            size: region.size,
            buffer_offset,
            buffer_size,
            is_partial,
        });

        cursor = chunk_end;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regions() -> Vec<FlashRegion> {
        vec![
            FlashRegion { addr: 0x1000, size: 0x1000, erase_size: 0x1000 },
            FlashRegion { addr: 0x2000, size: 0x1000, erase_size: 0x1000 },
            FlashRegion { addr: 0x3000, size: 0x1000, erase_size: 0x1000 },
        ]
    }

    #[test]
    fn zero_size_write_is_empty() {
        assert_eq!(align_to_flash_regions(0x1800, 0, &regions()), Vec::new());
    }

    #[test]
    fn worked_example_from_spec() {
        // write(0x1800, 0x1800) spans the tail of region 0x1000 and the
        // whole of region 0x2000.
        let chunks = align_to_flash_regions(0x1800, 0x1800, &regions());
        assert_eq!(
            chunks,
            vec![
                RegionChunk {
                    addr: 0x1000,
                    size: 0x1000,
                    buffer_offset: 0x800,
                    buffer_size: 0x800,
                    is_partial: true,
                },
                RegionChunk {
                    addr: 0x2000,
                    size: 0x1000,
                    buffer_offset: 0x0,
                    buffer_size: 0x1000,
                    is_partial: false,
                },
            ]
        );
    }

    #[test]
    fn chunks_tile_without_overlap() {
        let chunks = align_to_flash_regions(0x1800, 0x1800, &regions());
        let total: u64 = chunks.iter().map(|c| c.buffer_size).sum();
        assert_eq!(total, 0x1800);
    }
}
