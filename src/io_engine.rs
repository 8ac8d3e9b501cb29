//! Page-oriented bulk read/write loop shared by every memory-read/write
//! protocol (CGSN, DWD, CHAOS, BFC's `readMemory`).
//!
//! Turns a low-level `chunk(address, length)` primitive into a resilient,
//! cancellable, progress-reporting bulk transfer with optional adaptive
//! page shrinking on repeated failure.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::{Error, SieResult};

/// A cooperative cancellation flag. Cheap to clone and share between the
/// caller and an in-flight bulk operation.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Adaptive page-shrinking policy: after `retry_count` consecutive
/// failures at a given page size, halve it (floor-aligned to `align`),
/// never below `small_page_size`.
#[derive(Debug, Clone, Copy)]
pub struct AdaptivePolicy {
    pub retry_count: u32,
    pub small_page_size: usize,
}

/// Configuration for a single bulk transfer.
#[derive(Debug, Clone)]
pub struct IoEngineConfig {
    pub align: usize,
    pub page_size: usize,
    pub adaptive: Option<AdaptivePolicy>,
    pub retry_budget: u32,
    pub progress_interval: Duration,
}

impl Default for IoEngineConfig {
    fn default() -> Self {
        Self {
            align: 1,
            page_size: 4096,
            adaptive: None,
            retry_budget: 3,
            progress_interval: Duration::from_millis(200),
        }
    }
}

/// A progress snapshot emitted at most once per `progress_interval`,
/// always at the start of a chunk and at completion.
#[derive(Debug, Clone)]
pub struct Progress {
    pub percent: f64,
    pub cursor: u64,
    pub total: u64,
    pub speed: f64,
    pub remaining: Duration,
    pub elapsed: Duration,
    pub errors: u32,
    pub page_addr: u64,
    pub page_size: usize,
}

/// Outcome of a bulk transfer: truncated on cancellation.
#[derive(Debug, Clone)]
pub struct IoReport<T> {
    pub data: T,
    pub cursor: u64,
    pub errors: u32,
    pub canceled: bool,
}

/// Smooths a cursor sample stream into a bytes/second estimate, sampling
/// at ~1 Hz and falling back to the lifetime average until the first
/// interval elapses.
struct SpeedMeter {
    start: Instant,
    last_sample_at: Instant,
    last_sample_cursor: u64,
    speed: f64,
}

impl SpeedMeter {
    fn new(now: Instant) -> Self {
        Self {
            start: now,
            last_sample_at: now,
            last_sample_cursor: 0,
            speed: 0.0,
        }
    }

    fn sample(&mut self, now: Instant, cursor: u64) -> f64 {
        let since_last = now.duration_since(self.last_sample_at);
        if since_last >= Duration::from_secs(1) {
            let delta = cursor.saturating_sub(self.last_sample_cursor);
            self.speed = delta as f64 / since_last.as_secs_f64();
            self.last_sample_at = now;
            self.last_sample_cursor = cursor;
        } else if self.speed == 0.0 {
            let elapsed = now.duration_since(self.start).as_secs_f64();
            if elapsed > 0.0 {
                self.speed = cursor as f64 / elapsed;
            }
        }
        self.speed
    }
}

fn make_progress(
    total: u64,
    cursor: u64,
    errors: u32,
    page_addr: u64,
    page_size: usize,
    start: Instant,
    speed: f64,
) -> Progress {
    let elapsed = start.elapsed();
    let percent = if total == 0 {
        100.0
    } else {
        (cursor as f64 / total as f64) * 100.0
    };
    let remaining = if speed > 0.0 && cursor < total {
        Duration::from_secs_f64((total - cursor) as f64 / speed)
    } else {
        Duration::ZERO
    };
    Progress {
        percent,
        cursor,
        total,
        speed,
        remaining,
        elapsed,
        errors,
        page_addr,
        page_size,
    }
}

fn validate(base: u64, total: u64, align: usize) -> SieResult<()> {
    let align = align as u64;
    if align > 1 && (base % align != 0 || total % align != 0) {
        return Err(Error::Alignment(format!(
            "address {base:#x} / length {total:#x} not aligned to {align}"
        )));
    }
    Ok(())
}

fn floor_align(size: usize, align: usize) -> usize {
    if align <= 1 {
        size
    } else {
        size - (size % align)
    }
}

fn shrink(
    page_size: usize,
    policy: AdaptivePolicy,
    fails_at_size: u32,
    align: usize,
) -> (usize, bool) {
    if fails_at_size >= policy.retry_count && page_size > policy.small_page_size {
        let mut next = floor_align(page_size / 2, align.max(1));
        if next < policy.small_page_size {
            next = policy.small_page_size;
        }
        if next == 0 {
            next = align.max(1);
        }
        (next, true)
    } else {
        (page_size, false)
    }
}

/// Reads `total` bytes starting at `base` via `chunk`, which reads `len`
/// bytes at `addr` and returns them.
pub async fn read<F>(
    base: u64,
    total: u64,
    cfg: &IoEngineConfig,
    cancel: &CancelHandle,
    mut on_progress: impl FnMut(Progress),
    mut chunk: F,
) -> SieResult<IoReport<Vec<u8>>>
where
    F: AsyncFnMut(u64, usize) -> SieResult<Bytes>,
{
    validate(base, total, cfg.align)?;
    let start = Instant::now();
    let mut speed = SpeedMeter::new(start);
    let mut cursor: u64 = 0;
    let mut buf: Vec<u8> = Vec::with_capacity(total as usize);
    let mut errors: u32 = 0;
    let mut page_size = cfg.page_size.max(cfg.align.max(1));
    let mut fails_at_size: u32 = 0;
    let mut last_progress_at = start;

    on_progress(make_progress(total, cursor, errors, base, page_size, start, 0.0));

    while cursor < total {
        if cancel.is_cancelled() {
            return Ok(IoReport {
                data: buf,
                cursor,
                errors,
                canceled: true,
            });
        }

        let now = Instant::now();
        if now.duration_since(last_progress_at) >= cfg.progress_interval {
            let s = speed.sample(now, cursor);
            on_progress(make_progress(
                total,
                cursor,
                errors,
                base + cursor,
                page_size,
                start,
                s,
            ));
            last_progress_at = now;
        }

        let remaining = total - cursor;
        let this_size = page_size.min(remaining as usize).max(1);
        let addr = base + cursor;

        match chunk(addr, this_size).await {
            Ok(bytes) => {
                buf.extend_from_slice(&bytes);
                cursor += bytes.len() as u64;
                fails_at_size = 0;
            }
            Err(e) => {
                errors += 1;
                fails_at_size += 1;
                if fails_at_size >= cfg.retry_budget {
                    return Err(e);
                }
                if let Some(policy) = cfg.adaptive {
                    if total - cursor > policy.small_page_size as u64 {
                        let (next, shrunk) = shrink(page_size, policy, fails_at_size, cfg.align);
                        if shrunk {
                            page_size = next;
                            fails_at_size = 0;
                        }
                    }
                }
            }
        }
    }

    let s = speed.sample(Instant::now(), cursor);
    on_progress(make_progress(total, cursor, errors, base + cursor, page_size, start, s));

    Ok(IoReport {
        data: buf,
        cursor,
        errors,
        canceled: false,
    })
}

/// Writes `data` starting at `base` via `chunk`, which writes the given
/// sub-slice at `addr`. Symmetric to [`read`], minus the buffer offset —
/// the primitive receives the sub-slice directly.
pub async fn write<F>(
    base: u64,
    data: &[u8],
    cfg: &IoEngineConfig,
    cancel: &CancelHandle,
    mut on_progress: impl FnMut(Progress),
    mut chunk: F,
) -> SieResult<IoReport<()>>
where
    F: AsyncFnMut(u64, &[u8]) -> SieResult<()>,
{
    let total = data.len() as u64;
    validate(base, total, cfg.align)?;
    let start = Instant::now();
    let mut speed = SpeedMeter::new(start);
    let mut cursor: u64 = 0;
    let mut errors: u32 = 0;
    let mut page_size = cfg.page_size.max(cfg.align.max(1));
    let mut fails_at_size: u32 = 0;
    let mut last_progress_at = start;

    on_progress(make_progress(total, cursor, errors, base, page_size, start, 0.0));

    while cursor < total {
        if cancel.is_cancelled() {
            return Ok(IoReport {
                data: (),
                cursor,
                errors,
                canceled: true,
            });
        }

        let now = Instant::now();
        if now.duration_since(last_progress_at) >= cfg.progress_interval {
            let s = speed.sample(now, cursor);
            on_progress(make_progress(
                total,
                cursor,
                errors,
                base + cursor,
                page_size,
                start,
                s,
            ));
            last_progress_at = now;
        }

        let remaining = (total - cursor) as usize;
        let this_size = page_size.min(remaining).max(1);
        let addr = base + cursor;
        let slice = &data[cursor as usize..cursor as usize + this_size];

        match chunk(addr, slice).await {
            Ok(()) => {
                cursor += this_size as u64;
                fails_at_size = 0;
            }
            Err(e) => {
                errors += 1;
                fails_at_size += 1;
                if fails_at_size >= cfg.retry_budget {
                    return Err(e);
                }
                if let Some(policy) = cfg.adaptive {
                    if total - cursor > policy.small_page_size as u64 {
                        let (next, shrunk) = shrink(page_size, policy, fails_at_size, cfg.align);
                        if shrunk {
                            page_size = next;
                            fails_at_size = 0;
                        }
                    }
                }
            }
        }
    }

    let s = speed.sample(Instant::now(), cursor);
    on_progress(make_progress(total, cursor, errors, base + cursor, page_size, start, s));

    Ok(IoReport {
        data: (),
        cursor,
        errors,
        canceled: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn read_accumulates_full_buffer() {
        let total = 1000u64;
        let cfg = IoEngineConfig {
            align: 1,
            page_size: 64,
            adaptive: None,
            retry_budget: 10,
            progress_interval: Duration::from_secs(10),
        };
        let cancel = CancelHandle::new();
        let source: Vec<u8> = (0..total as usize).map(|i| (i % 256) as u8).collect();
        let report = read(0, total, &cfg, &cancel, |_| {}, |addr, len| {
            let s = source.clone();
            async move { Ok(Bytes::copy_from_slice(&s[addr as usize..addr as usize + len])) }
        })
        .await
        .unwrap();
        assert_eq!(report.data, source);
        assert_eq!(report.cursor, total);
        assert_eq!(report.errors, 0);
        assert!(!report.canceled);
    }

    #[tokio::test]
    async fn progress_never_decreases_and_never_exceeds_total() {
        let total = 500u64;
        let cfg = IoEngineConfig {
            align: 1,
            page_size: 37,
            adaptive: None,
            retry_budget: 10,
            progress_interval: Duration::ZERO,
        };
        let cancel = CancelHandle::new();
        let cursors = Mutex::new(Vec::new());
        let _ = read(
            0,
            total,
            &cfg,
            &cancel,
            |p| cursors.lock().unwrap().push(p.cursor),
            |_addr, len| async move { Ok(Bytes::from(vec![0u8; len])) },
        )
        .await;
        let seen = cursors.into_inner().unwrap();
        for w in seen.windows(2) {
            assert!(w[1] >= w[0]);
        }
        assert!(seen.iter().all(|&c| c <= total));
    }

    #[tokio::test]
    async fn cancellation_returns_partial_buffer() {
        let total = 1_000_000u64;
        let cfg = IoEngineConfig {
            align: 1,
            page_size: 100_000,
            adaptive: None,
            retry_budget: 10,
            progress_interval: Duration::from_secs(10),
        };
        let cancel = CancelHandle::new();
        let cancel_clone = cancel.clone();
        let mut served = 0u64;
        let report = read(0, total, &cfg, &cancel, |_| {}, |_addr, len| {
            served += len as u64;
            if served >= 100_000 {
                cancel_clone.cancel();
            }
            async move { Ok(Bytes::from(vec![0u8; len])) }
        })
        .await
        .unwrap();
        assert!(report.canceled);
        assert_eq!(report.data.len() as u64, report.cursor);
        assert_eq!(report.cursor, 100_000);
        assert_eq!(report.errors, 0);
    }

    #[tokio::test]
    async fn adaptive_paging_shrinks_on_repeated_failure() {
        let total = 10_000u64;
        let cfg = IoEngineConfig {
            align: 4,
            page_size: 1024,
            adaptive: Some(AdaptivePolicy {
                retry_count: 2,
                small_page_size: 64,
            }),
            retry_budget: 100,
            progress_interval: Duration::from_secs(10),
        };
        let cancel = CancelHandle::new();
        let mut seen_sizes = Vec::new();
        let report = read(0, total, &cfg, &cancel, |_| {}, |_addr, len| {
            seen_sizes.push(len);
            async move {
                if len > 64 {
                    Err(Error::Timeout("chunk".into()))
                } else {
                    Ok(Bytes::from(vec![0u8; len]))
                }
            }
        })
        .await;
        // Page size should have shrunk to the floor before succeeding.
        assert!(seen_sizes.contains(&64));
        assert!(report.is_err());
    }

    #[test]
    fn floor_align_rounds_down() {
        assert_eq!(floor_align(130, 4), 128);
        assert_eq!(floor_align(128, 4), 128);
        assert_eq!(floor_align(5, 1), 5);
    }
}
