//! Ambient configuration knobs shared across protocols: baud sets,
//! timeouts, and retry/adaptive-paging defaults. Typed structs with
//! `Default`, built with plain field-setting or a handful of type-state
//! builders where a value is only meaningful once a prior one is set.

use std::time::Duration;

use crate::io_engine::{AdaptivePolicy, IoEngineConfig};

/// Baud rates BFC is willing to probe when searching for an
/// already-open bus, highest first.
pub const BFC_CANDIDATE_BAUDS: [u32; 3] = [921_600, 460_800, 230_400];

/// Baud rates CGSN's handshake probe tries, in order.
pub const CGSN_HANDSHAKE_BAUDS: [u32; 3] = [115_200, 460_800, 921_600];

/// Fixed baud BSL always uses; the boot ROM does not negotiate.
pub const BSL_FIXED_BAUD: u32 = 115_200;

/// Top-level timeouts shared across the AT channel and the framed
/// protocols layered on it.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub at_command: Duration,
    pub bfc_reply: Duration,
    pub dwd_reply: Duration,
    pub chaos_page: Duration,
    pub handshake_attempt: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            at_command: Duration::from_secs(2),
            bfc_reply: Duration::from_secs(2),
            dwd_reply: Duration::from_secs(2),
            chaos_page: Duration::from_secs(3),
            handshake_attempt: Duration::from_millis(300),
        }
    }
}

/// Retry/adaptive-paging defaults for a bulk I/O operation, before any
/// protocol-specific override (chunk ceiling, alignment).
#[derive(Debug, Clone, Copy)]
pub struct BulkIoDefaults {
    pub retry_budget: u32,
    pub progress_interval: Duration,
    pub adaptive: Option<AdaptivePolicy>,
}

impl Default for BulkIoDefaults {
    fn default() -> Self {
        Self {
            retry_budget: 3,
            progress_interval: Duration::from_millis(200),
            adaptive: Some(AdaptivePolicy {
                retry_count: 2,
                small_page_size: 128,
            }),
        }
    }
}

impl BulkIoDefaults {
    /// Builds a full [`IoEngineConfig`] for a protocol whose chunk
    /// primitive has its own alignment and page-size ceiling.
    pub fn engine_config(&self, align: usize, page_size: usize) -> IoEngineConfig {
        IoEngineConfig {
            align,
            page_size,
            adaptive: self.adaptive,
            retry_budget: self.retry_budget,
            progress_interval: self.progress_interval,
        }
    }
}

/// Marker type-states for [`PortSettingsBuilder`]: a baud rate must be
/// chosen before the builder can be finished.
pub struct NoBaud;
pub struct WithBaud(u32);

/// Builds the initial port settings a caller applies before handing a
/// freshly-opened [`crate::serial::SerialPort`] to a protocol.
pub struct PortSettingsBuilder<S> {
    baud: S,
    dtr: bool,
    rts: bool,
}

impl PortSettingsBuilder<NoBaud> {
    pub fn new() -> Self {
        Self { baud: NoBaud, dtr: true, rts: true }
    }

    pub fn baud(self, baud: u32) -> PortSettingsBuilder<WithBaud> {
        PortSettingsBuilder { baud: WithBaud(baud), dtr: self.dtr, rts: self.rts }
    }
}

impl Default for PortSettingsBuilder<NoBaud> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> PortSettingsBuilder<S> {
    pub fn dtr(mut self, dtr: bool) -> Self {
        self.dtr = dtr;
        self
    }

    pub fn rts(mut self, rts: bool) -> Self {
        self.rts = rts;
        self
    }
}

impl PortSettingsBuilder<WithBaud> {
    pub fn build(self) -> PortSettings {
        PortSettings { baud: self.baud.0, dtr: self.dtr, rts: self.rts }
    }
}

/// Resolved port settings ready to apply via `SerialPort::update_baud`
/// and `SerialPort::set_signals`.
#[derive(Debug, Clone, Copy)]
pub struct PortSettings {
    pub baud: u32,
    pub dtr: bool,
    pub rts: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_requires_baud_before_build() {
        let settings = PortSettingsBuilder::new().baud(115_200).dtr(false).build();
        assert_eq!(settings.baud, 115_200);
        assert!(!settings.dtr);
        assert!(settings.rts);
    }

    #[test]
    fn bulk_io_defaults_carry_adaptive_policy_into_engine_config() {
        let defaults = BulkIoDefaults::default();
        let cfg = defaults.engine_config(1, 230);
        assert_eq!(cfg.page_size, 230);
        assert!(cfg.adaptive.is_some());
    }
}
