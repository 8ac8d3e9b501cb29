//! BSL handoff into the resident CHAOS loader, and its heartbeat timer.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{Error, SieResult};
use crate::log::{debug, warn};
use crate::serial::SerialPort;

const HELLO_BYTE: u8 = 0xA5;
const HELLO_TIMEOUT: Duration = Duration::from_secs(2);
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(250);
const HEARTBEAT_BYTE: u8 = b'.';
const LOST_PING_ATTEMPTS: u32 = 16;

/// Owns the port for the duration of a CHAOS session: runs the 250 ms
/// idle heartbeat, and suspends it around request/response transactions.
pub struct ChaosLoader<P: SerialPort> {
    port: Mutex<P>,
    last_beat: Mutex<Instant>,
    heartbeat_enabled: std::sync::atomic::AtomicBool,
}

impl<P: SerialPort> ChaosLoader<P> {
    /// Waits for the single `0xA5` HELLO byte the resident loader sends
    /// once BSL has jumped into the embedded boot image.
    pub async fn handoff(mut port: P) -> SieResult<Self> {
        let byte = port.read_byte(HELLO_TIMEOUT).await?;
        if byte != Some(HELLO_BYTE) {
            return Err(Error::ProtocolViolation(format!(
                "expected CHAOS HELLO {HELLO_BYTE:#04x}, got {byte:?}"
            )));
        }
        debug!(target: "sie::chaos", "CHAOS loader handoff complete");
        Ok(Self {
            port: Mutex::new(port),
            last_beat: Mutex::new(Instant::now()),
            heartbeat_enabled: std::sync::atomic::AtomicBool::new(true),
        })
    }

    fn heartbeat_enabled(&self) -> bool {
        self.heartbeat_enabled.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn set_heartbeat(&self, enabled: bool) {
        self.heartbeat_enabled.store(enabled, std::sync::atomic::Ordering::SeqCst);
    }

    /// Sends a single heartbeat byte if the interval has elapsed and the
    /// heartbeat is currently enabled.
    async fn beat_if_due(&self) -> SieResult<()> {
        if !self.heartbeat_enabled() {
            return Ok(());
        }
        let mut last = self.last_beat.lock().await;
        if last.elapsed() < HEARTBEAT_INTERVAL {
            return Ok(());
        }
        self.port.lock().await.write(&[HEARTBEAT_BYTE]).await?;
        *last = Instant::now();
        Ok(())
    }

    /// Runs `body` with the heartbeat suspended, resuming it afterward
    /// regardless of outcome.
    pub async fn with_heartbeat_suspended<F, Fut, T>(&self, body: F) -> SieResult<T>
    where
        F: FnOnce(&Mutex<P>) -> Fut,
        Fut: Future<Output = SieResult<T>>,
    {
        self.set_heartbeat(false);
        let result = body(&self.port).await;
        self.set_heartbeat(true);
        *self.last_beat.lock().await = Instant::now();
        result
    }

    /// Busy-heartbeats for the duration of a page timeout after a page
    /// failure, then pings up to [`LOST_PING_ATTEMPTS`] times; if none
    /// succeed, the connection is declared lost.
    pub async fn recover_from_page_failure<F, Fut>(&self, page_timeout: Duration, mut ping: F) -> SieResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        self.set_heartbeat(false);
        let deadline = Instant::now() + page_timeout;
        while Instant::now() < deadline {
            self.port.lock().await.write(&[HEARTBEAT_BYTE]).await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for attempt in 1..=LOST_PING_ATTEMPTS {
            if ping().await {
                self.set_heartbeat(true);
                debug!(target: "sie::chaos", "CHAOS connection recovered on ping {attempt}");
                return Ok(());
            }
        }
        warn!(target: "sie::chaos", "CHAOS connection declared lost after {LOST_PING_ATTEMPTS} pings");
        Err(Error::TransportClosed)
    }

    pub async fn tick(&self) -> SieResult<()> {
        self.beat_if_due().await
    }

    pub fn port(&self) -> &Mutex<P> {
        &self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::fake::FakePort;

    #[tokio::test]
    async fn handoff_accepts_hello_byte() {
        let port = FakePort::new(vec![HELLO_BYTE]);
        let loader = ChaosLoader::handoff(port).await.unwrap();
        assert!(loader.heartbeat_enabled());
    }

    #[tokio::test]
    async fn handoff_rejects_wrong_byte() {
        let port = FakePort::new(vec![0x00]);
        let err = ChaosLoader::handoff(port).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn suspending_heartbeat_disables_it_for_the_duration() {
        let port = FakePort::new(vec![HELLO_BYTE]);
        let loader = ChaosLoader::handoff(port).await.unwrap();
        loader
            .with_heartbeat_suspended(|_port| async { Ok::<(), Error>(()) })
            .await
            .unwrap();
        assert!(loader.heartbeat_enabled());
    }
}
