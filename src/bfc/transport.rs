//! BFC connect sequence, the `exec` contract, auto-ACK, and auth caching.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::at::{AtChannel, AtCommand, AtCommandKind};
use crate::error::{Error, SieResult};
use crate::log::{debug, info, warn};
use crate::serial::SerialPort;

use super::frame::{resync, BfcFrame, Flags, FrameType};

/// Mode enum gating which subsystem owns the port's data subscription.
/// Mode transitions atomically detach the previous subscriber and attach
/// the next; calling a protocol's methods while the wrong mode is active
/// is a programming error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    None,
    At,
    Bfc,
}

const AUTH_PROBE: [u8; 0] = [];
const AUTH_ACCEPT: [u8; 2] = [0x43, 0x11];
const ACK_PAYLOAD: [u8; 2] = [0x15, 0x01];
const PING_DST: u8 = 0x02;
const PING_PAYLOAD: [u8; 2] = [0x80, 0x11];
const MEMORY_DST: u8 = 0x06;
const READ_MEMORY_CMD: u8 = 0x01;
const MAX_READ_CHUNK: usize = 32 * 1024;
const CONNECT_SETTLE: Duration = Duration::from_millis(300);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const BAUD_CANDIDATES: [u32; 3] = [115_200, 230_400, 921_600];
const BAUD_NEGOTIATE_CANDIDATES: [u32; 3] = [921_600, 460_800, 230_400];

/// Options controlling a single [`BfcTransport::exec`] call.
pub struct ExecOptions<'p> {
    pub ty: FrameType,
    pub crc: bool,
    pub ack: bool,
    pub auth: bool,
    pub timeout: Duration,
    pub parser: Option<&'p mut dyn FnMut(&BfcFrame, &mut Vec<u8>) -> SieResult<bool>>,
}

impl Default for ExecOptions<'_> {
    fn default() -> Self {
        Self {
            ty: FrameType::Single,
            crc: false,
            ack: false,
            auth: false,
            timeout: DEFAULT_TIMEOUT,
            parser: None,
        }
    }
}

struct Inner<P: SerialPort> {
    port: P,
    buf: Vec<u8>,
}

/// Driver for the BFC bus over a single serial port.
pub struct BfcTransport<P: SerialPort> {
    inner: Mutex<Inner<P>>,
    auth_cache: std::sync::Mutex<HashSet<u8>>,
    mode: std::sync::atomic::AtomicU8,
}

impl<P: SerialPort> BfcTransport<P> {
    pub fn new(port: P) -> Self {
        Self {
            inner: Mutex::new(Inner { port, buf: Vec::new() }),
            auth_cache: std::sync::Mutex::new(HashSet::new()),
            mode: std::sync::atomic::AtomicU8::new(TransportMode::None as u8),
        }
    }

    pub fn mode(&self) -> TransportMode {
        match self.mode.load(std::sync::atomic::Ordering::SeqCst) {
            0 => TransportMode::None,
            1 => TransportMode::At,
            _ => TransportMode::Bfc,
        }
    }

    fn set_mode(&self, mode: TransportMode) {
        self.mode.store(mode as u8, std::sync::atomic::Ordering::SeqCst);
    }

    /// Reads one resynced frame from the port, serving auto-ACK for any
    /// frame that carries the ACK flag. Returns `Ok(None)` on timeout.
    async fn next_frame(&self, inner: &mut Inner<P>, deadline: tokio::time::Instant) -> SieResult<Option<BfcFrame>> {
        loop {
            resync(&mut inner.buf);
            if let Some((frame, consumed)) = BfcFrame::decode(&inner.buf)? {
                inner.buf.drain(..consumed);
                if frame.flags.ack {
                    let ack = BfcFrame::new(
                        frame.dst,
                        frame.src,
                        ACK_PAYLOAD.to_vec(),
                        FrameType::Ack,
                        Flags { ack: false, crc: true },
                    );
                    inner.port.write(&ack.encode()).await?;
                }
                return Ok(Some(frame));
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let mut chunk = [0u8; 256];
            let n = inner.port.read(&mut chunk, remaining).await?;
            if n == 0 {
                if inner.port.is_closed() {
                    return Err(Error::TransportClosed);
                }
                continue;
            }
            inner.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn send_auth(&self, inner: &mut Inner<P>, src: u8, dst: u8) -> SieResult<()> {
        let frame = BfcFrame::new(src, dst, AUTH_PROBE.to_vec(), FrameType::Status, Flags::default());
        inner.port.write(&frame.encode()).await?;
        let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
        loop {
            match self.next_frame(inner, deadline).await? {
                Some(reply) if reply.dst == src => {
                    if reply.payload.starts_with(&AUTH_ACCEPT) {
                        return Ok(());
                    }
                    return Err(Error::AuthenticationDenied);
                }
                Some(_) => continue,
                None => return Err(Error::Timeout(format!("auth reply from dst {dst:#04x}"))),
            }
        }
    }

    /// `exec(src, dst, payload, opts)`: authenticates if requested, sends
    /// the frame, and collects the reply — single payload, or accumulated
    /// via `opts.parser` until it signals completion.
    pub async fn exec(&self, src: u8, dst: u8, payload: &[u8], mut opts: ExecOptions<'_>) -> SieResult<Vec<u8>> {
        let mut inner = self.inner.lock().await;

        if opts.auth && !self.auth_cache.lock().unwrap().contains(&dst) {
            self.send_auth(&mut inner, src, dst).await?;
            self.auth_cache.lock().unwrap().insert(dst);
        }

        let flags = Flags { ack: opts.ack, crc: opts.crc };
        let frame = BfcFrame::new(src, dst, payload.to_vec(), opts.ty, flags);
        inner.port.write(&frame.encode()).await?;

        let deadline = tokio::time::Instant::now() + opts.timeout;
        let mut collected = Vec::new();

        loop {
            match self.next_frame(&mut inner, deadline).await? {
                Some(reply) if reply.dst == src => {
                    if let Some(parser) = opts.parser.as_deref_mut() {
                        if parser(&reply, &mut collected)? {
                            return Ok(collected);
                        }
                    } else {
                        return Ok(reply.payload);
                    }
                }
                Some(_) => continue,
                None => {
                    return Err(Error::Timeout(format!(
                        "BFC reply from dst {dst:#04x} for src {src:#04x}"
                    )))
                }
            }
        }
    }

    /// Sends a STATUS ping to `PING_DST` and returns whether a reply
    /// arrived within `timeout`.
    pub async fn ping(&self, src: u8, timeout: Duration) -> bool {
        self.exec(
            src,
            PING_DST,
            &PING_PAYLOAD,
            ExecOptions {
                ty: FrameType::Status,
                timeout,
                ..Default::default()
            },
        )
        .await
        .is_ok()
    }

    /// Connect sequence: try AT at 115200 first, falling back to probing
    /// for an already-open BFC bus at the candidate bauds.
    pub async fn connect(self) -> SieResult<Self> {
        if self.try_connect_via_at().await? {
            self.set_mode(TransportMode::Bfc);
            return Ok(self);
        }

        if self.try_find_open_bus().await? {
            self.set_mode(TransportMode::Bfc);
            return Ok(self);
        }

        Err(Error::Unsupported("no BFC endpoint found".into()))
    }

    async fn try_connect_via_at(&self) -> SieResult<bool> {
        self.set_mode(TransportMode::At);
        let mut inner = self.inner.lock().await;
        if inner.port.baud() != 115_200 {
            inner.port.update_baud(115_200).await?;
        }

        let mut chan = AtChannel::new(&mut inner.port);
        chan.start();

        let query = AtCommand::new("AT^SIFS\r", AtCommandKind::Default, Duration::from_secs(2));
        let sifs = chan.send(&query).await.ok().filter(|r| r.success);

        if let Some(resp) = &sifs {
            if resp.lines.iter().any(|l| l.contains("BLUE")) {
                return Err(Error::Unsupported("BFC over Bluetooth is not supported".into()));
            }
        }

        if sifs.is_none() {
            self.set_mode(TransportMode::None);
            return Ok(false);
        }

        let switch = AtCommand::new("AT^SQWE=1\r", AtCommandKind::Default, Duration::from_secs(2));
        let switched = chan.send(&switch).await?.success;
        drop(inner);

        if !switched {
            self.set_mode(TransportMode::None);
            return Ok(false);
        }

        tokio::time::sleep(CONNECT_SETTLE).await;
        let ok = self.ping(0x01, Duration::from_secs(1)).await;
        Ok(ok)
    }

    async fn try_find_open_bus(&self) -> SieResult<bool> {
        for &baud in &BAUD_CANDIDATES {
            {
                let mut inner = self.inner.lock().await;
                inner.port.update_baud(baud).await?;
                inner.buf.clear();
            }
            debug!(target: "sie::bfc", "probing for open BFC bus at {baud} baud");
            let mut saw_reply = false;
            for _ in 0..3 {
                if self.ping(0x01, Duration::from_millis(500)).await {
                    saw_reply = true;
                    break;
                }
            }
            if saw_reply {
                info!(target: "sie::bfc", "found open BFC bus at {baud} baud");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Reads `length` bytes from `address` via BFC's memory-read service
    /// (command `01` on dst `0x06`), chunked through the I/O engine at a
    /// 32 KiB per-call ceiling.
    pub async fn read_memory(&self, src: u8, address: u64, length: u64) -> SieResult<Vec<u8>> {
        let cfg = crate::io_engine::IoEngineConfig {
            align: 1,
            page_size: MAX_READ_CHUNK,
            adaptive: None,
            retry_budget: 4,
            progress_interval: Duration::from_millis(200),
        };
        let cancel = crate::io_engine::CancelHandle::new();
        let report = crate::io_engine::read(address, length, &cfg, &cancel, |_| {}, |addr, len| {
            self.read_memory_chunk(src, addr, len)
        })
        .await?;
        Ok(report.data)
    }

    async fn read_memory_chunk(&self, src: u8, addr: u64, len: usize) -> SieResult<bytes::Bytes> {
        let mut request = Vec::with_capacity(9);
        request.push(READ_MEMORY_CMD);
        request.extend_from_slice(&(addr as u32).to_le_bytes());
        request.extend_from_slice(&(len as u32).to_le_bytes());

        let mut first = true;

        let mut parser = move |frame: &BfcFrame, out: &mut Vec<u8>| -> SieResult<bool> {
            if first {
                first = false;
                if frame.payload.len() < 2 || frame.payload[0] != 0x01 || frame.payload[1] != 0x00 {
                    return Err(Error::ProtocolViolation("BFC readMemory NACK".into()));
                }
                return Ok(false);
            }
            let body: &[u8] = match frame.ty {
                FrameType::Multiple => {
                    if frame.payload.is_empty() {
                        &[]
                    } else {
                        &frame.payload[1..]
                    }
                }
                FrameType::Single => &frame.payload,
                _ => &[],
            };
            out.extend_from_slice(body);
            Ok(out.len() >= len)
        };

        let mut data = self
            .exec(
                src,
                MEMORY_DST,
                &request,
                ExecOptions {
                    ty: FrameType::Single,
                    timeout: Duration::from_secs(3),
                    parser: Some(&mut parser),
                    ..Default::default()
                },
            )
            .await?;

        data.truncate(len.min(data.len()));
        Ok(bytes::Bytes::from(data))
    }

    /// Negotiates the highest mutually-supported baud, trying candidates
    /// downward and restoring the prior baud on failure.
    pub async fn negotiate_baud(&self, src: u8) -> SieResult<u32> {
        let prior = self.inner.lock().await.port.baud();
        for &candidate in &BAUD_NEGOTIATE_CANDIDATES {
            let mut payload = vec![0x02u8];
            payload.extend_from_slice(candidate.to_string().as_bytes());

            let reply = self
                .exec(
                    src,
                    MEMORY_DST,
                    &payload,
                    ExecOptions {
                        ty: FrameType::Single,
                        timeout: Duration::from_secs(1),
                        ..Default::default()
                    },
                )
                .await;

            let accepted = match reply {
                Ok(resp) => !(resp.len() >= 2 && resp[0] == 0x02 && resp[1] == 0xEE),
                Err(_) => false,
            };

            if !accepted {
                continue;
            }

            self.inner.lock().await.port.update_baud(candidate).await?;

            let mut ok_count = 0;
            for _ in 0..3 {
                if self.ping(src, Duration::from_secs(1)).await {
                    ok_count += 1;
                }
            }
            if ok_count > 0 {
                return Ok(candidate);
            }

            self.inner.lock().await.port.update_baud(prior).await?;
        }
        warn!(target: "sie::bfc", "baud negotiation failed, staying at {prior}");
        Ok(prior)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::fake::FakePort;

    fn ack_frame(dst: u8, src: u8) -> BfcFrame {
        BfcFrame::new(src, dst, vec![0x01], FrameType::Status, Flags::default())
    }

    #[tokio::test]
    async fn exec_returns_single_frame_payload() {
        let reply = BfcFrame::new(0x06, 0x01, vec![9, 9], FrameType::Single, Flags::default());
        let port = FakePort::new(reply.encode());
        let transport = BfcTransport::new(port);
        let payload = transport
            .exec(0x01, 0x06, &[0x00], ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(payload, vec![9, 9]);
    }

    #[tokio::test]
    async fn auto_ack_replies_to_ack_flagged_frames() {
        let reply = BfcFrame::new(
            0x06,
            0x01,
            vec![1],
            FrameType::Single,
            Flags { ack: true, crc: true },
        );
        let port = FakePort::new(reply.encode());
        let transport = BfcTransport::new(port);
        let _ = transport
            .exec(0x01, 0x06, &[0x00], ExecOptions::default())
            .await
            .unwrap();
        let outbound = transport.inner.lock().await.port.outbound.clone();
        // Our own request frame plus an auto-ACK frame should both be on the wire.
        let ack = BfcFrame::new(0x01, 0x06, vec![0x15, 0x01], FrameType::Ack, Flags { ack: false, crc: true });
        assert!(outbound.windows(ack.encode().len()).any(|w| w == ack.encode()));
    }

    #[test]
    fn ack_frame_shape() {
        let f = ack_frame(0x01, 0x06);
        assert_eq!(f.payload, vec![0x01]);
    }
}
