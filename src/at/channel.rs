//! Line-framed AT command/response engine with unsolicited-event dispatch.

use std::collections::VecDeque;
use std::time::Duration;

use crate::error::{Error, SieResult};
use crate::log::{debug, trace, warn};
use crate::serial::SerialPort;

use super::command::{accepts_line, classify_status, AtCommand, AtCommandKind, AtResponse, AtStatus};

const CRLF: &str = "\r\n";
const HANDSHAKE_CMD: &str = "ATQ0 V1 E0";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(300);
const HANDSHAKE_TRIES: u32 = 5;

/// Run state of the channel. Matches the `stopped -> running` lifecycle
/// from the component design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Stopped,
    Running,
}

/// Unsolicited lines that didn't belong to the in-flight command, or that
/// arrived with no command in flight.
pub type UnsolicitedSink = VecDeque<String>;

/// Line-framed AT command engine. Exactly one [`AtCommand`] may be
/// in-flight; additional callers queue behind it via `&mut self`.
pub struct AtChannel<P: SerialPort> {
    port: P,
    state: ChannelState,
    text_buf: String,
    pub unsolicited: UnsolicitedSink,
}

impl<P: SerialPort> AtChannel<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            state: ChannelState::Stopped,
            text_buf: String::new(),
            unsolicited: VecDeque::new(),
        }
    }

    pub fn start(&mut self) {
        self.state = ChannelState::Running;
    }

    pub fn stop(&mut self) {
        self.state = ChannelState::Stopped;
    }

    pub fn is_running(&self) -> bool {
        self.state == ChannelState::Running
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn into_port(self) -> P {
        self.port
    }

    /// Pulls one complete CRLF-terminated line out of the text buffer, if
    /// one is present.
    fn pop_line(&mut self) -> Option<String> {
        let idx = self.text_buf.find(CRLF)?;
        let line: String = self.text_buf.drain(..idx + CRLF.len()).collect();
        Some(line.trim_end_matches(CRLF).to_string())
    }

    async fn read_more(&mut self, timeout: Duration) -> SieResult<usize> {
        let mut buf = [0u8; 256];
        let n = self.port.read(&mut buf, timeout).await?;
        if n > 0 {
            self.text_buf
                .push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        Ok(n)
    }

    /// Sends `cmd` and drives the channel until a terminal status
    /// completes the command, the timeout elapses, or the port closes.
    pub async fn send(&mut self, cmd: &AtCommand) -> SieResult<AtResponse> {
        if !self.is_running() {
            self.start();
        }
        if self.port.is_closed() {
            return Ok(AtResponse {
                success: false,
                final_status: "PORT_CLOSED".into(),
                lines: Vec::new(),
                binary: None,
            });
        }

        trace!(target: "sie::at", "-> {}", cmd.text.trim());
        self.port.write(cmd.text.as_bytes()).await?;

        let dial = cmd.kind == AtCommandKind::Dial;

        if cmd.kind == AtCommandKind::NoResponse {
            return Ok(AtResponse {
                success: true,
                final_status: String::new(),
                lines: Vec::new(),
                binary: None,
            });
        }

        let binary = if cmd.kind == AtCommandKind::Binary {
            let len = cmd.binary_len.unwrap_or(0);
            let mut data = vec![0u8; len];
            let mut filled = 0;
            let deadline = tokio::time::Instant::now() + cmd.timeout;
            while filled < len {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    return Ok(AtResponse {
                        success: false,
                        final_status: "TIMEOUT".into(),
                        lines: Vec::new(),
                        binary: None,
                    });
                }
                let n = self.port.read(&mut data[filled..], remaining).await?;
                if n == 0 {
                    if self.port.is_closed() {
                        return Ok(AtResponse {
                            success: false,
                            final_status: "PORT_CLOSED".into(),
                            lines: Vec::new(),
                            binary: None,
                        });
                    }
                    continue;
                }
                filled += n;
            }
            Some(data)
        } else {
            None
        };

        let effective_kind = if cmd.kind == AtCommandKind::Binary {
            AtCommandKind::NoResponse
        } else {
            cmd.kind
        };

        if effective_kind == AtCommandKind::NoResponse {
            return Ok(AtResponse {
                success: true,
                final_status: "OK".into(),
                lines: Vec::new(),
                binary,
            });
        }

        let deadline = tokio::time::Instant::now() + cmd.timeout;
        let mut lines = Vec::new();
        let mut multiline_head: Option<String> = None;

        loop {
            if let Some(line) = self.pop_line() {
                if looks_terminal_for(effective_kind, &line, cmd.expected_prefix.as_deref()) {
                    if let Some(status) = classify_status(&line, dial) {
                        return Ok(finish(status, lines, binary));
                    }
                }

                match effective_kind {
                    AtCommandKind::Multiline => {
                        if multiline_head.is_none() {
                            if cmd
                                .expected_prefix
                                .as_deref()
                                .is_none_or(|p| line.starts_with(p))
                            {
                                multiline_head = Some(line);
                            } else {
                                self.unsolicited.push_back(line);
                            }
                        } else if looks_unsolicited_for_multiline(&line) {
                            self.unsolicited.push_back(line);
                        } else {
                            let head = multiline_head.as_mut().unwrap();
                            head.push_str(CRLF);
                            head.push_str(&line);
                        }
                    }
                    _ => {
                        if accepts_line(effective_kind, cmd.expected_prefix.as_deref(), &line) {
                            lines.push(line);
                        } else {
                            self.unsolicited.push_back(line);
                        }
                    }
                }
                continue;
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!(target: "sie::at", "timeout waiting for response to {}", cmd.text.trim());
                return Ok(finish(AtStatus::Timeout, lines, binary));
            }

            let n = self.read_more(remaining).await?;
            if n == 0 && self.port.is_closed() {
                return Ok(finish(AtStatus::PortClosed, lines, binary));
            }
        }
    }

    /// Sends `ATQ0 V1 E0` up to `HANDSHAKE_TRIES` times with a short
    /// per-attempt timeout, returning on the first success.
    pub async fn handshake(&mut self) -> SieResult<bool> {
        for attempt in 1..=HANDSHAKE_TRIES {
            let cmd = AtCommand::new(
                format!("{HANDSHAKE_CMD}\r"),
                AtCommandKind::Default,
                HANDSHAKE_TIMEOUT,
            );
            let resp = self.send(&cmd).await?;
            if resp.success {
                debug!(target: "sie::at", "handshake succeeded on attempt {attempt}");
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn looks_terminal_for(kind: AtCommandKind, line: &str, prefix: Option<&str>) -> bool {
    match kind {
        AtCommandKind::Multiline => true,
        _ => accepts_line(kind, prefix, line) || classify_status(line, false).is_some(),
    }
}

fn looks_unsolicited_for_multiline(line: &str) -> bool {
    super::command::looks_unsolicited(line)
}

fn finish(status: AtStatus, lines: Vec<String>, binary: Option<Vec<u8>>) -> AtResponse {
    let success = status.is_success();
    let final_status = match &status {
        AtStatus::Ok => "OK".to_string(),
        AtStatus::Connect => "CONNECT".to_string(),
        AtStatus::Error(s) => s.clone(),
        AtStatus::Timeout => "TIMEOUT".to_string(),
        AtStatus::PortClosed => "PORT_CLOSED".to_string(),
    };
    AtResponse {
        success,
        final_status,
        lines,
        binary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::fake::FakePort;

    #[tokio::test]
    async fn simple_ok_response() {
        let mut port = FakePort::new(Vec::new());
        port.push_inbound(b"OK\r\n");
        let mut chan = AtChannel::new(port);
        let cmd = AtCommand::new("AT\r", AtCommandKind::Default, Duration::from_millis(100));
        let resp = chan.send(&cmd).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.final_status, "OK");
    }

    #[tokio::test]
    async fn error_response_is_failure() {
        let mut port = FakePort::new(Vec::new());
        port.push_inbound(b"ERROR\r\n");
        let mut chan = AtChannel::new(port);
        let cmd = AtCommand::new("AT+X\r", AtCommandKind::Default, Duration::from_millis(100));
        let resp = chan.send(&cmd).await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.final_status, "ERROR");
    }

    #[tokio::test]
    async fn multiline_joins_body_lines() {
        let mut port = FakePort::new(Vec::new());
        port.push_inbound(b"+CGSN: first\r\nsecond\r\nOK\r\n");
        let mut chan = AtChannel::new(port);
        let cmd = AtCommand::new("AT+CGSN\r", AtCommandKind::Multiline, Duration::from_millis(100))
            .with_prefix("+CGSN");
        let resp = chan.send(&cmd).await.unwrap();
        assert!(resp.success);
    }

    #[tokio::test]
    async fn timeout_with_no_data() {
        let port = FakePort::new(Vec::new());
        let mut chan = AtChannel::new(port);
        let cmd = AtCommand::new("AT\r", AtCommandKind::Default, Duration::from_millis(20));
        let resp = chan.send(&cmd).await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.final_status, "TIMEOUT");
    }

    #[tokio::test]
    async fn no_response_kind_completes_immediately() {
        let port = FakePort::new(Vec::new());
        let mut chan = AtChannel::new(port);
        let cmd = AtCommand::new("ATZ\r", AtCommandKind::NoResponse, Duration::from_millis(20));
        let resp = chan.send(&cmd).await.unwrap();
        assert!(resp.success);
    }
}
