//! AT command/response records and the per-kind dispatch rules.

use std::time::Duration;

/// Dispatch kind for an [`AtCommand`], selecting how incoming lines are
/// routed while the command is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtCommandKind {
    Default,
    Multiline,
    PrefixFiltered,
    NoPrefix,
    NoPrefixAll,
    Binary,
    Numeric,
    Dial,
    NoResponse,
}

/// A command queued on the AT Channel.
#[derive(Debug, Clone)]
pub struct AtCommand {
    pub text: String,
    pub kind: AtCommandKind,
    pub expected_prefix: Option<String>,
    pub timeout: Duration,
    /// Size of a binary payload that precedes the final status line, for
    /// [`AtCommandKind::Binary`].
    pub binary_len: Option<usize>,
}

impl AtCommand {
    pub fn new(text: impl Into<String>, kind: AtCommandKind, timeout: Duration) -> Self {
        Self {
            text: text.into(),
            kind,
            expected_prefix: None,
            timeout,
            binary_len: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.expected_prefix = Some(prefix.into());
        self
    }

    pub fn with_binary_len(mut self, len: usize) -> Self {
        self.binary_len = Some(len);
        self
    }
}

/// Terminal status of an AT transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtStatus {
    Ok,
    Connect,
    Error(String),
    Timeout,
    PortClosed,
}

impl AtStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, AtStatus::Ok | AtStatus::Connect)
    }
}

/// Classifies a complete line as a terminal status, or `None` if it is an
/// ordinary response/unsolicited line.
pub fn classify_status(line: &str, dial: bool) -> Option<AtStatus> {
    let line = line.trim();
    if line == "OK" {
        return Some(AtStatus::Ok);
    }
    if dial && line == "CONNECT" {
        return Some(AtStatus::Connect);
    }
    if line == "ERROR"
        || line.starts_with("+CMS ERROR")
        || line.starts_with("+CME ERROR")
        || (dial && matches!(line, "NO CARRIER" | "NO ANSWER" | "NO DIALTONE"))
    {
        return Some(AtStatus::Error(line.to_string()));
    }
    None
}

/// True if `line` "looks unsolicited": starts with one of the prefix
/// characters reserved for unsolicited result codes.
pub fn looks_unsolicited(line: &str) -> bool {
    line.starts_with('+') || line.starts_with('*') || line.starts_with('^') || line.starts_with('!')
}

/// Per-kind acceptance test for a line arriving while a command of `kind`
/// with `expected_prefix` is in flight. Returns `true` if the line belongs
/// to the command response (rather than being ejected to the unsolicited
/// path).
pub fn accepts_line(kind: AtCommandKind, expected_prefix: Option<&str>, line: &str) -> bool {
    match kind {
        AtCommandKind::PrefixFiltered => expected_prefix.is_some_and(|p| line.starts_with(p)),
        AtCommandKind::NoPrefixAll => true,
        AtCommandKind::NoPrefix => !looks_unsolicited(line),
        AtCommandKind::Numeric => {
            expected_prefix.is_some_and(|p| line.starts_with(p))
                || line.chars().next().is_some_and(|c| c.is_ascii_digit())
        }
        AtCommandKind::Multiline => true,
        AtCommandKind::Default | AtCommandKind::Binary | AtCommandKind::Dial | AtCommandKind::NoResponse => {
            true
        }
    }
}

/// Accumulated response for a completed [`AtCommand`].
#[derive(Debug, Clone, Default)]
pub struct AtResponse {
    pub success: bool,
    pub final_status: String,
    pub lines: Vec<String>,
    pub binary: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_is_success() {
        assert_eq!(classify_status("OK", false), Some(AtStatus::Ok));
    }

    #[test]
    fn cms_error_is_terminal() {
        assert_eq!(
            classify_status("+CMS ERROR: 321", false),
            Some(AtStatus::Error("+CMS ERROR: 321".into()))
        );
    }

    #[test]
    fn connect_only_terminal_for_dial() {
        assert_eq!(classify_status("CONNECT", false), None);
        assert_eq!(classify_status("CONNECT", true), Some(AtStatus::Connect));
    }

    #[test]
    fn no_prefix_ejects_unsolicited_lines() {
        assert!(!accepts_line(AtCommandKind::NoPrefix, None, "+CREG: 1"));
        assert!(accepts_line(AtCommandKind::NoPrefix, None, "hello"));
    }

    #[test]
    fn numeric_accepts_digit_leading_lines() {
        assert!(accepts_line(AtCommandKind::Numeric, None, "42"));
        assert!(!accepts_line(AtCommandKind::Numeric, None, "+CREG: 1"));
    }
}
