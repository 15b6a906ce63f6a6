//! Serial wire protocol spoken with the keypad.
//!
//! Every message is one newline-terminated ASCII line of colon separated
//! fields, `COMMAND[:ARG]*`. Parsing inbound lines never fails: anything the
//! host does not understand is surfaced as [`InboundCommand::Status`] so the
//! caller can log it.

use std::fmt;

use crate::types::{BadgeUid, KeySlot, SlotKind};

/// A message received from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundCommand {
    /// `APP_LAUNCH:<key>`
    AppLaunch(KeySlot),
    /// `PASS_LAUNCH:<key>`
    PassLaunch(KeySlot),
    /// `RFID_UNLOCK_OK`: the device matched a badge on its own.
    RfidUnlockOk,
    /// `RFID_UNLOCK_FAIL`
    RfidUnlockFail,
    /// `RFID_READ:<uid>`: raw badge scan for the host to authorize.
    RfidRead(BadgeUid),
    /// Any other line, kept verbatim.
    Status(String),
}

impl InboundCommand {
    /// Parse one line as read from the link.
    ///
    /// Returns `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let (command, arg) = match line.split_once(':') {
            Some((command, arg)) => (command, Some(arg)),
            None => (line, None),
        };

        let parsed = match (command, arg) {
            ("APP_LAUNCH", Some(key)) => key.parse().ok().map(InboundCommand::AppLaunch),
            ("PASS_LAUNCH", Some(key)) => key.parse().ok().map(InboundCommand::PassLaunch),
            ("RFID_UNLOCK_OK", None) => Some(InboundCommand::RfidUnlockOk),
            ("RFID_UNLOCK_FAIL", None) => Some(InboundCommand::RfidUnlockFail),
            ("RFID_READ", Some(uid)) => BadgeUid::parse(uid).ok().map(InboundCommand::RfidRead),
            _ => None,
        };

        Some(parsed.unwrap_or_else(|| InboundCommand::Status(line.to_string())))
    }
}

/// A message sent to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCommand {
    /// `LABEL_APP:<key>:<name>` or `LABEL_PASS:<key>:<name>`
    Label {
        kind: SlotKind,
        key: KeySlot,
        name: String,
    },
    /// `AUTH_OK`
    AuthOk,
    /// `AUTH_FAIL`
    AuthFail,
    /// `ICON_START:<kind>:<key>:<byte count>`
    IconStart {
        kind: SlotKind,
        key: KeySlot,
        byte_count: usize,
    },
    /// `ICON_DATA:<HEX>`, one chunk of the bitmap.
    IconData(Vec<u8>),
    /// `ICON_END`
    IconEnd,
}

impl OutboundCommand {
    /// The line without its terminator.
    pub fn encode(&self) -> String {
        match self {
            OutboundCommand::Label { kind, key, name } => {
                let command = match kind {
                    SlotKind::App => "LABEL_APP",
                    SlotKind::Pass => "LABEL_PASS",
                };
                format!("{}:{}:{}", command, key, sanitize_field(name))
            }
            OutboundCommand::AuthOk => "AUTH_OK".to_string(),
            OutboundCommand::AuthFail => "AUTH_FAIL".to_string(),
            OutboundCommand::IconStart {
                kind,
                key,
                byte_count,
            } => format!("ICON_START:{}:{}:{}", kind.wire_name(), key, byte_count),
            OutboundCommand::IconData(chunk) => {
                format!("ICON_DATA:{}", hex::encode_upper(chunk))
            }
            OutboundCommand::IconEnd => "ICON_END".to_string(),
        }
    }

    /// The line including the trailing newline, ready to write.
    pub fn to_line(&self) -> String {
        let mut line = self.encode();
        line.push('\n');
        line
    }
}

impl fmt::Display for OutboundCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Chunks are long and uninteresting in logs.
            OutboundCommand::IconData(chunk) => write!(f, "ICON_DATA:<{} bytes>", chunk.len()),
            other => f.write_str(&other.encode()),
        }
    }
}

/// Replace line terminators so a field can never split a frame.
fn sanitize_field(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(c: char) -> KeySlot {
        KeySlot::new(c).unwrap()
    }

    #[test]
    fn parse_launch_commands() {
        assert_eq!(
            InboundCommand::parse("APP_LAUNCH:A\r\n"),
            Some(InboundCommand::AppLaunch(key('A')))
        );
        assert_eq!(
            InboundCommand::parse("PASS_LAUNCH:#"),
            Some(InboundCommand::PassLaunch(key('#')))
        );
    }

    #[test]
    fn parse_rfid_commands() {
        assert_eq!(
            InboundCommand::parse("RFID_UNLOCK_OK"),
            Some(InboundCommand::RfidUnlockOk)
        );
        assert_eq!(
            InboundCommand::parse("RFID_UNLOCK_FAIL"),
            Some(InboundCommand::RfidUnlockFail)
        );
        assert_eq!(
            InboundCommand::parse("RFID_READ:52a77a5c"),
            Some(InboundCommand::RfidRead(BadgeUid::parse("52A77A5C").unwrap()))
        );
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(InboundCommand::parse(""), None);
        assert_eq!(InboundCommand::parse("  \r"), None);
    }

    #[test]
    fn unknown_lines_become_status() {
        assert_eq!(
            InboundCommand::parse("Keypad ready"),
            Some(InboundCommand::Status("Keypad ready".to_string()))
        );
        assert_eq!(
            InboundCommand::parse("APP_LAUNCH:Z"),
            Some(InboundCommand::Status("APP_LAUNCH:Z".to_string()))
        );
        assert_eq!(
            InboundCommand::parse("RFID_READ:"),
            Some(InboundCommand::Status("RFID_READ:".to_string()))
        );
        assert_eq!(
            InboundCommand::parse("RFID_UNLOCK_OK:extra"),
            Some(InboundCommand::Status("RFID_UNLOCK_OK:extra".to_string()))
        );
    }

    #[test]
    fn encode_labels() {
        let cmd = OutboundCommand::Label {
            kind: SlotKind::App,
            key: key('B'),
            name: "Browser".to_string(),
        };
        assert_eq!(cmd.encode(), "LABEL_APP:B:Browser");

        let cmd = OutboundCommand::Label {
            kind: SlotKind::Pass,
            key: key('3'),
            name: "Mail".to_string(),
        };
        assert_eq!(cmd.to_line(), "LABEL_PASS:3:Mail\n");
    }

    #[test]
    fn labels_cannot_break_framing() {
        let cmd = OutboundCommand::Label {
            kind: SlotKind::App,
            key: key('A'),
            name: "two\r\nlines".to_string(),
        };
        assert_eq!(cmd.encode(), "LABEL_APP:A:two  lines");
    }

    #[test]
    fn encode_icon_frames() {
        let start = OutboundCommand::IconStart {
            kind: SlotKind::Pass,
            key: key('C'),
            byte_count: 2048,
        };
        assert_eq!(start.encode(), "ICON_START:pass:C:2048");
        assert_eq!(
            OutboundCommand::IconData(vec![0x00, 0xab, 0xff]).encode(),
            "ICON_DATA:00ABFF"
        );
        assert_eq!(OutboundCommand::IconEnd.encode(), "ICON_END");
    }

    #[test]
    fn display_hides_icon_data() {
        let data = OutboundCommand::IconData(vec![0u8; 32]);
        assert_eq!(data.to_string(), "ICON_DATA:<32 bytes>");
        assert_eq!(OutboundCommand::AuthOk.to_string(), "AUTH_OK");
    }
}
