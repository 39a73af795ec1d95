//! Relay message formats.
//!
//! ```text
//! Inbound announcement:  __CONNECT__<name>
//! Inbound chat line:     <text>
//! Outbound chat line:    <name> : <text>
//! Outbound notice:       <name> connected.
//! ```

use bytes::{BufMut, Bytes, BytesMut};

/// Marker that opens a connect-announcement.
pub const CONNECT_MARKER: &str = "__CONNECT__";

/// Name given to a session whose first message was not an announcement.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Classified inbound message.
///
/// Payloads stay raw bytes: the relay forwards chat exactly as received,
/// whatever the sender's encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// Identity assertion carrying the chosen display name.
    Announce(&'a [u8]),
    /// Ordinary chat text.
    Chat(&'a [u8]),
}

impl<'a> Inbound<'a> {
    /// Classify a received message. The name is taken verbatim: no trimming
    /// and no validation, so `__CONNECT__` alone announces an empty name.
    pub fn parse(frame: &'a [u8]) -> Self {
        match frame.strip_prefix(CONNECT_MARKER.as_bytes()) {
            Some(name) => Inbound::Announce(name),
            None => Inbound::Chat(frame),
        }
    }
}

/// The announcement a client sends for `name`.
pub fn announcement(name: &str) -> Bytes {
    Bytes::from(format!("{CONNECT_MARKER}{name}"))
}

/// A chat line as broadcast to the other participants.
pub fn chat_line(name: &str, text: &[u8]) -> Bytes {
    let mut line = BytesMut::with_capacity(name.len() + 3 + text.len());
    line.put_slice(name.as_bytes());
    line.put_slice(b" : ");
    line.put_slice(text);
    line.freeze()
}

pub fn connect_notice(name: &str) -> Bytes {
    Bytes::from(format!("{name} connected."))
}

pub fn disconnect_notice(name: &str) -> Bytes {
    Bytes::from(format!("{name} disconnected."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_announcement() {
        assert_eq!(
            Inbound::parse(b"__CONNECT__Alice"),
            Inbound::Announce(b"Alice")
        );
    }

    #[test]
    fn test_parse_empty_name_is_accepted() {
        assert_eq!(Inbound::parse(b"__CONNECT__"), Inbound::Announce(b""));
    }

    #[test]
    fn test_parse_chat() {
        assert_eq!(Inbound::parse(b"hello"), Inbound::Chat(b"hello"));
        // The marker only counts at the very start.
        assert_eq!(
            Inbound::parse(b" __CONNECT__Bob"),
            Inbound::Chat(b" __CONNECT__Bob")
        );
    }

    #[test]
    fn test_name_is_not_trimmed() {
        assert_eq!(
            Inbound::parse(b"__CONNECT__ Bob \n"),
            Inbound::Announce(b" Bob \n")
        );
    }

    #[test]
    fn test_non_utf8_chat_is_kept() {
        assert_eq!(Inbound::parse(b"caf\xC3"), Inbound::Chat(b"caf\xC3"));
        assert_eq!(chat_line("Alice", b"\xA9"), &b"Alice : \xA9"[..]);
    }

    #[test]
    fn test_outbound_formats() {
        assert_eq!(chat_line("Alice", b"hello"), "Alice : hello");
        assert_eq!(connect_notice("Alice"), "Alice connected.");
        assert_eq!(disconnect_notice("Alice"), "Alice disconnected.");
        assert_eq!(announcement("Bob"), "__CONNECT__Bob");
    }
}
