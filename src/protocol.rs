// SPDX-License-Identifier: AGPL-3.0-or-later

//! The wire protocol exchanged between the two peers.
//!
//! One [`SyncMessage`] per text frame, encoded as a flat JSON object. The two
//! front-end implementations evolve independently, so decoding is lenient
//! about fields a peer might not send yet.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifies which of the two front-ends a message originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerRole {
    PeerA,
    PeerB,
    /// Sent by a peer implementation that predates the `source` field.
    /// Never equal to either session role, so such messages pass the
    /// self-echo check and are arbitrated on `isActive` alone.
    #[default]
    #[serde(other)]
    Unknown,
}

impl PeerRole {
    /// The token the dialing peer puts in the WebSocket request path to
    /// identify itself during the handshake.
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::PeerA => "peer-a",
            Self::PeerB => "peer-b",
            Self::Unknown => "unknown",
        }
    }

    /// The role at the other end of the connection.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::PeerA => Self::PeerB,
            Self::PeerB => Self::PeerA,
            Self::Unknown => Self::Unknown,
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.token())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncAction {
    /// "Move/open to this position."
    Select,
    /// "This file was closed." `line`/`column` are placeholders.
    Close,
}

/// The flat record both peers exchange verbatim.
///
/// `line` and `column` are zero-based and only meaningful together with
/// `file_path` for [`SyncAction::Select`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub file_path: String,
    pub line: u32,
    pub column: u32,
    #[serde(default)]
    pub source: PeerRole,
    #[serde(default)]
    pub is_active: bool,
    pub action: SyncAction,
}

#[derive(Debug, Error)]
#[error("malformed sync message: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

impl SyncMessage {
    #[must_use]
    pub fn select(
        file_path: String,
        line: u32,
        column: u32,
        source: PeerRole,
        is_active: bool,
    ) -> Self {
        Self {
            file_path,
            line,
            column,
            source,
            is_active,
            action: SyncAction::Select,
        }
    }

    #[must_use]
    pub fn close(file_path: String, source: PeerRole, is_active: bool) -> Self {
        Self {
            file_path,
            line: 0,
            column: 0,
            source,
            is_active,
            action: SyncAction::Close,
        }
    }

    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("SyncMessage serialization should never fail")
    }

    /// Rejects frames missing `filePath`, `line`, `column` or `action`.
    /// A missing `source` or `isActive` decodes to "unknown peer" / `false`.
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(frame)?)
    }
}

#[cfg(test)]
mod test_serde {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn full_frame() {
        let message = SyncMessage::decode(
            r#"{"filePath":"/x.py","line":10,"column":4,"source":"peerA","isActive":true,"action":"select"}"#,
        );
        assert_eq!(
            message.unwrap(),
            SyncMessage::select("/x.py".to_string(), 10, 4, PeerRole::PeerA, true)
        );
    }

    #[test]
    fn missing_source_and_activation_get_defaults() {
        let message =
            SyncMessage::decode(r#"{"filePath":"/x.py","line":1,"column":2,"action":"select"}"#)
                .unwrap();
        assert_eq!(message.source, PeerRole::Unknown);
        assert!(!message.is_active);
    }

    #[test]
    fn unrecognized_source_is_treated_as_unknown() {
        let message = SyncMessage::decode(
            r#"{"filePath":"/x.py","line":1,"column":2,"source":"peerC","isActive":true,"action":"select"}"#,
        )
        .unwrap();
        assert_eq!(message.source, PeerRole::Unknown);
    }

    #[test]
    fn missing_file_path_is_rejected() {
        assert!(SyncMessage::decode(r#"{"line":1,"column":2,"action":"select"}"#).is_err());
    }

    #[test]
    fn missing_action_is_rejected() {
        assert!(SyncMessage::decode(r#"{"filePath":"/x.py","line":1,"column":2}"#).is_err());
    }

    #[test]
    fn close_carries_placeholder_position() {
        let message = SyncMessage::close("/x.py".to_string(), PeerRole::PeerB, false);
        assert_eq!((message.line, message.column), (0, 0));
        assert_eq!(
            message.encode(),
            r#"{"filePath":"/x.py","line":0,"column":0,"source":"peerB","isActive":false,"action":"close"}"#
        );
    }

    #[test]
    fn encode_decode_is_stable() {
        let message = SyncMessage::select("/a/b.rs".to_string(), 3, 7, PeerRole::PeerB, true);
        assert_eq!(SyncMessage::decode(&message.encode()).unwrap(), message);
    }
}
