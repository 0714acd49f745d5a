// SPDX-License-Identifier: AGPL-3.0-or-later

//! Messages exchanged with the local editor plugin over the Unix socket,
//! one JSON object per line.

use crate::status::SyncStatus;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// What the plugin reports to the daemon: local, user-driven changes and the
/// configuration surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum MessageFromPlugin {
    /// The caret moved, or the active file changed.
    Selection { path: String, line: u32, column: u32 },
    /// The editor window gained or lost OS input focus.
    Focus { active: bool },
    /// A file tab was closed.
    Closed { path: String },
    /// Turn synchronization on. Idempotent.
    Enable,
    /// Turn synchronization off. Idempotent.
    Disable,
    /// Change the configured port while running.
    Configure { port: u16 },
}

/// What the daemon asks the plugin to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum MessageToPlugin {
    /// Open the file (no duplicate editor if already open), move the caret,
    /// scroll into view only if the position is not already visible.
    Select { path: String, line: u32, column: u32 },
    /// Close the tab for the path without activating it. A missing or
    /// already-closed tab is a no-op, not an error.
    Close { path: String },
    /// The connectivity indicator changed.
    Status { status: SyncStatus },
}

impl MessageFromPlugin {
    pub fn from_json(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

impl MessageToPlugin {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod test_serde {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn selection() {
        let message = MessageFromPlugin::from_json(
            r#"{"method":"selection","params":{"path":"/x.py","line":10,"column":4}}"#,
        );
        assert_eq!(
            message.unwrap(),
            MessageFromPlugin::Selection {
                path: "/x.py".to_string(),
                line: 10,
                column: 4,
            }
        );
    }

    #[test]
    fn enable_has_no_params() {
        let message = MessageFromPlugin::from_json(r#"{"method":"enable"}"#);
        assert_eq!(message.unwrap(), MessageFromPlugin::Enable);
    }

    #[test]
    fn configure() {
        let message = MessageFromPlugin::from_json(r#"{"method":"configure","params":{"port":3001}}"#);
        assert_eq!(message.unwrap(), MessageFromPlugin::Configure { port: 3001 });
    }

    #[test]
    fn unknown_method_is_rejected() {
        assert!(MessageFromPlugin::from_json(r#"{"method":"teleport"}"#).is_err());
    }

    #[test]
    fn select() {
        let message = MessageToPlugin::Select {
            path: "/x.py".to_string(),
            line: 10,
            column: 4,
        };
        assert_eq!(
            message.to_json().unwrap(),
            r#"{"method":"select","params":{"path":"/x.py","line":10,"column":4}}"#
        );
    }

    #[test]
    fn status() {
        let message = MessageToPlugin::Status {
            status: SyncStatus::Reconnecting,
        };
        assert_eq!(
            message.to_json().unwrap(),
            r#"{"method":"status","params":{"status":"reconnecting"}}"#
        );
    }
}
