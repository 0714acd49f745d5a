// SPDX-License-Identifier: AGPL-3.0-or-later

//! Derives the user-visible connectivity indicator from connection state
//! transitions. Purely observational; nothing here feeds back into the core.

use crate::peer::ConnectionState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

/// The tri-state indicator shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    Connected,
    Reconnecting,
    Idle,
}

impl From<ConnectionState> for SyncStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connected => Self::Connected,
            ConnectionState::Connecting | ConnectionState::Reconnecting => Self::Reconnecting,
            ConnectionState::Disabled => Self::Idle,
        }
    }
}

/// Consumes status values to render them somewhere, e.g. a status bar.
#[async_trait]
pub trait StatusDisplay: Send {
    async fn render(&mut self, status: SyncStatus);
}

/// Forwards connection state changes to the display until the connection
/// actor goes away. Consecutive duplicates are dropped, since several
/// connection states map onto the same indicator.
pub async fn report(
    mut state_rx: watch::Receiver<ConnectionState>,
    mut display: impl StatusDisplay,
) {
    let mut last_rendered = None;
    loop {
        let status = SyncStatus::from(*state_rx.borrow_and_update());
        if last_rendered != Some(status) {
            display.render(status).await;
            last_rendered = Some(status);
        }
        if state_rx.changed().await.is_err() {
            break;
        }
    }
    debug!("Status reporter has shut down");
}
