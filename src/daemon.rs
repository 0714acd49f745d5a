// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wires everything together: owns the enable/disable toggle, the live
//! plugin connection, and the currently running [`Session`], if any.

use crate::editor::{self, PluginHandle, PluginId, PluginWriter};
use crate::editor_protocol::{MessageFromPlugin, MessageToPlugin};
use crate::peer::{ConnectionState, TransportRole};
use crate::protocol::PeerRole;
use crate::session::{EditorEvent, Session};
use crate::status::{self, SyncStatus};
use futures::SinkExt;
use std::fmt;
use std::path::Path;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// These messages are sent to the task that owns the plugin connection and
/// the session.
pub enum DaemonMessage {
    NewPluginConnection(PluginId, PluginWriter),
    ClosePluginConnection(PluginId),
    FromPlugin(MessageFromPlugin),
    ToPlugin(MessageToPlugin),
}

impl fmt::Debug for DaemonMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let repr = match self {
            Self::NewPluginConnection(id, _) => format!("plugin #{id} connected"),
            Self::ClosePluginConnection(id) => format!("plugin #{id} disconnected"),
            Self::FromPlugin(message) => format!("from plugin: {message:?}"),
            Self::ToPlugin(message) => format!("to plugin: {message:?}"),
        };
        write!(f, "{repr}")
    }
}

struct DaemonActor {
    message_rx: mpsc::Receiver<DaemonMessage>,
    message_tx: mpsc::Sender<DaemonMessage>,
    plugin: Option<(PluginId, PluginWriter)>,
    session: Option<Session>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    role: PeerRole,
    host: String,
    port: u16,
}

impl DaemonActor {
    fn enable(&mut self) {
        if self.session.is_some() {
            debug!("Sync is already enabled");
            return;
        }
        let control = Box::new(PluginHandle::new(self.message_tx.clone()));
        let transport = match self.role {
            PeerRole::PeerB => TransportRole::Dial {
                host: self.host.clone(),
            },
            // The first role listens. `Unknown` is never a session role.
            _ => TransportRole::Listen,
        };
        let session = Session::new(self.role, transport, self.port, control);

        let state_rx = session.state();
        // Forward connectivity changes to the plugin's status indicator.
        {
            let display = PluginHandle::new(self.message_tx.clone());
            let state_rx = state_rx.clone();
            tokio::spawn(async move {
                status::report(state_rx, display).await;
            });
        }

        self.state_rx = Some(state_rx);
        self.session = Some(session);
        info!("Sync enabled");
    }

    async fn disable(&mut self) {
        let Some(session) = self.session.take() else {
            debug!("Sync is already disabled");
            return;
        };
        self.state_rx = None;
        session.shutdown().await;
        info!("Sync disabled");
    }

    fn current_status(&self) -> SyncStatus {
        self.state_rx
            .as_ref()
            .map_or(SyncStatus::Idle, |state_rx| {
                SyncStatus::from(*state_rx.borrow())
            })
    }

    async fn handle_message(&mut self, message: DaemonMessage) {
        debug!("Handling daemon message: {message:?}");
        match message {
            DaemonMessage::NewPluginConnection(id, writer) => {
                if self.plugin.replace((id, writer)).is_some() {
                    info!("Replacing existing plugin connection");
                }
                // Let the new plugin render the indicator right away.
                let status = self.current_status();
                self.send_to_plugin(MessageToPlugin::Status { status }).await;
            }
            DaemonMessage::ClosePluginConnection(id) => {
                // A replaced connection's late disconnect must not tear down
                // the current one.
                if self.plugin.as_ref().is_some_and(|(current, _)| *current == id) {
                    self.plugin = None;
                }
            }
            DaemonMessage::ToPlugin(message) => {
                self.send_to_plugin(message).await;
            }
            DaemonMessage::FromPlugin(message) => {
                self.handle_plugin_message(message).await;
            }
        }
    }

    async fn handle_plugin_message(&mut self, message: MessageFromPlugin) {
        match message {
            MessageFromPlugin::Enable => self.enable(),
            MessageFromPlugin::Disable => self.disable().await,
            MessageFromPlugin::Configure { port } => {
                self.port = port;
                if let Some(session) = &self.session {
                    // The listener rebinds and the dialer redials, without
                    // a restart.
                    session.handle().set_port(port).await;
                }
            }
            MessageFromPlugin::Selection { path, line, column } => {
                self.forward_event(EditorEvent::Selection { path, line, column })
                    .await;
            }
            MessageFromPlugin::Focus { active } => {
                self.forward_event(EditorEvent::Focus { active }).await;
            }
            MessageFromPlugin::Closed { path } => {
                self.forward_event(EditorEvent::Closed { path }).await;
            }
        }
    }

    async fn forward_event(&self, event: EditorEvent) {
        if let Some(session) = &self.session {
            session.handle().editor_event(event).await;
        } else {
            debug!("Sync is disabled, ignoring editor event");
        }
    }

    async fn send_to_plugin(&mut self, message: MessageToPlugin) {
        if let Some((_, writer)) = self.plugin.as_mut() {
            if let Err(err) = writer.send(message).await {
                warn!("Failed to write to plugin, dropping the connection: {err:#}");
                self.plugin = None;
            }
        } else {
            debug!("No plugin connected, dropping message");
        }
    }

    async fn run(&mut self) {
        while let Some(message) = self.message_rx.recv().await {
            self.handle_message(message).await;
        }
        debug!("Channel towards daemon actor has been closed (probably shutting down)");
    }
}

pub struct Daemon {
    pub message_tx: mpsc::Sender<DaemonMessage>,
}

impl Daemon {
    // Launch the daemon. Optionally, start with sync already enabled.
    pub fn new(role: PeerRole, host: String, port: u16, socket_path: &Path, enabled: bool) -> Self {
        let (message_tx, message_rx) = mpsc::channel(16);

        let mut actor = DaemonActor {
            message_rx,
            message_tx: message_tx.clone(),
            plugin: None,
            session: None,
            state_rx: None,
            role,
            host,
            port,
        };
        if enabled {
            actor.enable();
        }
        tokio::spawn(async move { actor.run().await });

        {
            let socket_path = socket_path.to_path_buf();
            let message_tx = message_tx.clone();
            tokio::spawn(async move {
                editor::make_plugin_connection(socket_path, message_tx).await;
            });
        }

        Self { message_tx }
    }
}
