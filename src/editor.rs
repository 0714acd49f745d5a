// SPDX-License-Identifier: AGPL-3.0-or-later

//! This module is all about daemon to editor-plugin communication.
//!
//! The plugin connects over a Unix domain socket and speaks the
//! newline-delimited JSON protocol of [`crate::editor_protocol`]. Only one
//! plugin connection is active at a time; a new one replaces the old one.

use crate::daemon::DaemonMessage;
use crate::editor_protocol::{MessageFromPlugin, MessageToPlugin};
use crate::status::{StatusDisplay, SyncStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::WriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::{
    bytes::BytesMut,
    codec::{Encoder, FramedRead, FramedWrite, LinesCodec},
};
use tracing::{info, warn};

/// Moves/opens the local editor in reaction to an accepted remote update.
///
/// Failures (e.g. the file does not exist) are reported as errors, never
/// thrown into the session's control flow.
#[async_trait]
pub trait EditorControl: Send {
    /// Open the file if needed, move the caret, scroll into view if the
    /// position is not already visible.
    async fn apply_select(&mut self, path: &str, line: u32, column: u32) -> Result<()>;
    /// Close the tab for the path without activating it. Missing tab is a
    /// no-op on the plugin side.
    async fn close_file(&mut self, path: &str) -> Result<()>;
}

/// Distinguishes successive plugin connections, so a stale connection's
/// disconnect cannot tear down its replacement.
pub type PluginId = usize;

pub struct PluginCodec;

impl Encoder<MessageToPlugin> for PluginCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: MessageToPlugin, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.to_json()?;
        dst.extend_from_slice(format!("{payload}\n").as_bytes());
        Ok(())
    }
}

pub type PluginWriter = FramedWrite<WriteHalf<UnixStream>, PluginCodec>;

/// Implements [`EditorControl`] and [`StatusDisplay`] by routing commands
/// through the daemon actor, which owns the live plugin connection.
///
/// The plugin applies selects asynchronously on the editor side, so it must
/// suppress the resulting echo itself; the daemon's echo guard cannot see it
/// (see [`crate::guard`]).
#[derive(Clone)]
pub struct PluginHandle {
    daemon_tx: mpsc::Sender<DaemonMessage>,
}

impl PluginHandle {
    #[must_use]
    pub fn new(daemon_tx: mpsc::Sender<DaemonMessage>) -> Self {
        Self { daemon_tx }
    }

    async fn forward(&self, message: MessageToPlugin) -> Result<()> {
        self.daemon_tx
            .send(DaemonMessage::ToPlugin(message))
            .await
            .context("Daemon actor is gone")
    }
}

#[async_trait]
impl EditorControl for PluginHandle {
    async fn apply_select(&mut self, path: &str, line: u32, column: u32) -> Result<()> {
        self.forward(MessageToPlugin::Select {
            path: path.to_string(),
            line,
            column,
        })
        .await
    }

    async fn close_file(&mut self, path: &str) -> Result<()> {
        self.forward(MessageToPlugin::Close {
            path: path.to_string(),
        })
        .await
    }
}

#[async_trait]
impl StatusDisplay for PluginHandle {
    async fn render(&mut self, status: SyncStatus) {
        let _ = self.forward(MessageToPlugin::Status { status }).await;
    }
}

/// # Panics
///
/// Will panic if we fail to listen on the socket, or if we fail to accept an
/// incoming connection.
pub async fn make_plugin_connection(socket_path: PathBuf, daemon_tx: mpsc::Sender<DaemonMessage>) {
    if socket_path.exists() {
        std::fs::remove_file(&socket_path).expect("Could not remove stale socket");
    }
    let result = accept_plugin_loop(&socket_path, daemon_tx).await;
    match result {
        Ok(()) => {}
        Err(err) => {
            panic!("Failed to make plugin connection: {err}");
        }
    }
}

async fn accept_plugin_loop(
    socket_path: &Path,
    daemon_tx: mpsc::Sender<DaemonMessage>,
) -> Result<(), io::Error> {
    let listener = UnixListener::bind(socket_path)?;
    info!("Listening on UNIX socket: {}", socket_path.display());

    let mut next_id: PluginId = 0;
    loop {
        let (stream, _addr) = listener.accept().await?;

        spawn_plugin_connection(stream, daemon_tx.clone(), next_id);
        next_id += 1;
    }
}

fn spawn_plugin_connection(
    stream: UnixStream,
    daemon_tx: mpsc::Sender<DaemonMessage>,
    plugin_id: PluginId,
) {
    tokio::spawn(async move {
        let (stream_read, stream_write) = tokio::io::split(stream);
        let mut reader = FramedRead::new(stream_read, LinesCodec::new());
        let writer = FramedWrite::new(stream_write, PluginCodec);

        let _ = daemon_tx
            .send(DaemonMessage::NewPluginConnection(plugin_id, writer))
            .await;
        info!("Editor plugin #{plugin_id} connected");

        while let Some(Ok(line)) = reader.next().await {
            match MessageFromPlugin::from_json(&line) {
                Ok(message) => {
                    let _ = daemon_tx.send(DaemonMessage::FromPlugin(message)).await;
                }
                Err(err) => {
                    warn!("Ignoring malformed plugin message: {err}");
                }
            }
        }

        let _ = daemon_tx
            .send(DaemonMessage::ClosePluginConnection(plugin_id))
            .await;
        info!("Editor plugin #{plugin_id} disconnected");
    });
}
