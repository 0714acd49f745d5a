// SPDX-License-Identifier: AGPL-3.0-or-later

//! This module provides a [`ConnectionManager`], which owns the transport to
//! the other front-end. One peer listens, the other dials; both share the
//! reconnect-with-backoff logic and never surface a transport error as fatal.

use crate::protocol::{PeerRole, SyncMessage};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Fixed backoff before retrying a failed or lost connection.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disabled,
    Connecting,
    Connected,
    Reconnecting,
}

/// Which end of the transport this peer is.
#[derive(Debug, Clone)]
pub enum TransportRole {
    /// Binds the configured port and accepts one inbound connection at a time.
    Listen,
    /// Repeatedly connects to `host:port`.
    Dial { host: String },
}

/// Sent from the connection actor to the session.
#[derive(Debug)]
pub enum PeerEvent {
    /// The transport is up. The session reacts by re-sending its last state.
    Connected,
    Message(SyncMessage),
}

enum ConnectionCommand {
    SetPort(u16),
    Shutdown,
}

// What made a connection attempt (or an established connection) end.
enum Exit {
    Disabled,
    Retry,
    PortChanged,
}

/// Seam between the session and the transport, so tests can substitute the wire.
#[async_trait]
pub trait PeerLink: Send {
    async fn send(&mut self, message: SyncMessage);
    async fn set_port(&mut self, port: u16);
    async fn shutdown(&mut self);
}

#[derive(Clone)]
pub struct ConnectionManager {
    command_tx: mpsc::Sender<ConnectionCommand>,
    outgoing_tx: mpsc::Sender<SyncMessage>,
    state_rx: watch::Receiver<ConnectionState>,
    bound_port_rx: watch::Receiver<u16>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(
        role: TransportRole,
        local: PeerRole,
        port: u16,
        event_tx: mpsc::Sender<PeerEvent>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(1);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (bound_port_tx, bound_port_rx) = watch::channel(0);

        let mut actor = ConnectionActor {
            role,
            local,
            port,
            event_tx,
            command_rx,
            outgoing_rx,
            state_tx,
            bound_port_tx,
        };
        tokio::spawn(async move { actor.run().await });

        Self {
            command_tx,
            outgoing_tx,
            state_rx,
            bound_port_rx,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// The port the listener actually bound. Stays at 0 until the first
    /// successful bind; useful when the configured port is 0 (OS-assigned).
    pub fn bound_port(&self) -> watch::Receiver<u16> {
        self.bound_port_rx.clone()
    }
}

#[async_trait]
impl PeerLink for ConnectionManager {
    async fn send(&mut self, message: SyncMessage) {
        // If the actor is gone, the session is shutting down anyway.
        let _ = self.outgoing_tx.send(message).await;
    }

    async fn set_port(&mut self, port: u16) {
        let _ = self.command_tx.send(ConnectionCommand::SetPort(port)).await;
    }

    async fn shutdown(&mut self) {
        let _ = self.command_tx.send(ConnectionCommand::Shutdown).await;
    }
}

struct ConnectionActor {
    role: TransportRole,
    local: PeerRole,
    port: u16,
    event_tx: mpsc::Sender<PeerEvent>,
    command_rx: mpsc::Receiver<ConnectionCommand>,
    outgoing_rx: mpsc::Receiver<SyncMessage>,
    state_tx: watch::Sender<ConnectionState>,
    bound_port_tx: watch::Sender<u16>,
}

impl ConnectionActor {
    async fn run(&mut self) {
        'actor: loop {
            self.set_state(ConnectionState::Connecting);
            let exit = match self.role.clone() {
                TransportRole::Listen => self.run_listener().await,
                TransportRole::Dial { host } => self.run_dialer(&host).await,
            };
            match exit {
                Exit::Disabled => {
                    self.set_state(ConnectionState::Disabled);
                    break;
                }
                Exit::PortChanged => {
                    // Rebind/redial immediately, no backoff.
                }
                Exit::Retry => {
                    self.set_state(ConnectionState::Reconnecting);
                    // One pending retry at a time, cancellable by disable.
                    // Outgoing messages arriving meanwhile are dropped, not
                    // queued; re-send-on-connect resynchronizes.
                    let backoff = sleep(RETRY_INTERVAL);
                    tokio::pin!(backoff);
                    loop {
                        tokio::select! {
                            () = &mut backoff => break,
                            Some(_message) = self.outgoing_rx.recv() => {
                                debug!("Not connected, dropping outgoing message");
                            }
                            command = self.command_rx.recv() => match command {
                                Some(ConnectionCommand::SetPort(port)) => {
                                    self.port = port;
                                    break;
                                }
                                Some(ConnectionCommand::Shutdown) | None => {
                                    self.set_state(ConnectionState::Disabled);
                                    break 'actor;
                                }
                            }
                        }
                    }
                }
            }
        }
        debug!("Connection actor has shut down");
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    async fn announce_connected(&mut self) {
        // Anything still queued was sent while disconnected and must not
        // reach the fresh connection.
        while self.outgoing_rx.try_recv().is_ok() {}
        self.set_state(ConnectionState::Connected);
        let _ = self.event_tx.send(PeerEvent::Connected).await;
    }

    async fn forward_frame(&self, frame: &str) {
        match SyncMessage::decode(frame) {
            Ok(message) => {
                let _ = self.event_tx.send(PeerEvent::Message(message)).await;
            }
            Err(err) => {
                // Local-only failure; the connection stays up.
                warn!("Dropping malformed message from peer: {err}");
            }
        }
    }

    async fn run_listener(&mut self) -> Exit {
        let listener = match TcpListener::bind(("0.0.0.0", self.port)).await {
            Ok(listener) => listener,
            Err(err) => {
                // Covers "port already in use", e.g. right after a port change
                // while the old listener is still draining.
                warn!("Failed to bind port {}: {err}", self.port);
                return Exit::Retry;
            }
        };
        if let Ok(addr) = listener.local_addr() {
            info!("Listening for the other front-end on port {}", addr.port());
            let _ = self.bound_port_tx.send(addr.port());
        }

        let mut connection: Option<WebSocketStream<TcpStream>> = None;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            match accept_peer(stream, self.local.other()).await {
                                Ok(new_connection) => {
                                    if let Some(mut old) = connection.take() {
                                        info!("Replacing existing inbound connection");
                                        self.set_state(ConnectionState::Reconnecting);
                                        let _ = old.close(None).await;
                                    }
                                    info!("Peer connected from {addr}");
                                    connection = Some(new_connection);
                                    self.announce_connected().await;
                                }
                                Err(err) => {
                                    warn!("Rejected inbound connection from {addr}: {err:#}");
                                }
                            }
                        }
                        Err(err) => {
                            warn!("Failed to accept inbound connection: {err}");
                            return Exit::Retry;
                        }
                    }
                }
                message = next_frame(&mut connection), if connection.is_some() => {
                    match message {
                        Some(Ok(Message::Text(frame))) => {
                            self.forward_frame(frame.as_str()).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Peer disconnected");
                            connection = None;
                            self.set_state(ConnectionState::Reconnecting);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!("Transport error: {err}");
                            connection = None;
                            self.set_state(ConnectionState::Reconnecting);
                        }
                    }
                }
                Some(message) = self.outgoing_rx.recv() => {
                    if let Some(ws) = connection.as_mut() {
                        if let Err(err) = ws.send(Message::text(message.encode())).await {
                            warn!("Failed to send to peer: {err}");
                            connection = None;
                            self.set_state(ConnectionState::Reconnecting);
                        }
                    } else {
                        debug!("Not connected, dropping outgoing message");
                    }
                }
                command = self.command_rx.recv() => {
                    if let Some(mut ws) = connection.take() {
                        let _ = ws.close(None).await;
                    }
                    match command {
                        Some(ConnectionCommand::SetPort(port)) => {
                            self.port = port;
                            return Exit::PortChanged;
                        }
                        Some(ConnectionCommand::Shutdown) | None => return Exit::Disabled,
                    }
                }
            }
        }
    }

    async fn run_dialer(&mut self, host: &str) -> Exit {
        let url = format!("ws://{}:{}/{}", host, self.port, self.local.token());
        let connect = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(url.as_str()),
        );
        tokio::pin!(connect);
        let connection = loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok(Ok((connection, _response))) => break connection,
                    Ok(Err(err)) => {
                        debug!("Failed to connect to {url}: {err}");
                        return Exit::Retry;
                    }
                    Err(_elapsed) => {
                        debug!("Connection attempt to {url} timed out");
                        return Exit::Retry;
                    }
                },
                // Not connected yet; outgoing messages are dropped, not queued.
                Some(_message) = self.outgoing_rx.recv() => {
                    debug!("Not connected, dropping outgoing message");
                }
                // A connect attempt in flight must stay cancellable.
                command = self.command_rx.recv() => match command {
                    Some(ConnectionCommand::SetPort(port)) => {
                        self.port = port;
                        return Exit::PortChanged;
                    }
                    Some(ConnectionCommand::Shutdown) | None => return Exit::Disabled,
                },
            }
        };

        info!("Connected to the other front-end at {host}:{}", self.port);
        self.announce_connected().await;
        self.pump(connection).await
    }

    // Runs an established connection until it ends, one way or another.
    async fn pump<S>(&mut self, mut connection: WebSocketStream<S>) -> Exit
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                message = connection.next() => {
                    match message {
                        Some(Ok(Message::Text(frame))) => {
                            self.forward_frame(frame.as_str()).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Peer closed the connection");
                            return Exit::Retry;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!("Transport error: {err}");
                            return Exit::Retry;
                        }
                    }
                }
                Some(message) = self.outgoing_rx.recv() => {
                    if let Err(err) = connection.send(Message::text(message.encode())).await {
                        warn!("Failed to send to peer: {err}");
                        return Exit::Retry;
                    }
                }
                command = self.command_rx.recv() => {
                    let _ = connection.close(None).await;
                    match command {
                        Some(ConnectionCommand::SetPort(port)) => {
                            self.port = port;
                            return Exit::PortChanged;
                        }
                        Some(ConnectionCommand::Shutdown) | None => return Exit::Disabled,
                    }
                }
            }
        }
    }
}

async fn next_frame(
    connection: &mut Option<WebSocketStream<TcpStream>>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    connection
        .as_mut()
        .expect("next_frame is only polled while a connection exists")
        .next()
        .await
}

// The connecting peer identifies itself through the request path; anything
// other than the expected role token is rejected and the connection closed.
async fn accept_peer(
    stream: TcpStream,
    expected: PeerRole,
) -> anyhow::Result<WebSocketStream<TcpStream>> {
    let expected_path = format!("/{}", expected.token());
    let check_role = move |request: &Request, response: Response| {
        if request.uri().path() == expected_path {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(Some("unexpected peer role".to_string()));
            *rejection.status_mut() = StatusCode::FORBIDDEN;
            Err(rejection)
        }
    };
    Ok(tokio_tungstenite::accept_hdr_async(stream, check_role).await?)
}
