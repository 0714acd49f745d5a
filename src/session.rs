// SPDX-License-Identifier: AGPL-3.0-or-later

//! The sync session: decides which cursor updates travel between the two
//! front-ends, and which received updates get applied locally.
//!
//! All state mutation is serialized through one actor task, so "apply an
//! incoming update" can never race with "observe a local event and send".

use crate::editor::EditorControl;
use crate::guard::EchoGuard;
use crate::peer::{ConnectionManager, ConnectionState, PeerEvent, PeerLink, TransportRole};
use crate::protocol::{PeerRole, SyncAction, SyncMessage};
use std::ops::ControlFlow;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// A local, user-driven change reported by the editor observation side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorEvent {
    Selection {
        path: String,
        line: u32,
        column: u32,
    },
    Focus {
        active: bool,
    },
    Closed {
        path: String,
    },
}

/// What an accepted remote update asks the local editor to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyAction {
    Select {
        path: String,
        line: u32,
        column: u32,
    },
    Close {
        path: String,
    },
}

// Last-active-wins arbitration: only the focused peer's cursor moves carry
// authority; file closes always do.
struct Arbiter {
    role: PeerRole,
    active: bool,
    last_state: Option<SyncMessage>,
}

impl Arbiter {
    fn new(role: PeerRole) -> Self {
        Self {
            role,
            // The front-end that just enabled sync is the one being used.
            active: true,
            last_state: None,
        }
    }

    /// Decides whether a locally observed event gets transmitted.
    fn on_editor_event(&mut self, event: EditorEvent) -> Option<SyncMessage> {
        match event {
            EditorEvent::Selection { path, line, column } => {
                let message = SyncMessage::select(path, line, column, self.role, self.active);
                // Retained even while inactive, for the focus-gain re-broadcast.
                self.last_state = Some(message.clone());
                self.active.then_some(message)
            }
            EditorEvent::Closed { path } => {
                // A file close is an unconditional fact, not a cursor preference.
                let message = SyncMessage::close(path, self.role, self.active);
                self.last_state = Some(message.clone());
                Some(message)
            }
            EditorEvent::Focus { active } => {
                if self.active == active {
                    return None;
                }
                self.active = active;
                // Re-send the last state with the updated flag, so the remote
                // arbitration re-evaluates now instead of on the next move.
                let mut message = self.last_state.clone()?;
                message.is_active = active;
                self.last_state = Some(message.clone());
                Some(message)
            }
        }
    }

    /// Decides whether a received message gets applied locally.
    fn on_peer_message(&self, message: SyncMessage) -> Option<ApplyAction> {
        if message.source == self.role {
            // Should not occur with correctly scoped roles, but a peer must
            // never act on its own messages.
            debug!("Discarding message that originated from ourselves");
            return None;
        }
        match message.action {
            SyncAction::Close => Some(ApplyAction::Close {
                path: message.file_path,
            }),
            SyncAction::Select => {
                if message.is_active {
                    Some(ApplyAction::Select {
                        path: message.file_path,
                        line: message.line,
                        column: message.column,
                    })
                } else {
                    debug!("Ignoring cursor update from inactive peer");
                    None
                }
            }
        }
    }

    fn last_state(&self) -> Option<SyncMessage> {
        self.last_state.clone()
    }
}

enum SessionMessage {
    FromEditor(EditorEvent),
    FromPeer(PeerEvent),
    SetPort(u16),
    Shutdown,
}

struct SessionActor {
    arbiter: Arbiter,
    guard: EchoGuard,
    link: Box<dyn PeerLink>,
    control: Box<dyn EditorControl>,
    message_rx: mpsc::Receiver<SessionMessage>,
}

impl SessionActor {
    async fn run(mut self) {
        while let Some(message) = self.message_rx.recv().await {
            if self.handle_message(message).await.is_break() {
                break;
            }
        }
        debug!("Session actor has shut down");
    }

    async fn handle_message(&mut self, message: SessionMessage) -> ControlFlow<()> {
        match message {
            SessionMessage::FromEditor(event) => {
                if self.guard.is_held() {
                    debug!("Ignoring editor event triggered by a remote update");
                    return ControlFlow::Continue(());
                }
                if let Some(outgoing) = self.arbiter.on_editor_event(event) {
                    self.link.send(outgoing).await;
                }
            }
            SessionMessage::FromPeer(PeerEvent::Connected) => {
                // Both sides re-send their last state on a fresh connection,
                // so the peers converge without waiting for the next move.
                if let Some(last) = self.arbiter.last_state() {
                    self.link.send(last).await;
                }
            }
            SessionMessage::FromPeer(PeerEvent::Message(message)) => {
                let Some(action) = self.arbiter.on_peer_message(message) else {
                    return ControlFlow::Continue(());
                };
                let _hold = self.guard.hold();
                let result = match action {
                    ApplyAction::Select { path, line, column } => {
                        self.control.apply_select(&path, line, column).await
                    }
                    ApplyAction::Close { path } => self.control.close_file(&path).await,
                };
                if let Err(err) = result {
                    // Apply errors are local; the session continues.
                    warn!("Failed to apply remote update: {err:#}");
                }
                // The hold drops here, releasing the echo guard even when
                // the apply step failed.
            }
            SessionMessage::SetPort(port) => {
                self.link.set_port(port).await;
            }
            SessionMessage::Shutdown => {
                self.link.shutdown().await;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }
}

/// How the rest of the daemon talks to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    message_tx: mpsc::Sender<SessionMessage>,
    guard: EchoGuard,
}

impl SessionHandle {
    /// Forwards a local, user-driven editor event into the session.
    ///
    /// Events observed while a remote update is being applied are
    /// consequences of that update and get dropped right here, before they
    /// ever enter the session mailbox.
    pub async fn editor_event(&self, event: EditorEvent) {
        if self.guard.is_held() {
            debug!("Ignoring editor event triggered by a remote update");
            return;
        }
        let _ = self
            .message_tx
            .send(SessionMessage::FromEditor(event))
            .await;
    }

    pub async fn set_port(&self, port: u16) {
        let _ = self.message_tx.send(SessionMessage::SetPort(port)).await;
    }
}

/// An owned sync session, constructed at sync-enable time and destroyed at
/// sync-disable time. Owns the connection to the other front-end.
pub struct Session {
    handle: SessionHandle,
    state_rx: watch::Receiver<ConnectionState>,
    bound_port_rx: watch::Receiver<u16>,
}

impl Session {
    #[must_use]
    pub fn new(
        role: PeerRole,
        transport: TransportRole,
        port: u16,
        control: Box<dyn EditorControl>,
    ) -> Self {
        let (message_tx, message_rx) = mpsc::channel(16);
        let guard = EchoGuard::default();

        let (event_tx, mut event_rx) = mpsc::channel(16);
        let connection = ConnectionManager::new(transport, role, port, event_tx);
        let state_rx = connection.subscribe_state();
        let bound_port_rx = connection.bound_port();

        // Forward transport events into the session mailbox.
        {
            let message_tx = message_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    if message_tx
                        .send(SessionMessage::FromPeer(event))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }

        let actor = SessionActor {
            arbiter: Arbiter::new(role),
            guard: guard.clone(),
            link: Box::new(connection),
            control,
            message_rx,
        };
        tokio::spawn(async move { actor.run().await });

        Self {
            handle: SessionHandle { message_tx, guard },
            state_rx,
            bound_port_rx,
        }
    }

    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Connection state transitions, for the status reporter.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// The port the listener actually bound (0 until the first bind).
    #[must_use]
    pub fn bound_port(&self) -> watch::Receiver<u16> {
        self.bound_port_rx.clone()
    }

    /// Tears down the transport and cancels any pending retry. Immediate and
    /// total: no background activity continues afterwards.
    pub async fn shutdown(self) {
        let _ = self.handle.message_tx.send(SessionMessage::Shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::timeout;

    fn select_from(role: PeerRole, is_active: bool) -> SyncMessage {
        SyncMessage::select("/x.py".to_string(), 10, 4, role, is_active)
    }

    mod arbiter {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn select_is_transmitted_only_while_active() {
            let mut arbiter = Arbiter::new(PeerRole::PeerA);

            let sent = arbiter.on_editor_event(EditorEvent::Selection {
                path: "/x.py".to_string(),
                line: 10,
                column: 4,
            });
            assert_eq!(sent, Some(select_from(PeerRole::PeerA, true)));

            arbiter.on_editor_event(EditorEvent::Focus { active: false });
            let sent = arbiter.on_editor_event(EditorEvent::Selection {
                path: "/x.py".to_string(),
                line: 11,
                column: 0,
            });
            assert_eq!(sent, None);
        }

        #[test]
        fn close_is_transmitted_even_while_inactive() {
            let mut arbiter = Arbiter::new(PeerRole::PeerA);
            arbiter.on_editor_event(EditorEvent::Focus { active: false });

            let sent = arbiter.on_editor_event(EditorEvent::Closed {
                path: "/x.py".to_string(),
            });
            assert_eq!(
                sent,
                Some(SyncMessage::close(
                    "/x.py".to_string(),
                    PeerRole::PeerA,
                    false
                ))
            );
        }

        #[test]
        fn focus_change_rebroadcasts_last_state() {
            let mut arbiter = Arbiter::new(PeerRole::PeerA);
            arbiter.on_editor_event(EditorEvent::Selection {
                path: "/x.py".to_string(),
                line: 10,
                column: 4,
            });

            let sent = arbiter.on_editor_event(EditorEvent::Focus { active: false });
            assert_eq!(sent, Some(select_from(PeerRole::PeerA, false)));

            let sent = arbiter.on_editor_event(EditorEvent::Focus { active: true });
            assert_eq!(sent, Some(select_from(PeerRole::PeerA, true)));
        }

        #[test]
        fn focus_change_without_last_state_sends_nothing() {
            let mut arbiter = Arbiter::new(PeerRole::PeerA);
            assert_eq!(
                arbiter.on_editor_event(EditorEvent::Focus { active: false }),
                None
            );
        }

        #[test]
        fn repeated_focus_value_sends_nothing() {
            let mut arbiter = Arbiter::new(PeerRole::PeerA);
            arbiter.on_editor_event(EditorEvent::Selection {
                path: "/x.py".to_string(),
                line: 1,
                column: 1,
            });
            assert_eq!(
                arbiter.on_editor_event(EditorEvent::Focus { active: true }),
                None
            );
        }

        #[test]
        fn own_messages_are_discarded() {
            let arbiter = Arbiter::new(PeerRole::PeerA);
            assert_eq!(
                arbiter.on_peer_message(select_from(PeerRole::PeerA, true)),
                None
            );
        }

        #[test]
        fn select_from_active_peer_is_applied() {
            let arbiter = Arbiter::new(PeerRole::PeerB);
            assert_eq!(
                arbiter.on_peer_message(select_from(PeerRole::PeerA, true)),
                Some(ApplyAction::Select {
                    path: "/x.py".to_string(),
                    line: 10,
                    column: 4,
                })
            );
        }

        #[test]
        fn select_from_inactive_peer_is_discarded() {
            let arbiter = Arbiter::new(PeerRole::PeerB);
            assert_eq!(
                arbiter.on_peer_message(select_from(PeerRole::PeerA, false)),
                None
            );
        }

        #[test]
        fn close_is_applied_regardless_of_activation() {
            let arbiter = Arbiter::new(PeerRole::PeerB);
            for is_active in [true, false] {
                let message = SyncMessage::close("/x.py".to_string(), PeerRole::PeerA, is_active);
                assert_eq!(
                    arbiter.on_peer_message(message),
                    Some(ApplyAction::Close {
                        path: "/x.py".to_string(),
                    })
                );
            }
        }

        #[test]
        fn message_from_unknown_peer_is_arbitrated_on_activation() {
            let arbiter = Arbiter::new(PeerRole::PeerA);
            assert!(arbiter
                .on_peer_message(select_from(PeerRole::Unknown, true))
                .is_some());
            assert!(arbiter
                .on_peer_message(select_from(PeerRole::Unknown, false))
                .is_none());
        }
    }

    mod actor {
        use super::*;
        use pretty_assertions::assert_eq;

        struct RecordingLink {
            sent: mpsc::UnboundedSender<SyncMessage>,
        }

        #[async_trait]
        impl PeerLink for RecordingLink {
            async fn send(&mut self, message: SyncMessage) {
                let _ = self.sent.send(message);
            }
            async fn set_port(&mut self, _port: u16) {}
            async fn shutdown(&mut self) {}
        }

        // Applying a select triggers the observation side, like a real editor
        // reporting back the caret move we just made.
        struct EchoingControl {
            handle: SessionHandle,
            applied: mpsc::UnboundedSender<ApplyAction>,
        }

        #[async_trait]
        impl EditorControl for EchoingControl {
            async fn apply_select(&mut self, path: &str, line: u32, column: u32) -> Result<()> {
                self.handle
                    .editor_event(EditorEvent::Selection {
                        path: path.to_string(),
                        line,
                        column,
                    })
                    .await;
                let _ = self.applied.send(ApplyAction::Select {
                    path: path.to_string(),
                    line,
                    column,
                });
                Ok(())
            }

            async fn close_file(&mut self, path: &str) -> Result<()> {
                let _ = self.applied.send(ApplyAction::Close {
                    path: path.to_string(),
                });
                Ok(())
            }
        }

        fn spawn_actor(
            role: PeerRole,
        ) -> (
            SessionHandle,
            mpsc::Sender<SessionMessage>,
            mpsc::UnboundedReceiver<SyncMessage>,
            mpsc::UnboundedReceiver<ApplyAction>,
        ) {
            let (message_tx, message_rx) = mpsc::channel(16);
            let guard = EchoGuard::default();
            let handle = SessionHandle {
                message_tx: message_tx.clone(),
                guard: guard.clone(),
            };
            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            let (applied_tx, applied_rx) = mpsc::unbounded_channel();
            let actor = SessionActor {
                arbiter: Arbiter::new(role),
                guard,
                link: Box::new(RecordingLink { sent: sent_tx }),
                control: Box::new(EchoingControl {
                    handle: handle.clone(),
                    applied: applied_tx,
                }),
                message_rx,
            };
            tokio::spawn(async move { actor.run().await });
            (handle, message_tx, sent_rx, applied_rx)
        }

        async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
            timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out")
                .expect("channel closed")
        }

        #[tokio::test]
        async fn applying_a_remote_update_produces_no_outgoing_message() {
            let (handle, message_tx, mut sent, mut applied) = spawn_actor(PeerRole::PeerB);

            let remote = select_from(PeerRole::PeerA, true);
            message_tx
                .send(SessionMessage::FromPeer(PeerEvent::Message(remote)))
                .await
                .unwrap();

            assert_eq!(
                recv(&mut applied).await,
                ApplyAction::Select {
                    path: "/x.py".to_string(),
                    line: 10,
                    column: 4,
                }
            );

            // A genuinely local move afterwards still goes out, and it is the
            // first and only thing on the wire: the echo from the apply step
            // above was suppressed.
            handle
                .editor_event(EditorEvent::Selection {
                    path: "/marker.py".to_string(),
                    line: 1,
                    column: 2,
                })
                .await;
            let outgoing = recv(&mut sent).await;
            assert_eq!(outgoing.file_path, "/marker.py");
        }

        #[tokio::test]
        async fn reconnect_resends_last_state() {
            let (handle, message_tx, mut sent, _applied) = spawn_actor(PeerRole::PeerA);

            handle
                .editor_event(EditorEvent::Selection {
                    path: "/x.py".to_string(),
                    line: 10,
                    column: 4,
                })
                .await;
            assert_eq!(recv(&mut sent).await, select_from(PeerRole::PeerA, true));

            message_tx
                .send(SessionMessage::FromPeer(PeerEvent::Connected))
                .await
                .unwrap();
            assert_eq!(recv(&mut sent).await, select_from(PeerRole::PeerA, true));
        }

        #[tokio::test]
        async fn fresh_connection_with_no_state_sends_nothing() {
            let (handle, message_tx, mut sent, _applied) = spawn_actor(PeerRole::PeerA);

            message_tx
                .send(SessionMessage::FromPeer(PeerEvent::Connected))
                .await
                .unwrap();

            // Marker event proves the actor processed the connect first.
            handle
                .editor_event(EditorEvent::Selection {
                    path: "/marker.py".to_string(),
                    line: 0,
                    column: 0,
                })
                .await;
            assert_eq!(recv(&mut sent).await.file_path, "/marker.py");
        }
    }
}
