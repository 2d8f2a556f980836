//! Hub state: the Connection Registry and the Session Table.
//!
//! Both are concurrent maps (DashMap). The registry is the single source of
//! truth for presence; the session table holds in-flight P2P negotiations
//! and is purged whenever a participant disconnects. Nothing here survives
//! a restart — clients re-register and re-negotiate on reconnect.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::directory::Directory;
use crate::identity::IdentityProvider;
use crate::protocol::ServerMessage;

/// Close code sent to a socket replaced by a newer one from the same user.
pub const CLOSE_SUPERSEDED: u16 = 1001;

/// Instructions for a connection's writer task.
#[derive(Debug)]
pub enum SocketCommand {
    /// Serialize and send a protocol message.
    Send(ServerMessage),
    /// Send a close frame with the given code, then stop writing.
    Close { code: u16, reason: String },
}

/// Per-connection sender half.
pub type ConnSender = mpsc::UnboundedSender<SocketCommand>;

/// A live, authenticated connection.
#[derive(Debug, Clone)]
pub struct PeerConn {
    /// Distinguishes this socket from any predecessor or successor owned
    /// by the same user, so a stale disconnect can never unregister a
    /// newer socket.
    pub epoch: Uuid,
    pub sender: ConnSender,
    /// Display handle, carried from authentication.
    pub handle: String,
    pub email: String,
    pub connected_at: DateTime<Utc>,
}

// ── Sessions ──────────────────────────────────────────────────────────────────

/// Lifecycle of a P2P session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Requested, awaiting the responder's accept.
    Pending,
    /// Accepted; SDP/ICE exchange in flight.
    Accepted,
    /// Direct link established.
    Connected,
}

/// A brokered P2P session between two peers.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub initiator: String,
    pub responder: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    /// File hint carried through from the request, if any.
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub file_type: Option<String>,
}

impl Session {
    /// The participant that isn't `user_id`.
    pub fn counterpart(&self, user_id: &str) -> &str {
        if self.initiator == user_id {
            &self.responder
        } else {
            &self.initiator
        }
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.initiator == user_id || self.responder == user_id
    }
}

/// Why a session mutation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    NotFound,
    /// The session exists but is not in a state this transition accepts,
    /// or the actor is not the participant allowed to drive it.
    InvalidTransition,
}

// ── Hub state ─────────────────────────────────────────────────────────────────

/// Runtime knobs for connection handling.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub ping_interval: std::time::Duration,
    pub idle_timeout: std::time::Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ping_interval: std::time::Duration::from_secs(30),
            idle_timeout: std::time::Duration::from_secs(90),
        }
    }
}

/// Shared hub state.
#[derive(Clone)]
pub struct HubState {
    /// UserId → live connection. At most one per user.
    pub connections: Arc<DashMap<String, PeerConn>>,

    /// SessionId → session.
    pub sessions: Arc<DashMap<String, Session>>,

    pub directory: Directory,
    pub identity: Arc<dyn IdentityProvider>,
    pub config: HubConfig,
}

impl HubState {
    pub fn new(
        directory: Directory,
        identity: Arc<dyn IdentityProvider>,
        config: HubConfig,
    ) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            sessions: Arc::new(DashMap::new()),
            directory,
            identity,
            config,
        }
    }

    // ── Connection Registry ───────────────────────────────────────────────

    /// Register a connection, superseding any prior socket from the same
    /// user (the old writer is told to close with 1001).
    pub fn register(&self, user_id: &str, conn: PeerConn) {
        if let Some(old) = self.connections.insert(user_id.to_string(), conn) {
            tracing::info!(user_id, "Superseding existing connection");
            let _ = old.sender.send(SocketCommand::Close {
                code: CLOSE_SUPERSEDED,
                reason: "superseded".to_string(),
            });
        }
        tracing::info!(user_id, "Peer registered");
    }

    /// Unregister a connection, but only if `epoch` still identifies the
    /// stored record. Returns whether this call removed the registration.
    pub fn unregister(&self, user_id: &str, epoch: Uuid) -> bool {
        let removed = self
            .connections
            .remove_if(user_id, |_, conn| conn.epoch == epoch)
            .is_some();
        if removed {
            tracing::info!(user_id, "Peer unregistered");
        } else {
            tracing::debug!(user_id, "Stale unregister ignored");
        }
        removed
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.connections.contains_key(user_id)
    }

    pub fn online_count(&self) -> usize {
        self.connections.len()
    }

    /// Send a message to an online peer. Returns false if the peer is
    /// offline or its writer is gone.
    pub fn send_to(&self, user_id: &str, message: ServerMessage) -> bool {
        if let Some(conn) = self.connections.get(user_id) {
            conn.sender.send(SocketCommand::Send(message)).is_ok()
        } else {
            false
        }
    }

    // ── Session Table ─────────────────────────────────────────────────────

    /// Allocate a pending session. The caller has already checked that the
    /// responder is online.
    pub fn create_session(
        &self,
        session_id: &str,
        initiator: &str,
        responder: &str,
        file_name: Option<String>,
        file_size: Option<u64>,
        file_type: Option<String>,
    ) -> Session {
        let session = Session {
            session_id: session_id.to_string(),
            initiator: initiator.to_string(),
            responder: responder.to_string(),
            state: SessionState::Pending,
            created_at: Utc::now(),
            file_name,
            file_size,
            file_type,
        };

        tracing::info!(
            session_id,
            initiator,
            responder,
            "Session created"
        );
        self.sessions.insert(session_id.to_string(), session.clone());
        session
    }

    /// `pending → accepted`, driven by the responder.
    pub fn accept_session(
        &self,
        session_id: &str,
        actor: &str,
    ) -> Result<Session, SessionError> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or(SessionError::NotFound)?;

        if session.state != SessionState::Pending || session.responder != actor {
            return Err(SessionError::InvalidTransition);
        }

        session.state = SessionState::Accepted;
        tracing::info!(session_id, "Session accepted");
        Ok(session.clone())
    }

    /// `accepted → connected`, driven by either participant.
    pub fn mark_session_ready(
        &self,
        session_id: &str,
        actor: &str,
    ) -> Result<Session, SessionError> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or(SessionError::NotFound)?;

        if session.state != SessionState::Accepted || !session.involves(actor) {
            return Err(SessionError::InvalidTransition);
        }

        session.state = SessionState::Connected;
        tracing::info!(session_id, "Session connected");
        Ok(session.clone())
    }

    /// Terminal removal (reject, close). Returns the removed session if the
    /// actor was a participant.
    pub fn remove_session(&self, session_id: &str, actor: &str) -> Option<Session> {
        let involved = self
            .sessions
            .get(session_id)
            .map(|s| s.involves(actor))
            .unwrap_or(false);
        if !involved {
            return None;
        }

        self.sessions.remove(session_id).map(|(_, session)| {
            tracing::info!(session_id, "Session removed");
            session
        })
    }

    /// Drop every session referencing a disconnected peer; returns the
    /// removed sessions so the caller can notify survivors.
    pub fn purge_sessions_for(&self, user_id: &str) -> Vec<Session> {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.involves(user_id))
            .map(|entry| entry.session_id.clone())
            .collect();

        let mut purged = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                purged.push(session);
            }
        }

        if !purged.is_empty() {
            tracing::info!(user_id, count = purged.len(), "Purged sessions on disconnect");
        }
        purged
    }
}
