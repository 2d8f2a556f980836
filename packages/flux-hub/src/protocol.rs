//! Hub protocol message definitions.
//!
//! The hub speaks JSON over WebSocket: every message is an object with a
//! mandatory snake_case `type` tag and camelCase fields. Signaling payloads
//! (SDP offers/answers, ICE candidates) are opaque to the hub — it relays
//! them verbatim and never parses their contents.

use serde::{Deserialize, Serialize};

// ── Client → Hub ──────────────────────────────────────────────────────────────

/// Messages sent from a client to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Keepalive; the hub replies with `pong`.
    Ping,

    /// Reply to a server-initiated `ping` probe. Resets the idle clock,
    /// otherwise ignored.
    Pong,

    /// Request this user's connect code, allocating one on first use.
    GetConnectCode,

    /// Request the friends list with live presence overlaid.
    GetFriends,

    /// Add a friend by their connect code (case-insensitive).
    AddFriend {
        code: String,
    },

    /// Ask the hub to open a P2P session with an online peer.
    /// The file hint is carried through to the responder untouched.
    RtcSessionRequest {
        peer_id: String,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_type: Option<String>,
    },

    /// Accept a pending session (responder side).
    RtcSessionAccept {
        session_id: String,
    },

    /// Reject a pending session (responder side); the session is deleted.
    RtcSessionReject {
        session_id: String,
    },

    /// Relay an SDP offer to a peer. The payload is never inspected.
    RtcOffer {
        peer_id: String,
        payload: serde_json::Value,
    },

    /// Relay an SDP answer to a peer.
    RtcAnswer {
        peer_id: String,
        payload: serde_json::Value,
    },

    /// Relay an ICE candidate to a peer.
    RtcIceCandidate {
        peer_id: String,
        payload: serde_json::Value,
    },

    /// The direct link is up; the session moves to `connected`.
    RtcSessionReady {
        session_id: String,
    },

    /// Tear down a session; the counterpart is notified and the session
    /// is deleted.
    RtcSessionClose {
        session_id: String,
    },
}

// ── Hub → Client ──────────────────────────────────────────────────────────────

/// Messages sent from the hub to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First message after a successful upgrade.
    Connected {
        user_id: String,
        email: String,
    },

    /// Server-initiated liveness probe.
    Ping,

    /// Reply to a client `ping`.
    Pong,

    /// The user's connect code.
    ConnectCode {
        code: String,
    },

    /// Friends with presence overlaid.
    FriendsList {
        friends: Vec<FriendView>,
    },

    /// A friendship was established; sent to both parties.
    FriendAdded {
        friend: FriendView,
    },

    /// A friend came online.
    FriendOnline {
        friend_id: String,
    },

    /// A friend went offline.
    FriendOffline {
        friend_id: String,
    },

    /// A peer wants to open a P2P session with this client.
    RtcSessionRequest {
        sender_id: String,
        sender_name: String,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_type: Option<String>,
    },

    /// The responder accepted the session.
    RtcSessionAccept {
        sender_id: String,
        session_id: String,
    },

    /// The responder rejected the session.
    RtcSessionReject {
        sender_id: String,
        session_id: String,
    },

    /// A relayed SDP offer.
    RtcOffer {
        sender_id: String,
        payload: serde_json::Value,
    },

    /// A relayed SDP answer.
    RtcAnswer {
        sender_id: String,
        payload: serde_json::Value,
    },

    /// A relayed ICE candidate.
    RtcIceCandidate {
        sender_id: String,
        payload: serde_json::Value,
    },

    /// The counterpart reports the direct link is up.
    RtcSessionReady {
        sender_id: String,
        session_id: String,
    },

    /// The counterpart closed the session (or disconnected).
    RtcSessionClose {
        sender_id: String,
        session_id: String,
    },

    /// Error response; the connection stays open.
    Error {
        message: String,
    },
}

// ── Supporting Types ──────────────────────────────────────────────────────────

/// A friend as rendered to clients, with live presence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendView {
    pub id: String,
    /// Display handle, derived from the email local-part.
    pub name: String,
    pub email: String,
    pub is_online: bool,
}
