//! # Hub Client Protocol
//!
//! Client-side mirror of the Flux hub's JSON wire protocol. The hub
//! relays signaling payloads (SDP, ICE) verbatim; everything here is
//! control plane only — bulk data never touches the hub.
//!
//! These enums must match the hub's `ClientMessage` / `ServerMessage`
//! definitions field for field.

use serde::{Deserialize, Serialize};

/// Messages sent from a client to the hub.
/// Must match the hub's `ClientMessage` enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HubClientMessage {
    Ping,
    Pong,
    GetConnectCode,
    GetFriends,
    AddFriend {
        code: String,
    },
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
    RtcSessionAccept {
        session_id: String,
    },
    RtcSessionReject {
        session_id: String,
    },
    RtcOffer {
        peer_id: String,
        payload: serde_json::Value,
    },
    RtcAnswer {
        peer_id: String,
        payload: serde_json::Value,
    },
    RtcIceCandidate {
        peer_id: String,
        payload: serde_json::Value,
    },
    RtcSessionReady {
        session_id: String,
    },
    RtcSessionClose {
        session_id: String,
    },
}

/// Messages received from the hub.
/// Must match the hub's `ServerMessage` enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HubServerMessage {
    Connected {
        user_id: String,
        email: String,
    },
    Ping,
    Pong,
    ConnectCode {
        code: String,
    },
    FriendsList {
        friends: Vec<Friend>,
    },
    FriendAdded {
        friend: Friend,
    },
    FriendOnline {
        friend_id: String,
    },
    FriendOffline {
        friend_id: String,
    },
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
    RtcSessionAccept {
        sender_id: String,
        session_id: String,
    },
    RtcSessionReject {
        sender_id: String,
        session_id: String,
    },
    RtcOffer {
        sender_id: String,
        payload: serde_json::Value,
    },
    RtcAnswer {
        sender_id: String,
        payload: serde_json::Value,
    },
    RtcIceCandidate {
        sender_id: String,
        payload: serde_json::Value,
    },
    RtcSessionReady {
        sender_id: String,
        session_id: String,
    },
    RtcSessionClose {
        sender_id: String,
        session_id: String,
    },
    Error {
        message: String,
    },
}

/// A friend entry with live presence, as the hub renders it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Friend {
    pub id: String,
    pub name: String,
    pub email: String,
    pub is_online: bool,
}

/// Hub connection status, as surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubStatus {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}
