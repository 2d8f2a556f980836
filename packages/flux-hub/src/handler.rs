//! WebSocket connection handling.
//!
//! One reader task owns each socket for its lifetime:
//! 1. Verify the bearer token from the upgrade URL (close 4001/4000 on failure)
//! 2. Register the peer, greet it, and announce presence to its friends
//! 3. Spawn a writer task fed by a per-connection command channel, plus a
//!    server→client ping probe
//! 4. Dispatch control messages until the socket closes or idles out
//! 5. Unregister, purge the peer's sessions, and announce offline

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::directory::DirectoryError;
use crate::identity::AuthError;
use crate::protocol::{ClientMessage, FriendView, ServerMessage};
use crate::state::{HubState, PeerConn, SessionError, SocketCommand};

/// Close code for a missing or rejected bearer token.
pub const CLOSE_UNAUTHENTICATED: u16 = 4001;

/// Close code for any other fatal failure during the upgrade.
pub const CLOSE_UPGRADE_FAILED: u16 = 4000;

/// Every recognized `type` tag. A well-formed envelope with a tag outside
/// this set is logged and ignored; anything else malformed gets an error
/// reply.
const KNOWN_TYPES: &[&str] = &[
    "ping",
    "pong",
    "get_connect_code",
    "get_friends",
    "add_friend",
    "rtc_session_request",
    "rtc_session_accept",
    "rtc_session_reject",
    "rtc_offer",
    "rtc_answer",
    "rtc_ice_candidate",
    "rtc_session_ready",
    "rtc_session_close",
];

/// Handle a single WebSocket connection for its lifetime.
pub async fn handle_socket(socket: WebSocket, state: HubState, token: Option<String>) {
    // ── Authenticate ──────────────────────────────────────────────────────
    let user = match token {
        None => {
            close_with(socket, CLOSE_UNAUTHENTICATED, "missing token").await;
            return;
        }
        Some(token) => match state.identity.verify(&token).await {
            Ok(user) => user,
            Err(AuthError::Unauthenticated) => {
                close_with(socket, CLOSE_UNAUTHENTICATED, "invalid token").await;
                return;
            }
            Err(AuthError::Unavailable(reason)) => {
                tracing::warn!(error = %reason, "Identity provider failure during upgrade");
                close_with(socket, CLOSE_UPGRADE_FAILED, "upgrade failed").await;
                return;
            }
        },
    };

    let user_id = user.user_id.clone();
    let handle = user.handle().to_string();

    if let Err(e) = state.directory.upsert_user(&user_id, &user.email, &handle) {
        tracing::error!(user_id = user_id.as_str(), error = %e, "Directory refresh failed");
        close_with(socket, CLOSE_UPGRADE_FAILED, "upgrade failed").await;
        return;
    }

    // ── Register ──────────────────────────────────────────────────────────
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SocketCommand>();
    let epoch = Uuid::new_v4();

    state.register(
        &user_id,
        PeerConn {
            epoch,
            sender: tx.clone(),
            handle: handle.clone(),
            email: user.email.clone(),
            connected_at: Utc::now(),
        },
    );

    let _ = tx.send(SocketCommand::Send(ServerMessage::Connected {
        user_id: user_id.clone(),
        email: user.email.clone(),
    }));

    broadcast_presence(&state, &user_id, true);

    // ── Writer task ───────────────────────────────────────────────────────
    let writer = tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                SocketCommand::Send(msg) => match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if ws_sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize server message");
                    }
                },
                SocketCommand::Close { code, reason } => {
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // ── Liveness probe ────────────────────────────────────────────────────
    let ping_tx = tx.clone();
    let ping_interval = state.config.ping_interval;
    let ping_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(ping_interval);
        interval.tick().await; // the first tick completes immediately
        loop {
            interval.tick().await;
            if ping_tx.send(SocketCommand::Send(ServerMessage::Ping)).is_err() {
                break;
            }
        }
    });

    // ── Read loop ─────────────────────────────────────────────────────────
    loop {
        let next = tokio::time::timeout(state.config.idle_timeout, ws_receiver.next()).await;
        match next {
            Err(_) => {
                tracing::info!(user_id = user_id.as_str(), "Idle timeout, closing");
                let _ = tx.send(SocketCommand::Close {
                    code: 1000,
                    reason: "idle timeout".to_string(),
                });
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok(Message::Text(text)))) => {
                dispatch_text(&state, &user_id, &text).await;
            }
            Ok(Some(Ok(Message::Ping(_)))) => {
                state.send_to(&user_id, ServerMessage::Pong);
            }
            Ok(Some(Ok(Message::Close(_)))) => {
                tracing::info!(user_id = user_id.as_str(), "Client sent close frame");
                break;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(user_id = user_id.as_str(), error = %e, "WebSocket error");
                break;
            }
            _ => {} // Binary, Pong — ignore
        }
    }

    // ── Cleanup ───────────────────────────────────────────────────────────
    ping_task.abort();
    disconnect_cleanup(&state, &user_id, epoch);
    writer.abort();
    tracing::info!(user_id = user_id.as_str(), "WebSocket disconnected");
}

/// Unregister and reclaim a peer's resources.
///
/// Epoch-guarded: when this socket was superseded, the newer registration
/// (and its sessions) must remain untouched.
pub(crate) fn disconnect_cleanup(state: &HubState, user_id: &str, epoch: Uuid) {
    if !state.unregister(user_id, epoch) {
        return;
    }

    for session in state.purge_sessions_for(user_id) {
        let counterpart = session.counterpart(user_id).to_string();
        state.send_to(
            &counterpart,
            ServerMessage::RtcSessionClose {
                sender_id: user_id.to_string(),
                session_id: session.session_id.clone(),
            },
        );
    }

    broadcast_presence(state, user_id, false);
}

/// Send a presence delta to every online friend of `user_id`.
fn broadcast_presence(state: &HubState, user_id: &str, online: bool) {
    let friends = match state.directory.friend_ids(user_id) {
        Ok(friends) => friends,
        Err(e) => {
            tracing::warn!(user_id, error = %e, "Presence broadcast skipped");
            return;
        }
    };

    for friend_id in friends {
        let message = if online {
            ServerMessage::FriendOnline {
                friend_id: user_id.to_string(),
            }
        } else {
            ServerMessage::FriendOffline {
                friend_id: user_id.to_string(),
            }
        };
        state.send_to(&friend_id, message);
    }
}

/// Parse and dispatch one text frame.
pub(crate) async fn dispatch_text(state: &HubState, user_id: &str, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => handle_client_message(state, user_id, msg).await,
        Err(parse_err) => {
            let tag = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(String::from));

            match tag {
                Some(tag) if !KNOWN_TYPES.contains(&tag.as_str()) => {
                    tracing::warn!(user_id, msg_type = tag.as_str(), "Ignoring unknown message type");
                }
                _ => {
                    tracing::warn!(user_id, error = %parse_err, "Malformed client message");
                    error_reply(state, user_id, "Internal error");
                }
            }
        }
    }
}

/// Handle a parsed client message.
async fn handle_client_message(state: &HubState, user_id: &str, msg: ClientMessage) {
    match msg {
        ClientMessage::Ping => {
            state.send_to(user_id, ServerMessage::Pong);
        }

        // Reply to our liveness probe; arrival alone reset the idle clock.
        ClientMessage::Pong => {}

        ClientMessage::GetConnectCode => handle_get_connect_code(state, user_id),

        ClientMessage::GetFriends => handle_get_friends(state, user_id),

        ClientMessage::AddFriend { code } => handle_add_friend(state, user_id, &code),

        ClientMessage::RtcSessionRequest {
            peer_id,
            session_id,
            file_name,
            file_size,
            file_type,
        } => handle_session_request(
            state, user_id, &peer_id, &session_id, file_name, file_size, file_type,
        ),

        ClientMessage::RtcSessionAccept { session_id } => {
            handle_session_accept(state, user_id, &session_id)
        }

        ClientMessage::RtcSessionReject { session_id } => {
            handle_session_reject(state, user_id, &session_id)
        }

        ClientMessage::RtcOffer { peer_id, payload } => {
            relay(state, user_id, &peer_id, ServerMessage::RtcOffer {
                sender_id: user_id.to_string(),
                payload,
            })
        }

        ClientMessage::RtcAnswer { peer_id, payload } => {
            relay(state, user_id, &peer_id, ServerMessage::RtcAnswer {
                sender_id: user_id.to_string(),
                payload,
            })
        }

        ClientMessage::RtcIceCandidate { peer_id, payload } => {
            relay(state, user_id, &peer_id, ServerMessage::RtcIceCandidate {
                sender_id: user_id.to_string(),
                payload,
            })
        }

        ClientMessage::RtcSessionReady { session_id } => {
            handle_session_ready(state, user_id, &session_id)
        }

        ClientMessage::RtcSessionClose { session_id } => {
            handle_session_close(state, user_id, &session_id)
        }
    }
}

// ── Message Handlers ──────────────────────────────────────────────────────────

fn handle_get_connect_code(state: &HubState, user_id: &str) {
    match state.directory.get_or_create_connect_code(user_id) {
        Ok(code) => {
            state.send_to(user_id, ServerMessage::ConnectCode { code });
        }
        Err(e) => {
            tracing::error!(user_id, error = %e, "Connect code allocation failed");
            error_reply(state, user_id, "Internal error");
        }
    }
}

fn handle_get_friends(state: &HubState, user_id: &str) {
    match state.directory.list_friends(user_id) {
        Ok(records) => {
            let friends = records
                .into_iter()
                .map(|record| FriendView {
                    is_online: state.is_online(&record.user_id),
                    id: record.user_id,
                    name: record.handle,
                    email: record.email,
                })
                .collect();
            state.send_to(user_id, ServerMessage::FriendsList { friends });
        }
        Err(e) => {
            tracing::error!(user_id, error = %e, "Friends query failed");
            error_reply(state, user_id, "Internal error");
        }
    }
}

/// Resolve a connect code (case-insensitive) and insert the friendship.
/// Both parties learn about it: the requester always, the new friend if
/// online.
fn handle_add_friend(state: &HubState, user_id: &str, code: &str) {
    let normalized = code.trim().to_uppercase();

    let friend_id = match state.directory.resolve_code(&normalized) {
        Ok(Some(friend_id)) => friend_id,
        Ok(None) => {
            error_reply(state, user_id, "Invalid connect code");
            return;
        }
        Err(e) => {
            tracing::error!(user_id, error = %e, "Code resolution failed");
            error_reply(state, user_id, "Internal error");
            return;
        }
    };

    match state.directory.add_friendship(user_id, &friend_id) {
        Ok(()) => {}
        Err(DirectoryError::SelfFriend) => {
            error_reply(state, user_id, "Cannot add yourself");
            return;
        }
        Err(DirectoryError::AlreadyFriends) => {
            error_reply(state, user_id, "Already friends");
            return;
        }
        Err(e) => {
            tracing::error!(user_id, error = %e, "Friendship insert failed");
            error_reply(state, user_id, "Internal error");
            return;
        }
    }

    if let Some(friend) = friend_view(state, &friend_id) {
        state.send_to(user_id, ServerMessage::FriendAdded { friend });
    }
    if state.is_online(&friend_id) {
        if let Some(me) = friend_view(state, user_id) {
            state.send_to(&friend_id, ServerMessage::FriendAdded { friend: me });
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_session_request(
    state: &HubState,
    user_id: &str,
    peer_id: &str,
    session_id: &str,
    file_name: Option<String>,
    file_size: Option<u64>,
    file_type: Option<String>,
) {
    if !state.is_online(peer_id) {
        error_reply(state, user_id, "Peer not connected");
        return;
    }

    let session = state.create_session(
        session_id, user_id, peer_id, file_name, file_size, file_type,
    );

    let sender_name = state
        .connections
        .get(user_id)
        .map(|conn| conn.handle.clone())
        .unwrap_or_else(|| user_id.to_string());

    state.send_to(
        peer_id,
        ServerMessage::RtcSessionRequest {
            sender_id: user_id.to_string(),
            sender_name,
            session_id: session.session_id,
            file_name: session.file_name,
            file_size: session.file_size,
            file_type: session.file_type,
        },
    );
}

fn handle_session_accept(state: &HubState, user_id: &str, session_id: &str) {
    match state.accept_session(session_id, user_id) {
        Ok(session) => {
            state.send_to(
                &session.initiator,
                ServerMessage::RtcSessionAccept {
                    sender_id: user_id.to_string(),
                    session_id: session.session_id,
                },
            );
        }
        Err(e) => session_error_reply(state, user_id, session_id, e),
    }
}

fn handle_session_reject(state: &HubState, user_id: &str, session_id: &str) {
    if let Some(session) = state.remove_session(session_id, user_id) {
        state.send_to(
            &session.initiator,
            ServerMessage::RtcSessionReject {
                sender_id: user_id.to_string(),
                session_id: session.session_id,
            },
        );
    } else {
        tracing::debug!(user_id, session_id, "Reject for unknown session, ignoring");
    }
}

fn handle_session_ready(state: &HubState, user_id: &str, session_id: &str) {
    match state.mark_session_ready(session_id, user_id) {
        Ok(session) => {
            let counterpart = session.counterpart(user_id).to_string();
            state.send_to(
                &counterpart,
                ServerMessage::RtcSessionReady {
                    sender_id: user_id.to_string(),
                    session_id: session.session_id,
                },
            );
        }
        Err(e) => session_error_reply(state, user_id, session_id, e),
    }
}

fn handle_session_close(state: &HubState, user_id: &str, session_id: &str) {
    if let Some(session) = state.remove_session(session_id, user_id) {
        let counterpart = session.counterpart(user_id).to_string();
        state.send_to(
            &counterpart,
            ServerMessage::RtcSessionClose {
                sender_id: user_id.to_string(),
                session_id: session.session_id,
            },
        );
    } else {
        tracing::debug!(user_id, session_id, "Close for unknown session, ignoring");
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Forward an opaque signaling payload to `peer_id` verbatim.
fn relay(state: &HubState, user_id: &str, peer_id: &str, message: ServerMessage) {
    if !state.send_to(peer_id, message) {
        error_reply(state, user_id, "Peer not connected");
    }
}

fn error_reply(state: &HubState, user_id: &str, message: &str) {
    state.send_to(
        user_id,
        ServerMessage::Error {
            message: message.to_string(),
        },
    );
}

fn session_error_reply(state: &HubState, user_id: &str, session_id: &str, error: SessionError) {
    let message = match error {
        SessionError::NotFound => "Session not found",
        SessionError::InvalidTransition => "Invalid session state",
    };
    tracing::debug!(user_id, session_id, message, "Session transition refused");
    error_reply(state, user_id, message);
}

fn friend_view(state: &HubState, user_id: &str) -> Option<FriendView> {
    match state.directory.get_user(user_id) {
        Ok(Some(record)) => Some(FriendView {
            is_online: state.is_online(&record.user_id),
            id: record.user_id,
            name: record.handle,
            email: record.email,
        }),
        Ok(None) => None,
        Err(e) => {
            tracing::warn!(user_id, error = %e, "Friend view lookup failed");
            None
        }
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
