//! Login sequence orchestration
//!
//! Offline mode: login start resolves directly to a derived identity.
//!
//! Online mode: login start issues an encryption request carrying the
//! server's public key and a fresh verify token. The response proves the
//! client saw the token, installs the stream cipher on both directions, and
//! kicks verification off to its own task so the HTTPS round-trip never
//! blocks connection I/O. The result comes back to the read task as a
//! session event.
//!
//! Either way, completion negotiates compression, sends login success, and
//! only flips the protocol state once that frame is on the wire.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use perun_protocol::auth::{offline_profile, GameProfile};
use perun_protocol::encryption::{self, SECRET_LEN};
use perun_protocol::error::{ProtocolError, Result};
use perun_protocol::messages::{
    ServerMessage, MOD_PROTOCOL_VERSION, REGISTER_CHANNEL,
};
use perun_protocol::state::ProtocolState;

use crate::session::{ModHandshakeProgress, Outgoing, Session, SessionEvent};

fn valid_username(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 16
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Handles a login start. Offline sessions complete immediately; online
/// sessions enter the encryption handshake.
pub(crate) async fn begin_login(session: &mut Session, username: String) -> Result<()> {
    if session.pending_username.is_some() {
        return Err(ProtocolError::MalformedFrame("duplicate login start"));
    }
    if !valid_username(&username) {
        return Err(ProtocolError::MalformedFrame("invalid username"));
    }
    info!(session = session.id(), %username, "login started");

    if !session.server.config.online_mode {
        session.pending_username = Some(username.clone());
        return complete_login(session, offline_profile(&username)).await;
    }

    let token = encryption::new_verify_token();
    session.verify_token = Some(token);
    session.pending_username = Some(username);
    session
        .send(ServerMessage::EncryptionRequest {
            server_id: session.server_id.clone(),
            public_key: session.server.keypair.public_der().to_vec(),
            verify_token: token.to_vec(),
        })
        .await?;
    Ok(())
}

/// Validates the encryption response, arms the cipher, and starts the
/// off-task identity verification.
pub(crate) async fn handle_encryption_response(
    session: &mut Session,
    shared_secret: Vec<u8>,
    verify_token: Vec<u8>,
) -> Result<()> {
    let Some(expected) = session.verify_token.take() else {
        return Err(ProtocolError::MalformedFrame("unexpected encryption response"));
    };
    let username = session
        .pending_username
        .clone()
        .ok_or(ProtocolError::MalformedFrame(
            "encryption response before login start",
        ))?;

    let echoed = session.server.keypair.decrypt(&verify_token)?;
    if echoed != expected {
        return Err(ProtocolError::VerifyTokenMismatch);
    }
    let secret = session.server.keypair.decrypt(&shared_secret)?;
    let secret_len = secret.len();
    let secret: [u8; SECRET_LEN] = secret
        .try_into()
        .map_err(|_| ProtocolError::InvalidSecretLength(secret_len))?;

    session.enable_encryption(secret).await?;

    let digest = encryption::server_digest(
        &session.server_id,
        &secret,
        session.server.keypair.public_der(),
    );
    let authenticator = Arc::clone(&session.server.authenticator);
    let events = session.events.clone();
    let session_id = session.id();
    tokio::spawn(async move {
        let profile = authenticator.verify(&username, &digest).await;
        // a closed channel means the session died while we were out
        if events
            .send(SessionEvent::AuthResult { profile })
            .await
            .is_err()
        {
            debug!(session = session_id, "dropping auth result for a dead session");
        }
    });
    Ok(())
}

/// Finishes login with a resolved identity: negotiate compression, send
/// login success, then flip out of the login phase.
pub(crate) async fn complete_login(session: &mut Session, profile: GameProfile) -> Result<()> {
    if session.shared.is_disconnected() {
        return Ok(());
    }
    if let Some(expected) = &session.pending_username {
        if *expected != profile.name {
            return Err(ProtocolError::AuthWrongProfile(profile.name));
        }
    }

    let threshold = session.server.config.compression_threshold;
    if threshold >= 0 {
        // the announcement itself travels uncompressed; the stage arms
        // behind it on both directions
        session
            .send(ServerMessage::SetCompression { threshold })
            .await?;
        session.install_compression(threshold).await?;
    }

    let receipt = session
        .send(ServerMessage::LoginSuccess {
            uuid: profile.uuid,
            username: profile.name.clone(),
        })
        .await?;
    // the state flip must wait for this frame to hit the wire; anything sent
    // after it dispatches through the next phase's registries
    receipt.await.map_err(|_| ProtocolError::ConnectionClosed)?;

    session.shared.store_profile(profile.clone());
    info!(
        session = session.id(),
        player = %profile.name,
        uuid = %profile.uuid,
        "login complete"
    );

    if session.mod_support {
        session.set_state(ProtocolState::ModHandshake)?;
        session.mod_progress = ModHandshakeProgress::AwaitingHello;
        session
            .send(ServerMessage::ModServerHello {
                protocol_version: MOD_PROTOCOL_VERSION,
                dimension: session.server.config.mod_dimension,
            })
            .await?;
    } else {
        session.set_state(ProtocolState::Play)?;
        enter_play(session).await?;
    }
    Ok(())
}

/// Play-phase entry work shared by the plain and mod-handshake routes.
pub(crate) async fn enter_play(session: &mut Session) -> Result<()> {
    announce_channels(session).await?;
    start_keepalive(session);
    Ok(())
}

/// Announces the server's plugin channels on the register channel.
async fn announce_channels(session: &Session) -> Result<()> {
    let channels = &session.server.config.channels;
    if channels.is_empty() {
        return Ok(());
    }
    let data = Bytes::from(channels.join("\0").into_bytes());
    session
        .send(ServerMessage::CustomPayload {
            channel: REGISTER_CHANNEL.to_owned(),
            data,
        })
        .await?;
    Ok(())
}

/// Arms the tick-clocked keep-alive probe for a playing session.
fn start_keepalive(session: &mut Session) {
    let interval = session.server.config.keepalive_interval_ticks.max(1);
    let grace = session.server.config.keepalive_grace as i64;
    let shared = Arc::clone(&session.shared);
    let outgoing = session.outgoing.clone();
    let handle = session.server.sync_scheduler.schedule(
        format!("keepalive/{}", shared.id),
        format!("session-{}", shared.id),
        interval,
        interval,
        move || {
            if shared.is_disconnected() {
                return;
            }
            if shared.keepalive_lag() > grace {
                warn!(session = shared.id, "keep-alive timed out, kicking");
                shared.set_disconnected();
                let _ = outgoing.try_send(Outgoing::Message {
                    message: ServerMessage::Disconnect {
                        reason: "Timed out".to_owned(),
                    },
                    done: None,
                });
                let _ = outgoing.try_send(Outgoing::Close);
                return;
            }
            let id = shared.next_keepalive_id();
            let _ = outgoing.try_send(Outgoing::Message {
                message: ServerMessage::KeepAlive { id },
                done: None,
            });
        },
    );
    session.keepalive_task = Some(handle);
}
