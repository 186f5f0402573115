//! Inbound message handlers
//!
//! One unit struct per message kind, attached to the phase registries before
//! the table is sealed. Handlers run inline on the connection's read task
//! with exclusive access to the [`Session`], so none of them need their own
//! locking.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use perun_protocol::codec;
use perun_protocol::error::{ProtocolError, Result};
use perun_protocol::messages::{
    mod_phase, ClientKind, ClientMessage, ServerMessage, GAME_VERSION, INTENT_LOGIN,
    INTENT_STATUS, MOD_CHANNEL, MOD_MARKER, MOD_PROTOCOL_VERSION, PROTOCOL_VERSION,
    REGISTER_CHANNEL,
};
use perun_protocol::registry::{MessageHandler, WireMessage};
use perun_protocol::state::{ProtocolState, ProtocolTable};

use crate::login;
use crate::session::{ModHandshakeProgress, Session};

/// Attaches every handler to an unsealed table. Called once at bind time,
/// before [`ProtocolTable::seal`].
pub(crate) fn register_handlers(table: &mut ProtocolTable<Session>) -> Result<()> {
    table
        .phase_mut(ProtocolState::Handshake)
        .inbound
        .register_handler(ClientKind::Handshake, Arc::new(HandshakeHandler))?;

    let status = table.phase_mut(ProtocolState::Status);
    status
        .inbound
        .register_handler(ClientKind::StatusRequest, Arc::new(StatusRequestHandler))?;
    status
        .inbound
        .register_handler(ClientKind::StatusPing, Arc::new(StatusPingHandler))?;

    let login = table.phase_mut(ProtocolState::Login);
    login
        .inbound
        .register_handler(ClientKind::LoginStart, Arc::new(LoginStartHandler))?;
    login.inbound.register_handler(
        ClientKind::EncryptionResponse,
        Arc::new(EncryptionResponseHandler),
    )?;

    for state in [ProtocolState::ModHandshake, ProtocolState::Play] {
        table
            .phase_mut(state)
            .inbound
            .register_handler(ClientKind::KeepAliveReply, Arc::new(KeepAliveReplyHandler))?;
    }
    table
        .phase_mut(ProtocolState::ModHandshake)
        .inbound
        .register_handler(ClientKind::CustomPayload, Arc::new(ModChannelHandler))?;
    table
        .phase_mut(ProtocolState::Play)
        .inbound
        .register_handler(ClientKind::CustomPayload, Arc::new(PlayPayloadHandler))?;

    table
        .mod_inbound
        .register_handler(ClientKind::ModHello, Arc::new(ModHelloHandler))?;
    table
        .mod_inbound
        .register_handler(ClientKind::ModList, Arc::new(ModListHandler))?;
    table
        .mod_inbound
        .register_handler(ClientKind::ModAck, Arc::new(ModAckHandler))?;

    Ok(())
}

struct HandshakeHandler;

#[async_trait]
impl MessageHandler<Session, ClientMessage> for HandshakeHandler {
    async fn handle(&self, session: &mut Session, message: ClientMessage) -> Result<()> {
        let ClientMessage::Handshake {
            protocol_version,
            address,
            intent,
            ..
        } = message
        else {
            return Err(ProtocolError::DispatchMismatch("Handshake"));
        };
        match intent {
            INTENT_STATUS => session.set_state(ProtocolState::Status),
            INTENT_LOGIN => {
                session.mod_support = address.contains(MOD_MARKER);
                session.set_state(ProtocolState::Login)?;
                if protocol_version != PROTOCOL_VERSION {
                    let reason = if protocol_version < PROTOCOL_VERSION {
                        format!("Outdated client! Please use {GAME_VERSION}")
                    } else {
                        format!("Outdated server! I'm still on {GAME_VERSION}")
                    };
                    debug!(
                        session = session.id(),
                        client_version = protocol_version,
                        "protocol version mismatch"
                    );
                    session.disconnect(&reason).await;
                }
                Ok(())
            }
            _ => Err(ProtocolError::MalformedFrame("unknown handshake intent")),
        }
    }
}

struct StatusRequestHandler;

#[async_trait]
impl MessageHandler<Session, ClientMessage> for StatusRequestHandler {
    async fn handle(&self, session: &mut Session, _message: ClientMessage) -> Result<()> {
        let config = &session.server.config;
        let status = serde_json::json!({
            "version": { "name": GAME_VERSION, "protocol": PROTOCOL_VERSION },
            "players": { "max": config.max_players, "online": session.server.online_count() },
            "description": { "text": config.motd },
        });
        session
            .send(ServerMessage::StatusResponse {
                json: status.to_string(),
            })
            .await?;
        Ok(())
    }
}

struct StatusPingHandler;

#[async_trait]
impl MessageHandler<Session, ClientMessage> for StatusPingHandler {
    async fn handle(&self, session: &mut Session, message: ClientMessage) -> Result<()> {
        let ClientMessage::StatusPing { time } = message else {
            return Err(ProtocolError::DispatchMismatch("StatusPing"));
        };
        session.send(ServerMessage::StatusPong { time }).await?;
        // a status exchange is one request and one ping, then goodbye
        session.close_after_flush().await;
        Ok(())
    }
}

struct LoginStartHandler;

#[async_trait]
impl MessageHandler<Session, ClientMessage> for LoginStartHandler {
    async fn handle(&self, session: &mut Session, message: ClientMessage) -> Result<()> {
        let ClientMessage::LoginStart { username } = message else {
            return Err(ProtocolError::DispatchMismatch("LoginStart"));
        };
        login::begin_login(session, username).await
    }
}

struct EncryptionResponseHandler;

#[async_trait]
impl MessageHandler<Session, ClientMessage> for EncryptionResponseHandler {
    async fn handle(&self, session: &mut Session, message: ClientMessage) -> Result<()> {
        let ClientMessage::EncryptionResponse {
            shared_secret,
            verify_token,
        } = message
        else {
            return Err(ProtocolError::DispatchMismatch("EncryptionResponse"));
        };
        login::handle_encryption_response(session, shared_secret, verify_token).await
    }
}

struct KeepAliveReplyHandler;

#[async_trait]
impl MessageHandler<Session, ClientMessage> for KeepAliveReplyHandler {
    async fn handle(&self, session: &mut Session, message: ClientMessage) -> Result<()> {
        let ClientMessage::KeepAliveReply { id } = message else {
            return Err(ProtocolError::DispatchMismatch("KeepAliveReply"));
        };
        session.shared.record_keepalive_echo(id);
        Ok(())
    }
}

/// Play-phase custom payloads: channel registrations are recorded, anything
/// else is ignored.
struct PlayPayloadHandler;

#[async_trait]
impl MessageHandler<Session, ClientMessage> for PlayPayloadHandler {
    async fn handle(&self, session: &mut Session, message: ClientMessage) -> Result<()> {
        let ClientMessage::CustomPayload { channel, data } = message else {
            return Err(ProtocolError::DispatchMismatch("CustomPayload"));
        };
        if channel == REGISTER_CHANNEL {
            let channels = String::from_utf8_lossy(&data);
            info!(
                session = session.id(),
                channels = %channels.split('\0').collect::<Vec<_>>().join(", "),
                "client registered plugin channels"
            );
        } else {
            debug!(session = session.id(), %channel, bytes = data.len(), "custom payload");
        }
        Ok(())
    }
}

/// Demultiplexes mod-handshake sub-messages out of their carrier payloads by
/// leading type byte and dispatches through the mod sub-registry.
struct ModChannelHandler;

#[async_trait]
impl MessageHandler<Session, ClientMessage> for ModChannelHandler {
    async fn handle(&self, session: &mut Session, message: ClientMessage) -> Result<()> {
        let ClientMessage::CustomPayload { channel, mut data } = message else {
            return Err(ProtocolError::DispatchMismatch("CustomPayload"));
        };
        if channel != MOD_CHANNEL {
            debug!(
                session = session.id(),
                %channel,
                "non-handshake payload during mod handshake ignored"
            );
            return Ok(());
        }
        let type_byte = codec::read_u8(&mut data)?;
        let server = Arc::clone(&session.server);
        let registry = &server.table.mod_inbound;
        let sub = registry.decode(type_byte, data)?;
        match registry.handler(sub.kind()) {
            Some(handler) => handler.handle(session, sub).await,
            None => {
                debug!(session = session.id(), kind = %sub.kind(), "unhandled mod sub-message");
                Ok(())
            }
        }
    }
}

/// Resets the sub-protocol and drops the client. Failing the mod handshake
/// is not a protocol error; the connection just cannot proceed to play.
async fn fail_mod_handshake(session: &mut Session, why: &'static str) -> Result<()> {
    warn!(session = session.id(), why, "mod handshake failed");
    let _ = session.send(ServerMessage::ModReset).await;
    session.disconnect("Mod handshake failed").await;
    Ok(())
}

struct ModHelloHandler;

#[async_trait]
impl MessageHandler<Session, ClientMessage> for ModHelloHandler {
    async fn handle(&self, session: &mut Session, message: ClientMessage) -> Result<()> {
        let ClientMessage::ModHello { protocol_version } = message else {
            return Err(ProtocolError::DispatchMismatch("ModHello"));
        };
        if session.mod_progress != ModHandshakeProgress::AwaitingHello {
            return fail_mod_handshake(session, "out-of-order hello").await;
        }
        if protocol_version != MOD_PROTOCOL_VERSION {
            return fail_mod_handshake(session, "sub-protocol version mismatch").await;
        }
        session.mod_progress = ModHandshakeProgress::AwaitingModList;
        Ok(())
    }
}

struct ModListHandler;

#[async_trait]
impl MessageHandler<Session, ClientMessage> for ModListHandler {
    async fn handle(&self, session: &mut Session, message: ClientMessage) -> Result<()> {
        let ClientMessage::ModList { mods } = message else {
            return Err(ProtocolError::DispatchMismatch("ModList"));
        };
        if session.mod_progress != ModHandshakeProgress::AwaitingModList {
            return fail_mod_handshake(session, "out-of-order mod list").await;
        }
        if mods.iter().any(|entry| entry.name.is_empty()) {
            return fail_mod_handshake(session, "unnamed mod in list").await;
        }
        info!(session = session.id(), mods = mods.len(), "client mod list received");

        let config = &session.server.config;
        let server_mods = config.server_mods.clone();
        let registries = config.registries.clone();
        session.send(ServerMessage::ModList { mods: server_mods }).await?;
        session
            .send(ServerMessage::ModRegistrySync { registries })
            .await?;
        session
            .send(ServerMessage::ModAck {
                phase: mod_phase::WAITING_ACK,
            })
            .await?;
        session.mod_progress = ModHandshakeProgress::AwaitingAck;
        Ok(())
    }
}

struct ModAckHandler;

#[async_trait]
impl MessageHandler<Session, ClientMessage> for ModAckHandler {
    async fn handle(&self, session: &mut Session, message: ClientMessage) -> Result<()> {
        let ClientMessage::ModAck { phase } = message else {
            return Err(ProtocolError::DispatchMismatch("ModAck"));
        };
        if session.mod_progress != ModHandshakeProgress::AwaitingAck {
            return fail_mod_handshake(session, "out-of-order acknowledge").await;
        }
        if phase != mod_phase::WAITING_ACK {
            return fail_mod_handshake(session, "acknowledged wrong phase").await;
        }

        let receipt = session
            .send(ServerMessage::ModAck {
                phase: mod_phase::COMPLETE,
            })
            .await?;
        // the completion ack must leave under the handshake phase's
        // registries before the session flips to play
        receipt.await.map_err(|_| ProtocolError::ConnectionClosed)?;

        session.mod_progress = ModHandshakeProgress::Complete;
        session.set_state(ProtocolState::Play)?;
        info!(session = session.id(), "mod handshake complete");
        login::enter_play(session).await
    }
}
