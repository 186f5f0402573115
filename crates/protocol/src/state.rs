//! Protocol state machine and the per-phase registry table
//!
//! State transitions:
//! ```text
//! Handshake ──intent=status──→ Status (terminal: one response/ping, close)
//!     │
//!     └──────intent=login───→ Login ──────────────→ Play (steady state)
//!                                │                    ↑
//!                                └──→ ModHandshake ───┘
//! ```
//!
//! Each state owns one inbound and one outbound [`MessageRegistry`]; flipping
//! the state swaps which pair is consulted, which is why opcode values are
//! legally reused across phases. A fresh connection always starts over in
//! `Handshake` with a brand new session object; there is no backward
//! transition on a live session.

use crate::error::{ProtocolError, Result};
use crate::messages::{self, ClientKind, ClientMessage, ServerKind, ServerMessage};
use crate::registry::MessageRegistry;

/// The closed set of protocol phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ProtocolState {
    #[default]
    Handshake = 0,
    Status = 1,
    Login = 2,
    ModHandshake = 3,
    Play = 4,
}

impl ProtocolState {
    pub const ALL: [ProtocolState; 5] = [
        ProtocolState::Handshake,
        ProtocolState::Status,
        ProtocolState::Login,
        ProtocolState::ModHandshake,
        ProtocolState::Play,
    ];

    pub fn from_u8(value: u8) -> Option<ProtocolState> {
        Self::ALL.get(value as usize).copied()
    }

    /// Whether the state machine permits moving to `next`. Staying put is
    /// always allowed; everything else is monotonically forward.
    pub fn can_transition_to(self, next: ProtocolState) -> bool {
        use ProtocolState::*;
        matches!(
            (self, next),
            (Handshake, Status)
                | (Handshake, Login)
                | (Login, Play)
                | (Login, ModHandshake)
                | (ModHandshake, Play)
        ) || self == next
    }

    pub fn validate_transition(self, next: ProtocolState) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(ProtocolError::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl std::fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProtocolState::Handshake => "handshake",
            ProtocolState::Status => "status",
            ProtocolState::Login => "login",
            ProtocolState::ModHandshake => "mod-handshake",
            ProtocolState::Play => "play",
        };
        f.write_str(name)
    }
}

/// One phase's inbound/outbound registry pair.
pub struct PhaseRegistries<C> {
    pub inbound: MessageRegistry<C, ClientMessage>,
    pub outbound: MessageRegistry<C, ServerMessage>,
}

/// The immutable registry configuration for a whole connection: one registry
/// pair per protocol state, plus the mod-handshake sub-protocol pair keyed by
/// its leading type byte.
///
/// Built once at process initialization, sealed, and passed by handle into
/// every session; nothing here is ambient global state.
pub struct ProtocolTable<C> {
    phases: [PhaseRegistries<C>; 5],
    pub mod_inbound: MessageRegistry<C, ClientMessage>,
    pub mod_outbound: MessageRegistry<C, ServerMessage>,
}

impl<C> ProtocolTable<C> {
    /// Builds the table with every opcode, codec, and processor of the
    /// vanilla protocol (plus the mod-handshake extension) registered.
    /// Handlers are attached by the server before [`seal`](Self::seal).
    pub fn vanilla() -> Result<Self> {
        let mut table = ProtocolTable {
            phases: [
                PhaseRegistries {
                    inbound: MessageRegistry::new("handshake/in"),
                    outbound: MessageRegistry::new("handshake/out"),
                },
                PhaseRegistries {
                    inbound: MessageRegistry::new("status/in"),
                    outbound: MessageRegistry::new("status/out"),
                },
                PhaseRegistries {
                    inbound: MessageRegistry::new("login/in"),
                    outbound: MessageRegistry::new("login/out"),
                },
                PhaseRegistries {
                    inbound: MessageRegistry::new("mod-handshake/in"),
                    outbound: MessageRegistry::new("mod-handshake/out"),
                },
                PhaseRegistries {
                    inbound: MessageRegistry::new("play/in"),
                    outbound: MessageRegistry::new("play/out"),
                },
            ],
            mod_inbound: MessageRegistry::new("mod-channel/in"),
            mod_outbound: MessageRegistry::new("mod-channel/out"),
        };

        {
            let phase = table.phase_mut(ProtocolState::Handshake);
            phase.inbound.register(
                0x00,
                ClientKind::Handshake,
                messages::decode_handshake,
                messages::encode_handshake,
            )?;
        }

        {
            let phase = table.phase_mut(ProtocolState::Status);
            phase.inbound.register(
                0x00,
                ClientKind::StatusRequest,
                messages::decode_status_request,
                messages::encode_status_request,
            )?;
            phase.inbound.register(
                0x01,
                ClientKind::StatusPing,
                messages::decode_status_ping,
                messages::encode_status_ping,
            )?;
            phase.outbound.register(
                0x00,
                ServerKind::StatusResponse,
                messages::decode_status_response,
                messages::encode_status_response,
            )?;
            phase.outbound.register(
                0x01,
                ServerKind::StatusPong,
                messages::decode_status_pong,
                messages::encode_status_pong,
            )?;
        }

        {
            let phase = table.phase_mut(ProtocolState::Login);
            phase.inbound.register(
                0x00,
                ClientKind::LoginStart,
                messages::decode_login_start,
                messages::encode_login_start,
            )?;
            phase.inbound.register(
                0x01,
                ClientKind::EncryptionResponse,
                messages::decode_encryption_response,
                messages::encode_encryption_response,
            )?;
            phase.outbound.register(
                0x00,
                ServerKind::LoginDisconnect,
                messages::decode_login_disconnect,
                messages::encode_login_disconnect,
            )?;
            phase.outbound.register(
                0x01,
                ServerKind::EncryptionRequest,
                messages::decode_encryption_request,
                messages::encode_encryption_request,
            )?;
            phase.outbound.register(
                0x02,
                ServerKind::LoginSuccess,
                messages::decode_login_success,
                messages::encode_login_success,
            )?;
            phase.outbound.register(
                0x03,
                ServerKind::SetCompression,
                messages::decode_set_compression,
                messages::encode_set_compression,
            )?;
        }

        // The mod-handshake phase speaks play-numbered wire frames; its real
        // vocabulary lives in the mod-channel sub-registries below.
        for state in [ProtocolState::ModHandshake, ProtocolState::Play] {
            let phase = table.phase_mut(state);
            phase.inbound.register(
                0x00,
                ClientKind::KeepAliveReply,
                messages::decode_keep_alive_reply,
                messages::encode_keep_alive_reply,
            )?;
            phase.inbound.register(
                0x17,
                ClientKind::CustomPayload,
                messages::decode_client_custom_payload,
                messages::encode_client_custom_payload,
            )?;
            phase.outbound.register(
                0x00,
                ServerKind::KeepAlive,
                messages::decode_keep_alive,
                messages::encode_keep_alive,
            )?;
            phase.outbound.register(
                0x3f,
                ServerKind::CustomPayload,
                messages::decode_server_custom_payload,
                messages::encode_server_custom_payload,
            )?;
            phase.outbound.register(
                0x40,
                ServerKind::Disconnect,
                messages::decode_disconnect,
                messages::encode_disconnect,
            )?;

            let outbound = &mut table.phase_mut(state).outbound;
            outbound.register_processor(ServerKind::ModServerHello, messages::process_mod_outbound)?;
            outbound.register_processor(ServerKind::ModList, messages::process_mod_outbound)?;
            outbound
                .register_processor(ServerKind::ModRegistryData, messages::process_mod_outbound)?;
            outbound
                .register_processor(ServerKind::ModRegistrySync, messages::process_mod_outbound)?;
            outbound.register_processor(ServerKind::ModAck, messages::process_mod_outbound)?;
            outbound.register_processor(ServerKind::ModReset, messages::process_mod_outbound)?;
        }

        table.mod_inbound.register(
            messages::mod_opcode::CLIENT_HELLO,
            ClientKind::ModHello,
            messages::decode_mod_hello,
            messages::encode_mod_hello,
        )?;
        table.mod_inbound.register(
            messages::mod_opcode::MOD_LIST,
            ClientKind::ModList,
            messages::decode_client_mod_list,
            messages::encode_client_mod_list,
        )?;
        table.mod_inbound.register(
            messages::mod_opcode::ACK,
            ClientKind::ModAck,
            messages::decode_client_mod_ack,
            messages::encode_client_mod_ack,
        )?;

        table.mod_outbound.register(
            messages::mod_opcode::SERVER_HELLO,
            ServerKind::ModServerHello,
            messages::decode_mod_server_hello,
            messages::encode_mod_server_hello,
        )?;
        table.mod_outbound.register(
            messages::mod_opcode::MOD_LIST,
            ServerKind::ModList,
            messages::decode_server_mod_list,
            messages::encode_server_mod_list,
        )?;
        table.mod_outbound.register(
            messages::mod_opcode::REGISTRY_DATA,
            ServerKind::ModRegistryData,
            messages::decode_mod_registry_data,
            messages::encode_mod_registry_data,
        )?;
        table.mod_outbound.register(
            messages::mod_opcode::ACK,
            ServerKind::ModAck,
            messages::decode_server_mod_ack,
            messages::encode_server_mod_ack,
        )?;
        table.mod_outbound.register(
            messages::mod_opcode::RESET,
            ServerKind::ModReset,
            messages::decode_mod_reset,
            messages::encode_mod_reset,
        )?;

        Ok(table)
    }

    pub fn phase(&self, state: ProtocolState) -> &PhaseRegistries<C> {
        &self.phases[state as usize]
    }

    pub fn phase_mut(&mut self, state: ProtocolState) -> &mut PhaseRegistries<C> {
        &mut self.phases[state as usize]
    }

    /// Seals every registry in the table. Registration afterwards fails.
    pub fn seal(&mut self) {
        for phase in &mut self.phases {
            phase.inbound.seal();
            phase.outbound.seal();
        }
        self.mod_inbound.seal();
        self.mod_outbound.seal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_only() {
        use ProtocolState::*;
        assert!(Handshake.can_transition_to(Status));
        assert!(Handshake.can_transition_to(Login));
        assert!(Login.can_transition_to(Play));
        assert!(Login.can_transition_to(ModHandshake));
        assert!(ModHandshake.can_transition_to(Play));

        assert!(!Status.can_transition_to(Play));
        assert!(!Status.can_transition_to(Login));
        assert!(!Play.can_transition_to(Login));
        assert!(!Play.can_transition_to(Handshake));
        assert!(!Handshake.can_transition_to(Play));
        assert!(!ModHandshake.can_transition_to(Login));
    }

    #[test]
    fn validate_transition_reports_both_states() {
        let err = ProtocolState::Status
            .validate_transition(ProtocolState::Play)
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::IllegalTransition {
                from: ProtocolState::Status,
                to: ProtocolState::Play,
            }
        ));
    }

    #[test]
    fn sealed_table_rejects_registration() {
        let mut table = ProtocolTable::<()>::vanilla().unwrap();
        table.seal();
        let err = table
            .phase_mut(ProtocolState::Play)
            .inbound
            .register(
                0x42,
                ClientKind::StatusRequest,
                messages::decode_status_request,
                messages::encode_status_request,
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::RegistrySealed("play/in")));
    }
}
