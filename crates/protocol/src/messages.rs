//! Typed protocol messages
//!
//! Messages are data-oriented tagged unions, one enum per direction, rather
//! than one type per packet. Each variant is immutable after construction and
//! consumed exactly once: decoded by a registry codec and handed to a
//! handler, or built by game logic and written once to the wire.
//!
//! The free `decode_*`/`encode_*` functions in this module are the codec
//! table entries the per-phase registries are built from; dispatch is
//! data-driven through those function pointers, never reflective.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::codec;
use crate::error::{ProtocolError, Result};
use crate::registry::WireMessage;

/// Protocol version this engine speaks.
pub const PROTOCOL_VERSION: i32 = 47;
/// Game version advertised in the status document.
pub const GAME_VERSION: &str = "1.8.9";

/// Named channel the mod-handshake sub-protocol is multiplexed over.
pub const MOD_CHANNEL: &str = "PRN|HS";
/// Version of the mod-handshake sub-protocol itself.
pub const MOD_PROTOCOL_VERSION: u8 = 1;
/// Marker a mod-loader client appends to the handshake address field.
pub const MOD_MARKER: &str = "\0PRN\0";
/// Channel clients/servers use to announce their plugin channels.
pub const REGISTER_CHANNEL: &str = "REGISTER";

/// Handshake intents.
pub const INTENT_STATUS: i32 = 1;
pub const INTENT_LOGIN: i32 = 2;

const USERNAME_CAP: usize = 16;
const ADDRESS_CAP: usize = 255;
const CHANNEL_CAP: usize = 20;
const SERVER_ID_CAP: usize = 20;
const KEY_CAP: usize = 512;
const TOKEN_CAP: usize = 128;
const MOD_NAME_CAP: usize = 64;

/// Leading type bytes of the mod-handshake sub-protocol. They overlap in
/// value with main-phase opcodes, which is legal: the sub-protocol is its own
/// registry namespace.
pub mod mod_opcode {
    pub const SERVER_HELLO: u8 = 0x00;
    pub const CLIENT_HELLO: u8 = 0x01;
    pub const MOD_LIST: u8 = 0x02;
    pub const REGISTRY_DATA: u8 = 0x03;
    pub const RESET: u8 = 0xfe;
    pub const ACK: u8 = 0xff;
}

/// Acknowledge-phase markers echoed during the mod handshake.
pub mod mod_phase {
    pub const WAITING_SERVER_DATA: u8 = 2;
    pub const WAITING_ACK: u8 = 3;
    pub const COMPLETE: u8 = 4;
}

/// One mod advertised during the mod-list exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModEntry {
    pub name: String,
    pub version: String,
}

/// One id mapping inside a registry-data batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub name: String,
    pub id: i32,
}

/// A named id registry to synchronize during the mod handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModRegistry {
    pub name: String,
    pub entries: Vec<RegistryEntry>,
}

// ---- serverbound -------------------------------------------------------

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// The single handshake message; its intent picks the next state.
    Handshake {
        protocol_version: i32,
        address: String,
        port: u16,
        intent: i32,
    },
    StatusRequest,
    StatusPing {
        time: i64,
    },
    LoginStart {
        username: String,
    },
    /// Shared secret and echoed verify token, both RSA-encrypted.
    EncryptionResponse {
        shared_secret: Vec<u8>,
        verify_token: Vec<u8>,
    },
    KeepAliveReply {
        id: i64,
    },
    CustomPayload {
        channel: String,
        data: Bytes,
    },
    // mod-handshake sub-messages (travel inside CustomPayload frames)
    ModHello {
        protocol_version: u8,
    },
    ModList {
        mods: Vec<ModEntry>,
    },
    ModAck {
        phase: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientKind {
    Handshake,
    StatusRequest,
    StatusPing,
    LoginStart,
    EncryptionResponse,
    KeepAliveReply,
    CustomPayload,
    ModHello,
    ModList,
    ModAck,
}

impl ClientKind {
    pub fn name(self) -> &'static str {
        match self {
            ClientKind::Handshake => "Handshake",
            ClientKind::StatusRequest => "StatusRequest",
            ClientKind::StatusPing => "StatusPing",
            ClientKind::LoginStart => "LoginStart",
            ClientKind::EncryptionResponse => "EncryptionResponse",
            ClientKind::KeepAliveReply => "KeepAliveReply",
            ClientKind::CustomPayload => "CustomPayload",
            ClientKind::ModHello => "ModHello",
            ClientKind::ModList => "ModList",
            ClientKind::ModAck => "ModAck",
        }
    }
}

impl std::fmt::Display for ClientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl WireMessage for ClientMessage {
    type Kind = ClientKind;

    fn kind(&self) -> ClientKind {
        match self {
            ClientMessage::Handshake { .. } => ClientKind::Handshake,
            ClientMessage::StatusRequest => ClientKind::StatusRequest,
            ClientMessage::StatusPing { .. } => ClientKind::StatusPing,
            ClientMessage::LoginStart { .. } => ClientKind::LoginStart,
            ClientMessage::EncryptionResponse { .. } => ClientKind::EncryptionResponse,
            ClientMessage::KeepAliveReply { .. } => ClientKind::KeepAliveReply,
            ClientMessage::CustomPayload { .. } => ClientKind::CustomPayload,
            ClientMessage::ModHello { .. } => ClientKind::ModHello,
            ClientMessage::ModList { .. } => ClientKind::ModList,
            ClientMessage::ModAck { .. } => ClientKind::ModAck,
        }
    }

    fn kind_name(kind: ClientKind) -> &'static str {
        kind.name()
    }
}

// ---- clientbound -------------------------------------------------------

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    StatusResponse {
        json: String,
    },
    StatusPong {
        time: i64,
    },
    /// Kick during the login phase; `reason` is a chat-document string.
    LoginDisconnect {
        reason: String,
    },
    EncryptionRequest {
        server_id: String,
        public_key: Vec<u8>,
        verify_token: Vec<u8>,
    },
    LoginSuccess {
        uuid: Uuid,
        username: String,
    },
    SetCompression {
        threshold: i32,
    },
    KeepAlive {
        id: i64,
    },
    /// Kick during play; `reason` is a chat-document string.
    Disconnect {
        reason: String,
    },
    CustomPayload {
        channel: String,
        data: Bytes,
    },
    // mod-handshake sub-messages (travel inside CustomPayload frames)
    ModServerHello {
        protocol_version: u8,
        dimension: i32,
    },
    ModList {
        mods: Vec<ModEntry>,
    },
    /// Wire form of one registry-data batch.
    ModRegistryData {
        has_more: bool,
        name: String,
        entries: Vec<RegistryEntry>,
    },
    /// Logical request to synchronize every registry; the outbound processor
    /// fans this out into one `ModRegistryData` payload per registry. Never
    /// appears on the wire itself.
    ModRegistrySync {
        registries: Vec<ModRegistry>,
    },
    ModAck {
        phase: u8,
    },
    ModReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerKind {
    StatusResponse,
    StatusPong,
    LoginDisconnect,
    EncryptionRequest,
    LoginSuccess,
    SetCompression,
    KeepAlive,
    Disconnect,
    CustomPayload,
    ModServerHello,
    ModList,
    ModRegistryData,
    ModRegistrySync,
    ModAck,
    ModReset,
}

impl ServerKind {
    pub fn name(self) -> &'static str {
        match self {
            ServerKind::StatusResponse => "StatusResponse",
            ServerKind::StatusPong => "StatusPong",
            ServerKind::LoginDisconnect => "LoginDisconnect",
            ServerKind::EncryptionRequest => "EncryptionRequest",
            ServerKind::LoginSuccess => "LoginSuccess",
            ServerKind::SetCompression => "SetCompression",
            ServerKind::KeepAlive => "KeepAlive",
            ServerKind::Disconnect => "Disconnect",
            ServerKind::CustomPayload => "CustomPayload",
            ServerKind::ModServerHello => "ModServerHello",
            ServerKind::ModList => "ModList",
            ServerKind::ModRegistryData => "ModRegistryData",
            ServerKind::ModRegistrySync => "ModRegistrySync",
            ServerKind::ModAck => "ModAck",
            ServerKind::ModReset => "ModReset",
        }
    }
}

impl std::fmt::Display for ServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl WireMessage for ServerMessage {
    type Kind = ServerKind;

    fn kind(&self) -> ServerKind {
        match self {
            ServerMessage::StatusResponse { .. } => ServerKind::StatusResponse,
            ServerMessage::StatusPong { .. } => ServerKind::StatusPong,
            ServerMessage::LoginDisconnect { .. } => ServerKind::LoginDisconnect,
            ServerMessage::EncryptionRequest { .. } => ServerKind::EncryptionRequest,
            ServerMessage::LoginSuccess { .. } => ServerKind::LoginSuccess,
            ServerMessage::SetCompression { .. } => ServerKind::SetCompression,
            ServerMessage::KeepAlive { .. } => ServerKind::KeepAlive,
            ServerMessage::Disconnect { .. } => ServerKind::Disconnect,
            ServerMessage::CustomPayload { .. } => ServerKind::CustomPayload,
            ServerMessage::ModServerHello { .. } => ServerKind::ModServerHello,
            ServerMessage::ModList { .. } => ServerKind::ModList,
            ServerMessage::ModRegistryData { .. } => ServerKind::ModRegistryData,
            ServerMessage::ModRegistrySync { .. } => ServerKind::ModRegistrySync,
            ServerMessage::ModAck { .. } => ServerKind::ModAck,
            ServerMessage::ModReset => ServerKind::ModReset,
        }
    }

    fn kind_name(kind: ServerKind) -> &'static str {
        kind.name()
    }
}

// ---- serverbound codecs ------------------------------------------------

pub fn decode_handshake(buf: &mut Bytes) -> Result<ClientMessage> {
    Ok(ClientMessage::Handshake {
        protocol_version: codec::read_var_int(buf)?,
        address: codec::read_string(buf, ADDRESS_CAP)?,
        port: codec::read_u16(buf)?,
        intent: codec::read_var_int(buf)?,
    })
}

pub fn encode_handshake(message: &ClientMessage, buf: &mut BytesMut) -> Result<()> {
    let ClientMessage::Handshake {
        protocol_version,
        address,
        port,
        intent,
    } = message
    else {
        return Err(ProtocolError::DispatchMismatch("Handshake"));
    };
    codec::write_var_int(buf, *protocol_version);
    codec::write_string(buf, address);
    buf.put_u16(*port);
    codec::write_var_int(buf, *intent);
    Ok(())
}

pub fn decode_status_request(_buf: &mut Bytes) -> Result<ClientMessage> {
    Ok(ClientMessage::StatusRequest)
}

pub fn encode_status_request(message: &ClientMessage, _buf: &mut BytesMut) -> Result<()> {
    match message {
        ClientMessage::StatusRequest => Ok(()),
        _ => Err(ProtocolError::DispatchMismatch("StatusRequest")),
    }
}

pub fn decode_status_ping(buf: &mut Bytes) -> Result<ClientMessage> {
    Ok(ClientMessage::StatusPing {
        time: codec::read_i64(buf)?,
    })
}

pub fn encode_status_ping(message: &ClientMessage, buf: &mut BytesMut) -> Result<()> {
    let ClientMessage::StatusPing { time } = message else {
        return Err(ProtocolError::DispatchMismatch("StatusPing"));
    };
    buf.put_i64(*time);
    Ok(())
}

pub fn decode_login_start(buf: &mut Bytes) -> Result<ClientMessage> {
    Ok(ClientMessage::LoginStart {
        username: codec::read_string(buf, USERNAME_CAP)?,
    })
}

pub fn encode_login_start(message: &ClientMessage, buf: &mut BytesMut) -> Result<()> {
    let ClientMessage::LoginStart { username } = message else {
        return Err(ProtocolError::DispatchMismatch("LoginStart"));
    };
    codec::write_string(buf, username);
    Ok(())
}

pub fn decode_encryption_response(buf: &mut Bytes) -> Result<ClientMessage> {
    Ok(ClientMessage::EncryptionResponse {
        shared_secret: codec::read_blob(buf, KEY_CAP)?,
        verify_token: codec::read_blob(buf, TOKEN_CAP)?,
    })
}

pub fn encode_encryption_response(message: &ClientMessage, buf: &mut BytesMut) -> Result<()> {
    let ClientMessage::EncryptionResponse {
        shared_secret,
        verify_token,
    } = message
    else {
        return Err(ProtocolError::DispatchMismatch("EncryptionResponse"));
    };
    codec::write_blob(buf, shared_secret);
    codec::write_blob(buf, verify_token);
    Ok(())
}

pub fn decode_keep_alive_reply(buf: &mut Bytes) -> Result<ClientMessage> {
    Ok(ClientMessage::KeepAliveReply {
        id: codec::read_i64(buf)?,
    })
}

pub fn encode_keep_alive_reply(message: &ClientMessage, buf: &mut BytesMut) -> Result<()> {
    let ClientMessage::KeepAliveReply { id } = message else {
        return Err(ProtocolError::DispatchMismatch("KeepAliveReply"));
    };
    buf.put_i64(*id);
    Ok(())
}

pub fn decode_client_custom_payload(buf: &mut Bytes) -> Result<ClientMessage> {
    let channel = codec::read_string(buf, CHANNEL_CAP)?;
    let data = buf.split_to(buf.len());
    Ok(ClientMessage::CustomPayload { channel, data })
}

pub fn encode_client_custom_payload(message: &ClientMessage, buf: &mut BytesMut) -> Result<()> {
    let ClientMessage::CustomPayload { channel, data } = message else {
        return Err(ProtocolError::DispatchMismatch("CustomPayload"));
    };
    codec::write_string(buf, channel);
    buf.put_slice(data);
    Ok(())
}

pub fn decode_mod_hello(buf: &mut Bytes) -> Result<ClientMessage> {
    Ok(ClientMessage::ModHello {
        protocol_version: codec::read_u8(buf)?,
    })
}

pub fn encode_mod_hello(message: &ClientMessage, buf: &mut BytesMut) -> Result<()> {
    let ClientMessage::ModHello { protocol_version } = message else {
        return Err(ProtocolError::DispatchMismatch("ModHello"));
    };
    buf.put_u8(*protocol_version);
    Ok(())
}

fn decode_mod_entries(buf: &mut Bytes) -> Result<Vec<ModEntry>> {
    let count = codec::read_var_int(buf)?;
    if count < 0 {
        return Err(ProtocolError::MalformedFrame("negative mod list length"));
    }
    let mut mods = Vec::new();
    for _ in 0..count {
        mods.push(ModEntry {
            name: codec::read_string(buf, MOD_NAME_CAP)?,
            version: codec::read_string(buf, MOD_NAME_CAP)?,
        });
    }
    Ok(mods)
}

fn encode_mod_entries(mods: &[ModEntry], buf: &mut BytesMut) {
    codec::write_var_int(buf, mods.len() as i32);
    for entry in mods {
        codec::write_string(buf, &entry.name);
        codec::write_string(buf, &entry.version);
    }
}

pub fn decode_client_mod_list(buf: &mut Bytes) -> Result<ClientMessage> {
    Ok(ClientMessage::ModList {
        mods: decode_mod_entries(buf)?,
    })
}

pub fn encode_client_mod_list(message: &ClientMessage, buf: &mut BytesMut) -> Result<()> {
    let ClientMessage::ModList { mods } = message else {
        return Err(ProtocolError::DispatchMismatch("ModList"));
    };
    encode_mod_entries(mods, buf);
    Ok(())
}

pub fn decode_client_mod_ack(buf: &mut Bytes) -> Result<ClientMessage> {
    Ok(ClientMessage::ModAck {
        phase: codec::read_u8(buf)?,
    })
}

pub fn encode_client_mod_ack(message: &ClientMessage, buf: &mut BytesMut) -> Result<()> {
    let ClientMessage::ModAck { phase } = message else {
        return Err(ProtocolError::DispatchMismatch("ModAck"));
    };
    buf.put_u8(*phase);
    Ok(())
}

// ---- clientbound codecs ------------------------------------------------

pub fn decode_status_response(buf: &mut Bytes) -> Result<ServerMessage> {
    Ok(ServerMessage::StatusResponse {
        json: codec::read_string(buf, codec::DEFAULT_STRING_CAP)?,
    })
}

pub fn encode_status_response(message: &ServerMessage, buf: &mut BytesMut) -> Result<()> {
    let ServerMessage::StatusResponse { json } = message else {
        return Err(ProtocolError::DispatchMismatch("StatusResponse"));
    };
    codec::write_string(buf, json);
    Ok(())
}

pub fn decode_status_pong(buf: &mut Bytes) -> Result<ServerMessage> {
    Ok(ServerMessage::StatusPong {
        time: codec::read_i64(buf)?,
    })
}

pub fn encode_status_pong(message: &ServerMessage, buf: &mut BytesMut) -> Result<()> {
    let ServerMessage::StatusPong { time } = message else {
        return Err(ProtocolError::DispatchMismatch("StatusPong"));
    };
    buf.put_i64(*time);
    Ok(())
}

pub fn decode_login_disconnect(buf: &mut Bytes) -> Result<ServerMessage> {
    Ok(ServerMessage::LoginDisconnect {
        reason: codec::read_string(buf, codec::DEFAULT_STRING_CAP)?,
    })
}

pub fn encode_login_disconnect(message: &ServerMessage, buf: &mut BytesMut) -> Result<()> {
    let ServerMessage::LoginDisconnect { reason } = message else {
        return Err(ProtocolError::DispatchMismatch("LoginDisconnect"));
    };
    codec::write_string(buf, reason);
    Ok(())
}

pub fn decode_encryption_request(buf: &mut Bytes) -> Result<ServerMessage> {
    Ok(ServerMessage::EncryptionRequest {
        server_id: codec::read_string(buf, SERVER_ID_CAP)?,
        public_key: codec::read_blob(buf, KEY_CAP)?,
        verify_token: codec::read_blob(buf, TOKEN_CAP)?,
    })
}

pub fn encode_encryption_request(message: &ServerMessage, buf: &mut BytesMut) -> Result<()> {
    let ServerMessage::EncryptionRequest {
        server_id,
        public_key,
        verify_token,
    } = message
    else {
        return Err(ProtocolError::DispatchMismatch("EncryptionRequest"));
    };
    codec::write_string(buf, server_id);
    codec::write_blob(buf, public_key);
    codec::write_blob(buf, verify_token);
    Ok(())
}

pub fn decode_login_success(buf: &mut Bytes) -> Result<ServerMessage> {
    let raw = codec::read_string(buf, 36)?;
    let uuid = Uuid::parse_str(&raw)
        .map_err(|_| ProtocolError::MalformedFrame("invalid uuid in login success"))?;
    Ok(ServerMessage::LoginSuccess {
        uuid,
        username: codec::read_string(buf, USERNAME_CAP)?,
    })
}

pub fn encode_login_success(message: &ServerMessage, buf: &mut BytesMut) -> Result<()> {
    let ServerMessage::LoginSuccess { uuid, username } = message else {
        return Err(ProtocolError::DispatchMismatch("LoginSuccess"));
    };
    codec::write_string(buf, &uuid.hyphenated().to_string());
    codec::write_string(buf, username);
    Ok(())
}

pub fn decode_set_compression(buf: &mut Bytes) -> Result<ServerMessage> {
    Ok(ServerMessage::SetCompression {
        threshold: codec::read_var_int(buf)?,
    })
}

pub fn encode_set_compression(message: &ServerMessage, buf: &mut BytesMut) -> Result<()> {
    let ServerMessage::SetCompression { threshold } = message else {
        return Err(ProtocolError::DispatchMismatch("SetCompression"));
    };
    codec::write_var_int(buf, *threshold);
    Ok(())
}

pub fn decode_keep_alive(buf: &mut Bytes) -> Result<ServerMessage> {
    Ok(ServerMessage::KeepAlive {
        id: codec::read_i64(buf)?,
    })
}

pub fn encode_keep_alive(message: &ServerMessage, buf: &mut BytesMut) -> Result<()> {
    let ServerMessage::KeepAlive { id } = message else {
        return Err(ProtocolError::DispatchMismatch("KeepAlive"));
    };
    buf.put_i64(*id);
    Ok(())
}

pub fn decode_disconnect(buf: &mut Bytes) -> Result<ServerMessage> {
    Ok(ServerMessage::Disconnect {
        reason: codec::read_string(buf, codec::DEFAULT_STRING_CAP)?,
    })
}

pub fn encode_disconnect(message: &ServerMessage, buf: &mut BytesMut) -> Result<()> {
    let ServerMessage::Disconnect { reason } = message else {
        return Err(ProtocolError::DispatchMismatch("Disconnect"));
    };
    codec::write_string(buf, reason);
    Ok(())
}

pub fn decode_server_custom_payload(buf: &mut Bytes) -> Result<ServerMessage> {
    let channel = codec::read_string(buf, CHANNEL_CAP)?;
    let data = buf.split_to(buf.len());
    Ok(ServerMessage::CustomPayload { channel, data })
}

pub fn encode_server_custom_payload(message: &ServerMessage, buf: &mut BytesMut) -> Result<()> {
    let ServerMessage::CustomPayload { channel, data } = message else {
        return Err(ProtocolError::DispatchMismatch("CustomPayload"));
    };
    codec::write_string(buf, channel);
    buf.put_slice(data);
    Ok(())
}

pub fn decode_mod_server_hello(buf: &mut Bytes) -> Result<ServerMessage> {
    Ok(ServerMessage::ModServerHello {
        protocol_version: codec::read_u8(buf)?,
        dimension: codec::read_i32(buf)?,
    })
}

pub fn encode_mod_server_hello(message: &ServerMessage, buf: &mut BytesMut) -> Result<()> {
    let ServerMessage::ModServerHello {
        protocol_version,
        dimension,
    } = message
    else {
        return Err(ProtocolError::DispatchMismatch("ModServerHello"));
    };
    buf.put_u8(*protocol_version);
    buf.put_i32(*dimension);
    Ok(())
}

pub fn decode_server_mod_list(buf: &mut Bytes) -> Result<ServerMessage> {
    Ok(ServerMessage::ModList {
        mods: decode_mod_entries(buf)?,
    })
}

pub fn encode_server_mod_list(message: &ServerMessage, buf: &mut BytesMut) -> Result<()> {
    let ServerMessage::ModList { mods } = message else {
        return Err(ProtocolError::DispatchMismatch("ModList"));
    };
    encode_mod_entries(mods, buf);
    Ok(())
}

pub fn decode_mod_registry_data(buf: &mut Bytes) -> Result<ServerMessage> {
    let has_more = codec::read_bool(buf)?;
    let name = codec::read_string(buf, MOD_NAME_CAP)?;
    let count = codec::read_var_int(buf)?;
    if count < 0 {
        return Err(ProtocolError::MalformedFrame("negative registry length"));
    }
    let mut entries = Vec::new();
    for _ in 0..count {
        entries.push(RegistryEntry {
            name: codec::read_string(buf, codec::DEFAULT_STRING_CAP)?,
            id: codec::read_var_int(buf)?,
        });
    }
    Ok(ServerMessage::ModRegistryData {
        has_more,
        name,
        entries,
    })
}

pub fn encode_mod_registry_data(message: &ServerMessage, buf: &mut BytesMut) -> Result<()> {
    let ServerMessage::ModRegistryData {
        has_more,
        name,
        entries,
    } = message
    else {
        return Err(ProtocolError::DispatchMismatch("ModRegistryData"));
    };
    codec::write_bool(buf, *has_more);
    codec::write_string(buf, name);
    codec::write_var_int(buf, entries.len() as i32);
    for entry in entries {
        codec::write_string(buf, &entry.name);
        codec::write_var_int(buf, entry.id);
    }
    Ok(())
}

pub fn decode_server_mod_ack(buf: &mut Bytes) -> Result<ServerMessage> {
    Ok(ServerMessage::ModAck {
        phase: codec::read_u8(buf)?,
    })
}

pub fn encode_server_mod_ack(message: &ServerMessage, buf: &mut BytesMut) -> Result<()> {
    let ServerMessage::ModAck { phase } = message else {
        return Err(ProtocolError::DispatchMismatch("ModAck"));
    };
    buf.put_u8(*phase);
    Ok(())
}

pub fn decode_mod_reset(_buf: &mut Bytes) -> Result<ServerMessage> {
    Ok(ServerMessage::ModReset)
}

pub fn encode_mod_reset(message: &ServerMessage, _buf: &mut BytesMut) -> Result<()> {
    match message {
        ServerMessage::ModReset => Ok(()),
        _ => Err(ProtocolError::DispatchMismatch("ModReset")),
    }
}

// ---- mod-handshake multiplexing ----------------------------------------

fn mod_payload(type_byte: u8, encode: impl FnOnce(&mut BytesMut) -> Result<()>) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    buf.put_u8(type_byte);
    encode(&mut buf)?;
    Ok(buf.freeze())
}

fn wrap_mod_payload(data: Bytes) -> ServerMessage {
    ServerMessage::CustomPayload {
        channel: MOD_CHANNEL.to_owned(),
        data,
    }
}

/// Outbound processor for the mod-handshake sub-protocol: turns one logical
/// mod message into the physical `CustomPayload` frames that carry it. A
/// registry sync fans out into one payload per registry, with the
/// more-data-follows flag set on all but the last.
pub fn process_mod_outbound(message: ServerMessage) -> Result<Vec<ServerMessage>> {
    match message {
        ServerMessage::ModRegistrySync { registries } => {
            let total = registries.len();
            let mut out = Vec::with_capacity(total);
            for (index, registry) in registries.into_iter().enumerate() {
                let wire = ServerMessage::ModRegistryData {
                    has_more: index + 1 < total,
                    name: registry.name,
                    entries: registry.entries,
                };
                let data = mod_payload(mod_opcode::REGISTRY_DATA, |buf| {
                    encode_mod_registry_data(&wire, buf)
                })?;
                out.push(wrap_mod_payload(data));
            }
            Ok(out)
        }
        message @ ServerMessage::ModServerHello { .. } => {
            let data =
                mod_payload(mod_opcode::SERVER_HELLO, |buf| encode_mod_server_hello(&message, buf))?;
            Ok(vec![wrap_mod_payload(data)])
        }
        message @ ServerMessage::ModList { .. } => {
            let data = mod_payload(mod_opcode::MOD_LIST, |buf| encode_server_mod_list(&message, buf))?;
            Ok(vec![wrap_mod_payload(data)])
        }
        message @ ServerMessage::ModRegistryData { .. } => {
            let data = mod_payload(mod_opcode::REGISTRY_DATA, |buf| {
                encode_mod_registry_data(&message, buf)
            })?;
            Ok(vec![wrap_mod_payload(data)])
        }
        message @ ServerMessage::ModAck { .. } => {
            let data = mod_payload(mod_opcode::ACK, |buf| encode_server_mod_ack(&message, buf))?;
            Ok(vec![wrap_mod_payload(data)])
        }
        ServerMessage::ModReset => {
            let data = mod_payload(mod_opcode::RESET, |buf| encode_mod_reset(&ServerMessage::ModReset, buf))?;
            Ok(vec![wrap_mod_payload(data)])
        }
        _ => Err(ProtocolError::DispatchMismatch("mod outbound processor")),
    }
}
