//! # Perun protocol
//!
//! Core protocol definitions for the Perun game server: the wire codec, the
//! per-phase message registries, the protocol state machine, and the
//! handshake cryptography.
//!
//! This crate provides:
//! - `codec`: var-int/fixed-width/string wire primitives over [`bytes`]
//! - `dataview`: self-describing nested key/value documents
//! - `messages`: the serverbound/clientbound message unions and their codecs
//! - `registry`: opcode <-> kind <-> codec dispatch tables with handlers and
//!   outbound processors
//! - `state`: the `Handshake -> Status | Login -> [ModHandshake] -> Play`
//!   state machine and the sealed per-phase registry table
//! - `compression`: the threshold-gated zlib envelope
//! - `encryption`: AES-128-CFB8 stream cipher, RSA handshake keypair, and
//!   the signed-hex server digest
//! - `auth`: the session-verification client and the offline identity rules
//!
//! The server crate drives these pieces; nothing in here owns a socket.

pub mod auth;
pub mod codec;
pub mod compression;
pub mod dataview;
pub mod encryption;
pub mod error;
pub mod messages;
pub mod registry;
pub mod state;

pub use auth::{Authenticator, GameProfile, SessionService, StaticAuthenticator};
pub use compression::{CompressionStage, COMPRESSION_DISABLED};
pub use dataview::{DataView, ViewValue};
pub use encryption::{cipher_pair, server_digest, CipherDec, CipherEnc, ServerKeyPair};
pub use error::{ProtocolError, Result};
pub use messages::{
    ClientKind, ClientMessage, ModEntry, ModRegistry, RegistryEntry, ServerKind, ServerMessage,
    GAME_VERSION, MOD_CHANNEL, MOD_MARKER, MOD_PROTOCOL_VERSION, PROTOCOL_VERSION,
    REGISTER_CHANNEL,
};
pub use registry::{MessageHandler, MessageRegistry, WireMessage};
pub use state::{PhaseRegistries, ProtocolState, ProtocolTable};
