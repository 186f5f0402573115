//! Error taxonomy for the protocol engine
//!
//! The variants group into the classes the connection layer cares about:
//! decode errors, compression errors, cryptographic errors, authentication
//! errors, and registration/state errors. Decode, crypto, and auth errors are
//! fatal to the connection that raised them; registration errors are startup
//! programmer errors and abort server construction.

use thiserror::Error;

use crate::state::ProtocolState;

#[derive(Debug, Error)]
pub enum ProtocolError {
    // ---- decode errors -------------------------------------------------
    /// A read ran past the end of the buffer.
    #[error("buffer too short: need {need} more bytes, have {have}")]
    BufferTooShort { need: usize, have: usize },

    /// A var-int/var-long continuation bit never terminated.
    #[error("variable-length integer exceeds {max_bytes} bytes")]
    VarIntTooLong { max_bytes: usize },

    /// A string declared a length over the field's cap. Decoding fails
    /// outright; strings are never silently truncated.
    #[error("declared string length {declared} exceeds cap of {cap}")]
    StringTooLong { declared: usize, cap: usize },

    /// A length-prefixed byte blob declared a length over the field's cap.
    #[error("declared byte array length {declared} exceeds cap of {cap}")]
    BlobTooLong { declared: usize, cap: usize },

    /// A string payload was not valid UTF-8.
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,

    /// A frame carried an opcode the current registry knows nothing about.
    #[error("unknown opcode {opcode:#04x} in registry `{registry}`")]
    UnknownOpcode { opcode: u8, registry: &'static str },

    /// Structurally invalid frame (bad length prefix, trailing bytes, ...).
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// A data view carried an unrecognized value tag.
    #[error("unknown data view tag {0:#04x}")]
    UnknownViewTag(u8),

    /// A data view nested deeper than the decoder allows.
    #[error("data view nested deeper than {0} levels")]
    ViewTooDeep(usize),

    // ---- compression errors --------------------------------------------
    /// The zlib stream could not be inflated/deflated.
    #[error("zlib error: {0}")]
    Zlib(#[from] std::io::Error),

    /// The inflated body did not match the declared uncompressed length.
    #[error("decompressed length {actual} does not match declared {declared}")]
    CompressionSizeMismatch { declared: usize, actual: usize },

    // ---- cryptographic errors ------------------------------------------
    /// RSA keypair generation failed at startup.
    #[error("keypair generation failed: {0}")]
    KeyGeneration(String),

    /// Ciphertext from the client could not be decrypted with our key.
    #[error("key decryption failed")]
    KeyDecryptFailed,

    /// The echoed verify token does not match the one we issued. This is the
    /// replay/tamper guard of the login handshake.
    #[error("invalid verify token")]
    VerifyTokenMismatch,

    /// The decrypted shared secret has the wrong length for AES-128.
    #[error("shared secret has invalid length {0}, expected 16")]
    InvalidSecretLength(usize),

    /// A stream cipher was installed twice on the same direction.
    #[error("stream cipher already installed")]
    CipherAlreadyInstalled,

    // ---- authentication errors -----------------------------------------
    /// The session service could not be reached at all.
    #[error("authentication service unreachable: {0}")]
    AuthTransport(String),

    /// The session service answered with a non-success status.
    #[error("authentication service returned status {0}")]
    AuthStatus(u16),

    /// The session service body could not be understood.
    #[error("authentication response malformed: {0}")]
    AuthMalformed(String),

    /// The session service does not know about this login attempt.
    #[error("player has not joined this server")]
    NotJoined,

    /// The session service verified a different profile name than the one
    /// that started the login.
    #[error("authentication verified unexpected profile `{0}`")]
    AuthWrongProfile(String),

    // ---- registration & state errors -----------------------------------
    /// Two registrations claimed the same opcode in one registry.
    #[error("duplicate opcode {opcode:#04x} in registry `{registry}`")]
    DuplicateOpcode { opcode: u8, registry: &'static str },

    /// Two registrations claimed the same message kind in one registry.
    #[error("duplicate message kind `{kind}` in registry `{registry}`")]
    DuplicateKind { kind: &'static str, registry: &'static str },

    /// A message was encoded against a registry that never registered its
    /// kind.
    #[error("message kind `{kind}` is not registered in `{registry}`")]
    UnregisteredKind {
        kind: &'static str,
        registry: &'static str,
    },

    /// A registration arrived after the registry was sealed.
    #[error("registry `{0}` is sealed")]
    RegistrySealed(&'static str),

    /// A message reached a codec or handler registered for another kind.
    #[error("message `{0}` routed to a mismatched codec or handler")]
    DispatchMismatch(&'static str),

    /// The session attempted a transition the state machine forbids.
    #[error("illegal protocol transition {from} -> {to}")]
    IllegalTransition {
        from: ProtocolState,
        to: ProtocolState,
    },

    /// The peer went away while an operation was still waiting on it.
    #[error("connection closed")]
    ConnectionClosed,
}

impl ProtocolError {
    /// Human-readable reason suitable for a disconnect packet.
    ///
    /// Operators and clients need to tell "bad config" apart from "tampered
    /// handshake" apart from "couldn't verify", so each error class maps to
    /// its own wording.
    pub fn disconnect_reason(&self) -> String {
        use ProtocolError::*;
        match self {
            VerifyTokenMismatch => "Invalid verify token".into(),
            KeyDecryptFailed | InvalidSecretLength(_) | CipherAlreadyInstalled => {
                "Encryption handshake failed".into()
            }
            KeyGeneration(_) => "Server encryption is misconfigured".into(),
            NotJoined | AuthWrongProfile(_) => "Failed to verify username".into(),
            AuthTransport(_) | AuthStatus(_) | AuthMalformed(_) => {
                "Authentication service is unavailable".into()
            }
            BufferTooShort { .. }
            | VarIntTooLong { .. }
            | StringTooLong { .. }
            | BlobTooLong { .. }
            | InvalidUtf8
            | UnknownOpcode { .. }
            | MalformedFrame(_)
            | UnknownViewTag(_)
            | ViewTooDeep(_)
            | Zlib(_)
            | CompressionSizeMismatch { .. } => "Protocol error".into(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
