//! # Perun
//!
//! A session protocol engine for a block-game server:
//! - Var-int framed wire codec with capped strings and nested data views
//! - Per-phase message registries with pluggable handlers and processors
//! - `Handshake -> Status | Login -> [ModHandshake] -> Play` state machine
//! - Login handshake with RSA key exchange, AES-CFB8 stream encryption, and
//!   off-thread identity verification
//! - Threshold-gated zlib compression negotiated at the end of login
//! - Dual task scheduler: tick-clocked and wall-clocked
//!
//! ## Components
//!
//! - `perun-protocol`: Wire codec, message registries, state machine, and
//!   handshake cryptography
//! - `perun-server`: TCP accept loop, session tasks, login orchestration,
//!   and the schedulers

pub use perun_protocol as protocol;
pub use perun_server as server;
