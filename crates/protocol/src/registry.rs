//! Message registries: opcode <-> kind <-> codec dispatch tables
//!
//! A [`MessageRegistry`] is the per-phase, per-direction mapping from numeric
//! opcode to message kind to codec functions, with optional handlers and
//! processors attached per kind. Registries are built once at startup,
//! [`sealed`](MessageRegistry::seal), and read-only thereafter; every lookup
//! is O(1).
//!
//! Dispatch is data-driven: decoding goes through plain function pointers
//! registered next to the opcode, never through runtime type introspection.
//!
//! - A **processor** transforms one outbound logical message into zero or
//!   more wire messages before encoding (handshake sub-messages multiplexed
//!   onto a custom payload channel need 0..N physical packets per logical
//!   action).
//! - A **handler** consumes one fully decoded inbound message. Exactly one
//!   handler runs per message; a registered kind without a handler is legal
//!   (decode and discard), an unregistered opcode is a protocol error.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};

use crate::codec;
use crate::error::{ProtocolError, Result};

/// A direction-specific wire message set (a tagged union of payloads) keyed
/// by a small copyable `Kind` discriminant.
pub trait WireMessage: Send + Sized + fmt::Debug + 'static {
    type Kind: Copy + Eq + Hash + fmt::Display + fmt::Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;

    fn kind_name(kind: Self::Kind) -> &'static str;
}

/// Decodes one payload (opcode already stripped) into a message.
pub type DecodeFn<M> = fn(&mut Bytes) -> Result<M>;
/// Encodes one message's payload (opcode written by the caller).
pub type EncodeFn<M> = fn(&M, &mut BytesMut) -> Result<()>;
/// Fans one logical outbound message out into 0..N wire messages.
pub type ProcessFn<M> = fn(M) -> Result<Vec<M>>;

/// Consumes one decoded inbound message and produces side effects on the
/// connection context `C`.
#[async_trait]
pub trait MessageHandler<C, M>: Send + Sync {
    async fn handle(&self, ctx: &mut C, message: M) -> Result<()>;
}

struct Codec<M: WireMessage> {
    kind: M::Kind,
    decode: DecodeFn<M>,
    encode: EncodeFn<M>,
}

/// One phase/direction's dispatch table.
pub struct MessageRegistry<C, M: WireMessage> {
    name: &'static str,
    by_opcode: HashMap<u8, Codec<M>>,
    opcode_by_kind: HashMap<M::Kind, u8>,
    processors: HashMap<M::Kind, ProcessFn<M>>,
    handlers: HashMap<M::Kind, Arc<dyn MessageHandler<C, M>>>,
    sealed: bool,
}

impl<C, M: WireMessage> MessageRegistry<C, M> {
    /// Creates an empty, unsealed registry. `name` shows up in registration
    /// and unknown-opcode errors (e.g. `"login/in"`).
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            by_opcode: HashMap::new(),
            opcode_by_kind: HashMap::new(),
            processors: HashMap::new(),
            handlers: HashMap::new(),
            sealed: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn check_unsealed(&self) -> Result<()> {
        if self.sealed {
            Err(ProtocolError::RegistrySealed(self.name))
        } else {
            Ok(())
        }
    }

    /// Registers an opcode with its message kind and codec pair. Duplicate
    /// opcodes and duplicate kinds are startup errors.
    pub fn register(
        &mut self,
        opcode: u8,
        kind: M::Kind,
        decode: DecodeFn<M>,
        encode: EncodeFn<M>,
    ) -> Result<()> {
        self.check_unsealed()?;
        if self.by_opcode.contains_key(&opcode) {
            return Err(ProtocolError::DuplicateOpcode {
                opcode,
                registry: self.name,
            });
        }
        if self.opcode_by_kind.contains_key(&kind) {
            return Err(ProtocolError::DuplicateKind {
                kind: M::kind_name(kind),
                registry: self.name,
            });
        }
        self.by_opcode.insert(
            opcode,
            Codec {
                kind,
                decode,
                encode,
            },
        );
        self.opcode_by_kind.insert(kind, opcode);
        Ok(())
    }

    /// Attaches an outbound processor to a kind. Logical-only kinds (fanned
    /// out into other wire messages) may register a processor without an
    /// opcode.
    pub fn register_processor(&mut self, kind: M::Kind, processor: ProcessFn<M>) -> Result<()> {
        self.check_unsealed()?;
        if self.processors.insert(kind, processor).is_some() {
            return Err(ProtocolError::DuplicateKind {
                kind: M::kind_name(kind),
                registry: self.name,
            });
        }
        Ok(())
    }

    /// Attaches an inbound handler to a kind.
    pub fn register_handler(
        &mut self,
        kind: M::Kind,
        handler: Arc<dyn MessageHandler<C, M>>,
    ) -> Result<()> {
        self.check_unsealed()?;
        if self.handlers.insert(kind, handler).is_some() {
            return Err(ProtocolError::DuplicateKind {
                kind: M::kind_name(kind),
                registry: self.name,
            });
        }
        Ok(())
    }

    /// Marks the registry read-only. Irreversible.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Forward lookup: opcode to message kind.
    pub fn kind_of(&self, opcode: u8) -> Option<M::Kind> {
        self.by_opcode.get(&opcode).map(|codec| codec.kind)
    }

    /// Inverse lookup: message kind to opcode.
    pub fn opcode_of(&self, kind: M::Kind) -> Option<u8> {
        self.opcode_by_kind.get(&kind).copied()
    }

    /// All registered opcodes, for diagnostics and registry audits.
    pub fn opcodes(&self) -> impl Iterator<Item = u8> + '_ {
        self.by_opcode.keys().copied()
    }

    /// Decodes one payload by opcode. An unknown opcode is a protocol error;
    /// so are payload bytes left over after the codec finished.
    pub fn decode(&self, opcode: u8, mut payload: Bytes) -> Result<M> {
        let codec = self
            .by_opcode
            .get(&opcode)
            .ok_or(ProtocolError::UnknownOpcode {
                opcode,
                registry: self.name,
            })?;
        let message = (codec.decode)(&mut payload)?;
        if payload.has_remaining() {
            return Err(ProtocolError::MalformedFrame("trailing bytes after payload"));
        }
        Ok(message)
    }

    /// Encodes one message as `opcode var-int + payload` into `buf`.
    pub fn encode(&self, message: &M, buf: &mut BytesMut) -> Result<u8> {
        let opcode =
            self.opcode_of(message.kind())
                .ok_or(ProtocolError::UnregisteredKind {
                    kind: M::kind_name(message.kind()),
                    registry: self.name,
                })?;
        let codec = self
            .by_opcode
            .get(&opcode)
            .ok_or(ProtocolError::UnregisteredKind {
                kind: M::kind_name(message.kind()),
                registry: self.name,
            })?;
        codec::write_var_int(buf, i32::from(opcode));
        (codec.encode)(message, buf)?;
        Ok(opcode)
    }

    /// Runs the outbound processor for this message's kind, or passes the
    /// message through untouched when none is registered.
    pub fn process(&self, message: M) -> Result<Vec<M>> {
        match self.processors.get(&message.kind()) {
            Some(processor) => processor(message),
            None => Ok(vec![message]),
        }
    }

    /// The handler attached to a kind, if any.
    pub fn handler(&self, kind: M::Kind) -> Option<Arc<dyn MessageHandler<C, M>>> {
        self.handlers.get(&kind).cloned()
    }
}

impl<C, M: WireMessage> fmt::Debug for MessageRegistry<C, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRegistry")
            .field("name", &self.name)
            .field("opcodes", &self.by_opcode.len())
            .field("handlers", &self.handlers.len())
            .field("processors", &self.processors.len())
            .field("sealed", &self.sealed)
            .finish()
    }
}
