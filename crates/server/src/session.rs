//! Per-connection session state
//!
//! A [`Session`] is the handler context for one client connection. It is
//! owned by the connection's read task; handlers get `&mut Session` and never
//! run concurrently for the same connection. Cross-task facts (protocol
//! state, compression threshold, the verified profile) live in the shared
//! [`SessionShared`] so the write task and the schedulers can read them
//! without touching the read task.
//!
//! Outbound traffic and pipeline changes travel as in-band [`Outgoing`]
//! commands to the write task. Because a cipher or compression install is
//! queued behind the frames written before it, the stage applies exactly from
//! the next frame onward.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, Notify};
use tracing::debug;

use perun_protocol::auth::GameProfile;
use perun_protocol::compression::COMPRESSION_DISABLED;
use perun_protocol::encryption::SECRET_LEN;
use perun_protocol::error::{ProtocolError, Result};
use perun_protocol::messages::ServerMessage;
use perun_protocol::state::ProtocolState;

use crate::scheduler::TaskHandle;
use crate::ServerShared;

/// Bound on queued outbound commands per connection.
pub(crate) const OUTGOING_QUEUE: usize = 64;

/// Commands consumed by a connection's write task, in order.
#[derive(Debug)]
pub(crate) enum Outgoing {
    /// Encode and write one message. `done` resolves after the frame is
    /// flushed to the socket.
    Message {
        message: ServerMessage,
        done: Option<oneshot::Sender<()>>,
    },
    /// Install the outbound stream cipher; applies from the next frame.
    EnableEncryption { secret: [u8; SECRET_LEN] },
    /// Install or disable the outbound compression stage; applies from the
    /// next frame.
    SetCompression { threshold: i32 },
    /// Flush and shut the socket down.
    Close,
}

/// Events posted back to a connection's read task by work running elsewhere.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// The off-thread authentication lookup finished.
    AuthResult { profile: Result<GameProfile> },
}

/// Progress through the mod-handshake sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ModHandshakeProgress {
    #[default]
    AwaitingHello,
    AwaitingModList,
    AwaitingAck,
    Complete,
}

/// Resolves once the message it was issued for has been flushed. Dropped by
/// the write task (resolving to an error) if the connection dies first.
pub type WriteReceipt = oneshot::Receiver<()>;

/// Session facts readable from any task.
#[derive(Debug)]
pub struct SessionShared {
    pub id: u64,
    pub peer: SocketAddr,
    state: AtomicU8,
    compression: AtomicI32,
    disconnected: AtomicBool,
    encrypted: AtomicBool,
    keepalive_sent: AtomicI64,
    keepalive_echoed: AtomicI64,
    profile: Mutex<Option<GameProfile>>,
}

impl SessionShared {
    pub(crate) fn new(id: u64, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            state: AtomicU8::new(ProtocolState::Handshake as u8),
            compression: AtomicI32::new(COMPRESSION_DISABLED),
            disconnected: AtomicBool::new(false),
            encrypted: AtomicBool::new(false),
            keepalive_sent: AtomicI64::new(0),
            keepalive_echoed: AtomicI64::new(0),
            profile: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ProtocolState {
        ProtocolState::from_u8(self.state.load(Ordering::Acquire))
            .unwrap_or(ProtocolState::Handshake)
    }

    pub(crate) fn store_state(&self, state: ProtocolState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Inbound compression threshold; `-1` while the stage is disabled.
    pub fn compression_threshold(&self) -> i32 {
        self.compression.load(Ordering::Acquire)
    }

    pub(crate) fn store_compression(&self, threshold: i32) {
        self.compression.store(threshold, Ordering::Release);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Marks the session dead. Returns whether this call was the first.
    pub(crate) fn set_disconnected(&self) -> bool {
        !self.disconnected.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_encrypted(&self) -> bool {
        !self.encrypted.swap(true, Ordering::AcqRel)
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted.load(Ordering::Acquire)
    }

    pub(crate) fn next_keepalive_id(&self) -> i64 {
        self.keepalive_sent.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn record_keepalive_echo(&self, id: i64) {
        self.keepalive_echoed.fetch_max(id, Ordering::AcqRel);
    }

    pub(crate) fn keepalive_lag(&self) -> i64 {
        self.keepalive_sent.load(Ordering::Acquire) - self.keepalive_echoed.load(Ordering::Acquire)
    }

    /// The verified identity, present once login completed.
    pub fn profile(&self) -> Option<GameProfile> {
        self.profile
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn store_profile(&self, profile: GameProfile) {
        *self
            .profile
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = profile.into();
    }
}

/// Handler context for one connection. Owned by the read task.
pub struct Session {
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) server: Arc<ServerShared>,
    pub(crate) outgoing: mpsc::Sender<Outgoing>,
    pub(crate) events: mpsc::Sender<SessionEvent>,
    pub(crate) force_close: Arc<Notify>,
    /// Session nonce mixed into the auth digest.
    pub(crate) server_id: String,
    /// Login challenge issued in the encryption request, awaiting its echo.
    pub(crate) verify_token: Option<[u8; 4]>,
    /// Username from login start, pending verification.
    pub(crate) pending_username: Option<String>,
    /// Secret for the inbound cipher, picked up by the read loop right after
    /// the handler that produced it returns.
    pub(crate) pending_decrypt: Option<[u8; SECRET_LEN]>,
    /// Whether the handshake address carried the mod-loader marker.
    pub(crate) mod_support: bool,
    pub(crate) mod_progress: ModHandshakeProgress,
    pub(crate) keepalive_task: Option<TaskHandle>,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub fn server(&self) -> &Arc<ServerShared> {
        &self.server
    }

    pub fn state(&self) -> ProtocolState {
        self.shared.state()
    }

    /// Flips the protocol state, validating the transition first. From the
    /// next frame on, both directions dispatch through the new phase's
    /// registries.
    pub fn set_state(&self, next: ProtocolState) -> Result<()> {
        let current = self.shared.state();
        current.validate_transition(next)?;
        self.shared.store_state(next);
        debug!(session = self.shared.id, from = %current, to = %next, "protocol state changed");
        Ok(())
    }

    /// Queues one message for the write task. The returned receipt resolves
    /// once the frame has been flushed.
    pub async fn send(&self, message: ServerMessage) -> Result<WriteReceipt> {
        let (done, receipt) = oneshot::channel();
        self.outgoing
            .send(Outgoing::Message {
                message,
                done: Some(done),
            })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        Ok(receipt)
    }

    /// Installs the stream cipher on both directions. Outbound applies from
    /// the next queued frame; inbound applies to everything after the frame
    /// that carried the shared secret. Rejects a second install.
    pub async fn enable_encryption(&mut self, secret: [u8; SECRET_LEN]) -> Result<()> {
        if !self.shared.set_encrypted() {
            return Err(ProtocolError::CipherAlreadyInstalled);
        }
        self.outgoing
            .send(Outgoing::EnableEncryption { secret })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.pending_decrypt = Some(secret);
        debug!(session = self.shared.id, "stream cipher armed");
        Ok(())
    }

    /// Installs the compression stage on both directions, from the next
    /// frame in each. A repeat install just replaces the threshold.
    pub async fn install_compression(&self, threshold: i32) -> Result<()> {
        self.outgoing
            .send(Outgoing::SetCompression { threshold })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.shared.store_compression(threshold);
        debug!(session = self.shared.id, threshold, "compression stage set");
        Ok(())
    }

    /// Sends the phase-appropriate kick message and closes the connection
    /// after it flushes. Repeat calls are no-ops.
    pub async fn disconnect(&self, reason: &str) {
        if !self.shared.set_disconnected() {
            return;
        }
        let kick = match self.shared.state() {
            ProtocolState::Login => Some(ServerMessage::LoginDisconnect {
                reason: reason.to_owned(),
            }),
            ProtocolState::ModHandshake | ProtocolState::Play => Some(ServerMessage::Disconnect {
                reason: reason.to_owned(),
            }),
            // no kick vocabulary before login
            ProtocolState::Handshake | ProtocolState::Status => None,
        };
        if let Some(message) = kick {
            let _ = self
                .outgoing
                .send(Outgoing::Message {
                    message,
                    done: None,
                })
                .await;
        }
        let _ = self.outgoing.send(Outgoing::Close).await;
    }

    /// Closes the connection once everything already queued has flushed,
    /// without a kick message.
    pub async fn close_after_flush(&self) {
        self.shared.set_disconnected();
        let _ = self.outgoing.send(Outgoing::Close).await;
    }

    /// Drops the connection on the floor, skipping queued writes.
    pub fn close_now(&self) {
        self.shared.set_disconnected();
        self.force_close.notify_waiters();
    }
}
