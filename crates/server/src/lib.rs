//! # Perun server
//!
//! The connection engine: a TCP accept loop, per-connection session tasks,
//! the login and mod-handshake sequences, and the dual task scheduler that
//! gives game logic both a tick clock and a wall clock.
//!
//! A [`Server`] is built from a [`ServerConfig`], registers its handlers
//! into a sealed [`ProtocolTable`](perun_protocol::ProtocolTable), and then
//! [runs](Server::run) forever: accepting sockets, spawning a read/write task
//! pair per connection, and driving the sync scheduler once per tick.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info};

use perun_protocol::auth::{Authenticator, SessionService};
use perun_protocol::encryption::ServerKeyPair;
use perun_protocol::error::ProtocolError;
use perun_protocol::state::{ProtocolState, ProtocolTable};

pub mod config;
mod handlers;
mod login;
pub mod scheduler;
pub mod session;
mod transport;

pub use config::ServerConfig;
pub use scheduler::{AsyncScheduler, SyncScheduler, TaskHandle, TaskState};
pub use session::{Session, SessionShared, WriteReceipt};

/// Errors that stop the server itself, as opposed to one connection.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// State shared by the accept loop, every session task, and the schedulers.
pub struct ServerShared {
    pub config: ServerConfig,
    pub keypair: ServerKeyPair,
    pub table: ProtocolTable<Session>,
    pub authenticator: Arc<dyn Authenticator>,
    pub sync_scheduler: SyncScheduler,
    pub async_scheduler: AsyncScheduler,
    sessions: Mutex<HashMap<u64, Arc<SessionShared>>>,
    next_session_id: AtomicU64,
}

impl ServerShared {
    pub(crate) fn allocate_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_session(&self, shared: Arc<SessionShared>) {
        self.lock_sessions().insert(shared.id, shared);
    }

    pub(crate) fn unregister_session(&self, id: u64) {
        self.lock_sessions().remove(&id);
        self.sync_scheduler.cancel_owner(&format!("session-{id}"));
        self.async_scheduler.cancel_owner(&format!("session-{id}"));
    }

    fn lock_sessions(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<SessionShared>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Live sessions that made it to play.
    pub fn online_count(&self) -> usize {
        self.lock_sessions()
            .values()
            .filter(|session| {
                session.state() == ProtocolState::Play && !session.is_disconnected()
            })
            .count()
    }

    pub fn session(&self, id: u64) -> Option<Arc<SessionShared>> {
        self.lock_sessions().get(&id).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<SessionShared>> {
        self.lock_sessions().values().cloned().collect()
    }
}

/// The listening server. Construction registers and seals the protocol
/// table; [`run`](Self::run) accepts connections until the process ends.
pub struct Server {
    shared: Arc<ServerShared>,
    listener: TcpListener,
}

impl Server {
    /// Binds with the default authenticator: the public session service, or
    /// the one named in the config.
    pub async fn bind(config: ServerConfig) -> Result<Server, ServerError> {
        let authenticator: Arc<dyn Authenticator> = match &config.session_service_url {
            Some(url) => Arc::new(SessionService::new(url.clone())),
            None => Arc::new(SessionService::default()),
        };
        Self::bind_with(config, authenticator).await
    }

    /// Binds with a caller-supplied authenticator.
    pub async fn bind_with(
        config: ServerConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Server, ServerError> {
        let keypair = ServerKeyPair::generate()?;
        let mut table = ProtocolTable::vanilla()?;
        handlers::register_handlers(&mut table)?;
        table.seal();

        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(
            addr = %listener.local_addr()?,
            online_mode = config.online_mode,
            "server listening"
        );

        let shared = Arc::new(ServerShared {
            config,
            keypair,
            table,
            authenticator,
            sync_scheduler: SyncScheduler::new(),
            async_scheduler: AsyncScheduler::start(),
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
        });
        Ok(Server { shared, listener })
    }

    /// The address actually bound, for configs that asked for port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shared(&self) -> Arc<ServerShared> {
        Arc::clone(&self.shared)
    }

    /// Runs the tick loop and the accept loop. Never returns except on a
    /// listener error.
    pub async fn run(self) -> Result<(), ServerError> {
        let tick_shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_shared.config.tick_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                tick_shared.sync_scheduler.tick();
            }
        });

        loop {
            let (stream, peer) = self.listener.accept().await?;
            if let Err(error) = stream.set_nodelay(true) {
                debug!(%peer, %error, "could not set nodelay");
            }
            debug!(%peer, "connection accepted");
            tokio::spawn(transport::run_session(stream, Arc::clone(&self.shared)));
        }
    }
}
