//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use perun_protocol::messages::{ModEntry, ModRegistry, MOD_CHANNEL};

/// Static configuration for one [`Server`](crate::Server) instance. Values
/// are fixed at bind time; there is no runtime reload.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the TCP listener binds to.
    pub bind_addr: SocketAddr,
    /// Whether logins are verified against the session service. Offline
    /// servers derive stable identities from the username instead.
    pub online_mode: bool,
    /// Compression threshold negotiated at the end of login. Bodies strictly
    /// larger than this leave compressed; `-1` disables the stage.
    pub compression_threshold: i32,
    /// Override for the session-verification base URL. `None` uses the
    /// public service.
    pub session_service_url: Option<String>,
    /// Player capacity advertised in the status document.
    pub max_players: u32,
    /// Description line advertised in the status document.
    pub motd: String,
    /// Sync ticks between keep-alive probes to a playing client.
    pub keepalive_interval_ticks: u64,
    /// Unanswered probes tolerated before the session is kicked.
    pub keepalive_grace: u64,
    /// Wall-clock duration of one sync tick.
    pub tick_period: Duration,
    /// Dimension announced in the mod-handshake server hello.
    pub mod_dimension: i32,
    /// Mods this server advertises during the mod-list exchange.
    pub server_mods: Vec<ModEntry>,
    /// Id registries synchronized to mod-capable clients before play.
    pub registries: Vec<ModRegistry>,
    /// Plugin channels announced once a session reaches play.
    pub channels: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 25565)),
            online_mode: true,
            compression_threshold: 256,
            session_service_url: None,
            max_players: 20,
            motd: "A Perun Server".to_owned(),
            keepalive_interval_ticks: 40,
            keepalive_grace: 15,
            tick_period: Duration::from_millis(50),
            mod_dimension: 0,
            server_mods: Vec::new(),
            registries: Vec::new(),
            channels: vec![MOD_CHANNEL.to_owned()],
        }
    }
}
