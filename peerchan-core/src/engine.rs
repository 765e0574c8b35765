//! Peer engine contract: the opaque component doing SDP/ICE negotiation and
//! DTLS data-channel transport. The session drives it through `PeerEngine` and
//! receives its callbacks through `EngineHooks`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::event::{DataKind, SignalKind};
use crate::state::{ConnectionState, Role};

pub mod loopback;

/// Raw engine status. Zero is success; anything else is a failure code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineStatus(pub i32);

impl EngineStatus {
    pub const OK: EngineStatus = EngineStatus(0);

    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    pub fn into_result(self) -> Result<(), EngineStatus> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One data-channel frame, borrowed for the duration of a call.
#[derive(Debug, Clone, Copy)]
pub struct DataFrame<'a> {
    pub kind: DataKind,
    pub stream_id: u16,
    pub data: &'a [u8],
}

/// Callbacks the engine invokes, from any thread, at any time.
/// Implementations must return quickly and never block on the host.
pub trait EngineHooks: Send + Sync {
    fn on_message(&self, kind: SignalKind, payload: &[u8]);
    fn on_state(&self, state: ConnectionState);
    fn on_data(&self, frame: DataFrame<'_>);
    /// Runtime problem the engine wants surfaced to the application.
    fn on_error(&self, message: &str);
}

/// An opened engine instance. All calls except `close` are non-blocking.
pub trait PeerEngine: Send + Sync {
    /// Begin a connection attempt (controlling: produce an offer; controlled: accept one).
    fn new_connection(&self) -> Result<(), EngineStatus>;
    fn send_signal(&self, kind: SignalKind, payload: &[u8]) -> Result<(), EngineStatus>;
    fn send_data(&self, frame: DataFrame<'_>) -> Result<(), EngineStatus>;
    /// Drop the negotiated session but keep the instance usable.
    fn disconnect(&self) -> Result<(), EngineStatus>;
    /// Release everything. Blocks until done. Called at most once.
    fn close(&self);
    /// Advance timers, retransmissions and handshakes. Bounded in time.
    fn iterate_once(&self);
}

/// Opens engine instances.
pub trait EngineOpener: Send + Sync {
    fn open(
        &self,
        role: Role,
        config: &EngineConfig,
        hooks: Arc<dyn EngineHooks>,
    ) -> Result<Arc<dyn PeerEngine>, EngineStatus>;

    /// Generate DTLS certificate material ahead of the first connection.
    fn pre_generate_cert(&self) -> Result<(), EngineStatus> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// `stun:` or `turn:` URL.
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    /// Adds a `stun:` scheme to bare host:port URLs.
    pub fn stun(url: &str) -> Self {
        let url = if url.starts_with("stun:") || url.starts_with("turn:") {
            url.to_string()
        } else {
            format!("stun:{url}")
        };
        Self {
            url,
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    #[default]
    All,
    Relay,
}

/// Engine configuration. Data-channel only; no audio or video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Empty for LAN-only use (host candidates only).
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
    /// Agent receive timeout; short values keep closure fast on a LAN.
    pub agent_recv_timeout_ms: u32,
    pub send_cache_size: usize,
    pub recv_cache_size: usize,
    pub enable_data_channel: bool,
}

pub const DEFAULT_AGENT_RECV_TIMEOUT_MS: u32 = 5000;
pub const DEFAULT_CACHE_SIZE: usize = 100 * 1024;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            ice_transport_policy: IceTransportPolicy::All,
            agent_recv_timeout_ms: DEFAULT_AGENT_RECV_TIMEOUT_MS,
            send_cache_size: DEFAULT_CACHE_SIZE,
            recv_cache_size: DEFAULT_CACHE_SIZE,
            enable_data_channel: true,
        }
    }
}
