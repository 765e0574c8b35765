//! In-process engine: peers opened on the same `LoopbackNetwork` negotiate with
//! plain SDP/candidate text and exchange data-channel frames through memory.
//! Callbacks fire only from `iterate_once`, on the driver thread.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{DataFrame, EngineConfig, EngineHooks, EngineOpener, EngineStatus, PeerEngine};
use crate::event::{DataKind, SignalKind};
use crate::state::{ConnectionState, Role};

pub const ERR_CLOSED: EngineStatus = EngineStatus(-1);
pub const ERR_UNSUPPORTED: EngineStatus = EngineStatus(-2);
pub const ERR_BAD_SDP: EngineStatus = EngineStatus(-3);
pub const ERR_BAD_CANDIDATE: EngineStatus = EngineStatus(-4);
pub const ERR_NOT_CONNECTED: EngineStatus = EngineStatus(-5);

const UFRAG_ATTR: &str = "a=ice-ufrag:";

/// Registry of live loopback peers, keyed by ICE username fragment.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    peers: Arc<Mutex<HashMap<String, Weak<LoopbackPeer>>>>,
    next_id: Arc<AtomicU32>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, peer: &Arc<LoopbackPeer>) {
        self.peers
            .lock()
            .insert(peer.ufrag.clone(), Arc::downgrade(peer));
    }

    fn unregister(&self, ufrag: &str) {
        self.peers.lock().remove(ufrag);
    }

    fn lookup(&self, ufrag: &str) -> Option<Arc<LoopbackPeer>> {
        self.peers.lock().get(ufrag).and_then(Weak::upgrade)
    }

    /// Number of peers currently open.
    pub fn peer_count(&self) -> usize {
        self.peers
            .lock()
            .values()
            .filter(|p| p.strong_count() > 0)
            .count()
    }
}

/// Opens loopback peers on one network.
pub struct LoopbackOpener {
    network: LoopbackNetwork,
    close_delay: Duration,
}

impl LoopbackOpener {
    pub fn new(network: LoopbackNetwork) -> Self {
        Self {
            network,
            close_delay: Duration::ZERO,
        }
    }

    /// Make `close` block for `delay`, like an engine waiting out its agent timeout.
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }
}

impl EngineOpener for LoopbackOpener {
    fn open(
        &self,
        role: Role,
        config: &EngineConfig,
        hooks: Arc<dyn EngineHooks>,
    ) -> Result<Arc<dyn PeerEngine>, EngineStatus> {
        if !config.enable_data_channel {
            return Err(ERR_UNSUPPORTED);
        }
        let id = self.network.next_id.fetch_add(1, Ordering::Relaxed);
        let peer = Arc::new(LoopbackPeer {
            id,
            ufrag: format!("lb{id:04}"),
            role,
            close_delay: self.close_delay,
            network: self.network.clone(),
            hooks,
            inner: Mutex::new(PeerInner::default()),
        });
        self.network.register(&peer);
        debug!(ufrag = %peer.ufrag, %role, "loopback peer opened");
        Ok(peer as Arc<dyn PeerEngine>)
    }

    fn pre_generate_cert(&self) -> Result<(), EngineStatus> {
        debug!("loopback peers need no certificate");
        Ok(())
    }
}

#[derive(Default)]
struct PeerInner {
    closed: bool,
    started: bool,
    state: Option<ConnectionState>,
    local_sdp_pending: bool,
    local_sdp_sent: bool,
    candidate_pending: bool,
    remote_ufrag: Option<String>,
    remote_candidate: bool,
    announce: VecDeque<ConnectionState>,
    inbox: VecDeque<(DataKind, u16, Vec<u8>)>,
}

impl PeerInner {
    fn reset(&mut self) {
        *self = PeerInner {
            closed: self.closed,
            ..PeerInner::default()
        };
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = Some(state);
        self.announce.push_back(state);
    }

    fn is_open(&self) -> bool {
        self.state == Some(ConnectionState::DataChannelOpened)
    }
}

/// Work collected under the lock and performed after releasing it.
enum Action {
    Signal(SignalKind, String),
    State(ConnectionState),
    Data(DataKind, u16, Vec<u8>),
    Error(String),
}

/// Connection progression once both sides know each other.
const HANDSHAKE: [ConnectionState; 6] = [
    ConnectionState::Pairing,
    ConnectionState::Paired,
    ConnectionState::Connecting,
    ConnectionState::Connected,
    ConnectionState::DataChannelConnected,
    ConnectionState::DataChannelOpened,
];

pub struct LoopbackPeer {
    id: u32,
    ufrag: String,
    role: Role,
    close_delay: Duration,
    network: LoopbackNetwork,
    hooks: Arc<dyn EngineHooks>,
    inner: Mutex<PeerInner>,
}

impl LoopbackPeer {
    fn local_sdp(&self, offer: bool) -> String {
        let mut sdp = format!(
            "v=0\r\n\
             o=- {id} 2 IN IP4 127.0.0.1\r\n\
             s=-\r\n\
             t=0 0\r\n\
             a=group:BUNDLE 0\r\n\
             m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
             c=IN IP4 0.0.0.0\r\n\
             {UFRAG_ATTR}{ufrag}\r\n\
             a=ice-pwd:loopback{id:016}\r\n\
             a=setup:{setup}\r\n\
             a=mid:0\r\n\
             a=sctp-port:5000\r\n\
             a=max-message-size:65535\r\n",
            id = self.id,
            ufrag = self.ufrag,
            setup = if offer { "actpass" } else { "active" },
        );
        if offer {
            sdp.push_str("a=sendrecv\r\n");
        }
        sdp
    }

    fn host_candidate(&self) -> String {
        format!(
            "candidate:1 1 UDP 2130706431 127.0.0.1 {port} typ host",
            port = 50000 + self.id % 10000
        )
    }

    fn remote(&self) -> Option<Arc<LoopbackPeer>> {
        let ufrag = self.inner.lock().remote_ufrag.clone()?;
        self.network.lookup(&ufrag)
    }

    fn plan(&self) -> Vec<Action> {
        let remote_alive = self.remote().is_some();
        let mut inner = self.inner.lock();
        let mut actions = Vec::new();
        if inner.closed {
            return actions;
        }
        if inner.local_sdp_pending {
            inner.local_sdp_pending = false;
            inner.local_sdp_sent = true;
            inner.candidate_pending = true;
            let offer = inner.remote_ufrag.is_none();
            actions.push(Action::Signal(SignalKind::Sdp, self.local_sdp(offer)));
        } else if inner.candidate_pending {
            inner.candidate_pending = false;
            actions.push(Action::Signal(SignalKind::IceCandidate, self.host_candidate()));
        }

        let connected = inner.state.map_or(false, ConnectionState::is_connected);
        if connected && !remote_alive {
            actions.push(Action::Error("remote peer went away".into()));
            inner.set_state(ConnectionState::Disconnected);
        } else if inner.started
            && inner.local_sdp_sent
            && inner.remote_candidate
            && remote_alive
        {
            let next = match inner.state {
                Some(ConnectionState::NewConnection) => Some(HANDSHAKE[0]),
                Some(current) => HANDSHAKE
                    .iter()
                    .position(|s| *s == current)
                    .and_then(|i| HANDSHAKE.get(i + 1).copied()),
                None => None,
            };
            if let Some(next) = next {
                inner.set_state(next);
            }
        }

        actions.extend(inner.announce.drain(..).map(Action::State));
        if inner.is_open() {
            actions.extend(
                inner
                    .inbox
                    .drain(..)
                    .map(|(kind, stream, data)| Action::Data(kind, stream, data)),
            );
        }
        actions
    }

    fn deliver(&self, frame: (DataKind, u16, Vec<u8>)) -> Result<(), EngineStatus> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ERR_NOT_CONNECTED);
        }
        inner.inbox.push_back(frame);
        Ok(())
    }
}

impl PeerEngine for LoopbackPeer {
    fn new_connection(&self) -> Result<(), EngineStatus> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ERR_CLOSED);
        }
        inner.reset();
        inner.started = true;
        inner.set_state(ConnectionState::NewConnection);
        if self.role == Role::Controlling {
            inner.local_sdp_pending = true;
        }
        Ok(())
    }

    fn send_signal(&self, kind: SignalKind, payload: &[u8]) -> Result<(), EngineStatus> {
        let text = std::str::from_utf8(payload).map_err(|_| match kind {
            SignalKind::Sdp => ERR_BAD_SDP,
            SignalKind::IceCandidate => ERR_BAD_CANDIDATE,
        })?;
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ERR_CLOSED);
        }
        match kind {
            SignalKind::Sdp => {
                let ufrag = text
                    .lines()
                    .find_map(|line| line.trim().strip_prefix(UFRAG_ATTR))
                    .filter(|u| !u.is_empty())
                    .ok_or(ERR_BAD_SDP)?;
                inner.remote_ufrag = Some(ufrag.to_string());
                if !inner.local_sdp_sent {
                    inner.local_sdp_pending = true;
                }
            }
            SignalKind::IceCandidate => {
                if !text.trim_start().starts_with("candidate:") {
                    return Err(ERR_BAD_CANDIDATE);
                }
                inner.remote_candidate = true;
            }
        }
        Ok(())
    }

    fn send_data(&self, frame: DataFrame<'_>) -> Result<(), EngineStatus> {
        if !self.inner.lock().is_open() {
            return Err(ERR_NOT_CONNECTED);
        }
        let remote = self.remote().ok_or(ERR_NOT_CONNECTED)?;
        remote.deliver((frame.kind, frame.stream_id, frame.data.to_vec()))
    }

    fn disconnect(&self) -> Result<(), EngineStatus> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ERR_CLOSED);
        }
        let was_started = inner.started;
        inner.reset();
        if was_started {
            inner.set_state(ConnectionState::Disconnected);
        }
        Ok(())
    }

    fn close(&self) {
        if !self.close_delay.is_zero() {
            thread::sleep(self.close_delay);
        }
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.inbox.clear();
        drop(inner);
        self.network.unregister(&self.ufrag);
        info!(ufrag = %self.ufrag, "loopback peer closed");
    }

    fn iterate_once(&self) {
        for action in self.plan() {
            match action {
                Action::Signal(kind, text) => self.hooks.on_message(kind, text.as_bytes()),
                Action::State(state) => self.hooks.on_state(state),
                Action::Data(kind, stream_id, data) => self.hooks.on_data(DataFrame {
                    kind,
                    stream_id,
                    data: &data,
                }),
                Action::Error(message) => self.hooks.on_error(&message),
            }
        }
    }
}
