//! Peer-connection session manager.
//! Drives an opaque peer engine on a worker thread and hands its events to a
//! cooperative host runtime through a bounded queue and a scheduled dispatcher.

pub mod driver;
pub mod engine;
pub mod error;
pub mod event;
pub mod ffi;
pub mod queue;
pub mod scheduler;
pub mod session;
pub mod state;

pub use engine::loopback::{LoopbackNetwork, LoopbackOpener};
pub use engine::{
    DataFrame, EngineConfig, EngineHooks, EngineOpener, EngineStatus, IceServer,
    IceTransportPolicy, PeerEngine,
};
pub use error::{EngineOp, Result, SessionError};
pub use event::{DataKind, Event, SdpClassifier, SdpKind, SignalKind};
pub use scheduler::{host_loop, HostHandle, HostLoop, HostScheduler, Task};
pub use session::{PeerSession, SessionBuilder, SessionConfig};
pub use state::{ConnectionState, Role};

/// Generate engine certificate material before the first session, so the first
/// handshake does not pay for it.
pub fn pre_generate_cert(opener: &dyn EngineOpener) -> std::result::Result<(), EngineStatus> {
    match opener.pre_generate_cert() {
        Ok(()) => {
            tracing::info!("certificate pre-generated");
            Ok(())
        }
        Err(status) => {
            tracing::warn!(%status, "certificate pre-generation failed");
            Err(status)
        }
    }
}
