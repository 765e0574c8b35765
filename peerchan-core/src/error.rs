//! Error taxonomy for session operations.

use std::fmt;
use std::os::raw::c_int;

use crate::engine::EngineStatus;

/// Engine operation a failure status came back from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOp {
    NewConnection,
    SetRemoteDescription,
    AddIceCandidate,
    SendData,
}

impl fmt::Display for EngineOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineOp::NewConnection => "new connection",
            EngineOp::SetRemoteDescription => "remote description",
            EngineOp::AddIceCandidate => "ICE candidate",
            EngineOp::SendData => "data send",
        };
        f.write_str(name)
    }
}

/// Errors returned by `PeerSession` methods. None of them change the session state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Engine handle is gone (session closed) or was never opened.
    #[error("peer not initialized")]
    NotInitialized,
    /// Engine refused the configuration at construction.
    #[error("engine rejected configuration (status {0})")]
    EngineInitError(EngineStatus),
    /// Engine returned a failure status for a forwarded operation.
    #[error("engine rejected {op} (status {status})")]
    EngineRejected { op: EngineOp, status: EngineStatus },
    #[error("data channel not open yet")]
    ChannelNotOpen,
    #[error("message too large: {len} bytes (max {max})")]
    MessageTooLarge { len: usize, max: usize },
    /// Queue, worker thread or buffer could not be allocated.
    #[error("failed to allocate {0}")]
    AllocationFailure(&'static str),
}

impl SessionError {
    /// Negative status code used on the C ABI.
    pub fn code(&self) -> c_int {
        match self {
            SessionError::NotInitialized => -2,
            SessionError::EngineRejected { .. } => -3,
            SessionError::ChannelNotOpen => -4,
            SessionError::MessageTooLarge { .. } => -5,
            SessionError::AllocationFailure(_) => -6,
            SessionError::EngineInitError(_) => -7,
        }
    }
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
