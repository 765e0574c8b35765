//! Connection state machine and negotiation role.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which side offers first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Offers first (client side).
    #[default]
    Controlling,
    /// Answers an incoming offer (server side).
    Controlled,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Controlling => "controlling",
            Role::Controlled => "controlled",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown role {0:?} (expected \"controlling\" or \"controlled\")")]
pub struct ParseRoleError(String);

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controlling" => Ok(Role::Controlling),
            "controlled" => Ok(Role::Controlled),
            other => Err(ParseRoleError(other.to_string())),
        }
    }
}

/// Engine-reported connection state. Discriminants match the native engine's codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum ConnectionState {
    #[default]
    Closed = 0,
    Disconnected = 1,
    NewConnection = 2,
    Pairing = 3,
    Paired = 4,
    Connecting = 5,
    Connected = 6,
    ConnectFailed = 7,
    DataChannelConnected = 8,
    DataChannelOpened = 9,
    DataChannelClosed = 10,
    DataChannelDisconnected = 11,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 12] = [
        ConnectionState::Closed,
        ConnectionState::Disconnected,
        ConnectionState::NewConnection,
        ConnectionState::Pairing,
        ConnectionState::Paired,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::ConnectFailed,
        ConnectionState::DataChannelConnected,
        ConnectionState::DataChannelOpened,
        ConnectionState::DataChannelClosed,
        ConnectionState::DataChannelDisconnected,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.code() == code)
    }

    /// Closed and ConnectFailed end a connection attempt.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::ConnectFailed)
    }

    /// Connected or later, short of a disconnect or failure.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::DataChannelConnected
                | ConnectionState::DataChannelOpened
                | ConnectionState::DataChannelClosed
        )
    }

    pub fn is_data_channel_open(self) -> bool {
        self == ConnectionState::DataChannelOpened
    }

    /// Whether `next` lies on a path of the state machine from `self`.
    /// The engine is authoritative; callers only use this to flag surprises.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        if next == Closed {
            return true;
        }
        if next == Disconnected {
            return !self.is_terminal() && self != Disconnected;
        }
        matches!(
            (self, next),
            (Closed | Disconnected | ConnectFailed | DataChannelDisconnected, NewConnection)
                | (NewConnection, Pairing)
                | (Pairing, Paired)
                | (Paired, Connecting)
                | (Connecting, Connected | ConnectFailed)
                | (Connected, DataChannelConnected)
                | (DataChannelConnected, DataChannelOpened)
                | (DataChannelOpened, DataChannelClosed)
                | (DataChannelClosed, DataChannelDisconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Convenience flags derived from the state on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateFlags {
    pub connected: bool,
    pub data_channel_open: bool,
}

impl From<ConnectionState> for StateFlags {
    fn from(state: ConnectionState) -> Self {
        Self {
            connected: state.is_connected(),
            data_channel_open: state.is_data_channel_open(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn codes_round_trip() {
        for s in ConnectionState::ALL {
            assert_eq!(ConnectionState::from_code(s.code()), Some(s));
        }
        assert_eq!(ConnectionState::from_code(12), None);
        assert_eq!(ConnectionState::from_code(-1), None);
    }

    #[test]
    fn happy_path_is_valid() {
        let path = [
            Closed,
            NewConnection,
            Pairing,
            Paired,
            Connecting,
            Connected,
            DataChannelConnected,
            DataChannelOpened,
            DataChannelClosed,
            DataChannelDisconnected,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn failure_and_disconnect_exits() {
        assert!(Connecting.can_transition_to(ConnectFailed));
        assert!(!Pairing.can_transition_to(ConnectFailed));
        assert!(Pairing.can_transition_to(Disconnected));
        assert!(DataChannelOpened.can_transition_to(Disconnected));
        assert!(!ConnectFailed.can_transition_to(Disconnected));
        assert!(!Closed.can_transition_to(Disconnected));
        assert!(!Closed.can_transition_to(Connected));
    }

    #[test]
    fn flags_follow_state() {
        for s in ConnectionState::ALL {
            let flags = StateFlags::from(s);
            assert_eq!(flags.data_channel_open, s == DataChannelOpened);
        }
        assert!(StateFlags::from(Connected).connected);
        assert!(StateFlags::from(DataChannelOpened).connected);
        assert!(!StateFlags::from(Connecting).connected);
        assert!(!StateFlags::from(ConnectFailed).connected);
        assert!(!StateFlags::from(Disconnected).connected);
        assert!(!StateFlags::from(DataChannelDisconnected).connected);
    }

    #[test]
    fn role_parses() {
        assert_eq!("controlled".parse::<Role>().unwrap(), Role::Controlled);
        assert_eq!("controlling".parse::<Role>().unwrap(), Role::Controlling);
        assert!("server".parse::<Role>().is_err());
    }
}
