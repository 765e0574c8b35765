//! Events observed by the engine and handed to the dispatcher.

use serde::{Deserialize, Serialize};

use crate::state::{ConnectionState, Role};

/// Signaling message type exchanged with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Sdp,
    IceCandidate,
}

/// Payload type of a data-channel frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataKind {
    #[default]
    Binary,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Which callback slot an event is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Offer,
    Answer,
    Ice,
    Data,
    State,
    Error,
}

/// One fact reported by the engine. Owns its payload; moved into the queue by the
/// producer and consumed exactly once by the dispatcher.
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    SdpOffer(String),
    SdpAnswer(String),
    IceCandidate(String),
    DataReceived {
        data: Vec<u8>,
        stream_id: u16,
        kind: DataKind,
    },
    StateChanged(ConnectionState),
    EngineError(String),
}

impl Event {
    pub fn sdp(kind: SdpKind, text: String) -> Self {
        match kind {
            SdpKind::Offer => Event::SdpOffer(text),
            SdpKind::Answer => Event::SdpAnswer(text),
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            Event::SdpOffer(_) => EventCategory::Offer,
            Event::SdpAnswer(_) => EventCategory::Answer,
            Event::IceCandidate(_) => EventCategory::Ice,
            Event::DataReceived { .. } => EventCategory::Data,
            Event::StateChanged(_) => EventCategory::State,
            Event::EngineError(_) => EventCategory::Error,
        }
    }
}

/// Text payload from engine bytes. Engines may append a NUL terminator.
pub(crate) fn payload_text(payload: &[u8]) -> String {
    let end = payload
        .iter()
        .rposition(|b| *b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

/// How a locally generated SDP is labelled offer or answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpClassifier {
    /// From the session's negotiation position (role, remote description seen first).
    #[default]
    Negotiation,
    /// From direction attributes in the payload: `a=sendrecv` or `a=sendonly` means offer.
    DirectionAttributes,
}

impl SdpClassifier {
    pub fn by_direction(sdp: &str) -> SdpKind {
        if sdp.contains("a=sendrecv") || sdp.contains("a=sendonly") {
            SdpKind::Offer
        } else {
            SdpKind::Answer
        }
    }
}

/// Where this side stands in the current offer/answer exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Negotiation {
    remote_first: bool,
    local: Option<SdpKind>,
}

impl Negotiation {
    /// A remote description was applied; it came first unless we already produced ours.
    pub(crate) fn remote_applied(&mut self) {
        if self.local.is_none() {
            self.remote_first = true;
        }
    }

    /// Label for the local description. Fixed by the first SDP of the attempt.
    pub(crate) fn local_kind(&mut self, role: Role) -> SdpKind {
        let remote_first = self.remote_first;
        *self.local.get_or_insert_with(|| {
            if remote_first || role == Role::Controlled {
                SdpKind::Answer
            } else {
                SdpKind::Offer
            }
        })
    }
}
