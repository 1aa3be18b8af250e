use lanlink_primitives::handle::Container;
use lanlink_primitives::socket::{AccessControl, AddressKind};
use lanlink_primitives::tube::{TubeId, TubeKind, TubeState};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a local tube operation was refused.
///
/// Client calls return these wrapped in an [`eyre::Report`]; use
/// `report.downcast_ref::<TubeError>()` to match on them.
#[derive(Clone, Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum TubeError {
    #[error("no tubes channel for {0}")]
    UnknownChannel(Container),
    #[error("no tube {id} in {container}")]
    UnknownTube { container: Container, id: TubeId },
    #[error("tube {id} is {state:?}, expected {expected}")]
    InvalidState {
        id: TubeId,
        state: TubeState,
        expected: &'static str,
    },
    #[error("tube {id} is a {actual} tube")]
    WrongKind { id: TubeId, actual: TubeKind },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("access control {access_control:?} is not supported for {kind:?} sockets")]
    UnsupportedAccessControl {
        access_control: AccessControl,
        kind: AddressKind,
    },
    #[error("local socket setup failed: {0}")]
    SocketSetup(String),
    #[error("channel closed before the request completed")]
    ChannelClosed,
    #[error("session is disconnected")]
    Disconnected,
}

/// Negotiation failure carried back to the requesting peer.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Error, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationError {
    #[error("bad request")]
    BadRequest,
    #[error("no valid streams")]
    NoValidStreams,
    #[error("forbidden")]
    Forbidden,
}
