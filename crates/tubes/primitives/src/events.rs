use lanlink_primitives::dbus::BusName;
use lanlink_primitives::handle::{Container, Handle};
use lanlink_primitives::tube::{TubeId, TubeInfo, TubeState};
use serde::Serialize;

use crate::error::NegotiationError;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "PascalCase")]
#[non_exhaustive]
pub enum TubesEvent {
    NewTube {
        container: Container,
        info: TubeInfo,
    },
    TubeStateChanged {
        container: Container,
        id: TubeId,
        state: TubeState,
    },
    TubeClosed {
        container: Container,
        id: TubeId,
    },
    /// A peer opened a new connection on a tube we offered.
    NewPeerConnection {
        container: Container,
        id: TubeId,
        peer: Handle,
    },
    DBusNamesChanged {
        container: Container,
        id: TubeId,
        added: Vec<(Handle, BusName)>,
        removed: Vec<Handle>,
    },
    /// The peer declined a one-to-one offer. The tube stays remote-pending.
    OfferRejected {
        container: Container,
        id: TubeId,
        reason: NegotiationError,
    },
}

impl TubesEvent {
    #[must_use]
    pub const fn container(&self) -> Container {
        match self {
            Self::NewTube { container, .. }
            | Self::TubeStateChanged { container, .. }
            | Self::TubeClosed { container, .. }
            | Self::NewPeerConnection { container, .. }
            | Self::DBusNamesChanged { container, .. }
            | Self::OfferRejected { container, .. } => *container,
        }
    }
}
