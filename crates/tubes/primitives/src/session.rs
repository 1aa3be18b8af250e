//! The seam between the tubes subsystem and whatever carries stanzas
//! between participants.

use lanlink_primitives::handle::Handle;
use thiserror::Error;

use crate::wire::{DataFrame, Stanza};

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum SendError {
    /// The outbound queue towards that destination is full. A
    /// [`SessionEvent::Writable`] follows once it drains.
    #[error("outbound queue is full")]
    Full,
    #[error("session is disconnected")]
    Disconnected,
    #[error("no route to peer")]
    UnknownPeer,
    /// The stanza could not be put on the wire, typically because it is
    /// larger than the transport's frame limit.
    #[error("stanza cannot be framed")]
    Unframeable,
}

/// Outbound half of a peer session. Calls must not block.
pub trait Session: Send + Sync + 'static {
    fn self_handle(&self) -> Handle;

    fn send(&self, to: Handle, stanza: Stanza) -> Result<(), SendError>;

    /// Sends to every other current member of `room`.
    fn broadcast(&self, room: Handle, stanza: Stanza) -> Result<(), SendError>;

    fn multicast(&self, room: Handle, frame: DataFrame) -> Result<(), SendError>;
}

/// Inbound half of a peer session.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Stanza {
        from: Handle,
        stanza: Stanza,
    },
    GroupStanza {
        room: Handle,
        from: Handle,
        stanza: Stanza,
    },
    Multicast {
        room: Handle,
        from: Handle,
        frame: DataFrame,
    },
    Joined {
        room: Handle,
    },
    JoinFailed {
        room: Handle,
    },
    MemberJoined {
        room: Handle,
        member: Handle,
    },
    MemberLeft {
        room: Handle,
        member: Handle,
    },
    /// A destination that previously returned [`SendError::Full`] drained.
    Writable {
        to: Handle,
    },
    Disconnected,
}
