#[cfg(test)]
#[path = "tests/bytestream.rs"]
mod tests;

use core::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::handle::Handle;
use crate::tube::TubeId;

/// Sender-chosen identifier of one bytestream.
///
/// Only unique per `(peer, initiator)`, so it is never used as a key on its
/// own; see [`BytestreamKey`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct StreamId(u32);

impl StreamId {
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self(rng.gen())
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for StreamId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// A room D-Bus tube multiplexes everything over one stream numbered after
/// the tube itself.
impl From<TubeId> for StreamId {
    fn from(id: TubeId) -> Self {
        Self(id.get())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Uniquely identifies a bytestream from the local point of view.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BytestreamKey {
    /// Remote participant, or the room for room-wide streams.
    pub peer: Handle,
    pub stream_id: StreamId,
    /// Whoever chose `stream_id`.
    pub initiator: Handle,
}

impl BytestreamKey {
    #[must_use]
    pub const fn new(peer: Handle, stream_id: StreamId, initiator: Handle) -> Self {
        Self {
            peer,
            stream_id,
            initiator,
        }
    }
}

impl fmt::Display for BytestreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.peer, self.stream_id, self.initiator)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BytestreamState {
    /// Offered to us, we have not answered yet.
    LocalPending,
    /// Accepted by the peer, transport not started.
    Initiating,
    Open,
    Closed,
}

/// Transport carrying a bytestream's data.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BytestreamMethod {
    /// In-band frames on the peer session.
    Direct,
    /// Frames on a dedicated out-of-band peer link.
    OutOfBand,
    /// Frames multicast to every room member.
    MulticastSlice,
}

impl BytestreamMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "urn:lanlink:bytestreams:direct",
            Self::OutOfBand => "urn:lanlink:bytestreams:oob",
            Self::MulticastSlice => "urn:lanlink:bytestreams:muc",
        }
    }

    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        [Self::Direct, Self::OutOfBand, Self::MulticastSlice]
            .into_iter()
            .find(|method| method.as_str() == name)
    }
}

impl fmt::Display for BytestreamMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}
