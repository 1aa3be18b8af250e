//! Stanzas exchanged with peers over the session.
//!
//! Negotiation is a request/reply pair correlated by [`RequestId`]. Tube
//! data travels as [`DataFrame`]s addressed by the sender's stream id and
//! the name of whoever chose that id.

use bytes::Bytes;
use lanlink_primitives::bytestream::StreamId;
use lanlink_primitives::dbus::BusName;
use lanlink_primitives::tube::{Parameters, TubeId, TubeKind};
use serde::{Deserialize, Serialize};

use crate::error::NegotiationError;

mod codec;

pub use codec::{CodecError, StanzaCodec, DEFAULT_MAX_FRAME_SIZE};

/// Offer of a new one-to-one tube; the accepted stream is the tube's first.
pub const TUBE_PROFILE: &str = "urn:lanlink:si:tube";
/// An additional connection on an existing one-to-one tube.
pub const TUBE_CONNECTION_PROFILE: &str = "urn:lanlink:si:tube-connection";
/// A connection on a room stream tube, carried over multicast.
pub const ROOM_STREAM_PROFILE: &str = "urn:lanlink:si:room-stream";

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Stanza {
    Request {
        id: RequestId,
        body: NegotiationRequest,
    },
    Reply {
        id: RequestId,
        body: NegotiationReply,
    },
    Data(DataFrame),
    CloseStream {
        stream_id: StreamId,
        initiator: String,
    },
    Announcement(TubeAnnouncement),
    CloseTube {
        id: TubeId,
    },
}

/// Bytestream negotiation request.
///
/// Every field is optional on the wire; the receiver validates which ones
/// the named profile requires.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tube: Option<TubeOffer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tube_id: Option<TubeId>,
    /// Room name, for room stream connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

/// Tube descriptor carried by a one-to-one offer. The initiator is the
/// sender of the request.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TubeOffer {
    pub id: TubeId,
    pub kind: TubeKind,
    pub service: String,
    #[serde(default)]
    pub parameters: Parameters,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationReply {
    Accept {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
    },
    Error(NegotiationError),
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFrame {
    pub stream_id: StreamId,
    /// Name of the participant that chose `stream_id`.
    pub initiator: String,
    pub payload: Bytes,
}

/// A room member's view of the tubes it takes part in.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TubeAnnouncement {
    pub tubes: Vec<AnnouncedTube>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncedTube {
    pub id: TubeId,
    pub kind: TubeKind,
    pub service: String,
    #[serde(default)]
    pub parameters: Parameters,
    pub initiator: String,
    /// The announcer's own name on a D-Bus tube's bus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_name: Option<BusName>,
}
