//! Bytestream negotiation.
//!
//! Outgoing requests are remembered by id until the matching reply arrives.
//! Incoming requests are validated here; acting on them is up to the tubes
//! they name.

use std::collections::HashMap;

use lanlink_primitives::bytestream::{BytestreamKey, BytestreamMethod, StreamId};
use lanlink_primitives::handle::Handle;
use lanlink_primitives::tube::TubeId;
use lanlink_tubes_primitives::error::NegotiationError;
use lanlink_tubes_primitives::session::SendError;
use lanlink_tubes_primitives::wire::{
    NegotiationRequest, RequestId, Stanza, TubeOffer, ROOM_STREAM_PROFILE,
    TUBE_CONNECTION_PROFILE, TUBE_PROFILE,
};
use rand::{thread_rng, Rng};
use tracing::debug;

use crate::bridge::ConnId;
use crate::context::{Context, TubeRef};
use crate::tube::Tube;

/// Methods we can carry a bytestream over, in order of preference.
pub(crate) const SUPPORTED_METHODS: &[BytestreamMethod] = &[BytestreamMethod::OutOfBand];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Purpose {
    /// The request is a one-to-one tube offer.
    Offer,
    /// A local socket is waiting on this stream.
    Connection { conn: ConnId, room: Option<Handle> },
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Pending {
    pub peer: Handle,
    pub stream_id: StreamId,
    pub tube: TubeRef,
    pub generation: u64,
    pub purpose: Purpose,
}

#[derive(Debug, Default)]
pub(crate) struct Negotiator {
    pending: HashMap<RequestId, Pending>,
}

/// A request that passed validation.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Validated {
    Offer {
        stream_id: StreamId,
        method: BytestreamMethod,
        tube: TubeOffer,
    },
    Connection {
        stream_id: StreamId,
        method: BytestreamMethod,
        tube_id: TubeId,
    },
    RoomConnection {
        stream_id: StreamId,
        room: String,
        tube_id: TubeId,
    },
}

/// First offered method we support, honouring the requester's order.
pub(crate) fn select_method(offered: &[String]) -> Option<BytestreamMethod> {
    offered
        .iter()
        .filter_map(|name| BytestreamMethod::from_wire(name))
        .find(|method| SUPPORTED_METHODS.contains(method))
}

pub(crate) fn validate(request: &NegotiationRequest) -> Result<Validated, NegotiationError> {
    let Some(profile) = request.profile.as_deref() else {
        return Err(NegotiationError::BadRequest);
    };
    let Some(stream_id) = request.stream_id else {
        return Err(NegotiationError::BadRequest);
    };

    match profile {
        TUBE_PROFILE => {
            let Some(tube) = request.tube.clone() else {
                return Err(NegotiationError::BadRequest);
            };
            let method = negotiate_method(&request.methods)?;

            Ok(Validated::Offer {
                stream_id,
                method,
                tube,
            })
        }
        TUBE_CONNECTION_PROFILE => {
            let Some(tube_id) = request.tube_id else {
                return Err(NegotiationError::BadRequest);
            };
            let method = negotiate_method(&request.methods)?;

            Ok(Validated::Connection {
                stream_id,
                method,
                tube_id,
            })
        }
        ROOM_STREAM_PROFILE => {
            let (Some(room), Some(tube_id)) = (request.container.clone(), request.tube_id) else {
                return Err(NegotiationError::BadRequest);
            };

            Ok(Validated::RoomConnection {
                stream_id,
                room,
                tube_id,
            })
        }
        _ => Err(NegotiationError::BadRequest),
    }
}

fn negotiate_method(offered: &[String]) -> Result<BytestreamMethod, NegotiationError> {
    if offered.is_empty() {
        return Err(NegotiationError::BadRequest);
    }

    select_method(offered).ok_or(NegotiationError::NoValidStreams)
}

impl Negotiator {
    /// Sends a one-to-one tube offer; its accept opens the first stream.
    pub fn offer(&mut self, ctx: &Context, tube: &Tube) -> Result<(), SendError> {
        let peer = tube.container.handle;
        let stream_id = self.fresh_stream_id(ctx, peer);

        let request = NegotiationRequest {
            profile: Some(TUBE_PROFILE.to_owned()),
            stream_id: Some(stream_id),
            methods: supported_names(),
            tube: Some(TubeOffer {
                id: tube.id,
                kind: tube.kind(),
                service: tube.service.clone(),
                parameters: tube.parameters.clone(),
            }),
            ..NegotiationRequest::default()
        };

        self.send(ctx, peer, stream_id, tube, Purpose::Offer, request)
    }

    /// Asks the initiator for a new stream on behalf of a local connection.
    pub fn request_connection(
        &mut self,
        ctx: &Context,
        tube: &Tube,
        conn: ConnId,
    ) -> Result<(), SendError> {
        let peer = tube.initiator;
        let stream_id = self.fresh_stream_id(ctx, peer);

        let (request, room) = if tube.container.is_group() {
            let request = NegotiationRequest {
                profile: Some(ROOM_STREAM_PROFILE.to_owned()),
                stream_id: Some(stream_id),
                tube_id: Some(tube.id),
                container: Some(ctx.name_of(tube.container.handle)),
                ..NegotiationRequest::default()
            };
            (request, Some(tube.container.handle))
        } else {
            let request = NegotiationRequest {
                profile: Some(TUBE_CONNECTION_PROFILE.to_owned()),
                stream_id: Some(stream_id),
                methods: supported_names(),
                tube_id: Some(tube.id),
                ..NegotiationRequest::default()
            };
            (request, None)
        };

        self.send(ctx, peer, stream_id, tube, Purpose::Connection { conn, room }, request)
    }

    fn send(
        &mut self,
        ctx: &Context,
        peer: Handle,
        stream_id: StreamId,
        tube: &Tube,
        purpose: Purpose,
        body: NegotiationRequest,
    ) -> Result<(), SendError> {
        let id = self.fresh_request_id();

        ctx.session.send(peer, Stanza::Request { id, body })?;

        debug!(?id, %peer, %stream_id, tube=%tube.id, ?purpose, "Sent bytestream request");

        let _ignored = self.pending.insert(
            id,
            Pending {
                peer,
                stream_id,
                tube: tube.tube_ref(),
                generation: tube.generation,
                purpose,
            },
        );

        Ok(())
    }

    /// Claims the request a reply answers. Replies from anyone but the
    /// addressed peer are not accepted.
    pub fn complete(&mut self, from: Handle, id: RequestId) -> Option<Pending> {
        let pending = self.pending.get(&id)?;

        if pending.peer != from {
            debug!(?id, %from, expected=%pending.peer, "Reply from unexpected peer");
            return None;
        }

        self.pending.remove(&id)
    }

    /// Forgets requests made for a tube that went away.
    pub fn forget(&mut self, tube: TubeRef) {
        self.pending.retain(|_, pending| pending.tube != tube);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn fresh_request_id(&self) -> RequestId {
        let mut rng = thread_rng();

        loop {
            let id = RequestId::new(rng.gen());
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// A stream id no live or pending stream of ours to `peer` uses.
    fn fresh_stream_id(&self, ctx: &Context, peer: Handle) -> StreamId {
        let mut rng = thread_rng();

        loop {
            let stream_id = StreamId::random(&mut rng);

            let key = BytestreamKey::new(peer, stream_id, ctx.self_handle);
            let in_use = ctx.routes.streams.contains_key(&key)
                || self
                    .pending
                    .values()
                    .any(|pending| pending.peer == peer && pending.stream_id == stream_id);

            if !in_use {
                return stream_id;
            }
        }
    }
}

fn supported_names() -> Vec<String> {
    SUPPORTED_METHODS
        .iter()
        .map(|method| method.as_str().to_owned())
        .collect()
}

#[cfg(test)]
#[path = "tests/negotiator.rs"]
mod tests;
