//! Peer session input: negotiation, data, room membership.

use lanlink_primitives::bytestream::{BytestreamKey, BytestreamMethod, StreamId};
use lanlink_primitives::handle::{Container, Handle};
use lanlink_primitives::tube::TubeId;
use lanlink_tubes_primitives::error::{NegotiationError, TubeError};
use lanlink_tubes_primitives::events::TubesEvent;
use lanlink_tubes_primitives::session::SessionEvent;
use lanlink_tubes_primitives::wire::{
    DataFrame, NegotiationReply, NegotiationRequest, RequestId, Stanza, TubeOffer,
};
use tracing::{debug, info, warn};

use crate::bytestream::{Bytestream, Route};
use crate::context::Context;
use crate::handler::commands::find_tube_mut;
use crate::negotiator::{self, Pending, Purpose, Validated};
use crate::tube::{IncomingOffer, Tube};
use crate::TubesManager;

/// Maps a frame's wire addressing onto one of our bytestream keys.
///
/// `initiator` names whoever opened the stream: us, the sender, or for the
/// shared stream of a room bus, the room itself. Anything else is addressed
/// to somebody else on the same room sub-channel.
fn frame_key(
    ctx: &Context,
    from: Handle,
    room: Option<Handle>,
    stream_id: StreamId,
    initiator: &str,
) -> Option<BytestreamKey> {
    if initiator == ctx.self_name {
        return Some(BytestreamKey::new(from, stream_id, ctx.self_handle));
    }

    if initiator == ctx.name_of(from) {
        return Some(BytestreamKey::new(from, stream_id, from));
    }

    let room = room?;
    (initiator == ctx.name_of(room)).then(|| BytestreamKey::new(room, stream_id, room))
}

#[allow(
    clippy::multiple_inherent_impl,
    reason = "Handlers live next to the inputs they serve"
)]
impl TubesManager {
    pub(crate) fn handle_session_event(&mut self, event: SessionEvent) {
        if self.ctx.disconnected {
            debug!(?event, "Ignoring session event after disconnect");
            return;
        }

        match event {
            SessionEvent::Stanza { from, stanza } => self.handle_stanza(from, stanza),
            SessionEvent::GroupStanza { room, from, stanza } => {
                self.handle_group_stanza(room, from, stanza);
            }
            SessionEvent::Multicast { room, from, frame } => {
                self.handle_data(from, Some(room), frame);
            }
            SessionEvent::Joined { room } => self.handle_joined(room),
            SessionEvent::JoinFailed { room } => {
                warn!(%room, "Failed to join room");
                let _ignored = self.joined_rooms.remove(&room);
                self.drop_channel(room, &TubeError::ChannelClosed);
            }
            SessionEvent::MemberJoined { room, member } => {
                if let Some(channel) = self.channels.get_mut(&room) {
                    if channel.has_open_tubes() {
                        debug!(%room, %member, "Re-announcing tubes for new member");
                        channel.announce(&self.ctx, true);
                    }
                }
            }
            SessionEvent::MemberLeft { room, member } => self.handle_member_left(room, member),
            SessionEvent::Writable { to } => {
                for channel in self.channels.values_mut() {
                    for tube in channel.tubes.values_mut() {
                        tube.on_writable(&mut self.ctx, to);
                    }
                }
            }
            SessionEvent::Disconnected => {
                info!("Session disconnected, closing all tubes");
                self.ctx.disconnected = true;
                self.joined_rooms.clear();

                let rooms: Vec<_> = self.channels.keys().copied().collect();
                for handle in rooms {
                    self.drop_channel(handle, &TubeError::Disconnected);
                }
            }
        }
    }

    fn handle_stanza(&mut self, from: Handle, stanza: Stanza) {
        match stanza {
            Stanza::Request { id, body } => self.handle_request(from, id, body),
            Stanza::Reply { id, body } => self.handle_reply(from, id, body),
            Stanza::Data(frame) => self.handle_data(from, None, frame),
            Stanza::CloseStream {
                stream_id,
                initiator,
            } => {
                let Some(key) = frame_key(&self.ctx, from, None, stream_id, &initiator) else {
                    debug!(%from, %stream_id, "Close for a stream that is not ours");
                    return;
                };
                let Some(tube_ref) = self.ctx.routes.streams.get(&key).copied() else {
                    debug!(%from, stream=%key, "Close for an unknown stream");
                    return;
                };

                if let Ok(tube) = find_tube_mut(&mut self.channels, tube_ref.container, tube_ref.id) {
                    tube.on_stream_closed(&mut self.ctx, key);
                }
            }
            Stanza::CloseTube { id } => {
                let container = Container::contact(from);

                let Ok(tube) = find_tube_mut(&mut self.channels, container, id) else {
                    debug!(%from, tube=%id, "Close for an unknown tube");
                    return;
                };

                info!(%container, tube=%id, "Peer closed tube");
                let _closed = tube.close(&mut self.ctx, true);
                self.reap(from);
            }
            Stanza::Announcement(_) => {
                warn!(%from, "Ignoring tube announcement outside a room");
            }
        }
    }

    fn handle_group_stanza(&mut self, room: Handle, from: Handle, stanza: Stanza) {
        if from == self.ctx.self_handle {
            return;
        }

        let Stanza::Announcement(announcement) = stanza else {
            debug!(%room, %from, "Ignoring unexpected group stanza");
            return;
        };

        let _channel = self.ensure_channel(Container::room(room));

        if let Some(channel) = self.channels.get_mut(&room) {
            channel.apply_announcement(&mut self.ctx, from, announcement);
        }

        self.reap(room);
    }

    fn handle_data(&mut self, from: Handle, room: Option<Handle>, frame: DataFrame) {
        let DataFrame {
            stream_id,
            initiator,
            payload,
        } = frame;

        let Some(key) = frame_key(&self.ctx, from, room, stream_id, &initiator) else {
            return;
        };
        let Some(tube_ref) = self.ctx.routes.streams.get(&key).copied() else {
            debug!(%from, stream=%key, len=payload.len(), "Dropping data for an unknown stream");
            return;
        };

        if let Ok(tube) = find_tube_mut(&mut self.channels, tube_ref.container, tube_ref.id) {
            tube.on_data(&mut self.ctx, from, key, &payload);
        }
    }

    fn reply(&self, to: Handle, id: RequestId, body: NegotiationReply) {
        if let Err(err) = self.ctx.session.send(to, Stanza::Reply { id, body }) {
            debug!(%err, %to, ?id, "Failed to send negotiation reply");
        }
    }

    fn refuse(&self, to: Handle, id: RequestId, error: NegotiationError) {
        warn!(%to, ?id, %error, "Refusing bytestream request");
        self.reply(to, id, NegotiationReply::Error(error));
    }

    fn handle_request(&mut self, from: Handle, id: RequestId, body: NegotiationRequest) {
        let validated = match negotiator::validate(&body) {
            Ok(validated) => validated,
            Err(error) => return self.refuse(from, id, error),
        };

        let result = match validated {
            Validated::Offer {
                stream_id,
                method,
                tube,
            } => self.receive_tube_offer(from, id, BytestreamKey::new(from, stream_id, from), method, tube),
            Validated::Connection {
                stream_id,
                method,
                tube_id,
            } => {
                let key = BytestreamKey::new(from, stream_id, from);
                self.receive_connection(from, id, key, Container::contact(from), tube_id, method)
            }
            Validated::RoomConnection {
                stream_id,
                room,
                tube_id,
            } => match self.ctx.handles.lookup_name(&room) {
                Some(room) => {
                    let key = BytestreamKey::new(from, stream_id, from);
                    let method = BytestreamMethod::MulticastSlice;
                    self.receive_connection(from, id, key, Container::room(room), tube_id, method)
                }
                None => Err(NegotiationError::BadRequest),
            },
        };

        if let Err(error) = result {
            self.refuse(from, id, error);
        }
    }

    /// A contact offers us a one-to-one tube. The reply waits for the
    /// application to accept.
    fn receive_tube_offer(
        &mut self,
        from: Handle,
        request: RequestId,
        key: BytestreamKey,
        method: BytestreamMethod,
        offer: TubeOffer,
    ) -> Result<(), NegotiationError> {
        if offer.service.is_empty() || self.ctx.routes.streams.contains_key(&key) {
            return Err(NegotiationError::BadRequest);
        }

        let container = Container::contact(from);
        let channel = self.ensure_channel(container);

        if channel.tubes.contains_key(&offer.id) {
            debug!(%container, tube=%offer.id, "Offer reuses a live tube id");
            return Err(NegotiationError::BadRequest);
        }

        let TubeOffer {
            id,
            kind,
            service,
            parameters,
        } = offer;

        let mut tube = Tube::remote(&mut self.ctx, container, id, from, kind, service, parameters);

        let stream = Bytestream::local_pending(key, method, Route::Peer(from), self.ctx.name_of(from));
        tube.receive_offer(
            &mut self.ctx,
            IncomingOffer {
                request,
                key,
                method,
            },
            stream,
        );

        info!(%container, tube=%id, %kind, service=%tube.service, "Received tube offer");

        self.ctx.emit(TubesEvent::NewTube {
            container,
            info: tube.info(),
        });

        if let Some(channel) = self.channels.get_mut(&container.handle) {
            let _ignored = channel.tubes.insert(id, tube);
        }

        Ok(())
    }

    /// A peer asks to open another stream on a tube we offered.
    fn receive_connection(
        &mut self,
        from: Handle,
        request: RequestId,
        key: BytestreamKey,
        container: Container,
        id: TubeId,
        method: BytestreamMethod,
    ) -> Result<(), NegotiationError> {
        if self.ctx.routes.streams.contains_key(&key) {
            return Err(NegotiationError::BadRequest);
        }

        let Ok(tube) = find_tube_mut(&mut self.channels, container, id) else {
            debug!(%container, tube=%id, %from, "Connection request for an unknown tube");
            return Err(NegotiationError::BadRequest);
        };

        let route = if container.is_group() {
            Route::Room(container.handle)
        } else {
            Route::Peer(from)
        };

        let mut stream = Bytestream::local_pending(key, method, route, self.ctx.name_of(from));
        let _accepted = stream.accept();

        tube.add_bytestream(&mut self.ctx, stream)?;

        debug!(%container, tube=%id, stream=%key, streams=tube.bytestream_count(), "Accepted bytestream");

        let method = (!container.is_group()).then(|| method.as_str().to_owned());
        self.reply(from, request, NegotiationReply::Accept { method });

        self.reap(container.handle);

        Ok(())
    }

    fn handle_reply(&mut self, from: Handle, id: RequestId, body: NegotiationReply) {
        let Some(pending) = self.negotiator.complete(from, id) else {
            debug!(%from, ?id, pending=self.negotiator.pending_count(), "Dropping reply to an unknown request");
            return;
        };

        let Pending {
            peer,
            stream_id,
            tube: tube_ref,
            generation,
            purpose,
        } = pending;

        let live = find_tube_mut(&mut self.channels, tube_ref.container, tube_ref.id)
            .ok()
            .filter(|tube| tube.generation == generation && !tube.state().is_closed());

        let Some(tube) = live else {
            debug!(%peer, %stream_id, tube=%tube_ref.id, "Reply arrived for a tube that is gone");
            if matches!(body, NegotiationReply::Accept { .. }) {
                let stanza = Stanza::CloseStream {
                    stream_id,
                    initiator: self.ctx.self_name.clone(),
                };
                if let Err(err) = self.ctx.session.send(peer, stanza) {
                    debug!(%err, %peer, "Failed to close stale stream");
                }
            }
            return;
        };

        let room = match purpose {
            Purpose::Connection { room, .. } => room,
            Purpose::Offer => None,
        };

        let method = match &body {
            NegotiationReply::Accept { method } => match room {
                Some(_) => Some(BytestreamMethod::MulticastSlice),
                None => method.as_deref().and_then(BytestreamMethod::from_wire),
            },
            NegotiationReply::Error(_) => None,
        };

        match (purpose, body, method) {
            (Purpose::Offer, NegotiationReply::Accept { .. }, Some(method)) => {
                let key = BytestreamKey::new(peer, stream_id, self.ctx.self_handle);
                let mut stream = Bytestream::initiating(
                    key,
                    method,
                    Route::Peer(peer),
                    self.ctx.self_name.clone(),
                );
                let _started = stream.start();

                info!(container=%tube_ref.container, tube=%tube_ref.id, "Peer accepted tube");

                if let Err(error) = tube.add_bytestream(&mut self.ctx, stream) {
                    warn!(tube=%tube_ref.id, %error, "Could not open the accepted tube");
                    let _closed = tube.close(&mut self.ctx, false);
                }
            }
            (Purpose::Offer, NegotiationReply::Error(reason), _) => {
                info!(container=%tube_ref.container, tube=%tube_ref.id, %reason, "Peer declined tube");
                self.ctx.emit(TubesEvent::OfferRejected {
                    container: tube_ref.container,
                    id: tube_ref.id,
                    reason,
                });
            }
            (Purpose::Offer, NegotiationReply::Accept { method }, None) => {
                warn!(tube=%tube_ref.id, ?method, "Peer accepted with a method we did not offer");
                let _closed = tube.close(&mut self.ctx, false);
            }
            (Purpose::Connection { conn, room }, NegotiationReply::Accept { .. }, Some(method)) => {
                let key = BytestreamKey::new(peer, stream_id, self.ctx.self_handle);
                let route = room.map_or(Route::Peer(peer), Route::Room);
                let mut stream =
                    Bytestream::initiating(key, method, route, self.ctx.self_name.clone());
                let _started = stream.start();

                tube.attach_stream(&mut self.ctx, conn, stream);
            }
            (Purpose::Connection { conn, .. }, body, _) => {
                warn!(tube=%tube_ref.id, %conn, ?body, "Peer refused connection");
                tube.reject_conn(&mut self.ctx, conn);
            }
        }

        self.reap(tube_ref.container.handle);
    }

    fn handle_joined(&mut self, room: Handle) {
        info!(%room, "Joined room");

        let _ignored = self.joined_rooms.insert(room);

        let Some(channel) = self.channels.get_mut(&room) else {
            return;
        };

        channel.set_ready();
        let container = channel.container;

        for (id, requests) in channel.take_pending() {
            let result = self.perform_offer(container, id);

            for request in requests {
                request.resolve(result.clone());
            }
        }

        self.reap(room);
    }

    fn handle_member_left(&mut self, room: Handle, member: Handle) {
        if member == self.ctx.self_handle {
            info!(%room, "Left room");
            let _ignored = self.joined_rooms.remove(&room);
            self.drop_channel(room, &TubeError::ChannelClosed);
            return;
        }

        let Some(channel) = self.channels.get_mut(&room) else {
            return;
        };

        debug!(%room, %member, "Room member left");
        channel.member_left(&mut self.ctx, member);

        self.reap(room);
    }

    /// Removes a channel, closing its tubes and failing queued requests.
    fn drop_channel(&mut self, handle: Handle, error: &TubeError) {
        let Some(mut channel) = self.channels.remove(&handle) else {
            return;
        };

        for tube in channel.tubes.values() {
            self.negotiator.forget(tube.tube_ref());
        }

        channel.close(&mut self.ctx, error);
    }
}

#[cfg(test)]
#[path = "../tests/handler.rs"]
mod tests;
