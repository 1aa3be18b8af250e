use std::collections::{BTreeMap, HashMap};
use std::io;

use bytes::Bytes;
use lanlink_primitives::bytestream::{BytestreamKey, BytestreamMethod, StreamId};
use lanlink_primitives::dbus::BusName;
use lanlink_primitives::handle::{Container, Handle};
use lanlink_primitives::socket::{AccessControl, AddressKind, SocketAddress};
use lanlink_primitives::tube::{Parameters, TubeId, TubeInfo, TubeKind, TubeState};
use lanlink_tubes_primitives::error::{NegotiationError, TubeError};
use lanlink_tubes_primitives::events::TubesEvent;
use lanlink_tubes_primitives::wire::{AnnouncedTube, NegotiationReply, RequestId, Stanza};
use tracing::{debug, info, warn};

use crate::bridge::local::{self, LocalStream, Pump};
use crate::bridge::{Bridge, ConnId, Flush, Listener, ListenerId};
use crate::bytestream::{Bytestream, Refused, SendOutcome};
use crate::context::{Context, TubeRef};

/// An offer we received and have not answered yet.
#[derive(Clone, Copy, Debug)]
pub(crate) struct IncomingOffer {
    pub request: RequestId,
    pub key: BytestreamKey,
    pub method: BytestreamMethod,
}

#[derive(Debug)]
pub(crate) enum TubeVariant {
    Stream {
        /// What the initiator's bytestreams are connected to.
        service: Option<SocketAddress>,
        access_control: AccessControl,
    },
    DBus {
        names: BTreeMap<Handle, BusName>,
    },
}

/// What became of a connection accepted on the tube's listener.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Accepted {
    Paired,
    /// Parked until a bytestream shows up for it.
    Held,
    /// Needs a new bytestream negotiated with the initiator.
    NeedsStream(ConnId),
    Rejected,
}

#[derive(Debug)]
pub(crate) struct Tube {
    pub id: TubeId,
    pub container: Container,
    pub initiator: Handle,
    pub service: String,
    pub parameters: Parameters,
    /// Distinguishes this tube from a later one reusing its id.
    pub generation: u64,
    state: TubeState,
    variant: TubeVariant,
    bridge: Bridge,
    bytestreams: HashMap<BytestreamKey, Bytestream>,
    incoming_offer: Option<IncomingOffer>,
}

impl Tube {
    #[expect(clippy::too_many_arguments, reason = "Mirrors the tube descriptor")]
    fn new(
        ctx: &mut Context,
        container: Container,
        id: TubeId,
        initiator: Handle,
        kind: TubeKind,
        service: String,
        parameters: Parameters,
        state: TubeState,
    ) -> Self {
        let variant = match kind {
            TubeKind::Stream => TubeVariant::Stream {
                service: None,
                access_control: AccessControl::Localhost,
            },
            TubeKind::DBus => TubeVariant::DBus {
                names: BTreeMap::new(),
            },
        };

        Self {
            id,
            container,
            initiator,
            service,
            parameters,
            generation: ctx.next_serial(),
            state,
            variant,
            bridge: Bridge::default(),
            bytestreams: HashMap::new(),
            incoming_offer: None,
        }
    }

    /// A tube created by the local application, not yet offered.
    pub fn local(
        ctx: &mut Context,
        container: Container,
        id: TubeId,
        kind: TubeKind,
        service: String,
        parameters: Parameters,
    ) -> Self {
        let initiator = ctx.self_handle;
        Self::new(
            ctx,
            container,
            id,
            initiator,
            kind,
            service,
            parameters,
            TubeState::NotOffered,
        )
    }

    /// A tube some peer offered us.
    pub fn remote(
        ctx: &mut Context,
        container: Container,
        id: TubeId,
        initiator: Handle,
        kind: TubeKind,
        service: String,
        parameters: Parameters,
    ) -> Self {
        Self::new(
            ctx,
            container,
            id,
            initiator,
            kind,
            service,
            parameters,
            TubeState::LocalPending,
        )
    }

    pub const fn tube_ref(&self) -> TubeRef {
        TubeRef {
            container: self.container,
            id: self.id,
        }
    }

    pub const fn state(&self) -> TubeState {
        self.state
    }

    pub const fn kind(&self) -> TubeKind {
        match self.variant {
            TubeVariant::Stream { .. } => TubeKind::Stream,
            TubeVariant::DBus { .. } => TubeKind::DBus,
        }
    }

    pub fn is_initiator(&self, ctx: &Context) -> bool {
        self.initiator == ctx.self_handle
    }

    pub const fn offer_needed(&self) -> bool {
        matches!(self.state, TubeState::NotOffered)
    }

    pub fn info(&self) -> TubeInfo {
        TubeInfo {
            id: self.id,
            initiator: self.initiator,
            kind: self.kind(),
            service: self.service.clone(),
            parameters: self.parameters.clone(),
            state: self.state,
        }
    }

    pub fn set_state(&mut self, ctx: &Context, state: TubeState) {
        if self.state == state || self.state.is_closed() {
            return;
        }

        debug!(tube=%self.id, container=%self.container, from=?self.state, to=?state, "Tube state changed");

        self.state = state;

        if !state.is_closed() {
            ctx.emit(TubesEvent::TubeStateChanged {
                container: self.container,
                id: self.id,
                state,
            });
        }
    }

    pub fn require_kind(&self, kind: TubeKind) -> Result<(), TubeError> {
        if self.kind() != kind {
            return Err(TubeError::WrongKind {
                id: self.id,
                actual: self.kind(),
            });
        }
        Ok(())
    }

    pub fn require_state(&self, state: TubeState, expected: &'static str) -> Result<(), TubeError> {
        if self.state != state {
            return Err(TubeError::InvalidState {
                id: self.id,
                state: self.state,
                expected,
            });
        }
        Ok(())
    }

    pub fn set_service(&mut self, address: SocketAddress, access: AccessControl) {
        if let TubeVariant::Stream {
            service,
            access_control,
        } = &mut self.variant
        {
            *service = Some(address);
            *access_control = access;
        }
    }

    pub fn service_address(&self) -> Option<&SocketAddress> {
        match &self.variant {
            TubeVariant::Stream { service, .. } => service.as_ref(),
            TubeVariant::DBus { .. } => None,
        }
    }

    pub fn local_address(&self) -> Option<&SocketAddress> {
        self.bridge.listener().map(|listener| &listener.address)
    }

    pub fn bytestream_count(&self) -> usize {
        self.bytestreams.len()
    }

    pub fn pair_count(&self) -> usize {
        self.bridge.pair_count()
    }

    /// Starts listening for local connections on a fresh socket.
    pub fn listen(
        &mut self,
        ctx: &mut Context,
        kind: AddressKind,
        access_control: AccessControl,
    ) -> io::Result<SocketAddress> {
        let (listener, address) = local::bind(kind, &ctx.config.socket_dir)?;

        let id = ListenerId::new(ctx.next_serial());
        let task = local::spawn_accept_loop(id, listener, ctx.local_sender());

        let _ignored = ctx.routes.listeners.insert(id, self.tube_ref());
        self.bridge
            .set_listener(Listener::new(id, address.clone(), access_control, task));

        info!(tube=%self.id, container=%self.container, %address, "Tube listening for local connections");

        Ok(address)
    }

    fn insert_bytestream(&mut self, ctx: &mut Context, bytestream: Bytestream) {
        let key = bytestream.key;
        let _ignored = ctx.routes.streams.insert(key, self.tube_ref());
        let _ignored = self.bytestreams.insert(key, bytestream);
    }

    /// Records an incoming one-to-one offer along with its first stream.
    pub fn receive_offer(&mut self, ctx: &mut Context, offer: IncomingOffer, stream: Bytestream) {
        self.insert_bytestream(ctx, stream);
        self.incoming_offer = Some(offer);
    }

    /// Moves an accepted tube to Open, answering a pending offer if any.
    pub fn accepted(&mut self, ctx: &mut Context) {
        if let Some(offer) = self.incoming_offer.take() {
            let reply = Stanza::Reply {
                id: offer.request,
                body: NegotiationReply::Accept {
                    method: Some(offer.method.as_str().to_owned()),
                },
            };

            if let Err(err) = ctx.session.send(offer.key.peer, reply) {
                warn!(%err, tube=%self.id, "Failed to send tube acceptance");
            }

            if let Some(stream) = self.bytestreams.get_mut(&offer.key) {
                let _accepted = stream.accept();
            }
        }

        self.set_state(ctx, TubeState::Open);
    }

    /// Takes a freshly negotiated bytestream into a tube we initiated.
    pub fn add_bytestream(
        &mut self,
        ctx: &mut Context,
        mut stream: Bytestream,
    ) -> Result<(), NegotiationError> {
        if !self.is_initiator(ctx) {
            debug!(tube=%self.id, peer=%stream.key.peer, "Refusing stream on a tube we did not offer");
            stream.close(ctx.session.as_ref(), false);
            return Err(NegotiationError::Forbidden);
        }

        if !matches!(self.state, TubeState::Open | TubeState::RemotePending) {
            stream.close(ctx.session.as_ref(), false);
            return Err(NegotiationError::Forbidden);
        }

        let key = stream.key;

        match &self.variant {
            TubeVariant::Stream { service, .. } => {
                let Some(address) = service.clone() else {
                    stream.close(ctx.session.as_ref(), false);
                    return Err(NegotiationError::Forbidden);
                };

                self.insert_bytestream(ctx, stream);

                let conn = ConnId::new(ctx.next_serial());
                let _ignored = ctx.routes.conns.insert(conn, self.tube_ref());
                self.bridge.add_dialing(conn);
                self.bridge.pair(key, conn);

                local::spawn_dial(conn, address, ctx.local_sender());

                ctx.emit(TubesEvent::NewPeerConnection {
                    container: self.container,
                    id: self.id,
                    peer: key.peer,
                });
            }
            TubeVariant::DBus { .. } => {
                self.insert_bytestream(ctx, stream);

                if let Some(conn) = self.bridge.first_waiting() {
                    self.pair(key, conn);
                }
            }
        }

        if self.state == TubeState::RemotePending {
            self.set_state(ctx, TubeState::Open);
        }

        Ok(())
    }

    /// Completes a connection negotiated on behalf of a waiting local socket.
    pub fn attach_stream(&mut self, ctx: &mut Context, conn: ConnId, mut stream: Bytestream) {
        if !self.bridge.is_waiting(conn) {
            debug!(tube=%self.id, %conn, "Local connection went away during negotiation");
            stream.close(ctx.session.as_ref(), true);
            return;
        }

        let key = stream.key;
        self.insert_bytestream(ctx, stream);
        self.pair(key, conn);
    }

    /// Drops a local connection whose negotiation was refused.
    pub fn reject_conn(&mut self, ctx: &mut Context, conn: ConnId) {
        if self.bridge.force_close(conn) {
            let _ignored = ctx.routes.conns.remove(&conn);
        }
    }

    /// Pairs and, if the socket is connected, starts moving data.
    fn pair(&mut self, key: BytestreamKey, conn: ConnId) {
        self.bridge.pair(key, conn);

        if self.bridge.is_ready(conn) {
            self.start_flow(key, conn);
        }
    }

    fn start_flow(&mut self, key: BytestreamKey, conn: ConnId) {
        if let Some(stream) = self.bytestreams.get_mut(&key) {
            if let Some(queued) = stream.resume_inbound() {
                if self.bridge.write(conn, queued) {
                    stream.pause_inbound();
                }
            }
        }

        self.bridge.grant_read(conn);
    }

    /// The first open bytestream with no local socket yet.
    fn parked_stream(&self) -> Option<BytestreamKey> {
        self.bytestreams
            .iter()
            .filter(|(key, stream)| {
                stream.is_open() && !stream.is_closing() && self.bridge.conn_for(**key).is_none()
            })
            .map(|(key, _)| *key)
            .min()
    }

    pub fn on_accepted(
        &mut self,
        ctx: &mut Context,
        stream: LocalStream,
        source_port: Option<u16>,
    ) -> Accepted {
        let Some(listener) = self.bridge.listener() else {
            return Accepted::Rejected;
        };

        if !listener.access_control.admits(source_port) {
            debug!(tube=%self.id, ?source_port, "Local connection refused by access control");
            return Accepted::Rejected;
        }

        if !matches!(self.state, TubeState::Open | TubeState::RemotePending) {
            return Accepted::Rejected;
        }

        let conn = ConnId::new(ctx.next_serial());
        let pump = Pump::spawn(conn, stream, ctx.config.read_chunk_size, ctx.local_sender());
        let _ignored = ctx.routes.conns.insert(conn, self.tube_ref());
        self.bridge.add_waiting(conn, pump);

        debug!(tube=%self.id, %conn, pairs=self.pair_count(), "Accepted local connection");

        if let Some(key) = self.parked_stream() {
            self.pair(key, conn);
            return Accepted::Paired;
        }

        match self.variant {
            TubeVariant::DBus { .. } => {
                if self.bridge.conn_count() > 1 {
                    debug!(tube=%self.id, "Tube bus already has a client");
                    self.reject_conn(ctx, conn);
                    return Accepted::Rejected;
                }
                Accepted::Held
            }
            TubeVariant::Stream { .. } => Accepted::NeedsStream(conn),
        }
    }

    pub fn on_dialed(&mut self, ctx: &mut Context, conn: ConnId, result: io::Result<LocalStream>) {
        match result {
            Ok(stream) => {
                let pump = Pump::spawn(conn, stream, ctx.config.read_chunk_size, ctx.local_sender());

                if !self.bridge.attach_pump(conn, pump) {
                    return;
                }

                if let Some(key) = self.bridge.stream_for(conn) {
                    self.start_flow(key, conn);
                }
            }
            Err(err) => {
                warn!(%err, tube=%self.id, %conn, "Failed to connect to the tube service");
                self.on_local_closed(ctx, conn);
            }
        }
    }

    pub fn on_read(&mut self, ctx: &mut Context, conn: ConnId, data: Bytes) {
        let Some(key) = self.bridge.stream_for(conn) else {
            return;
        };
        let Some(stream) = self.bytestreams.get_mut(&key) else {
            return;
        };

        match stream.send(ctx.session.as_ref(), data) {
            SendOutcome::Sent => self.bridge.grant_read(conn),
            SendOutcome::Blocked => {}
            SendOutcome::Failed => self.teardown_stream(ctx, key, true),
        }
    }

    pub fn on_flushed(&mut self, ctx: &mut Context, conn: ConnId) {
        match self.bridge.flushed(conn) {
            Flush::Pending => {}
            Flush::Finished => {
                let _ignored = ctx.routes.conns.remove(&conn);
            }
            Flush::Idle => {
                let Some(key) = self.bridge.stream_for(conn) else {
                    return;
                };

                if let Some(stream) = self.bytestreams.get_mut(&key) {
                    if let Some(queued) = stream.resume_inbound() {
                        if self.bridge.write(conn, queued) {
                            stream.pause_inbound();
                        }
                    }
                }
            }
        }
    }

    /// The local side hung up, or a dial failed. Anything it wrote that is
    /// still waiting on the session goes out before the bytestream closes.
    pub fn on_local_closed(&mut self, ctx: &mut Context, conn: ConnId) {
        if let Some(key) = self.bridge.unpair_conn(conn) {
            let deferred = self
                .bytestreams
                .get_mut(&key)
                .is_some_and(Bytestream::close_when_sent);

            if deferred {
                debug!(tube=%self.id, stream=%key, "Closing bytestream once queued data is sent");
            } else {
                self.teardown_stream(ctx, key, true);
            }
        }

        if self.bridge.force_close(conn) {
            let _ignored = ctx.routes.conns.remove(&conn);
        }
    }

    pub fn on_data(
        &mut self,
        ctx: &mut Context,
        from: Handle,
        key: BytestreamKey,
        payload: &[u8],
    ) {
        let limit = ctx.config.max_inbound_buffer;
        let Some(stream) = self.bytestreams.get_mut(&key) else {
            return;
        };

        let data = match stream.receive(from, payload, limit) {
            Ok(Some(data)) => data,
            Ok(None) => return,
            Err(Refused::Framing(err)) => {
                warn!(%err, tube=%self.id, stream=%key, sender=%from, "Dropping malformed bus message");
                return;
            }
            Err(Refused::Overflow) => {
                warn!(tube=%self.id, stream=%key, limit, "Local client is not reading, closing bytestream");
                self.teardown_stream(ctx, key, true);
                return;
            }
        };
        let Some(conn) = self.bridge.conn_for(key) else {
            return;
        };

        if self.bridge.write(conn, data) {
            stream.pause_inbound();
        }
    }

    /// The peer closed one of our bytestreams.
    pub fn on_stream_closed(&mut self, ctx: &mut Context, key: BytestreamKey) {
        self.teardown_stream(ctx, key, false);
    }

    pub fn on_writable(&mut self, ctx: &mut Context, target: Handle) {
        let blocked: Vec<_> = self
            .bytestreams
            .iter()
            .filter(|(_, stream)| stream.is_write_blocked() && stream.route.target() == target)
            .map(|(key, _)| *key)
            .collect();

        for key in blocked {
            let Some(stream) = self.bytestreams.get_mut(&key) else {
                continue;
            };

            match stream.flush(ctx.session.as_ref()) {
                SendOutcome::Sent if stream.is_closing() => self.teardown_stream(ctx, key, true),
                SendOutcome::Sent => {
                    if let Some(conn) = self.bridge.conn_for(key) {
                        self.bridge.grant_read(conn);
                    }
                }
                SendOutcome::Blocked => {}
                SendOutcome::Failed => self.teardown_stream(ctx, key, true),
            }
        }
    }

    /// Removes one bytestream and lets its socket drain before closing.
    /// Data parked while the socket was slow is handed to it first.
    fn teardown_stream(&mut self, ctx: &mut Context, key: BytestreamKey, notify_peer: bool) {
        let _ignored = ctx.routes.streams.remove(&key);
        let conn = self.bridge.unpair_stream(key);

        if let Some(mut stream) = self.bytestreams.remove(&key) {
            debug!(tube=%self.id, stream=%key, state=?stream.state(), notify_peer, "Closing bytestream");

            if let Some(conn) = conn {
                if let Some(queued) = stream.resume_inbound() {
                    if !self.bridge.write(conn, queued) {
                        warn!(tube=%self.id, stream=%key, "Local socket gone, dropping undelivered data");
                    }
                }
            }

            stream.close(ctx.session.as_ref(), notify_peer);
        }

        if let Some(conn) = conn {
            if self.bridge.close_after_flush(conn) {
                let _ignored = ctx.routes.conns.remove(&conn);
            }
        }

        if self.incoming_offer.is_some_and(|offer| offer.key == key) {
            self.incoming_offer = None;
        }
    }

    /// A room member left: drop its streams and its bus name, and close the
    /// tube if it was the initiator.
    pub fn member_left(&mut self, ctx: &mut Context, member: Handle) {
        let keys: Vec<_> = self
            .bytestreams
            .keys()
            .filter(|key| key.peer == member)
            .copied()
            .collect();

        for key in keys {
            self.teardown_stream(ctx, key, false);
        }

        for stream in self.bytestreams.values_mut() {
            stream.forget_sender(member);
        }

        self.remove_bus_name(ctx, member);

        if self.initiator == member {
            info!(tube=%self.id, container=%self.container, %member, "Tube initiator left the room");
            let _closed = self.close(ctx, true);
        }
    }

    pub fn bus_names(&self) -> Vec<(Handle, BusName)> {
        match &self.variant {
            TubeVariant::DBus { names } => names
                .iter()
                .map(|(handle, name)| (*handle, name.clone()))
                .collect(),
            TubeVariant::Stream { .. } => Vec::new(),
        }
    }

    pub fn own_bus_name(&self, ctx: &Context) -> Option<BusName> {
        match &self.variant {
            TubeVariant::DBus { names } => names.get(&ctx.self_handle).cloned(),
            TubeVariant::Stream { .. } => None,
        }
    }

    pub fn set_bus_name(&mut self, ctx: &Context, member: Handle, name: BusName) {
        let TubeVariant::DBus { names } = &mut self.variant else {
            return;
        };

        if names.get(&member) == Some(&name) {
            return;
        }

        let _ignored = names.insert(member, name.clone());

        ctx.emit(TubesEvent::DBusNamesChanged {
            container: self.container,
            id: self.id,
            added: vec![(member, name)],
            removed: Vec::new(),
        });
    }

    pub fn remove_bus_name(&mut self, ctx: &Context, member: Handle) {
        let TubeVariant::DBus { names } = &mut self.variant else {
            return;
        };

        if names.remove(&member).is_none() {
            return;
        }

        ctx.emit(TubesEvent::DBusNamesChanged {
            container: self.container,
            id: self.id,
            added: Vec::new(),
            removed: vec![member],
        });
    }

    /// Joins a room D-Bus tube's shared bus: claims our bus name and opens
    /// the room-wide stream.
    pub fn join_room_bus(&mut self, ctx: &mut Context) {
        let name = BusName::unique_for(&ctx.self_name);
        self.set_bus_name(ctx, ctx.self_handle, name);

        let room = self.container.handle;
        let key = BytestreamKey::new(room, StreamId::from(self.id), room);

        if self.bytestreams.contains_key(&key) {
            return;
        }

        self.insert_bytestream(ctx, Bytestream::room_bus(key, ctx.name_of(room)));

        if let Some(conn) = self.bridge.first_waiting() {
            self.pair(key, conn);
        }
    }

    pub fn announcement(&self, ctx: &Context) -> AnnouncedTube {
        AnnouncedTube {
            id: self.id,
            kind: self.kind(),
            service: self.service.clone(),
            parameters: self.parameters.clone(),
            initiator: ctx.name_of(self.initiator),
            bus_name: self.own_bus_name(ctx),
        }
    }

    /// Tears the tube down. Safe to call repeatedly; only the first call
    /// has any effect. Returns whether this call closed the tube.
    pub fn close(&mut self, ctx: &mut Context, closed_remotely: bool) -> bool {
        if self.state.is_closed() {
            return false;
        }

        let previous = self.state;

        debug!(tube=%self.id, streams=self.bytestream_count(), pairs=self.pair_count(), "Closing tube");

        for key in self.bytestreams.keys() {
            let _ignored = ctx.routes.streams.remove(key);
        }

        let (conns, listener) = self.bridge.close_all();
        for conn in conns {
            let _ignored = ctx.routes.conns.remove(&conn);
        }
        if let Some(listener) = listener {
            let _ignored = ctx.routes.listeners.remove(&listener);
        }

        let notify = !closed_remotely && !ctx.disconnected;

        for (_, mut stream) in self.bytestreams.drain() {
            stream.close(ctx.session.as_ref(), notify);
        }

        if let Some(offer) = self.incoming_offer.take() {
            if notify {
                let reply = Stanza::Reply {
                    id: offer.request,
                    body: NegotiationReply::Error(NegotiationError::Forbidden),
                };
                if let Err(err) = ctx.session.send(offer.key.peer, reply) {
                    debug!(%err, tube=%self.id, "Failed to decline tube offer");
                }
            }
        }

        let told_peer = self.is_initiator(ctx)
            && matches!(previous, TubeState::Open | TubeState::RemotePending);

        if notify && !self.container.is_group() && told_peer {
            let stanza = Stanza::CloseTube { id: self.id };
            if let Err(err) = ctx.session.send(self.container.handle, stanza) {
                debug!(%err, tube=%self.id, "Failed to notify peer of tube close");
            }
        }

        if let TubeVariant::DBus { names } = &mut self.variant {
            names.clear();
        }

        self.state = TubeState::Closed;

        info!(tube=%self.id, container=%self.container, remote=closed_remotely, "Tube closed");

        ctx.emit(TubesEvent::TubeClosed {
            container: self.container,
            id: self.id,
        });

        true
    }
}

#[cfg(test)]
#[path = "tests/tube.rs"]
mod tests;
