//! Application requests.

use std::collections::BTreeMap;

use eyre::Result as EyreResult;
use lanlink_primitives::dbus::BusName;
use lanlink_primitives::handle::{Container, Handle};
use lanlink_primitives::socket::{AccessControl, AddressKind, SocketAddress};
use lanlink_primitives::tube::{TubeId, TubeInfo, TubeKind, TubeState};
use lanlink_tubes_primitives::client::TubesMessage;
use lanlink_tubes_primitives::error::TubeError;
use lanlink_tubes_primitives::events::TubesEvent;
use lanlink_tubes_primitives::messages::{
    AcceptStreamTube, CreateStreamTube, DBusAddress, OfferDBusTube, OfferStreamTube, TubeRequest,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::channel::{PendingRequest, TubesChannel};
use crate::tube::Tube;
use crate::TubesManager;

fn reply<T>(outcome: oneshot::Sender<EyreResult<T>>, result: Result<T, TubeError>) {
    if outcome.send(result.map_err(Into::into)).is_err() {
        debug!("Requester went away before the reply");
    }
}

#[allow(
    clippy::multiple_inherent_impl,
    reason = "Handlers live next to the inputs they serve"
)]
impl TubesManager {
    pub(crate) fn handle_command(&mut self, command: TubesMessage) {
        match command {
            TubesMessage::CreateStreamTube { request, outcome } => {
                reply(outcome, self.create_stream_tube(request));
            }
            TubesMessage::OfferStreamTube { request, outcome } => {
                self.offer_stream_tube(request, outcome);
            }
            TubesMessage::AcceptStreamTube { request, outcome } => {
                reply(outcome, self.accept_stream_tube(request));
            }
            TubesMessage::GetStreamTubeSocketAddress { request, outcome } => {
                reply(outcome, self.stream_tube_socket_address(request));
            }
            TubesMessage::OfferDBusTube { request, outcome } => {
                self.offer_dbus_tube(request, outcome);
            }
            TubesMessage::AcceptDBusTube { request, outcome } => {
                reply(outcome, self.accept_dbus_tube(request));
            }
            TubesMessage::GetDBusTubeAddress { request, outcome } => {
                reply(outcome, self.dbus_tube_address(request));
            }
            TubesMessage::GetDBusNames { request, outcome } => {
                reply(outcome, self.dbus_names(request));
            }
            TubesMessage::CloseTube { request, outcome } => {
                reply(outcome, self.close_tube(request));
            }
            TubesMessage::ListTubes { container, outcome } => {
                if outcome.send(self.list_tubes(container)).is_err() {
                    debug!("Requester went away before the reply");
                }
            }
            TubesMessage::CloseChannel { container, outcome } => {
                reply(outcome, self.close_channel(container));
            }
        }
    }

    fn ensure_connected(&self) -> Result<(), TubeError> {
        if self.ctx.disconnected {
            return Err(TubeError::Disconnected);
        }
        Ok(())
    }

    fn create_stream_tube(&mut self, request: CreateStreamTube) -> Result<TubeId, TubeError> {
        self.ensure_connected()?;

        let CreateStreamTube {
            container,
            service,
            parameters,
        } = request;

        if service.is_empty() {
            return Err(TubeError::InvalidArgument("service must not be empty".to_owned()));
        }

        let id = self.create_local_tube(container, TubeKind::Stream, service, parameters);

        Ok(id)
    }

    fn create_local_tube(
        &mut self,
        container: Container,
        kind: TubeKind,
        service: String,
        parameters: lanlink_primitives::tube::Parameters,
    ) -> TubeId {
        let channel = self.ensure_channel(container);
        let id = channel.allocate_id();

        let tube = Tube::local(&mut self.ctx, container, id, kind, service, parameters);

        info!(%container, tube=%id, %kind, "Created tube");

        self.ctx.emit(TubesEvent::NewTube {
            container,
            info: tube.info(),
        });

        if let Some(channel) = self.channels.get_mut(&container.handle) {
            let _ignored = channel.tubes.insert(id, tube);
        }

        id
    }

    fn offer_stream_tube(
        &mut self,
        request: OfferStreamTube,
        outcome: oneshot::Sender<EyreResult<()>>,
    ) {
        let OfferStreamTube {
            container,
            id,
            address_kind,
            address,
            access_control,
        } = request;

        let prepared = self.ensure_connected().and_then(|()| {
            let tube = find_tube_mut(&mut self.channels, container, id)?;
            tube.require_kind(TubeKind::Stream)?;
            tube.require_state(TubeState::NotOffered, "NotOffered")?;

            if address.kind() != address_kind {
                return Err(TubeError::InvalidArgument(format!(
                    "address {address} is not a {address_kind:?} address"
                )));
            }

            if access_control != AccessControl::Localhost {
                return Err(TubeError::UnsupportedAccessControl {
                    access_control,
                    kind: address_kind,
                });
            }

            Ok(())
        });

        if let Err(err) = prepared {
            return reply(outcome, Err(err));
        }

        if let Err(err) = check_service(&address) {
            error!(%container, tube=%id, %address, %err, "Offered service is unusable");
            self.close_and_reap(container, id, false);
            return reply(outcome, Err(err));
        }

        if let Ok(tube) = find_tube_mut(&mut self.channels, container, id) {
            tube.set_service(address, access_control);
        }

        let ready = self
            .channels
            .get(&container.handle)
            .is_some_and(|channel| channel.is_ready());

        if !ready {
            debug!(%container, tube=%id, "Room not joined yet, queueing offer");
            if let Some(channel) = self.channels.get_mut(&container.handle) {
                channel.queue(id, PendingRequest::OfferStream(outcome));
            }
            return;
        }

        reply(outcome, self.perform_offer(container, id).map(drop));
    }

    fn offer_dbus_tube(&mut self, request: OfferDBusTube, outcome: oneshot::Sender<EyreResult<TubeId>>) {
        if let Err(err) = self.ensure_connected() {
            return reply(outcome, Err(err));
        }

        let OfferDBusTube {
            container,
            service,
            parameters,
        } = request;

        if service.is_empty() {
            return reply(
                outcome,
                Err(TubeError::InvalidArgument("service must not be empty".to_owned())),
            );
        }

        let id = self.create_local_tube(container, TubeKind::DBus, service, parameters);

        let listened = find_tube_mut(&mut self.channels, container, id).and_then(|tube| {
            tube.listen(&mut self.ctx, AddressKind::Unix, AccessControl::Localhost)
                .map_err(|err| TubeError::SocketSetup(err.to_string()))
        });

        if let Err(err) = listened {
            error!(%container, tube=%id, %err, "Failed to create tube bus");
            self.close_and_reap(container, id, false);
            return reply(outcome, Err(err));
        }

        let ready = self
            .channels
            .get(&container.handle)
            .is_some_and(|channel| channel.is_ready());

        if !ready {
            debug!(%container, tube=%id, "Room not joined yet, queueing offer");
            if let Some(channel) = self.channels.get_mut(&container.handle) {
                channel.queue(id, PendingRequest::OfferDBus(outcome));
            }
            return;
        }

        reply(outcome, self.perform_offer(container, id));
    }

    /// Makes a NotOffered tube visible to its container.
    pub(crate) fn perform_offer(&mut self, container: Container, id: TubeId) -> Result<TubeId, TubeError> {
        let tube = find_tube_mut(&mut self.channels, container, id)?;

        if !tube.offer_needed() {
            return Err(TubeError::InvalidState {
                id,
                state: tube.state(),
                expected: "NotOffered",
            });
        }

        if container.is_group() {
            if tube.kind() == TubeKind::DBus {
                tube.join_room_bus(&mut self.ctx);
            }
            tube.set_state(&self.ctx, TubeState::Open);

            if let Some(channel) = self.channels.get_mut(&container.handle) {
                channel.announce(&self.ctx, false);
            }

            info!(%container, tube=%id, "Tube offered to room");
            return Ok(id);
        }

        let channel = self
            .channels
            .get_mut(&container.handle)
            .ok_or(TubeError::UnknownChannel(container))?;
        let tube = channel.tube_mut(id)?;

        if let Err(err) = self.negotiator.offer(&self.ctx, tube) {
            warn!(%container, tube=%id, %err, "Failed to send tube offer");
            self.close_and_reap(container, id, false);
            return Err(TubeError::Disconnected);
        }

        tube.set_state(&self.ctx, TubeState::RemotePending);

        info!(%container, tube=%id, "Tube offered to contact");

        Ok(id)
    }

    fn accept_stream_tube(&mut self, request: AcceptStreamTube) -> Result<SocketAddress, TubeError> {
        self.ensure_connected()?;

        let AcceptStreamTube {
            container,
            id,
            address_kind,
            access_control,
        } = request;

        let tube = find_tube_mut(&mut self.channels, container, id)?;
        tube.require_kind(TubeKind::Stream)?;
        tube.require_state(TubeState::LocalPending, "LocalPending")?;

        if !access_control.supported_for(address_kind) {
            return Err(TubeError::UnsupportedAccessControl {
                access_control,
                kind: address_kind,
            });
        }

        let address = match tube.listen(&mut self.ctx, address_kind, access_control) {
            Ok(address) => address,
            Err(err) => {
                error!(%container, tube=%id, %err, "Failed to listen for tube connections");
                self.close_and_reap(container, id, false);
                return Err(TubeError::SocketSetup(err.to_string()));
            }
        };

        tube.accepted(&mut self.ctx);

        info!(%container, tube=%id, %address, "Accepted stream tube");

        self.reap(container.handle);

        Ok(address)
    }

    fn accept_dbus_tube(&mut self, request: TubeRequest) -> Result<DBusAddress, TubeError> {
        self.ensure_connected()?;

        let TubeRequest { container, id } = request;

        let tube = find_tube_mut(&mut self.channels, container, id)?;
        tube.require_kind(TubeKind::DBus)?;
        tube.require_state(TubeState::LocalPending, "LocalPending")?;

        let address = match tube.listen(&mut self.ctx, AddressKind::Unix, AccessControl::Localhost) {
            Ok(SocketAddress::Unix(path)) => DBusAddress(path),
            Ok(other) => {
                self.close_and_reap(container, id, false);
                return Err(TubeError::SocketSetup(format!("unexpected bus address {other}")));
            }
            Err(err) => {
                error!(%container, tube=%id, %err, "Failed to create tube bus");
                self.close_and_reap(container, id, false);
                return Err(TubeError::SocketSetup(err.to_string()));
            }
        };

        if container.is_group() {
            tube.join_room_bus(&mut self.ctx);
        }

        tube.accepted(&mut self.ctx);

        info!(%container, tube=%id, address=%address.to_address_string(), "Accepted D-Bus tube");

        self.reap(container.handle);

        Ok(address)
    }

    fn stream_tube_socket_address(&self, request: TubeRequest) -> Result<SocketAddress, TubeError> {
        let tube = find_tube(&self.channels, request.container, request.id)?;
        tube.require_kind(TubeKind::Stream)?;

        tube.local_address()
            .or_else(|| tube.service_address())
            .cloned()
            .ok_or(TubeError::InvalidState {
                id: request.id,
                state: tube.state(),
                expected: "an offered or accepted tube",
            })
    }

    fn dbus_tube_address(&self, request: TubeRequest) -> Result<DBusAddress, TubeError> {
        let tube = find_tube(&self.channels, request.container, request.id)?;
        tube.require_kind(TubeKind::DBus)?;

        match tube.local_address() {
            Some(SocketAddress::Unix(path)) => Ok(DBusAddress(path.clone())),
            _ => Err(TubeError::InvalidState {
                id: request.id,
                state: tube.state(),
                expected: "an offered or accepted tube",
            }),
        }
    }

    fn dbus_names(&self, request: TubeRequest) -> Result<Vec<(Handle, BusName)>, TubeError> {
        let tube = find_tube(&self.channels, request.container, request.id)?;
        tube.require_kind(TubeKind::DBus)?;

        Ok(tube.bus_names())
    }

    fn close_tube(&mut self, request: TubeRequest) -> Result<(), TubeError> {
        let _tube = find_tube(&self.channels, request.container, request.id)?;

        self.close_and_reap(request.container, request.id, false);

        Ok(())
    }

    pub(crate) fn close_and_reap(&mut self, container: Container, id: TubeId, remotely: bool) {
        if let Ok(tube) = find_tube_mut(&mut self.channels, container, id) {
            let _closed = tube.close(&mut self.ctx, remotely);
        }

        self.reap(container.handle);
    }

    fn list_tubes(&self, container: Container) -> Vec<TubeInfo> {
        self.channels
            .get(&container.handle)
            .map(|channel| channel.infos())
            .unwrap_or_default()
    }

    fn close_channel(&mut self, container: Container) -> Result<(), TubeError> {
        let mut channel = self
            .channels
            .remove(&container.handle)
            .ok_or(TubeError::UnknownChannel(container))?;

        for tube in channel.tubes.values() {
            self.negotiator.forget(tube.tube_ref());
        }

        channel.close(&mut self.ctx, &TubeError::ChannelClosed);

        info!(%container, "Closed tubes channel");

        Ok(())
    }
}

/// A Unix service socket must exist before it can be offered.
fn check_service(address: &SocketAddress) -> Result<(), TubeError> {
    match address {
        SocketAddress::Unix(path) => {
            if !path.exists() {
                return Err(TubeError::SocketSetup(format!("{path} does not exist")));
            }
            Ok(())
        }
        SocketAddress::Inet(addr) => {
            if addr.port() == 0 {
                return Err(TubeError::InvalidArgument(format!("{addr} has no port")));
            }
            Ok(())
        }
    }
}

fn find_tube<'a>(
    channels: &'a BTreeMap<Handle, TubesChannel>,
    container: Container,
    id: TubeId,
) -> Result<&'a Tube, TubeError> {
    channels
        .get(&container.handle)
        .ok_or(TubeError::UnknownChannel(container))?
        .tube(id)
}

pub(crate) fn find_tube_mut<'a>(
    channels: &'a mut BTreeMap<Handle, TubesChannel>,
    container: Container,
    id: TubeId,
) -> Result<&'a mut Tube, TubeError> {
    channels
        .get_mut(&container.handle)
        .ok_or(TubeError::UnknownChannel(container))?
        .tube_mut(id)
}
