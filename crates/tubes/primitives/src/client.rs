use eyre::{eyre, Result as EyreResult};
use lanlink_primitives::dbus::BusName;
use lanlink_primitives::handle::{Container, Handle};
use lanlink_primitives::socket::{AccessControl, AddressKind, SocketAddress};
use lanlink_primitives::tube::{Parameters, TubeId, TubeInfo};
use tokio::sync::{mpsc, oneshot};

use crate::messages::{
    AcceptStreamTube, CreateStreamTube, DBusAddress, OfferDBusTube, OfferStreamTube, TubeRequest,
};

#[derive(Debug)]
pub enum TubesMessage {
    CreateStreamTube {
        request: CreateStreamTube,
        outcome: oneshot::Sender<EyreResult<TubeId>>,
    },
    OfferStreamTube {
        request: OfferStreamTube,
        outcome: oneshot::Sender<EyreResult<()>>,
    },
    AcceptStreamTube {
        request: AcceptStreamTube,
        outcome: oneshot::Sender<EyreResult<SocketAddress>>,
    },
    GetStreamTubeSocketAddress {
        request: TubeRequest,
        outcome: oneshot::Sender<EyreResult<SocketAddress>>,
    },
    OfferDBusTube {
        request: OfferDBusTube,
        outcome: oneshot::Sender<EyreResult<TubeId>>,
    },
    AcceptDBusTube {
        request: TubeRequest,
        outcome: oneshot::Sender<EyreResult<DBusAddress>>,
    },
    GetDBusTubeAddress {
        request: TubeRequest,
        outcome: oneshot::Sender<EyreResult<DBusAddress>>,
    },
    GetDBusNames {
        request: TubeRequest,
        outcome: oneshot::Sender<EyreResult<Vec<(Handle, BusName)>>>,
    },
    CloseTube {
        request: TubeRequest,
        outcome: oneshot::Sender<EyreResult<()>>,
    },
    ListTubes {
        container: Container,
        outcome: oneshot::Sender<Vec<TubeInfo>>,
    },
    CloseChannel {
        container: Container,
        outcome: oneshot::Sender<EyreResult<()>>,
    },
}

/// Handle for issuing tube operations to a running tubes manager.
///
/// Failures carry a [`crate::error::TubeError`] where the manager refused
/// the operation.
#[derive(Clone, Debug)]
pub struct TubesClient {
    sender: mpsc::Sender<TubesMessage>,
}

impl TubesClient {
    #[must_use]
    pub const fn new(sender: mpsc::Sender<TubesMessage>) -> Self {
        Self { sender }
    }

    async fn call<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> TubesMessage,
    ) -> EyreResult<T> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(message(tx))
            .await
            .map_err(|_| eyre!("tubes manager has shut down"))?;

        rx.await
            .map_err(|_| eyre!("tubes manager dropped the request"))
    }

    pub async fn create_stream_tube(
        &self,
        container: Container,
        service: impl Into<String>,
        parameters: Parameters,
    ) -> EyreResult<TubeId> {
        let request = CreateStreamTube {
            container,
            service: service.into(),
            parameters,
        };

        self.call(|outcome| TubesMessage::CreateStreamTube { request, outcome })
            .await?
    }

    pub async fn offer_stream_tube(
        &self,
        container: Container,
        id: TubeId,
        address: SocketAddress,
        access_control: AccessControl,
    ) -> EyreResult<()> {
        let request = OfferStreamTube {
            container,
            id,
            address_kind: address.kind(),
            address,
            access_control,
        };

        self.call(|outcome| TubesMessage::OfferStreamTube { request, outcome })
            .await?
    }

    pub async fn accept_stream_tube(
        &self,
        container: Container,
        id: TubeId,
        address_kind: AddressKind,
        access_control: AccessControl,
    ) -> EyreResult<SocketAddress> {
        let request = AcceptStreamTube {
            container,
            id,
            address_kind,
            access_control,
        };

        self.call(|outcome| TubesMessage::AcceptStreamTube { request, outcome })
            .await?
    }

    pub async fn get_stream_tube_socket_address(
        &self,
        container: Container,
        id: TubeId,
    ) -> EyreResult<SocketAddress> {
        let request = TubeRequest::from((container, id));

        self.call(|outcome| TubesMessage::GetStreamTubeSocketAddress { request, outcome })
            .await?
    }

    pub async fn offer_dbus_tube(
        &self,
        container: Container,
        service: impl Into<String>,
        parameters: Parameters,
    ) -> EyreResult<TubeId> {
        let request = OfferDBusTube {
            container,
            service: service.into(),
            parameters,
        };

        self.call(|outcome| TubesMessage::OfferDBusTube { request, outcome })
            .await?
    }

    pub async fn accept_dbus_tube(
        &self,
        container: Container,
        id: TubeId,
    ) -> EyreResult<DBusAddress> {
        let request = TubeRequest::from((container, id));

        self.call(|outcome| TubesMessage::AcceptDBusTube { request, outcome })
            .await?
    }

    pub async fn get_dbus_tube_address(
        &self,
        container: Container,
        id: TubeId,
    ) -> EyreResult<DBusAddress> {
        let request = TubeRequest::from((container, id));

        self.call(|outcome| TubesMessage::GetDBusTubeAddress { request, outcome })
            .await?
    }

    pub async fn get_dbus_names(
        &self,
        container: Container,
        id: TubeId,
    ) -> EyreResult<Vec<(Handle, BusName)>> {
        let request = TubeRequest::from((container, id));

        self.call(|outcome| TubesMessage::GetDBusNames { request, outcome })
            .await?
    }

    pub async fn close_tube(&self, container: Container, id: TubeId) -> EyreResult<()> {
        let request = TubeRequest::from((container, id));

        self.call(|outcome| TubesMessage::CloseTube { request, outcome })
            .await?
    }

    pub async fn list_tubes(&self, container: Container) -> EyreResult<Vec<TubeInfo>> {
        self.call(|outcome| TubesMessage::ListTubes { container, outcome })
            .await
    }

    pub async fn close_channel(&self, container: Container) -> EyreResult<()> {
        self.call(|outcome| TubesMessage::CloseChannel { container, outcome })
            .await?
    }
}
