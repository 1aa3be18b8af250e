use camino::Utf8PathBuf;
use lanlink_primitives::handle::Container;
use lanlink_primitives::socket::{AccessControl, AddressKind, SocketAddress};
use lanlink_primitives::tube::{Parameters, TubeId};

#[derive(Clone, Debug)]
pub struct CreateStreamTube {
    pub container: Container,
    pub service: String,
    pub parameters: Parameters,
}

#[derive(Clone, Debug)]
pub struct OfferStreamTube {
    pub container: Container,
    pub id: TubeId,
    pub address_kind: AddressKind,
    pub address: SocketAddress,
    pub access_control: AccessControl,
}

#[derive(Clone, Copy, Debug)]
pub struct AcceptStreamTube {
    pub container: Container,
    pub id: TubeId,
    pub address_kind: AddressKind,
    pub access_control: AccessControl,
}

#[derive(Clone, Debug)]
pub struct OfferDBusTube {
    pub container: Container,
    pub service: String,
    pub parameters: Parameters,
}

#[derive(Clone, Copy, Debug)]
pub struct TubeRequest {
    pub container: Container,
    pub id: TubeId,
}

impl From<(Container, TubeId)> for TubeRequest {
    fn from((container, id): (Container, TubeId)) -> Self {
        Self { container, id }
    }
}

/// Bus address handed to local D-Bus clients, e.g. `unix:path=/tmp/x`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DBusAddress(pub Utf8PathBuf);

impl DBusAddress {
    #[must_use]
    pub fn to_address_string(&self) -> String {
        format!("unix:path={}", self.0)
    }
}
