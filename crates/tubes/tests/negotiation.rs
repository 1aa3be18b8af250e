//! A hand-driven peer poking at a manager's negotiation handling.

mod common;

use bytes::Bytes;
use common::{Participant, TIMEOUT};
use lanlink_tubes::loopback::{LoopbackNetwork, LoopbackPeer};
use lanlink_tubes::primitives::bytestream::{BytestreamMethod, StreamId};
use lanlink_tubes::primitives::handle::HandleRepository;
use lanlink_tubes::primitives::socket::{AccessControl, AddressKind, SocketAddress};
use lanlink_tubes::primitives::tube::{Parameters, TubeId, TubeKind, TubeState};
use lanlink_tubes::tubes_primitives::error::NegotiationError;
use lanlink_tubes::tubes_primitives::events::TubesEvent;
use lanlink_tubes::tubes_primitives::session::{Session, SessionEvent};
use lanlink_tubes::tubes_primitives::wire::{
    DataFrame, NegotiationReply, NegotiationRequest, RequestId, Stanza, TubeOffer,
    TUBE_CONNECTION_PROFILE, TUBE_PROFILE,
};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::time::timeout;

struct Mallory {
    peer: LoopbackPeer,
}

impl Mallory {
    fn connect(network: &LoopbackNetwork) -> Self {
        Self {
            peer: network.connect("mallory"),
        }
    }

    fn send(&self, stanza: Stanza) {
        let alice = self.peer.handles.ensure("alice");
        self.peer.session.send(alice, stanza).unwrap();
    }

    fn request(&self, id: u64, body: NegotiationRequest) {
        self.send(Stanza::Request {
            id: RequestId::new(id),
            body,
        });
    }

    async fn reply(&mut self) -> (RequestId, NegotiationReply) {
        timeout(TIMEOUT, async {
            loop {
                match self.peer.events.recv().await {
                    Some(SessionEvent::Stanza {
                        stanza: Stanza::Reply { id, body },
                        ..
                    }) => return (id, body),
                    Some(_) => {}
                    None => panic!("network went away"),
                }
            }
        })
        .await
        .expect("no reply from alice")
    }
}

fn oob() -> Vec<String> {
    vec![BytestreamMethod::OutOfBand.as_str().to_owned()]
}

fn offer(tube: u32, stream: u32) -> NegotiationRequest {
    NegotiationRequest {
        profile: Some(TUBE_PROFILE.to_owned()),
        stream_id: Some(StreamId::from(stream)),
        methods: oob(),
        tube: Some(TubeOffer {
            id: TubeId::try_from(tube).unwrap(),
            kind: TubeKind::Stream,
            service: "x-chat".to_owned(),
            parameters: Parameters::new(),
        }),
        ..NegotiationRequest::default()
    }
}

#[tokio::test]
async fn test_malformed_requests_are_answered() {
    let network = LoopbackNetwork::new();
    let alice = Participant::join(&network, "alice");
    let mut mallory = Mallory::connect(&network);

    mallory.request(1, NegotiationRequest::default());
    assert_eq!(
        mallory.reply().await,
        (
            RequestId::new(1),
            NegotiationReply::Error(NegotiationError::BadRequest)
        )
    );

    mallory.request(
        2,
        NegotiationRequest {
            profile: Some("urn:example:unknown".to_owned()),
            stream_id: Some(StreamId::from(1_u32)),
            methods: oob(),
            ..NegotiationRequest::default()
        },
    );
    assert_eq!(
        mallory.reply().await.1,
        NegotiationReply::Error(NegotiationError::BadRequest)
    );

    mallory.request(
        3,
        NegotiationRequest {
            methods: vec!["urn:example:smoke-signals".to_owned()],
            ..offer(5, 1)
        },
    );
    assert_eq!(
        mallory.reply().await.1,
        NegotiationReply::Error(NegotiationError::NoValidStreams)
    );

    mallory.request(
        4,
        NegotiationRequest {
            methods: Vec::new(),
            ..offer(5, 1)
        },
    );
    assert_eq!(
        mallory.reply().await.1,
        NegotiationReply::Error(NegotiationError::BadRequest)
    );

    mallory.request(
        5,
        NegotiationRequest {
            profile: Some(TUBE_CONNECTION_PROFILE.to_owned()),
            stream_id: Some(StreamId::from(2_u32)),
            methods: oob(),
            tube_id: Some(TubeId::try_from(999_u32).unwrap()),
            ..NegotiationRequest::default()
        },
    );
    assert_eq!(
        mallory.reply().await.1,
        NegotiationReply::Error(NegotiationError::BadRequest)
    );

    // nothing above created a tube
    let tubes = alice
        .client
        .list_tubes(alice.contact("mallory"))
        .await
        .unwrap();
    assert!(tubes.is_empty());
}

#[tokio::test]
async fn test_offer_negotiates_out_of_band_stream() {
    let network = LoopbackNetwork::new();
    let mut alice = Participant::join(&network, "alice");
    let mut mallory = Mallory::connect(&network);

    mallory.request(10, offer(42, 7));

    let (container, info) = alice
        .wait_for(|event| match event {
            TubesEvent::NewTube { container, info } => Some((*container, info.clone())),
            _ => None,
        })
        .await;
    assert_eq!(info.state, TubeState::LocalPending);
    assert_eq!(info.service, "x-chat");

    let address = alice
        .client
        .accept_stream_tube(container, info.id, AddressKind::Unix, AccessControl::Localhost)
        .await
        .unwrap();

    assert_eq!(
        mallory.reply().await,
        (
            RequestId::new(10),
            NegotiationReply::Accept {
                method: Some(BytestreamMethod::OutOfBand.as_str().to_owned()),
            }
        )
    );

    // data sent before anyone connects locally is kept for the first client
    mallory.send(Stanza::Data(DataFrame {
        stream_id: StreamId::from(7_u32),
        initiator: "mallory".to_owned(),
        payload: Bytes::from_static(b"early "),
    }));
    // frames for streams alice does not have are dropped
    mallory.send(Stanza::Data(DataFrame {
        stream_id: StreamId::from(8_u32),
        initiator: "mallory".to_owned(),
        payload: Bytes::from_static(b"lost"),
    }));
    mallory.send(Stanza::Data(DataFrame {
        stream_id: StreamId::from(7_u32),
        initiator: "mallory".to_owned(),
        payload: Bytes::from_static(b"bird"),
    }));

    let SocketAddress::Unix(path) = address else {
        panic!("expected a unix address");
    };
    let mut client = UnixStream::connect(&path).await.unwrap();

    let mut buf = [0; 10];
    timeout(TIMEOUT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"early bird");
}

#[tokio::test]
async fn test_only_the_initiator_multiplexes() {
    let network = LoopbackNetwork::new();
    let mut alice = Participant::join(&network, "alice");
    let mut mallory = Mallory::connect(&network);

    mallory.request(20, offer(42, 7));

    let container = alice
        .wait_for(|event| match event {
            TubesEvent::NewTube { container, .. } => Some(*container),
            _ => None,
        })
        .await;
    let id = TubeId::try_from(42_u32).unwrap();

    let _address = alice
        .client
        .accept_stream_tube(container, id, AddressKind::Unix, AccessControl::Localhost)
        .await
        .unwrap();
    let _accept = mallory.reply().await;

    // mallory offered this tube, so alice may not be asked to connect more
    // streams to it
    mallory.request(
        21,
        NegotiationRequest {
            profile: Some(TUBE_CONNECTION_PROFILE.to_owned()),
            stream_id: Some(StreamId::from(8_u32)),
            methods: oob(),
            tube_id: Some(id),
            ..NegotiationRequest::default()
        },
    );
    assert_eq!(
        mallory.reply().await,
        (
            RequestId::new(21),
            NegotiationReply::Error(NegotiationError::Forbidden)
        )
    );

    // an offer reusing a live id is refused
    mallory.request(22, offer(42, 9));
    assert_eq!(
        mallory.reply().await.1,
        NegotiationReply::Error(NegotiationError::BadRequest)
    );

    let tubes = alice.client.list_tubes(container).await.unwrap();
    assert_eq!(tubes.len(), 1);
    assert_eq!(tubes[0].state, TubeState::Open);
}
