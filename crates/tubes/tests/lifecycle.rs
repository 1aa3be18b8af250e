mod common;

use core::time::Duration;

use common::{Participant, TIMEOUT};
use lanlink_tubes::loopback::LoopbackNetwork;
use lanlink_tubes::primitives::socket::{AccessControl, AddressKind, SocketAddress};
use lanlink_tubes::primitives::tube::{Parameters, TubeId, TubeKind, TubeState};
use lanlink_tubes::tubes_primitives::error::TubeError;
use lanlink_tubes::tubes_primitives::events::TubesEvent;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::{sleep, timeout};

async fn wait_until_listed(participant: &Participant, room: &str) {
    timeout(TIMEOUT, async {
        while participant
            .client
            .list_tubes(participant.room(room))
            .await
            .unwrap()
            .is_empty()
        {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_list_tracks_every_tube() {
    let network = LoopbackNetwork::new();
    let mut alice = Participant::join(&network, "alice");
    let mut bob = Participant::join(&network, "bob");

    let service_path = alice.path("service.sock");
    let _service = UnixListener::bind(&service_path).unwrap();
    let to_bob = alice.contact("bob");

    let mut ids = Vec::new();
    for service in ["one", "two", "three"] {
        ids.push(
            alice
                .client
                .create_stream_tube(to_bob, service, Parameters::new())
                .await
                .unwrap(),
        );
    }

    for id in &ids[1..] {
        alice
            .client
            .offer_stream_tube(
                to_bob,
                *id,
                SocketAddress::Unix(service_path.clone()),
                AccessControl::Localhost,
            )
            .await
            .unwrap();
    }

    let offered = bob
        .wait_for(|event| match event {
            TubesEvent::NewTube { info, .. } if info.id == ids[2] => Some(info.id),
            _ => None,
        })
        .await;
    let _address = bob
        .client
        .accept_stream_tube(bob.contact("alice"), offered, AddressKind::Unix, AccessControl::Localhost)
        .await
        .unwrap();

    let _ = alice
        .wait_for(|event| match event {
            TubesEvent::TubeStateChanged {
                id,
                state: TubeState::Open,
                ..
            } if *id == ids[2] => Some(()),
            _ => None,
        })
        .await;

    let tubes = alice.client.list_tubes(to_bob).await.unwrap();
    assert_eq!(tubes.len(), 3);

    let state_of = |id: TubeId| tubes.iter().find(|info| info.id == id).map(|info| info.state);
    assert_eq!(state_of(ids[0]), Some(TubeState::NotOffered));
    assert_eq!(state_of(ids[1]), Some(TubeState::RemotePending));
    assert_eq!(state_of(ids[2]), Some(TubeState::Open));
    assert!(tubes.iter().all(|info| info.kind == TubeKind::Stream));

    let bob_view = bob.client.list_tubes(bob.contact("alice")).await.unwrap();
    assert_eq!(bob_view.len(), 2);
}

#[tokio::test]
async fn test_room_offer_waits_for_join() {
    let network = LoopbackNetwork::new();
    let alice = Participant::join(&network, "alice");

    let client = alice.client.clone();
    let room = alice.room("lobby");
    let offer = tokio::spawn(async move {
        client.offer_dbus_tube(room, "test", Parameters::new()).await
    });

    wait_until_listed(&alice, "lobby").await;

    let tubes = alice.client.list_tubes(room).await.unwrap();
    assert_eq!(tubes[0].state, TubeState::NotOffered);
    assert!(!offer.is_finished());

    network.join("lobby", "alice");

    let id = timeout(TIMEOUT, offer).await.unwrap().unwrap().unwrap();

    let tubes = alice.client.list_tubes(room).await.unwrap();
    assert_eq!(tubes.len(), 1);
    assert_eq!(tubes[0].id, id);
    assert_eq!(tubes[0].state, TubeState::Open);
}

#[tokio::test]
async fn test_room_offer_fails_with_the_join() {
    let network = LoopbackNetwork::new();
    let alice = Participant::join(&network, "alice");

    let client = alice.client.clone();
    let room = alice.room("lobby");
    let offer = tokio::spawn(async move {
        client.offer_dbus_tube(room, "test", Parameters::new()).await
    });

    wait_until_listed(&alice, "lobby").await;

    network.refuse_join("lobby", "alice");

    let err = timeout(TIMEOUT, offer).await.unwrap().unwrap().unwrap_err();
    assert_eq!(err.downcast_ref::<TubeError>(), Some(&TubeError::ChannelClosed));
    assert!(alice.client.list_tubes(room).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_full_session_stops_reading() {
    let network = LoopbackNetwork::new();
    let mut alice = Participant::join(&network, "alice");
    let mut bob = Participant::join(&network, "bob");

    let service_path = alice.path("service.sock");
    let service = UnixListener::bind(&service_path).unwrap();
    let to_bob = alice.contact("bob");

    let id = alice
        .client
        .create_stream_tube(to_bob, "bulk", Parameters::new())
        .await
        .unwrap();
    alice
        .client
        .offer_stream_tube(to_bob, id, SocketAddress::Unix(service_path), AccessControl::Localhost)
        .await
        .unwrap();

    let container = bob
        .wait_for(|event| match event {
            TubesEvent::NewTube { container, .. } => Some(*container),
            _ => None,
        })
        .await;
    let address = bob
        .client
        .accept_stream_tube(container, id, AddressKind::Unix, AccessControl::Localhost)
        .await
        .unwrap();

    let (mut upstream, _) = timeout(TIMEOUT, service.accept()).await.unwrap().unwrap();

    let SocketAddress::Unix(path) = address else {
        panic!("expected a unix address");
    };
    let mut downstream = UnixStream::connect(&path).await.unwrap();

    network.choke("bob", "alice");

    let payload: Vec<u8> = (0..64 * 1024_u32).map(|i| (i % 253) as u8).collect();
    let writer = {
        let payload = payload.clone();
        tokio::spawn(async move {
            downstream.write_all(&payload).await.unwrap();
            downstream
        })
    };

    let mut peek = [0; 1];
    assert!(
        timeout(Duration::from_millis(200), upstream.read(&mut peek))
            .await
            .is_err(),
        "data crossed a full session"
    );

    network.unchoke("bob", "alice");

    let mut received = vec![0; payload.len()];
    timeout(TIMEOUT, upstream.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, payload);

    let _downstream = writer.await.unwrap();
}

#[tokio::test]
async fn test_disconnect_closes_all_tubes() {
    let network = LoopbackNetwork::new();
    let mut alice = Participant::join(&network, "alice");
    let _bob = Participant::join(&network, "bob");

    let id = alice
        .client
        .create_stream_tube(alice.contact("bob"), "test", Parameters::new())
        .await
        .unwrap();

    network.disconnect("alice");

    let closed = alice
        .wait_for(|event| match event {
            TubesEvent::TubeClosed { id, .. } => Some(*id),
            _ => None,
        })
        .await;
    assert_eq!(closed, id);

    let err = alice
        .client
        .create_stream_tube(alice.contact("bob"), "test", Parameters::new())
        .await
        .unwrap_err();
    assert_eq!(err.downcast_ref::<TubeError>(), Some(&TubeError::Disconnected));
}

#[tokio::test]
async fn test_close_channel_closes_its_tubes() {
    let network = LoopbackNetwork::new();
    let mut alice = Participant::join(&network, "alice");
    let mut bob = Participant::join(&network, "bob");

    let service_path = alice.path("service.sock");
    let _service = UnixListener::bind(&service_path).unwrap();
    let to_bob = alice.contact("bob");

    let id = alice
        .client
        .create_stream_tube(to_bob, "test", Parameters::new())
        .await
        .unwrap();
    alice
        .client
        .offer_stream_tube(to_bob, id, SocketAddress::Unix(service_path), AccessControl::Localhost)
        .await
        .unwrap();

    let _ = bob
        .wait_for(|event| match event {
            TubesEvent::NewTube { .. } => Some(()),
            _ => None,
        })
        .await;

    alice.client.close_channel(to_bob).await.unwrap();

    let closed = alice
        .wait_for(|event| match event {
            TubesEvent::TubeClosed { id, .. } => Some(*id),
            _ => None,
        })
        .await;
    assert_eq!(closed, id);

    // the offer was outstanding, so bob hears about it
    let closed = bob
        .wait_for(|event| match event {
            TubesEvent::TubeClosed { id, .. } => Some(*id),
            _ => None,
        })
        .await;
    assert_eq!(closed, id);

    assert!(alice.client.list_tubes(to_bob).await.unwrap().is_empty());
    assert!(alice.client.close_channel(to_bob).await.is_err());
}
