mod common;

use common::{dbus_message, read_dbus_message, Participant, TIMEOUT};
use lanlink_tubes::loopback::LoopbackNetwork;
use lanlink_tubes::primitives::dbus::BusName;
use lanlink_tubes::primitives::handle::HandleRepository;
use lanlink_tubes::primitives::tube::{Parameters, TubeId, TubeKind, TubeState};
use lanlink_tubes::tubes_primitives::events::TubesEvent;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::task::{spawn, yield_now};
use tokio::time::timeout;

async fn names_added(participant: &mut Participant, id: TubeId) -> Vec<(String, BusName)> {
    let added = participant
        .wait_for(|event| match event {
            TubesEvent::DBusNamesChanged {
                id: changed, added, ..
            } if *changed == id && !added.is_empty() => Some(added.clone()),
            _ => None,
        })
        .await;

    added
        .into_iter()
        .map(|(handle, name)| {
            let member = participant.handles.lookup(handle).unwrap();
            (member, name)
        })
        .collect()
}

#[tokio::test]
async fn test_room_bus_names_follow_membership() {
    let network = LoopbackNetwork::new();
    let mut alice = Participant::join(&network, "alice");
    let mut bob = Participant::join(&network, "bob");
    let _carol = Participant::join(&network, "carol");

    for name in ["alice", "bob", "carol"] {
        network.join("lobby", name);
    }

    let id = alice
        .client
        .offer_dbus_tube(alice.room("lobby"), "test", Parameters::new())
        .await
        .unwrap();

    let info = bob
        .wait_for(|event| match event {
            TubesEvent::NewTube { info, .. } => Some(info.clone()),
            _ => None,
        })
        .await;
    assert_eq!(info.id, id);
    assert_eq!(info.kind, TubeKind::DBus);
    assert_eq!(info.service, "test");
    assert_eq!(info.state, TubeState::LocalPending);
    assert_eq!(info.initiator, bob.handle("alice"));

    assert_eq!(
        names_added(&mut bob, id).await,
        vec![("alice".to_owned(), BusName::unique_for("alice"))]
    );

    let _address = bob.client.accept_dbus_tube(bob.room("lobby"), id).await.unwrap();

    assert_eq!(
        names_added(&mut alice, id).await,
        vec![("alice".to_owned(), BusName::unique_for("alice"))]
    );
    assert_eq!(
        names_added(&mut alice, id).await,
        vec![("bob".to_owned(), BusName::unique_for("bob"))]
    );

    let mut names = bob.client.get_dbus_names(bob.room("lobby"), id).await.unwrap();
    names.sort();
    let mut expected = vec![
        (bob.handle("alice"), BusName::unique_for("alice")),
        (bob.handle("bob"), BusName::unique_for("bob")),
    ];
    expected.sort();
    assert_eq!(names, expected);

    network.leave("lobby", "alice");

    let removed = bob
        .wait_for(|event| match event {
            TubesEvent::DBusNamesChanged { removed, .. } if !removed.is_empty() => {
                Some(removed.clone())
            }
            _ => None,
        })
        .await;
    assert_eq!(removed, vec![bob.handle("alice")]);

    let closed = bob
        .wait_for(|event| match event {
            TubesEvent::TubeClosed { id, .. } => Some(*id),
            _ => None,
        })
        .await;
    assert_eq!(closed, id);
}

#[tokio::test]
async fn test_room_bus_carries_bytes() {
    let network = LoopbackNetwork::new();
    let alice = Participant::join(&network, "alice");
    let mut bob = Participant::join(&network, "bob");

    network.join("lobby", "alice");
    network.join("lobby", "bob");

    let id = alice
        .client
        .offer_dbus_tube(alice.room("lobby"), "test", Parameters::new())
        .await
        .unwrap();

    let _ = bob
        .wait_for(|event| match event {
            TubesEvent::NewTube { info, .. } if info.id == id => Some(()),
            _ => None,
        })
        .await;

    let bob_bus = bob.client.accept_dbus_tube(bob.room("lobby"), id).await.unwrap();
    let alice_bus = alice
        .client
        .get_dbus_tube_address(alice.room("lobby"), id)
        .await
        .unwrap();

    assert!(bob_bus.to_address_string().starts_with("unix:path="));

    let mut alice_client = UnixStream::connect(&alice_bus.0).await.unwrap();
    let mut bob_client = UnixStream::connect(&bob_bus.0).await.unwrap();

    let signal = dbus_message(1, b's', 6);
    alice_client.write_all(&signal).await.unwrap();
    assert_eq!(read_dbus_message(&mut bob_client).await, signal);

    let call = dbus_message(1, b'm', 6);
    bob_client.write_all(&call).await.unwrap();
    assert_eq!(read_dbus_message(&mut alice_client).await, call);
}

/// Writes `count` messages, each in two pieces so they cross the bus as
/// separate chunks.
async fn send_messages(mut client: UnixStream, fill: u8, count: u32) -> UnixStream {
    for serial in 1..=count {
        let message = dbus_message(serial, fill, 10_000);
        let (head, tail) = message.split_at(5_000);

        client.write_all(head).await.unwrap();
        yield_now().await;
        client.write_all(tail).await.unwrap();
    }

    client
}

#[tokio::test]
async fn test_room_bus_keeps_concurrent_messages_whole() {
    let network = LoopbackNetwork::new();
    let alice = Participant::join(&network, "alice");
    let mut bob = Participant::join(&network, "bob");
    let mut carol = Participant::join(&network, "carol");

    for name in ["alice", "bob", "carol"] {
        network.join("lobby", name);
    }

    let id = alice
        .client
        .offer_dbus_tube(alice.room("lobby"), "test", Parameters::new())
        .await
        .unwrap();

    for member in [&mut bob, &mut carol] {
        let _ = member
            .wait_for(|event| match event {
                TubesEvent::NewTube { info, .. } if info.id == id => Some(()),
                _ => None,
            })
            .await;
    }

    let bob_bus = bob.client.accept_dbus_tube(bob.room("lobby"), id).await.unwrap();
    let carol_bus = carol.client.accept_dbus_tube(carol.room("lobby"), id).await.unwrap();
    let alice_bus = alice
        .client
        .get_dbus_tube_address(alice.room("lobby"), id)
        .await
        .unwrap();

    let alice_client = UnixStream::connect(&alice_bus.0).await.unwrap();
    let bob_client = UnixStream::connect(&bob_bus.0).await.unwrap();
    let mut carol_client = UnixStream::connect(&carol_bus.0).await.unwrap();

    let from_alice = spawn(send_messages(alice_client, b'a', 20));
    let from_bob = spawn(send_messages(bob_client, b'b', 20));

    let mut serials = [0_u32; 2];
    for _ in 0..40 {
        let message = read_dbus_message(&mut carol_client).await;
        let body = &message[16..];

        assert_eq!(body.len(), 10_000);
        let fill = body[0];
        assert!(body.iter().all(|byte| *byte == fill), "bodies were interleaved");

        let sender = match fill {
            b'a' => 0,
            b'b' => 1,
            other => panic!("unexpected fill {other}"),
        };
        let serial = u32::from_le_bytes(message[8..12].try_into().unwrap());
        assert_eq!(serial, serials[sender] + 1, "messages from one sender arrive in order");
        serials[sender] = serial;
    }

    assert_eq!(serials, [20, 20]);

    let _alice_client = from_alice.await.unwrap();
    let _bob_client = from_bob.await.unwrap();
}

#[tokio::test]
async fn test_contact_bus_round_trip() {
    let network = LoopbackNetwork::new();
    let mut alice = Participant::join(&network, "alice");
    let mut bob = Participant::join(&network, "bob");

    let id = alice
        .client
        .offer_dbus_tube(alice.contact("bob"), "test", Parameters::new())
        .await
        .unwrap();

    let container = bob
        .wait_for(|event| match event {
            TubesEvent::NewTube { container, info } if info.id == id => Some(*container),
            _ => None,
        })
        .await;

    let bob_bus = bob.client.accept_dbus_tube(container, id).await.unwrap();

    let _ = alice
        .wait_for(|event| match event {
            TubesEvent::TubeStateChanged {
                id: changed,
                state: TubeState::Open,
                ..
            } if *changed == id => Some(()),
            _ => None,
        })
        .await;

    let alice_bus = alice
        .client
        .get_dbus_tube_address(alice.contact("bob"), id)
        .await
        .unwrap();

    let mut alice_client = UnixStream::connect(&alice_bus.0).await.unwrap();
    let mut bob_client = UnixStream::connect(&bob_bus.0).await.unwrap();

    bob_client.write_all(b"hello").await.unwrap();

    let mut buf = [0; 5];
    timeout(TIMEOUT, alice_client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello");

    let tubes = alice.client.list_tubes(alice.contact("bob")).await.unwrap();
    assert_eq!(tubes.len(), 1);
    assert_eq!(tubes[0].kind, TubeKind::DBus);
    assert_eq!(tubes[0].state, TubeState::Open);
}
