use lanlink_primitives::handle::{Container, HandleRepository};
use lanlink_primitives::tube::{Parameters, TubeKind};

use super::*;
use crate::mocks::Harness;

const OOB: &str = "urn:lanlink:bytestreams:oob";
const DIRECT: &str = "urn:lanlink:bytestreams:direct";

fn offer_request() -> NegotiationRequest {
    NegotiationRequest {
        profile: Some(TUBE_PROFILE.to_owned()),
        stream_id: Some(StreamId::from(1_u32)),
        methods: vec![OOB.to_owned()],
        tube: Some(TubeOffer {
            id: TubeId::try_from(4_u32).unwrap(),
            kind: TubeKind::DBus,
            service: "test".to_owned(),
            parameters: Parameters::new(),
        }),
        ..NegotiationRequest::default()
    }
}

#[test]
fn test_valid_offer() {
    let validated = validate(&offer_request()).unwrap();

    let Validated::Offer {
        stream_id, method, ..
    } = validated
    else {
        panic!("expected an offer, got {validated:?}");
    };
    assert_eq!(stream_id, StreamId::from(1_u32));
    assert_eq!(method, BytestreamMethod::OutOfBand);
}

#[test]
fn test_missing_fields_are_bad_requests() {
    let cases = [
        NegotiationRequest {
            profile: None,
            ..offer_request()
        },
        NegotiationRequest {
            stream_id: None,
            ..offer_request()
        },
        NegotiationRequest {
            tube: None,
            ..offer_request()
        },
        NegotiationRequest {
            methods: Vec::new(),
            ..offer_request()
        },
        NegotiationRequest {
            profile: Some("urn:lanlink:si:file-transfer".to_owned()),
            ..offer_request()
        },
        NegotiationRequest {
            profile: Some(TUBE_CONNECTION_PROFILE.to_owned()),
            tube_id: None,
            ..offer_request()
        },
        NegotiationRequest {
            profile: Some(ROOM_STREAM_PROFILE.to_owned()),
            tube_id: Some(TubeId::try_from(4_u32).unwrap()),
            container: None,
            ..offer_request()
        },
    ];

    for request in cases {
        assert_eq!(
            validate(&request),
            Err(NegotiationError::BadRequest),
            "{request:?}"
        );
    }
}

#[test]
fn test_no_supported_method() {
    let request = NegotiationRequest {
        methods: vec![DIRECT.to_owned(), "urn:other:ibb".to_owned()],
        ..offer_request()
    };

    assert_eq!(validate(&request), Err(NegotiationError::NoValidStreams));
}

#[test]
fn test_method_selection_skips_unknown_names() {
    let offered = vec![
        "urn:other:ibb".to_owned(),
        DIRECT.to_owned(),
        OOB.to_owned(),
    ];

    assert_eq!(select_method(&offered), Some(BytestreamMethod::OutOfBand));
    assert_eq!(select_method(&[]), None);
}

#[test]
fn test_room_connection_needs_no_methods() {
    let request = NegotiationRequest {
        profile: Some(ROOM_STREAM_PROFILE.to_owned()),
        stream_id: Some(StreamId::from(2_u32)),
        tube_id: Some(TubeId::try_from(4_u32).unwrap()),
        container: Some("lobby".to_owned()),
        ..NegotiationRequest::default()
    };

    assert_eq!(
        validate(&request),
        Ok(Validated::RoomConnection {
            stream_id: StreamId::from(2_u32),
            room: "lobby".to_owned(),
            tube_id: TubeId::try_from(4_u32).unwrap(),
        })
    );
}

fn offered_tube(h: &mut Harness) -> Tube {
    let peer = h.peer();
    Tube::local(
        &mut h.ctx,
        Container::contact(peer),
        TubeId::try_from(4_u32).unwrap(),
        TubeKind::DBus,
        "test".to_owned(),
        Parameters::new(),
    )
}

#[test]
fn test_offer_is_sent_and_remembered() {
    let mut h = Harness::new();
    let tube = offered_tube(&mut h);
    let mut negotiator = Negotiator::default();

    negotiator.offer(&h.ctx, &tube).unwrap();

    let sent = h.session.take_sent();
    let [(to, Stanza::Request { id, body })] = sent.as_slice() else {
        panic!("unexpected stanzas {sent:?}");
    };

    assert_eq!(*to, h.peer());
    assert_eq!(body.profile.as_deref(), Some(TUBE_PROFILE));
    assert_eq!(body.tube.as_ref().map(|offer| offer.id), Some(tube.id));
    assert_eq!(body.methods, vec![OOB.to_owned()]);

    let pending = negotiator.complete(h.peer(), *id).unwrap();
    assert_eq!(pending.purpose, Purpose::Offer);
    assert_eq!(pending.generation, tube.generation);
    assert_eq!(negotiator.pending_count(), 0);
}

#[test]
fn test_reply_from_wrong_peer_is_ignored() {
    let mut h = Harness::new();
    let tube = offered_tube(&mut h);
    let mut negotiator = Negotiator::default();

    negotiator.offer(&h.ctx, &tube).unwrap();

    let sent = h.session.take_sent();
    let [(_, Stanza::Request { id, .. })] = sent.as_slice() else {
        panic!("unexpected stanzas {sent:?}");
    };

    let mallory = h.handles.ensure("mallory@host");

    assert!(negotiator.complete(mallory, *id).is_none());
    assert!(negotiator.complete(h.peer(), *id).is_some());
}

#[test]
fn test_failed_send_leaves_nothing_pending() {
    let mut h = Harness::new();
    let tube = offered_tube(&mut h);
    let mut negotiator = Negotiator::default();

    h.session.set_full(true);

    assert_eq!(negotiator.offer(&h.ctx, &tube), Err(SendError::Full));
    assert_eq!(negotiator.pending_count(), 0);
}

#[test]
fn test_forget_drops_requests_for_tube() {
    let mut h = Harness::new();
    let tube = offered_tube(&mut h);
    let mut negotiator = Negotiator::default();

    negotiator.offer(&h.ctx, &tube).unwrap();
    negotiator
        .request_connection(&h.ctx, &tube, ConnId::new(3))
        .unwrap();
    assert_eq!(negotiator.pending_count(), 2);

    negotiator.forget(tube.tube_ref());

    assert_eq!(negotiator.pending_count(), 0);
}
