use core::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use super::*;

#[test]
fn test_address_kind() {
    let unix = SocketAddress::Unix("/tmp/tube.sock".into());
    let v4 = SocketAddress::Inet(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4000).into());
    let v6 = SocketAddress::Inet(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 4000, 0, 0).into());

    assert_eq!(unix.kind(), AddressKind::Unix);
    assert_eq!(v4.kind(), AddressKind::Ipv4);
    assert_eq!(v6.kind(), AddressKind::Ipv6);
}

#[test]
fn test_access_control_support_matrix() {
    for kind in [AddressKind::Unix, AddressKind::Ipv4, AddressKind::Ipv6] {
        assert!(AccessControl::Localhost.supported_for(kind), "{kind:?}");
        assert!(!AccessControl::Credentials(0).supported_for(kind), "{kind:?}");
    }

    assert!(!AccessControl::Port(1).supported_for(AddressKind::Unix));
    assert!(AccessControl::Port(1).supported_for(AddressKind::Ipv4));
    assert!(AccessControl::Port(1).supported_for(AddressKind::Ipv6));
}

#[test]
fn test_port_access_admits_only_matching_source() {
    let policy = AccessControl::Port(5151);

    assert!(policy.admits(Some(5151)));
    assert!(!policy.admits(Some(5152)));
    assert!(!policy.admits(None));
    assert!(AccessControl::Localhost.admits(None));
}
