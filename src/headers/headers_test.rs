use std::net::IpAddr;

use super::*;

#[test]
fn test_transport_unmarshal_udp() {
    let tr = Transport::unmarshal("RTP/AVP;unicast;client_port=50000-50001").unwrap();
    assert_eq!(tr.protocol, Protocol::Udp);
    assert_eq!(tr.profile, Profile::Avp);
    assert_eq!(tr.client_port, Some((50000, 50001)));
    assert_eq!(tr.interleaved, None);
}

#[test]
fn test_transport_unmarshal_tcp_secure() {
    let tr = Transport::unmarshal("RTP/SAVP/TCP;unicast;interleaved=2-3;mode=record").unwrap();
    assert_eq!(tr.protocol, Protocol::Tcp);
    assert_eq!(tr.profile, Profile::Savp);
    assert_eq!(tr.interleaved, Some((2, 3)));
    assert_eq!(tr.mode, Some(TransportMode::Record));
}

#[test]
fn test_transport_unmarshal_multicast() {
    let tr =
        Transport::unmarshal("RTP/AVP;multicast;destination=224.1.0.5;ttl=127;port=8002-8003")
            .unwrap();
    assert_eq!(tr.protocol, Protocol::UdpMulticast);
    assert_eq!(tr.destination, Some("224.1.0.5".parse::<IpAddr>().unwrap()));
    assert_eq!(tr.ttl, Some(127));
    assert_eq!(tr.server_port, Some((8002, 8003)));
}

#[test]
fn test_transport_alternatives_preference_order() {
    let alts = Transport::alternatives("RTP/AVP;unicast;client_port=0-1, RTP/AVP/TCP;unicast");
    assert_eq!(alts.len(), 2);
    assert_eq!(
        Transport::unmarshal(alts[0]).unwrap().protocol,
        Protocol::Udp
    );
    assert_eq!(
        Transport::unmarshal(alts[1]).unwrap().protocol,
        Protocol::Tcp
    );
}

#[test]
fn test_transport_marshal_round_trip() {
    let tr = Transport {
        protocol: Protocol::Udp,
        profile: Profile::Avp,
        client_port: Some((50000, 50001)),
        server_port: Some((8000, 8001)),
        ssrc: Some(0x1234_ABCD),
        ..Default::default()
    };
    let enc = tr.marshal();
    assert_eq!(
        enc,
        "RTP/AVP;unicast;client_port=50000-50001;server_port=8000-8001;ssrc=1234ABCD"
    );
    assert_eq!(Transport::unmarshal(&enc).unwrap(), tr);
}

#[test]
fn test_transport_unmarshal_invalid() {
    assert!(Transport::unmarshal("RTP/FOO").is_err());
    assert!(Transport::unmarshal("RTP/AVP;client_port=abc").is_err());
    assert!(Transport::unmarshal("RTP/AVP/TCP;interleaved=300-301").is_err());
}

#[test]
fn test_session_header() {
    let sh = SessionHeader::unmarshal("38237650764888;timeout=60").unwrap();
    assert_eq!(sh.id, "38237650764888");
    assert_eq!(sh.timeout, Some(60));
    assert_eq!(sh.marshal(), "38237650764888;timeout=60");

    let sh = SessionHeader::unmarshal("38237650764888").unwrap();
    assert_eq!(sh.timeout, None);
}

#[test]
fn test_rtp_info_round_trip() {
    let ri = RtpInfo(vec![
        RtpInfoEntry {
            url: "rtsp://host/path/trackID=0".into(),
            sequence_number: Some(35243),
            timestamp: Some(717574556),
        },
        RtpInfoEntry {
            url: "rtsp://host/path/trackID=1".into(),
            sequence_number: None,
            timestamp: None,
        },
    ]);

    let enc = ri.marshal();
    assert_eq!(
        enc,
        "url=rtsp://host/path/trackID=0;seq=35243;rtptime=717574556,url=rtsp://host/path/trackID=1"
    );
    assert_eq!(RtpInfo::unmarshal(&enc).unwrap(), ri);
}

#[test]
fn test_key_mgmt_round_trip() {
    let km = KeyMgmt {
        url: Some("rtsps://host/path".into()),
        mikey_payload: vec![0x01, 0x02, 0x03, 0xff],
    };
    let enc = km.marshal();
    assert_eq!(KeyMgmt::unmarshal(&enc).unwrap(), km);
}

#[test]
fn test_key_mgmt_invalid() {
    assert!(KeyMgmt::unmarshal("prot=other;data=\"AAAA\"").is_err());
    assert!(KeyMgmt::unmarshal("prot=mikey").is_err());
    assert!(KeyMgmt::unmarshal("prot=mikey;data=\"!notbase64!\"").is_err());
}
