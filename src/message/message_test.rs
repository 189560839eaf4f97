use bytes::Bytes;

use super::*;
use crate::rtsp_url::RtspUrl;

#[test]
fn test_request_marshal() {
    let mut req = Request::new(
        Method::Options,
        RtspUrl::parse("rtsp://example.com/media.mp4").unwrap(),
    );
    req.headers.set("CSeq", "1");

    let raw = req.marshal();
    assert_eq!(
        raw,
        b"OPTIONS rtsp://example.com/media.mp4 RTSP/1.0\r\nCSeq: 1\r\n\r\n"
    );
}

#[test]
fn test_request_unmarshal_head() {
    let lines = vec![
        "SETUP rtsp://example.com/media.mp4/trackID=0 RTSP/1.0",
        "CSeq: 2",
        "Transport: RTP/AVP;unicast;client_port=50000-50001",
    ];
    let req = Request::unmarshal_head(&lines).unwrap();
    assert_eq!(req.method, Method::Setup);
    assert_eq!(req.cseq().unwrap(), 2);
    assert_eq!(
        req.headers.get("transport").unwrap(),
        "RTP/AVP;unicast;client_port=50000-50001"
    );
}

#[test]
fn test_request_unmarshal_invalid() {
    assert!(Request::unmarshal_head(&["FOO rtsp://h/p RTSP/1.0"]).is_err());
    assert!(Request::unmarshal_head(&["OPTIONS rtsp://h/p RTSP/2.0"]).is_err());
    assert!(Request::unmarshal_head(&["OPTIONS"]).is_err());
}

#[test]
fn test_response_marshal_with_body() {
    let mut res = Response::new(StatusCode::OK);
    res.headers.set("CSeq", "3");
    res.body = Bytes::from_static(b"v=0\r\n");

    let raw = res.marshal();
    assert_eq!(
        raw,
        b"RTSP/1.0 200 OK\r\nCSeq: 3\r\nContent-Length: 5\r\n\r\nv=0\r\n"
    );
}

#[test]
fn test_response_unmarshal_head() {
    let lines = vec!["RTSP/1.0 461 Unsupported Transport", "CSeq: 4"];
    let res = Response::unmarshal_head(&lines).unwrap();
    assert_eq!(res.status, StatusCode::UNSUPPORTED_TRANSPORT);
    assert_eq!(res.cseq().unwrap(), 4);
}

#[test]
fn test_session_id_with_parameters() {
    let lines = vec![
        "PLAY rtsp://example.com/media.mp4 RTSP/1.0",
        "CSeq: 5",
        "Session: 12345678;timeout=60",
    ];
    let req = Request::unmarshal_head(&lines).unwrap();
    assert_eq!(req.session_id().unwrap(), "12345678");
}

#[test]
fn test_interleaved_frame_marshal() {
    let f = InterleavedFrame {
        channel: 6,
        payload: Bytes::from_static(&[0x01, 0x02, 0x03]),
    };
    assert_eq!(f.marshal(), vec![0x24, 0x06, 0x00, 0x03, 0x01, 0x02, 0x03]);

    let mut buf = vec![0u8; 16];
    let n = f.marshal_to(&mut buf);
    assert_eq!(&buf[..n], &[0x24, 0x06, 0x00, 0x03, 0x01, 0x02, 0x03]);
}

#[test]
fn test_headers_case_insensitive() {
    let mut h = Headers::new();
    h.set("Content-Type", "application/sdp");
    assert_eq!(h.get("content-type").unwrap(), "application/sdp");

    h.set("CONTENT-TYPE", "text/parameters");
    assert_eq!(h.get("Content-Type").unwrap(), "text/parameters");
    assert_eq!(h.iter().count(), 1);
}
