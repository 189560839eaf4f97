use std::io::Cursor;

use super::*;
use crate::message::Method;

async fn read_all(raw: &'static [u8]) -> Vec<Message> {
    let mut r = MessageReader::new(Cursor::new(raw));
    let mut out = Vec::new();
    while let Ok(msg) = r.read_message().await {
        out.push(msg);
    }
    out
}

#[tokio::test]
async fn test_read_request_with_body() {
    let raw = b"ANNOUNCE rtsp://host/path RTSP/1.0\r\n\
CSeq: 1\r\n\
Content-Type: application/sdp\r\n\
Content-Length: 5\r\n\
\r\n\
hello";

    let msgs = read_all(raw).await;
    assert_eq!(msgs.len(), 1);
    match &msgs[0] {
        Message::Request(req) => {
            assert_eq!(req.method, Method::Announce);
            assert_eq!(&req.body[..], b"hello");
        }
        _ => panic!("expected a request"),
    }
}

#[tokio::test]
async fn test_read_mixed_stream() {
    let raw = b"OPTIONS rtsp://host/path RTSP/1.0\r\n\
CSeq: 1\r\n\
\r\n\
\x24\x00\x00\x04abcd\
RTSP/1.0 200 OK\r\n\
CSeq: 1\r\n\
\r\n";

    let msgs = read_all(raw).await;
    assert_eq!(msgs.len(), 3);
    assert!(matches!(msgs[0], Message::Request(_)));
    match &msgs[1] {
        Message::Interleaved(f) => {
            assert_eq!(f.channel, 0);
            assert_eq!(&f.payload[..], b"abcd");
        }
        _ => panic!("expected an interleaved frame"),
    }
    assert!(matches!(msgs[2], Message::Response(_)));
}

#[tokio::test]
async fn test_read_oversized_content_length() {
    let raw = b"ANNOUNCE rtsp://host/path RTSP/1.0\r\n\
CSeq: 1\r\n\
Content-Length: 99999999\r\n\
\r\n";

    let mut r = MessageReader::new(Cursor::new(&raw[..]));
    assert!(r.read_message().await.is_err());
}

#[tokio::test]
async fn test_write_response() {
    let mut buf = Vec::new();
    {
        let mut w = MessageWriter::new(&mut buf, Duration::from_secs(1));
        let mut res = Response::new(crate::message::StatusCode::OK);
        res.headers.set("CSeq", "9");
        w.write_response(&res).await.unwrap();
    }
    assert_eq!(buf, b"RTSP/1.0 200 OK\r\nCSeq: 9\r\n\r\n");
}
