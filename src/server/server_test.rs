use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use util::marshal::Marshal;
use util::sync::Mutex;

use super::*;
use crate::conn::{MessageReader, MessageWriter};
use crate::error::Error;
use crate::headers::{RtpInfo, SessionHeader, Transport};
use crate::message::{Message, Method, Request, Response, StatusCode};
use crate::rtsp_url::RtspUrl;
use crate::transport::UdpListener;

type TestReader = MessageReader<tokio::io::ReadHalf<TcpStream>>;
type TestWriter = MessageWriter<tokio::io::WriteHalf<TcpStream>>;

async fn connect(addr: SocketAddr) -> (TestReader, TestWriter) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (r, w) = tokio::io::split(stream);
    (
        MessageReader::new(r),
        MessageWriter::new(w, Duration::from_secs(5)),
    )
}

/// Writes a request and reads messages until its response arrives,
/// collecting interleaved frames seen on the way.
async fn roundtrip(
    reader: &mut TestReader,
    writer: &mut TestWriter,
    req: &Request,
) -> (Response, Vec<crate::message::InterleavedFrame>) {
    writer.write_request(req).await.unwrap();
    let mut frames = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), reader.read_message())
            .await
            .unwrap()
            .unwrap()
        {
            Message::Response(res) => return (res, frames),
            Message::Interleaved(f) => frames.push(f),
            Message::Request(_) => {}
        }
    }
}

async fn free_even_port_pair() -> (u16, u16) {
    let (rtp, rtcp) = UdpListener::bind_pair(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .await
        .unwrap();
    (rtp.port(), rtcp.port())
}

fn single_media_description() -> crate::description::SessionDescription {
    crate::description::SessionDescription {
        title: None,
        medias: vec![crate::description::Media {
            media_type: crate::description::MediaType::Video,
            control: String::new(),
            is_back_channel: false,
            formats: vec![crate::description::Format {
                payload_type: 96,
                codec: "H264".into(),
                clock_rate: 90000,
                channels: None,
                parameters: String::new(),
            }],
        }],
    }
}

type StreamSlot = Arc<Mutex<Option<Arc<ServerStream>>>>;

fn play_handlers(slot: &StreamSlot) -> ServerHandlers {
    let describe_slot = Arc::clone(slot);
    let setup_slot = Arc::clone(slot);
    ServerHandlers {
        on_describe: Some(Box::new(move |_| {
            describe_slot
                .lock()
                .clone()
                .ok_or(StatusCode::NOT_FOUND)
        })),
        on_setup: Some(Box::new(move |_| Ok(setup_slot.lock().clone()))),
        on_play: Some(Box::new(|_| Ok(()))),
        ..Default::default()
    }
}

async fn play_server(mut cfg: ServerConfig) -> (Server, Arc<ServerStream>, StreamSlot) {
    let slot: StreamSlot = Arc::new(Mutex::new(None));
    cfg.rtsp_address = "127.0.0.1:0".to_string();
    cfg.handlers = play_handlers(&slot);

    let server = Server::new(cfg).await.unwrap();
    let stream = ServerStream::new(&server, single_media_description());
    *slot.lock() = Some(Arc::clone(&stream));
    (server, stream, slot)
}

fn setup_udp_request(server_addr: SocketAddr, cseq: u32) -> Request {
    let url = RtspUrl::parse(&format!("rtsp://{server_addr}/mystream/trackID=0")).unwrap();
    let mut req = Request::new(Method::Setup, url);
    req.headers.set("CSeq", cseq.to_string());
    req.headers
        .set("Transport", "RTP/AVP;unicast;client_port=50000-50001");
    req
}

#[tokio::test]
async fn test_setup_play_udp_unicast() {
    let (rtp_port, rtcp_port) = free_even_port_pair().await;
    let cfg = ServerConfig {
        udp_rtp_address: Some(format!("127.0.0.1:{rtp_port}")),
        udp_rtcp_address: Some(format!("127.0.0.1:{rtcp_port}")),
        ..Default::default()
    };
    let (server, _stream, _slot) = play_server(cfg).await;
    let addr = server.local_addr();
    let (mut r, mut w) = connect(addr).await;

    let (res, _) = roundtrip(&mut r, &mut w, &setup_udp_request(addr, 1)).await;
    assert_eq!(res.status, StatusCode::OK);

    let tr = Transport::unmarshal(res.headers.get("Transport").unwrap()).unwrap();
    assert_eq!(tr.client_port, Some((50000, 50001)));
    assert_eq!(tr.server_port, Some((rtp_port, rtcp_port)));

    let sh = SessionHeader::unmarshal(res.headers.get("Session").unwrap()).unwrap();
    assert_eq!(sh.timeout, Some(60));

    // PLAY on the aggregate URL
    let url = RtspUrl::parse(&format!("rtsp://{addr}/mystream")).unwrap();
    let mut play = Request::new(Method::Play, url);
    play.headers.set("CSeq", "2");
    play.headers.set("Session", sh.id.clone());
    let (res, _) = roundtrip(&mut r, &mut w, &play).await;
    assert_eq!(res.status, StatusCode::OK);

    let rtp_info = RtpInfo::unmarshal(res.headers.get("RTP-Info").unwrap()).unwrap();
    assert_eq!(rtp_info.0.len(), 1);
    assert_eq!(
        rtp_info.0[0].url,
        format!("rtsp://{addr}/mystream/trackID=0")
    );

    // the Session header keeps the same id for the session's lifetime
    let sh2 = SessionHeader::unmarshal(res.headers.get("Session").unwrap()).unwrap();
    assert_eq!(sh2.id, sh.id);

    // TEARDOWN carries no Session header
    let url = RtspUrl::parse(&format!("rtsp://{addr}/mystream")).unwrap();
    let mut teardown = Request::new(Method::Teardown, url);
    teardown.headers.set("CSeq", "3");
    teardown.headers.set("Session", sh.id);
    let (res, _) = roundtrip(&mut r, &mut w, &teardown).await;
    assert_eq!(res.status, StatusCode::OK);
    assert!(res.headers.get("Session").is_none());
}

#[tokio::test]
async fn test_setup_tcp_assigns_lowest_channel_pair() {
    let (server, _stream, _slot) = play_server(ServerConfig::default()).await;
    let addr = server.local_addr();
    let (mut r, mut w) = connect(addr).await;

    let url = RtspUrl::parse(&format!("rtsp://{addr}/mystream/trackID=0")).unwrap();
    let mut req = Request::new(Method::Setup, url);
    req.headers.set("CSeq", "1");
    req.headers.set("Transport", "RTP/AVP/TCP;unicast");

    let (res, _) = roundtrip(&mut r, &mut w, &req).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(
        res.headers.get("Transport").unwrap(),
        "RTP/AVP/TCP;unicast;interleaved=0-1"
    );
}

#[tokio::test]
async fn test_setup_different_transports_is_rejected() {
    let (rtp_port, rtcp_port) = free_even_port_pair().await;
    let cfg = ServerConfig {
        udp_rtp_address: Some(format!("127.0.0.1:{rtp_port}")),
        udp_rtcp_address: Some(format!("127.0.0.1:{rtcp_port}")),
        ..Default::default()
    };

    // a stream with two medias, so two SETUPs are possible
    let slot: StreamSlot = Arc::new(Mutex::new(None));
    let mut cfg = cfg;
    cfg.rtsp_address = "127.0.0.1:0".to_string();
    cfg.handlers = play_handlers(&slot);
    let server = Server::new(cfg).await.unwrap();

    let mut desc = single_media_description();
    desc.medias.push(crate::description::Media {
        media_type: crate::description::MediaType::Audio,
        control: String::new(),
        is_back_channel: false,
        formats: vec![crate::description::Format {
            payload_type: 97,
            codec: "PCMA".into(),
            clock_rate: 8000,
            channels: Some(1),
            parameters: String::new(),
        }],
    });
    let stream = ServerStream::new(&server, desc);
    *slot.lock() = Some(stream);

    let addr = server.local_addr();
    let (mut r, mut w) = connect(addr).await;

    let (res, _) = roundtrip(&mut r, &mut w, &setup_udp_request(addr, 1)).await;
    assert_eq!(res.status, StatusCode::OK);
    let session_id = SessionHeader::unmarshal(res.headers.get("Session").unwrap())
        .unwrap()
        .id;

    let url = RtspUrl::parse(&format!("rtsp://{addr}/mystream/trackID=1")).unwrap();
    let mut req = Request::new(Method::Setup, url);
    req.headers.set("CSeq", "2");
    req.headers.set("Session", session_id);
    req.headers.set("Transport", "RTP/AVP/TCP;unicast");

    let (res, _) = roundtrip(&mut r, &mut w, &req).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
}

const ANNOUNCE_SDP_TWO_MEDIAS: &[u8] = b"v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s= \r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=control:trackID=0\r\n\
a=rtpmap:96 H264/90000\r\n\
m=audio 0 RTP/AVP 97\r\n\
a=control:trackID=1\r\n\
a=rtpmap:97 PCMA/8000\r\n";

fn record_handlers() -> ServerHandlers {
    ServerHandlers {
        on_announce: Some(Box::new(|_| Ok(()))),
        on_record: Some(Box::new(|_| Ok(()))),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_record_with_partial_setup_is_rejected() {
    let cfg = ServerConfig {
        rtsp_address: "127.0.0.1:0".to_string(),
        handlers: record_handlers(),
        ..Default::default()
    };
    let server = Server::new(cfg).await.unwrap();
    let addr = server.local_addr();
    let (mut r, mut w) = connect(addr).await;

    let url = RtspUrl::parse(&format!("rtsp://{addr}/publish")).unwrap();
    let mut announce = Request::new(Method::Announce, url.clone());
    announce.headers.set("CSeq", "1");
    announce.headers.set("Content-Type", "application/sdp");
    announce.body = Bytes::from_static(ANNOUNCE_SDP_TWO_MEDIAS);
    let (res, _) = roundtrip(&mut r, &mut w, &announce).await;
    assert_eq!(res.status, StatusCode::OK);
    // ANNOUNCE responses carry no Session header; the first SETUP delivers
    // the session id
    assert!(res.headers.get("Session").is_none());

    let setup_url = RtspUrl::parse(&format!("rtsp://{addr}/publish/trackID=0")).unwrap();
    let mut setup = Request::new(Method::Setup, setup_url);
    setup.headers.set("CSeq", "2");
    setup
        .headers
        .set("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1;mode=record");
    let (res, _) = roundtrip(&mut r, &mut w, &setup).await;
    assert_eq!(res.status, StatusCode::OK);
    let session_id = SessionHeader::unmarshal(res.headers.get("Session").unwrap())
        .unwrap()
        .id;

    // only one of the two announced medias is set up
    let mut record = Request::new(Method::Record, url);
    record.headers.set("CSeq", "3");
    record.headers.set("Session", session_id);
    let (res, _) = roundtrip(&mut r, &mut w, &record).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_record_flow() {
    let (pkt_tx, mut pkt_rx) = tokio::sync::mpsc::unbounded_channel();
    let pkt_tx = Arc::new(pkt_tx);

    let record_tx = Arc::clone(&pkt_tx);
    let handlers = ServerHandlers {
        on_announce: Some(Box::new(|_| Ok(()))),
        on_record: Some(Box::new(move |ctx| {
            let tx = Arc::clone(&record_tx);
            ctx.session.set_on_packet_rtp(
                0,
                96,
                Box::new(move |pkt| {
                    let _ = tx.send(pkt);
                }),
            );
            Ok(())
        })),
        ..Default::default()
    };

    let cfg = ServerConfig {
        rtsp_address: "127.0.0.1:0".to_string(),
        handlers,
        ..Default::default()
    };
    let server = Server::new(cfg).await.unwrap();
    let addr = server.local_addr();
    let (mut r, mut w) = connect(addr).await;

    const SDP_ONE_MEDIA: &[u8] = b"v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s= \r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=control:trackID=0\r\n\
a=rtpmap:96 H264/90000\r\n";

    let url = RtspUrl::parse(&format!("rtsp://{addr}/publish")).unwrap();
    let mut announce = Request::new(Method::Announce, url.clone());
    announce.headers.set("CSeq", "1");
    announce.headers.set("Content-Type", "application/sdp");
    announce.body = Bytes::from_static(SDP_ONE_MEDIA);
    let (res, _) = roundtrip(&mut r, &mut w, &announce).await;
    assert_eq!(res.status, StatusCode::OK);

    let setup_url = RtspUrl::parse(&format!("rtsp://{addr}/publish/trackID=0")).unwrap();
    let mut setup = Request::new(Method::Setup, setup_url);
    setup.headers.set("CSeq", "2");
    setup
        .headers
        .set("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1;mode=record");
    let (res, _) = roundtrip(&mut r, &mut w, &setup).await;
    assert_eq!(res.status, StatusCode::OK);
    let session_id = SessionHeader::unmarshal(res.headers.get("Session").unwrap())
        .unwrap()
        .id;

    let mut record = Request::new(Method::Record, url);
    record.headers.set("CSeq", "3");
    record.headers.set("Session", session_id);
    let (res, _) = roundtrip(&mut r, &mut w, &record).await;
    assert_eq!(res.status, StatusCode::OK);

    // publish one packet as an interleaved frame
    let pkt = rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type: 96,
            sequence_number: 771,
            timestamp: 545895,
            ssrc: 0x12345678,
            ..Default::default()
        },
        payload: Bytes::from_static(&[5, 6, 7, 8]),
    };
    let frame = crate::message::InterleavedFrame {
        channel: 0,
        payload: pkt.marshal().unwrap(),
    };
    w.write_interleaved_frame(&frame.marshal()).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), pkt_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.header.sequence_number, 771);
    assert_eq!(&received.payload[..], &[5, 6, 7, 8]);
}

#[tokio::test]
async fn test_play_udp_session_timeout() {
    let (close_tx, mut close_rx) = tokio::sync::mpsc::unbounded_channel();

    let (rtp_port, rtcp_port) = free_even_port_pair().await;
    let slot: StreamSlot = Arc::new(Mutex::new(None));
    let mut handlers = play_handlers(&slot);
    handlers.on_session_close = Some(Box::new(move |_, err| {
        let _ = close_tx.send(err.clone());
    }));

    let cfg = ServerConfig {
        rtsp_address: "127.0.0.1:0".to_string(),
        udp_rtp_address: Some(format!("127.0.0.1:{rtp_port}")),
        udp_rtcp_address: Some(format!("127.0.0.1:{rtcp_port}")),
        session_timeout: Duration::from_millis(500),
        check_stream_period: Duration::from_millis(100),
        handlers,
        ..Default::default()
    };
    let server = Server::new(cfg).await.unwrap();
    let stream = ServerStream::new(&server, single_media_description());
    *slot.lock() = Some(stream);

    let addr = server.local_addr();
    let (mut r, mut w) = connect(addr).await;

    let (res, _) = roundtrip(&mut r, &mut w, &setup_udp_request(addr, 1)).await;
    assert_eq!(res.status, StatusCode::OK);
    let session_id = SessionHeader::unmarshal(res.headers.get("Session").unwrap())
        .unwrap()
        .id;

    let url = RtspUrl::parse(&format!("rtsp://{addr}/mystream")).unwrap();
    let mut play = Request::new(Method::Play, url);
    play.headers.set("CSeq", "2");
    play.headers.set("Session", session_id);
    let (res, _) = roundtrip(&mut r, &mut w, &play).await;
    assert_eq!(res.status, StatusCode::OK);

    // cease all traffic; the session must time out
    let err = tokio::time::timeout(Duration::from_secs(5), close_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(err, Error::ErrSessionTimedOut);
}

#[tokio::test]
async fn test_play_tcp_interleaved_flow() {
    let (server, stream, _slot) = play_server(ServerConfig::default()).await;
    let addr = server.local_addr();
    let (mut r, mut w) = connect(addr).await;

    // a packet published before PLAY seeds the RTP-Info entry
    let pkt = rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type: 96,
            sequence_number: 554,
            timestamp: 984512368,
            ssrc: 0x11111111,
            ..Default::default()
        },
        payload: Bytes::from_static(&[1, 2, 3]),
    };
    stream.write_packet_rtp(0, &pkt).unwrap();

    let url = RtspUrl::parse(&format!("rtsp://{addr}/mystream/trackID=0")).unwrap();
    let mut setup = Request::new(Method::Setup, url);
    setup.headers.set("CSeq", "1");
    setup.headers.set("Transport", "RTP/AVP/TCP;unicast");
    let (res, _) = roundtrip(&mut r, &mut w, &setup).await;
    assert_eq!(res.status, StatusCode::OK);
    let session_id = SessionHeader::unmarshal(res.headers.get("Session").unwrap())
        .unwrap()
        .id;

    let url = RtspUrl::parse(&format!("rtsp://{addr}/mystream")).unwrap();
    let mut play = Request::new(Method::Play, url);
    play.headers.set("CSeq", "2");
    play.headers.set("Session", session_id);
    let (res, _) = roundtrip(&mut r, &mut w, &play).await;
    assert_eq!(res.status, StatusCode::OK);

    let rtp_info = RtpInfo::unmarshal(res.headers.get("RTP-Info").unwrap()).unwrap();
    assert_eq!(rtp_info.0[0].sequence_number, Some(555));
    assert!(rtp_info.0[0].timestamp.is_some());

    // packets published after PLAY arrive as interleaved frames
    let mut pkt2 = pkt.clone();
    pkt2.header.sequence_number = 555;
    stream.write_packet_rtp(0, &pkt2).unwrap();

    loop {
        match tokio::time::timeout(Duration::from_secs(5), r.read_message())
            .await
            .unwrap()
            .unwrap()
        {
            Message::Interleaved(f) => {
                assert_eq!(f.channel, 0);
                let mut buf = &f.payload[..];
                let received =
                    <rtp::packet::Packet as util::marshal::Unmarshal>::unmarshal(&mut buf)
                        .unwrap();
                assert_eq!(received.header.sequence_number, 555);
                // the stream overwrites the SSRC with its own
                assert_ne!(received.header.ssrc, 0x11111111);
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_multicast_fanout_reader_lifecycle() {
    let (rtp_port, rtcp_port) = free_even_port_pair().await;
    let (mc_rtp_port, mc_rtcp_port) = free_even_port_pair().await;
    let cfg = ServerConfig {
        udp_rtp_address: Some(format!("127.0.0.1:{rtp_port}")),
        udp_rtcp_address: Some(format!("127.0.0.1:{rtcp_port}")),
        multicast_ip_range: Some("224.1.0.0/16".to_string()),
        multicast_rtp_port: mc_rtp_port,
        multicast_rtcp_port: mc_rtcp_port,
        ..Default::default()
    };
    let (server, stream, _slot) = play_server(cfg).await;
    let addr = server.local_addr();

    async fn setup_multicast(
        addr: SocketAddr,
        r: &mut TestReader,
        w: &mut TestWriter,
    ) -> String {
        let url = RtspUrl::parse(&format!("rtsp://{addr}/mystream/trackID=0")).unwrap();
        let mut setup = Request::new(Method::Setup, url);
        setup.headers.set("CSeq", "1");
        setup.headers.set("Transport", "RTP/AVP;multicast");
        let (res, _) = roundtrip(r, w, &setup).await;
        assert_eq!(res.status, StatusCode::OK);

        let tr = Transport::unmarshal(res.headers.get("Transport").unwrap()).unwrap();
        assert_eq!(tr.ttl, Some(127));
        assert!(tr.destination.is_some());

        SessionHeader::unmarshal(res.headers.get("Session").unwrap())
            .unwrap()
            .id
    }

    let (mut r1, mut w1) = connect(addr).await;
    let sid1 = setup_multicast(addr, &mut r1, &mut w1).await;
    assert!(stream.multicast_params(0).is_some());

    let (mut r2, mut w2) = connect(addr).await;
    let _sid2 = setup_multicast(addr, &mut r2, &mut w2).await;

    // closing the first session keeps the multicast writer alive
    let url = RtspUrl::parse(&format!("rtsp://{addr}/mystream")).unwrap();
    let mut teardown = Request::new(Method::Teardown, url.clone());
    teardown.headers.set("CSeq", "2");
    teardown.headers.set("Session", sid1);
    let (res, _) = roundtrip(&mut r1, &mut w1, &teardown).await;
    assert_eq!(res.status, StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(stream.multicast_params(0).is_some());

    // dropping the second connection detaches the last reader and closes
    // the multicast writer
    drop(r2);
    drop(w2);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(stream.multicast_params(0).is_none());
}
