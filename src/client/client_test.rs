use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use util::sync::Mutex;

use super::*;
use crate::description::{Format, Media, MediaType, SessionDescription};
use crate::server::{Server, ServerConfig, ServerHandlers, ServerStream};
use crate::message::StatusCode;

fn test_description() -> SessionDescription {
    SessionDescription {
        title: None,
        medias: vec![Media {
            media_type: MediaType::Video,
            control: String::new(),
            is_back_channel: false,
            formats: vec![Format {
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

async fn play_server(mut cfg: ServerConfig) -> (Server, Arc<ServerStream>) {
    let slot: StreamSlot = Arc::new(Mutex::new(None));
    let describe_slot = Arc::clone(&slot);
    let setup_slot = Arc::clone(&slot);

    cfg.rtsp_address = "127.0.0.1:0".to_string();
    cfg.handlers = ServerHandlers {
        on_describe: Some(Box::new(move |_| {
            describe_slot.lock().clone().ok_or(StatusCode::NOT_FOUND)
        })),
        on_setup: Some(Box::new(move |_| Ok(setup_slot.lock().clone()))),
        on_play: Some(Box::new(|_| Ok(()))),
        ..Default::default()
    };

    let server = Server::new(cfg).await.unwrap();
    let stream = ServerStream::new(&server, test_description());
    *slot.lock() = Some(Arc::clone(&stream));
    (server, stream)
}

fn test_packet(seq: u16) -> rtp::packet::Packet {
    rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type: 96,
            sequence_number: seq,
            timestamp: 170000,
            ssrc: 0x99999999,
            ..Default::default()
        },
        payload: Bytes::from_static(&[0xA0, 0xA1, 0xA2]),
    }
}

#[tokio::test]
async fn test_play_tcp() {
    let (server, stream) = play_server(ServerConfig::default()).await;

    let cfg = ClientConfig {
        protocol: Some(crate::headers::Protocol::Tcp),
        ..Default::default()
    };
    let client = Client::connect(cfg, &format!("rtsp://{}/mystream", server.local_addr()))
        .await
        .unwrap();

    client.options().await.unwrap();
    let desc = client.describe().await.unwrap();
    assert_eq!(desc.medias.len(), 1);
    assert_eq!(desc.medias[0].control, "trackID=0");

    client.setup(&desc, 0).await.unwrap();

    let (pkt_tx, mut pkt_rx) = tokio::sync::mpsc::unbounded_channel();
    client.set_on_packet_rtp(
        0,
        96,
        Box::new(move |pkt| {
            let _ = pkt_tx.send(pkt);
        }),
    );

    client.play().await.unwrap();

    stream.write_packet_rtp(0, &test_packet(900)).unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), pkt_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.header.sequence_number, 900);
    assert_eq!(&received.payload[..], &[0xA0, 0xA1, 0xA2]);
    assert!(client.bytes_received() > 0);

    client.teardown().await.unwrap();
}

#[tokio::test]
async fn test_play_udp() {
    let (rtp_l, rtcp_l) = crate::transport::UdpListener::bind_pair(
        std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
    )
    .await
    .unwrap();
    let ports = (rtp_l.port(), rtcp_l.port());
    drop(rtp_l);
    drop(rtcp_l);

    let cfg = ServerConfig {
        udp_rtp_address: Some(format!("127.0.0.1:{}", ports.0)),
        udp_rtcp_address: Some(format!("127.0.0.1:{}", ports.1)),
        ..Default::default()
    };
    let (server, stream) = play_server(cfg).await;

    let client = Client::connect(
        ClientConfig::default(),
        &format!("rtsp://{}/mystream", server.local_addr()),
    )
    .await
    .unwrap();

    let desc = client.describe().await.unwrap();
    client.setup(&desc, 0).await.unwrap();

    let (pkt_tx, mut pkt_rx) = tokio::sync::mpsc::unbounded_channel();
    client.set_on_packet_rtp(
        0,
        96,
        Box::new(move |pkt| {
            let _ = pkt_tx.send(pkt);
        }),
    );

    let rtp_info = client.play().await.unwrap();
    assert!(rtp_info.is_some());

    // packets may need a moment until the reader is active
    let mut received = None;
    for seq in 0..50u16 {
        stream.write_packet_rtp(0, &test_packet(1000 + seq)).unwrap();
        match tokio::time::timeout(Duration::from_millis(100), pkt_rx.recv()).await {
            Ok(Some(pkt)) => {
                received = Some(pkt);
                break;
            }
            _ => continue,
        }
    }
    let received = received.expect("no packet received over UDP");
    assert!(received.header.sequence_number >= 1000);

    client.teardown().await.unwrap();
}

#[tokio::test]
async fn test_record_tcp() {
    let (pkt_tx, mut pkt_rx) = tokio::sync::mpsc::unbounded_channel();
    let pkt_tx = Arc::new(pkt_tx);

    let record_tx = Arc::clone(&pkt_tx);
    let cfg = ServerConfig {
        rtsp_address: "127.0.0.1:0".to_string(),
        handlers: ServerHandlers {
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
        },
        ..Default::default()
    };
    let server = Server::new(cfg).await.unwrap();

    let cfg = ClientConfig {
        protocol: Some(crate::headers::Protocol::Tcp),
        ..Default::default()
    };
    let client = Client::connect(cfg, &format!("rtsp://{}/publish", server.local_addr()))
        .await
        .unwrap();

    let desc = test_description();
    client.announce(&desc).await.unwrap();
    client.setup(&desc, 0).await.unwrap();
    client.record().await.unwrap();

    client.write_packet_rtp(0, &test_packet(2000)).unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), pkt_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.header.sequence_number, 2000);

    client.teardown().await.unwrap();
}

#[tokio::test]
async fn test_udp_to_tcp_fallback() {
    // server without UDP listeners: the first SETUP gets 461 and the client
    // falls back to TCP
    let (server, _stream) = play_server(ServerConfig::default()).await;

    let client = Client::connect(
        ClientConfig::default(),
        &format!("rtsp://{}/mystream", server.local_addr()),
    )
    .await
    .unwrap();

    let desc = client.describe().await.unwrap();
    client.setup(&desc, 0).await.unwrap();
    client.play().await.unwrap();
    client.teardown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_state_transitions() {
    let (server, _stream) = play_server(ServerConfig::default()).await;

    let client = Client::connect(
        ClientConfig::default(),
        &format!("rtsp://{}/mystream", server.local_addr()),
    )
    .await
    .unwrap();

    // PLAY before SETUP
    assert_eq!(client.play().await.unwrap_err(), Error::ErrInvalidState);
    // RECORD without ANNOUNCE
    assert_eq!(client.record().await.unwrap_err(), Error::ErrInvalidState);
}
