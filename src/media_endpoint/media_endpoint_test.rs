use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use util::marshal::Marshal;
use util::sync::{Mutex, RwLock};

use super::*;
use crate::description::{Format, Media, MediaType};
use crate::transport::Writer;

fn test_media() -> Media {
    Media {
        media_type: MediaType::Video,
        control: "trackID=0".into(),
        is_back_channel: false,
        formats: vec![Format {
            payload_type: 96,
            codec: "H264".into(),
            clock_rate: 90000,
            channels: None,
            parameters: String::new(),
        }],
    }
}

struct TestEndpoint {
    ep: MediaEndpoint,
    errors: Arc<Mutex<Vec<Error>>>,
    writer: Option<Writer>,
}

fn make_endpoint(srtp_in: Option<crypto::Context>, with_writer: bool) -> TestEndpoint {
    let srtp_in = srtp_in.map(|c| Arc::new(Mutex::new(c)));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors2 = Arc::clone(&errors);

    let writer_slot = Arc::new(RwLock::new(None));
    let writer = if with_writer {
        let (w, _error_rx) = Writer::new(2);
        *writer_slot.write() = Some(w.handle());
        Some(w)
    } else {
        None
    };

    let (stream, _other) = tokio::io::duplex(4096);
    let boxed: crate::conn::BoxStream = Box::new(stream);
    let (_r, w) = tokio::io::split(boxed);

    let ep = MediaEndpoint::new(
        0,
        &test_media(),
        &[0x11111111],
        true,
        2048,
        1472,
        writer_slot,
        Egress::Tcp {
            conn_writer: Arc::new(tokio::sync::Mutex::new(crate::conn::MessageWriter::new(
                w,
                Duration::from_secs(1),
            ))),
            rtp_channel: 0,
            frame_buf: Arc::new(tokio::sync::Mutex::new(vec![0u8; 2048 + 4])),
        },
        srtp_in,
        None,
        Arc::new(move |err| errors2.lock().push(err.clone())),
    );

    TestEndpoint { ep, errors, writer }
}

fn test_packet(seq: u16, payload_type: u8) -> rtp::packet::Packet {
    rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type,
            sequence_number: seq,
            timestamp: 12345,
            ssrc: 0xAABBCCDD,
            ..Default::default()
        },
        payload: Bytes::from_static(&[1, 2, 3, 4]),
    }
}

#[tokio::test]
async fn test_read_rtp_valid() {
    let t = make_endpoint(None, false);

    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = Arc::clone(&received);
    t.ep.set_on_packet_rtp(
        96,
        Box::new(move |pkt| {
            received2.lock().push(pkt);
        }),
    );

    let raw = test_packet(500, 96).marshal().unwrap();
    t.ep.read_rtp(&raw, true);

    let counters = &t.ep.shared.counters;
    assert_eq!(
        counters.bytes_received.load(Ordering::Relaxed),
        raw.len() as u64
    );
    assert_eq!(counters.rtp_packets_received.load(Ordering::Relaxed), 1);
    assert_eq!(counters.rtp_packets_in_error.load(Ordering::Relaxed), 0);

    let received = received.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].header.sequence_number, 500);

    // the remote SSRC is learned from the first packet
    assert_eq!(
        t.ep.ingress.lock().formats[&96].remote_ssrc,
        Some(0xAABBCCDD)
    );
}

#[tokio::test]
async fn test_read_rtp_unknown_payload_type() {
    let t = make_endpoint(None, false);

    let raw = test_packet(1, 45).marshal().unwrap();
    t.ep.read_rtp(&raw, true);

    let counters = &t.ep.shared.counters;
    assert_eq!(counters.rtp_packets_received.load(Ordering::Relaxed), 0);
    assert_eq!(counters.rtp_packets_in_error.load(Ordering::Relaxed), 1);
    assert_eq!(t.errors.lock()[..], [Error::ErrUnknownPayloadType(45)]);
}

#[tokio::test]
async fn test_read_rtp_too_big_udp() {
    let t = make_endpoint(None, false);

    // one byte more than the maximum payload size
    let raw = vec![0u8; 1473];
    t.ep.read_rtp(&raw, true);

    let counters = &t.ep.shared.counters;
    // still counted in bytes_received
    assert_eq!(counters.bytes_received.load(Ordering::Relaxed), 1473);
    assert_eq!(counters.rtp_packets_in_error.load(Ordering::Relaxed), 1);
    assert_eq!(t.errors.lock()[..], [Error::ErrRtpPacketTooBigUdp]);

    // the same payload over TCP has no size check; it fails later as an
    // invalid RTP packet instead
    let t = make_endpoint(None, false);
    t.ep.read_rtp(&raw, false);
    assert!(matches!(t.errors.lock()[0], Error::ErrRtpDecode(_)));
}

#[tokio::test]
async fn test_read_rtp_secure() {
    let master = crypto::random_master();
    let mut enc = crypto::Context::new(&master, &[0xAABBCCDD], None).unwrap();
    let dec = crypto::Context::new(&master, &[0xAABBCCDD], None).unwrap();

    let t = make_endpoint(Some(dec), false);

    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = Arc::clone(&received);
    t.ep.set_on_packet_rtp(
        96,
        Box::new(move |pkt| {
            received2.lock().push(pkt);
        }),
    );

    let plain = test_packet(800, 96).marshal().unwrap();
    let protected = enc.encrypt_rtp(&plain).unwrap();
    t.ep.read_rtp(&protected, true);

    assert_eq!(received.lock().len(), 1);
    assert_eq!(
        t.ep.shared.counters.rtp_packets_received.load(Ordering::Relaxed),
        1
    );

    // a tampered packet is dropped and reported
    let mut tampered = enc.encrypt_rtp(&plain).unwrap();
    let last = tampered.len() - 1;
    tampered[last] ^= 0xFF;
    t.ep.read_rtp(&tampered, true);

    assert_eq!(received.lock().len(), 1);
    assert_eq!(
        t.ep.shared.counters.rtp_packets_in_error.load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn test_read_rtcp_sender_report() {
    let t = make_endpoint(None, false);

    let rtcp_count = Arc::new(Mutex::new(0usize));
    let rtcp_count2 = Arc::clone(&rtcp_count);
    t.ep.set_on_packet_rtcp(Box::new(move |_| {
        *rtcp_count2.lock() += 1;
    }));

    let sr = rtcp::sender_report::SenderReport {
        ssrc: 0xAABBCCDD,
        ntp_time: (2_208_988_800u64 + 1000) << 32,
        rtp_time: 90000,
        packet_count: 10,
        octet_count: 1000,
        ..Default::default()
    };
    let raw = sr.marshal().unwrap();
    t.ep.read_rtcp(&raw);

    assert_eq!(*rtcp_count.lock(), 1);
    assert_eq!(
        t.ep.shared.counters.rtcp_packets_received.load(Ordering::Relaxed),
        1
    );

    // the SSRC and NTP mapping are learned from the report
    let ingress = t.ep.ingress.lock();
    let fmt = &ingress.formats[&96];
    assert_eq!(fmt.remote_ssrc, Some(0xAABBCCDD));
    assert!(fmt.packet_ntp(90000).is_some());
}

#[tokio::test]
async fn test_write_rtcp_too_big() {
    let t = make_endpoint(None, true);

    let rr = rtcp::receiver_report::ReceiverReport {
        ssrc: 1,
        profile_extensions: Bytes::from(vec![0u8; 4096]),
        ..Default::default()
    };
    assert!(matches!(
        t.ep.shared.write_rtcp(&rr),
        Err(Error::ErrRtcpPacketTooBig(_, 2048))
    ));
    drop(t);
}

#[tokio::test]
async fn test_write_queue_full() {
    // queue of size 2, never started: the third push must fail without
    // enqueueing
    let t = make_endpoint(None, true);

    let rr = rtcp::receiver_report::ReceiverReport {
        ssrc: 1,
        ..Default::default()
    };
    t.ep.shared.write_rtcp(&rr).unwrap();
    t.ep.shared.write_rtcp(&rr).unwrap();
    assert_eq!(t.ep.shared.write_rtcp(&rr), Err(Error::ErrWriteQueueFull));

    assert!(t.writer.is_some());
}

#[tokio::test]
async fn test_write_without_writer() {
    let t = make_endpoint(None, false);
    let rr = rtcp::receiver_report::ReceiverReport {
        ssrc: 1,
        ..Default::default()
    };
    assert_eq!(t.ep.shared.write_rtcp(&rr), Err(Error::ErrInvalidState));
}
