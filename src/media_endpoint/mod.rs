#[cfg(test)]
mod media_endpoint_test;

mod format;
mod rtcp_receiver;
mod rtcp_sender;
mod time_decoder;

pub(crate) use format::FormatEndpoint;
pub(crate) use rtcp_sender::RtcpSender;
pub(crate) use time_decoder::GlobalTimeDecoder;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use util::marshal::{Marshal, Unmarshal};
use util::sync::{Mutex, RwLock};

use crate::conn::{BoxStream, MessageWriter};
use crate::crypto;
use crate::description::Media;
use crate::error::{Error, Result};
use crate::message::InterleavedFrame;
use crate::transport::{WriteJob, WriterHandle};

/// Called with every valid RTP packet of a format, on the read task.
pub type OnPacketRtpFn = Box<dyn FnMut(rtp::packet::Packet) + Send>;
/// Called with every valid RTCP packet of a media, on the read task.
pub type OnPacketRtcpFn = Box<dyn FnMut(Box<dyn rtcp::packet::Packet + Send + Sync>) + Send>;
/// Called with every packet-level decode error; these never close the
/// session.
pub type OnDecodeErrorFn = Arc<dyn Fn(&Error) + Send + Sync>;

pub(crate) fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Atomic per-media counters; session-level getters aggregate them.
#[derive(Default)]
pub(crate) struct MediaCounters {
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub rtp_packets_received: AtomicU64,
    pub rtp_packets_sent: AtomicU64,
    pub rtcp_packets_received: AtomicU64,
    pub rtcp_packets_sent: AtomicU64,
    pub rtp_packets_in_error: AtomicU64,
    pub rtcp_packets_in_error: AtomicU64,
    pub rtp_packets_lost: AtomicU64,
}

/// Where outbound packets of a media go. Bound when the session enters
/// Play or Record, cleared when it leaves.
pub(crate) enum Egress {
    /// Not bound to any transport; writes fail.
    Detached,
    /// Interleaved frames on the session's bound TCP connection. The frame
    /// buffer is shared across the session's medias and reused for every
    /// frame; jobs run serialized on the writer task.
    Tcp {
        conn_writer: Arc<tokio::sync::Mutex<MessageWriter<tokio::io::WriteHalf<BoxStream>>>>,
        rtp_channel: u8,
        frame_buf: Arc<tokio::sync::Mutex<Vec<u8>>>,
    },
    /// Fire-and-forget datagrams to the addresses recorded at SETUP.
    Udp {
        rtp_socket: Arc<UdpSocket>,
        rtcp_socket: Arc<UdpSocket>,
        rtp_write_addr: SocketAddr,
        rtcp_write_addr: SocketAddr,
    },
}

/// State mutated on the read path, behind a short-lived lock.
pub(crate) struct MediaIngress {
    pub formats: HashMap<u8, FormatEndpoint>,
    pub srtp_in: Option<Arc<Mutex<crypto::Context>>>,
    pub on_packet_rtcp: Option<OnPacketRtcpFn>,
}

/// Immutable wiring plus atomics, shared with read closures and write jobs.
pub(crate) struct MediaShared {
    pub media_idx: usize,
    pub max_packet_size: usize,
    pub udp_max_payload_size: usize,
    pub writer: Arc<RwLock<Option<WriterHandle>>>,
    pub egress: RwLock<Egress>,
    pub srtp_out: Option<Arc<Mutex<crypto::Context>>>,
    pub counters: MediaCounters,
    pub last_packet_time: AtomicU64,
    pub on_decode_error: OnDecodeErrorFn,
}

impl MediaShared {
    fn queue(&self, data: Bytes, rtcp: bool) -> Result<()> {
        let handle = self
            .writer
            .read()
            .as_ref()
            .cloned()
            .ok_or(Error::ErrInvalidState)?;

        let len = data.len() as u64;

        let egress = self.egress.read();
        let job = match &*egress {
            Egress::Detached => return Err(Error::ErrInvalidState),
            Egress::Tcp {
                conn_writer,
                rtp_channel,
                frame_buf,
            } => {
                let conn_writer = Arc::clone(conn_writer);
                let frame_buf = Arc::clone(frame_buf);
                let channel = if rtcp { rtp_channel + 1 } else { *rtp_channel };
                WriteJob(Box::new(move || {
                    Box::pin(async move {
                        let mut w = conn_writer.lock().await;
                        let mut buf = frame_buf.lock().await;
                        let frame = InterleavedFrame {
                            channel,
                            payload: data,
                        };
                        if buf.len() < frame.payload.len() + 4 {
                            buf.resize(frame.payload.len() + 4, 0);
                        }
                        let n = frame.marshal_to(&mut buf);
                        w.write_interleaved_frame(&buf[..n]).await
                    })
                }))
            }
            Egress::Udp {
                rtp_socket,
                rtcp_socket,
                rtp_write_addr,
                rtcp_write_addr,
            } => {
                let (socket, addr) = if rtcp {
                    (Arc::clone(rtcp_socket), *rtcp_write_addr)
                } else {
                    (Arc::clone(rtp_socket), *rtp_write_addr)
                };
                WriteJob(Box::new(move || {
                    Box::pin(async move {
                        let _ = socket.send_to(&data, addr).await;
                        Ok(())
                    })
                }))
            }
        };
        drop(egress);

        handle.push(job)?;

        self.counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
        if rtcp {
            self.counters.rtcp_packets_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.rtp_packets_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Enqueues already marshaled (and, for secure sessions, already
    /// encrypted) RTP data.
    pub fn queue_rtp(&self, data: Bytes) -> Result<()> {
        self.queue(data, false)
    }

    pub fn queue_rtcp(&self, data: Bytes) -> Result<()> {
        self.queue(data, true)
    }

    /// Marshals, bounds-checks, optionally encrypts and enqueues a RTCP
    /// packet.
    pub fn write_rtcp(&self, pkt: &(dyn rtcp::packet::Packet + Send + Sync)) -> Result<()> {
        let data = pkt
            .marshal()
            .map_err(|e| Error::ErrRtcpDecode(e.to_string()))?;

        let overhead = if self.srtp_out.is_some() {
            crypto::SRTCP_OVERHEAD
        } else {
            0
        };
        let max_plain = self.max_packet_size - overhead;
        if data.len() > max_plain {
            return Err(Error::ErrRtcpPacketTooBig(data.len(), max_plain));
        }

        let data = match &self.srtp_out {
            Some(ctx) => Bytes::from(ctx.lock().encrypt_rtcp(&data)?),
            None => data,
        };

        self.queue_rtcp(data)
    }
}

/// A media endpoint: per-media ingress decoding and egress queueing, across
/// the transport (TCP/UDP), role (receive/send) and protection
/// (plain/secure) dimensions.
#[derive(Clone)]
pub(crate) struct MediaEndpoint {
    pub shared: Arc<MediaShared>,
    pub ingress: Arc<Mutex<MediaIngress>>,
    rtcp_task_close: Arc<Mutex<Vec<mpsc::Sender<()>>>>,
}

impl MediaEndpoint {
    /// Builds the endpoint for one media. `receiving` selects whether
    /// inbound RTP is expected (and receiver reports are emitted) or
    /// outbound RTP is produced (and sender reports are emitted);
    /// back-channel medias invert the session's role before calling this.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        media_idx: usize,
        media: &Media,
        local_ssrcs: &[u32],
        receiving: bool,
        max_packet_size: usize,
        udp_max_payload_size: usize,
        writer: Arc<RwLock<Option<WriterHandle>>>,
        egress: Egress,
        srtp_in: Option<Arc<Mutex<crypto::Context>>>,
        srtp_out: Option<Arc<Mutex<crypto::Context>>>,
        on_decode_error: OnDecodeErrorFn,
    ) -> MediaEndpoint {
        let mut formats = HashMap::new();
        for (i, f) in media.formats.iter().enumerate() {
            let ssrc = local_ssrcs[i];
            let endpoint = if receiving {
                FormatEndpoint::new_receiver(f.clone(), ssrc)
            } else {
                FormatEndpoint::new_sender(f.clone(), ssrc)
            };
            formats.insert(f.payload_type, endpoint);
        }

        MediaEndpoint {
            shared: Arc::new(MediaShared {
                media_idx,
                max_packet_size,
                udp_max_payload_size,
                writer,
                egress: RwLock::new(egress),
                srtp_out,
                counters: MediaCounters::default(),
                last_packet_time: AtomicU64::new(now_unix_millis()),
                on_decode_error,
            }),
            ingress: Arc::new(Mutex::new(MediaIngress {
                formats,
                srtp_in,
                on_packet_rtcp: None,
            })),
            rtcp_task_close: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Binds the egress transport; called on the transition into Play or
    /// Record.
    pub fn set_egress(&self, egress: Egress) {
        *self.shared.egress.write() = egress;
    }

    /// Unbinds the egress transport; called on the transition out of Play
    /// or Record.
    pub fn clear_egress(&self) {
        *self.shared.egress.write() = Egress::Detached;
    }

    pub fn set_on_packet_rtp(&self, payload_type: u8, cb: OnPacketRtpFn) {
        if let Some(fmt) = self.ingress.lock().formats.get_mut(&payload_type) {
            fmt.on_packet_rtp = Some(cb);
        }
    }

    pub fn set_on_packet_rtcp(&self, cb: OnPacketRtcpFn) {
        self.ingress.lock().on_packet_rtcp = Some(cb);
    }

    /// Read callback for the RTP channel or socket of this media.
    pub fn rtp_read_fn(&self, is_udp: bool) -> Box<dyn FnMut(&[u8]) + Send> {
        let ep = self.clone();
        Box::new(move |payload| ep.read_rtp(payload, is_udp))
    }

    /// Read callback for the RTCP channel or socket of this media.
    pub fn rtcp_read_fn(&self) -> Box<dyn FnMut(&[u8]) + Send> {
        let ep = self.clone();
        Box::new(move |payload| ep.read_rtcp(payload))
    }

    pub fn read_rtp(&self, payload: &[u8], is_udp: bool) {
        let shared = &self.shared;
        let counters = &shared.counters;

        counters
            .bytes_received
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        shared
            .last_packet_time
            .store(now_unix_millis(), Ordering::Relaxed);

        if is_udp && payload.len() > shared.udp_max_payload_size {
            counters.rtp_packets_in_error.fetch_add(1, Ordering::Relaxed);
            (shared.on_decode_error)(&Error::ErrRtpPacketTooBigUdp);
            return;
        }

        let mut ingress = self.ingress.lock();

        let decrypted;
        let plain: &[u8] = match &ingress.srtp_in {
            Some(ctx) => match ctx.lock().decrypt_rtp(payload) {
                Ok(d) => {
                    decrypted = d;
                    &decrypted
                }
                Err(err) => {
                    counters.rtp_packets_in_error.fetch_add(1, Ordering::Relaxed);
                    (shared.on_decode_error)(&err);
                    return;
                }
            },
            None => payload,
        };

        let pkt = match rtp::packet::Packet::unmarshal(&mut &plain[..]) {
            Ok(pkt) => pkt,
            Err(e) => {
                counters.rtp_packets_in_error.fetch_add(1, Ordering::Relaxed);
                (shared.on_decode_error)(&Error::ErrRtpDecode(e.to_string()));
                return;
            }
        };

        let fmt = match ingress.formats.get_mut(&pkt.header.payload_type) {
            Some(fmt) => fmt,
            None => {
                counters.rtp_packets_in_error.fetch_add(1, Ordering::Relaxed);
                (shared.on_decode_error)(&Error::ErrUnknownPayloadType(
                    pkt.header.payload_type,
                ));
                return;
            }
        };

        counters.rtp_packets_received.fetch_add(1, Ordering::Relaxed);
        fmt.process_rtp(SystemTime::now(), pkt);
    }

    pub fn read_rtcp(&self, payload: &[u8]) {
        let shared = &self.shared;
        let counters = &shared.counters;

        counters
            .bytes_received
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        shared
            .last_packet_time
            .store(now_unix_millis(), Ordering::Relaxed);

        if payload.len() > shared.udp_max_payload_size {
            counters
                .rtcp_packets_in_error
                .fetch_add(1, Ordering::Relaxed);
            (shared.on_decode_error)(&Error::ErrRtcpPacketTooBig(
                payload.len(),
                shared.udp_max_payload_size,
            ));
            return;
        }

        let mut ingress = self.ingress.lock();

        let decrypted;
        let plain: &[u8] = match &ingress.srtp_in {
            Some(ctx) => match ctx.lock().decrypt_rtcp(payload) {
                Ok(d) => {
                    decrypted = d;
                    &decrypted
                }
                Err(err) => {
                    counters
                        .rtcp_packets_in_error
                        .fetch_add(1, Ordering::Relaxed);
                    (shared.on_decode_error)(&err);
                    return;
                }
            },
            None => payload,
        };

        let packets = match rtcp::packet::unmarshal(&mut &plain[..]) {
            Ok(packets) => packets,
            Err(e) => {
                counters
                    .rtcp_packets_in_error
                    .fetch_add(1, Ordering::Relaxed);
                (shared.on_decode_error)(&Error::ErrRtcpDecode(e.to_string()));
                return;
            }
        };

        counters
            .rtcp_packets_received
            .fetch_add(packets.len() as u64, Ordering::Relaxed);

        let now = SystemTime::now();
        for pkt in packets {
            if let Some(sr) = pkt
                .as_any()
                .downcast_ref::<rtcp::sender_report::SenderReport>()
            {
                let has_match = ingress
                    .formats
                    .values()
                    .any(|f| f.remote_ssrc == Some(sr.ssrc));
                let fmt = if has_match {
                    ingress
                        .formats
                        .values_mut()
                        .find(|f| f.remote_ssrc == Some(sr.ssrc))
                } else {
                    // learn the remote SSRC when it is not ambiguous
                    let mut unset = ingress
                        .formats
                        .values_mut()
                        .filter(|f| f.remote_ssrc.is_none());
                    match (unset.next(), unset.next()) {
                        (Some(f), None) => Some(f),
                        _ => None,
                    }
                };
                if let Some(fmt) = fmt {
                    fmt.process_sender_report(now, sr);
                }
            }

            if let Some(cb) = &mut ingress.on_packet_rtcp {
                cb(pkt);
            }
        }
    }

    /// Marshals, bounds-checks, optionally encrypts and enqueues a RTP
    /// packet, updating the sender-report bookkeeping.
    pub fn write_rtp(&self, pkt: &rtp::packet::Packet) -> Result<()> {
        let data = pkt
            .marshal()
            .map_err(|e| Error::ErrRtpDecode(e.to_string()))?;

        let overhead = if self.shared.srtp_out.is_some() {
            crypto::SRTP_OVERHEAD
        } else {
            0
        };
        let max_plain = self.shared.max_packet_size - overhead;
        if data.len() > max_plain {
            return Err(Error::ErrRtpPacketTooBig(data.len(), max_plain));
        }

        {
            let mut ingress = self.ingress.lock();
            if let Some(fmt) = ingress.formats.get_mut(&pkt.header.payload_type) {
                if let Some(sender) = &mut fmt.rtcp_sender {
                    sender.process_rtp(SystemTime::now(), &pkt.header, pkt.payload.len());
                }
            }
        }

        let data = match &self.shared.srtp_out {
            Some(ctx) => Bytes::from(ctx.lock().encrypt_rtp(&data)?),
            None => data,
        };

        self.shared.queue_rtp(data)
    }

    /// Spawns the periodic RTCP report tasks of every format.
    pub fn start_rtcp_tasks(&self, period: Duration) {
        let payload_types: Vec<u8> = self.ingress.lock().formats.keys().copied().collect();

        for pt in payload_types {
            let (close_tx, mut close_rx) = mpsc::channel::<()>(1);
            self.rtcp_task_close.lock().push(close_tx);

            let shared = Arc::clone(&self.shared);
            let ingress = Arc::clone(&self.ingress);

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                interval.tick().await;

                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let report: Option<Box<dyn rtcp::packet::Packet + Send + Sync>> = {
                                let mut ingress = ingress.lock();
                                let fmt = match ingress.formats.get_mut(&pt) {
                                    Some(f) => f,
                                    None => break,
                                };

                                if let Some(receiver) = &mut fmt.rtcp_receiver {
                                    match fmt.remote_ssrc {
                                        Some(remote) => {
                                            let r = receiver
                                                .generate_report(SystemTime::now(), remote);
                                            shared.counters.rtp_packets_lost.store(
                                                receiver.total_lost() as u64,
                                                Ordering::Relaxed,
                                            );
                                            Some(Box::new(r))
                                        }
                                        None => None,
                                    }
                                } else if let Some(sender) = &fmt.rtcp_sender {
                                    sender
                                        .initialized()
                                        .then(|| {
                                            Box::new(sender.generate_report(SystemTime::now()))
                                                as Box<dyn rtcp::packet::Packet + Send + Sync>
                                        })
                                } else {
                                    None
                                }
                            };

                            if let Some(report) = report {
                                if let Err(err) = shared.write_rtcp(&*report) {
                                    log::debug!("unable to write RTCP report: {err}");
                                }
                            }
                        }
                        _ = close_rx.recv() => break,
                    }
                }
            });
        }
    }

    /// Stops the periodic report tasks.
    pub fn stop(&self) {
        for tx in self.rtcp_task_close.lock().drain(..) {
            let _ = tx.try_send(());
        }
    }
}
