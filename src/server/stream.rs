use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use rand::Rng;
use tokio::sync::watch;
use util::marshal::Marshal;
use util::sync::{Mutex, RwLock};

use super::multicast::MulticastWriter;
use super::session::{ServerSession, SessionShared};
use super::ServerInner;
use crate::crypto;
use crate::description::SessionDescription;
use crate::error::{Error, Result};
use crate::headers::Protocol;
use crate::media_endpoint::{MediaShared, RtcpSender};
use crate::transport::UdpReadFn;

const SENDER_REPORT_PERIOD: Duration = Duration::from_secs(10);

pub(crate) struct StreamFormat {
    pub local_ssrc: u32,
    pub rtcp_sender: Mutex<RtcpSender>,
}

pub(crate) struct StreamMedia {
    pub formats: HashMap<u8, StreamFormat>,
    pub multicast: Mutex<Option<MulticastWriter>>,
}

struct ReaderEntry {
    session: Weak<SessionShared>,
    protocol: Protocol,
    peer: Option<(IpAddr, u16)>,
}

struct ActiveReader {
    session: Weak<SessionShared>,
    medias: Vec<Option<Arc<MediaShared>>>,
}

struct StreamState {
    closed: bool,
    readers: HashMap<String, ReaderEntry>,
    active_unicast: HashMap<String, ActiveReader>,
    multicast_reader_count: usize,
}

pub(crate) struct StreamInner {
    server: Arc<ServerInner>,
    desc: SessionDescription,
    pub srtp_master: Option<Vec<u8>>,
    pub srtp_out: Option<Arc<Mutex<crypto::Context>>>,
    medias: Vec<StreamMedia>,
    state: RwLock<StreamState>,
    sr_close_tx: watch::Sender<bool>,
}

/// The authoritative publishing entity of the server: a single writer
/// distributing RTP/RTCP packets to every attached reader session, unicast
/// or multicast.
pub struct ServerStream {
    pub(crate) inner: Arc<StreamInner>,
}

impl ServerStream {
    /// Creates a stream serving the given description. Media controls are
    /// rewritten to `trackID=n` and each format gets a stream-unique SSRC.
    pub fn new(server: &super::Server, mut desc: SessionDescription) -> Arc<ServerStream> {
        for (i, media) in desc.medias.iter_mut().enumerate() {
            media.control = format!("trackID={i}");
        }

        let server = Arc::clone(&server.inner);

        let mut used_ssrcs = Vec::new();
        let mut rng = rand::thread_rng();
        let medias: Vec<StreamMedia> = desc
            .medias
            .iter()
            .map(|m| {
                let formats = m
                    .formats
                    .iter()
                    .map(|f| {
                        let mut ssrc: u32 = rng.gen();
                        while used_ssrcs.contains(&ssrc) {
                            ssrc = rng.gen();
                        }
                        used_ssrcs.push(ssrc);
                        (
                            f.payload_type,
                            StreamFormat {
                                local_ssrc: ssrc,
                                rtcp_sender: Mutex::new(RtcpSender::new(f.clock_rate, ssrc)),
                            },
                        )
                    })
                    .collect();
                StreamMedia {
                    formats,
                    multicast: Mutex::new(None),
                }
            })
            .collect();

        let (srtp_master, srtp_out) = if server.secure() {
            let master = crypto::random_master();
            let ctx = crypto::Context::new(&master, &used_ssrcs, None)
                .expect("master has the right length");
            (Some(master), Some(Arc::new(Mutex::new(ctx))))
        } else {
            (None, None)
        };

        let (sr_close_tx, mut sr_close_rx) = watch::channel(false);

        let inner = Arc::new(StreamInner {
            server,
            desc,
            srtp_master,
            srtp_out,
            medias,
            state: RwLock::new(StreamState {
                closed: false,
                readers: HashMap::new(),
                active_unicast: HashMap::new(),
                multicast_reader_count: 0,
            }),
            sr_close_tx,
        });

        // periodic sender reports towards every reader
        let sr_inner = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SENDER_REPORT_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let inner = match sr_inner.upgrade() {
                            Some(i) => i,
                            None => break,
                        };
                        inner.emit_sender_reports();
                    }
                    _ = sr_close_rx.changed() => break,
                }
            }
        });

        Arc::new(ServerStream { inner })
    }

    pub fn description(&self) -> &SessionDescription {
        &self.inner.desc
    }

    /// Writes a RTP packet to every active reader, stamping the current
    /// wall clock into the sender-report bookkeeping.
    pub fn write_packet_rtp(&self, media_idx: usize, pkt: &rtp::packet::Packet) -> Result<()> {
        self.write_packet_rtp_with_ntp(media_idx, pkt, SystemTime::now())
    }

    /// Like [`ServerStream::write_packet_rtp`], with an explicit wall clock
    /// of the packet, used for NTP/RTP synchronization.
    pub fn write_packet_rtp_with_ntp(
        &self,
        media_idx: usize,
        pkt: &rtp::packet::Packet,
        ntp: SystemTime,
    ) -> Result<()> {
        let state = self.inner.state.read();
        if state.closed {
            return Err(Error::ErrStreamClosed);
        }

        let media = self
            .inner
            .medias
            .get(media_idx)
            .ok_or(Error::ErrMediaNotFound)?;
        let fmt = media
            .formats
            .get(&pkt.header.payload_type)
            .ok_or(Error::ErrUnknownPayloadType(pkt.header.payload_type))?;

        let mut header = pkt.header.clone();
        header.ssrc = fmt.local_ssrc;
        fmt.rtcp_sender
            .lock()
            .process_rtp(ntp, &header, pkt.payload.len());

        let out = rtp::packet::Packet {
            header,
            payload: pkt.payload.clone(),
        };
        let data = out
            .marshal()
            .map_err(|e| Error::ErrRtpDecode(e.to_string()))?;

        let overhead = if self.inner.srtp_out.is_some() {
            crypto::SRTP_OVERHEAD
        } else {
            0
        };
        let max_plain = self.inner.server.cfg.max_packet_size - overhead;
        if data.len() > max_plain {
            return Err(Error::ErrRtpPacketTooBig(data.len(), max_plain));
        }

        let data = match &self.inner.srtp_out {
            Some(ctx) => Bytes::from(ctx.lock().encrypt_rtp(&data)?),
            None => data,
        };

        self.inner.distribute(&state, media_idx, data, false);
        Ok(())
    }

    /// Writes a RTCP packet to every active reader.
    pub fn write_packet_rtcp(
        &self,
        media_idx: usize,
        pkt: &(dyn rtcp::packet::Packet + Send + Sync),
    ) -> Result<()> {
        let state = self.inner.state.read();
        if state.closed {
            return Err(Error::ErrStreamClosed);
        }
        if media_idx >= self.inner.medias.len() {
            return Err(Error::ErrMediaNotFound);
        }

        let data = pkt
            .marshal()
            .map_err(|e| Error::ErrRtcpDecode(e.to_string()))?;
        let data = match &self.inner.srtp_out {
            Some(ctx) => Bytes::from(ctx.lock().encrypt_rtcp(&data)?),
            None => data,
        };

        self.inner.distribute(&state, media_idx, data, true);
        Ok(())
    }

    /// Closes the stream: pending readers are force-closed and subsequent
    /// writes fail deterministically. Closing twice is a no-op.
    pub fn close(&self) {
        let sessions: Vec<_> = {
            let mut state = self.inner.state.write();
            if state.closed {
                return;
            }
            state.closed = true;
            state.active_unicast.clear();
            state
                .readers
                .drain()
                .filter_map(|(_, r)| r.session.upgrade())
                .collect()
        };

        let _ = self.inner.sr_close_tx.send(true);

        for media in &self.inner.medias {
            *media.multicast.lock() = None;
        }

        for session in sessions {
            session.close(Error::ErrStreamClosed);
        }
    }

    // session-facing API

    /// Registers a reader. For the first multicast reader, the multicast
    /// writers are instantiated; for UDP unicast, the client's ports are
    /// checked against other readers on the same peer.
    pub(crate) async fn attach(
        &self,
        session: &Arc<SessionShared>,
        protocol: Protocol,
        peer: Option<(IpAddr, u16)>,
    ) -> Result<()> {
        {
            let state = self.inner.state.read();
            if state.closed {
                return Err(Error::ErrStreamClosed);
            }
            if protocol == Protocol::Udp {
                if let Some(peer) = &peer {
                    let in_use = state
                        .readers
                        .values()
                        .any(|r| r.protocol == Protocol::Udp && r.peer.as_ref() == Some(peer));
                    if in_use {
                        return Err(Error::ErrUdpPortsAlreadyInUse);
                    }
                }
            }
        }

        if protocol == Protocol::UdpMulticast {
            let needs_writers = {
                let state = self.inner.state.read();
                state.multicast_reader_count == 0
                    && !state
                        .readers
                        .values()
                        .any(|r| r.protocol == Protocol::UdpMulticast)
            };
            if needs_writers {
                for media in &self.inner.medias {
                    let exists = media.multicast.lock().is_some();
                    if !exists {
                        let writer = MulticastWriter::new(&self.inner.server).await?;
                        *media.multicast.lock() = Some(writer);
                    }
                }
            }
        }

        let mut state = self.inner.state.write();
        if state.closed {
            return Err(Error::ErrStreamClosed);
        }
        if protocol == Protocol::UdpMulticast {
            state.multicast_reader_count += 1;
        }
        state.readers.insert(
            session.secret_id.clone(),
            ReaderEntry {
                session: Arc::downgrade(session),
                protocol,
                peer,
            },
        );
        Ok(())
    }

    /// Unregisters a reader. The multicast writers are destroyed when the
    /// last multicast reader detaches.
    pub(crate) fn detach(&self, session_id: &str) {
        let drop_multicast = {
            let mut state = self.inner.state.write();
            state.active_unicast.remove(session_id);
            match state.readers.remove(session_id) {
                Some(r) if r.protocol == Protocol::UdpMulticast => {
                    state.multicast_reader_count -= 1;
                    state.multicast_reader_count == 0
                }
                _ => false,
            }
        };

        if drop_multicast {
            for media in &self.inner.medias {
                *media.multicast.lock() = None;
            }
        }
    }

    /// Marks a unicast reader as playing; published packets start flowing
    /// into its writer.
    pub(crate) fn activate_unicast(
        &self,
        session: &Arc<SessionShared>,
        medias: Vec<Option<Arc<MediaShared>>>,
    ) {
        let mut state = self.inner.state.write();
        state.active_unicast.insert(
            session.secret_id.clone(),
            ActiveReader {
                session: Arc::downgrade(session),
                medias,
            },
        );
    }

    /// Marks a multicast reader as playing, registering its RTCP read
    /// callbacks at the multicast RTCP listeners, keyed by the peer IP.
    pub(crate) fn activate_multicast(
        &self,
        peer_ip: IpAddr,
        mut rtcp_read_fns: Vec<(usize, UdpReadFn)>,
    ) {
        let _state = self.inner.state.write();
        for (media_idx, read_fn) in rtcp_read_fns.drain(..) {
            if let Some(mw) = &*self.inner.medias[media_idx].multicast.lock() {
                mw.register_reader(peer_ip, read_fn);
            }
        }
    }

    pub(crate) fn deactivate(&self, session_id: &str, multicast_peer_ip: Option<IpAddr>) {
        let mut state = self.inner.state.write();
        state.active_unicast.remove(session_id);
        if let Some(ip) = multicast_peer_ip {
            for media in &self.inner.medias {
                if let Some(mw) = &*media.multicast.lock() {
                    mw.unregister_reader(&ip);
                }
            }
        }
    }

    pub(crate) fn multicast_params(&self, media_idx: usize) -> Option<(Ipv4Addr, u16, u16)> {
        self.inner.medias[media_idx]
            .multicast
            .lock()
            .as_ref()
            .map(|mw| (mw.group, mw.rtp_port, mw.rtcp_port))
    }

    /// SSRCs of a media, in format order.
    pub(crate) fn local_ssrcs(&self, media_idx: usize) -> Vec<u32> {
        self.inner.desc.medias[media_idx]
            .formats
            .iter()
            .map(|f| self.inner.medias[media_idx].formats[&f.payload_type].local_ssrc)
            .collect()
    }

    /// (next sequence number, projected timestamp) for the RTP-Info entry
    /// of a media, defined only for single-format medias that have already
    /// sent a packet.
    pub(crate) fn rtp_info_entry(&self, media_idx: usize) -> Option<(u16, u32)> {
        let media = &self.inner.medias[media_idx];
        if media.formats.len() != 1 {
            return None;
        }
        let fmt = media.formats.values().next()?;
        fmt.rtcp_sender.lock().rtp_info_entry(SystemTime::now())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.state.read().closed
    }

    pub(crate) fn ptr_eq(&self, other: &ServerStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl StreamInner {
    /// Fans prepared wire data out to every active reader. A single
    /// reader's failure is reported and skipped; the stream is unaffected.
    fn distribute(&self, state: &StreamState, media_idx: usize, data: Bytes, rtcp: bool) {
        for reader in state.active_unicast.values() {
            let shared = match reader.medias.get(media_idx) {
                Some(Some(shared)) => shared,
                _ => continue,
            };
            let res = if rtcp {
                shared.queue_rtcp(data.clone())
            } else {
                shared.queue_rtp(data.clone())
            };
            if let Err(err) = res {
                log::warn!("unable to write to reader: {err}");
                if let Some(cb) = &self.server.cfg.handlers.on_stream_write_error {
                    if let Some(session) = reader.session.upgrade() {
                        cb(&ServerSession::from_shared(session), &err);
                    }
                }
            }
        }

        if let Some(mw) = &*self.medias[media_idx].multicast.lock() {
            if let Err(err) = mw.queue(data, rtcp) {
                log::warn!("unable to write to multicast group: {err}");
            }
        }
    }

    fn emit_sender_reports(&self) {
        let now = SystemTime::now();
        let state = self.state.read();
        if state.closed {
            return;
        }

        for (media_idx, media) in self.medias.iter().enumerate() {
            for fmt in media.formats.values() {
                let sr = {
                    let sender = fmt.rtcp_sender.lock();
                    if !sender.initialized() {
                        continue;
                    }
                    sender.generate_report(now)
                };

                let data = match sr.marshal() {
                    Ok(d) => d,
                    Err(_) => continue,
                };
                let data = match &self.srtp_out {
                    Some(ctx) => match ctx.lock().encrypt_rtcp(&data) {
                        Ok(d) => Bytes::from(d),
                        Err(_) => continue,
                    },
                    None => data,
                };

                self.distribute(&state, media_idx, data, true);
            }
        }
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        let _ = self.sr_close_tx.send(true);
    }
}
