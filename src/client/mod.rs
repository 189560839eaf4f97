#[cfg(test)]
mod client_test;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::WriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use util::sync::{Mutex, RwLock};

use crate::conn::{BoxStream, MessageReader, MessageWriter};
use crate::crypto;
use crate::description::SessionDescription;
use crate::error::{Error, Result};
use crate::headers::{
    KeyMgmt, Profile, Protocol, RtpInfo, SessionHeader, Transport, TransportMode,
};
use crate::media_endpoint::{
    now_unix_millis, Egress, GlobalTimeDecoder, MediaEndpoint, OnPacketRtcpFn, OnPacketRtpFn,
};
use crate::message::{Message, Method, Request, Response, StatusCode};
use crate::rtsp_url::RtspUrl;
use crate::transport::{UdpListener, Writer, WriterHandle};

const RECEIVER_REPORT_PERIOD: Duration = Duration::from_secs(10);
const DEFAULT_KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

pub struct ClientConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_packet_size: usize,
    pub udp_max_payload_size: usize,
    pub write_queue_size: usize,
    pub user_agent: String,
    /// Forces a transport; with `None`, UDP is tried first and TCP is used
    /// as a fallback when the server answers 461.
    pub protocol: Option<Protocol>,
    /// Required for rtsps URLs.
    pub tls_connector: Option<tokio_rustls::TlsConnector>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            max_packet_size: 2048,
            udp_max_payload_size: 1472,
            write_queue_size: 256,
            user_agent: "rtsp-rs".to_string(),
            protocol: None,
            tls_connector: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Initial,
    PrePlay,
    Play,
    PreRecord,
    Record,
}

struct ClientSetuppedMedia {
    media_idx: usize,
    endpoint: MediaEndpoint,
    udp_rtp: Option<UdpListener>,
    udp_rtcp: Option<UdpListener>,
    tcp_channel: Option<u8>,
}

struct ClientInner {
    cfg: ClientConfig,
    server_addr: SocketAddr,
    base_url: Mutex<RtspUrl>,
    conn_writer: Arc<tokio::sync::Mutex<MessageWriter<WriteHalf<BoxStream>>>>,
    channel_read_fns: Arc<Mutex<HashMap<u8, Box<dyn FnMut(&[u8]) + Send>>>>,
    pending: Arc<Mutex<HashMap<u32, oneshot::Sender<Response>>>>,
    cseq: AtomicU32,
    state: Mutex<ClientState>,
    session_id: Mutex<Option<String>>,
    session_timeout: Mutex<Option<Duration>>,
    server_supports_get_parameter: Mutex<bool>,
    protocol: Mutex<Option<Protocol>>,
    announced_desc: Mutex<Option<SessionDescription>>,
    setupped: Mutex<Vec<ClientSetuppedMedia>>,
    writer_slot: Arc<RwLock<Option<WriterHandle>>>,
    writer: Mutex<Option<Writer>>,
    time_decoder: Mutex<Option<Arc<GlobalTimeDecoder>>>,
    keepalive_close_tx: Mutex<Option<mpsc::Sender<()>>>,
    conn_close_tx: mpsc::Sender<()>,
}

/// A RTSP client, able to consume streams (DESCRIBE, SETUP, PLAY) and to
/// publish them (ANNOUNCE, SETUP, RECORD), over TCP interleaved or UDP, in
/// plain or secure profile.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connects to the host of the URL. For rtsps URLs a TLS connector must
    /// be configured.
    pub async fn connect(cfg: ClientConfig, url: &str) -> Result<Client> {
        let url = RtspUrl::parse(url)?;

        let tcp = TcpStream::connect(url.addr()).await?;
        let server_addr = tcp.peer_addr()?;
        let stream: BoxStream = if url.is_secure() {
            let connector = cfg
                .tls_connector
                .clone()
                .ok_or_else(|| Error::Io("a TLS connector is required for rtsps".into()))?;
            let server_name =
                tokio_rustls::rustls::pki_types::ServerName::try_from(url.host().to_string())
                    .map_err(|e| Error::Io(e.to_string()))?;
            Box::new(
                connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| Error::Io(e.to_string()))?,
            )
        } else {
            Box::new(tcp)
        };

        let (r, w) = tokio::io::split(stream);
        let write_timeout = cfg.write_timeout;
        let (conn_close_tx, conn_close_rx) = mpsc::channel(1);

        let protocol = cfg.protocol;
        let inner = Arc::new(ClientInner {
            cfg,
            server_addr,
            base_url: Mutex::new(url),
            conn_writer: Arc::new(tokio::sync::Mutex::new(MessageWriter::new(
                w,
                write_timeout,
            ))),
            channel_read_fns: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            cseq: AtomicU32::new(0),
            state: Mutex::new(ClientState::Initial),
            session_id: Mutex::new(None),
            session_timeout: Mutex::new(None),
            server_supports_get_parameter: Mutex::new(false),
            protocol: Mutex::new(protocol),
            announced_desc: Mutex::new(None),
            setupped: Mutex::new(Vec::new()),
            writer_slot: Arc::new(RwLock::new(None)),
            writer: Mutex::new(None),
            time_decoder: Mutex::new(None),
            keepalive_close_tx: Mutex::new(None),
            conn_close_tx,
        });

        tokio::spawn(ClientInner::read_loop(
            Arc::clone(&inner),
            MessageReader::new(r),
            conn_close_rx,
        ));

        Ok(Client { inner })
    }

    /// OPTIONS; also records whether the server supports GET_PARAMETER,
    /// used for keepalives.
    pub async fn options(&self) -> Result<Response> {
        let url = self.inner.base_url.lock().clone();
        let res = self
            .inner
            .do_request(Request::new(Method::Options, url))
            .await?;
        self.inner.check_status(&res)?;

        if let Some(public) = res.headers.get("Public") {
            *self.inner.server_supports_get_parameter.lock() =
                public.contains(Method::GetParameter.as_str());
        }
        Ok(res)
    }

    /// DESCRIBE; the returned description is used for SETUP. The base URL
    /// is updated from the Content-Base header.
    pub async fn describe(&self) -> Result<SessionDescription> {
        let url = self.inner.base_url.lock().clone();
        let mut req = Request::new(Method::Describe, url);
        req.headers.set("Accept", "application/sdp");

        let res = self.inner.do_request(req).await?;
        self.inner.check_status(&res)?;

        if let Some(base) = res.headers.get("Content-Base") {
            if let Ok(base) = RtspUrl::parse(base.trim_end_matches('/')) {
                *self.inner.base_url.lock() = base;
            }
        }

        SessionDescription::unmarshal(&res.body)
    }

    /// ANNOUNCE; switches the session towards recording.
    pub async fn announce(&self, desc: &SessionDescription) -> Result<()> {
        if *self.inner.state.lock() != ClientState::Initial {
            return Err(Error::ErrInvalidState);
        }

        // fill missing control attributes, so every media has a unique
        // SETUP URL
        let mut desc = desc.clone();
        for (i, media) in desc.medias.iter_mut().enumerate() {
            if media.control.is_empty() {
                media.control = format!("trackID={i}");
            }
        }

        let url = self.inner.base_url.lock().clone();
        let mut req = Request::new(Method::Announce, url);
        req.headers.set("Content-Type", "application/sdp");
        req.body = desc.marshal(self.inner.is_secure()).into();

        let res = self.inner.do_request(req).await?;
        self.inner.check_status(&res)?;

        *self.inner.announced_desc.lock() = Some(desc);
        *self.inner.state.lock() = ClientState::PreRecord;
        Ok(())
    }

    /// SETUP of one media of the description, negotiating the transport.
    /// While publishing, the announced description takes precedence.
    pub async fn setup(&self, desc: &SessionDescription, media_idx: usize) -> Result<()> {
        let record = *self.inner.state.lock() == ClientState::PreRecord;
        let media = if record {
            let announced = self.inner.announced_desc.lock().clone();
            announced
                .ok_or(Error::ErrInvalidState)?
                .medias
                .get(media_idx)
                .ok_or(Error::ErrMediaNotFound)?
                .clone()
        } else {
            desc.medias
                .get(media_idx)
                .ok_or(Error::ErrMediaNotFound)?
                .clone()
        };

        let forced = *self.inner.protocol.lock();
        match forced {
            Some(protocol) => {
                self.setup_with_protocol(&media, media_idx, record, protocol)
                    .await
            }
            None => {
                match self
                    .setup_with_protocol(&media, media_idx, record, Protocol::Udp)
                    .await
                {
                    Err(Error::ErrBadStatusCode(461, _)) => {
                        *self.inner.protocol.lock() = Some(Protocol::Tcp);
                        self.setup_with_protocol(&media, media_idx, record, Protocol::Tcp)
                            .await
                    }
                    other => {
                        if other.is_ok() {
                            *self.inner.protocol.lock() = Some(Protocol::Udp);
                        }
                        other
                    }
                }
            }
        }
    }

    async fn setup_with_protocol(
        &self,
        media: &crate::description::Media,
        media_idx: usize,
        record: bool,
        protocol: Protocol,
    ) -> Result<()> {
        let inner = &self.inner;
        let secure = inner.is_secure();

        let url = {
            let base = inner.base_url.lock().clone();
            base.with_control(&media.control)?
        };

        // local SSRCs, stable for the lifetime of the session
        let local_ssrcs: Vec<u32> = {
            let mut rng = rand::thread_rng();
            (0..media.formats.len()).map(|_| rng.gen()).collect()
        };

        let mut tr = Transport {
            protocol,
            profile: if secure { Profile::Savp } else { Profile::Avp },
            mode: record.then_some(TransportMode::Record),
            ..Default::default()
        };

        let mut udp_pair = None;
        let mut tcp_channel = None;
        match protocol {
            Protocol::Udp => {
                let (mut rtp_l, mut rtcp_l) =
                    UdpListener::bind_pair(IpAddr::V4(Ipv4Addr::UNSPECIFIED)).await?;
                rtp_l.start(inner.cfg.udp_max_payload_size);
                rtcp_l.start(inner.cfg.udp_max_payload_size);
                tr.client_port = Some((rtp_l.port(), rtcp_l.port()));
                udp_pair = Some((rtp_l, rtcp_l));
            }
            // the group and ports come with the response
            Protocol::UdpMulticast => {}
            Protocol::Tcp => {
                let channel = (inner.setupped.lock().len() * 2) as u8;
                tr.interleaved = Some((channel, channel + 1));
                tcp_channel = Some(channel);
            }
        }

        // outbound SRTP context, offered through MIKEY
        let mut srtp_out = None;
        let mut req_key_mgmt = None;
        if secure {
            let master = crypto::random_master();
            let ctx = crypto::Context::new(&master, &local_ssrcs, None)?;
            srtp_out = Some(Arc::new(Mutex::new(ctx)));
            let msg = crypto::MikeyMessage::new(
                &master,
                local_ssrcs.iter().map(|&s| (s, 0)).collect(),
            );
            req_key_mgmt = Some(
                KeyMgmt {
                    url: Some(url.as_str().to_string()),
                    mikey_payload: msg.marshal(),
                }
                .marshal(),
            );
        }

        let mut req = Request::new(Method::Setup, url);
        req.headers.set("Transport", tr.marshal());
        if let Some(km) = req_key_mgmt {
            req.headers.set("KeyMgmt", km);
        }

        let res = inner.do_request(req).await?;
        inner.check_status(&res)?;

        let res_tr = Transport::unmarshal(res.headers.get("Transport").ok_or_else(|| {
            Error::ErrTransportHeaderInvalid("header is missing".into())
        })?)?;

        // inbound SRTP context from the server's MIKEY answer
        let mut srtp_in = None;
        if secure {
            let raw = res.headers.get("KeyMgmt").ok_or_else(|| {
                Error::ErrInvalidKeyMgmtHeader("header is missing".into())
            })?;
            let km = KeyMgmt::unmarshal(raw)?;
            let msg = crypto::MikeyMessage::unmarshal(&km.mikey_payload)?;
            let ssrcs: Vec<u32> = msg.entries.iter().map(|(s, _)| *s).collect();
            let rocs: Vec<u32> = msg.entries.iter().map(|(_, r)| *r).collect();
            let ctx = crypto::Context::new(&msg.key, &ssrcs, Some(&rocs))?;
            srtp_in = Some(Arc::new(Mutex::new(ctx)));
        }

        let receiving = !record && !media.is_back_channel;
        let endpoint = MediaEndpoint::new(
            media_idx,
            media,
            &local_ssrcs,
            receiving,
            inner.cfg.max_packet_size,
            inner.cfg.udp_max_payload_size,
            Arc::clone(&inner.writer_slot),
            Egress::Detached,
            srtp_in,
            srtp_out,
            Arc::new(|err| log::debug!("packet decode error: {err}")),
        );

        // wire ingress and egress
        match protocol {
            Protocol::Udp => {
                let server_ip = inner.server_addr.ip();
                let (server_rtp_port, server_rtcp_port) =
                    res_tr.server_port.unwrap_or((0, 0));

                if let Some((rtp_l, rtcp_l)) = &udp_pair {
                    rtp_l.register((server_ip, server_rtp_port), endpoint.rtp_read_fn(true));
                    rtcp_l.register((server_ip, server_rtcp_port), endpoint.rtcp_read_fn());

                    endpoint.set_egress(Egress::Udp {
                        rtp_socket: rtp_l.socket(),
                        rtcp_socket: rtcp_l.socket(),
                        rtp_write_addr: SocketAddr::new(server_ip, server_rtp_port),
                        rtcp_write_addr: SocketAddr::new(server_ip, server_rtcp_port),
                    });
                }
            }
            Protocol::UdpMulticast => {
                let group = match res_tr.destination {
                    Some(IpAddr::V4(group)) => group,
                    _ => {
                        return Err(Error::ErrTransportHeaderInvalid(
                            "multicast destination is missing".into(),
                        ))
                    }
                };
                let (rtp_port, rtcp_port) = res_tr.server_port.ok_or_else(|| {
                    Error::ErrTransportHeaderInvalid("multicast ports are missing".into())
                })?;

                let mut rtp_l = UdpListener::bind_multicast(group, rtp_port).await?;
                let mut rtcp_l = UdpListener::bind_multicast(group, rtcp_port).await?;
                rtp_l.start(inner.cfg.udp_max_payload_size);
                rtcp_l.start(inner.cfg.udp_max_payload_size);

                // packets of the group come from the server's source port,
                // which is unknown; match on IP alone
                rtp_l.register_ip(inner.server_addr.ip(), endpoint.rtp_read_fn(true));
                rtcp_l.register_ip(inner.server_addr.ip(), endpoint.rtcp_read_fn());

                endpoint.set_egress(Egress::Udp {
                    rtp_socket: rtp_l.socket(),
                    rtcp_socket: rtcp_l.socket(),
                    rtp_write_addr: SocketAddr::new(group.into(), rtp_port),
                    rtcp_write_addr: SocketAddr::new(group.into(), rtcp_port),
                });

                udp_pair = Some((rtp_l, rtcp_l));
            }
            Protocol::Tcp => {
                let channel = res_tr
                    .interleaved
                    .map(|(a, _)| a)
                    .or(tcp_channel)
                    .unwrap_or(0);
                tcp_channel = Some(channel);

                let mut read_fns = inner.channel_read_fns.lock();
                read_fns.insert(channel, endpoint.rtp_read_fn(false));
                read_fns.insert(channel + 1, endpoint.rtcp_read_fn());
                drop(read_fns);

                endpoint.set_egress(Egress::Tcp {
                    conn_writer: Arc::clone(&inner.conn_writer),
                    rtp_channel: channel,
                    frame_buf: Arc::new(tokio::sync::Mutex::new(vec![
                        0u8;
                        inner.cfg.max_packet_size + 4
                    ])),
                });
            }
        }

        let (udp_rtp, udp_rtcp) = match udp_pair {
            Some((a, b)) => (Some(a), Some(b)),
            None => (None, None),
        };
        inner.setupped.lock().push(ClientSetuppedMedia {
            media_idx,
            endpoint,
            udp_rtp,
            udp_rtcp,
            tcp_channel,
        });

        let mut state = inner.state.lock();
        if *state == ClientState::Initial {
            *state = ClientState::PrePlay;
        }
        Ok(())
    }

    /// PLAY; returns the RTP-Info of the response when present.
    pub async fn play(&self) -> Result<Option<RtpInfo>> {
        let inner = &self.inner;
        if *inner.state.lock() != ClientState::PrePlay {
            return Err(Error::ErrInvalidState);
        }

        let url = inner.base_url.lock().clone();
        let mut req = Request::new(Method::Play, url);
        req.headers.set("Range", "npt=0-");

        let res = inner.do_request(req).await?;
        inner.check_status(&res)?;

        inner.start_media_plane(false);
        *inner.state.lock() = ClientState::Play;
        inner.start_keepalive();

        Ok(match res.headers.get("RTP-Info") {
            Some(raw) => RtpInfo::unmarshal(raw).ok(),
            None => None,
        })
    }

    /// RECORD; every announced media must have been set up.
    pub async fn record(&self) -> Result<()> {
        let inner = &self.inner;
        if *inner.state.lock() != ClientState::PreRecord {
            return Err(Error::ErrInvalidState);
        }

        let url = inner.base_url.lock().clone();
        let res = inner.do_request(Request::new(Method::Record, url)).await?;
        inner.check_status(&res)?;

        inner.start_media_plane(true);
        *inner.state.lock() = ClientState::Record;
        inner.start_keepalive();
        Ok(())
    }

    /// PAUSE; reverts to the state before PLAY or RECORD.
    pub async fn pause(&self) -> Result<()> {
        let inner = &self.inner;
        let state = *inner.state.lock();
        if !matches!(state, ClientState::Play | ClientState::Record) {
            return Err(Error::ErrInvalidState);
        }

        let url = inner.base_url.lock().clone();
        let res = inner.do_request(Request::new(Method::Pause, url)).await?;
        inner.check_status(&res)?;

        inner.stop_media_plane();
        *inner.state.lock() = match state {
            ClientState::Record => ClientState::PreRecord,
            _ => ClientState::PrePlay,
        };
        Ok(())
    }

    /// TEARDOWN; the session is gone afterwards, the connection stays and
    /// can start over.
    pub async fn teardown(&self) -> Result<()> {
        let inner = &self.inner;
        let url = inner.base_url.lock().clone();
        let res = inner
            .do_request(Request::new(Method::Teardown, url))
            .await?;
        inner.check_status(&res)?;

        inner.stop_media_plane();
        {
            let mut setupped = inner.setupped.lock();
            let mut read_fns = inner.channel_read_fns.lock();
            for sm in setupped.iter() {
                if let Some(c) = sm.tcp_channel {
                    read_fns.remove(&c);
                    read_fns.remove(&(c + 1));
                }
                if let Some(l) = &sm.udp_rtp {
                    l.close();
                }
                if let Some(l) = &sm.udp_rtcp {
                    l.close();
                }
            }
            setupped.clear();
        }
        *inner.state.lock() = ClientState::Initial;
        *inner.session_id.lock() = None;
        Ok(())
    }

    /// Registers a callback invoked with every RTP packet of a media and
    /// payload type.
    pub fn set_on_packet_rtp(&self, media_idx: usize, payload_type: u8, cb: OnPacketRtpFn) {
        let setupped = self.inner.setupped.lock();
        if let Some(sm) = setupped.iter().find(|sm| sm.media_idx == media_idx) {
            sm.endpoint.set_on_packet_rtp(payload_type, cb);
        }
    }

    pub fn set_on_packet_rtcp(&self, media_idx: usize, cb: OnPacketRtcpFn) {
        let setupped = self.inner.setupped.lock();
        if let Some(sm) = setupped.iter().find(|sm| sm.media_idx == media_idx) {
            sm.endpoint.set_on_packet_rtcp(cb);
        }
    }

    /// Writes a RTP packet of a media; used while recording or on
    /// back-channel medias.
    pub fn write_packet_rtp(&self, media_idx: usize, pkt: &rtp::packet::Packet) -> Result<()> {
        let setupped = self.inner.setupped.lock();
        let sm = setupped
            .iter()
            .find(|sm| sm.media_idx == media_idx)
            .ok_or(Error::ErrMediaNotFound)?;
        sm.endpoint.write_rtp(pkt)
    }

    /// Presentation timestamp of a received packet, on a timeline shared by
    /// every media of the session.
    pub fn packet_pts(&self, media_idx: usize, pkt: &rtp::packet::Packet) -> Option<Duration> {
        let decoder = self.inner.time_decoder.lock().clone()?;
        let setupped = self.inner.setupped.lock();
        let sm = setupped.iter().find(|sm| sm.media_idx == media_idx)?;
        let ntp = {
            let ingress = sm.endpoint.ingress.lock();
            ingress
                .formats
                .get(&pkt.header.payload_type)?
                .packet_ntp(pkt.header.timestamp)?
        };
        Some(decoder.pts(ntp))
    }

    pub fn bytes_received(&self) -> u64 {
        self.inner
            .setupped
            .lock()
            .iter()
            .map(|sm| sm.endpoint.shared.counters.bytes_received.load(Ordering::Relaxed))
            .sum()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.inner
            .setupped
            .lock()
            .iter()
            .map(|sm| sm.endpoint.shared.counters.bytes_sent.load(Ordering::Relaxed))
            .sum()
    }

    /// Closes the connection and every task.
    pub fn close(&self) {
        self.inner.stop_media_plane();
        let _ = self.inner.conn_close_tx.try_send(());
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

impl ClientInner {
    fn is_secure(&self) -> bool {
        self.base_url.lock().is_secure()
    }

    async fn read_loop(
        inner: Arc<ClientInner>,
        mut reader: MessageReader<tokio::io::ReadHalf<BoxStream>>,
        mut close_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                msg = reader.read_message() => {
                    let msg = match msg {
                        Ok(m) => m,
                        Err(err) => {
                            log::debug!("connection closed: {err}");
                            break;
                        }
                    };
                    match msg {
                        Message::Response(res) => {
                            if let Ok(cseq) = res.cseq() {
                                if let Some(tx) = inner.pending.lock().remove(&cseq) {
                                    let _ = tx.send(res);
                                }
                            }
                        }
                        Message::Interleaved(frame) => {
                            let mut read_fns = inner.channel_read_fns.lock();
                            if let Some(read_fn) = read_fns.get_mut(&frame.channel) {
                                read_fn(&frame.payload);
                            }
                        }
                        Message::Request(req) => {
                            // answer server-to-client requests minimally
                            let status = if req.method == Method::Options {
                                StatusCode::OK
                            } else {
                                StatusCode::NOT_IMPLEMENTED
                            };
                            let mut res = Response::new(status);
                            if let Some(cseq) = req.headers.get("CSeq") {
                                res.headers.set("CSeq", cseq.to_string());
                            }
                            let writer = Arc::clone(&inner.conn_writer);
                            tokio::spawn(async move {
                                let _ = writer.lock().await.write_response(&res).await;
                            });
                        }
                    }
                }
                _ = close_rx.recv() => break,
            }
        }

        // unblock every caller waiting for a response
        inner.pending.lock().clear();
    }

    async fn do_request(&self, mut req: Request) -> Result<Response> {
        let cseq = self.cseq.fetch_add(1, Ordering::Relaxed) + 1;
        req.headers.set("CSeq", cseq.to_string());
        req.headers.set("User-Agent", self.cfg.user_agent.clone());
        if let Some(id) = self.session_id.lock().clone() {
            req.headers.set("Session", id);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(cseq, tx);

        self.conn_writer.lock().await.write_request(&req).await?;

        let res = match tokio::time::timeout(self.cfg.read_timeout, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => return Err(Error::Io("connection closed".into())),
            Err(_) => {
                self.pending.lock().remove(&cseq);
                return Err(Error::Io("request timed out".into()));
            }
        };

        if let Some(raw) = res.headers.get("Session") {
            if let Ok(sh) = SessionHeader::unmarshal(raw) {
                *self.session_id.lock() = Some(sh.id);
                if let Some(secs) = sh.timeout {
                    *self.session_timeout.lock() = Some(Duration::from_secs(secs));
                }
            }
        }

        Ok(res)
    }

    fn check_status(&self, res: &Response) -> Result<()> {
        if !res.status.is_success() {
            return Err(Error::ErrBadStatusCode(
                res.status.0,
                res.status.reason().to_string(),
            ));
        }
        Ok(())
    }

    /// Creates and starts the writer, the RTCP report tasks and the time
    /// decoder.
    fn start_media_plane(&self, record: bool) {
        let queue_size = if record { 8 } else { self.cfg.write_queue_size };
        let (mut writer, _error_rx) = Writer::new(queue_size);
        *self.writer_slot.write() = Some(writer.handle());
        writer.start();
        *self.writer.lock() = Some(writer);

        *self.time_decoder.lock() = Some(Arc::new(GlobalTimeDecoder::new()));

        let now = now_unix_millis();
        for sm in self.setupped.lock().iter() {
            sm.endpoint
                .shared
                .last_packet_time
                .store(now, Ordering::Relaxed);
            sm.endpoint.start_rtcp_tasks(RECEIVER_REPORT_PERIOD);
        }
    }

    fn stop_media_plane(&self) {
        for sm in self.setupped.lock().iter() {
            sm.endpoint.stop();
        }
        *self.writer_slot.write() = None;
        *self.writer.lock() = None;
        *self.time_decoder.lock() = None;
        if let Some(tx) = self.keepalive_close_tx.lock().take() {
            let _ = tx.try_send(());
        }
    }

    /// Periodic GET_PARAMETER (or OPTIONS) at half the negotiated session
    /// timeout, to keep UDP sessions alive.
    fn start_keepalive(self: &Arc<Self>) {
        let period = self
            .session_timeout
            .lock()
            .map(|t| t / 2)
            .unwrap_or(DEFAULT_KEEPALIVE_PERIOD)
            .max(Duration::from_millis(100));

        let (close_tx, mut close_rx) = mpsc::channel(1);
        *self.keepalive_close_tx.lock() = Some(close_tx);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let url = inner.base_url.lock().clone();
                        let method = if *inner.server_supports_get_parameter.lock() {
                            Method::GetParameter
                        } else {
                            Method::Options
                        };
                        if inner.do_request(Request::new(method, url)).await.is_err() {
                            break;
                        }
                    }
                    _ = close_rx.recv() => break,
                }
            }
        });
    }
}
