use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use util::sync::{Mutex, RwLock};

use super::conn::ConnShared;
use super::stream::ServerStream;
use super::{AnnounceContext, ServerInner, SessionContext, SetupContext};
use crate::crypto;
use crate::description::SessionDescription;
use crate::error::Error;
use crate::headers::{KeyMgmt, Profile, Protocol, RtpInfo, RtpInfoEntry, SessionHeader, Transport};
use crate::media_endpoint::{
    now_unix_millis, Egress, GlobalTimeDecoder, MediaEndpoint, OnDecodeErrorFn,
};
use crate::message::{Method, Request, Response, StatusCode};
use crate::transport::{Writer, WriterHandle};

const RECEIVER_REPORT_PERIOD: Duration = Duration::from_secs(10);
const RECORD_WRITE_QUEUE_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    PrePlay,
    Play,
    PreRecord,
    Record,
}

/// Signal returned beside a response, telling the connection how to adjust
/// its read loop after the response is written.
pub(crate) enum HandleAction {
    None,
    SwitchToInterleaved,
    SwitchFromInterleaved,
    TearDown,
}

pub(crate) struct SessionJob {
    pub conn: Arc<ConnShared>,
    pub req: Request,
    pub res_tx: oneshot::Sender<(Response, HandleAction)>,
}

pub(crate) struct SessionProps {
    pub state: SessionState,
    pub path: Option<String>,
    pub query: Option<String>,
    pub protocol: Option<Protocol>,
    pub profile: Option<Profile>,
    pub medias: Vec<(usize, MediaEndpoint)>,
    pub time_decoder: Option<Arc<GlobalTimeDecoder>>,
}

/// Externally reachable session state: channels towards the session task
/// plus the properties mutex guarding observable getters.
pub(crate) struct SessionShared {
    pub secret_id: String,
    pub server: Arc<ServerInner>,
    pub request_tx: mpsc::Sender<SessionJob>,
    pub remove_conn_tx: mpsc::Sender<SocketAddr>,
    pub start_writer_tx: mpsc::Sender<()>,
    close_tx: mpsc::Sender<Error>,
    pub props: RwLock<SessionProps>,
    pub writer: Arc<RwLock<Option<WriterHandle>>>,
}

impl SessionShared {
    /// Creates the session and spawns its task. The secret id is a UUID
    /// without dashes, for compatibility with clients that cut the id at
    /// the first dash.
    pub fn spawn(server: Arc<ServerInner>) -> Arc<SessionShared> {
        let (request_tx, request_rx) = mpsc::channel(8);
        let (remove_conn_tx, remove_conn_rx) = mpsc::channel(8);
        let (start_writer_tx, start_writer_rx) = mpsc::channel(1);
        let (close_tx, close_rx) = mpsc::channel(1);

        let shared = Arc::new(SessionShared {
            secret_id: uuid::Uuid::new_v4().simple().to_string(),
            server,
            request_tx,
            remove_conn_tx,
            start_writer_tx,
            close_tx,
            props: RwLock::new(SessionProps {
                state: SessionState::Initial,
                path: None,
                query: None,
                protocol: None,
                profile: None,
                medias: Vec::new(),
                time_decoder: None,
            }),
            writer: Arc::new(RwLock::new(None)),
        });

        let task = SessionTask {
            shared: Arc::clone(&shared),
            conns: HashMap::new(),
            tcp_conn: None,
            writer: None,
            writer_err_rx: None,
            frame_buf: None,
            announced_desc: None,
            stream: None,
            setupped: Vec::new(),
            multicast_peer_ip: None,
            last_request_time: Instant::now(),
        };
        tokio::spawn(task.run(request_rx, remove_conn_rx, start_writer_rx, close_rx));

        shared
    }

    /// Requests the session to close with the given error. The first close
    /// wins; later calls are ignored.
    pub fn close(&self, err: Error) {
        let _ = self.close_tx.try_send(err);
    }
}

/// A server-side session, created by the first SETUP or ANNOUNCE of a
/// client and identified by its secret id.
pub struct ServerSession {
    pub(crate) shared: Arc<SessionShared>,
}

impl ServerSession {
    pub(crate) fn from_shared(shared: Arc<SessionShared>) -> ServerSession {
        ServerSession { shared }
    }

    pub fn id(&self) -> &str {
        &self.shared.secret_id
    }

    pub fn state(&self) -> SessionState {
        self.shared.props.read().state
    }

    pub fn path(&self) -> Option<String> {
        self.shared.props.read().path.clone()
    }

    pub fn query(&self) -> Option<String> {
        self.shared.props.read().query.clone()
    }

    pub fn transport(&self) -> Option<Protocol> {
        self.shared.props.read().protocol
    }

    /// Indexes of the setupped medias, in SETUP order.
    pub fn setupped_medias(&self) -> Vec<usize> {
        self.shared.props.read().medias.iter().map(|(i, _)| *i).collect()
    }

    /// Registers a callback invoked with every RTP packet of a media and
    /// payload type; used by publishers inside the record handler.
    pub fn set_on_packet_rtp(
        &self,
        media_idx: usize,
        payload_type: u8,
        cb: crate::media_endpoint::OnPacketRtpFn,
    ) {
        let props = self.shared.props.read();
        if let Some((_, ep)) = props.medias.iter().find(|(i, _)| *i == media_idx) {
            ep.set_on_packet_rtp(payload_type, cb);
        }
    }

    pub fn set_on_packet_rtcp(&self, media_idx: usize, cb: crate::media_endpoint::OnPacketRtcpFn) {
        let props = self.shared.props.read();
        if let Some((_, ep)) = props.medias.iter().find(|(i, _)| *i == media_idx) {
            ep.set_on_packet_rtcp(cb);
        }
    }

    /// Presentation timestamp of a packet, computed from the NTP mapping of
    /// the latest sender report of its media, on a timeline shared by every
    /// media of the session.
    pub fn packet_pts(&self, media_idx: usize, pkt: &rtp::packet::Packet) -> Option<Duration> {
        let props = self.shared.props.read();
        let decoder = props.time_decoder.clone()?;
        let (_, ep) = props.medias.iter().find(|(i, _)| *i == media_idx)?;
        let ntp = {
            let ingress = ep.ingress.lock();
            ingress
                .formats
                .get(&pkt.header.payload_type)?
                .packet_ntp(pkt.header.timestamp)?
        };
        Some(decoder.pts(ntp))
    }

    fn sum_counters(&self, f: impl Fn(&crate::media_endpoint::MediaCounters) -> u64) -> u64 {
        self.shared
            .props
            .read()
            .medias
            .iter()
            .map(|(_, ep)| f(&ep.shared.counters))
            .sum()
    }

    pub fn bytes_received(&self) -> u64 {
        self.sum_counters(|c| c.bytes_received.load(Ordering::Relaxed))
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sum_counters(|c| c.bytes_sent.load(Ordering::Relaxed))
    }

    pub fn rtp_packets_received(&self) -> u64 {
        self.sum_counters(|c| c.rtp_packets_received.load(Ordering::Relaxed))
    }

    pub fn rtp_packets_sent(&self) -> u64 {
        self.sum_counters(|c| c.rtp_packets_sent.load(Ordering::Relaxed))
    }

    pub fn rtcp_packets_received(&self) -> u64 {
        self.sum_counters(|c| c.rtcp_packets_received.load(Ordering::Relaxed))
    }

    pub fn rtcp_packets_sent(&self) -> u64 {
        self.sum_counters(|c| c.rtcp_packets_sent.load(Ordering::Relaxed))
    }

    pub fn rtp_packets_in_error(&self) -> u64 {
        self.sum_counters(|c| c.rtp_packets_in_error.load(Ordering::Relaxed))
    }

    pub fn rtp_packets_lost(&self) -> u64 {
        self.sum_counters(|c| c.rtp_packets_lost.load(Ordering::Relaxed))
    }

    /// Closes the session with [`Error::ErrSessionTornDown`].
    pub fn close(&self) {
        self.shared.close(Error::ErrSessionTornDown);
    }
}

struct SetuppedMedia {
    media_idx: usize,
    endpoint: MediaEndpoint,
    receiving: bool,
    single_format: bool,
    tcp_channel: Option<u8>,
    client_rtp_addr: Option<SocketAddr>,
    client_rtcp_addr: Option<SocketAddr>,
}

type HandleResult = std::result::Result<(Response, HandleAction), (StatusCode, Error)>;

struct SessionTask {
    shared: Arc<SessionShared>,
    conns: HashMap<SocketAddr, Arc<ConnShared>>,
    tcp_conn: Option<Arc<ConnShared>>,
    writer: Option<Writer>,
    writer_err_rx: Option<mpsc::Receiver<Error>>,
    frame_buf: Option<Arc<tokio::sync::Mutex<Vec<u8>>>>,
    announced_desc: Option<SessionDescription>,
    stream: Option<Arc<ServerStream>>,
    setupped: Vec<SetuppedMedia>,
    multicast_peer_ip: Option<std::net::IpAddr>,
    last_request_time: Instant,
}

impl SessionTask {
    async fn run(
        mut self,
        mut request_rx: mpsc::Receiver<SessionJob>,
        mut remove_conn_rx: mpsc::Receiver<SocketAddr>,
        mut start_writer_rx: mpsc::Receiver<()>,
        mut close_rx: mpsc::Receiver<Error>,
    ) {
        let mut check_interval = tokio::time::interval(self.shared.server.cfg.check_stream_period);
        check_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut server_closed = self.shared.server.closed_rx();

        let err = loop {
            tokio::select! {
                Some(job) = request_rx.recv() => {
                    self.last_request_time = Instant::now();
                    let (res, action) = self.handle_request(&job.conn, job.req).await;
                    let _ = job.res_tx.send((res, action));
                }
                Some(addr) = remove_conn_rx.recv() => {
                    if let Some(err) = self.handle_remove_conn(addr) {
                        break err;
                    }
                }
                Some(()) = start_writer_rx.recv() => {
                    if let Some(writer) = &mut self.writer {
                        writer.start();
                    }
                }
                err = Self::writer_error(&mut self.writer_err_rx) => break err,
                _ = check_interval.tick() => {
                    if let Some(err) = self.check_timeout() {
                        break err;
                    }
                }
                Some(err) = close_rx.recv() => break err,
                _ = server_closed.changed() => break Error::ErrTerminated,
            }
        };

        self.terminate(err).await;
    }

    async fn writer_error(rx: &mut Option<mpsc::Receiver<Error>>) -> Error {
        match rx {
            Some(rx) => rx.recv().await.unwrap_or(Error::ErrTerminated),
            None => std::future::pending().await,
        }
    }

    fn state(&self) -> SessionState {
        self.shared.props.read().state
    }

    fn set_state(&self, state: SessionState) {
        self.shared.props.write().state = state;
    }

    fn protocol(&self) -> Option<Protocol> {
        self.shared.props.read().protocol
    }

    fn public_session(&self) -> ServerSession {
        ServerSession::from_shared(Arc::clone(&self.shared))
    }

    fn session_ctx(&self) -> (String, Option<String>) {
        let props = self.shared.props.read();
        (
            props.path.clone().unwrap_or_default(),
            props.query.clone(),
        )
    }

    async fn handle_request(
        &mut self,
        conn: &Arc<ConnShared>,
        req: Request,
    ) -> (Response, HandleAction) {
        self.conns
            .entry(conn.remote_addr)
            .or_insert_with(|| Arc::clone(conn));

        let method = req.method;
        let result = match method {
            Method::Options => Ok((super::conn::handle_options(&self.shared.server), HandleAction::None)),
            Method::Announce => self.handle_announce(&req),
            Method::Setup => self.handle_setup(conn, &req).await,
            Method::Play => self.handle_play(conn, &req),
            Method::Record => self.handle_record(conn, &req),
            Method::Pause => self.handle_pause(conn, &req),
            Method::Teardown => {
                // unwind now, so the issuing connection survives the session
                self.stop_media_plane(true);
                Ok((Response::new(StatusCode::OK), HandleAction::TearDown))
            }
            Method::GetParameter => self.handle_get_parameter(&req),
            Method::SetParameter => self.handle_set_parameter(&req),
            Method::Describe => Err((
                StatusCode::METHOD_NOT_VALID_IN_THIS_STATE,
                Error::ErrInvalidState,
            )),
        };

        match result {
            Ok((mut res, action)) => {
                if method != Method::Announce && method != Method::Teardown {
                    let state = self.state();
                    let timeout = if matches!(state, SessionState::PrePlay | SessionState::Play)
                        && matches!(
                            self.protocol(),
                            Some(Protocol::Udp) | Some(Protocol::UdpMulticast)
                        ) {
                        Some(self.shared.server.cfg.session_timeout.as_secs())
                    } else {
                        None
                    };
                    let header = SessionHeader {
                        id: self.shared.secret_id.clone(),
                        timeout,
                    };
                    res.headers.set("Session", header.marshal());
                }
                (res, action)
            }
            Err((status, err)) => {
                log::debug!(
                    "request {} of session {} failed: {err}",
                    method,
                    self.shared.secret_id
                );
                (Response::new(status), HandleAction::None)
            }
        }
    }

    fn handle_announce(&mut self, req: &Request) -> HandleResult {
        if self.state() != SessionState::Initial {
            return Err((
                StatusCode::METHOD_NOT_VALID_IN_THIS_STATE,
                Error::ErrInvalidState,
            ));
        }

        match req.headers.get("Content-Type") {
            None => return Err((StatusCode::BAD_REQUEST, Error::ErrContentTypeMissing)),
            Some(ct) if !ct.starts_with("application/sdp") => {
                return Err((
                    StatusCode::BAD_REQUEST,
                    Error::ErrContentTypeUnsupported(ct.to_string()),
                ))
            }
            Some(_) => {}
        }

        let desc = SessionDescription::unmarshal(&req.body)
            .map_err(|e| (StatusCode::BAD_REQUEST, e))?;

        if desc.medias.iter().all(|m| m.is_back_channel) {
            return Err((
                StatusCode::BAD_REQUEST,
                Error::ErrSdpInvalid("back-channel medias only".into()),
            ));
        }

        let cb = match &self.shared.server.cfg.handlers.on_announce {
            Some(cb) => cb,
            None => {
                return Err((StatusCode::NOT_IMPLEMENTED, Error::ErrInvalidState));
            }
        };

        let session = self.public_session();
        let ctx = AnnounceContext {
            session: &session,
            path: req.url.path(),
            query: req.url.query(),
            description: &desc,
        };
        if let Err(status) = cb(&ctx) {
            return Err((status, Error::ErrInvalidState));
        }

        {
            let mut props = self.shared.props.write();
            props.state = SessionState::PreRecord;
            props.path = Some(req.url.path());
            props.query = req.url.query();
        }
        self.announced_desc = Some(desc);

        Ok((Response::new(StatusCode::OK), HandleAction::None))
    }

    fn transport_supported(&self, tr: &Transport, record: bool) -> bool {
        let server = &self.shared.server;

        if tr.profile == Profile::Savp && !server.secure() {
            return false;
        }

        match tr.protocol {
            Protocol::Tcp => true,
            Protocol::Udp => {
                if !server.udp_enabled() {
                    return false;
                }
                // plain UDP is never negotiated behind TLS
                !(server.secure() && tr.profile == Profile::Avp)
            }
            Protocol::UdpMulticast => {
                !record && server.multicast_enabled() && !(server.secure() && tr.profile == Profile::Avp)
            }
        }
    }

    /// Splits a play SETUP URL into (stream path, track id).
    fn parse_setup_path(url: &crate::rtsp_url::RtspUrl) -> (String, Option<usize>) {
        let path = url.path();
        if let Some(pos) = path.rfind("/trackID=") {
            if let Ok(id) = path[pos + 9..].parse() {
                return (path[..pos].to_string(), Some(id));
            }
        }
        (path, None)
    }

    async fn handle_setup(&mut self, conn: &Arc<ConnShared>, req: &Request) -> HandleResult {
        let state = self.state();
        let record = match state {
            SessionState::Initial | SessionState::PrePlay => false,
            SessionState::PreRecord => true,
            _ => {
                return Err((
                    StatusCode::METHOD_NOT_VALID_IN_THIS_STATE,
                    Error::ErrInvalidState,
                ))
            }
        };

        let transport_raw = req.headers.get("Transport").ok_or((
            StatusCode::BAD_REQUEST,
            Error::ErrTransportHeaderInvalid("header is missing".into()),
        ))?;

        // the client lists alternatives in preference order; pick the first
        // supported one
        let mut chosen = None;
        let mut parse_err = None;
        for alt in Transport::alternatives(transport_raw) {
            match Transport::unmarshal(alt) {
                Ok(tr) => {
                    if self.transport_supported(&tr, record) {
                        chosen = Some(tr);
                        break;
                    }
                }
                Err(e) => parse_err = Some(e),
            }
        }
        let tr = match chosen {
            Some(tr) => tr,
            None => {
                return match parse_err {
                    Some(e) => Err((StatusCode::BAD_REQUEST, e)),
                    None => Err((
                        StatusCode::UNSUPPORTED_TRANSPORT,
                        Error::ErrTransportHeaderInvalid("no supported transport".into()),
                    )),
                };
            }
        };

        // a session uses one transport across all medias
        {
            let props = self.shared.props.read();
            if let Some(existing) = props.protocol {
                if existing != tr.protocol || props.profile != Some(tr.profile) {
                    return Err((
                        StatusCode::BAD_REQUEST,
                        Error::ErrMediasDifferentTransports,
                    ));
                }
            }
        }

        // locate the media and the stream
        let (media_idx, stream_path, query) = if record {
            let desc = self.announced_desc.as_ref().ok_or((
                StatusCode::BAD_REQUEST,
                Error::ErrInvalidState,
            ))?;
            let (path, query) = {
                let props = self.shared.props.read();
                (props.path.clone().unwrap_or_default(), props.query.clone())
            };
            let base = match &query {
                Some(q) => format!("{path}?{q}"),
                None => path.clone(),
            };
            let idx = desc
                .find_media_by_url(&base, &req.url)
                .ok_or((StatusCode::BAD_REQUEST, Error::ErrMediaNotFound))?;
            (idx, path, query)
        } else {
            let (path, track_id) = Self::parse_setup_path(&req.url);

            if let Some(prev) = self.shared.props.read().path.clone() {
                if prev != path {
                    return Err((StatusCode::BAD_REQUEST, Error::ErrMediasDifferentPaths));
                }
            }

            let cb = self.shared.server.cfg.handlers.on_setup.as_ref().ok_or((
                StatusCode::NOT_IMPLEMENTED,
                Error::ErrInvalidState,
            ))?;
            let session = ServerSession::from_shared(Arc::clone(&self.shared));
            let ctx = SetupContext {
                session: &session,
                path: path.clone(),
                query: req.url.query(),
            };
            let stream = match cb(&ctx) {
                Ok(Some(stream)) => stream,
                Ok(None) => return Err((StatusCode::NOT_FOUND, Error::ErrMediaNotFound)),
                Err(status) => return Err((status, Error::ErrInvalidSetupPath)),
            };

            // the stream must stay the same across SETUPs
            if let Some(prev) = &self.stream {
                if !prev.ptr_eq(&stream) {
                    return Err((StatusCode::BAD_REQUEST, Error::ErrInvalidSetupPath));
                }
            }

            let idx = match track_id {
                Some(id) if id < stream.description().medias.len() => id,
                Some(_) => return Err((StatusCode::NOT_FOUND, Error::ErrMediaNotFound)),
                None if stream.description().medias.len() == 1 => 0,
                None => return Err((StatusCode::BAD_REQUEST, Error::ErrInvalidSetupPath)),
            };

            // attach as a reader on the first SETUP
            if self.stream.is_none() {
                let peer = tr
                    .client_port
                    .map(|(rtp, _)| (conn.remote_addr.ip(), rtp));
                stream
                    .attach(&self.shared, tr.protocol, peer)
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, e))?;
                self.stream = Some(Arc::clone(&stream));
            }

            (idx, path, req.url.query())
        };

        if self.setupped.iter().any(|sm| sm.media_idx == media_idx) {
            return Err((StatusCode::BAD_REQUEST, Error::ErrMediaAlreadySetup));
        }

        // transport details
        let mut res_tr = Transport {
            protocol: tr.protocol,
            profile: tr.profile,
            ..Default::default()
        };
        let mut tcp_channel = None;
        let mut client_rtp_addr = None;
        let mut client_rtcp_addr = None;

        match tr.protocol {
            Protocol::Tcp => {
                let channel = match tr.interleaved {
                    Some((a, b)) => {
                        if a % 2 != 0 || b != a + 1 {
                            return Err((
                                StatusCode::BAD_REQUEST,
                                Error::ErrTransportHeaderInvalidInterleavedIds,
                            ));
                        }
                        if self.setupped.iter().any(|sm| sm.tcp_channel == Some(a)) {
                            return Err((
                                StatusCode::BAD_REQUEST,
                                Error::ErrInterleavedIdsInUse,
                            ));
                        }
                        a
                    }
                    None => {
                        // lowest free even channel
                        let mut c = 0u8;
                        while self.setupped.iter().any(|sm| sm.tcp_channel == Some(c)) {
                            c += 2;
                        }
                        c
                    }
                };
                tcp_channel = Some(channel);
                res_tr.interleaved = Some((channel, channel + 1));
            }
            Protocol::Udp => {
                let (rtp_port, rtcp_port) = tr.client_port.ok_or((
                    StatusCode::BAD_REQUEST,
                    Error::ErrTransportHeaderNoClientPorts,
                ))?;
                let peer_ip = conn.remote_addr.ip();
                client_rtp_addr = Some(SocketAddr::new(peer_ip, rtp_port));
                client_rtcp_addr = Some(SocketAddr::new(peer_ip, rtcp_port));

                res_tr.client_port = Some((rtp_port, rtcp_port));
                res_tr.server_port = Some((
                    self.shared.server.udp_rtp.as_ref().map(|l| l.port()).unwrap_or(0),
                    self.shared.server.udp_rtcp.as_ref().map(|l| l.port()).unwrap_or(0),
                ));
            }
            Protocol::UdpMulticast => {
                let stream = self.stream.as_ref().ok_or((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Error::ErrInvalidState,
                ))?;
                let (group, rtp_port, rtcp_port) =
                    stream.multicast_params(media_idx).ok_or((
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Error::ErrInvalidState,
                    ))?;
                res_tr.destination = Some(group.into());
                res_tr.ttl = Some(127);
                res_tr.server_port = Some((rtp_port, rtcp_port));
            }
        }

        // media description and local SSRCs
        let (media, local_ssrcs, receiving) = if record {
            let desc = self.announced_desc.as_ref().ok_or((
                StatusCode::INTERNAL_SERVER_ERROR,
                Error::ErrInvalidState,
            ))?;
            let media = desc.medias[media_idx].clone();
            let mut rng = rand::thread_rng();
            let mut ssrcs = Vec::with_capacity(media.formats.len());
            let used: Vec<u32> = self
                .setupped
                .iter()
                .flat_map(|sm| {
                    let ingress = sm.endpoint.ingress.lock();
                    ingress
                        .formats
                        .values()
                        .map(|f| f.local_ssrc)
                        .collect::<Vec<_>>()
                })
                .collect();
            for _ in 0..media.formats.len() {
                let mut ssrc: u32 = rng.gen();
                while used.contains(&ssrc) || ssrcs.contains(&ssrc) {
                    ssrc = rng.gen();
                }
                ssrcs.push(ssrc);
            }
            (media, ssrcs, true)
        } else {
            let stream = self.stream.as_ref().ok_or((
                StatusCode::INTERNAL_SERVER_ERROR,
                Error::ErrInvalidState,
            ))?;
            let media = stream.description().medias[media_idx].clone();
            let ssrcs = stream.local_ssrcs(media_idx);
            let receiving = media.is_back_channel;
            (media, ssrcs, receiving)
        };

        // SRTP contexts and the KeyMgmt exchange
        let mut srtp_in = None;
        let mut srtp_out = None;
        let mut res_key_mgmt = None;
        if tr.profile == Profile::Savp {
            let raw = req.headers.get("KeyMgmt").ok_or((
                StatusCode::BAD_REQUEST,
                Error::ErrInvalidKeyMgmtHeader("header is missing".into()),
            ))?;
            let km = KeyMgmt::unmarshal(raw)
                .map_err(|e| (StatusCode::BAD_REQUEST, e))?;
            let msg = crypto::MikeyMessage::unmarshal(&km.mikey_payload)
                .map_err(|e| (StatusCode::BAD_REQUEST, Error::ErrInvalidKeyMgmtHeader(e.to_string())))?;

            let ssrcs: Vec<u32> = msg.entries.iter().map(|(s, _)| *s).collect();
            let rocs: Vec<u32> = msg.entries.iter().map(|(_, r)| *r).collect();
            let ctx = crypto::Context::new(&msg.key, &ssrcs, Some(&rocs))
                .map_err(|e| (StatusCode::BAD_REQUEST, Error::ErrInvalidKeyMgmtHeader(e.to_string())))?;
            srtp_in = Some(Arc::new(Mutex::new(ctx)));

            let (master, out_ctx, entries) = if record {
                // freshly minted key for publisher medias
                let master = crypto::random_master();
                let ctx = crypto::Context::new(&master, &local_ssrcs, None)
                    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))?;
                let entries: Vec<(u32, u32)> =
                    local_ssrcs.iter().map(|&s| (s, 0)).collect();
                (master, Arc::new(Mutex::new(ctx)), entries)
            } else {
                // inherited from the stream's outbound context
                let stream = self.stream.as_ref().ok_or((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Error::ErrInvalidState,
                ))?;
                let master = stream.inner.srtp_master.clone().ok_or((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Error::ErrInvalidState,
                ))?;
                let ctx = stream.inner.srtp_out.clone().ok_or((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Error::ErrInvalidState,
                ))?;
                let entries: Vec<(u32, u32)> = local_ssrcs
                    .iter()
                    .map(|&s| (s, ctx.lock().roc(s).unwrap_or(0)))
                    .collect();
                (master, ctx, entries)
            };

            let out_msg = crypto::MikeyMessage::new(&master, entries);
            res_key_mgmt = Some(
                KeyMgmt {
                    url: Some(req.url.as_str().to_string()),
                    mikey_payload: out_msg.marshal(),
                }
                .marshal(),
            );
            srtp_out = Some(out_ctx);
        }

        let endpoint = MediaEndpoint::new(
            media_idx,
            &media,
            &local_ssrcs,
            receiving,
            self.shared.server.cfg.max_packet_size,
            self.shared.server.cfg.udp_max_payload_size,
            Arc::clone(&self.shared.writer),
            Egress::Detached,
            srtp_in,
            srtp_out,
            self.decode_error_fn(),
        );

        let single_format = media.formats.len() == 1;
        self.setupped.push(SetuppedMedia {
            media_idx,
            endpoint: endpoint.clone(),
            receiving,
            single_format,
            tcp_channel,
            client_rtp_addr,
            client_rtcp_addr,
        });

        {
            let mut props = self.shared.props.write();
            props.protocol = Some(tr.protocol);
            props.profile = Some(tr.profile);
            props.path = Some(stream_path);
            props.query = query;
            props.medias.push((media_idx, endpoint));
            if state == SessionState::Initial {
                props.state = SessionState::PrePlay;
            }
        }

        let mut res = Response::new(StatusCode::OK);
        res.headers.set("Transport", res_tr.marshal());
        if let Some(km) = res_key_mgmt {
            res.headers.set("KeyMgmt", km);
        }
        Ok((res, HandleAction::None))
    }

    fn decode_error_fn(&self) -> OnDecodeErrorFn {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move |err| {
            log::debug!("packet decode error: {err}");
            if let Some(shared) = shared.upgrade() {
                if let Some(cb) = &shared.server.cfg.handlers.on_decode_error {
                    cb(&ServerSession::from_shared(Arc::clone(&shared)), err);
                }
            }
        })
    }

    /// A session bound to a TCP connection accepts state changes only from
    /// that connection.
    fn check_conn(&self, conn: &Arc<ConnShared>) -> std::result::Result<(), (StatusCode, Error)> {
        if let Some(tcp_conn) = &self.tcp_conn {
            if tcp_conn.remote_addr != conn.remote_addr {
                return Err((StatusCode::BAD_REQUEST, Error::ErrSessionLinkedToOtherConn));
            }
        }
        Ok(())
    }

    fn check_path(&self, req: &Request) -> std::result::Result<(), (StatusCode, Error)> {
        let stored = self.shared.props.read().path.clone();
        if let Some(stored) = stored {
            let path = req.url.path();
            // PLAY and RECORD may use the bare path or the aggregate control
            if path != stored && path.trim_end_matches('/') != stored.trim_end_matches('/') {
                return Err((StatusCode::BAD_REQUEST, Error::ErrPathHasChanged));
            }
        }
        Ok(())
    }

    fn handle_play(&mut self, conn: &Arc<ConnShared>, req: &Request) -> HandleResult {
        match self.state() {
            SessionState::Play => return Ok((Response::new(StatusCode::OK), HandleAction::None)),
            SessionState::PrePlay => {}
            _ => {
                return Err((
                    StatusCode::METHOD_NOT_VALID_IN_THIS_STATE,
                    Error::ErrInvalidState,
                ))
            }
        }

        if self.setupped.is_empty() {
            return Err((
                StatusCode::METHOD_NOT_VALID_IN_THIS_STATE,
                Error::ErrInvalidState,
            ));
        }

        self.check_conn(conn)?;
        self.check_path(req)?;

        if let Some(cb) = &self.shared.server.cfg.handlers.on_play {
            let session = ServerSession::from_shared(Arc::clone(&self.shared));
            let (path, query) = self.session_ctx();
            let ctx = SessionContext {
                session: &session,
                path,
                query,
            };
            if let Err(status) = cb(&ctx) {
                return Err((status, Error::ErrInvalidState));
            }
        }

        let protocol = self.protocol().unwrap_or(Protocol::Udp);
        let action = self.start_media_plane(conn, protocol, false);
        self.set_state(SessionState::Play);

        // activate as a reader on the stream
        if let Some(stream) = &self.stream {
            match protocol {
                Protocol::UdpMulticast => {
                    let read_fns = self
                        .setupped
                        .iter()
                        .map(|sm| (sm.media_idx, sm.endpoint.rtcp_read_fn()))
                        .collect();
                    self.multicast_peer_ip = Some(conn.remote_addr.ip());
                    stream.activate_multicast(conn.remote_addr.ip(), read_fns);
                }
                _ => {
                    let n_medias = stream.description().medias.len();
                    let mut medias: Vec<Option<Arc<crate::media_endpoint::MediaShared>>> =
                        vec![None; n_medias];
                    for sm in &self.setupped {
                        medias[sm.media_idx] = Some(Arc::clone(&sm.endpoint.shared));
                    }
                    stream.activate_unicast(&self.shared, medias);
                }
            }
        }

        let mut res = Response::new(StatusCode::OK);
        if let Some(rtp_info) = self.build_rtp_info(req) {
            res.headers.set("RTP-Info", rtp_info.marshal());
        }
        Ok((res, action))
    }

    fn handle_record(&mut self, conn: &Arc<ConnShared>, req: &Request) -> HandleResult {
        match self.state() {
            SessionState::Record => {
                return Ok((Response::new(StatusCode::OK), HandleAction::None))
            }
            SessionState::PreRecord => {}
            _ => {
                return Err((
                    StatusCode::METHOD_NOT_VALID_IN_THIS_STATE,
                    Error::ErrInvalidState,
                ))
            }
        }

        let announced = self
            .announced_desc
            .as_ref()
            .map(|d| d.medias.len())
            .unwrap_or(0);
        if self.setupped.len() != announced {
            return Err((
                StatusCode::BAD_REQUEST,
                Error::ErrNotAllAnnouncedMediasSetup,
            ));
        }

        self.check_conn(conn)?;
        self.check_path(req)?;

        if let Some(cb) = &self.shared.server.cfg.handlers.on_record {
            let session = ServerSession::from_shared(Arc::clone(&self.shared));
            let (path, query) = self.session_ctx();
            let ctx = SessionContext {
                session: &session,
                path,
                query,
            };
            if let Err(status) = cb(&ctx) {
                return Err((status, Error::ErrInvalidState));
            }
        }

        let protocol = self.protocol().unwrap_or(Protocol::Udp);
        let action = self.start_media_plane(conn, protocol, true);
        self.set_state(SessionState::Record);

        Ok((Response::new(StatusCode::OK), action))
    }

    /// Wires the transport of every setupped media and creates the writer.
    /// Returns the action the connection must apply after the response.
    fn start_media_plane(
        &mut self,
        conn: &Arc<ConnShared>,
        protocol: Protocol,
        record: bool,
    ) -> HandleAction {
        let cfg = &self.shared.server.cfg;

        if protocol != Protocol::UdpMulticast {
            let queue_size = if record {
                RECORD_WRITE_QUEUE_SIZE
            } else {
                cfg.write_queue_size
            };
            let (writer, err_rx) = Writer::new(queue_size);
            *self.shared.writer.write() = Some(writer.handle());
            self.writer = Some(writer);
            self.writer_err_rx = Some(err_rx);
        }

        self.shared.props.write().time_decoder = Some(Arc::new(GlobalTimeDecoder::new()));

        let now = now_unix_millis();
        let frame_buf = Arc::new(tokio::sync::Mutex::new(vec![0u8; cfg.max_packet_size + 4]));
        self.frame_buf = Some(Arc::clone(&frame_buf));

        for sm in &self.setupped {
            sm.endpoint
                .shared
                .last_packet_time
                .store(now, Ordering::Relaxed);

            match protocol {
                Protocol::Tcp => {
                    let channel = sm.tcp_channel.unwrap_or(0);
                    sm.endpoint.set_egress(Egress::Tcp {
                        conn_writer: Arc::clone(&conn.writer),
                        rtp_channel: channel,
                        frame_buf: Arc::clone(&frame_buf),
                    });
                    let mut read_fns = conn.channel_read_fns.lock();
                    read_fns.insert(channel, sm.endpoint.rtp_read_fn(false));
                    read_fns.insert(channel + 1, sm.endpoint.rtcp_read_fn());
                }
                Protocol::Udp => {
                    let (rtp_l, rtcp_l) = (
                        self.shared.server.udp_rtp.as_ref(),
                        self.shared.server.udp_rtcp.as_ref(),
                    );
                    if let (Some(rtp_l), Some(rtcp_l), Some(rtp_addr), Some(rtcp_addr)) = (
                        rtp_l,
                        rtcp_l,
                        sm.client_rtp_addr,
                        sm.client_rtcp_addr,
                    ) {
                        sm.endpoint.set_egress(Egress::Udp {
                            rtp_socket: rtp_l.socket(),
                            rtcp_socket: rtcp_l.socket(),
                            rtp_write_addr: rtp_addr,
                            rtcp_write_addr: rtcp_addr,
                        });
                        rtp_l.register(
                            (rtp_addr.ip(), rtp_addr.port()),
                            sm.endpoint.rtp_read_fn(true),
                        );
                        rtcp_l.register(
                            (rtcp_addr.ip(), rtcp_addr.port()),
                            sm.endpoint.rtcp_read_fn(),
                        );
                    }
                }
                // multicast readers receive through the stream's writers
                Protocol::UdpMulticast => {}
            }

            if sm.receiving {
                sm.endpoint.start_rtcp_tasks(RECEIVER_REPORT_PERIOD);
            }
        }

        match protocol {
            Protocol::Tcp => {
                self.tcp_conn = Some(Arc::clone(conn));
                HandleAction::SwitchToInterleaved
            }
            _ => {
                if let Some(writer) = &mut self.writer {
                    writer.start();
                }
                HandleAction::None
            }
        }
    }

    /// Unwinds everything [`SessionTask::start_media_plane`] set up.
    fn stop_media_plane(&mut self, destroy_writer: bool) -> HandleAction {
        for sm in &self.setupped {
            sm.endpoint.stop();
            sm.endpoint.clear_egress();

            if let Some(channel) = sm.tcp_channel {
                if let Some(conn) = &self.tcp_conn {
                    let mut read_fns = conn.channel_read_fns.lock();
                    read_fns.remove(&channel);
                    read_fns.remove(&(channel + 1));
                }
            }
            if let (Some(rtp_l), Some(rtp_addr)) =
                (self.shared.server.udp_rtp.as_ref(), sm.client_rtp_addr)
            {
                rtp_l.unregister(&(rtp_addr.ip(), rtp_addr.port()));
            }
            if let (Some(rtcp_l), Some(rtcp_addr)) =
                (self.shared.server.udp_rtcp.as_ref(), sm.client_rtcp_addr)
            {
                rtcp_l.unregister(&(rtcp_addr.ip(), rtcp_addr.port()));
            }
        }

        if let Some(stream) = &self.stream {
            stream.deactivate(&self.shared.secret_id, self.multicast_peer_ip.take());
        }

        if destroy_writer {
            *self.shared.writer.write() = None;
            self.writer = None;
            self.writer_err_rx = None;
        }

        self.shared.props.write().time_decoder = None;
        self.frame_buf = None;

        let was_tcp = self.tcp_conn.take().is_some();
        if was_tcp {
            HandleAction::SwitchFromInterleaved
        } else {
            HandleAction::None
        }
    }

    fn handle_pause(&mut self, conn: &Arc<ConnShared>, _req: &Request) -> HandleResult {
        let state = self.state();
        if matches!(state, SessionState::Play | SessionState::Record) {
            self.check_conn(conn)?;
        }

        if let Some(cb) = &self.shared.server.cfg.handlers.on_pause {
            let session = ServerSession::from_shared(Arc::clone(&self.shared));
            let (path, query) = self.session_ctx();
            let ctx = SessionContext {
                session: &session,
                path,
                query,
            };
            cb(&ctx);
        }

        let action = match state {
            SessionState::Play => {
                // the multicast writer is shared and survives PAUSE
                let destroy_writer = self.protocol() != Some(Protocol::UdpMulticast);
                let action = self.stop_media_plane(destroy_writer);
                self.set_state(SessionState::PrePlay);
                action
            }
            SessionState::Record => {
                let action = self.stop_media_plane(true);
                self.set_state(SessionState::PreRecord);
                action
            }
            _ => HandleAction::None,
        };

        Ok((Response::new(StatusCode::OK), action))
    }

    fn handle_get_parameter(&mut self, req: &Request) -> HandleResult {
        // an empty body is a keepalive
        if !req.body.is_empty() {
            if let Some(cb) = &self.shared.server.cfg.handlers.on_get_parameter {
                let session = ServerSession::from_shared(Arc::clone(&self.shared));
                let (path, query) = self.session_ctx();
                let ctx = SessionContext {
                    session: &session,
                    path,
                    query,
                };
                if let Some(body) = cb(&ctx, req) {
                    let mut res = Response::new(StatusCode::OK);
                    res.headers.set("Content-Type", "text/parameters");
                    res.body = Bytes::from(body.into_bytes());
                    return Ok((res, HandleAction::None));
                }
            }
        }
        Ok((Response::new(StatusCode::OK), HandleAction::None))
    }

    fn handle_set_parameter(&mut self, req: &Request) -> HandleResult {
        if let Some(cb) = &self.shared.server.cfg.handlers.on_set_parameter {
            let session = ServerSession::from_shared(Arc::clone(&self.shared));
            let (path, query) = self.session_ctx();
            let ctx = SessionContext {
                session: &session,
                path,
                query,
            };
            cb(&ctx, req);
        }
        Ok((Response::new(StatusCode::OK), HandleAction::None))
    }

    /// RTP-Info of a PLAY response: one entry per setupped media, with
    /// sequence number and timestamp only for single-format medias that
    /// already carried a packet.
    fn build_rtp_info(&self, req: &Request) -> Option<RtpInfo> {
        let stream = self.stream.as_ref()?;
        let path = self.shared.props.read().path.clone()?;

        let scheme = if self.shared.server.secure() {
            "rtsps"
        } else {
            "rtsp"
        };
        let host = match req.url.explicit_port() {
            Some(port) => format!("{}:{}", req.url.host(), port),
            None => req.url.host().to_string(),
        };

        let mut entries = Vec::new();
        for sm in &self.setupped {
            let url = format!("{scheme}://{host}/{path}/trackID={}", sm.media_idx);
            let (seq, ts) = if sm.single_format {
                match stream.rtp_info_entry(sm.media_idx) {
                    Some((seq, ts)) => (Some(seq), Some(ts)),
                    None => (None, None),
                }
            } else {
                (None, None)
            };
            entries.push(RtpInfoEntry {
                url,
                sequence_number: seq,
                timestamp: ts,
            });
        }

        if entries.is_empty() {
            None
        } else {
            Some(RtpInfo(entries))
        }
    }

    fn handle_remove_conn(&mut self, addr: SocketAddr) -> Option<Error> {
        self.conns.remove(&addr);

        let state = self.state();
        let in_media_state = matches!(state, SessionState::Play | SessionState::Record);
        let is_tcp = self.protocol() == Some(Protocol::Tcp);

        // an interleaved session dies with its bound connection
        if is_tcp && in_media_state {
            if let Some(tcp_conn) = &self.tcp_conn {
                if tcp_conn.remote_addr == addr {
                    return Some(Error::ErrSessionNotInUse);
                }
            }
        }

        if self.conns.is_empty() && (!in_media_state || is_tcp) {
            return Some(Error::ErrSessionNotInUse);
        }

        None
    }

    fn check_timeout(&self) -> Option<Error> {
        let state = self.state();
        let protocol = self.protocol()?;
        if protocol == Protocol::Tcp {
            return None;
        }

        let cfg = &self.shared.server.cfg;
        let now = now_unix_millis();
        let last_packet = self
            .setupped
            .iter()
            .map(|sm| sm.endpoint.shared.last_packet_time.load(Ordering::Relaxed))
            .max()
            .unwrap_or(0);
        let since_packet = Duration::from_millis(now.saturating_sub(last_packet));

        match state {
            SessionState::Record => {
                if since_packet >= cfg.read_timeout {
                    return Some(Error::ErrSessionTimedOut);
                }
            }
            SessionState::Play => {
                let since_request = self.last_request_time.elapsed();
                if since_request >= cfg.session_timeout && since_packet >= cfg.session_timeout {
                    return Some(Error::ErrSessionTimedOut);
                }
            }
            _ => {}
        }

        None
    }

    async fn terminate(mut self, err: Error) {
        log::debug!("session {} closed: {err}", self.shared.secret_id);

        self.shared.server.remove_session(&self.shared.secret_id);

        let tcp_conn = self.tcp_conn.clone();
        self.stop_media_plane(true);

        if let Some(stream) = self.stream.take() {
            stream.detach(&self.shared.secret_id);
        }

        // an interleaved session takes its bound connection down with it
        if let Some(conn) = tcp_conn {
            conn.close();
        }

        if let Some(cb) = &self.shared.server.cfg.handlers.on_session_close {
            cb(
                &ServerSession::from_shared(Arc::clone(&self.shared)),
                &err,
            );
        }
    }
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.shared.secret_id)
            .field("state", &self.state())
            .finish()
    }
}
