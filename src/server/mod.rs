#[cfg(test)]
mod server_test;

mod conn;
mod multicast;
mod session;
mod stream;

pub use session::{ServerSession, SessionState};
pub use stream::ServerStream;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use util::sync::Mutex;

use crate::conn::BoxStream;
use crate::description::SessionDescription;
use crate::error::{Error, Result};
use crate::message::{Request, StatusCode};
use crate::rtsp_url::RtspUrl;
use crate::transport::UdpListener;
use conn::ServerConnTask;
use session::SessionShared;

/// Context of a DESCRIBE request.
pub struct DescribeContext {
    pub path: String,
    pub query: Option<String>,
    pub url: RtspUrl,
}

/// Context of an ANNOUNCE request.
pub struct AnnounceContext<'a> {
    pub session: &'a ServerSession,
    pub path: String,
    pub query: Option<String>,
    pub description: &'a SessionDescription,
}

/// Context of a SETUP request.
pub struct SetupContext<'a> {
    pub session: &'a ServerSession,
    pub path: String,
    pub query: Option<String>,
}

/// Context of a PLAY, RECORD, PAUSE or parameter request.
pub struct SessionContext<'a> {
    pub session: &'a ServerSession,
    pub path: String,
    pub query: Option<String>,
}

pub type OnConnOpenFn = Box<dyn Fn(SocketAddr) + Send + Sync>;
pub type OnConnCloseFn = Box<dyn Fn(SocketAddr) + Send + Sync>;
pub type OnSessionOpenFn = Box<dyn Fn(&ServerSession) + Send + Sync>;
pub type OnSessionCloseFn = Box<dyn Fn(&ServerSession, &Error) + Send + Sync>;
pub type OnDescribeFn =
    Box<dyn Fn(&DescribeContext) -> std::result::Result<Arc<ServerStream>, StatusCode> + Send + Sync>;
pub type OnAnnounceFn =
    Box<dyn Fn(&AnnounceContext<'_>) -> std::result::Result<(), StatusCode> + Send + Sync>;
pub type OnSetupFn = Box<
    dyn Fn(&SetupContext<'_>) -> std::result::Result<Option<Arc<ServerStream>>, StatusCode>
        + Send
        + Sync,
>;
pub type OnPlayFn =
    Box<dyn Fn(&SessionContext<'_>) -> std::result::Result<(), StatusCode> + Send + Sync>;
pub type OnRecordFn =
    Box<dyn Fn(&SessionContext<'_>) -> std::result::Result<(), StatusCode> + Send + Sync>;
pub type OnPauseFn = Box<dyn Fn(&SessionContext<'_>) + Send + Sync>;
pub type OnGetParameterFn =
    Box<dyn Fn(&SessionContext<'_>, &Request) -> Option<String> + Send + Sync>;
pub type OnSetParameterFn =
    Box<dyn Fn(&SessionContext<'_>, &Request) -> Option<String> + Send + Sync>;
pub type OnSessionDecodeErrorFn = Box<dyn Fn(&ServerSession, &Error) + Send + Sync>;
pub type OnStreamWriteErrorFn = Box<dyn Fn(&ServerSession, &Error) + Send + Sync>;

/// Server capabilities, declared by setting the corresponding callbacks.
/// OPTIONS advertises exactly the methods whose callback is set.
#[derive(Default)]
pub struct ServerHandlers {
    pub on_conn_open: Option<OnConnOpenFn>,
    pub on_conn_close: Option<OnConnCloseFn>,
    pub on_session_open: Option<OnSessionOpenFn>,
    pub on_session_close: Option<OnSessionCloseFn>,
    pub on_describe: Option<OnDescribeFn>,
    pub on_announce: Option<OnAnnounceFn>,
    pub on_setup: Option<OnSetupFn>,
    pub on_play: Option<OnPlayFn>,
    pub on_record: Option<OnRecordFn>,
    pub on_pause: Option<OnPauseFn>,
    pub on_get_parameter: Option<OnGetParameterFn>,
    pub on_set_parameter: Option<OnSetParameterFn>,
    pub on_decode_error: Option<OnSessionDecodeErrorFn>,
    pub on_stream_write_error: Option<OnStreamWriteErrorFn>,
}

pub struct ServerConfig {
    /// Address of the TCP listener, e.g. "0.0.0.0:8554".
    pub rtsp_address: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Inactivity timeout of sessions reading via UDP.
    pub session_timeout: Duration,
    pub check_stream_period: Duration,
    pub max_packet_size: usize,
    pub udp_max_payload_size: usize,
    pub write_queue_size: usize,
    /// Addresses of the shared UDP listener pair; both must be set to
    /// enable the UDP transport. The RTP port must be even, the RTCP port
    /// the following one.
    pub udp_rtp_address: Option<String>,
    pub udp_rtcp_address: Option<String>,
    /// Range from which per-stream multicast groups are drawn, in CIDR
    /// notation, e.g. "224.1.0.0/16". Enables the multicast transport.
    pub multicast_ip_range: Option<String>,
    pub multicast_rtp_port: u16,
    pub multicast_rtcp_port: u16,
    /// Accepts RTSPS connections and enables the SAVP profile.
    pub tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    pub handlers: ServerHandlers,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            rtsp_address: "0.0.0.0:8554".to_string(),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            session_timeout: Duration::from_secs(60),
            check_stream_period: Duration::from_secs(1),
            max_packet_size: 2048,
            udp_max_payload_size: 1472,
            write_queue_size: 256,
            udp_rtp_address: None,
            udp_rtcp_address: None,
            multicast_ip_range: None,
            multicast_rtp_port: 8002,
            multicast_rtcp_port: 8003,
            tls_acceptor: None,
            handlers: ServerHandlers::default(),
        }
    }
}

fn parse_cidr(raw: &str) -> Result<(u32, u8)> {
    let (addr, len) = raw
        .split_once('/')
        .ok_or_else(|| Error::ErrUrlInvalid(format!("invalid CIDR '{raw}'")))?;
    let ip: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::ErrUrlInvalid(format!("invalid CIDR '{raw}'")))?;
    let len: u8 = len
        .parse()
        .map_err(|_| Error::ErrUrlInvalid(format!("invalid CIDR '{raw}'")))?;
    if len > 32 {
        return Err(Error::ErrUrlInvalid(format!("invalid CIDR '{raw}'")));
    }
    Ok((u32::from(ip), len))
}

pub(crate) struct ServerInner {
    pub cfg: ServerConfig,
    pub sessions: Mutex<HashMap<String, Arc<SessionShared>>>,
    pub udp_rtp: Option<UdpListener>,
    pub udp_rtcp: Option<UdpListener>,
    multicast_range: Option<(u32, u8)>,
    multicast_counter: Mutex<u32>,
    pub closed_tx: watch::Sender<bool>,
    local_addr: SocketAddr,
}

impl ServerInner {
    pub fn udp_enabled(&self) -> bool {
        self.udp_rtp.is_some()
    }

    pub fn multicast_enabled(&self) -> bool {
        self.multicast_range.is_some()
    }

    pub fn secure(&self) -> bool {
        self.cfg.tls_acceptor.is_some()
    }

    pub fn closed_rx(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Draws the next multicast group from the configured range.
    pub fn next_multicast_ip(&self) -> Result<Ipv4Addr> {
        let (base, len) = self.multicast_range.ok_or(Error::ErrInvalidState)?;
        let host_bits = 32 - len;
        let mut counter = self.multicast_counter.lock();
        *counter += 1;
        let offset = if host_bits >= 32 {
            *counter
        } else {
            *counter % (1u32 << host_bits).max(2)
        };
        Ok(Ipv4Addr::from(base | offset.max(1)))
    }

    pub fn remove_session(&self, secret_id: &str) {
        self.sessions.lock().remove(secret_id);
    }
}

/// A RTSP server: accepts connections, spawns one task per connection and
/// one per session, and distributes streams to readers.
pub struct Server {
    pub(crate) inner: Arc<ServerInner>,
}

impl Server {
    /// Binds the TCP listener (and, when configured, the shared UDP
    /// listener pair) and starts accepting connections.
    pub async fn new(cfg: ServerConfig) -> Result<Server> {
        let tcp_listener = TcpListener::bind(&cfg.rtsp_address).await?;
        let local_addr = tcp_listener.local_addr()?;

        let (udp_rtp, udp_rtcp) = match (&cfg.udp_rtp_address, &cfg.udp_rtcp_address) {
            (Some(rtp_addr), Some(rtcp_addr)) => {
                let rtp_addr: SocketAddr = rtp_addr
                    .parse()
                    .map_err(|_| Error::ErrUrlInvalid(format!("invalid address '{rtp_addr}'")))?;
                let rtcp_addr: SocketAddr = rtcp_addr
                    .parse()
                    .map_err(|_| Error::ErrUrlInvalid(format!("invalid address '{rtcp_addr}'")))?;

                if rtp_addr.port() % 2 != 0 || rtcp_addr.port() != rtp_addr.port() + 1 {
                    return Err(Error::ErrUrlInvalid(
                        "the UDP RTP port must be even and the RTCP port the next one".into(),
                    ));
                }

                let mut rtp = UdpListener::bind(rtp_addr.ip(), rtp_addr.port()).await?;
                let mut rtcp = UdpListener::bind(rtcp_addr.ip(), rtcp_addr.port()).await?;
                rtp.start(cfg.udp_max_payload_size);
                rtcp.start(cfg.udp_max_payload_size);
                (Some(rtp), Some(rtcp))
            }
            _ => (None, None),
        };

        let multicast_range = match &cfg.multicast_ip_range {
            Some(raw) => Some(parse_cidr(raw)?),
            None => None,
        };

        let (closed_tx, _) = watch::channel(false);

        let inner = Arc::new(ServerInner {
            cfg,
            sessions: Mutex::new(HashMap::new()),
            udp_rtp,
            udp_rtcp,
            multicast_range,
            multicast_counter: Mutex::new(0),
            closed_tx,
            local_addr,
        });

        let accept_inner = Arc::clone(&inner);
        let mut closed_rx = inner.closed_rx();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = tcp_listener.accept() => {
                        let (stream, remote_addr) = match res {
                            Ok(v) => v,
                            Err(_) => break,
                        };
                        Server::spawn_conn(&accept_inner, stream, remote_addr);
                    }
                    _ = closed_rx.changed() => break,
                }
            }
        });

        Ok(Server { inner })
    }

    fn spawn_conn(
        inner: &Arc<ServerInner>,
        stream: tokio::net::TcpStream,
        remote_addr: SocketAddr,
    ) {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let boxed: BoxStream = match &inner.cfg.tls_acceptor {
                Some(acceptor) => match acceptor.clone().accept(stream).await {
                    Ok(tls) => Box::new(tls),
                    Err(err) => {
                        log::debug!("TLS handshake with {remote_addr} failed: {err}");
                        return;
                    }
                },
                None => Box::new(stream),
            };

            if let Some(cb) = &inner.cfg.handlers.on_conn_open {
                cb(remote_addr);
            }

            ServerConnTask::run(Arc::clone(&inner), boxed, remote_addr).await;

            if let Some(cb) = &inner.cfg.handlers.on_conn_close {
                cb(remote_addr);
            }
        });
    }

    /// Address of the TCP listener, with the actual port when 0 was
    /// requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Closes the server and every session cooperatively.
    pub fn close(&self) {
        let _ = self.inner.closed_tx.send(true);

        let sessions: Vec<_> = self.inner.sessions.lock().values().cloned().collect();
        for session in sessions {
            session.close(Error::ErrTerminated);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}
