use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use util::sync::Mutex;

use crate::error::{Error, Result};

/// Callback invoked with each datagram read from a listener, after source
/// filtering. Dispatch happens on the listener's read task.
pub(crate) type UdpReadFn = Box<dyn FnMut(&[u8]) + Send>;

const RANDOM_PORT_BASE: u16 = 10000;
const RANDOM_PORT_ATTEMPTS: usize = 1024;

/// A single UDP socket with a read loop that demultiplexes inbound
/// datagrams to per-source callbacks.
///
/// Sources are keyed by (remote IP, remote port); for multicast RTCP the
/// same table fans sender reports out to every subscribed reader.
pub(crate) struct UdpListener {
    socket: Arc<UdpSocket>,
    port: u16,
    read_fns: Arc<Mutex<HashMap<(IpAddr, u16), UdpReadFn>>>,
    // multicast subscribers, matched on source IP alone
    ip_read_fns: Arc<Mutex<HashMap<IpAddr, UdpReadFn>>>,
    close_tx: Option<mpsc::Sender<()>>,
}

impl UdpListener {
    pub async fn bind(ip: IpAddr, port: u16) -> Result<UdpListener> {
        let socket = UdpSocket::bind(SocketAddr::new(ip, port)).await?;
        let port = socket.local_addr()?.port();

        Ok(UdpListener {
            socket: Arc::new(socket),
            port,
            read_fns: Arc::new(Mutex::new(HashMap::new())),
            ip_read_fns: Arc::new(Mutex::new(HashMap::new())),
            close_tx: None,
        })
    }

    /// Binds an (even, odd) RTP/RTCP port pair on consecutive ports,
    /// drawing random candidates until both sockets bind.
    pub async fn bind_pair(ip: IpAddr) -> Result<(UdpListener, UdpListener)> {
        for _ in 0..RANDOM_PORT_ATTEMPTS {
            let v: u16 = rand::thread_rng().gen_range(0..(65535 - RANDOM_PORT_BASE) / 2);
            let rtp_port = v * 2 + RANDOM_PORT_BASE;

            let rtp = match UdpListener::bind(ip, rtp_port).await {
                Ok(l) => l,
                Err(_) => continue,
            };
            match UdpListener::bind(ip, rtp_port + 1).await {
                Ok(rtcp) => return Ok((rtp, rtcp)),
                // drop the RTP socket and retry with another pair
                Err(_) => continue,
            }
        }

        Err(Error::Io("unable to allocate an UDP port pair".into()))
    }

    /// Binds on the multicast group port and joins the group.
    pub async fn bind_multicast(group: Ipv4Addr, port: u16) -> Result<UdpListener> {
        let listener = UdpListener::bind(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port).await?;
        listener
            .socket
            .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        listener.socket.set_multicast_ttl_v4(127)?;
        Ok(listener)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    pub fn register(&self, source: (IpAddr, u16), read_fn: UdpReadFn) {
        self.read_fns.lock().insert(source, read_fn);
    }

    pub fn unregister(&self, source: &(IpAddr, u16)) {
        self.read_fns.lock().remove(source);
    }

    pub fn register_ip(&self, source_ip: IpAddr, read_fn: UdpReadFn) {
        self.ip_read_fns.lock().insert(source_ip, read_fn);
    }

    pub fn unregister_ip(&self, source_ip: &IpAddr) {
        self.ip_read_fns.lock().remove(source_ip);
    }

    /// Spawns the read loop. Each read uses a bounded buffer of
    /// `max_payload_size + 1` bytes, so oversized datagrams surface as
    /// payloads longer than `max_payload_size`.
    pub fn start(&mut self, max_payload_size: usize) {
        if self.close_tx.is_some() {
            return;
        }
        let (close_tx, mut close_rx) = mpsc::channel(1);
        self.close_tx = Some(close_tx);

        let socket = Arc::clone(&self.socket);
        let read_fns = Arc::clone(&self.read_fns);
        let ip_read_fns = Arc::clone(&self.ip_read_fns);

        tokio::spawn(async move {
            let mut buf = vec![0u8; max_payload_size + 1];
            loop {
                tokio::select! {
                    res = socket.recv_from(&mut buf) => {
                        let (n, source) = match res {
                            Ok(v) => v,
                            Err(_) => break,
                        };
                        let key = (source.ip(), source.port());
                        {
                            let mut read_fns = read_fns.lock();
                            if let Some(read_fn) = read_fns.get_mut(&key) {
                                read_fn(&buf[..n]);
                                continue;
                            }
                        }
                        let mut ip_read_fns = ip_read_fns.lock();
                        if let Some(read_fn) = ip_read_fns.get_mut(&key.0) {
                            read_fn(&buf[..n]);
                        }
                    }
                    _ = close_rx.recv() => break,
                }
            }
        });
    }

    pub fn close(&self) {
        if let Some(tx) = &self.close_tx {
            let _ = tx.try_send(());
        }
    }
}

impl Drop for UdpListener {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod udp_test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_bind_pair_is_even_odd() {
        let (rtp, rtcp) = UdpListener::bind_pair(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await
            .unwrap();
        assert_eq!(rtp.port() % 2, 0);
        assert_eq!(rtcp.port(), rtp.port() + 1);
        assert!(rtp.port() >= RANDOM_PORT_BASE);
    }

    #[tokio::test]
    async fn test_source_filtering() {
        let mut listener = UdpListener::bind_pair(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await
            .unwrap()
            .0;

        let received = Arc::new(AtomicUsize::new(0));
        let received2 = Arc::clone(&received);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender_port = sender.local_addr().unwrap().port();

        listener.register(
            (IpAddr::V4(Ipv4Addr::LOCALHOST), sender_port),
            Box::new(move |payload| {
                assert_eq!(payload, b"hello");
                received2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        listener.start(1472);

        sender
            .send_to(b"hello", ("127.0.0.1", listener.port()))
            .await
            .unwrap();

        // a datagram from an unregistered source is dropped
        let other = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        other
            .send_to(b"ignored", ("127.0.0.1", listener.port()))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_oversized_datagram_is_visible() {
        let mut listener = UdpListener::bind_pair(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await
            .unwrap()
            .0;

        let seen_len = Arc::new(AtomicUsize::new(0));
        let seen_len2 = Arc::clone(&seen_len);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        listener.register(
            (IpAddr::V4(Ipv4Addr::LOCALHOST), sender.local_addr().unwrap().port()),
            Box::new(move |payload| {
                seen_len2.store(payload.len(), Ordering::SeqCst);
            }),
        );
        listener.start(16);

        sender
            .send_to(&[0u8; 64], ("127.0.0.1", listener.port()))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        // the read buffer is max + 1 bytes, so the payload arrives truncated
        // to 17 bytes and the media layer reports it as too big
        assert_eq!(seen_len.load(Ordering::SeqCst), 17);
    }
}
