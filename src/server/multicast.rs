use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::Bytes;

use super::ServerInner;
use crate::error::Result;
use crate::transport::{UdpListener, UdpReadFn, WriteJob, Writer, WriterHandle};

/// Sends the packets of one stream media to a multicast group, and receives
/// the RTCP reports of its subscribers.
///
/// Created when the first multicast reader attaches to a stream, closed when
/// the last one detaches. It survives PAUSE, so receiver reports keep
/// flowing while readers are paused.
pub(crate) struct MulticastWriter {
    pub group: Ipv4Addr,
    pub rtp_port: u16,
    pub rtcp_port: u16,
    rtp_listener: UdpListener,
    rtcp_listener: UdpListener,
    _writer: Writer,
    handle: WriterHandle,
}

impl MulticastWriter {
    pub async fn new(server: &ServerInner) -> Result<MulticastWriter> {
        let group = server.next_multicast_ip()?;
        let rtp_port = server.cfg.multicast_rtp_port;
        let rtcp_port = server.cfg.multicast_rtcp_port;

        let rtp_listener = UdpListener::bind_multicast(group, rtp_port).await?;
        let mut rtcp_listener = UdpListener::bind_multicast(group, rtcp_port).await?;
        rtcp_listener.start(server.cfg.udp_max_payload_size);

        let (mut writer, _error_rx) = Writer::new(server.cfg.write_queue_size);
        writer.start();
        let handle = writer.handle();

        Ok(MulticastWriter {
            group,
            rtp_port,
            rtcp_port,
            rtp_listener,
            rtcp_listener,
            _writer: writer,
            handle,
        })
    }

    pub fn queue(&self, data: Bytes, rtcp: bool) -> Result<()> {
        let (socket, port) = if rtcp {
            (self.rtcp_listener.socket(), self.rtcp_port)
        } else {
            (self.rtp_listener.socket(), self.rtp_port)
        };
        let addr = SocketAddr::from((self.group, port));

        self.handle.push(WriteJob(Box::new(move || {
            Box::pin(async move {
                let _ = socket.send_to(&data, addr).await;
                Ok(())
            })
        })))
    }

    /// Registers the RTCP read callback of a subscriber, matched on its
    /// source IP.
    pub fn register_reader(&self, ip: IpAddr, read_fn: UdpReadFn) {
        self.rtcp_listener.register_ip(ip, read_fn);
    }

    pub fn unregister_reader(&self, ip: &IpAddr) {
        self.rtcp_listener.unregister_ip(ip);
    }
}
