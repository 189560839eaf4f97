use std::time::SystemTime;

use super::rtcp_receiver::RtcpReceiver;
use super::rtcp_sender::RtcpSender;
use super::OnPacketRtpFn;
use crate::description::Format;

/// Per-(media, payload type) state: fixed local SSRC, learned remote SSRC
/// and the RTCP machinery of the media's direction.
pub(crate) struct FormatEndpoint {
    pub format: Format,
    pub local_ssrc: u32,
    pub remote_ssrc: Option<u32>,
    pub rtcp_receiver: Option<RtcpReceiver>,
    pub rtcp_sender: Option<RtcpSender>,
    pub on_packet_rtp: Option<OnPacketRtpFn>,
}

impl FormatEndpoint {
    /// An endpoint that receives RTP and emits receiver reports.
    pub fn new_receiver(format: Format, local_ssrc: u32) -> Self {
        let rtcp_receiver = Some(RtcpReceiver::new(format.clock_rate, local_ssrc));
        FormatEndpoint {
            format,
            local_ssrc,
            remote_ssrc: None,
            rtcp_receiver,
            rtcp_sender: None,
            on_packet_rtp: None,
        }
    }

    /// An endpoint that sends RTP and emits sender reports.
    pub fn new_sender(format: Format, local_ssrc: u32) -> Self {
        let rtcp_sender = Some(RtcpSender::new(format.clock_rate, local_ssrc));
        FormatEndpoint {
            format,
            local_ssrc,
            remote_ssrc: None,
            rtcp_receiver: None,
            rtcp_sender,
            on_packet_rtp: None,
        }
    }

    pub fn process_rtp(&mut self, now: SystemTime, pkt: rtp::packet::Packet) {
        if self.remote_ssrc.is_none() {
            self.remote_ssrc = Some(pkt.header.ssrc);
        }

        if let Some(receiver) = &mut self.rtcp_receiver {
            receiver.process_rtp(now, &pkt.header);
        }

        if let Some(cb) = &mut self.on_packet_rtp {
            cb(pkt);
        }
    }

    pub fn process_sender_report(
        &mut self,
        now: SystemTime,
        sr: &rtcp::sender_report::SenderReport,
    ) {
        if self.remote_ssrc.is_none() {
            self.remote_ssrc = Some(sr.ssrc);
        }
        if let Some(receiver) = &mut self.rtcp_receiver {
            receiver.process_sender_report(now, sr);
        }
    }

    /// Wall clock of a packet timestamp, once a sender report has been
    /// received.
    pub fn packet_ntp(&self, ts: u32) -> Option<SystemTime> {
        self.rtcp_receiver.as_ref()?.packet_ntp(ts)
    }
}
