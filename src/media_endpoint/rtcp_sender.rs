use std::time::{Duration, SystemTime};

use super::time_decoder::ntp_from_system_time;

/// Sender-side RTCP bookkeeping for one format: counters and the last
/// (RTP timestamp, wall clock) pair, used both for periodic sender reports
/// (RFC 3550, section 6.4.1) and for RTP-Info generation on PLAY.
pub(crate) struct RtcpSender {
    ssrc: u32,
    clock_rate: f64,

    initialized: bool,
    last_sequence_number: u16,
    last_rtp_time_rtp: u32,
    last_rtp_time_time: SystemTime,
    packet_count: u32,
    octet_count: u32,
}

impl RtcpSender {
    pub fn new(clock_rate: u32, ssrc: u32) -> Self {
        RtcpSender {
            ssrc,
            clock_rate: clock_rate as f64,
            initialized: false,
            last_sequence_number: 0,
            last_rtp_time_rtp: 0,
            last_rtp_time_time: SystemTime::UNIX_EPOCH,
            packet_count: 0,
            octet_count: 0,
        }
    }

    pub fn process_rtp(
        &mut self,
        now: SystemTime,
        header: &rtp::header::Header,
        payload_len: usize,
    ) {
        self.initialized = true;
        self.last_sequence_number = header.sequence_number;
        // always update the mapping to minimize drift
        self.last_rtp_time_rtp = header.timestamp;
        self.last_rtp_time_time = now;

        self.packet_count = self.packet_count.wrapping_add(1);
        self.octet_count = self.octet_count.wrapping_add(payload_len as u32);
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    pub fn generate_report(&self, now: SystemTime) -> rtcp::sender_report::SenderReport {
        rtcp::sender_report::SenderReport {
            ssrc: self.ssrc,
            ntp_time: ntp_from_system_time(now),
            rtp_time: self.projected_rtp_time(now, 0),
            packet_count: self.packet_count,
            octet_count: self.octet_count,
            ..Default::default()
        }
    }

    /// Next sequence number plus a projected RTP timestamp, as carried in a
    /// RTP-Info entry. The timestamp is backed off by a tenth of a second so
    /// the decoding timestamp can never exceed the presentation timestamp.
    pub fn rtp_info_entry(&self, now: SystemTime) -> Option<(u16, u32)> {
        if !self.initialized {
            return None;
        }
        Some((
            self.last_sequence_number.wrapping_add(1),
            self.projected_rtp_time(now, (self.clock_rate / 10.0) as u32),
        ))
    }

    fn projected_rtp_time(&self, now: SystemTime, backoff: u32) -> u32 {
        let elapsed = now
            .duration_since(self.last_rtp_time_time)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        self.last_rtp_time_rtp
            .wrapping_add((elapsed * self.clock_rate) as u32)
            .wrapping_sub(backoff)
    }
}

#[cfg(test)]
mod rtcp_sender_test {
    use super::*;

    fn header(seq: u16, ts: u32) -> rtp::header::Header {
        rtp::header::Header {
            version: 2,
            payload_type: 96,
            sequence_number: seq,
            timestamp: ts,
            ssrc: 0x2222,
            ..Default::default()
        }
    }

    #[test]
    fn test_generate_report() {
        let mut sender = RtcpSender::new(90000, 0x2222);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(500);

        sender.process_rtp(t0, &header(100, 45000), 1200);
        sender.process_rtp(t0 + Duration::from_millis(40), &header(101, 48600), 800);

        let sr = sender.generate_report(t0 + Duration::from_secs(1));
        assert_eq!(sr.ssrc, 0x2222);
        assert_eq!(sr.packet_count, 2);
        assert_eq!(sr.octet_count, 2000);
        // 960 ms after the last packet at clock rate 90000
        assert_eq!(sr.rtp_time, 48600 + 86400);
    }

    #[test]
    fn test_rtp_info_entry() {
        let mut sender = RtcpSender::new(90000, 0x2222);
        assert!(sender.rtp_info_entry(SystemTime::now()).is_none());

        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(500);
        sender.process_rtp(t0, &header(655, 90000), 1000);

        let (seq, ts) = sender.rtp_info_entry(t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(seq, 656);
        // two seconds ahead minus the 100 ms safety margin
        assert_eq!(ts, 90000 + 180000 - 9000);
    }
}
