use std::time::{Duration, SystemTime};

use super::time_decoder::rtp_time_to_ntp;

/// Receiver-side RTCP bookkeeping for one format: loss, jitter and the
/// NTP/RTP mapping learned from sender reports, plus periodic receiver
/// report generation (RFC 3550, section 6.4.2).
pub(crate) struct RtcpReceiver {
    receiver_ssrc: u32,
    clock_rate: f64,

    packets: Vec<u64>,
    started: bool,
    seq_num_cycles: u16,
    last_seq_num: i32,
    last_report_seq_num: i32,
    last_rtp_time_rtp: u32,
    last_rtp_time_time: SystemTime,
    jitter: f64,
    total_lost: u32,

    last_sender_report: u32,
    last_sender_report_time: SystemTime,
    last_sender_report_ntp: Option<SystemTime>,
    last_sender_report_rtp: u32,
}

impl RtcpReceiver {
    pub fn new(clock_rate: u32, receiver_ssrc: u32) -> Self {
        RtcpReceiver {
            receiver_ssrc,
            clock_rate: clock_rate as f64,
            packets: vec![0u64; 128],
            started: false,
            seq_num_cycles: 0,
            last_seq_num: 0,
            last_report_seq_num: 0,
            last_rtp_time_rtp: 0,
            last_rtp_time_time: SystemTime::UNIX_EPOCH,
            jitter: 0.0,
            total_lost: 0,
            last_sender_report: 0,
            last_sender_report_time: SystemTime::UNIX_EPOCH,
            last_sender_report_ntp: None,
            last_sender_report_rtp: 0,
        }
    }

    fn set_received(&mut self, seq: u16) {
        let pos = (seq as usize) % (self.packets.len() * 64);
        self.packets[pos / 64] |= 1 << (pos % 64);
    }

    fn del_received(&mut self, seq: u16) {
        let pos = (seq as usize) % (self.packets.len() * 64);
        self.packets[pos / 64] &= u64::MAX ^ (1u64 << (pos % 64));
    }

    fn get_received(&self, seq: u16) -> bool {
        let pos = (seq as usize) % (self.packets.len() * 64);
        (self.packets[pos / 64] & (1 << (pos % 64))) != 0
    }

    pub fn process_rtp(&mut self, now: SystemTime, header: &rtp::header::Header) {
        let sequence_number = header.sequence_number;

        if !self.started {
            self.started = true;
            self.set_received(sequence_number);
            self.last_seq_num = sequence_number as i32;
            self.last_report_seq_num = sequence_number as i32 - 1;
        } else {
            self.set_received(sequence_number);

            let diff = sequence_number as i32 - self.last_seq_num;
            if diff > 0 || diff < -0x0FFF {
                if diff < -0x0FFF {
                    // overflow
                    self.seq_num_cycles += 1;
                }

                // mark not yet seen packets in between as missing
                let mut i = (self.last_seq_num as u16).wrapping_add(1);
                while i != sequence_number {
                    self.del_received(i);
                    i = i.wrapping_add(1);
                }

                self.last_seq_num = sequence_number as i32;
            }

            // interarrival jitter (RFC 3550, page 39)
            let d = now
                .duration_since(self.last_rtp_time_time)
                .unwrap_or(Duration::ZERO)
                .as_secs_f64()
                * self.clock_rate
                - (header.timestamp as f64 - self.last_rtp_time_rtp as f64);
            self.jitter += (d.abs() - self.jitter) / 16.0;
        }

        self.last_rtp_time_rtp = header.timestamp;
        self.last_rtp_time_time = now;
    }

    pub fn process_sender_report(
        &mut self,
        now: SystemTime,
        sr: &rtcp::sender_report::SenderReport,
    ) {
        self.last_sender_report = (sr.ntp_time >> 16) as u32;
        self.last_sender_report_time = now;

        let secs = (sr.ntp_time >> 32).saturating_sub(2_208_988_800);
        let frac_nanos = ((sr.ntp_time & 0xFFFF_FFFF) * 1_000_000_000) >> 32;
        self.last_sender_report_ntp = Some(
            SystemTime::UNIX_EPOCH + Duration::new(secs, frac_nanos as u32),
        );
        self.last_sender_report_rtp = sr.rtp_time;
    }

    /// Wall clock of a packet, from the sender-report NTP/RTP mapping.
    pub fn packet_ntp(&self, ts: u32) -> Option<SystemTime> {
        let ref_ntp = self.last_sender_report_ntp?;
        Some(rtp_time_to_ntp(
            ref_ntp,
            self.last_sender_report_rtp,
            self.clock_rate as u32,
            ts,
        ))
    }

    pub fn total_lost(&self) -> u32 {
        self.total_lost
    }

    pub fn generate_report(
        &mut self,
        now: SystemTime,
        remote_ssrc: u32,
    ) -> rtcp::receiver_report::ReceiverReport {
        let total_since_report = (self.last_seq_num - self.last_report_seq_num) as u16;
        let mut total_lost_since_report = {
            if self.last_seq_num == self.last_report_seq_num {
                0
            } else {
                let mut ret = 0u32;
                let mut i = (self.last_report_seq_num + 1) as u16;
                while i != self.last_seq_num as u16 {
                    if !self.get_received(i) {
                        ret += 1;
                    }
                    i = i.wrapping_add(1);
                }
                ret
            }
        };

        self.total_lost = self.total_lost.saturating_add(total_lost_since_report);

        // both fields allow up to 24 bits
        if total_lost_since_report > 0xFFFFFF {
            total_lost_since_report = 0xFFFFFF;
        }
        if self.total_lost > 0xFFFFFF {
            self.total_lost = 0xFFFFFF;
        }

        let r = rtcp::receiver_report::ReceiverReport {
            ssrc: self.receiver_ssrc,
            reports: vec![rtcp::reception_report::ReceptionReport {
                ssrc: remote_ssrc,
                last_sequence_number: (self.seq_num_cycles as u32) << 16
                    | (self.last_seq_num as u32 & 0xFFFF),
                last_sender_report: self.last_sender_report,
                fraction_lost: if total_since_report > 0 {
                    ((total_lost_since_report * 256) as f64 / total_since_report as f64) as u8
                } else {
                    0
                },
                total_lost: self.total_lost,
                delay: {
                    if self.last_sender_report_time == SystemTime::UNIX_EPOCH {
                        0
                    } else {
                        match now.duration_since(self.last_sender_report_time) {
                            Ok(d) => (d.as_secs_f64() * 65536.0) as u32,
                            Err(_) => 0,
                        }
                    }
                },
                jitter: self.jitter as u32,
            }],
            ..Default::default()
        };

        self.last_report_seq_num = self.last_seq_num;

        r
    }
}

#[cfg(test)]
mod rtcp_receiver_test {
    use super::*;

    fn header(seq: u16, ts: u32) -> rtp::header::Header {
        rtp::header::Header {
            version: 2,
            payload_type: 96,
            sequence_number: seq,
            timestamp: ts,
            ssrc: 0xABCD,
            ..Default::default()
        }
    }

    #[test]
    fn test_loss_accounting() {
        let mut rr = RtcpReceiver::new(90000, 0x1111);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);

        rr.process_rtp(t0, &header(100, 0));
        rr.process_rtp(t0 + Duration::from_millis(40), &header(101, 3600));
        // 102 and 103 lost
        rr.process_rtp(t0 + Duration::from_millis(160), &header(104, 14400));

        let report = rr.generate_report(t0 + Duration::from_secs(1), 0xABCD);
        assert_eq!(report.ssrc, 0x1111);
        assert_eq!(report.reports.len(), 1);
        assert_eq!(report.reports[0].ssrc, 0xABCD);
        assert_eq!(report.reports[0].total_lost, 2);
        assert_eq!(report.reports[0].last_sequence_number, 104);
        assert_eq!(rr.total_lost(), 2);
    }

    #[test]
    fn test_sequence_cycle() {
        let mut rr = RtcpReceiver::new(90000, 0x1111);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);

        rr.process_rtp(t0, &header(65534, 0));
        rr.process_rtp(t0 + Duration::from_millis(40), &header(65535, 3600));
        rr.process_rtp(t0 + Duration::from_millis(80), &header(0, 7200));

        let report = rr.generate_report(t0 + Duration::from_secs(1), 0xABCD);
        assert_eq!(report.reports[0].last_sequence_number, 1 << 16);
        assert_eq!(report.reports[0].total_lost, 0);
    }

    #[test]
    fn test_packet_ntp_from_sender_report() {
        let mut rr = RtcpReceiver::new(90000, 0x1111);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);

        assert!(rr.packet_ntp(0).is_none());

        let sr = rtcp::sender_report::SenderReport {
            ssrc: 0xABCD,
            // 2208988800 + 1000 seconds in NTP format
            ntp_time: (2_208_988_800u64 + 1000) << 32,
            rtp_time: 90000,
            ..Default::default()
        };
        rr.process_sender_report(t0, &sr);

        let ntp = rr.packet_ntp(180000).unwrap();
        assert_eq!(
            ntp.duration_since(SystemTime::UNIX_EPOCH).unwrap(),
            Duration::from_secs(1001)
        );
    }
}
