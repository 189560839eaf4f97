use std::time::{Duration, SystemTime};

use util::sync::Mutex;

/// Maps the NTP wall clock reconstructed from sender reports onto a single
/// presentation timeline shared by every track of a session.
///
/// The first packet with a known NTP time anchors the timeline; PTS values
/// of all tracks are offsets from that anchor.
pub(crate) struct GlobalTimeDecoder {
    anchor: Mutex<Option<SystemTime>>,
}

impl GlobalTimeDecoder {
    pub fn new() -> Self {
        GlobalTimeDecoder {
            anchor: Mutex::new(None),
        }
    }

    pub fn pts(&self, ntp: SystemTime) -> Duration {
        let mut anchor = self.anchor.lock();
        let start = *anchor.get_or_insert(ntp);
        ntp.duration_since(start).unwrap_or(Duration::ZERO)
    }
}

// seconds between the NTP epoch (1900) and the Unix epoch (1970)
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// 64-bit NTP timestamp of a wall-clock instant, as carried in sender
/// reports.
pub(crate) fn ntp_from_system_time(t: SystemTime) -> u64 {
    let since_unix = t
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    let secs = since_unix.as_secs() + NTP_UNIX_OFFSET;
    let frac = ((since_unix.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (secs << 32) | frac
}

/// Signed difference between two 32-bit RTP timestamps, accounting for
/// wraparound.
pub(crate) fn rtp_time_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Projects a RTP timestamp onto the wall clock given a (wall clock, RTP
/// timestamp) reference from a sender report.
pub(crate) fn rtp_time_to_ntp(
    ref_ntp: SystemTime,
    ref_rtp: u32,
    clock_rate: u32,
    ts: u32,
) -> SystemTime {
    let diff = rtp_time_diff(ts, ref_rtp) as f64 / clock_rate as f64;
    if diff >= 0.0 {
        ref_ntp + Duration::from_secs_f64(diff)
    } else {
        ref_ntp - Duration::from_secs_f64(-diff)
    }
}

#[cfg(test)]
mod time_decoder_test {
    use super::*;

    #[test]
    fn test_pts_is_anchored_to_first_packet() {
        let dec = GlobalTimeDecoder::new();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);

        assert_eq!(dec.pts(t0), Duration::ZERO);
        assert_eq!(dec.pts(t0 + Duration::from_millis(40)), Duration::from_millis(40));

        // an earlier packet of another track clamps to zero
        assert_eq!(dec.pts(t0 - Duration::from_millis(10)), Duration::ZERO);
    }

    #[test]
    fn test_rtp_time_to_ntp_wraparound() {
        let ref_ntp = SystemTime::UNIX_EPOCH + Duration::from_secs(500);

        let ntp = rtp_time_to_ntp(ref_ntp, u32::MAX - 8999, 90000, 81000);
        assert_eq!(
            ntp.duration_since(SystemTime::UNIX_EPOCH).unwrap(),
            Duration::from_secs(501)
        );
    }
}
