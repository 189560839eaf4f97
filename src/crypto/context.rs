use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder};
use util::marshal::{MarshalSize, Unmarshal};

use super::cipher_aes_cm_hmac_sha1::{rtcp_index, CipherAesCmHmacSha1, AUTH_TAG_LEN};
use crate::error::{Error, Result};

/// Master key plus master salt, as carried by MIKEY.
pub const SRTP_MASTER_LEN: usize = SRTP_MASTER_KEY_LEN + SRTP_MASTER_SALT_LEN;
pub const SRTP_MASTER_KEY_LEN: usize = 16;
pub const SRTP_MASTER_SALT_LEN: usize = 14;

/// Overhead added by SRTP to a RTP packet.
pub const SRTP_OVERHEAD: usize = AUTH_TAG_LEN;
/// Overhead added by SRTCP to a RTCP packet (index plus auth tag).
pub const SRTCP_OVERHEAD: usize = 4 + AUTH_TAG_LEN;

const MAX_ROC_DISORDER: u16 = 100;
const MAX_SEQUENCE_NUMBER: u16 = 65535;
const MAX_SRTCP_INDEX: u32 = 0x7FFF_FFFF;

const REPLAY_WINDOW: u64 = 64;

/// Sliding window replay protection (RFC 3711, section 3.3.2).
#[derive(Default)]
struct ReplayWindow {
    latest: u64,
    seen: bool,
    mask: u64,
}

impl ReplayWindow {
    /// Accepts an index if it is newer than the window or inside it and not
    /// yet seen, and records it.
    fn check(&mut self, index: u64) -> bool {
        if !self.seen {
            self.seen = true;
            self.latest = index;
            self.mask = 1;
            return true;
        }

        if index > self.latest {
            let shift = index - self.latest;
            self.mask = if shift >= REPLAY_WINDOW {
                1
            } else {
                (self.mask << shift) | 1
            };
            self.latest = index;
            return true;
        }

        let offset = self.latest - index;
        if offset >= REPLAY_WINDOW {
            return false;
        }
        if self.mask & (1 << offset) != 0 {
            return false;
        }
        self.mask |= 1 << offset;
        true
    }
}

#[derive(Default)]
struct SrtpSsrcState {
    rollover_counter: u32,
    rollover_has_processed: bool,
    last_sequence_number: u16,
    replay: ReplayWindow,
}

impl SrtpSsrcState {
    /// Guesses the rollover counter of an incoming sequence number, allowing
    /// for packets delivered out of order around a rollover
    /// (RFC 3550, appendix A.1).
    fn next_rollover_count(&self, sequence_number: u16) -> u32 {
        let mut roc = self.rollover_counter;

        if !self.rollover_has_processed {
        } else if sequence_number == 0 {
            if self.last_sequence_number > MAX_ROC_DISORDER {
                roc += 1;
            }
        } else if self.last_sequence_number < MAX_ROC_DISORDER
            && sequence_number > (MAX_SEQUENCE_NUMBER - MAX_ROC_DISORDER)
        {
            roc = roc.wrapping_sub(1);
        } else if sequence_number < MAX_ROC_DISORDER
            && self.last_sequence_number > (MAX_SEQUENCE_NUMBER - MAX_ROC_DISORDER)
        {
            roc += 1;
        }

        roc
    }

    fn update_rollover_count(&mut self, sequence_number: u16) {
        if !self.rollover_has_processed {
            self.rollover_has_processed = true;
        } else if sequence_number == 0 {
            if self.last_sequence_number > MAX_ROC_DISORDER {
                self.rollover_counter += 1;
            }
        } else if self.last_sequence_number < MAX_ROC_DISORDER
            && sequence_number > (MAX_SEQUENCE_NUMBER - MAX_ROC_DISORDER)
        {
            self.rollover_counter = self.rollover_counter.wrapping_sub(1);
        } else if sequence_number < MAX_ROC_DISORDER
            && self.last_sequence_number > (MAX_SEQUENCE_NUMBER - MAX_ROC_DISORDER)
        {
            self.rollover_counter += 1;
        }

        self.last_sequence_number = sequence_number;
    }
}

#[derive(Default)]
struct SrtcpSsrcState {
    index: u32,
    replay: ReplayWindow,
}

/// SRTP/SRTCP encryption and decryption context for one direction,
/// implementing the AES-128-CM + HMAC-SHA1-80 protection profile.
///
/// The context mutates per-SSRC rollover counters, SRTCP indices and replay
/// windows on every call; callers serialize access with a lock.
pub struct Context {
    cipher: CipherAesCmHmacSha1,
    srtp_ssrc_states: HashMap<u32, SrtpSsrcState>,
    srtcp_ssrc_states: HashMap<u32, SrtcpSsrcState>,
}

impl Context {
    /// Creates a context from a 30-byte master (16-byte key plus 14-byte
    /// salt), the expected SSRCs and their optional starting rollover
    /// counters.
    pub fn new(master: &[u8], ssrcs: &[u32], rocs: Option<&[u32]>) -> Result<Context> {
        if master.len() != SRTP_MASTER_LEN {
            return Err(Error::ErrSrtpMasterLength(SRTP_MASTER_LEN, master.len()));
        }

        let cipher = CipherAesCmHmacSha1::new(
            &master[..SRTP_MASTER_KEY_LEN],
            &master[SRTP_MASTER_KEY_LEN..],
        )?;

        let mut ctx = Context {
            cipher,
            srtp_ssrc_states: HashMap::new(),
            srtcp_ssrc_states: HashMap::new(),
        };

        for (i, &ssrc) in ssrcs.iter().enumerate() {
            let roc = rocs.and_then(|r| r.get(i).copied()).unwrap_or(0);
            ctx.set_roc(ssrc, roc);
        }

        Ok(ctx)
    }

    fn srtp_state(&mut self, ssrc: u32) -> &mut SrtpSsrcState {
        self.srtp_ssrc_states.entry(ssrc).or_default()
    }

    fn srtcp_state(&mut self, ssrc: u32) -> &mut SrtcpSsrcState {
        self.srtcp_ssrc_states.entry(ssrc).or_default()
    }

    /// Rollover counter of the given SSRC.
    pub fn roc(&self, ssrc: u32) -> Option<u32> {
        self.srtp_ssrc_states.get(&ssrc).map(|s| s.rollover_counter)
    }

    pub fn set_roc(&mut self, ssrc: u32, roc: u32) {
        let state = self.srtp_state(ssrc);
        state.rollover_counter = roc;
        state.rollover_has_processed = false;
    }

    pub fn encrypt_rtp(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut reader = &plaintext[..];
        let header = rtp::header::Header::unmarshal(&mut reader)
            .map_err(|e| Error::ErrRtpDecode(e.to_string()))?;

        let state = self.srtp_state(header.ssrc);
        let roc = state.next_rollover_count(header.sequence_number);
        state.update_rollover_count(header.sequence_number);

        self.cipher.encrypt_rtp(
            plaintext,
            header.marshal_size(),
            header.sequence_number,
            header.ssrc,
            roc,
        )
    }

    pub fn decrypt_rtp(&mut self, encrypted: &[u8]) -> Result<Vec<u8>> {
        let mut reader = &encrypted[..];
        let header = rtp::header::Header::unmarshal(&mut reader)
            .map_err(|e| Error::ErrRtpDecode(e.to_string()))?;

        let roc = self.srtp_state(header.ssrc).next_rollover_count(header.sequence_number);

        let out = self.cipher.decrypt_rtp(
            encrypted,
            header.marshal_size(),
            header.sequence_number,
            header.ssrc,
            roc,
        )?;

        let index = ((roc as u64) << 16) | header.sequence_number as u64;
        let state = self.srtp_state(header.ssrc);
        if !state.replay.check(index) {
            return Err(Error::ErrSrtpAuthTagMismatch);
        }
        state.update_rollover_count(header.sequence_number);

        Ok(out)
    }

    pub fn encrypt_rtcp(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() < 8 {
            return Err(Error::ErrSrtpTooShort);
        }
        let ssrc = BigEndian::read_u32(&plaintext[4..8]);

        let state = self.srtcp_state(ssrc);
        state.index = (state.index + 1) & MAX_SRTCP_INDEX;
        let index = state.index;

        self.cipher.encrypt_rtcp(plaintext, index, ssrc)
    }

    pub fn decrypt_rtcp(&mut self, encrypted: &[u8]) -> Result<Vec<u8>> {
        let index = rtcp_index(encrypted)?;
        let ssrc = BigEndian::read_u32(&encrypted[4..8]);

        let out = self.cipher.decrypt_rtcp(encrypted)?;

        if !self.srtcp_state(ssrc).replay.check(index as u64) {
            return Err(Error::ErrSrtpAuthTagMismatch);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod context_test {
    use super::*;

    fn test_master() -> Vec<u8> {
        (0u8..30).collect()
    }

    fn build_rtp_packet(seq: u16, ssrc: u32) -> Vec<u8> {
        use util::marshal::Marshal;

        let pkt = rtp::packet::Packet {
            header: rtp::header::Header {
                version: 2,
                payload_type: 96,
                sequence_number: seq,
                timestamp: 3653407706,
                ssrc,
                ..Default::default()
            },
            payload: bytes::Bytes::from_static(&[0x11, 0x22, 0x33, 0x44]),
        };
        pkt.marshal().unwrap().to_vec()
    }

    #[test]
    fn test_rtp_round_trip() {
        let master = test_master();
        let mut enc_ctx = Context::new(&master, &[0xCAFEBABE], None).unwrap();
        let mut dec_ctx = Context::new(&master, &[0xCAFEBABE], None).unwrap();

        let plain = build_rtp_packet(1234, 0xCAFEBABE);
        let protected = enc_ctx.encrypt_rtp(&plain).unwrap();
        assert_eq!(protected.len(), plain.len() + SRTP_OVERHEAD);
        assert_ne!(&protected[..plain.len()], &plain[..]);

        let decrypted = dec_ctx.decrypt_rtp(&protected).unwrap();
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn test_rtp_tampered_auth_tag() {
        let master = test_master();
        let mut enc_ctx = Context::new(&master, &[1], None).unwrap();
        let mut dec_ctx = Context::new(&master, &[1], None).unwrap();

        let mut protected = enc_ctx.encrypt_rtp(&build_rtp_packet(5, 1)).unwrap();
        let last = protected.len() - 1;
        protected[last] ^= 0xFF;

        assert_eq!(
            dec_ctx.decrypt_rtp(&protected),
            Err(Error::ErrSrtpAuthTagMismatch)
        );
    }

    #[test]
    fn test_rtp_replayed_packet() {
        let master = test_master();
        let mut enc_ctx = Context::new(&master, &[1], None).unwrap();
        let mut dec_ctx = Context::new(&master, &[1], None).unwrap();

        let protected = enc_ctx.encrypt_rtp(&build_rtp_packet(5, 1)).unwrap();
        dec_ctx.decrypt_rtp(&protected).unwrap();
        assert!(dec_ctx.decrypt_rtp(&protected).is_err());
    }

    #[test]
    fn test_rtcp_round_trip() {
        use util::marshal::Marshal;

        let master = test_master();
        let mut enc_ctx = Context::new(&master, &[0xDEADBEEF], None).unwrap();
        let mut dec_ctx = Context::new(&master, &[0xDEADBEEF], None).unwrap();

        let sr = rtcp::sender_report::SenderReport {
            ssrc: 0xDEADBEEF,
            ntp_time: 0x0102030405060708,
            rtp_time: 0x11223344,
            packet_count: 5,
            octet_count: 800,
            ..Default::default()
        };
        let plain = sr.marshal().unwrap().to_vec();

        let protected = enc_ctx.encrypt_rtcp(&plain).unwrap();
        assert_eq!(protected.len(), plain.len() + SRTCP_OVERHEAD);

        let decrypted = dec_ctx.decrypt_rtcp(&protected).unwrap();
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn test_roc_seeding() {
        let master = test_master();

        // encrypt with a context whose ROC starts at 1
        let mut enc_ctx = Context::new(&master, &[7], Some(&[1])).unwrap();
        let protected = enc_ctx.encrypt_rtp(&build_rtp_packet(10, 7)).unwrap();

        // a context without the seed cannot authenticate the packet
        let mut dec_ctx = Context::new(&master, &[7], None).unwrap();
        assert!(dec_ctx.decrypt_rtp(&protected).is_err());

        // a context with the same seed can
        let mut dec_ctx = Context::new(&master, &[7], Some(&[1])).unwrap();
        assert!(dec_ctx.decrypt_rtp(&protected).is_ok());
    }
}
