use std::time::{Duration, SystemTime};

use byteorder::{BigEndian, ByteOrder};
use rand::Rng;

use super::context::SRTP_MASTER_LEN;
use crate::error::{Error, Result};

const MIKEY_VERSION: u8 = 1;

// payload types (RFC 3830, section 6)
const PAYLOAD_LAST: u8 = 0;
const PAYLOAD_KEMAC: u8 = 1;
const PAYLOAD_T: u8 = 5;
const PAYLOAD_SP: u8 = 10;
const PAYLOAD_RAND: u8 = 11;

const TS_TYPE_NTP_UTC: u8 = 0;
const CS_ID_MAP_TYPE_SRTP: u8 = 0;
const KEY_TYPE_TEK: u8 = 2;

const RAND_LEN: usize = 16;

/// Required SRTP policy: AES-128-CM encryption with a 16-byte session key,
/// HMAC-SHA1 authentication, SRTP and SRTCP both encrypted and
/// authenticated. Any other policy is rejected.
const REQUIRED_POLICY: [(u8, u8); 7] = [
    (0, 1),  // encryption algorithm: AES-CM
    (1, 16), // session encryption key length
    (2, 1),  // authentication algorithm: HMAC-SHA1
    (3, 10), // session authentication key length
    (7, 1),  // SRTP encryption on
    (8, 1),  // SRTCP encryption on
    (10, 1), // SRTP authentication on
];

const MAX_CLOCK_SKEW: Duration = Duration::from_secs(3600);

// seconds between the NTP epoch (1900) and the Unix epoch (1970)
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

pub(crate) fn ntp_time(t: SystemTime) -> u64 {
    let since_unix = t
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    let secs = since_unix.as_secs() + NTP_UNIX_OFFSET;
    let frac = ((since_unix.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (secs << 32) | frac
}

fn unix_time(ntp: u64) -> SystemTime {
    let secs = (ntp >> 32).saturating_sub(NTP_UNIX_OFFSET);
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn read(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Error::ErrMikeyInvalid("message is truncated".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(BigEndian::read_u16(self.read(2)?))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.read(4)?))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(BigEndian::read_u64(self.read(8)?))
    }
}

/// The MIKEY subset used by SETUP key management (RFC 3830): a common
/// header with a SRTP CS ID map, plus T, RAND, SP and KEMAC payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MikeyMessage {
    pub csb_id: u32,
    /// (SSRC, ROC) pairs from the CS ID map.
    pub entries: Vec<(u32, u32)>,
    pub ntp_time: u64,
    pub rand: Vec<u8>,
    /// The 30-byte SRTP master (key plus salt) from the KEMAC payload.
    pub key: Vec<u8>,
}

impl MikeyMessage {
    /// Builds an outbound message carrying the given master and
    /// per-SSRC rollover counters.
    pub fn new(key: &[u8], entries: Vec<(u32, u32)>) -> MikeyMessage {
        let mut rng = rand::thread_rng();
        MikeyMessage {
            csb_id: rng.gen(),
            entries,
            ntp_time: ntp_time(SystemTime::now()),
            rand: (0..RAND_LEN).map(|_| rng.gen()).collect(),
            key: key.to_vec(),
        }
    }

    /// Decodes and validates a message.
    ///
    /// The timestamp must be within one hour of the local wall clock, the
    /// security policy must match [`REQUIRED_POLICY`] exactly, and the KEMAC
    /// must carry exactly one key of 30 bytes.
    pub fn unmarshal(buf: &[u8]) -> Result<MikeyMessage> {
        let mut r = Reader::new(buf);

        let version = r.read_u8()?;
        if version != MIKEY_VERSION {
            return Err(Error::ErrMikeyInvalid(format!(
                "unsupported version {version}"
            )));
        }
        let _data_type = r.read_u8()?;
        let mut next_payload = r.read_u8()?;
        let _v_prf = r.read_u8()?;
        let csb_id = r.read_u32()?;
        let n_cs = r.read_u8()?;
        let map_type = r.read_u8()?;
        if map_type != CS_ID_MAP_TYPE_SRTP {
            return Err(Error::ErrMikeyInvalid(format!(
                "unsupported CS ID map type {map_type}"
            )));
        }

        let mut entries = Vec::with_capacity(n_cs as usize);
        for _ in 0..n_cs {
            let _policy_no = r.read_u8()?;
            let ssrc = r.read_u32()?;
            let roc = r.read_u32()?;
            entries.push((ssrc, roc));
        }

        let mut t_ntp = None;
        let mut rand_bytes = None;
        let mut sp_params = None;
        let mut kemac_keys = None;

        while next_payload != PAYLOAD_LAST {
            let cur = next_payload;
            next_payload = r.read_u8()?;

            match cur {
                PAYLOAD_T => {
                    let ts_type = r.read_u8()?;
                    if ts_type != TS_TYPE_NTP_UTC {
                        return Err(Error::ErrMikeyInvalid(format!(
                            "unsupported timestamp type {ts_type}"
                        )));
                    }
                    t_ntp = Some(r.read_u64()?);
                }
                PAYLOAD_RAND => {
                    let len = r.read_u8()? as usize;
                    rand_bytes = Some(r.read(len)?.to_vec());
                }
                PAYLOAD_SP => {
                    let _policy_no = r.read_u8()?;
                    let prot_type = r.read_u8()?;
                    if prot_type != 0 {
                        return Err(Error::ErrMikeyUnsupportedPolicy);
                    }
                    let params_len = r.read_u16()? as usize;
                    let params_end = r.pos + params_len;

                    let mut params = Vec::new();
                    while r.pos < params_end {
                        let typ = r.read_u8()?;
                        let len = r.read_u8()? as usize;
                        let value = r.read(len)?.to_vec();
                        params.push((typ, value));
                    }
                    sp_params = Some(params);
                }
                PAYLOAD_KEMAC => {
                    let encr_alg = r.read_u8()?;
                    if encr_alg != 0 {
                        return Err(Error::ErrMikeyUnsupportedPolicy);
                    }
                    let encr_len = r.read_u16()? as usize;
                    let encr_end = r.pos + encr_len;

                    let mut keys = Vec::new();
                    while r.pos < encr_end {
                        let _sub_next = r.read_u8()?;
                        let _type_kv = r.read_u8()?;
                        let key_len = r.read_u16()? as usize;
                        keys.push(r.read(key_len)?.to_vec());
                    }
                    kemac_keys = Some(keys);

                    let mac_alg = r.read_u8()?;
                    if mac_alg != 0 {
                        return Err(Error::ErrMikeyUnsupportedPolicy);
                    }
                }
                other => {
                    return Err(Error::ErrMikeyInvalid(format!(
                        "unsupported payload type {other}"
                    )));
                }
            }
        }

        // timestamp within one hour of the local clock
        let ntp = t_ntp.ok_or_else(|| Error::ErrMikeyInvalid("T payload is missing".into()))?;
        let remote = unix_time(ntp);
        let now = SystemTime::now();
        let skew = match now.duration_since(remote) {
            Ok(d) => d,
            Err(e) => e.duration(),
        };
        if skew > MAX_CLOCK_SKEW {
            return Err(Error::ErrMikeyClockSkew);
        }

        // exact policy match
        let params =
            sp_params.ok_or_else(|| Error::ErrMikeyInvalid("SP payload is missing".into()))?;
        for (typ, expected) in REQUIRED_POLICY {
            let found = params
                .iter()
                .find(|(t, _)| *t == typ)
                .ok_or(Error::ErrMikeyUnsupportedPolicy)?;
            if found.1 != [expected] {
                return Err(Error::ErrMikeyUnsupportedPolicy);
            }
        }

        // exactly one key of 30 bytes
        let keys =
            kemac_keys.ok_or_else(|| Error::ErrMikeyInvalid("KEMAC payload is missing".into()))?;
        if keys.len() != 1 || keys[0].len() != SRTP_MASTER_LEN {
            return Err(Error::ErrMikeyInvalid("invalid KEMAC key data".into()));
        }

        Ok(MikeyMessage {
            csb_id,
            entries,
            ntp_time: ntp,
            rand: rand_bytes
                .ok_or_else(|| Error::ErrMikeyInvalid("RAND payload is missing".into()))?,
            key: keys.into_iter().next().unwrap(),
        })
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);

        // common header
        out.push(MIKEY_VERSION);
        out.push(0); // pre-shared key message
        out.push(PAYLOAD_T);
        out.push(0); // V=0, PRF=MIKEY-1
        out.extend_from_slice(&self.csb_id.to_be_bytes());
        out.push(self.entries.len() as u8);
        out.push(CS_ID_MAP_TYPE_SRTP);
        for (i, (ssrc, roc)) in self.entries.iter().enumerate() {
            out.push(i as u8 + 1);
            out.extend_from_slice(&ssrc.to_be_bytes());
            out.extend_from_slice(&roc.to_be_bytes());
        }

        // T
        out.push(PAYLOAD_RAND);
        out.push(TS_TYPE_NTP_UTC);
        out.extend_from_slice(&self.ntp_time.to_be_bytes());

        // RAND
        out.push(PAYLOAD_SP);
        out.push(self.rand.len() as u8);
        out.extend_from_slice(&self.rand);

        // SP
        out.push(PAYLOAD_KEMAC);
        out.push(0); // policy number
        out.push(0); // protection type: SRTP
        out.extend_from_slice(&((REQUIRED_POLICY.len() * 3) as u16).to_be_bytes());
        for (typ, value) in REQUIRED_POLICY {
            out.push(typ);
            out.push(1);
            out.push(value);
        }

        // KEMAC with a single unencrypted TEK
        out.push(PAYLOAD_LAST);
        out.push(0); // encryption: NULL
        out.extend_from_slice(&((4 + self.key.len()) as u16).to_be_bytes());
        out.push(PAYLOAD_LAST);
        out.push(KEY_TYPE_TEK << 4);
        out.extend_from_slice(&(self.key.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.key);
        out.push(0); // MAC: NULL

        out
    }
}
