use crate::error::{Error, Result};

/// One entry of a RTP-Info header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpInfoEntry {
    pub url: String,
    pub sequence_number: Option<u16>,
    pub timestamp: Option<u32>,
}

/// A RTP-Info header (RFC 2326, section 12.33), sent on PLAY responses to
/// let receivers seed sequence numbers and timestamps per track.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtpInfo(pub Vec<RtpInfoEntry>);

impl RtpInfo {
    pub fn unmarshal(raw: &str) -> Result<RtpInfo> {
        let mut entries = Vec::new();

        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let mut url = None;
            let mut seq = None;
            let mut ts = None;

            for kv in part.split(';') {
                let (k, v) = kv.split_once('=').ok_or_else(|| {
                    Error::ErrInvalidMessage(format!("invalid RTP-Info parameter '{kv}'"))
                })?;
                match k.trim() {
                    "url" => url = Some(v.trim().to_string()),
                    "seq" => {
                        seq = Some(v.trim().parse().map_err(|_| {
                            Error::ErrInvalidMessage(format!("invalid RTP-Info seq '{v}'"))
                        })?)
                    }
                    "rtptime" => {
                        ts = Some(v.trim().parse().map_err(|_| {
                            Error::ErrInvalidMessage(format!("invalid RTP-Info rtptime '{v}'"))
                        })?)
                    }
                    _ => {}
                }
            }

            entries.push(RtpInfoEntry {
                url: url.ok_or_else(|| {
                    Error::ErrInvalidMessage("RTP-Info entry without url".into())
                })?,
                sequence_number: seq,
                timestamp: ts,
            });
        }

        Ok(RtpInfo(entries))
    }

    pub fn marshal(&self) -> String {
        self.0
            .iter()
            .map(|e| {
                let mut s = format!("url={}", e.url);
                if let Some(seq) = e.sequence_number {
                    s.push_str(&format!(";seq={seq}"));
                }
                if let Some(ts) = e.timestamp {
                    s.push_str(&format!(";rtptime={ts}"));
                }
                s
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}
