#[cfg(test)]
mod description_test;

use std::io::Cursor;

use sdp::description::common::{Address, Attribute, ConnectionInformation};
use sdp::description::media::{MediaDescription, MediaName, RangedPort};
use sdp::description::session::{Origin, SessionDescription as Sdp, TimeDescription, Timing};

use crate::error::{Error, Result};
use crate::rtsp_url::RtspUrl;

/// A media format: payload type plus the rtpmap/fmtp attributes that
/// describe it. Depacketization is out of scope; this is a descriptor only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    pub payload_type: u8,
    pub codec: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    /// Raw fmtp parameters, semicolon-separated.
    pub parameters: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
    Application,
    Other(String),
}

impl MediaType {
    fn as_str(&self) -> &str {
        match self {
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Application => "application",
            MediaType::Other(s) => s,
        }
    }
}

/// A single media entry of a session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    pub media_type: MediaType,
    /// Control attribute, relative to the session path.
    pub control: String,
    /// Media flowing from client to server even while playing (ONVIF
    /// two-way audio), marked in SDP with a=sendonly.
    pub is_back_channel: bool,
    pub formats: Vec<Format>,
}

impl Media {
    pub fn find_format(&self, payload_type: u8) -> Option<&Format> {
        self.formats.iter().find(|f| f.payload_type == payload_type)
    }
}

/// A parsed session description: an ordered list of medias.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDescription {
    pub title: Option<String>,
    pub medias: Vec<Media>,
}

fn static_payload_format(pt: u8) -> Option<(&'static str, u32, Option<u8>)> {
    match pt {
        0 => Some(("PCMU", 8000, Some(1))),
        8 => Some(("PCMA", 8000, Some(1))),
        9 => Some(("G722", 8000, Some(1))),
        14 => Some(("MPA", 90000, None)),
        26 => Some(("JPEG", 90000, None)),
        32 => Some(("MPV", 90000, None)),
        33 => Some(("MP2T", 90000, None)),
        _ => None,
    }
}

fn parse_rtpmap(val: &str) -> Option<(u8, String, u32, Option<u8>)> {
    let (pt_raw, rest) = val.split_once(' ')?;
    let pt = pt_raw.trim().parse().ok()?;

    let mut it = rest.trim().split('/');
    let codec = it.next()?.to_string();
    let clock_rate = it.next()?.parse().ok()?;
    let channels = it.next().and_then(|c| c.parse().ok());

    Some((pt, codec, clock_rate, channels))
}

impl SessionDescription {
    /// Parses a session description from the body of a DESCRIBE response or
    /// ANNOUNCE request.
    pub fn unmarshal(body: &[u8]) -> Result<SessionDescription> {
        let sdp = Sdp::unmarshal(&mut Cursor::new(body))
            .map_err(|e| Error::ErrSdpInvalid(e.to_string()))?;
        SessionDescription::from_sdp(&sdp)
    }

    pub fn from_sdp(sdp: &Sdp) -> Result<SessionDescription> {
        let title = match sdp.session_name.as_str() {
            "" | " " | "-" => None,
            s => Some(s.to_string()),
        };

        let mut medias = Vec::with_capacity(sdp.media_descriptions.len());
        for md in &sdp.media_descriptions {
            medias.push(Media::from_sdp(md)?);
        }

        if medias.is_empty() {
            return Err(Error::ErrSdpInvalid("no media entries".into()));
        }

        Ok(SessionDescription { title, medias })
    }

    /// Encodes back into SDP. `secure` selects the RTP/SAVP profile.
    pub fn marshal(&self, secure: bool) -> Vec<u8> {
        let proto = if secure { "RTP/SAVP" } else { "RTP/AVP" };

        let media_descriptions = self
            .medias
            .iter()
            .map(|m| {
                let mut attributes = Vec::new();
                attributes.push(Attribute {
                    key: "control".to_string(),
                    value: Some(m.control.clone()),
                });
                if m.is_back_channel {
                    attributes.push(Attribute {
                        key: "sendonly".to_string(),
                        value: None,
                    });
                }
                for f in &m.formats {
                    let rtpmap = match f.channels {
                        Some(c) if c > 1 => {
                            format!("{} {}/{}/{}", f.payload_type, f.codec, f.clock_rate, c)
                        }
                        _ => format!("{} {}/{}", f.payload_type, f.codec, f.clock_rate),
                    };
                    attributes.push(Attribute {
                        key: "rtpmap".to_string(),
                        value: Some(rtpmap),
                    });
                    if !f.parameters.is_empty() {
                        attributes.push(Attribute {
                            key: "fmtp".to_string(),
                            value: Some(format!("{} {}", f.payload_type, f.parameters)),
                        });
                    }
                }

                MediaDescription {
                    media_name: MediaName {
                        media: m.media_type.as_str().to_string(),
                        port: RangedPort {
                            value: 0,
                            range: None,
                        },
                        protos: proto.split('/').map(String::from).collect(),
                        formats: m
                            .formats
                            .iter()
                            .map(|f| f.payload_type.to_string())
                            .collect(),
                    },
                    media_title: None,
                    connection_information: Some(ConnectionInformation {
                        network_type: "IN".to_string(),
                        address_type: "IP4".to_string(),
                        address: Some(Address {
                            address: "0.0.0.0".to_string(),
                            ttl: None,
                            range: None,
                        }),
                    }),
                    bandwidth: vec![],
                    encryption_key: None,
                    attributes,
                }
            })
            .collect();

        let sdp = Sdp {
            version: 0,
            origin: Origin {
                username: "-".to_string(),
                session_id: 0,
                session_version: 0,
                network_type: "IN".to_string(),
                address_type: "IP4".to_string(),
                unicast_address: "127.0.0.1".to_string(),
            },
            session_name: self.title.clone().unwrap_or_else(|| " ".to_string()),
            session_information: None,
            uri: None,
            email_address: None,
            phone_number: None,
            connection_information: None,
            bandwidth: vec![],
            time_descriptions: vec![TimeDescription {
                timing: Timing {
                    start_time: 0,
                    stop_time: 0,
                },
                repeat_times: vec![],
            }],
            time_zones: vec![],
            encryption_key: None,
            attributes: vec![],
            media_descriptions,
        };

        sdp.marshal().into_bytes()
    }

    /// Locates an announced media from a SETUP URL, supporting the FFmpeg
    /// convention (control appended to the query), the GStreamer convention
    /// (control appended to the path) and absolute control URLs.
    pub fn find_media_by_url(
        &self,
        base_path_and_query: &str,
        url: &RtspUrl,
    ) -> Option<usize> {
        let requested = url.path_and_query();
        let requested = requested.trim_end_matches('/');

        for (i, media) in self.medias.iter().enumerate() {
            let control = media.control.as_str();

            if control.starts_with("rtsp://") || control.starts_with("rtsps://") {
                if url.as_str().trim_end_matches('/') == control.trim_end_matches('/') {
                    return Some(i);
                }
                continue;
            }

            if control.is_empty() {
                if requested == base_path_and_query {
                    return Some(i);
                }
                continue;
            }

            // FFmpeg appends the control after the query, GStreamer after
            // the path; both reduce to a suffix of the announced URL.
            if requested == format!("{base_path_and_query}/{control}") {
                return Some(i);
            }

            // GStreamer with a query present: control lands before it.
            if let Some((path, query)) = base_path_and_query.split_once('?') {
                if requested == format!("{path}/{control}?{query}") {
                    return Some(i);
                }
            }
        }

        None
    }
}

impl Media {
    fn from_sdp(md: &MediaDescription) -> Result<Media> {
        let media_type = match md.media_name.media.as_str() {
            "video" => MediaType::Video,
            "audio" => MediaType::Audio,
            "application" => MediaType::Application,
            other => MediaType::Other(other.to_string()),
        };

        let control = md
            .attribute("control")
            .flatten()
            .unwrap_or_default()
            .to_string();

        let is_back_channel = md.attribute("sendonly").is_some();

        let mut formats = Vec::new();
        for pt_raw in &md.media_name.formats {
            let pt: u8 = pt_raw
                .parse()
                .map_err(|_| Error::ErrSdpInvalid(format!("invalid payload type '{pt_raw}'")))?;

            let rtpmap = md.attributes.iter().find_map(|a| {
                if a.key != "rtpmap" {
                    return None;
                }
                let parsed = parse_rtpmap(a.value.as_deref()?)?;
                (parsed.0 == pt).then_some(parsed)
            });

            let (codec, clock_rate, channels) = match rtpmap {
                Some((_, codec, clock, ch)) => (codec, clock, ch),
                None => match static_payload_format(pt) {
                    Some((codec, clock, ch)) => (codec.to_string(), clock, ch),
                    None => {
                        return Err(Error::ErrSdpInvalid(format!(
                            "payload type {pt} has no rtpmap"
                        )))
                    }
                },
            };

            let parameters = md
                .attributes
                .iter()
                .find_map(|a| {
                    if a.key != "fmtp" {
                        return None;
                    }
                    let v = a.value.as_deref()?;
                    let (fmtp_pt, params) = v.split_once(' ')?;
                    (fmtp_pt.trim().parse::<u8>().ok()? == pt)
                        .then(|| params.trim().to_string())
                })
                .unwrap_or_default();

            formats.push(Format {
                payload_type: pt,
                codec,
                clock_rate,
                channels,
                parameters,
            });
        }

        if formats.is_empty() {
            return Err(Error::ErrSdpInvalid("media without formats".into()));
        }

        Ok(Media {
            media_type,
            control,
            is_back_channel,
            formats,
        })
    }
}
