use std::fmt;
use std::net::IpAddr;

use crate::error::{Error, Result};

/// The transport over which RTP/RTCP packets flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    UdpMulticast,
    Tcp,
}

/// AVP or its secure variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Avp,
    Savp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Play,
    Record,
}

/// A single alternative of a Transport header (RFC 2326, section 12.39).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transport {
    pub protocol: Protocol,
    pub profile: Profile,
    pub client_port: Option<(u16, u16)>,
    pub server_port: Option<(u16, u16)>,
    pub interleaved: Option<(u8, u8)>,
    pub destination: Option<IpAddr>,
    pub ttl: Option<u8>,
    pub ssrc: Option<u32>,
    pub mode: Option<TransportMode>,
}

impl Default for Transport {
    fn default() -> Self {
        Transport {
            protocol: Protocol::Udp,
            profile: Profile::Avp,
            client_port: None,
            server_port: None,
            interleaved: None,
            destination: None,
            ttl: None,
            ssrc: None,
            mode: None,
        }
    }
}

fn parse_port_pair(s: &str) -> Result<(u16, u16)> {
    let invalid = || Error::ErrTransportHeaderInvalid(format!("invalid port pair '{s}'"));
    match s.split_once('-') {
        Some((a, b)) => Ok((
            a.parse().map_err(|_| invalid())?,
            b.parse().map_err(|_| invalid())?,
        )),
        None => {
            let p: u16 = s.parse().map_err(|_| invalid())?;
            Ok((p, p + 1))
        }
    }
}

impl Transport {
    /// Splits a Transport header value into its comma-separated alternatives,
    /// listed by the client in preference order.
    pub fn alternatives(value: &str) -> Vec<&str> {
        value
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Parses a single alternative.
    pub fn unmarshal(raw: &str) -> Result<Transport> {
        let mut parts = raw.split(';');
        let proto = parts
            .next()
            .ok_or_else(|| Error::ErrTransportHeaderInvalid("empty value".into()))?
            .trim();

        let mut tr = Transport::default();

        match proto {
            "RTP/AVP" | "RTP/AVP/UDP" => {
                tr.profile = Profile::Avp;
                tr.protocol = Protocol::Udp;
            }
            "RTP/AVP/TCP" => {
                tr.profile = Profile::Avp;
                tr.protocol = Protocol::Tcp;
            }
            "RTP/SAVP" | "RTP/SAVP/UDP" => {
                tr.profile = Profile::Savp;
                tr.protocol = Protocol::Udp;
            }
            "RTP/SAVP/TCP" => {
                tr.profile = Profile::Savp;
                tr.protocol = Protocol::Tcp;
            }
            _ => {
                return Err(Error::ErrTransportHeaderInvalid(format!(
                    "unknown protocol '{proto}'"
                )))
            }
        }

        for part in parts {
            let part = part.trim();
            let (key, val) = match part.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (part, None),
            };

            match (key, val) {
                ("unicast", None) => {}
                ("multicast", None) => {
                    if tr.protocol == Protocol::Udp {
                        tr.protocol = Protocol::UdpMulticast;
                    }
                }
                ("client_port", Some(v)) => tr.client_port = Some(parse_port_pair(v)?),
                ("server_port", Some(v)) => tr.server_port = Some(parse_port_pair(v)?),
                ("port", Some(v)) => tr.server_port = Some(parse_port_pair(v)?),
                ("interleaved", Some(v)) => {
                    let (a, b) = parse_port_pair(v)?;
                    if a > 255 || b > 255 {
                        return Err(Error::ErrTransportHeaderInvalid(format!(
                            "invalid interleaved ids '{v}'"
                        )));
                    }
                    tr.interleaved = Some((a as u8, b as u8));
                }
                ("destination", Some(v)) => {
                    tr.destination = Some(v.parse().map_err(|_| {
                        Error::ErrTransportHeaderInvalid(format!("invalid destination '{v}'"))
                    })?);
                }
                ("ttl", Some(v)) => {
                    tr.ttl = Some(v.parse().map_err(|_| {
                        Error::ErrTransportHeaderInvalid(format!("invalid ttl '{v}'"))
                    })?);
                }
                ("ssrc", Some(v)) => {
                    tr.ssrc = Some(u32::from_str_radix(v, 16).map_err(|_| {
                        Error::ErrTransportHeaderInvalid(format!("invalid ssrc '{v}'"))
                    })?);
                }
                ("mode", Some(v)) => {
                    let v = v.trim_matches('"');
                    if v.eq_ignore_ascii_case("play") {
                        tr.mode = Some(TransportMode::Play);
                    } else if v.eq_ignore_ascii_case("record") || v.eq_ignore_ascii_case("receive")
                    {
                        tr.mode = Some(TransportMode::Record);
                    } else {
                        return Err(Error::ErrTransportHeaderInvalid(format!(
                            "invalid mode '{v}'"
                        )));
                    }
                }
                // tolerate unknown parameters
                _ => {}
            }
        }

        Ok(tr)
    }

    pub fn marshal(&self) -> String {
        let mut out = String::with_capacity(64);

        out.push_str(match (self.profile, self.protocol) {
            (Profile::Avp, Protocol::Tcp) => "RTP/AVP/TCP",
            (Profile::Avp, _) => "RTP/AVP",
            (Profile::Savp, Protocol::Tcp) => "RTP/SAVP/TCP",
            (Profile::Savp, _) => "RTP/SAVP",
        });

        match self.protocol {
            Protocol::UdpMulticast => out.push_str(";multicast"),
            _ => out.push_str(";unicast"),
        }

        if let Some(d) = &self.destination {
            out.push_str(&format!(";destination={d}"));
        }
        if let Some(t) = self.ttl {
            out.push_str(&format!(";ttl={t}"));
        }
        if let Some((a, b)) = self.client_port {
            out.push_str(&format!(";client_port={a}-{b}"));
        }
        if let Some((a, b)) = self.server_port {
            if self.protocol == Protocol::UdpMulticast {
                out.push_str(&format!(";port={a}-{b}"));
            } else {
                out.push_str(&format!(";server_port={a}-{b}"));
            }
        }
        if let Some((a, b)) = self.interleaved {
            out.push_str(&format!(";interleaved={a}-{b}"));
        }
        if let Some(s) = self.ssrc {
            out.push_str(&format!(";ssrc={s:08X}"));
        }
        if let Some(m) = self.mode {
            out.push_str(match m {
                TransportMode::Play => ";mode=play",
                TransportMode::Record => ";mode=record",
            });
        }

        out
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Udp => "UDP",
            Protocol::UdpMulticast => "UDP-multicast",
            Protocol::Tcp => "TCP",
        })
    }
}
