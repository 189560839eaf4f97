use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::{Error, Result};

/// A KeyMgmt header (RFC 4567) carrying a MIKEY message on SETUP
/// requests and responses of secure sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMgmt {
    pub url: Option<String>,
    pub mikey_payload: Vec<u8>,
}

impl KeyMgmt {
    pub fn unmarshal(raw: &str) -> Result<KeyMgmt> {
        let mut prot_ok = false;
        let mut url = None;
        let mut payload = None;

        for part in raw.split(';') {
            let part = part.trim();
            let (k, v) = match part.split_once('=') {
                Some((k, v)) => (k, v.trim_matches('"')),
                None => continue,
            };
            match k {
                "prot" => {
                    if v != "mikey" {
                        return Err(Error::ErrInvalidKeyMgmtHeader(format!(
                            "unsupported protocol '{v}'"
                        )));
                    }
                    prot_ok = true;
                }
                "uri" => url = Some(v.to_string()),
                "data" => {
                    payload = Some(BASE64.decode(v).map_err(|e| {
                        Error::ErrInvalidKeyMgmtHeader(format!("invalid base64: {e}"))
                    })?);
                }
                _ => {}
            }
        }

        if !prot_ok {
            return Err(Error::ErrInvalidKeyMgmtHeader("protocol is missing".into()));
        }

        Ok(KeyMgmt {
            url,
            mikey_payload: payload
                .ok_or_else(|| Error::ErrInvalidKeyMgmtHeader("data is missing".into()))?,
        })
    }

    pub fn marshal(&self) -> String {
        let mut out = "prot=mikey".to_string();
        if let Some(u) = &self.url {
            out.push_str(&format!(";uri=\"{u}\""));
        }
        out.push_str(&format!(";data=\"{}\"", BASE64.encode(&self.mikey_payload)));
        out
    }
}
