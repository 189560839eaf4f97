use bytes::Bytes;

use super::{Headers, Method, RTSP_PROTOCOL_1_0};
use crate::error::{Error, Result};
use crate::rtsp_url::RtspUrl;

/// An RTSP request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub url: RtspUrl,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, url: RtspUrl) -> Request {
        Request {
            method,
            url,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn cseq(&self) -> Result<u32> {
        self.headers
            .get("CSeq")
            .and_then(|v| v.parse().ok())
            .ok_or(Error::ErrCSeqMissing)
    }

    /// Session header id, without parameters.
    pub fn session_id(&self) -> Option<&str> {
        let v = self.headers.get("Session")?;
        Some(v.split(';').next().unwrap_or(v).trim())
    }

    /// Parses the head of a request: the request line plus header lines,
    /// without the final empty line.
    pub(crate) fn unmarshal_head(lines: &[&str]) -> Result<Request> {
        let first = lines
            .first()
            .ok_or_else(|| Error::ErrInvalidMessage("empty request".into()))?;

        let mut parts = first.split(' ');
        let method_raw = parts
            .next()
            .ok_or_else(|| Error::ErrInvalidMessage("missing method".into()))?;
        let url_raw = parts
            .next()
            .ok_or_else(|| Error::ErrInvalidMessage("missing URL".into()))?;
        let proto = parts
            .next()
            .ok_or_else(|| Error::ErrInvalidMessage("missing protocol".into()))?;

        if proto != RTSP_PROTOCOL_1_0 {
            return Err(Error::ErrInvalidMessage(format!(
                "unsupported protocol '{proto}'"
            )));
        }

        let method = Method::from_str(method_raw)
            .ok_or_else(|| Error::ErrInvalidMessage(format!("unknown method '{method_raw}'")))?;
        let url = RtspUrl::parse(url_raw)?;
        let headers = Headers::parse_lines(&lines[1..])?;

        Ok(Request {
            method,
            url,
            headers,
            body: Bytes::new(),
        })
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.url.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(RTSP_PROTOCOL_1_0.as_bytes());
        out.extend_from_slice(b"\r\n");

        let mut headers = self.headers.clone();
        if !self.body.is_empty() {
            headers.set("Content-Length", self.body.len().to_string());
        }
        headers.write_to(&mut out);

        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}
