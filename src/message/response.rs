use bytes::Bytes;

use super::{Headers, StatusCode, RTSP_PROTOCOL_1_0};
use crate::error::{Error, Result};

/// An RTSP response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode) -> Response {
        Response {
            status,
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

    /// Parses the head of a response: the status line plus header lines,
    /// without the final empty line.
    pub(crate) fn unmarshal_head(lines: &[&str]) -> Result<Response> {
        let first = lines
            .first()
            .ok_or_else(|| Error::ErrInvalidMessage("empty response".into()))?;

        let mut parts = first.splitn(3, ' ');
        let proto = parts
            .next()
            .ok_or_else(|| Error::ErrInvalidMessage("missing protocol".into()))?;
        let code_raw = parts
            .next()
            .ok_or_else(|| Error::ErrInvalidMessage("missing status code".into()))?;

        if proto != RTSP_PROTOCOL_1_0 {
            return Err(Error::ErrInvalidMessage(format!(
                "unsupported protocol '{proto}'"
            )));
        }

        let code: u16 = code_raw
            .parse()
            .map_err(|_| Error::ErrInvalidMessage(format!("invalid status code '{code_raw}'")))?;
        let headers = Headers::parse_lines(&lines[1..])?;

        Ok(Response {
            status: StatusCode(code),
            headers,
            body: Bytes::new(),
        })
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(RTSP_PROTOCOL_1_0.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.0.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.reason().as_bytes());
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
