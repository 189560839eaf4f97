#[cfg(test)]
mod message_test;

mod interleaved;
mod request;
mod response;

use std::fmt;

pub use interleaved::InterleavedFrame;
pub use request::Request;
pub use response::Response;

pub const RTSP_PROTOCOL_1_0: &str = "RTSP/1.0";

/// Leading byte of an interleaved binary frame.
pub const INTERLEAVED_FRAME_MAGIC: u8 = 0x24;

/// An RTSP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Announce,
    Describe,
    GetParameter,
    Options,
    Pause,
    Play,
    Record,
    Setup,
    SetParameter,
    Teardown,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Announce => "ANNOUNCE",
            Method::Describe => "DESCRIBE",
            Method::GetParameter => "GET_PARAMETER",
            Method::Options => "OPTIONS",
            Method::Pause => "PAUSE",
            Method::Play => "PLAY",
            Method::Record => "RECORD",
            Method::Setup => "SETUP",
            Method::SetParameter => "SET_PARAMETER",
            Method::Teardown => "TEARDOWN",
        }
    }

    pub fn from_str(s: &str) -> Option<Method> {
        match s {
            "ANNOUNCE" => Some(Method::Announce),
            "DESCRIBE" => Some(Method::Describe),
            "GET_PARAMETER" => Some(Method::GetParameter),
            "OPTIONS" => Some(Method::Options),
            "PAUSE" => Some(Method::Pause),
            "PLAY" => Some(Method::Play),
            "RECORD" => Some(Method::Record),
            "SETUP" => Some(Method::Setup),
            "SET_PARAMETER" => Some(Method::SetParameter),
            "TEARDOWN" => Some(Method::Teardown),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An RTSP response status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const SESSION_NOT_FOUND: StatusCode = StatusCode(454);
    pub const METHOD_NOT_VALID_IN_THIS_STATE: StatusCode = StatusCode(455);
    pub const UNSUPPORTED_TRANSPORT: StatusCode = StatusCode(461);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);

    pub fn reason(&self) -> &'static str {
        match self.0 {
            200 => "OK",
            400 => "Bad Request",
            401 => "Unauthorized",
            404 => "Not Found",
            454 => "Session Not Found",
            455 => "Method Not Valid in This State",
            461 => "Unsupported Transport",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            _ => "Unknown",
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ordered, case-insensitive RTSP header collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces any existing value under the same name.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        self.0.push((key.to_string(), value.into()));
    }

    pub fn add(&mut self, key: &str, value: impl Into<String>) {
        self.0.push((key.to_string(), value.into()));
    }

    pub fn remove(&mut self, key: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        for (k, v) in &self.0 {
            out.extend_from_slice(k.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(v.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }

    /// Parses `Name: value` lines. Continuation lines are not supported.
    pub(crate) fn parse_lines(lines: &[&str]) -> crate::error::Result<Headers> {
        let mut h = Headers::new();
        for line in lines {
            let (k, v) = line.split_once(':').ok_or_else(|| {
                crate::error::Error::ErrInvalidMessage(format!("invalid header line '{line}'"))
            })?;
            h.add(k.trim(), v.trim().to_string());
        }
        Ok(h)
    }
}

/// Any entity that can appear on an RTSP connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Interleaved(InterleavedFrame),
}
