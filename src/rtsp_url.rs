use std::fmt;

use url::Url;

use crate::error::{Error, Result};

pub const DEFAULT_RTSP_PORT: u16 = 554;
pub const DEFAULT_RTSPS_PORT: u16 = 322;

/// An absolute RTSP or RTSPS URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspUrl(Url);

impl RtspUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        let u = Url::parse(raw).map_err(|e| Error::ErrUrlInvalid(e.to_string()))?;

        if u.scheme() != "rtsp" && u.scheme() != "rtsps" {
            return Err(Error::ErrUrlInvalid(format!(
                "unsupported scheme '{}'",
                u.scheme()
            )));
        }
        if u.host_str().is_none() {
            return Err(Error::ErrUrlInvalid("host is missing".into()));
        }

        Ok(RtspUrl(u))
    }

    /// Whether the scheme is rtsps.
    pub fn is_secure(&self) -> bool {
        self.0.scheme() == "rtsps"
    }

    pub fn host(&self) -> &str {
        self.0.host_str().unwrap_or("")
    }

    /// Port, only when present in the URL.
    pub fn explicit_port(&self) -> Option<u16> {
        self.0.port()
    }

    pub fn port(&self) -> u16 {
        self.0.port().unwrap_or(if self.is_secure() {
            DEFAULT_RTSPS_PORT
        } else {
            DEFAULT_RTSP_PORT
        })
    }

    /// host:port pair suitable for connecting.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }

    /// Path without the leading slash. The query string is not included.
    pub fn path(&self) -> String {
        let p = self.0.path();
        p.strip_prefix('/').unwrap_or(p).to_string()
    }

    pub fn query(&self) -> Option<String> {
        self.0.query().map(|q| q.to_string())
    }

    /// Path without the leading slash, followed by `?query` when present.
    pub fn path_and_query(&self) -> String {
        match self.0.query() {
            Some(q) => format!("{}?{}", self.path(), q),
            None => self.path(),
        }
    }

    /// Resolves a SDP control attribute against this URL.
    ///
    /// An absolute control replaces the URL entirely; a control starting with
    /// `?` is appended verbatim; anything else is appended as an additional
    /// path segment.
    pub fn with_control(&self, control: &str) -> Result<RtspUrl> {
        if control.is_empty() {
            return Ok(self.clone());
        }

        if control.starts_with("rtsp://") || control.starts_with("rtsps://") {
            return RtspUrl::parse(control);
        }

        let base = self.0.as_str().trim_end_matches('/');
        if let Some(stripped) = control.strip_prefix('?') {
            return RtspUrl::parse(&format!("{base}?{stripped}"));
        }
        RtspUrl::parse(&format!("{base}/{control}"))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for RtspUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod rtsp_url_test {
    use super::*;

    #[test]
    fn test_parse() {
        let u = RtspUrl::parse("rtsp://192.168.1.99:8554/mystream?key=val").unwrap();
        assert_eq!(u.host(), "192.168.1.99");
        assert_eq!(u.port(), 8554);
        assert_eq!(u.path(), "mystream");
        assert_eq!(u.path_and_query(), "mystream?key=val");
    }

    #[test]
    fn test_default_ports() {
        let u = RtspUrl::parse("rtsp://host/p").unwrap();
        assert_eq!(u.port(), 554);

        let u = RtspUrl::parse("rtsps://host/p").unwrap();
        assert_eq!(u.port(), 322);
        assert!(u.is_secure());
    }

    #[test]
    fn test_invalid_scheme() {
        assert!(RtspUrl::parse("http://host/p").is_err());
    }

    #[test]
    fn test_with_control() {
        let u = RtspUrl::parse("rtsp://host/p").unwrap();

        let v = u.with_control("trackID=3").unwrap();
        assert_eq!(v.as_str(), "rtsp://host/p/trackID=3");

        let v = u.with_control("?streamid=0").unwrap();
        assert_eq!(v.as_str(), "rtsp://host/p?streamid=0");

        let v = u.with_control("rtsp://other/q").unwrap();
        assert_eq!(v.as_str(), "rtsp://other/q");
    }
}
