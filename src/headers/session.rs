use crate::error::{Error, Result};

/// A Session header: opaque id plus optional timeout in seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHeader {
    pub id: String,
    pub timeout: Option<u64>,
}

impl SessionHeader {
    pub fn unmarshal(raw: &str) -> Result<SessionHeader> {
        let mut parts = raw.split(';');
        let id = parts
            .next()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::ErrInvalidMessage("empty Session header".into()))?
            .to_string();

        let mut timeout = None;
        for part in parts {
            if let Some(v) = part.trim().strip_prefix("timeout=") {
                timeout = Some(v.parse().map_err(|_| {
                    Error::ErrInvalidMessage(format!("invalid session timeout '{v}'"))
                })?);
            }
        }

        Ok(SessionHeader { id, timeout })
    }

    pub fn marshal(&self) -> String {
        match self.timeout {
            Some(t) => format!("{};timeout={}", self.id, t),
            None => self.id.clone(),
        }
    }
}
