#[cfg(test)]
mod conn_test;

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{Error, Result};
use crate::message::{
    InterleavedFrame, Message, Request, Response, INTERLEAVED_FRAME_MAGIC, RTSP_PROTOCOL_1_0,
};

const MAX_HEADER_LINES: usize = 255;
const MAX_LINE_LENGTH: usize = 4096;
const MAX_CONTENT_LENGTH: usize = 128 * 1024;

/// Any byte stream an RTSP connection can run on (plain TCP or TLS).
pub(crate) trait AsyncRw: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncRw for T {}

pub(crate) type BoxStream = Box<dyn AsyncRw>;

/// Decodes the mixed wire stream of an RTSP connection: requests, responses
/// and `$`-prefixed interleaved binary frames.
pub(crate) struct MessageReader<R> {
    r: BufReader<R>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(r: R) -> Self {
        MessageReader {
            r: BufReader::new(r),
        }
    }

    pub async fn read_message(&mut self) -> Result<Message> {
        let first = self.r.read_u8().await?;

        if first == INTERLEAVED_FRAME_MAGIC {
            let channel = self.r.read_u8().await?;
            let len = self.r.read_u16().await? as usize;
            let mut payload = vec![0u8; len];
            self.r.read_exact(&mut payload).await?;
            return Ok(Message::Interleaved(InterleavedFrame {
                channel,
                payload: Bytes::from(payload),
            }));
        }

        let mut lines = Vec::new();
        let mut line = self.read_line(Some(first)).await?;
        loop {
            if line.is_empty() {
                break;
            }
            if lines.len() >= MAX_HEADER_LINES {
                return Err(Error::ErrInvalidMessage("too many header lines".into()));
            }
            lines.push(line);
            line = self.read_line(None).await?;
        }

        let line_refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();

        let is_response = line_refs
            .first()
            .map(|l| l.starts_with(RTSP_PROTOCOL_1_0))
            .unwrap_or(false);

        let mut msg = if is_response {
            Message::Response(Response::unmarshal_head(&line_refs)?)
        } else {
            Message::Request(Request::unmarshal_head(&line_refs)?)
        };

        let headers = match &msg {
            Message::Request(req) => &req.headers,
            Message::Response(res) => &res.headers,
            Message::Interleaved(_) => unreachable!(),
        };

        let content_length: usize = match headers.get("Content-Length") {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| Error::ErrInvalidMessage(format!("invalid Content-Length '{v}'")))?,
            None => 0,
        };
        if content_length > MAX_CONTENT_LENGTH {
            return Err(Error::ErrInvalidMessage("content is too big".into()));
        }

        if content_length > 0 {
            let mut body = vec![0u8; content_length];
            self.r.read_exact(&mut body).await?;
            match &mut msg {
                Message::Request(req) => req.body = Bytes::from(body),
                Message::Response(res) => res.body = Bytes::from(body),
                Message::Interleaved(_) => unreachable!(),
            }
        }

        Ok(msg)
    }

    /// Reads a CRLF-terminated line, optionally prepending an already
    /// consumed byte. The terminator is stripped.
    async fn read_line(&mut self, first: Option<u8>) -> Result<String> {
        let mut buf = Vec::with_capacity(64);
        if let Some(b) = first {
            buf.push(b);
        }

        loop {
            let b = self.r.read_u8().await?;
            if b == b'\n' {
                break;
            }
            buf.push(b);
            if buf.len() > MAX_LINE_LENGTH {
                return Err(Error::ErrInvalidMessage("line is too long".into()));
            }
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }

        String::from_utf8(buf).map_err(|_| Error::ErrInvalidMessage("invalid UTF-8".into()))
    }
}

/// Serializes writes of messages and interleaved frames onto the stream,
/// bounded by a write timeout per operation.
pub(crate) struct MessageWriter<W> {
    w: W,
    write_timeout: Duration,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(w: W, write_timeout: Duration) -> Self {
        MessageWriter { w, write_timeout }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        tokio::time::timeout(self.write_timeout, self.w.write_all(buf))
            .await
            .map_err(|_| Error::Io("write timeout".into()))??;
        Ok(())
    }

    pub async fn write_request(&mut self, req: &Request) -> Result<()> {
        self.write_all(&req.marshal()).await
    }

    pub async fn write_response(&mut self, res: &Response) -> Result<()> {
        self.write_all(&res.marshal()).await
    }

    pub async fn write_interleaved_frame(&mut self, buf: &[u8]) -> Result<()> {
        self.write_all(buf).await
    }
}
