use bytes::Bytes;

use super::INTERLEAVED_FRAME_MAGIC;

/// An RTP or RTCP packet carried inline on the RTSP TCP connection,
/// prefixed by a 4-byte `$`-header (RFC 2326, section 10.12).
#[derive(Debug, Clone, PartialEq)]
pub struct InterleavedFrame {
    pub channel: u8,
    pub payload: Bytes,
}

impl InterleavedFrame {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.payload.len());
        out.push(INTERLEAVED_FRAME_MAGIC);
        out.push(self.channel);
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Writes the frame into a caller-provided buffer, returning the used
    /// length. The buffer must hold at least `payload.len() + 4` bytes.
    pub fn marshal_to(&self, buf: &mut [u8]) -> usize {
        buf[0] = INTERLEAVED_FRAME_MAGIC;
        buf[1] = self.channel;
        buf[2..4].copy_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf[4..4 + self.payload.len()].copy_from_slice(&self.payload);
        4 + self.payload.len()
    }
}
