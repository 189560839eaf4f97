use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// ErrInvalidState indicates a request that is not allowed in the
    /// current session state.
    #[error("must be in a different state")]
    ErrInvalidState,

    /// ErrInvalidSetupPath indicates a SETUP URL whose path cannot be
    /// related to any media.
    #[error("invalid SETUP path")]
    ErrInvalidSetupPath,

    /// ErrTransportHeaderInvalid indicates a Transport header that could not
    /// be parsed.
    #[error("invalid Transport header ({0})")]
    ErrTransportHeaderInvalid(String),

    /// ErrTransportHeaderNoClientPorts indicates a UDP SETUP request without
    /// client ports.
    #[error("Transport header does not contain client ports")]
    ErrTransportHeaderNoClientPorts,

    /// ErrTransportHeaderInvalidInterleavedIds indicates interleaved ids
    /// that are not an (even, even+1) pair.
    #[error("invalid interleaved ids in Transport header")]
    ErrTransportHeaderInvalidInterleavedIds,

    /// ErrInterleavedIdsInUse indicates interleaved ids that collide with
    /// another setupped media of the same session.
    #[error("interleaved ids already in use")]
    ErrInterleavedIdsInUse,

    #[error("can't setup medias with different paths")]
    ErrMediasDifferentPaths,

    #[error("can't setup medias with different transports")]
    ErrMediasDifferentTransports,

    #[error("media not found")]
    ErrMediaNotFound,

    #[error("media has already been setup")]
    ErrMediaAlreadySetup,

    #[error("not all announced medias have been setup")]
    ErrNotAllAnnouncedMediasSetup,

    #[error("path has changed")]
    ErrPathHasChanged,

    /// ErrUnexpectedFrame indicates an interleaved frame received while the
    /// connection is in control mode.
    #[error("received unexpected interleaved frame")]
    ErrUnexpectedFrame,

    #[error("invalid KeyMgmt header ({0})")]
    ErrInvalidKeyMgmtHeader(String),

    #[error("Content-Type header is missing")]
    ErrContentTypeMissing,

    #[error("unsupported Content-Type header ({0})")]
    ErrContentTypeUnsupported(String),

    #[error("invalid SDP: {0}")]
    ErrSdpInvalid(String),

    /// ErrSessionTornDown indicates a session closed by a TEARDOWN request.
    #[error("torn down")]
    ErrSessionTornDown,

    /// ErrSessionTimedOut indicates a session closed because no RTSP request
    /// or RTP/RTCP packet was received in time.
    #[error("session timed out")]
    ErrSessionTimedOut,

    /// ErrSessionNotInUse indicates a session closed because it lost every
    /// connection without reaching the playing or recording state.
    #[error("not in use")]
    ErrSessionNotInUse,

    #[error("session is linked to another connection")]
    ErrSessionLinkedToOtherConn,

    #[error("session not found")]
    ErrSessionNotFound,

    /// ErrStreamClosed indicates a write attempted on a closed stream.
    #[error("stream is closed")]
    ErrStreamClosed,

    /// ErrUdpPortsAlreadyInUse indicates a SETUP whose client ports collide
    /// with another reader of the same stream on the same peer.
    #[error("UDP ports already in use by another reader")]
    ErrUdpPortsAlreadyInUse,

    /// ErrWriteQueueFull indicates that the writer queue of the session is
    /// full; the packet has not been enqueued.
    #[error("write queue is full")]
    ErrWriteQueueFull,

    #[error("invalid RTP packet: {0}")]
    ErrRtpDecode(String),

    #[error("invalid RTCP packet: {0}")]
    ErrRtcpDecode(String),

    #[error("received RTP packet with unknown payload type: {0}")]
    ErrUnknownPayloadType(u8),

    /// ErrRtpPacketTooBigUdp indicates an inbound UDP payload that exceeds
    /// the maximum UDP payload size; the packet has been discarded.
    #[error("RTP packet is too big to be read with UDP")]
    ErrRtpPacketTooBigUdp,

    #[error("RTP packet is too big to be written ({0} > {1})")]
    ErrRtpPacketTooBig(usize, usize),

    #[error("RTCP packet is too big to be written ({0} > {1})")]
    ErrRtcpPacketTooBig(usize, usize),

    /// ErrMikeyClockSkew indicates a MIKEY message whose timestamp is more
    /// than one hour away from the local wall clock.
    #[error("MIKEY timestamp is too distant from local time")]
    ErrMikeyClockSkew,

    /// ErrMikeyUnsupportedPolicy indicates a MIKEY security policy other
    /// than SRTP with AES-128-CM and HMAC-SHA1-80.
    #[error("unsupported MIKEY security policy")]
    ErrMikeyUnsupportedPolicy,

    #[error("invalid MIKEY message ({0})")]
    ErrMikeyInvalid(String),

    #[error("invalid master key length: expected {0}, got {1}")]
    ErrSrtpMasterLength(usize, usize),

    #[error("srtp packet is too short")]
    ErrSrtpTooShort,

    #[error("failed to verify srtp auth tag")]
    ErrSrtpAuthTagMismatch,

    /// ErrTerminated indicates a session closed by a server shutdown.
    #[error("terminated")]
    ErrTerminated,

    #[error("bad status code: {0} ({1})")]
    ErrBadStatusCode(u16, String),

    #[error("CSeq is missing")]
    ErrCSeqMissing,

    #[error("Session header is missing")]
    ErrSessionHeaderMissing,

    #[error("invalid RTSP message ({0})")]
    ErrInvalidMessage(String),

    #[error("invalid URL ({0})")]
    ErrUrlInvalid(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
