#![warn(rust_2018_idioms)]
#![allow(dead_code)]

//! A pure Rust implementation of RTSP 1.0 (RFC 2326): client and server,
//! RTP/RTCP transport over TCP interleaved, UDP and UDP multicast, and
//! SRTP/SRTCP protection negotiated through MIKEY.

pub mod client;
pub mod crypto;
pub mod description;
pub mod headers;
pub mod message;
pub mod rtsp_url;
pub mod server;

mod conn;
mod error;
mod media_endpoint;
mod transport;

pub use error::{Error, Result};
pub use media_endpoint::{OnPacketRtcpFn, OnPacketRtpFn};
pub use rtsp_url::RtspUrl;
