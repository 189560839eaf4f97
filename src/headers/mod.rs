#[cfg(test)]
mod headers_test;

mod key_mgmt;
mod rtp_info;
mod session;
mod transport;

pub use key_mgmt::KeyMgmt;
pub use rtp_info::{RtpInfo, RtpInfoEntry};
pub use session::SessionHeader;
pub use transport::{Profile, Protocol, Transport, TransportMode};
