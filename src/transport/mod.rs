mod udp;
mod writer;

pub(crate) use udp::{UdpListener, UdpReadFn};
pub(crate) use writer::{WriteJob, Writer, WriterHandle};
