//! RTP transport: packet framing and the per-call paced session.

pub mod packet;
pub mod session;

pub use packet::RtpPacket;
pub use session::{RtpSession, PAYLOAD_TYPE_PCMA, PAYLOAD_TYPE_PCMU};
