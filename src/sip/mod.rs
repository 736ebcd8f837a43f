//! SIP signaling: digest auth, SDP offer/answer, dialog state, and the
//! outbound UA transport (§4.6).

pub mod dialog;
pub mod digest;
pub mod sdp;
pub mod transport;

pub use dialog::SipDialogState;
pub use sdp::SdpAnswer;
pub use transport::{SipResponse, SipTransport};
