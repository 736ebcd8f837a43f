//! Media bridges (§4.8): wires the orchestrator's collaborators to a
//! transport, whether SIP/RTP or the hosted media-stream WebSocket.

pub mod media_bridge;
pub mod media_stream_ws;

pub use media_bridge::spawn_sip_bridge;
pub use media_stream_ws::{media_stream_handler, AgentProfileStore, BridgeConfig, InMemoryAgentProfileStore, MediaStreamState};
