//! Conversation orchestrator (§4.9): the call-level state machine.

pub mod call_orchestrator;
pub mod state;
pub mod traits;

pub use call_orchestrator::{CallOrchestrator, CallOutcome, ExternalEvent};
pub use state::CallState;
pub use traits::{ChatClient, SpeechRecognizer, SpeechSynthesizer};
