//! Security module: the provider-keyed credential store (STT/LLM/TTS/SIP
//! secrets) backed by the OS keyring.

pub mod keyring;

pub use keyring::{delete_credential, get_credential, has_credential, set_credential};
