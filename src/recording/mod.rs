//! Call recording accumulation and upload (§4.5).

pub mod sink;

pub use sink::{NoopUploader, RecordingSink, RecordingUploader};
