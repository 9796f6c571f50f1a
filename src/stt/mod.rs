//! Speech-to-text model integration.

pub mod transcriber;

#[cfg(feature = "whisper")]
pub mod whisper;
