//! Error types for rt-stt.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RtSttError {
    // Configuration errors
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalid { key: String, message: String },

    // Audio capture errors
    #[error("Failed to open audio device '{device}': {message}")]
    DeviceOpenFailed { device: String, message: String },

    #[error("Audio format not supported: {message}")]
    FormatUnsupported { message: String },

    #[error("Failed to start audio stream: {message}")]
    StartFailed { message: String },

    // Model errors
    #[error("Failed to load model from {path}: {message}")]
    ModelLoadFailed { path: String, message: String },

    #[error("Model inference failed: {message}")]
    ModelInferenceFailed { message: String },

    // IPC errors
    #[error("IPC socket error: {message}")]
    IpcSocket { message: String },

    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("IPC protocol error: {message}")]
    IpcProtocol { message: String },

    // Control surface
    #[error("Unknown action: {action}")]
    UnknownAction { action: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, RtSttError>;
