use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation not valid in {mode} mode: {operation}")]
    InvalidMode { mode: String, operation: String },

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Device '{0}' is already registered")]
    DuplicateDevice(String),

    #[error("Type mismatch at {key}: expected {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    #[error("Invalid topology: {0}")]
    TopologyInvalid(String),

    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Device '{0}' faulted")]
    DeviceFaulted(String),

    #[error("Bad memory address: {0}")]
    BadAddress(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}
