//! Crate-wide error taxonomy.
//!
//! Each subsystem defines its own narrow error enum; `BridgeError` wraps them
//! with `#[from]` conversions so task bodies can use `?` freely. Recoverable
//! faults never escape a task's loop body — they are caught, counted and
//! turned into an alarm (see `alarms.rs`); only boot-time failures reach
//! `main` as a `BridgeError`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SerialError {
    #[error("serial port error: {0}")]
    Port(String),
    #[error("operation timed out")]
    Timeout,
    #[error("invalid argument: {0}")]
    InvalidArg(String),
}

impl From<std::io::Error> for SerialError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            SerialError::Timeout
        } else {
            SerialError::Port(err.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum CanError {
    #[error("CAN driver error: {0}")]
    Driver(String),
    #[error("operation timed out")]
    Timeout,
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("bus is off or recovering")]
    BusOff,
}

#[derive(Error, Debug)]
pub enum BmsClientError {
    #[error("write error: {0}")]
    Write(String),
    #[error("response timed out")]
    Timeout,
    #[error("CRC mismatch")]
    CrcMismatch,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("device reported NACK, code {0}")]
    Nack(u8),
    #[error(transparent)]
    Serial(#[from] SerialError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration value: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Serial(#[from] SerialError),
    #[error(transparent)]
    Can(#[from] CanError),
    #[error(transparent)]
    BmsClient(#[from] BmsClientError),
    #[error("initialization failed: {0}")]
    Init(String),
}
