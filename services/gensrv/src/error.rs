//! Error handling for the generator polling service
//!
//! Two layers: [`ModbusError`] describes why a single RTU exchange was rejected,
//! [`GenSrvError`] is the service-wide error that scheduler code matches on to
//! decide between "block failed" and "session is gone".

use std::time::Duration;

use thiserror::Error;

/// RTU frame and exchange errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// Fewer bytes than the smallest valid response (addr + fc + 1 + crc)
    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),

    /// Recomputed CRC over the frame body disagrees with the trailing two bytes
    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{received:04X}")]
    CrcMismatch { expected: u16, received: u16 },

    /// Device answered with an exception frame (function code | 0x80)
    #[error("Modbus exception on FC{function:02X}: code 0x{code:02X} ({})", describe_exception(.code))]
    FunctionException { function: u8, code: u8 },

    /// CRC-valid frame from the wrong slave or for the wrong function
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// No `[addr, fc]` marker could be located before the deadline or buffer cap
    #[error("Frame synchronization timed out ({discarded} bytes discarded)")]
    SyncTimeout { discarded: usize },

    /// Request parameters outside what the protocol allows
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

fn describe_exception(code: &u8) -> &'static str {
    exception_description(*code)
}

/// Human readable text for standard Modbus exception codes
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x07 => "Negative Acknowledge",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

/// Generator service error type
#[derive(Error, Debug, Clone)]
pub enum GenSrvError {
    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Socket level I/O errors (bind, write, read)
    #[error("IO error: {0}")]
    IoError(String),

    /// No bridge device connected within the accept window
    #[error("No device connected within {0:?}")]
    AcceptTimeout(Duration),

    /// Peer closed the connection or the socket failed mid-exchange
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Frame-level rejection
    #[error("Protocol error: {0}")]
    ProtocolError(#[from] ModbusError),

    /// Reading could not be handed to the backend
    #[error("Publish error: {0}")]
    PublishError(String),

    /// Task was cancelled by shutdown
    #[error("Cancelled")]
    Cancelled,

    /// Internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the generator service
pub type Result<T> = std::result::Result<T, GenSrvError>;

impl GenSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        GenSrvError::ConfigError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        GenSrvError::IoError(msg.into())
    }

    pub fn connection_lost(msg: impl Into<String>) -> Self {
        GenSrvError::ConnectionLost(msg.into())
    }

    pub fn publish(msg: impl Into<String>) -> Self {
        GenSrvError::PublishError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        GenSrvError::InternalError(msg.into())
    }

    /// Whether this error means the live session can no longer be used.
    ///
    /// Frame rejections and sync timeouts only fail the current block; the
    /// socket stays open and the next request gets a fresh chance.
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(
            self,
            GenSrvError::IoError(_) | GenSrvError::ConnectionLost(_) | GenSrvError::Cancelled
        )
    }

    /// Short stable code for status reporting
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "CONFIG",
            Self::IoError(_) => "IO",
            Self::AcceptTimeout(_) => "ACCEPT_TIMEOUT",
            Self::ConnectionLost(_) => "CONNECTION_LOST",
            Self::ProtocolError(ModbusError::SyncTimeout { .. }) => "SYNC_TIMEOUT",
            Self::ProtocolError(ModbusError::CrcMismatch { .. }) => "CRC_MISMATCH",
            Self::ProtocolError(ModbusError::FunctionException { .. }) => "FUNCTION_EXCEPTION",
            Self::ProtocolError(_) => "PROTOCOL",
            Self::PublishError(_) => "PUBLISH",
            Self::Cancelled => "CANCELLED",
            Self::InternalError(_) => "INTERNAL",
        }
    }
}

impl From<std::io::Error> for GenSrvError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => GenSrvError::ConnectionLost(err.to_string()),
            _ => GenSrvError::IoError(err.to_string()),
        }
    }
}

impl From<figment::Error> for GenSrvError {
    fn from(err: figment::Error) -> Self {
        GenSrvError::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for GenSrvError {
    fn from(err: serde_json::Error) -> Self {
        GenSrvError::InternalError(format!("JSON: {err}"))
    }
}

impl From<reqwest::Error> for GenSrvError {
    fn from(err: reqwest::Error) -> Self {
        GenSrvError::PublishError(err.to_string())
    }
}
