//! Error types shared across the Loopgrid crates

use thiserror::Error;

/// Errors raised while handling shared wire types
#[derive(Error, Debug)]
pub enum TypesError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),
}

pub type Result<T> = std::result::Result<T, TypesError>;

/// Stable numeric codes carried in the `error` member of an envelope.
///
/// Peers match on the code; the description is for humans only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A required parameter is missing or malformed
    ParameterMissing,
    /// Shared secret did not match
    AuthenticationFailed,
    /// No session exists for the requesting connection
    SessionUnknown,
    /// Offered codec is not supported
    UnknownCodec,
    /// Request was understood but could not be processed
    ProcessingError,
}

impl ErrorCode {
    /// Numeric code on the wire
    pub fn code(&self) -> u64 {
        match self {
            ErrorCode::ParameterMissing => 400,
            ErrorCode::AuthenticationFailed => 401,
            ErrorCode::SessionUnknown => 404,
            ErrorCode::UnknownCodec => 415,
            ErrorCode::ProcessingError => 500,
        }
    }

    /// Human readable description on the wire
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::ParameterMissing => "parameter missing",
            ErrorCode::AuthenticationFailed => "authentication failed",
            ErrorCode::SessionUnknown => "session unknown",
            ErrorCode::UnknownCodec => "codec not supported",
            ErrorCode::ProcessingError => "processing error",
        }
    }

    /// Map a received numeric code back to the taxonomy
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            400 => Some(ErrorCode::ParameterMissing),
            401 => Some(ErrorCode::AuthenticationFailed),
            404 => Some(ErrorCode::SessionUnknown),
            415 => Some(ErrorCode::UnknownCodec),
            500 => Some(ErrorCode::ProcessingError),
            _ => None,
        }
    }
}
