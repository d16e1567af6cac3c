//! Error types for the interconnect engine
// Copyright 2026 Loopgrid Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in the interconnect engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// DTLS setup or handshake error
    #[error("DTLS error: {0}")]
    Dtls(String),

    /// SRTP protect/unprotect error
    #[error("SRTP error: {0}")]
    Srtp(String),

    /// STUN encode/decode error
    #[error("STUN error: {0}")]
    Stun(String),

    /// Socket or transport error
    #[error("Network error: {0}")]
    Network(String),

    /// Control channel error
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// No session for the given remote endpoint
    #[error("Session unknown for {remote}")]
    SessionUnknown { remote: String },

    /// No loop with the given name
    #[error("Loop unknown: {name}")]
    LoopUnknown { name: String },

    /// Peer certificate does not match the signaled fingerprint
    #[error("Fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    /// No mixer with spare capacity available
    #[error("No mixer available")]
    MixerUnavailable,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Network(err.to_string())
    }
}

impl From<openssl::error::ErrorStack> for EngineError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        EngineError::Dtls(err.to_string())
    }
}

impl From<native_tls::Error> for EngineError {
    fn from(err: native_tls::Error) -> Self {
        EngineError::Signaling(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Signaling(err.to_string())
    }
}

impl From<loopgrid_config::ConfigError> for EngineError {
    fn from(err: loopgrid_config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}
