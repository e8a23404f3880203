// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `ThingsR` library.
//!
//! This module provides the error hierarchy for failures across the library:
//! transport configuration, MQTT protocol communication, and request
//! correlation.

use thiserror::Error;

use crate::protocol::RequestId;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Error occurred during MQTT communication or request correlation.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An argument was empty or out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation requires a live broker connection.
    #[error("not connected to the platform")]
    NotConnected,
}

/// Errors related to transport configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No broker host was given.
    #[error("broker host is required")]
    MissingHost,

    /// X.509 credentials were combined with a plaintext schema.
    #[error("X.509 credentials require a TLS schema (mqtts or wss)")]
    TlsRequired,

    /// X.509 credentials are missing the client certificate or key.
    #[error("X.509 credentials require client_cert_pem and client_key_pem")]
    IncompleteClientAuth,

    /// TLS was requested without a CA bundle or explicit opt-out.
    #[error("a CA bundle (cert_pem) is required for TLS unless verification is skipped")]
    MissingCaCert,

    /// A PEM blob could not be parsed.
    #[error("invalid PEM material: {0}")]
    InvalidPem(String),

    /// Password-protected client keys are not supported by the TLS backend.
    #[error("encrypted client keys are not supported")]
    EncryptedKeyUnsupported,
}

/// Errors related to MQTT communication and request correlation.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The underlying MQTT client rejected an operation.
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// A live pending request with the same correlation id already exists.
    #[error("duplicate request id {0}")]
    DuplicateRequestId(RequestId),

    /// An inbound topic did not match any known conversation.
    #[error("malformed topic: {0}")]
    MalformedTopic(String),
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        assert_eq!(
            ConfigError::MissingHost.to_string(),
            "broker host is required"
        );
        assert_eq!(
            ConfigError::TlsRequired.to_string(),
            "X.509 credentials require a TLS schema (mqtts or wss)"
        );
    }

    #[test]
    fn error_from_config_error() {
        let err: Error = ConfigError::MissingHost.into();
        assert!(matches!(err, Error::Config(ConfigError::MissingHost)));
    }

    #[test]
    fn duplicate_id_display() {
        let id = RequestId::new(7).unwrap();
        let err = ProtocolError::DuplicateRequestId(id);
        assert_eq!(err.to_string(), "duplicate request id 7");
    }
}
