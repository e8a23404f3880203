// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transport configuration for the platform connection.
//!
//! [`TransportConfig`] describes how to reach the broker (schema, host,
//! port, websocket path), how to authenticate (access token, basic MQTT
//! credentials or an X.509 client certificate) and how to verify the
//! server. It is plain data: construction via the builder or serde, and a
//! [`validate`](TransportConfig::validate) pass before connecting.
//!
//! # Examples
//!
//! ```
//! use thingsr_lib::{Credentials, Schema, TransportConfig};
//!
//! let config = TransportConfig::builder()
//!     .host("thingsboard.example.com")
//!     .schema(Schema::Mqtt)
//!     .credentials(Credentials::access_token("A1_TEST_TOKEN"))
//!     .build()
//!     .unwrap();
//! assert_eq!(config.effective_port(), 1883);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Transport schema used to reach the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Schema {
    /// Plain MQTT over TCP (default port 1883).
    #[default]
    Mqtt,
    /// MQTT over TLS (default port 8883).
    Mqtts,
    /// MQTT over websocket (default port 80).
    Ws,
    /// MQTT over secure websocket (default port 443).
    Wss,
}

impl Schema {
    /// Returns the well-known port of this schema.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Mqtt => 1883,
            Self::Mqtts => 8883,
            Self::Ws => 80,
            Self::Wss => 443,
        }
    }

    /// Returns whether this schema implies TLS.
    #[must_use]
    pub const fn uses_tls(self) -> bool {
        matches!(self, Self::Mqtts | Self::Wss)
    }

    /// Returns whether this schema runs over a websocket.
    #[must_use]
    pub const fn uses_websocket(self) -> bool {
        matches!(self, Self::Ws | Self::Wss)
    }
}

/// Device credentials presented to the platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Credentials {
    /// Anonymous connection (used for provisioning).
    #[default]
    None,
    /// ThingsBoard device access token, sent as the MQTT username.
    AccessToken {
        /// The access token.
        token: String,
    },
    /// Plain MQTT credentials.
    BasicMqtt {
        /// MQTT client id. Generated when absent.
        client_id: Option<String>,
        /// MQTT username.
        username: Option<String>,
        /// MQTT password.
        password: Option<String>,
    },
    /// X.509 client certificate; the certificate and key live in
    /// [`ClientAuthentication`].
    X509,
}

impl Credentials {
    /// Convenience constructor for access-token credentials.
    #[must_use]
    pub fn access_token(token: impl Into<String>) -> Self {
        Self::AccessToken {
            token: token.into(),
        }
    }

    /// Convenience constructor for basic MQTT credentials.
    #[must_use]
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::BasicMqtt {
            client_id: None,
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }
}

/// How the server certificate is verified on TLS schemas.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerVerification {
    /// PEM bundle of trusted CA certificates. When absent, the platform's
    /// certificate must chain to nothing and verification must be skipped.
    pub cert_pem: Option<String>,
    /// Disables server certificate verification entirely. For brokers with
    /// self-signed certificates.
    #[serde(default)]
    pub skip_common_name_check: bool,
}

/// X.509 client authentication material.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientAuthentication {
    /// PEM client certificate chain.
    pub client_cert_pem: Option<String>,
    /// PEM client private key.
    pub client_key_pem: Option<String>,
    /// Password of the client key. Encrypted keys are rejected by
    /// [`TransportConfig::validate`]; the field exists for config-file
    /// compatibility.
    pub client_key_password: Option<String>,
}

/// Complete transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Transport schema.
    #[serde(default)]
    pub schema: Schema,
    /// Broker host name or address.
    pub host: String,
    /// Broker port; `0` selects the schema's well-known port.
    #[serde(default)]
    pub port: u16,
    /// Websocket endpoint path (`ws`/`wss` schemas only).
    #[serde(default)]
    pub path: String,
    /// Device credentials.
    #[serde(default)]
    pub credentials: Credentials,
    /// Server certificate verification.
    #[serde(default)]
    pub verification: ServerVerification,
    /// X.509 client authentication.
    #[serde(default)]
    pub authentication: ClientAuthentication,
    /// Log every transmitted and received package at info level.
    #[serde(default)]
    pub log_rxtx_package: bool,
}

impl TransportConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::default()
    }

    /// Returns the configured port, falling back to the schema default.
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            self.schema.default_port()
        } else {
            self.port
        }
    }

    /// Checks the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is empty, if X.509 credentials are used
    /// without TLS or without certificate material, or if the client key is
    /// password protected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if matches!(self.credentials, Credentials::X509) {
            if !self.schema.uses_tls() {
                return Err(ConfigError::TlsRequired);
            }
            if self.authentication.client_cert_pem.is_none()
                || self.authentication.client_key_pem.is_none()
            {
                return Err(ConfigError::IncompleteClientAuth);
            }
        }
        if self
            .authentication
            .client_key_password
            .as_ref()
            .is_some_and(|password| !password.is_empty())
        {
            return Err(ConfigError::EncryptedKeyUnsupported);
        }
        Ok(())
    }
}

/// Builder for [`TransportConfig`].
#[derive(Debug, Default)]
pub struct TransportConfigBuilder {
    schema: Schema,
    host: Option<String>,
    port: u16,
    path: String,
    credentials: Credentials,
    verification: ServerVerification,
    authentication: ClientAuthentication,
    log_rxtx_package: bool,
}

impl TransportConfigBuilder {
    /// Sets the broker host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the transport schema.
    #[must_use]
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Sets the broker port. `0` (the default) selects the schema's
    /// well-known port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the websocket endpoint path.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the device credentials.
    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Sets the trusted CA bundle for server verification.
    #[must_use]
    pub fn ca_cert_pem(mut self, pem: impl Into<String>) -> Self {
        self.verification.cert_pem = Some(pem.into());
        self
    }

    /// Disables server certificate verification.
    #[must_use]
    pub fn skip_server_verification(mut self, skip: bool) -> Self {
        self.verification.skip_common_name_check = skip;
        self
    }

    /// Sets the X.509 client certificate and key.
    #[must_use]
    pub fn client_auth(mut self, cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        self.authentication.client_cert_pem = Some(cert_pem.into());
        self.authentication.client_key_pem = Some(key_pem.into());
        self
    }

    /// Enables per-package tx/rx logging at info level.
    #[must_use]
    pub fn log_rxtx_package(mut self, log: bool) -> Self {
        self.log_rxtx_package = log;
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure, see
    /// [`TransportConfig::validate`].
    pub fn build(self) -> Result<TransportConfig, ConfigError> {
        let config = TransportConfig {
            schema: self.schema,
            host: self.host.unwrap_or_default(),
            port: self.port,
            path: self.path,
            credentials: self.credentials,
            verification: self.verification,
            authentication: self.authentication,
            log_rxtx_package: self.log_rxtx_package,
        };
        config.validate()?;
        Ok(config)
    }
}
