// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mapping from [`TransportConfig`] to `rumqttc` connection options.
//!
//! TLS goes through `rustls`: a CA bundle from `cert_pem`, optional X.509
//! client authentication, and an opt-out verifier for brokers with
//! self-signed certificates.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{MqttOptions, TlsConfiguration, Transport};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::config::{Credentials, TransportConfig};
use crate::error::ConfigError;

/// MQTT keep-alive interval in seconds.
const KEEPALIVE_SECS: u64 = 30;

/// Certificate verifier that accepts any certificate. Selected by the
/// `skip_common_name_check` transport option for self-signed brokers.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Builds the `rumqttc` options for a validated configuration.
pub(crate) fn mqtt_options(
    config: &TransportConfig,
    client_id: &str,
) -> Result<MqttOptions, ConfigError> {
    let port = config.effective_port();

    let mut options = if config.schema.uses_websocket() {
        // For websocket transports rumqttc takes the full URL in place of
        // the host; the port argument is ignored.
        let scheme = if config.schema.uses_tls() { "wss" } else { "ws" };
        let url = format!("{scheme}://{}:{port}{}", config.host, config.path);
        MqttOptions::new(client_id, url, port)
    } else {
        MqttOptions::new(client_id, &config.host, port)
    };
    options.set_keep_alive(Duration::from_secs(KEEPALIVE_SECS));
    options.set_clean_session(true);

    match &config.credentials {
        Credentials::None | Credentials::X509 => {}
        Credentials::AccessToken { token } => {
            // ThingsBoard access tokens travel as the MQTT username.
            options.set_credentials(token, "");
        }
        Credentials::BasicMqtt {
            username, password, ..
        } => {
            if let Some(username) = username {
                options.set_credentials(username, password.clone().unwrap_or_default());
            }
        }
    }

    if config.schema.uses_tls() {
        let tls = TlsConfiguration::Rustls(Arc::new(client_tls_config(config)?));
        let transport = if config.schema.uses_websocket() {
            Transport::Wss(tls)
        } else {
            Transport::Tls(tls)
        };
        options.set_transport(transport);
    } else if config.schema.uses_websocket() {
        options.set_transport(Transport::Ws);
    }

    Ok(options)
}

/// Builds the rustls client configuration for TLS schemas.
fn client_tls_config(config: &TransportConfig) -> Result<ClientConfig, ConfigError> {
    let client_auth = client_auth_material(config)?;

    if config.verification.skip_common_name_check {
        let builder = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier));
        return match client_auth {
            Some((certs, key)) => builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ConfigError::InvalidPem(e.to_string())),
            None => Ok(builder.with_no_client_auth()),
        };
    }

    let Some(ca_pem) = config.verification.cert_pem.as_deref() else {
        return Err(ConfigError::MissingCaCert);
    };
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
        let cert = cert.map_err(|e| ConfigError::InvalidPem(e.to_string()))?;
        roots
            .add(cert)
            .map_err(|e| ConfigError::InvalidPem(e.to_string()))?;
    }
    if roots.is_empty() {
        return Err(ConfigError::InvalidPem(
            "cert_pem contains no certificates".to_owned(),
        ));
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    match client_auth {
        Some((certs, key)) => builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| ConfigError::InvalidPem(e.to_string())),
        None => Ok(builder.with_no_client_auth()),
    }
}

type ClientAuthMaterial = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// Parses the X.509 client certificate chain and key, when configured.
fn client_auth_material(config: &TransportConfig) -> Result<Option<ClientAuthMaterial>, ConfigError> {
    if !matches!(config.credentials, Credentials::X509) {
        return Ok(None);
    }
    let (Some(cert_pem), Some(key_pem)) = (
        config.authentication.client_cert_pem.as_deref(),
        config.authentication.client_key_pem.as_deref(),
    ) else {
        return Err(ConfigError::IncompleteClientAuth);
    };

    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::InvalidPem(e.to_string()))?;
    if certs.is_empty() {
        return Err(ConfigError::InvalidPem(
            "client_cert_pem contains no certificates".to_owned(),
        ));
    }
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| ConfigError::InvalidPem(e.to_string()))?
        .ok_or_else(|| ConfigError::InvalidPem("client_key_pem contains no key".to_owned()))?;

    Ok(Some((certs, key)))
}
