// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device provisioning and claiming.
//!
//! Provisioning registers a new device with the platform before it has
//! credentials; the response arrives on a topic without a correlation id
//! and is matched to the oldest pending provisioning request. Claiming
//! attaches an already provisioned device to a customer.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::device::{Device, DeviceInner};
use crate::error::{Error, Result};
use crate::protocol::{OnTimeout, RequestId};

/// Body of a provisioning request.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    /// Name for the new device. The platform generates one when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// Provisioning key of the device profile.
    pub provision_device_key: String,
    /// Provisioning secret of the device profile.
    pub provision_device_secret: String,
}

/// Callback invoked with the raw provisioning response payload.
pub type OnProvisionResponse = Arc<dyn Fn(RequestId, &[u8]) + Send + Sync>;

/// One outstanding provisioning request at the helper level.
pub(crate) struct ProvisionRecord {
    id: RequestId,
    on_response: Option<OnProvisionResponse>,
    on_timeout: Option<OnTimeout>,
}

/// Helper-level list of outstanding provisioning requests.
#[derive(Default)]
pub(crate) struct ProvisionRegistry {
    records: Vec<ProvisionRecord>,
}

impl ProvisionRegistry {
    fn insert(&mut self, record: ProvisionRecord) {
        self.records.push(record);
    }

    fn take(&mut self, id: RequestId) -> Option<ProvisionRecord> {
        let index = self.records.iter().position(|record| record.id == id)?;
        Some(self.records.remove(index))
    }
}

/// Builds the claiming message body, omitting absent fields.
fn claim_payload(secret_key: Option<&str>, duration_ms: Option<u64>) -> String {
    let mut body = serde_json::Map::new();
    if let Some(secret_key) = secret_key {
        body.insert("secretKey".to_owned(), Value::String(secret_key.to_owned()));
    }
    if let Some(duration_ms) = duration_ms {
        body.insert("durationMs".to_owned(), Value::from(duration_ms));
    }
    Value::Object(body).to_string()
}

impl Device {
    /// Sends a provisioning request to the platform.
    ///
    /// The response payload (device credentials or failure) is handed to
    /// `on_response` undecoded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the profile key or secret is
    /// empty, otherwise the low-level send errors.
    pub async fn provision_request(
        &self,
        request: &ProvisionRequest,
        on_response: Option<OnProvisionResponse>,
        on_timeout: Option<OnTimeout>,
    ) -> Result<RequestId> {
        if request.provision_device_key.is_empty() || request.provision_device_secret.is_empty() {
            return Err(Error::InvalidArgument(
                "provisioning requires a device profile key and secret".to_owned(),
            ));
        }
        let payload = serde_json::to_string(request)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;

        let response_inner = Arc::downgrade(&self.inner);
        let timeout_inner = Arc::downgrade(&self.inner);
        let id = self
            .inner
            .connection
            .request_provision(
                &payload,
                Some(Arc::new(move |id, payload| {
                    if let Some(inner) = response_inner.upgrade() {
                        inner.handle_provision_response(id, payload);
                    }
                })),
                Some(Arc::new(move |id| {
                    if let Some(inner) = timeout_inner.upgrade() {
                        inner.handle_provision_timeout(id);
                    }
                })),
            )
            .await?;

        self.inner
            .registries
            .lock()
            .provision
            .insert(ProvisionRecord {
                id,
                on_response,
                on_timeout,
            });
        Ok(id)
    }

    /// Sends a device claiming message. Fire-and-forget.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without a live session, or the MQTT
    /// error if the publish is rejected.
    pub async fn claim_device(
        &self,
        secret_key: Option<&str>,
        duration_ms: Option<u64>,
    ) -> Result<()> {
        self.inner
            .connection
            .publish_claim(&claim_payload(secret_key, duration_ms))
            .await
    }
}

impl DeviceInner {
    /// Completes a provisioning request at the helper level.
    pub(crate) fn handle_provision_response(&self, id: RequestId, payload: &[u8]) {
        let record = self.registries.lock().provision.take(id);
        let Some(record) = record else {
            tracing::warn!(id = %id, "provisioning response without helper record; dropped");
            return;
        };
        if let Some(on_response) = record.on_response {
            on_response(id, payload);
        }
    }

    /// Times a provisioning request out at the helper level.
    pub(crate) fn handle_provision_timeout(&self, id: RequestId) {
        let record = self.registries.lock().provision.take(id);
        let Some(record) = record else {
            tracing::warn!(id = %id, "provisioning timeout without helper record");
            return;
        };
        if let Some(on_timeout) = record.on_timeout {
            on_timeout(id);
        }
    }
}
