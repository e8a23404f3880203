// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Attribute handling: client- and shared-attribute registries plus
//! attribute fetch requests.
//!
//! The two attribute registries own the authoritative key sets of the
//! device. A fetch request names keys from either set; the registry splits
//! them into the `clientKeys`/`sharedKeys` groups of the request payload,
//! and routes the values of the response back to the per-key callbacks.
//! Shared attributes additionally receive unsolicited update pushes from
//! the platform.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::device::{Device, DeviceInner};
use crate::error::{Error, Result};
use crate::protocol::{OnTimeout, RequestId};

/// Callback invoked with an attribute's key and new value.
pub type OnAttributeValue = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Callback invoked when an attribute fetch completed and its values were
/// routed to the per-key callbacks.
pub type OnAttributesResponse = Arc<dyn Fn(RequestId) + Send + Sync>;

/// Authoritative set of attribute keys with optional per-key callbacks.
#[derive(Default)]
pub(crate) struct AttributeRegistry {
    entries: HashMap<String, Option<OnAttributeValue>>,
}

impl AttributeRegistry {
    fn register(&mut self, key: String, on_value: Option<OnAttributeValue>) {
        if self.entries.insert(key.clone(), on_value).is_some() {
            tracing::debug!(%key, "attribute registration replaced");
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn callback(&self, key: &str) -> Option<OnAttributeValue> {
        self.entries.get(key).and_then(Clone::clone)
    }
}

/// One outstanding attribute fetch at the helper level.
pub(crate) struct AttributeRequestRecord {
    id: RequestId,
    on_response: Option<OnAttributesResponse>,
    on_timeout: Option<OnTimeout>,
}

/// Helper-level list of outstanding attribute fetches.
#[derive(Default)]
pub(crate) struct AttributeRequestRegistry {
    records: Vec<AttributeRequestRecord>,
}

impl AttributeRequestRegistry {
    fn insert(&mut self, record: AttributeRequestRecord) {
        self.records.push(record);
    }

    fn take(&mut self, id: RequestId) -> Option<AttributeRequestRecord> {
        let index = self.records.iter().position(|record| record.id == id)?;
        Some(self.records.remove(index))
    }
}

/// Builds the attribute request body, omitting empty groups.
fn request_payload(client_keys: &[String], shared_keys: &[String]) -> String {
    let mut body = serde_json::Map::new();
    if !client_keys.is_empty() {
        body.insert("clientKeys".to_owned(), Value::String(client_keys.join(",")));
    }
    if !shared_keys.is_empty() {
        body.insert("sharedKeys".to_owned(), Value::String(shared_keys.join(",")));
    }
    Value::Object(body).to_string()
}

impl Device {
    /// Registers a client-side attribute key, with an optional callback
    /// fired when a fetch returns the attribute's value.
    ///
    /// Only registered keys participate in [`request_attributes`]; keys the
    /// device never registered are skipped with a warning.
    ///
    /// [`request_attributes`]: Self::request_attributes
    pub fn register_client_attribute(
        &self,
        key: impl Into<String>,
        on_value: Option<OnAttributeValue>,
    ) {
        self.inner
            .registries
            .lock()
            .client_attributes
            .register(key.into(), on_value);
    }

    /// Registers a shared attribute key, with an optional callback fired on
    /// update pushes and fetch responses.
    pub fn register_shared_attribute(
        &self,
        key: impl Into<String>,
        on_update: Option<OnAttributeValue>,
    ) {
        self.inner
            .registries
            .lock()
            .shared_attributes
            .register(key.into(), on_update);
    }

    /// Fetches current attribute values from the platform.
    ///
    /// The keys are split into client-side and shared groups by looking
    /// them up in the two attribute registries; unknown keys are logged and
    /// skipped. The response routes every returned value to its per-key
    /// callback, then fires `on_response`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if no requested key is registered
    /// in either registry, otherwise the low-level send errors.
    pub async fn request_attributes(
        &self,
        keys: &[&str],
        on_response: Option<OnAttributesResponse>,
        on_timeout: Option<OnTimeout>,
    ) -> Result<RequestId> {
        let (client_keys, shared_keys) = {
            let registries = self.inner.registries.lock();
            let mut client_keys = Vec::new();
            let mut shared_keys = Vec::new();
            for &key in keys {
                if registries.client_attributes.contains(key) {
                    client_keys.push(key.to_owned());
                } else if registries.shared_attributes.contains(key) {
                    shared_keys.push(key.to_owned());
                } else {
                    tracing::warn!(key, "attribute key not registered; skipped");
                }
            }
            (client_keys, shared_keys)
        };
        if client_keys.is_empty() && shared_keys.is_empty() {
            return Err(Error::InvalidArgument(
                "no registered attribute keys in request".to_owned(),
            ));
        }

        let payload = request_payload(&client_keys, &shared_keys);

        let response_inner = Arc::downgrade(&self.inner);
        let timeout_inner = Arc::downgrade(&self.inner);
        let id = self
            .inner
            .connection
            .request_attributes(
                &payload,
                Some(Arc::new(move |id, payload| {
                    if let Some(inner) = response_inner.upgrade() {
                        inner.handle_attributes_response(id, payload);
                    }
                })),
                Some(Arc::new(move |id| {
                    if let Some(inner) = timeout_inner.upgrade() {
                        inner.handle_attributes_timeout(id);
                    }
                })),
            )
            .await?;

        self.inner
            .registries
            .lock()
            .attribute_requests
            .insert(AttributeRequestRecord {
                id,
                on_response,
                on_timeout,
            });
        Ok(id)
    }
}

impl DeviceInner {
    /// Completes an attribute fetch: strips the helper record, routes the
    /// `client`/`shared` values to their registries and calls the caller
    /// back. Callbacks run after the helper mutex is released.
    pub(crate) fn handle_attributes_response(&self, id: RequestId, payload: &[u8]) {
        let body: Value = match serde_json::from_slice(payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "malformed attribute response; dropped");
                return;
            }
        };

        let (record, routed) = {
            let registries = &mut *self.registries.lock();
            let Some(record) = registries.attribute_requests.take(id) else {
                tracing::warn!(id = %id, "attribute response without helper record; dropped");
                return;
            };

            let mut routed: Vec<(OnAttributeValue, String, Value)> = Vec::new();
            collect_group(
                body.get("client"),
                &registries.client_attributes,
                &mut routed,
            );
            collect_group(
                body.get("shared"),
                &registries.shared_attributes,
                &mut routed,
            );
            (record, routed)
        };

        for (on_value, key, value) in routed {
            on_value(&key, &value);
        }
        if let Some(on_response) = record.on_response {
            on_response(id);
        }
    }

    /// Times an attribute fetch out at the helper level.
    pub(crate) fn handle_attributes_timeout(&self, id: RequestId) {
        let record = self.registries.lock().attribute_requests.take(id);
        let Some(record) = record else {
            tracing::warn!(id = %id, "attribute timeout without helper record");
            return;
        };
        if let Some(on_timeout) = record.on_timeout {
            on_timeout(id);
        }
    }

    /// Routes an unsolicited shared-attribute push to the per-key
    /// callbacks.
    pub(crate) fn handle_shared_attributes(&self, payload: &[u8]) {
        let body: Value = match serde_json::from_slice(payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "malformed shared-attribute push; dropped");
                return;
            }
        };
        // The platform pushes a flat object; fetch-shaped payloads wrap the
        // values in a "shared" sub-object.
        let values = body.get("shared").unwrap_or(&body);

        let routed = {
            let registries = self.registries.lock();
            let mut routed: Vec<(OnAttributeValue, String, Value)> = Vec::new();
            collect_group(Some(values), &registries.shared_attributes, &mut routed);
            routed
        };
        for (on_update, key, value) in routed {
            on_update(&key, &value);
        }
    }
}

/// Collects the callbacks of every known key in one response group.
fn collect_group(
    group: Option<&Value>,
    registry: &AttributeRegistry,
    routed: &mut Vec<(OnAttributeValue, String, Value)>,
) {
    let Some(Value::Object(values)) = group else {
        return;
    };
    for (key, value) in values {
        match registry.callback(key) {
            Some(on_value) => routed.push((on_value, key.clone(), value.clone())),
            None => {
                if !registry.contains(key) {
                    tracing::trace!(%key, "attribute value for unregistered key; ignored");
                }
            }
        }
    }
}
