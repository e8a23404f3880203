// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remote procedure calls in both directions.
//!
//! Client-side RPC sends a `{"method":...,"params":...}` envelope and hands
//! the raw response payload back to the caller. Server-side RPC dispatches
//! inbound requests to named handlers registered up front; a handler's
//! return value is published as the reply.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::device::{Device, DeviceInner};
use crate::error::Result;
use crate::protocol::{OnTimeout, RequestId};

/// Callback invoked with the raw payload of a client-side RPC response.
pub type OnRpcResponse = Arc<dyn Fn(RequestId, &[u8]) + Send + Sync>;

/// Handler of one server-side RPC method. Returning a value publishes it
/// as the reply; `None` leaves the request unanswered.
pub type ServerRpcHandler = Arc<dyn Fn(RequestId, &Value) -> Option<Value> + Send + Sync>;

/// One outstanding client-side RPC at the helper level.
pub(crate) struct ClientRpcRecord {
    id: RequestId,
    on_response: Option<OnRpcResponse>,
    on_timeout: Option<OnTimeout>,
}

/// Helper-level list of outstanding client-side RPCs.
#[derive(Default)]
pub(crate) struct ClientRpcRegistry {
    records: Vec<ClientRpcRecord>,
}

impl ClientRpcRegistry {
    fn insert(&mut self, record: ClientRpcRecord) {
        self.records.push(record);
    }

    fn take(&mut self, id: RequestId) -> Option<ClientRpcRecord> {
        let index = self.records.iter().position(|record| record.id == id)?;
        Some(self.records.remove(index))
    }
}

/// Named server-side RPC method handlers.
#[derive(Default)]
pub(crate) struct ServerRpcRegistry {
    handlers: HashMap<String, ServerRpcHandler>,
}

impl ServerRpcRegistry {
    fn register(&mut self, method: String, handler: ServerRpcHandler) {
        if self.handlers.insert(method.clone(), handler).is_some() {
            tracing::debug!(%method, "server RPC handler replaced");
        }
    }

    fn handler(&self, method: &str) -> Option<ServerRpcHandler> {
        self.handlers.get(method).cloned()
    }
}

impl Device {
    /// Calls a server-side method on the platform.
    ///
    /// The response payload is handed to `on_response` undecoded.
    ///
    /// # Errors
    ///
    /// Returns the low-level send errors; see
    /// [`MqttConnection::request_client_rpc`](crate::protocol::MqttConnection::request_client_rpc).
    pub async fn rpc_request(
        &self,
        method: &str,
        params: Option<Value>,
        on_response: Option<OnRpcResponse>,
        on_timeout: Option<OnTimeout>,
    ) -> Result<RequestId> {
        let payload = serde_json::json!({
            "method": method,
            "params": params.unwrap_or(Value::Null),
        })
        .to_string();

        let response_inner = Arc::downgrade(&self.inner);
        let timeout_inner = Arc::downgrade(&self.inner);
        let id = self
            .inner
            .connection
            .request_client_rpc(
                &payload,
                Some(Arc::new(move |id, payload| {
                    if let Some(inner) = response_inner.upgrade() {
                        inner.handle_client_rpc_response(id, payload);
                    }
                })),
                Some(Arc::new(move |id| {
                    if let Some(inner) = timeout_inner.upgrade() {
                        inner.handle_client_rpc_timeout(id);
                    }
                })),
            )
            .await?;

        self.inner
            .registries
            .lock()
            .client_rpc
            .insert(ClientRpcRecord {
                id,
                on_response,
                on_timeout,
            });
        Ok(id)
    }

    /// Registers a handler for one server-side RPC method.
    ///
    /// When the platform calls the method, the handler runs with the
    /// request's params; a returned value is published as the reply.
    /// Requests for methods without a handler are logged and dropped.
    pub fn register_server_rpc(&self, method: impl Into<String>, handler: ServerRpcHandler) {
        self.inner
            .registries
            .lock()
            .server_rpc
            .register(method.into(), handler);
    }

    /// Publishes a reply to a server-side RPC request. Fire-and-forget;
    /// for replies produced outside a registered handler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`](crate::Error::NotConnected) without
    /// a live session, or the MQTT error if the publish is rejected.
    pub async fn server_rpc_response(&self, id: RequestId, payload: &str) -> Result<()> {
        self.inner.connection.respond_server_rpc(id, payload).await
    }
}

impl DeviceInner {
    /// Completes a client-side RPC: strips the helper record and calls the
    /// caller back with the raw payload.
    pub(crate) fn handle_client_rpc_response(&self, id: RequestId, payload: &[u8]) {
        let record = self.registries.lock().client_rpc.take(id);
        let Some(record) = record else {
            tracing::warn!(id = %id, "client RPC response without helper record; dropped");
            return;
        };
        if let Some(on_response) = record.on_response {
            on_response(id, payload);
        }
    }

    /// Times a client-side RPC out at the helper level.
    pub(crate) fn handle_client_rpc_timeout(&self, id: RequestId) {
        let record = self.registries.lock().client_rpc.take(id);
        let Some(record) = record else {
            tracing::warn!(id = %id, "client RPC timeout without helper record");
            return;
        };
        if let Some(on_timeout) = record.on_timeout {
            on_timeout(id);
        }
    }

    /// Dispatches an inbound server-side RPC request to its handler and
    /// publishes the reply, if the handler produced one.
    pub(crate) fn handle_server_rpc(inner: &Arc<Self>, id: RequestId, payload: &[u8]) {
        let envelope: Value = match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "malformed server RPC request; dropped");
                return;
            }
        };
        let Some(method) = envelope.get("method").and_then(Value::as_str) else {
            tracing::warn!(id = %id, "server RPC request without method; dropped");
            return;
        };
        let params = envelope.get("params").cloned().unwrap_or(Value::Null);

        let handler = inner.registries.lock().server_rpc.handler(method);
        let Some(handler) = handler else {
            tracing::warn!(id = %id, method, "no handler for server RPC method; dropped");
            return;
        };

        let Some(reply) = handler(id, &params) else {
            return;
        };

        // The reply publish is async; hop onto the runtime that drives the
        // MQTT event loop.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(inner);
                handle.spawn(async move {
                    if let Err(e) = inner
                        .connection
                        .respond_server_rpc(id, &reply.to_string())
                        .await
                    {
                        tracing::warn!(id = %id, error = %e, "server RPC reply publish failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(id = %id, "no tokio runtime available to publish the RPC reply");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn rpc_round_trip_hands_back_raw_payload() {
        let device = Device::wired_for_tests();
        let seen = Arc::new(PlMutex::new(None::<(u32, Vec<u8>)>));

        let seen_clone = Arc::clone(&seen);
        let id = device
            .rpc_request(
                "getTime",
                None,
                Some(Arc::new(move |id, payload| {
                    *seen_clone.lock() = Some((id.value(), payload.to_vec()));
                })),
                None,
            )
            .await
            .unwrap();

        device.inner.connection.engine().dispatch(
            &format!("v1/devices/me/rpc/response/{id}"),
            br#"{"time":"2024-01-01T00:00:00Z"}"#,
        );

        let seen = seen.lock();
        let (seen_id, payload) = seen.as_ref().unwrap();
        assert_eq!(*seen_id, id.value());
        assert_eq!(payload, br#"{"time":"2024-01-01T00:00:00Z"}"#);
        assert_eq!(device.inner.registries.lock().client_rpc.records.len(), 0);
    }

    #[tokio::test]
    async fn rpc_timeout_reaches_helper_callback() {
        let device = Device::wired_for_tests();
        let timeouts = Arc::new(AtomicU32::new(0));

        let timeouts_clone = Arc::clone(&timeouts);
        device
            .rpc_request(
                "getTime",
                None,
                None,
                Some(Arc::new(move |_| {
                    timeouts_clone.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .await
            .unwrap();

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        device
            .inner
            .connection
            .engine()
            .check_timeout_at(now + crate::protocol::REQUEST_TIMEOUT_SECS + 2);

        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(device.inner.registries.lock().client_rpc.records.len(), 0);
    }

    #[tokio::test]
    async fn server_rpc_dispatches_to_registered_handler() {
        let device = Device::wired_for_tests();
        let calls = Arc::new(PlMutex::new(Vec::<(u32, Value)>::new()));

        let calls_clone = Arc::clone(&calls);
        device.register_server_rpc(
            "setGpio",
            Arc::new(move |id, params| {
                calls_clone.lock().push((id.value(), params.clone()));
                Some(serde_json::json!({"done": true}))
            }),
        );

        device.inner.connection.engine().dispatch(
            "v1/devices/me/rpc/request/9",
            br#"{"method":"setGpio","params":{"pin":4,"value":1}}"#,
        );

        let calls = calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 9);
        assert_eq!(calls[0].1, serde_json::json!({"pin":4,"value":1}));
    }

    #[tokio::test]
    async fn server_rpc_without_handler_is_dropped() {
        let device = Device::wired_for_tests();
        device.inner.connection.engine().dispatch(
            "v1/devices/me/rpc/request/9",
            br#"{"method":"unknownMethod","params":null}"#,
        );
        // Nothing to assert beyond not panicking; the request is logged.
    }

    #[tokio::test]
    async fn server_rpc_handler_may_issue_requests() {
        let device = Device::wired_for_tests();
        let nested = Arc::new(AtomicU32::new(0));

        let device_clone = device.clone();
        let nested_clone = Arc::clone(&nested);
        device.register_server_rpc(
            "reconfigure",
            Arc::new(move |_, _| {
                // Re-entering the registries must not deadlock.
                device_clone.register_shared_attribute("nestedKey", None);
                nested_clone.fetch_add(1, Ordering::SeqCst);
                None
            }),
        );

        device.inner.connection.engine().dispatch(
            "v1/devices/me/rpc/request/3",
            br#"{"method":"reconfigure"}"#,
        );

        assert_eq!(nested.load(Ordering::SeqCst), 1);
    }
}
