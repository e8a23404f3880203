// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High-level ThingsBoard device client.
//!
//! [`Device`] layers the platform's domain objects on top of the low-level
//! [`MqttConnection`]: telemetry and client-attribute publishing, attribute
//! fetches with per-key routing, client- and server-side RPC, chunked
//! firmware download, device provisioning and claiming.
//!
//! Every domain keeps its own registry of outstanding requests so that
//! domain callbacks can run after the low-level correlation resolves. All
//! registries share one mutex; no user callback is invoked while it is
//! held, so callbacks are free to call back into the device.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use thingsr_lib::{Credentials, Device, DeviceEvents, TransportConfig};
//!
//! #[tokio::main]
//! async fn main() -> thingsr_lib::Result<()> {
//!     let config = TransportConfig::builder()
//!         .host("thingsboard.example.com")
//!         .credentials(Credentials::access_token("A1_TEST_TOKEN"))
//!         .build()?;
//!
//!     let device = Device::new();
//!     device.register_shared_attribute(
//!         "fwVersion",
//!         Some(Arc::new(|key, value| {
//!             println!("{key} changed to {value}");
//!         })),
//!     );
//!     device.connect(&config, DeviceEvents::default())?;
//!
//!     device.send_telemetry(&serde_json::json!({"temperature": 21.5})).await?;
//!     Ok(())
//! }
//! ```

pub mod attributes;
pub mod ota;
pub mod provision;
pub mod rpc;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    ConnectionEvents, ConnectionState, MqttConnection, OnConnected, OnDisconnected,
};

/// Lifecycle callbacks of the device client.
#[derive(Clone, Default)]
pub struct DeviceEvents {
    /// Fired once the session is connected and subscribed.
    pub on_connected: Option<OnConnected>,
    /// Fired after a disconnect, once pending requests were flushed.
    pub on_disconnected: Option<OnDisconnected>,
}

/// A device connected to the ThingsBoard platform.
///
/// Cheaply cloneable; clones share the connection and all registries.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

pub(crate) struct DeviceInner {
    pub(crate) connection: MqttConnection,
    /// Single helper-level mutex guarding all domain registries. Critical
    /// sections are short; lock order is helper first, then the low-level
    /// pending table, never the reverse.
    pub(crate) registries: Mutex<Registries>,
}

/// All domain registries, guarded together by the helper mutex.
#[derive(Default)]
pub(crate) struct Registries {
    pub(crate) client_attributes: attributes::AttributeRegistry,
    pub(crate) shared_attributes: attributes::AttributeRegistry,
    pub(crate) attribute_requests: attributes::AttributeRequestRegistry,
    pub(crate) client_rpc: rpc::ClientRpcRegistry,
    pub(crate) server_rpc: rpc::ServerRpcRegistry,
    pub(crate) firmware: ota::FirmwareRegistry,
    pub(crate) provision: provision::ProvisionRegistry,
}

impl Device {
    /// Creates a disconnected device client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                connection: MqttConnection::new(),
                registries: Mutex::new(Registries::default()),
            }),
        }
    }

    /// Starts a session against the platform.
    ///
    /// Shared-attribute pushes and server-side RPC requests are routed into
    /// the device's registries; the caller's lifecycle callbacks fire on
    /// connect and disconnect.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a session is
    /// already active.
    pub fn connect(&self, config: &TransportConfig, events: DeviceEvents) -> Result<()> {
        let wired = self.wire_events(events);
        self.inner.connection.connect(config, wired)
    }

    /// Tears the session down, flushing outstanding requests as timeouts.
    pub async fn disconnect(&self) {
        self.inner.connection.disconnect().await;
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Returns whether the session is connected and subscribed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    /// Sweeps expired requests of every domain. Call periodically from a
    /// task loop; see [`MqttConnection::check_timeout`] for the coalescing
    /// behavior.
    pub fn check_timeout(&self) {
        self.inner.connection.check_timeout();
    }

    /// The underlying low-level connection.
    #[must_use]
    pub fn connection(&self) -> &MqttConnection {
        &self.inner.connection
    }

    /// Publishes telemetry time-series values. Fire-and-forget.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without a live session, an
    /// [`Error::InvalidArgument`] if the values do not serialize, or the
    /// MQTT error if the publish is rejected.
    pub async fn send_telemetry<T: Serialize>(&self, values: &T) -> Result<()> {
        let payload = to_json(values)?;
        self.inner.connection.publish_telemetry(&payload).await
    }

    /// Publishes client-side attribute values. Fire-and-forget.
    ///
    /// # Errors
    ///
    /// See [`send_telemetry`](Self::send_telemetry).
    pub async fn update_client_attributes<T: Serialize>(&self, values: &T) -> Result<()> {
        let payload = to_json(values)?;
        self.inner
            .connection
            .publish_client_attributes(&payload)
            .await
    }

    /// Builds the connection-level callbacks: user lifecycle callbacks plus
    /// broadcast routing into the device registries.
    fn wire_events(&self, events: DeviceEvents) -> ConnectionEvents {
        let shared = Arc::downgrade(&self.inner);
        let server_rpc = Arc::downgrade(&self.inner);
        ConnectionEvents {
            on_connected: events.on_connected,
            on_disconnected: events.on_disconnected,
            on_shared_attributes: Some(Arc::new(move |payload| {
                if let Some(inner) = shared.upgrade() {
                    inner.handle_shared_attributes(payload);
                }
            })),
            on_server_rpc_request: Some(Arc::new(move |id, payload| {
                if let Some(inner) = server_rpc.upgrade() {
                    DeviceInner::handle_server_rpc(&inner, id, payload);
                }
            })),
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("state", &self.state())
            .finish()
    }
}

fn to_json<T: Serialize>(values: &T) -> Result<String> {
    serde_json::to_string(values).map_err(|e| Error::InvalidArgument(e.to_string()))
}

#[cfg(test)]
impl Device {
    /// A device with broadcast routing wired but no broker session, for
    /// driving the inbound path directly.
    pub(crate) fn wired_for_tests() -> Self {
        let device = Self::new();
        device
            .inner
            .connection
            .engine()
            .set_events(device.wire_events(DeviceEvents::default()));
        device
    }
}
