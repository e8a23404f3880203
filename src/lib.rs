// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `ThingsR` Lib - A Rust client library for the ThingsBoard IoT platform.
//!
//! This library lets a device participate in the [ThingsBoard] platform
//! over MQTT. It is built as a two-layer stack:
//!
//! - [`protocol::MqttConnection`] — a thin transport adapter that
//!   multiplexes typed request/response conversations over one shared MQTT
//!   session: correlation ids, pending-request tracking, payload
//!   reassembly, timeout sweeping and disconnect flushing.
//! - [`Device`] — the domain layer on top: telemetry, client and shared
//!   attributes, RPC in both directions, chunked firmware download,
//!   provisioning and claiming.
//!
//! [ThingsBoard]: https://thingsboard.io
//!
//! # Supported Features
//!
//! - **Telemetry**: publish time-series values
//! - **Attributes**: publish client-side attributes, fetch client/shared
//!   values by key, subscribe to shared-attribute pushes
//! - **RPC**: call server-side methods and serve platform-initiated calls
//! - **Firmware**: chunked OTA download with per-chunk callbacks
//! - **Provisioning & claiming**: register and claim devices
//!
//! # Quick Start
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
//!     device.connect(&config, DeviceEvents::default())?;
//!
//!     device.send_telemetry(&serde_json::json!({"temperature": 21.5})).await?;
//!
//!     // Drive the timeout sweep from a task loop.
//!     let sweeper = device.clone();
//!     tokio::spawn(async move {
//!         loop {
//!             tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!             sweeper.check_timeout();
//!         }
//!     });
//!     Ok(())
//! }
//! ```
//!
//! # Request/Response Model
//!
//! Attribute fetches, client-side RPC, firmware chunks and provisioning
//! are request/response conversations: the request topic carries a
//! correlation id, the response echoes it (provisioning responses are
//! matched by family instead, their topic has no id). For every request
//! exactly one of its callbacks fires, at most once: `on_response` when
//! the answer arrives, `on_timeout` after 30 seconds without one or when
//! the connection drops.
//!
//! Callbacks run on the MQTT event-loop task (or the sweeping task for
//! timeouts) and must not block; they may freely call back into the
//! library, no internal lock is held while they run.
//!
//! # TLS
//!
//! `mqtts`/`wss` schemas enable TLS via `rustls`: pass a CA bundle in the
//! transport configuration, or opt out of verification for self-signed
//! brokers. X.509 client certificates are supported as a credential type.

pub mod config;
pub mod device;
pub mod error;
pub mod protocol;

pub use config::{
    ClientAuthentication, Credentials, Schema, ServerVerification, TransportConfig,
    TransportConfigBuilder,
};
pub use device::attributes::{OnAttributeValue, OnAttributesResponse};
pub use device::provision::{OnProvisionResponse, ProvisionRequest};
pub use device::rpc::{OnRpcResponse, ServerRpcHandler};
pub use device::{Device, DeviceEvents};
pub use error::{ConfigError, Error, ProtocolError, Result};
pub use protocol::{
    ConnectionEvents, ConnectionState, MqttConnection, OnConnected, OnDisconnected,
    OnFirmwareChunk, OnResponse, OnServerRpcRequest, OnSharedAttributes, OnTimeout,
    REQUEST_TIMEOUT_SECS, RequestFamily, RequestId,
};
