// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Low-level transport layer for the ThingsBoard MQTT device API.
//!
//! This module contains the request/response correlation engine:
//!
//! - [`MqttConnection`] — the connection object with its pending-request
//!   table, timeout sweep and topic router
//! - [`topics`] — the platform's topic layout
//! - callback type aliases and the [`RequestId`]/[`RequestFamily`] model
//!
//! Most applications use the higher-level [`Device`](crate::device::Device)
//! instead, which layers domain registries (attributes, RPC, firmware,
//! provisioning) on top of this engine.

mod connection;
mod pending;
mod reassembly;
pub mod topics;
mod transport;

pub use connection::{
    ConnectionEvents, ConnectionState, MqttConnection, OnConnected, OnDisconnected,
    OnServerRpcRequest, OnSharedAttributes,
};
pub use pending::{
    OnFirmwareChunk, OnResponse, OnTimeout, REQUEST_TIMEOUT_SECS, RequestFamily, RequestId,
    ResponseHandler,
};
