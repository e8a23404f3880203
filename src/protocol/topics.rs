// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ThingsBoard MQTT topic layout and inbound message classification.
//!
//! The device API of the platform multiplexes all conversations over a
//! fixed set of topics under `v1/devices/me/` (plus the v2 firmware tree
//! and the provisioning pair). Correlation always uses the topic suffix,
//! never the payload body.

use crate::protocol::RequestId;

/// Telemetry publish topic.
pub const TELEMETRY_TOPIC: &str = "v1/devices/me/telemetry";

/// Client-side attribute publish topic; also the shared-attribute push
/// subscription.
pub const ATTRIBUTES_TOPIC: &str = "v1/devices/me/attributes";

/// Prefix of outbound attribute request topics (`.../request/<id>`).
pub const ATTRIBUTES_REQUEST_PREFIX: &str = "v1/devices/me/attributes/request/";

/// Prefix of inbound attribute response topics (`.../response/<id>`).
pub const ATTRIBUTES_RESPONSE_PREFIX: &str = "v1/devices/me/attributes/response/";

/// Subscription filter for attribute responses.
pub const ATTRIBUTES_RESPONSE_SUBSCRIBE: &str = "v1/devices/me/attributes/response/+";

/// Prefix of inbound server-side RPC request topics.
pub const RPC_REQUEST_PREFIX: &str = "v1/devices/me/rpc/request/";

/// Subscription filter for server-side RPC requests.
pub const RPC_REQUEST_SUBSCRIBE: &str = "v1/devices/me/rpc/request/+";

/// Prefix of RPC response topics: inbound for client-side RPC, outbound
/// for server-side RPC replies.
pub const RPC_RESPONSE_PREFIX: &str = "v1/devices/me/rpc/response/";

/// Subscription filter for client-side RPC responses.
pub const RPC_RESPONSE_SUBSCRIBE: &str = "v1/devices/me/rpc/response/+";

/// Prefix of outbound firmware chunk request topics.
pub const FIRMWARE_REQUEST_PREFIX: &str = "v2/fw/request/";

/// Prefix of inbound firmware chunk response topics.
pub const FIRMWARE_RESPONSE_PREFIX: &str = "v2/fw/response/";

/// Subscription filter for firmware chunk responses.
pub const FIRMWARE_RESPONSE_SUBSCRIBE: &str = "v2/fw/response/+/chunk/+";

/// Device provisioning request topic.
pub const PROVISION_REQUEST_TOPIC: &str = "/provision/request";

/// Device provisioning response topic. Carries no request id; provisioning
/// responses are correlated by family instead.
pub const PROVISION_RESPONSE_TOPIC: &str = "/provision/response";

/// Device claiming topic.
pub const CLAIM_TOPIC: &str = "v1/devices/me/claim";

pub(crate) fn attributes_request_topic(id: RequestId) -> String {
    format!("{ATTRIBUTES_REQUEST_PREFIX}{id}")
}

pub(crate) fn rpc_request_topic(id: RequestId) -> String {
    format!("{RPC_REQUEST_PREFIX}{id}")
}

pub(crate) fn rpc_response_topic(id: RequestId) -> String {
    format!("{RPC_RESPONSE_PREFIX}{id}")
}

pub(crate) fn firmware_request_topic(id: RequestId, chunk: u32) -> String {
    format!("{FIRMWARE_REQUEST_PREFIX}{id}/chunk/{chunk}")
}

/// Classification of one inbound message by its topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    /// Response to an attribute fetch.
    AttributeResponse { request_id: RequestId },
    /// Unsolicited shared-attribute push.
    SharedAttributes,
    /// Unsolicited server-side RPC request.
    ServerRpcRequest { request_id: RequestId },
    /// Response to a client-side RPC.
    ClientRpcResponse { request_id: RequestId },
    /// One chunk of a firmware image.
    FirmwareChunk { request_id: RequestId, chunk: u32 },
    /// Response to a provisioning request (no id in the topic).
    ProvisionResponse,
}

/// Classifies an inbound topic into its conversation, or `None` for
/// unknown topics and unparseable id suffixes.
///
/// The exact attributes topic is a strict prefix of the attribute response
/// prefix, so the longer prefix is checked first.
pub(crate) fn classify(topic: &str) -> Option<Route> {
    if let Some(suffix) = topic.strip_prefix(ATTRIBUTES_RESPONSE_PREFIX) {
        return Some(Route::AttributeResponse {
            request_id: parse_id(suffix)?,
        });
    }
    if topic == ATTRIBUTES_TOPIC {
        return Some(Route::SharedAttributes);
    }
    if let Some(suffix) = topic.strip_prefix(RPC_REQUEST_PREFIX) {
        return Some(Route::ServerRpcRequest {
            request_id: parse_id(suffix)?,
        });
    }
    if let Some(suffix) = topic.strip_prefix(RPC_RESPONSE_PREFIX) {
        return Some(Route::ClientRpcResponse {
            request_id: parse_id(suffix)?,
        });
    }
    if let Some(suffix) = topic.strip_prefix(FIRMWARE_RESPONSE_PREFIX) {
        let (id, chunk) = suffix.split_once("/chunk/")?;
        return Some(Route::FirmwareChunk {
            request_id: parse_id(id)?,
            chunk: chunk.parse().ok()?,
        });
    }
    if topic == PROVISION_RESPONSE_TOPIC {
        return Some(Route::ProvisionResponse);
    }
    None
}

fn parse_id(suffix: &str) -> Option<RequestId> {
    RequestId::new(suffix.parse().ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u32) -> RequestId {
        RequestId::new(raw).unwrap()
    }

    #[test]
    fn classify_attribute_response() {
        assert_eq!(
            classify("v1/devices/me/attributes/response/12"),
            Some(Route::AttributeResponse { request_id: id(12) })
        );
    }

    #[test]
    fn classify_shared_attributes_exact_only() {
        assert_eq!(
            classify("v1/devices/me/attributes"),
            Some(Route::SharedAttributes)
        );
        // The response prefix must win over the shorter attributes topic.
        assert_ne!(
            classify("v1/devices/me/attributes/response/1"),
            Some(Route::SharedAttributes)
        );
        assert_eq!(classify("v1/devices/me/attributes/other"), None);
    }

    #[test]
    fn classify_rpc_topics() {
        assert_eq!(
            classify("v1/devices/me/rpc/request/3"),
            Some(Route::ServerRpcRequest { request_id: id(3) })
        );
        assert_eq!(
            classify("v1/devices/me/rpc/response/4"),
            Some(Route::ClientRpcResponse { request_id: id(4) })
        );
    }

    #[test]
    fn classify_firmware_chunk() {
        assert_eq!(
            classify("v2/fw/response/2/chunk/7"),
            Some(Route::FirmwareChunk {
                request_id: id(2),
                chunk: 7
            })
        );
        assert_eq!(classify("v2/fw/response/2/chunk/"), None);
        assert_eq!(classify("v2/fw/response/2"), None);
        assert_eq!(classify("v2/fw/response/x/chunk/0"), None);
    }

    #[test]
    fn classify_provision_response() {
        assert_eq!(classify("/provision/response"), Some(Route::ProvisionResponse));
        assert_eq!(classify("/provision/response/extra"), None);
    }

    #[test]
    fn classify_rejects_bad_ids() {
        assert_eq!(classify("v1/devices/me/attributes/response/abc"), None);
        assert_eq!(classify("v1/devices/me/attributes/response/0"), None);
        assert_eq!(classify("v1/devices/me/rpc/request/-1"), None);
        assert_eq!(classify("v1/devices/me/rpc/response/1/extra"), None);
    }

    #[test]
    fn classify_unknown_topics() {
        assert_eq!(classify("v1/devices/me/telemetry"), None);
        assert_eq!(classify("stat/some/other/broker"), None);
        assert_eq!(classify(""), None);
    }

    #[test]
    fn request_topic_formatting() {
        assert_eq!(
            attributes_request_topic(id(1)),
            "v1/devices/me/attributes/request/1"
        );
        assert_eq!(rpc_request_topic(id(5)), "v1/devices/me/rpc/request/5");
        assert_eq!(rpc_response_topic(id(6)), "v1/devices/me/rpc/response/6");
        assert_eq!(firmware_request_topic(id(2), 0), "v2/fw/request/2/chunk/0");
    }
}
