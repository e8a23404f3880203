// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pending request tracking for request/response conversations.
//!
//! Every outbound request that expects an answer is recorded in a
//! [`PendingTable`] keyed by its correlation id. The table is the single
//! source of truth for outstanding conversations: responses remove their
//! entry by id (or by family for provisioning, whose response topic carries
//! no id), and the timeout sweep drains everything that has waited longer
//! than [`REQUEST_TIMEOUT_SECS`].
//!
//! The table itself never invokes callbacks; callers remove entries first
//! and fire the callbacks after releasing the table lock.

use std::fmt;
use std::sync::Arc;

use crate::error::ProtocolError;

/// Seconds an outstanding request may wait for its response before the
/// timeout sweep reclaims it.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Correlation identifier embedded in request topics and echoed back in
/// response topics.
///
/// Ids are positive and unique among live requests of one connection. The
/// generating counter is never reset for the lifetime of the connection
/// object, so ids from before a reconnect are not reused after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u32);

impl RequestId {
    /// Creates a request id from a raw value. Returns `None` for zero,
    /// which the wire protocol does not use.
    #[must_use]
    pub const fn new(raw: u32) -> Option<Self> {
        if raw == 0 { None } else { Some(Self(raw)) }
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Families of request/response conversations multiplexed over one
/// connection.
///
/// Server-side RPC requests and shared-attribute pushes are unsolicited
/// inbound messages and never appear in the pending table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFamily {
    /// Attribute fetch (`v1/devices/me/attributes/request`).
    AttributeFetch,
    /// Client-side RPC (`v1/devices/me/rpc/request`).
    ClientRpc,
    /// Firmware chunk download (`v2/fw/request`).
    FirmwareChunk,
    /// Device provisioning (`/provision/request`).
    Provision,
}

/// Callback invoked with the raw response payload of a plain request.
pub type OnResponse = Arc<dyn Fn(RequestId, &[u8]) + Send + Sync>;

/// Callback for firmware chunk responses; also receives the chunk index
/// parsed from the response topic.
pub type OnFirmwareChunk = Arc<dyn Fn(RequestId, u32, &[u8]) + Send + Sync>;

/// Callback invoked when a request times out or the connection drops.
pub type OnTimeout = Arc<dyn Fn(RequestId) + Send + Sync>;

/// Response callback, tagged by arity.
///
/// The firmware family's callback carries the chunk index; every other
/// family passes the raw payload only.
#[derive(Clone)]
pub enum ResponseHandler {
    /// Payload-only response callback.
    Plain(OnResponse),
    /// Firmware chunk callback with chunk index.
    Chunk(OnFirmwareChunk),
}

impl fmt::Debug for ResponseHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(_) => f.write_str("ResponseHandler::Plain"),
            Self::Chunk(_) => f.write_str("ResponseHandler::Chunk"),
        }
    }
}

/// One outstanding request awaiting its response or timeout.
pub(crate) struct PendingRequest {
    family: RequestFamily,
    id: RequestId,
    submitted_at: u64,
    on_response: Option<ResponseHandler>,
    on_timeout: Option<OnTimeout>,
}

impl PendingRequest {
    /// Consumes the entry and invokes its response callback, if any.
    ///
    /// `chunk` is present for firmware chunk responses only. A mismatch
    /// between handler arity and the presence of a chunk index means the
    /// broker answered on an unexpected topic; the payload is still
    /// delivered where possible.
    pub(crate) fn invoke_response(self, payload: &[u8], chunk: Option<u32>) {
        match (self.on_response, chunk) {
            (Some(ResponseHandler::Plain(on_response)), None) => on_response(self.id, payload),
            (Some(ResponseHandler::Chunk(on_chunk)), Some(chunk)) => {
                on_chunk(self.id, chunk, payload);
            }
            (Some(ResponseHandler::Plain(on_response)), Some(chunk)) => {
                tracing::warn!(
                    id = %self.id,
                    chunk,
                    "chunked response for a plain request handler"
                );
                on_response(self.id, payload);
            }
            (Some(ResponseHandler::Chunk(_)), None) => {
                tracing::warn!(
                    id = %self.id,
                    "response without chunk index for a firmware handler; dropping"
                );
            }
            (None, _) => {}
        }
    }

    /// Consumes the entry and invokes its timeout callback, if any.
    pub(crate) fn invoke_timeout(self) {
        if let Some(on_timeout) = self.on_timeout {
            on_timeout(self.id);
        }
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("family", &self.family)
            .field("id", &self.id)
            .field("submitted_at", &self.submitted_at)
            .finish_non_exhaustive()
    }
}

/// Insertion-ordered table of outstanding requests plus the per-connection
/// id counter.
///
/// All operations are O(n) scans; the table holds the handful of requests a
/// device has in flight, not a server-side workload.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    next_id: u32,
    entries: Vec<PendingRequest>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Generates the next request id, wrapping past `u32::MAX` while
    /// skipping zero and any id still live in the table.
    fn allocate_id(&mut self) -> RequestId {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                continue;
            }
            let id = RequestId(self.next_id);
            if self.entries.iter().all(|entry| entry.id != id) {
                return id;
            }
        }
    }

    /// Registers a new outstanding request and returns its correlation id.
    ///
    /// Without an `id_hint` a fresh id is generated. Firmware chunk
    /// requests pass the id of their first chunk so the whole image shares
    /// one correlation id; re-registering an id whose previous entry has
    /// already completed is fine, a *live* duplicate is rejected.
    ///
    /// If both callbacks are absent the request is fire-and-forget: the id
    /// is returned without inserting anything.
    pub(crate) fn insert(
        &mut self,
        family: RequestFamily,
        id_hint: Option<RequestId>,
        on_response: Option<ResponseHandler>,
        on_timeout: Option<OnTimeout>,
        now: u64,
    ) -> Result<RequestId, ProtocolError> {
        let id = match id_hint {
            Some(id) => id,
            None => self.allocate_id(),
        };

        if on_response.is_none() && on_timeout.is_none() {
            tracing::debug!(id = %id, ?family, "no callbacks; request not tracked");
            return Ok(id);
        }

        if self.entries.iter().any(|entry| entry.id == id) {
            return Err(ProtocolError::DuplicateRequestId(id));
        }

        self.entries.push(PendingRequest {
            family,
            id,
            submitted_at: now,
            on_response,
            on_timeout,
        });
        Ok(id)
    }

    /// Removes and returns the entry with the given id.
    pub(crate) fn take_by_id(&mut self, id: RequestId) -> Option<PendingRequest> {
        let index = self.entries.iter().position(|entry| entry.id == id)?;
        Some(self.entries.remove(index))
    }

    /// Removes and returns the *first* entry of the given family.
    ///
    /// Used only where the wire protocol provides no id in the response
    /// topic (provisioning).
    pub(crate) fn take_by_family(&mut self, family: RequestFamily) -> Option<PendingRequest> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.family == family)?;
        Some(self.entries.remove(index))
    }

    /// Removes every entry whose deadline has passed and returns them in
    /// original insertion order.
    pub(crate) fn drain_expired(&mut self, now: u64) -> Vec<PendingRequest> {
        let (expired, live) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| entry.submitted_at + REQUEST_TIMEOUT_SECS <= now);
        self.entries = live;
        expired
    }

    /// Removes all entries in insertion order. Used on disconnect, where
    /// every outstanding request is flushed with timeout semantics.
    pub(crate) fn drain_all(&mut self) -> Vec<PendingRequest> {
        std::mem::take(&mut self.entries)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn noop_response() -> Option<ResponseHandler> {
        Some(ResponseHandler::Plain(Arc::new(|_, _| {})))
    }

    fn noop_timeout() -> Option<OnTimeout> {
        Some(Arc::new(|_| {}))
    }

    #[test]
    fn request_id_rejects_zero() {
        assert!(RequestId::new(0).is_none());
        assert_eq!(RequestId::new(5).unwrap().value(), 5);
    }

    #[test]
    fn insert_generates_sequential_ids() {
        let mut table = PendingTable::new();
        let a = table
            .insert(RequestFamily::AttributeFetch, None, noop_response(), None, 0)
            .unwrap();
        let b = table
            .insert(RequestFamily::ClientRpc, None, noop_response(), None, 0)
            .unwrap();
        assert_eq!(a.value(), 1);
        assert_eq!(b.value(), 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn insert_without_callbacks_is_not_tracked() {
        let mut table = PendingTable::new();
        let id = table
            .insert(RequestFamily::AttributeFetch, None, None, None, 0)
            .unwrap();
        assert_eq!(id.value(), 1);
        assert_eq!(table.len(), 0);

        // The id is still consumed by the counter.
        let next = table
            .insert(RequestFamily::AttributeFetch, None, noop_response(), None, 0)
            .unwrap();
        assert_eq!(next.value(), 2);
    }

    #[test]
    fn insert_duplicate_live_id_is_rejected() {
        let mut table = PendingTable::new();
        let id = table
            .insert(RequestFamily::FirmwareChunk, None, noop_response(), None, 0)
            .unwrap();
        let err = table
            .insert(
                RequestFamily::FirmwareChunk,
                Some(id),
                noop_response(),
                None,
                0,
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateRequestId(dup) if dup == id));
    }

    #[test]
    fn insert_reuses_hint_after_completion() {
        // One firmware image keeps the same correlation id across chunks.
        let mut table = PendingTable::new();
        let id = table
            .insert(RequestFamily::FirmwareChunk, None, noop_response(), None, 0)
            .unwrap();
        table.take_by_id(id).unwrap();

        let again = table
            .insert(
                RequestFamily::FirmwareChunk,
                Some(id),
                noop_response(),
                None,
                1,
            )
            .unwrap();
        assert_eq!(again, id);
    }

    #[test]
    fn take_by_id_removes_entry() {
        let mut table = PendingTable::new();
        let id = table
            .insert(RequestFamily::ClientRpc, None, noop_response(), None, 0)
            .unwrap();
        let entry = table.take_by_id(id).unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.family, RequestFamily::ClientRpc);
        assert!(table.take_by_id(id).is_none());
    }

    #[test]
    fn take_by_family_returns_first_match() {
        let mut table = PendingTable::new();
        table
            .insert(RequestFamily::AttributeFetch, None, noop_response(), None, 0)
            .unwrap();
        let first = table
            .insert(RequestFamily::Provision, None, noop_response(), None, 0)
            .unwrap();
        let second = table
            .insert(RequestFamily::Provision, None, noop_response(), None, 0)
            .unwrap();

        let taken = table.take_by_family(RequestFamily::Provision).unwrap();
        assert_eq!(taken.id, first);
        let taken = table.take_by_family(RequestFamily::Provision).unwrap();
        assert_eq!(taken.id, second);
        assert!(table.take_by_family(RequestFamily::Provision).is_none());
    }

    #[test]
    fn drain_expired_preserves_insertion_order() {
        let mut table = PendingTable::new();
        let a = table
            .insert(RequestFamily::AttributeFetch, None, None, noop_timeout(), 10)
            .unwrap();
        let b = table
            .insert(RequestFamily::ClientRpc, None, None, noop_timeout(), 12)
            .unwrap();
        let c = table
            .insert(RequestFamily::ClientRpc, None, None, noop_timeout(), 100)
            .unwrap();

        let expired = table.drain_expired(12 + REQUEST_TIMEOUT_SECS);
        let ids: Vec<_> = expired.iter().map(|entry| entry.id).collect();
        assert_eq!(ids, vec![a, b]);
        assert_eq!(table.len(), 1);
        assert!(table.take_by_id(c).is_some());
    }

    #[test]
    fn drain_all_empties_table() {
        let mut table = PendingTable::new();
        table
            .insert(RequestFamily::AttributeFetch, None, noop_response(), None, 0)
            .unwrap();
        table
            .insert(RequestFamily::Provision, None, noop_response(), None, 0)
            .unwrap();
        assert_eq!(table.drain_all().len(), 2);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn id_counter_wraps_skipping_zero() {
        let mut table = PendingTable::new();
        table.next_id = u32::MAX - 1;
        let a = table
            .insert(RequestFamily::ClientRpc, None, noop_response(), None, 0)
            .unwrap();
        let b = table
            .insert(RequestFamily::ClientRpc, None, noop_response(), None, 0)
            .unwrap();
        assert_eq!(a.value(), u32::MAX);
        assert_eq!(b.value(), 1);
    }

    #[test]
    fn id_counter_skips_live_ids_on_wrap() {
        let mut table = PendingTable::new();
        let one = table
            .insert(RequestFamily::ClientRpc, None, noop_response(), None, 0)
            .unwrap();
        assert_eq!(one.value(), 1);

        table.next_id = u32::MAX;
        let next = table
            .insert(RequestFamily::ClientRpc, None, noop_response(), None, 0)
            .unwrap();
        // 1 is still live, so the wrap lands on 2.
        assert_eq!(next.value(), 2);
    }

    #[test]
    fn chunk_handler_receives_chunk_index() {
        let mut table = PendingTable::new();
        let seen = Arc::new(AtomicU32::new(u32::MAX));
        let seen_clone = Arc::clone(&seen);
        let id = table
            .insert(
                RequestFamily::FirmwareChunk,
                None,
                Some(ResponseHandler::Chunk(Arc::new(move |_, chunk, _| {
                    seen_clone.store(chunk, Ordering::SeqCst);
                }))),
                None,
                0,
            )
            .unwrap();

        table.take_by_id(id).unwrap().invoke_response(b"data", Some(3));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
