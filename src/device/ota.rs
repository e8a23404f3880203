// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Chunked firmware download.
//!
//! A firmware image is fetched chunk by chunk: every chunk is its own
//! request/response exchange, but all chunks of one image share a single
//! correlation id, with the chunk index carried in the topic
//! (`v2/fw/request/<id>/chunk/<n>`). The typical driver requests chunk 0,
//! then requests the next chunk from inside the chunk callback until the
//! image is complete.

use std::sync::Arc;

use crate::device::{Device, DeviceInner};
use crate::error::Result;
use crate::protocol::{OnFirmwareChunk, OnTimeout, RequestId};

/// One outstanding chunk request at the helper level.
pub(crate) struct FirmwareRecord {
    id: RequestId,
    on_chunk: Option<OnFirmwareChunk>,
    on_timeout: Option<OnTimeout>,
}

/// Helper-level list of outstanding firmware chunk requests.
#[derive(Default)]
pub(crate) struct FirmwareRegistry {
    records: Vec<FirmwareRecord>,
}

impl FirmwareRegistry {
    fn insert(&mut self, record: FirmwareRecord) {
        self.records.push(record);
    }

    fn take(&mut self, id: RequestId) -> Option<FirmwareRecord> {
        let index = self.records.iter().position(|record| record.id == id)?;
        Some(self.records.remove(index))
    }
}

impl Device {
    /// Requests one chunk of a firmware image.
    ///
    /// Pass `None` as `image_request` for the first chunk and the returned
    /// id for every further chunk of the same image. `chunk_size` is sent
    /// as the request body when present (the platform's chunked-download
    /// contract); the chunk callback receives the chunk index and the raw
    /// chunk bytes.
    ///
    /// # Errors
    ///
    /// Fails with a duplicate-id error while the previous chunk of this
    /// image is still outstanding, otherwise the low-level send errors.
    pub async fn request_firmware_chunk(
        &self,
        image_request: Option<RequestId>,
        chunk: u32,
        chunk_size: Option<usize>,
        on_chunk: Option<OnFirmwareChunk>,
        on_timeout: Option<OnTimeout>,
    ) -> Result<RequestId> {
        let payload = chunk_size.map(|size| size.to_string()).unwrap_or_default();

        let chunk_inner = Arc::downgrade(&self.inner);
        let timeout_inner = Arc::downgrade(&self.inner);
        let id = self
            .inner
            .connection
            .request_firmware_chunk(
                image_request,
                chunk,
                &payload,
                Some(Arc::new(move |id, chunk, payload| {
                    if let Some(inner) = chunk_inner.upgrade() {
                        inner.handle_firmware_chunk(id, chunk, payload);
                    }
                })),
                Some(Arc::new(move |id| {
                    if let Some(inner) = timeout_inner.upgrade() {
                        inner.handle_firmware_timeout(id);
                    }
                })),
            )
            .await?;

        self.inner
            .registries
            .lock()
            .firmware
            .insert(FirmwareRecord {
                id,
                on_chunk,
                on_timeout,
            });
        Ok(id)
    }
}

impl DeviceInner {
    /// Delivers one received firmware chunk to the caller.
    pub(crate) fn handle_firmware_chunk(&self, id: RequestId, chunk: u32, payload: &[u8]) {
        let record = self.registries.lock().firmware.take(id);
        let Some(record) = record else {
            tracing::warn!(id = %id, chunk, "firmware chunk without helper record; dropped");
            return;
        };
        if let Some(on_chunk) = record.on_chunk {
            on_chunk(id, chunk, payload);
        }
    }

    /// Times a firmware chunk request out at the helper level.
    pub(crate) fn handle_firmware_timeout(&self, id: RequestId) {
        let record = self.registries.lock().firmware.take(id);
        let Some(record) = record else {
            tracing::warn!(id = %id, "firmware timeout without helper record");
            return;
        };
        if let Some(on_timeout) = record.on_timeout {
            on_timeout(id);
        }
    }
}
