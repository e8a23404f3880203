// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reassembly of logical messages that arrive split over several MQTT data
//! events.
//!
//! Large payloads (notably firmware chunks) can be delivered by the
//! transport as a sequence of fragments, each carrying its offset into the
//! message and the declared total length. The [`PayloadReassembler`] joins
//! them back into one complete message before topic routing. At most one
//! multi-fragment message is in progress at a time; a fragment stream for a
//! different topic, or a restart at offset zero, discards the unfinished
//! predecessor.

/// One MQTT data event, possibly a fragment of a larger logical message.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DataEvent<'a> {
    /// Topic associated with this event.
    pub topic: &'a str,
    /// Fragment bytes.
    pub payload: &'a [u8],
    /// Offset of this fragment within the logical message.
    pub offset: usize,
    /// Declared total length of the logical message.
    pub total_len: usize,
}

/// Buffer for the single in-progress multi-fragment message.
#[derive(Debug)]
struct ReassemblyBuffer {
    topic: String,
    data: Vec<u8>,
    total_len: usize,
}

/// Joins fragmented MQTT data events into complete messages.
#[derive(Debug, Default)]
pub(crate) struct PayloadReassembler {
    active: Option<ReassemblyBuffer>,
}

impl PayloadReassembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Discards any in-progress message. Called on disconnect.
    pub(crate) fn reset(&mut self) {
        if let Some(buffer) = self.active.take() {
            tracing::debug!(
                topic = %buffer.topic,
                received = buffer.data.len(),
                expected = buffer.total_len,
                "discarding incomplete reassembly"
            );
        }
    }

    /// Feeds one data event and returns the completed message, if this
    /// event finished one.
    ///
    /// Single-fragment messages pass straight through. Out-of-contract
    /// fragments (wrong topic, gap in offsets, overrun past the declared
    /// total) abort the in-progress message and are dropped.
    pub(crate) fn push(&mut self, event: DataEvent<'_>) -> Option<(String, Vec<u8>)> {
        if event.offset == 0 && event.total_len == event.payload.len() {
            // Complete in a single event; the buffer is not involved.
            return Some((event.topic.to_owned(), event.payload.to_vec()));
        }

        if event.offset == 0 {
            if self.active.is_some() {
                tracing::warn!(
                    topic = %event.topic,
                    "new fragmented message started; discarding incomplete predecessor"
                );
            }
            self.active = Some(ReassemblyBuffer {
                topic: event.topic.to_owned(),
                data: {
                    let mut data = Vec::with_capacity(event.total_len);
                    data.extend_from_slice(event.payload);
                    data
                },
                total_len: event.total_len,
            });
            return None;
        }

        let Some(buffer) = self.active.as_mut() else {
            tracing::warn!(
                topic = %event.topic,
                offset = event.offset,
                "continuation fragment with no message in progress; dropping"
            );
            return None;
        };

        if buffer.topic != event.topic {
            tracing::warn!(
                expected = %buffer.topic,
                got = %event.topic,
                "fragment for a different topic during reassembly; dropping"
            );
            return None;
        }

        if event.offset != buffer.data.len()
            || event.offset + event.payload.len() > buffer.total_len
        {
            tracing::warn!(
                topic = %event.topic,
                offset = event.offset,
                have = buffer.data.len(),
                total = buffer.total_len,
                "fragment out of sequence; aborting reassembly"
            );
            self.active = None;
            return None;
        }

        buffer.data.extend_from_slice(event.payload);
        if buffer.data.len() == buffer.total_len {
            let buffer = self.active.take().expect("buffer checked above");
            return Some((buffer.topic, buffer.data));
        }
        None
    }
}
