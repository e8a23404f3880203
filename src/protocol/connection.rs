// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Low-level ThingsBoard MQTT connection.
//!
//! [`MqttConnection`] multiplexes typed request/response conversations over
//! one shared MQTT session. Outbound requests get a correlation id and a
//! pending-table entry; inbound messages flow through the payload
//! reassembler, are classified by topic, and either complete their pending
//! request or reach a broadcast handler (shared-attribute pushes,
//! server-side RPC requests). A periodic [`check_timeout`] sweep reclaims
//! requests the broker never answered.
//!
//! # Threading
//!
//! The rumqttc event loop runs in a spawned task; requests may be issued
//! from any task or thread. The pending table sits behind a single mutex
//! with short critical sections, and no user callback is ever invoked while
//! a lock is held, so callbacks are free to issue new requests.
//!
//! [`check_timeout`]: MqttConnection::check_timeout

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Packet, QoS};
use tokio::task::JoinHandle;

use crate::config::{Credentials, TransportConfig};
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::pending::{
    OnFirmwareChunk, OnResponse, OnTimeout, PendingTable, REQUEST_TIMEOUT_SECS, RequestFamily,
    RequestId, ResponseHandler,
};
use crate::protocol::reassembly::{DataEvent, PayloadReassembler};
use crate::protocol::topics::{self, Route};
use crate::protocol::transport;

/// Global counter for generating unique client IDs.
static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Delay before rumqttc retries after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Capacity of the internal rumqttc request channel.
const MQTT_CHANNEL_CAPACITY: usize = 10;

/// State of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// No session, or the session was torn down.
    Disconnected = 0,
    /// Session started, waiting for the broker's connect-ack.
    Connecting = 1,
    /// Connect-ack received and inbound topics subscribed.
    Connected = 2,
}

impl ConnectionState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            2 => Self::Connected,
            1 => Self::Connecting,
            _ => Self::Disconnected,
        }
    }
}

/// Callback invoked once the session is connected and subscribed.
pub type OnConnected = Arc<dyn Fn() + Send + Sync>;

/// Callback invoked when the session drops, after pending requests were
/// flushed as timeouts.
pub type OnDisconnected = Arc<dyn Fn() + Send + Sync>;

/// Broadcast handler for unsolicited shared-attribute pushes.
pub type OnSharedAttributes = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Broadcast handler for unsolicited server-side RPC requests.
pub type OnServerRpcRequest = Arc<dyn Fn(RequestId, &[u8]) + Send + Sync>;

/// Connection-level callbacks handed to [`MqttConnection::connect`].
///
/// All fields are optional; missing broadcast handlers cause the matching
/// inbound messages to be logged and dropped.
#[derive(Clone, Default)]
pub struct ConnectionEvents {
    /// Fired after the connect-ack and the six inbound subscriptions.
    pub on_connected: Option<OnConnected>,
    /// Fired after a disconnect flush.
    pub on_disconnected: Option<OnDisconnected>,
    /// Receives shared-attribute push payloads.
    pub on_shared_attributes: Option<OnSharedAttributes>,
    /// Receives server-side RPC requests with their correlation id.
    pub on_server_rpc_request: Option<OnServerRpcRequest>,
}

/// One live MQTT session.
struct Session {
    client: AsyncClient,
    event_task: JoinHandle<()>,
}

/// A connection to the ThingsBoard MQTT device API.
///
/// The connection object outlives individual sessions: after
/// [`disconnect`](Self::disconnect) it can connect again, and the request id
/// counter keeps counting across sessions.
pub struct MqttConnection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    state: AtomicU8,
    pending: Mutex<PendingTable>,
    reassembler: Mutex<PayloadReassembler>,
    session: Mutex<Option<Session>>,
    events: Mutex<ConnectionEvents>,
    last_check: AtomicU64,
    log_rxtx: AtomicBool,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

impl MqttConnection {
    /// Creates a disconnected connection object.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                pending: Mutex::new(PendingTable::new()),
                reassembler: Mutex::new(PayloadReassembler::new()),
                session: Mutex::new(None),
                events: Mutex::new(ConnectionEvents::default()),
                last_check: AtomicU64::new(unix_now()),
                log_rxtx: AtomicBool::new(false),
            }),
        }
    }

    /// Starts a session against the configured broker.
    ///
    /// Returns as soon as the session is started; the state moves to
    /// [`ConnectionState::Connected`] and `on_connected` fires when the
    /// broker acknowledges the connection and the inbound topics are
    /// subscribed. Connection errors after that are handled by
    /// reconnecting, with outstanding requests flushed as timeouts on every
    /// drop.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a session is
    /// already active.
    pub fn connect(&self, config: &TransportConfig, events: ConnectionEvents) -> Result<()> {
        config.validate().map_err(Error::Config)?;
        if self.inner.session.lock().is_some() {
            return Err(Error::InvalidArgument(
                "connection is already started".to_owned(),
            ));
        }

        let client_id = match &config.credentials {
            Credentials::BasicMqtt {
                client_id: Some(id),
                ..
            } => id.clone(),
            _ => {
                let counter = CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
                format!("thingsr_{}_{}", std::process::id(), counter)
            }
        };
        let options = transport::mqtt_options(config, &client_id)?;

        let (client, event_loop) = AsyncClient::new(options, MQTT_CHANNEL_CAPACITY);
        *self.inner.events.lock() = events;
        self.inner
            .log_rxtx
            .store(config.log_rxtx_package, Ordering::Relaxed);
        self.inner.set_state(ConnectionState::Connecting);

        let event_task = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            Arc::clone(&self.inner),
        ));
        *self.inner.session.lock() = Some(Session { client, event_task });

        tracing::info!(host = %config.host, port = config.effective_port(), "MQTT session started");
        Ok(())
    }

    /// Tears the session down.
    ///
    /// Every outstanding request is flushed with timeout semantics (in
    /// insertion order), then `on_disconnected` fires. The request id
    /// counter is not reset.
    pub async fn disconnect(&self) {
        let session = self.inner.session.lock().take();
        let Some(session) = session else {
            tracing::warn!("disconnect called without an active session");
            return;
        };

        session.event_task.abort();
        if let Err(e) = session.client.disconnect().await {
            tracing::debug!(error = %e, "MQTT disconnect request failed");
        }
        self.inner.flush_disconnected();
        *self.inner.events.lock() = ConnectionEvents::default();
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Returns whether the session is connected and subscribed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Returns whether a session is waiting for its connect-ack.
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    /// Returns whether no session is live.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    /// Sweeps expired pending requests and fires their timeout callbacks.
    ///
    /// Call this periodically from a task loop. Calls are coalesced: a
    /// sweep only runs when at least [`REQUEST_TIMEOUT_SECS`] + 2 seconds
    /// have passed since the previous one, so a tight polling loop does not
    /// rescan the table every iteration.
    pub fn check_timeout(&self) {
        self.inner.check_timeout_at(unix_now());
    }

    /// Returns the number of requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Publishes telemetry time-series data. Fire-and-forget.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without a live session, or the MQTT
    /// error if the publish is rejected.
    pub async fn publish_telemetry(&self, payload: &str) -> Result<()> {
        self.publish(topics::TELEMETRY_TOPIC, payload).await
    }

    /// Publishes client-side attribute values. Fire-and-forget.
    ///
    /// # Errors
    ///
    /// See [`publish_telemetry`](Self::publish_telemetry).
    pub async fn publish_client_attributes(&self, payload: &str) -> Result<()> {
        self.publish(topics::ATTRIBUTES_TOPIC, payload).await
    }

    /// Publishes a device claiming message. Fire-and-forget.
    ///
    /// # Errors
    ///
    /// See [`publish_telemetry`](Self::publish_telemetry).
    pub async fn publish_claim(&self, payload: &str) -> Result<()> {
        self.publish(topics::CLAIM_TOPIC, payload).await
    }

    /// Publishes the reply to a server-side RPC request. Fire-and-forget.
    ///
    /// # Errors
    ///
    /// See [`publish_telemetry`](Self::publish_telemetry).
    pub async fn respond_server_rpc(&self, id: RequestId, payload: &str) -> Result<()> {
        self.publish(&topics::rpc_response_topic(id), payload).await
    }

    /// Sends an attribute fetch request and returns its correlation id.
    ///
    /// `payload` is the prepared request body
    /// (`{"clientKeys":"...","sharedKeys":"..."}`). With both callbacks
    /// absent the request is fire-and-forget and never tracked.
    ///
    /// # Errors
    ///
    /// Returns the MQTT error if the publish is rejected; the pending entry
    /// stays behind in that case and surfaces as a timeout.
    pub async fn request_attributes(
        &self,
        payload: &str,
        on_response: Option<OnResponse>,
        on_timeout: Option<OnTimeout>,
    ) -> Result<RequestId> {
        self.send_request(
            RequestFamily::AttributeFetch,
            None,
            payload,
            on_response.map(ResponseHandler::Plain),
            on_timeout,
            topics::attributes_request_topic,
        )
        .await
    }

    /// Sends a client-side RPC request and returns its correlation id.
    ///
    /// # Errors
    ///
    /// See [`request_attributes`](Self::request_attributes).
    pub async fn request_client_rpc(
        &self,
        payload: &str,
        on_response: Option<OnResponse>,
        on_timeout: Option<OnTimeout>,
    ) -> Result<RequestId> {
        self.send_request(
            RequestFamily::ClientRpc,
            None,
            payload,
            on_response.map(ResponseHandler::Plain),
            on_timeout,
            topics::rpc_request_topic,
        )
        .await
    }

    /// Requests one firmware chunk and returns the correlation id.
    ///
    /// All chunks of one image share a correlation id: pass `None` for the
    /// first chunk and the returned id for every further one. The chunk
    /// index travels in the topic and is echoed to the chunk callback.
    ///
    /// # Errors
    ///
    /// Additionally to [`request_attributes`](Self::request_attributes),
    /// fails with a duplicate-id error if the previous chunk with this id
    /// is still outstanding.
    pub async fn request_firmware_chunk(
        &self,
        id_hint: Option<RequestId>,
        chunk: u32,
        payload: &str,
        on_chunk: Option<OnFirmwareChunk>,
        on_timeout: Option<OnTimeout>,
    ) -> Result<RequestId> {
        self.send_request(
            RequestFamily::FirmwareChunk,
            id_hint,
            payload,
            on_chunk.map(ResponseHandler::Chunk),
            on_timeout,
            move |id| topics::firmware_request_topic(id, chunk),
        )
        .await
    }

    /// Sends a device provisioning request and returns its correlation id.
    ///
    /// The provisioning response topic carries no id; the response is
    /// matched to the oldest pending provisioning request instead.
    ///
    /// # Errors
    ///
    /// See [`request_attributes`](Self::request_attributes).
    pub async fn request_provision(
        &self,
        payload: &str,
        on_response: Option<OnResponse>,
        on_timeout: Option<OnTimeout>,
    ) -> Result<RequestId> {
        self.send_request(
            RequestFamily::Provision,
            None,
            payload,
            on_response.map(ResponseHandler::Plain),
            on_timeout,
            |_| topics::PROVISION_REQUEST_TOPIC.to_owned(),
        )
        .await
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let client = self.inner.live_client().ok_or(Error::NotConnected)?;
        if self.inner.log_rxtx.load(Ordering::Relaxed) {
            tracing::info!(topic, payload, "[Tx]");
        }
        client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .await
            .map_err(|e| Error::Protocol(ProtocolError::Mqtt(e)))
    }

    async fn send_request(
        &self,
        family: RequestFamily,
        id_hint: Option<RequestId>,
        payload: &str,
        on_response: Option<ResponseHandler>,
        on_timeout: Option<OnTimeout>,
        topic_for: impl FnOnce(RequestId) -> String,
    ) -> Result<RequestId> {
        let id = self
            .inner
            .register_request(family, id_hint, on_response, on_timeout)
            .map_err(Error::Protocol)?;

        let Some(client) = self.inner.live_client() else {
            tracing::debug!(id = %id, ?family, "not connected; request left to time out");
            return Ok(id);
        };

        let topic = topic_for(id);
        if self.inner.log_rxtx.load(Ordering::Relaxed) {
            tracing::info!(topic = %topic, payload, "[Tx]");
        }
        if let Err(e) = client
            .publish(&topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .await
        {
            // The pending entry stays behind and surfaces as a timeout, so
            // the caller's callbacks still fire exactly once.
            tracing::warn!(id = %id, error = %e, "request publish failed");
            return Err(Error::Protocol(ProtocolError::Mqtt(e)));
        }
        Ok(id)
    }
}

impl MqttConnection {
    /// Engine internals, shared with the helper layer.
    pub(crate) fn engine(&self) -> &Arc<ConnectionInner> {
        &self.inner
    }
}

impl Default for MqttConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        if let Some(session) = self.inner.session.lock().take() {
            session.event_task.abort();
        }
    }
}

impl std::fmt::Debug for MqttConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConnection")
            .field("state", &self.state())
            .field("pending", &self.inner.pending.lock().len())
            .finish()
    }
}

impl ConnectionInner {
    /// Replaces the connection-level callbacks. Used by the helper layer to
    /// wire its broadcast handling before a session exists.
    pub(crate) fn set_events(&self, events: ConnectionEvents) {
        *self.events.lock() = events;
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns a publish handle while a session is live and not torn down.
    fn live_client(&self) -> Option<AsyncClient> {
        if self.state() == ConnectionState::Disconnected {
            return None;
        }
        self.session
            .lock()
            .as_ref()
            .map(|session| session.client.clone())
    }

    /// Registers a pending request without publishing. Shared by the send
    /// path and safe to call from inside a response callback.
    pub(crate) fn register_request(
        &self,
        family: RequestFamily,
        id_hint: Option<RequestId>,
        on_response: Option<ResponseHandler>,
        on_timeout: Option<OnTimeout>,
    ) -> std::result::Result<RequestId, ProtocolError> {
        self.pending
            .lock()
            .insert(family, id_hint, on_response, on_timeout, unix_now())
    }

    /// Feeds one transport data event through the reassembler and, when it
    /// completes a message, dispatches it.
    pub(crate) fn ingest(&self, event: DataEvent<'_>) {
        let completed = self.reassembler.lock().push(event);
        if let Some((topic, payload)) = completed {
            self.dispatch(&topic, &payload);
        }
    }

    /// Routes one complete inbound message.
    pub(crate) fn dispatch(&self, topic: &str, payload: &[u8]) {
        if self.log_rxtx.load(Ordering::Relaxed) {
            tracing::info!(topic, len = payload.len(), "[Rx]");
        }

        let Some(route) = topics::classify(topic) else {
            tracing::warn!(topic, len = payload.len(), "unroutable message dropped");
            return;
        };

        match route {
            Route::AttributeResponse { request_id } => {
                self.complete_request(request_id, None, payload, "attribute fetch");
            }
            Route::ClientRpcResponse { request_id } => {
                self.complete_request(request_id, None, payload, "client-side RPC");
            }
            Route::FirmwareChunk { request_id, chunk } => {
                self.complete_request(request_id, Some(chunk), payload, "firmware chunk");
            }
            Route::ProvisionResponse => {
                let entry = self.pending.lock().take_by_family(RequestFamily::Provision);
                match entry {
                    Some(entry) => entry.invoke_response(payload, None),
                    None => {
                        tracing::warn!("provisioning response without a pending request; dropped");
                    }
                }
            }
            Route::SharedAttributes => {
                let handler = self.events.lock().on_shared_attributes.clone();
                match handler {
                    Some(handler) => handler(payload),
                    None => tracing::trace!("shared-attribute push without a handler"),
                }
            }
            Route::ServerRpcRequest { request_id } => {
                let handler = self.events.lock().on_server_rpc_request.clone();
                match handler {
                    Some(handler) => handler(request_id, payload),
                    None => {
                        tracing::warn!(id = %request_id, "server RPC request without a handler");
                    }
                }
            }
        }
    }

    /// Strips the pending entry for a response and invokes its callback
    /// outside the table lock.
    fn complete_request(&self, id: RequestId, chunk: Option<u32>, payload: &[u8], kind: &str) {
        let entry = self.pending.lock().take_by_id(id);
        match entry {
            Some(entry) => entry.invoke_response(payload, chunk),
            None => {
                // Stale or duplicated response; not fatal.
                tracing::warn!(id = %id, kind, "no pending request for response; dropped");
            }
        }
    }

    /// Coalesced timeout sweep. Extracted from [`MqttConnection::check_timeout`]
    /// with an explicit clock for tests.
    pub(crate) fn check_timeout_at(&self, now: u64) {
        // Too early; a tight polling loop must not rescan every iteration.
        if now < self.last_check.load(Ordering::Acquire) + REQUEST_TIMEOUT_SECS + 2 {
            return;
        }
        self.last_check.store(now, Ordering::Release);

        let expired = self.pending.lock().drain_expired(now);
        if expired.is_empty() {
            return;
        }
        tracing::debug!(count = expired.len(), "expiring pending requests");
        for request in expired {
            request.invoke_timeout();
        }
    }

    /// Flushes the connection after a session drop: every pending request
    /// times out in insertion order, then `on_disconnected` fires.
    pub(crate) fn flush_disconnected(&self) {
        let prior = ConnectionState::from_u8(
            self.state
                .swap(ConnectionState::Disconnected as u8, Ordering::AcqRel),
        );
        if prior == ConnectionState::Disconnected {
            return;
        }

        self.reassembler.lock().reset();
        let flushed = self.pending.lock().drain_all();
        if !flushed.is_empty() {
            tracing::debug!(count = flushed.len(), "flushing pending requests as timeouts");
        }
        for request in flushed {
            request.invoke_timeout();
        }

        let on_disconnected = self.events.lock().on_disconnected.clone();
        if let Some(on_disconnected) = on_disconnected {
            on_disconnected();
        }
    }

    /// Completes the MQTT connect: subscribes the six inbound topics, moves
    /// to `Connected`, then fires `on_connected`.
    async fn on_broker_connected(&self, client: &AsyncClient) {
        for filter in [
            topics::ATTRIBUTES_TOPIC,
            topics::ATTRIBUTES_RESPONSE_SUBSCRIBE,
            topics::RPC_REQUEST_SUBSCRIBE,
            topics::RPC_RESPONSE_SUBSCRIBE,
            topics::FIRMWARE_RESPONSE_SUBSCRIBE,
            topics::PROVISION_RESPONSE_TOPIC,
        ] {
            match client.subscribe(filter, QoS::AtMostOnce).await {
                Ok(()) => tracing::debug!(topic = filter, "subscribed"),
                Err(e) => tracing::warn!(topic = filter, error = %e, "subscribe failed"),
            }
        }

        self.set_state(ConnectionState::Connected);
        let on_connected = self.events.lock().on_connected.clone();
        if let Some(on_connected) = on_connected {
            on_connected();
        }
    }
}

/// Drives the rumqttc event loop for one session.
async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    inner: Arc<ConnectionInner>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                if connack.code != ConnectReturnCode::Success {
                    tracing::warn!(code = ?connack.code, "broker rejected the connection");
                    continue;
                }
                tracing::debug!("MQTT connected");
                inner.on_broker_connected(&client).await;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                inner.ingest(DataEvent {
                    topic: &publish.topic,
                    payload: &publish.payload,
                    offset: 0,
                    total_len: publish.payload.len(),
                });
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                tracing::trace!(?suback, "MQTT subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::info!("MQTT broker disconnected");
                inner.flush_disconnected();
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    delay_secs = RECONNECT_DELAY.as_secs(),
                    "MQTT event loop error; reconnecting"
                );
                inner.flush_disconnected();
                tokio::time::sleep(RECONNECT_DELAY).await;
                inner.set_state(ConnectionState::Connecting);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicU32;

    fn counting_response(
        hits: &Arc<AtomicU32>,
        last_id: &Arc<AtomicU32>,
    ) -> OnResponse {
        let hits = Arc::clone(hits);
        let last_id = Arc::clone(last_id);
        Arc::new(move |id, _payload| {
            hits.fetch_add(1, Ordering::SeqCst);
            last_id.store(id.value(), Ordering::SeqCst);
        })
    }

    #[test]
    fn new_connection_is_disconnected() {
        let connection = MqttConnection::new();
        assert!(connection.is_disconnected());
        assert!(!connection.is_connected());
        assert!(!connection.is_connecting());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connection.pending_requests(), 0);
    }

    #[tokio::test]
    async fn attribute_fetch_happy_path() {
        let connection = MqttConnection::new();
        let hits = Arc::new(AtomicU32::new(0));
        let last_id = Arc::new(AtomicU32::new(0));

        let id = connection
            .request_attributes(
                r#"{"clientKeys":"temp","sharedKeys":"fwVersion"}"#,
                Some(counting_response(&hits, &last_id)),
                None,
            )
            .await
            .unwrap();
        assert_eq!(id.value(), 1);
        assert_eq!(connection.pending_requests(), 1);

        connection.inner.dispatch(
            "v1/devices/me/attributes/response/1",
            br#"{"client":{"temp":21},"shared":{"fwVersion":"1.0"}}"#,
        );

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(last_id.load(Ordering::SeqCst), 1);
        assert_eq!(connection.pending_requests(), 0);

        // A duplicated response finds nothing and is dropped.
        connection
            .inner
            .dispatch("v1/devices/me/attributes/response/1", b"{}");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_sweep_is_coalesced_and_fires_once() {
        let connection = MqttConnection::new();
        let timeouts = Arc::new(AtomicU32::new(0));
        let timeouts_clone = Arc::clone(&timeouts);

        let start = unix_now();
        connection
            .request_attributes(
                r#"{"clientKeys":"temp"}"#,
                None,
                Some(Arc::new(move |_| {
                    timeouts_clone.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .await
            .unwrap();

        // Within the coalescing window nothing happens.
        connection.inner.check_timeout_at(start + 5);
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(connection.pending_requests(), 1);

        connection
            .inner
            .check_timeout_at(start + REQUEST_TIMEOUT_SECS + 2);
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(connection.pending_requests(), 0);

        // Immediately after a sweep the next call performs no work.
        connection
            .inner
            .check_timeout_at(start + REQUEST_TIMEOUT_SECS + 3);
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn firmware_chunks_reassemble_into_one_response() {
        let connection = MqttConnection::new();
        let seen = Arc::new(PlMutex::new(None::<(u32, u32, usize)>));
        let seen_clone = Arc::clone(&seen);

        let id = connection
            .request_firmware_chunk(
                None,
                0,
                "",
                Some(Arc::new(move |id, chunk, payload| {
                    *seen_clone.lock() = Some((id.value(), chunk, payload.len()));
                })),
                None,
            )
            .await
            .unwrap();

        let topic = format!("v2/fw/response/{id}/chunk/0");
        let fragment = vec![0xAB_u8; 4096];
        for offset in [0_usize, 4096, 8192] {
            connection.inner.ingest(DataEvent {
                topic: &topic,
                payload: &fragment,
                offset,
                total_len: 12288,
            });
        }

        assert_eq!(*seen.lock(), Some((id.value(), 0, 12288)));
        assert_eq!(connection.pending_requests(), 0);
    }

    #[tokio::test]
    async fn firmware_id_reuse_requires_completion() {
        let connection = MqttConnection::new();
        let id = connection
            .request_firmware_chunk(None, 0, "", Some(Arc::new(|_, _, _| {})), None)
            .await
            .unwrap();

        // The previous chunk is still outstanding.
        let err = connection
            .request_firmware_chunk(Some(id), 1, "", Some(Arc::new(|_, _, _| {})), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::DuplicateRequestId(dup)) if dup == id
        ));

        connection
            .inner
            .dispatch(&format!("v2/fw/response/{id}/chunk/0"), b"chunk");
        let again = connection
            .request_firmware_chunk(Some(id), 1, "", Some(Arc::new(|_, _, _| {})), None)
            .await
            .unwrap();
        assert_eq!(again, id);
    }

    #[tokio::test]
    async fn provision_response_is_matched_by_family() {
        let connection = MqttConnection::new();
        let hits = Arc::new(AtomicU32::new(0));
        let last_id = Arc::new(AtomicU32::new(0));

        let id = connection
            .request_provision(
                r#"{"deviceName":"dev-01"}"#,
                Some(counting_response(&hits, &last_id)),
                None,
            )
            .await
            .unwrap();

        connection
            .inner
            .dispatch("/provision/response", br#"{"status":"SUCCESS"}"#);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(last_id.load(Ordering::SeqCst), id.value());
        assert_eq!(connection.pending_requests(), 0);
    }

    #[tokio::test]
    async fn disconnect_flush_preserves_order_and_fires_last() {
        let connection = MqttConnection::new();
        let journal = Arc::new(PlMutex::new(Vec::<String>::new()));

        *connection.inner.events.lock() = ConnectionEvents {
            on_disconnected: Some({
                let journal = Arc::clone(&journal);
                Arc::new(move || journal.lock().push("disconnected".to_owned()))
            }),
            ..ConnectionEvents::default()
        };
        connection.inner.set_state(ConnectionState::Connected);

        for _ in 0..2 {
            let journal = Arc::clone(&journal);
            connection
                .request_client_rpc(
                    r#"{"method":"ping"}"#,
                    None,
                    Some(Arc::new(move |id| {
                        journal.lock().push(format!("timeout:{id}"));
                    })),
                )
                .await
                .unwrap();
        }

        connection.inner.flush_disconnected();

        assert_eq!(
            *journal.lock(),
            vec!["timeout:1", "timeout:2", "disconnected"]
        );
        assert_eq!(connection.pending_requests(), 0);
        assert!(connection.is_disconnected());

        // A second flush is a no-op.
        connection.inner.flush_disconnected();
        assert_eq!(journal.lock().len(), 3);
    }

    #[tokio::test]
    async fn response_callback_can_issue_new_requests() {
        let connection = MqttConnection::new();
        let inner = Arc::clone(&connection.inner);
        let nested_id = Arc::new(AtomicU32::new(0));
        let nested_id_clone = Arc::clone(&nested_id);

        connection
            .request_client_rpc(
                r#"{"method":"getTime"}"#,
                Some(Arc::new(move |_, _| {
                    // Re-enter the engine from inside the callback; no lock
                    // is held here, so this must not deadlock.
                    let id = inner
                        .register_request(
                            RequestFamily::ClientRpc,
                            None,
                            Some(ResponseHandler::Plain(Arc::new(|_, _| {}))),
                            None,
                        )
                        .unwrap();
                    nested_id_clone.store(id.value(), Ordering::SeqCst);
                })),
                None,
            )
            .await
            .unwrap();

        connection
            .inner
            .dispatch("v1/devices/me/rpc/response/1", br#"{"time":0}"#);

        assert_eq!(nested_id.load(Ordering::SeqCst), 2);
        assert_eq!(connection.pending_requests(), 1);

        connection
            .inner
            .dispatch("v1/devices/me/rpc/response/2", b"{}");
        assert_eq!(connection.pending_requests(), 0);
    }

    #[tokio::test]
    async fn broadcast_handlers_receive_unsolicited_messages() {
        let connection = MqttConnection::new();
        let shared = Arc::new(AtomicU32::new(0));
        let rpc_id = Arc::new(AtomicU32::new(0));

        *connection.inner.events.lock() = ConnectionEvents {
            on_shared_attributes: Some({
                let shared = Arc::clone(&shared);
                Arc::new(move |_| {
                    shared.fetch_add(1, Ordering::SeqCst);
                })
            }),
            on_server_rpc_request: Some({
                let rpc_id = Arc::clone(&rpc_id);
                Arc::new(move |id, _| {
                    rpc_id.store(id.value(), Ordering::SeqCst);
                })
            }),
            ..ConnectionEvents::default()
        };

        connection
            .inner
            .dispatch("v1/devices/me/attributes", br#"{"fwVersion":"1.1"}"#);
        connection
            .inner
            .dispatch("v1/devices/me/rpc/request/9", br#"{"method":"reboot"}"#);

        assert_eq!(shared.load(Ordering::SeqCst), 1);
        assert_eq!(rpc_id.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn fire_and_forget_publish_requires_session() {
        let connection = MqttConnection::new();
        let err = connection
            .publish_telemetry(r#"{"temp":21}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn unroutable_messages_are_dropped() {
        let connection = MqttConnection::new();
        connection.inner.dispatch("some/random/topic", b"payload");
        connection
            .inner
            .dispatch("v1/devices/me/attributes/response/banana", b"{}");
        assert_eq!(connection.pending_requests(), 0);
    }
}
