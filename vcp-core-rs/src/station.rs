//! Station connection
//!
//! One simulated charge point speaking OCPP-J over a WebSocket. Handles:
//! - Connection with the revision's subprotocol and optional Basic auth
//! - Request/response correlation through the outbox
//! - Dispatch of inbound frames to the revision's catalog, in arrival order
//! - Heartbeat maintenance
//!
//! Frames are processed by a single reader task and written by a single
//! writer task, so handlers never run concurrently for one station.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::future::{BoxFuture, Shared};
use futures_util::{FutureExt, SinkExt, StreamExt};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header, HeaderValue},
        Message,
    },
};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, ConfigStore};
use crate::ocpp::{Call, CallError, CallResult, ErrorCode, OcppError, OcppMessage, Outbox, Revision};
use crate::signed_meter::SignError;
use crate::transaction::TransactionBook;

const EVENT_CAPACITY: usize = 32;

/// Longest heartbeat period the timer accepts; larger CSMS values are clamped
pub const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum StationError {
    #[error("station is not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("WebSocket error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("invalid handshake header: {0}")]
    InvalidHeader(String),

    #[error("action {action} is not defined for {revision}")]
    UnknownAction { revision: Revision, action: String },

    #[error("payload of {action} violates its schema: {reason}")]
    SchemaViolation { action: String, reason: String },

    #[error("no outstanding request with message id {0}")]
    UnknownMessageId(String),

    #[error(transparent)]
    Ocpp(#[from] OcppError),

    #[error(transparent)]
    Sign(#[from] SignError),
}

/// Notifications a station publishes to its observers
#[derive(Debug, Clone, PartialEq)]
pub enum StationEvent {
    Connected,
    Disconnected {
        code: Option<u16>,
        reason: String,
        /// True when the close followed a call to [`Station::close`]
        expected: bool,
    },
    BootAccepted { interval_secs: u64 },
}

/// Work item for the writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Frame(String),
    Close,
}

/// Parameters a station is created with
#[derive(Debug, Clone)]
pub struct StationOptions {
    pub id: String,
    pub endpoint: String,
    pub revision: Revision,
    pub password: Option<String>,
    pub connectors: Vec<u32>,
}

impl StationOptions {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>, revision: Revision) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            revision,
            password: None,
            connectors: vec![1],
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_connectors(mut self, connectors: Vec<u32>) -> Self {
        self.connectors = connectors;
        self
    }
}

#[derive(Debug, Clone)]
struct Endpoint {
    url: String,
    password: Option<String>,
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<(), String>>>;

/// A single virtual charge point and its WebSocket connection
pub struct Station {
    id: String,
    revision: Revision,
    catalog: &'static Catalog,
    endpoint: Mutex<Endpoint>,
    writer: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
    pending_connect: Mutex<Option<ConnectAttempt>>,
    finishing: AtomicBool,
    generation: AtomicU64,
    outbox: Mutex<Outbox>,
    transactions: Mutex<TransactionBook>,
    settings: Mutex<ConfigStore>,
    connectors: Vec<u32>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<StationEvent>,
}

impl Station {
    pub fn new(options: StationOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            catalog: Catalog::for_revision(options.revision),
            settings: Mutex::new(ConfigStore::new(options.connectors.len())),
            connectors: options.connectors,
            id: options.id,
            revision: options.revision,
            endpoint: Mutex::new(Endpoint { url: options.endpoint, password: options.password }),
            writer: Mutex::new(None),
            pending_connect: Mutex::new(None),
            finishing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            outbox: Mutex::new(Outbox::new()),
            transactions: Mutex::new(TransactionBook::new()),
            heartbeat: Mutex::new(None),
            reader: Mutex::new(None),
            events,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn catalog(&self) -> &'static Catalog {
        self.catalog
    }

    pub fn transactions(&self) -> MutexGuard<'_, TransactionBook> {
        self.transactions.lock()
    }

    pub fn settings(&self) -> MutexGuard<'_, ConfigStore> {
        self.settings.lock()
    }

    /// Configured physical connector ids, in configuration order
    pub fn connectors(&self) -> &[u32] {
        &self.connectors
    }

    /// Requests still waiting for a CALLRESULT or CALLERROR
    pub fn pending_requests(&self) -> usize {
        self.outbox.lock().len()
    }

    pub fn is_connected(&self) -> bool {
        self.writer.lock().is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: StationEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Endpoint used by the next connect
    pub fn set_endpoint(&self, url: impl Into<String>) {
        self.endpoint.lock().url = url.into();
    }

    /// Credential used by the next connect
    pub fn set_password(&self, password: Option<String>) {
        self.endpoint.lock().password = password;
    }

    /// Open the connection. Returns at once when already open; concurrent
    /// callers share one in-flight attempt.
    pub async fn connect(self: &Arc<Self>) -> Result<(), StationError> {
        if self.is_connected() {
            return Ok(());
        }

        let attempt = {
            let mut pending = self.pending_connect.lock();
            match pending.as_ref() {
                Some(attempt) => attempt.clone(),
                None => {
                    let station = Arc::clone(self);
                    let attempt = async move {
                        let outcome = station.open().await.map_err(|e| e.to_string());
                        *station.pending_connect.lock() = None;
                        outcome
                    }
                    .boxed()
                    .shared();
                    *pending = Some(attempt.clone());
                    attempt
                }
            }
        };

        attempt.await.map_err(StationError::ConnectFailed)
    }

    async fn open(self: &Arc<Self>) -> Result<(), StationError> {
        let endpoint = self.endpoint.lock().clone();
        let url = build_station_url(&endpoint.url, &self.id);

        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(self.revision.subprotocol()),
        );
        if let Some(password) = &endpoint.password {
            let credential = BASE64.encode(format!("{}:{}", self.id, password));
            let value = HeaderValue::from_str(&format!("Basic {}", credential))
                .map_err(|e| StationError::InvalidHeader(e.to_string()))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        info!(station = %self.id, url = %url, revision = %self.revision, "Connecting");
        let (ws_stream, response) = connect_async(request).await?;

        let accepted_protocol = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if accepted_protocol != Some(self.revision.subprotocol()) {
            warn!(
                station = %self.id,
                "Server did not accept subprotocol {}, got: {:?}",
                self.revision.subprotocol(),
                accepted_protocol
            );
        }

        let (mut sink, mut stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.finishing.store(false, Ordering::SeqCst);
        *self.writer.lock() = Some(tx);

        let writer_id = self.id.clone();
        tokio::spawn(async move {
            while let Some(outgoing) = rx.recv().await {
                match outgoing {
                    Outgoing::Frame(text) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            warn!(station = %writer_id, "Failed to send WebSocket message: {}", e);
                            break;
                        }
                    }
                    Outgoing::Close => {
                        if let Err(e) = sink.close().await {
                            debug!(station = %writer_id, "Close handshake failed: {}", e);
                        }
                        break;
                    }
                }
            }
        });

        let station = Arc::downgrade(self);
        let reader = tokio::spawn(async move {
            let mut code = None;
            let mut reason = String::new();
            while let Some(message) = stream.next().await {
                let Some(station) = station.upgrade() else {
                    return;
                };
                match message {
                    Ok(Message::Text(text)) => {
                        if let Err(e) = station.handle_frame(&text) {
                            warn!(station = %station.id, "Inbound frame not processed: {}", e);
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            code = Some(u16::from(frame.code));
                            reason = frame.reason.to_string();
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        reason = e.to_string();
                        break;
                    }
                }
            }
            if let Some(station) = station.upgrade() {
                station.on_close(generation, code, reason);
            }
        });
        if let Some(previous) = self.reader.lock().replace(reader) {
            previous.abort();
        }

        info!(station = %self.id, "WebSocket connected to {}", url);
        self.emit(StationEvent::Connected);
        Ok(())
    }

    /// Send a request to the central system and register it in the outbox
    pub fn send(&self, call: Call) -> Result<(), StationError> {
        let writer = self.writer.lock().clone().ok_or(StationError::NotConnected)?;
        let entry = self.catalog.outgoing(&call.action).ok_or_else(|| StationError::UnknownAction {
            revision: self.revision,
            action: call.action.clone(),
        })?;
        (entry.request)(&call.payload).map_err(|reason| StationError::SchemaViolation {
            action: call.action.clone(),
            reason,
        })?;

        let text = OcppMessage::Call(call.clone()).encode()?;
        let message_id = call.message_id.clone();
        self.outbox.lock().enqueue(call);

        debug!(station = %self.id, "Sending: {}", text);
        if writer.send(Outgoing::Frame(text)).is_err() {
            self.outbox.lock().discard(&message_id);
            return Err(StationError::NotConnected);
        }
        Ok(())
    }

    /// Answer a request from the central system
    pub fn respond(&self, call: &Call, payload: impl Serialize) -> Result<(), StationError> {
        let result = CallResult::new(call.message_id.clone(), payload)?;
        if let Some(entry) = self.catalog.incoming(&call.action) {
            (entry.response)(&result.payload).map_err(|reason| StationError::SchemaViolation {
                action: call.action.clone(),
                reason,
            })?;
        }
        self.transmit(&OcppMessage::CallResult(result))
    }

    pub fn respond_error(&self, error: CallError) -> Result<(), StationError> {
        self.transmit(&OcppMessage::CallError(error))
    }

    fn transmit(&self, message: &OcppMessage) -> Result<(), StationError> {
        let text = message.encode()?;
        debug!(station = %self.id, "Sending: {}", text);
        let writer = self.writer.lock();
        let writer = writer.as_ref().ok_or(StationError::NotConnected)?;
        writer.send(Outgoing::Frame(text)).map_err(|_| StationError::NotConnected)
    }

    /// Deliberately close the connection
    pub fn close(&self) {
        let Some(writer) = self.writer.lock().take() else {
            warn!(station = %self.id, "Close requested but station is not connected");
            return;
        };
        self.finishing.store(true, Ordering::SeqCst);
        self.clear_heartbeat();
        info!(station = %self.id, "Closing connection");
        // Writer task already gone means the socket is closing anyway
        let _ = writer.send(Outgoing::Close);
    }

    /// (Re)arm the heartbeat timer; a zero interval disables it
    pub fn configure_heartbeat(self: &Arc<Self>, interval: Duration) {
        let mut heartbeat = self.heartbeat.lock();
        if let Some(previous) = heartbeat.take() {
            previous.abort();
        }
        if interval.is_zero() {
            return;
        }
        if interval > MAX_HEARTBEAT_INTERVAL {
            warn!(station = %self.id, requested_secs = interval.as_secs(), "Heartbeat interval clamped");
        }
        let interval = interval.min(MAX_HEARTBEAT_INTERVAL);

        let station = Arc::downgrade(self);
        *heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(station) = station.upgrade() else {
                    break;
                };
                let sent = (station.catalog.heartbeat_request)()
                    .map_err(StationError::from)
                    .and_then(|call| station.send(call));
                if let Err(e) = sent {
                    warn!(station = %station.id, "Heartbeat not sent: {}", e);
                }
            }
        }));
    }

    fn clear_heartbeat(&self) {
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.abort();
        }
    }

    /// Process one inbound frame
    pub fn handle_frame(self: &Arc<Self>, text: &str) -> Result<(), StationError> {
        debug!(station = %self.id, "Received: {}", text);
        match OcppMessage::decode(text)? {
            OcppMessage::Call(call) => self.dispatch_call(call),
            OcppMessage::CallResult(result) => self.dispatch_result(result),
            OcppMessage::CallError(error) => self.dispatch_error(error),
        }
    }

    fn dispatch_call(self: &Arc<Self>, call: Call) -> Result<(), StationError> {
        let Some(entry) = self.catalog.incoming(&call.action) else {
            warn!(station = %self.id, action = %call.action, "Action not implemented");
            let description = format!("Action {} is not implemented", call.action);
            return self.respond_error(CallError::new(call.message_id, ErrorCode::NotImplemented, description));
        };

        if let Err(reason) = (entry.request)(&call.payload) {
            warn!(station = %self.id, action = %call.action, "Request payload rejected: {}", reason);
            return self.respond_error(CallError::new(call.message_id, self.catalog.format_violation, reason));
        }

        (entry.handler)(self, &call)
    }

    fn dispatch_result(self: &Arc<Self>, result: CallResult) -> Result<(), StationError> {
        let call = self
            .outbox
            .lock()
            .take(&result.message_id)
            .ok_or_else(|| StationError::UnknownMessageId(result.message_id.clone()))?;
        let Some(entry) = self.catalog.outgoing(&call.action) else {
            return Ok(());
        };

        (entry.response)(&result.payload).map_err(|reason| StationError::SchemaViolation {
            action: call.action.clone(),
            reason,
        })?;

        match entry.on_result {
            Some(on_result) => on_result(self, &call, &result),
            None => {
                debug!(station = %self.id, action = %call.action, "Result received");
                Ok(())
            }
        }
    }

    fn dispatch_error(&self, error: CallError) -> Result<(), StationError> {
        let call = self
            .outbox
            .lock()
            .take(&error.message_id)
            .ok_or_else(|| StationError::UnknownMessageId(error.message_id.clone()))?;
        warn!(
            station = %self.id,
            action = %call.action,
            code = %error.error_code,
            "CALLERROR received: {}",
            error.error_description
        );
        Ok(())
    }

    fn on_close(&self, generation: u64, code: Option<u16>, reason: String) {
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(station = %self.id, "Ignoring close of a superseded connection");
            return;
        }

        self.clear_heartbeat();
        self.writer.lock().take();
        let discarded = self.outbox.lock().discard_all();
        let expected = self.finishing.load(Ordering::SeqCst);
        if expected {
            info!(station = %self.id, ?code, discarded, "Connection closed");
        } else {
            warn!(station = %self.id, ?code, discarded, "Connection lost: {}", reason);
        }
        self.emit(StationEvent::Disconnected { code, reason, expected });
    }

    #[cfg(test)]
    pub(crate) fn attach_test_writer(&self) -> mpsc::UnboundedReceiver<Outgoing> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.writer.lock() = Some(tx);
        rx
    }
}

impl Drop for Station {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.get_mut().take() {
            heartbeat.abort();
        }
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for Station {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Station")
            .field("id", &self.id)
            .field("revision", &self.revision)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Build the full WebSocket URL of a station
pub fn build_station_url(base_url: &str, station_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), station_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connected(revision: Revision) -> (Arc<Station>, mpsc::UnboundedReceiver<Outgoing>) {
        let station = Station::new(StationOptions::new("CP-1", "ws://localhost:1", revision));
        let rx = station.attach_test_writer();
        (station, rx)
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> OcppMessage {
        match rx.try_recv().unwrap() {
            Outgoing::Frame(text) => OcppMessage::decode(&text).unwrap(),
            Outgoing::Close => panic!("unexpected close"),
        }
    }

    #[test]
    fn test_build_station_url() {
        assert_eq!(build_station_url("ws://localhost:8092", "CP-001"), "ws://localhost:8092/CP-001");
        assert_eq!(build_station_url("ws://localhost:8092/ocpp/", "CP-001"), "ws://localhost:8092/ocpp/CP-001");
    }

    #[test]
    fn test_send_requires_connection() {
        let station = Station::new(StationOptions::new("CP-1", "ws://localhost:1", Revision::Ocpp16));
        let call = Call::new("Heartbeat", json!({})).unwrap();
        assert!(matches!(station.send(call), Err(StationError::NotConnected)));
        assert_eq!(station.pending_requests(), 0);
    }

    #[test]
    fn test_send_validates_outgoing_schema() {
        let (station, mut rx) = connected(Revision::Ocpp16);

        let unknown = Call::new("TransactionEvent", json!({})).unwrap();
        assert!(matches!(station.send(unknown), Err(StationError::UnknownAction { .. })));

        let malformed = Call::new("StatusNotification", json!({"connectorId": "one"})).unwrap();
        assert!(matches!(station.send(malformed), Err(StationError::SchemaViolation { .. })));

        assert!(rx.try_recv().is_err());
        assert_eq!(station.pending_requests(), 0);
    }

    #[test]
    fn test_results_resolve_outbox_in_any_order() {
        let (station, mut rx) = connected(Revision::Ocpp16);
        let ids: Vec<String> = (0..3)
            .map(|_| {
                let call = Call::new("Heartbeat", json!({})).unwrap();
                let id = call.message_id.clone();
                station.send(call).unwrap();
                id
            })
            .collect();
        assert_eq!(station.pending_requests(), 3);
        for _ in 0..3 {
            assert!(matches!(next_frame(&mut rx), OcppMessage::Call(_)));
        }

        for id in ids.iter().rev() {
            let frame = json!([3, id, {"currentTime": "2024-01-01T00:00:00Z"}]);
            station.handle_frame(&frame.to_string()).unwrap();
        }
        assert_eq!(station.pending_requests(), 0);

        let stray = json!([3, ids[0], {"currentTime": "2024-01-01T00:00:00Z"}]);
        assert!(matches!(
            station.handle_frame(&stray.to_string()),
            Err(StationError::UnknownMessageId(_))
        ));
    }

    #[test]
    fn test_call_error_resolves_outbox() {
        let (station, _rx) = connected(Revision::Ocpp201);
        let call = Call::new("Heartbeat", json!({})).unwrap();
        let id = call.message_id.clone();
        station.send(call).unwrap();

        let frame = json!([4, id, "InternalError", "boom", {}]);
        station.handle_frame(&frame.to_string()).unwrap();
        assert_eq!(station.pending_requests(), 0);
    }

    #[test]
    fn test_call_error_without_details_resolves_outbox() {
        let (station, _rx) = connected(Revision::Ocpp16);
        let call = Call::new("Heartbeat", json!({})).unwrap();
        let id = call.message_id.clone();
        station.send(call).unwrap();

        let frame = json!([4, id, "InternalError", "boom"]);
        station.handle_frame(&frame.to_string()).unwrap();
        assert_eq!(station.pending_requests(), 0);
    }

    #[test]
    fn test_unknown_action_answers_not_implemented() {
        let (station, mut rx) = connected(Revision::Ocpp16);
        station
            .handle_frame(&json!([2, "m1", "SetChargingProfile", {}]).to_string())
            .unwrap();

        match next_frame(&mut rx) {
            OcppMessage::CallError(error) => {
                assert_eq!(error.message_id, "m1");
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_framing_error_is_reported() {
        let (station, mut rx) = connected(Revision::Ocpp16);
        assert!(matches!(station.handle_frame("[5, \"x\"]"), Err(StationError::Ocpp(_))));
        assert!(matches!(station.handle_frame("not json"), Err(StationError::Ocpp(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_boot_accepted_event() {
        let (station, mut rx) = connected(Revision::Ocpp16);
        let mut events = station.subscribe();

        let boot = Call::new(
            "BootNotification",
            json!({"chargePointVendor": "Solidstudio", "chargePointModel": "VirtualChargePoint"}),
        )
        .unwrap();
        let id = boot.message_id.clone();
        station.send(boot).unwrap();
        next_frame(&mut rx);

        let answer = json!([3, id, {"status": "Accepted", "currentTime": "2024-01-01T00:00:00Z", "interval": 30}]);
        station.handle_frame(&answer.to_string()).unwrap();

        assert_eq!(events.try_recv().unwrap(), StationEvent::BootAccepted { interval_secs: 30 });
        assert_eq!(station.settings().heartbeat_interval_secs(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timer() {
        let (station, mut rx) = connected(Revision::Ocpp21);
        station.configure_heartbeat(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(25)).await;
        let mut beats = 0;
        while let Ok(Outgoing::Frame(text)) = rx.try_recv() {
            match OcppMessage::decode(&text).unwrap() {
                OcppMessage::Call(call) => {
                    assert_eq!(call.action, "Heartbeat");
                    beats += 1;
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }
        assert_eq!(beats, 2);

        // Re-arming replaces the previous timer
        station.configure_heartbeat(Duration::ZERO);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_heartbeat_interval_is_clamped() {
        let (station, mut rx) = connected(Revision::Ocpp16);
        station.configure_heartbeat(Duration::from_secs(u64::MAX));

        tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(MAX_HEARTBEAT_INTERVAL).await;
        match next_frame(&mut rx) {
            OcppMessage::Call(call) => assert_eq!(call.action, "Heartbeat"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_huge_boot_interval_keeps_station_usable() {
        let (station, mut rx) = connected(Revision::Ocpp16);
        let mut events = station.subscribe();

        let boot = Call::new(
            "BootNotification",
            json!({"chargePointVendor": "Solidstudio", "chargePointModel": "VirtualChargePoint"}),
        )
        .unwrap();
        let id = boot.message_id.clone();
        station.send(boot).unwrap();
        next_frame(&mut rx);

        let answer = json!([3, id, {"status": "Accepted", "currentTime": "2024-01-01T00:00:00Z", "interval": i64::MAX}]);
        station.handle_frame(&answer.to_string()).unwrap();
        assert_eq!(events.try_recv().unwrap(), StationEvent::BootAccepted { interval_secs: i64::MAX as u64 });

        tokio::task::yield_now().await;
        let heartbeat = station.heartbeat.lock();
        assert!(heartbeat.as_ref().is_some_and(|task| !task.is_finished()));
    }

    #[tokio::test]
    async fn test_close_is_expected() {
        let (station, mut rx) = connected(Revision::Ocpp16);
        let mut events = station.subscribe();
        let generation = station.generation.load(Ordering::SeqCst);
        station.send(Call::new("Heartbeat", json!({})).unwrap()).unwrap();
        next_frame(&mut rx);

        station.close();
        assert_eq!(rx.try_recv().unwrap(), Outgoing::Close);
        assert!(!station.is_connected());

        station.on_close(generation, Some(1000), String::new());
        assert_eq!(
            events.try_recv().unwrap(),
            StationEvent::Disconnected { code: Some(1000), reason: String::new(), expected: true }
        );
        assert_eq!(station.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_remote_close_is_unexpected_and_stale_close_ignored() {
        let (station, _rx) = connected(Revision::Ocpp16);
        let mut events = station.subscribe();

        station.on_close(7, None, "old".into());
        assert!(events.try_recv().is_err());
        assert!(station.is_connected());

        station.on_close(0, None, "reset".into());
        assert_eq!(
            events.try_recv().unwrap(),
            StationEvent::Disconnected { code: None, reason: "reset".into(), expected: false }
        );
        assert!(!station.is_connected());
    }

    #[tokio::test]
    async fn test_connect_failure_is_retryable() {
        let station = Station::new(StationOptions::new("CP-1", "ws://127.0.0.1:1", Revision::Ocpp16));
        assert!(matches!(station.connect().await, Err(StationError::ConnectFailed(_))));
        assert!(station.pending_connect.lock().is_none());
        assert!(matches!(station.connect().await, Err(StationError::ConnectFailed(_))));
    }
}
