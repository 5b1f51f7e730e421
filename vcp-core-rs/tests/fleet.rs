//! Fleet lifecycle against an in-process CSMS

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use vcp_core::{
    CreateOptions, ManagerError, Revision, Station, StationManager, StationOptions, StationPatch, StationStatus,
    VcpConfig,
};

#[derive(Debug, Clone, Default)]
struct Handshake {
    path: String,
    protocol: Option<String>,
    authorization: Option<String>,
}

struct MockCsms {
    endpoint: String,
    calls: mpsc::UnboundedReceiver<(String, Value)>,
    handshake: Arc<Mutex<Option<Handshake>>>,
    hangup: Option<oneshot::Sender<()>>,
    /// TCP connections accepted so far, including ones past the first
    accepted: Arc<AtomicUsize>,
}

impl MockCsms {
    async fn start() -> Self {
        Self::start_with(true).await
    }

    /// Serve one station connection, record its requests and answer them.
    /// Later connections are only counted. With `answer_boot` false
    /// BootNotification is never answered.
    async fn start_with(answer_boot: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (calls_tx, calls) = mpsc::unbounded_channel();
        let (hangup, mut hangup_rx) = oneshot::channel::<()>();
        let handshake = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&handshake);
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                while listener.accept().await.is_ok() {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            });
            let callback = move |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
                let header = |name: &str| {
                    request
                        .headers()
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                };
                let protocol = header("sec-websocket-protocol");
                if let Some(protocol) = &protocol {
                    response
                        .headers_mut()
                        .insert("sec-websocket-protocol", HeaderValue::from_str(protocol).unwrap());
                }
                *seen.lock() = Some(Handshake {
                    path: request.uri().path().to_string(),
                    protocol,
                    authorization: header("authorization"),
                });
                Ok(response)
            };
            let mut ws = accept_hdr_async(socket, callback).await.unwrap();

            loop {
                tokio::select! {
                    _ = &mut hangup_rx => {
                        let _ = ws.close(None).await;
                        break;
                    }
                    message = ws.next() => {
                        let text = match message {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(_)) => continue,
                            _ => break,
                        };
                        let frame: Value = serde_json::from_str(&text).unwrap();
                        if frame[0] != 2 {
                            continue;
                        }
                        let action = frame[2].as_str().unwrap().to_string();
                        let _ = calls_tx.send((action.clone(), frame[3].clone()));
                        if action == "BootNotification" && !answer_boot {
                            continue;
                        }
                        let reply = json!([3, frame[1], response_for(&action)]);
                        if ws.send(Message::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            endpoint: format!("ws://{}", addr),
            calls,
            handshake,
            hangup: Some(hangup),
            accepted,
        }
    }

    async fn next_call(&mut self) -> (String, Value) {
        tokio::time::timeout(Duration::from_secs(5), self.calls.recv())
            .await
            .expect("no request within 5s")
            .expect("CSMS task ended")
    }

    fn connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    fn hang_up(&mut self) {
        if let Some(hangup) = self.hangup.take() {
            let _ = hangup.send(());
        }
    }
}

fn response_for(action: &str) -> Value {
    let now = chrono::Utc::now().to_rfc3339();
    match action {
        "BootNotification" => json!({"currentTime": now, "interval": 300, "status": "Accepted"}),
        "Heartbeat" => json!({"currentTime": now}),
        _ => json!({}),
    }
}

async fn wait_for_status(manager: &StationManager, id: &str, status: StationStatus) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if manager.get_snapshot(id).map(|s| s.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "station {} never reached {}", id, status);
}

#[tokio::test]
async fn test_boot_to_ready_v16() {
    let mut csms = MockCsms::start().await;
    let manager = StationManager::new(Some(Duration::from_secs(5)));
    let config = VcpConfig::new("CP-1", Revision::Ocpp16, csms.endpoint.clone()).with_password("secret");

    let snapshot = manager.create(config, CreateOptions::default()).await.unwrap();
    assert_eq!(snapshot.status, StationStatus::Ready);
    assert!(snapshot.last_connected_at.is_some());
    assert!(snapshot.last_boot_accepted_at.is_some());

    let handshake = csms.handshake.lock().clone().unwrap();
    assert_eq!(handshake.path, "/CP-1");
    assert_eq!(handshake.protocol.as_deref(), Some("ocpp1.6"));
    let expected_auth = format!("Basic {}", BASE64.encode("CP-1:secret"));
    assert_eq!(handshake.authorization.as_deref(), Some(expected_auth.as_str()));

    let (action, payload) = csms.next_call().await;
    assert_eq!(action, "BootNotification");
    assert_eq!(payload["chargePointVendor"], "Solidstudio");
    assert_eq!(payload["chargePointModel"], "VirtualChargePoint");
    assert_eq!(payload["chargePointSerialNumber"], "CP-1-S001");

    for connector_id in [0, 1] {
        let (action, payload) = csms.next_call().await;
        assert_eq!(action, "StatusNotification");
        assert_eq!(payload["connectorId"], connector_id);
        assert_eq!(payload["status"], "Available");
    }
}

#[tokio::test]
async fn test_boot_to_ready_v201() {
    let mut csms = MockCsms::start().await;
    let manager = StationManager::new(Some(Duration::from_secs(5)));
    let config = VcpConfig::new("CP-2", Revision::Ocpp201, csms.endpoint.clone()).with_serial("SN-42");

    let snapshot = manager.create(config, CreateOptions::default()).await.unwrap();
    assert_eq!(snapshot.status, StationStatus::Ready);

    let handshake = csms.handshake.lock().clone().unwrap();
    assert_eq!(handshake.protocol.as_deref(), Some("ocpp2.0.1"));
    assert!(handshake.authorization.is_none());

    let (action, payload) = csms.next_call().await;
    assert_eq!(action, "BootNotification");
    assert_eq!(payload["reason"], "PowerUp");
    assert_eq!(payload["chargingStation"]["serialNumber"], "SN-42");

    let (action, payload) = csms.next_call().await;
    assert_eq!(action, "StatusNotification");
    assert_eq!(payload["evseId"], 1);
    assert_eq!(payload["connectorStatus"], "Available");
}

#[tokio::test]
async fn test_auto_boot_disabled() {
    let mut csms = MockCsms::start().await;
    let manager = StationManager::default();
    let config = VcpConfig::new("CP-1", Revision::Ocpp16, csms.endpoint.clone());

    let options = CreateOptions { auto_connect: true, auto_boot: Some(false) };
    let snapshot = manager.create(config, options).await.unwrap();
    assert_eq!(snapshot.status, StationStatus::Ready);
    assert!(snapshot.last_boot_accepted_at.is_none());

    let message_id = manager.send_action("CP-1", "Heartbeat", json!({})).unwrap();
    assert!(!message_id.is_empty());
    let (action, _) = csms.next_call().await;
    assert_eq!(action, "Heartbeat");
}

#[tokio::test]
async fn test_concurrent_connects_open_one_socket() {
    let mut csms = MockCsms::start().await;
    let manager = StationManager::new(Some(Duration::from_secs(5)));
    let config = VcpConfig::new("CP-1", Revision::Ocpp16, csms.endpoint.clone());
    let offline = CreateOptions { auto_connect: false, auto_boot: None };
    manager.create(config, offline).await.unwrap();

    let (first, second) = tokio::join!(
        manager.connect_by_id("CP-1", None),
        manager.connect_by_id("CP-1", None),
    );
    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(manager.get_snapshot("CP-1").unwrap().status, StationStatus::Ready);

    let (action, _) = csms.next_call().await;
    assert_eq!(action, "BootNotification");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(csms.connections(), 1);
}

#[tokio::test]
async fn test_station_connect_shares_attempt() {
    let csms = MockCsms::start().await;
    let station = Station::new(StationOptions::new("CP-1", csms.endpoint.clone(), Revision::Ocpp16));

    let (first, second) = tokio::join!(station.connect(), station.connect());
    assert!(first.is_ok());
    assert!(second.is_ok());
    assert!(station.is_connected());

    station.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(csms.connections(), 1);
    station.close();
}

#[tokio::test]
async fn test_duplicate_create_keeps_first() {
    let _csms = MockCsms::start().await;
    let manager = StationManager::default();
    let offline = CreateOptions { auto_connect: false, auto_boot: None };

    manager
        .create(VcpConfig::new("CP-1", Revision::Ocpp16, "ws://first"), offline)
        .await
        .unwrap();
    let duplicate = manager
        .create(VcpConfig::new("CP-1", Revision::Ocpp201, "ws://second"), offline)
        .await;

    assert!(matches!(duplicate, Err(ManagerError::AlreadyExists(_))));
    let kept = manager.get_snapshot("CP-1").unwrap();
    assert_eq!(kept.endpoint, "ws://first");
    assert_eq!(kept.ocpp_version, Revision::Ocpp16);
}

#[tokio::test]
async fn test_unexpected_disconnect_sets_error() {
    let mut csms = MockCsms::start().await;
    let manager = StationManager::new(Some(Duration::from_secs(5)));
    let config = VcpConfig::new("CP-1", Revision::Ocpp16, csms.endpoint.clone());
    manager.create(config, CreateOptions::default()).await.unwrap();

    csms.hang_up();
    wait_for_status(&manager, "CP-1", StationStatus::Error).await;

    let snapshot = manager.get_snapshot("CP-1").unwrap();
    assert!(snapshot
        .last_error
        .unwrap()
        .starts_with("disconnected (unexpected)"));
    assert!(!manager.station("CP-1").unwrap().is_connected());
}

#[tokio::test]
async fn test_stop_is_not_an_error() {
    let csms = MockCsms::start().await;
    let manager = StationManager::new(Some(Duration::from_secs(5)));
    let config = VcpConfig::new("CP-1", Revision::Ocpp16, csms.endpoint.clone());
    manager.create(config, CreateOptions::default()).await.unwrap();

    manager.stop("CP-1").unwrap();
    let station = manager.station("CP-1").unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while station.is_connected() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(closed.is_ok());

    let snapshot = manager.get_snapshot("CP-1").unwrap();
    assert_eq!(snapshot.status, StationStatus::Stopped);
    assert!(snapshot.last_error.is_none());
}

#[tokio::test]
async fn test_boot_timeout() {
    let mut csms = MockCsms::start_with(false).await;
    let manager = StationManager::new(Some(Duration::from_millis(300)));
    let config = VcpConfig::new("CP-1", Revision::Ocpp16, csms.endpoint.clone());

    let outcome = manager.create(config, CreateOptions::default()).await;
    assert!(matches!(outcome, Err(ManagerError::BootTimeout { .. })));

    let (action, _) = csms.next_call().await;
    assert_eq!(action, "BootNotification");
    let snapshot = manager.get_snapshot("CP-1").unwrap();
    assert_eq!(snapshot.status, StationStatus::Error);
    assert!(snapshot.last_connected_at.is_some());
    assert!(snapshot.last_boot_accepted_at.is_none());
}

#[tokio::test]
async fn test_update_applies_on_next_connect() {
    let csms = MockCsms::start().await;
    let manager = StationManager::new(Some(Duration::from_secs(5)));
    let offline = CreateOptions { auto_connect: false, auto_boot: None };
    manager
        .create(VcpConfig::new("CP-7", Revision::Ocpp16, "ws://127.0.0.1:1"), offline)
        .await
        .unwrap();

    let patch: StationPatch = serde_json::from_value(json!({
        "endpoint": csms.endpoint,
        "basicAuthPassword": "rotated"
    }))
    .unwrap();
    manager.update("CP-7", patch).unwrap();
    manager.connect_by_id("CP-7", None).await.unwrap();

    assert_eq!(manager.get_snapshot("CP-7").unwrap().status, StationStatus::Ready);
    let handshake = csms.handshake.lock().clone().unwrap();
    let expected_auth = format!("Basic {}", BASE64.encode("CP-7:rotated"));
    assert_eq!(handshake.authorization.as_deref(), Some(expected_auth.as_str()));

    // Already ready and connected: no second socket
    manager.connect_by_id("CP-7", None).await.unwrap();
}
