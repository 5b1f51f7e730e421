//! Fleet orchestration
//!
//! The manager owns every station, drives its lifecycle
//! (`idle → connecting → connected → bootstrapping → ready`, with `error`
//! and `stopped`) and runs the auto-boot sequence after connecting.
//!
//! Lifecycle operations on one station are serialized by a per-station
//! async lock, so two concurrent connects never open two sockets. `stop`
//! bypasses that lock and always wins.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::catalog::BootInfo;
use crate::config::{BootConfig, BootOverrides, VcpConfig};
use crate::ocpp::{Call, OcppError, Revision};
use crate::station::{Station, StationError, StationEvent, StationOptions};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("station {0} already exists")]
    AlreadyExists(String),

    #[error("station {0} not found")]
    NotFound(String),

    #[error("station {id}: BootNotification not accepted within {secs}s")]
    BootTimeout { id: String, secs: u64 },

    #[error("boot interrupted: {0}")]
    BootInterrupted(String),

    #[error("invalid update: {0}")]
    InvalidPatch(String),

    #[error(transparent)]
    Station(#[from] StationError),

    #[error(transparent)]
    Ocpp(#[from] OcppError),
}

/// Lifecycle status of a managed station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StationStatus {
    Idle,
    Connecting,
    Connected,
    Bootstrapping,
    Ready,
    Error,
    Stopped,
}

impl fmt::Display for StationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StationStatus::Idle => "idle",
            StationStatus::Connecting => "connecting",
            StationStatus::Connected => "connected",
            StationStatus::Bootstrapping => "bootstrapping",
            StationStatus::Ready => "ready",
            StationStatus::Error => "error",
            StationStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a station for the administration layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationSnapshot {
    pub id: String,
    pub ocpp_version: Revision,
    pub endpoint: String,
    pub metadata: Map<String, Value>,
    pub status: StationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_boot: Option<BootConfig>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_boot_accepted_at: Option<DateTime<Utc>>,
    #[serde(rename = "error", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct CreateOptions {
    pub auto_connect: bool,
    /// Overrides the station's `autoBoot.enabled` for this connect
    pub auto_boot: Option<bool>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self { auto_connect: true, auto_boot: None }
    }
}

/// Changes applied by [`StationManager::update`], effective on the next connect
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationPatch {
    pub endpoint: Option<String>,
    pub basic_auth_password: Option<String>,
    pub charge_point_serial_number: Option<String>,
    /// Merged key by key into the current metadata
    pub metadata: Option<Map<String, Value>>,
    pub auto_boot: Option<BootOverrides>,
}

#[derive(Debug)]
struct StationRecord {
    config: VcpConfig,
    status: StationStatus,
    created_at: DateTime<Utc>,
    last_connected_at: Option<DateTime<Utc>>,
    last_boot_accepted_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct ManagedStation {
    station: Arc<Station>,
    record: Mutex<StationRecord>,
    lifecycle: tokio::sync::Mutex<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedStation {
    fn new(config: VcpConfig) -> Arc<Self> {
        let mut options = StationOptions::new(config.id.clone(), config.endpoint.clone(), config.ocpp_version)
            .with_connectors(config.connectors());
        if let Some(password) = &config.basic_auth_password {
            options = options.with_password(password.clone());
        }

        Arc::new(Self {
            station: Station::new(options),
            record: Mutex::new(StationRecord {
                config,
                status: StationStatus::Idle,
                created_at: Utc::now(),
                last_connected_at: None,
                last_boot_accepted_at: None,
                last_error: None,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            listener: Mutex::new(None),
        })
    }

    fn id(&self) -> &str {
        self.station.id()
    }

    fn status(&self) -> StationStatus {
        self.record.lock().status
    }

    fn config(&self) -> VcpConfig {
        self.record.lock().config.clone()
    }

    fn snapshot(&self) -> StationSnapshot {
        let record = self.record.lock();
        StationSnapshot {
            id: record.config.id.clone(),
            ocpp_version: record.config.ocpp_version,
            endpoint: record.config.endpoint.clone(),
            metadata: record.config.metadata.clone(),
            status: record.status,
            auto_boot: record.config.auto_boot.clone(),
            created_at: record.created_at,
            last_connected_at: record.last_connected_at,
            last_boot_accepted_at: record.last_boot_accepted_at,
            last_error: record.last_error.clone(),
            charge_point_serial_number: record.config.charge_point_serial_number.clone(),
        }
    }

    /// Move to `to`. A stopped station only leaves `stopped` through a new connect.
    fn set_status(&self, to: StationStatus, cause: &str) -> bool {
        let mut record = self.record.lock();
        let from = record.status;
        if from == to {
            return true;
        }
        if from == StationStatus::Stopped && to != StationStatus::Connecting {
            debug!(station = %self.id(), %to, "Station is stopped, transition skipped ({})", cause);
            return false;
        }

        record.status = to;
        match &record.last_error {
            Some(last_error) => info!(station = %self.id(), %from, %to, "Status changed: {} ({})", cause, last_error),
            None => info!(station = %self.id(), %from, %to, "Status changed: {}", cause),
        }
        true
    }

    fn fail(&self, cause: String) {
        if self.status() == StationStatus::Stopped {
            debug!(station = %self.id(), "Ignoring failure of a stopped station: {}", cause);
            return;
        }
        self.record.lock().last_error = Some(cause);
        self.set_status(StationStatus::Error, "failure");
    }

    fn spawn_listener(self: &Arc<Self>) {
        let mut events = self.station.subscribe();
        let managed: Weak<ManagedStation> = Arc::downgrade(self);
        let listener = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Station event listener lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(managed) = managed.upgrade() else {
                    break;
                };
                managed.observe(event);
            }
        });
        if let Some(previous) = self.listener.lock().replace(listener) {
            previous.abort();
        }
    }

    fn observe(&self, event: StationEvent) {
        match event {
            StationEvent::BootAccepted { .. } => {
                self.record.lock().last_boot_accepted_at = Some(Utc::now());
                if self.status() != StationStatus::Bootstrapping {
                    self.set_status(StationStatus::Ready, "BootNotification accepted");
                }
            }
            StationEvent::Disconnected { expected: false, reason, .. } => {
                self.fail(format!("disconnected (unexpected): {}", reason));
            }
            StationEvent::Disconnected { expected: true, .. } => {
                debug!(station = %self.id(), "Disconnected");
            }
            StationEvent::Connected => {}
        }
    }
}

impl Drop for ManagedStation {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

/// Registry of virtual charge points keyed by id
pub struct StationManager {
    stations: RwLock<HashMap<String, Arc<ManagedStation>>>,
    boot_timeout: Option<Duration>,
}

impl Default for StationManager {
    fn default() -> Self {
        Self::new(None)
    }
}

impl StationManager {
    /// `boot_timeout` bounds the wait for BootNotification acceptance; `None` waits indefinitely
    pub fn new(boot_timeout: Option<Duration>) -> Self {
        Self {
            stations: RwLock::new(HashMap::new()),
            boot_timeout,
        }
    }

    fn require(&self, id: &str) -> Result<Arc<ManagedStation>, ManagerError> {
        self.stations
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))
    }

    /// Snapshots of every station, ordered by id
    pub fn list(&self) -> Vec<StationSnapshot> {
        let mut snapshots: Vec<_> = self.stations.read().values().map(|m| m.snapshot()).collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    pub fn get_snapshot(&self, id: &str) -> Option<StationSnapshot> {
        self.stations.read().get(id).map(|m| m.snapshot())
    }

    pub fn config(&self, id: &str) -> Option<VcpConfig> {
        self.stations.read().get(id).map(|m| m.config())
    }

    pub fn station(&self, id: &str) -> Option<Arc<Station>> {
        self.stations.read().get(id).map(|m| Arc::clone(&m.station))
    }

    /// Register a station and, unless disabled, connect and boot it.
    ///
    /// A failed connect leaves the station registered in `error`.
    pub async fn create(&self, config: VcpConfig, options: CreateOptions) -> Result<StationSnapshot, ManagerError> {
        let id = config.id.clone();
        let managed = {
            let mut stations = self.stations.write();
            if stations.contains_key(&id) {
                return Err(ManagerError::AlreadyExists(id));
            }
            let managed = ManagedStation::new(config);
            stations.insert(id.clone(), Arc::clone(&managed));
            managed
        };
        managed.spawn_listener();
        info!(station = %id, revision = %managed.station.revision(), "Station registered");

        if options.auto_connect {
            self.run_connect(&managed, options.auto_boot).await?;
        }
        Ok(managed.snapshot())
    }

    /// Create many stations concurrently; failures are logged. Returns how many succeeded.
    pub async fn seed(&self, configs: Vec<VcpConfig>, options: CreateOptions) -> usize {
        let outcomes = join_all(configs.into_iter().map(|config| async move {
            let id = config.id.clone();
            (id, self.create(config, options).await)
        }))
        .await;

        outcomes
            .into_iter()
            .filter(|(id, outcome)| match outcome {
                Ok(_) => true,
                Err(e) => {
                    error!(station = %id, "Failed to start station: {}", e);
                    false
                }
            })
            .count()
    }

    pub async fn connect_by_id(&self, id: &str, auto_boot: Option<bool>) -> Result<(), ManagerError> {
        let managed = self.require(id)?;
        self.run_connect(&managed, auto_boot).await
    }

    async fn run_connect(&self, managed: &Arc<ManagedStation>, auto_boot: Option<bool>) -> Result<(), ManagerError> {
        let _lifecycle = managed.lifecycle.lock().await;
        if managed.status() == StationStatus::Ready && managed.station.is_connected() {
            debug!(station = %managed.id(), "Already connected and ready");
            return Ok(());
        }

        managed.set_status(StationStatus::Connecting, "connect requested");
        if let Err(e) = managed.station.connect().await {
            managed.fail(e.to_string());
            return Err(e.into());
        }
        if managed.status() == StationStatus::Stopped {
            info!(station = %managed.id(), "Stopped while connecting, closing");
            managed.station.close();
            return Ok(());
        }
        managed.record.lock().last_connected_at = Some(Utc::now());
        managed.set_status(StationStatus::Connected, "transport open");

        let config = managed.config();
        let boot = config.auto_boot.clone().unwrap_or_default();
        if !auto_boot.unwrap_or(boot.enabled) {
            managed.set_status(StationStatus::Ready, "auto-boot disabled");
            return Ok(());
        }

        if let Err(e) = self.auto_boot(managed, &config, &boot).await {
            managed.fail(e.to_string());
            return Err(e);
        }
        Ok(())
    }

    /// BootNotification, wait for acceptance, then report every connector available
    async fn auto_boot(&self, managed: &ManagedStation, config: &VcpConfig, boot: &BootConfig) -> Result<(), ManagerError> {
        managed.set_status(StationStatus::Bootstrapping, "auto-boot");
        let station = &managed.station;
        let catalog = station.catalog();

        let info = BootInfo {
            vendor: boot.charge_point_vendor.clone(),
            model: boot.charge_point_model.clone(),
            firmware_version: Some(boot.firmware_version.clone()),
            serial_number: config
                .charge_point_serial_number
                .clone()
                .unwrap_or_else(|| (catalog.default_serial)(&config.id)),
        };

        // Subscribe before sending so the acceptance cannot be missed
        let mut events = station.subscribe();
        station.send((catalog.boot_request)(&info)?)?;
        self.await_boot(&config.id, &mut events).await?;
        managed.record.lock().last_boot_accepted_at = Some(Utc::now());

        if catalog.reports_central_connector {
            station.send((catalog.available_status)(0)?)?;
        }
        for connector_id in &boot.connectors {
            station.send((catalog.available_status)(*connector_id)?)?;
        }

        managed.set_status(StationStatus::Ready, "auto-boot complete");
        Ok(())
    }

    async fn await_boot(&self, id: &str, events: &mut broadcast::Receiver<StationEvent>) -> Result<u64, ManagerError> {
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(StationEvent::BootAccepted { interval_secs }) => return Ok(interval_secs),
                    Ok(StationEvent::Disconnected { reason, .. }) => {
                        return Err(ManagerError::BootInterrupted(format!(
                            "station {} disconnected while booting: {}",
                            id, reason
                        )));
                    }
                    Ok(StationEvent::Connected) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(station = %id, skipped, "Boot waiter lagged");
                    }
                    Err(RecvError::Closed) => {
                        return Err(ManagerError::BootInterrupted(format!("station {} was dropped", id)));
                    }
                }
            }
        };

        match self.boot_timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| ManagerError::BootTimeout { id: id.to_string(), secs: limit.as_secs() })?,
            None => wait.await,
        }
    }

    /// Close the connection and mark the station stopped
    pub fn stop(&self, id: &str) -> Result<(), ManagerError> {
        let managed = self.require(id)?;
        managed.set_status(StationStatus::Stopped, "stop requested");
        if managed.station.is_connected() {
            managed.station.close();
        }
        Ok(())
    }

    /// Stop (best effort) and unregister a station
    pub fn remove(&self, id: &str) -> Result<(), ManagerError> {
        let managed = self.require(id)?;
        if let Err(e) = self.stop(id) {
            warn!(station = %id, "Failed to stop station before removal: {}", e);
        }
        if let Some(listener) = managed.listener.lock().take() {
            listener.abort();
        }
        self.stations.write().remove(id);
        info!(station = %id, "Station removed");
        Ok(())
    }

    /// Apply a patch to the station's config; takes effect on the next connect
    pub fn update(&self, id: &str, patch: StationPatch) -> Result<StationSnapshot, ManagerError> {
        let managed = self.require(id)?;
        let auto_boot = match patch.auto_boot {
            Some(overrides) => {
                let current = managed.record.lock().config.auto_boot.clone().unwrap_or_default();
                Some(overrides.apply_to(current).map_err(ManagerError::InvalidPatch)?)
            }
            None => None,
        };

        {
            let mut record = managed.record.lock();
            let config = &mut record.config;
            if auto_boot.is_some() {
                config.auto_boot = auto_boot;
            }
            if let Some(metadata) = patch.metadata {
                config.metadata.extend(metadata);
            }
            if let Some(endpoint) = patch.endpoint {
                managed.station.set_endpoint(endpoint.clone());
                config.endpoint = endpoint;
            }
            if let Some(password) = patch.basic_auth_password {
                managed.station.set_password(Some(password.clone()));
                config.basic_auth_password = Some(password);
            }
            if let Some(serial) = patch.charge_point_serial_number {
                config.charge_point_serial_number = Some(serial);
            }
        }

        info!(station = %id, "Station config updated");
        Ok(managed.snapshot())
    }

    /// Send an arbitrary action through a station; returns the request's message id
    pub fn send_action(&self, id: &str, action: &str, payload: Value) -> Result<String, ManagerError> {
        let managed = self.require(id)?;
        let call = Call::new(action, payload)?;
        let message_id = call.message_id.clone();
        managed.station.send(call)?;
        Ok(message_id)
    }

    /// Stop every station
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.stations.read().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id) {
                warn!(station = %id, "Failed to stop station: {}", e);
            }
        }
        info!("All stations stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(id: &str) -> VcpConfig {
        VcpConfig::new(id, Revision::Ocpp16, "ws://127.0.0.1:1")
    }

    fn offline() -> CreateOptions {
        CreateOptions { auto_connect: false, auto_boot: None }
    }

    #[tokio::test]
    async fn test_create_without_connect() {
        let manager = StationManager::default();
        let snapshot = manager.create(config("CP-1"), offline()).await.unwrap();

        assert_eq!(snapshot.status, StationStatus::Idle);
        assert_eq!(snapshot.ocpp_version, Revision::Ocpp16);
        assert!(snapshot.last_connected_at.is_none());
        assert_eq!(manager.list().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let manager = StationManager::default();
        manager.create(config("CP-1"), offline()).await.unwrap();
        let before = manager.get_snapshot("CP-1").unwrap();

        let duplicate = manager.create(config("CP-1").with_serial("other"), offline()).await;
        assert!(matches!(duplicate, Err(ManagerError::AlreadyExists(id)) if id == "CP-1"));
        assert_eq!(manager.list(), vec![before]);
    }

    #[tokio::test]
    async fn test_connect_failure_sets_error() {
        let manager = StationManager::default();
        let outcome = manager.create(config("CP-1"), CreateOptions::default()).await;
        assert!(matches!(outcome, Err(ManagerError::Station(StationError::ConnectFailed(_)))));

        let snapshot = manager.get_snapshot("CP-1").unwrap();
        assert_eq!(snapshot.status, StationStatus::Error);
        assert!(snapshot.last_error.is_some());

        // Retryable through connect_by_id
        assert!(manager.connect_by_id("CP-1", None).await.is_err());
        assert_eq!(manager.get_snapshot("CP-1").unwrap().status, StationStatus::Error);
    }

    #[tokio::test]
    async fn test_list_sorted_and_lookup() {
        let manager = StationManager::default();
        for id in ["CP-3", "CP-1", "CP-2"] {
            manager.create(config(id), offline()).await.unwrap();
        }
        let ids: Vec<_> = manager.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["CP-1", "CP-2", "CP-3"]);
        assert!(manager.get_snapshot("CP-9").is_none());
        assert!(matches!(manager.connect_by_id("CP-9", None).await, Err(ManagerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stop_and_remove() {
        let manager = StationManager::default();
        manager.create(config("CP-1"), offline()).await.unwrap();

        manager.stop("CP-1").unwrap();
        assert_eq!(manager.get_snapshot("CP-1").unwrap().status, StationStatus::Stopped);

        manager.remove("CP-1").unwrap();
        assert!(manager.get_snapshot("CP-1").is_none());
        assert!(matches!(manager.remove("CP-1"), Err(ManagerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let manager = StationManager::default();
        manager
            .create(config("CP-1").with_metadata("site", json!("lab")), offline())
            .await
            .unwrap();

        let patch: StationPatch = serde_json::from_value(json!({
            "endpoint": "ws://other:9000",
            "basicAuthPassword": "pw",
            "metadata": {"rack": 4},
            "autoBoot": {"enabled": false, "connectors": [1, 2]}
        }))
        .unwrap();
        let snapshot = manager.update("CP-1", patch).unwrap();

        assert_eq!(snapshot.endpoint, "ws://other:9000");
        assert_eq!(snapshot.metadata["site"], "lab");
        assert_eq!(snapshot.metadata["rack"], 4);
        let boot = snapshot.auto_boot.unwrap();
        assert!(!boot.enabled);
        assert_eq!(boot.connectors, vec![1, 2]);
        assert_eq!(boot.charge_point_vendor, "Solidstudio");
        assert_eq!(manager.config("CP-1").unwrap().basic_auth_password.as_deref(), Some("pw"));

        let bad = StationPatch {
            auto_boot: Some(BootOverrides { connectors: Some(vec![0]), ..Default::default() }),
            ..Default::default()
        };
        assert!(matches!(manager.update("CP-1", bad), Err(ManagerError::InvalidPatch(_))));
    }

    #[tokio::test]
    async fn test_send_action_requires_connection() {
        let manager = StationManager::default();
        manager.create(config("CP-1"), offline()).await.unwrap();
        let outcome = manager.send_action("CP-1", "Heartbeat", json!({}));
        assert!(matches!(outcome, Err(ManagerError::Station(StationError::NotConnected))));
    }

    #[tokio::test]
    async fn test_listener_transitions() {
        let managed = ManagedStation::new(config("CP-1"));

        managed.set_status(StationStatus::Bootstrapping, "test");
        managed.observe(StationEvent::BootAccepted { interval_secs: 60 });
        assert_eq!(managed.status(), StationStatus::Bootstrapping);
        assert!(managed.snapshot().last_boot_accepted_at.is_some());

        managed.set_status(StationStatus::Connected, "test");
        managed.observe(StationEvent::BootAccepted { interval_secs: 60 });
        assert_eq!(managed.status(), StationStatus::Ready);

        managed.observe(StationEvent::Disconnected { code: None, reason: "reset".into(), expected: true });
        assert_eq!(managed.status(), StationStatus::Ready);

        managed.observe(StationEvent::Disconnected { code: Some(1006), reason: "reset".into(), expected: false });
        let snapshot = managed.snapshot();
        assert_eq!(snapshot.status, StationStatus::Error);
        assert_eq!(snapshot.last_error.as_deref(), Some("disconnected (unexpected): reset"));
    }

    #[tokio::test]
    async fn test_stopped_is_sticky() {
        let managed = ManagedStation::new(config("CP-1"));
        managed.set_status(StationStatus::Stopped, "test");

        managed.observe(StationEvent::BootAccepted { interval_secs: 60 });
        managed.fail("late failure".into());
        assert_eq!(managed.status(), StationStatus::Stopped);
        assert!(managed.snapshot().last_error.is_none());

        assert!(managed.set_status(StationStatus::Connecting, "reconnect"));
    }

    #[test]
    fn test_snapshot_shape() {
        let managed = ManagedStation::new(config("CP-1").with_serial("SN-1"));
        let value = serde_json::to_value(managed.snapshot()).unwrap();
        assert_eq!(value["status"], "idle");
        assert_eq!(value["ocppVersion"], "OCPP_1.6");
        assert_eq!(value["chargePointSerialNumber"], "SN-1");
        assert!(value.get("error").is_none());
        assert!(value.get("createdAt").is_some());
    }
}
