//! Versioned action catalogs
//!
//! One immutable table per protocol revision maps action names to their
//! request/response schemas and handlers. The station and the fleet manager
//! only pick a catalog; everything that differs between revisions (payload
//! shapes, boot and status builders, error spellings) lives behind it.
//!
//! | Revision | Catalog builder |
//! |----------|-----------------|
//! | OCPP 1.6 | [`v16::catalog`] |
//! | OCPP 2.0.1 / 2.1 | [`v2x::catalog`] |

pub mod store;
pub mod v16;
pub mod v2x;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, warn};

use crate::ocpp::{Call, CallResult, ErrorCode, OcppError, Revision};
use crate::station::{Station, StationError, StationEvent};

pub use store::{ConfigStore, ConfigWrite, HEARTBEAT_INTERVAL_KEY};

/// Payload check: `Ok` when the payload matches the action's schema
pub type Validator = fn(&Value) -> Result<(), String>;

/// Handles a CALL from the central system; sends exactly one response
pub type RequestHandler = fn(&Arc<Station>, &Call) -> Result<(), StationError>;

/// Handles the CALLRESULT answering one of the station's own requests
pub type ResultHandler = fn(&Arc<Station>, &Call, &CallResult) -> Result<(), StationError>;

/// Schema validator generated from a typed payload
pub fn schema<T: DeserializeOwned>(payload: &Value) -> Result<(), String> {
    T::deserialize(payload).map(|_| ()).map_err(|e| e.to_string())
}

/// Action the central system may invoke on the station
#[derive(Clone, Copy)]
pub struct IncomingAction {
    pub request: Validator,
    pub response: Validator,
    pub handler: RequestHandler,
}

/// Action the station may invoke on the central system
#[derive(Clone, Copy)]
pub struct OutgoingAction {
    pub request: Validator,
    pub response: Validator,
    pub on_result: Option<ResultHandler>,
}

/// Identity sent in the boot request
#[derive(Debug, Clone, PartialEq)]
pub struct BootInfo {
    pub vendor: String,
    pub model: String,
    pub firmware_version: Option<String>,
    pub serial_number: String,
}

/// Action table and revision-specific builders for one protocol revision
pub struct Catalog {
    pub revision: Revision,
    pub incoming: HashMap<&'static str, IncomingAction>,
    pub outgoing: HashMap<&'static str, OutgoingAction>,
    /// Error code answering a request that fails its schema
    pub format_violation: ErrorCode,
    pub boot_request: fn(&BootInfo) -> Result<Call, OcppError>,
    /// StatusNotification reporting the connector (EVSE) as available
    pub available_status: fn(u32) -> Result<Call, OcppError>,
    pub heartbeat_request: fn() -> Result<Call, OcppError>,
    /// Whether auto-boot reports the central connector 0
    pub reports_central_connector: bool,
    /// Serial number used when the station config has none
    pub default_serial: fn(&str) -> String,
}

impl Catalog {
    /// Catalog for a revision, built on first use
    pub fn for_revision(revision: Revision) -> &'static Catalog {
        static V16: OnceLock<Catalog> = OnceLock::new();
        static V201: OnceLock<Catalog> = OnceLock::new();
        static V21: OnceLock<Catalog> = OnceLock::new();

        match revision {
            Revision::Ocpp16 => V16.get_or_init(v16::catalog),
            Revision::Ocpp201 => V201.get_or_init(|| v2x::catalog(Revision::Ocpp201)),
            Revision::Ocpp21 => V21.get_or_init(|| v2x::catalog(Revision::Ocpp21)),
        }
    }

    pub fn incoming(&self, action: &str) -> Option<&IncomingAction> {
        self.incoming.get(action)
    }

    pub fn outgoing(&self, action: &str) -> Option<&OutgoingAction> {
        self.outgoing.get(action)
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut incoming: Vec<_> = self.incoming.keys().collect();
        let mut outgoing: Vec<_> = self.outgoing.keys().collect();
        incoming.sort();
        outgoing.sort();
        f.debug_struct("Catalog")
            .field("revision", &self.revision)
            .field("incoming", &incoming)
            .field("outgoing", &outgoing)
            .finish()
    }
}

/// Accepted boot: arm the heartbeat and signal whoever waits on the boot
pub(crate) fn boot_accepted(station: &Arc<Station>, interval_secs: i64) {
    let interval_secs = if interval_secs > 0 {
        let interval = interval_secs.to_string();
        station.settings().force(HEARTBEAT_INTERVAL_KEY, &interval);
        interval_secs as u64
    } else {
        station.settings().heartbeat_interval_secs()
    };

    info!(station = %station.id(), interval_secs, "BootNotification accepted");
    station.configure_heartbeat(Duration::from_secs(interval_secs));
    station.emit(StationEvent::BootAccepted { interval_secs });
}

pub(crate) fn boot_not_accepted(station: &Station, status: impl std::fmt::Debug) {
    warn!(station = %station.id(), ?status, "BootNotification not accepted");
}

/// Write a configuration key, re-arming the heartbeat when its interval changes
pub(crate) fn write_setting(station: &Arc<Station>, key: &str, value: &str) -> ConfigWrite {
    let outcome = station.settings().set(key, value);
    if outcome == ConfigWrite::Accepted && key == HEARTBEAT_INTERVAL_KEY {
        let secs = station.settings().heartbeat_interval_secs();
        station.configure_heartbeat(Duration::from_secs(secs));
    }
    outcome
}

/// Push a connector id into `affected` once, preserving first-seen order
pub(crate) fn note_connector(affected: &mut Vec<u32>, connector_id: u32) {
    if !affected.contains(&connector_id) {
        affected.push(connector_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_catalogs_are_shared() {
        let a = Catalog::for_revision(Revision::Ocpp16);
        let b = Catalog::for_revision(Revision::Ocpp16);
        assert!(std::ptr::eq(a, b));
        assert_eq!(Catalog::for_revision(Revision::Ocpp21).revision, Revision::Ocpp21);
    }

    #[test]
    fn test_revision_specific_data() {
        let v16 = Catalog::for_revision(Revision::Ocpp16);
        let v201 = Catalog::for_revision(Revision::Ocpp201);

        assert_eq!(v16.format_violation, ErrorCode::FormationViolation);
        assert_eq!(v201.format_violation, ErrorCode::FormatViolation);
        assert!(v16.reports_central_connector);
        assert!(!v201.reports_central_connector);
        assert_eq!((v16.default_serial)("CP-1"), "CP-1-S001");
        assert_eq!((v201.default_serial)("CP-1"), "CP-1");
    }

    #[test]
    fn test_action_sets() {
        let v16 = Catalog::for_revision(Revision::Ocpp16);
        for action in ["RemoteStartTransaction", "RemoteStopTransaction", "StartTransaction", "StopTransaction"] {
            assert!(v16.incoming(action).is_some(), "{}", action);
        }
        assert!(v16.outgoing("TransactionEvent").is_none());

        for revision in [Revision::Ocpp201, Revision::Ocpp21] {
            let catalog = Catalog::for_revision(revision);
            assert!(catalog.incoming("RequestStartTransaction").is_some());
            assert!(catalog.outgoing("TransactionEvent").is_some());
            assert!(catalog.incoming("RemoteStartTransaction").is_none());
        }
    }

    #[test]
    fn test_builders_pass_own_schemas() {
        let boot = BootInfo {
            vendor: "Solidstudio".into(),
            model: "VirtualChargePoint".into(),
            firmware_version: Some("1.0.0".into()),
            serial_number: "CP-1-S001".into(),
        };
        for revision in Revision::ALL {
            let catalog = Catalog::for_revision(revision);
            for call in [
                (catalog.boot_request)(&boot).unwrap(),
                (catalog.available_status)(1).unwrap(),
                (catalog.heartbeat_request)().unwrap(),
            ] {
                let entry = catalog.outgoing(&call.action).unwrap();
                assert!((entry.request)(&call.payload).is_ok(), "{} {}", revision, call.action);
            }
        }
    }

    #[test]
    fn test_schema_validator() {
        #[derive(serde::Deserialize)]
        #[allow(dead_code)]
        struct Req {
            id: u32,
        }
        assert!(schema::<Req>(&json!({"id": 1})).is_ok());
        assert!(schema::<Req>(&json!({"id": "1"})).is_err());
        assert!(schema::<Req>(&json!({})).is_err());
    }

    #[test]
    fn test_note_connector() {
        let mut affected = vec![2];
        note_connector(&mut affected, 1);
        note_connector(&mut affected, 2);
        assert_eq!(affected, vec![2, 1]);
    }
}
