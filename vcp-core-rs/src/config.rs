//! Fleet configuration
//!
//! Stations come from a JSON runtime config file or, when the file does not
//! exist, from environment variables. Each station entry is merged with the
//! file's `defaults` block; station values win.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::ocpp::Revision;

pub const CONFIG_FILE_ENV: &str = "VCP_CONFIG_FILE";
pub const DEFAULT_CONFIG_PATH: &str = "config/vcps.json";
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8092";

const DEFAULT_STATION_IDS: [&str; 3] = ["CP-001", "CP-002", "CP-003"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Parameters of the boot sequence run after connecting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "BootOverrides")]
pub struct BootConfig {
    pub enabled: bool,
    pub charge_point_vendor: String,
    pub charge_point_model: String,
    pub firmware_version: String,
    /// Physical connector ids, never 0
    pub connectors: Vec<u32>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            charge_point_vendor: "Solidstudio".to_string(),
            charge_point_model: "VirtualChargePoint".to_string(),
            firmware_version: "1.0.0".to_string(),
            connectors: vec![1],
        }
    }
}

impl BootConfig {
    pub fn disabled() -> Self {
        Self { enabled: false, ..Default::default() }
    }

    pub fn with_vendor(mut self, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        self.charge_point_vendor = vendor.into();
        self.charge_point_model = model.into();
        self
    }

    pub fn with_firmware(mut self, version: impl Into<String>) -> Self {
        self.firmware_version = version.into();
        self
    }

    /// Connectors `1..=count`
    pub fn with_connector_count(mut self, count: u32) -> Self {
        self.connectors = (1..=count).collect();
        self
    }
}

/// Partial `autoBoot` block; present fields replace those of a base config
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootOverrides {
    pub enabled: Option<bool>,
    pub charge_point_vendor: Option<String>,
    pub charge_point_model: Option<String>,
    pub firmware_version: Option<String>,
    pub connectors: Option<Vec<u32>>,
    pub connectors_per_charge_point: Option<u32>,
}

impl BootOverrides {
    pub fn apply_to(self, base: BootConfig) -> Result<BootConfig, String> {
        let connectors = match (self.connectors, self.connectors_per_charge_point) {
            (Some(connectors), _) => connectors,
            (None, Some(count)) => (1..=count).collect(),
            (None, None) => base.connectors,
        };
        if connectors.is_empty() {
            return Err("autoBoot needs at least one connector".to_string());
        }
        if connectors.contains(&0) {
            return Err("connector 0 is the central connector and cannot be configured".to_string());
        }

        Ok(BootConfig {
            enabled: self.enabled.unwrap_or(base.enabled),
            charge_point_vendor: self.charge_point_vendor.unwrap_or(base.charge_point_vendor),
            charge_point_model: self.charge_point_model.unwrap_or(base.charge_point_model),
            firmware_version: self.firmware_version.unwrap_or(base.firmware_version),
            connectors,
        })
    }
}

impl TryFrom<BootOverrides> for BootConfig {
    type Error = String;

    fn try_from(raw: BootOverrides) -> Result<Self, Self::Error> {
        raw.apply_to(BootConfig::default())
    }
}

/// Resolved configuration of one station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VcpConfig {
    pub id: String,
    pub ocpp_version: Revision,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_boot: Option<BootConfig>,
}

impl VcpConfig {
    pub fn new(id: impl Into<String>, ocpp_version: Revision, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ocpp_version,
            endpoint: endpoint.into(),
            basic_auth_password: None,
            charge_point_serial_number: None,
            metadata: Map::new(),
            auto_boot: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.basic_auth_password = Some(password.into());
        self
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.charge_point_serial_number = Some(serial.into());
        self
    }

    pub fn with_auto_boot(mut self, auto_boot: BootConfig) -> Self {
        self.auto_boot = Some(auto_boot);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Connectors the station reports, `[1]` without an auto-boot block
    pub fn connectors(&self) -> Vec<u32> {
        self.auto_boot
            .as_ref()
            .map(|boot| boot.connectors.clone())
            .unwrap_or_else(|| vec![1])
    }
}

/// `defaults` block of the runtime config file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetDefaults {
    pub endpoint: Option<String>,
    pub basic_auth_password: Option<String>,
    pub auto_boot: Option<BootConfig>,
}

/// One entry of the `vcps` list before merging with the defaults
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VcpEntry {
    pub id: String,
    pub ocpp_version: Revision,
    pub endpoint: Option<String>,
    pub basic_auth_password: Option<String>,
    pub charge_point_serial_number: Option<String>,
    pub metadata: Option<Map<String, Value>>,
    /// Merged field by field over `defaults.autoBoot`
    pub auto_boot: Option<BootOverrides>,
}

/// Runtime config file contents
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    #[serde(default)]
    pub defaults: FleetDefaults,
    pub boot_timeout_secs: Option<u64>,
    #[serde(default)]
    pub vcps: Vec<VcpEntry>,
}

/// Stations ready to be created, plus fleet-wide settings
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub vcps: Vec<VcpConfig>,
    pub boot_timeout: Option<Duration>,
}

impl RuntimeConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Merge every station entry with the defaults
    pub fn resolve(self) -> Result<ResolvedConfig, ConfigError> {
        if self.vcps.is_empty() {
            return Err(ConfigError::Invalid("no stations configured".to_string()));
        }

        let defaults = self.defaults;
        let vcps = self
            .vcps
            .into_iter()
            .enumerate()
            .map(|(index, entry)| {
                if entry.id.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!("station #{} has an empty id", index + 1)));
                }
                let auto_boot = match entry.auto_boot {
                    Some(overrides) => Some(
                        overrides
                            .apply_to(defaults.auto_boot.clone().unwrap_or_default())
                            .map_err(|reason| ConfigError::Invalid(format!("station {}: {}", entry.id, reason)))?,
                    ),
                    None => defaults.auto_boot.clone(),
                };
                let charge_point_serial_number = entry
                    .charge_point_serial_number
                    .unwrap_or_else(|| format!("{}-S{:03}", entry.id, index + 1));
                Ok(VcpConfig {
                    endpoint: entry
                        .endpoint
                        .or_else(|| defaults.endpoint.clone())
                        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
                    basic_auth_password: entry.basic_auth_password.or_else(|| defaults.basic_auth_password.clone()),
                    charge_point_serial_number: Some(charge_point_serial_number),
                    metadata: entry.metadata.unwrap_or_default(),
                    auto_boot,
                    id: entry.id,
                    ocpp_version: entry.ocpp_version,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ResolvedConfig {
            vcps,
            boot_timeout: self.boot_timeout_secs.map(Duration::from_secs),
        })
    }

    /// Build the config from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable lookup
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let endpoint = lookup("WS_URL").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let password = lookup("PASSWORD");

        let ids: Vec<String> = match (lookup("CP_IDS"), lookup("CP_ID")) {
            (Some(ids), _) => ids
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect(),
            (None, Some(id)) => vec![id],
            (None, None) => DEFAULT_STATION_IDS.iter().map(|id| id.to_string()).collect(),
        };

        let ocpp_version = lookup("OCPP_VERSION")
            .map(|raw| parse_version_env(&raw))
            .unwrap_or(Revision::Ocpp16);
        let connectors = match lookup("CONNECTORS_PER_CP") {
            Some(raw) => parse_number::<u32>("CONNECTORS_PER_CP", &raw)?,
            None => 1,
        };
        if connectors == 0 {
            return Err(ConfigError::Invalid("CONNECTORS_PER_CP must be at least 1".to_string()));
        }
        let auto_boot_disabled = lookup("AUTO_BOOT_DISABLED").is_some_and(|raw| raw.eq_ignore_ascii_case("true"));

        let defaults = BootConfig::default();
        let auto_boot = BootConfig {
            enabled: !auto_boot_disabled,
            charge_point_vendor: lookup("CHARGE_POINT_VENDOR").unwrap_or(defaults.charge_point_vendor),
            charge_point_model: lookup("CHARGE_POINT_MODEL").unwrap_or(defaults.charge_point_model),
            firmware_version: lookup("FIRMWARE_VERSION").unwrap_or(defaults.firmware_version),
            connectors: (1..=connectors).collect(),
        };

        let serial = lookup("CHARGE_POINT_SERIAL_NUMBER");
        let vcps = ids
            .into_iter()
            .map(|id| VcpEntry {
                id,
                ocpp_version,
                endpoint: Some(endpoint.clone()),
                basic_auth_password: password.clone(),
                charge_point_serial_number: serial.clone(),
                metadata: None,
                auto_boot: None,
            })
            .collect();

        let boot_timeout_secs = match lookup("BOOT_TIMEOUT_SECS") {
            Some(raw) => Some(parse_number::<u64>("BOOT_TIMEOUT_SECS", &raw)?),
            None => None,
        };

        Ok(Self {
            defaults: FleetDefaults {
                endpoint: Some(endpoint),
                basic_auth_password: password,
                auto_boot: Some(auto_boot),
            },
            boot_timeout_secs,
            vcps,
        })
    }
}

/// `OCPP_VERSION` is matched loosely: anything naming 2.1 or 2.0.1 selects it
fn parse_version_env(raw: &str) -> Revision {
    if raw.contains("2.1") {
        Revision::Ocpp21
    } else if raw.contains("2.0.1") {
        Revision::Ocpp201
    } else {
        Revision::Ocpp16
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{} is not a number: {:?}", key, raw)))
}

/// Config file path: the explicit argument, else `VCP_CONFIG_FILE`, else the default
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_FILE_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load the fleet config, falling back to the environment when the file is missing
pub fn load(explicit: Option<&Path>) -> Result<ResolvedConfig, ConfigError> {
    let path = config_path(explicit);
    match std::fs::read_to_string(&path) {
        Ok(text) => {
            info!(path = %path.display(), "Loading fleet config");
            RuntimeConfig::from_json(&text)?.resolve()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                path = %path.display(),
                "Config file not found, falling back to environment defaults"
            );
            RuntimeConfig::from_env()?.resolve()
        }
        Err(e) => Err(e.into()),
    }
}
