//! Supported OCPP-J protocol revisions

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// OCPP protocol revision spoken by a station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Revision {
    #[serde(rename = "OCPP_1.6")]
    Ocpp16,
    #[serde(rename = "OCPP_2.0.1")]
    Ocpp201,
    #[serde(rename = "OCPP_2.1")]
    Ocpp21,
}

impl Revision {
    pub const ALL: [Revision; 3] = [Revision::Ocpp16, Revision::Ocpp201, Revision::Ocpp21];

    /// WebSocket subprotocol token negotiated for this revision
    pub fn subprotocol(self) -> &'static str {
        match self {
            Revision::Ocpp16 => "ocpp1.6",
            Revision::Ocpp201 => "ocpp2.0.1",
            Revision::Ocpp21 => "ocpp2.1",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Revision::Ocpp16 => "OCPP_1.6",
            Revision::Ocpp201 => "OCPP_2.0.1",
            Revision::Ocpp21 => "OCPP_2.1",
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Revision {
    type Err = String;

    /// Accepts `1.6`, `ocpp1.6`, `OCPP_1.6` and the same spellings of 2.0.1 / 2.1
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let version = normalized
            .trim_start_matches("ocpp")
            .trim_start_matches(['_', ' ', '-']);
        match version {
            "1.6" | "16" => Ok(Revision::Ocpp16),
            "2.0.1" | "201" => Ok(Revision::Ocpp201),
            "2.1" | "21" => Ok(Revision::Ocpp21),
            _ => Err(format!("unsupported OCPP version: {}", s)),
        }
    }
}
