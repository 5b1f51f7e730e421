//! # VCP Core
//!
//! Protocol engine for virtual OCPP-J charge points. Each simulated station
//! holds one WebSocket connection to a CSMS, speaks OCPP 1.6, 2.0.1 or 2.1,
//! answers CSMS requests and runs simulated charging sessions.
//!
//! ## Architecture
//!
//! ```text
//! OCPP CSMS (Backend)
//!       ▲ WebSocket, OCPP-J frames
//!       │
//! ┌─────┴──────────────────────────────────────┐
//! │  StationManager (fleet, lifecycle, boot)   │
//! │   ┌──────────┐ ┌──────────┐ ┌──────────┐   │
//! │   │ Station  │ │ Station  │ │ Station  │   │
//! │   │ outbox   │ │ outbox   │ │ outbox   │   │
//! │   │ tx book  │ │ tx book  │ │ tx book  │   │
//! │   └────┬─────┘ └──────────┘ └──────────┘   │
//! │        │ dispatch by action                │
//! │   ┌────▼────────────────────────────┐      │
//! │   │ Catalog: 1.6 │ 2.0.1 │ 2.1      │      │
//! │   └─────────────────────────────────┘      │
//! └────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use vcp_core::{config, CreateOptions, StationManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let resolved = config::load(None)?;
//!     let manager = StationManager::new(resolved.boot_timeout);
//!     manager.seed(resolved.vcps, CreateOptions::default()).await;
//!
//!     tokio::signal::ctrl_c().await?;
//!     manager.shutdown();
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod manager;
pub mod ocpp;
pub mod signed_meter;
pub mod station;
pub mod transaction;

pub use catalog::{BootInfo, Catalog, ConfigStore};
pub use config::{BootConfig, BootOverrides, ConfigError, ResolvedConfig, RuntimeConfig, VcpConfig};
pub use manager::{
    CreateOptions, ManagerError, StationManager, StationPatch, StationSnapshot, StationStatus,
};
pub use ocpp::{Call, CallError, CallResult, ErrorCode, OcppError, OcppMessage, Revision};
pub use station::{Station, StationError, StationEvent, StationOptions};
pub use transaction::{ClosedTransaction, Transaction, TransactionBook, TransactionId};
