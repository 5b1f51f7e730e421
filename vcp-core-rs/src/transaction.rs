//! Transaction and connector bookkeeping
//!
//! Tracks active charging sessions, connectors reserved between a start
//! request and the transaction actually starting, and the synthetic energy
//! meter. A connector is free, reserved, or in a transaction, never two of
//! these at once.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Period of the meter sampling timer (simulation parameter)
pub const METER_SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

/// Simulated energy ramp: one Wh per this many elapsed milliseconds
pub const METER_MS_PER_WH: f64 = 100.0;

/// Transaction id: CSMS-assigned integer (1.6) or station-generated string (2.x)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransactionId {
    Int(i64),
    Text(String),
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionId::Int(id) => write!(f, "{}", id),
            TransactionId::Text(id) => f.write_str(id),
        }
    }
}

impl From<i64> for TransactionId {
    fn from(id: i64) -> Self {
        TransactionId::Int(id)
    }
}

impl From<String> for TransactionId {
    fn from(id: String) -> Self {
        TransactionId::Text(id)
    }
}

impl From<&str> for TransactionId {
    fn from(id: &str) -> Self {
        TransactionId::Text(id.to_string())
    }
}

/// Reading handed to the sampling callback on every tick
#[derive(Debug, Clone, PartialEq)]
pub struct MeterSample {
    pub transaction_id: TransactionId,
    pub connector_id: u32,
    pub evse_id: Option<u32>,
    pub id_tag: String,
    /// Cumulative Wh
    pub meter_value: f64,
}

pub type SampleCallback = Arc<dyn Fn(MeterSample) + Send + Sync>;

/// Active charging session
pub struct Transaction {
    pub transaction_id: TransactionId,
    pub connector_id: u32,
    pub evse_id: Option<u32>,
    pub id_tag: String,
    pub started_at: DateTime<Utc>,
    pub meter_start: f64,
    started: Instant,
    seq_no: u32,
    sampler: JoinHandle<()>,
}

impl Transaction {
    pub fn meter_value(&self) -> f64 {
        meter_at(self.meter_start, self.started, Instant::now())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.sampler.abort();
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("transaction_id", &self.transaction_id)
            .field("connector_id", &self.connector_id)
            .field("evse_id", &self.evse_id)
            .field("id_tag", &self.id_tag)
            .field("meter_start", &self.meter_start)
            .finish()
    }
}

/// What remains of a transaction once it is stopped
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedTransaction {
    pub transaction_id: TransactionId,
    pub connector_id: u32,
    pub evse_id: Option<u32>,
    pub id_tag: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub meter_start: f64,
    pub meter_stop: f64,
}

fn meter_at(meter_start: f64, started: Instant, now: Instant) -> f64 {
    let elapsed_ms = now.saturating_duration_since(started).as_millis() as f64;
    meter_start + elapsed_ms / METER_MS_PER_WH
}

/// Per-station transaction and connector state
#[derive(Debug, Default)]
pub struct TransactionBook {
    transactions: HashMap<TransactionId, Transaction>,
    reserved: BTreeSet<u32>,
    connector_meters: HashMap<u32, f64>,
}

impl TransactionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff the connector has neither an active transaction nor a reservation
    pub fn can_start(&self, connector_id: u32) -> bool {
        !self.reserved.contains(&connector_id) && self.active_on(connector_id).is_none()
    }

    /// Reserve the connector; fails without side effects unless `can_start` holds
    pub fn reserve(&mut self, connector_id: u32) -> bool {
        if !self.can_start(connector_id) {
            return false;
        }
        self.reserved.insert(connector_id)
    }

    pub fn release(&mut self, connector_id: u32) {
        self.reserved.remove(&connector_id);
    }

    /// Clear every reservation, returning the released connector ids in ascending order
    pub fn release_all(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.reserved).into_iter().collect()
    }

    pub fn is_reserved(&self, connector_id: u32) -> bool {
        self.reserved.contains(&connector_id)
    }

    /// Begin a transaction and arm its sampling timer.
    ///
    /// Must be called inside a tokio runtime. The first sample fires one
    /// full period after the start.
    pub fn start(
        &mut self,
        connector_id: u32,
        transaction_id: TransactionId,
        id_tag: impl Into<String>,
        evse_id: Option<u32>,
        on_sample: SampleCallback,
    ) {
        self.release(connector_id);
        let meter_start = self.connector_meter(connector_id);
        let started = Instant::now();
        let id_tag = id_tag.into();

        let sample_template = MeterSample {
            transaction_id: transaction_id.clone(),
            connector_id,
            evse_id,
            id_tag: id_tag.clone(),
            meter_value: meter_start,
        };
        let sampler = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(started + METER_SAMPLE_INTERVAL, METER_SAMPLE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                on_sample(MeterSample {
                    meter_value: meter_at(meter_start, started, Instant::now()),
                    ..sample_template.clone()
                });
            }
        });

        let transaction = Transaction {
            transaction_id: transaction_id.clone(),
            connector_id,
            evse_id,
            id_tag,
            started_at: Utc::now(),
            meter_start,
            started,
            seq_no: 0,
            sampler,
        };
        self.transactions.insert(transaction_id, transaction);
    }

    /// Stop a transaction. Unknown ids are a no-op.
    pub fn stop(&mut self, transaction_id: &TransactionId) -> Option<ClosedTransaction> {
        let transaction = self.transactions.remove(transaction_id)?;
        let meter_stop = transaction.meter_value();
        self.connector_meters.insert(transaction.connector_id, meter_stop);

        Some(ClosedTransaction {
            transaction_id: transaction.transaction_id.clone(),
            connector_id: transaction.connector_id,
            evse_id: transaction.evse_id,
            id_tag: transaction.id_tag.clone(),
            started_at: transaction.started_at,
            stopped_at: Utc::now(),
            meter_start: transaction.meter_start,
            meter_stop,
        })
    }

    /// Current synthetic reading in Wh, 0 for unknown transactions
    pub fn meter_value(&self, transaction_id: &TransactionId) -> f64 {
        self.transactions
            .get(transaction_id)
            .map(Transaction::meter_value)
            .unwrap_or(0.0)
    }

    /// Last cumulative reading of a connector, 0 if it never charged
    pub fn connector_meter(&self, connector_id: u32) -> f64 {
        self.connector_meters.get(&connector_id).copied().unwrap_or(0.0)
    }

    pub fn get(&self, transaction_id: &TransactionId) -> Option<&Transaction> {
        self.transactions.get(transaction_id)
    }

    pub fn active_on(&self, connector_id: u32) -> Option<&Transaction> {
        self.transactions.values().find(|t| t.connector_id == connector_id)
    }

    /// Next event sequence number for a transaction (starts at 1; 0 is the start event)
    pub fn next_seq(&mut self, transaction_id: &TransactionId) -> Option<u32> {
        let transaction = self.transactions.get_mut(transaction_id)?;
        transaction.seq_no += 1;
        Some(transaction.seq_no)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
