//! OCPP-J protocol layer
//!
//! - `messages`: JSON-RPC framing (CALL, CALLRESULT, CALLERROR)
//! - `outbox`: correlation of sent requests with their answers
//! - `revision`: supported protocol revisions and subprotocol tokens
//! - `v16`: OCPP 1.6 payload types
//! - `v2x`: OCPP 2.0.1 / 2.1 payload types

pub mod messages;
pub mod outbox;
pub mod revision;
pub mod v16;
pub mod v2x;

pub use messages::*;
pub use outbox::Outbox;
pub use revision::Revision;
