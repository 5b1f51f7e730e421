//! OCPP-J message framing
//!
//! Every OCPP-J frame is a JSON array whose first element tags its kind:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! The codec checks the array shape and the exact JSON types of the framing
//! fields. Payloads are opaque here; the action catalogs validate them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP error codes (1.6 spells the schema failure `FormationViolation`,
/// 2.x spells it `FormatViolation`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    FormationViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Errors in OCPP message framing
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid message format: {0}")]
    InvalidFormat(&'static str),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with auto-generated ID
    pub fn new(action: impl Into<String>, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            action: action.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Decode the payload into the action's typed request
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, OcppError> {
        Ok(T::deserialize(&self.payload)?)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    /// Create a new CALLRESULT message
    pub fn new(message_id: impl Into<String>, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: message_id.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, OcppError> {
        Ok(T::deserialize(&self.payload)?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a new CALLERROR message with empty details
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Decode an OCPP message from wire text
    pub fn decode(text: &str) -> Result<Self, OcppError> {
        let value: Value = serde_json::from_str(text)?;
        let array = value
            .as_array()
            .ok_or(OcppError::InvalidFormat("frame is not a JSON array"))?;

        let msg_type = array
            .first()
            .ok_or(OcppError::InvalidFormat("empty frame"))?
            .as_i64()
            .ok_or(OcppError::InvalidFormat("message type is not an integer"))?;

        match msg_type {
            2 => {
                if array.len() != 4 {
                    return Err(OcppError::InvalidFormat("CALL must have 4 elements"));
                }
                Ok(OcppMessage::Call(Call {
                    message_id: string_at(array, 1, "message id is not a string")?,
                    action: string_at(array, 2, "action is not a string")?,
                    payload: array[3].clone(),
                }))
            }
            3 => {
                if array.len() != 3 {
                    return Err(OcppError::InvalidFormat("CALLRESULT must have 3 elements"));
                }
                Ok(OcppMessage::CallResult(CallResult {
                    message_id: string_at(array, 1, "message id is not a string")?,
                    payload: array[2].clone(),
                }))
            }
            4 => {
                if !(4..=5).contains(&array.len()) {
                    return Err(OcppError::InvalidFormat("CALLERROR must have 4 or 5 elements"));
                }
                let error_code_str = string_at(array, 2, "error code is not a string")?;
                // Codes outside the known set still correlate; they degrade to GenericError.
                let error_code: ErrorCode =
                    serde_json::from_value(Value::String(error_code_str)).unwrap_or(ErrorCode::GenericError);

                Ok(OcppMessage::CallError(CallError {
                    message_id: string_at(array, 1, "message id is not a string")?,
                    error_code,
                    error_description: string_at(array, 3, "error description is not a string")?,
                    // Details are optional on the wire
                    error_details: array
                        .get(4)
                        .cloned()
                        .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
                }))
            }
            _ => Err(OcppError::UnknownMessageType(msg_type)),
        }
    }

    /// Encode to OCPP wire text
    pub fn encode(&self) -> Result<String, OcppError> {
        let array = match self {
            OcppMessage::Call(c) => serde_json::json!([
                MessageType::Call as i32,
                &c.message_id,
                &c.action,
                &c.payload
            ]),
            OcppMessage::CallResult(r) => serde_json::json!([
                MessageType::CallResult as i32,
                &r.message_id,
                &r.payload
            ]),
            OcppMessage::CallError(e) => serde_json::json!([
                MessageType::CallError as i32,
                &e.message_id,
                e.error_code.to_string(),
                &e.error_description,
                &e.error_details
            ]),
        };
        Ok(serde_json::to_string(&array)?)
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }
}

fn string_at(array: &[Value], index: usize, reason: &'static str) -> Result<String, OcppError> {
    array[index]
        .as_str()
        .map(str::to_string)
        .ok_or(OcppError::InvalidFormat(reason))
}
