//! Signed meter records (OCMF)
//!
//! A closed transaction's start and end readings are encoded as
//! `OCMF|<payload>|<signature>` and signed with ECDSA P-256 / SHA-256.
//! Every station signs with the same fixed key, so a single public key
//! verifies records from the whole fleet.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ocpp::v2x;
use crate::transaction::ClosedTransaction;

pub const ENCODING_METHOD: &str = "OCMF";
pub const SIGNING_METHOD: &str = "ECDSA-secp256r1-SHA256";

/// Fixed simulator signing secret
const SIGNING_SECRET: [u8; 32] = [0x1d; 32];

#[derive(Debug, Error)]
pub enum SignError {
    #[error("signing key error: {0}")]
    Key(#[from] p256::ecdsa::Error),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed OCMF record: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcmfReading {
    #[serde(rename = "TM")]
    pub time: String,
    #[serde(rename = "TX")]
    pub kind: String,
    #[serde(rename = "RV")]
    pub value: f64,
    #[serde(rename = "RU")]
    pub unit: String,
    #[serde(rename = "ST")]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcmfPayload {
    #[serde(rename = "FV")]
    pub format_version: String,
    #[serde(rename = "GI")]
    pub gateway_id: String,
    #[serde(rename = "PG")]
    pub pagination: String,
    #[serde(rename = "IT")]
    pub identification_type: String,
    #[serde(rename = "ID")]
    pub identification: String,
    #[serde(rename = "RD")]
    pub readings: Vec<OcmfReading>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OcmfSignature {
    #[serde(rename = "SA")]
    algorithm: String,
    #[serde(rename = "SD")]
    data: String,
}

/// Base64 record plus the key that verifies it
#[derive(Debug, Clone, PartialEq)]
pub struct SignedMeterRecord {
    pub signed_meter_data: String,
    pub public_key: String,
}

impl SignedMeterRecord {
    /// JSON text carried as the value of a 1.6 `SignedData` sampled value
    pub fn to_v16_value(&self) -> Result<String, SignError> {
        Ok(serde_json::to_string(&serde_json::json!({
            "signedMeterData": self.signed_meter_data,
            "encodingMethod": ENCODING_METHOD,
            "publicKey": self.public_key,
        }))?)
    }

    pub fn to_v2x(&self) -> v2x::SignedMeterValue {
        v2x::SignedMeterValue {
            signed_meter_data: self.signed_meter_data.clone(),
            signing_method: SIGNING_METHOD.to_string(),
            encoding_method: ENCODING_METHOD.to_string(),
            public_key: self.public_key.clone(),
        }
    }
}

fn signing_key() -> Result<SigningKey, SignError> {
    Ok(SigningKey::from_slice(&SIGNING_SECRET)?)
}

/// Base64 SEC1 (uncompressed) public key of the fleet signing key
pub fn public_key() -> Result<String, SignError> {
    let verifying_key = VerifyingKey::from(&signing_key()?);
    Ok(BASE64.encode(verifying_key.to_encoded_point(false).as_bytes()))
}

fn ocmf_time(time: DateTime<Utc>) -> String {
    format!("{} S", time.format("%Y-%m-%dT%H:%M:%S,%3f%z"))
}

/// Build and sign the record for a closed transaction
pub fn sign(station_id: &str, closed: &ClosedTransaction) -> Result<SignedMeterRecord, SignError> {
    let reading = |time, kind: &str, wh: f64| OcmfReading {
        time: ocmf_time(time),
        kind: kind.to_string(),
        value: wh / 1000.0,
        unit: "kWh".to_string(),
        status: "G".to_string(),
    };
    let payload = OcmfPayload {
        format_version: "1.0".to_string(),
        gateway_id: station_id.to_string(),
        pagination: "T1".to_string(),
        identification_type: "ISO14443".to_string(),
        identification: closed.id_tag.clone(),
        readings: vec![
            reading(closed.started_at, "B", closed.meter_start),
            reading(closed.stopped_at, "E", closed.meter_stop),
        ],
    };
    let payload_json = serde_json::to_string(&payload)?;

    let signature: Signature = signing_key()?.sign(payload_json.as_bytes());
    let signature_json = serde_json::to_string(&OcmfSignature {
        algorithm: SIGNING_METHOD.to_string(),
        data: hex::encode_upper(signature.to_der().as_bytes()),
    })?;

    let record = format!("OCMF|{}|{}", payload_json, signature_json);
    Ok(SignedMeterRecord {
        signed_meter_data: BASE64.encode(record),
        public_key: public_key()?,
    })
}

/// Check a base64 record against a base64 SEC1 public key, returning its payload
pub fn verify(signed_meter_data: &str, public_key: &str) -> Result<OcmfPayload, SignError> {
    let record = String::from_utf8(BASE64.decode(signed_meter_data)?)
        .map_err(|_| SignError::Malformed("record is not UTF-8"))?;
    let body = record
        .strip_prefix("OCMF|")
        .ok_or(SignError::Malformed("missing OCMF header"))?;
    let (payload_json, signature_json) = body
        .rsplit_once('|')
        .ok_or(SignError::Malformed("missing signature section"))?;

    let signature_section: OcmfSignature = serde_json::from_str(signature_json)?;
    if signature_section.algorithm != SIGNING_METHOD {
        return Err(SignError::Malformed("unsupported signature algorithm"));
    }
    let der = hex::decode(&signature_section.data)?;
    let signature = Signature::from_der(&der)?;

    let verifying_key = VerifyingKey::from_sec1_bytes(&BASE64.decode(public_key)?)?;
    verifying_key.verify(payload_json.as_bytes(), &signature)?;

    Ok(serde_json::from_str(payload_json)?)
}
