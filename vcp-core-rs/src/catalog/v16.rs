//! OCPP 1.6 catalog
//!
//! Transactions are started by the central system (RemoteStartTransaction)
//! and identified by the integer id it assigns in the StartTransaction
//! result. Connector 0 stands for the whole charge point.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use super::{
    boot_accepted, boot_not_accepted, note_connector, schema, write_setting, BootInfo, Catalog, ConfigWrite,
    IncomingAction, OutgoingAction,
};
use crate::ocpp::v16::*;
use crate::ocpp::{Call, CallResult, ErrorCode, OcppError, Revision};
use crate::signed_meter;
use crate::station::{Station, StationError};
use crate::transaction::{MeterSample, SampleCallback, TransactionId};

pub(crate) fn catalog() -> Catalog {
    let mut outgoing = HashMap::new();
    outgoing.insert("Authorize", outgoing_action::<AuthorizeRequest, AuthorizeResponse>(None));
    outgoing.insert(
        "BootNotification",
        outgoing_action::<BootNotificationRequest, BootNotificationResponse>(Some(boot_notification_result)),
    );
    outgoing.insert("DataTransfer", outgoing_action::<DataTransferRequest, DataTransferResponse>(None));
    outgoing.insert("Heartbeat", outgoing_action::<HeartbeatRequest, HeartbeatResponse>(None));
    outgoing.insert("MeterValues", outgoing_action::<MeterValuesRequest, MeterValuesResponse>(None));
    outgoing.insert(
        "StartTransaction",
        outgoing_action::<StartTransactionRequest, StartTransactionResponse>(Some(start_transaction_result)),
    );
    outgoing.insert(
        "StatusNotification",
        outgoing_action::<StatusNotificationRequest, StatusNotificationResponse>(None),
    );
    outgoing.insert("StopTransaction", outgoing_action::<StopTransactionRequest, StopTransactionResponse>(None));

    let mut incoming = HashMap::new();
    incoming.insert(
        "RemoteStartTransaction",
        incoming_action::<RemoteStartTransactionRequest, RemoteStartStopResponse>(remote_start_transaction),
    );
    incoming.insert(
        "RemoteStopTransaction",
        incoming_action::<RemoteStopTransactionRequest, RemoteStartStopResponse>(remote_stop_transaction),
    );
    incoming.insert(
        "StartTransaction",
        incoming_action::<StartTransactionRequest, StartTransactionIncomingResponse>(start_transaction_incoming),
    );
    incoming.insert(
        "StopTransaction",
        incoming_action::<StopTransactionRequest, StopTransactionResponse>(stop_transaction_incoming),
    );
    incoming.insert("Reset", incoming_action::<ResetRequest, StatusResponse<GenericStatus>>(reset));
    incoming.insert(
        "ChangeAvailability",
        incoming_action::<ChangeAvailabilityRequest, StatusResponse<AvailabilityStatus>>(change_availability),
    );
    incoming.insert(
        "ChangeConfiguration",
        incoming_action::<ChangeConfigurationRequest, StatusResponse<ConfigurationStatus>>(change_configuration),
    );
    incoming.insert(
        "GetConfiguration",
        incoming_action::<GetConfigurationRequest, GetConfigurationResponse>(get_configuration),
    );
    incoming.insert("ClearCache", incoming_action::<ClearCacheRequest, StatusResponse<GenericStatus>>(clear_cache));
    incoming.insert("DataTransfer", incoming_action::<DataTransferRequest, DataTransferResponse>(data_transfer));
    incoming.insert(
        "TriggerMessage",
        incoming_action::<TriggerMessageRequest, StatusResponse<TriggerMessageStatus>>(trigger_message),
    );
    incoming.insert(
        "UnlockConnector",
        incoming_action::<UnlockConnectorRequest, StatusResponse<UnlockStatus>>(unlock_connector),
    );

    Catalog {
        revision: Revision::Ocpp16,
        incoming,
        outgoing,
        format_violation: ErrorCode::FormationViolation,
        boot_request,
        available_status: |connector_id| status_notification(connector_id, ChargePointStatus::Available),
        heartbeat_request: || Call::new("Heartbeat", HeartbeatRequest {}),
        reports_central_connector: true,
        default_serial: |id| format!("{}-S001", id),
    }
}

fn outgoing_action<Req, Res>(on_result: Option<super::ResultHandler>) -> OutgoingAction
where
    Req: serde::de::DeserializeOwned,
    Res: serde::de::DeserializeOwned,
{
    OutgoingAction {
        request: schema::<Req>,
        response: schema::<Res>,
        on_result,
    }
}

fn incoming_action<Req, Res>(handler: super::RequestHandler) -> IncomingAction
where
    Req: serde::de::DeserializeOwned,
    Res: serde::de::DeserializeOwned,
{
    IncomingAction {
        request: schema::<Req>,
        response: schema::<Res>,
        handler,
    }
}

fn boot_request(info: &BootInfo) -> Result<Call, OcppError> {
    Call::new(
        "BootNotification",
        BootNotificationRequest {
            charge_point_vendor: info.vendor.clone(),
            charge_point_model: info.model.clone(),
            charge_point_serial_number: Some(info.serial_number.clone()),
            charge_box_serial_number: None,
            firmware_version: info.firmware_version.clone(),
            iccid: None,
            imsi: None,
            meter_type: None,
            meter_serial_number: None,
        },
    )
}

fn status_notification(connector_id: u32, status: ChargePointStatus) -> Result<Call, OcppError> {
    Call::new("StatusNotification", StatusNotificationRequest::new(connector_id, status))
}

/// Status a connector reports when asked: charging if it carries a transaction
fn current_status(station: &Station, connector_id: u32) -> ChargePointStatus {
    if station.transactions().active_on(connector_id).is_some() {
        ChargePointStatus::Charging
    } else {
        ChargePointStatus::Available
    }
}

fn meter_values_request(sample: &MeterSample) -> Result<Call, OcppError> {
    let transaction_id = match sample.transaction_id {
        TransactionId::Int(id) => Some(id),
        TransactionId::Text(_) => None,
    };
    Call::new(
        "MeterValues",
        MeterValuesRequest {
            connector_id: sample.connector_id,
            transaction_id,
            meter_value: vec![MeterValue {
                timestamp: Utc::now(),
                sampled_value: vec![SampledValue::energy_wh(sample.meter_value.floor() as i64)],
            }],
        },
    )
}

fn meter_sampler(station: &Arc<Station>) -> SampleCallback {
    let station = Arc::downgrade(station);
    Arc::new(move |sample: MeterSample| {
        let Some(station) = station.upgrade() else {
            return;
        };
        let sent = meter_values_request(&sample)
            .map_err(StationError::from)
            .and_then(|call| station.send(call));
        if let Err(e) = sent {
            warn!(station = %station.id(), transaction = %sample.transaction_id, "MeterValues not sent: {}", e);
        }
    })
}

// ============================================================================
// Result handlers
// ============================================================================

fn boot_notification_result(station: &Arc<Station>, _call: &Call, result: &CallResult) -> Result<(), StationError> {
    let response: BootNotificationResponse = result.parse_payload()?;
    match response.status {
        RegistrationStatus::Accepted => boot_accepted(station, response.interval),
        status => boot_not_accepted(station, status),
    }
    Ok(())
}

fn start_transaction_result(station: &Arc<Station>, call: &Call, result: &CallResult) -> Result<(), StationError> {
    let request: StartTransactionRequest = call.decode()?;
    let response: StartTransactionResponse = result.parse_payload()?;

    if response.id_tag_info.status == AuthorizationStatus::Accepted {
        debug!(
            station = %station.id(),
            connector = request.connector_id,
            transaction = response.transaction_id,
            "Transaction started"
        );
        station.transactions().start(
            request.connector_id,
            TransactionId::Int(response.transaction_id),
            request.id_tag,
            None,
            meter_sampler(station),
        );
        return Ok(());
    }

    warn!(
        station = %station.id(),
        connector = request.connector_id,
        status = ?response.id_tag_info.status,
        "StartTransaction not accepted"
    );
    station.transactions().release(request.connector_id);
    station.send(status_notification(request.connector_id, ChargePointStatus::Available)?)
}

// ============================================================================
// Request handlers
// ============================================================================

fn remote_start_transaction(station: &Arc<Station>, call: &Call) -> Result<(), StationError> {
    let request: RemoteStartTransactionRequest = call.decode()?;
    let connector_id = request.connector_id.unwrap_or(1);

    if !station.transactions().reserve(connector_id) {
        return station.respond(call, RemoteStartStopResponse { status: RemoteStartStopStatus::Rejected });
    }

    let requested = request_start(station, call, connector_id, request.id_tag);
    if requested.is_err() {
        // StartTransaction never went out, nothing will confirm the reservation
        station.transactions().release(connector_id);
    }
    requested
}

fn request_start(station: &Arc<Station>, call: &Call, connector_id: u32, id_tag: String) -> Result<(), StationError> {
    station.respond(call, RemoteStartStopResponse { status: RemoteStartStopStatus::Accepted })?;

    station.send(status_notification(connector_id, ChargePointStatus::Charging)?)?;
    let meter_start = station.transactions().connector_meter(connector_id).floor() as i64;
    station.send(Call::new(
        "StartTransaction",
        StartTransactionRequest {
            connector_id,
            id_tag,
            meter_start,
            reservation_id: None,
            timestamp: Utc::now(),
        },
    )?)
}

fn remote_stop_transaction(station: &Arc<Station>, call: &Call) -> Result<(), StationError> {
    let request: RemoteStopTransactionRequest = call.decode()?;
    station.respond(call, RemoteStartStopResponse { status: RemoteStartStopStatus::Accepted })?;

    let transaction_id = TransactionId::Int(request.transaction_id);
    let closed = station.transactions().stop(&transaction_id);
    let mut affected = Vec::new();

    let mut meter_stop = 0;
    let mut transaction_data = None;
    if let Some(closed) = &closed {
        note_connector(&mut affected, closed.connector_id);
        meter_stop = closed.meter_stop.floor() as i64;

        match signed_meter::sign(station.id(), closed).and_then(|record| record.to_v16_value()) {
            Ok(signed) => {
                transaction_data = Some(vec![MeterValue {
                    timestamp: Utc::now(),
                    sampled_value: vec![SampledValue {
                        value: signed,
                        context: Some(ReadingContext::TransactionEnd),
                        format: Some(ValueFormat::SignedData),
                        measurand: None,
                        phase: None,
                        location: None,
                        unit: None,
                    }],
                }]);
            }
            Err(e) => warn!(station = %station.id(), "Signed meter record not produced: {}", e),
        }
    }

    station.send(Call::new(
        "StopTransaction",
        StopTransactionRequest {
            id_tag: None,
            meter_stop,
            timestamp: Utc::now(),
            transaction_id: request.transaction_id,
            reason: None,
            transaction_data,
        },
    )?)?;

    let released = station.transactions().release_all();
    for connector_id in released {
        note_connector(&mut affected, connector_id);
    }
    for connector_id in affected {
        station.send(status_notification(connector_id, ChargePointStatus::Available)?)?;
    }
    Ok(())
}

fn start_transaction_incoming(station: &Arc<Station>, call: &Call) -> Result<(), StationError> {
    let request: StartTransactionRequest = call.decode()?;
    let connector_id = request.connector_id;

    if !station.transactions().reserve(connector_id) {
        return station.respond(
            call,
            StartTransactionIncomingResponse {
                status: RemoteStartStopStatus::Rejected,
                status_info: Some("Connector already in use".to_string()),
            },
        );
    }
    station.respond(
        call,
        StartTransactionIncomingResponse { status: RemoteStartStopStatus::Accepted, status_info: None },
    )?;

    station.send(status_notification(connector_id, ChargePointStatus::Charging)?)?;
    station.send(Call::new("StartTransaction", request)?)
}

fn stop_transaction_incoming(station: &Arc<Station>, call: &Call) -> Result<(), StationError> {
    let request: StopTransactionRequest = call.decode()?;
    let mut affected = Vec::new();

    let closed = station.transactions().stop(&TransactionId::Int(request.transaction_id));
    if let Some(closed) = closed {
        note_connector(&mut affected, closed.connector_id);
    }
    let released = station.transactions().release_all();
    for connector_id in released {
        note_connector(&mut affected, connector_id);
    }
    for connector_id in affected {
        station.send(status_notification(connector_id, ChargePointStatus::Available)?)?;
    }

    station.send(Call::new("StopTransaction", request)?)?;
    station.respond(call, StopTransactionResponse { id_tag_info: Some(IdTagInfo::accepted()) })
}

fn reset(station: &Arc<Station>, call: &Call) -> Result<(), StationError> {
    let request: ResetRequest = call.decode()?;
    debug!(station = %station.id(), kind = ?request.reset_type, "Reset requested");
    station.respond(call, StatusResponse { status: GenericStatus::Accepted })
}

fn change_availability(station: &Arc<Station>, call: &Call) -> Result<(), StationError> {
    let request: ChangeAvailabilityRequest = call.decode()?;
    let busy = {
        let transactions = station.transactions();
        if request.connector_id == 0 {
            !transactions.is_empty()
        } else {
            transactions.active_on(request.connector_id).is_some()
        }
    };
    if busy {
        return station.respond(call, StatusResponse { status: AvailabilityStatus::Scheduled });
    }

    station.respond(call, StatusResponse { status: AvailabilityStatus::Accepted })?;
    let status = match request.availability_type {
        AvailabilityType::Inoperative => ChargePointStatus::Unavailable,
        AvailabilityType::Operative => ChargePointStatus::Available,
    };
    station.send(status_notification(request.connector_id, status)?)
}

fn change_configuration(station: &Arc<Station>, call: &Call) -> Result<(), StationError> {
    let request: ChangeConfigurationRequest = call.decode()?;
    let status = match write_setting(station, &request.key, &request.value) {
        ConfigWrite::Accepted => ConfigurationStatus::Accepted,
        ConfigWrite::Rejected => ConfigurationStatus::Rejected,
        ConfigWrite::Unknown => ConfigurationStatus::NotSupported,
    };
    station.respond(call, StatusResponse { status })
}

fn get_configuration(station: &Arc<Station>, call: &Call) -> Result<(), StationError> {
    let request: GetConfigurationRequest = call.decode()?;
    let mut known = Vec::new();
    let mut unknown = Vec::new();
    {
        let settings = station.settings();
        let key_value = |key: &str, entry: &super::store::ConfigEntry| KeyValue {
            key: key.to_string(),
            readonly: entry.readonly,
            value: Some(entry.value.clone()),
        };
        match request.key.filter(|keys| !keys.is_empty()) {
            Some(keys) => {
                for key in keys {
                    match settings.get(&key) {
                        Some(entry) => known.push(key_value(key.as_str(), entry)),
                        None => unknown.push(key),
                    }
                }
            }
            None => known.extend(settings.entries().map(|(key, entry)| key_value(key.as_str(), entry))),
        }
    }

    station.respond(
        call,
        GetConfigurationResponse {
            configuration_key: Some(known),
            unknown_key: (!unknown.is_empty()).then_some(unknown),
        },
    )
}

fn clear_cache(station: &Arc<Station>, call: &Call) -> Result<(), StationError> {
    station.respond(call, StatusResponse { status: GenericStatus::Accepted })
}

fn data_transfer(station: &Arc<Station>, call: &Call) -> Result<(), StationError> {
    station.respond(call, DataTransferResponse { status: DataTransferStatus::UnknownVendorId, data: None })
}

fn trigger_message(station: &Arc<Station>, call: &Call) -> Result<(), StationError> {
    let request: TriggerMessageRequest = call.decode()?;
    match request.requested_message {
        MessageTrigger::Heartbeat => {
            station.respond(call, StatusResponse { status: TriggerMessageStatus::Accepted })?;
            station.send(Call::new("Heartbeat", HeartbeatRequest {})?)
        }
        MessageTrigger::StatusNotification => {
            station.respond(call, StatusResponse { status: TriggerMessageStatus::Accepted })?;
            let connectors: Vec<u32> = match request.connector_id {
                Some(connector_id) => vec![connector_id],
                None => std::iter::once(0).chain(station.connectors().iter().copied()).collect(),
            };
            for connector_id in connectors {
                let status = current_status(station, connector_id);
                station.send(status_notification(connector_id, status)?)?;
            }
            Ok(())
        }
        MessageTrigger::MeterValues => {
            let sample = request.connector_id.and_then(|connector_id| {
                let transactions = station.transactions();
                transactions.active_on(connector_id).map(|transaction| MeterSample {
                    transaction_id: transaction.transaction_id.clone(),
                    connector_id,
                    evse_id: transaction.evse_id,
                    id_tag: transaction.id_tag.clone(),
                    meter_value: transaction.meter_value(),
                })
            });
            match sample {
                Some(sample) => {
                    station.respond(call, StatusResponse { status: TriggerMessageStatus::Accepted })?;
                    station.send(meter_values_request(&sample)?)
                }
                None => station.respond(call, StatusResponse { status: TriggerMessageStatus::Rejected }),
            }
        }
        _ => station.respond(call, StatusResponse { status: TriggerMessageStatus::NotImplemented }),
    }
}

fn unlock_connector(station: &Arc<Station>, call: &Call) -> Result<(), StationError> {
    station.respond(call, StatusResponse { status: UnlockStatus::Unlocked })
}
