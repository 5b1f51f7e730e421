//! OCPP 2.0.1 / 2.1 catalog
//!
//! The station generates transaction ids itself (UUIDs) and reports the
//! whole session lifecycle through TransactionEvent. EVSE ids take the place
//! of 1.6 connector ids in the transaction book.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    boot_accepted, boot_not_accepted, note_connector, schema, write_setting, BootInfo, Catalog, ConfigWrite,
    IncomingAction, OutgoingAction, RequestHandler, ResultHandler,
};
use crate::ocpp::v2x::*;
use crate::ocpp::{Call, CallResult, ErrorCode, OcppError, Revision};
use crate::signed_meter;
use crate::station::{Station, StationError};
use crate::transaction::{MeterSample, SampleCallback, TransactionId};

pub(crate) fn catalog(revision: Revision) -> Catalog {
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
        "StatusNotification",
        outgoing_action::<StatusNotificationRequest, StatusNotificationResponse>(None),
    );
    outgoing.insert(
        "TransactionEvent",
        outgoing_action::<TransactionEventRequest, TransactionEventResponse>(None),
    );

    let mut incoming = HashMap::new();
    incoming.insert(
        "RequestStartTransaction",
        incoming_action::<RequestStartTransactionRequest, RequestStartTransactionResponse>(request_start_transaction),
    );
    incoming.insert(
        "RequestStopTransaction",
        incoming_action::<RequestStopTransactionRequest, RequestStopTransactionResponse>(request_stop_transaction),
    );
    incoming.insert("Reset", incoming_action::<ResetRequest, StatusResponse<ScheduledStatus>>(reset));
    incoming.insert(
        "ChangeAvailability",
        incoming_action::<ChangeAvailabilityRequest, StatusResponse<ScheduledStatus>>(change_availability),
    );
    incoming.insert("GetVariables", incoming_action::<GetVariablesRequest, GetVariablesResponse>(get_variables));
    incoming.insert("SetVariables", incoming_action::<SetVariablesRequest, SetVariablesResponse>(set_variables));
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
        revision,
        incoming,
        outgoing,
        format_violation: ErrorCode::FormatViolation,
        boot_request,
        available_status: |evse_id| status_notification(evse_id, ConnectorStatus::Available),
        heartbeat_request: || Call::new("Heartbeat", HeartbeatRequest {}),
        reports_central_connector: false,
        default_serial: |id| id.to_string(),
    }
}

fn outgoing_action<Req: DeserializeOwned, Res: DeserializeOwned>(on_result: Option<ResultHandler>) -> OutgoingAction {
    OutgoingAction {
        request: schema::<Req>,
        response: schema::<Res>,
        on_result,
    }
}

fn incoming_action<Req: DeserializeOwned, Res: DeserializeOwned>(handler: RequestHandler) -> IncomingAction {
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
            charging_station: ChargingStationInfo {
                model: info.model.clone(),
                vendor_name: info.vendor.clone(),
                serial_number: Some(info.serial_number.clone()),
                firmware_version: info.firmware_version.clone(),
            },
            reason: BootReason::PowerUp,
        },
    )
}

fn status_notification(evse_id: u32, status: ConnectorStatus) -> Result<Call, OcppError> {
    Call::new("StatusNotification", StatusNotificationRequest::new(evse_id, status))
}

fn evse(evse_id: u32) -> EVSE {
    EVSE { id: evse_id, connector_id: Some(1) }
}

fn id_token(token: &str) -> IdToken {
    IdToken {
        id_token: token.to_string(),
        token_type: "ISO14443".to_string(),
    }
}

struct EventParts {
    event_type: TransactionEventType,
    trigger_reason: TriggerReason,
    seq_no: u32,
    charging_state: Option<ChargingState>,
    stopped_reason: Option<StoppedReason>,
    remote_start_id: Option<i64>,
    sampled_value: SampledValue,
}

fn transaction_event(transaction_id: &TransactionId, evse_id: u32, id_tag: &str, parts: EventParts) -> Result<Call, OcppError> {
    Call::new(
        "TransactionEvent",
        TransactionEventRequest {
            event_type: parts.event_type,
            timestamp: Utc::now(),
            trigger_reason: parts.trigger_reason,
            seq_no: parts.seq_no,
            transaction_info: TransactionInfo {
                transaction_id: transaction_id.to_string(),
                charging_state: parts.charging_state,
                stopped_reason: parts.stopped_reason,
                remote_start_id: parts.remote_start_id,
            },
            evse: Some(evse(evse_id)),
            id_token: Some(id_token(id_tag)),
            meter_value: Some(vec![MeterValue {
                timestamp: Utc::now(),
                sampled_value: vec![parts.sampled_value],
            }]),
            offline: None,
        },
    )
}

fn meter_sampler(station: &Arc<Station>) -> SampleCallback {
    let station = Arc::downgrade(station);
    Arc::new(move |sample: MeterSample| {
        let Some(station) = station.upgrade() else {
            return;
        };
        let Some(seq_no) = station.transactions().next_seq(&sample.transaction_id) else {
            return;
        };
        let evse_id = sample.evse_id.unwrap_or(sample.connector_id);
        let sent = transaction_event(
            &sample.transaction_id,
            evse_id,
            &sample.id_tag,
            EventParts {
                event_type: TransactionEventType::Updated,
                trigger_reason: TriggerReason::MeterValuePeriodic,
                seq_no,
                charging_state: Some(ChargingState::Charging),
                stopped_reason: None,
                remote_start_id: None,
                sampled_value: SampledValue::energy_wh(sample.meter_value.floor() as i64, ReadingContext::SamplePeriodic),
            },
        )
        .map_err(StationError::from)
        .and_then(|call| station.send(call));
        if let Err(e) = sent {
            warn!(station = %station.id(), transaction = %sample.transaction_id, "TransactionEvent not sent: {}", e);
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

// ============================================================================
// Request handlers
// ============================================================================

fn request_start_transaction(station: &Arc<Station>, call: &Call) -> Result<(), StationError> {
    let request: RequestStartTransactionRequest = call.decode()?;
    let evse_id = request.evse_id.unwrap_or(1);

    if !station.transactions().reserve(evse_id) {
        return station.respond(
            call,
            RequestStartTransactionResponse { status: GenericStatus::Rejected, transaction_id: None, status_info: None },
        );
    }

    let transaction_id = TransactionId::Text(Uuid::new_v4().to_string());
    let accepted = station.respond(
        call,
        RequestStartTransactionResponse {
            status: GenericStatus::Accepted,
            transaction_id: Some(transaction_id.to_string()),
            status_info: None,
        },
    );
    if let Err(e) = accepted {
        station.transactions().release(evse_id);
        return Err(e);
    }

    let meter_start = {
        let mut transactions = station.transactions();
        transactions.start(
            evse_id,
            transaction_id.clone(),
            request.id_token.id_token.clone(),
            Some(evse_id),
            meter_sampler(station),
        );
        transactions.meter_value(&transaction_id)
    };
    debug!(station = %station.id(), evse = evse_id, transaction = %transaction_id, "Transaction started");

    station.send(status_notification(evse_id, ConnectorStatus::Occupied)?)?;
    station.send(transaction_event(
        &transaction_id,
        evse_id,
        &request.id_token.id_token,
        EventParts {
            event_type: TransactionEventType::Started,
            trigger_reason: TriggerReason::RemoteStart,
            seq_no: 0,
            charging_state: Some(ChargingState::Charging),
            stopped_reason: None,
            remote_start_id: Some(request.remote_start_id),
            sampled_value: SampledValue::energy_wh(meter_start.floor() as i64, ReadingContext::TransactionBegin),
        },
    )?)
}

fn request_stop_transaction(station: &Arc<Station>, call: &Call) -> Result<(), StationError> {
    let request: RequestStopTransactionRequest = call.decode()?;
    let transaction_id = TransactionId::Text(request.transaction_id);

    let closed = {
        let mut transactions = station.transactions();
        let seq_no = transactions.next_seq(&transaction_id);
        seq_no.and_then(|seq_no| transactions.stop(&transaction_id).map(|closed| (seq_no, closed)))
    };
    let Some((seq_no, closed)) = closed else {
        return station.respond(
            call,
            RequestStopTransactionResponse { status: GenericStatus::Rejected, status_info: None },
        );
    };
    station.respond(call, RequestStopTransactionResponse { status: GenericStatus::Accepted, status_info: None })?;

    let evse_id = closed.evse_id.unwrap_or(closed.connector_id);
    let mut final_sample = SampledValue::energy_wh(closed.meter_stop.floor() as i64, ReadingContext::TransactionEnd);
    match signed_meter::sign(station.id(), &closed) {
        Ok(record) => final_sample.signed_meter_value = Some(record.to_v2x()),
        Err(e) => warn!(station = %station.id(), "Signed meter record not produced: {}", e),
    }

    station.send(transaction_event(
        &closed.transaction_id,
        evse_id,
        &closed.id_tag,
        EventParts {
            event_type: TransactionEventType::Ended,
            trigger_reason: TriggerReason::RemoteStop,
            seq_no,
            charging_state: Some(ChargingState::Idle),
            stopped_reason: Some(StoppedReason::Remote),
            remote_start_id: None,
            sampled_value: final_sample,
        },
    )?)?;

    let mut affected = vec![evse_id];
    let released = station.transactions().release_all();
    for released_evse in released {
        note_connector(&mut affected, released_evse);
    }
    for evse_id in affected {
        station.send(status_notification(evse_id, ConnectorStatus::Available)?)?;
    }
    Ok(())
}

fn reset(station: &Arc<Station>, call: &Call) -> Result<(), StationError> {
    let request: ResetRequest = call.decode()?;
    debug!(station = %station.id(), kind = ?request.reset_type, "Reset requested");
    station.respond(call, StatusResponse { status: ScheduledStatus::Accepted })
}

fn change_availability(station: &Arc<Station>, call: &Call) -> Result<(), StationError> {
    let request: ChangeAvailabilityRequest = call.decode()?;
    let target = request.evse.as_ref().map(|evse| evse.id);
    let busy = {
        let transactions = station.transactions();
        match target {
            Some(evse_id) => transactions.active_on(evse_id).is_some(),
            None => !transactions.is_empty(),
        }
    };
    if busy {
        return station.respond(call, StatusResponse { status: ScheduledStatus::Scheduled });
    }

    station.respond(call, StatusResponse { status: ScheduledStatus::Accepted })?;
    let status = match request.operational_status {
        OperationalStatus::Inoperative => ConnectorStatus::Unavailable,
        OperationalStatus::Operative => ConnectorStatus::Available,
    };
    let evses: Vec<u32> = match target {
        Some(evse_id) => vec![evse_id],
        None => station.connectors().to_vec(),
    };
    for evse_id in evses {
        station.send(status_notification(evse_id, status)?)?;
    }
    Ok(())
}

fn get_variables(station: &Arc<Station>, call: &Call) -> Result<(), StationError> {
    let request: GetVariablesRequest = call.decode()?;
    let results = {
        let settings = station.settings();
        request
            .get_variable_data
            .into_iter()
            .map(|data| {
                let value = settings.get(&data.variable.name).map(|entry| entry.value.clone());
                GetVariableResult {
                    attribute_status: if value.is_some() {
                        GetVariableStatus::Accepted
                    } else {
                        GetVariableStatus::UnknownVariable
                    },
                    attribute_type: data.attribute_type,
                    attribute_value: value,
                    component: data.component,
                    variable: data.variable,
                }
            })
            .collect()
    };
    station.respond(call, GetVariablesResponse { get_variable_result: results })
}

fn set_variables(station: &Arc<Station>, call: &Call) -> Result<(), StationError> {
    let request: SetVariablesRequest = call.decode()?;
    let results = request
        .set_variable_data
        .into_iter()
        .map(|data| {
            let attribute_status = match write_setting(station, &data.variable.name, &data.attribute_value) {
                ConfigWrite::Accepted => SetVariableStatus::Accepted,
                ConfigWrite::Rejected => SetVariableStatus::Rejected,
                ConfigWrite::Unknown => SetVariableStatus::UnknownVariable,
            };
            SetVariableResult {
                attribute_type: data.attribute_type,
                attribute_status,
                component: data.component,
                variable: data.variable,
            }
        })
        .collect();
    station.respond(call, SetVariablesResponse { set_variable_result: results })
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
            let evses: Vec<u32> = match request.evse {
                Some(evse) => vec![evse.id],
                None => station.connectors().to_vec(),
            };
            for evse_id in evses {
                let status = if station.transactions().active_on(evse_id).is_some() {
                    ConnectorStatus::Occupied
                } else {
                    ConnectorStatus::Available
                };
                station.send(status_notification(evse_id, status)?)?;
            }
            Ok(())
        }
        _ => station.respond(call, StatusResponse { status: TriggerMessageStatus::NotImplemented }),
    }
}

fn unlock_connector(station: &Arc<Station>, call: &Call) -> Result<(), StationError> {
    station.respond(call, StatusResponse { status: UnlockStatus::Unlocked })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::ocpp::OcppMessage;
    use crate::station::{Outgoing, StationOptions};

    use super::*;

    fn station(revision: Revision) -> (Arc<Station>, UnboundedReceiver<Outgoing>) {
        let station = Station::new(StationOptions::new("CS-1", "ws://localhost:1", revision));
        let rx = station.attach_test_writer();
        (station, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Outgoing>) -> Vec<OcppMessage> {
        let mut frames = Vec::new();
        while let Ok(Outgoing::Frame(text)) = rx.try_recv() {
            frames.push(OcppMessage::decode(&text).unwrap());
        }
        frames
    }

    fn calls(frames: &[OcppMessage]) -> Vec<Call> {
        frames
            .iter()
            .filter_map(|frame| match frame {
                OcppMessage::Call(call) => Some(call.clone()),
                _ => None,
            })
            .collect()
    }

    fn result(frames: &[OcppMessage], id: &str) -> Value {
        frames
            .iter()
            .find_map(|frame| match frame {
                OcppMessage::CallResult(result) if result.message_id == id => Some(result.payload.clone()),
                _ => None,
            })
            .unwrap()
    }

    fn request_start(station: &Arc<Station>, id: &str, evse_id: u32) {
        let frame = json!([2, id, "RequestStartTransaction", {
            "idToken": {"idToken": "TOKEN", "type": "ISO14443"},
            "remoteStartId": 11,
            "evseId": evse_id
        }]);
        station.handle_frame(&frame.to_string()).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_start_and_stop() {
        for revision in [Revision::Ocpp201, Revision::Ocpp21] {
            let (station, mut rx) = station(revision);
            request_start(&station, "s", 1);

            let frames = drain(&mut rx);
            let answer = result(&frames, "s");
            assert_eq!(answer["status"], "Accepted");
            let transaction_id = answer["transactionId"].as_str().unwrap().to_string();

            let sent = calls(&frames);
            assert_eq!(sent[0].action, "StatusNotification");
            assert_eq!(sent[0].payload["connectorStatus"], "Occupied");
            assert_eq!(sent[1].action, "TransactionEvent");
            assert_eq!(sent[1].payload["eventType"], "Started");
            assert_eq!(sent[1].payload["seqNo"], 0);
            assert_eq!(sent[1].payload["transactionInfo"]["transactionId"], transaction_id.as_str());

            tokio::time::sleep(Duration::from_secs(16)).await;
            let sent = calls(&drain(&mut rx));
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].payload["eventType"], "Updated");
            assert_eq!(sent[0].payload["triggerReason"], "MeterValuePeriodic");
            assert_eq!(sent[0].payload["seqNo"], 1);
            assert_eq!(sent[0].payload["meterValue"][0]["sampledValue"][0]["value"], 150.0);

            let stop = json!([2, "t", "RequestStopTransaction", {"transactionId": transaction_id}]);
            station.handle_frame(&stop.to_string()).unwrap();
            let frames = drain(&mut rx);
            assert_eq!(result(&frames, "t")["status"], "Accepted");

            let sent = calls(&frames);
            assert_eq!(sent[0].action, "TransactionEvent");
            assert_eq!(sent[0].payload["eventType"], "Ended");
            assert_eq!(sent[0].payload["seqNo"], 2);
            assert_eq!(sent[0].payload["transactionInfo"]["stoppedReason"], "Remote");
            let sample = &sent[0].payload["meterValue"][0]["sampledValue"][0];
            assert_eq!(sample["value"], 160.0);
            let signed = &sample["signedMeterValue"];
            assert!(signed_meter::verify(
                signed["signedMeterData"].as_str().unwrap(),
                signed["publicKey"].as_str().unwrap()
            )
            .is_ok());
            assert_eq!(sent[1].action, "StatusNotification");
            assert_eq!(sent[1].payload["connectorStatus"], "Available");
            assert!(station.transactions().is_empty());
        }
    }

    #[tokio::test]
    async fn test_request_start_on_busy_evse_rejected() {
        let (station, mut rx) = station(Revision::Ocpp201);
        request_start(&station, "a", 2);
        request_start(&station, "b", 2);

        let frames = drain(&mut rx);
        assert_eq!(result(&frames, "b")["status"], "Rejected");
        // Only the first request produced messages
        assert_eq!(calls(&frames).len(), 2);
    }

    #[tokio::test]
    async fn test_request_stop_unknown_rejected() {
        let (station, mut rx) = station(Revision::Ocpp201);
        let stop = json!([2, "t", "RequestStopTransaction", {"transactionId": "missing"}]);
        station.handle_frame(&stop.to_string()).unwrap();

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(result(&frames, "t")["status"], "Rejected");
    }

    #[tokio::test]
    async fn test_schema_failure_answers_format_violation() {
        let (station, mut rx) = station(Revision::Ocpp21);
        let frame = json!([2, "x", "RequestStartTransaction", {"remoteStartId": "one"}]);
        station.handle_frame(&frame.to_string()).unwrap();

        match &drain(&mut rx)[..] {
            [OcppMessage::CallError(error)] => assert_eq!(error.error_code, ErrorCode::FormatViolation),
            other => panic!("unexpected frames: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_variables() {
        let (station, mut rx) = station(Revision::Ocpp201);
        let set = json!([2, "s", "SetVariables", {"setVariableData": [
            {"attributeValue": "45", "component": {"name": "OCPPCommCtrlr"}, "variable": {"name": "HeartbeatInterval"}},
            {"attributeValue": "5", "component": {"name": "SampledDataCtrlr"}, "variable": {"name": "MeterValueSampleInterval"}},
            {"attributeValue": "x", "component": {"name": "Foo"}, "variable": {"name": "Bar"}}
        ]}]);
        let get = json!([2, "g", "GetVariables", {"getVariableData": [
            {"component": {"name": "OCPPCommCtrlr"}, "variable": {"name": "HeartbeatInterval"}},
            {"component": {"name": "Foo"}, "variable": {"name": "Bar"}}
        ]}]);
        station.handle_frame(&set.to_string()).unwrap();
        station.handle_frame(&get.to_string()).unwrap();

        let frames = drain(&mut rx);
        let set_result = result(&frames, "s");
        let statuses: Vec<_> = set_result["setVariableResult"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["attributeStatus"].clone())
            .collect();
        assert_eq!(statuses, vec![json!("Accepted"), json!("Rejected"), json!("UnknownVariable")]);

        let get_result = result(&frames, "g");
        assert_eq!(get_result["getVariableResult"][0]["attributeValue"], "45");
        assert_eq!(get_result["getVariableResult"][1]["attributeStatus"], "UnknownVariable");
    }

    #[tokio::test]
    async fn test_change_availability_all_evses() {
        let (station, mut rx) = station(Revision::Ocpp201);
        let frame = json!([2, "a", "ChangeAvailability", {"operationalStatus": "Inoperative"}]);
        station.handle_frame(&frame.to_string()).unwrap();

        let frames = drain(&mut rx);
        assert_eq!(result(&frames, "a")["status"], "Accepted");
        let sent = calls(&frames);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload["connectorStatus"], "Unavailable");
    }

    #[tokio::test]
    async fn test_status_for_configured_evses() {
        let station = Station::new(
            StationOptions::new("CS-1", "ws://localhost:1", Revision::Ocpp201).with_connectors(vec![2, 5]),
        );
        let mut rx = station.attach_test_writer();
        station
            .handle_frame(&json!([2, "t", "TriggerMessage", {"requestedMessage": "StatusNotification"}]).to_string())
            .unwrap();
        station
            .handle_frame(&json!([2, "a", "ChangeAvailability", {"operationalStatus": "Operative"}]).to_string())
            .unwrap();

        let frames = drain(&mut rx);
        assert_eq!(result(&frames, "t")["status"], "Accepted");
        assert_eq!(result(&frames, "a")["status"], "Accepted");
        let reported: Vec<Value> = calls(&frames).iter().map(|call| call.payload["evseId"].clone()).collect();
        assert_eq!(reported, vec![json!(2), json!(5), json!(2), json!(5)]);
    }

    #[tokio::test]
    async fn test_request_start_failure_releases_reservation() {
        let (station, rx) = station(Revision::Ocpp201);
        drop(rx);

        let frame = json!([2, "s", "RequestStartTransaction", {
            "idToken": {"idToken": "TOKEN", "type": "ISO14443"},
            "remoteStartId": 11,
            "evseId": 1
        }]);
        assert!(matches!(station.handle_frame(&frame.to_string()), Err(StationError::NotConnected)));
        assert!(station.transactions().can_start(1));
        assert!(station.transactions().is_empty());
    }

    #[tokio::test]
    async fn test_trigger_and_misc() {
        let (station, mut rx) = station(Revision::Ocpp21);
        for (id, action, payload) in [
            ("h", "TriggerMessage", json!({"requestedMessage": "Heartbeat"})),
            ("m", "TriggerMessage", json!({"requestedMessage": "MeterValues"})),
            ("r", "Reset", json!({"type": "Immediate"})),
            ("c", "ClearCache", json!({})),
            ("d", "DataTransfer", json!({"vendorId": "acme"})),
            ("u", "UnlockConnector", json!({"evseId": 1, "connectorId": 1})),
        ] {
            station.handle_frame(&json!([2, id, action, payload]).to_string()).unwrap();
        }

        let frames = drain(&mut rx);
        assert_eq!(result(&frames, "h")["status"], "Accepted");
        assert_eq!(result(&frames, "m")["status"], "NotImplemented");
        assert_eq!(result(&frames, "r")["status"], "Accepted");
        assert_eq!(result(&frames, "c")["status"], "Accepted");
        assert_eq!(result(&frames, "d")["status"], "UnknownVendorId");
        assert_eq!(result(&frames, "u")["status"], "Unlocked");
        assert_eq!(calls(&frames).iter().filter(|c| c.action == "Heartbeat").count(), 1);
    }
}
