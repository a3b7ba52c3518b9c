/*!
The JSON representation of events sent to the remote event log.
*/

use std::time::{SystemTime, UNIX_EPOCH};

use evlog::{Event, EventKind, EventStatus};
use serde::{ser::Error as _, Serialize, Serializer};
use serde_json::{Map, Value};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent<'a> {
    kind: EventKind,
    status: EventStatus,
    #[serde(serialize_with = "rfc3339")]
    timestamp: SystemTime,
    #[serde(skip_serializing_if = "str::is_empty")]
    correlation_id: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    trace_id: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    span_id: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    process_name: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    step: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    account_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    payload: &'a Map<String, Value>,
}

impl<'a> From<&'a Event> for WireEvent<'a> {
    fn from(event: &'a Event) -> Self {
        WireEvent {
            kind: event.kind(),
            status: event.status(),
            timestamp: event.timestamp(),
            correlation_id: event.correlation_id(),
            trace_id: event.trace_id(),
            span_id: event.span_id(),
            process_name: event.process_name(),
            step: event.step(),
            account_id: event.account_id(),
            message: event.message(),
            payload: event.payload(),
        }
    }
}

fn rfc3339<S: Serializer>(ts: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    let ts = ts
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(emit::Timestamp::from_unix)
        .ok_or_else(|| S::Error::custom("the timestamp is outside the representable range"))?;

    serializer.collect_str(&ts)
}

/**
Encode a batch as a JSON array.
*/
pub(crate) fn encode_batch(batch: &[Event]) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&batch.iter().map(WireEvent::from).collect::<Vec<_>>())
}
