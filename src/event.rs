/*!
The [`Event`] type.

Events are immutable records of something that happened in a process. They're constructed by application code, handed to an [`crate::AsyncEventLogger`], and from then on are owned by the logger until they're delivered or durably spilled to disk.
*/

use std::{fmt, mem, str::FromStr, time::SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/**
The stage of a process an [`Event`] describes.
*/
#[derive(PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /**
    A process started.
    */
    ProcessStart,
    /**
    A step within a process completed.
    */
    Step,
    /**
    A process ended.
    */
    ProcessEnd,
    /**
    A process failed.
    */
    Error,
}

impl fmt::Debug for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::ProcessStart => "PROCESS_START",
            EventKind::Step => "STEP",
            EventKind::ProcessEnd => "PROCESS_END",
            EventKind::Error => "ERROR",
        })
    }
}

impl FromStr for EventKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            EventKind::ProcessStart,
            EventKind::Step,
            EventKind::ProcessEnd,
            EventKind::Error,
        ]
        .into_iter()
        .find(|kind| s.eq_ignore_ascii_case(&kind.to_string()))
        .ok_or(ParseError {})
    }
}

/**
The outcome an [`Event`] reports.
*/
#[derive(PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /**
    The operation succeeded.
    */
    Success,
    /**
    The operation failed.
    */
    Failure,
    /**
    The operation hasn't completed yet.
    */
    InProgress,
}

impl fmt::Debug for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventStatus::Success => "SUCCESS",
            EventStatus::Failure => "FAILURE",
            EventStatus::InProgress => "IN_PROGRESS",
        })
    }
}

impl FromStr for EventStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            EventStatus::Success,
            EventStatus::Failure,
            EventStatus::InProgress,
        ]
        .into_iter()
        .find(|status| s.eq_ignore_ascii_case(&status.to_string()))
        .ok_or(ParseError {})
    }
}

/**
An error parsing an [`EventKind`] or [`EventStatus`] from a string.
*/
#[derive(Debug)]
pub struct ParseError {}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the input is not a recognized value")
    }
}

impl std::error::Error for ParseError {}

/**
A structured record of one occurrence within an instrumented process.

The timestamp of an event is assigned when it's constructed, not when it's sent.
*/
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    kind: EventKind,
    status: EventStatus,
    timestamp: SystemTime,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    correlation_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    trace_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    span_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    process_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    step: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    payload: Map<String, Value>,
}

impl Event {
    /**
    Create a new event timestamped with the current time.
    */
    pub fn new(kind: EventKind, status: EventStatus) -> Self {
        Event::new_at(kind, status, SystemTime::now())
    }

    /**
    Create a new event with an explicit timestamp.
    */
    pub fn new_at(kind: EventKind, status: EventStatus, timestamp: SystemTime) -> Self {
        Event {
            kind,
            status,
            timestamp,
            correlation_id: String::new(),
            trace_id: String::new(),
            span_id: String::new(),
            process_name: String::new(),
            step: String::new(),
            account_id: String::new(),
            message: None,
            payload: Map::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_span_id(mut self, span_id: impl Into<String>) -> Self {
        self.span_id = span_id.into();
        self
    }

    pub fn with_process_name(mut self, process_name: impl Into<String>) -> Self {
        self.process_name = process_name.into();
        self
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = step.into();
        self
    }

    pub fn with_account_id(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = account_id.into();
        self
    }

    /**
    Attach a free-text message to the event.
    */
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /**
    Replace the payload of the event.
    */
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    /**
    Add a single entry to the payload of the event.
    */
    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn status(&self) -> EventStatus {
        self.status
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /**
    Apply size limits to the event, returning `true` if anything was cut.
    */
    pub(crate) fn truncate(&mut self, limits: &Limits) -> bool {
        let mut truncated = false;

        for id in [
            &mut self.correlation_id,
            &mut self.trace_id,
            &mut self.span_id,
            &mut self.process_name,
            &mut self.step,
            &mut self.account_id,
        ] {
            truncated |= truncate_str(id, limits.max_identifier_len);
        }

        if let Some(ref mut message) = self.message {
            truncated |= truncate_str(message, limits.max_message_len);
        }

        truncated |= truncate_payload(&mut self.payload, limits.max_payload_bytes);

        truncated
    }
}

pub(crate) const DEFAULT_MAX_IDENTIFIER_LEN: usize = 256;
pub(crate) const DEFAULT_MAX_MESSAGE_LEN: usize = 4 * 1024;
pub(crate) const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/**
The key added to payloads that had entries removed.
*/
pub const TRUNCATED_KEY: &str = "_truncated";

#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub(crate) max_identifier_len: usize,
    pub(crate) max_message_len: usize,
    pub(crate) max_payload_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_identifier_len: DEFAULT_MAX_IDENTIFIER_LEN,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

fn truncate_str(s: &mut String, max_len: usize) -> bool {
    if s.len() <= max_len {
        return false;
    }

    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }

    s.truncate(end);
    true
}

fn encoded_len(value: &Value) -> usize {
    serde_json::to_string(value)
        .map(|encoded| encoded.len())
        .unwrap_or(0)
}

fn entry_len(key: &str, value: &Value) -> usize {
    key.len() + encoded_len(value)
}

/*
Payloads are measured as the sum of their key lengths and JSON-encoded value lengths.

When a payload is over its budget, entries are kept in key order until the budget runs out. A string that doesn't fit is cut to whatever space is left, and anything after it is removed. A marker entry is added so the receiver can tell the payload is incomplete.
*/
fn truncate_payload(payload: &mut Map<String, Value>, max_bytes: usize) -> bool {
    let total = payload
        .iter()
        .map(|(key, value)| entry_len(key, value))
        .sum::<usize>();

    if total <= max_bytes {
        return false;
    }

    let budget = max_bytes.saturating_sub(entry_len(TRUNCATED_KEY, &Value::Bool(true)));

    let mut used = 0;
    let mut kept = Map::new();

    for (key, value) in mem::take(payload) {
        if key == TRUNCATED_KEY {
            continue;
        }

        let len = entry_len(&key, &value);

        if used + len <= budget {
            used += len;
            kept.insert(key, value);

            continue;
        }

        if let Value::String(mut s) = value {
            // The key plus a pair of quotes
            let overhead = key.len() + 2;
            let remaining = budget - used;

            if remaining > overhead {
                truncate_str(&mut s, remaining - overhead);

                // Escaping can make the encoded string longer than its raw bytes
                let value = Value::String(s);
                if used + entry_len(&key, &value) <= budget {
                    kept.insert(key, value);
                }
            }
        }

        break;
    }

    kept.insert(TRUNCATED_KEY.into(), Value::Bool(true));
    *payload = kept;

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn kinds_and_statuses_parse() {
        for kind in ["process_start", "STEP", "Process_End", "error"] {
            assert!(kind.parse::<EventKind>().is_ok(), "{kind}");
        }

        assert_eq!(
            EventStatus::InProgress,
            "in_progress".parse::<EventStatus>().unwrap()
        );
        assert!("done".parse::<EventStatus>().is_err());
    }

    #[test]
    fn serializes_kinds_in_wire_format() {
        let event = Event::new_at(
            EventKind::ProcessStart,
            EventStatus::InProgress,
            SystemTime::UNIX_EPOCH,
        )
        .with_correlation_id("c-1");

        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json!("PROCESS_START"), json["kind"]);
        assert_eq!(json!("IN_PROGRESS"), json["status"]);
        assert_eq!(json!("c-1"), json["correlation_id"]);
        assert!(json.get("trace_id").is_none());
    }

    #[test]
    fn identifiers_are_cut_on_char_boundaries() {
        let mut event = Event::new(EventKind::Step, EventStatus::Success)
            .with_correlation_id("aé")
            .with_step("short");

        let truncated = event.truncate(&Limits {
            max_identifier_len: 2,
            ..Default::default()
        });

        assert!(truncated);

        // 'é' is two bytes and straddles the limit
        assert_eq!("a", event.correlation_id());
        assert_eq!("sh", event.step());
    }

    #[test]
    fn small_payloads_are_untouched() {
        let mut event = Event::new(EventKind::Step, EventStatus::Success)
            .with_entry("a", 1)
            .with_entry("b", "two");

        assert!(!event.truncate(&Limits::default()));
        assert_eq!(2, event.payload().len());
    }

    #[test]
    fn oversized_payloads_keep_a_prefix_and_a_marker() {
        let mut event = Event::new(EventKind::Step, EventStatus::Success).with_payload(payload(
            json!({
                "a": 1,
                "b": "x".repeat(100),
                "c": 3,
            }),
        ));

        let truncated = event.truncate(&Limits {
            max_payload_bytes: 40,
            ..Default::default()
        });

        assert!(truncated);

        let payload = event.payload();

        assert_eq!(Some(&json!(1)), payload.get("a"));
        assert_eq!(Some(&json!(true)), payload.get(TRUNCATED_KEY));
        assert!(payload.get("c").is_none());

        let b = payload.get("b").and_then(|b| b.as_str()).unwrap();
        assert!(!b.is_empty() && b.len() < 100);

        let total = payload
            .iter()
            .map(|(key, value)| entry_len(key, value))
            .sum::<usize>();
        assert!(total <= 40);
    }

    #[test]
    fn messages_are_capped() {
        let mut event =
            Event::new(EventKind::Error, EventStatus::Failure).with_message("m".repeat(10));

        event.truncate(&Limits {
            max_message_len: 4,
            ..Default::default()
        });

        assert_eq!(Some("mmmm"), event.message());
    }
}
