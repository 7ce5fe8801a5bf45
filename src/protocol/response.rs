use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, FixedOffset};
use serde_json::{Map, Value};

use super::error::DriverError;
use super::options::{Format, FormatOptions};
use super::types::{ResponseNote, ResponseType};

const PSEUDO_TYPE_KEY: &str = "$reql_type$";

/// A decoded response frame body: `{t, r, n?, p?, b?}`.
#[derive(Debug, Clone)]
pub struct Response {
    pub rtype: ResponseType,
    pub rows: Vec<Value>,
    pub notes: Vec<ResponseNote>,
    pub profile: Option<Value>,
    pub backtrace: Option<Value>,
}

impl Response {
    /// Decode a response payload, applying the format preferences that
    /// were captured when the query was registered.
    pub fn from_payload(payload: &[u8], formats: FormatOptions) -> Result<Self, DriverError> {
        let value: Value = serde_json::from_slice(payload)?;
        Self::from_value(value, formats)
    }

    pub fn from_value(value: Value, formats: FormatOptions) -> Result<Self, DriverError> {
        let mut obj = match value {
            Value::Object(obj) => obj,
            other => {
                return Err(DriverError::Protocol(format!(
                    "response body is not an object: {}",
                    other
                )))
            }
        };

        let rtype = obj
            .get("t")
            .and_then(Value::as_u64)
            .ok_or_else(|| DriverError::Protocol("response has no type field".to_string()))
            .and_then(ResponseType::from_wire)?;

        let rows = match obj.remove("r") {
            Some(Value::Array(rows)) => rows
                .into_iter()
                .map(|row| convert_pseudo_types(row, &formats))
                .collect(),
            Some(other) => {
                return Err(DriverError::Protocol(format!(
                    "response rows are not an array: {}",
                    other
                )))
            }
            None => Vec::new(),
        };

        let notes = match obj.get("n") {
            Some(Value::Array(notes)) => notes
                .iter()
                .filter_map(Value::as_u64)
                .filter_map(ResponseNote::from_wire)
                .collect(),
            _ => Vec::new(),
        };

        Ok(Response {
            rtype,
            rows,
            notes,
            profile: obj.remove("p"),
            backtrace: obj.remove("b"),
        })
    }

    /// A fabricated CLIENT_ERROR used to wake waiters when the reader dies.
    pub fn synthetic_client_error(msg: &str) -> Self {
        Response {
            rtype: ResponseType::ClientError,
            rows: vec![Value::String(msg.to_string())],
            notes: Vec::new(),
            profile: None,
            backtrace: None,
        }
    }

    /// True when a note marks this stream as a changefeed.
    pub fn is_feed(&self) -> bool {
        self.notes.iter().any(ResponseNote::is_feed)
    }

    /// Convert an error-typed response into the matching driver error.
    /// Returns `None` for success types.
    pub fn to_error(&self) -> Option<DriverError> {
        let msg = || {
            self.rows
                .first()
                .map(|row| match row {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "unknown server error".to_string())
        };
        match self.rtype {
            ResponseType::ClientError => Some(DriverError::ClientError {
                msg: msg(),
                backtrace: self.backtrace.clone(),
            }),
            ResponseType::CompileError => Some(DriverError::Compile {
                msg: msg(),
                backtrace: self.backtrace.clone(),
            }),
            ResponseType::RuntimeError => Some(DriverError::Runtime {
                msg: msg(),
                backtrace: self.backtrace.clone(),
            }),
            _ => None,
        }
    }
}

/// Recursively rewrite pseudo-type objects according to the caller's
/// format preferences. Unknown pseudo-types are left untouched.
fn convert_pseudo_types(value: Value, formats: &FormatOptions) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| convert_pseudo_types(item, formats))
                .collect(),
        ),
        Value::Object(obj) => match obj.get(PSEUDO_TYPE_KEY).and_then(Value::as_str) {
            Some("TIME") if formats.time == Format::Native => convert_time(obj),
            Some("GROUPED_DATA") if formats.group == Format::Native => {
                convert_grouped(obj, formats)
            }
            Some("BINARY") if formats.binary == Format::Native => convert_binary(obj),
            _ => Value::Object(
                obj.into_iter()
                    .map(|(k, v)| (k, convert_pseudo_types(v, formats)))
                    .collect(),
            ),
        },
        other => other,
    }
}

/// `{$reql_type$: "TIME", epoch_time, timezone}` → RFC 3339 string.
fn convert_time(obj: Map<String, Value>) -> Value {
    let epoch = obj.get("epoch_time").and_then(Value::as_f64);
    let converted = epoch.and_then(|epoch| {
        let secs = epoch.floor() as i64;
        let nanos = ((epoch - epoch.floor()) * 1e9).round() as u32;
        let utc = DateTime::from_timestamp(secs, nanos)?;
        let offset = obj
            .get("timezone")
            .and_then(Value::as_str)
            .and_then(|tz| tz.parse::<FixedOffset>().ok());
        let rendered = match offset {
            Some(offset) => utc.with_timezone(&offset).to_rfc3339(),
            None => utc.to_rfc3339(),
        };
        Some(Value::String(rendered))
    });
    converted.unwrap_or(Value::Object(obj))
}

/// `{$reql_type$: "GROUPED_DATA", data: [[g, v], ...]}` →
/// `[{group: g, reduction: v}, ...]`.
fn convert_grouped(mut obj: Map<String, Value>, formats: &FormatOptions) -> Value {
    match obj.remove("data") {
        Some(Value::Array(pairs)) => Value::Array(
            pairs
                .into_iter()
                .map(|pair| match pair {
                    Value::Array(mut parts) if parts.len() == 2 => {
                        let reduction =
                            convert_pseudo_types(parts.pop().unwrap_or(Value::Null), formats);
                        let group =
                            convert_pseudo_types(parts.pop().unwrap_or(Value::Null), formats);
                        let mut entry = Map::new();
                        entry.insert("group".to_string(), group);
                        entry.insert("reduction".to_string(), reduction);
                        Value::Object(entry)
                    }
                    other => other,
                })
                .collect(),
        ),
        other => {
            if let Some(data) = other {
                obj.insert("data".to_string(), data);
            }
            Value::Object(obj)
        }
    }
}

/// `{$reql_type$: "BINARY", data}` → decoded bytes as a string when they
/// are valid UTF-8; the raw object otherwise.
fn convert_binary(obj: Map<String, Value>) -> Value {
    let decoded = obj
        .get("data")
        .and_then(Value::as_str)
        .and_then(|data| BASE64.decode(data).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok());
    match decoded {
        Some(text) => Value::String(text),
        None => Value::Object(obj),
    }
}
