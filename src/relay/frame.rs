//! Relay subprotocol frames.
//!
//! - Client → relay: `["REQ", sub_id, filter...]`, `["EVENT", event]`, `["CLOSE", sub_id]`
//! - Relay → client: `["EVENT", sub_id, event]`, `["NOTICE", text]`, `["EOSE", sub_id]`,
//!   `["OK", event_id, accepted, message]`, `["CLOSED", sub_id, message]`

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::event::{event_from_value, Event};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame: {0}")]
    InvalidFormat(String),

    #[error("unknown frame type: {0}")]
    UnknownType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Standing subscription filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Filter {
    pub kinds: Vec<u16>,
    pub since: u64,
}

/// Frames sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientFrame<'a> {
    Req {
        subscription_id: &'a str,
        filters: &'a [Filter],
    },
    Event(&'a Event),
    Close {
        subscription_id: &'a str,
    },
}

impl ClientFrame<'_> {
    pub fn to_json(&self) -> Result<String, FrameError> {
        let value = match self {
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = Vec::with_capacity(filters.len() + 2);
                arr.push(Value::String("REQ".into()));
                arr.push(Value::String((*subscription_id).to_string()));
                for filter in filters.iter() {
                    arr.push(serde_json::to_value(filter)?);
                }
                Value::Array(arr)
            }
            Self::Event(event) => serde_json::json!(["EVENT", event]),
            Self::Close { subscription_id } => serde_json::json!(["CLOSE", subscription_id]),
        };
        Ok(value.to_string())
    }
}

/// Frames received from a relay.
#[derive(Debug, Clone)]
pub enum RelayFrame {
    Event {
        subscription_id: String,
        event: Event,
    },
    Notice(String),
    Eose(String),
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Closed {
        subscription_id: String,
        message: String,
    },
}

fn string_at(arr: &[Value], idx: usize, what: &str) -> Result<String, FrameError> {
    arr.get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| FrameError::InvalidFormat(format!("missing {what}")))
}

impl RelayFrame {
    pub fn from_json(text: &str) -> Result<Self, FrameError> {
        let mut arr: Vec<Value> = serde_json::from_str(text)?;
        let kind = string_at(&arr, 0, "frame type")?;

        match kind.as_str() {
            "EVENT" => {
                let subscription_id = string_at(&arr, 1, "subscription id")?;
                if arr.len() < 3 {
                    return Err(FrameError::InvalidFormat("missing event".into()));
                }
                let event = event_from_value(arr.swap_remove(2))
                    .ok_or_else(|| FrameError::InvalidFormat("malformed event".into()))?;
                Ok(Self::Event {
                    subscription_id,
                    event,
                })
            }
            "NOTICE" => Ok(Self::Notice(string_at(&arr, 1, "notice text")?)),
            "EOSE" => Ok(Self::Eose(string_at(&arr, 1, "subscription id")?)),
            "OK" => Ok(Self::Ok {
                event_id: string_at(&arr, 1, "event id")?,
                accepted: arr.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: arr
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "CLOSED" => Ok(Self::Closed {
                subscription_id: string_at(&arr, 1, "subscription id")?,
                message: arr
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            other => Err(FrameError::UnknownType(other.to_string())),
        }
    }
}
