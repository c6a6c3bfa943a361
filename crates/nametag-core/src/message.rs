//! Wire frames exchanged with a relay
//!
//! Every frame is a JSON array whose first element names the frame type.
//! Both directions encode and decode so the same types serve a client and the
//! in-memory relay used in tests.

use serde_json::{json, Value};

use crate::errors::{NametagError, Result};
use crate::event::Event;
use crate::filter::Filter;

// ----------------------------------------------------------------------------
// Client -> Relay
// ----------------------------------------------------------------------------

/// Frames sent by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// `["EVENT", event]`
    Event(Box<Event>),
    /// `["REQ", subscription_id, filter...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// `["CLOSE", subscription_id]`
    Close(String),
}

impl ClientMessage {
    pub fn event(event: Event) -> Self {
        Self::Event(Box::new(event))
    }

    pub fn req(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self::Req {
            subscription_id: subscription_id.into(),
            filters,
        }
    }

    pub fn close(subscription_id: impl Into<String>) -> Self {
        Self::Close(subscription_id.into())
    }

    pub fn as_json(&self) -> Result<String> {
        let value = match self {
            Self::Event(event) => json!(["EVENT", event]),
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = vec![json!("REQ"), json!(subscription_id)];
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame)
            }
            Self::Close(subscription_id) => json!(["CLOSE", subscription_id]),
        };
        Ok(serde_json::to_string(&value)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let frame = parse_frame(text)?;
        match frame_type(&frame)? {
            "EVENT" => {
                let event = frame
                    .get(1)
                    .ok_or_else(|| NametagError::protocol("EVENT frame without event"))?;
                Ok(Self::event(serde_json::from_value(event.clone())?))
            }
            "REQ" => {
                let subscription_id = string_at(&frame, 1, "REQ")?;
                let filters = frame[2..]
                    .iter()
                    .map(|f| serde_json::from_value(f.clone()))
                    .collect::<std::result::Result<Vec<Filter>, _>>()?;
                if filters.is_empty() {
                    return Err(NametagError::protocol("REQ frame without filters"));
                }
                Ok(Self::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => Ok(Self::Close(string_at(&frame, 1, "CLOSE")?)),
            other => Err(NametagError::protocol(format!(
                "unknown client frame type {other}"
            ))),
        }
    }
}

// ----------------------------------------------------------------------------
// Relay -> Client
// ----------------------------------------------------------------------------

/// Frames received from a relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// `["EVENT", subscription_id, event]`
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    /// `["OK", event_id, accepted, message]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// `["EOSE", subscription_id]`
    EndOfStoredEvents(String),
    /// `["CLOSED", subscription_id, message]`
    Closed {
        subscription_id: String,
        message: String,
    },
    /// `["NOTICE", message]`
    Notice(String),
    /// `["AUTH", challenge]`
    Auth(String),
}

impl RelayMessage {
    pub fn event(subscription_id: impl Into<String>, event: Event) -> Self {
        Self::Event {
            subscription_id: subscription_id.into(),
            event: Box::new(event),
        }
    }

    pub fn ok(event_id: impl Into<String>, accepted: bool, message: impl Into<String>) -> Self {
        Self::Ok {
            event_id: event_id.into(),
            accepted,
            message: message.into(),
        }
    }

    pub fn as_json(&self) -> Result<String> {
        let value = match self {
            Self::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event]),
            Self::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            Self::EndOfStoredEvents(subscription_id) => json!(["EOSE", subscription_id]),
            Self::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id, message]),
            Self::Notice(message) => json!(["NOTICE", message]),
            Self::Auth(challenge) => json!(["AUTH", challenge]),
        };
        Ok(serde_json::to_string(&value)?)
    }

    /// Parse an inbound frame; anything off-shape is a protocol error
    pub fn from_json(text: &str) -> Result<Self> {
        let frame = parse_frame(text)?;
        match frame_type(&frame)? {
            "EVENT" => {
                let subscription_id = string_at(&frame, 1, "EVENT")?;
                let event = frame
                    .get(2)
                    .ok_or_else(|| NametagError::protocol("EVENT frame without event"))?;
                let event: Event = serde_json::from_value(event.clone())
                    .map_err(|e| NametagError::protocol(format!("malformed event: {e}")))?;
                Ok(Self::event(subscription_id, event))
            }
            "OK" => {
                let event_id = string_at(&frame, 1, "OK")?;
                let accepted = frame
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| NametagError::protocol("OK frame without status flag"))?;
                // Some relays omit the message on success
                let message = frame
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(Self::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            "EOSE" => Ok(Self::EndOfStoredEvents(string_at(&frame, 1, "EOSE")?)),
            "CLOSED" => Ok(Self::Closed {
                subscription_id: string_at(&frame, 1, "CLOSED")?,
                message: frame
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "NOTICE" => Ok(Self::Notice(string_at(&frame, 1, "NOTICE")?)),
            "AUTH" => Ok(Self::Auth(string_at(&frame, 1, "AUTH")?)),
            other => Err(NametagError::protocol(format!(
                "unknown relay frame type {other}"
            ))),
        }
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn parse_frame(text: &str) -> Result<Vec<Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) if !items.is_empty() => Ok(items),
        Ok(_) => Err(NametagError::protocol("frame is not a non-empty JSON array")),
        Err(e) => Err(NametagError::protocol(format!("frame is not JSON: {e}"))),
    }
}

fn frame_type(frame: &[Value]) -> Result<&str> {
    frame[0]
        .as_str()
        .ok_or_else(|| NametagError::protocol("frame type is not a string"))
}

fn string_at(frame: &[Value], index: usize, frame_type: &str) -> Result<String> {
    frame
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            NametagError::protocol(format!(
                "{frame_type} frame missing string at position {index}"
            ))
        })
}
