//! Wire messages exchanged between the agent and the tree server
//!
//! Every request frame is answered by exactly one `Reply` carrying the same
//! `request_id`. Subscription events reuse the id of the `Subscribe`
//! request; a later non-ok `Reply` on that id ends the subscription.

use crate::store::{ChildEvent, StoreError};
use prost::{Enumeration, Message};
use serde_json::Value;

#[derive(Clone, PartialEq, Message)]
pub struct Frame {
    #[prost(uint64, tag = "1")]
    pub request_id: u64,

    #[prost(oneof = "frame::Body", tags = "2, 3, 4, 5, 6, 7, 8")]
    pub body: Option<frame::Body>,
}

pub mod frame {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "2")]
        Write(super::Write),
        #[prost(message, tag = "3")]
        Delete(super::Delete),
        #[prost(message, tag = "4")]
        PushKey(super::PushKey),
        #[prost(message, tag = "5")]
        Subscribe(super::Subscribe),
        #[prost(message, tag = "6")]
        Unsubscribe(super::Unsubscribe),
        #[prost(message, tag = "7")]
        Reply(super::Reply),
        #[prost(message, tag = "8")]
        Event(super::Event),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Write {
    #[prost(string, tag = "1")]
    pub path: String,
    /// JSON text of the value; empty means `null`
    #[prost(string, tag = "2")]
    pub value_json: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Delete {
    #[prost(string, tag = "1")]
    pub path: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct PushKey {
    #[prost(string, tag = "1")]
    pub path: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Subscribe {
    #[prost(string, tag = "1")]
    pub path: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Unsubscribe {
    #[prost(uint64, tag = "1")]
    pub subscription_id: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct Reply {
    #[prost(bool, tag = "1")]
    pub ok: bool,
    #[prost(string, tag = "2")]
    pub error: String,
    /// Allocated key for `PushKey` requests
    #[prost(string, tag = "3")]
    pub key: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Event {
    #[prost(enumeration = "EventKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub key: String,
    #[prost(string, tag = "3")]
    pub value_json: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum EventKind {
    Unknown = 0,
    Added = 1,
    Changed = 2,
    Removed = 3,
}

impl Frame {
    pub fn new(request_id: u64, body: frame::Body) -> Self {
        Self {
            request_id,
            body: Some(body),
        }
    }
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            ok: true,
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: message.into(),
            ..Default::default()
        }
    }
}

/// Encode a value as JSON text for the wire
pub fn encode_value(value: &Value) -> Result<String, StoreError> {
    if value.is_null() {
        return Ok(String::new());
    }
    serde_json::to_string(value).map_err(|e| StoreError::Encoding(e.to_string()))
}

/// Decode JSON text from the wire
pub fn decode_value(text: &str) -> Result<Value, StoreError> {
    if text.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|e| StoreError::Encoding(e.to_string()))
}

impl Event {
    pub fn from_child_event(event: &ChildEvent) -> Result<Self, StoreError> {
        let (kind, key, value_json) = match event {
            ChildEvent::Added { key, value } => (EventKind::Added, key, encode_value(value)?),
            ChildEvent::Changed { key, value } => (EventKind::Changed, key, encode_value(value)?),
            ChildEvent::Removed { key } => (EventKind::Removed, key, String::new()),
        };
        Ok(Self {
            kind: kind.into(),
            key: key.clone(),
            value_json,
        })
    }

    pub fn into_child_event(self) -> Result<ChildEvent, StoreError> {
        let kind = EventKind::try_from(self.kind).unwrap_or(EventKind::Unknown);
        match kind {
            EventKind::Added => Ok(ChildEvent::Added {
                value: decode_value(&self.value_json)?,
                key: self.key,
            }),
            EventKind::Changed => Ok(ChildEvent::Changed {
                value: decode_value(&self.value_json)?,
                key: self.key,
            }),
            EventKind::Removed => Ok(ChildEvent::Removed { key: self.key }),
            EventKind::Unknown => Err(StoreError::Encoding(format!(
                "unknown event kind {}",
                self.kind
            ))),
        }
    }
}
