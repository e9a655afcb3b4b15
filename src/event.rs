//! Event data structures: what callers hand us and what we queue

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Header maps carry text or numbers, nothing else.
pub type HeaderMap = BTreeMap<String, HeaderValue>;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsentCategory {
    Necessary,
    Performance,
    Targeting,
}

impl ConsentCategory {
    pub const ALL: [ConsentCategory; 3] = [
        ConsentCategory::Necessary,
        ConsentCategory::Performance,
        ConsentCategory::Targeting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentCategory::Necessary => "NECESSARY",
            ConsentCategory::Performance => "PERFORMANCE",
            ConsentCategory::Targeting => "TARGETING",
        }
    }

    /// Case-insensitive parse; unknown names yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "NECESSARY" => Some(ConsentCategory::Necessary),
            "PERFORMANCE" => Some(ConsentCategory::Performance),
            "TARGETING" => Some(ConsentCategory::Targeting),
            _ => None,
        }
    }
}

impl fmt::Display for ConsentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum HeaderValue {
    Number(serde_json::Number),
    Text(String),
}

impl HeaderValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s),
            HeaderValue::Number(_) => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::Text(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::Text(s)
    }
}

impl From<i64> for HeaderValue {
    fn from(n: i64) -> Self {
        HeaderValue::Number(n.into())
    }
}

impl From<u64> for HeaderValue {
    fn from(n: u64) -> Self {
        HeaderValue::Number(n.into())
    }
}

/// An analytics event as supplied by the application.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingEvent {
    pub name: String,
    pub consent_category: ConsentCategory,
    pub payload: Value,
    #[serde(default)]
    pub headers: Option<HeaderMap>,
    /// Attach the bearer token (when one is available) to this event's headers
    #[serde(default)]
    pub requires_auth: bool,
}

impl IncomingEvent {
    pub fn new(name: impl Into<String>, consent_category: ConsentCategory, payload: Value) -> Self {
        Self {
            name: name.into(),
            consent_category,
            payload,
            headers: None,
            requires_auth: false,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers
            .get_or_insert_with(HeaderMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_auth(mut self) -> Self {
        self.requires_auth = true;
        self
    }
}

/// Serialized body of a queued event. `consent_category` never leaves the process.
#[derive(Serialize)]
pub(crate) struct PayloadRecord<'a> {
    pub name: &'a str,
    pub payload: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<&'a HeaderMap>,
    pub ts: i64,
    pub id: &'a str,
}

impl<'a> PayloadRecord<'a> {
    pub fn from_event(event: &'a IncomingEvent, ts: i64, id: &'a str) -> Self {
        Self {
            name: &event.name,
            payload: &event.payload,
            headers: event.headers.as_ref(),
            ts,
            id,
        }
    }
}

/// The queued, persisted and transmitted form of an event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WireEvent {
    pub id: String,
    pub name: String,
    pub headers: HeaderMap,
    pub payload: String,
}

impl WireEvent {
    pub fn new(id: String, name: String, headers: HeaderMap, payload: String) -> Self {
        Self {
            id,
            name,
            headers,
            payload,
        }
    }
}

/// Get current wall-clock time in milliseconds since the Unix epoch
pub fn current_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
