use serde::{Deserialize, Serialize};

use super::new_record_id;

/// Whether an event marks a moment or spans a period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Point,
    Period,
}

/// A free-form diary event (vaccination, first smile, illness...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    /// Start date as written by the recording device.
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl Event {
    pub fn new(date: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: new_record_id(),
            date: date.into(),
            end_date: None,
            title: Some(title.into()),
            description: None,
            color: None,
            event_type: Some(EventType::Point),
            device_id: None,
        }
    }
}
