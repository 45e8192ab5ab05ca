use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::new_record_id;

/// A logged diaper change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiaperChange {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub contains_urine: bool,
    pub contains_stool: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abnormalities: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diaper_brand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leakage: Option<bool>,
    /// Body temperature in °C, if measured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl DiaperChange {
    pub fn new(timestamp: DateTime<Utc>, contains_urine: bool, contains_stool: bool) -> Self {
        Self {
            id: new_record_id(),
            timestamp,
            contains_urine,
            contains_stool,
            abnormalities: None,
            diaper_brand: None,
            leakage: None,
            temperature: None,
            device_id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        self.diaper_brand = Some(brand.into());
        self
    }
}

impl fmt::Display for DiaperChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let contents = match (self.contains_urine, self.contains_stool) {
            (true, true) => "urine + stool",
            (true, false) => "urine",
            (false, true) => "stool",
            (false, false) => "dry",
        };
        write!(f, "{}  {}", self.timestamp.format("%Y-%m-%d %H:%M"), contents)?;
        if self.leakage == Some(true) {
            write!(f, " (leaked)")?;
        }
        Ok(())
    }
}
