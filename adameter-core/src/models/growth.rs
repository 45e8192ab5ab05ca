use serde::{Deserialize, Serialize};

use super::new_record_id;

/// Weight in grams, lengths in centimetres.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrowthMeasurement {
    pub id: String,
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_circumference: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl GrowthMeasurement {
    pub fn new(date: impl Into<String>) -> Self {
        Self {
            id: new_record_id(),
            date: date.into(),
            weight: None,
            height: None,
            head_circumference: None,
            notes: None,
            device_id: None,
        }
    }

    pub fn with_weight(mut self, grams: f64) -> Self {
        self.weight = Some(grams);
        self
    }
}
