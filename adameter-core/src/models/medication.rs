use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::new_record_id;

/// Who prescribed a regimen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prescriber {
    #[serde(rename = "Self")]
    Own,
    Midwife,
    Doctor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Hours,
    Days,
}

/// When doses of a regimen are due.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MedicationSchedule {
    /// Every day at the given "HH:MM" times.
    Daily { times: Vec<String> },
    #[serde(rename_all = "camelCase")]
    Interval {
        first_dose_time: String,
        interval_unit: IntervalUnit,
        interval_value: u32,
    },
    #[serde(rename_all = "camelCase")]
    Weekly {
        days_of_week: Vec<String>,
        times: Vec<String>,
    },
    AsNeeded { details: String },
}

/// A planned course of a medication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationRegimen {
    pub id: String,
    pub name: String,
    pub dosage_amount: f64,
    pub dosage_unit: String,
    pub prescriber: Prescriber,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prescriber_name: Option<String>,
    pub schedule: MedicationSchedule,
    pub start_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_discontinued: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl MedicationRegimen {
    pub fn new(
        name: impl Into<String>,
        dosage_amount: f64,
        dosage_unit: impl Into<String>,
        schedule: MedicationSchedule,
        start_date: impl Into<String>,
    ) -> Self {
        Self {
            id: new_record_id(),
            name: name.into(),
            dosage_amount,
            dosage_unit: dosage_unit.into(),
            prescriber: Prescriber::Own,
            prescriber_name: None,
            schedule,
            start_date: start_date.into(),
            end_date: None,
            is_discontinued: None,
            notes: None,
            device_id: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_discontinued != Some(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdministrationStatus {
    #[serde(rename = "On Time")]
    OnTime,
    Missed,
    Adjusted,
}

impl fmt::Display for AdministrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdministrationStatus::OnTime => write!(f, "On Time"),
            AdministrationStatus::Missed => write!(f, "Missed"),
            AdministrationStatus::Adjusted => write!(f, "Adjusted"),
        }
    }
}

/// A single given (or missed) dose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationAdministration {
    pub id: String,
    pub medication_name: String,
    pub dosage_amount: f64,
    pub dosage_unit: String,
    pub administration_status: AdministrationStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regimen_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl MedicationAdministration {
    pub fn given(regimen: &MedicationRegimen, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: new_record_id(),
            medication_name: regimen.name.clone(),
            dosage_amount: regimen.dosage_amount,
            dosage_unit: regimen.dosage_unit.clone(),
            administration_status: AdministrationStatus::OnTime,
            timestamp,
            regimen_id: Some(regimen.id.clone()),
            details: None,
            device_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schedule_tagging() {
        let schedule = MedicationSchedule::Interval {
            first_dose_time: "09:00".to_string(),
            interval_unit: IntervalUnit::Hours,
            interval_value: 8,
        };
        let value = serde_json::to_value(&schedule).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "interval",
                "firstDoseTime": "09:00",
                "intervalUnit": "hours",
                "intervalValue": 8
            })
        );

        let as_needed: MedicationSchedule =
            serde_json::from_value(json!({"type": "asNeeded", "details": "fever"})).unwrap();
        assert_eq!(
            as_needed,
            MedicationSchedule::AsNeeded {
                details: "fever".to_string()
            }
        );
    }

    #[test]
    fn test_prescriber_self() {
        let value = serde_json::to_value(Prescriber::Own).unwrap();
        assert_eq!(value, json!("Self"));
    }

    #[test]
    fn test_administration_from_regimen() {
        let regimen = MedicationRegimen::new(
            "Vitamin D",
            1.0,
            "drop",
            MedicationSchedule::Daily {
                times: vec!["08:00".to_string()],
            },
            "2024-01-01",
        );
        let dose = MedicationAdministration::given(&regimen, Utc::now());
        assert_eq!(dose.regimen_id.as_deref(), Some(regimen.id.as_str()));
        let value = serde_json::to_value(&dose).unwrap();
        assert_eq!(value["administrationStatus"], "On Time");
    }
}
