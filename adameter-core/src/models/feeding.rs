use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::new_record_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Breast {
    Left,
    Right,
}

impl fmt::Display for Breast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Breast::Left => write!(f, "left"),
            Breast::Right => write!(f, "right"),
        }
    }
}

impl FromStr for Breast {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "left" | "l" => Ok(Breast::Left),
            "right" | "r" => Ok(Breast::Right),
            _ => Err(format!("Invalid breast: {}. Valid values: left, right", s)),
        }
    }
}

/// A completed feeding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedingSession {
    pub id: String,
    pub breast: Breast,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_in_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl FeedingSession {
    pub fn new(breast: Breast, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        let duration_in_seconds = (end_time - start_time).num_seconds().max(0) as u64;
        Self {
            id: new_record_id(),
            breast,
            start_time,
            end_time,
            duration_in_seconds,
            device_id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

impl fmt::Display for FeedingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  {:<5} {}m{:02}s",
            self.start_time.format("%Y-%m-%d %H:%M"),
            self.breast,
            self.duration_in_seconds / 60,
            self.duration_in_seconds % 60
        )
    }
}

/// The feeding currently running, if any. Lives in the singleton slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedingInProgress {
    pub breast: Breast,
    pub start_time: DateTime<Utc>,
}

impl FeedingInProgress {
    pub fn start(breast: Breast) -> Self {
        Self {
            breast,
            start_time: Utc::now(),
        }
    }

    /// Turns the running feeding into a finished session ending at `end_time`.
    pub fn finish(&self, end_time: DateTime<Utc>) -> FeedingSession {
        FeedingSession::new(self.breast, self.start_time, end_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_breast_from_str() {
        assert_eq!("LEFT".parse::<Breast>().unwrap(), Breast::Left);
        assert_eq!("r".parse::<Breast>().unwrap(), Breast::Right);
        assert!("middle".parse::<Breast>().is_err());
    }

    #[test]
    fn test_finish_computes_duration() {
        let running = FeedingInProgress::start(Breast::Right);
        let session = running.finish(running.start_time + Duration::seconds(605));
        assert_eq!(session.duration_in_seconds, 605);
        assert_eq!(session.breast, Breast::Right);
    }

    #[test]
    fn test_negative_duration_clamps_to_zero() {
        let now = Utc::now();
        let session = FeedingSession::new(Breast::Left, now, now - Duration::seconds(5));
        assert_eq!(session.duration_in_seconds, 0);
    }
}
