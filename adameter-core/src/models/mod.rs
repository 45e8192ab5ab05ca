mod diaper_change;
mod event;
mod feeding;
mod growth;
mod medication;

pub use diaper_change::DiaperChange;
pub use event::{Event, EventType};
pub use feeding::{Breast, FeedingInProgress, FeedingSession};
pub use growth::GrowthMeasurement;
pub use medication::{
    AdministrationStatus, IntervalUnit, MedicationAdministration, MedicationRegimen,
    MedicationSchedule, Prescriber,
};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A record stored in one of the durable collections.
///
/// Ids are unique within a collection. `device_id` names the device that
/// last wrote the record, when known.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn id(&self) -> &str;

    fn device_id(&self) -> Option<&str>;

    fn set_device_id(&mut self, device_id: &str);
}

/// Implements [`Record`] for a struct with `id` and `device_id` fields.
macro_rules! impl_record {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Record for $ty {
                fn id(&self) -> &str {
                    &self.id
                }

                fn device_id(&self) -> Option<&str> {
                    self.device_id.as_deref()
                }

                fn set_device_id(&mut self, device_id: &str) {
                    self.device_id = Some(device_id.to_string());
                }
            }
        )*
    };
}

impl_record!(
    DiaperChange,
    Event,
    FeedingSession,
    GrowthMeasurement,
    MedicationRegimen,
    MedicationAdministration,
);

pub(crate) fn new_record_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
