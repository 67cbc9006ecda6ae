//! Sensor id to meter routing.

use std::collections::{BTreeSet, HashMap};

use meter_client::domain::{MeterKey, UtilityType};

use crate::config::MeterConfig;

/// Maps every configured sensor to the meters it feeds. One sensor may feed
/// meters of several utility types.
#[derive(Debug, Clone, Default)]
pub struct SensorRegistry {
    routes: HashMap<String, Vec<MeterKey>>,
}

impl SensorRegistry {
    pub fn from_meters<'a>(meters: impl IntoIterator<Item = &'a MeterConfig>) -> Self {
        let mut routes: HashMap<String, Vec<MeterKey>> = HashMap::new();
        for meter in meters {
            routes.entry(meter.sensor_id.clone()).or_default().push(meter.key.clone());
        }
        Self { routes }
    }

    pub fn routes(&self, sensor_id: &str) -> &[MeterKey] {
        self.routes.get(sensor_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Utility types with at least one routed meter.
    pub fn utilities(&self) -> BTreeSet<UtilityType> {
        self.routes.values().flatten().map(|k| k.utility).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
