use serde::{Deserialize, Serialize};

/// One raw counter value as delivered by a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: String,
    pub value: f64,
}
