use crate::pipeline::{Envelope, PipelineError, Transform};
use meter_client::domain::SensorReading;

/// Pure validation of a raw `SensorReading`.
///
/// Rules:
/// - sensor_id must not be blank.
/// - value must be finite and non-negative (counters only count up).
pub fn validate_reading(env: Envelope<SensorReading>) -> Result<Envelope<SensorReading>, PipelineError> {
    let r = &env.payload;

    if r.sensor_id.trim().is_empty() {
        return Err(PipelineError::Transform("sensor_id must not be empty".to_string()));
    }

    if !r.value.is_finite() {
        return Err(PipelineError::Transform(format!("{}: value is not a number", r.sensor_id)));
    }

    if r.value < 0.0 {
        return Err(PipelineError::Transform(format!("{}: value must be non-negative", r.sensor_id)));
    }

    Ok(env)
}

#[derive(Clone, Default)]
pub struct ReadingValidation;

#[async_trait::async_trait]
impl Transform<SensorReading, SensorReading> for ReadingValidation {
    async fn apply(&self, input: Envelope<SensorReading>) -> Result<Envelope<SensorReading>, PipelineError> {
        match validate_reading(input) {
            Ok(env) => Ok(env),
            Err(e) => {
                metrics::counter!("meter_readings_rejected_total", "reason" => "invalid").increment(1);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(sensor_id: &str, value: f64) -> Envelope<SensorReading> {
        Envelope::now(SensorReading {
            sensor_id: sensor_id.to_string(),
            value,
        })
    }

    #[test]
    fn reading_validation_accepts_valid_reading() {
        assert!(validate_reading(reading("gas.total", 1234.567)).is_ok());
        assert!(validate_reading(reading("gas.total", 0.0)).is_ok());
    }

    #[test]
    fn reading_validation_rejects_negative_value() {
        let res = validate_reading(reading("gas.total", -0.1));
        assert!(matches!(res, Err(PipelineError::Transform(_))));
    }

    #[test]
    fn reading_validation_rejects_nan_and_blank_sensor() {
        assert!(matches!(
            validate_reading(reading("gas.total", f64::NAN)),
            Err(PipelineError::Transform(_))
        ));
        assert!(matches!(validate_reading(reading("  ", 1.0)), Err(PipelineError::Transform(_))));
    }
}
