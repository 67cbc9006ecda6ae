//! Conversion of counter values into billing units.

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum ConversionError {
    #[error("calorific value must be positive, got {0}")]
    InvalidCalorificValue(f64),
    #[error("correction factor must be in (0, 1], got {0}")]
    InvalidCorrectionFactor(f64),
    #[error("consumption must be non-negative, got {0}")]
    NegativeConsumption(f64),
    #[error("reading is not a finite number")]
    NotFinite,
}

/// Parameters of the gas volume-to-energy conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GasConversion {
    /// kWh per m³.
    pub calorific_value: f64,
    /// State number ("Z-Zahl").
    pub correction_factor: f64,
}

impl GasConversion {
    pub fn new(calorific_value: f64, correction_factor: f64) -> Result<Self, ConversionError> {
        let conv = Self {
            calorific_value,
            correction_factor,
        };
        conv.validate()?;
        Ok(conv)
    }

    pub fn validate(&self) -> Result<(), ConversionError> {
        if !(self.calorific_value.is_finite() && self.calorific_value > 0.0) {
            return Err(ConversionError::InvalidCalorificValue(self.calorific_value));
        }
        if !(self.correction_factor.is_finite() && self.correction_factor > 0.0 && self.correction_factor <= 1.0) {
            return Err(ConversionError::InvalidCorrectionFactor(self.correction_factor));
        }
        Ok(())
    }

    pub fn to_energy(&self, volume: f64) -> Result<f64, ConversionError> {
        gas_volume_to_energy(volume, self.calorific_value, self.correction_factor)
    }
}

/// energy (kWh) = volume (m³) × calorific value × correction factor
pub fn gas_volume_to_energy(volume: f64, calorific_value: f64, correction_factor: f64) -> Result<f64, ConversionError> {
    GasConversion {
        calorific_value,
        correction_factor,
    }
    .validate()?;

    if !volume.is_finite() {
        return Err(ConversionError::NotFinite);
    }
    if volume < 0.0 {
        return Err(ConversionError::NegativeConsumption(volume));
    }

    Ok(volume * calorific_value * correction_factor)
}

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Parse a number typed with either `,` or `.` as decimal separator.
///
/// Thousands separators are not supported; `1.234,5` is rejected.
pub fn parse_decimal(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if trimmed.is_empty() || (trimmed.contains(',') && trimmed.contains('.')) {
        return None;
    }
    trimmed.replace(',', ".").parse::<f64>().ok().filter(|v| v.is_finite())
}
