//! Sensor delta tracking.
//!
//! Each meter owns a [`SensorSession`] holding the last calibrated reading.
//! The session turns raw, monotonically increasing counter values into
//! non-negative deltas and decides whether a reading is accepted, ignored,
//! or forces a re-baseline (counter reset, implausible jump).

use crate::units::{round_to, ConversionError, GasConversion};

pub const DEFAULT_SPIKE_THRESHOLD: f64 = 500.0;
pub const DEFAULT_RESTART_TOLERANCE: f64 = 5.0;

/// Precision calibrated readings and deltas are kept at.
const READING_DECIMALS: u32 = 3;

/// What to do when a reading jumps by more than the spike threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpikePolicy {
    /// Reject the delta and adopt the reading as the new baseline every time.
    #[default]
    Rebaseline,
    /// Reject the delta but keep the pre-spike baseline; only after this many
    /// consecutive spikes is the new level adopted as genuine drift.
    ConfirmAfter(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerSettings {
    pub offset: f64,
    pub gas: Option<GasConversion>,
    pub spike_threshold: f64,
    pub restart_tolerance: f64,
    pub spike_policy: SpikePolicy,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            offset: 0.0,
            gas: None,
            spike_threshold: DEFAULT_SPIKE_THRESHOLD,
            restart_tolerance: DEFAULT_RESTART_TOLERANCE,
            spike_policy: SpikePolicy::default(),
        }
    }
}

/// Last persisted "current reading", used to recover the baseline after a
/// restart.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadingSnapshot {
    pub calibrated: f64,
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingAction {
    /// First reading of the session adopted as baseline.
    Baseline,
    Accepted,
    Unchanged,
    /// Counter went backwards; treated as a meter replacement.
    CounterDecreased,
    /// Delta above the spike threshold; not accumulated.
    SpikeRejected,
    /// Repeated spikes confirmed the new level (see [`SpikePolicy::ConfirmAfter`]).
    DriftAccepted,
}

/// Consumption since the period's starting reading, recomputed whenever the
/// running delta chain was broken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AbsoluteConsumption {
    pub consumption: f64,
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadingOutcome {
    pub action: ReadingAction,
    pub accepted: bool,
    pub delta: f64,
    pub volume_delta: Option<f64>,
    pub calibrated: f64,
    pub volumetric: Option<f64>,
    pub recovered_from_snapshot: bool,
    /// Present when yearly consumption has to be replaced by this value.
    pub absolute: Option<AbsoluteConsumption>,
}

impl ReadingOutcome {
    /// Fresh baseline without snapshot recovery: persisted sums may predate
    /// an outage and need a plausibility check.
    pub fn needs_sum_validation(&self) -> bool {
        self.action == ReadingAction::Baseline && !self.recovered_from_snapshot
    }

    pub fn snapshot(&self) -> ReadingSnapshot {
        ReadingSnapshot {
            calibrated: self.calibrated,
            volume: self.volumetric,
        }
    }
}

/// Per-meter tracking state for the lifetime of the process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorSession {
    baseline: Option<f64>,
    volume_baseline: Option<f64>,
    consecutive_spikes: u32,
}

impl SensorSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn baseline(&self) -> Option<f64> {
        self.baseline
    }

    pub fn is_started(&self) -> bool {
        self.baseline.is_some()
    }

    /// Apply offset and (for gas) the energy conversion.
    ///
    /// Returns `(calibrated, volumetric)`.
    pub fn calibrate(settings: &TrackerSettings, raw: f64) -> Result<(f64, Option<f64>), ConversionError> {
        if !raw.is_finite() {
            return Err(ConversionError::NotFinite);
        }

        let corrected = round_to(raw - settings.offset, READING_DECIMALS);
        match &settings.gas {
            Some(gas) => {
                let energy = gas.to_energy(corrected)?;
                Ok((round_to(energy, READING_DECIMALS), Some(corrected)))
            }
            None => Ok((corrected, None)),
        }
    }

    /// Feed one raw counter value.
    ///
    /// `snapshot` is only consulted for the first reading of the session.
    /// `starting_reading` is the counter value (in counter units) at the
    /// start of the current billing period, if known.
    pub fn process(
        &mut self,
        settings: &TrackerSettings,
        raw: f64,
        snapshot: Option<ReadingSnapshot>,
        starting_reading: Option<f64>,
    ) -> Result<ReadingOutcome, ConversionError> {
        let (calibrated, volumetric) = Self::calibrate(settings, raw)?;

        let mut recovered = false;
        if self.baseline.is_none() {
            if let Some(snap) = snapshot {
                if (snap.calibrated - calibrated).abs() < settings.restart_tolerance {
                    self.baseline = Some(snap.calibrated);
                    self.volume_baseline = snap.volume;
                    recovered = true;
                }
            }

            if !recovered {
                self.baseline = Some(calibrated);
                self.volume_baseline = volumetric;
                return Ok(ReadingOutcome {
                    action: ReadingAction::Baseline,
                    accepted: false,
                    delta: 0.0,
                    volume_delta: None,
                    calibrated,
                    volumetric,
                    recovered_from_snapshot: false,
                    absolute: absolute_consumption(settings, calibrated, volumetric, starting_reading)?,
                });
            }
        }

        let baseline = self.baseline.unwrap_or(calibrated);
        let delta = round_to(calibrated - baseline, READING_DECIMALS);
        let volume_delta = match (volumetric, self.volume_baseline) {
            (Some(v), Some(b)) => Some(round_to(v - b, READING_DECIMALS)),
            _ => None,
        };

        let mut outcome = ReadingOutcome {
            action: ReadingAction::Unchanged,
            accepted: false,
            delta: 0.0,
            volume_delta: None,
            calibrated,
            volumetric,
            recovered_from_snapshot: recovered,
            absolute: None,
        };

        if delta < 0.0 {
            self.consecutive_spikes = 0;
            self.move_baseline(calibrated, volumetric);
            outcome.action = ReadingAction::CounterDecreased;
            outcome.delta = delta;
            return Ok(outcome);
        }

        if delta == 0.0 {
            self.consecutive_spikes = 0;
            self.move_baseline(calibrated, volumetric);
            return Ok(outcome);
        }

        if delta <= settings.spike_threshold {
            self.consecutive_spikes = 0;
            self.move_baseline(calibrated, volumetric);
            outcome.action = ReadingAction::Accepted;
            outcome.accepted = true;
            outcome.delta = delta;
            outcome.volume_delta = volume_delta;
            return Ok(outcome);
        }

        outcome.delta = delta;
        match settings.spike_policy {
            SpikePolicy::Rebaseline => {
                self.move_baseline(calibrated, volumetric);
                outcome.action = ReadingAction::SpikeRejected;
                outcome.absolute = absolute_consumption(settings, calibrated, volumetric, starting_reading)?;
            }
            SpikePolicy::ConfirmAfter(needed) => {
                self.consecutive_spikes += 1;
                if self.consecutive_spikes >= needed.max(1) {
                    self.consecutive_spikes = 0;
                    self.move_baseline(calibrated, volumetric);
                    outcome.action = ReadingAction::DriftAccepted;
                    outcome.absolute = absolute_consumption(settings, calibrated, volumetric, starting_reading)?;
                } else {
                    outcome.action = ReadingAction::SpikeRejected;
                }
            }
        }

        Ok(outcome)
    }

    fn move_baseline(&mut self, calibrated: f64, volumetric: Option<f64>) {
        self.baseline = Some(calibrated);
        if volumetric.is_some() {
            self.volume_baseline = volumetric;
        }
    }
}

/// `max(0, reading − starting reading)`, converted for gas.
pub fn absolute_consumption(
    settings: &TrackerSettings,
    calibrated: f64,
    volumetric: Option<f64>,
    starting_reading: Option<f64>,
) -> Result<Option<AbsoluteConsumption>, ConversionError> {
    let Some(start) = starting_reading else {
        return Ok(None);
    };

    match (&settings.gas, volumetric) {
        (Some(gas), Some(volume)) => {
            let used = round_to((volume - start).max(0.0), READING_DECIMALS);
            Ok(Some(AbsoluteConsumption {
                consumption: round_to(gas.to_energy(used)?, READING_DECIMALS),
                volume: Some(used),
            }))
        }
        _ => Ok(Some(AbsoluteConsumption {
            consumption: round_to((calibrated - start).max(0.0), READING_DECIMALS),
            volume: None,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gas_settings(threshold: f64) -> TrackerSettings {
        TrackerSettings {
            gas: Some(GasConversion::new(11.5, 0.95).unwrap()),
            spike_threshold: threshold,
            ..TrackerSettings::default()
        }
    }

    #[test]
    fn first_reading_becomes_baseline() {
        let mut session = SensorSession::new();
        let out = session.process(&TrackerSettings::default(), 1200.0, None, None).unwrap();

        assert_eq!(out.action, ReadingAction::Baseline);
        assert!(!out.accepted);
        assert!(out.needs_sum_validation());
        assert_eq!(out.absolute, None);
        assert_eq!(session.baseline(), Some(1200.0));
    }

    #[test]
    fn offset_is_subtracted_before_anything_else() {
        let settings = TrackerSettings {
            offset: 100.0,
            ..TrackerSettings::default()
        };
        let mut session = SensorSession::new();
        let out = session.process(&settings, 1200.0, None, Some(1000.0)).unwrap();

        assert_eq!(out.calibrated, 1100.0);
        assert_eq!(out.absolute.map(|a| a.consumption), Some(100.0));
    }

    #[test]
    fn accepted_deltas_sum_to_total_increase() {
        let settings = TrackerSettings::default();
        let mut session = SensorSession::new();
        let readings = [1000.0, 1000.37, 1012.5, 1012.5, 1100.01, 1355.333, 1500.0];

        let mut sum = 0.0;
        for raw in readings {
            let out = session.process(&settings, raw, None, None).unwrap();
            if out.accepted {
                sum += out.delta;
            }
        }

        assert!((sum - 500.0).abs() < 0.005);
    }

    #[test]
    fn spike_is_rejected_and_next_delta_starts_from_spike() {
        let settings = TrackerSettings::default();
        let mut session = SensorSession::new();
        session.process(&settings, 100.0, None, None).unwrap();

        let spike = session.process(&settings, 900.0, None, None).unwrap();
        assert_eq!(spike.action, ReadingAction::SpikeRejected);
        assert!(!spike.accepted);

        let next = session.process(&settings, 905.0, None, None).unwrap();
        assert_eq!(next.action, ReadingAction::Accepted);
        assert_eq!(next.delta, 5.0);
    }

    #[test]
    fn spike_recomputes_absolute_consumption_from_start() {
        let settings = TrackerSettings::default();
        let mut session = SensorSession::new();
        session.process(&settings, 100.0, None, Some(40.0)).unwrap();

        let spike = session.process(&settings, 900.0, None, Some(40.0)).unwrap();
        assert_eq!(spike.absolute.map(|a| a.consumption), Some(860.0));
    }

    #[test]
    fn confirm_after_policy_holds_baseline_for_one_off_spikes() {
        let settings = TrackerSettings {
            spike_policy: SpikePolicy::ConfirmAfter(3),
            ..TrackerSettings::default()
        };
        let mut session = SensorSession::new();
        session.process(&settings, 100.0, None, None).unwrap();

        let spike = session.process(&settings, 9000.0, None, None).unwrap();
        assert_eq!(spike.action, ReadingAction::SpikeRejected);

        let back = session.process(&settings, 102.0, None, None).unwrap();
        assert_eq!(back.action, ReadingAction::Accepted);
        assert_eq!(back.delta, 2.0);

        session.process(&settings, 9000.0, None, None).unwrap();
        session.process(&settings, 9001.0, None, None).unwrap();
        let third = session.process(&settings, 9002.0, None, None).unwrap();
        assert_eq!(third.action, ReadingAction::DriftAccepted);
        assert_eq!(session.baseline(), Some(9002.0));
    }

    #[test]
    fn decreasing_counter_is_not_accepted() {
        let settings = gas_settings(DEFAULT_SPIKE_THRESHOLD);
        let mut session = SensorSession::new();
        session.process(&settings, 100.0, None, None).unwrap();

        let out = session.process(&settings, 4.576, None, None).unwrap();
        assert_eq!(out.action, ReadingAction::CounterDecreased);
        assert!(!out.accepted);
        assert_eq!(out.absolute, None);
    }

    #[test]
    fn gas_readings_track_volume_and_energy() {
        let settings = gas_settings(1000.0);
        let mut session = SensorSession::new();
        let start = session.process(&settings, 0.0, None, Some(0.0)).unwrap();
        assert_eq!(start.absolute, Some(AbsoluteConsumption { consumption: 0.0, volume: Some(0.0) }));

        let out = session.process(&settings, 50.0, None, Some(0.0)).unwrap();
        assert!(out.accepted);
        assert_eq!(out.volume_delta, Some(50.0));
        assert_eq!(out.delta, 546.25);
    }

    #[test]
    fn snapshot_within_tolerance_is_trusted() {
        let settings = TrackerSettings::default();
        let mut session = SensorSession::new();
        let snapshot = ReadingSnapshot {
            calibrated: 998.0,
            volume: None,
        };

        let out = session.process(&settings, 1000.0, Some(snapshot), None).unwrap();
        assert!(out.recovered_from_snapshot);
        assert_eq!(out.action, ReadingAction::Accepted);
        assert_eq!(out.delta, 2.0);
        assert!(!out.needs_sum_validation());
    }

    #[test]
    fn snapshot_outside_tolerance_is_discarded() {
        let settings = TrackerSettings::default();
        let mut session = SensorSession::new();
        let snapshot = ReadingSnapshot {
            calibrated: 700.0,
            volume: None,
        };

        let out = session.process(&settings, 1000.0, Some(snapshot), Some(600.0)).unwrap();
        assert_eq!(out.action, ReadingAction::Baseline);
        assert!(out.needs_sum_validation());
        assert_eq!(out.absolute.map(|a| a.consumption), Some(400.0));
    }

    #[test]
    fn invalid_gas_parameters_are_hard_errors() {
        let settings = TrackerSettings {
            gas: Some(GasConversion {
                calorific_value: 11.5,
                correction_factor: 1.5,
            }),
            ..TrackerSettings::default()
        };
        let mut session = SensorSession::new();
        assert_eq!(
            session.process(&settings, 1.0, None, None),
            Err(ConversionError::InvalidCorrectionFactor(1.5))
        );
        assert!(!session.is_started());
    }
}
