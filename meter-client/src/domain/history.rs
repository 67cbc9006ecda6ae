use serde::{Deserialize, Serialize};

use super::MeterKey;

/// Archived figures of one closed billing year.
///
/// Written once by the period closer (or the CSV import) and never mutated
/// afterwards. `year` is the calendar year the closed period started in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub meter: MeterKey,
    pub year: i32,
    pub consumption: f64,
    pub volume: Option<f64>,
    pub consumption_ht: Option<f64>,
    pub consumption_nt: Option<f64>,
    pub total_yearly: f64,
    pub balance: f64,
    pub end_reading: Option<f64>,
}

impl HistoryRecord {
    /// State path of this record below the meter root.
    pub fn path(&self) -> String {
        history_path(&self.meter, self.year)
    }
}

pub fn history_path(meter: &MeterKey, year: i32) -> String {
    meter.path(&format!("history.{year}"))
}
