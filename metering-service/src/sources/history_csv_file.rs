use std::{fs::File, path::PathBuf};

use csv::StringRecord;
use meter_client::domain::{slugify, HistoryRecord, MeterKey, UtilityType, MAIN_METER};

use crate::{
    pipeline::{Envelope, EnvelopeStream, PipelineError, Source},
    units::parse_decimal,
};

/// CSV import of archived billing years.
///
/// Expected header columns (by name):
/// - utility (gas, water, electricity, generation)
/// - meter (optional; empty for the main meter). Takes the slug the meter
///   got in the state tree, e.g. `garten` or `main_2`. Display names are
///   slugified on the way in but are not re-allocated, so a meter whose name
///   clashed at configuration time (a second "Main") must be given by its
///   suffixed slug.
/// - year
/// - consumption
/// - volume (optional)
/// - consumption_ht, consumption_nt (optional)
/// - total_yearly
/// - balance
/// - end_reading (optional)
///
/// Numbers accept `,` or `.` as decimal separator; use `;` as field
/// delimiter when decimals are written with commas.
pub struct HistoryCsvFileSource {
    path: PathBuf,
    delimiter: u8,
}

impl HistoryCsvFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            delimiter: b';',
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }
}

fn parse_optional_f64(s: &str) -> Result<Option<f64>, String> {
    if s.trim().is_empty() {
        Ok(None)
    } else {
        parse_decimal(s).map(Some).ok_or_else(|| format!("'{s}' is not a number"))
    }
}

fn record_to_history(record: &StringRecord, headers: &StringRecord) -> Result<HistoryRecord, PipelineError> {
    let get = |name: &str| -> Result<&str, PipelineError> {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .and_then(|idx| record.get(idx))
            .ok_or_else(|| PipelineError::Source(format!("missing column '{name}' in CSV record")))
    };
    let required = |name: &str| -> Result<f64, PipelineError> {
        let raw = get(name)?;
        parse_decimal(raw).ok_or_else(|| PipelineError::Source(format!("invalid {name} '{raw}'")))
    };
    let optional = |name: &str| -> Result<Option<f64>, PipelineError> {
        match get(name) {
            Ok(raw) => parse_optional_f64(raw).map_err(|e| PipelineError::Source(format!("invalid {name}: {e}"))),
            Err(_) => Ok(None),
        }
    };

    let utility: UtilityType = get("utility")?
        .trim()
        .parse()
        .map_err(|e| PipelineError::Source(format!("{e}")))?;

    let meter = match get("meter").map(str::trim) {
        Ok(name) if !name.is_empty() => slugify(name),
        _ => MAIN_METER.to_string(),
    };

    let year_str = get("year")?;
    let year: i32 = year_str
        .trim()
        .parse()
        .map_err(|e| PipelineError::Source(format!("invalid year '{year_str}': {e}")))?;

    Ok(HistoryRecord {
        meter: MeterKey::new(utility, meter),
        year,
        consumption: required("consumption")?,
        volume: optional("volume")?,
        consumption_ht: optional("consumption_ht")?,
        consumption_nt: optional("consumption_nt")?,
        total_yearly: required("total_yearly")?,
        balance: required("balance")?,
        end_reading: optional("end_reading")?,
    })
}

#[async_trait::async_trait]
impl Source<HistoryRecord> for HistoryCsvFileSource {
    async fn stream(&self) -> EnvelopeStream<HistoryRecord> {
        // Blocking reader inside a single task; history files are small.
        let path = self.path.clone();
        let delimiter = self.delimiter;
        let s = async_stream::try_stream! {
            let file = File::open(&path)
                .map_err(|e| PipelineError::Source(format!("failed to open CSV file: {e}")))?;
            let mut rdr = csv::ReaderBuilder::new()
                .delimiter(delimiter)
                .trim(csv::Trim::All)
                .from_reader(file);
            let headers = rdr
                .headers()
                .map_err(|e| PipelineError::Source(format!("failed to read CSV headers: {e}")))?
                .clone();

            for result in rdr.records() {
                let record = result.map_err(|e| PipelineError::Source(format!(
                    "failed to read CSV record: {e}"
                )))?;

                let history = match record_to_history(&record, &headers) {
                    Ok(h) => h,
                    Err(e) => {
                        metrics::counter!("history_csv_parse_errors_total").increment(1);
                        Err(e)?
                    }
                };

                yield Envelope::now(history);
            }
        };

        Box::pin(s)
    }
}
