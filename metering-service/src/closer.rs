//! Billing period closing.
//!
//! A close archives the yearly figures into a [`HistoryRecord`], zeroes the
//! yearly sums and moves the yearly anchor to the next contract
//! anniversary. Manual closes need a positive end reading; the automatic
//! close at the anniversary boundary does not.

use meter_client::domain::{HistoryRecord, MeterKey};
use time::{Date, PrimitiveDateTime};

use crate::{
    periods::{anniversary_in, PeriodSums},
    tariff::CostSheet,
    units::round_to,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseState {
    #[default]
    Open,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CloseTrigger {
    /// Operator command with the end reading taken from the counter.
    Manual { end_reading: Option<f64> },
    /// Yearly boundary reached; `new_anchor` comes from the accumulator.
    Automatic { new_anchor: PrimitiveDateTime },
}

impl CloseTrigger {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Manual { .. } => "manual",
            Self::Automatic { .. } => "automatic",
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum CloseError {
    #[error("no end reading entered")]
    MissingEndReading,
    #[error("end reading must be a positive number, got {0}")]
    InvalidEndReading(f64),
    #[error("billing year anchor cannot be resolved; meter has no period state yet")]
    UnresolvableAnchor,
    #[error("billing year {0} is already archived")]
    AlreadyArchived(i32),
}

/// Everything a close will write, computed before anything is mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosePlan {
    pub record: HistoryRecord,
    pub new_anchor: PrimitiveDateTime,
    /// Counter value the next period's consumption is measured from.
    pub next_starting_reading: Option<f64>,
}

/// Inputs of a close besides the trigger.
pub struct CloseContext<'a> {
    pub meter: &'a MeterKey,
    pub sums: Option<&'a PeriodSums>,
    pub costs: &'a CostSheet,
    pub contract: Option<Date>,
    pub split_tariff: bool,
    /// Current counter value (offset-corrected, counter units).
    pub current_reading: Option<f64>,
    pub now: PrimitiveDateTime,
}

/// Validate a close request and compute the archive record and new anchor.
///
/// `is_archived` reports whether a record for a given year already exists;
/// existing records are never overwritten.
pub fn plan_close(
    ctx: &CloseContext<'_>,
    trigger: CloseTrigger,
    is_archived: impl Fn(i32) -> bool,
) -> Result<ClosePlan, CloseError> {
    let end_reading = match trigger {
        CloseTrigger::Manual { end_reading: None } => return Err(CloseError::MissingEndReading),
        CloseTrigger::Manual {
            end_reading: Some(reading),
        } => {
            if !(reading.is_finite() && reading > 0.0) {
                return Err(CloseError::InvalidEndReading(reading));
            }
            Some(reading)
        }
        CloseTrigger::Automatic { .. } => None,
    };

    let sums = ctx.sums.ok_or(CloseError::UnresolvableAnchor)?;
    let year = sums.yearly.anchor.year();
    if is_archived(year) {
        return Err(CloseError::AlreadyArchived(year));
    }

    let new_anchor = match trigger {
        CloseTrigger::Automatic { new_anchor } => new_anchor,
        CloseTrigger::Manual { .. } => {
            // This year's anniversary, or the one after the current anchor
            // when the current period already started this year.
            let this_year = anniversary_in(ctx.now.year(), ctx.contract).midnight();
            let following = anniversary_in(year + 1, ctx.contract).midnight();
            this_year.max(following)
        }
    };

    let yearly = sums.yearly.current;
    let record = HistoryRecord {
        meter: ctx.meter.clone(),
        year,
        consumption: round_to(yearly.total, 3),
        volume: ctx.meter.utility.is_volumetric().then(|| round_to(yearly.volume, 3)),
        consumption_ht: ctx.split_tariff.then(|| round_to(yearly.high, 3)),
        consumption_nt: ctx.split_tariff.then(|| round_to(yearly.low, 3)),
        total_yearly: ctx.costs.total_yearly,
        balance: ctx.costs.balance,
        end_reading,
    };

    Ok(ClosePlan {
        record,
        new_anchor,
        next_starting_reading: end_reading.or(ctx.current_reading),
    })
}

/// Reset yearly sums and cost figures after the record was archived.
///
/// Basic charge and annual fee stay as displayed; they are recomputed from
/// configuration on the next cost update.
pub fn apply_close(plan: &ClosePlan, sums: &mut PeriodSums, costs: &mut CostSheet) {
    reset_year(plan.new_anchor, sums, costs);
}

/// Start a new billing year at `new_anchor` without archiving.
pub fn reset_year(new_anchor: PrimitiveDateTime, sums: &mut PeriodSums, costs: &mut CostSheet) {
    sums.yearly.close(new_anchor);
    costs.yearly = 0.0;
    costs.total_yearly = 0.0;
    costs.paid_total = 0.0;
    costs.balance = 0.0;
}
