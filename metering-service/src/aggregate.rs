//! Per-type totals across all meters of a utility.

use crate::{periods::PeriodSums, tariff::CostSheet};

/// Per-meter figures feeding the totals. `None` while a meter is still
/// initializing; counted as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeterFigures {
    pub consumption: Option<ConsumptionFigures>,
    pub costs: Option<CostSheet>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConsumptionFigures {
    pub daily: f64,
    pub weekly: f64,
    pub monthly: f64,
    pub yearly: f64,
}

impl From<&PeriodSums> for ConsumptionFigures {
    fn from(sums: &PeriodSums) -> Self {
        Self {
            daily: sums.daily.current.total,
            weekly: sums.weekly.current.total,
            monthly: sums.monthly.current.total,
            yearly: sums.yearly.current.total,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Totals {
    pub consumption: ConsumptionFigures,
    pub cost_daily: f64,
    pub cost_weekly: f64,
    pub cost_monthly: f64,
    pub cost_total_yearly: f64,
    pub meters: usize,
}

/// Sum figures across meters; `None` with fewer than two meters.
pub fn sum_totals<'a, I>(meters: I) -> Option<Totals>
where
    I: IntoIterator<Item = &'a MeterFigures>,
{
    let mut totals = Totals::default();
    for figures in meters {
        totals.meters += 1;
        let c = figures.consumption.unwrap_or_default();
        totals.consumption.daily += c.daily;
        totals.consumption.weekly += c.weekly;
        totals.consumption.monthly += c.monthly;
        totals.consumption.yearly += c.yearly;

        let k = figures.costs.unwrap_or_default();
        totals.cost_daily += k.daily;
        totals.cost_weekly += k.weekly;
        totals.cost_monthly += k.monthly;
        totals.cost_total_yearly += k.total_yearly;
    }

    (totals.meters >= 2).then_some(totals)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meter(yearly: f64, total_yearly: f64) -> MeterFigures {
        MeterFigures {
            consumption: Some(ConsumptionFigures {
                yearly,
                ..ConsumptionFigures::default()
            }),
            costs: Some(CostSheet {
                total_yearly,
                ..CostSheet::default()
            }),
        }
    }

    #[test]
    fn two_meters_are_summed() {
        let meters = [meter(500.0, 60.0), meter(250.0, 30.0)];
        let totals = sum_totals(&meters).unwrap();

        assert_eq!(totals.consumption.yearly, 750.0);
        assert_eq!(totals.cost_total_yearly, 90.0);
        assert_eq!(totals.meters, 2);
    }

    #[test]
    fn single_meter_has_no_totals() {
        assert_eq!(sum_totals(&[meter(500.0, 60.0)]), None);
        assert_eq!(sum_totals(std::iter::empty()), None);
    }

    #[test]
    fn initializing_meters_count_as_zero() {
        let meters = [meter(500.0, 60.0), MeterFigures::default()];
        let totals = sum_totals(&meters).unwrap();
        assert_eq!(totals.consumption.yearly, 500.0);
        assert_eq!(totals.cost_total_yearly, 60.0);
    }
}
