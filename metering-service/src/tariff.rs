//! Tariffs, fixed charges and the prepayment balance.
//!
//! Sign convention: `balance = total_yearly - paid_total`. A positive
//! balance is owed at the end of the billing year, a negative one is a
//! credit.

use meter_client::domain::PeriodKind;
use time::{Date, PrimitiveDateTime, Time};

use crate::{periods::PeriodSums, units::round_to};

const MONEY_DECIMALS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TariffBand {
    High,
    Low,
}

/// Daily high-tariff window `[start, end)`. `start > end` crosses midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HighTariffWindow {
    pub start: Time,
    pub end: Time,
}

impl HighTariffWindow {
    pub fn contains(&self, at: Time) -> bool {
        if self.start <= self.end {
            at >= self.start && at < self.end
        } else {
            at >= self.start || at < self.end
        }
    }

    pub fn band_at(&self, at: Time) -> TariffBand {
        if self.contains(at) {
            TariffBand::High
        } else {
            TariffBand::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitTariff {
    pub high_price: f64,
    pub low_price: f64,
    pub window: HighTariffWindow,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TariffSettings {
    /// Flat price per billing unit. Required unless a split tariff applies.
    pub price: Option<f64>,
    pub split: Option<SplitTariff>,
    pub monthly_fee: f64,
    pub annual_fee: f64,
    pub monthly_prepayment: f64,
}

impl TariffSettings {
    pub fn band_at(&self, at: PrimitiveDateTime) -> Option<TariffBand> {
        self.split.map(|s| s.window.band_at(at.time()))
    }
}

/// Costs and charges of one meter, all rounded to cents.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CostSheet {
    pub daily: f64,
    pub weekly: f64,
    pub monthly: f64,
    pub yearly: f64,
    pub basic_charge: f64,
    pub annual_fee: f64,
    pub total_yearly: f64,
    pub paid_total: f64,
    pub balance: f64,
    pub elapsed_months: u32,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TariffError {
    #[error("no price configured and split tariff disabled")]
    MissingPrice,
}

/// Months of the billing year started so far: calendar month difference
/// plus one, never below 1.
pub fn elapsed_months(anchor: Date, now: Date) -> u32 {
    let months = (now.year() - anchor.year()) * 12 + (i32::from(u8::from(now.month())) - i32::from(u8::from(anchor.month())));
    (months + 1).max(1) as u32
}

fn period_cost(figures: &crate::periods::WindowFigures, tariff: &TariffSettings) -> Result<f64, TariffError> {
    match (&tariff.split, tariff.price) {
        (Some(split), _) => Ok(figures.high * split.high_price + figures.low * split.low_price),
        (None, Some(price)) => Ok(figures.total * price),
        (None, None) => Err(TariffError::MissingPrice),
    }
}

/// Full cost sheet for the current sums.
pub fn compute_costs(sums: &PeriodSums, tariff: &TariffSettings, now: PrimitiveDateTime) -> Result<CostSheet, TariffError> {
    let cost = |kind: PeriodKind| period_cost(&sums.window(kind).current, tariff);

    let yearly = cost(PeriodKind::Yearly)?;
    let months = elapsed_months(sums.yearly.anchor.date(), now.date());
    let basic_charge = tariff.monthly_fee * f64::from(months);
    let total_yearly = (yearly + basic_charge + tariff.annual_fee).max(0.0);
    let paid_total = tariff.monthly_prepayment * f64::from(months);

    let total_yearly = round_to(total_yearly, MONEY_DECIMALS);
    let paid_total = round_to(paid_total, MONEY_DECIMALS);

    Ok(CostSheet {
        daily: round_to(cost(PeriodKind::Daily)?, MONEY_DECIMALS),
        weekly: round_to(cost(PeriodKind::Weekly)?, MONEY_DECIMALS),
        monthly: round_to(cost(PeriodKind::Monthly)?, MONEY_DECIMALS),
        yearly: round_to(yearly, MONEY_DECIMALS),
        basic_charge: round_to(basic_charge, MONEY_DECIMALS),
        annual_fee: round_to(tariff.annual_fee, MONEY_DECIMALS),
        total_yearly,
        paid_total,
        balance: round_to(total_yearly - paid_total, MONEY_DECIMALS),
        elapsed_months: months,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime, time};

    fn flat() -> TariffSettings {
        TariffSettings {
            price: Some(0.1885),
            split: None,
            monthly_fee: 15.03,
            annual_fee: 60.0,
            monthly_prepayment: 150.0,
        }
    }

    #[test]
    fn elapsed_months_is_at_least_one() {
        assert_eq!(elapsed_months(date!(2024-06-01), date!(2024-06-01)), 1);
        assert_eq!(elapsed_months(date!(2024-06-01), date!(2024-06-30)), 1);
        assert_eq!(elapsed_months(date!(2024-06-01), date!(2024-12-15)), 7);
        assert_eq!(elapsed_months(date!(2024-06-01), date!(2025-05-31)), 12);
        // anchor moved ahead by an early close
        assert_eq!(elapsed_months(date!(2025-06-01), date!(2025-05-20)), 1);
    }

    #[test]
    fn flat_tariff_costs_every_window() {
        let mut sums = PeriodSums::new(datetime!(2024-06-01 00:00), Some(date!(2020-06-01)));
        sums.yearly.current.total = 730.01;

        let sheet = compute_costs(&sums, &flat(), datetime!(2024-12-15 12:00)).unwrap();

        assert_eq!(sheet.elapsed_months, 7);
        assert_eq!(sheet.yearly, 137.61);
        assert_eq!(sheet.basic_charge, 105.21);
        assert_eq!(sheet.annual_fee, 60.0);
        assert_eq!(sheet.total_yearly, 302.82);
    }

    #[test]
    fn balance_is_total_minus_paid() {
        let mut sums = PeriodSums::new(datetime!(2024-06-01 00:00), Some(date!(2020-06-01)));
        sums.yearly.current.total = 730.01;

        let sheet = compute_costs(&sums, &flat(), datetime!(2024-12-15 12:00)).unwrap();

        assert_eq!(sheet.paid_total, 1050.0);
        assert_eq!(sheet.balance, -747.18);
    }

    #[test]
    fn balance_identity_holds() {
        let mut sums = PeriodSums::new(datetime!(2024-01-01 00:00), None);
        for (i, consumption) in [0.0, 12.5, 999.99, 4321.0].into_iter().enumerate() {
            sums.yearly.current.total = consumption;
            let now = datetime!(2024-01-01 00:00) + time::Duration::days(45 * i as i64);
            let sheet = compute_costs(&sums, &flat(), now).unwrap();

            let expected_total = sheet.yearly + 15.03 * f64::from(sheet.elapsed_months) + 60.0;
            assert!((sheet.total_yearly - expected_total).abs() < 0.011);
            assert!((sheet.balance - (sheet.total_yearly - sheet.paid_total)).abs() < 1e-9);
        }
    }

    #[test]
    fn split_tariff_prices_bands_separately() {
        let tariff = TariffSettings {
            price: None,
            split: Some(SplitTariff {
                high_price: 0.30,
                low_price: 0.20,
                window: HighTariffWindow {
                    start: time!(06:00),
                    end: time!(22:00),
                },
            }),
            ..TariffSettings::default()
        };
        let mut sums = PeriodSums::new(datetime!(2024-01-01 00:00), None);
        sums.apply_delta(10.0, None, tariff.band_at(datetime!(2024-01-01 12:00)));
        sums.apply_delta(5.0, None, tariff.band_at(datetime!(2024-01-01 23:00)));

        let sheet = compute_costs(&sums, &tariff, datetime!(2024-01-02 00:00)).unwrap();
        assert_eq!(sheet.daily, 4.0);
        assert_eq!(sheet.yearly, 4.0);
    }

    #[test]
    fn high_tariff_window_may_cross_midnight() {
        let window = HighTariffWindow {
            start: time!(22:00),
            end: time!(06:00),
        };
        assert!(window.contains(time!(23:30)));
        assert!(window.contains(time!(05:59)));
        assert!(!window.contains(time!(06:00)));
        assert!(!window.contains(time!(12:00)));
    }

    #[test]
    fn missing_price_is_reported() {
        let sums = PeriodSums::new(datetime!(2024-01-01 00:00), None);
        let tariff = TariffSettings::default();
        assert_eq!(
            compute_costs(&sums, &tariff, datetime!(2024-01-02 00:00)),
            Err(TariffError::MissingPrice)
        );
    }

    #[test]
    fn total_yearly_never_negative() {
        let mut sums = PeriodSums::new(datetime!(2024-01-01 00:00), None);
        // generation meters may carry negative prices (feed-in credit)
        sums.yearly.current.total = 1000.0;
        let tariff = TariffSettings {
            price: Some(-0.08),
            ..TariffSettings::default()
        };
        let sheet = compute_costs(&sums, &tariff, datetime!(2024-03-01 00:00)).unwrap();
        assert_eq!(sheet.yearly, -80.0);
        assert_eq!(sheet.total_yearly, 0.0);
    }
}
