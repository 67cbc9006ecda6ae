//! Rolling consumption windows per meter.
//!
//! Every window carries a running sum and an anchor: the instant its current
//! period started. Window closes are computed by [`next_boundary`], a pure
//! function of the anchor, so a sweep after downtime catches up on any
//! boundary it slept through.

use meter_client::domain::PeriodKind;
use time::{macros::time, Date, Duration, Month, PrimitiveDateTime, Time};

use crate::{tariff::TariffBand, tracker::AbsoluteConsumption};

/// Wall-clock time every window closes at.
pub const CLOSE_TIME: Time = time!(23:59);

/// A boundary passed by more than this is logged as a catch-up rather than
/// a scheduled close.
const CATCH_UP_GRACE: Duration = Duration::minutes(5);

const EPSILON: f64 = 1e-6;

/// A weekly window is only closed once it has run this long.
const MIN_WEEK: Duration = Duration::days(6);

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowFigures {
    pub total: f64,
    /// Gas only: consumption in m³ before conversion.
    pub volume: f64,
    pub high: f64,
    pub low: f64,
}

impl WindowFigures {
    fn add(&mut self, delta: f64, volume_delta: Option<f64>, band: Option<TariffBand>) {
        self.total += delta;
        if let Some(v) = volume_delta {
            self.volume += v;
        }
        match band {
            Some(TariffBand::High) => self.high += delta,
            Some(TariffBand::Low) => self.low += delta,
            None => {}
        }
    }

    fn absorb(&mut self, other: &WindowFigures) {
        self.total += other.total;
        self.volume += other.volume;
        self.high += other.high;
        self.low += other.low;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeriodWindow {
    pub kind: PeriodKind,
    pub current: WindowFigures,
    pub anchor: PrimitiveDateTime,
    /// Figures of the previous period, captured at the last close.
    pub last: Option<WindowFigures>,
    /// Anchor the previous period started at.
    pub last_anchor: Option<PrimitiveDateTime>,
}

impl PeriodWindow {
    pub fn new(kind: PeriodKind, anchor: PrimitiveDateTime) -> Self {
        Self {
            kind,
            current: WindowFigures::default(),
            anchor,
            last: None,
            last_anchor: None,
        }
    }

    /// Close the window: snapshot, zero, and move the anchor forward.
    pub fn close(&mut self, new_anchor: PrimitiveDateTime) -> WindowFigures {
        let closed = self.current;
        self.last = Some(closed);
        self.last_anchor = Some(self.anchor);
        self.current = WindowFigures::default();
        if new_anchor > self.anchor {
            self.anchor = new_anchor;
        }
        closed
    }
}

/// A window whose boundary has been reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueReset {
    pub kind: PeriodKind,
    /// Most recent boundary at or before `now`.
    pub boundary: PrimitiveDateTime,
    pub new_anchor: PrimitiveDateTime,
    /// More than one boundary was missed or the close is late.
    pub catch_up: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeriodSums {
    pub daily: PeriodWindow,
    pub weekly: PeriodWindow,
    pub monthly: PeriodWindow,
    pub yearly: PeriodWindow,
    /// Daily anchor for which the restart reconciliation already ran.
    pub reconciled_day: Option<PrimitiveDateTime>,
}

impl PeriodSums {
    /// Fresh sums. Short windows start now; the yearly window starts at the
    /// current billing year's anniversary.
    pub fn new(now: PrimitiveDateTime, contract: Option<Date>) -> Self {
        Self {
            daily: PeriodWindow::new(PeriodKind::Daily, now),
            weekly: PeriodWindow::new(PeriodKind::Weekly, now),
            monthly: PeriodWindow::new(PeriodKind::Monthly, now),
            yearly: PeriodWindow::new(PeriodKind::Yearly, billing_year_start(now.date(), contract).midnight()),
            reconciled_day: None,
        }
    }

    pub fn window(&self, kind: PeriodKind) -> &PeriodWindow {
        match kind {
            PeriodKind::Daily => &self.daily,
            PeriodKind::Weekly => &self.weekly,
            PeriodKind::Monthly => &self.monthly,
            PeriodKind::Yearly => &self.yearly,
        }
    }

    pub fn window_mut(&mut self, kind: PeriodKind) -> &mut PeriodWindow {
        match kind {
            PeriodKind::Daily => &mut self.daily,
            PeriodKind::Weekly => &mut self.weekly,
            PeriodKind::Monthly => &mut self.monthly,
            PeriodKind::Yearly => &mut self.yearly,
        }
    }

    pub fn apply_delta(&mut self, delta: f64, volume_delta: Option<f64>, band: Option<TariffBand>) {
        for kind in PeriodKind::ALL {
            self.window_mut(kind).current.add(delta, volume_delta, band);
        }
    }

    /// Replace yearly consumption with a value recomputed from the starting
    /// reading. HT/NT sub-sums keep their ratio; without a history the
    /// whole amount goes to `band`.
    pub fn set_yearly_absolute(&mut self, absolute: AbsoluteConsumption, band: Option<TariffBand>) {
        let yearly = &mut self.yearly.current;
        let split = yearly.high + yearly.low;

        if band.is_some() {
            if split > EPSILON {
                let ratio = absolute.consumption / split;
                yearly.high *= ratio;
                yearly.low *= ratio;
            } else {
                yearly.high = 0.0;
                yearly.low = 0.0;
                match band {
                    Some(TariffBand::High) => yearly.high = absolute.consumption,
                    Some(TariffBand::Low) => yearly.low = absolute.consumption,
                    None => {}
                }
            }
        }

        yearly.total = absolute.consumption;
        if let Some(volume) = absolute.volume {
            yearly.volume = volume;
        }
    }

    /// Windows whose boundary lies at or before `now`, shortest first.
    pub fn due_resets(&self, now: PrimitiveDateTime, contract: Option<Date>) -> Vec<DueReset> {
        PeriodKind::ALL
            .into_iter()
            .filter_map(|kind| due_reset(self.window(kind), now, contract))
            .collect()
    }

    /// Close `kind` and return the figures it held.
    pub fn reset(&mut self, kind: PeriodKind, new_anchor: PrimitiveDateTime) -> WindowFigures {
        self.window_mut(kind).close(new_anchor)
    }

    /// Repair a day lost across a restart.
    ///
    /// A weekly or monthly window that was open for the whole last closed
    /// day must contain that day plus today's running sum. If it does not,
    /// the last-day figures are added back, once per daily close. Without
    /// the start of the last day nothing is repaired.
    pub fn reconcile_after_restart(&mut self) -> Vec<PeriodKind> {
        let (Some(last_day), Some(last_day_start)) = (self.daily.last, self.daily.last_anchor) else {
            return Vec::new();
        };
        if self.reconciled_day == Some(self.daily.anchor) {
            return Vec::new();
        }

        let daily_anchor = self.daily.anchor;
        let today = self.daily.current.total;
        let mut repaired = Vec::new();

        for window in [&mut self.weekly, &mut self.monthly] {
            let spans_last_day = last_day_start >= window.anchor;
            if spans_last_day && window.current.total + EPSILON < last_day.total + today {
                window.current.absorb(&last_day);
                repaired.push(window.kind);
            }
        }

        self.reconciled_day = Some(daily_anchor);
        repaired
    }

    /// Zero any window whose sum cannot have been reached at
    /// `spike_threshold` per day for the days elapsed since its anchor.
    pub fn enforce_plausibility(&mut self, now: PrimitiveDateTime, spike_threshold: f64) -> Vec<(PeriodKind, f64)> {
        let mut cleared = Vec::new();
        for kind in PeriodKind::ALL {
            let window = self.window_mut(kind);
            let limit = spike_threshold * days_elapsed(window.anchor, now) as f64 * 2.0;
            if window.current.total > limit {
                cleared.push((kind, window.current.total));
                window.current = WindowFigures::default();
            }
        }
        cleared
    }

    /// Whole days until the next contract anniversary.
    pub fn days_until_anniversary(&self, now: PrimitiveDateTime, contract: Option<Date>) -> i64 {
        let boundary = next_boundary(PeriodKind::Yearly, self.yearly.anchor, contract);
        let anniversary = boundary.date().next_day().unwrap_or(boundary.date());
        (anniversary - now.date()).whole_days()
    }
}

/// Days since `anchor`, rounded up, at least 1.
pub fn days_elapsed(anchor: PrimitiveDateTime, now: PrimitiveDateTime) -> i64 {
    let seconds = (now - anchor).whole_seconds();
    let days = (seconds + 86_399).div_euclid(86_400);
    days.max(1)
}

/// First boundary that may close `window`. A week that started less than
/// six days before its Sunday runs on to the following Sunday.
fn first_close(window: &PeriodWindow, contract: Option<Date>) -> PrimitiveDateTime {
    let mut boundary = next_boundary(window.kind, window.anchor, contract);
    if window.kind == PeriodKind::Weekly && boundary - window.anchor < MIN_WEEK {
        boundary = next_boundary(window.kind, boundary, contract);
    }
    boundary
}

fn due_reset(window: &PeriodWindow, now: PrimitiveDateTime, contract: Option<Date>) -> Option<DueReset> {
    let first = first_close(window, contract);
    if first > now {
        return None;
    }

    let mut boundary = first;
    let mut missed = 1u32;
    loop {
        let next = next_boundary(window.kind, boundary, contract);
        if next > now {
            break;
        }
        boundary = next;
        missed += 1;
    }

    let new_anchor = match window.kind {
        // The billing year starts on the anniversary itself.
        PeriodKind::Yearly => boundary + Duration::minutes(1),
        _ => boundary,
    };

    Some(DueReset {
        kind: window.kind,
        boundary,
        new_anchor,
        catch_up: missed > 1 || now - boundary > CATCH_UP_GRACE,
    })
}

/// First close instant of a `kind` window strictly after `anchor`.
pub fn next_boundary(kind: PeriodKind, anchor: PrimitiveDateTime, contract: Option<Date>) -> PrimitiveDateTime {
    let date = anchor.date();
    match kind {
        PeriodKind::Daily => {
            let candidate = date.with_time(CLOSE_TIME);
            if candidate > anchor {
                candidate
            } else {
                add_days(date, 1).with_time(CLOSE_TIME)
            }
        }
        PeriodKind::Weekly => {
            let to_sunday = 6 - i64::from(date.weekday().number_days_from_monday());
            let candidate = add_days(date, to_sunday).with_time(CLOSE_TIME);
            if candidate > anchor {
                candidate
            } else {
                add_days(date, to_sunday + 7).with_time(CLOSE_TIME)
            }
        }
        PeriodKind::Monthly => {
            let candidate = last_day_of_month(date.year(), date.month()).with_time(CLOSE_TIME);
            if candidate > anchor {
                candidate
            } else {
                let (year, month) = next_month(date.year(), date.month());
                last_day_of_month(year, month).with_time(CLOSE_TIME)
            }
        }
        PeriodKind::Yearly => {
            let year = date.year();
            (year..=year + 2)
                .map(|y| yearly_close(y, contract))
                .find(|b| *b > anchor)
                .unwrap_or_else(|| yearly_close(year + 3, contract))
        }
    }
}

/// Close instant of the billing year ending before the `year` anniversary.
fn yearly_close(year: i32, contract: Option<Date>) -> PrimitiveDateTime {
    let anniversary = anniversary_in(year, contract);
    add_days(anniversary, -1).with_time(CLOSE_TIME)
}

/// Contract anniversary in `year`; 1 January without a contract date.
/// A 29 February contract falls on 28 February in common years.
pub fn anniversary_in(year: i32, contract: Option<Date>) -> Date {
    let Some(contract) = contract else {
        return first_of_month(year, Month::January);
    };

    Date::from_calendar_date(year, contract.month(), contract.day())
        .or_else(|_| Date::from_calendar_date(year, contract.month(), contract.day() - 1))
        .unwrap_or_else(|_| first_of_month(year, contract.month()))
}

/// Start of the billing year containing `today`.
pub fn billing_year_start(today: Date, contract: Option<Date>) -> Date {
    let this_year = anniversary_in(today.year(), contract);
    if this_year <= today {
        this_year
    } else {
        anniversary_in(today.year() - 1, contract)
    }
}

pub fn last_day_of_month(year: i32, month: Month) -> Date {
    let (next_year, next) = next_month(year, month);
    add_days(first_of_month(next_year, next), -1)
}

fn next_month(year: i32, month: Month) -> (i32, Month) {
    match month {
        Month::December => (year + 1, Month::January),
        other => (year, other.next()),
    }
}

fn first_of_month(year: i32, month: Month) -> Date {
    Date::from_calendar_date(year, month, 1).unwrap_or(Date::MIN)
}

fn add_days(date: Date, days: i64) -> Date {
    date.checked_add(Duration::days(days)).unwrap_or(date)
}
