//! State-store layout of a meter and its (de)serialization.
//!
//! ```text
//! <type>.<meter>.info.currentReading        calibrated counter value
//! <type>.<meter>.info.currentVolume         gas only, m³
//! <type>.<meter>.info.startingReading       counter value at period start
//! <type>.<meter>.consumption.<period>[Volume|HT|NT]
//! <type>.<meter>.consumption.last<Period>[Volume|HT|NT]
//! <type>.<meter>.costs.<figure>
//! <type>.<meter>.statistics.anchor.<period>
//! <type>.<meter>.statistics.lastAnchor.<period>
//! <type>.<meter>.billing.closeCommand | endReading | notifiedThreshold
//! <type>.<meter>.history.<year>.<figure>
//! <type>.totals.consumption.<period> | costs.<figure>
//! ```

use meter_client::{
    db::{NodeSchema, StateStore, StoreError},
    domain::{totals_path, HistoryRecord, MeterKey, PeriodKind, UtilityType, METER_LIST_NODE, TOTALS_NODE},
};
use serde_json::Value;
use time::{macros::format_description, Date, PrimitiveDateTime};

use crate::{
    aggregate::Totals,
    periods::{PeriodSums, WindowFigures},
    tariff::CostSheet,
    tracker::ReadingSnapshot,
};

const CURRENCY: &str = "€";

pub const CURRENT_READING: &str = "info.currentReading";
pub const CURRENT_VOLUME: &str = "info.currentVolume";
pub const STARTING_READING: &str = "info.startingReading";
pub const CLOSE_COMMAND: &str = "billing.closeCommand";
pub const END_READING: &str = "billing.endReading";
pub const NOTIFIED_THRESHOLD: &str = "billing.notifiedThreshold";
const RECONCILED_DAY: &str = "statistics.reconciledDay";
/// JSON list of the meter slugs known to the store for one type.

const COST_FIGURES: [&str; 9] = [
    "daily",
    "weekly",
    "monthly",
    "yearly",
    "basicCharge",
    "annualFee",
    "totalYearly",
    "paidTotal",
    "balance",
];

/// Store writes with the engine's failure policy: every failure is logged
/// and counted, only severe ones are returned.
pub struct StateWriter<'a> {
    store: &'a dyn StateStore,
}

impl<'a> StateWriter<'a> {
    pub fn new(store: &'a dyn StateStore) -> Self {
        Self { store }
    }

    pub async fn set(&self, path: &str, value: impl Into<Value>) -> Result<(), StoreError> {
        let result = self.store.set_value(path, value.into()).await;
        self.check(path, result)
    }

    pub async fn ensure(&self, path: &str, schema: &NodeSchema) -> Result<(), StoreError> {
        let result = self.store.ensure_node(path, schema).await;
        self.check(path, result)
    }

    /// Read under the same policy; a skipped read yields `None`.
    pub async fn get_f64(&self, path: &str) -> Result<Option<f64>, StoreError> {
        let result = self.store.get_f64(path).await;
        Self::check_read(path, result)
    }

    pub async fn get_bool(&self, path: &str) -> Result<Option<bool>, StoreError> {
        let result = self.store.get_bool(path).await;
        Self::check_read(path, result)
    }

    fn check_read<T>(path: &str, result: Result<Option<T>, StoreError>) -> Result<Option<T>, StoreError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                metrics::counter!("state_store_read_errors_total").increment(1);
                if e.is_severe() {
                    tracing::error!(path, error = %e, "state store read failed");
                    Err(e)
                } else {
                    tracing::warn!(path, error = %e, "state store read skipped");
                    Ok(None)
                }
            }
        }
    }

    fn check(&self, path: &str, result: Result<(), StoreError>) -> Result<(), StoreError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                metrics::counter!("state_store_write_errors_total").increment(1);
                if e.is_severe() {
                    tracing::error!(path, error = %e, "state store write failed");
                    Err(e)
                } else {
                    tracing::warn!(path, error = %e, "state store write skipped");
                    Ok(())
                }
            }
        }
    }
}

pub fn format_anchor(at: PrimitiveDateTime) -> Option<String> {
    at.format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]")).ok()
}

pub fn parse_anchor(input: &str) -> Option<PrimitiveDateTime> {
    PrimitiveDateTime::parse(input.trim(), format_description!("[year]-[month]-[day] [hour]:[minute]:[second]")).ok()
}

fn anchor_path(key: &MeterKey, kind: PeriodKind) -> String {
    key.path(&format!("statistics.anchor.{kind}"))
}

/// Start of the period held in the `last<Period>` figures.
fn last_anchor_path(key: &MeterKey, kind: PeriodKind) -> String {
    key.path(&format!("statistics.lastAnchor.{kind}"))
}

/// Paths of total, volume, HT and NT for one window figure set.
fn figure_paths(key: &MeterKey, base: &str) -> [String; 4] {
    [
        key.path(&format!("consumption.{base}")),
        key.path(&format!("consumption.{base}Volume")),
        key.path(&format!("consumption.{base}HT")),
        key.path(&format!("consumption.{base}NT")),
    ]
}

/// Which optional figure columns a meter carries.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub volumetric: bool,
    pub split: bool,
}

/// Create every node of a meter that does not exist yet.
pub async fn ensure_meter_nodes(store: &dyn StateStore, key: &MeterKey, layout: Layout) -> Result<(), StoreError> {
    let w = StateWriter::new(store);
    let utility = key.utility;
    let unit = utility.billing_unit();
    let counter = utility.counter_unit();

    w.ensure(&key.state_path(), &NodeSchema::folder()).await?;
    w.ensure(&key.path(CURRENT_READING), &NodeSchema::number(unit)).await?;
    w.ensure(&key.path(STARTING_READING), &NodeSchema::number(counter).writable()).await?;
    if layout.volumetric {
        w.ensure(&key.path(CURRENT_VOLUME), &NodeSchema::number(counter)).await?;
    }

    let bases = PeriodKind::ALL
        .into_iter()
        .flat_map(|k| [k.as_str(), k.last_period_key()]);
    for base in bases {
        let [total, volume, high, low] = figure_paths(key, base);
        w.ensure(&total, &NodeSchema::number(unit)).await?;
        if layout.volumetric {
            w.ensure(&volume, &NodeSchema::number(counter)).await?;
        }
        if layout.split {
            w.ensure(&high, &NodeSchema::number(unit)).await?;
            w.ensure(&low, &NodeSchema::number(unit)).await?;
        }
    }

    for figure in COST_FIGURES {
        w.ensure(&key.path(&format!("costs.{figure}")), &NodeSchema::number(CURRENCY)).await?;
    }
    for kind in PeriodKind::ALL {
        w.ensure(&anchor_path(key, kind), &NodeSchema::timestamp()).await?;
        w.ensure(&last_anchor_path(key, kind), &NodeSchema::timestamp()).await?;
    }

    w.ensure(&key.path(CLOSE_COMMAND), &NodeSchema::flag().writable()).await?;
    w.ensure(&key.path(END_READING), &NodeSchema::number(counter).writable()).await?;
    w.ensure(&key.path(NOTIFIED_THRESHOLD), &NodeSchema::number("d")).await?;
    Ok(())
}

pub async fn ensure_totals_nodes(store: &dyn StateStore, utility: UtilityType) -> Result<(), StoreError> {
    let w = StateWriter::new(store);
    w.ensure(&format!("{utility}.{TOTALS_NODE}"), &NodeSchema::folder()).await?;
    for kind in PeriodKind::ALL {
        w.ensure(&totals_path(utility, &format!("consumption.{kind}")), &NodeSchema::number(utility.billing_unit()))
            .await?;
    }
    for figure in ["daily", "weekly", "monthly", "totalYearly"] {
        w.ensure(&totals_path(utility, &format!("costs.{figure}")), &NodeSchema::number(CURRENCY)).await?;
    }
    Ok(())
}

pub fn totals_root(utility: UtilityType) -> String {
    format!("{utility}.{TOTALS_NODE}")
}

pub async fn load_snapshot(store: &dyn StateStore, key: &MeterKey) -> Result<Option<ReadingSnapshot>, StoreError> {
    let Some(calibrated) = store.get_f64(&key.path(CURRENT_READING)).await? else {
        return Ok(None);
    };
    let volume = store.get_f64(&key.path(CURRENT_VOLUME)).await?;
    Ok(Some(ReadingSnapshot { calibrated, volume }))
}

pub async fn save_snapshot(store: &dyn StateStore, key: &MeterKey, snapshot: ReadingSnapshot) -> Result<(), StoreError> {
    let w = StateWriter::new(store);
    w.set(&key.path(CURRENT_READING), snapshot.calibrated).await?;
    if let Some(volume) = snapshot.volume {
        w.set(&key.path(CURRENT_VOLUME), volume).await?;
    }
    Ok(())
}

async fn load_figures(store: &dyn StateStore, key: &MeterKey, base: &str) -> Result<Option<WindowFigures>, StoreError> {
    let [total, volume, high, low] = figure_paths(key, base);
    let Some(total) = store.get_f64(&total).await? else {
        return Ok(None);
    };
    Ok(Some(WindowFigures {
        total,
        volume: store.get_f64(&volume).await?.unwrap_or_default(),
        high: store.get_f64(&high).await?.unwrap_or_default(),
        low: store.get_f64(&low).await?.unwrap_or_default(),
    }))
}

async fn save_figures(
    w: &StateWriter<'_>,
    key: &MeterKey,
    base: &str,
    figures: &WindowFigures,
    layout: Layout,
) -> Result<(), StoreError> {
    let [total, volume, high, low] = figure_paths(key, base);
    w.set(&total, figures.total).await?;
    if layout.volumetric {
        w.set(&volume, figures.volume).await?;
    }
    if layout.split {
        w.set(&high, figures.high).await?;
        w.set(&low, figures.low).await?;
    }
    Ok(())
}

/// Period sums as last persisted. `None` when the meter never stored a
/// yearly anchor.
pub async fn load_sums(
    store: &dyn StateStore,
    key: &MeterKey,
    now: PrimitiveDateTime,
    contract: Option<Date>,
) -> Result<Option<PeriodSums>, StoreError> {
    let yearly_anchor = store
        .get_string(&anchor_path(key, PeriodKind::Yearly))
        .await?
        .and_then(|s| parse_anchor(&s));
    if yearly_anchor.is_none() {
        return Ok(None);
    }

    let mut sums = PeriodSums::new(now, contract);
    for kind in PeriodKind::ALL {
        let anchor = store.get_string(&anchor_path(key, kind)).await?.and_then(|s| parse_anchor(&s));
        let current = load_figures(store, key, kind.as_str()).await?;
        let last = load_figures(store, key, kind.last_period_key()).await?;
        let last_anchor = store
            .get_string(&last_anchor_path(key, kind))
            .await?
            .and_then(|s| parse_anchor(&s));

        let window = sums.window_mut(kind);
        if let Some(anchor) = anchor {
            window.anchor = anchor;
        }
        window.current = current.unwrap_or_default();
        window.last = last;
        window.last_anchor = last_anchor;
    }
    sums.reconciled_day = store
        .get_string(&key.path(RECONCILED_DAY))
        .await?
        .and_then(|s| parse_anchor(&s));

    Ok(Some(sums))
}

pub async fn save_sums(store: &dyn StateStore, key: &MeterKey, sums: &PeriodSums, layout: Layout) -> Result<(), StoreError> {
    let w = StateWriter::new(store);
    for kind in PeriodKind::ALL {
        let window = sums.window(kind);
        save_figures(&w, key, kind.as_str(), &window.current, layout).await?;
        if let Some(last) = &window.last {
            save_figures(&w, key, kind.last_period_key(), last, layout).await?;
        }
        if let Some(anchor) = format_anchor(window.anchor) {
            w.set(&anchor_path(key, kind), anchor).await?;
        }
        if let Some(last_anchor) = window.last_anchor.and_then(format_anchor) {
            w.set(&last_anchor_path(key, kind), last_anchor).await?;
        }
    }
    if let Some(day) = sums.reconciled_day.and_then(format_anchor) {
        w.set(&key.path(RECONCILED_DAY), day).await?;
    }
    Ok(())
}

pub async fn save_costs(store: &dyn StateStore, key: &MeterKey, costs: &CostSheet) -> Result<(), StoreError> {
    let w = StateWriter::new(store);
    let values = [
        costs.daily,
        costs.weekly,
        costs.monthly,
        costs.yearly,
        costs.basic_charge,
        costs.annual_fee,
        costs.total_yearly,
        costs.paid_total,
        costs.balance,
    ];
    for (figure, value) in COST_FIGURES.into_iter().zip(values) {
        w.set(&key.path(&format!("costs.{figure}")), value).await?;
    }
    Ok(())
}

pub async fn save_totals(store: &dyn StateStore, utility: UtilityType, totals: &Totals) -> Result<(), StoreError> {
    let w = StateWriter::new(store);
    let c = &totals.consumption;
    for (kind, value) in PeriodKind::ALL.into_iter().zip([c.daily, c.weekly, c.monthly, c.yearly]) {
        w.set(&totals_path(utility, &format!("consumption.{kind}")), value).await?;
    }
    let costs = [
        ("daily", totals.cost_daily),
        ("weekly", totals.cost_weekly),
        ("monthly", totals.cost_monthly),
        ("totalYearly", totals.cost_total_yearly),
    ];
    for (figure, value) in costs {
        w.set(&totals_path(utility, &format!("costs.{figure}")), value).await?;
    }
    Ok(())
}

pub async fn history_exists(store: &dyn StateStore, key: &MeterKey, year: i32) -> Result<bool, StoreError> {
    store.node_exists(&meter_client::domain::history_path(key, year)).await
}

/// Write an archive record unless one exists for the same meter and year.
///
/// Returns `false` when the record was left untouched.
pub async fn write_history(store: &dyn StateStore, record: &HistoryRecord) -> Result<bool, StoreError> {
    let root = record.path();
    if store.node_exists(&root).await? {
        return Ok(false);
    }

    // All-or-nothing: a failed archive is removed again so the year is not
    // mistaken for archived on the next attempt.
    if let Err(e) = write_history_nodes(store, &root, record).await {
        if let Err(cleanup) = store.delete_subtree(&root).await {
            tracing::error!(path = %root, error = %cleanup, "partial archive left behind");
        }
        return Err(e);
    }
    Ok(true)
}

async fn write_history_nodes(store: &dyn StateStore, root: &str, record: &HistoryRecord) -> Result<(), StoreError> {
    let utility = record.meter.utility;
    let unit = utility.billing_unit();
    let counter = utility.counter_unit();

    let mut entries: Vec<(&str, NodeSchema, f64)> = vec![
        ("consumption", NodeSchema::number(unit), record.consumption),
        ("totalYearly", NodeSchema::number(CURRENCY), record.total_yearly),
        ("balance", NodeSchema::number(CURRENCY), record.balance),
    ];
    if let Some(volume) = record.volume {
        entries.push(("volume", NodeSchema::number(counter), volume));
    }
    if let Some(ht) = record.consumption_ht {
        entries.push(("consumptionHT", NodeSchema::number(unit), ht));
    }
    if let Some(nt) = record.consumption_nt {
        entries.push(("consumptionNT", NodeSchema::number(unit), nt));
    }
    if let Some(end) = record.end_reading {
        entries.push(("endReading", NodeSchema::number(counter), end));
    }

    for (figure, schema, value) in entries {
        let path = format!("{root}.{figure}");
        store.ensure_node(&path, &schema).await?;
        store.set_value(&path, Value::from(value)).await?;
    }
    store.ensure_node(root, &NodeSchema::folder()).await
}

pub async fn load_history(store: &dyn StateStore, key: &MeterKey, year: i32) -> Result<Option<HistoryRecord>, StoreError> {
    let root = meter_client::domain::history_path(key, year);
    if !store.node_exists(&root).await? {
        return Ok(None);
    }
    let get = |figure: &str| format!("{root}.{figure}");
    Ok(Some(HistoryRecord {
        meter: key.clone(),
        year,
        consumption: store.get_f64(&get("consumption")).await?.unwrap_or_default(),
        volume: store.get_f64(&get("volume")).await?,
        consumption_ht: store.get_f64(&get("consumptionHT")).await?,
        consumption_nt: store.get_f64(&get("consumptionNT")).await?,
        total_yearly: store.get_f64(&get("totalYearly")).await?.unwrap_or_default(),
        balance: store.get_f64(&get("balance")).await?.unwrap_or_default(),
        end_reading: store.get_f64(&get("endReading")).await?,
    }))
}

pub async fn load_meter_list(store: &dyn StateStore, utility: UtilityType) -> Result<Vec<String>, StoreError> {
    let Some(raw) = store.get_string(&format!("{utility}.{METER_LIST_NODE}")).await? else {
        return Ok(Vec::new());
    };
    serde_json::from_str(&raw).map_err(|e| StoreError::InvalidValue {
        path: format!("{utility}.{METER_LIST_NODE}"),
        message: e.to_string(),
    })
}

pub async fn save_meter_list(store: &dyn StateStore, utility: UtilityType, names: &[String]) -> Result<(), StoreError> {
    let path = format!("{utility}.{METER_LIST_NODE}");
    let w = StateWriter::new(store);
    w.ensure(&path, &NodeSchema::text()).await?;
    let encoded = serde_json::to_string(names).map_err(|e| StoreError::InvalidValue {
        path: path.clone(),
        message: e.to_string(),
    })?;
    w.set(&path, encoded).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_store::{Fault, FaultyStore};
    use meter_client::db::MemoryStateStore;
    use time::macros::{date, datetime};

    const GAS: Layout = Layout {
        volumetric: true,
        split: false,
    };

    #[test]
    fn anchors_round_trip_through_text() {
        let at = datetime!(2024-05-31 23:59);
        assert_eq!(format_anchor(at).as_deref(), Some("2024-05-31 23:59:00"));
        assert_eq!(parse_anchor("2024-05-31 23:59:00"), Some(at));
        assert_eq!(parse_anchor("yesterday"), None);
    }

    #[tokio::test]
    async fn sums_survive_a_restart() {
        let store = MemoryStateStore::new();
        let key = MeterKey::main(UtilityType::Gas);
        let contract = Some(date!(2021-06-01));

        let mut sums = PeriodSums::new(datetime!(2024-07-01 10:00), contract);
        sums.apply_delta(546.25, Some(50.0), None);
        sums.reset(PeriodKind::Daily, datetime!(2024-07-01 23:59));
        save_sums(&store, &key, &sums, GAS).await.unwrap();

        let loaded = load_sums(&store, &key, datetime!(2024-07-02 08:00), contract)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, sums);
    }

    #[tokio::test]
    async fn caught_up_week_is_not_repaired_after_reload() {
        let store = MemoryStateStore::new();
        let key = MeterKey::main(UtilityType::Water);
        let water = Layout {
            volumetric: false,
            split: false,
        };

        let mut sums = PeriodSums::new(datetime!(2024-05-06 10:00), None);
        sums.apply_delta(10.0, None, None);
        for due in sums.due_resets(datetime!(2024-05-14 09:00), None) {
            sums.reset(due.kind, due.new_anchor);
        }
        sums.apply_delta(3.0, None, None);
        save_sums(&store, &key, &sums, water).await.unwrap();

        let mut loaded = load_sums(&store, &key, datetime!(2024-05-14 09:05), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.daily.last_anchor, Some(datetime!(2024-05-06 10:00)));
        assert!(loaded.reconcile_after_restart().is_empty());
        assert_eq!(loaded.weekly.current.total, 3.0);
    }

    #[tokio::test]
    async fn missing_yearly_anchor_means_no_sums() {
        let store = MemoryStateStore::new();
        let key = MeterKey::main(UtilityType::Water);
        ensure_meter_nodes(
            &store,
            &key,
            Layout {
                volumetric: false,
                split: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(load_sums(&store, &key, datetime!(2024-07-02 08:00), None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn history_records_are_never_overwritten() {
        let store = MemoryStateStore::new();
        let key = MeterKey::main(UtilityType::Gas);
        let record = HistoryRecord {
            meter: key.clone(),
            year: 2023,
            consumption: 9876.5,
            volume: Some(900.0),
            consumption_ht: None,
            consumption_nt: None,
            total_yearly: 2100.0,
            balance: 300.0,
            end_reading: Some(4321.0),
        };

        assert!(write_history(&store, &record).await.unwrap());
        let second = HistoryRecord {
            consumption: 1.0,
            ..record.clone()
        };
        assert!(!write_history(&store, &second).await.unwrap());

        assert_eq!(load_history(&store, &key, 2023).await.unwrap(), Some(record));
        assert!(history_exists(&store, &key, 2023).await.unwrap());
        assert!(!history_exists(&store, &key, 2024).await.unwrap());
    }

    #[tokio::test]
    async fn failed_archive_leaves_no_partial_year() {
        let store = FaultyStore::new();
        let key = MeterKey::main(UtilityType::Water);
        let record = HistoryRecord {
            meter: key.clone(),
            year: 2023,
            consumption: 120.0,
            volume: None,
            consumption_ht: None,
            consumption_nt: None,
            total_yearly: 260.0,
            balance: -20.0,
            end_reading: Some(512.0),
        };
        let root = record.path();
        store.fail_under(&format!("{root}.balance"), Fault::Transient);

        assert!(write_history(&store, &record).await.is_err());
        assert!(!store.inner.node_exists(&format!("{root}.consumption")).await.unwrap());
        assert!(!history_exists(&store.inner, &key, 2023).await.unwrap());

        // The retry after the fault clears writes the full year.
        store.heal();
        assert!(write_history(&store, &record).await.unwrap());
        assert_eq!(load_history(&store, &key, 2023).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn meter_list_round_trips() {
        let store = MemoryStateStore::new();
        assert!(load_meter_list(&store, UtilityType::Water).await.unwrap().is_empty());

        let names = vec!["main".to_string(), "garden".to_string()];
        save_meter_list(&store, UtilityType::Water, &names).await.unwrap();
        assert_eq!(load_meter_list(&store, UtilityType::Water).await.unwrap(), names);
    }
}
