//! Stateful metering engine for one utility type.
//!
//! A [`UtilityLedger`] owns every meter of its type plus the type's totals
//! and is driven by a single task (see [`worker`]), so none of its state is
//! shared.

pub mod persist;
pub mod worker;

use std::{collections::BTreeMap, sync::Arc};

use meter_client::{
    db::{StateStore, StoreError},
    domain::{HistoryRecord, MeterKey, PeriodKind, UtilityType},
};
use time::PrimitiveDateTime;

use crate::{
    aggregate::{sum_totals, ConsumptionFigures, MeterFigures, Totals},
    clock::Clock,
    closer::{apply_close, plan_close, reset_year, CloseContext, CloseError, CloseState, CloseTrigger},
    config::{EngineSettings, MeterConfig},
    notify::{Notification, Notifier},
    periods::{DueReset, PeriodSums},
    tariff::{compute_costs, CostSheet},
    tracker::{ReadingAction, ReadingSnapshot, SensorSession},
    units::ConversionError,
};

use persist::{Layout, StateWriter, CLOSE_COMMAND, END_READING, NOTIFIED_THRESHOLD, STARTING_READING};

#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("meter {0} is not configured")]
    UnknownMeter(MeterKey),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("billing close rejected: {0}")]
    Close(#[from] CloseError),
}

impl LedgerError {
    /// Errors that stop a whole sweep instead of just the meter at hand.
    pub fn is_severe(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_severe())
    }
}

struct MeterState {
    config: MeterConfig,
    session: SensorSession,
    /// Last persisted reading; consulted only for the first reading after
    /// a restart.
    snapshot: Option<ReadingSnapshot>,
    /// `None` until the meter saw its first reading.
    sums: Option<PeriodSums>,
    costs: Option<CostSheet>,
    starting_reading: Option<f64>,
    close_state: CloseState,
    notified_threshold: Option<i64>,
    price_warned: bool,
}

impl MeterState {
    fn key(&self) -> &MeterKey {
        &self.config.key
    }

    fn layout(&self) -> Layout {
        Layout {
            volumetric: self.config.key.utility.is_volumetric(),
            split: self.config.split_tariff(),
        }
    }

    /// Current counter value in counter units (m³ for gas).
    fn current_reading(&self) -> Option<f64> {
        self.snapshot.map(|s| s.volume.unwrap_or(s.calibrated))
    }
}

pub struct UtilityLedger {
    utility: UtilityType,
    settings: EngineSettings,
    meters: BTreeMap<String, MeterState>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
}

impl UtilityLedger {
    pub fn new(
        utility: UtilityType,
        settings: EngineSettings,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            utility,
            settings,
            meters: BTreeMap::new(),
            store,
            clock,
            notifier,
        }
    }

    pub fn utility(&self) -> UtilityType {
        self.utility
    }

    pub fn meter_names(&self) -> impl Iterator<Item = &str> {
        self.meters.keys().map(String::as_str)
    }

    pub fn sums(&self, meter: &str) -> Option<&PeriodSums> {
        self.meters.get(meter).and_then(|m| m.sums.as_ref())
    }

    pub fn costs(&self, meter: &str) -> Option<&CostSheet> {
        self.meters.get(meter).and_then(|m| m.costs.as_ref())
    }

    pub fn close_state(&self, meter: &str) -> Option<CloseState> {
        self.meters.get(meter).map(|m| m.close_state)
    }

    pub fn starting_reading(&self, meter: &str) -> Option<f64> {
        self.meters.get(meter).and_then(|m| m.starting_reading)
    }

    fn key(&self, meter: &str) -> MeterKey {
        MeterKey::new(self.utility, meter)
    }

    fn meter_mut(&mut self, meter: &str) -> Result<&mut MeterState, LedgerError> {
        let utility = self.utility;
        self.meters
            .get_mut(meter)
            .ok_or_else(|| LedgerError::UnknownMeter(MeterKey::new(utility, meter)))
    }

    /// Restore state for the configured meters and drop meters that are no
    /// longer configured.
    pub async fn init(&mut self, configs: Vec<MeterConfig>) -> Result<(), LedgerError> {
        let now = self.clock.now();
        let store = self.store.clone();

        let known = match persist::load_meter_list(store.as_ref(), self.utility).await {
            Ok(known) => known,
            Err(e) if e.is_severe() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(utility = %self.utility, error = %e, "ignoring unreadable meter list");
                Vec::new()
            }
        };

        let configured: Vec<String> = configs.iter().map(|c| c.key.name.clone()).collect();
        for stale in known.iter().filter(|name| !configured.contains(*name)) {
            let key = self.key(stale);
            store.delete_subtree(&key.state_path()).await?;
            tracing::info!(meter = %key, "removed state of meter no longer configured");
        }

        for config in configs {
            let state = self.restore_meter(config, now).await?;
            self.meters.insert(state.key().name.clone(), state);
        }
        persist::save_meter_list(store.as_ref(), self.utility, &configured).await?;
        self.sync_totals_node().await?;

        let names: Vec<String> = self.meters.keys().cloned().collect();
        for name in &names {
            self.update_costs(name).await?;
        }
        self.update_totals().await?;

        tracing::info!(utility = %self.utility, meters = self.meters.len(), "ledger initialized");
        Ok(())
    }

    async fn restore_meter(&self, config: MeterConfig, now: PrimitiveDateTime) -> Result<MeterState, LedgerError> {
        let store = self.store.as_ref();
        let key = config.key.clone();

        let mut sums = persist::load_sums(store, &key, now, config.contract_start).await?;
        let snapshot = match sums {
            Some(_) => persist::load_snapshot(store, &key).await?,
            None => None,
        };
        let stored_start = store.get_f64(&key.path(STARTING_READING)).await?;
        let notified_threshold = store
            .get_f64(&key.path(NOTIFIED_THRESHOLD))
            .await?
            .filter(|t| *t >= 1.0)
            .map(|t| t as i64);

        if let Some(sums) = sums.as_mut() {
            for kind in sums.reconcile_after_restart() {
                tracing::info!(meter = %key, period = %kind, "restored last day into period sum after restart");
            }
        }

        let state = MeterState {
            starting_reading: stored_start.filter(|v| *v > 0.0).or(config.starting_reading),
            config,
            session: SensorSession::new(),
            snapshot,
            sums,
            costs: None,
            close_state: CloseState::Open,
            notified_threshold,
            price_warned: false,
        };

        persist::ensure_meter_nodes(store, &key, state.layout()).await?;
        if let Some(start) = state.starting_reading {
            StateWriter::new(store).set(&key.path(STARTING_READING), start).await?;
        }
        if let Some(sums) = &state.sums {
            persist::save_sums(store, &key, sums, state.layout()).await?;
        }
        Ok(state)
    }

    /// Feed one raw counter value of `meter`.
    pub async fn handle_reading(&mut self, meter: &str, raw: f64) -> Result<ReadingAction, LedgerError> {
        let now = self.clock.now();
        let threshold = self.settings.spike_threshold;
        let store = self.store.clone();
        let state = self.meter_mut(meter)?;
        let key = state.key().clone();

        let outcome = match state
            .session
            .process(&state.config.tracker, raw, state.snapshot, state.starting_reading)
        {
            Ok(outcome) => outcome,
            Err(e) => {
                metrics::counter!("meter_readings_rejected_total", "reason" => "conversion").increment(1);
                tracing::warn!(meter = %key, raw, error = %e, "reading rejected");
                return Err(e.into());
            }
        };
        state.snapshot = Some(outcome.snapshot());

        let band = state.config.tariff.band_at(now);
        let contract = state.config.contract_start;
        let layout = state.layout();
        let sums = state.sums.get_or_insert_with(|| PeriodSums::new(now, contract));

        match outcome.action {
            ReadingAction::Baseline => {
                if outcome.needs_sum_validation() {
                    for (kind, value) in sums.enforce_plausibility(now, threshold) {
                        tracing::warn!(meter = %key, period = %kind, value, "implausible period sum reset");
                    }
                }
                if let Some(absolute) = outcome.absolute {
                    sums.set_yearly_absolute(absolute, band);
                }
                tracing::info!(meter = %key, reading = outcome.calibrated, "baseline established");
            }
            ReadingAction::Accepted => {
                sums.apply_delta(outcome.delta, outcome.volume_delta, band);
                metrics::counter!("meter_readings_accepted_total").increment(1);
            }
            ReadingAction::Unchanged => {}
            ReadingAction::CounterDecreased => {
                metrics::counter!("meter_readings_rejected_total", "reason" => "decrease").increment(1);
                tracing::warn!(
                    meter = %key,
                    reading = outcome.calibrated,
                    delta = outcome.delta,
                    "counter decreased; meter replaced or reset, sums kept"
                );
            }
            ReadingAction::SpikeRejected => {
                metrics::counter!("meter_readings_rejected_total", "reason" => "spike").increment(1);
                tracing::warn!(
                    meter = %key,
                    delta = outcome.delta,
                    threshold = state.config.tracker.spike_threshold,
                    "implausible jump ignored"
                );
                if let Some(absolute) = outcome.absolute {
                    sums.set_yearly_absolute(absolute, band);
                }
            }
            ReadingAction::DriftAccepted => {
                tracing::info!(meter = %key, reading = outcome.calibrated, "repeated jump confirmed as new counter level");
                if let Some(absolute) = outcome.absolute {
                    sums.set_yearly_absolute(absolute, band);
                }
            }
        }

        persist::save_snapshot(store.as_ref(), &key, outcome.snapshot()).await?;
        if outcome.action == ReadingAction::Unchanged {
            return Ok(outcome.action);
        }
        persist::save_sums(store.as_ref(), &key, sums, layout).await?;

        self.update_costs(meter).await?;
        self.update_totals().await?;
        Ok(outcome.action)
    }

    /// Periodic pass: close commands, due period resets, anniversary
    /// notices, costs and totals.
    ///
    /// A failing meter is logged and skipped; only severe store errors end
    /// the pass early.
    pub async fn sweep(&mut self) -> Result<(), LedgerError> {
        let names: Vec<String> = self.meters.keys().cloned().collect();
        for name in &names {
            if let Err(e) = self.sweep_meter(name).await {
                if e.is_severe() {
                    return Err(e);
                }
                metrics::counter!("sweep_meter_errors_total").increment(1);
                tracing::error!(meter = %self.key(name), error = %e, "sweep failed for meter; continuing");
            }
        }
        match self.update_totals().await {
            Err(e) if !e.is_severe() => {
                tracing::error!(utility = %self.utility, error = %e, "totals update failed");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn sweep_meter(&mut self, meter: &str) -> Result<(), LedgerError> {
        self.check_close_command(meter).await?;
        self.run_due_resets(meter).await?;
        self.check_anniversary(meter).await?;
        self.update_costs(meter).await
    }

    async fn check_close_command(&mut self, meter: &str) -> Result<(), LedgerError> {
        let key = self.key(meter);
        let requested = StateWriter::new(self.store.as_ref())
            .get_bool(&key.path(CLOSE_COMMAND))
            .await?
            .unwrap_or(false);
        if !requested {
            return Ok(());
        }

        match self.request_close(meter, None).await {
            Ok(_) | Err(LedgerError::Close(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Operator close. Without `end_reading` the value entered in the
    /// store is used. The command flag is cleared either way.
    pub async fn request_close(&mut self, meter: &str, end_reading: Option<f64>) -> Result<HistoryRecord, LedgerError> {
        let key = self.meter_mut(meter)?.key().clone();
        let store = self.store.clone();
        let writer = StateWriter::new(store.as_ref());

        let end_reading = match end_reading {
            Some(value) => {
                writer.set(&key.path(END_READING), value).await?;
                Some(value)
            }
            None => writer.get_f64(&key.path(END_READING)).await?,
        };

        let result = self.close_period(meter, CloseTrigger::Manual { end_reading }).await;

        writer.set(&key.path(CLOSE_COMMAND), false).await?;
        if result.is_ok() {
            writer.set(&key.path(END_READING), 0.0).await?;
        }
        result
    }

    /// Archive the current billing year of `meter` and start the next one.
    pub async fn close_period(&mut self, meter: &str, trigger: CloseTrigger) -> Result<HistoryRecord, LedgerError> {
        let now = self.clock.now();
        let store = self.store.clone();
        let state = self.meter_mut(meter)?;
        let key = state.key().clone();
        let layout = state.layout();

        let year = state.sums.as_ref().map(|s| s.yearly.anchor.year());
        let archived = match year {
            Some(y) => persist::history_exists(store.as_ref(), &key, y).await?,
            None => false,
        };

        let mut costs = state.costs.unwrap_or_default();
        let ctx = CloseContext {
            meter: &key,
            sums: state.sums.as_ref(),
            costs: &costs,
            contract: state.config.contract_start,
            split_tariff: state.config.split_tariff(),
            current_reading: state.current_reading(),
            now,
        };
        let plan = match plan_close(&ctx, trigger, |y| archived && Some(y) == year) {
            Ok(plan) => plan,
            Err(e) => {
                metrics::counter!("billing_close_rejected_total").increment(1);
                tracing::warn!(meter = %key, trigger = trigger.label(), error = %e, "billing close rejected");
                return Err(e.into());
            }
        };

        state.close_state = CloseState::Closing;
        match persist::write_history(store.as_ref(), &plan.record).await {
            Ok(true) => {}
            Ok(false) => {
                state.close_state = CloseState::Open;
                return Err(CloseError::AlreadyArchived(plan.record.year).into());
            }
            Err(e) => {
                state.close_state = CloseState::Open;
                tracing::error!(meter = %key, error = %e, "writing history record failed; period left open");
                return Err(e.into());
            }
        }

        let Some(sums) = state.sums.as_mut() else {
            state.close_state = CloseState::Open;
            return Err(CloseError::UnresolvableAnchor.into());
        };
        apply_close(&plan, sums, &mut costs);
        state.costs = Some(costs);
        state.starting_reading = plan.next_starting_reading.or(state.starting_reading);
        state.close_state = CloseState::Open;

        persist::save_sums(store.as_ref(), &key, sums, layout).await?;
        persist::save_costs(store.as_ref(), &key, &costs).await?;
        if let Some(start) = state.starting_reading {
            StateWriter::new(store.as_ref()).set(&key.path(STARTING_READING), start).await?;
        }

        metrics::counter!("billing_periods_closed_total", "trigger" => trigger.label()).increment(1);
        tracing::info!(
            meter = %key,
            year = plan.record.year,
            consumption = plan.record.consumption,
            balance = plan.record.balance,
            next_anchor = %plan.new_anchor,
            trigger = trigger.label(),
            "billing period closed"
        );

        self.update_costs(meter).await?;
        self.update_totals().await?;
        Ok(plan.record)
    }

    async fn run_due_resets(&mut self, meter: &str) -> Result<(), LedgerError> {
        let now = self.clock.now();
        let state = self.meter_mut(meter)?;
        let Some(sums) = &state.sums else {
            return Ok(());
        };
        let due = sums.due_resets(now, state.config.contract_start);
        if due.is_empty() {
            return Ok(());
        }

        for reset in due {
            let key = self.key(meter);
            if reset.catch_up {
                tracing::info!(meter = %key, period = %reset.kind, boundary = %reset.boundary, "catching up missed period close");
            }
            match reset.kind {
                PeriodKind::Yearly => self.close_year(meter, reset).await?,
                _ => self.close_window(meter, reset).await?,
            }
            metrics::counter!("period_resets_total", "period" => reset.kind.as_str()).increment(1);
        }

        let store = self.store.clone();
        let state = self.meter_mut(meter)?;
        if let Some(sums) = &state.sums {
            persist::save_sums(store.as_ref(), state.key(), sums, state.layout()).await?;
        }
        Ok(())
    }

    async fn close_window(&mut self, meter: &str, reset: DueReset) -> Result<(), LedgerError> {
        let state = self.meter_mut(meter)?;
        let Some(sums) = state.sums.as_mut() else {
            return Ok(());
        };
        let closed = sums.reset(reset.kind, reset.new_anchor);

        if reset.kind == PeriodKind::Monthly {
            let notification = Notification::MonthlySummary {
                meter: state.key().clone(),
                month_ending: reset.boundary.date(),
                consumption: closed.total,
                unit: state.key().utility.billing_unit(),
                cost: state.costs.map(|c| c.monthly),
                balance: state.costs.map(|c| c.balance),
            };
            self.notifier.notify(notification).await;
        }
        Ok(())
    }

    async fn close_year(&mut self, meter: &str, reset: DueReset) -> Result<(), LedgerError> {
        let trigger = CloseTrigger::Automatic {
            new_anchor: reset.new_anchor,
        };
        match self.close_period(meter, trigger).await {
            Ok(_) => Ok(()),
            Err(LedgerError::Close(CloseError::AlreadyArchived(year))) => {
                // Imported or manually closed already; only roll the window.
                tracing::info!(meter = %self.key(meter), year, "billing year already archived; starting next year");
                let store = self.store.clone();
                let state = self.meter_mut(meter)?;
                let mut costs = state.costs.unwrap_or_default();
                if let Some(sums) = state.sums.as_mut() {
                    reset_year(reset.new_anchor, sums, &mut costs);
                }
                state.costs = Some(costs);
                // The new year counts from the current counter value.
                state.starting_reading = state.current_reading().or(state.starting_reading);
                if let Some(start) = state.starting_reading {
                    StateWriter::new(store.as_ref())
                        .set(&state.key().path(STARTING_READING), start)
                        .await?;
                }
                Ok(())
            }
            Err(LedgerError::Close(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn check_anniversary(&mut self, meter: &str) -> Result<(), LedgerError> {
        let now = self.clock.now();
        let thresholds = self.settings.notify_days.clone();
        let store = self.store.clone();
        let state = self.meter_mut(meter)?;
        let Some(sums) = &state.sums else {
            return Ok(());
        };

        let days = sums.days_until_anniversary(now, state.config.contract_start);
        let crossed = thresholds.into_iter().filter(|t| *t > 0 && days <= *t).min();
        let writer = StateWriter::new(store.as_ref());
        let path = state.key().path(NOTIFIED_THRESHOLD);

        match crossed {
            Some(threshold) if state.notified_threshold != Some(threshold) => {
                state.notified_threshold = Some(threshold);
                writer.set(&path, threshold as f64).await?;
                let notification = Notification::AnniversaryApproaching {
                    meter: state.key().clone(),
                    days_remaining: days,
                    threshold,
                    balance: state.costs.map(|c| c.balance),
                };
                self.notifier.notify(notification).await;
            }
            None if state.notified_threshold.is_some() => {
                state.notified_threshold = None;
                writer.set(&path, 0.0).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Recompute the cost sheet of `meter` from its sums.
    pub async fn update_costs(&mut self, meter: &str) -> Result<(), LedgerError> {
        let now = self.clock.now();
        let store = self.store.clone();
        let state = self.meter_mut(meter)?;
        let Some(sums) = &state.sums else {
            return Ok(());
        };

        match compute_costs(sums, &state.config.tariff, now) {
            Ok(sheet) => {
                state.costs = Some(sheet);
                state.price_warned = false;
                persist::save_costs(store.as_ref(), state.key(), &sheet).await?;
            }
            Err(e) => {
                if !state.price_warned {
                    tracing::warn!(meter = %state.key(), error = %e, "cost update skipped");
                    state.price_warned = true;
                }
            }
        }
        Ok(())
    }

    /// Recompute the per-type totals. No-op with fewer than two meters or
    /// when the totals node is missing.
    pub async fn update_totals(&mut self) -> Result<Option<Totals>, LedgerError> {
        if self.meters.len() < 2 {
            return Ok(None);
        }
        let root = persist::totals_root(self.utility);
        if !self.store.node_exists(&root).await? {
            tracing::debug!(utility = %self.utility, "totals node not materialized; skipping");
            return Ok(None);
        }

        let figures: Vec<MeterFigures> = self
            .meters
            .values()
            .map(|m| MeterFigures {
                consumption: m.sums.as_ref().map(ConsumptionFigures::from),
                costs: m.costs,
            })
            .collect();
        let Some(totals) = sum_totals(&figures) else {
            return Ok(None);
        };

        persist::save_totals(self.store.as_ref(), self.utility, &totals).await?;
        Ok(Some(totals))
    }

    /// Drop a meter and all of its state.
    pub async fn remove_meter(&mut self, meter: &str) -> Result<(), LedgerError> {
        let key = self.key(meter);
        if self.meters.remove(meter).is_none() {
            return Err(LedgerError::UnknownMeter(key));
        }
        self.store.delete_subtree(&key.state_path()).await?;

        let names: Vec<String> = self.meters.keys().cloned().collect();
        persist::save_meter_list(self.store.as_ref(), self.utility, &names).await?;
        self.sync_totals_node().await?;
        self.update_totals().await?;

        tracing::info!(meter = %key, "meter removed");
        Ok(())
    }

    async fn sync_totals_node(&self) -> Result<(), StoreError> {
        if self.meters.len() >= 2 {
            persist::ensure_totals_nodes(self.store.as_ref(), self.utility).await
        } else {
            self.store.delete_subtree(&persist::totals_root(self.utility)).await
        }
    }
}
