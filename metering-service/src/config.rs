use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use std::{fs, sync::Arc};

use meter_client::{
    db::{MemoryStateStore, PgStateStore, StateStore},
    domain::{MeterKey, SlugAllocator, UtilityType},
};
use time::{macros::format_description, Date, Time};

use crate::{
    tariff::{HighTariffWindow, SplitTariff, TariffSettings},
    tracker::{SpikePolicy, TrackerSettings, DEFAULT_RESTART_TOLERANCE, DEFAULT_SPIKE_THRESHOLD},
    units::{parse_decimal, GasConversion},
};

const DEFAULT_CALORIFIC_VALUE: f64 = 11.5;
const DEFAULT_CORRECTION_FACTOR: f64 = 0.95;
const DEFAULT_NOTIFY_DAYS: [i64; 4] = [30, 14, 7, 1];

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub http_bind_addr: String,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_sweep_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    pub uri: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl StoreConfig {
    /// Open the configured state store. Postgres stores get their table
    /// created on first use.
    pub async fn connect(&self) -> anyhow::Result<Arc<dyn StateStore>> {
        match self.kind {
            StoreKind::Memory => {
                tracing::warn!("using in-memory state store; state is lost on restart");
                Ok(Arc::new(MemoryStateStore::new()))
            }
            StoreKind::Postgres => {
                let uri = self
                    .uri
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("store.uri is required for the postgres store"))?;
                let pool = PgPoolOptions::new()
                    .max_connections(self.max_connections)
                    .connect(uri)
                    .await?;
                let store = PgStateStore::new(pool);
                store.ensure_schema().await?;
                Ok(Arc::new(store))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub service: ServiceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub metrics: Option<MetricsConfig>,
    /// Flat named-setting map, resolved by [`resolve_settings`].
    #[serde(default)]
    pub settings: toml::Table,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("METERING_CONFIG").unwrap_or_else(|_| "metering-config.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        let cfg: AppConfig = toml::from_str(&contents)?;
        Ok(cfg)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("setting '{key}': '{value}' is not a number")]
    InvalidNumber { key: String, value: String },
    #[error("setting '{key}': '{value}' is not a date (DD.MM.YYYY or YYYY-MM-DD)")]
    InvalidDate { key: String, value: String },
    #[error("setting '{key}': '{value}' is not a time of day (HH:MM)")]
    InvalidTime { key: String, value: String },
    #[error("setting '{key}': '{value}' is not a boolean")]
    InvalidFlag { key: String, value: String },
    #[error("setting '{key}' is required")]
    Missing { key: String },
    #[error("setting '{key}': {message}")]
    OutOfRange { key: String, message: String },
}

/// Typed settings of one meter, resolved once at load time.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterConfig {
    pub key: MeterKey,
    pub display_name: String,
    pub sensor_id: String,
    pub tracker: TrackerSettings,
    /// Counter value at the start of the contract period.
    pub starting_reading: Option<f64>,
    pub contract_start: Option<Date>,
    pub tariff: TariffSettings,
}

impl MeterConfig {
    pub fn split_tariff(&self) -> bool {
        self.tariff.split.is_some()
    }
}

/// Settings shared by all meters.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub spike_threshold: f64,
    pub restart_tolerance: f64,
    pub spike_policy: SpikePolicy,
    /// Days-before-anniversary thresholds that trigger a notification.
    pub notify_days: Vec<i64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            spike_threshold: DEFAULT_SPIKE_THRESHOLD,
            restart_tolerance: DEFAULT_RESTART_TOLERANCE,
            spike_policy: SpikePolicy::Rebaseline,
            notify_days: DEFAULT_NOTIFY_DAYS.to_vec(),
        }
    }
}

/// A meter (or the whole engine) left out of the configuration, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDiagnostic {
    pub scope: String,
    pub error: ConfigError,
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedSettings {
    pub engine: EngineSettings,
    pub meters: Vec<MeterConfig>,
    pub diagnostics: Vec<ConfigDiagnostic>,
}

impl ResolvedSettings {
    pub fn meters_of(&self, utility: UtilityType) -> impl Iterator<Item = &MeterConfig> {
        self.meters.iter().filter(move |m| m.key.utility == utility)
    }
}

/// Read access to one settings table, optionally with a key prefix
/// (`gas_price` for the main gas meter, `price` inside an auxiliary entry).
struct Lookup<'a> {
    table: &'a toml::Table,
    prefix: Option<&'a str>,
}

impl<'a> Lookup<'a> {
    fn key(&self, name: &str) -> String {
        match self.prefix {
            Some(p) => format!("{p}_{name}"),
            None => name.to_string(),
        }
    }

    fn raw(&self, name: &str) -> Option<&'a toml::Value> {
        self.table.get(&self.key(name))
    }

    fn text(&self, name: &str) -> Option<String> {
        match self.raw(name)? {
            toml::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            toml::Value::Integer(i) => Some(i.to_string()),
            _ => None,
        }
    }

    fn number(&self, name: &str) -> Result<Option<f64>, ConfigError> {
        let invalid = |value: String| ConfigError::InvalidNumber {
            key: self.key(name),
            value,
        };
        match self.raw(name) {
            None => Ok(None),
            Some(toml::Value::Integer(i)) => Ok(Some(*i as f64)),
            Some(toml::Value::Float(f)) => Ok(Some(*f)),
            Some(toml::Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(toml::Value::String(s)) => parse_decimal(s).map(Some).ok_or_else(|| invalid(s.clone())),
            Some(other) => Err(invalid(other.to_string())),
        }
    }

    fn number_or(&self, name: &str, default: f64) -> Result<f64, ConfigError> {
        Ok(self.number(name)?.unwrap_or(default))
    }

    fn flag(&self, name: &str) -> Result<Option<bool>, ConfigError> {
        match self.raw(name) {
            None => Ok(None),
            Some(toml::Value::Boolean(b)) => Ok(Some(*b)),
            Some(toml::Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(Some(true)),
                "false" | "no" | "0" | "off" | "" => Ok(Some(false)),
                _ => Err(ConfigError::InvalidFlag {
                    key: self.key(name),
                    value: s.clone(),
                }),
            },
            Some(other) => Err(ConfigError::InvalidFlag {
                key: self.key(name),
                value: other.to_string(),
            }),
        }
    }

    fn date(&self, name: &str) -> Result<Option<Date>, ConfigError> {
        let value = match self.raw(name) {
            None => return Ok(None),
            Some(toml::Value::Datetime(dt)) => dt.to_string(),
            Some(toml::Value::String(s)) if s.trim().is_empty() => return Ok(None),
            Some(toml::Value::String(s)) => s.trim().to_string(),
            Some(other) => other.to_string(),
        };
        parse_date(&value).map(Some).ok_or_else(|| ConfigError::InvalidDate {
            key: self.key(name),
            value,
        })
    }

    fn clock_time(&self, name: &str) -> Result<Option<Time>, ConfigError> {
        let Some(value) = self.text(name) else {
            return Ok(None);
        };
        Time::parse(&value, format_description!("[hour padding:none]:[minute]"))
            .map(Some)
            .map_err(|_| ConfigError::InvalidTime {
                key: self.key(name),
                value,
            })
    }
}

/// `DD.MM.YYYY` or ISO `YYYY-MM-DD`.
pub fn parse_date(input: &str) -> Option<Date> {
    let input = input.trim();
    Date::parse(input, format_description!("[year]-[month]-[day]"))
        .or_else(|_| Date::parse(input, format_description!("[day padding:none].[month padding:none].[year]")))
        .ok()
}

/// Resolve the flat setting map into typed per-meter records.
///
/// Problems with one meter are reported as diagnostics and only drop that
/// meter.
pub fn resolve_settings(settings: &toml::Table) -> ResolvedSettings {
    let mut resolved = ResolvedSettings::default();
    let global = Lookup {
        table: settings,
        prefix: None,
    };

    match resolve_engine(&global) {
        Ok(engine) => resolved.engine = engine,
        Err(error) => resolved.diagnostics.push(ConfigDiagnostic {
            scope: "engine".to_string(),
            error,
        }),
    }

    for utility in UtilityType::ALL {
        let main = Lookup {
            table: settings,
            prefix: Some(utility.as_str()),
        };
        let mut slugs = SlugAllocator::new();

        let enabled = match main.flag("enabled") {
            Ok(flag) => flag.unwrap_or_else(|| main.text("sensor_id").is_some()),
            Err(error) => {
                resolved.diagnostics.push(ConfigDiagnostic {
                    scope: utility.to_string(),
                    error,
                });
                false
            }
        };
        if !enabled {
            continue;
        }

        let gas = if utility.is_volumetric() {
            match resolve_gas(&main) {
                Ok(gas) => Some(gas),
                Err(error) => {
                    resolved.diagnostics.push(ConfigDiagnostic {
                        scope: utility.to_string(),
                        error,
                    });
                    continue;
                }
            }
        } else {
            None
        };

        let main_key = MeterKey::main(utility);
        match resolve_meter(&main, main_key.clone(), utility.to_string(), gas, &resolved.engine, true) {
            Ok(meter) => resolved.meters.push(meter),
            Err(error) => resolved.diagnostics.push(ConfigDiagnostic {
                scope: main_key.to_string(),
                error,
            }),
        }

        let aux = match settings.get(&format!("{utility}_meters")) {
            Some(toml::Value::Array(entries)) => entries.as_slice(),
            _ => &[],
        };
        for (idx, entry) in aux.iter().enumerate() {
            let Some(table) = entry.as_table() else {
                resolved.diagnostics.push(ConfigDiagnostic {
                    scope: format!("{utility}_meters[{idx}]"),
                    error: ConfigError::Missing {
                        key: "name".to_string(),
                    },
                });
                continue;
            };
            let lookup = Lookup { table, prefix: None };
            let Some(name) = lookup.text("name") else {
                resolved.diagnostics.push(ConfigDiagnostic {
                    scope: format!("{utility}_meters[{idx}]"),
                    error: ConfigError::Missing {
                        key: "name".to_string(),
                    },
                });
                continue;
            };

            let key = MeterKey::new(utility, slugs.allocate(&name));
            match resolve_meter(&lookup, key.clone(), name, gas, &resolved.engine, false) {
                Ok(meter) => resolved.meters.push(meter),
                Err(error) => resolved.diagnostics.push(ConfigDiagnostic {
                    scope: key.to_string(),
                    error,
                }),
            }
        }
    }

    resolved
}

fn resolve_engine(global: &Lookup<'_>) -> Result<EngineSettings, ConfigError> {
    let defaults = EngineSettings::default();
    let spike_threshold = global.number_or("spike_threshold", defaults.spike_threshold)?;
    if spike_threshold <= 0.0 {
        return Err(ConfigError::OutOfRange {
            key: "spike_threshold".to_string(),
            message: "must be positive".to_string(),
        });
    }

    let spike_policy = match global.number("spike_confirm_after")? {
        Some(n) if n >= 1.0 => SpikePolicy::ConfirmAfter(n as u32),
        _ => SpikePolicy::Rebaseline,
    };

    let notify_days = match global.raw("notify_days_before") {
        Some(toml::Value::Array(items)) => items.iter().filter_map(|v| v.as_integer()).collect(),
        Some(toml::Value::String(s)) => s.split(',').filter_map(|d| d.trim().parse().ok()).collect(),
        _ => defaults.notify_days,
    };

    Ok(EngineSettings {
        spike_threshold,
        restart_tolerance: global.number_or("restart_tolerance", defaults.restart_tolerance)?,
        spike_policy,
        notify_days,
    })
}

fn resolve_gas(main: &Lookup<'_>) -> Result<GasConversion, ConfigError> {
    let calorific = main.number_or("calorific_value", DEFAULT_CALORIFIC_VALUE)?;
    let correction = main.number_or("correction_factor", DEFAULT_CORRECTION_FACTOR)?;
    GasConversion::new(calorific, correction).map_err(|e| ConfigError::OutOfRange {
        key: main.key("calorific_value"),
        message: e.to_string(),
    })
}

fn resolve_meter(
    lookup: &Lookup<'_>,
    key: MeterKey,
    display_name: String,
    gas: Option<GasConversion>,
    engine: &EngineSettings,
    is_main: bool,
) -> Result<MeterConfig, ConfigError> {
    let sensor_id = lookup.text("sensor_id").ok_or_else(|| ConfigError::Missing {
        key: lookup.key("sensor_id"),
    })?;

    let split = if is_main && key.utility.supports_split_tariff() && lookup.flag("ht_nt_enabled")?.unwrap_or(false) {
        Some(resolve_split(lookup)?)
    } else {
        None
    };

    let tariff = TariffSettings {
        price: lookup.number("price")?,
        split,
        monthly_fee: lookup.number_or("basic_charge", 0.0)?,
        annual_fee: lookup.number_or("annual_fee", 0.0)?,
        monthly_prepayment: lookup.number_or("prepayment", 0.0)?,
    };

    Ok(MeterConfig {
        key,
        display_name,
        sensor_id,
        tracker: TrackerSettings {
            offset: lookup.number_or("offset", 0.0)?,
            gas,
            spike_threshold: engine.spike_threshold,
            restart_tolerance: engine.restart_tolerance,
            spike_policy: engine.spike_policy,
        },
        starting_reading: lookup.number("initial_reading")?,
        contract_start: lookup.date("contract_start")?,
        tariff,
    })
}

fn resolve_split(lookup: &Lookup<'_>) -> Result<SplitTariff, ConfigError> {
    let required = |name: &str| -> Result<f64, ConfigError> {
        lookup.number(name)?.ok_or_else(|| ConfigError::Missing { key: lookup.key(name) })
    };
    let required_time = |name: &str| -> Result<Time, ConfigError> {
        lookup.clock_time(name)?.ok_or_else(|| ConfigError::Missing { key: lookup.key(name) })
    };

    Ok(SplitTariff {
        high_price: required("ht_price")?,
        low_price: required("nt_price")?,
        window: HighTariffWindow {
            start: required_time("ht_start")?,
            end: required_time("ht_end")?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, time};

    fn settings(src: &str) -> toml::Table {
        toml::from_str(src).unwrap()
    }

    #[test]
    fn accepts_both_date_formats() {
        assert_eq!(parse_date("01.06.2024"), Some(date!(2024-06-01)));
        assert_eq!(parse_date("1.6.2024"), Some(date!(2024-06-01)));
        assert_eq!(parse_date("2024-06-01"), Some(date!(2024-06-01)));
        assert_eq!(parse_date("31.02.2024"), None);
        assert_eq!(parse_date("June 1st"), None);
    }

    #[test]
    fn resolves_main_and_auxiliary_meters() {
        let s = settings(
            r#"
            gas_sensor_id = "modbus.0.gas_total"
            gas_price = "0,1885"
            gas_calorific_value = "11,5"
            gas_correction_factor = 0.95
            gas_contract_start = "01.06.2021"
            gas_initial_reading = 0
            gas_basic_charge = 15.03
            gas_annual_fee = 60
            gas_prepayment = 150

            [[gas_meters]]
            name = "Werkstatt"
            sensor_id = "modbus.0.gas_workshop"
            price = 0.2

            [[gas_meters]]
            name = "werkstatt"
            sensor_id = "modbus.0.gas_workshop_2"
            price = 0.2
            "#,
        );

        let resolved = resolve_settings(&s);
        assert!(resolved.diagnostics.is_empty(), "{:?}", resolved.diagnostics);

        let names: Vec<_> = resolved.meters_of(UtilityType::Gas).map(|m| m.key.name.as_str()).collect();
        assert_eq!(names, vec!["main", "werkstatt", "werkstatt_2"]);

        let main = &resolved.meters[0];
        assert_eq!(main.tariff.price, Some(0.1885));
        assert_eq!(main.tariff.monthly_prepayment, 150.0);
        assert_eq!(main.contract_start, Some(date!(2021-06-01)));
        assert_eq!(main.tracker.gas, Some(GasConversion::new(11.5, 0.95).unwrap()));
        // auxiliary meters share the type's gas conversion
        assert_eq!(resolved.meters[1].tracker.gas, main.tracker.gas);
        assert_eq!(resolved.meters[1].display_name, "Werkstatt");
    }

    #[test]
    fn split_tariff_only_for_main_electricity_meter() {
        let s = settings(
            r#"
            electricity_sensor_id = "sml.0.total"
            electricity_ht_nt_enabled = true
            electricity_ht_price = 0.32
            electricity_nt_price = "0,22"
            electricity_ht_start = "6:00"
            electricity_ht_end = "22:00"

            [[electricity_meters]]
            name = "Wallbox"
            sensor_id = "sml.1.total"
            price = 0.3
            ht_nt_enabled = true
            "#,
        );

        let resolved = resolve_settings(&s);
        let main = &resolved.meters[0];
        let split = main.tariff.split.unwrap();
        assert_eq!(split.window.start, time!(06:00));
        assert_eq!(split.low_price, 0.22);
        assert!(resolved.meters[1].tariff.split.is_none());
    }

    #[test]
    fn broken_meter_is_skipped_with_diagnostic() {
        let s = settings(
            r#"
            water_sensor_id = "water.total"
            water_price = "abc"

            [[water_meters]]
            name = "Garden"
            sensor_id = "water.garden"
            price = 2.1
            "#,
        );

        let resolved = resolve_settings(&s);
        assert_eq!(resolved.meters.len(), 1);
        assert_eq!(resolved.meters[0].key.name, "garden");
        assert_eq!(resolved.diagnostics.len(), 1);
        assert_eq!(resolved.diagnostics[0].scope, "water/main");
        assert!(matches!(resolved.diagnostics[0].error, ConfigError::InvalidNumber { .. }));
    }

    #[test]
    fn invalid_gas_conversion_disables_gas() {
        let s = settings(
            r#"
            gas_sensor_id = "gas.total"
            gas_correction_factor = 1.2
            "#,
        );

        let resolved = resolve_settings(&s);
        assert!(resolved.meters.is_empty());
        assert!(matches!(resolved.diagnostics[0].error, ConfigError::OutOfRange { .. }));
    }

    #[test]
    fn engine_settings_from_flat_keys() {
        let s = settings(
            r#"
            spike_threshold = "250,5"
            spike_confirm_after = 3
            notify_days_before = "10, 2"
            "#,
        );

        let engine = resolve_settings(&s).engine;
        assert_eq!(engine.spike_threshold, 250.5);
        assert_eq!(engine.spike_policy, SpikePolicy::ConfirmAfter(3));
        assert_eq!(engine.notify_days, vec![10, 2]);
    }
}
