//! Operator endpoints served next to the ingest route.
//!
//! - `POST /billing/close` `{utility, meter?, end_reading?}` closes the
//!   current billing year and answers with the archived record.
//! - `GET /billing/history/:utility/:meter/:year` reads an archived year.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use meter_client::{
    db::StateStore,
    domain::{HistoryRecord, MeterKey, UtilityType, MAIN_METER},
};

use crate::engine::{
    persist,
    worker::{DispatchError, Dispatcher},
    LedgerError,
};

#[derive(Clone)]
struct ControlState {
    dispatcher: Dispatcher,
    store: Arc<dyn StateStore>,
}

#[derive(Debug, serde::Deserialize)]
struct CloseRequest {
    utility: String,
    #[serde(default)]
    meter: Option<String>,
    #[serde(default)]
    end_reading: Option<f64>,
}

type ApiError = (StatusCode, String);

pub fn billing_router(dispatcher: Dispatcher, store: Arc<dyn StateStore>) -> Router {
    Router::new()
        .route("/billing/close", post(close_billing_year))
        .route("/billing/history/:utility/:meter/:year", get(history_record))
        .with_state(ControlState { dispatcher, store })
}

fn parse_utility(raw: &str) -> Result<UtilityType, ApiError> {
    raw.parse::<UtilityType>()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

fn status_for(err: &DispatchError) -> StatusCode {
    match err {
        DispatchError::NoLedger(_) | DispatchError::Ledger(LedgerError::UnknownMeter(_)) => StatusCode::NOT_FOUND,
        DispatchError::Ledger(LedgerError::Close(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn close_billing_year(
    State(state): State<ControlState>,
    Json(req): Json<CloseRequest>,
) -> Result<Json<HistoryRecord>, ApiError> {
    let utility = parse_utility(&req.utility)?;
    let meter = MeterKey::new(utility, req.meter.as_deref().unwrap_or(MAIN_METER));

    match state.dispatcher.close(&meter, req.end_reading).await {
        Ok(record) => Ok(Json(record)),
        Err(e) => {
            tracing::warn!(%meter, error = %e, "billing close request failed");
            Err((status_for(&e), e.to_string()))
        }
    }
}

async fn history_record(
    State(state): State<ControlState>,
    Path((utility, meter, year)): Path<(String, String, i32)>,
) -> Result<Json<HistoryRecord>, ApiError> {
    let key = MeterKey::new(parse_utility(&utility)?, meter);
    match persist::load_history(state.store.as_ref(), &key, year).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err((StatusCode::NOT_FOUND, format!("no archived year {year} for {key}"))),
        Err(e) => Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        clock::ManualClock,
        config::{EngineSettings, MeterConfig},
        engine::{worker::spawn_ledger, UtilityLedger},
        notify::LogNotifier,
        registry::SensorRegistry,
        tariff::TariffSettings,
        tracker::TrackerSettings,
    };
    use meter_client::db::MemoryStateStore;
    use time::macros::datetime;

    async fn water_service() -> (ControlState, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        let config = MeterConfig {
            key: MeterKey::main(UtilityType::Water),
            display_name: "Water".to_string(),
            sensor_id: "water.total".to_string(),
            tracker: TrackerSettings::default(),
            starting_reading: None,
            contract_start: None,
            tariff: TariffSettings {
                price: Some(2.0),
                ..TariffSettings::default()
            },
        };

        let mut dispatcher = Dispatcher::new(SensorRegistry::from_meters(std::slice::from_ref(&config)));
        let mut ledger = UtilityLedger::new(
            UtilityType::Water,
            EngineSettings::default(),
            store.clone(),
            Arc::new(ManualClock::new(datetime!(2024-07-01 10:00))),
            Arc::new(LogNotifier),
        );
        ledger.init(vec![config]).await.unwrap();
        let (handle, _join) = spawn_ledger(ledger, 8);
        dispatcher.register(handle);

        let state = ControlState {
            dispatcher,
            store: store.clone(),
        };
        (state, store)
    }

    fn close_request(utility: &str, meter: Option<&str>, end_reading: Option<f64>) -> Json<CloseRequest> {
        Json(CloseRequest {
            utility: utility.to_string(),
            meter: meter.map(str::to_string),
            end_reading,
        })
    }

    #[tokio::test]
    async fn close_archives_and_history_is_readable() {
        let (state, _store) = water_service().await;
        state.dispatcher.route_reading("water.total", 1000.0).await.unwrap();
        state.dispatcher.route_reading("water.total", 1007.0).await.unwrap();

        let Json(record) = close_billing_year(State(state.clone()), close_request("water", None, Some(1007.5)))
            .await
            .unwrap();
        assert_eq!(record.meter, MeterKey::main(UtilityType::Water));
        assert_eq!(record.consumption, 7.0);
        assert_eq!(record.end_reading, Some(1007.5));

        let Json(stored) = history_record(
            State(state.clone()),
            Path(("water".to_string(), MAIN_METER.to_string(), record.year)),
        )
        .await
        .unwrap();
        assert_eq!(stored.consumption, 7.0);
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let (state, store) = water_service().await;

        let err = close_billing_year(State(state.clone()), close_request("steam", None, Some(1.0)))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let err = close_billing_year(State(state.clone()), close_request("gas", None, Some(1.0)))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);

        let err = close_billing_year(State(state.clone()), close_request("water", Some("garden"), Some(1.0)))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
        assert!(!store.node_exists("water.garden").await.unwrap());

        // No reading yet, so there is no billing year to close.
        let err = close_billing_year(State(state.clone()), close_request("water", None, Some(1.0)))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::UNPROCESSABLE_ENTITY);

        let err = history_record(State(state), Path(("water".to_string(), MAIN_METER.to_string(), 2019)))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }
}
