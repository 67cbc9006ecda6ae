use anyhow::Result;
use meter_client::domain::UtilityType;
use metering_service::{
    clock::SystemClock,
    config::{resolve_settings, AppConfig},
    control::billing_router,
    engine::{
        worker::{spawn_ledger, Dispatcher},
        UtilityLedger,
    },
    metrics_server,
    notify::LogNotifier,
    observability,
    pipeline::Pipeline,
    registry::SensorRegistry,
    sinks::LedgerSink,
    sources::HttpReadingSource,
    transform::ReadingValidation,
};
use std::{sync::Arc, time::Duration};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let settings = resolve_settings(&cfg.settings);
    for diag in &settings.diagnostics {
        tracing::warn!(scope = %diag.scope, error = %diag.error, "setting ignored");
    }

    let store = cfg.store.connect().await?;
    let clock = Arc::new(SystemClock);
    let notifier = Arc::new(LogNotifier);

    // One ledger task per utility type; types without meters still get one
    // so their stale state is cleaned up.
    let registry = SensorRegistry::from_meters(&settings.meters);
    if registry.is_empty() {
        tracing::warn!("no meters configured; readings will be ignored");
    } else {
        tracing::info!(
            sensors = registry.len(),
            utilities = ?registry.utilities(),
            "sensor routes resolved"
        );
    }
    let mut dispatcher = Dispatcher::new(registry);
    for utility in UtilityType::ALL {
        let mut ledger = UtilityLedger::new(
            utility,
            settings.engine.clone(),
            store.clone(),
            clock.clone(),
            notifier.clone(),
        );
        ledger.init(settings.meters_of(utility).cloned().collect()).await?;
        tracing::info!(%utility, meters = ledger.meter_names().count(), "ledger ready");

        let (handle, _join) = spawn_ledger(ledger, cfg.service.channel_capacity);
        dispatcher.register(handle);
    }

    let sweeper = {
        let dispatcher = dispatcher.clone();
        let period = Duration::from_secs(cfg.service.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = dispatcher.sweep_all().await {
                    tracing::error!(error = %e, "sweep not scheduled, stopping sweeper");
                    break;
                }
            }
        })
    };

    let source = HttpReadingSource::new(
        &cfg.service.http_bind_addr,
        cfg.service.channel_capacity,
        billing_router(dispatcher.clone(), store.clone()),
    )
    .await?;
    let pipeline = Pipeline::new(source, LedgerSink::new(dispatcher)).with_transform(ReadingValidation);

    tokio::select! {
        res = pipeline.run() => res?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown requested"),
    }

    sweeper.abort();
    Ok(())
}
