use anyhow::{bail, Result};
use meter_client::domain::HistoryRecord;
use metering_service::{
    config::AppConfig, observability, pipeline::Pipeline, sinks::HistorySink, sources::HistoryCsvFileSource,
};
use std::{env, time::Duration};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: import_history <csv_file_path> [delimiter]");
    }
    let file_path = &args[1];

    let mut source = HistoryCsvFileSource::new(file_path);
    if let Some(delimiter) = args.get(2) {
        match delimiter.as_bytes() {
            [b] => source = source.with_delimiter(*b),
            _ => bail!("delimiter must be a single character, got '{delimiter}'"),
        }
    }

    // Same config file as the service (METERING_CONFIG), for the store section.
    let cfg = AppConfig::load()?;
    let store = cfg.store.connect().await?;

    let sink = HistorySink::new(store, 3, Duration::from_millis(200));
    let pipeline: Pipeline<_, HistoryRecord, _> = Pipeline::new(source, sink);

    pipeline.run().await?;

    Ok(())
}
