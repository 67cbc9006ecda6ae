use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use meter_client::{
    db::{StateStore, StoreError},
    domain::HistoryRecord,
};

use crate::{
    engine::persist,
    pipeline::{Envelope, PipelineError, Sink},
};

/// Writes imported history records through the same path the period closer
/// uses. Existing records are left alone.
pub struct HistorySink {
    store: Arc<dyn StateStore>,
    max_retries: u32,
    retry_backoff: Duration,
}

/// Outcome counts of one import run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl HistorySink {
    pub fn new(store: Arc<dyn StateStore>, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            store,
            max_retries,
            retry_backoff,
        }
    }

    async fn write_record(&self, record: &HistoryRecord) -> Result<bool, StoreError> {
        let mut attempt: u32 = 0;
        loop {
            match persist::write_history(self.store.as_ref(), record).await {
                Ok(written) => return Ok(written),
                Err(e) if !e.is_severe() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(error = %e, attempt, meter = %record.meter, year = record.year, "history write failed, retrying");
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Like [`Sink::run`], returning what happened to each record.
    pub async fn import<S>(&self, mut input: S) -> Result<ImportSummary, PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<HistoryRecord>, PipelineError>> + Send + Unpin + 'static,
    {
        let mut summary = ImportSummary::default();

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(error = %e, "history row rejected");
                    summary.failed += 1;
                    continue;
                }
            };
            let record = &env.payload;

            match self.write_record(record).await {
                Ok(true) => {
                    summary.written += 1;
                    metrics::counter!("history_records_imported_total").increment(1);
                    tracing::info!(meter = %record.meter, year = record.year, "history record imported");
                }
                Ok(false) => {
                    summary.skipped += 1;
                    tracing::info!(meter = %record.meter, year = record.year, "history record exists, left unchanged");
                }
                Err(e) if e.is_severe() => {
                    tracing::error!(error = %e, "state store unavailable, aborting import");
                    return Err(PipelineError::Sink(e.to_string()));
                }
                Err(e) => {
                    summary.failed += 1;
                    metrics::counter!("state_store_write_errors_total").increment(1);
                    tracing::error!(error = %e, meter = %record.meter, year = record.year, "history record not written");
                }
            }
        }

        Ok(summary)
    }
}

#[async_trait::async_trait]
impl Sink<HistoryRecord> for HistorySink {
    async fn run<S>(&self, input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<HistoryRecord>, PipelineError>> + Send + Unpin + 'static,
    {
        let summary = self.import(input).await?;
        tracing::info!(
            written = summary.written,
            skipped = summary.skipped,
            failed = summary.failed,
            "history import finished"
        );
        Ok(())
    }
}
