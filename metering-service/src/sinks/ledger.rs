use std::time::SystemTime;

use futures::StreamExt;
use meter_client::domain::SensorReading;

use crate::{
    engine::worker::{DispatchError, Dispatcher},
    pipeline::{Envelope, PipelineError, Sink},
};

/// Hands validated readings to the per-type ledgers.
pub struct LedgerSink {
    dispatcher: Dispatcher,
}

impl LedgerSink {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

#[async_trait::async_trait]
impl Sink<SensorReading> for LedgerSink {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<SensorReading>, PipelineError>> + Send + Unpin + 'static,
    {
        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::warn!(error = %e, "reading dropped before reaching a ledger");
                    continue;
                }
            };

            let reading = &env.payload;
            match self.dispatcher.route_reading(&reading.sensor_id, reading.value).await {
                Ok(0) => {
                    metrics::counter!("meter_readings_rejected_total", "reason" => "unknown_sensor").increment(1);
                }
                Ok(_) => {
                    if let Ok(dur) = SystemTime::now().duration_since(env.received_at) {
                        metrics::histogram!("reading_queue_latency_seconds").record(dur.as_secs_f64());
                    }
                }
                Err(e @ DispatchError::Stopped(_)) => {
                    tracing::error!(error = %e, "ledger queue closed, stopping reading pipeline");
                    return Err(PipelineError::Sink(e.to_string()));
                }
                Err(e) => {
                    tracing::error!(sensor_id = %reading.sensor_id, error = %e, "reading not routed");
                }
            }
        }

        Ok(())
    }
}
