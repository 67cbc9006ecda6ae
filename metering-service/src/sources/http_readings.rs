use std::{net::SocketAddr, sync::Arc};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use futures::StreamExt;
use meter_client::domain::SensorReading;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    pipeline::{Envelope, EnvelopeStream, PipelineError, Source},
    units::parse_decimal,
};

#[derive(Clone)]
struct SharedSender {
    tx: mpsc::Sender<Envelope<SensorReading>>,
}

/// `POST /ingest/readings` with a JSON array of `{sensor_id, value}`.
///
/// Values may be JSON numbers or decimal strings with either separator.
#[derive(Clone)]
pub struct HttpReadingSource {
    receiver: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<Envelope<SensorReading>>>>>,
}

#[derive(serde::Deserialize)]
struct IncomingReading {
    sensor_id: String,
    value: serde_json::Value,
}

impl TryFrom<IncomingReading> for SensorReading {
    type Error = String;

    fn try_from(i: IncomingReading) -> Result<Self, Self::Error> {
        let value = match &i.value {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => parse_decimal(s),
            _ => None,
        }
        .ok_or_else(|| format!("{}: '{}' is not a number", i.sensor_id, i.value))?;

        Ok(SensorReading {
            sensor_id: i.sensor_id,
            value,
        })
    }
}

impl HttpReadingSource {
    /// Bind the ingest server. `extra` routes (operator endpoints) are
    /// served on the same listener.
    pub async fn new(bind_addr: &str, channel_capacity: usize, extra: Router) -> Result<Self, PipelineError> {
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let shared = SharedSender { tx };

        let app = Router::new()
            .route("/ingest/readings", post(ingest_readings))
            .with_state(shared)
            .merge(extra);

        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| PipelineError::Source(format!("invalid bind addr: {e}")))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| PipelineError::Source(format!("failed to bind {addr}: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                tracing::error!(error = %e, "HTTP reading source server error");
            }
        });
        tracing::info!(%addr, "accepting readings");

        Ok(Self {
            receiver: Arc::new(tokio::sync::Mutex::new(Some(rx))),
        })
    }
}

#[async_trait::async_trait]
impl Source<SensorReading> for HttpReadingSource {
    async fn stream(&self) -> EnvelopeStream<SensorReading> {
        let mut guard = self.receiver.lock().await;
        match guard.take() {
            Some(rx) => Box::pin(ReceiverStream::new(rx).map(Ok::<_, PipelineError>)),
            None => Box::pin(futures::stream::once(async {
                Err(PipelineError::Source(
                    "HttpReadingSource stream already taken; only one consumer supported".to_string(),
                ))
            })),
        }
    }
}

async fn ingest_readings(
    State(sender): State<SharedSender>,
    Json(payload): Json<Vec<IncomingReading>>,
) -> Result<StatusCode, (StatusCode, String)> {
    metrics::counter!("http_ingest_requests_total").increment(1);

    // Reject the whole batch before queueing any of it.
    let readings = payload
        .into_iter()
        .map(SensorReading::try_from)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e))?;

    for reading in readings {
        if sender.tx.send(Envelope::now(reading)).await.is_err() {
            metrics::counter!("http_ingest_failed_total").increment(1);
            return Err((StatusCode::SERVICE_UNAVAILABLE, "reading queue closed".to_string()));
        }
    }

    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incoming(value: serde_json::Value) -> IncomingReading {
        IncomingReading {
            sensor_id: "gas.total".to_string(),
            value,
        }
    }

    #[test]
    fn accepts_numbers_and_decimal_strings() {
        let r = SensorReading::try_from(incoming(serde_json::json!(1092.5))).unwrap();
        assert_eq!(r.value, 1092.5);
        let r = SensorReading::try_from(incoming(serde_json::json!("1092,5"))).unwrap();
        assert_eq!(r.value, 1092.5);
    }

    #[test]
    fn rejects_non_numeric_values() {
        assert!(SensorReading::try_from(incoming(serde_json::json!("n/a"))).is_err());
        assert!(SensorReading::try_from(incoming(serde_json::json!(null))).is_err());
    }

    #[tokio::test]
    async fn queued_readings_come_out_of_the_stream() {
        let (tx, rx) = mpsc::channel(4);
        let source = HttpReadingSource {
            receiver: Arc::new(tokio::sync::Mutex::new(Some(rx))),
        };
        let shared = SharedSender { tx };

        let status = ingest_readings(
            State(shared),
            Json(vec![incoming(serde_json::json!(1.5)), incoming(serde_json::json!("2,5"))]),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let mut stream = source.stream().await;
        assert_eq!(stream.next().await.unwrap().unwrap().payload.value, 1.5);
        assert_eq!(stream.next().await.unwrap().unwrap().payload.value, 2.5);

        let mut again = source.stream().await;
        assert!(matches!(again.next().await, Some(Err(PipelineError::Source(_)))));
    }
}
