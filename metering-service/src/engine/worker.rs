//! One task per utility type, fed through a bounded channel.
//!
//! Readings, sweeps and close requests for the same type are applied in
//! arrival order by the task that owns the [`UtilityLedger`].

use std::collections::BTreeMap;

use meter_client::domain::{HistoryRecord, MeterKey, UtilityType};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use super::{LedgerError, UtilityLedger};
use crate::registry::SensorRegistry;

pub enum LedgerCommand {
    Reading {
        meter: String,
        value: f64,
    },
    Sweep,
    Close {
        meter: String,
        end_reading: Option<f64>,
        reply: oneshot::Sender<Result<HistoryRecord, LedgerError>>,
    },
    RemoveMeter {
        meter: String,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("no ledger running for {0}")]
    NoLedger(UtilityType),
    #[error("ledger for {0} stopped")]
    Stopped(UtilityType),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Clone)]
pub struct LedgerHandle {
    utility: UtilityType,
    tx: mpsc::Sender<LedgerCommand>,
}

impl LedgerHandle {
    pub async fn send(&self, command: LedgerCommand) -> Result<(), DispatchError> {
        self.tx.send(command).await.map_err(|_| DispatchError::Stopped(self.utility))
    }
}

/// Move `ledger` onto its own task.
pub fn spawn_ledger(ledger: UtilityLedger, capacity: usize) -> (LedgerHandle, JoinHandle<()>) {
    let utility = ledger.utility();
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let join = tokio::spawn(run_ledger(ledger, rx));
    (LedgerHandle { utility, tx }, join)
}

async fn run_ledger(mut ledger: UtilityLedger, mut rx: mpsc::Receiver<LedgerCommand>) {
    let utility = ledger.utility();
    while let Some(command) = rx.recv().await {
        match command {
            LedgerCommand::Reading { meter, value } => {
                if let Err(e) = ledger.handle_reading(&meter, value).await {
                    tracing::warn!(%utility, meter = %meter, value, error = %e, "reading not applied");
                }
            }
            LedgerCommand::Sweep => {
                if let Err(e) = ledger.sweep().await {
                    tracing::error!(%utility, error = %e, "sweep failed");
                }
            }
            LedgerCommand::Close {
                meter,
                end_reading,
                reply,
            } => {
                let result = ledger.request_close(&meter, end_reading).await;
                let _ = reply.send(result);
            }
            LedgerCommand::RemoveMeter { meter } => {
                if let Err(e) = ledger.remove_meter(&meter).await {
                    tracing::warn!(%utility, meter = %meter, error = %e, "meter removal failed");
                }
            }
        }
    }
    tracing::info!(%utility, "ledger stopped");
}

/// Routes sensor readings and operator requests to the per-type ledgers.
#[derive(Clone)]
pub struct Dispatcher {
    ledgers: BTreeMap<UtilityType, LedgerHandle>,
    registry: SensorRegistry,
}

impl Dispatcher {
    pub fn new(registry: SensorRegistry) -> Self {
        Self {
            ledgers: BTreeMap::new(),
            registry,
        }
    }

    pub fn register(&mut self, handle: LedgerHandle) {
        self.ledgers.insert(handle.utility, handle);
    }

    fn ledger(&self, utility: UtilityType) -> Result<&LedgerHandle, DispatchError> {
        self.ledgers.get(&utility).ok_or(DispatchError::NoLedger(utility))
    }

    /// Queue a reading for every meter fed by `sensor_id`. Returns the
    /// number of meters it was routed to.
    pub async fn route_reading(&self, sensor_id: &str, value: f64) -> Result<usize, DispatchError> {
        let routes = self.registry.routes(sensor_id);
        if routes.is_empty() {
            tracing::debug!(sensor_id, "reading for unknown sensor ignored");
        }
        for key in routes {
            self.ledger(key.utility)?
                .send(LedgerCommand::Reading {
                    meter: key.name.clone(),
                    value,
                })
                .await?;
        }
        Ok(routes.len())
    }

    pub async fn sweep_all(&self) -> Result<(), DispatchError> {
        for handle in self.ledgers.values() {
            handle.send(LedgerCommand::Sweep).await?;
        }
        Ok(())
    }

    pub async fn close(&self, meter: &MeterKey, end_reading: Option<f64>) -> Result<HistoryRecord, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.ledger(meter.utility)?
            .send(LedgerCommand::Close {
                meter: meter.name.clone(),
                end_reading,
                reply,
            })
            .await?;
        let record = rx.await.map_err(|_| DispatchError::Stopped(meter.utility))??;
        Ok(record)
    }

    pub async fn remove_meter(&self, meter: &MeterKey) -> Result<(), DispatchError> {
        self.ledger(meter.utility)?
            .send(LedgerCommand::RemoveMeter {
                meter: meter.name.clone(),
            })
            .await
    }
}
