pub mod aggregate;
pub mod clock;
pub mod closer;
pub mod config;
pub mod control;
pub mod engine;
pub mod metrics_server;
pub mod notify;
pub mod observability;
pub mod periods;
pub mod pipeline;
pub mod registry;
pub mod sinks;
pub mod sources;
pub mod tariff;
pub mod tracker;
pub mod transform;
pub mod units;

#[cfg(test)]
pub(crate) mod test_store;

pub use pipeline::{Envelope, Pipeline};
