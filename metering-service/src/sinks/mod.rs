pub mod history;
pub mod ledger;

pub use history::{HistorySink, ImportSummary};
pub use ledger::LedgerSink;
