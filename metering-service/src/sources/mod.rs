pub mod history_csv_file;
pub mod http_readings;

pub use history_csv_file::HistoryCsvFileSource;
pub use http_readings::HttpReadingSource;
