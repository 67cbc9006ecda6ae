pub mod history;
pub mod meter;
pub mod period;
pub mod reading;
pub mod utility;

pub use history::{history_path, HistoryRecord};
pub use meter::{slugify, totals_path, MeterKey, SlugAllocator, MAIN_METER, METER_LIST_NODE, TOTALS_NODE};
pub use period::PeriodKind;
pub use reading::SensorReading;
pub use utility::{UnknownUtilityType, UtilityType};
