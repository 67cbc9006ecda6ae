use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the rolling windows kept per meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl PeriodKind {
    pub const ALL: [PeriodKind; 4] = [
        PeriodKind::Daily,
        PeriodKind::Weekly,
        PeriodKind::Monthly,
        PeriodKind::Yearly,
    ];

    /// Key used in state paths, e.g. `consumption.weekly`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }

    /// Key of the "last period" statistic, e.g. `lastWeek`.
    pub fn last_period_key(self) -> &'static str {
        match self {
            Self::Daily => "lastDay",
            Self::Weekly => "lastWeek",
            Self::Monthly => "lastMonth",
            Self::Yearly => "lastYear",
        }
    }
}

impl fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
