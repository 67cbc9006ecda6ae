use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Kind of metered utility.
///
/// The type decides the billing unit, whether readings go through the
/// volumetric-to-energy conversion, and the prefix used for its settings
/// and state paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UtilityType {
    Gas,
    Water,
    Electricity,
    Generation,
}

impl UtilityType {
    pub const ALL: [UtilityType; 4] = [
        UtilityType::Gas,
        UtilityType::Water,
        UtilityType::Electricity,
        UtilityType::Generation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gas => "gas",
            Self::Water => "water",
            Self::Electricity => "electricity",
            Self::Generation => "generation",
        }
    }

    /// Unit that consumption sums and prices are expressed in.
    pub fn billing_unit(self) -> &'static str {
        match self {
            Self::Water => "m³",
            Self::Gas | Self::Electricity | Self::Generation => "kWh",
        }
    }

    /// Unit the physical counter reports in.
    pub fn counter_unit(self) -> &'static str {
        match self {
            Self::Gas | Self::Water => "m³",
            Self::Electricity | Self::Generation => "kWh",
        }
    }

    /// Gas counters report volume; billing is done in energy.
    pub fn is_volumetric(self) -> bool {
        matches!(self, Self::Gas)
    }

    /// Split HT/NT tariffs only exist for grid electricity.
    pub fn supports_split_tariff(self) -> bool {
        matches!(self, Self::Electricity)
    }
}

impl fmt::Display for UtilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown utility type '{0}'")]
pub struct UnknownUtilityType(pub String);

impl FromStr for UtilityType {
    type Err = UnknownUtilityType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gas" => Ok(Self::Gas),
            "water" => Ok(Self::Water),
            "electricity" | "power" => Ok(Self::Electricity),
            "generation" | "pv" => Ok(Self::Generation),
            other => Err(UnknownUtilityType(other.to_string())),
        }
    }
}
