use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

use super::UtilityType;

/// Slug of the meter configured through the top-level settings of a type.
pub const MAIN_METER: &str = "main";

/// Node holding the per-type sums across all meters.
pub const TOTALS_NODE: &str = "totals";

/// Node listing the meter slugs of a utility type.
pub const METER_LIST_NODE: &str = "meters";

/// Identity of a meter: utility type plus a slug unique within that type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MeterKey {
    pub utility: UtilityType,
    pub name: String,
}

impl MeterKey {
    pub fn new(utility: UtilityType, name: impl Into<String>) -> Self {
        Self {
            utility,
            name: name.into(),
        }
    }

    pub fn main(utility: UtilityType) -> Self {
        Self::new(utility, MAIN_METER)
    }

    pub fn is_main(&self) -> bool {
        self.name == MAIN_METER
    }

    /// Root path of every state node derived for this meter.
    pub fn state_path(&self) -> String {
        format!("{}.{}", self.utility, self.name)
    }

    /// Path of a node below the meter root, e.g. `consumption.daily`.
    pub fn path(&self, suffix: &str) -> String {
        format!("{}.{}.{}", self.utility, self.name, suffix)
    }
}

impl fmt::Display for MeterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.utility, self.name)
    }
}

/// Path of a node below the totals root of a utility type.
pub fn totals_path(utility: UtilityType, suffix: &str) -> String {
    format!("{utility}.{TOTALS_NODE}.{suffix}")
}

/// Normalize a human meter name into a state-path safe slug.
///
/// Lowercases, maps German umlauts, replaces every other non-alphanumeric
/// run with a single `_` and trims underscores. Empty results become
/// `meter`.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;

    for ch in name.trim().chars().flat_map(char::to_lowercase) {
        let mapped: &str = match ch {
            'ä' => "ae",
            'ö' => "oe",
            'ü' => "ue",
            'ß' => "ss",
            _ => "",
        };

        if !mapped.is_empty() || ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            if mapped.is_empty() {
                out.push(ch);
            } else {
                out.push_str(mapped);
            }
        } else {
            pending_sep = true;
        }
    }

    if out.is_empty() {
        "meter".to_string()
    } else {
        out
    }
}

/// Hands out collision-free slugs within one utility type.
///
/// `main`, `totals` and `meters` are reserved; clashes get a numeric suffix starting
/// at `_2`.
#[derive(Debug, Default)]
pub struct SlugAllocator {
    taken: BTreeSet<String>,
}

impl SlugAllocator {
    pub fn new() -> Self {
        let mut taken = BTreeSet::new();
        taken.insert(MAIN_METER.to_string());
        taken.insert(TOTALS_NODE.to_string());
        taken.insert(METER_LIST_NODE.to_string());
        Self { taken }
    }

    pub fn allocate(&mut self, name: &str) -> String {
        let base = slugify(name);
        if self.taken.insert(base.clone()) {
            return base;
        }

        let mut n = 2u32;
        loop {
            let candidate = format!("{base}_{n}");
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}
