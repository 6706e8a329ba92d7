//! Core domain model for the Grid Pulse outage pipeline.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Seeded `category` reference rows. Ids are stable across runs and read-only here.
pub const CATEGORIES: [(&str, i32); 12] = [
    ("HV ISOLATION", 1),
    ("LV GENERIC", 2),
    ("LV OVERHEAD", 3),
    ("LV UNDERGROUND", 4),
    ("HV OVERHEAD", 5),
    ("LV ISOLATION", 6),
    ("LV FUSE", 7),
    ("HV GENERIC", 8),
    ("HV DAMAGE", 9),
    ("LV DAMAGE", 10),
    ("HV FUSE", 11),
    ("HV UNDERGROUND", 12),
];

/// Map a free-text category label to its seeded id.
///
/// Labels are compared after trimming and uppercasing, so `" lv generic"`
/// resolves the same as `"LV GENERIC"`. Unknown labels return `None`.
pub fn category_id(label: &str) -> Option<i32> {
    let wanted = label.trim().to_ascii_uppercase();
    CATEGORIES
        .iter()
        .find(|(name, _)| *name == wanted)
        .map(|(_, id)| *id)
}

/// Uppercase a postcode and collapse internal whitespace to single spaces.
pub fn normalize_postcode(input: &str) -> String {
    input
        .split_whitespace()
        .map(str::to_uppercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutageStatus {
    Current,
    Historical,
}

impl OutageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Historical => "historical",
        }
    }
}

impl fmt::Display for OutageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the `outage` relation. Timestamps are genuine UTC instants or absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outage {
    pub outage_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub etr: Option<DateTime<Utc>>,
    pub category_id: Option<i32>,
    pub status: OutageStatus,
}

/// Postcode dimension row. `postcode_id` is snapshot-local when produced by the transformer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostcodeRow {
    pub postcode_id: i64,
    pub postcode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutagePostcodeLink {
    pub outage_id: String,
    pub postcode_id: i64,
}

/// Normalized handoff contract from the transformer into the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformedSnapshot {
    pub outage: Vec<Outage>,
    pub postcode: Vec<PostcodeRow>,
    pub outage_postcode_link: Vec<OutagePostcodeLink>,
    /// Distinct category labels that had no seeded id.
    pub unknown_categories: BTreeSet<String>,
}

impl TransformedSnapshot {
    pub fn is_empty(&self) -> bool {
        self.outage.is_empty()
    }

    pub fn postcode_text(&self, postcode_id: i64) -> Option<&str> {
        self.postcode
            .iter()
            .find(|row| row.postcode_id == postcode_id)
            .map(|row| row.postcode.as_str())
    }
}
