//! Reshape one feed snapshot into the outage, postcode and link relations.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

use chrono::{DateTime, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use gridpulse_core::{
    category_id, Outage, OutagePostcodeLink, OutageStatus, PostcodeRow, TransformedSnapshot,
};
use gridpulse_feed::{ParseError, RawTable};
use thiserror::Error;
use tracing::{debug, warn};

/// Older exports label the id column "Outage ID".
pub const INCIDENT_ID_COLUMNS: [&str; 2] = ["Incident ID", "Outage ID"];
pub const START_TIME_COLUMN: &str = "Start Time";
pub const ETR_COLUMN: &str = "ETR";
pub const CATEGORY_COLUMN: &str = "Category";
pub const POSTCODES_COLUMN: &str = "Postcodes";

pub const BLANK_CATEGORY: &str = "<blank>";

const NAIVE_FORMATS: [&str; 6] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

/// Decides whether an outage is still ongoing from its ETR.
pub trait StatusPolicy: Send + Sync {
    fn classify(&self, etr: Option<DateTime<Utc>>, now: DateTime<Utc>) -> OutageStatus;
}

/// `current` only while a known ETR has not passed. A missing ETR counts as historical.
#[derive(Debug, Default, Clone, Copy)]
pub struct EtrDeadlinePolicy;

impl StatusPolicy for EtrDeadlinePolicy {
    fn classify(&self, etr: Option<DateTime<Utc>>, now: DateTime<Utc>) -> OutageStatus {
        match etr {
            Some(etr) if etr >= now => OutageStatus::Current,
            _ => OutageStatus::Historical,
        }
    }
}

/// Like [`EtrDeadlinePolicy`], but an outage without an ETR is treated as ongoing.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenEndedCurrentPolicy;

impl StatusPolicy for OpenEndedCurrentPolicy {
    fn classify(&self, etr: Option<DateTime<Utc>>, now: DateTime<Utc>) -> OutageStatus {
        match etr {
            None => OutageStatus::Current,
            Some(_) => EtrDeadlinePolicy.classify(etr, now),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusPolicyKind {
    #[default]
    EtrDeadline,
    OpenEndedCurrent,
}

#[derive(Debug, Error)]
#[error("unknown status policy {0:?} (expected etr-deadline or open-ended-current)")]
pub struct UnknownPolicy(pub String);

impl FromStr for StatusPolicyKind {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "etr-deadline" => Ok(Self::EtrDeadline),
            "open-ended-current" => Ok(Self::OpenEndedCurrent),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}

impl StatusPolicyKind {
    pub fn into_policy(self) -> Box<dyn StatusPolicy> {
        match self {
            Self::EtrDeadline => Box::new(EtrDeadlinePolicy),
            Self::OpenEndedCurrent => Box::new(OpenEndedCurrentPolicy),
        }
    }
}

/// Parse a feed timestamp. Naive values are read as wall-clock time in `tz`.
///
/// Blank or unrecognised text yields `None`, as does a local time that falls in
/// a DST gap. An ambiguous local time resolves to the earlier instant.
pub fn parse_local_timestamp(raw: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

/// Split a comma-separated postcode field into trimmed, non-empty fragments.
pub fn split_postcodes(field: &str) -> impl Iterator<Item = &str> {
    field.split(',').map(str::trim).filter(|p| !p.is_empty())
}

struct FeedColumns {
    incident_id: usize,
    start_time: usize,
    etr: usize,
    category: usize,
    postcodes: usize,
}

impl FeedColumns {
    fn locate(raw: &RawTable) -> Result<Self, ParseError> {
        let incident_id = INCIDENT_ID_COLUMNS
            .iter()
            .find_map(|name| raw.column_index(name))
            .ok_or_else(|| ParseError::MissingColumn {
                column: INCIDENT_ID_COLUMNS[0].to_string(),
            })?;
        Ok(Self {
            incident_id,
            start_time: raw.require_column(START_TIME_COLUMN)?,
            etr: raw.require_column(ETR_COLUMN)?,
            category: raw.require_column(CATEGORY_COLUMN)?,
            postcodes: raw.require_column(POSTCODES_COLUMN)?,
        })
    }
}

pub struct Transformer {
    timezone: Tz,
    policy: Box<dyn StatusPolicy>,
}

impl Default for Transformer {
    fn default() -> Self {
        Self::new(chrono_tz::Europe::London)
    }
}

impl Transformer {
    pub fn new(timezone: Tz) -> Self {
        Self {
            timezone,
            policy: Box::new(EtrDeadlinePolicy),
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn StatusPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn transform(&self, raw: &RawTable) -> Result<TransformedSnapshot, ParseError> {
        self.transform_at(raw, Utc::now())
    }

    /// Transform with an explicit "now" for status classification.
    pub fn transform_at(
        &self,
        raw: &RawTable,
        now: DateTime<Utc>,
    ) -> Result<TransformedSnapshot, ParseError> {
        let cols = FeedColumns::locate(raw)?;

        let mut outages: Vec<Outage> = Vec::with_capacity(raw.len());
        let mut postcodes_by_outage: Vec<Vec<String>> = Vec::with_capacity(raw.len());
        let mut position_by_id: HashMap<String, usize> = HashMap::new();
        let mut duplicate_ids: Vec<String> = Vec::new();
        let mut unknown_labels: BTreeMap<String, usize> = BTreeMap::new();
        let mut unparsed_start = 0usize;
        let mut unparsed_etr = 0usize;
        let mut lossy_fields = 0usize;

        for row in 0..raw.len() {
            let mut field = |col: usize| {
                let text = raw.field(row, col);
                if matches!(text, Cow::Owned(_)) {
                    lossy_fields += 1;
                }
                text
            };

            let id_text = field(cols.incident_id);
            let outage_id = id_text.trim();
            if outage_id.is_empty() {
                return Err(ParseError::BlankIncidentId {
                    line: raw.line_of(row),
                });
            }

            let start_text = field(cols.start_time);
            let start_time = parse_local_timestamp(&start_text, self.timezone);
            if start_time.is_none() && !start_text.trim().is_empty() {
                unparsed_start += 1;
            }
            let etr_text = field(cols.etr);
            let etr = parse_local_timestamp(&etr_text, self.timezone);
            if etr.is_none() && !etr_text.trim().is_empty() {
                unparsed_etr += 1;
            }

            let label_text = field(cols.category);
            let label = label_text.trim();
            let category_id = category_id(label);
            if category_id.is_none() {
                let key = if label.is_empty() { BLANK_CATEGORY } else { label };
                *unknown_labels.entry(key.to_string()).or_default() += 1;
            }

            let outage = Outage {
                outage_id: outage_id.to_string(),
                start_time,
                etr,
                category_id,
                status: self.policy.classify(etr, now),
            };
            let postcode_text = field(cols.postcodes);
            let fragments = split_postcodes(&postcode_text);

            match position_by_id.get(outage_id) {
                Some(&pos) => {
                    duplicate_ids.push(outage_id.to_string());
                    outages[pos] = outage;
                    let existing = &mut postcodes_by_outage[pos];
                    for fragment in fragments {
                        if !existing.iter().any(|p| p == fragment) {
                            existing.push(fragment.to_string());
                        }
                    }
                }
                None => {
                    position_by_id.insert(outage_id.to_string(), outages.len());
                    outages.push(outage);
                    let mut own: Vec<String> = Vec::new();
                    for fragment in fragments {
                        if !own.iter().any(|p| p == fragment) {
                            own.push(fragment.to_string());
                        }
                    }
                    postcodes_by_outage.push(own);
                }
            }
        }

        let (postcode, outage_postcode_link) =
            build_postcode_relations(&outages, &postcodes_by_outage);

        if lossy_fields > 0 {
            warn!(
                fields = lossy_fields,
                "invalid utf-8 in feed fields replaced with U+FFFD"
            );
        }
        for (label, rows) in &unknown_labels {
            warn!(label = %label, rows, "unknown outage category; category_id left null");
        }
        if !duplicate_ids.is_empty() {
            warn!(ids = ?duplicate_ids, "duplicate incident ids merged; last row wins");
        }
        if unparsed_start > 0 {
            warn!(
                column = START_TIME_COLUMN,
                rows = unparsed_start,
                "unparseable timestamps set to null"
            );
        }
        if unparsed_etr > 0 {
            warn!(
                column = ETR_COLUMN,
                rows = unparsed_etr,
                "unparseable timestamps set to null"
            );
        }
        debug!(
            outages = outages.len(),
            postcodes = postcode.len(),
            links = outage_postcode_link.len(),
            "transformed outage snapshot"
        );

        Ok(TransformedSnapshot {
            outage: outages,
            postcode,
            outage_postcode_link,
            unknown_categories: unknown_labels.into_keys().collect(),
        })
    }
}

/// Postcode dimension with snapshot-local ids (1-based, first-seen order) and the link rows.
fn build_postcode_relations(
    outages: &[Outage],
    postcodes_by_outage: &[Vec<String>],
) -> (Vec<PostcodeRow>, Vec<OutagePostcodeLink>) {
    let mut ids: HashMap<&str, i64> = HashMap::new();
    let mut dimension = Vec::new();
    let mut links = Vec::new();
    let mut seen_links: HashSet<(usize, i64)> = HashSet::new();

    for (pos, (outage, fragments)) in outages.iter().zip(postcodes_by_outage).enumerate() {
        for fragment in fragments {
            let postcode_id = *ids.entry(fragment.as_str()).or_insert_with(|| {
                let id = dimension.len() as i64 + 1;
                dimension.push(PostcodeRow {
                    postcode_id: id,
                    postcode: fragment.clone(),
                });
                id
            });
            if seen_links.insert((pos, postcode_id)) {
                links.push(OutagePostcodeLink {
                    outage_id: outage.outage_id.clone(),
                    postcode_id,
                });
            }
        }
    }

    (dimension, links)
}
