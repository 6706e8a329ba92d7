//! Merge a transformed snapshot into persistent storage.
//!
//! A merge is one atomic unit: upsert outages, flip outages that vanished from a
//! non-empty snapshot to historical, insert unseen postcodes, then add missing
//! outage/postcode links resolved against the persistent postcode ids.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use gridpulse_core::{normalize_postcode, Outage, OutageStatus, TransformedSnapshot};
use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Serializes overlapping runs against the same database.
const RECONCILE_LOCK_KEY: i64 = 0x4752_4944_5055_4C53; // "GRIDPULS"

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("database error during reconcile: {0}")]
    Database(#[from] sqlx::Error),
    #[error("integrity violation: {0}")]
    Integrity(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileCounts {
    /// Rows attempted per relation.
    pub outage: usize,
    pub postcode: usize,
    pub outage_postcode_link: usize,
    pub marked_historical: u64,
    pub new_postcodes: u64,
    pub new_links: u64,
}

/// Rows ready to merge, with postcode text normalized and pairs deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub staged_ids: Vec<String>,
    pub outages: Vec<Outage>,
    pub postcodes: Vec<String>,
    /// `(outage_id, normalized postcode)` pairs.
    pub pairs: Vec<(String, String)>,
}

impl ReconcilePlan {
    pub fn prepare(snapshot: &TransformedSnapshot) -> Result<Self, ReconcileError> {
        // one row per id, last occurrence wins, first-seen order kept
        let mut position: HashMap<&str, usize> = HashMap::new();
        let mut outages: Vec<Outage> = Vec::with_capacity(snapshot.outage.len());
        for outage in &snapshot.outage {
            match position.get(outage.outage_id.as_str()) {
                Some(&pos) => outages[pos] = outage.clone(),
                None => {
                    position.insert(outage.outage_id.as_str(), outages.len());
                    outages.push(outage.clone());
                }
            }
        }
        let staged_ids = outages.iter().map(|o| o.outage_id.clone()).collect();

        let mut seen_postcodes = HashSet::new();
        let mut postcodes = Vec::new();
        for row in &snapshot.postcode {
            let text = normalize_postcode(&row.postcode);
            if !text.is_empty() && seen_postcodes.insert(text.clone()) {
                postcodes.push(text);
            }
        }

        let mut seen_pairs = HashSet::new();
        let mut pairs = Vec::new();
        for link in &snapshot.outage_postcode_link {
            let raw = snapshot.postcode_text(link.postcode_id).ok_or_else(|| {
                ReconcileError::Integrity(format!(
                    "link {} -> postcode_id {} has no postcode row in the snapshot",
                    link.outage_id, link.postcode_id
                ))
            })?;
            let text = normalize_postcode(raw);
            if text.is_empty() {
                continue;
            }
            let pair = (link.outage_id.clone(), text);
            if seen_pairs.insert(pair.clone()) {
                pairs.push(pair);
            }
        }

        Ok(Self {
            staged_ids,
            outages,
            postcodes,
            pairs,
        })
    }

    pub fn attempted(&self) -> ReconcileCounts {
        ReconcileCounts {
            outage: self.outages.len(),
            postcode: self.postcodes.len(),
            outage_postcode_link: self.pairs.len(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait OutageStore: Send + Sync {
    /// Apply the whole plan or nothing.
    async fn apply(&self, plan: &ReconcilePlan) -> Result<ReconcileCounts, ReconcileError>;
}

/// Merge `snapshot` into `store`, returning attempted and effective row counts.
pub async fn reconcile<S>(
    store: &S,
    snapshot: &TransformedSnapshot,
) -> Result<ReconcileCounts, ReconcileError>
where
    S: OutageStore + ?Sized,
{
    let plan = ReconcilePlan::prepare(snapshot)?;
    if plan.staged_ids.is_empty() {
        warn!("snapshot has no incident ids; feed may be degraded, skipping flip to historical");
    }
    let counts = store.apply(&plan).await?;
    info!(
        outage = counts.outage,
        postcode = counts.postcode,
        outage_postcode_link = counts.outage_postcode_link,
        marked_historical = counts.marked_historical,
        new_postcodes = counts.new_postcodes,
        new_links = counts.new_links,
        "reconciled outage snapshot"
    );
    Ok(counts)
}

#[derive(Debug, Clone)]
pub struct PgOutageStore {
    pool: PgPool,
    statement_timeout: Duration,
}

impl PgOutageStore {
    pub fn new(pool: PgPool, statement_timeout: Duration) -> Self {
        Self {
            pool,
            statement_timeout,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl OutageStore for PgOutageStore {
    async fn apply(&self, plan: &ReconcilePlan) -> Result<ReconcileCounts, ReconcileError> {
        let mut counts = plan.attempted();
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT set_config('statement_timeout', $1, true)")
            .bind(format!("{}ms", self.statement_timeout.as_millis()))
            .execute(&mut *tx)
            .await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(RECONCILE_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        if !plan.outages.is_empty() {
            let mut ids = Vec::with_capacity(plan.outages.len());
            let mut starts = Vec::with_capacity(plan.outages.len());
            let mut etrs = Vec::with_capacity(plan.outages.len());
            let mut categories = Vec::with_capacity(plan.outages.len());
            let mut statuses = Vec::with_capacity(plan.outages.len());
            for outage in &plan.outages {
                ids.push(outage.outage_id.clone());
                starts.push(outage.start_time);
                etrs.push(outage.etr);
                categories.push(outage.category_id);
                statuses.push(outage.status.as_str().to_string());
            }
            sqlx::query(
                r#"
                INSERT INTO outage (outage_id, start_time, etr, category_id, status)
                SELECT * FROM UNNEST($1::text[], $2::timestamptz[], $3::timestamptz[],
                                     $4::int4[], $5::text[])
                ON CONFLICT (outage_id) DO UPDATE
                   SET start_time = EXCLUDED.start_time,
                       etr = EXCLUDED.etr,
                       category_id = EXCLUDED.category_id,
                       status = EXCLUDED.status
                "#,
            )
            .bind(ids)
            .bind(starts)
            .bind(etrs)
            .bind(categories)
            .bind(statuses)
            .execute(&mut *tx)
            .await?;
        }

        if !plan.staged_ids.is_empty() {
            sqlx::query(
                "CREATE TEMP TABLE staged_outage_ids (outage_id text PRIMARY KEY) ON COMMIT DROP",
            )
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO staged_outage_ids (outage_id) SELECT DISTINCT UNNEST($1::text[])",
            )
            .bind(plan.staged_ids.as_slice())
            .execute(&mut *tx)
            .await?;
            counts.marked_historical = sqlx::query(
                r#"
                UPDATE outage o
                   SET status = $1
                 WHERE o.status = $2
                   AND NOT EXISTS (
                       SELECT 1 FROM staged_outage_ids s WHERE s.outage_id = o.outage_id
                   )
                "#,
            )
            .bind(OutageStatus::Historical.as_str())
            .bind(OutageStatus::Current.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        if !plan.postcodes.is_empty() {
            counts.new_postcodes = sqlx::query(
                r#"
                INSERT INTO postcode (postcode)
                SELECT UNNEST($1::text[])
                ON CONFLICT (postcode) DO NOTHING
                "#,
            )
            .bind(plan.postcodes.as_slice())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        if !plan.pairs.is_empty() {
            let (outage_ids, postcodes): (Vec<String>, Vec<String>) =
                plan.pairs.iter().cloned().unzip();
            sqlx::query(
                r#"
                CREATE TEMP TABLE staged_outage_postcodes (outage_id text, postcode text)
                ON COMMIT DROP
                "#,
            )
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                r#"
                INSERT INTO staged_outage_postcodes (outage_id, postcode)
                SELECT * FROM UNNEST($1::text[], $2::text[])
                "#,
            )
            .bind(outage_ids)
            .bind(postcodes)
            .execute(&mut *tx)
            .await?;
            counts.new_links = sqlx::query(
                r#"
                INSERT INTO outage_postcode_link (outage_id, postcode_id)
                SELECT DISTINCT s.outage_id, p.postcode_id
                  FROM staged_outage_postcodes s
                  JOIN postcode p ON p.postcode = s.postcode
                 WHERE NOT EXISTS (
                       SELECT 1 FROM outage_postcode_link l
                        WHERE l.outage_id = s.outage_id
                          AND l.postcode_id = p.postcode_id
                 )
                ON CONFLICT DO NOTHING
                "#,
            )
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        Ok(counts)
    }
}

/// Persisted relations as held by [`MemoryOutageStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryState {
    pub outages: BTreeMap<String, Outage>,
    /// Normalized postcode text -> persistent id.
    pub postcodes: BTreeMap<String, i64>,
    pub links: BTreeSet<(String, i64)>,
    next_postcode_id: i64,
}

impl MemoryState {
    pub fn status_of(&self, outage_id: &str) -> Option<OutageStatus> {
        self.outages.get(outage_id).map(|o| o.status)
    }

    fn apply(&mut self, plan: &ReconcilePlan) -> Result<ReconcileCounts, ReconcileError> {
        let mut counts = plan.attempted();

        for outage in &plan.outages {
            self.outages.insert(outage.outage_id.clone(), outage.clone());
        }

        if !plan.staged_ids.is_empty() {
            let staged: HashSet<&str> = plan.staged_ids.iter().map(String::as_str).collect();
            for outage in self.outages.values_mut() {
                if outage.status == OutageStatus::Current
                    && !staged.contains(outage.outage_id.as_str())
                {
                    outage.status = OutageStatus::Historical;
                    counts.marked_historical += 1;
                }
            }
        }

        for postcode in &plan.postcodes {
            if !self.postcodes.contains_key(postcode) {
                self.next_postcode_id += 1;
                self.postcodes.insert(postcode.clone(), self.next_postcode_id);
                counts.new_postcodes += 1;
            }
        }

        for (outage_id, postcode) in &plan.pairs {
            let Some(&postcode_id) = self.postcodes.get(postcode) else {
                continue;
            };
            if !self.outages.contains_key(outage_id) {
                return Err(ReconcileError::Integrity(format!(
                    "link references unknown outage {outage_id}"
                )));
            }
            if self.links.insert((outage_id.clone(), postcode_id)) {
                counts.new_links += 1;
            }
        }

        Ok(counts)
    }
}

/// In-process store with the same merge semantics as [`PgOutageStore`].
///
/// The plan is applied to a copy of the state, which replaces the original only
/// when every step succeeds.
#[derive(Debug, Default)]
pub struct MemoryOutageStore {
    state: Mutex<MemoryState>,
}

impl MemoryOutageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn state(&self) -> MemoryState {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl OutageStore for MemoryOutageStore {
    async fn apply(&self, plan: &ReconcilePlan) -> Result<ReconcileCounts, ReconcileError> {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        let counts = next.apply(plan)?;
        *guard = next;
        Ok(counts)
    }
}
