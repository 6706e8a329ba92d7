use std::env;
use std::time::Duration;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use gridpulse_core::{Outage, OutagePostcodeLink, OutageStatus, PostcodeRow, TransformedSnapshot};
use gridpulse_sync::{reconcile, OutageStore, PgOutageStore, ReconcileError, ReconcilePlan};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

const SCHEMA: &str = include_str!("fixtures/schema.sql");

fn snapshot(rows: &[(&str, OutageStatus, &[&str])]) -> TransformedSnapshot {
    let mut snap = TransformedSnapshot::default();
    for (id, status, postcodes) in rows {
        snap.outage.push(Outage {
            outage_id: id.to_string(),
            start_time: Utc.with_ymd_and_hms(2025, 10, 1, 7, 0, 0).single(),
            etr: Utc.with_ymd_and_hms(2025, 10, 1, 15, 30, 0).single(),
            category_id: Some(2),
            status: *status,
        });
        for text in postcodes.iter() {
            let postcode_id = match snap.postcode.iter().find(|p| p.postcode == *text) {
                Some(row) => row.postcode_id,
                None => {
                    let next = snap.postcode.len() as i64 + 1;
                    snap.postcode.push(PostcodeRow {
                        postcode_id: next,
                        postcode: text.to_string(),
                    });
                    next
                }
            };
            snap.outage_postcode_link.push(OutagePostcodeLink {
                outage_id: id.to_string(),
                postcode_id,
            });
        }
    }
    snap
}

async fn status_of(pool: &PgPool, outage_id: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT status FROM outage WHERE outage_id = $1")
        .bind(outage_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(status,)| status))
}

async fn count(pool: &PgPool, table: &str) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await?;
    Ok(n)
}

#[tokio::test]
async fn postgres_reconcile_matches_memory_semantics() -> Result<()> {
    let database_url = match env::var("GRIDPULSE_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!(
                "Skipping postgres_reconcile_matches_memory_semantics because GRIDPULSE_TEST_DATABASE_URL is not set"
            );
            return Ok(());
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await?;
    sqlx::raw_sql(SCHEMA).execute(&pool).await?;
    let store = PgOutageStore::new(pool.clone(), Duration::from_secs(30));

    // first load, then an identical reload
    let first = snapshot(&[
        ("X", OutageStatus::Current, &["ab1 2cd", "AB1 2EF"]),
        ("Y", OutageStatus::Current, &["AB1 2CD"]),
    ]);
    let counts = reconcile(&store, &first).await?;
    assert_eq!(counts.new_postcodes, 2);
    assert_eq!(counts.new_links, 3);
    let again = reconcile(&store, &first).await?;
    assert_eq!(again.new_postcodes, 0);
    assert_eq!(again.new_links, 0);
    assert_eq!(again.marked_historical, 0);
    assert_eq!(count(&pool, "postcode").await?, 2);
    assert_eq!(count(&pool, "outage_postcode_link").await?, 3);

    // X vanishes from the feed
    let counts = reconcile(
        &store,
        &snapshot(&[("Y", OutageStatus::Current, &["AB1   2CD"])]),
    )
    .await?;
    assert_eq!(counts.marked_historical, 1);
    assert_eq!(status_of(&pool, "X").await?.as_deref(), Some("historical"));
    assert_eq!(status_of(&pool, "Y").await?.as_deref(), Some("current"));
    assert_eq!(count(&pool, "outage").await?, 2);
    assert_eq!(count(&pool, "postcode").await?, 2);

    // empty snapshot flips nothing
    let counts = reconcile(&store, &TransformedSnapshot::default()).await?;
    assert_eq!(counts.marked_historical, 0);
    assert_eq!(status_of(&pool, "Y").await?.as_deref(), Some("current"));

    // a failing link insert rolls back the upsert that preceded it
    let plan = ReconcilePlan {
        staged_ids: vec!["Z".into()],
        outages: snapshot(&[("Z", OutageStatus::Current, &[])]).outage,
        postcodes: vec!["ZZ1 1ZZ".into()],
        pairs: vec![("GHOST".into(), "ZZ1 1ZZ".into())],
    };
    let err = store.apply(&plan).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Database(_)));
    assert_eq!(status_of(&pool, "Z").await?, None);
    assert_eq!(status_of(&pool, "Y").await?.as_deref(), Some("current"));
    assert_eq!(count(&pool, "postcode").await?, 2);

    // overlapping runs with disjoint snapshots: the later commit flips the earlier one
    for round in 0..5 {
        let left = format!("LEFT-{round}");
        let right = format!("RIGHT-{round}");
        let left_snap = snapshot(&[(left.as_str(), OutageStatus::Current, &["LL1 1LL"])]);
        let right_snap = snapshot(&[(right.as_str(), OutageStatus::Current, &["RR1 1RR"])]);

        let (a, b) = tokio::join!(
            reconcile(&store, &left_snap),
            reconcile(&store, &right_snap)
        );
        a?;
        b?;

        let current = [
            status_of(&pool, &left).await?,
            status_of(&pool, &right).await?,
        ]
        .iter()
        .filter(|s| s.as_deref() == Some("current"))
        .count();
        assert_eq!(current, 1, "round {round}: exactly one survivor expected");
    }
    let (current,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM outage WHERE status = 'current'")
            .fetch_one(&pool)
            .await?;
    assert_eq!(current, 1);
    assert_eq!(count(&pool, "postcode").await?, 4);

    Ok(())
}
