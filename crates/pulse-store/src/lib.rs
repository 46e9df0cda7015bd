//! Durable record store: capability trait + memory and Postgres backends.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_core::{NewRecord, Record, SentimentClass, SentimentLabel};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "pulse-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
    #[error("record {id} not found")]
    NotFound { id: String },
}

impl StoreError {
    fn backend(err: impl Into<anyhow::Error>) -> Self {
        StoreError::Unavailable(err.into())
    }
}

/// Outcome of an [`Store::upsert`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The id was new; a record was created.
    Inserted,
    /// The id already existed; content fields were left untouched.
    Existing,
}

/// Keyed record collection, the single source of truth for the pipeline.
///
/// `upsert` is an atomic conditional write keyed by `id`, never a separate
/// existence check followed by an insert; two concurrent upserts for the
/// same id converge to exactly one stored record. `select_unlabeled`
/// returns candidates oldest-inserted-first so repeated backfill passes
/// drain the backlog.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert if `id` is absent, stamping `inserted_at`; otherwise leave
    /// the existing record untouched.
    async fn upsert(&self, new: NewRecord) -> Result<UpsertOutcome, StoreError>;

    /// Fetch one record by id.
    async fn get(&self, id: &str) -> Result<Record, StoreError>;

    /// Advisory existence pre-filter; correctness rests on `upsert`.
    async fn exists(&self, id: &str) -> Result<bool, StoreError>;

    /// Records for `query` with `inserted_at >= cutoff`, most-recent-first,
    /// capped at `limit`.
    async fn query_fresh(
        &self,
        query: &str,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError>;

    /// Records missing at least one label, oldest-inserted-first, capped.
    async fn select_unlabeled(&self, limit: usize) -> Result<Vec<Record>, StoreError>;

    /// Fill currently-absent label slots; provided values for already-set
    /// slots are ignored (labels only ever transition absent to present).
    async fn set_labels(
        &self,
        id: &str,
        label_a: Option<SentimentLabel>,
        label_b: Option<SentimentLabel>,
    ) -> Result<(), StoreError>;

    /// Remove a record by id. Peripheral CRUD, unused by the pipeline.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// In-memory backend. One map lock held across each call gives the same
/// per-call atomicity the relational backend gets from row conflicts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert with an explicit insert timestamp. Used for seeding fixtures;
    /// the trait method stamps `Utc::now()`.
    pub async fn upsert_at(
        &self,
        new: NewRecord,
        inserted_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&new.id) {
            return Ok(UpsertOutcome::Existing);
        }
        records.insert(new.id.clone(), new.into_record(inserted_at));
        Ok(UpsertOutcome::Inserted)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert(&self, new: NewRecord) -> Result<UpsertOutcome, StoreError> {
        self.upsert_at(new, Utc::now()).await
    }

    async fn get(&self, id: &str) -> Result<Record, StoreError> {
        let records = self.records.lock().await;
        records.get(id).cloned().ok_or_else(|| StoreError::NotFound {
            id: id.to_string(),
        })
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.records.lock().await.contains_key(id))
    }

    async fn query_fresh(
        &self,
        query: &str,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let records = self.records.lock().await;
        let mut matched: Vec<Record> = records
            .values()
            .filter(|r| r.query == query && r.inserted_at >= cutoff)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.inserted_at.cmp(&a.inserted_at).then(b.id.cmp(&a.id)));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn select_unlabeled(&self, limit: usize) -> Result<Vec<Record>, StoreError> {
        let records = self.records.lock().await;
        let mut matched: Vec<Record> = records
            .values()
            .filter(|r| !r.is_fully_labeled())
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.inserted_at.cmp(&b.inserted_at).then(a.id.cmp(&b.id)));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn set_labels(
        &self,
        id: &str,
        label_a: Option<SentimentLabel>,
        label_b: Option<SentimentLabel>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(id).ok_or_else(|| StoreError::NotFound {
            id: id.to_string(),
        })?;
        if record.label_a.is_none() {
            record.label_a = label_a;
        }
        if record.label_b.is_none() {
            record.label_b = label_b;
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        records
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                id: id.to_string(),
            })
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id              TEXT PRIMARY KEY,
    query           TEXT NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL,
    author          TEXT NOT NULL,
    raw_text        TEXT NOT NULL,
    normalized_text TEXT NOT NULL,
    label_a_class   TEXT,
    label_a_score   DOUBLE PRECISION,
    label_b_class   TEXT,
    label_b_score   DOUBLE PRECISION,
    inserted_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS records_query_inserted_idx
    ON records (query, inserted_at DESC);
CREATE INDEX IF NOT EXISTS records_unlabeled_idx
    ON records (inserted_at ASC)
    WHERE label_a_class IS NULL OR label_b_class IS NULL;
"#;

/// Postgres backend over an sqlx pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(StoreError::backend)?;
        Ok(Self { pool })
    }

    /// Create the records table and its indexes if missing.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_SQL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(StoreError::backend)?;
        }
        debug!("records schema ensured");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn label_from_columns(
    class: Option<String>,
    score: Option<f64>,
) -> Result<Option<SentimentLabel>, StoreError> {
    match (class, score) {
        (Some(class), Some(score)) => {
            let class = SentimentClass::parse(&class).ok_or_else(|| {
                StoreError::backend(anyhow::anyhow!("unknown sentiment class in store: {class}"))
            })?;
            Ok(Some(SentimentLabel { class, score }))
        }
        _ => Ok(None),
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<Record, StoreError> {
    Ok(Record {
        id: row.try_get("id").map_err(StoreError::backend)?,
        query: row.try_get("query").map_err(StoreError::backend)?,
        timestamp: row.try_get("created_at").map_err(StoreError::backend)?,
        author: row.try_get("author").map_err(StoreError::backend)?,
        raw_text: row.try_get("raw_text").map_err(StoreError::backend)?,
        normalized_text: row
            .try_get("normalized_text")
            .map_err(StoreError::backend)?,
        label_a: label_from_columns(
            row.try_get("label_a_class").map_err(StoreError::backend)?,
            row.try_get("label_a_score").map_err(StoreError::backend)?,
        )?,
        label_b: label_from_columns(
            row.try_get("label_b_class").map_err(StoreError::backend)?,
            row.try_get("label_b_score").map_err(StoreError::backend)?,
        )?,
        inserted_at: row.try_get("inserted_at").map_err(StoreError::backend)?,
    })
}

const RECORD_COLUMNS: &str = "id, query, created_at, author, raw_text, normalized_text, \
     label_a_class, label_a_score, label_b_class, label_b_score, inserted_at";

#[async_trait]
impl Store for PgStore {
    async fn upsert(&self, new: NewRecord) -> Result<UpsertOutcome, StoreError> {
        // Single conditional write; the conflict target makes concurrent
        // upserts of the same id converge without a read-then-write race.
        let result = sqlx::query(
            r#"
            INSERT INTO records (id, query, created_at, author, raw_text, normalized_text)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&new.id)
        .bind(&new.query)
        .bind(new.timestamp)
        .bind(&new.author)
        .bind(&new.raw_text)
        .bind(&new.normalized_text)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        if result.rows_affected() == 1 {
            Ok(UpsertOutcome::Inserted)
        } else {
            Ok(UpsertOutcome::Existing)
        }
    }

    async fn get(&self, id: &str) -> Result<Record, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(StoreError::NotFound { id: id.to_string() }),
        }
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM records WHERE id = $1 LIMIT 1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        Ok(row.is_some())
    }

    async fn query_fresh(
        &self,
        query: &str,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
              FROM records
             WHERE query = $1
               AND inserted_at >= $2
             ORDER BY inserted_at DESC, id DESC
             LIMIT $3
            "#
        ))
        .bind(query)
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        rows.iter().map(record_from_row).collect()
    }

    async fn select_unlabeled(&self, limit: usize) -> Result<Vec<Record>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
              FROM records
             WHERE label_a_class IS NULL OR label_b_class IS NULL
             ORDER BY inserted_at ASC, id ASC
             LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        rows.iter().map(record_from_row).collect()
    }

    async fn set_labels(
        &self,
        id: &str,
        label_a: Option<SentimentLabel>,
        label_b: Option<SentimentLabel>,
    ) -> Result<(), StoreError> {
        // All SET expressions read the pre-update row, so each slot fills
        // only when it was NULL before this statement.
        let result = sqlx::query(
            r#"
            UPDATE records SET
              label_a_class = CASE WHEN label_a_class IS NULL THEN $2 ELSE label_a_class END,
              label_a_score = CASE WHEN label_a_class IS NULL THEN $3 ELSE label_a_score END,
              label_b_class = CASE WHEN label_b_class IS NULL THEN $4 ELSE label_b_class END,
              label_b_score = CASE WHEN label_b_class IS NULL THEN $5 ELSE label_b_score END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(label_a.map(|l| l.class.as_str()))
        .bind(label_a.map(|l| l.score))
        .bind(label_b.map(|l| l.class.as_str()))
        .bind(label_b.map(|l| l.score))
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM records WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pulse_core::normalize;

    fn new_record(id: &str, query: &str, raw: &str) -> NewRecord {
        NewRecord {
            id: id.to_string(),
            query: query.to_string(),
            timestamp: Utc::now(),
            author: "tester".to_string(),
            raw_text: raw.to_string(),
            normalized_text: normalize(raw),
        }
    }

    fn label(class: SentimentClass, score: f64) -> SentimentLabel {
        SentimentLabel { class, score }
    }

    #[tokio::test]
    async fn repeated_upserts_keep_one_record_with_first_content() {
        let store = MemoryStore::new();
        let first = store.upsert(new_record("1", "q", "first text")).await.expect("upsert");
        let second = store.upsert(new_record("1", "q", "second text")).await.expect("upsert");

        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(second, UpsertOutcome::Existing);

        let stored = store.get("1").await.expect("get");
        assert_eq!(stored.raw_text, "first text");
        assert_eq!(store.query_fresh("q", Utc::now() - Duration::hours(1), 10).await.expect("fresh").len(), 1);
    }

    #[tokio::test]
    async fn query_fresh_respects_cutoff_boundary() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let cutoff = now - Duration::hours(6);

        store
            .upsert_at(new_record("stale", "q", "old"), cutoff - Duration::seconds(1))
            .await
            .expect("seed stale");
        store
            .upsert_at(new_record("fresh", "q", "new"), cutoff + Duration::seconds(1))
            .await
            .expect("seed fresh");

        let fresh = store.query_fresh("q", cutoff, 10).await.expect("fresh");
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].id, "fresh");
    }

    #[tokio::test]
    async fn query_fresh_is_most_recent_first_and_capped() {
        let store = MemoryStore::new();
        let base = Utc::now() - Duration::minutes(30);
        for i in 0..5 {
            store
                .upsert_at(
                    new_record(&format!("r{i}"), "q", "text"),
                    base + Duration::minutes(i),
                )
                .await
                .expect("seed");
        }

        let rows = store
            .query_fresh("q", base - Duration::hours(1), 3)
            .await
            .expect("fresh");
        assert_eq!(
            rows.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["r4", "r3", "r2"]
        );
    }

    #[tokio::test]
    async fn select_unlabeled_is_oldest_first_and_skips_fully_labeled() {
        let store = MemoryStore::new();
        let base = Utc::now() - Duration::minutes(10);
        for i in 0..3 {
            store
                .upsert_at(
                    new_record(&format!("r{i}"), "q", "text"),
                    base + Duration::minutes(i),
                )
                .await
                .expect("seed");
        }
        store
            .set_labels(
                "r1",
                Some(label(SentimentClass::Positive, 0.9)),
                Some(label(SentimentClass::Positive, 0.8)),
            )
            .await
            .expect("label r1");

        let candidates = store.select_unlabeled(10).await.expect("unlabeled");
        assert_eq!(
            candidates.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["r0", "r2"]
        );
    }

    #[tokio::test]
    async fn partially_labeled_records_stay_eligible() {
        let store = MemoryStore::new();
        store.upsert(new_record("1", "q", "text")).await.expect("seed");
        store
            .set_labels("1", Some(label(SentimentClass::Neutral, 0.1)), None)
            .await
            .expect("label a only");

        let candidates = store.select_unlabeled(10).await.expect("unlabeled");
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].label_a.is_some());
        assert!(candidates[0].label_b.is_none());
    }

    #[tokio::test]
    async fn set_labels_never_overwrites_present_labels() {
        let store = MemoryStore::new();
        store.upsert(new_record("1", "q", "text")).await.expect("seed");
        store
            .set_labels("1", Some(label(SentimentClass::Positive, 0.9)), None)
            .await
            .expect("first write");
        store
            .set_labels(
                "1",
                Some(label(SentimentClass::Negative, -0.5)),
                Some(label(SentimentClass::Neutral, 0.0)),
            )
            .await
            .expect("second write");

        let stored = store.get("1").await.expect("get");
        assert_eq!(stored.label_a.expect("label a").class, SentimentClass::Positive);
        assert_eq!(stored.label_b.expect("label b").class, SentimentClass::Neutral);
    }

    #[tokio::test]
    async fn set_labels_on_unknown_id_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .set_labels("missing", Some(label(SentimentClass::Positive, 1.0)), None)
            .await
            .expect_err("should fail");
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_removes_record_or_reports_not_found() {
        let store = MemoryStore::new();
        store.upsert(new_record("1", "q", "text")).await.expect("seed");
        store.delete("1").await.expect("delete");
        assert!(!store.exists("1").await.expect("exists"));
        assert!(matches!(
            store.delete("1").await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
