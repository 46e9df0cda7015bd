//! Ingest/cache/dedup/backfill pipeline orchestration.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use pulse_client::{BackoffPolicy, SearchClient, SearchError, SearchPage, SentimentClassifier};
use pulse_core::{normalize, NewRecord, Record};
use pulse_store::{Store, StoreError, UpsertOutcome};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pulse-pipeline";

/// Pipeline tuning knobs, env-driven with defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Freshness window: cached records older than this no longer satisfy
    /// a read request.
    pub cache_ttl: Duration,
    /// Per-call page size cap imposed by the remote API.
    pub page_size_cap: usize,
    /// Classifier chunk size for backfill passes.
    pub backfill_batch_size: usize,
    /// Candidate cap per backfill pass.
    pub backfill_max_records: usize,
    /// Retry bound + backoff for remote search calls.
    pub backoff: BackoffPolicy,
    pub scheduler_enabled: bool,
    pub backfill_cron: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::hours(6),
            page_size_cap: 100,
            backfill_batch_size: 64,
            backfill_max_records: 150,
            backoff: BackoffPolicy::default(),
            scheduler_enabled: false,
            backfill_cron: "0 */10 * * * *".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cache_ttl: env_parse::<i64>("PULSE_CACHE_TTL_HOURS")
                .map(Duration::hours)
                .unwrap_or(defaults.cache_ttl),
            page_size_cap: env_parse("PULSE_PAGE_SIZE_CAP").unwrap_or(defaults.page_size_cap),
            backfill_batch_size: env_parse("PULSE_BACKFILL_BATCH_SIZE")
                .unwrap_or(defaults.backfill_batch_size),
            backfill_max_records: env_parse("PULSE_BACKFILL_MAX_RECORDS")
                .unwrap_or(defaults.backfill_max_records),
            backoff: BackoffPolicy {
                max_retries: env_parse("PULSE_RETRY_MAX_ATTEMPTS")
                    .unwrap_or(defaults.backoff.max_retries),
                base_delay: env_parse::<u64>("PULSE_RETRY_BASE_DELAY_MS")
                    .map(StdDuration::from_millis)
                    .unwrap_or(defaults.backoff.base_delay),
                max_delay: defaults.backoff.max_delay,
            },
            scheduler_enabled: std::env::var("PULSE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            backfill_cron: std::env::var("PULSE_BACKFILL_CRON")
                .unwrap_or(defaults.backfill_cron),
        }
    }
}

/// Read-only freshness gate: decides whether a query can be served from
/// the store or must hit the remote API.
pub struct CacheGate {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl CacheGate {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// A fetch is needed unless the store already holds `requested_limit`
    /// records for `query` inserted within the freshness window. A zero
    /// request never needs a fetch.
    pub async fn needs_fetch(
        &self,
        query: &str,
        requested_limit: usize,
    ) -> Result<bool, StoreError> {
        if requested_limit == 0 {
            return Ok(false);
        }
        let cutoff = Utc::now() - self.ttl;
        let fresh = self
            .store
            .query_fresh(query, cutoff, requested_limit)
            .await?;
        Ok(fresh.len() < requested_limit)
    }
}

/// Paginates the remote search API for a query, deduplicates against the
/// store and upserts new records.
pub struct Ingestor {
    store: Arc<dyn Store>,
    search: Arc<dyn SearchClient>,
    gate: CacheGate,
    config: PipelineConfig,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn Store>,
        search: Arc<dyn SearchClient>,
        config: PipelineConfig,
    ) -> Self {
        let gate = CacheGate::new(store.clone(), config.cache_ttl);
        Self {
            store,
            search,
            gate,
            config,
        }
    }

    /// Fetch up to `limit` new records for `query`, serving from the store
    /// when it is fresh enough. Remote failures degrade to partial or
    /// cached results; only store unavailability surfaces as an error.
    pub async fn ingest(&self, query: &str, limit: usize) -> Result<Vec<Record>> {
        if !self.gate.needs_fetch(query, limit).await? {
            let cutoff = Utc::now() - self.config.cache_ttl;
            let cached = self.store.query_fresh(query, cutoff, limit).await?;
            info!(query, cached = cached.len(), "serving from cache, no remote call");
            return Ok(cached);
        }

        let run_id = Uuid::new_v4();
        let span = info_span!("ingest", %run_id, query, limit);
        async {
            let mut new_records: Vec<Record> = Vec::new();
            let mut page_token: Option<String> = None;

            loop {
                let remaining = limit.saturating_sub(new_records.len());
                if remaining == 0 {
                    break;
                }
                let page_size = remaining.min(self.config.page_size_cap).max(1);

                let page = match self
                    .search_with_retry(query, page_size, page_token.as_deref())
                    .await
                {
                    Ok(page) => page,
                    Err(err) => {
                        // Partial fetch beats no fetch; keep what we have.
                        warn!(error = %err, "remote search gave up, ending pagination");
                        break;
                    }
                };

                for item in page.items {
                    if new_records.len() >= limit {
                        break;
                    }
                    // Cheap advisory pre-filter; the upsert below is what
                    // actually guarantees one record per id.
                    if self.store.exists(&item.id).await? {
                        continue;
                    }
                    let new = NewRecord {
                        id: item.id.clone(),
                        query: query.to_string(),
                        timestamp: item.created_at,
                        author: item.author,
                        normalized_text: normalize(&item.text),
                        raw_text: item.text,
                    };
                    if self.store.upsert(new).await? == UpsertOutcome::Inserted {
                        new_records.push(self.store.get(&item.id).await?);
                    }
                }

                match page.next_page_token {
                    Some(token) if new_records.len() < limit => page_token = Some(token),
                    _ => break,
                }
            }

            if new_records.is_empty() {
                // Stale-but-something beats empty.
                let stale = self
                    .store
                    .query_fresh(query, DateTime::<Utc>::MIN_UTC, limit)
                    .await?;
                info!(query, stale = stale.len(), "no new records, falling back to store");
                return Ok(stale);
            }

            info!(query, new = new_records.len(), "ingest complete");
            Ok(new_records)
        }
        .instrument(span)
        .await
    }

    async fn search_with_retry(
        &self,
        query: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<SearchPage, SearchError> {
        let backoff = self.config.backoff;
        let mut last_error: Option<SearchError> = None;

        for attempt in 0..=backoff.max_retries {
            match self.search.search(query, page_size, page_token).await {
                Ok(page) => return Ok(page),
                Err(err) if err.is_retryable() && attempt < backoff.max_retries => {
                    warn!(attempt, error = %err, "retrying remote search");
                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.expect("retry loop should capture a search error"))
    }
}

/// Finds records missing labels and fills them in via batched classifier
/// calls, isolating failures per chunk and per classifier.
pub struct LabelBackfiller {
    store: Arc<dyn Store>,
    classifier_a: Arc<dyn SentimentClassifier>,
    classifier_b: Arc<dyn SentimentClassifier>,
    config: PipelineConfig,
}

impl LabelBackfiller {
    pub fn new(
        store: Arc<dyn Store>,
        classifier_a: Arc<dyn SentimentClassifier>,
        classifier_b: Arc<dyn SentimentClassifier>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            classifier_a,
            classifier_b,
            config,
        }
    }

    /// Run one backfill pass. Returns the count of records for which at
    /// least one previously-absent label was written. A classifier failure
    /// skips that classifier's labels for the chunk; the pass continues
    /// with later chunks either way.
    pub async fn backfill(&self) -> Result<usize> {
        let candidates = self
            .store
            .select_unlabeled(self.config.backfill_max_records)
            .await
            .context("selecting unlabeled records")?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let span = info_span!("backfill", candidates = candidates.len());
        async {
            let mut updated = 0usize;
            let batch_size = self.config.backfill_batch_size.max(1);

            for chunk in candidates.chunks(batch_size) {
                let texts: Vec<String> =
                    chunk.iter().map(|r| r.normalized_text.clone()).collect();

                let labels_a = self.classify_chunk(&self.classifier_a, "a", &texts).await;
                let labels_b = self.classify_chunk(&self.classifier_b, "b", &texts).await;
                if labels_a.is_none() && labels_b.is_none() {
                    // Whole chunk skipped; its records stay unlabeled and
                    // are picked up again on the next pass.
                    continue;
                }

                for (idx, record) in chunk.iter().enumerate() {
                    let label_a = labels_a.as_ref().map(|labels| labels[idx]);
                    let label_b = labels_b.as_ref().map(|labels| labels[idx]);
                    let newly_written = (label_a.is_some() && record.label_a.is_none())
                        || (label_b.is_some() && record.label_b.is_none());

                    match self.store.set_labels(&record.id, label_a, label_b).await {
                        Ok(()) => {
                            if newly_written {
                                updated += 1;
                            }
                        }
                        Err(StoreError::NotFound { .. }) => {
                            warn!(id = %record.id, "record disappeared before labeling");
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }

            info!(updated, "backfill pass complete");
            Ok(updated)
        }
        .instrument(span)
        .await
    }

    /// One classifier call for one chunk. Any failure, including an output
    /// that does not align 1:1 with the input, drops this classifier's
    /// labels for the chunk.
    async fn classify_chunk(
        &self,
        classifier: &Arc<dyn SentimentClassifier>,
        which: &str,
        texts: &[String],
    ) -> Option<Vec<pulse_core::SentimentLabel>> {
        match classifier.classify(texts).await {
            Ok(labels) if labels.len() == texts.len() => Some(labels),
            Ok(labels) => {
                warn!(
                    classifier = which,
                    expected = texts.len(),
                    got = labels.len(),
                    "classifier output misaligned with input, skipping chunk"
                );
                None
            }
            Err(err) => {
                warn!(classifier = which, error = %err, "classifier failed for chunk");
                None
            }
        }
    }
}

/// Background backfill on a cron schedule, when enabled by config.
pub async fn maybe_build_scheduler(
    backfiller: Arc<LabelBackfiller>,
    config: &PipelineConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.backfill_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let backfiller = backfiller.clone();
        Box::pin(async move {
            match backfiller.backfill().await {
                Ok(updated) => info!(updated, "scheduled backfill pass finished"),
                Err(err) => warn!(error = %err, "scheduled backfill pass failed"),
            }
        })
    })
    .with_context(|| format!("creating backfill job for cron {cron}"))?;
    sched.add(job).await.context("adding backfill job")?;
    Ok(Some(sched))
}
