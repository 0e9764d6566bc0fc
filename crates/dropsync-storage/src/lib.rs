//! Deal/user document storage + HTTP fetch utilities for dropsync.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dropsync_core::{Deal, Notification, User};
use futures::future::try_join_all;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "dropsync-storage";

/// Largest id list a single "id is one of N values" existence query may carry.
pub const MAX_BATCH_QUERY_SIZE: usize = 30;

pub const DEALS_COLLECTION: &str = "deals";
pub const USERS_COLLECTION: &str = "users";

pub fn notifications_collection(user_id: &str) -> String {
    format!("{USERS_COLLECTION}/{user_id}/notifications")
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("connecting to store: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("query on `{collection}` failed: {message}")]
    Query { collection: String, message: String },
    #[error("write to `{collection}` failed: {message}")]
    Write { collection: String, message: String },
}

impl StoreError {
    pub fn query(collection: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Query {
            collection: collection.into(),
            message: err.to_string(),
        }
    }

    pub fn write(collection: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Write {
            collection: collection.into(),
            message: err.to_string(),
        }
    }
}

/// Split `ids` into chunks of at most `chunk_size`, run `query` for every chunk
/// concurrently and union the per-chunk results.
///
/// An empty id set issues no query at all.
pub async fn partition_query_merge<F, Fut>(
    ids: &BTreeSet<String>,
    chunk_size: usize,
    query: F,
) -> Result<BTreeSet<String>, StoreError>
where
    F: Fn(Vec<String>) -> Fut,
    Fut: Future<Output = Result<BTreeSet<String>, StoreError>>,
{
    if ids.is_empty() {
        return Ok(BTreeSet::new());
    }

    let ids: Vec<String> = ids.iter().cloned().collect();
    let chunk_size = chunk_size.max(1);
    debug!(
        candidates = ids.len(),
        chunk_size,
        chunks = ids.len().div_ceil(chunk_size),
        "partitioning existence query"
    );

    let per_chunk = try_join_all(ids.chunks(chunk_size).map(|chunk| query(chunk.to_vec()))).await?;
    Ok(per_chunk.into_iter().flatten().collect())
}

/// Append-only keyed collection of deals.
#[async_trait]
pub trait DealStore: Send + Sync {
    fn max_batch_query_size(&self) -> usize {
        MAX_BATCH_QUERY_SIZE
    }

    /// One existence query. `ids` never exceeds [`DealStore::max_batch_query_size`].
    async fn query_existing_chunk(&self, ids: &[String]) -> Result<BTreeSet<String>, StoreError>;

    /// Ids out of `candidates` that are already stored.
    async fn existing_ids(
        &self,
        candidates: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, StoreError> {
        partition_query_merge(candidates, self.max_batch_query_size(), |chunk| async move {
            self.query_existing_chunk(&chunk).await
        })
        .await
    }

    /// Single atomic bulk write. Ids that already exist keep their original body.
    async fn insert_all(&self, deals: &[Deal]) -> Result<(), StoreError>;
}

/// Users plus their per-user notification sub-collections.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn list_users(&self) -> Result<Vec<User>, StoreError>;

    /// Current push tokens for `user_id`; an unknown user has none.
    async fn notification_tokens(&self, user_id: &str) -> Result<Vec<String>, StoreError>;

    /// Keys (deal ids) of every stored notification for `user_id`.
    async fn notification_ids(&self, user_id: &str) -> Result<BTreeSet<String>, StoreError>;

    /// Atomic batch write of `notifications` into the user's sub-collection.
    async fn write_notifications(
        &self,
        user_id: &str,
        notifications: &[Notification],
    ) -> Result<(), StoreError>;

    /// Atomic batch delete of the given notification keys.
    async fn delete_notifications(&self, user_id: &str, deal_ids: &[String]) -> Result<(), StoreError>;
}

fn check_chunk(ids: &[String], limit: usize) -> Result<(), StoreError> {
    if ids.len() > limit {
        return Err(StoreError::query(
            DEALS_COLLECTION,
            format!("existence query carries {} ids, limit is {limit}", ids.len()),
        ));
    }
    Ok(())
}

/// Postgres-backed store. Deal bodies and notification copies are `jsonb`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    max_batch_query_size: usize,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(StoreError::Connect)?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            max_batch_query_size: MAX_BATCH_QUERY_SIZE,
        }
    }

    pub fn with_max_batch_query_size(mut self, size: usize) -> Self {
        self.max_batch_query_size = size.max(1);
        self
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .context("running dropsync migrations")
    }
}

#[async_trait]
impl DealStore for PgStore {
    fn max_batch_query_size(&self) -> usize {
        self.max_batch_query_size
    }

    async fn query_existing_chunk(&self, ids: &[String]) -> Result<BTreeSet<String>, StoreError> {
        check_chunk(ids, self.max_batch_query_size)?;
        let rows = sqlx::query("SELECT id FROM deals WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::query(DEALS_COLLECTION, e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("id")
                    .map_err(|e| StoreError::query(DEALS_COLLECTION, e))
            })
            .collect()
    }

    async fn insert_all(&self, deals: &[Deal]) -> Result<(), StoreError> {
        if deals.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::write(DEALS_COLLECTION, e))?;
        for deal in deals {
            sqlx::query("INSERT INTO deals (id, body) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING")
                .bind(&deal.id)
                .bind(Json(deal))
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::write(DEALS_COLLECTION, e))?;
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::write(DEALS_COLLECTION, e))
    }
}

#[async_trait]
impl UserDirectory for PgStore {
    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, notifications_enabled, preferred_game_platforms, notification_tokens \
             FROM users ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::query(USERS_COLLECTION, e))?;

        rows.iter()
            .map(|row| -> Result<User, sqlx::Error> {
                Ok(User {
                    id: row.try_get("id")?,
                    notifications_enabled: row.try_get("notifications_enabled")?,
                    preferred_game_platforms: row.try_get("preferred_game_platforms")?,
                    notification_tokens: row.try_get("notification_tokens")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::query(USERS_COLLECTION, e))
    }

    async fn notification_tokens(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let row = sqlx::query("SELECT notification_tokens FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::query(USERS_COLLECTION, e))?;

        match row {
            Some(row) => row
                .try_get("notification_tokens")
                .map_err(|e| StoreError::query(USERS_COLLECTION, e)),
            None => Ok(Vec::new()),
        }
    }

    async fn notification_ids(&self, user_id: &str) -> Result<BTreeSet<String>, StoreError> {
        let collection = notifications_collection(user_id);
        let rows = sqlx::query("SELECT deal_id FROM user_notifications WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::query(&collection, e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("deal_id")
                    .map_err(|e| StoreError::query(&collection, e))
            })
            .collect()
    }

    async fn write_notifications(
        &self,
        user_id: &str,
        notifications: &[Notification],
    ) -> Result<(), StoreError> {
        if notifications.is_empty() {
            return Ok(());
        }
        let collection = notifications_collection(user_id);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::write(&collection, e))?;
        for notification in notifications {
            sqlx::query(
                "INSERT INTO user_notifications (user_id, deal_id, body, received_at, read) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (user_id, deal_id) DO UPDATE \
                 SET body = EXCLUDED.body, received_at = EXCLUDED.received_at, read = EXCLUDED.read",
            )
            .bind(user_id)
            .bind(notification.deal_id())
            .bind(Json(&notification.deal))
            .bind(notification.received_at)
            .bind(notification.read)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::write(&collection, e))?;
        }
        tx.commit().await.map_err(|e| StoreError::write(&collection, e))
    }

    async fn delete_notifications(&self, user_id: &str, deal_ids: &[String]) -> Result<(), StoreError> {
        if deal_ids.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM user_notifications WHERE user_id = $1 AND deal_id = ANY($2)")
            .bind(user_id)
            .bind(deal_ids.to_vec())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::write(notifications_collection(user_id), e))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    deals: BTreeMap<String, JsonValue>,
    users: BTreeMap<String, User>,
    notifications: BTreeMap<String, BTreeMap<String, Notification>>,
}

/// In-process store with the same batch-size limit as the document store.
///
/// Counts existence queries and bulk writes so callers can observe how the
/// pipeline talks to storage.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    max_batch_query_size: usize,
    failing_users: BTreeSet<String>,
    existence_queries: AtomicUsize,
    largest_chunk: AtomicUsize,
    bulk_inserts: AtomicUsize,
    notification_batches: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            max_batch_query_size: MAX_BATCH_QUERY_SIZE,
            failing_users: BTreeSet::new(),
            existence_queries: AtomicUsize::new(0),
            largest_chunk: AtomicUsize::new(0),
            bulk_inserts: AtomicUsize::new(0),
            notification_batches: AtomicUsize::new(0),
        }
    }

    pub fn with_max_batch_query_size(mut self, size: usize) -> Self {
        self.max_batch_query_size = size.max(1);
        self
    }

    /// Notification writes and deletes for `user_id` fail with [`StoreError::Write`].
    #[cfg(any(test, feature = "test-util"))]
    pub fn with_failing_user(mut self, user_id: impl Into<String>) -> Self {
        self.failing_users.insert(user_id.into());
        self
    }

    pub fn with_users(mut self, users: impl IntoIterator<Item = User>) -> Self {
        let state = self.state.get_mut();
        for user in users {
            state.users.insert(user.id.clone(), user);
        }
        self
    }

    pub async fn put_user(&self, user: User) {
        self.state.lock().await.users.insert(user.id.clone(), user);
    }

    pub async fn put_notification(&self, user_id: &str, notification: Notification) {
        self.state
            .lock()
            .await
            .notifications
            .entry(user_id.to_string())
            .or_default()
            .insert(notification.deal_id().to_string(), notification);
    }

    /// Stored deal bodies keyed by id.
    pub async fn deal_bodies(&self) -> BTreeMap<String, JsonValue> {
        self.state.lock().await.deals.clone()
    }

    pub async fn notifications_for(&self, user_id: &str) -> BTreeMap<String, Notification> {
        self.state
            .lock()
            .await
            .notifications
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn existence_queries(&self) -> usize {
        self.existence_queries.load(Ordering::SeqCst)
    }

    pub fn largest_chunk(&self) -> usize {
        self.largest_chunk.load(Ordering::SeqCst)
    }

    pub fn bulk_inserts(&self) -> usize {
        self.bulk_inserts.load(Ordering::SeqCst)
    }

    pub fn notification_batches(&self) -> usize {
        self.notification_batches.load(Ordering::SeqCst)
    }

    fn check_user_writable(&self, user_id: &str) -> Result<(), StoreError> {
        if self.failing_users.contains(user_id) {
            return Err(StoreError::write(
                notifications_collection(user_id),
                "injected write failure",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DealStore for MemoryStore {
    fn max_batch_query_size(&self) -> usize {
        self.max_batch_query_size
    }

    async fn query_existing_chunk(&self, ids: &[String]) -> Result<BTreeSet<String>, StoreError> {
        check_chunk(ids, self.max_batch_query_size)?;
        self.existence_queries.fetch_add(1, Ordering::SeqCst);
        self.largest_chunk.fetch_max(ids.len(), Ordering::SeqCst);

        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter(|id| state.deals.contains_key(id.as_str()))
            .cloned()
            .collect())
    }

    async fn insert_all(&self, deals: &[Deal]) -> Result<(), StoreError> {
        let bodies = deals
            .iter()
            .map(|deal| serde_json::to_value(deal).map(|body| (deal.id.clone(), body)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::write(DEALS_COLLECTION, e))?;

        self.bulk_inserts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        for (id, body) in bodies {
            state.deals.entry(id).or_insert(body);
        }
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.state.lock().await.users.values().cloned().collect())
    }

    async fn notification_tokens(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .users
            .get(user_id)
            .map(|u| u.notification_tokens.clone())
            .unwrap_or_default())
    }

    async fn notification_ids(&self, user_id: &str) -> Result<BTreeSet<String>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .notifications
            .get(user_id)
            .map(|n| n.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn write_notifications(
        &self,
        user_id: &str,
        notifications: &[Notification],
    ) -> Result<(), StoreError> {
        self.check_user_writable(user_id)?;
        self.notification_batches.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        let entries = state.notifications.entry(user_id.to_string()).or_default();
        for notification in notifications {
            entries.insert(notification.deal_id().to_string(), notification.clone());
        }
        Ok(())
    }

    async fn delete_notifications(&self, user_id: &str, deal_ids: &[String]) -> Result<(), StoreError> {
        self.check_user_writable(user_id)?;
        self.notification_batches.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if let Some(entries) = state.notifications.get_mut(user_id) {
            for id in deal_ids {
                entries.remove(id);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Shared reqwest client with a global in-flight limit and retry on transient failures.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("encoding request body: {0}")]
    Encode(#[from] serde_json::Error),
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn get_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", method = "GET", url);
        self.send_with_retry(|| self.client.get(url))
            .instrument(span)
            .await
    }

    /// POST `body` as JSON, optionally with a bearer token.
    pub async fn post_json<T>(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &T,
    ) -> Result<FetchedResponse, FetchError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(body)?;
        let span = info_span!("http_fetch", method = "POST", url);
        self.send_with_retry(|| {
            let request = self
                .client
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .body(payload.clone());
            match bearer {
                Some(token) => request.bearer_auth(token),
                None => request,
            }
        })
        .instrument(span)
        .await
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _permit = self.global_limit.acquire().await.expect("semaphore not closed");

        let mut attempt = 0usize;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn ids(range: std::ops::Range<usize>) -> BTreeSet<String> {
        range.map(|i| i.to_string()).collect()
    }

    fn fast_fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..Default::default()
        })
        .expect("fetcher")
    }

    #[tokio::test]
    async fn partition_issues_one_query_per_chunk_and_merges() {
        let calls = AtomicUsize::new(0);
        let found = partition_query_merge(&ids(0..65), 30, |chunk| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                assert!(chunk.len() <= 30);
                Ok::<_, StoreError>(
                    chunk
                        .into_iter()
                        .filter(|id| id.ends_with('0'))
                        .collect::<BTreeSet<String>>(),
                )
            }
        })
        .await
        .expect("merge");

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(found.len(), 7);
        assert!(found.contains("60"));
    }

    #[tokio::test]
    async fn partition_skips_query_for_empty_input() {
        let calls = AtomicUsize::new(0);
        let found = partition_query_merge(&BTreeSet::new(), 30, |_chunk| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, StoreError>(BTreeSet::new()) }
        })
        .await
        .expect("merge");

        assert!(found.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn partition_fails_when_any_chunk_fails() {
        let result = partition_query_merge(&ids(0..40), 10, |chunk| async move {
            if chunk.contains(&"35".to_string()) {
                Err(StoreError::query(DEALS_COLLECTION, "boom"))
            } else {
                Ok(BTreeSet::new())
            }
        })
        .await;

        assert!(matches!(result, Err(StoreError::Query { .. })));
    }

    #[tokio::test]
    async fn memory_existing_ids_respects_batch_limit() {
        let store = MemoryStore::new();
        let deals: Vec<Deal> = (0..45).map(|i| Deal::new(i.to_string(), "d", "pc")).collect();
        store.insert_all(&deals[..40]).await.expect("insert");

        let existing = store.existing_ids(&ids(0..45)).await.expect("existing");

        assert_eq!(existing, ids(0..40));
        assert_eq!(store.existence_queries(), 2);
        assert!(store.largest_chunk() <= MAX_BATCH_QUERY_SIZE);
    }

    #[tokio::test]
    async fn memory_rejects_oversized_chunk() {
        let store = MemoryStore::new().with_max_batch_query_size(2);
        let chunk = vec!["1".to_string(), "2".to_string(), "3".to_string()];
        let result = store.query_existing_chunk(&chunk).await;
        assert!(matches!(result, Err(StoreError::Query { .. })));
    }

    #[tokio::test]
    async fn memory_insert_keeps_original_body() {
        let store = MemoryStore::new();
        let mut original = Deal::new("9", "Original", "pc");
        original.status = "Active".into();
        store.insert_all(&[original]).await.expect("first insert");

        let mut changed = Deal::new("9", "Changed", "pc");
        changed.status = "Expired".into();
        store.insert_all(&[changed]).await.expect("second insert");

        let bodies = store.deal_bodies().await;
        assert_eq!(bodies["9"]["title"], "Original");
        assert_eq!(bodies["9"]["status"], "Active");
    }

    #[tokio::test]
    async fn memory_failing_user_rejects_notification_writes() {
        let store = MemoryStore::new().with_failing_user("u2");
        let result = store.delete_notifications("u2", &["1".to_string()]).await;
        assert!(matches!(result, Err(StoreError::Write { .. })));
        assert!(store.delete_notifications("u1", &["1".to_string()]).await.is_ok());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn only_server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_exhausted() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/feed");
                then.status(503);
            })
            .await;

        let result = fast_fetcher(2).get_bytes(&server.url("/feed")).await;

        assert!(matches!(result, Err(FetchError::HttpStatus { status: 503, .. })));
        assert_eq!(mock.hits_async().await, 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/feed");
                then.status(404);
            })
            .await;

        let result = fast_fetcher(3).get_bytes(&server.url("/feed")).await;

        assert!(matches!(result, Err(FetchError::HttpStatus { status: 404, .. })));
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn post_json_sends_bearer_and_body() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/send")
                    .header("authorization", "Bearer secret")
                    .header("content-type", "application/json")
                    .json_body(serde_json::json!({ "hello": "world" }));
                then.status(200).body("ok");
            })
            .await;

        let response = fast_fetcher(0)
            .post_json(
                &server.url("/send"),
                Some("secret"),
                &serde_json::json!({ "hello": "world" }),
            )
            .await
            .expect("post");

        assert_eq!(response.body, b"ok");
        mock.assert_async().await;
    }
}
