//! Deal sync pipeline: import, cleanup, match and dispatch.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dropsync_core::{Deal, Notification, User};
use dropsync_feed::{FeedClient, GamerPowerFeed, DEFAULT_FEED_URL};
use dropsync_push::{HttpPushGateway, MulticastReport, PushError, PushMessage, PushSender};
use dropsync_storage::{
    DealStore, HttpClientConfig, HttpFetcher, PgStore, StoreError, UserDirectory,
    MAX_BATCH_QUERY_SIZE,
};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dropsync-sync";

/// Matched user id -> deals to notify about, in feed order.
pub type MatchedDeals = BTreeMap<String, Vec<Deal>>;

/// Failure confined to one user. Logged and counted, never fatal to the run.
#[derive(Debug, Error)]
pub enum PerUserError {
    #[error("persisting notifications for user {user_id}: {source}")]
    Match {
        user_id: String,
        #[source]
        source: StoreError,
    },
    #[error("reading notification tokens for user {user_id}: {source}")]
    Tokens {
        user_id: String,
        #[source]
        source: StoreError,
    },
    #[error("dispatching deals to user {user_id}: {source}")]
    Dispatch {
        user_id: String,
        #[source]
        source: PushError,
    },
    #[error("cleaning notifications for user {user_id}: {source}")]
    Cleanup {
        user_id: String,
        #[source]
        source: StoreError,
    },
}

impl PerUserError {
    pub fn user_id(&self) -> &str {
        match self {
            Self::Match { user_id, .. }
            | Self::Tokens { user_id, .. }
            | Self::Dispatch { user_id, .. }
            | Self::Cleanup { user_id, .. } => user_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub feed_url: String,
    pub push_endpoint: String,
    pub push_server_key: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_batch_query_size: usize,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable source.
    ///
    /// `DATABASE_URL`, `PUSH_ENDPOINT` and `PUSH_SERVER_KEY` are required.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .with_context(|| format!("missing required environment variable {key}"))
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            push_endpoint: required("PUSH_ENDPOINT")?,
            push_server_key: required("PUSH_SERVER_KEY")?,
            feed_url: lookup("FEED_URL").unwrap_or_else(|| DEFAULT_FEED_URL.to_string()),
            user_agent: lookup("DROPSYNC_USER_AGENT").unwrap_or_else(|| "dropsync/0.1".to_string()),
            http_timeout_secs: lookup("HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            max_batch_query_size: lookup("MAX_BATCH_QUERY_SIZE")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(MAX_BATCH_QUERY_SIZE),
            sync_cron: lookup("SYNC_CRON").unwrap_or_else(|| "0 0 * * * *".to_string()),
        })
    }
}

pub fn database_url_from_env() -> Result<String> {
    std::env::var("DATABASE_URL").context("missing required environment variable DATABASE_URL")
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportOutcome {
    /// Deals seen for the first time, in feed order.
    pub new_deals: Vec<Deal>,
    /// Every id in the current feed; drives notification cleanup.
    pub all_current_ids: BTreeSet<String>,
}

pub struct DealSyncService {
    feed: Arc<dyn FeedClient>,
    deals: Arc<dyn DealStore>,
}

impl DealSyncService {
    pub fn new(feed: Arc<dyn FeedClient>, deals: Arc<dyn DealStore>) -> Self {
        Self { feed, deals }
    }

    pub async fn import_deals(&self) -> Result<ImportOutcome> {
        let feed = self
            .feed
            .fetch()
            .await
            .with_context(|| format!("fetching {} feed", self.feed.source_id()))?;

        if feed.is_empty() {
            info!("feed is empty; deal store untouched");
            return Ok(ImportOutcome::default());
        }

        let all_current_ids: BTreeSet<String> = feed.iter().map(|d| d.id.clone()).collect();
        let existing = self
            .deals
            .existing_ids(&all_current_ids)
            .await
            .context("checking which feed deals are already stored")?;

        let mut taken = BTreeSet::new();
        let new_deals: Vec<Deal> = feed
            .into_iter()
            .filter(|deal| !existing.contains(&deal.id) && taken.insert(deal.id.clone()))
            .collect();

        if !new_deals.is_empty() {
            self.deals
                .insert_all(&new_deals)
                .await
                .context("inserting new deals")?;
        }

        info!(
            current = all_current_ids.len(),
            existing = existing.len(),
            new = new_deals.len(),
            "imported deals"
        );
        Ok(ImportOutcome {
            new_deals,
            all_current_ids,
        })
    }
}

/// Deals out of `deals` sharing at least one platform tag with the user's preferences.
pub fn deals_for_user(user: &User, deals: &[Deal]) -> Vec<Deal> {
    let platforms = user.normalized_platforms();
    if platforms.is_empty() {
        return Vec::new();
    }
    deals
        .iter()
        .filter(|deal| deal.targets_any(&platforms))
        .cloned()
        .collect()
}

pub struct NotificationMatcher {
    users: Arc<dyn UserDirectory>,
}

impl NotificationMatcher {
    pub fn new(users: Arc<dyn UserDirectory>) -> Self {
        Self { users }
    }

    /// Match `new_deals` against every opted-in user and persist each match
    /// set into that user's notifications as one batch.
    ///
    /// A failed batch write is logged; the user still gets the push.
    pub async fn match_deals(
        &self,
        new_deals: &[Deal],
        users: &[User],
        now: DateTime<Utc>,
    ) -> MatchedDeals {
        let matched: MatchedDeals = users
            .iter()
            .filter(|user| user.wants_deal_notifications())
            .filter_map(|user| {
                let deals = deals_for_user(user, new_deals);
                (!deals.is_empty()).then(|| (user.id.clone(), deals))
            })
            .collect();
        debug!(
            users = users.len(),
            matched = matched.len(),
            deals = new_deals.len(),
            "matched new deals against preferences"
        );

        let writes = matched.iter().map(|(user_id, deals)| async move {
            let notifications: Vec<Notification> = deals
                .iter()
                .cloned()
                .map(|deal| Notification::unread(deal, now))
                .collect();
            let written = self
                .users
                .write_notifications(user_id, &notifications)
                .await
                .map_err(|source| PerUserError::Match {
                    user_id: user_id.clone(),
                    source,
                });
            if let Err(err) = written {
                error!(user_id = err.user_id(), error = %err, "failed to persist matched notifications");
            }
        });
        join_all(writes).await;

        matched
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub messages_sent: usize,
    pub users_without_tokens: usize,
    pub users_failed: usize,
    pub deliveries_succeeded: usize,
    pub deliveries_failed: usize,
}

enum UserDispatch {
    Sent(MulticastReport),
    NoTokens,
}

pub struct NotificationDispatcher {
    users: Arc<dyn UserDirectory>,
    push: Arc<dyn PushSender>,
}

impl NotificationDispatcher {
    pub fn new(users: Arc<dyn UserDirectory>, push: Arc<dyn PushSender>) -> Self {
        Self { users, push }
    }

    /// One multicast per matched user. A failure for one user never stops the others.
    pub async fn dispatch(&self, matched: &MatchedDeals) -> DispatchSummary {
        let outcomes = join_all(
            matched
                .iter()
                .map(|(user_id, deals)| self.dispatch_user(user_id, deals)),
        )
        .await;

        let mut summary = DispatchSummary::default();
        for outcome in outcomes {
            match outcome {
                Ok(UserDispatch::Sent(report)) => {
                    summary.messages_sent += 1;
                    summary.deliveries_succeeded += report.success_count;
                    summary.deliveries_failed += report.failure_count;
                }
                Ok(UserDispatch::NoTokens) => summary.users_without_tokens += 1,
                Err(err) => {
                    error!(user_id = err.user_id(), error = %err, "failed to send deal notification");
                    summary.users_failed += 1;
                }
            }
        }
        summary
    }

    async fn dispatch_user(&self, user_id: &str, deals: &[Deal]) -> Result<UserDispatch, PerUserError> {
        let tokens = self
            .users
            .notification_tokens(user_id)
            .await
            .map_err(|source| PerUserError::Tokens {
                user_id: user_id.to_string(),
                source,
            })?;
        if tokens.is_empty() {
            info!(user_id, "user has no notification tokens; skipping push");
            return Ok(UserDispatch::NoTokens);
        }

        let dispatch_err = |source| PerUserError::Dispatch {
            user_id: user_id.to_string(),
            source,
        };
        let message = PushMessage::for_deals(deals, tokens).map_err(dispatch_err)?;
        let report = self
            .push
            .send_multicast(&message)
            .await
            .map_err(dispatch_err)?;

        info!(
            user_id,
            deals = deals.len(),
            succeeded = report.success_count,
            failed = report.failure_count,
            "sent deal notification"
        );
        if report.failure_count > 0 {
            debug!(user_id, tokens = ?report.failed_tokens(&message.tokens), "undelivered tokens");
        }
        Ok(UserDispatch::Sent(report))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub users_scanned: usize,
    pub users_cleaned: usize,
    pub notifications_deleted: usize,
    pub users_failed: usize,
}

pub struct NotificationCleaner {
    users: Arc<dyn UserDirectory>,
}

impl NotificationCleaner {
    pub fn new(users: Arc<dyn UserDirectory>) -> Self {
        Self { users }
    }

    /// Delete every stored notification whose deal id is not in `valid_ids`, for all users.
    pub async fn cleanup(&self, valid_ids: &BTreeSet<String>) -> Result<CleanupSummary> {
        let users = self
            .users
            .list_users()
            .await
            .context("listing users for notification cleanup")?;

        let outcomes = join_all(
            users
                .iter()
                .map(|user| self.cleanup_user(&user.id, valid_ids)),
        )
        .await;

        let mut summary = CleanupSummary {
            users_scanned: users.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                Ok(0) => {}
                Ok(deleted) => {
                    summary.users_cleaned += 1;
                    summary.notifications_deleted += deleted;
                }
                Err(err) => {
                    error!(user_id = err.user_id(), error = %err, "failed to clean up stale notifications");
                    summary.users_failed += 1;
                }
            }
        }

        info!(
            users = summary.users_scanned,
            deleted = summary.notifications_deleted,
            failed = summary.users_failed,
            "cleaned up stale notifications"
        );
        Ok(summary)
    }

    async fn cleanup_user(
        &self,
        user_id: &str,
        valid_ids: &BTreeSet<String>,
    ) -> Result<usize, PerUserError> {
        let cleanup_err = |source| PerUserError::Cleanup {
            user_id: user_id.to_string(),
            source,
        };
        let stale: Vec<String> = self
            .users
            .notification_ids(user_id)
            .await
            .map_err(cleanup_err)?
            .into_iter()
            .filter(|id| !valid_ids.contains(id))
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        self.users
            .delete_notifications(user_id, &stale)
            .await
            .map_err(cleanup_err)?;
        debug!(user_id, deleted = stale.len(), "removed stale notifications");
        Ok(stale.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Importing,
    Cleaning,
    Matching,
    Dispatching,
    Idle,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: JobState,
    pub current_deals: usize,
    pub new_deals: usize,
    pub matched_users: usize,
    pub cleanup: CleanupSummary,
    pub dispatch: DispatchSummary,
}

impl RunSummary {
    fn start() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            state: JobState::Importing,
            current_deals: 0,
            new_deals: 0,
            matched_users: 0,
            cleanup: CleanupSummary::default(),
            dispatch: DispatchSummary::default(),
        }
    }

    fn enter(&mut self, state: JobState) {
        debug!(from = ?self.state, to = ?state, "job state transition");
        self.state = state;
    }
}

/// One pass through import -> cleanup -> match/dispatch.
pub struct JobRunner {
    sync: DealSyncService,
    cleaner: NotificationCleaner,
    matcher: NotificationMatcher,
    dispatcher: NotificationDispatcher,
    users: Arc<dyn UserDirectory>,
}

impl JobRunner {
    pub fn new(
        feed: Arc<dyn FeedClient>,
        deals: Arc<dyn DealStore>,
        users: Arc<dyn UserDirectory>,
        push: Arc<dyn PushSender>,
    ) -> Self {
        Self {
            sync: DealSyncService::new(feed, deals),
            cleaner: NotificationCleaner::new(users.clone()),
            matcher: NotificationMatcher::new(users.clone()),
            dispatcher: NotificationDispatcher::new(users.clone(), push),
            users,
        }
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::start();
        let span = info_span!("sync_run", run_id = %summary.run_id);

        async {
            info!("sync run started");
            match self.run_stages(&mut summary).await {
                Ok(()) => {
                    summary.enter(JobState::Done);
                    summary.finished_at = Utc::now();
                    info!(
                        new_deals = summary.new_deals,
                        matched_users = summary.matched_users,
                        messages = summary.dispatch.messages_sent,
                        "sync run finished"
                    );
                    Ok(summary)
                }
                Err(err) => {
                    let failed_in = summary.state;
                    summary.enter(JobState::Failed);
                    summary.finished_at = Utc::now();
                    error!(
                        state = ?failed_in,
                        elapsed_ms = (summary.finished_at - summary.started_at).num_milliseconds(),
                        error = ?err,
                        "sync run failed"
                    );
                    Err(err.context(format!(
                        "sync run {} failed while {failed_in:?}",
                        summary.run_id
                    )))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_stages(&self, summary: &mut RunSummary) -> Result<()> {
        let imported = self.sync.import_deals().await?;
        summary.current_deals = imported.all_current_ids.len();
        summary.new_deals = imported.new_deals.len();

        summary.enter(JobState::Cleaning);
        summary.cleanup = self.cleaner.cleanup(&imported.all_current_ids).await?;

        if imported.new_deals.is_empty() {
            summary.enter(JobState::Idle);
            info!("no new deals; nothing to notify");
            return Ok(());
        }

        summary.enter(JobState::Matching);
        let users = self
            .users
            .list_users()
            .await
            .context("listing users for matching")?;
        let matched = self
            .matcher
            .match_deals(&imported.new_deals, &users, Utc::now())
            .await;
        summary.matched_users = matched.len();

        summary.enter(JobState::Dispatching);
        summary.dispatch = self.dispatcher.dispatch(&matched).await;
        Ok(())
    }
}

/// Wire the Postgres store, GamerPower feed and HTTP push gateway from config.
pub async fn build_runner(config: &SyncConfig) -> Result<JobRunner> {
    let store = Arc::new(
        PgStore::connect(&config.database_url)
            .await
            .context("connecting to deal store")?
            .with_max_batch_query_size(config.max_batch_query_size),
    );
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;

    let feed = Arc::new(GamerPowerFeed::new(http.clone(), config.feed_url.clone()));
    let push = Arc::new(HttpPushGateway::new(
        http,
        config.push_endpoint.clone(),
        config.push_server_key.clone(),
    ));

    Ok(JobRunner::new(feed, store.clone(), store, push))
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let config = SyncConfig::from_env()?;
    let runner = build_runner(&config).await?;
    runner.run_once().await
}

/// Clears the in-flight flag when dropped, including while unwinding from a panicking run.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Returns false when the tick was skipped because another run holds `in_flight`.
async fn run_unless_in_flight(runner: &JobRunner, in_flight: &AtomicBool) -> bool {
    if in_flight.swap(true, Ordering::SeqCst) {
        warn!("previous sync run still in flight; skipping tick");
        return false;
    }
    let _guard = InFlightGuard(in_flight);
    if let Err(err) = runner.run_once().await {
        error!(error = ?err, "scheduled sync run failed");
    }
    true
}

/// Scheduler that runs `runner` on `cron`, skipping a tick while a run is in flight.
///
/// The caller starts and shuts down the returned scheduler.
pub async fn build_scheduler(runner: Arc<JobRunner>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let in_flight = Arc::new(AtomicBool::new(false));

    let job = Job::new_async(cron, move |_uuid, _l| {
        let runner = runner.clone();
        let in_flight = in_flight.clone();
        Box::pin(async move {
            run_unless_in_flight(&runner, &in_flight).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
