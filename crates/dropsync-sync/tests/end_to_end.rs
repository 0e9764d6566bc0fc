use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use dropsync_core::{Deal, User};
use dropsync_feed::{FeedClient, FeedFetchError};
use dropsync_push::{MulticastReport, PushError, PushMessage, PushSender};
use dropsync_storage::MemoryStore;
use dropsync_sync::{JobRunner, JobState};
use tokio::sync::Mutex;

struct FixedFeed(Vec<Deal>);

#[async_trait]
impl FeedClient for FixedFeed {
    fn source_id(&self) -> &'static str {
        "fixed"
    }

    async fn fetch(&self) -> Result<Vec<Deal>, FeedFetchError> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
struct CapturingPush(Mutex<Vec<PushMessage>>);

#[async_trait]
impl PushSender for CapturingPush {
    async fn send_multicast(&self, message: &PushMessage) -> Result<MulticastReport, PushError> {
        self.0.lock().await.push(message.clone());
        Ok(MulticastReport {
            success_count: message.tokens.len(),
            ..Default::default()
        })
    }
}

#[tokio::test]
async fn new_pc_deal_reaches_the_pc_user_once() {
    let store = Arc::new(MemoryStore::new().with_users([User {
        id: "u1".into(),
        notifications_enabled: true,
        preferred_game_platforms: vec!["pc".into()],
        notification_tokens: vec!["tok1".into()],
    }]));
    let push = Arc::new(CapturingPush::default());
    let feed = Arc::new(FixedFeed(vec![
        Deal::new("1", "Free PC game", "pc,steam"),
        Deal::new("2", "Free Xbox game", "xbox"),
    ]));
    let runner = JobRunner::new(feed, store.clone(), store.clone(), push.clone());

    let summary = runner.run_once().await.unwrap();

    assert_eq!(summary.state, JobState::Done);
    assert_eq!(summary.new_deals, 2);
    assert_eq!(summary.matched_users, 1);

    let sent = push.0.lock().await.clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].tokens, vec!["tok1"]);
    let delivered: Vec<String> = sent[0].deals().unwrap().into_iter().map(|d| d.id).collect();
    assert_eq!(delivered, vec!["1"]);

    let stored: BTreeSet<String> = store.notifications_for("u1").await.into_keys().collect();
    assert_eq!(stored, BTreeSet::from(["1".to_string()]));
    assert_eq!(store.deal_bodies().await.len(), 2);
}

#[tokio::test]
async fn rerun_with_unchanged_feed_sends_nothing_new() {
    let store = Arc::new(MemoryStore::new().with_users([User {
        id: "u1".into(),
        notifications_enabled: true,
        preferred_game_platforms: vec!["steam".into()],
        notification_tokens: vec!["tok1".into()],
    }]));
    let push = Arc::new(CapturingPush::default());
    let feed = Arc::new(FixedFeed(vec![Deal::new("9", "Steam key", "PC, Steam")]));
    let runner = JobRunner::new(feed, store.clone(), store.clone(), push.clone());

    runner.run_once().await.unwrap();
    let second = runner.run_once().await.unwrap();

    assert_eq!(second.new_deals, 0);
    assert_eq!(second.cleanup.notifications_deleted, 0);
    assert_eq!(push.0.lock().await.len(), 1);
    assert_eq!(store.notifications_for("u1").await.len(), 1);
}
