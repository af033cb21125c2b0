// Shared test infrastructure: a scriptable in-memory relay standing in for
// the network transport.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use veil_core::{
    subscription_pair, RelayError, RelaySubscription, RelayTransport, SubscriptionFeed,
};

pub fn wait_until(what: &str, timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("{what}: condition not met within {timeout:?}");
}

/// In-memory relay: seeded events answer queries, live pushes fan out to
/// matching subscriptions, publishes are recorded and echoed back like a
/// real relay would.
#[derive(Default)]
pub struct FixtureRelay {
    stored: Mutex<Vec<Event>>,
    published: Mutex<Vec<Event>>,
    feeds: Mutex<Vec<(Filter, SubscriptionFeed)>>,
}

impl FixtureRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, event: Event) {
        self.stored.lock().unwrap().push(event);
    }

    pub fn published(&self) -> Vec<Event> {
        self.published.lock().unwrap().clone()
    }

    pub fn live_feed_count(&self) -> usize {
        let mut feeds = self.feeds.lock().unwrap();
        feeds.retain(|(_, feed)| !feed.is_closed());
        feeds.len()
    }

    pub fn push_live(&self, event: Event) {
        let mut feeds = self.feeds.lock().unwrap();
        feeds.retain(|(filter, feed)| {
            if feed.is_closed() {
                return false;
            }
            if filter.match_event(&event, MatchEventOptions::new()) {
                feed.push(event.clone());
            }
            true
        });
    }
}

#[async_trait]
impl RelayTransport for FixtureRelay {
    async fn query(
        &self,
        _relays: &[RelayUrl],
        filter: Filter,
        _timeout: Duration,
    ) -> Result<Vec<Event>, RelayError> {
        let mut matches: Vec<Event> = self
            .stored
            .lock()
            .unwrap()
            .iter()
            .filter(|e| filter.match_event(e, MatchEventOptions::new()))
            .cloned()
            .collect();
        // Relays return the newest `limit` events.
        matches.sort_by_key(|e| std::cmp::Reverse(e.created_at));
        if let Some(limit) = filter.limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    async fn subscribe(
        &self,
        _relays: &[RelayUrl],
        filter: Filter,
    ) -> Result<RelaySubscription, RelayError> {
        let (feed, subscription) = subscription_pair();
        self.feeds.lock().unwrap().push((filter, feed));
        Ok(subscription)
    }

    async fn publish(&self, _relays: &[RelayUrl], event: &Event) -> Result<(), RelayError> {
        self.published.lock().unwrap().push(event.clone());
        self.stored.lock().unwrap().push(event.clone());
        self.push_live(event.clone());
        Ok(())
    }
}

/// Legacy kind-4 envelope with a chosen wire timestamp.
pub fn legacy_dm(sender: &Keys, recipient: &PublicKey, plaintext: &str, created_at: u64) -> Event {
    let content = nip04::encrypt(sender.secret_key(), recipient, plaintext).unwrap();
    EventBuilder::new(Kind::EncryptedDirectMessage, content)
        .tags([Tag::public_key(*recipient)])
        .custom_created_at(Timestamp::from_secs(created_at))
        .sign_with_keys(sender)
        .unwrap()
}

pub fn dm_rumor(sender: &Keys, recipient: &PublicKey, plaintext: &str, ts: u64) -> UnsignedEvent {
    UnsignedEvent::new(
        sender.public_key(),
        Timestamp::from_secs(ts),
        Kind::PrivateDirectMessage,
        [Tag::public_key(*recipient)],
        plaintext.to_string(),
    )
}

/// Standard gift wrap (randomized outer timestamp).
pub fn gift_wrapped_dm(sender: &Keys, recipient: &PublicKey, plaintext: &str, ts: u64) -> Event {
    let rumor = dm_rumor(sender, recipient, plaintext, ts);
    block_on(EventBuilder::gift_wrap(sender, recipient, rumor, [])).unwrap()
}

/// Gift wrap with a fixed outer timestamp, for tests that pin the sender's
/// backdating skew instead of sampling it.
pub fn gift_wrapped_dm_at(
    sender: &Keys,
    recipient: &PublicKey,
    plaintext: &str,
    rumor_ts: u64,
    outer_ts: u64,
) -> Event {
    let rumor = dm_rumor(sender, recipient, plaintext, rumor_ts);
    let seal: Event = block_on(async {
        EventBuilder::seal(sender, recipient, rumor)
            .await
            .unwrap()
            .sign_with_keys(sender)
    })
    .unwrap();

    let ephemeral = Keys::generate();
    let content = nip44::encrypt(
        ephemeral.secret_key(),
        recipient,
        seal.as_json(),
        Default::default(),
    )
    .unwrap();
    EventBuilder::new(Kind::GiftWrap, content)
        .tags([Tag::public_key(*recipient)])
        .custom_created_at(Timestamp::from_secs(outer_ts))
        .sign_with_keys(&ephemeral)
        .unwrap()
}

pub fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(fut)
}
