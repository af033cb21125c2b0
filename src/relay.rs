// Relay transport seam. The engine talks to this trait instead of a concrete
// pool so tests can script stored events and live pushes; the bundled
// production implementation rides on the nostr-sdk client pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no relays available")]
    NoRelays,
    #[error("relay pool error: {0}")]
    Pool(String),
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Bounded one-shot query across the given relay set. Individual relay
    /// failures inside the set are the implementation's problem; an `Err`
    /// here means the whole query produced nothing usable.
    async fn query(
        &self,
        relays: &[RelayUrl],
        filter: Filter,
        timeout: Duration,
    ) -> Result<Vec<Event>, RelayError>;

    /// Standing subscription delivering matching events until closed.
    async fn subscribe(
        &self,
        relays: &[RelayUrl],
        filter: Filter,
    ) -> Result<RelaySubscription, RelayError>;

    async fn publish(&self, relays: &[RelayUrl], event: &Event) -> Result<(), RelayError>;

    /// Whether the transport is usable yet. Session startup retries a few
    /// times on `false` before proceeding anyway.
    async fn ready(&self) -> bool {
        true
    }
}

/// Receiving end of a standing subscription. `close` is idempotent; dropping
/// the subscription closes it as well.
pub struct RelaySubscription {
    pub events: flume::Receiver<Event>,
    closed: Arc<AtomicBool>,
}

impl RelaySubscription {
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Detached close handle, usable after the subscription itself moved
    /// into a receive loop.
    pub fn closer(&self) -> SubscriptionCloser {
        SubscriptionCloser {
            closed: self.closed.clone(),
        }
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Clone)]
pub struct SubscriptionCloser {
    closed: Arc<AtomicBool>,
}

impl SubscriptionCloser {
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Producing end, held by the transport implementation.
pub struct SubscriptionFeed {
    tx: flume::Sender<Event>,
    closed: Arc<AtomicBool>,
}

impl SubscriptionFeed {
    /// Returns false once the subscription is closed or the receiver is
    /// gone; the feeder should stop then.
    pub fn push(&self, event: Event) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_disconnected()
    }
}

pub fn subscription_pair() -> (SubscriptionFeed, RelaySubscription) {
    let (tx, rx) = flume::unbounded();
    let closed = Arc::new(AtomicBool::new(false));
    (
        SubscriptionFeed {
            tx,
            closed: closed.clone(),
        },
        RelaySubscription { events: rx, closed },
    )
}

/// Production transport over the nostr-sdk relay pool. Relays are added to
/// the pool lazily per call; the pool dedups by URL internally.
pub struct NostrRelayPool {
    client: Client,
}

impl NostrRelayPool {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn ensure_relays(&self, relays: &[RelayUrl]) -> Result<(), RelayError> {
        if relays.is_empty() {
            return Err(RelayError::NoRelays);
        }
        for url in relays {
            let _ = self.client.add_relay(url.clone()).await;
        }
        self.client.connect().await;
        Ok(())
    }
}

#[async_trait]
impl RelayTransport for NostrRelayPool {
    async fn query(
        &self,
        relays: &[RelayUrl],
        filter: Filter,
        timeout: Duration,
    ) -> Result<Vec<Event>, RelayError> {
        self.ensure_relays(relays).await?;
        self.client
            .wait_for_connection(Duration::from_secs(4))
            .await;
        match self
            .client
            .fetch_events_from(relays.to_vec(), filter, timeout)
            .await
        {
            Ok(events) => Ok(events.into_iter().collect()),
            Err(e) => Err(RelayError::Pool(e.to_string())),
        }
    }

    async fn subscribe(
        &self,
        relays: &[RelayUrl],
        filter: Filter,
    ) -> Result<RelaySubscription, RelayError> {
        self.ensure_relays(relays).await?;
        let output = self
            .client
            .subscribe_to(relays.to_vec(), filter, None)
            .await
            .map_err(|e| RelayError::Pool(e.to_string()))?;
        let sub_id = output.val;

        let (feed, subscription) = subscription_pair();
        let mut notifications = self.client.notifications();
        let client = self.client.clone();
        tokio::spawn(async move {
            loop {
                if feed.is_closed() {
                    break;
                }
                match notifications.recv().await {
                    Ok(RelayPoolNotification::Event {
                        subscription_id,
                        event,
                        ..
                    }) if subscription_id == sub_id => {
                        if !feed.push((*event).clone()) {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            let _ = client.unsubscribe(&sub_id).await;
        });

        Ok(subscription)
    }

    async fn publish(&self, relays: &[RelayUrl], event: &Event) -> Result<(), RelayError> {
        self.ensure_relays(relays).await?;
        self.client
            .wait_for_connection(Duration::from_secs(4))
            .await;
        let output = self
            .client
            .send_event_to(relays.to_vec(), event)
            .await
            .map_err(|e| RelayError::Pool(e.to_string()))?;
        if output.success.is_empty() {
            let err = output
                .failed
                .values()
                .next()
                .cloned()
                .unwrap_or_else(|| "no relay accepted event".into());
            return Err(RelayError::Pool(err));
        }
        Ok(())
    }

    async fn ready(&self) -> bool {
        !self.client.relays().await.is_empty()
    }
}
