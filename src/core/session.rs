// Session lifecycle: login/logout transitions, relay-list resolution and the
// live subscription.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::time::Duration;

use super::*;
use crate::state::now_seconds;
use crate::unwrap::{unwrap_event, UnwrapOutcome};

// Relay pools can redeliver the same event id (reconnects, multi-relay
// fanout). Bounded cache so the live loop doesn't reprocess them.
const SEEN_CAP: usize = 2048;

// Startup race: the transport may not be initialized yet when a session
// starts. Retry a few times, then proceed anyway.
const TRANSPORT_READY_ATTEMPTS: u32 = 3;
const TRANSPORT_READY_DELAY: Duration = Duration::from_millis(500);

impl AppCore {
    pub(super) fn start_session(&mut self, keys: Keys) {
        // Tear down any existing session first.
        self.stop_session();

        let pubkey = keys.public_key();
        let pubkey_hex = pubkey.to_hex();
        let npub = pubkey.to_bech32().unwrap_or(pubkey_hex.clone());

        tracing::info!(pubkey = %pubkey_hex, "start_session");

        // Replay durable storage before touching the network; the earliest
        // stored timestamp seeds the pagination watermark.
        let mut chats = ChatStore::new(pubkey);
        let records = match self.storage.load_messages(&pubkey) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(%e, "durable replay failed, starting empty");
                vec![]
            }
        };
        let hidden = self.storage.hidden_messages(&pubkey).unwrap_or_else(|e| {
            tracing::warn!(%e, "hidden set load failed");
            vec![]
        });
        self.oldest_seen = chats.restore(records, &hidden);
        self.chats = Some(chats);

        self.session_token = self.session_token.wrapping_add(1);
        self.session = Some(Session {
            keys,
            alive: Arc::new(AtomicBool::new(true)),
            live_subs: vec![],
            dm_relays: vec![],
        });

        self.state.auth = AuthState::LoggedIn {
            npub,
            pubkey: pubkey_hex,
        };
        self.handle_auth_transition(true);
        self.refresh_chat_list();
        self.emit_state();

        self.resolve_session_relays();
    }

    pub(super) fn stop_session(&mut self) {
        // Invalidate every in-flight async result for the old session.
        self.session_token = self.session_token.wrapping_add(1);
        self.sync_token = self.sync_token.wrapping_add(1);
        self.page_token = self.page_token.wrapping_add(1);
        self.live_token = self.live_token.wrapping_add(1);
        self.sync_in_flight = false;
        self.paginating = false;

        if let Some(sess) = self.session.take() {
            sess.alive.store(false, Ordering::SeqCst);
            for sub in &sess.live_subs {
                sub.close();
            }
            tracing::info!("session stopped");
        }
    }

    /// Fetch the account's published DM relay list (kind 10050), then let the
    /// actor start the live subscription and the initial load.
    fn resolve_session_relays(&mut self) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        let token = self.session_token;
        let me = sess.keys.public_key();
        let alive = sess.alive.clone();
        let transport = self.transport.clone();
        let tx = self.core_sender.clone();
        let timeout = self.query_timeout();

        let mut lookup_relays = self.default_relays();
        for url in self.discovery_relays() {
            if !lookup_relays.contains(&url) {
                lookup_relays.push(url);
            }
        }

        self.runtime.spawn(async move {
            for attempt in 0..TRANSPORT_READY_ATTEMPTS {
                if transport.ready().await {
                    break;
                }
                tracing::warn!(attempt, "relay transport not ready, retrying");
                tokio::time::sleep(TRANSPORT_READY_DELAY).await;
            }
            if !alive.load(Ordering::SeqCst) {
                return;
            }

            let dm_relays = fetch_dm_relays(transport.as_ref(), me, &lookup_relays, timeout).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::RelayListResolved { token, dm_relays },
            )));
        });
    }

    /// Union of DM-specific, general and discovery relays, deduplicated by
    /// URL. Order is stable so logs stay comparable.
    pub(super) fn relay_union(&self) -> Vec<RelayUrl> {
        let mut relays: Vec<RelayUrl> = self
            .session
            .as_ref()
            .map(|s| s.dm_relays.clone())
            .unwrap_or_default();
        for url in self.default_relays() {
            if !relays.contains(&url) {
                relays.push(url);
            }
        }
        for url in self.discovery_relays() {
            if !relays.contains(&url) {
                relays.push(url);
            }
        }
        relays
    }

    /// Establish the standing subscription for real-time delivery. At most
    /// one is active per session; any previous one is torn down first.
    pub(super) fn start_live_subscription(&mut self) {
        let (keys, alive) = match self.session.as_mut() {
            Some(sess) => {
                for sub in sess.live_subs.drain(..) {
                    sub.close();
                }
                (sess.keys.clone(), sess.alive.clone())
            }
            None => return,
        };

        self.live_token = self.live_token.wrapping_add(1);
        let token = self.live_token;

        let me = keys.public_key();
        let transport = self.transport.clone();
        let tx = self.core_sender.clone();
        let relays = self.relay_union();

        // Same backfill-buffer lower bound as a refresh, so anything sent
        // between app-close and app-open still lands here.
        let checkpoint = self
            .account()
            .and_then(|a| self.storage.checkpoint(&a).ok().flatten())
            .unwrap_or_else(now_seconds);
        let since = (checkpoint - BACKFILL_BUFFER_SECS).max(0) as u64;

        self.runtime.spawn(async move {
            let inbound = Filter::new()
                .kinds([Kind::EncryptedDirectMessage, Kind::GiftWrap])
                .pubkey(me)
                .since(Timestamp::from_secs(since));
            let outbound = Filter::new()
                .kind(Kind::EncryptedDirectMessage)
                .author(me)
                .since(Timestamp::from_secs(since));

            let sub_in = match transport.subscribe(&relays, inbound).await {
                Ok(sub) => sub,
                Err(e) => {
                    tracing::warn!(%e, "live subscription failed");
                    return;
                }
            };
            let sub_out = match transport.subscribe(&relays, outbound).await {
                Ok(sub) => sub,
                Err(e) => {
                    tracing::warn!(%e, "live subscription (outbound leg) failed");
                    sub_in.close();
                    return;
                }
            };

            for closer in [sub_in.closer(), sub_out.closer()] {
                let _ = tx.send(CoreMsg::Internal(Box::new(
                    InternalEvent::LiveSubscriptionReady { token, closer },
                )));
            }

            // Merge both legs into one stream.
            let (merge_tx, merge_rx) = flume::unbounded::<Event>();
            for sub in [sub_in, sub_out] {
                let merge_tx = merge_tx.clone();
                tokio::spawn(async move {
                    while let Ok(event) = sub.events.recv_async().await {
                        if merge_tx.send(event).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(merge_tx);

            let mut seen: HashSet<String> = HashSet::new();
            let mut seen_order: VecDeque<String> = VecDeque::new();

            loop {
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                let event = match tokio::time::timeout(
                    Duration::from_secs(5),
                    merge_rx.recv_async(),
                )
                .await
                {
                    // Periodic liveness check while the stream is quiet.
                    Err(_) => continue,
                    Ok(Err(_)) => break,
                    Ok(Ok(event)) => event,
                };

                let id_hex = event.id.to_hex();
                if seen.contains(&id_hex) {
                    continue;
                }
                seen.insert(id_hex.clone());
                seen_order.push_back(id_hex);
                if seen_order.len() > SEEN_CAP {
                    if let Some(old) = seen_order.pop_front() {
                        seen.remove(&old);
                    }
                }

                match unwrap_event(&keys, &event).await {
                    UnwrapOutcome::Message(message) => {
                        let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::LiveDm {
                            message,
                        })));
                    }
                    // Both already logged at the appropriate level.
                    UnwrapOutcome::Ignored(_) | UnwrapOutcome::Tampered { .. } => {}
                }
            }
            tracing::debug!("live subscription loop ended");
        });
    }
}

/// Latest published DM relay list (kind 10050) for `target`, or empty when
/// nothing is published or the lookup fails.
pub(super) async fn fetch_dm_relays(
    transport: &dyn RelayTransport,
    target: PublicKey,
    via: &[RelayUrl],
    timeout: Duration,
) -> Vec<RelayUrl> {
    let filter = Filter::new()
        .author(target)
        .kind(Kind::InboxRelays)
        .limit(1);
    match transport.query(via, filter, timeout).await {
        Ok(events) => events
            .into_iter()
            .max_by_key(|e| e.created_at)
            .map(|e| extract_relay_tags(&e))
            .unwrap_or_default(),
        Err(e) => {
            tracing::warn!(%e, target = %target.to_hex(), "dm relay list fetch failed");
            vec![]
        }
    }
}

/// Relay URLs from a relay-list document's `relay` tags.
fn extract_relay_tags(event: &Event) -> Vec<RelayUrl> {
    let mut out = Vec::new();
    for t in event.tags.iter() {
        let values = t.as_slice();
        if values.first().map(|s| s.as_str()) != Some("relay") {
            continue;
        }
        if let Some(url) = values.get(1) {
            if let Ok(u) = RelayUrl::parse(url) {
                out.push(u);
            }
        }
    }
    out
}
