// Full load, incremental refresh and backward pagination.
//
// The one ordering guarantee the engine gives: when a load/refresh reports
// completion, every event observed by it has been fully decrypted and
// merged. Each event's unwrap runs as its own task; the batch collects all
// of them and awaits the whole set before reporting, so the checkpoint never
// advances past work still in flight.

use super::*;
use crate::state::now_seconds;
use crate::unwrap::{unwrap_event, UnwrapOutcome};

impl AppCore {
    pub(super) fn start_sync(&mut self, kind: SyncKind) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        // No overlapping syncs.
        if self.sync_in_flight {
            tracing::debug!(?kind, "sync already in progress, skipping");
            return;
        }
        self.sync_in_flight = true;
        self.sync_token = self.sync_token.wrapping_add(1);
        let token = self.sync_token;

        let keys = sess.keys.clone();
        let account = keys.public_key();
        let since = match kind {
            SyncKind::Full => None,
            SyncKind::Refresh => self
                .storage
                .checkpoint(&account)
                .ok()
                .flatten()
                .map(|cp| (cp - BACKFILL_BUFFER_SECS).max(0)),
        };

        self.state.sync.phase = match kind {
            SyncKind::Full => SyncPhase::FullLoad,
            SyncKind::Refresh => SyncPhase::Refreshing,
        };
        self.emit_state();

        tracing::info!(?kind, ?since, "sync starting");

        let transport = self.transport.clone();
        let relays = self.relay_union();
        let timeout = self.query_timeout();
        let tx = self.core_sender.clone();

        self.runtime.spawn(async move {
            let me = keys.public_key();

            // Both directions: everything addressed to us, plus legacy
            // envelopes we authored. (Gift-wrapped outgoing messages arrive
            // through the self-addressed copy and need no second query.)
            let mut inbound = Filter::new()
                .kinds([Kind::EncryptedDirectMessage, Kind::GiftWrap])
                .pubkey(me);
            let mut outbound = Filter::new().kind(Kind::EncryptedDirectMessage).author(me);
            if let Some(since) = since {
                let since = Timestamp::from_secs(since as u64);
                inbound = inbound.since(since);
                outbound = outbound.since(since);
            }

            let mut events: Vec<Event> = Vec::new();
            let mut any_query_ok = false;
            for filter in [inbound, outbound] {
                match transport.query(&relays, filter, timeout).await {
                    Ok(mut batch) => {
                        any_query_ok = true;
                        events.append(&mut batch);
                    }
                    Err(e) => {
                        tracing::warn!(%e, "sync query failed, continuing with the rest");
                    }
                }
            }

            if !any_query_ok {
                let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::SyncFailed {
                    token,
                    kind,
                    error: "all relay queries failed".into(),
                })));
                return;
            }

            let messages = decrypt_all(&keys, events).await;
            // Only now, with every decrypt task settled, may the checkpoint
            // move.
            let checkpoint = now_seconds();
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::SyncFinished {
                token,
                kind,
                messages,
                checkpoint,
            })));
        });
    }

    pub(super) fn start_pagination(&mut self, limit: usize) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        // Busy-flag guard plus a generation token: a stale page that lands
        // after a newer request started is discarded on arrival.
        if self.paginating || self.sync_in_flight {
            tracing::debug!("pagination skipped, sync activity in flight");
            return;
        }
        if !self.state.sync.has_more_chats {
            tracing::debug!("pagination skipped, no more data");
            return;
        }
        self.paginating = true;
        self.page_token = self.page_token.wrapping_add(1);
        let token = self.page_token;
        let keys = sess.keys.clone();

        let page = if limit > 0 { limit } else { self.page_size() };
        let until = self.oldest_seen.unwrap_or_else(now_seconds);

        self.state.sync.phase = SyncPhase::PaginatingOlder;
        self.emit_state();

        tracing::info!(until, page, "pagination starting");

        let transport = self.transport.clone();
        let relays = self.relay_union();
        let timeout = self.query_timeout();
        let tx = self.core_sender.clone();

        self.runtime.spawn(async move {
            let me = keys.public_key();
            let until = Timestamp::from_secs(until.max(0) as u64);

            let inbound = Filter::new()
                .kinds([Kind::EncryptedDirectMessage, Kind::GiftWrap])
                .pubkey(me)
                .until(until)
                .limit(page);
            let outbound = Filter::new()
                .kind(Kind::EncryptedDirectMessage)
                .author(me)
                .until(until)
                .limit(page);

            let mut events: Vec<Event> = Vec::new();
            let mut has_more = false;
            for filter in [inbound, outbound] {
                match transport.query(&relays, filter, timeout).await {
                    Ok(mut batch) => {
                        // A full page means this direction may have more. A
                        // relay enforcing a smaller cap than `page` makes
                        // this report "done" early; documented trade-off.
                        has_more |= batch.len() >= page;
                        events.append(&mut batch);
                    }
                    Err(e) => {
                        tracing::warn!(%e, "pagination query failed, treating as empty page");
                    }
                }
            }

            let messages = decrypt_all(&keys, events).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::OlderPageLoaded {
                    token,
                    messages,
                    has_more,
                },
            )));
        });
    }
}

/// Run one unwrap task per event and await the whole pending set. Per-event
/// failures never abort the batch.
async fn decrypt_all(keys: &Keys, events: Vec<Event>) -> Vec<DmMessage> {
    let mut pending = Vec::with_capacity(events.len());
    for event in events {
        let keys = keys.clone();
        pending.push(tokio::spawn(
            async move { unwrap_event(&keys, &event).await },
        ));
    }

    let mut messages = Vec::new();
    for task in pending {
        match task.await {
            Ok(UnwrapOutcome::Message(message)) => messages.push(message),
            // Misses and tampering are logged inside the unwrapper.
            Ok(UnwrapOutcome::Ignored(_)) | Ok(UnwrapOutcome::Tampered { .. }) => {}
            Err(e) => tracing::warn!(%e, "decrypt task aborted"),
        }
    }
    messages
}
