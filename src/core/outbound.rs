// Outbound message construction: rumor, seal, gift wrap, and the
// self-addressed copy that makes the sender's own view converge without the
// recipient's key.

use super::*;
use crate::chat::{Direction, MessageTag, Scheme};
use crate::state::now_seconds;

impl AppCore {
    pub(super) fn send_direct_message(&mut self, peer_input: &str, content: String) {
        if !self.is_logged_in() {
            self.toast("Please log in first");
            return;
        }
        let Some(peer) = self.parse_peer(peer_input) else {
            return;
        };
        let content = content.trim().to_string();
        if content.is_empty() {
            return;
        }

        let keys = {
            let Some(sess) = self.session.as_ref() else {
                return;
            };
            sess.keys.clone()
        };
        let me = keys.public_key();
        if peer == me {
            self.toast("Cannot message yourself");
            return;
        }

        // Timestamps are second-granularity; keep rapid sends monotonic so
        // ordering inside one second stays stable.
        let ts = {
            let now = now_seconds();
            if now <= self.last_outgoing_ts {
                self.last_outgoing_ts += 1;
            } else {
                self.last_outgoing_ts = now;
            }
            self.last_outgoing_ts
        };

        // The unsigned inner message; its id is fixed before any wrapping so
        // the optimistic insert and both envelopes agree on it.
        let mut rumor = UnsignedEvent::new(
            me,
            Timestamp::from(ts as u64),
            Kind::PrivateDirectMessage,
            [Tag::public_key(peer)],
            content.clone(),
        );
        rumor.ensure_id();
        let message_id = rumor.id().to_hex();

        let message = DmMessage {
            id: message_id.clone(),
            peer,
            timestamp: ts,
            content,
            direction: Direction::Outgoing,
            tags: vec![MessageTag::Recipient(peer)],
            scheme: Scheme::GiftWrap,
            reply_to: None,
            delivery: DeliveryState::Pending,
            read: true,
        };
        self.merge_messages(vec![message]);

        let transport = self.transport.clone();
        let tx = self.core_sender.clone();
        let base_relays = self.relay_union();
        let timeout = self.query_timeout();

        self.runtime.spawn(async move {
            // Wrap once per destination: the peer's copy and our own. Each
            // outer envelope gets a fresh one-time key and a randomized
            // timestamp; only the shared rumor id ties them together.
            let wrap_peer = EventBuilder::gift_wrap(&keys, &peer, rumor.clone(), []).await;
            let wrap_self = EventBuilder::gift_wrap(&keys, &me, rumor, []).await;
            let (wrap_peer, wrap_self) = match (wrap_peer, wrap_self) {
                (Ok(p), Ok(s)) => (p, s),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!(%e, "gift wrap failed");
                    let _ = tx.send(CoreMsg::Internal(Box::new(
                        InternalEvent::PublishMessageResult {
                            peer,
                            message_id,
                            ok: false,
                            error: Some("encrypt failed".into()),
                            wraps: None,
                        },
                    )));
                    return;
                }
            };

            // Deliver to the peer's published DM relays when available, in
            // addition to our own set.
            let peer_dm =
                session::fetch_dm_relays(transport.as_ref(), peer, &base_relays, timeout).await;
            let mut relays = base_relays;
            for url in peer_dm {
                if !relays.contains(&url) {
                    relays.push(url);
                }
            }

            let result = publish_wraps(transport.as_ref(), &relays, &wrap_peer, &wrap_self).await;
            let (ok, error) = match result {
                Ok(()) => (true, None),
                Err(e) => (false, Some(e)),
            };
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::PublishMessageResult {
                    peer,
                    message_id,
                    ok,
                    error,
                    wraps: Some((wrap_peer, wrap_self)),
                },
            )));
        });
    }

    pub(super) fn retry_message(&mut self, peer_input: &str, message_id: &str) {
        if !self.is_logged_in() {
            self.toast("Please log in first");
            return;
        }
        let Some(peer) = self.parse_peer(peer_input) else {
            return;
        };
        let Some(pending) = self.pending_sends.get(message_id).cloned() else {
            self.toast("Nothing to retry");
            return;
        };
        if pending.peer != peer {
            self.toast("Nothing to retry");
            return;
        }

        if let Some(chats) = self.chats.as_mut() {
            chats.set_delivery(&peer, message_id, DeliveryState::Pending);
        }
        self.refresh_current_chat();
        self.emit_state();

        let transport = self.transport.clone();
        let tx = self.core_sender.clone();
        let relays = self.relay_union();
        let message_id = message_id.to_string();

        self.runtime.spawn(async move {
            let result = publish_wraps(
                transport.as_ref(),
                &relays,
                &pending.wrap_peer,
                &pending.wrap_self,
            )
            .await;
            let (ok, error) = match result {
                Ok(()) => (true, None),
                Err(e) => (false, Some(e)),
            };
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::PublishMessageResult {
                    peer,
                    message_id,
                    ok,
                    error,
                    wraps: Some((pending.wrap_peer, pending.wrap_self)),
                },
            )));
        });
    }
}

/// The peer copy must land for the send to count as delivered; the self-copy
/// is best effort (our own store already has the message).
async fn publish_wraps(
    transport: &dyn RelayTransport,
    relays: &[RelayUrl],
    wrap_peer: &Event,
    wrap_self: &Event,
) -> Result<(), String> {
    transport
        .publish(relays, wrap_peer)
        .await
        .map_err(|e| e.to_string())?;
    if let Err(e) = transport.publish(relays, wrap_self).await {
        tracing::warn!(%e, "self-copy publish failed");
    }
    Ok(())
}
