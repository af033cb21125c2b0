// Inbound envelope processing: raw relay events in, canonical messages out.
//
// Decrypt misses are a normal, high-volume occurrence here: relays deliver
// plenty of events that merely matched our pubkey-tag filters but were never
// addressed to this identity. Those are skipped at debug level. An author
// mismatch between the seal and the rumor is different: that is tampering and
// is logged at warn with no partial result surfaced.

use nostr_sdk::prelude::*;

use crate::chat::{DeliveryState, Direction, DmMessage, MessageTag, Scheme};

#[derive(Debug)]
pub enum UnwrapOutcome {
    Message(DmMessage),
    Ignored(IgnoreReason),
    /// The seal's signing key did not match the author embedded in the
    /// rumor. The event is discarded wholesale.
    Tampered { wrapper_id: EventId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Not decryptable with this identity's key. Expected at high volume.
    DecryptFailed,
    /// Legacy envelope authored by us without any recipient tag.
    NoRecipient,
    /// Legacy envelope with more than one recipient tag; the scheme has no
    /// multi-recipient semantics, so the peer cannot be resolved safely.
    AmbiguousRecipients,
    /// An event kind (or inner rumor kind) this engine does not process.
    UnsupportedKind,
}

/// Turn a raw relay event into a canonical message, or decide it cannot be
/// processed. Never panics and never returns an error: every failure mode is
/// an explicit outcome.
pub async fn unwrap_event(keys: &Keys, event: &Event) -> UnwrapOutcome {
    match event.kind {
        Kind::EncryptedDirectMessage => unwrap_legacy(keys, event),
        Kind::GiftWrap => unwrap_gift_wrap(keys, event).await,
        _ => UnwrapOutcome::Ignored(IgnoreReason::UnsupportedKind),
    }
}

/// Legacy single-layer envelope (kind 4). The wire author is the sender,
/// unless it is us: then the actual peer is the recipient tag, of which
/// exactly one must be present.
fn unwrap_legacy(keys: &Keys, event: &Event) -> UnwrapOutcome {
    let me = keys.public_key();

    let (peer, direction) = if event.pubkey == me {
        let recipients: Vec<PublicKey> = event.tags.public_keys().copied().collect();
        match recipients.as_slice() {
            [only] => (*only, Direction::Outgoing),
            [] => {
                tracing::debug!(event_id = %event.id.to_hex(), "legacy dm without recipient tag");
                return UnwrapOutcome::Ignored(IgnoreReason::NoRecipient);
            }
            _ => {
                tracing::debug!(
                    event_id = %event.id.to_hex(),
                    count = recipients.len(),
                    "legacy dm with multiple recipient tags"
                );
                return UnwrapOutcome::Ignored(IgnoreReason::AmbiguousRecipients);
            }
        }
    } else {
        (event.pubkey, Direction::Incoming)
    };

    let content = match nip04::decrypt(keys.secret_key(), &peer, &event.content) {
        Ok(plaintext) => plaintext,
        Err(e) => {
            tracing::debug!(event_id = %event.id.to_hex(), %e, "legacy dm decrypt miss");
            return UnwrapOutcome::Ignored(IgnoreReason::DecryptFailed);
        }
    };

    let tags = parse_tags(&event.tags);
    let reply_to = reply_reference(&tags);
    UnwrapOutcome::Message(DmMessage {
        id: event.id.to_hex(),
        peer,
        timestamp: event.created_at.as_secs() as i64,
        content,
        direction,
        tags,
        scheme: Scheme::Legacy,
        reply_to,
        delivery: DeliveryState::Sent,
        read: direction == Direction::Outgoing,
    })
}

/// Gift-wrapped envelope (kind 1059): outer wrap decrypt, seal decrypt, then
/// the seal author must equal the author the rumor declares.
async fn unwrap_gift_wrap(keys: &Keys, event: &Event) -> UnwrapOutcome {
    let unwrapped = match UnwrappedGift::from_gift_wrap(keys, event).await {
        Ok(u) => u,
        Err(e) => {
            tracing::debug!(wrapper_id = %event.id.to_hex(), %e, "gift wrap decrypt miss");
            return UnwrapOutcome::Ignored(IgnoreReason::DecryptFailed);
        }
    };
    let UnwrappedGift { sender, mut rumor } = unwrapped;

    if rumor.pubkey != sender {
        tracing::warn!(
            wrapper_id = %event.id.to_hex(),
            seal_author = %sender.to_hex(),
            rumor_author = %rumor.pubkey.to_hex(),
            "seal/rumor author mismatch, discarding event"
        );
        return UnwrapOutcome::Tampered {
            wrapper_id: event.id,
        };
    }

    if rumor.kind != Kind::PrivateDirectMessage {
        tracing::debug!(
            wrapper_id = %event.id.to_hex(),
            rumor_kind = rumor.kind.as_u16(),
            "gift wrap ignored (not a direct message rumor)"
        );
        return UnwrapOutcome::Ignored(IgnoreReason::UnsupportedKind);
    }

    rumor.ensure_id();

    let me = keys.public_key();
    let tags = parse_tags(&rumor.tags);
    let (peer, direction) = if rumor.pubkey == me {
        // Self-copy of an outgoing message: file it under the recipient.
        let recipient = tags.iter().find_map(|t| match t {
            MessageTag::Recipient(pk) => Some(*pk),
            _ => None,
        });
        match recipient {
            Some(pk) => (pk, Direction::Outgoing),
            None => {
                tracing::debug!(wrapper_id = %event.id.to_hex(), "self-authored rumor without recipient tag");
                return UnwrapOutcome::Ignored(IgnoreReason::NoRecipient);
            }
        }
    } else {
        (rumor.pubkey, Direction::Incoming)
    };

    let reply_to = reply_reference(&tags);
    UnwrapOutcome::Message(DmMessage {
        id: rumor.id().to_hex(),
        // The rumor's own timestamp; only the outer layers are randomized.
        timestamp: rumor.created_at.as_secs() as i64,
        content: rumor.content,
        peer,
        direction,
        tags,
        scheme: Scheme::GiftWrap,
        reply_to,
        delivery: DeliveryState::Sent,
        read: direction == Direction::Outgoing,
    })
}

/// Parse the raw tag list once into the variants the engine understands.
pub fn parse_tags(tags: &Tags) -> Vec<MessageTag> {
    tags.iter()
        .map(|tag| {
            if let Some(standardized) = tag.as_standardized() {
                match standardized {
                    TagStandard::PublicKey { public_key, .. } => {
                        return MessageTag::Recipient(*public_key)
                    }
                    TagStandard::Event { event_id, .. } => return MessageTag::Reply(*event_id),
                    TagStandard::Relay(url) => return MessageTag::RelayHint(url.clone()),
                    _ => {}
                }
            }
            MessageTag::Unknown(tag.as_slice().to_vec())
        })
        .collect()
}

/// NIP-10 style: the last event reference wins as the reply parent.
fn reply_reference(tags: &[MessageTag]) -> Option<String> {
    tags.iter().rev().find_map(|t| match t {
        MessageTag::Reply(id) => Some(id.to_hex()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_event(sender: &Keys, recipient: &PublicKey, plaintext: &str) -> Event {
        let content = nip04::encrypt(sender.secret_key(), recipient, plaintext).unwrap();
        EventBuilder::new(Kind::EncryptedDirectMessage, content)
            .tags([Tag::public_key(*recipient)])
            .sign_with_keys(sender)
            .unwrap()
    }

    #[tokio::test]
    async fn legacy_incoming_decrypts_to_message() {
        let me = Keys::generate();
        let peer = Keys::generate();

        let event = legacy_event(&peer, &me.public_key(), "hello");
        match unwrap_event(&me, &event).await {
            UnwrapOutcome::Message(msg) => {
                assert_eq!(msg.content, "hello");
                assert_eq!(msg.peer, peer.public_key());
                assert_eq!(msg.direction, Direction::Incoming);
                assert_eq!(msg.scheme, Scheme::Legacy);
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn legacy_self_authored_recovers_recipient() {
        let me = Keys::generate();
        let peer = Keys::generate();

        let event = legacy_event(&me, &peer.public_key(), "sent by me");
        match unwrap_event(&me, &event).await {
            UnwrapOutcome::Message(msg) => {
                assert_eq!(msg.peer, peer.public_key());
                assert_eq!(msg.direction, Direction::Outgoing);
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn legacy_without_recipient_tag_is_rejected() {
        let me = Keys::generate();
        let peer = Keys::generate();

        let content = nip04::encrypt(me.secret_key(), &peer.public_key(), "x").unwrap();
        let event = EventBuilder::new(Kind::EncryptedDirectMessage, content)
            .sign_with_keys(&me)
            .unwrap();

        match unwrap_event(&me, &event).await {
            UnwrapOutcome::Ignored(IgnoreReason::NoRecipient) => {}
            other => panic!("expected NoRecipient, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn legacy_with_multiple_recipient_tags_is_rejected() {
        let me = Keys::generate();
        let peer = Keys::generate();
        let third = Keys::generate();

        let content = nip04::encrypt(me.secret_key(), &peer.public_key(), "x").unwrap();
        let event = EventBuilder::new(Kind::EncryptedDirectMessage, content)
            .tags([
                Tag::public_key(peer.public_key()),
                Tag::public_key(third.public_key()),
            ])
            .sign_with_keys(&me)
            .unwrap();

        match unwrap_event(&me, &event).await {
            UnwrapOutcome::Ignored(IgnoreReason::AmbiguousRecipients) => {}
            other => panic!("expected AmbiguousRecipients, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn foreign_legacy_event_is_a_benign_miss() {
        let me = Keys::generate();
        let alice = Keys::generate();
        let bob = Keys::generate();

        // Alice -> Bob; our filters can still surface it.
        let event = legacy_event(&alice, &bob.public_key(), "not for us");
        match unwrap_event(&me, &event).await {
            UnwrapOutcome::Ignored(IgnoreReason::DecryptFailed) => {}
            other => panic!("expected DecryptFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn gift_wrap_roundtrip() {
        let me = Keys::generate();
        let peer = Keys::generate();

        let rumor = EventBuilder::new(Kind::PrivateDirectMessage, "wrapped hello")
            .tags([Tag::public_key(me.public_key())])
            .build(peer.public_key());
        let wrap = EventBuilder::gift_wrap(&peer, &me.public_key(), rumor, [])
            .await
            .unwrap();

        match unwrap_event(&me, &wrap).await {
            UnwrapOutcome::Message(msg) => {
                assert_eq!(msg.content, "wrapped hello");
                assert_eq!(msg.peer, peer.public_key());
                assert_eq!(msg.direction, Direction::Incoming);
                assert_eq!(msg.scheme, Scheme::GiftWrap);
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn seal_rumor_author_mismatch_is_tampering() {
        let me = Keys::generate();
        let claimed_author = Keys::generate();
        let actual_sealer = Keys::generate();

        // Rumor claims one author, the seal is signed by another.
        let rumor = EventBuilder::new(Kind::PrivateDirectMessage, "spoofed")
            .tags([Tag::public_key(me.public_key())])
            .build(claimed_author.public_key());
        let seal: Event = EventBuilder::seal(&actual_sealer, &me.public_key(), rumor)
            .await
            .unwrap()
            .sign_with_keys(&actual_sealer)
            .unwrap();

        let ephemeral = Keys::generate();
        let content = nip44::encrypt(
            ephemeral.secret_key(),
            &me.public_key(),
            seal.as_json(),
            Default::default(),
        )
        .unwrap();
        let wrap = EventBuilder::new(Kind::GiftWrap, content)
            .tags([Tag::public_key(me.public_key())])
            .custom_created_at(Timestamp::tweaked(nip59::RANGE_RANDOM_TIMESTAMP_TWEAK))
            .sign_with_keys(&ephemeral)
            .unwrap();

        match unwrap_event(&me, &wrap).await {
            UnwrapOutcome::Tampered { wrapper_id } => assert_eq!(wrapper_id, wrap.id),
            other => panic!("expected Tampered, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_dm_rumor_is_ignored() {
        let me = Keys::generate();
        let peer = Keys::generate();

        let rumor = EventBuilder::text_note("public note").build(peer.public_key());
        let wrap = EventBuilder::gift_wrap(&peer, &me.public_key(), rumor, [])
            .await
            .unwrap();

        match unwrap_event(&me, &wrap).await {
            UnwrapOutcome::Ignored(IgnoreReason::UnsupportedKind) => {}
            other => panic!("expected UnsupportedKind, got {other:?}"),
        }
    }
}
