//! Nostr capability boundary: metadata/relay-list lookups, the `CyberHerd`
//! tag check, nprofile encoding, and publishing signed replies. Built on
//! `nostr`/`nostr-sdk` rather than shelling out to a command-line signer —
//! both crates expose exactly these primitives natively.

use crate::error::{HerdError, HerdResult};
use nostr::nips::nip19::Nip19Profile;
use nostr::{Event, EventBuilder, EventId, JsonUtil, Keys, Kind, PublicKey, Tag, TagKind, ToBech32};
use nostr_sdk::{Client, Filter};
use std::time::Duration;

const CYBERHERD_TAG_VALUE: &str = "CyberHerd";
const METADATA_FETCH_TIMEOUT: Duration = Duration::from_secs(8);
const RELAY_LIST_FETCH_TIMEOUT: Duration = Duration::from_secs(8);
const NOTE_SEARCH_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Clone, Debug, Default)]
pub struct ProfileMetadata {
    pub display_name: Option<String>,
    pub lud16: Option<String>,
    pub nip05: Option<String>,
    pub picture: Option<String>,
}

pub struct NostrAdapter {
    client: Client,
    keys: Keys,
}

impl NostrAdapter {
    /// Builds a signed client and connects to `relays`. `secret_hex` is the
    /// service identity's own secret key, used to publish replies.
    pub async fn connect(secret_hex: &str, relays: &[String]) -> HerdResult<Self> {
        let keys = Keys::parse(secret_hex).map_err(|e| HerdError::protocol(format!("invalid nostr secret key: {e}")))?;
        let client = Client::builder().signer(keys.clone()).build();
        for relay in relays {
            client
                .add_relay(relay.as_str())
                .await
                .map_err(|e| HerdError::transient(format!("failed to add relay {relay}: {e}")))?;
        }
        client.connect().await;
        Ok(NostrAdapter { client, keys })
    }

    pub fn self_pubkey(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// Looks up kind-0 metadata for `pubkey`.
    pub async fn lookup_metadata(&self, pubkey: &PublicKey) -> HerdResult<ProfileMetadata> {
        let filter = Filter::new().author(*pubkey).kind(Kind::Metadata).limit(1);
        let events = self
            .client
            .fetch_events(filter, METADATA_FETCH_TIMEOUT)
            .await
            .map_err(|e| HerdError::transient(format!("metadata fetch failed: {e}")))?;

        let Some(event) = events.into_iter().next() else {
            return Ok(ProfileMetadata::default());
        };
        let content: serde_json::Value = serde_json::from_str(&event.content)
            .map_err(|e| HerdError::protocol(format!("malformed kind-0 content: {e}")))?;
        Ok(ProfileMetadata {
            display_name: content.get("display_name").or_else(|| content.get("name")).and_then(|v| v.as_str()).map(str::to_string),
            lud16: content.get("lud16").and_then(|v| v.as_str()).map(|v| v.to_lowercase()),
            nip05: content.get("nip05").and_then(|v| v.as_str()).map(str::to_string),
            picture: content.get("picture").and_then(|v| v.as_str()).map(str::to_string),
        })
    }

    /// Looks up kind-10002 relay-list entries, keeping only `ws`/`wss` urls.
    pub async fn lookup_relay_list(&self, pubkey: &PublicKey) -> HerdResult<Vec<String>> {
        let filter = Filter::new().author(*pubkey).kind(Kind::RelayList).limit(1);
        let events = self
            .client
            .fetch_events(filter, RELAY_LIST_FETCH_TIMEOUT)
            .await
            .map_err(|e| HerdError::transient(format!("relay list fetch failed: {e}")))?;

        let Some(event) = events.into_iter().next() else {
            return Ok(Vec::new());
        };
        let relays = event
            .tags
            .iter()
            .filter(|t| t.kind() == TagKind::r())
            .filter_map(|t| t.content())
            .filter(|url| url.starts_with("ws://") || url.starts_with("wss://"))
            .map(str::to_string)
            .collect();
        Ok(relays)
    }

    /// True if `event_id` carries a `t` tag whose value matches `CyberHerd`
    /// case-insensitively.
    pub async fn has_cyberherd_tag(&self, event_id: &EventId) -> HerdResult<bool> {
        let filter = Filter::new().id(*event_id).limit(1);
        let events = self
            .client
            .fetch_events(filter, NOTE_SEARCH_TIMEOUT)
            .await
            .map_err(|e| HerdError::transient(format!("event fetch failed: {e}")))?;
        let Some(event) = events.into_iter().next() else {
            return Ok(false);
        };
        Ok(event_has_cyberherd_tag(&event))
    }

    /// Finds up to `limit` self-authored kind-1 notes since `since_epoch`
    /// that carry the `CyberHerd` tag.
    pub async fn find_herd_tagged_notes(&self, since_epoch: i64, limit: usize) -> HerdResult<Vec<EventId>> {
        let filter = Filter::new()
            .author(self.keys.public_key())
            .kind(Kind::TextNote)
            .since(nostr::Timestamp::from(since_epoch as u64))
            .limit(limit);
        let events = self
            .client
            .fetch_events(filter, NOTE_SEARCH_TIMEOUT)
            .await
            .map_err(|e| HerdError::transient(format!("note search failed: {e}")))?;
        Ok(events
            .into_iter()
            .filter(|e| event_has_cyberherd_tag(e))
            .map(|e| e.id)
            .collect())
    }

    /// Finds kind-9735 zap receipts referencing `note_id`, up to `limit`.
    pub async fn find_zap_receipts_for_note(&self, note_id: &EventId, limit: usize) -> HerdResult<Vec<Event>> {
        let filter = Filter::new().event(*note_id).kind(Kind::ZapReceipt).limit(limit);
        let events = self
            .client
            .fetch_events(filter, NOTE_SEARCH_TIMEOUT)
            .await
            .map_err(|e| HerdError::transient(format!("zap receipt search failed: {e}")))?;
        Ok(events.into_iter().collect())
    }

    /// Publishes a signed kind-1 reply to `reply_to`, tagged `CyberHerd`.
    pub async fn publish_reply(&self, reply_to: &EventId, content: &str) -> HerdResult<EventId> {
        let builder = EventBuilder::text_note(content)
            .tag(Tag::event(*reply_to))
            .tag(Tag::hashtag(CYBERHERD_TAG_VALUE));
        let output = self
            .client
            .send_event_builder(builder)
            .await
            .map_err(|e| HerdError::transient(format!("failed to publish reply: {e}")))?;
        Ok(output.val)
    }
}

/// Bech32 nprofile for `pubkey` with the given relay hints.
pub fn encode_nprofile(pubkey: &PublicKey, relays: &[String]) -> HerdResult<String> {
    let profile = Nip19Profile::new(*pubkey, relays.to_vec());
    profile
        .to_bech32()
        .map_err(|e| HerdError::protocol(format!("failed to encode nprofile: {e}")))
}

fn event_has_cyberherd_tag(event: &Event) -> bool {
    event.tags.iter().any(|t| {
        t.kind() == TagKind::t()
            && t.content()
                .map(|v| v.eq_ignore_ascii_case(CYBERHERD_TAG_VALUE))
                .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys};

    #[test]
    fn detects_cyberherd_tag_case_insensitively() {
        let keys = Keys::generate();
        let event = EventBuilder::text_note("hi")
            .tag(Tag::hashtag("cyberherd"))
            .sign_with_keys(&keys)
            .unwrap();
        assert!(event_has_cyberherd_tag(&event));
    }

    #[test]
    fn missing_tag_is_not_a_match() {
        let keys = Keys::generate();
        let event = EventBuilder::text_note("hi").sign_with_keys(&keys).unwrap();
        assert!(!event_has_cyberherd_tag(&event));
    }

    #[test]
    fn nprofile_encodes_without_error() {
        let keys = Keys::generate();
        let encoded = encode_nprofile(&keys.public_key(), &["wss://relay.damus.io/".to_string()]).unwrap();
        assert!(encoded.starts_with("nprofile1"));
    }
}
