//! Signed event model.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Simple tag wrapper preserving tag fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

/// Core signed event persisted by the store and served to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `40001`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// First value of the named tag, if present.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find_map(|Tag(fields)| match fields.as_slice() {
                [t, val, ..] if t == name => Some(val.as_str()),
                _ => None,
            })
    }

    /// Value of the `d` tag, or the empty string when absent.
    pub fn d_tag(&self) -> &str {
        self.tag_value("d").unwrap_or("")
    }
}

/// Recompute the event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_helpers() {
        let ev = Event {
            id: String::new(),
            pubkey: String::new(),
            kind: 30000,
            created_at: 1,
            tags: vec![
                Tag(vec!["d".into(), "doc1".into()]),
                Tag(vec!["k".into(), "40001".into()]),
                Tag(vec!["d".into(), "shadowed".into()]),
            ],
            content: String::new(),
            sig: String::new(),
        };
        assert_eq!(ev.d_tag(), "doc1");
        assert_eq!(ev.tag_value("k"), Some("40001"));
        assert_eq!(ev.tag_value("t"), None);
    }

    #[test]
    fn d_tag_defaults_to_empty() {
        let ev = Event {
            id: String::new(),
            pubkey: String::new(),
            kind: 30000,
            created_at: 1,
            tags: vec![Tag(vec!["solo".into()])],
            content: String::new(),
            sig: String::new(),
        };
        assert_eq!(ev.d_tag(), "");
    }

    #[test]
    fn event_hash_matches_reference() {
        let ev = Event {
            id: String::new(),
            pubkey: "00".repeat(32),
            kind: 1,
            created_at: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        let expected = {
            let obj =
                serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
            let mut hasher = Sha256::new();
            hasher.update(serde_json::to_vec(&obj).unwrap());
            let bytes = hasher.finalize();
            let mut arr = [0u8; 32];
            arr.copy_from_slice(&bytes);
            arr
        };
        assert_eq!(event_hash(&ev).unwrap(), expected);
    }

    #[test]
    fn event_hash_preserves_tag_order() {
        let mut ev = Event {
            id: String::new(),
            pubkey: "00".repeat(32),
            kind: 1,
            created_at: 1,
            tags: vec![
                Tag(vec!["t".into(), "b".into()]),
                Tag(vec!["t".into(), "a".into()]),
            ],
            content: String::new(),
            sig: String::new(),
        };
        let forward = event_hash(&ev).unwrap();
        ev.tags.reverse();
        assert_ne!(forward, event_hash(&ev).unwrap());
    }

    #[test]
    fn serde_round_trip_keeps_fields() {
        let ev = Event {
            id: "ab".repeat(32),
            pubkey: "cd".repeat(32),
            kind: 40001,
            created_at: 1700000000,
            tags: vec![
                Tag(vec!["i".into(), "2-beef".into()]),
                Tag(vec!["v".into(), "1-dead".into()]),
            ],
            content: "{\"doc\":true}".into(),
            sig: "ef".repeat(64),
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }
}
