//! Event model.

use serde::{Deserialize, Serialize};

use crate::kinds;

/// Signed, immutable protocol event.
///
/// ```json
/// {
///   "id": "4376c65d...",
///   "pubkey": "6e468422...",
///   "created_at": 1700000000,
///   "kind": 9,
///   "tags": [["h", "room"]],
///   "content": "hello",
///   "sig": "908a15e4..."
/// }
/// ```
///
/// The `verified` marker is process-local and never serialized. It is only
/// set for events read back from local durable storage, so their signatures
/// need not be checked again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Hex digest of the serialized event
    pub id: String,
    /// Author public key (hex)
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u32,
    /// Ordered tag sequences, e.g. `["e", "<id>"]`
    pub tags: Vec<Vec<String>>,
    /// Event payload
    pub content: String,
    /// Signature over `id`
    pub sig: String,
    #[serde(skip)]
    verified: bool,
}

impl Event {
    /// Create an event with empty tags, content and signature
    pub fn new(
        id: impl Into<String>,
        pubkey: impl Into<String>,
        kind: u32,
        created_at: u64,
    ) -> Self {
        Self {
            id: id.into(),
            pubkey: pubkey.into(),
            created_at,
            kind,
            tags: Vec::new(),
            content: String::new(),
            sig: String::new(),
            verified: false,
        }
    }

    /// Set the tags
    pub fn with_tags(mut self, tags: Vec<Vec<String>>) -> Self {
        self.tags = tags;
        self
    }

    /// Append a single tag
    pub fn with_tag<S: Into<String>>(mut self, tag: impl IntoIterator<Item = S>) -> Self {
        self.tags.push(tag.into_iter().map(Into::into).collect());
        self
    }

    /// Set the content
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Set the signature
    pub fn with_sig(mut self, sig: impl Into<String>) -> Self {
        self.sig = sig.into();
        self
    }

    /// Mark this event as already verified.
    ///
    /// Only events read from local durable storage may be marked; events
    /// received from the network must go through signature verification.
    pub fn into_trusted(mut self) -> Self {
        self.verified = true;
        self
    }

    /// Whether signature verification can be skipped for this event
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Whether `id` is a 32-byte hex digest
    pub fn has_valid_id(&self) -> bool {
        self.id.len() == 64 && hex::decode(&self.id).is_ok()
    }

    /// First value of the first tag named `name`
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// Address of a replaceable event (`kind:pubkey:d`), if it has one
    pub fn address(&self) -> Option<String> {
        if kinds::is_parameterized_replaceable(self.kind) {
            let d = self.tag_value("d").unwrap_or_default();
            Some(format!("{}:{}:{}", self.kind, self.pubkey, d))
        } else if kinds::is_replaceable(self.kind) {
            Some(format!("{}:{}:", self.kind, self.pubkey))
        } else {
            None
        }
    }
}

// The verification marker is not part of an event's identity.
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.pubkey == other.pubkey
            && self.created_at == other.created_at
            && self.kind == other.kind
            && self.tags == other.tags
            && self.content == other.content
            && self.sig == other.sig
    }
}

impl Eq for Event {}
