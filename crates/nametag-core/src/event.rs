//! Protocol events and their canonical encoding
//!
//! An event id is the SHA-256 of the minified JSON array
//! `[0, pubkey, created_at, kind, tags, content]`. The same id is the message
//! signed with BIP-340, so any change to those six fields invalidates both.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{NametagError, Result};
use crate::keys::Keys;
use crate::schnorr;

// ----------------------------------------------------------------------------
// Kinds
// ----------------------------------------------------------------------------

/// Event kind numbers and their retention class on a relay
pub mod kind {
    /// Kind used to carry an opaque payload to a `p`-tagged recipient
    pub const MESSAGE: u16 = 31113;
    /// Parameterized replaceable kind used for name bindings
    pub const NAME_BINDING: u16 = 30078;

    /// Only the newest event per `(pubkey, kind)` is kept
    pub fn is_replaceable(kind: u16) -> bool {
        kind == 0 || kind == 3 || (10_000..20_000).contains(&kind)
    }

    /// Relays forward but never store these
    pub fn is_ephemeral(kind: u16) -> bool {
        (20_000..30_000).contains(&kind)
    }

    /// Only the newest event per `(pubkey, kind, d-tag)` is kept
    pub fn is_parameterized_replaceable(kind: u16) -> bool {
        (30_000..40_000).contains(&kind)
    }
}

// ----------------------------------------------------------------------------
// Tags
// ----------------------------------------------------------------------------

/// One tag: a non-empty ordered list of strings, the first being its name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(Vec<String>);

impl Tag {
    pub fn custom<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parts = vec![name.into()];
        parts.extend(values.into_iter().map(Into::into));
        Self(parts)
    }

    /// Build from raw parts, rejecting an empty list
    pub fn parse(parts: Vec<String>) -> Result<Self> {
        if parts.is_empty() {
            return Err(NametagError::invalid_input("tag must not be empty"));
        }
        Ok(Self(parts))
    }

    /// `["d", identifier]`
    pub fn identifier(identifier: impl Into<String>) -> Self {
        Self::custom("d", [identifier.into()])
    }

    /// `["p", pubkey]`
    pub fn public_key(public_key_hex: impl Into<String>) -> Self {
        Self::custom("p", [public_key_hex.into()])
    }

    /// `["t", topic]`
    pub fn hashtag(topic: impl Into<String>) -> Self {
        Self::custom("t", [topic.into()])
    }

    pub fn name(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or_default()
    }

    /// First value after the name
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    pub fn values(&self) -> &[String] {
        self.0.get(1..).unwrap_or_default()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Canonical Encoding
// ----------------------------------------------------------------------------

/// Minified canonical form `[0,pubkey,created_at,kind,tags,content]`
pub fn canonical_json(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Tag],
    content: &str,
) -> Result<String> {
    Ok(serde_json::to_string(&(
        0u8, pubkey, created_at, kind, tags, content,
    ))?)
}

/// Content-addressed event id as lowercase hex
pub fn compute_id(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Tag],
    content: &str,
) -> Result<String> {
    let canonical = canonical_json(pubkey, created_at, kind, tags, content)?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

/// Compute the id, sign it and assemble the event
pub fn build_and_sign(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: Vec<Tag>,
    content: impl Into<String>,
    private_key: &[u8],
) -> Result<Event> {
    let content = content.into();
    let id = compute_id(pubkey, created_at, kind, &tags, &content)?;
    let id_bytes = hex::decode(&id).map_err(|e| NametagError::Signing(e.to_string()))?;
    let sig = schnorr::sign(&id_bytes, private_key)?;
    Ok(Event {
        id,
        pubkey: pubkey.to_string(),
        created_at,
        kind,
        tags,
        content,
        sig: hex::encode(sig),
    })
}

/// Current time as Unix seconds
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ----------------------------------------------------------------------------
// Event
// ----------------------------------------------------------------------------

/// Signed, content-addressed protocol event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: String,
}

impl Event {
    pub fn from_json(json: &str) -> Result<Self> {
        let event: Event = serde_json::from_str(json)?;
        if event.tags.iter().any(|t| t.as_slice().is_empty()) {
            return Err(NametagError::protocol("event carries an empty tag"));
        }
        Ok(event)
    }

    pub fn as_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Recompute the id from the other fields
    pub fn compute_id(&self) -> Result<String> {
        compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Check that the id matches the content and the signature matches the id
    pub fn verify(&self) -> Result<()> {
        let expected = self.compute_id()?;
        if !expected.eq_ignore_ascii_case(&self.id) {
            return Err(NametagError::invalid_input(format!(
                "event id {} does not match content (expected {})",
                self.id, expected
            )));
        }
        let id = hex::decode(&self.id).map_err(|e| NametagError::invalid_input(e.to_string()))?;
        let sig = hex::decode(&self.sig).map_err(|e| NametagError::invalid_input(e.to_string()))?;
        let pubkey =
            hex::decode(&self.pubkey).map_err(|e| NametagError::invalid_input(e.to_string()))?;
        if schnorr::verify(&id, &sig, &pubkey) {
            Ok(())
        } else {
            Err(NametagError::Signing(format!(
                "signature does not verify for event {}",
                self.id
            )))
        }
    }

    /// First value of the first tag named `name`
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.name() == name)
            .and_then(Tag::value)
    }

    /// The `d` tag value, empty when absent
    pub fn identifier(&self) -> &str {
        self.tag_value("d").unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Event Builder
// ----------------------------------------------------------------------------

/// Incremental construction of a signed event
#[derive(Debug, Clone)]
pub struct EventBuilder {
    kind: u16,
    content: String,
    tags: Vec<Tag>,
    created_at: Option<u64>,
}

impl EventBuilder {
    pub fn new(kind: u16, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            tags: Vec::new(),
            created_at: None,
        }
    }

    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Pin the timestamp instead of using the current time
    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn sign(self, keys: &Keys) -> Result<Event> {
        let created_at = self.created_at.unwrap_or_else(unix_now);
        build_and_sign(
            &keys.public_key_hex(),
            created_at,
            self.kind,
            self.tags,
            self.content,
            &keys.secret_bytes(),
        )
    }
}
