//! Name bindings and recipient messages
//!
//! A name binding is a parameterized replaceable event of kind
//! [`kind::NAME_BINDING`] with a constant `d` tag, so each key holds at most
//! one live binding. Republishing with a newer timestamp rebinds the name.
//!
//! Name to key lookups go through the `t` tag and may match several authors;
//! the relay answers with the most recent claim. Key to name lookups go
//! through authorship plus the `d` tag.

use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use crate::errors::{NametagError, Result};
use crate::event::{kind, unix_now, Event, EventBuilder, Tag};
use crate::filter::Filter;
use crate::keys::{parse_public_key, Keys};

/// Constant `d` tag shared by every name binding
pub const NAME_BINDING_IDENTIFIER: &str = "unicity-nametag";

const TAG_NAMETAG: &str = "nametag";
const TAG_ADDRESS: &str = "address";

// ----------------------------------------------------------------------------
// Name Binding
// ----------------------------------------------------------------------------

/// `(name, pubkey, address, issued_at)` reconstructed from a binding event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameBinding {
    pub name: String,
    pub pubkey: String,
    pub address: String,
    pub issued_at: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct BindingContent {
    #[serde(default, alias = "nametag")]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(rename = "issuedAt", default)]
    issued_at: Option<u64>,
}

impl NameBinding {
    /// Parse a binding event; `None` if the event is not a name binding
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.kind != kind::NAME_BINDING || event.identifier() != NAME_BINDING_IDENTIFIER {
            return None;
        }
        let content = serde_json::from_str::<BindingContent>(&event.content).ok();
        Some(Self {
            name: parse_name(event)?,
            pubkey: event.pubkey.clone(),
            address: parse_address(event).unwrap_or_default(),
            issued_at: content
                .and_then(|c| c.issued_at)
                .unwrap_or(event.created_at),
        })
    }
}

fn normalize_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(NametagError::invalid_input("name must not be empty"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(NametagError::invalid_input(format!(
            "name {name:?} must not contain whitespace"
        )));
    }
    Ok(name)
}

/// Build and sign a binding stamped with the current time
pub fn build_binding_event(keys: &Keys, name: &str, address: &str) -> Result<Event> {
    build_binding_event_at(keys, name, address, unix_now())
}

/// Build and sign a binding with an explicit timestamp
///
/// Identical inputs yield an identical event id.
pub fn build_binding_event_at(
    keys: &Keys,
    name: &str,
    address: &str,
    created_at: u64,
) -> Result<Event> {
    let name = normalize_name(name)?;
    let address = address.trim();
    if address.is_empty() {
        return Err(NametagError::invalid_input("address must not be empty"));
    }

    let content = serde_json::to_string(&BindingContent {
        name: Some(name.to_string()),
        address: Some(address.to_string()),
        issued_at: Some(created_at),
    })?;

    EventBuilder::new(kind::NAME_BINDING, content)
        .tags([
            Tag::identifier(NAME_BINDING_IDENTIFIER),
            Tag::custom(TAG_NAMETAG, [name]),
            Tag::hashtag(name),
            Tag::custom(TAG_ADDRESS, [address]),
        ])
        .created_at(created_at)
        .sign(keys)
}

/// Name from the `nametag` tag, falling back to the content JSON
pub fn parse_name(event: &Event) -> Option<String> {
    if let Some(name) = event.tag_value(TAG_NAMETAG) {
        return Some(name.to_string());
    }
    trace!(event_id = %event.id, "No nametag tag, reading name from content");
    serde_json::from_str::<BindingContent>(&event.content)
        .ok()
        .and_then(|c| c.name)
}

/// Address from the `address` tag, falling back to the content JSON
pub fn parse_address(event: &Event) -> Option<String> {
    if let Some(address) = event.tag_value(TAG_ADDRESS) {
        return Some(address.to_string());
    }
    serde_json::from_str::<BindingContent>(&event.content)
        .ok()
        .and_then(|c| c.address)
}

/// `{kinds:[30078], "#t":[name], limit:1}`
pub fn key_by_name_filter(name: &str) -> Result<Filter> {
    let name = normalize_name(name)?;
    Ok(Filter::new()
        .kind(kind::NAME_BINDING)
        .custom_tag('t', [name])
        .limit(1))
}

/// `{kinds:[30078], authors:[pubkey], "#d":[identifier], limit:1}`
pub fn name_by_key_filter(pubkey: &str) -> Result<Filter> {
    parse_public_key(pubkey)?;
    Ok(Filter::new()
        .kind(kind::NAME_BINDING)
        .author(pubkey.to_lowercase())
        .custom_tag('d', [NAME_BINDING_IDENTIFIER])
        .limit(1))
}

// ----------------------------------------------------------------------------
// Recipient Messages
// ----------------------------------------------------------------------------

/// Wrap already-encrypted content into a message event for `recipient`
///
/// The message kind sits in the parameterized replaceable range, so every
/// message gets its own random `d` tag to keep relays from collapsing them.
pub fn build_message_event(keys: &Keys, recipient: &str, ciphertext: String) -> Result<Event> {
    parse_public_key(recipient)?;
    EventBuilder::new(kind::MESSAGE, ciphertext)
        .tags([
            Tag::public_key(recipient.to_lowercase()),
            Tag::identifier(Uuid::new_v4().simple().to_string()),
        ])
        .sign(keys)
}

/// Messages addressed to `recipient`, optionally only newer than `since`
pub fn inbox_filter(recipient: &str, since: Option<u64>) -> Filter {
    let filter = Filter::new()
        .kind(kind::MESSAGE)
        .custom_tag('p', [recipient.to_lowercase()]);
    match since {
        Some(since) => filter.since(since),
        None => filter,
    }
}
