//! Nametag Core
//!
//! Runtime-free building blocks for the nametag relay client: BIP-340 Schnorr
//! signing, canonical event encoding, subscription filters, relay wire frames
//! and the name-binding event format.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod binding;
pub mod errors;
pub mod event;
pub mod filter;
pub mod keys;
pub mod message;
pub mod schnorr;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use binding::{
    build_binding_event, build_binding_event_at, build_message_event, inbox_filter,
    key_by_name_filter, name_by_key_filter, parse_address, parse_name, NameBinding,
    NAME_BINDING_IDENTIFIER,
};
pub use errors::{NametagError, Result, TransportError};
pub use event::{build_and_sign, compute_id, kind, unix_now, Event, EventBuilder, Tag};
pub use filter::Filter;
pub use keys::{parse_public_key, Keys};
pub use message::{ClientMessage, RelayMessage};
