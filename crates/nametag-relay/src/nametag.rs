//! Name binding operations over a relay client
//!
//! Lookups return `Ok(None)` when the relay reports no match. Timeouts and
//! connection loss are errors, so callers can tell "unbound" from "unknown".

use nametag_core::{
    build_binding_event, key_by_name_filter, name_by_key_filter, parse_name, NameBinding, Result,
};
use tracing::{debug, info};

use crate::client::{PublishReceipt, RelayClient};

impl RelayClient {
    /// Bind `name` to this client's key, replacing any earlier binding
    pub async fn publish_name_binding(&self, name: &str, address: &str) -> Result<PublishReceipt> {
        let event = build_binding_event(self.keys(), name, address)?;
        info!(name = %name.trim(), event_id = %event.id, "Publishing name binding");
        self.publish_receipt(event).await
    }

    /// Public key of the most recent claim on `name`
    pub async fn query_key_by_name(&self, name: &str) -> Result<Option<String>> {
        let found = self.query_first(key_by_name_filter(name)?).await?;
        debug!(name = %name, found = found.is_some(), "Name lookup finished");
        Ok(found.map(|event| event.pubkey))
    }

    /// Name currently bound to `pubkey`
    pub async fn query_name_by_key(&self, pubkey: &str) -> Result<Option<String>> {
        let found = self.query_first(name_by_key_filter(pubkey)?).await?;
        Ok(found.as_ref().and_then(parse_name))
    }

    /// Full binding (name and address) currently held by `pubkey`
    pub async fn query_binding_by_key(&self, pubkey: &str) -> Result<Option<NameBinding>> {
        let found = self.query_first(name_by_key_filter(pubkey)?).await?;
        Ok(found.as_ref().and_then(NameBinding::from_event))
    }
}
