//! Subscription filters
//!
//! Serialized as a JSON object where single-letter tag filters use `#<letter>`
//! keys. Within one field values are OR'd; across fields conditions are AND'd.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::event::Event;

/// Query description sent in `REQ` frames
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<BTreeSet<String>>,
    pub authors: Option<BTreeSet<String>>,
    pub kinds: Option<BTreeSet<u16>>,
    pub tags: BTreeMap<char, BTreeSet<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.ids.get_or_insert_with(BTreeSet::new).insert(id.into());
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.authors
            .get_or_insert_with(BTreeSet::new)
            .insert(author.into());
        self
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.get_or_insert_with(BTreeSet::new).insert(kind);
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds.get_or_insert_with(BTreeSet::new).extend(kinds);
        self
    }

    /// Match events carrying a `letter` tag with one of `values`
    pub fn custom_tag<I, S>(mut self, letter: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(letter)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// NIP-01 match semantics; `limit` only bounds stored results and is ignored here
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        self.tags.iter().all(|(letter, values)| {
            let mut buf = [0u8; 4];
            let name: &str = letter.encode_utf8(&mut buf);
            event.tags.iter().any(|tag| {
                tag.name() == name && tag.value().is_some_and(|v| values.contains(v))
            })
        })
    }
}

// ----------------------------------------------------------------------------
// Serde
// ----------------------------------------------------------------------------

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(ids) = &self.ids {
            map.serialize_entry("ids", ids)?;
        }
        if let Some(authors) = &self.authors {
            map.serialize_entry("authors", authors)?;
        }
        if let Some(kinds) = &self.kinds {
            map.serialize_entry("kinds", kinds)?;
        }
        for (letter, values) in &self.tags {
            map.serialize_entry(&format!("#{letter}"), values)?;
        }
        if let Some(since) = self.since {
            map.serialize_entry("since", &since)?;
        }
        if let Some(until) = self.until {
            map.serialize_entry("until", &until)?;
        }
        if let Some(limit) = self.limit {
            map.serialize_entry("limit", &limit)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(FilterVisitor)
    }
}

struct FilterVisitor;

impl<'de> Visitor<'de> for FilterVisitor {
    type Value = Filter;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a filter object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Filter, A::Error> {
        let mut filter = Filter::default();
        while let Some(key) = access.next_key::<String>()? {
            match key.as_str() {
                "ids" => filter.ids = Some(access.next_value()?),
                "authors" => filter.authors = Some(access.next_value()?),
                "kinds" => filter.kinds = Some(access.next_value()?),
                "since" => filter.since = Some(access.next_value()?),
                "until" => filter.until = Some(access.next_value()?),
                "limit" => filter.limit = Some(access.next_value()?),
                other => {
                    let mut chars = other.chars();
                    match (chars.next(), chars.next(), chars.next()) {
                        (Some('#'), Some(letter), None) if letter.is_ascii_alphabetic() => {
                            filter.tags.insert(letter, access.next_value()?);
                        }
                        _ => {
                            return Err(de::Error::unknown_field(
                                other,
                                &["ids", "authors", "kinds", "#<letter>", "since", "until", "limit"],
                            ))
                        }
                    }
                }
            }
        }
        Ok(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBuilder, Tag};
    use crate::keys::Keys;

    #[test]
    fn test_serialize_name_lookup_filter() {
        let filter = Filter::new()
            .kind(30078)
            .custom_tag('t', ["alice"])
            .limit(1);
        assert_eq!(
            serde_json::to_string(&filter).unwrap(),
            r##"{"kinds":[30078],"#t":["alice"],"limit":1}"##
        );
    }

    #[test]
    fn test_empty_filter_serializes_to_empty_object() {
        assert_eq!(serde_json::to_string(&Filter::new()).unwrap(), "{}");
    }

    #[test]
    fn test_deserialize_with_tag_keys() {
        let filter: Filter = serde_json::from_str(
            r##"{"kinds":[30078],"authors":["ab"],"#d":["unicity-nametag"],"limit":1}"##,
        )
        .unwrap();
        assert_eq!(
            filter,
            Filter::new()
                .kind(30078)
                .author("ab")
                .custom_tag('d', ["unicity-nametag"])
                .limit(1)
        );
    }

    #[test]
    fn test_deserialize_rejects_unknown_keys() {
        assert!(serde_json::from_str::<Filter>(r#"{"search":"x"}"#).is_err());
        assert!(serde_json::from_str::<Filter>(r##"{"#tt":["x"]}"##).is_err());
    }

    #[test]
    fn test_matches() {
        let keys = Keys::generate();
        let event = EventBuilder::new(30078, "")
            .tags([Tag::identifier("unicity-nametag"), Tag::hashtag("alice")])
            .created_at(100)
            .sign(&keys)
            .unwrap();

        assert!(Filter::new().matches(&event));
        assert!(Filter::new().kind(30078).custom_tag('t', ["alice", "bob"]).matches(&event));
        assert!(!Filter::new().custom_tag('t', ["bob"]).matches(&event));
        assert!(!Filter::new().kind(1).matches(&event));
        assert!(Filter::new().author(keys.public_key_hex()).matches(&event));
        assert!(!Filter::new().author("00".repeat(32)).matches(&event));
        assert!(Filter::new().since(100).until(100).matches(&event));
        assert!(!Filter::new().since(101).matches(&event));
        assert!(!Filter::new().until(99).matches(&event));
        assert!(Filter::new().id(event.id.clone()).matches(&event));
        assert!(!Filter::new().custom_tag('p', ["x"]).matches(&event));
    }
}
