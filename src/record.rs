//! The self-describing event-record encoding: fixed keys
//! `{id, in, entity}` plus an event's custom tags, shared with the index
//! registry and metadata counters' own encoding via `bincode` + `serde`
//! (spec §9's "a single portable binary encoder/decoder library").

use serde::{Deserialize, Serialize};
use tagbase_core::{EventId, Literal};

use crate::error::EncodingError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TagValue {
    Str(String),
    Int(i64),
}

impl From<Literal> for TagValue {
    fn from(value: Literal) -> Self {
        match value {
            Literal::String(s) => TagValue::Str(s),
            Literal::Integer(i) => TagValue::Int(i),
        }
    }
}

impl TagValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::Str(s) => Some(s),
            TagValue::Int(_) => None,
        }
    }

    /// The canonical text form used to build inverted-index tag strings
    /// (`key:value`) and routing keys.
    pub fn canonical(&self) -> String {
        match self {
            TagValue::Str(s) => s.clone(),
            TagValue::Int(i) => i.to_string(),
        }
    }
}

/// An immutable, id-assigned event body (spec §3's "Event record").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub id: u32,
    pub r#in: String,
    pub entity: String,
    pub tags: Vec<(String, TagValue)>,
}

impl EventRecord {
    pub fn new(id: EventId, container: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            id: id.0,
            r#in: container.into(),
            entity: entity.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<(String, Literal)>) -> Self {
        self.tags = tags.into_iter().map(|(k, v)| (k, v.into())).collect();
        self
    }

    pub fn tag(&self, key: &str) -> Option<&TagValue> {
        self.tags.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodingError> {
        bincode::serialize(self).map_err(|e| EncodingError::Serialize(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EncodingError> {
        bincode::deserialize(bytes).map_err(|e| EncodingError::Deserialize(e.to_string()))
    }
}

/// The canonical `key:value` tag string used as the inverted-index key
/// and, composed with the container and db kind, the routing key (spec
/// §4.6 step 5).
pub fn canonical_tag_string(key: &str, value: &TagValue) -> String {
    format!("{key}:{}", value.canonical())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bincode() {
        let rec = EventRecord::new(EventId(1), "metrics", "u-1")
            .with_tags(vec![("loc".into(), Literal::String("ca".into()))]);
        let bytes = rec.encode().unwrap();
        let back = EventRecord::decode(&bytes).unwrap();
        assert_eq!(rec, back);
    }

    #[test]
    fn canonical_tag_string_formats_int_values() {
        assert_eq!(canonical_tag_string("ts", &TagValue::Int(42)), "ts:42");
        assert_eq!(canonical_tag_string("loc", &TagValue::Str("ca".into())), "loc:ca");
    }
}
