//! Canonical change events and their JSON form
//!
//! A [`ChangeEvent`] owns every string it carries — metadata, field names,
//! field values — so it outlives the decoder scratch it was built from.
//!
//! Serialisation is deterministic: top-level keys are emitted in the order
//! `op`, `data`, `meta`; an UPDATE's data emits `new` before `old`; row
//! fields keep the registry's column order. The guarantees come from struct
//! field order and the ordered [`Row`] map serialiser, not from any sorting.

use crate::errors::ReplicationResult;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

/// The kind of row change an event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Op {
    Insert,
    Update,
    Delete,
}

impl Op {
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Insert => "INSERT",
            Op::Update => "UPDATE",
            Op::Delete => "DELETE",
        }
    }
}

/// A typed scalar carried through the pipeline
///
/// pgoutput delivers every value as text; conversion promotes booleans and
/// integers to native JSON scalars and leaves everything else as the exact
/// text the server sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl FieldValue {
    /// Render for use as a partition key; NULL yields no key.
    pub fn as_key(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Bool(value) => Some(value.to_string()),
            FieldValue::Int(value) => Some(value.to_string()),
            FieldValue::Text(value) => Some(value.clone()),
        }
    }
}

/// An ordered list of (field name, value) pairs, serialised as a JSON object
/// in insertion order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(pub Vec<(String, FieldValue)>);

impl Row {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// The payload section of an event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DataSection {
    /// The inserted row
    Insert(Row),
    /// New image first, then whatever old image replica identity provided
    Update { new: Row, old: Row },
    /// The deleted row
    Delete(Row),
}

/// Event provenance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metadata {
    pub source: String,
    /// Table name
    pub resource: String,
    /// Namespace the table lives in
    pub schema: String,
    /// Wall-clock seconds at conversion time
    pub timestamp: i64,
    /// Text-form LSN when known; serialised as JSON null otherwise
    pub lsn: Option<String>,
}

/// One committed row change, ready for routing and serialisation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub op: Op,
    pub data: DataSection,
    pub meta: Metadata,
}

impl ChangeEvent {
    /// The row used for partition-key lookups: the new image for inserts and
    /// updates, the old image for deletes.
    pub fn key_row(&self) -> &Row {
        match &self.data {
            DataSection::Insert(row) => row,
            DataSection::Update { new, .. } => new,
            DataSection::Delete(row) => row,
        }
    }

    /// Serialise to the wire payload: one UTF-8 byte sequence, no trailing
    /// newline.
    pub fn to_json(&self) -> ReplicationResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(lsn: Option<&str>) -> Metadata {
        Metadata {
            source: "postgres".to_string(),
            resource: "users".to_string(),
            schema: "public".to_string(),
            timestamp: 1730000000,
            lsn: lsn.map(String::from),
        }
    }

    fn row(fields: &[(&str, FieldValue)]) -> Row {
        Row(fields
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect())
    }

    #[test]
    fn insert_serialises_with_fixed_key_order() {
        let event = ChangeEvent {
            op: Op::Insert,
            data: DataSection::Insert(row(&[
                ("id", FieldValue::Int(1)),
                ("name", FieldValue::Text("Alice".to_string())),
                ("active", FieldValue::Bool(true)),
            ])),
            meta: meta(None),
        };

        let json = String::from_utf8(event.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            "{\"op\":\"INSERT\",\
             \"data\":{\"id\":1,\"name\":\"Alice\",\"active\":true},\
             \"meta\":{\"source\":\"postgres\",\"resource\":\"users\",\
             \"schema\":\"public\",\"timestamp\":1730000000,\"lsn\":null}}"
        );
    }

    #[test]
    fn update_emits_new_before_old() {
        let event = ChangeEvent {
            op: Op::Update,
            data: DataSection::Update {
                new: row(&[("value", FieldValue::Int(200))]),
                old: row(&[("value", FieldValue::Int(100))]),
            },
            meta: meta(None),
        };

        let json = String::from_utf8(event.to_json().unwrap()).unwrap();
        assert!(json.starts_with("{\"op\":\"UPDATE\",\"data\":{\"new\":{\"value\":200},\"old\":{\"value\":100}}"));
    }

    #[test]
    fn delete_carries_the_old_row_flat() {
        let event = ChangeEvent {
            op: Op::Delete,
            data: DataSection::Delete(row(&[("id", FieldValue::Int(7))])),
            meta: meta(Some("16/B374D848")),
        };

        let json = String::from_utf8(event.to_json().unwrap()).unwrap();
        assert!(json.starts_with("{\"op\":\"DELETE\",\"data\":{\"id\":7}"));
        assert!(json.ends_with("\"lsn\":\"16/B374D848\"}}"));
    }

    #[test]
    fn null_fields_serialise_as_json_null() {
        let event = ChangeEvent {
            op: Op::Insert,
            data: DataSection::Insert(row(&[("note", FieldValue::Null)])),
            meta: meta(None),
        };

        let json = String::from_utf8(event.to_json().unwrap()).unwrap();
        assert!(json.contains("\"note\":null"));
    }

    #[test]
    fn row_field_order_is_preserved_not_sorted() {
        let row = row(&[
            ("zebra", FieldValue::Int(1)),
            ("apple", FieldValue::Int(2)),
        ]);
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, "{\"zebra\":1,\"apple\":2}");
    }

    #[test]
    fn key_rendering() {
        assert_eq!(FieldValue::Int(42).as_key().as_deref(), Some("42"));
        assert_eq!(FieldValue::Bool(true).as_key().as_deref(), Some("true"));
        assert_eq!(
            FieldValue::Text("a".to_string()).as_key().as_deref(),
            Some("a")
        );
        assert_eq!(FieldValue::Null.as_key(), None);
    }

    #[test]
    fn key_row_picks_the_image_consumers_key_on() {
        let new = row(&[("id", FieldValue::Int(2))]);
        let old = row(&[("id", FieldValue::Int(1))]);
        let event = ChangeEvent {
            op: Op::Update,
            data: DataSection::Update {
                new: new.clone(),
                old,
            },
            meta: meta(None),
        };
        assert_eq!(event.key_row(), &new);
    }
}
