//! Relation schema registry
//!
//! Maps relation ids to the latest schema the server announced. The server
//! guarantees a `Relation` message precedes the first row change that
//! references it in a session, so a miss here is a fatal protocol error for
//! the caller. Entries are never evicted; a stale entry for a dropped table
//! is harmless because no further changes will reference it.

use crate::pgoutput::{Oid, RelationInfo};
use std::collections::HashMap;

/// In-memory relation id → schema map, rebuilt on every session
///
/// Accessed only by the receive thread.
#[derive(Debug, Default)]
pub struct RelationRegistry {
    relations: HashMap<Oid, RelationInfo>,
}

impl RelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store schema metadata, replacing any previous entry for the id.
    ///
    /// `ALTER TABLE` makes the server re-announce the relation with the same
    /// id and a new column list; the whole entry is swapped so no mixed
    /// schema can ever be observed.
    pub fn register(&mut self, info: RelationInfo) {
        self.relations.insert(info.relation_id, info);
    }

    pub fn get(&self, relation_id: Oid) -> Option<&RelationInfo> {
        self.relations.get(&relation_id)
    }

    pub fn contains(&self, relation_id: Oid) -> bool {
        self.relations.contains_key(&relation_id)
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgoutput::ColumnSpec;

    fn relation(id: Oid, name: &str, columns: &[&str]) -> RelationInfo {
        RelationInfo {
            relation_id: id,
            namespace: "public".to_string(),
            relation_name: name.to_string(),
            replica_identity: b'd',
            columns: columns
                .iter()
                .map(|name| ColumnSpec {
                    flags: 0,
                    name: name.to_string(),
                    data_type_oid: 25,
                    type_modifier: -1,
                })
                .collect(),
        }
    }

    #[test]
    fn registers_and_retrieves() {
        let mut registry = RelationRegistry::new();
        assert!(registry.is_empty());

        registry.register(relation(16385, "users", &["id", "name"]));

        assert!(registry.contains(16385));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(16385).unwrap().relation_name, "users");
        assert!(registry.get(99999).is_none());
    }

    #[test]
    fn register_replaces_the_whole_entry() {
        let mut registry = RelationRegistry::new();
        registry.register(relation(16385, "users", &["id", "name"]));

        // ALTER TABLE re-announces the same id with a different column list.
        registry.register(relation(16385, "users", &["id", "name", "email"]));

        let info = registry.get(16385).unwrap();
        assert_eq!(info.columns.len(), 3);
        assert_eq!(info.columns[2].name, "email");
        assert_eq!(registry.len(), 1);
    }
}
