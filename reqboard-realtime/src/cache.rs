//! Local cache of entity collections.
//!
//! Each collection is keyed by `(entity kind, parent id)`, e.g. all blocks of
//! a document or all requirements of a block. Collections are unique by
//! entity id and ordered by `position` (or `order`) when present, otherwise by
//! insertion order.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::{RealtimeError, Result};
use crate::protocol::EntityKind;

/// Normalise a JSON id (string or integer) to a string.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// One entity snapshot: a JSON object with an `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    id: String,
    fields: Map<String, Value>,
}

impl TryFrom<Value> for Entity {
    type Error = RealtimeError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => {
                let id = fields
                    .get("id")
                    .and_then(id_string)
                    .ok_or_else(|| RealtimeError::Malformed("row without id".into()))?;
                Ok(Self { id, fields })
            }
            other => Err(RealtimeError::Malformed(format!("row is not an object: {other}"))),
        }
    }
}

impl Entity {
    /// Build from a JSON object. Fails on non-objects and missing ids.
    pub fn from_json(value: Value) -> Result<Self> {
        Self::try_from(value)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Id-like field (string or integer) as a string.
    pub fn get_id(&self, field: &str) -> Option<String> {
        self.fields.get(field).and_then(id_string)
    }

    /// Sort key: `position`, falling back to `order`.
    pub fn position(&self) -> Option<f64> {
        ["position", "order"]
            .into_iter()
            .find_map(|f| self.fields.get(f).and_then(Value::as_f64))
            .filter(|p| p.is_finite())
    }

    /// Shallow merge: every field of `newer` overwrites ours.
    pub fn merge(&mut self, newer: &Entity) {
        for (k, v) in &newer.fields {
            self.fields.insert(k.clone(), v.clone());
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

fn by_position(a: &Entity, b: &Entity) -> Ordering {
    match (a.position(), b.position()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Ordered, id-unique sequence of entities.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection {
    entities: Vec<Entity>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.entities.iter().position(|e| e.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index_of(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id() == id)
    }

    /// Append unless the id is already present. Returns whether it was added.
    pub fn insert_if_absent(&mut self, entity: Entity) -> bool {
        if self.contains(entity.id()) {
            return false;
        }
        let positioned = entity.position().is_some();
        self.entities.push(entity);
        if positioned {
            self.sort();
        }
        true
    }

    /// Shallow-merge `newer` into the entity with the same id.
    /// Returns false when no such entity exists.
    pub fn merge_update(&mut self, newer: &Entity) -> bool {
        let Some(idx) = self.index_of(newer.id()) else {
            return false;
        };
        let before = self.entities[idx].position();
        self.entities[idx].merge(newer);
        if self.entities[idx].position() != before {
            self.sort();
        }
        true
    }

    /// Insert or shallow-merge.
    pub fn upsert(&mut self, entity: Entity) {
        if !self.merge_update(&entity) {
            self.insert_if_absent(entity);
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Entity> {
        self.index_of(id).map(|idx| self.entities.remove(idx))
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn ids(&self) -> Vec<&str> {
        self.entities.iter().map(Entity::id).collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn sort(&mut self) {
        // stable: unpositioned entities keep insertion order
        self.entities.sort_by(by_position);
    }
}

/// Cache key: entity kind plus parent id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: EntityKind,
    pub parent_id: String,
}

impl CacheKey {
    pub fn new(kind: EntityKind, parent_id: impl Into<String>) -> Self {
        Self {
            kind,
            parent_id: parent_id.into(),
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.parent_id)
    }
}

/// All collections of one document.
#[derive(Debug, Default)]
pub struct CollectionCache {
    collections: HashMap<CacheKey, Collection>,
    version: u64,
}

impl CollectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<&Collection> {
        self.collections.get(key)
    }

    pub fn collection_mut(&mut self, key: CacheKey) -> &mut Collection {
        self.collections.entry(key).or_default()
    }

    /// Entities of a collection, cloned; empty if the key is unknown.
    pub fn entities(&self, key: &CacheKey) -> Vec<Entity> {
        self.collections
            .get(key)
            .map(|c| c.entities().to_vec())
            .unwrap_or_default()
    }

    /// Replace a collection with freshly fetched rows.
    /// Later duplicates of an id are merged into the first occurrence.
    pub fn hydrate(&mut self, key: CacheKey, rows: Vec<Entity>) {
        let mut collection = Collection::new();
        for row in rows {
            collection.upsert(row);
        }
        self.collections.insert(key, collection);
        self.bump();
    }

    /// Key of the collection of `kind` that holds `id`, if any.
    pub fn locate(&self, kind: EntityKind, id: &str) -> Option<CacheKey> {
        self.collections
            .iter()
            .find(|(k, c)| k.kind == kind && c.contains(id))
            .map(|(k, _)| k.clone())
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.collections.keys()
    }

    /// Copy of every collection.
    pub fn snapshot(&self) -> HashMap<CacheKey, Vec<Entity>> {
        self.collections
            .iter()
            .map(|(k, c)| (k.clone(), c.entities().to_vec()))
            .collect()
    }

    /// Monotonic counter bumped on every mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(v: Value) -> Entity {
        Entity::from_json(v).unwrap()
    }

    #[test]
    fn test_entity_requires_object_with_id() {
        assert!(Entity::from_json(json!({"id": "a"})).is_ok());
        assert_eq!(Entity::from_json(json!({"id": 7})).unwrap().id(), "7");
        assert!(Entity::from_json(json!({"id": ""})).is_err());
        assert!(Entity::from_json(json!({"name": "a"})).is_err());
        assert!(Entity::from_json(json!(["a"])).is_err());
    }

    #[test]
    fn test_position_falls_back_to_order() {
        assert_eq!(entity(json!({"id": "a", "position": 2})).position(), Some(2.0));
        assert_eq!(entity(json!({"id": "a", "order": 3.5})).position(), Some(3.5));
        assert_eq!(entity(json!({"id": "a"})).position(), None);
    }

    #[test]
    fn test_merge_is_shallow_new_wins() {
        let mut e = entity(json!({"id": "a", "title": "old", "meta": {"x": 1, "y": 2}, "keep": true}));
        e.merge(&entity(json!({"id": "a", "title": "new", "meta": {"x": 9}})));
        assert_eq!(e.get_str("title"), Some("new"));
        assert_eq!(e.get("meta"), Some(&json!({"x": 9})));
        assert_eq!(e.get("keep"), Some(&json!(true)));
    }

    #[test]
    fn test_insert_if_absent_unique() {
        let mut c = Collection::new();
        assert!(c.insert_if_absent(entity(json!({"id": "a"}))));
        assert!(!c.insert_if_absent(entity(json!({"id": "a", "title": "dup"}))));
        assert_eq!(c.len(), 1);
        assert!(c.get("a").unwrap().get("title").is_none());
    }

    #[test]
    fn test_insertion_order_without_position() {
        let mut c = Collection::new();
        for id in ["c", "a", "b"] {
            c.insert_if_absent(entity(json!({ "id": id })));
        }
        assert_eq!(c.ids(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_sorted_by_position() {
        let mut c = Collection::new();
        c.insert_if_absent(entity(json!({"id": "b", "position": 2})));
        c.insert_if_absent(entity(json!({"id": "c", "position": 3})));
        c.insert_if_absent(entity(json!({"id": "a", "position": 1})));
        assert_eq!(c.ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_update_repositions() {
        let mut c = Collection::new();
        c.insert_if_absent(entity(json!({"id": "a", "position": 1})));
        c.insert_if_absent(entity(json!({"id": "b", "position": 2})));
        assert!(c.merge_update(&entity(json!({"id": "a", "position": 5}))));
        assert_eq!(c.ids(), vec!["b", "a"]);
    }

    #[test]
    fn test_update_missing_is_noop() {
        let mut c = Collection::new();
        assert!(!c.merge_update(&entity(json!({"id": "ghost"}))));
        assert!(c.is_empty());
    }

    #[test]
    fn test_remove() {
        let mut c = Collection::new();
        c.insert_if_absent(entity(json!({"id": "a"})));
        assert!(c.remove("a").is_some());
        assert!(c.remove("a").is_none());
    }

    #[test]
    fn test_hydrate_dedupes_and_bumps_version() {
        let mut cache = CollectionCache::new();
        let key = CacheKey::new(EntityKind::Block, "doc");
        cache.hydrate(
            key.clone(),
            vec![
                entity(json!({"id": "b", "position": 2})),
                entity(json!({"id": "a", "position": 1})),
                entity(json!({"id": "b", "title": "merged"})),
            ],
        );
        let rows = cache.entities(&key);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id(), "a");
        assert_eq!(rows[1].get_str("title"), Some("merged"));
        assert_eq!(cache.version(), 1);
    }

    #[test]
    fn test_locate_searches_by_kind() {
        let mut cache = CollectionCache::new();
        cache
            .collection_mut(CacheKey::new(EntityKind::Column, "block-1"))
            .insert_if_absent(entity(json!({"id": "col-1"})));
        assert_eq!(
            cache.locate(EntityKind::Column, "col-1"),
            Some(CacheKey::new(EntityKind::Column, "block-1"))
        );
        assert_eq!(cache.locate(EntityKind::Requirement, "col-1"), None);
    }
}
