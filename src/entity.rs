//! Live entity model handed between the unit of work, persisters and hydrators.

use crate::error::Result;
use crate::key::EntityCacheKey;
use crate::value::{Identifier, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A managed entity: scalar fields plus to-one references.
///
/// To-many associations are not part of the entity itself; they are loaded
/// into a [`PersistentCollection`] by the collection persister.
///
/// # Example
///
/// ```
/// use orm_cache::entity::{Entity, EntityReference};
/// use orm_cache::key::EntityCacheKey;
/// use orm_cache::value::Identifier;
///
/// let customer = EntityCacheKey::new("Customer", Identifier::single("id", 7)).unwrap();
/// let order = Entity::new("Order", Identifier::single("id", 42))
///     .with_field("id", 42)
///     .with_field("total", 100)
///     .with_reference("customer", Some(EntityReference::Proxy(customer)));
///
/// assert_eq!(order.field("total").and_then(|v| v.as_int()), Some(100));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    class: String,
    root_class: String,
    identifier: Identifier,
    fields: BTreeMap<String, Value>,
    references: BTreeMap<String, Option<EntityReference>>,
}

impl Entity {
    pub fn new(class: impl Into<String>, identifier: Identifier) -> Self {
        let class = class.into();
        Entity {
            root_class: class.clone(),
            class,
            identifier,
            fields: BTreeMap::new(),
            references: BTreeMap::new(),
        }
    }

    /// Declare the root class of the inheritance hierarchy this entity belongs to.
    pub fn in_hierarchy(mut self, root_class: impl Into<String>) -> Self {
        self.root_class = root_class.into();
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_reference(
        mut self,
        name: impl Into<String>,
        reference: Option<EntityReference>,
    ) -> Self {
        self.references.insert(name.into(), reference);
        self
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn root_class(&self) -> &str {
        &self.root_class
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// `None` when the association is unknown, `Some(None)` when it is null.
    pub fn reference(&self, name: &str) -> Option<Option<&EntityReference>> {
        self.references.get(name).map(Option::as_ref)
    }

    pub fn references(&self) -> &BTreeMap<String, Option<EntityReference>> {
        &self.references
    }

    /// Cache key of this entity under its root class.
    ///
    /// # Errors
    /// `Error::MalformedKey` when the identifier is empty.
    pub fn cache_key(&self) -> Result<EntityCacheKey> {
        EntityCacheKey::new(self.root_class.clone(), self.identifier.clone())
    }
}

/// A to-one reference: either a hydrated instance or an uninitialized proxy.
#[derive(Debug, Clone)]
pub enum EntityReference {
    Loaded(Arc<Entity>),
    Proxy(EntityCacheKey),
}

impl EntityReference {
    pub fn key(&self) -> Result<EntityCacheKey> {
        match self {
            EntityReference::Loaded(entity) => entity.cache_key(),
            EntityReference::Proxy(key) => Ok(key.clone()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self, EntityReference::Loaded(_))
    }

    pub fn entity(&self) -> Option<&Arc<Entity>> {
        match self {
            EntityReference::Loaded(entity) => Some(entity),
            EntityReference::Proxy(_) => None,
        }
    }
}

impl PartialEq for EntityReference {
    /// References are equal when they point at the same entity.
    fn eq(&self, other: &Self) -> bool {
        match (self.key(), other.key()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

/// A to-many association being populated by a persister or the collection hydrator.
#[derive(Debug, Clone)]
pub struct PersistentCollection {
    owner: EntityCacheKey,
    association: String,
    elements: Vec<Arc<Entity>>,
    initialized: bool,
}

impl PersistentCollection {
    pub fn new(owner: EntityCacheKey, association: impl Into<String>) -> Self {
        PersistentCollection {
            owner,
            association: association.into(),
            elements: Vec::new(),
            initialized: false,
        }
    }

    pub fn owner(&self) -> &EntityCacheKey {
        &self.owner
    }

    pub fn association(&self) -> &str {
        &self.association
    }

    /// Place `entity` at `index`, replacing an existing element or appending.
    pub fn hydrate_set(&mut self, index: usize, entity: Arc<Entity>) {
        if index < self.elements.len() {
            self.elements[index] = entity;
        } else {
            self.elements.push(entity);
        }
    }

    /// Replace the content with `elements` and mark the collection initialized.
    pub fn hydrate_all(&mut self, elements: Vec<Arc<Entity>>) {
        self.elements = elements;
        self.initialized = true;
    }

    pub fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    pub fn clear(&mut self) {
        self.elements.clear();
        self.initialized = false;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn elements(&self) -> &[Arc<Entity>] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_cache_key_uses_root_class() {
        let entity = Entity::new("SpecialOrder", Identifier::single("id", 1)).in_hierarchy("Order");
        let key = entity.cache_key().unwrap();
        assert_eq!(key.entity_class, "Order");
        assert_eq!(entity.class(), "SpecialOrder");
    }

    #[test]
    fn test_references_compare_by_key() {
        let key = EntityCacheKey::new("Customer", Identifier::single("id", 7)).unwrap();
        let loaded = EntityReference::Loaded(Arc::new(Entity::new(
            "Customer",
            Identifier::single("id", 7),
        )));
        let proxy = EntityReference::Proxy(key);
        assert_eq!(loaded, proxy);
        assert!(loaded.is_initialized());
        assert!(!proxy.is_initialized());
    }

    #[test]
    fn test_hydrate_set_preserves_order() {
        let owner = EntityCacheKey::new("Order", Identifier::single("id", 1)).unwrap();
        let mut collection = PersistentCollection::new(owner, "lines");
        for i in 0..3 {
            collection.hydrate_set(i, Arc::new(Entity::new("Line", Identifier::single("id", i as i64))));
        }
        let ids: Vec<i64> = collection
            .elements()
            .iter()
            .filter_map(|e| e.identifier().get("id").and_then(Value::as_int))
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);

        collection.hydrate_set(1, Arc::new(Entity::new("Line", Identifier::single("id", 9))));
        assert_eq!(collection.len(), 3);
        assert_eq!(
            collection.elements()[1].identifier().get("id"),
            Some(&Value::Int(9))
        );
    }
}
