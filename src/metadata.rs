//! Mapping metadata consumed by key builders, hydrators and the cache registry.
//!
//! The metadata loader lives outside this crate; it hands over [`ClassMetadata`]
//! values (built in code or deserialized from JSON) which are collected in a
//! [`MetadataRegistry`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Concurrency strategy declared for a cached entity or association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheUsage {
    #[default]
    ReadOnly,
    NonstrictReadWrite,
    ReadWrite,
}

impl fmt::Display for CacheUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheUsage::ReadOnly => write!(f, "READ_ONLY"),
            CacheUsage::NonstrictReadWrite => write!(f, "NONSTRICT_READ_WRITE"),
            CacheUsage::ReadWrite => write!(f, "READ_WRITE"),
        }
    }
}

/// Cache declaration on an entity class or an association.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheAnnotation {
    #[serde(default)]
    pub usage: CacheUsage,
    #[serde(default)]
    pub region: Option<String>,
}

impl CacheAnnotation {
    pub fn new(usage: CacheUsage) -> Self {
        CacheAnnotation {
            usage,
            region: None,
        }
    }

    pub fn read_only() -> Self {
        Self::new(CacheUsage::ReadOnly)
    }

    pub fn nonstrict_read_write() -> Self {
        Self::new(CacheUsage::NonstrictReadWrite)
    }

    pub fn read_write() -> Self {
        Self::new(CacheUsage::ReadWrite)
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// Kind of an association, matched exhaustively by hydrators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssociationKind {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl AssociationKind {
    pub fn is_to_one(self) -> bool {
        match self {
            AssociationKind::OneToOne | AssociationKind::ManyToOne => true,
            AssociationKind::OneToMany | AssociationKind::ManyToMany => false,
        }
    }

    pub fn is_to_many(self) -> bool {
        !self.is_to_one()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AssociationKind::OneToOne => "one-to-one",
            AssociationKind::OneToMany => "one-to-many",
            AssociationKind::ManyToOne => "many-to-one",
            AssociationKind::ManyToMany => "many-to-many",
        }
    }
}

/// How an association is fetched when its owner is hydrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchMode {
    #[default]
    Lazy,
    Eager,
    ExtraLazy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationMetadata {
    pub name: String,
    pub kind: AssociationKind,
    pub target_entity: String,
    #[serde(default)]
    pub fetch: FetchMode,
    #[serde(default)]
    pub mapped_by: Option<String>,
    #[serde(default)]
    pub inversed_by: Option<String>,
    /// Cache declaration for the association's collection region (to-many only).
    #[serde(default)]
    pub cache: Option<CacheAnnotation>,
}

impl AssociationMetadata {
    pub fn new(
        name: impl Into<String>,
        kind: AssociationKind,
        target_entity: impl Into<String>,
    ) -> Self {
        AssociationMetadata {
            name: name.into(),
            kind,
            target_entity: target_entity.into(),
            fetch: FetchMode::default(),
            mapped_by: None,
            inversed_by: None,
            cache: None,
        }
    }

    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, AssociationKind::OneToOne, target)
    }

    pub fn one_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, AssociationKind::OneToMany, target)
    }

    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, AssociationKind::ManyToOne, target)
    }

    pub fn many_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, AssociationKind::ManyToMany, target)
    }

    pub fn fetch(mut self, fetch: FetchMode) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn mapped_by(mut self, field: impl Into<String>) -> Self {
        self.mapped_by = Some(field.into());
        self
    }

    pub fn inversed_by(mut self, field: impl Into<String>) -> Self {
        self.inversed_by = Some(field.into());
        self
    }

    pub fn cache(mut self, cache: CacheAnnotation) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn is_owning_side(&self) -> bool {
        self.mapped_by.is_none()
    }
}

/// Shape of an entity class.
///
/// # Example
///
/// ```
/// use orm_cache::metadata::{AssociationMetadata, CacheAnnotation, ClassMetadata};
///
/// let order = ClassMetadata::new("Order")
///     .identifier(["id"])
///     .field("total")
///     .association(AssociationMetadata::many_to_one("customer", "Customer"))
///     .cache(CacheAnnotation::read_write().region("orders"));
///
/// assert!(order.is_cacheable());
/// assert_eq!(order.fields, vec!["id", "total"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassMetadata {
    pub name: String,
    /// Root class of the inheritance hierarchy (the class itself when not inherited).
    pub root_name: String,
    pub identifier: Vec<String>,
    /// Scalar fields, identifier fields included.
    pub fields: Vec<String>,
    #[serde(default)]
    pub associations: Vec<AssociationMetadata>,
    #[serde(default)]
    pub cache: Option<CacheAnnotation>,
}

impl ClassMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        ClassMetadata {
            root_name: name.clone(),
            name,
            identifier: Vec::new(),
            fields: Vec::new(),
            associations: Vec::new(),
            cache: None,
        }
    }

    pub fn root(mut self, root_name: impl Into<String>) -> Self {
        self.root_name = root_name.into();
        self
    }

    /// Declare identifier fields; they are also registered as scalar fields.
    pub fn identifier<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for field in fields {
            let field = field.into();
            if !self.fields.contains(&field) {
                self.fields.push(field.clone());
            }
            self.identifier.push(field);
        }
        self
    }

    pub fn field(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.fields.contains(&name) {
            self.fields.push(name);
        }
        self
    }

    pub fn association(mut self, association: AssociationMetadata) -> Self {
        self.associations.push(association);
        self
    }

    pub fn cache(mut self, cache: CacheAnnotation) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn is_cacheable(&self) -> bool {
        self.cache.is_some()
    }

    pub fn get_association(&self, name: &str) -> Option<&AssociationMetadata> {
        self.associations.iter().find(|a| a.name == name)
    }

    /// # Errors
    /// `Error::ConfigError` when the class has no identifier or an association
    /// has no target.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::ConfigError("class name must not be empty".to_string()));
        }
        if self.identifier.is_empty() {
            return Err(Error::ConfigError(format!(
                "class {} declares no identifier",
                self.name
            )));
        }
        if let Some(a) = self.associations.iter().find(|a| a.target_entity.is_empty()) {
            return Err(Error::ConfigError(format!(
                "association {}.{} has no target entity",
                self.name, a.name
            )));
        }
        Ok(())
    }
}

/// All known class metadata, keyed by class name.
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistry {
    classes: HashMap<String, Arc<ClassMetadata>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// `Error::ConfigError` when the metadata does not validate.
    pub fn register(&mut self, metadata: ClassMetadata) -> Result<()> {
        metadata.validate()?;
        self.classes
            .insert(metadata.name.clone(), Arc::new(metadata));
        Ok(())
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with(mut self, metadata: ClassMetadata) -> Result<Self> {
        self.register(metadata)?;
        Ok(self)
    }

    /// Load a JSON array of class metadata.
    ///
    /// # Errors
    /// `Error::ConfigError` on malformed JSON or invalid metadata.
    pub fn from_json(json: &str) -> Result<Self> {
        let classes: Vec<ClassMetadata> = serde_json::from_str(json)?;
        let mut registry = Self::new();
        for metadata in classes {
            registry.register(metadata)?;
        }
        Ok(registry)
    }

    pub fn get(&self, class: &str) -> Option<&Arc<ClassMetadata>> {
        self.classes.get(class)
    }

    /// # Errors
    /// `Error::ConfigError` for an unknown class.
    pub fn require(&self, class: &str) -> Result<&Arc<ClassMetadata>> {
        self.get(class)
            .ok_or_else(|| Error::ConfigError(format!("no metadata for class {}", class)))
    }

    /// Root class name of `class`, or `class` itself when unknown.
    pub fn root_of<'a>(&'a self, class: &'a str) -> &'a str {
        self.get(class).map(|m| m.root_name.as_str()).unwrap_or(class)
    }

    pub fn classes(&self) -> impl Iterator<Item = &Arc<ClassMetadata>> {
        self.classes.values()
    }
}
