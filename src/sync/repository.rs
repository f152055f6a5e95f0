// ABOUTME: Local entity repository contract - the content store articles are mirrored into
// ABOUTME: Defines LocalEntity plus lookup, create, load, and save operations

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::clock::Timestamp;

/// Field holding the source identifier of a mirrored entity.
pub const EXTERNAL_ID_FIELD: &str = "external_id";

/// Storage identifier assigned by the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub i64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locally persisted mirror of one external article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEntity {
    pub id: EntityId,
    pub entity_type: String,
    /// Matching key; set at creation and never changed
    pub external_id: String,
    pub title: String,
    pub body: String,
    /// Incremented by every save
    pub revision: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Fields required to create an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntity {
    pub entity_type: String,
    pub external_id: String,
    pub title: String,
}

impl NewEntity {
    /// Fields for a freshly mirrored article: the title is the external id.
    pub fn article(entity_type: &str, external_id: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            external_id: external_id.to_string(),
            title: external_id.to_string(),
        }
    }
}

/// Persistence operations the reconciler needs from the local content store.
pub trait EntityRepository {
    /// Ids of entities of `entity_type` whose `field` equals `value`, lowest id first.
    fn find_by_field(&self, entity_type: &str, field: &str, value: &str) -> Result<Vec<EntityId>>;

    fn load(&self, id: EntityId) -> Result<Option<LocalEntity>>;

    /// Create and persist a new entity with an empty body.
    fn create(&self, fields: NewEntity) -> Result<LocalEntity>;

    /// Persist `entity`. `Ok(false)` means the store refused the write.
    fn save(&self, entity: &mut LocalEntity) -> Result<bool>;

    /// Entities of `entity_type`, lowest id first.
    fn list(&self, entity_type: &str, limit: Option<usize>) -> Result<Vec<LocalEntity>>;
}

impl<R: EntityRepository + ?Sized> EntityRepository for &R {
    fn find_by_field(&self, entity_type: &str, field: &str, value: &str) -> Result<Vec<EntityId>> {
        (**self).find_by_field(entity_type, field, value)
    }

    fn load(&self, id: EntityId) -> Result<Option<LocalEntity>> {
        (**self).load(id)
    }

    fn create(&self, fields: NewEntity) -> Result<LocalEntity> {
        (**self).create(fields)
    }

    fn save(&self, entity: &mut LocalEntity) -> Result<bool> {
        (**self).save(entity)
    }

    fn list(&self, entity_type: &str, limit: Option<usize>) -> Result<Vec<LocalEntity>> {
        (**self).list(entity_type, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_article_uses_external_id_as_title() {
        let fields = NewEntity::article("article", "A1");
        assert_eq!(fields.entity_type, "article");
        assert_eq!(fields.external_id, "A1");
        assert_eq!(fields.title, "A1");
    }
}
