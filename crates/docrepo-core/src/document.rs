//! Document lifecycle contract
//!
//! Every type stored through a [`Repository`](crate::Repository) implements
//! [`Document`]: it carries a store-assigned `_id` plus `createdAt` and
//! `updatedAt` timestamps that the repository stamps on writes.
//!
//! Types can implement the trait by hand, or embed a [`BaseModel`] and
//! implement [`Model`] to get `Document` for free:
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! struct User {
//!     #[serde(flatten)]
//!     base: BaseModel,
//!     name: String,
//! }
//!
//! impl Model for User {
//!     fn base(&self) -> &BaseModel { &self.base }
//!     fn base_mut(&mut self) -> &mut BaseModel { &mut self.base }
//! }
//! ```

use bson::oid::ObjectId;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Field holding the document identifier
pub const ID_FIELD: &str = "_id";
/// Field holding the creation timestamp
pub const CREATED_AT_FIELD: &str = "createdAt";
/// Field holding the last-update timestamp
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Current time at the precision the store keeps (milliseconds)
pub fn now() -> DateTime<Utc> {
    bson::DateTime::now().to_chrono()
}

/// Capability set of a storable entity
pub trait Document: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The identifier, `None` until the document is initialized
    fn id(&self) -> Option<ObjectId>;

    fn set_id(&mut self, id: Option<ObjectId>);

    fn created_at(&self) -> DateTime<Utc>;

    fn updated_at(&self) -> DateTime<Utc>;

    fn set_created_at(&mut self, created_at: DateTime<Utc>);

    fn set_updated_at(&mut self, updated_at: DateTime<Utc>);

    /// Assign a fresh identifier if none is set yet
    fn init_id(&mut self) {
        if self.id().is_none() {
            self.set_id(Some(ObjectId::new()));
        }
    }

    /// Mark the document as not yet persisted
    fn reset_id(&mut self) {
        self.set_id(None);
    }

    /// Prepare a new document for insertion
    ///
    /// Assigns an identifier if missing and sets both timestamps to the same
    /// current time.
    fn init_document(&mut self) {
        self.init_id();
        let now = now();
        self.set_created_at(now);
        self.set_updated_at(now);
    }
}

/// The fields most documents carry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseModel {
    /// Store identifier
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    /// When the document was first inserted
    #[serde(rename = "createdAt", with = "timestamp", default)]
    pub created_at: DateTime<Utc>,
    /// When the document was last written
    #[serde(rename = "updatedAt", with = "timestamp", default)]
    pub updated_at: DateTime<Utc>,
}

impl BaseModel {
    /// A model with no identifier and epoch timestamps
    pub fn new() -> Self {
        Self::default()
    }

    /// A model bound to an existing identifier (for loading from storage)
    pub fn with_id(id: ObjectId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }
}

impl Document for BaseModel {
    fn id(&self) -> Option<ObjectId> {
        self.id
    }

    fn set_id(&mut self, id: Option<ObjectId>) {
        self.id = id;
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn set_created_at(&mut self, created_at: DateTime<Utc>) {
        self.created_at = created_at;
    }

    fn set_updated_at(&mut self, updated_at: DateTime<Utc>) {
        self.updated_at = updated_at;
    }
}

/// Types that embed a [`BaseModel`]
///
/// The embedded model must be `#[serde(flatten)]` so that `_id`, `createdAt`
/// and `updatedAt` are top-level fields of the stored document. Filters such
/// as [`id_filter`](crate::filter::id_filter) and the `updatedAt` refresh
/// on updates address those top-level fields.
pub trait Model: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn base(&self) -> &BaseModel;

    fn base_mut(&mut self) -> &mut BaseModel;
}

impl<M: Model> Document for M {
    fn id(&self) -> Option<ObjectId> {
        self.base().id
    }

    fn set_id(&mut self, id: Option<ObjectId>) {
        self.base_mut().id = id;
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.base().created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.base().updated_at
    }

    fn set_created_at(&mut self, created_at: DateTime<Utc>) {
        self.base_mut().created_at = created_at;
    }

    fn set_updated_at(&mut self, updated_at: DateTime<Utc>) {
        self.base_mut().updated_at = updated_at;
    }
}

/// Serde helpers storing `DateTime<Utc>` as a native BSON date
///
/// Use with `#[serde(with = "docrepo_core::document::timestamp")]`.
pub mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        bson::DateTime::from_chrono(*value).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        bson::DateTime::deserialize(deserializer).map(|value| value.to_chrono())
    }
}
