//! Document store backends
//!
//! The repository never talks to a driver directly. It goes through the
//! [`Database`] and [`Collection`] traits, which mirror the operations of a
//! MongoDB-style client on raw `bson::Document` values.
//!
//! ## Backends
//!
//! - `memory`: in-process store used for tests and `memory://` URIs
//! - `mongo`: the official MongoDB driver (feature `mongodb`)

pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongo;
pub mod query;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document as BsonDocument};
use futures_util::Stream;

use crate::error::{StoreError, StoreResult};

pub use memory::{MemoryCollection, MemoryDatabase};

/// Lazy cursor over result documents
pub type DocumentStream = Pin<Box<dyn Stream<Item = StoreResult<BsonDocument>> + Send>>;

/// A logical database within a store
#[async_trait]
pub trait Database: Send + Sync {
    fn name(&self) -> &str;

    /// Handle to the named collection (created lazily by the store)
    fn collection(&self, name: &str) -> Arc<dyn Collection>;

    /// Round-trip reachability probe
    async fn ping(&self) -> StoreResult<()>;

    /// Release the underlying connection
    async fn shutdown(&self) -> StoreResult<()>;
}

/// A named collection of documents
#[async_trait]
pub trait Collection: Send + Sync {
    fn name(&self) -> &str;

    async fn find_one(
        &self,
        filter: BsonDocument,
        options: FindOneOptions,
    ) -> StoreResult<Option<BsonDocument>>;

    async fn find(&self, filter: BsonDocument, options: FindOptions)
        -> StoreResult<DocumentStream>;

    async fn insert_one(&self, document: BsonDocument) -> StoreResult<InsertOneResult>;

    /// Fails with `EmptyBatch` when `documents` is empty
    async fn insert_many(&self, documents: Vec<BsonDocument>) -> StoreResult<InsertManyResult>;

    async fn update_one(
        &self,
        filter: BsonDocument,
        update: BsonDocument,
        options: UpdateOptions,
    ) -> StoreResult<UpdateResult>;

    async fn update_many(
        &self,
        filter: BsonDocument,
        update: BsonDocument,
        options: UpdateOptions,
    ) -> StoreResult<UpdateResult>;

    async fn replace_one(
        &self,
        filter: BsonDocument,
        replacement: BsonDocument,
        options: UpdateOptions,
    ) -> StoreResult<UpdateResult>;

    async fn delete_one(&self, filter: BsonDocument) -> StoreResult<DeleteResult>;

    async fn delete_many(&self, filter: BsonDocument) -> StoreResult<DeleteResult>;

    /// Fails with `EmptyBatch` when `models` is empty
    async fn bulk_write(&self, models: Vec<WriteModel>) -> StoreResult<BulkWriteResult>;

    async fn aggregate(&self, pipeline: Vec<BsonDocument>) -> StoreResult<DocumentStream>;

    async fn count_documents(&self, filter: BsonDocument) -> StoreResult<u64>;
}

/// Options for multi-document lookups
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Sort specification, e.g. `{ "createdAt": -1 }`
    pub sort: Option<BsonDocument>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
}

impl FindOptions {
    pub fn sort(mut self, sort: BsonDocument) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Options for single-document lookups
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOneOptions {
    pub sort: Option<BsonDocument>,
    pub skip: Option<u64>,
}

impl FindOneOptions {
    pub fn sort(mut self, sort: BsonDocument) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }
}

impl From<FindOneOptions> for FindOptions {
    fn from(options: FindOneOptions) -> Self {
        Self {
            sort: options.sort,
            skip: options.skip,
            limit: Some(1),
        }
    }
}

/// Options for update and replace operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Insert a new document when nothing matches
    pub upsert: bool,
}

impl UpdateOptions {
    pub fn upsert() -> Self {
        Self { upsert: true }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertOneResult {
    pub inserted_id: Bson,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertManyResult {
    /// Inserted identifiers keyed by input position
    pub inserted_ids: HashMap<usize, Bson>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Bson>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

/// Aggregate outcome of a bulk write; all zero for an empty batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkWriteResult {
    pub inserted_count: u64,
    pub matched_count: u64,
    pub modified_count: u64,
    pub deleted_count: u64,
    pub upserted_count: u64,
    /// Upserted identifiers keyed by operation position
    pub upserted_ids: HashMap<usize, Bson>,
}

impl BulkWriteResult {
    pub(crate) fn record_update(&mut self, index: usize, result: UpdateResult) {
        self.matched_count += result.matched_count;
        self.modified_count += result.modified_count;
        if let Some(id) = result.upserted_id {
            self.upserted_count += 1;
            self.upserted_ids.insert(index, id);
        }
    }
}

/// One write intent inside a bulk write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteModel {
    InsertOne {
        document: BsonDocument,
    },
    UpdateOne {
        filter: BsonDocument,
        update: BsonDocument,
        upsert: bool,
    },
    UpdateMany {
        filter: BsonDocument,
        update: BsonDocument,
        upsert: bool,
    },
    ReplaceOne {
        filter: BsonDocument,
        replacement: BsonDocument,
        upsert: bool,
    },
    DeleteOne {
        filter: BsonDocument,
    },
    DeleteMany {
        filter: BsonDocument,
    },
}

impl WriteModel {
    pub fn insert_one(document: BsonDocument) -> Self {
        WriteModel::InsertOne { document }
    }

    pub fn update_one(filter: BsonDocument, update: BsonDocument) -> Self {
        WriteModel::UpdateOne {
            filter,
            update,
            upsert: false,
        }
    }

    pub fn update_many(filter: BsonDocument, update: BsonDocument) -> Self {
        WriteModel::UpdateMany {
            filter,
            update,
            upsert: false,
        }
    }

    pub fn replace_one(filter: BsonDocument, replacement: BsonDocument) -> Self {
        WriteModel::ReplaceOne {
            filter,
            replacement,
            upsert: false,
        }
    }

    pub fn delete_one(filter: BsonDocument) -> Self {
        WriteModel::DeleteOne { filter }
    }

    pub fn delete_many(filter: BsonDocument) -> Self {
        WriteModel::DeleteMany { filter }
    }

    /// Name used in error messages and logs
    pub fn kind(&self) -> &'static str {
        match self {
            WriteModel::InsertOne { .. } => "insertOne",
            WriteModel::UpdateOne { .. } => "updateOne",
            WriteModel::UpdateMany { .. } => "updateMany",
            WriteModel::ReplaceOne { .. } => "replaceOne",
            WriteModel::DeleteOne { .. } => "deleteOne",
            WriteModel::DeleteMany { .. } => "deleteMany",
        }
    }
}

/// Run a bulk write as an ordered sequence of single operations
///
/// Stops at the first failing operation; earlier writes stay applied.
pub(crate) async fn run_ordered_bulk_write<C>(
    collection: &C,
    models: Vec<WriteModel>,
) -> StoreResult<BulkWriteResult>
where
    C: Collection + ?Sized,
{
    if models.is_empty() {
        return Err(StoreError::EmptyBatch {
            operation: "bulk_write",
        });
    }

    let mut result = BulkWriteResult::default();
    for (index, model) in models.into_iter().enumerate() {
        match model {
            WriteModel::InsertOne { document } => {
                collection.insert_one(document).await?;
                result.inserted_count += 1;
            }
            WriteModel::UpdateOne {
                filter,
                update,
                upsert,
            } => {
                let outcome = collection
                    .update_one(filter, update, UpdateOptions { upsert })
                    .await?;
                result.record_update(index, outcome);
            }
            WriteModel::UpdateMany {
                filter,
                update,
                upsert,
            } => {
                let outcome = collection
                    .update_many(filter, update, UpdateOptions { upsert })
                    .await?;
                result.record_update(index, outcome);
            }
            WriteModel::ReplaceOne {
                filter,
                replacement,
                upsert,
            } => {
                let outcome = collection
                    .replace_one(filter, replacement, UpdateOptions { upsert })
                    .await?;
                result.record_update(index, outcome);
            }
            WriteModel::DeleteOne { filter } => {
                result.deleted_count += collection.delete_one(filter).await?.deleted_count;
            }
            WriteModel::DeleteMany { filter } => {
                result.deleted_count += collection.delete_many(filter).await?.deleted_count;
            }
        }
    }

    Ok(result)
}
