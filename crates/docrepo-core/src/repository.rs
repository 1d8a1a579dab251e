//! Generic repository
//!
//! A [`Repository`] binds one collection to one [`Document`] type. It owns no
//! state besides the collection handle, so clones are cheap and can be shared
//! across tasks.
//!
//! Writes apply the lifecycle convention:
//! - inserts assign an identifier and stamp `createdAt`/`updatedAt`
//! - updates refresh `updatedAt` with the store's clock (`$currentDate`)
//! - replaces stamp `updatedAt` on the replacement
//!
//! Guards run before anything reaches the store:
//! - deletes refuse an empty filter (use [`match_all`](crate::filter::match_all)
//!   to clear a collection on purpose)
//! - empty `insert_many` and `bulk_write` batches return empty results
//!
//! ## Usage
//!
//! ```ignore
//! let repo: Repository<User> = store.repository("users");
//! let ctx = Context::with_timeout(Duration::from_secs(2));
//!
//! let user = repo.insert_one(&ctx, User::new("ada")).await?;
//! let found = repo.find_one(&ctx, id_filter(user.id().unwrap())).await?;
//! repo.update_one(&ctx, id_filter(found.id().unwrap()), doc! { "name": "Ada" }).await?;
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{doc, Document as BsonDocument};
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use tracing::{debug, warn};

use crate::backend::{
    BulkWriteResult, Collection, FindOneOptions, FindOptions, UpdateOptions, UpdateResult,
    WriteModel,
};
use crate::context::Context;
use crate::document::{now, Document, ID_FIELD, UPDATED_AT_FIELD};
use crate::error::{RepoError, RepoResult};

/// Stream of aggregation results; the caller drives it to completion
pub type AggregateStream = BoxStream<'static, RepoResult<BsonDocument>>;

/// The operation surface over one collection of `T`
///
/// Every operation takes the [`Context`] bounding the call first. Cancelling
/// the context or passing its deadline aborts the in-flight store call.
#[async_trait]
pub trait DocumentRepository<T: Document>: Send + Sync {
    /// The first document matching `filter`, or [`RepoError::NotFound`]
    async fn find_one(&self, ctx: &Context, filter: BsonDocument) -> RepoResult<T>;

    /// Every document matching `filter`, fully materialized
    async fn find_many(&self, ctx: &Context, filter: BsonDocument) -> RepoResult<Vec<T>>;

    /// Initialize and persist one document, returning it as stored
    async fn insert_one(&self, ctx: &Context, document: T) -> RepoResult<T>;

    /// Initialize and persist a batch, returning it in input order
    async fn insert_many(&self, ctx: &Context, documents: Vec<T>) -> RepoResult<Vec<T>>;

    /// Set the fields in `data` on the first match and refresh `updatedAt`
    async fn update_one(
        &self,
        ctx: &Context,
        filter: BsonDocument,
        data: BsonDocument,
    ) -> RepoResult<UpdateResult>;

    /// Set the fields in `data` on every match and refresh `updatedAt`
    async fn update_many(
        &self,
        ctx: &Context,
        filter: BsonDocument,
        data: BsonDocument,
    ) -> RepoResult<()>;

    /// Replace the first match, returning the replacement as submitted
    ///
    /// Only `updatedAt` is stamped. `createdAt` is stored as the replacement
    /// carries it, so a freshly built value overwrites the stored creation
    /// time; start from the stored document to keep it.
    async fn replace_one(&self, ctx: &Context, filter: BsonDocument, document: T)
        -> RepoResult<T>;

    async fn delete_one(&self, ctx: &Context, filter: BsonDocument) -> RepoResult<()>;

    /// Returns the number of deleted documents
    async fn delete_many(&self, ctx: &Context, filter: BsonDocument) -> RepoResult<u64>;

    /// Apply write models in order, stopping at the first failure
    ///
    /// Backends may run the models as separate round trips (the MongoDB
    /// backend does), so the batch is not atomic: writes before a failing
    /// model stay applied.
    async fn bulk_write(
        &self,
        ctx: &Context,
        models: Vec<WriteModel>,
    ) -> RepoResult<BulkWriteResult>;

    /// Run an aggregation pipeline; results are produced lazily
    async fn aggregate(
        &self,
        ctx: &Context,
        pipeline: Vec<BsonDocument>,
    ) -> RepoResult<AggregateStream>;

    async fn count_documents(&self, ctx: &Context, filter: BsonDocument) -> RepoResult<u64>;
}

/// Repository over a collection of `T`
pub struct Repository<T> {
    collection: Arc<dyn Collection>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            collection: Arc::clone(&self.collection),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Repository<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("collection", &self.collection.name())
            .finish()
    }
}

impl<T: Document> Repository<T> {
    pub fn new(collection: Arc<dyn Collection>) -> Self {
        Self {
            collection,
            _marker: PhantomData,
        }
    }

    /// The wrapped collection handle
    pub fn collection(&self) -> &Arc<dyn Collection> {
        &self.collection
    }

    pub fn collection_name(&self) -> &str {
        self.collection.name()
    }

    /// [`DocumentRepository::find_one`] with sort and skip options
    pub async fn find_one_with(
        &self,
        ctx: &Context,
        filter: BsonDocument,
        options: FindOneOptions,
    ) -> RepoResult<T> {
        debug!("find_one on '{}': {}", self.collection_name(), filter);

        let found = ctx
            .run(async { Ok(self.collection.find_one(filter, options).await?) })
            .await?;

        match found {
            Some(raw) => Ok(bson::from_document(raw)?),
            None => Err(RepoError::NotFound {
                collection: self.collection_name().to_string(),
            }),
        }
    }

    /// [`DocumentRepository::find_many`] with sort, skip and limit options
    pub async fn find_many_with(
        &self,
        ctx: &Context,
        filter: BsonDocument,
        options: FindOptions,
    ) -> RepoResult<Vec<T>> {
        debug!("find_many on '{}': {}", self.collection_name(), filter);

        let raw: Vec<BsonDocument> = ctx
            .run(async {
                let cursor = self.collection.find(filter, options).await?;
                Ok(cursor.try_collect().await?)
            })
            .await?;

        let documents = raw
            .into_iter()
            .map(bson::from_document)
            .collect::<Result<Vec<T>, _>>()?;

        debug!(
            "find_many on '{}' returned {} documents",
            self.collection_name(),
            documents.len()
        );
        Ok(documents)
    }

    /// [`DocumentRepository::update_one`] with upsert option
    pub async fn update_one_with(
        &self,
        ctx: &Context,
        filter: BsonDocument,
        data: BsonDocument,
        options: UpdateOptions,
    ) -> RepoResult<UpdateResult> {
        debug!("update_one on '{}': {}", self.collection_name(), filter);

        let update = set_and_touch(data);
        ctx.run(async {
            self.collection
                .update_one(filter, update, options)
                .await
                .map_err(|source| RepoError::Operation {
                    operation: "Repository::update_one",
                    source,
                })
        })
        .await
    }

    /// Same as [`DocumentRepository::update_many`] but surfaces the counts
    pub async fn update_many_with(
        &self,
        ctx: &Context,
        filter: BsonDocument,
        data: BsonDocument,
        options: UpdateOptions,
    ) -> RepoResult<UpdateResult> {
        debug!("update_many on '{}': {}", self.collection_name(), filter);

        let update = set_and_touch(data);
        ctx.run(async {
            self.collection
                .update_many(filter, update, options)
                .await
                .map_err(|source| RepoError::Operation {
                    operation: "Repository::update_many",
                    source,
                })
        })
        .await
    }

    /// [`DocumentRepository::replace_one`] with upsert option
    ///
    /// `createdAt` is written as `document` carries it.
    pub async fn replace_one_with(
        &self,
        ctx: &Context,
        filter: BsonDocument,
        mut document: T,
        options: UpdateOptions,
    ) -> RepoResult<T> {
        debug!("replace_one on '{}': {}", self.collection_name(), filter);

        document.set_updated_at(now());
        let replacement = bson::to_document(&document)?;

        ctx.run(async {
            self.collection
                .replace_one(filter, replacement, options)
                .await?;
            Ok(())
        })
        .await?;

        Ok(document)
    }

    /// Serialize a freshly initialized document
    ///
    /// The identifier must land in the top-level `_id` field, otherwise the
    /// document could never be found by id again.
    fn encode_new(&self, operation: &'static str, document: &T) -> RepoResult<BsonDocument> {
        let raw = bson::to_document(document)?;
        if raw.get_object_id(ID_FIELD).ok() != document.id() {
            warn!(
                "{} on '{}' rejected: identifier is not stored as top-level {}",
                operation,
                self.collection_name(),
                ID_FIELD
            );
            return Err(RepoError::Validation {
                operation,
                reason: format!(
                    "serialized document must carry its identifier in the top-level {} field",
                    ID_FIELD
                ),
            });
        }
        Ok(raw)
    }

    fn guard_filter(&self, operation: &'static str, filter: &BsonDocument) -> RepoResult<()> {
        if filter.is_empty() {
            warn!(
                "{} on '{}' rejected: empty filter",
                operation,
                self.collection_name()
            );
            return Err(RepoError::Validation {
                operation,
                reason: "empty filter would match every document".to_string(),
            });
        }
        Ok(())
    }
}

/// Wrap partial field values as `$set` and refresh `updatedAt` server-side
fn set_and_touch(data: BsonDocument) -> BsonDocument {
    let mut update = BsonDocument::new();
    if !data.is_empty() {
        update.insert("$set", data);
    }
    update.insert("$currentDate", doc! { UPDATED_AT_FIELD: true });
    update
}

#[async_trait]
impl<T: Document> DocumentRepository<T> for Repository<T> {
    async fn find_one(&self, ctx: &Context, filter: BsonDocument) -> RepoResult<T> {
        self.find_one_with(ctx, filter, FindOneOptions::default())
            .await
    }

    async fn find_many(&self, ctx: &Context, filter: BsonDocument) -> RepoResult<Vec<T>> {
        self.find_many_with(ctx, filter, FindOptions::default())
            .await
    }

    async fn insert_one(&self, ctx: &Context, mut document: T) -> RepoResult<T> {
        document.init_document();
        let raw = self.encode_new("Repository::insert_one", &document)?;
        debug!("insert_one on '{}'", self.collection_name());

        ctx.run(async {
            self.collection.insert_one(raw).await?;
            Ok(())
        })
        .await?;

        Ok(document)
    }

    async fn insert_many(&self, ctx: &Context, mut documents: Vec<T>) -> RepoResult<Vec<T>> {
        if documents.is_empty() {
            debug!(
                "insert_many on '{}' skipped: no documents",
                self.collection_name()
            );
            return Ok(documents);
        }

        let mut raw = Vec::with_capacity(documents.len());
        for document in documents.iter_mut() {
            document.init_document();
            raw.push(self.encode_new("Repository::insert_many", document)?);
        }
        debug!(
            "insert_many on '{}': {} documents",
            self.collection_name(),
            raw.len()
        );

        ctx.run(async {
            self.collection.insert_many(raw).await?;
            Ok(())
        })
        .await?;

        Ok(documents)
    }

    async fn update_one(
        &self,
        ctx: &Context,
        filter: BsonDocument,
        data: BsonDocument,
    ) -> RepoResult<UpdateResult> {
        self.update_one_with(ctx, filter, data, UpdateOptions::default())
            .await
    }

    async fn update_many(
        &self,
        ctx: &Context,
        filter: BsonDocument,
        data: BsonDocument,
    ) -> RepoResult<()> {
        self.update_many_with(ctx, filter, data, UpdateOptions::default())
            .await
            .map(|_| ())
    }

    async fn replace_one(
        &self,
        ctx: &Context,
        filter: BsonDocument,
        document: T,
    ) -> RepoResult<T> {
        self.replace_one_with(ctx, filter, document, UpdateOptions::default())
            .await
    }

    async fn delete_one(&self, ctx: &Context, filter: BsonDocument) -> RepoResult<()> {
        self.guard_filter("Repository::delete_one", &filter)?;
        debug!("delete_one on '{}': {}", self.collection_name(), filter);

        ctx.run(async {
            self.collection.delete_one(filter).await?;
            Ok(())
        })
        .await
    }

    async fn delete_many(&self, ctx: &Context, filter: BsonDocument) -> RepoResult<u64> {
        self.guard_filter("Repository::delete_many", &filter)?;
        debug!("delete_many on '{}': {}", self.collection_name(), filter);

        let result = ctx
            .run(async { Ok(self.collection.delete_many(filter).await?) })
            .await?;
        Ok(result.deleted_count)
    }

    async fn bulk_write(
        &self,
        ctx: &Context,
        models: Vec<WriteModel>,
    ) -> RepoResult<BulkWriteResult> {
        if models.is_empty() {
            debug!(
                "bulk_write on '{}' skipped: no operations",
                self.collection_name()
            );
            return Ok(BulkWriteResult::default());
        }
        debug!(
            "bulk_write on '{}': {} operations",
            self.collection_name(),
            models.len()
        );

        ctx.run(async { Ok(self.collection.bulk_write(models).await?) })
            .await
    }

    async fn aggregate(
        &self,
        ctx: &Context,
        pipeline: Vec<BsonDocument>,
    ) -> RepoResult<AggregateStream> {
        debug!(
            "aggregate on '{}': {} stages",
            self.collection_name(),
            pipeline.len()
        );

        let cursor = ctx
            .run(async { Ok(self.collection.aggregate(pipeline).await?) })
            .await?;
        Ok(cursor.map_err(RepoError::from).boxed())
    }

    async fn count_documents(&self, ctx: &Context, filter: BsonDocument) -> RepoResult<u64> {
        debug!("count_documents on '{}': {}", self.collection_name(), filter);

        ctx.run(async { Ok(self.collection.count_documents(filter).await?) })
            .await
    }
}
