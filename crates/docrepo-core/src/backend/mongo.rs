//! MongoDB backend
//!
//! Adapts the official `mongodb` driver to [`Database`] and [`Collection`].
//! Only compiled with the `mongodb` feature.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Document as BsonDocument};
use futures_util::TryStreamExt;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{self as driver_options, ClientOptions};
use mongodb::Client;
use tracing::debug;

use super::{
    run_ordered_bulk_write, BulkWriteResult, Collection, Database, DeleteResult, DocumentStream,
    FindOneOptions, FindOptions, InsertManyResult, InsertOneResult, UpdateOptions, UpdateResult,
    WriteModel,
};
use crate::error::{StoreError, StoreResult};

/// Server error code for unique index violations
const DUPLICATE_KEY_CODE: i32 = 11000;

/// A database reached through the MongoDB driver
#[derive(Debug, Clone)]
pub struct MongoDatabase {
    client: Client,
    database: mongodb::Database,
    name: String,
}

impl MongoDatabase {
    /// Parse `uri` and create a client bound to `database`
    ///
    /// The driver connects lazily; `timeout` bounds both the socket connect
    /// and server selection so the first round trip fails in time.
    pub async fn connect(uri: &str, database: &str, timeout: Duration) -> StoreResult<Self> {
        let mut options = ClientOptions::parse(uri).await.map_err(driver_error)?;
        options.connect_timeout = Some(timeout);
        options.server_selection_timeout = Some(timeout);

        let client = Client::with_options(options).map_err(driver_error)?;
        debug!("MongoDB client created for database '{}'", database);

        Ok(Self {
            database: client.database(database),
            client,
            name: database.to_string(),
        })
    }
}

#[async_trait]
impl Database for MongoDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn collection(&self, name: &str) -> Arc<dyn Collection> {
        Arc::new(MongoCollection {
            name: name.to_string(),
            inner: self.database.collection::<BsonDocument>(name),
        })
    }

    async fn ping(&self) -> StoreResult<()> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(driver_error)?;
        Ok(())
    }

    async fn shutdown(&self) -> StoreResult<()> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}

/// One collection of a [`MongoDatabase`]
#[derive(Debug, Clone)]
pub struct MongoCollection {
    name: String,
    inner: mongodb::Collection<BsonDocument>,
}

#[async_trait]
impl Collection for MongoCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find_one(
        &self,
        filter: BsonDocument,
        options: FindOneOptions,
    ) -> StoreResult<Option<BsonDocument>> {
        let mut driver = driver_options::FindOneOptions::default();
        driver.sort = options.sort;
        driver.skip = options.skip;

        self.inner
            .find_one(filter)
            .with_options(driver)
            .await
            .map_err(driver_error)
    }

    async fn find(
        &self,
        filter: BsonDocument,
        options: FindOptions,
    ) -> StoreResult<DocumentStream> {
        let mut driver = driver_options::FindOptions::default();
        driver.sort = options.sort;
        driver.skip = options.skip;
        driver.limit = options.limit;

        let cursor = self
            .inner
            .find(filter)
            .with_options(driver)
            .await
            .map_err(driver_error)?;
        Ok(Box::pin(cursor.map_err(driver_error)))
    }

    async fn insert_one(&self, document: BsonDocument) -> StoreResult<InsertOneResult> {
        let result = self
            .inner
            .insert_one(document)
            .await
            .map_err(|e| write_error(&self.name, e))?;
        Ok(InsertOneResult {
            inserted_id: result.inserted_id,
        })
    }

    async fn insert_many(&self, documents: Vec<BsonDocument>) -> StoreResult<InsertManyResult> {
        if documents.is_empty() {
            return Err(StoreError::EmptyBatch {
                operation: "insert_many",
            });
        }

        let result = self
            .inner
            .insert_many(documents)
            .await
            .map_err(|e| write_error(&self.name, e))?;
        Ok(InsertManyResult {
            inserted_ids: result.inserted_ids,
        })
    }

    async fn update_one(
        &self,
        filter: BsonDocument,
        update: BsonDocument,
        options: UpdateOptions,
    ) -> StoreResult<UpdateResult> {
        let result = self
            .inner
            .update_one(filter, update)
            .with_options(update_options(options))
            .await
            .map_err(|e| write_error(&self.name, e))?;
        Ok(convert_update(result))
    }

    async fn update_many(
        &self,
        filter: BsonDocument,
        update: BsonDocument,
        options: UpdateOptions,
    ) -> StoreResult<UpdateResult> {
        let result = self
            .inner
            .update_many(filter, update)
            .with_options(update_options(options))
            .await
            .map_err(|e| write_error(&self.name, e))?;
        Ok(convert_update(result))
    }

    async fn replace_one(
        &self,
        filter: BsonDocument,
        replacement: BsonDocument,
        options: UpdateOptions,
    ) -> StoreResult<UpdateResult> {
        let mut driver = driver_options::ReplaceOptions::default();
        driver.upsert = Some(options.upsert);

        let result = self
            .inner
            .replace_one(filter, replacement)
            .with_options(driver)
            .await
            .map_err(|e| write_error(&self.name, e))?;
        Ok(convert_update(result))
    }

    async fn delete_one(&self, filter: BsonDocument) -> StoreResult<DeleteResult> {
        let result = self.inner.delete_one(filter).await.map_err(driver_error)?;
        Ok(DeleteResult {
            deleted_count: result.deleted_count,
        })
    }

    async fn delete_many(&self, filter: BsonDocument) -> StoreResult<DeleteResult> {
        let result = self.inner.delete_many(filter).await.map_err(driver_error)?;
        Ok(DeleteResult {
            deleted_count: result.deleted_count,
        })
    }

    async fn bulk_write(&self, models: Vec<WriteModel>) -> StoreResult<BulkWriteResult> {
        run_ordered_bulk_write(self, models).await
    }

    async fn aggregate(&self, pipeline: Vec<BsonDocument>) -> StoreResult<DocumentStream> {
        let cursor = self.inner.aggregate(pipeline).await.map_err(driver_error)?;
        Ok(Box::pin(cursor.map_err(driver_error)))
    }

    async fn count_documents(&self, filter: BsonDocument) -> StoreResult<u64> {
        self.inner
            .count_documents(filter)
            .await
            .map_err(driver_error)
    }
}

fn update_options(options: UpdateOptions) -> driver_options::UpdateOptions {
    let mut driver = driver_options::UpdateOptions::default();
    driver.upsert = Some(options.upsert);
    driver
}

fn convert_update(result: mongodb::results::UpdateResult) -> UpdateResult {
    UpdateResult {
        matched_count: result.matched_count,
        modified_count: result.modified_count,
        upserted_id: result.upserted_id,
    }
}

fn driver_error(err: mongodb::error::Error) -> StoreError {
    StoreError::Driver(Box::new(err))
}

/// Server message of a unique index violation, single or batched
fn duplicate_key_message(err: &mongodb::error::Error) -> Option<String> {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY_CODE => {
            Some(write.message.clone())
        }
        ErrorKind::InsertMany(failure) => failure
            .write_errors
            .as_ref()?
            .iter()
            .find(|write| write.code == DUPLICATE_KEY_CODE)
            .map(|write| write.message.clone()),
        _ => None,
    }
}

/// Map a failed write, surfacing unique index violations as `DuplicateKey`
fn write_error(collection: &str, err: mongodb::error::Error) -> StoreError {
    match duplicate_key_message(&err) {
        Some(key) => StoreError::DuplicateKey {
            collection: collection.to_string(),
            key,
        },
        None => driver_error(err),
    }
}
