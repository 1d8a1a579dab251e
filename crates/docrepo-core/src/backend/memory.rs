//! In-memory document store
//!
//! Thread-safe, in-process implementation of [`Database`] and [`Collection`].
//! Collections are created on first access and shared by every handle to the
//! same database. Documents keep insertion order.
//!
//! Behaves like a real server where callers depend on it: empty batches are
//! rejected, `_id` is generated when missing and must be unique, and `_id`
//! cannot change on replace. A database can be switched unreachable or given
//! artificial latency to exercise failure and timeout paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{Bson, Document as BsonDocument};
use futures_util::stream;
use tracing::debug;

use super::query;
use super::{
    run_ordered_bulk_write, BulkWriteResult, Collection, Database, DeleteResult, DocumentStream,
    FindOneOptions, FindOptions, InsertManyResult, InsertOneResult, UpdateOptions, UpdateResult,
    WriteModel,
};
use crate::document::ID_FIELD;
use crate::error::{StoreError, StoreResult};

type Rows = Arc<RwLock<Vec<BsonDocument>>>;

#[derive(Debug, Default)]
struct Shared {
    collections: RwLock<HashMap<String, Rows>>,
    reachable: AtomicBool,
    latency: RwLock<Option<Duration>>,
}

impl Shared {
    async fn round_trip(&self) -> StoreResult<()> {
        let latency = *self
            .latency
            .read()
            .map_err(|_| StoreError::LockPoisoned("latency read"))?;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("memory store is offline".to_string()));
        }
        Ok(())
    }
}

/// In-memory database; clones share the same data
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    name: String,
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        let shared = Shared {
            reachable: AtomicBool::new(true),
            ..Shared::default()
        };
        Self {
            name: name.into(),
            shared: Arc::new(shared),
        }
    }

    /// Make every call fail with `Unreachable` (or recover)
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut slot) = self.shared.latency.write() {
            *slot = latency;
        }
    }

    /// Typed handle to a collection
    pub fn memory_collection(&self, name: &str) -> MemoryCollection {
        let rows = {
            let mut collections = match self.shared.collections.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            collections
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(Vec::new())))
                .clone()
        };

        MemoryCollection {
            name: name.to_string(),
            rows,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Names of the collections created so far
    pub fn collection_names(&self) -> Vec<String> {
        let collections = match self.shared.collections.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut names: Vec<String> = collections.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn collection(&self, name: &str) -> Arc<dyn Collection> {
        Arc::new(self.memory_collection(name))
    }

    async fn ping(&self) -> StoreResult<()> {
        self.shared.round_trip().await
    }

    async fn shutdown(&self) -> StoreResult<()> {
        self.shared.round_trip().await?;
        debug!("Memory database '{}' shut down", self.name);
        Ok(())
    }
}

/// One collection of a [`MemoryDatabase`]
#[derive(Debug, Clone)]
pub struct MemoryCollection {
    name: String,
    rows: Rows,
    shared: Arc<Shared>,
}

impl MemoryCollection {
    fn read(&self, operation: &'static str) -> StoreResult<RwLockReadGuard<'_, Vec<BsonDocument>>> {
        self.rows
            .read()
            .map_err(|_| StoreError::LockPoisoned(operation))
    }

    fn write(
        &self,
        operation: &'static str,
    ) -> StoreResult<RwLockWriteGuard<'_, Vec<BsonDocument>>> {
        self.rows
            .write()
            .map_err(|_| StoreError::LockPoisoned(operation))
    }

    /// Snapshot of matching documents with sort, skip and limit applied
    fn select(&self, filter: &BsonDocument, options: &FindOptions) -> StoreResult<Vec<BsonDocument>> {
        let rows = self.read("find")?;
        let mut selected = Vec::new();
        for doc in rows.iter() {
            if query::matches(doc, filter)? {
                selected.push(doc.clone());
            }
        }
        drop(rows);

        if let Some(sort) = &options.sort {
            query::sort_documents(&mut selected, sort)?;
        }

        let skip = options.skip.unwrap_or(0) as usize;
        // A negative limit means a single batch of |limit| documents
        let limit = match options.limit {
            Some(0) | None => usize::MAX,
            Some(limit) => limit.unsigned_abs() as usize,
        };

        Ok(selected.into_iter().skip(skip).take(limit).collect())
    }

    fn insert_rows(
        &self,
        rows: &mut Vec<BsonDocument>,
        mut document: BsonDocument,
    ) -> StoreResult<Bson> {
        let id = match document.get(ID_FIELD) {
            Some(id) => id.clone(),
            None => {
                let id = Bson::ObjectId(ObjectId::new());
                document.insert(ID_FIELD, id.clone());
                id
            }
        };

        if rows.iter().any(|row| row.get(ID_FIELD) == Some(&id)) {
            return Err(StoreError::DuplicateKey {
                collection: self.name.clone(),
                key: id.to_string(),
            });
        }

        rows.push(document);
        Ok(id)
    }

    fn update_rows(
        &self,
        filter: &BsonDocument,
        update: &BsonDocument,
        options: UpdateOptions,
        multi: bool,
    ) -> StoreResult<UpdateResult> {
        let mut rows = self.write("update")?;
        let mut result = UpdateResult::default();

        for row in rows.iter_mut() {
            if !query::matches(row, filter)? {
                continue;
            }
            // Apply to a copy so a failing operator leaves the row untouched
            let mut updated = row.clone();
            let changed = query::apply_update(&mut updated, update)?;
            result.matched_count += 1;
            if changed {
                *row = updated;
                result.modified_count += 1;
            }
            if !multi {
                break;
            }
        }

        if result.matched_count == 0 && options.upsert {
            let mut seeded = query::upsert_seed(filter)?;
            query::apply_update(&mut seeded, update)?;
            let id = self.insert_rows(&mut rows, seeded)?;
            result.upserted_id = Some(id);
        }

        Ok(result)
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find_one(
        &self,
        filter: BsonDocument,
        options: FindOneOptions,
    ) -> StoreResult<Option<BsonDocument>> {
        self.shared.round_trip().await?;
        let mut found = self.select(&filter, &options.into())?;
        Ok(if found.is_empty() {
            None
        } else {
            Some(found.swap_remove(0))
        })
    }

    async fn find(
        &self,
        filter: BsonDocument,
        options: FindOptions,
    ) -> StoreResult<DocumentStream> {
        self.shared.round_trip().await?;
        let found = self.select(&filter, &options)?;
        Ok(Box::pin(stream::iter(found.into_iter().map(Ok))))
    }

    async fn insert_one(&self, document: BsonDocument) -> StoreResult<InsertOneResult> {
        self.shared.round_trip().await?;
        let mut rows = self.write("insert_one")?;
        let inserted_id = self.insert_rows(&mut rows, document)?;
        Ok(InsertOneResult { inserted_id })
    }

    async fn insert_many(&self, documents: Vec<BsonDocument>) -> StoreResult<InsertManyResult> {
        self.shared.round_trip().await?;
        if documents.is_empty() {
            return Err(StoreError::EmptyBatch {
                operation: "insert_many",
            });
        }

        let mut rows = self.write("insert_many")?;
        let mut result = InsertManyResult::default();
        // Ordered insert: stop at the first failure, keep what went in
        for (index, document) in documents.into_iter().enumerate() {
            let id = self.insert_rows(&mut rows, document)?;
            result.inserted_ids.insert(index, id);
        }
        Ok(result)
    }

    async fn update_one(
        &self,
        filter: BsonDocument,
        update: BsonDocument,
        options: UpdateOptions,
    ) -> StoreResult<UpdateResult> {
        self.shared.round_trip().await?;
        self.update_rows(&filter, &update, options, false)
    }

    async fn update_many(
        &self,
        filter: BsonDocument,
        update: BsonDocument,
        options: UpdateOptions,
    ) -> StoreResult<UpdateResult> {
        self.shared.round_trip().await?;
        self.update_rows(&filter, &update, options, true)
    }

    async fn replace_one(
        &self,
        filter: BsonDocument,
        mut replacement: BsonDocument,
        options: UpdateOptions,
    ) -> StoreResult<UpdateResult> {
        self.shared.round_trip().await?;
        if replacement.keys().any(|key| key.starts_with('$')) {
            return Err(StoreError::InvalidQuery(
                "replacement document must not contain update operators".to_string(),
            ));
        }

        let mut rows = self.write("replace_one")?;
        let mut position = None;
        for (index, row) in rows.iter().enumerate() {
            if query::matches(row, &filter)? {
                position = Some(index);
                break;
            }
        }

        match position {
            Some(index) => {
                let existing_id = rows[index].get(ID_FIELD).cloned();
                let new_id = replacement.get(ID_FIELD).cloned();
                match (new_id, existing_id) {
                    (Some(new_id), Some(old_id)) if new_id != old_id => {
                        return Err(StoreError::ImmutableField {
                            field: ID_FIELD.to_string(),
                        });
                    }
                    (None, Some(old_id)) => {
                        replacement.insert(ID_FIELD, old_id);
                    }
                    _ => {}
                }

                let modified = rows[index] != replacement;
                rows[index] = replacement;
                Ok(UpdateResult {
                    matched_count: 1,
                    modified_count: u64::from(modified),
                    upserted_id: None,
                })
            }
            None if options.upsert => {
                let mut seeded = query::upsert_seed(&filter)?;
                for (key, value) in replacement {
                    seeded.insert(key, value);
                }
                let id = self.insert_rows(&mut rows, seeded)?;
                Ok(UpdateResult {
                    upserted_id: Some(id),
                    ..UpdateResult::default()
                })
            }
            None => Ok(UpdateResult::default()),
        }
    }

    async fn delete_one(&self, filter: BsonDocument) -> StoreResult<DeleteResult> {
        self.shared.round_trip().await?;
        let mut rows = self.write("delete_one")?;
        let mut position = None;
        for (index, row) in rows.iter().enumerate() {
            if query::matches(row, &filter)? {
                position = Some(index);
                break;
            }
        }

        Ok(match position {
            Some(index) => {
                rows.remove(index);
                DeleteResult { deleted_count: 1 }
            }
            None => DeleteResult::default(),
        })
    }

    async fn delete_many(&self, filter: BsonDocument) -> StoreResult<DeleteResult> {
        self.shared.round_trip().await?;
        let mut rows = self.write("delete_many")?;

        let mut keep = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            keep.push(!query::matches(row, &filter)?);
        }

        let before = rows.len();
        let mut flags = keep.into_iter();
        rows.retain(|_| flags.next().unwrap_or(true));

        Ok(DeleteResult {
            deleted_count: (before - rows.len()) as u64,
        })
    }

    async fn bulk_write(&self, models: Vec<WriteModel>) -> StoreResult<BulkWriteResult> {
        run_ordered_bulk_write(self, models).await
    }

    async fn aggregate(&self, pipeline: Vec<BsonDocument>) -> StoreResult<DocumentStream> {
        self.shared.round_trip().await?;
        let snapshot = self.read("aggregate")?.clone();
        let results = query::run_pipeline(snapshot, &pipeline)?;
        Ok(Box::pin(stream::iter(results.into_iter().map(Ok))))
    }

    async fn count_documents(&self, filter: BsonDocument) -> StoreResult<u64> {
        self.shared.round_trip().await?;
        let rows = self.read("count_documents")?;
        let mut count = 0;
        for row in rows.iter() {
            if query::matches(row, &filter)? {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use futures_util::TryStreamExt;

    fn people() -> MemoryCollection {
        MemoryDatabase::new("test").memory_collection("people")
    }

    async fn seed(collection: &MemoryCollection) {
        collection
            .insert_many(vec![
                doc! { "name": "ada", "age": 36 },
                doc! { "name": "bob", "age": 25 },
                doc! { "name": "cy", "age": 41 },
            ])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_collections_are_shared_between_handles() {
        let db = MemoryDatabase::new("test");
        db.memory_collection("items")
            .insert_one(doc! { "x": 1 })
            .await
            .unwrap();

        let again = db.collection("items");
        assert_eq!(again.count_documents(doc! {}).await.unwrap(), 1);
        assert_eq!(db.collection_names(), vec!["items".to_string()]);
    }

    #[tokio::test]
    async fn test_insert_generates_and_enforces_unique_id() {
        let collection = people();
        let result = collection.insert_one(doc! { "name": "ada" }).await.unwrap();
        assert!(matches!(result.inserted_id, Bson::ObjectId(_)));

        let duplicate = doc! { "_id": result.inserted_id.clone(), "name": "other" };
        let err = collection.insert_one(duplicate).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn test_empty_batches_are_rejected() {
        let collection = people();
        let err = collection.insert_many(Vec::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::EmptyBatch { .. }));

        let err = collection.bulk_write(Vec::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::EmptyBatch { .. }));
    }

    #[tokio::test]
    async fn test_find_with_options() {
        let collection = people();
        seed(&collection).await;

        let options = FindOptions::default().sort(doc! { "age": -1 }).skip(1).limit(1);
        let found: Vec<BsonDocument> = collection
            .find(doc! {}, options)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get_str("name").unwrap(), "ada");
    }

    #[tokio::test]
    async fn test_find_one_respects_sort() {
        let collection = people();
        seed(&collection).await;

        let youngest = collection
            .find_one(doc! {}, FindOneOptions::default().sort(doc! { "age": 1 }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(youngest.get_str("name").unwrap(), "bob");

        let none = collection
            .find_one(doc! { "name": "zed" }, FindOneOptions::default())
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_update_one_and_many() {
        let collection = people();
        seed(&collection).await;

        let one = collection
            .update_one(
                doc! { "age": { "$gt": 30 } },
                doc! { "$set": { "senior": true } },
                UpdateOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!((one.matched_count, one.modified_count), (1, 1));

        let many = collection
            .update_many(
                doc! { "age": { "$gt": 30 } },
                doc! { "$set": { "senior": true } },
                UpdateOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!((many.matched_count, many.modified_count), (2, 1));
    }

    #[tokio::test]
    async fn test_failed_update_leaves_row_untouched() {
        let collection = people();
        seed(&collection).await;

        let err = collection
            .update_one(
                doc! { "name": "ada" },
                doc! { "$set": { "nick": "a" }, "$inc": { "name": 1 } },
                UpdateOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidQuery(_)));

        let ada = collection
            .find_one(doc! { "name": "ada" }, FindOneOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert!(!ada.contains_key("nick"));
    }

    #[tokio::test]
    async fn test_update_upsert() {
        let collection = people();
        let result = collection
            .update_one(
                doc! { "name": "dee" },
                doc! { "$set": { "age": 19 } },
                UpdateOptions::upsert(),
            )
            .await
            .unwrap();

        assert_eq!(result.matched_count, 0);
        assert!(result.upserted_id.is_some());

        let dee = collection
            .find_one(doc! { "name": "dee" }, FindOneOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dee.get_i32("age").unwrap(), 19);
    }

    #[tokio::test]
    async fn test_replace_keeps_id() {
        let collection = people();
        let inserted = collection.insert_one(doc! { "name": "ada" }).await.unwrap();

        let result = collection
            .replace_one(
                doc! { "name": "ada" },
                doc! { "name": "ada lovelace" },
                UpdateOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.modified_count, 1);

        let stored = collection
            .find_one(doc! { "name": "ada lovelace" }, FindOneOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.get("_id"), Some(&inserted.inserted_id));

        let err = collection
            .replace_one(
                doc! { "name": "ada lovelace" },
                doc! { "_id": ObjectId::new(), "name": "x" },
                UpdateOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ImmutableField { .. }));
    }

    #[tokio::test]
    async fn test_delete_one_and_many() {
        let collection = people();
        seed(&collection).await;

        let one = collection.delete_one(doc! { "age": { "$gt": 30 } }).await.unwrap();
        assert_eq!(one.deleted_count, 1);

        let many = collection.delete_many(doc! {}).await.unwrap();
        assert_eq!(many.deleted_count, 2);
        assert_eq!(collection.count_documents(doc! {}).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bulk_write_ordered() {
        let collection = people();
        let result = collection
            .bulk_write(vec![
                WriteModel::insert_one(doc! { "name": "ada", "age": 36 }),
                WriteModel::insert_one(doc! { "name": "bob", "age": 25 }),
                WriteModel::update_many(doc! {}, doc! { "$inc": { "age": 1 } }),
                WriteModel::delete_one(doc! { "name": "bob" }),
            ])
            .await
            .unwrap();

        assert_eq!(result.inserted_count, 2);
        assert_eq!(result.matched_count, 2);
        assert_eq!(result.modified_count, 2);
        assert_eq!(result.deleted_count, 1);
        assert_eq!(collection.count_documents(doc! { "age": 37 }).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_aggregate() {
        let collection = people();
        seed(&collection).await;

        let out: Vec<BsonDocument> = collection
            .aggregate(vec![
                doc! { "$match": { "age": { "$gte": 30 } } },
                doc! { "$count": "n" },
            ])
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(out, vec![doc! { "n": 2 }]);
    }

    #[tokio::test]
    async fn test_unreachable_database() {
        let db = MemoryDatabase::new("test");
        db.set_reachable(false);

        assert!(matches!(db.ping().await, Err(StoreError::Unreachable(_))));
        let err = db.collection("x").count_documents(doc! {}).await.unwrap_err();
        assert!(matches!(err, StoreError::Unreachable(_)));

        db.set_reachable(true);
        assert!(db.ping().await.is_ok());
    }
}
