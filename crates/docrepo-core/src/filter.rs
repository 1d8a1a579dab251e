//! Query filter construction
//!
//! A filter is a `bson::Document` built by applying options in order:
//!
//! ```ignore
//! let filter = FilterBuilder::new()
//!     .with(with_field("companyId", company_id))
//!     .with(with_in("status", ["open", "pending"]))
//!     .build();
//! ```
//!
//! Later options overwrite earlier ones for the same key. A filter built
//! from no options matches every document, which is why deletes refuse it.

use bson::oid::ObjectId;
use bson::{doc, Bson, Document as BsonDocument};

use crate::document::ID_FIELD;

/// A building block applied to a filter under construction
pub trait FilterOption {
    fn apply(&self, filter: &mut BsonDocument);
}

impl<F> FilterOption for F
where
    F: Fn(&mut BsonDocument),
{
    fn apply(&self, filter: &mut BsonDocument) {
        self(filter)
    }
}

/// Build a filter from a sequence of options
pub fn new_filter(options: &[&dyn FilterOption]) -> BsonDocument {
    options
        .iter()
        .fold(FilterBuilder::new(), |builder, option| builder.apply(*option))
        .build()
}

/// Accumulates filter options
#[derive(Debug, Clone, Default)]
pub struct FilterBuilder {
    filter: BsonDocument,
}

impl FilterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an option
    pub fn with(mut self, option: impl FilterOption) -> Self {
        option.apply(&mut self.filter);
        self
    }

    fn apply(mut self, option: &dyn FilterOption) -> Self {
        option.apply(&mut self.filter);
        self
    }

    pub fn build(self) -> BsonDocument {
        self.filter
    }
}

/// Match a document by identifier
#[derive(Debug, Clone, Copy)]
pub struct WithId(ObjectId);

impl FilterOption for WithId {
    fn apply(&self, filter: &mut BsonDocument) {
        filter.insert(ID_FIELD, self.0);
    }
}

pub fn with_id(id: ObjectId) -> WithId {
    WithId(id)
}

/// Match a field by equality
#[derive(Debug, Clone)]
pub struct WithField {
    key: String,
    value: Bson,
}

impl FilterOption for WithField {
    fn apply(&self, filter: &mut BsonDocument) {
        filter.insert(self.key.clone(), self.value.clone());
    }
}

pub fn with_field(key: impl Into<String>, value: impl Into<Bson>) -> WithField {
    WithField {
        key: key.into(),
        value: value.into(),
    }
}

/// Match a field against any of several values
#[derive(Debug, Clone)]
pub struct WithIn {
    key: String,
    condition: BsonDocument,
}

impl FilterOption for WithIn {
    fn apply(&self, filter: &mut BsonDocument) {
        filter.insert(self.key.clone(), self.condition.clone());
    }
}

pub fn with_in<I, V>(key: impl Into<String>, values: I) -> WithIn
where
    I: IntoIterator<Item = V>,
    V: Into<Bson>,
{
    WithIn {
        key: key.into(),
        condition: in_values(values),
    }
}

/// Filter matching exactly one identifier
pub fn id_filter(id: ObjectId) -> BsonDocument {
    FilterBuilder::new().with(with_id(id)).build()
}

/// An `$in` condition for the given values
///
/// The result is a field condition, not a top-level filter:
///
/// ```ignore
/// repo.update_many(&ctx, doc! { "_id": in_values(ids) }, doc! { "isFinished": true }).await?;
/// ```
pub fn in_values<I, V>(values: I) -> BsonDocument
where
    I: IntoIterator<Item = V>,
    V: Into<Bson>,
{
    let values: Vec<Bson> = values.into_iter().map(Into::into).collect();
    doc! { "$in": values }
}

/// A non-empty filter matching every stored document
///
/// Use this instead of an empty filter when a delete really is meant to
/// clear the whole collection.
pub fn match_all() -> BsonDocument {
    doc! { ID_FIELD: { "$exists": true } }
}
