//! Query language evaluation for the in-memory backend
//!
//! Implements the subset of the MongoDB query language the repository and
//! its callers rely on:
//!
//! - Filters: field equality (dotted paths, array membership), `$eq`, `$ne`,
//!   `$gt`, `$gte`, `$lt`, `$lte`, `$in`, `$nin`, `$exists`, and top-level
//!   `$and`, `$or`, `$nor`
//! - Updates: `$set`, `$unset`, `$inc`, `$currentDate`
//! - Aggregation stages: `$match`, `$sort`, `$skip`, `$limit`, `$count`,
//!   `$project`
//!
//! Anything else fails with [`StoreError::Unsupported`].

use std::cmp::Ordering;

use bson::{Bson, Document as BsonDocument};

use crate::document::ID_FIELD;
use crate::error::{StoreError, StoreResult};

/// Whether `doc` satisfies `filter`
pub fn matches(doc: &BsonDocument, filter: &BsonDocument) -> StoreResult<bool> {
    for (key, condition) in filter {
        let satisfied = match key.as_str() {
            "$and" => logical_branches(key, condition)?
                .iter()
                .map(|branch| matches(doc, branch))
                .collect::<StoreResult<Vec<_>>>()?
                .into_iter()
                .all(|hit| hit),
            "$or" => logical_branches(key, condition)?
                .iter()
                .map(|branch| matches(doc, branch))
                .collect::<StoreResult<Vec<_>>>()?
                .into_iter()
                .any(|hit| hit),
            "$nor" => !logical_branches(key, condition)?
                .iter()
                .map(|branch| matches(doc, branch))
                .collect::<StoreResult<Vec<_>>>()?
                .into_iter()
                .any(|hit| hit),
            op if op.starts_with('$') => {
                return Err(StoreError::Unsupported(format!("top-level {}", op)))
            }
            path => matches_condition(lookup(doc, path), condition)?,
        };

        if !satisfied {
            return Ok(false);
        }
    }

    Ok(true)
}

fn logical_branches<'a>(op: &str, condition: &'a Bson) -> StoreResult<Vec<&'a BsonDocument>> {
    let Bson::Array(items) = condition else {
        return Err(StoreError::InvalidQuery(format!("{} needs an array", op)));
    };
    if items.is_empty() {
        return Err(StoreError::InvalidQuery(format!(
            "{} needs a non-empty array",
            op
        )));
    }

    items
        .iter()
        .map(|item| match item {
            Bson::Document(branch) => Ok(branch),
            _ => Err(StoreError::InvalidQuery(format!(
                "{} entries must be documents",
                op
            ))),
        })
        .collect()
}

/// Resolve a dotted path such as `address.city`
pub fn lookup<'a>(doc: &'a BsonDocument, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;

    for segment in segments {
        current = match current {
            Bson::Document(inner) => inner.get(segment)?,
            Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

fn is_operator_document(condition: &Bson) -> Option<&BsonDocument> {
    match condition {
        Bson::Document(inner) if !inner.is_empty() && inner.keys().all(|k| k.starts_with('$')) => {
            Some(inner)
        }
        _ => None,
    }
}

fn matches_condition(value: Option<&Bson>, condition: &Bson) -> StoreResult<bool> {
    let Some(operators) = is_operator_document(condition) else {
        return Ok(equals(value, condition));
    };

    for (op, operand) in operators {
        let satisfied = match op.as_str() {
            "$eq" => equals(value, operand),
            "$ne" => !equals(value, operand),
            "$gt" => compares(value, operand, |ord| ord == Ordering::Greater),
            "$gte" => compares(value, operand, |ord| ord != Ordering::Less),
            "$lt" => compares(value, operand, |ord| ord == Ordering::Less),
            "$lte" => compares(value, operand, |ord| ord != Ordering::Greater),
            "$in" => in_list(value, op, operand)?,
            "$nin" => !in_list(value, op, operand)?,
            "$exists" => value.is_some() == truthy(operand),
            other => return Err(StoreError::Unsupported(other.to_string())),
        };

        if !satisfied {
            return Ok(false);
        }
    }

    Ok(true)
}

fn in_list(value: Option<&Bson>, op: &str, operand: &Bson) -> StoreResult<bool> {
    let Bson::Array(candidates) = operand else {
        return Err(StoreError::InvalidQuery(format!("{} needs an array", op)));
    };
    Ok(candidates.iter().any(|candidate| equals(value, candidate)))
}

/// Equality with array membership and null-matches-missing semantics
fn equals(value: Option<&Bson>, expected: &Bson) -> bool {
    match value {
        None => matches!(expected, Bson::Null),
        Some(actual) => {
            if same_value(actual, expected) {
                return true;
            }
            match actual {
                Bson::Array(items) => items.iter().any(|item| same_value(item, expected)),
                _ => false,
            }
        }
    }
}

fn compares(value: Option<&Bson>, operand: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    match value {
        None => false,
        Some(Bson::Array(items)) if !matches!(operand, Bson::Array(_)) => items
            .iter()
            .any(|item| compare_same_kind(item, operand).map(&accept).unwrap_or(false)),
        Some(actual) => compare_same_kind(actual, operand)
            .map(accept)
            .unwrap_or(false),
    }
}

/// Value equality where numbers compare across integer and double types
pub fn same_value(a: &Bson, b: &Bson) -> bool {
    match (number(a), number(b)) {
        (Some(x), Some(y)) => x.cmp_with(&y) == Ordering::Equal,
        _ => a == b,
    }
}

#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn cmp_with(&self, other: &Number) -> Ordering {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a.cmp(b),
            _ => self
                .as_f64()
                .partial_cmp(&other.as_f64())
                .unwrap_or(Ordering::Equal),
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            Number::Int(v) => *v as f64,
            Number::Float(v) => *v,
        }
    }
}

fn number(value: &Bson) -> Option<Number> {
    match value {
        Bson::Int32(v) => Some(Number::Int(i64::from(*v))),
        Bson::Int64(v) => Some(Number::Int(*v)),
        Bson::Double(v) => Some(Number::Float(*v)),
        _ => None,
    }
}

/// Read an integral number (used for `$skip`, `$limit`, sort directions)
pub fn as_i64(value: &Bson) -> Option<i64> {
    match number(value)? {
        Number::Int(v) => Some(v),
        Number::Float(v) if v.fract() == 0.0 => Some(v as i64),
        Number::Float(_) => None,
    }
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(flag) => *flag,
        Bson::Null => false,
        other => number(other).map(|n| n.as_f64() != 0.0).unwrap_or(true),
    }
}

/// Comparison between values of the same kind; `None` when not comparable
fn compare_same_kind(a: &Bson, b: &Bson) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (number(a), number(b)) {
        return Some(x.cmp_with(&y));
    }

    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.bytes().cmp(&y.bytes())),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            Some((x.time, x.increment).cmp(&(y.time, y.increment)))
        }
        (Bson::Null, Bson::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Canonical BSON sort rank for values of different kinds
fn type_rank(value: Option<&Bson>) -> u8 {
    match value {
        None | Some(Bson::Null) | Some(Bson::Undefined) => 1,
        Some(Bson::Int32(_)) | Some(Bson::Int64(_)) | Some(Bson::Double(_)) => 2,
        Some(Bson::Decimal128(_)) => 2,
        Some(Bson::String(_)) | Some(Bson::Symbol(_)) => 3,
        Some(Bson::Document(_)) => 4,
        Some(Bson::Array(_)) => 5,
        Some(Bson::Binary(_)) => 6,
        Some(Bson::ObjectId(_)) => 7,
        Some(Bson::Boolean(_)) => 8,
        Some(Bson::DateTime(_)) => 9,
        Some(Bson::Timestamp(_)) => 10,
        Some(Bson::RegularExpression(_)) => 11,
        Some(_) => 12,
    }
}

fn total_order(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Some(x), Some(y)) => compare_same_kind(x, y).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    }
}

/// Sort documents by a `{ field: 1 | -1, ... }` specification (stable)
pub fn sort_documents(docs: &mut [BsonDocument], spec: &BsonDocument) -> StoreResult<()> {
    let keys = spec
        .iter()
        .map(|(field, direction)| match as_i64(direction) {
            Some(1) => Ok((field.as_str(), false)),
            Some(-1) => Ok((field.as_str(), true)),
            _ => Err(StoreError::InvalidQuery(format!(
                "sort direction for '{}' must be 1 or -1",
                field
            ))),
        })
        .collect::<StoreResult<Vec<_>>>()?;

    docs.sort_by(|a, b| {
        for (field, descending) in &keys {
            let ord = total_order(lookup(a, field), lookup(b, field));
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });

    Ok(())
}

/// Apply an update document in place; returns whether anything changed
pub fn apply_update(doc: &mut BsonDocument, update: &BsonDocument) -> StoreResult<bool> {
    if update.is_empty() {
        return Err(StoreError::InvalidQuery("update document is empty".to_string()));
    }

    let before = doc.clone();

    for (op, fields) in update {
        let Bson::Document(fields) = fields else {
            return Err(StoreError::InvalidQuery(format!(
                "update operator {} needs a document, or update lacks operators",
                op
            )));
        };

        for (path, value) in fields {
            if path == ID_FIELD {
                return Err(StoreError::ImmutableField {
                    field: ID_FIELD.to_string(),
                });
            }

            match op.as_str() {
                "$set" => set_path(doc, path, value.clone())?,
                "$unset" => {
                    remove_path(doc, path);
                }
                "$inc" => increment(doc, path, value)?,
                "$currentDate" => set_path(doc, path, current_date(path, value)?)?,
                other if other.starts_with('$') => {
                    return Err(StoreError::Unsupported(other.to_string()))
                }
                other => {
                    return Err(StoreError::InvalidQuery(format!(
                        "update field '{}' is not an operator",
                        other
                    )))
                }
            }
        }
    }

    Ok(*doc != before)
}

fn current_date(path: &str, spec: &Bson) -> StoreResult<Bson> {
    let now = Bson::DateTime(bson::DateTime::now());
    match spec {
        Bson::Boolean(true) => Ok(now),
        Bson::Document(inner) => match inner.get_str("$type") {
            Ok("date") => Ok(now),
            _ => Err(StoreError::Unsupported(format!(
                "$currentDate type for '{}'",
                path
            ))),
        },
        _ => Err(StoreError::InvalidQuery(format!(
            "$currentDate for '{}' must be true or a $type document",
            path
        ))),
    }
}

fn increment(doc: &mut BsonDocument, path: &str, by: &Bson) -> StoreResult<()> {
    let by_number = number(by).ok_or_else(|| {
        StoreError::InvalidQuery(format!("$inc for '{}' needs a number", path))
    })?;

    let next = match lookup(doc, path) {
        None => by.clone(),
        Some(current) => {
            let current_number = number(current).ok_or_else(|| {
                StoreError::InvalidQuery(format!("cannot $inc non-numeric field '{}'", path))
            })?;
            add_numbers(current, current_number, by, by_number)
        }
    };

    set_path(doc, path, next)
}

fn add_numbers(current: &Bson, a: Number, by: &Bson, b: Number) -> Bson {
    match (current, by, a, b) {
        (Bson::Int32(x), Bson::Int32(y), _, _) => match x.checked_add(*y) {
            Some(sum) => Bson::Int32(sum),
            None => Bson::Int64(i64::from(*x) + i64::from(*y)),
        },
        (_, _, Number::Int(x), Number::Int(y)) => Bson::Int64(x.saturating_add(y)),
        (_, _, x, y) => Bson::Double(x.as_f64() + y.as_f64()),
    }
}

/// Set a dotted path, creating intermediate documents
pub fn set_path(doc: &mut BsonDocument, path: &str, value: Bson) -> StoreResult<()> {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            let child = doc
                .entry(head.to_string())
                .or_insert_with(|| Bson::Document(BsonDocument::new()));
            match child {
                Bson::Document(inner) => set_path(inner, rest, value),
                _ => Err(StoreError::InvalidQuery(format!(
                    "cannot create field '{}' inside non-document '{}'",
                    rest, head
                ))),
            }
        }
    }
}

fn remove_path(doc: &mut BsonDocument, path: &str) -> Option<Bson> {
    match path.split_once('.') {
        None => doc.remove(path),
        Some((head, rest)) => match doc.get_mut(head) {
            Some(Bson::Document(inner)) => remove_path(inner, rest),
            _ => None,
        },
    }
}

/// Fields an upsert copies from the filter into the new document
pub fn upsert_seed(filter: &BsonDocument) -> StoreResult<BsonDocument> {
    let mut seed = BsonDocument::new();

    for (key, condition) in filter {
        if key.starts_with('$') {
            continue;
        }
        match is_operator_document(condition) {
            None => set_path(&mut seed, key, condition.clone())?,
            Some(operators) => {
                if let Some(value) = operators.get("$eq") {
                    set_path(&mut seed, key, value.clone())?;
                }
            }
        }
    }

    Ok(seed)
}

/// Apply an inclusion or exclusion projection
pub fn project(doc: &BsonDocument, spec: &BsonDocument) -> StoreResult<BsonDocument> {
    let include_id = spec.get(ID_FIELD).map(truthy).unwrap_or(true);
    let fields: Vec<(&str, bool)> = spec
        .iter()
        .filter(|(key, _)| key.as_str() != ID_FIELD)
        .map(|(key, value)| (key.as_str(), truthy(value)))
        .collect();

    let inclusions = fields.iter().filter(|(_, keep)| *keep).count();
    if inclusions != 0 && inclusions != fields.len() {
        return Err(StoreError::InvalidQuery(
            "projection cannot mix inclusion and exclusion".to_string(),
        ));
    }

    if inclusions > 0 {
        let mut projected = BsonDocument::new();
        if include_id {
            if let Some(id) = doc.get(ID_FIELD) {
                projected.insert(ID_FIELD, id.clone());
            }
        }
        for (path, _) in fields {
            if let Some(value) = lookup(doc, path) {
                set_path(&mut projected, path, value.clone())?;
            }
        }
        Ok(projected)
    } else {
        let mut projected = doc.clone();
        if !include_id {
            projected.remove(ID_FIELD);
        }
        for (path, _) in fields {
            remove_path(&mut projected, path);
        }
        Ok(projected)
    }
}

/// Run an aggregation pipeline over a snapshot of documents
pub fn run_pipeline(
    mut docs: Vec<BsonDocument>,
    pipeline: &[BsonDocument],
) -> StoreResult<Vec<BsonDocument>> {
    for stage in pipeline {
        let mut entries = stage.iter();
        let (Some((name, spec)), None) = (entries.next(), entries.next()) else {
            return Err(StoreError::InvalidQuery(
                "pipeline stage must have exactly one field".to_string(),
            ));
        };

        docs = match (name.as_str(), spec) {
            ("$match", Bson::Document(filter)) => {
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches(&doc, filter)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            ("$sort", Bson::Document(sort)) => {
                sort_documents(&mut docs, sort)?;
                docs
            }
            ("$skip", amount) => {
                let skip = non_negative(name, amount)?;
                docs.into_iter().skip(skip).collect()
            }
            ("$limit", amount) => {
                let limit = non_negative(name, amount)?;
                docs.into_iter().take(limit).collect()
            }
            ("$count", Bson::String(field)) => {
                let count = docs.len() as i64;
                let value = i32::try_from(count)
                    .map(Bson::Int32)
                    .unwrap_or(Bson::Int64(count));
                if count == 0 {
                    Vec::new()
                } else {
                    let mut out = BsonDocument::new();
                    out.insert(field.clone(), value);
                    vec![out]
                }
            }
            ("$project", Bson::Document(projection)) => docs
                .iter()
                .map(|doc| project(doc, projection))
                .collect::<StoreResult<Vec<_>>>()?,
            (stage @ ("$match" | "$sort" | "$count" | "$project"), _) => {
                return Err(StoreError::InvalidQuery(format!(
                    "malformed {} stage",
                    stage
                )))
            }
            (other, _) => return Err(StoreError::Unsupported(other.to_string())),
        };
    }

    Ok(docs)
}

fn non_negative(stage: &str, amount: &Bson) -> StoreResult<usize> {
    as_i64(amount)
        .and_then(|value| usize::try_from(value).ok())
        .ok_or_else(|| {
            StoreError::InvalidQuery(format!("{} needs a non-negative integer", stage))
        })
}
