//! DocRepo Core Library
//!
//! Typed repositories over a MongoDB-style document store.
//!
//! ## Architecture
//!
//! - [`Store`] connects to a store and binds one logical database
//! - [`Repository`] wraps one collection for one [`Document`] type and
//!   stamps identifiers and timestamps on writes
//! - [`filter`] builds query filters from composable options
//! - [`Context`] bounds every repository call with a deadline and
//!   cancellation
//! - [`backend`] holds the store client seam: an in-memory store and, with
//!   the `mongodb` feature, the official driver
//!
//! ## Usage
//!
//! ```ignore
//! use docrepo_core::{Context, DocumentRepository, Store, StoreOptions};
//! use docrepo_core::filter::id_filter;
//!
//! let store = Store::open("mongodb://localhost:27017", "app", StoreOptions::new()).await?;
//! let repo = store.repository::<User>("users");
//!
//! let ctx = Context::with_timeout(Duration::from_secs(2));
//! let user = repo.insert_one(&ctx, User::new("ada")).await?;
//! let same = repo.find_one(&ctx, id_filter(user.id().unwrap())).await?;
//!
//! store.close().await?;
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod document;
pub mod error;
pub mod filter;
pub mod repository;
pub mod store;

pub use backend::{
    BulkWriteResult, Collection, Database, DeleteResult, DocumentStream, FindOneOptions,
    FindOptions, MemoryDatabase, UpdateOptions, UpdateResult, WriteModel,
};
pub use config::StoreConfig;
pub use context::{CancelHandle, Context};
pub use document::{BaseModel, Document, Model};
pub use error::{RepoError, RepoResult, StoreError, StoreResult};
pub use filter::{new_filter, FilterBuilder, FilterOption};
pub use repository::{AggregateStream, DocumentRepository, Repository};
pub use store::{Store, StoreOptions};
