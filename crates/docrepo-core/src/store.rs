//! Store handle
//!
//! A [`Store`] owns the connection to a document store and is bound to one
//! logical database. Collections and repositories are obtained from it.
//!
//! ## Usage
//!
//! ```ignore
//! let store = Store::open(
//!     "mongodb://localhost:27017",
//!     "app",
//!     StoreOptions::new().with_timeout(Duration::from_secs(5)),
//! )
//! .await?;
//!
//! let users = store.repository::<User>("users");
//! let user = users.insert_one(store.context(), user).await?;
//!
//! store.close().await?;
//! ```
//!
//! `close` consumes the handle, so it runs at most once and nothing can use
//! the handle afterwards.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::backend::{Collection, Database, MemoryDatabase};
use crate::config::StoreConfig;
use crate::context::{CancelHandle, Context};
use crate::document::Document;
use crate::error::{RepoError, RepoResult};
use crate::repository::Repository;

/// Default time allowed for connecting and the liveness check
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// How a [`Store`] is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    timeout: Duration,
    use_ping: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            use_ping: true,
        }
    }
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the connection attempt; a zero duration keeps the current value
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.timeout = timeout;
        }
        self
    }

    /// Whether to verify reachability while opening
    pub fn with_use_ping(mut self, use_ping: bool) -> Self {
        self.use_ping = use_ping;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn use_ping(&self) -> bool {
        self.use_ping
    }
}

/// Handle to a logical database within a document store
pub struct Store {
    database: Arc<dyn Database>,
    uri: String,
    options: StoreOptions,
    /// Lives as long as the connection; cancelled by `close`
    context: Context,
    cancel: CancelHandle,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("uri", &self.uri)
            .field("database", &self.database.name())
            .field("options", &self.options)
            .finish()
    }
}

impl Store {
    /// Connect to the store at `uri` and bind to `database`
    ///
    /// Supported schemes:
    /// - `mongodb://`, `mongodb+srv://` (requires the `mongodb` feature)
    /// - `memory://` (a fresh in-process database)
    ///
    /// Connecting and the optional liveness check share one timeout window.
    pub async fn open(uri: &str, database: &str, options: StoreOptions) -> RepoResult<Self> {
        let display_uri = redact_uri(uri);
        info!("Opening database '{}' at {}", database, display_uri);

        let deadline = Instant::now() + options.timeout;
        let backend = match timeout_at(deadline, connect_backend(uri, database, options.timeout)).await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!("Connecting to {} timed out", display_uri);
                return Err(RepoError::ConnectTimeout {
                    uri: display_uri,
                    timeout: options.timeout,
                });
            }
        };

        Self::bind(backend, display_uri, options, deadline).await
    }

    /// Open using a [`StoreConfig`]
    pub async fn open_with_config(config: &StoreConfig) -> RepoResult<Self> {
        Self::open(&config.uri, &config.database, config.to_options()).await
    }

    /// Bind an already constructed backend
    ///
    /// The liveness check still runs when enabled.
    pub async fn connect_with(database: Arc<dyn Database>, options: StoreOptions) -> RepoResult<Self> {
        let uri = format!("in-process:{}", database.name());
        let deadline = Instant::now() + options.timeout;
        Self::bind(database, uri, options, deadline).await
    }

    async fn bind(
        database: Arc<dyn Database>,
        uri: String,
        options: StoreOptions,
        deadline: Instant,
    ) -> RepoResult<Self> {
        if options.use_ping {
            let failure = match timeout_at(deadline, database.ping()).await {
                Ok(Ok(())) => {
                    debug!("Liveness check passed for {}", uri);
                    None
                }
                Ok(Err(e)) => {
                    warn!("Liveness check failed for {}: {}", uri, e);
                    Some(RepoError::Connection {
                        uri: uri.clone(),
                        reason: e.to_string(),
                    })
                }
                Err(_) => {
                    warn!("Liveness check timed out for {}", uri);
                    Some(RepoError::ConnectTimeout {
                        uri: uri.clone(),
                        timeout: options.timeout,
                    })
                }
            };

            if let Some(err) = failure {
                release(database.as_ref(), &uri, options.timeout).await;
                return Err(err);
            }
        }

        let (context, cancel) = Context::background().with_cancel();
        info!("Connected to database '{}'", database.name());

        Ok(Self {
            database,
            uri,
            options,
            context,
            cancel,
        })
    }

    /// The bound database
    pub fn database(&self) -> &Arc<dyn Database> {
        &self.database
    }

    pub fn database_name(&self) -> &str {
        self.database.name()
    }

    /// Connection URI with credentials removed
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn options(&self) -> StoreOptions {
        self.options
    }

    /// Context that stays live until the handle is closed
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Handle to a named collection
    pub fn collection(&self, name: &str) -> Arc<dyn Collection> {
        self.database.collection(name)
    }

    /// Typed repository over a named collection
    pub fn repository<T: Document>(&self, name: &str) -> Repository<T> {
        Repository::new(self.collection(name))
    }

    /// Release the connection
    ///
    /// Operations still running under [`Store::context`] are cancelled.
    pub async fn close(self) -> RepoResult<()> {
        self.cancel.cancel();

        let name = self.database.name().to_string();
        self.database.shutdown().await.map_err(|source| {
            warn!("Failed to disconnect from '{}': {}", name, source);
            RepoError::Disconnect {
                database: name.clone(),
                source,
            }
        })?;

        info!("Closed database '{}'", name);
        Ok(())
    }
}

/// Shut down a backend that failed to come up, bounded by `timeout`
async fn release(database: &dyn Database, uri: &str, timeout: Duration) {
    match tokio::time::timeout(timeout, database.shutdown()).await {
        Ok(Ok(())) => debug!("Released connection to {}", uri),
        Ok(Err(e)) => warn!("Failed to release connection to {}: {}", uri, e),
        Err(_) => warn!("Releasing connection to {} timed out", uri),
    }
}

async fn connect_backend(
    uri: &str,
    database: &str,
    timeout: Duration,
) -> RepoResult<Arc<dyn Database>> {
    let scheme = uri.split_once("://").map(|(scheme, _)| scheme);

    match scheme {
        Some("memory") => Ok(Arc::new(MemoryDatabase::new(database))),
        Some("mongodb") | Some("mongodb+srv") => connect_mongo(uri, database, timeout).await,
        _ => Err(RepoError::Connection {
            uri: redact_uri(uri),
            reason: "unsupported URI scheme".to_string(),
        }),
    }
}

#[cfg(feature = "mongodb")]
async fn connect_mongo(
    uri: &str,
    database: &str,
    timeout: Duration,
) -> RepoResult<Arc<dyn Database>> {
    crate::backend::mongo::MongoDatabase::connect(uri, database, timeout)
        .await
        .map(|db| Arc::new(db) as Arc<dyn Database>)
        .map_err(|e| RepoError::Connection {
            uri: redact_uri(uri),
            reason: e.to_string(),
        })
}

#[cfg(not(feature = "mongodb"))]
async fn connect_mongo(
    uri: &str,
    _database: &str,
    _timeout: Duration,
) -> RepoResult<Arc<dyn Database>> {
    Err(RepoError::Connection {
        uri: redact_uri(uri),
        reason: "MongoDB support is not compiled in (enable the `mongodb` feature)".to_string(),
    })
}

/// Strip `user:password@` from a connection URI
fn redact_uri(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };

    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://***@{}", scheme, &rest[at + 1..]),
        None => uri.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bson::doc;

    use crate::error::{StoreError, StoreResult};

    #[test]
    fn test_options_defaults() {
        let options = StoreOptions::new();
        assert_eq!(options.timeout(), Duration::from_secs(10));
        assert!(options.use_ping());
    }

    #[test]
    fn test_zero_timeout_is_ignored() {
        let options = StoreOptions::new()
            .with_timeout(Duration::from_secs(3))
            .with_timeout(Duration::ZERO);
        assert_eq!(options.timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_redact_uri() {
        assert_eq!(
            redact_uri("mongodb://user:secret@db:27017/app"),
            "mongodb://***@db:27017/app"
        );
        assert_eq!(redact_uri("mongodb://db:27017"), "mongodb://db:27017");
        assert_eq!(redact_uri("not a uri"), "not a uri");
    }

    #[tokio::test]
    async fn test_open_memory_store() {
        let store = Store::open("memory://local", "app", StoreOptions::new())
            .await
            .unwrap();
        assert_eq!(store.database_name(), "app");
        assert_eq!(store.uri(), "memory://local");

        let collection = store.collection("things");
        collection.insert_one(doc! { "x": 1 }).await.unwrap();
        assert_eq!(
            store
                .collection("things")
                .count_documents(doc! {})
                .await
                .unwrap(),
            1
        );

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_with_config() {
        let config = StoreConfig {
            uri: "memory://configured".to_string(),
            database: "configured".to_string(),
            timeout_secs: 1,
            use_ping: true,
        };
        let store = Store::open_with_config(&config).await.unwrap();
        assert_eq!(store.database_name(), "configured");
        assert_eq!(store.options().timeout(), Duration::from_secs(1));
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let err = Store::open("redis://localhost", "app", StoreOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Connection { .. }));
    }

    #[cfg(not(feature = "mongodb"))]
    #[tokio::test]
    async fn test_mongodb_without_feature() {
        let err = Store::open("mongodb://u:p@localhost:27017", "app", StoreOptions::new())
            .await
            .unwrap_err();
        match err {
            RepoError::Connection { uri, reason } => {
                assert_eq!(uri, "mongodb://***@localhost:27017");
                assert!(reason.contains("mongodb"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_liveness_check_failure() {
        let db = MemoryDatabase::new("app");
        db.set_reachable(false);

        let err = Store::connect_with(Arc::new(db.clone()), StoreOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_connection_error());

        // Without the check the handle opens anyway
        let store = Store::connect_with(Arc::new(db), StoreOptions::new().with_use_ping(false))
            .await
            .unwrap();
        assert_eq!(store.database_name(), "app");
    }

    #[tokio::test]
    async fn test_liveness_check_timeout() {
        let db = MemoryDatabase::new("slow");
        db.set_latency(Some(Duration::from_secs(5)));

        let options = StoreOptions::new().with_timeout(Duration::from_millis(20));
        let err = Store::connect_with(Arc::new(db), options).await.unwrap_err();
        assert!(matches!(err, RepoError::ConnectTimeout { .. }));
    }

    #[tokio::test]
    async fn test_close_cancels_lifetime_context() {
        let store = Store::open("memory://", "app", StoreOptions::new()).await.unwrap();
        let ctx = store.context().clone();
        assert!(!ctx.is_cancelled());

        store.close().await.unwrap();
        assert!(ctx.is_cancelled());
    }

    struct FailingShutdown;

    #[async_trait]
    impl Database for FailingShutdown {
        fn name(&self) -> &str {
            "failing"
        }

        fn collection(&self, name: &str) -> Arc<dyn Collection> {
            MemoryDatabase::new("failing").collection(name)
        }

        async fn ping(&self) -> StoreResult<()> {
            Ok(())
        }

        async fn shutdown(&self) -> StoreResult<()> {
            Err(StoreError::Unreachable("connection reset".to_string()))
        }
    }

    #[tokio::test]
    async fn test_close_failure_is_disconnect_error() {
        let store = Store::connect_with(Arc::new(FailingShutdown), StoreOptions::new())
            .await
            .unwrap();

        let err = store.close().await.unwrap_err();
        assert!(matches!(err, RepoError::Disconnect { .. }));
        assert!(err.to_string().contains("failing"));
    }

    /// Backend whose liveness check fails or never answers
    struct TrackedDatabase {
        hang_ping: bool,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Database for TrackedDatabase {
        fn name(&self) -> &str {
            "tracked"
        }

        fn collection(&self, name: &str) -> Arc<dyn Collection> {
            MemoryDatabase::new("tracked").collection(name)
        }

        async fn ping(&self) -> StoreResult<()> {
            if self.hang_ping {
                std::future::pending::<()>().await;
            }
            Err(StoreError::Unreachable("connection refused".to_string()))
        }

        async fn shutdown(&self) -> StoreResult<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unreachable("already gone".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_liveness_check_releases_backend() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let db = TrackedDatabase {
            hang_ping: false,
            shutdowns: Arc::clone(&shutdowns),
        };

        let err = Store::connect_with(Arc::new(db), StoreOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Connection { .. }));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timed_out_liveness_check_releases_backend() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let db = TrackedDatabase {
            hang_ping: true,
            shutdowns: Arc::clone(&shutdowns),
        };

        let options = StoreOptions::new().with_timeout(Duration::from_millis(20));
        let err = Store::connect_with(Arc::new(db), options).await.unwrap_err();
        assert!(matches!(err, RepoError::ConnectTimeout { .. }));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }
}
