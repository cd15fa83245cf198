//! PostgreSQL storage backend.
//!
//! One table per metric kind, keyed by a unique name:
//!
//! ```text
//! <prefix>_counters (id BIGSERIAL PRIMARY KEY, name TEXT UNIQUE, value BIGINT)
//! <prefix>_gauges   (id BIGSERIAL PRIMARY KEY, name TEXT UNIQUE, value DOUBLE PRECISION)
//! ```
//!
//! Writes are upserts. A counter upsert adds the delta to the stored value inside the
//! statement, so concurrent increments for one name are serialized by the row lock.
//! [`tx`](crate::storage::MetricsStorage::tx) runs every op on one pooled connection
//! inside a native transaction and rolls back on the first failure.
//!
//! The first connection is acquired through
//! [`retry_connection`](crate::storage::resilience::retry_connection); migrations run
//! before [`PostgresStorage::connect`] returns.

use crate::storage::resilience::ConnectionRetryConfig;
use crate::{Error, Result};

/// Default maximum connections in the pool.
pub const DEFAULT_POOL_MAX_SIZE: usize = 20;

/// Default table prefix.
pub const DEFAULT_TABLE_PREFIX: &str = "metrics";

/// Connection options for [`PostgresStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresOptions {
    /// Prefix for every table this backend creates.
    pub table_prefix: String,
    /// Maximum connections in the pool.
    pub pool_max_size: usize,
    /// Retry policy for the first connection.
    pub retry: ConnectionRetryConfig,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            pool_max_size: DEFAULT_POOL_MAX_SIZE,
            retry: ConnectionRetryConfig::default(),
        }
    }
}

impl PostgresOptions {
    /// Sets the table prefix.
    #[must_use]
    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: ConnectionRetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Checks that the prefix is a plain SQL identifier.
    ///
    /// The prefix is interpolated into statements, so only `[a-z0-9_]` is accepted and
    /// it must start with a letter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty or unsafe prefix.
    pub fn validate(&self) -> Result<()> {
        let prefix = &self.table_prefix;
        let starts_with_letter = prefix.chars().next().is_some_and(|c| c.is_ascii_lowercase());
        let allowed = prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !starts_with_letter || !allowed || prefix.len() > 40 {
            return Err(Error::InvalidInput(format!(
                "table prefix '{prefix}' must match [a-z][a-z0-9_]* (max 40 chars)"
            )));
        }
        if self.pool_max_size == 0 {
            return Err(Error::InvalidInput("pool_max_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(feature = "postgres")]
mod implementation {
    use super::PostgresOptions;
    use crate::models::{Counter, Gauge, MetricKind};
    use crate::storage::migrations::{Migration, MigrationRunner, max_version};
    use crate::storage::resilience::retry_connection;
    use crate::storage::traits::{MetricsStorage, Transaction, TxOp};
    use crate::{Error, Result};
    use async_trait::async_trait;
    use deadpool_postgres::{Config, Pool, PoolError, Runtime};
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio_postgres::NoTls;
    use tokio_postgres::error::SqlState;

    /// Embedded migrations compiled into the binary.
    const MIGRATIONS: &[Migration] = &[
        Migration {
            version: 1,
            description: "Counters table",
            sql: r"
                CREATE TABLE IF NOT EXISTS {prefix}_counters (
                    id BIGSERIAL PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE,
                    value BIGINT NOT NULL
                );
            ",
        },
        Migration {
            version: 2,
            description: "Gauges table",
            sql: r"
                CREATE TABLE IF NOT EXISTS {prefix}_gauges (
                    id BIGSERIAL PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE,
                    value DOUBLE PRECISION NOT NULL
                );
            ",
        },
    ];

    const BACKEND: &str = "postgres";

    /// Statements rendered once for the configured prefix.
    struct Statements {
        upsert_counter: String,
        upsert_gauge: String,
        select_counter: String,
        select_gauge: String,
        select_counters: String,
        select_gauges: String,
    }

    impl Statements {
        fn new(prefix: &str) -> Self {
            Self {
                upsert_counter: format!(
                    "INSERT INTO {prefix}_counters AS t (name, value) VALUES ($1, $2) \
                     ON CONFLICT (name) DO UPDATE SET value = t.value + EXCLUDED.value"
                ),
                upsert_gauge: format!(
                    "INSERT INTO {prefix}_gauges (name, value) VALUES ($1, $2) \
                     ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value"
                ),
                select_counter: format!("SELECT name, value FROM {prefix}_counters WHERE name = $1"),
                select_gauge: format!("SELECT name, value FROM {prefix}_gauges WHERE name = $1"),
                select_counters: format!("SELECT name, value FROM {prefix}_counters ORDER BY id DESC"),
                select_gauges: format!("SELECT name, value FROM {prefix}_gauges ORDER BY id DESC"),
            }
        }
    }

    /// Returns `true` when the error means the server could not be reached or the
    /// connection was lost (SQLSTATE class 08, closed connection, socket error).
    fn is_connection_error(e: &tokio_postgres::Error) -> bool {
        if e.is_closed() {
            return true;
        }
        if let Some(code) = e.code() {
            return code.code().starts_with("08");
        }
        std::error::Error::source(e).is_some_and(|source| source.is::<std::io::Error>())
    }

    /// Maps a query error, keeping connection loss retryable for the caller.
    fn query_error(operation: &str, e: &tokio_postgres::Error) -> Error {
        if is_connection_error(e) {
            return Error::ConnectionFailure {
                operation: operation.to_string(),
                cause: e.to_string(),
            };
        }
        if e.code() == Some(&SqlState::NUMERIC_VALUE_OUT_OF_RANGE) {
            return Error::InvalidInput(format!("{operation}: {e}"));
        }
        Error::OperationFailed {
            operation: operation.to_string(),
            cause: e.to_string(),
        }
    }

    /// Maps pool acquisition errors.
    fn pool_error(e: PoolError) -> Error {
        let operation = "postgres_get_client".to_string();
        match e {
            PoolError::Backend(ref inner) if !is_connection_error(inner) => Error::OperationFailed {
                operation,
                cause: e.to_string(),
            },
            PoolError::Timeout(_) | PoolError::Closed | PoolError::Backend(_) => {
                Error::ConnectionFailure {
                    operation,
                    cause: e.to_string(),
                }
            },
            other => Error::OperationFailed {
                operation,
                cause: other.to_string(),
            },
        }
    }

    fn row_error(operation: &str, e: &tokio_postgres::Error) -> Error {
        Error::SerializationFailure {
            operation: operation.to_string(),
            cause: e.to_string(),
        }
    }

    fn row_to_counter(row: &tokio_postgres::Row) -> Result<Counter> {
        let name: String = row.try_get("name").map_err(|e| row_error("decode_counter", &e))?;
        let value: i64 = row.try_get("value").map_err(|e| row_error("decode_counter", &e))?;
        Ok(Counter::new(name, value))
    }

    fn row_to_gauge(row: &tokio_postgres::Row) -> Result<Gauge> {
        let name: String = row.try_get("name").map_err(|e| row_error("decode_gauge", &e))?;
        let value: f64 = row.try_get("value").map_err(|e| row_error("decode_gauge", &e))?;
        Ok(Gauge::new(name, value))
    }

    /// Keeps the first row seen per name. Rows arrive newest first.
    fn latest_per_name<T>(items: Vec<T>, name: impl Fn(&T) -> &str) -> Vec<T> {
        let mut seen = HashSet::new();
        items
            .into_iter()
            .filter(|item| seen.insert(name(item).to_string()))
            .collect()
    }

    /// PostgreSQL-backed metrics storage.
    pub struct PostgresStorage {
        pool: Pool,
        statements: Statements,
        table_prefix: String,
    }

    impl PostgresStorage {
        /// Connects, retrying connection failures, and migrates the schema.
        ///
        /// # Errors
        ///
        /// Returns [`Error::InvalidInput`] for a malformed DSN or options,
        /// [`Error::ConnectionFailure`] once the retry ceiling is reached, or the first
        /// non-retryable error (authentication, migration).
        pub async fn connect(dsn: &str, options: PostgresOptions) -> Result<Self> {
            options.validate()?;
            let config = Self::parse_connection_url(dsn)?;
            let cfg = Self::build_pool_config(&config, options.pool_max_size);

            let pool = cfg
                .create_pool(Some(Runtime::Tokio1), NoTls)
                .map_err(|e| Error::OperationFailed {
                    operation: "postgres_create_pool".to_string(),
                    cause: e.to_string(),
                })?;

            retry_connection(&options.retry, BACKEND, "connect", || {
                let pool = pool.clone();
                async move {
                    let client = pool.get().await.map_err(pool_error)?;
                    client
                        .simple_query("SELECT 1")
                        .await
                        .map_err(|e| query_error("postgres_connect_probe", &e))?;
                    Ok::<(), Error>(())
                }
            })
            .await?;

            let runner = MigrationRunner::new(pool.clone(), options.table_prefix.clone());
            let applied = runner.run(MIGRATIONS).await?;
            let schema_version = runner.current_version().await?;
            if schema_version > max_version(MIGRATIONS) {
                tracing::warn!(
                    backend = BACKEND,
                    schema_version,
                    known_version = max_version(MIGRATIONS),
                    "Schema is newer than this build"
                );
            }

            tracing::info!(
                backend = BACKEND,
                table_prefix = %options.table_prefix,
                pool_max_size = options.pool_max_size,
                migrations_applied = applied,
                schema_version,
                "PostgreSQL storage ready"
            );

            Ok(Self {
                pool,
                statements: Statements::new(&options.table_prefix),
                table_prefix: options.table_prefix,
            })
        }

        /// Highest migration version recorded for this table prefix.
        ///
        /// # Errors
        ///
        /// Returns an error if the migrations table cannot be queried.
        pub async fn schema_version(&self) -> Result<i32> {
            MigrationRunner::new(self.pool.clone(), self.table_prefix.clone())
                .current_version()
                .await
        }

        /// Parses the DSN (URL or key/value form) into a tokio-postgres config.
        fn parse_connection_url(dsn: &str) -> Result<tokio_postgres::Config> {
            dsn.parse::<tokio_postgres::Config>()
                .map_err(|e| Error::InvalidInput(format!("invalid database DSN: {e}")))
        }

        #[cfg(unix)]
        fn host_to_string(h: &tokio_postgres::config::Host) -> String {
            match h {
                tokio_postgres::config::Host::Tcp(s) => s.clone(),
                tokio_postgres::config::Host::Unix(p) => p.to_string_lossy().to_string(),
            }
        }

        #[cfg(not(unix))]
        fn host_to_string(h: &tokio_postgres::config::Host) -> String {
            let tokio_postgres::config::Host::Tcp(s) = h;
            s.clone()
        }

        /// Builds a deadpool config with a capped pool and 5 s timeouts.
        fn build_pool_config(config: &tokio_postgres::Config, pool_max_size: usize) -> Config {
            let mut cfg = Config::new();
            cfg.host = config.get_hosts().first().map(Self::host_to_string);
            cfg.port = config.get_ports().first().copied();
            cfg.user = config.get_user().map(String::from);
            cfg.password = config
                .get_password()
                .map(|p| String::from_utf8_lossy(p).to_string());
            cfg.dbname = config.get_dbname().map(String::from);
            cfg.connect_timeout = config.get_connect_timeout().copied();

            cfg.pool = Some(deadpool_postgres::PoolConfig {
                max_size: pool_max_size,
                timeouts: deadpool_postgres::Timeouts {
                    wait: Some(Duration::from_secs(5)),
                    create: Some(Duration::from_secs(5)),
                    recycle: Some(Duration::from_secs(5)),
                },
                ..Default::default()
            });
            cfg.manager = Some(deadpool_postgres::ManagerConfig {
                recycling_method: deadpool_postgres::RecyclingMethod::Fast,
            });

            cfg
        }

        async fn client(&self) -> Result<deadpool_postgres::Object> {
            self.pool.get().await.map_err(pool_error)
        }

        fn not_found(kind: MetricKind, name: &str) -> Error {
            Error::NotFound {
                kind,
                name: name.to_string(),
            }
        }
    }

    /// Transaction handle over one pooled connection.
    struct PgTx<'a, 'c> {
        txn: &'a deadpool_postgres::Transaction<'c>,
        statements: &'a Statements,
    }

    #[async_trait]
    impl Transaction for PgTx<'_, '_> {
        async fn create_or_update_gauge(&mut self, name: &str, value: f64) -> Result<()> {
            self.txn
                .execute(&self.statements.upsert_gauge, &[&name, &value])
                .await
                .map_err(|e| query_error("postgres_tx_upsert_gauge", &e))?;
            Ok(())
        }

        async fn increment_counter(&mut self, name: &str, delta: i64) -> Result<()> {
            self.txn
                .execute(&self.statements.upsert_counter, &[&name, &delta])
                .await
                .map_err(|e| query_error("postgres_tx_upsert_counter", &e))?;
            Ok(())
        }
    }

    #[async_trait]
    impl MetricsStorage for PostgresStorage {
        async fn create_or_update_gauge(&self, name: &str, value: f64) -> Result<()> {
            let client = self.client().await?;
            client
                .execute(&self.statements.upsert_gauge, &[&name, &value])
                .await
                .map_err(|e| query_error("postgres_upsert_gauge", &e))?;
            metrics::counter!("metricstore_writes_total", "backend" => BACKEND, "kind" => "gauge")
                .increment(1);
            Ok(())
        }

        async fn increment_counter(&self, name: &str, delta: i64) -> Result<()> {
            let client = self.client().await?;
            client
                .execute(&self.statements.upsert_counter, &[&name, &delta])
                .await
                .map_err(|e| query_error("postgres_upsert_counter", &e))?;
            metrics::counter!("metricstore_writes_total", "backend" => BACKEND, "kind" => "counter")
                .increment(1);
            Ok(())
        }

        async fn get_counter(&self, name: &str) -> Result<Counter> {
            let client = self.client().await?;
            let row = client
                .query_opt(&self.statements.select_counter, &[&name])
                .await
                .map_err(|e| query_error("postgres_get_counter", &e))?
                .ok_or_else(|| Self::not_found(MetricKind::Counter, name))?;
            row_to_counter(&row)
        }

        async fn get_gauge(&self, name: &str) -> Result<Gauge> {
            let client = self.client().await?;
            let row = client
                .query_opt(&self.statements.select_gauge, &[&name])
                .await
                .map_err(|e| query_error("postgres_get_gauge", &e))?
                .ok_or_else(|| Self::not_found(MetricKind::Gauge, name))?;
            row_to_gauge(&row)
        }

        async fn get_counters(&self) -> Result<Vec<Counter>> {
            let client = self.client().await?;
            let rows = client
                .query(&self.statements.select_counters, &[])
                .await
                .map_err(|e| query_error("postgres_get_counters", &e))?;
            let counters = rows.iter().map(row_to_counter).collect::<Result<Vec<_>>>()?;
            Ok(latest_per_name(counters, |c| &c.name))
        }

        async fn get_gauges(&self) -> Result<Vec<Gauge>> {
            let client = self.client().await?;
            let rows = client
                .query(&self.statements.select_gauges, &[])
                .await
                .map_err(|e| query_error("postgres_get_gauges", &e))?;
            let gauges = rows.iter().map(row_to_gauge).collect::<Result<Vec<_>>>()?;
            Ok(latest_per_name(gauges, |g| &g.name))
        }

        async fn tx(&self, ops: Vec<TxOp>) -> Result<()> {
            let op_count = ops.len();
            let mut client = self.client().await?;
            let txn = client
                .transaction()
                .await
                .map_err(|e| query_error("postgres_tx_begin", &e))?;

            let mut failure = None;
            {
                let mut handle = PgTx {
                    txn: &txn,
                    statements: &self.statements,
                };
                for (index, op) in ops.into_iter().enumerate() {
                    let tx: &mut dyn Transaction = &mut handle;
                    if let Err(err) = op(tx).await {
                        failure = Some((index, err));
                        break;
                    }
                }
            }

            if let Some((index, err)) = failure {
                if let Err(rollback_err) = txn.rollback().await {
                    tracing::error!(
                        backend = BACKEND,
                        error = %rollback_err,
                        "Rollback failed, connection will discard the transaction"
                    );
                }
                tracing::warn!(
                    backend = BACKEND,
                    failed_op = index,
                    op_count,
                    error = %err,
                    "Transaction rolled back"
                );
                metrics::counter!("metricstore_tx_total", "backend" => BACKEND, "status" => "rolled_back")
                    .increment(1);
                return Err(Error::transaction(err));
            }

            txn.commit()
                .await
                .map_err(|e| Error::transaction(query_error("postgres_tx_commit", &e)))?;
            metrics::counter!("metricstore_tx_total", "backend" => BACKEND, "status" => "committed")
                .increment(1);
            Ok(())
        }

        async fn ping(&self) -> Result<()> {
            let client = self.client().await?;
            client
                .simple_query("SELECT 1")
                .await
                .map_err(|e| query_error("postgres_ping", &e))?;
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.pool.close();
            tracing::info!(backend = BACKEND, "PostgreSQL pool closed");
            Ok(())
        }

        fn backend_name(&self) -> &'static str {
            BACKEND
        }
    }

}

#[cfg(feature = "postgres")]
pub use implementation::PostgresStorage;

#[cfg(not(feature = "postgres"))]
mod stub {
    use super::PostgresOptions;
    use crate::models::{Counter, Gauge};
    use crate::storage::traits::{MetricsStorage, TxOp};
    use crate::{Error, Result};
    use async_trait::async_trait;

    fn disabled() -> Error {
        Error::FeatureNotEnabled("postgres".to_string())
    }

    /// Stub PostgreSQL storage when the feature is not enabled.
    pub struct PostgresStorage {
        _private: (),
    }

    impl PostgresStorage {
        /// Always fails: the crate was built without `postgres`.
        ///
        /// # Errors
        ///
        /// Always returns [`Error::FeatureNotEnabled`].
        pub async fn connect(_dsn: &str, _options: PostgresOptions) -> Result<Self> {
            Err(disabled())
        }

        /// Always fails: the crate was built without `postgres`.
        ///
        /// # Errors
        ///
        /// Always returns [`Error::FeatureNotEnabled`].
        pub async fn schema_version(&self) -> Result<i32> {
            Err(disabled())
        }
    }

    #[async_trait]
    impl MetricsStorage for PostgresStorage {
        async fn create_or_update_gauge(&self, _name: &str, _value: f64) -> Result<()> {
            Err(disabled())
        }

        async fn increment_counter(&self, _name: &str, _delta: i64) -> Result<()> {
            Err(disabled())
        }

        async fn get_counter(&self, _name: &str) -> Result<Counter> {
            Err(disabled())
        }

        async fn get_gauge(&self, _name: &str) -> Result<Gauge> {
            Err(disabled())
        }

        async fn get_counters(&self) -> Result<Vec<Counter>> {
            Err(disabled())
        }

        async fn get_gauges(&self) -> Result<Vec<Gauge>> {
            Err(disabled())
        }

        async fn tx(&self, _ops: Vec<TxOp>) -> Result<()> {
            Err(disabled())
        }

        async fn ping(&self) -> Result<()> {
            Err(disabled())
        }

        fn backend_name(&self) -> &'static str {
            "postgres"
        }
    }
}

#[cfg(not(feature = "postgres"))]
pub use stub::PostgresStorage;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("metrics", true ; "default prefix")]
    #[test_case("test_run_42", true ; "digits and underscores")]
    #[test_case("", false ; "empty")]
    #[test_case("9lives", false ; "leading digit")]
    #[test_case("metrics; DROP TABLE x", false ; "injection")]
    #[test_case("Metrics", false ; "uppercase")]
    fn test_prefix_validation(prefix: &str, ok: bool) {
        let options = PostgresOptions::default().with_table_prefix(prefix);
        assert_eq!(options.validate().is_ok(), ok);
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let options = PostgresOptions {
            pool_max_size: 0,
            ..PostgresOptions::default()
        };
        assert!(matches!(options.validate(), Err(Error::InvalidInput(_))));
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn test_stub_connect_reports_missing_feature() {
        let result = PostgresStorage::connect("postgres://localhost/db", PostgresOptions::default()).await;
        assert!(matches!(result, Err(Error::FeatureNotEnabled(_))));
    }
}
