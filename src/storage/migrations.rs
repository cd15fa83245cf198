//! PostgreSQL migration system for schema management.
//!
//! Migrations are compiled into the binary and applied in version order when the
//! relational backend starts. Each migration runs in its own transaction together with
//! the row that records it, so a failed migration leaves no partial schema behind.
//!
//! # Usage
//!
//! ```rust,ignore
//! use metricstore::storage::migrations::{Migration, MigrationRunner};
//!
//! const MIGRATIONS: &[Migration] = &[
//!     Migration {
//!         version: 1,
//!         description: "Counters table",
//!         sql: "CREATE TABLE IF NOT EXISTS {prefix}_counters (id BIGSERIAL PRIMARY KEY);",
//!     },
//! ];
//!
//! let runner = MigrationRunner::new(pool, "metrics");
//! runner.run(MIGRATIONS).await?;
//! ```

#[cfg(feature = "postgres")]
mod implementation {
    use super::Migration;
    use crate::{Error, Result};
    use deadpool_postgres::Pool;

    /// Runs migrations for the tables sharing one prefix.
    pub struct MigrationRunner {
        pool: Pool,
        prefix: String,
    }

    impl MigrationRunner {
        /// Creates a new migration runner.
        #[must_use]
        pub fn new(pool: Pool, prefix: impl Into<String>) -> Self {
            Self {
                pool,
                prefix: prefix.into(),
            }
        }

        /// Runs all pending migrations, returning how many were applied.
        ///
        /// # Errors
        ///
        /// Returns an error if a migration fails.
        pub async fn run(&self, migrations: &[Migration]) -> Result<usize> {
            let mut client = self.pool.get().await.map_err(|e| Error::ConnectionFailure {
                operation: "migration_get_connection".to_string(),
                cause: e.to_string(),
            })?;

            self.ensure_migrations_table(&client).await?;
            let current_version = self.get_current_version(&client).await?;

            let mut applied = 0;
            for migration in migrations {
                if migration.version > current_version {
                    self.apply_migration(&mut client, migration).await?;
                    applied += 1;
                }
            }

            Ok(applied)
        }

        /// Returns the current schema version (0 before the first migration).
        ///
        /// # Errors
        ///
        /// Returns an error if the database cannot be queried.
        pub async fn current_version(&self) -> Result<i32> {
            let client = self.pool.get().await.map_err(|e| Error::ConnectionFailure {
                operation: "migration_get_connection".to_string(),
                cause: e.to_string(),
            })?;

            let exists: bool = client
                .query_one(
                    "SELECT EXISTS (SELECT FROM information_schema.tables WHERE table_name = $1)",
                    &[&self.migrations_table_name()],
                )
                .await
                .and_then(|row| row.try_get(0))
                .map_err(|e| Error::OperationFailed {
                    operation: "migration_table_exists".to_string(),
                    cause: e.to_string(),
                })?;

            if !exists {
                return Ok(0);
            }
            self.get_current_version(&client).await
        }

        fn migrations_table_name(&self) -> String {
            format!("{}_schema_migrations", self.prefix)
        }

        async fn ensure_migrations_table(&self, client: &deadpool_postgres::Object) -> Result<()> {
            let sql = format!(
                r"
                CREATE TABLE IF NOT EXISTS {} (
                    version INTEGER PRIMARY KEY,
                    description TEXT NOT NULL,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                ",
                self.migrations_table_name()
            );

            client
                .execute(&sql, &[])
                .await
                .map_err(|e| Error::OperationFailed {
                    operation: "create_migrations_table".to_string(),
                    cause: e.to_string(),
                })?;
            Ok(())
        }

        async fn get_current_version(&self, client: &deadpool_postgres::Object) -> Result<i32> {
            let sql = format!(
                "SELECT COALESCE(MAX(version), 0) FROM {}",
                self.migrations_table_name()
            );

            client
                .query_one(&sql, &[])
                .await
                .and_then(|row| row.try_get(0))
                .map_err(|e| Error::OperationFailed {
                    operation: "migration_current_version".to_string(),
                    cause: e.to_string(),
                })
        }

        async fn apply_migration(
            &self,
            client: &mut deadpool_postgres::Object,
            migration: &Migration,
        ) -> Result<()> {
            let sql = migration.sql.replace("{prefix}", &self.prefix);

            let tx = client
                .transaction()
                .await
                .map_err(|e| Error::OperationFailed {
                    operation: format!("migration_v{}_begin_tx", migration.version),
                    cause: e.to_string(),
                })?;

            for statement in sql.split(';') {
                let statement = statement.trim();
                if statement.is_empty() {
                    continue;
                }

                tx.execute(statement, &[])
                    .await
                    .map_err(|e| Error::OperationFailed {
                        operation: format!(
                            "migration_v{}: {}",
                            migration.version, migration.description
                        ),
                        cause: e.to_string(),
                    })?;
            }

            let record_sql = format!(
                "INSERT INTO {} (version, description) VALUES ($1, $2)",
                self.migrations_table_name()
            );
            tx.execute(&record_sql, &[&migration.version, &migration.description])
                .await
                .map_err(|e| Error::OperationFailed {
                    operation: "record_migration".to_string(),
                    cause: e.to_string(),
                })?;

            tx.commit().await.map_err(|e| Error::OperationFailed {
                operation: format!("migration_v{}_commit", migration.version),
                cause: e.to_string(),
            })?;

            tracing::info!(
                version = migration.version,
                description = migration.description,
                prefix = self.prefix,
                "Applied migration"
            );

            Ok(())
        }
    }
}

#[cfg(feature = "postgres")]
pub use implementation::MigrationRunner;

/// A single migration with version and SQL.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Migration version (sequential, starting at 1).
    pub version: i32,
    /// Human-readable description.
    pub description: &'static str,
    /// SQL to apply (statements separated by semicolons).
    /// `{prefix}` is replaced with the table prefix.
    pub sql: &'static str,
}

/// Maximum version across a set of migrations.
#[must_use]
pub const fn max_version(migrations: &[Migration]) -> i32 {
    let mut max = 0;
    let mut i = 0;
    while i < migrations.len() {
        if migrations[i].version > max {
            max = migrations[i].version;
        }
        i += 1;
    }
    max
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[Migration] = &[
        Migration {
            version: 1,
            description: "one",
            sql: "SELECT 1",
        },
        Migration {
            version: 3,
            description: "three",
            sql: "SELECT 3",
        },
        Migration {
            version: 2,
            description: "two",
            sql: "SELECT 2",
        },
    ];

    #[test]
    fn test_max_version() {
        assert_eq!(max_version(SAMPLE), 3);
        assert_eq!(max_version(&[]), 0);
    }
}
