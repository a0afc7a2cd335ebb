//! Relational database client.
//!
//! Wraps a connection pool with explicit transaction helpers and drives
//! cooperative schema migration: ordered SQL files applied one transaction
//! per migration, serialized across daemon instances by a transaction-scoped
//! advisory lock.

mod migrations;

pub use migrations::{validate_migration_version, Migration, MigrationError};

use std::collections::HashSet;
use std::path::Path;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Connection, Row};
use thiserror::Error;

use crate::check::{Checker, Object};

/// First member of every advisory lock identifier pair taken by the
/// harness; the second member selects the subsystem.
pub const ADVISORY_LOCK_ID1: i32 = 0x00ff;

/// Advisory lock subsystem identifier for schema migrations.
pub const ADVISORY_LOCK_ID2_MIGRATIONS: i32 = 0x0001;

/// Database client errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// No connection URI was configured.
    #[error("missing or empty uri")]
    MissingUri,

    /// The pool could not be established.
    #[error("cannot connect to database at {uri:?}: {source}")]
    Connect {
        uri: String,
        #[source]
        source: sqlx::Error,
    },

    /// A pooled connection could not be acquired.
    #[error("cannot acquire connection: {0}")]
    Acquire(#[source] sqlx::Error),

    /// `BEGIN` failed.
    #[error("cannot begin transaction: {0}")]
    Begin(#[source] sqlx::Error),

    /// `COMMIT` failed; promoted to the caller since the transaction
    /// outcome is unknown.
    #[error("cannot commit transaction: {0}")]
    Commit(#[source] sqlx::Error),

    /// Any other query failure.
    #[error("database error: {0}")]
    Query(#[from] sqlx::Error),

    /// Migration loading failure.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// A migration could not be applied; the remaining batch was skipped.
    #[error("cannot apply migration {name}: {source}")]
    ApplyMigration {
        name: String,
        #[source]
        source: Box<DbError>,
    },
}

/// Database configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DbCfg {
    pub uri: String,

    /// Directory holding one migration subdirectory per schema.
    #[serde(default)]
    pub schema_directory: String,

    /// Schemas to manage, in update order.
    #[serde(default)]
    pub schema_names: Vec<String>,
}

impl Object for DbCfg {
    fn check(&self, c: &mut Checker) {
        c.check_string_uri("uri", &self.uri);
        c.check_string_not_empty("schema_directory", &self.schema_directory);

        c.with_child("schema_names", |c| {
            for (i, name) in self.schema_names.iter().enumerate() {
                c.check_string_not_empty(i, name);
            }
        });
    }
}

/// A pooled database client.
pub struct DbClient {
    cfg: DbCfg,
    pool: PgPool,
}

impl DbClient {
    /// Connect eagerly and update the configured schemas.
    pub async fn new(cfg: DbCfg) -> Result<Self, DbError> {
        if cfg.uri.is_empty() {
            return Err(DbError::MissingUri);
        }

        tracing::info!("connecting to {:?}", cfg.uri);

        let pool = PgPoolOptions::new()
            .min_connections(1)
            .connect(&cfg.uri)
            .await
            .map_err(|source| DbError::Connect {
                uri: cfg.uri.clone(),
                source,
            })?;

        let client = Self { cfg, pool };

        if !client.cfg.schema_directory.is_empty() {
            if let Err(err) = client.update_schemas().await {
                client.close().await;
                return Err(err);
            }
        }

        Ok(client)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run `f` on a pooled connection; the connection is released on every
    /// exit path.
    pub async fn with_conn<T, F>(&self, f: F) -> Result<T, DbError>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, DbError>>,
    {
        let mut conn = self.pool.acquire().await.map_err(DbError::Acquire)?;

        f(&mut *conn).await
    }

    /// Run `f` inside a transaction: `ROLLBACK` when it fails (logging any
    /// rollback failure), `COMMIT` otherwise with commit failures promoted
    /// to the caller.
    pub async fn with_tx<T, F>(&self, f: F) -> Result<T, DbError>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, DbError>>,
    {
        let mut conn = self.pool.acquire().await.map_err(DbError::Acquire)?;

        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(DbError::Begin)?;

        match f(&mut *conn).await {
            Ok(value) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(DbError::Commit)?;

                Ok(value)
            }

            Err(err) => {
                if let Err(rollback_err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    // The function error is the one worth returning; the
                    // rollback failure can only be logged.
                    tracing::error!("cannot rollback transaction: {rollback_err}");
                }

                Err(err)
            }
        }
    }

    async fn update_schemas(&self) -> Result<(), DbError> {
        for name in &self.cfg.schema_names {
            let dir_path = Path::new(&self.cfg.schema_directory).join(name);
            self.update_schema(name, &dir_path).await?;
        }

        Ok(())
    }

    /// Apply the pending migrations of one schema.
    ///
    /// The update runs under the migrations advisory lock, held until the
    /// end of an outer transaction, so concurrent daemon instances
    /// serialize. Each migration commits in its own transaction; a failure
    /// aborts the remaining batch but keeps what already committed.
    pub async fn update_schema(&self, schema: &str, dir_path: &Path) -> Result<(), DbError> {
        tracing::info!("updating schema {schema:?} using migrations from {dir_path:?}");

        let migrations = Migration::load_directory(schema, dir_path)?;
        if migrations.is_empty() {
            tracing::info!("no migration available");
            return Ok(());
        }

        let mut conn = self.pool.acquire().await.map_err(DbError::Acquire)?;

        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(DbError::Begin)?;

        match self.run_schema_update(&mut *conn, schema, migrations).await {
            Ok(()) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(DbError::Commit)?;
            }

            Err(err) => {
                if let Err(rollback_err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    tracing::error!("cannot rollback transaction: {rollback_err}");
                }

                return Err(err);
            }
        }

        drop(conn);

        // Migrations may have created new types; those are only discovered
        // when a connection is established, so recycle the idle pool.
        self.recycle_idle_connections().await;

        Ok(())
    }

    async fn run_schema_update(
        &self,
        conn: &mut PgConnection,
        schema: &str,
        mut migrations: Vec<Migration>,
    ) -> Result<(), DbError> {
        // Only one instance may update the schema at a time; the lock is
        // released with the surrounding transaction.
        take_advisory_lock(conn, ADVISORY_LOCK_ID1, ADVISORY_LOCK_ID2_MIGRATIONS).await?;

        // The version table is created on a separate pooled connection: each
        // migration runs in its own transaction, before the surrounding one
        // ends, and would not see a table created on this connection.
        self.with_conn(|conn| Box::pin(create_schema_version_table(conn)))
            .await?;

        let applied = load_schema_versions(conn, schema).await?;

        migrations.retain(|m| !applied.contains(&m.version));
        migrations.sort_by(|a, b| a.version.cmp(&b.version));

        for migration in migrations {
            tracing::info!("applying migration {migration}");

            let name = migration.to_string();

            self.with_tx(move |conn| Box::pin(apply_migration(migration, conn)))
                .await
                .map_err(|source| DbError::ApplyMigration {
                    name,
                    source: Box::new(source),
                })?;
        }

        Ok(())
    }

    async fn recycle_idle_connections(&self) {
        while let Some(conn) = self.pool.try_acquire() {
            let conn = conn.detach();
            if let Err(err) = conn.close().await {
                tracing::debug!("cannot close connection: {err}");
            }
        }
    }
}

async fn apply_migration(migration: Migration, conn: &mut PgConnection) -> Result<(), DbError> {
    migration.apply(conn).await
}

/// Take a transaction-scoped advisory lock, blocking until it is granted.
pub async fn take_advisory_lock(
    conn: &mut PgConnection,
    id1: i32,
    id2: i32,
) -> Result<(), DbError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
        .bind(id1)
        .bind(id2)
        .execute(conn)
        .await?;

    Ok(())
}

async fn create_schema_version_table(conn: &mut PgConnection) -> Result<(), DbError> {
    let query = r#"
CREATE TABLE IF NOT EXISTS schema_versions
  (schema VARCHAR NOT NULL,
   version VARCHAR NOT NULL,
   migration_date TIMESTAMP NOT NULL
     DEFAULT (CURRENT_TIMESTAMP AT TIME ZONE 'UTC'),

   PRIMARY KEY (schema, version)
)
"#;

    sqlx::query(query).execute(conn).await?;

    Ok(())
}

async fn load_schema_versions(
    conn: &mut PgConnection,
    schema: &str,
) -> Result<HashSet<String>, DbError> {
    let rows = sqlx::query("SELECT version FROM schema_versions WHERE schema = $1")
        .bind(schema)
        .fetch_all(conn)
        .await?;

    Ok(rows.iter().map(|row| row.get::<String, _>(0)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cfg_check() {
        let cfg = DbCfg {
            uri: "postgres://steward@localhost/steward".to_string(),
            schema_directory: "data/migrations".to_string(),
            schema_names: vec!["main".to_string()],
        };

        let mut c = Checker::new();
        cfg.check(&mut c);
        assert!(c.errors().is_empty());

        let cfg = DbCfg {
            uri: "postgres://steward@localhost/steward".to_string(),
            schema_directory: String::new(),
            schema_names: vec!["main".to_string(), String::new()],
        };

        let mut c = Checker::new();
        cfg.check(&mut c);

        let pointers: Vec<String> = c.errors().iter().map(|e| e.pointer.to_string()).collect();
        assert!(pointers.contains(&"/schema_directory".to_string()));
        assert!(pointers.contains(&"/schema_names/1".to_string()));
    }

    #[tokio::test]
    async fn test_new_requires_uri() {
        let result = DbClient::new(DbCfg::default()).await;
        assert!(matches!(result, Err(DbError::MissingUri)));
    }

    #[allow(dead_code)]
    fn assert_send<T: Send>(_: T) {}

    #[allow(dead_code)]
    fn with_helpers_accept_owned_captures(client: &DbClient) {
        // The closure captures owned data only; the returned future borrows
        // nothing but the connection.
        let version = "x".to_string();
        assert_send(client.with_tx(move |conn| {
            Box::pin(async move {
                sqlx::query("SELECT $1")
                    .bind(version)
                    .execute(conn)
                    .await?;
                Ok(())
            })
        }));
    }
}
