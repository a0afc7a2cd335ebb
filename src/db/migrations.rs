//! Filesystem-sourced schema migrations.
//!
//! Migrations live under `<schema_directory>/<schema>/*.sql`; the file
//! basename is the version. Versions use the fixed UTC layout
//! `YYYYMMDDThhmmssZ`, so lexicographic ordering coincides with
//! chronological ordering.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use sqlx::postgres::PgConnection;
use thiserror::Error;

use super::DbError;

/// Version parsing layout.
const VERSION_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Fixed width of a version string.
const VERSION_SIZE: usize = 16;

/// Migration loading errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The file basename is not a valid version.
    #[error("invalid migration version {0:?}: invalid format")]
    InvalidVersion(String),

    /// The migration directory could not be listed.
    #[error("cannot read directory {path}: {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration file could not be read.
    #[error("cannot read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Validate a migration version string.
///
/// # Errors
/// Fails unless the string matches the exact `YYYYMMDDThhmmssZ` layout and
/// parses as a UTC timestamp.
pub fn validate_migration_version(s: &str) -> Result<(), MigrationError> {
    // The layout is fixed-width; the parser alone would accept shorter
    // numeric fields.
    if s.len() != VERSION_SIZE {
        return Err(MigrationError::InvalidVersion(s.to_string()));
    }

    NaiveDateTime::parse_from_str(s, VERSION_FORMAT)
        .map(|_| ())
        .map_err(|_| MigrationError::InvalidVersion(s.to_string()))
}

/// One migration: a schema, a version and the SQL text to execute.
#[derive(Debug, Clone)]
pub struct Migration {
    pub schema: String,
    pub version: String,
    pub sql: String,
}

impl fmt::Display for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.schema, self.version)
    }
}

impl Migration {
    /// Load one migration file; the basename without extension is the
    /// version.
    pub fn load_file(schema: &str, file_path: &Path) -> Result<Self, MigrationError> {
        let version = file_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();

        validate_migration_version(&version)?;

        let sql = std::fs::read_to_string(file_path).map_err(|source| MigrationError::ReadFile {
            path: file_path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            schema: schema.to_string(),
            version,
            sql,
        })
    }

    /// Load every `.sql` file of a schema directory, in directory order.
    pub fn load_directory(schema: &str, dir_path: &Path) -> Result<Vec<Self>, MigrationError> {
        let entries =
            std::fs::read_dir(dir_path).map_err(|source| MigrationError::ReadDirectory {
                path: dir_path.to_path_buf(),
                source,
            })?;

        let mut migrations = Vec::new();

        for entry in entries {
            let entry = entry.map_err(|source| MigrationError::ReadDirectory {
                path: dir_path.to_path_buf(),
                source,
            })?;

            let file_path = entry.path();
            if file_path.extension().and_then(|ext| ext.to_str()) != Some("sql") {
                continue;
            }

            migrations.push(Self::load_file(schema, &file_path)?);
        }

        Ok(migrations)
    }

    /// Execute the migration and record its version. Runs on a connection
    /// whose transaction the caller owns.
    pub async fn apply(&self, conn: &mut PgConnection) -> Result<(), DbError> {
        // Migration files routinely contain several statements; use the
        // simple query protocol.
        sqlx::raw_sql(&self.sql).execute(&mut *conn).await?;

        sqlx::query("INSERT INTO schema_versions (schema, version) VALUES ($1, $2)")
            .bind(&self.schema)
            .bind(&self.version)
            .execute(conn)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_migration_version() {
        assert!(validate_migration_version("20220101T000000Z").is_ok());
        assert!(validate_migration_version("19991231T235959Z").is_ok());

        assert!(validate_migration_version("").is_err());
        assert!(validate_migration_version("20220101").is_err());
        assert!(validate_migration_version("2022-01-01T00:00:00Z").is_err());
        assert!(validate_migration_version("20220101T000000").is_err());
        assert!(validate_migration_version("20221301T000000Z").is_err());
        assert!(validate_migration_version("x0220101T000000Z").is_err());
    }

    #[test]
    fn test_load_directory() {
        let dir = tempfile::tempdir().unwrap();

        for (name, sql) in [
            ("20220103T000000Z.sql", "CREATE TABLE t3 (id INT);"),
            ("20220101T000000Z.sql", "CREATE TABLE t1 (id INT);"),
            ("20220102T000000Z.sql", "CREATE TABLE t2 (id INT);"),
            ("README.md", "not a migration"),
        ] {
            std::fs::write(dir.path().join(name), sql).unwrap();
        }

        let mut migrations = Migration::load_directory("main", dir.path()).unwrap();
        assert_eq!(migrations.len(), 3);

        migrations.sort_by(|a, b| a.version.cmp(&b.version));

        let versions: Vec<&str> = migrations.iter().map(|m| m.version.as_str()).collect();
        assert_eq!(
            versions,
            vec!["20220101T000000Z", "20220102T000000Z", "20220103T000000Z"]
        );

        assert_eq!(migrations[0].schema, "main");
        assert_eq!(migrations[0].sql, "CREATE TABLE t1 (id INT);");
        assert_eq!(migrations[0].to_string(), "main-20220101T000000Z");
    }

    #[test]
    fn test_load_directory_invalid_version() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("v1.sql"), "SELECT 1;").unwrap();

        assert!(matches!(
            Migration::load_directory("main", dir.path()),
            Err(MigrationError::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_load_directory_missing() {
        assert!(matches!(
            Migration::load_directory("main", Path::new("/nonexistent")),
            Err(MigrationError::ReadDirectory { .. })
        ));
    }

    #[test]
    fn test_reject_applied_versions() {
        let mut migrations = vec![
            Migration {
                schema: "main".into(),
                version: "20220101T000000Z".into(),
                sql: String::new(),
            },
            Migration {
                schema: "main".into(),
                version: "20220102T000000Z".into(),
                sql: String::new(),
            },
            Migration {
                schema: "main".into(),
                version: "20220103T000000Z".into(),
                sql: String::new(),
            },
        ];

        let applied: std::collections::HashSet<String> =
            ["20220102T000000Z".to_string()].into_iter().collect();

        migrations.retain(|m| !applied.contains(&m.version));
        migrations.sort_by(|a, b| a.version.cmp(&b.version));

        let versions: Vec<&str> = migrations.iter().map(|m| m.version.as_str()).collect();
        assert_eq!(versions, vec!["20220101T000000Z", "20220103T000000Z"]);
    }
}
