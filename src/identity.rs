//! Maps the Notes app's per-session note ids to durable identifiers.
//!
//! The scripting bridge only exposes Core Data URLs such as
//! `x-coredata://<store>/ICNote/p123`, which are useless for `notes://`
//! links. The durable `ZIDENTIFIER` lives in the app's SQLite store, which
//! can only be read when the terminal has been granted Full Disk Access, so
//! the lookup is gated on the user's privilege setting.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{NotesError, Result};

const LOOKUP_SQL: &str = "SELECT ZIDENTIFIER FROM ZICCLOUDSYNCINGOBJECT WHERE Z_PK = ?";

/// `~/Library/Group Containers/group.com.apple.notes/NoteStore.sqlite`.
pub fn default_note_store_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Library")
        .join("Group Containers")
        .join("group.com.apple.notes")
        .join("NoteStore.sqlite")
}

/// Numeric primary key from the trailing `p<N>` component of an opaque id.
pub fn internal_pk(opaque_id: &str) -> Option<i64> {
    opaque_id
        .rsplit('/')
        .next()?
        .trim_start_matches('p')
        .parse()
        .ok()
}

/// Resolves stable ids for one extraction run.
///
/// The store is opened read-only on the first lookup and kept open for the
/// rest of the run. With privileges off it is never touched.
#[derive(Debug)]
pub struct IdentityResolver {
    privileges: bool,
    store_path: PathBuf,
    pool: Option<SqlitePool>,
}

impl IdentityResolver {
    pub fn new(privileges: bool, store_path: impl Into<PathBuf>) -> Self {
        Self {
            privileges,
            store_path: store_path.into(),
            pool: None,
        }
    }

    /// Resolver that always returns the opaque id.
    pub fn disabled() -> Self {
        Self::new(false, PathBuf::new())
    }

    pub fn privileges(&self) -> bool {
        self.privileges
    }

    pub fn is_open(&self) -> bool {
        self.pool.is_some()
    }

    /// Stable id for `opaque_id`.
    ///
    /// Falls back to the opaque id when privileges are off, when the id has
    /// no numeric component, or when the store has no matching row. Errors
    /// only when the store cannot be read, and [`NotesError::DiskAccess`]
    /// in that case means the privilege setting is wrong for the whole run.
    pub async fn resolve(&mut self, opaque_id: &str) -> Result<String> {
        if !self.privileges {
            return Ok(opaque_id.to_string());
        }

        let Some(pk) = internal_pk(opaque_id) else {
            debug!(opaque_id, "no numeric key in note id, keeping opaque id");
            return Ok(opaque_id.to_string());
        };

        let path = self.store_path.clone();
        let pool = self.pool().await?;
        let row: Option<Option<String>> = sqlx::query_scalar(LOOKUP_SQL)
            .bind(pk)
            .fetch_optional(pool)
            .await
            .map_err(|e| classify(e, &path))?;

        match row.flatten().filter(|id| !id.is_empty()) {
            Some(stable) => Ok(stable),
            None => {
                debug!(opaque_id, pk, "no identifier row for note, keeping opaque id");
                Ok(opaque_id.to_string())
            }
        }
    }

    async fn pool(&mut self) -> Result<&SqlitePool> {
        if self.pool.is_none() {
            let options = SqliteConnectOptions::new()
                .filename(&self.store_path)
                .read_only(true)
                .create_if_missing(false);

            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await
                .map_err(|e| classify(e, &self.store_path))?;
            debug!(path = %self.store_path.display(), "opened note store");
            self.pool = Some(pool);
        }
        match &self.pool {
            Some(pool) => Ok(pool),
            None => Err(NotesError::Storage("note store pool unavailable".to_string())),
        }
    }

    pub async fn close(self) {
        if let Some(pool) = self.pool {
            pool.close().await;
        }
    }
}

/// Access failures become `DiskAccess`; anything else is a plain storage error.
fn classify(err: sqlx::Error, path: &Path) -> NotesError {
    let denied = match &err {
        sqlx::Error::Database(db) => {
            // SQLITE_CANTOPEN (14), SQLITE_PERM (3) or SQLITE_AUTH (23).
            matches!(db.code().as_deref(), Some("14") | Some("3") | Some("23"))
                || db.message().contains("unable to open database file")
                || db.message().contains("authorization denied")
        }
        sqlx::Error::Io(io) => matches!(
            io.kind(),
            std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::NotFound
        ),
        _ => false,
    };

    if denied {
        NotesError::DiskAccess {
            path: path.display().to_string(),
        }
    } else {
        NotesError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn fake_store(dir: &Path) -> PathBuf {
        let path = dir.join("NoteStore.sqlite");
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE ZICCLOUDSYNCINGOBJECT (Z_PK INTEGER PRIMARY KEY, ZIDENTIFIER TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO ZICCLOUDSYNCINGOBJECT (Z_PK, ZIDENTIFIER) VALUES (123, 'A1B2-C3D4'), (7, NULL)")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;
        path
    }

    #[test]
    fn parses_trailing_pk() {
        assert_eq!(internal_pk("x-coredata://ABC-DEF/ICNote/p123"), Some(123));
        assert_eq!(internal_pk("p5"), Some(5));
        assert_eq!(internal_pk("x-coredata://ABC/ICNote/"), None);
        assert_eq!(internal_pk("x-coredata://ABC/ICNote/pxyz"), None);
    }

    #[tokio::test]
    async fn without_privileges_returns_opaque_id_and_never_opens() {
        let mut resolver = IdentityResolver::new(false, "/definitely/not/here.sqlite");
        let id = "x-coredata://S/ICNote/p123";
        assert_eq!(resolver.resolve(id).await.unwrap(), id);
        assert!(!resolver.is_open());
    }

    #[tokio::test]
    async fn resolves_from_store() {
        let tmp = TempDir::new().unwrap();
        let path = fake_store(tmp.path()).await;
        let mut resolver = IdentityResolver::new(true, &path);

        let stable = resolver.resolve("x-coredata://S/ICNote/p123").await.unwrap();
        assert_eq!(stable, "A1B2-C3D4");
        assert!(resolver.is_open());
        resolver.close().await;
    }

    #[tokio::test]
    async fn missing_row_or_null_falls_back_to_opaque_id() {
        let tmp = TempDir::new().unwrap();
        let path = fake_store(tmp.path()).await;
        let mut resolver = IdentityResolver::new(true, &path);

        let absent = "x-coredata://S/ICNote/p999";
        assert_eq!(resolver.resolve(absent).await.unwrap(), absent);
        let null = "x-coredata://S/ICNote/p7";
        assert_eq!(resolver.resolve(null).await.unwrap(), null);
    }

    #[tokio::test]
    async fn unopenable_store_is_disk_access_error() {
        let tmp = TempDir::new().unwrap();
        let mut resolver = IdentityResolver::new(true, tmp.path().join("missing.sqlite"));
        let err = resolver
            .resolve("x-coredata://S/ICNote/p1")
            .await
            .unwrap_err();
        assert!(matches!(err, NotesError::DiskAccess { .. }), "got {err:?}");
    }
}
