use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

pub(crate) const CONVERTER_SCHEMA: &str = include_str!("../../sql/converter.sql");

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to open converter database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on converter database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("converter database path not configured")]
    MissingStore,
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Pragmas shared by every converter database handle. The busy timeout lets
/// concurrent workers wait on each other instead of failing with SQLITE_BUSY.
pub fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA busy_timeout = 10000;\n",
    )
}

pub(crate) fn open_flags(read_only: bool, create_if_missing: bool) -> OpenFlags {
    let mut flags = if read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE
    };
    if !read_only && create_if_missing {
        flags |= OpenFlags::SQLITE_OPEN_CREATE;
    }
    flags
}

pub(crate) fn open_configured(path: &Path, flags: OpenFlags) -> PersistenceResult<Connection> {
    let conn = Connection::open_with_flags(path, flags).map_err(|source| {
        PersistenceError::Open {
            source,
            path: path.to_path_buf(),
        }
    })?;
    configure_connection(&conn).map_err(|source| PersistenceError::Open {
        source,
        path: path.to_path_buf(),
    })?;
    Ok(conn)
}

/// Creates the database's parent directory and applies the schema.
pub(crate) fn initialize_schema(path: &Path, flags: OpenFlags) -> PersistenceResult<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| PersistenceError::Io {
            source,
            path: parent.to_path_buf(),
        })?;
    }
    let conn = open_configured(path, flags)?;
    conn.execute_batch(CONVERTER_SCHEMA)?;
    Ok(())
}
