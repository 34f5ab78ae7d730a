//! SQLite pool construction shared by every store in the crate.

use miette::Diagnostic;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("sqlx error: {0}")]
    #[diagnostic(
        code(runloom::store::sqlx),
        help("Ensure the SQLite database URL is valid and accessible.")
    )]
    Sqlx(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    #[diagnostic(code(runloom::store::serde))]
    Serde(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    #[diagnostic(code(runloom::store::backend))]
    Backend(String),
}

/// Connect (or create) the SQLite database at `database_url` and apply
/// embedded migrations when the `sqlite-migrations` feature is enabled.
///
/// Example URL: `sqlite://runloom.db`. For `sqlite://`-scheme file URLs
/// the underlying file and parent directories are created if missing.
#[instrument(skip(database_url))]
pub async fn connect(database_url: &str) -> Result<SqlitePool, StoreError> {
    if let Some(path) = database_url.strip_prefix("sqlite://") {
        let path = path.trim();
        if !path.is_empty() && path != ":memory:" {
            let p = std::path::Path::new(path);
            if let Some(parent) = p.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if !p.exists() {
                // Ignore failures; connect reports the real error below.
                let _ = std::fs::File::create_new(p);
            }
        }
    }

    let pool = SqlitePool::connect(database_url)
        .await
        .map_err(|e| StoreError::Backend(format!("connect error: {e}")))?;

    #[cfg(feature = "sqlite-migrations")]
    {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Backend(format!("migration failure: {e}")))?;
    }
    #[cfg(not(feature = "sqlite-migrations"))]
    {
        // Feature disabled: external migration orchestration owns the schema.
    }

    Ok(pool)
}
