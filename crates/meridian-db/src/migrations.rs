//! # Database Migrations
//!
//! Embedded SQL migrations for the Meridian schema.
//!
//! ## Adding New Migrations
//!
//! 1. Create a new file in `migrations/postgres/` with the next sequence
//!    number (`NNN_description.sql`)
//! 2. Write idempotent SQL (`IF NOT EXISTS` where possible)
//! 3. **NEVER** modify existing migrations - always add new ones

use sqlx::PgPool;

use crate::error::{DbError, DbResult};

/// Embedded migrations from the `migrations/postgres` directory.
///
/// The `sqlx::migrate!()` macro embeds all SQL files from the specified
/// directory into the binary at compile time. No runtime file access
/// needed.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/postgres");

/// Runs all pending database migrations.
///
/// Idempotent and ordered: applied migrations are tracked in
/// `_sqlx_migrations`, pending ones run in filename order, each in its
/// own transaction.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| DbError::MigrationFailed(e.to_string()))
}
