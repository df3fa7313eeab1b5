//! # Per-Proposal Advisory Locks
//!
//! PostgreSQL session advisory locks serialise commit transactions for
//! the same proposal: outcomes are as if applied sequentially, without
//! table-level locking.
//!
//! ## Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. Acquire a dedicated pooled connection                               │
//! │  2. SELECT pg_advisory_lock(CLASS, hash32(proposal_id))                │
//! │  3. Run the commit transaction ON THAT CONNECTION                      │
//! │  4. SELECT pg_advisory_unlock(...), return connection to pool          │
//! │                                                                         │
//! │  Guaranteed release: on the success path the caller unlocks            │
//! │  explicitly; on every other path the guard's Drop detaches the         │
//! │  connection from the pool and closes it, which releases all session    │
//! │  advisory locks server-side. A pooled connection is never returned     │
//! │  while still holding a lock.                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The lock identifier is the two-int form: a fixed class plus a 32-bit
//! hash of the proposal id (first four big-endian bytes of its SHA-256).

use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres};
use tracing::{debug, warn};

use crate::error::DbResult;

/// Advisory lock class for per-proposal commit exclusion. Distinguishes
/// Meridian's locks from anything else sharing the database.
const LOCK_CLASS: i32 = 0x4D45_5249; // "MERI"

/// 32-bit lock key for a proposal id.
pub fn lock_key(proposal_id: &str) -> i32 {
    let digest = Sha256::digest(proposal_id.as_bytes());
    i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// A held per-proposal advisory lock with its dedicated connection.
pub struct ProposalLock {
    conn: Option<PoolConnection<Postgres>>,
    key: i32,
}

impl ProposalLock {
    /// Blocks until the per-proposal lock is granted.
    pub async fn acquire(pool: &PgPool, proposal_id: &str) -> DbResult<ProposalLock> {
        let key = lock_key(proposal_id);
        let mut conn = pool.acquire().await?;

        sqlx::query("SELECT pg_advisory_lock($1, $2)")
            .bind(LOCK_CLASS)
            .bind(key)
            .execute(&mut *conn)
            .await?;

        debug!(proposal_id, key, "Advisory lock acquired");
        Ok(ProposalLock {
            conn: Some(conn),
            key,
        })
    }

    /// The connection holding the lock. The commit transaction must run
    /// here so lock and transaction share a session.
    pub fn connection(&mut self) -> &mut PgConnection {
        self.conn
            .as_mut()
            .expect("connection present until release")
    }

    /// Releases the lock and returns the connection to the pool.
    pub async fn release(mut self) -> DbResult<()> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("SELECT pg_advisory_unlock($1, $2)")
                .bind(LOCK_CLASS)
                .bind(self.key)
                .execute(&mut *conn)
                .await?;
            debug!(key = self.key, "Advisory lock released");
        }
        Ok(())
    }
}

impl Drop for ProposalLock {
    fn drop(&mut self) {
        // Not released explicitly (error or panic path): close the
        // connection instead of returning it to the pool. The server
        // drops all session advisory locks when the session ends.
        if let Some(conn) = self.conn.take() {
            warn!(key = self.key, "Advisory lock dropped without release; closing connection");
            drop(conn.detach());
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_is_stable() {
        assert_eq!(lock_key("prop-1"), lock_key("prop-1"));
        assert_ne!(lock_key("prop-1"), lock_key("prop-2"));
    }

    #[test]
    fn test_lock_key_uses_full_id() {
        // Long ids that share a prefix must still hash apart.
        let a = lock_key("proposal-00000000-0000-0000-0000-000000000001");
        let b = lock_key("proposal-00000000-0000-0000-0000-000000000002");
        assert_ne!(a, b);
    }
}
