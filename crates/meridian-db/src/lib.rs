//! # meridian-db: PostgreSQL Layer for Meridian
//!
//! Database access for the Meridian pricing engine: connection pooling,
//! embedded migrations, consistent snapshot reads, result/audit/outbox
//! persistence, and per-proposal advisory locks.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Meridian Data Flow                                │
//! │                                                                         │
//! │  meridian-engine (prepare + commit stages)                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  meridian-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐   ┌───────────────┐   ┌──────────────┐    │   │
//! │  │   │   Database    │   │  Repositories │   │  Migrations  │    │   │
//! │  │   │   (pool.rs)   │   │  snapshot     │   │  (embedded)  │    │   │
//! │  │   │               │◄──│  results      │   │  001_...sql  │    │   │
//! │  │   │   PgPool      │   │  outbox       │   │  002_...sql  │    │   │
//! │  │   └───────────────┘   └───────────────┘   └──────────────┘    │   │
//! │  │           │                                                     │   │
//! │  │   ┌───────▼───────┐                                            │   │
//! │  │   │ advisory.rs   │  per-proposal commit exclusion             │   │
//! │  │   └───────────────┘                                            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  PostgreSQL                                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Repositories use runtime-checked queries (`sqlx::query_as` +
//! `.bind()`), so the crate builds without a live database.

pub mod advisory;
pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use advisory::{lock_key, ProposalLock};
pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use repository::outbox::{OutboxRepository, OutboxRow, OutboxStatus};
pub use repository::results::{AuditGroup, AuditRecord, ResultsRepository};
pub use repository::snapshot::{ProposalSnapshot, SnapshotRepository};
