//! # meridian-engine: The Pricing Pipeline
//!
//! The service layer of the Meridian pricing engine: the
//! `Prepare → Compute → Commit` pipeline, the background outbox
//! publisher, webhook fan-out, and metrics.
//!
//! ## Pipeline Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     meridian-engine (THIS CRATE)                        │
//! │                                                                         │
//! │  CalculateRequest                                                       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌──────────────┐  cache / coalesce / delta / normalise / freeze       │
//! │  │   PREPARE    │  (I/O-bound; suspends at the database)               │
//! │  └──────┬───────┘                                                       │
//! │         ▼                                                               │
//! │  ┌──────────────┐  pure function, CPU-bound, never suspends            │
//! │  │   COMPUTE    │  (meridian-core; blocking thread + wall ceiling)     │
//! │  └──────┬───────┘                                                       │
//! │         ▼                                                               │
//! │  ┌──────────────┐  idempotency / advisory lock / one transaction:      │
//! │  │   COMMIT     │  result + audit + PENDING outbox row                 │
//! │  └──────┬───────┘                                                       │
//! │         │ post-commit: caches, metrics, webhooks                        │
//! │         ▼                                                               │
//! │  ┌──────────────┐  background loop: claim due rows, publish to         │
//! │  │   OUTBOX     │  broker, retry with backoff, dead-letter             │
//! │  └──────────────┘                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod broker;
pub mod commit;
pub mod compute;
pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod outbox;
pub mod prepare;
pub mod request;
pub mod webhook;

pub use broker::{DomainEvent, EventPublisher, InMemoryPublisher, CALCULATION_COMPLETED};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use orchestrator::{PipelinePlan, PricingEngine};
pub use outbox::{OutboxConfig, OutboxPublisher, OutboxPublisherHandle};
pub use request::{CalculateRequest, CalculateResponse, StageTimings};
