//! # Orchestrator
//!
//! The thin driver over the three-stage pipeline:
//!
//! ```text
//! calculate(request)
//!     │
//!     ├── Prepare   coalesced, cached, deadline-bounded
//!     ├── Compute   pure, wall-ceiling-bounded, off the async runtime
//!     └── Commit    idempotent, advisory-locked, outbox-enqueueing
//! ```
//!
//! Per-stage latencies and error counts are recorded, and the timings
//! travel back to the caller as diagnostic fields outside the checksummed
//! result. A failure in any stage propagates without side-effecting the
//! later stages. After `shutdown()`, `calculate` refuses further work.
//!
//! Pipeline selection is a pure function from configuration to a
//! [`PipelinePlan`]; there is no global engine registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info};

use meridian_core::validate::ComputeLimits;
use meridian_db::{Database, DbConfig};

use crate::broker::EventPublisher;
use crate::commit::{CommitContext, CommitStage};
use crate::compute::run_compute;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::metrics::MetricsRegistry;
use crate::outbox::{OutboxConfig, OutboxPublisher, OutboxPublisherHandle};
use crate::prepare::{DbSnapshotSource, PrepareConfig, PrepareStage, SnapshotSource};
use crate::request::{CalculateRequest, CalculateResponse, StageTimings};
use crate::webhook::{WebhookConfig, WebhookDispatcher};

// =============================================================================
// Pipeline Plan
// =============================================================================

/// Everything the orchestrator derives from configuration. Pure: equal
/// configs produce equal plans.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub prepare: PrepareConfig,
    pub outbox: OutboxConfig,
    pub webhooks: WebhookConfig,
    pub limits: ComputeLimits,
    pub compute_timeout: Duration,
    pub request_deadline: Duration,
    pub result_cache_capacity: usize,
    pub cache_ttl: Duration,
}

impl PipelinePlan {
    /// Selects the pipeline for a configuration.
    pub fn from_config(config: &EngineConfig) -> PipelinePlan {
        PipelinePlan {
            prepare: PrepareConfig {
                cache_ttl: config.prepare_cache_ttl,
                cache_capacity: config.prepare_cache_capacity,
                rule_cache_capacity: config.rule_cache_capacity,
                deadline: config.request_deadline,
                delta_enabled: config.delta_enabled,
            },
            outbox: OutboxConfig {
                poll_interval: config.outbox_poll_interval,
                batch_size: config.outbox_batch_size,
                max_retries: config.outbox_max_retries,
            },
            webhooks: WebhookConfig {
                endpoints: config.webhook_endpoints.clone(),
                secret: config.webhook_secret.clone(),
                ..WebhookConfig::default()
            },
            limits: ComputeLimits::default(),
            compute_timeout: config.compute_timeout,
            request_deadline: config.request_deadline,
            result_cache_capacity: config.result_cache_capacity,
            cache_ttl: config.prepare_cache_ttl,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// The pricing engine: owns the three stages and their shared state.
pub struct PricingEngine {
    db: Database,
    prepare: PrepareStage,
    commit: CommitStage,
    metrics: Arc<MetricsRegistry>,
    plan: PipelinePlan,
    outbox_active: Arc<AtomicBool>,
    shutdown: AtomicBool,
}

impl PricingEngine {
    /// Connects to the database and assembles the pipeline.
    pub async fn connect(config: &EngineConfig) -> EngineResult<PricingEngine> {
        config.validate()?;
        let db = Database::connect(DbConfig::new(&config.database_url)).await?;
        let source = Arc::new(DbSnapshotSource::new(db.snapshots()));
        Ok(Self::assemble(db, source, PipelinePlan::from_config(config))?)
    }

    /// Assembles an engine over an existing database handle and
    /// snapshot source (tests inject in-memory sources here).
    pub fn assemble(
        db: Database,
        source: Arc<dyn SnapshotSource>,
        plan: PipelinePlan,
    ) -> EngineResult<PricingEngine> {
        let metrics = Arc::new(MetricsRegistry::new());
        let webhooks = Arc::new(WebhookDispatcher::new(plan.webhooks.clone())?);

        Ok(PricingEngine {
            prepare: PrepareStage::new(source, plan.prepare.clone()),
            commit: CommitStage::new(
                db.clone(),
                plan.cache_ttl,
                plan.result_cache_capacity,
                webhooks,
                Arc::clone(&metrics),
            ),
            db,
            metrics,
            plan,
            outbox_active: Arc::new(AtomicBool::new(false)),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Builds the background outbox publisher for this engine. The
    /// shared guard keeps it single-instance per process even if called
    /// twice.
    pub fn outbox_publisher(
        &self,
        broker: Arc<dyn EventPublisher>,
    ) -> (OutboxPublisher, OutboxPublisherHandle) {
        OutboxPublisher::new(
            self.db.clone(),
            broker,
            self.plan.outbox.clone(),
            Arc::clone(&self.outbox_active),
        )
    }

    /// Computes one proposal end to end.
    pub async fn calculate(&self, request: CalculateRequest) -> EngineResult<CalculateResponse> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(EngineError::Shutdown);
        }

        let started_wall = Utc::now();
        let started = Instant::now();
        debug!(proposal_id = %request.proposal_id, "Calculation started");

        // Preparation.
        let stage_start = Instant::now();
        let frozen = match self.prepare.prepare(&request).await {
            Ok(frozen) => frozen,
            Err(error) => {
                self.metrics.preparation.record_error();
                self.metrics.total.record_error();
                return Err(error);
            }
        };
        let preparation_ms = elapsed_ms(stage_start);
        self.metrics.preparation.record(stage_start.elapsed());

        // Pure computation.
        let stage_start = Instant::now();
        let result = match run_compute(
            Arc::clone(&frozen),
            self.plan.limits.clone(),
            self.plan.compute_timeout,
        )
        .await
        {
            Ok(result) => result,
            Err(error) => {
                self.metrics.compute.record_error();
                self.metrics.total.record_error();
                return Err(error);
            }
        };
        let compute_ms = elapsed_ms(stage_start);
        self.metrics.compute.record(stage_start.elapsed());

        // Commit, inside what remains of the request deadline.
        let stage_start = Instant::now();
        let remaining = self
            .plan
            .request_deadline
            .saturating_sub(started.elapsed())
            .max(Duration::from_millis(1));
        let context = CommitContext {
            started_at: started_wall,
            preparation_ms,
            compute_ms,
        };
        let committed = tokio::time::timeout(
            remaining,
            self.commit.commit(&frozen, result, context),
        )
        .await
        .unwrap_or_else(|_| {
            Err(EngineError::Timeout {
                stage: "commit".to_string(),
            })
        });

        let outcome = match committed {
            Ok(outcome) => outcome,
            Err(error) => {
                self.metrics.commit.record_error();
                self.metrics.total.record_error();
                return Err(error);
            }
        };
        let commit_ms = elapsed_ms(stage_start);
        self.metrics.commit.record(stage_start.elapsed());
        self.metrics.total.record(started.elapsed());

        info!(
            proposal_id = %outcome.result.proposal_id,
            checksum = %outcome.result.checksum,
            replay = outcome.replay,
            total_ms = elapsed_ms(started),
            "Calculation complete"
        );

        Ok(CalculateResponse {
            result: outcome.result,
            replay: outcome.replay,
            timings: StageTimings {
                preparation_ms,
                compute_ms,
                commit_ms,
                total_ms: elapsed_ms(started),
            },
        })
    }

    /// Cached result lookup by checksum (L1, post-commit only).
    pub fn cached_result(
        &self,
        checksum: &str,
    ) -> Option<Arc<meridian_core::types::CalculationResult>> {
        self.commit.cached_result(checksum)
    }

    /// Metrics for dashboards and tests.
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Stops accepting calculations. In-flight calls finish; later
    /// calls fail with `Shutdown`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        info!("Pricing engine shut down");
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

// =============================================================================
// Unit Tests
// =============================================================================
