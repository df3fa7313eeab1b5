//! # Preparation Stage
//!
//! Produces a normalised, immutable, deterministic input from a raw
//! request.
//!
//! ## Decision Tree
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  prepare(request)                                                       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  fingerprint(request minus changes) ──► cache lookup                   │
//! │       │                                                                 │
//! │       ├── HIT, no changes ────────────► return cached input            │
//! │       │                                                                 │
//! │       ├── HIT, MODIFIER_ONLY/LINE_ITEM changes                         │
//! │       │        │                                                        │
//! │       │        ├── optimiser says PATCH ──► new frozen input from      │
//! │       │        │                            cached + delta             │
//! │       │        └── optimiser says REBUILD ─► fall through to load      │
//! │       │                                                                 │
//! │       └── MISS ───► COALESCED fresh load (one in-flight per proposal): │
//! │                     inline payload, or snapshot from the store         │
//! │                     → normalise → compile rules (cached) → freeze      │
//! │                     → cache → every concurrent caller gets the same    │
//! │                       Arc<FrozenInput>                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The frozen input is deep-immutable by construction: this stage owns
//! the only build, and everything downstream sees `Arc<FrozenInput>`.

pub mod cache;
pub mod coalesce;
pub mod delta;
pub mod normalize;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{debug, warn};

use meridian_core::fingerprint::fingerprint;
use meridian_core::rules::{compile_rule, CompiledRule, RuleExpr};
use meridian_core::types::FrozenInput;

use meridian_db::{ProposalSnapshot, SnapshotRepository};

use crate::error::{EngineError, EngineResult};
use crate::request::{request_fingerprint, CalculateRequest, ChangeType};

use cache::TtlCache;
use coalesce::Coalescer;
use delta::{DeltaConfig, DeltaDecision, DeltaOptimizer};

// =============================================================================
// Snapshot Source
// =============================================================================

/// Where fresh loads come from when a request has no inline payload.
/// The database implementation is the production one; tests substitute
/// in-memory sources.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, proposal_id: &str) -> EngineResult<Option<ProposalSnapshot>>;
}

/// Production source backed by the snapshot repository.
pub struct DbSnapshotSource {
    repository: SnapshotRepository,
}

impl DbSnapshotSource {
    pub fn new(repository: SnapshotRepository) -> Self {
        DbSnapshotSource { repository }
    }
}

#[async_trait]
impl SnapshotSource for DbSnapshotSource {
    async fn fetch(&self, proposal_id: &str) -> EngineResult<Option<ProposalSnapshot>> {
        self.repository
            .fetch(proposal_id)
            .await
            .map_err(|e| EngineError::DataFetch(e.to_string()))
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Preparation stage knobs.
#[derive(Debug, Clone)]
pub struct PrepareConfig {
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub rule_cache_capacity: usize,
    /// Deadline for one coalesced load; every waiter observes the
    /// timeout together.
    pub deadline: Duration,
    pub delta_enabled: bool,
}

impl Default for PrepareConfig {
    fn default() -> Self {
        PrepareConfig {
            cache_ttl: Duration::from_secs(3600),
            cache_capacity: 1_000,
            rule_cache_capacity: 5_000,
            deadline: Duration::from_secs(30),
            delta_enabled: true,
        }
    }
}

// =============================================================================
// Stage
// =============================================================================

/// Compiled-rule cache key: `(tenant, content hash, schema version)`.
type RuleCacheKey = (String, String, String);

/// The preparation stage.
pub struct PrepareStage {
    source: Arc<dyn SnapshotSource>,
    cache: Arc<TtlCache<String, Arc<FrozenInput>>>,
    rule_cache: Arc<TtlCache<RuleCacheKey, Arc<RuleExpr>>>,
    coalescer: Coalescer,
    optimizer: DeltaOptimizer,
    config: PrepareConfig,
}

impl PrepareStage {
    pub fn new(source: Arc<dyn SnapshotSource>, config: PrepareConfig) -> Self {
        PrepareStage {
            cache: Arc::new(TtlCache::new(config.cache_ttl, config.cache_capacity)),
            rule_cache: Arc::new(TtlCache::new(config.cache_ttl, config.rule_cache_capacity)),
            coalescer: Coalescer::new(),
            optimizer: DeltaOptimizer::new(DeltaConfig {
                cache_ttl: config.cache_ttl,
                ..DeltaConfig::default()
            }),
            source,
            config,
        }
    }

    /// Produces the frozen input for one request.
    pub async fn prepare(&self, request: &CalculateRequest) -> EngineResult<Arc<FrozenInput>> {
        let cache_key = request_fingerprint(request);

        if let Some((cached, age)) = self.cache.get_with_age(&cache_key) {
            match &request.changes {
                None => {
                    debug!(proposal_id = %request.proposal_id, "Prepare cache hit");
                    return Ok(cached);
                }
                Some(changes)
                    if self.config.delta_enabled
                        && matches!(
                            changes.change_type,
                            ChangeType::ModifierOnly | ChangeType::LineItem
                        ) =>
                {
                    let decision = self.optimizer.decide(
                        &request.proposal_id,
                        &cached,
                        age,
                        &request.config.schema_version,
                        changes,
                    );
                    match decision {
                        DeltaDecision::Patch => {
                            match delta::apply_delta(&cached, changes) {
                                Ok(patched) => {
                                    debug!(proposal_id = %request.proposal_id, "Applied delta patch");
                                    let patched = Arc::new(patched);
                                    self.cache.insert(cache_key, patched.clone());
                                    return Ok(patched);
                                }
                                Err(error) => {
                                    self.optimizer.record_failure(&request.proposal_id);
                                    warn!(
                                        proposal_id = %request.proposal_id,
                                        %error,
                                        "Delta patch failed; rebuilding"
                                    );
                                }
                            }
                        }
                        DeltaDecision::Rebuild(reason) => {
                            debug!(proposal_id = %request.proposal_id, reason, "Delta rebuild");
                        }
                    }
                }
                Some(_) => {
                    debug!(proposal_id = %request.proposal_id, "Structural change; rebuilding");
                }
            }
        }

        self.fresh_load(request, cache_key).await
    }

    /// Coalesced fresh load: one in-flight build per proposal id.
    async fn fresh_load(
        &self,
        request: &CalculateRequest,
        cache_key: String,
    ) -> EngineResult<Arc<FrozenInput>> {
        let shared = self.coalescer.join(&request.proposal_id, || {
            let source = Arc::clone(&self.source);
            let cache = Arc::clone(&self.cache);
            let rule_cache = Arc::clone(&self.rule_cache);
            let request = request.clone();
            let deadline = self.config.deadline;

            async move {
                let load = build_frozen(source, rule_cache, request, cache_key.clone());
                match tokio::time::timeout(deadline, load).await {
                    Err(_) => Err(Arc::new(EngineError::Timeout {
                        stage: "preparation".to_string(),
                    })),
                    Ok(Err(error)) => Err(Arc::new(error)),
                    Ok(Ok(frozen)) => {
                        cache.insert(cache_key, frozen.clone());
                        Ok(frozen)
                    }
                }
            }
            .boxed()
        });

        shared.await.map_err(|error| clone_for_waiter(&error))
    }
}

// =============================================================================
// Load + Freeze
// =============================================================================

async fn build_frozen(
    source: Arc<dyn SnapshotSource>,
    rule_cache: Arc<TtlCache<RuleCacheKey, Arc<RuleExpr>>>,
    request: CalculateRequest,
    fingerprint_key: String,
) -> EngineResult<Arc<FrozenInput>> {
    let effective = if request.has_inline_payload() {
        request
    } else {
        let snapshot = source
            .fetch(&request.proposal_id)
            .await?
            .ok_or_else(|| {
                EngineError::DataFetch(format!("proposal '{}' not found", request.proposal_id))
            })?;
        normalize::request_from_snapshot(&request, &snapshot)
    };

    let normalized = normalize::normalize(&effective)?;
    let rules = compile_cached(
        &rule_cache,
        effective.tenant.as_deref().unwrap_or(""),
        &effective.config.schema_version,
        &normalized.rule_sources,
    )?;

    Ok(Arc::new(FrozenInput {
        proposal_id: effective.proposal_id.clone(),
        tenant: effective.tenant.clone(),
        schema_version: effective.config.schema_version.clone(),
        line_items: normalized.line_items,
        modifiers: normalized.modifiers,
        dependencies: normalized.dependencies,
        rules,
        tax_config: normalized.tax_config,
        context_seed: effective.context.clone(),
        fingerprint: fingerprint_key,
    }))
}

/// Compiles rules through the `(tenant, content hash, version)` cache.
/// The cache stores bare expression trees; the modifier binding is
/// re-attached per rule so equal expressions on different modifiers
/// share one compilation.
fn compile_cached(
    rule_cache: &TtlCache<RuleCacheKey, Arc<RuleExpr>>,
    tenant: &str,
    schema_version: &str,
    sources: &[(String, serde_json::Value)],
) -> EngineResult<Vec<CompiledRule>> {
    let mut compiled = Vec::with_capacity(sources.len());

    for (modifier_id, expression) in sources {
        let key = (
            tenant.to_string(),
            fingerprint(expression),
            schema_version.to_string(),
        );

        let expr = match rule_cache.get(&key) {
            Some(cached) => cached,
            None => {
                let fresh = Arc::new(compile_rule(modifier_id, expression)?.expr);
                rule_cache.insert(key, fresh.clone());
                fresh
            }
        };

        compiled.push(CompiledRule {
            modifier_id: modifier_id.clone(),
            expr: (*expr).clone(),
        });
    }

    Ok(compiled)
}

/// Clones an engine error for a coalesced waiter. Snapshot-stage errors
/// are all value-shaped; raw database errors degrade to their fetch
/// message.
fn clone_for_waiter(error: &EngineError) -> EngineError {
    match error {
        EngineError::Core(e) => EngineError::Core(e.clone()),
        EngineError::DataFetch(s) => EngineError::DataFetch(s.clone()),
        EngineError::Timeout { stage } => EngineError::Timeout { stage: stage.clone() },
        EngineError::Database(e) => EngineError::DataFetch(e.to_string()),
        EngineError::EventPublish(s) => EngineError::EventPublish(s.clone()),
        EngineError::Webhook(s) => EngineError::Webhook(s.clone()),
        EngineError::Config(s) => EngineError::Config(s.clone()),
        EngineError::Shutdown => EngineError::Shutdown,
        EngineError::Internal(s) => EngineError::Internal(s.clone()),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
