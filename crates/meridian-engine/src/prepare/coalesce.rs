//! # Request Coalescing
//!
//! Concurrent callers preparing the same proposal share one in-flight
//! future (stampede prevention): the first caller becomes the leader
//! and runs the load; everyone else awaits the same shared future and
//! observes the same outcome - including a deadline timeout. The map
//! entry is removed when the future completes, from inside the shared
//! future itself, so exactly one removal happens no matter how many
//! waiters there are.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::{BoxFuture, FutureExt, Shared};

use meridian_core::types::FrozenInput;

use crate::error::EngineError;

/// Shared outcome type: both sides are cheaply cloneable for every
/// waiter.
pub type PrepareOutcome = Result<Arc<FrozenInput>, Arc<EngineError>>;

type SharedPrepare = Shared<BoxFuture<'static, PrepareOutcome>>;

/// Coalesces in-flight preparations per proposal id.
pub struct Coalescer {
    inflight: Arc<Mutex<HashMap<String, SharedPrepare>>>,
}

impl Coalescer {
    pub fn new() -> Self {
        Coalescer {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Joins the in-flight preparation for `key`, or becomes the leader
    /// by installing the future `make` produces. `make` is only called
    /// when there is no in-flight entry.
    pub fn join<F>(&self, key: &str, make: F) -> SharedPrepare
    where
        F: FnOnce() -> BoxFuture<'static, PrepareOutcome>,
    {
        let mut inflight = self.inflight.lock().expect("coalescer lock poisoned");

        if let Some(existing) = inflight.get(key) {
            return existing.clone();
        }

        let map = Arc::clone(&self.inflight);
        let owned_key = key.to_string();
        let future = make();
        let shared = async move {
            let outcome = future.await;
            map.lock().expect("coalescer lock poisoned").remove(&owned_key);
            outcome
        }
        .boxed()
        .shared();

        inflight.insert(key.to_string(), shared.clone());
        shared
    }

    /// Number of in-flight preparations.
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().expect("coalescer lock poisoned").len()
    }
}

impl Default for Coalescer {
    fn default() -> Self {
        Coalescer::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn frozen_stub() -> Arc<FrozenInput> {
        use meridian_core::types::*;
        use rust_decimal::Decimal;
        Arc::new(FrozenInput {
            proposal_id: "p1".into(),
            tenant: None,
            schema_version: "1".into(),
            line_items: vec![],
            modifiers: vec![],
            dependencies: vec![],
            rules: vec![],
            tax_config: TaxConfig {
                mode: TaxMode::Retail,
                retail_rate: Decimal::ZERO,
                use_tax_rate: Decimal::ZERO,
                jurisdictions: vec![],
                schema_version: "1".into(),
            },
            context_seed: json!({}),
            fingerprint: "fp".into(),
        })
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_load() {
        let coalescer = Arc::new(Coalescer::new());
        let loads = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let coalescer = Arc::clone(&coalescer);
            let loads = Arc::clone(&loads);
            handles.push(tokio::spawn(async move {
                coalescer
                    .join("p1", move || {
                        async move {
                            loads.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            Ok(frozen_stub())
                        }
                        .boxed()
                    })
                    .await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entry_removed_after_completion() {
        let coalescer = Coalescer::new();
        let fut = coalescer.join("p1", || async { Ok(frozen_stub()) }.boxed());
        assert_eq!(coalescer.inflight_count(), 1);
        fut.await.unwrap();
        assert_eq!(coalescer.inflight_count(), 0);

        // A later call runs a fresh load.
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        coalescer
            .join("p1", move || {
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(frozen_stub())
                }
                .boxed()
            })
            .await
            .unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_waiters_observe_the_same_error() {
        let coalescer = Arc::new(Coalescer::new());
        let first = coalescer.join("p1", || {
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(Arc::new(EngineError::Timeout { stage: "preparation".into() }))
            }
            .boxed()
        });
        let second = coalescer.join("p1", || unreachable!("second caller must join, not load"));

        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap_err().kind(), "RESOURCE_LIMIT");
        assert_eq!(b.unwrap_err().kind(), "RESOURCE_LIMIT");
    }

    #[tokio::test]
    async fn test_distinct_proposals_do_not_coalesce() {
        let coalescer = Coalescer::new();
        let loads = Arc::new(AtomicUsize::new(0));
        for key in ["p1", "p2"] {
            let counter = Arc::clone(&loads);
            coalescer
                .join(key, move || {
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(frozen_stub())
                    }
                    .boxed()
                })
                .await
                .unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }
}
