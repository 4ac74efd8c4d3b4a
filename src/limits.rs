//! Admission limits and retry discipline
//!
//! Three independent rate-limit gates guard submission, all evaluated
//! before any state is created:
//! - global: one service-wide window per minute
//! - per-user: one window per `(username, minute)`
//! - per-workflow tier: classified by agent-node count, one window per
//!   `(username, tag, minute)`
//!
//! A denied gate fails the submission with a retry-after hint. A limiter
//! backend error fails OPEN with a warning - availability over correctness
//! is the explicit choice for this one validator.
//!
//! Transient hot-store failures elsewhere use [`with_retries`]: bounded
//! exponential backoff, then surface.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::warn;

use crate::config::{RateLimitConfig, RetryConfig};
use crate::store::{HotStore, StoreError};
use crate::types::Username;

/// Workflow tier by agent-node count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowTier {
    /// No agent nodes
    Simple,
    /// 1-2 agent nodes
    Standard,
    /// 3+ agent nodes
    Heavy,
}

impl WorkflowTier {
    pub fn classify(agent_nodes: usize) -> Self {
        match agent_nodes {
            0 => WorkflowTier::Simple,
            1..=2 => WorkflowTier::Standard,
            _ => WorkflowTier::Heavy,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkflowTier::Simple => "simple",
            WorkflowTier::Standard => "standard",
            WorkflowTier::Heavy => "heavy",
        }
    }
}

/// Admission denial
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("rate limit exceeded ({scope}), retry after {retry_after_secs}s")]
pub struct RateLimitExceeded {
    /// Which gate denied: `global`, `user`, or `tier:{name}`
    pub scope: String,
    pub retry_after_secs: u64,
}

/// Three-gate sliding-window admission control
pub struct RateLimiter {
    hot: Arc<dyn HotStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(hot: Arc<dyn HotStore>, config: RateLimitConfig) -> Self {
        RateLimiter { hot, config }
    }

    /// Evaluate all gates for one submission
    pub async fn admit(
        &self,
        username: &Username,
        tag: &str,
        agent_nodes: usize,
    ) -> Result<(), RateLimitExceeded> {
        let epoch_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.admit_at(username, tag, agent_nodes, epoch_secs).await
    }

    /// Gate evaluation at an explicit clock (tests pin the minute)
    pub async fn admit_at(
        &self,
        username: &Username,
        tag: &str,
        agent_nodes: usize,
        epoch_secs: u64,
    ) -> Result<(), RateLimitExceeded> {
        let minute = epoch_secs / 60;
        let retry_after_secs = 60 - (epoch_secs % 60);
        let tier = WorkflowTier::classify(agent_nodes);
        let tier_limit = match tier {
            WorkflowTier::Simple => self.config.simple_per_minute,
            WorkflowTier::Standard => self.config.standard_per_minute,
            WorkflowTier::Heavy => self.config.heavy_per_minute,
        };

        let gates = [
            (
                format!("rl:global:{minute}"),
                self.config.global_per_minute,
                "global".to_string(),
            ),
            (
                format!("rl:user:{username}:{minute}"),
                self.config.user_per_minute,
                "user".to_string(),
            ),
            (
                format!("rl:tier:{username}:{tag}:{minute}"),
                tier_limit,
                format!("tier:{}", tier.name()),
            ),
        ];

        for (key, limit, scope) in gates {
            match self.hot.incr_window(&key).await {
                Ok(count) if count > limit => {
                    return Err(RateLimitExceeded {
                        scope,
                        retry_after_secs,
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    // fail open: admission over correctness
                    warn!(gate = %scope, error = %e, "rate limiter backend error, failing open");
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// RETRY DISCIPLINE
// ============================================================================

/// Retry a store operation with bounded exponential backoff
///
/// Only transient errors ([`StoreError::is_transient`]) retry; everything
/// else surfaces immediately.
pub async fn with_retries<T, F, Fut>(
    label: &str,
    retry: &RetryConfig,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < retry.max_attempts => {
                let backoff = Duration::from_millis(retry.base_backoff_ms << attempt);
                warn!(
                    op = label,
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "transient store error, backing off"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryHotStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn limiter(config: RateLimitConfig) -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryHotStore::new()), config)
    }

    fn user() -> Username {
        Username::new("alice").unwrap()
    }

    #[test]
    fn tier_classification() {
        assert_eq!(WorkflowTier::classify(0), WorkflowTier::Simple);
        assert_eq!(WorkflowTier::classify(1), WorkflowTier::Standard);
        assert_eq!(WorkflowTier::classify(2), WorkflowTier::Standard);
        assert_eq!(WorkflowTier::classify(3), WorkflowTier::Heavy);
        assert_eq!(WorkflowTier::classify(12), WorkflowTier::Heavy);
    }

    #[tokio::test]
    async fn heavy_tier_denies_at_its_limit() {
        let rl = limiter(RateLimitConfig::default());
        let now = 600; // minute 10

        for _ in 0..5 {
            rl.admit_at(&user(), "prod", 3, now).await.unwrap();
        }
        let err = rl.admit_at(&user(), "prod", 3, now).await.unwrap_err();
        assert_eq!(err.scope, "tier:heavy");
        assert_eq!(err.retry_after_secs, 60);
    }

    #[tokio::test]
    async fn windows_reset_each_minute() {
        let rl = limiter(RateLimitConfig::default());
        for _ in 0..5 {
            rl.admit_at(&user(), "prod", 3, 600).await.unwrap();
        }
        assert!(rl.admit_at(&user(), "prod", 3, 600).await.is_err());
        // next minute admits again
        rl.admit_at(&user(), "prod", 3, 660).await.unwrap();
    }

    #[tokio::test]
    async fn user_gate_is_independent_of_tag() {
        let rl = limiter(RateLimitConfig {
            user_per_minute: 3,
            ..Default::default()
        });
        rl.admit_at(&user(), "a", 0, 0).await.unwrap();
        rl.admit_at(&user(), "b", 0, 0).await.unwrap();
        rl.admit_at(&user(), "c", 0, 0).await.unwrap();
        let err = rl.admit_at(&user(), "d", 0, 0).await.unwrap_err();
        assert_eq!(err.scope, "user");

        // a different user is unaffected
        rl.admit_at(&Username::new("bob").unwrap(), "a", 0, 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn global_gate_spans_users() {
        let rl = limiter(RateLimitConfig {
            global_per_minute: 2,
            ..Default::default()
        });
        rl.admit_at(&user(), "a", 0, 0).await.unwrap();
        rl.admit_at(&Username::new("bob").unwrap(), "a", 0, 0)
            .await
            .unwrap();
        let err = rl
            .admit_at(&Username::new("carol").unwrap(), "a", 0, 0)
            .await
            .unwrap_err();
        assert_eq!(err.scope, "global");
    }

    #[tokio::test]
    async fn retry_helper_retries_transient_only() {
        let retry = RetryConfig {
            max_attempts: 3,
            base_backoff_ms: 1,
        };
        let calls = AtomicU32::new(0);
        let result: Result<u32, StoreError> = with_retries("test", &retry, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Unavailable {
                        detail: "flaky".to_string(),
                    })
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // non-transient errors surface immediately
        let calls = AtomicU32::new(0);
        let result: Result<(), StoreError> = with_retries("test", &retry, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::conflict("no")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_helper_gives_up_at_cap() {
        let retry = RetryConfig {
            max_attempts: 2,
            base_backoff_ms: 1,
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), StoreError> = with_retries("test", &retry, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(StoreError::Unavailable {
                    detail: "down".to_string(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Unavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
