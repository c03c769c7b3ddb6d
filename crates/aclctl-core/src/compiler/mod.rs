//! Compiler adapter: policy in, cached artifact out.
//!
//! The policy compiler itself is a black box behind [`PolicyCompiler`]. The
//! adapter normalizes the policy, consults the [`ArtifactCache`] by
//! fingerprint and only renders on a miss. Concurrent misses for the same
//! fingerprint inside one process are collapsed onto a single render; across
//! processes the cache's idempotent upsert makes the stored artifact
//! converge.

pub mod external;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use aclctl_state::{ArtifactCache, ArtifactRecord, PolicyFingerprint};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::coverage::{clamp_score, score_from_matches, Coverage};
use crate::domain::error::{AclError, Result};
use crate::domain::policy::Policy;
use crate::metrics::METRICS;

pub use external::ExternalCompiler;

/// What a compiler back-end produced for one policy.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Rendered {
    pub config_text: String,
    /// Score reported by the back-end, 0–100.
    pub coverage_score: Option<f64>,
    /// Terms matched by passing test cases, when the back-end reports those
    /// instead of a score.
    pub matched_terms: Option<Vec<String>>,
    pub diagnostics: Vec<String>,
}

impl Rendered {
    pub fn new(config_text: impl Into<String>, coverage_score: f64) -> Self {
        Self {
            config_text: config_text.into(),
            coverage_score: Some(coverage_score),
            ..Default::default()
        }
    }
}

/// Why a back-end produced no configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompilerFailure {
    /// The policy was rejected; diagnostics are passed through verbatim.
    #[error("{0}")]
    Rejected(String),
    /// The back-end could not run or answered nonsense. Says nothing about
    /// the policy.
    #[error("{0}")]
    Unavailable(String),
}

impl CompilerFailure {
    pub fn new(diagnostics: impl Into<String>) -> Self {
        CompilerFailure::Rejected(diagnostics.into())
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        CompilerFailure::Unavailable(reason.into())
    }
}

/// Synchronous `render(policy_document, platform)` boundary.
pub trait PolicyCompiler: Send + Sync + 'static {
    fn render(
        &self,
        document: &serde_json::Value,
        platform: &str,
    ) -> std::result::Result<Rendered, CompilerFailure>;
}

/// Result of [`CompilerAdapter::compile`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompileOutcome {
    pub artifact: ArtifactRecord,
    /// Served from the cache without rendering.
    pub cached: bool,
}

pub struct CompilerAdapter {
    compiler: Arc<dyn PolicyCompiler>,
    cache: Arc<dyn ArtifactCache>,
    inflight: Mutex<HashMap<PolicyFingerprint, Arc<tokio::sync::Mutex<()>>>>,
}

impl CompilerAdapter {
    pub fn new(compiler: Arc<dyn PolicyCompiler>, cache: Arc<dyn ArtifactCache>) -> Self {
        Self {
            compiler,
            cache,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Compile `policy`, serving from the cache when possible.
    ///
    /// A compiler rejection is returned as [`AclError::Compilation`] and is
    /// never retried here. A back-end that could not run at all is
    /// [`AclError::CompilerUnavailable`].
    #[instrument(skip_all, fields(policy = %policy.identity()))]
    pub async fn compile(&self, policy: &Policy) -> Result<CompileOutcome> {
        policy.validate()?;
        let normalized = policy.normalized();
        let fingerprint = normalized.fingerprint()?;

        if let Some(artifact) = self.cache.get(&fingerprint).await? {
            METRICS.inc_cache_hits();
            debug!(fingerprint = %fingerprint.short(), "artifact cache hit");
            return Ok(CompileOutcome {
                artifact,
                cached: true,
            });
        }

        let slot = self.slot(&fingerprint)?;
        let result = {
            let _guard = slot.lock().await;
            self.compile_locked(&normalized, &fingerprint).await
        };
        self.release_slot(&fingerprint, &slot);
        result
    }

    async fn compile_locked(
        &self,
        policy: &Policy,
        fingerprint: &PolicyFingerprint,
    ) -> Result<CompileOutcome> {
        // Another task may have filled the cache while we waited.
        if let Some(artifact) = self.cache.get(fingerprint).await? {
            METRICS.inc_cache_hits();
            return Ok(CompileOutcome {
                artifact,
                cached: true,
            });
        }

        let document = policy.document()?;
        let platform = policy.platform.clone();
        let compiler = self.compiler.clone();
        METRICS.inc_compiles();
        let rendered = tokio::task::spawn_blocking(move || compiler.render(&document, &platform))
            .await
            .map_err(|e| AclError::CompilerUnavailable(format!("compiler task aborted: {e}")))?;

        let rendered = match rendered {
            Ok(r) => r,
            Err(CompilerFailure::Rejected(diagnostics)) => {
                METRICS.inc_compile_failures();
                return Err(AclError::Compilation {
                    policy: policy.identity().to_string(),
                    diagnostics,
                });
            }
            Err(CompilerFailure::Unavailable(reason)) => {
                warn!(policy = %policy.identity(), reason = %reason, "compiler unavailable");
                return Err(AclError::CompilerUnavailable(reason));
            }
        };

        let coverage = coverage_of(policy, &rendered);
        let artifact = ArtifactRecord {
            fingerprint: fingerprint.clone(),
            policy: policy.identity(),
            filter_name: policy.filter_name(),
            config_text: rendered.config_text,
            diagnostics: rendered.diagnostics,
            coverage_score: coverage.score,
            uncovered_terms: coverage.uncovered_terms,
            compiled_at: Utc::now(),
        };
        let stored = self.cache.upsert(artifact).await?;
        info!(
            fingerprint = %fingerprint.short(),
            coverage = stored.coverage_score,
            "policy compiled"
        );
        Ok(CompileOutcome {
            artifact: stored,
            cached: false,
        })
    }

    fn slot(&self, fingerprint: &PolicyFingerprint) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut inflight = self
            .inflight
            .lock()
            .map_err(|_| AclError::Conflict("compile slot table poisoned".to_string()))?;
        Ok(inflight
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }

    fn release_slot(&self, fingerprint: &PolicyFingerprint, slot: &Arc<tokio::sync::Mutex<()>>) {
        if let Ok(mut inflight) = self.inflight.lock() {
            // Last user out removes the entry: the map holds one reference,
            // `slot` the other.
            if Arc::strong_count(slot) <= 2 {
                inflight.remove(fingerprint);
            }
        }
    }
}

impl std::fmt::Debug for CompilerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerAdapter").finish_non_exhaustive()
    }
}

fn coverage_of(policy: &Policy, rendered: &Rendered) -> Coverage {
    match (&rendered.matched_terms, rendered.coverage_score) {
        (Some(matched), score) => {
            let mut coverage = score_from_matches(&policy.term_names(), matched);
            if let Some(score) = score {
                coverage.score = clamp_score(score);
            }
            coverage
        }
        (None, Some(score)) => Coverage {
            score: clamp_score(score),
            uncovered_terms: Vec::new(),
        },
        (None, None) => Coverage {
            score: 0.0,
            uncovered_terms: policy.term_names(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::policy::{Action, Term};

    fn policy() -> Policy {
        Policy::new(
            "edge",
            "juniper",
            vec![
                Term::new("allow-ssh", Action::Accept),
                Term::new("deny-all", Action::Deny),
            ],
        )
    }

    #[test]
    fn test_coverage_prefers_matches_for_uncovered_list() {
        let rendered = Rendered {
            config_text: "x".into(),
            coverage_score: None,
            matched_terms: Some(vec!["deny-all".into()]),
            diagnostics: vec![],
        };
        let c = coverage_of(&policy(), &rendered);
        assert_eq!(c.score, 50.0);
        assert_eq!(c.uncovered_terms, vec!["allow-ssh".to_string()]);
    }

    #[test]
    fn test_coverage_reported_score_is_clamped() {
        let c = coverage_of(&policy(), &Rendered::new("x", 140.0));
        assert_eq!(c.score, 100.0);
        assert!(c.uncovered_terms.is_empty());
    }

    #[test]
    fn test_coverage_nothing_reported_is_zero() {
        let rendered = Rendered {
            config_text: "x".into(),
            ..Default::default()
        };
        let c = coverage_of(&policy(), &rendered);
        assert_eq!(c.score, 0.0);
        assert_eq!(c.uncovered_terms.len(), 2);
    }
}
