//! Feature access checks against the FeatureGate contract
//!
//! Every check validates the address first, then makes one bounded round-trip
//! to the contract. Failures are closed: a timeout or provider error is
//! [`Error::ChainQueryFailed`], never a grant.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::Address;
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::{canonical_address, parse_address};
use crate::error::{Error, Result};

/// Answer of the gating contract for one feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessResult {
    pub can_access: bool,
    pub reason: String,
}

/// Raw contract calls, implemented over RPC by
/// [`EvmFeatureGate`](crate::chain::EvmFeatureGate)
#[async_trait]
pub trait AccessGate: Send + Sync {
    async fn can_access(&self, feature: &str, user: Address) -> anyhow::Result<AccessResult>;

    /// Parallel `allowed` / `reasons` arrays as returned by `checkMultiple`
    async fn check_multiple(
        &self,
        features: &[String],
        user: Address,
    ) -> anyhow::Result<(Vec<bool>, Vec<String>)>;
}

/// Upper bound on cached `(feature, address)` answers
const ACCESS_CACHE_MAX_ENTRIES: usize = 10_000;

struct CachedAnswer {
    result: AccessResult,
    stored_at: Instant,
}

pub struct FeatureAccessChecker {
    gate: Arc<dyn AccessGate>,
    timeout: Duration,
    cache_ttl: Option<Duration>,
    cache_capacity: usize,
    cache: Mutex<HashMap<(String, String), CachedAnswer>>,
}

impl FeatureAccessChecker {
    pub fn new(gate: Arc<dyn AccessGate>, timeout: Duration) -> Self {
        Self {
            gate,
            timeout,
            cache_ttl: None,
            cache_capacity: ACCESS_CACHE_MAX_ENTRIES,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Keep successful answers for `ttl`. Errors are never cached.
    pub fn with_cache(mut self, ttl: Option<Duration>) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Check one feature for one address
    pub async fn check_access(&self, feature: &str, user_address: &str) -> Result<AccessResult> {
        let (user, normalized) = canonical_address(user_address)?;

        if let Some(hit) = self.cached(feature, &normalized) {
            debug!("Access cache hit for {} / {}", feature, normalized);
            return Ok(hit);
        }

        let result = self
            .bounded(self.gate.can_access(feature, user), "canAccess")
            .await?;

        self.store(feature, &normalized, &result);
        Ok(result)
    }

    /// Check several features with one `checkMultiple` call.
    ///
    /// Keys follow first-occurrence input order; duplicates collapse.
    pub async fn check_multiple(
        &self,
        feature_names: &[String],
        user_address: &str,
    ) -> Result<IndexMap<String, AccessResult>> {
        let user = parse_address(user_address)?;

        let mut seen = HashSet::new();
        let features: Vec<String> = feature_names
            .iter()
            .filter(|f| seen.insert(f.as_str()))
            .cloned()
            .collect();

        if features.is_empty() {
            return Ok(IndexMap::new());
        }

        let (allowed, reasons) = self
            .bounded(self.gate.check_multiple(&features, user), "checkMultiple")
            .await?;

        if allowed.len() != features.len() || reasons.len() != features.len() {
            warn!(
                "checkMultiple returned {} / {} entries for {} features",
                allowed.len(),
                reasons.len(),
                features.len()
            );
            return Err(Error::ChainQueryFailed(format!(
                "checkMultiple returned {} results for {} features",
                allowed.len().min(reasons.len()),
                features.len()
            )));
        }

        Ok(features
            .into_iter()
            .zip(allowed.into_iter().zip(reasons))
            .map(|(feature, (can_access, reason))| (feature, AccessResult { can_access, reason }))
            .collect())
    }

    /// Fail with [`Error::AccessDenied`] unless the contract grants `feature`
    pub async fn require_access(&self, feature: &str, user_address: &str) -> Result<()> {
        let result = self.check_access(feature, user_address).await?;
        if result.can_access {
            Ok(())
        } else {
            Err(Error::AccessDenied {
                feature: feature.to_string(),
                reason: result.reason,
            })
        }
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = anyhow::Result<T>>,
        method: &str,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!("{} failed: {:#}", method, e);
                Err(Error::ChainQueryFailed(format!("{}: {}", method, e)))
            }
            Err(_) => {
                warn!("{} timed out after {:?}", method, self.timeout);
                Err(Error::ChainQueryFailed(format!(
                    "{} timed out after {}s",
                    method,
                    self.timeout.as_secs()
                )))
            }
        }
    }

    fn cached(&self, feature: &str, user: &str) -> Option<AccessResult> {
        let ttl = self.cache_ttl?;
        let mut cache = self.cache.lock();
        let key = (feature.to_string(), user.to_string());
        match cache.get(&key) {
            Some(entry) if entry.stored_at.elapsed() < ttl => Some(entry.result.clone()),
            Some(_) => {
                cache.remove(&key);
                None
            }
            None => None,
        }
    }

    fn store(&self, feature: &str, user: &str, result: &AccessResult) {
        let Some(ttl) = self.cache_ttl else {
            return;
        };
        let mut cache = self.cache.lock();
        let key = (feature.to_string(), user.to_string());

        if cache.len() >= self.cache_capacity && !cache.contains_key(&key) {
            cache.retain(|_, entry| entry.stored_at.elapsed() < ttl);
            if cache.len() >= self.cache_capacity {
                debug!("Access cache full ({} entries), not caching", cache.len());
                return;
            }
        }

        cache.insert(
            key,
            CachedAnswer {
                result: result.clone(),
                stored_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) const USER: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    /// Grants every feature listed in `granted`
    #[derive(Default)]
    pub(crate) struct FakeGate {
        pub granted: Vec<String>,
        pub calls: AtomicUsize,
        pub fail: bool,
        pub truncate: bool,
        pub delay: Option<Duration>,
    }

    impl FakeGate {
        pub(crate) fn granting(features: &[&str]) -> Self {
            Self {
                granted: features.iter().map(|f| f.to_string()).collect(),
                ..Default::default()
            }
        }

        fn answer(&self, feature: &str) -> AccessResult {
            if self.granted.iter().any(|g| g == feature) {
                AccessResult {
                    can_access: true,
                    reason: "Access granted".to_string(),
                }
            } else {
                AccessResult {
                    can_access: false,
                    reason: "Insufficient BROski$ balance".to_string(),
                }
            }
        }
    }

    #[async_trait]
    impl AccessGate for FakeGate {
        async fn can_access(&self, feature: &str, _user: Address) -> anyhow::Result<AccessResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                anyhow::bail!("connection refused");
            }
            Ok(self.answer(feature))
        }

        async fn check_multiple(
            &self,
            features: &[String],
            _user: Address,
        ) -> anyhow::Result<(Vec<bool>, Vec<String>)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("connection refused");
            }
            let mut answers: Vec<AccessResult> = features.iter().map(|f| self.answer(f)).collect();
            if self.truncate {
                answers.pop();
            }
            Ok(answers
                .into_iter()
                .map(|a| (a.can_access, a.reason))
                .unzip())
        }
    }

    fn checker(gate: FakeGate) -> (FeatureAccessChecker, Arc<FakeGate>) {
        let gate = Arc::new(gate);
        (
            FeatureAccessChecker::new(gate.clone(), Duration::from_millis(200)),
            gate,
        )
    }

    #[tokio::test]
    async fn test_check_access_passes_contract_answer_through() {
        let (checker, _) = checker(FakeGate::granting(&["ai-assist"]));

        let granted = checker.check_access("ai-assist", USER).await.unwrap();
        assert!(granted.can_access);

        let denied = checker.check_access("deploy-mainnet", USER).await.unwrap();
        assert!(!denied.can_access);
        assert_eq!(denied.reason, "Insufficient BROski$ balance");
    }

    #[tokio::test]
    async fn test_invalid_address_never_reaches_chain() {
        let (checker, gate) = checker(FakeGate::granting(&["ai-assist"]));

        let err = checker.check_access("ai-assist", "0x123").await.unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(_)));
        let err = checker
            .check_multiple(&["ai-assist".to_string()], "not-an-address")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(_)));
        assert_eq!(gate.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_check_multiple_collapses_duplicates_in_order() {
        let (checker, gate) = checker(FakeGate::granting(&["b"]));
        let features: Vec<String> = ["b", "a", "b"].iter().map(|s| s.to_string()).collect();

        let results = checker.check_multiple(&features, USER).await.unwrap();
        let keys: Vec<&str> = results.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert!(results["b"].can_access);
        assert!(!results["a"].can_access);
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_length_mismatch_fails_closed() {
        let (checker, _) = checker(FakeGate {
            truncate: true,
            ..FakeGate::granting(&["a", "b"])
        });
        let features = vec!["a".to_string(), "b".to_string()];

        let err = checker.check_multiple(&features, USER).await.unwrap_err();
        assert!(matches!(err, Error::ChainQueryFailed(_)));
    }

    #[tokio::test]
    async fn test_provider_error_and_timeout_fail_closed() {
        let (checker, _) = checker(FakeGate {
            fail: true,
            ..Default::default()
        });
        let err = checker.check_access("ai-assist", USER).await.unwrap_err();
        assert!(matches!(err, Error::ChainQueryFailed(_)));

        let (checker, _) = checker_with_delay(Duration::from_secs(5));
        let err = checker.check_access("ai-assist", USER).await.unwrap_err();
        assert!(matches!(err, Error::ChainQueryFailed(_)));
        assert!(err.is_transient());
    }

    fn checker_with_delay(delay: Duration) -> (FeatureAccessChecker, Arc<FakeGate>) {
        checker(FakeGate {
            delay: Some(delay),
            ..FakeGate::granting(&["ai-assist"])
        })
    }

    #[tokio::test]
    async fn test_require_access_maps_denial() {
        let (checker, _) = checker(FakeGate::granting(&[]));

        match checker.require_access("deploy-mainnet", USER).await {
            Err(Error::AccessDenied { feature, reason }) => {
                assert_eq!(feature, "deploy-mainnet");
                assert_eq!(reason, "Insufficient BROski$ balance");
            }
            other => panic!("expected AccessDenied, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cache_only_when_enabled() {
        let (checker, gate) = checker(FakeGate::granting(&["ai-assist"]));
        checker.check_access("ai-assist", USER).await.unwrap();
        checker.check_access("ai-assist", USER).await.unwrap();
        assert_eq!(gate.calls.load(Ordering::SeqCst), 2);

        let gate = Arc::new(FakeGate::granting(&["ai-assist"]));
        let checker = FeatureAccessChecker::new(gate.clone(), Duration::from_millis(200))
            .with_cache(Some(Duration::from_secs(60)));
        checker.check_access("ai-assist", USER).await.unwrap();
        // Same address in another case hits the same entry
        checker
            .check_access("ai-assist", &USER.to_lowercase())
            .await
            .unwrap();
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_stays_bounded() {
        let gate = Arc::new(FakeGate::granting(&["a"]));
        let mut checker = FeatureAccessChecker::new(gate.clone(), Duration::from_millis(200))
            .with_cache(Some(Duration::from_millis(20)));
        checker.cache_capacity = 2;

        checker.check_access("a", USER).await.unwrap();
        checker.check_access("b", USER).await.unwrap();
        // Full of live entries: answered but not cached
        checker.check_access("c", USER).await.unwrap();
        assert_eq!(checker.cache.lock().len(), 2);
        checker.check_access("c", USER).await.unwrap();
        assert_eq!(gate.calls.load(Ordering::SeqCst), 4);

        // Expired entries are dropped to make room
        tokio::time::sleep(Duration::from_millis(30)).await;
        checker.check_access("d", USER).await.unwrap();
        assert_eq!(checker.cache.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let gate = Arc::new(FakeGate {
            fail: true,
            ..Default::default()
        });
        let checker = FeatureAccessChecker::new(gate.clone(), Duration::from_millis(200))
            .with_cache(Some(Duration::from_secs(60)));

        assert!(checker.check_access("ai-assist", USER).await.is_err());
        assert!(checker.check_access("ai-assist", USER).await.is_err());
        assert_eq!(gate.calls.load(Ordering::SeqCst), 2);
    }
}
