// config.rs
//! Transaction tunables

use std::time::Duration;

use crate::document::DocId;
use crate::hooks::{AttemptContextTestingHooks, CleanupTestingHooks};

/// Durability applied to every staging, ATR and unstage mutation
///
/// # Levels
///
/// - **None**: in-memory on the active node only
/// - **Majority**: replicated to a majority of nodes
/// - **MajorityAndPersistToActive**: majority + persisted on the active
/// - **PersistToMajority**: persisted on a majority of nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityLevel {
    None,
    #[default]
    Majority,
    MajorityAndPersistToActive,
    PersistToMajority,
}

impl DurabilityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DurabilityLevel::None => "NONE",
            DurabilityLevel::Majority => "MAJORITY",
            DurabilityLevel::MajorityAndPersistToActive => "MAJORITY_AND_PERSIST_TO_ACTIVE",
            DurabilityLevel::PersistToMajority => "PERSIST_TO_MAJORITY",
        }
    }
}

/// Tunables for the transactions engine. Setters are chainable;
/// defaults are production defaults (15 s budget, 60 s cleanup window,
/// majority durability, both cleanup subsystems on).
pub struct TransactionConfig {
    durability_level: DurabilityLevel,
    expiration_time: Duration,
    cleanup_window: Duration,
    cleanup_lost_attempts: bool,
    cleanup_client_attempts: bool,
    kv_timeout: Option<Duration>,
    /// Override where ATR + client-record docs live ((scope, collection))
    metadata_collection: Option<(String, String)>,
    attempt_hooks: AttemptContextTestingHooks,
    cleanup_hooks: CleanupTestingHooks,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionConfig {
            durability_level: DurabilityLevel::Majority,
            expiration_time: Duration::from_secs(15),
            cleanup_window: Duration::from_secs(60),
            cleanup_lost_attempts: true,
            cleanup_client_attempts: true,
            kv_timeout: None,
            metadata_collection: None,
            attempt_hooks: AttemptContextTestingHooks::default(),
            cleanup_hooks: CleanupTestingHooks::default(),
        }
    }
}

impl TransactionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn durability_level(&self) -> DurabilityLevel {
        self.durability_level
    }

    pub fn set_durability_level(mut self, level: DurabilityLevel) -> Self {
        self.durability_level = level;
        self
    }

    pub fn expiration_time(&self) -> Duration {
        self.expiration_time
    }

    pub fn set_expiration_time(mut self, duration: Duration) -> Self {
        self.expiration_time = duration;
        self
    }

    pub fn cleanup_window(&self) -> Duration {
        self.cleanup_window
    }

    pub fn set_cleanup_window(mut self, duration: Duration) -> Self {
        self.cleanup_window = duration;
        self
    }

    pub fn cleanup_lost_attempts(&self) -> bool {
        self.cleanup_lost_attempts
    }

    pub fn set_cleanup_lost_attempts(mut self, value: bool) -> Self {
        self.cleanup_lost_attempts = value;
        self
    }

    pub fn cleanup_client_attempts(&self) -> bool {
        self.cleanup_client_attempts
    }

    pub fn set_cleanup_client_attempts(mut self, value: bool) -> Self {
        self.cleanup_client_attempts = value;
        self
    }

    pub fn kv_timeout(&self) -> Option<Duration> {
        self.kv_timeout
    }

    pub fn set_kv_timeout(mut self, timeout: Duration) -> Self {
        self.kv_timeout = Some(timeout);
        self
    }

    pub fn metadata_collection(&self) -> Option<(&str, &str)> {
        self.metadata_collection
            .as_ref()
            .map(|(scope, coll)| (scope.as_str(), coll.as_str()))
    }

    pub fn set_metadata_collection(
        mut self,
        scope: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        self.metadata_collection = Some((scope.into(), collection.into()));
        self
    }

    pub fn attempt_hooks(&self) -> &AttemptContextTestingHooks {
        &self.attempt_hooks
    }

    pub fn set_attempt_hooks(mut self, hooks: AttemptContextTestingHooks) -> Self {
        self.attempt_hooks = hooks;
        self
    }

    pub fn cleanup_hooks(&self) -> &CleanupTestingHooks {
        &self.cleanup_hooks
    }

    pub fn set_cleanup_hooks(mut self, hooks: CleanupTestingHooks) -> Self {
        self.cleanup_hooks = hooks;
        self
    }

    /// Identifier of a metadata document (ATR or client record) in
    /// `bucket`, honoring the metadata-collection override
    pub fn metadata_doc_id(&self, bucket: &str, key: &str) -> DocId {
        match &self.metadata_collection {
            Some((scope, collection)) => DocId::new(bucket, scope, collection, key),
            None => DocId::in_default_collection(bucket, key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransactionConfig::default();
        assert_eq!(config.durability_level(), DurabilityLevel::Majority);
        assert_eq!(config.expiration_time(), Duration::from_secs(15));
        assert_eq!(config.cleanup_window(), Duration::from_secs(60));
        assert!(config.cleanup_lost_attempts());
        assert!(config.cleanup_client_attempts());
        assert!(config.kv_timeout().is_none());
    }

    #[test]
    fn test_metadata_collection_override() {
        let config = TransactionConfig::new().set_metadata_collection("system", "txn");
        let id = config.metadata_doc_id("main", "_txn:client-record");
        assert_eq!(id.scope(), "system");
        assert_eq!(id.collection(), "txn");

        let config = TransactionConfig::default();
        let id = config.metadata_doc_id("main", "atr-0-#a");
        assert_eq!(id.scope(), "_default");
        assert_eq!(id.collection(), "_default");
    }
}
