// helpers.rs
// Shared fixture for the transaction integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use forgetx_core::kv::{LookupInOptions, LookupInSpec};
use forgetx_core::{
    DocId, DurabilityLevel, KvClient, KvError, MemoryCluster, TransactionConfig, Transactions,
};

pub const BUCKET: &str = "default";

pub fn cluster() -> Arc<MemoryCluster> {
    Arc::new(MemoryCluster::single_bucket(BUCKET))
}

pub fn doc_id(key: &str) -> DocId {
    DocId::in_default_collection(BUCKET, key)
}

/// Unique key per test run so tests never collide on shared ATR docs
pub fn unique_key(prefix: &str) -> String {
    format!("{}::{}", prefix, uuid::Uuid::new_v4())
}

/// Config for deterministic tests: no replication to wait on, background
/// cleanup off (tests drive cleanup explicitly)
pub fn test_config() -> TransactionConfig {
    TransactionConfig::new()
        .set_durability_level(DurabilityLevel::None)
        .set_expiration_time(Duration::from_secs(5))
        .set_cleanup_window(Duration::from_secs(1))
        .set_cleanup_lost_attempts(false)
        .set_cleanup_client_attempts(false)
}

pub fn transactions(cluster: &Arc<MemoryCluster>) -> Transactions {
    transactions_with(cluster, test_config())
}

pub fn transactions_with(cluster: &Arc<MemoryCluster>, config: TransactionConfig) -> Transactions {
    let client: Arc<dyn KvClient> = cluster.clone();
    Transactions::new(client, config)
}

/// Seed a document outside any transaction
pub fn upsert_doc(cluster: &MemoryCluster, id: &DocId, content: Value) -> u64 {
    cluster
        .insert(id, &content, DurabilityLevel::None, None)
        .expect("seeding document")
        .cas
}

/// Read a document the way a non-transactional client would
pub fn plain_get(cluster: &MemoryCluster, id: &DocId) -> Result<Value, KvError> {
    cluster.get(id, None).map(|res| res.content)
}

/// The document's `txn` xattr block, tombstones included. None when the
/// document does not exist at all or carries no block.
pub fn txn_xattrs(cluster: &MemoryCluster, id: &DocId) -> Option<Value> {
    let specs = [LookupInSpec::get("txn").xattr()];
    let opts = LookupInOptions {
        access_deleted: true,
        ..Default::default()
    };
    match cluster.lookup_in(id, &specs, &opts) {
        Ok(res) => res.value(0).cloned(),
        Err(_) => None,
    }
}

/// Whether the document exists in any form (live or tombstone)
pub fn exists_at_all(cluster: &MemoryCluster, id: &DocId) -> bool {
    let specs = [LookupInSpec::full_document()];
    let opts = LookupInOptions {
        access_deleted: true,
        ..Default::default()
    };
    cluster.lookup_in(id, &specs, &opts).is_ok()
}

/// Attempt entries currently in the given ATR document
pub fn atr_attempt_ids(cluster: &MemoryCluster, atr_doc: &DocId) -> Vec<String> {
    let specs = [LookupInSpec::get("attempts").xattr()];
    match cluster.lookup_in(atr_doc, &specs, &LookupInOptions::default()) {
        Ok(res) => res
            .value(0)
            .and_then(|v| v.as_object())
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

/// The ATR document a transaction result points at
pub fn atr_doc_of(config: &TransactionConfig, result: &forgetx_core::TransactionResult) -> Option<DocId> {
    result
        .atr_id
        .as_ref()
        .map(|key| config.metadata_doc_id(BUCKET, key))
}
