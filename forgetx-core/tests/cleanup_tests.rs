// cleanup_tests.rs
// Crash & repair scenarios: a client dies at a chosen protocol step
// (simulated with FAIL_HARD hook injection, which aborts the attempt
// without rollback), then cleanup - in-process or from a second client -
// must converge every document to the committed or the pre-transaction
// state.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::*;
use serde_json::json;

use forgetx_core::cleanup::LostAttemptsCleanup;
use forgetx_core::hooks::{self, AttemptContextTestingHooks};
use forgetx_core::kv::{KvClient, KvError, MutateInOptions, MutateInSpec, StoreSemantics};
use forgetx_core::util::mutation_cas_macro;
use forgetx_core::{ErrorClass, TransactionError};

fn hooks_failing_hard_at(
    pick: impl FnOnce(&mut AttemptContextTestingHooks),
) -> AttemptContextTestingHooks {
    let mut hooks_config = AttemptContextTestingHooks::default();
    pick(&mut hooks_config);
    hooks_config
}

/// A second, healthy client against the same cluster
fn second_client(cluster: &Arc<forgetx_core::MemoryCluster>) -> forgetx_core::Transactions {
    transactions_with(cluster, test_config())
}

#[test]
fn test_crash_before_atr_commit_leaves_pending_state_for_reader_fallback() {
    let cluster = cluster();
    let config = test_config().set_attempt_hooks(hooks_failing_hard_at(|h| {
        h.before_atr_commit = hooks::fail_always(ErrorClass::Hard);
    }));
    let txns = transactions_with(&cluster, config);
    let id = doc_id(&unique_key("crash-pending"));
    upsert_doc(&cluster, &id, json!({"n": 0}));

    let err = txns
        .run(|ctx| {
            let doc = ctx.get(&id)?;
            ctx.replace(&doc, json!({"n": 1}))?;
            Ok(())
        })
        .expect_err("the crash surfaces as a failure");
    assert!(matches!(err, TransactionError::Failed { .. }));

    // The staged write and the PENDING entry are still there
    assert!(txn_xattrs(&cluster, &id).is_some());

    // A healthy client reading the doc sees the pre-transaction value
    let healthy = second_client(&cluster);
    let seen = healthy
        .run(|ctx| {
            let doc = ctx.get(&id)?;
            assert_eq!(doc.content(), &json!({"n": 0}));
            Ok(())
        })
        .expect("read-only transaction");
    assert!(!seen.unstaging_complete);
}

#[test]
fn test_cleanup_of_committed_attempt_finishes_the_commit() {
    let cluster = cluster();
    // Die on the very first per-document unstage: the ATR entry is
    // COMMITTED, no document has been unstaged yet
    let config = test_config().set_attempt_hooks(hooks_failing_hard_at(|h| {
        h.before_doc_committed = hooks::fail_always(ErrorClass::Hard);
    }));
    let txns = transactions_with(&cluster, config);
    let id = doc_id(&unique_key("crash-committed"));
    upsert_doc(&cluster, &id, json!({"n": 0}));

    // A post-commit failure is not an error for the caller: the commit
    // point has passed, cleanup owes us the rest
    let result = txns
        .run(|ctx| {
            let doc = ctx.get(&id)?;
            ctx.replace(&doc, json!({"n": 1}))?;
            Ok(())
        })
        .expect("commit is durable despite the unstage failure");
    assert!(!result.unstaging_complete);
    assert_eq!(plain_get(&cluster, &id).unwrap(), json!({"n": 0}));

    // A second client's cleanup replays the committed outcome
    let healthy = second_client(&cluster);
    let atr_doc = atr_doc_of(healthy.config(), &result).expect("atr chosen");
    let stats = healthy
        .cleanup()
        .force_cleanup_atr(&atr_doc)
        .expect("cleanup sweep");
    assert!(stats.exists);
    assert_eq!(stats.cleaned, 1);

    assert_eq!(plain_get(&cluster, &id).unwrap(), json!({"n": 1}));
    assert!(txn_xattrs(&cluster, &id).is_none());
    assert!(atr_attempt_ids(&cluster, &atr_doc).is_empty());
}

#[test]
fn test_cleanup_of_committed_insert_resurrects_the_tombstone() {
    let cluster = cluster();
    let config = test_config().set_attempt_hooks(hooks_failing_hard_at(|h| {
        h.before_doc_committed = hooks::fail_always(ErrorClass::Hard);
    }));
    let txns = transactions_with(&cluster, config);
    let id = doc_id(&unique_key("crash-committed-insert"));

    let result = txns
        .run(|ctx| {
            ctx.insert(&id, json!({"born": "in a txn"}))?;
            Ok(())
        })
        .expect("commit is durable");
    assert!(!result.unstaging_complete);
    assert!(matches!(
        plain_get(&cluster, &id),
        Err(KvError::DocumentNotFound)
    ));

    let healthy = second_client(&cluster);
    let atr_doc = atr_doc_of(healthy.config(), &result).unwrap();
    healthy.cleanup().force_cleanup_atr(&atr_doc).expect("cleanup");

    assert_eq!(plain_get(&cluster, &id).unwrap(), json!({"born": "in a txn"}));
    assert!(atr_attempt_ids(&cluster, &atr_doc).is_empty());
}

#[test]
fn test_cleanup_of_aborted_attempt_reverts_documents() {
    let cluster = cluster();
    // Crash mid-rollback: the abort is recorded, the staged doc still
    // carries its txn block, the entry removal never happened
    let config = test_config().set_attempt_hooks(hooks_failing_hard_at(|h| {
        h.before_doc_rolled_back = hooks::fail_always(ErrorClass::Hard);
    }));
    let txns = transactions_with(&cluster, config);
    let id = doc_id(&unique_key("crash-aborted"));
    upsert_doc(&cluster, &id, json!({"n": 0}));

    let err = txns
        .run(|ctx| {
            let doc = ctx.get(&id)?;
            ctx.replace(&doc, json!({"n": 1}))?;
            anyhow::bail!("force a rollback");
        })
        .expect_err("transaction fails");
    assert!(matches!(err, TransactionError::Failed { .. }));
    assert!(txn_xattrs(&cluster, &id).is_some());

    let healthy = second_client(&cluster);
    let atr_doc = atr_doc_of(healthy.config(), err.result()).unwrap();
    let stats = healthy.cleanup().force_cleanup_atr(&atr_doc).expect("cleanup");
    assert_eq!(stats.cleaned, 1);

    assert_eq!(plain_get(&cluster, &id).unwrap(), json!({"n": 0}));
    assert!(txn_xattrs(&cluster, &id).is_none());
    assert!(atr_attempt_ids(&cluster, &atr_doc).is_empty());
}

#[test]
fn test_in_process_queue_repairs_own_attempt() {
    let cluster = cluster();
    let config = test_config()
        .set_cleanup_client_attempts(true)
        .set_attempt_hooks(hooks_failing_hard_at(|h| {
            h.before_doc_committed = hooks::fail_always(ErrorClass::Hard);
        }));
    let txns = transactions_with(&cluster, config);
    let id = doc_id(&unique_key("own-queue"));
    upsert_doc(&cluster, &id, json!({"n": 0}));

    let result = txns
        .run(|ctx| {
            let doc = ctx.get(&id)?;
            ctx.replace(&doc, json!({"n": 1}))?;
            Ok(())
        })
        .expect("post-commit failure still succeeds");
    assert!(!result.unstaging_complete);

    // The entry sits on this client's own queue. Drain it synchronously;
    // cleanup replays through the cleanup path, which the injected
    // attempt hook does not touch. The background worker may race us for
    // the entry, so converge rather than count.
    txns.cleanup().force_cleanup_attempts();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if plain_get(&cluster, &id).unwrap() == json!({"n": 1})
            && txn_xattrs(&cluster, &id).is_none()
        {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "own-queue cleanup did not repair the attempt"
        );
        std::thread::sleep(Duration::from_millis(25));
    }
    let atr_doc = atr_doc_of(txns.config(), &result).unwrap();
    assert!(atr_attempt_ids(&cluster, &atr_doc).is_empty());
}

#[test]
fn test_queue_worker_drains_in_background() {
    let cluster = cluster();
    let config = test_config()
        .set_cleanup_client_attempts(true)
        .set_attempt_hooks(hooks_failing_hard_at(|h| {
            // Only the inline unstage fails; the cleanup path is clean
            h.before_doc_committed = hooks::fail_first_n(1, ErrorClass::Hard);
        }));
    let txns = transactions_with(&cluster, config);
    let id = doc_id(&unique_key("bg-queue"));
    upsert_doc(&cluster, &id, json!({"n": 0}));

    let result = txns
        .run(|ctx| {
            let doc = ctx.get(&id)?;
            ctx.replace(&doc, json!({"n": 1}))?;
            Ok(())
        })
        .expect("post-commit failure still succeeds");
    assert!(!result.unstaging_complete);

    // The worker wakes every 100ms plus the 50ms grace
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if plain_get(&cluster, &id).unwrap() == json!({"n": 1})
            && txn_xattrs(&cluster, &id).is_none()
        {
            return;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    panic!("background cleanup did not repair the attempt in time");
}

// ============================================================================
// LOST-ATTEMPTS CLEANUP
// ============================================================================

#[test]
fn test_lost_cleanup_of_expired_staged_insert() {
    let cluster = cluster();
    let config = test_config()
        .set_expiration_time(Duration::from_millis(100))
        .set_attempt_hooks(hooks_failing_hard_at(|h| {
            h.before_atr_commit = hooks::fail_always(ErrorClass::Hard);
        }));
    let txns = transactions_with(&cluster, config);
    let id = doc_id(&unique_key("lost-insert"));

    let err = txns
        .run(|ctx| {
            ctx.insert(&id, json!({"orphan": true}))?;
            Ok(())
        })
        .expect_err("client dies before commit");
    let atr_doc = atr_doc_of(txns.config(), err.result()).unwrap();
    assert_eq!(atr_attempt_ids(&cluster, &atr_doc).len(), 1);

    // Not expired past the safety margin yet: the sweep must not touch it
    let healthy = second_client(&cluster);
    healthy
        .cleanup()
        .force_lost_cleanup(BUCKET)
        .expect("sweep runs");
    assert_eq!(atr_attempt_ids(&cluster, &atr_doc).len(), 1);

    // Wait out budget + safety margin, then sweep again
    std::thread::sleep(Duration::from_millis(3000));
    healthy
        .cleanup()
        .force_lost_cleanup(BUCKET)
        .expect("sweep runs");

    assert!(atr_attempt_ids(&cluster, &atr_doc).is_empty());
    assert!(matches!(
        plain_get(&cluster, &id),
        Err(KvError::DocumentNotFound)
    ));
}

#[test]
fn test_lost_cleanup_commits_expired_committed_attempt() {
    let cluster = cluster();
    let config = test_config()
        .set_expiration_time(Duration::from_millis(100))
        .set_attempt_hooks(hooks_failing_hard_at(|h| {
            h.before_doc_committed = hooks::fail_always(ErrorClass::Hard);
        }));
    let txns = transactions_with(&cluster, config);
    let id = doc_id(&unique_key("lost-committed"));
    upsert_doc(&cluster, &id, json!({"n": 0}));

    let result = txns
        .run(|ctx| {
            let doc = ctx.get(&id)?;
            ctx.replace(&doc, json!({"n": 1}))?;
            Ok(())
        })
        .expect("commit is durable");

    std::thread::sleep(Duration::from_millis(3000));
    let healthy = second_client(&cluster);
    healthy
        .cleanup()
        .force_lost_cleanup(BUCKET)
        .expect("sweep runs");

    assert_eq!(plain_get(&cluster, &id).unwrap(), json!({"n": 1}));
    let atr_doc = atr_doc_of(healthy.config(), &result).unwrap();
    assert!(atr_attempt_ids(&cluster, &atr_doc).is_empty());
}

// ============================================================================
// CLIENT RECORD
// ============================================================================

fn lost_cleanup_with_uuid(
    cluster: &Arc<forgetx_core::MemoryCluster>,
    uuid: &str,
) -> LostAttemptsCleanup {
    let client: Arc<dyn KvClient> = cluster.clone();
    LostAttemptsCleanup::new(client, Arc::new(test_config()), uuid.to_string())
}

#[test]
fn test_client_record_registration_and_partitioning() {
    let cluster = cluster();
    let alpha = lost_cleanup_with_uuid(&cluster, "aaaa-client");
    let beta = lost_cleanup_with_uuid(&cluster, "bbbb-client");

    let details = alpha.get_active_clients(BUCKET).expect("first registration");
    assert_eq!(details.num_active_clients, 1);
    assert_eq!(details.index_of_this_client, 0);

    let details_beta = beta.get_active_clients(BUCKET).expect("second registration");
    assert_eq!(details_beta.num_active_clients, 2);
    assert_eq!(details_beta.index_of_this_client, 1, "uuids sort lexicographically");

    let details_alpha = alpha.get_active_clients(BUCKET).expect("re-heartbeat");
    assert_eq!(details_alpha.num_active_clients, 2);
    assert_eq!(details_alpha.index_of_this_client, 0);
}

#[test]
fn test_expired_client_is_evicted_on_heartbeat() {
    let cluster = cluster();
    let record_id = doc_id("_txn:client-record");

    // Plant a client whose heartbeat is far in the past
    let stale_heartbeat = mutation_cas_macro(1_000_000_000u64 * 1_000_000); // ~1970
    let specs = [
        MutateInSpec::upsert(
            "records.clients.dead-client.heartbeat_ms",
            json!(stale_heartbeat),
        )
        .xattr()
        .create_path(),
        MutateInSpec::upsert("records.clients.dead-client.expires_ms", json!(1000))
            .xattr()
            .create_path(),
    ];
    cluster
        .mutate_in(
            &record_id,
            &specs,
            &MutateInOptions {
                store_semantics: StoreSemantics::Upsert,
                ..Default::default()
            },
        )
        .unwrap();

    let live = lost_cleanup_with_uuid(&cluster, "live-client");
    let details = live.get_active_clients(BUCKET).expect("heartbeat");
    assert_eq!(details.num_active_clients, 1);
    assert_eq!(details.expired_client_ids, vec!["dead-client".to_string()]);

    // The eviction happened in the same heartbeat write
    let details = live.get_active_clients(BUCKET).expect("second heartbeat");
    assert!(details.expired_client_ids.is_empty());
}

#[test]
fn test_override_suspends_sweep_and_heartbeat() {
    let cluster = cluster();
    let record_id = doc_id("_txn:client-record");
    let far_future_ms = forgetx_core::util::now_ms() + 60_000;
    let specs = [
        MutateInSpec::upsert("records.override.enabled", json!(true))
            .xattr()
            .create_path(),
        MutateInSpec::upsert("records.override.expires", json!(far_future_ms))
            .xattr()
            .create_path(),
    ];
    cluster
        .mutate_in(
            &record_id,
            &specs,
            &MutateInOptions {
                store_semantics: StoreSemantics::Upsert,
                ..Default::default()
            },
        )
        .unwrap();

    let client = lost_cleanup_with_uuid(&cluster, "suspended-client");
    let details = client.get_active_clients(BUCKET).expect("record read");
    assert!(details.override_active);

    // No heartbeat was written while the override is active
    let record = txn_xattrs_raw(&cluster, &record_id);
    assert!(record
        .get("records")
        .and_then(|r| r.get("clients"))
        .and_then(|c| c.get("suspended-client"))
        .is_none());
}

/// Full xattr tree of a doc (test-only introspection)
fn txn_xattrs_raw(
    cluster: &forgetx_core::MemoryCluster,
    id: &forgetx_core::DocId,
) -> serde_json::Value {
    use forgetx_core::kv::{LookupInOptions, LookupInSpec};
    let specs = [LookupInSpec::get("records").xattr()];
    let res = cluster
        .lookup_in(id, &specs, &LookupInOptions::default())
        .expect("record exists");
    json!({ "records": res.value(0).cloned().unwrap_or(serde_json::Value::Null) })
}
