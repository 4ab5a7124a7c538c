// txn_simple_tests.rs
// End-to-end transaction scenarios against the in-memory cluster:
// commit and rollback visibility, own-write reads, concurrent writers,
// expiry, and commit ambiguity resolution.

mod helpers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use helpers::*;
use serde_json::json;

use forgetx_core::hooks::{self, AttemptContextTestingHooks};
use forgetx_core::kv::KvError;
use forgetx_core::{CauseKind, ErrorClass, TransactionError};

#[test]
fn test_replace_commits_and_cleans_atr() {
    let cluster = cluster();
    let txns = transactions(&cluster);
    let id = doc_id(&unique_key("replace"));
    upsert_doc(&cluster, &id, json!({"n": 0}));

    let result = txns
        .run(|ctx| {
            let doc = ctx.get(&id)?;
            let mut content = doc.content().clone();
            content["n"] = json!(1);
            ctx.replace(&doc, content)?;
            Ok(())
        })
        .expect("transaction commits");

    assert!(result.unstaging_complete);
    assert_eq!(result.attempts.len(), 1);
    assert_eq!(plain_get(&cluster, &id).unwrap(), json!({"n": 1}));
    assert!(txn_xattrs(&cluster, &id).is_none(), "txn block must be gone");

    // The attempt entry was removed from its ATR
    let atr_doc = atr_doc_of(txns.config(), &result).expect("a mutation chose an atr");
    assert!(atr_attempt_ids(&cluster, &atr_doc).is_empty());
}

#[test]
fn test_user_error_rolls_back_replace() {
    let cluster = cluster();
    let txns = transactions(&cluster);
    let id = doc_id(&unique_key("rollback"));
    upsert_doc(&cluster, &id, json!({"n": 0}));

    let err = txns
        .run(|ctx| {
            let doc = ctx.get(&id)?;
            ctx.replace(&doc, json!({"n": 1}))?;
            anyhow::bail!("application decided to abort");
        })
        .expect_err("transaction fails");

    assert!(matches!(err, TransactionError::Failed { .. }));
    assert_eq!(plain_get(&cluster, &id).unwrap(), json!({"n": 0}));
    assert!(txn_xattrs(&cluster, &id).is_none());
}

#[test]
fn test_insert_rolled_back_leaves_no_document() {
    let cluster = cluster();
    let txns = transactions(&cluster);
    let id = doc_id(&unique_key("insert-rollback"));

    let err = txns
        .run(|ctx| {
            ctx.insert(&id, json!({"fresh": true}))?;
            anyhow::bail!("abort after staging the insert");
        })
        .expect_err("transaction fails");

    assert!(matches!(err, TransactionError::Failed { .. }));
    assert!(matches!(
        plain_get(&cluster, &id),
        Err(KvError::DocumentNotFound)
    ));
    // Not even a tombstone with staged data is left behind
    assert!(!exists_at_all(&cluster, &id));
}

#[test]
fn test_staged_insert_invisible_until_commit() {
    let cluster = cluster();
    let txns = transactions(&cluster);
    let id = doc_id(&unique_key("staged-insert"));

    let cluster_probe = cluster.clone();
    let id_probe = id.clone();
    txns.run(move |ctx| {
        ctx.insert(&id_probe, json!({"visible": "later"}))?;
        // A non-transactional reader must not see the staged document
        assert!(matches!(
            plain_get(&cluster_probe, &id_probe),
            Err(KvError::DocumentNotFound)
        ));
        Ok(())
    })
    .expect("transaction commits");

    assert_eq!(plain_get(&cluster, &id).unwrap(), json!({"visible": "later"}));
    assert!(txn_xattrs(&cluster, &id).is_none());
}

#[test]
fn test_remove_commits() {
    let cluster = cluster();
    let txns = transactions(&cluster);
    let id = doc_id(&unique_key("remove"));
    upsert_doc(&cluster, &id, json!({"doomed": true}));

    let result = txns
        .run(|ctx| {
            let doc = ctx.get(&id)?;
            ctx.remove(&doc)?;
            Ok(())
        })
        .expect("transaction commits");

    assert!(result.unstaging_complete);
    assert!(matches!(
        plain_get(&cluster, &id),
        Err(KvError::DocumentNotFound)
    ));
}

#[test]
fn test_own_writes_are_visible_within_attempt() {
    let cluster = cluster();
    let txns = transactions(&cluster);
    let inserted = doc_id(&unique_key("own-insert"));
    let replaced = doc_id(&unique_key("own-replace"));
    upsert_doc(&cluster, &replaced, json!({"n": 0}));

    txns.run(|ctx| {
        ctx.insert(&inserted, json!({"stage": 1}))?;
        let seen = ctx.get(&inserted)?;
        assert_eq!(seen.content(), &json!({"stage": 1}));

        let doc = ctx.get(&replaced)?;
        ctx.replace(&doc, json!({"n": 42}))?;
        let seen = ctx.get(&replaced)?;
        assert_eq!(seen.content(), &json!({"n": 42}));

        let doc = ctx.get(&replaced)?;
        ctx.remove(&doc)?;
        assert!(ctx.get_optional(&replaced)?.is_none());
        Ok(())
    })
    .expect("transaction commits");

    assert_eq!(plain_get(&cluster, &inserted).unwrap(), json!({"stage": 1}));
    assert!(matches!(
        plain_get(&cluster, &replaced),
        Err(KvError::DocumentNotFound)
    ));
}

#[test]
fn test_remove_of_own_insert_is_rejected() {
    let cluster = cluster();
    let txns = transactions(&cluster);
    let id = doc_id(&unique_key("insert-remove"));

    let err = txns
        .run(|ctx| {
            let doc = ctx.insert(&id, json!({"x": 1}))?;
            ctx.remove(&doc)?;
            Ok(())
        })
        .expect_err("remove of an own insert must fail");
    assert!(matches!(err, TransactionError::Failed { .. }));
}

#[test]
fn test_insert_conflict_with_live_document() {
    let cluster = cluster();
    let txns = transactions(&cluster);
    let id = doc_id(&unique_key("conflict"));
    upsert_doc(&cluster, &id, json!({"already": "here"}));

    let err = txns
        .run(|ctx| {
            ctx.insert(&id, json!({"other": true}))?;
            Ok(())
        })
        .expect_err("insert of an existing doc must fail");
    match err {
        TransactionError::Failed { cause, .. } => {
            assert_eq!(cause, CauseKind::DocumentExists);
        }
        other => panic!("expected Failed, got {:?}", other),
    }
    assert_eq!(plain_get(&cluster, &id).unwrap(), json!({"already": "here"}));
}

#[test]
fn test_empty_transaction_succeeds() {
    let cluster = cluster();
    let txns = transactions(&cluster);

    let result = txns.run(|_ctx| Ok(())).expect("empty transaction is a no-op");
    assert!(result.atr_id.is_none());
    assert!(!result.unstaging_complete);
    assert_eq!(result.attempts.len(), 1);
}

#[test]
fn test_concurrent_increments_serialize() {
    let cluster = cluster();
    let txns = Arc::new(transactions(&cluster));
    let id = doc_id(&unique_key("concurrent"));
    upsert_doc(&cluster, &id, json!({"n": 0}));

    let threads: Vec<_> = (0..2)
        .map(|_| {
            let txns = txns.clone();
            let id = id.clone();
            std::thread::spawn(move || {
                txns.run(|ctx| {
                    let doc = ctx.get(&id)?;
                    let n = doc.content()["n"].as_i64().unwrap();
                    ctx.replace(&doc, json!({"n": n + 1}))?;
                    Ok(())
                })
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap().expect("both transactions commit");
    }
    assert_eq!(plain_get(&cluster, &id).unwrap(), json!({"n": 2}));
}

#[test]
fn test_expiry_rolls_back() {
    let cluster = cluster();
    let config = test_config().set_expiration_time(Duration::from_millis(100));
    let txns = transactions_with(&cluster, config);
    let id = doc_id(&unique_key("expiry"));
    upsert_doc(&cluster, &id, json!({"n": 0}));

    let err = txns
        .run(|ctx| {
            let doc = ctx.get(&id)?;
            std::thread::sleep(Duration::from_millis(500));
            ctx.replace(&doc, json!({"n": 1}))?;
            ctx.commit()?;
            Ok(())
        })
        .expect_err("budget is exceeded");

    assert!(matches!(err, TransactionError::Expired { .. }));
    assert_eq!(plain_get(&cluster, &id).unwrap(), json!({"n": 0}));
    assert!(txn_xattrs(&cluster, &id).is_none());
}

#[test]
fn test_commit_ambiguity_resolves_by_retrying_pending_commit() {
    let cluster = cluster();
    let mut hooks_config = AttemptContextTestingHooks::default();
    // First commit write is swallowed ambiguously; the entry stays
    // PENDING, so resolution must reissue the commit
    hooks_config.before_atr_commit = hooks::fail_first_n(1, ErrorClass::Ambiguous);
    let config = test_config().set_attempt_hooks(hooks_config);
    let txns = transactions_with(&cluster, config);
    let id = doc_id(&unique_key("ambiguous-commit"));
    upsert_doc(&cluster, &id, json!({"n": 0}));

    let result = txns
        .run(|ctx| {
            let doc = ctx.get(&id)?;
            ctx.replace(&doc, json!({"n": 7}))?;
            Ok(())
        })
        .expect("ambiguity resolves and the transaction commits");

    assert!(result.unstaging_complete);
    assert_eq!(plain_get(&cluster, &id).unwrap(), json!({"n": 7}));
}

#[test]
fn test_transient_staging_error_retries_transaction() {
    let cluster = cluster();
    let mut hooks_config = AttemptContextTestingHooks::default();
    hooks_config.before_staged_replace = hooks::fail_first_n(1, ErrorClass::Transient);
    let config = test_config().set_attempt_hooks(hooks_config);
    let txns = transactions_with(&cluster, config);
    let id = doc_id(&unique_key("transient"));
    upsert_doc(&cluster, &id, json!({"n": 0}));

    let attempts_seen = AtomicUsize::new(0);
    let result = txns
        .run(|ctx| {
            attempts_seen.fetch_add(1, Ordering::SeqCst);
            let doc = ctx.get(&id)?;
            ctx.replace(&doc, json!({"n": 1}))?;
            Ok(())
        })
        .expect("second attempt commits");

    assert_eq!(attempts_seen.load(Ordering::SeqCst), 2);
    assert_eq!(result.attempts.len(), 2);
    assert_eq!(plain_get(&cluster, &id).unwrap(), json!({"n": 1}));
}

#[test]
fn test_write_write_conflict_blocks_then_succeeds() {
    let cluster = cluster();
    let txns = Arc::new(transactions(&cluster));
    let id = doc_id(&unique_key("wwc"));
    upsert_doc(&cluster, &id, json!({"n": 0}));

    let (staged_tx, staged_rx) = crossbeam::channel::bounded::<()>(1);
    let (go_tx, go_rx) = crossbeam::channel::bounded::<()>(1);

    let blocker = {
        let txns = txns.clone();
        let id = id.clone();
        std::thread::spawn(move || {
            txns.run(move |ctx| {
                let doc = ctx.get(&id)?;
                ctx.replace(&doc, json!({"n": 1}))?;
                let _ = staged_tx.try_send(());
                // Hold the staged write long enough for the other
                // transaction to observe the conflict
                let _ = go_rx.recv_timeout(Duration::from_secs(10));
                Ok(())
            })
        })
    };

    staged_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("blocker staged its write");

    let contender = {
        let txns = txns.clone();
        let id = id.clone();
        std::thread::spawn(move || {
            txns.run(|ctx| {
                let doc = ctx.get(&id)?;
                let n = doc.content()["n"].as_i64().unwrap();
                ctx.replace(&doc, json!({"n": n + 1}))?;
                Ok(())
            })
        })
    };

    // Let the blocker commit while the contender is backing off
    std::thread::sleep(Duration::from_millis(300));
    go_tx.send(()).unwrap();

    blocker.join().unwrap().expect("blocker commits");
    contender.join().unwrap().expect("contender commits after retry");

    assert_eq!(plain_get(&cluster, &id).unwrap(), json!({"n": 2}));
}

#[test]
fn test_forward_compat_fail_fast_on_read() {
    use forgetx_core::kv::{KvClient, MutateInOptions, MutateInSpec, StoreSemantics};

    let cluster = cluster();
    let txns = transactions(&cluster);
    let id = doc_id(&unique_key("fc"));
    upsert_doc(&cluster, &id, json!({"n": 0}));

    // Hand-craft a staged write from a fictional newer client that tells
    // readers at the get stage to fail fast
    let specs = [
        MutateInSpec::upsert("txn.id.txn", json!("txn-other")).xattr().create_path(),
        MutateInSpec::upsert("txn.id.atmpt", json!("attempt-other")).xattr().create_path(),
        MutateInSpec::upsert("txn.atr_id", json!("atr-0-#0")).xattr().create_path(),
        MutateInSpec::upsert("txn.atr_bkt", json!(BUCKET)).xattr().create_path(),
        MutateInSpec::upsert("txn.atr_coll", json!("_default._default")).xattr().create_path(),
        MutateInSpec::upsert("txn.op.type", json!("replace")).xattr().create_path(),
        MutateInSpec::upsert("txn.staged", json!({"n": 99})).xattr().create_path(),
        MutateInSpec::upsert("txn.fc", json!({"G": [{"e": "XX", "b": "f"}]}))
            .xattr()
            .create_path(),
    ];
    cluster
        .mutate_in(
            &id,
            &specs,
            &MutateInOptions {
                store_semantics: StoreSemantics::Replace,
                ..Default::default()
            },
        )
        .unwrap();

    let err = txns
        .run(|ctx| {
            ctx.get(&id)?;
            Ok(())
        })
        .expect_err("forward compatibility directive fails the read");
    match err {
        TransactionError::Failed { cause, .. } => {
            assert_eq!(cause, CauseKind::ForwardCompatibilityFailure);
        }
        other => panic!("expected Failed, got {:?}", other),
    }
}

#[test]
fn test_expired_blocker_is_ignored() {
    use forgetx_core::kv::{KvClient, MutateInOptions, MutateInSpec, StoreSemantics};
    use forgetx_core::util::mutation_cas_macro;

    let cluster = cluster();
    let txns = transactions(&cluster);
    let id = doc_id(&unique_key("expired-blocker"));
    upsert_doc(&cluster, &id, json!({"n": 0}));

    // An abandoned writer: its ATR entry started long ago with a tiny
    // budget, so the conflict resolver must treat it as expired
    let atr_doc = doc_id("atr-77-#dead");
    let ancient = mutation_cas_macro(1_000_000_000u64 * 1_000_000_000);
    cluster
        .mutate_in(
            &atr_doc,
            &[
                MutateInSpec::upsert("attempts.blocker-1.st", json!("PENDING"))
                    .xattr()
                    .create_path(),
                MutateInSpec::upsert("attempts.blocker-1.tst", json!(ancient))
                    .xattr()
                    .create_path(),
                MutateInSpec::upsert("attempts.blocker-1.exp", json!(10))
                    .xattr()
                    .create_path(),
            ],
            &MutateInOptions {
                store_semantics: StoreSemantics::Upsert,
                ..Default::default()
            },
        )
        .unwrap();
    cluster
        .mutate_in(
            &id,
            &[
                MutateInSpec::upsert("txn.id.txn", json!("txn-abandoned")).xattr().create_path(),
                MutateInSpec::upsert("txn.id.atmpt", json!("blocker-1")).xattr().create_path(),
                MutateInSpec::upsert("txn.atr_id", json!("atr-77-#dead")).xattr().create_path(),
                MutateInSpec::upsert("txn.atr_bkt", json!(BUCKET)).xattr().create_path(),
                MutateInSpec::upsert("txn.atr_coll", json!("_default._default"))
                    .xattr()
                    .create_path(),
                MutateInSpec::upsert("txn.op.type", json!("replace")).xattr().create_path(),
                MutateInSpec::upsert("txn.staged", json!({"n": 9})).xattr().create_path(),
            ],
            &MutateInOptions::default(),
        )
        .unwrap();

    // The expired blocker neither hides the document nor blocks the write
    let result = txns
        .run(|ctx| {
            let doc = ctx.get(&id)?;
            assert_eq!(doc.content(), &json!({"n": 0}), "pre-transaction body wins");
            ctx.replace(&doc, json!({"n": 1}))?;
            Ok(())
        })
        .expect("expired blocker is ignored");

    assert!(result.unstaging_complete);
    assert_eq!(plain_get(&cluster, &id).unwrap(), json!({"n": 1}));
    assert!(txn_xattrs(&cluster, &id).is_none());
}
