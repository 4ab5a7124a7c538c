// hooks.rs
//! Testing seams injected before/after each protocol step
//!
//! The engine consults a hook at every documented phase; the default hooks
//! do nothing. A test harness replaces individual fields to force an
//! [`ErrorClass`] at an exact protocol point, fake client-side expiry, or
//! pin the ATR selection. Production code never needs to touch this.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{ClientError, ErrorClass};

// Stage names handed to the expiry hook (and used in expiry log lines)
pub const STAGE_GET: &str = "get";
pub const STAGE_INSERT: &str = "insert";
pub const STAGE_REPLACE: &str = "replace";
pub const STAGE_REMOVE: &str = "remove";
pub const STAGE_BEFORE_COMMIT: &str = "commit";
pub const STAGE_ROLLBACK: &str = "rollback";
pub const STAGE_ATR_PENDING: &str = "atrPending";
pub const STAGE_ATR_COMMIT: &str = "atrCommit";
pub const STAGE_ATR_COMMIT_AMBIGUITY_RESOLUTION: &str = "atrCommitAmbiguityResolution";
pub const STAGE_ATR_COMPLETE: &str = "atrComplete";
pub const STAGE_ATR_ABORT: &str = "atrAbort";
pub const STAGE_ATR_ROLLBACK_COMPLETE: &str = "atrRollbackComplete";
pub const STAGE_CREATE_STAGED_INSERT: &str = "createdStagedInsert";
pub const STAGE_COMMIT_DOC: &str = "commitDoc";
pub const STAGE_REMOVE_DOC: &str = "removeDoc";
pub const STAGE_ROLLBACK_DOC: &str = "rollbackDoc";
pub const STAGE_DELETE_INSERTED: &str = "deleteInserted";

/// A hook point. Receives the affected document key (when there is one)
/// and may return an [`ErrorClass`] to inject a failure at that point.
pub type ErrorHook = Box<dyn Fn(Option<&str>) -> Option<ErrorClass> + Send + Sync>;

/// Expiry override: (stage, doc key) -> pretend-expired
pub type ExpiryHook = Box<dyn Fn(&str, Option<&str>) -> bool + Send + Sync>;

/// ATR pinning override for deterministic tests
pub type AtrIdHook = Box<dyn Fn() -> Option<String> + Send + Sync>;

fn noop() -> ErrorHook {
    Box::new(|_| None)
}

/// Evaluate a hook point; an injected class surfaces as a classified
/// backend failure.
pub fn fire(hook: &ErrorHook, key: Option<&str>) -> Result<(), ClientError> {
    match hook(key) {
        Some(class) => Err(ClientError::new(class, "error injected by test hook")),
        None => Ok(()),
    }
}

/// Hook that always injects `class`
pub fn fail_always(class: ErrorClass) -> ErrorHook {
    Box::new(move |_| Some(class))
}

/// Hook that injects `class` for the first `n` evaluations, then passes
pub fn fail_first_n(n: usize, class: ErrorClass) -> ErrorHook {
    let remaining = Arc::new(AtomicUsize::new(n));
    Box::new(move |_| {
        let prev = remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .unwrap_or(0);
        if prev > 0 {
            Some(class)
        } else {
            None
        }
    })
}

/// Hook that injects `class` only for the named document key
pub fn fail_for_key(target: impl Into<String>, class: ErrorClass) -> ErrorHook {
    let target = target.into();
    Box::new(move |key| match key {
        Some(k) if k == target => Some(class),
        _ => None,
    })
}

/// Hook points of the attempt context. Fields are public so a harness
/// replaces exactly the seams it needs.
pub struct AttemptContextTestingHooks {
    pub before_atr_pending: ErrorHook,
    pub after_atr_pending: ErrorHook,
    pub before_atr_commit: ErrorHook,
    pub after_atr_commit: ErrorHook,
    pub before_atr_commit_ambiguity_resolution: ErrorHook,
    pub before_atr_complete: ErrorHook,
    pub after_atr_complete: ErrorHook,
    pub before_atr_aborted: ErrorHook,
    pub after_atr_aborted: ErrorHook,
    pub before_atr_rolled_back: ErrorHook,
    pub after_atr_rolled_back: ErrorHook,
    pub before_doc_get: ErrorHook,
    pub after_get_complete: ErrorHook,
    pub before_staged_insert: ErrorHook,
    pub after_staged_insert_complete: ErrorHook,
    pub before_staged_replace: ErrorHook,
    pub after_staged_replace_complete: ErrorHook,
    pub before_staged_remove: ErrorHook,
    pub after_staged_remove_complete: ErrorHook,
    pub before_doc_committed: ErrorHook,
    pub after_doc_committed: ErrorHook,
    pub before_doc_removed: ErrorHook,
    pub before_doc_rolled_back: ErrorHook,
    pub before_rollback_delete_inserted: ErrorHook,
    pub before_check_atr_entry_for_blocking_doc: ErrorHook,
    pub before_get_doc_in_exists_during_staged_insert: ErrorHook,
    /// Pretend the transaction has expired at the given stage
    pub has_expired_client_side: ExpiryHook,
    /// Pin ATR selection to a fixed id
    pub random_atr_id: AtrIdHook,
}

impl Default for AttemptContextTestingHooks {
    fn default() -> Self {
        AttemptContextTestingHooks {
            before_atr_pending: noop(),
            after_atr_pending: noop(),
            before_atr_commit: noop(),
            after_atr_commit: noop(),
            before_atr_commit_ambiguity_resolution: noop(),
            before_atr_complete: noop(),
            after_atr_complete: noop(),
            before_atr_aborted: noop(),
            after_atr_aborted: noop(),
            before_atr_rolled_back: noop(),
            after_atr_rolled_back: noop(),
            before_doc_get: noop(),
            after_get_complete: noop(),
            before_staged_insert: noop(),
            after_staged_insert_complete: noop(),
            before_staged_replace: noop(),
            after_staged_replace_complete: noop(),
            before_staged_remove: noop(),
            after_staged_remove_complete: noop(),
            before_doc_committed: noop(),
            after_doc_committed: noop(),
            before_doc_removed: noop(),
            before_doc_rolled_back: noop(),
            before_rollback_delete_inserted: noop(),
            before_check_atr_entry_for_blocking_doc: noop(),
            before_get_doc_in_exists_during_staged_insert: noop(),
            has_expired_client_side: Box::new(|_, _| false),
            random_atr_id: Box::new(|| None),
        }
    }
}

/// Hook points of the cleanup subsystem
pub struct CleanupTestingHooks {
    pub before_commit_doc: ErrorHook,
    pub before_remove_doc_staged_for_removal: ErrorHook,
    pub before_remove_doc: ErrorHook,
    pub before_remove_links: ErrorHook,
    pub before_atr_get: ErrorHook,
    pub before_atr_remove: ErrorHook,
    pub on_cleanup_docs_completed: ErrorHook,
    pub on_cleanup_completed: ErrorHook,
    pub client_record_before_create: ErrorHook,
    pub client_record_before_get: ErrorHook,
    pub client_record_before_update: ErrorHook,
    pub client_record_before_remove_client: ErrorHook,
}

impl Default for CleanupTestingHooks {
    fn default() -> Self {
        CleanupTestingHooks {
            before_commit_doc: noop(),
            before_remove_doc_staged_for_removal: noop(),
            before_remove_doc: noop(),
            before_remove_links: noop(),
            before_atr_get: noop(),
            before_atr_remove: noop(),
            on_cleanup_docs_completed: noop(),
            on_cleanup_completed: noop(),
            client_record_before_create: noop(),
            client_record_before_get: noop(),
            client_record_before_update: noop(),
            client_record_before_remove_client: noop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_hooks_pass() {
        let hooks = AttemptContextTestingHooks::default();
        assert!(fire(&hooks.before_atr_commit, None).is_ok());
        assert!(!(hooks.has_expired_client_side)(STAGE_GET, None));
        assert!((hooks.random_atr_id)().is_none());
    }

    #[test]
    fn test_fail_first_n() {
        let hook = fail_first_n(2, ErrorClass::Transient);
        assert!(fire(&hook, None).is_err());
        assert!(fire(&hook, None).is_err());
        assert!(fire(&hook, None).is_ok());
        assert!(fire(&hook, None).is_ok());
    }

    #[test]
    fn test_fail_for_key() {
        let hook = fail_for_key("target", ErrorClass::Hard);
        assert!(fire(&hook, Some("other")).is_ok());
        let err = fire(&hook, Some("target")).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Hard);
    }
}
