// attempt_context.rs
//! The per-attempt state machine
//!
//! One AttemptContext is created per driver iteration. The user callable
//! reads and writes documents through it; every mutation is staged into
//! xattrs (never the document body) and logged in the staged-mutation
//! queue. Commit flips the attempt's ATR entry to COMMITTED and then
//! unstages document by document; rollback aborts the entry and reverts.
//!
//! Failure handling is uniform: every backend result is classified into
//! an error class first, then each protocol step maps the class onto
//! retry / rollback / final-outcome flags. Nothing below this layer ever
//! escapes unclassified.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use crate::atr::{ActiveTransactionRecord, SAFETY_MARGIN_MS};
use crate::attempt_state::AttemptState;
use crate::atr_ids;
use crate::config::TransactionConfig;
use crate::document::{transactional_lookup_specs, DocId, TransactionGetResult, TransactionLinks};
use crate::error::{CauseKind, ClientError, ErrorClass, OpKind, OpResult, OperationFailed};
use crate::fields;
use crate::forward_compat::{self, ForwardCompatStage};
use crate::hooks::{self, AttemptContextTestingHooks};
use crate::kv::{
    KvClient, LookupInOptions, LookupInResult, LookupInSpec, MutateInOptions, MutateInResult,
    MutateInSpec, MutateMacro, StoreSemantics,
};
use crate::logging::LogTarget;
use crate::staged_mutation::{StagedMutation, StagedMutationQueue, StagedMutationType};
use crate::transaction_context::TransactionContext;
use crate::uid;
use crate::util::{
    retry_op, retry_op_exp, retry_op_exponential_backoff_timeout, BackoffTimeoutError,
    RetryOrError, RetryableResult,
};
use crate::{log_debug, log_error, log_trace};

/// Failures inside a protocol step: classified backend errors get mapped
/// by the step's dispatch table; already-flagged failures pass through.
enum StepError {
    Client(ClientError),
    Failed(OperationFailed),
}

impl From<ClientError> for StepError {
    fn from(err: ClientError) -> Self {
        StepError::Client(err)
    }
}

impl From<OperationFailed> for StepError {
    fn from(err: OperationFailed) -> Self {
        StepError::Failed(err)
    }
}

type StepResult<T> = std::result::Result<T, StepError>;

/// Outcome of the ATR-commit ambiguity resolution read-back
enum AmbiguityOutcome {
    /// The commit landed (entry COMMITTED or already COMPLETED)
    Committed,
    /// Entry still PENDING; the commit write must be reissued
    RetryCommit,
}

/// The transaction context handed to the user callable; one per attempt.
pub struct AttemptContext<'a> {
    client: &'a dyn KvClient,
    config: &'a TransactionConfig,
    hooks: &'a AttemptContextTestingHooks,
    overall: &'a TransactionContext,
    attempt_id: String,
    state: Mutex<AttemptState>,
    atr_id: Mutex<Option<DocId>>,
    staged_mutations: StagedMutationQueue,
    is_done: AtomicBool,
    expiry_overtime_mode: AtomicBool,
    // Latched on the first failed operation; later operations fail fast
    has_failed: AtomicBool,
    // The application called rollback() itself; the driver turns this
    // into a terminal failure even though the callable returned cleanly
    rolled_back_by_caller: AtomicBool,
}

impl<'a> AttemptContext<'a> {
    pub(crate) fn new(
        client: &'a dyn KvClient,
        config: &'a TransactionConfig,
        overall: &'a TransactionContext,
    ) -> Self {
        let ctx = AttemptContext {
            client,
            config,
            hooks: config.attempt_hooks(),
            overall,
            attempt_id: uid::next_id(),
            state: Mutex::new(AttemptState::NotStarted),
            atr_id: Mutex::new(None),
            staged_mutations: StagedMutationQueue::new(),
            is_done: AtomicBool::new(false),
            expiry_overtime_mode: AtomicBool::new(false),
            has_failed: AtomicBool::new(false),
            rolled_back_by_caller: AtomicBool::new(false),
        };
        log_trace!(
            LogTarget::Txn,
            "new attempt {} for transaction {}",
            ctx.attempt_id,
            overall.transaction_id()
        );
        ctx
    }

    pub fn id(&self) -> &str {
        &self.attempt_id
    }

    pub fn transaction_id(&self) -> &str {
        self.overall.transaction_id()
    }

    pub fn state(&self) -> AttemptState {
        *self.state.lock()
    }

    fn set_state(&self, state: AttemptState) {
        *self.state.lock() = state;
    }

    pub fn is_done(&self) -> bool {
        self.is_done.load(Ordering::SeqCst)
    }

    /// Key of the ATR chosen for this attempt, if any mutation happened
    pub fn atr_id(&self) -> Option<DocId> {
        self.atr_id.lock().clone()
    }

    pub(crate) fn rolled_back_by_caller(&self) -> bool {
        self.rolled_back_by_caller.load(Ordering::SeqCst)
    }

    // ========================================================================
    // SMALL SHARED CHECKS
    // ========================================================================

    fn record_failure<T>(&self, result: OpResult<T>) -> OpResult<T> {
        if result.is_err() {
            self.has_failed.store(true, Ordering::SeqCst);
        }
        result
    }

    fn existing_error(&self) -> OpResult<()> {
        if self.has_failed.load(Ordering::SeqCst) {
            return Err(OperationFailed::new(
                ErrorClass::Other,
                "previous operation in this attempt failed",
            )
            .cause(CauseKind::PreviousOperationFailed));
        }
        Ok(())
    }

    fn check_if_done(&self) -> OpResult<()> {
        if self.is_done() {
            return Err(OperationFailed::new(
                ErrorClass::Other,
                "cannot perform operations after the attempt is committed or rolled back",
            )
            .no_rollback());
        }
        Ok(())
    }

    fn in_overtime(&self) -> bool {
        self.expiry_overtime_mode.load(Ordering::SeqCst)
    }

    fn enter_overtime(&self) {
        self.expiry_overtime_mode.store(true, Ordering::SeqCst);
    }

    fn has_expired_client_side(&self, stage: &str, doc_key: Option<&str>) -> bool {
        let real = self.overall.has_expired_client_side(self.config);
        let faked = (self.hooks.has_expired_client_side)(stage, doc_key);
        if real {
            log_debug!(LogTarget::Txn, "{} expired in {}", self.attempt_id, stage);
        }
        if faked {
            log_debug!(LogTarget::Txn, "{} fake expiry in {}", self.attempt_id, stage);
        }
        real || faked
    }

    /// Pre-step check used before staging and before commit begins. On
    /// expiry, flips into overtime so the rollback that follows runs
    /// without further expiry checks.
    fn check_expiry_pre_commit(&self, stage: &str, doc_key: Option<&str>) -> OpResult<()> {
        if self.has_expired_client_side(stage, doc_key) {
            log_debug!(
                LogTarget::Txn,
                "{} expired in stage {}, entering expiry-overtime (one rollback pass)",
                self.attempt_id,
                stage
            );
            self.enter_overtime();
            return Err(OperationFailed::new(
                ErrorClass::Expiry,
                format!("attempt expired in stage {}", stage),
            )
            .expired());
        }
        Ok(())
    }

    /// Check used inside ATR writes: suppressed once in overtime
    fn error_if_expired_and_not_in_overtime(
        &self,
        stage: &str,
        doc_key: Option<&str>,
    ) -> Result<(), ClientError> {
        if self.in_overtime() {
            log_trace!(
                LogTarget::Txn,
                "skipping expiry check in {}: already in expiry-overtime",
                stage
            );
            return Ok(());
        }
        if self.has_expired_client_side(stage, doc_key) {
            return Err(ClientError::new(
                ErrorClass::Expiry,
                format!("expired in {}", stage),
            ));
        }
        Ok(())
    }

    /// Check used during commit/rollback unstaging: only flips overtime,
    /// never aborts the pass
    fn check_expiry_during_commit_or_rollback(&self, stage: &str, doc_key: Option<&str>) {
        if !self.in_overtime() {
            if self.has_expired_client_side(stage, doc_key) {
                log_debug!(
                    LogTarget::Txn,
                    "{} expired in {}, entering expiry-overtime (one pass to finish)",
                    self.attempt_id,
                    stage
                );
                self.enter_overtime();
            }
        } else {
            log_trace!(
                LogTarget::Txn,
                "{} ignoring expiry in {}: in expiry-overtime",
                self.attempt_id,
                stage
            );
        }
    }

    // ========================================================================
    // BACKEND CALL WRAPPERS
    // ========================================================================

    fn kv_timeout(&self) -> Option<Duration> {
        self.config.kv_timeout()
    }

    fn lookup_options(&self, access_deleted: bool) -> LookupInOptions {
        LookupInOptions {
            access_deleted,
            timeout: self.kv_timeout(),
        }
    }

    fn mutate_options(&self) -> MutateInOptions {
        MutateInOptions {
            durability: self.config.durability_level(),
            timeout: self.kv_timeout(),
            ..Default::default()
        }
    }

    fn kv_lookup(
        &self,
        id: &DocId,
        specs: &[LookupInSpec],
        opts: &LookupInOptions,
    ) -> Result<LookupInResult, ClientError> {
        self.client
            .lookup_in(id, specs, opts)
            .map_err(|err| ClientError::from_kv(err, OpKind::Read))
    }

    fn kv_mutate(
        &self,
        id: &DocId,
        specs: &[MutateInSpec],
        opts: &MutateInOptions,
    ) -> Result<MutateInResult, ClientError> {
        self.client
            .mutate_in(id, specs, opts)
            .map_err(|err| ClientError::from_kv(err, OpKind::Mutation))
    }

    // ========================================================================
    // GET
    // ========================================================================

    /// Read a document; a missing document is an error
    pub fn get(&self, id: &DocId) -> OpResult<TransactionGetResult> {
        match self.get_optional(id)? {
            Some(doc) => Ok(doc),
            None => {
                log_error!(LogTarget::Txn, "document {} not found", id);
                self.record_failure(Err(OperationFailed::new(
                    ErrorClass::DocNotFound,
                    format!("document {} not found", id),
                )))
            }
        }
    }

    /// Read a document; a missing document is None
    pub fn get_optional(&self, id: &DocId) -> OpResult<Option<TransactionGetResult>> {
        let result = (|| {
            self.existing_error()?;
            let doc = self.do_get(id)?;
            hooks::fire(&self.hooks.after_get_complete, Some(id.key()))
                .map_err(OperationFailed::from_client)?;
            if let Some(doc) = &doc {
                forward_compat::check(ForwardCompatStage::Gets, doc.links().forward_compat())?;
            }
            Ok(doc)
        })();
        self.record_failure(result)
    }

    fn do_get(&self, id: &DocId) -> OpResult<Option<TransactionGetResult>> {
        self.check_if_done()?;
        self.check_expiry_pre_commit(hooks::STAGE_GET, Some(id.key()))?;

        // Own writes come straight from the staged-mutation log
        if let Some(own) = self
            .staged_mutations
            .find_replace(id)
            .or_else(|| self.staged_mutations.find_insert(id))
        {
            log_debug!(LogTarget::Txn, "found own-write of mutated doc {}", id);
            return Ok(Some(TransactionGetResult::own_write(
                id.clone(),
                own.content().clone(),
                own.doc().cas(),
                own.doc().links().clone(),
            )));
        }
        if self.staged_mutations.find_remove(id).is_some() {
            log_debug!(LogTarget::Txn, "found own-write of removed doc {}", id);
            return Ok(None);
        }

        match self.do_get_inner(id) {
            Ok(doc) => Ok(doc),
            Err(StepError::Failed(err)) => Err(err),
            Err(StepError::Client(err)) => match err.class() {
                ErrorClass::Expiry => Err(OperationFailed::from_client(err).expired()),
                ErrorClass::DocNotFound => Ok(None),
                ErrorClass::Transient => Err(OperationFailed::from_client(err).retry()),
                ErrorClass::Hard => Err(OperationFailed::from_client(err).no_rollback()),
                _ => Err(OperationFailed::new(
                    ErrorClass::Other,
                    format!("error while getting doc {}: {}", id.key(), err.message()),
                )),
            },
        }
    }

    fn do_get_inner(&self, id: &DocId) -> StepResult<Option<TransactionGetResult>> {
        hooks::fire(&self.hooks.before_doc_get, Some(id.key()))?;

        let Some(doc) = self.get_doc(id)? else {
            return Ok(None);
        };

        if doc.links().is_document_in_transaction() {
            log_debug!(LogTarget::Txn, "doc {} is in a transaction", id);
            return self.resolve_foreign_staged_doc(id, doc);
        }
        if doc.links().is_deleted() {
            // Plain tombstone with no transactional data
            log_debug!(
                LogTarget::Txn,
                "doc {} not in txn and deleted, not returning it",
                id
            );
            return Ok(None);
        }
        Ok(Some(doc))
    }

    /// The document carries staged data. Decide what this attempt may see.
    fn resolve_foreign_staged_doc(
        &self,
        id: &DocId,
        doc: TransactionGetResult,
    ) -> StepResult<Option<TransactionGetResult>> {
        let links = doc.links().clone();
        let body_present = !doc.content().is_null();

        let atr = match self.atr_doc_id_from_links(&links) {
            Some(atr_doc_id) => {
                match ActiveTransactionRecord::get_atr(self.client, &atr_doc_id, self.kv_timeout())
                {
                    Ok(atr) => atr,
                    Err(err) => {
                        log_debug!(
                            LogTarget::Txn,
                            "could not read atr for blocked get of {}: {}",
                            id,
                            err
                        );
                        None
                    }
                }
            }
            None => None,
        };

        let Some(atr) = atr else {
            // ATR unreadable: fall back to the pre-transaction body
            return Ok(if body_present { Some(doc) } else { None });
        };

        let entry = links
            .staged_attempt_id()
            .and_then(|attempt| atr.find_entry(attempt));
        let Some(entry) = entry else {
            // Don't know whether the writer committed; the body decides
            return Ok(if body_present { Some(doc) } else { None });
        };

        if entry.attempt_id() == self.attempt_id {
            // Backup path for reading our own staged write
            let content = links.staged_content().cloned().unwrap_or(Value::Null);
            let mut own = doc;
            own.set_content(content);
            return Ok(Some(own));
        }

        forward_compat::check(ForwardCompatStage::GetsReadingAtr, entry.forward_compat())?;

        match entry.state() {
            AttemptState::Committed => {
                if links.is_document_being_removed() {
                    Ok(None)
                } else {
                    let mut committed = doc;
                    let content = links.staged_content().cloned().unwrap_or(Value::Null);
                    committed.set_content(content);
                    Ok(Some(committed))
                }
            }
            _ => {
                if body_present {
                    Ok(Some(doc))
                } else {
                    // A staged insert from another transaction: invisible
                    Ok(None)
                }
            }
        }
    }

    /// Raw transactional fetch: the whole txn xattr block plus body, with
    /// access to tombstones
    fn get_doc(&self, id: &DocId) -> StepResult<Option<TransactionGetResult>> {
        let specs = transactional_lookup_specs();
        match self.kv_lookup(id, &specs, &self.lookup_options(true)) {
            Ok(res) => Ok(Some(TransactionGetResult::from_lookup(id.clone(), &res))),
            Err(err) if err.class() == ErrorClass::DocNotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn atr_doc_id_from_links(&self, links: &TransactionLinks) -> Option<DocId> {
        Some(DocId::new(
            links.atr_bucket_name()?,
            links.atr_scope_name()?,
            links.atr_collection_name()?,
            links.atr_id()?,
        ))
    }

    // ========================================================================
    // ATR SELECTION + PENDING
    // ========================================================================

    /// Hash the first mutated key into the fixed ATR namespace
    fn select_atr_if_needed(&self, id: &DocId) {
        let mut atr = self.atr_id.lock();
        if atr.is_some() {
            return;
        }
        let atr_key = match (self.hooks.random_atr_id)() {
            Some(pinned) => pinned,
            None => {
                let vbucket = atr_ids::vbucket_for_key(id.key());
                atr_ids::atr_id_for_vbucket(vbucket).to_string()
            }
        };
        let atr_doc_id = self.config.metadata_doc_id(id.bucket(), &atr_key);
        log_debug!(
            LogTarget::Txn,
            "first mutated doc in attempt is {}, using atr {}",
            id,
            atr_doc_id
        );
        self.overall
            .set_atr(atr_key, atr_doc_id.collection_spec());
        *atr = Some(atr_doc_id);
    }

    fn atr_entry_prefix(&self) -> String {
        format!("{}.{}.", fields::ATR_FIELD_ATTEMPTS, self.attempt_id)
    }

    fn require_atr_id(&self) -> OpResult<DocId> {
        self.atr_id.lock().clone().ok_or_else(|| {
            OperationFailed::new(ErrorClass::Other, "ATR id is not initialized")
        })
    }

    /// Create this attempt's ATR entry in state PENDING before the first
    /// staged mutation lands anywhere
    fn set_atr_pending_if_first_mutation(&self) -> OpResult<()> {
        if !self.staged_mutations.empty() {
            return Ok(());
        }
        let atr_id = self.require_atr_id()?;
        let prefix = self.atr_entry_prefix();

        loop {
            let outcome: StepResult<()> = (|| {
                self.error_if_expired_and_not_in_overtime(hooks::STAGE_ATR_PENDING, None)?;
                hooks::fire(&self.hooks.before_atr_pending, None)?;
                log_debug!(LogTarget::Txn, "updating atr {}", atr_id);

                let exp_ms = self.config.expiration_time().as_millis() as u64;
                let specs = [
                    MutateInSpec::insert(
                        format!("{}{}", prefix, fields::ATR_FIELD_TRANSACTION_ID),
                        Value::String(self.overall.transaction_id().to_string()),
                    )
                    .xattr()
                    .create_path(),
                    MutateInSpec::insert(
                        format!("{}{}", prefix, fields::ATR_FIELD_STATUS),
                        Value::String(AttemptState::Pending.name().to_string()),
                    )
                    .xattr()
                    .create_path(),
                    MutateInSpec::insert(
                        format!("{}{}", prefix, fields::ATR_FIELD_START_TIMESTAMP),
                        Value::Null,
                    )
                    .xattr()
                    .create_path()
                    .expand(MutateMacro::Cas),
                    MutateInSpec::insert(
                        format!("{}{}", prefix, fields::ATR_FIELD_EXPIRES_AFTER_MSECS),
                        Value::from(exp_ms),
                    )
                    .xattr()
                    .create_path(),
                ];
                let opts = MutateInOptions {
                    store_semantics: StoreSemantics::Upsert,
                    ..self.mutate_options()
                };
                let res = self.kv_mutate(&atr_id, &specs, &opts)?;
                log_debug!(
                    LogTarget::Txn,
                    "set atr {} to PENDING, got start-time cas {}",
                    atr_id,
                    res.cas
                );
                hooks::fire(&self.hooks.after_atr_pending, None)?;
                self.set_state(AttemptState::Pending);
                Ok(())
            })();

            return match outcome {
                Ok(()) => Ok(()),
                Err(StepError::Failed(err)) => Err(err),
                Err(StepError::Client(err)) => {
                    log_debug!(
                        LogTarget::Txn,
                        "atr_pending got {} ({})",
                        err.class(),
                        err.message()
                    );
                    if self.in_overtime() {
                        return Err(OperationFailed::from_client(err).no_rollback().expired());
                    }
                    match err.class() {
                        ErrorClass::Expiry => {
                            self.enter_overtime();
                            Err(OperationFailed::from_client(err).expired())
                        }
                        ErrorClass::AtrFull => Err(OperationFailed::from_client(err)
                            .cause(CauseKind::AtrFull)),
                        ErrorClass::PathAlreadyExists => {
                            // The entry exists already (ambiguous write
                            // that landed); proceed as if ours
                            self.set_state(AttemptState::Pending);
                            Ok(())
                        }
                        ErrorClass::Ambiguous => {
                            self.overall.retry_delay(self.config);
                            continue;
                        }
                        ErrorClass::Transient => {
                            Err(OperationFailed::from_client(err).retry())
                        }
                        ErrorClass::Hard => Err(OperationFailed::from_client(err).no_rollback()),
                        _ => Err(OperationFailed::from_client(err)),
                    }
                }
            };
        }
    }

    // ========================================================================
    // WRITE-WRITE CONFLICTS
    // ========================================================================

    /// A staged write of another transaction was observed on `doc`.
    /// Decide whether to proceed, wait, or raise a retryable conflict.
    fn check_and_handle_blocking_transactions(
        &self,
        doc: &TransactionGetResult,
        stage: ForwardCompatStage,
    ) -> OpResult<()> {
        if !doc.links().has_staged_write() {
            return Ok(());
        }
        // The transaction id (not the attempt id) decides: a prior
        // attempt of this transaction is not a conflict.
        if doc.links().staged_transaction_id() == Some(self.overall.transaction_id()) {
            log_debug!(
                LogTarget::Txn,
                "doc {} was written by this transaction, ok to continue",
                doc.id()
            );
            return Ok(());
        }
        if doc.links().atr_id().is_none() || doc.links().atr_bucket_name().is_none() {
            log_debug!(
                LogTarget::Txn,
                "doc {} is in another transaction but lacks atr back-pointers, proceeding",
                doc.id()
            );
            return Ok(());
        }
        forward_compat::check(stage, doc.links().forward_compat())?;
        self.check_atr_entry_for_blocking_document(doc)
    }

    /// Poll the blocking writer's ATR entry with bounded exponential
    /// backoff, then give up with a retryable conflict
    fn check_atr_entry_for_blocking_document(&self, doc: &TransactionGetResult) -> OpResult<()> {
        let links = doc.links().clone();
        let result = retry_op_exponential_backoff_timeout(
            Duration::from_millis(50),
            Duration::from_millis(500),
            Duration::from_secs(1),
            || -> RetryableResult<()> {
                let blocked = |msg: String| {
                    RetryOrError::Err(
                        OperationFailed::new(ErrorClass::WriteWriteConflict, msg).retry(),
                    )
                };
                if let Err(err) =
                    hooks::fire(&self.hooks.before_check_atr_entry_for_blocking_doc, Some(doc.id().key()))
                {
                    return Err(blocked(err.message().to_string()));
                }
                let Some(atr_doc_id) = self.atr_doc_id_from_links(&links) else {
                    return Ok(());
                };
                let atr = match ActiveTransactionRecord::get_atr(
                    self.client,
                    &atr_doc_id,
                    self.kv_timeout(),
                ) {
                    Ok(atr) => atr,
                    Err(err) => return Err(blocked(err.message().to_string())),
                };
                let Some(atr) = atr else {
                    log_debug!(LogTarget::Txn, "blocking atr not found, proceeding");
                    return Ok(());
                };
                let entry = links
                    .staged_attempt_id()
                    .and_then(|attempt| atr.find_entry(attempt));
                let Some(entry) = entry else {
                    log_debug!(LogTarget::Txn, "no blocking atr entry, proceeding");
                    return Ok(());
                };
                forward_compat::check(ForwardCompatStage::WwcReadingAtr, entry.forward_compat())?;
                if entry.has_expired(SAFETY_MARGIN_MS) {
                    log_debug!(
                        LogTarget::Txn,
                        "blocking atr entry has expired (age {}ms), ignoring",
                        entry.age_ms()
                    );
                    return Ok(());
                }
                match entry.state() {
                    AttemptState::Completed | AttemptState::RolledBack => {
                        log_debug!(
                            LogTarget::Txn,
                            "blocking atr entry in state {}, ignoring",
                            entry.state()
                        );
                        Ok(())
                    }
                    state => Err(RetryOrError::Retry(format!(
                        "blocking atr entry in state {}",
                        state
                    ))),
                }
            },
        );
        match result {
            Ok(()) => Ok(()),
            Err(BackoffTimeoutError::TimedOut) => Err(OperationFailed::new(
                ErrorClass::WriteWriteConflict,
                format!("document {} is in another transaction", doc.id()),
            )
            .retry()),
            Err(BackoffTimeoutError::Inner(err)) => Err(err),
        }
    }

    // ========================================================================
    // STAGING: INSERT / REPLACE / REMOVE
    // ========================================================================

    /// Specs shared by staged replace and staged remove
    fn staging_specs(
        &self,
        doc: &TransactionGetResult,
        op_type: &str,
        staged: Value,
        atr_doc_id: &DocId,
    ) -> Vec<MutateInSpec> {
        let mut specs = vec![
            MutateInSpec::upsert(
                fields::TXN_ID,
                Value::String(self.overall.transaction_id().to_string()),
            )
            .xattr()
            .create_path(),
            MutateInSpec::upsert(fields::TXN_ATTEMPT_ID, Value::String(self.attempt_id.clone()))
                .xattr()
                .create_path(),
            MutateInSpec::upsert(fields::TXN_STAGED_DATA, staged)
                .xattr()
                .create_path(),
            MutateInSpec::upsert(
                fields::TXN_ATR_ID,
                Value::String(atr_doc_id.key().to_string()),
            )
            .xattr()
            .create_path(),
            MutateInSpec::upsert(
                fields::TXN_ATR_BUCKET_NAME,
                Value::String(atr_doc_id.bucket().to_string()),
            )
            .xattr()
            .create_path(),
            MutateInSpec::upsert(
                fields::TXN_ATR_COLL_NAME,
                Value::String(atr_doc_id.collection_spec()),
            )
            .xattr()
            .create_path(),
            MutateInSpec::upsert(fields::TXN_CRC32_OF_STAGING, Value::Null)
                .xattr()
                .create_path()
                .expand(MutateMacro::ValueCrc32c),
            MutateInSpec::upsert(fields::TXN_OP_TYPE, Value::String(op_type.to_string()))
                .xattr()
                .create_path(),
        ];
        if let Some(metadata) = doc.metadata() {
            if let Some(cas) = &metadata.cas {
                specs.push(
                    MutateInSpec::upsert(fields::TXN_RESTORE_CAS, Value::String(cas.clone()))
                        .xattr()
                        .create_path(),
                );
            }
            if let Some(revid) = &metadata.revid {
                specs.push(
                    MutateInSpec::upsert(fields::TXN_RESTORE_REVID, Value::String(revid.clone()))
                        .xattr()
                        .create_path(),
                );
            }
            if let Some(exptime) = metadata.exptime {
                specs.push(
                    MutateInSpec::upsert(fields::TXN_RESTORE_EXPTIME, Value::from(exptime))
                        .xattr()
                        .create_path(),
                );
            }
        }
        specs
    }

    /// Replace the content of a document previously read in this attempt
    pub fn replace(&self, doc: &TransactionGetResult, content: Value) -> OpResult<TransactionGetResult> {
        let result = (|| {
            self.existing_error()?;
            self.check_if_done()?;
            log_trace!(LogTarget::Txn, "replacing {}", doc.id());
            self.check_expiry_pre_commit(hooks::STAGE_REPLACE, Some(doc.id().key()))?;
            self.select_atr_if_needed(doc.id());
            self.check_and_handle_blocking_transactions(doc, ForwardCompatStage::WwcReplacing)?;
            self.set_atr_pending_if_first_mutation()?;

            match self.stage_replace_inner(doc, &content) {
                Ok(out) => Ok(out),
                Err(StepError::Failed(err)) => Err(err),
                Err(StepError::Client(err)) => match err.class() {
                    ErrorClass::Expiry => {
                        self.enter_overtime();
                        Err(OperationFailed::from_client(err).expired())
                    }
                    ErrorClass::DocNotFound
                    | ErrorClass::DocAlreadyExists
                    | ErrorClass::CasMismatch
                    | ErrorClass::Transient
                    | ErrorClass::Ambiguous => Err(OperationFailed::from_client(err).retry()),
                    ErrorClass::Hard => Err(OperationFailed::from_client(err).no_rollback()),
                    _ => Err(OperationFailed::from_client(err)),
                },
            }
        })();
        self.record_failure(result)
    }

    fn stage_replace_inner(
        &self,
        doc: &TransactionGetResult,
        content: &Value,
    ) -> StepResult<TransactionGetResult> {
        let atr_doc_id = self.require_atr_id()?;
        let specs = self.staging_specs(doc, fields::OP_TYPE_REPLACE, content.clone(), &atr_doc_id);
        let opts = MutateInOptions {
            cas: doc.cas(),
            access_deleted: doc.links().is_deleted(),
            ..self.mutate_options()
        };
        hooks::fire(&self.hooks.before_staged_replace, Some(doc.id().key()))?;
        log_trace!(
            LogTarget::Txn,
            "about to replace doc {} with cas {} in txn {}",
            doc.id(),
            doc.cas(),
            self.overall.transaction_id()
        );
        let res = self.kv_mutate(doc.id(), &specs, &opts)?;
        hooks::fire(&self.hooks.after_staged_replace_complete, Some(doc.id().key()))?;

        let links = TransactionLinks::new(
            Some(atr_doc_id.key().to_string()),
            Some(atr_doc_id.bucket().to_string()),
            Some(atr_doc_id.collection_spec()),
            Some(self.overall.transaction_id().to_string()),
            Some(self.attempt_id.clone()),
            Some(content.clone()),
            None,
            None,
            None,
            None,
            Some(fields::OP_TYPE_REPLACE.to_string()),
            None,
            doc.links().is_deleted(),
        );
        let out =
            TransactionGetResult::own_write(doc.id().clone(), content.clone(), res.cas, links);
        self.staged_mutations.add(StagedMutation::new(
            out.clone(),
            content.clone(),
            StagedMutationType::Replace,
        ));
        Ok(out)
    }

    /// Stage an insert of a new document. The document is created in
    /// tombstone state so no reader outside this transaction sees it
    /// before commit.
    pub fn insert(&self, id: &DocId, content: Value) -> OpResult<TransactionGetResult> {
        let result = (|| {
            self.existing_error()?;
            self.check_if_done()?;
            if self.staged_mutations.find_insert(id).is_some()
                || self.staged_mutations.find_replace(id).is_some()
            {
                return Err(OperationFailed::new(
                    ErrorClass::Other,
                    "cannot insert a document already mutated in this transaction",
                ));
            }
            self.check_expiry_pre_commit(hooks::STAGE_INSERT, Some(id.key()))?;
            self.select_atr_if_needed(id);
            self.set_atr_pending_if_first_mutation()?;

            let cas = std::cell::Cell::new(0u64);
            retry_op(|| self.create_staged_insert(id, &content, &cas))
        })();
        self.record_failure(result)
    }

    fn create_staged_insert(
        &self,
        id: &DocId,
        content: &Value,
        cas: &std::cell::Cell<u64>,
    ) -> RetryableResult<TransactionGetResult> {
        let outcome: StepResult<TransactionGetResult> = (|| {
            self.error_if_expired_and_not_in_overtime(
                hooks::STAGE_CREATE_STAGED_INSERT,
                Some(id.key()),
            )?;
            hooks::fire(&self.hooks.before_staged_insert, Some(id.key()))?;
            log_debug!(
                LogTarget::Txn,
                "about to stage insert of doc {} with cas {}",
                id,
                cas.get()
            );
            let atr_doc_id = self.require_atr_id()?;
            let template = TransactionGetResult::own_write(
                id.clone(),
                Value::Null,
                0,
                TransactionLinks::default(),
            );
            let specs =
                self.staging_specs(&template, fields::OP_TYPE_INSERT, content.clone(), &atr_doc_id);
            let opts = MutateInOptions {
                cas: cas.get(),
                access_deleted: true,
                create_as_deleted: true,
                store_semantics: StoreSemantics::Insert,
                ..self.mutate_options()
            };
            let res = self.kv_mutate(id, &specs, &opts)?;
            log_debug!(LogTarget::Txn, "staged insert of {} got cas {}", id, res.cas);
            hooks::fire(&self.hooks.after_staged_insert_complete, Some(id.key()))?;

            let links = TransactionLinks::new(
                Some(atr_doc_id.key().to_string()),
                Some(atr_doc_id.bucket().to_string()),
                Some(atr_doc_id.collection_spec()),
                Some(self.overall.transaction_id().to_string()),
                Some(self.attempt_id.clone()),
                Some(content.clone()),
                None,
                None,
                None,
                None,
                Some(fields::OP_TYPE_INSERT.to_string()),
                None,
                true,
            );
            let out =
                TransactionGetResult::own_write(id.clone(), content.clone(), res.cas, links);
            self.staged_mutations.add(StagedMutation::new(
                out.clone(),
                content.clone(),
                StagedMutationType::Insert,
            ));
            Ok(out)
        })();

        match outcome {
            Ok(out) => Ok(out),
            Err(StepError::Failed(err)) => Err(err.into()),
            Err(StepError::Client(err)) => {
                if self.in_overtime() {
                    return Err(OperationFailed::new(
                        ErrorClass::Expiry,
                        "attempt timed out",
                    )
                    .expired()
                    .into());
                }
                match err.class() {
                    ErrorClass::Expiry => {
                        self.enter_overtime();
                        Err(OperationFailed::from_client(err).expired().into())
                    }
                    ErrorClass::Transient => {
                        Err(OperationFailed::from_client(err).retry().into())
                    }
                    ErrorClass::Ambiguous => {
                        Err(RetryOrError::Retry("ambiguous staged insert".to_string()))
                    }
                    ErrorClass::DocAlreadyExists | ErrorClass::CasMismatch => {
                        self.handle_doc_exists_during_staged_insert(id, cas)
                    }
                    ErrorClass::Other => Err(OperationFailed::from_client(err).into()),
                    ErrorClass::Hard => {
                        Err(OperationFailed::from_client(err).no_rollback().into())
                    }
                    _ => Err(OperationFailed::new(
                        ErrorClass::Other,
                        err.message().to_string(),
                    )
                    .retry()
                    .into()),
                }
            }
        }
    }

    /// The insert hit an existing key. Work out whether it is a plain
    /// tombstone (retry with its CAS), another transaction's staged
    /// insert (resolve the conflict, then retry with its CAS), or a real
    /// live document (terminal failure).
    fn handle_doc_exists_during_staged_insert<T>(
        &self,
        id: &DocId,
        cas: &std::cell::Cell<u64>,
    ) -> RetryableResult<T> {
        log_debug!(
            LogTarget::Txn,
            "found existing doc {}, may still be able to insert",
            id
        );
        let fetched: StepResult<Option<TransactionGetResult>> = (|| {
            hooks::fire(
                &self.hooks.before_get_doc_in_exists_during_staged_insert,
                Some(id.key()),
            )?;
            self.get_doc(id)
        })();

        let doc = match fetched {
            Ok(doc) => doc,
            Err(StepError::Failed(err)) => return Err(err.into()),
            Err(StepError::Client(err)) => {
                return match err.class() {
                    ErrorClass::Transient | ErrorClass::PathNotFound => Err(OperationFailed::new(
                        err.class(),
                        "error while checking existing doc in insert",
                    )
                    .retry()
                    .into()),
                    _ => Err(OperationFailed::from_client(err).into()),
                };
            }
        };

        let Some(doc) = doc else {
            // The doc vanished between the failed insert and the fetch
            return Err(OperationFailed::new(
                ErrorClass::DocNotFound,
                "insert failed as the doc existed, but it no longer does",
            )
            .retry()
            .into());
        };

        forward_compat::check(
            ForwardCompatStage::WwcInsertingGet,
            doc.links().forward_compat(),
        )?;

        if !doc.links().is_document_in_transaction() {
            if doc.links().is_deleted() {
                // Plain tombstone: overwrite it using its CAS
                log_debug!(
                    LogTarget::Txn,
                    "doc {} is a bare tombstone, retrying insert with cas {}",
                    id,
                    doc.cas()
                );
                cas.set(doc.cas());
                return Err(RetryOrError::Retry("retry insert over tombstone".to_string()));
            }
            // Live non-transactional document: a genuine conflict
            return Err(OperationFailed::new(
                ErrorClass::DocAlreadyExists,
                format!("document {} already exists", id),
            )
            .into());
        }
        if doc.links().op() != Some(fields::OP_TYPE_INSERT) {
            // Only another staged insert may be overwritten
            return Err(OperationFailed::new(
                ErrorClass::DocAlreadyExists,
                format!("document {} exists and is not a staged insert", id),
            )
            .cause(CauseKind::DocumentExists)
            .into());
        }
        self.check_and_handle_blocking_transactions(&doc, ForwardCompatStage::WwcInserting)?;
        log_debug!(
            LogTarget::Txn,
            "doc {} ok to overwrite, retrying with cas {}",
            id,
            doc.cas()
        );
        cas.set(doc.cas());
        Err(RetryOrError::Retry(
            "retry insert over staged insert".to_string(),
        ))
    }

    /// Stage the removal of a document previously read in this attempt
    pub fn remove(&self, doc: &TransactionGetResult) -> OpResult<()> {
        let result = (|| {
            self.existing_error()?;
            self.check_if_done()?;
            self.check_expiry_pre_commit(hooks::STAGE_REMOVE, Some(doc.id().key()))?;
            if self.staged_mutations.find_insert(doc.id()).is_some() {
                log_error!(
                    LogTarget::Txn,
                    "cannot remove {}: inserted in this transaction",
                    doc.id()
                );
                return Err(OperationFailed::new(
                    ErrorClass::Other,
                    "cannot remove a document inserted in the same transaction",
                ));
            }
            log_trace!(LogTarget::Txn, "removing {}", doc.id());
            self.check_and_handle_blocking_transactions(doc, ForwardCompatStage::WwcRemoving)?;
            self.select_atr_if_needed(doc.id());
            self.set_atr_pending_if_first_mutation()?;

            match self.stage_remove_inner(doc) {
                Ok(()) => Ok(()),
                Err(StepError::Failed(err)) => Err(err),
                Err(StepError::Client(err)) => match err.class() {
                    ErrorClass::Expiry => {
                        self.enter_overtime();
                        Err(OperationFailed::from_client(err).expired())
                    }
                    ErrorClass::DocNotFound
                    | ErrorClass::DocAlreadyExists
                    | ErrorClass::CasMismatch
                    | ErrorClass::Transient
                    | ErrorClass::Ambiguous => Err(OperationFailed::from_client(err).retry()),
                    ErrorClass::Hard => Err(OperationFailed::from_client(err).no_rollback()),
                    _ => Err(OperationFailed::from_client(err)),
                },
            }
        })();
        self.record_failure(result)
    }

    fn stage_remove_inner(&self, doc: &TransactionGetResult) -> StepResult<()> {
        let atr_doc_id = self.require_atr_id()?;
        hooks::fire(&self.hooks.before_staged_remove, Some(doc.id().key()))?;
        log_trace!(
            LogTarget::Txn,
            "about to stage remove of doc {} with cas {}",
            doc.id(),
            doc.cas()
        );
        let staged = Value::String(fields::STAGED_DATA_REMOVED_VALUE.to_string());
        let specs = self.staging_specs(doc, fields::OP_TYPE_REMOVE, staged.clone(), &atr_doc_id);
        let opts = MutateInOptions {
            cas: doc.cas(),
            access_deleted: doc.links().is_deleted(),
            ..self.mutate_options()
        };
        let res = self.kv_mutate(doc.id(), &specs, &opts)?;
        hooks::fire(&self.hooks.after_staged_remove_complete, Some(doc.id().key()))?;

        let links = TransactionLinks::new(
            Some(atr_doc_id.key().to_string()),
            Some(atr_doc_id.bucket().to_string()),
            Some(atr_doc_id.collection_spec()),
            Some(self.overall.transaction_id().to_string()),
            Some(self.attempt_id.clone()),
            Some(staged),
            None,
            None,
            None,
            None,
            Some(fields::OP_TYPE_REMOVE.to_string()),
            None,
            doc.links().is_deleted(),
        );
        let out = TransactionGetResult::own_write(
            doc.id().clone(),
            doc.content().clone(),
            res.cas,
            links,
        );
        self.staged_mutations.add(StagedMutation::new(
            out,
            Value::Null,
            StagedMutationType::Remove,
        ));
        Ok(())
    }

    // ========================================================================
    // COMMIT
    // ========================================================================

    /// Drive the attempt to COMPLETED. With no staged mutations this is a
    /// no-op that just finalizes the attempt.
    pub fn commit(&self) -> OpResult<()> {
        log_debug!(LogTarget::Txn, "commit {}", self.attempt_id);
        self.existing_error()?;
        self.check_expiry_pre_commit(hooks::STAGE_BEFORE_COMMIT, None)?;

        if self.atr_id.lock().is_some() && !self.is_done() {
            let result = (|| {
                retry_op_exp(|| self.atr_commit())?;
                self.staged_mutations.commit(self)?;
                self.atr_complete()?;
                Ok(())
            })();
            if result.is_ok() {
                self.is_done.store(true, Ordering::SeqCst);
            }
            self.record_failure(result)
        } else if !self.is_done() {
            log_debug!(
                LogTarget::Txn,
                "commit on attempt with no mutations, skipping"
            );
            self.is_done.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(OperationFailed::new(
                ErrorClass::Other,
                "commit called on attempt that is already completed",
            )
            .no_rollback())
        }
    }

    /// Flip the ATR entry to COMMITTED. This is the transaction's commit
    /// point: once this lands, the outcome is decided.
    fn atr_commit(&self) -> RetryableResult<()> {
        let atr_id = match self.require_atr_id() {
            Ok(id) => id,
            Err(err) => return Err(err.into()),
        };
        let prefix = self.atr_entry_prefix();
        let outcome: StepResult<()> = (|| {
            let mut specs = vec![
                MutateInSpec::upsert(
                    format!("{}{}", prefix, fields::ATR_FIELD_STATUS),
                    Value::String(AttemptState::Committed.name().to_string()),
                )
                .xattr(),
                MutateInSpec::upsert(
                    format!("{}{}", prefix, fields::ATR_FIELD_START_COMMIT),
                    Value::Null,
                )
                .xattr()
                .expand(MutateMacro::Cas),
            ];
            self.staged_mutations.extract_to(&prefix, &mut specs);
            self.error_if_expired_and_not_in_overtime(hooks::STAGE_ATR_COMMIT, None)?;
            hooks::fire(&self.hooks.before_atr_commit, None)?;
            log_trace!(LogTarget::Txn, "updating atr {} to COMMITTED", atr_id);
            self.kv_mutate(&atr_id, &specs, &self.mutate_options())?;
            hooks::fire(&self.hooks.after_atr_commit, None)?;
            self.set_state(AttemptState::Committed);
            Ok(())
        })();

        match outcome {
            Ok(()) => Ok(()),
            Err(StepError::Failed(err)) => Err(err.into()),
            Err(StepError::Client(err)) => match err.class() {
                ErrorClass::Expiry => {
                    if self.in_overtime() {
                        // Second expiry: the commit state is unknowable
                        Err(OperationFailed::from_client(err)
                            .no_rollback()
                            .ambiguous()
                            .into())
                    } else {
                        // One more pass with expiry checks suppressed
                        self.enter_overtime();
                        Err(RetryOrError::Retry(
                            "expired during atr_commit, retrying in overtime".to_string(),
                        ))
                    }
                }
                ErrorClass::Ambiguous => {
                    log_debug!(
                        LogTarget::Txn,
                        "atr_commit got FAIL_AMBIGUOUS, resolving ambiguity"
                    );
                    match retry_op(|| self.atr_commit_ambiguity_resolution()) {
                        Ok(AmbiguityOutcome::Committed) => {
                            self.set_state(AttemptState::Committed);
                            Ok(())
                        }
                        Ok(AmbiguityOutcome::RetryCommit) => Err(RetryOrError::Retry(
                            "atr still pending, retry atr_commit".to_string(),
                        )),
                        Err(err) => Err(err.into()),
                    }
                }
                ErrorClass::Transient => Err(OperationFailed::from_client(err).retry().into()),
                ErrorClass::Hard => Err(OperationFailed::from_client(err).no_rollback().into()),
                _ => {
                    log_error!(
                        LogTarget::Txn,
                        "failed to commit transaction {} attempt {}: {}",
                        self.overall.transaction_id(),
                        self.attempt_id,
                        err
                    );
                    Err(OperationFailed::from_client(err).into())
                }
            },
        }
    }

    /// The commit write timed out ambiguously: read our entry state back
    /// and decide.
    fn atr_commit_ambiguity_resolution(&self) -> RetryableResult<AmbiguityOutcome> {
        let atr_id = match self.require_atr_id() {
            Ok(id) => id,
            Err(err) => return Err(err.into()),
        };
        let outcome: StepResult<AmbiguityOutcome> = (|| {
            self.error_if_expired_and_not_in_overtime(
                hooks::STAGE_ATR_COMMIT_AMBIGUITY_RESOLUTION,
                None,
            )?;
            hooks::fire(&self.hooks.before_atr_commit_ambiguity_resolution, None)?;
            let path = format!(
                "{}.{}.{}",
                fields::ATR_FIELD_ATTEMPTS,
                self.attempt_id,
                fields::ATR_FIELD_STATUS
            );
            let specs = [LookupInSpec::get(path).xattr()];
            let res = self.kv_lookup(&atr_id, &specs, &self.lookup_options(false))?;
            let Some(state_str) = res.value(0).and_then(|v| v.as_str()) else {
                // Entry gone mid-commit: someone rolled us back
                return Err(StepError::Failed(
                    OperationFailed::new(
                        ErrorClass::Other,
                        "transaction was rolled back externally",
                    )
                    .no_rollback(),
                ));
            };
            match AttemptState::parse(state_str) {
                Some(AttemptState::Completed) | Some(AttemptState::Committed) => {
                    Ok(AmbiguityOutcome::Committed)
                }
                Some(AttemptState::Aborted) | Some(AttemptState::RolledBack) => {
                    Err(StepError::Failed(
                        OperationFailed::new(
                            ErrorClass::Other,
                            "transaction was rolled back externally",
                        )
                        .no_rollback(),
                    ))
                }
                _ => Ok(AmbiguityOutcome::RetryCommit),
            }
        })();

        match outcome {
            Ok(result) => Ok(result),
            Err(StepError::Failed(err)) => Err(err.into()),
            Err(StepError::Client(err)) => match err.class() {
                ErrorClass::Expiry => Err(OperationFailed::from_client(err)
                    .no_rollback()
                    .ambiguous()
                    .into()),
                ErrorClass::Hard => Err(OperationFailed::from_client(err).no_rollback().into()),
                ErrorClass::Transient | ErrorClass::Other => Err(RetryOrError::Retry(
                    "transient error during ambiguity resolution".to_string(),
                )),
                ErrorClass::PathNotFound => Err(OperationFailed::new(
                    ErrorClass::Other,
                    "transaction was rolled back externally",
                )
                .no_rollback()
                .into()),
                _ => Err(OperationFailed::from_client(err).no_rollback().into()),
            },
        }
    }

    /// Remove the attempt entry after all documents were unstaged.
    /// Failures here are logged and swallowed - the transaction is
    /// committed; only FAIL_HARD surfaces (as a post-commit failure).
    fn atr_complete(&self) -> OpResult<()> {
        let atr_id = self.require_atr_id()?;
        let outcome: StepResult<()> = (|| {
            hooks::fire(&self.hooks.before_atr_complete, None)?;
            self.error_if_expired_and_not_in_overtime(hooks::STAGE_ATR_COMPLETE, None)?;
            log_debug!(
                LogTarget::Txn,
                "removing attempt {} from atr {}",
                self.attempt_id,
                atr_id
            );
            let path = format!("{}.{}", fields::ATR_FIELD_ATTEMPTS, self.attempt_id);
            let specs = [MutateInSpec::remove(path).xattr()];
            self.kv_mutate(&atr_id, &specs, &self.mutate_options())?;
            hooks::fire(&self.hooks.after_atr_complete, None)?;
            self.set_state(AttemptState::Completed);
            Ok(())
        })();
        match outcome {
            Ok(()) => Ok(()),
            Err(StepError::Failed(err)) => Err(err),
            Err(StepError::Client(err)) => match err.class() {
                ErrorClass::Hard => Err(OperationFailed::from_client(err)
                    .no_rollback()
                    .failed_post_commit()),
                _ => {
                    log_debug!(
                        LogTarget::Txn,
                        "ignoring error in atr_complete: {}",
                        err
                    );
                    Ok(())
                }
            },
        }
    }

    // ========================================================================
    // PER-DOCUMENT UNSTAGE (commit side)
    // ========================================================================

    /// Post-commit per-document failures never roll back; the entry stays
    /// COMMITTED and cleanup finishes the job.
    fn post_commit_failure(err: ClientError) -> OperationFailed {
        OperationFailed::from_client(err)
            .no_rollback()
            .failed_post_commit()
    }

    /// Unstage one staged INSERT or REPLACE: clear the txn block and move
    /// the staged content into the body in a single mutation (reviving
    /// the tombstone in the insert case).
    pub(crate) fn commit_doc(&self, mutation: &StagedMutation) -> OpResult<()> {
        let id = mutation.id().clone();
        self.check_expiry_during_commit_or_rollback(hooks::STAGE_COMMIT_DOC, Some(id.key()));
        retry_op_exp(|| {
            let outcome: StepResult<()> = (|| {
                hooks::fire(&self.hooks.before_doc_committed, Some(id.key()))?;
                let specs = [
                    MutateInSpec::remove(fields::TXN_PREFIX_ONLY).xattr(),
                    MutateInSpec::set_doc(mutation.content().clone()),
                ];
                let opts = MutateInOptions {
                    cas: mutation.doc().cas(),
                    access_deleted: mutation.doc().links().is_deleted(),
                    ..self.mutate_options()
                };
                self.kv_mutate(&id, &specs, &opts)?;
                hooks::fire(&self.hooks.after_doc_committed, Some(id.key()))?;
                log_trace!(LogTarget::Txn, "committed doc {}", id);
                Ok(())
            })();
            match outcome {
                Ok(()) => Ok(()),
                Err(StepError::Failed(err)) => Err(err.into()),
                Err(StepError::Client(err)) => match err.class() {
                    // Someone (cleanup) already moved this doc forward
                    ErrorClass::DocNotFound | ErrorClass::PathNotFound => {
                        log_debug!(
                            LogTarget::Txn,
                            "unstage of {} found no staged data, already done",
                            id
                        );
                        Ok(())
                    }
                    ErrorClass::Transient => {
                        Err(RetryOrError::Retry("transient during unstage".to_string()))
                    }
                    ErrorClass::Ambiguous => {
                        Err(RetryOrError::Retry("ambiguous during unstage".to_string()))
                    }
                    // The staged CAS came from the staging step; nobody
                    // may legally have mutated the doc since
                    ErrorClass::CasMismatch => Err(Self::post_commit_failure(err).into()),
                    _ => Err(Self::post_commit_failure(err).into()),
                },
            }
        })
    }

    /// Unstage one staged REMOVE: delete the document
    pub(crate) fn remove_doc(&self, mutation: &StagedMutation) -> OpResult<()> {
        let id = mutation.id().clone();
        self.check_expiry_during_commit_or_rollback(hooks::STAGE_REMOVE_DOC, Some(id.key()));
        retry_op_exp(|| {
            let outcome: Result<(), ClientError> = (|| {
                hooks::fire(&self.hooks.before_doc_removed, Some(id.key()))?;
                self.client
                    .remove(
                        &id,
                        mutation.doc().cas(),
                        self.config.durability_level(),
                        self.kv_timeout(),
                    )
                    .map_err(|err| ClientError::from_kv(err, OpKind::Mutation))?;
                log_trace!(LogTarget::Txn, "removed doc {}", id);
                Ok(())
            })();
            match outcome {
                Ok(()) => Ok(()),
                Err(err) => match err.class() {
                    ErrorClass::DocNotFound => {
                        log_debug!(LogTarget::Txn, "doc {} already removed", id);
                        Ok(())
                    }
                    ErrorClass::Transient | ErrorClass::Ambiguous => {
                        Err(RetryOrError::Retry("transient during remove".to_string()))
                    }
                    ErrorClass::CasMismatch => Err(Self::post_commit_failure(err).into()),
                    _ => Err(Self::post_commit_failure(err).into()),
                },
            }
        })
    }

    // ========================================================================
    // ROLLBACK
    // ========================================================================

    /// Application-initiated rollback. Reverts every staged mutation and
    /// makes the whole transaction finish as failed (no retry).
    pub fn rollback(&self) -> OpResult<()> {
        self.rolled_back_by_caller.store(true, Ordering::SeqCst);
        self.rollback_internal()
    }

    /// Revert every staged mutation and abort the ATR entry
    pub(crate) fn rollback_internal(&self) -> OpResult<()> {
        log_debug!(LogTarget::Txn, "rolling back {}", self.attempt_id);
        self.check_expiry_during_commit_or_rollback(hooks::STAGE_ROLLBACK, None);

        if self.atr_id.lock().is_none() || self.state() == AttemptState::NotStarted {
            log_debug!(LogTarget::Txn, "rollback with no mutations, nothing to do");
            self.is_done.store(true, Ordering::SeqCst);
            return Ok(());
        }
        if self.is_done() {
            return Err(OperationFailed::new(
                ErrorClass::Other,
                "transaction already finished, cannot rollback",
            )
            .no_rollback());
        }

        retry_op_exp(|| self.atr_abort())?;
        self.staged_mutations.rollback(self)?;
        log_debug!(LogTarget::Txn, "rollback completed unstaging docs");
        retry_op_exp(|| self.atr_rollback_complete())?;
        Ok(())
    }

    fn atr_abort(&self) -> RetryableResult<()> {
        let atr_id = match self.require_atr_id() {
            Ok(id) => id,
            Err(err) => return Err(err.into()),
        };
        let prefix = self.atr_entry_prefix();
        let outcome: StepResult<()> = (|| {
            self.error_if_expired_and_not_in_overtime(hooks::STAGE_ATR_ABORT, None)?;
            hooks::fire(&self.hooks.before_atr_aborted, None)?;
            let mut specs = vec![
                MutateInSpec::upsert(
                    format!("{}{}", prefix, fields::ATR_FIELD_STATUS),
                    Value::String(AttemptState::Aborted.name().to_string()),
                )
                .xattr()
                .create_path(),
                MutateInSpec::upsert(
                    format!("{}{}", prefix, fields::ATR_FIELD_TIMESTAMP_ROLLBACK_START),
                    Value::Null,
                )
                .xattr()
                .create_path()
                .expand(MutateMacro::Cas),
            ];
            self.staged_mutations.extract_to(&prefix, &mut specs);
            self.kv_mutate(&atr_id, &specs, &self.mutate_options())?;
            self.set_state(AttemptState::Aborted);
            hooks::fire(&self.hooks.after_atr_aborted, None)?;
            log_debug!(LogTarget::Txn, "rollback completed atr abort phase");
            Ok(())
        })();

        match outcome {
            Ok(()) => Ok(()),
            Err(StepError::Failed(err)) => Err(err.into()),
            Err(StepError::Client(err)) => {
                if self.in_overtime() {
                    log_debug!(
                        LogTarget::Txn,
                        "atr_abort got {} while in overtime",
                        err
                    );
                    return Err(OperationFailed::new(
                        ErrorClass::Expiry,
                        format!("expired in atr_abort: {}", err.message()),
                    )
                    .no_rollback()
                    .expired()
                    .into());
                }
                log_debug!(LogTarget::Txn, "atr_abort got {}", err.class());
                match err.class() {
                    ErrorClass::Expiry => {
                        self.enter_overtime();
                        Err(RetryOrError::Retry(
                            "expired, retrying atr_abort in overtime".to_string(),
                        ))
                    }
                    ErrorClass::PathNotFound => Err(OperationFailed::from_client(err)
                        .no_rollback()
                        .cause(CauseKind::AtrEntryNotFound)
                        .into()),
                    ErrorClass::DocNotFound => Err(OperationFailed::from_client(err)
                        .no_rollback()
                        .cause(CauseKind::AtrNotFound)
                        .into()),
                    ErrorClass::AtrFull => Err(OperationFailed::from_client(err)
                        .no_rollback()
                        .cause(CauseKind::AtrFull)
                        .into()),
                    ErrorClass::Hard => {
                        Err(OperationFailed::from_client(err).no_rollback().into())
                    }
                    _ => Err(RetryOrError::Retry("retry atr_abort".to_string())),
                }
            }
        }
    }

    fn atr_rollback_complete(&self) -> RetryableResult<()> {
        let atr_id = match self.require_atr_id() {
            Ok(id) => id,
            Err(err) => return Err(err.into()),
        };
        let outcome: StepResult<()> = (|| {
            self.error_if_expired_and_not_in_overtime(hooks::STAGE_ATR_ROLLBACK_COMPLETE, None)?;
            hooks::fire(&self.hooks.before_atr_rolled_back, None)?;
            let path = format!("{}.{}", fields::ATR_FIELD_ATTEMPTS, self.attempt_id);
            let specs = [MutateInSpec::remove(path).xattr()];
            self.kv_mutate(&atr_id, &specs, &self.mutate_options())?;
            self.set_state(AttemptState::RolledBack);
            hooks::fire(&self.hooks.after_atr_rolled_back, None)?;
            self.is_done.store(true, Ordering::SeqCst);
            Ok(())
        })();

        match outcome {
            Ok(()) => Ok(()),
            Err(StepError::Failed(err)) => Err(err.into()),
            Err(StepError::Client(err)) => {
                if self.in_overtime() {
                    return Err(OperationFailed::new(
                        ErrorClass::Expiry,
                        format!("expired in atr_rollback_complete: {}", err.message()),
                    )
                    .no_rollback()
                    .expired()
                    .into());
                }
                match err.class() {
                    ErrorClass::DocNotFound | ErrorClass::PathNotFound => {
                        log_debug!(
                            LogTarget::Txn,
                            "atr entry for {} gone, treating rollback as complete",
                            self.attempt_id
                        );
                        self.is_done.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                    ErrorClass::AtrFull => {
                        Err(RetryOrError::Retry("atr full, retrying".to_string()))
                    }
                    ErrorClass::Hard => {
                        Err(OperationFailed::from_client(err).no_rollback().into())
                    }
                    ErrorClass::Expiry => Err(OperationFailed::from_client(err)
                        .no_rollback()
                        .expired()
                        .into()),
                    _ => Err(RetryOrError::Retry(
                        "retrying atr_rollback_complete".to_string(),
                    )),
                }
            }
        }
    }

    // ========================================================================
    // PER-DOCUMENT REVERT (rollback side)
    // ========================================================================

    /// Revert a staged INSERT: drop the txn block from the tombstone,
    /// which erases the only trace of the document
    pub(crate) fn rollback_staged_insert(&self, mutation: &StagedMutation) -> OpResult<()> {
        let id = mutation.id().clone();
        self.check_expiry_during_commit_or_rollback(hooks::STAGE_DELETE_INSERTED, Some(id.key()));
        retry_op_exp(|| {
            let outcome: Result<(), ClientError> = (|| {
                hooks::fire(&self.hooks.before_rollback_delete_inserted, Some(id.key()))?;
                let specs = [MutateInSpec::remove(fields::TXN_PREFIX_ONLY).xattr()];
                let opts = MutateInOptions {
                    cas: mutation.doc().cas(),
                    access_deleted: true,
                    ..self.mutate_options()
                };
                self.kv_mutate(&id, &specs, &opts)?;
                log_trace!(LogTarget::Txn, "rolled back staged insert of {}", id);
                Ok(())
            })();
            self.map_rollback_doc_outcome(&id, outcome)
        })
    }

    /// Revert a staged REPLACE or REMOVE: clear the txn block, leaving
    /// the pre-transaction body untouched
    pub(crate) fn rollback_doc(&self, mutation: &StagedMutation) -> OpResult<()> {
        let id = mutation.id().clone();
        self.check_expiry_during_commit_or_rollback(hooks::STAGE_ROLLBACK_DOC, Some(id.key()));
        retry_op_exp(|| {
            let outcome: Result<(), ClientError> = (|| {
                hooks::fire(&self.hooks.before_doc_rolled_back, Some(id.key()))?;
                let specs = [MutateInSpec::remove(fields::TXN_PREFIX_ONLY).xattr()];
                let opts = MutateInOptions {
                    cas: mutation.doc().cas(),
                    access_deleted: mutation.doc().links().is_deleted(),
                    ..self.mutate_options()
                };
                self.kv_mutate(&id, &specs, &opts)?;
                log_trace!(LogTarget::Txn, "rolled back staged mutation of {}", id);
                Ok(())
            })();
            self.map_rollback_doc_outcome(&id, outcome)
        })
    }

    fn map_rollback_doc_outcome(
        &self,
        id: &DocId,
        outcome: Result<(), ClientError>,
    ) -> RetryableResult<()> {
        match outcome {
            Ok(()) => Ok(()),
            Err(err) => match err.class() {
                // Cleanup beat us to it
                ErrorClass::DocNotFound | ErrorClass::PathNotFound => {
                    log_debug!(LogTarget::Txn, "rollback of {} found nothing staged", id);
                    Ok(())
                }
                ErrorClass::Transient | ErrorClass::Ambiguous => {
                    Err(RetryOrError::Retry("transient during rollback".to_string()))
                }
                ErrorClass::Hard => Err(OperationFailed::from_client(err).no_rollback().into()),
                _ => Err(OperationFailed::from_client(err).into()),
            },
        }
    }
}
