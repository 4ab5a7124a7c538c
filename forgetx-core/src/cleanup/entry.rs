// cleanup/entry.rs
//! Cleanup of a single ATR entry
//!
//! Both cleanup subsystems funnel through [`AtrCleanupEntry::clean`]: it
//! re-reads the entry, replays the committed outcome (or reverts the
//! pending one) on every document the entry lists, then removes the
//! entry. All steps are guarded: a document whose staged attempt id or
//! staging CRC no longer matches has already been moved forward by
//! someone else and is skipped.

use std::time::Instant;

use serde_json::Value;

use crate::atr::{ActiveTransactionRecord, AtrEntry, DocRecord, SAFETY_MARGIN_MS};
use crate::attempt_state::AttemptState;
use crate::config::TransactionConfig;
use crate::document::{transactional_lookup_specs, DocId, TransactionGetResult};
use crate::error::{ClientError, ErrorClass, OpKind, OpResult, OperationFailed};
use crate::fields;
use crate::forward_compat::{self, ForwardCompatStage};
use crate::hooks::{self, CleanupTestingHooks};
use crate::kv::{KvClient, LookupInOptions, MutateInOptions, MutateInSpec, StoreSemantics};
use crate::logging::LogTarget;
use crate::{log_debug, log_trace};

/// One entry to clean: the ATR document and the attempt inside it
#[derive(Debug, Clone)]
pub struct AtrCleanupEntry {
    atr_id: DocId,
    attempt_id: String,
    /// Lost cleanup only touches entries expired past the safety margin;
    /// the in-process queue cleans its own attempts unconditionally
    check_if_expired: bool,
    /// Earliest moment the in-process queue may process this entry
    ready_time: Instant,
}

impl AtrCleanupEntry {
    pub fn new(atr_id: DocId, attempt_id: String, check_if_expired: bool, ready_time: Instant) -> Self {
        AtrCleanupEntry {
            atr_id,
            attempt_id,
            check_if_expired,
            ready_time,
        }
    }

    pub fn atr_id(&self) -> &DocId {
        &self.atr_id
    }

    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    pub fn ready_time(&self) -> Instant {
        self.ready_time
    }

    pub fn ready(&self) -> bool {
        Instant::now() > self.ready_time
    }

    /// Run the full cleanup for this entry. Returns the entry's state
    /// when something was actually cleaned.
    pub fn clean(
        &self,
        client: &dyn KvClient,
        config: &TransactionConfig,
        target: LogTarget,
    ) -> OpResult<Option<AttemptState>> {
        log_trace!(target, "cleaning atr {} attempt {}", self.atr_id, self.attempt_id);
        let hooks = config.cleanup_hooks();
        hooks::fire(&hooks.before_atr_get, Some(self.atr_id.key()))
            .map_err(OperationFailed::from_client)?;

        let atr = ActiveTransactionRecord::get_atr(client, &self.atr_id, config.kv_timeout())
            .map_err(OperationFailed::from_client)?;
        let Some(atr) = atr else {
            log_trace!(target, "atr {} not found, nothing to clean", self.atr_id);
            return Ok(None);
        };
        let Some(entry) = atr.find_entry(&self.attempt_id) else {
            log_trace!(
                target,
                "attempt {} not in atr {}, nothing to clean",
                self.attempt_id,
                self.atr_id
            );
            return Ok(None);
        };

        if self.check_if_expired && !entry.has_expired(SAFETY_MARGIN_MS) {
            log_trace!(target, "attempt {} not expired, nothing to clean", self.attempt_id);
            return Ok(None);
        }
        forward_compat::check(ForwardCompatStage::CleanupEntry, entry.forward_compat())?;

        self.cleanup_docs(client, config, hooks, entry, target)?;
        hooks::fire(&hooks.on_cleanup_docs_completed, None).map_err(OperationFailed::from_client)?;
        self.cleanup_entry_record(client, config, hooks, entry, target)?;
        hooks::fire(&hooks.on_cleanup_completed, None).map_err(OperationFailed::from_client)?;
        Ok(Some(entry.state()))
    }

    /// Replay or revert every document the entry lists, by state
    fn cleanup_docs(
        &self,
        client: &dyn KvClient,
        config: &TransactionConfig,
        hooks: &CleanupTestingHooks,
        entry: &AtrEntry,
        target: LogTarget,
    ) -> OpResult<()> {
        match entry.state() {
            // Half-finished commit: drive it forward
            AttemptState::Committed => {
                self.commit_docs(client, config, hooks, entry.inserted_ids(), target)?;
                self.commit_docs(client, config, hooks, entry.replaced_ids(), target)?;
                self.remove_docs_staged_for_removal(client, config, hooks, entry.removed_ids(), target)?;
            }
            // Half-finished rollback: drive it back
            AttemptState::Aborted => {
                self.remove_docs(client, config, hooks, entry.inserted_ids(), target)?;
                self.remove_txn_links(client, config, hooks, entry.replaced_ids(), target)?;
                self.remove_txn_links(client, config, hooks, entry.removed_ids(), target)?;
            }
            state => {
                log_trace!(target, "attempt in {}, no documents to clean", state);
            }
        }
        Ok(())
    }

    /// Fetch each listed doc and hand it to `action` when it still
    /// carries this attempt's staged data (and, where demanded, the
    /// staging CRC still matches the document).
    fn do_per_doc(
        &self,
        client: &dyn KvClient,
        config: &TransactionConfig,
        docs: Option<&[DocRecord]>,
        require_crc_to_match: bool,
        target: LogTarget,
        action: &dyn Fn(&TransactionGetResult, bool) -> OpResult<()>,
    ) -> OpResult<()> {
        let Some(docs) = docs else {
            return Ok(());
        };
        for record in docs {
            let id = record.doc_id();
            let specs = transactional_lookup_specs();
            let opts = LookupInOptions {
                access_deleted: true,
                timeout: config.kv_timeout(),
            };
            let res = match client.lookup_in(&id, &specs, &opts) {
                Ok(res) => res,
                Err(err) => {
                    let err = ClientError::from_kv(err, OpKind::Read);
                    if err.class() == ErrorClass::DocNotFound {
                        log_trace!(target, "document {} not found, ignoring", id);
                        continue;
                    }
                    return Err(OperationFailed::from_client(err));
                }
            };
            let doc = TransactionGetResult::from_lookup(id.clone(), &res);

            if !(doc.links().has_staged_content() || doc.links().is_document_being_removed())
                || !doc.links().has_staged_write()
            {
                log_trace!(
                    target,
                    "document {} has no staged content, assuming it was committed and skipping",
                    id
                );
                continue;
            }
            if doc.links().staged_attempt_id() != Some(&self.attempt_id) {
                log_trace!(
                    target,
                    "document {} staged for attempt {:?}, not {}, skipping",
                    id,
                    doc.links().staged_attempt_id(),
                    self.attempt_id
                );
                continue;
            }
            if require_crc_to_match {
                let doc_crc = doc.metadata().and_then(|m| m.crc32.as_deref());
                let staged_crc = doc.links().crc32_of_staging();
                if doc_crc.is_none() || staged_crc.is_none() || doc_crc != staged_crc {
                    log_trace!(
                        target,
                        "document {} crc {:?} does not match staged {:?}, skipping",
                        id,
                        doc_crc,
                        staged_crc
                    );
                    continue;
                }
            }
            action(&doc, res.is_deleted())?;
        }
        Ok(())
    }

    /// Commit side: move staged content into the body (resurrecting
    /// tombstoned inserts with a plain insert)
    fn commit_docs(
        &self,
        client: &dyn KvClient,
        config: &TransactionConfig,
        hooks: &CleanupTestingHooks,
        docs: Option<&[DocRecord]>,
        target: LogTarget,
    ) -> OpResult<()> {
        self.do_per_doc(client, config, docs, true, target, &|doc, is_deleted| {
            let Some(content) = doc.links().staged_content().cloned() else {
                log_trace!(target, "commit skipping {}, no staged content", doc.id());
                return Ok(());
            };
            hooks::fire(&hooks.before_commit_doc, Some(doc.id().key()))
                .map_err(OperationFailed::from_client)?;
            if is_deleted {
                client
                    .insert(doc.id(), &content, config.durability_level(), config.kv_timeout())
                    .map_err(|e| {
                        OperationFailed::from_client(ClientError::from_kv(e, OpKind::Mutation))
                    })?;
            } else {
                let specs = [
                    MutateInSpec::remove(fields::TXN_PREFIX_ONLY).xattr(),
                    MutateInSpec::set_doc(content.clone()),
                ];
                let opts = MutateInOptions {
                    cas: doc.cas(),
                    durability: config.durability_level(),
                    store_semantics: StoreSemantics::Replace,
                    timeout: config.kv_timeout(),
                    ..Default::default()
                };
                client.mutate_in(doc.id(), &specs, &opts).map_err(|e| {
                    OperationFailed::from_client(ClientError::from_kv(e, OpKind::Mutation))
                })?;
            }
            log_trace!(target, "commit replaced content of doc {}", doc.id());
            Ok(())
        })
    }

    /// Commit side: finish staged removes
    fn remove_docs_staged_for_removal(
        &self,
        client: &dyn KvClient,
        config: &TransactionConfig,
        hooks: &CleanupTestingHooks,
        docs: Option<&[DocRecord]>,
        target: LogTarget,
    ) -> OpResult<()> {
        self.do_per_doc(client, config, docs, true, target, &|doc, _is_deleted| {
            if !doc.links().is_document_being_removed() {
                log_trace!(
                    target,
                    "document {} not marked for removal, skipping",
                    doc.id()
                );
                return Ok(());
            }
            hooks::fire(&hooks.before_remove_doc_staged_for_removal, Some(doc.id().key()))
                .map_err(OperationFailed::from_client)?;
            client
                .remove(doc.id(), doc.cas(), config.durability_level(), config.kv_timeout())
                .map_err(|e| {
                    OperationFailed::from_client(ClientError::from_kv(e, OpKind::Mutation))
                })?;
            log_trace!(target, "removed doc {} staged for removal", doc.id());
            Ok(())
        })
    }

    /// Abort side: erase staged inserts
    fn remove_docs(
        &self,
        client: &dyn KvClient,
        config: &TransactionConfig,
        hooks: &CleanupTestingHooks,
        docs: Option<&[DocRecord]>,
        target: LogTarget,
    ) -> OpResult<()> {
        self.do_per_doc(client, config, docs, true, target, &|doc, is_deleted| {
            hooks::fire(&hooks.before_remove_doc, Some(doc.id().key()))
                .map_err(OperationFailed::from_client)?;
            if is_deleted {
                let specs = [MutateInSpec::remove(fields::TXN_PREFIX_ONLY).xattr()];
                let opts = MutateInOptions {
                    cas: doc.cas(),
                    access_deleted: true,
                    durability: config.durability_level(),
                    timeout: config.kv_timeout(),
                    ..Default::default()
                };
                client.mutate_in(doc.id(), &specs, &opts).map_err(|e| {
                    OperationFailed::from_client(ClientError::from_kv(e, OpKind::Mutation))
                })?;
            } else {
                client
                    .remove(doc.id(), doc.cas(), config.durability_level(), config.kv_timeout())
                    .map_err(|e| {
                        OperationFailed::from_client(ClientError::from_kv(e, OpKind::Mutation))
                    })?;
            }
            log_trace!(target, "removed staged insert {}", doc.id());
            Ok(())
        })
    }

    /// Abort side: strip the txn block from replaces and removes
    fn remove_txn_links(
        &self,
        client: &dyn KvClient,
        config: &TransactionConfig,
        hooks: &CleanupTestingHooks,
        docs: Option<&[DocRecord]>,
        target: LogTarget,
    ) -> OpResult<()> {
        self.do_per_doc(client, config, docs, false, target, &|doc, _is_deleted| {
            hooks::fire(&hooks.before_remove_links, Some(doc.id().key()))
                .map_err(OperationFailed::from_client)?;
            let specs = [MutateInSpec::remove(fields::TXN_PREFIX_ONLY).xattr()];
            let opts = MutateInOptions {
                cas: doc.cas(),
                access_deleted: true,
                durability: config.durability_level(),
                timeout: config.kv_timeout(),
                ..Default::default()
            };
            client.mutate_in(doc.id(), &specs, &opts).map_err(|e| {
                OperationFailed::from_client(ClientError::from_kv(e, OpKind::Mutation))
            })?;
            log_trace!(target, "removed txn links of doc {}", doc.id());
            Ok(())
        })
    }

    /// Remove the entry from the ATR. A PENDING entry gets a collision
    /// marker first: if the owner progressed concurrently, the insert of
    /// the marker makes the owner's next write fail, and our remove fails
    /// with PathNotFound, which is treated as "owner won".
    fn cleanup_entry_record(
        &self,
        client: &dyn KvClient,
        config: &TransactionConfig,
        hooks: &CleanupTestingHooks,
        entry: &AtrEntry,
        target: LogTarget,
    ) -> OpResult<()> {
        hooks::fire(&hooks.before_atr_remove, Some(self.atr_id.key()))
            .map_err(OperationFailed::from_client)?;
        let mut specs = Vec::new();
        if entry.state() == AttemptState::Pending {
            specs.push(
                MutateInSpec::insert(
                    format!(
                        "{}.{}.{}",
                        fields::ATR_FIELD_ATTEMPTS,
                        self.attempt_id,
                        fields::ATR_FIELD_PENDING_SENTINEL
                    ),
                    Value::Object(serde_json::Map::new()),
                )
                .xattr()
                .create_path(),
            );
        }
        specs.push(
            MutateInSpec::remove(format!("{}.{}", fields::ATR_FIELD_ATTEMPTS, self.attempt_id))
                .xattr(),
        );
        let opts = MutateInOptions {
            durability: config.durability_level(),
            timeout: config.kv_timeout(),
            ..Default::default()
        };
        match client.mutate_in(&self.atr_id, &specs, &opts) {
            Ok(_) => {
                log_trace!(target, "removed attempt {} from atr", self.attempt_id);
                Ok(())
            }
            Err(err) => {
                let err = ClientError::from_kv(err, OpKind::Mutation);
                match err.class() {
                    ErrorClass::PathNotFound => {
                        log_debug!(
                            target,
                            "attempt {} progressed concurrently, leaving entry to its owner",
                            self.attempt_id
                        );
                        Ok(())
                    }
                    _ => Err(OperationFailed::from_client(err)),
                }
            }
        }
    }
}
