// staged_mutation.rs
//! The in-attempt log of pending mutations
//!
//! Append-only per attempt with upsert-by-doc-id semantics: a later
//! operation on the same document replaces its earlier entry, but a
//! replace over a staged insert stays an insert (the document still does
//! not exist outside this attempt). Remove-after-insert never reaches the
//! log; the attempt context rejects it.
//!
//! The queue is guarded so cleanup may snapshot it from another thread
//! while the attempt's own task is mutating it.

use parking_lot::Mutex;
use serde_json::Value;

use crate::atr::DocRecord;
use crate::attempt_context::AttemptContext;
use crate::document::{DocId, TransactionGetResult};
use crate::error::OpResult;
use crate::fields;
use crate::kv::MutateInSpec;

/// Kind of a staged mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedMutationType {
    Insert,
    Remove,
    Replace,
}

/// One pending mutation: the doc as last staged (CAS included) plus the
/// post-transaction content
#[derive(Debug, Clone)]
pub struct StagedMutation {
    doc: TransactionGetResult,
    content: Value,
    mutation_type: StagedMutationType,
}

impl StagedMutation {
    pub fn new(doc: TransactionGetResult, content: Value, mutation_type: StagedMutationType) -> Self {
        StagedMutation {
            doc,
            content,
            mutation_type,
        }
    }

    pub fn doc(&self) -> &TransactionGetResult {
        &self.doc
    }

    pub fn id(&self) -> &DocId {
        self.doc.id()
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    pub fn mutation_type(&self) -> StagedMutationType {
        self.mutation_type
    }
}

/// Ordered log of an attempt's staged mutations
#[derive(Default)]
pub struct StagedMutationQueue {
    queue: Mutex<Vec<StagedMutation>>,
}

impl StagedMutationQueue {
    pub fn new() -> Self {
        StagedMutationQueue {
            queue: Mutex::new(Vec::new()),
        }
    }

    pub fn empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.empty()
    }

    /// Append or coalesce. INSERT then REPLACE stays INSERT with the new
    /// content and CAS; any other sequence replaces the prior entry
    /// wholesale.
    pub fn add(&self, mutation: StagedMutation) {
        let mut queue = self.queue.lock();
        match queue.iter_mut().find(|item| item.id() == mutation.id()) {
            Some(existing) => {
                let keep_insert = existing.mutation_type == StagedMutationType::Insert
                    && mutation.mutation_type == StagedMutationType::Replace;
                let new_type = if keep_insert {
                    StagedMutationType::Insert
                } else {
                    mutation.mutation_type
                };
                *existing = StagedMutation {
                    doc: mutation.doc,
                    content: mutation.content,
                    mutation_type: new_type,
                };
            }
            None => queue.push(mutation),
        }
    }

    fn find(&self, mutation_type: StagedMutationType, id: &DocId) -> Option<StagedMutation> {
        self.queue
            .lock()
            .iter()
            .find(|item| item.mutation_type == mutation_type && item.id() == id)
            .cloned()
    }

    pub fn find_insert(&self, id: &DocId) -> Option<StagedMutation> {
        self.find(StagedMutationType::Insert, id)
    }

    pub fn find_replace(&self, id: &DocId) -> Option<StagedMutation> {
        self.find(StagedMutationType::Replace, id)
    }

    pub fn find_remove(&self, id: &DocId) -> Option<StagedMutation> {
        self.find(StagedMutationType::Remove, id)
    }

    /// Owned copy for iteration outside the lock (unstaging, cleanup)
    pub fn snapshot(&self) -> Vec<StagedMutation> {
        self.queue.lock().clone()
    }

    /// Serialize the three doc lists into an ATR entry write. Used by both
    /// the commit and the abort mutation so cleanup always has the full
    /// doc set.
    pub fn extract_to(&self, prefix: &str, specs: &mut Vec<MutateInSpec>) {
        let queue = self.queue.lock();
        let mut inserts = Vec::new();
        let mut replaces = Vec::new();
        let mut removes = Vec::new();

        for mutation in queue.iter() {
            let record =
                DocRecord::new(mutation.id(), Some(mutation.doc.cas().to_string())).to_value();
            match mutation.mutation_type {
                StagedMutationType::Insert => inserts.push(record),
                StagedMutationType::Remove => removes.push(record),
                StagedMutationType::Replace => replaces.push(record),
            }
        }
        specs.push(
            MutateInSpec::upsert(
                format!("{}{}", prefix, fields::ATR_FIELD_DOCS_INSERTED),
                Value::Array(inserts),
            )
            .xattr()
            .create_path(),
        );
        specs.push(
            MutateInSpec::upsert(
                format!("{}{}", prefix, fields::ATR_FIELD_DOCS_REPLACED),
                Value::Array(replaces),
            )
            .xattr()
            .create_path(),
        );
        specs.push(
            MutateInSpec::upsert(
                format!("{}{}", prefix, fields::ATR_FIELD_DOCS_REMOVED),
                Value::Array(removes),
            )
            .xattr()
            .create_path(),
        );
    }

    /// Unstage every entry, in staging order. Removes delete the
    /// document; inserts and replaces move the staged content into the
    /// body and clear the txn block. Each per-document step is
    /// independently retried and idempotent.
    pub fn commit(&self, ctx: &AttemptContext<'_>) -> OpResult<()> {
        for mutation in self.snapshot() {
            match mutation.mutation_type() {
                StagedMutationType::Remove => ctx.remove_doc(&mutation)?,
                StagedMutationType::Insert | StagedMutationType::Replace => {
                    ctx.commit_doc(&mutation)?
                }
            }
        }
        Ok(())
    }

    /// Revert every entry: inserts lose their tombstone, replaces and
    /// removes just lose the txn block (the body was never touched
    /// pre-commit).
    pub fn rollback(&self, ctx: &AttemptContext<'_>) -> OpResult<()> {
        for mutation in self.snapshot() {
            match mutation.mutation_type() {
                StagedMutationType::Insert => ctx.rollback_staged_insert(&mutation)?,
                StagedMutationType::Replace | StagedMutationType::Remove => {
                    ctx.rollback_doc(&mutation)?
                }
            }
        }
        Ok(())
    }
}
