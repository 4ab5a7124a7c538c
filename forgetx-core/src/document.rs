// document.rs
//! Document identity and the transactional view of a fetched document

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fields;
use crate::kv::{LookupInResult, LookupInSpec};

/// Fully-qualified document identifier. Two identifiers are equal iff all
/// four components match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocId {
    bucket: String,
    scope: String,
    collection: String,
    key: String,
}

impl DocId {
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        DocId {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
            key: key.into(),
        }
    }

    /// Identifier in the default scope/collection of a bucket
    pub fn in_default_collection(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        DocId::new(bucket, "_default", "_default", key)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// "scope.collection", the form stored in back-pointer xattrs
    pub fn collection_spec(&self) -> String {
        format!("{}.{}", self.scope, self.collection)
    }

    /// Same bucket/scope/collection, different key
    pub fn with_key(&self, key: impl Into<String>) -> Self {
        DocId::new(&self.bucket, &self.scope, &self.collection, key)
    }
}

impl std::fmt::Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.bucket, self.scope, self.collection, self.key
        )
    }
}

/// Pre-transaction metadata captured from the `$document` virtual xattr
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentMetadata {
    pub cas: Option<String>,
    pub revid: Option<String>,
    pub exptime: Option<u64>,
    pub crc32: Option<String>,
}

impl DocumentMetadata {
    fn from_vattr(value: &Value) -> Self {
        DocumentMetadata {
            cas: value.get("CAS").and_then(|v| v.as_str()).map(String::from),
            revid: value
                .get("revid")
                .and_then(|v| v.as_str())
                .map(String::from),
            exptime: value.get("exptime").and_then(|v| v.as_u64()),
            crc32: value
                .get("value_crc32c")
                .and_then(|v| v.as_str())
                .map(String::from),
        }
    }
}

/// The parsed `txn` xattr block of a document: who staged what, and where
/// the owning ATR entry lives.
#[derive(Debug, Clone, Default)]
pub struct TransactionLinks {
    atr_id: Option<String>,
    atr_bucket_name: Option<String>,
    /// "scope.collection" of the ATR document
    atr_collection_spec: Option<String>,
    staged_transaction_id: Option<String>,
    staged_attempt_id: Option<String>,
    staged_content: Option<Value>,
    cas_pre_txn: Option<String>,
    revid_pre_txn: Option<String>,
    exptime_pre_txn: Option<u64>,
    crc32_of_staging: Option<String>,
    op: Option<String>,
    forward_compat: Option<Value>,
    /// Tombstone state of the underlying document at fetch time
    is_deleted: bool,
}

impl TransactionLinks {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        atr_id: Option<String>,
        atr_bucket_name: Option<String>,
        atr_collection_spec: Option<String>,
        staged_transaction_id: Option<String>,
        staged_attempt_id: Option<String>,
        staged_content: Option<Value>,
        cas_pre_txn: Option<String>,
        revid_pre_txn: Option<String>,
        exptime_pre_txn: Option<u64>,
        crc32_of_staging: Option<String>,
        op: Option<String>,
        forward_compat: Option<Value>,
        is_deleted: bool,
    ) -> Self {
        TransactionLinks {
            atr_id,
            atr_bucket_name,
            atr_collection_spec,
            staged_transaction_id,
            staged_attempt_id,
            staged_content,
            cas_pre_txn,
            revid_pre_txn,
            exptime_pre_txn,
            crc32_of_staging,
            op,
            forward_compat,
            is_deleted,
        }
    }

    pub fn atr_id(&self) -> Option<&str> {
        self.atr_id.as_deref()
    }

    pub fn atr_bucket_name(&self) -> Option<&str> {
        self.atr_bucket_name.as_deref()
    }

    pub fn atr_collection_spec(&self) -> Option<&str> {
        self.atr_collection_spec.as_deref()
    }

    pub fn atr_scope_name(&self) -> Option<&str> {
        self.atr_collection_spec
            .as_deref()
            .and_then(|spec| spec.split_once('.').map(|(scope, _)| scope))
    }

    pub fn atr_collection_name(&self) -> Option<&str> {
        self.atr_collection_spec
            .as_deref()
            .and_then(|spec| spec.split_once('.').map(|(_, coll)| coll))
    }

    pub fn staged_transaction_id(&self) -> Option<&str> {
        self.staged_transaction_id.as_deref()
    }

    pub fn staged_attempt_id(&self) -> Option<&str> {
        self.staged_attempt_id.as_deref()
    }

    pub fn cas_pre_txn(&self) -> Option<&str> {
        self.cas_pre_txn.as_deref()
    }

    pub fn revid_pre_txn(&self) -> Option<&str> {
        self.revid_pre_txn.as_deref()
    }

    pub fn exptime_pre_txn(&self) -> Option<u64> {
        self.exptime_pre_txn
    }

    pub fn crc32_of_staging(&self) -> Option<&str> {
        self.crc32_of_staging.as_deref()
    }

    pub fn op(&self) -> Option<&str> {
        self.op.as_deref()
    }

    pub fn forward_compat(&self) -> Option<&Value> {
        self.forward_compat.as_ref()
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    /// The doc carries another (or our own) attempt's staged write
    pub fn has_staged_write(&self) -> bool {
        self.staged_attempt_id.is_some()
    }

    /// The doc carries enough back-pointer information to find its ATR
    pub fn is_document_in_transaction(&self) -> bool {
        self.atr_id.is_some() && self.staged_attempt_id.is_some()
    }

    /// The staged operation is a remove
    pub fn is_document_being_removed(&self) -> bool {
        self.op.as_deref() == Some(fields::OP_TYPE_REMOVE)
            || matches!(&self.staged_content,
                        Some(Value::String(s)) if s == fields::STAGED_DATA_REMOVED_VALUE)
    }

    /// Staged content usable as a document body (not the remove sentinel)
    pub fn staged_content(&self) -> Option<&Value> {
        match &self.staged_content {
            Some(Value::String(s)) if s == fields::STAGED_DATA_REMOVED_VALUE => None,
            other => other.as_ref(),
        }
    }

    pub fn has_staged_content(&self) -> bool {
        self.staged_content().is_some()
    }
}

/// A document as seen inside a transaction: body, CAS, the parsed `txn`
/// xattr block, and the pre-transaction metadata. This is what get()
/// returns and what replace()/remove() consume.
#[derive(Debug, Clone)]
pub struct TransactionGetResult {
    id: DocId,
    content: Value,
    cas: u64,
    links: TransactionLinks,
    metadata: Option<DocumentMetadata>,
}

// Index of each path in `transactional_lookup_specs`, shared between the
// attempt context and cleanup so both parse results identically.
const IDX_ATR_ID: usize = 0;
const IDX_TXN_ID: usize = 1;
const IDX_ATTEMPT_ID: usize = 2;
const IDX_STAGED: usize = 3;
const IDX_ATR_BUCKET: usize = 4;
const IDX_ATR_COLL: usize = 5;
const IDX_RESTORE: usize = 6;
const IDX_OP_TYPE: usize = 7;
const IDX_DOCUMENT: usize = 8;
const IDX_CRC32: usize = 9;
const IDX_FORWARD_COMPAT: usize = 10;
const IDX_BODY: usize = 11;

/// The lookup issued for every transactional read: the whole `txn` block
/// field by field, the `$document` virtual xattr, and the body.
pub fn transactional_lookup_specs() -> Vec<LookupInSpec> {
    vec![
        LookupInSpec::get(fields::TXN_ATR_ID).xattr(),
        LookupInSpec::get(fields::TXN_ID).xattr(),
        LookupInSpec::get(fields::TXN_ATTEMPT_ID).xattr(),
        LookupInSpec::get(fields::TXN_STAGED_DATA).xattr(),
        LookupInSpec::get(fields::TXN_ATR_BUCKET_NAME).xattr(),
        LookupInSpec::get(fields::TXN_ATR_COLL_NAME).xattr(),
        LookupInSpec::get(fields::TXN_RESTORE_PREFIX_ONLY).xattr(),
        LookupInSpec::get(fields::TXN_OP_TYPE).xattr(),
        LookupInSpec::get(fields::VATTR_DOCUMENT).xattr(),
        LookupInSpec::get(fields::TXN_CRC32_OF_STAGING).xattr(),
        LookupInSpec::get(fields::TXN_FORWARD_COMPAT).xattr(),
        LookupInSpec::full_document(),
    ]
}

fn field_str(res: &LookupInResult, idx: usize) -> Option<String> {
    res.value(idx)
        .and_then(|v| v.as_str())
        .map(String::from)
}

impl TransactionGetResult {
    pub fn new(
        id: DocId,
        content: Value,
        cas: u64,
        links: TransactionLinks,
        metadata: Option<DocumentMetadata>,
    ) -> Self {
        TransactionGetResult {
            id,
            content,
            cas,
            links,
            metadata,
        }
    }

    /// Build from the result of a `transactional_lookup_specs` lookup
    pub fn from_lookup(id: DocId, res: &LookupInResult) -> Self {
        let restore = res.value(IDX_RESTORE);
        let metadata = res.value(IDX_DOCUMENT).map(DocumentMetadata::from_vattr);
        let links = TransactionLinks::new(
            field_str(res, IDX_ATR_ID),
            field_str(res, IDX_ATR_BUCKET),
            field_str(res, IDX_ATR_COLL),
            field_str(res, IDX_TXN_ID),
            field_str(res, IDX_ATTEMPT_ID),
            res.value(IDX_STAGED).cloned(),
            restore
                .and_then(|r| r.get("CAS"))
                .and_then(|v| v.as_str())
                .map(String::from),
            restore
                .and_then(|r| r.get("revid"))
                .and_then(|v| v.as_str())
                .map(String::from),
            restore.and_then(|r| r.get("exptime")).and_then(|v| v.as_u64()),
            field_str(res, IDX_CRC32),
            field_str(res, IDX_OP_TYPE),
            res.value(IDX_FORWARD_COMPAT).cloned(),
            res.is_deleted(),
        );
        let content = res.value(IDX_BODY).cloned().unwrap_or(Value::Null);
        TransactionGetResult::new(id, content, res.cas(), links, metadata)
    }

    /// Own-write view: staged content presented as the document body
    pub fn own_write(id: DocId, content: Value, cas: u64, links: TransactionLinks) -> Self {
        TransactionGetResult::new(id, content, cas, links, None)
    }

    pub fn id(&self) -> &DocId {
        &self.id
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    pub fn content_as<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.content.clone())
    }

    pub fn set_content(&mut self, content: Value) {
        self.content = content;
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn set_cas(&mut self, cas: u64) {
        self.cas = cas;
    }

    pub fn links(&self) -> &TransactionLinks {
        &self.links
    }

    pub fn metadata(&self) -> Option<&DocumentMetadata> {
        self.metadata.as_ref()
    }
}
