// atr.rs
//! Typed view of an Active Transaction Record document
//!
//! An ATR maps attempt-id to entry, all of it held in xattrs under
//! `attempts`. Reading one is a single lookup of `attempts` plus the
//! `$vbucket` virtual xattr, whose HLC reading serves as the server-side
//! time source for expiry decisions. Timestamps inside entries were
//! written by the `${Mutation.CAS}` macro and arrive as little-endian hex
//! strings; see [`crate::util::parse_mutation_cas`].

use std::time::Duration;

use serde_json::Value;

use crate::document::DocId;
use crate::attempt_state::AttemptState;
use crate::error::{ClientError, OpKind};
use crate::fields;
use crate::kv::{KvClient, KvError, LookupInOptions, LookupInSpec};
use crate::logging::LogTarget;
use crate::util::{hlc_now_ms, parse_mutation_cas};
use crate::log_warn;

/// Wait this long past an entry's expiry before cleanup may touch it, so
/// an owner that is still finalizing is not raced.
pub const SAFETY_MARGIN_MS: u64 = 1500;

/// One document reference inside an entry's ins/rep/rem list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocRecord {
    bucket: String,
    scope: String,
    collection: String,
    key: String,
    /// CAS observed when the doc was staged, as recorded at commit/abort
    cas: Option<String>,
}

impl DocRecord {
    pub fn new(id: &DocId, cas: Option<String>) -> Self {
        DocRecord {
            bucket: id.bucket().to_string(),
            scope: id.scope().to_string(),
            collection: id.collection().to_string(),
            key: id.key().to_string(),
            cas,
        }
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        Some(DocRecord {
            bucket: value.get(fields::ATR_FIELD_PER_DOC_BUCKET)?.as_str()?.to_string(),
            scope: value.get(fields::ATR_FIELD_PER_DOC_SCOPE)?.as_str()?.to_string(),
            collection: value
                .get(fields::ATR_FIELD_PER_DOC_COLLECTION)?
                .as_str()?
                .to_string(),
            key: value.get(fields::ATR_FIELD_PER_DOC_ID)?.as_str()?.to_string(),
            cas: value
                .get(fields::ATR_FIELD_PER_DOC_CAS)
                .and_then(|v| v.as_str())
                .map(String::from),
        })
    }

    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert(
            fields::ATR_FIELD_PER_DOC_ID.to_string(),
            Value::String(self.key.clone()),
        );
        map.insert(
            fields::ATR_FIELD_PER_DOC_BUCKET.to_string(),
            Value::String(self.bucket.clone()),
        );
        map.insert(
            fields::ATR_FIELD_PER_DOC_SCOPE.to_string(),
            Value::String(self.scope.clone()),
        );
        map.insert(
            fields::ATR_FIELD_PER_DOC_COLLECTION.to_string(),
            Value::String(self.collection.clone()),
        );
        if let Some(cas) = &self.cas {
            map.insert(
                fields::ATR_FIELD_PER_DOC_CAS.to_string(),
                Value::String(cas.clone()),
            );
        }
        Value::Object(map)
    }

    pub fn doc_id(&self) -> DocId {
        DocId::new(&self.bucket, &self.scope, &self.collection, &self.key)
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// One attempt's entry in an ATR
#[derive(Debug, Clone)]
pub struct AtrEntry {
    atr_bucket: String,
    atr_id: String,
    attempt_id: String,
    transaction_id: Option<String>,
    state: AttemptState,
    timestamp_start_ms: Option<u64>,
    timestamp_commit_ms: Option<u64>,
    timestamp_complete_ms: Option<u64>,
    timestamp_rollback_ms: Option<u64>,
    timestamp_rolled_back_ms: Option<u64>,
    expires_after_ms: Option<u64>,
    inserted_ids: Option<Vec<DocRecord>>,
    replaced_ids: Option<Vec<DocRecord>>,
    removed_ids: Option<Vec<DocRecord>>,
    forward_compat: Option<Value>,
    /// Server time (from the $vbucket HLC) when the record was read
    server_now_ms: u64,
}

fn parse_doc_records(entry: &Value, key: &str) -> Option<Vec<DocRecord>> {
    let array = entry.get(key)?.as_array()?;
    Some(array.iter().filter_map(DocRecord::from_value).collect())
}

fn parse_ts(entry: &Value, key: &str) -> Option<u64> {
    entry
        .get(key)
        .and_then(|v| v.as_str())
        .map(parse_mutation_cas)
        .filter(|ms| *ms > 0)
}

impl AtrEntry {
    fn from_value(
        atr_bucket: &str,
        atr_id: &str,
        attempt_id: &str,
        entry: &Value,
        server_now_ms: u64,
    ) -> Option<Self> {
        let state_str = entry.get(fields::ATR_FIELD_STATUS)?.as_str()?;
        let state = match AttemptState::parse(state_str) {
            Some(state) => state,
            None => {
                log_warn!(
                    LogTarget::Txn,
                    "atr {} attempt {} has unknown state {:?}, skipping entry",
                    atr_id,
                    attempt_id,
                    state_str
                );
                return None;
            }
        };
        Some(AtrEntry {
            atr_bucket: atr_bucket.to_string(),
            atr_id: atr_id.to_string(),
            attempt_id: attempt_id.to_string(),
            transaction_id: entry
                .get("id")
                .and_then(|id| id.get("txn"))
                .and_then(|v| v.as_str())
                .map(String::from),
            state,
            timestamp_start_ms: parse_ts(entry, fields::ATR_FIELD_START_TIMESTAMP),
            timestamp_commit_ms: parse_ts(entry, fields::ATR_FIELD_START_COMMIT),
            timestamp_complete_ms: parse_ts(entry, fields::ATR_FIELD_TIMESTAMP_COMPLETE),
            timestamp_rollback_ms: parse_ts(entry, fields::ATR_FIELD_TIMESTAMP_ROLLBACK_START),
            timestamp_rolled_back_ms: parse_ts(entry, fields::ATR_FIELD_TIMESTAMP_ROLLBACK_COMPLETE),
            expires_after_ms: entry
                .get(fields::ATR_FIELD_EXPIRES_AFTER_MSECS)
                .and_then(|v| v.as_u64()),
            inserted_ids: parse_doc_records(entry, fields::ATR_FIELD_DOCS_INSERTED),
            replaced_ids: parse_doc_records(entry, fields::ATR_FIELD_DOCS_REPLACED),
            removed_ids: parse_doc_records(entry, fields::ATR_FIELD_DOCS_REMOVED),
            forward_compat: entry.get(fields::ATR_FIELD_FORWARD_COMPAT).cloned(),
            server_now_ms,
        })
    }

    pub fn atr_bucket(&self) -> &str {
        &self.atr_bucket
    }

    pub fn atr_id(&self) -> &str {
        &self.atr_id
    }

    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn timestamp_start_ms(&self) -> Option<u64> {
        self.timestamp_start_ms
    }

    pub fn expires_after_ms(&self) -> Option<u64> {
        self.expires_after_ms
    }

    pub fn inserted_ids(&self) -> Option<&[DocRecord]> {
        self.inserted_ids.as_deref()
    }

    pub fn replaced_ids(&self) -> Option<&[DocRecord]> {
        self.replaced_ids.as_deref()
    }

    pub fn removed_ids(&self) -> Option<&[DocRecord]> {
        self.removed_ids.as_deref()
    }

    pub fn forward_compat(&self) -> Option<&Value> {
        self.forward_compat.as_ref()
    }

    /// Entry age per the server clock at read time
    pub fn age_ms(&self) -> u64 {
        self.server_now_ms
            .saturating_sub(self.timestamp_start_ms.unwrap_or(0))
    }

    /// An entry has expired iff server_now - tst exceeds its budget plus
    /// the safety margin
    pub fn has_expired(&self, safety_margin_ms: u64) -> bool {
        match (self.timestamp_start_ms, self.expires_after_ms) {
            (Some(start), Some(budget)) if self.server_now_ms > start => {
                (self.server_now_ms - start) > (budget + safety_margin_ms)
            }
            _ => false,
        }
    }
}

/// The parsed ATR document
#[derive(Debug, Clone)]
pub struct ActiveTransactionRecord {
    id: DocId,
    cas: u64,
    entries: Vec<AtrEntry>,
}

impl ActiveTransactionRecord {
    /// Read and parse an ATR. A missing document is Ok(None) - an absent
    /// ATR simply means nothing was ever staged against it (or cleanup
    /// finished).
    pub fn get_atr(
        client: &dyn KvClient,
        atr_id: &DocId,
        timeout: Option<Duration>,
    ) -> Result<Option<ActiveTransactionRecord>, ClientError> {
        let specs = [
            LookupInSpec::get(fields::ATR_FIELD_ATTEMPTS).xattr(),
            LookupInSpec::get(fields::VATTR_VBUCKET).xattr(),
        ];
        let opts = LookupInOptions {
            access_deleted: false,
            timeout,
        };
        let res = match client.lookup_in(atr_id, &specs, &opts) {
            Ok(res) => res,
            Err(KvError::DocumentNotFound) => return Ok(None),
            Err(err) => return Err(ClientError::from_kv(err, OpKind::Read)),
        };

        let server_now_ms = res.value(1).and_then(hlc_now_ms).unwrap_or(0);
        let mut entries = Vec::new();
        if let Some(attempts) = res.value(0).and_then(|v| v.as_object()) {
            entries.reserve(attempts.len());
            for (attempt_id, entry) in attempts {
                if let Some(parsed) = AtrEntry::from_value(
                    atr_id.bucket(),
                    atr_id.key(),
                    attempt_id,
                    entry,
                    server_now_ms,
                ) {
                    entries.push(parsed);
                }
            }
        }
        Ok(Some(ActiveTransactionRecord {
            id: atr_id.clone(),
            cas: res.cas(),
            entries,
        }))
    }

    pub fn id(&self) -> &DocId {
        &self.id
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn entries(&self) -> &[AtrEntry] {
        &self.entries
    }

    pub fn find_entry(&self, attempt_id: &str) -> Option<&AtrEntry> {
        self.entries.iter().find(|e| e.attempt_id() == attempt_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::mutation_cas_macro;
    use serde_json::json;

    fn entry_value(state: &str, start_ms: u64, exp_ms: u64) -> Value {
        json!({
            "st": state,
            "tst": mutation_cas_macro(start_ms * 1_000_000),
            "exp": exp_ms,
            "id": {"txn": "txn-1"},
            "ins": [{"id": "k1", "bkt": "b", "scp": "s", "col": "c"}],
        })
    }

    #[test]
    fn test_entry_parsing() {
        let value = entry_value("PENDING", 1_000_000, 15_000);
        let entry = AtrEntry::from_value("b", "atr-1-#a", "attempt-1", &value, 1_005_000).unwrap();
        assert_eq!(entry.state(), AttemptState::Pending);
        assert_eq!(entry.timestamp_start_ms(), Some(1_000_000));
        assert_eq!(entry.expires_after_ms(), Some(15_000));
        assert_eq!(entry.transaction_id(), Some("txn-1"));
        let ins = entry.inserted_ids().unwrap();
        assert_eq!(ins.len(), 1);
        assert_eq!(ins[0].doc_id(), DocId::new("b", "s", "c", "k1"));
    }

    #[test]
    fn test_unknown_state_skipped() {
        let value = json!({"st": "???", "exp": 10});
        assert!(AtrEntry::from_value("b", "atr", "a1", &value, 0).is_none());
    }

    #[test]
    fn test_has_expired_with_margin() {
        // started at t=1_000_000ms with a 100ms budget
        let value = entry_value("PENDING", 1_000_000, 100);

        // within budget + margin
        let entry =
            AtrEntry::from_value("b", "atr", "a1", &value, 1_000_000 + 100 + SAFETY_MARGIN_MS)
                .unwrap();
        assert!(!entry.has_expired(SAFETY_MARGIN_MS));

        // past budget + margin
        let entry =
            AtrEntry::from_value("b", "atr", "a1", &value, 1_000_000 + 100 + SAFETY_MARGIN_MS + 1)
                .unwrap();
        assert!(entry.has_expired(SAFETY_MARGIN_MS));
    }

    #[test]
    fn test_doc_record_round_trip() {
        let record = DocRecord::new(&DocId::new("b", "s", "c", "k"), Some("0xdead".into()));
        let parsed = DocRecord::from_value(&record.to_value()).unwrap();
        assert_eq!(parsed, record);
    }
}
