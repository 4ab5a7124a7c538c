// cleanup/lost.rs
//! Lost-attempts cleanup: cross-client repair of abandoned transactions
//!
//! Every participating process registers in a per-bucket client record
//! and heartbeats once per cleanup window. The sorted set of live client
//! uuids partitions the fixed ATR table: client i of N sweeps ATRs
//! i, i+N, i+2N, ... Each sweep is paced so one pass spreads over the
//! whole window instead of hammering the cluster.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use serde_json::Value;

use crate::atr_ids;
use crate::cleanup::entry::AtrCleanupEntry;
use crate::config::TransactionConfig;
use crate::document::DocId;
use crate::error::{ClientError, ErrorClass, OpKind, OpResult, OperationFailed};
use crate::fields;
use crate::hooks;
use crate::kv::{
    KvClient, LookupInOptions, LookupInSpec, MutateInOptions, MutateInSpec, MutateMacro,
    StoreSemantics,
};
use crate::logging::LogTarget;
use crate::util::{
    hlc_now_ms, parse_mutation_cas, retry_op_exponential_backoff_timeout, BackoffTimeoutError,
    RetryOrError,
};
use crate::{log_debug, log_error, log_info, log_trace};

const TARGET: LogTarget = LogTarget::LostCleanup;

/// Pad added to the heartbeat expiry so a slow-but-alive client is not
/// evicted by a peer
const CLIENT_RECORD_SAFETY_MARGIN_MS: u64 = 2000;
/// At most this many expired peers are evicted per heartbeat write
const MAX_EXPIRED_CLIENTS_PER_UPDATE: usize = 12;

/// Parsed view of the client record, relative to this client
#[derive(Debug, Clone)]
pub struct ClientRecordDetails {
    pub num_active_clients: usize,
    pub index_of_this_client: usize,
    pub expired_client_ids: Vec<String>,
    pub override_enabled: bool,
    pub override_expires_ms: u64,
    pub override_active: bool,
    pub now_ms: u64,
}

/// What one ATR sweep found (testing/introspection)
#[derive(Debug, Clone, Default)]
pub struct AtrCleanupStats {
    pub exists: bool,
    pub num_entries: usize,
    pub cleaned: usize,
}

/// Per-process lost-attempts worker state
pub struct LostAttemptsCleanup {
    client: Arc<dyn KvClient>,
    config: Arc<TransactionConfig>,
    client_uuid: String,
}

impl LostAttemptsCleanup {
    pub fn new(client: Arc<dyn KvClient>, config: Arc<TransactionConfig>, client_uuid: String) -> Self {
        LostAttemptsCleanup {
            client,
            config,
            client_uuid,
        }
    }

    pub fn client_uuid(&self) -> &str {
        &self.client_uuid
    }

    fn client_record_id(&self, bucket: &str) -> DocId {
        self.config
            .metadata_doc_id(bucket, fields::CLIENT_RECORD_DOC_ID)
    }

    /// Create the per-bucket client record if it does not exist yet.
    /// Loses gracefully against concurrent creators.
    pub fn create_client_record(&self, bucket: &str) -> OpResult<()> {
        hooks::fire(&self.config.cleanup_hooks().client_record_before_create, Some(bucket))
            .map_err(OperationFailed::from_client)?;
        let id = self.client_record_id(bucket);
        let specs = [
            MutateInSpec::insert(fields::FIELD_CLIENTS, Value::Object(serde_json::Map::new()))
                .xattr()
                .create_path(),
            MutateInSpec::set_doc(Value::Null),
        ];
        let opts = MutateInOptions {
            store_semantics: StoreSemantics::Insert,
            durability: self.config.durability_level(),
            timeout: self.config.kv_timeout(),
            ..Default::default()
        };
        match self.client.mutate_in(&id, &specs, &opts) {
            Ok(_) => Ok(()),
            Err(err) => {
                let err = ClientError::from_kv(err, OpKind::Mutation);
                if err.class() == ErrorClass::DocAlreadyExists {
                    log_trace!(TARGET, "client record in {} already exists, moving on", bucket);
                    Ok(())
                } else {
                    Err(OperationFailed::from_client(err))
                }
            }
        }
    }

    /// Heartbeat this client into the record, evict expired peers, and
    /// return the partition-relevant view of who is active
    pub fn get_active_clients(&self, bucket: &str) -> OpResult<ClientRecordDetails> {
        let window = self.config.cleanup_window();
        let min_retry = Duration::from_secs(1).min(window);
        let result = retry_op_exponential_backoff_timeout(min_retry, Duration::from_secs(1), window, || {
            match self.process_client_record(bucket) {
                Ok(details) => Ok(details),
                Err(RecordError::Missing) => {
                    log_debug!(TARGET, "client record in {} not found, creating", bucket);
                    self.create_client_record(bucket)?;
                    Err(RetryOrError::Retry(
                        "client record created, retrying".to_string(),
                    ))
                }
                Err(RecordError::Failed(err)) => Err(RetryOrError::Err(err)),
            }
        });
        match result {
            Ok(details) => Ok(details),
            Err(BackoffTimeoutError::TimedOut) => Err(OperationFailed::new(
                ErrorClass::Other,
                "timed out processing the client record",
            )),
            Err(BackoffTimeoutError::Inner(err)) => Err(err),
        }
    }

    fn process_client_record(&self, bucket: &str) -> Result<ClientRecordDetails, RecordError> {
        hooks::fire(&self.config.cleanup_hooks().client_record_before_get, Some(bucket))
            .map_err(|e| RecordError::Failed(OperationFailed::from_client(e)))?;
        let id = self.client_record_id(bucket);
        let specs = [
            LookupInSpec::get(fields::FIELD_RECORDS).xattr(),
            LookupInSpec::get(fields::VATTR_VBUCKET).xattr(),
        ];
        let opts = LookupInOptions {
            access_deleted: false,
            timeout: self.config.kv_timeout(),
        };
        let res = match self.client.lookup_in(&id, &specs, &opts) {
            Ok(res) => res,
            Err(crate::kv::KvError::DocumentNotFound) => return Err(RecordError::Missing),
            Err(err) => {
                return Err(RecordError::Failed(OperationFailed::from_client(
                    ClientError::from_kv(err, OpKind::Read),
                )))
            }
        };
        let now_ms = res.value(1).and_then(hlc_now_ms).unwrap_or(0);

        let mut active_client_uids: Vec<String> = Vec::new();
        let mut expired_client_ids: Vec<String> = Vec::new();
        let mut override_enabled = false;
        let mut override_expires_ms = 0u64;

        if let Some(records) = res.value(0) {
            if let Some(overrides) = records.get(fields::FIELD_OVERRIDE) {
                override_enabled = overrides
                    .get(fields::FIELD_OVERRIDE_ENABLED)
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                override_expires_ms = overrides
                    .get(fields::FIELD_OVERRIDE_EXPIRES)
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
            }
            if let Some(clients) = records.get("clients").and_then(|v| v.as_object()) {
                for (uuid, record) in clients {
                    let heartbeat_ms = record
                        .get(fields::FIELD_HEARTBEAT)
                        .and_then(|v| v.as_str())
                        .map(parse_mutation_cas)
                        .unwrap_or(0);
                    let expires_ms = record
                        .get(fields::FIELD_EXPIRES)
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    let expired_period = now_ms.saturating_sub(heartbeat_ms);
                    let has_expired = expired_period >= expires_ms && now_ms > heartbeat_ms;
                    if has_expired && uuid != &self.client_uuid {
                        expired_client_ids.push(uuid.clone());
                    } else {
                        active_client_uids.push(uuid.clone());
                    }
                }
            }
        }
        if !active_client_uids.contains(&self.client_uuid) {
            active_client_uids.push(self.client_uuid.clone());
        }
        active_client_uids.sort();
        let index_of_this_client = active_client_uids
            .iter()
            .position(|uuid| uuid == &self.client_uuid)
            .unwrap_or(0);

        let details = ClientRecordDetails {
            num_active_clients: active_client_uids.len(),
            index_of_this_client,
            expired_client_ids,
            override_enabled,
            override_expires_ms,
            override_active: override_enabled && override_expires_ms > now_ms,
            now_ms,
        };
        log_trace!(TARGET, "client record details: {:?}", details);

        if details.override_active {
            log_debug!(TARGET, "override enabled, not updating client record");
            return Ok(details);
        }

        hooks::fire(&self.config.cleanup_hooks().client_record_before_update, Some(bucket))
            .map_err(|e| RecordError::Failed(OperationFailed::from_client(e)))?;

        let prefix = format!("{}.{}", fields::FIELD_CLIENTS, self.client_uuid);
        let mut specs = vec![
            MutateInSpec::upsert(format!("{}.{}", prefix, fields::FIELD_HEARTBEAT), Value::Null)
                .xattr()
                .create_path()
                .expand(MutateMacro::Cas),
            MutateInSpec::upsert(
                format!("{}.{}", prefix, fields::FIELD_EXPIRES),
                Value::from(
                    (self.config.cleanup_window().as_millis() as u64) / 2
                        + CLIENT_RECORD_SAFETY_MARGIN_MS,
                ),
            )
            .xattr()
            .create_path(),
            MutateInSpec::upsert(
                format!("{}.{}", prefix, fields::FIELD_NUM_ATRS),
                Value::from(atr_ids::NUM_ATRS as u64),
            )
            .xattr()
            .create_path(),
        ];
        for expired in details
            .expired_client_ids
            .iter()
            .take(MAX_EXPIRED_CLIENTS_PER_UPDATE)
        {
            log_trace!(TARGET, "evicting expired cleanup client {}", expired);
            specs.push(
                MutateInSpec::remove(format!("{}.{}", fields::FIELD_CLIENTS, expired)).xattr(),
            );
        }
        let opts = MutateInOptions {
            durability: self.config.durability_level(),
            timeout: self.config.kv_timeout(),
            ..Default::default()
        };
        self.client
            .mutate_in(&id, &specs, &opts)
            .map_err(|err| {
                RecordError::Failed(OperationFailed::from_client(ClientError::from_kv(
                    err,
                    OpKind::Mutation,
                )))
            })?;
        log_debug!(
            TARGET,
            "updated client record in {}: {} active, {} expired",
            bucket,
            details.num_active_clients,
            details.expired_client_ids.len()
        );
        Ok(details)
    }

    /// Deregister this client everywhere (shutdown path)
    pub fn remove_client_record_from_all_buckets(&self) {
        for bucket in self.client.bucket_names() {
            let result = retry_op_exponential_backoff_timeout(
                Duration::from_millis(10),
                Duration::from_millis(250),
                Duration::from_millis(500),
                || {
                    self.create_client_record(&bucket)?;
                    hooks::fire(
                        &self.config.cleanup_hooks().client_record_before_remove_client,
                        Some(&bucket),
                    )
                    .map_err(OperationFailed::from_client)?;
                    let id = self.client_record_id(&bucket);
                    let specs = [MutateInSpec::remove(format!(
                        "{}.{}",
                        fields::FIELD_CLIENTS,
                        self.client_uuid
                    ))
                    .xattr()];
                    let opts = MutateInOptions {
                        durability: self.config.durability_level(),
                        timeout: self.config.kv_timeout(),
                        ..Default::default()
                    };
                    match self.client.mutate_in(&id, &specs, &opts) {
                        Ok(_) => Ok(()),
                        Err(err) => {
                            let err = ClientError::from_kv(err, OpKind::Mutation);
                            match err.class() {
                                ErrorClass::DocNotFound | ErrorClass::PathNotFound => Ok(()),
                                _ => Err(RetryOrError::Retry(err.message().to_string())),
                            }
                        }
                    }
                },
            );
            match result {
                Ok(()) => log_debug!(TARGET, "removed client {} from {}", self.client_uuid, bucket),
                Err(_) => log_error!(
                    TARGET,
                    "could not remove client record {} from bucket {}",
                    self.client_uuid,
                    bucket
                ),
            }
        }
    }

    /// One paced sweep over this client's share of the ATR table.
    /// `shutdown` interrupts both the sweep and its pacing sleeps.
    pub fn clean_lost_attempts_in_bucket(
        &self,
        bucket: &str,
        shutdown: &Receiver<()>,
    ) -> OpResult<()> {
        log_info!(TARGET, "lost-attempts cleanup of {} starting", bucket);
        let details = self.get_active_clients(bucket)?;
        if details.override_active {
            log_info!(TARGET, "cleanup of {} suspended by override", bucket);
            return Ok(());
        }

        let all_atrs = atr_ids::all();
        let window = self.config.cleanup_window();
        let start = Instant::now();
        log_info!(
            TARGET,
            "{} active clients, sweeping {} of {} atrs in {:?}",
            details.num_active_clients,
            all_atrs.len() / details.num_active_clients.max(1),
            all_atrs.len(),
            window
        );

        let step = details.num_active_clients.max(1);
        let mut index = details.index_of_this_client;
        while index < all_atrs.len() {
            let atrs_left = (all_atrs.len() - index + step - 1) / step;
            let remaining = window.saturating_sub(start.elapsed());
            let budget = remaining / atrs_left.max(1) as u32;

            let atr_start = Instant::now();
            let atr_doc_id = self.config.metadata_doc_id(bucket, &all_atrs[index]);
            if let Err(err) = self.handle_atr_cleanup(&atr_doc_id, true) {
                log_error!(
                    TARGET,
                    "cleanup of atr {} failed: {}, moving on",
                    atr_doc_id,
                    err
                );
            }

            let spent = atr_start.elapsed();
            if budget > spent {
                match shutdown.recv_timeout(budget - spent) {
                    Ok(_) | Err(RecvTimeoutError::Disconnected) => {
                        log_debug!(TARGET, "cleanup of {} interrupted by shutdown", bucket);
                        return Ok(());
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
            index += step;
        }
        log_info!(
            TARGET,
            "cleanup of {} complete in {:?}",
            bucket,
            start.elapsed()
        );
        Ok(())
    }

    /// Inspect one ATR and clean whatever qualifies. `check_expiry`
    /// false forces cleanup of non-expired entries (testing).
    pub fn handle_atr_cleanup(
        &self,
        atr_doc_id: &DocId,
        check_expiry: bool,
    ) -> OpResult<AtrCleanupStats> {
        let mut stats = AtrCleanupStats::default();
        let atr = crate::atr::ActiveTransactionRecord::get_atr(
            &*self.client,
            atr_doc_id,
            self.config.kv_timeout(),
        )
        .map_err(OperationFailed::from_client)?;
        let Some(atr) = atr else {
            return Ok(stats);
        };
        stats.exists = true;
        stats.num_entries = atr.entries().len();
        for entry in atr.entries() {
            let cleanup_entry = AtrCleanupEntry::new(
                atr_doc_id.clone(),
                entry.attempt_id().to_string(),
                check_expiry,
                Instant::now(),
            );
            match cleanup_entry.clean(&*self.client, &self.config, TARGET) {
                Ok(Some(_)) => stats.cleaned += 1,
                Ok(None) => {}
                Err(err) => {
                    log_error!(
                        TARGET,
                        "cleanup of {}/{} failed: {}, moving on",
                        atr_doc_id,
                        entry.attempt_id(),
                        err
                    );
                }
            }
        }
        Ok(stats)
    }
}

enum RecordError {
    /// The client record document does not exist yet
    Missing,
    Failed(OperationFailed),
}

impl From<OperationFailed> for RecordError {
    fn from(err: OperationFailed) -> Self {
        RecordError::Failed(err)
    }
}
