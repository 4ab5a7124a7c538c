// transaction_context.rs
//! Transaction-level state shared across the attempts of one
//! `Transactions::run` invocation

use std::time::Instant;

use parking_lot::Mutex;

use crate::attempt_state::AttemptState;
use crate::config::TransactionConfig;
use crate::uid;

/// Summary of one attempt, kept on the transaction for the final result
#[derive(Debug, Clone)]
pub struct TransactionAttempt {
    pub attempt_id: String,
    pub state: AttemptState,
    pub atr_id: Option<String>,
}

/// What a finished (or failed) transaction reports back
#[derive(Debug, Clone)]
pub struct TransactionResult {
    pub transaction_id: String,
    /// ATR chosen by the final attempt, if any mutation happened
    pub atr_id: Option<String>,
    /// "scope.collection" where that ATR lives
    pub atr_collection: Option<String>,
    pub attempts: Vec<TransactionAttempt>,
    /// True iff the final attempt reached COMPLETED; false means commit
    /// is durable but cleanup will finish unstaging
    pub unstaging_complete: bool,
}

/// State owned by the driver for the duration of one run. Attempts borrow
/// it; summaries accumulate here.
pub struct TransactionContext {
    transaction_id: String,
    start_time: Instant,
    attempts: Mutex<Vec<TransactionAttempt>>,
    atr_id: Mutex<Option<String>>,
    atr_collection: Mutex<Option<String>>,
}

impl TransactionContext {
    pub fn new() -> Self {
        TransactionContext {
            transaction_id: uid::next_id(),
            start_time: Instant::now(),
            attempts: Mutex::new(Vec::new()),
            atr_id: Mutex::new(None),
            atr_collection: Mutex::new(None),
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn num_attempts(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn add_attempt(&self, attempt: TransactionAttempt) {
        self.attempts.lock().push(attempt);
    }

    /// Record the ATR chosen by the current attempt
    pub fn set_atr(&self, atr_id: String, collection_spec: String) {
        *self.atr_id.lock() = Some(atr_id);
        *self.atr_collection.lock() = Some(collection_spec);
    }

    pub fn atr_id(&self) -> Option<String> {
        self.atr_id.lock().clone()
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// The only deadline in the engine: the local clock against the
    /// configured expiration budget
    pub fn has_expired_client_side(&self, config: &TransactionConfig) -> bool {
        self.elapsed() > config.expiration_time()
    }

    /// Small pause used when a protocol-internal write is retried in
    /// place (one percent of the budget)
    pub fn retry_delay(&self, config: &TransactionConfig) {
        std::thread::sleep(config.expiration_time() / 100);
    }

    pub fn transaction_result(&self) -> TransactionResult {
        let attempts = self.attempts.lock().clone();
        let unstaging_complete = attempts
            .last()
            .map(|a| a.state == AttemptState::Completed)
            .unwrap_or(false);
        TransactionResult {
            transaction_id: self.transaction_id.clone(),
            atr_id: self.atr_id.lock().clone(),
            atr_collection: self.atr_collection.lock().clone(),
            attempts,
            unstaging_complete,
        }
    }
}

impl Default for TransactionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_expiry_against_budget() {
        let overall = TransactionContext::new();
        let config = TransactionConfig::new().set_expiration_time(Duration::from_millis(20));
        assert!(!overall.has_expired_client_side(&config));
        std::thread::sleep(Duration::from_millis(25));
        assert!(overall.has_expired_client_side(&config));
    }

    #[test]
    fn test_result_reflects_final_attempt() {
        let overall = TransactionContext::new();
        overall.add_attempt(TransactionAttempt {
            attempt_id: "a1".into(),
            state: AttemptState::RolledBack,
            atr_id: None,
        });
        overall.add_attempt(TransactionAttempt {
            attempt_id: "a2".into(),
            state: AttemptState::Completed,
            atr_id: Some("atr-1-#b".into()),
        });
        overall.set_atr("atr-1-#b".into(), "_default._default".into());

        let result = overall.transaction_result();
        assert_eq!(result.attempts.len(), 2);
        assert!(result.unstaging_complete);
        assert_eq!(result.atr_id.as_deref(), Some("atr-1-#b"));
    }

    #[test]
    fn test_result_without_completion() {
        let overall = TransactionContext::new();
        overall.add_attempt(TransactionAttempt {
            attempt_id: "a1".into(),
            state: AttemptState::Committed,
            atr_id: None,
        });
        assert!(!overall.transaction_result().unstaging_complete);
    }
}
