// transactions.rs
//! The transaction driver
//!
//! Wraps the user callable in the retry loop: each iteration runs one
//! attempt (fresh attempt context, user logic, auto-commit), every
//! outcome is offered to the in-process cleanup queue, and failures
//! flagged retryable go around again with exponential backoff until the
//! attempt budget or the transaction budget runs out.

use std::sync::Arc;
use std::time::Duration;

use crate::attempt_context::AttemptContext;
use crate::cleanup::TransactionsCleanup;
use crate::config::TransactionConfig;
use crate::error::{CauseKind, ErrorClass, OperationFailed, TransactionError};
use crate::kv::KvClient;
use crate::logging::LogTarget;
use crate::transaction_context::{TransactionAttempt, TransactionContext, TransactionResult};
use crate::util::backoff_delay;
use crate::{log_debug, log_error, log_info};

/// Delay before the first retry; doubles per retry up to 2^7 * this
const MIN_RETRY_DELAY: Duration = Duration::from_millis(10);
const BACKOFF_EXPONENT_CAP: u32 = 7;
/// Upper bound on driver iterations per transaction
const MAX_ATTEMPTS: usize = 10;

/// Entry point for running transactions against a cluster. Owns the
/// background cleanup subsystem; create once and share.
pub struct Transactions {
    client: Arc<dyn KvClient>,
    config: Arc<TransactionConfig>,
    cleanup: Arc<TransactionsCleanup>,
}

impl Transactions {
    pub fn new(client: Arc<dyn KvClient>, config: TransactionConfig) -> Self {
        let config = Arc::new(config);
        let cleanup = TransactionsCleanup::start(client.clone(), config.clone());
        log_info!(LogTarget::Txn, "creating new transactions object");
        Transactions {
            client,
            config,
            cleanup,
        }
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn cleanup(&self) -> &Arc<TransactionsCleanup> {
        &self.cleanup
    }

    /// Run `logic` as one transaction. The callable may be invoked
    /// several times (once per attempt); it must tolerate re-execution.
    /// Committing is implicit when the callable returns without having
    /// called commit or rollback itself.
    pub fn run<F>(&self, logic: F) -> Result<TransactionResult, TransactionError>
    where
        F: Fn(&AttemptContext<'_>) -> anyhow::Result<()>,
    {
        let overall = TransactionContext::new();

        for attempt_index in 0..MAX_ATTEMPTS {
            let ctx = AttemptContext::new(&*self.client, &self.config, &overall);
            log_info!(
                LogTarget::Txn,
                "starting attempt {}/{}/{}",
                overall.num_attempts(),
                overall.transaction_id(),
                ctx.id()
            );

            let attempt_result = self.run_attempt(&logic, &ctx);

            match attempt_result {
                Ok(()) => {
                    self.finish_attempt(&overall, &ctx);
                    return Ok(overall.transaction_result());
                }
                Err(mut err) => {
                    log_error!(
                        LogTarget::Txn,
                        "attempt {} failed: {} (retry={}, rollback={})",
                        ctx.id(),
                        err,
                        err.should_retry(),
                        err.should_rollback()
                    );
                    if err.should_rollback() && !ctx.is_done() {
                        log_debug!(LogTarget::Txn, "rolling back failed attempt");
                        if let Err(rollback_err) = ctx.rollback_internal() {
                            // The original error wins; the rollback error
                            // is only logged
                            log_debug!(
                                LogTarget::Txn,
                                "error {} during auto-rollback, keeping original error",
                                rollback_err
                            );
                        } else if err.should_retry()
                            && overall.has_expired_client_side(&self.config)
                        {
                            log_debug!(
                                LogTarget::Txn,
                                "auto-rollback succeeded but the transaction has expired, not retrying"
                            );
                            err = OperationFailed::new(
                                ErrorClass::Expiry,
                                "transaction expired during auto-rollback",
                            )
                            .no_rollback()
                            .expired();
                        }
                    }
                    self.finish_attempt(&overall, &ctx);

                    if err.should_retry() && attempt_index + 1 < MAX_ATTEMPTS {
                        let delay =
                            backoff_delay(MIN_RETRY_DELAY, attempt_index as u32, BACKOFF_EXPONENT_CAP);
                        log_debug!(
                            LogTarget::Txn,
                            "retryable error, sleeping {:?} before next attempt",
                            delay
                        );
                        std::thread::sleep(delay);
                        continue;
                    }

                    let result = overall.transaction_result();
                    return match err.into_terminal(result) {
                        // Post-commit failure: the commit is durable, so
                        // the caller gets a successful result; cleanup
                        // finishes the unstaging
                        None => Ok(overall.transaction_result()),
                        Some(terminal) => Err(terminal),
                    };
                }
            }
        }

        // Attempt budget exhausted without a terminal error
        Err(TransactionError::Failed {
            message: format!("transaction failed after {} attempts", MAX_ATTEMPTS),
            cause: CauseKind::Unknown,
            result: overall.transaction_result(),
        })
    }

    fn run_attempt<F>(&self, logic: &F, ctx: &AttemptContext<'_>) -> Result<(), OperationFailed>
    where
        F: Fn(&AttemptContext<'_>) -> anyhow::Result<()>,
    {
        match logic(ctx) {
            Ok(()) => {
                if ctx.rolled_back_by_caller() {
                    // An explicit rollback ends the transaction as failed
                    // even when the callable then returned cleanly
                    return Err(OperationFailed::new(
                        ErrorClass::Other,
                        "transaction was rolled back by the application",
                    )
                    .no_rollback());
                }
                if !ctx.is_done() {
                    ctx.commit()?;
                }
                Ok(())
            }
            Err(user_err) => match user_err.downcast::<OperationFailed>() {
                Ok(op_failed) => Err(op_failed),
                Err(other) => {
                    // An error raised by the user callable itself: roll
                    // back, report a plain failure
                    log_error!(LogTarget::Txn, "user callable failed: {:#}", other);
                    Err(OperationFailed::new(ErrorClass::Other, format!("{:#}", other))
                        .cause(CauseKind::Unknown))
                }
            },
        }
    }

    /// Record the attempt summary and offer it to in-process cleanup
    fn finish_attempt(&self, overall: &TransactionContext, ctx: &AttemptContext<'_>) {
        overall.add_attempt(TransactionAttempt {
            attempt_id: ctx.id().to_string(),
            state: ctx.state(),
            atr_id: ctx.atr_id().map(|id| id.key().to_string()),
        });
        self.cleanup.add_attempt(ctx);
    }

    /// Stop the background cleanup workers, draining the in-process
    /// queue with a bounded wait
    pub fn close(&self) {
        log_info!(LogTarget::Txn, "closing transactions");
        self.cleanup.close();
        log_info!(LogTarget::Txn, "transactions closed");
    }
}

impl Drop for Transactions {
    fn drop(&mut self) {
        self.close();
    }
}
