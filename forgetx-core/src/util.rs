// util.rs
//! Retry combinators, jitter, and the timestamp codecs shared by the
//! engine and the cleanup subsystem.

use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::{ErrorClass, OpResult, OperationFailed};

/// `${Mutation.CAS}` is written by the server as a hex string of the CAS
/// in byte-swapped (little-endian) order; a quirk kept for compatibility
/// with existing consumers. The CAS itself is an HLC reading in
/// nanoseconds, so dividing the decoded value by 10^6 yields epoch
/// milliseconds.
///
/// Looks like: "0x000058a71dd25c15"
/// Decodes to:  0x155CD21DA7580000 ns, i.e. an epoch time in ms after
/// division.
pub fn parse_mutation_cas(cas: &str) -> u64 {
    if cas.is_empty() {
        return 0;
    }
    let hex = cas.strip_prefix("0x").unwrap_or(cas);
    match u64::from_str_radix(hex, 16) {
        Ok(raw) => raw.swap_bytes() / 1_000_000,
        Err(_) => 0,
    }
}

/// Render a CAS the way the server's `${Mutation.CAS}` macro does
pub fn mutation_cas_macro(cas: u64) -> String {
    format!("0x{:016x}", cas.swap_bytes())
}

/// Parse the server time from a `$vbucket` virtual xattr lookup. The HLC
/// "now" field is epoch seconds as a decimal string.
pub fn hlc_now_ms(vbucket: &Value) -> Option<u64> {
    vbucket
        .get("HLC")
        .and_then(|h| h.get("now"))
        .and_then(|n| n.as_str())
        .and_then(|s| s.parse::<u64>().ok())
        .map(|secs| secs * 1000)
}

/// Epoch milliseconds from the local clock
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Epoch nanoseconds from the local clock
pub fn now_ns() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .map(|ns| ns as u64)
        .unwrap_or_else(|| now_ms() * 1_000_000)
}

/// CRC32 of a byte slice, rendered the way `$document.value_crc32c` is
pub fn crc32_hex(bytes: &[u8]) -> String {
    format!("0x{:08x}", crc32fast::hash(bytes))
}

// means +/- 10% for jitter
const RETRY_OP_JITTER: f64 = 0.1;

/// Multiplier in [1 - jitter, 1 + jitter], from a thread-local xorshift
/// seeded off the clock. Good enough to de-synchronize retry storms.
pub fn jitter() -> f64 {
    use std::cell::Cell;
    thread_local! {
        static SEED: Cell<u64> = const { Cell::new(0) };
    }
    SEED.with(|seed| {
        let mut x = seed.get();
        if x == 0 {
            x = now_ns() | 1;
        }
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        seed.set(x);
        let unit = (x >> 11) as f64 / (1u64 << 53) as f64;
        1.0 - RETRY_OP_JITTER + 2.0 * RETRY_OP_JITTER * unit
    })
}

pub const DEFAULT_RETRY_OP_DELAY: Duration = Duration::from_millis(3);
pub const DEFAULT_RETRY_OP_EXP_DELAY: Duration = Duration::from_millis(1);
pub const DEFAULT_RETRY_OP_MAX_RETRIES: usize = 100;
pub const DEFAULT_RETRY_OP_EXPONENT_CAP: u32 = 8;

/// Backoff delay for the given retry ordinal: base * 2^min(retries, cap),
/// jittered. 2^7 = 128, so with the default cap the delay tops out at
/// 128 * base.
pub fn backoff_delay(base: Duration, retries: u32, cap_exponent: u32) -> Duration {
    let factor = 2u64.pow(retries.min(cap_exponent));
    base.mul_f64(jitter() * factor as f64)
}

/// Outcome a retried closure hands back to a combinator: either a request
/// to go around again, or a definitive failure. `?` on any `OpResult`
/// inside the closure converts into `Err` via the From impl.
#[derive(Debug)]
pub enum RetryOrError {
    /// Run the closure again after the combinator's delay
    Retry(String),
    /// Stop; propagate this failure
    Err(OperationFailed),
}

impl From<OperationFailed> for RetryOrError {
    fn from(err: OperationFailed) -> Self {
        RetryOrError::Err(err)
    }
}

pub type RetryableResult<T> = std::result::Result<T, RetryOrError>;

/// Retry with a constant delay. `max_retries` of None retries until the
/// closure stops asking.
pub fn retry_op_constant_delay<T>(
    delay: Duration,
    max_retries: Option<usize>,
    mut func: impl FnMut() -> RetryableResult<T>,
) -> OpResult<T> {
    let mut retries = 0usize;
    loop {
        match func() {
            Ok(value) => return Ok(value),
            Err(RetryOrError::Err(err)) => return Err(err),
            Err(RetryOrError::Retry(_reason)) => {
                if let Some(max) = max_retries {
                    if retries >= max {
                        return Err(OperationFailed::new(
                            ErrorClass::Other,
                            "retry limit exhausted",
                        ));
                    }
                }
                retries += 1;
                std::thread::sleep(delay);
            }
        }
    }
}

/// Retry with exponential backoff, the exponent capped so the delay never
/// exceeds 2^cap * base
pub fn retry_op_exponential_backoff<T>(
    base: Duration,
    max_retries: usize,
    mut func: impl FnMut() -> RetryableResult<T>,
) -> OpResult<T> {
    for retries in 0..=max_retries {
        match func() {
            Ok(value) => return Ok(value),
            Err(RetryOrError::Err(err)) => return Err(err),
            Err(RetryOrError::Retry(_reason)) => {
                std::thread::sleep(backoff_delay(
                    base,
                    retries as u32,
                    DEFAULT_RETRY_OP_EXPONENT_CAP,
                ));
            }
        }
    }
    Err(OperationFailed::new(
        ErrorClass::Other,
        "retry limit exhausted",
    ))
}

/// Protocol-local retry: exponential backoff from 1 ms, up to 100 rounds
pub fn retry_op_exp<T>(func: impl FnMut() -> RetryableResult<T>) -> OpResult<T> {
    retry_op_exponential_backoff(DEFAULT_RETRY_OP_EXP_DELAY, DEFAULT_RETRY_OP_MAX_RETRIES, func)
}

/// Constant-delay retry without a round limit (the closure must converge)
pub fn retry_op<T>(func: impl FnMut() -> RetryableResult<T>) -> OpResult<T> {
    retry_op_constant_delay(DEFAULT_RETRY_OP_DELAY, None, func)
}

/// How a bounded-time backoff loop ended when it did not produce a value
#[derive(Debug)]
pub enum BackoffTimeoutError {
    /// The total budget ran out while the closure still asked for retries
    TimedOut,
    /// The closure failed definitively
    Inner(OperationFailed),
}

/// Retry with exponential backoff inside a total wall-clock budget.
/// Delays start at `initial_delay`, double per round up to `max_delay`,
/// and never sleep past the deadline.
pub fn retry_op_exponential_backoff_timeout<T>(
    initial_delay: Duration,
    max_delay: Duration,
    timeout: Duration,
    mut func: impl FnMut() -> RetryableResult<T>,
) -> std::result::Result<T, BackoffTimeoutError> {
    let end_time = Instant::now() + timeout;
    let mut retries = 0u32;
    loop {
        match func() {
            Ok(value) => return Ok(value),
            Err(RetryOrError::Err(err)) => return Err(BackoffTimeoutError::Inner(err)),
            Err(RetryOrError::Retry(_reason)) => {
                let now = Instant::now();
                if now > end_time {
                    return Err(BackoffTimeoutError::TimedOut);
                }
                let mut delay = initial_delay.mul_f64(jitter() * 2f64.powi(retries as i32));
                retries += 1;
                if delay > max_delay {
                    delay = max_delay;
                }
                if now + delay > end_time {
                    std::thread::sleep(end_time - now);
                } else {
                    std::thread::sleep(delay);
                }
            }
        }
    }
}
