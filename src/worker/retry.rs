use rand::Rng;
use std::time::Duration;

use crate::generate::GenerateError;

const RETRYABLE_STATUS_CODES: &[u16] = &[429, 502, 503, 504, 408];

const RETRYABLE_KEYWORDS: &[&str] = &[
    "timeout",
    "deadline exceeded",
    "connection refused",
    "connection reset",
    "temporary failure",
    "rate limit",
    "too many requests",
];

const NON_RETRYABLE_KEYWORDS: &[&str] = &[
    "invalid",
    "bad request",
    "unauthorized",
    "forbidden",
    "not found",
    "insufficient",
    "quota exceeded",
    "balance",
];

/// Structured signals first (deadline, transport timeout, status code);
/// free-form message matching is the fallback, not the primary channel.
pub fn is_retryable(err: &GenerateError) -> bool {
    match err {
        GenerateError::Timeout => return true,
        GenerateError::Transport(e) => {
            if e.is_timeout() || e.is_connect() {
                return true;
            }
        }
        GenerateError::Status { code, .. } => {
            if RETRYABLE_STATUS_CODES.contains(code) {
                return true;
            }
        }
        // Selection and validation failures never resolve on their own.
        GenerateError::Channel(_) | GenerateError::Invalid(_) => return false,
        _ => {}
    }
    is_retryable_message(&err.to_string())
}

/// Plain case-insensitive substring matching over provider text.
pub fn is_retryable_message(message: &str) -> bool {
    let message = message.to_lowercase();

    for code in RETRYABLE_STATUS_CODES {
        if message.contains(&format!("status {}", code)) {
            return true;
        }
    }
    if RETRYABLE_KEYWORDS.iter().any(|k| message.contains(k)) {
        return true;
    }
    if NON_RETRYABLE_KEYWORDS.iter().any(|k| message.contains(k)) {
        return false;
    }
    // Ambiguous errors don't retry.
    false
}

/// Base delay for the attempt that just failed (1-based), with ±20%
/// uniform jitter.
pub fn retry_delay(attempt: u32) -> Duration {
    let base = match attempt {
        0 | 1 => Duration::from_secs(10),
        2 => Duration::from_secs(30),
        _ => Duration::from_secs(120),
    };
    base.mul_f64(rand::thread_rng().gen_range(0.8..=1.2))
}
