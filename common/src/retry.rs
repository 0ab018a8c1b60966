use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::transport::is_success;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOutcome {
    pub succeeded: bool,
    pub attempts: u32,
    pub last_status: i32,
}

/// Runs `op` (given the 1-based attempt number) until it returns 200 or the
/// policy's attempts are spent. Exhaustion is reported, not raised.
pub fn retry_until_ok<F>(policy: RetryPolicy, label: &str, mut op: F) -> RetryOutcome
where
    F: FnMut(u32) -> i32,
{
    let max_attempts = policy.max_attempts.max(1);

    let mut attempts = 1;
    info!("attempting {label}...");
    let mut status = op(attempts);

    while !is_success(status) && attempts < max_attempts {
        attempts += 1;
        info!("re-attempting {label} (try #{attempts} of {max_attempts} max tries)");
        status = op(attempts);
    }

    let succeeded = is_success(status);
    if !succeeded {
        warn!("{label} failed after {attempts} attempts (last status {status})");
    }

    RetryOutcome {
        succeeded,
        attempts,
        last_status: status,
    }
}
