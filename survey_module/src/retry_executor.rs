use std::fmt::Display;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0 for the first retry).
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry.min(31)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Succeeded { attempts: u32 },
    Abandoned { attempts: u32, last_error: String },
}

/// Handle to a submitted attempt chain. Dropping it detaches the chain.
#[derive(Debug)]
pub struct RetryHandle {
    label: String,
    handle: thread::JoinHandle<RetryOutcome>,
}

impl RetryHandle {
    pub fn join(self) -> RetryOutcome {
        self.handle
            .join()
            .unwrap_or_else(|_| RetryOutcome::Abandoned {
                attempts: 0,
                last_error: format!("{} worker panicked", self.label),
            })
    }
}

/// Runs fallible work on a background thread with exponential backoff.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// `work` receives the 1-based attempt number. Failures are logged and
    /// retried; the caller never sees them.
    pub fn submit<F, E>(&self, label: impl Into<String>, mut work: F) -> RetryHandle
    where
        F: FnMut(u32) -> Result<(), E> + Send + 'static,
        E: Display,
    {
        let policy = self.policy;
        let label = label.into();
        let thread_label = label.clone();
        let max_attempts = policy.max_attempts.max(1);
        let handle = thread::spawn(move || {
            let mut attempt = 1u32;
            loop {
                match work(attempt) {
                    Ok(()) => {
                        if attempt > 1 {
                            info!("{} succeeded on attempt {}", thread_label, attempt);
                        }
                        return RetryOutcome::Succeeded { attempts: attempt };
                    }
                    Err(err) => {
                        let message = err.to_string();
                        if attempt >= max_attempts {
                            error!(
                                "{} abandoned after {} attempt(s): {}",
                                thread_label, attempt, message
                            );
                            return RetryOutcome::Abandoned {
                                attempts: attempt,
                                last_error: message,
                            };
                        }
                        let delay = policy.delay_before_retry(attempt - 1);
                        warn!(
                            "{} failed on attempt {}/{}: {}; retrying in {:?}",
                            thread_label, attempt, max_attempts, message, delay
                        );
                        thread::sleep(delay);
                        attempt += 1;
                    }
                }
            }
        });
        RetryHandle { label, handle }
    }
}
