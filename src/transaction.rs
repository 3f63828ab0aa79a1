//! Retry wrapper around a [`Session`] (component K, `SPEC_FULL.md` §4.K).
//!
//! A [`Transaction`] runs a closure against a fresh session incarnation,
//! restarting and retrying on transient failures (the RPC channel dying
//! under it, the sandboxee crashing) up to a configured attempt budget.
//! Policy violations and explicit cancellation are never retried — both
//! represent a deliberate outcome, not a flaky one.

use crate::error::{CapsuleError, CapsuleResult};
use crate::monitor::Violation;
use crate::session::Session;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Why a [`Transaction::run`] stopped without producing a value.
#[derive(Debug)]
pub enum TransactionError {
    /// `cancel()` was called before or during an attempt.
    Cancelled,
    /// The sandboxee hit a policy violation; retrying would only hit it
    /// again deterministically for the same input.
    Violation(Violation),
    /// Every attempt was exhausted; carries the last attempt's error.
    Exhausted(CapsuleError),
}

impl std::fmt::Display for TransactionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionError::Cancelled => write!(f, "transaction cancelled"),
            TransactionError::Violation(v) => {
                write!(f, "policy violation on syscall {} ({})", v.syscall_name, v.syscall_nr)
            }
            TransactionError::Exhausted(e) => write!(f, "transaction exhausted retries: {}", e),
        }
    }
}

impl std::error::Error for TransactionError {}

/// An error that is fatal for the whole transaction (no more attempts will
/// help) vs one that's worth retrying under a fresh session incarnation.
fn is_retryable(err: &CapsuleError) -> bool {
    matches!(err, CapsuleError::Unavailable(_) | CapsuleError::Syscall(_))
}

/// Drives repeated attempts of a closure against a [`Session`], each under
/// its own incarnation and wall-clock deadline (`SPEC_FULL.md` §4.K).
pub struct Transaction {
    session: Session,
    max_attempts: u32,
    per_attempt_timeout: Duration,
    cancelled: AtomicBool,
    attempts_made: u32,
}

impl Transaction {
    pub fn new(session: Session, max_attempts: u32, per_attempt_timeout: Duration) -> Self {
        Self {
            session,
            max_attempts: max_attempts.max(1),
            per_attempt_timeout,
            cancelled: AtomicBool::new(false),
            attempts_made: 0,
        }
    }

    /// Requests the in-flight (or next) attempt stop retrying. Takes effect
    /// at the top of the next attempt loop iteration; does not interrupt an
    /// attempt already in progress.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    /// Runs `body` against a live session, retrying on transient failures.
    /// `body` receives the active session and produces `T` or a
    /// [`CapsuleError`]; the first incarnation is brought up with `init`,
    /// subsequent ones with `restart` so `RemoteAddr`s from a failed attempt
    /// are invalidated rather than silently reused.
    pub fn run<F, T>(&mut self, body: F) -> Result<T, TransactionError>
    where
        F: Fn(&Session) -> CapsuleResult<T>,
    {
        let mut last_err: Option<CapsuleError> = None;

        for attempt in 0..self.max_attempts {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(TransactionError::Cancelled);
            }

            self.attempts_made = attempt + 1;

            let bring_up = if attempt == 0 {
                self.session.init()
            } else {
                self.session.restart(false)
            };
            if let Err(e) = bring_up {
                last_err = Some(e);
                continue;
            }

            self.session.set_wall_time_limit(self.per_attempt_timeout);

            match body(&self.session) {
                Ok(value) => {
                    let _ = self.session.terminate(true);
                    return Ok(value);
                }
                Err(e) => {
                    let retryable = is_retryable(&e);
                    match self.session.terminate(false) {
                        Ok(result) => {
                            if let Some(violation) = result.last_violation {
                                return Err(TransactionError::Violation(violation));
                            }
                        }
                        Err(term_err) => {
                            tracing::warn!(error = %term_err, "failed to terminate session after a failed attempt");
                        }
                    }
                    last_err = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        Err(TransactionError::Exhausted(
            last_err.unwrap_or_else(|| CapsuleError::Internal("transaction produced no attempts".to_string())),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_short_circuits_before_any_attempt() {
        use crate::comms::Channel;
        use crate::forkserver::{ForkServerClient, NamespaceFlags, SpawnRequest, UidGidMap};
        use std::collections::HashMap;

        let (_a, helper_side) = Channel::pair().unwrap();
        let forkserver = ForkServerClient::new(helper_side, Duration::from_millis(50));
        let request = SpawnRequest {
            policy_bytes: Vec::new(),
            fd_mappings: Vec::new(),
            env: HashMap::new(),
            cwd: "/".to_string(),
            namespace_flags: NamespaceFlags {
                user: true,
                pid: true,
                mount: true,
                ipc: true,
                uts: true,
                net: false,
            },
            uid_gid: UidGidMap { uid: 0, gid: 0 },
            rlimits: Vec::new(),
            mounts: Vec::new(),
            resources: None,
            hostname: None,
            rootfs_dir: "/tmp/capsule-root".to_string(),
            graceful_exit: true,
            has_notify_rules: false,
        };
        let session = crate::session::Session::new(forkserver, request, false);
        let mut transaction = Transaction::new(session, 3, Duration::from_secs(1));
        transaction.cancel();

        let result = transaction.run(|_session| Ok(()));
        assert!(matches!(result, Err(TransactionError::Cancelled)));
        assert_eq!(transaction.attempts_made(), 0);
    }

    #[test]
    fn non_retryable_error_stops_immediately() {
        assert!(!is_retryable(&CapsuleError::InvalidArgument("bad arg".to_string())));
        assert!(is_retryable(&CapsuleError::Unavailable("closed".to_string())));
    }
}
