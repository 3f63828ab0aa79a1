//! Supervisor-side event loops that observe the sandboxee out-of-band and
//! produce the session's single terminal [`Result`] (components H and I,
//! `SPEC_FULL.md` §4.H/§4.I).

#[cfg(target_os = "linux")]
pub mod ptrace;
#[cfg(target_os = "linux")]
pub mod unotify;

use std::time::Duration;

/// Terminal outcome of a session (`SPEC_FULL.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalStatus {
    Ok,
    Signaled,
    Violation,
    ExternalKill,
    TimedOut,
    InternalError,
    SetupError,
}

/// Details of a policy violation: the offending syscall, formatted
/// arguments, and (when enabled) an unwound stack trace captured over the
/// RPC channel (`SPEC_FULL.md` §4.H, §7).
#[derive(Debug, Clone)]
pub struct Violation {
    pub syscall_name: String,
    pub syscall_nr: i64,
    pub args: Vec<String>,
    pub stack_trace: Option<Vec<String>>,
}

/// The single terminal record of a session (`SPEC_FULL.md` §3, §7).
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub final_status: FinalStatus,
    pub reason: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub last_violation: Option<Violation>,
}

impl SessionResult {
    pub fn ok(exit_code: i32) -> Self {
        Self {
            final_status: FinalStatus::Ok,
            reason: format!("exited with code {}", exit_code),
            exit_code: Some(exit_code),
            signal: None,
            last_violation: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            final_status: FinalStatus::Signaled,
            reason: format!("terminated by signal {}", signal),
            exit_code: None,
            signal: Some(signal),
            last_violation: None,
        }
    }

    pub fn violation(violation: Violation) -> Self {
        Self {
            reason: format!(
                "policy violation on syscall {} ({})",
                violation.syscall_name, violation.syscall_nr
            ),
            final_status: FinalStatus::Violation,
            exit_code: None,
            signal: None,
            last_violation: Some(violation),
        }
    }

    pub fn timed_out() -> Self {
        Self {
            final_status: FinalStatus::TimedOut,
            reason: "wall-clock deadline exceeded".to_string(),
            exit_code: None,
            signal: None,
            last_violation: None,
        }
    }

    pub fn external_kill() -> Self {
        Self {
            final_status: FinalStatus::ExternalKill,
            reason: "terminated by external request".to_string(),
            exit_code: None,
            signal: None,
            last_violation: None,
        }
    }

    pub fn setup_error(message: impl Into<String>) -> Self {
        Self {
            final_status: FinalStatus::SetupError,
            reason: message.into(),
            exit_code: None,
            signal: None,
            last_violation: None,
        }
    }
}

/// Session state machine shared by both monitor variants
/// (`SPEC_FULL.md` §4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Initializing,
    Running,
    Finishing,
    Finished,
}

/// Safe default grace window a monitor waits after a graceful exit request
/// before escalating to `SIGKILL` (`SPEC_FULL.md` §6 env var surface).
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_millis(250);
