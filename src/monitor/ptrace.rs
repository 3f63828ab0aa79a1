use super::{FinalStatus, SessionResult, Violation};
use crate::error::{CapsuleResult, ExecutionError};
use crate::syscall::SyscallTable;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Kernel's convention for tagging a `PTRACE_EVENT_SECCOMP` stop: the stop
/// signal is `SIGTRAP` with the event number in the high byte of the status
/// word, which `waitpid`'s `PtraceEvent` variant already decodes for us.
const PTRACE_EVENT_SECCOMP: i32 = 7;

/// Event loop that stops the sandboxee on every traced syscall/signal,
/// classifies the stop, and produces the session's terminal
/// [`SessionResult`] (`SPEC_FULL.md` §4.H). Runs on its own OS thread so the
/// application thread driving [`crate::rpc::RpcChannel`] is never blocked by
/// it.
pub struct PtraceMonitor {
    stop_requested: Arc<AtomicBool>,
    deadline: Arc<Mutex<Option<Instant>>>,
    handle: Option<thread::JoinHandle<SessionResult>>,
}

impl PtraceMonitor {
    /// Seizes `pid` — a sandboxee forked by the forkserver helper, not a
    /// biological child of this process — and begins the classify loop.
    pub fn spawn(pid: i32, wall_time_limit: Option<Duration>) -> CapsuleResult<Self> {
        let stop_requested = Arc::new(AtomicBool::new(false));
        let deadline = Arc::new(Mutex::new(wall_time_limit.map(|d| Instant::now() + d)));

        let thread_stop = Arc::clone(&stop_requested);
        let thread_deadline = Arc::clone(&deadline);
        let handle = thread::spawn(move || Self::run(Pid::from_raw(pid), thread_stop, thread_deadline));

        Ok(Self {
            stop_requested,
            deadline,
            handle: Some(handle),
        })
    }

    pub fn set_wall_time_limit(&self, deadline_in: Duration) {
        *self.deadline.lock().unwrap() = Some(Instant::now() + deadline_in);
    }

    /// Requests external termination; the next loop iteration observes this
    /// and kills the child, yielding `ExternalKill` rather than whatever
    /// status the child would otherwise have reached.
    pub fn request_external_kill(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn join(mut self) -> CapsuleResult<SessionResult> {
        self.handle
            .take()
            .ok_or_else(|| ExecutionError::MonitoringError("monitor already joined".to_string()).into())
            .and_then(|h| {
                h.join()
                    .map_err(|_| ExecutionError::MonitoringError("ptrace monitor thread panicked".to_string()).into())
            })
    }

    fn run(pid: Pid, stop_requested: Arc<AtomicBool>, deadline: Arc<Mutex<Option<Instant>>>) -> SessionResult {
        let table = SyscallTable::for_x86_64();

        // `seize` rather than `attach`: the sandboxee is not our biological
        // child (the forkserver helper forked it), so there is no initial
        // ptrace-stop to wait out, and seize lets us set
        // `PTRACE_O_TRACESECCOMP` without first sending a stopping signal.
        if let Err(e) = ptrace::seize(pid, ptrace::Options::PTRACE_O_TRACESECCOMP) {
            return SessionResult::setup_error(format!("ptrace seize failed: {}", e));
        }

        loop {
            if stop_requested.load(Ordering::SeqCst) {
                let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);
                let _ = waitpid(pid, None);
                return SessionResult::external_kill();
            }

            if let Some(deadline) = *deadline.lock().unwrap() {
                if Instant::now() >= deadline {
                    tracing::warn!(pid = pid.as_raw(), "sandboxee killed after exceeding its wall-time deadline");
                    let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);
                    let _ = waitpid(pid, None);
                    return SessionResult::timed_out();
                }
            }

            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => return SessionResult::ok(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => return SessionResult::signaled(signal as i32),
                Ok(WaitStatus::PtraceEvent(_, Signal::SIGTRAP, PTRACE_EVENT_SECCOMP)) => {
                    let violation = Self::classify_seccomp_stop(pid, &table);
                    tracing::warn!(pid = pid.as_raw(), syscall = %violation.syscall_name, "sandboxee killed for policy violation");
                    // The monitor is the sole reaper; after recording the
                    // violation it kills the sandboxee rather than letting it
                    // continue in an unknown state.
                    let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);
                    let _ = waitpid(pid, None);
                    return SessionResult::violation(violation);
                }
                Ok(WaitStatus::Stopped(_, sig)) => {
                    // Any other stop (e.g. a plain signal-delivery stop) is
                    // forwarded unmodified and tracing continues.
                    let _ = ptrace::cont(pid, Some(sig));
                }
                Ok(WaitStatus::PtraceSyscall(_)) => {
                    let _ = ptrace::syscall(pid, None);
                }
                Ok(WaitStatus::StillAlive) => {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(_) => {}
                Err(nix::errno::Errno::ECHILD) => {
                    return SessionResult {
                        final_status: FinalStatus::InternalError,
                        reason: "sandboxee reaped out from under the monitor".to_string(),
                        exit_code: None,
                        signal: None,
                        last_violation: None,
                    };
                }
                Err(e) => {
                    return SessionResult {
                        final_status: FinalStatus::InternalError,
                        reason: format!("waitpid failed: {}", e),
                        exit_code: None,
                        signal: None,
                        last_violation: None,
                    };
                }
            }
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn classify_seccomp_stop(pid: Pid, table: &SyscallTable) -> Violation {
        match ptrace::getregs(pid) {
            Ok(regs) => {
                let nr = regs.orig_rax as i64;
                let entry = table.lookup(nr);
                let args = [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9];
                let described = entry.describe_args(&args, |_addr| None);
                Violation {
                    syscall_name: entry.name.to_string(),
                    syscall_nr: nr,
                    args: described,
                    stack_trace: None,
                }
            }
            Err(e) => Violation {
                syscall_name: "unknown".to_string(),
                syscall_nr: -1,
                args: vec![format!("failed to read registers: {}", e)],
                stack_trace: None,
            },
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn classify_seccomp_stop(_pid: Pid, _table: &SyscallTable) -> Violation {
        Violation {
            syscall_name: "unknown".to_string(),
            syscall_nr: -1,
            args: vec!["register snapshot unsupported on this architecture".to_string()],
            stack_trace: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_result_constructors_set_expected_status() {
        assert_eq!(SessionResult::ok(0).final_status, FinalStatus::Ok);
        assert_eq!(SessionResult::timed_out().final_status, FinalStatus::TimedOut);
        assert_eq!(SessionResult::external_kill().final_status, FinalStatus::ExternalKill);
    }
}
