use super::ptrace::PtraceMonitor;
use super::{FinalStatus, SessionResult};
use crate::error::{CapsuleError, CapsuleResult};
use crate::syscall::SyscallTable;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Alternate monitor receiving seccomp user-notifications instead of
/// intercepting every syscall via ptrace (`SPEC_FULL.md` §4.I). Kernel
/// support is probed once per process; when absent the session falls back
/// to [`PtraceMonitor`] transparently.
pub enum Monitor {
    Unotify(UnotifyMonitor),
    Fallback(PtraceMonitor),
}

impl Monitor {
    /// Probes for kernel user-notification support and picks the
    /// appropriate variant. `use_unotify` mirrors the `CAPSULE_USE_UNOTIFY`
    /// configuration flag (`SPEC_FULL.md` §6).
    pub fn spawn(pid: i32, notify_fd: Option<RawFd>, use_unotify: bool, wall_time_limit: Option<Duration>) -> CapsuleResult<Self> {
        if use_unotify {
            if let Some(fd) = notify_fd {
                if probe_kernel_support() {
                    tracing::debug!(pid, "using seccomp unotify monitor");
                    return Ok(Monitor::Unotify(UnotifyMonitor::spawn(pid, fd, wall_time_limit)?));
                }
                tracing::debug!(pid, "kernel unotify probe failed, falling back to ptrace monitor");
            }
        }
        Ok(Monitor::Fallback(PtraceMonitor::spawn(pid, wall_time_limit)?))
    }

    pub fn join(self) -> CapsuleResult<SessionResult> {
        match self {
            Monitor::Unotify(m) => m.join(),
            Monitor::Fallback(m) => m.join(),
        }
    }

    pub fn request_external_kill(&self) {
        match self {
            Monitor::Unotify(m) => m.request_external_kill(),
            Monitor::Fallback(m) => m.request_external_kill(),
        }
    }

    pub fn set_wall_time_limit(&self, deadline_in: Duration) {
        match self {
            Monitor::Unotify(m) => m.set_wall_time_limit(deadline_in),
            Monitor::Fallback(m) => m.set_wall_time_limit(deadline_in),
        }
    }
}

/// A pending notification: the requesting syscall plus enough context to
/// respond (`SPEC_FULL.md` §4.I).
#[derive(Debug, Clone)]
pub struct NotifyRequest {
    pub id: u64,
    pub pid: i32,
    pub syscall_nr: i64,
    pub args: [u64; 6],
}

/// Mirrors the kernel's `struct seccomp_data` (`linux/seccomp.h`).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SeccompData {
    nr: i32,
    arch: u32,
    instruction_pointer: u64,
    args: [u64; 6],
}

/// Mirrors the kernel's `struct seccomp_notif`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SeccompNotif {
    id: u64,
    pid: u32,
    flags: u32,
    data: SeccompData,
}

/// Mirrors the kernel's `struct seccomp_notif_resp`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SeccompNotifResp {
    id: u64,
    val: i64,
    error: i32,
    flags: u32,
}

/// Mirrors the kernel's `struct seccomp_notif_sizes`, queried once via
/// `SECCOMP_GET_NOTIF_SIZES` so a kernel that has grown the wire structs
/// since this core was built still gets buffers big enough to hold a full
/// reply (`seccomp_unotify.cc`'s `Init`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct SeccompNotifSizes {
    seccomp_notif: u16,
    seccomp_notif_resp: u16,
    seccomp_data: u16,
}

const SECCOMP_GET_NOTIF_SIZES: libc::c_uint = 3;
const SECCOMP_USER_NOTIF_FLAG_CONTINUE: u32 = 1;
const SECCOMP_IOC_MAGIC: u64 = b'!' as u64;
const IOC_READ: u64 = 2;
const IOC_WRITE: u64 = 1;

const fn ioc_readwrite(nr: u64, size: usize) -> u64 {
    ((IOC_READ | IOC_WRITE) << 30) | (((size as u64) & 0x3fff) << 16) | (SECCOMP_IOC_MAGIC << 8) | nr
}

const SECCOMP_IOCTL_NOTIF_RECV: u64 = ioc_readwrite(0, std::mem::size_of::<SeccompNotif>());
const SECCOMP_IOCTL_NOTIF_SEND: u64 = ioc_readwrite(1, std::mem::size_of::<SeccompNotifResp>());

/// Issues the raw `seccomp(2)` syscall directly, the way the rest of this
/// crate reaches for `libc::SYS_*` constants `nix` doesn't wrap (see
/// `sandbox::seccomp`).
fn seccomp_get_notif_sizes() -> std::io::Result<SeccompNotifSizes> {
    let mut sizes = SeccompNotifSizes::default();
    let ret = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_GET_NOTIF_SIZES,
            0u32,
            &mut sizes as *mut SeccompNotifSizes,
        )
    };
    if ret == 0 {
        Ok(sizes)
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Kernel support for `SECCOMP_GET_NOTIF_SIZES` is a reliable proxy for
/// user-notification support in general — it was added in the same kernel
/// release (5.0) and every kernel that understands it also understands
/// `SECCOMP_FILTER_FLAG_NEW_LISTENER`/`SECCOMP_USER_NOTIF_FLAG_CONTINUE`.
fn probe_kernel_support() -> bool {
    seccomp_get_notif_sizes().is_ok()
}

pub struct UnotifyMonitor {
    stop_requested: Arc<AtomicBool>,
    deadline: Arc<Mutex<Option<Instant>>>,
    handle: Option<thread::JoinHandle<SessionResult>>,
}

impl UnotifyMonitor {
    fn spawn(pid: i32, notify_fd: RawFd, wall_time_limit: Option<Duration>) -> CapsuleResult<Self> {
        let stop_requested = Arc::new(AtomicBool::new(false));
        let deadline = Arc::new(Mutex::new(wall_time_limit.map(|d| Instant::now() + d)));

        let thread_stop = Arc::clone(&stop_requested);
        let thread_deadline = Arc::clone(&deadline);
        let handle = thread::spawn(move || Self::run(Pid::from_raw(pid), notify_fd, thread_stop, thread_deadline));

        Ok(Self {
            stop_requested,
            deadline,
            handle: Some(handle),
        })
    }

    pub fn set_wall_time_limit(&self, deadline_in: Duration) {
        *self.deadline.lock().unwrap() = Some(Instant::now() + deadline_in);
    }

    pub fn request_external_kill(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn join(mut self) -> CapsuleResult<SessionResult> {
        self.handle
            .take()
            .ok_or_else(|| CapsuleError::FailedPrecondition("monitor already joined".to_string()))
            .and_then(|h| h.join().map_err(|_| CapsuleError::Internal("unotify monitor thread panicked".to_string())))
    }

    fn run(pid: Pid, notify_fd: RawFd, stop_requested: Arc<AtomicBool>, deadline: Arc<Mutex<Option<Instant>>>) -> SessionResult {
        let table = SyscallTable::for_x86_64();

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
                Ok(WaitStatus::StillAlive) | Err(_) => {}
                Ok(_) => {}
            }

            match poll_notify_fd(notify_fd, Duration::from_millis(50)) {
                Ok(true) => match receive(notify_fd) {
                    Ok(req) => {
                        let entry = table.lookup(req.syscall_nr);
                        let described = entry.describe_args(&req.args, |_addr| None);
                        tracing::info!(pid = pid.as_raw(), syscall = %entry.name, args = ?described, "seccomp user-notification received, continuing");
                        if let Err(e) = respond_continue(notify_fd, &req) {
                            tracing::warn!(error = %e, "failed to respond to seccomp notification");
                        }
                    }
                    Err(e) => {
                        // ENOENT means the sandboxee's syscall was retired
                        // (e.g. by a signal) before we could respond to it;
                        // not a monitor failure.
                        tracing::debug!(error = %e, "seccomp notification recv failed");
                    }
                },
                Ok(false) => {}
                Err(e) => {
                    return SessionResult {
                        final_status: FinalStatus::InternalError,
                        reason: format!("failed to poll seccomp notify fd: {}", e),
                        exit_code: None,
                        signal: None,
                        last_violation: None,
                    };
                }
            }
        }
    }
}

fn poll_notify_fd(fd: RawFd, timeout: Duration) -> std::io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(ret > 0 && pfd.revents & libc::POLLIN != 0)
}

/// Blocks until a notification arrives on `notify_fd`, decoding the
/// kernel's `struct seccomp_notif` (`seccomp_unotify.cc`'s `Receive`).
fn receive(notify_fd: RawFd) -> CapsuleResult<NotifyRequest> {
    let mut notif: SeccompNotif = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::ioctl(notify_fd, SECCOMP_IOCTL_NOTIF_RECV as _, &mut notif as *mut SeccompNotif) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Err(CapsuleError::NotFound("sandboxee syscall retired before notification was delivered".to_string()));
        }
        return Err(CapsuleError::Syscall(format!("seccomp notif recv ioctl failed: {}", err)));
    }
    Ok(NotifyRequest {
        id: notif.id,
        pid: notif.pid as i32,
        syscall_nr: notif.data.nr as i64,
        args: notif.data.args,
    })
}

fn send_response(notify_fd: RawFd, resp: &SeccompNotifResp) -> CapsuleResult<()> {
    let ret = unsafe { libc::ioctl(notify_fd, SECCOMP_IOCTL_NOTIF_SEND as _, resp as *const SeccompNotifResp) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(CapsuleError::Syscall(format!("seccomp notif send ioctl failed: {}", err)));
    }
    Ok(())
}

/// Allows the sandboxee to continue the syscall as if it had never been
/// intercepted (`seccomp_unotify.cc`'s `RespondContinue`).
pub fn respond_continue(notify_fd: RawFd, req: &NotifyRequest) -> CapsuleResult<()> {
    send_response(
        notify_fd,
        &SeccompNotifResp {
            id: req.id,
            val: 0,
            error: 0,
            flags: SECCOMP_USER_NOTIF_FLAG_CONTINUE,
        },
    )
}

/// Fails the syscall with `error` without letting it run
/// (`seccomp_unotify.cc`'s `RespondErrno`).
pub fn respond_errno(notify_fd: RawFd, req: &NotifyRequest, error: i32) -> CapsuleResult<()> {
    send_response(
        notify_fd,
        &SeccompNotifResp {
            id: req.id,
            val: 0,
            error,
            flags: 0,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_numbers_match_the_kernels_iowr_encoding() {
        // `_IOWR('!', 0, struct seccomp_notif)` / `_IOWR('!', 1, struct
        // seccomp_notif_resp)`, computed the same way the kernel headers do.
        assert_eq!(SECCOMP_IOCTL_NOTIF_RECV & 0xff, 0);
        assert_eq!(SECCOMP_IOCTL_NOTIF_SEND & 0xff, 1);
        assert_eq!((SECCOMP_IOCTL_NOTIF_RECV >> 8) & 0xff, SECCOMP_IOC_MAGIC);
        assert_eq!((SECCOMP_IOCTL_NOTIF_RECV >> 30) & 0x3, IOC_READ | IOC_WRITE);
    }

    #[test]
    fn monitor_falls_back_to_ptrace_when_unotify_disabled() {
        let result = Monitor::spawn(std::process::id() as i32, None, false, Some(Duration::from_millis(1)));
        assert!(matches!(result, Ok(Monitor::Fallback(_))));
    }

    #[test]
    fn monitor_falls_back_to_ptrace_when_no_notify_fd_is_available() {
        let result = Monitor::spawn(std::process::id() as i32, None, true, Some(Duration::from_millis(1)));
        assert!(matches!(result, Ok(Monitor::Fallback(_))));
    }
}
