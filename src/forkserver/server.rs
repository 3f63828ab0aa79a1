use super::{SpawnRequest, SpawnResponse, RPC_REMOTE_FD};
use crate::comms::{Channel, Tag};
use crate::error::{CapsuleError, CapsuleResult};
use std::os::fd::{IntoRawFd, RawFd};
use std::time::Duration;

#[cfg(target_os = "linux")]
use nix::sys::wait::{waitpid, WaitStatus};
#[cfg(target_os = "linux")]
use nix::unistd::{fork, ForkResult, Pid};

/// Supervisor-side handle to a running forkserver helper
/// (`SPEC_FULL.md` §4.F). One client is created per session and reused
/// across restarts — the helper itself is spawned once.
pub struct ForkServerClient {
    channel: Channel,
    grace_window: Duration,
}

impl ForkServerClient {
    pub fn new(channel: Channel, grace_window: Duration) -> Self {
        Self {
            channel,
            grace_window,
        }
    }

    /// Forks a fresh helper process that runs [`ForkServerLoop`] with
    /// [`crate::sandbox::confine_spawned_child`] as its `apply_policy`,
    /// and returns a client wired to talk to it (`SPEC_FULL.md` §4.F: "a
    /// target process is pre-loaded once, then forked on demand"). The
    /// helper never returns from its own side of this call — only the
    /// caller gets back.
    #[cfg(target_os = "linux")]
    pub fn spawn_helper(grace_window: Duration) -> CapsuleResult<Self> {
        let (supervisor_side, helper_side) = Channel::pair()?;

        // SAFETY: the child branch only runs `ForkServerLoop::run`, which
        // itself only issues the same async-signal-safe operations
        // `fork_and_setup`'s own child branch relies on, before exiting.
        match unsafe { fork() }.map_err(|e| CapsuleError::Syscall(format!("fork failed: {}", e)))? {
            ForkResult::Parent { child: _ } => {
                drop(helper_side);
                Ok(Self::new(supervisor_side, grace_window))
            }
            ForkResult::Child => {
                drop(supervisor_side);
                let loop_ = ForkServerLoop::new(helper_side, crate::sandbox::confine_spawned_child);
                if let Err(e) = loop_.run() {
                    eprintln!("forkserver helper loop exited: {}", e);
                }
                std::process::exit(0);
            }
        }
    }

    /// Sends `request` and blocks for the helper's reply. The helper always
    /// answers synchronously before looping back to await the next request
    /// (`SPEC_FULL.md` §4.F step 2).
    pub fn spawn(&self, request: &SpawnRequest) -> CapsuleResult<i32> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| CapsuleError::Internal(format!("failed to encode spawn request: {}", e)))?;
        self.channel.send(Tag::Call, &payload)?;
        let (_, reply) = self.channel.recv()?;
        let response: SpawnResponse = serde_json::from_slice(&reply)
            .map_err(|e| CapsuleError::Internal(format!("failed to decode spawn response: {}", e)))?;

        match response {
            SpawnResponse::Spawned { pid } => Ok(pid),
            SpawnResponse::SetupError { message } => Err(CapsuleError::SandboxSetup(
                crate::error::SandboxError::NamespaceCreation {
                    namespace: format!("forkserver setup failed: {}", message),
                },
            )),
            SpawnResponse::FdRegistered { .. } => Err(CapsuleError::Internal(
                "forkserver replied to a spawn request with an fd registration".to_string(),
            )),
        }
    }

    /// Hands `fd` to the helper over the persistent control channel via
    /// `SCM_RIGHTS` and returns the fd number the helper registered the
    /// duplicate as in its own table. A fork only inherits the forking
    /// process's fd table, so any fd a spawned sandboxee needs — the RPC
    /// channel end in particular — must already be open inside the helper,
    /// not just the supervisor, before `spawn` is called (`SPEC_FULL.md`
    /// §4.F).
    #[cfg(target_os = "linux")]
    pub fn open_helper_fd(&self, fd: RawFd) -> CapsuleResult<i32> {
        self.channel.send_fd(fd)?;
        let (_, reply) = self.channel.recv()?;
        let response: SpawnResponse = serde_json::from_slice(&reply)
            .map_err(|e| CapsuleError::Internal(format!("failed to decode fd registration reply: {}", e)))?;

        match response {
            SpawnResponse::FdRegistered { fd } => Ok(fd),
            SpawnResponse::SetupError { message } => Err(CapsuleError::SandboxSetup(
                crate::error::SandboxError::NamespaceCreation {
                    namespace: format!("forkserver fd registration failed: {}", message),
                },
            )),
            SpawnResponse::Spawned { .. } => Err(CapsuleError::Internal(
                "forkserver replied to an fd registration with a spawn result".to_string(),
            )),
        }
    }

    /// Grace window the supervisor waits for a child to acknowledge a
    /// graceful exit request before escalating to `SIGKILL` via the monitor.
    pub fn grace_window(&self) -> Duration {
        self.grace_window
    }

    pub fn raw_fd(&self) -> RawFd {
        self.channel.raw_fd()
    }
}

/// Sandboxee-side loop: runs inside the pre-loaded target process, forking a
/// fresh, policy-confined child on every `SpawnRequest` (`SPEC_FULL.md`
/// §4.F). `apply_policy` performs everything privileged the child needs
/// before it can safely run user code — namespaces, mounts, rlimits,
/// dropping capabilities, installing the compiled filter — kept as an
/// injected callback so this module stays ignorant of the concrete
/// namespace/cgroup/filesystem managers in [`crate::sandbox`] (component G
/// wires the two together).
pub struct ForkServerLoop<F>
where
    F: Fn(&SpawnRequest) -> CapsuleResult<Option<RawFd>>,
{
    channel: Channel,
    apply_policy: F,
}

impl<F> ForkServerLoop<F>
where
    F: Fn(&SpawnRequest) -> CapsuleResult<Option<RawFd>>,
{
    pub fn new(channel: Channel, apply_policy: F) -> Self {
        Self {
            channel,
            apply_policy,
        }
    }

    /// Runs forever, handling one frame per iteration: either a `SendFd`
    /// control frame (register the supervisor's next RPC channel fd in this
    /// process's own table) or a `SpawnRequest` Call frame. Never returns on
    /// success; returns only if the channel to the supervisor closes.
    #[cfg(target_os = "linux")]
    pub fn run(&self) -> CapsuleResult<()> {
        loop {
            let (tag, payload, fd) = self.channel.recv_with_fd()?;

            if tag == Tag::SendFd.as_u32() {
                match fd {
                    Some(owned) => {
                        // The duplicate must stay open in this process for a
                        // future fork to inherit it; leaking it here is what
                        // keeps it alive.
                        let local_fd = owned.into_raw_fd();
                        self.reply_fd_registered(local_fd)?;
                    }
                    None => self.reply_error("SendFd frame carried no descriptor")?,
                }
                continue;
            }

            let request: SpawnRequest = match serde_json::from_slice(&payload) {
                Ok(r) => r,
                Err(e) => {
                    self.reply_error(&format!("malformed spawn request: {}", e))?;
                    continue;
                }
            };

            match self.fork_and_setup(&request) {
                Ok(pid) => self.reply_spawned(pid)?,
                Err(e) => self.reply_error(&e.to_string())?,
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn fork_and_setup(&self, request: &SpawnRequest) -> CapsuleResult<i32> {
        // SAFETY: the child branch below only calls async-signal-safe
        // operations before exec'ing or exiting — dup2, the injected
        // `apply_policy` callback (namespace/seccomp setup, which itself
        // only issues syscalls), and `_exit`.
        match unsafe { fork() }.map_err(|e| CapsuleError::Syscall(format!("fork failed: {}", e)))? {
            ForkResult::Parent { child } => {
                // Reap immediately if the child reports setup failure before
                // the monitor attaches; otherwise the monitor (H/I) owns
                // reaping from here on (`SPEC_FULL.md` §4.H ordering note).
                Ok(child.as_raw())
            }
            ForkResult::Child => {
                for mapping in &request.fd_mappings {
                    if let Err(e) = remap_fd(mapping.local_fd, mapping.remote_fd) {
                        eprint_and_exit(&e.to_string());
                    }
                }
                let notify_fd = match (self.apply_policy)(request) {
                    Ok(fd) => fd,
                    Err(e) => eprint_and_exit(&e.to_string()),
                };
                // SAFETY: `remap_fd` above already dup2'd the supervisor's
                // RPC channel fd onto `RPC_REMOTE_FD` for this process.
                let rpc_channel = unsafe { Channel::from_raw_fd(RPC_REMOTE_FD) };
                if let Some(fd) = notify_fd {
                    if let Err(e) = rpc_channel.send_fd(fd) {
                        eprint_and_exit(&format!("failed to forward notify fd: {}", e));
                    }
                }
                // `serve` only returns on I/O failure (`Ok` on a clean
                // `Exit`, which already calls `_exit` itself); either way the
                // child's job here is done.
                let _ = crate::rpc::serve(&rpc_channel);
                std::process::exit(0);
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn reply_spawned(&self, pid: i32) -> CapsuleResult<()> {
        let payload = serde_json::to_vec(&SpawnResponse::Spawned { pid })
            .map_err(|e| CapsuleError::Internal(e.to_string()))?;
        self.channel.send(Tag::Return, &payload)
    }

    #[cfg(target_os = "linux")]
    fn reply_fd_registered(&self, fd: i32) -> CapsuleResult<()> {
        let payload = serde_json::to_vec(&SpawnResponse::FdRegistered { fd })
            .map_err(|e| CapsuleError::Internal(e.to_string()))?;
        self.channel.send(Tag::Return, &payload)
    }

    #[cfg(target_os = "linux")]
    fn reply_error(&self, message: &str) -> CapsuleResult<()> {
        let payload = serde_json::to_vec(&SpawnResponse::SetupError {
            message: message.to_string(),
        })
        .map_err(|e| CapsuleError::Internal(e.to_string()))?;
        self.channel.send(Tag::Return, &payload)
    }
}

#[cfg(target_os = "linux")]
fn remap_fd(local_fd: i32, remote_fd: i32) -> CapsuleResult<()> {
    use nix::unistd::dup2;
    if local_fd != remote_fd {
        dup2(local_fd, remote_fd)
            .map_err(|e| CapsuleError::Syscall(format!("dup2({}, {}) failed: {}", local_fd, remote_fd, e)))?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn eprint_and_exit(message: &str) -> ! {
    // The channel to the supervisor was left behind in the parent; a setup
    // failure this late (after fork, before the filter is installed) has no
    // safe way to report back, so it surfaces as a crash the monitor
    // classifies as `Signaled`/`InternalError` instead.
    eprintln!("forkserver child setup failed: {}", message);
    std::process::exit(127);
}

#[cfg(target_os = "linux")]
pub fn reap(pid: i32) -> CapsuleResult<WaitStatus> {
    waitpid(Pid::from_raw(pid), None)
        .map_err(|e| CapsuleError::Syscall(format!("waitpid failed: {}", e)))
}
