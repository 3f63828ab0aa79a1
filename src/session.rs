//! Session lifecycle (component J, `SPEC_FULL.md` §4.J): owns one
//! forkserver-spawned sandboxee, its [`Monitor`], and the [`RpcChannel`]
//! talking to it, and presents the single object the rest of the crate
//! drives a run through.
//!
//! Establishing the RPC channel across the fork boundary needs the
//! supervisor's end of a fresh [`Channel::pair`] to land as an already-open
//! fd inside the forkserver helper process *before* that helper forks the
//! confined child (the helper then `dup2`s it to a well-known remote fd via
//! [`SpawnRequest::fd_mappings`], same as any other inherited fd). A fork
//! only inherits the *helper's* fd table, not the supervisor's, so `init`
//! routes the supervisor's end of a fresh channel over to the helper via
//! [`ForkServerClient::open_helper_fd`] before every spawn, and uses whatever
//! fd number the helper reports registering it as.

use crate::comms::Channel;
use crate::error::{CapsuleError, CapsuleResult};
use crate::forkserver::{FdMapping, ForkServerClient, SpawnRequest, RPC_REMOTE_FD};
use crate::monitor::unotify::Monitor;
use crate::monitor::{SessionResult, Violation};
use crate::rpc::{FunctionCallDescriptor, FunctionReturn, Generation, RemoteAddr, RpcChannel};
use crate::variable::{self, AllocatingVariable};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Created,
    Active,
    Terminated,
}

/// Owns one incarnation of a sandboxee and everything needed to talk to it.
/// `Restart` tears this incarnation down and builds a fresh one under a
/// bumped [`Generation`], invalidating every [`RemoteAddr`] minted before it
/// (`SPEC_FULL.md` §9).
pub struct Session {
    forkserver: ForkServerClient,
    spawn_request: SpawnRequest,
    use_unotify: bool,
    generation: Arc<Generation>,
    rpc: Option<RpcChannel>,
    monitor: Option<Monitor>,
    pid: Option<i32>,
    wall_time_limit: Option<Duration>,
    state: SessionState,
    last_result: Option<SessionResult>,
}

impl Session {
    pub fn new(forkserver: ForkServerClient, spawn_request: SpawnRequest, use_unotify: bool) -> Self {
        Self {
            forkserver,
            spawn_request,
            use_unotify,
            generation: Arc::new(Generation::new()),
            rpc: None,
            monitor: None,
            pid: None,
            wall_time_limit: None,
            state: SessionState::Created,
            last_result: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active && self.rpc.as_ref().is_some_and(|rpc| !rpc.is_closed())
    }

    /// Spawns the sandboxee and brings up its RPC channel and monitor
    /// (`SPEC_FULL.md` §4.F/§4.H/§4.I, composed). May be called again after
    /// `terminate` to bring up a fresh incarnation; prefer [`Session::restart`]
    /// for that, which also bumps the generation counter.
    pub fn init(&mut self) -> CapsuleResult<()> {
        if self.state == SessionState::Active {
            return Err(CapsuleError::FailedPrecondition(
                "session is already active".to_string(),
            ));
        }

        let (supervisor_channel, child_side) = Channel::pair()?;
        let registered_fd = self.forkserver.open_helper_fd(child_side.raw_fd())?;
        // The duplicate the helper registered is what the next fork will
        // inherit; our own copy of `child_side` has done its job.
        drop(child_side);

        self.spawn_request.fd_mappings.retain(|m| m.remote_fd != RPC_REMOTE_FD);
        self.spawn_request.fd_mappings.push(FdMapping {
            local_fd: registered_fd,
            remote_fd: RPC_REMOTE_FD,
            name: Some("rpc".to_string()),
        });

        let pid = self.forkserver.spawn(&self.spawn_request)?;
        tracing::info!(pid, generation = self.generation.current(), "sandboxee spawned");

        let notify_fd = if self.spawn_request.has_notify_rules {
            match supervisor_channel.recv_fd() {
                Ok(owned) => Some(owned.into_raw_fd()),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to receive seccomp notify fd from sandboxee");
                    None
                }
            }
        } else {
            None
        };

        let monitor = Monitor::spawn(pid, notify_fd, self.use_unotify, self.wall_time_limit)?;

        self.rpc = Some(RpcChannel::new(supervisor_channel, Arc::clone(&self.generation)));
        self.monitor = Some(monitor);
        self.pid = Some(pid);
        self.state = SessionState::Active;
        Ok(())
    }

    /// The violation recorded by the most recently terminated incarnation,
    /// if its terminal status was `Violation` (`SPEC_FULL.md` §4.K uses this
    /// to classify a failed [`crate::transaction::Transaction`] attempt).
    pub fn last_violation(&self) -> Option<Violation> {
        self.last_result.as_ref().and_then(|r| r.last_violation.clone())
    }

    pub fn rpc_channel(&self) -> CapsuleResult<&RpcChannel> {
        self.rpc.as_ref().ok_or_else(|| {
            CapsuleError::FailedPrecondition("session has not been initialized".to_string())
        })
    }

    /// Requests the sandboxee exit (graceful) or kills it immediately,
    /// joins the monitor, and returns the terminal [`SessionResult`]
    /// (`SPEC_FULL.md` §4.H).
    pub fn terminate(&mut self, graceful: bool) -> CapsuleResult<SessionResult> {
        if let Some(rpc) = &self.rpc {
            if graceful {
                let _ = rpc.exit();
            }
        }
        if !graceful {
            if let Some(monitor) = &self.monitor {
                monitor.request_external_kill();
            }
        }
        let result = match self.monitor.take() {
            Some(monitor) => monitor.join()?,
            None => {
                return Err(CapsuleError::FailedPrecondition(
                    "session has no active monitor to terminate".to_string(),
                ))
            }
        };
        tracing::info!(final_status = ?result.final_status, "session terminated");
        self.rpc = None;
        self.pid = None;
        self.state = SessionState::Terminated;
        self.last_result = Some(result.clone());
        Ok(result)
    }

    /// Tears down the current incarnation (if any) and spawns a fresh one
    /// under a bumped generation, invalidating every [`RemoteAddr`] minted
    /// before the restart.
    pub fn restart(&mut self, graceful: bool) -> CapsuleResult<()> {
        if self.state == SessionState::Active {
            let _ = self.terminate(graceful)?;
        }
        self.generation.bump();
        self.state = SessionState::Created;
        self.init()
    }

    pub fn set_wall_time_limit(&mut self, deadline_in: Duration) {
        self.wall_time_limit = Some(deadline_in);
        if let Some(monitor) = &self.monitor {
            monitor.set_wall_time_limit(deadline_in);
        }
    }

    /// Blocks until the sandboxee reaches a terminal state, consuming the
    /// monitor. After this call the session is no longer active.
    pub fn await_result(&mut self) -> CapsuleResult<SessionResult> {
        let monitor = self.monitor.take().ok_or_else(|| {
            CapsuleError::FailedPrecondition("session has no active monitor".to_string())
        })?;
        let result = monitor.join()?;
        self.rpc = None;
        self.pid = None;
        self.state = SessionState::Terminated;
        self.last_result = Some(result.clone());
        Ok(result)
    }

    pub fn symbol(&self, name: &str) -> CapsuleResult<RemoteAddr> {
        self.rpc_channel()?.symbol(name)
    }

    pub fn call(&self, descriptor: &FunctionCallDescriptor) -> CapsuleResult<FunctionReturn> {
        self.rpc_channel()?.call(descriptor)
    }

    /// Allocates remote storage for `var` without writing to it. `auto_free`
    /// marks whether the variable owns the buffer and must free it later.
    pub fn allocate(&self, var: &mut dyn AllocatingVariable, auto_free: bool) -> CapsuleResult<RemoteAddr> {
        let rpc = self.rpc_channel()?;
        let addr = rpc.allocate(var.remote_size())?;
        var.set_remote_addr(addr, auto_free);
        Ok(addr)
    }

    pub fn free(&self, var: &mut dyn AllocatingVariable) -> CapsuleResult<()> {
        variable::free(self.rpc_channel()?, var)
    }

    pub fn transfer_to_sandboxee(&self, var: &mut dyn AllocatingVariable) -> CapsuleResult<RemoteAddr> {
        variable::transfer_to_sandboxee(self.rpc_channel()?, var)
    }

    pub fn transfer_from_sandboxee(&self, var: &mut dyn AllocatingVariable) -> CapsuleResult<()> {
        variable::transfer_from_sandboxee(self.rpc_channel()?, var)
    }

    /// Allocates a fresh remote buffer sized to `bytes` and writes it in one
    /// step, returning the resulting address. Convenience wrapper for
    /// payloads that don't need a typed [`crate::variable::Variable`]
    /// wrapper (`SPEC_FULL.md` §4.J).
    pub fn allocate_and_transfer_to_sandboxee(&self, bytes: &[u8]) -> CapsuleResult<RemoteAddr> {
        let rpc = self.rpc_channel()?;
        let addr = rpc.allocate(bytes.len() as u64)?;
        rpc.write_memory(addr, bytes)?;
        rpc.mark_memory_initialized(addr, bytes.len() as u64)?;
        Ok(addr)
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::Channel;
    use std::collections::HashMap;
    use std::time::Duration as StdDuration;

    fn empty_spawn_request() -> SpawnRequest {
        SpawnRequest {
            policy_bytes: Vec::new(),
            fd_mappings: Vec::new(),
            env: HashMap::new(),
            cwd: "/".to_string(),
            namespace_flags: crate::forkserver::NamespaceFlags {
                user: true,
                pid: true,
                mount: true,
                ipc: true,
                uts: true,
                net: false,
            },
            uid_gid: crate::forkserver::UidGidMap { uid: 0, gid: 0 },
            rlimits: Vec::new(),
            mounts: Vec::new(),
            resources: None,
            hostname: None,
            rootfs_dir: "/tmp/capsule-root".to_string(),
            graceful_exit: true,
            has_notify_rules: false,
        }
    }

    #[test]
    fn init_requires_the_session_not_already_active() {
        // Exercised at the type level only: a session that never calls
        // `init()` successfully (no live forkserver helper in a unit test)
        // starts out inactive.
        let (_forkserver_side, helper_side) = Channel::pair().unwrap();
        let forkserver = ForkServerClient::new(helper_side, StdDuration::from_millis(100));
        let session = Session::new(forkserver, empty_spawn_request(), false);
        assert!(!session.is_active());
    }

    #[test]
    fn operations_before_init_fail_precondition() {
        let (_forkserver_side, helper_side) = Channel::pair().unwrap();
        let forkserver = ForkServerClient::new(helper_side, StdDuration::from_millis(100));
        let session = Session::new(forkserver, empty_spawn_request(), false);
        let err = session.rpc_channel().unwrap_err();
        assert!(matches!(err, CapsuleError::FailedPrecondition(_)));
    }

    #[test]
    fn last_violation_is_none_before_any_attempt() {
        let (_forkserver_side, helper_side) = Channel::pair().unwrap();
        let forkserver = ForkServerClient::new(helper_side, StdDuration::from_millis(100));
        let session = Session::new(forkserver, empty_spawn_request(), false);
        assert!(session.last_violation().is_none());
    }
}
