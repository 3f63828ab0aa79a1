use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Remote fd the sandboxee-side helper listens for RPC frames on, chosen to
/// sit just past the inherited stdio fds. `PolicyBuilder` (component G) maps
/// the supervisor's RPC channel fd to this value; the forkserver child
/// (`ForkServerLoop::fork_and_setup`) serves the RPC protocol (D) on it after
/// applying its policy.
pub const RPC_REMOTE_FD: i32 = 3;

/// One `{local_fd, remote_fd, name?}` entry in an ordered fd map
/// (`SPEC_FULL.md` §3). `remote_fd`s must be unique within a request;
/// `PolicyBuilder::build` (component G) enforces that before a
/// `SpawnRequest` is ever serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FdMapping {
    pub local_fd: i32,
    pub remote_fd: i32,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceFlags {
    pub user: bool,
    pub pid: bool,
    pub mount: bool,
    pub ipc: bool,
    pub uts: bool,
    pub net: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UidGidMap {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlimitSpec {
    pub resource: String,
    pub soft: u64,
    pub hard: u64,
}

/// One path `PolicyBuilder` (component G) wants bound into the sandboxee's
/// mount namespace, lowered from its `MountEntry` accumulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MountSpec {
    File { path: String, readonly: bool },
    Directory { path: String, readonly: bool },
    DirectoryAt { src: String, dst: String, readonly: bool },
}

/// cgroup-enforced resource ceilings, carried separately from `rlimits`
/// (POSIX per-process limits) since the confining step applies both through
/// different kernel mechanisms (`SPEC_FULL.md` §4.G).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub memory_bytes: u64,
    pub cpu_shares: u32,
    pub max_pids: u32,
}

/// Request sent to the forkserver loop at every spawn (`SPEC_FULL.md` §4.F
/// step 1). `policy_bytes` carries the already-compiled filter program so
/// the helper never has to re-run the DSL compiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub policy_bytes: Vec<u8>,
    pub fd_mappings: Vec<FdMapping>,
    pub env: HashMap<String, String>,
    pub cwd: String,
    pub namespace_flags: NamespaceFlags,
    pub uid_gid: UidGidMap,
    pub rlimits: Vec<RlimitSpec>,
    pub mounts: Vec<MountSpec>,
    pub resources: Option<ResourceSpec>,
    pub hostname: Option<String>,
    pub rootfs_dir: String,
    pub graceful_exit: bool,
    /// Whether the compiled filter carries any `Notify` action. The helper
    /// only bothers extracting a seccomp user-notification fd from the
    /// loaded filter when this is set (`SPEC_FULL.md` §4.I); `Session::init`
    /// only waits on one coming back over the RPC channel under the same
    /// condition.
    pub has_notify_rules: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SpawnResponse {
    Spawned { pid: i32 },
    SetupError { message: String },
    /// Reply to a `SendFd` control frame on the persistent forkserver
    /// channel: the fd number the helper registered the duplicated
    /// descriptor as in its own table. The supervisor uses this as the
    /// `local_fd` half of an `FdMapping` in the next `SpawnRequest`, since a
    /// fork inherits the *helper's* fd table, not the supervisor's
    /// (`SPEC_FULL.md` §4.F).
    FdRegistered { fd: i32 },
}
