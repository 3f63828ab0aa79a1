//! Policy assembly (component G, `SPEC_FULL.md` §4.G).
//!
//! [`PolicyBuilder`] is the single place that gathers everything a spawn
//! needs — syscall rules (component B), the filesystem view, namespace
//! flags, resource limits, environment, and fd mappings — and lowers them
//! into a [`SpawnRequest`] the forkserver can act on. It never touches the
//! kernel itself; [`forkserver::ForkServerLoop`] and the namespace/cgroup/
//! filesystem managers do that once the request reaches the child.

use crate::error::{CapsuleError, CapsuleResult};
use crate::forkserver::{FdMapping, MountSpec, NamespaceFlags, ResourceSpec, RlimitSpec, SpawnRequest, UidGidMap};
use crate::policy;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Paths that are expected to exist only once the sandboxee's mount
/// namespace is assembled (e.g. `/proc`, `/dev/null`), so `build()` must not
/// reject them even though they are absent on the caller's host filesystem.
const WELL_KNOWN_PSEUDO_PATHS: &[&str] = &[
    "/proc", "/sys", "/dev", "/dev/null", "/dev/zero", "/dev/full", "/dev/random",
    "/dev/urandom", "/tmp", "/var",
];

#[derive(Debug, Clone)]
enum MountEntry {
    File { path: PathBuf, readonly: bool },
    Directory { path: PathBuf, readonly: bool },
    DirectoryAt { src: PathBuf, dst: PathBuf, readonly: bool },
}

impl MountEntry {
    fn source(&self) -> &Path {
        match self {
            MountEntry::File { path, .. } => path,
            MountEntry::Directory { path, .. } => path,
            MountEntry::DirectoryAt { src, .. } => src,
        }
    }

    fn into_spec(self) -> MountSpec {
        match self {
            MountEntry::File { path, readonly } => MountSpec::File {
                path: path.to_string_lossy().into_owned(),
                readonly,
            },
            MountEntry::Directory { path, readonly } => MountSpec::Directory {
                path: path.to_string_lossy().into_owned(),
                readonly,
            },
            MountEntry::DirectoryAt { src, dst, readonly } => MountSpec::DirectoryAt {
                src: src.to_string_lossy().into_owned(),
                dst: dst.to_string_lossy().into_owned(),
                readonly,
            },
        }
    }
}

fn is_well_known(path: &Path) -> bool {
    WELL_KNOWN_PSEUDO_PATHS
        .iter()
        .any(|known| path == Path::new(known) || path.starts_with(known))
}

/// Paths a mount is never allowed to name, regardless of whether they exist
/// on the host — kernel control surfaces and host secrets that a bind mount
/// or rootfs binding would otherwise hand straight into the sandboxee.
const DANGEROUS_MOUNT_PREFIXES: &[&str] = &[
    "/proc/sys",
    "/proc/sysrq-trigger",
    "/proc/kcore",
    "/proc/kmem",
    "/proc/mem",
    "/sys/kernel",
    "/sys/devices",
    "/dev/mem",
    "/dev/kmem",
    "/dev/port",
    "/boot",
    "/etc/passwd",
    "/etc/shadow",
    "/etc/sudoers",
    "/etc/ssh",
    "/root",
    "/home",
];

/// Rejects a mount path that escapes its own root via `..` or names a
/// dangerous host path outright (`SPEC_FULL.md` §4.G invariants).
fn is_safe_mount_path(path: &Path) -> bool {
    if path.components().any(|c| c == std::path::Component::ParentDir) {
        return false;
    }
    let path_str = path.to_string_lossy();
    !DANGEROUS_MOUNT_PREFIXES.iter().any(|dangerous| path_str.starts_with(dangerous))
}

/// Accumulates a spawn's full configuration before it is serialized into a
/// [`SpawnRequest`] and handed to the forkserver (`SPEC_FULL.md` §4.F step
/// 1). Mirrors the teacher's `Sandbox::setup` staging, but as a pure,
/// side-effect-free builder: nothing here touches the filesystem, mounts
/// anything, or forks.
pub struct PolicyBuilder {
    policy: policy::Builder,
    mounts: Vec<MountEntry>,
    fd_mappings: Vec<FdMapping>,
    env: HashMap<String, String>,
    cwd: String,
    namespace_flags: NamespaceFlags,
    uid_gid: UidGidMap,
    rlimits: Vec<RlimitSpec>,
    resources: Option<ResourceSpec>,
    hostname: Option<String>,
    rootfs_dir: String,
    graceful_exit: bool,
}

impl PolicyBuilder {
    pub fn new(rootfs_dir: impl Into<String>) -> Self {
        Self {
            policy: policy::Builder::new(),
            mounts: Vec::new(),
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
            resources: None,
            hostname: None,
            rootfs_dir: rootfs_dir.into(),
            graceful_exit: true,
        }
    }

    /// Applies one transformation to the accumulated syscall policy
    /// (component B). `policy::Builder`'s methods consume and return `Self`
    /// in the usual fluent style, so this takes the current builder out
    /// with [`std::mem::take`], runs `f`, and puts the result back —
    /// letting callers chain `policy::Builder`'s own API without this type
    /// re-exposing every rule method one by one.
    pub fn with_policy<F>(&mut self, f: F) -> &mut Self
    where
        F: FnOnce(policy::Builder) -> policy::Builder,
    {
        self.policy = f(std::mem::take(&mut self.policy));
        self
    }

    pub fn add_file(&mut self, path: impl Into<PathBuf>, readonly: bool) -> &mut Self {
        self.mounts.push(MountEntry::File {
            path: path.into(),
            readonly,
        });
        self
    }

    pub fn add_directory(&mut self, path: impl Into<PathBuf>, readonly: bool) -> &mut Self {
        self.mounts.push(MountEntry::Directory {
            path: path.into(),
            readonly,
        });
        self
    }

    pub fn add_directory_at(
        &mut self,
        src: impl Into<PathBuf>,
        dst: impl Into<PathBuf>,
        readonly: bool,
    ) -> &mut Self {
        self.mounts.push(MountEntry::DirectoryAt {
            src: src.into(),
            dst: dst.into(),
            readonly,
        });
        self
    }

    pub fn add_fd_mapping(&mut self, local_fd: i32, remote_fd: i32, name: Option<String>) -> &mut Self {
        self.fd_mappings.push(FdMapping {
            local_fd,
            remote_fd,
            name,
        });
        self
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn set_cwd(&mut self, cwd: impl Into<String>) -> &mut Self {
        self.cwd = cwd.into();
        self
    }

    pub fn enable_network(&mut self, enabled: bool) -> &mut Self {
        self.namespace_flags.net = enabled;
        self
    }

    pub fn set_namespace_flags(&mut self, flags: NamespaceFlags) -> &mut Self {
        self.namespace_flags = flags;
        self
    }

    pub fn set_uid_gid(&mut self, uid: u32, gid: u32) -> &mut Self {
        self.uid_gid = UidGidMap { uid, gid };
        self
    }

    pub fn add_rlimit(&mut self, resource: impl Into<String>, soft: u64, hard: u64) -> &mut Self {
        self.rlimits.push(RlimitSpec {
            resource: resource.into(),
            soft,
            hard,
        });
        self
    }

    /// Sets the cgroup ceilings the confined child is joined to before it
    /// execs (`SPEC_FULL.md` §4.G). Left unset, the spawn gets no cgroup at
    /// all rather than an arbitrary default.
    pub fn set_resource_limits(&mut self, memory_bytes: u64, cpu_shares: u32, max_pids: u32) -> &mut Self {
        self.resources = Some(ResourceSpec {
            memory_bytes,
            cpu_shares,
            max_pids,
        });
        self
    }

    pub fn set_hostname(&mut self, hostname: impl Into<String>) -> &mut Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn set_graceful_exit(&mut self, graceful: bool) -> &mut Self {
        self.graceful_exit = graceful;
        self
    }

    /// Lowers the accumulated state into a [`SpawnRequest`], validating that
    /// fd mappings are collision-free and that every path this spawn wants
    /// bound into the sandboxee either exists on the host now or is one of
    /// the pseudo-paths the mount namespace itself creates
    /// (`SPEC_FULL.md` §4.G invariants).
    pub fn build(self) -> CapsuleResult<SpawnRequest> {
        let mut seen_remote_fds = HashSet::new();
        for mapping in &self.fd_mappings {
            if !seen_remote_fds.insert(mapping.remote_fd) {
                return Err(CapsuleError::InvalidArgument(format!(
                    "duplicate remote fd {} in fd mappings",
                    mapping.remote_fd
                )));
            }
        }

        for mount in &self.mounts {
            let source = mount.source();
            if !is_safe_mount_path(source) {
                return Err(CapsuleError::InvalidArgument(format!(
                    "mount source {} is not a safe path",
                    source.display()
                )));
            }
            if !source.exists() && !is_well_known(source) {
                return Err(CapsuleError::NotFound(format!(
                    "mount source {} does not exist",
                    source.display()
                )));
            }
        }

        let filter = self.policy.build()?;
        let has_notify_rules = filter.rules.iter().any(|r| matches!(r.action, policy::Action::Notify));
        let policy_bytes = serde_json::to_vec(&filter)
            .map_err(|e| CapsuleError::Internal(format!("failed to serialize policy: {}", e)))?;
        let mounts = self.mounts.into_iter().map(MountEntry::into_spec).collect();

        Ok(SpawnRequest {
            policy_bytes,
            fd_mappings: self.fd_mappings,
            env: self.env,
            cwd: self.cwd,
            namespace_flags: self.namespace_flags,
            uid_gid: self.uid_gid,
            rlimits: self.rlimits,
            mounts,
            resources: self.resources,
            hostname: self.hostname,
            rootfs_dir: self.rootfs_dir,
            graceful_exit: self.graceful_exit,
            has_notify_rules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_rejects_duplicate_remote_fds() {
        let mut builder = PolicyBuilder::new("/tmp/capsule-root");
        builder.add_fd_mapping(3, 3, Some("stdin".to_string()));
        builder.add_fd_mapping(4, 3, Some("stdout".to_string()));

        let err = builder.build().unwrap_err();
        assert!(matches!(err, CapsuleError::InvalidArgument(_)));
    }

    #[test]
    fn build_rejects_dangerous_mount_source() {
        let mut builder = PolicyBuilder::new("/tmp/capsule-root");
        builder.add_file("/etc/shadow", true);

        let err = builder.build().unwrap_err();
        assert!(matches!(err, CapsuleError::InvalidArgument(_)));
    }

    #[test]
    fn build_rejects_parent_dir_escape_in_mount_source() {
        let mut builder = PolicyBuilder::new("/tmp/capsule-root");
        builder.add_directory("/tmp/../etc", true);

        let err = builder.build().unwrap_err();
        assert!(matches!(err, CapsuleError::InvalidArgument(_)));
    }

    #[test]
    fn build_rejects_missing_mount_source() {
        let mut builder = PolicyBuilder::new("/tmp/capsule-root");
        builder.add_file("/definitely/not/a/real/path/on/this/host", true);

        let err = builder.build().unwrap_err();
        assert!(matches!(err, CapsuleError::NotFound(_)));
    }

    #[test]
    fn build_accepts_well_known_pseudo_paths() {
        let mut builder = PolicyBuilder::new("/tmp/capsule-root");
        builder.add_directory("/proc", true);
        builder.add_file("/dev/null", false);
        builder.with_policy(|p| p.allow_syscall_by_name("exit_group"));

        let request = builder.build().unwrap();
        assert_eq!(request.rootfs_dir, "/tmp/capsule-root");
        assert!(!request.policy_bytes.is_empty());
    }

    #[test]
    fn build_defaults_deny_network_and_enable_core_namespaces() {
        let mut builder = PolicyBuilder::new("/tmp/capsule-root");
        builder.with_policy(|p| p.allow_syscall_by_name("exit_group"));

        let request = builder.build().unwrap();
        assert!(!request.namespace_flags.net);
        assert!(request.namespace_flags.pid);
        assert!(request.namespace_flags.user);
    }
}
