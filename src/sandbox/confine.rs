//! Lowers a [`SpawnRequest`] into a confined process (component G's runtime
//! half, `SPEC_FULL.md` §4.G). This is the `apply_policy` callback
//! [`crate::forkserver::ForkServerLoop`] invokes in the already-forked child,
//! after fd remapping and before it starts serving RPC — everything here
//! runs once, in that single process, with no further fork.
//!
//! Reuses the teacher's per-concern managers (`NamespaceManager`,
//! `FilesystemManager`, `CgroupManager`) the same way [`super::Sandbox::setup`]
//! does, but skips [`super::NamespaceManager::enter_namespaces`]'s internal
//! double-fork: the forkserver already forked this exact process, and the
//! monitor (H/I) attaches to the pid the parent observed from that fork, so a
//! second one here would confine the wrong process.

use super::{CgroupManager, FilesystemManager, NamespaceManager};
use crate::api::schema::{BindMount, IsolationConfig, ResourceLimits};
use crate::error::{CapsuleError, CapsuleResult, SandboxError};
use crate::forkserver::{MountSpec, SpawnRequest};
use crate::policy::Filter;
use std::os::fd::RawFd;

/// Applies every privileged setup step `request` describes to the calling
/// process, in the order the kernel requires: namespaces before mounts
/// before the final seccomp filter (which must be last, since nothing after
/// it can assume new syscalls are still available). Returns the seccomp
/// user-notification fd the kernel assigned the loaded filter, if
/// `request.has_notify_rules` asked for one — the forkserver child forwards
/// it to the supervisor over the RPC channel before serving (`SPEC_FULL.md`
/// §4.I).
pub fn apply(request: &SpawnRequest) -> CapsuleResult<Option<RawFd>> {
    let namespace_manager = NamespaceManager::new();
    namespace_manager.setup_namespaces(request.namespace_flags.net)?;

    let execution_id = uuid::Uuid::new_v4();

    if !request.mounts.is_empty() || request.cwd != "/" {
        let filesystem_manager = FilesystemManager::new(execution_id)?;
        filesystem_manager.setup_isolation(&isolation_config(request))?;
    }

    if let Some(resources) = &request.resources {
        let cgroup_manager = CgroupManager::new(execution_id)?;
        cgroup_manager.setup(&ResourceLimits {
            memory_bytes: resources.memory_bytes,
            cpu_shares: resources.cpu_shares,
            max_output_bytes: 0,
            max_pids: resources.max_pids,
        })?;
    }

    apply_rlimits(request)?;
    drop_capabilities()?;

    if let Some(hostname) = &request.hostname {
        nix::unistd::sethostname(hostname)
            .map_err(|e| CapsuleError::Syscall(format!("sethostname failed: {}", e)))?;
    }

    #[cfg(feature = "seccomp")]
    let notify_fd = {
        let filter: Filter = serde_json::from_slice(&request.policy_bytes)
            .map_err(|e| CapsuleError::Internal(format!("malformed policy bytes: {}", e)))?;
        let ctx = crate::policy::compile(&filter)?;
        if request.has_notify_rules {
            Some(
                ctx.get_notify_fd()
                    .map_err(|e| SandboxError::SeccompSetup(format!("failed to retrieve notify fd: {}", e)))?,
            )
        } else {
            None
        }
    };
    #[cfg(not(feature = "seccomp"))]
    let notify_fd = {
        let _: &[u8] = &request.policy_bytes;
        None
    };

    Ok(notify_fd)
}

/// `PolicyBuilder`'s accumulated `MountSpec`s translated into the shape
/// `FilesystemManager::setup_isolation` already knows how to mount
/// (`SPEC_FULL.md` §4.G). A bare `File` entry is bound at the same path
/// inside and outside the sandboxee, matching how `PolicyBuilder::add_file`
/// is documented: callers wanting a different destination use
/// `add_directory_at`'s file-level equivalent by pre-splitting the path.
fn isolation_config(request: &SpawnRequest) -> IsolationConfig {
    let mut readonly_paths = Vec::new();
    let mut writable_paths = Vec::new();
    let mut bind_mounts = Vec::new();

    for mount in &request.mounts {
        match mount {
            MountSpec::Directory { path, readonly: true } => readonly_paths.push(path.clone()),
            MountSpec::Directory { path, readonly: false } => writable_paths.push(path.clone()),
            MountSpec::File { path, readonly } => bind_mounts.push(BindMount {
                source: path.clone(),
                destination: path.clone(),
                readonly: *readonly,
            }),
            MountSpec::DirectoryAt { src, dst, readonly } => bind_mounts.push(BindMount {
                source: src.clone(),
                destination: dst.clone(),
                readonly: *readonly,
            }),
        }
    }

    IsolationConfig {
        network: request.namespace_flags.net,
        readonly_paths,
        writable_paths,
        working_directory: request.cwd.clone(),
        bind_mounts,
    }
}

fn apply_rlimits(request: &SpawnRequest) -> CapsuleResult<()> {
    for spec in &request.rlimits {
        let resource = resource_from_name(&spec.resource)?;
        let limit = libc::rlimit {
            rlim_cur: spec.soft,
            rlim_max: spec.hard,
        };
        // SAFETY: `limit` is a valid, fully-initialized `rlimit` and
        // `resource` is one of the `RLIMIT_*` constants `setrlimit` expects.
        if unsafe { libc::setrlimit(resource, &limit) } != 0 {
            return Err(CapsuleError::Syscall(format!(
                "setrlimit({}) failed: {}",
                spec.resource,
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

fn resource_from_name(name: &str) -> CapsuleResult<u32> {
    match name {
        "as" | "address_space" => Ok(libc::RLIMIT_AS),
        "cpu" => Ok(libc::RLIMIT_CPU),
        "fsize" => Ok(libc::RLIMIT_FSIZE),
        "nofile" => Ok(libc::RLIMIT_NOFILE),
        "nproc" => Ok(libc::RLIMIT_NPROC),
        "core" => Ok(libc::RLIMIT_CORE),
        "stack" => Ok(libc::RLIMIT_STACK),
        "data" => Ok(libc::RLIMIT_DATA),
        other => Err(CapsuleError::InvalidArgument(format!(
            "unknown rlimit resource: {}",
            other
        ))),
    }
}

/// Same clear-all-capability-sets approach as [`super::Sandbox::drop_capabilities`],
/// pulled out standalone since this module has no `Sandbox` instance to hang
/// it off of.
fn drop_capabilities() -> CapsuleResult<()> {
    use caps::{clear, CapSet};

    clear(None, CapSet::Effective)
        .map_err(|e| SandboxError::CapabilityDrop(format!("failed to clear effective capabilities: {}", e)))?;
    clear(None, CapSet::Permitted)
        .map_err(|e| SandboxError::CapabilityDrop(format!("failed to clear permitted capabilities: {}", e)))?;
    clear(None, CapSet::Inheritable)
        .map_err(|e| SandboxError::CapabilityDrop(format!("failed to clear inheritable capabilities: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forkserver::{NamespaceFlags, UidGidMap};
    use std::collections::HashMap;

    fn empty_request() -> SpawnRequest {
        SpawnRequest {
            policy_bytes: serde_json::to_vec(&Filter {
                rules: Vec::new(),
                default_action: crate::policy::Action::KillProcess,
            })
            .unwrap(),
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
        }
    }

    #[test]
    fn resource_from_name_rejects_unknown_resource() {
        assert!(resource_from_name("not_a_real_limit").is_err());
    }

    #[test]
    fn resource_from_name_accepts_known_resources() {
        assert!(resource_from_name("nofile").is_ok());
        assert!(resource_from_name("as").is_ok());
    }

    #[test]
    fn isolation_config_splits_mounts_by_kind() {
        let mut request = empty_request();
        request.mounts = vec![
            MountSpec::Directory { path: "/usr".to_string(), readonly: true },
            MountSpec::Directory { path: "/workspace".to_string(), readonly: false },
            MountSpec::File { path: "/etc/resolv.conf".to_string(), readonly: true },
        ];
        let config = isolation_config(&request);
        assert_eq!(config.readonly_paths, vec!["/usr".to_string()]);
        assert_eq!(config.writable_paths, vec!["/workspace".to_string()]);
        assert_eq!(config.bind_mounts.len(), 1);
    }
}
