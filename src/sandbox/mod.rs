#[cfg(target_os = "linux")]
pub mod assembly;
#[cfg(target_os = "linux")]
pub mod cgroups;
#[cfg(target_os = "linux")]
pub mod confine;
#[cfg(target_os = "linux")]
pub mod filesystem;
#[cfg(target_os = "linux")]
pub mod namespaces;

#[cfg(target_os = "linux")]
pub use assembly::PolicyBuilder;
#[cfg(target_os = "linux")]
pub use cgroups::{CgroupManager, ResourceUsage};
#[cfg(target_os = "linux")]
pub use confine::apply as confine_spawned_child;
#[cfg(target_os = "linux")]
pub use filesystem::FilesystemManager;
#[cfg(target_os = "linux")]
pub use namespaces::NamespaceManager;

// The namespace/cgroup/seccomp machinery in this module talks directly to
// Linux-only kernel interfaces (user namespaces, cgroup v2, libseccomp); a
// sandboxed run has no meaning on a platform without them, so there is no
// stub fallback here.
