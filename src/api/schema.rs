use serde::{Deserialize, Serialize};

/// Cgroup ceilings a spawn is joined to (`SPEC_FULL.md` §4.G), carried from
/// the CLI/config layer down into [`crate::sandbox::PolicyBuilder`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourceLimits {
    #[serde(default = "default_memory")]
    pub memory_bytes: u64,
    #[serde(default = "default_cpu_shares")]
    pub cpu_shares: u32,
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,
    #[serde(default = "default_max_pids")]
    pub max_pids: u32,
}

/// Filesystem and network isolation a spawn's mount namespace is assembled
/// from (`SPEC_FULL.md` §4.G).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IsolationConfig {
    #[serde(default = "default_network")]
    pub network: bool,
    #[serde(default)]
    pub readonly_paths: Vec<String>,
    #[serde(default)]
    pub writable_paths: Vec<String>,
    #[serde(default = "default_working_directory")]
    pub working_directory: String,
    #[serde(default)]
    pub bind_mounts: Vec<BindMount>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BindMount {
    pub source: String,
    pub destination: String,
    pub readonly: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: default_memory(),
            cpu_shares: default_cpu_shares(),
            max_output_bytes: default_max_output(),
            max_pids: default_max_pids(),
        }
    }
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            readonly_paths: vec![],
            writable_paths: vec![],
            working_directory: default_working_directory(),
            bind_mounts: vec![],
        }
    }
}

fn default_memory() -> u64 {
    268_435_456 // 256 MB
}

fn default_cpu_shares() -> u32 {
    1024
}

fn default_max_output() -> usize {
    1_048_576 // 1 MB
}

fn default_max_pids() -> u32 {
    100
}

fn default_network() -> bool {
    false
}

fn default_working_directory() -> String {
    "/workspace".to_string()
}
