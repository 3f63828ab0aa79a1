//! Supervisor <-> helper protocol: pre-load a target once, hand out fresh
//! policy-confined children on demand (component F, `SPEC_FULL.md` §4.F).

mod protocol;
mod server;

pub use protocol::{
    FdMapping, MountSpec, NamespaceFlags, ResourceSpec, RlimitSpec, RPC_REMOTE_FD, SpawnRequest,
    SpawnResponse, UidGidMap,
};
pub use server::{ForkServerClient, ForkServerLoop};
