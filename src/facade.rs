//! High-level call facade (component L, `SPEC_FULL.md` §4.L): the
//! convenience surface most callers use instead of driving a [`Session`]
//! directly — symbol lookup, typed remote calls, and one-shot buffer
//! transfer, all delegating straight through to components D/E/J.

use crate::error::CapsuleResult;
use crate::rpc::{CallArg, FunctionCallDescriptor, FunctionReturn, RemoteAddr, SymbolRef, TypeTag};
use crate::session::Session;
use crate::variable::AllocatingVariable;

/// Thin ergonomic wrapper over an active [`Session`]. Every method here has
/// a direct, lower-level equivalent on `Session`/`RpcChannel`; this type
/// exists purely to spell out the common call shape once
/// (`SPEC_FULL.md` §4.L).
pub struct Facade<'a> {
    session: &'a Session,
}

impl<'a> Facade<'a> {
    pub fn new(session: &'a Session) -> Self {
        Self { session }
    }

    pub fn symbol(&self, name: &str) -> CapsuleResult<RemoteAddr> {
        self.session.symbol(name)
    }

    /// Calls a remote function by name with integer/float/pointer/fd
    /// arguments already encoded as [`CallArg`]s, returning its typed
    /// result.
    pub fn call(&self, name: &str, return_type: TypeTag, args: Vec<CallArg>) -> CapsuleResult<FunctionReturn> {
        let descriptor = FunctionCallDescriptor::new(SymbolRef::Name(name.to_string()), return_type, args)?;
        self.session.call(&descriptor)
    }

    /// Calls a remote function at an already-resolved address, e.g. the
    /// result of a prior [`Facade::symbol`] lookup — avoids re-resolving the
    /// same symbol on every call in a hot loop.
    pub fn call_at(&self, addr: RemoteAddr, return_type: TypeTag, args: Vec<CallArg>) -> CapsuleResult<FunctionReturn> {
        let descriptor = FunctionCallDescriptor::new(SymbolRef::Addr(addr), return_type, args)?;
        self.session.call(&descriptor)
    }

    pub fn allocate(&self, var: &mut dyn AllocatingVariable, auto_free: bool) -> CapsuleResult<RemoteAddr> {
        self.session.allocate(var, auto_free)
    }

    pub fn free(&self, var: &mut dyn AllocatingVariable) -> CapsuleResult<()> {
        self.session.free(var)
    }

    pub fn transfer_to_sandboxee(&self, var: &mut dyn AllocatingVariable) -> CapsuleResult<RemoteAddr> {
        self.session.transfer_to_sandboxee(var)
    }

    pub fn transfer_from_sandboxee(&self, var: &mut dyn AllocatingVariable) -> CapsuleResult<()> {
        self.session.transfer_from_sandboxee(var)
    }

    pub fn allocate_and_transfer_to_sandboxee(&self, bytes: &[u8]) -> CapsuleResult<RemoteAddr> {
        self.session.allocate_and_transfer_to_sandboxee(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CapsuleError;

    #[test]
    fn call_rejects_too_many_arguments_before_touching_the_session() {
        use crate::comms::Channel;
        use crate::forkserver::{ForkServerClient, NamespaceFlags, SpawnRequest, UidGidMap};
        use std::collections::HashMap;
        use std::time::Duration;

        let (_a, helper_side) = Channel::pair().unwrap();
        let forkserver = ForkServerClient::new(helper_side, Duration::from_millis(50));
        let request = SpawnRequest {
            policy_bytes: Vec::new(),
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
        };
        let session = Session::new(forkserver, request, false);
        let facade = Facade::new(&session);

        let args = vec![CallArg::int(0); crate::rpc::MAX_CALL_ARGS + 1];
        let err = facade.call("f", TypeTag::Void, args).unwrap_err();
        assert!(matches!(err, CapsuleError::InvalidArgument(_)));
    }
}
