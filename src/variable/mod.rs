//! Typed wrappers that marshal host values to/from sandboxee memory using
//! [`crate::rpc`] (component E, `SPEC_FULL.md` §4.E).

mod scalar;

pub use scalar::{FdVar, FixedArrayVar, FloatVar, IntVar, LengthValue, PtrVar, StructVar};

use crate::error::CapsuleResult;
use crate::rpc::{RemoteAddr, RpcChannel};

/// Sync direction for a pointer argument around a remote call
/// (`SPEC_FULL.md` §4.E): whether the host value is pushed to the sandboxee
/// before the call, pulled back after, both, or neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Before,
    After,
    Both,
    None,
}

impl SyncDirection {
    pub fn syncs_before(self) -> bool {
        matches!(self, SyncDirection::Before | SyncDirection::Both)
    }

    pub fn syncs_after(self) -> bool {
        matches!(self, SyncDirection::After | SyncDirection::Both)
    }
}

/// Common interface every typed remote variable implements. `Variable`
/// objects are created by the application; allocation happens lazily or
/// eagerly depending on the call site, and is always paired with exactly one
/// `free` unless ownership is explicitly transferred away
/// (`SPEC_FULL.md` §3 invariant).
pub trait Variable {
    /// Size in bytes of the buffer this variable needs in the sandboxee.
    fn remote_size(&self) -> u64;

    /// The variable's current remote address, if it has been allocated.
    fn remote_addr(&self) -> Option<RemoteAddr>;

    /// Serializes the host-side value into wire bytes for `write_memory`.
    fn serialize(&self) -> Vec<u8>;

    /// Deserializes wire bytes read back from the sandboxee into the
    /// host-side value.
    fn deserialize(&mut self, bytes: &[u8]) -> CapsuleResult<()>;

    /// Whether this variable owns its remote buffer and must free it on
    /// drop/explicit release.
    fn owns_remote(&self) -> bool;
}

/// Allocates (if not already allocated) and writes the current host value of
/// `var` into the sandboxee.
pub fn transfer_to_sandboxee(rpc: &RpcChannel, var: &mut dyn AllocatingVariable) -> CapsuleResult<RemoteAddr> {
    let addr = match var.remote_addr() {
        Some(addr) => addr,
        None => {
            let addr = rpc.allocate(var.remote_size())?;
            var.set_remote_addr(addr, true);
            addr
        }
    };
    let bytes = var.serialize();
    rpc.write_memory(addr, &bytes)?;
    rpc.mark_memory_initialized(addr, bytes.len() as u64)?;
    Ok(addr)
}

/// Reads the sandboxee's current buffer for `var` back into the host value.
pub fn transfer_from_sandboxee(rpc: &RpcChannel, var: &mut dyn AllocatingVariable) -> CapsuleResult<()> {
    let addr = var
        .remote_addr()
        .ok_or_else(|| crate::error::CapsuleError::FailedPrecondition(
            "cannot transfer from sandboxee: variable has no remote buffer".to_string(),
        ))?;
    let bytes = rpc.read_memory(addr, var.remote_size())?;
    var.deserialize(&bytes)
}

/// Frees a variable's remote buffer exactly once. Calling this twice is a
/// `FailedPrecondition` (`SPEC_FULL.md` §8 quantified invariants).
pub fn free(rpc: &RpcChannel, var: &mut dyn AllocatingVariable) -> CapsuleResult<()> {
    match var.remote_addr() {
        Some(addr) if var.owns_remote() => {
            rpc.free(addr)?;
            var.clear_remote_addr();
            Ok(())
        }
        Some(_) => {
            var.clear_remote_addr();
            Ok(())
        }
        None => Err(crate::error::CapsuleError::FailedPrecondition(
            "variable has no remote buffer to free".to_string(),
        )),
    }
}

/// Extension of [`Variable`] for types that participate in allocate/transfer
/// lifecycle management via module-level free functions — split out so
/// `Variable` itself stays object-safe for read-only describe/format paths
/// (`crate::syscall`) that never need to mutate remote state.
pub trait AllocatingVariable: Variable {
    fn set_remote_addr(&mut self, addr: RemoteAddr, owned: bool);
    fn clear_remote_addr(&mut self);
}
