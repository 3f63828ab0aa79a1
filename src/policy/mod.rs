//! Filter DSL and kernel filter compiler (component B, `SPEC_FULL.md` §4.B).
//!
//! [`Builder`] accumulates high-level rules; [`Builder::build`] lowers them
//! into a [`Filter`] — a small intermediate representation that is itself
//! auditable via [`disasm::disassemble`] and which [`compiler::compile`] turns
//! into a loaded kernel filter via `libseccomp`.

mod builder;
mod compiler;
mod disasm;

pub use builder::{Builder, SyscallClass};
pub use compiler::compile;
pub use disasm::disassemble;

use crate::error::{CapsuleError, CapsuleResult};
use serde::{Deserialize, Serialize};

pub const MAX_FILTER_RULES: usize = 4096;

/// Kernel-level decision a matched rule (or the default) resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Allow,
    Errno(u16),
    Trap(u16),
    Trace(u16),
    Notify,
    Log,
    Kill,
    KillProcess,
}

/// Comparison applied to one syscall argument register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Ge,
    Lt,
    MaskedEq(u64),
}

/// Restricts argument `arg_index` (0-based, `< 6`) of the matched syscall to
/// satisfy `op` against `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgPredicate {
    pub arg_index: u8,
    pub op: CompareOp,
    pub value: u64,
}

impl ArgPredicate {
    pub fn new(arg_index: u8, op: CompareOp, value: u64) -> CapsuleResult<Self> {
        if arg_index as usize >= crate::syscall::table::MAX_ARGS {
            return Err(CapsuleError::InvalidArgument(format!(
                "argument index {} out of range (max {})",
                arg_index,
                crate::syscall::table::MAX_ARGS - 1
            )));
        }
        Ok(Self {
            arg_index,
            op,
            value,
        })
    }
}

/// One dispatch entry of a compiled filter: syscall number, the (AND'd, in
/// registration order) predicates guarding it, and the action to take once
/// all predicates match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledRule {
    pub nr: i64,
    pub name: String,
    pub predicates: Vec<ArgPredicate>,
    pub action: Action,
}

/// A fully compiled, arch-bound filter program: component B's output.
///
/// Building one of these from a [`Builder`] is cheap and architecture
/// independent; turning it into a live kernel filter happens in
/// [`compiler::compile`], which is the only place that touches `libseccomp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub rules: Vec<CompiledRule>,
    pub default_action: Action,
}

impl Filter {
    /// Total instruction-equivalent length this filter would occupy once
    /// expanded to one dispatch + predicate block per rule. Used to reject
    /// filters that would overflow a kernel-imposed instruction budget before
    /// we ever call into `libseccomp`.
    pub fn estimated_length(&self) -> usize {
        // prologue (arch check) + one dispatch+predicate block per rule + trailer
        2 + self
            .rules
            .iter()
            .map(|r| 1 + r.predicates.len())
            .sum::<usize>()
            + 1
    }
}
