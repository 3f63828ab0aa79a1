use super::{Action, CompareOp, Filter};
use crate::error::{CapsuleResult, SandboxError};
use libseccomp::{ScmpAction, ScmpArgCompare, ScmpCompareOp, ScmpFilterContext, ScmpSyscall};

/// Lowers a [`Filter`] into a loaded kernel seccomp-bpf program.
///
/// This is the only place in the crate that touches `libseccomp` directly;
/// everything upstream of it (`Builder`, [`super::disasm::disassemble`])
/// operates on the architecture-independent [`Filter`] IR so a policy can be
/// audited without a live kernel filter behind it.
pub fn compile(filter: &Filter) -> CapsuleResult<ScmpFilterContext> {
    let default_action = to_scmp_action(filter.default_action);
    let mut ctx = ScmpFilterContext::new_filter(default_action).map_err(|e| {
        SandboxError::SeccompSetup(format!("failed to create seccomp context: {}", e))
    })?;

    // Any syscall made from a non-native architecture (e.g. a 32-bit compat
    // call on an x86_64 process) is always killed, never left to fall through
    // to the configured default action.
    ctx.set_act_badarch(ScmpAction::KillProcess)
        .map_err(|e| SandboxError::SeccompSetup(format!("failed to set badarch action: {}", e)))?;

    for rule in &filter.rules {
        let action = to_scmp_action(rule.action);
        let syscall = ScmpSyscall::from(rule.nr as i32);

        if rule.predicates.is_empty() {
            ctx.add_rule(action, syscall).map_err(|e| {
                SandboxError::SeccompSetup(format!(
                    "failed to add rule for {} ({}): {}",
                    rule.name, rule.nr, e
                ))
            })?;
            continue;
        }

        let compares: Vec<ScmpArgCompare> = rule
            .predicates
            .iter()
            .map(|p| {
                let (op, value) = to_scmp_compare(p.op, p.value);
                ScmpArgCompare::new(p.arg_index as u32, op, value)
            })
            .collect();

        ctx.add_rule_conditional(action, syscall, &compares)
            .map_err(|e| {
                SandboxError::SeccompSetup(format!(
                    "failed to add conditional rule for {} ({}): {}",
                    rule.name, rule.nr, e
                ))
            })?;
    }

    ctx.load()
        .map_err(|e| SandboxError::SeccompSetup(format!("failed to load seccomp filter: {}", e)))?;

    Ok(ctx)
}

fn to_scmp_action(action: Action) -> ScmpAction {
    match action {
        Action::Allow => ScmpAction::Allow,
        Action::Errno(e) => ScmpAction::Errno(e as i32),
        Action::Trap(_) => ScmpAction::Trap,
        Action::Trace(d) => ScmpAction::Trace(d as u16),
        Action::Notify => ScmpAction::Notify,
        Action::Log => ScmpAction::Log,
        Action::Kill => ScmpAction::KillThread,
        Action::KillProcess => ScmpAction::KillProcess,
    }
}

fn to_scmp_compare(op: CompareOp, value: u64) -> (ScmpCompareOp, u64) {
    match op {
        CompareOp::Eq => (ScmpCompareOp::Equal, value),
        CompareOp::Ne => (ScmpCompareOp::NotEqual, value),
        CompareOp::Ge => (ScmpCompareOp::GreaterEqual, value),
        CompareOp::Lt => (ScmpCompareOp::Less, value),
        CompareOp::MaskedEq(mask) => (ScmpCompareOp::MaskedEqual(mask), value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Builder;

    // `compile` loads a real kernel filter via libseccomp, which requires
    // CAP_SYS_ADMIN or no_new_privs plumbing not available in a plain test
    // process; these are exercised in `tests/integration_tests.rs` under
    // `#[ignore]` instead. Here we only check the parts that don't touch the
    // kernel: action/op translation is total and panic-free.
    #[test]
    fn action_translation_is_total() {
        for action in [
            Action::Allow,
            Action::Errno(1),
            Action::Trap(0),
            Action::Trace(0),
            Action::Notify,
            Action::Log,
            Action::Kill,
            Action::KillProcess,
        ] {
            let _ = to_scmp_action(action);
        }
    }

    #[test]
    fn compare_translation_preserves_value() {
        let (_, value) = to_scmp_compare(CompareOp::Eq, 42);
        assert_eq!(value, 42);
        let (_, value) = to_scmp_compare(CompareOp::MaskedEq(0xff), 7);
        assert_eq!(value, 7);
    }

    #[test]
    #[ignore = "requires seccomp filter installation privileges"]
    fn compile_loads_a_minimal_filter() {
        let filter = Builder::new()
            .allow_syscall(libc::SYS_exit_group)
            .default_action(Action::KillProcess)
            .build()
            .unwrap();
        compile(&filter).unwrap();
    }
}
