use super::{Action, CompareOp, Filter};

/// Renders a [`Filter`] as one line per rule, in dispatch order, followed by
/// the default action. This disassembles the crate's own IR, not decompiled
/// kernel BPF bytecode — `compile` is the only step that is lossy with
/// respect to this representation (predicate ordering within a kernel filter
/// can differ from registration order), so this is the authoritative view of
/// what a policy does.
pub fn disassemble(filter: &Filter) -> String {
    let mut lines = Vec::with_capacity(filter.rules.len() + 1);

    for rule in &filter.rules {
        let predicates = if rule.predicates.is_empty() {
            String::new()
        } else {
            let parts: Vec<String> = rule
                .predicates
                .iter()
                .map(|p| format!("a{} {} {:#x}", p.arg_index, op_symbol(p.op), p.value))
                .collect();
            format!(" if {}", parts.join(" && "))
        };
        lines.push(format!(
            "{} ({}){} -> {}",
            rule.name,
            rule.nr,
            predicates,
            action_name(rule.action)
        ));
    }

    lines.push(format!("* -> {}", action_name(filter.default_action)));
    lines.join("\n")
}

fn op_symbol(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "==",
        CompareOp::Ne => "!=",
        CompareOp::Ge => ">=",
        CompareOp::Lt => "<",
        CompareOp::MaskedEq(_) => "&==",
    }
}

fn action_name(action: Action) -> String {
    match action {
        Action::Allow => "ALLOW".to_string(),
        Action::Errno(e) => format!("ERRNO({})", e),
        Action::Trap(d) => format!("TRAP({})", d),
        Action::Trace(d) => format!("TRACE({})", d),
        Action::Notify => "NOTIFY".to_string(),
        Action::Log => "LOG".to_string(),
        Action::Kill => "KILL_THREAD".to_string(),
        Action::KillProcess => "KILL_PROCESS".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{ArgPredicate, Builder};

    #[test]
    fn disassemble_lists_rules_in_order_with_default_last() {
        let filter = Builder::new()
            .allow_syscall(libc::SYS_read)
            .allow_syscall(libc::SYS_write)
            .default_action(Action::KillProcess)
            .build()
            .unwrap();

        let text = disassemble(&filter);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("read"));
        assert!(lines[1].starts_with("write"));
        assert_eq!(lines[2], "* -> KILL_PROCESS");
    }

    #[test]
    fn disassemble_renders_predicates() {
        let filter = Builder::new()
            .add_policy_on_syscall(
                libc::SYS_socket,
                vec![ArgPredicate::new(0, CompareOp::Eq, libc::AF_UNIX as u64).unwrap()],
                Action::Allow,
            )
            .default_action(Action::KillProcess)
            .build()
            .unwrap();

        let text = disassemble(&filter);
        assert!(text.contains("if a0 =="));
    }
}
