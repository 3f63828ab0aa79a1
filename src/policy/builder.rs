use super::{Action, ArgPredicate, CompiledRule, Filter, MAX_FILTER_RULES};
use crate::error::{CapsuleError, CapsuleResult};
use crate::syscall::SyscallTable;
use std::collections::HashSet;

/// Convenience expansions for common syscall groups, each a fixed list of
/// syscall numbers for the target architecture (`SPEC_FULL.md` §4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyscallClass {
    Read,
    Write,
    Open,
    Stat,
    SystemMalloc,
    Exit,
    Time,
    Pipe,
    Dup,
    Sleep,
    Getrandom,
    HandleSignals,
}

impl SyscallClass {
    fn syscalls(self) -> &'static [i64] {
        match self {
            SyscallClass::Read => &[libc::SYS_read, libc::SYS_readv, libc::SYS_pread64],
            SyscallClass::Write => &[libc::SYS_write, libc::SYS_writev, libc::SYS_pwrite64],
            SyscallClass::Open => &[libc::SYS_open, libc::SYS_openat, libc::SYS_close],
            SyscallClass::Stat => &[libc::SYS_stat, libc::SYS_fstat, libc::SYS_lstat, libc::SYS_newfstatat],
            SyscallClass::SystemMalloc => &[libc::SYS_mmap, libc::SYS_munmap, libc::SYS_mprotect, libc::SYS_brk],
            SyscallClass::Exit => &[libc::SYS_exit, libc::SYS_exit_group],
            SyscallClass::Time => &[libc::SYS_clock_gettime, libc::SYS_gettimeofday],
            SyscallClass::Pipe => &[libc::SYS_pipe, libc::SYS_pipe2],
            SyscallClass::Dup => &[libc::SYS_dup, libc::SYS_dup2, libc::SYS_dup3],
            SyscallClass::Sleep => &[libc::SYS_nanosleep, libc::SYS_clock_nanosleep],
            SyscallClass::Getrandom => &[libc::SYS_getrandom],
            SyscallClass::HandleSignals => &[
                libc::SYS_rt_sigaction,
                libc::SYS_rt_sigprocmask,
                libc::SYS_rt_sigreturn,
                libc::SYS_sigaltstack,
            ],
        }
    }
}

enum Rule {
    Allow(i64),
    AllowByName(String),
    AddPolicy {
        nr: i64,
        predicates: Vec<ArgPredicate>,
        action: Action,
    },
    AllowClass(SyscallClass),
}

/// Accumulates policy rules and lowers them into a [`Filter`] via
/// [`Builder::build`]. Mirrors the `PolicyBuilder`-style accumulate-then-build
/// pattern the rest of this crate already uses for filesystem/namespace setup.
#[derive(Default)]
pub struct Builder {
    rules: Vec<Rule>,
    default_action: Option<Action>,
    danger_allow_all: bool,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_syscall(mut self, nr: i64) -> Self {
        self.rules.push(Rule::Allow(nr));
        self
    }

    pub fn allow_syscall_by_name(mut self, name: impl Into<String>) -> Self {
        self.rules.push(Rule::AllowByName(name.into()));
        self
    }

    pub fn allow_syscalls(mut self, nrs: impl IntoIterator<Item = i64>) -> Self {
        for nr in nrs {
            self.rules.push(Rule::Allow(nr));
        }
        self
    }

    pub fn block_syscall_with_errno(mut self, nr: i64, errno: u16) -> Self {
        self.rules.push(Rule::AddPolicy {
            nr,
            predicates: Vec::new(),
            action: Action::Errno(errno),
        });
        self
    }

    pub fn add_policy_on_syscall(
        mut self,
        nr: i64,
        predicates: Vec<ArgPredicate>,
        action: Action,
    ) -> Self {
        self.rules.push(Rule::AddPolicy {
            nr,
            predicates,
            action,
        });
        self
    }

    pub fn allow_unrestricted_class(mut self, class: SyscallClass) -> Self {
        self.rules.push(Rule::AllowClass(class));
        self
    }

    /// Opts out of default-deny entirely. Named loudly on purpose: this is
    /// the one `Builder` call that can make a policy meaningless.
    pub fn danger_default_allow_all(mut self) -> Self {
        self.danger_allow_all = true;
        self
    }

    pub fn default_action(mut self, action: Action) -> Self {
        self.default_action = Some(action);
        self
    }

    /// Lowers accumulated rules into a [`Filter`], failing with
    /// `InvalidArgument` when a rule names an unknown syscall, two rules
    /// contradict at the same `(nr, predicate)` prefix, or the filter would
    /// exceed [`MAX_FILTER_RULES`].
    pub fn build(self) -> CapsuleResult<Filter> {
        let table = SyscallTable::for_x86_64();
        let default_action = if self.danger_allow_all {
            Action::Allow
        } else {
            self.default_action.unwrap_or(Action::KillProcess)
        };

        let mut compiled = Vec::new();
        for rule in self.rules {
            match rule {
                Rule::Allow(nr) => compiled.push(CompiledRule {
                    nr,
                    name: table.lookup(nr).name.to_string(),
                    predicates: Vec::new(),
                    action: Action::Allow,
                }),
                Rule::AllowByName(name) => {
                    let nr = table.lookup_by_name(&name).ok_or_else(|| {
                        CapsuleError::InvalidArgument(format!("unknown syscall name: {}", name))
                    })?;
                    compiled.push(CompiledRule {
                        nr,
                        name,
                        predicates: Vec::new(),
                        action: Action::Allow,
                    });
                }
                Rule::AddPolicy {
                    nr,
                    predicates,
                    action,
                } => compiled.push(CompiledRule {
                    nr,
                    name: table.lookup(nr).name.to_string(),
                    predicates,
                    action,
                }),
                Rule::AllowClass(class) => {
                    for &nr in class.syscalls() {
                        compiled.push(CompiledRule {
                            nr,
                            name: table.lookup(nr).name.to_string(),
                            predicates: Vec::new(),
                            action: Action::Allow,
                        });
                    }
                }
            }
        }

        detect_contradictions(&compiled)?;

        let filter = Filter {
            rules: compiled,
            default_action,
        };

        if filter.estimated_length() > MAX_FILTER_RULES {
            return Err(CapsuleError::InvalidArgument(format!(
                "policy has {} instructions, exceeding the maximum of {}",
                filter.estimated_length(),
                MAX_FILTER_RULES
            )));
        }

        Ok(filter)
    }
}

/// Two *unconditional* rules for the same syscall with different actions can
/// never both take effect — whichever is dispatched first wins silently.
/// That is almost always a policy-authoring mistake, so `build()` rejects it
/// rather than keeping only the first.
fn detect_contradictions(rules: &[CompiledRule]) -> CapsuleResult<()> {
    let mut seen: HashSet<i64> = HashSet::new();
    let mut unconditional_action: std::collections::HashMap<i64, Action> = std::collections::HashMap::new();

    for rule in rules {
        if rule.predicates.is_empty() {
            if let Some(&existing) = unconditional_action.get(&rule.nr) {
                if existing != rule.action {
                    return Err(CapsuleError::InvalidArgument(format!(
                        "contradictory unconditional rules for syscall {} ({}): {:?} vs {:?}",
                        rule.nr, rule.name, existing, rule.action
                    )));
                }
            }
            unconditional_action.insert(rule.nr, rule.action);
        }
        seen.insert(rule.nr);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::CompareOp;

    #[test]
    fn build_allows_unrestricted_classes() {
        let filter = Builder::new()
            .allow_unrestricted_class(SyscallClass::Read)
            .allow_unrestricted_class(SyscallClass::Exit)
            .default_action(Action::KillProcess)
            .build()
            .unwrap();

        assert!(filter.rules.iter().any(|r| r.nr == libc::SYS_read));
        assert!(filter.rules.iter().any(|r| r.nr == libc::SYS_exit));
        assert_eq!(filter.default_action, Action::KillProcess);
    }

    #[test]
    fn build_rejects_contradictory_rules() {
        let err = Builder::new()
            .allow_syscall(libc::SYS_ptrace)
            .block_syscall_with_errno(libc::SYS_ptrace, libc::EPERM as u16)
            .build();
        assert!(err.is_err());
    }

    #[test]
    fn build_rejects_unknown_syscall_name() {
        let err = Builder::new()
            .allow_syscall_by_name("definitely_not_a_syscall")
            .build();
        assert!(err.is_err());
    }

    #[test]
    fn conditional_rules_for_same_syscall_do_not_contradict() {
        let filter = Builder::new()
            .add_policy_on_syscall(
                libc::SYS_socket,
                vec![ArgPredicate::new(0, CompareOp::Eq, libc::AF_UNIX as u64).unwrap()],
                Action::Allow,
            )
            .add_policy_on_syscall(
                libc::SYS_socket,
                vec![ArgPredicate::new(0, CompareOp::Eq, libc::AF_INET as u64).unwrap()],
                Action::Errno(libc::EACCES as u16),
            )
            .default_action(Action::KillProcess)
            .build()
            .unwrap();
        assert_eq!(filter.rules.len(), 2);
    }

    #[test]
    fn danger_allow_all_overrides_default() {
        let filter = Builder::new().danger_default_allow_all().build().unwrap();
        assert_eq!(filter.default_action, Action::Allow);
    }
}
