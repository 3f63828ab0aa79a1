use std::ffi::CStr;

/// Semantic type of a syscall argument, used to pick a diagnostic formatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Generic,
    Int,
    Path,
    Hex,
    Octal,
    Signal,
    String,
    AddressFamily,
    Sockaddr,
    SockMsgHdr,
    CloneFlag,
}

pub const MAX_ARGS: usize = 6;

#[derive(Debug, Clone, Copy)]
pub struct SyscallEntry {
    pub nr: i64,
    pub name: &'static str,
    pub arg_count: usize,
    pub arg_types: [ArgType; MAX_ARGS],
}

impl SyscallEntry {
    const fn new(nr: i64, name: &'static str, arg_count: usize, arg_types: [ArgType; MAX_ARGS]) -> Self {
        Self {
            nr,
            name,
            arg_count,
            arg_types,
        }
    }

    /// Renders `args` (raw register words) into human-readable strings, one per
    /// declared argument. `read_path_or_string` is invoked for `Path`/`String`
    /// typed arguments to resolve the bytes they point at inside the
    /// sandboxee; callers that cannot read remote memory (e.g. a disassembler
    /// with no live session) may pass a reader that always returns `None`.
    pub fn describe_args(
        &self,
        args: &[u64; MAX_ARGS],
        mut read_remote_cstr: impl FnMut(u64) -> Option<Vec<u8>>,
    ) -> Vec<String> {
        (0..self.arg_count.min(MAX_ARGS))
            .map(|i| self.format_arg(self.arg_types[i], args[i], &mut read_remote_cstr))
            .collect()
    }

    fn format_arg(
        &self,
        ty: ArgType,
        value: u64,
        read_remote_cstr: &mut impl FnMut(u64) -> Option<Vec<u8>>,
    ) -> String {
        match ty {
            ArgType::Generic | ArgType::Int => format!("{}", value as i64),
            ArgType::Hex => format!("{:#x}", value),
            ArgType::Octal => format!("{:#o}", value),
            ArgType::Signal => signal_name(value as i32).to_string(),
            ArgType::AddressFamily => format!("AF({})", value),
            ArgType::CloneFlag => format!("{:#x}", value),
            ArgType::Sockaddr | ArgType::SockMsgHdr => format!("{:#x}", value),
            ArgType::Path | ArgType::String => match read_remote_cstr(value) {
                Some(bytes) => format!("\"{}\"", escape_bytes(&bytes)),
                None => "[unreadable]".to_string(),
            },
        }
    }
}

fn escape_bytes(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    bytes[..end]
        .iter()
        .flat_map(|&b| std::ascii::escape_default(b))
        .map(|b| b as char)
        .collect()
}

fn signal_name(sig: i32) -> &'static str {
    match sig {
        1 => "SIGHUP",
        2 => "SIGINT",
        6 => "SIGABRT",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        15 => "SIGTERM",
        17 => "SIGCHLD",
        31 => "SIGSYS",
        _ => "SIGUNKNOWN",
    }
}

/// Maximum length (in bytes) of a CStr we will ever pull across the RPC
/// channel for diagnostics; longer strings are truncated, never aborted.
pub const MAX_REMOTE_STRING_LEN: usize = 256;

/// Truncates and NUL-terminates a byte buffer read from the sandboxee for
/// safe use as a diagnostic `&str`.
pub fn remote_bytes_to_display(bytes: &[u8]) -> String {
    let capped = &bytes[..bytes.len().min(MAX_REMOTE_STRING_LEN)];
    match CStr::from_bytes_until_nul(capped) {
        Ok(s) => escape_bytes(s.to_bytes()),
        Err(_) => escape_bytes(capped),
    }
}

use ArgType::{
    AddressFamily, CloneFlag, Generic, Hex, Int, Octal, Path, Signal, Sockaddr, SockMsgHdr,
};

macro_rules! entry {
    ($nr:expr, $name:expr) => {
        SyscallEntry::new($nr, $name, 0, [Generic; MAX_ARGS])
    };
    ($nr:expr, $name:expr, [$($t:expr),+ $(,)?]) => {{
        let types = [$($t),+];
        let count = types.len();
        let mut full = [Generic; MAX_ARGS];
        let mut i = 0;
        while i < count {
            full[i] = types[i];
            i += 1;
        }
        SyscallEntry::new($nr, $name, count, full)
    }};
}

/// A hand-maintained subset of the x86_64 Linux syscall table covering the
/// syscalls this crate's policies allow or reason about. Anything not listed
/// here resolves to [`SyscallTable::lookup`]'s synthetic `UNKNOWN[n]` entry.
static X86_64_ENTRIES: &[SyscallEntry] = &[
    entry!(libc::SYS_read, "read", [Int, Generic, Int]),
    entry!(libc::SYS_write, "write", [Int, Generic, Int]),
    entry!(libc::SYS_open, "open", [Path, Octal, Octal]),
    entry!(libc::SYS_close, "close", [Int]),
    entry!(libc::SYS_stat, "stat", [Path, Generic]),
    entry!(libc::SYS_fstat, "fstat", [Int, Generic]),
    entry!(libc::SYS_lstat, "lstat", [Path, Generic]),
    entry!(libc::SYS_poll, "poll", [Generic, Int, Int]),
    entry!(libc::SYS_lseek, "lseek", [Int, Int, Int]),
    entry!(libc::SYS_mmap, "mmap", [Generic, Int, Hex, Hex, Int, Int]),
    entry!(libc::SYS_mprotect, "mprotect", [Generic, Int, Hex]),
    entry!(libc::SYS_munmap, "munmap", [Generic, Int]),
    entry!(libc::SYS_brk, "brk", [Generic]),
    entry!(libc::SYS_rt_sigaction, "rt_sigaction", [Signal, Generic, Generic]),
    entry!(libc::SYS_rt_sigprocmask, "rt_sigprocmask", [Int, Generic, Generic]),
    entry!(libc::SYS_rt_sigreturn, "rt_sigreturn"),
    entry!(libc::SYS_ioctl, "ioctl", [Int, Hex, Generic]),
    entry!(libc::SYS_pread64, "pread64", [Int, Generic, Int, Int]),
    entry!(libc::SYS_pwrite64, "pwrite64", [Int, Generic, Int, Int]),
    entry!(libc::SYS_readv, "readv", [Int, Generic, Int]),
    entry!(libc::SYS_writev, "writev", [Int, Generic, Int]),
    entry!(libc::SYS_access, "access", [Path, Octal]),
    entry!(libc::SYS_pipe, "pipe", [Generic]),
    entry!(libc::SYS_select, "select", [Int, Generic, Generic, Generic, Generic]),
    entry!(libc::SYS_sched_yield, "sched_yield"),
    entry!(libc::SYS_dup, "dup", [Int]),
    entry!(libc::SYS_dup2, "dup2", [Int, Int]),
    entry!(libc::SYS_nanosleep, "nanosleep", [Generic, Generic]),
    entry!(libc::SYS_getpid, "getpid"),
    entry!(libc::SYS_socket, "socket", [AddressFamily, Int, Int]),
    entry!(libc::SYS_connect, "connect", [Int, Sockaddr, Int]),
    entry!(libc::SYS_accept, "accept", [Int, Sockaddr, Generic]),
    entry!(libc::SYS_sendto, "sendto", [Int, Generic, Int, Hex, Sockaddr, Int]),
    entry!(libc::SYS_recvfrom, "recvfrom", [Int, Generic, Int, Hex, Sockaddr, Generic]),
    entry!(libc::SYS_sendmsg, "sendmsg", [Int, SockMsgHdr, Hex]),
    entry!(libc::SYS_recvmsg, "recvmsg", [Int, SockMsgHdr, Hex]),
    entry!(libc::SYS_shutdown, "shutdown", [Int, Int]),
    entry!(libc::SYS_bind, "bind", [Int, Sockaddr, Int]),
    entry!(libc::SYS_listen, "listen", [Int, Int]),
    entry!(libc::SYS_clone, "clone", [CloneFlag, Generic, Generic, Generic, Generic]),
    entry!(libc::SYS_fork, "fork"),
    entry!(libc::SYS_execve, "execve", [Path, Generic, Generic]),
    entry!(libc::SYS_exit, "exit", [Int]),
    entry!(libc::SYS_wait4, "wait4", [Int, Generic, Int, Generic]),
    entry!(libc::SYS_kill, "kill", [Int, Signal]),
    entry!(libc::SYS_fcntl, "fcntl", [Int, Hex, Generic]),
    entry!(libc::SYS_ftruncate, "ftruncate", [Int, Int]),
    entry!(libc::SYS_getdents64, "getdents64", [Int, Generic, Int]),
    entry!(libc::SYS_getcwd, "getcwd", [Generic, Int]),
    entry!(libc::SYS_chdir, "chdir", [Path]),
    entry!(libc::SYS_mkdir, "mkdir", [Path, Octal]),
    entry!(libc::SYS_unlink, "unlink", [Path]),
    entry!(libc::SYS_rename, "rename", [Path, Path]),
    entry!(libc::SYS_fchmod, "fchmod", [Int, Octal]),
    entry!(libc::SYS_fsync, "fsync", [Int]),
    entry!(libc::SYS_getrlimit, "getrlimit", [Int, Generic]),
    entry!(libc::SYS_getuid, "getuid"),
    entry!(libc::SYS_getgid, "getgid"),
    entry!(libc::SYS_geteuid, "geteuid"),
    entry!(libc::SYS_getppid, "getppid"),
    entry!(libc::SYS_sigaltstack, "sigaltstack", [Generic, Generic]),
    entry!(libc::SYS_prctl, "prctl", [Hex, Generic, Generic, Generic, Generic]),
    entry!(libc::SYS_arch_prctl, "arch_prctl", [Hex, Generic]),
    entry!(libc::SYS_gettid, "gettid"),
    entry!(libc::SYS_futex, "futex", [Generic, Hex, Int, Generic]),
    entry!(libc::SYS_sched_getaffinity, "sched_getaffinity", [Int, Int, Generic]),
    entry!(libc::SYS_set_tid_address, "set_tid_address", [Generic]),
    entry!(libc::SYS_clock_gettime, "clock_gettime", [Int, Generic]),
    entry!(libc::SYS_exit_group, "exit_group", [Int]),
    entry!(libc::SYS_epoll_create1, "epoll_create1", [Hex]),
    entry!(libc::SYS_epoll_wait, "epoll_wait", [Int, Generic, Int, Int]),
    entry!(libc::SYS_getrandom, "getrandom", [Generic, Int, Hex]),
    entry!(libc::SYS_openat, "openat", [Int, Path, Octal, Octal]),
    entry!(libc::SYS_newfstatat, "newfstatat", [Int, Path, Generic, Hex]),
    entry!(libc::SYS_unlinkat, "unlinkat", [Int, Path, Hex]),
    entry!(libc::SYS_mkdirat, "mkdirat", [Int, Path, Octal]),
    entry!(libc::SYS_ptrace, "ptrace", [Int, Int, Hex, Hex]),
    entry!(libc::SYS_madvise, "madvise", [Generic, Int, Int]),
    entry!(libc::SYS_tgkill, "tgkill", [Int, Int, Signal]),
    entry!(libc::SYS_prlimit64, "prlimit64", [Int, Int, Generic, Generic]),
];

/// Immutable, arch-indexed syscall metadata table (component A of the
/// supervisor: see `SPEC_FULL.md` §4.A).
pub struct SyscallTable {
    by_nr: std::collections::HashMap<i64, &'static SyscallEntry>,
}

impl SyscallTable {
    pub fn for_x86_64() -> Self {
        let by_nr = X86_64_ENTRIES.iter().map(|e| (e.nr, e)).collect();
        Self { by_nr }
    }

    /// Returns the entry for `nr`, or a synthetic `UNKNOWN[nr]` entry with
    /// every argument typed as `Generic` — looking up an unknown syscall
    /// number is never an error (`SPEC_FULL.md` §4.A).
    pub fn lookup(&self, nr: i64) -> SyscallEntry {
        match self.by_nr.get(&nr) {
            Some(entry) => **entry,
            None => SyscallEntry::new(nr, unknown_name(nr), MAX_ARGS, [Generic; MAX_ARGS]),
        }
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<i64> {
        self.by_nr
            .values()
            .find(|e| e.name == name)
            .map(|e| e.nr)
    }
}

fn unknown_name(nr: i64) -> &'static str {
    // Leak a small, bounded number of distinct strings; syscall numbers are a
    // closed, architecture-defined set so this cannot grow unbounded in
    // practice.
    Box::leak(format!("UNKNOWN[{}]", nr).into_boxed_str())
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::for_x86_64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_syscall_has_name() {
        let table = SyscallTable::for_x86_64();
        let entry = table.lookup(libc::SYS_execve);
        assert_eq!(entry.name, "execve");
        assert_eq!(entry.arg_count, 3);
    }

    #[test]
    fn unknown_syscall_is_synthetic_not_error() {
        let table = SyscallTable::for_x86_64();
        let entry = table.lookup(999_999);
        assert!(entry.name.starts_with("UNKNOWN"));
        assert_eq!(entry.arg_count, MAX_ARGS);
    }

    #[test]
    fn describe_args_formats_path_via_reader() {
        let table = SyscallTable::for_x86_64();
        let entry = table.lookup(libc::SYS_openat);
        let args = [libc::AT_FDCWD as u64, 0xdead_beef, 0, 0, 0, 0];
        let described = entry.describe_args(&args, |addr| {
            assert_eq!(addr, 0xdead_beef);
            Some(b"/etc/passwd\0".to_vec())
        });
        assert_eq!(described[1], "\"/etc/passwd\"");
    }

    #[test]
    fn lookup_by_name_roundtrips() {
        let table = SyscallTable::for_x86_64();
        let nr = table.lookup_by_name("write").unwrap();
        assert_eq!(nr, libc::SYS_write);
    }
}
