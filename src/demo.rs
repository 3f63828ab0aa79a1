//! Sandboxee-side functions exported for test/demo `Call` targets
//! (`SPEC_FULL.md` §4.D/§8). These run *inside* the confined child after
//! `sandbox::confine_spawned_child` has already installed the filter — they
//! exist purely so `rpc::server::serve`'s `dlsym` lookup has something to
//! resolve by name without needing a real workload binary.
//!
//! Every export takes and returns `i64` to match [`crate::rpc::TypeTag::Int`]
//! and [`crate::rpc::MAX_CALL_ARGS`]'s fixed six-register calling convention.

/// Scenario 1 (*addition*, `SPEC_FULL.md` §8): `a + b`, ignoring the rest.
#[no_mangle]
pub extern "C" fn capsule_demo_sum(a: i64, b: i64, _c: i64, _d: i64, _e: i64, _f: i64) -> i64 {
    a + b
}

/// Scenario 2 (*violation recovery*): issues a syscall no demo policy ever
/// allows, so the installed filter's default `KillProcess` action fires and
/// the monitor observes it as a [`crate::monitor::Violation`]. Never
/// returns on a confined sandboxee; returns `-1` if the syscall is somehow
/// not denied (e.g. running unconfined in a unit test).
#[no_mangle]
pub extern "C" fn capsule_demo_violate(_a: i64, _b: i64, _c: i64, _d: i64, _e: i64, _f: i64) -> i64 {
    // SAFETY: a bare socket() call with throwaway arguments; the syscall's
    // own effects don't matter, only that the filter sees it.
    unsafe {
        libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
    }
    -1
}

/// Scenario 5 (*deadline*): blocks for `seconds` wall-clock seconds so a
/// short `Session::set_wall_time_limit` can be observed killing it.
#[no_mangle]
pub extern "C" fn capsule_demo_sleep_for_sec(seconds: i64, _b: i64, _c: i64, _d: i64, _e: i64, _f: i64) -> i64 {
    let req = libc::timespec {
        tv_sec: seconds.max(0),
        tv_nsec: 0,
    };
    // SAFETY: `req` is a fully initialized, valid `timespec`; the `rem`
    // out-param is unused since a signal interrupting this is expected to
    // kill the process, not resume it.
    unsafe {
        libc::nanosleep(&req, std::ptr::null_mut());
    }
    0
}
