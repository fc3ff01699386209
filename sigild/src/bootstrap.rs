/// Process-level hardening applied at daemon startup, before any key is read.
///
/// Every step is best-effort: failures are logged and the daemon carries on.
///
/// 1. **`RLIMIT_CORE = 0`**: a crash never writes key material to a core file.
/// 2. **`PR_SET_DUMPABLE 0`** (Linux): blocks `/proc/<pid>/mem` reads and
///    ptrace attach by other unprivileged processes.
/// 3. **`mlockall(MCL_CURRENT | MCL_FUTURE)`** when `lock_memory` is set:
///    keeps pages out of swap.  Needs `CAP_IPC_LOCK` or a large enough
///    `RLIMIT_MEMLOCK`.
#[cfg(unix)]
pub fn secure_bootstrap(lock_memory: bool) {
    disable_core_dumps();
    set_not_dumpable();
    if lock_memory {
        lock_all_memory();
    } else {
        tracing::debug!("memory locking disabled by config");
    }
}

#[cfg(not(unix))]
pub fn secure_bootstrap(_lock_memory: bool) {}

#[cfg(unix)]
fn disable_core_dumps() {
    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: setrlimit reads a fully initialised rlimit struct.
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) };
    if ret == 0 {
        tracing::debug!("RLIMIT_CORE=0: core dumps disabled");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("setrlimit(RLIMIT_CORE, 0) failed (non-fatal): {err}");
    }
}

#[cfg(target_os = "linux")]
fn set_not_dumpable() {
    // SAFETY: prctl is safe to call with PR_SET_DUMPABLE and a plain integer arg.
    let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0i64, 0i64, 0i64, 0i64) };
    if ret == 0 {
        tracing::info!("PR_SET_DUMPABLE=0: /proc/pid/mem access disabled");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("PR_SET_DUMPABLE=0 failed (non-fatal): {err}");
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_not_dumpable() {}

#[cfg(unix)]
fn lock_all_memory() {
    // SAFETY: mlockall is safe to call; failure is non-fatal.
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if ret == 0 {
        tracing::info!("mlockall(MCL_CURRENT|MCL_FUTURE): all memory pages locked in RAM");
    } else {
        let err = std::io::Error::last_os_error();
        // ENOMEM or EPERM without CAP_IPC_LOCK.
        tracing::warn!("mlockall failed (non-fatal, keys may be swapped): {err}");
    }
}
