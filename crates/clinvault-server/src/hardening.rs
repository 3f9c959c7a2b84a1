//! Process hardening applied before any key material is loaded.
//!
//! `disable_core_dumps` sets `RLIMIT_CORE` to 0 so a crash cannot write the
//! master key, DEKs or unsealed secrets to disk. `lock_memory` pins every
//! page with `mlockall` so none of them are swapped out.
//!
//! Both are no-ops off Unix.

/// Set `RLIMIT_CORE` to 0 for this process.
///
/// # Errors
///
/// Returns a description of the failure if `setrlimit` fails.
#[cfg(unix)]
pub fn disable_core_dumps() -> Result<(), String> {
    let rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `rlim` is a valid, initialized `rlimit` that outlives the call.
    // `setrlimit` only reads it and changes a kernel-side limit.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &raw const rlim) };

    if rc == 0 {
        Ok(())
    } else {
        Err(format!(
            "setrlimit(RLIMIT_CORE) failed: {}",
            std::io::Error::last_os_error()
        ))
    }
}

#[cfg(not(unix))]
pub fn disable_core_dumps() -> Result<(), String> {
    Ok(())
}

/// Lock current and future pages into RAM.
///
/// Needs `CAP_IPC_LOCK` (or root) on Linux. Set `CLINVAULT_DISABLE_MLOCK=true`
/// to skip it in development.
///
/// # Errors
///
/// Returns a description of the failure if `mlockall` fails.
#[cfg(unix)]
pub fn lock_memory() -> Result<(), String> {
    // SAFETY: `mlockall` takes only flag bits and touches no Rust-owned memory.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };

    if rc == 0 {
        Ok(())
    } else {
        Err(format!(
            "mlockall failed: {} (set CLINVAULT_DISABLE_MLOCK=true to skip)",
            std::io::Error::last_os_error()
        ))
    }
}

#[cfg(not(unix))]
pub fn lock_memory() -> Result<(), String> {
    Ok(())
}
