//! Direct `unshare(2)` requests.
//!
//! The system call is reached through a single wrapper so the rest of the
//! workspace never touches the FFI boundary. Platforms without `unshare`
//! get a stub that reports failure.

use libc::c_int;

/// Asks the kernel to move the calling process into new namespaces.
///
/// `flags` is a bitwise OR of `CLONE_NEW*` constants. Returns `true` when
/// the kernel accepted the request.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn unshare(flags: c_int) -> bool {
    // SAFETY: unshare only reads its integer argument; failure is reported
    // through the return value and leaves the process unchanged.
    let status = unsafe { libc::unshare(flags) };
    if status < 0 {
        tracing::debug!(flags, error = %std::io::Error::last_os_error(), "unshare refused");
    }
    status >= 0
}

/// Stub for non-Linux platforms.
#[cfg(not(target_os = "linux"))]
pub fn unshare(flags: c_int) -> bool {
    tracing::debug!(flags, "unshare unavailable on this platform");
    false
}

/// Returns `true` if an unprivileged user namespace can be created.
///
/// The attempt is made in a forked child so the caller's own namespaces
/// are left untouched.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn user_namespaces_available() -> bool {
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::{ForkResult, fork};

    // SAFETY: the child only performs async-signal-safe calls (unshare and
    // _exit) before terminating.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            // SAFETY: unshare takes a plain flag word.
            let status = unsafe { libc::unshare(libc::CLONE_NEWUSER) };
            // SAFETY: _exit never returns and skips atexit handlers.
            unsafe { libc::_exit(if status < 0 { 1 } else { 0 }) }
        }
        Ok(ForkResult::Parent { child }) => {
            let available = matches!(waitpid(child, None), Ok(WaitStatus::Exited(_, 0)));
            tracing::debug!(available, "user namespace probe");
            available
        }
        Err(e) => {
            tracing::warn!(error = %e, "user namespace probe could not fork");
            false
        }
    }
}

/// Stub for non-Linux platforms.
#[cfg(not(target_os = "linux"))]
pub fn user_namespaces_available() -> bool {
    false
}
