//! Async-signal-safe relay from arbitrary signals to the self-pipe the slave
//! engine polls. Replaces the teacher's thread + sigwait() model (reclog is
//! multi-threaded; the slave here is strictly single-threaded and cooperative,
//! per spec.md §5) with a classic SA_SIGINFO handler that forwards the full
//! `siginfo_t` — see `shim::relay_siginfo` for the handler side.

use crate::error::SysError;
use crate::shim::{self, SigAction};
use rustix::process::Signal;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

static RELAY_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn relay_handler(_signo: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let fd = RELAY_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        // SAFETY: info is supplied by the kernel to a handler installed with
        // SA_SIGINFO, so it's a valid pointer for the duration of the call.
        unsafe { shim::relay_siginfo(fd, info) };
    }
}

/// Kernel-reserved signal numbers that `sigaction(2)` refuses to touch.
/// Kept explicit per spec.md §9's "NSIG-wide sigaction installation" open
/// question: install coverage for every other signal, skip these.
fn is_unmaskable(signo: i32) -> bool {
    signo == libc::SIGKILL || signo == libc::SIGSTOP
}

/// Highest signal number worth installing a handler for. Linux defines NSIG
/// as 65 (1..64 valid, including the realtime range); other unixes are
/// smaller but installing for an out-of-range number just fails sigaction(),
/// which we ignore.
const NSIG: i32 = 65;

/// Install the relay handler for every signal in `1..NSIG` except the
/// kernel-reserved ones and `SIGPIPE` (ignored outright, matching spec.md
/// §4.2's "Ignore SIGPIPE"). `SIGCHLD` is installed with the same relay
/// handler as everything else — there is no separate reap-notification path
/// — the slave's main loop tells it apart from a forwarded signal by
/// inspecting `si_signo` on the self-pipe and running the waitpid reap loop
/// instead of emitting `GOT_SIGNAL` when it sees `SIGCHLD`.
///
/// `write_fd` is the self-pipe's write end; it must stay open and CLOEXEC
/// for the remaining lifetime of the process.
pub fn install_relay(write_fd: RawFd) -> Result<(), SysError> {
    RELAY_FD.store(write_fd, Ordering::Relaxed);

    for signo in 1..NSIG {
        if is_unmaskable(signo) || signo == libc::SIGPIPE {
            continue;
        }
        // Raw signal number, not `rustix::process::Signal::from_named_raw`:
        // that enum doesn't cover the realtime range, and the relay has to
        // reach every slot in `1..NSIG`, not just the ones with names.
        // Unused slots just fail `sigaction(2)`, which is fine to ignore.
        let _ = shim::sigaction(signo, SigAction::Relay, Some(relay_handler));
    }

    if let Err(err) = shim::sigaction(libc::SIGPIPE, SigAction::Ignore, None) {
        return Err(SysError::Syscall("sigaction()", err));
    }

    Ok(())
}

/// Restore default dispositions for every signal this module touched.
/// Called on the child side of fork(), right after fork and before execve(),
/// so a spawned program starts with ordinary signal dispositions rather than
/// inheriting the slave's relay handlers (spec.md §4.2's exec flow never
/// wants its children seeing the relay).
pub fn reset_child_signals() -> Result<(), SysError> {
    for signo in 1..NSIG {
        if is_unmaskable(signo) {
            continue;
        }
        let _ = shim::sigaction(signo, SigAction::Default, None);
    }
    Ok(())
}

/// Human-readable name for a signal, used only for debug logging.
pub fn display_name(signo: i32) -> String {
    match Signal::from_named_raw(signo) {
        Some(sig) => format!("{:?}", sig).replace("Signal::", "SIG"),
        None => format!("[{}]", signo),
    }
}
