#![allow(clippy::unnecessary_cast)]

use rustix::io::Errno;
use rustix::process::Pid;
use std::io::Error;
use std::mem::{self, MaybeUninit};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::ptr::null_mut;

/// Get errno from last libc call.
fn last_errno() -> Errno {
    Errno::from_io_error(&Error::last_os_error()).unwrap()
}

pub enum Fork {
    Parent(Pid),
    Child,
}

/// Convenience shim for libc::fork().
/// In Rust, fork() is not safe in general case, only its specific usages can be proven so.
/// Hence we mark shim as unsafe, and leave the safe usage as responsibility of the caller:
/// the child side must not touch anything that isn't async-fork-safe before it either
/// execve()s or calls fast_exit().
pub unsafe fn fork() -> Result<Fork, Errno> {
    match unsafe { libc::fork() } {
        pid if pid > 0 => Ok(Fork::Parent(Pid::from_raw(pid).unwrap())),
        0 => Ok(Fork::Child),
        _ => Err(last_errno()),
    }
}

/// Shim for libc::_exit().
/// It's like process::exit(), but it doesn't run atexit handlers or any other destructors,
/// just kills the process immediately. Used on every child-side error path between fork()
/// and execve(), so that a failed privilege drop can never fall through into exec.
pub unsafe fn fast_exit(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}

/// Shim for libc::close().
/// It violates OwnedFd/BorrowedFd contract by making it possible to close underlying
/// fd while it's still owned, hence marked unsafe.
/// Handles EINTR.
pub unsafe fn close_raw(fd: RawFd) {
    loop {
        if unsafe { libc::close(fd) } == 0 || last_errno() != Errno::INTR {
            break;
        }
    }
}

/// Shim for libc::execve() taking explicit argv/envp instead of inheriting the
/// caller's environment. Only returns on failure (exec replaces the process
/// image on success), matching the C convention.
///
/// # Safety
/// Must only be called in the single-threaded child side of a fork(), right
/// before the process image is replaced or the process exits.
pub unsafe fn execve(program: &std::ffi::CStr, argv: &[*const libc::c_char], envp: &[*const libc::c_char]) -> Errno {
    unsafe {
        libc::execve(program.as_ptr(), argv.as_ptr(), envp.as_ptr());
    }
    last_errno()
}

pub enum SigAction {
    Default,
    Ignore,
    /// Install the siginfo-forwarding relay handler (SA_SIGINFO, see
    /// `install_signal_relay` below).
    Relay,
}

/// Safe shim for sigaction(), taking a raw signal number rather than
/// `rustix::process::Signal` — that enum doesn't cover the realtime range
/// (same reason `kill_raw` below takes a raw `i32`), and the relay has to
/// install across the entire `1..NSIG` span, realtime signals included.
pub fn sigaction(signo: i32, action: SigAction, handler: Option<SigRelayFn>) -> Result<(), Errno> {
    let ret = unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigfillset(&mut sa.sa_mask as *mut libc::sigset_t);

        match action {
            SigAction::Default => {
                sa.sa_sigaction = libc::SIG_DFL;
                sa.sa_flags = libc::SA_RESTART;
            }
            SigAction::Ignore => {
                sa.sa_sigaction = libc::SIG_IGN;
                sa.sa_flags = libc::SA_RESTART;
            }
            SigAction::Relay => {
                sa.sa_sigaction = handler.expect("Relay action requires a handler") as usize;
                sa.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
            }
        }

        libc::sigaction(signo, &sa, null_mut())
    };
    if ret < 0 {
        return Err(last_errno());
    }

    Ok(())
}

/// Signature required of the async-signal-safe relay handler installed by
/// `sigaction(.., SigAction::Relay, ..)`.
pub type SigRelayFn = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Write a full `siginfo_t` to `fd`, from within a signal handler.
///
/// Async-signal-safe: only calls `write(2)`, retries on `EINTR`, and
/// silently drops the signal if the self-pipe's buffer is momentarily full
/// (same "write collating" tradeoff the self-pipe pattern always makes —
/// see `signal_hook::low_level::pipe`). Never allocates, never locks.
///
/// # Safety
/// Must only be called with `info` pointing at a valid `siginfo_t`, which is
/// guaranteed when called from a handler installed with `SA_SIGINFO`.
pub unsafe fn relay_siginfo(fd: RawFd, info: *const libc::siginfo_t) {
    let bytes = info as *const u8;
    let len = mem::size_of::<libc::siginfo_t>();
    loop {
        let ret = unsafe { libc::write(fd, bytes as *const libc::c_void, len) };
        if ret < 0 {
            let err = Error::last_os_error().raw_os_error().unwrap_or(0);
            if err == libc::EINTR {
                continue;
            }
            // EAGAIN (pipe full) or anything else: drop this one, the reader
            // will still wake up for every message that did make it through.
        }
        break;
    }
}

/// Read one `siginfo_t`-sized datagram off the self-pipe's read end.
pub fn read_siginfo<Fd: AsFd>(fd: Fd) -> Result<libc::siginfo_t, Errno> {
    let mut buf = MaybeUninit::<libc::siginfo_t>::uninit();
    let len = mem::size_of::<libc::siginfo_t>();
    loop {
        let ret = unsafe { libc::read(fd.as_fd().as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, len) };
        if ret < 0 {
            if last_errno() == Errno::INTR {
                continue;
            }
            return Err(last_errno());
        }
        if ret as usize != len {
            return Err(Errno::INVAL);
        }
        // SAFETY: the self-pipe is written to exclusively by relay_siginfo(),
        // which always sends exactly one siginfo_t as a single datagram.
        return Ok(unsafe { buf.assume_init() });
    }
}

/// Shim for waitpid(target, &status, WNOHANG). `target` follows POSIX
/// semantics: `-1` waits for any child, `-pgid` waits for any child in that
/// process group. Returns `None` when nothing is currently reapable
/// (including "no children left at all", i.e. `ECHILD`, which callers treat
/// the same as "nothing ready" since the task/slave layers already know
/// which pids they're tracking).
pub fn waitpid_nohang(target: i32) -> Result<Option<(Pid, i32)>, Errno> {
    loop {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(target, &mut status, libc::WNOHANG) };
        if pid > 0 {
            return Ok(Some((Pid::from_raw(pid).unwrap(), status)));
        }
        if pid == 0 {
            return Ok(None);
        }
        match last_errno() {
            Errno::INTR => continue,
            Errno::CHILD => return Ok(None),
            err => return Err(err),
        }
    }
}

/// Shim for kill(pid, signum), accepting a raw signal number rather than
/// `rustix::process::Signal` so real-time signal numbers outside that
/// enum's coverage can still be delivered (`KILL`'s signal number arrives
/// off the wire as a plain `i32`).
pub fn kill_raw(pid: Pid, signum: i32) -> Result<(), Errno> {
    if unsafe { libc::kill(pid.as_raw_nonzero().get(), signum) } < 0 {
        return Err(last_errno());
    }
    Ok(())
}

/// Safe shim for fcntl(fd, F_SETFL, fcntl(fd, F_GETFL) | O_NONBLOCK).
/// Handles EINTR.
pub fn fcntl_nonblock<Fd: AsFd>(fd: Fd, non_block: bool) -> Result<(), Errno> {
    loop {
        let mut flags = unsafe { libc::fcntl(fd.as_fd().as_raw_fd(), libc::F_GETFL) };
        if flags < 0 {
            if last_errno() == Errno::INTR {
                continue;
            }
            return Err(last_errno());
        }

        if non_block {
            flags |= libc::O_NONBLOCK;
        } else {
            flags &= !libc::O_NONBLOCK;
        }

        let ret =
            unsafe { libc::fcntl(fd.as_fd().as_raw_fd(), libc::F_SETFL, flags as libc::c_uint) };
        if ret < 0 {
            if last_errno() == Errno::INTR {
                continue;
            }
            return Err(last_errno());
        }

        return Ok(());
    }
}
