//! The master: the unprivileged half of the supervisor. Forks and re-execs
//! the current binary as the worker (which immediately becomes the slave,
//! see `main.rs`'s `SUPERVISOR_WORKER_FD` bootstrap check), then drives it
//! over the command socket. Grounded in `libchild.c`'s `LibChild`/`Child`
//! pair, with raw pointers replaced by `u64` ids per the wire protocol's
//! Design Notes, and with `libChildPoll`'s callback dispatch replaced by a
//! returned `Event` — a cooperative single-threaded loop can match on that
//! directly instead of threading closures through `exec`.

use crate::error::SysError;
use crate::protocol::{Command, CommandHeader, ExecRequest, ResponseHeader, ResponseResult};
use crate::shim::{self, Fork};
use crate::wire::{self, ReadOutcome};
use rustix::net::{AddressFamily, SocketFlags, SocketType, socketpair};
use rustix::process::Pid;
use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

/// Default name of the environment variable the re-exec'd worker reads to
/// learn which inherited fd is its end of the command socket. Grounded in
/// `libchild.c`'s `child_worker` variable, renamed per SPEC_FULL §0.5.
pub const WORKER_FD_ENV: &str = "SUPERVISOR_WORKER_FD";

/// Fixed meta-variable carrying the *name* of the fd variable above, so a
/// `--worker-fd-env` override (SPEC_FULL §0.3) still reaches the worker: the
/// re-exec'd process inherits no CLI args (see `spawn_worker`), only
/// environment, so it has to learn the overridden name the same way.
pub const WORKER_FD_ENV_NAME_KEY: &str = "SUPERVISOR_WORKER_FD_NAME";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Starting,
    Started,
    Terminated,
}

#[derive(Debug, Clone, Copy)]
pub enum DataStream {
    Stdout,
    Stderr,
}

/// What `poll_once` observed, for the caller to act on. Mirrors the four
/// outcomes `libChildPoll` used to hand to its two callback types.
pub enum Event {
    StateChanged { id: u64, state: ChildState },
    Data { id: u64, stream: DataStream, chunk: Vec<u8> },
    Signal(i32),
    /// `NULL` result or a response for a handle this master no longer
    /// tracks (already released and fully torn down). Nothing to act on.
    None,
}

struct ChildHandle {
    state: ChildState,
    pid: Option<Pid>,
    slave_id: Option<u64>,
    exit_status: Option<i32>,
    captured: bool,
    /// Set by `release_handle`: the entry stays (the protocol handshake
    /// `CHILD_DIED` -> `CLOSE_HANDLE` still has to run) but events for it
    /// are suppressed, matching `libChildFreeHandle`'s "unusedHandle" flag.
    released: bool,
}

pub struct Master {
    socket: OwnedFd,
    worker_pid: Pid,
    worker_died: bool,
    /// Set once `terminate_worker` has been called: suppresses every
    /// remaining event while the final drain runs, matching
    /// `lib->unusedHandle` in `libChildTerminateWorker`.
    terminating: bool,
    handles: HashMap<u64, ChildHandle>,
    next_echo: u64,
}

/// Fork the worker and re-exec the current binary with `fd_env_name` (default
/// `SUPERVISOR_WORKER_FD`, see `WORKER_FD_ENV`) set to the inherited socket's
/// fd number. The child side of this fork becomes the slave the instant it
/// notices that environment variable (see `main.rs`).
///
/// Re-execs whatever binary is currently running. That's correct for the
/// `childward` CLI itself, but wrong for anything else linking this crate —
/// an integration test binary, say, has no `SUPERVISOR_WORKER_FD` bootstrap
/// check of its own, so re-execing it would just rerun the test harness.
/// Callers in that position should use `spawn_worker_with_exe` instead and
/// point it at the real `childward` binary.
pub fn spawn_worker(fd_env_name: &str) -> Result<Master, SysError> {
    let exe = std::env::current_exe().map_err(SysError::Io)?;
    spawn_worker_with_exe(fd_env_name, &exe)
}

/// Like `spawn_worker`, but re-execs `exe` instead of the currently running
/// binary. Exists so a caller that isn't the `childward` binary itself (an
/// integration test, a library embedder) can still spawn a worker, by
/// pointing `exe` at the path of an actual `childward`-bootstrap-capable
/// binary (e.g. `env!("CARGO_BIN_EXE_childward")` from `tests/`).
pub fn spawn_worker_with_exe(fd_env_name: &str, exe: &std::path::Path) -> Result<Master, SysError> {
    let (master_sock, worker_sock) =
        socketpair(AddressFamily::UNIX, SocketType::STREAM, SocketFlags::empty(), None).map_err(|e| SysError::Syscall("socketpair()", e))?;

    let exe_c = std::ffi::CString::new(exe.as_os_str().to_os_string().into_encoded_bytes()).map_err(|_| SysError::Protocol("exe path contains NUL"))?;

    match unsafe { shim::fork() }.map_err(|e| SysError::Syscall("fork()", e))? {
        Fork::Child => {
            unsafe { shim::close_raw(master_sock.as_raw_fd()) };
            unsafe { libc::fcntl(worker_sock.as_raw_fd(), libc::F_SETFD, 0) };
            unsafe { std::env::set_var(fd_env_name, worker_sock.as_raw_fd().to_string()) };
            unsafe { std::env::set_var(WORKER_FD_ENV_NAME_KEY, fd_env_name) };

            let argv = [exe_c.as_ptr(), std::ptr::null()];
            let envp: Vec<std::ffi::CString> =
                std::env::vars_os().map(|(k, v)| format!("{}={}", k.to_string_lossy(), v.to_string_lossy())).map(|s| std::ffi::CString::new(s).unwrap_or_default()).collect();
            let mut envp_ptrs: Vec<*const libc::c_char> = envp.iter().map(|s| s.as_ptr()).collect();
            envp_ptrs.push(std::ptr::null());

            unsafe { shim::execve(&exe_c, &argv, &envp_ptrs) };
            unsafe { shim::fast_exit(crate::status::EXIT_COMMAND_FAILED) };
        }
        Fork::Parent(pid) => Ok(Master {
            socket: master_sock,
            worker_pid: pid,
            worker_died: false,
            terminating: false,
            handles: HashMap::new(),
            next_echo: 1,
        }),
    }
}

impl Master {
    pub fn fd(&self) -> impl AsFd + '_ {
        &self.socket
    }

    /// The worker (slave) process's own pid, e.g. to deliver a signal to the
    /// slave itself rather than to one of the children it's supervising.
    pub fn worker_pid(&self) -> Pid {
        self.worker_pid
    }

    pub fn state(&self, id: u64) -> Option<ChildState> {
        self.handles.get(&id).map(|h| h.state)
    }

    pub fn exit_status(&self, id: u64) -> Option<i32> {
        self.handles.get(&id).and_then(|h| h.exit_status)
    }

    pub fn pid(&self, id: u64) -> Option<Pid> {
        self.handles.get(&id).and_then(|h| h.pid)
    }

    /// Submit a spawn request. `capture` selects `EXEC_PIPE` (stdio
    /// captured, surfaced later as `Event::Data`) over `EXEC` (stdio
    /// silenced). Returns the id this child is addressed by for the rest
    /// of its life.
    pub fn exec(&mut self, program: &[u8], user: &[u8], argv: &[Vec<u8>], envp: &[Vec<u8>], capture: bool) -> Result<u64, SysError> {
        let id = self.next_echo;
        self.next_echo += 1;
        self.handles.insert(
            id,
            ChildHandle { state: ChildState::Starting, pid: None, slave_id: None, exit_status: None, captured: capture, released: false },
        );

        let header =
            CommandHeader { command: if capture { Command::ExecPipe } else { Command::Exec }, master_echo: id, param_child: 0, param_int: 0 };
        let request = ExecRequest { program: program.to_vec(), user: user.to_vec(), argv: argv.to_vec(), envp: envp.to_vec() };

        // Split fields so the would-block closure (which needs `handles`
        // mutably to drain an incoming response) doesn't have to re-borrow
        // `self` as a whole while `&self.socket` is also on loan to the
        // write call below.
        let Master { socket, handles, terminating, .. } = self;
        let terminating = *terminating;
        header.write_yielding(&*socket, || dispatch_one_response(socket, handles, terminating, true).map(|_| ()))?;
        request.write(&mut |buf: &[u8]| {
            wire::write_full_yielding(&*socket, buf, || dispatch_one_response(socket, handles, terminating, true).map(|_| ()))
        })?;

        Ok(id)
    }

    /// Send `signum` to the child identified by `id`, if it's still alive.
    /// A no-op (matching `libChildKill`'s guard on `slaveId`) once the
    /// child has already died or been released.
    pub fn kill(&mut self, id: u64, signum: i32) -> Result<(), SysError> {
        let slave_id = match self.handles.get(&id).and_then(|h| h.slave_id) {
            Some(s) => s,
            None => return Ok(()),
        };
        let header = CommandHeader { command: Command::Kill, master_echo: 0, param_child: slave_id, param_int: signum };
        header.write_blocking(&self.socket)
    }

    /// Release this handle. Mirrors `libChildFreeHandle`: if the child has
    /// already reached `Terminated`, the slot is dropped immediately;
    /// otherwise it's marked `released` and future events for it are
    /// suppressed, but the entry stays until the eventual
    /// `CHILD_DIED`/`CLOSE_HANDLE` exchange completes.
    pub fn release_handle(&mut self, id: u64) {
        if let Some(handle) = self.handles.get_mut(&id) {
            if handle.state == ChildState::Terminated {
                self.handles.remove(&id);
            } else {
                handle.released = true;
            }
        }
    }

    /// Process exactly one response off the wire. Call this whenever the
    /// fd from `fd()` is readable.
    pub fn poll_once(&mut self) -> Result<Event, SysError> {
        let Master { socket, handles, terminating, .. } = self;
        dispatch_one_response(socket, handles, *terminating, false)
    }

    /// Whether the worker process is known to have exited. Once true,
    /// `poll_once` will keep failing and the master should stop polling.
    pub fn worker_died(&self) -> bool {
        self.worker_died
    }

    fn reap_worker(&mut self) {
        if !self.worker_died {
            let _ = shim::waitpid_nohang(self.worker_pid.as_raw_nonzero().get());
            self.worker_died = true;
        }
    }

    /// Ask the slave to quit, then drain every remaining response until the
    /// socket closes. Mirrors `libChildTerminateWorker`'s
    /// `while(!libChildPoll(lib)) {}` drain loop.
    pub fn terminate_worker(&mut self) {
        self.terminating = true;
        let cmd = CommandHeader { command: Command::Quit, master_echo: 0, param_child: 0, param_int: 0 };
        let _ = cmd.write_blocking(&self.socket);

        while self.poll_once().is_ok() {}
        self.reap_worker();
    }
}

/// Read and act on one response off `socket`. `probe_first` is passed
/// through to `ResponseHeader::read`: `true` from the reentrant
/// write-then-yield callbacks inside `exec` (no guarantee a response is
/// already pending, so a non-blocking probe is required to avoid deadlocking
/// against the slave's own write that's stuck behind the same congested
/// buffer), `false` from `poll_once` and the final drain in
/// `terminate_worker`, both of which are only ever called once the caller's
/// own poll has already confirmed the socket is readable.
fn dispatch_one_response(
    socket: &OwnedFd,
    handles: &mut HashMap<u64, ChildHandle>,
    terminating: bool,
    probe_first: bool,
) -> Result<Event, SysError> {
    let header = match ResponseHeader::read(socket, probe_first)? {
        ReadOutcome::Complete(hdr) => hdr,
        ReadOutcome::WouldBlock => return Ok(Event::None),
    };

    match header.result {
        ResponseResult::ChildCreated => {
            let Some(handle) = handles.get_mut(&header.master_echo) else { return Ok(Event::None) };
            handle.pid = if header.param_int != 0 { Pid::from_raw(header.param_int) } else { None };
            handle.slave_id = if header.param_child != 0 { Some(header.param_child) } else { None };
            handle.state = ChildState::Started;
            if handle.released || terminating {
                return Ok(Event::None);
            }
            Ok(Event::StateChanged { id: header.master_echo, state: ChildState::Started })
        }
        ResponseResult::ChildDied => {
            let (slave_id, released) = match handles.get_mut(&header.master_echo) {
                Some(handle) => {
                    handle.exit_status = Some(header.param_int);
                    handle.state = ChildState::Terminated;
                    (handle.slave_id.take(), handle.released)
                }
                None => (None, true),
            };

            if released {
                handles.remove(&header.master_echo);
            }

            if let Some(slave_id) = slave_id {
                let close = CommandHeader { command: Command::CloseHandle, master_echo: 0, param_child: slave_id, param_int: 0 };
                close.write_blocking(socket)?;
            }

            if released || terminating {
                return Ok(Event::None);
            }
            Ok(Event::StateChanged { id: header.master_echo, state: ChildState::Terminated })
        }
        ResponseResult::StdoutData | ResponseResult::StderrData => {
            let data = crate::protocol::read_data_chunk(socket)?;
            let Some(handle) = handles.get(&header.master_echo) else { return Ok(Event::None) };
            if handle.released || terminating || !handle.captured {
                return Ok(Event::None);
            }
            let chunk = data[..data.len().saturating_sub(1)].to_vec();
            let stream = if header.result == ResponseResult::StdoutData { DataStream::Stdout } else { DataStream::Stderr };
            Ok(Event::Data { id: header.master_echo, stream, chunk })
        }
        ResponseResult::GotSignal => {
            if terminating {
                return Ok(Event::None);
            }
            Ok(Event::Signal(header.param_int))
        }
        ResponseResult::Null => Ok(Event::None),
    }
}
