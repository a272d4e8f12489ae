//! The slave: the privileged half of the supervisor, a single-threaded
//! cooperative poll loop that forks/execs children, captures their stdio,
//! reaps them, and relays signals and child lifecycle events to the master
//! over the command socket. Grounded in `slave.c`'s `libChildSlaveProcess`,
//! unified with the self-pipe/siginfo relay design used here instead of
//! `slave.c`'s multi-threaded `eventfd` + eventfd-counter scheme.

use crate::error::SysError;
use crate::privilege;
use crate::protocol::{Command, CommandHeader, ExecRequest, ResponseHeader, ResponseResult};
use crate::shim::{self, Fork, SigAction};
use crate::signal;
use crate::status;
use crate::wire::{self, ReadOutcome};
use rustix::event::{PollFd, PollFlags, poll};
use rustix::net::{AddressFamily, SocketFlags, SocketType, socketpair};
use rustix::pipe::{PipeFlags, pipe_with};
use rustix::process::Pid;
use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::time::{Duration, Instant};

/// How long `slave_exit` waits for killed children to be reaped before
/// giving up on them. Resolves spec's "double waitpid on shutdown" open
/// question in favor of a bounded grace timer over an unconditional
/// blocking `waitpid`.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

struct ChildRecord {
    pid: Pid,
    running: bool,
    echo: u64,
    pipe_out: Option<OwnedFd>,
    pipe_err: Option<OwnedFd>,
    wait_status: Option<i32>,
}

impl ChildRecord {
    fn awaiting_eof(&self) -> bool {
        !self.running && self.pipe_out.is_none() && self.pipe_err.is_none()
    }
}

pub struct Slave {
    socket: OwnedFd,
    self_pipe_r: OwnedFd,
    #[allow(dead_code)]
    self_pipe_w: OwnedFd,
    pid1: bool,
    group: Pid,
    children: HashMap<u64, ChildRecord>,
    next_id: u64,
}

/// Entered by the worker process re-exec path once `SUPERVISOR_WORKER_FD`
/// names a valid fd; never returns.
pub fn run(socket: OwnedFd) -> ! {
    match Slave::new(socket) {
        Ok(mut slave) => slave.run_loop(),
        Err(_) => std::process::exit(status::EXIT_WORKER_SPAWN_FAILED),
    }
}

/// Disconnect standard IO: redirect stdin from, and (if `silent`) stdout and
/// stderr to, `/dev/null`. Also resets `umask` and `cwd`, matching
/// `slave.c`'s `detach()` beyond what the distilled spec calls out so a
/// supervisor started from an arbitrary shell doesn't leak its umask or
/// working directory into everything it spawns.
fn detach(silent: bool) {
    unsafe { libc::umask(0) };
    let _ = rustix::process::chdir("/");

    let devnull_r = match rustix::fs::open("/dev/null", rustix::fs::OFlags::RDONLY, rustix::fs::Mode::empty()) {
        Ok(fd) => fd,
        Err(_) => return,
    };
    let _ = rustix::stdio::dup2_stdin(&devnull_r);
    drop(devnull_r);

    if silent {
        if let Ok(devnull_rw) = rustix::fs::open("/dev/null", rustix::fs::OFlags::RDWR, rustix::fs::Mode::empty()) {
            let _ = rustix::stdio::dup2_stdout(&devnull_rw);
            let _ = rustix::stdio::dup2_stderr(&devnull_rw);
        }
    }
}

impl Slave {
    fn new(socket: OwnedFd) -> Result<Self, SysError> {
        detach(true);

        let pid1 = rustix::process::getpid().as_raw_nonzero().get() == 1;
        let group = if pid1 {
            rustix::process::getpid()
        } else {
            rustix::process::setsid().map_err(|e| SysError::Syscall("setsid()", e))?
        };

        let (self_pipe_r, self_pipe_w) = socketpair(
            AddressFamily::UNIX,
            SocketType::DGRAM,
            SocketFlags::CLOEXEC | SocketFlags::NONBLOCK,
            None,
        )
        .map_err(|e| SysError::Syscall("socketpair()", e))?;

        signal::install_relay(self_pipe_w.as_raw_fd())?;

        Ok(Slave { socket, self_pipe_r, self_pipe_w, pid1, group, children: HashMap::new(), next_id: 1 })
    }

    fn run_loop(&mut self) -> ! {
        loop {
            if let Err(_err) = self.poll_once() {
                self.slave_exit();
            }
        }
    }

    fn reap_target(&self) -> i32 {
        if self.pid1 { -1 } else { -self.group.as_raw_nonzero().get() }
    }

    /// Reap whatever is currently reapable, non-blocking. Returns whether
    /// anything was reaped. Drains fully rather than reaping once per
    /// `SIGCHLD` siginfo received, since `SIGCHLD` delivery itself can
    /// coalesce multiple deaths into a single handler invocation.
    fn reap_available(&mut self) -> Result<bool, SysError> {
        let mut reaped_any = false;
        loop {
            match shim::waitpid_nohang(self.reap_target()) {
                Ok(Some((pid, raw_status))) => {
                    reaped_any = true;
                    if let Some((&id, _)) = self.children.iter().find(|(_, c)| c.pid == pid && c.running) {
                        let child = self.children.get_mut(&id).unwrap();
                        child.running = false;
                        child.wait_status = Some(raw_status);
                        self.notify_dead(id)?;
                    }
                }
                Ok(None) => break,
                Err(err) => return Err(SysError::Syscall("waitpid()", err)),
            }
        }
        Ok(reaped_any)
    }

    fn notify_dead(&mut self, id: u64) -> Result<(), SysError> {
        let child = match self.children.get(&id) {
            Some(c) => c,
            None => return Ok(()),
        };
        if !child.awaiting_eof() {
            return Ok(());
        }
        let response = ResponseHeader {
            master_echo: child.echo,
            result: ResponseResult::ChildDied,
            param_child: id,
            param_int: child.wait_status.unwrap_or(0),
        };
        response.write_blocking(&self.socket)
    }

    fn poll_once(&mut self) -> Result<(), SysError> {
        // Build the descriptor set fresh each iteration: the self-pipe, the
        // command socket, then every still-open child pipe.
        let mut pipe_owners: Vec<(u64, bool)> = Vec::new();
        for (&id, child) in self.children.iter() {
            if child.pipe_out.is_some() {
                pipe_owners.push((id, true));
            }
            if child.pipe_err.is_some() {
                pipe_owners.push((id, false));
            }
        }

        let mut fds: Vec<PollFd> = Vec::with_capacity(2 + pipe_owners.len());
        fds.push(PollFd::new(&self.self_pipe_r, PollFlags::IN));
        fds.push(PollFd::new(&self.socket, PollFlags::IN));
        for &(id, is_out) in &pipe_owners {
            let child = self.children.get(&id).unwrap();
            let fd: &OwnedFd = if is_out { child.pipe_out.as_ref().unwrap() } else { child.pipe_err.as_ref().unwrap() };
            fds.push(PollFd::new(fd, PollFlags::IN));
        }

        match poll(&mut fds, None as Option<Duration>) {
            Ok(_) => {}
            Err(rustix::io::Errno::INTR) => return Ok(()),
            Err(err) => return Err(SysError::Syscall("poll()", err)),
        }

        let self_pipe_ready = fds[0].revents().contains(PollFlags::IN);
        let socket_ready = fds[1].revents().contains(PollFlags::IN);
        let pipe_events: Vec<(u64, bool, PollFlags)> =
            pipe_owners.iter().zip(fds.iter().skip(2)).map(|(&(id, is_out), pfd)| (id, is_out, pfd.revents())).collect();

        if self_pipe_ready {
            self.drain_self_pipe()?;
        }

        for (id, is_out, revents) in pipe_events {
            self.service_child_pipe(id, is_out, revents)?;
        }

        if socket_ready {
            self.handle_command()?;
        }

        Ok(())
    }

    fn drain_self_pipe(&mut self) -> Result<(), SysError> {
        loop {
            let info = match shim::read_siginfo(&self.self_pipe_r) {
                Ok(info) => info,
                Err(rustix::io::Errno::AGAIN) => break,
                Err(err) => return Err(SysError::Syscall("read(self-pipe)", err)),
            };
            if info.si_signo == libc::SIGCHLD {
                self.reap_available()?;
            } else {
                let response = ResponseHeader {
                    master_echo: 0,
                    result: ResponseResult::GotSignal,
                    param_child: 0,
                    param_int: info.si_signo,
                };
                response.write_blocking(&self.socket)?;
            }
        }
        Ok(())
    }

    fn service_child_pipe(&mut self, id: u64, is_out: bool, revents: PollFlags) -> Result<(), SysError> {
        if revents.contains(PollFlags::IN) {
            let mut buffer = [0u8; 512];
            let fd_raw = {
                let child = match self.children.get(&id) {
                    Some(c) => c,
                    None => return Ok(()),
                };
                let fd = if is_out { child.pipe_out.as_ref() } else { child.pipe_err.as_ref() };
                match fd {
                    Some(fd) => fd.as_raw_fd(),
                    None => return Ok(()),
                }
            };
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd_raw) };
            match rustix::io::read(borrowed, &mut buffer) {
                Ok(0) => self.close_child_pipe(id, is_out)?,
                Ok(n) => {
                    let echo = self.children.get(&id).map(|c| c.echo).unwrap_or(0);
                    let result = if is_out { ResponseResult::StdoutData } else { ResponseResult::StderrData };
                    let response = ResponseHeader { master_echo: echo, result, param_child: id, param_int: 0 };
                    response.write_blocking(&self.socket)?;
                    wire::write_variable(&mut |buf: &[u8]| wire::write_full(&self.socket, buf), &buffer[..n])?;
                }
                Err(rustix::io::Errno::INTR) | Err(rustix::io::Errno::AGAIN) => {}
                Err(_) => self.close_child_pipe(id, is_out)?,
            }
        } else if revents.contains(PollFlags::HUP) || revents.contains(PollFlags::ERR) {
            self.close_child_pipe(id, is_out)?;
        }
        Ok(())
    }

    fn close_child_pipe(&mut self, id: u64, is_out: bool) -> Result<(), SysError> {
        if let Some(child) = self.children.get_mut(&id) {
            if is_out {
                child.pipe_out = None;
            } else {
                child.pipe_err = None;
            }
        }
        self.notify_dead(id)
    }

    fn handle_command(&mut self) -> Result<(), SysError> {
        let header = match CommandHeader::read(&self.socket, false)? {
            ReadOutcome::Complete(hdr) => hdr,
            ReadOutcome::WouldBlock => unreachable!("slave reads are always blocking"),
        };

        match header.command {
            Command::Exec | Command::ExecPipe => self.handle_exec(header),
            Command::CloseHandle => self.handle_close_handle(header),
            Command::Kill => self.handle_kill(header),
            Command::Quit => self.slave_exit(),
        }
    }

    fn handle_exec(&mut self, header: CommandHeader) -> Result<(), SysError> {
        let silent = header.command == Command::Exec;
        let request = ExecRequest::read(&self.socket)?;

        let (pipe_out, pipe_err) = if silent {
            (None, None)
        } else {
            let out = pipe_with(PipeFlags::CLOEXEC).map_err(|e| SysError::Syscall("pipe()", e))?;
            let err = pipe_with(PipeFlags::CLOEXEC).map_err(|e| SysError::Syscall("pipe()", e))?;
            (Some(out), Some(err))
        };

        let fork_result = unsafe { shim::fork() };

        match fork_result {
            Ok(Fork::Child) => self.run_child(silent, &pipe_out, &pipe_err, &request),
            Ok(Fork::Parent(pid)) => {
                // Close the write ends we handed to the child; keep the read ends.
                let (pipe_out_r, pipe_err_r) = (
                    pipe_out.map(|(r, _w)| r),
                    pipe_err.map(|(r, _w)| r),
                );
                let id = self.next_id;
                self.next_id += 1;
                self.children.insert(
                    id,
                    ChildRecord { pid, running: true, echo: header.master_echo, pipe_out: pipe_out_r, pipe_err: pipe_err_r, wait_status: None },
                );
                let response = ResponseHeader {
                    master_echo: header.master_echo,
                    result: ResponseResult::ChildCreated,
                    param_child: id,
                    param_int: pid.as_raw_nonzero().get(),
                };
                response.write_blocking(&self.socket)
            }
            Err(_errno) => {
                let response = ResponseHeader {
                    master_echo: header.master_echo,
                    result: ResponseResult::ChildCreated,
                    param_child: 0,
                    param_int: 0,
                };
                response.write_blocking(&self.socket)
            }
        }
    }

    /// Child side of the `EXEC`/`EXEC_PIPE` fork. Never returns: always
    /// either `execve`s or `_exit`s. Everything here runs between `fork()`
    /// and `execve()`, so it must stay async-fork-safe — no allocator use
    /// beyond what's already been set up, no locking.
    fn run_child(
        &self,
        silent: bool,
        pipe_out: &Option<(OwnedFd, OwnedFd)>,
        pipe_err: &Option<(OwnedFd, OwnedFd)>,
        request: &ExecRequest,
    ) -> ! {
        let _ = signal::reset_child_signals();
        unsafe { shim::close_raw(self.socket.as_raw_fd()) };
        unsafe { shim::close_raw(self.self_pipe_r.as_raw_fd()) };

        for child in self.children.values() {
            if let Some(fd) = &child.pipe_out {
                unsafe { shim::close_raw(fd.as_raw_fd()) };
            }
            if let Some(fd) = &child.pipe_err {
                unsafe { shim::close_raw(fd.as_raw_fd()) };
            }
        }

        if let (Some((r, _)), Some((r2, _))) = (pipe_out, pipe_err) {
            unsafe { shim::close_raw(r.as_raw_fd()) };
            unsafe { shim::close_raw(r2.as_raw_fd()) };
        }

        let user_is_set = request.user.len() > 1 || request.user.first() != Some(&0);
        if user_is_set {
            match CString::new(request.user[..request.user.len() - 1].to_vec()) {
                Ok(user) => {
                    if unsafe { privilege::drop_to_user(&user) }.is_err() {
                        unsafe { shim::fast_exit(status::EXIT_COMMAND_FAILED) };
                    }
                }
                Err(_) => unsafe { shim::fast_exit(status::EXIT_COMMAND_FAILED) },
            }
        }

        detach(silent);

        if !silent {
            if let (Some((_, w_out)), Some((_, w_err))) = (pipe_out, pipe_err) {
                let _ = rustix::stdio::dup2_stdout(w_out);
                let _ = rustix::stdio::dup2_stderr(w_err);
                unsafe { shim::close_raw(w_out.as_raw_fd()) };
                unsafe { shim::close_raw(w_err.as_raw_fd()) };
            }
        }

        let program = match CString::new(request.program[..request.program.len() - 1].to_vec()) {
            Ok(p) => p,
            Err(_) => unsafe { shim::fast_exit(status::EXIT_COMMAND_FAILED) },
        };

        let argv_c: Vec<CString> = request.argv.iter().map(|a| CString::new(a[..a.len() - 1].to_vec()).unwrap_or_default()).collect();
        let envp_c: Vec<CString> = request.envp.iter().map(|e| CString::new(e[..e.len() - 1].to_vec()).unwrap_or_default()).collect();
        let mut argv_ptrs: Vec<*const libc::c_char> = argv_c.iter().map(|s| s.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());
        let mut envp_ptrs: Vec<*const libc::c_char> = envp_c.iter().map(|s| s.as_ptr()).collect();
        envp_ptrs.push(std::ptr::null());

        unsafe { shim::execve(&program, &argv_ptrs, &envp_ptrs) };
        unsafe { shim::fast_exit(status::EXIT_COMMAND_FAILED) };
    }

    fn handle_close_handle(&mut self, header: CommandHeader) -> Result<(), SysError> {
        if let Some(mut child) = self.children.remove(&header.param_child) {
            child.pipe_out = None;
            child.pipe_err = None;
        }
        Ok(())
    }

    fn handle_kill(&mut self, header: CommandHeader) -> Result<(), SysError> {
        if let Some(child) = self.children.get(&header.param_child) {
            if child.running {
                let _ = shim::kill_raw(child.pid, header.param_int);
            }
        }
        Ok(())
    }

    /// Best-effort termination: SIGKILL every still-running child, wait up
    /// to `SHUTDOWN_GRACE` for them to be reaped, tell the master about
    /// whichever ones were, then exit. A child that outlives the grace
    /// period is abandoned rather than waited on forever.
    fn slave_exit(&mut self) -> ! {
        for child in self.children.values() {
            if child.running {
                let _ = shim::kill_raw(child.pid, libc::SIGKILL);
            }
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while Instant::now() < deadline {
            let still_running = self.children.values().any(|c| c.running);
            if !still_running {
                break;
            }
            match self.reap_available() {
                Ok(true) => continue,
                Ok(false) => std::thread::sleep(Duration::from_millis(20)),
                Err(_) => break,
            }
        }

        for (&id, child) in self.children.iter() {
            if !child.running {
                let response = ResponseHeader {
                    master_echo: child.echo,
                    result: ResponseResult::ChildDied,
                    param_child: id,
                    param_int: child.wait_status.unwrap_or(0),
                };
                let _ = response.write_blocking(&self.socket);
            }
        }

        unsafe { shim::close_raw(self.socket.as_raw_fd()) };
        std::process::exit(status::EXIT_FAILURE);
    }
}

/// Install default dispositions the slave itself relies on before the relay
/// is up (used only during the brief window `Slave::new` runs in).
#[allow(dead_code)]
fn ignore_sigpipe_early() -> Result<(), SysError> {
    shim::sigaction(libc::SIGPIPE, SigAction::Ignore, None).map_err(|e| SysError::Syscall("sigaction()", e))
}
