//! End-to-end scenarios driving real spawned processes through `Master`,
//! in the plain `#[test]`-function style `alecmocatta-palaver`'s
//! `tests/fork.rs` uses for its own fork-heavy code (no async runtime, real
//! children, blocking on pipes/poll with a deadline instead of mocking any
//! of it out).

use childward::master::{self, ChildState, DataStream, Event, Master};
use rustix::event::{PollFd, PollFlags, poll};
use std::path::Path;
use std::time::{Duration, Instant};

/// This test binary is a separate executable from `childward` itself (see
/// `Cargo.toml`'s `[[bin]]`); `spawn_worker` would re-exec *this* binary,
/// which has no worker-bootstrap check of its own and would just rerun the
/// whole test suite instead of becoming the slave. Point the re-exec at the
/// real binary Cargo already built for this test run.
fn spawn_worker(fd_env_name: &str) -> Master {
    master::spawn_worker_with_exe(fd_env_name, Path::new(env!("CARGO_BIN_EXE_childward"))).unwrap()
}

/// `Master::exec`'s fields are raw bytes with no trailing NUL: the wire's
/// own `read_variable` appends the terminator on the slave side (see
/// `slave.rs`'s `run_child`), so a pre-appended one here would double up.
fn raw(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
}

fn argv(parts: &[&str]) -> Vec<Vec<u8>> {
    parts.iter().map(|p| raw(p)).collect()
}

/// No environment is forwarded in these tests; children don't need any.
fn empty_envp() -> Vec<Vec<u8>> {
    Vec::new()
}

/// Empty user field means "do not drop privileges" (see `slave.rs`'s
/// `user_is_set`).
fn no_user() -> Vec<u8> {
    Vec::new()
}

/// Poll `master` until `want` returns `Some(t)` for some received event, or
/// `timeout` elapses.
fn wait_for<T>(master: &mut Master, timeout: Duration, mut want: impl FnMut(&Event) -> Option<T>) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        assert!(Instant::now() < deadline, "timed out waiting for expected event");
        let fd = master.fd();
        let mut fds = [PollFd::new(&fd, PollFlags::IN)];
        let remaining = deadline.saturating_duration_since(Instant::now()).min(Duration::from_millis(200));
        poll(&mut fds, Some(remaining)).unwrap();
        let readable = fds[0].revents().contains(PollFlags::IN);
        drop(fds);
        drop(fd);
        if !readable {
            continue;
        }
        let event = master.poll_once().expect("poll_once");
        if let Some(t) = want(&event) {
            return t;
        }
    }
}

fn wait_exited_status(master: &mut Master, id: u64, timeout: Duration) -> i32 {
    wait_for(master, timeout, |event| match event {
        Event::StateChanged { id: got, state: ChildState::Terminated } if *got == id => Some(()),
        _ => None,
    });
    master.exit_status(id).unwrap()
}

fn exit_code(raw_status: i32) -> Option<i32> {
    if raw_status & 0x7f == 0 {
        Some((raw_status >> 8) & 0xff)
    } else {
        None
    }
}

fn terminating_signal(raw_status: i32) -> Option<i32> {
    let sig = raw_status & 0x7f;
    if sig != 0 && sig != 0x7f { Some(sig) } else { None }
}

#[test]
fn silent_child_runs_to_completion() {
    let mut master = spawn_worker("CHILDWARD_TEST_WORKER_FD_1");
    let id = master.exec(&raw("/bin/true"), &no_user(), &argv(&["/bin/true"]), &empty_envp(), false).unwrap();
    let raw_status = wait_exited_status(&mut master, id, Duration::from_secs(5));
    assert_eq!(exit_code(raw_status), Some(0));
    master.terminate_worker();
}

#[test]
fn exit_code_is_forwarded() {
    let mut master = spawn_worker("CHILDWARD_TEST_WORKER_FD_2");
    let id = master.exec(&raw("/bin/sh"), &no_user(), &argv(&["/bin/sh", "-c", "exit 42"]), &empty_envp(), false).unwrap();
    let raw_status = wait_exited_status(&mut master, id, Duration::from_secs(5));
    assert_eq!(exit_code(raw_status), Some(42));
    master.terminate_worker();
}

#[test]
fn captured_child_streams_stdout() {
    let mut master = spawn_worker("CHILDWARD_TEST_WORKER_FD_3");
    let id = master.exec(&raw("/bin/echo"), &no_user(), &argv(&["/bin/echo", "hello from child"]), &empty_envp(), true).unwrap();

    let mut seen = Vec::new();
    wait_for::<()>(&mut master, Duration::from_secs(5), |event| match event {
        Event::Data { id: got, stream: DataStream::Stdout, chunk } if *got == id => {
            seen.extend_from_slice(chunk);
            None
        }
        Event::StateChanged { id: got, state: ChildState::Terminated } if *got == id => Some(()),
        _ => None,
    });

    assert!(String::from_utf8_lossy(&seen).contains("hello from child"));
    master.terminate_worker();
}

#[test]
fn kill_terminates_a_long_running_child() {
    let mut master = spawn_worker("CHILDWARD_TEST_WORKER_FD_4");
    let id = master.exec(&raw("/bin/sleep"), &no_user(), &argv(&["/bin/sleep", "60"]), &empty_envp(), false).unwrap();

    // Give the slave a moment to actually fork/exec before we target it.
    wait_for::<()>(&mut master, Duration::from_secs(5), |event| match event {
        Event::StateChanged { id: got, state: ChildState::Started } if *got == id => Some(()),
        _ => None,
    });

    master.kill(id, libc::SIGTERM).unwrap();
    let raw_status = wait_exited_status(&mut master, id, Duration::from_secs(5));
    assert_eq!(terminating_signal(raw_status), Some(libc::SIGTERM));
    master.terminate_worker();
}

#[test]
fn privilege_drop_failure_prevents_exec() {
    if rustix::process::getuid().is_root() {
        // P5 only bites when the slave itself isn't root; nothing to
        // observe here if the whole test process already is.
        return;
    }

    let mut master = spawn_worker("CHILDWARD_TEST_WORKER_FD_6");
    let id = master.exec(&raw("/bin/true"), &raw("nobody"), &argv(&["/bin/true"]), &empty_envp(), false).unwrap();
    let raw_status = wait_exited_status(&mut master, id, Duration::from_secs(5));
    assert_eq!(exit_code(raw_status), Some(childward::status::EXIT_COMMAND_FAILED));
    master.terminate_worker();
}

#[test]
fn signal_to_worker_is_relayed() {
    let mut master = spawn_worker("CHILDWARD_TEST_WORKER_FD_5");

    // Deliver SIGUSR1 straight to the slave process and confirm it surfaces
    // as a single Event::Signal carrying that signal number — exercising the
    // self-pipe relay end-to-end, not just the in-process sigaction install.
    unsafe { libc::kill(master.worker_pid().as_raw_nonzero().get(), libc::SIGUSR1) };

    let got = wait_for(&mut master, Duration::from_secs(5), |event| match event {
        Event::Signal(signum) => Some(*signum),
        _ => None,
    });
    assert_eq!(got, libc::SIGUSR1);

    master.terminate_worker();
}
