use childward::debug;
use childward::master::{self, Event, Master};
use childward::signal;
use childward::slave;
use childward::status::*;
use childward::task::{self, TaskSpec, TaskTable};
use clap::Parser;
use clap::error::ErrorKind;
use rustix::event::{PollFd, PollFlags, poll};
use std::os::fd::FromRawFd;
use std::process;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Program to run as a supervised task, optionally followed by its
    /// arguments after `:`. May be given more than once, one task per flag.
    /// Example: --task /usr/bin/nginx:-g:daemon off;
    #[arg(long = "task", value_name = "PROGRAM[:ARGS...]")]
    tasks: Vec<String>,

    /// User to run the preceding --task as (drops privileges before exec).
    /// Applies to the corresponding --task by position; omit for a task that
    /// should keep running as whatever user the slave runs as.
    #[arg(long = "user", value_name = "NAME")]
    users: Vec<String>,

    /// Restart the corresponding --task whenever it dies, unless we're
    /// shutting down. One per --task, matched by position.
    #[arg(long = "restart", value_name = "BOOL")]
    restarts: Vec<bool>,

    /// Name of the environment variable used to pass the worker's inherited
    /// command-socket fd across the re-exec. Override only if the default
    /// collides with something in the host environment.
    #[arg(long = "worker-fd-env", default_value_t = master::WORKER_FD_ENV.to_string())]
    worker_fd_env: String,

    /// Enable debug logging to stderr.
    #[arg(short = 'D', long, default_value_t = false)]
    debug: bool,
}

/// Print usage error to stderr and exit with EXIT_USAGE code.
macro_rules! usage_error {
    ($fmt:expr $(,$args:expr)*) => ({
        eprint!(concat!("error: ", $fmt, "\n\nFor more information, try '--help'.\n"), $($args),*);
        process::exit(EXIT_USAGE);
    });
}

/// Split one `--task` value into `(program, argv)`. `argv[0]` is always the
/// program path, matching what `execve` expects. Bytes are raw, with no
/// trailing NUL: `read_variable` appends the wire's own terminator on the
/// slave side, so a caller-supplied one would double up (see `slave.rs`'s
/// `run_child`, which strips exactly one trailing NUL per field).
fn parse_task_spec(raw: &str) -> (Vec<u8>, Vec<Vec<u8>>) {
    let mut parts = raw.split(':');
    let program = parts.next().unwrap_or(raw).to_string();
    let mut argv = vec![program.clone().into_bytes()];
    for arg in parts {
        argv.push(arg.as_bytes().to_vec());
    }
    (program.into_bytes(), argv)
}

fn inherited_envp() -> Vec<Vec<u8>> {
    std::env::vars_os().map(|(k, v)| format!("{}={}", k.to_string_lossy(), v.to_string_lossy()).into_bytes()).collect()
}

/// Parse CLI arguments. Also handles --help, --version, and usage errors.
fn parse_args() -> Args {
    match Args::try_parse() {
        Ok(args) => {
            if args.debug {
                childward::DEBUG.store(true, Ordering::SeqCst);
            }
            if args.tasks.is_empty() {
                usage_error!("at least one --task is required");
            }
            args
        }
        Err(err) if err.kind() == ErrorKind::DisplayHelp => {
            print!("{}", err);
            process::exit(EXIT_SUCCESS);
        }
        Err(err) if err.kind() == ErrorKind::DisplayVersion => {
            print!("{} {}\n", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            process::exit(EXIT_SUCCESS);
        }
        Err(err) => {
            eprint!("{}", err);
            process::exit(EXIT_USAGE);
        }
    }
}

/// `run()`'s return value: what exit code the process should use once the
/// event loop stops.
struct RunOutcome {
    code: i32,
}

fn main() {
    // Worker bootstrap: if the designated fd variable is set, this process
    // is the re-exec'd worker, not a fresh supervisor invocation. Checked
    // before any CLI parsing, since the worker inherits no arguments (see
    // `master::spawn_worker`) and never needs them.
    let fd_env_name = std::env::var(master::WORKER_FD_ENV_NAME_KEY).unwrap_or_else(|_| master::WORKER_FD_ENV.to_string());
    if let Ok(fd_str) = std::env::var(&fd_env_name) {
        let Ok(raw_fd) = fd_str.parse::<i32>() else {
            process::exit(EXIT_WORKER_SPAWN_FAILED);
        };
        // SAFETY: the master set this fd CLOEXEC-clear right before exec,
        // specifically so the worker could adopt it here.
        let socket = unsafe { std::os::fd::OwnedFd::from_raw_fd(raw_fd) };
        slave::run(socket);
    }

    let args = parse_args();
    let outcome = run(args);
    process::exit(outcome.code);
}

/// Build and drive the supervisor: spawn the worker, register every `--task`,
/// then cooperatively poll until every task has been told to shut down and
/// reaped (or the worker itself dies).
fn run(args: Args) -> RunOutcome {
    debug!("spawning worker via {}", args.worker_fd_env);
    let mut master = match master::spawn_worker(&args.worker_fd_env) {
        Ok(m) => m,
        Err(err) => {
            eprintln!("childward: can't spawn worker: {}", err);
            return RunOutcome { code: EXIT_WORKER_SPAWN_FAILED };
        }
    };

    let mut tasks = TaskTable::new();
    for (idx, raw) in args.tasks.iter().enumerate() {
        let (program, argv) = parse_task_spec(raw);
        let user = args.users.get(idx).map(|u| u.as_bytes().to_vec()).unwrap_or_default();
        let restart = args.restarts.get(idx).copied().unwrap_or(false);
        let spec = TaskSpec { program, user, argv, envp: inherited_envp(), restart, restart_backoff: task::DEFAULT_RESTART_BACKOFF };
        if tasks.add(&mut master, spec).is_err() {
            eprintln!("childward: task table full, dropping --task #{}", idx);
            return RunOutcome { code: EXIT_TASK_TABLE_FULL };
        }
    }

    let mut shutting_down = false;
    let mut sigkill_deadline: Option<Instant> = None;
    const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

    loop {
        if master.worker_died() {
            debug!("worker died, exiting");
            break;
        }

        if shutting_down && !tasks.any_live() {
            debug!("every task reaped, terminating worker");
            master.terminate_worker();
            break;
        }

        if let Some(deadline) = sigkill_deadline {
            if Instant::now() >= deadline {
                debug!("shutdown grace expired, sending SIGKILL to stragglers");
                tasks.sigkill_all(&mut master);
                sigkill_deadline = None;
            }
        }

        let fd = master.fd();
        let mut fds = [PollFd::new(&fd, PollFlags::IN)];
        let timeout = if sigkill_deadline.is_some() { Duration::from_millis(50) } else { Duration::from_millis(200) };
        match poll(&mut fds, Some(timeout)) {
            Ok(_) => {}
            Err(rustix::io::Errno::INTR) => continue,
            Err(_) => break,
        }
        let readable = fds[0].revents().contains(PollFlags::IN);
        drop(fds);
        drop(fd);

        if readable {
            match master.poll_once() {
                Ok(event) => handle_event(&mut master, &mut tasks, event, &mut shutting_down, &mut sigkill_deadline, SHUTDOWN_GRACE),
                Err(_) => {
                    master.terminate_worker();
                    break;
                }
            }
        }

        if tasks.tick(&mut master).is_err() {
            break;
        }
    }

    RunOutcome { code: EXIT_SUCCESS }
}

fn handle_event(
    master: &mut Master,
    tasks: &mut TaskTable,
    event: Event,
    shutting_down: &mut bool,
    sigkill_deadline: &mut Option<Instant>,
    grace: Duration,
) {
    match event {
        Event::StateChanged { id, state } => {
            debug!("task {}: state changed to {:?}", id, state);
            tasks.on_state_change(master, id, state);
        }
        Event::Data { id, stream, chunk } => {
            tasks.on_data(id, stream, &chunk);
        }
        Event::Signal(signum) => {
            debug!("received signal {}", signal::display_name(signum));
            if is_shutdown_signal(signum) && !*shutting_down {
                *shutting_down = true;
                tasks.begin_shutdown();
                tasks.sigterm_all(master);
                *sigkill_deadline = Some(Instant::now() + grace);
            }
        }
        Event::None => {}
    }
}

fn is_shutdown_signal(signum: i32) -> bool {
    signum == libc::SIGTERM || signum == libc::SIGINT || signum == libc::SIGQUIT
}
