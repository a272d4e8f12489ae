//! The task layer: a thin policy layer above `Master` that restarts
//! programs when they die and drives a graceful shutdown sequence.
//! Grounded in `DockerInit/init.c`'s `activeTasks` table and `main()`'s
//! shutdown sequence (SIGTERM everything, grace sleep, SIGKILL everything,
//! poll, terminate the worker).

use crate::error::SysError;
use crate::master::{ChildState, DataStream, Master};
use std::time::Duration;

/// Fixed capacity of the task table, matching `init.c`'s `activeTasks[128]`.
pub const MAX_TASKS: usize = 128;

/// How long `stateChange` sleeps between a task's death and its restart in
/// the original; kept as the default here, but exposed on `TaskSpec` rather
/// than hardcoded, since spec.md only asks for "a short backoff" without
/// pinning the constant.
pub const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub program: Vec<u8>,
    pub user: Vec<u8>,
    pub argv: Vec<Vec<u8>>,
    pub envp: Vec<Vec<u8>>,
    pub restart: bool,
    pub restart_backoff: Duration,
}

struct Slot {
    spec: TaskSpec,
    /// `None` once the task has died and, if not restarting, been retired;
    /// `Some` while a child handle is outstanding (starting, started, or
    /// waiting out its death-to-restart backoff).
    handle_id: Option<u64>,
    /// Set once a death has been observed but the restart hasn't been
    /// issued yet (backoff is cooperative, not a sleep, since the task
    /// layer never blocks the master's poll loop).
    pending_restart_at: Option<std::time::Instant>,
}

/// Restart-on-death policy above a fixed-capacity task table, plus the
/// SIGTERM -> grace -> SIGKILL -> poll -> terminate_worker shutdown
/// sequence. Event delivery (`on_event`) decouples this layer from
/// `Master`'s callback-closure plumbing: callers poll `Master` themselves
/// and feed state/data events in here, since a single task table often
/// needs to fan state changes for many concurrently-running children back
/// to one `TaskTable`, which doesn't fit neatly as a per-exec closure.
pub struct TaskTable {
    slots: [Option<Slot>; MAX_TASKS],
    shutdown: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStage {
    Running,
    SentSigterm,
    SentSigkill,
    Done,
}

impl TaskTable {
    pub fn new() -> Self {
        TaskTable { slots: std::array::from_fn(|_| None), shutdown: false }
    }

    /// Register a new task and spawn its first instance. Returns the slot
    /// index, used only for `remove`/introspection — restarts reuse the
    /// same slot transparently.
    pub fn add(&mut self, master: &mut Master, spec: TaskSpec) -> Result<usize, SysError> {
        let slot_idx = self.slots.iter().position(|s| s.is_none()).ok_or(SysError::Protocol("task table full"))?;
        let handle_id = Self::spawn(master, &spec)?;
        self.slots[slot_idx] = Some(Slot { spec, handle_id: Some(handle_id), pending_restart_at: None });
        Ok(slot_idx)
    }

    fn spawn(master: &mut Master, spec: &TaskSpec) -> Result<u64, SysError> {
        master.exec(&spec.program, &spec.user, &spec.argv, &spec.envp, true)
    }

    /// True if `handle_id` belongs to a task in this table. Lets the
    /// caller's event loop tell a task-table event apart from a standalone
    /// `Master::exec` call that isn't tracked here.
    pub fn owns(&self, handle_id: u64) -> bool {
        self.slots.iter().flatten().any(|s| s.handle_id == Some(handle_id))
    }

    /// Log a data chunk for `handle_id`, matching `init.c`'s `childData`
    /// printing every captured line it receives.
    pub fn on_data(&self, handle_id: u64, stream: DataStream, chunk: &[u8]) {
        if self.owns(handle_id) {
            log_child_data(handle_id, stream, chunk);
        }
    }

    /// Feed one `ChildState` transition observed for `handle_id` into the
    /// task table. Drives the restart policy: on `Terminated`, releases
    /// the old handle and, if the task wants to restart and we're not
    /// shutting down, schedules a restart after `restart_backoff`.
    pub fn on_state_change(&mut self, master: &mut Master, handle_id: u64, state: ChildState) {
        if state != ChildState::Terminated {
            return;
        }
        let now = std::time::Instant::now();
        for slot in self.slots.iter_mut().flatten() {
            if slot.handle_id == Some(handle_id) {
                master.release_handle(handle_id);
                slot.handle_id = None;
                if slot.spec.restart && !self.shutdown {
                    slot.pending_restart_at = Some(now + slot.spec.restart_backoff);
                } else {
                    slot.pending_restart_at = None;
                }
                return;
            }
        }
    }

    /// Called periodically (e.g. from the supervisor's main loop) to issue
    /// restarts whose backoff has elapsed. Cooperative equivalent of the
    /// original's blocking `sleep(1)` between death and restart.
    pub fn tick(&mut self, master: &mut Master) -> Result<(), SysError> {
        let now = std::time::Instant::now();
        for slot in self.slots.iter_mut().flatten() {
            if slot.handle_id.is_none() {
                if let Some(at) = slot.pending_restart_at {
                    if now >= at {
                        slot.pending_restart_at = None;
                        slot.handle_id = Some(Self::spawn(master, &slot.spec)?);
                    }
                }
            }
        }
        Ok(())
    }

    /// Every task that still has a live handle. Used by the shutdown
    /// sequence to target SIGTERM/SIGKILL.
    fn live_handles(&self) -> Vec<u64> {
        self.slots.iter().flatten().filter_map(|s| s.handle_id).collect()
    }

    pub fn any_live(&self) -> bool {
        !self.live_handles().is_empty()
    }

    /// Mark the table as shutting down: future deaths don't trigger
    /// restarts, matching `init.c`'s `taskShutdown` flag read inside
    /// `stateChange`.
    pub fn begin_shutdown(&mut self) {
        self.shutdown = true;
    }

    pub fn sigterm_all(&self, master: &mut Master) {
        for id in self.live_handles() {
            let _ = master.kill(id, libc::SIGTERM);
        }
    }

    pub fn sigkill_all(&self, master: &mut Master) {
        for id in self.live_handles() {
            let _ = master.kill(id, libc::SIGKILL);
        }
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

fn log_child_data(id: u64, stream: DataStream, chunk: &[u8]) {
    let label = match stream {
        DataStream::Stdout => "stdout",
        DataStream::Stderr => "stderr",
    };
    crate::debug!("task {}: {}: {}", id, label, String::from_utf8_lossy(chunk));
}
