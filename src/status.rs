// These constants follow bash conventions for exit codes.
// They are not standartizied, but are quite common.

/// Clean shutdown: every task's child was reaped.
pub const EXIT_SUCCESS: i32 = 0;

/// General error.
/// E.g. resource not available, permission denied, etc.
pub const EXIT_FAILURE: i32 = 1;

/// Invalid usage.
/// E.g. missing required option.
pub const EXIT_USAGE: i32 = 2;

/// Command invoked cannot execute.
/// E.g. execve() returned error.
pub const EXIT_COMMAND_FAILED: i32 = 126;

/// Command killed by signal.
/// The actual exit code is EXIT_COMMAND_SIGNALED + N, where
/// N is the signal number.
pub const EXIT_COMMAND_SIGNALED: i32 = 128;

/// The worker process could not be forked or the initial handshake with it
/// failed. Startup failure per spec.md §6's CLI surface contract.
pub const EXIT_WORKER_SPAWN_FAILED: i32 = 125;

/// The fixed-capacity task table was full when a new task was requested.
pub const EXIT_TASK_TABLE_FULL: i32 = 124;
