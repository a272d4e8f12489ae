//! Library surface for `childward`'s integration tests. `main.rs` uses these
//! same modules for the CLI binary; splitting them out under a `[lib]`
//! target is only so `tests/` can drive `Master`/`TaskTable` directly against
//! real spawned processes, the way `alecmocatta-palaver`'s `tests/fork.rs`
//! drives its own fork/process primitives.

pub mod error;
pub mod master;
pub mod privilege;
pub mod protocol;
pub mod shim;
pub mod signal;
pub mod slave;
pub mod status;
pub mod task;
pub mod wire;

use std::sync::atomic::AtomicBool;

/// Shared with `main.rs`'s CLI-facing `DEBUG`/`debug!`; kept here too so
/// library-internal code (`task.rs`'s `log_child_data`) can log regardless of
/// whether it's linked into the binary or exercised directly from `tests/`.
pub static DEBUG: AtomicBool = AtomicBool::new(false);

/// Print message to stderr if debug logs are enabled.
#[macro_export]
macro_rules! debug {
    ($fmt:expr $(,$args:expr)*) => ({
        if $crate::DEBUG.load(std::sync::atomic::Ordering::Relaxed) {
            eprintln!(concat!("childward: {}: ", $fmt), std::process::id() $(,$args)*);
        }
    });
}
