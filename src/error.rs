use rustix::io::Errno;
use std::fmt;
use std::io;

/// Error type shared by every layer: framed I/O, slave engine, master client,
/// task layer.
///
/// Kept close to the teacher's tuple-struct `SysError(&'static str, Errno)`,
/// widened into an enum because this crate has more failure shapes than a
/// single syscall wrapper (a short read/write is a protocol violation, not a
/// syscall error; a couple of paths go through `std::io` instead of rustix).
#[derive(Debug)]
pub enum SysError {
    /// A syscall wrapped by rustix (or a raw libc shim) failed. First field
    /// names the call.
    Syscall(&'static str, Errno),
    /// The wire protocol was violated: short read, short write, or an
    /// out-of-range command/result code where the spec says to treat it as
    /// fatal.
    Protocol(&'static str),
    /// A std::io operation failed.
    Io(io::Error),
}

impl SysError {
    /// True for errors that mean "the peer process is gone" rather than a
    /// recoverable local condition. Transport-fatal per spec §7.
    pub fn is_transport_fatal(&self) -> bool {
        matches!(self, SysError::Protocol(_))
            || matches!(self, SysError::Syscall(_, Errno::PIPE))
            || matches!(self, SysError::Syscall(_, Errno::CONNRESET))
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SysError::Syscall(op, errno) => write!(f, "{}: {}", op, errno),
            SysError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            SysError::Io(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for SysError {}

impl From<io::Error> for SysError {
    fn from(err: io::Error) -> Self {
        SysError::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, SysError>;
