//! Framed I/O over the master/slave command socket: fixed records, a
//! length-prefixed variable record, and a length-prefixed pack of variable
//! records (a string vector). Grounded in `libChildReadFull`/`libChildWriteFull`/
//! `libChildReadVariable`/`libChildWriteVariable`/`libChildReadPack`/
//! `libChildWritePack` from the original C implementation this protocol was
//! distilled from.
//!
//! Every multi-byte field on the wire is native-endian: both ends of the
//! socket are the same process tree on the same host, so there is no byte
//! order to normalize, same as the struct-over-socketpair convention the
//! original code used.

use crate::error::SysError;
use rustix::io::Errno;
use std::os::fd::AsFd;

/// Outcome of a read that may be asked to probe rather than block.
pub enum ReadOutcome<T> {
    Complete(T),
    WouldBlock,
}

/// Read exactly `buf.len()` bytes from `fd`.
///
/// When `probe_first` is set, the very first underlying `read(2)` of the
/// record is attempted non-blocking; if it would block, no bytes are
/// consumed and `WouldBlock` is returned so the caller can go back to its
/// poll loop. Once any data has arrived the read switches to blocking for
/// the rest of the record — a record, once begun, is always drained to
/// completion. `probe_first` is only ever passed `true` by the master, which
/// multiplexes the command socket with other fds; the slave always reads
/// blocking.
pub fn read_full<Fd: AsFd>(fd: Fd, buf: &mut [u8], probe_first: bool) -> Result<ReadOutcome<()>, SysError> {
    let mut pos = 0;
    let mut first = true;
    while pos < buf.len() {
        let probing = first && probe_first;
        if probing {
            crate::shim::fcntl_nonblock(&fd, true).map_err(|e| SysError::Syscall("fcntl(O_NONBLOCK)", e))?;
        }
        let result = rustix::io::read(&fd, &mut buf[pos..]);
        if probing {
            crate::shim::fcntl_nonblock(&fd, false).map_err(|e| SysError::Syscall("fcntl(O_NONBLOCK)", e))?;
        }
        match result {
            Ok(0) => return Err(SysError::Protocol("short read: peer closed mid-record")),
            Ok(n) => {
                pos += n;
                first = false;
            }
            Err(Errno::INTR) => continue,
            Err(Errno::AGAIN) if pos == 0 && probing => return Ok(ReadOutcome::WouldBlock),
            Err(err) => return Err(SysError::Syscall("read()", err)),
        }
    }
    Ok(ReadOutcome::Complete(()))
}

/// Write exactly `buf.len()` bytes to `fd`, blocking on `EINTR`/full socket
/// buffers. Used by the slave, whose writes to the master are never
/// reentrant with anything else it's waiting on.
pub fn write_full<Fd: AsFd>(fd: Fd, buf: &[u8]) -> Result<(), SysError> {
    let mut pos = 0;
    while pos < buf.len() {
        match rustix::io::write(&fd, &buf[pos..]) {
            Ok(0) => return Err(SysError::Protocol("short write: peer closed mid-record")),
            Ok(n) => pos += n,
            Err(Errno::INTR) => continue,
            Err(err) => return Err(SysError::Syscall("write()", err)),
        }
    }
    Ok(())
}

/// Write exactly `buf.len()` bytes to `fd`, yielding to `on_would_block`
/// whenever the socket's send buffer is full instead of blocking inside the
/// write syscall. The master uses this for writes to the slave: it must keep
/// draining the slave's responses while its own command might be stuck
/// behind a full socket buffer, so `on_would_block` runs one pass of the
/// master's poll loop before the write is retried.
pub fn write_full_yielding<Fd: AsFd>(
    fd: Fd,
    buf: &[u8],
    mut on_would_block: impl FnMut() -> Result<(), SysError>,
) -> Result<(), SysError> {
    crate::shim::fcntl_nonblock(&fd, true).map_err(|e| SysError::Syscall("fcntl(O_NONBLOCK)", e))?;
    let result = (|| {
        let mut pos = 0;
        while pos < buf.len() {
            match rustix::io::write(&fd, &buf[pos..]) {
                Ok(0) => return Err(SysError::Protocol("short write: peer closed mid-record")),
                Ok(n) => pos += n,
                Err(Errno::INTR) => continue,
                Err(Errno::AGAIN) => on_would_block()?,
                Err(err) => return Err(SysError::Syscall("write()", err)),
            }
        }
        Ok(())
    })();
    crate::shim::fcntl_nonblock(&fd, false).map_err(|e| SysError::Syscall("fcntl(O_NONBLOCK)", e))?;
    result
}

/// Anything that can absorb a full buffer, blocking or yielding as the
/// caller's `write_full`/`write_full_yielding` closure sees fit. Lets
/// `write_variable`/`write_pack` stay agnostic of which side is calling.
pub trait Sink {
    fn send(&mut self, buf: &[u8]) -> Result<(), SysError>;
}

impl<F: FnMut(&[u8]) -> Result<(), SysError>> Sink for F {
    fn send(&mut self, buf: &[u8]) -> Result<(), SysError> {
        self(buf)
    }
}

/// Upper bound on a single variable record's payload. Defensive cap against
/// a corrupt or hostile peer claiming a multi-gigabyte length prefix.
pub const MAX_VARIABLE_LEN: u32 = 16 * 1024 * 1024;

/// Write a length-prefixed variable record: a 4-byte native-endian length
/// followed by `data`. No trailing NUL is written — that's a read-side
/// convenience only (see `read_variable`).
pub fn write_variable(sink: &mut impl Sink, data: &[u8]) -> Result<(), SysError> {
    let len = u32::try_from(data.len()).map_err(|_| SysError::Protocol("variable record too long"))?;
    sink.send(&len.to_ne_bytes())?;
    sink.send(data)
}

/// Read a length-prefixed variable record off `fd`, blocking.
///
/// Returns a buffer one byte longer than the record itself, with a trailing
/// NUL appended — mirrors `libChildReadVariable`'s defensive null terminator
/// so callers that want to treat the payload as a C string (program paths,
/// usernames) can do so without a separate allocation.
pub fn read_variable<Fd: AsFd>(fd: Fd) -> Result<Vec<u8>, SysError> {
    let mut len_buf = [0u8; 4];
    read_full(&fd, &mut len_buf, false)?;
    let len = u32::from_ne_bytes(len_buf);
    if len > MAX_VARIABLE_LEN {
        return Err(SysError::Protocol("variable record exceeds size limit"));
    }
    let len = len as usize;
    let mut buf = vec![0u8; len + 1];
    if len > 0 {
        read_full(&fd, &mut buf[..len], false)?;
    }
    buf[len] = 0;
    Ok(buf)
}

/// Write a length-prefixed pack (a vector of variable records): a 4-byte
/// native-endian count followed by that many variable records in order.
/// Used for argv/envp transfer on `EXEC`/`EXEC_PIPE`.
pub fn write_pack<S: AsRef<[u8]>>(sink: &mut impl Sink, items: &[S]) -> Result<(), SysError> {
    let count = u32::try_from(items.len()).map_err(|_| SysError::Protocol("pack too long"))?;
    sink.send(&count.to_ne_bytes())?;
    for item in items {
        write_variable(sink, item.as_ref())?;
    }
    Ok(())
}

/// Maximum number of entries accepted in a single pack. Same rationale as
/// `MAX_VARIABLE_LEN`.
pub const MAX_PACK_COUNT: u32 = 64 * 1024;

/// Read a pack off `fd`, blocking. Each entry keeps the trailing NUL
/// `read_variable` appends.
pub fn read_pack<Fd: AsFd>(fd: Fd) -> Result<Vec<Vec<u8>>, SysError> {
    let fd = fd.as_fd();
    let mut count_buf = [0u8; 4];
    read_full(fd, &mut count_buf, false)?;
    let count = u32::from_ne_bytes(count_buf);
    if count > MAX_PACK_COUNT {
        return Err(SysError::Protocol("pack exceeds size limit"));
    }
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        items.push(read_variable(fd)?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::net::{AddressFamily, SocketFlags, SocketType, socketpair};
    use std::os::fd::OwnedFd;

    fn pair() -> (OwnedFd, OwnedFd) {
        socketpair(AddressFamily::UNIX, SocketType::STREAM, SocketFlags::CLOEXEC, None).unwrap()
    }

    #[test]
    fn fixed_record_round_trips() {
        let (a, b) = pair();
        let payload = [1u8, 2, 3, 4, 5, 6, 7, 8];
        write_full(&a, &payload).unwrap();
        let mut got = [0u8; 8];
        read_full(&b, &mut got, false).unwrap();
        assert_eq!(payload, got);
    }

    #[test]
    fn variable_record_round_trips() {
        let (a, b) = pair();
        write_variable(&mut |buf: &[u8]| write_full(&a, buf), b"hello world").unwrap();
        let got = read_variable(&b).unwrap();
        assert_eq!(&got[..got.len() - 1], b"hello world");
        assert_eq!(got.last(), Some(&0u8));
    }

    #[test]
    fn empty_variable_record_round_trips() {
        let (a, b) = pair();
        write_variable(&mut |buf: &[u8]| write_full(&a, buf), b"").unwrap();
        let got = read_variable(&b).unwrap();
        assert_eq!(got, vec![0u8]);
    }

    #[test]
    fn pack_round_trips() {
        let (a, b) = pair();
        let items: Vec<&[u8]> = vec![b"one", b"two", b"three"];
        write_pack(&mut |buf: &[u8]| write_full(&a, buf), &items).unwrap();
        let got = read_pack(&b).unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(&got[0][..got[0].len() - 1], b"one");
        assert_eq!(&got[1][..got[1].len() - 1], b"two");
        assert_eq!(&got[2][..got[2].len() - 1], b"three");
    }

    #[test]
    fn empty_pack_round_trips() {
        let (a, b) = pair();
        let items: Vec<&[u8]> = vec![];
        write_pack(&mut |buf: &[u8]| write_full(&a, buf), &items).unwrap();
        let got = read_pack(&b).unwrap();
        assert!(got.is_empty());
    }
}
