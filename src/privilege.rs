//! Privilege drop for the slave's child-side fork, grounded in
//! `priv.c`'s `changeUser`. Only called between `fork()` and `execve()`, on
//! the single-threaded child side, so `getpwnam_r`'s C-string in/out
//! plumbing is fine to do with raw libc calls here rather than anything
//! async-signal-unsafe like allocating through the global allocator's lock
//! — `malloc` itself is not guaranteed fork-safe either, which is exactly
//! why the original C had to retry-on-`ERANGE` with its own buffer instead
//! of a safe wrapper; we keep that shape.

use rustix::io::Errno;
use std::ffi::{CStr, CString};
use std::io::Error;
use std::os::raw::c_char;

fn last_errno() -> Errno {
    Errno::from_io_error(&Error::last_os_error()).unwrap()
}

/// Resolve `username` and switch the calling (child-side, pre-exec) process
/// to that user's uid/gid, in the order that matters: `setgid` before
/// `initgroups` before `setuid`. Dropping `uid` first would leave the
/// process without permission to call `setgid`/`initgroups` afterward, since
/// those require privileges the `setuid` call just gave away.
///
/// # Safety
/// Must only be called on the single-threaded child side of a `fork()`,
/// before `execve()`. Calling it in a multi-threaded process would change
/// credentials for only the calling thread on some platforms.
pub unsafe fn drop_to_user(username: &CStr) -> Result<(), Errno> {
    if !rustix::process::getuid().is_root() {
        return Err(Errno::PERM);
    }

    let mut buflen: usize = 1024;
    let (uid, gid) = loop {
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut buf = vec![0 as c_char; buflen];
        let mut result: *mut libc::passwd = std::ptr::null_mut();

        let ret = unsafe {
            libc::getpwnam_r(username.as_ptr(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };

        if ret == libc::ERANGE {
            buflen *= 2;
            continue;
        }
        if ret != 0 {
            return Err(Errno::from_raw_os_error(ret));
        }
        if result.is_null() {
            return Err(Errno::NOENT);
        }

        break (pwd.pw_uid, pwd.pw_gid);
    };

    if unsafe { libc::setgid(gid) } != 0 {
        return Err(last_errno());
    }
    if unsafe { libc::initgroups(username.as_ptr(), gid) } != 0 {
        return Err(last_errno());
    }
    if unsafe { libc::setuid(uid) } != 0 {
        return Err(last_errno());
    }

    Ok(())
}

/// Convenience wrapper over `drop_to_user` taking a plain byte string (as
/// read off the wire) instead of a `CStr`, rejecting embedded NULs.
pub unsafe fn drop_to_user_bytes(username: &[u8]) -> Result<(), Errno> {
    let trimmed = username.split(|&b| b == 0).next().unwrap_or(username);
    let cstring = CString::new(trimmed).map_err(|_| Errno::INVAL)?;
    unsafe { drop_to_user(&cstring) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_to_drop_privilege_when_not_root() {
        if rustix::process::getuid().is_root() {
            // Test suites sometimes run as root (containers); the
            // early-return this test targets can't be exercised there.
            return;
        }
        let name = CString::new("nobody").unwrap();
        assert_eq!(unsafe { drop_to_user(&name) }, Err(Errno::PERM));
    }

    #[test]
    fn bytes_variant_truncates_at_the_wire_format_s_trailing_nul() {
        if rustix::process::getuid().is_root() {
            return;
        }
        // "nobody\0" is how a variable record arrives off the wire; the
        // trailing NUL must be stripped before the name reaches getpwnam_r,
        // not treated as part of the username.
        assert_eq!(unsafe { drop_to_user_bytes(b"nobody\0") }, Err(Errno::PERM));
    }
}
