//! Thin wrappers around the handful of syscalls `nix` does not cover
//!
//! Everything here works on raw descriptors relative to an already-open
//! directory fd, which is how the supervisor touches service directories
//! (paths are resolved once at registration; after that only the fds
//! matter, so a renamed service directory keeps working).

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

fn cstr(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
}

/// `openat(2)` relative to `dir`, returning an owned descriptor.
///
/// Callers pass `O_CLOEXEC` themselves. Almost everything wants it; the
/// one exception is the lifecycle-script fd handed to `fexecve`, where
/// close-on-exec would break `#!` interpreter resolution.
pub fn openat(dir: BorrowedFd<'_>, name: &str, flags: libc::c_int, mode: libc::mode_t) -> io::Result<OwnedFd> {
    let path = cstr(name)?;
    let fd = unsafe { libc::openat(dir.as_raw_fd(), path.as_ptr(), flags, mode as libc::c_uint) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// `mkfifoat(2)` relative to `dir`. EEXIST is not an error here; the
/// FIFO may have been created by an earlier supervisor or by tooling.
pub fn mkfifoat(dir: BorrowedFd<'_>, name: &str, mode: libc::mode_t) -> io::Result<()> {
    let path = cstr(name)?;
    let rc = unsafe { libc::mkfifoat(dir.as_raw_fd(), path.as_ptr(), mode) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err);
        }
    }
    Ok(())
}

/// Check whether an executable named `name` exists in `dir`.
pub fn executable_at(dir: BorrowedFd<'_>, name: &str) -> bool {
    let Ok(path) = cstr(name) else { return false };
    let rc = unsafe { libc::faccessat(dir.as_raw_fd(), path.as_ptr(), libc::X_OK, 0) };
    rc == 0
}

/// Mark a descriptor close-on-exec.
///
/// Every fd received over SCM_RIGHTS goes through here before anything
/// else looks at it.
pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Put a descriptor into non-blocking mode.
pub fn set_nonblock(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Non-blocking read. Returns the bytes read; an empty vec means EOF or
/// nothing pending (EAGAIN), both of which callers treat as "no data".
pub fn read_nonblock(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(0),
            _ => Err(err),
        };
    }
    Ok(rc as usize)
}

/// Drain everything pending on a non-blocking descriptor, discarding it.
/// Used for the signal wake-up pipes, where only the fact of delivery
/// matters.
pub fn drain(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        match read_nonblock(fd, &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }
}

/// `(st_dev, st_ino)` of an open descriptor, the stable identity of a
/// service directory.
pub fn dir_identity(fd: BorrowedFd<'_>) -> io::Result<(u64, u64)> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    let rc = unsafe { libc::fstat(fd.as_raw_fd(), st.as_mut_ptr()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let st = unsafe { st.assume_init() };
    Ok((st.st_dev as u64, st.st_ino as u64))
}

/// True if the descriptor refers to a directory.
pub fn is_directory(fd: BorrowedFd<'_>) -> bool {
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    let rc = unsafe { libc::fstat(fd.as_raw_fd(), st.as_mut_ptr()) };
    if rc < 0 {
        return false;
    }
    let st = unsafe { st.assume_init() };
    (st.st_mode & libc::S_IFMT) == libc::S_IFDIR
}

/// Become a child subreaper so double-forked descendants of services
/// re-parent to us instead of init. A no-op on platforms without the
/// prctl; those rely on the best-effort kernel exit events instead.
#[cfg(target_os = "linux")]
pub fn become_subreaper() -> io::Result<()> {
    let rc = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn become_subreaper() -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn test_openat_and_identity() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("probe"), b"x").unwrap();
        let dirf = std::fs::File::open(dir.path()).unwrap();

        let fd = openat(dirf.as_fd(), "probe", libc::O_RDONLY | libc::O_CLOEXEC, 0).unwrap();
        let (dev_a, ino_a) = dir_identity(dirf.as_fd()).unwrap();
        let (dev_b, ino_b) = dir_identity(fd.as_fd()).unwrap();
        assert_eq!(dev_a, dev_b);
        assert_ne!(ino_a, ino_b);
        assert!(is_directory(dirf.as_fd()));
        assert!(!is_directory(fd.as_fd()));
    }

    #[test]
    fn test_mkfifoat_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let dirf = std::fs::File::open(dir.path()).unwrap();
        mkfifoat(dirf.as_fd(), "control", 0o600).unwrap();
        mkfifoat(dirf.as_fd(), "control", 0o600).unwrap();
        let meta = std::fs::metadata(dir.path().join("control")).unwrap();
        use std::os::unix::fs::FileTypeExt;
        assert!(meta.file_type().is_fifo());
    }

    #[test]
    fn test_executable_at() {
        let dir = tempfile::tempdir().unwrap();
        let dirf = std::fs::File::open(dir.path()).unwrap();
        assert!(!executable_at(dirf.as_fd(), "run"));

        let path = dir.path().join("run");
        std::fs::write(&path, b"#!/bin/sh\nexit 0\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(executable_at(dirf.as_fd(), "run"));
    }
}
