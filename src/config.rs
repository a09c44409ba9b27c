//! Process-level configuration and startup plumbing
//!
//! The supervisor takes its control sockets from the environment using
//! the inherited-descriptor convention (`LISTEN_PID`/`LISTEN_FDS`,
//! first descriptor is always 3): whatever launched us opens the Unix
//! datagram sockets and passes them pre-bound. There is no config
//! file; everything else a service needs lives in its directories.

use crate::error::Result;
use crate::sys;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// First inherited descriptor under the LISTEN_FDS convention
pub const LISTEN_FDS_START: RawFd = 3;

/// Parse the LISTEN_PID/LISTEN_FDS pair. Returns how many descriptors
/// were passed to *this* process; a stale or foreign LISTEN_PID means
/// the fds belong to someone else and the count is zero.
pub fn parse_listen_count(
    listen_pid: Option<&str>,
    listen_fds: Option<&str>,
    my_pid: i32,
) -> usize {
    let pid_matches = listen_pid
        .and_then(|s| s.trim().parse::<i32>().ok())
        .map(|pid| pid == my_pid)
        .unwrap_or(false);
    if !pid_matches {
        return 0;
    }
    listen_fds
        .and_then(|s| s.trim().parse::<usize>().ok())
        .unwrap_or(0)
}

/// Collect the pre-opened listening sockets from the environment,
/// marking each close-on-exec so services never inherit them.
pub fn listen_sockets() -> Result<Vec<OwnedFd>> {
    let count = parse_listen_count(
        std::env::var("LISTEN_PID").ok().as_deref(),
        std::env::var("LISTEN_FDS").ok().as_deref(),
        nix::unistd::getpid().as_raw(),
    );

    let mut sockets = Vec::with_capacity(count);
    for i in 0..count {
        let fd = LISTEN_FDS_START + i as RawFd;
        sys::set_cloexec(fd)?;
        // SAFETY: the convention hands us ownership of exactly these fds
        sockets.push(unsafe { OwnedFd::from_raw_fd(fd) });
    }
    Ok(sockets)
}

/// Raise the descriptor soft limit to the hard limit. Every service
/// costs several always-open descriptors, so the default soft limit is
/// the first thing a busy supervisor runs into.
pub fn raise_fd_limit() -> Result<()> {
    let (_, hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
    setrlimit(Resource::RLIMIT_NOFILE, hard, hard)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_requires_matching_pid() {
        assert_eq!(parse_listen_count(Some("100"), Some("2"), 100), 2);
        assert_eq!(parse_listen_count(Some("100"), Some("2"), 101), 0);
        assert_eq!(parse_listen_count(None, Some("2"), 100), 0);
    }

    #[test]
    fn test_count_tolerates_garbage() {
        assert_eq!(parse_listen_count(Some("abc"), Some("2"), 100), 0);
        assert_eq!(parse_listen_count(Some("100"), Some("abc"), 100), 0);
        assert_eq!(parse_listen_count(Some("100"), None, 100), 0);
        assert_eq!(parse_listen_count(Some(" 100 "), Some(" 3 "), 100), 3);
    }

    #[test]
    fn test_raise_fd_limit_is_idempotent() {
        raise_fd_limit().unwrap();
        raise_fd_limit().unwrap();
        let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
        assert_eq!(soft, hard);
    }
}
