//! Event-queue capability consumed by the supervisor
//!
//! One trait, one backend per OS. The supervisor never branches on the
//! operating system; it asks for readiness on descriptors and for signal
//! delivery, and blocks in exactly one place (`EventQueue::wait`).
//!
//! Signal delivery is implemented the same way on every backend: a
//! non-blocking self-pipe per registered signal, with the write end
//! handed to `signal_hook::low_level::pipe` and the read end added to
//! the readiness set. `Exited` events are a best-effort refinement some
//! kernels can provide; the supervisor must stay correct when a backend
//! never produces one and reaping is driven by SIGCHLD alone.

use crate::error::Result;
use crate::sys;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;
#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
mod poll;

/// One readiness or delivery notification out of `wait`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A registered descriptor has bytes (or a hangup) pending
    Readable(RawFd),
    /// A registered signal was delivered since the last wait
    Signalled(i32),
    /// Best-effort kernel notification that a tracked process exited.
    /// Backends that cannot produce this never will; the reaper also
    /// runs on `Signalled(SIGCHLD)`.
    Exited { pid: i32, status: i32 },
}

/// Blocking wait-for-events capability, one per supervisor instance
pub trait EventQueue {
    /// Register read-readiness interest in a descriptor
    fn add_read(&mut self, fd: RawFd) -> Result<()>;
    /// Drop all interest in a descriptor
    fn remove(&mut self, fd: RawFd) -> Result<()>;
    /// Register interest in a signal (self-pipe based on all backends)
    fn add_signal(&mut self, signo: i32) -> Result<()>;
    /// Block until at least one event is available, or until `timeout`
    /// elapses (`None` blocks indefinitely). A deadline expiry returns
    /// an empty batch.
    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<Event>>;
}

/// Build the event queue for this OS
pub fn default_queue() -> Result<Box<dyn EventQueue>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(epoll::EpollQueue::new()?))
    }
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    {
        Ok(Box::new(kqueue::KqueueQueue::new()?))
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    )))]
    {
        Ok(Box::new(poll::PollQueue::new()?))
    }
}

/// Shared self-pipe bookkeeping used by every backend
pub(crate) struct SignalPipes {
    /// read-end fd -> signal number
    by_fd: HashMap<RawFd, i32>,
    /// keeps both pipe ends alive; the write end stays registered with
    /// signal-hook for the life of the queue
    pipes: Vec<(OwnedFd, OwnedFd)>,
}

impl SignalPipes {
    pub(crate) fn new() -> Self {
        Self {
            by_fd: HashMap::new(),
            pipes: Vec::new(),
        }
    }

    /// Create the self-pipe for `signo` and return the read end to be
    /// registered with the backend.
    pub(crate) fn register(&mut self, signo: i32) -> Result<RawFd> {
        let (rd, wr) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        signal_hook::low_level::pipe::register_raw(signo, wr.as_raw_fd())
            .map_err(crate::error::Error::Io)?;
        let rfd = rd.as_raw_fd();
        self.by_fd.insert(rfd, signo);
        self.pipes.push((rd, wr));
        Ok(rfd)
    }

    /// If `fd` is one of our pipes, drain it and return the signal it
    /// stands for.
    pub(crate) fn translate(&self, fd: RawFd) -> Option<i32> {
        let signo = *self.by_fd.get(&fd)?;
        sys::drain(fd);
        Some(signo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::getpid;
    use std::io::Write;

    #[test]
    fn test_readable_roundtrip() {
        let mut queue = default_queue().unwrap();
        let (rd, wr) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).unwrap();
        queue.add_read(rd.as_raw_fd()).unwrap();

        let mut wr = std::fs::File::from(wr);
        wr.write_all(b"x").unwrap();
        let events = queue.wait(None).unwrap();
        assert!(events.contains(&Event::Readable(rd.as_raw_fd())));

        sys::drain(rd.as_raw_fd());
        queue.remove(rd.as_raw_fd()).unwrap();
    }

    #[test]
    fn test_signal_delivery() {
        // SIGWINCH is harmless to the test harness
        let mut queue = default_queue().unwrap();
        queue.add_signal(libc::SIGWINCH).unwrap();
        kill(getpid(), Signal::SIGWINCH).unwrap();

        let events = queue.wait(None).unwrap();
        assert!(events.contains(&Event::Signalled(libc::SIGWINCH)));
    }

    #[test]
    fn test_wait_deadline_returns_empty_batch() {
        let mut queue = default_queue().unwrap();
        let (rd, _wr) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).unwrap();
        queue.add_read(rd.as_raw_fd()).unwrap();

        let events = queue.wait(Some(Duration::from_millis(10))).unwrap();
        assert!(events.is_empty());
    }
}
