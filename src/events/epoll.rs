//! Linux epoll backend

use super::{Event, EventQueue, SignalPipes};
use crate::error::Result;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

/// How many events one wait call may return at most. Dispatch is
/// run-to-completion per event, so a small batch just means another
/// trip through epoll_wait.
const EVENT_BATCH: usize = 64;

pub struct EpollQueue {
    epoll: Epoll,
    signals: SignalPipes,
}

impl EpollQueue {
    pub fn new() -> Result<Self> {
        Ok(Self {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?,
            signals: SignalPipes::new(),
        })
    }

    fn add_fd(&mut self, fd: RawFd) -> Result<()> {
        // The caller owns the descriptor; epoll only borrows it.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .add(borrowed, EpollEvent::new(EpollFlags::EPOLLIN, fd as u64))?;
        Ok(())
    }
}

impl EventQueue for EpollQueue {
    fn add_read(&mut self, fd: RawFd) -> Result<()> {
        self.add_fd(fd)
    }

    fn remove(&mut self, fd: RawFd) -> Result<()> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match self.epoll.delete(borrowed) {
            Ok(()) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn add_signal(&mut self, signo: i32) -> Result<()> {
        let rfd = self.signals.register(signo)?;
        self.add_fd(rfd)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<Event>> {
        let timeout = match timeout {
            // epoll timeouts are u16 milliseconds; clamp longer waits
            Some(d) => EpollTimeout::from(u16::try_from(d.as_millis()).unwrap_or(u16::MAX)),
            None => EpollTimeout::NONE,
        };
        let mut buf = [EpollEvent::empty(); EVENT_BATCH];
        let n = loop {
            match self.epoll.wait(&mut buf, timeout) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        };

        let mut events = Vec::with_capacity(n);
        for ev in &buf[..n] {
            let fd = ev.data() as RawFd;
            match self.signals.translate(fd) {
                Some(signo) => events.push(Event::Signalled(signo)),
                None => events.push(Event::Readable(fd)),
            }
        }
        Ok(events)
    }
}
