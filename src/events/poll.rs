//! Portable poll(2) fallback backend
//!
//! Used on platforms with neither epoll nor kqueue. O(n) per wait,
//! which is acceptable at supervisor scale (tens of descriptors).

use super::{Event, EventQueue, SignalPipes};
use crate::error::Result;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

pub struct PollQueue {
    fds: Vec<RawFd>,
    signals: SignalPipes,
}

impl PollQueue {
    pub fn new() -> Result<Self> {
        Ok(Self {
            fds: Vec::new(),
            signals: SignalPipes::new(),
        })
    }
}

impl EventQueue for PollQueue {
    fn add_read(&mut self, fd: RawFd) -> Result<()> {
        if !self.fds.contains(&fd) {
            self.fds.push(fd);
        }
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> Result<()> {
        self.fds.retain(|&f| f != fd);
        Ok(())
    }

    fn add_signal(&mut self, signo: i32) -> Result<()> {
        let rfd = self.signals.register(signo)?;
        self.add_read(rfd)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<Event>> {
        let poll_timeout = match timeout {
            // poll timeouts are u16 milliseconds here; clamp longer waits
            Some(d) => PollTimeout::from(u16::try_from(d.as_millis()).unwrap_or(u16::MAX)),
            None => PollTimeout::NONE,
        };
        loop {
            let mut pollfds: Vec<PollFd> = self
                .fds
                .iter()
                .map(|&fd| {
                    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                    PollFd::new(borrowed, PollFlags::POLLIN)
                })
                .collect();

            match poll(&mut pollfds, poll_timeout) {
                Ok(0) => return Ok(Vec::new()),
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }

            let ready: Vec<RawFd> = pollfds
                .iter()
                .zip(&self.fds)
                .filter(|(p, _)| {
                    p.revents()
                        .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
                        .unwrap_or(false)
                })
                .map(|(_, &fd)| fd)
                .collect();

            if ready.is_empty() {
                continue;
            }

            let mut events = Vec::with_capacity(ready.len());
            for fd in ready {
                match self.signals.translate(fd) {
                    Some(signo) => events.push(Event::Signalled(signo)),
                    None => events.push(Event::Readable(fd)),
                }
            }
            return Ok(events);
        }
    }
}
