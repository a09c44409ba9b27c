//! BSD/macOS kqueue backend
//!
//! Signals still go through the shared self-pipe so the dispatch path
//! is identical to the other backends. EVFILT_PROC exit attribution is
//! a possible refinement here; the generic SIGCHLD reap path does not
//! depend on it.

use super::{Event, EventQueue, SignalPipes};
use crate::error::Result;
use nix::errno::Errno;
use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};
use std::os::fd::RawFd;
use std::time::Duration;

const EVENT_BATCH: usize = 64;

pub struct KqueueQueue {
    kq: Kqueue,
    signals: SignalPipes,
}

impl KqueueQueue {
    pub fn new() -> Result<Self> {
        Ok(Self {
            kq: Kqueue::new()?,
            signals: SignalPipes::new(),
        })
    }

    fn change(&self, fd: RawFd, flags: EventFlag) -> Result<()> {
        let change = KEvent::new(
            fd as usize,
            EventFilter::EVFILT_READ,
            flags,
            FilterFlag::empty(),
            0,
            0,
        );
        match self.kq.kevent(&[change], &mut [], None) {
            Ok(_) => Ok(()),
            // Removing interest in an fd that was never added is fine.
            Err(Errno::ENOENT) if flags.contains(EventFlag::EV_DELETE) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl EventQueue for KqueueQueue {
    fn add_read(&mut self, fd: RawFd) -> Result<()> {
        self.change(fd, EventFlag::EV_ADD)
    }

    fn remove(&mut self, fd: RawFd) -> Result<()> {
        self.change(fd, EventFlag::EV_DELETE)
    }

    fn add_signal(&mut self, signo: i32) -> Result<()> {
        let rfd = self.signals.register(signo)?;
        self.change(rfd, EventFlag::EV_ADD)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<Event>> {
        let timeout = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let zero = KEvent::new(0, EventFilter::EVFILT_READ, EventFlag::empty(), FilterFlag::empty(), 0, 0);
        let mut buf = [zero; EVENT_BATCH];
        let n = loop {
            match self.kq.kevent(&[], &mut buf, timeout) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        };

        let mut events = Vec::with_capacity(n);
        for ev in &buf[..n] {
            let fd = ev.ident() as RawFd;
            match self.signals.translate(fd) {
                Some(signo) => events.push(Event::Signalled(signo)),
                None => events.push(Event::Readable(fd)),
            }
        }
        Ok(events)
    }
}
