//! The supervisor context and its event loop
//!
//! Single process, single thread: one blocking wait, then each event is
//! handled to completion before the next. The only concurrent moment is
//! the window between fork and exec in a child, and that child never
//! touches supervisor state. A panic or error while handling one event
//! is logged and the loop keeps going; the registry draining to empty
//! during shutdown is the only way `run` returns.

use crate::control::{recv_message, ControlCommand, ControlMessageIn};
use crate::error::Result;
use crate::events::{default_queue, Event, EventQueue};
use crate::registry::{FdRole, Registry, ServiceId};
use crate::service::{Service, StepOutcome, WaitOutcome};
use crate::sys;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

/// How long `wait` may block while a failed spawn is owed a retry
const SPAWN_RETRY_DEADLINE: Duration = Duration::from_secs(1);

pub struct Supervisor {
    queue: Box<dyn EventQueue>,
    registry: Registry,
    listeners: Vec<OwnedFd>,
    listener_fds: HashSet<RawFd>,
    /// Services whose last fork/exec failed; re-evaluated every loop
    /// pass until the spawn sticks (the crash-loop driver)
    spawn_retry: HashSet<ServiceId>,
    shutting_down: bool,
}

impl Supervisor {
    pub fn new() -> Result<Self> {
        Ok(Self::with_queue(default_queue()?))
    }

    /// Build a supervisor on a caller-supplied event queue
    pub fn with_queue(queue: Box<dyn EventQueue>) -> Self {
        Self {
            queue,
            registry: Registry::new(),
            listeners: Vec::new(),
            listener_fds: HashSet::new(),
            spawn_retry: HashSet::new(),
            shutting_down: false,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Adopt one pre-opened control socket
    pub fn add_listener(&mut self, socket: OwnedFd) -> Result<()> {
        let fd = socket.as_raw_fd();
        sys::set_nonblock(fd)?;
        self.queue.add_read(fd)?;
        self.listener_fds.insert(fd);
        self.listeners.push(socket);
        Ok(())
    }

    /// Register signal interest and silence SIGPIPE (a disconnected
    /// status reader must not kill the supervisor).
    pub fn install_signals(&mut self) -> Result<()> {
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
        for signo in [libc::SIGCHLD, libc::SIGTERM, libc::SIGINT, libc::SIGHUP] {
            self.queue.add_signal(signo)?;
        }
        Ok(())
    }

    /// The loop. Returns once a shutdown has drained the registry.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if self.shutting_down && self.registry.is_empty() {
                return Ok(());
            }
            // a pending spawn retry bounds the wait so the crash-loop
            // keeps turning even when no events arrive
            let timeout = if self.spawn_retry.is_empty() {
                None
            } else {
                Some(SPAWN_RETRY_DEADLINE)
            };
            let events = self.queue.wait(timeout)?;
            for event in events {
                // one bad event must never take the supervisor down
                let outcome = catch_unwind(AssertUnwindSafe(|| self.handle_event(event)));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        eprintln!("service-manager: error handling {:?}: {}", event, e)
                    }
                    Err(_) => eprintln!("service-manager: panic handling {:?}", event),
                }
            }
            self.retry_pending_spawns();
        }
    }

    pub fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Readable(fd) if self.listener_fds.contains(&fd) => self.drain_listener(fd),
            Event::Readable(fd) => self.drain_service_fd(fd),
            Event::Signalled(libc::SIGCHLD) => {
                self.reap();
                Ok(())
            }
            Event::Signalled(signo)
                if signo == libc::SIGTERM || signo == libc::SIGINT || signo == libc::SIGHUP =>
            {
                self.begin_shutdown();
                Ok(())
            }
            Event::Signalled(_) => Ok(()),
            // best-effort kernel exit notice; the generic drain below
            // picks up the actual wait status
            Event::Exited { .. } => {
                self.reap();
                Ok(())
            }
        }
    }

    fn drain_listener(&mut self, fd: RawFd) -> Result<()> {
        while let Some(msg) = recv_message(fd)? {
            self.handle_control_message(msg);
        }
        Ok(())
    }

    fn drain_service_fd(&mut self, fd: RawFd) -> Result<()> {
        let Some((id, role)) = self.registry.lookup_fd(fd) else {
            // stale registration; drop interest
            let _ = self.queue.remove(fd);
            return Ok(());
        };

        match role {
            FdRole::Control => {
                let mut buf = [0u8; 256];
                let n = sys::read_nonblock(fd, &mut buf)?;
                for &byte in &buf[..n] {
                    if self.registry.get(id).is_none() {
                        break; // an earlier byte unloaded the service
                    }
                    self.apply_control_byte(id, byte);
                }
            }
            FdRole::Activation => {
                // first byte wakes the service; the byte itself is left
                // for the service's stdin, so interest must be dropped
                // before it would fire again
                self.queue.remove(fd)?;
                self.registry.untrack_fd(fd);
                if let Some(service) = self.registry.get_mut(id) {
                    service.set_input_activated(false);
                }
                self.apply_control_byte(id, b'u');
            }
        }
        Ok(())
    }

    /// Apply one control byte, then let the machine and unload rules run
    pub fn apply_control_byte(&mut self, id: ServiceId, byte: u8) {
        if let Some(service) = self.registry.get_mut(id) {
            service.apply_control(byte);
            self.evaluate(id);
        }
    }

    /// Drive one service's state machine until it needs an external
    /// event, registering every forked pid for reap dispatch. A failed
    /// spawn parks the service on the retry list until a later pass
    /// gets the fork to stick.
    pub fn evaluate(&mut self, id: ServiceId) {
        loop {
            let Some(service) = self.registry.get_mut(id) else {
                self.spawn_retry.remove(&id);
                return;
            };
            match service.step() {
                StepOutcome::Forked(pid) => {
                    self.registry.track_pid(pid, id);
                }
                StepOutcome::Skipped => {}
                StepOutcome::Idle => {
                    self.spawn_retry.remove(&id);
                    break;
                }
                StepOutcome::SpawnFailed => {
                    self.spawn_retry.insert(id);
                    break;
                }
            }
        }
        self.maybe_unload(id);
    }

    /// Re-evaluate every service whose last fork/exec failed
    pub fn retry_pending_spawns(&mut self) {
        for id in self.spawn_retry.iter().copied().collect::<Vec<_>>() {
            self.evaluate(id);
        }
    }

    pub fn has_pending_spawns(&self) -> bool {
        !self.spawn_retry.is_empty()
    }

    /// Non-blockingly drain all pending child status changes
    pub fn reap(&mut self) {
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
        loop {
            match waitpid(Pid::from_raw(-1), Some(flags)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.child_gone(pid.as_raw(), WaitOutcome::Exited(code));
                }
                Ok(WaitStatus::Signaled(pid, sig, core)) => {
                    self.child_gone(
                        pid.as_raw(),
                        WaitOutcome::Signalled {
                            sig: sig as i32,
                            core,
                        },
                    );
                }
                Ok(WaitStatus::Stopped(pid, _)) => {
                    match self.registry.lookup_pid(pid.as_raw()) {
                        Some(id) => {
                            if let Some(service) = self.registry.get_mut(id) {
                                service.process_pause_changed(true);
                            }
                        }
                        // we never leave an untracked child stopped
                        None => {
                            let _ = kill(pid, Signal::SIGCONT);
                        }
                    }
                }
                Ok(WaitStatus::Continued(pid)) => {
                    if let Some(id) = self.registry.lookup_pid(pid.as_raw()) {
                        if let Some(service) = self.registry.get_mut(id) {
                            service.process_pause_changed(false);
                        }
                    }
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    eprintln!("service-manager: waitpid failed: {}", e);
                    break;
                }
            }
        }
    }

    fn child_gone(&mut self, pid: i32, outcome: WaitOutcome) {
        let Some(id) = self.registry.untrack_pid(pid) else {
            return; // not ours (or already forgotten)
        };
        if let Some(service) = self.registry.get_mut(id) {
            service.process_exited(pid, outcome);
        }
        self.evaluate(id);
    }

    /// Shutdown is the ordinary machinery: every service gets `d` plus
    /// unload-after-stop, and the loop drains the registry to empty.
    pub fn begin_shutdown(&mut self) {
        if !self.shutting_down {
            eprintln!("service-manager: termination signal, stopping all services");
        }
        self.shutting_down = true;
        for id in self.registry.ids() {
            if let Some(service) = self.registry.get_mut(id) {
                service.set_unload_after_stop();
                service.apply_control(b'd');
            }
            self.evaluate(id);
        }
    }

    fn maybe_unload(&mut self, id: ServiceId) {
        let unloadable = self
            .registry
            .get(id)
            .map(|s| s.is_unloadable())
            .unwrap_or(false);
        if unloadable {
            self.unload(id);
        }
    }

    fn unload(&mut self, id: ServiceId) {
        let Some(service) = self.registry.get(id) else { return };
        let control_fd = service.control_fd();
        let activation_fd = if service.input_activated() {
            service.pipe_read_fd()
        } else {
            None
        };

        let _ = self.queue.remove(control_fd);
        if let Some(fd) = activation_fd {
            let _ = self.queue.remove(fd);
        }
        self.spawn_retry.remove(&id);
        if let Some(service) = self.registry.remove(id) {
            eprintln!("service-manager: unloaded {}", service.name());
        }
    }

    // -----------------------------------------------------------------
    // Control-RPC dispatch
    // -----------------------------------------------------------------

    pub fn handle_control_message(&mut self, msg: ControlMessageIn) {
        let Some(command) = msg.parsed_command() else {
            eprintln!(
                "service-manager: unknown control command {} ({} fds attached)",
                msg.command,
                msg.fds.len()
            );
            return; // fds close on drop
        };
        if msg.fds.len() != command.fd_count() {
            eprintln!(
                "service-manager: {:?} expects {} fds, got {}",
                command,
                command.fd_count(),
                msg.fds.len()
            );
            return;
        }

        let ControlMessageIn { name, mut fds, .. } = msg;
        match command {
            ControlCommand::Load => {
                let (Some(script_dir), Some(supervise)) = (fds.pop(), fds.pop()) else {
                    return;
                };
                if let Err(e) = self.load_service(&name, supervise, script_dir) {
                    eprintln!("service-manager: cannot load {}: {}", name, e);
                }
            }
            ControlCommand::Plumb => {
                let (Some(consumer), Some(producer)) = (fds.pop(), fds.pop()) else {
                    return;
                };
                self.plumb(producer, consumer);
            }
            ControlCommand::MakeInputActivated => {
                if let Some(id) = self.resolve_dir(&fds[0]) {
                    self.make_input_activated(id);
                }
            }
            ControlCommand::Unload => {
                if let Some(id) = self.resolve_dir(&fds[0]) {
                    if let Some(service) = self.registry.get_mut(id) {
                        service.set_unload_after_stop();
                    }
                    self.maybe_unload(id);
                }
            }
            ControlCommand::MakePipeConnectable => {
                if let Some(id) = self.resolve_dir(&fds[0]) {
                    if let Some(service) = self.registry.get_mut(id) {
                        if let Err(e) = service.make_pipe_connectable() {
                            eprintln!("service-manager: cannot allocate pipe: {}", e);
                        }
                    }
                }
            }
            ControlCommand::MakeRunOnEmpty => {
                if let Some(id) = self.resolve_dir(&fds[0]) {
                    if let Some(service) = self.registry.get_mut(id) {
                        service.set_run_on_empty();
                    }
                }
            }
        }
    }

    /// The LOAD operation. A duplicate identity is a no-op; a directory
    /// whose lock/control/ok/status cannot be opened is ignored with no
    /// partial registration left behind.
    pub fn load_service(
        &mut self,
        name: &str,
        supervise: OwnedFd,
        script_dir: OwnedFd,
    ) -> Result<Option<ServiceId>> {
        if !sys::is_directory(supervise.as_fd()) || !sys::is_directory(script_dir.as_fd()) {
            return Ok(None);
        }
        let ident = sys::dir_identity(supervise.as_fd())?;
        if self.registry.contains_ident(ident) {
            return Ok(None);
        }

        let service = Service::load(name, supervise, script_dir)?;
        let control_fd = service.control_fd();
        // Watch the FIFO before registering: if this fails the service
        // is dropped whole (descriptors closed, lock released) instead
        // of sitting in the registry with a dead control channel.
        self.queue.add_read(control_fd)?;
        let id = match self.registry.insert(service) {
            Some(id) => id,
            None => {
                let _ = self.queue.remove(control_fd);
                return Ok(None);
            }
        };
        Ok(Some(id))
    }

    /// The PLUMB operation: producer's stdout+stderr feed the
    /// consumer's internal pipe.
    fn plumb(&mut self, producer: OwnedFd, consumer: OwnedFd) {
        let Some(producer_id) = self.resolve_dir(&producer) else {
            eprintln!("service-manager: PLUMB producer is not registered");
            return;
        };
        let Some(consumer_id) = self.resolve_dir(&consumer) else {
            eprintln!("service-manager: PLUMB consumer is not registered");
            return;
        };

        let write_end = match self.registry.get(consumer_id).map(|s| s.pipe_write_dup()) {
            Some(Ok(Some(fd))) => fd,
            Some(Ok(None)) => {
                eprintln!("service-manager: PLUMB consumer is not pipe-connectable");
                return;
            }
            Some(Err(e)) => {
                eprintln!("service-manager: PLUMB dup failed: {}", e);
                return;
            }
            None => return,
        };
        let err_end = match write_end.try_clone() {
            Ok(fd) => fd,
            Err(e) => {
                eprintln!("service-manager: PLUMB dup failed: {}", e);
                return;
            }
        };
        if let Some(service) = self.registry.get_mut(producer_id) {
            service.plumb_output(write_end, err_end);
        }
    }

    /// The MAKE_INPUT_ACTIVATED operation: first byte on the service's
    /// pipe becomes control command `u`.
    pub fn make_input_activated(&mut self, id: ServiceId) {
        let Some(service) = self.registry.get_mut(id) else { return };
        if service.input_activated() {
            return;
        }
        if let Err(e) = service.make_pipe_connectable() {
            eprintln!("service-manager: cannot allocate pipe: {}", e);
            return;
        }
        let fd = match service.pipe_read_fd() {
            Some(fd) => fd,
            None => return,
        };
        service.set_input_activated(true);
        self.registry.track_fd(fd, id, FdRole::Activation);
        if let Err(e) = self.queue.add_read(fd) {
            eprintln!("service-manager: cannot watch activation pipe: {}", e);
        }
    }

    /// Map a passed directory fd to a registered service by (dev, ino)
    fn resolve_dir(&self, dir: &OwnedFd) -> Option<ServiceId> {
        let ident = sys::dir_identity(dir.as_fd()).ok()?;
        self.registry.lookup_ident(ident)
    }
}
