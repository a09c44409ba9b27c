//! One supervised unit and its activity state machine
//!
//! A service is described by two directories: the supervise directory
//! (`lock`, `control`, `ok`, `status`) and the script directory holding
//! the `start`/`run`/`stop`/`restart` executables. Identity is the
//! `(dev, ino)` of the supervise directory, so a rename changes nothing
//! and a second registration of the same directory is a no-op.
//!
//! The state machine lives in [`next_step`]; it is a pure function of
//! (activity, pending command, process set, flags) so the transition
//! policy is testable without forking anything.

mod spawn;

pub use spawn::{restart_cause_args, signal_class, signal_name};

use crate::error::{Error, Result};
use crate::status::{ExitKind, ExitRecord, StatusBlock, Timestamp, STATUS_BLOCK_LEN};
use crate::sys;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::{kill, Signal};
use nix::sys::uio::pwrite;
use nix::unistd::Pid;
use std::collections::HashSet;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};

/// Lifecycle phase currently executing for a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activity {
    /// Idle / stopped
    #[default]
    None,
    Start,
    Run,
    Restart,
    Stop,
}

impl Activity {
    pub fn as_code(self) -> u8 {
        match self {
            Activity::None => 0,
            Activity::Start => 1,
            Activity::Run => 2,
            Activity::Restart => 3,
            Activity::Stop => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Activity::None),
            1 => Some(Activity::Start),
            2 => Some(Activity::Run),
            3 => Some(Activity::Restart),
            4 => Some(Activity::Stop),
            _ => None,
        }
    }

    /// Name of the lifecycle program run for this activity
    pub fn program(self) -> Option<&'static str> {
        match self {
            Activity::None => None,
            Activity::Start => Some("start"),
            Activity::Run => Some("run"),
            Activity::Restart => Some("restart"),
            Activity::Stop => Some("stop"),
        }
    }

    /// Index of this activity's exit-status slot in the status block
    pub fn slot(self) -> Option<usize> {
        match self {
            Activity::None => None,
            Activity::Start => Some(0),
            Activity::Run => Some(1),
            Activity::Restart => Some(2),
            Activity::Stop => Some(3),
        }
    }
}

/// Operator intent waiting to be consumed by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pending {
    #[default]
    None,
    /// `u`: bring the service up and keep it up
    Up,
    /// `d` (or `_`): bring the service down
    Down,
    /// `o`: run once, then stop
    Once,
    /// `O`: run at most once
    OnceAtMost,
}

impl Pending {
    pub fn as_byte(self) -> u8 {
        match self {
            Pending::None => 0,
            Pending::Up => b'u',
            Pending::Down => b'd',
            Pending::Once => b'o',
            Pending::OnceAtMost => b'O',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Pending::None),
            b'u' => Some(Pending::Up),
            b'd' => Some(Pending::Down),
            b'o' => Some(Pending::Once),
            b'O' => Some(Pending::OnceAtMost),
            _ => None,
        }
    }
}

/// How the most recently reaped process left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(i32),
    Signalled { sig: i32, core: bool },
}

impl WaitOutcome {
    /// Drives the restart-vs-stop decision at the end of RESTART
    pub fn failed(&self) -> bool {
        !matches!(self, WaitOutcome::Exited(0))
    }

    pub fn record(&self, stamp: Timestamp) -> ExitRecord {
        match *self {
            WaitOutcome::Exited(code) => ExitRecord {
                kind: ExitKind::Exited,
                code,
                stamp,
            },
            WaitOutcome::Signalled { sig, core } => ExitRecord {
                kind: if core {
                    ExitKind::SignalledCore
                } else {
                    ExitKind::Signalled
                },
                code: sig,
                stamp,
            },
        }
    }
}

/// Where the state machine goes on one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Stay,
    Goto(Activity),
}

/// The transition table.
///
/// Evaluated only when the process set is empty (a non-empty set only
/// ever clears a redundant `u`). A pending command survives until it
/// has finished steering the machine: `o`/`O` ride along until RESTART
/// turns them into a stop, `d` rides along until RESTART consumes it,
/// and `u` is dropped the moment the service is heading up (or turned
/// into a fresh START when a stop completes).
pub fn next_step(
    activity: Activity,
    pending: Pending,
    has_procs: bool,
    run_on_empty: bool,
    last_failed: bool,
) -> (Next, Pending) {
    if has_procs {
        if activity == Activity::Run && pending == Pending::Up {
            return (Next::Stay, Pending::None);
        }
        return (Next::Stay, pending);
    }

    match activity {
        Activity::None => match pending {
            Pending::Up | Pending::Once | Pending::OnceAtMost => {
                (Next::Goto(Activity::Start), pending)
            }
            Pending::Down | Pending::None => (Next::Stay, Pending::None),
        },
        Activity::Start => match pending {
            Pending::Down => (Next::Goto(Activity::Stop), Pending::None),
            other => (Next::Goto(Activity::Run), other),
        },
        Activity::Run => {
            if run_on_empty {
                match pending {
                    Pending::Up => (Next::Stay, Pending::None),
                    Pending::Down => (Next::Goto(Activity::Restart), pending),
                    other => (Next::Stay, other),
                }
            } else {
                (Next::Goto(Activity::Restart), pending)
            }
        }
        Activity::Restart => match pending {
            // keep `u`: the stop that follows bounces back into START
            Pending::Up => (Next::Goto(Activity::Stop), Pending::Up),
            Pending::Down | Pending::Once | Pending::OnceAtMost => {
                (Next::Goto(Activity::Stop), Pending::None)
            }
            Pending::None => {
                if last_failed {
                    (Next::Goto(Activity::Stop), Pending::None)
                } else {
                    (Next::Goto(Activity::Run), Pending::None)
                }
            }
        },
        Activity::Stop => match pending {
            Pending::Up => (Next::Goto(Activity::Start), Pending::None),
            _ => (Next::Goto(Activity::None), Pending::None),
        },
    }
}

/// Result of one `Service::step`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing to do until the next external event
    Idle,
    /// Entered a new activity and forked its lifecycle program
    Forked(i32),
    /// A transition happened without forking (missing optional script,
    /// or the machine reached NONE); evaluate again
    Skipped,
    /// fork/exec failed; state unchanged, retried on the next pass
    SpawnFailed,
}

/// One supervised unit
pub struct Service {
    name: String,
    ident: (u64, u64),
    service_dir: OwnedFd,
    _lock: Flock<File>,
    _ok: OwnedFd,
    control_read: OwnedFd,
    /// Perpetual internal write end; keeps the FIFO from reporting EOF
    /// when the last external writer disconnects.
    _control_write: OwnedFd,
    status_fd: OwnedFd,
    /// Internal pipe (read, write); present once made pipe-connectable
    pipe: Option<(OwnedFd, OwnedFd)>,
    /// stdio overrides applied in the child before exec
    stdio_out: Option<OwnedFd>,
    stdio_err: Option<OwnedFd>,
    processes: HashSet<i32>,
    main_pid: Option<i32>,
    pending: Pending,
    paused: bool,
    unload_after_stop: bool,
    run_on_empty: bool,
    input_activated: bool,
    activity: Activity,
    /// Set when fork/exec failed and the current activity must be
    /// re-entered on the next evaluation
    spawn_pending: bool,
    last_exit: Option<WaitOutcome>,
    records: [ExitRecord; 4],
    last_change: Timestamp,
}

impl Service {
    /// Open and register everything a supervise directory needs.
    ///
    /// Any failure here aborts the load with nothing left behind; the
    /// descriptors opened so far are dropped on the error path.
    pub fn load(name: &str, supervise: OwnedFd, script_dir: OwnedFd) -> Result<Service> {
        if !sys::is_directory(supervise.as_fd()) || !sys::is_directory(script_dir.as_fd()) {
            return Err(Error::protocol("LOAD requires two directory fds"));
        }
        let ident = sys::dir_identity(supervise.as_fd())?;

        let lock_fd = sys::openat(
            supervise.as_fd(),
            "lock",
            libc::O_WRONLY | libc::O_CREAT | libc::O_CLOEXEC,
            0o600,
        )?;
        let lock = Flock::lock(File::from(lock_fd), FlockArg::LockExclusiveNonblock)
            .map_err(|(_, errno)| Error::Sys(errno))?;

        sys::mkfifoat(supervise.as_fd(), "control", 0o600)?;
        sys::mkfifoat(supervise.as_fd(), "ok", 0o666)?;

        let control_read = sys::openat(
            supervise.as_fd(),
            "control",
            libc::O_RDONLY | libc::O_NONBLOCK | libc::O_CLOEXEC,
            0,
        )?;
        let control_write = sys::openat(
            supervise.as_fd(),
            "control",
            libc::O_WRONLY | libc::O_NONBLOCK | libc::O_CLOEXEC,
            0,
        )?;
        let ok = sys::openat(
            supervise.as_fd(),
            "ok",
            libc::O_RDONLY | libc::O_NONBLOCK | libc::O_CLOEXEC,
            0,
        )?;
        // O_TRUNC: a stale status file from an earlier supervisor must
        // not leave old bytes past the block we publish
        let status_fd = sys::openat(
            supervise.as_fd(),
            "status",
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
            0o644,
        )?;

        let mut service = Service {
            name: name.to_string(),
            ident,
            service_dir: script_dir,
            _lock: lock,
            _ok: ok,
            control_read,
            _control_write: control_write,
            status_fd,
            pipe: None,
            stdio_out: None,
            stdio_err: None,
            processes: HashSet::new(),
            main_pid: None,
            pending: Pending::None,
            paused: false,
            unload_after_stop: false,
            run_on_empty: false,
            input_activated: false,
            activity: Activity::None,
            spawn_pending: false,
            last_exit: None,
            records: Default::default(),
            last_change: Timestamp::now(),
        };
        service.publish_status();
        Ok(service)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ident(&self) -> (u64, u64) {
        self.ident
    }

    pub fn activity(&self) -> Activity {
        self.activity
    }

    pub fn pending(&self) -> Pending {
        self.pending
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn main_pid(&self) -> Option<i32> {
        self.main_pid
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    pub fn owns_pid(&self, pid: i32) -> bool {
        self.processes.contains(&pid)
    }

    pub fn control_fd(&self) -> RawFd {
        self.control_read.as_raw_fd()
    }

    pub fn run_on_empty(&self) -> bool {
        self.run_on_empty
    }

    pub fn set_run_on_empty(&mut self) {
        self.run_on_empty = true;
    }

    pub fn unload_after_stop(&self) -> bool {
        self.unload_after_stop
    }

    pub fn set_unload_after_stop(&mut self) {
        self.unload_after_stop = true;
    }

    /// A service leaves the registry only from here
    pub fn is_unloadable(&self) -> bool {
        self.activity == Activity::None && self.processes.is_empty() && self.unload_after_stop
    }

    /// Allocate the internal pipe if not already present
    pub fn make_pipe_connectable(&mut self) -> Result<()> {
        if self.pipe.is_none() {
            let pair = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?;
            self.pipe = Some(pair);
        }
        Ok(())
    }

    /// Read end of the internal pipe, used for input activation
    pub fn pipe_read_fd(&self) -> Option<RawFd> {
        self.pipe.as_ref().map(|(rd, _)| rd.as_raw_fd())
    }

    /// Duplicate of the pipe write end, handed to a plumbed producer
    pub fn pipe_write_dup(&self) -> Result<Option<OwnedFd>> {
        match &self.pipe {
            Some((_, wr)) => Ok(Some(wr.try_clone()?)),
            None => Ok(None),
        }
    }

    /// Point this service's stdout+stderr at another service's pipe
    pub fn plumb_output(&mut self, out: OwnedFd, err: OwnedFd) {
        self.stdio_out = Some(out);
        self.stdio_err = Some(err);
    }

    pub fn input_activated(&self) -> bool {
        self.input_activated
    }

    pub fn set_input_activated(&mut self, on: bool) {
        self.input_activated = on;
    }

    /// Apply one control-FIFO byte. Unknown bytes are ignored; the FIFO
    /// protocol has no framing and no acknowledgement.
    pub fn apply_control(&mut self, byte: u8) {
        match byte {
            b'u' => self.pending = Pending::Up,
            b'd' | b'_' => {
                self.pending = Pending::Down;
                // a stopped child must see the TERM
                self.signal_set(Signal::SIGTERM);
                self.signal_set(Signal::SIGCONT);
            }
            b'o' => self.pending = Pending::Once,
            b'O' => self.pending = Pending::OnceAtMost,
            b'x' => self.unload_after_stop = true,
            b'p' => {
                self.paused = true;
                self.signal_set(Signal::SIGSTOP);
            }
            b'c' => {
                self.paused = false;
                self.signal_set(Signal::SIGCONT);
            }
            b'a' => self.signal_set(Signal::SIGALRM),
            b'h' => self.signal_set(Signal::SIGHUP),
            b'i' => self.signal_set(Signal::SIGINT),
            b'k' => self.signal_set(Signal::SIGKILL),
            b'q' => self.signal_set(Signal::SIGQUIT),
            b't' => self.signal_set(Signal::SIGTERM),
            b'w' => self.signal_set(Signal::SIGWINCH),
            b'z' => self.signal_set(Signal::SIGTSTP),
            b'1' => self.signal_set(Signal::SIGUSR1),
            b'2' => self.signal_set(Signal::SIGUSR2),
            b'H' => self.signal_main(Signal::SIGHUP),
            b'T' => self.signal_main(Signal::SIGTERM),
            b'K' => self.signal_main(Signal::SIGKILL),
            _ => {}
        }
        self.publish_status();
    }

    /// Deliver a signal to every process group in the set. Each child
    /// is made a session leader at spawn, so `kill(-pid)` reaches its
    /// descendants; a plain pid is the fallback for the window before
    /// setsid takes effect.
    fn signal_set(&self, sig: Signal) {
        for &pid in &self.processes {
            if kill(Pid::from_raw(-pid), sig).is_err() {
                let _ = kill(Pid::from_raw(pid), sig);
            }
        }
    }

    /// Deliver a signal to the main process only
    fn signal_main(&self, sig: Signal) {
        if let Some(pid) = self.main_pid {
            let _ = kill(Pid::from_raw(pid), sig);
        }
    }

    /// Record a wait result for a tracked pid
    pub fn process_exited(&mut self, pid: i32, outcome: WaitOutcome) {
        self.processes.remove(&pid);
        if self.main_pid == Some(pid) {
            self.main_pid = None;
        }
        if let Some(slot) = self.activity.slot() {
            self.records[slot] = outcome.record(Timestamp::now());
        }
        self.last_exit = Some(outcome);
        self.publish_status();
    }

    /// A tracked pid was stopped or continued; only the pause flag and
    /// the published status change.
    pub fn process_pause_changed(&mut self, paused: bool) {
        self.paused = paused;
        self.publish_status();
    }

    /// One evaluation of the transition table, forking if a new
    /// activity is entered. Callers loop until `Idle` or `SpawnFailed`.
    pub fn step(&mut self) -> StepOutcome {
        if !self.processes.is_empty() {
            let (_, pending) = next_step(
                self.activity,
                self.pending,
                true,
                self.run_on_empty,
                false,
            );
            if pending != self.pending {
                self.pending = pending;
                self.publish_status();
            }
            return StepOutcome::Idle;
        }

        if self.spawn_pending {
            if self.pending == Pending::None {
                return self.enter_activity();
            }
            // an operator command steers out of a wedged spawn instead
            // of retrying it, so a service whose program never execs
            // can still be brought down
            self.spawn_pending = false;
        }

        let last_failed = self.last_exit.map(|o| o.failed()).unwrap_or(false);
        let (next, pending) = next_step(
            self.activity,
            self.pending,
            false,
            self.run_on_empty,
            last_failed,
        );
        let pending_changed = pending != self.pending;
        self.pending = pending;

        match next {
            Next::Stay => {
                if pending_changed {
                    self.publish_status();
                }
                StepOutcome::Idle
            }
            Next::Goto(Activity::None) => {
                self.activity = Activity::None;
                self.pending = Pending::None;
                self.publish_status();
                StepOutcome::Skipped
            }
            Next::Goto(act) => {
                self.activity = act;
                if act == Activity::Run && self.pending == Pending::Up {
                    self.pending = Pending::None;
                }
                self.enter_activity()
            }
        }
    }

    /// Enter the current activity: run its lifecycle program, or treat
    /// a missing optional one as an immediate success (`run` is the one
    /// mandatory program).
    fn enter_activity(&mut self) -> StepOutcome {
        let prog = match self.activity.program() {
            Some(p) => p,
            None => return StepOutcome::Idle,
        };

        if prog != "run" && !sys::executable_at(self.service_dir.as_fd(), prog) {
            let stamp = Timestamp::now();
            if let Some(slot) = self.activity.slot() {
                self.records[slot] = ExitRecord {
                    kind: ExitKind::Exited,
                    code: 0,
                    stamp,
                };
            }
            self.last_exit = Some(WaitOutcome::Exited(0));
            self.spawn_pending = false;
            self.publish_status();
            return StepOutcome::Skipped;
        }

        match self.spawn_program(prog) {
            Ok(pid) => {
                self.processes.insert(pid);
                self.main_pid = Some(pid);
                self.spawn_pending = false;
                self.publish_status();
                StepOutcome::Forked(pid)
            }
            Err(e) => {
                eprintln!(
                    "service-manager: {}: cannot spawn {}: {}; retrying",
                    self.name, prog, e
                );
                self.spawn_pending = true;
                // deliberate crash-loop pacing, no backoff cap
                std::thread::sleep(std::time::Duration::from_secs(1));
                StepOutcome::SpawnFailed
            }
        }
    }

    /// Snapshot the current state as a status block
    pub fn status_block(&self) -> StatusBlock {
        StatusBlock {
            stamp: self.last_change,
            pid: self.main_pid.unwrap_or(0) as u32,
            paused: self.paused,
            activity: self.activity,
            pending: self.pending,
            records: self.records,
        }
    }

    /// Rewrite the status file in one pwrite at offset 0
    pub fn publish_status(&mut self) {
        self.last_change = Timestamp::now();
        let bytes = self.status_block().encode();
        match pwrite(self.status_fd.as_fd(), &bytes, 0) {
            Ok(n) if n == STATUS_BLOCK_LEN => {}
            Ok(n) => eprintln!(
                "service-manager: {}: short status write ({} of {} bytes)",
                self.name, n, STATUS_BLOCK_LEN
            ),
            Err(e) => eprintln!("service-manager: {}: status write failed: {}", self.name, e),
        }
    }
}
