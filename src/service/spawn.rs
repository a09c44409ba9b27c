//! The fork+exec path for lifecycle programs
//!
//! The parent and child halves are kept strictly asymmetric: the parent
//! records the pid and returns to the event loop, the child performs
//! reset-signals -> setsid -> fchdir -> dup2 -> exec and nothing else.
//! Everything the child needs (argv, envp, descriptors) is prepared
//! before the fork so the child only makes raw syscalls.

use super::{Service, WaitOutcome};
use crate::error::{Error, Result};
use crate::sys;
use nix::sys::signal::Signal;
use nix::unistd::{fork, ForkResult};
use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;

/// Exit status used by the child when exec fails; reaped and recorded
/// like any other failure, which is what produces the crash-loop.
const EXEC_FAILED: i32 = 111;

/// Coarse class of a terminating signal, passed to the `restart`
/// program so it can distinguish an operator kill from a crash.
pub fn signal_class(sig: i32) -> &'static str {
    match sig {
        libc::SIGKILL => "kill",
        libc::SIGABRT | libc::SIGQUIT => "abort",
        libc::SIGSEGV | libc::SIGBUS | libc::SIGILL | libc::SIGFPE | libc::SIGSYS
        | libc::SIGTRAP => "crash",
        _ => "term",
    }
}

/// Short signal name without the SIG prefix ("SEGV"), falling back to
/// the number for signals nix cannot name (realtime range).
pub fn signal_name(sig: i32) -> String {
    match Signal::try_from(sig) {
        Ok(s) => s
            .as_str()
            .strip_prefix("SIG")
            .unwrap_or(s.as_str())
            .to_string(),
        Err(_) => sig.to_string(),
    }
}

/// Synthetic argv describing why a restart is happening:
/// `["restart", "exit", <code>]` for a normal exit, or
/// `["restart", <class>, <name>, <signo>[, "core"]]` for a signal death.
pub fn restart_cause_args(outcome: Option<WaitOutcome>) -> Vec<String> {
    let mut args = vec!["restart".to_string()];
    match outcome.unwrap_or(WaitOutcome::Exited(0)) {
        WaitOutcome::Exited(code) => {
            args.push("exit".to_string());
            args.push(code.to_string());
        }
        WaitOutcome::Signalled { sig, core } => {
            args.push(signal_class(sig).to_string());
            args.push(signal_name(sig));
            args.push(sig.to_string());
            if core {
                args.push("core".to_string());
            }
        }
    }
    args
}

fn cstring_vec(items: impl IntoIterator<Item = String>) -> Vec<CString> {
    items
        .into_iter()
        .filter_map(|s| CString::new(s).ok())
        .collect()
}

/// The supervisor's own environment, forwarded unchanged
fn environment() -> Vec<CString> {
    std::env::vars_os()
        .filter_map(|(k, v)| {
            let mut bytes = k.as_bytes().to_vec();
            bytes.push(b'=');
            bytes.extend_from_slice(v.as_bytes());
            CString::new(bytes).ok()
        })
        .collect()
}

fn ptr_vec(strings: &[CString]) -> Vec<*const libc::c_char> {
    let mut ptrs: Vec<*const libc::c_char> = strings.iter().map(|s| s.as_ptr()).collect();
    ptrs.push(std::ptr::null());
    ptrs
}

impl Service {
    /// Fork and exec one lifecycle program, returning the child pid.
    pub(super) fn spawn_program(&mut self, prog: &str) -> Result<i32> {
        // Opened without O_CLOEXEC: fexecve on a close-on-exec fd breaks
        // `#!` scripts because the interpreter cannot reopen the file.
        let prog_fd = sys::openat(self.service_dir.as_fd(), prog, libc::O_RDONLY, 0)
            .map_err(Error::Io)?;

        let args = if prog == "restart" {
            restart_cause_args(self.last_exit)
        } else {
            vec![prog.to_string()]
        };
        let argv = cstring_vec(args);
        let envp = environment();
        let argv_ptrs = ptr_vec(&argv);
        let envp_ptrs = ptr_vec(&envp);

        let stdin_fd = self.pipe.as_ref().map(|(rd, _)| rd.as_raw_fd());
        let stdout_fd = self.stdio_out.as_ref().map(|fd| fd.as_raw_fd());
        let stderr_fd = self.stdio_err.as_ref().map(|fd| fd.as_raw_fd());
        let dir_fd = self.service_dir.as_raw_fd();

        // SAFETY: the child runs only the exec sequence below and never
        // returns into the event loop.
        match unsafe { fork() }? {
            ForkResult::Parent { child } => Ok(child.as_raw()),
            ForkResult::Child => exec_child(
                dir_fd,
                prog_fd.as_raw_fd(),
                &argv_ptrs,
                &envp_ptrs,
                stdin_fd,
                stdout_fd,
                stderr_fd,
            ),
        }
    }
}

/// Child half: raw syscalls only, never returns.
fn exec_child(
    dir_fd: RawFd,
    prog_fd: RawFd,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
    stdin_fd: Option<RawFd>,
    stdout_fd: Option<RawFd>,
    stderr_fd: Option<RawFd>,
) -> ! {
    unsafe {
        // restore the pre-supervisor signal state
        let mut empty: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty);
        libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);

        // each child leads its own session, so whole-set signals can
        // target the process group
        libc::setsid();

        libc::fchdir(dir_fd);

        if let Some(fd) = stdin_fd {
            libc::dup2(fd, 0);
        }
        if let Some(fd) = stdout_fd {
            libc::dup2(fd, 1);
        }
        if let Some(fd) = stderr_fd {
            libc::dup2(fd, 2);
        }

        #[cfg(not(target_os = "macos"))]
        libc::fexecve(prog_fd, argv.as_ptr(), envp.as_ptr());

        // macOS has no fexecve; the cwd is already the script directory
        #[cfg(target_os = "macos")]
        {
            let _ = prog_fd;
            if !argv.is_empty() && !argv[0].is_null() {
                let mut rel = [0u8; 512];
                let name = std::ffi::CStr::from_ptr(argv[0]).to_bytes();
                if name.len() + 3 <= rel.len() {
                    rel[0] = b'.';
                    rel[1] = b'/';
                    rel[2..2 + name.len()].copy_from_slice(name);
                    libc::execve(rel.as_ptr() as *const libc::c_char, argv.as_ptr(), envp.as_ptr());
                }
            }
        }

        libc::_exit(EXEC_FAILED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_args_for_clean_exit() {
        let args = restart_cause_args(Some(WaitOutcome::Exited(0)));
        assert_eq!(args, vec!["restart", "exit", "0"]);
    }

    #[test]
    fn test_cause_args_for_failed_exit() {
        let args = restart_cause_args(Some(WaitOutcome::Exited(3)));
        assert_eq!(args, vec!["restart", "exit", "3"]);
    }

    #[test]
    fn test_cause_args_for_segfault_with_core() {
        let args = restart_cause_args(Some(WaitOutcome::Signalled {
            sig: libc::SIGSEGV,
            core: true,
        }));
        assert_eq!(
            args,
            vec![
                "restart".to_string(),
                "crash".to_string(),
                "SEGV".to_string(),
                libc::SIGSEGV.to_string(),
                "core".to_string(),
            ]
        );
    }

    #[test]
    fn test_cause_args_for_term_without_core() {
        let args = restart_cause_args(Some(WaitOutcome::Signalled {
            sig: libc::SIGTERM,
            core: false,
        }));
        assert_eq!(
            args,
            vec![
                "restart".to_string(),
                "term".to_string(),
                "TERM".to_string(),
                libc::SIGTERM.to_string(),
            ]
        );
    }

    #[test]
    fn test_signal_classes() {
        assert_eq!(signal_class(libc::SIGKILL), "kill");
        assert_eq!(signal_class(libc::SIGTERM), "term");
        assert_eq!(signal_class(libc::SIGINT), "term");
        assert_eq!(signal_class(libc::SIGABRT), "abort");
        assert_eq!(signal_class(libc::SIGQUIT), "abort");
        assert_eq!(signal_class(libc::SIGSEGV), "crash");
        assert_eq!(signal_class(libc::SIGBUS), "crash");
        assert_eq!(signal_class(libc::SIGILL), "crash");
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(libc::SIGSEGV), "SEGV");
        assert_eq!(signal_name(libc::SIGTERM), "TERM");
        assert_eq!(signal_name(libc::SIGHUP), "HUP");
    }

    #[test]
    fn test_no_recorded_outcome_defaults_to_clean_exit() {
        assert_eq!(restart_cause_args(None), vec!["restart", "exit", "0"]);
    }
}
