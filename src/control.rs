//! Control-RPC wire format
//!
//! Registration and connection requests arrive on pre-opened Unix
//! datagram sockets. One datagram = one fixed 65-byte header plus 1-3
//! directory descriptors attached via SCM_RIGHTS:
//!
//! ```text
//! ┌───────────┬──────────────────────────────┐
//! │ command   │ name (64 bytes, NUL padded)  │ + SCM_RIGHTS fds
//! │ (1 byte)  │                              │
//! └───────────┴──────────────────────────────┘
//! ```
//!
//! Decoding is deliberately forgiving: an unknown command or a wrong
//! descriptor count is logged and dropped by the dispatcher, never
//! fatal. Every received descriptor is marked close-on-exec before
//! anything else happens to it.

use crate::error::{Error, Result};
use crate::sys;
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// Fixed size of the name field
pub const NAME_LEN: usize = 64;

/// Total header size on the wire
pub const MESSAGE_LEN: usize = 1 + NAME_LEN;

/// Registration / connection commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCommand {
    /// name + supervise dir fd + script dir fd
    Load = 1,
    /// producer dir fd + consumer dir fd
    Plumb = 2,
    /// dir fd
    MakeInputActivated = 3,
    /// dir fd
    Unload = 4,
    /// dir fd
    MakePipeConnectable = 5,
    /// dir fd
    MakeRunOnEmpty = 6,
}

impl ControlCommand {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(ControlCommand::Load),
            2 => Some(ControlCommand::Plumb),
            3 => Some(ControlCommand::MakeInputActivated),
            4 => Some(ControlCommand::Unload),
            5 => Some(ControlCommand::MakePipeConnectable),
            6 => Some(ControlCommand::MakeRunOnEmpty),
            _ => None,
        }
    }

    /// How many descriptors a well-formed message carries
    pub fn fd_count(self) -> usize {
        match self {
            ControlCommand::Load | ControlCommand::Plumb => 2,
            _ => 1,
        }
    }
}

/// One decoded datagram. `command` stays raw so the dispatcher can log
/// unknown values; the fds are already owned and close-on-exec.
pub struct ControlMessageIn {
    pub command: u8,
    pub name: String,
    pub fds: Vec<OwnedFd>,
}

impl ControlMessageIn {
    pub fn parsed_command(&self) -> Option<ControlCommand> {
        ControlCommand::from_byte(self.command)
    }
}

/// Encode a header for sending
pub fn encode_header(command: u8, name: &str) -> Result<[u8; MESSAGE_LEN]> {
    let name_bytes = name.as_bytes();
    if name_bytes.len() >= NAME_LEN {
        return Err(Error::protocol(format!(
            "service name too long ({} bytes, max {})",
            name_bytes.len(),
            NAME_LEN - 1
        )));
    }
    let mut buf = [0u8; MESSAGE_LEN];
    buf[0] = command;
    buf[1..1 + name_bytes.len()].copy_from_slice(name_bytes);
    Ok(buf)
}

/// Send one control datagram with attached descriptors (client side;
/// also exercised by the integration tests).
pub fn send_message(socket: RawFd, command: u8, name: &str, fds: &[RawFd]) -> Result<()> {
    let buf = encode_header(command, name)?;
    let iov = [IoSlice::new(&buf)];
    let rights = ControlMessage::ScmRights(fds);
    sendmsg::<()>(socket, &iov, &[rights], MsgFlags::empty(), None)?;
    Ok(())
}

/// Receive one control datagram. `Ok(None)` means nothing was pending
/// (the listening sockets are non-blocking).
pub fn recv_message(socket: RawFd) -> Result<Option<ControlMessageIn>> {
    let mut buf = [0u8; MESSAGE_LEN];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 3]);

    let (bytes, raw_fds) = {
        let msg = match recvmsg::<()>(
            socket,
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        ) {
            Ok(msg) => msg,
            Err(Errno::EAGAIN) | Err(Errno::EWOULDBLOCK) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut raw_fds = Vec::new();
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                raw_fds.extend(fds);
            }
        }
        (msg.bytes, raw_fds)
    };

    // Take ownership and pin close-on-exec before any dispatch decision
    let fds: Vec<OwnedFd> = raw_fds
        .into_iter()
        .map(|fd| {
            let owned = unsafe { OwnedFd::from_raw_fd(fd) };
            if let Err(e) = sys::set_cloexec(fd) {
                eprintln!("service-manager: cannot set cloexec on passed fd: {}", e);
            }
            owned
        })
        .collect();

    if bytes < MESSAGE_LEN {
        return Err(Error::protocol(format!(
            "short control message ({} of {} bytes)",
            bytes, MESSAGE_LEN
        )));
    }

    let name_end = buf[1..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| 1 + p)
        .unwrap_or(MESSAGE_LEN);
    let name = String::from_utf8_lossy(&buf[1..name_end]).into_owned();

    Ok(Some(ControlMessageIn {
        command: buf[0],
        name,
        fds,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::os::fd::AsRawFd;

    fn dgram_pair() -> (OwnedFd, OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        )
        .unwrap()
    }

    #[test]
    fn test_header_round_trip() {
        let (a, b) = dgram_pair();
        let dir = tempfile::tempdir().unwrap();
        let dirf = std::fs::File::open(dir.path()).unwrap();

        send_message(
            a.as_raw_fd(),
            ControlCommand::Unload as u8,
            "postgres",
            &[dirf.as_raw_fd()],
        )
        .unwrap();

        let msg = recv_message(b.as_raw_fd()).unwrap().unwrap();
        assert_eq!(msg.parsed_command(), Some(ControlCommand::Unload));
        assert_eq!(msg.name, "postgres");
        assert_eq!(msg.fds.len(), 1);
    }

    #[test]
    fn test_unknown_command_still_decodes() {
        let (a, b) = dgram_pair();
        let dir = tempfile::tempdir().unwrap();
        let dirf = std::fs::File::open(dir.path()).unwrap();

        send_message(a.as_raw_fd(), 250, "mystery", &[dirf.as_raw_fd()]).unwrap();
        let msg = recv_message(b.as_raw_fd()).unwrap().unwrap();
        assert_eq!(msg.parsed_command(), None);
        assert_eq!(msg.command, 250);
        assert_eq!(msg.fds.len(), 1);
    }

    #[test]
    fn test_empty_socket_returns_none() {
        let (_a, b) = dgram_pair();
        assert!(recv_message(b.as_raw_fd()).unwrap().is_none());
    }

    #[test]
    fn test_name_too_long_is_rejected() {
        let long = "x".repeat(NAME_LEN);
        assert!(encode_header(1, &long).is_err());
    }

    #[test]
    fn test_expected_fd_counts() {
        assert_eq!(ControlCommand::Load.fd_count(), 2);
        assert_eq!(ControlCommand::Plumb.fd_count(), 2);
        assert_eq!(ControlCommand::Unload.fd_count(), 1);
        assert_eq!(ControlCommand::MakeInputActivated.fd_count(), 1);
        assert_eq!(ControlCommand::MakePipeConnectable.fd_count(), 1);
        assert_eq!(ControlCommand::MakeRunOnEmpty.fd_count(), 1);
    }
}
