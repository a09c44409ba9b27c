//! Control-RPC integration: registration datagrams with SCM_RIGHTS
//! directory descriptors, sent over a socketpair and dispatched through
//! the supervisor's listener path.

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use service_manager::control::{send_message, ControlCommand};
use service_manager::events::Event;
use service_manager::supervisor::Supervisor;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

struct Dirs {
    _tmp: tempfile::TempDir,
    supervise: PathBuf,
    scripts: PathBuf,
}

fn service_dirs() -> Dirs {
    let tmp = tempfile::tempdir().unwrap();
    let supervise = tmp.path().join("supervise");
    let scripts = tmp.path().join("service");
    std::fs::create_dir(&supervise).unwrap();
    std::fs::create_dir(&scripts).unwrap();
    Dirs {
        _tmp: tmp,
        supervise,
        scripts,
    }
}

fn dir_fd(path: &Path) -> OwnedFd {
    OwnedFd::from(File::open(path).unwrap())
}

/// Supervisor listening on one end of a datagram pair; send on the
/// returned client fd, then poke `Readable(listener)`.
fn listening_supervisor() -> (Supervisor, OwnedFd, RawFd) {
    let (client, server) = socketpair(
        AddressFamily::Unix,
        SockType::Datagram,
        None,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
    )
    .unwrap();
    let server_fd = server.as_raw_fd();
    let mut sup = Supervisor::new().unwrap();
    sup.add_listener(server).unwrap();
    (sup, client, server_fd)
}

fn send_load(client: &OwnedFd, name: &str, dirs: &Dirs) {
    let supervise = dir_fd(&dirs.supervise);
    let scripts = dir_fd(&dirs.scripts);
    send_message(
        client.as_raw_fd(),
        ControlCommand::Load as u8,
        name,
        &[supervise.as_raw_fd(), scripts.as_raw_fd()],
    )
    .unwrap();
}

#[test]
fn test_load_over_socket() {
    let (mut sup, client, listener) = listening_supervisor();
    let dirs = service_dirs();

    send_load(&client, "web", &dirs);
    sup.handle_event(Event::Readable(listener)).unwrap();

    assert_eq!(sup.registry().len(), 1);
    let ids = sup.registry().ids();
    assert_eq!(sup.registry().get(ids[0]).unwrap().name(), "web");
}

#[test]
fn test_duplicate_load_over_socket_is_noop() {
    let (mut sup, client, listener) = listening_supervisor();
    let dirs = service_dirs();

    send_load(&client, "web", &dirs);
    send_load(&client, "web-again", &dirs);
    sup.handle_event(Event::Readable(listener)).unwrap();

    assert_eq!(sup.registry().len(), 1);
    let ids = sup.registry().ids();
    // first registration wins
    assert_eq!(sup.registry().get(ids[0]).unwrap().name(), "web");
}

#[test]
fn test_unknown_command_is_dropped() {
    let (mut sup, client, listener) = listening_supervisor();
    let dirs = service_dirs();
    let fd = dir_fd(&dirs.supervise);

    send_message(client.as_raw_fd(), 99, "mystery", &[fd.as_raw_fd()]).unwrap();
    sup.handle_event(Event::Readable(listener)).unwrap();

    assert!(sup.registry().is_empty());
}

#[test]
fn test_wrong_fd_count_is_dropped() {
    let (mut sup, client, listener) = listening_supervisor();
    let dirs = service_dirs();
    let fd = dir_fd(&dirs.supervise);

    // LOAD wants two descriptors
    send_message(
        client.as_raw_fd(),
        ControlCommand::Load as u8,
        "web",
        &[fd.as_raw_fd()],
    )
    .unwrap();
    sup.handle_event(Event::Readable(listener)).unwrap();

    assert!(sup.registry().is_empty());
}

#[test]
fn test_unload_over_socket() {
    let (mut sup, client, listener) = listening_supervisor();
    let dirs = service_dirs();

    send_load(&client, "web", &dirs);
    sup.handle_event(Event::Readable(listener)).unwrap();
    assert_eq!(sup.registry().len(), 1);

    // an idle service unloads immediately
    let fd = dir_fd(&dirs.supervise);
    send_message(
        client.as_raw_fd(),
        ControlCommand::Unload as u8,
        "",
        &[fd.as_raw_fd()],
    )
    .unwrap();
    sup.handle_event(Event::Readable(listener)).unwrap();

    assert!(sup.registry().is_empty());
}

#[test]
fn test_unload_of_unregistered_directory_is_ignored() {
    let (mut sup, client, listener) = listening_supervisor();
    let registered = service_dirs();
    let stranger = service_dirs();

    send_load(&client, "web", &registered);
    sup.handle_event(Event::Readable(listener)).unwrap();

    let fd = dir_fd(&stranger.supervise);
    send_message(
        client.as_raw_fd(),
        ControlCommand::Unload as u8,
        "",
        &[fd.as_raw_fd()],
    )
    .unwrap();
    sup.handle_event(Event::Readable(listener)).unwrap();

    assert_eq!(sup.registry().len(), 1);
}

#[test]
fn test_make_run_on_empty_over_socket() {
    let (mut sup, client, listener) = listening_supervisor();
    let dirs = service_dirs();

    send_load(&client, "web", &dirs);
    sup.handle_event(Event::Readable(listener)).unwrap();
    let id = sup.registry().ids()[0];
    assert!(!sup.registry().get(id).unwrap().run_on_empty());

    let fd = dir_fd(&dirs.supervise);
    send_message(
        client.as_raw_fd(),
        ControlCommand::MakeRunOnEmpty as u8,
        "",
        &[fd.as_raw_fd()],
    )
    .unwrap();
    sup.handle_event(Event::Readable(listener)).unwrap();

    assert!(sup.registry().get(id).unwrap().run_on_empty());
}

#[test]
fn test_make_pipe_connectable_over_socket() {
    let (mut sup, client, listener) = listening_supervisor();
    let dirs = service_dirs();

    send_load(&client, "consumer", &dirs);
    sup.handle_event(Event::Readable(listener)).unwrap();
    let id = sup.registry().ids()[0];
    assert!(sup.registry().get(id).unwrap().pipe_read_fd().is_none());

    let fd = dir_fd(&dirs.supervise);
    send_message(
        client.as_raw_fd(),
        ControlCommand::MakePipeConnectable as u8,
        "",
        &[fd.as_raw_fd()],
    )
    .unwrap();
    sup.handle_event(Event::Readable(listener)).unwrap();

    assert!(sup.registry().get(id).unwrap().pipe_read_fd().is_some());
}

#[test]
fn test_plumb_connects_two_services() {
    let (mut sup, client, listener) = listening_supervisor();
    let producer = service_dirs();
    let consumer = service_dirs();

    send_load(&client, "producer", &producer);
    send_load(&client, "consumer", &consumer);
    sup.handle_event(Event::Readable(listener)).unwrap();
    assert_eq!(sup.registry().len(), 2);

    // consumer must be pipe-connectable first
    let consumer_fd = dir_fd(&consumer.supervise);
    send_message(
        client.as_raw_fd(),
        ControlCommand::MakePipeConnectable as u8,
        "",
        &[consumer_fd.as_raw_fd()],
    )
    .unwrap();

    let producer_fd = dir_fd(&producer.supervise);
    let consumer_fd = dir_fd(&consumer.supervise);
    send_message(
        client.as_raw_fd(),
        ControlCommand::Plumb as u8,
        "",
        &[producer_fd.as_raw_fd(), consumer_fd.as_raw_fd()],
    )
    .unwrap();
    sup.handle_event(Event::Readable(listener)).unwrap();

    // nothing observable failed; both services remain registered
    assert_eq!(sup.registry().len(), 2);
}
