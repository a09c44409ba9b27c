//! Service supervisor binary
//!
//! Expects its control sockets pre-opened by whatever launched it
//! (LISTEN_PID/LISTEN_FDS convention). Everything after startup is the
//! event loop; the process exits when a termination signal has drained
//! every registered service.

use anyhow::{anyhow, Context, Result};
use service_manager::config;
use service_manager::supervisor::Supervisor;
use service_manager::sys;
use std::env;
use std::process;

fn main() -> Result<()> {
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                return Ok(());
            }
            "--version" => {
                println!("service-manager {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            other => {
                eprintln!("Error: unknown argument '{}'", other);
                print_usage();
                process::exit(2);
            }
        }
    }

    // The non-retried fatal class: a host where these fail is broken.
    config::raise_fd_limit().context("cannot raise the descriptor limit")?;
    sys::become_subreaper().context("cannot become a child subreaper")?;

    let mut supervisor = Supervisor::new().context("cannot create the event queue")?;

    let sockets = config::listen_sockets().context("cannot adopt listening sockets")?;
    if sockets.is_empty() {
        return Err(anyhow!(
            "no control sockets passed (set LISTEN_PID/LISTEN_FDS); refusing to run uncontrollable"
        ));
    }
    let socket_count = sockets.len();
    for socket in sockets {
        supervisor
            .add_listener(socket)
            .context("cannot watch a listening socket")?;
    }

    supervisor
        .install_signals()
        .context("cannot install signal handlers")?;

    eprintln!(
        "service-manager: ready, {} control socket{}",
        socket_count,
        if socket_count == 1 { "" } else { "s" }
    );

    supervisor.run()?;
    eprintln!("service-manager: all services unloaded, exiting");
    Ok(())
}

fn print_usage() {
    println!("service-manager v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: service-manager");
    println!();
    println!("Runs the service supervisor on control sockets inherited via the");
    println!("LISTEN_PID/LISTEN_FDS convention (first descriptor is 3). Services");
    println!("are registered over those sockets with LOAD messages carrying their");
    println!("supervise and script directory descriptors.");
    println!();
    println!("Options:");
    println!("  -h, --help   Show this help message");
    println!("  --version    Print the version");
}
