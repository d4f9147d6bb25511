use std::convert::Infallible;
use std::env;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixListener;

use anyhow::{bail, Context, Result};
use nix::sys::socket::{bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use tracing::{debug, warn};

mod child;
mod command;
mod handlers;
mod proc_title;
mod process;
mod reactor;
mod request;
mod response;
mod signals;

use reactor::Reactor;
use signals::SignalPipe;

/// Most pending connections the listener will hold.
const MAX_REQUEST_BACKLOG: i32 = 10;

/// sockaddr_un limit, including the terminating NUL.
const UNIX_PATH_MAX: usize = 108;

/// Entry point for the init-server role: bind the control socket, wire up
/// SIGCHLD, rename ourselves, and hand off to the reactor. Only returns on a
/// fatal error; the outer supervisor is expected to restart us.
pub fn run() -> Result<Infallible> {
    // /proc/1/cmdline should read as a plain init.
    if let Err(e) = proc_title::set_process_title("init") {
        warn!("could not set process title: {:#}", e);
    }

    let listener = open_control_socket()?;
    let signals = SignalPipe::install()?;

    Reactor::new(listener, signals).run()
}

/// Binds and listens on the UNIX socket named by INITD_SOCKET.
fn open_control_socket() -> Result<UnixListener> {
    let path = env::var("INITD_SOCKET").context("INITD_SOCKET is not set")?;
    if path.len() + 1 > UNIX_PATH_MAX {
        bail!(
            "socket path {} is too long ({} > {})",
            path,
            path.len() + 1,
            UNIX_PATH_MAX
        );
    }

    let sock = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .context("create control socket")?;
    let addr = UnixAddr::new(path.as_str()).context("socket address")?;
    bind(sock.as_raw_fd(), &addr).with_context(|| format!("bind control socket {}", path))?;
    listen(&sock, Backlog::new(MAX_REQUEST_BACKLOG)?)
        .with_context(|| format!("listen on {}", path))?;

    let listener = UnixListener::from(sock);
    listener
        .set_nonblocking(true)
        .context("mark control socket non-blocking")?;

    debug!("control socket {} opened", path);
    Ok(listener)
}
