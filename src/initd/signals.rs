use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{pipe, read};
use tracing::{debug, error};

use crate::err;

// The handler needs the write end as a plain integer; it is set once before
// the handler is installed and never changed.
static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

// A write failure inside the handler cannot be logged from there; it is
// parked here for the reactor to report.
static HANDLER_ERRNO: AtomicI32 = AtomicI32::new(0);

/// SIGCHLD handler: one byte into the self-pipe turns the async signal into a
/// level-triggered readiness event. Only async-signal-safe calls in here, and
/// errno is saved and restored around them.
extern "C" fn on_sigchld(_signal: libc::c_int) {
    let errno_ptr = unsafe { libc::__errno_location() };
    let saved_errno = unsafe { *errno_ptr };
    let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
    loop {
        let byte = 0u8;
        if unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) } != -1 {
            break;
        }
        match unsafe { *errno_ptr } {
            // A full pipe already guarantees the reactor will wake.
            libc::EAGAIN => break,
            libc::EINTR => continue,
            e => {
                HANDLER_ERRNO.store(e, Ordering::Relaxed);
                break;
            }
        }
    }
    unsafe { *errno_ptr = saved_errno };
}

/// Self-pipe wiring for SIGCHLD. The reactor polls the read end and drains it
/// before every reap sweep.
pub struct SignalPipe {
    rx: OwnedFd,
    // Kept alive for the lifetime of the handler.
    _tx: OwnedFd,
}

impl SignalPipe {
    pub fn install() -> Result<SignalPipe> {
        let (rx, tx) = pipe().context("create signal pipe")?;
        for fd in [&rx, &tx] {
            set_nonblocking(fd.as_raw_fd())?;
        }
        PIPE_WRITE_FD.store(tx.as_raw_fd(), Ordering::SeqCst);
        HANDLER_ERRNO.store(0, Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(on_sigchld),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe { sigaction(Signal::SIGCHLD, &action) }.context("install SIGCHLD handler")?;

        debug!("signal handler installed");
        Ok(SignalPipe { rx, _tx: tx })
    }

    pub fn reader(&self) -> &OwnedFd {
        &self.rx
    }

    /// Reads the pipe dry. The content is meaningless; emptiness is what
    /// re-arms the readiness event.
    pub fn drain(&self) {
        let mut buffer = [0u8; 1024];
        loop {
            match read(&self.rx, &mut buffer) {
                Ok(0) => return,
                Ok(_) => {}
                Err(Errno::EAGAIN) => return,
                Err(Errno::EINTR) => {}
                Err(e) => {
                    error!("error reading from signal pipe: {}", e);
                    return;
                }
            }
        }
    }

    /// Returns and clears the errno recorded by the handler, if any. A
    /// non-zero value means a wakeup may have been lost.
    pub fn take_handler_errno(&self) -> Option<Errno> {
        match HANDLER_ERRNO.swap(0, Ordering::Relaxed) {
            0 => None,
            raw => Some(Errno::from_raw(raw)),
        }
    }
}

pub fn set_nonblocking(fd: i32) -> Result<()> {
    let flags = err(unsafe { libc::fcntl(fd, libc::F_GETFL) }).context("fcntl F_GETFL")?;
    err(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })
        .context("fcntl F_SETFL")?;
    Ok(())
}
