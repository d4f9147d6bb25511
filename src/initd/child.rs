use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;

use crate::err;
use crate::spawn::fds::close_extra_fds;

const DEV_NULL: &[u8] = b"/dev/null";

// sysexits.h operating-system-error code.
const EX_OSERR: i32 = 71;

/// Exits a forked child that failed before exec. The parent only learns of
/// the failure through the wait status.
pub fn fail() -> ! {
    unsafe { libc::_exit(EX_OSERR) }
}

/// Prepares a forked child's descriptor table for user code: every inherited
/// descriptor above 2 is closed, /dev/null becomes stdin, and the two log
/// paths land on stdout/stderr.
pub fn close_fds_and_open_logs(stdout_path: &[u8], stderr_path: &[u8]) -> nix::Result<()> {
    close_extra_fds().map_err(|_| nix::errno::Errno::EIO)?;

    let stdin = open(
        OsStr::from_bytes(DEV_NULL),
        OFlag::O_RDONLY | OFlag::O_NOFOLLOW,
        Mode::empty(),
    )?;
    replace_slot(stdin, 0)?;

    open_log(stdout_path, 1)?;
    open_log(stderr_path, 2)?;
    Ok(())
}

/// Logs are created mode 0700: their content is whatever user code prints,
/// so nobody but root gets to read them.
fn open_log(path: &[u8], slot: i32) -> nix::Result<()> {
    let fd = if path == DEV_NULL {
        open(
            OsStr::from_bytes(DEV_NULL),
            OFlag::O_WRONLY | OFlag::O_APPEND | OFlag::O_NOFOLLOW,
            Mode::empty(),
        )?
    } else {
        open(
            OsStr::from_bytes(path),
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_NOFOLLOW,
            Mode::from_bits_truncate(0o700),
        )?
    };
    replace_slot(fd, slot)
}

fn replace_slot(fd: std::os::fd::OwnedFd, slot: i32) -> nix::Result<()> {
    use std::os::fd::AsRawFd;
    err(unsafe { libc::dup2(fd.as_raw_fd(), slot) })?;
    Ok(())
}
