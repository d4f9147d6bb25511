use std::ffi::CString;
use std::ptr::null_mut;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::prctl;

use crate::err;

/// Rewrites how this process shows up in listings. The comm name is set with
/// PR_SET_NAME; the argv area read by ps is swapped for a fresh mapping via
/// PR_SET_MM. This does not hide the binary path (/proc/1/exe still tells),
/// it just keeps process listings unobtrusive.
pub fn set_process_title(title: &str) -> Result<()> {
    let cstr = CString::new(title).context("title contains a NUL byte")?;
    prctl::set_name(&cstr).context("prctl PR_SET_NAME")?;

    let len = title.len() + 1;
    let argv_start = unsafe {
        libc::mmap(
            null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if argv_start == libc::MAP_FAILED {
        return Err(Errno::last()).context("mmap argv area");
    }
    let argv_start = argv_start as *mut libc::c_char;
    let argv_end = unsafe { argv_start.add(len) };

    unsafe {
        std::ptr::copy_nonoverlapping(cstr.as_ptr(), argv_start, len);
    }

    // The kernel bounds-checks start against end, so the order that works
    // depends on where the old region sat; try both.
    let set_start =
        || err(unsafe { libc::prctl(libc::PR_SET_MM, libc::PR_SET_MM_ARG_START, argv_start, 0, 0) });
    let set_end =
        || err(unsafe { libc::prctl(libc::PR_SET_MM, libc::PR_SET_MM_ARG_END, argv_end, 0, 0) });

    if set_start().is_err() {
        set_end().context("prctl PR_SET_MM_ARG_END")?;
        set_start().context("prctl PR_SET_MM_ARG_START")?;
    } else {
        set_end().context("prctl PR_SET_MM_ARG_END")?;
    }

    Ok(())
}
