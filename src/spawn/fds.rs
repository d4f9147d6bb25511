use std::fs::OpenOptions;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use anyhow::{Context, Result};
use nix::dir::Dir;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::getpid;

use crate::err;

/// Duplicates the externally opened descriptors onto slots 0/1/2. A negative
/// descriptor leaves the slot untouched.
pub fn rebind_stdio(stdinfd: i32, stdoutfd: i32, stderrfd: i32) -> Result<()> {
    for (fd, slot) in [(stdinfd, 0), (stdoutfd, 1), (stderrfd, 2)] {
        if fd >= 0 {
            err(unsafe { libc::dup2(fd, slot) })
                .with_context(|| format!("dup fd {} onto slot {}", fd, slot))?;
        }
    }
    Ok(())
}

/// Closes every open descriptor other than 0, 1, 2 by walking
/// /proc/self/fdinfo. The walk itself holds a descriptor, so passes repeat
/// until one closes nothing.
pub fn close_extra_fds() -> Result<()> {
    loop {
        let mut dir = Dir::open(
            "/proc/self/fdinfo",
            OFlag::O_RDONLY | OFlag::O_DIRECTORY,
            Mode::empty(),
        )
        .context("open /proc/self/fdinfo")?;
        let dir_fd = dir.as_raw_fd();

        // Collect first: closing descriptors mid-iteration would yank entries
        // out from under the directory stream.
        let mut doomed = Vec::new();
        for entry in dir.iter() {
            let entry = entry.context("read /proc/self/fdinfo")?;
            let fd = match entry.file_name().to_str().ok().and_then(|n| n.parse::<i32>().ok()) {
                Some(fd) => fd,
                None => continue,
            };
            if fd <= 2 || fd == dir_fd {
                continue;
            }
            doomed.push(fd);
        }
        drop(dir);

        if doomed.is_empty() {
            return Ok(());
        }
        for fd in &doomed {
            err(unsafe { libc::close(*fd) }).with_context(|| format!("close fd {}", fd))?;
        }
    }
}

/// Enrolls the current pid into each cgroup tasks file.
pub fn join_cgroups(taskfiles: &[PathBuf]) -> Result<()> {
    let line = format!("{}\n", getpid());
    for path in taskfiles {
        let mut file = OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("open tasks file {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("join cgroup {}", path.display()))?;
    }
    Ok(())
}
