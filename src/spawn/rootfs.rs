use std::fs;
use std::os::unix::fs::{symlink, OpenOptionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::fcntl::{open, OFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, mkdtemp, pivot_root, setsid};
use scopeguard::defer;
use tracing::debug;

use crate::err;

const DEV_NODES: &[&str] = &["full", "fuse", "null", "random", "tty", "urandom", "zero"];

const DEV_SYMLINKS: &[(&str, &str)] = &[
    ("pts/ptmx", "dev/ptmx"),
    ("/proc/kcore", "dev/core"),
    ("/proc/self/fd", "dev/fd"),
    ("console", "dev/kmsg"),
    ("fd/0", "dev/stdin"),
    ("fd/1", "dev/stdout"),
    ("fd/2", "dev/stderr"),
];

fn mount_fs(
    source: &str,
    dest: &Path,
    fstype: &str,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    mount(Some(source), dest, Some(fstype), flags, data)
        .with_context(|| format!("mount {} ({}) at {}", source, fstype, dest.display()))
}

fn bind_mount(source: &Path, dest: &Path, flags: MsFlags) -> Result<()> {
    mount(
        Some(source),
        dest,
        None::<&str>,
        flags | MsFlags::MS_BIND,
        None::<&str>,
    )
    .with_context(|| format!("bind {} at {}", source.display(), dest.display()))
}

/// Creates a directory that may already exist in the container image.
fn ensure_dir<P: AsRef<Path>>(path: P) -> Result<()> {
    match fs::create_dir(&path) {
        Err(e) if e.kind() != std::io::ErrorKind::AlreadyExists => {
            Err(e).with_context(|| format!("create {}", path.as_ref().display()))
        }
        _ => Ok(()),
    }
}

/// Creates an empty mount target and binds a host device node onto it.
fn bind_node(source: &str, dest: &str) -> Result<()> {
    let _ = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(dest);
    bind_mount(Path::new(source), Path::new(dest), MsFlags::empty())
}

/// Materializes the container root: bind-mounts the source onto the target,
/// populates /dev and the pseudo filesystems, and leaves the process chdir'd
/// into the new root. Returns the root path for the later pivot.
pub fn create_root(source: &Path, target: Option<&Path>, privileged: bool) -> Result<PathBuf> {
    let saved = umask(Mode::empty());
    defer! { umask(saved); }

    // Back /tmp with tmpfs in the outer namespace first, so the bind target
    // below can be created even on a read-only host filesystem.
    ensure_dir("/tmp")?;
    mount_fs(
        "tmpfs",
        Path::new("/tmp"),
        "tmpfs",
        MsFlags::empty(),
        Some("mode=0755"),
    )?;

    let root = match target {
        Some(dir) => {
            ensure_dir(dir)?;
            dir.to_path_buf()
        }
        None => mkdtemp("/tmp/XXXXXX").context("create temporary root directory")?,
    };

    bind_mount(source, &root, MsFlags::MS_REC)?;
    chdir(&root).with_context(|| format!("enter new root {}", root.display()))?;

    ensure_dir("dev")?;
    if privileged {
        mount_fs(
            "devtmpfs",
            Path::new("dev"),
            "devtmpfs",
            MsFlags::empty(),
            Some(""),
        )?;
    } else {
        mount_fs(
            "tmpfs",
            Path::new("dev"),
            "tmpfs",
            MsFlags::MS_NOEXEC | MsFlags::MS_STRICTATIME,
            Some("mode=0755"),
        )?;
        for node in DEV_NODES {
            bind_node(&format!("/dev/{}", node), &format!("dev/{}", node))?;
        }
        for (target, link) in DEV_SYMLINKS {
            symlink(target, link).with_context(|| format!("symlink {}", link))?;
        }
    }

    ensure_dir("dev/mqueue")?;
    mount_fs(
        "mqueue",
        Path::new("dev/mqueue"),
        "mqueue",
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None,
    )?;
    ensure_dir("dev/pts")?;
    mount_fs(
        "devpts",
        Path::new("dev/pts"),
        "devpts",
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
        Some("newinstance,ptmxmode=0666"),
    )?;
    ensure_dir("dev/shm")?;
    mount_fs(
        "tmpfs",
        Path::new("dev/shm"),
        "tmpfs",
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=1777,size=65536k"),
    )?;

    ensure_dir("tmp")?;
    mount_fs(
        "tmpfs",
        Path::new("tmp"),
        "tmpfs",
        MsFlags::empty(),
        Some("mode=0755"),
    )?;

    debug!("root filesystem ready at {}", root.display());
    Ok(root)
}

/// Pivots into the prepared root. The old root lands at /host; unprivileged
/// containers detach and remove it, privileged ones keep it reachable.
pub fn enter_root(root: &Path, privileged: bool) -> Result<()> {
    chdir(root).with_context(|| format!("chdir {}", root.display()))?;
    fs::create_dir("host").context("create old-root mount point")?;
    pivot_root(".", "host").context("pivot into new root")?;
    chdir("/").context("chdir to new /")?;

    if !privileged {
        umount2("/host", MntFlags::MNT_DETACH).context("detach old root")?;
        let _ = fs::remove_dir("/host");
    }
    Ok(())
}

/// Mounts /proc and a read-only /sys inside the new mount namespace. Must run
/// in the final child: pid namespace membership only settles after its fork.
pub fn mount_proc() -> Result<()> {
    let saved = umask(Mode::empty());
    defer! { umask(saved); }

    ensure_dir("proc")?;
    ensure_dir("sys")?;

    mount_fs(
        "proc",
        Path::new("proc"),
        "proc",
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        None,
    )?;
    mount_fs(
        "sysfs",
        Path::new("sys"),
        "sysfs",
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_RDONLY,
        None,
    )?;
    Ok(())
}

/// Makes /dev/console the controlling terminal and the stdio of a detached
/// container's PID 1.
pub fn set_console(path: &str) -> Result<()> {
    setsid().context("setsid")?;
    use std::os::fd::AsRawFd;
    let fd = open(path, OFlag::O_RDWR, Mode::empty()).with_context(|| format!("open {}", path))?;
    let raw_fd = fd.as_raw_fd();
    err(unsafe { libc::ioctl(raw_fd, libc::TIOCSCTTY as _, 0) })
        .context("acquire controlling terminal")?;
    for slot in 0..=2 {
        err(unsafe { libc::dup2(raw_fd, slot) }).context("dup console onto stdio")?;
    }
    if raw_fd > 2 {
        let _ = err(unsafe { libc::close(raw_fd) });
    } else {
        std::mem::forget(fd);
    }
    Ok(())
}
