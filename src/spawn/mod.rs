use std::convert::Infallible;
use std::env;
use std::ffi::CString;
use std::os::fd::OwnedFd;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, unshare, CloneFlags};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{
    execvpe, fork, getgid, getuid, pipe, read, setgid, setgroups, setuid, ForkResult, Gid, Uid,
};
use tracing::{debug, info};

use crate::ident::{resolve_gid, resolve_uid};

mod config;
pub mod fds;
mod idmap;
pub mod rootfs;

pub use config::SpawnConfig;
use idmap::IdMapHelper;

/// Entry point for the spawner role. Returns the exit code the surviving
/// parent should report; the container side of the final fork never returns.
pub fn run() -> Result<i32> {
    let config = SpawnConfig::from_args()?;
    debug!("beginning container setup");
    setup_container(config)
}

/// The ordered setup sequence. Each step is fatal on failure: a partially
/// configured container must never run user code, so there is no rollback.
fn setup_container(config: SpawnConfig) -> Result<i32> {
    // The id maps can only be written by a process that stays outside the new
    // user namespace, so the helper forks before anything else changes.
    let helper = if config.new_user_namespace {
        let uid_map = config.uidmap.as_deref().unwrap_or_default();
        let gid_map = config.gidmap.as_deref().unwrap_or_default();
        Some(IdMapHelper::spawn(uid_map, gid_map)?)
    } else {
        None
    };

    debug!("configuring stdio descriptors");
    fds::rebind_stdio(config.stdinfd, config.stdoutfd, config.stderrfd)?;

    debug!("closing inherited descriptors");
    fds::close_extra_fds()?;

    debug!("joining cgroups");
    fds::join_cgroups(&config.taskfiles)?;

    debug!("joining namespaces");
    for path in config.join_paths() {
        join_namespace(path)?;
    }

    // Shed any privilege earned through setuid invocation before unsharing.
    debug!("resetting uid/gid");
    setgid(getgid()).context("reset gid")?;
    setuid(getuid()).context("reset uid")?;

    unshare(config.unshare_flags()).context("unshare namespaces")?;

    if let Some(helper) = helper {
        debug!("waiting for uid/gid maps");
        helper.resume_and_wait()?;

        // The maps are in place; become root of the new user namespace.
        setgid(Gid::from_raw(0)).context("become gid 0 in user namespace")?;
        setgroups(&[]).context("clear supplementary groups")?;
        setuid(Uid::from_raw(0)).context("become uid 0 in user namespace")?;
    }

    let root = match &config.directory {
        Some(source) => {
            debug!("creating root filesystem");
            Some(rootfs::create_root(
                source,
                config.target_directory.as_deref(),
                config.privileged,
            )?)
        }
        None => None,
    };

    // The detach pipe coordinates parent exit: the child closes its write end
    // right before exec, once the proc mount and pivot are done.
    let detach_pipe = if config.detach {
        Some(pipe().context("create detach pipe")?)
    } else {
        None
    };

    // The namespace changes only fully materialize across this fork; in a new
    // pid namespace it is the child that becomes PID 1.
    match unsafe { fork() }.context("final fork")? {
        ForkResult::Child => {
            let e = run_target(&config, root, detach_pipe).unwrap_err();
            Err(e)
        }
        ForkResult::Parent { child } => {
            if let Some((rx, tx)) = detach_pipe {
                drop(tx);
                let mut byte = [0u8; 1];
                let n = loop {
                    match read(&rx, &mut byte) {
                        Err(Errno::EINTR) => {}
                        other => break other.context("read detach pipe")?,
                    }
                };
                if n != 0 {
                    bail!("container child signalled failure before exec");
                }
                info!("container detached");
                Ok(0)
            } else {
                loop {
                    match waitpid(child, None).context("wait for container")? {
                        WaitStatus::Exited(_, code) => return Ok(code),
                        WaitStatus::Signaled(_, signal, _) => return Ok(128 + signal as i32),
                        _ => {}
                    }
                }
            }
        }
    }
}

fn join_namespace(path: &PathBuf) -> Result<()> {
    let fd = open(path, OFlag::O_RDONLY, Mode::empty())
        .with_context(|| format!("open namespace {}", path.display()))?;
    setns(&fd, CloneFlags::empty()).with_context(|| format!("enter namespace {}", path.display()))
}

/// Container side of the final fork: finish filesystem setup, drop identity,
/// and exec the target. Only returns on error.
fn run_target(
    config: &SpawnConfig,
    root: Option<PathBuf>,
    detach_pipe: Option<(OwnedFd, OwnedFd)>,
) -> Result<Infallible> {
    if config.new_mount_namespace {
        debug!("mounting /proc and /sys");
        rootfs::mount_proc()?;
    }
    if config.chroot {
        let root = root
            .as_ref()
            .context("--chroot requires a container directory")?;
        debug!("pivoting into root filesystem");
        rootfs::enter_root(root, config.privileged)?;
    }
    if config.detach {
        rootfs::set_console("/dev/console")?;
    }

    if let Some(group) = &config.group {
        let gid = resolve_gid(group)?;
        if gid.as_raw() != 0 {
            setgid(gid).with_context(|| format!("switch to group {}", group))?;
        }
    }
    if let Some(user) = &config.user {
        let uid = resolve_uid(user)?;
        if uid.as_raw() != 0 {
            setuid(uid).with_context(|| format!("switch to user {}", user))?;
        }
    }

    // Releasing the write end unblocks the waiting parent, which then exits
    // zero. Nothing may fail between here and exec.
    if let Some(pipe_fds) = detach_pipe {
        debug!("detaching");
        drop(pipe_fds);
    }

    // The target sees exactly the caller-supplied environment.
    for (key, _) in env::vars_os() {
        env::remove_var(key);
    }

    let argv = config
        .command
        .iter()
        .map(|s| CString::new(s.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .context("argv contains a NUL byte")?;
    let envp = config
        .env
        .iter()
        .map(|s| CString::new(s.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .context("environment contains a NUL byte")?;

    debug!("exec {}", config.command[0]);
    execvpe(&argv[0], &argv, &envp).with_context(|| format!("exec {}", config.command[0]))
}
