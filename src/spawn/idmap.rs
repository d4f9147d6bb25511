use std::fs::OpenOptions;
use std::io::Write;

use anyhow::{bail, Context, Result};
use nix::sys::signal::{kill, raise, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

/// Sibling helper that writes the parent's id maps from outside the new user
/// namespace. Only a process that stayed outside the namespace may write
/// /proc/<pid>/{uid,gid}_map, so the helper forks before the unshare, stops
/// itself, and performs the writes once the parent resumes it post-unshare.
pub struct IdMapHelper {
    pid: Pid,
}

impl IdMapHelper {
    /// Forks the helper. The child never returns from this call.
    pub fn spawn(uid_map: &str, gid_map: &str) -> Result<IdMapHelper> {
        let parent = Pid::this();
        match unsafe { fork() }.context("fork id-map helper")? {
            ForkResult::Parent { child } => Ok(IdMapHelper { pid: child }),
            ForkResult::Child => {
                // Park until the parent has unshared and wants the maps.
                let code = match raise(Signal::SIGSTOP)
                    .map_err(anyhow::Error::from)
                    .and_then(|_| write_maps(parent, uid_map, gid_map))
                {
                    Ok(()) => 0,
                    Err(e) => {
                        tracing::error!("id-map helper: {:#}", e);
                        1
                    }
                };
                unsafe { libc::_exit(code) };
            }
        }
    }

    /// Waits for the stopped helper, resumes it, and waits for it to exit
    /// cleanly. Called by the parent right after the unshare.
    pub fn resume_and_wait(self) -> Result<()> {
        match waitpid(self.pid, Some(WaitPidFlag::WUNTRACED)).context("wait for id-map helper")? {
            WaitStatus::Stopped(_, _) => {}
            status => bail!("id-map helper ended early: {:?}", status),
        }
        kill(self.pid, Signal::SIGCONT).context("resume id-map helper")?;
        match waitpid(self.pid, None).context("wait for id-map helper exit")? {
            WaitStatus::Exited(_, 0) => Ok(()),
            status => bail!("id-map helper failed: {:?}", status),
        }
    }
}

/// The gid map goes first: uid ranges are only accepted once group handling
/// is settled for the target process.
fn write_maps(pid: Pid, uid_map: &str, gid_map: &str) -> Result<()> {
    write_map(pid, "gid", gid_map)?;
    write_map(pid, "uid", uid_map)?;
    Ok(())
}

fn write_map(pid: Pid, kind: &str, map: &str) -> Result<()> {
    let path = format!("/proc/{}/{}_map", pid, kind);
    let mut file = OpenOptions::new()
        .write(true)
        .open(&path)
        .with_context(|| format!("open {}", path))?;
    // The kernel requires the whole map in a single write.
    file.write_all(map.as_bytes())
        .with_context(|| format!("write {}", path))?;
    Ok(())
}
