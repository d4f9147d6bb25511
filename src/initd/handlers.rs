use std::env;
use std::ffi::OsStr;
use std::path::Path;

use nix::unistd::{
    chdir, execvpe, fork, getgid, getuid, sethostname, setresgid, setresuid, ForkResult, Gid, Uid,
};
use tracing::{error, info};

use crate::ident::{resolve_gid, resolve_uid};
use crate::spawn::rootfs::enter_root;

use super::child;
use super::command::{Command, ExecSpec, Fault, StartSpec};
use super::process::Supervisor;
use super::response::{Payload, REQUEST_OK};

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/local/sbin:/usr/bin:/usr/sbin:/bin:/sbin";

/// What the reactor should do with the connection after a handler ran.
#[derive(Debug)]
pub enum Outcome {
    /// Queue this reply and close once it drains.
    Reply(Payload),
    /// Hold the connection in the waiter set.
    Park,
}

/// Executes a decoded command against the server state.
pub fn execute(fd: i32, command: Command, supervisor: &mut Supervisor) -> Result<Outcome, Fault> {
    match command {
        Command::Chroot { dir, privileged } => chroot(fd, &dir, privileged),
        Command::SetHostname { name } => set_hostname(fd, &name),
        Command::Exec(spec) => exec(fd, spec),
        Command::Start { name, spec } => start(fd, name, spec, supervisor),
        Command::Status => {
            info!("[{}] STATUS request", fd);
            Ok(Outcome::Reply(Payload::Dynamic(supervisor.status_payload())))
        }
        Command::Wait => {
            info!("[{}] WAIT request", fd);
            if supervisor.any_alive() {
                Ok(Outcome::Park)
            } else {
                Ok(Outcome::Reply(Payload::Fixed(REQUEST_OK)))
            }
        }
    }
}

fn chroot(fd: i32, dir: &Path, privileged: bool) -> Result<Outcome, Fault> {
    info!("[{}] CHROOT request", fd);
    if let Err(e) = enter_root(dir, privileged) {
        error!("[{}] failed to pivot into {}: {:#}", fd, dir.display(), e);
        return Err(Fault::Internal);
    }
    info!("[{}] pivoted into {}", fd, dir.display());
    Ok(Outcome::Reply(Payload::Fixed(REQUEST_OK)))
}

fn set_hostname(fd: i32, name: &OsStr) -> Result<Outcome, Fault> {
    info!("[{}] SETHOSTNAME request", fd);
    if let Err(e) = sethostname(name) {
        error!(
            "[{}] failed to sethostname({:?}): {}",
            fd,
            name.to_string_lossy(),
            e
        );
        return Err(Fault::Internal);
    }
    Ok(Outcome::Reply(Payload::Fixed(REQUEST_OK)))
}

/// EXEC hands PID 1 over to the target: after the fork it is the *parent*
/// that execs, while the child carries on as the reactor and answers the
/// request. The conventional child-execs shape would leave the exec'd program
/// with some other pid.
fn exec(fd: i32, spec: ExecSpec) -> Result<Outcome, Fault> {
    info!("[{}] EXEC request", fd);
    match unsafe { fork() } {
        Err(e) => {
            error!("[{}] error in fork(): {}", fd, e);
            Err(Fault::Internal)
        }
        Ok(ForkResult::Parent { .. }) => {
            // Descriptors first: everything above 2 goes, then the log files
            // land on the stdio slots.
            if child::close_fds_and_open_logs(&spec.stdout_path, &spec.stderr_path).is_err() {
                child::fail();
            }
            if become_identity(Uid::from_raw(0), Gid::from_raw(0)).is_err() {
                child::fail();
            }
            ensure_default_path();
            match execvpe(&spec.argv[0], &spec.argv, &spec.env) {
                Err(e) => {
                    error!("[{}] error executing {:?}: {}", fd, spec.argv[0], e);
                    child::fail()
                }
                Ok(infallible) => match infallible {},
            }
        }
        Ok(ForkResult::Child) => {
            info!("[{}] successful EXEC, responding OK", fd);
            Ok(Outcome::Reply(Payload::Fixed(REQUEST_OK)))
        }
    }
}

fn start(
    fd: i32,
    name: Option<Vec<u8>>,
    spec: StartSpec,
    supervisor: &mut Supervisor,
) -> Result<Outcome, Fault> {
    info!("[{}] START request", fd);

    let uid = match std::str::from_utf8(&spec.user).ok().map(resolve_uid) {
        Some(Ok(uid)) => uid,
        _ => {
            error!("[{}] error locating uid", fd);
            return Err(Fault::Internal);
        }
    };
    let gid = match std::str::from_utf8(&spec.group).ok().map(resolve_gid) {
        Some(Ok(gid)) => gid,
        _ => {
            error!("[{}] error locating gid", fd);
            return Err(Fault::Internal);
        }
    };

    match unsafe { fork() } {
        Err(e) => {
            error!("[{}] error in fork(): {}", fd, e);
            Err(Fault::Internal)
        }
        Ok(ForkResult::Child) => {
            if child::close_fds_and_open_logs(&spec.stdout_path, &spec.stderr_path).is_err() {
                child::fail();
            }
            if become_identity(uid, gid).is_err() {
                child::fail();
            }
            if let Some(dir) = &spec.workdir {
                if let Err(e) = chdir(dir.as_path()) {
                    error!("[{}] error setting working directory: {}", fd, e);
                    child::fail();
                }
            }
            ensure_default_path();
            match execvpe(&spec.argv[0], &spec.argv, &spec.env) {
                Err(e) => {
                    error!("[{}] error executing {:?}: {}", fd, spec.argv[0], e);
                    child::fail()
                }
                Ok(infallible) => match infallible {},
            }
        }
        Ok(ForkResult::Parent { child }) => {
            if let Some(name) = name {
                supervisor.track(name, child);
            }
            info!("[{}] successful start of pid {}", fd, child);
            Ok(Outcome::Reply(Payload::Fixed(REQUEST_OK)))
        }
    }
}

/// Switches real and effective ids and verifies the switch took.
fn become_identity(uid: Uid, gid: Gid) -> nix::Result<()> {
    setresgid(gid, gid, gid)?;
    if getgid() != gid {
        return Err(nix::errno::Errno::EPERM);
    }
    setresuid(uid, uid, uid)?;
    if getuid() != uid {
        return Err(nix::errno::Errno::EPERM);
    }
    Ok(())
}

/// Exec'd programs need a PATH for their own lookups; supply the standard one
/// when the server was started without.
fn ensure_default_path() {
    if env::var_os("PATH").is_none() {
        env::set_var("PATH", DEFAULT_PATH);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn wait_replies_immediately_with_nothing_alive() {
        let mut supervisor = Supervisor::new();
        match execute(3, Command::Wait, &mut supervisor) {
            Ok(Outcome::Reply(Payload::Fixed(bytes))) => assert_eq!(bytes, REQUEST_OK),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn wait_parks_while_a_process_runs() {
        let mut supervisor = Supervisor::new();
        supervisor.track(b"job".to_vec(), Pid::from_raw(77777));
        match execute(3, Command::Wait, &mut supervisor) {
            Ok(Outcome::Park) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn status_replies_with_the_supervisor_payload() {
        let mut supervisor = Supervisor::new();
        supervisor.track(b"job".to_vec(), Pid::from_raw(77777));
        match execute(3, Command::Status, &mut supervisor) {
            Ok(Outcome::Reply(Payload::Dynamic(bytes))) => {
                assert_eq!(bytes, b"REQUEST OK\njob\nrunning\nEND\n");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
