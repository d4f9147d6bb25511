use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, error};

use super::response::REQUEST_OK;

/// Longest accepted supervised-process name, in bytes.
pub const MAX_NAME_LENGTH: usize = 100;

/// A named child started via START. Entries are never removed: STATUS keeps
/// reporting the final state of terminated processes.
#[derive(Debug)]
pub struct SupervisedProcess {
    name: Vec<u8>,
    pid: Pid,
    terminated: bool,
    status: Option<WaitStatus>,
}

impl SupervisedProcess {
    fn status_line(&self) -> String {
        if !self.terminated {
            return "running".to_string();
        }
        match self.status {
            Some(WaitStatus::Exited(_, code)) => format!("exited({})", code),
            Some(WaitStatus::Signaled(_, signal, _)) => format!("signaled({})", signal as i32),
            _ => "unknown".to_string(),
        }
    }
}

/// Tracks named children and reaps everything this PID 1 inherits.
#[derive(Debug, Default)]
pub struct Supervisor {
    processes: Vec<SupervisedProcess>,
}

impl Supervisor {
    pub fn new() -> Supervisor {
        Supervisor::default()
    }

    pub fn track(&mut self, name: Vec<u8>, pid: Pid) {
        self.processes.push(SupervisedProcess {
            name,
            pid,
            terminated: false,
            status: None,
        });
    }

    /// True while any tracked process has not terminated.
    pub fn any_alive(&self) -> bool {
        self.processes.iter().any(|p| !p.terminated)
    }

    /// Reaps every exited child without blocking. Returns true when at least
    /// one tracked process newly terminated, which is the waiters' cue.
    pub fn reap(&mut self) -> bool {
        let mut tracked_terminated = false;
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    let pid = match status.pid() {
                        Some(pid) => pid,
                        None => continue,
                    };
                    if let Some(p) = self
                        .processes
                        .iter_mut()
                        .find(|p| !p.terminated && p.pid == pid)
                    {
                        debug!(
                            "process '{}' terminated ({:?})",
                            String::from_utf8_lossy(&p.name),
                            status
                        );
                        p.terminated = true;
                        p.status = Some(status);
                        tracked_terminated = true;
                    }
                }
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!("error in waitpid(): {}", e);
                    break;
                }
            }
        }
        tracked_terminated
    }

    /// The STATUS reply: one name/state pair per tracked process in tracking
    /// order, between the OK header and the END trailer.
    pub fn status_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(
            REQUEST_OK.len()
                + self
                    .processes
                    .iter()
                    .map(|p| p.name.len() + 32)
                    .sum::<usize>()
                + 4,
        );
        payload.extend_from_slice(REQUEST_OK);
        for p in &self.processes {
            payload.extend_from_slice(&p.name);
            payload.push(b'\n');
            payload.extend_from_slice(p.status_line().as_bytes());
            payload.push(b'\n');
        }
        payload.extend_from_slice(b"END\n");
        payload
    }

    #[cfg(test)]
    fn mark_terminated(&mut self, pid: Pid, status: WaitStatus) {
        if let Some(p) = self
            .processes
            .iter_mut()
            .find(|p| !p.terminated && p.pid == pid)
        {
            p.terminated = true;
            p.status = Some(status);
        }
    }
}

/// Validates a START name: bounded length, no newlines (they would corrupt
/// the line-oriented STATUS payload).
pub fn valid_name(name: &[u8]) -> bool {
    name.len() <= MAX_NAME_LENGTH && !name.contains(&b'\n')
}
