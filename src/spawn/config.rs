use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use nix::sched::CloneFlags;

/// Container spawn options, delivered by the controller as long-form flags.
/// Trailing positional arguments form the target command and its argv.
#[derive(Parser, Debug)]
#[command(disable_help_flag = true, no_binary_name = true)]
pub struct SpawnConfig {
    /// KEY=VALUE entries forming the entire environment of the target.
    #[arg(long = "env")]
    pub env: Vec<String>,

    /// Cgroup tasks files the container's PID 1 joins before any privilege
    /// change.
    #[arg(long = "taskfile")]
    pub taskfiles: Vec<PathBuf>,

    /// Externally opened descriptors for slots 0/1/2; negative leaves the
    /// slot as is.
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    pub stdinfd: i32,
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    pub stdoutfd: i32,
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    pub stderrfd: i32,

    #[arg(long)]
    pub new_ipc_namespace: bool,
    #[arg(long)]
    pub new_mount_namespace: bool,
    #[arg(long)]
    pub new_network_namespace: bool,
    #[arg(long)]
    pub new_pid_namespace: bool,
    #[arg(long)]
    pub new_uts_namespace: bool,
    #[arg(long)]
    pub new_user_namespace: bool,

    /// Existing namespace descriptors to enter before unsharing.
    #[arg(long)]
    pub join_ipc_namespace: Option<PathBuf>,
    #[arg(long)]
    pub join_mount_namespace: Option<PathBuf>,
    #[arg(long)]
    pub join_network_namespace: Option<PathBuf>,
    #[arg(long)]
    pub join_pid_namespace: Option<PathBuf>,
    #[arg(long)]
    pub join_uts_namespace: Option<PathBuf>,
    #[arg(long)]
    pub join_user_namespace: Option<PathBuf>,

    /// Id-map payloads written verbatim to /proc/<pid>/{uid,gid}_map.
    #[arg(long)]
    pub uidmap: Option<String>,
    #[arg(long)]
    pub gidmap: Option<String>,

    /// Source directory that becomes the new root. Without it no filesystem
    /// isolation is performed.
    #[arg(long)]
    pub directory: Option<PathBuf>,

    /// Mount point for the new root; a fresh temporary directory is created
    /// when absent.
    #[arg(long)]
    pub target_directory: Option<PathBuf>,

    /// Final identity of the target, looked up by name first, then as a
    /// numeric id.
    #[arg(long)]
    pub user: Option<String>,
    #[arg(long)]
    pub group: Option<String>,

    #[arg(long)]
    pub detach: bool,
    #[arg(long)]
    pub chroot: bool,
    #[arg(long)]
    pub privileged: bool,

    /// Target command and argv.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl SpawnConfig {
    pub fn from_args() -> Result<Self> {
        let config = Self::parse_from(std::env::args().skip(1));
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            bail!("no target command given");
        }
        if self.new_user_namespace && (self.uidmap.is_none() || self.gidmap.is_none()) {
            bail!("a new user namespace requires both --uidmap and --gidmap");
        }
        Ok(())
    }

    /// Union of the unshare flags selected by the new-namespace options.
    pub fn unshare_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.new_ipc_namespace {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.new_mount_namespace {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.new_network_namespace {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.new_pid_namespace {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.new_uts_namespace {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        if self.new_user_namespace {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        flags
    }

    /// Join paths in entry order. Mount is last: changing the mount namespace
    /// invalidates the /proc lookups the earlier joins rely on.
    pub fn join_paths(&self) -> Vec<&PathBuf> {
        [
            &self.join_user_namespace,
            &self.join_ipc_namespace,
            &self.join_uts_namespace,
            &self.join_network_namespace,
            &self.join_pid_namespace,
            &self.join_mount_namespace,
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}
