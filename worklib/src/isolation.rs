use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use nix::mount::{mount, umount, MsFlags};
use nix::unistd::{chdir, chroot, sethostname};
use thiserror::Error;
use tracing::{error, info};

const CGROUPS_ROOT: &str = "/sys/fs/cgroup";
const CGROUP_NAME: &str = "worker-api";

const CONTAINER_HOSTNAME: &str = "container";
const CONTAINER_ROOT: &str = "/tmp/alpine";

#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("no command supplied")]
    EmptyCommand,
    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Cgroup limits applied to spawned jobs, keyed as
/// subsystem -> control file suffix -> value.
pub struct CGroups {
    pub limits: HashMap<String, HashMap<String, String>>,
}

impl CGroups {
    /// Creates the cgroup directories and writes the configured limits.
    pub fn setup(&self) -> std::io::Result<()> {
        for (system, limits) in &self.limits {
            let system_path = Path::new(CGROUPS_ROOT).join(system).join(CGROUP_NAME);
            fs::create_dir_all(&system_path)?;
            for (file, limit) in limits {
                let control = format!("{}.{}", system, file);
                fs::write(system_path.join(control), limit)?;
            }
        }
        Ok(())
    }

    /// Moves the given pid into every configured cgroup.
    pub fn add_pid(&self, pid: u32) -> std::io::Result<()> {
        for system in self.limits.keys() {
            let procs = Path::new(CGROUPS_ROOT)
                .join(system)
                .join(CGROUP_NAME)
                .join("cgroup.procs");
            let mut file = OpenOptions::new().create(true).append(true).open(procs)?;
            write!(file, "{}", pid)?;
        }
        Ok(())
    }

    /// Removes the configured cgroups from the system.
    pub fn cleanup(&self) {
        for system in self.limits.keys() {
            let path = Path::new(CGROUPS_ROOT).join(system).join(CGROUP_NAME);
            if let Err(err) = fs::remove_dir_all(&path) {
                error!(system = system.as_str(), error = %err, "unable to remove cgroup");
            }
        }
    }
}

/// Runs `command` inside the prepared container image: sets the hostname,
/// pivots the root, mounts proc, executes the command with inherited stdio,
/// and tears the proc mount down afterwards. Returns the command's exit
/// code.
///
/// This is the re-exec entry point behind `server exec`; it must run in a
/// child, never in the serving process.
pub fn run_isolated(command: &str) -> Result<i32, IsolationError> {
    let mut parts = command.split_whitespace();
    let program = parts.next().ok_or(IsolationError::EmptyCommand)?;
    let args: Vec<&str> = parts.collect();

    sethostname(CONTAINER_HOSTNAME)?;
    chroot(CONTAINER_ROOT)?;
    chdir("/")?;
    mount(
        Some("proc"),
        "proc",
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )?;

    info!(command, "running isolated command");
    let status = Command::new(program)
        .args(&args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status();

    let unmounted = umount("proc");
    let status = status?;
    unmounted?;

    Ok(status.code().unwrap_or(-1))
}
