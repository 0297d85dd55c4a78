// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 LocalForward Contributors

// LocalForward - Process Handles
// Liveness, termination and spawning of the supervised SSH client
//
// A recorded pid can be reused by an unrelated process after the tunnel dies.
// On Linux the handle reports the process name from /proc so callers can tell
// the difference; elsewhere liveness is judged by pid alone.

use std::fs::File;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};
#[cfg(not(unix))]
use tracing::warn;

use crate::error::{Error, Result};
use crate::supervisor::LaunchSpec;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Capability over one OS process identified by pid
pub trait ProcessHandle {
    fn pid(&self) -> u32;

    fn is_alive(&self) -> bool;

    /// Ask the process to exit gracefully; `Error::NotRunning` if it is gone
    fn terminate(&self) -> Result<()>;

    /// Force the process to exit; `Error::NotRunning` if it is gone
    fn kill(&self) -> Result<()>;

    /// Executable name as the OS reports it, when the platform exposes one
    fn command_name(&self) -> Option<String> {
        None
    }

    /// Block until the process exits or `timeout` elapses; true if it exited
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }
}

/// Spawns tunnel processes and attaches to recorded ones
pub trait ProcessControl {
    /// Launch detached with stdin closed and stdout/stderr sent to `log`
    fn spawn(&self, spec: &LaunchSpec, log: File) -> Result<u32>;

    fn attach(&self, pid: u32) -> Box<dyn ProcessHandle>;
}

/// Real processes via signals
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessControl;

impl ProcessControl for SystemProcessControl {
    fn spawn(&self, spec: &LaunchSpec, log: File) -> Result<u32> {
        let stderr = log.try_clone()?;

        let mut command = Command::new(&spec.program);
        command
            .args(spec.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr));

        // Own process group so a ^C in the launching terminal does not reach it
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn()?;
        let pid = child.id();
        info!("Spawned {} with PID {}", spec.program, pid);
        // Not waited on: the tunnel outlives this invocation
        drop(child);
        Ok(pid)
    }

    fn attach(&self, pid: u32) -> Box<dyn ProcessHandle> {
        Box::new(SystemProcess { pid })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SystemProcess {
    pid: u32,
}

impl SystemProcess {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    /// Collect the exit status if the process is our own child, so an exited
    /// child is not reported alive as a zombie
    #[cfg(unix)]
    fn reap(&self) {
        let mut status = 0;
        unsafe {
            libc::waitpid(self.pid as libc::pid_t, &mut status, libc::WNOHANG);
        }
    }
}

impl ProcessHandle for SystemProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    #[cfg(unix)]
    fn is_alive(&self) -> bool {
        if self.pid == 0 || self.pid > i32::MAX as u32 {
            return false;
        }
        self.reap();

        // kill(pid, 0) only checks that the process exists
        let result = unsafe { libc::kill(self.pid as libc::pid_t, 0) };
        if result == 0 {
            return true;
        }

        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::ESRCH) => false, // No such process
            Some(libc::EPERM) => true,  // Exists, owned by someone else
            _ => false,
        }
    }

    #[cfg(not(unix))]
    fn is_alive(&self) -> bool {
        warn!("Process existence check not implemented for this platform");
        true
    }

    #[cfg(unix)]
    fn terminate(&self) -> Result<()> {
        debug!("Sending SIGTERM to PID {}", self.pid);
        self.signal(libc::SIGTERM)
    }

    #[cfg(unix)]
    fn kill(&self) -> Result<()> {
        debug!("Sending SIGKILL to PID {}", self.pid);
        self.signal(libc::SIGKILL)
    }

    #[cfg(not(unix))]
    fn terminate(&self) -> Result<()> {
        warn!("Signalling processes is not implemented for this platform");
        Err(Error::Command {
            command: format!("terminate {}", self.pid),
            code: None,
        })
    }

    #[cfg(not(unix))]
    fn kill(&self) -> Result<()> {
        warn!("Signalling processes is not implemented for this platform");
        Err(Error::Command {
            command: format!("kill {}", self.pid),
            code: None,
        })
    }

    #[cfg(target_os = "linux")]
    fn command_name(&self) -> Option<String> {
        std::fs::read_to_string(format!("/proc/{}/comm", self.pid))
            .ok()
            .map(|comm| comm.trim_end().to_string())
    }
}

#[cfg(unix)]
impl SystemProcess {
    fn signal(&self, signal: libc::c_int) -> Result<()> {
        if self.pid == 0 || self.pid > i32::MAX as u32 {
            return Err(Error::NotRunning);
        }

        let result = unsafe { libc::kill(self.pid as libc::pid_t, signal) };
        if result == 0 {
            return Ok(());
        }

        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Err(Error::NotRunning),
            Some(libc::EPERM) => Err(Error::PermissionDenied(format!(
                "not allowed to signal PID {}",
                self.pid
            ))),
            _ => Err(Error::Io(err)),
        }
    }
}

/// Whether `reported` (a kernel process name) belongs to `program`
///
/// Linux truncates names to 15 bytes, so only that prefix of the basename is
/// compared.
pub fn command_matches(reported: &str, program: &str) -> bool {
    const COMM_LEN: usize = 15;

    let base = Path::new(program)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string());
    let mut end = base.len().min(COMM_LEN);
    while !base.is_char_boundary(end) {
        end -= 1;
    }

    reported == &base[..end]
}

/// Open (and truncate) a log file with owner-only permissions
pub fn open_log(path: &Path) -> Result<File> {
    let file = File::create(path)?;
    crate::permissions::set_file_permissions_private(path)?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        let current = SystemProcess::new(std::process::id());
        assert!(current.is_alive());
    }

    #[cfg(unix)]
    #[test]
    fn test_nonexistent_process_not_alive() {
        // Above any pid_max on Linux and macOS
        let ghost = SystemProcess::new(999_999_999);
        assert!(!ghost.is_alive());
        assert!(matches!(ghost.terminate(), Err(Error::NotRunning)));
        assert!(ghost.wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_command_matches_basename_prefix() {
        assert!(command_matches("ssh", "ssh"));
        assert!(command_matches("ssh", "/usr/bin/ssh"));
        assert!(command_matches(
            "a-very-long-ssh",
            "/opt/bin/a-very-long-ssh-wrapper"
        ));
        assert!(!command_matches("nginx", "/usr/bin/ssh"));
        assert!(!command_matches("sshd", "ssh"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_command_name_of_real_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let handle = SystemProcess::new(child.id());

        assert_eq!(handle.command_name().as_deref(), Some("sleep"));

        handle.kill().unwrap();
        child.wait().unwrap();
        assert!(!handle.is_alive());
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_and_wait_real_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let handle = SystemProcess::new(child.id());

        assert!(handle.is_alive());
        assert!(!handle.wait(Duration::from_millis(50)));

        handle.terminate().unwrap();
        assert!(handle.wait(Duration::from_secs(5)));
        assert!(!handle.is_alive());
    }
}
