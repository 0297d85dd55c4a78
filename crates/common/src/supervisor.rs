// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 LocalForward Contributors

// LocalForward - Tunnel Supervisor
// Owns the single SSH client process: launch, pid record, stop, logs
//
// State lives on disk so it survives across invocations:
//   Stopped  - no pid record, or a record whose process is gone
//   Running  - the recorded pid is alive and still runs the ssh binary

use std::fmt;
use std::fs;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::TunnelSettings;
use crate::error::{Error, Result};
use crate::hosts::HostEntry;
use crate::logs::follow_log;
use crate::permissions::{ensure_shared_directory, set_file_permissions_shared};
use crate::process::{command_matches, open_log, ProcessControl, ProcessHandle};
use crate::profile::ConnectionProfile;

const PID_FILE_NAME: &str = "tunnel.pid";
const PROFILE_FILE_NAME: &str = "tunnel.profile";
const LOG_FILE_NAME: &str = "tunnel.log";
const LOG_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One `-L` local port-forward
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardDirective {
    pub bind: Ipv4Addr,
    pub local_port: u16,
    pub host: String,
    pub remote_port: u16,
}

impl ForwardDirective {
    pub fn for_entry(entry: &HostEntry, port: u16) -> Self {
        Self {
            bind: entry.address,
            local_port: port,
            host: entry.name.clone(),
            remote_port: port,
        }
    }

    /// `bind:port:host:hostport` as ssh expects after -L
    pub fn to_ssh_arg(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.bind, self.local_port, self.host, self.remote_port
        )
    }
}

impl fmt::Display for ForwardDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.bind, self.local_port, self.host, self.remote_port
        )
    }
}

/// Everything needed to launch the SSH client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchSpec {
    pub program: String,
    pub identity_file: Option<PathBuf>,
    pub port: Option<u16>,
    pub verbose: bool,
    pub extra_args: Vec<String>,
    pub forwards: Vec<ForwardDirective>,
    /// `user@host`
    pub target: String,
}

impl LaunchSpec {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().into_owned());
        }
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if self.verbose {
            args.push("-v".to_string());
        }
        // No remote command; stdin is /dev/null so a shell would exit at once
        args.push("-N".to_string());
        args.extend(self.extra_args.iter().cloned());

        for forward in &self.forwards {
            args.push("-L".to_string());
            args.push(forward.to_ssh_arg());
        }

        args.push(self.target.clone());
        args
    }
}

/// One forward per host entry, all against the resolved profile
pub fn build_launch_spec(
    profile: &ConnectionProfile,
    entries: &[HostEntry],
    settings: &TunnelSettings,
) -> LaunchSpec {
    LaunchSpec {
        program: settings.ssh_binary.clone(),
        identity_file: profile.identity_file.clone(),
        port: profile.port,
        verbose: settings.verbose_ssh,
        extra_args: settings.extra_ssh_args.clone(),
        forwards: entries
            .iter()
            .map(|entry| ForwardDirective::for_entry(entry, settings.remote_port))
            .collect(),
        target: profile.target(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TunnelState {
    Stopped,
    Running { pid: u32 },
}

impl TunnelState {
    pub fn is_running(&self) -> bool {
        matches!(self, TunnelState::Running { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Signalled; `exited` is false if it outlived the stop timeout
    Stopped { pid: u32, exited: bool },
    /// Nothing recorded, or the recorded process was already gone
    NotRunning,
}

/// Supervises the single tunnel process through its pid record
pub struct TunnelSupervisor<'a> {
    state_dir: PathBuf,
    control: &'a dyn ProcessControl,
    stop_timeout: Duration,
    /// Binary the recorded pid must belong to, when the OS can tell
    program: Option<String>,
}

impl<'a> TunnelSupervisor<'a> {
    pub fn new(
        state_dir: impl Into<PathBuf>,
        control: &'a dyn ProcessControl,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            state_dir: state_dir.into(),
            control,
            stop_timeout,
            program: None,
        }
    }

    /// Only treat the recorded pid as ours while it runs `program`
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Get the path to the pid record
    pub fn pid_path(&self) -> PathBuf {
        self.state_dir.join(PID_FILE_NAME)
    }

    /// Get the path to the record of the profile the tunnel was launched with
    pub fn profile_path(&self) -> PathBuf {
        self.state_dir.join(PROFILE_FILE_NAME)
    }

    /// Get the path to the tunnel log
    pub fn log_path(&self) -> PathBuf {
        self.state_dir.join(LOG_FILE_NAME)
    }

    /// Read the pid record; None if absent or unreadable
    fn recorded_pid(&self) -> Option<u32> {
        let path = self.pid_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match contents.trim().parse::<u32>() {
                Ok(pid) => Some(pid),
                Err(_) => {
                    warn!("Ignoring unparsable PID record {}", path.display());
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Failed to read PID record {}: {}", path.display(), e);
                None
            }
        }
    }

    /// A live pid whose name says it is someone else's has been reused
    fn owns(&self, handle: &dyn ProcessHandle) -> bool {
        match (handle.command_name(), &self.program) {
            (Some(name), Some(program)) if !command_matches(&name, program) => {
                warn!(
                    "PID {} now belongs to {}, not {}; ignoring the record",
                    handle.pid(),
                    name,
                    program
                );
                false
            }
            _ => true,
        }
    }

    /// Current state, liveness-checked
    pub fn state(&self) -> TunnelState {
        let Some(pid) = self.recorded_pid() else {
            return TunnelState::Stopped;
        };

        let handle = self.control.attach(pid);
        if handle.is_alive() && self.owns(handle.as_ref()) {
            TunnelState::Running { pid }
        } else {
            debug!("PID record {} refers to a process that is gone", pid);
            TunnelState::Stopped
        }
    }

    /// Profile name the running tunnel was launched with
    pub fn running_profile(&self) -> Option<String> {
        if !self.state().is_running() {
            return None;
        }
        fs::read_to_string(self.profile_path())
            .ok()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
    }

    /// Launch the SSH client with one forward per entry and record its pid
    pub fn start(
        &self,
        profile: &ConnectionProfile,
        entries: &[HostEntry],
        settings: &TunnelSettings,
    ) -> Result<u32> {
        if let TunnelState::Running { pid } = self.state() {
            return Err(Error::AlreadyRunning(pid));
        }

        let pid_path = self.pid_path();
        if pid_path.exists() {
            warn!("Removing stale PID record {}", pid_path.display());
            fs::remove_file(&pid_path)?;
        }

        if entries.is_empty() {
            warn!("No managed hosts yet; starting tunnel without forwards");
        }

        let spec = build_launch_spec(profile, entries, settings);
        debug!("Launching {} {}", spec.program, spec.to_args().join(" "));

        ensure_shared_directory(&self.state_dir)?;
        let log = open_log(&self.log_path())?;
        let pid = self.control.spawn(&spec, log)?;

        // Readable by everyone so unelevated `status` sees the tunnel
        fs::write(&pid_path, pid.to_string())?;
        set_file_permissions_shared(&pid_path)?;
        let profile_path = self.profile_path();
        fs::write(&profile_path, &profile.name)?;
        set_file_permissions_shared(&profile_path)?;
        info!(
            "SSH tunnel started with PID {} ({} forwards)",
            pid,
            spec.forwards.len()
        );
        Ok(pid)
    }

    /// Signal the recorded process and clear the record
    ///
    /// The record is removed whenever one existed, even if signalling failed,
    /// so state never wedges in Running.
    pub fn stop(&self) -> Result<StopOutcome> {
        let pid_path = self.pid_path();
        if !pid_path.exists() {
            return Ok(StopOutcome::NotRunning);
        }

        let outcome = match self.recorded_pid() {
            None => Ok(StopOutcome::NotRunning),
            Some(pid) => {
                let handle = self.control.attach(pid);
                if !self.owns(handle.as_ref()) {
                    return self.finish_stop(Ok(StopOutcome::NotRunning));
                }
                match handle.terminate() {
                    Ok(()) => {
                        let exited = handle.wait(self.stop_timeout);
                        if exited {
                            info!("Stopped SSH tunnel with PID {}", pid);
                        } else {
                            warn!(
                                "SSH tunnel PID {} still running after {:?}",
                                pid, self.stop_timeout
                            );
                        }
                        Ok(StopOutcome::Stopped { pid, exited })
                    }
                    Err(Error::NotRunning) => {
                        debug!("PID {} was already gone", pid);
                        Ok(StopOutcome::NotRunning)
                    }
                    Err(e) => Err(e),
                }
            }
        };

        self.finish_stop(outcome)
    }

    fn finish_stop(&self, outcome: Result<StopOutcome>) -> Result<StopOutcome> {
        let pid_path = self.pid_path();
        if let Err(e) = fs::remove_file(&pid_path) {
            warn!("Failed to remove PID record {}: {}", pid_path.display(), e);
        }
        if let Err(e) = fs::remove_file(self.profile_path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove profile record: {}", e);
            }
        }
        outcome
    }

    /// Force `pid` down after a graceful stop timed out; true once it is gone
    pub fn kill(&self, pid: u32) -> Result<bool> {
        let handle = self.control.attach(pid);
        if !self.owns(handle.as_ref()) {
            return Ok(true);
        }
        match handle.kill() {
            Ok(()) => {
                let exited = handle.wait(self.stop_timeout);
                if exited {
                    info!("Killed SSH tunnel with PID {}", pid);
                }
                Ok(exited)
            }
            Err(Error::NotRunning) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Copy the log to `out`, then keep following growth until `should_stop`
    pub fn tail_logs<W, F>(&self, out: &mut W, follow: bool, should_stop: F) -> Result<()>
    where
        W: Write,
        F: FnMut() -> bool,
    {
        follow_log(&self.log_path(), out, follow, LOG_POLL_INTERVAL, should_stop)
    }
}
