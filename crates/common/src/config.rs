// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 LocalForward Contributors

// LocalForward - Session Configuration
// Per-user settings: the default SSH profile plus tunnel and path overrides
//
// Loaded once per invocation and passed by reference to whatever needs it;
// written back only through an explicit `save()`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::alias::DEFAULT_LOOPBACK_INTERFACE;
use crate::allocator::AllocationRange;
use crate::error::{Error, Result};
use crate::hosts::DEFAULT_HOSTS_FILE;

const APP_DIR: &str = "localforward";

/// Pid record and log location; fixed so elevated and unelevated
/// invocations agree on it
pub const DEFAULT_STATE_DIR: &str = "/var/run/localforward";

/// Session configuration persisted as TOML
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SessionConfig {
    /// SSH profile used when `start` is called without one
    #[serde(default)]
    pub default_profile: Option<String>,

    #[serde(default)]
    pub tunnel: TunnelSettings,

    #[serde(default)]
    pub paths: PathSettings,

    /// Where this config was loaded from
    #[serde(skip)]
    path: PathBuf,
}

/// How the tunnel process is built and supervised
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TunnelSettings {
    /// SSH client binary
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,

    /// Port forwarded on both ends of every directive
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,

    /// First last-octet handed out (127.0.0.N)
    #[serde(default = "default_range_start")]
    pub range_start: u8,

    /// Last last-octet handed out, inclusive
    #[serde(default = "default_range_end")]
    pub range_end: u8,

    /// Loopback interface aliases are bound on
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Seconds `stop` waits for the SSH client to exit
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Pass -v to ssh so the log shows forwarding activity
    #[serde(default = "default_verbose_ssh")]
    pub verbose_ssh: bool,

    /// Extra arguments inserted before the forward directives
    #[serde(default)]
    pub extra_ssh_args: Vec<String>,
}

/// File locations; unset values fall back to platform defaults
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct PathSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosts_file: Option<PathBuf>,

    /// Holds the pid record and the tunnel log
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// OpenSSH client config profiles are resolved from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_config: Option<PathBuf>,
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_remote_port() -> u16 {
    80
}

fn default_range_start() -> u8 {
    2
}

fn default_range_end() -> u8 {
    254
}

fn default_interface() -> String {
    DEFAULT_LOOPBACK_INTERFACE.to_string()
}

fn default_stop_timeout() -> u64 {
    5
}

fn default_verbose_ssh() -> bool {
    true
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            ssh_binary: default_ssh_binary(),
            remote_port: default_remote_port(),
            range_start: default_range_start(),
            range_end: default_range_end(),
            interface: default_interface(),
            stop_timeout_secs: default_stop_timeout(),
            verbose_ssh: default_verbose_ssh(),
            extra_ssh_args: Vec::new(),
        }
    }
}

impl TunnelSettings {
    pub fn allocation_range(&self) -> Result<AllocationRange> {
        AllocationRange::new(self.range_start, self.range_end)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl SessionConfig {
    /// Load from the default per-user location, creating it on first run
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from a specific path, creating it with defaults if missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self {
                default_profile: None,
                tunnel: TunnelSettings::default(),
                paths: PathSettings::default(),
                path: path.to_path_buf(),
            };
            config.save()?;
            info!("Created configuration at {}", path.display());
            return Ok(config);
        }

        let contents = fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&contents)?;
        config.path = path.to_path_buf();
        config.validate()?;

        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Write the configuration back to where it was loaded from
    pub fn save(&self) -> Result<()> {
        let mut created = Vec::new();
        if let Some(parent) = self.path.parent() {
            created = missing_ancestors(parent);
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(&self.path, contents)?;

        // When run through sudo, keep everything we created owned by the
        // invoking user
        for dir in &created {
            chown_to_invoking_user(dir);
        }
        chown_to_invoking_user(&self.path);

        debug!("Saved configuration to {}", self.path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.tunnel.allocation_range()?;
        if self.tunnel.ssh_binary.trim().is_empty() {
            return Err(Error::Config("ssh_binary cannot be empty".to_string()));
        }
        if self.tunnel.remote_port == 0 {
            return Err(Error::Config("remote_port must be greater than 0".to_string()));
        }
        if self.tunnel.interface.trim().is_empty() {
            return Err(Error::Config("interface cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Get the path this configuration is stored at
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the path to the per-user configuration file
    pub fn config_path() -> Result<PathBuf> {
        Ok(invoking_home()?
            .join(".config")
            .join(APP_DIR)
            .join("config.toml"))
    }

    pub fn hosts_file(&self) -> PathBuf {
        self.paths
            .hosts_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_HOSTS_FILE))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.paths
            .state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
    }

    pub fn ssh_config(&self) -> Result<PathBuf> {
        if let Some(path) = &self.paths.ssh_config {
            return Ok(path.clone());
        }
        Ok(invoking_home()?.join(".ssh").join("config"))
    }
}

/// User that asked for this invocation (the sudo caller when elevated)
pub fn invoking_user() -> Option<String> {
    std::env::var("SUDO_USER")
        .ok()
        .filter(|user| !user.is_empty() && crate::permissions::is_elevated())
        .or_else(|| std::env::var("USER").ok())
        .filter(|user| !user.is_empty())
}

/// Home directory of the invoking user
///
/// sudo on Linux resets HOME to root's, but profiles and the session config
/// belong to the person who ran the command.
pub fn invoking_home() -> Result<PathBuf> {
    #[cfg(unix)]
    {
        if crate::permissions::is_elevated() {
            if let Some(user) = std::env::var("SUDO_USER")
                .ok()
                .and_then(|name| users::get_user_by_name(&name))
            {
                use users::os::unix::UserExt;
                return Ok(user.home_dir().to_path_buf());
            }
        }
    }

    dirs::home_dir().ok_or_else(|| Error::Config("Could not determine home directory".to_string()))
}

/// Directories `create_dir_all(path)` would create, outermost first
fn missing_ancestors(path: &Path) -> Vec<PathBuf> {
    let mut missing: Vec<PathBuf> = path
        .ancestors()
        .take_while(|dir| !dir.as_os_str().is_empty() && !dir.exists())
        .map(Path::to_path_buf)
        .collect();
    missing.reverse();
    missing
}

#[cfg(unix)]
fn chown_to_invoking_user(path: &Path) {
    if !crate::permissions::is_elevated() {
        return;
    }
    let Some(user) = std::env::var("SUDO_USER")
        .ok()
        .and_then(|name| users::get_user_by_name(&name))
    else {
        return;
    };

    if let Err(e) = std::os::unix::fs::chown(path, Some(user.uid()), Some(user.primary_group_id())) {
        tracing::warn!("Failed to hand {} back to {:?}: {}", path.display(), user.name(), e);
    }
}

#[cfg(not(unix))]
fn chown_to_invoking_user(_path: &Path) {}
