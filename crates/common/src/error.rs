// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 LocalForward Contributors

// Error types for LocalForward

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Invalid hostname: {0}")]
    InvalidHostname(String),

    #[error("No available loopback addresses in 127.0.0.{first}-127.0.0.{last}")]
    ResourceExhausted { first: u8, last: u8 },

    #[error("Command `{command}` failed ({})", describe_exit(.code))]
    Command { command: String, code: Option<i32> },

    #[error("SSH tunnel is already running with PID {0}")]
    AlreadyRunning(u32),

    #[error("SSH tunnel is not running")]
    NotRunning,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

impl Error {
    /// Informational conditions print a message but exit successfully
    pub fn is_informational(&self) -> bool {
        matches!(self, Error::NotRunning)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
