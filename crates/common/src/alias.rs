// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 LocalForward Contributors

// LocalForward - Loopback Alias Management
// Binds allocated addresses as secondary addresses on the loopback interface

use std::net::Ipv4Addr;
use std::process::Command;

use tracing::{debug, info};

use crate::error::{Error, Result};

/// Loopback interface name on this platform
#[cfg(target_os = "macos")]
pub const DEFAULT_LOOPBACK_INTERFACE: &str = "lo0";
#[cfg(not(target_os = "macos"))]
pub const DEFAULT_LOOPBACK_INTERFACE: &str = "lo";

/// Binds a loopback address so the SSH client can listen on it
pub trait AliasBinder {
    fn bind(&self, address: Ipv4Addr) -> Result<()>;
}

/// Binds aliases through the OS network tooling (needs root)
#[derive(Debug, Clone)]
pub struct SystemAliasBinder {
    interface: String,
}

impl SystemAliasBinder {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    /// Program and arguments that add `address` to the interface
    pub fn bind_command(&self, address: Ipv4Addr) -> (&'static str, Vec<String>) {
        if cfg!(target_os = "macos") {
            (
                "ifconfig",
                vec![self.interface.clone(), "alias".to_string(), address.to_string()],
            )
        } else {
            (
                "ip",
                vec![
                    "addr".to_string(),
                    "add".to_string(),
                    format!("{}/32", address),
                    "dev".to_string(),
                    self.interface.clone(),
                ],
            )
        }
    }
}

impl Default for SystemAliasBinder {
    fn default() -> Self {
        Self::new(DEFAULT_LOOPBACK_INTERFACE)
    }
}

impl AliasBinder for SystemAliasBinder {
    fn bind(&self, address: Ipv4Addr) -> Result<()> {
        let (program, args) = self.bind_command(address);
        let command_line = format!("{} {}", program, args.join(" "));
        info!("Executing: {}", command_line);

        let output = Command::new(program).args(&args).output()?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        // ip(8) refuses to add an address that is already present
        if stderr.contains("File exists") {
            debug!("{} already bound on {}", address, self.interface);
            return Ok(());
        }

        Err(Error::Command {
            command: command_line,
            code: output.status.code(),
        })
    }
}
