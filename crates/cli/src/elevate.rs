// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 LocalForward Contributors

// Privilege elevation: re-run the current command through sudo

use std::ffi::OsString;
use std::process::Command;

use anyhow::{Context, Result};
use tracing::debug;

use localforward_common::is_elevated;

/// Environment variables carried across the sudo boundary
const PRESERVED_ENV: &str = "RUST_LOG";

/// Return if already root; otherwise re-exec via sudo and exit with its status
pub fn ensure_elevated() -> Result<()> {
    if is_elevated() {
        return Ok(());
    }

    let exe = std::env::current_exe().context("Failed to locate current executable")?;
    let args = sudo_args(exe.into_os_string(), std::env::args_os().skip(1));
    debug!("Re-executing through sudo: {:?}", args);

    let status = Command::new("sudo")
        .args(&args)
        .status()
        .context("Failed to run sudo")?;

    std::process::exit(status.code().unwrap_or(1));
}

fn sudo_args(exe: OsString, args: impl IntoIterator<Item = OsString>) -> Vec<OsString> {
    let mut sudo_args = vec![OsString::from(format!("--preserve-env={}", PRESERVED_ENV)), exe];
    sudo_args.extend(args);
    sudo_args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sudo_args_keep_order() {
        let args = sudo_args(
            OsString::from("/usr/local/bin/localforward"),
            vec![OsString::from("add"), OsString::from("svc-a")],
        );
        assert_eq!(
            args,
            vec![
                OsString::from("--preserve-env=RUST_LOG"),
                OsString::from("/usr/local/bin/localforward"),
                OsString::from("add"),
                OsString::from("svc-a"),
            ]
        );
    }
}
