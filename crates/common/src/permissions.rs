// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 LocalForward Contributors

// Privilege checks and file permission hardening

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::Result;

/// Whether the current process runs with root privileges
pub fn is_elevated() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Set file permissions to 0600 (owner read/write only)
pub fn set_file_permissions_private(path: &Path) -> Result<()> {
    set_file_mode(path, 0o600)
}

/// Set file permissions to 0644 (world readable, owner writable)
pub fn set_file_permissions_shared(path: &Path) -> Result<()> {
    set_file_mode(path, 0o644)
}

fn set_file_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        debug!("Set file permissions to {:o}: {}", mode, path.display());
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

/// Ensure a directory exists with 0755 permissions
///
/// The state directory is shared: root writes it, anyone may read the pid
/// record to report status.
pub fn ensure_shared_directory(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
        debug!("Created directory: {}", path.display());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}
