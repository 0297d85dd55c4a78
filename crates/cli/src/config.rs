// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 LocalForward Contributors

// LocalForward - CLI Config Module
// Loads the session configuration and builds the collaborators for a command

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use localforward_common::{
    LocalForward, SessionConfig, SshConfigStore, SystemAliasBinder, SystemProcessControl,
};

/// Load the session configuration from `path` or the per-user default
pub fn load_session(path: Option<&Path>) -> Result<SessionConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => SessionConfig::config_path().context("Failed to locate configuration")?,
    };

    SessionConfig::load_from(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

/// OS-backed collaborators for one invocation
pub struct Runtime {
    binder: SystemAliasBinder,
    store: SshConfigStore,
    processes: SystemProcessControl,
}

impl Runtime {
    pub fn new(session: &SessionConfig) -> Result<Self> {
        let ssh_config: PathBuf = session
            .ssh_config()
            .context("Failed to locate SSH client configuration")?;

        Ok(Self {
            binder: SystemAliasBinder::new(session.tunnel.interface.clone()),
            store: SshConfigStore::new(ssh_config)?,
            processes: SystemProcessControl,
        })
    }

    pub fn app(&self, session: SessionConfig) -> Result<LocalForward<'_>> {
        Ok(LocalForward::new(
            session,
            &self.binder,
            &self.store,
            &self.processes,
        )?)
    }
}
