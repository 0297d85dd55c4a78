// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 LocalForward Contributors

// LocalForward - Connection Profiles
// Resolves a named profile from the OpenSSH client config into connection
// parameters, and remembers the last profile used as the session default.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::config::{invoking_home, invoking_user, SessionConfig};
use crate::error::{Error, Result};

/// Remote connection parameters for the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionProfile {
    /// Profile name as given by the user (the ssh_config Host alias)
    pub name: String,
    /// SSH server hostname or IP
    pub hostname: String,
    /// SSH username
    pub user: String,
    /// SSH server port, if not the client default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Path to SSH private key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
}

impl ConnectionProfile {
    /// `user@hostname` as passed to the SSH client
    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.hostname)
    }
}

/// Key-value lookup of profiles by name
pub trait ProfileStore {
    fn lookup(&self, name: &str) -> Result<ConnectionProfile>;
}

/// Profiles read from an OpenSSH client config file (~/.ssh/config)
#[derive(Debug, Clone)]
pub struct SshConfigStore {
    path: PathBuf,
    home: PathBuf,
    local_user: String,
}

/// Values collected while walking matching Host blocks; first one wins
#[derive(Debug, Default)]
struct Collected {
    hostname: Option<String>,
    user: Option<String>,
    port: Option<u16>,
    identity_file: Option<String>,
    /// Matched by at least one pattern that is not a pure wildcard
    specific: bool,
}

impl SshConfigStore {
    /// Store for the given config file, expanding paths for the invoking user
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let local_user = invoking_user()
            .ok_or_else(|| Error::Config("Could not determine current user".to_string()))?;
        Ok(Self {
            path: path.into(),
            home: invoking_home()?,
            local_user,
        })
    }

    pub fn with_context(
        path: impl Into<PathBuf>,
        home: impl Into<PathBuf>,
        local_user: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            home: home.into(),
            local_user: local_user.into(),
        }
    }

    /// Get the path to the SSH client config
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn collect(&self, content: &str, name: &str) -> Collected {
        let mut collected = Collected::default();
        // Directives before the first Host line apply to every host
        let mut active = true;

        for (line_idx, raw) in content.lines().enumerate() {
            let Some((keyword, value)) = split_directive(raw) else {
                continue;
            };

            match keyword.as_str() {
                "host" => {
                    let patterns: Vec<String> =
                        value.split_whitespace().map(|p| unquote(p).to_string()).collect();
                    active = host_matches(&patterns, name);
                    if active && patterns.iter().any(|p| is_specific_match(p, name)) {
                        collected.specific = true;
                    }
                }
                "match" => {
                    debug!("Skipping unsupported Match block at line {}", line_idx + 1);
                    active = false;
                }
                _ if !active => {}
                "hostname" => {
                    collected.hostname.get_or_insert_with(|| value.to_string());
                }
                "user" => {
                    collected.user.get_or_insert_with(|| value.to_string());
                }
                "port" => {
                    if collected.port.is_none() {
                        collected.port = value.parse().ok();
                        if collected.port.is_none() {
                            debug!("Ignoring invalid Port {:?} at line {}", value, line_idx + 1);
                        }
                    }
                }
                "identityfile" => {
                    collected.identity_file.get_or_insert_with(|| value.to_string());
                }
                _ => {}
            }
        }

        collected
    }

    /// Expand %-tokens and ~ the way ssh does for IdentityFile
    fn expand_identity(&self, raw: &str, hostname: &str, user: &str) -> PathBuf {
        let mut expanded = String::with_capacity(raw.len());
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                expanded.push(c);
                continue;
            }
            match chars.next() {
                Some('%') => expanded.push('%'),
                Some('h') => expanded.push_str(hostname),
                Some('r') => expanded.push_str(user),
                Some('u') => expanded.push_str(&self.local_user),
                Some('d') => expanded.push_str(&self.home.to_string_lossy()),
                Some(other) => {
                    expanded.push('%');
                    expanded.push(other);
                }
                None => expanded.push('%'),
            }
        }

        let home = self.home.to_string_lossy().into_owned();
        PathBuf::from(shellexpand::tilde_with_context(&expanded, || Some(home)).into_owned())
    }
}

impl ProfileStore for SshConfigStore {
    fn lookup(&self, name: &str) -> Result<ConnectionProfile> {
        if !self.path.exists() {
            return Err(Error::Config(format!("{} not found", self.path.display())));
        }

        let content = fs::read_to_string(&self.path)?;
        let collected = self.collect(&content, name);

        if !collected.specific {
            return Err(Error::ProfileNotFound(format!(
                "no Host entry for '{}' in {}",
                name,
                self.path.display()
            )));
        }

        let hostname = collected
            .hostname
            .map(|h| h.replace("%h", name))
            .unwrap_or_else(|| name.to_string());
        let user = collected.user.unwrap_or_else(|| self.local_user.clone());
        let identity_file = collected
            .identity_file
            .map(|raw| self.expand_identity(&raw, &hostname, &user));

        debug!("Resolved profile {} to {}@{}", name, user, hostname);

        Ok(ConnectionProfile {
            name: name.to_string(),
            hostname,
            user,
            port: collected.port,
            identity_file,
        })
    }
}

/// Split `Keyword value` or `Keyword=value`; None for blanks and comments
fn split_directive(line: &str) -> Option<(String, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let split_at = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let keyword = line[..split_at].to_ascii_lowercase();
    let rest = line[split_at..].trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest).trim();
    if rest.is_empty() {
        return None;
    }

    Some((keyword, unquote(rest)))
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// ssh_config pattern list semantics: any negated match excludes the host
fn host_matches(patterns: &[String], name: &str) -> bool {
    let mut matched = false;
    for pattern in patterns {
        if let Some(negated) = pattern.strip_prefix('!') {
            if glob_match(negated, name) {
                return false;
            }
        } else if glob_match(pattern, name) {
            matched = true;
        }
    }
    matched
}

/// A positive pattern made of more than wildcards that matches `name`
fn is_specific_match(pattern: &str, name: &str) -> bool {
    !pattern.starts_with('!')
        && pattern.chars().any(|c| c != '*' && c != '?')
        && glob_match(pattern, name)
}

/// Case-insensitive `*` / `?` matching
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = backtrack {
            p = star_p + 1;
            t = star_t + 1;
            backtrack = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Picks the profile for this invocation and records it as the new default
pub struct ProfileResolver<'a> {
    store: &'a dyn ProfileStore,
}

impl<'a> ProfileResolver<'a> {
    pub fn new(store: &'a dyn ProfileStore) -> Self {
        Self { store }
    }

    /// Resolve `requested`, falling back to the stored default
    ///
    /// Every successful resolution becomes the new default profile.
    pub fn resolve(
        &self,
        requested: Option<&str>,
        session: &mut SessionConfig,
    ) -> Result<ConnectionProfile> {
        let name = requested
            .map(str::to_string)
            .or_else(|| session.default_profile.clone())
            .ok_or_else(|| {
                Error::Config(
                    "SSH profile required. Set a default with \"localforward ssh-profile <profile>\" \
                     or provide one with \"localforward start <profile>\""
                        .to_string(),
                )
            })?;

        let profile = self.store.lookup(&name)?;

        if session.default_profile.as_deref() != Some(name.as_str()) {
            session.default_profile = Some(name.clone());
            session.save()?;
            info!("Default SSH profile set to {}", name);
        }

        Ok(profile)
    }
}
