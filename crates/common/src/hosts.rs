// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 LocalForward Contributors

// LocalForward - Host Table Module
// Reads and appends tool-owned entries in the system hosts file (/etc/hosts)
//
// Only lines carrying MANAGED_TAG are ever parsed into HostEntry values.
// Every other line is left byte-for-byte untouched. There is no file locking:
// concurrent invocations of the tool can race on append.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::network::block_octet;

/// Marker that distinguishes managed lines from everything else in the file
pub const MANAGED_TAG: &str = "# Added by LocalForward";

/// Default location of the host-resolution file
pub const DEFAULT_HOSTS_FILE: &str = "/etc/hosts";

/// A single managed line in the hosts file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostEntry {
    /// Loopback address inside 127.0.0.0/24
    pub address: Ipv4Addr,
    /// Symbolic hostname resolved to `address`
    pub name: String,
    /// Line number in file (for error reporting)
    #[serde(skip)]
    pub line_number: usize,
}

impl HostEntry {
    /// Parse a single line from the hosts file
    ///
    /// Shape: `<127.0.0.N> <whitespace> <name> <whitespace> # Added by LocalForward`
    fn parse(line: &str, line_number: usize) -> Option<Self> {
        let body = line.trim_end().strip_suffix(MANAGED_TAG)?;

        // The tag must be its own field, not glued to the name
        if !body.ends_with(char::is_whitespace) {
            return None;
        }

        let parts: Vec<&str> = body.split_whitespace().collect();
        if parts.len() != 2 {
            debug!("Ignoring tagged line {} with {} fields", line_number, parts.len());
            return None;
        }

        let address: Ipv4Addr = parts[0].parse().ok()?;
        block_octet(&address)?;

        Some(HostEntry {
            address,
            name: parts[1].to_string(),
            line_number,
        })
    }

    /// Format entry for writing to the hosts file
    fn format(&self) -> String {
        format!("{} {} {}", self.address, self.name, MANAGED_TAG)
    }
}

/// Validate a hostname before it is written to the hosts file
pub fn validate_hostname(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidHostname("hostname cannot be empty".to_string()));
    }
    if name.len() > 253 {
        return Err(Error::InvalidHostname(format!(
            "'{}' is longer than 253 characters",
            name
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_')))
    {
        return Err(Error::InvalidHostname(format!(
            "'{}' contains invalid character {:?}",
            name, c
        )));
    }
    if name.starts_with(['-', '.']) || name.ends_with(['-', '.']) {
        return Err(Error::InvalidHostname(format!(
            "'{}' cannot start or end with '-' or '.'",
            name
        )));
    }
    Ok(())
}

/// Handle on the hosts file; every query re-reads the file
#[derive(Debug, Clone)]
pub struct HostTable {
    path: PathBuf,
}

impl HostTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the path to the hosts file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All managed entries, in file order
    pub fn list_tagged_entries(&self) -> Result<Vec<HostEntry>> {
        if !self.path.exists() {
            debug!("Hosts file does not exist: {}", self.path.display());
            return Ok(Vec::new());
        }

        let file = fs::File::open(&self.path).map_err(|e| self.map_io(e))?;
        let reader = BufReader::new(file);

        let mut entries = Vec::new();
        for (line_idx, line_result) in reader.split(b'\n').enumerate() {
            let bytes = line_result?;
            // Managed lines are ASCII; anything else is someone else's line
            let Ok(line) = std::str::from_utf8(&bytes) else {
                debug!("Skipping non-UTF-8 line {} in {}", line_idx + 1, self.path.display());
                continue;
            };
            if let Some(entry) = HostEntry::parse(line.trim_end_matches('\r'), line_idx + 1) {
                entries.push(entry);
            }
        }

        debug!(
            "Loaded {} managed entries from {}",
            entries.len(),
            self.path.display()
        );
        Ok(entries)
    }

    pub fn contains_name(&self, name: &str) -> Result<bool> {
        Ok(self
            .list_tagged_entries()?
            .iter()
            .any(|entry| entry.name == name))
    }

    pub fn contains_address(&self, address: &Ipv4Addr) -> Result<bool> {
        Ok(self
            .list_tagged_entries()?
            .iter()
            .any(|entry| entry.address == *address))
    }

    /// Append exactly one managed line
    ///
    /// Refuses duplicates so the one-name-per-address invariant holds even if a
    /// caller skips the allocator.
    pub fn append_entry(&self, address: Ipv4Addr, name: &str) -> Result<HostEntry> {
        if block_octet(&address).is_none() {
            return Err(Error::Config(format!(
                "{} is outside the managed 127.0.0.0/24 block",
                address
            )));
        }

        let entries = self.list_tagged_entries()?;
        if let Some(existing) = entries.iter().find(|e| e.name == name) {
            return Err(Error::Config(format!(
                "{} is already mapped to {} (line {})",
                name, existing.address, existing.line_number
            )));
        }
        if let Some(existing) = entries.iter().find(|e| e.address == address) {
            return Err(Error::Config(format!(
                "{} is already assigned to {} (line {})",
                address, existing.name, existing.line_number
            )));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| self.map_io(e))?;

        let needs_newline = !ends_with_newline(&mut file)?;

        let line_number = count_lines(&self.path)? + 1;
        let entry = HostEntry {
            address,
            name: name.to_string(),
            line_number,
        };

        let mut line = String::new();
        if needs_newline {
            line.push('\n');
        }
        line.push_str(&entry.format());
        line.push('\n');

        file.write_all(line.as_bytes()).map_err(|e| self.map_io(e))?;

        info!("Appended {} {} to {}", address, name, self.path.display());
        Ok(entry)
    }

    fn map_io(&self, err: io::Error) -> Error {
        if err.kind() == io::ErrorKind::PermissionDenied {
            Error::PermissionDenied(format!(
                "cannot modify {} (run with elevated privileges)",
                self.path.display()
            ))
        } else {
            Error::Io(err)
        }
    }
}

/// An empty file counts as ending with a newline
fn ends_with_newline(file: &mut fs::File) -> Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn count_lines(path: &Path) -> Result<usize> {
    let contents = fs::read(path)?;
    let newlines = contents.iter().filter(|b| **b == b'\n').count();
    // A trailing fragment without newline will be terminated before our line
    let fragment = usize::from(contents.last().is_some_and(|b| *b != b'\n'));
    Ok(newlines + fragment)
}
