// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 LocalForward Contributors

// Follow the tunnel log like `tail -f`

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};

/// Copy `path` to `out`; if `follow`, keep copying appended data until
/// `should_stop` returns true. A truncated file is re-read from the start.
pub fn follow_log<W, F>(
    path: &Path,
    out: &mut W,
    follow: bool,
    poll: Duration,
    mut should_stop: F,
) -> Result<()>
where
    W: Write,
    F: FnMut() -> bool,
{
    let mut file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no tunnel log at {} (has the tunnel been started?)", path.display()),
        )),
        _ => Error::Io(e),
    })?;

    let mut position = copy_new(&mut file, out, 0)?;

    while follow && !should_stop() {
        thread::sleep(poll);

        let len = file.metadata()?.len();
        if len < position {
            // Restarted tunnels truncate the log
            position = 0;
        }
        if len != position {
            position = copy_new(&mut file, out, position)?;
        }
    }

    Ok(())
}

fn copy_new<W: Write>(file: &mut File, out: &mut W, from: u64) -> Result<u64> {
    file.seek(SeekFrom::Start(from))?;
    let copied = io::copy(file, out)?;
    out.flush()?;
    Ok(from + copied)
}
