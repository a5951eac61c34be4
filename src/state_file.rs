// PID file for external process supervision (stop/status subcommands)

//! PID file
//!
//! Writes the running daemon's PID and start time so `fmcd stop` and
//! `fmcd status` can find it without a persistent IPC channel.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Write `PID=<pid>` and `STARTED=<unix ts>` to `path`.
pub fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("creating pid file directory")?;
    }
    let pid = std::process::id();
    let started = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    fs::write(path, format!("PID={pid}\nSTARTED={started}\n")).context("writing pid file")?;
    Ok(())
}

/// Read back the PID recorded at `path`, if any.
pub fn read_pid(path: &Path) -> Option<u32> {
    let text = fs::read_to_string(path).ok()?;
    text.lines()
        .find_map(|line| line.strip_prefix("PID="))
        .and_then(|v| v.trim().parse().ok())
}

/// Remove the pid file on shutdown. Best-effort.
pub fn cleanup(path: &Path) {
    let _ = fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read_pid_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("first_minute.pid");
        write_pid_file(&path).unwrap();
        let pid = read_pid(&path).unwrap();
        assert_eq!(pid, std::process::id());
    }

    #[test]
    fn test_read_pid_missing_file_returns_none() {
        assert!(read_pid(Path::new("/nonexistent/path/first_minute.pid")).is_none());
    }

    #[test]
    fn test_cleanup_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("first_minute.pid");
        write_pid_file(&path).unwrap();
        cleanup(&path);
        assert!(!path.exists());
    }
}
