// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! PID file marking the `serve` process that owns a database.
//!
//! Lives next to the database (`tagwatch.pid` beside `tagwatch.db` by
//! default). Other commands check it before touching state that a live
//! server is still using.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

/// PID file path for the database at `db_path`.
pub fn pid_file_path(db_path: &Path) -> PathBuf {
    db_path.with_extension("pid")
}

/// PID of a live process holding `pid_path`. A stale or unreadable file is
/// removed.
pub fn holder(pid_path: &Path) -> Option<i32> {
    if !pid_path.exists() {
        return None;
    }
    let pid = std::fs::read_to_string(pid_path)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok());

    if let Some(pid) = pid {
        if is_alive(pid) {
            return Some(pid);
        }
    }

    tracing::debug!(path = %pid_path.display(), "removing stale pid file");
    let _ = std::fs::remove_file(pid_path);
    None
}

/// PID of a live `serve` on the database at `db_path`, other than this
/// process.
pub fn live_server(db_path: &Path) -> Option<i32> {
    holder(&pid_file_path(db_path)).filter(|pid| *pid != own_pid())
}

#[cfg(unix)]
fn is_alive(pid: i32) -> bool {
    let output = std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output();
    matches!(output, Ok(o) if o.status.success())
}

#[cfg(not(unix))]
fn is_alive(_pid: i32) -> bool {
    false
}

fn own_pid() -> i32 {
    std::process::id() as i32
}

/// Written by `serve` on startup, removed on drop.
#[derive(Debug)]
pub struct PidGuard {
    path: PathBuf,
}

impl PidGuard {
    /// Claim the database at `db_path`. Fails if another live server holds it.
    pub fn acquire(db_path: &Path) -> Result<Self> {
        if let Some(pid) = live_server(db_path) {
            bail!(
                "tagwatch serve is already running on {} (PID {pid})",
                db_path.display()
            );
        }
        let path = pid_file_path(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        std::fs::write(&path, own_pid().to_string())
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_sits_next_to_database() {
        assert_eq!(
            pid_file_path(Path::new("/var/lib/tagwatch/tagwatch.db")),
            PathBuf::from("/var/lib/tagwatch/tagwatch.pid")
        );
    }

    #[test]
    fn test_garbage_pid_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tagwatch.pid");
        std::fs::write(&path, "not-a-pid").unwrap();
        assert_eq!(holder(&path), None);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_live_holder_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tagwatch.pid");
        std::fs::write(&path, own_pid().to_string()).unwrap();
        assert_eq!(holder(&path), Some(own_pid()));
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_holder_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tagwatch.pid");
        // Above the default pid_max, never a live process
        std::fs::write(&path, "2147483000").unwrap();
        assert_eq!(holder(&path), None);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_own_pid_is_not_another_server() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("tagwatch.db");
        let guard = PidGuard::acquire(&db).unwrap();
        assert!(guard.path().exists());
        assert_eq!(live_server(&db), None);
        let path = guard.path().to_path_buf();
        drop(guard);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_other_live_server_blocks_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("tagwatch.db");
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as i32;
        std::fs::write(pid_file_path(&db), pid.to_string()).unwrap();

        assert_eq!(live_server(&db), Some(pid));
        let err = PidGuard::acquire(&db).unwrap_err();
        assert!(err.to_string().contains(&pid.to_string()));

        child.kill().unwrap();
        child.wait().unwrap();
        assert_eq!(live_server(&db), None);
        assert!(!pid_file_path(&db).exists());
    }
}
