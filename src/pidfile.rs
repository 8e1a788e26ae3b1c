// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PID file lifecycle: written on startup, removed on clean shutdown.

use std::path::{Path, PathBuf};

pub fn default_path() -> PathBuf {
    PathBuf::from("/var/run/detectord.pid")
}

pub fn write(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))
}

/// Best-effort removal; a missing file is not an error (the daemon may
/// be exiting a second time after an earlier crash left it gone).
pub fn remove(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(err = %e, path = %path.display(), "failed to remove pid file");
        }
    }
}
