//! XDG Base Directory Spec compliant path resolution.
//!
//! Path locations:
//! - Data (migration units): `~/.local/share/cms-migrate/` (or `$XDG_DATA_HOME/cms-migrate/`)
//! - State (lock, applied ledger, audit log): `~/.local/state/cms-migrate/` (or `$XDG_STATE_HOME/cms-migrate/`)
//!
//! On Windows, uses `%LOCALAPPDATA%` as that is the Windows convention.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const APP_DIR: &str = "cms-migrate";

/// Returns the data directory for cms-migrate (migration units).
///
/// Priority order:
/// 1. `$XDG_DATA_HOME/cms-migrate/` (if XDG_DATA_HOME is set)
/// 2. `~/.local/share/cms-migrate/` (default)
/// 3. `%LOCALAPPDATA%/cms-migrate/` (Windows)
pub fn data_dir() -> PathBuf {
    if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME")
        && !xdg_data.is_empty()
    {
        return PathBuf::from(xdg_data).join(APP_DIR);
    }

    #[cfg(target_os = "windows")]
    {
        if let Some(local_app_data) = dirs::data_dir() {
            return local_app_data.join(APP_DIR);
        }
    }

    #[cfg(not(target_os = "windows"))]
    {
        if let Some(home) = dirs::home_dir() {
            return home.join(".local").join("share").join(APP_DIR);
        }
    }

    PathBuf::from(".local/share").join(APP_DIR)
}

/// Returns the state directory for cms-migrate (lock, ledger, logs).
///
/// Priority order:
/// 1. `$XDG_STATE_HOME/cms-migrate/` (if XDG_STATE_HOME is set)
/// 2. `~/.local/state/cms-migrate/` (default)
/// 3. `%LOCALAPPDATA%/cms-migrate/state/` (Windows)
pub fn state_dir() -> PathBuf {
    if let Ok(xdg_state) = std::env::var("XDG_STATE_HOME")
        && !xdg_state.is_empty()
    {
        return PathBuf::from(xdg_state).join(APP_DIR);
    }

    #[cfg(target_os = "windows")]
    {
        if let Some(local_app_data) = dirs::data_dir() {
            return local_app_data.join(APP_DIR).join("state");
        }
    }

    #[cfg(not(target_os = "windows"))]
    {
        if let Some(home) = dirs::home_dir() {
            return home.join(".local").join("state").join(APP_DIR);
        }
    }

    PathBuf::from(".local/state").join(APP_DIR)
}

/// Default directory scanned for migration units.
pub fn units_dir() -> PathBuf {
    data_dir().join("migrations")
}

/// Default lock record path.
pub fn lock_path() -> PathBuf {
    state_dir().join("migration.lock")
}

/// Default audit log path (state_dir/logs/migrations.log).
pub fn log_path() -> PathBuf {
    state_dir().join("logs").join("migrations.log")
}

/// Default applied-units ledger path.
pub fn applied_path() -> PathBuf {
    state_dir().join("applied.json")
}

/// Create the parent directory of `path` if it has one.
pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Atomically write a file: create a uniquely named temp sibling, write,
/// fsync, rename over `path`.
///
/// The temp file lives in the same directory as the target so the rename
/// never crosses a filesystem. Readers observe either the old content or the
/// complete new content, never a partial write.
pub fn write_file_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    ensure_parent_dir(path)?;
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        ".tmp-{}-{seq}-{}",
        std::process::id(),
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );
    let tmp_path = parent.join(tmp_name);

    let written = fs::File::create(&tmp_path).and_then(|mut file| {
        file.write_all(content)?;
        file.sync_data()
    });
    written
        .and_then(|()| fs::rename(&tmp_path, path))
        .inspect_err(|_| {
            let _ = fs::remove_file(&tmp_path);
        })
}
