//! Tracking and removal of host-side mount-point residue.
//!
//! When the Linux compiler plans a deny artifact over a non-existent path,
//! the sandbox helper materializes an empty file or directory on the host at
//! sandbox start. Those entries outlive the sandboxed command, so every
//! planned artifact is registered here and removed once the command returns.
//! Removal is strictly conditional: an entry that has gained real content
//! belongs to someone else now and is left alone.

use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, Once, PoisonError};

use rustc_hash::FxHashSet;
use tracing::debug;

static MOUNT_POINTS: LazyLock<Mutex<FxHashSet<PathBuf>>> =
    LazyLock::new(|| Mutex::new(FxHashSet::default()));

static EXIT_HOOK: Once = Once::new();

/// Serializes tests that observe the process-wide registry.
#[cfg(test)]
pub(crate) static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Record a host path at which the sandbox helper will materialize an entry.
pub(crate) fn register_mount_point(path: PathBuf) {
    install_exit_hook();
    MOUNT_POINTS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(path);
}

/// Install the process-exit safety net, at most once.
pub(crate) fn install_exit_hook() {
    EXIT_HOOK.call_once(|| {
        // SAFETY: `reap_at_exit` is a plain `extern "C"` function with no
        // preconditions; registering it with `atexit` is always sound.
        unsafe {
            libc::atexit(reap_at_exit);
        }
    });
}

extern "C" fn reap_at_exit() {
    cleanup_mount_points();
    #[cfg(target_os = "linux")]
    crate::seccomp::remove_generated_filters();
}

/// Remove registered mount points that are still empty, and clear the
/// registry. Idempotent; never fails.
pub fn cleanup_mount_points() {
    let drained: Vec<PathBuf> = {
        let mut registry = MOUNT_POINTS
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        registry.drain().collect()
    };

    for path in drained {
        remove_if_empty(&path);
    }
}

fn remove_if_empty(path: &Path) {
    let Ok(metadata) = path.symlink_metadata() else {
        return;
    };

    if metadata.is_dir() {
        let is_empty = fs_err::read_dir(path)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if is_empty {
            if fs_err::remove_dir(path).is_ok() {
                debug!("Reaped empty mount-point directory {}", path.display());
            }
        } else {
            debug!(
                "Leaving mount point {} in place: directory is not empty",
                path.display()
            );
        }
    } else if metadata.is_file() && metadata.len() == 0 {
        if fs_err::remove_file(path).is_ok() {
            debug!("Reaped empty mount-point file {}", path.display());
        }
    } else {
        debug!(
            "Leaving mount point {} in place: not an empty file or directory",
            path.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use assert_fs::prelude::*;

    use super::*;

    #[test]
    fn cleanup_removes_empty_entries_and_spares_content() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("ghost-file").touch().unwrap();
        temp.child("ghost-dir").create_dir_all().unwrap();
        temp.child("occupied").write_str("real content").unwrap();
        temp.child("busy-dir/inner").touch().unwrap();

        register_mount_point(temp.child("ghost-file").path().to_path_buf());
        register_mount_point(temp.child("ghost-dir").path().to_path_buf());
        register_mount_point(temp.child("occupied").path().to_path_buf());
        register_mount_point(temp.child("busy-dir").path().to_path_buf());

        cleanup_mount_points();

        assert!(!temp.child("ghost-file").path().exists());
        assert!(!temp.child("ghost-dir").path().exists());
        assert!(temp.child("occupied").path().exists());
        assert!(temp.child("busy-dir/inner").path().exists());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("ghost").touch().unwrap();
        register_mount_point(temp.child("ghost").path().to_path_buf());

        cleanup_mount_points();
        // The second pass sees an empty registry and missing paths.
        cleanup_mount_points();
        cleanup_mount_points();

        assert!(!temp.child("ghost").path().exists());
    }

    #[test]
    fn cleanup_tolerates_vanished_paths() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let temp = assert_fs::TempDir::new().unwrap();
        register_mount_point(temp.child("never-created").path().to_path_buf());
        cleanup_mount_points();
    }

    #[test]
    fn symlinks_are_not_followed() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("target").write_str("keep me").unwrap();
        temp.child("link")
            .symlink_to_file(temp.child("target").path())
            .unwrap();

        register_mount_point(temp.child("link").path().to_path_buf());
        cleanup_mount_points();

        // The symlink is neither an empty file nor an empty dir; both stay.
        assert!(temp.child("link").path().symlink_metadata().is_ok());
        assert!(temp.child("target").path().exists());
    }
}
