use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, anyhow};
use chrono::Local;
use parking_lot::Mutex;
use serde::Serialize;

// Workspace directory permissions
const WORKSPACE_PERMISSIONS: u32 = 0o700;

/// The directory is never visible with wider permissions than these
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    fs::DirBuilder::new().mode(WORKSPACE_PERMISSIONS).create(path)
}

/// Hands out one private scratch directory per execution
pub struct WorkspaceManager {
    root: PathBuf,
    next_id: AtomicU64,
    registry: Arc<Registry>,
}

#[derive(Default)]
struct Registry {
    live: Mutex<HashSet<PathBuf>>,
    created: AtomicU64,
    destroyed: AtomicU64,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceStats {
    pub created: u64,
    pub destroyed: u64,
    pub live: usize,
}

/// An exclusively owned scratch directory, removed when dropped
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    registry: Arc<Registry>,
    destroyed: bool,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("live", &self.live.lock().len())
            .finish_non_exhaustive()
    }
}

impl WorkspaceManager {
    /// Uses `root` as the parent of all workspaces, creating it when missing
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create workspace root {}", root.display()))?;
        fs::set_permissions(&root, fs::Permissions::from_mode(WORKSPACE_PERMISSIONS))?;

        Ok(Self {
            root,
            next_id: AtomicU64::new(0),
            registry: Arc::new(Registry::default()),
        })
    }

    /// Default root under the per-user cache directory
    pub fn default_root() -> Result<PathBuf> {
        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "codebox")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;
        Ok(proj_dirs.cache_dir().join("workspaces"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn create(&self) -> Result<Workspace> {
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        let name = format!(
            "{}-{}-{seq}",
            Local::now().format("%y%m%d-%H-%M-%S"),
            std::process::id()
        );
        let path = self.root.join(name);

        create_private_dir(&path)
            .with_context(|| format!("Failed to create workspace {}", path.display()))?;
        self.registry.created.fetch_add(1, Ordering::SeqCst);
        self.registry.live.lock().insert(path.clone());

        // From here on the directory exists, so the guard owns its removal
        let workspace = Workspace {
            path,
            registry: self.registry.clone(),
            destroyed: false,
        };
        // The umask may have cleared owner bits
        fs::set_permissions(
            &workspace.path,
            fs::Permissions::from_mode(WORKSPACE_PERMISSIONS),
        )?;

        log::debug!("Created workspace {}", workspace.path.display());
        Ok(workspace)
    }

    pub fn stats(&self) -> WorkspaceStats {
        WorkspaceStats {
            created: self.registry.created.load(Ordering::SeqCst),
            destroyed: self.registry.destroyed.load(Ordering::SeqCst),
            live: self.registry.live.lock().len(),
        }
    }

    /// Removes directories left in the root by an earlier process.
    /// Returns how many entries were removed.
    pub fn purge_stale(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if self.registry.live.lock().contains(&path) {
                continue;
            }
            match remove_tree(&path) {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("Unable to remove stale workspace {}: {e}", path.display()),
            }
        }
        if removed > 0 {
            log::info!("Removed {removed} stale workspace(s) from {}", self.root.display());
        }
        Ok(removed)
    }
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `contents` to `name` inside the workspace
    pub fn write_file(&self, name: &str, contents: &[u8]) -> Result<PathBuf> {
        let file_path = self.path.join(name);
        fs::write(&file_path, contents)
            .with_context(|| format!("Failed to write {}", file_path.display()))?;
        Ok(file_path)
    }

    /// Removes the whole tree. Safe to call more than once.
    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        remove_tree(&self.path)
            .with_context(|| format!("Failed to remove workspace {}", self.path.display()))?;

        self.destroyed = true;
        self.registry.live.lock().remove(&self.path);
        self.registry.destroyed.fetch_add(1, Ordering::SeqCst);
        log::debug!("Destroyed workspace {}", self.path.display());
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            log::error!("{e:#}");
        }
    }
}

fn remove_tree(path: &Path) -> std::io::Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            // Programs may drop write permission on their own directories
            restore_permissions(path);
            fs::remove_dir_all(path).or_else(|e| match e.kind() {
                ErrorKind::NotFound => Ok(()),
                _ => Err(e),
            })
        }
        other => other,
    }
}

fn restore_permissions(path: &Path) {
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(WORKSPACE_PERMISSIONS));
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            let child = entry.path();
            if child.is_dir() && !child.is_symlink() {
                restore_permissions(&child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;

    static TEST_ROOT_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn test_root() -> PathBuf {
        let id = TEST_ROOT_COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("codebox-ws-test-{}-{id}", std::process::id()))
    }

    fn entry_count(root: &Path) -> usize {
        fs::read_dir(root).unwrap().count()
    }

    #[test]
    fn test_create_and_drop_leaves_no_residue() {
        let root = test_root();
        let manager = WorkspaceManager::new(&root).unwrap();

        {
            let a = manager.create().unwrap();
            let b = manager.create().unwrap();
            assert_ne!(a.path(), b.path());
            a.write_file("main.sh", b"echo hi\n").unwrap();
            fs::create_dir_all(b.path().join("nested/deeper")).unwrap();
            assert_eq!(entry_count(&root), 2);
            assert_eq!(manager.stats().live, 2);
        }

        assert_eq!(entry_count(&root), 0);
        assert_eq!(
            manager.stats(),
            WorkspaceStats {
                created: 2,
                destroyed: 2,
                live: 0
            }
        );
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let root = test_root();
        let manager = WorkspaceManager::new(&root).unwrap();

        let mut ws = manager.create().unwrap();
        ws.destroy().unwrap();
        ws.destroy().unwrap();
        drop(ws);
        assert_eq!(manager.stats().destroyed, 1);

        // Directory already gone behind our back
        let mut ws = manager.create().unwrap();
        fs::remove_dir_all(ws.path()).unwrap();
        ws.destroy().unwrap();
        assert_eq!(manager.stats().live, 0);
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_workspace_is_private() {
        let root = test_root();
        let manager = WorkspaceManager::new(&root).unwrap();
        let ws = manager.create().unwrap();

        let mode = fs::metadata(ws.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, WORKSPACE_PERMISSIONS);
        drop(ws);
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_private_dir_ignores_permissive_umask() {
        let root = test_root();
        fs::create_dir_all(&root).unwrap();
        let path = root.join("private");

        // SAFETY: umask has no preconditions; restored right after
        let previous = unsafe { libc::umask(0) };
        let created = create_private_dir(&path);
        unsafe { libc::umask(previous) };
        created.unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, WORKSPACE_PERMISSIONS);
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_destroy_handles_read_only_subdirectories() {
        let root = test_root();
        let manager = WorkspaceManager::new(&root).unwrap();
        let ws = manager.create().unwrap();

        let locked = ws.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("file"), b"x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o500)).unwrap();
        drop(ws);

        assert_eq!(entry_count(&root), 0);
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_purge_stale_skips_live_workspaces() {
        let root = test_root();
        let manager = WorkspaceManager::new(&root).unwrap();
        fs::create_dir(root.join("leftover-from-crash")).unwrap();
        fs::write(root.join("stray-file"), b"x").unwrap();

        let ws = manager.create().unwrap();
        assert_eq!(manager.purge_stale().unwrap(), 2);
        assert!(ws.path().exists());
        drop(ws);

        assert_eq!(entry_count(&root), 0);
        fs::remove_dir_all(root).unwrap();
    }
}
