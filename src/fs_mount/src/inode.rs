use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, Weak};

use dfs_lib::FileAttributes;
use fs_staging::StagingFile;

/// Open state of one remote file. Exactly one instance exists per path while
/// any handle is open. The inode owns the staging file; handles reference
/// the inode but never own it, and the registry below only keeps weak links,
/// so dropping the last handle drops everything.
pub struct Inode {
    pub ino: u64,
    path: RwLock<String>,
    pub state: tokio::sync::Mutex<InodeState>,
}

pub struct InodeState {
    pub attrs: FileAttributes,
    pub handles: HashSet<u64>,
    pub staging: Option<StagingFile>,
    /// Staged bytes not yet uploaded.
    pub dirty: bool,
    /// The path was removed while handles were open; flushes still target it.
    pub unlinked: bool,
}

impl Inode {
    pub fn new(ino: u64, path: &str, attrs: FileAttributes) -> Arc<Self> {
        Arc::new(Self {
            ino,
            path: RwLock::new(path.to_string()),
            state: tokio::sync::Mutex::new(InodeState {
                attrs,
                handles: HashSet::new(),
                staging: None,
                dirty: false,
                unlinked: false,
            }),
        })
    }

    /// The current mount-relative path. Rename updates it in place, so an
    /// open writer flushes to the new location.
    pub fn path(&self) -> String {
        self.path.read().unwrap().clone()
    }

    pub fn set_path(&self, path: String) {
        *self.path.write().unwrap() = path;
    }
}

/// Registry of inodes with open handles, by ino. Weak references only: the
/// strong links live in the file handles.
pub struct InodeDir {
    open: Mutex<HashMap<u64, Weak<Inode>>>,
}

impl InodeDir {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, ino: u64) -> Option<Arc<Inode>> {
        let mut open = self.open.lock().unwrap();
        match open.get(&ino).and_then(Weak::upgrade) {
            Some(inode) => Some(inode),
            None => {
                open.remove(&ino);
                None
            }
        }
    }

    pub fn find_by_path(&self, path: &str) -> Option<Arc<Inode>> {
        let open = self.open.lock().unwrap();
        open.values()
            .filter_map(Weak::upgrade)
            .find(|inode| inode.path() == path)
    }

    pub fn get_or_insert(&self, ino: u64, path: &str, attrs: FileAttributes) -> Arc<Inode> {
        let mut open = self.open.lock().unwrap();
        if let Some(inode) = open.get(&ino).and_then(Weak::upgrade) {
            return inode;
        }
        let inode = Inode::new(ino, path, attrs);
        open.insert(ino, Arc::downgrade(&inode));
        inode
    }

    pub fn remove(&self, ino: u64) {
        self.open.lock().unwrap().remove(&ino);
    }

    /// Rewrites the paths of open inodes under a renamed prefix.
    pub fn rename_prefix(&self, old_path: &str, new_path: &str) {
        let open = self.open.lock().unwrap();
        let old_prefix = format!("{}/", old_path);
        for inode in open.values().filter_map(Weak::upgrade) {
            let current = inode.path();
            if current == old_path {
                inode.set_path(new_path.to_string());
            } else if let Some(suffix) = current.strip_prefix(&old_prefix) {
                inode.set_path(format!("{}/{}", new_path, suffix));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_holds_weak_references() {
        let dir = InodeDir::new();
        let inode = dir.get_or_insert(5, "/f", FileAttributes::file(0o644, 0));
        assert!(dir.get(5).is_some());
        drop(inode);
        // The last strong reference is gone; the registry must not revive it.
        assert!(dir.get(5).is_none());
    }

    #[test]
    fn test_get_or_insert_reuses_live_inode() {
        let dir = InodeDir::new();
        let first = dir.get_or_insert(5, "/f", FileAttributes::file(0o644, 0));
        let second = dir.get_or_insert(5, "/f", FileAttributes::file(0o600, 9));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_rename_prefix_rewrites_open_paths() {
        let dir = InodeDir::new();
        let file = dir.get_or_insert(2, "/d/f", FileAttributes::file(0o644, 0));
        let sub = dir.get_or_insert(3, "/d/sub/g", FileAttributes::file(0o644, 0));
        let other = dir.get_or_insert(4, "/dx", FileAttributes::file(0o644, 0));

        dir.rename_prefix("/d", "/e");
        assert_eq!(file.path(), "/e/f");
        assert_eq!(sub.path(), "/e/sub/g");
        assert_eq!(other.path(), "/dx");
    }

    #[test]
    fn test_find_by_path() {
        let dir = InodeDir::new();
        let inode = dir.get_or_insert(7, "/x", FileAttributes::file(0o644, 0));
        assert!(dir
            .find_by_path("/x")
            .map(|found| Arc::ptr_eq(&found, &inode))
            .unwrap_or(false));
        assert!(dir.find_by_path("/y").is_none());
    }
}
