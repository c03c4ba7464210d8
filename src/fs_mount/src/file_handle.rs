use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dfs_lib::DfsFileReader;

use crate::inode::Inode;

/// Per-open state. All operations on one handle serialize on `state`;
/// operations on different handles of the same inode run in parallel and
/// meet only at the inode's own lock.
pub struct FileHandle {
    pub id: u64,
    pub inode: Arc<Inode>,
    pub flags: i32,
    pub state: tokio::sync::Mutex<HandleState>,
}

#[derive(Default)]
pub struct HandleState {
    pub total_bytes_read: u64,
    pub total_bytes_written: u64,
    /// Remote read-through stream, kept across sequential reads.
    pub reader: Option<Box<dyn DfsFileReader>>,
    pub reader_pos: u64,
}

pub struct HandleTable {
    next_fh: AtomicU64,
    handles: Mutex<HashMap<u64, Arc<FileHandle>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, inode: Arc<Inode>, flags: i32) -> Arc<FileHandle> {
        let id = self.next_fh.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(FileHandle {
            id,
            inode,
            flags,
            state: tokio::sync::Mutex::new(HandleState::default()),
        });
        self.handles.lock().unwrap().insert(id, handle.clone());
        handle
    }

    pub fn get(&self, fh: u64) -> Option<Arc<FileHandle>> {
        self.handles.lock().unwrap().get(&fh).cloned()
    }

    /// Removing the handle is what makes further operations on it fail.
    pub fn remove(&self, fh: u64) -> Option<Arc<FileHandle>> {
        self.handles.lock().unwrap().remove(&fh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_lib::FileAttributes;

    #[test]
    fn test_insert_get_remove() {
        let table = HandleTable::new();
        let inode = Inode::new(2, "/f", FileAttributes::file(0o644, 0));
        let handle = table.insert(inode.clone(), 0);
        assert!(table.get(handle.id).is_some());

        let removed = table.remove(handle.id).unwrap();
        assert_eq!(removed.id, handle.id);
        assert!(table.get(handle.id).is_none());
        assert!(table.remove(handle.id).is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let table = HandleTable::new();
        let inode = Inode::new(2, "/f", FileAttributes::file(0o644, 0));
        let a = table.insert(inode.clone(), 0);
        let b = table.insert(inode, 0);
        assert_ne!(a.id, b.id);
    }
}
