use std::collections::HashMap;
use std::sync::Mutex;

pub const ROOT_INO: u64 = 1;

struct TableState {
    next_ino: u64,
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
}

/// Bidirectional ino↔path map for everything the kernel has seen. Paths are
/// mount-relative ("/" is the mount root). Rename and remove re-key whole
/// subtrees so directory operations keep every cached descendant consistent.
pub struct InodeTable {
    state: Mutex<TableState>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(ROOT_INO, "/".to_string());
        by_path.insert("/".to_string(), ROOT_INO);
        Self {
            state: Mutex::new(TableState {
                next_ino: ROOT_INO + 1,
                by_ino,
                by_path,
            }),
        }
    }

    pub fn get_path(&self, ino: u64) -> Option<String> {
        self.state.lock().unwrap().by_ino.get(&ino).cloned()
    }

    pub fn get_or_create(&self, path: &str) -> u64 {
        let mut state = self.state.lock().unwrap();
        if let Some(ino) = state.by_path.get(path) {
            return *ino;
        }
        let ino = state.next_ino;
        state.next_ino += 1;
        state.by_ino.insert(ino, path.to_string());
        state.by_path.insert(path.to_string(), ino);
        ino
    }

    /// Drops the path and everything below it; returns the affected inos.
    pub fn remove_path_recursive(&self, path: &str) -> Vec<u64> {
        let mut state = self.state.lock().unwrap();
        let prefix = format!("{}/", path);
        let doomed: Vec<String> = state
            .by_path
            .keys()
            .filter(|candidate| candidate.as_str() == path || candidate.starts_with(&prefix))
            .cloned()
            .collect();
        let mut removed = Vec::with_capacity(doomed.len());
        for key in doomed {
            if let Some(ino) = state.by_path.remove(&key) {
                state.by_ino.remove(&ino);
                removed.push(ino);
            }
        }
        removed
    }

    /// Re-keys the path and everything below it, keeping ino numbers stable
    /// so open files survive the rename. A subtree already present at the
    /// destination is dropped first (rename replaces).
    pub fn rename_path_recursive(&self, old_path: &str, new_path: &str) {
        let mut state = self.state.lock().unwrap();
        let old_prefix = format!("{}/", old_path);
        let moved: Vec<(String, u64)> = state
            .by_path
            .iter()
            .filter(|(key, _)| key.as_str() == old_path || key.starts_with(&old_prefix))
            .map(|(key, ino)| (key.clone(), *ino))
            .collect();
        if moved.is_empty() {
            return;
        }

        let new_prefix = format!("{}/", new_path);
        let replaced: Vec<String> = state
            .by_path
            .keys()
            .filter(|key| key.as_str() == new_path || key.starts_with(&new_prefix))
            .cloned()
            .collect();
        for key in replaced {
            if let Some(ino) = state.by_path.remove(&key) {
                state.by_ino.remove(&ino);
            }
        }

        for (old_key, ino) in moved {
            state.by_path.remove(&old_key);
            let suffix = old_key.strip_prefix(old_path).unwrap_or("");
            let new_key = format!("{}{}", new_path, suffix);
            state.by_path.insert(new_key.clone(), ino);
            state.by_ino.insert(ino, new_key);
        }
    }
}
