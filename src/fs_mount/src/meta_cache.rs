use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dfs_lib::{DirEntry, FileAttributes, WallClock};

pub const DEFAULT_META_TTL: Duration = Duration::from_secs(5);

pub fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "/",
    }
}

#[derive(Default)]
struct CacheState {
    attrs_by_path: HashMap<String, (FileAttributes, Instant)>,
    listing_by_parent: HashMap<String, (Vec<DirEntry>, Instant)>,
}

/// Short-TTL attribute and listing cache. Local mutations invalidate the
/// affected path and its parent listing before the mutating call returns, so
/// this process never reads its own writes stale; other writers are bounded
/// by the TTL.
pub struct MetaCache {
    ttl: Duration,
    clock: Arc<dyn WallClock>,
    state: Mutex<CacheState>,
}

impl MetaCache {
    pub fn new(ttl: Duration, clock: Arc<dyn WallClock>) -> Self {
        Self {
            ttl,
            clock,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get_attrs(&self, path: &str) -> Option<FileAttributes> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        match state.attrs_by_path.get(path) {
            Some((attrs, deadline)) if *deadline > now => Some(attrs.clone()),
            Some(_) => {
                state.attrs_by_path.remove(path);
                None
            }
            None => None,
        }
    }

    pub fn put_attrs(&self, path: &str, attrs: &FileAttributes) {
        let deadline = self.clock.now() + self.ttl;
        self.state
            .lock()
            .unwrap()
            .attrs_by_path
            .insert(path.to_string(), (attrs.clone(), deadline));
    }

    pub fn get_listing(&self, parent: &str) -> Option<Vec<DirEntry>> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        match state.listing_by_parent.get(parent) {
            Some((entries, deadline)) if *deadline > now => Some(entries.clone()),
            Some(_) => {
                state.listing_by_parent.remove(parent);
                None
            }
            None => None,
        }
    }

    pub fn put_listing(&self, parent: &str, entries: &[DirEntry]) {
        let deadline = self.clock.now() + self.ttl;
        self.state
            .lock()
            .unwrap()
            .listing_by_parent
            .insert(parent.to_string(), (entries.to_vec(), deadline));
    }

    /// Drops the path's attributes, its listing (if it is a directory) and
    /// the parent listing, in one critical section.
    pub fn invalidate_path(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        state.attrs_by_path.remove(path);
        state.listing_by_parent.remove(path);
        state.listing_by_parent.remove(parent_of(path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_lib::FakeClock;

    fn cache_with_clock() -> (MetaCache, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new());
        (
            MetaCache::new(Duration::from_secs(5), clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn test_attrs_expire_after_ttl() {
        let (cache, clock) = cache_with_clock();
        cache.put_attrs("/f", &FileAttributes::file(0o644, 3));
        assert!(cache.get_attrs("/f").is_some());

        clock.sleep(Duration::from_secs(6)).await;
        assert!(cache.get_attrs("/f").is_none());
    }

    #[tokio::test]
    async fn test_listing_expires_after_ttl() {
        let (cache, clock) = cache_with_clock();
        cache.put_listing("/d", &[]);
        assert!(cache.get_listing("/d").is_some());

        clock.sleep(Duration::from_secs(6)).await;
        assert!(cache.get_listing("/d").is_none());
    }

    #[test]
    fn test_invalidate_path_drops_parent_listing() {
        let (cache, _clock) = cache_with_clock();
        cache.put_attrs("/d/f", &FileAttributes::file(0o644, 1));
        cache.put_listing(
            "/d",
            &[DirEntry {
                name: "f".to_string(),
                attrs: FileAttributes::file(0o644, 1),
            }],
        );

        cache.invalidate_path("/d/f");
        assert!(cache.get_attrs("/d/f").is_none());
        assert!(cache.get_listing("/d").is_none());
    }

    #[test]
    fn test_invalidate_directory_drops_own_listing() {
        let (cache, _clock) = cache_with_clock();
        cache.put_listing("/d", &[]);
        cache.invalidate_path("/d");
        assert!(cache.get_listing("/d").is_none());
    }

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/a/b/c"), "/a/b");
        assert_eq!(parent_of("/a"), "/");
        assert_eq!(parent_of("/"), "/");
    }
}
