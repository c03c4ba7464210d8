//! In-process connector backed by a path map. Runs the full connector
//! surface without a cluster, with fault injection for the retry and
//! failover paths.

use std::collections::{BTreeMap, VecDeque};
use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::client::{DfsConnector, DfsFileReader, DfsFileWriter};
use crate::{DfsError, DfsResult, DirEntry, DirListing, FileAttributes};

#[derive(Clone)]
struct MemNode {
    is_dir: bool,
    mode: u16,
    owner: String,
    group: String,
    data: Vec<u8>,
    mtime_ms: u64,
}

impl MemNode {
    fn dir(mode: u16, mtime_ms: u64) -> Self {
        Self {
            is_dir: true,
            mode,
            owner: "tester".to_string(),
            group: "testers".to_string(),
            data: Vec::new(),
            mtime_ms,
        }
    }

    fn file(mode: u16, data: Vec<u8>, mtime_ms: u64) -> Self {
        Self {
            is_dir: false,
            mode,
            owner: "tester".to_string(),
            group: "testers".to_string(),
            data,
            mtime_ms,
        }
    }

    fn attrs(&self) -> FileAttributes {
        FileAttributes {
            mode: self.mode,
            owner: self.owner.clone(),
            group: self.group.clone(),
            size: self.data.len() as u64,
            mtime_ms: self.mtime_ms,
            is_dir: self.is_dir,
        }
    }
}

struct MemState {
    nodes: Mutex<BTreeMap<String, MemNode>>,
    faults: Mutex<VecDeque<DfsError>>,
    offline: AtomicBool,
    close_count: AtomicU64,
    mtime_seq: AtomicU64,
}

#[derive(Clone)]
pub struct MemDfs {
    state: Arc<MemState>,
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "/",
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl MemDfs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), MemNode::dir(0o755, 0));
        Self {
            state: Arc::new(MemState {
                nodes: Mutex::new(nodes),
                faults: Mutex::new(VecDeque::new()),
                offline: AtomicBool::new(false),
                close_count: AtomicU64::new(0),
                mtime_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Queues one error to be returned by the next operation.
    pub fn inject_fault(&self, err: DfsError) {
        self.state.faults.lock().unwrap().push_back(err);
    }

    /// While offline every operation fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> u64 {
        self.state.close_count.load(Ordering::SeqCst)
    }

    pub fn insert_file(&self, path: &str, data: &[u8]) {
        let mtime = self.next_mtime();
        self.state
            .nodes
            .lock()
            .unwrap()
            .insert(path.to_string(), MemNode::file(0o644, data.to_vec(), mtime));
    }

    pub fn insert_dir(&self, path: &str) {
        let mtime = self.next_mtime();
        self.state
            .nodes
            .lock()
            .unwrap()
            .insert(path.to_string(), MemNode::dir(0o755, mtime));
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .nodes
            .lock()
            .unwrap()
            .get(path)
            .filter(|node| !node.is_dir)
            .map(|node| node.data.clone())
    }

    /// Every path currently present, the root excluded.
    pub fn paths(&self) -> Vec<String> {
        self.state
            .nodes
            .lock()
            .unwrap()
            .keys()
            .filter(|path| path.as_str() != "/")
            .cloned()
            .collect()
    }

    fn next_mtime(&self) -> u64 {
        self.state.mtime_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn guard(&self) -> DfsResult<()> {
        if self.state.offline.load(Ordering::SeqCst) {
            return Err(DfsError::Transport("endpoint offline".to_string()));
        }
        if let Some(err) = self.state.faults.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(())
    }

    fn children_of(nodes: &BTreeMap<String, MemNode>, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| !key[prefix.len()..].contains('/') && !key[prefix.len()..].is_empty())
            .map(|(key, _)| key.clone())
            .collect()
    }
}

impl Default for MemDfs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DfsConnector for MemDfs {
    async fn stat(&self, path: &str) -> DfsResult<FileAttributes> {
        self.guard()?;
        let nodes = self.state.nodes.lock().unwrap();
        nodes
            .get(path)
            .map(|node| node.attrs())
            .ok_or_else(|| DfsError::NotFound(format!("stat {}", path)))
    }

    async fn list(&self, path: &str) -> DfsResult<DirListing> {
        self.guard()?;
        let nodes = self.state.nodes.lock().unwrap();
        let node = nodes
            .get(path)
            .ok_or_else(|| DfsError::NotFound(format!("list {}", path)))?;
        if !node.is_dir {
            return Ok(DirListing::new(vec![DirEntry {
                name: base_name(path).to_string(),
                attrs: node.attrs(),
            }]));
        }
        let entries = Self::children_of(&nodes, path)
            .into_iter()
            .map(|child| DirEntry {
                name: base_name(&child).to_string(),
                attrs: nodes[&child].attrs(),
            })
            .collect();
        Ok(DirListing::new(entries))
    }

    async fn open_read(&self, path: &str) -> DfsResult<Box<dyn DfsFileReader>> {
        self.guard()?;
        let nodes = self.state.nodes.lock().unwrap();
        let node = nodes
            .get(path)
            .ok_or_else(|| DfsError::NotFound(format!("open {}", path)))?;
        if node.is_dir {
            return Err(DfsError::Invalid(format!("open {}: is a directory", path)));
        }
        Ok(Box::new(MemReader {
            data: node.data.clone(),
            pos: 0,
        }))
    }

    async fn create(
        &self,
        path: &str,
        mode: u16,
        overwrite: bool,
    ) -> DfsResult<Box<dyn DfsFileWriter>> {
        self.guard()?;
        let mtime = self.next_mtime();
        {
            let mut nodes = self.state.nodes.lock().unwrap();
            let parent = nodes
                .get(parent_of(path))
                .ok_or_else(|| DfsError::NotFound(format!("create {}: no parent", path)))?;
            if !parent.is_dir {
                return Err(DfsError::Invalid(format!(
                    "create {}: parent is a file",
                    path
                )));
            }
            if let Some(existing) = nodes.get(path) {
                if existing.is_dir || !overwrite {
                    return Err(DfsError::AlreadyExists(format!("create {}", path)));
                }
            }
            // The entry (truncated to empty) is visible as soon as create
            // returns; content lands when the writer closes.
            nodes.insert(path.to_string(), MemNode::file(mode, Vec::new(), mtime));
        }
        Ok(Box::new(MemWriter {
            state: self.state.clone(),
            path: path.to_string(),
            buf: Vec::new(),
            closed: false,
        }))
    }

    async fn remove(&self, path: &str) -> DfsResult<()> {
        self.guard()?;
        let mut nodes = self.state.nodes.lock().unwrap();
        let node = nodes
            .get(path)
            .ok_or_else(|| DfsError::NotFound(format!("remove {}", path)))?;
        if node.is_dir && !Self::children_of(&nodes, path).is_empty() {
            return Err(DfsError::Invalid(format!(
                "remove {}: directory not empty",
                path
            )));
        }
        nodes.remove(path);
        Ok(())
    }

    async fn rename(&self, src: &str, dst: &str) -> DfsResult<()> {
        self.guard()?;
        let mut nodes = self.state.nodes.lock().unwrap();
        if !nodes.contains_key(src) {
            return Err(DfsError::NotFound(format!("rename {}", src)));
        }
        if nodes.contains_key(dst) {
            return Err(DfsError::AlreadyExists(format!(
                "rename {} -> {}: destination exists",
                src, dst
            )));
        }
        if !nodes
            .get(parent_of(dst))
            .map(|node| node.is_dir)
            .unwrap_or(false)
        {
            return Err(DfsError::NotFound(format!(
                "rename {} -> {}: no destination parent",
                src, dst
            )));
        }
        let src_prefix = format!("{}/", src);
        let moved: Vec<String> = nodes
            .keys()
            .filter(|key| key.as_str() == src || key.starts_with(&src_prefix))
            .cloned()
            .collect();
        for old_key in moved {
            let node = nodes.remove(&old_key).expect("key just listed");
            let new_key = format!("{}{}", dst, &old_key[src.len()..]);
            nodes.insert(new_key, node);
        }
        Ok(())
    }

    async fn mkdir(&self, path: &str, mode: u16) -> DfsResult<()> {
        self.guard()?;
        let mtime = self.next_mtime();
        let mut nodes = self.state.nodes.lock().unwrap();
        if let Some(existing) = nodes.get(path) {
            if existing.is_dir {
                return Ok(());
            }
            return Err(DfsError::AlreadyExists(format!("mkdir {}", path)));
        }
        // Parents spring into existence, matching the remote's mkdirs.
        let mut ancestors = Vec::new();
        let mut current = parent_of(path);
        while current != "/" && !nodes.contains_key(current) {
            ancestors.push(current.to_string());
            current = parent_of(current);
        }
        for ancestor in ancestors.into_iter().rev() {
            nodes.insert(ancestor, MemNode::dir(mode, mtime));
        }
        nodes.insert(path.to_string(), MemNode::dir(mode, mtime));
        Ok(())
    }

    async fn chmod(&self, path: &str, mode: u16) -> DfsResult<()> {
        self.guard()?;
        let mut nodes = self.state.nodes.lock().unwrap();
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| DfsError::NotFound(format!("chmod {}", path)))?;
        node.mode = mode;
        Ok(())
    }

    async fn chown(&self, path: &str, owner: Option<&str>, group: Option<&str>) -> DfsResult<()> {
        self.guard()?;
        let mut nodes = self.state.nodes.lock().unwrap();
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| DfsError::NotFound(format!("chown {}", path)))?;
        if let Some(owner) = owner {
            node.owner = owner.to_string();
        }
        if let Some(group) = group {
            node.group = group.to_string();
        }
        Ok(())
    }

    async fn truncate(&self, path: &str, size: u64) -> DfsResult<()> {
        self.guard()?;
        let mut nodes = self.state.nodes.lock().unwrap();
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| DfsError::NotFound(format!("truncate {}", path)))?;
        if node.is_dir {
            return Err(DfsError::Invalid(format!(
                "truncate {}: is a directory",
                path
            )));
        }
        node.data.resize(size as usize, 0);
        Ok(())
    }

    async fn set_times(
        &self,
        path: &str,
        mtime_ms: Option<u64>,
        _atime_ms: Option<u64>,
    ) -> DfsResult<()> {
        self.guard()?;
        let mut nodes = self.state.nodes.lock().unwrap();
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| DfsError::NotFound(format!("set_times {}", path)))?;
        if let Some(mtime) = mtime_ms {
            node.mtime_ms = mtime;
        }
        Ok(())
    }

    async fn ensure_connected(&self) -> DfsResult<()> {
        self.guard()
    }

    async fn close(&self) {
        self.state.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

struct MemReader {
    data: Vec<u8>,
    pos: u64,
}

#[async_trait]
impl DfsFileReader for MemReader {
    async fn seek(&mut self, pos: SeekFrom) -> DfsResult<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => self.data.len() as i64 + delta,
        };
        if target < 0 {
            return Err(DfsError::Invalid(format!("seek to {}", target)));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }

    async fn read(&mut self, buf: &mut [u8]) -> DfsResult<usize> {
        let start = (self.pos as usize).min(self.data.len());
        let read = (self.data.len() - start).min(buf.len());
        buf[..read].copy_from_slice(&self.data[start..start + read]);
        self.pos += read as u64;
        Ok(read)
    }
}

struct MemWriter {
    state: Arc<MemState>,
    path: String,
    buf: Vec<u8>,
    closed: bool,
}

#[async_trait]
impl DfsFileWriter for MemWriter {
    async fn write(&mut self, data: &[u8]) -> DfsResult<usize> {
        if self.closed {
            return Err(DfsError::Invalid(format!(
                "write {}: writer closed",
                self.path
            )));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    async fn close(&mut self) -> DfsResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut nodes = self.state.nodes.lock().unwrap();
        let node = nodes
            .get_mut(&self.path)
            .ok_or_else(|| DfsError::NotFound(format!("close {}: entry vanished", self.path)))?;
        node.data = std::mem::take(&mut self.buf);
        node.mtime_ms = self.state.mtime_seq.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(&mut self) {
        self.closed = true;
        self.buf.clear();
    }
}
