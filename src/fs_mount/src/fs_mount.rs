use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyPoll, ReplyWrite, Request, TimeOrNow,
};
use libc::{EBADF, EEXIST, EINVAL, EIO, EISDIR, ENOENT, ENOSYS};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::Runtime;

use dfs_lib::{
    AccessorRouter, DfsConnector, DfsError, DfsResult, FaultTolerantAccessor, FileAttributes,
    RetryPolicy, SystemClock, TlsBundle, WallClock, WebHdfsClient, WebHdfsConfig,
};
use fs_staging::{StagingStore, DEFAULT_ORPHAN_AGE};

use crate::file_handle::HandleTable;
use crate::inode::{Inode, InodeDir};
use crate::inode_table::InodeTable;
use crate::meta_cache::{MetaCache, DEFAULT_META_TTL};

/// Upload chunk size for the staging → remote copy.
const COPY_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct MountRunOptions {
    pub mountpoint: PathBuf,
    pub endpoints: Vec<String>,
    pub remote_root: String,
    pub user: String,
    pub config_path: Option<PathBuf>,
    pub allow_other: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    #[serde(alias = "staging_path", alias = "buffer_dir")]
    pub staging_dir: PathBuf,
    #[serde(alias = "meta_ttl")]
    pub meta_ttl_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub orphan_age_secs: u64,
    pub request_timeout_secs: u64,
    pub allow_other: bool,
    pub tls: Option<TlsFileConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsFileConfig {
    pub root_ca: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

impl Default for MountConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            staging_dir: PathBuf::from("/var/lib/dfs_mount/staging"),
            meta_ttl_ms: DEFAULT_META_TTL.as_millis() as u64,
            retry_max_attempts: policy.max_attempts,
            retry_initial_delay_ms: policy.initial_delay.as_millis() as u64,
            retry_max_delay_ms: policy.max_delay.as_millis() as u64,
            orphan_age_secs: DEFAULT_ORPHAN_AGE.as_secs(),
            request_timeout_secs: dfs_lib::DEFAULT_REQUEST_TIMEOUT.as_secs(),
            allow_other: false,
            tls: None,
        }
    }
}

impl MountConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

pub fn read_json_config<T: DeserializeOwned>(path: &Path) -> DfsResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| DfsError::LocalIo(format!("read {}: {}", path.display(), e)))?;
    serde_json::from_str::<T>(&content)
        .map_err(|e| DfsError::Invalid(format!("parse {}: {}", path.display(), e)))
}

fn map_dfs_err(err: DfsError) -> i32 {
    match err {
        DfsError::NotFound(_) => ENOENT,
        DfsError::AlreadyExists(_) => EEXIST,
        DfsError::PermissionDenied(_) => libc::EACCES,
        DfsError::Invalid(_) => EINVAL,
        DfsError::Unsupported(_) => ENOSYS,
        DfsError::Transport(_) => EIO,
        DfsError::RemoteUnavailable(_) => EIO,
        DfsError::Eof(_) => EIO,
        DfsError::LocalIo(_) => EIO,
        DfsError::Internal(_) => EIO,
    }
}

fn join_child(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

fn normalize_root(root: &str) -> String {
    let trimmed = root.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn millis_to_system_time(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

pub struct DfsMount {
    runtime: Runtime,
    connector: Arc<dyn DfsConnector>,
    remote_root: String,
    inode_table: InodeTable,
    inodes: InodeDir,
    handles: HandleTable,
    meta: MetaCache,
    staging: StagingStore,
    clock: Arc<dyn WallClock>,
    retry_policy: RetryPolicy,
    attr_ttl: Duration,
}

impl DfsMount {
    pub fn new(
        runtime: Runtime,
        connector: Arc<dyn DfsConnector>,
        remote_root: &str,
        staging: StagingStore,
        clock: Arc<dyn WallClock>,
        retry_policy: RetryPolicy,
        meta_ttl: Duration,
    ) -> Self {
        Self {
            runtime,
            connector,
            remote_root: normalize_root(remote_root),
            inode_table: InodeTable::new(),
            inodes: InodeDir::new(),
            handles: HandleTable::new(),
            meta: MetaCache::new(meta_ttl, clock.clone()),
            staging,
            clock,
            retry_policy,
            attr_ttl: meta_ttl,
        }
    }

    fn remote_path(&self, rel: &str) -> String {
        if self.remote_root == "/" {
            rel.to_string()
        } else if rel == "/" {
            self.remote_root.clone()
        } else {
            format!("{}{}", self.remote_root, rel)
        }
    }

    fn path_from_parent(&self, parent: u64, name: &str) -> Option<String> {
        let parent_path = self.inode_table.get_path(parent)?;
        Some(join_child(&parent_path, name))
    }

    fn build_attr(&self, ino: u64, attrs: &FileAttributes, size_override: Option<u64>) -> FileAttr {
        let (kind, nlink) = if attrs.is_dir {
            (FileType::Directory, 2)
        } else {
            (FileType::RegularFile, 1)
        };
        let size = size_override.unwrap_or(attrs.size);
        let mtime = millis_to_system_time(attrs.mtime_ms);
        FileAttr {
            ino,
            size,
            blocks: (size + 511) / 512,
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm: attrs.mode & 0o7777,
            nlink,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            flags: 0,
            blksize: 4096,
        }
    }

    async fn stat_rel(&self, path: &str) -> DfsResult<FileAttributes> {
        if let Some(attrs) = self.meta.get_attrs(path) {
            return Ok(attrs);
        }
        let attrs = self.connector.stat(&self.remote_path(path)).await?;
        self.meta.put_attrs(path, &attrs);
        Ok(attrs)
    }

    /// Snapshot of an open inode's attributes; a dirty stage overrides the
    /// size so writes are visible to stat before they are flushed.
    async fn attr_of_inode(&self, inode: &Arc<Inode>) -> DfsResult<FileAttr> {
        let state = inode.state.lock().await;
        let size_override = match (&state.staging, state.dirty) {
            (Some(stage), true) => Some(stage.len()?),
            _ => None,
        };
        Ok(self.build_attr(inode.ino, &state.attrs, size_override))
    }

    /// Creates the staging file on demand and performs the ReadOnly→ReadWrite
    /// transition under the inode lock, hydrating from the remote when the
    /// file already has content there.
    async fn upgrade_for_write(&self, inode: &Arc<Inode>) -> DfsResult<()> {
        let mut state = inode.state.lock().await;
        if state.staging.is_none() {
            state.staging = Some(self.staging.allocate(inode.ino)?);
        }
        let needs_content = state.attrs.size > 0;
        let stage = state.staging.as_mut().expect("staging just ensured");
        if matches!(stage.mode(), fs_staging::StagingMode::ReadWrite) {
            return Ok(());
        }
        if needs_content {
            let remote = self.remote_path(&inode.path());
            match self.connector.open_read(&remote).await {
                Ok(mut reader) => stage.upgrade_for_write(Some(reader.as_mut())).await?,
                Err(err) if err.is_not_found() => stage.upgrade_for_write(None).await?,
                Err(err) => return Err(err),
            }
        } else {
            stage.upgrade_for_write(None).await?;
        }
        Ok(())
    }

    async fn stream_stage_to_writer(
        stage: &std::fs::File,
        expected: u64,
        writer: &mut (dyn dfs_lib::DfsFileWriter + '_),
    ) -> DfsResult<u64> {
        use std::os::unix::fs::FileExt;

        let mut buf = vec![0u8; COPY_CHUNK_SIZE];
        let mut offset = 0u64;
        loop {
            let read = stage.read_at(&mut buf, offset)?;
            if read == 0 {
                break;
            }
            let mut sent = 0usize;
            while sent < read {
                sent += writer.write(&buf[sent..read]).await?;
            }
            offset += read as u64;
        }
        if offset != expected {
            // A stage that shrank mid-copy means the transfer is incomplete.
            return Err(DfsError::Transport(format!(
                "staging delivered {} of {} bytes",
                offset, expected
            )));
        }
        Ok(offset)
    }

    async fn flush_attempt(&self, inode: &Arc<Inode>) -> DfsResult<u64> {
        let (stage_file, expected, mode) = {
            let state = inode.state.lock().await;
            let stage = state
                .staging
                .as_ref()
                .ok_or_else(|| DfsError::Internal("flush without staging".to_string()))?;
            (stage.clone_for_read()?, stage.len()?, state.attrs.mode)
        };
        let remote = self.remote_path(&inode.path());
        let mut writer = self.connector.create(&remote, mode, true).await?;
        match Self::stream_stage_to_writer(&stage_file, expected, writer.as_mut()).await {
            Ok(written) => {
                writer.close().await?;
                Ok(written)
            }
            Err(err) => {
                writer.abort().await;
                Err(err)
            }
        }
    }

    /// Uploads the staged content, retrying the whole copy as a unit. Each
    /// attempt starts over with `create(overwrite)`, which discards partial
    /// server-side state; the current inode path is re-read per attempt so a
    /// rename while open lands at the new location.
    async fn copy_to_remote(&self, inode: &Arc<Inode>, what: &str) -> DfsResult<()> {
        let mut op = self.retry_policy.start_operation(self.clock.as_ref());
        loop {
            match self.flush_attempt(inode).await {
                Ok(written) => {
                    let path = inode.path();
                    {
                        let mut state = inode.state.lock().await;
                        state.dirty = false;
                        state.attrs.size = written;
                        if let Some(stage) = state.staging.as_mut() {
                            stage.clear_dirty();
                        }
                    }
                    self.meta.invalidate_path(&path);
                    info!("{}: uploaded {} bytes to {}", what, written, path);
                    return Ok(());
                }
                Err(err) => {
                    if op.should_retry(&err) {
                        warn!(
                            "{}: upload of {} failed on attempt {}, reconnecting: {}",
                            what,
                            inode.path(),
                            op.attempt() + 1,
                            err
                        );
                        self.connector.close().await;
                        op.backoff(self.clock.as_ref()).await;
                        continue;
                    }
                    // Staging stays behind for a later flush attempt.
                    warn!("{}: upload of {} abandoned: {}", what, inode.path(), err);
                    return Err(err);
                }
            }
        }
    }

    async fn truncate_inode(&self, inode: &Arc<Inode>, size: u64) -> DfsResult<()> {
        self.upgrade_for_write(inode).await?;
        let mut state = inode.state.lock().await;
        let stage = state.staging.as_mut().expect("staging after upgrade");
        stage.truncate(size)?;
        state.attrs.size = size;
        state.dirty = true;
        Ok(())
    }

    pub(crate) fn lookup_entry(&self, parent: u64, name: &str) -> Result<(u64, FileAttr), i32> {
        let path = self.path_from_parent(parent, name).ok_or(ENOENT)?;
        self.runtime.block_on(async {
            if let Some(inode) = self.inodes.find_by_path(&path) {
                // An unlinked inode stays usable through its handles but no
                // longer resolves by name.
                if !inode.state.lock().await.unlinked {
                    let attr = self.attr_of_inode(&inode).await.map_err(map_dfs_err)?;
                    return Ok((inode.ino, attr));
                }
            }
            let attrs = self.stat_rel(&path).await.map_err(map_dfs_err)?;
            let ino = self.inode_table.get_or_create(&path);
            Ok((ino, self.build_attr(ino, &attrs, None)))
        })
    }

    pub(crate) fn getattr_entry(&self, ino: u64) -> Result<FileAttr, i32> {
        self.runtime.block_on(async {
            if let Some(inode) = self.inodes.get(ino) {
                return self.attr_of_inode(&inode).await.map_err(map_dfs_err);
            }
            let path = self.inode_table.get_path(ino).ok_or(ENOENT)?;
            let attrs = self.stat_rel(&path).await.map_err(map_dfs_err)?;
            Ok(self.build_attr(ino, &attrs, None))
        })
    }

    pub(crate) fn readdir_entries(
        &self,
        ino: u64,
        offset: i64,
    ) -> Result<Vec<(u64, FileType, String, i64)>, i32> {
        let path = self.inode_table.get_path(ino).ok_or(ENOENT)?;
        let entries = self
            .runtime
            .block_on(async {
                if let Some(cached) = self.meta.get_listing(&path) {
                    return Ok(cached);
                }
                let listing = self.connector.list(&self.remote_path(&path)).await?;
                self.meta.put_listing(&path, &listing.entries);
                // Prime the attribute cache so the per-entry lookup storm
                // that follows a readdir is served locally.
                for entry in &listing.entries {
                    self.meta
                        .put_attrs(&join_child(&path, &entry.name), &entry.attrs);
                }
                Ok(listing.entries)
            })
            .map_err(map_dfs_err)?;

        let mut out = Vec::new();
        let mut index: i64 = offset;
        if offset == 0 {
            out.push((ino, FileType::Directory, ".".to_string(), 1));
            out.push((ino, FileType::Directory, "..".to_string(), 2));
            index = 2;
        }
        for entry in entries.into_iter().skip((index - 2).max(0) as usize) {
            let child_path = join_child(&path, &entry.name);
            let child_ino = self.inode_table.get_or_create(&child_path);
            let kind = if entry.attrs.is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            index += 1;
            out.push((child_ino, kind, entry.name, index));
        }
        Ok(out)
    }

    pub(crate) fn open_file(&self, ino: u64, flags: i32) -> Result<u64, i32> {
        let path = self.inode_table.get_path(ino).ok_or(ENOENT)?;
        self.runtime.block_on(async {
            let attrs = self.stat_rel(&path).await.map_err(map_dfs_err)?;
            let accmode = flags & libc::O_ACCMODE;
            let write = accmode == libc::O_WRONLY || accmode == libc::O_RDWR;
            if attrs.is_dir && write {
                return Err(EISDIR);
            }
            let inode = self.inodes.get_or_insert(ino, &path, attrs);
            let handle = self.handles.insert(inode.clone(), flags);
            inode.state.lock().await.handles.insert(handle.id);

            if write && (flags & libc::O_TRUNC) != 0 {
                self.truncate_inode(&inode, 0).await.map_err(map_dfs_err)?;
            }
            debug!("open {} fh={} flags={:#o}", path, handle.id, flags);
            Ok(handle.id)
        })
    }

    pub(crate) fn create_file(
        &self,
        parent: u64,
        name: &str,
        mode: u16,
        flags: i32,
    ) -> Result<(FileAttr, u64), i32> {
        let path = self.path_from_parent(parent, name).ok_or(ENOENT)?;
        self.runtime.block_on(async {
            let overwrite = (flags & libc::O_EXCL) == 0;
            let remote = self.remote_path(&path);
            // The empty file is materialized remotely right away so the new
            // entry is visible; data stages locally until flush.
            let mut writer = self
                .connector
                .create(&remote, mode, overwrite)
                .await
                .map_err(map_dfs_err)?;
            writer.close().await.map_err(map_dfs_err)?;
            self.meta.invalidate_path(&path);

            let attrs = self.stat_rel(&path).await.map_err(map_dfs_err)?;
            let ino = self.inode_table.get_or_create(&path);
            let inode = self.inodes.get_or_insert(ino, &path, attrs.clone());
            {
                let mut state = inode.state.lock().await;
                state.attrs = attrs.clone();
                match state.staging.as_mut() {
                    Some(stage) => {
                        // A concurrent open staged content for the previous
                        // incarnation of the path; create truncates it.
                        stage.truncate(0).map_err(map_dfs_err)?;
                        state.dirty = true;
                    }
                    None => {
                        let mut stage = self.staging.allocate(ino).map_err(map_dfs_err)?;
                        stage.mark_populated();
                        stage.upgrade_for_write(None).await.map_err(map_dfs_err)?;
                        state.staging = Some(stage);
                        state.dirty = false;
                    }
                }
            }
            let handle = self.handles.insert(inode.clone(), flags);
            inode.state.lock().await.handles.insert(handle.id);
            debug!("create {} fh={}", path, handle.id);
            Ok((self.build_attr(ino, &attrs, Some(0)), handle.id))
        })
    }

    pub(crate) fn read_handle(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>, i32> {
        let handle = self.handles.get(fh).ok_or(EBADF)?;
        self.runtime.block_on(async {
            let mut hs = handle.state.lock().await;
            {
                let inode_state = handle.inode.state.lock().await;
                if let Some(stage) = inode_state.staging.as_ref() {
                    let mut buf = vec![0u8; size as usize];
                    let read = stage.read_at(offset, &mut buf).map_err(map_dfs_err)?;
                    buf.truncate(read);
                    hs.total_bytes_read += read as u64;
                    return Ok(buf);
                }
            }

            // Read-through: one remote stream per handle, reopened on seeks.
            if hs.reader.is_none() {
                let remote = self.remote_path(&handle.inode.path());
                hs.reader = Some(
                    self.connector
                        .open_read(&remote)
                        .await
                        .map_err(map_dfs_err)?,
                );
                hs.reader_pos = 0;
            }
            if hs.reader_pos != offset {
                let pos = hs
                    .reader
                    .as_mut()
                    .expect("reader just ensured")
                    .seek(SeekFrom::Start(offset))
                    .await
                    .map_err(map_dfs_err)?;
                hs.reader_pos = pos;
            }
            let mut buf = vec![0u8; size as usize];
            let mut total = 0usize;
            while total < buf.len() {
                let read = hs
                    .reader
                    .as_mut()
                    .expect("reader just ensured")
                    .read(&mut buf[total..])
                    .await
                    .map_err(map_dfs_err)?;
                if read == 0 {
                    break;
                }
                total += read;
            }
            buf.truncate(total);
            hs.reader_pos += total as u64;
            hs.total_bytes_read += total as u64;
            Ok(buf)
        })
    }

    pub(crate) fn write_handle(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize, i32> {
        let handle = self.handles.get(fh).ok_or(EBADF)?;
        self.runtime.block_on(async {
            let mut hs = handle.state.lock().await;
            self.upgrade_for_write(&handle.inode)
                .await
                .map_err(map_dfs_err)?;
            let written = {
                let mut inode_state = handle.inode.state.lock().await;
                let stage = inode_state
                    .staging
                    .as_mut()
                    .expect("staging after upgrade");
                let written = stage.write_at(offset, data).map_err(map_dfs_err)?;
                inode_state.dirty = true;
                written
            };
            hs.total_bytes_written += written as u64;
            Ok(written)
        })
    }

    /// Flush and fsync share this; the distinction is only logged.
    pub(crate) fn flush_handle(&self, fh: u64, what: &str) -> Result<(), i32> {
        let handle = self.handles.get(fh).ok_or(EBADF)?;
        self.runtime.block_on(async {
            let _hs = handle.state.lock().await;
            let dirty = handle.inode.state.lock().await.dirty;
            if !dirty {
                return Ok(());
            }
            debug!("{} fh={} path={}", what, fh, handle.inode.path());
            self.copy_to_remote(&handle.inode, what)
                .await
                .map_err(map_dfs_err)
        })
    }

    pub(crate) fn truncate_handle(&self, fh: u64, size: u64) -> Result<(), i32> {
        let handle = self.handles.get(fh).ok_or(EBADF)?;
        self.runtime.block_on(async {
            let _hs = handle.state.lock().await;
            self.truncate_inode(&handle.inode, size)
                .await
                .map_err(map_dfs_err)
        })
    }

    pub(crate) fn release_handle(&self, fh: u64) -> Result<(), i32> {
        let handle = self.handles.remove(fh).ok_or(EBADF)?;
        self.runtime.block_on(async {
            let mut hs = handle.state.lock().await;
            let dirty = handle.inode.state.lock().await.dirty;
            let mut result = Ok(());
            if dirty {
                result = self
                    .copy_to_remote(&handle.inode, "release")
                    .await
                    .map_err(map_dfs_err);
            }
            hs.reader = None;
            let (path, remaining) = {
                let mut inode_state = handle.inode.state.lock().await;
                inode_state.handles.remove(&handle.id);
                let remaining = inode_state.handles.len();
                if remaining == 0 {
                    // Last close: the scratch file goes away with the slot.
                    inode_state.staging = None;
                }
                (handle.inode.path(), remaining)
            };
            if remaining == 0 {
                self.inodes.remove(handle.inode.ino);
            }
            self.meta.invalidate_path(&path);
            debug!(
                "release fh={} path={} flags={:#o} read={} written={} remaining={}",
                fh, path, handle.flags, hs.total_bytes_read, hs.total_bytes_written, remaining
            );
            result
        })
    }

    pub(crate) fn mkdir_path(&self, parent: u64, name: &str, mode: u16) -> Result<FileAttr, i32> {
        let path = self.path_from_parent(parent, name).ok_or(ENOENT)?;
        self.runtime.block_on(async {
            match self.stat_rel(&path).await {
                Ok(_) => return Err(EEXIST),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(map_dfs_err(err)),
            }
            self.connector
                .mkdir(&self.remote_path(&path), mode)
                .await
                .map_err(map_dfs_err)?;
            self.meta.invalidate_path(&path);
            let attrs = self.stat_rel(&path).await.map_err(map_dfs_err)?;
            let ino = self.inode_table.get_or_create(&path);
            Ok(self.build_attr(ino, &attrs, None))
        })
    }

    pub(crate) fn unlink_path(&self, parent: u64, name: &str) -> Result<(), i32> {
        let path = self.path_from_parent(parent, name).ok_or(ENOENT)?;
        self.runtime.block_on(async {
            self.connector
                .remove(&self.remote_path(&path))
                .await
                .map_err(map_dfs_err)?;
            self.meta.invalidate_path(&path);
            if let Some(inode) = self.inodes.find_by_path(&path) {
                // Open handles keep working; flushes still target this path.
                inode.state.lock().await.unlinked = true;
            }
            Ok(())
        })?;
        self.inode_table.remove_path_recursive(&path);
        Ok(())
    }

    pub(crate) fn rename_path(
        &self,
        parent: u64,
        name: &str,
        newparent: u64,
        newname: &str,
    ) -> Result<(), i32> {
        let old_path = self.path_from_parent(parent, name).ok_or(ENOENT)?;
        let new_path = self.path_from_parent(newparent, newname).ok_or(ENOENT)?;
        self.runtime.block_on(async {
            let remote_old = self.remote_path(&old_path);
            let remote_new = self.remote_path(&new_path);
            match self.connector.rename(&remote_old, &remote_new).await {
                Ok(()) => Ok(()),
                Err(DfsError::AlreadyExists(_)) => {
                    // POSIX rename replaces the destination.
                    self.connector.remove(&remote_new).await?;
                    self.connector.rename(&remote_old, &remote_new).await
                }
                Err(err) => Err(err),
            }
            .map_err(map_dfs_err)
        })?;
        self.meta.invalidate_path(&old_path);
        self.meta.invalidate_path(&new_path);
        self.inode_table.rename_path_recursive(&old_path, &new_path);
        self.inodes.rename_prefix(&old_path, &new_path);
        Ok(())
    }

    pub(crate) fn set_size(&self, ino: u64, fh: Option<u64>, size: u64) -> Result<(), i32> {
        if let Some(fh) = fh {
            return self.truncate_handle(fh, size);
        }
        if let Some(inode) = self.inodes.get(ino) {
            // Open, but the kernel did not hand us a handle: stage anyway.
            return self
                .runtime
                .block_on(self.truncate_inode(&inode, size))
                .map_err(map_dfs_err);
        }
        let path = self.inode_table.get_path(ino).ok_or(ENOENT)?;
        self.runtime.block_on(async {
            let attrs = self.stat_rel(&path).await.map_err(map_dfs_err)?;
            if attrs.is_dir {
                return Err(EISDIR);
            }
            if size == attrs.size {
                return Ok(());
            }
            let remote = self.remote_path(&path);
            if size == 0 {
                let mut writer = self
                    .connector
                    .create(&remote, attrs.mode, true)
                    .await
                    .map_err(map_dfs_err)?;
                writer.close().await.map_err(map_dfs_err)?;
            } else if size < attrs.size {
                self.connector
                    .truncate(&remote, size)
                    .await
                    .map_err(map_dfs_err)?;
            } else {
                // Growing needs a handle to stage zero-fill through.
                return Err(EINVAL);
            }
            self.meta.invalidate_path(&path);
            Ok(())
        })
    }

    pub(crate) fn set_mode(&self, ino: u64, mode: u16) -> Result<(), i32> {
        let path = self.inode_table.get_path(ino).ok_or(ENOENT)?;
        self.runtime.block_on(async {
            self.connector
                .chmod(&self.remote_path(&path), mode)
                .await
                .map_err(map_dfs_err)?;
            self.meta.invalidate_path(&path);
            if let Some(inode) = self.inodes.get(ino) {
                inode.state.lock().await.attrs.mode = mode;
            }
            Ok(())
        })
    }

    pub(crate) fn set_owner(&self, ino: u64, uid: Option<u32>, gid: Option<u32>) -> Result<(), i32> {
        let path = self.inode_table.get_path(ino).ok_or(ENOENT)?;
        // Numeric ids pass through textually; id↔name translation is the
        // name-service cache's job, outside this daemon.
        let owner = uid.map(|v| v.to_string());
        let group = gid.map(|v| v.to_string());
        self.runtime.block_on(async {
            self.connector
                .chown(
                    &self.remote_path(&path),
                    owner.as_deref(),
                    group.as_deref(),
                )
                .await
                .map_err(map_dfs_err)?;
            self.meta.invalidate_path(&path);
            Ok(())
        })
    }

    pub(crate) fn set_times_path(
        &self,
        ino: u64,
        mtime_ms: Option<u64>,
        atime_ms: Option<u64>,
    ) -> Result<(), i32> {
        if mtime_ms.is_none() && atime_ms.is_none() {
            return Ok(());
        }
        let path = self.inode_table.get_path(ino).ok_or(ENOENT)?;
        self.runtime.block_on(async {
            self.connector
                .set_times(&self.remote_path(&path), mtime_ms, atime_ms)
                .await
                .map_err(map_dfs_err)?;
            self.meta.invalidate_path(&path);
            if let (Some(mtime), Some(inode)) = (mtime_ms, self.inodes.get(ino)) {
                inode.state.lock().await.attrs.mtime_ms = mtime;
            }
            Ok(())
        })
    }
}

impl Filesystem for DfsMount {
    fn lookup(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        reply: ReplyEntry,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.lookup_entry(parent, name) {
            Ok((_ino, attr)) => reply.entry(&self.attr_ttl, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.getattr_entry(ino) {
            Ok(attr) => reply.attr(&self.attr_ttl, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        match self.readdir_entries(ino, offset) {
            Ok(entries) => {
                for (entry_ino, kind, name, next_offset) in entries {
                    if reply.add(entry_ino, next_offset, kind, name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(code) => reply.error(code),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.open_file(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.create_file(parent, name, (mode & 0o7777) as u16, flags) {
            Ok((attr, fh)) => reply.created(&self.attr_ttl, &attr, 0, fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.read_handle(fh, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(code) => reply.error(code),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.write_handle(fh, offset as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(code) => reply.error(code),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.flush_handle(fh, "flush") {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.flush_handle(fh, "fsync") {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.release_handle(fh) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.mkdir_path(parent, name, (mode & 0o7777) as u16) {
            Ok(attr) => reply.entry(&self.attr_ttl, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: ReplyEmpty) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.unlink_path(parent, name) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: ReplyEmpty) {
        self.unlink(req, parent, name, reply);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        newparent: u64,
        newname: &std::ffi::OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (name, newname) = match (name.to_str(), newname.to_str()) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.rename_path(parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(
            "setattr ino={} mode={:?} uid={:?} gid={:?} size={:?} fh={:?}",
            ino, mode, uid, gid, size, fh
        );
        if let Some(size) = size {
            if let Err(code) = self.set_size(ino, fh, size) {
                reply.error(code);
                return;
            }
        }
        if let Some(mode) = mode {
            if let Err(code) = self.set_mode(ino, (mode & 0o7777) as u16) {
                reply.error(code);
                return;
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(code) = self.set_owner(ino, uid, gid) {
                reply.error(code);
                return;
            }
        }
        if atime.is_some() || mtime.is_some() {
            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64;
            let to_ms = |t: TimeOrNow| match t {
                TimeOrNow::SpecificTime(st) => st
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64,
                TimeOrNow::Now => now_ms,
            };
            if let Err(code) = self.set_times_path(ino, mtime.map(to_ms), atime.map(to_ms)) {
                reply.error(code);
                return;
            }
        }
        match self.getattr_entry(ino) {
            Ok(attr) => reply.attr(&self.attr_ttl, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        reply.statfs(0, 0, 0, 0, 0, 512, 255, 0);
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    /// Standing contract: the first poll probe is answered "not supported",
    /// which the kernel treats as permanent and stops polling this mount.
    fn poll(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _kh: u64,
        _events: u32,
        _flags: u32,
        reply: ReplyPoll,
    ) {
        debug!("poll ino={}: declined", ino);
        reply.error(ENOSYS);
    }
}

pub fn run_mount(options: MountRunOptions) -> DfsResult<()> {
    let runtime = Runtime::new().map_err(|e| DfsError::Internal(e.to_string()))?;
    let config: MountConfig = match options.config_path.as_ref() {
        Some(path) => read_json_config(path)?,
        None => MountConfig::default(),
    };
    if options.endpoints.is_empty() {
        return Err(DfsError::Invalid("no namenode endpoints given".to_string()));
    }

    let clock: Arc<dyn WallClock> = Arc::new(SystemClock);
    let policy = config.retry_policy();
    let tls = config.tls.as_ref().map(|t| TlsBundle {
        root_ca: t.root_ca.clone(),
        client_cert: t.client_cert.clone(),
        client_key: t.client_key.clone(),
    });

    let mut accessors: Vec<Arc<dyn DfsConnector>> = Vec::with_capacity(options.endpoints.len());
    for endpoint in &options.endpoints {
        let client = WebHdfsClient::new(WebHdfsConfig {
            endpoint: endpoint.clone(),
            user: options.user.clone(),
            tls: tls.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs),
        });
        accessors.push(Arc::new(FaultTolerantAccessor::new(
            Arc::new(client),
            policy.clone(),
            clock.clone(),
        )));
    }
    let router = AccessorRouter::new(accessors)?;
    runtime.block_on(router.ensure_connected())?;

    let staging = StagingStore::new(
        &config.staging_dir,
        Duration::from_secs(config.orphan_age_secs),
    )?;
    std::fs::create_dir_all(&options.mountpoint)
        .map_err(|e| DfsError::LocalIo(format!("create mountpoint: {}", e)))?;

    let fs_name = format!("dfs://{}", options.endpoints[0]);
    let mut mount_options = vec![
        MountOption::FSName(fs_name),
        MountOption::DefaultPermissions,
        MountOption::AutoUnmount,
        // Generous read-ahead suits the streaming read path.
        MountOption::CUSTOM("max_read=1048576".to_string()),
    ];
    if options.allow_other || config.allow_other {
        mount_options.push(MountOption::AllowOther);
    }

    info!(
        "mounting {} at {:?} (root {})",
        options.endpoints.join(","),
        options.mountpoint,
        options.remote_root
    );
    let filesystem = DfsMount::new(
        runtime,
        Arc::new(router),
        &options.remote_root,
        staging,
        clock,
        policy,
        Duration::from_millis(config.meta_ttl_ms),
    );
    match fuser::spawn_mount2(filesystem, &options.mountpoint, &mount_options) {
        Ok(session) => {
            println!("dfs_mount: mounted at {:?}", options.mountpoint);
            session.join();
            Ok(())
        }
        Err(err) => Err(DfsError::LocalIo(format!("mount failed: {}", err))),
    }
}
