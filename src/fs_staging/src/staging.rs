use std::fs::{File, OpenOptions};
use std::io::SeekFrom;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt as LockExt;
use log::{debug, info, warn};

use dfs_lib::{DfsError, DfsFileReader, DfsResult};

pub const DEFAULT_ORPHAN_AGE: Duration = Duration::from_secs(24 * 60 * 60);

const STAGE_EXTENSION: &str = "stage";
const HYDRATE_CHUNK_SIZE: usize = 64 * 1024;

fn write_at_all(file: &File, mut offset: u64, mut buf: &[u8]) -> DfsResult<()> {
    while !buf.is_empty() {
        let written = file.write_at(buf, offset)?;
        if written == 0 {
            return Err(DfsError::LocalIo("write_at returned zero".to_string()));
        }
        offset += written as u64;
        buf = &buf[written..];
    }
    Ok(())
}

/// Owns the staging base directory. One scratch file per open inode lives
/// here while the inode has handles; files left behind by a crashed daemon
/// are swept by age on startup.
pub struct StagingStore {
    base_dir: PathBuf,
}

impl StagingStore {
    pub fn new(base_dir: impl Into<PathBuf>, orphan_age: Duration) -> DfsResult<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        let store = Self { base_dir };
        store.sweep_orphans(orphan_age);
        Ok(store)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn sweep_orphans(&self, orphan_age: Duration) {
        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("staging sweep: cannot read {:?}: {}", self.base_dir, err);
                return;
            }
        };
        let mut removed = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STAGE_EXTENSION) {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .map(|age| age >= orphan_age)
                .unwrap_or(false);
            if stale {
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(err) => warn!("staging sweep: cannot remove {:?}: {}", path, err),
                }
            }
        }
        if removed > 0 {
            info!("staging sweep: removed {} orphan file(s)", removed);
        }
    }

    /// Creates a fresh, empty, exclusively locked staging file for the inode.
    pub fn allocate(&self, ino: u64) -> DfsResult<StagingFile> {
        for _ in 0..8 {
            let name = format!("{:x}-{:08x}.{}", ino, rand::random::<u32>(), STAGE_EXTENSION);
            let path = self.base_dir.join(name);
            let file = match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            };
            if let Err(err) = file.try_lock_exclusive() {
                return Err(DfsError::LocalIo(format!(
                    "staging file {:?} already locked: {}",
                    path, err
                )));
            }
            debug!("allocated staging file {:?}", path);
            return Ok(StagingFile {
                path,
                file,
                mode: StagingMode::ReadOnly,
                populated: false,
                dirty_bytes: 0,
            });
        }
        Err(DfsError::LocalIo(
            "staging file name collisions exhausted".to_string(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingMode {
    ReadOnly,
    ReadWrite,
}

/// Local sparse scratch file mirroring one remote file while it is open.
/// Positional reads and writes rely on pread/pwrite atomicity; callers
/// coordinate the ReadOnly→ReadWrite transition under the inode lock.
pub struct StagingFile {
    path: PathBuf,
    file: File,
    mode: StagingMode,
    populated: bool,
    dirty_bytes: u64,
}

impl StagingFile {
    pub fn mode(&self) -> StagingMode {
        self.mode
    }

    pub fn dirty_bytes(&self) -> u64 {
        self.dirty_bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> DfsResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Marks the file as holding the full remote content already (used right
    /// after create, when the remote file is known to be empty).
    pub fn mark_populated(&mut self) {
        self.populated = true;
    }

    /// Transitions ReadOnly → ReadWrite. Idempotent. When the stage was not
    /// pre-populated and a base reader is supplied, the remote content is
    /// streamed in first so already-buffered read state survives the switch.
    pub async fn upgrade_for_write(
        &mut self,
        base: Option<&mut (dyn DfsFileReader + '_)>,
    ) -> DfsResult<()> {
        if self.mode == StagingMode::ReadWrite {
            return Ok(());
        }
        if !self.populated {
            if let Some(reader) = base {
                self.hydrate(reader).await?;
            } else {
                self.populated = true;
            }
        }
        self.mode = StagingMode::ReadWrite;
        debug!("staging file {:?} upgraded for write", self.path);
        Ok(())
    }

    async fn hydrate(&mut self, reader: &mut (dyn DfsFileReader + '_)) -> DfsResult<()> {
        reader.seek(SeekFrom::Start(0)).await?;
        let mut buf = vec![0u8; HYDRATE_CHUNK_SIZE];
        let mut offset = 0u64;
        loop {
            let read = reader.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            write_at_all(&self.file, offset, &buf[..read])?;
            offset += read as u64;
        }
        self.populated = true;
        debug!("hydrated {:?} with {} bytes", self.path, offset);
        Ok(())
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> DfsResult<usize> {
        Ok(self.file.read_at(buf, offset)?)
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> DfsResult<usize> {
        if self.mode != StagingMode::ReadWrite {
            return Err(DfsError::Internal(format!(
                "staging file {:?} is read-only",
                self.path
            )));
        }
        write_at_all(&self.file, offset, data)?;
        self.dirty_bytes += data.len() as u64;
        Ok(data.len())
    }

    /// POSIX semantics: growing zero-fills, shrinking drops bytes.
    pub fn truncate(&mut self, size: u64) -> DfsResult<()> {
        if self.mode != StagingMode::ReadWrite {
            return Err(DfsError::Internal(format!(
                "staging file {:?} is read-only",
                self.path
            )));
        }
        self.file.set_len(size)?;
        Ok(())
    }

    /// Independent handle onto the same bytes, for uploading outside the
    /// inode lock.
    pub fn clone_for_read(&self) -> DfsResult<File> {
        Ok(self.file.try_clone()?)
    }

    pub fn clear_dirty(&mut self) {
        self.dirty_bytes = 0;
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        let _ = LockExt::unlock(&self.file);
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("cannot remove staging file {:?}: {}", self.path, err);
            }
        } else {
            debug!("removed staging file {:?}", self.path);
        }
    }
}
