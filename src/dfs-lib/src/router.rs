use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use log::warn;

use crate::client::{DfsConnector, DfsFileReader, DfsFileWriter};
use crate::{DfsError, DfsResult, DirListing, FileAttributes};

/// Fans one namespace over several accessors. Selection is deterministic:
/// endpoints are tried in declared order and the first answer wins. The
/// router itself never retries — transient failures only advance it to the
/// next endpoint, and the accessors underneath already retried. Final errors
/// (not-found, permission, exists) are authoritative and returned at once.
pub struct AccessorRouter {
    accessors: Vec<Arc<dyn DfsConnector>>,
}

impl AccessorRouter {
    pub fn new(accessors: Vec<Arc<dyn DfsConnector>>) -> DfsResult<Self> {
        if accessors.is_empty() {
            return Err(DfsError::Invalid(
                "router needs at least one accessor".to_string(),
            ));
        }
        Ok(Self { accessors })
    }

    pub fn endpoints(&self) -> usize {
        self.accessors.len()
    }

    async fn run<'p, T, F>(&'p self, what: &str, mut call: F) -> DfsResult<T>
    where
        F: FnMut(&'p dyn DfsConnector) -> BoxFuture<'p, DfsResult<T>> + Send,
    {
        let mut last_err = None;
        for (index, accessor) in self.accessors.iter().enumerate() {
            match call(accessor.as_ref()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() => {
                    warn!("{}: endpoint {} unusable, failing over: {}", what, index, err);
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.expect("router has at least one accessor"))
    }
}

#[async_trait]
impl DfsConnector for AccessorRouter {
    async fn stat(&self, path: &str) -> DfsResult<FileAttributes> {
        self.run("stat", |a| a.stat(path).boxed()).await
    }

    async fn list(&self, path: &str) -> DfsResult<DirListing> {
        self.run("list", |a| a.list(path).boxed()).await
    }

    async fn open_read(&self, path: &str) -> DfsResult<Box<dyn DfsFileReader>> {
        self.run("open_read", |a| a.open_read(path).boxed()).await
    }

    async fn create(
        &self,
        path: &str,
        mode: u16,
        overwrite: bool,
    ) -> DfsResult<Box<dyn DfsFileWriter>> {
        self.run("create", |a| a.create(path, mode, overwrite).boxed())
            .await
    }

    async fn remove(&self, path: &str) -> DfsResult<()> {
        self.run("remove", |a| a.remove(path).boxed()).await
    }

    async fn rename(&self, src: &str, dst: &str) -> DfsResult<()> {
        self.run("rename", |a| a.rename(src, dst).boxed()).await
    }

    async fn mkdir(&self, path: &str, mode: u16) -> DfsResult<()> {
        self.run("mkdir", |a| a.mkdir(path, mode).boxed()).await
    }

    async fn chmod(&self, path: &str, mode: u16) -> DfsResult<()> {
        self.run("chmod", |a| a.chmod(path, mode).boxed()).await
    }

    async fn chown(&self, path: &str, owner: Option<&str>, group: Option<&str>) -> DfsResult<()> {
        self.run("chown", |a| a.chown(path, owner, group).boxed())
            .await
    }

    async fn truncate(&self, path: &str, size: u64) -> DfsResult<()> {
        self.run("truncate", |a| a.truncate(path, size).boxed())
            .await
    }

    async fn set_times(
        &self,
        path: &str,
        mtime_ms: Option<u64>,
        atime_ms: Option<u64>,
    ) -> DfsResult<()> {
        self.run("set_times", |a| a.set_times(path, mtime_ms, atime_ms).boxed())
            .await
    }

    async fn ensure_connected(&self) -> DfsResult<()> {
        self.run("ensure_connected", |a| a.ensure_connected().boxed())
            .await
    }

    async fn close(&self) {
        for accessor in &self.accessors {
            accessor.close().await;
        }
    }
}
