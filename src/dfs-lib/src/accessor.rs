use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;

use crate::client::{DfsConnector, DfsFileReader, DfsFileWriter};
use crate::retry::{RetryPolicy, WallClock};
use crate::{DfsResult, DirListing, FileAttributes};

/// Decorates a connector with the retry policy: every operation runs under
/// its own [`crate::RetryOp`], and each retry first closes the underlying
/// connection to force a reconnect. Errors that survive the policy are
/// surfaced unchanged.
pub struct FaultTolerantAccessor {
    inner: Arc<dyn DfsConnector>,
    policy: RetryPolicy,
    clock: Arc<dyn WallClock>,
}

impl FaultTolerantAccessor {
    pub fn new(
        inner: Arc<dyn DfsConnector>,
        policy: RetryPolicy,
        clock: Arc<dyn WallClock>,
    ) -> Self {
        Self {
            inner,
            policy,
            clock,
        }
    }

    async fn run<T, F, Fut>(&self, what: &str, mut call: F) -> DfsResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = DfsResult<T>> + Send,
    {
        let mut op = self.policy.start_operation(self.clock.as_ref());
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !op.should_retry(&err) {
                        return Err(err);
                    }
                    warn!(
                        "{} failed on attempt {}, reconnecting: {}",
                        what,
                        op.attempt() + 1,
                        err
                    );
                    self.inner.close().await;
                    op.backoff(self.clock.as_ref()).await;
                }
            }
        }
    }
}

#[async_trait]
impl DfsConnector for FaultTolerantAccessor {
    async fn stat(&self, path: &str) -> DfsResult<FileAttributes> {
        self.run("stat", || self.inner.stat(path)).await
    }

    async fn list(&self, path: &str) -> DfsResult<DirListing> {
        self.run("list", || self.inner.list(path)).await
    }

    async fn open_read(&self, path: &str) -> DfsResult<Box<dyn DfsFileReader>> {
        self.run("open_read", || self.inner.open_read(path)).await
    }

    async fn create(
        &self,
        path: &str,
        mode: u16,
        overwrite: bool,
    ) -> DfsResult<Box<dyn DfsFileWriter>> {
        self.run("create", || self.inner.create(path, mode, overwrite))
            .await
    }

    async fn remove(&self, path: &str) -> DfsResult<()> {
        self.run("remove", || self.inner.remove(path)).await
    }

    async fn rename(&self, src: &str, dst: &str) -> DfsResult<()> {
        self.run("rename", || self.inner.rename(src, dst)).await
    }

    async fn mkdir(&self, path: &str, mode: u16) -> DfsResult<()> {
        self.run("mkdir", || self.inner.mkdir(path, mode)).await
    }

    async fn chmod(&self, path: &str, mode: u16) -> DfsResult<()> {
        self.run("chmod", || self.inner.chmod(path, mode)).await
    }

    async fn chown(&self, path: &str, owner: Option<&str>, group: Option<&str>) -> DfsResult<()> {
        self.run("chown", || self.inner.chown(path, owner, group))
            .await
    }

    async fn truncate(&self, path: &str, size: u64) -> DfsResult<()> {
        self.run("truncate", || self.inner.truncate(path, size))
            .await
    }

    async fn set_times(
        &self,
        path: &str,
        mtime_ms: Option<u64>,
        atime_ms: Option<u64>,
    ) -> DfsResult<()> {
        self.run("set_times", || self.inner.set_times(path, mtime_ms, atime_ms))
            .await
    }

    async fn ensure_connected(&self) -> DfsResult<()> {
        self.run("ensure_connected", || self.inner.ensure_connected())
            .await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemDfs;
    use crate::retry::FakeClock;
    use crate::DfsError;
    use std::time::Duration;

    fn accessor(mem: &MemDfs, max_attempts: u32) -> (FaultTolerantAccessor, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new());
        let policy = RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
        };
        (
            FaultTolerantAccessor::new(Arc::new(mem.clone()), policy, clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn test_retries_transient_errors_until_success() {
        let mem = MemDfs::new();
        mem.insert_file("/f", b"data");
        mem.inject_fault(DfsError::Transport("reset".to_string()));
        mem.inject_fault(DfsError::RemoteUnavailable("standby".to_string()));

        let (accessor, clock) = accessor(&mem, 10);
        let attrs = accessor.stat("/f").await.expect("stat succeeds");
        assert_eq!(attrs.size, 4);
        // Two failures, two backoffs, two forced reconnects.
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(50), Duration::from_millis(100)]
        );
        assert_eq!(mem.close_count(), 2);
    }

    #[tokio::test]
    async fn test_non_retriable_error_surfaces_unchanged() {
        let mem = MemDfs::new();
        let (accessor, clock) = accessor(&mem, 10);
        let err = accessor.stat("/missing").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(clock.sleeps().is_empty());
        assert_eq!(mem.close_count(), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_error() {
        let mem = MemDfs::new();
        mem.insert_file("/f", b"data");
        for _ in 0..5 {
            mem.inject_fault(DfsError::Transport("reset".to_string()));
        }
        let (accessor, clock) = accessor(&mem, 2);
        let err = accessor.stat("/f").await.unwrap_err();
        assert!(matches!(err, DfsError::Transport(_)));
        // max_attempts=2 allows exactly one backoff.
        assert_eq!(clock.sleeps().len(), 1);
    }

    #[tokio::test]
    async fn test_pinned_single_attempt_fails_fast() {
        let mem = MemDfs::new();
        mem.insert_file("/f", b"data");
        mem.inject_fault(DfsError::Transport("reset".to_string()));
        let (accessor, clock) = accessor(&mem, 1);
        assert!(accessor.stat("/f").await.is_err());
        assert!(clock.sleeps().is_empty());
    }
}
