use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{Body, Client, Response, StatusCode};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::io::{ReaderStream, StreamReader};
use url::Url;

use crate::{DfsError, DfsResult, DirEntry, DirListing, FileAttributes};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the in-process pipe between a writer and its upload request.
const UPLOAD_PIPE_CAPACITY: usize = 64 * 1024;

/// Low-level access to the remote filesystem. One implementation speaks the
/// real wire protocol; tests substitute an in-process one.
#[async_trait]
pub trait DfsConnector: Send + Sync {
    async fn stat(&self, path: &str) -> DfsResult<FileAttributes>;
    async fn list(&self, path: &str) -> DfsResult<DirListing>;
    async fn open_read(&self, path: &str) -> DfsResult<Box<dyn DfsFileReader>>;
    async fn create(
        &self,
        path: &str,
        mode: u16,
        overwrite: bool,
    ) -> DfsResult<Box<dyn DfsFileWriter>>;
    async fn remove(&self, path: &str) -> DfsResult<()>;
    async fn rename(&self, src: &str, dst: &str) -> DfsResult<()>;
    async fn mkdir(&self, path: &str, mode: u16) -> DfsResult<()>;
    async fn chmod(&self, path: &str, mode: u16) -> DfsResult<()>;
    async fn chown(&self, path: &str, owner: Option<&str>, group: Option<&str>) -> DfsResult<()>;
    async fn truncate(&self, path: &str, size: u64) -> DfsResult<()>;
    async fn set_times(&self, path: &str, mtime_ms: Option<u64>, atime_ms: Option<u64>)
        -> DfsResult<()>;
    /// Connects lazily if needed and probes the endpoint.
    async fn ensure_connected(&self) -> DfsResult<()>;
    /// Drops the connection state so the next call reconnects. Idempotent.
    async fn close(&self);
}

/// Seekable byte source for one remote file. Short reads are permitted;
/// end of file is `Ok(0)`, never an error.
#[async_trait]
pub trait DfsFileReader: Send {
    async fn seek(&mut self, pos: SeekFrom) -> DfsResult<u64>;
    async fn read(&mut self, buf: &mut [u8]) -> DfsResult<usize>;
}

/// Byte sink for one remote file. The file content becomes visible on a
/// successful `close`; `abort` tears the transfer down best-effort.
#[async_trait]
pub trait DfsFileWriter: Send {
    async fn write(&mut self, data: &[u8]) -> DfsResult<usize>;
    async fn close(&mut self) -> DfsResult<()>;
    async fn abort(&mut self);
}

#[derive(Debug, Clone)]
pub struct TlsBundle {
    pub root_ca: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WebHdfsConfig {
    /// `host:port` of the namenode HTTP endpoint.
    pub endpoint: String,
    pub user: String,
    pub tls: Option<TlsBundle>,
    pub timeout: Duration,
}

struct HttpState {
    /// Follows redirects; used for metadata calls and ranged reads.
    follow: Client,
    /// Redirects disabled; used for the create/append two-step dance.
    direct: Client,
    base: Url,
}

/// Namenode client over the WebHDFS REST surface. Connection state is built
/// lazily on first use and dropped by `close` to force a reconnect.
pub struct WebHdfsClient {
    config: WebHdfsConfig,
    state: tokio::sync::Mutex<Option<Arc<HttpState>>>,
}

#[derive(Deserialize)]
struct FileStatusReply {
    #[serde(rename = "FileStatus")]
    file_status: FileStatus,
}

#[derive(Deserialize)]
struct FileStatus {
    length: u64,
    #[serde(rename = "type")]
    kind: String,
    permission: String,
    owner: String,
    group: String,
    #[serde(rename = "modificationTime")]
    modification_time: u64,
    #[serde(rename = "pathSuffix", default)]
    path_suffix: String,
}

#[derive(Deserialize)]
struct ListStatusReply {
    #[serde(rename = "FileStatuses")]
    file_statuses: FileStatuses,
}

#[derive(Deserialize)]
struct FileStatuses {
    #[serde(rename = "FileStatus")]
    file_status: Vec<FileStatus>,
}

#[derive(Deserialize)]
struct BooleanReply {
    boolean: bool,
}

#[derive(Deserialize)]
struct RemoteExceptionReply {
    #[serde(rename = "RemoteException")]
    remote_exception: RemoteException,
}

#[derive(Deserialize)]
struct RemoteException {
    exception: String,
    #[serde(default)]
    message: String,
}

impl FileStatus {
    fn into_attrs(self) -> FileAttributes {
        FileAttributes {
            mode: u16::from_str_radix(&self.permission, 8).unwrap_or(0o644),
            owner: self.owner,
            group: self.group,
            size: self.length,
            mtime_ms: self.modification_time,
            is_dir: self.kind == "DIRECTORY",
        }
    }
}

fn op_url(state: &HttpState, user: &str, path: &str, op: &str) -> Url {
    let mut url = state.base.clone();
    url.set_path(&format!("/webhdfs/v1{}", path));
    url.query_pairs_mut()
        .append_pair("op", op)
        .append_pair("user.name", user);
    url
}

fn transport(what: &str, err: reqwest::Error) -> DfsError {
    DfsError::Transport(format!("{}: {}", what, err))
}

fn map_remote_error(status: StatusCode, body: &str, what: &str) -> DfsError {
    if let Ok(reply) = serde_json::from_str::<RemoteExceptionReply>(body) {
        let ex = reply.remote_exception;
        let detail = format!("{} ({}: {})", what, ex.exception, ex.message);
        return match ex.exception.as_str() {
            "FileNotFoundException" | "PathNotFoundException" => DfsError::NotFound(detail),
            "FileAlreadyExistsException" | "AlreadyBeingCreatedException" => {
                DfsError::AlreadyExists(detail)
            }
            "AccessControlException" | "SecurityException" => DfsError::PermissionDenied(detail),
            "StandbyException" | "SafeModeException" | "RetriableException" => {
                DfsError::RemoteUnavailable(detail)
            }
            "UnsupportedOperationException" => DfsError::Unsupported(detail),
            "IllegalArgumentException"
            | "InvalidPathException"
            | "PathIsNotEmptyDirectoryException" => DfsError::Invalid(detail),
            _ => DfsError::from_http_status(status, detail),
        };
    }
    DfsError::from_http_status(status, format!("{}: {}", what, body))
}

async fn check(resp: Response, what: &str) -> DfsResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(map_remote_error(status, &body, what))
}

impl WebHdfsClient {
    pub fn new(config: WebHdfsConfig) -> Self {
        Self {
            config,
            state: tokio::sync::Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn builder(&self) -> DfsResult<reqwest::ClientBuilder> {
        let mut builder = Client::builder().timeout(self.config.timeout);
        if let Some(tls) = &self.config.tls {
            let ca = std::fs::read(&tls.root_ca)?;
            let cert = reqwest::Certificate::from_pem(&ca)
                .map_err(|e| DfsError::Invalid(format!("root CA bundle: {}", e)))?;
            let mut pem = std::fs::read(&tls.client_cert)?;
            pem.extend(std::fs::read(&tls.client_key)?);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| DfsError::Invalid(format!("client certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert).identity(identity);
        }
        Ok(builder)
    }

    async fn state(&self) -> DfsResult<Arc<HttpState>> {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.as_ref() {
            return Ok(state.clone());
        }
        let scheme = if self.config.tls.is_some() {
            "https"
        } else {
            "http"
        };
        let base = Url::parse(&format!("{}://{}/", scheme, self.config.endpoint))
            .map_err(|e| DfsError::Invalid(format!("endpoint {}: {}", self.config.endpoint, e)))?;
        let follow = self
            .builder()?
            .build()
            .map_err(|e| DfsError::Internal(format!("http client: {}", e)))?;
        let direct = self
            .builder()?
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DfsError::Internal(format!("http client: {}", e)))?;
        debug!("connected to namenode {}", base);
        let state = Arc::new(HttpState {
            follow,
            direct,
            base,
        });
        *guard = Some(state.clone());
        Ok(state)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        op: &str,
    ) -> DfsResult<T> {
        let state = self.state().await?;
        let url = op_url(&state, &self.config.user, path, op);
        let what = format!("{} {}", op, path);
        let resp = state
            .follow
            .get(url)
            .send()
            .await
            .map_err(|e| transport(&what, e))?;
        let resp = check(resp, &what).await?;
        resp.json::<T>()
            .await
            .map_err(|e| DfsError::Transport(format!("{}: decode: {}", what, e)))
    }

    async fn mutate(&self, path: &str, op: &str, method: reqwest::Method, params: &[(&str, String)])
        -> DfsResult<Response> {
        let state = self.state().await?;
        let mut url = op_url(&state, &self.config.user, path, op);
        for (key, value) in params {
            url.query_pairs_mut().append_pair(key, value);
        }
        let what = format!("{} {}", op, path);
        let resp = state
            .follow
            .request(method, url)
            .send()
            .await
            .map_err(|e| transport(&what, e))?;
        check(resp, &what).await
    }

    async fn mutate_boolean(
        &self,
        path: &str,
        op: &str,
        method: reqwest::Method,
        params: &[(&str, String)],
    ) -> DfsResult<bool> {
        let resp = self.mutate(path, op, method, params).await?;
        let what = format!("{} {}", op, path);
        let reply: BooleanReply = resp
            .json()
            .await
            .map_err(|e| DfsError::Transport(format!("{}: decode: {}", what, e)))?;
        Ok(reply.boolean)
    }
}

#[async_trait]
impl DfsConnector for WebHdfsClient {
    async fn stat(&self, path: &str) -> DfsResult<FileAttributes> {
        let reply: FileStatusReply = self.get_json(path, "GETFILESTATUS").await?;
        Ok(reply.file_status.into_attrs())
    }

    async fn list(&self, path: &str) -> DfsResult<DirListing> {
        let reply: ListStatusReply = self.get_json(path, "LISTSTATUS").await?;
        let entries = reply
            .file_statuses
            .file_status
            .into_iter()
            .map(|status| DirEntry {
                name: status.path_suffix.clone(),
                attrs: status.into_attrs(),
            })
            .collect();
        Ok(DirListing::new(entries))
    }

    async fn open_read(&self, path: &str) -> DfsResult<Box<dyn DfsFileReader>> {
        let state = self.state().await?;
        Ok(Box::new(WebHdfsReader {
            state,
            user: self.config.user.clone(),
            path: path.to_string(),
            pos: 0,
            stream: None,
        }))
    }

    async fn create(
        &self,
        path: &str,
        mode: u16,
        overwrite: bool,
    ) -> DfsResult<Box<dyn DfsFileWriter>> {
        let state = self.state().await?;
        let mut url = op_url(&state, &self.config.user, path, "CREATE");
        url.query_pairs_mut()
            .append_pair("overwrite", if overwrite { "true" } else { "false" })
            .append_pair("permission", &format!("{:o}", mode & 0o7777));
        let what = format!("CREATE {}", path);

        // First leg: the namenode answers with the datanode location.
        let resp = state
            .direct
            .put(url)
            .body(Vec::new())
            .send()
            .await
            .map_err(|e| transport(&what, e))?;
        if !resp.status().is_redirection() {
            // A non-redirect response is either a remote error or a server
            // that does not honour the two-step contract.
            check(resp, &what).await?;
            return Err(DfsError::Transport(format!(
                "{}: namenode did not redirect to a datanode",
                what
            )));
        }
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or_else(|| {
                DfsError::Transport(format!("{}: redirect without a location", what))
            })?;

        // Second leg: stream the body to the datanode through a local pipe.
        let (pipe_rd, pipe_wr) = tokio::io::duplex(UPLOAD_PIPE_CAPACITY);
        let client = state.direct.clone();
        let task_what = what.clone();
        let task: JoinHandle<DfsResult<()>> = tokio::spawn(async move {
            let body = Body::wrap_stream(ReaderStream::new(pipe_rd));
            let resp = client
                .put(location)
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(body)
                .send()
                .await
                .map_err(|e| transport(&task_what, e))?;
            check(resp, &task_what).await?;
            Ok(())
        });
        debug!("{}: streaming to datanode", what);
        Ok(Box::new(WebHdfsWriter {
            what,
            pipe: Some(pipe_wr),
            task: Some(task),
            written: 0,
        }))
    }

    async fn remove(&self, path: &str) -> DfsResult<()> {
        let done = self
            .mutate_boolean(
                path,
                "DELETE",
                reqwest::Method::DELETE,
                &[("recursive", "false".to_string())],
            )
            .await?;
        if !done {
            return Err(DfsError::NotFound(format!("DELETE {}: no such path", path)));
        }
        Ok(())
    }

    async fn rename(&self, src: &str, dst: &str) -> DfsResult<()> {
        let done = self
            .mutate_boolean(
                src,
                "RENAME",
                reqwest::Method::PUT,
                &[("destination", dst.to_string())],
            )
            .await?;
        if done {
            return Ok(());
        }
        // The wire call reports plain failure; probe the destination to
        // classify it.
        if self.stat(dst).await.is_ok() {
            Err(DfsError::AlreadyExists(format!(
                "RENAME {} -> {}: destination exists",
                src, dst
            )))
        } else {
            Err(DfsError::NotFound(format!(
                "RENAME {} -> {}: source missing",
                src, dst
            )))
        }
    }

    async fn mkdir(&self, path: &str, mode: u16) -> DfsResult<()> {
        let done = self
            .mutate_boolean(
                path,
                "MKDIRS",
                reqwest::Method::PUT,
                &[("permission", format!("{:o}", mode & 0o7777))],
            )
            .await?;
        if !done {
            return Err(DfsError::Internal(format!("MKDIRS {}: refused", path)));
        }
        Ok(())
    }

    async fn chmod(&self, path: &str, mode: u16) -> DfsResult<()> {
        self.mutate(
            path,
            "SETPERMISSION",
            reqwest::Method::PUT,
            &[("permission", format!("{:o}", mode & 0o7777))],
        )
        .await?;
        Ok(())
    }

    async fn chown(&self, path: &str, owner: Option<&str>, group: Option<&str>) -> DfsResult<()> {
        let mut params = Vec::new();
        if let Some(owner) = owner {
            params.push(("owner", owner.to_string()));
        }
        if let Some(group) = group {
            params.push(("group", group.to_string()));
        }
        self.mutate(path, "SETOWNER", reqwest::Method::PUT, &params)
            .await?;
        Ok(())
    }

    async fn truncate(&self, path: &str, size: u64) -> DfsResult<()> {
        let done = self
            .mutate_boolean(
                path,
                "TRUNCATE",
                reqwest::Method::POST,
                &[("newlength", size.to_string())],
            )
            .await?;
        if !done {
            // The remote finishes the truncate asynchronously; readers observe
            // the final length once block recovery completes.
            info!("TRUNCATE {}: completing in background", path);
        }
        Ok(())
    }

    async fn set_times(
        &self,
        path: &str,
        mtime_ms: Option<u64>,
        atime_ms: Option<u64>,
    ) -> DfsResult<()> {
        let mut params = Vec::new();
        if let Some(mtime) = mtime_ms {
            params.push(("modificationtime", mtime.to_string()));
        }
        if let Some(atime) = atime_ms {
            params.push(("accesstime", atime.to_string()));
        }
        if params.is_empty() {
            return Ok(());
        }
        self.mutate(path, "SETTIMES", reqwest::Method::PUT, &params)
            .await?;
        Ok(())
    }

    async fn ensure_connected(&self) -> DfsResult<()> {
        self.stat("/").await.map(|_| ())
    }

    async fn close(&self) {
        let mut guard = self.state.lock().await;
        if guard.take().is_some() {
            debug!("dropped connection to {}", self.config.endpoint);
        }
    }
}

struct WebHdfsReader {
    state: Arc<HttpState>,
    user: String,
    path: String,
    pos: u64,
    stream: Option<Box<dyn AsyncRead + Send + Sync + Unpin>>,
}

impl WebHdfsReader {
    async fn open_at(&mut self, offset: u64) -> DfsResult<()> {
        let mut url = op_url(&self.state, &self.user, &self.path, "OPEN");
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string());
        let what = format!("OPEN {}", self.path);
        let resp = self
            .state
            .follow
            .get(url)
            .send()
            .await
            .map_err(|e| transport(&what, e))?;
        let resp = check(resp, &what).await?;
        let stream: std::pin::Pin<
            Box<dyn futures_util::Stream<Item = std::io::Result<bytes::Bytes>> + Send + Sync>,
        > = Box::pin(
            resp.bytes_stream()
                .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))),
        );
        self.stream = Some(Box::new(StreamReader::new(stream)));
        Ok(())
    }

    async fn remote_size(&self) -> DfsResult<u64> {
        let url = op_url(&self.state, &self.user, &self.path, "GETFILESTATUS");
        let what = format!("GETFILESTATUS {}", self.path);
        let resp = self
            .state
            .follow
            .get(url)
            .send()
            .await
            .map_err(|e| transport(&what, e))?;
        let resp = check(resp, &what).await?;
        let reply: FileStatusReply = resp
            .json()
            .await
            .map_err(|e| DfsError::Transport(format!("{}: decode: {}", what, e)))?;
        Ok(reply.file_status.length)
    }
}

#[async_trait]
impl DfsFileReader for WebHdfsReader {
    async fn seek(&mut self, pos: SeekFrom) -> DfsResult<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => {
                let base = self.pos as i64;
                let target = base.checked_add(delta).filter(|v| *v >= 0).ok_or_else(|| {
                    DfsError::Invalid(format!("seek out of range: {}{:+}", base, delta))
                })?;
                target as u64
            }
            SeekFrom::End(delta) => {
                let size = self.remote_size().await? as i64;
                let target = size.checked_add(delta).filter(|v| *v >= 0).ok_or_else(|| {
                    DfsError::Invalid(format!("seek out of range: {}{:+}", size, delta))
                })?;
                target as u64
            }
        };
        if target != self.pos {
            // The next read reopens the remote stream at the new offset.
            self.stream = None;
            self.pos = target;
        }
        Ok(self.pos)
    }

    async fn read(&mut self, buf: &mut [u8]) -> DfsResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.stream.is_none() {
            self.open_at(self.pos).await?;
        }
        let stream = self.stream.as_mut().expect("stream just opened");
        let read = stream
            .read(buf)
            .await
            .map_err(|e| DfsError::Transport(format!("read {}: {}", self.path, e)))?;
        self.pos += read as u64;
        Ok(read)
    }
}

struct WebHdfsWriter {
    what: String,
    pipe: Option<DuplexStream>,
    task: Option<JoinHandle<DfsResult<()>>>,
    written: u64,
}

impl WebHdfsWriter {
    async fn upload_result(&mut self) -> DfsResult<()> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| DfsError::Internal(format!("{}: upload task: {}", self.what, e)))?,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DfsFileWriter for WebHdfsWriter {
    async fn write(&mut self, data: &[u8]) -> DfsResult<usize> {
        let pipe = self
            .pipe
            .as_mut()
            .ok_or_else(|| DfsError::Invalid(format!("{}: write after close", self.what)))?;
        if let Err(err) = pipe.write_all(data).await {
            // The pipe breaks when the upload request dies; surface the real
            // cause when it is available.
            warn!("{}: pipe write failed: {}", self.what, err);
            self.pipe = None;
            self.upload_result().await?;
            return Err(DfsError::Transport(format!("{}: {}", self.what, err)));
        }
        self.written += data.len() as u64;
        Ok(data.len())
    }

    async fn close(&mut self) -> DfsResult<()> {
        if let Some(mut pipe) = self.pipe.take() {
            pipe.shutdown()
                .await
                .map_err(|e| DfsError::Transport(format!("{}: shutdown: {}", self.what, e)))?;
        }
        self.upload_result().await?;
        debug!("{}: uploaded {} bytes", self.what, self.written);
        Ok(())
    }

    async fn abort(&mut self) {
        self.pipe = None;
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}
