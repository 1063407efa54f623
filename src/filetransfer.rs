//! Streamed file transfer.
//!
//! Uploads and downloads move file data in chunks over ordinary method
//! calls against the `FileTransferService` binding. A transfer starts with
//! a manifest exchange (`BeginUpload`/`BeginDownload`), which is also where
//! resumption is decided: the server picks the file index and byte offset
//! to continue from. Chunks then stream with a sliding-window throttle on
//! the client side: once `effective_bps × window_s` bytes have gone out
//! inside one window the sender sleeps to the window edge, carrying any
//! overshoot into the next window. Disk I/O runs on the blocking pool so
//! reactor threads never wait on a file.

use crate::client::ClientStub;
use crate::error::{CallError, ErrorCode, RemoteException, RpcError, RpcResult};
use crate::server::ServerMethod;
use crate::session::SharedCallSession;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use uuid::Uuid;

pub const BEGIN_UPLOAD_METHOD_ID: u32 = 1;
pub const UPLOAD_CHUNKS_METHOD_ID: u32 = 2;
pub const BEGIN_DOWNLOAD_METHOD_ID: u32 = 3;
pub const DOWNLOAD_CHUNKS_METHOD_ID: u32 = 4;
pub const TRIM_DOWNLOAD_METHOD_ID: u32 = 5;

/// Chunks are capped at this share of the smaller side's max message
/// length, leaving room for headers.
const CHUNK_FRACTION: f64 = 0.8;

/// Remote-exception sub-codes raised by the service.
const EX_BAD_REQUEST: u32 = 1;
const EX_NOT_FOUND: u32 = 2;
const EX_IO: u32 = 3;

/// One entry of a transfer manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub is_directory: bool,
    /// Path relative to the transfer root.
    pub path: String,
    /// First byte of this file carried by the transfer (resume offset).
    pub start_pos: u64,
    pub size: u64,
    pub crc32: u32,
    /// Name to give the file at the destination; empty keeps `path`.
    pub rename_to: String,
    /// Seconds since the epoch.
    pub last_write_time: u64,
}

/// Ordered list of files in one transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    pub files: Vec<FileInfo>,
}

impl FileManifest {
    /// Enumerate local files into a manifest. Directories recurse;
    /// manifest paths are relative to each argument's parent.
    pub fn from_paths(paths: &[PathBuf]) -> RpcResult<Self> {
        let mut files = Vec::new();
        for path in paths {
            let base = path.parent().unwrap_or_else(|| Path::new(""));
            collect_files(base, path, &mut files)?;
        }
        Ok(Self { files })
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

fn collect_files(base: &Path, path: &Path, out: &mut Vec<FileInfo>) -> RpcResult<()> {
    let meta = std::fs::metadata(path)
        .map_err(|e| RpcError::with_what(ErrorCode::FileOpen, format!("{}: {e}", path.display())))?;
    let rel = path
        .strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned();
    if meta.is_dir() {
        out.push(FileInfo {
            is_directory: true,
            path: rel,
            start_pos: 0,
            size: 0,
            crc32: 0,
            rename_to: String::new(),
            last_write_time: system_time_secs(meta.modified().ok()),
        });
        let mut entries: Vec<_> = std::fs::read_dir(path)
            .map_err(|e| RpcError::with_what(ErrorCode::FileOpen, e.to_string()))?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .collect();
        entries.sort();
        for entry in entries {
            collect_files(base, &entry, out)?;
        }
    } else {
        out.push(FileInfo {
            is_directory: false,
            path: rel,
            start_pos: 0,
            size: meta.len(),
            crc32: file_crc32(path)?,
            rename_to: String::new(),
            last_write_time: system_time_secs(meta.modified().ok()),
        });
    }
    Ok(())
}

fn system_time_secs(t: Option<SystemTime>) -> u64 {
    t.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn file_crc32(path: &Path) -> RpcResult<u32> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| RpcError::with_what(ErrorCode::FileOpen, format!("{}: {e}", path.display())))?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| RpcError::with_what(ErrorCode::FileRead, e.to_string()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// A bytes-per-second budget shared among concurrent transfers.
///
/// With N participants on a quota Q, each is told to run at roughly Q/N.
#[derive(Debug)]
pub struct BandwidthQuota {
    quota_bps: Mutex<u32>,
    participants: Mutex<usize>,
}

impl BandwidthQuota {
    pub fn new(quota_bps: u32) -> Arc<Self> {
        Arc::new(Self {
            quota_bps: Mutex::new(quota_bps),
            participants: Mutex::new(0),
        })
    }

    pub fn set_quota(&self, bps: u32) {
        *self.quota_bps.lock() = bps;
    }

    pub fn quota(&self) -> u32 {
        *self.quota_bps.lock()
    }

    /// Per-participant speed limit; 0 means unlimited.
    pub fn line_speed_limit(&self) -> u32 {
        let quota = *self.quota_bps.lock();
        if quota == 0 {
            return 0;
        }
        let participants = (*self.participants.lock()).max(1);
        quota / participants as u32
    }

    fn join(&self) {
        *self.participants.lock() += 1;
    }

    fn leave(&self) {
        let mut participants = self.participants.lock();
        *participants = participants.saturating_sub(1);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunk {
    pub file_index: u32,
    pub offset: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginUploadParams {
    pub manifest: FileManifest,
    pub initial_chunks: Vec<FileChunk>,
    /// Empty for a fresh upload; a previous upload id to resume.
    pub upload_id: String,
    pub client_bps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginUploadResult {
    pub upload_id: String,
    /// Where the client should continue from.
    pub file_index: u32,
    pub offset: u64,
    /// Server-imposed cap, 0 for unlimited.
    pub server_bps: u32,
    pub max_message_len: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunksParams {
    pub upload_id: String,
    pub chunks: Vec<FileChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunksResult {
    pub server_bps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginDownloadParams {
    /// Path under the service's download root.
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginDownloadResult {
    pub download_id: String,
    pub manifest: FileManifest,
    pub server_bps: u32,
    pub max_message_len: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadChunksParams {
    pub download_id: String,
    pub max_bytes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadChunksResult {
    pub chunks: Vec<FileChunk>,
    pub server_bps: u32,
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrimDownloadParams {
    pub download_id: String,
    pub file_index: u32,
    pub offset: u64,
}

/// Server-side service options.
#[derive(Clone)]
pub struct FileTransferOptions {
    /// Uploads land under this directory.
    pub upload_dir: PathBuf,
    /// Downloads are served from under this directory.
    pub download_dir: PathBuf,
    /// Flat server-side cap, bytes/sec; 0 is unlimited. Superseded by
    /// `quota` when present.
    pub server_bps: u32,
    pub quota: Option<Arc<BandwidthQuota>>,
}

struct UploadState {
    manifest: FileManifest,
    file_index: u32,
    offset: u64,
    quota: Option<Arc<BandwidthQuota>>,
}

impl Drop for UploadState {
    fn drop(&mut self) {
        if let Some(quota) = &self.quota {
            quota.leave();
        }
    }
}

struct DownloadState {
    manifest: FileManifest,
    root: PathBuf,
    file_index: u32,
    offset: u64,
    quota: Option<Arc<BandwidthQuota>>,
}

impl Drop for DownloadState {
    fn drop(&mut self) {
        if let Some(quota) = &self.quota {
            quota.leave();
        }
    }
}

/// The server half of file transfer, bound like any other service.
pub struct FileTransferService {
    opts: FileTransferOptions,
    uploads: Mutex<HashMap<String, UploadState>>,
    downloads: Mutex<HashMap<String, DownloadState>>,
}

impl FileTransferService {
    pub fn new(opts: FileTransferOptions) -> Arc<Self> {
        Arc::new(Self {
            opts,
            uploads: Mutex::new(HashMap::new()),
            downloads: Mutex::new(HashMap::new()),
        })
    }

    fn current_bps(&self) -> u32 {
        match &self.opts.quota {
            Some(quota) => quota.line_speed_limit(),
            None => self.opts.server_bps,
        }
    }

    async fn begin_upload(&self, params: BeginUploadParams) -> Result<Vec<u8>, RemoteException> {
        let (upload_id, file_index, offset) = {
            let mut uploads = self.uploads.lock();
            if !params.upload_id.is_empty() {
                match uploads.get(&params.upload_id) {
                    // Resume: continue where the previous attempt stopped.
                    Some(state) if state.manifest == params.manifest => {
                        (params.upload_id.clone(), state.file_index, state.offset)
                    }
                    Some(_) => {
                        return Err(RemoteException::new(
                            EX_BAD_REQUEST,
                            "resume manifest does not match original upload",
                        ))
                    }
                    None => {
                        return Err(RemoteException::new(EX_NOT_FOUND, "unknown upload id"))
                    }
                }
            } else {
                let id = Uuid::new_v4().to_string();
                if let Some(quota) = &self.opts.quota {
                    quota.join();
                }
                uploads.insert(
                    id.clone(),
                    UploadState {
                        manifest: params.manifest.clone(),
                        file_index: 0,
                        offset: 0,
                        quota: self.opts.quota.clone(),
                    },
                );
                info!(upload_id = %id, files = params.manifest.files.len(),
                      bytes = params.manifest.total_size(), "upload started");
                (id, 0, 0)
            }
        };

        if !params.initial_chunks.is_empty() {
            self.write_chunks(&upload_id, params.initial_chunks).await?;
        }
        let result = BeginUploadResult {
            upload_id,
            file_index,
            offset,
            server_bps: self.current_bps(),
            max_message_len: crate::defaults::MAX_MESSAGE_LENGTH,
        };
        bincode::serialize(&result).map_err(internal)
    }

    async fn write_chunks(
        &self,
        upload_id: &str,
        chunks: Vec<FileChunk>,
    ) -> Result<(), RemoteException> {
        for chunk in chunks {
            let (rel_path, expected_index, expected_offset, size) = {
                let uploads = self.uploads.lock();
                let state = uploads
                    .get(upload_id)
                    .ok_or_else(|| RemoteException::new(EX_NOT_FOUND, "unknown upload id"))?;
                let info = state
                    .manifest
                    .files
                    .get(chunk.file_index as usize)
                    .ok_or_else(|| RemoteException::new(EX_BAD_REQUEST, "bad file index"))?;
                (
                    effective_name(info),
                    state.file_index,
                    state.offset,
                    info.size,
                )
            };
            if chunk.file_index != expected_index || chunk.offset != expected_offset {
                return Err(RemoteException::new(
                    EX_BAD_REQUEST,
                    format!(
                        "out-of-order chunk: got {}:{}, expected {}:{}",
                        chunk.file_index, chunk.offset, expected_index, expected_offset
                    ),
                ));
            }

            let path = self.opts.upload_dir.join(&rel_path);
            let offset = chunk.offset;
            let data = chunk.data;
            let written = data.len() as u64;
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(&path)?;
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(&data)?;
                Ok(())
            })
            .await
            .map_err(|e| RemoteException::new(EX_IO, e.to_string()))?
            .map_err(|e| RemoteException::new(EX_IO, e.to_string()))?;

            let mut uploads = self.uploads.lock();
            if let Some(state) = uploads.get_mut(upload_id) {
                state.offset += written;
                if state.offset >= size {
                    debug!(upload_id, file = %rel_path.display(), "file complete");
                    state.file_index += 1;
                    state.offset = 0;
                    // Skip over directory entries.
                    while let Some(info) =
                        state.manifest.files.get(state.file_index as usize)
                    {
                        if info.is_directory {
                            state.file_index += 1;
                        } else {
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn upload_chunks(&self, params: UploadChunksParams) -> Result<Vec<u8>, RemoteException> {
        self.write_chunks(&params.upload_id, params.chunks).await?;
        let result = UploadChunksResult {
            server_bps: self.current_bps(),
        };
        bincode::serialize(&result).map_err(internal)
    }

    async fn begin_download(
        &self,
        params: BeginDownloadParams,
    ) -> Result<Vec<u8>, RemoteException> {
        if params.source.contains("..") {
            return Err(RemoteException::new(EX_BAD_REQUEST, "path escapes root"));
        }
        let source = self.opts.download_dir.join(&params.source);
        // Manifest paths are relative to the source's parent; chunk reads
        // resolve against the same base.
        let root = source
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.opts.download_dir.clone());
        let manifest = tokio::task::spawn_blocking(move || {
            FileManifest::from_paths(std::slice::from_ref(&source))
        })
        .await
        .map_err(|e| RemoteException::new(EX_IO, e.to_string()))?
        .map_err(|e| RemoteException::new(EX_NOT_FOUND, e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        if let Some(quota) = &self.opts.quota {
            quota.join();
        }
        self.downloads.lock().insert(
            id.clone(),
            DownloadState {
                manifest: manifest.clone(),
                root,
                file_index: 0,
                offset: 0,
                quota: self.opts.quota.clone(),
            },
        );
        info!(download_id = %id, files = manifest.files.len(), "download started");
        let result = BeginDownloadResult {
            download_id: id,
            manifest,
            server_bps: self.current_bps(),
            max_message_len: crate::defaults::MAX_MESSAGE_LENGTH,
        };
        bincode::serialize(&result).map_err(internal)
    }

    async fn download_chunks(
        &self,
        params: DownloadChunksParams,
    ) -> Result<Vec<u8>, RemoteException> {
        let (rel_path, file_index, offset, file_size, root, exhausted) = {
            let mut downloads = self.downloads.lock();
            let state = downloads
                .get_mut(&params.download_id)
                .ok_or_else(|| RemoteException::new(EX_NOT_FOUND, "unknown download id"))?;
            // Skip directory entries.
            while let Some(info) = state.manifest.files.get(state.file_index as usize) {
                if info.is_directory {
                    state.file_index += 1;
                    state.offset = 0;
                } else {
                    break;
                }
            }
            match state.manifest.files.get(state.file_index as usize) {
                Some(info) => (
                    PathBuf::from(&info.path),
                    state.file_index,
                    state.offset,
                    info.size,
                    state.root.clone(),
                    false,
                ),
                None => (PathBuf::new(), 0, 0, 0, state.root.clone(), true),
            }
        };

        if exhausted {
            let result = DownloadChunksResult {
                chunks: Vec::new(),
                server_bps: self.current_bps(),
                complete: true,
            };
            return bincode::serialize(&result).map_err(internal);
        }

        let to_read = params
            .max_bytes
            .min((file_size - offset).min(u64::from(u32::MAX)) as u32)
            as usize;
        // The served tree is flat under root; manifest paths are relative
        // to the requested source's parent.
        let path = root.join(&rel_path);
        let data = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut file = std::fs::File::open(&path)?;
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; to_read];
            let mut read = 0;
            while read < to_read {
                let n = file.read(&mut buf[read..])?;
                if n == 0 {
                    break;
                }
                read += n;
            }
            buf.truncate(read);
            Ok(buf)
        })
        .await
        .map_err(|e| RemoteException::new(EX_IO, e.to_string()))?
        .map_err(|e| RemoteException::new(EX_IO, e.to_string()))?;

        let advanced = offset + data.len() as u64;
        let mut complete = false;
        {
            let mut downloads = self.downloads.lock();
            if let Some(state) = downloads.get_mut(&params.download_id) {
                if advanced >= file_size {
                    state.file_index += 1;
                    state.offset = 0;
                    complete = state.manifest.files[state.file_index as usize..]
                        .iter()
                        .all(|f| f.is_directory);
                } else {
                    state.offset = advanced;
                }
            }
        }
        let result = DownloadChunksResult {
            chunks: vec![FileChunk {
                file_index,
                offset,
                data,
            }],
            server_bps: self.current_bps(),
            complete,
        };
        bincode::serialize(&result).map_err(internal)
    }

    async fn trim_download(&self, params: TrimDownloadParams) -> Result<Vec<u8>, RemoteException> {
        let mut downloads = self.downloads.lock();
        let state = downloads
            .get_mut(&params.download_id)
            .ok_or_else(|| RemoteException::new(EX_NOT_FOUND, "unknown download id"))?;
        if params.file_index as usize > state.manifest.files.len() {
            return Err(RemoteException::new(EX_BAD_REQUEST, "bad file index"));
        }
        state.file_index = params.file_index;
        state.offset = params.offset;
        debug!(download_id = %params.download_id, file_index = params.file_index,
               offset = params.offset, "download trimmed for resume");
        bincode::serialize(&()).map_err(internal)
    }
}

fn internal(e: impl std::fmt::Display) -> RemoteException {
    RemoteException::new(EX_IO, e.to_string())
}

fn effective_name(info: &FileInfo) -> PathBuf {
    if info.rename_to.is_empty() {
        PathBuf::from(&info.path)
    } else {
        PathBuf::from(&info.rename_to)
    }
}

#[async_trait]
impl ServerMethod for Arc<FileTransferService> {
    async fn invoke(
        &self,
        _session: SharedCallSession,
        method_id: u32,
        params: Vec<u8>,
    ) -> Result<Vec<u8>, RemoteException> {
        let bad =
            |e: bincode::Error| RemoteException::new(EX_BAD_REQUEST, e.to_string());
        match method_id {
            BEGIN_UPLOAD_METHOD_ID => {
                self.begin_upload(bincode::deserialize(&params).map_err(bad)?)
                    .await
            }
            UPLOAD_CHUNKS_METHOD_ID => {
                self.upload_chunks(bincode::deserialize(&params).map_err(bad)?)
                    .await
            }
            BEGIN_DOWNLOAD_METHOD_ID => {
                self.begin_download(bincode::deserialize(&params).map_err(bad)?)
                    .await
            }
            DOWNLOAD_CHUNKS_METHOD_ID => {
                self.download_chunks(bincode::deserialize(&params).map_err(bad)?)
                    .await
            }
            TRIM_DOWNLOAD_METHOD_ID => {
                self.trim_download(bincode::deserialize(&params).map_err(bad)?)
                    .await
            }
            other => Err(RemoteException::new(
                EX_BAD_REQUEST,
                format!("unknown method {other}"),
            )),
        }
    }
}

/// Progress report passed to the user callback after every chunk.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub bytes_total: u64,
    pub bytes_so_far: u64,
    pub server_bps: u32,
    pub download_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferAction {
    Continue,
    Cancel,
}

pub type ProgressCallback = dyn Fn(&TransferProgress) -> TransferAction + Send + Sync;

/// Sliding-window throttle state.
struct TransferWindow {
    window: Duration,
    started: Instant,
    bytes: u64,
}

impl TransferWindow {
    fn new(window_s: u32) -> Self {
        Self {
            window: Duration::from_secs(u64::from(window_s.max(1))),
            started: Instant::now(),
            bytes: 0,
        }
    }

    fn budget(&self, effective_bps: u32) -> u64 {
        u64::from(effective_bps) * self.window.as_secs()
    }

    /// Largest transfer the current window admits; caps the next chunk.
    fn chunk_cap(&self, effective_bps: u32, chunk_size: usize) -> usize {
        if effective_bps == 0 {
            return chunk_size;
        }
        (self.budget(effective_bps).min(chunk_size as u64) as usize).max(1)
    }

    /// Block until the window admits more bytes. Once the budget for the
    /// current window is spent the sender sleeps to the window edge;
    /// overshoot carries into the next window as a negative balance.
    async fn acquire(&mut self, effective_bps: u32) {
        if effective_bps == 0 {
            return;
        }
        let budget = self.budget(effective_bps);
        while self.bytes >= budget {
            let elapsed = self.started.elapsed();
            if elapsed < self.window {
                debug!(
                    window_bytes = self.bytes,
                    budget, "transfer window exhausted, sleeping"
                );
                tokio::time::sleep(self.window - elapsed).await;
            }
            self.started = Instant::now();
            self.bytes -= budget;
        }
    }

    fn record(&mut self, sent: u64) {
        self.bytes += sent;
    }
}

/// Effective rate when both sides impose a cap; 0 means unlimited.
fn effective_bps(client_bps: u32, server_bps: u32) -> u32 {
    match (client_bps, server_bps) {
        (0, s) => s,
        (c, 0) => c,
        (c, s) => c.min(s),
    }
}

fn chunk_len(client_max: u32, server_max: u32) -> usize {
    (f64::from(client_max.min(server_max)) * CHUNK_FRACTION) as usize
}

fn map_call_error(e: CallError) -> RpcError {
    match e {
        CallError::Rpc(e) => e,
        CallError::Remote(e) => RpcError::with_what(ErrorCode::FileTransferNotFound, e.message),
    }
}

/// Upload local files to the server the stub points at.
///
/// Returns the upload id, which a later call may pass in `resume_id` to
/// continue a half-finished transfer.
pub async fn upload_files(
    stub: &mut ClientStub,
    paths: &[PathBuf],
    resume_id: Option<String>,
    progress: Option<&ProgressCallback>,
) -> RpcResult<String> {
    let manifest = FileManifest::from_paths(paths)?;
    let bytes_total = manifest.total_size();
    let client_bps = stub.options().transfer_bps;
    let window_s = stub.options().transfer_window_s;

    let begin: BeginUploadResult = stub
        .call(
            crate::defaults::FILE_TRANSFER_SERVICE,
            BEGIN_UPLOAD_METHOD_ID,
            &BeginUploadParams {
                manifest: manifest.clone(),
                initial_chunks: Vec::new(),
                upload_id: resume_id.unwrap_or_default(),
                client_bps,
            },
        )
        .await
        .map_err(map_call_error)?;

    let mut server_bps = begin.server_bps;
    let chunk_size = chunk_len(stub.options().max_outgoing, begin.max_message_len).max(1);
    let mut window = TransferWindow::new(window_s);

    // Base directory resolution mirrors manifest construction.
    let bases: Vec<PathBuf> = paths
        .iter()
        .map(|p| p.parent().unwrap_or_else(|| Path::new("")).to_path_buf())
        .collect();
    let resolve = |rel: &str| -> PathBuf {
        for base in &bases {
            let candidate = base.join(rel);
            if candidate.exists() {
                return candidate;
            }
        }
        PathBuf::from(rel)
    };

    let mut bytes_so_far: u64 = 0;
    // Account for a resumed prefix.
    for info in manifest.files.iter().take(begin.file_index as usize) {
        bytes_so_far += info.size;
    }
    bytes_so_far += begin.offset;

    let mut file_index = begin.file_index;
    let mut offset = begin.offset;
    while (file_index as usize) < manifest.files.len() {
        let info = &manifest.files[file_index as usize];
        if info.is_directory {
            file_index += 1;
            offset = 0;
            continue;
        }
        let path = resolve(&info.path);
        // One outstanding read overlaps the previous network write.
        let cap = window.chunk_cap(effective_bps(client_bps, server_bps), chunk_size);
        let mut pending: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>> =
            Some(read_chunk_task(path.clone(), offset, cap));
        while offset < info.size {
            window
                .acquire(effective_bps(client_bps, server_bps))
                .await;
            let data = pending
                .take()
                .expect("chunk read scheduled")
                .await
                .map_err(|e| RpcError::with_what(ErrorCode::FileRead, e.to_string()))?
                .map_err(|e| RpcError::with_what(ErrorCode::FileRead, e.to_string()))?;
            if data.is_empty() {
                return Err(RpcError::with_what(
                    ErrorCode::FileRead,
                    format!("{} truncated during upload", path.display()),
                ));
            }
            let next_offset = offset + data.len() as u64;
            if next_offset < info.size {
                let cap = window.chunk_cap(effective_bps(client_bps, server_bps), chunk_size);
                pending = Some(read_chunk_task(path.clone(), next_offset, cap));
            }

            let sent = data.len() as u64;
            let result: UploadChunksResult = stub
                .call(
                    crate::defaults::FILE_TRANSFER_SERVICE,
                    UPLOAD_CHUNKS_METHOD_ID,
                    &UploadChunksParams {
                        upload_id: begin.upload_id.clone(),
                        chunks: vec![FileChunk {
                            file_index,
                            offset,
                            data,
                        }],
                    },
                )
                .await
                .map_err(map_call_error)?;
            server_bps = result.server_bps;
            offset = next_offset;
            bytes_so_far += sent;
            window.record(sent);

            if let Some(progress) = progress {
                let report = TransferProgress {
                    bytes_total,
                    bytes_so_far,
                    server_bps,
                    download_path: None,
                };
                if progress(&report) == TransferAction::Cancel {
                    return Err(RpcError::new(ErrorCode::ClientCancel));
                }
            }
        }
        file_index += 1;
        offset = 0;
    }
    info!(upload_id = %begin.upload_id, bytes = bytes_so_far, "upload complete");
    Ok(begin.upload_id)
}

fn read_chunk_task(
    path: PathBuf,
    offset: u64,
    chunk_size: usize,
) -> tokio::task::JoinHandle<std::io::Result<Vec<u8>>> {
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; chunk_size];
        let mut read = 0;
        while read < chunk_size {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        Ok(buf)
    })
}

/// Download `source` (a path under the server's download root) into
/// `dest_dir`. Partially present files are resumed via `TrimDownload`.
pub async fn download_files(
    stub: &mut ClientStub,
    source: &str,
    dest_dir: &Path,
    progress: Option<&ProgressCallback>,
) -> RpcResult<FileManifest> {
    let client_bps = stub.options().transfer_bps;
    let window_s = stub.options().transfer_window_s;
    let begin: BeginDownloadResult = stub
        .call(
            crate::defaults::FILE_TRANSFER_SERVICE,
            BEGIN_DOWNLOAD_METHOD_ID,
            &BeginDownloadParams {
                source: source.to_owned(),
            },
        )
        .await
        .map_err(map_call_error)?;

    let manifest = begin.manifest.clone();
    let bytes_total = manifest.total_size();
    let mut server_bps = begin.server_bps;
    let chunk_size = chunk_len(stub.options().max_incoming, begin.max_message_len).max(1) as u32;
    let mut window = TransferWindow::new(window_s);
    let mut bytes_so_far: u64 = 0;

    // Resume: find the first incomplete destination file and trim the
    // server cursor to it.
    let mut resume_index = 0u32;
    let mut resume_offset = 0u64;
    for (i, info) in manifest.files.iter().enumerate() {
        if info.is_directory {
            resume_index = i as u32 + 1;
            continue;
        }
        let existing = std::fs::metadata(dest_dir.join(effective_name(info)))
            .map(|m| m.len())
            .unwrap_or(0);
        if existing >= info.size {
            resume_index = i as u32 + 1;
            bytes_so_far += info.size;
        } else {
            resume_index = i as u32;
            resume_offset = existing;
            bytes_so_far += existing;
            break;
        }
    }
    if resume_index > 0 || resume_offset > 0 {
        let () = stub
            .call(
                crate::defaults::FILE_TRANSFER_SERVICE,
                TRIM_DOWNLOAD_METHOD_ID,
                &TrimDownloadParams {
                    download_id: begin.download_id.clone(),
                    file_index: resume_index,
                    offset: resume_offset,
                },
            )
            .await
            .map_err(map_call_error)?;
    }

    loop {
        if (resume_index as usize) >= manifest.files.len() {
            break;
        }
        window
            .acquire(effective_bps(client_bps, server_bps))
            .await;
        let max_bytes = window.chunk_cap(effective_bps(client_bps, server_bps), chunk_size as usize)
            as u32;
        let result: DownloadChunksResult = stub
            .call(
                crate::defaults::FILE_TRANSFER_SERVICE,
                DOWNLOAD_CHUNKS_METHOD_ID,
                &DownloadChunksParams {
                    download_id: begin.download_id.clone(),
                    max_bytes,
                },
            )
            .await
            .map_err(map_call_error)?;
        server_bps = result.server_bps;

        let mut received = 0u64;
        for chunk in result.chunks {
            let info = manifest
                .files
                .get(chunk.file_index as usize)
                .ok_or_else(|| RpcError::new(ErrorCode::FileTransferNotFound))?;
            let path = dest_dir.join(effective_name(info));
            let chunk_bytes = chunk.data.len() as u64;
            received += chunk_bytes;
            let data = chunk.data;
            let offset = chunk.offset;
            let write_path = path.clone();
            let completes_file = offset + chunk_bytes >= info.size;
            let last_write_time = info.last_write_time;
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                if let Some(parent) = write_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(&write_path)?;
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(&data)?;
                if completes_file && last_write_time > 0 {
                    // Completed files take their timestamp from the
                    // manifest.
                    let mtime = UNIX_EPOCH + Duration::from_secs(last_write_time);
                    file.set_modified(mtime)?;
                }
                Ok(())
            })
            .await
            .map_err(|e| RpcError::with_what(ErrorCode::FileWrite, e.to_string()))?
            .map_err(|e| RpcError::with_what(ErrorCode::FileWrite, e.to_string()))?;

            bytes_so_far += chunk_bytes;
            if let Some(progress) = progress {
                let report = TransferProgress {
                    bytes_total,
                    bytes_so_far,
                    server_bps,
                    download_path: Some(path),
                };
                if progress(&report) == TransferAction::Cancel {
                    return Err(RpcError::new(ErrorCode::ClientCancel));
                }
            }
        }
        window.record(received);
        if result.complete {
            break;
        }
    }
    info!(download_id = %begin.download_id, bytes = bytes_so_far, "download complete");
    Ok(manifest)
}
