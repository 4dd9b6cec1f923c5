//! Transfer sources: where a queued item's bytes come from.
//!
//! A [`TransferSource`] opens a [`SourceRef`] at a byte offset and hands back
//! a [`ChunkStream`] the worker pulls fixed-size chunks from. Two sources ship
//! with the crate: [`HttpSource`] for `http(s)` references and [`FileSource`]
//! for files already on disk (for example, a messaging client's cache). A
//! messaging transport plugs its own source in for opaque file ids.
//!
//! [`SourceRouter`] tries registered sources in registration order.

use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use reqwest::header::{CONTENT_RANGE, RANGE};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, instrument};
use url::Url;

use super::TransferError;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Reference to the bytes of an inbound file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SourceRef {
    /// An `http` or `https` URL.
    Remote(Url),
    /// A file on the local filesystem.
    Local(PathBuf),
    /// A transport-specific identifier (e.g. a messaging file id).
    Opaque(String),
}

impl SourceRef {
    /// Interprets user or transport input as a source reference.
    ///
    /// `http(s)://` and `file://` URLs map to [`SourceRef::Remote`] and
    /// [`SourceRef::Local`]; anything containing a path separator is treated
    /// as a local path; everything else is opaque.
    #[must_use]
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        if let Ok(url) = Url::parse(trimmed) {
            match url.scheme() {
                "http" | "https" => return Self::Remote(url),
                "file" => {
                    if let Ok(path) = url.to_file_path() {
                        return Self::Local(path);
                    }
                }
                _ => {}
            }
        }
        if trimmed.contains('/') || trimmed.contains('\\') {
            return Self::Local(PathBuf::from(trimmed));
        }
        Self::Opaque(trimmed.to_string())
    }

    /// Best-effort filename hint (last URL segment or path file name).
    #[must_use]
    pub fn filename_hint(&self) -> Option<String> {
        match self {
            Self::Remote(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|segment| !segment.is_empty())
                .map(ToString::to_string),
            Self::Local(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            Self::Opaque(_) => None,
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(url) => write!(f, "{url}"),
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Opaque(id) => write!(f, "{id}"),
        }
    }
}

/// An open transfer, yielding the file's bytes chunk by chunk.
#[async_trait]
pub trait ChunkStream: Send {
    /// Total size of the file when the source knows it.
    fn total_len(&self) -> Option<u64>;

    /// Offset this stream starts at. Zero when a resume request was refused.
    fn start_offset(&self) -> u64;

    /// Returns the next chunk of at most `max_len` bytes, or `None` at end of stream.
    async fn next_chunk(&mut self, max_len: usize) -> Result<Option<Bytes>, TransferError>;
}

/// Opens source references for transfer.
///
/// # Object Safety
///
/// This trait uses `async_trait` so sources can be registered as
/// `Box<dyn TransferSource>` in a [`SourceRouter`].
#[async_trait]
pub trait TransferSource: Send + Sync {
    /// Returns the source's name (e.g., "http", "file").
    fn name(&self) -> &str;

    /// Returns true if this source can open the reference.
    fn can_handle(&self, source: &SourceRef) -> bool;

    /// Opens the reference, starting at `offset` when the source supports it.
    async fn open(
        &self,
        source: &SourceRef,
        offset: u64,
    ) -> Result<Box<dyn ChunkStream>, TransferError>;
}

/// Ordered collection of sources; the first that can handle a reference opens it.
#[derive(Default)]
pub struct SourceRouter {
    sources: Vec<Box<dyn TransferSource>>,
}

impl SourceRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a router with the built-in HTTP and file sources.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] if the HTTP client cannot be built.
    pub fn with_defaults() -> Result<Self, TransferError> {
        let mut router = Self::new();
        router.register(Box::new(HttpSource::new()?));
        router.register(Box::new(FileSource::new()));
        Ok(router)
    }

    /// Adds a source after the already registered ones.
    pub fn register(&mut self, source: Box<dyn TransferSource>) {
        debug!(source = source.name(), "registered transfer source");
        self.sources.push(source);
    }

    /// Returns the number of registered sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns true when no source is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl fmt::Debug for SourceRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.sources.iter().map(|s| s.name()).collect();
        f.debug_struct("SourceRouter").field("sources", &names).finish()
    }
}

#[async_trait]
impl TransferSource for SourceRouter {
    fn name(&self) -> &str {
        "router"
    }

    fn can_handle(&self, source: &SourceRef) -> bool {
        self.sources.iter().any(|s| s.can_handle(source))
    }

    async fn open(
        &self,
        source: &SourceRef,
        offset: u64,
    ) -> Result<Box<dyn ChunkStream>, TransferError> {
        let Some(handler) = self.sources.iter().find(|s| s.can_handle(source)) else {
            return Err(TransferError::invalid_source(source.to_string()));
        };
        debug!(source = %source, handler = handler.name(), offset, "opening source");
        handler.open(source, offset).await
    }
}

// ==================== HttpSource ====================

/// Streams `http(s)` references with reqwest, resuming via `Range` requests.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    /// Creates an HTTP source with the default connect timeout.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidSource`] if the client cannot be built.
    pub fn new() -> Result<Self, TransferError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TransferError::network("http client", e))?;
        Ok(Self { client })
    }

    /// Creates an HTTP source around an existing client.
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TransferSource for HttpSource {
    fn name(&self) -> &str {
        "http"
    }

    fn can_handle(&self, source: &SourceRef) -> bool {
        matches!(source, SourceRef::Remote(_))
    }

    #[instrument(skip(self), fields(source = %source))]
    async fn open(
        &self,
        source: &SourceRef,
        offset: u64,
    ) -> Result<Box<dyn ChunkStream>, TransferError> {
        let SourceRef::Remote(url) = source else {
            return Err(TransferError::invalid_source(source.to_string()));
        };
        let source_ref = url.to_string();

        let mut request = self.client.get(url.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransferError::timeout(&source_ref)
            } else {
                TransferError::network(&source_ref, e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::http_status(&source_ref, status.as_u16()));
        }

        let resumed = offset > 0 && status.as_u16() == 206;
        let total_len = if resumed {
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
        } else {
            response.content_length()
        };
        let start_offset = if resumed { offset } else { 0 };

        debug!(
            status = status.as_u16(),
            resumed,
            total_len,
            "http source opened"
        );

        Ok(Box::new(HttpChunkStream {
            source_ref,
            stream: Box::pin(response.bytes_stream()),
            pending: Bytes::new(),
            total_len,
            start_offset,
        }))
    }
}

/// Extracts the total from `Content-Range: bytes 100-199/2000`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

struct HttpChunkStream {
    source_ref: String,
    stream: ByteStream,
    pending: Bytes,
    total_len: Option<u64>,
    start_offset: u64,
}

#[async_trait]
impl ChunkStream for HttpChunkStream {
    fn total_len(&self) -> Option<u64> {
        self.total_len
    }

    fn start_offset(&self) -> u64 {
        self.start_offset
    }

    async fn next_chunk(&mut self, max_len: usize) -> Result<Option<Bytes>, TransferError> {
        while self.pending.is_empty() {
            match self.stream.next().await {
                Some(Ok(bytes)) => self.pending = bytes,
                Some(Err(e)) => {
                    return Err(if e.is_timeout() {
                        TransferError::timeout(&self.source_ref)
                    } else {
                        TransferError::network(&self.source_ref, e)
                    });
                }
                None => return Ok(None),
            }
        }
        let take = max_len.max(1).min(self.pending.len());
        Ok(Some(self.pending.split_to(take)))
    }
}

// ==================== FileSource ====================

/// Reads files that are already on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSource;

impl FileSource {
    /// Creates a file source.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransferSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    fn can_handle(&self, source: &SourceRef) -> bool {
        matches!(source, SourceRef::Local(_))
    }

    #[instrument(skip(self), fields(source = %source))]
    async fn open(
        &self,
        source: &SourceRef,
        offset: u64,
    ) -> Result<Box<dyn ChunkStream>, TransferError> {
        let SourceRef::Local(path) = source else {
            return Err(TransferError::invalid_source(source.to_string()));
        };

        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| TransferError::io(path.clone(), e))?;
        let total_len = file
            .metadata()
            .await
            .map_err(|e| TransferError::io(path.clone(), e))?
            .len();

        let start_offset = if offset > 0 && offset <= total_len {
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| TransferError::io(path.clone(), e))?;
            offset
        } else {
            0
        };

        Ok(Box::new(FileChunkStream {
            path: path.clone(),
            file,
            total_len,
            start_offset,
        }))
    }
}

struct FileChunkStream {
    path: PathBuf,
    file: tokio::fs::File,
    total_len: u64,
    start_offset: u64,
}

impl FileChunkStream {
    fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ChunkStream for FileChunkStream {
    fn total_len(&self) -> Option<u64> {
        Some(self.total_len)
    }

    fn start_offset(&self) -> u64 {
        self.start_offset
    }

    async fn next_chunk(&mut self, max_len: usize) -> Result<Option<Bytes>, TransferError> {
        let mut buffer = BytesMut::with_capacity(max_len.max(1));
        let read = self
            .file
            .read_buf(&mut buffer)
            .await
            .map_err(|e| TransferError::io(self.path().to_path_buf(), e))?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(buffer.freeze()))
    }
}
