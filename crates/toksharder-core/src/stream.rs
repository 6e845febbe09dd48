//! HTTP streaming of remote record files with read-stall detection.
//!
//! Uses async reqwest internally with tokio::time::timeout, but hands the
//! dispatcher a plain blocking `BufRead` so remote inputs look like local files.

use std::io::{self, BufRead, BufReader, Read};
use std::pin::Pin;
use std::sync::{LazyLock, OnceLock};
use std::task::Context;
use std::time::Duration;

use flate2::read::MultiGzDecoder;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, ReadBuf};

/// Connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffer size for the remote line reader (256KB)
const STREAM_BUF_SIZE: usize = 256 * 1024;

/// Network settings shared by every remote source.
#[derive(Debug, Clone, Copy)]
pub struct HttpConfig {
    /// No data for this long counts as a stalled stream
    pub read_timeout: Duration,
    /// Retries when opening a stream
    pub max_retries: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

static HTTP_CONFIG: OnceLock<HttpConfig> = OnceLock::new();

/// Install process-wide HTTP settings. Only the first call takes effect.
pub fn set_http_config(config: HttpConfig) {
    if HTTP_CONFIG.set(config).is_err() {
        log::debug!("HTTP config already installed, ignoring {config:?}");
    }
}

/// Current HTTP settings (defaults if never installed)
pub fn http_config() -> HttpConfig {
    HTTP_CONFIG.get().copied().unwrap_or_default()
}

/// Error types for stream operations
#[derive(Debug)]
pub enum StreamError {
    /// HTTP error with optional status code
    Http {
        status: Option<u16>,
        message: String,
    },
    /// I/O error
    Io(std::io::Error),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http {
                status: Some(s),
                message,
            } => write!(f, "HTTP {s}: {message}"),
            Self::Http {
                status: None,
                message,
            } => write!(f, "HTTP error: {message}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for StreamError {}

impl StreamError {
    /// Create HTTP error from reqwest error
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        Self::Http {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }

    /// Client errors (4xx except 429) will not change on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http {
                status: Some(s), ..
            } => *s == 429 || !(400..500).contains(s),
            Self::Http { status: None, .. } => true,
            Self::Io(e) => e.kind() != io::ErrorKind::StorageFull,
        }
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

static SHARED_CLIENT: LazyLock<Result<reqwest::Client, String>> = LazyLock::new(|| {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| e.to_string())
});

/// Shared tokio runtime for HTTP operations.
static SHARED_RUNTIME: LazyLock<io::Result<tokio::runtime::Runtime>> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
});

fn runtime() -> Result<&'static tokio::runtime::Runtime, StreamError> {
    SHARED_RUNTIME
        .as_ref()
        .map_err(|e| StreamError::Io(io::Error::new(e.kind(), e.to_string())))
}

fn client() -> Result<&'static reqwest::Client, StreamError> {
    SHARED_CLIENT.as_ref().map_err(|message| StreamError::Http {
        status: None,
        message: message.clone(),
    })
}

/// Open remote stream: blocking line reader plus the advertised length.
pub struct HttpStream {
    pub reader: Box<dyn BufRead + Send>,
    pub total_bytes: Option<u64>,
}

/// HTTP GET → (optional gunzip) → buffered reader
pub fn open_http_reader(url: &str, gzip: bool) -> Result<HttpStream, StreamError> {
    let rt = runtime()?;
    let client = client()?;
    let read_timeout = http_config().read_timeout;

    let (reader, total_bytes) = rt.block_on(async {
        let response = client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| StreamError::from_reqwest(&e))?;

        let total_bytes = response.content_length();

        let stream = response.bytes_stream();
        let async_reader = tokio_util::io::StreamReader::new(
            stream.map(|result| result.map_err(io::Error::other)),
        );

        Ok::<_, StreamError>((
            TimeoutReader::new(Box::pin(async_reader), read_timeout, rt),
            total_bytes,
        ))
    })?;

    let reader: Box<dyn BufRead + Send> = if gzip {
        Box::new(BufReader::with_capacity(
            STREAM_BUF_SIZE,
            MultiGzDecoder::new(reader),
        ))
    } else {
        Box::new(BufReader::with_capacity(STREAM_BUF_SIZE, reader))
    };

    Ok(HttpStream {
        reader,
        total_bytes,
    })
}

/// Async-to-sync bridge with read timeout.
///
/// Each read has a deadline; if no data arrives in time the read fails with
/// `TimedOut`, which ends the source as a fatal stream error.
pub struct TimeoutReader {
    inner: Pin<Box<dyn AsyncRead + Send + Sync>>,
    timeout: Duration,
    rt: &'static tokio::runtime::Runtime,
}

impl TimeoutReader {
    fn new(
        inner: Pin<Box<dyn AsyncRead + Send + Sync>>,
        timeout: Duration,
        rt: &'static tokio::runtime::Runtime,
    ) -> Self {
        Self { inner, timeout, rt }
    }
}

impl Read for TimeoutReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = self.timeout;
        let rt = self.rt;
        let inner = &mut self.inner;
        rt.block_on(async {
            let read_future = async {
                let mut read_buf = ReadBuf::new(buf);
                std::future::poll_fn(|cx: &mut Context<'_>| {
                    Pin::as_mut(&mut *inner).poll_read(cx, &mut read_buf)
                })
                .await?;
                Ok::<_, io::Error>(read_buf.filled().len())
            };

            match tokio::time::timeout(timeout, read_future).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("read timeout ({}s with no data)", timeout.as_secs()),
                )),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_err(status: u16) -> StreamError {
        StreamError::Http {
            status: Some(status),
            message: "test".to_string(),
        }
    }

    #[test]
    fn http_404_not_retryable() {
        assert!(!http_err(404).is_retryable());
    }

    #[test]
    fn http_403_not_retryable() {
        assert!(!http_err(403).is_retryable());
    }

    #[test]
    fn http_429_retryable() {
        assert!(http_err(429).is_retryable());
    }

    #[test]
    fn http_503_retryable() {
        assert!(http_err(503).is_retryable());
    }

    #[test]
    fn io_timeout_retryable() {
        let err = StreamError::Io(io::Error::new(io::ErrorKind::TimedOut, "timeout"));
        assert!(err.is_retryable());
    }

    #[test]
    fn io_storage_full_not_retryable() {
        let err = StreamError::Io(io::Error::new(io::ErrorKind::StorageFull, "disk full"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn display_http_with_status() {
        assert_eq!(format!("{}", http_err(404)), "HTTP 404: test");
    }

    #[test]
    fn default_http_config() {
        let cfg = HttpConfig::default();
        assert_eq!(cfg.read_timeout, Duration::from_secs(30));
        assert_eq!(cfg.max_retries, 3);
    }
}
