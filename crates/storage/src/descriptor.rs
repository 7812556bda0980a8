use chrono::{DateTime, Utc};
use models::Error;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio_util::sync::CancellationToken;

/// A streaming byte source. Dropping the reader closes the transport;
/// close-by-drop is idempotent.
pub type ByteReader = Pin<Box<dyn AsyncRead + Send>>;

/// The result of a ranged open: the stream plus whether the backend
/// actually honored the requested range.
pub struct RangedReader {
    pub reader: ByteReader,
    /// False when the backend returned the full body despite the Range
    /// request (some WebDAV servers); the caller must slice.
    pub range_honored: bool,
}

/// Backend-specific opener behind a [`StreamDescriptor`].
#[async_trait::async_trait]
pub trait StreamSource: Send + Sync {
    async fn open_full(&self, cancel: &CancellationToken) -> Result<ByteReader, Error>;

    /// Open `[start, end]` (inclusive; `end = None` reads to EOF).
    /// Sources that cannot seek at all should not override this.
    async fn open_range(
        &self,
        start: u64,
        end: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<RangedReader, Error> {
        let _ = (start, end);
        Err(Error::Validation("range open is not supported by this source".to_string()))
    }

    fn supports_range(&self) -> bool {
        false
    }
}

/// Immutable per-download handle: metadata plus stream openers.
pub struct StreamDescriptor {
    pub size: Option<u64>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    source: Box<dyn StreamSource>,
}

impl StreamDescriptor {
    pub fn new(
        size: Option<u64>,
        content_type: Option<String>,
        etag: Option<String>,
        last_modified: Option<DateTime<Utc>>,
        source: Box<dyn StreamSource>,
    ) -> Self {
        Self { size, content_type, etag, last_modified, source }
    }

    pub fn supports_range(&self) -> bool {
        self.source.supports_range()
    }

    pub async fn open_full(&self, cancel: &CancellationToken) -> Result<ByteReader, Error> {
        self.source.open_full(cancel).await
    }

    /// Open a byte range, slicing a full stream when the source either does
    /// not support ranges or reports the range was not honored. The returned
    /// reader always yields exactly the requested window (bounded by EOF).
    pub async fn open_range(
        &self,
        start: u64,
        end: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<ByteReader, Error> {
        if self.source.supports_range() {
            let ranged = self.source.open_range(start, end, cancel).await?;
            if ranged.range_honored {
                return Ok(ranged.reader);
            }
            return slice_reader(ranged.reader, start, end).await.map_err(Error::internal);
        }
        let full = self.source.open_full(cancel).await?;
        slice_reader(full, start, end).await.map_err(Error::internal)
    }
}

impl std::fmt::Debug for StreamDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDescriptor")
            .field("size", &self.size)
            .field("content_type", &self.content_type)
            .field("etag", &self.etag)
            .field("last_modified", &self.last_modified)
            .field("supports_range", &self.supports_range())
            .finish()
    }
}

/// Slice `[start, end]` (inclusive) out of a full-content reader by
/// discarding the first `start` bytes and bounding the remainder.
pub async fn slice_reader(
    mut reader: ByteReader,
    start: u64,
    end: Option<u64>,
) -> io::Result<ByteReader> {
    if start > 0 {
        let mut skip = (&mut reader).take(start);
        let skipped = tokio::io::copy(&mut skip, &mut tokio::io::sink()).await?;
        if skipped < start {
            // Stream ended before the window; yield an empty reader.
            return Ok(Box::pin(tokio::io::empty()));
        }
    }
    Ok(match end {
        Some(end) => Box::pin(reader.take(end.saturating_sub(start) + 1)),
        None => reader,
    })
}

/// Wraps a reader so that cancelling the token fails the next read and
/// releases the underlying transport promptly.
pub struct CancellableReader<R> {
    inner: R,
    cancel: CancellationToken,
}

impl<R> CancellableReader<R> {
    pub fn new(inner: R, cancel: CancellationToken) -> Self {
        Self { inner, cancel }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CancellableReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled")));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader_of(bytes: &'static [u8]) -> ByteReader {
        Box::pin(bytes)
    }

    #[tokio::test]
    async fn test_slice_window() {
        let sliced = slice_reader(reader_of(b"hello world"), 6, Some(10)).await.unwrap();
        let mut out = Vec::new();
        let mut sliced = sliced;
        sliced.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"world");
    }

    #[tokio::test]
    async fn test_slice_single_byte_and_tail() {
        let mut one = slice_reader(reader_of(b"hello world"), 0, Some(0)).await.unwrap();
        let mut out = Vec::new();
        one.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"h");

        let mut tail = slice_reader(reader_of(b"hello world"), 6, None).await.unwrap();
        out.clear();
        tail.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"world");
    }

    #[tokio::test]
    async fn test_slice_past_eof_is_empty() {
        let mut past = slice_reader(reader_of(b"abc"), 10, Some(20)).await.unwrap();
        let mut out = Vec::new();
        past.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_reader_fails_reads() {
        let cancel = CancellationToken::new();
        let mut reader = CancellableReader::new(&b"data"[..], cancel.clone());

        let mut buf = [0u8; 2];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 2);

        cancel.cancel();
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }
}
