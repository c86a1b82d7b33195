//! The narrow interface to the underlying byte transport.
//!
//! The hub does not own TCP or TLS; it drives whatever stream the embedding
//! HTTP server hands over. [`Transport`] is that seam: an async byte stream
//! plus the two socket options the facade proxies. Streams without a real
//! socket underneath (upgraded HTTP connections, in-memory pipes) keep the
//! no-op defaults.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// A bidirectional byte stream a client connection runs over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Enables or disables Nagle's algorithm, where the transport has a
    /// socket to apply it to.
    fn set_nodelay(&self, _enabled: bool) -> io::Result<()> {
        Ok(())
    }

    /// Enables or disables TCP keepalive probes, where the transport has a
    /// socket to apply them to.
    fn set_keepalive(&self, _enabled: bool) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for TcpStream {
    fn set_nodelay(&self, enabled: bool) -> io::Result<()> {
        TcpStream::set_nodelay(self, enabled)
    }

    fn set_keepalive(&self, enabled: bool) -> io::Result<()> {
        let sock = socket2::SockRef::from(self);
        sock.set_keepalive(enabled)
    }
}

impl Transport for tokio::io::DuplexStream {}

impl Transport for hyper_util::rt::TokioIo<hyper::upgrade::Upgraded> {}

/// Transparent wrapper that counts bytes moving through a transport.
///
/// The counters back the facade's `bytes_read`/`bytes_written` inspectors
/// and are shared with the client handle through atomics.
pub(crate) struct Meter<T> {
    inner: T,
    bytes_read: Arc<AtomicU64>,
    bytes_written: Arc<AtomicU64>,
}

impl<T> Meter<T> {
    pub(crate) fn new(inner: T, bytes_read: Arc<AtomicU64>, bytes_written: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            bytes_read,
            bytes_written,
        }
    }

    pub(crate) fn get_ref(&self) -> &T {
        &self.inner
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Meter<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let read = buf.filled().len() - before;
            this.bytes_read.fetch_add(read as u64, Ordering::Relaxed);
        }
        result
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Meter<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = result {
            this.bytes_written.fetch_add(written as u64, Ordering::Relaxed);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn meter_counts_both_directions() {
        let (near, far) = tokio::io::duplex(64);
        let bytes_read = Arc::new(AtomicU64::new(0));
        let bytes_written = Arc::new(AtomicU64::new(0));
        let mut meter = Meter::new(near, bytes_read.clone(), bytes_written.clone());

        let mut far = far;
        meter.write_all(b"hello").await.unwrap();
        meter.flush().await.unwrap();

        let mut buf = [0u8; 5];
        far.read_exact(&mut buf).await.unwrap();
        far.write_all(b"wsx").await.unwrap();

        let mut buf = [0u8; 3];
        meter.read_exact(&mut buf).await.unwrap();

        assert_eq!(bytes_written.load(Ordering::Relaxed), 5);
        assert_eq!(bytes_read.load(Ordering::Relaxed), 3);
    }
}
