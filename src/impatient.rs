//! Rolling-deadline stream wrapper
//!
//! Wraps a bidirectional byte stream with a single combined read/write
//! deadline that is re-armed after every successful I/O operation. A peer
//! that stops both producing and consuming lets the deadline fire, after
//! which every read and write on the wrapper fails with `TimedOut`. The
//! plumber (`crate::plumb`) relies on this to tear down idle tunnel pairs
//! without an explicit half-close signal.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};
use tracing::debug;

/// Stream wrapper that refreshes its deadline on every successful read or
/// write of at least one byte. The timeout is fixed at construction.
pub struct ImpatientStream<S> {
    inner: S,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    name: Option<String>,
    log_refresh: bool,
}

impl<S> ImpatientStream<S> {
    /// Wrap `inner`, arming the deadline at `now + timeout`.
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
            name: None,
            log_refresh: false,
        }
    }

    /// Attach a human-readable name, used only in log lines.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Emit a debug line every time the deadline is refreshed.
    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.log_refresh = enabled;
        self
    }

    /// The instant at which the next read/write will fail if no I/O
    /// succeeds before then.
    pub fn deadline(&self) -> Instant {
        self.deadline.as_ref().deadline()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn refresh(&mut self, op: &str, n: usize) {
        self.deadline.as_mut().reset(Instant::now() + self.timeout);
        if self.log_refresh {
            debug!(
                name = self.name.as_deref().unwrap_or("-"),
                op, bytes = n,
                "deadline refreshed"
            );
        }
    }

    fn expired(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::TimedOut,
            format!(
                "connection {} idle for {:?}",
                self.name.as_deref().unwrap_or("(unnamed)"),
                self.timeout
            ),
        )
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ImpatientStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if me.deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(me.expired()));
        }
        let before = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 {
                    me.refresh("read", n);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ImpatientStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        if me.deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(me.expired()));
        }
        match Pin::new(&mut me.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    me.refresh("write", n);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
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
    async fn read_refreshes_deadline() {
        let (mut a, b) = tokio::io::duplex(64);
        let timeout = Duration::from_millis(500);
        let mut wrapped = ImpatientStream::new(b, timeout);

        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        wrapped.read_exact(&mut buf).await.unwrap();

        let slack = Duration::from_millis(50);
        assert!(wrapped.deadline() >= Instant::now() + timeout - slack);
    }

    #[tokio::test]
    async fn write_refreshes_deadline() {
        let (_a, b) = tokio::io::duplex(64);
        let timeout = Duration::from_millis(500);
        let mut wrapped = ImpatientStream::new(b, timeout);

        tokio::time::sleep(Duration::from_millis(100)).await;
        wrapped.write_all(b"ping").await.unwrap();

        let slack = Duration::from_millis(50);
        assert!(wrapped.deadline() >= Instant::now() + timeout - slack);
    }

    #[tokio::test]
    async fn idle_read_times_out() {
        let (_a, b) = tokio::io::duplex(64);
        let mut wrapped = ImpatientStream::new(b, Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut buf = [0u8; 1];
        let err = wrapped.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn expired_deadline_also_fails_writes() {
        let (_a, b) = tokio::io::duplex(64);
        let mut wrapped = ImpatientStream::new(b, Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = wrapped.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn inner_errors_propagate_unchanged() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut wrapped = ImpatientStream::new(b, Duration::from_secs(1));

        // Peer is gone; the duplex reports EOF, not a timeout.
        let mut buf = [0u8; 1];
        let n = wrapped.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
