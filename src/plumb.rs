//! Full-duplex byte pump between two connections
//!
//! `fit` copies bytes in both directions between two streams, each wrapped
//! in an [`ImpatientStream`](crate::impatient::ImpatientStream) so that a
//! connection going idle fails both directions within the deadline. The
//! pump returns once both directions have finished; per-direction errors
//! are summarized, never propagated.

use std::future::poll_fn;
use std::io;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::impatient::ImpatientStream;

/// Copy buffer size used when the caller does not supply one.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Idle deadline applied to both wrapped connections.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Tuning knobs for [`fit_with`].
#[derive(Debug, Clone)]
pub struct FitOptions {
    pub idle_timeout: Duration,
    pub buffer_a_to_b: usize,
    pub buffer_b_to_a: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            buffer_a_to_b: DEFAULT_BUFFER_SIZE,
            buffer_b_to_a: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// How a single copy direction ended.
#[derive(Debug)]
pub struct CopyEnd {
    /// Bytes successfully forwarded in this direction.
    pub bytes: u64,
    /// `None` for a clean EOF; otherwise the error kind that ended the
    /// direction (typically `TimedOut` from the idle deadline).
    pub error: Option<io::ErrorKind>,
}

/// Summary of a completed pump. Both directions have terminated by the
/// time this value exists.
#[derive(Debug)]
pub struct FitOutcome {
    pub a_to_b: CopyEnd,
    pub b_to_a: CopyEnd,
}

/// Pump bytes between `a` and `b` with default buffers and deadline.
pub async fn fit<A, B>(a: A, b: B) -> FitOutcome
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    fit_with(a, b, FitOptions::default()).await
}

/// Pump bytes between `a` and `b`, waiting for both directions to finish.
pub async fn fit_with<A, B>(a: A, b: B, opts: FitOptions) -> FitOutcome
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut a = ImpatientStream::new(a, opts.idle_timeout);
    let mut b = ImpatientStream::new(b, opts.idle_timeout);

    let mut forward = Direction::new(opts.buffer_a_to_b);
    let mut reverse = Direction::new(opts.buffer_b_to_a);

    poll_fn(|cx| {
        // Both directions are advanced on every wakeup; each parks itself
        // once it has terminated.
        let fwd_done = forward.poll_advance(cx, &mut a, &mut b);
        let rev_done = reverse.poll_advance(cx, &mut b, &mut a);

        if fwd_done && rev_done {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    })
    .await;

    let outcome = FitOutcome {
        a_to_b: forward.into_end(),
        b_to_a: reverse.into_end(),
    };
    debug!(
        a_to_b = outcome.a_to_b.bytes,
        b_to_a = outcome.b_to_a.bytes,
        "pump finished"
    );
    outcome
}

/// One copy direction: a read-then-write state machine over a fixed
/// buffer, in the shape of tokio's `CopyBuffer`.
struct Direction {
    buf: Box<[u8]>,
    pos: usize,
    cap: usize,
    bytes: u64,
    finished: Option<Option<io::ErrorKind>>,
}

impl Direction {
    fn new(buf_size: usize) -> Self {
        Self {
            buf: vec![0u8; buf_size.max(1)].into_boxed_slice(),
            pos: 0,
            cap: 0,
            bytes: 0,
            finished: None,
        }
    }

    fn into_end(self) -> CopyEnd {
        CopyEnd {
            bytes: self.bytes,
            error: self.finished.flatten(),
        }
    }

    /// Drive this direction as far as possible; returns true once it has
    /// terminated (EOF or error).
    fn poll_advance<R, W>(&mut self, cx: &mut Context<'_>, reader: &mut R, writer: &mut W) -> bool
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if self.finished.is_some() {
            return true;
        }
        loop {
            if self.pos == self.cap {
                let mut read_buf = ReadBuf::new(&mut self.buf);
                match std::pin::Pin::new(&mut *reader).poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            self.finished = Some(None);
                            return true;
                        }
                        self.pos = 0;
                        self.cap = n;
                    }
                    Poll::Ready(Err(e)) => {
                        self.finished = Some(Some(e.kind()));
                        return true;
                    }
                    Poll::Pending => return false,
                }
            }
            while self.pos < self.cap {
                match std::pin::Pin::new(&mut *writer).poll_write(cx, &self.buf[self.pos..self.cap])
                {
                    Poll::Ready(Ok(0)) => {
                        self.finished = Some(Some(io::ErrorKind::WriteZero));
                        return true;
                    }
                    Poll::Ready(Ok(n)) => {
                        self.pos += n;
                        self.bytes += n as u64;
                    }
                    Poll::Ready(Err(e)) => {
                        self.finished = Some(Some(e.kind()));
                        return true;
                    }
                    Poll::Pending => return false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn forwards_both_directions() {
        let (mut client, proxy_side_1) = tokio::io::duplex(4096);
        let (proxy_side_2, mut upstream) = tokio::io::duplex(4096);

        let pump = tokio::spawn(fit(proxy_side_1, proxy_side_2));

        client.write_all(b"hello upstream").await.unwrap();
        let mut buf = [0u8; 14];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello upstream");

        upstream.write_all(b"hello client").await.unwrap();
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello client");

        drop(client);
        drop(upstream);
        let outcome = pump.await.unwrap();
        assert_eq!(outcome.a_to_b.bytes, 14);
        assert_eq!(outcome.b_to_a.bytes, 12);
    }

    #[tokio::test]
    async fn idle_pair_terminates() {
        let (_client, proxy_side_1) = tokio::io::duplex(64);
        let (proxy_side_2, _upstream) = tokio::io::duplex(64);

        let opts = FitOptions {
            idle_timeout: Duration::from_millis(100),
            ..FitOptions::default()
        };
        // Neither end ever writes; the deadline must end the pump.
        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            fit_with(proxy_side_1, proxy_side_2, opts),
        )
        .await
        .expect("pump must terminate on idle");

        assert_eq!(outcome.a_to_b.bytes, 0);
        assert_eq!(outcome.b_to_a.bytes, 0);
        assert_eq!(outcome.a_to_b.error, Some(io::ErrorKind::TimedOut));
        assert_eq!(outcome.b_to_a.error, Some(io::ErrorKind::TimedOut));
    }
}
