//! In-memory duplex pipe between monoio rent-style IO and hyper.
//!
//! hyper's upgrade machinery (which websocket tunneling and drain
//! cancellation of hijacked connections depend on) requires its IO to be
//! `Send`. A monoio stream is bound to its worker's driver and is not, so
//! connections are not handed to hyper directly: the raw stream is pumped by
//! a worker task ([`drive_halves`]) into one end of this pipe, and hyper
//! reads and writes the other end, a plain `Send` byte channel. Both ends
//! always live on the same worker thread, the locks are uncontended.
use std::{
    collections::VecDeque,
    future::poll_fn,
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};

use bytes::Bytes;
use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt};

const PIPE_CAPACITY: usize = 64 * 1024;
const IO_CHUNK: usize = 16 * 1024;

struct Ring {
    buf: VecDeque<u8>,
    closed: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl Ring {
    fn new() -> Self {
        Self {
            buf: VecDeque::with_capacity(PIPE_CAPACITY),
            closed: false,
            read_waker: None,
            write_waker: None,
        }
    }

    fn close(&mut self) {
        self.closed = true;
        if let Some(w) = self.read_waker.take() {
            w.wake();
        }
        if let Some(w) = self.write_waker.take() {
            w.wake();
        }
    }
}

/// rings[0]: hyper -> peer (towards the socket)
/// rings[1]: peer -> hyper (from the socket)
struct Shared {
    rings: [Mutex<Ring>; 2],
}

const TO_SOCKET: usize = 0;
const FROM_SOCKET: usize = 1;

/// Create a connected pipe: the [`BridgeIo`] end speaks hyper's `rt` traits,
/// the [`BridgePeer`] end is pumped against the real socket.
pub fn duplex() -> (BridgeIo, BridgePeer) {
    let shared = Arc::new(Shared {
        rings: [Mutex::new(Ring::new()), Mutex::new(Ring::new())],
    });
    (
        BridgeIo {
            shared: shared.clone(),
        },
        BridgePeer { shared },
    )
}

/// The hyper-facing end of the pipe.
pub struct BridgeIo {
    shared: Arc<Shared>,
}

impl Drop for BridgeIo {
    fn drop(&mut self) {
        self.shared.rings[TO_SOCKET].lock().unwrap().close();
        self.shared.rings[FROM_SOCKET].lock().unwrap().close();
    }
}

impl hyper::rt::Read for BridgeIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        let mut ring = self.shared.rings[FROM_SOCKET].lock().unwrap();
        if ring.buf.is_empty() {
            if ring.closed {
                return Poll::Ready(Ok(()));
            }
            ring.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let mut n = std::cmp::min(buf.remaining(), ring.buf.len());
        while n > 0 {
            let (front, _) = ring.buf.as_slices();
            let take = std::cmp::min(n, front.len());
            buf.put_slice(&front[..take]);
            ring.buf.drain(..take);
            n -= take;
        }
        if let Some(w) = ring.write_waker.take() {
            w.wake();
        }
        Poll::Ready(Ok(()))
    }
}

impl hyper::rt::Write for BridgeIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut ring = self.shared.rings[TO_SOCKET].lock().unwrap();
        if ring.closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        let space = PIPE_CAPACITY - ring.buf.len();
        if space == 0 {
            ring.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = std::cmp::min(space, buf.len());
        ring.buf.extend(&buf[..n]);
        if let Some(w) = ring.read_waker.take() {
            w.wake();
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shared.rings[TO_SOCKET].lock().unwrap().close();
        Poll::Ready(Ok(()))
    }
}

/// The socket-facing end of the pipe.
pub struct BridgePeer {
    shared: Arc<Shared>,
}

impl Drop for BridgePeer {
    fn drop(&mut self) {
        self.shared.rings[TO_SOCKET].lock().unwrap().close();
        self.shared.rings[FROM_SOCKET].lock().unwrap().close();
    }
}

impl BridgePeer {
    /// Bytes hyper wants written to the socket; `None` once hyper shut the
    /// connection down and the buffer drained.
    pub async fn pull(&self) -> Option<Bytes> {
        poll_fn(|cx| {
            let mut ring = self.shared.rings[TO_SOCKET].lock().unwrap();
            if !ring.buf.is_empty() {
                let n = std::cmp::min(ring.buf.len(), IO_CHUNK);
                let chunk: Bytes = ring.buf.drain(..n).collect::<Vec<u8>>().into();
                if let Some(w) = ring.write_waker.take() {
                    w.wake();
                }
                return Poll::Ready(Some(chunk));
            }
            if ring.closed {
                return Poll::Ready(None);
            }
            ring.read_waker = Some(cx.waker().clone());
            Poll::Pending
        })
        .await
    }

    /// Feed socket bytes towards hyper, waiting for buffer space.
    pub async fn push(&self, data: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        poll_fn(|cx| {
            let mut ring = self.shared.rings[FROM_SOCKET].lock().unwrap();
            if ring.closed {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
            }
            loop {
                let space = PIPE_CAPACITY - ring.buf.len();
                if space == 0 {
                    ring.write_waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
                let n = std::cmp::min(space, data.len() - offset);
                ring.buf.extend(&data[offset..offset + n]);
                offset += n;
                if let Some(w) = ring.read_waker.take() {
                    w.wake();
                }
                if offset == data.len() {
                    return Poll::Ready(Ok(()));
                }
            }
        })
        .await
    }

    /// Socket hit EOF: hyper sees end-of-stream after draining.
    pub fn close_write(&self) {
        self.shared.rings[FROM_SOCKET].lock().unwrap().close();
    }

    /// Socket can no longer be written: hyper writes fail from now on.
    pub fn close_read(&self) {
        self.shared.rings[TO_SOCKET].lock().unwrap().close();
    }
}

/// Pump a split monoio stream against the peer end of a pipe until both
/// directions finish.
pub async fn drive_halves<R, W>(mut read_half: R, mut write_half: W, peer: BridgePeer)
where
    R: AsyncReadRent,
    W: AsyncWriteRent,
{
    let inbound = async {
        loop {
            let buf = vec![0u8; IO_CHUNK];
            let (res, buf) = read_half.read(buf).await;
            match res {
                Ok(0) => {
                    peer.close_write();
                    break;
                }
                Ok(n) => {
                    if peer.push(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(_) => {
                    peer.close_write();
                    break;
                }
            }
        }
    };
    let outbound = async {
        loop {
            match peer.pull().await {
                Some(data) => {
                    let (res, _) = write_half.write_all(data).await;
                    if res.is_err() {
                        peer.close_read();
                        break;
                    }
                }
                None => {
                    let _ = write_half.shutdown().await;
                    break;
                }
            }
        }
    };
    monoio::join!(inbound, outbound);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::rt::Read;
    use std::task::Poll;

    fn poll_io_read(io: &mut BridgeIo, dst: &mut [u8]) -> Poll<io::Result<usize>> {
        let waker = futures_util::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut buf = hyper::rt::ReadBuf::new(dst);
        match Pin::new(io).poll_read(&mut cx, buf.unfilled()) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(buf.filled().len())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    #[monoio::test]
    async fn bytes_flow_both_ways() {
        let (mut io, peer) = duplex();

        peer.push(b"hello").await.unwrap();
        let mut dst = [0u8; 16];
        match poll_io_read(&mut io, &mut dst) {
            Poll::Ready(Ok(n)) => assert_eq!(&dst[..n], b"hello"),
            other => panic!("unexpected read result: {other:?}"),
        }

        let waker = futures_util::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        match hyper::rt::Write::poll_write(Pin::new(&mut io), &mut cx, b"world") {
            Poll::Ready(Ok(n)) => assert_eq!(n, 5),
            other => panic!("unexpected write result: {other:?}"),
        }
        assert_eq!(peer.pull().await.unwrap(), Bytes::from_static(b"world"));
    }

    #[monoio::test]
    async fn eof_after_close_write() {
        let (mut io, peer) = duplex();
        peer.push(b"x").await.unwrap();
        peer.close_write();

        let mut dst = [0u8; 4];
        assert!(matches!(poll_io_read(&mut io, &mut dst), Poll::Ready(Ok(1))));
        // Drained and closed: zero-byte read means EOF.
        assert!(matches!(poll_io_read(&mut io, &mut dst), Poll::Ready(Ok(0))));
    }

    #[monoio::test]
    async fn dropped_io_fails_push() {
        let (io, peer) = duplex();
        drop(io);
        assert!(peer.push(b"x").await.is_err());
        assert_eq!(peer.pull().await, None);
    }
}
