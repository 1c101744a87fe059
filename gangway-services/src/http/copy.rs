//! Bidirectional byte shuttling between two upgraded connections.
use std::{
    future::poll_fn,
    pin::Pin,
    task::{Context, Poll},
};

use hyper::rt::{Read, ReadBuf, Write};

const COPY_BUF: usize = 16 * 1024;

enum Transfer {
    Running,
    /// Clean EOF propagated and the write side shut down.
    Done,
    /// Read or write failed; the whole tunnel should come down.
    Failed,
}

struct Pipe {
    buf: Box<[u8]>,
    start: usize,
    end: usize,
    read_eof: bool,
    state: Transfer,
}

impl Pipe {
    fn new() -> Self {
        Self {
            buf: vec![0u8; COPY_BUF].into_boxed_slice(),
            start: 0,
            end: 0,
            read_eof: false,
            state: Transfer::Running,
        }
    }

    fn poll_transfer<R, W>(&mut self, cx: &mut Context<'_>, reader: &mut R, writer: &mut W) -> Poll<()>
    where
        R: Read + Unpin,
        W: Write + Unpin,
    {
        if !matches!(self.state, Transfer::Running) {
            return Poll::Ready(());
        }
        loop {
            while self.start < self.end {
                match Pin::new(&mut *writer).poll_write(cx, &self.buf[self.start..self.end]) {
                    Poll::Ready(Ok(0)) | Poll::Ready(Err(_)) => {
                        self.state = Transfer::Failed;
                        return Poll::Ready(());
                    }
                    Poll::Ready(Ok(n)) => self.start += n,
                    Poll::Pending => return Poll::Pending,
                }
            }
            self.start = 0;
            self.end = 0;

            if self.read_eof {
                return match Pin::new(&mut *writer).poll_shutdown(cx) {
                    Poll::Ready(_) => {
                        self.state = Transfer::Done;
                        Poll::Ready(())
                    }
                    Poll::Pending => Poll::Pending,
                };
            }

            let mut read_buf = ReadBuf::new(&mut self.buf);
            match Pin::new(&mut *reader).poll_read(cx, read_buf.unfilled()) {
                Poll::Ready(Ok(())) => {
                    let n = read_buf.filled().len();
                    if n == 0 {
                        self.read_eof = true;
                    } else {
                        self.end = n;
                    }
                }
                Poll::Ready(Err(_)) => {
                    self.state = Transfer::Failed;
                    return Poll::Ready(());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Copy both directions between `a` and `b` until both sides reach EOF, or
/// either side fails. Half-closed tunnels keep the other direction flowing.
pub async fn copy_duplex<A, B>(mut a: A, mut b: B)
where
    A: Read + Write + Unpin,
    B: Read + Write + Unpin,
{
    let mut a_to_b = Pipe::new();
    let mut b_to_a = Pipe::new();
    poll_fn(|cx| {
        let forward = a_to_b.poll_transfer(cx, &mut a, &mut b);
        let backward = b_to_a.poll_transfer(cx, &mut b, &mut a);
        let failed = matches!(a_to_b.state, Transfer::Failed) || matches!(b_to_a.state, Transfer::Failed);
        if failed || (forward.is_ready() && backward.is_ready()) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    })
    .await
}
