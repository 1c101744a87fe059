use std::{
    cell::Cell,
    future::Future,
    path::PathBuf,
    rc::Rc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_util::future::LocalBoxFuture;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame};
use monoio::buf::IoBufMut;

use crate::http::BodyError;

const READ_CHUNK: usize = 64 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum SpoolError {
    #[error("maximum size exceeded")]
    MaximumSizeExceeded,
    #[error("spool io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Stream(BodyError),
}

/// A fully consumed body: the head in memory, the overflow in a temp file.
///
/// The memory share is bounded by `max_memory`, the total by `max_total`
/// (either 0 meaning unbounded). Temp storage is unlinked when the last
/// reference goes away.
#[derive(Debug)]
pub struct BufferedBody {
    mem: Bytes,
    spill: Option<Rc<SpillFile>>,
    disk_len: u64,
}

#[derive(Debug)]
struct SpillFile {
    file: monoio::fs::File,
    path: PathBuf,
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl BufferedBody {
    pub fn total_len(&self) -> u64 {
        self.mem.len() as u64 + self.disk_len
    }

    pub fn spilled(&self) -> bool {
        self.spill.is_some()
    }

    pub fn into_body(self) -> SpooledBody {
        SpooledBody {
            mem: if self.mem.is_empty() {
                None
            } else {
                Some(self.mem)
            },
            spill: self.spill,
            disk_len: self.disk_len,
            pos: 0,
            read: None,
        }
    }
}

/// Drain `body` into a [`BufferedBody`].
pub async fn spool<B>(mut body: B, max_memory: u64, max_total: u64) -> Result<BufferedBody, SpoolError>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BodyError>,
{
    let max_memory = nonzero_or_max(max_memory);
    let max_total = nonzero_or_max(max_total);

    let mut mem: Vec<u8> = Vec::new();
    let mut spill: Option<SpillFile> = None;
    let mut disk_len: u64 = 0;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| SpoolError::Stream(e.into()))?;
        let Ok(data) = frame.into_data() else {
            // Trailers are not representable once buffered.
            continue;
        };
        if mem.len() as u64 + disk_len + data.len() as u64 > max_total {
            return Err(SpoolError::MaximumSizeExceeded);
        }
        let room = (max_memory - mem.len() as u64).min(data.len() as u64) as usize;
        mem.extend_from_slice(&data[..room]);
        if room < data.len() {
            let overflow = data.slice(room..);
            let len = overflow.len() as u64;
            spill_write(&mut spill, overflow, disk_len).await?;
            disk_len += len;
        }
    }

    Ok(BufferedBody {
        mem: mem.into(),
        spill: spill.map(Rc::new),
        disk_len,
    })
}

async fn spill_write(
    spill: &mut Option<SpillFile>,
    data: Bytes,
    offset: u64,
) -> std::io::Result<()> {
    if spill.is_none() {
        *spill = Some(create_spill_file().await?);
    }
    if let Some(file) = spill.as_ref() {
        let (res, _) = file.file.write_all_at(data, offset).await;
        res?;
    }
    Ok(())
}

fn nonzero_or_max(limit: u64) -> u64 {
    if limit == 0 {
        u64::MAX
    } else {
        limit
    }
}

async fn create_spill_file() -> std::io::Result<SpillFile> {
    thread_local! {
        static SPILL_SEQ: Cell<u64> = const { Cell::new(0) };
    }
    let seq = SPILL_SEQ.with(|c| {
        let v = c.get();
        c.set(v + 1);
        v
    });
    let path = std::env::temp_dir().join(format!(
        "gangway-spool-{}-{:?}-{}",
        std::process::id(),
        std::thread::current().id(),
        seq
    ));
    let file = monoio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&path)
        .await?;
    Ok(SpillFile { file, path })
}

/// Streams a [`BufferedBody`] back out: the memory head first, then the
/// spill file in chunks.
pub struct SpooledBody {
    mem: Option<Bytes>,
    spill: Option<Rc<SpillFile>>,
    disk_len: u64,
    pos: u64,
    read: Option<LocalBoxFuture<'static, std::io::Result<Bytes>>>,
}

impl SpooledBody {
    pub fn remaining(&self) -> u64 {
        self.mem.as_ref().map(|m| m.len() as u64).unwrap_or(0) + (self.disk_len - self.pos)
    }

    pub fn is_end_stream(&self) -> bool {
        self.remaining() == 0
    }

    pub(crate) fn poll_frame_inner(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BodyError>>> {
        if let Some(data) = self.mem.take() {
            return Poll::Ready(Some(Ok(Frame::data(data))));
        }
        if self.pos >= self.disk_len {
            return Poll::Ready(None);
        }
        if self.read.is_none() {
            let Some(spill) = self.spill.clone() else {
                return Poll::Ready(None);
            };
            let pos = self.pos;
            let len = std::cmp::min(READ_CHUNK as u64, self.disk_len - pos) as usize;
            self.read = Some(Box::pin(async move {
                let buf = unsafe { Vec::with_capacity(len).slice_mut_unchecked(0..len) };
                let (res, slice) = spill.file.read_exact_at(buf, pos).await;
                res?;
                Ok(Bytes::from(slice.into_inner()))
            }));
        }
        let Some(read) = self.read.as_mut() else {
            return Poll::Ready(None);
        };
        match read.as_mut().poll(cx) {
            Poll::Ready(Ok(data)) => {
                self.read = None;
                self.pos += data.len() as u64;
                Poll::Ready(Some(Ok(Frame::data(data))))
            }
            Poll::Ready(Err(e)) => {
                self.read = None;
                self.pos = self.disk_len;
                Poll::Ready(Some(Err(BodyError::Io(e))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};

    async fn collect(body: SpooledBody) -> Vec<u8> {
        let mut body = crate::http::ProxyBody::spooled(body);
        let mut out = Vec::new();
        while let Some(frame) = body.frame().await {
            if let Ok(data) = frame.unwrap().into_data() {
                out.extend_from_slice(&data);
            }
        }
        out
    }

    #[monoio::test]
    async fn small_body_stays_in_memory() {
        let body = Full::new(Bytes::from_static(b"hello"));
        let buffered = spool(body, 1024, 0).await.unwrap();
        assert!(!buffered.spilled());
        assert_eq!(buffered.total_len(), 5);
        assert_eq!(collect(buffered.into_body()).await, b"hello");
    }

    #[monoio::test]
    async fn overflow_spills_to_disk_and_reads_back() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let body = Full::new(Bytes::from(payload.clone()));
        let buffered = spool(body, 1024, 0).await.unwrap();
        assert!(buffered.spilled());
        assert_eq!(buffered.total_len(), payload.len() as u64);
        assert_eq!(collect(buffered.into_body()).await, payload);
    }

    #[monoio::test]
    async fn total_cap_is_enforced() {
        let body = Full::new(Bytes::from(vec![0u8; 2048]));
        let err = spool(body, 256, 1024).await.unwrap_err();
        assert!(matches!(err, SpoolError::MaximumSizeExceeded));
    }

    #[monoio::test]
    async fn zero_limits_mean_unbounded() {
        let body = Full::new(Bytes::from(vec![7u8; 4096]));
        let buffered = spool(body, 0, 0).await.unwrap();
        assert!(!buffered.spilled());
        assert_eq!(buffered.total_len(), 4096);
    }
}
