//! Pooled, reference-counted byte buffers.
//!
//! The pool hands out fixed-size blocks accounted against a global cap.
//! Freezing a block yields an [`IoSlice`]: a cheaply clonable view that
//! shares the underlying bytes and the pool accounting. Capacity returns to
//! the pool when the last view over a block is dropped, and `alloc` waits
//! (asynchronously) while the pool is exhausted, which is what bounds the
//! memory held between decrypt, enqueue and send.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Size of one pooled block.
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;

/// Default number of outstanding blocks (4 MiB total with default blocks).
pub const DEFAULT_MAX_BLOCKS: usize = 256;

/// A capped allocator of fixed-size blocks.
#[derive(Clone)]
pub struct IobufPool {
    block_size: usize,
    sem: Arc<Semaphore>,
}

impl IobufPool {
    pub fn new(block_size: usize, max_blocks: usize) -> Self {
        IobufPool {
            block_size,
            sem: Arc::new(Semaphore::new(max_blocks)),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks currently available without waiting.
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    /// Take a block, waiting until one is free.
    pub async fn alloc(&self) -> Iobuf {
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .expect("iobuf pool semaphore closed");
        Iobuf {
            buf: BytesMut::with_capacity(self.block_size),
            cap: self.block_size,
            permit,
        }
    }

    /// Take a block only if one is free right now.
    pub fn try_alloc(&self) -> Option<Iobuf> {
        let permit = self.sem.clone().try_acquire_owned().ok()?;
        Some(Iobuf {
            buf: BytesMut::with_capacity(self.block_size),
            cap: self.block_size,
            permit,
        })
    }
}

impl Default for IobufPool {
    fn default() -> Self {
        IobufPool::new(DEFAULT_BLOCK_SIZE, DEFAULT_MAX_BLOCKS)
    }
}

impl std::fmt::Debug for IobufPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IobufPool")
            .field("block_size", &self.block_size)
            .field("available", &self.available())
            .finish()
    }
}

/// A writable block checked out of the pool.
pub struct Iobuf {
    buf: BytesMut,
    cap: usize,
    permit: OwnedSemaphorePermit,
}

impl Iobuf {
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes still writable in this block.
    pub fn remaining(&self) -> usize {
        self.cap - self.buf.len()
    }

    /// Append as much of `src` as fits; returns the number copied.
    pub fn put(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.buf.extend_from_slice(&src[..n]);
        n
    }

    /// Freeze into an immutable shared view. The pool capacity stays
    /// checked out until every view over this block is dropped.
    pub fn freeze(self) -> IoSlice {
        IoSlice {
            bytes: self.buf.freeze(),
            _permit: Some(Arc::new(self.permit)),
        }
    }
}

/// An immutable, cheaply clonable view of (part of) a block.
#[derive(Clone)]
pub struct IoSlice {
    bytes: Bytes,
    _permit: Option<Arc<OwnedSemaphorePermit>>,
}

impl IoSlice {
    /// A view over bytes not owned by any pool.
    pub fn from_bytes(bytes: Bytes) -> Self {
        IoSlice {
            bytes,
            _permit: None,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// A sub-view sharing the block and its accounting.
    pub fn slice(&self, range: std::ops::Range<usize>) -> IoSlice {
        IoSlice {
            bytes: self.bytes.slice(range),
            _permit: self._permit.clone(),
        }
    }

    /// Split off the first `n` bytes, leaving the rest in `self`.
    pub fn split_to(&mut self, n: usize) -> IoSlice {
        IoSlice {
            bytes: self.bytes.split_to(n),
            _permit: self._permit.clone(),
        }
    }
}

impl Deref for IoSlice {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl AsRef<[u8]> for IoSlice {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for IoSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IoSlice({} bytes)", self.len())
    }
}

/// A logical concatenation of views, consumed front to back without copying
/// until the reader drains it.
#[derive(Default)]
pub struct SliceChain {
    slices: VecDeque<IoSlice>,
    len: usize,
}

impl SliceChain {
    pub fn new() -> Self {
        SliceChain::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, slice: IoSlice) {
        self.len += slice.len();
        if !slice.is_empty() {
            self.slices.push_back(slice);
        }
    }

    /// Copy up to `dst.len()` bytes into `dst`, consuming them from the
    /// front of the chain. Returns the number copied.
    pub fn copy_to(&mut self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dst.len() {
            let Some(head) = self.slices.front_mut() else {
                break;
            };
            let n = (dst.len() - copied).min(head.len());
            dst[copied..copied + n].copy_from_slice(&head[..n]);
            let _ = head.split_to(n);
            copied += n;
            if head.is_empty() {
                self.slices.pop_front();
            }
        }
        self.len -= copied;
        copied
    }

    pub fn clear(&mut self) {
        self.slices.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_put_freeze() {
        let pool = IobufPool::new(8, 2);
        let mut buf = pool.try_alloc().unwrap();
        assert_eq!(buf.put(b"hello world"), 8);
        let slice = buf.freeze();
        assert_eq!(&*slice, b"hello wo");
    }

    #[test]
    fn pool_caps_outstanding_blocks() {
        let pool = IobufPool::new(8, 2);
        let a = pool.try_alloc().unwrap();
        let _b = pool.try_alloc().unwrap();
        assert!(pool.try_alloc().is_none());

        // Dropping the only view over a block frees its capacity.
        drop(a.freeze());
        assert!(pool.try_alloc().is_some());
    }

    #[test]
    fn clones_share_accounting() {
        let pool = IobufPool::new(8, 1);
        let mut buf = pool.try_alloc().unwrap();
        buf.put(b"abcdefgh");
        let slice = buf.freeze();
        let sub = slice.slice(2..5);
        drop(slice);
        // The sub-view still pins the block.
        assert!(pool.try_alloc().is_none());
        assert_eq!(&*sub, b"cde");
        drop(sub);
        assert!(pool.try_alloc().is_some());
    }

    #[tokio::test]
    async fn alloc_waits_for_release() {
        let pool = IobufPool::new(8, 1);
        let held = pool.alloc().await.freeze();
        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.alloc().await.freeze() });
        tokio::task::yield_now().await;
        drop(held);
        waiter.await.unwrap();
    }

    #[test]
    fn chain_preserves_order() {
        let pool = IobufPool::new(4, 8);
        let mut chain = SliceChain::new();
        for part in [&b"abcd"[..], b"ef", b"ghij"] {
            let mut buf = pool.try_alloc().unwrap();
            buf.put(part);
            chain.push(buf.freeze());
        }
        assert_eq!(chain.len(), 10);

        let mut out = [0u8; 3];
        assert_eq!(chain.copy_to(&mut out), 3);
        assert_eq!(&out, b"abc");

        let mut rest = [0u8; 16];
        let n = chain.copy_to(&mut rest);
        assert_eq!(&rest[..n], b"defghij");
        assert!(chain.is_empty());
    }
}
