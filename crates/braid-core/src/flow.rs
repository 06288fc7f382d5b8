//! One bidirectional byte stream inside a VC.
//!
//! A flow writes through its bqueue writer, gated by the credit the peer
//! has granted, and reads from a receive chain the VC's dispatcher fills.
//! It holds only handles (a writer, a control-queue sender); the VC owns
//! the flow table, so teardown is strictly top-down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::bqueue::BqWriter;
use crate::error::{Error, ErrorKind, Result};
use crate::iobuf::{IobufPool, SliceChain, IoSlice};
use crate::message::{Counter, Message};
use crate::security::{Blessings, Discharge};
use crate::vc::SenderCmd;

pub(crate) struct FlowParams {
    pub fid: u32,
    pub vci: u32,
    pub writer: BqWriter,
    pub pool: IobufPool,
    pub ctrl: mpsc::UnboundedSender<SenderCmd>,
    /// Receive window we grant the peer.
    pub window: u32,
    /// Send credit the peer has granted us up front.
    pub initial_credit: u32,
    pub local_blessings: Blessings,
    pub remote_blessings: Blessings,
    pub remote_discharges: Vec<Discharge>,
}

struct RecvState {
    chain: SliceChain,
    consumed_since_grant: u32,
    remote_closed: bool,
    read_fail: Option<Error>,
}

struct FlowInner {
    fid: u32,
    vci: u32,
    writer: BqWriter,
    pool: IobufPool,
    ctrl: mpsc::UnboundedSender<SenderCmd>,
    window: u32,

    credit: Mutex<u32>,
    credit_notify: Notify,

    recv: Mutex<RecvState>,
    recv_notify: Notify,

    write_closed: AtomicBool,
    write_fail: Mutex<Option<Error>>,

    local_blessings: Blessings,
    remote_blessings: Blessings,
    remote_discharges: Vec<Discharge>,
}

/// A user-visible bidirectional byte stream over a VC. Clones share the
/// same flow; reads and writes from different tasks are serialised
/// internally.
#[derive(Clone)]
pub struct Flow {
    inner: Arc<FlowInner>,
}

impl Flow {
    pub(crate) fn new(params: FlowParams) -> Flow {
        Flow {
            inner: Arc::new(FlowInner {
                fid: params.fid,
                vci: params.vci,
                writer: params.writer,
                pool: params.pool,
                ctrl: params.ctrl,
                window: params.window,
                credit: Mutex::new(params.initial_credit),
                credit_notify: Notify::new(),
                recv: Mutex::new(RecvState {
                    chain: SliceChain::new(),
                    consumed_since_grant: 0,
                    remote_closed: false,
                    read_fail: None,
                }),
                recv_notify: Notify::new(),
                write_closed: AtomicBool::new(false),
                write_fail: Mutex::new(None),
                local_blessings: params.local_blessings,
                remote_blessings: params.remote_blessings,
                remote_discharges: params.remote_discharges,
            }),
        }
    }

    pub fn fid(&self) -> u32 {
        self.inner.fid
    }

    pub fn vci(&self) -> u32 {
        self.inner.vci
    }

    /// Blessings this end presented at handshake; stable for the flow's life.
    pub fn local_blessings(&self) -> &Blessings {
        &self.inner.local_blessings
    }

    /// Blessings the peer presented at handshake; stable for the flow's life.
    pub fn remote_blessings(&self) -> &Blessings {
        &self.inner.remote_blessings
    }

    pub fn remote_discharges(&self) -> &[Discharge] {
        &self.inner.remote_discharges
    }

    /// Send credit currently available, for observation.
    pub fn send_credit(&self) -> u32 {
        *self.inner.credit.lock()
    }

    /// Bytes received but not yet read, for observation.
    pub fn queued_bytes(&self) -> usize {
        self.inner.recv.lock().chain.len()
    }

    /// Write all of `buf`, blocking while credit or queue space is
    /// unavailable. Returns the number of bytes written (always
    /// `buf.len()` on success).
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let total = buf.len();
        let mut rest = buf;
        while !rest.is_empty() {
            let want = rest.len().min(self.inner.pool.block_size());
            let granted = self.acquire_credit(want as u32).await? as usize;
            let mut block = self.inner.pool.alloc().await;
            let copied = block.put(&rest[..granted]);
            rest = &rest[copied..];
            self.inner
                .writer
                .put(block.freeze())
                .await
                .map_err(|e| self.write_error(e))?;
        }
        Ok(total)
    }

    /// Like [`Flow::write`] but failing with a timeout error if credit and
    /// queue space cannot be obtained within `deadline`.
    pub async fn write_with_deadline(&self, buf: &[u8], deadline: Duration) -> Result<usize> {
        match tokio::time::timeout(deadline, self.write(buf)).await {
            Ok(res) => res,
            Err(_) => Err(Error::new(
                ErrorKind::Timeout,
                format!("write did not complete within {:?}", deadline),
            )),
        }
    }

    /// Read at least one byte, blocking on an empty receive chain.
    /// Returns `Ok(0)` at end of stream, after buffered bytes are drained.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.inner.recv_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut rs = self.inner.recv.lock();
                if !rs.chain.is_empty() {
                    let n = rs.chain.copy_to(buf);
                    rs.consumed_since_grant += n as u32;
                    // Refill the sender once at least half the window has
                    // been drained locally.
                    if !rs.remote_closed && rs.consumed_since_grant >= self.inner.window / 2 {
                        let bytes = rs.consumed_since_grant;
                        rs.consumed_since_grant = 0;
                        let _ = self.inner.ctrl.send(SenderCmd::Send(
                            Message::AddReceiveBuffers {
                                counters: vec![Counter {
                                    vci: self.inner.vci,
                                    fid: self.inner.fid,
                                    bytes,
                                }],
                            },
                        ));
                    }
                    return Ok(n);
                }
                if let Some(err) = &rs.read_fail {
                    return Err(err.clone());
                }
                if rs.remote_closed {
                    return Ok(0);
                }
            }

            notified.await;
        }
    }

    /// Read exactly `buf.len()` bytes. Fails with `FlowClosed` if the
    /// stream ends first.
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(Error::new(
                    ErrorKind::FlowClosed,
                    format!("stream ended after {} of {} bytes", filled, buf.len()),
                ));
            }
            filled += n;
        }
        Ok(())
    }

    /// Stop sending. Buffered bytes still drain to the peer followed by a
    /// close marker, and reads continue until the peer closes. Idempotent.
    pub fn close(&self) {
        if !self.inner.write_closed.swap(true, Ordering::AcqRel) {
            self.inner.writer.drain();
            self.inner.credit_notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.write_closed.load(Ordering::Acquire)
    }

    async fn acquire_credit(&self, want: u32) -> Result<u32> {
        loop {
            let notified = self.inner.credit_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                if self.inner.write_closed.load(Ordering::Acquire) {
                    return Err(self.write_error(Error::new(
                        ErrorKind::FlowClosed,
                        "write on closed flow",
                    )));
                }
                if let Some(err) = self.inner.write_fail.lock().clone() {
                    return Err(err);
                }
                let mut credit = self.inner.credit.lock();
                if *credit > 0 {
                    let granted = want.min(*credit);
                    *credit -= granted;
                    return Ok(granted);
                }
            }

            notified.await;
        }
    }

    /// Prefer the recorded failure reason over a generic queue error.
    fn write_error(&self, fallback: Error) -> Error {
        self.inner.write_fail.lock().clone().unwrap_or(fallback)
    }

    // -- VC-side entry points -------------------------------------------

    /// Credit granted by the peer via `AddReceiveBuffers`.
    pub(crate) fn add_credit(&self, bytes: u32) {
        let mut credit = self.inner.credit.lock();
        *credit = credit.saturating_add(bytes);
        drop(credit);
        self.inner.credit_notify.notify_waiters();
    }

    /// Payload dispatched to this flow by the VC's reader.
    pub(crate) fn push_data(&self, slice: IoSlice) {
        let mut rs = self.inner.recv.lock();
        if rs.remote_closed {
            return;
        }
        rs.chain.push(slice);
        drop(rs);
        self.inner.recv_notify.notify_waiters();
    }

    /// The peer closed the flow: reads drain then hit end of stream and
    /// writes fail.
    pub(crate) fn push_close(&self) {
        {
            let mut rs = self.inner.recv.lock();
            rs.remote_closed = true;
        }
        {
            let mut wf = self.inner.write_fail.lock();
            if wf.is_none() {
                *wf = Some(Error::new(ErrorKind::FlowClosed, "flow closed by peer"));
            }
        }
        self.inner.writer.drain();
        self.inner.recv_notify.notify_waiters();
        self.inner.credit_notify.notify_waiters();
    }

    /// VC teardown. An orderly close lets reads drain to a clean end of
    /// stream; a failure surfaces `err` on reads once drained. Writes fail
    /// with `err` either way.
    pub(crate) fn fail(&self, err: Error, orderly: bool) {
        {
            let mut wf = self.inner.write_fail.lock();
            if wf.is_none() {
                *wf = Some(err.clone());
            }
        }
        {
            let mut rs = self.inner.recv.lock();
            rs.remote_closed = true;
            if !orderly && rs.read_fail.is_none() {
                rs.read_fail = Some(err);
            }
        }
        self.inner.recv_notify.notify_waiters();
        self.inner.credit_notify.notify_waiters();
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("vci", &self.inner.vci)
            .field("fid", &self.inner.fid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bqueue::Bqueue;
    use bytes::Bytes;

    fn test_flow(initial_credit: u32, window: u32) -> (Flow, Bqueue, mpsc::UnboundedReceiver<SenderCmd>) {
        let queue = Bqueue::new();
        let (ctrl, ctrl_rx) = mpsc::unbounded_channel();
        let flow = Flow::new(FlowParams {
            fid: 2,
            vci: 1,
            writer: queue.writer(2, 4096, 1 << 20),
            pool: IobufPool::new(4096, 64),
            ctrl,
            window,
            initial_credit,
            local_blessings: Blessings::none(),
            remote_blessings: Blessings::none(),
            remote_discharges: Vec::new(),
        });
        (flow, queue, ctrl_rx)
    }

    #[tokio::test]
    async fn write_lands_in_queue() {
        let (flow, queue, _rx) = test_flow(1 << 20, 16384);
        flow.write(b"HELLO_WRLD").await.unwrap();
        let batch = queue.next().await.unwrap();
        assert_eq!(batch.fid, 2);
        assert_eq!(batch.payload_len(), 10);
    }

    #[tokio::test]
    async fn write_blocks_without_credit() {
        let (flow, _queue, _rx) = test_flow(4, 16384);
        let f2 = flow.clone();
        let pending = tokio::spawn(async move { f2.write(b"01234567").await });
        tokio::task::yield_now().await;
        // Four bytes of credit cover half the write; the rest waits.
        assert!(!pending.is_finished());

        flow.add_credit(4);
        pending.await.unwrap().unwrap();
        assert_eq!(flow.send_credit(), 0);
    }

    #[tokio::test]
    async fn read_roundtrip_and_grant() {
        let (flow, _queue, mut rx) = test_flow(0, 8);
        flow.push_data(IoSlice::from_bytes(Bytes::from_static(b"abcdefgh")));

        let mut buf = [0u8; 3];
        assert_eq!(flow.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"abc");
        // 3 < window/2 consumed: no grant yet.
        assert!(rx.try_recv().is_err());

        let mut buf = [0u8; 5];
        assert_eq!(flow.read(&mut buf).await.unwrap(), 5);
        match rx.try_recv().unwrap() {
            SenderCmd::Send(Message::AddReceiveBuffers { counters }) => {
                assert_eq!(counters.len(), 1);
                assert_eq!(counters[0].bytes, 8);
                assert_eq!(counters[0].fid, 2);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn reads_drain_then_eof_after_peer_close() {
        let (flow, _queue, _rx) = test_flow(0, 16384);
        flow.push_data(IoSlice::from_bytes(Bytes::from_static(b"tail")));
        flow.push_close();

        let mut buf = [0u8; 8];
        assert_eq!(flow.read(&mut buf).await.unwrap(), 4);
        assert_eq!(flow.read(&mut buf).await.unwrap(), 0);

        let err = flow.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FlowClosed);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_writes() {
        let (flow, queue, _rx) = test_flow(1 << 20, 16384);
        flow.write(b"last").await.unwrap();
        flow.close();
        flow.close();

        assert!(flow.write(b"more").await.is_err());

        // The queue drains buffered bytes then finishes the writer.
        let batch = queue.next().await.unwrap();
        assert_eq!(batch.payload_len(), 4);
        let batch = if batch.finished {
            batch
        } else {
            queue.next().await.unwrap()
        };
        assert!(batch.finished);
    }

    #[tokio::test]
    async fn vc_failure_surfaces_on_reads_and_writes() {
        let (flow, _queue, _rx) = test_flow(0, 16384);
        let f2 = flow.clone();
        let pending = tokio::spawn(async move { f2.write(b"blocked").await });
        tokio::task::yield_now().await;

        flow.fail(
            Error::new(ErrorKind::VcClosed, "peer disconnected"),
            false,
        );
        let err = pending.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("peer disconnected"));

        let mut buf = [0u8; 4];
        let err = flow.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VcClosed);
    }

    #[tokio::test]
    async fn orderly_close_reads_eof_not_error() {
        let (flow, _queue, _rx) = test_flow(0, 16384);
        flow.push_data(IoSlice::from_bytes(Bytes::from_static(b"bye")));
        flow.fail(Error::new(ErrorKind::VcClosed, "shutdown"), true);

        let mut buf = [0u8; 8];
        assert_eq!(flow.read(&mut buf).await.unwrap(), 3);
        assert_eq!(flow.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn write_deadline_elapses_without_credit() {
        let (flow, _queue, _rx) = test_flow(0, 16384);
        let err = flow
            .write_with_deadline(b"data", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
