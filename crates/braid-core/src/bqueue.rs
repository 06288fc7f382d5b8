//! Deficit round-robin buffered queue.
//!
//! Many per-flow writers share one reader (the VC's sender loop). Each
//! writer owns a quantum of bytes per rotation; its deficit accumulates
//! across visits until the slice at the head of its FIFO fits. Within one
//! writer the FIFO order is preserved; across writers only fairness up to
//! the quanta is promised.
//!
//! A writer marked *drained* accepts no further slices; once its FIFO
//! empties the reader removes it and the batch is flagged `finished`, which
//! is how the sender learns to emit a close marker for the flow. Closing
//! the queue terminates the reader and fails every pending writer
//! operation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, ErrorKind, Result};
use crate::iobuf::IoSlice;

/// Bytes a writer may yield per DRR rotation unless configured otherwise.
pub const DEFAULT_QUANTUM: usize = 4096;

/// One reader-visible batch: slices popped from a single writer.
#[derive(Debug)]
pub struct Batch {
    pub fid: u32,
    pub slices: Vec<IoSlice>,
    /// The writer was drained and has now been removed; `slices` (possibly
    /// empty) are the last bytes it will ever yield.
    pub finished: bool,
}

impl Batch {
    pub fn payload_len(&self) -> usize {
        self.slices.iter().map(|s| s.len()).sum()
    }
}

struct WriterState {
    quantum: usize,
    deficit: usize,
    cap: usize,
    fifo: VecDeque<IoSlice>,
    buffered: usize,
    drained: bool,
    in_active: bool,
}

struct State {
    writers: HashMap<u32, WriterState>,
    /// Rotation order; holds fids with queued data or a pending removal.
    active: VecDeque<u32>,
    closed: bool,
}

/// The shared queue. Cloning shares the same scheduler state.
#[derive(Clone)]
pub struct Bqueue {
    state: Arc<Mutex<State>>,
    data: Arc<Notify>,
    space: Arc<Notify>,
}

impl Bqueue {
    pub fn new() -> Self {
        Bqueue {
            state: Arc::new(Mutex::new(State {
                writers: HashMap::new(),
                active: VecDeque::new(),
                closed: false,
            })),
            data: Arc::new(Notify::new()),
            space: Arc::new(Notify::new()),
        }
    }

    /// Register a writer. `cap` bounds bytes buffered but not yet popped;
    /// a single slice larger than `cap` is still accepted when the FIFO is
    /// empty so writers can always make progress.
    pub fn writer(&self, fid: u32, quantum: usize, cap: usize) -> BqWriter {
        let mut st = self.state.lock();
        st.writers.insert(
            fid,
            WriterState {
                quantum,
                deficit: 0,
                cap,
                fifo: VecDeque::new(),
                buffered: 0,
                drained: false,
                in_active: false,
            },
        );
        BqWriter {
            fid,
            queue: self.clone(),
        }
    }

    /// Pop the next batch, waiting for data. `None` once the queue closes.
    pub async fn next(&self) -> Option<Batch> {
        loop {
            let notified = self.data.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut spin = false;
            {
                let mut st = self.state.lock();
                if st.closed {
                    return None;
                }
                let rotation = st.active.len();
                for _ in 0..rotation {
                    let Some(fid) = st.active.pop_front() else {
                        break;
                    };
                    let Some(w) = st.writers.get_mut(&fid) else {
                        continue;
                    };
                    w.deficit += w.quantum;

                    let mut slices = Vec::new();
                    let mut popped = 0;
                    while let Some(head) = w.fifo.front() {
                        if head.len() > w.deficit {
                            break;
                        }
                        w.deficit -= head.len();
                        popped += head.len();
                        slices.push(w.fifo.pop_front().expect("head checked above"));
                    }
                    w.buffered -= popped;
                    if popped > 0 {
                        self.space.notify_waiters();
                    }

                    if w.fifo.is_empty() {
                        w.deficit = 0;
                        if w.drained {
                            st.writers.remove(&fid);
                            return Some(Batch {
                                fid,
                                slices,
                                finished: true,
                            });
                        }
                        w.in_active = false;
                        if !slices.is_empty() {
                            return Some(Batch {
                                fid,
                                slices,
                                finished: false,
                            });
                        }
                    } else {
                        st.active.push_back(fid);
                        if !slices.is_empty() {
                            return Some(Batch {
                                fid,
                                slices,
                                finished: false,
                            });
                        }
                        // Head larger than the accumulated deficit: let the
                        // deficit grow on the next rotation.
                        spin = true;
                    }
                }
                if !st.active.is_empty() {
                    spin = true;
                }
            }

            if !spin {
                notified.await;
            }
        }
    }

    /// Terminate the reader and fail all pending writer operations.
    pub fn close(&self) {
        {
            let mut st = self.state.lock();
            st.closed = true;
            st.writers.clear();
            st.active.clear();
        }
        self.data.notify_one();
        self.space.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Default for Bqueue {
    fn default() -> Self {
        Bqueue::new()
    }
}

/// Handle for one flow's outbound slices.
#[derive(Clone)]
pub struct BqWriter {
    fid: u32,
    queue: Bqueue,
}

impl BqWriter {
    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// Enqueue a slice, waiting while the writer's buffer is full.
    pub async fn put(&self, slice: IoSlice) -> Result<()> {
        loop {
            let notified = self.queue.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = self.queue.state.lock();
                if st.closed {
                    return Err(Error::new(ErrorKind::VcClosed, "buffered queue closed"));
                }
                let Some(w) = st.writers.get_mut(&self.fid) else {
                    return Err(Error::new(ErrorKind::FlowClosed, "writer removed"));
                };
                if w.drained {
                    return Err(Error::new(ErrorKind::FlowClosed, "write after close"));
                }
                if w.buffered + slice.len() <= w.cap || w.fifo.is_empty() {
                    w.buffered += slice.len();
                    w.fifo.push_back(slice);
                    if !w.in_active {
                        w.in_active = true;
                        st.active.push_back(self.fid);
                    }
                    self.queue.data.notify_one();
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Refuse further writes; the reader drains the FIFO then removes the
    /// writer, yielding a `finished` batch. Idempotent.
    pub fn drain(&self) {
        let mut st = self.queue.state.lock();
        if st.closed {
            return;
        }
        if let Some(w) = st.writers.get_mut(&self.fid) {
            w.drained = true;
            if !w.in_active {
                w.in_active = true;
                st.active.push_back(self.fid);
            }
            self.queue.data.notify_one();
        }
    }
}
