//! Server-side acceptance of incoming flows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, ErrorKind, Result};
use crate::flow::Flow;

/// State shared between a [`Listener`] and the VC that feeds it.
pub(crate) struct ListenerShared {
    tx: Mutex<Option<mpsc::UnboundedSender<Flow>>>,
    closed: AtomicBool,
    fail: Mutex<Option<Error>>,
}

impl ListenerShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Hand an accepted flow to the listener. `false` if it is gone.
    pub(crate) fn deliver(&self, flow: Flow) -> bool {
        if self.is_closed() {
            return false;
        }
        match &*self.tx.lock() {
            Some(tx) => tx.send(flow).is_ok(),
            None => false,
        }
    }

    /// Fail pending and future accepts with the VC's close reason.
    pub(crate) fn fail(&self, err: Error) {
        {
            let mut fail = self.fail.lock();
            if fail.is_none() {
                *fail = Some(err);
            }
        }
        self.tx.lock().take();
    }
}

/// Accepts flows opened by the peer. At most one exists per VC.
pub struct Listener {
    shared: Arc<ListenerShared>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Flow>>,
}

impl Listener {
    pub(crate) fn new() -> (Listener, Arc<ListenerShared>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ListenerShared {
            tx: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            fail: Mutex::new(None),
        });
        (
            Listener {
                shared: shared.clone(),
                rx: tokio::sync::Mutex::new(rx),
            },
            shared,
        )
    }

    /// The next incoming flow, blocking until one arrives.
    pub async fn accept(&self) -> Result<Flow> {
        if self.shared.is_closed() {
            return Err(Error::new(ErrorKind::FlowClosed, "listener closed"));
        }
        match self.rx.lock().await.recv().await {
            Some(flow) => Ok(flow),
            None => Err(self
                .shared
                .fail
                .lock()
                .clone()
                .unwrap_or_else(|| Error::new(ErrorKind::FlowClosed, "listener closed"))),
        }
    }

    /// Stop accepting: pending accepts fail and the VC refuses subsequent
    /// open-flow requests.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.tx.lock().take();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}
