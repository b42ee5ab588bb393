//! The seam between the protocol core and the physical connection.
//!
//! The core drives a [`Transport`] through `connect`/`send`/`disconnect` and is
//! fed [`TransportEvent`]s back via [`Socket::handle_event`](crate::Socket::handle_event).
//! After `disconnect` returns, the transport must not deliver further events
//! for the connection it tore down. Transports that report from other tasks
//! can use [`event_channel`], which tags every event with a connection epoch
//! and drops events from superseded epochs on receipt.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::trace;

/// Events a transport reports for its current connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    /// The connection ended. `Some(reason)` when it ended with an error.
    Close(Option<String>),
    Text(String),
}

pub trait Transport {
    /// Start connecting to `url`. Completion is reported with `TransportEvent::Open`.
    fn connect(&mut self, url: &str);

    /// Send one text frame on the open connection.
    fn send(&mut self, text: String);

    /// Close the current connection, if any, with a WebSocket close code.
    fn disconnect(&mut self, code: u16);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn connect(&mut self, url: &str) {
        (**self).connect(url)
    }

    fn send(&mut self, text: String) {
        (**self).send(text)
    }

    fn disconnect(&mut self, code: u16) {
        (**self).disconnect(code)
    }
}

/// Sending half of an epoch-tagged event channel.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    epoch: Arc<AtomicU64>,
}

impl EventSender {
    /// Start a new epoch. Events sent under any earlier epoch are dropped.
    pub fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns false once the receiver is gone.
    pub fn send(&self, epoch: u64, event: TransportEvent) -> bool {
        self.tx.send((epoch, event)).is_ok()
    }
}

/// Receiving half of an epoch-tagged event channel.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
    epoch: Arc<AtomicU64>,
}

impl EventReceiver {
    /// Next event of the current epoch. Cancel safe.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        while let Some((epoch, event)) = self.rx.recv().await {
            if epoch == self.epoch.load(Ordering::SeqCst) {
                return Some(event);
            }
            trace!(epoch, ?event, "dropping event from a superseded connection");
        }
        None
    }
}

pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let epoch = Arc::new(AtomicU64::new(0));
    (
        EventSender {
            tx,
            epoch: epoch.clone(),
        },
        EventReceiver { rx, epoch },
    )
}
