//! Drives a [`Socket`] on tokio.
//!
//! The socket is single-threaded (its callbacks are not `Send`), so the driver
//! runs on the task that owns it, e.g. the main future or a `LocalSet`. Other
//! tasks reach it through a cloneable [`SocketHandle`].

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::DriverError;
use crate::socket::Socket;
use crate::transport::EventReceiver;

type Command = Box<dyn FnOnce(&mut Socket) + Send>;

/// Sends work to a running [`SocketDriver`].
#[derive(Clone)]
pub struct SocketHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SocketHandle {
    /// Run `f` against the socket on the driver's task.
    pub fn run(&self, f: impl FnOnce(&mut Socket) + Send + 'static) -> Result<(), DriverError> {
        self.commands
            .send(Box::new(f))
            .map_err(|_| DriverError::Closed)
    }

    pub fn connect(&self) -> Result<(), DriverError> {
        self.run(Socket::connect)
    }

    pub fn close(&self) -> Result<(), DriverError> {
        self.run(Socket::close)
    }
}

pub struct SocketDriver {
    socket: Socket,
    events: EventReceiver,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl SocketDriver {
    pub fn new(socket: Socket, events: EventReceiver) -> (Self, SocketHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        (
            Self {
                socket,
                events,
                commands,
            },
            SocketHandle { commands: tx },
        )
    }

    /// Direct access for setup before the loop starts.
    pub fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    /// Feed transport events, commands and timers to the socket until `cancel`
    /// fires, then hand the socket back.
    pub async fn run_until(mut self, cancel: CancellationToken) -> Socket {
        info!(endpoint = %self.socket.endpoint_url(), "socket driver started");
        loop {
            self.socket.run_pending();
            let deadline = self.socket.next_deadline();
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = self.events.recv() => self.socket.handle_event(event),
                Some(command) = self.commands.recv() => command(&mut self.socket),
                _ = sleep_until(deadline) => self.socket.fire_due_timers(),
            }
        }
        debug!("socket driver stopped");
        self.socket
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::config::SocketOptions;
    use crate::message::{Message, events};
    use crate::transport::{EventSender, Transport, TransportEvent, event_channel};

    /// Opens immediately and acknowledges every join.
    struct LoopbackServer {
        events: EventSender,
        epoch: u64,
        sent: Arc<Mutex<Vec<Message>>>,
    }

    impl Transport for LoopbackServer {
        fn connect(&mut self, _url: &str) {
            self.epoch = self.events.next_epoch();
            self.events.send(self.epoch, TransportEvent::Open);
        }

        fn send(&mut self, text: String) {
            let message = Message::decode(&text).unwrap();
            if message.event() == events::JOIN {
                let reply = Message::new(
                    message.topic(),
                    events::REPLY,
                    json!({"status": "ok", "response": {}}),
                    message.ref_id(),
                );
                self.events
                    .send(self.epoch, TransportEvent::Text(reply.encode().unwrap()));
            }
            self.sent.lock().unwrap().push(message);
        }

        fn disconnect(&mut self, _code: u16) {
            self.events.next_epoch();
        }
    }

    fn driver() -> (SocketDriver, SocketHandle, Arc<Mutex<Vec<Message>>>) {
        let (events, receiver) = event_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = LoopbackServer {
            events,
            epoch: 0,
            sent: sent.clone(),
        };
        let socket = Socket::new("ws://example.test/socket", SocketOptions::default(), transport);
        let (driver, handle) = SocketDriver::new(socket, receiver);
        (driver, handle, sent)
    }

    #[tokio::test(start_paused = true)]
    async fn joins_and_heartbeats() {
        let (mut driver, handle, sent) = driver();
        let id = driver.socket_mut().channel("room:lobby", json!({}));
        let cancel = CancellationToken::new();

        let script = async {
            handle.connect().unwrap();
            handle
                .run(move |socket| {
                    if let Ok(channel) = socket.channel_mut(id) {
                        let _ = channel.join();
                    }
                })
                .unwrap();
            tokio::time::sleep(Duration::from_secs(31)).await;
            cancel.cancel();
        };
        let (socket, ()) = tokio::join!(driver.run_until(cancel.clone()), script);

        assert!(socket.is_connected());
        assert!(socket.find_channel(id).unwrap().is_joined());
        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].event(), events::JOIN);
        assert!(sent.iter().any(|m| m.event() == events::HEARTBEAT));
    }

    #[tokio::test]
    async fn handle_reports_stopped_driver() {
        let (driver, handle, _sent) = driver();
        drop(driver);
        assert_eq!(handle.connect(), Err(DriverError::Closed));
    }
}
