//! [`Transport`] over `tokio-tungstenite`.
//!
//! Each `connect` spawns one task that owns the stream: it reports `Open`,
//! forwards inbound text frames, writes outbound frames in order and reports
//! `Close` when the stream ends. `disconnect` sends a close frame and stops the
//! task; anything it still emits is dropped by the epoch check.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::transport::{EventReceiver, EventSender, Transport, TransportEvent, event_channel};

enum Outgoing {
    Text(String),
    Close(u16),
}

struct Connection {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    cancel: CancellationToken,
}

/// WebSocket transport. Must be used from within a tokio runtime.
pub struct WebSocketTransport {
    events: EventSender,
    connection: Option<Connection>,
}

impl WebSocketTransport {
    /// Create the transport and the receiver its events arrive on.
    pub fn new() -> (Self, EventReceiver) {
        let (events, receiver) = event_channel();
        (
            Self {
                events,
                connection: None,
            },
            receiver,
        )
    }
}

impl Transport for WebSocketTransport {
    fn connect(&mut self, url: &str) {
        if let Some(previous) = self.connection.take() {
            previous.cancel.cancel();
        }
        let epoch = self.events.next_epoch();
        let (outgoing, commands) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run_connection(
            url.to_string(),
            epoch,
            commands,
            self.events.clone(),
            cancel.clone(),
        ));
        self.connection = Some(Connection { outgoing, cancel });
    }

    fn send(&mut self, text: String) {
        let delivered = self
            .connection
            .as_ref()
            .is_some_and(|connection| connection.outgoing.send(Outgoing::Text(text)).is_ok());
        if !delivered {
            debug!("no live connection, dropping frame");
        }
    }

    fn disconnect(&mut self, code: u16) {
        self.events.next_epoch();
        if let Some(connection) = self.connection.take() {
            let _ = connection.outgoing.send(Outgoing::Close(code));
            connection.cancel.cancel();
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.cancel.cancel();
        }
    }
}

async fn run_connection(
    url: String,
    epoch: u64,
    mut commands: mpsc::UnboundedReceiver<Outgoing>,
    events: EventSender,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => return,
        result = tokio_tungstenite::connect_async(url.as_str()) => result,
    };
    let stream = match connected {
        Ok((stream, _response)) => stream,
        Err(err) => {
            debug!(url = %url, error = %err, "websocket connect failed");
            events.send(epoch, TransportEvent::Close(Some(err.to_string())));
            return;
        }
    };
    trace!(url = %url, epoch, "websocket open");
    events.send(epoch, TransportEvent::Open);

    let reason = match pump(stream, &mut commands, &events, epoch, &cancel).await {
        Ok(()) => None,
        Err(err) => {
            debug!(url = %url, error = %err, "websocket closed with error");
            Some(err.to_string())
        }
    };
    events.send(epoch, TransportEvent::Close(reason));
}

async fn pump(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    commands: &mut mpsc::UnboundedReceiver<Outgoing>,
    events: &EventSender,
    epoch: u64,
    cancel: &CancellationToken,
) -> Result<(), TransportError> {
    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            // queued frames (a final close included) go out before cancellation
            biased;

            command = commands.recv() => match command {
                Some(Outgoing::Text(text)) => write.send(WsMessage::Text(text.into())).await?,
                Some(Outgoing::Close(code)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: "".into(),
                    };
                    let _ = write.send(WsMessage::Close(Some(frame))).await;
                    return Ok(());
                }
                None => return Ok(()),
            },

            _ = cancel.cancelled() => return Ok(()),

            frame = read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    events.send(epoch, TransportEvent::Text(text.as_str().to_owned()));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    trace!(?frame, "close frame from server");
                    return Ok(());
                }
                // tungstenite answers pings itself; binary frames are not part of the protocol
                Some(Ok(_)) => {}
                Some(Err(tungstenite::Error::ConnectionClosed)) => return Ok(()),
                Some(Err(err)) => return Err(err.into()),
                None => return Err(TransportError::ClosedByPeer),
            },
        }
    }
}
