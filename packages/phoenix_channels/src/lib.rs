//! Client for the Phoenix channels protocol.
//!
//! One [`Socket`] multiplexes many topic [`Channel`]s over a single transport
//! connection. Channels join with params, push events and receive correlated
//! replies (`"ok"`, `"error"`, `"timeout"`), get broadcasts through event
//! bindings, and rejoin by themselves after errors. The socket keeps the
//! connection alive with heartbeats and reconnects with backoff.
//!
//! The protocol core is synchronous and transport-agnostic. Pair it with
//! [`WebSocketTransport`] and [`SocketDriver`] to run it on tokio:
//!
//! ```no_run
//! use phoenix_channels::{Socket, SocketDriver, SocketOptions, WebSocketTransport};
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), phoenix_channels::ChannelError> {
//! let (transport, events) = WebSocketTransport::new();
//! let mut socket = Socket::new("ws://localhost:4000/socket", SocketOptions::default(), transport);
//! let lobby = socket.channel("room:lobby", json!({"user": "jo"}));
//! socket.channel_mut(lobby)?.on("shout", |_, payload, _| println!("{payload}"))?;
//! socket
//!     .channel_mut(lobby)?
//!     .join()?
//!     .receive("ok", |_, _| println!("joined"));
//! socket.connect();
//!
//! let (driver, _handle) = SocketDriver::new(socket, events);
//! driver.run_until(CancellationToken::new()).await;
//! # Ok(())
//! # }
//! ```
//!
//! Presence snapshots and diffs are reconciled with the pure functions in
//! [`presence`].

mod backoff;
mod channel;
mod config;
mod error;
mod message;
pub mod presence;
mod push;
mod runtime;
mod socket;
mod timer;
mod transport;
#[cfg(feature = "websocket")]
mod websocket;

#[cfg(test)]
mod test_support;

pub use backoff::{Backoff, DEFAULT_BACKOFF_MS};
pub use channel::{BindingCallback, BindingRef, Channel, ChannelId, ChannelMut, ChannelState};
pub use config::{SocketOptions, endpoint_url};
pub use error::{ChannelError, DriverError, FrameError};
#[cfg(feature = "websocket")]
pub use error::TransportError;
pub use message::{Message, PHOENIX_TOPIC, Payload, Ref, events, reply_event_name};
pub use push::{PushHandle, PushMut, Reply, ReplyCallback, TIMEOUT};
pub use runtime::{SocketDriver, SocketHandle};
pub use socket::{ConnectionState, NORMAL_CLOSURE, Socket};
pub use timer::TimerId;
pub use transport::{EventReceiver, EventSender, Transport, TransportEvent, event_channel};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
