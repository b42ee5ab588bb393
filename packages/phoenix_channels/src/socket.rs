//! The connection manager.
//!
//! A [`Socket`] owns the transport, every channel, and one timer queue. It is
//! sans-IO: transports report through [`Socket::handle_event`] and whoever
//! drives the socket calls [`Socket::fire_due_timers`] at
//! [`Socket::next_deadline`]. [`crate::SocketDriver`] does both on tokio.
//!
//! User callbacks never run while the socket is mid-update. They are queued and
//! drained at the end of each entry point, so a callback may freely call back
//! into the socket.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::backoff::BackoffTimer;
use crate::channel::{Channel, ChannelId, ChannelMut};
use crate::config::{endpoint_url, SocketOptions};
use crate::error::ChannelError;
use crate::message::{events, Message, Payload, Ref};
use crate::push::PushHandle;
use crate::timer::{TimerId, TimerQueue};
use crate::transport::{Transport, TransportEvent};

/// WebSocket close code for a deliberate, clean shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
}

#[derive(Clone)]
pub(crate) enum Timer {
    Reconnect,
    Heartbeat,
    Rejoin(ChannelId),
    PushTimeout(PushHandle),
}

type Task = Box<dyn FnOnce(&mut Socket)>;
type LifecycleCallback = Rc<RefCell<dyn FnMut(&mut Socket)>>;
type ErrorCallback = Rc<RefCell<dyn FnMut(&mut Socket, &str)>>;
type MessageCallback = Rc<RefCell<dyn FnMut(&mut Socket, &Message)>>;

#[derive(Default)]
struct Callbacks {
    open: Vec<LifecycleCallback>,
    close: Vec<LifecycleCallback>,
    error: Vec<ErrorCallback>,
    message: Vec<MessageCallback>,
}

pub struct Socket {
    endpoint: String,
    options: SocketOptions,
    transport: Box<dyn Transport>,
    connection: ConnectionState,
    reconnect_enabled: bool,
    ref_counter: Ref,
    next_channel_id: u64,
    pub(crate) channels: Vec<Channel>,
    send_buffer: VecDeque<Message>,
    pub(crate) timers: TimerQueue<Timer>,
    reconnect_timer: BackoffTimer<Timer>,
    heartbeat_timer: Option<TimerId>,
    tasks: VecDeque<Task>,
    draining: bool,
    callbacks: Callbacks,
}

impl Socket {
    /// Create a disconnected socket for `endpoint` (e.g.
    /// `ws://localhost:4000/socket`). Nothing happens until [`Socket::connect`].
    pub fn new(endpoint: &str, options: SocketOptions, transport: impl Transport + 'static) -> Self {
        let url = endpoint_url(endpoint, &options.params);
        let reconnect_timer = BackoffTimer::new(Timer::Reconnect, options.backoff());
        Self {
            endpoint: url,
            options,
            transport: Box::new(transport),
            connection: ConnectionState::Disconnected,
            reconnect_enabled: false,
            ref_counter: 0,
            next_channel_id: 0,
            channels: Vec::new(),
            send_buffer: VecDeque::new(),
            timers: TimerQueue::new(),
            reconnect_timer,
            heartbeat_timer: None,
            tasks: VecDeque::new(),
            draining: false,
            callbacks: Callbacks::default(),
        }
    }

    /// The full connection URL, query params included.
    pub fn endpoint_url(&self) -> &str {
        &self.endpoint
    }

    pub fn options(&self) -> &SocketOptions {
        &self.options
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Open
    }

    /// Frames waiting for the connection to open.
    pub fn buffered_frames(&self) -> usize {
        self.send_buffer.len()
    }

    /// Mint the next ref. Starts at 1 and wraps to 0 after `u64::MAX`.
    pub fn make_ref(&mut self) -> Ref {
        self.ref_counter = self.ref_counter.checked_add(1).unwrap_or(0);
        self.ref_counter
    }

    /// Start connecting and enable automatic reconnects. No-op unless
    /// disconnected.
    pub fn connect(&mut self) {
        if self.connection != ConnectionState::Disconnected {
            trace!(state = ?self.connection, "connect ignored");
            return;
        }
        self.reconnect_enabled = true;
        self.cancel_heartbeat();
        // covers a connect attempt that never opens
        self.reconnect_timer.schedule_timeout(&mut self.timers);
        self.connection = ConnectionState::Connecting;
        debug!(endpoint = %self.endpoint, tries = self.reconnect_timer.tries(), "connecting");
        self.transport.connect(&self.endpoint);
    }

    /// Tear down the current connection. Channels error out and rejoin once
    /// the socket is open again; a reconnect is scheduled unless `close` was
    /// called.
    pub fn disconnect(&mut self, code: u16) {
        self.teardown(code);
        self.run_pending();
    }

    fn teardown(&mut self, code: u16) {
        if self.connection == ConnectionState::Disconnected {
            self.cancel_heartbeat();
            return;
        }
        debug!(code, "disconnecting");
        self.transport.disconnect(code);
        self.connection_lost(None);
    }

    /// Disconnect cleanly and stop reconnecting until the next `connect`.
    pub fn close(&mut self) {
        info!(endpoint = %self.endpoint, "closing socket");
        self.reconnect_enabled = false;
        self.teardown(NORMAL_CLOSURE);
        self.reconnect_timer.reset(&mut self.timers);
        self.run_pending();
    }

    pub fn on_open(&mut self, callback: impl FnMut(&mut Socket) + 'static) {
        self.callbacks.open.push(Rc::new(RefCell::new(callback)));
    }

    pub fn on_close(&mut self, callback: impl FnMut(&mut Socket) + 'static) {
        self.callbacks.close.push(Rc::new(RefCell::new(callback)));
    }

    pub fn on_error(&mut self, callback: impl FnMut(&mut Socket, &str) + 'static) {
        self.callbacks.error.push(Rc::new(RefCell::new(callback)));
    }

    /// Observe every decoded inbound message before channel dispatch.
    pub fn on_message(&mut self, callback: impl FnMut(&mut Socket, &Message) + 'static) {
        self.callbacks.message.push(Rc::new(RefCell::new(callback)));
    }

    /// Create a channel for `topic`. `params` are sent with every join.
    pub fn channel(&mut self, topic: &str, params: Payload) -> ChannelId {
        self.next_channel_id += 1;
        let id = ChannelId(self.next_channel_id);
        self.channels.push(Channel::new(
            id,
            topic,
            params,
            self.options.timeout(),
            self.options.backoff(),
        ));
        debug!(topic, channel = %id, "channel created");
        id
    }

    pub fn channel_mut(&mut self, id: ChannelId) -> Result<ChannelMut<'_>, ChannelError> {
        if self.find_channel(id).is_none() {
            return Err(ChannelError::NotFound(id));
        }
        Ok(ChannelMut::new(self, id))
    }

    pub fn find_channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.iter().find(|channel| channel.id() == id)
    }

    pub(crate) fn find_channel_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|channel| channel.id() == id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    /// Forget a channel, along with any channel sharing its join ref, and
    /// cancel their timers.
    pub fn remove(&mut self, id: ChannelId) {
        let Some(join_ref) = self.find_channel(id).map(Channel::join_ref) else {
            return;
        };
        let (removed, kept): (Vec<Channel>, Vec<Channel>) = std::mem::take(&mut self.channels)
            .into_iter()
            .partition(|channel| {
                channel.id() == id || (join_ref.is_some() && channel.join_ref() == join_ref)
            });
        self.channels = kept;
        for mut channel in removed {
            channel.release_timers(&mut self.timers);
            debug!(topic = %channel.topic(), channel = %channel.id(), "channel removed");
        }
    }

    /// Transmit now when connected, otherwise queue until the next open.
    pub fn push(&mut self, message: Message) {
        if self.is_connected() {
            self.transmit(&message);
        } else {
            trace!(topic = %message.topic(), event = %message.event(), "buffering frame");
            self.send_buffer.push_back(message);
        }
    }

    fn transmit(&mut self, message: &Message) {
        match message.encode() {
            Ok(text) => {
                trace!(topic = %message.topic(), event = %message.event(), ref_id = ?message.ref_id(), "send");
                self.transport.send(text);
            }
            Err(err) => warn!(error = %err, event = %message.event(), "failed to encode frame"),
        }
    }

    fn flush_send_buffer(&mut self) {
        if !self.is_connected() {
            return;
        }
        while let Some(message) = self.send_buffer.pop_front() {
            self.transmit(&message);
        }
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.handle_open(),
            TransportEvent::Close(reason) => self.handle_close(reason),
            TransportEvent::Text(text) => self.handle_text(&text),
        }
    }

    pub fn handle_open(&mut self) {
        if self.connection == ConnectionState::Disconnected {
            trace!("open for a torn-down connection ignored");
            return;
        }
        info!(endpoint = %self.endpoint, "connected");
        self.connection = ConnectionState::Open;
        self.flush_send_buffer();
        self.reconnect_timer.reset(&mut self.timers);
        self.cancel_heartbeat();
        self.heartbeat_timer = Some(
            self.timers
                .schedule(self.options.heartbeat_interval(), Timer::Heartbeat),
        );
        for callback in self.callbacks.open.clone() {
            self.defer(move |socket| (callback.borrow_mut())(socket));
        }
        self.run_pending();
    }

    /// The connection ended; `reason` is set when it ended with an error.
    /// A close for a connection the socket already tore down is ignored.
    pub fn handle_close(&mut self, reason: Option<String>) {
        if self.connection == ConnectionState::Disconnected {
            trace!("close for a torn-down connection ignored");
            return;
        }
        self.connection_lost(reason);
        self.run_pending();
    }

    /// Error every channel, stop the heartbeat, schedule a reconnect and queue
    /// the lifecycle callbacks.
    fn connection_lost(&mut self, reason: Option<String>) {
        match &reason {
            Some(reason) => warn!(endpoint = %self.endpoint, reason = %reason, "connection error"),
            None => info!(endpoint = %self.endpoint, "connection closed"),
        }
        self.connection = ConnectionState::Disconnected;

        let payload = match &reason {
            Some(reason) => json!({ "reason": reason }),
            None => json!({}),
        };
        let targets: Vec<(ChannelId, String)> = self
            .channels
            .iter()
            .map(|channel| (channel.id(), channel.topic().to_string()))
            .collect();
        for (id, topic) in targets {
            self.trigger(id, Message::new(topic, events::ERROR, payload.clone(), None));
        }

        self.cancel_heartbeat();
        if self.reconnect_enabled {
            self.reconnect_timer.schedule_timeout(&mut self.timers);
        }
        match reason {
            Some(reason) => {
                for callback in self.callbacks.error.clone() {
                    let reason = reason.clone();
                    self.defer(move |socket| (callback.borrow_mut())(socket, &reason));
                }
            }
            None => {
                for callback in self.callbacks.close.clone() {
                    self.defer(move |socket| (callback.borrow_mut())(socket));
                }
            }
        }
    }

    /// Decode one inbound frame and route it to every channel on its topic.
    /// Malformed frames are dropped.
    pub fn handle_text(&mut self, text: &str) {
        let message = match Message::decode(text) {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "dropping malformed frame");
                return;
            }
        };
        trace!(
            topic = %message.topic(),
            event = %message.event(),
            ref_id = ?message.ref_id(),
            "receive"
        );
        for callback in self.callbacks.message.clone() {
            let message = message.clone();
            self.defer(move |socket| (callback.borrow_mut())(socket, &message));
        }
        let targets: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|channel| channel.is_member(message.topic()))
            .map(Channel::id)
            .collect();
        for id in targets {
            self.trigger(id, message.clone());
        }
        self.run_pending();
    }

    /// Earliest pending timer deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Run every timer due now. Timers armed while handling these wait for the
    /// next call.
    pub fn fire_due_timers(&mut self) {
        let now = Instant::now();
        let due: Vec<(TimerId, Timer)> = std::iter::from_fn(|| self.timers.pop_due(now)).collect();
        for (id, timer) in due {
            match timer {
                Timer::Reconnect => self.reconnect(id),
                Timer::Heartbeat => self.send_heartbeat(id),
                Timer::Rejoin(channel) => self.rejoin_timer_fired(channel, id),
                Timer::PushTimeout(push) => self.push_timed_out(&push, id),
            }
        }
        self.run_pending();
    }

    pub(crate) fn defer(&mut self, task: impl FnOnce(&mut Socket) + 'static) {
        self.tasks.push_back(Box::new(task));
    }

    /// Run queued callbacks in order, including any they queue. Calls made
    /// from inside a callback return immediately; the outer drain picks up the
    /// new work.
    pub fn run_pending(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        while let Some(task) = self.tasks.pop_front() {
            task(self);
        }
        self.draining = false;
    }

    pub fn has_pending(&self) -> bool {
        !self.tasks.is_empty()
    }

    fn reconnect(&mut self, timer: TimerId) {
        if !self.reconnect_timer.fire(timer) {
            return;
        }
        info!(
            endpoint = %self.endpoint,
            tries = self.reconnect_timer.tries(),
            "reconnecting"
        );
        self.teardown(NORMAL_CLOSURE);
        self.connect();
    }

    fn send_heartbeat(&mut self, timer: TimerId) {
        if self.heartbeat_timer != Some(timer) {
            return;
        }
        self.heartbeat_timer = None;
        if !self.is_connected() {
            return;
        }
        let ref_id = self.make_ref();
        self.push(Message::heartbeat(ref_id));
        self.heartbeat_timer = Some(
            self.timers
                .schedule(self.options.heartbeat_interval(), Timer::Heartbeat),
        );
    }

    fn cancel_heartbeat(&mut self) {
        if let Some(timer) = self.heartbeat_timer.take() {
            self.timers.cancel(timer);
        }
    }

    #[cfg(test)]
    pub(crate) fn set_ref_counter(&mut self, value: Ref) {
        self.ref_counter = value;
    }

    #[cfg(test)]
    pub(crate) fn pending_timers(&self) -> usize {
        self.timers.len()
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("endpoint", &self.endpoint)
            .field("connection", &self.connection)
            .field("channels", &self.channels)
            .field("buffered", &self.send_buffer.len())
            .finish()
    }
}
