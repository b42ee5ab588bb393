//! Topic subscriptions and their lifecycle.
//!
//! State transitions:
//!
//! ```text
//! closed  --join-->          joining
//! joining --ok-->            joined    (flushes buffered pushes)
//! joining --timeout/error--> errored   (rejoin scheduled)
//! joined  --phx_error-->     errored   (rejoin scheduled)
//! errored --rejoin timer-->  joining   (only while connected)
//! any     --leave-->         leaving
//! leaving --ok/timeout-->    closed    (channel removed from socket)
//! any     --phx_close-->     closed    (channel removed from socket)
//! ```
//!
//! Channels live inside the [`Socket`]; callers address them by [`ChannelId`]
//! and operate on them through [`ChannelMut`].

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, trace, warn};

use crate::backoff::{Backoff, BackoffTimer};
use crate::error::ChannelError;
use crate::message::{events, reply_event_name, Message, Payload, Ref};
use crate::push::{PushHandle, PushKind, PushMut};
use crate::socket::{Socket, Timer};
use crate::timer::TimerQueue;

/// Identifies a channel within its socket.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ChannelId(pub(crate) u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Errored,
    Joining,
    Joined,
    Leaving,
}

/// Returned by [`ChannelMut::on`] to remove that one binding later.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct BindingRef(u64);

pub type BindingCallback = Rc<RefCell<dyn FnMut(&mut Socket, &Payload, Option<Ref>)>>;

type MessageHook = Box<dyn FnMut(&str, &Payload, Option<Ref>) -> Option<Payload>>;

#[derive(Clone)]
pub(crate) enum Handler {
    /// Resolves a push waiting on its `chan_reply_<ref>` event.
    Reply(PushHandle),
    User {
        callback: BindingCallback,
        /// Cleared by `off` so already-queued invocations are skipped.
        active: Rc<Cell<bool>>,
    },
}

struct Binding {
    id: BindingRef,
    event: String,
    handler: Handler,
}

impl Binding {
    fn deactivate(&self) {
        if let Handler::User { active, .. } = &self.handler {
            active.set(false);
        }
    }
}

pub struct Channel {
    id: ChannelId,
    topic: String,
    params: Payload,
    state: ChannelState,
    joined_once: bool,
    timeout: Duration,
    bindings: Vec<Binding>,
    next_binding: u64,
    push_buffer: Vec<PushHandle>,
    join_push: PushHandle,
    rejoin_timer: BackoffTimer<Timer>,
    message_hook: Option<MessageHook>,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        topic: impl Into<String>,
        params: Payload,
        timeout: Duration,
        backoff: Backoff,
    ) -> Self {
        let topic = topic.into();
        let join_push = PushHandle::new(
            id,
            topic.clone(),
            PushKind::Join,
            events::JOIN,
            params.clone(),
            timeout,
        );
        Self {
            id,
            topic,
            params,
            state: ChannelState::Closed,
            joined_once: false,
            timeout,
            bindings: Vec::new(),
            next_binding: 0,
            push_buffer: Vec::new(),
            join_push,
            rejoin_timer: BackoffTimer::new(Timer::Rejoin(id), backoff),
            message_hook: None,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn params(&self) -> &Payload {
        &self.params
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    pub fn is_errored(&self) -> bool {
        self.state == ChannelState::Errored
    }

    pub fn is_joining(&self) -> bool {
        self.state == ChannelState::Joining
    }

    pub fn is_joined(&self) -> bool {
        self.state == ChannelState::Joined
    }

    pub fn is_leaving(&self) -> bool {
        self.state == ChannelState::Leaving
    }

    /// The join push, e.g. to attach more reply hooks via [`Socket::receive`].
    pub fn join_push(&self) -> &PushHandle {
        &self.join_push
    }

    /// Ref of the most recent join attempt.
    pub fn join_ref(&self) -> Option<Ref> {
        self.join_push.ref_id()
    }

    pub fn is_member(&self, topic: &str) -> bool {
        self.topic == topic
    }

    /// Pushes waiting for the channel to join.
    pub fn buffered_pushes(&self) -> usize {
        self.push_buffer.len()
    }

    pub(crate) fn bind(&mut self, event: &str, handler: Handler) -> BindingRef {
        self.next_binding += 1;
        let id = BindingRef(self.next_binding);
        self.bindings.push(Binding {
            id,
            event: event.to_string(),
            handler,
        });
        id
    }

    pub(crate) fn unbind(&mut self, id: BindingRef) {
        self.bindings.retain(|binding| {
            let keep = binding.id != id;
            if !keep {
                binding.deactivate();
            }
            keep
        });
    }

    /// Remove user bindings for `event`, all of them or just `only`. Internal
    /// reply bindings are never touched.
    fn unbind_user(&mut self, event: &str, only: Option<BindingRef>) {
        self.bindings.retain(|binding| {
            let matches = binding.event == event
                && matches!(binding.handler, Handler::User { .. })
                && only.is_none_or(|id| id == binding.id);
            if matches {
                binding.deactivate();
            }
            !matches
        });
    }

    fn handlers_for(&self, event: &str) -> Vec<Handler> {
        self.bindings
            .iter()
            .filter(|binding| binding.event == event)
            .map(|binding| binding.handler.clone())
            .collect()
    }

    /// Lifecycle frames carrying a ref from an earlier join are stale.
    fn is_stale(&self, message: &Message) -> bool {
        match message.ref_id() {
            Some(ref_id) => {
                events::LIFECYCLE.contains(&message.event()) && Some(ref_id) != self.join_ref()
            }
            None => false,
        }
    }

    fn apply_message_hook(&mut self, message: &Message) -> Payload {
        match self.message_hook.as_mut() {
            Some(hook) => hook(message.event(), message.payload(), message.ref_id())
                .unwrap_or_else(|| message.payload().clone()),
            None => message.payload().clone(),
        }
    }

    /// Cancel every timer this channel owns. Used when the socket forgets it.
    pub(crate) fn release_timers(&mut self, timers: &mut TimerQueue<Timer>) {
        self.rejoin_timer.reset(timers);
        let pushes = self
            .bindings
            .iter()
            .filter_map(|binding| match &binding.handler {
                Handler::Reply(push) => Some(push),
                Handler::User { .. } => None,
            })
            .chain(self.push_buffer.iter())
            .chain(std::iter::once(&self.join_push));
        for push in pushes {
            if let Some(timer) = push.borrow_mut().timeout_timer.take() {
                timers.cancel(timer);
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("state", &self.state)
            .field("join_ref", &self.join_ref())
            .field("bindings", &self.bindings.len())
            .field("buffered", &self.push_buffer.len())
            .finish()
    }
}

/// A channel borrowed together with its socket.
pub struct ChannelMut<'a> {
    socket: &'a mut Socket,
    id: ChannelId,
}

impl<'a> ChannelMut<'a> {
    pub(crate) fn new(socket: &'a mut Socket, id: ChannelId) -> Self {
        Self { socket, id }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.socket.find_channel(self.id)
    }

    /// `Closed` once the channel has been removed from the socket.
    pub fn state(&self) -> ChannelState {
        self.channel()
            .map(Channel::state)
            .unwrap_or(ChannelState::Closed)
    }

    /// Join the topic with the channel's params. Allowed once per channel;
    /// rejoins after errors happen automatically.
    pub fn join(self) -> Result<PushMut<'a>, ChannelError> {
        self.join_with_timeout(None)
    }

    pub fn join_with_timeout(self, timeout: Option<Duration>) -> Result<PushMut<'a>, ChannelError> {
        let ChannelMut { socket, id } = self;
        let push = socket.join_channel(id, timeout)?;
        Ok(PushMut::new(socket, push))
    }

    /// Push `event` to the topic. Buffered until joined when the channel or
    /// socket is not ready; the timeout runs from now either way.
    pub fn push(self, event: &str, payload: Payload) -> Result<PushMut<'a>, ChannelError> {
        let ChannelMut { socket, id } = self;
        let push = socket.push_to_channel(id, event, payload, None)?;
        Ok(PushMut::new(socket, push))
    }

    pub fn push_with_timeout(
        self,
        event: &str,
        payload: Payload,
        timeout: Duration,
    ) -> Result<PushMut<'a>, ChannelError> {
        let ChannelMut { socket, id } = self;
        let push = socket.push_to_channel(id, event, payload, Some(timeout))?;
        Ok(PushMut::new(socket, push))
    }

    /// Leave the topic. The channel closes on the server's `"ok"` or on
    /// timeout, and immediately when the socket is not connected.
    pub fn leave(self) -> Result<PushMut<'a>, ChannelError> {
        self.leave_with_timeout(None)
    }

    pub fn leave_with_timeout(self, timeout: Option<Duration>) -> Result<PushMut<'a>, ChannelError> {
        let ChannelMut { socket, id } = self;
        let push = socket.leave_channel(id, timeout)?;
        Ok(PushMut::new(socket, push))
    }

    /// Subscribe to `event`. Callbacks run in subscription order.
    pub fn on(
        &mut self,
        event: &str,
        callback: impl FnMut(&mut Socket, &Payload, Option<Ref>) + 'static,
    ) -> Result<BindingRef, ChannelError> {
        let channel = self
            .socket
            .find_channel_mut(self.id)
            .ok_or(ChannelError::NotFound(self.id))?;
        Ok(channel.bind(
            event,
            Handler::User {
                callback: Rc::new(RefCell::new(callback)),
                active: Rc::new(Cell::new(true)),
            },
        ))
    }

    pub fn on_close(
        &mut self,
        callback: impl FnMut(&mut Socket, &Payload, Option<Ref>) + 'static,
    ) -> Result<BindingRef, ChannelError> {
        self.on(events::CLOSE, callback)
    }

    pub fn on_error(
        &mut self,
        callback: impl FnMut(&mut Socket, &Payload, Option<Ref>) + 'static,
    ) -> Result<BindingRef, ChannelError> {
        self.on(events::ERROR, callback)
    }

    /// Remove every user binding for `event`, or only `binding` when given.
    pub fn off(&mut self, event: &str, binding: Option<BindingRef>) {
        if let Some(channel) = self.socket.find_channel_mut(self.id) {
            channel.unbind_user(event, binding);
        }
    }

    /// Install a hook that may rewrite inbound payloads before bindings see
    /// them. Returning `None` keeps the original payload. A reply is passed
    /// through once, as `phx_reply`; the push it resolves sees the rewritten
    /// payload.
    pub fn set_message_hook(
        &mut self,
        hook: impl FnMut(&str, &Payload, Option<Ref>) -> Option<Payload> + 'static,
    ) {
        if let Some(channel) = self.socket.find_channel_mut(self.id) {
            channel.message_hook = Some(Box::new(hook));
        }
    }
}

impl Socket {
    pub(crate) fn join_channel(
        &mut self,
        id: ChannelId,
        timeout: Option<Duration>,
    ) -> Result<PushHandle, ChannelError> {
        let channel = self
            .find_channel_mut(id)
            .ok_or(ChannelError::NotFound(id))?;
        if channel.joined_once {
            return Err(ChannelError::AlreadyJoined {
                topic: channel.topic.clone(),
            });
        }
        channel.joined_once = true;
        let join_push = channel.join_push.clone();
        self.rejoin(id, timeout);
        Ok(join_push)
    }

    /// Resend the join under a fresh ref. No-op while joining or leaving.
    pub(crate) fn rejoin(&mut self, id: ChannelId, timeout: Option<Duration>) {
        let Some(channel) = self.find_channel_mut(id) else {
            return;
        };
        if matches!(channel.state, ChannelState::Joining | ChannelState::Leaving) {
            trace!(topic = %channel.topic, state = ?channel.state, "skipping rejoin");
            return;
        }
        let timeout = timeout.unwrap_or(channel.timeout);
        channel.state = ChannelState::Joining;
        let join_push = channel.join_push.clone();
        debug!(topic = %channel.topic, "joining");
        self.resend_push(&join_push, timeout);
    }

    /// The rejoin timer fired: rejoin if connected, otherwise try again later.
    pub(crate) fn rejoin_timer_fired(&mut self, id: ChannelId, timer: crate::timer::TimerId) {
        let connected = self.is_connected();
        let Some(channel) = self.channels.iter_mut().find(|channel| channel.id == id) else {
            return;
        };
        if !channel.rejoin_timer.fire(timer) {
            return;
        }
        if connected {
            self.rejoin(id, None);
        } else {
            trace!(topic = %channel.topic, "socket down, deferring rejoin");
            channel.rejoin_timer.schedule_timeout(&mut self.timers);
        }
    }

    pub(crate) fn push_to_channel(
        &mut self,
        id: ChannelId,
        event: &str,
        payload: Payload,
        timeout: Option<Duration>,
    ) -> Result<PushHandle, ChannelError> {
        let connected = self.is_connected();
        let channel = self
            .find_channel_mut(id)
            .ok_or(ChannelError::NotFound(id))?;
        if !channel.joined_once {
            return Err(ChannelError::NotJoined {
                topic: channel.topic.clone(),
                event: event.to_string(),
            });
        }
        let push = PushHandle::new(
            id,
            channel.topic.clone(),
            PushKind::Message,
            event,
            payload,
            timeout.unwrap_or(channel.timeout),
        );
        if connected && channel.is_joined() {
            self.send_push(&push);
        } else {
            trace!(topic = %channel.topic, event, "buffering push until joined");
            channel.push_buffer.push(push.clone());
            self.start_push_timeout(&push);
        }
        Ok(push)
    }

    pub(crate) fn leave_channel(
        &mut self,
        id: ChannelId,
        timeout: Option<Duration>,
    ) -> Result<PushHandle, ChannelError> {
        let channel = self
            .channels
            .iter_mut()
            .find(|channel| channel.id == id)
            .ok_or(ChannelError::NotFound(id))?;
        channel.state = ChannelState::Leaving;
        channel.rejoin_timer.reset(&mut self.timers);
        let timeout = timeout.unwrap_or(channel.timeout);
        let topic = channel.topic.clone();
        let join_push = channel.join_push.clone();
        debug!(topic = %topic, "leaving");

        self.cancel_push(&join_push);
        let leave_push = PushHandle::new(id, topic, PushKind::Leave, events::LEAVE, json!({}), timeout);
        self.send_push(&leave_push);
        if !self.is_connected() {
            self.trigger_push(&leave_push, "ok", json!({}));
            self.run_pending();
        }
        Ok(leave_push)
    }

    /// Dispatch an inbound message to a channel: built-in lifecycle handling
    /// runs synchronously, user bindings are queued.
    pub(crate) fn trigger(&mut self, id: ChannelId, message: Message) {
        self.dispatch(id, message, true);
    }

    /// `rewrite` is off for the per-push reply event, whose payload already
    /// went through the message hook as `phx_reply`.
    fn dispatch(&mut self, id: ChannelId, message: Message, rewrite: bool) {
        let Some(channel) = self.find_channel_mut(id) else {
            return;
        };
        if channel.is_stale(&message) {
            trace!(
                topic = %channel.topic,
                event = %message.event(),
                ref_id = ?message.ref_id(),
                "dropping stale lifecycle message"
            );
            return;
        }
        let payload = if rewrite {
            channel.apply_message_hook(&message)
        } else {
            message.payload().clone()
        };
        let handlers = channel.handlers_for(message.event());
        let topic = channel.topic.clone();
        let ref_id = message.ref_id();

        match message.event() {
            events::REPLY => {
                if let Some(ref_id) = ref_id {
                    let reply = Message::new(topic, reply_event_name(ref_id), payload.clone(), Some(ref_id));
                    self.dispatch(id, reply, false);
                }
            }
            events::CLOSE => self.channel_closed(id),
            events::ERROR => self.channel_errored(id),
            _ => {}
        }

        for handler in handlers {
            match handler {
                Handler::Reply(push) => self.resolve_push(&push, &payload),
                Handler::User { callback, active } => {
                    let payload = payload.clone();
                    self.defer(move |socket| {
                        if active.get() {
                            (callback.borrow_mut())(socket, &payload, ref_id);
                        }
                    });
                }
            }
        }
    }

    pub(crate) fn channel_joined(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.iter_mut().find(|channel| channel.id == id) else {
            return;
        };
        channel.state = ChannelState::Joined;
        channel.rejoin_timer.reset(&mut self.timers);
        let buffered = std::mem::take(&mut channel.push_buffer);
        debug!(topic = %channel.topic, buffered = buffered.len(), "joined");
        for push in buffered {
            self.send_push(&push);
        }
    }

    pub(crate) fn join_timed_out(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.iter_mut().find(|channel| channel.id == id) else {
            return;
        };
        warn!(topic = %channel.topic, "join timed out");
        channel.state = ChannelState::Errored;
        channel.rejoin_timer.schedule_timeout(&mut self.timers);
    }

    pub(crate) fn leave_completed(&mut self, id: ChannelId) {
        let Some(channel) = self.find_channel(id) else {
            return;
        };
        let close = Message::new(
            channel.topic.clone(),
            events::CLOSE,
            json!("leave"),
            channel.join_ref(),
        );
        self.trigger(id, close);
    }

    fn channel_closed(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.iter_mut().find(|channel| channel.id == id) else {
            return;
        };
        debug!(topic = %channel.topic, "channel closed");
        channel.rejoin_timer.reset(&mut self.timers);
        channel.state = ChannelState::Closed;
        self.remove(id);
    }

    fn channel_errored(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.iter_mut().find(|channel| channel.id == id) else {
            return;
        };
        if matches!(channel.state, ChannelState::Leaving | ChannelState::Closed) {
            trace!(topic = %channel.topic, state = ?channel.state, "ignoring error");
            return;
        }
        debug!(topic = %channel.topic, "channel errored");
        let was_joining = channel.is_joining();
        channel.state = ChannelState::Errored;
        channel.rejoin_timer.schedule_timeout(&mut self.timers);
        let join_push = channel.join_push.clone();
        if was_joining {
            self.cancel_push(&join_push);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::push::TIMEOUT;
    use crate::test_support::{connected_socket, frame, reply_frame, socket_with_log};

    fn joined(socket: &mut Socket, log: &crate::test_support::Log, topic: &str) -> ChannelId {
        let id = socket.channel(topic, json!({}));
        socket.channel_mut(id).unwrap().join().unwrap();
        socket.handle_text(&reply_frame(topic, log.last_ref(), "ok", json!({})));
        assert!(socket.find_channel(id).unwrap().is_joined());
        id
    }

    #[test]
    fn channel_id_display() {
        assert_eq!(ChannelId(3).to_string(), "chan-3");
    }

    #[tokio::test(start_paused = true)]
    async fn join_sends_params_and_joins_on_ok() {
        let (mut socket, log) = connected_socket();
        let id = socket.channel("room:lobby", json!({"foo": "bar"}));
        assert!(socket.find_channel(id).unwrap().is_closed());

        let join = socket.channel_mut(id).unwrap().join().unwrap().into_handle();
        assert!(socket.find_channel(id).unwrap().is_joining());

        let sent = log.sent();
        let frame = sent.last().unwrap();
        assert_eq!(frame.topic(), "room:lobby");
        assert_eq!(frame.event(), events::JOIN);
        assert_eq!(frame.payload(), &json!({"foo": "bar"}));
        assert_eq!(frame.ref_id(), join.ref_id());

        socket.handle_text(&reply_frame("room:lobby", frame.ref_id().unwrap(), "ok", json!({})));
        assert!(socket.find_channel(id).unwrap().is_joined());
        assert_eq!(socket.find_channel(id).unwrap().join_ref(), join.ref_id());
    }

    #[tokio::test(start_paused = true)]
    async fn join_twice_is_an_error() {
        let (mut socket, _log) = connected_socket();
        let id = socket.channel("room:lobby", json!({}));
        socket.channel_mut(id).unwrap().join().unwrap();
        let err = socket.channel_mut(id).unwrap().join().err().unwrap();
        assert_eq!(err.error_code(), "already_joined");
    }

    #[tokio::test(start_paused = true)]
    async fn push_before_join_is_an_error() {
        let (mut socket, _log) = connected_socket();
        let id = socket.channel("room:lobby", json!({}));
        let err = socket
            .channel_mut(id)
            .unwrap()
            .push("ping", json!({}))
            .err()
            .unwrap();
        assert_eq!(
            err,
            ChannelError::NotJoined {
                topic: "room:lobby".into(),
                event: "ping".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_pushes_flush_in_order_on_join() {
        let (mut socket, log) = connected_socket();
        let id = socket.channel("room:lobby", json!({}));
        socket.channel_mut(id).unwrap().join().unwrap();
        let join_ref = log.last_ref();

        for n in 0..3 {
            socket
                .channel_mut(id)
                .unwrap()
                .push("msg", json!({"n": n}))
                .unwrap();
        }
        assert_eq!(socket.find_channel(id).unwrap().buffered_pushes(), 3);
        let before = log.sent().len();

        socket.handle_text(&reply_frame("room:lobby", join_ref, "ok", json!({})));
        let flushed: Vec<Payload> = log.sent()[before..]
            .iter()
            .map(|m| m.payload().clone())
            .collect();
        assert_eq!(flushed, vec![json!({"n": 0}), json!({"n": 1}), json!({"n": 2})]);
        assert_eq!(socket.find_channel(id).unwrap().buffered_pushes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_push_times_out_without_join() {
        let (mut socket, _log) = connected_socket();
        let id = socket.channel("room:lobby", json!({}));
        socket
            .channel_mut(id)
            .unwrap()
            .join_with_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let push = socket
            .channel_mut(id)
            .unwrap()
            .push_with_timeout("msg", json!({}), Duration::from_millis(100))
            .unwrap()
            .into_handle();
        assert!(!push.is_sent());

        tokio::time::advance(Duration::from_millis(100)).await;
        socket.fire_due_timers();
        assert!(push.has_received(TIMEOUT));
        assert!(!push.is_sent());
    }

    #[tokio::test(start_paused = true)]
    async fn join_timeout_errors_and_rejoins() {
        let (mut socket, log) = connected_socket();
        let id = socket.channel("room:lobby", json!({}));
        socket
            .channel_mut(id)
            .unwrap()
            .join_with_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let first_ref = log.last_ref();

        tokio::time::advance(Duration::from_millis(500)).await;
        socket.fire_due_timers();
        assert!(socket.find_channel(id).unwrap().is_errored());

        // rejoin after the first backoff step
        tokio::time::advance(Duration::from_secs(1)).await;
        socket.fire_due_timers();
        let channel = socket.find_channel(id).unwrap();
        assert!(channel.is_joining());
        let second_ref = log.last_ref();
        assert!(second_ref > first_ref);
        assert_eq!(channel.join_ref(), Some(second_ref));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_lifecycle_frames_are_ignored() {
        let (mut socket, log) = connected_socket();
        let id = socket.channel("room:lobby", json!({}));
        socket
            .channel_mut(id)
            .unwrap()
            .join_with_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let stale_ref = log.last_ref();

        tokio::time::advance(Duration::from_millis(500)).await;
        socket.fire_due_timers();
        tokio::time::advance(Duration::from_secs(1)).await;
        socket.fire_due_timers();
        assert!(socket.find_channel(id).unwrap().is_joining());

        let errors = Rc::new(RefCell::new(0));
        let count = errors.clone();
        socket
            .channel_mut(id)
            .unwrap()
            .on_error(move |_, _, _| *count.borrow_mut() += 1)
            .unwrap();

        // late reply to the first join has no binding left
        socket.handle_text(&reply_frame("room:lobby", stale_ref, "ok", json!({})));
        assert!(socket.find_channel(id).unwrap().is_joining());

        // lifecycle events tagged with the old join ref are dropped
        socket.handle_text(&frame("room:lobby", events::ERROR, json!({}), Some(stale_ref)));
        socket.handle_text(&frame("room:lobby", events::CLOSE, json!({}), Some(stale_ref)));
        assert!(socket.find_channel(id).unwrap().is_joining());
        assert_eq!(*errors.borrow(), 0);

        let current = log.last_ref();
        socket.handle_text(&reply_frame("room:lobby", current, "ok", json!({})));
        assert!(socket.find_channel(id).unwrap().is_joined());
    }

    #[tokio::test(start_paused = true)]
    async fn bindings_receive_broadcasts_in_order() {
        let (mut socket, log) = connected_socket();
        let id = joined(&mut socket, &log, "room:lobby");

        let seen = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = (seen.clone(), seen.clone());
        let mut channel = socket.channel_mut(id).unwrap();
        channel
            .on("shout", move |_, payload, _| a.borrow_mut().push(("a", payload["body"].clone())))
            .unwrap();
        channel
            .on("shout", move |_, payload, _| b.borrow_mut().push(("b", payload["body"].clone())))
            .unwrap();

        socket.handle_text(&frame("room:lobby", "shout", json!({"body": "hi"}), None));
        socket.handle_text(&frame("room:other", "shout", json!({"body": "nope"}), None));
        assert_eq!(
            *seen.borrow(),
            vec![("a", json!("hi")), ("b", json!("hi"))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn off_removes_one_or_all_user_bindings() {
        let (mut socket, log) = connected_socket();
        let id = joined(&mut socket, &log, "room:lobby");

        let seen = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = (seen.clone(), seen.clone());
        let mut channel = socket.channel_mut(id).unwrap();
        let first = channel.on("shout", move |_, _, _| a.borrow_mut().push("a")).unwrap();
        channel.on("shout", move |_, _, _| b.borrow_mut().push("b")).unwrap();
        channel.off("shout", Some(first));

        socket.handle_text(&frame("room:lobby", "shout", json!({}), None));
        assert_eq!(*seen.borrow(), vec!["b"]);

        socket.channel_mut(id).unwrap().off("shout", None);
        socket.handle_text(&frame("room:lobby", "shout", json!({}), None));
        assert_eq!(*seen.borrow(), vec!["b"]);

        // reply bindings survive a blanket off on their event
        let push = socket
            .channel_mut(id)
            .unwrap()
            .push("ping", json!({}))
            .unwrap()
            .into_handle();
        let ref_id = push.ref_id().unwrap();
        socket.channel_mut(id).unwrap().off(&reply_event_name(ref_id), None);
        socket.handle_text(&reply_frame("room:lobby", ref_id, "ok", json!({})));
        assert!(push.has_received("ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn off_skips_already_queued_invocations() {
        let (mut socket, log) = connected_socket();
        let id = joined(&mut socket, &log, "room:lobby");

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut channel = socket.channel_mut(id).unwrap();
        // the first binding unsubscribes the second before it runs
        channel
            .on("shout", move |socket, _, _| {
                if let Ok(mut channel) = socket.channel_mut(id) {
                    channel.off("shout", None);
                }
            })
            .unwrap();
        channel
            .on("shout", move |_, _, _| sink.borrow_mut().push("late"))
            .unwrap();

        socket.handle_text(&frame("room:lobby", "shout", json!({}), None));
        assert!(seen.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn bindings_added_during_dispatch_wait_for_the_next_message() {
        let (mut socket, log) = connected_socket();
        let id = joined(&mut socket, &log, "room:lobby");

        let seen = Rc::new(RefCell::new(0));
        let sink = seen.clone();
        socket
            .channel_mut(id)
            .unwrap()
            .on("shout", move |socket, _, _| {
                let sink = sink.clone();
                if let Ok(mut channel) = socket.channel_mut(id) {
                    let _ = channel.on("shout", move |_, _, _| *sink.borrow_mut() += 1);
                }
            })
            .unwrap();

        socket.handle_text(&frame("room:lobby", "shout", json!({}), None));
        assert_eq!(*seen.borrow(), 0);

        socket.handle_text(&frame("room:lobby", "shout", json!({}), None));
        assert_eq!(*seen.borrow(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn message_hook_rewrites_payloads() {
        let (mut socket, log) = connected_socket();
        let id = joined(&mut socket, &log, "room:lobby");

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut channel = socket.channel_mut(id).unwrap();
        channel.set_message_hook(|event, payload, _| {
            (event == "shout").then(|| json!({"wrapped": payload.clone()}))
        });
        channel
            .on("shout", move |_, payload, _| sink.borrow_mut().push(payload.clone()))
            .unwrap();

        socket.handle_text(&frame("room:lobby", "shout", json!({"n": 1}), None));
        assert_eq!(*seen.borrow(), vec![json!({"wrapped": {"n": 1}})]);
    }

    #[tokio::test(start_paused = true)]
    async fn message_hook_sees_each_reply_once() {
        let (mut socket, log) = connected_socket();
        let id = joined(&mut socket, &log, "room:lobby");

        let hooked = Rc::new(RefCell::new(Vec::new()));
        let sink = hooked.clone();
        let mut channel = socket.channel_mut(id).unwrap();
        // a second pass would read its own marker and bump it
        channel.set_message_hook(move |event, payload, _| {
            sink.borrow_mut().push(event.to_string());
            let passes = payload.get("passes").and_then(Payload::as_u64).unwrap_or(0);
            let mut payload = payload.clone();
            payload["passes"] = json!(passes + 1);
            Some(payload)
        });

        let responses = Rc::new(RefCell::new(Vec::new()));
        let out = responses.clone();
        let push = socket
            .channel_mut(id)
            .unwrap()
            .push("ping", json!({}))
            .unwrap()
            .receive("ok", move |_, response| out.borrow_mut().push(response.clone()))
            .into_handle();
        let ref_id = push.ref_id().unwrap();
        socket.handle_text(&reply_frame("room:lobby", ref_id, "ok", json!({"pong": true})));

        assert_eq!(*hooked.borrow(), vec![events::REPLY.to_string()]);
        assert_eq!(push.received().map(|reply| reply.status), Some("ok".to_string()));
        assert_eq!(*responses.borrow(), vec![json!({"pong": true})]);
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_then_rejoin() {
        let (mut socket, log) = connected_socket();
        let id = joined(&mut socket, &log, "room:lobby");
        let join_ref = socket.find_channel(id).unwrap().join_ref();

        socket.handle_text(&frame("room:lobby", events::ERROR, json!({}), join_ref));
        assert!(socket.find_channel(id).unwrap().is_errored());

        // pushes while errored are buffered
        socket
            .channel_mut(id)
            .unwrap()
            .push("msg", json!({}))
            .unwrap();
        assert_eq!(socket.find_channel(id).unwrap().buffered_pushes(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        socket.fire_due_timers();
        assert!(socket.find_channel(id).unwrap().is_joining());
        let rejoin = log.sent().last().cloned().unwrap();
        assert_eq!(rejoin.event(), events::JOIN);

        socket.handle_text(&reply_frame("room:lobby", rejoin.ref_id().unwrap(), "ok", json!({})));
        assert!(socket.find_channel(id).unwrap().is_joined());
        assert_eq!(log.sent().last().unwrap().event(), "msg");
    }

    #[tokio::test(start_paused = true)]
    async fn leave_closes_and_removes_on_ok() {
        let (mut socket, log) = connected_socket();
        let id = joined(&mut socket, &log, "room:lobby");

        let closed = Rc::new(RefCell::new(Vec::new()));
        let sink = closed.clone();
        socket
            .channel_mut(id)
            .unwrap()
            .on_close(move |_, payload, _| sink.borrow_mut().push(payload.clone()))
            .unwrap();

        let leave = socket.channel_mut(id).unwrap().leave().unwrap().into_handle();
        assert!(socket.find_channel(id).unwrap().is_leaving());
        let frame = log.sent().last().cloned().unwrap();
        assert_eq!(frame.event(), events::LEAVE);
        assert_eq!(frame.payload(), &json!({}));

        // errors while leaving are ignored
        let join_ref = socket.find_channel(id).unwrap().join_ref();
        socket.handle_text(&crate::test_support::frame("room:lobby", events::ERROR, json!({}), join_ref));
        assert!(socket.find_channel(id).unwrap().is_leaving());

        socket.handle_text(&reply_frame("room:lobby", leave.ref_id().unwrap(), "ok", json!({})));
        assert!(socket.find_channel(id).is_none());
        assert_eq!(*closed.borrow(), vec![json!("leave")]);
    }

    #[tokio::test(start_paused = true)]
    async fn leave_while_disconnected_closes_immediately() {
        let (mut socket, _log) = socket_with_log();
        let id = socket.channel("room:lobby", json!({}));
        socket.channel_mut(id).unwrap().join().unwrap();

        let oks = Rc::new(RefCell::new(0));
        let count = oks.clone();
        socket
            .channel_mut(id)
            .unwrap()
            .leave()
            .unwrap()
            .receive("ok", move |_, _| *count.borrow_mut() += 1);
        assert!(socket.find_channel(id).is_none());
        // the reply resolved before the hook was attached, so it ran late
        assert_eq!(*oks.borrow(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn leave_times_out_and_still_closes() {
        let (mut socket, log) = connected_socket();
        let id = joined(&mut socket, &log, "room:lobby");
        socket
            .channel_mut(id)
            .unwrap()
            .leave_with_timeout(Some(Duration::from_millis(200)))
            .unwrap();

        tokio::time::advance(Duration::from_millis(200)).await;
        socket.fire_due_timers();
        assert!(socket.find_channel(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn server_close_removes_channel() {
        let (mut socket, log) = connected_socket();
        let id = joined(&mut socket, &log, "room:lobby");
        let join_ref = socket.find_channel(id).unwrap().join_ref();
        socket.handle_text(&frame("room:lobby", events::CLOSE, json!({}), join_ref));
        assert!(socket.find_channel(id).is_none());
        assert!(socket.channel_mut(id).is_err());
    }
}
