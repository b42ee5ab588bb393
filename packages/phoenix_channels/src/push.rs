//! Outbound requests awaiting a correlated reply.
//!
//! A push is owned jointly by the caller's [`PushHandle`] and, while it waits,
//! by the reply binding on its channel and its timeout timer. Exactly one reply
//! (`"ok"`, `"error"`, `"timeout"`, ...) resolves it per send.

use std::cell::{Ref as CellRef, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, trace};

use crate::channel::{ChannelId, Handler};
use crate::message::{reply_event_name, Message, Payload, Ref};
use crate::socket::{Socket, Timer};
use crate::timer::TimerId;

/// Status delivered when no reply arrives in time.
pub const TIMEOUT: &str = "timeout";

pub type ReplyCallback = Rc<RefCell<dyn FnMut(&mut Socket, &Payload)>>;

/// A decoded `phx_reply` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: String,
    pub response: Payload,
}

impl Reply {
    /// A missing or non-string status reads as `"error"`, a missing response
    /// as `null`.
    pub fn from_payload(payload: &Payload) -> Self {
        Self {
            status: payload
                .get("status")
                .and_then(Payload::as_str)
                .unwrap_or("error")
                .to_string(),
            response: payload.get("response").cloned().unwrap_or(Payload::Null),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushKind {
    Join,
    Leave,
    Message,
}

pub(crate) struct Push {
    pub(crate) channel: ChannelId,
    pub(crate) topic: String,
    pub(crate) kind: PushKind,
    pub(crate) event: String,
    pub(crate) payload: Payload,
    pub(crate) timeout: Duration,
    pub(crate) ref_id: Option<Ref>,
    pub(crate) ref_event: Option<String>,
    pub(crate) reply_binding: Option<crate::channel::BindingRef>,
    pub(crate) timeout_timer: Option<TimerId>,
    hooks: Vec<(String, ReplyCallback)>,
    received: Option<Reply>,
    sent: bool,
}

/// Shared handle to a push. Cloning does not copy the request.
#[derive(Clone)]
pub struct PushHandle {
    inner: Rc<RefCell<Push>>,
}

impl PushHandle {
    pub(crate) fn new(
        channel: ChannelId,
        topic: impl Into<String>,
        kind: PushKind,
        event: impl Into<String>,
        payload: Payload,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Push {
                channel,
                topic: topic.into(),
                kind,
                event: event.into(),
                payload,
                timeout,
                ref_id: None,
                ref_event: None,
                reply_binding: None,
                timeout_timer: None,
                hooks: Vec::new(),
                received: None,
                sent: false,
            })),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.inner.borrow().channel
    }

    pub fn event(&self) -> String {
        self.inner.borrow().event.clone()
    }

    pub fn payload(&self) -> Payload {
        self.inner.borrow().payload.clone()
    }

    /// The ref of the current send, once one has been assigned.
    pub fn ref_id(&self) -> Option<Ref> {
        self.inner.borrow().ref_id
    }

    pub fn timeout(&self) -> Duration {
        self.inner.borrow().timeout
    }

    /// Whether the frame has been handed to the socket for the current send.
    pub fn is_sent(&self) -> bool {
        self.inner.borrow().sent
    }

    /// The reply that resolved the current send.
    pub fn received(&self) -> Option<Reply> {
        self.inner.borrow().received.clone()
    }

    pub fn has_received(&self, status: &str) -> bool {
        self.inner
            .borrow()
            .received
            .as_ref()
            .is_some_and(|reply| reply.status == status)
    }

    pub fn ptr_eq(&self, other: &PushHandle) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn kind(&self) -> PushKind {
        self.inner.borrow().kind
    }

    pub(crate) fn borrow(&self) -> CellRef<'_, Push> {
        self.inner.borrow()
    }

    pub(crate) fn borrow_mut(&self) -> RefMut<'_, Push> {
        self.inner.borrow_mut()
    }
}

impl fmt::Debug for PushHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let push = self.inner.borrow();
        f.debug_struct("PushHandle")
            .field("channel", &push.channel)
            .field("event", &push.event)
            .field("ref_id", &push.ref_id)
            .field("sent", &push.sent)
            .field("received", &push.received)
            .finish()
    }
}

/// A push borrowed together with its socket, for chaining reply hooks:
///
/// ```ignore
/// socket.channel_mut(id)?
///     .push("ping", json!({}))?
///     .receive("ok", |_, response| println!("{response}"))
///     .receive("timeout", |_, _| println!("no answer"));
/// ```
pub struct PushMut<'a> {
    socket: &'a mut Socket,
    push: PushHandle,
}

impl<'a> PushMut<'a> {
    pub(crate) fn new(socket: &'a mut Socket, push: PushHandle) -> Self {
        Self { socket, push }
    }

    /// See [`Socket::receive`].
    pub fn receive(
        self,
        status: &str,
        callback: impl FnMut(&mut Socket, &Payload) + 'static,
    ) -> Self {
        self.socket.receive(&self.push, status, callback);
        self
    }

    pub fn handle(&self) -> PushHandle {
        self.push.clone()
    }

    pub fn ref_id(&self) -> Option<Ref> {
        self.push.ref_id()
    }

    pub fn into_handle(self) -> PushHandle {
        self.push
    }
}

impl Socket {
    /// Register `callback` for replies with `status`. Hooks for one status run
    /// in registration order. If the push already holds a reply with that
    /// status the callback also runs immediately.
    pub fn receive(
        &mut self,
        push: &PushHandle,
        status: &str,
        callback: impl FnMut(&mut Socket, &Payload) + 'static,
    ) {
        let callback: ReplyCallback = Rc::new(RefCell::new(callback));
        let late = push.received().filter(|reply| reply.status == status);
        if let Some(reply) = late {
            (callback.borrow_mut())(self, &reply.response);
        }
        push.borrow_mut().hooks.push((status.to_string(), callback));
    }

    /// Borrow `push` with this socket for chaining.
    pub fn push_mut(&mut self, push: &PushHandle) -> PushMut<'_> {
        PushMut::new(self, push.clone())
    }

    /// Hand the push's frame to the socket, starting its timeout first if no
    /// ref is assigned yet. A push that already timed out is not sent.
    pub(crate) fn send_push(&mut self, push: &PushHandle) {
        if push.has_received(TIMEOUT) {
            trace!(event = %push.event(), "push already timed out, not sending");
            return;
        }
        if self.find_channel(push.channel()).is_none() {
            trace!(event = %push.event(), "push for removed channel, not sending");
            return;
        }
        self.start_push_timeout(push);
        let message = {
            let mut p = push.borrow_mut();
            p.sent = true;
            Message::new(p.topic.clone(), p.event.clone(), p.payload.clone(), p.ref_id)
        };
        self.push(message);
    }

    /// Send again under a fresh ref, forgetting any previous reply.
    pub(crate) fn resend_push(&mut self, push: &PushHandle, timeout: Duration) {
        self.cancel_push(push);
        {
            let mut p = push.borrow_mut();
            p.timeout = timeout;
            p.ref_id = None;
            p.ref_event = None;
            p.received = None;
            p.sent = false;
        }
        self.send_push(push);
    }

    /// Assign a ref, bind the reply event and arm the timeout. No-op once a ref
    /// is assigned.
    pub(crate) fn start_push_timeout(&mut self, push: &PushHandle) {
        if push.ref_id().is_some() {
            return;
        }
        let channel_id = push.channel();
        let ref_id = self.make_ref();
        let ref_event = reply_event_name(ref_id);
        let Some(channel) = self.find_channel_mut(channel_id) else {
            return;
        };
        let binding = channel.bind(&ref_event, Handler::Reply(push.clone()));
        let timer = self
            .timers
            .schedule(push.timeout(), Timer::PushTimeout(push.clone()));

        let mut p = push.borrow_mut();
        p.ref_id = Some(ref_id);
        p.ref_event = Some(ref_event);
        p.reply_binding = Some(binding);
        p.timeout_timer = Some(timer);
    }

    /// Drop the reply binding and timeout timer. Idempotent.
    pub(crate) fn cancel_push(&mut self, push: &PushHandle) {
        let (binding, timer) = {
            let mut p = push.borrow_mut();
            (p.reply_binding.take(), p.timeout_timer.take())
        };
        if let Some(timer) = timer {
            self.timers.cancel(timer);
        }
        if let Some(binding) = binding {
            if let Some(channel) = self.find_channel_mut(push.channel()) {
                channel.unbind(binding);
            }
        }
    }

    /// Resolve the push locally as if `{status, response}` had arrived.
    pub(crate) fn trigger_push(&mut self, push: &PushHandle, status: &str, response: Payload) {
        let (channel, topic, ref_event) = {
            let p = push.borrow();
            (p.channel, p.topic.clone(), p.ref_event.clone())
        };
        let Some(ref_event) = ref_event else {
            return;
        };
        let payload = json!({ "status": status, "response": response });
        self.trigger(channel, Message::new(topic, ref_event, payload, None));
    }

    pub(crate) fn push_timed_out(&mut self, push: &PushHandle, timer: TimerId) {
        {
            let mut p = push.borrow_mut();
            if p.timeout_timer != Some(timer) {
                return;
            }
            p.timeout_timer = None;
        }
        debug!(event = %push.event(), ref_id = ?push.ref_id(), "push timed out");
        self.trigger_push(push, TIMEOUT, json!({}));
    }

    /// Record a reply, apply the channel's reaction for join and leave pushes,
    /// then queue the matching hooks.
    pub(crate) fn resolve_push(&mut self, push: &PushHandle, payload: &Payload) {
        self.cancel_push(push);
        let reply = Reply::from_payload(payload);
        let hooks: Vec<ReplyCallback> = {
            let mut p = push.borrow_mut();
            p.received = Some(reply.clone());
            p.hooks
                .iter()
                .filter(|(status, _)| *status == reply.status)
                .map(|(_, callback)| callback.clone())
                .collect()
        };
        trace!(event = %push.event(), status = %reply.status, "push resolved");

        let channel = push.channel();
        match (push.kind(), reply.status.as_str()) {
            (PushKind::Join, "ok") => self.channel_joined(channel),
            (PushKind::Join, TIMEOUT) => self.join_timed_out(channel),
            (PushKind::Leave, "ok" | TIMEOUT) => self.leave_completed(channel),
            _ => {}
        }

        for hook in hooks {
            let response = reply.response.clone();
            self.defer(move |socket| (hook.borrow_mut())(socket, &response));
        }
    }
}
