//! Wiring for one chat session: join, push, log what comes back.

use std::cell::RefCell;
use std::rc::Rc;

use phoenix_channels::presence::{self, PresenceEntry, PresenceState};
use phoenix_channels::{ChannelError, ChannelId, Payload, Socket, TIMEOUT, events};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Log socket lifecycle changes and every broadcast on `topic`.
pub fn log_traffic(socket: &mut Socket, topic: &str) {
    socket.on_open(|_| info!("socket open"));
    socket.on_close(|_| info!("socket closed"));
    socket.on_error(|_, reason| warn!(reason, "socket error"));

    let topic = topic.to_string();
    socket.on_message(move |_, message| {
        let internal = message.event() == events::REPLY
            || message.event() == presence::PRESENCE_STATE
            || message.event() == presence::PRESENCE_DIFF;
        if message.topic() == topic && !internal {
            info!(
                topic = %message.topic(),
                event = %message.event(),
                payload = %message.payload(),
                "broadcast"
            );
        }
    });
}

/// Keep a presence list for the channel and log members coming and going.
pub fn track_presence(
    socket: &mut Socket,
    id: ChannelId,
) -> Result<Rc<RefCell<PresenceState>>, ChannelError> {
    let members = Rc::new(RefCell::new(PresenceState::new()));
    let mut channel = socket.channel_mut(id)?;

    let state = members.clone();
    channel.on(presence::PRESENCE_STATE, move |_, payload, _| {
        match presence::state_from_payload(payload) {
            Ok(snapshot) => {
                let next = presence::sync_state(&state.borrow(), &snapshot, member_joined, member_left);
                *state.borrow_mut() = next;
            }
            Err(err) => debug!(error = %err, "ignoring malformed presence_state"),
        }
    })?;

    let state = members.clone();
    channel.on(presence::PRESENCE_DIFF, move |_, payload, _| {
        match presence::PresenceDiff::from_payload(payload) {
            Ok(diff) => {
                let next = presence::sync_diff(&state.borrow(), &diff, member_joined, member_left);
                *state.borrow_mut() = next;
            }
            Err(err) => debug!(error = %err, "ignoring malformed presence_diff"),
        }
    })?;

    Ok(members)
}

fn member_joined(key: &str, current: Option<&PresenceEntry>, joined: &PresenceEntry) {
    match current {
        None => info!(member = key, "member joined"),
        Some(_) => debug!(member = key, connections = joined.metas.len(), "member connected again"),
    }
}

fn member_left(key: &str, remaining: &PresenceEntry, _left: &PresenceEntry) {
    if remaining.metas.is_empty() {
        info!(member = key, "member left");
    }
}

/// Join the channel and push `event` every time the join succeeds.
pub fn join_and_push(
    socket: &mut Socket,
    id: ChannelId,
    event: String,
    payload: Payload,
) -> Result<(), ChannelError> {
    socket
        .channel_mut(id)?
        .join()?
        .receive("ok", move |socket, response| {
            info!(response = %response, "joined");
            let pushed = socket
                .channel_mut(id)
                .and_then(|channel| channel.push(&event, payload.clone()));
            match pushed {
                Ok(push) => {
                    let event = event.clone();
                    push.receive("ok", move |_, response| {
                        info!(event = %event, response = %response, "reply")
                    })
                    .receive("error", |_, response| warn!(response = %response, "push rejected"))
                    .receive(TIMEOUT, |_, _| warn!("push timed out"));
                }
                Err(err) => warn!(error = %err, code = err.error_code(), "push failed"),
            }
        })
        .receive("error", |_, response| warn!(response = %response, "join rejected"))
        .receive(TIMEOUT, |_, _| warn!("join timed out, retrying"));
    Ok(())
}

/// Leave the channel, then close the socket and stop the driver once the
/// leave resolves.
pub fn leave_and_stop(socket: &mut Socket, id: ChannelId, done: CancellationToken) {
    let stop = |done: CancellationToken| {
        move |socket: &mut Socket, _: &Payload| {
            socket.close();
            done.cancel();
        }
    };
    match socket.channel_mut(id).and_then(|channel| channel.leave()) {
        Ok(leave) => {
            leave
                .receive("ok", stop(done.clone()))
                .receive(TIMEOUT, stop(done));
        }
        Err(err) => {
            debug!(error = %err, "nothing to leave");
            socket.close();
            done.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phoenix_channels::{Message, SocketOptions, Transport};
    use serde_json::json;

    struct Offline;

    impl Transport for Offline {
        fn connect(&mut self, _url: &str) {}
        fn send(&mut self, _text: String) {}
        fn disconnect(&mut self, _code: u16) {}
    }

    fn frame(event: &str, payload: Payload) -> String {
        Message::new("room:lobby", event, payload, None)
            .encode()
            .unwrap()
    }

    #[test]
    fn test_presence_is_tracked() {
        let mut socket = Socket::new("ws://localhost:4000/socket", SocketOptions::default(), Offline);
        let id = socket.channel("room:lobby", json!({}));
        let members = track_presence(&mut socket, id).unwrap();

        socket.handle_text(&frame(
            presence::PRESENCE_STATE,
            json!({"jo": {"metas": [{"phx_ref": "1"}]}, "al": {"metas": [{"phx_ref": "2"}]}}),
        ));
        assert_eq!(members.borrow().len(), 2);

        socket.handle_text(&frame(
            presence::PRESENCE_DIFF,
            json!({"joins": {}, "leaves": {"al": {"metas": [{"phx_ref": "2"}]}}}),
        ));
        let names = presence::list(&members.borrow(), |key, _| key.to_string());
        assert_eq!(names, vec!["jo".to_string()]);
    }

    #[tokio::test]
    async fn test_leave_offline_stops_immediately() {
        let mut socket = Socket::new("ws://localhost:4000/socket", SocketOptions::default(), Offline);
        let id = socket.channel("room:lobby", json!({}));
        join_and_push(&mut socket, id, "ping".into(), json!({})).unwrap();

        let done = CancellationToken::new();
        leave_and_stop(&mut socket, id, done.clone());
        assert!(done.is_cancelled());
        assert!(socket.find_channel(id).is_none());
    }
}
