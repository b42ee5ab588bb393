//! In-memory transport and frame builders for unit tests.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::json;

use crate::config::SocketOptions;
use crate::message::{events, Message, Payload, Ref};
use crate::socket::Socket;
use crate::transport::Transport;

pub const ENDPOINT: &str = "ws://localhost:4000/socket";

#[derive(Default)]
struct Recorded {
    connects: Vec<String>,
    sent: Vec<String>,
    disconnects: Vec<u16>,
}

/// Shared view of everything a [`RecordingTransport`] was asked to do.
#[derive(Clone, Default)]
pub struct Log(Rc<RefCell<Recorded>>);

impl Log {
    pub fn connects(&self) -> Vec<String> {
        self.0.borrow().connects.clone()
    }

    pub fn disconnects(&self) -> Vec<u16> {
        self.0.borrow().disconnects.clone()
    }

    pub fn sent(&self) -> Vec<Message> {
        self.0
            .borrow()
            .sent
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }

    /// Ref of the most recently sent frame.
    pub fn last_ref(&self) -> Ref {
        self.sent().last().and_then(Message::ref_id).unwrap()
    }
}

pub struct RecordingTransport {
    log: Log,
}

impl Transport for RecordingTransport {
    fn connect(&mut self, url: &str) {
        self.log.0.borrow_mut().connects.push(url.to_string());
    }

    fn send(&mut self, text: String) {
        self.log.0.borrow_mut().sent.push(text);
    }

    fn disconnect(&mut self, code: u16) {
        self.log.0.borrow_mut().disconnects.push(code);
    }
}

/// A disconnected socket over a recording transport.
pub fn socket_with_log() -> (Socket, Log) {
    let log = Log::default();
    let transport = RecordingTransport { log: log.clone() };
    (Socket::new(ENDPOINT, SocketOptions::default(), transport), log)
}

/// A socket that has connected and seen its transport open.
pub fn connected_socket() -> (Socket, Log) {
    let (mut socket, log) = socket_with_log();
    socket.connect();
    socket.handle_open();
    (socket, log)
}

pub fn frame(topic: &str, event: &str, payload: Payload, ref_id: Option<Ref>) -> String {
    Message::new(topic, event, payload, ref_id).encode().unwrap()
}

pub fn reply_frame(topic: &str, ref_id: Ref, status: &str, response: Payload) -> String {
    frame(
        topic,
        events::REPLY,
        json!({ "status": status, "response": response }),
        Some(ref_id),
    )
}
