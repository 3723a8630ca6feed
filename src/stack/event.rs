//! Events passed between protocol layers

use std::fmt;

use crate::address::Address;
use crate::message::{Message, MessageBatch};
use crate::view::View;

/// What travels up and down the stack.
#[derive(Debug, Clone)]
pub enum Event {
    /// A single message
    Message(Message),
    /// Messages decoded from one inbound frame
    Batch(MessageBatch),
    /// A new view was installed; travels down, then up
    ViewChange(View),
    /// The failure detector suspects a member; travels up
    Suspect(Address),
    /// The transport lost its connection to a peer; travels up
    ConnectionReset(Address),
    /// The channel connects to a cluster; travels down
    Connect(String),
    /// The channel disconnects; travels down
    Disconnect,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Message(_) => "MSG",
            Event::Batch(_) => "BATCH",
            Event::ViewChange(_) => "VIEW_CHANGE",
            Event::Suspect(_) => "SUSPECT",
            Event::ConnectionReset(_) => "CONNECTION_RESET",
            Event::Connect(_) => "CONNECT",
            Event::Disconnect => "DISCONNECT",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Message(m) => write!(f, "MSG({})", m),
            Event::Batch(b) => write!(f, "BATCH({} from {})", b.len(), b.sender()),
            Event::ViewChange(v) => write!(f, "VIEW_CHANGE({})", v),
            Event::Suspect(a) => write!(f, "SUSPECT({})", a),
            Event::ConnectionReset(a) => write!(f, "CONNECTION_RESET({})", a),
            Event::Connect(c) => write!(f, "CONNECT({})", c),
            Event::Disconnect => write!(f, "DISCONNECT"),
        }
    }
}
