//! Wire messages.

use serde::{Deserialize, Serialize};

/// Client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Turn this connection into the event stream for `subscriber_id`.
    Subscribe {
        event_type: String,
        subscriber_id: String,
    },
    /// Broadcast an encoded event. Only accepted by broker hubs.
    Publish { event_type: String, payload: Vec<u8> },
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Event { payload: Vec<u8> },
    Ack,
    Error { message: String },
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }
}
