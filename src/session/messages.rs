//! Actix messages exchanged between [`super::handler::SessionHandler`]
//! instances. Nothing here ever suspends a socket read — they're all
//! `do_send`/`try_send` fire-and-forget, keeping the single-writer
//! discipline actix's per-actor mailbox already gives us for free.

use actix::{Addr, Message};
use serde_json::Value;

use super::handler::SessionHandler;

/// A guest has joined; the master records it in its guest list.
#[derive(Message)]
#[rtype(result = "()")]
pub struct AttachGuest {
    pub session_id: String,
    pub addr: Addr<SessionHandler>,
}

/// A guest has gone away (socket closed); the master forgets it.
#[derive(Message)]
#[rtype(result = "()")]
pub struct DetachGuest(pub String);

/// One already-framed instruction to write to this handler's own socket,
/// then (if this handler is a master) fan out to its guests.
#[derive(Message, Clone)]
#[rtype(result = "()")]
pub struct DeliverUpstream(pub String);

/// The reader task's upstream connection died or was closed by `guacd`.
#[derive(Message)]
#[rtype(result = "()")]
pub struct UpstreamClosed;

/// A guest is requesting control of the session.
#[derive(Message)]
#[rtype(result = "()")]
pub struct RequestControl(pub String);

/// The master has decided whether this peer may forward input upstream.
#[derive(Message)]
#[rtype(result = "()")]
pub struct SetControlling(pub bool);

/// A controlling guest's input, to be written to the master's upstream.
#[derive(Message)]
#[rtype(result = "()")]
pub struct ForwardUpstream(pub String);

/// Tell a guest's handler to notify its browser and close the socket.
#[derive(Message)]
#[rtype(result = "()")]
pub struct CloseSession {
    pub notify_event: Option<(String, Value)>,
    pub reason: Option<String>,
}
