//! Wire contract between client sessions and the server: the JSON message
//! envelopes exchanged over a framed transport, and the state machine a
//! connection steps through. The transport itself (WebSocket or otherwise)
//! is an external collaborator.

mod envelope;
mod session;

pub use envelope::{
    ClientMessage, MutationKind, ServerMessage, GENERIC_INSERT, GENERIC_UPDATE,
};
pub use session::{ConnectionState, SessionEvent};
