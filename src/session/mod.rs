//! Session Module
//!
//! Bidirektionale Verbindung zum Live Service:
//! Setup-Handshake, ausgehendes Audio, klassifizierte eingehende Events.

mod channel;
mod messages;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{
    SessionChannel, SessionError, SessionState, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_OUTBOUND_QUEUE,
};
pub use messages::{InboundEvent, RealtimeInputMessage, ServerMessage, SetupMessage};
