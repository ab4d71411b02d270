//! Conversational front end: per-chat rooms of revocable diagnostic sessions.

pub mod command;
pub mod controller;
pub mod registry;
pub mod render;
pub mod room;
pub mod transport;

use std::fmt;

pub use command::{AddressPolicy, ArgError, CommandKind};
pub use controller::{Controller, ControllerState, Disposal};
pub use registry::{Registry, Services};
pub use room::ChatRoom;
pub use transport::{Buttons, CallbackQuery, ChatId, InboundCommand, MessageId, Transport};

/// Opaque identity of one command invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u128);

impl RequestId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}
