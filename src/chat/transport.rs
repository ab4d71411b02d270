//! Boundary to the chat platform: message send/edit/delete, inline buttons
//! and button-press delivery.

use async_trait::async_trait;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub i32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inline keyboard attached to a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Buttons {
    None,
    /// Single "Cancel" button, callback data `cancel`
    Cancel,
    /// Single "Retry" button, callback data `retry`
    Retry,
}

impl Buttons {
    /// (label, callback data) of the button, if any
    pub fn button(self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::None => None,
            Self::Cancel => Some(("Cancel", CALLBACK_CANCEL)),
            Self::Retry => Some(("Retry", CALLBACK_RETRY)),
        }
    }
}

pub const CALLBACK_CANCEL: &str = "cancel";
pub const CALLBACK_RETRY: &str = "retry";

/// A `/command args` message addressed to us
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCommand {
    pub chat: ChatId,
    pub sender: i64,
    /// Message to reply to
    pub message: MessageId,
    /// Command name without the slash or `@bot` suffix
    pub name: String,
    pub args: String,
}

impl InboundCommand {
    /// Split `/name[@bot] args...` into name and argument text.
    /// Returns `None` for text that is not a command.
    pub fn parse(chat: ChatId, sender: i64, message: MessageId, text: &str) -> Option<Self> {
        let body = text.strip_prefix('/')?;
        let (head, args) = match body.split_once(' ') {
            Some((head, args)) => (head, args.trim()),
            None => (body, ""),
        };
        let name = match head.split_once('@') {
            Some((name, bot)) if !bot.is_empty() => name,
            _ => head.trim_end_matches('@'),
        };
        if name.is_empty() {
            return None;
        }

        Some(Self {
            chat,
            sender,
            message,
            name: name.to_string(),
            args: args.to_string(),
        })
    }
}

/// Button press on one of our messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackQuery {
    /// Platform id used to acknowledge the press
    pub id: String,
    pub chat: ChatId,
    pub sender: i64,
    /// Message the button was attached to
    pub message: MessageId,
    pub data: String,
}

/// Outbound side of the chat platform.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        chat: ChatId,
        reply_to: Option<MessageId>,
        text: &str,
        buttons: Buttons,
    ) -> anyhow::Result<MessageId>;

    async fn edit(
        &self,
        chat: ChatId,
        message: MessageId,
        text: &str,
        buttons: Buttons,
    ) -> anyhow::Result<()>;

    async fn delete(&self, chat: ChatId, message: MessageId) -> anyhow::Result<()>;

    /// Acknowledge a button press
    async fn answer_callback(&self, query: &CallbackQuery, text: &str) -> anyhow::Result<()>;
}
