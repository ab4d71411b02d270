//! Line-oriented stand-in for a chat platform.
//!
//! Input lines are either commands (`/ping 172.20.0.1`) or button presses
//! (`!cancel <message>`, `!retry <message>`). Every outbound message is
//! printed with its id so it can be referenced by a button press.

use anyhow::Result;
use async_trait::async_trait;
use std::io::Write;
use std::sync::atomic::{AtomicI32, Ordering};

use netdiag::chat::transport::{CALLBACK_CANCEL, CALLBACK_RETRY};
use netdiag::chat::{Buttons, CallbackQuery, ChatId, InboundCommand, MessageId, Transport};

/// Sender id reported for console input
const CONSOLE_USER: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Command(InboundCommand),
    Callback(CallbackQuery),
}

pub struct ConsoleTransport {
    chat: ChatId,
    /// Shared by inbound and outbound messages so ids never collide
    next_id: AtomicI32,
}

impl ConsoleTransport {
    pub fn new(chat: ChatId) -> Self {
        Self {
            chat,
            next_id: AtomicI32::new(1),
        }
    }

    fn allocate(&self) -> MessageId {
        MessageId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Interpret one line of input. Blank and unrecognized lines yield `None`.
    pub fn parse_line(&self, line: &str) -> Option<ConsoleInput> {
        let line = line.trim();
        if let Some(press) = line.strip_prefix('!') {
            let (action, message) = press.split_once(char::is_whitespace)?;
            let data = match action {
                "cancel" => CALLBACK_CANCEL,
                "retry" => CALLBACK_RETRY,
                _ => return None,
            };
            let message = message.trim().trim_start_matches('#').parse().ok()?;
            return Some(ConsoleInput::Callback(CallbackQuery {
                id: format!("console-{}", self.allocate()),
                chat: self.chat,
                sender: CONSOLE_USER,
                message: MessageId(message),
                data: data.to_string(),
            }));
        }

        let message = self.allocate();
        InboundCommand::parse(self.chat, CONSOLE_USER, message, line).map(ConsoleInput::Command)
    }

    fn print(&self, heading: String, text: &str, buttons: Buttons) -> Result<()> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", heading)?;
        for line in text.lines() {
            writeln!(out, "  {}", line)?;
        }
        if let Some((label, _)) = buttons.button() {
            writeln!(out, "  [{}]", label)?;
        }
        out.flush()?;
        Ok(())
    }
}

#[async_trait]
impl Transport for ConsoleTransport {
    async fn send(
        &self,
        _chat: ChatId,
        reply_to: Option<MessageId>,
        text: &str,
        buttons: Buttons,
    ) -> Result<MessageId> {
        let message = self.allocate();
        let heading = match reply_to {
            Some(origin) => format!("#{} (reply to #{})", message, origin),
            None => format!("#{}", message),
        };
        self.print(heading, text, buttons)?;
        Ok(message)
    }

    async fn edit(&self, _chat: ChatId, message: MessageId, text: &str, buttons: Buttons) -> Result<()> {
        self.print(format!("#{} (edited)", message), text, buttons)
    }

    async fn delete(&self, _chat: ChatId, message: MessageId) -> Result<()> {
        self.print(format!("#{} (deleted)", message), "", Buttons::None)
    }

    async fn answer_callback(&self, query: &CallbackQuery, text: &str) -> Result<()> {
        self.print(format!("#{} {}: {}", query.message, query.data, text), "", Buttons::None)
    }
}
