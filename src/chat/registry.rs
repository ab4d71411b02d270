//! Process-wide map from chat id to room, plus command and callback dispatch.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::command::{AddressPolicy, CommandKind};
use super::controller::Controller;
use super::room::ChatRoom;
use super::transport::{CallbackQuery, ChatId, InboundCommand, Transport};
use crate::lookup::NameResolver;
use crate::probe::Prober;

/// Collaborators shared by every session
pub struct Services {
    pub transport: Arc<dyn Transport>,
    pub prober: Arc<dyn Prober>,
    pub resolver: Arc<NameResolver>,
    pub policy: AddressPolicy,
}

pub struct Registry {
    /// Append-only; rooms clean up their own controllers
    rooms: Mutex<HashMap<ChatId, Arc<ChatRoom>>>,
    services: Arc<Services>,
}

impl Registry {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            services,
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn get_or_create(&self, chat: ChatId) -> Arc<ChatRoom> {
        self.rooms
            .lock()
            .entry(chat)
            .or_insert_with(|| Arc::new(ChatRoom::new(chat)))
            .clone()
    }

    pub fn room(&self, chat: ChatId) -> Option<Arc<ChatRoom>> {
        self.rooms.lock().get(&chat).cloned()
    }

    /// Admit a controller for `command` and start it in the background.
    /// Unknown command names are ignored.
    pub fn handle_command(&self, command: InboundCommand) -> Option<Controller> {
        let kind = CommandKind::from_name(&command.name)?;
        let room = self.get_or_create(command.chat);
        let controller = Controller::new(
            &room,
            command.message,
            kind,
            command.args,
            self.services.clone(),
        );
        room.admit(controller.clone());
        debug!(
            chat = %command.chat,
            request = %controller.request_id(),
            command = %command.name,
            "Session admitted"
        );
        controller.spawn_execute();
        Some(controller)
    }

    pub async fn handle_callback(&self, query: &CallbackQuery) {
        let room = self.get_or_create(query.chat);
        room.route_callback(query).await;
    }

    /// Sweep every room concurrently. Returns the number of retired controllers.
    pub async fn sweep_all(&self) -> usize {
        let rooms: Vec<Arc<ChatRoom>> = self.rooms.lock().values().cloned().collect();
        join_all(rooms.iter().map(|room| room.sweep()))
            .await
            .into_iter()
            .sum()
    }

    /// Periodic sweep until `cancel` fires
    pub async fn run_sweeper(&self, every: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(every);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                }
                _ = interval.tick() => {
                    let retired = self.sweep_all().await;
                    if retired > 0 {
                        info!(retired, "Swept finished sessions");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::controller::ControllerState;
    use crate::chat::test_support::{services, RecordingTransport, SilentProber};
    use crate::chat::transport::MessageId;

    fn registry() -> (Registry, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let registry = Registry::new(services(transport.clone(), Arc::new(SilentProber)));
        (registry, transport)
    }

    fn command(chat: i64, text: &str) -> InboundCommand {
        InboundCommand::parse(ChatId(chat), 1, MessageId(1), text).unwrap()
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let (registry, _) = registry();
        let a = registry.get_or_create(ChatId(5));
        let b = registry.get_or_create(ChatId(5));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.room(ChatId(6)).is_none());
    }

    #[tokio::test]
    async fn test_unknown_command_ignored() {
        let (registry, _) = registry();
        assert!(registry.handle_command(command(5, "/start")).is_none());
        assert!(registry.room(ChatId(5)).is_none());
    }

    #[tokio::test]
    async fn test_sweep_all_across_rooms() {
        let (registry, _) = registry();
        let mut controllers = Vec::new();
        for chat in [1, 1, 2, 2] {
            let room = registry.get_or_create(ChatId(chat));
            let controller = Controller::new(
                &room,
                MessageId(1),
                CommandKind::Lookup,
                "",
                registry.services().clone(),
            );
            room.admit(controller.clone());
            controller.execute().await;
            controllers.push(controller);
        }

        assert_eq!(registry.sweep_all().await, 2);
        assert_eq!(controllers[0].state(), ControllerState::Disposed);
        assert_eq!(controllers[1].state(), ControllerState::Completed);
        assert_eq!(controllers[2].state(), ControllerState::Disposed);
        assert_eq!(controllers[3].state(), ControllerState::Completed);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let (registry, _) = registry();
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(
            Duration::from_secs(1),
            registry.run_sweeper(Duration::from_millis(10), cancel),
        )
        .await
        .unwrap();
    }
}
