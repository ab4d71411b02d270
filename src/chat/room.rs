//! Per-chat container of admitted controllers and their callback bindings.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::controller::{Controller, ControllerState, Disposal};
use super::transport::{CallbackQuery, ChatId, MessageId};
use super::RequestId;
use crate::error::RoomError;

#[derive(Default)]
struct RoomInner {
    controllers: HashMap<RequestId, Controller>,
    /// Outbound message -> controller owning its buttons
    callbacks: HashMap<MessageId, Controller>,
    /// Inverse of `callbacks`
    reverse: HashMap<RequestId, MessageId>,
}

impl RoomInner {
    fn unbind_request(&mut self, request: RequestId) {
        if let Some(message) = self.reverse.remove(&request) {
            self.callbacks.remove(&message);
        }
    }
}

pub struct ChatRoom {
    id: ChatId,
    inner: Mutex<RoomInner>,
}

impl ChatRoom {
    pub fn new(id: ChatId) -> Self {
        Self {
            id,
            inner: Mutex::new(RoomInner::default()),
        }
    }

    pub fn id(&self) -> ChatId {
        self.id
    }

    pub fn admit(&self, controller: Controller) {
        self.inner
            .lock()
            .controllers
            .insert(controller.request_id(), controller);
    }

    /// Route callbacks on `message` to `controller`.
    pub fn bind(&self, message: MessageId, controller: &Controller) -> Result<(), RoomError> {
        let mut inner = self.inner.lock();
        let request = controller.request_id();
        if !inner.controllers.contains_key(&request) {
            return Err(RoomError::NotAdmitted {
                request,
                chat: self.id,
            });
        }

        // One binding per controller and per message
        inner.unbind_request(request);
        if let Some(previous) = inner.callbacks.insert(message, controller.clone()) {
            inner.reverse.remove(&previous.request_id());
        }
        inner.reverse.insert(request, message);
        Ok(())
    }

    pub fn unbind(&self, message: MessageId) {
        let mut inner = self.inner.lock();
        if let Some(controller) = inner.callbacks.remove(&message) {
            inner.reverse.remove(&controller.request_id());
        }
    }

    pub fn controller_for(&self, message: MessageId) -> Option<Controller> {
        self.inner.lock().callbacks.get(&message).cloned()
    }

    /// Deliver a button press to its owner. Stale messages are dropped.
    pub async fn route_callback(&self, query: &CallbackQuery) {
        match self.controller_for(query.message) {
            Some(controller) => controller.on_callback(query).await,
            None => warn!(
                chat = %self.id,
                message = %query.message,
                data = %query.data,
                "Dropping callback for unbound message"
            ),
        }
    }

    /// Retire finished controllers, always keeping the newest one.
    ///
    /// Returns how many controllers were retired. Disposal runs after the
    /// room lock is released.
    pub async fn sweep(&self) -> usize {
        let retired: Vec<Controller> = {
            let mut inner = self.inner.lock();
            if inner.controllers.len() <= 1 {
                return 0;
            }

            let mut ordered: Vec<Controller> = inner.controllers.values().cloned().collect();
            ordered.sort_by_key(|c| c.age_key());
            ordered.pop();

            let retired: Vec<Controller> = ordered
                .into_iter()
                .filter(|c| {
                    matches!(
                        c.state(),
                        ControllerState::StandBy | ControllerState::Completed
                    )
                })
                .collect();

            for controller in &retired {
                let request = controller.request_id();
                inner.controllers.remove(&request);
                inner.unbind_request(request);
            }
            retired
        };

        if retired.is_empty() {
            return 0;
        }
        debug!(chat = %self.id, count = retired.len(), "Retiring controllers");
        join_all(retired.iter().map(|c| c.dispose(Disposal::Async))).await;
        retired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, request: RequestId) -> bool {
        self.inner.lock().controllers.contains_key(&request)
    }

    pub fn binding_count(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    /// Both callback maps mirror each other and only reference admitted
    /// controllers.
    pub fn bindings_consistent(&self) -> bool {
        let inner = self.inner.lock();
        inner.callbacks.len() == inner.reverse.len()
            && inner.callbacks.iter().all(|(message, controller)| {
                let request = controller.request_id();
                inner.reverse.get(&request) == Some(message)
                    && inner.controllers.contains_key(&request)
            })
    }
}

impl std::fmt::Debug for ChatRoom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRoom")
            .field("id", &self.id)
            .field("controllers", &self.len())
            .finish()
    }
}
