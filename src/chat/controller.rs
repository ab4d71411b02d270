//! One diagnostic command invocation and its interactive lifecycle.
//!
//! ```text
//! Created -> Running -> StandBy | Completed -> Disposed
//!               ^           |
//!               +- retry ---+
//! ```

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use scopeguard::defer;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::command::{
    self, ArgError, CommandKind, Destination, PingRequest, TraceRequest,
};
use super::registry::Services;
use super::render::{self, PingStats, Target};
use super::room::ChatRoom;
use super::transport::{Buttons, CALLBACK_CANCEL, CALLBACK_RETRY, CallbackQuery, ChatId, MessageId};
use super::RequestId;
use crate::lookup::AddressFamily;
use crate::probe::icmp::echo_payload;
use crate::probe::ProbeOptions;
use crate::trace::{HopReport, TraceObserver, TraceParams, Tracer};

/// Fixed TTL for ping probes
const PING_TTL: u8 = 128;

/// Breaks ties between controllers created within the same clock tick
static SERIAL: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    Created,
    Running,
    /// Finished, with live Cancel/Retry buttons
    StandBy,
    /// Finished, nothing interactive left
    Completed,
    Disposed,
}

/// How a controller is torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposal {
    /// Local teardown only
    Sync,
    /// Also delete the outbound message through the transport
    Async,
}

struct Inner {
    request: RequestId,
    chat: ChatId,
    /// User message the first reply goes to
    origin: MessageId,
    kind: CommandKind,
    args: String,
    created_at: Instant,
    serial: u64,
    last_active: Mutex<Instant>,
    state: Mutex<ControllerState>,
    cancel: Mutex<CancellationToken>,
    /// Our outbound message, once sent
    sent: Mutex<Option<MessageId>>,
    /// Whether `sent` is bound for callbacks in the room
    bound: Mutex<bool>,
    execute_lock: tokio::sync::Mutex<()>,
    callback_lock: tokio::sync::Mutex<()>,
    room: Weak<ChatRoom>,
    services: Arc<Services>,
}

/// Cheap, clonable handle; clones share one session.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    pub fn new(
        room: &Arc<ChatRoom>,
        origin: MessageId,
        kind: CommandKind,
        args: impl Into<String>,
        services: Arc<Services>,
    ) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(Inner {
                request: RequestId::random(),
                chat: room.id(),
                origin,
                kind,
                args: args.into(),
                created_at: now,
                serial: SERIAL.fetch_add(1, Ordering::Relaxed),
                last_active: Mutex::new(now),
                state: Mutex::new(ControllerState::Created),
                cancel: Mutex::new(CancellationToken::new()),
                sent: Mutex::new(None),
                bound: Mutex::new(false),
                execute_lock: tokio::sync::Mutex::new(()),
                callback_lock: tokio::sync::Mutex::new(()),
                room: Arc::downgrade(room),
                services,
            }),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.inner.request
    }

    pub fn kind(&self) -> CommandKind {
        self.inner.kind
    }

    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    pub fn last_active(&self) -> Instant {
        *self.inner.last_active.lock()
    }

    /// Creation order, oldest first
    pub(crate) fn age_key(&self) -> (Instant, u64) {
        (self.inner.created_at, self.inner.serial)
    }

    pub fn state(&self) -> ControllerState {
        *self.inner.state.lock()
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == ControllerState::Disposed
    }

    /// The outbound message, once one was sent
    pub fn message(&self) -> Option<MessageId> {
        *self.inner.sent.lock()
    }

    /// Current cancellation handle
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.lock().clone()
    }

    fn set_state(&self, state: ControllerState) {
        *self.inner.state.lock() = state;
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: ControllerState) {
        self.set_state(state);
    }

    fn touch(&self) {
        *self.inner.last_active.lock() = Instant::now();
    }

    /// Run the command. Concurrent calls are serialized.
    pub async fn execute(&self) {
        let _running = self.inner.execute_lock.lock().await;
        if self.is_disposed() {
            return;
        }

        self.set_state(ControllerState::Running);
        self.touch();
        let cancel = self.cancellation();

        defer! {
            self.finish();
        }

        let result = match self.inner.kind {
            CommandKind::Ping => self.ping(&cancel).await,
            CommandKind::Trace => self.trace(&cancel).await,
            CommandKind::Lookup => self.lookup(&cancel).await,
        };

        if let Err(e) = result {
            error!(
                chat = %self.inner.chat,
                request = %self.inner.request,
                error = %format!("{:#}", e),
                "Session failed"
            );
        } else if cancel.is_cancelled() {
            debug!(request = %self.inner.request, "Operation cancelled by user");
        }
    }

    /// Leave Running: StandBy while buttons are live, else Completed.
    /// A concurrent disposal wins.
    fn finish(&self) {
        let bound = *self.inner.bound.lock();
        let mut state = self.inner.state.lock();
        if *state != ControllerState::Disposed {
            *state = if bound {
                ControllerState::StandBy
            } else {
                ControllerState::Completed
            };
        }
    }

    /// Spawn [`execute`](Self::execute) on the runtime
    pub fn spawn_execute(&self) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.execute().await })
    }

    /// Revoke the current handle without issuing a new one
    pub fn cancel(&self) {
        self.inner.cancel.lock().cancel();
    }

    /// Revoke the current handle, install a fresh one and run again
    pub fn retry(&self) -> tokio::task::JoinHandle<()> {
        {
            let mut token = self.inner.cancel.lock();
            token.cancel();
            *token = CancellationToken::new();
        }
        self.spawn_execute()
    }

    /// Handle a Cancel/Retry button press.
    pub async fn on_callback(&self, query: &CallbackQuery) {
        if self.is_disposed() {
            return;
        }
        let _pressing = self.inner.callback_lock.lock().await;
        if self.is_disposed() {
            return;
        }
        self.touch();

        match query.data.as_str() {
            CALLBACK_CANCEL => self.cancel(),
            CALLBACK_RETRY => {
                self.retry();
            }
            other => debug!(request = %self.inner.request, data = other, "Ignoring callback"),
        }

        if let Err(e) = self.inner.services.transport.answer_callback(query, "Ok").await {
            warn!(request = %self.inner.request, error = %e, "Failed to acknowledge callback");
        }
    }

    /// Tear down: cancel, wait out any running execute, unbind the callback
    /// and, for [`Disposal::Async`], delete the message. Idempotent.
    pub async fn dispose(&self, mode: Disposal) {
        self.cancel();
        let _running = self.inner.execute_lock.lock().await;
        if self.is_disposed() {
            return;
        }

        if let Some(message) = self.message() {
            let was_bound = std::mem::replace(&mut *self.inner.bound.lock(), false);
            if was_bound {
                if let Some(room) = self.inner.room.upgrade() {
                    room.unbind(message);
                }
            }
            if mode == Disposal::Async {
                if let Err(e) = self.inner.services.transport.delete(self.inner.chat, message).await {
                    warn!(request = %self.inner.request, %message, error = %e, "Failed to delete message");
                }
            }
        }

        self.set_state(ControllerState::Disposed);
        debug!(chat = %self.inner.chat, request = %self.inner.request, "Controller disposed");
    }

    /// Send the first reply (binding buttons if any) or edit the existing one.
    async fn publish(&self, text: &str, buttons: Buttons) -> Result<()> {
        let transport = &self.inner.services.transport;
        match self.message() {
            Some(message) => transport.edit(self.inner.chat, message, text, buttons).await,
            None => {
                let message = transport
                    .send(self.inner.chat, Some(self.inner.origin), text, buttons)
                    .await?;
                *self.inner.sent.lock() = Some(message);
                if buttons != Buttons::None {
                    self.bind(message)?;
                }
                Ok(())
            }
        }
    }

    fn bind(&self, message: MessageId) -> Result<()> {
        if let Some(room) = self.inner.room.upgrade() {
            room.bind(message, self)?;
            *self.inner.bound.lock() = true;
        }
        Ok(())
    }

    async fn usage_error(&self, err: Option<ArgError>, usage: &str) -> Result<()> {
        let text = match err {
            None => usage.to_string(),
            Some(err) if err.shows_usage() => render::with_usage(&err.to_string(), usage),
            Some(err) => err.to_string(),
        };
        self.publish(&text, Buttons::None).await
    }

    /// Turn a parsed destination into an address inside the policy.
    /// `None` when cancelled while resolving.
    async fn resolve(
        &self,
        destination: &Destination,
        family: AddressFamily,
        cancel: &CancellationToken,
    ) -> Option<std::result::Result<Target, String>> {
        let name = match destination {
            Destination::Address(address) => {
                return Some(Ok(Target {
                    name: None,
                    address: *address,
                }))
            }
            Destination::Domain(name) => name,
        };

        let resolved = tokio::select! {
            _ = cancel.cancelled() => return None,
            resolved = self.inner.services.resolver.resolve_host(name, family) => resolved,
        };
        let result = match resolved {
            None => Err(format!("Error: cannot resolve domain \"{}\"", name)),
            Some(address) if !self.inner.services.policy.permits(address) => {
                Err(ArgError::OutOfRange.to_string())
            }
            Some(address) => Ok(Target {
                name: Some(name.clone()),
                address,
            }),
        };
        Some(result)
    }

    async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        if self.inner.args.trim().is_empty() {
            return self.usage_error(None, render::PING_USAGE).await;
        }
        let request: PingRequest =
            match command::parse_ping(&self.inner.args, &self.inner.services.policy) {
                Ok(request) => request,
                Err(e) => return self.usage_error(Some(e), render::PING_USAGE).await,
            };
        let target = match self.resolve(&request.destination, request.family, cancel).await {
            Some(Ok(target)) => target,
            Some(Err(message)) => return self.publish(&message, Buttons::None).await,
            None => return Ok(()),
        };

        let header = render::ping_header(&target, request.size);
        self.publish(&header, Buttons::Cancel).await?;

        let payload = echo_payload(request.size);
        let options = ProbeOptions {
            ttl: std::num::NonZeroU8::new(PING_TTL).unwrap_or(std::num::NonZeroU8::MAX),
            dont_fragment: request.dont_fragment,
            timeout: request.timeout,
        };
        let mut stats = PingStats::default();
        let mut body = header.clone();

        for seq in 1..=request.count {
            if cancel.is_cancelled() {
                break;
            }
            let reply = match self
                .inner
                .services
                .prober
                .probe(target.address, &payload, &options, cancel)
                .await
            {
                Ok(reply) => reply,
                Err(_) => break,
            };
            stats.record(&reply);
            body.push('\n');
            body.push_str(&render::ping_line(seq, &reply));
            self.publish(&body, Buttons::Cancel).await?;

            if seq < request.count && !request.interval.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(request.interval) => {}
                }
            }
        }

        let mut text = format!("{}\n\n{}", body, stats.footer(&target));
        if cancel.is_cancelled() {
            text.push_str(render::CANCELLED_NOTICE);
        }
        self.publish(&text, Buttons::Retry).await
    }

    async fn trace(&self, cancel: &CancellationToken) -> Result<()> {
        if self.inner.args.trim().is_empty() {
            return self.usage_error(None, render::TRACE_USAGE).await;
        }
        let request: TraceRequest =
            match command::parse_trace(&self.inner.args, &self.inner.services.policy) {
                Ok(request) => request,
                Err(e) => return self.usage_error(Some(e), render::TRACE_USAGE).await,
            };
        let target = match self.resolve(&request.destination, request.family, cancel).await {
            Some(Ok(target)) => target,
            Some(Err(message)) => return self.publish(&message, Buttons::None).await,
            None => return Ok(()),
        };

        let header = render::trace_header(&target, request.max_ttl, request.size);
        self.publish(&header, Buttons::Cancel).await?;

        let params = TraceParams {
            destination: target.address,
            first_ttl: request.first_ttl,
            max_ttl: request.max_ttl,
            payload_size: request.size,
            timeout: request.timeout,
            queries: request.queries,
            interval: request.interval,
            dont_fragment: request.dont_fragment,
        };
        let services = &self.inner.services;
        let progress = TraceProgress {
            controller: self,
            header: &header,
        };
        let outcome = Tracer::new(services.prober.as_ref(), services.resolver.as_ref())
            .run(&params, &progress, cancel)
            .await;

        let mut text = render::trace_body(&header, &outcome.hops);
        if outcome.cancelled {
            text.push_str(render::CANCELLED_NOTICE);
        }
        self.publish(&text, Buttons::Retry).await
    }

    async fn lookup(&self, cancel: &CancellationToken) -> Result<()> {
        if self.inner.args.trim().is_empty() {
            return self.usage_error(None, render::LOOKUP_USAGE).await;
        }
        let request = match command::parse_lookup(&self.inner.args, &self.inner.services.policy) {
            Ok(request) => request,
            Err(e) => return self.usage_error(Some(e), render::LOOKUP_USAGE).await,
        };

        let resolver = &self.inner.services.resolver;
        let server = SocketAddr::new(
            request.server.unwrap_or_else(|| resolver.server().ip()),
            request.port,
        );
        let header = render::lookup_header(server);
        self.publish(&format!("{}\n\nQuerying", header), Buttons::None)
            .await?;

        let mut answers = Vec::new();
        let mut failures = Vec::new();
        for record_type in &request.record_types {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = resolver.dns().query(server, &request.domain, *record_type) => result,
            };
            match result {
                Ok(mut found) => answers.append(&mut found),
                Err(e) => {
                    warn!(domain = %request.domain, %record_type, error = %e, "DNS query failed");
                    failures.push((request.domain.clone(), e.to_string()));
                }
            }
        }

        self.publish(
            &render::lookup_body(&header, &answers, &failures),
            Buttons::None,
        )
        .await
    }
}

/// Repaints the trace message after every probe
struct TraceProgress<'a> {
    controller: &'a Controller,
    header: &'a str,
}

#[async_trait]
impl TraceObserver for TraceProgress<'_> {
    async fn progress(&self, hops: &[HopReport]) {
        let text = render::trace_body(self.header, hops);
        if let Err(e) = self.controller.publish(&text, Buttons::Cancel).await {
            warn!(request = %self.controller.inner.request, error = %e, "Failed to update trace");
        }
    }
}

impl PartialEq for Controller {
    fn eq(&self, other: &Self) -> bool {
        self.inner.request == other.inner.request
    }
}

impl Eq for Controller {}

impl Hash for Controller {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.request.hash(state);
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("request", &self.inner.request)
            .field("chat", &self.inner.chat)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::test_support::{RecordingTransport, SilentProber, services};
    use std::time::Duration;

    async fn wait_for(controller: &Controller, state: ControllerState) {
        for _ in 0..200 {
            if controller.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("controller never reached {:?}, is {:?}", state, controller.state());
    }

    fn setup() -> (Arc<ChatRoom>, Arc<RecordingTransport>, Arc<Services>) {
        let transport = Arc::new(RecordingTransport::default());
        let services = services(transport.clone(), Arc::new(SilentProber));
        (Arc::new(ChatRoom::new(ChatId(7))), transport, services)
    }

    fn callback(message: MessageId, data: &str) -> CallbackQuery {
        CallbackQuery {
            id: "cb".into(),
            chat: ChatId(7),
            sender: 1,
            message,
            data: data.into(),
        }
    }

    #[tokio::test]
    async fn test_usage_completes_without_buttons() {
        let (room, transport, services) = setup();
        let controller = Controller::new(&room, MessageId(1), CommandKind::Ping, "", services);
        room.admit(controller.clone());

        controller.execute().await;

        assert_eq!(controller.state(), ControllerState::Completed);
        assert_eq!(transport.texts.lock()[0], render::PING_USAGE);
        assert_eq!(room.binding_count(), 0);
    }

    #[tokio::test]
    async fn test_bad_args_render_error() {
        let (room, transport, services) = setup();
        let controller =
            Controller::new(&room, MessageId(1), CommandKind::Ping, "-4 -6 10.0.0.1", services);
        room.admit(controller.clone());

        controller.execute().await;

        assert_eq!(controller.state(), ControllerState::Completed);
        assert_eq!(
            transport.texts.lock()[0],
            "Error: options \"-4\" and \"-6\" are mutually exclusive"
        );
    }

    #[tokio::test]
    async fn test_cancel_then_retry() {
        let (room, _transport, services) = setup();
        let controller =
            Controller::new(&room, MessageId(1), CommandKind::Ping, "-c 1 172.20.1.1", services);
        room.admit(controller.clone());

        controller.spawn_execute();
        wait_for(&controller, ControllerState::Running).await;
        let message = loop {
            if let Some(message) = controller.message() {
                break message;
            }
            tokio::task::yield_now().await;
        };

        let first = controller.cancellation();
        controller.on_callback(&callback(message, "cancel")).await;
        assert!(first.is_cancelled());
        wait_for(&controller, ControllerState::StandBy).await;
        // Cancel does not replace the handle
        assert!(controller.cancellation().is_cancelled());

        controller.on_callback(&callback(message, "retry")).await;
        wait_for(&controller, ControllerState::Running).await;
        let second = controller.cancellation();
        assert!(!second.is_cancelled());
        assert!(first.is_cancelled());

        controller.dispose(Disposal::Sync).await;
        assert_eq!(controller.state(), ControllerState::Disposed);
        assert!(second.is_cancelled());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_deletes_once() {
        let (room, transport, services) = setup();
        let controller =
            Controller::new(&room, MessageId(1), CommandKind::Ping, "-c 1 172.20.1.1", services);
        room.admit(controller.clone());
        controller.spawn_execute();
        wait_for(&controller, ControllerState::Running).await;
        while controller.message().is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(room.binding_count(), 1);

        controller.dispose(Disposal::Async).await;
        controller.dispose(Disposal::Async).await;

        assert_eq!(controller.state(), ControllerState::Disposed);
        assert_eq!(transport.deleted.lock().len(), 1);
        assert_eq!(room.binding_count(), 0);

        // Disposed controllers ignore callbacks and never run again
        controller
            .on_callback(&callback(MessageId(1), "retry"))
            .await;
        controller.execute().await;
        assert_eq!(controller.state(), ControllerState::Disposed);
        assert!(transport.answered.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sync_dispose_keeps_message() {
        let (room, transport, services) = setup();
        let controller = Controller::new(&room, MessageId(1), CommandKind::Ping, "", services);
        room.admit(controller.clone());
        controller.execute().await;

        controller.dispose(Disposal::Sync).await;
        assert!(transport.deleted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_equality_by_request_id() {
        let (room, _transport, services) = setup();
        let a = Controller::new(&room, MessageId(1), CommandKind::Ping, "", services.clone());
        let b = Controller::new(&room, MessageId(1), CommandKind::Ping, "", services);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert!(a.age_key() < b.age_key());
    }
}
