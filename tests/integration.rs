//! End-to-end tests for command -> controller -> probe -> transport
//!
//! These drive the session layer through the registry with in-memory
//! transports and probers, without requiring raw sockets or network access.

use async_trait::async_trait;
use hickory_resolver::proto::rr::RecordType;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use netdiag::chat::{
    AddressPolicy, Buttons, CallbackQuery, ChatId, Controller, ControllerState, InboundCommand,
    MessageId, Registry, Services, Transport,
};
use netdiag::error::{Cancelled, LookupError};
use netdiag::lookup::{DnsAnswer, DnsTransport, NameResolver, WhoisTransport};
use netdiag::probe::{ProbeOptions, ProbeReply, ProbeStatus, Prober, ReplyOptions};

const CHAT: ChatId = ChatId(42);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Send(MessageId, String, Buttons),
    Edit(MessageId, String, Buttons),
    Delete(MessageId),
    Answer(String),
}

/// Records every transport call
#[derive(Default)]
struct FakeTransport {
    next_id: Mutex<i32>,
    events: Mutex<Vec<Event>>,
}

impl FakeTransport {
    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Last text and buttons shown on `message`
    fn latest(&self, message: MessageId) -> Option<(String, Buttons)> {
        self.events.lock().iter().rev().find_map(|event| match event {
            Event::Send(id, text, buttons) | Event::Edit(id, text, buttons) if *id == message => {
                Some((text.clone(), *buttons))
            }
            _ => None,
        })
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(
        &self,
        _chat: ChatId,
        _reply_to: Option<MessageId>,
        text: &str,
        buttons: Buttons,
    ) -> anyhow::Result<MessageId> {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            MessageId(1000 + *next)
        };
        self.events.lock().push(Event::Send(id, text.to_string(), buttons));
        Ok(id)
    }

    async fn edit(
        &self,
        _chat: ChatId,
        message: MessageId,
        text: &str,
        buttons: Buttons,
    ) -> anyhow::Result<()> {
        self.events.lock().push(Event::Edit(message, text.to_string(), buttons));
        Ok(())
    }

    async fn delete(&self, _chat: ChatId, message: MessageId) -> anyhow::Result<()> {
        self.events.lock().push(Event::Delete(message));
        Ok(())
    }

    async fn answer_callback(&self, query: &CallbackQuery, text: &str) -> anyhow::Result<()> {
        self.events
            .lock()
            .push(Event::Answer(format!("{}:{}", query.data, text)));
        Ok(())
    }
}

/// Behaves like a five-hop path to every destination: routers at
/// 172.20.0.<ttl> below TTL 5, the destination itself from TTL 5 on.
/// Echo replies alternate between 10ms and 12ms.
#[derive(Default)]
struct PathProber {
    probed: Mutex<Vec<u8>>,
    payloads: Mutex<Vec<usize>>,
}

#[async_trait]
impl Prober for PathProber {
    async fn probe(
        &self,
        host: IpAddr,
        payload: &[u8],
        options: &ProbeOptions,
        cancel: &CancellationToken,
    ) -> Result<ProbeReply, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        self.payloads.lock().push(payload.len());
        let ttl = options.ttl.get();
        let sent = {
            let mut probed = self.probed.lock();
            probed.push(ttl);
            probed.len()
        };

        let (address, status) = if ttl < 5 {
            (
                IpAddr::from([172, 20, 0, ttl]),
                ProbeStatus::TtlExpired,
            )
        } else {
            (host, ProbeStatus::Success)
        };
        let rtt = if sent % 2 == 1 { 10 } else { 12 };
        Ok(ProbeReply {
            address,
            payload: Vec::new(),
            options: Some(ReplyOptions {
                ttl: 60,
                dont_fragment: false,
            }),
            rtt: Duration::from_millis(rtt),
            status,
        })
    }
}

/// Never answers; returns only when cancelled
struct HangingProber;

#[async_trait]
impl Prober for HangingProber {
    async fn probe(
        &self,
        _host: IpAddr,
        _payload: &[u8],
        _options: &ProbeOptions,
        cancel: &CancellationToken,
    ) -> Result<ProbeReply, Cancelled> {
        cancel.cancelled().await;
        Err(Cancelled)
    }
}

/// Zone with a handful of fixed records
struct FakeDns;

#[async_trait]
impl DnsTransport for FakeDns {
    async fn query(
        &self,
        _server: SocketAddr,
        name: &str,
        record_type: RecordType,
    ) -> Result<Vec<DnsAnswer>, LookupError> {
        let answer = |value: &str| -> Result<Vec<DnsAnswer>, LookupError> {
            Ok(vec![DnsAnswer {
                record_type,
                value: value.to_string(),
            }])
        };
        match (name, record_type) {
            ("host.dn42", RecordType::A) => answer("172.20.3.3"),
            ("outside.dn42", RecordType::A) => answer("192.0.2.1"),
            ("broken.dn42", RecordType::AAAA) => Err(LookupError::Timeout),
            _ => Ok(Vec::new()),
        }
    }

    async fn reverse(
        &self,
        _server: SocketAddr,
        address: IpAddr,
    ) -> Result<Option<String>, LookupError> {
        Ok((address == IpAddr::from([172, 20, 0, 1])).then(|| "gw.dn42".to_string()))
    }
}

struct FakeWhois;

#[async_trait]
impl WhoisTransport for FakeWhois {
    async fn query(&self, _address: IpAddr) -> Result<String, LookupError> {
        Ok("route: 172.20.0.0/24\norigin: AS4242420001\n".to_string())
    }
}

/// Answers like [`FakeDns`], but only after `delay`
struct SlowDns {
    delay: Duration,
}

#[async_trait]
impl DnsTransport for SlowDns {
    async fn query(
        &self,
        server: SocketAddr,
        name: &str,
        record_type: RecordType,
    ) -> Result<Vec<DnsAnswer>, LookupError> {
        tokio::time::sleep(self.delay).await;
        FakeDns.query(server, name, record_type).await
    }

    async fn reverse(
        &self,
        server: SocketAddr,
        address: IpAddr,
    ) -> Result<Option<String>, LookupError> {
        tokio::time::sleep(self.delay).await;
        FakeDns.reverse(server, address).await
    }
}

fn registry(prober: Arc<dyn Prober>) -> (Registry, Arc<FakeTransport>) {
    registry_with_dns(prober, Arc::new(FakeDns))
}

fn registry_with_dns(
    prober: Arc<dyn Prober>,
    dns: Arc<dyn DnsTransport>,
) -> (Registry, Arc<FakeTransport>) {
    let transport = Arc::new(FakeTransport::default());
    let resolver = NameResolver::new(
        dns,
        Arc::new(FakeWhois),
        "172.20.0.53:53".parse().unwrap(),
        Duration::from_secs(60),
    );
    let services = Arc::new(Services {
        transport: transport.clone(),
        prober,
        resolver: Arc::new(resolver),
        policy: AddressPolicy::default(),
    });
    (Registry::new(services), transport)
}

fn command(text: &str) -> InboundCommand {
    InboundCommand::parse(CHAT, 7, MessageId(1), text).unwrap()
}

fn press(message: MessageId, data: &str) -> CallbackQuery {
    CallbackQuery {
        id: "press".to_string(),
        chat: CHAT,
        sender: 7,
        message,
        data: data.to_string(),
    }
}

async fn settle(controller: &Controller, wanted: ControllerState) {
    for _ in 0..400 {
        if controller.state() == wanted {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "controller stuck in {:?}, wanted {:?}",
        controller.state(),
        wanted
    );
}

async fn first_message(controller: &Controller) -> MessageId {
    for _ in 0..400 {
        if let Some(message) = controller.message() {
            return message;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("controller never sent a message");
}

#[tokio::test]
async fn test_ping_session_end_to_end() {
    let prober = Arc::new(PathProber::default());
    let (registry, transport) = registry(prober.clone());

    let controller = registry
        .handle_command(command("/ping -c 2 -s 32 -i 0 172.20.1.1"))
        .unwrap();
    settle(&controller, ControllerState::StandBy).await;

    let message = controller.message().unwrap();
    let (text, buttons) = transport.latest(message).unwrap();
    assert_eq!(buttons, Buttons::Retry);
    assert_eq!(
        text,
        "PING 172.20.1.1 with 32 bytes of data\n\
         Reply from 172.20.1.1: Seq=1 TTL=60 Time=10.00ms\n\
         Reply from 172.20.1.1: Seq=2 TTL=60 Time=12.00ms\n\
         \n\
         --- 172.20.1.1 Ping statistics ---\n\
         0.00% packet loss, time 22.00ms\n\
         RTT min/avg/max = 10.00/11.00/12.00 ms"
    );

    // Header first, with a Cancel button while running
    match &transport.events()[0] {
        Event::Send(id, text, Buttons::Cancel) => {
            assert_eq!(*id, message);
            assert_eq!(text, "PING 172.20.1.1 with 32 bytes of data");
        }
        other => panic!("unexpected first event {:?}", other),
    }

    assert_eq!(*prober.payloads.lock(), vec![32, 32]);

    let room = registry.room(CHAT).unwrap();
    assert_eq!(room.controller_for(message), Some(controller));
    assert!(room.bindings_consistent());
}

#[tokio::test]
async fn test_oversized_payload_is_rejected() {
    let prober = Arc::new(PathProber::default());
    let (registry, transport) = registry(prober.clone());

    let controller = registry
        .handle_command(command("/ping -c 1 -s 1099511627776 172.20.1.1"))
        .unwrap();
    settle(&controller, ControllerState::Completed).await;

    let (text, buttons) = transport.latest(controller.message().unwrap()).unwrap();
    assert!(text.starts_with("Error: invalid size value \"1099511627776\"\n"));
    assert_eq!(buttons, Buttons::None);
    assert!(prober.probed.lock().is_empty());
}

#[tokio::test]
async fn test_dispose_interrupts_name_resolution() {
    let dns = Arc::new(SlowDns {
        delay: Duration::from_secs(2),
    });
    let (registry, transport) = registry_with_dns(Arc::new(PathProber::default()), dns);

    let controller = registry
        .handle_command(command("/ping -c 1 host.dn42"))
        .unwrap();
    settle(&controller, ControllerState::Running).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    controller.dispose(netdiag::chat::Disposal::Sync).await;

    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(controller.state(), ControllerState::Disposed);
    assert!(transport.events().is_empty());
}

#[tokio::test]
async fn test_ping_resolves_permitted_domain() {
    let (registry, transport) = registry(Arc::new(PathProber::default()));

    let controller = registry
        .handle_command(command("/ping -c 1 host.dn42"))
        .unwrap();
    settle(&controller, ControllerState::StandBy).await;

    let (text, _) = transport.latest(controller.message().unwrap()).unwrap();
    assert!(text.starts_with("PING host.dn42 (172.20.3.3) with 56 bytes of data\n"));
    assert!(text.contains("--- host.dn42 Ping statistics ---"));
}

#[tokio::test]
async fn test_ping_rejects_resolved_address_outside_policy() {
    let (registry, transport) = registry(Arc::new(PathProber::default()));

    let controller = registry
        .handle_command(command("/ping outside.dn42"))
        .unwrap();
    settle(&controller, ControllerState::Completed).await;

    let (text, buttons) = transport.latest(controller.message().unwrap()).unwrap();
    assert_eq!(text, "Error: IP address out of range");
    assert_eq!(buttons, Buttons::None);
}

#[tokio::test]
async fn test_ping_unresolvable_domain() {
    let (registry, transport) = registry(Arc::new(PathProber::default()));

    let controller = registry
        .handle_command(command("/ping missing.dn42"))
        .unwrap();
    settle(&controller, ControllerState::Completed).await;

    let (text, _) = transport.latest(controller.message().unwrap()).unwrap();
    assert_eq!(text, "Error: cannot resolve domain \"missing.dn42\"");
}

#[tokio::test]
async fn test_trace_stops_at_destination() {
    let prober = Arc::new(PathProber::default());
    let (registry, transport) = registry(prober.clone());

    let controller = registry
        .handle_command(command("/trace -i 0 172.20.1.5"))
        .unwrap();
    settle(&controller, ControllerState::StandBy).await;

    assert_eq!(*prober.probed.lock(), vec![1, 2, 3, 4, 5]);

    let (text, buttons) = transport.latest(controller.message().unwrap()).unwrap();
    assert_eq!(buttons, Buttons::Retry);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines[0],
        "traceroute to 172.20.1.5, 10 hops max, with 56 bytes of data"
    );
    // Hop 1 has a PTR record, so it spans two lines
    assert!(lines[1].starts_with("1   gw.dn42"));
    assert!(lines[1].ends_with("AS4242420001"));
    assert!(lines[2].starts_with("    (172.20.0.1)"));
    let last_hop = lines.iter().position(|l| l.starts_with("5   ")).unwrap();
    assert!(lines[last_hop].starts_with("5   172.20.1.5"));
    assert_eq!(lines[last_hop + 1].trim(), "10.00ms");
    assert!(!text.contains("cancelled"));
}

#[tokio::test]
async fn test_lookup_session() {
    let (registry, transport) = registry(Arc::new(PathProber::default()));

    let controller = registry
        .handle_command(command("/dig -t A -t AAAA broken.dn42"))
        .unwrap();
    settle(&controller, ControllerState::Completed).await;

    let (text, buttons) = transport.latest(controller.message().unwrap()).unwrap();
    assert_eq!(buttons, Buttons::None);
    assert_eq!(
        text,
        "Address: 172.20.0.53#53\n\nRecords:\n\ncan't find broken.dn42: Lookup timed out"
    );

    let room = registry.room(CHAT).unwrap();
    assert_eq!(room.binding_count(), 0);
}

#[tokio::test]
async fn test_cancel_then_retry() {
    let (registry, transport) = registry(Arc::new(HangingProber));

    let controller = registry
        .handle_command(command("/ping 172.20.1.1"))
        .unwrap();
    settle(&controller, ControllerState::Running).await;
    let message = first_message(&controller).await;
    let first = controller.cancellation();

    registry.handle_callback(&press(message, "cancel")).await;
    settle(&controller, ControllerState::StandBy).await;
    assert!(first.is_cancelled());

    let (text, buttons) = transport.latest(message).unwrap();
    assert!(text.ends_with("Operation had been cancelled by user"));
    assert_eq!(buttons, Buttons::Retry);

    registry.handle_callback(&press(message, "retry")).await;
    settle(&controller, ControllerState::Running).await;
    let second = controller.cancellation();
    assert!(!second.is_cancelled());

    // Retry edits the same message instead of sending a new one
    let sends = transport
        .events()
        .iter()
        .filter(|e| matches!(e, Event::Send(..)))
        .count();
    assert_eq!(sends, 1);

    let answers: Vec<Event> = transport
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::Answer(_)))
        .collect();
    assert_eq!(
        answers,
        vec![
            Event::Answer("cancel:Ok".to_string()),
            Event::Answer("retry:Ok".to_string())
        ]
    );

    controller.cancel();
    settle(&controller, ControllerState::StandBy).await;
}

#[tokio::test]
async fn test_stale_callback_is_dropped() {
    let (registry, transport) = registry(Arc::new(PathProber::default()));

    registry.handle_callback(&press(MessageId(9999), "retry")).await;

    assert!(transport.events().is_empty());
    assert!(registry.room(CHAT).unwrap().is_empty());
}

#[tokio::test]
async fn test_sweep_keeps_newest_and_running() {
    let (registry, transport) = registry(Arc::new(HangingProber));

    // Finished: usage text only
    let done = registry.handle_command(command("/ping")).unwrap();
    settle(&done, ControllerState::Completed).await;

    // Still probing
    let running = registry
        .handle_command(command("/ping 172.20.1.1"))
        .unwrap();
    settle(&running, ControllerState::Running).await;

    // Finished with a Retry button
    let stand_by = registry
        .handle_command(command("/ping 172.20.1.2"))
        .unwrap();
    let stand_by_message = first_message(&stand_by).await;
    stand_by.cancel();
    settle(&stand_by, ControllerState::StandBy).await;

    // Newest, finished
    let newest = registry.handle_command(command("/trace")).unwrap();
    settle(&newest, ControllerState::Completed).await;

    assert_eq!(registry.sweep_all().await, 2);

    let room = registry.room(CHAT).unwrap();
    assert_eq!(room.len(), 2);
    assert!(room.contains(running.request_id()));
    assert!(room.contains(newest.request_id()));
    assert_eq!(done.state(), ControllerState::Disposed);
    assert_eq!(stand_by.state(), ControllerState::Disposed);
    assert!(room.controller_for(stand_by_message).is_none());
    assert!(room.bindings_consistent());

    // Async disposal deletes the outbound messages
    let deleted: Vec<MessageId> = transport
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Delete(id) => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(deleted.len(), 2);
    assert!(deleted.contains(&stand_by_message));

    // A press on a retired message is dropped
    registry.handle_callback(&press(stand_by_message, "retry")).await;
    assert_eq!(stand_by.state(), ControllerState::Disposed);

    running.dispose(netdiag::chat::Disposal::Sync).await;
    assert_eq!(running.state(), ControllerState::Disposed);
}

#[tokio::test]
async fn test_sweep_single_controller_is_noop() {
    let (registry, _) = registry(Arc::new(PathProber::default()));

    let only = registry.handle_command(command("/ping")).unwrap();
    settle(&only, ControllerState::Completed).await;

    assert_eq!(registry.sweep_all().await, 0);
    assert_eq!(only.state(), ControllerState::Completed);
}
