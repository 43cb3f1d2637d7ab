use log::{debug, info, trace, warn};
use std::{
    collections::HashMap,
    error, fmt,
    future::{self, Future},
    io,
    net::{IpAddr, SocketAddr},
    pin::pin,
    sync::Arc,
    task::Poll,
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    runtime,
    sync::{mpsc, oneshot},
    task::JoinSet,
    time,
};

mod crypto;
mod informational;
mod message;
mod phase1;
mod phase2;
mod policy;
mod proposal;
mod registry;
mod replay;
mod sadb;

pub use crypto::{DhGroup, EncryptionAlgorithm, HashAlgorithm};
pub use message::{ExchangeType, ProtocolId};
pub use phase1::CookiePair;
pub use policy::{
    CheckLevel, DpdConfig, Phase1Policy, Phase2Policy, PolicySnapshot, RetransmitConfig, Selector,
};
pub use proposal::{
    AuthAlgorithm, AuthenticationMethod, EncapsulationMode, IpsecTransform, IsakmpTransform,
    Lifetime, ProtocolProposal, SaProposal, AH_TRANSFORM_SHA, ESP_TRANSFORM_3DES,
    ESP_TRANSFORM_AES,
};
pub use sadb::{SaInstall, SadbEvent, SadbRequest};

use informational::InformationalAction;
use message::{InputMessage, NotifyMessageType};
use phase1::{NegotiationError, Phase1Action, Phase1Session, Role, TimerKind};
use phase2::{Phase2Action, Phase2Session, Phase2State};
use registry::SessionRegistry;
use replay::{ReplayCache, ReplayCheck};
use sadb::{InstalledSaTable, SadbHandle};

const MAX_DATAGRAM_SIZE: usize = 1500;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(15);

// Fallbacks when neither the negotiated proposal nor the policy carries a
// lifetime in seconds.
const DEFAULT_PHASE1_LIFETIME: u32 = 28800;
const DEFAULT_PHASE2_LIFETIME: u32 = 3600;

pub struct Config {
    pub port: u16,
    pub listen_ips: Vec<IpAddr>,
    pub policy: PolicySnapshot,
}

pub struct Server {
    listen_ips: Vec<IpAddr>,
    port: u16,
    policy: Arc<PolicySnapshot>,
    command_sender: Option<mpsc::Sender<SessionMessage>>,
    cancel_sender: Option<oneshot::Sender<()>>,
    join_set: JoinSet<Result<(), IkeError>>,
}

impl Server {
    pub fn new(config: Config) -> Server {
        Server {
            listen_ips: config.listen_ips,
            port: config.port,
            policy: Arc::new(config.policy),
            command_sender: None,
            cancel_sender: None,
            join_set: JoinSet::new(),
        }
    }

    async fn send_cleanup_ticks(
        duration: Duration,
        dest: mpsc::Sender<SessionMessage>,
    ) -> Result<(), IkeError> {
        let mut interval = tokio::time::interval(duration);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            dest.send(SessionMessage::CleanupTimer)
                .await
                .map_err(|_| "Channel closed")?;
        }
    }

    async fn send_dpd_ticks(
        duration: Duration,
        dest: mpsc::Sender<SessionMessage>,
    ) -> Result<(), IkeError> {
        let mut interval = tokio::time::interval(duration);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            dest.send(SessionMessage::DpdTimer)
                .await
                .map_err(|_| "Channel closed")?;
        }
    }

    pub async fn terminate(&mut self) -> Result<(), IkeError> {
        match self.cancel_sender.take() {
            Some(cancel_sender) => {
                if cancel_sender.send(()).is_err() {
                    return Err("Cancel channel closed".into());
                }
            }
            None => return Err("Shutdown already in progress".into()),
        }
        while let Some(res) = self.join_set.join_next().await {
            if let Err(err) = res {
                warn!("Error returned when shutting down: {}", err);
            }
        }
        Ok(())
    }

    // Requests a report of the phase-1 session table from the running server.
    pub async fn dump_sessions(&self) -> Result<String, IkeError> {
        let sender = self
            .command_sender
            .as_ref()
            .ok_or(IkeError::Internal("Server is not running"))?;
        let (tx, rx) = oneshot::channel();
        sender
            .send(SessionMessage::Dump(tx))
            .await
            .map_err(|_| IkeError::Internal("Command channel closed"))?;
        rx.await
            .map_err(|_| IkeError::Internal("Command channel closed"))
    }

    // Swaps in a new policy snapshot. Sessions still compatible with the new
    // policy keep running; the rest are torn down.
    pub async fn reconfigure(&self, policy: PolicySnapshot) -> Result<(), IkeError> {
        let sender = self
            .command_sender
            .as_ref()
            .ok_or(IkeError::Internal("Server is not running"))?;
        sender
            .send(SessionMessage::Reconfigure(Box::new(policy)))
            .await
            .map_err(|_| IkeError::Internal("Command channel closed"))
    }

    pub async fn start(
        &mut self,
        sadb_requests: mpsc::Sender<SadbRequest>,
        sadb_events: mpsc::Receiver<SadbEvent>,
    ) -> Result<mpsc::Receiver<SessionEvent>, IkeError> {
        let sockets = Sockets::new(&self.listen_ips, self.port).await?;
        let listen_addrs = sockets.listen_addrs();

        let rt = runtime::Handle::current();
        let (command_sender, command_receiver) = mpsc::channel(32);
        // Non-critical futures will be terminated by Tokio during the
        // shutdown_timeout phase.
        rt.spawn(Server::send_cleanup_ticks(
            CLEANUP_INTERVAL,
            command_sender.clone(),
        ));
        if let Some(dpd) = &self.policy.phase1.dpd {
            rt.spawn(Server::send_dpd_ticks(dpd.interval, command_sender.clone()));
        }

        let (event_sender, event_receiver) = mpsc::channel(64);
        let sessions = Sessions::new(
            self.policy.clone(),
            self.port,
            listen_addrs,
            command_sender.clone(),
            sockets.create_sender(),
            SadbHandle::new(sadb_requests),
            event_sender,
        );
        let (cancel_sender, cancel_receiver) = oneshot::channel();
        self.cancel_sender = Some(cancel_sender);
        self.command_sender = Some(command_sender.clone());
        rt.spawn(async move {
            if cancel_receiver.await.is_ok()
                && command_sender.send(SessionMessage::Shutdown).await.is_err()
            {
                warn!("Command channel closed");
            }
        });

        self.join_set.spawn_on(
            Self::run(command_receiver, sockets, sessions, sadb_events),
            &rt,
        );
        Ok(event_receiver)
    }

    async fn run(
        mut command_receiver: mpsc::Receiver<SessionMessage>,
        mut sockets: Sockets,
        mut sessions: Sessions,
        mut sadb_events: mpsc::Receiver<SadbEvent>,
    ) -> Result<(), IkeError> {
        let mut shutdown = false;
        loop {
            if shutdown && sessions.is_empty() {
                debug!("Shutdown completed");
                return Ok(());
            }
            // Wait until something is ready.
            let (command_message, datagram, sadb_event) = {
                let mut receive_command = pin!(command_receiver.recv());
                let mut receive_udp = pin!(sockets.receive_datagram());
                let mut receive_sadb = pin!(sadb_events.recv());
                future::poll_fn(move |cx| {
                    let mut ready = false;
                    let received_command = receive_command.as_mut().poll(cx);
                    ready = ready || received_command.is_ready();
                    let received_command = match received_command {
                        Poll::Ready(cmd) => cmd,
                        Poll::Pending => None,
                    };
                    let received_udp = receive_udp.as_mut().poll(cx);
                    ready = ready || received_udp.is_ready();
                    let received_udp = match received_udp {
                        Poll::Ready(cmd) => cmd,
                        Poll::Pending => None,
                    };
                    let received_sadb = receive_sadb.as_mut().poll(cx);
                    ready = ready || received_sadb.is_ready();
                    let received_sadb = match received_sadb {
                        Poll::Ready(cmd) => cmd,
                        Poll::Pending => None,
                    };
                    if ready {
                        Poll::Ready((received_command, received_udp, received_sadb))
                    } else {
                        Poll::Pending
                    }
                })
                .await
            };
            // Process all ready events.
            if let Some(message) = command_message {
                if let SessionMessage::Shutdown = message {
                    shutdown = true;
                }
                sessions.process_message(message).await;
            }
            if let Some(datagram) = datagram {
                if let Err(err) = sessions.process_datagram(&datagram).await {
                    warn!(
                        "Failed to process message from {}: {}",
                        datagram.remote_addr, err
                    );
                }
            }
            if let Some(event) = sadb_event {
                sessions.process_sadb_event(event).await;
            }
        }
    }
}

struct Sockets {
    listen_addrs: Vec<SocketAddr>,
    listen_rx: mpsc::Receiver<UdpDatagram>,
    send_tx: mpsc::Sender<SendUdpDatagram>,
}

impl Sockets {
    async fn new(listen_ips: &[IpAddr], port: u16) -> Result<Sockets, IkeError> {
        let mut sockets = HashMap::new();
        for listen_ip in listen_ips {
            let socket = match UdpSocket::bind((*listen_ip, port)).await {
                Ok(socket) => socket,
                Err(err) => {
                    log::error!("Failed to open listener on {}: {}", listen_ip, err);
                    return Err(err.into());
                }
            };
            let listen_addr = socket.local_addr()?;
            info!("Started server on {}", listen_addr);
            sockets.insert(listen_addr, Arc::new(socket));
        }
        let listen_addrs = sockets.keys().copied().collect();
        let rt = runtime::Handle::current();
        let (listen_tx, listen_rx) = mpsc::channel(16);
        sockets.iter().for_each(|(listen_addr, socket)| {
            rt.spawn(Self::run_receiver(
                listen_tx.clone(),
                *listen_addr,
                socket.clone(),
            ));
        });
        let (send_tx, send_rx) = mpsc::channel(16);
        rt.spawn(Self::run_sender(send_rx, sockets));
        Ok(Sockets {
            listen_addrs,
            listen_rx,
            send_tx,
        })
    }

    async fn run_receiver(
        tx: mpsc::Sender<UdpDatagram>,
        listen_addr: SocketAddr,
        socket: Arc<UdpSocket>,
    ) {
        loop {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            let (bytes_res, remote_addr) = match socket.recv_from(&mut buf).await {
                Ok(res) => res,
                Err(err) => {
                    warn!("Failed to receive from socket {}: {}", listen_addr, err);
                    return;
                }
            };
            buf.truncate(bytes_res);
            let msg = UdpDatagram {
                remote_addr,
                local_addr: listen_addr,
                bytes: buf,
            };
            if tx.send(msg).await.is_err() {
                warn!("Channel closed for {}", listen_addr);
                return;
            }
        }
    }

    async fn run_sender(
        mut rx: mpsc::Receiver<SendUdpDatagram>,
        sockets: HashMap<SocketAddr, Arc<UdpSocket>>,
    ) {
        while let Some(datagram) = rx.recv().await {
            let socket = if let Some(socket) = sockets.get(&datagram.local_addr) {
                socket
            } else {
                warn!(
                    "No open sockets for source address {} (destination {})",
                    datagram.local_addr, datagram.remote_addr
                );
                continue;
            };
            if let Err(err) = socket.send_to(&datagram.bytes, datagram.remote_addr).await {
                warn!(
                    "Failed to send UDP message from {} to {}: {}",
                    datagram.local_addr, datagram.remote_addr, err
                );
            }
        }
    }

    fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.listen_addrs.clone()
    }

    async fn receive_datagram(&mut self) -> Option<UdpDatagram> {
        self.listen_rx.recv().await
    }

    fn create_sender(&self) -> UdpSender {
        UdpSender {
            tx: self.send_tx.clone(),
        }
    }
}

struct UdpDatagram {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    bytes: Vec<u8>,
}

#[derive(Clone)]
struct UdpSender {
    tx: mpsc::Sender<SendUdpDatagram>,
}

impl UdpSender {
    async fn send_datagram(
        &self,
        local_addr: &SocketAddr,
        remote_addr: &SocketAddr,
        data: &[u8],
    ) -> Result<(), SendError> {
        let mut buffer = Vec::with_capacity(MAX_DATAGRAM_SIZE);
        buffer.extend_from_slice(data);
        self.tx
            .send(SendUdpDatagram {
                local_addr: *local_addr,
                remote_addr: *remote_addr,
                bytes: buffer,
            })
            .await
            .map_err(|_| "UDP sender channel closed".into())
    }
}

struct SendUdpDatagram {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    bytes: Vec<u8>,
}

enum SessionMessage {
    Phase1Timer(CookiePair, u64),
    Phase2Timer(u32, u64),
    CleanupTimer,
    DpdTimer,
    Reconfigure(Box<PolicySnapshot>),
    Dump(oneshot::Sender<String>),
    Shutdown,
}

// Lifecycle notifications for whoever supervises the daemon.
#[derive(Debug)]
pub enum SessionEvent {
    Phase1Up {
        cookies: CookiePair,
        remote_addr: SocketAddr,
    },
    Phase1Down {
        cookies: CookiePair,
        remote_addr: SocketAddr,
    },
    Phase2Up {
        sequence: u32,
        policy_id: u32,
        remote_addr: SocketAddr,
    },
    Phase2Down {
        sequence: u32,
        policy_id: u32,
        remote_addr: SocketAddr,
    },
}

// What a fired timer found when it checked its session.
enum TimerVerdict {
    Resend(SocketAddr, SocketAddr, Vec<u8>),
    GiveUp,
    Expire,
}

struct Sessions {
    policy: Arc<PolicySnapshot>,
    port: u16,
    listen_addrs: Vec<SocketAddr>,
    registry: SessionRegistry,
    replay: ReplayCache,
    installed: InstalledSaTable,
    sadb: SadbHandle,
    udp_sender: UdpSender,
    command_sender: mpsc::Sender<SessionMessage>,
    event_sender: mpsc::Sender<SessionEvent>,
    // Acquires waiting for an ISAKMP SA with the peer to come up.
    pending_acquires: HashMap<IpAddr, Vec<u32>>,
    shutdown: bool,
}

impl Sessions {
    fn new(
        policy: Arc<PolicySnapshot>,
        port: u16,
        listen_addrs: Vec<SocketAddr>,
        command_sender: mpsc::Sender<SessionMessage>,
        udp_sender: UdpSender,
        sadb: SadbHandle,
        event_sender: mpsc::Sender<SessionEvent>,
    ) -> Sessions {
        let replay = ReplayCache::new(
            policy.retransmit.max_retries,
            policy.retransmit.retry_interval,
        );
        Sessions {
            policy,
            port,
            listen_addrs,
            registry: SessionRegistry::new(),
            replay,
            installed: InstalledSaTable::new(),
            sadb,
            udp_sender,
            command_sender,
            event_sender,
            pending_acquires: HashMap::new(),
            shutdown: false,
        }
    }

    fn is_empty(&self) -> bool {
        self.registry.phase1_count() == 0 && self.registry.phase2_count() == 0
    }

    fn emit(&self, event: SessionEvent) {
        // Monitoring is best-effort; a full channel drops the event.
        let _ = self.event_sender.try_send(event);
    }

    fn schedule_message(&self, delay: Duration, message: SessionMessage) {
        let sender = self.command_sender.clone();
        let rt = runtime::Handle::current();
        rt.spawn(async move {
            time::sleep(delay).await;
            let _ = sender.send(message).await;
        });
    }

    async fn process_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Phase1Timer(cookies, generation) => {
                self.process_phase1_timer(cookies, generation).await
            }
            SessionMessage::Phase2Timer(sequence, generation) => {
                self.process_phase2_timer(sequence, generation).await
            }
            SessionMessage::CleanupTimer => self.process_cleanup(),
            SessionMessage::DpdTimer => self.process_dpd_tick().await,
            SessionMessage::Reconfigure(policy) => self.apply_reconfigure(*policy),
            SessionMessage::Dump(sender) => {
                let _ = sender.send(self.registry.dump_phase1());
            }
            SessionMessage::Shutdown => self.shutdown_all().await,
        }
    }

    // Inbound datagrams.

    async fn process_datagram(&mut self, datagram: &UdpDatagram) -> Result<(), IkeError> {
        match self.replay.check(&datagram.bytes, datagram.remote_addr) {
            ReplayCheck::New => {}
            ReplayCheck::Replay(Some(reply)) => {
                debug!("Resending cached reply to {}", datagram.remote_addr);
                let local_addr = self
                    .replay
                    .local_addr_for(&datagram.bytes)
                    .unwrap_or(datagram.local_addr);
                self.udp_sender
                    .send_datagram(&local_addr, &datagram.remote_addr, &reply)
                    .await?;
                return Ok(());
            }
            ReplayCheck::Replay(None) => {
                debug!(
                    "Dropping retransmitted message from {}",
                    datagram.remote_addr
                );
                return Ok(());
            }
            ReplayCheck::AddressMismatch(original) => {
                warn!(
                    "Dropping message from {} replaying a datagram first seen from {}",
                    datagram.remote_addr, original
                );
                return Ok(());
            }
        }
        let msg = InputMessage::from_datagram(&datagram.bytes)?;
        if !msg.is_valid() {
            return Err("Invalid ISAKMP message".into());
        }
        trace!(
            "Received ISAKMP message from {}: {}",
            datagram.remote_addr,
            crate::logger::fmt_slice_hex(&datagram.bytes)
        );
        match msg.read_exchange_type()? {
            ExchangeType::IDENTITY_PROTECTION | ExchangeType::AGGRESSIVE | ExchangeType::BASE => {
                self.process_phase1(datagram, &msg).await
            }
            ExchangeType::QUICK_MODE => self.process_quick_mode(datagram, &msg).await,
            ExchangeType::INFORMATIONAL => self.process_informational(datagram, &msg).await,
            _ => Err("Unsupported exchange type".into()),
        }
    }

    async fn process_phase1(
        &mut self,
        datagram: &UdpDatagram,
        msg: &InputMessage<'_>,
    ) -> Result<(), IkeError> {
        let cookies = CookiePair {
            initiator: msg.read_initiator_cookie(),
            responder: msg.read_responder_cookie(),
        };
        let mut created = false;
        let key = if self.registry.phase1_mut(&cookies).is_some() {
            cookies
        } else if cookies.responder == [0u8; 8] {
            if let Some(session) = self.registry.phase1_by_initiator(cookies.initiator) {
                session.cookies()
            } else {
                if self.shutdown {
                    return Err("Shutting down, not accepting new negotiations".into());
                }
                let exchange_type = msg.read_exchange_type()?;
                if !self.policy.phase1.allows_exchange(exchange_type) {
                    return Err("Exchange type not allowed by policy".into());
                }
                let session = Phase1Session::new_responder(
                    cookies.initiator,
                    datagram.local_addr,
                    datagram.remote_addr,
                    exchange_type,
                    self.policy.clone(),
                );
                let key = session.cookies();
                self.registry.insert_phase1(session);
                created = true;
                key
            }
        } else if let Some(session) = self.registry.phase1_half_open(cookies.initiator) {
            // Our initiator handle learns the responder cookie from this
            // message.
            session.cookies()
        } else {
            return Err("No ISAKMP SA for phase 1 message".into());
        };
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let result = match self.registry.phase1_mut(&key) {
            Some(session) => session.process_message(msg, &mut buf),
            None => return Err("ISAKMP SA disappeared".into()),
        };
        let full = self.registry.phase1_mut(&key).map(|session| session.cookies());
        let key = match full {
            Some(full) if full != key => {
                self.registry.rekey_phase1(&key, full);
                full
            }
            _ => key,
        };
        match result {
            Ok(Phase1Action::None) => {
                self.replay.store(
                    &datagram.bytes,
                    datagram.remote_addr,
                    datagram.local_addr,
                    None,
                );
                Ok(())
            }
            Ok(Phase1Action::Reply(length)) => {
                self.udp_sender
                    .send_datagram(&datagram.local_addr, &datagram.remote_addr, &buf[..length])
                    .await?;
                self.replay.store(
                    &datagram.bytes,
                    datagram.remote_addr,
                    datagram.local_addr,
                    Some(&buf[..length]),
                );
                self.arm_phase1_retransmit(key);
                Ok(())
            }
            Ok(Phase1Action::Established(length)) => {
                if length > 0 {
                    self.udp_sender
                        .send_datagram(&datagram.local_addr, &datagram.remote_addr, &buf[..length])
                        .await?;
                    self.replay.store(
                        &datagram.bytes,
                        datagram.remote_addr,
                        datagram.local_addr,
                        Some(&buf[..length]),
                    );
                } else {
                    self.replay.store(
                        &datagram.bytes,
                        datagram.remote_addr,
                        datagram.local_addr,
                        None,
                    );
                }
                self.finish_phase1(key).await;
                Ok(())
            }
            Err(err) => {
                warn!(
                    "Failed to process phase 1 message from {}: {}",
                    datagram.remote_addr, err
                );
                if let Some(notify_type) = err.notify_type() {
                    let length = self.registry.phase1_mut(&key).and_then(|session| {
                        informational::send_notification(
                            session,
                            ProtocolId::ISAKMP,
                            notify_type,
                            &[],
                            &mut buf,
                        )
                        .ok()
                    });
                    if let Some(length) = length {
                        let _ = self
                            .udp_sender
                            .send_datagram(
                                &datagram.local_addr,
                                &datagram.remote_addr,
                                &buf[..length],
                            )
                            .await;
                    }
                }
                // An error reported to the peer is fatal to the handle;
                // unauthenticated garbage is dropped without touching state.
                if created || err.notify_type().is_some() {
                    self.teardown_phase1(key, false).await;
                }
                Ok(())
            }
        }
    }

    async fn finish_phase1(&mut self, cookies: CookiePair) {
        let info = {
            let Some(session) = self.registry.phase1_mut(&cookies) else {
                return;
            };
            session.cancel_timer();
            let lifetime = session
                .approval()
                .and_then(|approval| approval.life.seconds)
                .or(session.policy().phase1.lifetime.seconds)
                .unwrap_or(DEFAULT_PHASE1_LIFETIME);
            let claim = if session.role() == Role::Responder {
                session
                    .approval()
                    .filter(|approval| approval.responder_lifetime)
                    .map(|approval| proposal::serialize_notify_lifetime(&approval.life))
            } else {
                None
            };
            (session.remote_addr(), lifetime, claim)
        };
        let (remote_addr, lifetime, claim) = info;
        self.arm_phase1_expiry(cookies, Duration::from_secs(u64::from(lifetime)));
        info!("ISAKMP SA {} established with {}", cookies, remote_addr);
        self.emit(SessionEvent::Phase1Up {
            cookies,
            remote_addr,
        });
        if let Some(data) = claim {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            let sent = self.registry.phase1_mut(&cookies).and_then(|session| {
                informational::send_notification(
                    session,
                    ProtocolId::ISAKMP,
                    NotifyMessageType::RESPONDER_LIFETIME,
                    &data,
                    &mut buf,
                )
                .ok()
                .map(|length| (session.local_addr(), length))
            });
            if let Some((local_addr, length)) = sent {
                debug!("Sending RESPONDER-LIFETIME to {}", remote_addr);
                if let Err(err) = self
                    .udp_sender
                    .send_datagram(&local_addr, &remote_addr, &buf[..length])
                    .await
                {
                    warn!(
                        "Failed to send RESPONDER-LIFETIME to {}: {}",
                        remote_addr, err
                    );
                }
            }
        }
        if self.registry.first_contact(remote_addr.ip()) {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            let sent = self.registry.phase1_mut(&cookies).and_then(|session| {
                informational::send_initial_contact(session, &mut buf)
                    .ok()
                    .map(|length| (session.local_addr(), length))
            });
            if let Some((local_addr, length)) = sent {
                debug!("Sending INITIAL-CONTACT to {}", remote_addr);
                if let Err(err) = self
                    .udp_sender
                    .send_datagram(&local_addr, &remote_addr, &buf[..length])
                    .await
                {
                    warn!("Failed to send INITIAL-CONTACT to {}: {}", remote_addr, err);
                }
            }
        }
        if let Some(pending) = self.pending_acquires.remove(&remote_addr.ip()) {
            for policy_id in pending {
                if let Err(err) = self.start_phase2(cookies, policy_id) {
                    warn!(
                        "Failed to start phase 2 negotiation for policy {}: {}",
                        policy_id, err
                    );
                }
            }
        }
    }

    async fn process_quick_mode(
        &mut self,
        datagram: &UdpDatagram,
        msg: &InputMessage<'_>,
    ) -> Result<(), IkeError> {
        let cookies = CookiePair {
            initiator: msg.read_initiator_cookie(),
            responder: msg.read_responder_cookie(),
        };
        let message_id = msg.read_message_id();
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let existing = {
            match self
                .registry
                .phase2_by_message_id_with_phase1(&cookies, message_id)
            {
                Some((session, phase1)) => {
                    let sequence = session.sequence();
                    let result = match (session.role(), session.state()) {
                        (Role::Initiator, Phase2State::Msg1Sent) => {
                            session.process_sa_reply(phase1, msg, &mut buf)
                        }
                        (Role::Responder, Phase2State::Msg1Sent) => {
                            session.process_final_hash(phase1, msg)
                        }
                        _ => Err(NegotiationError::new(
                            "Unexpected Quick Mode message for negotiation state",
                        )),
                    };
                    Some((sequence, result))
                }
                None => None,
            }
        };
        if let Some((sequence, result)) = existing {
            match result {
                Ok(action) => {
                    self.apply_phase2_action(sequence, action, &buf, Some(datagram))
                        .await;
                }
                Err(err) => {
                    warn!(
                        "Failed to process Quick Mode message from {}: {}",
                        datagram.remote_addr, err
                    );
                    self.notify_phase2_failure(cookies, &err, datagram).await;
                    self.teardown_phase2(sequence, false).await;
                }
            }
            return Ok(());
        }
        if self.shutdown {
            return Err("Shutting down, not accepting new negotiations".into());
        }
        // A new inbound Quick Mode needs an established ISAKMP SA and a
        // matching phase 2 policy.
        let phase2_policy = {
            let Some(phase1) = self.registry.phase1(&cookies) else {
                return Err("No ISAKMP SA for Quick Mode message".into());
            };
            if !phase1.is_established() {
                return Err("Quick Mode message before ISAKMP SA is established".into());
            }
            let policy = phase1.policy();
            policy
                .find_phase2_by_selectors(&datagram.local_addr.ip(), &datagram.remote_addr.ip())
                .or_else(|| policy.phase2.first())
                .cloned()
                .ok_or("No phase 2 policy for peer")?
        };
        let sequence = self.registry.reserve_sequence();
        let session = {
            let Some(phase1) = self.registry.phase1(&cookies) else {
                return Err("ISAKMP SA disappeared".into());
            };
            Phase2Session::new_responder(sequence, phase1, message_id, &phase2_policy)
        };
        self.registry.insert_phase2(session);
        let result = {
            let Some((session, phase1)) = self.registry.phase2_with_phase1(sequence) else {
                return Err("Phase 2 handle disappeared".into());
            };
            session.process_initial_message(phase1, msg, &self.sadb)
        };
        match result {
            Ok(action) => {
                self.replay.store(
                    &datagram.bytes,
                    datagram.remote_addr,
                    datagram.local_addr,
                    None,
                );
                self.apply_phase2_action(sequence, action, &buf, None).await;
                Ok(())
            }
            Err(err) => {
                warn!(
                    "Failed to process Quick Mode request from {}: {}",
                    datagram.remote_addr, err
                );
                self.notify_phase2_failure(cookies, &err, datagram).await;
                self.registry.remove_phase2(sequence);
                Ok(())
            }
        }
    }

    async fn notify_phase2_failure(
        &mut self,
        cookies: CookiePair,
        err: &NegotiationError,
        datagram: &UdpDatagram,
    ) {
        let Some(notify_type) = err.notify_type() else {
            return;
        };
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let length = self.registry.phase1_mut(&cookies).and_then(|session| {
            informational::send_notification(session, ProtocolId::ISAKMP, notify_type, &[], &mut buf)
                .ok()
        });
        if let Some(length) = length {
            let _ = self
                .udp_sender
                .send_datagram(&datagram.local_addr, &datagram.remote_addr, &buf[..length])
                .await;
        }
    }

    async fn apply_phase2_action(
        &mut self,
        sequence: u32,
        action: Phase2Action,
        buf: &[u8],
        datagram: Option<&UdpDatagram>,
    ) {
        match action {
            Phase2Action::None => {
                if let Some(datagram) = datagram {
                    self.replay.store(
                        &datagram.bytes,
                        datagram.remote_addr,
                        datagram.local_addr,
                        None,
                    );
                }
            }
            Phase2Action::Reply(length) => {
                let addrs = self
                    .registry
                    .phase2_mut(sequence)
                    .map(|session| (session.local_addr(), session.remote_addr()));
                let Some((local_addr, remote_addr)) = addrs else {
                    return;
                };
                if let Err(err) = self
                    .udp_sender
                    .send_datagram(&local_addr, &remote_addr, &buf[..length])
                    .await
                {
                    warn!("Failed to send Quick Mode message to {}: {}", remote_addr, err);
                }
                if let Some(datagram) = datagram {
                    self.replay.store(
                        &datagram.bytes,
                        datagram.remote_addr,
                        datagram.local_addr,
                        Some(&buf[..length]),
                    );
                }
                self.arm_phase2_retransmit(sequence);
            }
            Phase2Action::Install {
                outputs,
                reply_length,
            } => {
                let info = self.registry.phase2_mut(sequence).map(|session| {
                    (
                        session.local_addr(),
                        session.remote_addr(),
                        session.phase1_cookies(),
                        session.policy_id(),
                        session.role(),
                    )
                });
                let Some((local_addr, remote_addr, cookies, policy_id, role)) = info else {
                    return;
                };
                if reply_length > 0 {
                    if let Err(err) = self
                        .udp_sender
                        .send_datagram(&local_addr, &remote_addr, &buf[..reply_length])
                        .await
                    {
                        warn!(
                            "Failed to send Quick Mode message to {}: {}",
                            remote_addr, err
                        );
                    }
                    if let Some(datagram) = datagram {
                        self.replay.store(
                            &datagram.bytes,
                            datagram.remote_addr,
                            datagram.local_addr,
                            Some(&buf[..reply_length]),
                        );
                    }
                } else if let Some(datagram) = datagram {
                    self.replay.store(
                        &datagram.bytes,
                        datagram.remote_addr,
                        datagram.local_addr,
                        None,
                    );
                }
                for install in outputs {
                    self.installed.insert(install.protocol, &install.spi);
                    if let Err(err) = self.sadb.add_sa(install) {
                        warn!("Failed to install IPsec SA: {}", err);
                    }
                }
                let lifetime = {
                    let Some(session) = self.registry.phase2_mut(sequence) else {
                        return;
                    };
                    session.cancel_timer();
                    session
                        .approval()
                        .and_then(|approval| approval.life.seconds)
                        .unwrap_or(DEFAULT_PHASE2_LIFETIME)
                };
                self.arm_phase2_expiry(sequence, Duration::from_secs(u64::from(lifetime)));
                info!(
                    "IPsec SA {} established with {} (policy {})",
                    sequence, remote_addr, policy_id
                );
                self.emit(SessionEvent::Phase2Up {
                    sequence,
                    policy_id,
                    remote_addr,
                });
                if role == Role::Responder {
                    self.send_responder_lifetime(sequence, cookies).await;
                }
            }
        }
    }

    // Tells the peer which lifetime was actually approved after the responder
    // narrowed the proposed one.
    async fn send_responder_lifetime(&mut self, sequence: u32, cookies: CookiePair) {
        let claim = self.registry.phase2_mut(sequence).and_then(|session| {
            let approval = session.approval()?;
            if !approval.responder_lifetime {
                return None;
            }
            let protocol = approval.protocols.first()?;
            Some((
                session.local_addr(),
                session.remote_addr(),
                protocol.protocol,
                protocol.local_spi.clone(),
                proposal::serialize_notify_lifetime(&approval.life),
            ))
        });
        let Some((local_addr, remote_addr, protocol, spi, data)) = claim else {
            return;
        };
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let length = self.registry.phase1_mut(&cookies).and_then(|phase1| {
            informational::send_ipsec_notification(
                phase1,
                protocol,
                &spi,
                NotifyMessageType::RESPONDER_LIFETIME,
                &data,
                &mut buf,
            )
            .ok()
        });
        if let Some(length) = length {
            debug!("Sending RESPONDER-LIFETIME to {}", remote_addr);
            if let Err(err) = self
                .udp_sender
                .send_datagram(&local_addr, &remote_addr, &buf[..length])
                .await
            {
                warn!(
                    "Failed to send RESPONDER-LIFETIME to {}: {}",
                    remote_addr, err
                );
            }
        }
    }

    async fn process_informational(
        &mut self,
        datagram: &UdpDatagram,
        msg: &InputMessage<'_>,
    ) -> Result<(), IkeError> {
        let cookies = CookiePair {
            initiator: msg.read_initiator_cookie(),
            responder: msg.read_responder_cookie(),
        };
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let outcome = {
            let Some(session) = self.registry.phase1_mut(&cookies) else {
                debug!(
                    "Dropping informational message for unknown ISAKMP SA from {}",
                    datagram.remote_addr
                );
                return Ok(());
            };
            informational::process(session, &self.installed, msg, &mut buf)
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                debug!(
                    "Discarding informational message from {}: {}",
                    datagram.remote_addr, err
                );
                return Ok(());
            }
        };
        if outcome.reply_length > 0 {
            self.udp_sender
                .send_datagram(
                    &datagram.local_addr,
                    &datagram.remote_addr,
                    &buf[..outcome.reply_length],
                )
                .await?;
            self.replay.store(
                &datagram.bytes,
                datagram.remote_addr,
                datagram.local_addr,
                Some(&buf[..outcome.reply_length]),
            );
        } else {
            self.replay.store(
                &datagram.bytes,
                datagram.remote_addr,
                datagram.local_addr,
                None,
            );
        }
        for action in outcome.actions {
            self.apply_informational_action(cookies, datagram.remote_addr, action)
                .await;
        }
        Ok(())
    }

    async fn apply_informational_action(
        &mut self,
        cookies: CookiePair,
        remote_addr: SocketAddr,
        action: InformationalAction,
    ) {
        match action {
            InformationalAction::DeleteIpsecSa { protocol, spi } => {
                let sequence = self
                    .registry
                    .phase2_by_spi(protocol, &spi)
                    .map(|session| session.sequence());
                match sequence {
                    Some(sequence) => {
                        info!("Peer {} deleted IPsec SA {}", remote_addr, sequence);
                        self.teardown_phase2(sequence, false).await;
                    }
                    None => {
                        self.installed.remove(protocol, &spi);
                        let local_ip = self
                            .registry
                            .phase1_mut(&cookies)
                            .map(|session| session.local_addr().ip());
                        if let Some(local_ip) = local_ip {
                            let _ =
                                self.sadb
                                    .delete_sa(protocol, &spi, remote_addr.ip(), local_ip);
                        }
                    }
                }
            }
            InformationalAction::DeletePhase1 => {
                info!("Peer {} deleted ISAKMP SA {}", remote_addr, cookies);
                self.teardown_phase1(cookies, false).await;
            }
            InformationalAction::InitialContact => {
                let sequences = self.registry.phase2_sequences_for_peer(remote_addr.ip());
                if !sequences.is_empty() {
                    info!(
                        "Flushing {} IPsec SAs after INITIAL-CONTACT from {}",
                        sequences.len(),
                        remote_addr
                    );
                }
                for sequence in sequences {
                    self.teardown_phase2(sequence, false).await;
                }
            }
            InformationalAction::Connected => {
                let Some(sequence) = self.registry.phase2_commit_waiting(&cookies) else {
                    debug!(
                        "CONNECTED notification from {} matches no pending negotiation",
                        remote_addr
                    );
                    return;
                };
                let result = {
                    let Some((session, phase1)) = self.registry.phase2_with_phase1(sequence)
                    else {
                        return;
                    };
                    session.connected(phase1)
                };
                match result {
                    Ok(action) => self.apply_phase2_action(sequence, action, &[], None).await,
                    Err(err) => {
                        warn!(
                            "Failed to complete committed negotiation {}: {}",
                            sequence, err
                        );
                        self.teardown_phase2(sequence, false).await;
                    }
                }
            }
            InformationalAction::ResponderLifetime {
                protocol,
                spi,
                lifetime,
            } => {
                let claim = self
                    .registry
                    .phase2_by_spi(protocol, &spi)
                    .map(|session| (session.sequence(), session.age()));
                let (Some((sequence, age)), Some(seconds)) = (claim, lifetime.seconds) else {
                    return;
                };
                // The responder's claimed lifetime overrides what was
                // proposed; expire relative to when the SA came up.
                let remaining =
                    Duration::from_secs(u64::from(seconds)).saturating_sub(age);
                debug!(
                    "Peer {} claims a lifetime of {}s for IPsec SA {}",
                    remote_addr, seconds, sequence
                );
                self.arm_phase2_expiry(sequence, remaining);
            }
            InformationalAction::DpdAcknowledged => {
                trace!("DPD acknowledgment from {}", remote_addr);
            }
        }
    }

    // SA/SPD store events.

    async fn process_sadb_event(&mut self, event: SadbEvent) {
        match event {
            SadbEvent::SpiAllocated {
                sequence,
                protocol,
                spi,
            } => {
                let mut buf = [0u8; MAX_DATAGRAM_SIZE];
                let result = {
                    let Some((session, phase1)) = self.registry.phase2_with_phase1(sequence)
                    else {
                        debug!("SPI allocated for unknown phase 2 handle {}", sequence);
                        return;
                    };
                    session.spi_allocated(phase1, protocol, &spi, &mut buf)
                };
                match result {
                    Ok(Some(length)) => {
                        let addrs = self
                            .registry
                            .phase2_mut(sequence)
                            .map(|session| (session.local_addr(), session.remote_addr()));
                        if let Some((local_addr, remote_addr)) = addrs {
                            if let Err(err) = self
                                .udp_sender
                                .send_datagram(&local_addr, &remote_addr, &buf[..length])
                                .await
                            {
                                warn!(
                                    "Failed to send Quick Mode message to {}: {}",
                                    remote_addr, err
                                );
                            }
                            self.arm_phase2_retransmit(sequence);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(
                            "Failed to continue phase 2 negotiation {}: {}",
                            sequence, err
                        );
                        self.teardown_phase2(sequence, false).await;
                    }
                }
            }
            SadbEvent::Acquire {
                sequence,
                policy_id,
                src,
                dst,
            } => {
                debug!(
                    "Acquire {} for policy {} ({} -> {})",
                    sequence, policy_id, src, dst
                );
                if self.shutdown {
                    return;
                }
                let policy = self
                    .policy
                    .find_phase2_by_id(policy_id)
                    .or_else(|| self.policy.find_phase2_by_selectors(&src, &dst));
                let Some(policy) = policy else {
                    warn!("Acquire for unknown policy {}", policy_id);
                    return;
                };
                let remote_ip = policy.remote.addr;
                let policy_id = policy.id;
                if self
                    .registry
                    .phase2_by_selectors(src, dst, policy_id)
                    .is_some()
                {
                    debug!("Negotiation for policy {} is already in progress", policy_id);
                    return;
                }
                let cookies = self
                    .registry
                    .phase1_by_addrs(src, dst)
                    .map(|session| session.cookies())
                    .or_else(|| {
                        self.registry
                            .phase1_by_remote_ip(remote_ip)
                            .map(|session| session.cookies())
                    });
                let result = match cookies {
                    Some(cookies) => self.start_phase2(cookies, policy_id),
                    None => self.start_phase1(remote_ip, policy_id).await,
                };
                if let Err(err) = result {
                    warn!(
                        "Failed to start negotiation for policy {}: {}",
                        policy_id, err
                    );
                }
            }
            SadbEvent::Expire {
                protocol,
                spi,
                src,
                dst,
            } => {
                self.installed.remove(protocol, &spi);
                let info = self.registry.phase2_by_spi(protocol, &spi).map(|session| {
                    (
                        session.sequence(),
                        session.role(),
                        session.policy_id(),
                        session.phase1_cookies(),
                    )
                });
                let Some((sequence, role, policy_id, cookies)) = info else {
                    let _ = self.sadb.delete_sa(protocol, &spi, src, dst);
                    return;
                };
                info!("IPsec SA {} expired in the kernel, tearing down", sequence);
                self.teardown_phase2(sequence, true).await;
                if role == Role::Initiator && !self.shutdown {
                    if let Err(err) = self.start_phase2(cookies, policy_id) {
                        warn!("Failed to renegotiate policy {}: {}", policy_id, err);
                    }
                }
            }
        }
    }

    // Outbound negotiations.

    async fn start_phase1(&mut self, remote_ip: IpAddr, policy_id: u32) -> Result<(), IkeError> {
        if let Some(pending) = self.pending_acquires.get_mut(&remote_ip) {
            pending.push(policy_id);
            return Ok(());
        }
        let local_addr = self
            .listen_addrs
            .iter()
            .find(|addr| addr.is_ipv4() == remote_ip.is_ipv4())
            .copied()
            .ok_or("No listen address matching the peer address family")?;
        let remote_addr = SocketAddr::new(remote_ip, self.port);
        let exchange_type = *self
            .policy
            .phase1
            .exchange_types
            .first()
            .ok_or("No phase 1 exchange types configured")?;
        let mut session =
            Phase1Session::new_initiator(local_addr, remote_addr, exchange_type, self.policy.clone());
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let length = session.initiate(&mut buf)?;
        let cookies = session.cookies();
        self.registry.insert_phase1(session);
        info!("Starting ISAKMP negotiation {} with {}", cookies, remote_addr);
        self.udp_sender
            .send_datagram(&local_addr, &remote_addr, &buf[..length])
            .await?;
        self.arm_phase1_retransmit(cookies);
        self.pending_acquires.insert(remote_ip, vec![policy_id]);
        Ok(())
    }

    fn start_phase2(&mut self, cookies: CookiePair, policy_id: u32) -> Result<(), IkeError> {
        let sequence = self.registry.reserve_sequence();
        let session = {
            let phase1 = self
                .registry
                .phase1(&cookies)
                .ok_or("No ISAKMP SA to negotiate under")?;
            let policy = phase1
                .policy()
                .find_phase2_by_id(policy_id)
                .ok_or("Unknown phase 2 policy")?;
            Phase2Session::new_initiator(sequence, phase1, policy)
        };
        self.registry.insert_phase2(session);
        debug!(
            "Starting phase 2 negotiation {} for policy {}",
            sequence, policy_id
        );
        let result = match self.registry.phase2_mut(sequence) {
            Some(session) => session.request_spis(&self.sadb),
            None => return Err("Phase 2 handle disappeared".into()),
        };
        if let Err(err) = result {
            self.registry.remove_phase2(sequence);
            return Err(err.into());
        }
        Ok(())
    }

    // Timers.

    fn arm_phase1_retransmit(&mut self, cookies: CookiePair) {
        let generation = match self.registry.phase1_mut(&cookies) {
            Some(session) => session.arm_timer(TimerKind::Retransmit),
            None => return,
        };
        let delay = self.policy.retransmit.retry_interval;
        self.schedule_message(delay, SessionMessage::Phase1Timer(cookies, generation));
    }

    fn arm_phase1_expiry(&mut self, cookies: CookiePair, delay: Duration) {
        let generation = match self.registry.phase1_mut(&cookies) {
            Some(session) => session.arm_timer(TimerKind::Expiry),
            None => return,
        };
        self.schedule_message(delay, SessionMessage::Phase1Timer(cookies, generation));
    }

    fn arm_phase2_retransmit(&mut self, sequence: u32) {
        let generation = match self.registry.phase2_mut(sequence) {
            Some(session) => session.arm_timer(TimerKind::Retransmit),
            None => return,
        };
        let delay = self.policy.retransmit.retry_interval;
        self.schedule_message(delay, SessionMessage::Phase2Timer(sequence, generation));
    }

    fn arm_phase2_expiry(&mut self, sequence: u32, delay: Duration) {
        let generation = match self.registry.phase2_mut(sequence) {
            Some(session) => session.arm_timer(TimerKind::Expiry),
            None => return,
        };
        self.schedule_message(delay, SessionMessage::Phase2Timer(sequence, generation));
    }

    async fn process_phase1_timer(&mut self, cookies: CookiePair, generation: u64) {
        let verdict = {
            let Some(session) = self.registry.phase1_mut(&cookies) else {
                return;
            };
            if !session.timer_is_current(generation) {
                return;
            }
            match session.active_timer() {
                Some(TimerKind::Retransmit) => match session.next_retransmission() {
                    Some(data) => {
                        TimerVerdict::Resend(session.local_addr(), session.remote_addr(), data)
                    }
                    None => TimerVerdict::GiveUp,
                },
                Some(TimerKind::Expiry) => TimerVerdict::Expire,
                None => return,
            }
        };
        match verdict {
            TimerVerdict::Resend(local_addr, remote_addr, data) => {
                debug!("Retransmitting phase 1 message to {}", remote_addr);
                if let Err(err) = self
                    .udp_sender
                    .send_datagram(&local_addr, &remote_addr, &data)
                    .await
                {
                    warn!("Failed to retransmit to {}: {}", remote_addr, err);
                }
                self.arm_phase1_retransmit(cookies);
            }
            TimerVerdict::GiveUp => {
                warn!(
                    "ISAKMP SA {} exhausted its retransmission budget, tearing down",
                    cookies
                );
                self.teardown_phase1(cookies, false).await;
            }
            TimerVerdict::Expire => {
                info!("ISAKMP SA {} reached its lifetime, tearing down", cookies);
                self.teardown_phase1(cookies, true).await;
            }
        }
    }

    async fn process_phase2_timer(&mut self, sequence: u32, generation: u64) {
        let (verdict, role, policy_id, cookies) = {
            let Some(session) = self.registry.phase2_mut(sequence) else {
                return;
            };
            if !session.timer_is_current(generation) {
                return;
            }
            let verdict = match session.active_timer() {
                Some(TimerKind::Retransmit) => match session.next_retransmission() {
                    Some(data) => {
                        TimerVerdict::Resend(session.local_addr(), session.remote_addr(), data)
                    }
                    None => TimerVerdict::GiveUp,
                },
                Some(TimerKind::Expiry) => TimerVerdict::Expire,
                None => return,
            };
            (
                verdict,
                session.role(),
                session.policy_id(),
                session.phase1_cookies(),
            )
        };
        match verdict {
            TimerVerdict::Resend(local_addr, remote_addr, data) => {
                debug!("Retransmitting Quick Mode message to {}", remote_addr);
                if let Err(err) = self
                    .udp_sender
                    .send_datagram(&local_addr, &remote_addr, &data)
                    .await
                {
                    warn!("Failed to retransmit to {}: {}", remote_addr, err);
                }
                self.arm_phase2_retransmit(sequence);
            }
            TimerVerdict::GiveUp => {
                warn!(
                    "Phase 2 negotiation {} exhausted its retransmission budget, tearing down",
                    sequence
                );
                self.teardown_phase2(sequence, false).await;
            }
            TimerVerdict::Expire => {
                info!("IPsec SA {} reached its lifetime, tearing down", sequence);
                self.teardown_phase2(sequence, true).await;
                if role == Role::Initiator && !self.shutdown {
                    if let Err(err) = self.start_phase2(cookies, policy_id) {
                        warn!("Failed to renegotiate policy {}: {}", policy_id, err);
                    }
                }
            }
        }
    }

    async fn process_dpd_tick(&mut self) {
        let policy = self.policy.clone();
        let Some(dpd) = policy.phase1.dpd.as_ref() else {
            return;
        };
        let mut probes = vec![];
        let mut dead = vec![];
        for session in self.registry.iter_phase1_mut() {
            if !session.is_established() || !session.peer_supports_dpd() {
                continue;
            }
            if session.dpd_failures() >= dpd.max_failures {
                dead.push(session.cookies());
                continue;
            }
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            match informational::send_dpd_probe(session, &mut buf) {
                Ok((length, sequence)) => {
                    trace!(
                        "Sending R-U-THERE {} to {}",
                        sequence,
                        session.remote_addr()
                    );
                    probes.push((
                        session.local_addr(),
                        session.remote_addr(),
                        buf[..length].to_vec(),
                    ));
                }
                Err(err) => {
                    warn!(
                        "Failed to build DPD probe for {}: {}",
                        session.cookies(),
                        err
                    );
                }
            }
        }
        for (local_addr, remote_addr, data) in probes {
            if let Err(err) = self
                .udp_sender
                .send_datagram(&local_addr, &remote_addr, &data)
                .await
            {
                warn!("Failed to send DPD probe to {}: {}", remote_addr, err);
            }
        }
        for cookies in dead {
            warn!(
                "Peer for ISAKMP SA {} is not responding to DPD probes, tearing down",
                cookies
            );
            self.teardown_phase1(cookies, false).await;
        }
    }

    fn process_cleanup(&mut self) {
        self.replay.sweep();
        let reaped = self.registry.reap_stalled();
        if reaped > 0 {
            debug!("Reaped {} stalled negotiation handles", reaped);
        }
    }

    // Teardown.

    async fn teardown_phase2(&mut self, sequence: u32, notify: bool) {
        let Some(session) = self.registry.remove_phase2(sequence) else {
            return;
        };
        let established = session.is_established();
        let cookies = session.phase1_cookies();
        self.uninstall_outputs(&session);
        if notify && established {
            let deletes: Vec<(ProtocolId, Vec<u8>)> = session
                .approval()
                .map(|approval| {
                    approval
                        .protocols
                        .iter()
                        .map(|protocol| (protocol.protocol, protocol.local_spi.clone()))
                        .collect()
                })
                .unwrap_or_default();
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            for (protocol, spi) in deletes {
                let length = self
                    .registry
                    .phase1_mut(&cookies)
                    .filter(|phase1| phase1.is_established())
                    .and_then(|phase1| {
                        informational::send_delete(phase1, protocol, &[&spi], &mut buf).ok()
                    });
                if let Some(length) = length {
                    let _ = self
                        .udp_sender
                        .send_datagram(
                            &session.local_addr(),
                            &session.remote_addr(),
                            &buf[..length],
                        )
                        .await;
                }
            }
        }
        if established {
            info!(
                "IPsec SA {} with {} is down",
                sequence,
                session.remote_addr()
            );
            self.emit(SessionEvent::Phase2Down {
                sequence,
                policy_id: session.policy_id(),
                remote_addr: session.remote_addr(),
            });
        }
    }

    // Removes the kernel SAs a phase 2 handle negotiated, both directions.
    fn uninstall_outputs(&mut self, session: &Phase2Session) {
        let Some(approval) = session.approval() else {
            return;
        };
        let local_ip = session.local_addr().ip();
        let remote_ip = session.remote_addr().ip();
        for protocol in &approval.protocols {
            if self.installed.remove(protocol.protocol, &protocol.local_spi) {
                let _ = self.sadb.delete_sa(
                    protocol.protocol,
                    &protocol.local_spi,
                    remote_ip,
                    local_ip,
                );
            }
            if self.installed.remove(protocol.protocol, &protocol.peer_spi) {
                let _ = self.sadb.delete_sa(
                    protocol.protocol,
                    &protocol.peer_spi,
                    local_ip,
                    remote_ip,
                );
            }
        }
    }

    async fn teardown_phase1(&mut self, cookies: CookiePair, notify: bool) {
        for sequence in self.registry.phase2_sequences_for(&cookies) {
            self.teardown_phase2(sequence, notify).await;
        }
        let Some(mut session) = self.registry.remove_phase1(&cookies) else {
            return;
        };
        let established = session.is_established();
        if notify && established {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            match informational::send_delete_phase1(&session, &mut buf) {
                Ok(length) => {
                    let _ = self
                        .udp_sender
                        .send_datagram(
                            &session.local_addr(),
                            &session.remote_addr(),
                            &buf[..length],
                        )
                        .await;
                }
                Err(err) => warn!("Failed to announce ISAKMP SA deletion: {}", err),
            }
        }
        session.expire();
        if established {
            info!(
                "ISAKMP SA {} with {} is down",
                cookies,
                session.remote_addr()
            );
            self.emit(SessionEvent::Phase1Down {
                cookies,
                remote_addr: session.remote_addr(),
            });
        }
    }

    fn apply_reconfigure(&mut self, policy: PolicySnapshot) {
        let policy = Arc::new(policy);
        info!("Applying policy version {}", policy.version);
        let (dropped_phase1, dropped_phase2) = self.registry.reconfigure(&policy);
        // The dropped handles were already expired, so no delete
        // notifications can go out; the kernel SAs still come down.
        for sequence in dropped_phase2 {
            if let Some(session) = self.registry.remove_phase2(sequence) {
                self.uninstall_outputs(&session);
                if session.approval().is_some() {
                    self.emit(SessionEvent::Phase2Down {
                        sequence,
                        policy_id: session.policy_id(),
                        remote_addr: session.remote_addr(),
                    });
                }
            }
        }
        for cookies in dropped_phase1 {
            if let Some(session) = self.registry.remove_phase1(&cookies) {
                self.emit(SessionEvent::Phase1Down {
                    cookies,
                    remote_addr: session.remote_addr(),
                });
            }
        }
        self.policy = policy;
    }

    async fn shutdown_all(&mut self) {
        self.shutdown = true;
        let cookies: Vec<CookiePair> = self
            .registry
            .iter_phase1()
            .map(|session| session.cookies())
            .collect();
        for cookies in cookies {
            self.teardown_phase1(cookies, true).await;
        }
        // Expired handles and orphans never reached the teardown path above.
        let (_, orphans) = self.registry.flush();
        for session in &orphans {
            self.uninstall_outputs(session);
        }
        self.replay.flush();
        self.installed.flush();
        self.pending_acquires.clear();
    }
}

#[derive(Debug)]
pub enum SendError {
    Internal(&'static str),
    Io(io::Error),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Io(ref e) => {
                write!(f, "IO error: {}", e)
            }
        }
    }
}

impl error::Error for SendError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Self::Internal(_msg) => None,
            Self::Io(ref err) => Some(err),
        }
    }
}

impl From<&'static str> for SendError {
    fn from(msg: &'static str) -> SendError {
        Self::Internal(msg)
    }
}

impl From<io::Error> for SendError {
    fn from(err: io::Error) -> SendError {
        Self::Io(err)
    }
}

#[derive(Debug)]
pub enum IkeError {
    Internal(&'static str),
    Format(message::FormatError),
    NotEnoughSpace(message::NotEnoughSpaceError),
    Negotiation(NegotiationError),
    Sadb(sadb::SadbError),
    SendError(SendError),
    Join(tokio::task::JoinError),
    Io(io::Error),
}

impl fmt::Display for IkeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Format(ref e) => write!(f, "Format error: {}", e),
            Self::NotEnoughSpace(_) => write!(f, "Not enough space error"),
            Self::Negotiation(ref e) => write!(f, "Negotiation error: {}", e),
            Self::Sadb(ref e) => write!(f, "SA/SPD store error: {}", e),
            Self::SendError(ref e) => write!(f, "Send error: {}", e),
            Self::Join(ref e) => write!(f, "Tokio join error: {}", e),
            Self::Io(ref e) => {
                write!(f, "IO error: {}", e)
            }
        }
    }
}

impl error::Error for IkeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Self::Internal(_msg) => None,
            Self::Format(ref err) => Some(err),
            Self::NotEnoughSpace(ref err) => Some(err),
            Self::Negotiation(ref err) => Some(err),
            Self::Sadb(ref err) => Some(err),
            Self::SendError(ref err) => Some(err),
            Self::Join(ref err) => Some(err),
            Self::Io(ref err) => Some(err),
        }
    }
}

impl From<&'static str> for IkeError {
    fn from(msg: &'static str) -> IkeError {
        Self::Internal(msg)
    }
}

impl From<message::FormatError> for IkeError {
    fn from(err: message::FormatError) -> IkeError {
        Self::Format(err)
    }
}

impl From<message::NotEnoughSpaceError> for IkeError {
    fn from(err: message::NotEnoughSpaceError) -> IkeError {
        Self::NotEnoughSpace(err)
    }
}

impl From<NegotiationError> for IkeError {
    fn from(err: NegotiationError) -> IkeError {
        Self::Negotiation(err)
    }
}

impl From<sadb::SadbError> for IkeError {
    fn from(err: sadb::SadbError) -> IkeError {
        Self::Sadb(err)
    }
}

impl From<SendError> for IkeError {
    fn from(err: SendError) -> IkeError {
        Self::SendError(err)
    }
}

impl From<tokio::task::JoinError> for IkeError {
    fn from(err: tokio::task::JoinError) -> IkeError {
        Self::Join(err)
    }
}

impl From<io::Error> for IkeError {
    fn from(err: io::Error) -> IkeError {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRE_SHARED_KEY: &[u8] = b"test preshared key";

    fn host(addr: &str) -> IpAddr {
        addr.parse().unwrap()
    }

    fn esp_policy() -> Phase2Policy {
        Phase2Policy {
            id: 1,
            local: Selector::host(host("192.0.2.1")),
            remote: Selector::host(host("192.0.2.2")),
            proposal: SaProposal {
                number: 1,
                protocols: vec![ProtocolProposal {
                    protocol: ProtocolId::ESP,
                    spi: vec![0, 0, 0, 0],
                    transforms: vec![IpsecTransform {
                        number: 1,
                        transform_id: ESP_TRANSFORM_AES,
                        auth: Some(AuthAlgorithm::HMAC_SHA1),
                        encapsulation: EncapsulationMode::TUNNEL,
                        key_length: Some(128),
                        group: None,
                        life: Lifetime::seconds(3600),
                    }],
                }],
            },
            lifetime: Lifetime::seconds(3600),
        }
    }

    fn mirrored_policy(policy: &Phase2Policy) -> Phase2Policy {
        let mut mirrored = policy.clone();
        std::mem::swap(&mut mirrored.local, &mut mirrored.remote);
        mirrored
    }

    fn test_snapshot(phase2: Vec<Phase2Policy>, pre_shared_key: &[u8]) -> Arc<PolicySnapshot> {
        Arc::new(PolicySnapshot {
            version: 1,
            check_level: CheckLevel::Obey,
            phase1: Phase1Policy {
                exchange_types: vec![ExchangeType::IDENTITY_PROTECTION],
                candidates: vec![IsakmpTransform {
                    number: 1,
                    encryption: EncryptionAlgorithm::AES_CBC,
                    key_length: Some(128),
                    hash: HashAlgorithm::SHA2_256,
                    auth_method: AuthenticationMethod::PRE_SHARED_KEY,
                    group: DhGroup::MODP_1024,
                    life: Lifetime::seconds(28800),
                }],
                pre_shared_key: pre_shared_key.to_vec(),
                lifetime: Lifetime::seconds(28800),
                dpd: None,
            },
            phase2,
            retransmit: RetransmitConfig::default(),
        })
    }

    struct Harness {
        sessions: Sessions,
        sadb_rx: mpsc::Receiver<SadbRequest>,
        udp_rx: mpsc::Receiver<SendUdpDatagram>,
        event_rx: mpsc::Receiver<SessionEvent>,
        // Keeps scheduled timer messages deliverable.
        _command_rx: mpsc::Receiver<SessionMessage>,
    }

    fn harness(policy: Arc<PolicySnapshot>, listen_addr: SocketAddr) -> Harness {
        let (command_sender, command_rx) = mpsc::channel(64);
        let (udp_tx, udp_rx) = mpsc::channel(64);
        let (sadb_tx, sadb_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);
        let sessions = Sessions::new(
            policy,
            listen_addr.port(),
            vec![listen_addr],
            command_sender,
            UdpSender { tx: udp_tx },
            SadbHandle::new(sadb_tx),
            event_tx,
        );
        Harness {
            sessions,
            sadb_rx,
            udp_rx,
            event_rx,
            _command_rx: command_rx,
        }
    }

    fn established_pair() -> (Phase1Session, Phase1Session) {
        let policy_i = test_snapshot(vec![esp_policy()], PRE_SHARED_KEY);
        let policy_r = test_snapshot(vec![mirrored_policy(&esp_policy())], PRE_SHARED_KEY);
        let mut initiator = Phase1Session::new_initiator(
            "192.0.2.1:500".parse().unwrap(),
            "192.0.2.2:500".parse().unwrap(),
            ExchangeType::IDENTITY_PROTECTION,
            policy_i,
        );
        let mut buf_a = [0u8; 4096];
        let mut buf_b = [0u8; 4096];
        let length = initiator.initiate(&mut buf_a).unwrap();
        let msg1 = buf_a[..length].to_vec();
        let msg = InputMessage::from_datagram(&msg1).unwrap();
        let mut responder = Phase1Session::new_responder(
            msg.read_initiator_cookie(),
            "192.0.2.2:500".parse().unwrap(),
            "192.0.2.1:500".parse().unwrap(),
            ExchangeType::IDENTITY_PROTECTION,
            policy_r,
        );
        let mut in_flight = msg1;
        let mut from_initiator = true;
        for _ in 0..8 {
            let msg = InputMessage::from_datagram(&in_flight).unwrap();
            let action = if from_initiator {
                responder.process_message(&msg, &mut buf_b).unwrap()
            } else {
                initiator.process_message(&msg, &mut buf_a).unwrap()
            };
            match action {
                Phase1Action::Reply(length) | Phase1Action::Established(length) if length > 0 => {
                    in_flight = if from_initiator {
                        buf_b[..length].to_vec()
                    } else {
                        buf_a[..length].to_vec()
                    };
                    from_initiator = !from_initiator;
                }
                _ => break,
            }
            if initiator.is_established() && responder.is_established() {
                break;
            }
        }
        assert!(initiator.is_established() && responder.is_established());
        (initiator, responder)
    }

    fn drain_spi(
        rx: &mut mpsc::Receiver<SadbRequest>,
        session: &mut Phase2Session,
        phase1: &mut Phase1Session,
        spi: &[u8],
        dest: &mut [u8],
    ) -> Option<usize> {
        match rx.try_recv().unwrap() {
            SadbRequest::GetSpi { protocol, .. } => {
                session.spi_allocated(phase1, protocol, spi, dest).unwrap()
            }
            _ => panic!("Expected a GetSpi request"),
        }
    }

    #[test]
    fn phase1_failure_after_reply_expires_the_handle() {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let local: SocketAddr = "192.0.2.2:500".parse().unwrap();
            let remote: SocketAddr = "192.0.2.1:500".parse().unwrap();
            let responder_policy = test_snapshot(
                vec![mirrored_policy(&esp_policy())],
                b"the responder secret",
            );
            let mut harness = harness(responder_policy, local);
            // The initiator holds a different pre-shared key, so main mode
            // runs until message 5 and fails authentication there.
            let initiator_policy = test_snapshot(vec![esp_policy()], b"the initiator secret");
            let mut initiator = Phase1Session::new_initiator(
                remote,
                local,
                ExchangeType::IDENTITY_PROTECTION,
                initiator_policy,
            );
            let mut buf = [0u8; 4096];
            let length = initiator.initiate(&mut buf).unwrap();
            let mut bytes = buf[..length].to_vec();
            for _ in 0..2 {
                harness
                    .sessions
                    .process_datagram(&UdpDatagram {
                        remote_addr: remote,
                        local_addr: local,
                        bytes,
                    })
                    .await
                    .unwrap();
                assert_eq!(harness.sessions.registry.phase1_count(), 1);
                let reply = harness.udp_rx.try_recv().unwrap();
                let msg = InputMessage::from_datagram(&reply.bytes).unwrap();
                bytes = match initiator.process_message(&msg, &mut buf).unwrap() {
                    Phase1Action::Reply(length) => buf[..length].to_vec(),
                    _ => panic!("Initiator should keep negotiating"),
                };
            }
            harness
                .sessions
                .process_datagram(&UdpDatagram {
                    remote_addr: remote,
                    local_addr: local,
                    bytes,
                })
                .await
                .unwrap();
            // The failure notify went out and the handle did not survive in
            // its previous state.
            let notify = harness.udp_rx.try_recv().unwrap();
            let msg = InputMessage::from_datagram(&notify.bytes).unwrap();
            assert_eq!(
                msg.read_exchange_type().unwrap(),
                ExchangeType::INFORMATIONAL
            );
            assert_eq!(harness.sessions.registry.phase1_count(), 0);
        });
    }

    #[test]
    fn kernel_expiry_renegotiates_initiated_policies() {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            // Establish a Quick Mode bundle off to the side, then hand the
            // initiator half to the dispatcher.
            let (mut p1_i, mut p1_r) = established_pair();
            let (tx, mut rx) = mpsc::channel(16);
            let sadb = SadbHandle::new(tx);
            let policy_i = esp_policy();
            let policy_r = mirrored_policy(&policy_i);
            let mut qm_i = Phase2Session::new_initiator(7, &p1_i, &policy_i);
            let mut buf_a = [0u8; 4096];
            let mut buf_b = [0u8; 4096];
            qm_i.request_spis(&sadb).unwrap();
            let length =
                drain_spi(&mut rx, &mut qm_i, &mut p1_i, &[0x11; 4], &mut buf_a).unwrap();
            let msg1 = buf_a[..length].to_vec();
            let msg = InputMessage::from_datagram(&msg1).unwrap();
            let mut qm_r = Phase2Session::new_responder(8, &p1_r, msg.read_message_id(), &policy_r);
            qm_r.process_initial_message(&mut p1_r, &msg, &sadb).unwrap();
            let length =
                drain_spi(&mut rx, &mut qm_r, &mut p1_r, &[0x22; 4], &mut buf_b).unwrap();
            let msg2 = buf_b[..length].to_vec();
            let msg = InputMessage::from_datagram(&msg2).unwrap();
            match qm_i.process_sa_reply(&mut p1_i, &msg, &mut buf_a).unwrap() {
                Phase2Action::Install { .. } => {}
                _ => panic!("Initiator should derive keys"),
            }
            assert!(qm_i.is_established());

            let local: SocketAddr = "192.0.2.1:500".parse().unwrap();
            let mut harness = harness(test_snapshot(vec![esp_policy()], PRE_SHARED_KEY), local);
            harness.sessions.registry.insert_phase1(p1_i);
            harness.sessions.registry.insert_phase2(qm_i);
            harness
                .sessions
                .process_sadb_event(SadbEvent::Expire {
                    protocol: ProtocolId::ESP,
                    spi: vec![0x11; 4],
                    src: host("192.0.2.2"),
                    dst: host("192.0.2.1"),
                })
                .await;
            // The expired bundle came down and a fresh negotiation for the
            // same policy started in its place.
            match harness.event_rx.try_recv().unwrap() {
                SessionEvent::Phase2Down { sequence, .. } => assert_eq!(sequence, 7),
                _ => panic!("Expected the old bundle to come down"),
            }
            let renewed = harness
                .sessions
                .registry
                .phase2_by_selectors(host("192.0.2.1"), host("192.0.2.2"), 1)
                .expect("renegotiation handle");
            assert_ne!(renewed.sequence(), 7);
            match harness.sadb_rx.try_recv().unwrap() {
                SadbRequest::GetSpi { protocol, .. } => assert_eq!(protocol, ProtocolId::ESP),
                _ => panic!("Expected a GetSpi request"),
            }
        });
    }
}
