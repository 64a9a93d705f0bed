/*
The cluster service wires the liveness subsystem together. It owns every link
to another node, accepts inbound connections, dials the configured peers, and
runs the router thread that moves frames between the links and the membership
table, heart beat monitors and ballot coordinator. Other subsystems interact
with the cluster only through the facade operations and the notifications of
the ClusterListener trait.
*/

use log::{error, info, warn};
use std::{
    collections::HashMap,
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use courier_net::{
    bin_serialization::{ClusterMessage, ClusterSerializer},
    contracts::v1,
    data_types::NodeUuid,
    sockets::buffer_pool::BufferPool,
};

use crate::{
    alarms::{AlarmClock, AlarmKind, AlarmResult, Alarmable},
    observability::Metrics,
    settings::ClusterSettings,
    utils::now_epoc_millis,
};

use super::{
    ballot::{BallotCoordinator, OutboundMessage, RandomBidPolicy},
    link::{Link, LinkId, LinkReceiveResult},
    membership::{ConfirmOutcome, DeadNodeOutcome, MembershipTable},
    ClusterListener,
};

const IDLE_SLEEP_DURATION: Duration = Duration::from_millis(5);
const ACCEPT_SLEEP_DURATION: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub enum StartError {
    Error { msg: String },
}

pub type StartResult = Result<(), StartError>;

enum ServiceCommand {
    Reconnect,
    Coalesce,
    StartTimeouts,
    DeadNode(NodeUuid),
}

/// The channel ends that move into the router thread when the service starts
struct RouterChannels {
    command_rx: Receiver<ServiceCommand>,
    outbound_rx: Receiver<OutboundMessage>,
    dead_rx: Receiver<LinkId>,
    dead_tx: Sender<LinkId>,
    stream_rx: Receiver<(TcpStream, String, bool)>,
    stream_tx: Sender<(TcpStream, String, bool)>,
}

pub struct ClusterService {
    my_uuid: NodeUuid,
    settings: ClusterSettings,
    alarm_clock: Arc<AlarmClock>,
    membership: Arc<MembershipTable>,
    coordinator: Arc<BallotCoordinator>,
    metrics: Arc<Metrics>,
    command_tx: Sender<ServiceCommand>,
    stop_signal: Arc<AtomicBool>,
    router_channels: Mutex<Option<RouterChannels>>,
}

impl ClusterService {
    pub fn my_uuid(self: &Self) -> NodeUuid {
        self.my_uuid
    }
    pub fn membership(self: &Self) -> &Arc<MembershipTable> {
        &self.membership
    }
    pub fn coordinator(self: &Self) -> &Arc<BallotCoordinator> {
        &self.coordinator
    }

    pub fn new(
        settings: &ClusterSettings,
        alarm_clock: &Arc<AlarmClock>,
        metrics: &Arc<Metrics>,
    ) -> Self {
        let my_uuid = settings.node_uuid.unwrap_or_else(NodeUuid::new_v4);
        let membership = Arc::new(MembershipTable::new(my_uuid));

        let (outbound_tx, outbound_rx) = channel::<OutboundMessage>();
        let coordinator = BallotCoordinator::new(
            &membership,
            Box::new(RandomBidPolicy),
            alarm_clock,
            outbound_tx,
            settings.auction_timeout_ms,
            settings.bid_timeout_ms,
        );

        let (command_tx, command_rx) = channel::<ServiceCommand>();
        let (dead_tx, dead_rx) = channel::<LinkId>();
        let (stream_tx, stream_rx) = channel::<(TcpStream, String, bool)>();

        Self {
            my_uuid,
            settings: settings.clone(),
            alarm_clock: Arc::clone(alarm_clock),
            membership,
            coordinator,
            metrics: Arc::clone(metrics),
            command_tx,
            stop_signal: Arc::new(AtomicBool::new(false)),
            router_channels: Mutex::new(Some(RouterChannels {
                command_rx,
                outbound_rx,
                dead_rx,
                dead_tx,
                stream_rx,
                stream_tx,
            })),
        }
    }

    /// Registers a listener for membership change notifications. Register
    /// everything before calling start.
    pub fn register_listener(self: &Self, listener: Arc<dyn ClusterListener>) {
        self.membership.register_listener(listener);
    }

    /// Opens the cluster listener, dials the configured peers and registers
    /// the repeating alarms that keep the cluster healthy
    pub fn start(self: &Self) -> StartResult {
        let channels = match self.router_channels.lock().unwrap().take() {
            Some(channels) => channels,
            None => {
                return Err(StartError::Error {
                    msg: String::from("The cluster service was already started"),
                })
            }
        };

        let authority = self.settings.authority();
        let listener = match TcpListener::bind(&authority) {
            Ok(listener) => listener,
            Err(e) => {
                return Err(StartError::Error {
                    msg: format!("Failed to listen for cluster connections on {authority}: {e}"),
                })
            }
        };
        if let Err(e) = listener.set_nonblocking(true) {
            return Err(StartError::Error {
                msg: format!("Failed to make the cluster listener non-blocking: {e}"),
            });
        }
        info!("ClusterService: Node {} listening on {authority}", self.my_uuid);

        let listener_thread = ListenerThread {
            listener,
            stream_tx: channels.stream_tx.clone(),
            stop_signal: self.stop_signal.clone(),
        };
        thread::spawn(move || listener_thread.run());

        let buffer_pool = Arc::new(BufferPool::new());
        let serializer = ClusterSerializer::new(&buffer_pool);
        let router_thread = RouterThread {
            my_uuid: self.my_uuid,
            settings: self.settings.clone(),
            alarm_clock: Arc::clone(&self.alarm_clock),
            membership: Arc::clone(&self.membership),
            coordinator: Arc::clone(&self.coordinator),
            metrics: Arc::clone(&self.metrics),
            buffer_pool,
            serializer,
            links: HashMap::new(),
            next_link_id: 1,
            command_rx: channels.command_rx,
            outbound_rx: channels.outbound_rx,
            dead_rx: channels.dead_rx,
            dead_tx: channels.dead_tx,
            stream_rx: channels.stream_rx,
            stream_tx: channels.stream_tx,
            stop_signal: self.stop_signal.clone(),
        };
        thread::spawn(move || router_thread.run());

        // Dial the configured peers straight away rather than waiting for
        // the first reconnect alarm
        let _ = self.command_tx.send(ServiceCommand::Reconnect);

        let receiver = Arc::new(ServiceAlarms {
            command_tx: self.command_tx.clone(),
            membership: Arc::clone(&self.membership),
        });
        self.alarm_clock.schedule(
            receiver.clone(),
            AlarmKind::Cluster,
            self.settings.cluster_retry(),
        );
        self.alarm_clock.schedule(
            receiver.clone(),
            AlarmKind::Coalesce,
            self.settings.coalesce_interval(),
        );
        self.alarm_clock.schedule(
            receiver.clone(),
            AlarmKind::Start,
            self.settings.start_timeout(),
        );
        self.alarm_clock.schedule(
            receiver,
            AlarmKind::Compaction,
            self.settings.compaction_interval(),
        );

        Ok(())
    }

    /// Declares a node dead. Idempotent, delegates to the membership table.
    pub fn dead_node(self: &Self, node_uuid: NodeUuid) {
        let _ = self.command_tx.send(ServiceCommand::DeadNode(node_uuid));
    }

    /// Cancels every alarm and closes every link
    pub fn shutdown(self: &Self) {
        info!("ClusterService: Shutting down");
        self.alarm_clock.cancel_all();
        self.stop_signal.store(true, Ordering::Relaxed);
    }
}

/// Receives the service level alarms and turns them into commands for the
/// router thread. Compaction is forwarded straight to the listeners, it
/// belongs to the message log, the cluster core only keeps time for it.
struct ServiceAlarms {
    command_tx: Sender<ServiceCommand>,
    membership: Arc<MembershipTable>,
}

impl Alarmable for ServiceAlarms {
    fn on_alarm(&self, alarm: AlarmKind) -> AlarmResult {
        match alarm {
            AlarmKind::Cluster => {
                let _ = self.command_tx.send(ServiceCommand::Reconnect);
            }
            AlarmKind::Coalesce => {
                let _ = self.command_tx.send(ServiceCommand::Coalesce);
            }
            AlarmKind::Start => {
                let _ = self.command_tx.send(ServiceCommand::StartTimeouts);
            }
            AlarmKind::Compaction => {
                self.membership.notify_compaction_due();
            }
            _ => {}
        }
        Ok(())
    }
}

/// Accepts inbound cluster connections and hands the streams to the router
struct ListenerThread {
    listener: TcpListener,
    stream_tx: Sender<(TcpStream, String, bool)>,
    stop_signal: Arc<AtomicBool>,
}

impl ListenerThread {
    fn run(self: Self) {
        info!("ListenerThread: Started");
        while !self.stop_signal.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, address)) => {
                    if self
                        .stream_tx
                        .send((stream, address.to_string(), false))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_SLEEP_DURATION);
                }
                Err(e) => {
                    error!("ListenerThread: Failed to accept a connection: {e}");
                    thread::sleep(ACCEPT_SLEEP_DURATION);
                }
            }
        }
        info!("ListenerThread: Stopped");
    }
}

/// Moves frames between the links and the rest of the liveness subsystem.
/// Links are owned here and nowhere else, and each link's events are
/// processed in the order they arrived on that link.
struct RouterThread {
    my_uuid: NodeUuid,
    settings: ClusterSettings,
    alarm_clock: Arc<AlarmClock>,
    membership: Arc<MembershipTable>,
    coordinator: Arc<BallotCoordinator>,
    metrics: Arc<Metrics>,
    buffer_pool: Arc<BufferPool>,
    serializer: ClusterSerializer,
    links: HashMap<LinkId, Link>,
    next_link_id: LinkId,
    command_rx: Receiver<ServiceCommand>,
    outbound_rx: Receiver<OutboundMessage>,
    dead_rx: Receiver<LinkId>,
    dead_tx: Sender<LinkId>,
    stream_rx: Receiver<(TcpStream, String, bool)>,
    stream_tx: Sender<(TcpStream, String, bool)>,
    stop_signal: Arc<AtomicBool>,
}

impl RouterThread {
    fn run(mut self: Self) {
        info!("RouterThread: Started");
        while !self.stop_signal.load(Ordering::Relaxed) {
            let mut busy = false;
            busy |= self.accept_streams();
            busy |= self.drain_commands();
            busy |= self.drain_outbound();
            busy |= self.drain_dead_links();
            busy |= self.poll_links();
            if !busy {
                thread::sleep(IDLE_SLEEP_DURATION);
            }
        }

        let link_ids: Vec<LinkId> = self.links.keys().copied().collect();
        for link_id in link_ids {
            self.close_link(link_id);
        }
        info!("RouterThread: Stopped");
    }

    fn accept_streams(self: &mut Self) -> bool {
        let mut busy = false;
        loop {
            let (stream, address, outbound) = match self.stream_rx.try_recv() {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            busy = true;
            self.open_link(stream, address, outbound);
        }
        busy
    }

    fn open_link(self: &mut Self, stream: TcpStream, address: String, outbound: bool) {
        let link_id = self.next_link_id;
        self.next_link_id += 1;

        let link = Link::new(
            link_id,
            address.clone(),
            stream,
            &self.buffer_pool,
            self.dead_tx.clone(),
            &self.alarm_clock,
            self.settings.heart_beat_interval_ms,
            self.settings.heart_beat_timeout_ms,
        );

        self.membership
            .add_connecting(&address, link_id, outbound, now_epoc_millis());
        self.links.insert(link_id, link);
        self.metrics.incr(Metrics::METRIC_LINK_OPENED_COUNT);

        // Announce ourselves, the handshake completes when the peer replies
        self.send_to_link(
            link_id,
            &ClusterMessage::Start(v1::Start {
                node_uuid: self.my_uuid,
                ip_address: self.settings.ip_address.clone(),
                port: self.settings.port,
            }),
        );
    }

    fn drain_commands(self: &mut Self) -> bool {
        let mut busy = false;
        loop {
            let command = match self.command_rx.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            };
            busy = true;
            match command {
                ServiceCommand::Reconnect => self.reconnect(),
                ServiceCommand::Coalesce => {
                    let duplicates = self.membership.coalesce();
                    for link_id in duplicates {
                        self.close_link(link_id);
                    }
                }
                ServiceCommand::StartTimeouts => {
                    let now = now_epoc_millis();
                    let expired = self
                        .membership
                        .connecting_timed_out(now, self.settings.start_timeout_ms);
                    for link_id in expired {
                        warn!("RouterThread: Handshake timed out on link {link_id}");
                        self.close_link(link_id);
                    }
                }
                ServiceCommand::DeadNode(node_uuid) => self.declare_dead(node_uuid),
            }
        }
        busy
    }

    /// Dials any configured peer that has no link at the moment. A dead
    /// node's address is retried like any other, a peer that comes back gets
    /// a brand new Connecting record, never the old identity slot.
    fn reconnect(self: &Self) {
        for address in &self.settings.peers {
            if self.membership.has_link_to(address) {
                continue;
            }
            self.metrics.incr(Metrics::METRIC_RECONNECT_COUNT);

            let address = address.clone();
            let stream_tx = self.stream_tx.clone();
            thread::spawn(move || match TcpStream::connect(&address) {
                Ok(stream) => {
                    let _ = stream_tx.send((stream, address, true));
                }
                Err(e) => {
                    info!("RouterThread: Could not connect to {address}: {e}");
                }
            });
        }
    }

    fn drain_outbound(self: &mut Self) -> bool {
        let mut busy = false;
        while let Ok(outbound) = self.outbound_rx.try_recv() {
            busy = true;
            match outbound {
                OutboundMessage::Broadcast(message) => self.broadcast(&message),
                OutboundMessage::ToNode(node_uuid, message) => {
                    match self.membership.link_for_node(node_uuid) {
                        Some(link_id) => self.send_to_link(link_id, &message),
                        None => warn!(
                            "RouterThread: No live link to {node_uuid}, dropping a message"
                        ),
                    }
                }
            }
        }
        busy
    }

    fn drain_dead_links(self: &mut Self) -> bool {
        let mut busy = false;
        loop {
            let link_id = match self.dead_rx.try_recv() {
                Ok(link_id) => link_id,
                Err(_) => break,
            };
            busy = true;
            let node_uuid = self.membership.uuid_of_link(link_id);
            match node_uuid {
                Some(node_uuid) if node_uuid != self.my_uuid => self.declare_dead(node_uuid),
                _ => {
                    // A loopback link or a handshake that never completed,
                    // there is no peer to declare dead
                    self.membership.dead_link(link_id);
                    self.close_link(link_id);
                }
            }
        }
        busy
    }

    fn poll_links(self: &mut Self) -> bool {
        let mut busy = false;
        let link_ids: Vec<LinkId> = self.links.keys().copied().collect();
        for link_id in link_ids {
            loop {
                let result = match self.links.get(&link_id) {
                    Some(link) => link.try_receive(),
                    None => break,
                };
                match result {
                    LinkReceiveResult::Frame(frame) => {
                        busy = true;
                        self.process_frame(link_id, frame);
                    }
                    LinkReceiveResult::Empty => break,
                    LinkReceiveResult::Closed => {
                        self.on_link_closed(link_id);
                        break;
                    }
                }
            }
        }
        busy
    }

    fn process_frame(self: &mut Self, link_id: LinkId, frame: Vec<u8>) {
        let now = now_epoc_millis();

        let consumed = match self.links.get(&link_id) {
            Some(link) => link.monitor().on_frame_received(&frame, now),
            None => return,
        };
        if consumed {
            // The frame was a heart beat. If it tripped the timeout the
            // monitor has reported the link on the dead channel already.
            self.membership.touch(link_id, now);
            self.buffer_pool.reuse(frame);
            return;
        }

        let decoded = self.serializer.deserialize_message(frame);
        match decoded {
            Ok(ClusterMessage::Start(start)) => {
                let advertised = format!("{}:{}", start.ip_address, start.port);
                self.confirm_link(link_id, start.node_uuid, Some(advertised), true)
            }
            Ok(ClusterMessage::StartAck(start_ack)) => {
                self.confirm_link(link_id, start_ack.node_uuid, None, false)
            }
            Ok(ClusterMessage::DeadNode(dead_node)) => {
                if dead_node.node_uuid == self.my_uuid {
                    warn!(
                        "RouterThread: Node {} reported us dead, ignoring",
                        dead_node.sender
                    );
                } else {
                    self.declare_dead(dead_node.node_uuid);
                }
            }
            Ok(ClusterMessage::Auction(auction)) => {
                self.coordinator.on_auction(auction.subject, auction.sender)
            }
            Ok(ClusterMessage::Bid(bid)) => {
                self.coordinator.record_bid(bid.subject, bid.sender, bid.value)
            }
            Err(e) => warn!("RouterThread: Dropping an undecodable frame: {e:?}"),
        }
    }

    /// A peer identified itself on a link. Completes the handshake, marking
    /// the node alive, and deals with loopback and duplicate connections.
    fn confirm_link(
        self: &mut Self,
        link_id: LinkId,
        node_uuid: NodeUuid,
        advertised_address: Option<String>,
        reply: bool,
    ) {
        let outcome = self.membership.confirm_alive(
            link_id,
            node_uuid,
            advertised_address.as_deref(),
            now_epoc_millis(),
        );
        match outcome {
            ConfirmOutcome::Alive { .. } => {
                if let Some(link) = self.links.get_mut(&link_id) {
                    link.set_peer_uuid(node_uuid);
                }
                if reply {
                    self.send_to_link(
                        link_id,
                        &ClusterMessage::StartAck(v1::StartAck {
                            node_uuid: self.my_uuid,
                        }),
                    );
                }
            }
            ConfirmOutcome::Replaced { close_link_id } => {
                // This connection won the tie-break over an older one to
                // the same node
                if let Some(link) = self.links.get_mut(&link_id) {
                    link.set_peer_uuid(node_uuid);
                }
                if let Some(close_link_id) = close_link_id {
                    self.close_link(close_link_id);
                }
                if reply {
                    self.send_to_link(
                        link_id,
                        &ClusterMessage::StartAck(v1::StartAck {
                            node_uuid: self.my_uuid,
                        }),
                    );
                }
            }
            ConfirmOutcome::Loopback => {
                // The link resolves to this same node, keep it but never
                // treat it as a peer
                if let Some(link) = self.links.get_mut(&link_id) {
                    link.set_peer_uuid(node_uuid);
                    link.set_loopback(true);
                }
            }
            ConfirmOutcome::AlreadyAlive => {}
            ConfirmOutcome::Duplicate => {
                info!("RouterThread: Closing duplicate link {link_id} to {node_uuid}");
                self.close_link(link_id);
            }
            ConfirmOutcome::UnknownLink => {
                warn!("RouterThread: A handshake arrived on untracked link {link_id}");
            }
        }
    }

    /// The dead node path. Records the death exactly once, tears down the
    /// link and its alarms, tells the survivors, and opens a ballot for the
    /// dead node's responsibilities.
    fn declare_dead(self: &mut Self, node_uuid: NodeUuid) {
        if node_uuid == self.my_uuid {
            warn!("RouterThread: Refusing to declare this node dead");
            return;
        }
        let outcome = self.membership.dead_node(node_uuid);
        match outcome {
            DeadNodeOutcome::MarkedDead { link_id, .. } => {
                if let Some(link_id) = link_id {
                    self.close_link(link_id);
                }

                self.broadcast(&ClusterMessage::DeadNode(v1::DeadNode {
                    node_uuid,
                    sender: self.my_uuid,
                }));

                self.coordinator.begin_ballot(node_uuid);
                self.alarm_clock.schedule_once(
                    self.coordinator.clone(),
                    AlarmKind::DeadNode,
                    Duration::from_millis(self.settings.dead_node_timeout_ms),
                );
            }
            DeadNodeOutcome::NoOp => {}
        }
    }

    /// A link's channel thread has gone away, a transient link failure. The
    /// node is declared dead and the reconnect alarm will rebuild the link
    /// if the peer is still configured.
    fn on_link_closed(self: &mut Self, link_id: LinkId) {
        info!("RouterThread: Link {link_id} closed by the other party");
        let node_uuid = self.membership.uuid_of_link(link_id);
        match node_uuid {
            Some(node_uuid) if node_uuid != self.my_uuid => self.declare_dead(node_uuid),
            _ => {
                self.membership.dead_link(link_id);
                self.close_link(link_id);
            }
        }
    }

    fn close_link(self: &mut Self, link_id: LinkId) {
        if let Some(link) = self.links.remove(&link_id) {
            link.close(&self.alarm_clock);
            self.metrics.incr(Metrics::METRIC_LINK_CLOSED_COUNT);
        }
    }

    fn broadcast(self: &Self, message: &ClusterMessage) {
        for link_id in self.membership.alive_links() {
            self.send_to_link(link_id, message);
        }
    }

    fn send_to_link(self: &Self, link_id: LinkId, message: &ClusterMessage) {
        let link = match self.links.get(&link_id) {
            Some(link) => link,
            None => return,
        };
        match self.serializer.serialize_message(message) {
            Ok(buffer) => {
                if !link.send_frame(buffer) {
                    warn!("RouterThread: Link {link_id} is closed, dropping a message");
                }
            }
            Err(e) => error!("RouterThread: Failed to serialize a message: {e:?}"),
        }
    }
}
