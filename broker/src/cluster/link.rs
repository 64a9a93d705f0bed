/*
A link is one physical connection to a peer node. Links are owned exclusively
by the cluster service that created them, nothing else holds a reference to
one. The Tcp stream itself is serviced by a LinkChannel thread, this record
holds the channel endpoints and the heart beat monitor for the connection.
*/

use log::info;
use std::{
    net::TcpStream,
    sync::{
        atomic::AtomicBool,
        mpsc::{channel, Receiver, Sender, TryRecvError},
        Arc,
    },
};

use courier_net::{
    data_types::{NodeUuid, Timestamp},
    sockets::{buffer_pool::BufferPool, tcp_channel::LinkChannel},
};

use crate::{
    alarms::{AlarmClock, AlarmKind, TimerHandle},
    utils::now_epoc_millis,
};

use super::heartbeat::HeartBeatMonitor;

pub type LinkId = u32;

pub enum LinkReceiveResult {
    Frame(Vec<u8>),
    Empty,
    Closed,
}

pub struct Link {
    link_id: LinkId,
    address: String,
    peer_uuid: Option<NodeUuid>,
    is_loopback: bool,
    monitor: Arc<HeartBeatMonitor>,
    heart_beat_handle: TimerHandle,
    channel: LinkChannel,
    sender: Sender<Vec<u8>>,
    receiver: Receiver<Vec<u8>>,
}

impl Link {
    pub fn link_id(self: &Self) -> LinkId {
        self.link_id
    }
    pub fn address(self: &Self) -> &str {
        &self.address
    }
    pub fn peer_uuid(self: &Self) -> Option<NodeUuid> {
        self.peer_uuid
    }
    pub fn is_loopback(self: &Self) -> bool {
        self.is_loopback
    }
    pub fn monitor(self: &Self) -> &Arc<HeartBeatMonitor> {
        &self.monitor
    }
    pub fn last_send_time(self: &Self) -> Option<Timestamp> {
        self.monitor.last_send_time()
    }
    pub fn last_receive_time(self: &Self) -> Option<Timestamp> {
        self.monitor.last_receive_time()
    }
    pub fn is_online(self: &Self) -> bool {
        self.monitor.is_online()
    }

    /// Wraps an established Tcp stream in a link. Spawns the channel thread
    /// that services the stream and registers the repeating heart beat alarm
    /// for the connection.
    pub fn new(
        link_id: LinkId,
        address: String,
        stream: TcpStream,
        buffer_pool: &Arc<BufferPool>,
        dead_tx: Sender<LinkId>,
        alarm_clock: &Arc<AlarmClock>,
        heart_beat_interval: Timestamp,
        heart_beat_timeout: Timestamp,
    ) -> Self {
        let (tx_sender, tx_receiver) = channel::<Vec<u8>>();
        let (rx_sender, rx_receiver) = channel::<Vec<u8>>();
        let stop_signal = Arc::new(AtomicBool::new(false));

        let channel = LinkChannel::new(tx_receiver, rx_sender, stream, buffer_pool, &stop_signal);

        let monitor = HeartBeatMonitor::new(
            link_id,
            tx_sender.clone(),
            dead_tx,
            alarm_clock,
            heart_beat_interval,
            heart_beat_timeout,
        );

        let heart_beat_handle = alarm_clock.schedule(
            monitor.clone(),
            AlarmKind::HeartBeat,
            std::time::Duration::from_millis(heart_beat_interval),
        );

        info!("Link: Opened link {link_id} to {address}");

        Self {
            link_id,
            address,
            peer_uuid: None,
            is_loopback: false,
            monitor,
            heart_beat_handle,
            channel,
            sender: tx_sender,
            receiver: rx_receiver,
        }
    }

    pub fn set_peer_uuid(self: &mut Self, peer_uuid: NodeUuid) {
        self.peer_uuid = Some(peer_uuid);
    }

    pub fn set_loopback(self: &mut Self, is_loopback: bool) {
        self.is_loopback = is_loopback;
    }

    /// Sends a frame on the link. Returns false if the link thread is gone.
    pub fn send_frame(self: &Self, frame: Vec<u8>) -> bool {
        self.monitor.observe_write(now_epoc_millis());
        self.sender.send(frame).is_ok()
    }

    /// Receives the next frame from the link if one has arrived. Any
    /// received frame counts as activity for the heart beat protocol.
    pub fn try_receive(self: &Self) -> LinkReceiveResult {
        match self.receiver.try_recv() {
            Ok(frame) => {
                self.monitor.observe_read(now_epoc_millis());
                LinkReceiveResult::Frame(frame)
            }
            Err(TryRecvError::Empty) => LinkReceiveResult::Empty,
            Err(TryRecvError::Disconnected) => LinkReceiveResult::Closed,
        }
    }

    /// Stops the channel thread and cancels the alarms scoped to this link
    pub fn close(self: &Self, alarm_clock: &Arc<AlarmClock>) {
        alarm_clock.cancel(self.heart_beat_handle);
        self.monitor.cancel_scoped_alarms();
        self.channel.stop();
        info!("Link: Closed link {} to {}", self.link_id, self.address);
    }
}
