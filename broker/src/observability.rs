use chrono::{DateTime, Utc};
use statsd::Client;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use courier_net::data_types::{BallotSubject, NodeUuid};

use crate::cluster::ClusterListener;

const FLUSH_INTERVAL: Duration = Duration::from_millis(1000);
const EVENT_LOG_CAPACITY: usize = 1000;

pub struct Metrics {
    client: Mutex<Client>,
    counts: Mutex<HashMap<String, f64>>,
}

impl Metrics {
    pub const METRIC_NODE_ALIVE_COUNT: &str = "cluster.node.alive.count";
    pub const METRIC_NODE_DEAD_COUNT: &str = "cluster.node.dead.count";
    pub const METRIC_BALLOT_RESOLVED_COUNT: &str = "cluster.ballot.resolved.count";
    pub const METRIC_COMPACTION_DUE_COUNT: &str = "cluster.compaction.due.count";

    pub const METRIC_LINK_OPENED_COUNT: &str = "cluster.link.opened.count";
    pub const METRIC_LINK_CLOSED_COUNT: &str = "cluster.link.closed.count";
    pub const METRIC_RECONNECT_COUNT: &str = "cluster.reconnect.count";

    pub fn new() -> Self {
        let client = statsd::Client::new("127.0.0.1:8125", "courier").unwrap();
        let counts = HashMap::with_capacity(20);

        Self {
            client: Mutex::new(client),
            counts: Mutex::new(counts),
        }
    }

    pub fn incr(self: &Self, metric: &str) {
        let metric = String::from(metric);
        let mut counts = self.counts.lock().unwrap();
        *counts.entry(metric).or_insert(0.0) += 1.0;
    }

    pub fn count(self: &Self, metric: &str, count: f64) {
        let metric = String::from(metric);
        let mut counts = self.counts.lock().unwrap();
        *counts.entry(metric).or_insert(0.0) += count;
    }

    /// Flushes the aggregated counts to statsd at a regular interval until
    /// the stop signal is raised. Run this on its own thread.
    pub fn run(self: &Self, stop_signal: &Arc<AtomicBool>) {
        let stop_signal = stop_signal.clone();
        while !stop_signal.load(Ordering::Relaxed) {
            thread::sleep(FLUSH_INTERVAL);

            let client = self.client.lock().unwrap();
            let mut counts = self.counts.lock().unwrap();

            let mut pipeline = client.pipeline();
            for (metric, count) in counts.iter() {
                pipeline.count(metric, *count);
            }

            pipeline.send(&client);
            counts.clear();
        }
    }
}

/// Counts membership change notifications so that the health of the cluster
/// shows up on a dashboard
pub struct MetricsListener {
    metrics: Arc<Metrics>,
}

impl MetricsListener {
    pub fn new(metrics: &Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            metrics: Arc::clone(metrics),
        })
    }
}

impl ClusterListener for MetricsListener {
    fn node_became_alive(&self, _node_uuid: NodeUuid) {
        self.metrics.incr(Metrics::METRIC_NODE_ALIVE_COUNT);
    }

    fn node_became_dead(&self, _node_uuid: NodeUuid) {
        self.metrics.incr(Metrics::METRIC_NODE_DEAD_COUNT);
    }

    fn ballot_resolved(&self, _subject: BallotSubject, _winner: NodeUuid) {
        self.metrics.incr(Metrics::METRIC_BALLOT_RESOLVED_COUNT);
    }

    fn compaction_due(&self) {
        self.metrics.incr(Metrics::METRIC_COMPACTION_DUE_COUNT);
    }
}

#[derive(Clone)]
#[cfg_attr(debug_assertions, derive(Debug))]
pub struct ClusterEvent {
    pub timestamp: DateTime<Utc>,
    pub description: String,
}

/// A bounded in-memory log of membership events with wall clock timestamps,
/// kept so that an operator can see the recent history of the cluster
pub struct EventLog {
    events: Mutex<VecDeque<ClusterEvent>>,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(VecDeque::with_capacity(EVENT_LOG_CAPACITY)),
        })
    }

    pub fn events(self: &Self) -> Vec<ClusterEvent> {
        self.events.lock().unwrap().iter().cloned().collect()
    }

    fn append(self: &Self, description: String) {
        let mut events = self.events.lock().unwrap();
        if events.len() == EVENT_LOG_CAPACITY {
            events.pop_front();
        }
        events.push_back(ClusterEvent {
            timestamp: Utc::now(),
            description,
        });
    }
}

impl ClusterListener for EventLog {
    fn node_became_alive(&self, node_uuid: NodeUuid) {
        self.append(format!("Node {node_uuid} joined the cluster"));
    }

    fn node_became_dead(&self, node_uuid: NodeUuid) {
        self.append(format!("Node {node_uuid} was declared dead"));
    }

    fn ballot_resolved(&self, subject: BallotSubject, winner: NodeUuid) {
        self.append(format!("Node {winner} took over {subject}"));
    }
}
