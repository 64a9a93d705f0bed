use std::sync::{atomic::AtomicBool, Arc};

use alarms::AlarmClock;
use cluster::service::ClusterService;
use observability::{EventLog, Metrics};

/// The process wide alarm clock that drives all time based protocol behavior
pub mod alarms;

/// Cluster liveness: links, heart beats, membership and ballots
pub mod cluster;

/// Aggregates metrics and reports them to the monitoring infrastructure
pub mod observability;

/// Application settings merged from files and environment variables
pub mod settings;

/// Miscelaneous utility functions
pub mod utils;

pub mod build_number;

/// A container for the application singletons. Injecting App is much simpler
/// than injecting dependnecies individually. The application owns Arcs and
/// the Arcs own the singeltons.
pub struct App {
    pub stop_signal: Arc<AtomicBool>,
    pub alarm_clock: Arc<AlarmClock>,
    pub metrics: Arc<Metrics>,
    pub event_log: Arc<EventLog>,
    pub cluster_service: Arc<ClusterService>,
}
