use log::{info, LevelFilter};
use std::{
    env,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use courier_broker::{
    alarms::AlarmClock,
    build_number::BUILD_NUMBER,
    cluster::service::ClusterService,
    observability::{EventLog, Metrics, MetricsListener},
    settings::ClusterSettings,
    App,
};

fn main() {
    let mut clog = colog::default_builder();

    #[cfg(debug_assertions)]
    clog.filter_level(LevelFilter::Debug);

    #[cfg(not(debug_assertions))]
    clog.filter_level(LevelFilter::Warn);

    clog.init();

    // 1st command line arg is the name of the environment
    let args: Vec<String> = env::args().collect();
    let environment: &'static str = match args.get(1) {
        Some(s) => s.clone().leak(),
        None => "dev",
    };

    info!("Broker build {BUILD_NUMBER} starting in the {environment} environment");

    let settings = match ClusterSettings::load(environment) {
        Ok(settings) => settings,
        Err(e) => panic!("Could not load application settings: {e:?}"),
    };

    let alarm_clock = AlarmClock::new();
    let metrics = Arc::new(Metrics::new());
    let event_log = EventLog::new();

    let app = Arc::new(App {
        stop_signal: Arc::new(AtomicBool::new(false)),
        alarm_clock: alarm_clock.clone(),
        metrics: Arc::clone(&metrics),
        event_log: Arc::clone(&event_log),
        cluster_service: Arc::new(ClusterService::new(&settings, &alarm_clock, &metrics)),
    });

    app.cluster_service
        .register_listener(MetricsListener::new(&metrics));
    app.cluster_service.register_listener(event_log);

    // Handle SIGTERM by setting the stop_signal boolean
    let stop_signal = app.stop_signal.clone();
    ctrlc::set_handler(move || stop_signal.store(true, Ordering::Relaxed)).unwrap();

    // Report metrics in the background until shutdown
    let metrics_app = Arc::clone(&app);
    thread::spawn(move || metrics_app.metrics.run(&metrics_app.stop_signal));

    if let Err(e) = app.cluster_service.start() {
        panic!("Could not start the cluster service: {e:?}");
    }

    while !app.stop_signal.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }

    app.cluster_service.shutdown();
    app.alarm_clock.stop();
}
