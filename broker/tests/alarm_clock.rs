use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use courier_broker::alarms::{AlarmClock, AlarmKind, AlarmResult, Alarmable};

#[derive(Default)]
struct SlowReceiver {
    started: AtomicU32,
    finished: AtomicU32,
}

impl Alarmable for SlowReceiver {
    fn on_alarm(&self, _alarm: AlarmKind) -> AlarmResult {
        self.started.fetch_add(1, Ordering::Relaxed);
        thread::sleep(Duration::from_millis(100));
        self.finished.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Default)]
struct CountingReceiver {
    count: AtomicU32,
}

impl Alarmable for CountingReceiver {
    fn on_alarm(&self, _alarm: AlarmKind) -> AlarmResult {
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[test]
fn cancel_all_is_safe_while_an_alarm_is_mid_dispatch() {
    let clock = AlarmClock::new();
    let receiver = Arc::new(SlowReceiver::default());

    clock.schedule(receiver.clone(), AlarmKind::Test, Duration::from_millis(20));

    // Wait for at least one dispatch to be in flight, then cancel with the
    // receiver still asleep inside its handler
    while receiver.started.load(Ordering::Relaxed) == 0 {
        thread::sleep(Duration::from_millis(5));
    }
    clock.cancel_all();
    assert_eq!(clock.alarm_count(), 0);

    // In-flight dispatches run to completion
    thread::sleep(Duration::from_millis(300));
    let started = receiver.started.load(Ordering::Relaxed);
    assert!(started >= 1);
    assert_eq!(receiver.finished.load(Ordering::Relaxed), started);

    // Nothing new fires after cancel_all returned
    thread::sleep(Duration::from_millis(200));
    assert_eq!(receiver.started.load(Ordering::Relaxed), started);
    clock.stop();
}

#[test]
fn cancel_all_prevents_pending_one_shot_alarms() {
    let clock = AlarmClock::new();
    let receiver = Arc::new(CountingReceiver::default());

    clock.schedule_once(receiver.clone(), AlarmKind::Test, Duration::from_millis(100));
    clock.schedule_once(receiver.clone(), AlarmKind::Cluster, Duration::from_millis(150));
    assert_eq!(clock.alarm_count(), 2);

    clock.cancel_all();

    thread::sleep(Duration::from_millis(300));
    assert_eq!(receiver.count.load(Ordering::Relaxed), 0);
    clock.stop();
}

#[test]
fn the_clock_keeps_running_after_cancel_all() {
    let clock = AlarmClock::new();
    let receiver = Arc::new(CountingReceiver::default());

    clock.schedule(receiver.clone(), AlarmKind::Test, Duration::from_millis(20));
    clock.cancel_all();

    // The clock is still usable after a reset
    clock.schedule_once(receiver.clone(), AlarmKind::Test, Duration::from_millis(20));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(receiver.count.load(Ordering::Relaxed), 1);
    clock.stop();
}
