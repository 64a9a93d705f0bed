/*
The alarm clock is the one shared timer for the whole process. Every piece of
time-based protocol behavior (heart beats, reconnects, ballot deadlines,
compaction) registers an alarm here rather than owning its own timer, which
keeps all of the time-driven transitions observable and cancelable from one
place during shutdown and in tests.
*/

use log::{error, info};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

const SCAN_INTERVAL: Duration = Duration::from_millis(5);

/// Identifies why a timer fired. Receivers dispatch on this value, handling
/// the kinds they care about and ignoring the rest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AlarmKind {
    Unknown,
    Test,             // for testing
    Auction,          // deadline for an open ballot
    Bid,              // timeout waiting for the initiator of a ballot
    Coalesce,         // time to merge links that point to the same node
    Compaction,       // time for the message log to compact
    Cluster,          // time for the cluster to reconnect
    DeadNode,         // the dead node timeout
    HeartBeat,        // time to send a heart beat
    HeartBeatTimeout, // timeout waiting for a heart beat response
    Start,            // the start timeout
}

#[derive(Debug)]
pub enum AlarmError {
    Error { msg: String },
}

pub type AlarmResult = Result<(), AlarmError>;

/// The capability to receive alarms from the alarm clock. An error returned
/// from on_alarm is logged by the dispatcher and discarded, it does not
/// cancel the timer and it cannot stop the clock.
pub trait Alarmable: Send + Sync {
    fn on_alarm(&self, alarm: AlarmKind) -> AlarmResult;
}

/// Identifies one scheduled alarm so that it can be cancelled
pub type TimerHandle = u64;

struct ScheduledAlarm {
    handle: TimerHandle,
    receiver: Arc<dyn Alarmable>,
    kind: AlarmKind,
    due: Instant,
    period: Option<Duration>,
}

struct MutableState {
    alarms: Vec<ScheduledAlarm>,
}

/// The process-wide timer registry. Construct one per process and pass the
/// Arc to every component that schedules or receives alarms.
pub struct AlarmClock {
    mutable: Mutex<MutableState>,
    next_handle: AtomicU64,
    stop_signal: Arc<AtomicBool>,
}

impl AlarmClock {
    pub fn new() -> Arc<Self> {
        let clock = Arc::new(Self {
            mutable: Mutex::new(MutableState { alarms: Vec::new() }),
            next_handle: AtomicU64::new(1),
            stop_signal: Arc::new(AtomicBool::new(false)),
        });

        let scan_clock = Arc::clone(&clock);
        thread::spawn(move || scan_clock.run());

        clock
    }

    /// Registers a repeating alarm. The first firing occurs after period,
    /// then every period thereafter until the alarm is cancelled.
    pub fn schedule(
        self: &Self,
        receiver: Arc<dyn Alarmable>,
        kind: AlarmKind,
        period: Duration,
    ) -> TimerHandle {
        assert!(
            period > Duration::ZERO,
            "AlarmClock: Repeating alarms must have a period greater than zero"
        );
        self.add_alarm(receiver, kind, Instant::now() + period, Some(period))
    }

    /// Registers an alarm that fires once after the delay
    pub fn schedule_once(
        self: &Self,
        receiver: Arc<dyn Alarmable>,
        kind: AlarmKind,
        delay: Duration,
    ) -> TimerHandle {
        self.add_alarm(receiver, kind, Instant::now() + delay, None)
    }

    /// Cancels one alarm. Cancelling a handle that already fired or was
    /// already cancelled is a no-op.
    pub fn cancel(self: &Self, handle: TimerHandle) {
        let mutable = &mut *self.mutable.lock().unwrap();
        mutable.alarms.retain(|alarm| alarm.handle != handle);
    }

    /// Cancels every outstanding alarm. Safe to call while firings are in
    /// flight, a firing that was already dispatched runs to completion but
    /// nothing new fires after this returns.
    pub fn cancel_all(self: &Self) {
        let mutable = &mut *self.mutable.lock().unwrap();
        let count = mutable.alarms.len();
        mutable.alarms.clear();
        info!("AlarmClock: Cancelled {count} alarms");
    }

    /// The number of outstanding alarms
    pub fn alarm_count(self: &Self) -> usize {
        self.mutable.lock().unwrap().alarms.len()
    }

    /// Stops the scan thread. The clock cannot be restarted after this, it
    /// is intended for process shutdown.
    pub fn stop(self: &Self) {
        if !self.stop_signal.load(Ordering::Relaxed) {
            self.stop_signal.store(true, Ordering::Relaxed);
            info!("AlarmClock: Stopped");
        }
    }

    fn add_alarm(
        self: &Self,
        receiver: Arc<dyn Alarmable>,
        kind: AlarmKind,
        due: Instant,
        period: Option<Duration>,
    ) -> TimerHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let mutable = &mut *self.mutable.lock().unwrap();
        mutable.alarms.push(ScheduledAlarm {
            handle,
            receiver,
            kind,
            due,
            period,
        });
        handle
    }

    fn run(self: Arc<Self>) {
        info!("AlarmClock: Started");
        while !self.stop_signal.load(Ordering::Relaxed) {
            self.fire_due_alarms(Instant::now());
            thread::sleep(SCAN_INTERVAL);
        }
    }

    fn fire_due_alarms(self: &Self, now: Instant) {
        // Receivers are collected under the lock but invoked outside of it,
        // each on its own thread. A slow or failing receiver cannot stall
        // the scan thread or any other timer.
        let mut due: Vec<(Arc<dyn Alarmable>, AlarmKind)> = Vec::new();
        {
            let mutable = &mut *self.mutable.lock().unwrap();
            let mut index = 0;
            while index < mutable.alarms.len() {
                if mutable.alarms[index].due <= now {
                    let alarm = &mut mutable.alarms[index];
                    due.push((Arc::clone(&alarm.receiver), alarm.kind));
                    match alarm.period {
                        Some(period) => {
                            alarm.due = now + period;
                            index += 1;
                        }
                        None => {
                            mutable.alarms.swap_remove(index);
                        }
                    }
                } else {
                    index += 1;
                }
            }
        }

        for (receiver, kind) in due {
            thread::spawn(move || {
                if let Err(AlarmError::Error { msg }) = receiver.on_alarm(kind) {
                    error!("AlarmClock: {kind:?} alarm handler failed: {msg}");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingReceiver {
        count: AtomicU32,
        fail: bool,
    }

    impl CountingReceiver {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                count: AtomicU32::new(0),
                fail,
            })
        }

        fn count(self: &Self) -> u32 {
            self.count.load(Ordering::Relaxed)
        }
    }

    impl Alarmable for CountingReceiver {
        fn on_alarm(&self, alarm: AlarmKind) -> AlarmResult {
            assert_eq!(alarm, AlarmKind::Test);
            self.count.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                Err(AlarmError::Error {
                    msg: String::from("deliberate failure"),
                })
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn one_shot_alarms_fire_once() {
        let clock = AlarmClock::new();
        let receiver = CountingReceiver::new(false);

        clock.schedule_once(receiver.clone(), AlarmKind::Test, Duration::from_millis(20));

        thread::sleep(Duration::from_millis(200));
        assert_eq!(receiver.count(), 1);
        assert_eq!(clock.alarm_count(), 0);
        clock.stop();
    }

    #[test]
    fn repeating_alarms_fire_until_cancelled() {
        let clock = AlarmClock::new();
        let receiver = CountingReceiver::new(false);

        let handle = clock.schedule(receiver.clone(), AlarmKind::Test, Duration::from_millis(20));

        thread::sleep(Duration::from_millis(300));
        let count = receiver.count();
        assert!(count >= 2, "expected at least 2 firings, got {count}");

        clock.cancel(handle);
        thread::sleep(Duration::from_millis(50));
        let count = receiver.count();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(receiver.count(), count);
        clock.stop();
    }

    #[test]
    fn a_failing_receiver_does_not_cancel_its_timer() {
        let clock = AlarmClock::new();
        let receiver = CountingReceiver::new(true);

        clock.schedule(receiver.clone(), AlarmKind::Test, Duration::from_millis(20));

        thread::sleep(Duration::from_millis(300));
        assert!(receiver.count() >= 2);
        clock.stop();
    }
}
