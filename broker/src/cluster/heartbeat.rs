/*
The heart beat protocol for one link. Any traffic in either direction counts
as activity, so a busy link never carries heart beat frames. When the link
has been idle for the heart beat interval a heart beat frame is sent and the
peer has the heart beat timeout to show signs of life before it is reported
dead. Both ends of a link run their own monitor, detection is independent in
each direction.
*/

use log::{info, warn};
use std::{
    sync::{
        mpsc::Sender,
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use courier_net::{data_types::Timestamp, frames};

use crate::{
    alarms::{AlarmClock, AlarmKind, AlarmResult, Alarmable, TimerHandle},
    utils::now_epoc_millis,
};

use super::link::LinkId;

struct MutableState {
    last_send_time: Option<Timestamp>,
    last_receive_time: Option<Timestamp>,

    /// The time the last heart beat frame was sent. Deliberately not updated
    /// when one is received, it bounds the round trip of the next expected
    /// reply.
    start: Timestamp,

    /// Whether the peer showed signs of life since the last heart beat was
    /// sent
    met_timeout: bool,

    /// The handle of the pending heart beat timeout alarm, if one is set
    timeout_handle: Option<TimerHandle>,
}

/// Watches activity on one link and enforces the heart beat protocol.
/// Reports the link dead on the channel it was constructed with, the owner
/// of the link resolves that to a node and updates the membership table.
pub struct HeartBeatMonitor {
    link_id: LinkId,
    frame_tx: Sender<Vec<u8>>,
    dead_tx: Sender<LinkId>,
    alarm_clock: Arc<AlarmClock>,
    heart_beat_interval: Timestamp,
    heart_beat_timeout: Timestamp,
    weak_self: Weak<HeartBeatMonitor>,
    mutable: Mutex<MutableState>,
}

impl HeartBeatMonitor {
    pub fn new(
        link_id: LinkId,
        frame_tx: Sender<Vec<u8>>,
        dead_tx: Sender<LinkId>,
        alarm_clock: &Arc<AlarmClock>,
        heart_beat_interval: Timestamp,
        heart_beat_timeout: Timestamp,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            link_id,
            frame_tx,
            dead_tx,
            alarm_clock: Arc::clone(alarm_clock),
            heart_beat_interval,
            heart_beat_timeout,
            weak_self: weak_self.clone(),
            mutable: Mutex::new(MutableState {
                last_send_time: None,
                last_receive_time: None,
                start: now_epoc_millis(),
                met_timeout: false,
                timeout_handle: None,
            }),
        })
    }

    /// Outbound traffic was observed on the link
    pub fn observe_write(self: &Self, now: Timestamp) {
        self.mutable.lock().unwrap().last_send_time = Some(now);
    }

    /// Inbound traffic was observed on the link
    pub fn observe_read(self: &Self, now: Timestamp) {
        self.mutable.lock().unwrap().last_receive_time = Some(now);
    }

    /// A whole frame arrived on the link. Returns true if the frame was one
    /// of the reserved heart beat frames and has been consumed, false if it
    /// should be passed through to the message decoder unchanged.
    pub fn on_frame_received(self: &Self, frame: &[u8], now: Timestamp) -> bool {
        if frames::is_heart_beat_start(frame) {
            // The peer wants proof of life, answer straight away
            if self.frame_tx.send(frames::HEART_BEAT_FRAME.to_vec()).is_ok() {
                self.mutable.lock().unwrap().last_send_time = Some(now);
            }
            true
        } else if frames::is_heart_beat(frame) {
            // A reply to our probe. Judged against the time the probe was
            // sent, a reply slower than the timeout proves nothing.
            let mutable = &mut *self.mutable.lock().unwrap();
            if now > mutable.start + self.heart_beat_timeout {
                self.report_dead("a heart beat reply arrived too late");
            } else {
                mutable.met_timeout = true;
            }
            true
        } else {
            false
        }
    }

    /// The time of the most recent traffic in either direction, None if no
    /// traffic has ever been observed
    pub fn time_of_last_activity(self: &Self) -> Option<Timestamp> {
        let mutable = self.mutable.lock().unwrap();
        match (mutable.last_send_time, mutable.last_receive_time) {
            (Some(send), Some(receive)) => Some(send.max(receive)),
            (Some(send), None) => Some(send),
            (None, Some(receive)) => Some(receive),
            (None, None) => None,
        }
    }

    pub fn last_send_time(self: &Self) -> Option<Timestamp> {
        self.mutable.lock().unwrap().last_send_time
    }

    pub fn last_receive_time(self: &Self) -> Option<Timestamp> {
        self.mutable.lock().unwrap().last_receive_time
    }

    /// A link with no observed activity is offline
    pub fn is_online(self: &Self) -> bool {
        self.time_of_last_activity().is_some()
    }

    /// Cancels the pending heart beat timeout alarm if one is set. Called
    /// when the link's node is declared dead so that a stale timeout cannot
    /// fire for a link that no longer matters.
    pub fn cancel_scoped_alarms(self: &Self) {
        let mutable = &mut *self.mutable.lock().unwrap();
        if let Some(handle) = mutable.timeout_handle.take() {
            self.alarm_clock.cancel(handle);
        }
    }

    /// Sends a heart beat if the link has been idle for longer than the
    /// heart beat interval, or if no traffic has ever been observed
    fn check_send(self: &Self, now: Timestamp) {
        let mutable = &mut *self.mutable.lock().unwrap();

        let idle = match (mutable.last_send_time, mutable.last_receive_time) {
            (None, None) => true,
            (send, receive) => {
                let last_activity = send.unwrap_or(0).max(receive.unwrap_or(0));
                now > last_activity + self.heart_beat_interval
            }
        };
        if !idle {
            return;
        }

        if self
            .frame_tx
            .send(frames::HEART_BEAT_START_FRAME.to_vec())
            .is_err()
        {
            // The link thread is gone, the owner will notice and tear the
            // link down
            warn!("HeartBeatMonitor: Could not send a heart beat, the link is closed");
            return;
        }

        mutable.start = now;
        mutable.met_timeout = false;
        mutable.last_send_time = Some(now);

        if let Some(monitor) = self.weak_self.upgrade() {
            let handle = self.alarm_clock.schedule_once(
                monitor,
                AlarmKind::HeartBeatTimeout,
                Duration::from_millis(self.heart_beat_timeout),
            );
            mutable.timeout_handle = Some(handle);
        }
    }

    /// The heart beat timeout expired. If the peer showed no signs of life
    /// since the heart beat was sent it is reported dead.
    fn check_reply(self: &Self, _now: Timestamp) {
        let mutable = &mut *self.mutable.lock().unwrap();
        mutable.timeout_handle = None;
        if !mutable.met_timeout {
            self.report_dead("no response to a heart beat");
        } else {
            mutable.met_timeout = false;
        }
    }

    fn report_dead(self: &Self, reason: &str) {
        info!(
            "HeartBeatMonitor: Peer on link {} has gone offline: {reason}",
            self.link_id
        );
        let _ = self.dead_tx.send(self.link_id);
    }
}

impl Alarmable for HeartBeatMonitor {
    fn on_alarm(&self, alarm: AlarmKind) -> AlarmResult {
        match alarm {
            AlarmKind::HeartBeat => self.check_send(now_epoc_millis()),
            AlarmKind::HeartBeatTimeout => self.check_reply(now_epoc_millis()),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    const INTERVAL: Timestamp = 5000;
    const TIMEOUT: Timestamp = 500;

    struct Fixture {
        monitor: Arc<HeartBeatMonitor>,
        frame_rx: std::sync::mpsc::Receiver<Vec<u8>>,
        dead_rx: std::sync::mpsc::Receiver<LinkId>,
        clock: Arc<AlarmClock>,
    }

    fn fixture() -> Fixture {
        let (frame_tx, frame_rx) = channel();
        let (dead_tx, dead_rx) = channel();
        let clock = AlarmClock::new();
        let monitor = HeartBeatMonitor::new(1, frame_tx, dead_tx, &clock, INTERVAL, TIMEOUT);
        Fixture {
            monitor,
            frame_rx,
            dead_rx,
            clock,
        }
    }

    #[test]
    fn idle_link_sends_a_heart_beat() {
        let fixture = fixture();

        fixture.monitor.check_send(now_epoc_millis());

        let frame = fixture.frame_rx.try_recv().unwrap();
        assert_eq!(&frame[..], frames::HEART_BEAT_START_FRAME);
        fixture.clock.stop();
    }

    #[test]
    fn a_probe_is_answered_with_a_reply() {
        let fixture = fixture();

        let consumed = fixture
            .monitor
            .on_frame_received(frames::HEART_BEAT_START_FRAME, now_epoc_millis());

        assert!(consumed);
        let frame = fixture.frame_rx.try_recv().unwrap();
        assert_eq!(&frame[..], frames::HEART_BEAT_FRAME);
        fixture.clock.stop();
    }

    #[test]
    fn active_link_never_sends_heart_beats() {
        let fixture = fixture();
        let now = now_epoc_millis();

        // Traffic was observed more recently than one interval ago
        fixture.monitor.observe_read(now);
        fixture.monitor.check_send(now + INTERVAL - 1);
        fixture.monitor.observe_write(now + INTERVAL);
        fixture.monitor.check_send(now + (INTERVAL * 2) - 1);

        assert!(fixture.frame_rx.try_recv().is_err());
        fixture.clock.stop();
    }

    #[test]
    fn timely_reply_keeps_the_peer_alive() {
        let fixture = fixture();
        let now = now_epoc_millis();

        fixture.monitor.check_send(now);
        assert!(fixture.frame_rx.try_recv().is_ok());

        // The reply arrives within the timeout
        let consumed = fixture
            .monitor
            .on_frame_received(frames::HEART_BEAT_FRAME, now + TIMEOUT - 100);
        assert!(consumed);

        fixture.monitor.check_reply(now + TIMEOUT);
        assert!(fixture.dead_rx.try_recv().is_err());
        fixture.clock.stop();
    }

    #[test]
    fn missing_reply_reports_the_peer_dead() {
        let fixture = fixture();
        let now = now_epoc_millis();

        // Heart beat sent at t=interval, nothing heard by t=interval+timeout
        fixture.monitor.check_send(now + INTERVAL);
        fixture.monitor.check_reply(now + INTERVAL + TIMEOUT);

        assert_eq!(fixture.dead_rx.try_recv().unwrap(), 1);
        fixture.clock.stop();
    }

    #[test]
    fn late_reply_reports_the_peer_dead() {
        let fixture = fixture();
        let now = now_epoc_millis();

        fixture.monitor.check_send(now);
        let consumed = fixture
            .monitor
            .on_frame_received(frames::HEART_BEAT_FRAME, now + TIMEOUT + 1);

        assert!(consumed);
        assert_eq!(fixture.dead_rx.try_recv().unwrap(), 1);
        fixture.clock.stop();
    }

    #[test]
    fn other_frames_pass_through_to_the_decoder() {
        let fixture = fixture();

        let consumed = fixture
            .monitor
            .on_frame_received(&[0x01, 0x02, 0x03], now_epoc_millis());

        assert!(!consumed);
        fixture.clock.stop();
    }
}
