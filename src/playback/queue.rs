use crate::config::{ProgressStyle, ReplaySettings};
use crate::core::{Timestamp, TrackPoint};
use crate::playback::PlaybackState;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

/// A point is delivered when it is due within this tolerance
pub const DUE_EPSILON: Duration = Duration::from_millis(10);

/// A point handed out for delivery
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub point: TrackPoint,
    /// Buffer index of the point
    pub index: usize,
    /// Progress percentage at the time of delivery
    pub progress: u8,
}

/// Result of polling the real-time schedule
#[derive(Debug, Clone, PartialEq)]
pub enum NextDue {
    /// Nothing to schedule (no points, or real-time delivery not active)
    Idle,
    /// The head of the pending queue is due now
    Due(Delivery),
    /// The head of the pending queue becomes due at this instant
    Wait(Instant),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Pending {
    index: usize,
    due: Instant,
}

/// Everything the scheduler guards, behind one lock
#[derive(Debug)]
struct QueueState {
    points: Vec<TrackPoint>,
    source_id: Option<String>,
    cursor: usize,
    state: PlaybackState,
    /// Speed factor while real-time delivery is active
    real_time: Option<f64>,
    /// Time-ordered schedule, starting at the cursor
    pending: VecDeque<Pending>,
}

impl QueueState {
    /// Rebuild the schedule from the cursor to the end of the buffer.
    ///
    /// Due times follow the recorded gaps relative to the first timestamped
    /// point at or after the cursor, divided by `speed`. They never decrease:
    /// untimed or out-of-order points are due together with their predecessor.
    /// A point whose timestamp kind differs from the anchor's starts a new
    /// anchor at the current due time.
    fn rebuild_pending(&mut self, speed: f64, now: Instant) {
        self.pending.clear();

        let mut clock: Option<TrackClock> = None;
        let mut base = now;
        let mut due = now;

        for (index, point) in self.points.iter().enumerate().skip(self.cursor) {
            if let Some(t) = point.timestamp {
                let elapsed = match clock.as_mut().and_then(|c| c.elapsed(&t)) {
                    Some(ms) => ms,
                    None => {
                        clock = Some(TrackClock::new(t));
                        base = due;
                        0
                    }
                };
                let offset_ms = (elapsed as f64 / speed).max(0.0);
                due = due.max(base + Duration::from_millis(offset_ms as u64));
            }
            self.pending.push_back(Pending { index, due });
        }
    }

    /// Hand out the point at `index` and move the cursor past it
    fn deliver(&mut self, index: usize, style: ProgressStyle) -> Delivery {
        let len = self.points.len();
        let delivery = Delivery {
            point: self.points[index].clone(),
            index,
            progress: style.percent(index, len),
        };
        self.cursor = reposition(self.state, index as i64 + 1, len);
        delivery
    }
}

const DAY_MS: i64 = 86_400_000;

/// Recorded time elapsed since an anchor timestamp
#[derive(Debug)]
struct TrackClock {
    anchor: Timestamp,
    last_of_day: i64,
    days: i64,
}

impl TrackClock {
    fn new(anchor: Timestamp) -> Self {
        Self {
            anchor,
            last_of_day: anchor.as_millis(),
            days: 0,
        }
    }

    /// Milliseconds from the anchor to `t`, or `None` when `t` is a
    /// different kind of timestamp.
    ///
    /// Time-of-day values that drop by more than half a day have crossed
    /// midnight.
    fn elapsed(&mut self, t: &Timestamp) -> Option<i64> {
        match (&self.anchor, t) {
            (Timestamp::Absolute(anchor), Timestamp::Absolute(t)) => {
                Some((*t - *anchor).num_milliseconds())
            }
            (Timestamp::TimeOfDay(_), Timestamp::TimeOfDay(_)) => {
                let of_day = t.as_millis();
                if self.last_of_day - of_day > DAY_MS / 2 {
                    self.days += 1;
                }
                self.last_of_day = of_day;
                Some(of_day + self.days * DAY_MS - self.anchor.as_millis())
            }
            _ => None,
        }
    }
}

/// Clamp (stopped) or wrap (running) a target index into `[0, len)`.
/// `len` must be non-zero.
fn reposition(state: PlaybackState, target: i64, len: usize) -> usize {
    let len = len as i64;
    let index = match state {
        PlaybackState::Stopped => target.clamp(0, len - 1),
        PlaybackState::Running => target.rem_euclid(len),
    };
    index as usize
}

/// Replay scheduler: the loaded points, the cursor and the delivery schedule
///
/// All reads and writes of the buffer and the cursor go through one mutex, so
/// a jump can never interleave with half of a tick.
pub struct ReplayQueue {
    inner: Mutex<QueueState>,
    /// Wakes the real-time waiter when the schedule changes
    changed: Notify,
    samples_per_minute: i64,
    progress_style: ProgressStyle,
}

impl ReplayQueue {
    pub fn new(samples_per_minute: i64, progress_style: ProgressStyle) -> Self {
        Self {
            inner: Mutex::new(QueueState {
                points: Vec::new(),
                source_id: None,
                cursor: 0,
                state: PlaybackState::Stopped,
                real_time: None,
                pending: VecDeque::new(),
            }),
            changed: Notify::new(),
            samples_per_minute: samples_per_minute.max(1),
            progress_style,
        }
    }

    pub fn from_settings(settings: &ReplaySettings) -> Self {
        Self::new(settings.samples_per_minute, settings.progress_style)
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the buffer with a freshly ingested track.
    ///
    /// The cursor goes back to 0 only when `source_id` differs from the
    /// loaded source; reloading the same source keeps the position.
    /// Returns true when the cursor was reset.
    pub fn load(&self, source_id: &str, points: Vec<TrackPoint>) -> bool {
        let mut state = self.state();
        let reset = state.source_id.as_deref() != Some(source_id);

        state.points = points;
        state.source_id = Some(source_id.to_string());
        state.pending.clear();
        state.cursor = if reset || state.points.is_empty() {
            0
        } else {
            state.cursor.min(state.points.len() - 1)
        };

        info!(
            "Loaded {} points from '{}' (cursor {})",
            state.points.len(),
            source_id,
            state.cursor
        );
        drop(state);
        self.changed.notify_one();
        reset
    }

    /// Drop the buffer and forget the loaded source
    pub fn clear(&self) {
        let mut state = self.state();
        state.points.clear();
        state.source_id = None;
        state.cursor = 0;
        state.pending.clear();
        drop(state);
        self.changed.notify_one();
    }

    /// Fixed-rate delivery: hand out the point at the cursor and advance
    pub fn tick(&self) -> Option<Delivery> {
        let mut state = self.state();
        if state.points.is_empty() {
            return None;
        }
        let index = state.cursor;
        Some(state.deliver(index, self.progress_style))
    }

    /// Move the cursor by `delta_minutes * samples_per_minute` points.
    ///
    /// Stopped playback clamps to the buffer; running playback wraps around.
    /// Returns the new progress, or `None` when nothing is loaded.
    pub fn jump(&self, delta_minutes: i64) -> Option<u8> {
        let mut state = self.state();
        let len = state.points.len();
        if len == 0 {
            return None;
        }

        let delta = delta_minutes.saturating_mul(self.samples_per_minute);
        let target = (state.cursor as i64).saturating_add(delta);
        state.cursor = reposition(state.state, target, len);

        if let Some(speed) = state.real_time {
            state.rebuild_pending(speed, Instant::now());
        }

        debug!("Jumped {} min to {}/{}", delta_minutes, state.cursor, len);
        let progress = self.progress_style.percent(state.cursor, len);
        drop(state);
        self.changed.notify_one();
        Some(progress)
    }

    /// Stop delivery: leave real-time mode and drop every pending item
    pub fn reset(&self) {
        let mut state = self.state();
        state.real_time = None;
        state.pending.clear();
        drop(state);
        self.changed.notify_one();
    }

    /// Enter real-time delivery, scheduling from the cursor as of now
    pub fn begin_real_time(&self, speed: f64) {
        let mut state = self.state();
        state.real_time = Some(speed);
        if !state.points.is_empty() {
            state.rebuild_pending(speed, Instant::now());
        }
        drop(state);
        self.changed.notify_one();
    }

    /// Real-time delivery: take the head of the schedule if it is due.
    ///
    /// When the schedule has drained it is rebuilt from the cursor, which
    /// has wrapped to the start of the track while running.
    pub fn next_due(&self) -> NextDue {
        let now = Instant::now();
        let mut state = self.state();

        let Some(speed) = state.real_time else {
            return NextDue::Idle;
        };
        if state.points.is_empty() {
            return NextDue::Idle;
        }
        if state.pending.is_empty() {
            state.rebuild_pending(speed, now);
        }

        let Some(head) = state.pending.front().copied() else {
            return NextDue::Idle;
        };
        if head.due > now + DUE_EPSILON {
            return NextDue::Wait(head.due);
        }

        state.pending.pop_front();
        NextDue::Due(state.deliver(head.index, self.progress_style))
    }

    /// Resolves after the next load, jump or reset
    pub async fn changed(&self) {
        self.changed.notified().await
    }

    pub fn set_state(&self, new_state: PlaybackState) {
        self.state().state = new_state;
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.state().state
    }

    pub fn cursor(&self) -> usize {
        self.state().cursor
    }

    pub fn len(&self) -> usize {
        self.state().points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn source_id(&self) -> Option<String> {
        self.state().source_id.clone()
    }

    /// Progress percentage at the current cursor
    pub fn progress(&self) -> u8 {
        let state = self.state();
        self.progress_style.percent(state.cursor, state.points.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone, Utc};

    fn track(len: usize) -> Vec<TrackPoint> {
        (0..len)
            .map(|i| TrackPoint::new(i as f64 * 0.001, 0.0).unwrap())
            .collect()
    }

    fn timed(seconds: &[i64]) -> Vec<TrackPoint> {
        let base = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        seconds
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let mut p = TrackPoint::new(0.0, i as f64 * 0.1).unwrap();
                p.timestamp = Some(Timestamp::Absolute(base + chrono::Duration::seconds(*s)));
                p
            })
            .collect()
    }

    fn point_at(timestamp: Timestamp) -> TrackPoint {
        let mut p = TrackPoint::new(0.0, 0.0).unwrap();
        p.timestamp = Some(timestamp);
        p
    }

    fn time_of_day(h: u32, m: u32, s: u32) -> Timestamp {
        Timestamp::TimeOfDay(NaiveTime::from_hms_opt(h, m, s).unwrap())
    }

    fn queue_with(len: usize, state: PlaybackState) -> ReplayQueue {
        let queue = ReplayQueue::new(60, ProgressStyle::OneBased);
        queue.load("track.gpx", track(len));
        queue.set_state(state);
        queue
    }

    #[test]
    fn test_jump_clamps_while_stopped() {
        let queue = queue_with(10, PlaybackState::Stopped);

        queue.jump(-1);
        assert_eq!(queue.cursor(), 0);

        queue.jump(1);
        assert_eq!(queue.cursor(), 9);

        queue.jump(i64::MIN);
        assert_eq!(queue.cursor(), 0);
    }

    #[test]
    fn test_jump_wraps_while_running() {
        let queue = queue_with(100, PlaybackState::Running);
        for _ in 0..95 {
            queue.tick();
        }
        assert_eq!(queue.cursor(), 95);

        queue.jump(1);
        assert_eq!(queue.cursor(), 55);

        // magnitudes past one buffer length still land in range
        queue.jump(-3);
        assert_eq!(queue.cursor(), 75);
        queue.jump(-50);
        assert_eq!(queue.cursor(), 75);
        queue.jump(7);
        assert_eq!(queue.cursor(), 95);
    }

    #[test]
    fn test_jump_on_empty_is_noop() {
        let queue = ReplayQueue::new(60, ProgressStyle::OneBased);
        assert_eq!(queue.jump(3), None);
        assert_eq!(queue.tick(), None);
        assert_eq!(queue.cursor(), 0);
    }

    #[test]
    fn test_tick_progress_one_based() {
        let queue = queue_with(100, PlaybackState::Running);

        let progress: Vec<u8> = (0..101).map(|_| queue.tick().unwrap().progress).collect();

        assert!(progress[..100].windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress[0], 1);
        assert_eq!(progress[98], 99);
        assert_eq!(progress[99], 100);
        // wrapped back to the first point
        assert_eq!(progress[100], 1);
    }

    #[test]
    fn test_tick_progress_zero_based_and_order() {
        let queue = ReplayQueue::new(60, ProgressStyle::ZeroBased);
        queue.load("a", track(4));
        queue.set_state(PlaybackState::Running);

        let ticks: Vec<Delivery> = (0..5).map(|_| queue.tick().unwrap()).collect();
        let indices: Vec<usize> = ticks.iter().map(|d| d.index).collect();
        let progress: Vec<u8> = ticks.iter().map(|d| d.progress).collect();

        assert_eq!(indices, vec![0, 1, 2, 3, 0]);
        assert_eq!(progress, vec![0, 25, 50, 75, 0]);
    }

    #[test]
    fn test_jump_forces_next_delivery() {
        let queue = queue_with(200, PlaybackState::Running);
        queue.tick();
        queue.jump(2);
        assert_eq!(queue.tick().unwrap().index, 121);
    }

    #[test]
    fn test_reload_same_source_keeps_cursor() {
        let queue = queue_with(10, PlaybackState::Running);
        for _ in 0..4 {
            queue.tick();
        }

        assert!(!queue.load("track.gpx", track(10)));
        assert_eq!(queue.cursor(), 4);
        assert_eq!(queue.len(), 10);

        // same source, shorter track: cursor clamps
        assert!(!queue.load("track.gpx", track(3)));
        assert_eq!(queue.cursor(), 2);

        assert!(queue.load("other.gpx", track(5)));
        assert_eq!(queue.cursor(), 0);
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.source_id().as_deref(), Some("other.gpx"));
    }

    #[test]
    fn test_clear_forgets_source() {
        let queue = queue_with(10, PlaybackState::Running);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.source_id(), None);
        assert!(queue.load("track.gpx", track(2)));
    }

    #[test]
    fn test_concurrent_jump_and_tick_stay_in_range() {
        let queue = std::sync::Arc::new(queue_with(37, PlaybackState::Running));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        if (i + t) % 3 == 0 {
                            queue.jump(if t % 2 == 0 { 1 } else { -1 });
                        } else {
                            let d = queue.tick().unwrap();
                            assert!(d.index < 37);
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert!(queue.cursor() < 37);
    }

    #[tokio::test(start_paused = true)]
    async fn test_real_time_follows_recorded_gaps() {
        let queue = ReplayQueue::new(60, ProgressStyle::OneBased);
        queue.load("t", timed(&[0, 2, 3]));
        queue.set_state(PlaybackState::Running);
        queue.begin_real_time(1.0);
        let start = Instant::now();

        assert!(matches!(queue.next_due(), NextDue::Due(d) if d.index == 0));
        assert_eq!(queue.next_due(), NextDue::Wait(start + Duration::from_secs(2)));

        tokio::time::advance(Duration::from_millis(1995)).await;
        assert!(matches!(queue.next_due(), NextDue::Due(d) if d.index == 1));
        assert_eq!(queue.next_due(), NextDue::Wait(start + Duration::from_secs(3)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(queue.next_due(), NextDue::Due(d) if d.index == 2));

        // schedule drained: loops back to the first point, due immediately
        assert!(matches!(queue.next_due(), NextDue::Due(d) if d.index == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_real_time_speed_and_untimed_points() {
        let mut points = timed(&[0, 4, 8]);
        points[1].timestamp = None;

        let queue = ReplayQueue::new(60, ProgressStyle::OneBased);
        queue.load("t", points);
        queue.set_state(PlaybackState::Running);
        queue.begin_real_time(2.0);
        let start = Instant::now();

        assert!(matches!(queue.next_due(), NextDue::Due(d) if d.index == 0));
        // untimed point is due with its predecessor
        assert!(matches!(queue.next_due(), NextDue::Due(d) if d.index == 1));
        assert_eq!(queue.next_due(), NextDue::Wait(start + Duration::from_secs(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_real_time_jump_reschedules() {
        let seconds: Vec<i64> = (0..180).collect();
        let queue = ReplayQueue::new(60, ProgressStyle::OneBased);
        queue.load("t", timed(&seconds));
        queue.set_state(PlaybackState::Running);
        queue.begin_real_time(1.0);

        assert!(matches!(queue.next_due(), NextDue::Due(d) if d.index == 0));
        queue.jump(1);
        assert_eq!(queue.cursor(), 61);
        assert!(matches!(queue.next_due(), NextDue::Due(d) if d.index == 61));

        queue.reset();
        assert_eq!(queue.next_due(), NextDue::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_real_time_reanchors_when_date_appears() {
        let day = Utc.with_ymd_and_hms(2020, 1, 1, 12, 0, 1).unwrap();
        let queue = ReplayQueue::new(60, ProgressStyle::OneBased);
        queue.load(
            "t.nmea",
            vec![
                point_at(time_of_day(12, 0, 0)),
                point_at(Timestamp::Absolute(day)),
                point_at(Timestamp::Absolute(day + chrono::Duration::seconds(2))),
            ],
        );
        queue.set_state(PlaybackState::Running);
        queue.begin_real_time(1.0);
        let start = Instant::now();

        assert!(matches!(queue.next_due(), NextDue::Due(d) if d.index == 0));
        // first dated point starts a new anchor instead of waiting decades
        assert!(matches!(queue.next_due(), NextDue::Due(d) if d.index == 1));
        assert_eq!(queue.next_due(), NextDue::Wait(start + Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_real_time_time_of_day_crosses_midnight() {
        let queue = ReplayQueue::new(60, ProgressStyle::OneBased);
        queue.load(
            "t.nmea",
            vec![
                point_at(time_of_day(23, 59, 58)),
                point_at(time_of_day(23, 59, 59)),
                point_at(time_of_day(0, 0, 0)),
                point_at(time_of_day(0, 0, 10)),
                point_at(time_of_day(0, 0, 20)),
            ],
        );
        queue.set_state(PlaybackState::Running);
        queue.begin_real_time(1.0);
        let start = Instant::now();

        assert!(matches!(queue.next_due(), NextDue::Due(d) if d.index == 0));
        assert_eq!(queue.next_due(), NextDue::Wait(start + Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(queue.next_due(), NextDue::Due(d) if d.index == 1));
        assert_eq!(queue.next_due(), NextDue::Wait(start + Duration::from_secs(2)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(queue.next_due(), NextDue::Due(d) if d.index == 2));
        assert_eq!(queue.next_due(), NextDue::Wait(start + Duration::from_secs(12)));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(queue.next_due(), NextDue::Due(d) if d.index == 3));
        assert_eq!(queue.next_due(), NextDue::Wait(start + Duration::from_secs(22)));
    }
}
