use crate::config::ReplaySettings;
use crate::playback::events::{PlaybackEvent, PlaybackListener};
use crate::playback::queue::{Delivery, NextDue, ReplayQueue};
use crate::sink::{LocationFix, LocationSink, SinkError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Writes deliveries to the sink and reports progress
///
/// Owned by exactly one clock task, so sink writes never overlap.
pub struct Deliverer {
    pub sink: Arc<dyn LocationSink>,
    pub listener: Arc<dyn PlaybackListener>,
    pub provider: String,
    pub timeout: Duration,
    pub accuracy: f32,
}

impl Deliverer {
    pub fn new(
        sink: Arc<dyn LocationSink>,
        listener: Arc<dyn PlaybackListener>,
        settings: &ReplaySettings,
    ) -> Self {
        Self {
            sink,
            listener,
            provider: settings.provider_name.clone(),
            timeout: settings.sink_timeout(),
            accuracy: settings.accuracy_m,
        }
    }

    /// Publish one point. Sink failures are logged and swallowed.
    pub async fn deliver(&self, delivery: Delivery) {
        let point = &delivery.point;
        let fix = LocationFix {
            latitude: point.latitude,
            longitude: point.longitude,
            bearing: point.course.unwrap_or(0.0) as f32,
            speed: point.speed.unwrap_or(0.0) as f32,
            altitude: point.elevation,
            time: Utc::now(),
            accuracy: self.accuracy,
        };

        trace!("{}: #{} {}, {}", self.provider, delivery.index, fix.latitude, fix.longitude);

        let result = match tokio::time::timeout(self.timeout, self.sink.set_location(&self.provider, &fix)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout(self.timeout)),
        };
        if let Err(e) = result {
            warn!("Sink '{}' dropped fix #{}: {}", self.sink.name(), delivery.index, e);
        }

        self.listener.on_event(PlaybackEvent::Progress { percent: delivery.progress });
    }
}

/// Deliver one point per `period` until cancelled.
///
/// The first tick fires one period after start. Ticks on an empty buffer
/// (nothing loaded yet) do nothing.
pub async fn run_fixed_rate(
    queue: Arc<ReplayQueue>,
    deliverer: Deliverer,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("Fixed-rate clock started ({:?})", period);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Some(delivery) = queue.tick() {
            deliverer.deliver(delivery).await;
        }
    }

    debug!("Fixed-rate clock stopped");
}

/// Deliver points at their recorded pace until cancelled.
///
/// Sleeps until the head of the schedule is due and re-checks after every
/// wake, since a jump or reload may have replaced the schedule meanwhile.
pub async fn run_real_time(
    queue: Arc<ReplayQueue>,
    deliverer: Deliverer,
    speed: f64,
    cancel: CancellationToken,
) {
    queue.begin_real_time(speed);
    debug!("Real-time clock started (x{})", speed);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match queue.next_due() {
            NextDue::Due(delivery) => deliverer.deliver(delivery).await,
            NextDue::Wait(until) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = queue.changed() => {}
                    _ = tokio::time::sleep_until(until) => {}
                }
            }
            NextDue::Idle => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = queue.changed() => {}
                }
            }
        }
    }

    debug!("Real-time clock stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProgressStyle;
    use crate::core::{Timestamp, TrackPoint};
    use crate::playback::PlaybackState;
    use crate::sink::{ProviderSpec, RecordingSink};
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    async fn setup(points: Vec<TrackPoint>) -> (Arc<ReplayQueue>, Arc<RecordingSink>, mpsc::UnboundedReceiver<PlaybackEvent>, Deliverer) {
        let queue = Arc::new(ReplayQueue::new(60, ProgressStyle::ZeroBased));
        queue.load("t", points);
        queue.set_state(PlaybackState::Running);

        let sink = Arc::new(RecordingSink::new("rec"));
        sink.add_provider(&ProviderSpec::new("gps")).await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let deliverer = Deliverer {
            sink: sink.clone(),
            listener: Arc::new(tx),
            provider: "gps".into(),
            timeout: Duration::from_millis(100),
            accuracy: 5.0,
        };
        (queue, sink, rx, deliverer)
    }

    fn track(len: usize) -> Vec<TrackPoint> {
        (0..len).map(|i| TrackPoint::new(i as f64, 0.0).unwrap()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_rate_delivers_once_per_period() {
        let (queue, sink, mut rx, deliverer) = setup(track(4)).await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_fixed_rate(queue.clone(), deliverer, Duration::from_secs(1), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        cancel.cancel();
        handle.await.unwrap();

        let lats: Vec<f64> = sink.take_fixes().iter().map(|f| f.latitude).collect();
        assert_eq!(lats, vec![0.0, 1.0, 2.0]);
        assert_eq!(rx.recv().await, Some(PlaybackEvent::Progress { percent: 0 }));
        assert_eq!(rx.recv().await, Some(PlaybackEvent::Progress { percent: 25 }));

        // no further ticks after cancellation
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.fix_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failures_do_not_stop_the_clock() {
        let (queue, sink, _rx, deliverer) = setup(track(10)).await;
        sink.fail_next(2);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_fixed_rate(queue.clone(), deliverer, Duration::from_secs(1), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(4500)).await;
        cancel.cancel();
        handle.await.unwrap();

        // the two failed ticks still advanced the cursor
        let lats: Vec<f64> = sink.take_fixes().iter().map(|f| f.latitude).collect();
        assert_eq!(lats, vec![2.0, 3.0]);
        assert_eq!(queue.cursor(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sink_is_bounded() {
        let (queue, sink, _rx, deliverer) = setup(track(10)).await;
        sink.set_delay(Some(Duration::from_secs(30)));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_fixed_rate(queue.clone(), deliverer, Duration::from_secs(1), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(sink.fix_count(), 0);
        assert!(queue.cursor() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_real_time_clock_and_jump() {
        let base = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let points: Vec<TrackPoint> = (0..200)
            .map(|i| {
                let mut p = TrackPoint::new(0.0, i as f64 * 0.5).unwrap();
                p.timestamp = Some(Timestamp::Absolute(base + chrono::Duration::seconds(i * 10)));
                p
            })
            .collect();
        let (queue, sink, _rx, deliverer) = setup(points).await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_real_time(queue.clone(), deliverer, 1.0, cancel.clone()));

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(sink.fix_count(), 2);

        queue.jump(1);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let fixes = sink.take_fixes();
        assert_eq!(fixes.len(), 3);
        assert_eq!(fixes[2].longitude, 62.0 * 0.5);

        cancel.cancel();
        handle.await.unwrap();
    }
}
