use crate::playback::PlaybackState;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

/// Notification emitted by the playback controller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlaybackEvent {
    LoadStarted { source: String },
    LoadFinished { points: usize },
    StatusChange { state: PlaybackState },
    Progress { percent: u8 },
    Error { message: String },
}

/// Receiver of playback notifications
///
/// Called from the clock and ingestion tasks; implementations must return
/// quickly and never block.
pub trait PlaybackListener: Send + Sync {
    fn on_event(&self, event: PlaybackEvent);
}

impl PlaybackListener for UnboundedSender<PlaybackEvent> {
    fn on_event(&self, event: PlaybackEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.send(event);
    }
}

/// Listener that writes every event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl PlaybackListener for TracingListener {
    fn on_event(&self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Error { message } => warn!("Playback error: {}", message),
            PlaybackEvent::Progress { percent } => tracing::debug!("Progress {}%", percent),
            other => info!("{:?}", other),
        }
    }
}
