pub mod clock;
pub mod controller;
pub mod events;
pub mod queue;

pub use controller::PlaybackController;
pub use events::{PlaybackEvent, PlaybackListener, TracingListener};
pub use queue::{Delivery, NextDue, ReplayQueue};

use serde::{Deserialize, Serialize};

/// Playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackState {
    Stopped,
    Running,
}
