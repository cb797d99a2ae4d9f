use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result type for sink operations
pub type SinkResult<T> = Result<T, SinkError>;

/// Failures reported by a location sink
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SinkError {
    /// Mock locations are not permitted for this process
    #[error("mock location permission denied: {0}")]
    PermissionDenied(String),
    /// No provider with the given name exists
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
    /// The sink refused the call for another reason
    #[error("sink rejected the call: {0}")]
    Rejected(String),
    /// The call did not complete within the configured bound
    #[error("sink call timed out after {0:?}")]
    Timeout(Duration),
}

/// Power class a provider advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerRequirement {
    Low,
    Medium,
    High,
}

/// Accuracy class a provider advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccuracyClass {
    Fine,
    Coarse,
}

/// Description of the test provider registered with the sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    pub requires_network: bool,
    pub requires_satellite: bool,
    pub requires_cell: bool,
    pub has_monetary_cost: bool,
    pub supports_altitude: bool,
    pub supports_speed: bool,
    pub supports_bearing: bool,
    pub power: PowerRequirement,
    pub accuracy: AccuracyClass,
}

impl ProviderSpec {
    /// Capabilities of a GPS-like test provider with the given name
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            requires_network: true,
            requires_satellite: false,
            requires_cell: true,
            has_monetary_cost: false,
            supports_altitude: false,
            supports_speed: false,
            supports_bearing: false,
            power: PowerRequirement::Medium,
            accuracy: AccuracyClass::Fine,
        }
    }
}

/// One simulated position fix handed to the sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Degrees clockwise from north
    pub bearing: f32,
    /// m/s
    pub speed: f32,
    /// Meters, when the source recorded it
    pub altitude: Option<f64>,
    /// Wall-clock time of delivery
    pub time: DateTime<Utc>,
    /// Horizontal accuracy radius in meters
    pub accuracy: f32,
}

/// Capability that injects simulated fixes into the consuming system
///
/// Implementations:
/// - `StdoutSink`: prints fixes as JSON lines
/// - `RecordingSink`: keeps fixes in memory for inspection
///
/// Only the playback clock calls `set_location`, one call at a time.
#[async_trait]
pub trait LocationSink: Send + Sync {
    /// Name of this sink, for logs
    fn name(&self) -> &str;

    /// Register a test provider
    async fn add_provider(&self, spec: &ProviderSpec) -> SinkResult<()>;

    /// Remove a previously registered test provider
    async fn remove_provider(&self, name: &str) -> SinkResult<()>;

    /// Publish a fix through the named provider
    async fn set_location(&self, provider: &str, fix: &LocationFix) -> SinkResult<()>;
}
