pub mod location_sink;
pub mod mock;
pub mod stdout;

pub use location_sink::{LocationFix, LocationSink, ProviderSpec, SinkError, SinkResult};
pub use mock::RecordingSink;
pub use stdout::StdoutSink;
