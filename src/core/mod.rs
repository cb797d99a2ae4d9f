pub mod track_point;

pub use track_point::{Timestamp, TrackPoint};
