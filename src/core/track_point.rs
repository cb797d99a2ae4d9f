use serde::{Deserialize, Serialize};
use chrono::{DateTime, NaiveTime, Timelike, Utc};

/// Time attached to a recorded sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Timestamp {
    /// Full UTC instant (GPX `<time>`, or RMC time + date)
    Absolute(DateTime<Utc>),
    /// Time of day only (RMC sentence without a usable date field)
    TimeOfDay(NaiveTime),
}

impl Timestamp {
    /// Milliseconds on this timestamp's own scale.
    ///
    /// Absolute values count from the Unix epoch, time-of-day values from
    /// midnight. Only differences between points of the same track are
    /// meaningful.
    pub fn as_millis(&self) -> i64 {
        match self {
            Timestamp::Absolute(t) => t.timestamp_millis(),
            Timestamp::TimeOfDay(t) => {
                t.num_seconds_from_midnight() as i64 * 1000 + (t.nanosecond() / 1_000_000) as i64
            }
        }
    }
}

/// A single recorded GPS sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    /// Latitude in degrees, [-90, 90]
    pub latitude: f64,

    /// Longitude in degrees, [-180, 180]
    pub longitude: f64,

    /// Elevation in meters
    pub elevation: Option<f64>,

    /// Course over ground in degrees
    pub course: Option<f64>,

    /// Ground speed in m/s
    pub speed: Option<f64>,

    pub timestamp: Option<Timestamp>,

    /// GPX fix tag ("2d", "3d", "dgps", ...)
    pub fix: Option<String>,

    /// Satellite count as recorded
    pub satellites: Option<String>,
}

impl TrackPoint {
    /// Create a point with coordinates only.
    ///
    /// Returns `None` when either coordinate is outside its valid range or
    /// not finite.
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        if !is_valid_latitude(latitude) || !is_valid_longitude(longitude) {
            return None;
        }

        Some(Self {
            latitude,
            longitude,
            elevation: None,
            course: None,
            speed: None,
            timestamp: None,
            fix: None,
            satellites: None,
        })
    }

    /// Timestamp in milliseconds, if the point carries one
    pub fn time_millis(&self) -> Option<i64> {
        self.timestamp.as_ref().map(Timestamp::as_millis)
    }
}

pub fn is_valid_latitude(lat: f64) -> bool {
    lat.is_finite() && (-90.0..=90.0).contains(&lat)
}

pub fn is_valid_longitude(lon: f64) -> bool {
    lon.is_finite() && (-180.0..=180.0).contains(&lon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_new_rejects_out_of_range() {
        assert!(TrackPoint::new(90.0, 180.0).is_some());
        assert!(TrackPoint::new(-90.0, -180.0).is_some());
        assert!(TrackPoint::new(90.1, 0.0).is_none());
        assert!(TrackPoint::new(0.0, -180.5).is_none());
        assert!(TrackPoint::new(f64::NAN, 0.0).is_none());
    }

    #[test]
    fn test_timestamp_millis() {
        let t = Utc.with_ymd_and_hms(2007, 8, 27, 15, 38, 52).unwrap();
        assert_eq!(Timestamp::Absolute(t).as_millis(), t.timestamp_millis());

        let tod = NaiveTime::from_hms_milli_opt(1, 0, 2, 500).unwrap();
        assert_eq!(Timestamp::TimeOfDay(tod).as_millis(), 3_602_500);
    }
}
