pub mod gpx;
pub mod nmea;

pub use gpx::GpxParser;
pub use nmea::NmeaParser;

use anyhow::{Context, Result};
use crate::core::TrackPoint;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor};
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Errors that abort a whole load
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("I/O error while reading track: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed XML at byte {position}: {source}")]
    Xml {
        position: u64,
        #[source]
        source: quick_xml::Error,
    },
    #[error("operation not supported for this source: {0}")]
    Unsupported(&'static str),
}

/// Receives the events produced while a source is parsed
pub trait PointListener {
    fn on_start(&mut self) {}

    fn on_point(&mut self, point: TrackPoint);

    /// Parsing reached the end of the stream with `count` accepted points
    fn on_end(&mut self, _count: usize) {}

    /// Structural failure; no further events follow
    fn on_error(&mut self, _message: &str) {}
}

/// A parser that turns a byte stream into track points
///
/// Implementations must be restartable on a fresh stream. Per-point errors
/// are logged and skipped; only structural failures are returned (after
/// `on_error` has been reported to the listener).
pub trait PointSource: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Parse a stream, returning the number of accepted points.
    ///
    /// The cancel token is checked between points; cancellation ends the
    /// parse early with `Ok`.
    fn parse(
        &self,
        reader: &mut dyn BufRead,
        listener: &mut dyn PointListener,
        cancel: &CancellationToken,
    ) -> Result<usize, SourceError>;

    /// Parse an in-memory document
    fn parse_str(&self, text: &str, listener: &mut dyn PointListener) -> Result<usize, SourceError> {
        let mut cursor = Cursor::new(text.as_bytes());
        self.parse(&mut cursor, listener, &CancellationToken::new())
    }
}

/// Input format of a track file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Gpx,
    Nmea,
}

impl InputFormat {
    /// Pick a format from the file name: `.nmea` is NMEA, `.gpx` is GPX
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "nmea" => Some(InputFormat::Nmea),
            "gpx" | "xml" => Some(InputFormat::Gpx),
            _ => None,
        }
    }

    /// Guess the format from the first bytes of the stream
    pub fn sniff(data: &[u8]) -> Option<Self> {
        let first = data
            .iter()
            .copied()
            .find(|b| !b.is_ascii_whitespace() && *b != 0xEF && *b != 0xBB && *b != 0xBF)?;

        match first {
            b'$' | b'!' => Some(InputFormat::Nmea),
            b'<' => Some(InputFormat::Gpx),
            _ => None,
        }
    }

    /// Resolve the format for a stream: extension first, then content, then GPX
    pub fn detect(path: Option<&Path>, reader: &mut dyn BufRead) -> Self {
        if let Some(format) = path.and_then(Self::from_path) {
            return format;
        }

        match reader.fill_buf() {
            Ok(head) => Self::sniff(head).unwrap_or(InputFormat::Gpx),
            Err(_) => InputFormat::Gpx,
        }
    }
}

/// Parser for a given format
pub fn source_for(format: InputFormat) -> Box<dyn PointSource> {
    match format {
        InputFormat::Gpx => Box::new(GpxParser::new()),
        InputFormat::Nmea => Box::new(NmeaParser::new()),
    }
}

/// Listener that keeps every point, used by whole-file loads
#[derive(Debug, Default)]
pub struct CollectingListener {
    pub points: Vec<TrackPoint>,
    pub error: Option<String>,
}

impl PointListener for CollectingListener {
    fn on_point(&mut self, point: TrackPoint) {
        self.points.push(point);
    }

    fn on_error(&mut self, message: &str) {
        self.error = Some(message.to_string());
    }
}

/// Load every point of a track file, auto-detecting the format
pub fn load_file(path: &Path) -> Result<Vec<TrackPoint>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open track file: {:?}", path))?;
    let mut reader = BufReader::new(file);

    let format = InputFormat::detect(Some(path), &mut reader);
    let mut listener = CollectingListener::default();

    source_for(format)
        .parse(&mut reader, &mut listener, &CancellationToken::new())
        .with_context(|| format!("Failed to parse {:?} as {:?}", path, format))?;

    Ok(listener.points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_format_from_path() {
        assert_eq!(InputFormat::from_path(Path::new("a/b/track.NMEA")), Some(InputFormat::Nmea));
        assert_eq!(InputFormat::from_path(Path::new("track.gpx")), Some(InputFormat::Gpx));
        assert_eq!(InputFormat::from_path(Path::new("track.log")), None);
        assert_eq!(InputFormat::from_path(Path::new("track")), None);
    }

    #[test]
    fn test_sniff() {
        assert_eq!(InputFormat::sniff(b"  $GPRMC,1"), Some(InputFormat::Nmea));
        assert_eq!(InputFormat::sniff(b"\xEF\xBB\xBF<?xml"), Some(InputFormat::Gpx));
        assert_eq!(InputFormat::sniff(b"lat,lon"), None);
        assert_eq!(InputFormat::sniff(b""), None);
    }

    #[test]
    fn test_detect_falls_back_to_content_then_gpx() {
        let mut nmea = Cursor::new(b"$GPRMC,123519,A".to_vec());
        assert_eq!(InputFormat::detect(Some(Path::new("x.txt")), &mut nmea), InputFormat::Nmea);

        let mut other = Cursor::new(b"hello".to_vec());
        assert_eq!(InputFormat::detect(None, &mut other), InputFormat::Gpx);
    }

    #[test]
    fn test_load_file_detects_nmea() {
        let mut file = tempfile::Builder::new().suffix(".nmea").tempfile().unwrap();
        writeln!(file, "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A").unwrap();
        writeln!(file, "$GPRMC,123520,A,4807.040,N,01131.002,E,022.4,084.4,230394,003.1,W").unwrap();

        let points = load_file(file.path()).unwrap();
        assert_eq!(points.len(), 2);
        assert!((points[0].latitude - 48.1173).abs() < 1e-4);
    }

    #[test]
    fn test_load_file_missing() {
        assert!(load_file(Path::new("/definitely/not/here.gpx")).is_err());
    }
}
