use crate::core::{Timestamp, TrackPoint};
use crate::input::{PointListener, PointSource, SourceError};
use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io::BufRead;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const TRACK_POINT: &[u8] = b"trkpt";
const TRACK_SEGMENT: &[u8] = b"trkseg";

/// Pull parser for GPX track points
///
/// Reads `<trkpt lat=".." lon="..">` elements and their `ele`, `time`,
/// `course`, `speed`, `fix` and `sat` children. Everything else in the
/// document (metadata, waypoints, routes, extensions) is skipped.
///
/// A point whose coordinates or numeric children fail to parse is dropped
/// and parsing continues with the next one. Malformed XML stops the parse.
#[derive(Debug, Default, Clone, Copy)]
pub struct GpxParser;

impl GpxParser {
    pub fn new() -> Self {
        Self
    }
}

impl PointSource for GpxParser {
    fn name(&self) -> &'static str {
        "gpx"
    }

    fn parse(
        &self,
        reader: &mut dyn BufRead,
        listener: &mut dyn PointListener,
        cancel: &CancellationToken,
    ) -> Result<usize, SourceError> {
        let mut xml = Reader::from_reader(reader);
        xml.config_mut().trim_text(true);

        let mut buf = Vec::new();
        let mut accepted = 0usize;
        let mut seen = 0usize;
        let started = Instant::now();

        info!("GPX parse started");
        listener.on_start();

        loop {
            if cancel.is_cancelled() {
                debug!("GPX parse cancelled after {} points", accepted);
                return Ok(accepted);
            }

            let event = match xml.read_event_into(&mut buf) {
                Ok(event) => event,
                Err(e) => return Err(structural(listener, xml.buffer_position() as u64, e)),
            };

            match event {
                Event::Start(e) if is_tag(e.local_name().as_ref(), TRACK_POINT) => {
                    seen += 1;
                    let draft = match PointDraft::from_attributes(&e) {
                        Ok(draft) => draft,
                        Err(err) => return Err(structural(listener, xml.buffer_position() as u64, err)),
                    };
                    let draft = match read_point_body(&mut xml, draft) {
                        Ok(draft) => draft,
                        Err(err) => return Err(structural(listener, xml.buffer_position() as u64, err)),
                    };
                    if emit(draft.finish(), seen, listener) {
                        accepted += 1;
                    }
                }
                Event::Empty(e) if is_tag(e.local_name().as_ref(), TRACK_POINT) => {
                    seen += 1;
                    let draft = match PointDraft::from_attributes(&e) {
                        Ok(draft) => draft,
                        Err(err) => return Err(structural(listener, xml.buffer_position() as u64, err)),
                    };
                    if emit(draft.finish(), seen, listener) {
                        accepted += 1;
                    }
                }
                Event::Eof => {
                    info!(
                        "GPX parse finished after {} ms: {} of {} track points accepted",
                        started.elapsed().as_millis(),
                        accepted,
                        seen
                    );
                    listener.on_end(accepted);
                    return Ok(accepted);
                }
                _ => {}
            }

            buf.clear();
        }
    }
}

/// Report a structural failure to the listener and turn it into a `SourceError`
fn structural(listener: &mut dyn PointListener, position: u64, err: quick_xml::Error) -> SourceError {
    error!("GPX parse aborted at byte {}: {}", position, err);
    listener.on_error(&err.to_string());

    match err {
        quick_xml::Error::Io(io) => SourceError::Io(std::io::Error::new(io.kind(), io.to_string())),
        other => SourceError::Xml { position, source: other },
    }
}

fn emit(outcome: Result<TrackPoint, String>, index: usize, listener: &mut dyn PointListener) -> bool {
    match outcome {
        Ok(point) => {
            listener.on_point(point);
            true
        }
        Err(reason) => {
            warn!("Discarding track point #{}: {}", index, reason);
            false
        }
    }
}

fn is_tag(name: &[u8], expected: &[u8]) -> bool {
    name.eq_ignore_ascii_case(expected)
}

/// Consume the children of an open `<trkpt>` up to its end tag
fn read_point_body<R: BufRead>(xml: &mut Reader<R>, mut draft: PointDraft) -> Result<PointDraft, quick_xml::Error> {
    let mut buf = Vec::new();
    // Most recently opened child tag; text is routed by it
    let mut tag: Option<String> = None;

    loop {
        match xml.read_event_into(&mut buf)? {
            Event::Start(e) => {
                tag = Some(String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase());
            }
            Event::End(e) => {
                let name = e.local_name();
                if is_tag(name.as_ref(), TRACK_POINT) || is_tag(name.as_ref(), TRACK_SEGMENT) {
                    break;
                }
                if tag.as_deref().is_some_and(|t| is_tag(name.as_ref(), t.as_bytes())) {
                    tag = None;
                }
            }
            Event::Text(text) => {
                if let Some(tag) = &tag {
                    let text = text.unescape()?;
                    draft.apply(tag, text.trim());
                }
            }
            Event::CData(data) => {
                if let Some(tag) = &tag {
                    let text = String::from_utf8_lossy(&data);
                    draft.apply(tag, text.trim());
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(draft)
}

/// A track point under construction
#[derive(Debug, Default)]
struct PointDraft {
    latitude: f64,
    longitude: f64,
    elevation: Option<f64>,
    course: Option<f64>,
    speed: Option<f64>,
    timestamp: Option<Timestamp>,
    fix: Option<String>,
    satellites: Option<String>,
    /// Set once something made the point unusable
    discard: Option<String>,
}

impl PointDraft {
    fn from_attributes(start: &BytesStart) -> Result<Self, quick_xml::Error> {
        let mut lat = None;
        let mut lon = None;

        for attr in start.attributes() {
            let attr = attr?;
            let key = attr.key.local_name();
            if key.as_ref().eq_ignore_ascii_case(b"lat") {
                lat = Some(attr.unescape_value()?.into_owned());
            } else if key.as_ref().eq_ignore_ascii_case(b"lon") {
                lon = Some(attr.unescape_value()?.into_owned());
            }
        }

        let mut draft = PointDraft::default();
        draft.latitude = draft.coordinate("lat", lat.as_deref());
        draft.longitude = draft.coordinate("lon", lon.as_deref());
        Ok(draft)
    }

    /// Missing attribute reads as 0.0; a malformed one discards the point
    fn coordinate(&mut self, name: &str, raw: Option<&str>) -> f64 {
        match raw {
            None => {
                warn!("trkpt has no '{}' attribute, using 0.0", name);
                0.0
            }
            Some(raw) => match raw.trim().parse::<f64>() {
                Ok(value) => value,
                Err(e) => {
                    self.reject(format!("unparsable {} '{}': {}", name, raw, e));
                    0.0
                }
            },
        }
    }

    fn apply(&mut self, tag: &str, text: &str) {
        if self.discard.is_some() || text.is_empty() {
            return;
        }

        match tag {
            "ele" => self.elevation = self.number(tag, text),
            "course" => self.course = self.number(tag, text),
            "speed" => self.speed = self.number(tag, text),
            "time" => {
                self.timestamp = parse_time(text).map(Timestamp::Absolute);
                if self.timestamp.is_none() {
                    warn!("Ignoring unparsable trkpt time '{}'", text);
                }
            }
            "fix" => self.fix = Some(text.to_string()),
            "sat" => self.satellites = Some(text.to_string()),
            _ => {}
        }
    }

    fn number(&mut self, tag: &str, text: &str) -> Option<f64> {
        match text.parse::<f64>() {
            Ok(value) => Some(value),
            Err(e) => {
                self.reject(format!("unparsable <{}> '{}': {}", tag, text, e));
                None
            }
        }
    }

    fn reject(&mut self, reason: String) {
        if self.discard.is_none() {
            self.discard = Some(reason);
        }
    }

    fn finish(self) -> Result<TrackPoint, String> {
        if let Some(reason) = self.discard {
            return Err(reason);
        }

        let mut point = TrackPoint::new(self.latitude, self.longitude).ok_or_else(|| {
            format!("coordinates out of range ({}, {})", self.latitude, self.longitude)
        })?;
        point.elevation = self.elevation;
        point.course = self.course;
        point.speed = self.speed;
        point.timestamp = self.timestamp;
        point.fix = self.fix;
        point.satellites = self.satellites;
        Ok(point)
    }
}

/// ISO-8601 time, with or without fractional seconds and zone designator
fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Some(t.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|t| t.and_utc())
}
