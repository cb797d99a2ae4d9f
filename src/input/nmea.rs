use crate::core::{Timestamp, TrackPoint};
use crate::input::{PointListener, PointSource, SourceError};
use chrono::{NaiveDate, NaiveTime};
use std::io::{BufRead, ErrorKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const KNOTS_TO_MPS: f64 = 0.514444;

/// NMEA 0183 sentence-stream parser
///
/// Only RMC sentences (any talker: `$GPRMC`, `$GNRMC`, ...) produce points;
/// every other sentence is ignored. Each RMC sentence becomes one point as
/// soon as its line is read.
#[derive(Debug, Default, Clone, Copy)]
pub struct NmeaParser;

impl NmeaParser {
    pub fn new() -> Self {
        Self
    }
}

impl PointSource for NmeaParser {
    fn name(&self) -> &'static str {
        "nmea"
    }

    fn parse(
        &self,
        reader: &mut dyn BufRead,
        listener: &mut dyn PointListener,
        cancel: &CancellationToken,
    ) -> Result<usize, SourceError> {
        let mut line = Vec::new();
        let mut line_no = 0usize;
        let mut accepted = 0usize;

        info!("NMEA reading started");
        listener.on_start();

        loop {
            if cancel.is_cancelled() {
                debug!("NMEA reading cancelled at line {}", line_no);
                break;
            }

            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => line_no += 1,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("NMEA reading failed at line {}: {}", line_no + 1, e);
                    listener.on_error(&e.to_string());
                    return Err(SourceError::Io(e));
                }
            }

            let Ok(text) = std::str::from_utf8(&line) else {
                warn!("Skipping NMEA line {}: not valid UTF-8", line_no);
                continue;
            };
            let text = text.trim();
            if text.is_empty() {
                continue;
            }

            match parse_rmc(text) {
                Ok(Some(point)) => {
                    listener.on_point(point);
                    accepted += 1;
                }
                Ok(None) => {}
                Err(reason) => warn!("Skipping NMEA line {}: {}", line_no, reason),
            }
        }

        info!("NMEA reading stopped: {} points from {} lines", accepted, line_no);
        listener.on_end(accepted);
        Ok(accepted)
    }

    fn parse_str(&self, _text: &str, _listener: &mut dyn PointListener) -> Result<usize, SourceError> {
        Err(SourceError::Unsupported("NMEA input must be read from a stream"))
    }
}

/// Parse one sentence. `Ok(None)` means a well-formed non-RMC sentence.
fn parse_rmc(sentence: &str) -> Result<Option<TrackPoint>, String> {
    let body = sentence
        .strip_prefix('$')
        .ok_or_else(|| "missing '$' start delimiter".to_string())?;

    let data = match body.split_once('*') {
        Some((data, checksum)) => {
            verify_checksum(data, checksum)?;
            data
        }
        None => body,
    };

    let fields: Vec<&str> = data.split(',').collect();
    if fields[0].len() != 5 || !fields[0].ends_with("RMC") {
        return Ok(None);
    }
    if fields.len() < 10 {
        return Err(format!("RMC sentence has {} fields, expected at least 10", fields.len()));
    }

    if fields[2] != "A" {
        debug!("RMC sentence without valid fix (status '{}')", fields[2]);
    }

    let lat = parse_coordinate(fields[3], fields[4])
        .ok_or_else(|| format!("unparsable latitude '{},{}'", fields[3], fields[4]))?;
    let lon = parse_coordinate(fields[5], fields[6])
        .ok_or_else(|| format!("unparsable longitude '{},{}'", fields[5], fields[6]))?;

    let mut point = TrackPoint::new(lat, lon)
        .ok_or_else(|| format!("coordinates out of range ({}, {})", lat, lon))?;

    point.speed = fields[7].parse::<f64>().ok().map(|knots| knots * KNOTS_TO_MPS);
    point.course = fields[8].parse::<f64>().ok();
    point.timestamp = match (parse_time(fields[1]), parse_date(fields[9])) {
        (Some(time), Some(date)) => Some(Timestamp::Absolute(date.and_time(time).and_utc())),
        (Some(time), None) => Some(Timestamp::TimeOfDay(time)),
        _ => None,
    };

    Ok(Some(point))
}

/// XOR of every byte between `$` and `*` must match the two hex digits
fn verify_checksum(data: &str, checksum: &str) -> Result<(), String> {
    let expected = u8::from_str_radix(checksum.trim(), 16)
        .map_err(|_| format!("malformed checksum '{}'", checksum))?;
    let actual = data.bytes().fold(0u8, |acc, b| acc ^ b);

    if actual != expected {
        return Err(format!("checksum mismatch: expected {:02X}, computed {:02X}", expected, actual));
    }
    Ok(())
}

/// Parse an NMEA coordinate field (ddmm.mmmm / dddmm.mmmm) with its hemisphere
fn parse_coordinate(coord: &str, hemisphere: &str) -> Option<f64> {
    if coord.is_empty() {
        return None;
    }

    let value = coord.parse::<f64>().ok()?;
    let degrees = (value / 100.0).floor();
    let minutes = value - degrees * 100.0;
    let decimal = degrees + minutes / 60.0;

    match hemisphere {
        "N" | "E" => Some(decimal),
        "S" | "W" => Some(-decimal),
        _ => None,
    }
}

/// Parse an NMEA time field (hhmmss or hhmmss.sss)
fn parse_time(field: &str) -> Option<NaiveTime> {
    if field.len() < 6 || !field.is_ascii() {
        return None;
    }

    let hh = field[0..2].parse::<u32>().ok()?;
    let mm = field[2..4].parse::<u32>().ok()?;
    let ss = field[4..6].parse::<u32>().ok()?;
    let millis = match field[6..].strip_prefix('.') {
        Some(frac) if !frac.is_empty() => {
            let frac = format!("{:0<3}", &frac[..frac.len().min(3)]);
            frac.parse::<u32>().ok()?
        }
        _ => 0,
    };

    NaiveTime::from_hms_milli_opt(hh, mm, ss, millis)
}

/// Parse an NMEA date field (ddmmyy). Two-digit years below 80 are 20xx.
fn parse_date(field: &str) -> Option<NaiveDate> {
    if field.len() != 6 || !field.is_ascii() {
        return None;
    }

    let dd = field[0..2].parse::<u32>().ok()?;
    let mm = field[2..4].parse::<u32>().ok()?;
    let yy = field[4..6].parse::<i32>().ok()?;
    let year = if yy < 80 { 2000 + yy } else { 1900 + yy };

    NaiveDate::from_ymd_opt(year, mm, dd)
}
