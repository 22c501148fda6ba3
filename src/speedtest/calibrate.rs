//! Adaptive calibration and parallel transfer measurement.
//!
//! A transfer runs in two steps. First a single connection repeats one
//! request while the payload length grows with the observed speed:
//!
//! ```text
//! length' = max(floor(length / elapsed), length)
//! ```
//!
//! Calibration stops after three rounds, when a round takes one time unit or
//! more, when a round takes no measurable time, or when `length'` reaches the
//! direction's maximum. The final length is overshot by 7/4 and clamped.
//!
//! Then every connection issues one request of the calibrated length at the
//! same time, and throughput is the total byte count over the span of the
//! whole batch.

use std::time::Duration;

use bytes::Bytes;

use super::message::{Method, Request, Response, OCTET_MIMETYPE};
use super::phase::PhaseStep;
use crate::error::{ProbeError, Result};
use crate::reactor::units;

/// Calibration rounds before giving up on growing the payload.
pub const CALIBRATION_ROUNDS: u32 = 3;

/// Smallest download payload
pub const MIN_DOWNLOAD: u64 = 1 << 16;
/// Largest download payload
pub const MAX_DOWNLOAD: u64 = 1 << 26;
/// Smallest upload payload
pub const MIN_UPLOAD: u64 = 1 << 15;
/// Largest upload payload
pub const MAX_UPLOAD: u64 = 1 << 20;

/// Below this calibrated length uploads use half the connections.
const UPLOAD_HALVING_THRESHOLD: u64 = 1 << 19;

static ZEROS: [u8; MAX_UPLOAD as usize] = [0; MAX_UPLOAD as usize];

/// Payload size feedback loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    length: u64,
    max: u64,
    rounds_remaining: u32,
    last_elapsed: Option<f64>,
}

impl Calibration {
    /// Start at `min`, never exceeding `max`.
    pub fn new(min: u64, max: u64) -> Self {
        Self {
            length: min.min(max),
            max,
            rounds_remaining: CALIBRATION_ROUNDS,
            last_elapsed: None,
        }
    }

    /// Current payload length
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Whether another calibration round is needed
    pub fn is_calibrating(&self) -> bool {
        self.rounds_remaining > 0
    }

    /// Duration of the last round, in time units
    pub fn last_elapsed(&self) -> Option<f64> {
        self.last_elapsed
    }

    /// Feed the duration of one round; returns whether calibration goes on.
    pub fn record(&mut self, elapsed: f64) -> bool {
        if !self.is_calibrating() {
            return false;
        }
        self.last_elapsed = Some(elapsed);
        self.rounds_remaining -= 1;

        if elapsed <= 0.0 {
            // Too fast to measure, keep the length we have.
            self.rounds_remaining = 0;
        } else {
            let grown = (self.length as f64 / elapsed).floor() as u64;
            self.length = grown.max(self.length);
            if self.length >= self.max {
                self.length = self.max;
                self.rounds_remaining = 0;
            }
            if elapsed >= 1.0 {
                self.rounds_remaining = 0;
            }
        }

        if self.rounds_remaining == 0 {
            self.length = (self.length * 7 / 4).min(self.max);
            tracing::debug!("calibrated length {}", self.length);
            return false;
        }
        true
    }
}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Server to client
    Download,
    /// Client to server
    Upload,
}

impl Direction {
    /// Endpoint name, relative to the speedtest base URI
    pub fn endpoint(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Upload => "upload",
        }
    }

    /// Fresh calibration for this direction
    pub fn calibration(self) -> Calibration {
        match self {
            Self::Download => Calibration::new(MIN_DOWNLOAD, MAX_DOWNLOAD),
            Self::Upload => Calibration::new(MIN_UPLOAD, MAX_UPLOAD),
        }
    }

    /// Status codes accepted from the server
    pub fn accepted(self) -> &'static [u16] {
        match self {
            Self::Download => &[200, 206],
            Self::Upload => &[200],
        }
    }

    /// Connections used by the measurement step
    pub fn connections(self, length: u64, available: usize) -> usize {
        match self {
            Self::Upload if length < UPLOAD_HALVING_THRESHOLD => (available / 2).max(1),
            _ => available.max(1),
        }
    }

    /// Build one request moving `length` bytes.
    pub fn request(self, uri: &str, length: u64, token: Option<&str>) -> Request {
        let length = length.max(1);
        let request = match self {
            Self::Download => Request::new(Method::Get, uri).with_range(0, length - 1),
            Self::Upload => {
                let size = length.min(MAX_UPLOAD) as usize;
                Request::new(Method::Post, uri)
                    .with_body(OCTET_MIMETYPE, Bytes::from_static(&ZEROS[..size]))
            },
        };
        request.with_authorization(token)
    }

    /// Bytes moved by one exchange.
    fn transferred(self, request_length: u64, response: &Response) -> u64 {
        match self {
            Self::Download => response.body.len() as u64,
            Self::Upload => request_length,
        }
    }
}

#[derive(Debug)]
enum Stage {
    Idle,
    Calibrating {
        sent_at: Duration,
    },
    Measuring {
        begin: Duration,
        last: Duration,
        outstanding: Vec<bool>,
        total: u64,
    },
    Done,
}

/// Download or upload helper driven by the phase controller.
#[derive(Debug)]
pub struct Transfer {
    direction: Direction,
    uri: String,
    token: Option<String>,
    available: usize,
    calibration: Calibration,
    stage: Stage,
    speed: Option<f64>,
}

impl Transfer {
    /// Prepare a transfer against `uri` over `available` connections.
    pub fn new(direction: Direction, uri: String, token: Option<String>, available: usize) -> Self {
        Self {
            direction,
            uri,
            token,
            available,
            calibration: direction.calibration(),
            stage: Stage::Idle,
            speed: None,
        }
    }

    /// Transfer direction
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Calibration state
    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Whether the parallel step is running
    pub fn is_measuring(&self) -> bool {
        matches!(self.stage, Stage::Measuring { .. })
    }

    /// Bytes completed so far by the parallel step
    pub fn completed(&self) -> u64 {
        match &self.stage {
            Stage::Measuring { total, .. } => *total,
            _ => 0,
        }
    }

    /// Aggregate throughput, bytes per time unit, once done
    pub fn speed(&self) -> Option<f64> {
        self.speed
    }

    /// First requests to send.
    pub fn start(&mut self, now: Duration) -> PhaseStep {
        tracing::info!(
            "{}: calibrate with {} bytes",
            self.direction.endpoint(),
            self.calibration.length()
        );
        self.calibrate(now)
    }

    /// Account one response; tells the controller what to do next.
    pub fn on_response(
        &mut self,
        index: usize,
        response: &Response,
        now: Duration,
    ) -> Result<PhaseStep> {
        response.expect(self.direction.accepted())?;

        match &mut self.stage {
            Stage::Calibrating { sent_at } if index == 0 => {
                let elapsed = units(now.saturating_sub(*sent_at));
                if self.calibration.record(elapsed) {
                    Ok(self.calibrate(now))
                } else {
                    Ok(self.measure(now))
                }
            },
            Stage::Measuring {
                begin,
                last,
                outstanding,
                total,
            } => {
                let Some(slot) = outstanding.get_mut(index).filter(|s| **s) else {
                    return Err(ProbeError::Protocol(format!(
                        "unexpected {} response on connection {index}",
                        self.direction.endpoint()
                    )));
                };
                *slot = false;
                *total += self.direction.transferred(self.calibration.length(), response);
                *last = now;

                if outstanding.iter().any(|s| *s) {
                    return Ok(PhaseStep::Wait);
                }

                let span = units(last.saturating_sub(*begin));
                let speed = if span > 0.0 { *total as f64 / span } else { 0.0 };
                tracing::info!(
                    "{}: {} bytes in {:.3} units",
                    self.direction.endpoint(),
                    total,
                    span
                );
                self.speed = Some(speed);
                self.stage = Stage::Done;
                Ok(PhaseStep::Complete)
            },
            _ => Err(ProbeError::Protocol(format!(
                "unexpected {} response on connection {index}",
                self.direction.endpoint()
            ))),
        }
    }

    fn calibrate(&mut self, now: Duration) -> PhaseStep {
        self.stage = Stage::Calibrating { sent_at: now };
        let request = self.request();
        PhaseStep::Send(vec![(0, request)])
    }

    fn measure(&mut self, now: Duration) -> PhaseStep {
        let count = self
            .direction
            .connections(self.calibration.length(), self.available);
        tracing::info!(
            "{}: measure with {} bytes and {} connections",
            self.direction.endpoint(),
            self.calibration.length(),
            count
        );
        self.stage = Stage::Measuring {
            begin: now,
            last: now,
            outstanding: vec![true; count],
            total: 0,
        };
        PhaseStep::Send((0..count).map(|i| (i, self.request())).collect())
    }

    fn request(&self) -> Request {
        self.direction
            .request(&self.uri, self.calibration.length(), self.token.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn sent(step: PhaseStep) -> Vec<(usize, Request)> {
        match step {
            PhaseStep::Send(requests) => requests,
            other => panic!("expected requests, got {other:?}"),
        }
    }

    fn partial(len: usize) -> Response {
        Response::partial(format!("bytes 0-{}/{}", len - 1, MAX_DOWNLOAD))
            .with_body(OCTET_MIMETYPE, Bytes::from(vec![0u8; len]))
    }

    #[test]
    fn test_recurrence_from_minimum() {
        let mut cal = Calibration::new(MIN_DOWNLOAD, MAX_DOWNLOAD);
        assert!(cal.record(0.5));
        assert_eq!(cal.length(), 131_072);
        assert!(cal.record(0.4));
        assert_eq!(cal.length(), 327_680);
        assert!(!cal.record(0.8));
        // floor(327680 / 0.8) = 409600, then 7/4.
        assert_eq!(cal.length(), 716_800);
        assert!(!cal.is_calibrating());
    }

    #[test]
    fn test_slow_round_stops_early() {
        let mut cal = Calibration::new(MIN_DOWNLOAD, MAX_DOWNLOAD);
        assert!(cal.record(0.5));
        assert!(!cal.record(1.25));
        assert_eq!(cal.length(), 131_072 * 7 / 4);
        assert!(!cal.record(0.1));
        assert_eq!(cal.length(), 131_072 * 7 / 4);
    }

    #[test]
    fn test_zero_elapsed_freezes_length() {
        let mut cal = Calibration::new(MIN_DOWNLOAD, MAX_DOWNLOAD);
        assert!(!cal.record(0.0));
        assert_eq!(cal.length(), MIN_DOWNLOAD * 7 / 4);
        assert_eq!(cal.last_elapsed(), Some(0.0));
    }

    #[test]
    fn test_clamped_at_maximum() {
        let mut cal = Calibration::new(MIN_UPLOAD, MAX_UPLOAD);
        assert!(!cal.record(0.001));
        assert_eq!(cal.length(), MAX_UPLOAD);
    }

    #[test]
    fn test_upload_halves_connections_for_small_payloads() {
        assert_eq!(Direction::Upload.connections(1 << 18, 4), 2);
        assert_eq!(Direction::Upload.connections(1 << 19, 4), 4);
        assert_eq!(Direction::Upload.connections(1 << 18, 1), 1);
        assert_eq!(Direction::Download.connections(1 << 16, 4), 4);
    }

    #[test]
    fn test_requests_carry_length_and_token() {
        let get = Direction::Download.request("http://h/speedtest/download", 100, Some("tok"));
        assert_eq!(get.range.as_deref(), Some("bytes=0-99"));
        assert_eq!(get.token(), Some("tok"));

        let post = Direction::Upload.request("http://h/speedtest/upload", 4096, None);
        assert_eq!(post.method, Method::Post);
        assert_eq!(post.body.len(), 4096);
    }

    #[test]
    fn test_download_transfer_end_to_end() {
        let mut transfer = Transfer::new(Direction::Download, "u".into(), None, 4);
        let first = sent(transfer.start(ms(0)));
        assert_eq!(first.len(), 1);

        // Three rounds of 0.5 units: 65536 -> 131072 -> 262144 -> 524288.
        let mut now = ms(0);
        for _ in 0..2 {
            now += ms(500);
            let next = sent(transfer.on_response(0, &partial(10), now).unwrap());
            assert_eq!(next.len(), 1);
        }
        now += ms(500);
        let batch = sent(transfer.on_response(0, &partial(10), now).unwrap());
        assert_eq!(batch.len(), 4);
        assert_eq!(transfer.calibration().length(), 524_288 * 7 / 4);
        assert!(transfer.is_measuring());

        let len = 1000;
        for (i, _) in &batch[..3] {
            now += ms(100);
            let step = transfer.on_response(*i, &partial(len), now).unwrap();
            assert!(matches!(step, PhaseStep::Wait));
        }
        assert_eq!(transfer.completed(), 3000);

        now += ms(100);
        let step = transfer.on_response(3, &partial(len), now).unwrap();
        assert!(matches!(step, PhaseStep::Complete));
        // 4000 bytes over 0.4 units.
        let speed = transfer.speed().unwrap();
        assert!((speed - 10_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_bad_status_fails_transfer() {
        let mut transfer = Transfer::new(Direction::Download, "u".into(), None, 2);
        transfer.start(ms(0));
        let err = transfer
            .on_response(0, &Response::internal_error(), ms(10))
            .unwrap_err();
        assert!(matches!(err, ProbeError::BadResponse { code: 500, .. }));
    }

    #[test]
    fn test_upload_rejects_partial_content() {
        let mut transfer = Transfer::new(Direction::Upload, "u".into(), None, 2);
        transfer.start(ms(0));
        assert!(transfer.on_response(0, &partial(10), ms(10)).is_err());
    }

    #[test]
    fn test_duplicate_response_is_protocol_error() {
        let mut transfer = Transfer::new(Direction::Upload, "u".into(), None, 2);
        transfer.start(ms(0));
        // Zero elapsed ends calibration at once.
        let batch = sent(transfer.on_response(0, &Response::ok(), ms(0)).unwrap());
        assert_eq!(batch.len(), 1);
        assert!(matches!(
            transfer.on_response(0, &Response::ok(), ms(5)).unwrap(),
            PhaseStep::Complete
        ));
        assert!(transfer.on_response(0, &Response::ok(), ms(6)).is_err());
    }
}
