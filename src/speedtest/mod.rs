//! Speedtest: admission-controlled bandwidth and latency measurement.
//!
//! Both roles run entirely on the [`Reactor`](crate::reactor::Reactor):
//!
//! - [`SpeedtestServer`] keeps the admission queue ([`SessionTracker`]) and
//!   serves the measurement endpoints.
//! - [`SpeedtestClient`] walks the phases of a run and calibrates payload
//!   sizes before measuring throughput ([`Calibration`]).
//!
//! Roles talk through already-parsed [`Request`] and [`Response`] values; the
//! HTTP transport is a collaborator plugged in through [`ServerStream`] and
//! [`ClientConnection`].
//!
//! ## Negotiation
//!
//! ```text
//! Client                                   Server
//!   |--- GET negotiate ------------------->|  queue, first answer immediate
//!   |<-- {authorization, unchoked, ...} ---|
//!   |                                      |
//!   |   (choked: wait for RENEGOTIATE)     |
//!   |--- GET negotiate + authorization --->|  held until the queue moves
//!   |<-- {unchoked: "true"} ---------------|
//!   |                                      |
//!   |=== latency / download / upload =====>|
//!   |--- POST collect -------------------->|  leaves the queue
//! ```

pub mod calibrate;
pub mod client;
pub mod message;
pub mod phase;
pub mod server;
pub mod store;
pub mod tracker;

pub use calibrate::{Calibration, Direction, Transfer};
pub use client::{ClientConnection, SpeedtestClient, SpeedtestResults};
pub use message::{CollectPayload, Method, NegotiateResponse, Request, Response};
pub use phase::{Phase, PhaseSet, RunState};
pub use server::{NegotiationHandler, RequestHandler, ServerStream, SpeedtestServer, Tester};
pub use store::{MemoryStore, ResultStore};
pub use tracker::{ConnectionId, Session, SessionTracker};

/// Human readable throughput for a byte rate per time unit.
pub fn format_speed(bytes_per_unit: f64) -> String {
    let bits = bytes_per_unit * 8.0;
    if bits >= 1e9 {
        format!("{:.1} Gbit/s", bits / 1e9)
    } else if bits >= 1e6 {
        format!("{:.1} Mbit/s", bits / 1e6)
    } else if bits >= 1e3 {
        format!("{:.1} kbit/s", bits / 1e3)
    } else {
        format!("{bits:.0} bit/s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(0.0), "0 bit/s");
        assert_eq!(format_speed(125_000.0), "1.0 Mbit/s");
        assert_eq!(format_speed(1_250.0), "10.0 kbit/s");
        assert_eq!(format_speed(250_000_000.0), "2.0 Gbit/s");
    }
}
