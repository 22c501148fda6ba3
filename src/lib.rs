//! # netprobe - Admission-Controlled Network Measurement
//!
//! Bandwidth and latency probes run against a server that admits only a few
//! measuring clients at a time, so concurrent tests never overload it. All
//! socket and timer activity is driven by a single-threaded reactor.
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────────────── Reactor ────────────────────────┐
//!            │  timers (TaskHandle)   interest tables   notification bus│
//!            └────┬───────────────────────┬───────────────────┬────────┘
//!                 │ callbacks             │ readiness         │ RENEGOTIATE
//!                 v                       v                   v
//!      SpeedtestServer ── SessionTracker          SpeedtestClient ── Calibration
//!        (admission, Tester)                        (phases)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use netprobe::{Config, Reactor, SpeedtestServer};
//!
//! netprobe::logging::init(false);
//! let config = Config::from_env();
//! let mut reactor = Reactor::new(&config.reactor);
//! let server = SpeedtestServer::start(&mut reactor, config.server, None);
//! // register transport handles, then:
//! reactor.run_forever()?;
//! ```
//!
//! ## Modules
//!
//! - [`reactor`]: Event loop, task scheduler and notification bus
//! - [`speedtest`]: Admission control, phase controller and calibration
//! - [`config`]: Configuration management
//! - [`logging`]: Subscriber setup
//! - [`error`]: Error types and result aliases

pub mod config;
pub mod error;
pub mod logging;
pub mod reactor;
pub mod speedtest;

// Re-exports for convenience
pub use config::Config;
pub use error::{ProbeError, Result};
pub use reactor::{Pollable, Reactor, TaskHandle, RENEGOTIATE};
pub use speedtest::{
    Calibration, ClientConnection, MemoryStore, PhaseSet, ResultStore, ServerStream,
    SessionTracker, SpeedtestClient, SpeedtestResults, SpeedtestServer,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
