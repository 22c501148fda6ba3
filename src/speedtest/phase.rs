//! Client phases and their transitions.

use super::message::Request;
use crate::error::{ProbeError, Result};

/// One step of a speedtest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Queue admission
    Negotiate,
    /// Round-trip time
    Latency,
    /// Server to client throughput
    Download,
    /// Client to server throughput
    Upload,
    /// Results upload
    Collect,
}

impl Phase {
    /// Priority order in which pending phases run
    pub const ORDER: [Phase; 5] = [
        Phase::Negotiate,
        Phase::Latency,
        Phase::Download,
        Phase::Upload,
        Phase::Collect,
    ];

    const fn bit(self) -> u8 {
        match self {
            Self::Negotiate => 1 << 0,
            Self::Latency => 1 << 1,
            Self::Download => 1 << 2,
            Self::Upload => 1 << 3,
            Self::Collect => 1 << 4,
        }
    }

    /// Lowercase name, also the server endpoint
    pub fn name(self) -> &'static str {
        match self {
            Self::Negotiate => "negotiate",
            Self::Latency => "latency",
            Self::Download => "download",
            Self::Upload => "upload",
            Self::Collect => "collect",
        }
    }

    /// Outcomes of this phase.
    pub fn transition(self) -> Transition {
        let on_success = match self {
            Self::Negotiate => RunState::Running(Phase::Latency),
            Self::Latency => RunState::Running(Phase::Download),
            Self::Download => RunState::Running(Phase::Upload),
            Self::Upload => RunState::Running(Phase::Collect),
            Self::Collect => RunState::Succeeded,
        };
        Transition {
            phase: self,
            on_success,
            on_failure: RunState::Aborted,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Phase {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        Phase::ORDER
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ProbeError::Config(format!("unknown phase: {s}")))
    }
}

/// Row of the transition table.
///
/// `on_success` names the state after this phase in the full sequence;
/// phases missing from the pending set are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Phase this row describes
    pub phase: Phase,
    /// Successor in the full sequence
    pub on_success: RunState,
    /// State entered when the phase fails
    pub on_failure: RunState,
}

/// Set of phases still to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseSet(u8);

impl PhaseSet {
    /// Latency only
    pub const LATENCY: PhaseSet = PhaseSet(Phase::Latency.bit());
    /// Download only
    pub const DOWNLOAD: PhaseSet = PhaseSet(Phase::Download.bit());
    /// Upload only
    pub const UPLOAD: PhaseSet = PhaseSet(Phase::Upload.bit());
    /// The three measurements
    pub const ALL: PhaseSet =
        PhaseSet(Phase::Latency.bit() | Phase::Download.bit() | Phase::Upload.bit());

    /// Empty set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Add a phase
    pub fn insert(&mut self, phase: Phase) {
        self.0 |= phase.bit();
    }

    /// Remove a phase
    pub fn remove(&mut self, phase: Phase) {
        self.0 &= !phase.bit();
    }

    /// Whether `phase` is pending
    pub fn contains(self, phase: Phase) -> bool {
        self.0 & phase.bit() != 0
    }

    /// Pending phase with the highest priority
    pub fn current(self) -> Option<Phase> {
        Phase::ORDER.into_iter().find(|p| self.contains(*p))
    }

    /// Whether nothing is left
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Union of two sets
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Parse a comma separated list such as `latency,download`.
    pub fn parse(list: &str) -> Result<Self> {
        let mut set = Self::empty();
        for name in list.split(',').filter(|n| !n.trim().is_empty()) {
            set.insert(name.parse()?);
        }
        Ok(set)
    }
}

/// Where a run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Not started
    Idle,
    /// A phase is in progress
    Running(Phase),
    /// Choked, waiting for the queue to move
    Waiting,
    /// Every phase succeeded
    Succeeded,
    /// Cleanup after a failure
    Aborted,
}

impl RunState {
    /// Whether the run is over
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Aborted)
    }

    /// Phase in progress, if any
    pub fn phase(self) -> Option<Phase> {
        match self {
            Self::Running(phase) => Some(phase),
            _ => None,
        }
    }
}

/// What a phase helper asks the controller to do next.
#[derive(Debug)]
pub enum PhaseStep {
    /// Send these requests, by connection index
    Send(Vec<(usize, Request)>),
    /// Keep waiting for responses
    Wait,
    /// Wait for a queue notification before negotiating again
    Choked,
    /// The phase is over
    Complete,
}
