//! Speedtest client role: the phase controller.
//!
//! A run walks the pending phases in priority order:
//!
//! ```text
//! negotiate ──> latency ──> download ──> upload ──> collect ──> success
//!     │  ▲          │           │           │           │
//!     │  └─ queue   └───────────┴─── any failure ───────┴──> aborted
//!     ▼     moved
//!   choked
//! ```
//!
//! Each phase is driven by a helper that turns responses into a
//! [`PhaseStep`]. The controller never holds its state borrowed while it
//! calls into a connection or the owner, so transports may deliver responses
//! re-entrantly.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use super::calibrate::{Direction, Transfer};
use super::format_speed;
use super::message::{
    CollectPayload, Method, NegotiateResponse, Request, Response, JSON_MIMETYPE,
};
use super::phase::{Phase, PhaseSet, PhaseStep, RunState};
use super::store::ResultStore;
use crate::config::ClientConfig;
use crate::error::{ProbeError, Result};
use crate::reactor::{units, Reactor, TaskHandle, RENEGOTIATE};

/// Latency rounds per run.
pub const LATENCY_ROUNDS: u32 = 10;

/// Interval of the transfer progress log.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Client side of a transport connection.
pub trait ClientConnection {
    /// Send a request; the response comes back through
    /// [`SpeedtestClient::got_response`].
    fn send_request(&self, reactor: &mut Reactor, request: Request) -> Result<()>;

    /// Close the connection.
    fn close(&self, reactor: &mut Reactor);

    /// Local address
    fn local_addr(&self) -> String;

    /// Remote address
    fn peer_addr(&self) -> String;

    /// Connection setup time, reported once.
    fn take_connect_time(&self) -> Option<Duration>;
}

/// Measurements of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedtestResults {
    /// Mean connection setup time, time units
    pub connect_time: Vec<f64>,
    /// Mean round-trip latency, time units
    pub latency: Vec<f64>,
    /// Download throughput, bytes per time unit
    pub download_speed: Vec<f64>,
    /// Upload throughput, bytes per time unit
    pub upload_speed: Vec<f64>,
    /// Address the server saw during negotiation
    pub public_address: String,
}

/// Called once when a run ends.
pub type CompletionFn = Box<dyn FnOnce(&mut Reactor, Result<SpeedtestResults>)>;

/// Latency helper: `HEAD` on every connection, [`LATENCY_ROUNDS`] times.
#[derive(Debug)]
pub struct Latency {
    uri: String,
    token: Option<String>,
    sent_at: Vec<Option<Duration>>,
    round: u32,
    samples: Vec<f64>,
    connect: Vec<f64>,
}

impl Latency {
    /// Prepare rounds over `connections` connections.
    pub fn new(uri: String, token: Option<String>, connections: usize) -> Self {
        Self {
            uri,
            token,
            sent_at: vec![None; connections],
            round: 0,
            samples: Vec::new(),
            connect: Vec::new(),
        }
    }

    /// Start the next round.
    pub fn start(&mut self, now: Duration) -> PhaseStep {
        self.round += 1;
        tracing::debug!("latency run #{}", self.round);
        let requests = (0..self.sent_at.len())
            .map(|index| {
                self.sent_at[index] = Some(now);
                let request = Request::new(Method::Head, self.uri.clone())
                    .with_authorization(self.token.as_deref());
                (index, request)
            })
            .collect();
        PhaseStep::Send(requests)
    }

    /// Account one response.
    pub fn on_response(
        &mut self,
        index: usize,
        response: &Response,
        connect_time: Option<Duration>,
        now: Duration,
    ) -> Result<PhaseStep> {
        response.expect(&[200])?;
        let sent = self
            .sent_at
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(|| {
                ProbeError::Protocol(format!("unexpected latency response on connection {index}"))
            })?;

        if let Some(connect) = connect_time.filter(|c| !c.is_zero()) {
            self.connect.push(units(connect));
        }
        self.samples.push(units(now.saturating_sub(sent)));

        if self.sent_at.iter().any(Option::is_some) {
            Ok(PhaseStep::Wait)
        } else if self.round < LATENCY_ROUNDS {
            Ok(self.start(now))
        } else {
            Ok(PhaseStep::Complete)
        }
    }

    /// Mean round-trip time
    pub fn latency(&self) -> Option<f64> {
        mean(&self.samples)
    }

    /// Mean connection setup time
    pub fn connect_time(&self) -> Option<f64> {
        mean(&self.connect)
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[derive(Debug)]
enum Helper {
    Negotiate,
    Latency(Latency),
    Transfer(Transfer),
    Collect,
}

struct ClientState {
    base: String,
    connections: Vec<Rc<dyn ClientConnection>>,
    pending: PhaseSet,
    state: RunState,
    cleaned_up: bool,
    helper: Option<Helper>,
    results: SpeedtestResults,
    owner: Option<CompletionFn>,
    store: Option<Rc<dyn ResultStore>>,
    client_id: String,
    authorization: Option<String>,
    sampler: Option<TaskHandle>,
}

/// Speedtest phase controller; cheap to clone, clones share one run.
#[derive(Clone)]
pub struct SpeedtestClient {
    inner: Rc<RefCell<ClientState>>,
}

impl SpeedtestClient {
    /// Prepare a run of `phases` over `connections`.
    ///
    /// Negotiate and collect are added unless `skip_negotiation` is set.
    /// At most `config.connections` connections are used.
    pub fn new(
        config: &ClientConfig,
        phases: PhaseSet,
        mut connections: Vec<Rc<dyn ClientConnection>>,
    ) -> Self {
        if connections.len() > config.connections {
            tracing::warn!(
                "speedtest: using {} of {} connections",
                config.connections,
                connections.len()
            );
            connections.truncate(config.connections);
        }
        let mut base = config.uri.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let mut pending = phases;
        if !config.skip_negotiation {
            pending.insert(Phase::Negotiate);
            pending.insert(Phase::Collect);
        }

        Self {
            inner: Rc::new(RefCell::new(ClientState {
                base,
                connections,
                pending,
                state: RunState::Idle,
                cleaned_up: false,
                helper: None,
                results: SpeedtestResults::default(),
                owner: None,
                store: None,
                client_id: uuid::Uuid::new_v4().to_string(),
                authorization: None,
                sampler: None,
            })),
        }
    }

    /// Save the collect payload locally before uploading it.
    pub fn with_store(self, store: Rc<dyn ResultStore>) -> Self {
        self.inner.borrow_mut().store = Some(store);
        self
    }

    /// Identify the measuring agent in the collect payload.
    pub fn with_client_id(self, client_id: impl Into<String>) -> Self {
        self.inner.borrow_mut().client_id = client_id.into();
        self
    }

    /// Be told once how the run ended.
    pub fn on_complete<F>(self, callback: F) -> Self
    where
        F: FnOnce(&mut Reactor, Result<SpeedtestResults>) + 'static,
    {
        self.inner.borrow_mut().owner = Some(Box::new(callback));
        self
    }

    /// Start the first pending phase.
    pub fn start(&self, reactor: &mut Reactor) {
        let (first, no_connections) = {
            let state = self.inner.borrow();
            (state.pending.current(), state.connections.is_empty())
        };
        if no_connections {
            self.abort(reactor, ProbeError::Connection("no connections".into()));
            return;
        }
        tracing::info!("speedtest: start");
        self.advance(reactor, first);
    }

    /// A response arrived on connection `index`.
    pub fn got_response(&self, reactor: &mut Reactor, index: usize, response: Response) {
        if self.is_finished() {
            return;
        }
        let now = reactor.now();

        let in_latency = matches!(self.inner.borrow().helper, Some(Helper::Latency(_)));
        let connect_time = if in_latency {
            self.connection(index).and_then(|c| c.take_connect_time())
        } else {
            None
        };

        let outcome = {
            let mut guard = self.inner.borrow_mut();
            let state = &mut *guard;
            match state.helper.as_mut() {
                Some(Helper::Negotiate) => {
                    Self::negotiated(&response, &mut state.authorization, &mut state.results)
                },
                Some(Helper::Latency(latency)) => {
                    latency.on_response(index, &response, connect_time, now)
                },
                Some(Helper::Transfer(transfer)) => transfer.on_response(index, &response, now),
                Some(Helper::Collect) => response.expect(&[200]).map(|()| PhaseStep::Complete),
                None => Err(ProbeError::Protocol("response with no phase running".into())),
            }
        };

        match outcome {
            Ok(step) => self.apply(reactor, step),
            Err(err) => self.abort(reactor, err),
        }
    }

    /// Connection `index` could not be established.
    pub fn connection_failed(&self, reactor: &mut Reactor, index: usize) {
        self.abort(reactor, ProbeError::Connection(format!("connection {index} failed")));
    }

    /// Connection `index` went away; harmless once the run succeeded.
    pub fn connection_lost(&self, reactor: &mut Reactor, index: usize) {
        if self.is_finished() {
            return;
        }
        self.abort(reactor, ProbeError::Connection(format!("connection {index} lost")));
    }

    /// Where the run stands
    pub fn state(&self) -> RunState {
        self.inner.borrow().state
    }

    /// Measurements so far
    pub fn results(&self) -> SpeedtestResults {
        self.inner.borrow().results.clone()
    }

    /// Session token granted by the server
    pub fn authorization(&self) -> Option<String> {
        self.inner.borrow().authorization.clone()
    }

    /// Phases not yet completed
    pub fn pending(&self) -> PhaseSet {
        self.inner.borrow().pending
    }

    fn is_finished(&self) -> bool {
        let state = self.inner.borrow();
        state.cleaned_up || state.state.is_finished()
    }

    fn connection(&self, index: usize) -> Option<Rc<dyn ClientConnection>> {
        self.inner.borrow().connections.get(index).cloned()
    }

    fn advance(&self, reactor: &mut Reactor, next: Option<Phase>) {
        let Some(phase) = next else {
            self.succeed(reactor);
            return;
        };
        match self.begin(reactor, phase) {
            Ok(step) => self.apply(reactor, step),
            Err(err) => self.abort(reactor, err),
        }
    }

    fn begin(&self, reactor: &mut Reactor, phase: Phase) -> Result<PhaseStep> {
        let now = reactor.now();
        tracing::info!("speedtest: {}", phase);

        let mut state = self.inner.borrow_mut();
        state.state = RunState::Running(phase);
        let uri = format!("{}{}", state.base, phase.name());
        let token = state.authorization.clone();
        let available = state.connections.len();

        let step = match phase {
            Phase::Negotiate => {
                state.helper = Some(Helper::Negotiate);
                let request = Request::new(Method::Get, uri).with_authorization(token.as_deref());
                PhaseStep::Send(vec![(0, request)])
            },
            Phase::Latency => {
                let mut latency = Latency::new(uri, token, available);
                let step = latency.start(now);
                state.helper = Some(Helper::Latency(latency));
                step
            },
            Phase::Download | Phase::Upload => {
                let direction = if phase == Phase::Download {
                    Direction::Download
                } else {
                    Direction::Upload
                };
                let mut transfer = Transfer::new(direction, uri, token, available);
                let step = transfer.start(now);
                state.helper = Some(Helper::Transfer(transfer));
                step
            },
            Phase::Collect => {
                state.helper = Some(Helper::Collect);
                let payload = Self::collect_payload(&state);
                let store = state.store.clone();
                drop(state);

                let body = serde_json::to_vec(&payload)?;
                if let Some(store) = store {
                    store.save("speedtest", &body, &payload.client_id);
                }
                let request = Request::new(Method::Post, uri)
                    .with_authorization(token.as_deref())
                    .with_body(JSON_MIMETYPE, Bytes::from(body));
                PhaseStep::Send(vec![(0, request)])
            },
        };
        Ok(step)
    }

    fn negotiated(
        response: &Response,
        authorization: &mut Option<String>,
        results: &mut SpeedtestResults,
    ) -> Result<PhaseStep> {
        response.expect(&[200])?;
        let negotiation: NegotiateResponse = response.json()?;
        *authorization = Some(negotiation.authorization.clone());
        results.public_address = negotiation.public_address.clone();

        if negotiation.is_unchoked() {
            tracing::info!("speedtest: authorized to take the test");
            Ok(PhaseStep::Complete)
        } else {
            tracing::info!(
                "speedtest: waiting in queue {}/{}",
                negotiation.queue_pos,
                negotiation.queue_len
            );
            Ok(PhaseStep::Choked)
        }
    }

    fn collect_payload(state: &ClientState) -> CollectPayload {
        let (internal_address, remote_address) = state
            .connections
            .first()
            .map(|c| (c.local_addr(), c.peer_addr()))
            .unwrap_or_default();
        CollectPayload {
            client_id: state.client_id.clone(),
            timestamp: chrono::Utc::now().timestamp(),
            internal_address,
            real_address: state.results.public_address.clone(),
            remote_address,
            connect_time: state.results.connect_time.clone(),
            latency: state.results.latency.clone(),
            download_speed: state.results.download_speed.clone(),
            upload_speed: state.results.upload_speed.clone(),
        }
    }

    fn apply(&self, reactor: &mut Reactor, step: PhaseStep) {
        match step {
            PhaseStep::Send(requests) => {
                for (index, request) in requests {
                    let sent = match self.connection(index) {
                        Some(connection) => connection.send_request(reactor, request),
                        None => Err(ProbeError::Connection(format!("no connection {index}"))),
                    };
                    if let Err(err) = sent {
                        self.abort(reactor, err);
                        return;
                    }
                    // A re-entrant response may have ended the run.
                    if self.is_finished() {
                        return;
                    }
                }
                self.start_sampler(reactor);
            },
            PhaseStep::Wait => {},
            PhaseStep::Choked => {
                self.inner.borrow_mut().state = RunState::Waiting;
                let client = self.clone();
                reactor.subscribe(RENEGOTIATE, move |reactor| {
                    client.renegotiate(reactor);
                    Ok(())
                });
            },
            PhaseStep::Complete => self.complete(reactor),
        }
    }

    fn renegotiate(&self, reactor: &mut Reactor) {
        if self.is_finished() || self.state() != RunState::Waiting {
            return;
        }
        tracing::debug!("speedtest: queue moved, negotiating again");
        self.advance(reactor, Some(Phase::Negotiate));
    }

    fn start_sampler(&self, reactor: &mut Reactor) {
        {
            let state = self.inner.borrow();
            let measuring = matches!(&state.helper, Some(Helper::Transfer(t)) if t.is_measuring());
            if !measuring || state.sampler.is_some() {
                return;
            }
        }
        let client = self.clone();
        let handle = reactor.schedule_periodic(SAMPLE_INTERVAL, move |_| {
            if let Some(Helper::Transfer(transfer)) = &client.inner.borrow().helper {
                tracing::info!(
                    "{}: {} bytes so far",
                    transfer.direction().endpoint(),
                    transfer.completed()
                );
            }
            Ok(())
        });
        self.inner.borrow_mut().sampler = Some(handle);
    }

    fn complete(&self, reactor: &mut Reactor) {
        let (next, sampler) = {
            let mut state = self.inner.borrow_mut();
            let RunState::Running(phase) = state.state else {
                return;
            };
            match state.helper.take() {
                Some(Helper::Latency(latency)) => {
                    state.results.latency.extend(latency.latency());
                    state.results.connect_time.extend(latency.connect_time());
                },
                Some(Helper::Transfer(transfer)) => {
                    let speed = transfer.speed().unwrap_or_default();
                    match transfer.direction() {
                        Direction::Download => state.results.download_speed.push(speed),
                        Direction::Upload => state.results.upload_speed.push(speed),
                    }
                },
                _ => {},
            }
            state.pending.remove(phase);

            let mut next = phase.transition().on_success;
            while let RunState::Running(candidate) = next {
                if state.pending.contains(candidate) {
                    break;
                }
                next = candidate.transition().on_success;
            }
            (next.phase(), state.sampler.take())
        };

        if let Some(sampler) = sampler {
            reactor.cancel(&sampler);
        }
        self.advance(reactor, next);
    }

    fn succeed(&self, reactor: &mut Reactor) {
        self.inner.borrow_mut().state = RunState::Succeeded;
        let results = self.results();
        log_results(&results);
        self.cleanup(reactor, Ok(results));
    }

    fn abort(&self, reactor: &mut Reactor, err: ProbeError) {
        if self.inner.borrow().cleaned_up {
            return;
        }
        let failed = self.state().phase().unwrap_or(Phase::Negotiate);
        tracing::error!("speedtest: {} failed, aborting: {}", failed, err);
        self.inner.borrow_mut().state = failed.transition().on_failure;
        self.cleanup(reactor, Err(err));
    }

    fn cleanup(&self, reactor: &mut Reactor, outcome: Result<SpeedtestResults>) {
        let (connections, sampler, owner) = {
            let mut state = self.inner.borrow_mut();
            if state.cleaned_up {
                return;
            }
            state.cleaned_up = true;
            state.helper = None;
            (
                std::mem::take(&mut state.connections),
                state.sampler.take(),
                state.owner.take(),
            )
        };

        if let Some(sampler) = sampler {
            reactor.cancel(&sampler);
        }
        for connection in connections {
            connection.close(reactor);
        }
        if let Some(owner) = owner {
            owner(reactor, outcome);
        }
    }
}

impl std::fmt::Debug for SpeedtestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.borrow();
        f.debug_struct("SpeedtestClient")
            .field("base", &state.base)
            .field("state", &state.state)
            .field("pending", &state.pending)
            .finish_non_exhaustive()
    }
}

/// Log a finished run.
pub fn log_results(results: &SpeedtestResults) {
    let ms = |v: &[f64]| {
        v.first()
            .map_or_else(|| "n/a".to_string(), |s| format!("{:.1} ms", s * 1000.0))
    };
    let speed = |v: &[f64]| v.first().map_or_else(|| "n/a".to_string(), |s| format_speed(*s));
    tracing::info!(
        "speedtest results: connect {} latency {} download {} upload {}",
        ms(&results.connect_time),
        ms(&results.latency),
        speed(&results.download_speed),
        speed(&results.upload_speed)
    );
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::config::ReactorConfig;
    use crate::reactor::{ManualClock, SimulatedMultiplexer};
    use crate::speedtest::store::MemoryStore;

    #[derive(Default)]
    struct Fake {
        sent: RefCell<Vec<Request>>,
        closed: Cell<usize>,
        connect_time: Cell<Option<Duration>>,
    }

    impl ClientConnection for Fake {
        fn send_request(&self, _reactor: &mut Reactor, request: Request) -> Result<()> {
            self.sent.borrow_mut().push(request);
            Ok(())
        }

        fn close(&self, _reactor: &mut Reactor) {
            self.closed.set(self.closed.get() + 1);
        }

        fn local_addr(&self) -> String {
            "10.0.0.2".into()
        }

        fn peer_addr(&self) -> String {
            "198.51.100.1".into()
        }

        fn take_connect_time(&self) -> Option<Duration> {
            self.connect_time.take()
        }
    }

    fn reactor() -> (Reactor, Rc<ManualClock>) {
        let clock = Rc::new(ManualClock::new());
        let mux = SimulatedMultiplexer::new(Rc::clone(&clock));
        let reactor = Reactor::with_parts(&ReactorConfig::default(), clock.clone(), Box::new(mux));
        (reactor, clock)
    }

    fn fakes(count: usize) -> (Vec<Rc<Fake>>, Vec<Rc<dyn ClientConnection>>) {
        let fakes: Vec<Rc<Fake>> = (0..count).map(|_| Rc::new(Fake::default())).collect();
        let conns = fakes
            .iter()
            .map(|f| Rc::clone(f) as Rc<dyn ClientConnection>)
            .collect();
        (fakes, conns)
    }

    type Outcome = Rc<RefCell<Vec<Result<SpeedtestResults>>>>;

    fn client(
        skip: bool,
        phases: PhaseSet,
        conns: Vec<Rc<dyn ClientConnection>>,
    ) -> (SpeedtestClient, Outcome) {
        let config = ClientConfig {
            uri: "http://198.51.100.1/speedtest".into(),
            connections: conns.len(),
            skip_negotiation: skip,
        };
        let outcome: Outcome = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&outcome);
        let client = SpeedtestClient::new(&config, phases, conns)
            .on_complete(move |_, result| sink.borrow_mut().push(result));
        (client, outcome)
    }

    fn negotiation(unchoked: bool, pos: usize) -> Response {
        Response::ok()
            .with_json(&NegotiateResponse {
                authorization: "token-1".into(),
                public_address: "203.0.113.9".into(),
                unchoked: unchoked.to_string(),
                queue_pos: pos,
                queue_len: pos,
            })
            .unwrap()
    }

    #[test]
    fn test_latency_only_run() {
        let (mut reactor, clock) = reactor();
        let (fakes, conns) = fakes(2);
        fakes[0].connect_time.set(Some(Duration::from_millis(30)));
        let (client, outcome) = client(true, PhaseSet::LATENCY, conns);

        client.start(&mut reactor);
        assert_eq!(client.state(), RunState::Running(Phase::Latency));
        assert_eq!(fakes[0].sent.borrow()[0].uri, "http://198.51.100.1/speedtest/latency");
        assert_eq!(fakes[0].sent.borrow()[0].method, Method::Head);

        for _ in 0..LATENCY_ROUNDS {
            clock.advance(Duration::from_millis(20));
            client.got_response(&mut reactor, 0, Response::ok());
            client.got_response(&mut reactor, 1, Response::ok());
        }

        assert_eq!(client.state(), RunState::Succeeded);
        assert_eq!(fakes[0].sent.borrow().len(), LATENCY_ROUNDS as usize);
        let results = outcome.borrow_mut().pop().unwrap().unwrap();
        assert!((results.latency[0] - 0.02).abs() < 1e-9);
        assert!((results.connect_time[0] - 0.03).abs() < 1e-9);
        assert!(fakes.iter().all(|f| f.closed.get() == 1));
    }

    #[test]
    fn test_configured_connection_count_caps_pool() {
        let (mut reactor, _) = reactor();
        let (fakes, conns) = fakes(4);
        let config = ClientConfig {
            uri: "http://198.51.100.1/speedtest".into(),
            connections: 2,
            skip_negotiation: true,
        };
        let client = SpeedtestClient::new(&config, PhaseSet::LATENCY, conns);

        client.start(&mut reactor);
        assert_eq!(fakes[0].sent.borrow().len(), 1);
        assert_eq!(fakes[1].sent.borrow().len(), 1);
        assert!(fakes[2].sent.borrow().is_empty());
        assert!(fakes[3].sent.borrow().is_empty());
    }

    #[test]
    fn test_unchoked_negotiation_goes_to_latency() {
        let (mut reactor, _) = reactor();
        let (fakes, conns) = fakes(1);
        let (client, _) = client(false, PhaseSet::ALL, conns);

        client.start(&mut reactor);
        let first = fakes[0].sent.borrow()[0].clone();
        assert!(first.uri.ends_with("/speedtest/negotiate"));
        assert_eq!(first.token(), None);

        client.got_response(&mut reactor, 0, negotiation(true, 1));
        assert_eq!(client.state(), RunState::Running(Phase::Latency));
        assert_eq!(client.authorization().as_deref(), Some("token-1"));
        let latency = fakes[0].sent.borrow()[1].clone();
        assert_eq!(latency.token(), Some("token-1"));
    }

    #[test]
    fn test_choked_negotiation_waits_for_queue() {
        let (mut reactor, _) = reactor();
        let (fakes, conns) = fakes(1);
        let (client, _) = client(false, PhaseSet::ALL, conns);

        client.start(&mut reactor);
        client.got_response(&mut reactor, 0, negotiation(false, 4));
        assert_eq!(client.state(), RunState::Waiting);
        assert_eq!(fakes[0].sent.borrow().len(), 1);

        reactor.publish(RENEGOTIATE).unwrap();
        assert_eq!(client.state(), RunState::Running(Phase::Negotiate));
        let again = fakes[0].sent.borrow()[1].clone();
        assert!(again.uri.ends_with("negotiate"));
        assert_eq!(again.token(), Some("token-1"));
    }

    #[test]
    fn test_failure_during_download_cleans_up() {
        let (mut reactor, _) = reactor();
        let (fakes, conns) = fakes(2);
        let (client, outcome) = client(false, PhaseSet::DOWNLOAD.union(PhaseSet::UPLOAD), conns);

        client.start(&mut reactor);
        client.got_response(&mut reactor, 0, negotiation(true, 1));
        assert_eq!(client.state(), RunState::Running(Phase::Download));

        client.got_response(&mut reactor, 0, Response::internal_error());
        assert_eq!(client.state(), RunState::Aborted);
        assert!(fakes.iter().all(|f| f.closed.get() == 1));
        let sent = fakes[0].sent.borrow().len();
        assert_eq!(sent, 2);

        let err = outcome.borrow_mut().pop().unwrap().unwrap_err();
        assert!(matches!(err, ProbeError::BadResponse { code: 500, .. }));

        // Late events change nothing.
        client.got_response(&mut reactor, 0, Response::ok());
        client.connection_lost(&mut reactor, 1);
        assert_eq!(fakes[0].sent.borrow().len(), sent);
        assert!(fakes.iter().all(|f| f.closed.get() == 1));
        assert!(outcome.borrow().is_empty());
    }

    #[test]
    fn test_malformed_negotiation_aborts() {
        let (mut reactor, _) = reactor();
        let (_, conns) = fakes(1);
        let (client, outcome) = client(false, PhaseSet::ALL, conns);

        client.start(&mut reactor);
        let garbage = Response::ok().with_body(JSON_MIMETYPE, Bytes::from_static(b"{"));
        client.got_response(&mut reactor, 0, garbage);
        assert_eq!(client.state(), RunState::Aborted);
        assert!(outcome.borrow()[0].is_err());
    }

    #[test]
    fn test_connection_lost_after_success_is_ignored() {
        let (mut reactor, _) = reactor();
        let (fakes, conns) = fakes(1);
        let (client, outcome) = client(true, PhaseSet::empty(), conns);

        client.start(&mut reactor);
        assert_eq!(client.state(), RunState::Succeeded);
        client.connection_lost(&mut reactor, 0);
        assert_eq!(client.state(), RunState::Succeeded);
        assert_eq!(outcome.borrow().len(), 1);
        assert_eq!(fakes[0].closed.get(), 1);
    }

    #[test]
    fn test_collect_saves_payload_then_posts() {
        let (mut reactor, _) = reactor();
        let (fakes, conns) = fakes(1);
        let store = Rc::new(MemoryStore::new());
        let (client, outcome) = client(false, PhaseSet::empty(), conns);
        let client = client.with_store(store.clone()).with_client_id("agent-1");

        client.start(&mut reactor);
        client.got_response(&mut reactor, 0, negotiation(true, 1));
        assert_eq!(client.state(), RunState::Running(Phase::Collect));

        let post = fakes[0].sent.borrow()[1].clone();
        assert_eq!(post.method, Method::Post);
        assert_eq!(post.token(), Some("token-1"));
        let payload: CollectPayload = serde_json::from_slice(&post.body).unwrap();
        assert_eq!(payload.client_id, "agent-1");
        assert_eq!(payload.real_address, "203.0.113.9");
        assert_eq!(payload.internal_address, "10.0.0.2");
        assert_eq!(store.records()[0].blob, post.body.to_vec());

        client.got_response(&mut reactor, 0, Response::ok());
        assert_eq!(client.state(), RunState::Succeeded);
        assert!(outcome.borrow()[0].is_ok());
    }

    #[test]
    fn test_no_connections_aborts() {
        let (mut reactor, _) = reactor();
        let (client, outcome) = client(true, PhaseSet::ALL, Vec::new());
        client.start(&mut reactor);
        assert_eq!(client.state(), RunState::Aborted);
        assert!(outcome.borrow()[0].is_err());
    }

    #[test]
    fn test_sampler_cancelled_after_transfer() {
        let (mut reactor, clock) = reactor();
        let (_, conns) = fakes(1);
        let (client, _) = client(true, PhaseSet::DOWNLOAD, conns);
        let baseline = reactor.task_count();

        client.start(&mut reactor);
        clock.advance(Duration::from_secs(2));
        // Slow round: calibration ends, measurement starts with the sampler.
        client.got_response(&mut reactor, 0, Response::ok());
        assert_eq!(reactor.task_count(), baseline + 1);

        clock.advance(Duration::from_secs(1));
        client.got_response(&mut reactor, 0, Response::ok());
        assert_eq!(client.state(), RunState::Succeeded);
        assert_eq!(reactor.task_count(), baseline);
    }

    #[test]
    fn test_latency_mean() {
        let mut latency = Latency::new("u".into(), None, 1);
        latency.start(Duration::ZERO);
        let step = latency
            .on_response(0, &Response::ok(), None, Duration::from_millis(50))
            .unwrap();
        assert!(matches!(step, PhaseStep::Send(_)));
        assert!(latency
            .on_response(0, &Response::ok(), None, Duration::from_millis(60))
            .is_err());
        assert!((latency.latency().unwrap() - 0.05).abs() < 1e-9);
        assert_eq!(latency.connect_time(), None);
    }
}
