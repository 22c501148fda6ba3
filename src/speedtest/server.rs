//! Speedtest server role.
//!
//! The HTTP collaborator parses requests and calls into [`RequestHandler`];
//! answers go back through [`ServerStream::send_response`]. The server
//! composes two capabilities: admission control ([`NegotiationHandler`]) and
//! the measurement endpoints ([`Tester`]).
//!
//! | URI                   | Handler                         |
//! |-----------------------|---------------------------------|
//! | `/speedtest/negotiate`| queue admission                 |
//! | `/speedtest/collect`  | results upload, leaves queue    |
//! | `/speedtest/latency`  | empty 200                       |
//! | `/speedtest/download` | file body, `Range` aware        |
//! | `/speedtest/upload`   | empty 200                       |

use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;

use super::message::{
    parse_range, CollectPayload, NegotiateResponse, Request, Response, OCTET_MIMETYPE,
};
use super::store::ResultStore;
use super::tracker::{ConnectionId, SessionTracker};
use crate::config::ServerConfig;
use crate::error::{ProbeError, Result};
use crate::reactor::{Reactor, TaskHandle, RENEGOTIATE};

/// Negotiation endpoint
pub const NEGOTIATE_URI: &str = "/speedtest/negotiate";
/// Collect endpoint
pub const COLLECT_URI: &str = "/speedtest/collect";

/// Server side of a transport connection.
pub trait ServerStream {
    /// Identifier of the underlying connection
    fn id(&self) -> ConnectionId;

    /// Remote address
    fn peer_addr(&self) -> String;

    /// Queue a response for the request currently being served
    fn send_response(&self, reactor: &mut Reactor, response: Response) -> Result<()>;
}

/// Entry points used by the HTTP collaborator.
pub trait RequestHandler {
    /// Headers arrived; false refuses the request.
    fn got_request_headers(
        &self,
        reactor: &mut Reactor,
        stream: &Rc<dyn ServerStream>,
        request: &Request,
    ) -> bool;

    /// Full request arrived.
    fn process_request(
        &self,
        reactor: &mut Reactor,
        stream: Rc<dyn ServerStream>,
        request: Request,
    ) -> Result<()>;

    /// The connection went away.
    fn connection_lost(&self, reactor: &mut Reactor, stream: &Rc<dyn ServerStream>) -> Result<()>;
}

/// Queue admission capability.
pub trait NegotiationHandler {
    /// Track the connection and enforce `only_auth`.
    fn check_request_headers(
        &self,
        reactor: &mut Reactor,
        stream: &Rc<dyn ServerStream>,
        request: &Request,
    ) -> bool;

    /// Answer a negotiation, now or once the queue moves.
    fn negotiate(
        &self,
        reactor: &mut Reactor,
        stream: Rc<dyn ServerStream>,
        request: Request,
        nodelay: bool,
    ) -> Result<()>;

    /// Accept uploaded results and release the session.
    fn collect(
        &self,
        reactor: &mut Reactor,
        stream: Rc<dyn ServerStream>,
        request: Request,
    ) -> Result<()>;

    /// Release the session tracked on a closed connection.
    fn remove_connection(&self, reactor: &mut Reactor, stream: &Rc<dyn ServerStream>) -> Result<()>;
}

/// Measurement endpoints.
#[derive(Debug, Clone, Default)]
pub struct Tester {
    path: Option<PathBuf>,
}

impl Tester {
    /// Serve downloads from `path`
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Answer a measurement request; `uri` has the `/speedtest` prefix removed.
    pub fn serve(&self, uri: &str, request: &Request) -> Response {
        match uri {
            "/latency" | "/upload" => Response::ok(),
            "/download" => self.download(request),
            _ => Response::internal_error(),
        }
    }

    fn download(&self, request: &Request) -> Response {
        let Some(path) = self.path.as_ref() else {
            tracing::error!("download requested but no file is configured");
            return Response::internal_error();
        };
        match Self::read_body(path, request.range.as_deref()) {
            Ok(response) => response,
            Err(ProbeError::InvalidRange(range)) => {
                tracing::warn!("bad range {:?}", range);
                Response::bad_request()
            },
            Err(err) => {
                tracing::error!("cannot serve {}: {}", path.display(), err);
                Response::internal_error()
            },
        }
    }

    fn read_body(path: &Path, range: Option<&str>) -> Result<Response> {
        let mut file = File::open(path)?;

        let Some(range) = range else {
            let mut body = Vec::new();
            file.read_to_end(&mut body)?;
            return Ok(Response::ok().with_body(OCTET_MIMETYPE, Bytes::from(body)));
        };

        let total = file.metadata()?.len();
        let (first, last) = parse_range(range)?;
        if first >= total {
            return Err(ProbeError::InvalidRange(range.to_string()));
        }
        let last = last.min(total - 1);

        file.seek(SeekFrom::Start(first))?;
        let mut body = vec![0u8; (last - first + 1) as usize];
        file.read_exact(&mut body)?;

        Ok(Response::partial(format!("bytes {first}-{last}/{total}"))
            .with_body(OCTET_MIMETYPE, Bytes::from(body)))
    }
}

struct Inner {
    config: ServerConfig,
    tracker: RefCell<SessionTracker>,
    tester: Tester,
    store: Option<Rc<dyn ResultStore>>,
    tasks: RefCell<Vec<TaskHandle>>,
}

/// Speedtest server; cheap to clone, all clones share one queue.
#[derive(Clone)]
pub struct SpeedtestServer {
    inner: Rc<Inner>,
}

impl SpeedtestServer {
    /// Create a server and schedule its housekeeping tasks.
    pub fn start(
        reactor: &mut Reactor,
        config: ServerConfig,
        store: Option<Rc<dyn ResultStore>>,
    ) -> Self {
        let tracker = SessionTracker::new(
            config.max_active,
            Duration::from_secs(config.stale_after_secs),
        );
        let server = Self {
            inner: Rc::new(Inner {
                tester: Tester::new(config.path.clone()),
                tracker: RefCell::new(tracker),
                store,
                tasks: RefCell::new(Vec::new()),
                config,
            }),
        };

        let prune = {
            let server = server.clone();
            reactor.schedule_periodic(
                Duration::from_secs(server.inner.config.prune_interval_secs),
                move |reactor| server.check_timeout(reactor),
            )
        };
        let sample = {
            let server = server.clone();
            reactor.schedule_periodic(
                Duration::from_secs(server.inner.config.sample_interval_secs),
                move |_| {
                    tracing::info!(
                        "speedtest queue length: {}",
                        server.inner.tracker.borrow().len()
                    );
                    Ok(())
                },
            )
        };
        server.inner.tasks.borrow_mut().extend([prune, sample]);

        tracing::info!("speedtest server ready on {}", server.inner.config.listen_addr());
        server
    }

    /// Cancel housekeeping tasks.
    pub fn stop(&self, reactor: &mut Reactor) {
        for handle in self.inner.tasks.borrow_mut().drain(..) {
            reactor.cancel(&handle);
        }
    }

    /// Run the header check and, if it passes, the request itself.
    ///
    /// Refused requests are answered with 403.
    pub fn handle(
        &self,
        reactor: &mut Reactor,
        stream: Rc<dyn ServerStream>,
        request: Request,
    ) -> Result<()> {
        if !self.got_request_headers(reactor, &stream, &request) {
            return stream.send_response(reactor, Response::forbidden());
        }
        self.process_request(reactor, stream, request)
    }

    /// Admission queue, for inspection.
    pub fn tracker(&self) -> std::cell::Ref<'_, SessionTracker> {
        self.inner.tracker.borrow()
    }

    fn check_timeout(&self, reactor: &mut Reactor) -> Result<()> {
        let now = reactor.now();
        let pruned = self.inner.tracker.borrow_mut().prune_stale(now);
        if pruned {
            reactor.publish(RENEGOTIATE)?;
        }
        Ok(())
    }
}

impl NegotiationHandler for SpeedtestServer {
    fn check_request_headers(
        &self,
        reactor: &mut Reactor,
        stream: &Rc<dyn ServerStream>,
        request: &Request,
    ) -> bool {
        let now = reactor.now();
        let mut tracker = self.inner.tracker.borrow_mut();
        tracker.register_connection(stream.id(), request.token());

        if self.inner.config.only_auth
            && request.uri != NEGOTIATE_URI
            && !tracker.is_active(request.token(), now)
        {
            tracing::warn!("connection {}: forbidden", stream.id());
            return false;
        }
        true
    }

    fn negotiate(
        &self,
        reactor: &mut Reactor,
        stream: Rc<dyn ServerStream>,
        request: Request,
        nodelay: bool,
    ) -> Result<()> {
        let now = reactor.now();
        let (session, queue_len) = {
            let mut tracker = self.inner.tracker.borrow_mut();
            let session = tracker.negotiate(request.token(), now);
            // Track the first connection too, or losing it would go unnoticed.
            if session.negotiations == 1 {
                tracker.register_connection(stream.id(), Some(&session.identifier));
            }
            (session, tracker.len())
        };
        if !session.active && !nodelay && session.negotiations > 1 {
            tracing::debug!(
                "session {} waits at {}/{}",
                session.identifier,
                session.queue_pos,
                queue_len
            );
            let server = self.clone();
            let identifier = session.identifier;
            reactor.subscribe(RENEGOTIATE, move |reactor| {
                // Answering a removed session would queue a fresh one.
                if server.inner.tracker.borrow().get(&identifier).is_none() {
                    tracing::debug!("dropping held negotiation of {}", identifier);
                    return Ok(());
                }
                server.negotiate(reactor, stream, request, true)
            });
            return Ok(());
        }

        let body = NegotiateResponse {
            authorization: session.identifier,
            public_address: stream.peer_addr(),
            unchoked: session.active.to_string(),
            queue_pos: session.queue_pos,
            queue_len,
        };
        let response = Response::ok().with_json(&body)?;
        stream.send_response(reactor, response)
    }

    fn collect(
        &self,
        reactor: &mut Reactor,
        stream: Rc<dyn ServerStream>,
        request: Request,
    ) -> Result<()> {
        if let Some(token) = request.token() {
            self.inner.tracker.borrow_mut().remove(token);
        }
        reactor.publish(RENEGOTIATE)?;

        let payload: CollectPayload = match serde_json::from_slice(&request.body) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!("connection {}: bad collect payload: {}", stream.id(), err);
                return stream.send_response(reactor, Response::bad_request());
            },
        };
        if let Some(store) = &self.inner.store {
            store.save("speedtest", &request.body, &payload.client_id);
        }
        stream.send_response(reactor, Response::ok())
    }

    fn remove_connection(
        &self,
        reactor: &mut Reactor,
        stream: &Rc<dyn ServerStream>,
    ) -> Result<()> {
        self.inner
            .tracker
            .borrow_mut()
            .unregister_connection(stream.id());
        reactor.publish(RENEGOTIATE)
    }
}

impl RequestHandler for SpeedtestServer {
    fn got_request_headers(
        &self,
        reactor: &mut Reactor,
        stream: &Rc<dyn ServerStream>,
        request: &Request,
    ) -> bool {
        self.check_request_headers(reactor, stream, request)
    }

    fn process_request(
        &self,
        reactor: &mut Reactor,
        stream: Rc<dyn ServerStream>,
        request: Request,
    ) -> Result<()> {
        match request.uri.as_str() {
            NEGOTIATE_URI => self.negotiate(reactor, stream, request, false),
            COLLECT_URI => self.collect(reactor, stream, request),
            uri => {
                let uri = uri.strip_prefix("/speedtest").unwrap_or(uri);
                let response = self.inner.tester.serve(uri, &request);
                stream.send_response(reactor, response)
            },
        }
    }

    fn connection_lost(&self, reactor: &mut Reactor, stream: &Rc<dyn ServerStream>) -> Result<()> {
        self.remove_connection(reactor, stream)
    }
}
