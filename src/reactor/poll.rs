//! Readiness multiplexing.
//!
//! [`PollMultiplexer`] blocks in `poll(2)`. [`SimulatedMultiplexer`] never
//! blocks: it advances a [`ManualClock`] by the wait bound and reports
//! readiness scripted by the caller, so whole protocol runs can be replayed
//! deterministically.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use super::clock::ManualClock;
use super::Fileno;

/// Handles reported ready by one wait.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Handles ready for reading
    pub readable: Vec<Fileno>,
    /// Handles ready for writing
    pub writable: Vec<Fileno>,
}

/// Blocking wait for readiness on a set of handles.
pub trait Multiplexer {
    /// Block for at most `timeout` until one of the handles is ready.
    ///
    /// An `Interrupted` error is retried by the reactor on its next tick.
    fn wait(
        &mut self,
        readable: &[Fileno],
        writable: &[Fileno],
        timeout: Duration,
    ) -> io::Result<Readiness>;
}

/// `poll(2)` based multiplexer.
#[derive(Default)]
pub struct PollMultiplexer {
    fds: Vec<libc::pollfd>,
}

impl PollMultiplexer {
    /// Create a multiplexer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Multiplexer for PollMultiplexer {
    #[allow(unsafe_code)]
    fn wait(
        &mut self,
        readable: &[Fileno],
        writable: &[Fileno],
        timeout: Duration,
    ) -> io::Result<Readiness> {
        self.fds.clear();
        for &fd in readable {
            self.fds.push(libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            });
        }
        for &fd in writable {
            match self.fds.iter_mut().find(|p| p.fd == fd) {
                Some(pfd) => pfd.events |= libc::POLLOUT,
                None => self.fds.push(libc::pollfd {
                    fd,
                    events: libc::POLLOUT,
                    revents: 0,
                }),
            }
        }

        // Round up so a sub-millisecond bound does not turn into a busy loop.
        let millis = timeout.as_micros().div_ceil(1000).min(i32::MAX as u128) as libc::c_int;

        // SAFETY: `fds` is a valid, initialized slice of pollfd for the whole call
        // and its length fits nfds_t.
        let ret = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                millis,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut ready = Readiness::default();
        for pfd in &self.fds {
            if pfd.revents == 0 {
                continue;
            }
            let failed = pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
            if pfd.events & libc::POLLIN != 0 && (pfd.revents & libc::POLLIN != 0 || failed) {
                ready.readable.push(pfd.fd);
            }
            if pfd.events & libc::POLLOUT != 0 && (pfd.revents & libc::POLLOUT != 0 || failed) {
                ready.writable.push(pfd.fd);
            }
        }
        Ok(ready)
    }
}

/// One scripted answer of a [`SimulatedMultiplexer`].
#[derive(Debug)]
pub enum Step {
    /// Let time pass by the full wait bound and report nothing.
    Idle,
    /// Advance time by the given amount (capped by the wait bound) and report handles ready.
    Ready(Duration, Readiness),
    /// Fail the wait with the given error kind.
    Fail(io::ErrorKind),
}

/// Non-blocking multiplexer driven by a script and a [`ManualClock`].
#[derive(Debug)]
pub struct SimulatedMultiplexer {
    clock: Rc<ManualClock>,
    script: Rc<RefCell<VecDeque<Step>>>,
    waits: Rc<RefCell<Vec<Duration>>>,
}

impl SimulatedMultiplexer {
    /// Create a multiplexer advancing `clock`.
    pub fn new(clock: Rc<ManualClock>) -> Self {
        Self {
            clock,
            script: Rc::new(RefCell::new(VecDeque::new())),
            waits: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Shared handle to the script, so steps can be queued after the
    /// multiplexer was moved into a reactor.
    pub fn script(&self) -> Rc<RefCell<VecDeque<Step>>> {
        Rc::clone(&self.script)
    }

    /// Shared record of every wait bound the reactor asked for.
    pub fn waits(&self) -> Rc<RefCell<Vec<Duration>>> {
        Rc::clone(&self.waits)
    }
}

impl Multiplexer for SimulatedMultiplexer {
    fn wait(
        &mut self,
        readable: &[Fileno],
        writable: &[Fileno],
        timeout: Duration,
    ) -> io::Result<Readiness> {
        self.waits.borrow_mut().push(timeout);
        let step = self.script.borrow_mut().pop_front().unwrap_or(Step::Idle);
        match step {
            Step::Idle => {
                self.clock.advance(timeout);
                Ok(Readiness::default())
            },
            Step::Ready(after, mut ready) => {
                self.clock.advance(after.min(timeout));
                ready.readable.retain(|fd| readable.contains(fd));
                ready.writable.retain(|fd| writable.contains(fd));
                Ok(ready)
            },
            Step::Fail(kind) => Err(io::Error::from(kind)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::reactor::Clock;

    #[test]
    fn test_poll_reports_readable_socket() {
        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(b"x").unwrap();

        let mut mux = PollMultiplexer::new();
        let ready = mux
            .wait(&[b.as_raw_fd()], &[], Duration::from_millis(100))
            .unwrap();
        assert_eq!(ready.readable, vec![b.as_raw_fd()]);
        assert!(ready.writable.is_empty());
    }

    #[test]
    fn test_poll_times_out_without_events() {
        let (_a, b) = UnixStream::pair().unwrap();
        let mut mux = PollMultiplexer::new();
        let ready = mux
            .wait(&[b.as_raw_fd()], &[], Duration::from_millis(10))
            .unwrap();
        assert_eq!(ready, Readiness::default());
    }

    #[test]
    fn test_simulated_advances_clock_and_filters() {
        let clock = Rc::new(ManualClock::new());
        let mut mux = SimulatedMultiplexer::new(Rc::clone(&clock));
        mux.script().borrow_mut().push_back(Step::Ready(
            Duration::from_millis(200),
            Readiness {
                readable: vec![3, 9],
                writable: vec![4],
            },
        ));

        let ready = mux.wait(&[3], &[], Duration::from_secs(1)).unwrap();
        assert_eq!(ready.readable, vec![3]);
        assert!(ready.writable.is_empty());
        assert_eq!(clock.now(), Duration::from_millis(200));

        mux.wait(&[3], &[], Duration::from_secs(1)).unwrap();
        assert_eq!(clock.now(), Duration::from_millis(1200));
    }
}
