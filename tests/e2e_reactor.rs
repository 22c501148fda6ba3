//! End-to-end reactor tests.
//!
//! These tests drive the event loop over real sockets with `poll(2)` and
//! check scheduler ordering properties on the simulated clock.

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use netprobe::config::ReactorConfig;
use netprobe::reactor::{Clock, Fileno, ManualClock, Pollable, Reactor, SimulatedMultiplexer};
use netprobe::Result;
use proptest::prelude::*;

/// Reads from a socket until it sees `bye`, then closes itself.
struct LineReader {
    stream: RefCell<UnixStream>,
    received: RefCell<Vec<u8>>,
    closed: Cell<bool>,
}

impl Pollable for LineReader {
    fn fileno(&self) -> Fileno {
        self.stream.borrow().as_raw_fd()
    }

    fn on_readable(&self, reactor: &mut Reactor) -> Result<()> {
        let mut buf = [0u8; 64];
        let n = self.stream.borrow_mut().read(&mut buf)?;
        self.received.borrow_mut().extend_from_slice(&buf[..n]);
        if n == 0 || self.received.borrow().ends_with(b"bye") {
            reactor.close(self.fileno());
        }
        Ok(())
    }

    fn on_close(&self, _reactor: &mut Reactor) {
        self.closed.set(true);
    }
}

/// Handle that never becomes ready; keeps the simulated loop waiting.
struct Idle;

impl Pollable for Idle {
    fn fileno(&self) -> Fileno {
        1000
    }
}

fn simulated() -> (Reactor, Rc<ManualClock>) {
    let clock = Rc::new(ManualClock::new());
    let mux = SimulatedMultiplexer::new(Rc::clone(&clock));
    let config = ReactorConfig {
        max_wait_secs: 1.0,
        watchdog_interval_secs: 0,
    };
    let reactor = Reactor::with_parts(&config, clock.clone(), Box::new(mux));
    (reactor, clock)
}

/// Test timers and socket readiness on the real loop
#[test]
fn test_socket_and_timers_until_close() {
    let (writer, reader) = UnixStream::pair().unwrap();
    reader.set_nonblocking(true).unwrap();

    let config = ReactorConfig {
        max_wait_secs: 0.05,
        watchdog_interval_secs: 10,
    };
    let mut reactor = Reactor::new(&config);
    let handler = Rc::new(LineReader {
        stream: RefCell::new(reader),
        received: RefCell::new(Vec::new()),
        closed: Cell::new(false),
    });
    reactor.register_readable(handler.clone());

    let writer = Rc::new(RefCell::new(writer));
    let w = Rc::clone(&writer);
    reactor.schedule_after(Duration::from_millis(5), move |_| {
        w.borrow_mut().write_all(b"hello ")?;
        Ok(())
    });
    let w = Rc::clone(&writer);
    reactor.schedule_after(Duration::from_millis(20), move |_| {
        w.borrow_mut().write_all(b"bye")?;
        Ok(())
    });

    reactor.run_forever().unwrap();

    assert!(handler.closed.get());
    assert_eq!(handler.received.borrow().as_slice(), b"hello bye");
    assert!(!reactor.has_handles());
    // The watchdog is still scheduled; the loop ended anyway.
    assert_eq!(reactor.task_count(), 1);
}

/// Test a handle closed from a timer callback ends the loop
#[test]
fn test_close_from_timer_stops_loop() {
    let (mut reactor, clock) = simulated();
    reactor.register_readable(Rc::new(Idle));
    reactor.schedule_periodic(Duration::from_millis(300), |_| Ok(()));
    reactor.schedule_after(Duration::from_millis(700), |reactor| {
        reactor.close(1000);
        Ok(())
    });

    reactor.run_forever().unwrap();
    assert_eq!(clock.now(), Duration::from_millis(700));
}

/// Run the simulated loop until `done` or a time bound.
fn drive(reactor: &mut Reactor, clock: &ManualClock, done: impl Fn() -> bool) {
    while !done() {
        assert!(clock.now() < Duration::from_secs(60), "loop did not settle");
        reactor.run_once().unwrap();
    }
}

proptest! {
    #[test]
    fn prop_tasks_fire_once_in_due_order(delays in prop::collection::vec(0u64..900, 1..40)) {
        let (mut reactor, clock) = simulated();
        reactor.register_readable(Rc::new(Idle));

        let fired = Rc::new(RefCell::new(Vec::new()));
        for (i, delay) in delays.iter().enumerate() {
            let fired = Rc::clone(&fired);
            reactor.schedule_after(Duration::from_millis(*delay), move |reactor| {
                fired.borrow_mut().push((i, reactor.now()));
                Ok(())
            });
        }

        let expected_len = delays.len();
        let f = Rc::clone(&fired);
        drive(&mut reactor, &clock, move || f.borrow().len() >= expected_len);
        // One more tick: nothing fires twice.
        reactor.run_once().unwrap();

        let fired = fired.borrow();
        prop_assert_eq!(fired.len(), delays.len());

        let mut expected: Vec<usize> = (0..delays.len()).collect();
        expected.sort_by_key(|i| delays[*i]);
        let order: Vec<usize> = fired.iter().map(|(i, _)| *i).collect();
        prop_assert_eq!(order, expected);

        for (i, at) in fired.iter() {
            prop_assert!(*at >= Duration::from_millis(delays[*i]));
        }
        prop_assert!(fired.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn prop_reschedule_keeps_one_task(delays in prop::collection::vec(1u64..900, 1..10)) {
        let (mut reactor, clock) = simulated();
        reactor.register_readable(Rc::new(Idle));

        let fired = Rc::new(RefCell::new(Vec::new()));
        let f = Rc::clone(&fired);
        let handle = reactor.schedule_after(Duration::from_millis(delays[0]), move |reactor| {
            f.borrow_mut().push(reactor.now());
            Ok(())
        });
        for delay in &delays[1..] {
            prop_assert!(reactor.reschedule(&handle, Duration::from_millis(*delay)));
        }
        prop_assert_eq!(reactor.task_count(), 1);

        let last = Duration::from_millis(*delays.last().unwrap());
        prop_assert_eq!(reactor.due_time(&handle), Some(last));

        drive(&mut reactor, &clock, || clock.now() >= Duration::from_secs(2));
        let fired = fired.borrow();
        prop_assert_eq!(fired.as_slice(), &[last]);
        drop(fired);
        prop_assert_eq!(reactor.task_count(), 0);
    }
}
