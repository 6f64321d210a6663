#![cfg(unix)]

use std::time::Duration;

use iomux::{PollerFactory, TransportFactory, TransportFlags};

mod util;

use util::{init, Happened, Pipe, Recorder};

#[cfg(any(target_os = "linux", target_os = "android"))]
#[test]
fn create_picks_epoll_on_modern_kernels() {
    init();
    // Every kernel the tests can run on is far past 2.5.44.
    let poller = PollerFactory::create().unwrap();
    assert_eq!(poller.backend_name(), "epoll");
}

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
#[test]
fn create_picks_kqueue() {
    init();
    let poller = PollerFactory::create().unwrap();
    assert_eq!(poller.backend_name(), "kqueue");
}

#[test]
fn explicit_fallback_backends() {
    init();
    assert_eq!(PollerFactory::create_poll().unwrap().backend_name(), "poll");
    assert_eq!(
        PollerFactory::create_select().unwrap().backend_name(),
        "select"
    );
}

// A fixed event-buffer capacity must not lose events; the surplus is
// simply collected by the next drain.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[test]
fn capped_event_buffer_still_delivers_everything() {
    init();
    let poller = PollerFactory::create_epoll_with_capacity(1).unwrap();
    let recorder = Recorder::new();

    let mut pipes = Vec::new();
    let mut transports = Vec::new();
    for _ in 0..3 {
        let mut pipe = Pipe::new();
        let transport =
            TransportFactory::from_descriptor(pipe.take_read(), TransportFlags::NONE).unwrap();
        poller
            .attach(&transport, recorder.clone(), TransportFlags::READING)
            .unwrap();
        pipe.write_all(b"x");
        pipes.push(pipe);
        transports.push(transport);
    }

    // At most one event per drain; three drains collect all three.
    for _ in 0..3 {
        poller.poll(Some(Duration::from_secs(1))).unwrap();
    }
    assert_eq!(recorder.take(), vec![Happened::ReadReady; 3]);
}

#[test]
fn negative_descriptor_is_rejected() {
    init();
    assert!(TransportFactory::from_descriptor(-1, TransportFlags::NONE).is_err());
}
