#![cfg(unix)]

use std::os::unix::io::IntoRawFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use iomux::{
    Listener, Poller, PollerFactory, SocketFlags, Transport, TransportFactory, TransportFlags,
};

mod util;

use util::{init, read_some, Happened, Pipe, Recorder, LONG, SHORT};

#[test]
fn is_send_and_sync() {
    util::assert_send::<Arc<Poller>>();
    util::assert_sync::<Arc<Poller>>();
    util::assert_send::<Arc<Transport>>();
    util::assert_sync::<Arc<Transport>>();
}

#[test]
fn pipe_readiness_echo() {
    init();
    let poller = PollerFactory::create().expect("unable to create poller");
    let mut pipe = Pipe::new();
    let transport = TransportFactory::from_descriptor(pipe.take_read(), TransportFlags::NONE)
        .expect("unable to wrap pipe");
    let recorder = Recorder::new();
    poller
        .attach(&transport, recorder.clone(), TransportFlags::READING)
        .expect("unable to attach");

    pipe.write_all(b"hello");
    poller.poll(Some(LONG)).expect("poll failed");
    assert_eq!(recorder.take(), vec![Happened::ReadReady]);

    let data = read_some(transport.raw().unwrap(), 16);
    assert_eq!(data, b"hello");

    transport.close();
    assert!(transport.is_closed());
    poller.poll(Some(Duration::ZERO)).expect("poll failed");
    assert_eq!(recorder.take(), vec![]);
}

#[test]
fn hangup_auto_detaches() {
    init();
    let poller = PollerFactory::create().expect("unable to create poller");
    let (local, peer) = UnixStream::pair().expect("unable to create socket pair");
    let transport =
        TransportFactory::from_socket(local.into_raw_fd(), SocketFlags::NONE).unwrap();
    let recorder = Recorder::new();
    poller
        .attach(&transport, recorder.clone(), TransportFlags::READING)
        .unwrap();

    drop(peer);
    poller.poll(Some(LONG)).expect("poll failed");
    assert_eq!(recorder.take(), vec![Happened::Hangup]);
    assert!(!transport.is_attached());

    // The transport was detached before the callback ran; nothing more is
    // delivered and interest changes are a no-op.
    poller.poll(Some(Duration::ZERO)).expect("poll failed");
    assert_eq!(recorder.take(), vec![]);
    poller
        .change_events(&transport, TransportFlags::WRITING)
        .expect("change_events after auto-detach should be a no-op");
    poller.poll(Some(Duration::ZERO)).expect("poll failed");
    assert_eq!(recorder.take(), vec![]);
}

#[test]
fn edge_triggered_delivers_one_notification_per_edge() {
    init();
    // The default backend on every supported Unix (epoll or kqueue)
    // handles edge-triggered registrations.
    let poller = PollerFactory::create().expect("unable to create poller");
    let mut pipe = Pipe::new();
    let transport =
        TransportFactory::from_descriptor(pipe.take_read(), TransportFlags::NONE).unwrap();
    let recorder = Recorder::new();
    poller
        .attach(
            &transport,
            recorder.clone(),
            TransportFlags::READING | TransportFlags::EDGE_TRIGGERED,
        )
        .unwrap();

    pipe.write_all(b"0123456789");
    poller.poll(Some(LONG)).expect("poll failed");
    assert_eq!(recorder.take(), vec![Happened::ReadReady]);

    // Only half the payload is drained: no new edge, no new notification.
    let data = read_some(transport.raw().unwrap(), 5);
    assert_eq!(data.len(), 5);
    poller.poll(Some(SHORT)).expect("poll failed");
    assert_eq!(recorder.take(), vec![]);

    // Another write is another edge.
    pipe.write_all(b"x");
    poller.poll(Some(LONG)).expect("poll failed");
    assert_eq!(recorder.take(), vec![Happened::ReadReady]);
}

#[test]
fn level_triggered_repeats_until_drained() {
    init();
    let poller = PollerFactory::create().unwrap();
    let mut pipe = Pipe::new();
    let transport =
        TransportFactory::from_descriptor(pipe.take_read(), TransportFlags::NONE).unwrap();
    let recorder = Recorder::new();
    poller
        .attach(&transport, recorder.clone(), TransportFlags::READING)
        .unwrap();

    pipe.write_all(b"abc");
    poller.poll(Some(LONG)).unwrap();
    poller.poll(Some(LONG)).unwrap();
    assert_eq!(
        recorder.take(),
        vec![Happened::ReadReady, Happened::ReadReady]
    );
}

#[test]
fn dropped_interest_is_filtered() {
    init();
    let poller = PollerFactory::create().unwrap();
    let (local, _peer) = UnixStream::pair().unwrap();
    let transport =
        TransportFactory::from_socket(local.into_raw_fd(), SocketFlags::NONE).unwrap();
    let recorder = Recorder::new();
    poller
        .attach(
            &transport,
            recorder.clone(),
            TransportFlags::READING | TransportFlags::WRITING,
        )
        .unwrap();

    // A fresh socket is writable.
    poller.poll(Some(LONG)).unwrap();
    assert_eq!(recorder.take(), vec![Happened::WriteReady]);

    // After dropping write interest no write callback may fire again.
    poller
        .change_events(&transport, TransportFlags::READING)
        .unwrap();
    poller.poll(Some(Duration::ZERO)).unwrap();
    poller.poll(Some(Duration::ZERO)).unwrap();
    assert_eq!(recorder.take(), vec![]);
}

#[test]
fn change_events_on_unattached_transport_is_an_error() {
    init();
    let poller = PollerFactory::create().unwrap();
    let mut pipe = Pipe::new();
    let transport =
        TransportFactory::from_descriptor(pipe.take_read(), TransportFlags::NONE).unwrap();
    assert!(poller
        .change_events(&transport, TransportFlags::READING)
        .is_err());
}

#[test]
fn poll_zero_never_blocks() {
    init();
    let poller = PollerFactory::create().unwrap();
    let mut pipe = Pipe::new();
    let transport =
        TransportFactory::from_descriptor(pipe.take_read(), TransportFlags::NONE).unwrap();
    poller
        .attach(&transport, Recorder::new(), TransportFlags::READING)
        .unwrap();

    let start = Instant::now();
    poller.poll(Some(Duration::ZERO)).unwrap();
    assert!(start.elapsed() < SHORT, "Poll(0) blocked");
}

#[test]
fn explicit_detach_stops_delivery_and_is_idempotent() {
    init();
    let poller = PollerFactory::create().unwrap();
    let mut pipe = Pipe::new();
    let transport =
        TransportFactory::from_descriptor(pipe.take_read(), TransportFlags::NONE).unwrap();
    let recorder = Recorder::new();
    poller
        .attach(&transport, recorder.clone(), TransportFlags::READING)
        .unwrap();

    pipe.write_all(b"pending");
    poller.detach(&transport);
    poller.detach(&transport);
    assert!(!transport.is_attached());

    poller.poll(Some(Duration::ZERO)).unwrap();
    assert_eq!(recorder.take(), vec![]);
}

/// Closes its victim and re-keys the freed slot with the shared
/// replacement the first time it becomes readable.
struct SlotThief {
    poller: Weak<Poller>,
    victim: Mutex<Option<Arc<Transport>>>,
    replacement: Arc<Mutex<Option<(Arc<Transport>, Arc<Recorder>)>>>,
    recorder: Arc<Recorder>,
}

impl Listener for SlotThief {
    fn on_read_ready(&self, transport: &Arc<Transport>) {
        self.recorder.on_read_ready(transport);
        if let Some(victim) = self.victim.lock().unwrap().take() {
            victim.close();
        }
        if let Some((transport, recorder)) = self.replacement.lock().unwrap().take() {
            let poller = self.poller.upgrade().unwrap();
            poller
                .attach(&transport, recorder, TransportFlags::READING)
                .expect("re-attach into the freed slot failed");
        }
    }
}

// A listener callback may close a transport whose slot is reused within
// the same drain; events collected for the previous occupant must not
// reach the new one.
#[test]
fn events_for_rekeyed_slots_are_dropped_mid_drain() {
    init();
    let poller = PollerFactory::create().unwrap();
    let mut pipe_a = Pipe::new();
    let mut pipe_b = Pipe::new();
    let mut pipe_c = Pipe::new();

    let a = TransportFactory::from_descriptor(pipe_a.take_read(), TransportFlags::NONE).unwrap();
    let b = TransportFactory::from_descriptor(pipe_b.take_read(), TransportFlags::NONE).unwrap();
    let c = TransportFactory::from_descriptor(pipe_c.take_read(), TransportFlags::NONE).unwrap();

    let recorder = Recorder::new();
    let fresh = Recorder::new();
    let replacement = Arc::new(Mutex::new(Some((Arc::clone(&c), Arc::clone(&fresh)))));

    // The two transports conspire: whichever fires first closes the other
    // and re-keys the freed slot with `c`.
    poller
        .attach(
            &a,
            Arc::new(SlotThief {
                poller: Arc::downgrade(&poller),
                victim: Mutex::new(Some(Arc::clone(&b))),
                replacement: Arc::clone(&replacement),
                recorder: Arc::clone(&recorder),
            }),
            TransportFlags::READING,
        )
        .unwrap();
    poller
        .attach(
            &b,
            Arc::new(SlotThief {
                poller: Arc::downgrade(&poller),
                victim: Mutex::new(Some(Arc::clone(&a))),
                replacement: Arc::clone(&replacement),
                recorder: Arc::clone(&recorder),
            }),
            TransportFlags::READING,
        )
        .unwrap();

    // Make both readable before the drain so the batch holds two events.
    pipe_a.write_all(b"a");
    pipe_b.write_all(b"b");
    pipe_c.write_all(b"c");
    poller.poll(Some(LONG)).unwrap();

    // Exactly one of the two original transports fired; the residual
    // event for the closed one was not delivered to the re-keyed slot.
    assert_eq!(recorder.take(), vec![Happened::ReadReady]);
    assert_eq!(fresh.take(), vec![]);

    // The replacement is live and picks up its pending data on the next
    // drain.
    poller.poll(Some(LONG)).unwrap();
    assert_eq!(fresh.take(), vec![Happened::ReadReady]);
}

#[test]
fn poll_backend_full_stack() {
    init();
    let poller = PollerFactory::create_poll().unwrap();
    assert_eq!(poller.backend_name(), "poll");
    let mut pipe = Pipe::new();
    let transport =
        TransportFactory::from_descriptor(pipe.take_read(), TransportFlags::NONE).unwrap();
    let recorder = Recorder::new();
    poller
        .attach(&transport, recorder.clone(), TransportFlags::READING)
        .unwrap();

    pipe.write_all(b"via poll");
    poller.poll(Some(LONG)).unwrap();
    assert_eq!(recorder.take(), vec![Happened::ReadReady]);

    transport.close();
    poller.poll(Some(Duration::ZERO)).unwrap();
    assert_eq!(recorder.take(), vec![]);
}

#[test]
fn select_backend_full_stack() {
    init();
    let poller = PollerFactory::create_select().unwrap();
    assert_eq!(poller.backend_name(), "select");
    let mut pipe = Pipe::new();
    let transport =
        TransportFactory::from_descriptor(pipe.take_read(), TransportFlags::NONE).unwrap();
    let recorder = Recorder::new();
    poller
        .attach(&transport, recorder.clone(), TransportFlags::READING)
        .unwrap();

    pipe.write_all(b"via select");
    poller.poll(Some(LONG)).unwrap();
    assert_eq!(recorder.take(), vec![Happened::ReadReady]);
}

#[test]
fn select_backend_refuses_large_descriptors() {
    init();
    let poller = PollerFactory::create_select().unwrap();
    let mut pipe = Pipe::new();

    // Move the descriptor at (or past) FD_SETSIZE if the fd limit allows;
    // otherwise the in-range attach below still covers the happy path.
    let high = unsafe { libc::dup2(pipe.read, libc::FD_SETSIZE as i32) };
    if high != -1 {
        let transport =
            TransportFactory::from_descriptor(high, TransportFlags::NONE).unwrap();
        let err = poller
            .attach(&transport, Recorder::new(), TransportFlags::READING)
            .unwrap_err();
        assert!(matches!(err, iomux::Error::Logical(_)), "got {:?}", err);
    }

    let transport =
        TransportFactory::from_descriptor(pipe.take_read(), TransportFlags::NONE).unwrap();
    poller
        .attach(&transport, Recorder::new(), TransportFlags::READING)
        .unwrap();
}

#[test]
fn edge_triggered_is_logical_error_on_stateless_backends() {
    init();
    for poller in [
        PollerFactory::create_poll().unwrap(),
        PollerFactory::create_select().unwrap(),
    ] {
        let mut pipe = Pipe::new();
        let transport =
            TransportFactory::from_descriptor(pipe.take_read(), TransportFlags::NONE).unwrap();
        let err = poller
            .attach(
                &transport,
                Recorder::new(),
                TransportFlags::READING | TransportFlags::EDGE_TRIGGERED,
            )
            .unwrap_err();
        assert!(matches!(err, iomux::Error::Logical(_)));
    }
}
