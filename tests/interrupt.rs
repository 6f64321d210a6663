#![cfg(unix)]

use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use iomux::{Poller, PollerFactory};

mod util;

use util::init;

fn wakes_blocked_poll(poller: Arc<Poller>) {
    let (sender, receiver) = channel();
    let handle = thread::spawn({
        let poller = Arc::clone(&poller);
        move || {
            // Block until interrupted.
            poller.poll(None).expect("poll failed");
            sender.send(()).unwrap();
        }
    });

    // Give the thread a moment to enter the kernel wait.
    thread::sleep(Duration::from_millis(100));
    poller.interrupt().expect("interrupt failed");

    receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("interrupt did not wake the blocked poll");
    handle.join().unwrap();
}

#[test]
fn interrupt_wakes_default_backend() {
    init();
    wakes_blocked_poll(PollerFactory::create().unwrap());
}

#[test]
fn interrupt_wakes_poll_backend() {
    init();
    wakes_blocked_poll(PollerFactory::create_poll().unwrap());
}

#[test]
fn interrupt_wakes_select_backend() {
    init();
    wakes_blocked_poll(PollerFactory::create_select().unwrap());
}

#[test]
fn interrupt_before_poll_does_not_linger() {
    init();
    let poller = PollerFactory::create().unwrap();
    poller.interrupt().unwrap();

    // The pending wake-up makes this poll return early...
    let start = Instant::now();
    poller.poll(Some(Duration::from_secs(5))).unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));

    // ...and is consumed by it: wake-ups do not accumulate.
    let start = Instant::now();
    poller.poll(Some(Duration::from_millis(200))).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(150));
}

#[test]
fn interrupts_from_many_threads_coalesce() {
    init();
    let poller = PollerFactory::create().unwrap();
    let mut handles = Vec::new();
    for _ in 0..4 {
        let poller = Arc::clone(&poller);
        handles.push(thread::spawn(move || {
            poller.interrupt().expect("interrupt failed");
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    // All pending wake-ups drain in one poll.
    poller.poll(Some(Duration::from_secs(1))).unwrap();
    let start = Instant::now();
    poller.poll(Some(Duration::from_millis(200))).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(150));
}
