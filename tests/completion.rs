#![cfg(windows)]

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::os::windows::io::IntoRawSocket;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use iomux::completion::{IoContext, IoListener, IoResult, Poller, Transport, TransportFactory};
use iomux::TransportFlags;

const LONG: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct Completions {
    reads: Mutex<Vec<IoResult>>,
}

impl Completions {
    fn new() -> Arc<Completions> {
        Arc::new(Completions::default())
    }

    fn take_reads(&self) -> Vec<IoResult> {
        std::mem::take(&mut *self.reads.lock().unwrap())
    }
}

impl IoListener for Completions {
    fn on_read(&self, _transport: &Arc<Transport>, result: IoResult) {
        self.reads.lock().unwrap().push(result);
    }
}

/// A connected socket pair; the peer is driven with std I/O.
fn socket_pair() -> (Arc<Transport>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = thread::spawn(move || TcpStream::connect(addr).unwrap());
    let (accepted, _) = listener.accept().unwrap();
    let peer = peer.join().unwrap();
    let transport =
        TransportFactory::from_socket(accepted.into_raw_socket(), TransportFlags::NONE).unwrap();
    (transport, peer)
}

fn wait_for_buffered_data() {
    // Give the kernel a moment to move the peer's bytes into the socket's
    // receive buffer so the read below completes synchronously.
    thread::sleep(Duration::from_millis(200));
}

#[test]
fn immediate_completion_with_deferred_notification() {
    let poller = Poller::new().unwrap();
    let (transport, mut peer) = socket_pair();
    let completions = Completions::new();
    poller.attach(&transport, completions.clone()).unwrap();

    peer.write_all(b"12345678").unwrap();
    wait_for_buffered_data();

    let context = IoContext::new(7);
    let mut buf = [0u8; 64];
    let result = unsafe { transport.read(&context, buf.as_mut_ptr(), buf.len()) };
    assert!(result.is_ok(), "read failed: {:?}", result.error);
    assert!(result.completed);
    assert_eq!(result.bytes, 8);
    // Without immediate delivery the context stays with the kernel queue
    // until the notification is drained.
    assert!(result.context.is_none());
    assert_eq!(poller.pending_operations(), 1);

    // The queued completion arrives exactly once and hands the context
    // back.
    poller.poll(Some(LONG)).unwrap();
    let delivered = completions.take_reads();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].completed);
    assert_eq!(delivered[0].bytes, 8);
    let returned = delivered[0].context.as_ref().unwrap();
    assert_eq!(returned.user_data(), 7);
    assert_eq!(poller.pending_operations(), 0);

    poller.poll(Some(Duration::ZERO)).unwrap();
    assert!(completions.take_reads().is_empty());
}

#[test]
fn immediate_completion_with_immediate_delivery() {
    let poller = Poller::new().unwrap();
    assert!(poller.enable_immediate_delivery());
    let (transport, mut peer) = socket_pair();
    let completions = Completions::new();
    poller.attach(&transport, completions.clone()).unwrap();
    assert!(transport.immediate_delivery());

    peer.write_all(b"12345678").unwrap();
    wait_for_buffered_data();

    let context = IoContext::new(11);
    let mut buf = [0u8; 64];
    let result = unsafe { transport.read(&context, buf.as_mut_ptr(), buf.len()) };
    assert!(result.is_ok(), "read failed: {:?}", result.error);
    assert!(result.completed);
    assert_eq!(result.bytes, 8);
    assert_eq!(&buf[..8], b"12345678");
    // The context comes straight back; no completion is posted.
    let returned = result.context.as_ref().unwrap();
    assert_eq!(returned.user_data(), 11);
    assert_eq!(poller.pending_operations(), 0);

    poller.poll(Some(Duration::from_millis(200))).unwrap();
    assert!(completions.take_reads().is_empty());
}

#[test]
fn pending_read_completes_through_poll() {
    let poller = Poller::new().unwrap();
    let (transport, mut peer) = socket_pair();
    let completions = Completions::new();
    poller.attach(&transport, completions.clone()).unwrap();

    // No data yet: the operation must go pending.
    let context = IoContext::new(0);
    let mut buf = [0u8; 64];
    let result = unsafe { transport.read(&context, buf.as_mut_ptr(), buf.len()) };
    assert!(result.is_ok());
    assert!(!result.completed);
    assert!(result.context.is_none());

    peer.write_all(b"later").unwrap();
    poller.poll(Some(LONG)).unwrap();
    let delivered = completions.take_reads();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].bytes, 5);
    assert_eq!(&buf[..5], b"later");
}

#[test]
fn zero_byte_read_reports_ended() {
    let poller = Poller::new().unwrap();
    let (transport, peer) = socket_pair();
    let completions = Completions::new();
    poller.attach(&transport, completions.clone()).unwrap();

    let context = IoContext::new(0);
    let mut buf = [0u8; 16];
    let result = unsafe { transport.read(&context, buf.as_mut_ptr(), buf.len()) };
    assert!(!result.completed);

    // Peer performs an orderly shutdown; the pending read completes with
    // zero bytes.
    drop(peer);
    poller.poll(Some(LONG)).unwrap();
    let delivered = completions.take_reads();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].ended, "0-byte read should set `ended`");
    assert_eq!(delivered[0].bytes, 0);
}

#[test]
fn context_cannot_run_two_operations() {
    let poller = Poller::new().unwrap();
    let (transport, _peer) = socket_pair();
    poller.attach(&transport, Completions::new()).unwrap();

    let context = IoContext::new(0);
    let mut buf = [0u8; 16];
    let pending = unsafe { transport.read(&context, buf.as_mut_ptr(), buf.len()) };
    assert!(pending.is_ok());
    assert!(!pending.completed);

    let mut other = [0u8; 16];
    let reused = unsafe { transport.read(&context, other.as_mut_ptr(), other.len()) };
    assert!(reused.error.is_some(), "linked context was accepted again");

    // The first operation is still pending against the stack buffer;
    // drain it before the buffer goes out of scope.
    transport.close();
    poller.wait_and_discard_pending_events();
}

#[test]
fn completions_for_closed_transports_are_discarded() {
    let poller = Poller::new().unwrap();
    let (transport, mut peer) = socket_pair();
    let completions = Completions::new();
    poller.attach(&transport, completions.clone()).unwrap();

    let context = IoContext::new(0);
    let mut buf = [0u8; 16];
    let result = unsafe { transport.read(&context, buf.as_mut_ptr(), buf.len()) };
    assert!(!result.completed);

    // Closing does not cancel the operation; the completion is received
    // and dropped instead of being delivered.
    transport.close();
    peer.write_all(b"too late").unwrap();
    poller.wait_and_discard_pending_events();
    assert_eq!(poller.pending_operations(), 0);
    assert!(completions.take_reads().is_empty());
}
