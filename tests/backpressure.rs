//! Partial-write and flow-control behavior: a send far larger than the
//! kernel buffer must queue, arm write interest, drain under readiness, and
//! fire exactly one write-complete; the high-water callback fires only on
//! the upward crossing.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use millrace::{EventLoopThread, TcpServer, TcpServerConfig};

const PAYLOAD_LEN: usize = 16 * 1024 * 1024;

fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

fn drain(client: &mut TcpStream, expected: usize) -> usize {
    let mut total = 0;
    let mut chunk = vec![0u8; 256 * 1024];
    while total < expected {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) => panic!("client read failed: {e}"),
        }
    }
    total
}

#[test]
fn large_send_drains_with_exactly_one_write_complete() {
    let main_thread = EventLoopThread::start("bp-main").unwrap();
    let config = TcpServerConfig::builder()
        .address("127.0.0.1:0".parse().unwrap())
        .name("bp")
        .io_threads(1)
        .build();
    let server = TcpServer::new(main_thread.event_loop(), config).unwrap();

    let write_completes = Arc::new(AtomicUsize::new(0));
    {
        let write_completes = write_completes.clone();
        server.set_write_complete_callback(Arc::new(move |_conn| {
            write_completes.fetch_add(1, Ordering::SeqCst);
        }));
    }
    server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            // One send, far beyond what the kernel accepts in a single call.
            conn.send(&vec![b'A'; PAYLOAD_LEN]);
        }
    }));
    server.start().unwrap();

    let mut client = TcpStream::connect(server.listen_addr()).unwrap();
    let received = drain(&mut client, PAYLOAD_LEN);
    assert_eq!(received, PAYLOAD_LEN);

    wait_until("write-complete callback", || {
        write_completes.load(Ordering::SeqCst) >= 1
    });
    assert_eq!(write_completes.load(Ordering::SeqCst), 1);
}

#[test]
fn high_water_mark_fires_once_on_upward_crossing() {
    let main_thread = EventLoopThread::start("hw-main").unwrap();
    let config = TcpServerConfig::builder()
        .address("127.0.0.1:0".parse().unwrap())
        .name("hw")
        .io_threads(1)
        .build();
    let server = TcpServer::new(main_thread.event_loop(), config).unwrap();

    const HIGH_WATER: usize = 1024 * 1024;
    const SECOND_SEND: usize = 2 * 1024 * 1024;

    let high_water_hits = Arc::new(AtomicUsize::new(0));
    let reported_size = Arc::new(AtomicUsize::new(0));
    let write_completes = Arc::new(AtomicUsize::new(0));
    {
        let hits = high_water_hits.clone();
        let reported = reported_size.clone();
        server.set_high_water_mark_callback(Arc::new(move |_conn, size| {
            hits.fetch_add(1, Ordering::SeqCst);
            reported.store(size, Ordering::SeqCst);
        }));
    }
    {
        let write_completes = write_completes.clone();
        server.set_write_complete_callback(Arc::new(move |_conn| {
            write_completes.fetch_add(1, Ordering::SeqCst);
        }));
    }
    server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            conn.set_high_water_mark(HIGH_WATER);
            // First send crosses the mark; the second lands while still
            // above it and must not refire the callback. Both run on the
            // loop thread before any drain can happen in between.
            conn.send(&vec![b'B'; PAYLOAD_LEN]);
            conn.send(&vec![b'C'; SECOND_SEND]);
        }
    }));
    server.start().unwrap();

    let mut client = TcpStream::connect(server.listen_addr()).unwrap();
    let expected = PAYLOAD_LEN + SECOND_SEND;
    let received = drain(&mut client, expected);
    assert_eq!(received, expected);

    wait_until("write-complete callback", || {
        write_completes.load(Ordering::SeqCst) >= 1
    });
    assert_eq!(high_water_hits.load(Ordering::SeqCst), 1, "no refire while above the mark");
    assert!(
        reported_size.load(Ordering::SeqCst) >= HIGH_WATER,
        "callback reports the new queued total"
    );
    assert_eq!(write_completes.load(Ordering::SeqCst), 1);
}
