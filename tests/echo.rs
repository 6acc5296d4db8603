//! End-to-end echo tests: one byte stream in, the same byte stream out, with
//! the full connection lifecycle observed through user callbacks.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use millrace::{EventLoopThread, TcpConnection, TcpServer, TcpServerConfig};

fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn echo_round_trip_with_one_connect_and_one_disconnect() {
    let main_thread = EventLoopThread::start("echo-main").unwrap();
    let config = TcpServerConfig::builder()
        .address("127.0.0.1:0".parse().unwrap())
        .name("echo")
        .io_threads(2)
        .build();
    let server = TcpServer::new(main_thread.event_loop(), config).unwrap();

    let connected = Arc::new(AtomicUsize::new(0));
    let disconnected = Arc::new(AtomicUsize::new(0));
    {
        let connected = connected.clone();
        let disconnected = disconnected.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                connected.fetch_add(1, Ordering::SeqCst);
            } else {
                disconnected.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    server.set_message_callback(Arc::new(|conn, buffer, _receive_time| {
        let data = buffer.retrieve_all_as_string();
        conn.send(data.as_bytes());
    }));
    server.start().unwrap();

    let mut client = TcpStream::connect(server.listen_addr()).unwrap();
    client.write_all(b"hello").unwrap();
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello");
    drop(client);

    wait_until("disconnect callback", || {
        disconnected.load(Ordering::SeqCst) == 1
    });
    assert_eq!(connected.load(Ordering::SeqCst), 1);
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    wait_until("registry cleanup", || server.connection_count() == 0);
}

#[test]
fn echo_many_clients_across_sub_loops() {
    let main_thread = EventLoopThread::start("echo-many-main").unwrap();
    let config = TcpServerConfig::builder()
        .address("127.0.0.1:0".parse().unwrap())
        .name("echo-many")
        .io_threads(3)
        .build();
    let server = TcpServer::new(main_thread.event_loop(), config).unwrap();
    server.set_message_callback(Arc::new(|conn, buffer, _| {
        let data = buffer.retrieve_all_as_string();
        conn.send(data.as_bytes());
    }));
    server.start().unwrap();
    let addr = server.listen_addr();

    let workers: Vec<_> = (0..8)
        .map(|i| {
            thread::spawn(move || {
                let mut client = TcpStream::connect(addr).unwrap();
                let message = format!("client-{i}");
                client.write_all(message.as_bytes()).unwrap();
                let mut reply = vec![0u8; message.len()];
                client.read_exact(&mut reply).unwrap();
                assert_eq!(reply, message.as_bytes());
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    wait_until("all clients gone", || server.connection_count() == 0);
}

#[test]
fn cross_thread_send_emits_byte_exactly_once() {
    let main_thread = EventLoopThread::start("xthread-main").unwrap();
    let config = TcpServerConfig::builder()
        .address("127.0.0.1:0".parse().unwrap())
        .name("xthread")
        .io_threads(1)
        .build();
    let server = TcpServer::new(main_thread.event_loop(), config).unwrap();

    let slot: Arc<Mutex<Option<Arc<TcpConnection>>>> = Arc::new(Mutex::new(None));
    {
        let slot = slot.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                *slot.lock().unwrap() = Some(conn.clone());
            }
        }));
    }
    server.start().unwrap();

    let mut client = TcpStream::connect(server.listen_addr()).unwrap();
    wait_until("connection established", || slot.lock().unwrap().is_some());
    let conn = slot.lock().unwrap().clone().unwrap();

    // This thread is not the connection's loop thread; the send must be
    // marshalled onto it.
    assert!(!conn.owner_loop().is_in_loop_thread());
    conn.send(b"x");

    let mut byte = [0u8; 1];
    client.read_exact(&mut byte).unwrap();
    assert_eq!(&byte, b"x");

    // Nothing further arrives: the byte was emitted exactly once.
    client
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut extra = [0u8; 1];
    match client.read(&mut extra) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected extra {n} bytes"),
        Err(e) => assert!(
            e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut
        ),
    }
}
