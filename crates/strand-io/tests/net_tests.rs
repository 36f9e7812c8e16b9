//! Listener/stream round trips over the hooked stack

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use strand_io::{IoScheduler, NetListener, NetStream};
use strand_runtime::{scheduler, SchedulerConfig};

fn reactor(threads: usize, name: &str) -> Arc<IoScheduler> {
    IoScheduler::with_config(
        SchedulerConfig::new()
            .workers(threads)
            .hook_io(true)
            .name(name),
    )
    .unwrap()
}

#[test]
fn test_echo_roundtrip() {
    let iom = reactor(2, "echo");

    let (port_tx, port_rx) = mpsc::channel();
    scheduler::spawn(&iom, move || {
        let listener = NetListener::bind(0, 16).unwrap();
        port_tx.send(listener.local_port().unwrap()).unwrap();

        let stream = listener.accept().unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).unwrap();
        stream.write_all(&buf[..n]).unwrap();
    });
    let port = port_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let (tx, rx) = mpsc::channel();
    scheduler::spawn(&iom, move || {
        let stream = NetStream::connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).unwrap();
        stream.write_all(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).unwrap();
        tx.send((n, buf)).unwrap();
    });

    let (n, buf) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(&buf[..n], b"ping");

    scheduler::stop(&iom);
}

#[test]
fn test_stream_recv_timeout() {
    let iom = reactor(2, "net-timeo");

    let (port_tx, port_rx) = mpsc::channel();
    let (tx, rx) = mpsc::channel();
    scheduler::spawn(&iom, move || {
        let listener = NetListener::bind(0, 16).unwrap();
        port_tx.send(listener.local_port().unwrap()).unwrap();

        // accept, then never write; hold the stream open until the
        // client reports back
        let _stream = listener.accept().unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    });
    let port = port_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let (res_tx, res_rx) = mpsc::channel();
    scheduler::spawn(&iom, move || {
        let stream = NetStream::connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).unwrap();
        stream.set_recv_timeout_ms(100).unwrap();

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).unwrap_err();
        res_tx.send(err.raw_os_error()).unwrap();
        tx.send(()).unwrap();
    });

    let err = res_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(err, Some(libc::ETIMEDOUT));

    scheduler::stop(&iom);
}
