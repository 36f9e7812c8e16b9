//! Strand Echo Server
//!
//! TCP echo server written as plain blocking code; every connection is
//! one fiber, every blocking call parks the fiber instead of a thread.
//!
//! Usage:
//!     cargo build --release -p strand-echo
//!     ./target/release/strand-echo [port] [workers]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999
//!
//!     # many concurrent clients:
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q0 localhost 9999 & done

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use strand::{scheduler, IoScheduler, NetListener, NetStream, SchedulerConfig};

const BUF_SIZE: usize = 4096;

static CONNS: AtomicU64 = AtomicU64::new(0);
static BYTES: AtomicU64 = AtomicU64::new(0);

fn handle_connection(stream: NetStream) {
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break, // peer closed
            Ok(n) => n,
            Err(e) => {
                eprintln!("read error: {}", e);
                break;
            }
        };
        BYTES.fetch_add(n as u64, Ordering::Relaxed);
        if let Err(e) = stream.write_all(&buf[..n]) {
            eprintln!("write error: {}", e);
            break;
        }
    }
}

fn accept_loop(iom: Arc<IoScheduler>, port: u16) {
    let listener = match NetListener::bind(port, 1024) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("bind({}) failed: {}", port, e);
            std::process::exit(1);
        }
    };
    eprintln!("strand-echo: listening on 0.0.0.0:{}", port);

    loop {
        match listener.accept() {
            Ok(stream) => {
                let total = CONNS.fetch_add(1, Ordering::Relaxed) + 1;
                if total % 1000 == 0 {
                    eprintln!(
                        "strand-echo: {} connections, {} bytes echoed",
                        total,
                        BYTES.load(Ordering::Relaxed)
                    );
                }
                scheduler::spawn(&iom, move || handle_connection(stream));
            }
            Err(e) => {
                eprintln!("accept failed: {}", e);
            }
        }
    }
}

fn main() {
    let mut args = std::env::args().skip(1);
    let port: u16 = args.next().and_then(|a| a.parse().ok()).unwrap_or(9999);
    let workers: usize = args.next().and_then(|a| a.parse().ok()).unwrap_or(4);

    let iom = IoScheduler::with_config(
        SchedulerConfig::new()
            .workers(workers)
            .hook_io(true)
            .name("echo"),
    )
    .expect("failed to start reactor");

    let accept_iom = iom.clone();
    scheduler::spawn(&iom, move || accept_loop(accept_iom, port));

    // the reactor owns all the work; this thread just stays out of the way
    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
    }
}
