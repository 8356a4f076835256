use std::cell::Cell;
use std::io::Read;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use iomux::{BindOps, Config, Endpoint, Notify, ProtocolId, Runtime};

const TOTAL: usize = 1 << 20;
const CHUNK: usize = 16 * 1024;
const DEADLINE: Duration = Duration::from_secs(30);

/// Slow reader: 4 KiB per read with a pause, so the sender's ring has to
/// absorb the whole megabyte and drain it across many short writes.
fn spawn_slow_reader() -> (std::net::SocketAddr, thread::JoinHandle<(usize, u64)>) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = vec![0_u8; 4096];
        let mut total = 0_usize;
        let mut checksum = 0_u64;
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    for b in &buf[..n] {
                        checksum = checksum.wrapping_add(u64::from(*b));
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Err(_) => break,
            }
        }
        (total, checksum)
    });
    (addr, handle)
}

#[test]
fn backpressure_drains_without_loss() {
    let (addr, reader) = spawn_slow_reader();

    // Tiny socket buffers and a tiny initial ring force both the partial
    // write path and ring growth.
    let cfg = Config::default().with_socket_buf_size(4096).with_ring_size(4);
    let mut rt = Runtime::new(cfg);

    let sent = Rc::new(Cell::new(0_u64));
    let done = Rc::new(Cell::new(false));
    let bind = {
        let sent = Rc::clone(&sent);
        let done = Rc::clone(&done);
        rt.connect(
            ProtocolId::StreamSocketTcp,
            None,
            &Endpoint::from(addr),
            BindOps::new(move |_rt, _bind, notify| match notify {
                Notify::Sent { bytes, .. } => sent.set(sent.get() + bytes),
                Notify::Disconnected { status } => {
                    assert_eq!(*status, 0);
                    done.set(true);
                }
                _ => {}
            }),
        )
    };
    rt.request_send_notifications(bind);

    let mut expect_checksum = 0_u64;
    for i in 0..TOTAL / CHUNK {
        let fill = (i % 251) as u8;
        let chunk = vec![fill; CHUNK];
        expect_checksum = expect_checksum.wrapping_add(u64::from(fill) * CHUNK as u64);
        rt.send(bind, &chunk);
    }
    rt.finish(bind);

    let deadline = Instant::now() + DEADLINE;
    while !done.get() {
        assert!(Instant::now() < deadline, "drain timed out");
        rt.wait(100);
    }
    // Sent notifications account for every byte exactly once.
    assert_eq!(sent.get(), TOTAL as u64);

    let (total, checksum) = reader.join().unwrap();
    assert_eq!(total, TOTAL);
    assert_eq!(checksum, expect_checksum);
}
