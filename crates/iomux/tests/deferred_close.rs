use std::cell::Cell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use iomux::{BindOps, Config, Endpoint, Notify, ProtocolId, Runtime};

const DEADLINE: Duration = Duration::from_secs(10);

/// Passive peer that accepts one connection and holds it open so the close
/// under test is always locally initiated.
fn spawn_passive_peer() -> (std::net::SocketAddr, thread::JoinHandle<()>) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let _conn = listener.accept();
        thread::sleep(Duration::from_millis(500));
    });
    (addr, handle)
}

#[test]
#[should_panic(expected = "send on closed")]
fn send_after_close_in_same_turn_is_fatal() {
    let (addr, _peer) = spawn_passive_peer();
    let mut rt = Runtime::new(Config::default());

    rt.connect(
        ProtocolId::StreamSocketTcp,
        None,
        &Endpoint::from(addr),
        BindOps::new(|rt, bind, notify| {
            if matches!(notify, Notify::Connected) {
                rt.close(bind);
                // Still inside the same turn: the bind is closing and any
                // further send is a contract violation.
                rt.send(bind, b"too late");
            }
        }),
    );

    let deadline = Instant::now() + DEADLINE;
    loop {
        assert!(Instant::now() < deadline, "test timed out");
        rt.wait(100);
    }
}

#[test]
fn close_alone_defers_disconnect() {
    let (addr, peer) = spawn_passive_peer();
    let mut rt = Runtime::new(Config::default());

    let closed = Rc::new(Cell::new(false));
    let disconnected = Rc::new(Cell::new(false));
    {
        let closed = Rc::clone(&closed);
        let disconnected = Rc::clone(&disconnected);
        rt.connect(
            ProtocolId::StreamSocketTcp,
            None,
            &Endpoint::from(addr),
            BindOps::new(move |rt, bind, notify| match notify {
                Notify::Connected => {
                    rt.close(bind);
                    rt.close(bind); // idempotent: arming an armed deferral
                    // Teardown is deferred: nothing has been freed yet.
                    closed.set(true);
                }
                Notify::Disconnected { status } => {
                    assert!(closed.get());
                    assert_eq!(*status, 0);
                    assert!(!disconnected.get(), "Disconnected delivered twice");
                    disconnected.set(true);
                }
                _ => {}
            }),
        );
    }

    let deadline = Instant::now() + DEADLINE;
    while !disconnected.get() {
        assert!(Instant::now() < deadline, "test timed out");
        rt.wait(100);
    }
    peer.join().unwrap();
}
