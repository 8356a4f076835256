use std::cell::Cell;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use iomux::{BindOps, Config, Endpoint, Notify, ProtocolId, Runtime};

const NITERS: u32 = 10_000;
const DEPTH: i64 = 100;
const DEADLINE: Duration = Duration::from_secs(30);

/// Echo server: every received datagram goes straight back to its source.
fn server_thread(ready: mpsc::Sender<(u16, iomux::StopHandle)>) {
    let mut rt = Runtime::new(Config::default());
    let local = Endpoint::new("127.0.0.1", 0).unwrap();
    let bind = rt.bind(
        ProtocolId::DatagramSocketUdp,
        &local,
        BindOps::new(|rt, bind, notify| {
            if let Notify::RecvMsg { iovecs, length, addr } = notify {
                assert_eq!(*length, 4);
                let mut value = [0_u8; 4];
                value.copy_from_slice(rt.bvec(&iovecs[0]));
                let src = addr.expect("datagram without source address");
                rt.sendto(bind, &Endpoint::from(src), &value);
            }
        }),
    );
    let port = rt.local_endpoint(bind).unwrap().port();
    ready.send((port, rt.stop_handle())).unwrap();
    rt.run();
}

#[test]
fn udp_bulk_echo() {
    let (ready_tx, ready_rx) = mpsc::channel();
    let server = thread::spawn(move || server_thread(ready_tx));
    let (port, server_stop) = ready_rx.recv().unwrap();
    let server_ep = Endpoint::new("127.0.0.1", port).unwrap();

    let mut rt = Runtime::new(Config::default());
    let recv = Rc::new(Cell::new(0_u32));
    let expected = Rc::new(Cell::new(1_u32));
    let inflight = Rc::new(Cell::new(0_i64));

    let local = Endpoint::new("127.0.0.1", 0).unwrap();
    let bind = {
        let recv = Rc::clone(&recv);
        let expected = Rc::clone(&expected);
        let inflight = Rc::clone(&inflight);
        rt.bind(
            ProtocolId::DatagramSocketUdp,
            &local,
            BindOps::new(move |rt, _bind, notify| match notify {
                Notify::Sent { msgs, .. } => {
                    inflight.set(inflight.get() - *msgs as i64);
                }
                Notify::RecvMsg { iovecs, length, .. } => {
                    assert_eq!(*length, 4);
                    let mut raw = [0_u8; 4];
                    raw.copy_from_slice(rt.bvec(&iovecs[0]));
                    let value = u32::from_le_bytes(raw);
                    // Echoes arrive in send order on this bind.
                    assert_eq!(value, expected.get());
                    expected.set(value + 1);
                    recv.set(recv.get() + 1);
                }
                _ => {}
            }),
        )
    };
    rt.request_send_notifications(bind);

    let deadline = Instant::now() + DEADLINE;
    let mut sent = 0_u32;
    let mut value = 1_u32;
    while sent < NITERS {
        while inflight.get() < DEPTH && sent < NITERS {
            rt.sendto(bind, &server_ep, &value.to_le_bytes());
            sent += 1;
            value += 1;
            inflight.set(inflight.get() + 1);
        }
        rt.wait(0);
        assert!(Instant::now() < deadline, "send phase timed out");
    }

    while recv.get() < NITERS {
        rt.wait(50);
        assert!(Instant::now() < deadline, "echo phase timed out");
    }
    assert_eq!(recv.get(), NITERS);

    server_stop.stop();
    server.join().unwrap();
}
