use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use iomux::{BindOps, Config, Endpoint, Notify, ProtocolId, Runtime};

const HELLO: &[u8] = b"Hello World!\0";
const DEADLINE: Duration = Duration::from_secs(10);

fn pump(rt: &mut Runtime, still_going: impl Fn() -> bool) {
    let deadline = Instant::now() + DEADLINE;
    while still_going() {
        assert!(Instant::now() < deadline, "test timed out");
        rt.wait(100);
    }
}

fn client_thread(port: u16) {
    let mut rt = Runtime::new(Config::default());
    let run = Rc::new(Cell::new(true));
    let connected = Rc::new(Cell::new(false));
    let got: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));

    let remote = Endpoint::new("127.0.0.1", port).unwrap();
    let ops = {
        let run = Rc::clone(&run);
        let connected = Rc::clone(&connected);
        let got = Rc::clone(&got);
        BindOps::new(move |rt, bind, notify| match notify {
            Notify::Connected => connected.set(true),
            Notify::RecvData => {
                // Connected always precedes data delivery.
                assert!(connected.get());
                let mut out = Vec::new();
                if rt.recv(bind, &mut out, 4, HELLO.len()) == HELLO.len() {
                    for bv in &out {
                        got.borrow_mut().extend_from_slice(rt.bvec(bv));
                    }
                    for bv in out.drain(..) {
                        rt.release(bv);
                    }
                }
            }
            Notify::Disconnected { status } => {
                assert_eq!(*status, 0);
                run.set(false);
            }
            _ => {}
        })
    };
    let bind = rt.connect(ProtocolId::StreamSocketTcp, None, &remote, ops);

    // Queue the payload before the connection resolves, like any pipelined
    // client would; the write handler sends it once the socket is up.
    let bvecs = rt.alloc(HELLO.len(), 0, 1);
    rt.bvec_mut(&bvecs[0]).copy_from_slice(HELLO);
    rt.sendv(bind, &bvecs, HELLO.len());

    pump(&mut rt, || run.get());
    assert!(connected.get());
    assert_eq!(got.borrow().as_slice(), HELLO);
}

#[test]
fn tcp_echo() {
    let mut rt = Runtime::new(Config::default());
    let run = Rc::new(Cell::new(true));

    let local = Endpoint::new("127.0.0.1", 0).unwrap();
    let listener = {
        let run = Rc::clone(&run);
        rt.listen(ProtocolId::StreamSocketTcp, &local, move |_rt, _bind, _peer| {
            let run = Rc::clone(&run);
            let connected = Cell::new(false);
            BindOps::new(move |rt, bind, notify| match notify {
                Notify::Connected => connected.set(true),
                Notify::RecvData => {
                    assert!(connected.get());
                    let mut out = Vec::new();
                    if rt.recv(bind, &mut out, 4, HELLO.len()) == HELLO.len() {
                        let mut echoed = Vec::new();
                        for bv in &out {
                            echoed.extend_from_slice(rt.bvec(bv));
                        }
                        for bv in out.drain(..) {
                            rt.release(bv);
                        }
                        assert_eq!(echoed.as_slice(), HELLO);
                        rt.send(bind, &echoed);
                        rt.finish(bind);
                    }
                }
                Notify::Disconnected { status } => {
                    assert_eq!(*status, 0);
                    run.set(false);
                }
                _ => {}
            })
        })
    };

    let port = rt.local_endpoint(listener).unwrap().port();
    let client = thread::spawn(move || client_thread(port));

    pump(&mut rt, || run.get());
    client.join().unwrap();
}
