use std::cell::{Cell, RefCell};
use std::io::Write;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use iomux::{BindOps, Config, Endpoint, Notify, ProtocolId, Runtime, Segment};

/// Payload lengths of five length-prefixed frames delivered back to back.
const FRAME_LENGTHS: [usize; 5] = [1, 37, 1024, 1, 65500];
const HEADER: usize = 4;
const DEADLINE: Duration = Duration::from_secs(10);

#[test]
fn segmentation_under_coalescing() {
    let mut rt = Runtime::new(Config::default());
    let done = Rc::new(Cell::new(false));
    let seen: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));

    let local = Endpoint::new("127.0.0.1", 0).unwrap();
    let listener = {
        let done = Rc::clone(&done);
        let seen = Rc::clone(&seen);
        rt.listen(ProtocolId::StreamSocketTcp, &local, move |_rt, _bind, _peer| {
            let done = Rc::clone(&done);
            let seen = Rc::clone(&seen);
            BindOps::new(move |rt, bind, notify| match notify {
                Notify::RecvMsg { iovecs, length, .. } => {
                    let mut frame = Vec::with_capacity(*length);
                    for bv in *iovecs {
                        frame.extend_from_slice(rt.bvec(bv));
                    }
                    assert_eq!(frame.len(), *length);

                    let payload = &frame[HEADER..];
                    let marker = seen.borrow().len() as u8;
                    assert!(payload.iter().all(|b| *b == marker));
                    seen.borrow_mut().push(payload.len());

                    if seen.borrow().len() == FRAME_LENGTHS.len() {
                        // Every queued byte was consumed by the five frames.
                        assert_eq!(rt.recv_pending(bind), 0);
                    }
                }
                Notify::Disconnected { .. } => done.set(true),
                _ => {}
            })
            .with_segment(|rt, bind| {
                let mut header = [0_u8; HEADER];
                if rt.peek(bind, &mut header) < HEADER {
                    return Segment::Incomplete;
                }
                let len = u32::from_le_bytes(header) as usize;
                if len > 1 << 20 {
                    return Segment::Invalid;
                }
                Segment::Complete(HEADER + len)
            })
        })
    };
    let port = rt.local_endpoint(listener).unwrap().port();

    // A raw client hands the kernel all five frames in one write so they
    // arrive maximally concatenated.
    let writer = thread::spawn(move || {
        let mut wire = Vec::new();
        for (i, len) in FRAME_LENGTHS.iter().enumerate() {
            wire.extend_from_slice(&(*len as u32).to_le_bytes());
            wire.extend(std::iter::repeat(i as u8).take(*len));
        }
        let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(&wire).unwrap();
        // Dropping the stream closes it; the server sees EOF after the
        // final frame.
    });

    let deadline = Instant::now() + DEADLINE;
    while !done.get() {
        assert!(Instant::now() < deadline, "test timed out");
        rt.wait(100);
    }
    writer.join().unwrap();

    let expected: Vec<usize> = FRAME_LENGTHS.to_vec();
    assert_eq!(*seen.borrow(), expected);
}

/// A segment callback returning `Invalid` tears the bind down with a
/// non-zero status.
#[test]
fn invalid_segment_closes_with_status() {
    let mut rt = Runtime::new(Config::default());
    let status = Rc::new(Cell::new(0_i32));
    let done = Rc::new(Cell::new(false));

    let local = Endpoint::new("127.0.0.1", 0).unwrap();
    let listener = {
        let status = Rc::clone(&status);
        let done = Rc::clone(&done);
        rt.listen(ProtocolId::StreamSocketTcp, &local, move |_rt, _bind, _peer| {
            let status = Rc::clone(&status);
            let done = Rc::clone(&done);
            BindOps::new(move |_rt, _bind, notify| {
                if let Notify::Disconnected { status: s } = notify {
                    status.set(*s);
                    done.set(true);
                }
            })
            .with_segment(|_rt, _bind| Segment::Invalid)
        })
    };
    let port = rt.local_endpoint(listener).unwrap().port();

    let writer = thread::spawn(move || {
        let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(b"garbage").unwrap();
        // Hold the socket open; the server closes from its side.
        thread::sleep(Duration::from_millis(500));
    });

    let deadline = Instant::now() + DEADLINE;
    while !done.get() {
        assert!(Instant::now() < deadline, "test timed out");
        rt.wait(100);
    }
    assert_ne!(status.get(), 0);
    writer.join().unwrap();
}
